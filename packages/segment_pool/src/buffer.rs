use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::num::NonZero;
use std::ptr::NonNull;
use std::slice;

use crate::{Error, Result};

/// One contiguous, fixed-size byte buffer obtained from the global allocator.
///
/// The buffer is zero-initialized on creation and returned to the global allocator on drop.
/// It never grows or moves.
#[derive(Debug)]
pub(crate) struct BackingBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl BackingBuffer {
    /// Allocates a zeroed buffer of `size` bytes.
    pub(crate) fn new(size: NonZero<usize>) -> Result<Self> {
        let layout =
            Layout::array::<u8>(size.get()).map_err(|_layout_error| Error::OutOfMemory {
                what: "pool buffer",
            })?;

        // SAFETY: The layout has a non-zero size because `size` is non-zero.
        let ptr = unsafe { alloc_zeroed(layout) };

        let ptr = NonNull::new(ptr).ok_or(Error::OutOfMemory {
            what: "pool buffer",
        })?;

        Ok(Self { ptr, layout })
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    /// The bytes in `offset..offset + len`.
    ///
    /// # Panics
    ///
    /// Panics if the range does not lie within the buffer.
    #[must_use]
    pub(crate) fn slice(&self, offset: usize, len: usize) -> &[u8] {
        self.assert_in_bounds(offset, len);

        // SAFETY: The range was bounds-checked above, the memory was initialized by
        // alloc_zeroed and we hand out a shared borrow tied to &self.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    /// The bytes in `offset..offset + len`, mutably.
    ///
    /// # Panics
    ///
    /// Panics if the range does not lie within the buffer.
    #[must_use]
    pub(crate) fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        self.assert_in_bounds(offset, len);

        // SAFETY: The range was bounds-checked above, the memory was initialized by
        // alloc_zeroed and we hand out an exclusive borrow tied to &mut self.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len) }
    }

    fn assert_in_bounds(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len);

        assert!(
            end.is_some_and(|end| end <= self.layout.size()),
            "range {offset}+{len} is out of bounds of a buffer of {} bytes",
            self.layout.size()
        );
    }
}

impl Drop for BackingBuffer {
    fn drop(&mut self) {
        // SAFETY: We allocated this memory in new() with the same layout and nothing else
        // deallocates it.
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

// SAFETY: BackingBuffer exclusively owns its allocation and only hands out borrows tied to
// &self / &mut self, so moving it to another thread cannot create shared mutable access.
unsafe impl Send for BackingBuffer {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(BackingBuffer: Send);
    assert_not_impl_any!(BackingBuffer: Sync);

    #[test]
    fn starts_zeroed() {
        let buffer = BackingBuffer::new(nz!(64)).unwrap();

        assert_eq!(buffer.len(), 64);
        assert!(buffer.slice(0, 64).iter().all(|byte| *byte == 0));
    }

    #[test]
    fn writes_are_visible_through_reads() {
        let mut buffer = BackingBuffer::new(nz!(16)).unwrap();

        buffer.slice_mut(4, 4).copy_from_slice(&[1, 2, 3, 4]);

        assert_eq!(buffer.slice(0, 8), &[0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_slice_at_end_is_allowed() {
        let buffer = BackingBuffer::new(nz!(8)).unwrap();

        assert!(buffer.slice(8, 0).is_empty());
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_slice_panics() {
        let buffer = BackingBuffer::new(nz!(8)).unwrap();

        _ = buffer.slice(4, 5);
    }

    #[test]
    #[should_panic]
    fn overflowing_range_panics() {
        let buffer = BackingBuffer::new(nz!(8)).unwrap();

        _ = buffer.slice(usize::MAX, 2);
    }

    #[test]
    fn absurd_size_is_out_of_memory() {
        let result = BackingBuffer::new(NonZero::new(usize::MAX).unwrap());

        assert_eq!(
            result.unwrap_err(),
            Error::OutOfMemory {
                what: "pool buffer"
            }
        );
    }
}
