/// A point-in-time description of one segment of a pool, as returned by
/// [`SegmentPool::inspect()`][crate::SegmentPool::inspect].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Segment {
    offset: usize,
    size: usize,
    allocated: bool,
}

impl Segment {
    #[must_use]
    pub(crate) fn new(offset: usize, size: usize, allocated: bool) -> Self {
        Self {
            offset,
            size,
            allocated,
        }
    }

    /// Byte offset of the segment from the start of the pool buffer.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the segment in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the segment is in use by an allocation (as opposed to being a gap).
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }
}
