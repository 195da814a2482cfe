use std::fmt;

/// Placement strategy used by a pool to pick the gap that satisfies an allocation.
///
/// The policy is fixed when the pool is opened.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use segment_pool::{AllocPolicy, SegmentPool};
///
/// let pool = SegmentPool::builder()
///     .capacity(nz!(500))
///     .policy(AllocPolicy::BestFit)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.policy(), AllocPolicy::BestFit);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum AllocPolicy {
    /// Walk the segments in address order and take the first gap that is large enough.
    /// This is the default.
    #[default]
    FirstFit,

    /// Take the smallest gap that is large enough, preferring the lowest address among
    /// gaps of equal size.
    BestFit,
}

impl fmt::Display for AllocPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstFit => f.write_str("first-fit"),
            Self::BestFit => f.write_str("best-fit"),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn default_is_first_fit() {
        assert_eq!(AllocPolicy::default(), AllocPolicy::FirstFit);
    }

    #[test]
    fn display_names() {
        assert_eq!(AllocPolicy::FirstFit.to_string(), "first-fit");
        assert_eq!(AllocPolicy::BestFit.to_string(), "best-fit");
    }
}
