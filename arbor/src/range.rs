//! Strided index ranges, the shape language of tree construction.

use serde::{Deserialize, Serialize};

/// A strided half-open index interval: `imin, imin + istep, .. < imax`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub imin: i64,
    pub imax: i64,
    pub istep: i64,
}

impl Range {
    pub fn new(imin: i64, imax: i64, istep: i64) -> Range {
        assert!(imin <= imax, "inverted range {}..{}", imin, imax);
        assert!(istep > 0, "non-positive stride {}", istep);
        Range { imin, imax, istep }
    }

    /// The number of indices the range visits.
    pub fn size(&self) -> usize {
        ((self.imax - self.imin + self.istep - 1) / self.istep) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.imin >= self.imax
    }

    /// The indices themselves.
    pub fn iter(&self) -> impl Iterator<Item = i64> {
        let range = *self;
        (range.imin..range.imax).step_by(range.istep as usize)
    }
}

/// A local range nested inside the global range of the surrounding
/// iteration, so grid-structured code can tell where a piece sits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IotaRange {
    pub global: Range,
    pub local: Range,
}

impl IotaRange {
    /// A range that is its own surrounding domain.
    pub fn new(range: Range) -> IotaRange {
        IotaRange { global: range, local: range }
    }

    pub fn with_global(global: Range, local: Range) -> IotaRange {
        IotaRange { global, local }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_counts_strides() {
        assert_eq!(Range::new(0, 10, 1).size(), 10);
        assert_eq!(Range::new(0, 10, 3).size(), 4);
        assert_eq!(Range::new(5, 5, 1).size(), 0);
        assert!(Range::new(5, 5, 1).is_empty());
    }

    #[test]
    fn iter_visits_each_stride_once() {
        let visited: Vec<i64> = Range::new(0, 10, 3).iter().collect();
        assert_eq!(visited, vec![0, 3, 6, 9]);
    }

    #[test]
    #[should_panic(expected = "non-positive stride")]
    fn zero_stride_is_rejected() {
        Range::new(0, 10, 0);
    }
}
