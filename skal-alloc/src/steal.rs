//! Per-CPU Steal Order
//!
//! The ordered plan a CPU follows when its own memory runs dry: which buddy
//! allocators to try, and in what order. The first segment added is the
//! CPU's local range and always stays first; later additions subtract out
//! whatever earlier segments already cover. When a new range strictly
//! contains an existing segment, the upper remainder is added before the
//! lower one, which desynchronises the stealing order of CPUs that share a
//! stratum.

use core::fmt;

use arrayvec::ArrayVec;

/// Up to three strata, so five segments.
const MAX_SEGMENTS: usize = 5;

/// Steal from buddies `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub low: usize,
    pub high: usize,
}

/// Ordered, pairwise-disjoint index ranges into the buddy table.
#[derive(Debug, Clone, Default)]
pub struct StealOrder {
    segments: ArrayVec<Segment, MAX_SEGMENTS>,
}

impl StealOrder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            segments: ArrayVec::new(),
        }
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The range of buddies local to this CPU. By convention, the first
    /// range added.
    ///
    /// # Panics
    ///
    /// Panics if nothing has been added yet.
    #[must_use]
    pub fn local(&self) -> Segment {
        self.segments[0]
    }

    /// True if `index` falls in the local range.
    #[must_use]
    pub fn is_local(&self, index: usize) -> bool {
        let s = self.local();
        s.low <= index && index < s.high
    }

    /// Add `[low, high)`, subtracting out any ranges already present.
    pub fn add(&mut self, low: usize, high: usize) {
        let mut low = low;
        let mut high = high;
        // Segments appended by the recursive call below only cover the
        // upper remainder, which cannot overlap what is left of this range.
        let known = self.segments.len();
        for i in 0..known {
            let seg = self.segments[i];
            if low == seg.low && high == seg.high {
                return;
            } else if low < seg.low && high > seg.high {
                // Strictly contains an existing segment. Add the upper half
                // first, then keep cancelling the lower half.
                self.add(seg.high, high);
                high = seg.low;
            } else if low < seg.low && high > seg.low {
                // Straddles the low boundary.
                high = seg.low;
            } else if low < seg.high && high > seg.high {
                // Straddles the high boundary.
                low = seg.high;
            }
        }
        if low >= high {
            return;
        }
        // Try to merge with the last segment, unless it's the local one.
        if self.segments.len() > 1 {
            let last = self.segments.last_mut().expect("checked non-empty");
            if last.high == low {
                last.high = high;
                return;
            } else if high == last.low {
                last.low = low;
                return;
            }
        }
        self.segments.push(Segment { low, high });
    }

    /// Visit every buddy index of every segment, in steal order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.segments.iter().flat_map(|s| s.low..s.high)
    }
}

impl fmt::Display for StealOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            let (open, close) = if i == 0 { ("<", ">") } else { ("", "") };
            if seg.low == seg.high - 1 {
                write!(f, "{open}{}{close}", seg.low)?;
            } else {
                write!(f, "{open}{}..{}{close}", seg.low, seg.high - 1)?;
            }
        }
        Ok(())
    }
}
