//! Durable-byte tracking for a partially written file.
//!
//! The writer records which byte ranges of the backing file have been
//! submitted to the device as two coalescing intervals: a *head* anchored at
//! offset zero and a *tail* that grows toward (and is only trusted once it
//! reaches) the end of the file. Anything that lands between them is not
//! remembered and will be rewritten on resume, a deliberate constraint that
//! keeps [`State`] fixed-size, matching the head-then-tail and
//! tail-then-head download patterns of the upper layer.
//!
//! [`State`] is the only durable byproduct of the writer. The upper layer
//! persists it as opaque structured data (hence the serde derives) and hands
//! it back on resume.

use serde::{Deserialize, Serialize};

use crate::constants::PROGRESS_BAR_WIDTH;

/// A half-open interval `[start, end)` of file bytes that have been
/// submitted to the device.
///
/// # Invariants
///
/// - `start < end` (empty intervals are never constructed)
/// - `end <= State::total_size` for any part held by a [`State`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidPart {
    pub start: u64,
    pub end: u64,
}

impl ValidPart {
    /// # Panics
    ///
    /// Panics when `start >= end`.
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start < end, "valid part must be non-empty: [{start}, {end})");
        Self { start, end }
    }

    /// Length of the interval in bytes. Never zero.
    #[inline]
    pub fn len(&self) -> u64 {
        assert!(self.start < self.end);
        self.end - self.start
    }

    /// Returns `true` when the intervals touch or overlap, i.e. when their
    /// union is a single interval.
    #[inline]
    pub fn mergeable(&self, other: &ValidPart) -> bool {
        self.start.max(other.start) <= self.end.min(other.end)
    }

    /// Unions `other` into `self` when the two touch or overlap; disjoint
    /// intervals leave `self` unchanged (the gap between them would be
    /// claimed valid otherwise).
    ///
    /// Mergeable merges are commutative and associative.
    pub fn merge(&mut self, other: ValidPart) {
        if self.mergeable(&other) {
            self.start = self.start.min(other.start);
            self.end = self.end.max(other.end);
        }
    }
}

/// Persisted progress of a partial file.
///
/// `total_size` is authoritative from the on-disk file size and immutable
/// while a writer holds the state. `valid_head` always starts at byte zero;
/// `valid_tail` is only meaningful to resume logic once its end reaches
/// `total_size`. When head and tail meet they collapse into the same full
/// interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub total_size: u64,
    pub valid_head: Option<ValidPart>,
    pub valid_tail: Option<ValidPart>,
}

impl State {
    /// Fresh state with no valid bytes.
    ///
    /// # Panics
    ///
    /// Panics when `total_size == 0`.
    pub fn new(total_size: u64) -> Self {
        assert!(total_size > 0);
        Self {
            total_size,
            valid_head: None,
            valid_tail: None,
        }
    }

    /// Folds a newly submitted part into the head/tail intervals.
    ///
    /// Rules, applied in order:
    /// 1. merge into the head, or adopt the part as head when it starts at 0;
    /// 2. merge into the tail, or adopt the part as tail when it starts past
    ///    the head's end;
    /// 3. a head that reaches `total_size` is copied into the tail;
    /// 4. head and tail merge into each other, so overlapping or touching
    ///    intervals become the same interval.
    pub(crate) fn extend(&mut self, new_part: ValidPart) {
        assert!(new_part.end <= self.total_size);

        if let Some(head) = &mut self.valid_head {
            head.merge(new_part);
        } else if new_part.start == 0 {
            self.valid_head = Some(new_part);
        }
        let head_end = self.valid_head.map_or(0, |head| head.end);

        if let Some(tail) = &mut self.valid_tail {
            tail.merge(new_part);
        } else if new_part.start > head_end {
            self.valid_tail = Some(new_part);
        }

        if let Some(head) = self.valid_head {
            if head.end == self.total_size {
                self.valid_tail = Some(head);
            }
        }

        if let (Some(mut head), Some(mut tail)) = (self.valid_head, self.valid_tail) {
            head.merge(tail);
            tail.merge(head);
            self.valid_head = Some(head);
            self.valid_tail = Some(tail);
        }

        self.assert_invariants();
    }

    /// Validates structural invariants. Called after every extension.
    pub(crate) fn assert_invariants(&self) {
        assert!(self.total_size > 0);
        if let Some(head) = self.valid_head {
            assert!(head.start == 0);
            assert!(head.start < head.end);
            assert!(head.end <= self.total_size);
        }
        if let Some(tail) = self.valid_tail {
            assert!(tail.start < tail.end);
            assert!(tail.end <= self.total_size);
        }
        if let (Some(head), Some(tail)) = (self.valid_head, self.valid_tail) {
            // After the mutual merge, head and tail are either strictly
            // disjoint or the same interval.
            assert!(head.end <= tail.start || head == tail);
        }
    }

    /// `true` when the first `bytes` bytes of the file are valid.
    pub fn has_valid_head(&self, bytes: u64) -> bool {
        assert!(bytes <= self.total_size);
        self.valid_head
            .is_some_and(|head| head.start == 0 && head.end >= bytes)
    }

    /// `true` when the last `bytes` bytes of the file are valid.
    pub fn has_valid_tail(&self, bytes: u64) -> bool {
        assert!(bytes <= self.total_size);
        self.valid_tail.is_some_and(|tail| {
            tail.end == self.total_size && tail.start <= self.total_size - bytes
        })
    }

    /// Valid percentage of the file, in `0..=100`.
    ///
    /// Computed after the collapse step: when head and tail are the same
    /// interval it is counted once, so overlap can never be double-counted.
    pub fn percent_valid(&self) -> u8 {
        let head_len = self.valid_head.map_or(0, |head| head.len());
        let tail_len = match (self.valid_head, self.valid_tail) {
            (Some(head), Some(tail)) if head == tail => 0,
            (_, Some(tail)) => tail.len(),
            (_, None) => 0,
        };
        let percent = (head_len + tail_len) * 100 / self.total_size;
        percent.min(100) as u8
    }

    /// Renders the fixed-width progress bar: `#` filled from both ends, `-`
    /// in the unwritten gap. Each end rounds up, so any progress at all is
    /// visible.
    pub fn progress_bar(&self) -> String {
        let width = PROGRESS_BAR_WIDTH as u64;
        let head_end = self.valid_head.map_or(0, |head| head.end);
        let tail_start = self.valid_tail.map_or(self.total_size, |tail| tail.start);

        let head_cells =
            ((head_end * width).div_ceil(self.total_size) as usize).min(PROGRESS_BAR_WIDTH);
        let tail_cells = (((self.total_size - tail_start) * width).div_ceil(self.total_size)
            as usize)
            .min(PROGRESS_BAR_WIDTH);

        let mut bar = [b'-'; PROGRESS_BAR_WIDTH];
        bar[..head_cells].fill(b'#');
        bar[PROGRESS_BAR_WIDTH - tail_cells..].fill(b'#');

        core::str::from_utf8(&bar).expect("bar is ascii").to_string()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn part_strategy(total: u64) -> impl Strategy<Value = ValidPart> {
        (0..total).prop_flat_map(move |start| {
            (start + 1..=total).prop_map(move |end| ValidPart::new(start, end))
        })
    }

    proptest! {
        #[test]
        fn prop_merge_commutative(
            a in part_strategy(1 << 20),
            b in part_strategy(1 << 20),
        ) {
            prop_assume!(a.mergeable(&b));
            let mut ab = a;
            ab.merge(b);
            let mut ba = b;
            ba.merge(a);
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn prop_merge_associative(
            a in part_strategy(1 << 20),
            b in part_strategy(1 << 20),
            c in part_strategy(1 << 20),
        ) {
            prop_assume!(a.mergeable(&b) && b.mergeable(&c));
            // Union of the three is a single interval in either order.
            let mut left = a;
            left.merge(b);
            prop_assume!(left.mergeable(&c));
            left.merge(c);

            let mut right = b;
            right.merge(c);
            let mut right_outer = a;
            prop_assume!(right_outer.mergeable(&right));
            right_outer.merge(right);

            prop_assert_eq!(left, right_outer);
        }

        #[test]
        fn prop_extend_preserves_invariants(
            parts in prop::collection::vec(part_strategy(1 << 16), 1..64),
        ) {
            let mut state = State::new(1 << 16);
            for part in parts {
                state.extend(part);
                state.assert_invariants();
                prop_assert!(state.percent_valid() <= 100);
            }
        }

        #[test]
        fn prop_sector_sweep_reaches_full(total_sectors in 1u64..64) {
            let total = total_sectors * 512;
            let mut state = State::new(total);
            for sector in 0..total_sectors {
                state.extend(ValidPart::new(sector * 512, (sector + 1) * 512));
            }
            prop_assert_eq!(state.valid_head, Some(ValidPart::new(0, total)));
            prop_assert_eq!(state.valid_tail, Some(ValidPart::new(0, total)));
            prop_assert_eq!(state.percent_valid(), 100);
        }
    }
}
