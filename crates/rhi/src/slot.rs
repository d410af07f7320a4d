//! Frame slots and last-use tags.
//!
//! A frame slot is an index in `[0, frames_in_flight)`. Every multi-buffered
//! resource keeps one native copy per slot, and every slot owns one fence.
//! Slot `k`'s fence signaling means all work recorded while `k` was current
//! has retired.

pub use vkframe_core::MAX_FRAMES_IN_FLIGHT;

/// Which submitted work last touched a resource.
///
/// The tag decides when a retired native object may really be freed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SlotTag {
    /// Never used by submitted work; free immediately.
    #[default]
    Untracked,
    /// Last used by work recorded while this slot was current.
    Slot(usize),
    /// Used outside the swapchain frame cycle (offscreen frame or between
    /// frames); free only once every slot is idle.
    Any,
}

impl SlotTag {
    /// Merges a new use into the tag.
    ///
    /// Uses in two different contexts collapse to [`SlotTag::Any`], since the
    /// resource then has to outlive both.
    pub fn touch(self, used: SlotTag) -> SlotTag {
        match (self, used) {
            (SlotTag::Untracked, u) => u,
            (t, SlotTag::Untracked) => t,
            (SlotTag::Slot(a), SlotTag::Slot(b)) if a == b => self,
            // Only the most recent slot matters: work in slot `a` that was
            // submitted before slot `b` retires before `b` does.
            (SlotTag::Slot(_), SlotTag::Slot(b)) => SlotTag::Slot(b),
            _ => SlotTag::Any,
        }
    }

    /// The slot index, if this tag names one.
    #[inline]
    pub fn slot(self) -> Option<usize> {
        match self {
            SlotTag::Slot(index) => Some(index),
            _ => None,
        }
    }
}

/// Index of the slot following `slot` in round-robin order.
#[inline]
pub fn next_slot(slot: usize, frames_in_flight: usize) -> usize {
    (slot + 1) % frames_in_flight
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_from_untracked() {
        assert_eq!(SlotTag::Untracked.touch(SlotTag::Slot(1)), SlotTag::Slot(1));
        assert_eq!(SlotTag::Untracked.touch(SlotTag::Any), SlotTag::Any);
    }

    #[test]
    fn test_touch_keeps_latest_slot() {
        assert_eq!(SlotTag::Slot(0).touch(SlotTag::Slot(1)), SlotTag::Slot(1));
        assert_eq!(SlotTag::Slot(1).touch(SlotTag::Untracked), SlotTag::Slot(1));
    }

    #[test]
    fn test_touch_mixed_contexts_is_any() {
        assert_eq!(SlotTag::Slot(0).touch(SlotTag::Any), SlotTag::Any);
        assert_eq!(SlotTag::Any.touch(SlotTag::Slot(0)), SlotTag::Any);
    }

    #[test]
    fn test_next_slot_wraps() {
        assert_eq!(next_slot(0, 2), 1);
        assert_eq!(next_slot(1, 2), 0);
        assert_eq!(next_slot(2, 3), 0);
    }
}
