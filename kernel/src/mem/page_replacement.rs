use super::{frame_table::Frame, PhysFrame};
use alloc::collections::BTreeMap;
use core::ops::Bound::{Excluded, Unbounded};

/// Chooses which resident frame to evict when the pool runs dry.
pub trait PageReplacementPolicy: Default + Send {
    /// Pick a victim among `frames`, or `None` if there are none.
    ///
    /// May clear accessed bits as a side effect.
    fn select_victim(&mut self, frames: &BTreeMap<PhysFrame, Frame>) -> Option<PhysFrame>;
}

/// Second-chance clock over every resident frame in the system.
///
/// The hand is the number of the last frame it looked at rather than a
/// position in the map, so frames coming and going between scans never
/// invalidate it. The scan resumes at the next live frame after the hand.
#[derive(Debug, Default)]
pub struct Clock {
    hand: Option<PhysFrame>,
}

impl Clock {
    fn advance(&mut self, frames: &BTreeMap<PhysFrame, Frame>) -> Option<PhysFrame> {
        let next = self
            .hand
            .and_then(|hand| frames.range((Excluded(hand), Unbounded)).next())
            .or_else(|| frames.iter().next())
            .map(|(frame, _)| *frame)?;
        self.hand = Some(next);
        Some(next)
    }
}

impl PageReplacementPolicy for Clock {
    fn select_victim(&mut self, frames: &BTreeMap<PhysFrame, Frame>) -> Option<PhysFrame> {
        loop {
            let candidate = self.advance(frames)?;
            let frame = &frames[&candidate];
            if frame.is_referenced() {
                frame.clear_referenced();
                continue;
            }
            return Some(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::{AddressSpace, PageMap};
    use alloc::sync::{Arc, Weak};

    const BASE: usize = 0x1000_0000;

    fn frames_in(space: &Arc<PageMap>, count: u32) -> BTreeMap<PhysFrame, Frame> {
        (0..count)
            .map(|i| {
                let frame = PhysFrame::new(100 + i);
                let vpn = BASE + i as usize * 0x1000;
                space.install(vpn, frame, true);
                let owner: Arc<dyn AddressSpace> = space.clone();
                (frame, Frame::new(owner, vpn, Weak::new()))
            })
            .collect()
    }

    #[test]
    fn empty_table_has_no_victim() {
        assert_eq!(Clock::default().select_victim(&BTreeMap::new()), None);
    }

    #[test]
    fn referenced_frames_get_a_second_chance() {
        let space = Arc::new(PageMap::new(1));
        let frames = frames_in(&space, 3);
        space.translate(BASE, false);
        space.translate(BASE + 0x1000, false);

        let mut clock = Clock::default();
        assert_eq!(clock.select_victim(&frames), Some(PhysFrame::new(102)));
        // Passing over the first two cleared their bits.
        assert!(!space.is_accessed(BASE));
        assert!(!space.is_accessed(BASE + 0x1000));
        // The hand resumes after the last victim and wraps around.
        assert_eq!(clock.select_victim(&frames), Some(PhysFrame::new(100)));
    }

    #[test]
    fn all_referenced_wraps_to_start() {
        let space = Arc::new(PageMap::new(1));
        let frames = frames_in(&space, 3);
        for i in 0..3 {
            space.translate(BASE + i * 0x1000, false);
        }
        let mut clock = Clock::default();
        assert_eq!(clock.select_victim(&frames), Some(PhysFrame::new(100)));
    }

    #[test]
    fn hand_survives_removed_frames() {
        let space = Arc::new(PageMap::new(1));
        let mut frames = frames_in(&space, 4);
        let mut clock = Clock::default();
        assert_eq!(clock.select_victim(&frames), Some(PhysFrame::new(100)));
        assert_eq!(clock.select_victim(&frames), Some(PhysFrame::new(101)));

        frames.remove(&PhysFrame::new(101));
        frames.remove(&PhysFrame::new(102));
        assert_eq!(clock.select_victim(&frames), Some(PhysFrame::new(103)));
    }

    #[test]
    fn never_picks_a_frame_seen_referenced_on_that_step() {
        let space = Arc::new(PageMap::new(1));
        let frames = frames_in(&space, 8);
        let mut clock = Clock::default();
        for round in 0..32usize {
            // Touch a rotating subset before each scan.
            for i in 0..8 {
                if (i + round) % 3 != 0 {
                    space.translate(BASE + i * 0x1000, false);
                }
            }
            let before: alloc::vec::Vec<bool> =
                (0..8).map(|i| space.is_accessed(BASE + i * 0x1000)).collect();
            let victim = clock.select_victim(&frames).unwrap();
            let index = (victim.number() - 100) as usize;
            // Either it was clean, or the scan went all the way round and
            // cleared it first.
            assert!(!before[index] || before.iter().all(|&b| b));
            assert!(!space.is_accessed(BASE + index * 0x1000));
        }
    }
}
