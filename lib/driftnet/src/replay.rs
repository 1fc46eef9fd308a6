/// Number of slots in the replay window. A packet more than this many
/// sequences behind the most recent accepted one is rejected outright.
pub const REPLAY_WINDOW_SIZE: u64 = 256;

const SLOT_EMPTY: u64 = u64::max_value();

/// Sliding-window replay protection over per-peer sequence numbers.
///
/// Each slot remembers the highest sequence accepted at that ring position.
/// A candidate is accepted iff it is within the window of the most recent
/// accepted sequence and strictly newer than whatever its slot holds.
/// Sequences are 64-bit and never reused within a connection, so wraparound
/// is not handled.
pub struct ReplayProtector {
    most_recent: u64,
    slots: [u64; REPLAY_WINDOW_SIZE as usize],
}

impl ReplayProtector {
    #[inline]
    pub fn new() -> ReplayProtector {
        ReplayProtector {
            most_recent: 0,
            slots: [SLOT_EMPTY; REPLAY_WINDOW_SIZE as usize],
        }
    }

    /// Resets the window to its initial state.
    #[inline]
    pub fn reset(&mut self) {
        self.most_recent = 0;
        self.slots = [SLOT_EMPTY; REPLAY_WINDOW_SIZE as usize];
    }

    /// Checks a candidate sequence, recording it on acceptance. Returns
    /// false for duplicates and for sequences older than the window.
    pub fn accept(&mut self, sequence: u64) -> bool {
        if sequence < self.most_recent && self.most_recent - sequence > REPLAY_WINDOW_SIZE {
            return false;
        }

        let slot = (sequence % REPLAY_WINDOW_SIZE) as usize;
        let stored = self.slots[slot];

        if stored != SLOT_EMPTY && stored >= sequence {
            return false;
        }

        self.slots[slot] = sequence;
        if sequence > self.most_recent {
            self.most_recent = sequence;
        }
        true
    }

    #[inline]
    pub fn most_recent(&self) -> u64 {
        self.most_recent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strictly_increasing_all_accepted() {
        let mut protector = ReplayProtector::new();
        for sequence in 0..1000u64 {
            assert!(protector.accept(sequence), "sequence {}", sequence);
        }
        assert_eq!(protector.most_recent(), 999);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut protector = ReplayProtector::new();
        for sequence in 0..300u64 {
            assert!(protector.accept(sequence));
        }
        for sequence in 100..300u64 {
            assert!(!protector.accept(sequence), "sequence {}", sequence);
        }
    }

    #[test]
    fn test_below_window_rejected() {
        let mut protector = ReplayProtector::new();
        assert!(protector.accept(1000));

        assert!(!protector.accept(1000 - REPLAY_WINDOW_SIZE - 1));
        // The window edge itself is still within reach
        assert!(protector.accept(1000 - REPLAY_WINDOW_SIZE));
    }

    #[test]
    fn test_out_of_order_within_window_each_once() {
        let mut protector = ReplayProtector::new();

        let sequences = [5u64, 3, 4, 1, 2, 0, 10, 7, 9, 8, 6];
        for &sequence in &sequences {
            assert!(protector.accept(sequence), "sequence {}", sequence);
        }
        for &sequence in &sequences {
            assert!(!protector.accept(sequence), "sequence {}", sequence);
        }
    }

    #[test]
    fn test_shuffled_with_duplicates_accepts_each_at_most_once() {
        use rand::seq::SliceRandom;

        let mut rng = rand::rng();

        for _ in 0..10 {
            // 0..999 once each, plus up to 100 duplicates sprinkled in
            let mut feed: Vec<u64> = (0..1000).collect();
            for _ in 0..100 {
                let dup = feed[rand::random_range(0..1000)];
                feed.push(dup);
            }
            feed.shuffle(&mut rng);

            let mut protector = ReplayProtector::new();
            let mut accepted = vec![false; 1000];
            let mut accepted_count = 0usize;

            for &sequence in &feed {
                if protector.accept(sequence) {
                    assert!(
                        !accepted[sequence as usize],
                        "sequence {} accepted twice",
                        sequence
                    );
                    accepted[sequence as usize] = true;
                    accepted_count += 1;
                }
            }

            // Worst case loses one window of stragglers behind the highest
            // accepted sequence
            assert!(
                accepted_count >= 744,
                "only {} of 1000 distinct sequences accepted",
                accepted_count
            );
        }
    }

    #[test]
    fn test_reset_clears_history() {
        let mut protector = ReplayProtector::new();
        assert!(protector.accept(42));
        assert!(!protector.accept(42));

        protector.reset();
        assert!(protector.accept(42));
    }
}
