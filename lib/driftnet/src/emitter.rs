use std::time::{Duration, Instant};

/// What an emitter wants done after a poll.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Tick {
    /// Nothing due.
    Idle,
    /// Fire the periodic action.
    Trigger,
    /// Fire the periodic action one last time; the send-count limit is
    /// reached and the emitter has stopped.
    FinalTrigger,
    /// The hard deadline passed; the emitter has stopped without firing.
    Timeout,
}

/// A periodic retransmission driver: fires at a fixed frequency, optionally
/// stops after a send-count limit, optionally aborts at a hard deadline.
/// Expressed as a state machine the socket polls from `update` rather than
/// as timer callbacks, so triggers are naturally serialized with state
/// transitions.
pub struct Emitter {
    interval: Duration,
    limit: Option<u32>,
    deadline: Option<Instant>,
    next_fire: Instant,
    count: u32,
    running: bool,
}

impl Emitter {
    pub fn new(frequency_hz: u64) -> Emitter {
        assert!(frequency_hz > 0, "Emitter frequency must be positive");
        Emitter {
            interval: Duration::from_nanos(1_000_000_000 / frequency_hz),
            limit: None,
            deadline: None,
            next_fire: Instant::now(),
            count: 0,
            running: false,
        }
    }

    /// Stop after `limit` triggers.
    pub fn with_limit(mut self, limit: u32) -> Emitter {
        self.limit = Some(limit);
        self
    }

    /// Starts the emitter. The first trigger fires on the next poll.
    pub fn start(&mut self, now: Instant) {
        self.start_with_deadline(now, None);
    }

    /// Starts with an optional hard deadline measured from now.
    pub fn start_with_deadline(&mut self, now: Instant, deadline: Option<Duration>) {
        self.next_fire = now;
        self.count = 0;
        self.deadline = deadline.map(|d| now + d);
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Advances the state machine. At most one tick is reported per call;
    /// the socket polls once per `update` pass.
    pub fn poll(&mut self, now: Instant) -> Tick {
        if !self.running {
            return Tick::Idle;
        }

        if let Some(deadline) = self.deadline {
            if now >= deadline {
                self.running = false;
                return Tick::Timeout;
            }
        }

        if now < self.next_fire {
            return Tick::Idle;
        }

        self.next_fire += self.interval;
        if self.next_fire <= now {
            // Stalled past a full period; re-anchor instead of bursting
            self.next_fire = now + self.interval;
        }

        self.count += 1;
        if let Some(limit) = self.limit {
            if self.count >= limit {
                self.running = false;
                return Tick::FinalTrigger;
            }
        }

        Tick::Trigger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_trigger_is_immediate() {
        let now = Instant::now();
        let mut emitter = Emitter::new(10);
        emitter.start(now);

        assert_eq!(emitter.poll(now), Tick::Trigger);
        assert_eq!(emitter.poll(now), Tick::Idle);
    }

    #[test]
    fn test_cadence() {
        let now = Instant::now();
        let mut emitter = Emitter::new(10);
        emitter.start(now);

        assert_eq!(emitter.poll(now), Tick::Trigger);
        assert_eq!(emitter.poll(now + Duration::from_millis(50)), Tick::Idle);
        assert_eq!(emitter.poll(now + Duration::from_millis(101)), Tick::Trigger);
        assert_eq!(emitter.poll(now + Duration::from_millis(150)), Tick::Idle);
        assert_eq!(emitter.poll(now + Duration::from_millis(201)), Tick::Trigger);
    }

    #[test]
    fn test_limit_stops_after_final_trigger() {
        let now = Instant::now();
        let mut emitter = Emitter::new(10).with_limit(3);
        emitter.start(now);

        assert_eq!(emitter.poll(now), Tick::Trigger);
        assert_eq!(emitter.poll(now + Duration::from_millis(101)), Tick::Trigger);
        assert_eq!(
            emitter.poll(now + Duration::from_millis(201)),
            Tick::FinalTrigger
        );
        assert!(!emitter.is_running());
        assert_eq!(emitter.poll(now + Duration::from_millis(301)), Tick::Idle);
    }

    #[test]
    fn test_deadline_fires_timeout() {
        let now = Instant::now();
        let mut emitter = Emitter::new(10);
        emitter.start_with_deadline(now, Some(Duration::from_millis(250)));

        assert_eq!(emitter.poll(now), Tick::Trigger);
        assert_eq!(emitter.poll(now + Duration::from_millis(101)), Tick::Trigger);
        assert_eq!(emitter.poll(now + Duration::from_millis(250)), Tick::Timeout);
        assert!(!emitter.is_running());
    }

    #[test]
    fn test_stop_silences() {
        let now = Instant::now();
        let mut emitter = Emitter::new(10);
        emitter.start(now);
        emitter.stop();

        assert_eq!(emitter.poll(now + Duration::from_secs(1)), Tick::Idle);
    }

    #[test]
    fn test_restart_resets_counter() {
        let now = Instant::now();
        let mut emitter = Emitter::new(10).with_limit(1);
        emitter.start(now);
        assert_eq!(emitter.poll(now), Tick::FinalTrigger);

        emitter.start(now + Duration::from_secs(1));
        assert_eq!(emitter.poll(now + Duration::from_secs(1)), Tick::FinalTrigger);
    }
}
