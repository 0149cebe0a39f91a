//! Per-stream state
//! The flow record keeps the current status, the newest accepted message
//! timestamp, the last published info object, and a flap detector over a
//! fixed-count window of status changes.

use serde_json::{Map, Value};

use crate::message::{Status, StatusInfo};

/// Widest supported flap window; one bit per observed message.
pub const MAX_FLAP_WINDOW: u32 = 64;

/// Circular bit window counting status changes.
///
/// Each accepted message contributes one bit: 1 when its computed status
/// differs from the previous one. The running one-count is maintained in
/// O(1); the stream is flapping when the fraction of ones exceeds the
/// threshold.
#[derive(Debug, Clone)]
pub struct FlapDetector {
    window: u32,
    threshold: f64,
    bits: u64,
    pos: u32,
    ones: u32,
}

impl FlapDetector {
    pub fn new(window: u32, threshold: f64) -> FlapDetector {
        debug_assert!(window >= 1 && window <= MAX_FLAP_WINDOW);
        FlapDetector {
            window,
            threshold,
            bits: 0,
            pos: 0,
            ones: 0,
        }
    }

    /// Pop the oldest bit, push the new one.
    pub fn update(&mut self, changed: bool) {
        let mask = 1u64 << self.pos;
        if self.bits & mask != 0 {
            self.ones -= 1;
        }
        if changed {
            self.bits |= mask;
            self.ones += 1;
        } else {
            self.bits &= !mask;
        }
        self.pos = (self.pos + 1) % self.window;
    }

    pub fn is_flapping(&self) -> bool {
        f64::from(self.ones) / f64::from(self.window) > self.threshold
    }

    pub fn changes(&self) -> u32 {
        self.ones
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn reset(&mut self) {
        self.bits = 0;
        self.pos = 0;
        self.ones = 0;
    }

    #[cfg(test)]
    fn popcount(&self) -> u32 {
        self.bits.count_ones()
    }
}

/// What was effectively in force before an update, flapping included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorState {
    /// The message is older than the newest accepted one; nothing changed.
    Discard,
    /// The flow had never seen a message.
    None,
    Status(Status),
    Flapping,
}

/// One tracked stream.
#[derive(Debug, Clone)]
pub struct Flow {
    pub aspect: String,
    /// Location as received, republished verbatim in notifications.
    pub location: Map<String, Value>,
    pub status: Option<Status>,
    /// Timestamp of the newest accepted message.
    pub status_time: i64,
    /// Info object of the last *published* notification; becomes the
    /// `previous` field of the next one.
    pub status_info: Option<StatusInfo>,
    /// Info computed from the most recent message, published or not.
    pub last_info: Option<StatusInfo>,
    /// Timestamp of the last notification, 0 if never.
    pub notified: i64,
    pub flap: FlapDetector,
}

impl Flow {
    pub fn new(aspect: &str, location: &Map<String, Value>, window: u32, threshold: f64) -> Flow {
        Flow {
            aspect: aspect.to_string(),
            location: location.clone(),
            status: None,
            status_time: 0,
            status_info: None,
            last_info: None,
            notified: 0,
            flap: FlapDetector::new(window, threshold),
        }
    }

    /// Fold a message's status into the flow.
    ///
    /// Returns the status that was effectively in force before the
    /// update, honoring flapping. Out-of-order input returns
    /// [`PriorState::Discard`] and mutates nothing.
    pub fn update(&mut self, status: Status, timestamp: i64) -> PriorState {
        if self.status.is_some() && timestamp < self.status_time {
            return PriorState::Discard;
        }
        if status == Status::Missing && self.status == Some(Status::Missing) {
            // a repeated missing verdict must not read as a status change
            self.flap.reset();
        }

        let prior = if self.flap.is_flapping() {
            PriorState::Flapping
        } else {
            match self.status {
                None => PriorState::None,
                Some(status) => PriorState::Status(status),
            }
        };

        // the first message ever has nothing to differ from
        let changed = self.status.is_some_and(|previous| previous != status);
        self.flap.update(changed);
        self.status = Some(status);
        self.status_time = timestamp;
        prior
    }

    /// Stamp the notification time.
    pub fn notification_sent(&mut self, timestamp: i64) {
        self.notified = timestamp;
    }

    /// Zero the notification time, forcing the next non-ok message to
    /// notify again.
    pub fn reset_notified(&mut self) {
        self.notified = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> Flow {
        Flow::new("cpu", &Map::new(), 4, 0.5)
    }

    #[test]
    fn count_matches_popcount_through_random_updates() {
        let mut detector = FlapDetector::new(7, 0.5);
        let pattern = [
            true, false, true, true, false, false, true, true, true, false, true, false, false,
            true, true, false,
        ];
        for &bit in &pattern {
            detector.update(bit);
            assert_eq!(detector.changes(), detector.popcount());
        }
        detector.reset();
        assert_eq!(detector.changes(), 0);
        assert!(!detector.is_flapping());
    }

    #[test]
    fn flapping_needs_strictly_more_than_threshold() {
        let mut detector = FlapDetector::new(4, 0.5);
        detector.update(true);
        detector.update(true);
        assert!(!detector.is_flapping(), "2/4 is not above 0.5");
        detector.update(true);
        assert!(detector.is_flapping(), "3/4 is above 0.5");
    }

    #[test]
    fn old_bits_fall_out_of_the_window() {
        let mut detector = FlapDetector::new(3, 0.5);
        detector.update(true);
        detector.update(true);
        detector.update(true);
        assert_eq!(detector.changes(), 3);
        detector.update(false);
        detector.update(false);
        detector.update(false);
        assert_eq!(detector.changes(), 0);
    }

    #[test]
    fn update_returns_prior_state() {
        let mut flow = flow();
        assert_eq!(flow.update(Status::Error, 10), PriorState::None);
        assert_eq!(
            flow.update(Status::Ok, 20),
            PriorState::Status(Status::Error)
        );
        assert_eq!(flow.update(Status::Ok, 30), PriorState::Status(Status::Ok));
        assert_eq!(flow.status, Some(Status::Ok));
        assert_eq!(flow.status_time, 30);
    }

    #[test]
    fn out_of_order_is_discarded_without_mutation() {
        let mut flow = flow();
        flow.update(Status::Error, 100);
        let changes_before = flow.flap.changes();
        assert_eq!(flow.update(Status::Ok, 90), PriorState::Discard);
        assert_eq!(flow.status, Some(Status::Error));
        assert_eq!(flow.status_time, 100);
        assert_eq!(flow.flap.changes(), changes_before);
    }

    #[test]
    fn alternation_reports_flapping_as_prior_state() {
        let mut flow = flow();
        flow.update(Status::Error, 1); // first: no change bit
        flow.update(Status::Ok, 2);
        flow.update(Status::Error, 3);
        flow.update(Status::Ok, 4); // three changes in a window of four
        assert!(flow.flap.is_flapping());
        assert_eq!(flow.flap.changes(), 3);
        assert_eq!(flow.update(Status::Error, 5), PriorState::Flapping);
    }

    #[test]
    fn repeated_missing_resets_the_detector() {
        let mut flow = flow();
        flow.update(Status::Error, 1);
        flow.update(Status::Ok, 2);
        flow.update(Status::Missing, 3);
        assert!(flow.flap.changes() > 0);
        flow.update(Status::Missing, 4);
        // the reset happened before the new (unchanged) bit was pushed
        assert_eq!(flow.flap.changes(), 0);
    }
}
