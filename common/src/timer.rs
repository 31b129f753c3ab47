use chrono::{DateTime, Duration, Utc};

/// A cancellable point-in-time callback slot.
///
/// Replacing an armed deadline cancels the previous one; nothing fires twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline {
    at: Option<DateTime<Utc>>,
}

impl Deadline {
    pub fn arm_at(&mut self, at: DateTime<Utc>) {
        self.at = Some(at);
    }

    pub fn arm_in(&mut self, now: DateTime<Utc>, delay: Duration) {
        self.at = Some(now + delay);
    }

    pub fn cancel(&mut self) {
        self.at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    pub fn at(&self) -> Option<DateTime<Utc>> {
        self.at
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.at.map(|at| (at - now).max(Duration::zero()))
    }

    /// Disarms and returns true once `now` reached the deadline.
    pub fn fire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.at {
            Some(at) if now >= at => {
                self.at = None;
                true
            }
            _ => false,
        }
    }
}
