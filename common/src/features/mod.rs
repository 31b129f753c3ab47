//! Feature controllers that may override the requested state.
//!
//! Every controller implements [`FeatureManager`]. During reconciliation the
//! configured controllers are asked, strictly in [`RECONCILIATION_ORDER`], to adjust
//! the candidate state. A field decided by an earlier controller is final.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use crate::{
    error::FeatureError,
    event::ThermostatEvent,
    preset::PresetCatalog,
    snapshot::ThermostatSnapshot,
    state::{Candidate, VThermState},
    timer::Deadline,
    types::{FeatureState, RequestSource, ThermostatKind},
};

pub mod auto_start_stop;
pub mod heating_failure;
pub mod lock;
pub mod motion;
pub mod power;
pub mod presence;
pub mod safety;
pub mod timed_preset;
pub mod window;

pub use auto_start_stop::AutoStartStopManager;
pub use heating_failure::HeatingFailureManager;
pub use lock::LockManager;
pub use motion::MotionManager;
pub use power::PowerManager;
pub use presence::PresenceManager;
pub use safety::SafetyManager;
pub use timed_preset::TimedPresetManager;
pub use window::WindowManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    Lock,
    Safety,
    Window,
    AutoStartStop,
    Power,
    Presence,
    Motion,
    TimedPreset,
    HeatingFailure,
}

impl FeatureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Safety => "safety",
            Self::Window => "window",
            Self::AutoStartStop => "auto_start_stop",
            Self::Power => "power",
            Self::Presence => "presence",
            Self::Motion => "motion",
            Self::TimedPreset => "timed_preset",
            Self::HeatingFailure => "heating_failure",
        }
    }
}

/// Most restrictive first. Heating-failure detection only observes and is not listed.
pub const RECONCILIATION_ORDER: [FeatureKind; 8] = [
    FeatureKind::Lock,
    FeatureKind::Safety,
    FeatureKind::Window,
    FeatureKind::AutoStartStop,
    FeatureKind::Power,
    FeatureKind::Presence,
    FeatureKind::Motion,
    FeatureKind::TimedPreset,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Refuse the pending request as a whole.
    Reject,
}

/// Latest sensor-derived inputs of one thermostat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurements {
    /// Smoothed indoor temperature.
    pub temperature: Option<f64>,
    pub raw_temperature: Option<f64>,
    pub temperature_at: Option<DateTime<Utc>>,
    pub outdoor: Option<f64>,
    pub outdoor_at: Option<DateTime<Utc>>,
    /// Whether an outdoor sensor is configured and therefore expected to report.
    pub outdoor_expected: bool,
    /// Indoor slope in °/hour.
    pub slope: Option<f64>,
}

impl Measurements {
    pub fn temperature_age_min(&self, now: DateTime<Utc>) -> Option<f64> {
        self.temperature_at.map(|at| minutes_between(at, now))
    }

    pub fn outdoor_age_min(&self, now: DateTime<Utc>) -> Option<f64> {
        if !self.outdoor_expected {
            return None;
        }
        self.outdoor_at.map(|at| minutes_between(at, now))
    }
}

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

/// Read-only view of a thermostat handed to every controller.
#[derive(Debug, Clone, Copy)]
pub struct FeatureContext<'a> {
    pub now: DateTime<Utc>,
    pub name: &'a str,
    pub kind: ThermostatKind,
    pub requested: &'a VThermState,
    pub current: &'a VThermState,
    pub request_source: Option<RequestSource>,
    pub measurements: &'a Measurements,
    pub catalog: &'a PresetCatalog,
    pub ac_mode: bool,
    pub on_percent: f64,
    pub calculated_on_percent: f64,
}

/// Fixed interface of a feature controller. Construction from validated
/// configuration plays the role of post-init.
pub trait FeatureManager {
    fn kind(&self) -> FeatureKind;

    /// Unconfigured controllers are skipped everywhere.
    fn is_configured(&self) -> bool;

    fn start_listening(&mut self, _now: DateTime<Utc>) {}

    /// Drops pending debounce timers. Persisted end times are kept and only
    /// evaluated again once the owner restarts.
    fn stop_listening(&mut self) {}

    /// Re-evaluates against live inputs and fires due timers. Returns true when
    /// the controller's state moved.
    fn refresh_state(
        &mut self,
        ctx: &FeatureContext<'_>,
        events: &mut Vec<ThermostatEvent>,
    ) -> bool;

    fn apply(
        &self,
        candidate: &mut Candidate,
        ctx: &FeatureContext<'_>,
    ) -> Result<Verdict, FeatureError>;

    fn restore_state(&mut self, _snapshot: &ThermostatSnapshot, _now: DateTime<Utc>) {}

    fn add_attributes(&self, attributes: &mut Map<String, Value>);

    /// Earliest armed timer, so the owner knows when a refresh is due.
    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Binary sensor whose changes are accepted only after holding for a delay.
///
/// The live value is re-read when the delay expires; a change that reverted in
/// the meantime is dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DebouncedSensor {
    live: Option<bool>,
    accepted: FeatureState,
    pending: Option<bool>,
    deadline: Deadline,
}

impl DebouncedSensor {
    pub(crate) fn start(&mut self) {
        if self.accepted == FeatureState::Unavailable {
            self.accepted = FeatureState::Unknown;
        }
    }

    pub(crate) fn stop(&mut self) {
        self.deadline.cancel();
        self.pending = None;
    }

    pub(crate) fn state(&self) -> FeatureState {
        self.accepted
    }

    pub(crate) fn live(&self) -> Option<bool> {
        self.live
    }

    pub(crate) fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline.at()
    }

    pub(crate) fn restore(&mut self, state: FeatureState) {
        self.accepted = state;
    }

    /// Records a new raw value. Returns true when it was accepted immediately.
    pub(crate) fn update(
        &mut self,
        value: bool,
        now: DateTime<Utc>,
        on_delay_sec: i64,
        off_delay_sec: i64,
    ) -> bool {
        self.live = Some(value);
        if self.accepted == FeatureState::from_bool(value) {
            self.deadline.cancel();
            self.pending = None;
            return false;
        }
        if self.pending == Some(value) && self.deadline.is_armed() {
            return false;
        }
        let delay = if value { on_delay_sec } else { off_delay_sec };
        if delay <= 0 {
            self.deadline.cancel();
            self.pending = None;
            self.accepted = FeatureState::from_bool(value);
            return true;
        }
        self.pending = Some(value);
        self.deadline.arm_in(now, Duration::seconds(delay));
        false
    }

    /// Fires a due delay. Returns true when the pending value was confirmed.
    pub(crate) fn fire(&mut self, now: DateTime<Utc>) -> bool {
        if !self.deadline.fire_if_due(now) {
            return false;
        }
        let pending = self.pending.take();
        match (pending, self.live) {
            (Some(pending), Some(live)) if pending == live => {
                let next = FeatureState::from_bool(live);
                let changed = next != self.accepted;
                self.accepted = next;
                changed
            }
            _ => false,
        }
    }
}
