//! Requested vs. current state and the reconciliation pass that merges feature
//! overrides into the state actually acted upon.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    features::{FeatureContext, FeatureKind, FeatureManager, Verdict, RECONCILIATION_ORDER},
    preset::{find_preset_temp, Preset, PresetCatalog},
    types::{HvacMode, HvacOffReason, RequestSource},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VThermState {
    hvac_mode: HvacMode,
    target_temperature: Option<f64>,
    preset: Preset,
    #[serde(default)]
    hvac_off_reason: Option<HvacOffReason>,
    #[serde(skip)]
    hvac_mode_changed: bool,
    #[serde(skip)]
    target_temperature_changed: bool,
    #[serde(skip)]
    preset_changed: bool,
}

impl VThermState {
    pub fn new(hvac_mode: HvacMode, target_temperature: Option<f64>, preset: Preset) -> Self {
        Self {
            hvac_mode,
            target_temperature,
            preset,
            hvac_off_reason: (hvac_mode == HvacMode::Off).then_some(HvacOffReason::Manual),
            hvac_mode_changed: false,
            target_temperature_changed: false,
            preset_changed: false,
        }
    }

    pub fn hvac_mode(&self) -> HvacMode {
        self.hvac_mode
    }

    pub fn target_temperature(&self) -> Option<f64> {
        self.target_temperature
    }

    pub fn preset(&self) -> Preset {
        self.preset
    }

    pub fn hvac_off_reason(&self) -> Option<HvacOffReason> {
        self.hvac_off_reason
    }

    pub fn set_hvac_mode(&mut self, mode: HvacMode, off_reason: Option<HvacOffReason>) {
        if self.hvac_mode != mode {
            self.hvac_mode = mode;
            self.hvac_mode_changed = true;
        }
        self.hvac_off_reason = if mode == HvacMode::Off {
            off_reason.or(Some(HvacOffReason::Manual))
        } else {
            None
        };
    }

    pub fn set_target_temperature(&mut self, target: Option<f64>) {
        if self.target_temperature != target {
            self.target_temperature = target;
            self.target_temperature_changed = true;
        }
    }

    pub fn set_preset(&mut self, preset: Preset) {
        if self.preset != preset {
            self.preset = preset;
            self.preset_changed = true;
        }
    }

    pub fn is_hvac_mode_changed(&self) -> bool {
        self.hvac_mode_changed
    }

    pub fn is_target_temperature_changed(&self) -> bool {
        self.target_temperature_changed
    }

    pub fn is_preset_changed(&self) -> bool {
        self.preset_changed
    }

    pub fn is_changed(&self) -> bool {
        self.hvac_mode_changed || self.target_temperature_changed || self.preset_changed
    }

    pub fn reset_changes(&mut self) {
        self.hvac_mode_changed = false;
        self.target_temperature_changed = false;
        self.preset_changed = false;
    }

    fn same_values(&self, other: &Self) -> bool {
        self.hvac_mode == other.hvac_mode
            && self.target_temperature == other.target_temperature
            && self.preset == other.preset
            && self.hvac_off_reason == other.hvac_off_reason
    }
}

/// Which feature decided a field. A decided field is final for the rest of the pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pins {
    pub hvac_mode: Option<FeatureKind>,
    pub target_temperature: Option<FeatureKind>,
    pub preset: Option<FeatureKind>,
}

/// The next current state under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    state: VThermState,
    pins: Pins,
    present: bool,
    activity_preset: Option<Preset>,
}

impl Candidate {
    pub fn from_requested(requested: &VThermState) -> Self {
        let mut state = requested.clone();
        state.reset_changes();
        Self {
            state,
            pins: Pins::default(),
            present: true,
            activity_preset: None,
        }
    }

    pub fn state(&self) -> &VThermState {
        &self.state
    }

    pub fn pins(&self) -> Pins {
        self.pins
    }

    pub fn hvac_mode(&self) -> HvacMode {
        self.state.hvac_mode
    }

    pub fn preset(&self) -> Preset {
        self.state.preset
    }

    /// Returns false when a higher priority feature already decided the mode.
    pub fn force_hvac_mode(
        &mut self,
        by: FeatureKind,
        mode: HvacMode,
        off_reason: Option<HvacOffReason>,
    ) -> bool {
        if self.pins.hvac_mode.is_some() {
            return false;
        }
        self.state.set_hvac_mode(mode, off_reason);
        self.pins.hvac_mode = Some(by);
        true
    }

    /// Pins the mode to its present value so lower features cannot change it.
    pub fn hold_hvac_mode(&mut self, by: FeatureKind) -> bool {
        if self.pins.hvac_mode.is_some() {
            return false;
        }
        self.pins.hvac_mode = Some(by);
        true
    }

    pub fn force_preset(&mut self, by: FeatureKind, preset: Preset) -> bool {
        if self.pins.preset.is_some() {
            return false;
        }
        self.state.set_preset(preset);
        self.pins.preset = Some(by);
        true
    }

    pub fn force_target_temperature(&mut self, by: FeatureKind, target: f64) -> bool {
        if self.pins.target_temperature.is_some() {
            return false;
        }
        self.state.set_target_temperature(Some(target));
        self.pins.target_temperature = Some(by);
        true
    }

    /// Presence input for preset temperature resolution.
    pub fn set_present(&mut self, present: bool) {
        self.present = present;
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Motion input: which catalog preset the activity preset currently stands for.
    pub fn set_activity_preset(&mut self, preset: Preset) {
        self.activity_preset = Some(preset);
    }

    pub fn activity_preset(&self) -> Option<Preset> {
        self.activity_preset
    }
}

/// Everything needed to turn a preset into a temperature.
#[derive(Debug, Clone, Copy)]
pub struct TargetResolver<'a> {
    pub catalog: &'a PresetCatalog,
    pub ac_mode: bool,
    pub min_temp: f64,
    pub max_temp: f64,
    pub power_temp: Option<f64>,
}

impl TargetResolver<'_> {
    fn resolve(&self, candidate: &Candidate, requested: &VThermState) -> Option<f64> {
        let mode = candidate.state.hvac_mode;
        let lookup = |preset: Preset| {
            find_preset_temp(self.catalog, preset, mode, candidate.present, self.ac_mode)
        };

        let target = match candidate.state.preset {
            Preset::None => requested.target_temperature,
            Preset::Activity => candidate
                .activity_preset
                .and_then(lookup)
                .or(requested.target_temperature),
            Preset::Power => self
                .power_temp
                .or_else(|| self.underlying_target(requested, mode, candidate.present)),
            Preset::Safety => self.underlying_target(requested, mode, candidate.present),
            preset => lookup(preset).or_else(|| {
                warn!(preset = preset.as_str(), "preset has no temperature, keeping requested");
                requested.target_temperature
            }),
        };
        target.map(|t| t.clamp(self.min_temp, self.max_temp))
    }

    /// Target behind a hidden preset: whatever the requested preset would give.
    fn underlying_target(&self, requested: &VThermState, mode: HvacMode, present: bool) -> Option<f64> {
        find_preset_temp(self.catalog, requested.preset, mode, present, self.ac_mode)
            .or(requested.target_temperature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Unchanged,
    Changed,
    /// A feature refused the pending request; nothing was touched.
    Rejected(FeatureKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateManager {
    requested: VThermState,
    current: VThermState,
    pending_source: Option<RequestSource>,
    /// Requested state before the pending change, put back when a feature rejects it.
    rollback: Option<VThermState>,
}

impl StateManager {
    pub fn new(initial: VThermState) -> Self {
        Self {
            requested: initial.clone(),
            current: initial,
            pending_source: None,
            rollback: None,
        }
    }

    pub fn requested(&self) -> &VThermState {
        &self.requested
    }

    pub fn current(&self) -> &VThermState {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut VThermState {
        &mut self.current
    }

    pub fn pending_source(&self) -> Option<RequestSource> {
        self.pending_source
    }

    /// Records an intent. Applied by the next [`calculate_current_state`](Self::calculate_current_state).
    pub fn request(&mut self, source: RequestSource, change: impl FnOnce(&mut VThermState)) {
        let before = self.requested.clone();
        change(&mut self.requested);
        if self.requested.is_changed() {
            self.rollback.get_or_insert(before);
            self.pending_source = Some(source);
        }
    }

    pub fn restore(&mut self, mut requested: VThermState, mut current: VThermState) {
        requested.reset_changes();
        current.reset_changes();
        self.requested = requested;
        self.current = current;
        self.pending_source = None;
        self.rollback = None;
    }

    /// Builds the next current state from the requested one and every configured
    /// feature in [`RECONCILIATION_ORDER`], then swaps it in.
    ///
    /// Each feature works on its own copy of the candidate; a failing feature is
    /// skipped and a rejecting one rolls the request back.
    pub fn calculate_current_state<'f>(
        &mut self,
        name: &str,
        feature: impl Fn(FeatureKind) -> &'f dyn FeatureManager,
        ctx: &FeatureContext<'_>,
        resolver: &TargetResolver<'_>,
    ) -> Reconciliation {
        let mut candidate = Candidate::from_requested(&self.requested);

        for kind in RECONCILIATION_ORDER {
            let manager = feature(kind);
            if !manager.is_configured() {
                continue;
            }
            let mut attempt = candidate.clone();
            match manager.apply(&mut attempt, ctx) {
                Ok(Verdict::Continue) => candidate = attempt,
                Ok(Verdict::Reject) => {
                    debug!(name, feature = kind.as_str(), "request rejected");
                    self.rollback_request();
                    return Reconciliation::Rejected(kind);
                }
                Err(err) => {
                    warn!(
                        name,
                        feature = kind.as_str(),
                        "feature failed during reconciliation, ignoring its override: {err}"
                    );
                }
            }
        }

        if candidate.pins.target_temperature.is_none() {
            let target = resolver.resolve(&candidate, &self.requested);
            candidate.state.set_target_temperature(target);
        }

        self.requested.reset_changes();
        self.pending_source = None;
        self.rollback = None;
        self.swap_in(candidate.state)
    }

    fn swap_in(&mut self, mut next: VThermState) -> Reconciliation {
        next.hvac_mode_changed = next.hvac_mode != self.current.hvac_mode;
        next.target_temperature_changed = next.target_temperature != self.current.target_temperature;
        next.preset_changed = next.preset != self.current.preset;

        let changed = !next.same_values(&self.current);
        self.current = next;
        if changed {
            Reconciliation::Changed
        } else {
            Reconciliation::Unchanged
        }
    }

    fn rollback_request(&mut self) {
        if let Some(mut previous) = self.rollback.take() {
            previous.reset_changes();
            self.requested = previous;
        }
        self.pending_source = None;
    }
}
