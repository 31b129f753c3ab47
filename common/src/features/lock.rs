use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use super::{FeatureContext, FeatureKind, FeatureManager, Verdict};
use crate::{
    config::LockConfig,
    error::{FeatureError, ThermostatError},
    event::ThermostatEvent,
    snapshot::ThermostatSnapshot,
    state::Candidate,
    types::RequestSource,
};

/// Rejects user and/or automation commands while locked. The optional code is
/// only kept as a SHA-256 digest.
#[derive(Debug, Clone)]
pub struct LockManager {
    name: String,
    lock_users: bool,
    lock_automations: bool,
    code_digest: Option<String>,
    locked: bool,
}

pub(crate) fn digest(code: &str) -> String {
    Sha256::digest(code.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

impl LockManager {
    pub fn new(name: &str, config: &LockConfig) -> Self {
        Self {
            name: name.to_string(),
            lock_users: config.users,
            lock_automations: config.automations,
            code_digest: config.code.as_deref().map(digest),
            locked: false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn lock(&mut self, code: Option<&str>) -> Result<bool, ThermostatError> {
        self.check_code(code)?;
        let changed = !self.locked;
        self.locked = true;
        if changed {
            info!(name = %self.name, "thermostat locked");
        }
        Ok(changed)
    }

    pub fn unlock(&mut self, code: Option<&str>) -> Result<bool, ThermostatError> {
        self.check_code(code)?;
        let changed = self.locked;
        self.locked = false;
        if changed {
            info!(name = %self.name, "thermostat unlocked");
        }
        Ok(changed)
    }

    /// Refuses a command from `source` while locked.
    pub fn check(&self, source: RequestSource) -> Result<(), ThermostatError> {
        if self.rejects(source) {
            Err(ThermostatError::Locked)
        } else {
            Ok(())
        }
    }

    fn rejects(&self, source: RequestSource) -> bool {
        self.locked
            && match source {
                RequestSource::User => self.lock_users,
                RequestSource::Automation => self.lock_automations,
            }
    }

    fn check_code(&self, code: Option<&str>) -> Result<(), ThermostatError> {
        match &self.code_digest {
            None => Ok(()),
            Some(expected) if code.map(digest).as_ref() == Some(expected) => Ok(()),
            Some(_) => Err(ThermostatError::WrongLockCode),
        }
    }
}

impl FeatureManager for LockManager {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Lock
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn refresh_state(&mut self, _ctx: &FeatureContext<'_>, _events: &mut Vec<ThermostatEvent>) -> bool {
        false
    }

    fn apply(&self, _candidate: &mut Candidate, ctx: &FeatureContext<'_>) -> Result<Verdict, FeatureError> {
        match ctx.request_source {
            Some(source) if self.rejects(source) => Ok(Verdict::Reject),
            _ => Ok(Verdict::Continue),
        }
    }

    fn restore_state(&mut self, snapshot: &ThermostatSnapshot, _now: DateTime<Utc>) {
        self.locked = snapshot.locked;
    }

    fn add_attributes(&self, attributes: &mut Map<String, Value>) {
        attributes.insert(
            "lock".to_string(),
            json!({
                "is_locked": self.locked,
                "lock_users": self.lock_users,
                "lock_automations": self.lock_automations,
                "has_code": self.code_digest.is_some(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(code: Option<&str>) -> LockManager {
        LockManager::new(
            "living",
            &LockConfig {
                users: true,
                automations: false,
                code: code.map(str::to_string),
            },
        )
    }

    #[test]
    fn locked_rejects_only_configured_sources() {
        let mut lock = manager(None);
        assert_eq!(lock.check(RequestSource::User), Ok(()));

        lock.lock(None).unwrap();

        assert_eq!(lock.check(RequestSource::User), Err(ThermostatError::Locked));
        assert_eq!(lock.check(RequestSource::Automation), Ok(()));
    }

    #[test]
    fn code_is_checked_against_digest() {
        let mut lock = manager(Some("1234"));

        assert_eq!(lock.lock(Some("0000")), Err(ThermostatError::WrongLockCode));
        assert_eq!(lock.lock(None), Err(ThermostatError::WrongLockCode));
        assert_eq!(lock.lock(Some("1234")), Ok(true));
        assert_eq!(lock.unlock(Some("4321")), Err(ThermostatError::WrongLockCode));
        assert!(lock.is_locked());
        assert_eq!(lock.unlock(Some("1234")), Ok(true));
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
