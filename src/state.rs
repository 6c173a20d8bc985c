//! Hub state: heater directory, access control and their durable copy
//!
//! Every durable mutation goes through here so it is saved before the
//! caller acknowledges it. A failed save is logged; the in-memory state
//! stays authoritative until the next successful write.

use crate::access::{AccessControl, WhitelistChange};
use crate::heater::{HeaterDirectory, HeaterMode};
use crate::persistence::{Snapshot, StateStore};
use tracing::{error, info};

#[derive(Debug)]
pub struct HubState {
    pub heaters: HeaterDirectory,
    pub access: AccessControl,
    store: StateStore,
}

impl HubState {
    /// Load from `store`, or write the defaults when no file exists yet
    pub fn load(store: StateStore) -> Self {
        let snapshot = match store.load() {
            Ok(Some(snapshot)) => {
                info!("Loaded state from {}", store.path().display());
                snapshot
            }
            Ok(None) => {
                info!("No state file at {}, writing defaults", store.path().display());
                let snapshot = Snapshot::default();
                if let Err(e) = store.save(&snapshot) {
                    error!("Failed to initialize state file {}: {}", store.path().display(), e);
                }
                snapshot
            }
            Err(e) => {
                error!("Could not load state from {}: {}", store.path().display(), e);
                Snapshot::default()
            }
        };
        Self::from_snapshot(snapshot, store)
    }

    pub fn from_snapshot(snapshot: Snapshot, store: StateStore) -> Self {
        let mut heaters = HeaterDirectory::new(snapshot.default_mode);
        heaters.replace_overrides(snapshot.overrides);

        let mut access = AccessControl::new();
        for number in &snapshot.whitelist {
            access.add_phone(number);
        }
        if let Some(number) = &snapshot.emergency_phone {
            access.set_emergency_phone(number);
        }

        Self {
            heaters,
            access,
            store,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            default_mode: self.heaters.default_mode(),
            overrides: self.heaters.overrides().clone(),
            whitelist: self.access.whitelist().clone(),
            emergency_phone: self.access.emergency_phone().map(str::to_string),
        }
    }

    pub fn persist(&self) {
        if let Err(e) = self.store.save(&self.snapshot()) {
            error!("Could not save state to {}: {}", self.store.path().display(), e);
        }
    }

    pub fn set_default(&mut self, mode: HeaterMode) {
        if self.heaters.set_default(mode) {
            self.persist();
        }
    }

    pub fn set_override(&mut self, name: &str, mode: HeaterMode) {
        if self.heaters.set_override(name, mode) {
            self.persist();
        }
    }

    /// Default and every named override to `mode`
    pub fn set_all(&mut self, mode: HeaterMode) {
        if self.heaters.set_all(mode) {
            self.persist();
        }
    }

    pub fn add_phone(&mut self, number: &str) -> WhitelistChange {
        let change = self.access.add_phone(number);
        if change == WhitelistChange::Added {
            self.persist();
        }
        change
    }

    pub fn remove_phone(&mut self, number: &str) -> WhitelistChange {
        let change = self.access.remove_phone(number);
        if change == WhitelistChange::Removed {
            self.persist();
        }
        change
    }

    pub fn set_emergency_phone(&mut self, number: &str) -> bool {
        let ok = self.access.set_emergency_phone(number);
        if ok {
            self.persist();
        }
        ok
    }

    pub fn clear_emergency_phone(&mut self) -> Option<String> {
        let cleared = self.access.clear_emergency_phone();
        if cleared.is_some() {
            self.persist();
        }
        cleared
    }
}
