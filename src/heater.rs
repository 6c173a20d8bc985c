//! Heater directory
//!
//! Two keyspaces: device records keyed by [`DeviceId`], and mode overrides
//! keyed by human-assigned heater name. A name override wins over the
//! default mode; identifiers only carry bookkeeping (last seen, last mode,
//! replay counter).

use crate::config::REBOOT_COUNTER_WINDOW;
use crate::protocol::DeviceId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Thermal mode a heater should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaterMode {
    Off,
    Defrost,
    Eco,
    Comfort,
}

impl HeaterMode {
    pub const ALL: [HeaterMode; 4] = [
        HeaterMode::Off,
        HeaterMode::Defrost,
        HeaterMode::Eco,
        HeaterMode::Comfort,
    ];

    /// Wire code carried in a state reply
    pub fn code(self) -> u8 {
        match self {
            HeaterMode::Off => 0,
            HeaterMode::Defrost => 1,
            HeaterMode::Eco => 2,
            HeaterMode::Comfort => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.code() == code)
    }

    /// Value stored in the state file
    pub fn persisted(self) -> &'static str {
        match self {
            HeaterMode::Off => "off",
            HeaterMode::Defrost => "defrost",
            HeaterMode::Eco => "eco",
            HeaterMode::Comfort => "comfort",
        }
    }

    pub fn from_persisted(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.persisted() == value)
    }

    /// Label used in replies and alerts
    pub fn label(self) -> &'static str {
        match self {
            HeaterMode::Off => "OFF",
            HeaterMode::Defrost => "DEFROST",
            HeaterMode::Eco => "ECO",
            HeaterMode::Comfort => "COMFORT/ON",
        }
    }
}

impl fmt::Display for HeaterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Bookkeeping for one physical device
#[derive(Debug, Clone, PartialEq)]
pub struct HeaterRecord {
    pub name: Option<String>,
    pub last_address: Option<IpAddr>,
    pub mode: HeaterMode,
    pub last_request: DateTime<Utc>,
}

/// Outcome of comparing a frame counter against the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterCheck {
    FirstSeen,
    InSequence,
    Rebooted { previous: u64 },
}

/// Result of applying a state request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    pub mode: HeaterMode,
    pub counter: CounterCheck,
}

/// A device dropped by the lost-device sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostDevice {
    pub id: DeviceId,
    pub name: Option<String>,
}

impl fmt::Display for LostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "{}", self.id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeaterDirectory {
    default_mode: HeaterMode,
    overrides: BTreeMap<String, HeaterMode>,
    records: BTreeMap<DeviceId, HeaterRecord>,
    counters: HashMap<DeviceId, u64>,
}

impl Default for HeaterDirectory {
    fn default() -> Self {
        Self::new(HeaterMode::Defrost)
    }
}

impl HeaterDirectory {
    pub fn new(default_mode: HeaterMode) -> Self {
        Self {
            default_mode,
            overrides: BTreeMap::new(),
            records: BTreeMap::new(),
            counters: HashMap::new(),
        }
    }

    pub fn default_mode(&self) -> HeaterMode {
        self.default_mode
    }

    pub fn overrides(&self) -> &BTreeMap<String, HeaterMode> {
        &self.overrides
    }

    pub fn records(&self) -> &BTreeMap<DeviceId, HeaterRecord> {
        &self.records
    }

    pub fn get(&self, id: DeviceId) -> Option<&HeaterRecord> {
        self.records.get(&id)
    }

    /// Returns true when the default actually changed
    pub fn set_default(&mut self, mode: HeaterMode) -> bool {
        if self.default_mode == mode {
            return false;
        }
        self.default_mode = mode;
        self.refresh_records();
        true
    }

    /// Returns true when the override actually changed
    pub fn set_override(&mut self, name: &str, mode: HeaterMode) -> bool {
        let name = name.to_ascii_uppercase();
        if self.overrides.get(&name) == Some(&mode) {
            return false;
        }
        self.overrides.insert(name, mode);
        self.refresh_records();
        true
    }

    /// Mass command: new default, and every named override pinned to it
    pub fn set_all(&mut self, mode: HeaterMode) -> bool {
        let changed =
            self.default_mode != mode || self.overrides.values().any(|&m| m != mode);
        self.default_mode = mode;
        for m in self.overrides.values_mut() {
            *m = mode;
        }
        self.refresh_records();
        changed
    }

    pub fn replace_overrides(&mut self, overrides: BTreeMap<String, HeaterMode>) {
        self.overrides = overrides;
        self.refresh_records();
    }

    pub fn effective_mode(&self, name: Option<&str>) -> HeaterMode {
        name.and_then(|n| self.overrides.get(&n.to_ascii_uppercase()))
            .copied()
            .unwrap_or(self.default_mode)
    }

    /// Compare `counter` with the last one seen for `id`, then store it.
    ///
    /// Counters must move forward by at most [`REBOOT_COUNTER_WINDOW`];
    /// anything else (a bigger jump or going backwards) means the device
    /// re-seeded its counter.
    pub fn observe_counter(&mut self, id: DeviceId, counter: u64) -> CounterCheck {
        let check = match self.counters.get(&id) {
            None => CounterCheck::FirstSeen,
            Some(&previous) => match counter.checked_sub(previous) {
                Some(delta) if delta <= REBOOT_COUNTER_WINDOW => CounterCheck::InSequence,
                _ => CounterCheck::Rebooted { previous },
            },
        };
        self.counters.insert(id, counter);
        check
    }

    /// Apply a state request: counter check, mode resolution, record update
    pub fn handle_request(
        &mut self,
        id: DeviceId,
        name: Option<&str>,
        counter: u64,
        address: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> RequestOutcome {
        let counter = self.observe_counter(id, counter);
        let mode = self.effective_mode(name);

        self.records.insert(
            id,
            HeaterRecord {
                name: name.map(str::to_string),
                last_address: address,
                mode,
                last_request: now,
            },
        );
        debug!(device = %id, name = ?name, mode = %mode, "Heater state request");

        RequestOutcome { mode, counter }
    }

    /// Drop records whose last request is at least `threshold` old
    pub fn reap_lost(&mut self, now: DateTime<Utc>, threshold: Duration) -> Vec<LostDevice> {
        let lost: Vec<LostDevice> = self
            .records
            .iter()
            .filter(|(_, rec)| {
                let age = (now - rec.last_request).to_std().unwrap_or_default();
                age >= threshold
            })
            .map(|(&id, rec)| LostDevice {
                id,
                name: rec.name.clone(),
            })
            .collect();

        for device in &lost {
            self.records.remove(&device.id);
            warn!(
                device = %device.id,
                name = ?device.name,
                "No valid message from device for more than {}",
                format_duration(threshold)
            );
        }
        lost
    }

    /// Keep every record's mode in step with the current default/overrides
    fn refresh_records(&mut self) {
        let default_mode = self.default_mode;
        let overrides = &self.overrides;
        for rec in self.records.values_mut() {
            rec.mode = rec
                .name
                .as_ref()
                .and_then(|n| overrides.get(n))
                .copied()
                .unwrap_or(default_mode);
        }
    }
}

/// "24h0m0s" style rendering used in logs and alerts
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}
