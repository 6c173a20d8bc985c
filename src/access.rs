//! Phone whitelist, lock flag and emergency contact

use std::collections::BTreeSet;

/// Phone numbers are 10 to 14 digits, country code included, no '+'
pub fn is_valid_phone(number: &str) -> bool {
    (10..=14).contains(&number.len()) && number.chars().all(|c| c.is_ascii_digit())
}

/// Heater names are non-empty ASCII alphanumerics
pub fn is_valid_heater_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistChange {
    Added,
    Removed,
    Unchanged,
    InvalidNumber,
}

#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    whitelist: BTreeSet<String>,
    emergency_phone: Option<String>,
    locked: bool,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn whitelist(&self) -> &BTreeSet<String> {
        &self.whitelist
    }

    pub fn is_whitelisted(&self, number: &str) -> bool {
        self.whitelist.contains(number)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// Whether a command from `from` may run at all.
    ///
    /// An empty whitelist never blocks, even while locked, so a hub cannot
    /// lock itself out.
    pub fn admits(&self, from: &str) -> bool {
        !self.locked || self.whitelist.is_empty() || self.whitelist.contains(from)
    }

    pub fn add_phone(&mut self, number: &str) -> WhitelistChange {
        if !is_valid_phone(number) {
            return WhitelistChange::InvalidNumber;
        }
        if self.whitelist.insert(number.to_string()) {
            WhitelistChange::Added
        } else {
            WhitelistChange::Unchanged
        }
    }

    pub fn remove_phone(&mut self, number: &str) -> WhitelistChange {
        if !is_valid_phone(number) {
            return WhitelistChange::InvalidNumber;
        }
        if self.whitelist.remove(number) {
            WhitelistChange::Removed
        } else {
            WhitelistChange::Unchanged
        }
    }

    pub fn emergency_phone(&self) -> Option<&str> {
        self.emergency_phone.as_deref()
    }

    /// Returns false if the number is malformed
    pub fn set_emergency_phone(&mut self, number: &str) -> bool {
        if !is_valid_phone(number) {
            return false;
        }
        self.emergency_phone = Some(number.to_string());
        true
    }

    /// Returns the number that was cleared, if any
    pub fn clear_emergency_phone(&mut self) -> Option<String> {
        self.emergency_phone.take()
    }
}
