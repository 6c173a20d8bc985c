//! Flat `key=value` snapshot of the durable hub state
//!
//! Recognized keys: `default_heater_state`, `heater_<NAME>_state`,
//! `whitelist` (comma separated) and `emergency_phone`. Unknown keys are
//! logged and skipped so older binaries can read newer files.

use crate::access::{is_valid_heater_name, is_valid_phone};
use crate::error::{Error, Result};
use crate::heater::HeaterMode;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

/// Mode used when a stored value cannot be parsed
const SAFE_MODE: HeaterMode = HeaterMode::Defrost;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub default_mode: HeaterMode,
    pub overrides: BTreeMap<String, HeaterMode>,
    pub whitelist: BTreeSet<String>,
    pub emergency_phone: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            default_mode: SAFE_MODE,
            overrides: BTreeMap::new(),
            whitelist: BTreeSet::new(),
            emergency_phone: None,
        }
    }
}

impl Snapshot {
    /// Parse file content; never fails, bad lines are logged and skipped
    pub fn parse(content: &str) -> Self {
        let mut snapshot = Snapshot::default();

        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            if key == "default_heater_state" {
                snapshot.default_mode = parse_mode(value, "default_heater_state");
            } else if let Some(name) = key
                .strip_prefix("heater_")
                .and_then(|rest| rest.strip_suffix("_state"))
            {
                if is_valid_heater_name(name) {
                    let mode = parse_mode(value, key);
                    snapshot.overrides.insert(name.to_ascii_uppercase(), mode);
                } else {
                    warn!("Invalid heater name \"{}\" in state file", name);
                }
            } else if key == "whitelist" {
                for number in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    if is_valid_phone(number) {
                        snapshot.whitelist.insert(number.to_string());
                    } else {
                        warn!("Invalid phone number in whitelist: {}", number);
                    }
                }
            } else if key == "emergency_phone" {
                if value.is_empty() {
                    snapshot.emergency_phone = None;
                } else if is_valid_phone(value) {
                    snapshot.emergency_phone = Some(value.to_string());
                } else {
                    warn!("Invalid emergency phone number: {}", value);
                }
            } else {
                warn!("Unknown key \"{}\" in state file", key);
            }
        }

        snapshot
    }

    pub fn render(&self) -> String {
        let mut out = format!("default_heater_state={}\n", self.default_mode.persisted());
        for (name, mode) in &self.overrides {
            out.push_str(&format!("heater_{}_state={}\n", name, mode.persisted()));
        }
        let whitelist: Vec<&str> = self.whitelist.iter().map(String::as_str).collect();
        out.push_str(&format!("whitelist={}\n", whitelist.join(",")));
        out.push_str(&format!(
            "emergency_phone={}\n",
            self.emergency_phone.as_deref().unwrap_or("")
        ));
        out
    }
}

fn parse_mode(value: &str, key: &str) -> HeaterMode {
    HeaterMode::from_persisted(value).unwrap_or_else(|| {
        error!(
            "Invalid value \"{}\" for {}, using {}",
            value,
            key,
            SAFE_MODE.persisted()
        );
        SAFE_MODE
    })
}

/// State file on disk
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot; `None` when no file exists yet
    pub fn load(&self) -> Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        debug!("Loaded state from {}", self.path.display());
        Ok(Some(Snapshot::parse(&content)))
    }

    /// Raw file content, for diagnostics
    pub fn read_raw(&self) -> Result<String> {
        Ok(fs::read_to_string(&self.path)?)
    }

    /// Rewrite the whole file via a temp file and rename
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let parent = self.path.parent().unwrap_or(Path::new("."));
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(snapshot.render().as_bytes())?;
        temp.as_file().sync_all()?;

        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}
