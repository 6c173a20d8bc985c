//! Text command grammar and the inbound command queue

use crate::access::is_valid_heater_name;
use crate::heater::HeaterMode;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static ALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ALL\s+(OFF|ECO|DEFROST|COMFORT|ON)$").unwrap());

static HEATER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^HEATER\s+(.+?)\s+(OFF|ECO|DEFROST|COMFORT|ON)$").unwrap());

static GET_HEATER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^GET\s+HEATER\s+(.+)$").unwrap());

static UNLOCK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^UNLOCK\s+(\S+)$").unwrap());

static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(ADD|REMOVE|SET\s+EMERGENCY)\s+PHONE\s+(\S+)\s+(\S+)$").unwrap()
});

static DEBUG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^DEBUG\s+(\S+)$").unwrap());

/// Mode keyword as the sender typed it; `ON` is an alias for comfort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeWord {
    Off,
    Eco,
    Defrost,
    Comfort,
    On,
}

impl ModeWord {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "OFF" => Some(ModeWord::Off),
            "ECO" => Some(ModeWord::Eco),
            "DEFROST" => Some(ModeWord::Defrost),
            "COMFORT" => Some(ModeWord::Comfort),
            "ON" => Some(ModeWord::On),
            _ => None,
        }
    }

    pub fn mode(self) -> HeaterMode {
        match self {
            ModeWord::Off => HeaterMode::Off,
            ModeWord::Eco => HeaterMode::Eco,
            ModeWord::Defrost => HeaterMode::Defrost,
            ModeWord::Comfort | ModeWord::On => HeaterMode::Comfort,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModeWord::Off => "OFF",
            ModeWord::Eco => "ECO",
            ModeWord::Defrost => "DEFROST",
            ModeWord::Comfort => "COMFORT",
            ModeWord::On => "ON",
        }
    }
}

impl fmt::Display for ModeWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCommand {
    State,
    FileState,
    Uptime,
    Wifi,
    Log,
    Reboot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Version,
    All(ModeWord),
    Heater { name: String, word: ModeWord },
    InvalidHeaterName,
    GetDefault,
    GetHeater(String),
    InvalidName,
    GetIp,
    Lock,
    Unlock { pin: String },
    AddPhone { pin: String, number: String },
    RemovePhone { pin: String, number: String },
    SetEmergencyPhone { pin: String, number: String },
    RemoveEmergencyPhone,
    Help,
    Debug(DebugCommand),
    Invalid,
}

impl Command {
    /// Parse a raw message body. Matching is case-insensitive and ignores
    /// surrounding whitespace.
    pub fn parse(text: &str) -> Command {
        let content = text.trim().to_ascii_uppercase();

        match content.as_str() {
            "PING" => return Command::Ping,
            "VERSION" => return Command::Version,
            "GET DEFAULT" => return Command::GetDefault,
            "GET IP" => return Command::GetIp,
            "LOCK" => return Command::Lock,
            "REMOVE EMERGENCY PHONE" => return Command::RemoveEmergencyPhone,
            _ => {}
        }

        if content.starts_with("HELP") {
            return Command::Help;
        }

        if let Some(caps) = ALL_RE.captures(&content) {
            return ModeWord::parse(&caps[1]).map_or(Command::Invalid, Command::All);
        }

        if let Some(caps) = HEATER_RE.captures(&content) {
            let name = &caps[1];
            if !is_valid_heater_name(name) {
                return Command::InvalidHeaterName;
            }
            return match ModeWord::parse(&caps[2]) {
                Some(word) => Command::Heater {
                    name: name.to_string(),
                    word,
                },
                None => Command::Invalid,
            };
        }

        if let Some(caps) = GET_HEATER_RE.captures(&content) {
            let name = caps[1].trim();
            if !is_valid_heater_name(name) {
                return Command::InvalidName;
            }
            return Command::GetHeater(name.to_string());
        }

        if let Some(caps) = UNLOCK_RE.captures(&content) {
            return Command::Unlock {
                pin: caps[1].to_string(),
            };
        }

        if let Some(caps) = PHONE_RE.captures(&content) {
            let pin = caps[2].to_string();
            let number = caps[3].to_string();
            return match &caps[1] {
                "ADD" => Command::AddPhone { pin, number },
                "REMOVE" => Command::RemovePhone { pin, number },
                _ => Command::SetEmergencyPhone { pin, number },
            };
        }

        if let Some(caps) = DEBUG_RE.captures(&content) {
            let kind = match &caps[1] {
                "STATE" => DebugCommand::State,
                "FILESTATE" => DebugCommand::FileState,
                "UPTIME" => DebugCommand::Uptime,
                "WIFI" => DebugCommand::Wifi,
                "LOG" => DebugCommand::Log,
                "REBOOT" => DebugCommand::Reboot,
                _ => return Command::Invalid,
            };
            return Command::Debug(kind);
        }

        Command::Invalid
    }
}

/// Texts waiting to be interpreted, filled by the SMS receiver thread
#[derive(Clone, Default)]
pub struct CommandQueue {
    inner: Arc<Mutex<VecDeque<(String, String)>>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<(String, String)>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, from: &str, text: &str) {
        self.lock().push_back((from.to_string(), text.to_string()));
    }

    /// Next `(from, text)` pair, oldest first
    pub fn pop(&self) -> Option<(String, String)> {
        self.lock().pop_front()
    }

    pub fn take_all(&self) -> Vec<(String, String)> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
