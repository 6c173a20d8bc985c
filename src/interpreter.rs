//! Executes text commands against the hub state
//!
//! Each queued message is gated on its own: while locked, senders outside a
//! non-empty whitelist are dropped without a reply so nobody can make the
//! hub spend money on outbound texts.

use crate::access::WhitelistChange;
use crate::commands::{Command, CommandQueue, DebugCommand};
use crate::messaging::Messenger;
use crate::probes::SystemProbe;
use crate::state::HubState;
use std::sync::Arc;
use tracing::{error, info, warn};

const MAX_IP_REPLY: usize = 64;
const MAX_WIFI_REPLY: usize = 512;
const LOG_CHUNK: usize = 512;
const MAX_LOG_CHUNKS: usize = 4;

const HELP_TEXT: &str = "Basic commands:\n\
                         ALL OFF\n\
                         ALL ECO\n\
                         ALL COMFORT\n\
                         ALL DEFROST\n\
                         HEATER <name> <mode>\n\
                         GET DEFAULT\n\
                         GET HEATER <name>\n";

/// Build identifier sent in reply to VERSION
pub fn version_string() -> String {
    format!(
        "heater-hub-{}.{}",
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_HASH").unwrap_or("development")
    )
}

pub struct Interpreter {
    messenger: Arc<dyn Messenger>,
    probe: Arc<dyn SystemProbe>,
    pin: String,
}

impl Interpreter {
    pub fn new(messenger: Arc<dyn Messenger>, probe: Arc<dyn SystemProbe>, pin: impl Into<String>) -> Self {
        Self {
            messenger,
            probe,
            pin: pin.into(),
        }
    }

    /// Process everything queued so far, one message at a time
    pub fn drain(&self, queue: &CommandQueue, state: &mut HubState) -> usize {
        let mut handled = 0;
        while let Some((from, text)) = queue.pop() {
            self.execute(state, &from, &text);
            handled += 1;
        }
        handled
    }

    pub fn execute(&self, state: &mut HubState, from: &str, text: &str) {
        if !state.access.admits(from) {
            warn!(from = %from, "Ignoring message from non-whitelisted phone while locked");
            return;
        }

        let command = Command::parse(text);
        info!(from = %from, command = ?command, "Received SMS command");

        match command {
            Command::Ping => self.reply(from, "PONG"),
            Command::Version => self.reply(from, &version_string()),
            Command::All(word) => {
                state.set_all(word.mode());
                self.reply(from, &format!("ALL {}", word));
            }
            Command::Heater { name, word } => {
                state.set_override(&name, word.mode());
                self.reply(from, &format!("HEATER {} {}", name, word));
            }
            Command::InvalidHeaterName => self.reply(from, "Invalid heater name"),
            Command::GetDefault => {
                let mode = state.heaters.default_mode();
                self.reply(from, &format!("DEFAULT: {}", mode));
            }
            Command::GetHeater(name) => {
                let mode = state.heaters.effective_mode(Some(&name));
                self.reply(from, &format!("HEATER {} {}", name, mode));
            }
            Command::InvalidName => self.reply(from, "Invalid name"),
            Command::GetIp => self.get_ip(from),
            Command::Lock => {
                if state.access.is_whitelisted(from) {
                    state.access.set_locked(true);
                    info!(from = %from, "Hub locked");
                    self.reply(from, "LOCKED");
                } else {
                    self.reply(
                        from,
                        "Cannot lock: phone number is not whitelisted. Use ADD PHONE command.",
                    );
                }
            }
            Command::Unlock { pin } => {
                if pin == self.pin {
                    state.access.set_locked(false);
                    info!(from = %from, "Hub unlocked");
                    self.reply(from, "UNLOCKED");
                } else {
                    warn!(from = %from, "Wrong PIN for UNLOCK");
                    self.reply(from, "Wrong PIN");
                }
            }
            Command::AddPhone { pin, number } => {
                if !self.whitelist_editable(state, from, &pin) {
                    return;
                }
                match state.add_phone(&number) {
                    WhitelistChange::InvalidNumber => self.reply(from, &invalid_number(&number)),
                    _ => self.reply(
                        from,
                        &format!("Phone number \"{}\" added to whitelist", number),
                    ),
                }
            }
            Command::RemovePhone { pin, number } => {
                if !self.whitelist_editable(state, from, &pin) {
                    return;
                }
                match state.remove_phone(&number) {
                    WhitelistChange::InvalidNumber => self.reply(from, &invalid_number(&number)),
                    WhitelistChange::Removed => self.reply(
                        from,
                        &format!("Phone number \"{}\" removed from whitelist", number),
                    ),
                    _ => self.reply(
                        from,
                        &format!("Phone number \"{}\" is not in whitelist", number),
                    ),
                }
            }
            Command::SetEmergencyPhone { pin, number } => {
                if pin != self.pin {
                    self.reply(from, "Wrong PIN");
                } else if state.set_emergency_phone(&number) {
                    info!("Emergency phone set to {}", number);
                    self.reply(from, &format!("{} set as emergency phone number.", number));
                } else {
                    self.reply(from, &invalid_number(&number));
                }
            }
            Command::RemoveEmergencyPhone => match state.clear_emergency_phone() {
                Some(_) => {
                    info!("Removed emergency phone");
                    self.reply(from, "Emergency phone removed");
                }
                None => self.reply(from, "No emergency phone configured"),
            },
            Command::Help => self.reply(from, HELP_TEXT),
            Command::Debug(kind) => self.debug(state, from, kind),
            Command::Invalid => {
                warn!("Received invalid message from: {}", from);
                self.reply(from, "Received invalid command");
            }
        }
    }

    /// Whitelist edits need the hub unlocked and the right PIN
    fn whitelist_editable(&self, state: &HubState, from: &str, pin: &str) -> bool {
        if state.access.is_locked() {
            self.reply(from, "Cannot modify whitelist while locked");
            false
        } else if pin != self.pin {
            warn!(from = %from, "Wrong PIN for whitelist change");
            self.reply(from, "Wrong PIN");
            false
        } else {
            true
        }
    }

    fn get_ip(&self, from: &str) {
        match self.probe.public_ip() {
            Ok(ip) if ip.is_empty() => self.reply(from, "Unable to get public IP"),
            Ok(ip) => self.reply(from, truncate(&ip, MAX_IP_REPLY)),
            Err(e) => {
                error!("Public IP lookup failed: {}", e);
                self.reply(from, "Fail to get public IP");
            }
        }
    }

    fn debug(&self, state: &HubState, from: &str, kind: DebugCommand) {
        match kind {
            DebugCommand::State => {
                let mut msg = format!("DEFAULT: {}\n", state.heaters.default_mode());
                for (name, mode) in state.heaters.overrides() {
                    msg.push_str(&format!("HEATER {}: {}\n", name, mode));
                }
                self.reply(from, &msg);
            }
            DebugCommand::FileState => match state.store().read_raw() {
                Ok(content) => self.reply(from, &content),
                Err(e) => {
                    error!("Could not read state file: {}", e);
                    self.reply(from, "Fail to read state file");
                }
            },
            DebugCommand::Uptime => {
                let uptime = self.probe.uptime().unwrap_or_else(|e| {
                    warn!("Uptime unavailable: {}", e);
                    "unknown".to_string()
                });
                self.reply(from, &uptime);
            }
            DebugCommand::Wifi => match self.probe.wifi_report() {
                Ok(report) if report.trim().is_empty() => {
                    self.reply(from, "Unable to get wifi connection info")
                }
                Ok(report) => self.reply(from, truncate(&report, MAX_WIFI_REPLY)),
                Err(e) => {
                    error!("Wifi report failed: {}", e);
                    self.reply(from, "Fail to get wifi connection info");
                }
            },
            DebugCommand::Log => match self.probe.recent_logs() {
                Ok(logs) if logs.is_empty() => self.reply(from, "Unable to get hub logs"),
                Ok(logs) => {
                    let tail = tail(&logs, LOG_CHUNK * MAX_LOG_CHUNKS);
                    for chunk in chunks(tail, LOG_CHUNK) {
                        self.reply(from, chunk);
                    }
                }
                Err(e) => {
                    error!("Log retrieval failed: {}", e);
                    self.reply(from, "Fail to get hub logs");
                }
            },
            DebugCommand::Reboot => {
                info!(from = %from, "Reboot requested");
                if let Err(e) = self.probe.reboot() {
                    error!("Reboot failed: {}", e);
                    self.reply(from, "Reboot failed");
                }
            }
        }
    }

    fn reply(&self, to: &str, text: &str) {
        if let Err(e) = self.messenger.send(to, text) {
            error!(to = %to, "Could not send reply: {}", e);
        }
    }
}

fn invalid_number(number: &str) -> String {
    format!(
        "Phone number \"{}\" is not valid. Phone numbers must be 10 to 14 digits, country code first. Example: 3310203040506",
        number
    )
}

/// At most `max` bytes, cut on a char boundary
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Last `max` bytes, cut on a char boundary
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn chunks(mut s: &str, size: usize) -> Vec<&str> {
    let mut out = Vec::new();
    while !s.is_empty() {
        let head = truncate(s, size);
        // a single char wider than `size` still has to go out
        let head = if head.is_empty() {
            let width = s.chars().next().map_or(s.len(), char::len_utf8);
            &s[..width]
        } else {
            head
        };
        out.push(head);
        s = &s[head.len()..];
    }
    out
}
