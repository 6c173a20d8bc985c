//! Host probes: link state, modem, SMS daemon liveness and diagnostics
//!
//! Everything the watchdogs and DEBUG commands ask of the host goes
//! through [`SystemProbe`], so tests can script the answers.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::DeviceId;
use nix::sys::termios::{
    cfmakeraw, cfsetspeed, tcflush, tcgetattr, tcsetattr, BaudRate, FlushArg, LocalFlags,
    SetArg, SpecialCharacterIndices,
};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

/// `IFF_UP | IFF_RUNNING` from `<net/if.h>`
const IFF_UP: u32 = 0x1;
const IFF_RUNNING: u32 = 0x40;

/// Reads with VTIME=1 return after 100 ms of silence; give up after this many
const MAX_SERIAL_READS: usize = 20;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Cellular module status as reported over the AT channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemStatus {
    /// Device nodes missing
    Absent,
    /// Nodes present but no `OK` to `AT`
    ComsFailure,
    SimError,
    NotRegistered,
    Searching,
    Denied,
    Registered,
    Roaming,
    Unknown,
}

impl ModemStatus {
    pub fn is_registered(self) -> bool {
        matches!(self, ModemStatus::Registered | ModemStatus::Roaming)
    }

    pub fn describe(self) -> &'static str {
        match self {
            ModemStatus::Absent => "module not detected",
            ModemStatus::ComsFailure => "communication failure",
            ModemStatus::SimError => "SIM card error",
            ModemStatus::NotRegistered => "not registered",
            ModemStatus::Searching => "searching network",
            ModemStatus::Denied => "registration denied",
            ModemStatus::Registered => "registered",
            ModemStatus::Roaming => "roaming",
            ModemStatus::Unknown => "unknown",
        }
    }
}

pub trait SystemProbe: Send + Sync {
    /// Interface administratively up and running
    fn link_up(&self) -> Result<bool>;

    fn modem_status(&self) -> ModemStatus;

    fn sms_daemon_running(&self) -> bool;

    /// Link-layer address stamped on outgoing frames
    fn hub_id(&self) -> DeviceId;

    fn public_ip(&self) -> Result<String>;

    fn uptime(&self) -> Result<String>;

    fn wifi_report(&self) -> Result<String>;

    fn recent_logs(&self) -> Result<String>;

    fn reboot(&self) -> Result<()>;
}

/// Probe backed by sysfs, procfs, the modem tty and a few host commands
pub struct LinuxProbe {
    interface: String,
    modem_data_node: PathBuf,
    modem_control_node: PathBuf,
    daemon_process: String,
    public_ip_url: String,
    log_unit: String,
    sys_net: PathBuf,
    proc_root: PathBuf,
}

impl LinuxProbe {
    pub fn new(config: &Config) -> Self {
        Self {
            interface: config.network_interface.clone(),
            modem_data_node: config.modem_data_node.clone(),
            modem_control_node: config.modem_control_node.clone(),
            daemon_process: config.sms_daemon_process.clone(),
            public_ip_url: config.public_ip_url.clone(),
            log_unit: config.log_unit.clone(),
            sys_net: PathBuf::from("/sys/class/net"),
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Point the sysfs/procfs lookups somewhere else
    pub fn with_roots(mut self, sys_net: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Self {
        self.sys_net = sys_net.into();
        self.proc_root = proc_root.into();
        self
    }

    fn modem_present(&self) -> bool {
        self.modem_data_node.exists() && self.modem_control_node.exists()
    }

    fn query_modem(&self) -> Result<ModemStatus> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.modem_control_node)?;

        let saved = tcgetattr(&file)?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        raw.local_flags.remove(LocalFlags::ICANON);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;
        cfsetspeed(&mut raw, BaudRate::B9600)?;
        tcsetattr(&file, SetArg::TCSANOW, &raw)?;

        let status = at_session(&file);

        if let Err(e) = tcsetattr(&file, SetArg::TCSANOW, &saved) {
            warn!("Could not restore modem line settings: {}", e);
        }
        status
    }

    fn process_running(&self, name: &str) -> bool {
        let entries = match fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Can't open {}: {}", self.proc_root.display(), e);
                return false;
            }
        };

        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().parse::<u32>().is_ok())
            .filter_map(|e| fs::read_to_string(e.path().join("stat")).ok())
            .any(|stat| parse_proc_stat_name(&stat) == Some(name))
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::CommandFailed(format!("{}: {}", program, e)))?;

        if !output.status.success() {
            return Err(Error::CommandFailed(format!(
                "{} failed: {}",
                program,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl SystemProbe for LinuxProbe {
    fn link_up(&self) -> Result<bool> {
        let path = self.sys_net.join(&self.interface).join("flags");
        let raw = fs::read_to_string(&path)?;
        let flags = parse_flags(&raw).ok_or_else(|| {
            Error::Protocol(format!("unreadable interface flags in {}", path.display()))
        })?;
        Ok(flags & IFF_UP != 0 && flags & IFF_RUNNING != 0)
    }

    fn modem_status(&self) -> ModemStatus {
        if !self.modem_present() {
            return ModemStatus::Absent;
        }
        match self.query_modem() {
            Ok(status) => status,
            Err(e) => {
                debug!("Modem query failed: {}", e);
                ModemStatus::ComsFailure
            }
        }
    }

    fn sms_daemon_running(&self) -> bool {
        self.process_running(&self.daemon_process)
    }

    fn hub_id(&self) -> DeviceId {
        let path = self.sys_net.join(&self.interface).join("address");
        match fs::read_to_string(&path).ok().and_then(|s| parse_mac(&s)) {
            Some(id) => id,
            None => {
                warn!(
                    "Unable to get MAC address of network interface {}",
                    self.interface
                );
                DeviceId::from_bytes([0; 6])
            }
        }
    }

    fn public_ip(&self) -> Result<String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        let body = client
            .get(&self.public_ip_url)
            .send()?
            .error_for_status()?
            .text()?;
        Ok(body.trim().to_string())
    }

    fn uptime(&self) -> Result<String> {
        let raw = fs::read_to_string(self.proc_root.join("uptime"))?;
        let secs = raw
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| Error::Protocol("unreadable /proc/uptime".to_string()))?;
        Ok(format_uptime(secs as u64))
    }

    fn wifi_report(&self) -> Result<String> {
        self.run("iwconfig", &[&self.interface])
    }

    fn recent_logs(&self) -> Result<String> {
        let unit = format!("--unit={}", self.log_unit);
        self.run("journalctl", &[&unit, "--no-pager"])
    }

    fn reboot(&self) -> Result<()> {
        self.run("systemctl", &["reboot"]).map(|_| ())
    }
}

/// `AT`, `AT+CPIN?`, `AT+CREG?` in sequence on an already configured line
fn at_session(file: &File) -> Result<ModemStatus> {
    if !at_exchange(file, "AT")?.contains("OK") {
        return Ok(ModemStatus::ComsFailure);
    }
    if !at_exchange(file, "AT+CPIN?")?.contains("+CPIN: READY") {
        return Ok(ModemStatus::SimError);
    }
    let reply = at_exchange(file, "AT+CREG?")?;
    Ok(parse_creg(&reply))
}

fn at_exchange(mut file: &File, command: &str) -> Result<String> {
    tcflush(file, FlushArg::TCIOFLUSH)?;
    file.write_all(format!("{}\r\n", command).as_bytes())?;

    let mut reply = Vec::new();
    let mut buf = [0u8; 32];
    for _ in 0..MAX_SERIAL_READS {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => reply.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    let reply = String::from_utf8_lossy(&reply).into_owned();
    debug!(command = command, reply = %reply.trim(), "AT exchange");
    Ok(reply)
}

/// Map the `+CREG: <mode>,<stat>` reply to a status
pub fn parse_creg(reply: &str) -> ModemStatus {
    let stat = reply
        .lines()
        .find_map(|l| l.trim().strip_prefix("+CREG:"))
        .and_then(|rest| rest.split(',').nth(1))
        .and_then(|s| s.trim().parse::<u8>().ok());

    match stat {
        Some(0) => ModemStatus::NotRegistered,
        Some(1) => ModemStatus::Registered,
        Some(2) => ModemStatus::Searching,
        Some(3) => ModemStatus::Denied,
        Some(5) => ModemStatus::Roaming,
        _ => ModemStatus::Unknown,
    }
}

/// sysfs exposes interface flags as a hex literal, e.g. `0x1003`
pub fn parse_flags(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u32::from_str_radix(digits, 16).ok()
}

pub fn parse_mac(raw: &str) -> Option<DeviceId> {
    let parts: Vec<u8> = raw
        .trim()
        .split(':')
        .map(|p| u8::from_str_radix(p, 16))
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    let bytes: [u8; 6] = parts.try_into().ok()?;
    Some(DeviceId::from_bytes(bytes))
}

/// Command name from `/proc/<pid>/stat`: `pid (comm) state ...`
pub fn parse_proc_stat_name(stat: &str) -> Option<&str> {
    let start = stat.find('(')?;
    let end = stat.rfind(')')?;
    (start < end).then(|| &stat[start + 1..end])
}

pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    format!("{} days {}h {}m {}s", days, hours, minutes, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_creg() {
        assert_eq!(parse_creg("\r\n+CREG: 0,1\r\n\r\nOK\r\n"), ModemStatus::Registered);
        assert_eq!(parse_creg("+CREG: 0,5\r\nOK"), ModemStatus::Roaming);
        assert_eq!(parse_creg("+CREG: 0,0"), ModemStatus::NotRegistered);
        assert_eq!(parse_creg("+CREG: 0,2"), ModemStatus::Searching);
        assert_eq!(parse_creg("+CREG: 0,3"), ModemStatus::Denied);
        assert_eq!(parse_creg("+CREG: 0,4"), ModemStatus::Unknown);
        assert_eq!(parse_creg("ERROR"), ModemStatus::Unknown);
        assert!(ModemStatus::Roaming.is_registered());
        assert!(!ModemStatus::Searching.is_registered());
    }

    #[test]
    fn test_parse_flags() {
        assert_eq!(parse_flags("0x1043\n"), Some(0x1043));
        assert_eq!(parse_flags("0x1002"), Some(0x1002));
        assert_eq!(parse_flags("junk"), None);
    }

    #[test]
    fn test_parse_mac() {
        let id = parse_mac("24:0a:c4:12:34:56\n").unwrap();
        assert_eq!(id.to_string(), "24:0A:C4:12:34:56");
        assert!(parse_mac("24:0a:c4").is_none());
        assert!(parse_mac("zz:0a:c4:12:34:56").is_none());
    }

    #[test]
    fn test_parse_proc_stat_name() {
        assert_eq!(parse_proc_stat_name("812 (smsd) S 1 812 812 0"), Some("smsd"));
        assert_eq!(parse_proc_stat_name("9 (kworker/0:1) I 2"), Some("kworker/0:1"));
        assert_eq!(parse_proc_stat_name("garbage"), None);
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "0 days 0h 0m 0s");
        assert_eq!(format_uptime(90_061), "1 days 1h 1m 1s");
    }

    fn fake_host(temp: &TempDir) -> (Config, LinuxProbe) {
        let config = Config::for_test(temp.path());
        let sys_net = temp.path().join("sys/class/net");
        let proc_root = temp.path().join("proc");
        fs::create_dir_all(sys_net.join("lo")).unwrap();
        fs::create_dir_all(proc_root.join("812")).unwrap();
        fs::create_dir_all(proc_root.join("self")).unwrap();
        let probe = LinuxProbe::new(&config).with_roots(&sys_net, &proc_root);
        (config, probe)
    }

    #[test]
    fn test_link_flags_from_sysfs() {
        let temp = TempDir::new().unwrap();
        let (_, probe) = fake_host(&temp);
        let flags = temp.path().join("sys/class/net/lo/flags");

        fs::write(&flags, "0x1043\n").unwrap();
        assert!(probe.link_up().unwrap());

        // up but not running
        fs::write(&flags, "0x1003\n").unwrap();
        assert!(!probe.link_up().unwrap());
    }

    #[test]
    fn test_missing_interface_is_an_error() {
        let temp = TempDir::new().unwrap();
        let (mut config, _) = fake_host(&temp);
        config.network_interface = "wlan9".to_string();
        let probe = LinuxProbe::new(&config)
            .with_roots(temp.path().join("sys/class/net"), temp.path().join("proc"));
        assert!(probe.link_up().is_err());
    }

    #[test]
    fn test_hub_id_from_sysfs() {
        let temp = TempDir::new().unwrap();
        let (_, probe) = fake_host(&temp);
        assert_eq!(probe.hub_id(), DeviceId::from_bytes([0; 6]));

        fs::write(temp.path().join("sys/class/net/lo/address"), "02:00:00:aa:bb:cc\n").unwrap();
        assert_eq!(probe.hub_id().to_string(), "02:00:00:AA:BB:CC");
    }

    #[test]
    fn test_daemon_liveness_from_procfs() {
        let temp = TempDir::new().unwrap();
        let (_, probe) = fake_host(&temp);
        assert!(!probe.sms_daemon_running());

        fs::write(temp.path().join("proc/812/stat"), "812 (smsd) S 1 812").unwrap();
        // non-numeric entries are skipped
        fs::write(temp.path().join("proc/self/stat"), "1 (smsd) S 0").unwrap();
        assert!(probe.sms_daemon_running());
    }

    #[test]
    fn test_modem_absent_without_nodes() {
        let temp = TempDir::new().unwrap();
        let (config, probe) = fake_host(&temp);
        assert_eq!(probe.modem_status(), ModemStatus::Absent);

        // Plain files are not ttys, so the exchange fails
        fs::write(&config.modem_data_node, "").unwrap();
        fs::write(&config.modem_control_node, "").unwrap();
        assert_eq!(probe.modem_status(), ModemStatus::ComsFailure);
    }

    #[test]
    fn test_uptime_from_procfs() {
        let temp = TempDir::new().unwrap();
        let (_, probe) = fake_host(&temp);
        fs::write(temp.path().join("proc/uptime"), "3725.42 1000.00\n").unwrap();
        assert_eq!(probe.uptime().unwrap(), "0 days 1h 2m 5s");
    }
}
