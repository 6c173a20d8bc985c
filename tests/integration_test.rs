//! Integration tests for the heater hub
//!
//! These drive a real hub over loopback TCP with scripted host probes and a
//! recording SMS sender.

use assert_cmd::Command;
use chrono::{Duration as ChronoDuration, Utc};
use heater_hub::commands::CommandQueue;
use heater_hub::config::{Config, LOST_SWEEP_PERIOD};
use heater_hub::connections::{ConnectionRegistry, DeviceListener};
use heater_hub::heater::HeaterMode;
use heater_hub::hub::Hub;
use heater_hub::messaging::Messenger;
use heater_hub::persistence::StateStore;
use heater_hub::probes::{ModemStatus, SystemProbe};
use heater_hub::protocol::{self, DeviceId, Message, FRAME_SIZE};
use heater_hub::state::HubState;
use heater_hub::Result;
use predicates::prelude::*;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const OPERATOR: &str = "3310203040506";
const EMERGENCY: &str = "0612345678";
const HUB_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0xAA, 0xBB, 0xCC];

#[derive(Default)]
struct RecordingMessenger {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingMessenger {
    fn texts_to(&self, to: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == to)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

impl Messenger for RecordingMessenger {
    fn send(&self, to: &str, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push((to.to_string(), text.to_string()));
        Ok(())
    }
}

/// Host where everything is healthy
struct HealthyHost;

impl SystemProbe for HealthyHost {
    fn link_up(&self) -> Result<bool> {
        Ok(true)
    }
    fn modem_status(&self) -> ModemStatus {
        ModemStatus::Registered
    }
    fn sms_daemon_running(&self) -> bool {
        true
    }
    fn hub_id(&self) -> DeviceId {
        DeviceId::from_bytes(HUB_MAC)
    }
    fn public_ip(&self) -> Result<String> {
        Ok("203.0.113.7".to_string())
    }
    fn uptime(&self) -> Result<String> {
        Ok("0 days 0h 1m 0s".to_string())
    }
    fn wifi_report(&self) -> Result<String> {
        Ok(String::new())
    }
    fn recent_logs(&self) -> Result<String> {
        Ok(String::new())
    }
    fn reboot(&self) -> Result<()> {
        Ok(())
    }
}

struct TestHub {
    _temp: TempDir,
    config: Config,
    hub: Hub,
    messenger: Arc<RecordingMessenger>,
    running: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    port: u16,
}

impl TestHub {
    fn start() -> Self {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        let registry = ConnectionRegistry::new();
        let running = Arc::new(AtomicBool::new(true));

        let listener = DeviceListener::bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = listener.spawn(registry.clone(), Arc::clone(&running));

        let messenger = Arc::new(RecordingMessenger::default());
        let hub = Hub::new(
            &config,
            registry,
            CommandQueue::new(),
            messenger.clone(),
            Arc::new(HealthyHost),
        );

        Self {
            _temp: temp,
            config,
            hub,
            messenger,
            running,
            listener: Some(handle),
            port,
        }
    }

    fn connect(&mut self) -> TcpStream {
        let before = self.hub.registry().len();
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        for _ in 0..200 {
            if self.hub.registry().len() > before {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(self.hub.registry().len(), before + 1);
        stream
    }

    fn sms(&mut self, from: &str, text: &str) {
        self.hub.queue().enqueue(from, text);
        self.hub.process();
    }

    /// Send a state request and cycle the hub until the reply arrives
    fn request(&mut self, stream: &mut TcpStream, id: DeviceId, counter: u64, name: Option<&str>) -> Message {
        stream
            .write_all(&protocol::encode_state_request(id, counter, name))
            .unwrap();

        let mut buf = [0u8; FRAME_SIZE];
        let mut got = 0;
        for _ in 0..200 {
            self.hub.process();
            match stream.read(&mut buf[got..]) {
                Ok(0) => panic!("hub closed the connection"),
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => panic!("read failed: {}", e),
            }
            if got == FRAME_SIZE {
                return protocol::decode(&buf).unwrap();
            }
        }
        panic!("no reply from hub");
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
        self.hub.registry().close_all();
    }
}

fn reply_mode(message: &Message) -> HeaterMode {
    match message {
        Message::StateReply { mode_code, .. } => HeaterMode::from_code(*mode_code).unwrap(),
        other => panic!("expected a state reply, got {:?}", other),
    }
}

#[test]
fn test_device_gets_default_then_override() {
    let mut t = TestHub::start();
    let mut device = t.connect();
    let id = DeviceId::from_bytes([0x24, 0x0A, 0xC4, 0x00, 0x00, 0x01]);

    let reply = t.request(&mut device, id, 10, Some("boiler"));
    assert_eq!(reply_mode(&reply), HeaterMode::Defrost);
    assert_eq!(reply.header().device_id, DeviceId::from_bytes(HUB_MAC));

    t.sms(OPERATOR, "HEATER BOILER ON");
    let reply = t.request(&mut device, id, 11, Some("BOILER"));
    assert_eq!(reply_mode(&reply), HeaterMode::Comfort);

    // an anonymous device follows the default
    let reply = t.request(&mut device, DeviceId::from_bytes([0, 0, 0, 0, 0, 7]), 1, None);
    assert_eq!(reply_mode(&reply), HeaterMode::Defrost);

    let record = t.hub.state().heaters.get(id).unwrap();
    assert_eq!(record.name.as_deref(), Some("BOILER"));
    assert_eq!(record.mode, HeaterMode::Comfort);
    assert!(record.last_address.unwrap().is_loopback());
}

#[test]
fn test_reply_counters_increase() {
    let mut t = TestHub::start();
    let mut device = t.connect();
    let id = DeviceId::from_bytes([0, 0, 0, 0, 0, 1]);

    let first = t.request(&mut device, id, 1, None).header().counter;
    let second = t.request(&mut device, id, 2, None).header().counter;
    assert_eq!(second, first.wrapping_add(1));
}

#[test]
fn test_reboot_alert_fires_once() {
    let mut t = TestHub::start();
    t.sms(OPERATOR, &format!("SET EMERGENCY PHONE 1234 {}", EMERGENCY));
    let mut device = t.connect();
    let id = DeviceId::from_bytes([0x24, 0x0A, 0xC4, 0x00, 0x00, 0x02]);

    t.request(&mut device, id, 100, Some("LOFT"));
    t.request(&mut device, id, 103, Some("LOFT"));
    assert!(t.messenger.texts_to(EMERGENCY).is_empty());

    // counter re-seeded
    t.request(&mut device, id, 9_000, Some("LOFT"));
    t.request(&mut device, id, 9_001, Some("LOFT"));

    assert_eq!(
        t.messenger.texts_to(EMERGENCY),
        vec!["Warning!\nDevice LOFT MAC=24:0A:C4:00:00:02 probably rebooted a few minutes ago."]
    );
}

#[test]
fn test_bad_frames_keep_connection() {
    let mut t = TestHub::start();
    let mut device = t.connect();
    let id = DeviceId::from_bytes([0, 0, 0, 0, 0, 3]);

    let mut wrong_version = protocol::encode_state_request(id, 1, None);
    wrong_version[0] = 9;
    device.write_all(&wrong_version).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    t.hub.process();
    assert!(t.hub.state().heaters.get(id).is_none());
    assert_eq!(t.hub.registry().len(), 1);

    let reply = t.request(&mut device, id, 2, None);
    assert_eq!(reply_mode(&reply), HeaterMode::Defrost);
}

#[test]
fn test_reply_and_unknown_frames_are_ignored() {
    let mut t = TestHub::start();
    let mut device = t.connect();
    let id = DeviceId::from_bytes([0, 0, 0, 0, 0, 4]);

    let reply_frame = protocol::encode_state_reply(id, 1, HeaterMode::Comfort);
    let mut unknown_type = protocol::encode_state_request(id, 2, Some("SHED"));
    unknown_type[1] = 7;
    for frame in [reply_frame, unknown_type] {
        device.write_all(&frame).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        t.hub.process();
    }

    let mut buf = [0u8; FRAME_SIZE];
    match device.read(&mut buf) {
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
        other => panic!("expected no reply, got {:?}", other),
    }
    assert!(t.hub.state().heaters.get(id).is_none());
    assert!(t.hub.state().heaters.records().is_empty());
    assert_eq!(t.hub.registry().len(), 1);
}

#[test]
fn test_lost_devices_reported_in_one_alert() {
    let mut t = TestHub::start();
    t.sms(OPERATOR, &format!("SET EMERGENCY PHONE 1234 {}", EMERGENCY));
    let mut device = t.connect();

    t.request(&mut device, DeviceId::from_bytes([0, 0, 0, 0, 0, 1]), 1, Some("GARAGE"));
    t.request(&mut device, DeviceId::from_bytes([0, 0, 0, 0, 0, 2]), 1, Some("LOFT"));

    let later = Instant::now() + LOST_SWEEP_PERIOD;
    t.hub.process_at(later, Utc::now() + ChronoDuration::hours(25));

    let lost: Vec<String> = t
        .messenger
        .texts_to(EMERGENCY)
        .into_iter()
        .filter(|m| m.contains("Lost connection"))
        .collect();
    assert_eq!(lost, vec!["WARNING! Lost connection with 2 devices: GARAGE, LOFT"]);
    assert!(t.hub.state().heaters.records().is_empty());
    // silent for an hour, so the socket went too
    assert!(t.hub.registry().is_empty());
}

#[test]
fn test_sms_commands_are_persisted() {
    let mut t = TestHub::start();
    t.sms(OPERATOR, "ALL ECO");
    t.sms(OPERATOR, &format!("ADD PHONE 1234 {}", OPERATOR));
    t.sms(OPERATOR, "HEATER GARAGE OFF");

    let reloaded = HubState::load(StateStore::new(&t.config.state_file));
    assert_eq!(reloaded.heaters.default_mode(), HeaterMode::Eco);
    assert_eq!(reloaded.heaters.effective_mode(Some("GARAGE")), HeaterMode::Off);
    assert!(reloaded.access.is_whitelisted(OPERATOR));
}

#[test]
fn test_cli_version_exits_zero() {
    Command::cargo_bin("heater-hub")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("heater-hub"));
}

#[test]
fn test_cli_help_lists_port_flag() {
    Command::cargo_bin("heater-hub")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--device-server-port"));
}
