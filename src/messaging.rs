//! Text-message port
//!
//! Outbound texts go through the [`Messenger`] trait so the interpreter and
//! watchdogs can be driven with a fake in tests. The production side talks
//! to an smstools-style spool: one file per message in the outgoing
//! directory, and inbound files appearing in the incoming directory.

use crate::access::AccessControl;
use crate::commands::CommandQueue;
use crate::config::Config;
use crate::error::{Error, Result};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Outbound side of the text-message port
pub trait Messenger: Send + Sync {
    /// Queue `text` for `to`. Fails when the medium is unavailable;
    /// callers log and move on rather than retrying.
    fn send(&self, to: &str, text: &str) -> Result<()>;
}

/// Send `text` to the emergency contact, if one is configured.
/// Returns whether the message was handed to the messenger.
pub fn send_alert(messenger: &dyn Messenger, access: &AccessControl, text: &str) -> bool {
    let Some(to) = access.emergency_phone() else {
        debug!("No emergency phone configured, alert not sent");
        return false;
    };
    match messenger.send(to, text) {
        Ok(()) => true,
        Err(e) => {
            error!("Could not send alert to {}: {}", to, e);
            false
        }
    }
}

/// Writes outgoing messages into the spool directory
pub struct SpoolMessenger {
    outgoing_dir: PathBuf,
    modem_node: PathBuf,
    counter: AtomicU64,
}

impl SpoolMessenger {
    pub fn new(config: &Config) -> Self {
        Self {
            outgoing_dir: config.sms_outgoing_dir.clone(),
            modem_node: config.modem_data_node.clone(),
            counter: AtomicU64::new(0),
        }
    }

    /// Remove messages left over from a previous run
    pub fn clean_outgoing(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.outgoing_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            info!("Removing old SMS {}", entry.file_name().to_string_lossy());
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => error!("Failed to delete old SMS {}: {}", entry.path().display(), e),
            }
        }
        Ok(removed)
    }
}

impl Messenger for SpoolMessenger {
    fn send(&self, to: &str, text: &str) -> Result<()> {
        // Spooling without a modem would flood the recipient once it is
        // plugged back in
        if !self.modem_node.exists() {
            return Err(Error::Transport(format!(
                "modem not detected (no {}), discarding text message",
                self.modem_node.display()
            )));
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("sms_{}_{}", std::process::id(), n);

        // Stage next to the spool so the final rename stays on one filesystem
        let staging = self.outgoing_dir.parent().unwrap_or(Path::new("."));
        let mut temp = NamedTempFile::new_in(staging)?;
        write!(temp, "To: {}\n\n{}\n", to, text)?;
        temp.as_file().sync_all()?;
        temp.persist(self.outgoing_dir.join(&name))
            .map_err(|e| Error::Io(e.error))?;

        debug!(to = %to, file = %name, "Queued SMS");
        Ok(())
    }
}

/// Parse an inbound spool file: `From: <number>`, header lines up to a
/// blank line, then the message body.
pub fn parse_incoming(content: &str) -> Option<(String, String)> {
    let mut lines = content.lines();
    let from = lines.next()?.strip_prefix("From: ")?.trim().to_string();

    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
    }

    let text: String = lines.collect();
    Some((from, text))
}

/// Watches the incoming spool and feeds parsed messages to the command queue
pub struct SmsReceiver {
    incoming_dir: PathBuf,
}

impl SmsReceiver {
    pub fn new(config: &Config) -> Self {
        Self {
            incoming_dir: config.sms_incoming_dir.clone(),
        }
    }

    /// Start watching; the watch is registered before returning so setup
    /// errors reach the caller.
    pub fn spawn(self, queue: CommandQueue, running: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let (tx, rx) = mpsc::channel();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&self.incoming_dir, RecursiveMode::NonRecursive)?;
        info!("Watching {} for incoming SMS", self.incoming_dir.display());

        Ok(std::thread::spawn(move || {
            // Keep the watcher alive for the life of the thread
            let _watcher = watcher;
            while running.load(Ordering::Relaxed) {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(Ok(event)) => handle_event(&event, &queue),
                    Ok(Err(e)) => warn!("SMS watcher error: {}", e),
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("SMS receiver stopped");
        }))
    }
}

/// Finished writes and files moved into the spool are complete messages
fn completed_file(event: &Event) -> Option<&Path> {
    match event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write))
        | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.first().map(PathBuf::as_path)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().map(PathBuf::as_path)
        }
        _ => None,
    }
}

fn handle_event(event: &Event, queue: &CommandQueue) {
    let Some(path) = completed_file(event) else {
        return;
    };
    if let Some((from, text)) = read_incoming(path) {
        queue.enqueue(&from, &text);
    }
}

pub fn read_incoming(path: &Path) -> Option<(String, String)> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to read content of SMS \"{}\": {}", path.display(), e);
            return None;
        }
    };
    let parsed = parse_incoming(&content);
    match &parsed {
        Some(_) => info!("Parsed SMS file \"{}\"", path.display()),
        None => warn!("Ignoring malformed SMS file \"{}\"", path.display()),
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_incoming() {
        let content = "From: 3310203040506\nFrom_TOA: 91 international\nSent: 24-01-05 10:00:00\n\nall eco\n";
        let (from, text) = parse_incoming(content).unwrap();
        assert_eq!(from, "3310203040506");
        assert_eq!(text, "all eco");
    }

    #[test]
    fn test_parse_incoming_joins_body_lines() {
        let content = "From: 0612345678\n\nHEATER\n BOILER ON\n";
        let (_, text) = parse_incoming(content).unwrap();
        assert_eq!(text, "HEATER BOILER ON");
    }

    #[test]
    fn test_parse_incoming_requires_from() {
        assert!(parse_incoming("To: 0612345678\n\nhi\n").is_none());
        assert!(parse_incoming("").is_none());
    }

    #[test]
    fn test_spool_send_requires_modem() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        fs::create_dir_all(&config.sms_outgoing_dir).unwrap();
        let messenger = SpoolMessenger::new(&config);

        assert!(matches!(messenger.send("0612345678", "hi"), Err(Error::Transport(_))));
        assert_eq!(fs::read_dir(&config.sms_outgoing_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_spool_send_writes_file() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        fs::create_dir_all(&config.sms_outgoing_dir).unwrap();
        fs::write(&config.modem_data_node, "").unwrap();
        let messenger = SpoolMessenger::new(&config);

        messenger.send("0612345678", "PONG").unwrap();

        let files: Vec<_> = fs::read_dir(&config.sms_outgoing_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(fs::read_to_string(&files[0]).unwrap(), "To: 0612345678\n\nPONG\n");
    }

    #[test]
    fn test_clean_outgoing() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        fs::create_dir_all(&config.sms_outgoing_dir).unwrap();
        fs::write(config.sms_outgoing_dir.join("old1"), "x").unwrap();
        fs::write(config.sms_outgoing_dir.join("old2"), "x").unwrap();

        let messenger = SpoolMessenger::new(&config);
        assert_eq!(messenger.clean_outgoing().unwrap(), 2);
        assert_eq!(fs::read_dir(&config.sms_outgoing_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_completed_file_filter() {
        let path = PathBuf::from("/var/spool/sms/incoming/GSM1.abc");
        let closed = Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write)))
            .add_path(path.clone());
        assert_eq!(completed_file(&closed), Some(path.as_path()));

        let created = Event::new(EventKind::Create(notify::event::CreateKind::File))
            .add_path(path.clone());
        assert_eq!(completed_file(&created), None);
    }

    #[test]
    fn test_receiver_enqueues_written_file() {
        let temp = TempDir::new().unwrap();
        let config = Config::for_test(temp.path());
        fs::create_dir_all(&config.sms_incoming_dir).unwrap();

        let queue = CommandQueue::new();
        let running = Arc::new(AtomicBool::new(true));
        let handle = SmsReceiver::new(&config)
            .spawn(queue.clone(), Arc::clone(&running))
            .unwrap();

        fs::write(
            config.sms_incoming_dir.join("GSM1.xyz"),
            "From: 3310203040506\n\nping\n",
        )
        .unwrap();

        let mut received = Vec::new();
        for _ in 0..200 {
            received.extend(queue.take_all());
            if !received.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();

        assert_eq!(
            received.first(),
            Some(&("3310203040506".to_string(), "ping".to_string()))
        );
    }
}
