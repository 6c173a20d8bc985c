//! Periodic health checks, sweeps and the boot notice
//!
//! Every check runs from the main cycle when its [`Schedule`] comes due, so
//! a slow or failing check never holds up the others for more than one
//! cycle. Transient failures only count towards a [`FailureStreak`]; the
//! streak has to reach its threshold before anything escalates.

use crate::config::{
    BOOT_NOTICE_DELAY, CONNECTION_MAX_IDLE, DAEMON_CHECK_PERIOD, DAEMON_FAILURE_THRESHOLD,
    DEVICE_LOST_THRESHOLD, FALLBACK_MODE, LINK_CHECK_PERIOD, LINK_FAILURE_THRESHOLD,
    LOST_SWEEP_PERIOD, MODEM_CHECK_PERIOD, MODEM_FAILURE_THRESHOLD, STALE_SWEEP_PERIOD,
};
use crate::connections::ConnectionRegistry;
use crate::heater::{format_duration, LostDevice};
use crate::messaging::{send_alert, Messenger};
use crate::probes::SystemProbe;
use crate::state::HubState;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Interval timer polled from the main cycle
#[derive(Debug, Clone)]
pub struct Schedule {
    period: Duration,
    next: Option<Instant>,
    repeat: bool,
}

impl Schedule {
    /// First due one `period` after `now`, then every `period`
    pub fn every(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next: Some(now + period),
            repeat: true,
        }
    }

    /// Due once, `delay` after `now`
    pub fn once(delay: Duration, now: Instant) -> Self {
        Self {
            period: delay,
            next: Some(now + delay),
            repeat: false,
        }
    }

    /// True when the timer fired; missed periods are not replayed
    pub fn due(&mut self, now: Instant) -> bool {
        match self.next {
            Some(next) if now >= next => {
                self.next = self.repeat.then(|| now + self.period);
                true
            }
            _ => false,
        }
    }
}

/// Consecutive failures of one check
#[derive(Debug, Clone)]
pub struct FailureStreak {
    count: u32,
    threshold: u32,
}

impl FailureStreak {
    pub fn new(threshold: u32) -> Self {
        Self { count: 0, threshold }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// True exactly once, when the streak reaches the threshold
    pub fn record_failure(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.count == self.threshold
    }

    /// Reset the streak, returning how many failures it held
    pub fn record_success(&mut self) -> u32 {
        std::mem::replace(&mut self.count, 0)
    }

    /// Whether a streak of `failures` had escalated
    pub fn escalated(&self, failures: u32) -> bool {
        failures >= self.threshold
    }
}

pub struct Watchdogs {
    probe: Arc<dyn SystemProbe>,
    messenger: Arc<dyn Messenger>,
    link_timer: Schedule,
    modem_timer: Schedule,
    daemon_timer: Schedule,
    stale_timer: Schedule,
    lost_timer: Schedule,
    boot_timer: Schedule,
    link: FailureStreak,
    modem: FailureStreak,
    daemon: FailureStreak,
}

impl Watchdogs {
    pub fn new(probe: Arc<dyn SystemProbe>, messenger: Arc<dyn Messenger>, now: Instant) -> Self {
        Self {
            probe,
            messenger,
            link_timer: Schedule::every(LINK_CHECK_PERIOD, now),
            modem_timer: Schedule::every(MODEM_CHECK_PERIOD, now),
            daemon_timer: Schedule::every(DAEMON_CHECK_PERIOD, now),
            stale_timer: Schedule::every(STALE_SWEEP_PERIOD, now),
            lost_timer: Schedule::every(LOST_SWEEP_PERIOD, now),
            boot_timer: Schedule::once(BOOT_NOTICE_DELAY, now),
            link: FailureStreak::new(LINK_FAILURE_THRESHOLD),
            modem: FailureStreak::new(MODEM_FAILURE_THRESHOLD),
            daemon: FailureStreak::new(DAEMON_FAILURE_THRESHOLD),
        }
    }

    /// Run whatever is due at `now`
    pub fn tick(
        &mut self,
        now: Instant,
        wall_now: DateTime<Utc>,
        state: &mut HubState,
        registry: &ConnectionRegistry,
    ) {
        if self.link_timer.due(now) {
            self.check_link(state);
        }
        if self.modem_timer.due(now) {
            self.check_modem(state);
        }
        if self.daemon_timer.due(now) {
            self.check_daemon(state);
        }
        if self.stale_timer.due(now) {
            let removed = registry.reap_stale(now, CONNECTION_MAX_IDLE);
            if removed > 0 {
                debug!("Removed {} stale connection(s)", removed);
            }
        }
        if self.lost_timer.due(now) {
            self.sweep_lost(state, wall_now);
        }
        if self.boot_timer.due(now) {
            self.boot_notice(state);
        }
    }

    pub fn check_link(&mut self, state: &HubState) {
        match self.probe.link_up() {
            Ok(true) => {
                let failures = self.link.record_success();
                if failures > 0 {
                    info!(failures, "Network connection restored");
                    self.alert(
                        state,
                        "Hub restored network connection. System is now running ok.",
                    );
                }
            }
            Ok(false) => {
                debug!(failures = self.link.count() + 1, "Network link down");
                if self.link.record_failure() {
                    let span = format_duration(LINK_CHECK_PERIOD * LINK_FAILURE_THRESHOLD);
                    error!("Lost network connection for past {}", span);
                    self.alert(
                        state,
                        &format!(
                            "Error! Hub lost network connection for past {}. \
                             Heaters cannot be controlled (they will switch to {} mode automatically).",
                            span, FALLBACK_MODE
                        ),
                    );
                }
            }
            Err(e) => error!("Cannot check connection status of network interface: {}", e),
        }
    }

    pub fn check_modem(&mut self, state: &mut HubState) {
        let status = self.probe.modem_status();
        if status.is_registered() {
            let failures = self.modem.record_success();
            if self.modem.escalated(failures) {
                self.announce_recovery(state, "modem");
            }
            return;
        }

        warn!(failures = self.modem.count() + 1, "Modem check failed: {}", status.describe());
        if self.modem.record_failure() {
            let span = format_duration(MODEM_CHECK_PERIOD * MODEM_FAILURE_THRESHOLD);
            error!("Modem {} for the last {}", status.describe(), span);
            self.fall_back(state, "modem failure");
        }
    }

    pub fn check_daemon(&mut self, state: &mut HubState) {
        if self.probe.sms_daemon_running() {
            let failures = self.daemon.record_success();
            if self.daemon.escalated(failures) {
                self.announce_recovery(state, "SMS daemon");
            }
            return;
        }

        warn!(failures = self.daemon.count() + 1, "SMS daemon not running");
        if self.daemon.record_failure() {
            let span = format_duration(DAEMON_CHECK_PERIOD * DAEMON_FAILURE_THRESHOLD);
            error!("SMS daemon not running for the last {}", span);
            self.fall_back(state, "SMS daemon not running");
        }
    }

    /// Drop devices silent for too long and report them in one message
    pub fn sweep_lost(&mut self, state: &mut HubState, wall_now: DateTime<Utc>) -> Vec<LostDevice> {
        let lost = state.heaters.reap_lost(wall_now, DEVICE_LOST_THRESHOLD);
        if !lost.is_empty() {
            self.alert(state, &lost_devices_alert(&lost));
        }
        lost
    }

    pub fn boot_notice(&self, state: &HubState) {
        let mut msg = format!(
            "INFO! Hub software started\nDefault heater state: {}\n",
            state.heaters.default_mode()
        );
        for (name, mode) in state.heaters.overrides() {
            msg.push_str(&format!("Heater {} state: {}\n", name, mode));
        }
        self.alert(state, &msg);
    }

    fn fall_back(&self, state: &mut HubState, cause: &str) {
        state.set_all(FALLBACK_MODE);
        info!("Setting all heaters to {} mode due to {}", FALLBACK_MODE, cause);
    }

    fn announce_recovery(&self, state: &HubState, what: &str) {
        let msg = format!(
            "INFO! All heaters were set to {} mode due to earlier {} errors",
            FALLBACK_MODE, what
        );
        info!("{}", msg);
        self.alert(state, &msg);
    }

    fn alert(&self, state: &HubState, text: &str) {
        send_alert(self.messenger.as_ref(), &state.access, text);
    }
}

pub fn lost_devices_alert(lost: &[LostDevice]) -> String {
    let names: Vec<String> = lost.iter().map(ToString::to_string).collect();
    if lost.len() == 1 {
        format!("WARNING! Lost connection with one device: {}", names.join(", "))
    } else {
        format!(
            "WARNING! Lost connection with {} devices: {}",
            lost.len(),
            names.join(", ")
        )
    }
}
