//! The hub's processing cycle
//!
//! One [`Hub`] owns the heater directory and access state. Worker threads
//! only touch the connection registry and the command queue; everything
//! else happens here, one cycle at a time: device frames, queued texts,
//! then whatever watchdog is due.

use crate::commands::CommandQueue;
use crate::config::Config;
use crate::connections::{ConnectionRegistry, InboundFrame};
use crate::heater::CounterCheck;
use crate::interpreter::Interpreter;
use crate::messaging::{send_alert, Messenger};
use crate::persistence::StateStore;
use crate::probes::SystemProbe;
use crate::protocol::{self, DeviceId, Header, Message};
use crate::state::HubState;
use crate::watchdog::Watchdogs;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub struct Hub {
    registry: ConnectionRegistry,
    queue: CommandQueue,
    state: HubState,
    interpreter: Interpreter,
    watchdogs: Watchdogs,
    messenger: Arc<dyn Messenger>,
    hub_id: DeviceId,
    message_counter: u64,
}

impl Hub {
    pub fn new(
        config: &Config,
        registry: ConnectionRegistry,
        queue: CommandQueue,
        messenger: Arc<dyn Messenger>,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        let state = HubState::load(StateStore::new(&config.state_file));
        let hub_id = probe.hub_id();
        info!("Hub link-layer address {}", hub_id);

        let interpreter = Interpreter::new(Arc::clone(&messenger), Arc::clone(&probe), &config.pin);
        let watchdogs = Watchdogs::new(probe, Arc::clone(&messenger), Instant::now());

        Self {
            registry,
            queue,
            state,
            interpreter,
            watchdogs,
            messenger,
            hub_id,
            // Random high half so replies after a restart don't repeat counters
            message_counter: u64::from(rand::random::<u32>()) << 32,
        }
    }

    pub fn state(&self) -> &HubState {
        &self.state
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn hub_id(&self) -> DeviceId {
        self.hub_id
    }

    /// One pass of the main cycle; never blocks
    pub fn process(&mut self) {
        self.process_at(Instant::now(), Utc::now());
    }

    /// [`Hub::process`] with explicit clocks
    pub fn process_at(&mut self, now: Instant, wall_now: DateTime<Utc>) {
        for frame in self.registry.poll_readable() {
            self.handle_frame(frame, now, wall_now);
        }

        self.interpreter.drain(&self.queue, &mut self.state);

        self.watchdogs
            .tick(now, wall_now, &mut self.state, &self.registry);
    }

    fn handle_frame(&mut self, frame: InboundFrame, now: Instant, wall_now: DateTime<Utc>) {
        let message = match protocol::decode(&frame.bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection = frame.connection, peer = ?frame.peer, "Ignoring frame: {}", e);
                return;
            }
        };

        match message {
            Message::StateRequest { header, name } => {
                self.registry.touch(frame.connection, now);
                self.handle_state_request(&frame, &header, name.as_deref(), wall_now);
            }
            Message::StateReply { header, .. } => {
                let name = self
                    .state
                    .heaters
                    .get(header.device_id)
                    .and_then(|rec| rec.name.clone());
                error!(
                    device = %header.device_id,
                    name = ?name,
                    "Ignoring state reply sent by a device"
                );
            }
        }
    }

    fn handle_state_request(
        &mut self,
        frame: &InboundFrame,
        header: &Header,
        name: Option<&str>,
        wall_now: DateTime<Utc>,
    ) {
        debug!(device = %header.device_id, name = ?name, "Received heater state request");

        let outcome = self.state.heaters.handle_request(
            header.device_id,
            name,
            header.counter,
            frame.peer.map(|p| p.ip()),
            wall_now,
        );

        if let CounterCheck::Rebooted { previous } = outcome.counter {
            let device = describe_device(header.device_id, name);
            warn!(
                previous,
                counter = header.counter,
                "It seems that device {} rebooted a few minutes ago",
                device
            );
            send_alert(
                self.messenger.as_ref(),
                &self.state.access,
                &format!("Warning!\nDevice {} probably rebooted a few minutes ago.", device),
            );
        }

        let reply = protocol::encode_state_reply(self.hub_id, self.message_counter, outcome.mode);
        self.message_counter = self.message_counter.wrapping_add(1);

        if let Err(e) = self.registry.send(frame.connection, &reply) {
            warn!(device = %header.device_id, "Could not send state reply: {}", e);
            self.registry.evict(frame.connection);
        }
    }
}

/// `NAME MAC=AA:BB:...` or just the address for anonymous devices
fn describe_device(id: DeviceId, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{} MAC={}", name, id),
        None => id.to_string(),
    }
}
