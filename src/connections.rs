//! Device connections
//!
//! Accepted sockets live in the [`ConnectionRegistry`] until they go quiet
//! for too long or the peer closes. The accept loop runs on its own thread,
//! so every access goes through one mutex and the lock is never held across
//! socket I/O.

use crate::error::{Error, Result};
use crate::protocol::FRAME_SIZE;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

/// How often the accept loop re-checks the running flag
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct DeviceConnection {
    id: ConnectionId,
    stream: Arc<TcpStream>,
    peer: Option<SocketAddr>,
    last_activity: Instant,
}

#[derive(Default)]
struct Inner {
    next_id: ConnectionId,
    connections: Vec<DeviceConnection>,
}

/// A complete frame read from a device socket
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub connection: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub bytes: [u8; FRAME_SIZE],
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of a freshly accepted socket
    pub fn admit(&self, stream: TcpStream) -> Result<ConnectionId> {
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr().ok();

        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.connections.push(DeviceConnection {
            id,
            stream: Arc::new(stream),
            peer,
            last_activity: Instant::now(),
        });
        debug!(connection = id, peer = ?peer, "Admitted device connection");
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().connections.iter().any(|c| c.id == id)
    }

    /// Record that a valid frame arrived on `id`
    pub fn touch(&self, id: ConnectionId, now: Instant) {
        if let Some(conn) = self.lock().connections.iter_mut().find(|c| c.id == id) {
            conn.last_activity = now;
        }
    }

    /// Close and drop connections idle for at least `max_idle`
    pub fn reap_stale(&self, now: Instant, max_idle: Duration) -> usize {
        let mut inner = self.lock();
        let before = inner.connections.len();
        inner.connections.retain(|conn| {
            let idle = now.saturating_duration_since(conn.last_activity);
            if idle >= max_idle {
                info!(connection = conn.id, peer = ?conn.peer, "Removing stale connection");
                let _ = conn.stream.shutdown(Shutdown::Both);
                false
            } else {
                true
            }
        });
        before - inner.connections.len()
    }

    /// Read at most one frame from every readable socket, without blocking.
    ///
    /// A zero-length read means the peer closed and the connection is
    /// dropped. Partial frames are discarded: devices always write whole
    /// frames.
    pub fn poll_readable(&self) -> Vec<InboundFrame> {
        let sockets: Vec<(ConnectionId, Arc<TcpStream>, Option<SocketAddr>)> = self
            .lock()
            .connections
            .iter()
            .map(|c| (c.id, Arc::clone(&c.stream), c.peer))
            .collect();

        let mut frames = Vec::new();
        for (id, stream, peer) in sockets {
            let mut buf = [0u8; FRAME_SIZE];
            match (&*stream).read(&mut buf) {
                Ok(0) => {
                    debug!(connection = id, peer = ?peer, "Device closed connection");
                    self.evict(id);
                }
                Ok(n) if n == FRAME_SIZE => frames.push(InboundFrame {
                    connection: id,
                    peer,
                    bytes: buf,
                }),
                Ok(n) => {
                    debug!(connection = id, len = n, "Discarding partial frame");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(connection = id, peer = ?peer, "Read failed, dropping connection: {}", e);
                    self.evict(id);
                }
            }
        }
        frames
    }

    /// Write a whole frame back on connection `id`
    pub fn send(&self, id: ConnectionId, frame: &[u8]) -> Result<()> {
        let stream = self
            .lock()
            .connections
            .iter()
            .find(|c| c.id == id)
            .map(|c| Arc::clone(&c.stream))
            .ok_or_else(|| Error::Transport(format!("connection {} is gone", id)))?;

        let mut sent = 0;
        while sent < frame.len() {
            match (&*stream).write(&frame[sent..]) {
                Ok(0) => {
                    return Err(Error::Transport(format!(
                        "connection {} closed after {} of {} bytes",
                        id,
                        sent,
                        frame.len()
                    )))
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn evict(&self, id: ConnectionId) {
        let mut inner = self.lock();
        if let Some(pos) = inner.connections.iter().position(|c| c.id == id) {
            let conn = inner.connections.remove(pos);
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
    }

    pub fn close_all(&self) {
        let mut inner = self.lock();
        for conn in inner.connections.drain(..) {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
    }
}

/// Accept loop handing device sockets to the registry
pub struct DeviceListener {
    listener: TcpListener,
}

impl DeviceListener {
    pub fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop on its own thread until `running` is cleared
    pub fn spawn(self, registry: ConnectionRegistry, running: Arc<AtomicBool>) -> JoinHandle<()> {
        std::thread::spawn(move || self.run(&registry, &running))
    }

    fn run(&self, registry: &ConnectionRegistry, running: &AtomicBool) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Device server listening on {}", addr);
        }

        while running.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!("New device connection from {}", addr);
                    if let Err(e) = registry.admit(stream) {
                        warn!("Could not admit connection from {}: {}", addr, e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        info!("Device server stopped");
    }
}
