use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::protocol::Envelope;

pub const DEFAULT_QUEUE_DEPTH: usize = 256;
pub const WRITE_DEADLINE: Duration = Duration::from_secs(2);
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Consecutive saturated enqueues before a session is considered wedged and
/// told to drain.
const WEDGE_STRIKES: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Device,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Device => "device",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Registering,
    Active,
    Draining,
    Closed,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Lifecycle::Registering,
            1 => Lifecycle::Active,
            2 => Lifecycle::Draining,
            _ => Lifecycle::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Superseded,
    HeartbeatTimeout,
    TransportError,
    QueueOverflow,
    ShuttingDown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::Superseded => "superseded",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::TransportError => "transport_error",
            CloseReason::QueueOverflow => "queue_overflow",
            CloseReason::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("session is not accepting frames")]
    NotActive,
    #[error("outbound queue is saturated")]
    Saturated,
}

/// A single connected endpoint.
///
/// The session owns the outbound queue and lifecycle state; socket I/O lives
/// in the transport adapter tasks that hold the session.
pub struct Session {
    id: String,
    role: Role,
    conn: Uuid,
    lifecycle: AtomicU8,
    close_reason: Mutex<Option<CloseReason>>,
    close_signal: Notify,
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    last_activity: Mutex<Instant>,
    last_ping: Mutex<Instant>,
    ping_outstanding: AtomicBool,
    overflow_strikes: AtomicU32,
    name: Option<String>,
    kind: Option<String>,
    first_seen: DateTime<Utc>,
    watched: Mutex<HashSet<String>>,
}

impl Session {
    pub fn new(
        role: Role,
        id: impl Into<String>,
        queue_depth: usize,
        name: Option<String>,
        kind: Option<String>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let now = Instant::now();
        Arc::new(Self {
            id: id.into(),
            role,
            conn: Uuid::new_v4(),
            lifecycle: AtomicU8::new(Lifecycle::Registering as u8),
            close_reason: Mutex::new(None),
            close_signal: Notify::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            last_activity: Mutex::new(now),
            last_ping: Mutex::new(now),
            ping_outstanding: AtomicBool::new(false),
            overflow_strikes: AtomicU32::new(0),
            name,
            kind,
            first_seen: Utc::now(),
            watched: Mutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Per-connection token, distinguishes reconnects of the same id in logs.
    pub fn conn(&self) -> Uuid {
        self.conn
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Registration linearization point; only the registry calls this.
    pub(crate) fn activate(&self) {
        let _ = self.lifecycle.compare_exchange(
            Lifecycle::Registering as u8,
            Lifecycle::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Best-effort enqueue onto the bounded outbound queue.
    ///
    /// `Saturated` drops exactly the offered frame; a long run of consecutive
    /// saturations marks the session wedged and starts its drain.
    pub fn enqueue(&self, frame: Envelope) -> Result<(), EnqueueError> {
        if self.lifecycle() != Lifecycle::Active {
            return Err(EnqueueError::NotActive);
        }
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.overflow_strikes.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                let strikes = self.overflow_strikes.fetch_add(1, Ordering::Relaxed) + 1;
                if strikes >= WEDGE_STRIKES {
                    self.close(CloseReason::QueueOverflow);
                }
                Err(EnqueueError::Saturated)
            }
            Err(TrySendError::Closed(_)) => Err(EnqueueError::NotActive),
        }
    }

    /// Idempotent close. The first caller's reason wins; the write flow is
    /// woken to drain pending frames and release the transport.
    pub fn close(&self, reason: CloseReason) -> bool {
        loop {
            let current = self.lifecycle.load(Ordering::Acquire);
            if current >= Lifecycle::Draining as u8 {
                return false;
            }
            if self
                .lifecycle
                .compare_exchange(
                    current,
                    Lifecycle::Draining as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        self.close_reason.lock().get_or_insert(reason);
        self.close_signal.notify_one();
        true
    }

    /// Terminal transition, called by the write flow once the transport is
    /// released. No further I/O happens after this.
    pub fn finish(&self) {
        self.lifecycle
            .store(Lifecycle::Closed as u8, Ordering::Release);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolves once `close` has been called. There is a single write flow
    /// per session; the stored permit covers a close that lands first.
    pub async fn wait_close(&self) {
        if self.lifecycle() >= Lifecycle::Draining {
            return;
        }
        self.close_signal.notified().await;
    }

    /// Hands the outbound queue receiver to the write flow, exactly once.
    pub fn take_writer(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.rx.lock().take()
    }

    pub fn mark_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn begin_ping(&self) {
        *self.last_ping.lock() = Instant::now();
        self.ping_outstanding.store(true, Ordering::Release);
    }

    pub fn clear_ping(&self) {
        self.ping_outstanding.store(false, Ordering::Release);
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_outstanding.load(Ordering::Acquire)
    }

    pub fn since_last_ping(&self) -> Duration {
        self.last_ping.lock().elapsed()
    }

    /// Record this client's interest in a device.
    pub fn watch(&self, device_id: &str) {
        self.watched.lock().insert(device_id.to_string());
    }

    pub fn watches(&self, device_id: &str) -> bool {
        self.watched.lock().contains(device_id)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("conn", &self.conn)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
