use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::session::Role;

/// Idle cutoff for a signaling session with no traffic in either direction.
pub const SIGNALING_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Ephemeral client/device association scoping one media negotiation.
#[derive(Debug, Clone)]
pub struct SignalingSession {
    pub token: String,
    pub client_id: String,
    pub device_id: String,
    created_at: Instant,
    last_touched: Instant,
}

impl SignalingSession {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Tracks in-flight media negotiations so out-of-order signaling can be
/// scoped and torn down when either endpoint goes away.
#[derive(Default)]
pub struct SignalingBroker {
    sessions: DashMap<String, SignalingSession>,
}

impl SignalingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for an offer, minting a token when the client did not
    /// supply one. Re-offering with the same token replaces the session.
    pub fn open(&self, client_id: &str, device_id: &str, token: Option<String>) -> String {
        let token = token
            .unwrap_or_else(|| format!("{client_id}-{device_id}-{}", Utc::now().timestamp_millis()));
        let now = Instant::now();
        self.sessions.insert(
            token.clone(),
            SignalingSession {
                token: token.clone(),
                client_id: client_id.to_string(),
                device_id: device_id.to_string(),
                created_at: now,
                last_touched: now,
            },
        );
        info!(client_id, device_id, token = %token, "signaling session opened");
        token
    }

    /// Refresh the idle clock for every session between this pair.
    pub fn touch(&self, client_id: &str, device_id: &str) {
        let now = Instant::now();
        for mut entry in self.sessions.iter_mut() {
            if entry.client_id == client_id && entry.device_id == device_id {
                entry.last_touched = now;
            }
        }
    }

    /// Tear down every session between this pair (a `close` subtype relay).
    pub fn close_pair(&self, client_id: &str, device_id: &str) -> usize {
        let tokens: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.client_id == client_id && e.device_id == device_id)
            .map(|e| e.token.clone())
            .collect();
        for token in &tokens {
            self.sessions.remove(token);
            debug!(token = %token, "signaling session closed");
        }
        tokens.len()
    }

    /// One endpoint disconnected; its negotiations expire immediately.
    pub fn drop_endpoint(&self, role: Role, id: &str) -> usize {
        let tokens: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| match role {
                Role::Device => e.device_id == id,
                Role::Client => e.client_id == id,
            })
            .map(|e| e.token.clone())
            .collect();
        for token in &tokens {
            self.sessions.remove(token);
        }
        if !tokens.is_empty() {
            debug!(role = %role, id, dropped = tokens.len(), "signaling sessions dropped");
        }
        tokens.len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now(), SIGNALING_IDLE_TIMEOUT)
    }

    fn sweep_at(&self, now: Instant, timeout: Duration) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| {
                now.checked_duration_since(e.last_touched)
                    .is_some_and(|idle| idle >= timeout)
            })
            .map(|e| e.token.clone())
            .collect();
        for token in &expired {
            self.sessions.remove(token);
            debug!(token = %token, "signaling session idle-expired");
        }
        expired.len()
    }

    pub fn get(&self, token: &str) -> Option<SignalingSession> {
        self.sessions.get(token).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
