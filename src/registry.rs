use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::protocol::{DeviceEntry, Envelope, LinkStatus};
use crate::session::{CloseReason, EnqueueError, Lifecycle, Role, Session};
use crate::signaling::SignalingBroker;
use crate::telemetry::TelemetryStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// In-memory directory of connected endpoints.
///
/// Owns the telemetry store and signaling broker so that device lifecycle
/// events can drive both without the transport layer's involvement.
pub struct SessionRegistry {
    devices: DashMap<String, Arc<Session>>,
    clients: DashMap<String, Arc<Session>>,
    telemetry: TelemetryStore,
    signaling: SignalingBroker,
}

impl SessionRegistry {
    pub fn new(telemetry_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            devices: DashMap::new(),
            clients: DashMap::new(),
            telemetry: TelemetryStore::new(telemetry_capacity),
            signaling: SignalingBroker::new(),
        })
    }

    pub fn telemetry(&self) -> &TelemetryStore {
        &self.telemetry
    }

    pub fn signaling(&self) -> &SignalingBroker {
        &self.signaling
    }

    /// Register a session, evicting any prior holder of the same (role, id).
    ///
    /// Last writer wins. For devices the eviction notification is emitted
    /// here, before the "connected" one, so clients always observe the two
    /// status changes in order.
    pub fn register(self: &Arc<Self>, session: Arc<Session>) -> RegistrationGuard {
        let role = session.role();
        let id = session.id().to_string();
        let map = self.map_for(role);

        if let Some(prior) = map.insert(id.clone(), session.clone()) {
            prior.close(CloseReason::Superseded);
            counter!("sessions_superseded", "role" => role.as_str()).increment(1);
            info!(role = %role, id = %id, "superseded prior session");
            if role == Role::Device {
                self.device_status_changed(&id, LinkStatus::Disconnected);
            }
        }

        session.activate();
        counter!("sessions_registered", "role" => role.as_str()).increment(1);
        info!(role = %role, id = %id, conn = %session.conn(), "session registered");

        if role == Role::Device {
            self.telemetry.mark_connected(&id);
            self.device_status_changed(&id, LinkStatus::Connected);
        }

        RegistrationGuard {
            registry: Arc::clone(self),
            session,
        }
    }

    /// Remove a session, but only if it still holds its registry slot. A
    /// session that was superseded finds a newer occupant and leaves it alone.
    pub fn deregister(&self, session: &Arc<Session>) -> bool {
        let role = session.role();
        let id = session.id();
        let removed = self
            .map_for(role)
            .remove_if(id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if !removed {
            return false;
        }

        info!(role = %role, id, conn = %session.conn(), "session deregistered");
        match role {
            Role::Device => {
                self.telemetry.mark_disconnected(id);
                self.signaling.drop_endpoint(Role::Device, id);
                self.device_status_changed(id, LinkStatus::Disconnected);
            }
            Role::Client => {
                self.signaling.drop_endpoint(Role::Client, id);
            }
        }
        true
    }

    pub fn get(&self, role: Role, id: &str) -> Option<Arc<Session>> {
        self.map_for(role)
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| session.lifecycle() == Lifecycle::Active)
    }

    pub fn device(&self, id: &str) -> Option<Arc<Session>> {
        self.get(Role::Device, id)
    }

    pub fn client(&self, id: &str) -> Option<Arc<Session>> {
        self.get(Role::Client, id)
    }

    /// Directory snapshot: every device with a live session plus devices
    /// whose telemetry ring is still retained.
    pub fn list_devices(&self) -> Vec<DeviceEntry> {
        let mut entries: Vec<DeviceEntry> = self
            .devices
            .iter()
            .map(|entry| {
                let session = entry.value();
                DeviceEntry {
                    id: entry.key().clone(),
                    name: session.name().map(str::to_string),
                    kind: session.kind().map(str::to_string),
                    connected: session.lifecycle() == Lifecycle::Active,
                }
            })
            .collect();
        for id in self.telemetry.known_devices() {
            if !entries.iter().any(|e| e.id == id) {
                entries.push(DeviceEntry {
                    id,
                    name: None,
                    kind: None,
                    connected: false,
                });
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Fan a `connection_status` change out to every active client. Per-client
    /// overflow drops the notification for that client only.
    pub fn device_status_changed(&self, device_id: &str, status: LinkStatus) {
        for client in self.clients_snapshot() {
            match client.enqueue(Envelope::connection_status(device_id, status)) {
                Ok(()) => {}
                Err(EnqueueError::Saturated) => {
                    counter!("frames_dropped", "reason" => "queue_overflow").increment(1);
                    warn!(client = client.id(), device_id, "status notification dropped");
                }
                Err(EnqueueError::NotActive) => {}
            }
        }
    }

    /// Every active client session, cloned out so no map guard is held while
    /// the caller enqueues.
    pub fn clients_snapshot(&self) -> Vec<Arc<Session>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| session.lifecycle() == Lifecycle::Active)
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|e| e.value().lifecycle() == Lifecycle::Active)
            .count()
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .iter()
            .filter(|e| e.value().lifecycle() == Lifecycle::Active)
            .count()
    }

    pub fn session_count(&self) -> usize {
        self.devices.len() + self.clients.len()
    }

    /// Every registered session, both roles. The heartbeat supervisor probes
    /// this set.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.devices
            .iter()
            .chain(self.clients.iter())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Shutdown teardown: tell every session to drain and close.
    pub fn close_all(&self, reason: CloseReason) {
        let sessions = self.sessions();
        info!(count = sessions.len(), reason = %reason, "closing all sessions");
        for session in sessions {
            session.close(reason);
        }
    }

    /// Periodic housekeeping: retention expiry for telemetry rings and idle
    /// expiry for signaling sessions.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let forgotten = self.telemetry.sweep();
            let expired = self.signaling.sweep();
            if forgotten > 0 || expired > 0 {
                debug!(forgotten, expired, "sweep pass");
            }
        }
    }

    fn map_for(&self, role: Role) -> &DashMap<String, Arc<Session>> {
        match role {
            Role::Device => &self.devices,
            Role::Client => &self.clients,
        }
    }
}

/// Keeps a session's registry slot alive; deregisters on drop.
pub struct RegistrationGuard {
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
}

impl RegistrationGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DEFAULT_QUEUE_DEPTH;
    use tokio::sync::mpsc;

    fn new_session(role: Role, id: &str) -> Arc<Session> {
        Session::new(role, id, DEFAULT_QUEUE_DEPTH, None, None)
    }

    fn attach_client(
        registry: &Arc<SessionRegistry>,
        id: &str,
    ) -> (Arc<Session>, mpsc::Receiver<Envelope>, RegistrationGuard) {
        let session = new_session(Role::Client, id);
        let rx = session.take_writer().unwrap();
        let guard = registry.register(session.clone());
        (session, rx, guard)
    }

    #[test]
    fn registration_supersedes_prior_session() {
        let registry = SessionRegistry::new(10);
        let first = new_session(Role::Device, "alpha");
        let _g1 = registry.register(first.clone());
        let second = new_session(Role::Device, "alpha");
        let _g2 = registry.register(second.clone());

        assert_eq!(first.close_reason(), Some(CloseReason::Superseded));
        let current = registry.device("alpha").unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[test]
    fn superseded_guard_does_not_evict_successor() {
        let registry = SessionRegistry::new(10);
        let first = new_session(Role::Device, "alpha");
        let g1 = registry.register(first.clone());
        let second = new_session(Role::Device, "alpha");
        let _g2 = registry.register(second.clone());

        // The old adapter task finishing must not tear down the new session.
        drop(g1);
        assert!(registry.device("alpha").is_some());
    }

    #[test]
    fn supersede_notifies_clients_in_order() {
        let registry = SessionRegistry::new(10);
        let (_client, mut rx, _cg) = attach_client(&registry, "c1");

        let first = new_session(Role::Device, "alpha");
        let _g1 = registry.register(first);
        assert_eq!(
            rx.try_recv().unwrap(),
            Envelope::connection_status("alpha", LinkStatus::Connected)
        );

        let second = new_session(Role::Device, "alpha");
        let _g2 = registry.register(second);
        assert_eq!(
            rx.try_recv().unwrap(),
            Envelope::connection_status("alpha", LinkStatus::Disconnected)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Envelope::connection_status("alpha", LinkStatus::Connected)
        );
    }

    #[test]
    fn deregister_notifies_and_marks_retention() {
        let registry = SessionRegistry::new(10);
        let (_client, mut rx, _cg) = attach_client(&registry, "c1");

        let device = new_session(Role::Device, "alpha");
        let guard = registry.register(device);
        let _ = rx.try_recv();

        drop(guard);
        assert_eq!(
            rx.try_recv().unwrap(),
            Envelope::connection_status("alpha", LinkStatus::Disconnected)
        );
        assert!(registry.device("alpha").is_none());
    }

    #[test]
    fn directory_includes_retained_but_offline_devices() {
        let registry = SessionRegistry::new(10);
        let body = serde_json::json!({ "sequence": 1 }).as_object().cloned().unwrap();
        registry.telemetry().append(
            "alpha",
            Envelope::Telemetry {
                device_id: Some("alpha".into()),
                body,
            },
        );

        let device = new_session(Role::Device, "beta");
        let _g = registry.register(device);

        let entries = registry.list_devices();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "alpha");
        assert!(!entries[0].connected);
        assert_eq!(entries[1].id, "beta");
        assert!(entries[1].connected);
    }

    #[test]
    fn draining_sessions_are_not_returned_by_get() {
        let registry = SessionRegistry::new(10);
        let device = new_session(Role::Device, "alpha");
        let _g = registry.register(device.clone());
        device.close(CloseReason::HeartbeatTimeout);
        assert!(registry.device("alpha").is_none());
    }

    #[test]
    fn close_all_drains_every_session() {
        let registry = SessionRegistry::new(10);
        let device = new_session(Role::Device, "alpha");
        let client = new_session(Role::Client, "c1");
        let _g1 = registry.register(device.clone());
        let _g2 = registry.register(client.clone());

        registry.close_all(CloseReason::ShuttingDown);
        assert_eq!(device.close_reason(), Some(CloseReason::ShuttingDown));
        assert_eq!(client.close_reason(), Some(CloseReason::ShuttingDown));
    }
}
