use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::protocol::Envelope;
use crate::registry::SessionRegistry;
use crate::session::{CloseReason, Lifecycle};

/// Periodic liveness probing for every registered session.
///
/// Advisory only: it enqueues `ping` frames and asks timed-out sessions to
/// close; the sessions own their lifecycle transitions.
pub struct HeartbeatSupervisor {
    registry: Arc<SessionRegistry>,
    ping_interval: Duration,
    connection_timeout: Duration,
}

impl HeartbeatSupervisor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        ping_interval: Duration,
        connection_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            ping_interval,
            connection_timeout,
        }
    }

    pub async fn run(self) {
        let cadence = (self.ping_interval / 4)
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut tick = tokio::time::interval(cadence);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.probe();
        }
    }

    fn probe(&self) {
        for session in self.registry.sessions() {
            if session.lifecycle() != Lifecycle::Active {
                continue;
            }
            if session.ping_outstanding() && session.idle() >= self.connection_timeout {
                warn!(
                    session = session.id(),
                    role = %session.role(),
                    idle_secs = session.idle().as_secs(),
                    "heartbeat deadline expired, closing session"
                );
                session.close(CloseReason::HeartbeatTimeout);
                continue;
            }
            if session.since_last_ping() >= self.ping_interval {
                match session.enqueue(Envelope::Ping) {
                    Ok(()) => session.begin_ping(),
                    Err(err) => {
                        debug!(
                            session = session.id(),
                            role = %session.role(),
                            %err,
                            "heartbeat probe not enqueued"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Role, Session};

    fn registry_with(
        role: Role,
        id: &str,
    ) -> (
        Arc<SessionRegistry>,
        Arc<Session>,
        crate::registry::RegistrationGuard,
    ) {
        let registry = SessionRegistry::new(10);
        let session = Session::new(role, id, 16, None, None);
        let guard = registry.register(session.clone());
        (registry, session, guard)
    }

    #[tokio::test]
    async fn silent_session_is_closed_after_the_deadline() {
        let (registry, session, _guard) = registry_with(Role::Device, "alpha");
        let supervisor = HeartbeatSupervisor::new(
            registry,
            Duration::from_millis(40),
            Duration::from_millis(100),
        );
        let handle = tokio::spawn(supervisor.run());

        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.abort();

        assert_eq!(session.close_reason(), Some(CloseReason::HeartbeatTimeout));
    }

    #[tokio::test]
    async fn probes_are_enqueued_on_the_interval() {
        let (registry, session, _guard) = registry_with(Role::Client, "c1");
        let mut rx = session.take_writer().unwrap();
        let supervisor = HeartbeatSupervisor::new(
            registry,
            Duration::from_millis(40),
            Duration::from_secs(60),
        );
        let handle = tokio::spawn(supervisor.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(rx.try_recv().unwrap(), Envelope::Ping);
        assert!(session.ping_outstanding());
    }

    #[tokio::test]
    async fn recent_activity_defers_the_close() {
        let (registry, session, _guard) = registry_with(Role::Device, "alpha");
        let supervisor = HeartbeatSupervisor::new(
            registry,
            Duration::from_millis(40),
            Duration::from_millis(200),
        );
        let handle = tokio::spawn(supervisor.run());

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            session.mark_activity();
            session.clear_ping();
        }
        assert!(session.close_reason().is_none());
        handle.abort();
    }
}
