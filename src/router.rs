use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::{Envelope, ErrorKind, LinkStatus, SignalKind};
use crate::registry::SessionRegistry;
use crate::session::{EnqueueError, Role, Session};

/// Frames routed per category, plus drops, for the health snapshot.
#[derive(Default)]
pub struct RouterCounters {
    heartbeat: AtomicU64,
    directory: AtomicU64,
    telemetry: AtomicU64,
    command: AtomicU64,
    signaling: AtomicU64,
    unsupported: AtomicU64,
    overflow_drops: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RouteCounts {
    pub heartbeat: u64,
    pub directory: u64,
    pub telemetry: u64,
    pub command: u64,
    pub signaling: u64,
    pub unsupported: u64,
    pub overflow_drops: u64,
}

impl RouterCounters {
    pub fn snapshot(&self) -> RouteCounts {
        RouteCounts {
            heartbeat: self.heartbeat.load(Ordering::Relaxed),
            directory: self.directory.load(Ordering::Relaxed),
            telemetry: self.telemetry.load(Ordering::Relaxed),
            command: self.command.load(Ordering::Relaxed),
            signaling: self.signaling.load(Ordering::Relaxed),
            unsupported: self.unsupported.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
        }
    }

    fn bump(&self, category: &'static str) {
        let counter = match category {
            "heartbeat" => &self.heartbeat,
            "directory" => &self.directory,
            "telemetry" => &self.telemetry,
            "command" => &self.command,
            "signaling" => &self.signaling,
            _ => &self.unsupported,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        counter!("frames_routed", "category" => category).increment(1);
    }
}

/// Central classifier. Applies role and addressing rules to each decoded
/// frame and enqueues to targets. Performs no I/O and holds no lock across a
/// target enqueue; a full target queue drops that frame only.
pub struct Router {
    registry: Arc<SessionRegistry>,
    ice_servers: Value,
    counters: RouterCounters,
}

impl Router {
    pub fn new(registry: Arc<SessionRegistry>, ice_servers: Value) -> Self {
        Self {
            registry,
            ice_servers,
            counters: RouterCounters::default(),
        }
    }

    pub fn counters(&self) -> &RouterCounters {
        &self.counters
    }

    pub fn dispatch(&self, source: &Arc<Session>, frame: Envelope) {
        source.mark_activity();
        source.clear_ping();

        match (frame, source.role()) {
            (Envelope::Ping, _) => {
                self.counters.bump("heartbeat");
                self.reply(source, Envelope::Pong);
            }
            (Envelope::Pong, _) => {
                // Flag already cleared above; nothing further to route.
                self.counters.bump("heartbeat");
            }

            (Envelope::DevicesList { .. }, Role::Client) => {
                self.counters.bump("directory");
                self.reply(
                    source,
                    Envelope::DevicesList {
                        devices: Some(self.registry.list_devices()),
                    },
                );
            }
            (Envelope::ConnectDevice { device_id }, Role::Client) => {
                self.counters.bump("directory");
                source.watch(&device_id);
                let status = if self.registry.device(&device_id).is_some() {
                    LinkStatus::Connected
                } else {
                    LinkStatus::Disconnected
                };
                self.reply(source, Envelope::device_connected(&device_id, status));
                self.registry.telemetry().replay(&device_id, source);
            }
            (Envelope::GetTelemetry { device_id }, Role::Client) => {
                self.counters.bump("directory");
                self.registry.telemetry().replay(&device_id, source);
            }

            (Envelope::Telemetry { body, .. }, Role::Device) => {
                self.counters.bump("telemetry");
                let frame = Envelope::Telemetry {
                    device_id: Some(source.id().to_string()),
                    body,
                };
                self.registry.telemetry().append(source.id(), frame.clone());
                self.fan_out_to_clients(frame);
            }

            (
                Envelope::Command {
                    device_id,
                    command,
                    command_id,
                    body,
                },
                Role::Client,
            ) => {
                self.counters.bump("command");
                let Some(device) = self.registry.device(&device_id) else {
                    self.reply(
                        source,
                        Envelope::error(
                            ErrorKind::DeviceUnavailable,
                            format!("device {device_id} is not available"),
                        ),
                    );
                    return;
                };
                self.forward(
                    &device,
                    Envelope::Command {
                        device_id,
                        command,
                        command_id,
                        body,
                    },
                );
            }
            (frame @ Envelope::CommandStatus { .. }, Role::Device) => {
                self.counters.bump("command");
                self.route_command_status(source, frame);
            }

            (
                Envelope::Webrtc {
                    subtype,
                    device_id,
                    client_id,
                    session_id,
                    body,
                },
                role,
            ) => self.route_signal(source, role, subtype, device_id, client_id, session_id, body),

            (frame, role) => {
                self.counters.bump("unsupported");
                counter!("frames_dropped", "reason" => "unsupported").increment(1);
                warn!(
                    session = source.id(),
                    role = %role,
                    "dropping frame with no routing rule: {}",
                    frame_type(&frame),
                );
                self.reply(
                    source,
                    Envelope::error(
                        ErrorKind::UnsupportedMessage,
                        format!("no routing rule for {} from {role}", frame_type(&frame)),
                    ),
                );
            }
        }
    }

    /// `command_status` goes to the client whose id prefixes the command id;
    /// with no prefix match it is broadcast to every client.
    fn route_command_status(&self, source: &Arc<Session>, frame: Envelope) {
        let Envelope::CommandStatus { ref command_id, .. } = frame else {
            return;
        };
        let target = self
            .registry
            .clients_snapshot()
            .into_iter()
            .filter(|client| command_id.starts_with(&format!("{}-", client.id())))
            .max_by_key(|client| client.id().len());

        match target {
            Some(client) => {
                self.forward(&client, frame);
            }
            None => {
                debug!(
                    device = source.id(),
                    command_id = %command_id,
                    "command status has no matching client, broadcasting"
                );
                self.fan_out_to_clients(frame);
            }
        }
    }

    fn route_signal(
        &self,
        source: &Arc<Session>,
        role: Role,
        subtype: SignalKind,
        device_id: Option<String>,
        client_id: Option<String>,
        session_id: Option<String>,
        mut body: serde_json::Map<String, Value>,
    ) {
        self.counters.bump("signaling");
        let signaling = self.registry.signaling();

        match role {
            Role::Client => {
                if subtype == SignalKind::Answer {
                    self.unsupported_signal(source, role, subtype);
                    return;
                }
                let Some(device_id) = device_id else {
                    self.reply(
                        source,
                        Envelope::error(ErrorKind::Malformed, "webrtc frame is missing deviceId"),
                    );
                    return;
                };
                let Some(device) = self.registry.device(&device_id) else {
                    self.reply(
                        source,
                        Envelope::error(
                            ErrorKind::PeerUnavailable,
                            format!("device {device_id} has no active session"),
                        ),
                    );
                    return;
                };

                let session_id = if subtype == SignalKind::Offer {
                    if !body.contains_key("iceServers") {
                        body.insert("iceServers".to_string(), self.ice_servers.clone());
                    }
                    Some(signaling.open(source.id(), &device_id, session_id))
                } else {
                    signaling.touch(source.id(), &device_id);
                    session_id
                };
                if subtype == SignalKind::Close {
                    signaling.close_pair(source.id(), &device_id);
                }

                self.forward(
                    &device,
                    Envelope::Webrtc {
                        subtype,
                        device_id: Some(device_id),
                        client_id: Some(source.id().to_string()),
                        session_id,
                        body,
                    },
                );
            }
            Role::Device => {
                if subtype == SignalKind::Offer {
                    self.unsupported_signal(source, role, subtype);
                    return;
                }
                let Some(client_id) = client_id else {
                    self.reply(
                        source,
                        Envelope::error(ErrorKind::Malformed, "webrtc frame is missing clientId"),
                    );
                    return;
                };
                let Some(client) = self.registry.client(&client_id) else {
                    self.reply(
                        source,
                        Envelope::error(
                            ErrorKind::PeerUnavailable,
                            format!("client {client_id} has no active session"),
                        ),
                    );
                    return;
                };

                signaling.touch(&client_id, source.id());
                if subtype == SignalKind::Close {
                    signaling.close_pair(&client_id, source.id());
                }

                self.forward(
                    &client,
                    Envelope::Webrtc {
                        subtype,
                        device_id: Some(source.id().to_string()),
                        client_id: Some(client_id),
                        session_id,
                        body,
                    },
                );
            }
        }
    }

    fn unsupported_signal(&self, source: &Arc<Session>, role: Role, subtype: SignalKind) {
        warn!(session = source.id(), role = %role, ?subtype, "signal direction not routable");
        self.reply(
            source,
            Envelope::error(
                ErrorKind::UnsupportedMessage,
                format!("webrtc {subtype:?} is not accepted from a {role}"),
            ),
        );
    }

    fn fan_out_to_clients(&self, frame: Envelope) {
        for client in self.registry.clients_snapshot() {
            self.forward(&client, frame.clone());
        }
    }

    /// Reply to the frame's source; overflow is counted, never amplified.
    fn reply(&self, source: &Arc<Session>, frame: Envelope) {
        self.deliver(source, frame);
    }

    /// Enqueue toward a resolved target. Returns false on drop.
    fn forward(&self, target: &Arc<Session>, frame: Envelope) -> bool {
        self.deliver(target, frame)
    }

    fn deliver(&self, target: &Arc<Session>, frame: Envelope) -> bool {
        match target.enqueue(frame) {
            Ok(()) => true,
            Err(EnqueueError::Saturated) => {
                self.counters.overflow_drops.fetch_add(1, Ordering::Relaxed);
                counter!("frames_dropped", "reason" => "queue_overflow").increment(1);
                warn!(
                    session = target.id(),
                    role = %target.role(),
                    "outbound queue saturated, frame dropped"
                );
                false
            }
            Err(EnqueueError::NotActive) => {
                debug!(
                    session = target.id(),
                    role = %target.role(),
                    "frame for inactive session dropped"
                );
                false
            }
        }
    }
}

fn frame_type(frame: &Envelope) -> &'static str {
    match frame {
        Envelope::Ping => "ping",
        Envelope::Pong => "pong",
        Envelope::DevicesList { .. } => "devices_list",
        Envelope::ConnectDevice { .. } => "connect_device",
        Envelope::GetTelemetry { .. } => "get_telemetry",
        Envelope::DeviceConnected { .. } => "device_connected",
        Envelope::ConnectionStatus { .. } => "connection_status",
        Envelope::Telemetry { .. } => "telemetry",
        Envelope::Command { .. } => "command",
        Envelope::CommandStatus { .. } => "command_status",
        Envelope::Webrtc { .. } => "webrtc",
        Envelope::Error { .. } => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::RegistrationGuard;
    use crate::session::DEFAULT_QUEUE_DEPTH;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Peer {
        session: Arc<Session>,
        rx: mpsc::Receiver<Envelope>,
        _guard: RegistrationGuard,
    }

    fn hub() -> (Arc<SessionRegistry>, Router) {
        let registry = SessionRegistry::new(100);
        let router = Router::new(registry.clone(), Config::default().ice_servers);
        (registry, router)
    }

    fn attach(registry: &Arc<SessionRegistry>, role: Role, id: &str) -> Peer {
        attach_with_depth(registry, role, id, DEFAULT_QUEUE_DEPTH)
    }

    fn attach_with_depth(
        registry: &Arc<SessionRegistry>,
        role: Role,
        id: &str,
        depth: usize,
    ) -> Peer {
        let session = Session::new(role, id, depth, None, None);
        let rx = session.take_writer().unwrap();
        let guard = registry.register(session.clone());
        Peer {
            session,
            rx,
            _guard: guard,
        }
    }

    fn telemetry(seq: i64) -> Envelope {
        Envelope::Telemetry {
            device_id: None,
            body: json!({ "subtype": "sensor_data", "sequence": seq })
                .as_object()
                .cloned()
                .unwrap(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn ping_yields_pong() {
        let (registry, router) = hub();
        let mut device = attach(&registry, Role::Device, "alpha");
        router.dispatch(&device.session, Envelope::Ping);
        assert_eq!(device.rx.try_recv().unwrap(), Envelope::Pong);
        assert_eq!(router.counters().snapshot().heartbeat, 1);
    }

    #[test]
    fn pong_clears_outstanding_flag() {
        let (registry, router) = hub();
        let device = attach(&registry, Role::Device, "alpha");
        device.session.begin_ping();
        assert!(device.session.ping_outstanding());
        router.dispatch(&device.session, Envelope::Pong);
        assert!(!device.session.ping_outstanding());
    }

    #[test]
    fn any_inbound_traffic_clears_outstanding_flag() {
        let (registry, router) = hub();
        let device = attach(&registry, Role::Device, "alpha");
        device.session.begin_ping();
        router.dispatch(&device.session, telemetry(1));
        assert!(!device.session.ping_outstanding());
    }

    #[test]
    fn devices_list_returns_snapshot() {
        let (registry, router) = hub();
        let _device = attach(&registry, Role::Device, "alpha");
        let mut client = attach(&registry, Role::Client, "c1");
        router.dispatch(&client.session, Envelope::DevicesList { devices: None });
        let Envelope::DevicesList { devices: Some(devices) } = client.rx.try_recv().unwrap() else {
            panic!("expected devices_list reply");
        };
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "alpha");
        assert!(devices[0].connected);
    }

    #[test]
    fn telemetry_fans_out_in_order() {
        let (registry, router) = hub();
        let device = attach(&registry, Role::Device, "alpha");
        let mut clients: Vec<Peer> = ["c1", "c2", "c3"]
            .into_iter()
            .map(|id| attach(&registry, Role::Client, id))
            .collect();

        for seq in 1..=3 {
            router.dispatch(&device.session, telemetry(seq));
        }

        for client in &mut clients {
            let frames = drain(&mut client.rx);
            let seqs: Vec<i64> = frames
                .iter()
                .map(|f| match f {
                    Envelope::Telemetry { device_id, body } => {
                        assert_eq!(device_id.as_deref(), Some("alpha"));
                        body["sequence"].as_i64().unwrap()
                    }
                    other => panic!("unexpected frame {other:?}"),
                })
                .collect();
            assert_eq!(seqs, vec![1, 2, 3]);
        }
    }

    #[test]
    fn fan_out_skips_saturated_client_only() {
        let (registry, router) = hub();
        let device = attach(&registry, Role::Device, "alpha");
        let mut narrow = attach_with_depth(&registry, Role::Client, "narrow", 1);
        let mut wide = attach(&registry, Role::Client, "wide");

        router.dispatch(&device.session, telemetry(1));
        router.dispatch(&device.session, telemetry(2));

        assert_eq!(drain(&mut narrow.rx).len(), 1);
        assert_eq!(drain(&mut wide.rx).len(), 2);
        assert_eq!(router.counters().snapshot().overflow_drops, 1);
        // The device never saw back-pressure.
        assert!(device.session.close_reason().is_none());
    }

    #[test]
    fn connect_device_replies_then_replays() {
        let (registry, router) = hub();
        let device = attach(&registry, Role::Device, "alpha");
        for seq in 10..=14 {
            router.dispatch(&device.session, telemetry(seq));
        }

        let mut client = attach(&registry, Role::Client, "c1");
        router.dispatch(
            &client.session,
            Envelope::ConnectDevice {
                device_id: "alpha".into(),
            },
        );

        let frames = drain(&mut client.rx);
        assert_eq!(
            frames[0],
            Envelope::device_connected("alpha", LinkStatus::Connected)
        );
        let seqs: Vec<i64> = frames[1..]
            .iter()
            .map(|f| match f {
                Envelope::Telemetry { body, .. } => body["sequence"].as_i64().unwrap(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(seqs, vec![10, 11, 12, 13, 14]);
        assert!(client.session.watches("alpha"));
    }

    #[test]
    fn get_telemetry_replays_without_notification() {
        let (registry, router) = hub();
        let device = attach(&registry, Role::Device, "alpha");
        router.dispatch(&device.session, telemetry(1));

        let mut client = attach(&registry, Role::Client, "c1");
        router.dispatch(
            &client.session,
            Envelope::GetTelemetry {
                device_id: "alpha".into(),
            },
        );
        let frames = drain(&mut client.rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Envelope::Telemetry { .. }));
    }

    #[test]
    fn command_routes_to_active_device() {
        let (registry, router) = hub();
        let mut device = attach(&registry, Role::Device, "alpha");
        let client = attach(&registry, Role::Client, "c1");

        router.dispatch(
            &client.session,
            Envelope::Command {
                device_id: "alpha".into(),
                command: "stop".into(),
                command_id: "c1-1-T".into(),
                body: Default::default(),
            },
        );
        let Envelope::Command { command_id, .. } = device.rx.try_recv().unwrap() else {
            panic!("expected command at device");
        };
        assert_eq!(command_id, "c1-1-T");
    }

    #[test]
    fn command_to_absent_device_reports_unavailable() {
        let (registry, router) = hub();
        let mut client = attach(&registry, Role::Client, "c1");
        router.dispatch(
            &client.session,
            Envelope::Command {
                device_id: "ghost".into(),
                command: "stop".into(),
                command_id: "c1-1-T".into(),
                body: Default::default(),
            },
        );
        let Envelope::Error { kind, message } = client.rx.try_recv().unwrap() else {
            panic!("expected error reply");
        };
        assert_eq!(kind, ErrorKind::DeviceUnavailable);
        assert!(message.unwrap().contains("ghost"));
    }

    #[test]
    fn command_status_prefix_matches_the_issuing_client() {
        let (registry, router) = hub();
        let device = attach(&registry, Role::Device, "alpha");
        let mut c1 = attach(&registry, Role::Client, "c1");
        let mut other = attach(&registry, Role::Client, "c2");

        router.dispatch(
            &device.session,
            Envelope::CommandStatus {
                command_id: "c1-1-T".into(),
                status: "completed".into(),
                message: None,
                body: Default::default(),
            },
        );
        assert_eq!(drain(&mut c1.rx).len(), 1);
        assert!(drain(&mut other.rx).is_empty());
    }

    #[test]
    fn command_status_prefers_the_longest_prefix() {
        let (registry, router) = hub();
        let device = attach(&registry, Role::Device, "alpha");
        let mut short = attach(&registry, Role::Client, "c1");
        let mut long = attach(&registry, Role::Client, "c1-ops");

        router.dispatch(
            &device.session,
            Envelope::CommandStatus {
                command_id: "c1-ops-7-T".into(),
                status: "completed".into(),
                message: None,
                body: Default::default(),
            },
        );
        assert!(drain(&mut short.rx).is_empty());
        assert_eq!(drain(&mut long.rx).len(), 1);
    }

    #[test]
    fn command_status_without_match_broadcasts() {
        let (registry, router) = hub();
        let device = attach(&registry, Role::Device, "alpha");
        let mut c1 = attach(&registry, Role::Client, "c1");
        let mut c2 = attach(&registry, Role::Client, "c2");

        router.dispatch(
            &device.session,
            Envelope::CommandStatus {
                command_id: "standalone-9".into(),
                status: "failed".into(),
                message: Some("battery low".into()),
                body: Default::default(),
            },
        );
        assert_eq!(drain(&mut c1.rx).len(), 1);
        assert_eq!(drain(&mut c2.rx).len(), 1);
    }

    #[test]
    fn offer_is_stamped_and_forwarded() {
        let (registry, router) = hub();
        let mut device = attach(&registry, Role::Device, "alpha");
        let client = attach(&registry, Role::Client, "c1");

        router.dispatch(
            &client.session,
            Envelope::Webrtc {
                subtype: SignalKind::Offer,
                device_id: Some("alpha".into()),
                client_id: None,
                session_id: None,
                body: json!({ "sdp": "S" }).as_object().cloned().unwrap(),
            },
        );

        let Envelope::Webrtc {
            subtype,
            client_id,
            session_id,
            body,
            ..
        } = device.rx.try_recv().unwrap()
        else {
            panic!("expected webrtc at device");
        };
        assert_eq!(subtype, SignalKind::Offer);
        assert_eq!(client_id.as_deref(), Some("c1"));
        assert_eq!(body["sdp"], "S");
        assert!(body.contains_key("iceServers"));
        let token = session_id.unwrap();
        assert!(registry.signaling().get(&token).is_some());
    }

    #[test]
    fn answer_returns_to_the_named_client() {
        let (registry, router) = hub();
        let device = attach(&registry, Role::Device, "alpha");
        let mut client = attach(&registry, Role::Client, "c1");

        router.dispatch(
            &device.session,
            Envelope::Webrtc {
                subtype: SignalKind::Answer,
                device_id: None,
                client_id: Some("c1".into()),
                session_id: None,
                body: json!({ "sdp": "A" }).as_object().cloned().unwrap(),
            },
        );

        let Envelope::Webrtc {
            subtype,
            device_id,
            body,
            ..
        } = client.rx.try_recv().unwrap()
        else {
            panic!("expected webrtc at client");
        };
        assert_eq!(subtype, SignalKind::Answer);
        assert_eq!(device_id.as_deref(), Some("alpha"));
        assert_eq!(body["sdp"], "A");
    }

    #[test]
    fn offer_keeps_caller_supplied_ice_servers() {
        let (registry, router) = hub();
        let mut device = attach(&registry, Role::Device, "alpha");
        let client = attach(&registry, Role::Client, "c1");

        router.dispatch(
            &client.session,
            Envelope::Webrtc {
                subtype: SignalKind::Offer,
                device_id: Some("alpha".into()),
                client_id: None,
                session_id: None,
                body: json!({ "sdp": "S", "iceServers": [{"urls": ["stun:own"]}] })
                    .as_object()
                    .cloned()
                    .unwrap(),
            },
        );
        let Envelope::Webrtc { body, .. } = device.rx.try_recv().unwrap() else {
            panic!("expected webrtc at device");
        };
        assert_eq!(body["iceServers"][0]["urls"][0], "stun:own");
    }

    #[test]
    fn signal_to_absent_peer_reports_unavailable() {
        let (registry, router) = hub();
        let mut client = attach(&registry, Role::Client, "c1");
        router.dispatch(
            &client.session,
            Envelope::Webrtc {
                subtype: SignalKind::IceCandidate,
                device_id: Some("ghost".into()),
                client_id: None,
                session_id: None,
                body: Default::default(),
            },
        );
        let Envelope::Error { kind, .. } = client.rx.try_recv().unwrap() else {
            panic!("expected error reply");
        };
        assert_eq!(kind, ErrorKind::PeerUnavailable);
    }

    #[test]
    fn close_subtype_tears_down_the_signaling_session() {
        let (registry, router) = hub();
        let mut device = attach(&registry, Role::Device, "alpha");
        let client = attach(&registry, Role::Client, "c1");

        router.dispatch(
            &client.session,
            Envelope::Webrtc {
                subtype: SignalKind::Offer,
                device_id: Some("alpha".into()),
                client_id: None,
                session_id: None,
                body: json!({ "sdp": "S" }).as_object().cloned().unwrap(),
            },
        );
        let _ = device.rx.try_recv();
        assert_eq!(registry.signaling().len(), 1);

        router.dispatch(
            &client.session,
            Envelope::Webrtc {
                subtype: SignalKind::Close,
                device_id: Some("alpha".into()),
                client_id: None,
                session_id: None,
                body: Default::default(),
            },
        );
        assert!(registry.signaling().is_empty());
    }

    #[test]
    fn wrong_role_frames_are_unsupported() {
        let (registry, router) = hub();
        let mut device = attach(&registry, Role::Device, "alpha");
        router.dispatch(&device.session, Envelope::DevicesList { devices: None });
        let Envelope::Error { kind, .. } = device.rx.try_recv().unwrap() else {
            panic!("expected error reply");
        };
        assert_eq!(kind, ErrorKind::UnsupportedMessage);

        let mut client = attach(&registry, Role::Client, "c1");
        router.dispatch(&client.session, telemetry(1));
        let Envelope::Error { kind, .. } = client.rx.try_recv().unwrap() else {
            panic!("expected error reply");
        };
        assert_eq!(kind, ErrorKind::UnsupportedMessage);
    }
}
