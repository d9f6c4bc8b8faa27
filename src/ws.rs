use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::protocol::{self, Envelope};
use crate::registry::SessionRegistry;
use crate::router::Router;
use crate::session::{
    CloseReason, Lifecycle, Role, Session, DEFAULT_QUEUE_DEPTH, DRAIN_DEADLINE, WRITE_DEADLINE,
};

/// Shared state handed to every transport and HTTP handler.
#[derive(Clone)]
pub struct HubState {
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<Router>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

impl HubState {
    pub fn new(config: Config) -> Self {
        let registry = SessionRegistry::new(config.telemetry_buffer_size);
        let router = Arc::new(Router::new(registry.clone(), config.ice_servers.clone()));
        Self {
            registry,
            router,
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EndpointMeta {
    pub name: Option<String>,
    #[serde(alias = "type")]
    pub kind: Option<String>,
}

pub async fn device_ws(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    Query(meta): Query<EndpointMeta>,
    State(state): State<HubState>,
) -> Response {
    upgrade(ws, state, Role::Device, id, meta)
}

pub async fn client_ws(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<HubState>,
) -> Response {
    upgrade(ws, state, Role::Client, id, EndpointMeta::default())
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: HubState,
    role: Role,
    id: String,
    meta: EndpointMeta,
) -> Response {
    let id = id.trim().to_string();
    if id.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    ws.on_upgrade(move |socket| run_session(socket, state, role, id, meta))
}

/// Drive one accepted connection from registration through teardown.
async fn run_session(socket: WebSocket, state: HubState, role: Role, id: String, meta: EndpointMeta) {
    let session = Session::new(role, id, DEFAULT_QUEUE_DEPTH, meta.name, meta.kind);
    let Some(rx) = session.take_writer() else {
        return;
    };
    let guard = state.registry.register(session.clone());

    if role == Role::Client {
        let snapshot = Envelope::DevicesList {
            devices: Some(state.registry.list_devices()),
        };
        let _ = session.enqueue(snapshot);
    }

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_flow(sink, rx, session.clone()));

    tokio::select! {
        // Peer went away or the transport failed.
        _ = read_flow(stream, &state, &session) => {
            session.close(CloseReason::PeerClosed);
            let _ = (&mut writer).await;
        }
        // Session was told to close and the writer has drained; dropping the
        // read half releases the socket even if the peer lingers.
        _ = &mut writer => {}
    }

    let reason = session
        .close_reason()
        .unwrap_or(CloseReason::PeerClosed)
        .as_str();
    info!(role = %role, id = session.id(), conn = %session.conn(), reason, "session finished");
    drop(guard);
}

async fn read_flow(
    mut stream: SplitStream<WebSocket>,
    state: &HubState,
    session: &Arc<Session>,
) {
    while let Some(item) = stream.next().await {
        // A drained session (superseded, timed out) routes nothing further.
        if session.lifecycle() != Lifecycle::Active {
            break;
        }
        let msg = match item {
            Ok(msg) => msg,
            Err(err) => {
                debug!(session = session.id(), %err, "transport read error");
                session.close(CloseReason::TransportError);
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text.to_string(),
            // Some firmwares send JSON in binary frames; accept UTF-8 bodies.
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(session = session.id(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                session.close(CloseReason::PeerClosed);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                session.mark_activity();
                continue;
            }
        };

        if state.config.debug_mode {
            debug!(session = session.id(), role = %session.role(), frame = %text, "inbound frame");
        }

        match protocol::decode(&text) {
            Ok(frame) => state.router.dispatch(session, frame),
            Err(err) => {
                warn!(session = session.id(), %err, "rejected inbound frame");
                let reply = Envelope::error(err.error_kind(), err.to_string());
                let _ = session.enqueue(reply);
            }
        }
    }
}

async fn write_flow(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Envelope>,
    session: Arc<Session>,
) {
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(frame) => {
                    if !send_frame(&mut sink, &session, frame).await {
                        session.close(CloseReason::TransportError);
                        break;
                    }
                }
                None => break,
            },
            _ = session.wait_close() => {
                drain(&mut sink, &mut rx, &session).await;
                break;
            }
        }
    }

    let reason = session
        .close_reason()
        .unwrap_or(CloseReason::PeerClosed)
        .as_str();
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: reason.into(),
        })))
        .await;
    session.finish();
}

/// Flush pending frames after a close request, bounded by the drain deadline.
async fn drain(
    sink: &mut SplitSink<WebSocket, Message>,
    rx: &mut mpsc::Receiver<Envelope>,
    session: &Arc<Session>,
) {
    let flush = async {
        while let Ok(frame) = rx.try_recv() {
            if !send_frame(sink, session, frame).await {
                break;
            }
        }
    };
    if tokio::time::timeout(DRAIN_DEADLINE, flush).await.is_err() {
        warn!(session = session.id(), "drain deadline elapsed with frames pending");
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    session: &Arc<Session>,
    frame: Envelope,
) -> bool {
    let text = protocol::encode(&frame);
    match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!(session = session.id(), %err, "transport write error");
            false
        }
        Err(_) => {
            warn!(session = session.id(), "write deadline elapsed");
            false
        }
    }
}
