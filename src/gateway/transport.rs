//! Client transport adapter.
//!
//! The transport is a WebSocket carrying JSON frames `{event, payload}`.
//! This module owns the per-connection loop: it decodes inbound events,
//! dispatches them to the orchestrator / executor / shell, runs the
//! heartbeat, and realizes reconnection by rebinding an existing session
//! to the new transport.
//!
//! Outbound emission goes through the [`EventSink`] seam. Every sink write
//! is fire-and-forget: a dead client never disturbs the SSH side. A
//! session's sink lives behind an [`EventOutlet`] so a reconnect swaps the
//! destination atomically; output produced after the swap reaches the new
//! transport exactly once and the old one never.

use std::sync::{Arc, RwLock as StdRwLock};

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use poem::web::websocket::{Message, WebSocketStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::gateway::config::HEARTBEAT_INTERVAL;
use crate::gateway::context::GatewayContext;
use crate::gateway::session::destroy_session;
use crate::gateway::shell::ShellCommand;
use crate::gateway::types::{ClientEvent, ResizeRequest, ServerEvent};
use crate::gateway::{client, executor, shell};

/// Destination for outbound events.
///
/// Implementations must be thread-safe; emission never blocks and never
/// fails visibly.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ServerEvent);
}

/// Sink feeding a WebSocket writer task through an unbounded channel,
/// preserving emission order per connection.
pub struct WsEventSink {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl EventSink for WsEventSink {
    fn emit(&self, event: ServerEvent) {
        // The receiver is gone once the transport closed; events emitted
        // after that are dropped on purpose.
        let _ = self.tx.send(event);
    }
}

/// Swappable sink holder owned by a session.
pub struct EventOutlet {
    sink: StdRwLock<Arc<dyn EventSink>>,
}

impl EventOutlet {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink: StdRwLock::new(sink),
        }
    }

    pub fn emit(&self, event: ServerEvent) {
        let sink = self.sink.read().expect("outlet lock poisoned").clone();
        sink.emit(event);
    }

    /// Replace the destination; subsequent events go only to the new sink.
    pub fn replace(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write().expect("outlet lock poisoned") = sink;
    }
}

/// Drive one client transport until it disconnects.
pub async fn run_transport(
    socket: WebSocketStream,
    ctx: Arc<GatewayContext>,
    handshake_session: Option<String>,
) {
    let transport_id = Uuid::new_v4().to_string();
    info!("Client transport {} connected", transport_id);

    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(ws_sink, rx));
    let sink: Arc<dyn EventSink> = Arc::new(WsEventSink { tx });

    // Reconnection: the handshake may name an existing session.
    if let Some(session_id) = handshake_session {
        if attach_existing(&ctx, &sink, &transport_id, &session_id) {
            info!(
                "Transport {} re-attached to session {}",
                transport_id, session_id
            );
        } else {
            debug!(
                "Transport {} asked for unknown session {}, awaiting connect",
                transport_id, session_id
            );
        }
    }

    let heartbeat = spawn_heartbeat(ctx.clone(), sink.clone(), transport_id.clone());

    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => dispatch_event(&ctx, &sink, &transport_id, event).await,
                Err(e) => {
                    debug!("Transport {} sent an undecodable frame: {}", transport_id, e);
                    sink.emit(ServerEvent::Error {
                        message: "Invalid message format".to_string(),
                    });
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Client transport gone: stop the heartbeat only. The session stays for
    // the janitor or an explicit disconnect from a reconnected transport.
    heartbeat.abort();
    writer.abort();
    ctx.registry.unbind(&transport_id);
    info!("Client transport {} disconnected", transport_id);
}

async fn write_loop(
    mut ws_sink: SplitSink<WebSocketStream, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = rx.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize outbound event: {}", e);
                continue;
            }
        };
        if ws_sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}

/// Rebind an existing authenticated session to this transport.
///
/// Swaps the session's event outlet so shell output produced from now on
/// reaches the new transport, then confirms with `connection-exists`.
fn attach_existing(
    ctx: &Arc<GatewayContext>,
    sink: &Arc<dyn EventSink>,
    transport_id: &str,
    session_id: &str,
) -> bool {
    let Some(session) = ctx.registry.get(session_id) else {
        return false;
    };
    if !session.is_authenticated() || session.is_destroyed() {
        return false;
    }

    ctx.registry.bind(transport_id, session_id);
    session.bind_transport(Some(transport_id.to_string()));
    session.replace_sink(sink.clone());
    session.touch();
    session.emit(ServerEvent::ConnectionExists {
        message: "Reconnected to existing SSH session".to_string(),
        session_id: session_id.to_string(),
    });
    true
}

fn spawn_heartbeat(
    ctx: Arc<GatewayContext>,
    sink: Arc<dyn EventSink>,
    transport_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if ctx.registry.lookup(&transport_id).is_some() {
                sink.emit(ServerEvent::Heartbeat {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
            }
        }
    })
}

/// Route one inbound event.
pub(crate) async fn dispatch_event(
    ctx: &Arc<GatewayContext>,
    sink: &Arc<dyn EventSink>,
    transport_id: &str,
    event: ClientEvent,
) {
    match event {
        ClientEvent::Connect(request) => {
            if let Some(session) = ctx.registry.lookup(transport_id) {
                sink.emit(ServerEvent::ConnectionExists {
                    message: "SSH session already established".to_string(),
                    session_id: session.id().to_string(),
                });
                return;
            }
            let ctx = ctx.clone();
            let sink = sink.clone();
            let transport_id = transport_id.to_string();
            tokio::spawn(async move {
                client::connect(&ctx, sink, &transport_id, request).await;
            });
        }
        ClientEvent::CheckConnection(request) => {
            if !attach_existing(ctx, sink, transport_id, &request.session_id) {
                sink.emit(ServerEvent::Error {
                    message: "No active SSH session found".to_string(),
                });
            }
        }
        ClientEvent::ExecuteCommand(request) => {
            let ctx = ctx.clone();
            let sink = sink.clone();
            let transport_id = transport_id.to_string();
            tokio::spawn(async move {
                executor::execute_command(&ctx, &sink, &transport_id, request).await;
            });
        }
        ClientEvent::ExecuteBatch(request) => {
            let ctx = ctx.clone();
            let sink = sink.clone();
            let transport_id = transport_id.to_string();
            tokio::spawn(async move {
                executor::execute_batch(&ctx, &sink, &transport_id, request).await;
            });
        }
        ClientEvent::RestartShell => match ctx.registry.lookup(transport_id) {
            Some(session) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = shell::restart_shell(&ctx, &session).await {
                        warn!("Shell restart for session {} failed: {}", session.id(), e);
                        session.emit(ServerEvent::Error { message: e });
                    }
                });
            }
            None => sink.emit(ServerEvent::Error {
                message: "No active SSH session".to_string(),
            }),
        },
        ClientEvent::Resize(ResizeRequest { cols, rows }) => {
            if cols == 0 || rows == 0 {
                sink.emit(ServerEvent::Error {
                    message: "Invalid terminal dimensions".to_string(),
                });
                return;
            }
            if let Some(session) = ctx.registry.lookup(transport_id) {
                session.set_dims(cols, rows);
                session.touch();
                if let Some(shell_tx) = session.shell_sender() {
                    let _ = shell_tx.send(ShellCommand::Resize(cols, rows)).await;
                }
            }
        }
        ClientEvent::Input(data) => {
            if let Some(session) = ctx.registry.lookup(transport_id) {
                session.touch();
                if let Some(shell_tx) = session.shell_sender() {
                    let _ = shell_tx.send(ShellCommand::Data(data.into_bytes())).await;
                }
            }
        }
        ClientEvent::RefreshConnection => {
            if let Some(session) = ctx.registry.lookup(transport_id) {
                session.touch();
                session.emit(ServerEvent::ConnectionExists {
                    message: "Connection refreshed".to_string(),
                    session_id: session.id().to_string(),
                });
            }
        }
        ClientEvent::Disconnect => {
            if let Some(session) = ctx.registry.lookup(transport_id) {
                session.emit(ServerEvent::Closed {
                    message: "SSH session closed".to_string(),
                });
                destroy_session(ctx, &session).await;
            }
        }
    }
}
