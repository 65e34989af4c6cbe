// SPDX-License-Identifier: Apache-2.0
//!
//! The three connection hubs (agent, service, client) and the shutdown
//! controller.
//!
//! Each hub is an `axum` WebSocket listener bridging JSON frames to the
//! kernel's `dispatch`/`on_connect`/`on_disconnect` calls via a
//! `tokio::select!` over `socket.recv()` and an outbound queue — the
//! outbound side here is a per-connection queue fed by
//! [`conclave_kernel::Kernel`] through [`WsSink`] rather than a broadcast
//! subscription, since the kernel addresses connections individually
//! instead of fanning one event stream to every peer.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use conclave_ids::ConnectionId;
use conclave_kernel::{Kernel, KernelConfig, OutboundSink};
use conclave_proto::{Envelope, MessageContent, OriginKind};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind {endpoint} hub on {addr}: {source}")]
    Bind {
        endpoint: &'static str,
        addr: String,
        source: std::io::Error,
    },
    #[error("{endpoint} hub stopped serving: {source}")]
    Serve {
        endpoint: &'static str,
        source: std::io::Error,
    },
}

/// Bind addresses for the three hubs. Defaults match §6: agent 3000, client
/// 3001, service 3002, all loopback-only.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub agent_bind: String,
    pub client_bind: String,
    pub service_bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            agent_bind: "127.0.0.1:3000".to_string(),
            client_bind: "127.0.0.1:3001".to_string(),
            service_bind: "127.0.0.1:3002".to_string(),
        }
    }
}

/// The kernel's view of a live WebSocket connection: a queue of outbound
/// frames, drained by the connection's own task. Registering and sending are
/// split so the kernel never has to know which hub owns a given connection.
/// Exposed only so `Gateway::kernel()` can hand back a `&Arc<Kernel<WsSink>>`
/// for preconfiguration; nothing outside this crate constructs one.
#[derive(Default)]
pub struct WsSink {
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>,
}

impl WsSink {
    async fn register(&self, connection_id: ConnectionId, tx: mpsc::UnboundedSender<Message>) {
        self.connections.write().await.insert(connection_id, tx);
    }

    async fn unregister(&self, connection_id: &ConnectionId) {
        self.connections.write().await.remove(connection_id);
    }
}

#[async_trait::async_trait]
impl OutboundSink for WsSink {
    async fn send(&self, connection_id: ConnectionId, envelope: Envelope) -> bool {
        let Some(tx) = self.connections.read().await.get(&connection_id).cloned() else {
            return false;
        };
        let Ok(json) = serde_json::to_string(&envelope) else {
            return false;
        };
        tx.send(Message::Text(json)).is_ok()
    }
}

/// Owns the kernel, the three hubs, and the shutdown signal fanned out to
/// each hub's graceful-shutdown future.
pub struct Gateway {
    kernel: Arc<Kernel<WsSink>>,
    sink: Arc<WsSink>,
    config: GatewayConfig,
    shutdown_tx: broadcast::Sender<()>,
}

#[derive(Clone)]
struct HubState {
    origin: OriginKind,
    gateway: Arc<Gateway>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, kernel_config: KernelConfig) -> Arc<Self> {
        let sink = Arc::new(WsSink::default());
        let kernel = Kernel::new(sink.clone(), kernel_config);
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self { kernel, sink, config, shutdown_tx })
    }

    /// For wiring external registration/config (preconfigured agents,
    /// tool servers) before `run` is called.
    pub fn kernel(&self) -> &Arc<Kernel<WsSink>> {
        &self.kernel
    }

    /// Binds all three hubs and serves until `shutdown` is called or one of
    /// the listeners fails.
    pub async fn run(self: Arc<Self>) -> Result<(), GatewayError> {
        let agent_listener = bind("agent", &self.config.agent_bind).await?;
        let client_listener = bind("client", &self.config.client_bind).await?;
        let service_listener = bind("service", &self.config.service_bind).await?;

        info!(addr = %self.config.agent_bind, endpoint = "agent", "conclave-gateway: hub listening");
        info!(addr = %self.config.client_bind, endpoint = "client", "conclave-gateway: hub listening");
        info!(addr = %self.config.service_bind, endpoint = "service", "conclave-gateway: hub listening");

        let agent_router = hub_router(HubState { origin: OriginKind::Agent, gateway: self.clone() });
        let client_router = hub_router(HubState { origin: OriginKind::Client, gateway: self.clone() });
        let service_router = hub_router(HubState { origin: OriginKind::Service, gateway: self.clone() });

        let mut agent_shutdown = self.shutdown_tx.subscribe();
        let mut client_shutdown = self.shutdown_tx.subscribe();
        let mut service_shutdown = self.shutdown_tx.subscribe();

        let agent_fut = axum::serve(agent_listener, agent_router)
            .with_graceful_shutdown(async move { let _ = agent_shutdown.recv().await; });
        let client_fut = axum::serve(client_listener, client_router)
            .with_graceful_shutdown(async move { let _ = client_shutdown.recv().await; });
        let service_fut = axum::serve(service_listener, service_router)
            .with_graceful_shutdown(async move { let _ = service_shutdown.recv().await; });

        let (agent_result, client_result, service_result) = tokio::join!(agent_fut, client_fut, service_fut);
        agent_result.map_err(|source| GatewayError::Serve { endpoint: "agent", source })?;
        client_result.map_err(|source| GatewayError::Serve { endpoint: "client", source })?;
        service_result.map_err(|source| GatewayError::Serve { endpoint: "service", source })?;
        Ok(())
    }

    /// The shutdown controller (§4.8): stop accepting new connections on all
    /// three hubs, then reject pending waiters, offline every bound record,
    /// and terminate tool-server subprocesses. `run`'s listeners finish
    /// draining their already-accepted connections and return once this
    /// completes.
    pub async fn shutdown(&self) {
        info!("conclave-gateway: shutdown requested, draining hubs");
        let _ = self.shutdown_tx.send(());
        self.kernel.shutdown().await;
    }
}

async fn bind(endpoint: &'static str, addr: &str) -> Result<TcpListener, GatewayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind { endpoint, addr: addr.to_string(), source })
}

fn hub_router(state: HubState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: HubState) {
    let connection_id = ConnectionId::new();
    let (tx, mut outbox) = mpsc::unbounded_channel::<Message>();
    state.gateway.sink.register(connection_id, tx.clone()).await;
    info!(%connection_id, origin = ?state.origin, "peer connected");

    let welcome = state.gateway.kernel.on_connect(connection_id).await;
    send_envelope(&tx, &welcome);

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) => {
                                state.gateway.kernel.dispatch(state.origin, connection_id, envelope).await;
                            }
                            Err(e) => {
                                warn!(%connection_id, "malformed frame, channel stays open: {e}");
                                send_envelope(&tx, &Envelope::new(MessageContent::Error {
                                    error: format!("malformed JSON: {e}"),
                                    details: None,
                                }));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames carry no conclave message type
                    Some(Err(e)) => {
                        debug!(%connection_id, "WebSocket recv error: {e}");
                        break;
                    }
                }
            }
            outgoing = outbox.recv() => {
                match outgoing {
                    Some(msg) => {
                        if socket.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.gateway.kernel.on_disconnect(connection_id).await;
    state.gateway.sink.unregister(&connection_id).await;
    info!(%connection_id, "peer disconnected");
}

fn send_envelope(tx: &mpsc::UnboundedSender<Message>, envelope: &Envelope) {
    if let Ok(json) = serde_json::to_string(envelope) {
        let _ = tx.send(Message::Text(json));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_proto::PeerSummary;

    #[tokio::test]
    async fn sink_send_to_unregistered_connection_returns_false() {
        let sink = WsSink::default();
        let delivered = sink
            .send(ConnectionId::new(), Envelope::new(MessageContent::Pong { timestamp: None }))
            .await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn sink_send_delivers_and_unregister_stops_delivery() {
        let sink = WsSink::default();
        let conn = ConnectionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sink.register(conn, tx).await;

        assert!(sink.send(conn, Envelope::new(MessageContent::Pong { timestamp: None })).await);
        assert!(matches!(rx.recv().await, Some(Message::Text(_))));

        sink.unregister(&conn).await;
        assert!(!sink.send(conn, Envelope::new(MessageContent::Pong { timestamp: None })).await);
    }

    #[tokio::test]
    async fn gateway_shutdown_drains_kernel_state() {
        let gateway = Gateway::new(GatewayConfig::default(), KernelConfig::default());
        let conn = ConnectionId::new();
        gateway.kernel.on_connect(conn).await;
        gateway
            .kernel
            .dispatch(
                OriginKind::Agent,
                conn,
                Envelope::new(MessageContent::AgentRegister {
                    name: "Echo".into(),
                    capabilities: vec![],
                    manifest: serde_json::Value::Null,
                }),
            )
            .await;

        gateway.shutdown().await;

        let agents: Vec<PeerSummary> = gateway
            .kernel
            .agents
            .all(&conclave_proto::DiscoveryFilter::default())
            .await
            .into_iter()
            .map(|r| PeerSummary {
                id: r.id.to_string(),
                name: r.name,
                capabilities: r.capabilities,
                status: r.status.as_str().to_string(),
            })
            .collect();
        assert!(agents.iter().all(|a| a.status == "offline"));
    }
}
