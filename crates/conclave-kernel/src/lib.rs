// SPDX-License-Identifier: Apache-2.0
//!
//! The message kernel: a static `(originKind, type)` dispatch table plus the
//! lifecycle notifier that turns task-state changes into owner-bound
//! envelopes.
//!
//! Registries own identity, [`conclave_tasks::TaskRegistry`] owns state
//! machines, [`conclave_correlator::Correlator`] owns request/response
//! waits, [`conclave_tsp::TspAdapter`] owns tool subprocesses — the kernel
//! only wires them together per message, the same role `ControlService`
//! plays between its session map, its agent, and its transport handlers.
//!
//! Agent-to-agent delegation and synchronous service calls both reuse the
//! task's id as the correlator's wait key (`MessageId(task_id.0)`): the
//! lifecycle notifier tries `correlator.resolve()` on every terminal task
//! event first, and only falls back to generic owner-forwarding if nothing
//! was waiting on that id. That one check is what tells a client-owned
//! `task.create` apart from a delegated `agent.request` without a side
//! table — the former never registers a waiter.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conclave_correlator::{Correlator, CorrelatorError};
use conclave_ids::{AgentId, ClientId, ConnectionId, MessageId, ServiceId, TaskId};
use conclave_proto::{
    DiscoveryFilter, Envelope, MessageContent, OriginKind, PeerSummary, ToolExecutionStatus,
    ToolServerSummary,
};
use conclave_registry::{ConnectionRegistry, PeerRecord, Registry};
use conclave_tasks::{
    result_or_empty, AgentTask, OwnerKind, ServiceTask, TaskError, TaskRegistry, TaskStatus, TransitionDetails,
};
use conclave_tsp::TspAdapter;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// How the kernel reaches a connection it only knows by id. `conclave-gateway`
/// implements this over its live WebSocket sockets; tests implement it over
/// an in-memory channel.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    /// Delivers `envelope` to `connection_id`. Returns `false` if the
    /// connection is no longer open — the caller treats that as a routing
    /// failure, not a panic.
    async fn send(&self, connection_id: ConnectionId, envelope: Envelope) -> bool;
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub default_timeout: Duration,
    pub tool_timeout: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            tool_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
struct RawNotification {
    task_id: TaskId,
    owner_kind: OwnerKind,
    owner_id: String,
    data: Value,
}

/// The orchestration kernel. One instance serves an entire deployment; the
/// three hubs in `conclave-gateway` all dispatch into the same kernel.
pub struct Kernel<S: OutboundSink> {
    sink: Arc<S>,
    pub agents: Registry<AgentId>,
    pub services: Registry<ServiceId>,
    pub clients: Registry<ClientId>,
    pub connections: ConnectionRegistry,
    pub agent_tasks: Arc<TaskRegistry<AgentTask>>,
    pub service_tasks: Arc<TaskRegistry<ServiceTask>>,
    pub tsp: TspAdapter,
    correlator: Arc<Correlator>,
    notifications: broadcast::Sender<RawNotification>,
    config: KernelConfig,
}

impl<S: OutboundSink + 'static> Kernel<S> {
    pub fn new(sink: Arc<S>, config: KernelConfig) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(1024);
        let kernel = Arc::new(Self {
            sink,
            agents: Registry::new(),
            services: Registry::new(),
            clients: Registry::new(),
            connections: ConnectionRegistry::new(),
            agent_tasks: Arc::new(TaskRegistry::new()),
            service_tasks: Arc::new(TaskRegistry::new()),
            tsp: TspAdapter::new(),
            correlator: Arc::new(Correlator::new()),
            notifications,
            config,
        });
        kernel.clone().spawn_lifecycle_notifier();
        kernel
    }

    fn spawn_lifecycle_notifier(self: Arc<Self>) {
        let agent_events = self.agent_tasks.subscribe();
        let service_events = self.service_tasks.subscribe();
        let raw = self.notifications.subscribe();
        tokio::spawn(run_lifecycle_notifier(self, agent_events, service_events, raw));
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    pub async fn on_connect(&self, connection_id: ConnectionId) -> Envelope {
        self.connections.accept(connection_id).await;
        Envelope::new(MessageContent::OrchestratorWelcome {
            connection_id,
            orchestrator_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    pub async fn on_disconnect(&self, connection_id: ConnectionId) {
        self.correlator.cancel_for_connection(connection_id).await;
        if let Some(id) = self.agents.remove_by_connection_id(&connection_id).await {
            self.agent_tasks
                .fail_matching(|t: &AgentTask| t.agent_id == id, "agent_disconnected")
                .await;
        }
        self.services.remove_by_connection_id(&connection_id).await;
        self.clients.remove_by_connection_id(&connection_id).await;
        self.connections.remove(&connection_id).await;
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    pub async fn dispatch(&self, origin: OriginKind, connection_id: ConnectionId, envelope: Envelope) {
        let reply = match &envelope.content {
            MessageContent::AgentRegister { name, capabilities, manifest } => {
                Some(self.handle_register(connection_id, OriginKind::Agent, name.clone(), capabilities.clone(), manifest.clone()).await)
            }
            MessageContent::ServiceRegister { name, capabilities, manifest } => {
                Some(self.handle_register(connection_id, OriginKind::Service, name.clone(), capabilities.clone(), manifest.clone()).await)
            }
            MessageContent::ClientRegister { id } => {
                Some(self.handle_client_register(connection_id, id.clone()).await)
            }
            MessageContent::AgentListRequest { filter } => {
                Some(self.handle_discovery_agents(filter).await)
            }
            MessageContent::ServiceList { filter } => {
                Some(self.handle_discovery_services(filter).await)
            }
            MessageContent::McpServersList {} => Some(self.handle_mcp_servers_list().await),
            MessageContent::McpToolsList { server_id } => {
                Some(self.handle_mcp_tools_list(server_id).await)
            }
            MessageContent::Ping { timestamp } => {
                Some(Envelope::reply_to(envelope.id, MessageContent::Pong { timestamp: timestamp.clone() }))
            }
            MessageContent::TaskCreate { agent_name, task_data } => {
                self.handle_task_create(connection_id, envelope.id, agent_name, task_data.clone()).await
            }
            MessageContent::AgentRequest { target_agent_name, task_data } => {
                self.handle_agent_request(connection_id, envelope.id, target_agent_name, task_data.clone()).await
            }
            MessageContent::ServiceTaskRequest { service_id, service_name, function_name, params, is_async } => {
                self.handle_service_task_request(
                    connection_id,
                    envelope.id,
                    service_id.clone(),
                    service_name.clone(),
                    function_name.clone(),
                    params.clone(),
                    *is_async,
                )
                .await
            }
            MessageContent::McpToolExecute { server_id, tool_name, parameters } => {
                Some(self.handle_tool_execute(envelope.id, server_id, tool_name, parameters.clone()).await)
            }
            MessageContent::TaskResult { task_id, result } => {
                self.handle_task_terminal(*task_id, TaskStatus::Completed, Some(result.clone()), None).await;
                None
            }
            MessageContent::TaskError { task_id, error } => {
                self.handle_task_terminal(*task_id, TaskStatus::Failed, None, Some(error.clone())).await;
                None
            }
            MessageContent::ServiceTaskResult { task_id, result, error } => {
                let status = if error.is_some() { TaskStatus::Failed } else { TaskStatus::Completed };
                self.handle_service_task_terminal(*task_id, status, Some(result.clone()), error.clone()).await;
                None
            }
            MessageContent::TaskStatus { task_id, status } => {
                self.handle_task_status(*task_id, status).await;
                None
            }
            MessageContent::TaskNotification { task_id, data } => {
                self.handle_task_notification(*task_id, data.clone()).await;
                None
            }
            MessageContent::ServiceNotification { task_id, data } => {
                self.handle_service_notification(*task_id, data.clone()).await;
                None
            }
            _ => Some(Envelope::reply_to(
                envelope.id,
                MessageContent::Error { error: "UNSUPPORTED_TYPE".into(), details: None },
            )),
        };

        let _ = origin;
        if let Some(reply) = reply {
            self.sink.send(connection_id, reply).await;
        }
    }

    // ── Identity ─────────────────────────────────────────────────────────

    async fn handle_register(
        &self,
        connection_id: ConnectionId,
        kind: OriginKind,
        name: String,
        capabilities: Vec<String>,
        manifest: Value,
    ) -> Envelope {
        match kind {
            OriginKind::Agent => {
                let id = match self.agents.get_any_by_name(&name).await {
                    Some(existing) => existing.id,
                    None => AgentId::new(),
                };
                let record = PeerRecord::new(id, name.clone(), connection_id)
                    .with_capabilities(capabilities)
                    .with_manifest(manifest);
                self.agents.register(record).await;
                self.connections.bind(&connection_id, id.to_string()).await;
                Envelope::new(MessageContent::AgentRegistered { id: id.to_string(), name })
            }
            OriginKind::Service => {
                let id = match self.services.get_any_by_name(&name).await {
                    Some(existing) => existing.id,
                    None => ServiceId::new(),
                };
                let record = PeerRecord::new(id, name.clone(), connection_id)
                    .with_capabilities(capabilities)
                    .with_manifest(manifest);
                self.services.register(record).await;
                self.connections.bind(&connection_id, id.to_string()).await;
                Envelope::new(MessageContent::ServiceRegistered { id: id.to_string(), name })
            }
            OriginKind::Client => unreachable!("clients register via handle_client_register"),
        }
    }

    async fn handle_client_register(&self, connection_id: ConnectionId, requested_id: Option<String>) -> Envelope {
        let id = requested_id
            .and_then(|s| ClientId::from_str(&s).ok())
            .unwrap_or_default();
        let record = PeerRecord::new(id, id.to_string(), connection_id);
        self.clients.register(record).await;
        self.connections.bind(&connection_id, id.to_string()).await;
        Envelope::new(MessageContent::ClientRegistered { id: id.to_string() })
    }

    // ── Discovery ────────────────────────────────────────────────────────

    async fn handle_discovery_agents(&self, filter: &DiscoveryFilter) -> Envelope {
        let agents = self.agents.all(filter).await.into_iter().map(to_summary).collect();
        Envelope::new(MessageContent::AgentListResponse { agents })
    }

    async fn handle_discovery_services(&self, filter: &DiscoveryFilter) -> Envelope {
        let services = self.services.all(filter).await.into_iter().map(to_summary).collect();
        Envelope::new(MessageContent::ServiceListResult { services })
    }

    async fn handle_mcp_servers_list(&self) -> Envelope {
        let servers = self
            .tsp
            .list()
            .await
            .into_iter()
            .map(|s| ToolServerSummary { id: s.name.clone(), name: s.name, status: s.status.as_str().to_string() })
            .collect();
        Envelope::new(MessageContent::McpServersListResponse { servers })
    }

    async fn handle_mcp_tools_list(&self, server_id: &str) -> Envelope {
        let tools = self.tsp.view(server_id).await.map(|v| v.tools).unwrap_or_default();
        Envelope::new(MessageContent::McpToolsListResponse { tools })
    }

    // ── Task creation (client → agent) ──────────────────────────────────

    async fn handle_task_create(
        &self,
        client_connection: ConnectionId,
        request_id: MessageId,
        agent_name: &str,
        task_data: Value,
    ) -> Option<Envelope> {
        let Some(agent) = self.agents.get_by_name(agent_name).await else {
            return Some(Envelope::reply_to(
                request_id,
                MessageContent::Error { error: "AGENT_NOT_FOUND".into(), details: None },
            ));
        };
        let Some(agent_connection) = agent.connection_id else {
            return Some(Envelope::reply_to(
                request_id,
                MessageContent::Error { error: "AGENT_NOT_FOUND".into(), details: None },
            ));
        };

        let client_id = self.owner_id_for_connection(&client_connection).await.unwrap_or_default();
        let task_type = task_data
            .get("taskType")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let task = AgentTask::new(agent.id, OwnerKind::Client, client_id, task_type.clone(), task_data.clone());
        let task_id = task.task_id;
        self.agent_tasks.create(task).await;

        let ack = Envelope::reply_to(request_id, MessageContent::TaskCreated { task_id });
        self.sink.send(client_connection, ack).await;

        let exec = exec_envelope(task_id, task_type, task_data);
        let delivered = self.sink.send(agent_connection, exec).await;
        let next = if delivered { TaskStatus::InProgress } else { TaskStatus::Failed };
        let details = if delivered {
            TransitionDetails::default()
        } else {
            TransitionDetails { result: None, error: Some("agent channel unavailable".into()) }
        };
        let _ = self.agent_tasks.update_status(&task_id, next, details).await;
        None
    }

    // ── Agent-to-agent delegation ────────────────────────────────────────

    async fn handle_agent_request(
        &self,
        from_connection: ConnectionId,
        request_id: MessageId,
        target_agent_name: &str,
        task_data: Value,
    ) -> Option<Envelope> {
        let Some(target) = self.agents.get_by_name(target_agent_name).await else {
            return Some(Envelope::reply_to(
                request_id,
                MessageContent::Error { error: "AGENT_NOT_FOUND".into(), details: None },
            ));
        };
        let Some(target_connection) = target.connection_id else {
            return Some(Envelope::reply_to(
                request_id,
                MessageContent::Error { error: "AGENT_NOT_FOUND".into(), details: None },
            ));
        };
        let from_agent_id = self.owner_id_for_connection(&from_connection).await.unwrap_or_default();
        let task_type = task_data.get("taskType").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
        let task = AgentTask::new(target.id, OwnerKind::Agent, from_agent_id, task_type.clone(), task_data.clone());
        let task_id = task.task_id;
        self.agent_tasks.create(task).await;

        let exec = exec_envelope(task_id, task_type, task_data);
        let delivered = self.sink.send(target_connection, exec).await;
        if !delivered {
            let _ = self
                .agent_tasks
                .update_status(&task_id, TaskStatus::Failed, TransitionDetails { result: None, error: Some("target channel unavailable".into()) })
                .await;
            return Some(Envelope::reply_to(
                request_id,
                MessageContent::Error { error: "AGENT_NOT_FOUND".into(), details: None },
            ));
        }
        let _ = self.agent_tasks.update_status(&task_id, TaskStatus::InProgress, TransitionDetails::default()).await;

        // The caller isn't blocked on this dispatch call: it gets
        // `agent.request.accepted` now and `agent.response` later, once the
        // lifecycle notifier sees the delegated task settle and resolves
        // this wait.
        spawn_correlated_reply(
            self.correlator.clone(),
            self.sink.clone(),
            MessageId(task_id.0),
            from_connection,
            request_id,
            self.config.default_timeout,
        );

        Some(Envelope::reply_to(request_id, MessageContent::AgentRequestAccepted { task_id }))
    }

    // ── Service calls ────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn handle_service_task_request(
        &self,
        from_connection: ConnectionId,
        request_id: MessageId,
        service_id: Option<String>,
        service_name: Option<String>,
        function_name: String,
        params: Value,
        is_async: bool,
    ) -> Option<Envelope> {
        let service = if let Some(id) = service_id.as_deref().and_then(|s| ServiceId::from_str(s).ok()) {
            self.services.get_by_id(&id).await
        } else if let Some(name) = &service_name {
            self.services.get_by_name(name).await
        } else {
            None
        };
        let Some(service) = service else {
            return Some(Envelope::reply_to(
                request_id,
                MessageContent::Error { error: "SERVICE_NOT_FOUND".into(), details: None },
            ));
        };
        let Some(service_connection) = service.connection_id else {
            return Some(Envelope::reply_to(
                request_id,
                MessageContent::Error { error: "SERVICE_NOT_FOUND".into(), details: None },
            ));
        };
        let from_agent_id = self
            .owner_id_for_connection(&from_connection)
            .await
            .and_then(|s| AgentId::from_str(&s).ok())
            .unwrap_or_default();

        let task = ServiceTask::new(service.id, from_agent_id, function_name.clone(), params.clone());
        let task_id = task.task_id;
        self.service_tasks.create(task).await;

        let exec = Envelope {
            id: MessageId(task_id.0),
            content: MessageContent::ServiceTaskExecute { task_id, function_name, params },
            request_id: None,
            timestamp: Some(conclave_ids::now_rfc3339()),
        };
        let delivered = self.sink.send(service_connection, exec).await;
        if !delivered {
            let _ = self
                .service_tasks
                .update_status(&task_id, TaskStatus::Failed, TransitionDetails { result: None, error: Some("service channel unavailable".into()) })
                .await;
            return Some(Envelope::reply_to(
                request_id,
                MessageContent::Error { error: "SERVICE_NOT_FOUND".into(), details: None },
            ));
        }
        let _ = self.service_tasks.update_status(&task_id, TaskStatus::InProgress, TransitionDetails::default()).await;

        if is_async {
            Some(Envelope::reply_to(request_id, MessageContent::TaskCreated { task_id }))
        } else {
            spawn_correlated_reply(
                self.correlator.clone(),
                self.sink.clone(),
                MessageId(task_id.0),
                from_connection,
                request_id,
                self.config.default_timeout,
            );
            None
        }
    }

    async fn handle_service_notification(&self, task_id: TaskId, data: Value) {
        if let Some(task) = self.service_tasks.get(&task_id).await {
            let _ = self.notifications.send(RawNotification {
                task_id,
                owner_kind: OwnerKind::Agent,
                owner_id: task.owner_agent_id.to_string(),
                data,
            });
        }
    }

    // ── Tool invocation ──────────────────────────────────────────────────

    async fn handle_tool_execute(&self, request_id: MessageId, server_id: &str, tool_name: &str, parameters: Value) -> Envelope {
        match tokio::time::timeout(self.config.tool_timeout, self.tsp.call_tool(server_id, tool_name, parameters)).await {
            Ok(Ok(outcome)) if !outcome.is_error => Envelope::reply_to(
                request_id,
                MessageContent::McpToolExecutionResult {
                    status: ToolExecutionStatus::Success,
                    result: Some(Value::String(outcome.text)),
                    error: None,
                },
            ),
            Ok(Ok(outcome)) => Envelope::reply_to(
                request_id,
                MessageContent::McpToolExecutionResult { status: ToolExecutionStatus::Error, result: None, error: Some(outcome.text) },
            ),
            Ok(Err(e)) => Envelope::reply_to(
                request_id,
                MessageContent::McpToolExecutionResult { status: ToolExecutionStatus::Error, result: None, error: Some(e.to_string()) },
            ),
            Err(_) => Envelope::reply_to(
                request_id,
                MessageContent::McpToolExecutionResult { status: ToolExecutionStatus::Error, result: None, error: Some("timeout".into()) },
            ),
        }
    }

    // ── Task results / progress from an agent ───────────────────────────

    async fn handle_task_terminal(&self, task_id: TaskId, status: TaskStatus, result: Option<Value>, error: Option<String>) {
        match self.agent_tasks.update_status(&task_id, status, TransitionDetails { result, error }).await {
            Ok(()) => {}
            Err(TaskError::InvalidTransition { .. }) => {
                warn!(%task_id, "dropped a second terminal transition for an already-terminal task");
            }
            Err(TaskError::NotFound(_)) => {
                warn!(%task_id, "task.result/task.error referenced an unknown task");
            }
        }
    }

    async fn handle_service_task_terminal(&self, task_id: TaskId, status: TaskStatus, result: Option<Value>, error: Option<String>) {
        match self.service_tasks.update_status(&task_id, status, TransitionDetails { result, error }).await {
            Ok(()) => {}
            Err(TaskError::InvalidTransition { .. }) => {
                warn!(%task_id, "dropped a second terminal transition for an already-terminal service task");
            }
            Err(TaskError::NotFound(_)) => {
                warn!(%task_id, "service.task.result referenced an unknown task");
            }
        }
    }

    async fn handle_task_status(&self, task_id: TaskId, status: &str) {
        let next = match status {
            "pending" => TaskStatus::Pending,
            "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => {
                warn!(%task_id, status, "task.status carried an unrecognized status string");
                return;
            }
        };
        // A `completed` status with no prior `task.result` still delivers
        // exactly one terminal notification, with an empty result.
        let details = if next == TaskStatus::Completed {
            TransitionDetails { result: Some(result_or_empty(None)), error: None }
        } else {
            TransitionDetails::default()
        };
        match self.agent_tasks.update_status(&task_id, next, details).await {
            Ok(()) => {}
            Err(TaskError::InvalidTransition { .. }) => {
                // Redundant or already-terminal status updates are dropped, never fatal.
            }
            Err(TaskError::NotFound(_)) => {
                warn!(%task_id, "task.status referenced an unknown task");
            }
        }
    }

    async fn handle_task_notification(&self, task_id: TaskId, data: Value) {
        if let Some(task) = self.agent_tasks.get(&task_id).await {
            let _ = self.notifications.send(RawNotification {
                task_id,
                owner_kind: task.owner_kind,
                owner_id: task.owner_id.clone(),
                data,
            });
        }
    }

    async fn owner_id_for_connection(&self, connection_id: &ConnectionId) -> Option<String> {
        match self.connections.state(connection_id).await {
            Some(conclave_registry::ConnectionState::Bound { peer_id }) => Some(peer_id),
            _ => None,
        }
    }

    async fn owner_connection(&self, owner_kind: OwnerKind, owner_id: &str) -> Option<ConnectionId> {
        match owner_kind {
            OwnerKind::Client => {
                let id = ClientId::from_str(owner_id).ok()?;
                self.clients.get_by_id(&id).await?.connection_id
            }
            OwnerKind::Agent => {
                let id = AgentId::from_str(owner_id).ok()?;
                self.agents.get_by_id(&id).await?.connection_id
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Rejects every pending correlator wait, offlines every registry
    /// record, and terminates every tool-server subprocess. Called once by
    /// `conclave-gateway`'s shutdown controller after listeners stop
    /// accepting new connections, before they close.
    pub async fn shutdown(&self) {
        self.correlator.cancel_all().await;
        self.agents.offline_all().await;
        self.services.offline_all().await;
        self.clients.offline_all().await;
        self.tsp.shutdown_all().await;
    }
}

fn exec_envelope(task_id: TaskId, task_type: String, data: Value) -> Envelope {
    Envelope {
        id: MessageId(task_id.0),
        content: MessageContent::TaskExecute { task_id, task_type, data },
        request_id: None,
        timestamp: Some(conclave_ids::now_rfc3339()),
    }
}

fn to_summary<Id: std::fmt::Display>(record: PeerRecord<Id>) -> PeerSummary {
    PeerSummary {
        id: record.id.to_string(),
        name: record.name,
        capabilities: record.capabilities,
        status: record.status.as_str().to_string(),
    }
}

/// Spawns the waiting half of a correlated call: blocks on `wait_key` and,
/// once the lifecycle notifier resolves it, or the wait times out, or the
/// requester's connection drops, forwards the outcome back to
/// `reply_connection` addressed by `reply_request_id`.
fn spawn_correlated_reply<S: OutboundSink + 'static>(
    correlator: Arc<Correlator>,
    sink: Arc<S>,
    wait_key: MessageId,
    reply_connection: ConnectionId,
    reply_request_id: MessageId,
    timeout: Duration,
) {
    tokio::spawn(async move {
        let outcome = correlator.await_reply(wait_key, None, Some(reply_connection), timeout).await;
        let content = match outcome {
            Ok(env) => env.content,
            Err(CorrelatorError::Timeout) => MessageContent::Error { error: "TIMEOUT".into(), details: None },
            Err(CorrelatorError::ConnectionClosed) => return,
            Err(CorrelatorError::PeerError(msg)) => MessageContent::Error { error: msg, details: None },
            Err(CorrelatorError::ServerStopped) => MessageContent::Error { error: "SERVER_STOPPED".into(), details: None },
        };
        sink.send(reply_connection, Envelope::reply_to(reply_request_id, content)).await;
    });
}

async fn run_lifecycle_notifier<S: OutboundSink + 'static>(
    kernel: Arc<Kernel<S>>,
    mut agent_events: broadcast::Receiver<conclave_tasks::TaskEvent>,
    mut service_events: broadcast::Receiver<conclave_tasks::TaskEvent>,
    mut raw: broadcast::Receiver<RawNotification>,
) {
    loop {
        tokio::select! {
            ev = agent_events.recv() => {
                let Ok(ev) = ev else { continue };
                notify_agent_task(&kernel, ev).await;
            }
            ev = service_events.recv() => {
                let Ok(ev) = ev else { continue };
                notify_service_task(&kernel, ev).await;
            }
            n = raw.recv() => {
                let Ok(n) = n else { continue };
                if let Some(conn) = kernel.owner_connection(n.owner_kind, &n.owner_id).await {
                    kernel
                        .sink
                        .send(conn, Envelope::new(MessageContent::TaskNotification { task_id: n.task_id, data: n.data }))
                        .await;
                }
            }
        }
    }
}

async fn notify_agent_task<S: OutboundSink + 'static>(kernel: &Arc<Kernel<S>>, ev: conclave_tasks::TaskEvent) {
    if !ev.next.is_terminal() {
        return;
    }

    let synthetic = Envelope::reply_to(
        MessageId(ev.task_id.0),
        MessageContent::AgentResponse { result: ev.result.clone().unwrap_or(Value::Null), error: ev.error.clone() },
    );
    if kernel.correlator.resolve(synthetic).await {
        // A delegating agent was waiting on this task's completion — it
        // already got its reply.
        return;
    }

    let Some(task) = kernel.agent_tasks.get(&ev.task_id).await else { return };
    let Some(conn) = kernel.owner_connection(task.owner_kind, &task.owner_id).await else {
        info!(task_id = %ev.task_id, "owner offline, dropping task notification");
        return;
    };

    let content = match ev.next {
        TaskStatus::Completed => MessageContent::TaskResult { task_id: ev.task_id, result: ev.result.unwrap_or(Value::Null) },
        TaskStatus::Failed => MessageContent::TaskError { task_id: ev.task_id, error: ev.error.unwrap_or_default() },
        other => MessageContent::TaskStatus { task_id: ev.task_id, status: status_str(other).to_string() },
    };
    kernel.sink.send(conn, Envelope::new(content)).await;
}

async fn notify_service_task<S: OutboundSink + 'static>(kernel: &Arc<Kernel<S>>, ev: conclave_tasks::TaskEvent) {
    if !ev.next.is_terminal() {
        return;
    }

    let content = MessageContent::ServiceTaskResult { task_id: ev.task_id, result: ev.result.clone().unwrap_or(Value::Null), error: ev.error.clone() };
    let synthetic = Envelope::reply_to(MessageId(ev.task_id.0), content.clone());
    if kernel.correlator.resolve(synthetic).await {
        return;
    }

    // An async service call has no waiter: the owning agent still gets the
    // result, just as an unsolicited push rather than a correlated reply.
    let Some(task) = kernel.service_tasks.get(&ev.task_id).await else { return };
    if let Some(conn) = kernel.owner_connection(OwnerKind::Agent, &task.owner_agent_id.to_string()).await {
        kernel.sink.send(conn, Envelope::new(content)).await;
    }
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::time::Duration as TokioDuration;

    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<(ConnectionId, Envelope)>>,
    }

    #[async_trait]
    impl OutboundSink for RecordingSink {
        async fn send(&self, connection_id: ConnectionId, envelope: Envelope) -> bool {
            self.sent.lock().unwrap().push((connection_id, envelope));
            true
        }
    }

    impl RecordingSink {
        fn drain_for(&self, connection_id: ConnectionId) -> Vec<MessageContent> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| *c == connection_id)
                .map(|(_, e)| e.content.clone())
                .collect()
        }
    }

    async fn wait_until<F: Fn() -> bool>(f: F) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(TokioDuration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    async fn wait_until_async<F: Fn() -> Fut, Fut: std::future::Future<Output = bool>>(f: F) {
        for _ in 0..200 {
            if f().await {
                return;
            }
            tokio::time::sleep(TokioDuration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn s1_client_task_round_trips_to_result() {
        let sink = Arc::new(RecordingSink::default());
        let kernel = Kernel::new(sink.clone(), KernelConfig::default());

        let agent_conn = ConnectionId::new();
        let client_conn = ConnectionId::new();
        kernel.on_connect(agent_conn).await;
        kernel.on_connect(client_conn).await;

        kernel
            .dispatch(
                OriginKind::Agent,
                agent_conn,
                Envelope::new(MessageContent::AgentRegister { name: "Echo".into(), capabilities: vec!["echo".into()], manifest: Value::Null }),
            )
            .await;
        kernel
            .dispatch(OriginKind::Client, client_conn, Envelope::new(MessageContent::ClientRegister { id: None }))
            .await;

        let create = Envelope::new(MessageContent::TaskCreate {
            agent_name: "Echo".into(),
            task_data: serde_json::json!({"taskType": "echo", "text": "hi"}),
        });
        kernel.dispatch(OriginKind::Client, client_conn, create).await;

        let client_msgs = sink.drain_for(client_conn);
        let task_id = match client_msgs.iter().find_map(|c| match c {
            MessageContent::TaskCreated { task_id } => Some(*task_id),
            _ => None,
        }) {
            Some(id) => id,
            None => panic!("expected task.created"),
        };

        let agent_msgs = sink.drain_for(agent_conn);
        assert!(agent_msgs.iter().any(|c| matches!(c, MessageContent::TaskExecute { task_id: t, .. } if *t == task_id)));

        let result_env = Envelope::reply_to(MessageId(task_id.0), MessageContent::TaskResult { task_id, result: serde_json::json!({"text": "hi"}) });
        kernel.dispatch(OriginKind::Agent, agent_conn, result_env).await;

        wait_until(|| {
            sink.drain_for(client_conn)
                .iter()
                .any(|c| matches!(c, MessageContent::TaskResult { result, .. } if result["text"] == "hi"))
        })
        .await;

        let task = kernel.agent_tasks.get(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn s2_missing_agent_replies_with_error_and_creates_no_task() {
        let sink = Arc::new(RecordingSink::default());
        let kernel = Kernel::new(sink.clone(), KernelConfig::default());
        let client_conn = ConnectionId::new();
        kernel.on_connect(client_conn).await;

        let create = Envelope::new(MessageContent::TaskCreate { agent_name: "Ghost".into(), task_data: Value::Null });
        kernel.dispatch(OriginKind::Client, client_conn, create).await;

        let msgs = sink.drain_for(client_conn);
        assert!(msgs.iter().any(|c| matches!(c, MessageContent::Error { error, .. } if error == "AGENT_NOT_FOUND")));
    }

    #[tokio::test]
    async fn s3_agent_delegation_returns_agent_response_via_correlator() {
        let sink = Arc::new(RecordingSink::default());
        let kernel = Kernel::new(sink.clone(), KernelConfig::default());
        let a_conn = ConnectionId::new();
        let b_conn = ConnectionId::new();
        kernel.on_connect(a_conn).await;
        kernel.on_connect(b_conn).await;
        kernel
            .dispatch(OriginKind::Agent, a_conn, Envelope::new(MessageContent::AgentRegister { name: "A".into(), capabilities: vec![], manifest: Value::Null }))
            .await;
        kernel
            .dispatch(OriginKind::Agent, b_conn, Envelope::new(MessageContent::AgentRegister { name: "B".into(), capabilities: vec![], manifest: Value::Null }))
            .await;

        let req = Envelope::new(MessageContent::AgentRequest {
            target_agent_name: "B".into(),
            task_data: serde_json::json!({"taskType": "sum", "a": 1, "b": 2}),
        });
        kernel.dispatch(OriginKind::Agent, a_conn, req).await;

        assert_eq!(kernel.correlator.pending_count().await, 1);

        let b_msgs = sink.drain_for(b_conn);
        let task_id = b_msgs
            .iter()
            .find_map(|c| match c {
                MessageContent::TaskExecute { task_id, .. } => Some(*task_id),
                _ => None,
            })
            .expect("B should receive task.execute");

        let result = Envelope::reply_to(MessageId(task_id.0), MessageContent::TaskResult { task_id, result: serde_json::json!({"sum": 3}) });
        kernel.dispatch(OriginKind::Agent, b_conn, result).await;

        wait_until(|| {
            sink.drain_for(a_conn)
                .iter()
                .any(|c| matches!(c, MessageContent::AgentResponse { result, .. } if result["sum"] == 3))
        })
        .await;
        assert_eq!(kernel.correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn synchronous_service_call_blocks_the_caller_until_correlated() {
        let sink = Arc::new(RecordingSink::default());
        let kernel = Kernel::new(sink.clone(), KernelConfig::default());
        let agent_conn = ConnectionId::new();
        let service_conn = ConnectionId::new();
        kernel.on_connect(agent_conn).await;
        kernel.on_connect(service_conn).await;
        kernel
            .dispatch(OriginKind::Agent, agent_conn, Envelope::new(MessageContent::AgentRegister { name: "A".into(), capabilities: vec![], manifest: Value::Null }))
            .await;
        kernel
            .dispatch(OriginKind::Service, service_conn, Envelope::new(MessageContent::ServiceRegister { name: "Math".into(), capabilities: vec![], manifest: Value::Null }))
            .await;

        let req = Envelope::new(MessageContent::ServiceTaskRequest {
            service_id: None,
            service_name: Some("Math".into()),
            function_name: "add".into(),
            params: serde_json::json!({"a": 1, "b": 2}),
            is_async: false,
        });
        kernel.dispatch(OriginKind::Agent, agent_conn, req).await;

        // A synchronous call gets no immediate ack — only the eventual result.
        assert!(sink.drain_for(agent_conn).is_empty());

        let service_msgs = sink.drain_for(service_conn);
        let task_id = service_msgs
            .iter()
            .find_map(|c| match c {
                MessageContent::ServiceTaskExecute { task_id, .. } => Some(*task_id),
                _ => None,
            })
            .expect("service should receive service.task.execute");

        let result = Envelope::reply_to(
            MessageId(task_id.0),
            MessageContent::ServiceTaskResult { task_id, result: serde_json::json!({"sum": 3}), error: None },
        );
        kernel.dispatch(OriginKind::Service, service_conn, result).await;

        wait_until(|| {
            sink.drain_for(agent_conn)
                .iter()
                .any(|c| matches!(c, MessageContent::ServiceTaskResult { result, .. } if result["sum"] == 3))
        })
        .await;
    }

    #[tokio::test]
    async fn task_status_completed_without_result_delivers_empty_result() {
        let sink = Arc::new(RecordingSink::default());
        let kernel = Kernel::new(sink.clone(), KernelConfig::default());
        let agent_conn = ConnectionId::new();
        let client_conn = ConnectionId::new();
        kernel.on_connect(agent_conn).await;
        kernel.on_connect(client_conn).await;
        kernel
            .dispatch(OriginKind::Agent, agent_conn, Envelope::new(MessageContent::AgentRegister { name: "Echo".into(), capabilities: vec![], manifest: Value::Null }))
            .await;
        kernel.dispatch(OriginKind::Client, client_conn, Envelope::new(MessageContent::ClientRegister { id: None })).await;

        let create = Envelope::new(MessageContent::TaskCreate { agent_name: "Echo".into(), task_data: serde_json::json!({"taskType": "echo"}) });
        kernel.dispatch(OriginKind::Client, client_conn, create).await;
        let task_id = sink
            .drain_for(client_conn)
            .iter()
            .find_map(|c| match c {
                MessageContent::TaskCreated { task_id } => Some(*task_id),
                _ => None,
            })
            .unwrap();

        let status = Envelope::reply_to(MessageId(task_id.0), MessageContent::TaskStatus { task_id, status: "completed".into() });
        kernel.dispatch(OriginKind::Agent, agent_conn, status).await;

        wait_until(|| {
            sink.drain_for(client_conn)
                .iter()
                .any(|c| matches!(c, MessageContent::TaskResult { result, .. } if *result == Value::Null))
        })
        .await;

        let task = kernel.agent_tasks.get(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn reregistering_under_the_same_name_reuses_the_previous_id() {
        let sink = Arc::new(RecordingSink::default());
        let kernel = Kernel::new(sink.clone(), KernelConfig::default());
        let first_conn = ConnectionId::new();
        kernel.on_connect(first_conn).await;
        kernel
            .dispatch(
                OriginKind::Agent,
                first_conn,
                Envelope::new(MessageContent::AgentRegister { name: "Echo".into(), capabilities: vec!["echo".into()], manifest: Value::Null }),
            )
            .await;
        let first_id = sink
            .drain_for(first_conn)
            .iter()
            .find_map(|c| match c {
                MessageContent::AgentRegistered { id, .. } => Some(id.clone()),
                _ => None,
            })
            .unwrap();

        kernel.on_disconnect(first_conn).await;

        let second_conn = ConnectionId::new();
        kernel.on_connect(second_conn).await;
        kernel
            .dispatch(
                OriginKind::Agent,
                second_conn,
                Envelope::new(MessageContent::AgentRegister { name: "Echo".into(), capabilities: vec!["echo".into()], manifest: Value::Null }),
            )
            .await;
        let second_id = sink
            .drain_for(second_conn)
            .iter()
            .find_map(|c| match c {
                MessageContent::AgentRegistered { id, .. } => Some(id.clone()),
                _ => None,
            })
            .unwrap();

        assert_eq!(first_id, second_id);
        let record = kernel.agents.get_by_name("Echo").await.unwrap();
        assert_eq!(record.status, conclave_registry::PeerStatus::Online);
        assert_eq!(record.capabilities, vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn disconnecting_agent_fails_its_in_progress_tasks() {
        let sink = Arc::new(RecordingSink::default());
        let kernel = Kernel::new(sink.clone(), KernelConfig::default());
        let agent_conn = ConnectionId::new();
        let client_conn = ConnectionId::new();
        kernel.on_connect(agent_conn).await;
        kernel.on_connect(client_conn).await;
        kernel
            .dispatch(OriginKind::Agent, agent_conn, Envelope::new(MessageContent::AgentRegister { name: "Echo".into(), capabilities: vec![], manifest: Value::Null }))
            .await;
        kernel.dispatch(OriginKind::Client, client_conn, Envelope::new(MessageContent::ClientRegister { id: None })).await;
        let create = Envelope::new(MessageContent::TaskCreate { agent_name: "Echo".into(), task_data: serde_json::json!({"taskType": "echo"}) });
        kernel.dispatch(OriginKind::Client, client_conn, create).await;
        let task_id = sink
            .drain_for(client_conn)
            .iter()
            .find_map(|c| match c {
                MessageContent::TaskCreated { task_id } => Some(*task_id),
                _ => None,
            })
            .unwrap();

        kernel.on_disconnect(agent_conn).await;

        wait_until(|| {
            sink.drain_for(client_conn)
                .iter()
                .any(|c| matches!(c, MessageContent::TaskError { .. }))
        })
        .await;

        let task = kernel.agent_tasks.get(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn disconnecting_delegator_cancels_its_pending_wait() {
        let sink = Arc::new(RecordingSink::default());
        let kernel = Kernel::new(sink.clone(), KernelConfig::default());
        let a_conn = ConnectionId::new();
        let b_conn = ConnectionId::new();
        kernel.on_connect(a_conn).await;
        kernel.on_connect(b_conn).await;
        kernel
            .dispatch(OriginKind::Agent, a_conn, Envelope::new(MessageContent::AgentRegister { name: "A".into(), capabilities: vec![], manifest: Value::Null }))
            .await;
        kernel
            .dispatch(OriginKind::Agent, b_conn, Envelope::new(MessageContent::AgentRegister { name: "B".into(), capabilities: vec![], manifest: Value::Null }))
            .await;
        kernel
            .dispatch(
                OriginKind::Agent,
                a_conn,
                Envelope::new(MessageContent::AgentRequest { target_agent_name: "B".into(), task_data: serde_json::json!({"taskType": "sum"}) }),
            )
            .await;
        assert_eq!(kernel.correlator.pending_count().await, 1);

        kernel.on_disconnect(a_conn).await;
        wait_until_async(|| async { kernel.correlator.pending_count().await == 0 }).await;
    }

    #[tokio::test]
    async fn shutdown_offlines_peers_and_cancels_pending_waits() {
        let sink = Arc::new(RecordingSink::default());
        let kernel = Kernel::new(sink.clone(), KernelConfig::default());
        let a_conn = ConnectionId::new();
        let b_conn = ConnectionId::new();
        kernel.on_connect(a_conn).await;
        kernel.on_connect(b_conn).await;
        kernel
            .dispatch(OriginKind::Agent, a_conn, Envelope::new(MessageContent::AgentRegister { name: "A".into(), capabilities: vec![], manifest: Value::Null }))
            .await;
        kernel
            .dispatch(OriginKind::Agent, b_conn, Envelope::new(MessageContent::AgentRegister { name: "B".into(), capabilities: vec![], manifest: Value::Null }))
            .await;
        kernel
            .dispatch(
                OriginKind::Agent,
                a_conn,
                Envelope::new(MessageContent::AgentRequest { target_agent_name: "B".into(), task_data: serde_json::json!({"taskType": "sum"}) }),
            )
            .await;
        assert_eq!(kernel.correlator.pending_count().await, 1);

        kernel.shutdown().await;

        assert_eq!(kernel.correlator.pending_count().await, 0);
        let filter = DiscoveryFilter::default();
        for rec in kernel.agents.all(&filter).await {
            assert_eq!(rec.status, conclave_registry::PeerStatus::Offline);
        }
    }
}
