// SPDX-License-Identifier: Apache-2.0
//!
//! Wire envelope and message vocabulary exchanged between the orchestrator
//! and its peers.
//!
//! Every message is one JSON object: an `id`, a `type`, a `type`-shaped
//! `content`, and two optional fields (`requestId`, `timestamp`). Rather than
//! keep `content` as an open map, [`MessageContent`] is an internally tagged
//! enum keyed on `type` — a peer sending an unknown or malformed `content`
//! shape fails to deserialize instead of silently producing garbage further
//! down the dispatch table.
//!
//! ```rust
//! use conclave_proto::{Envelope, MessageContent};
//!
//! let env = Envelope::new(MessageContent::Ping { timestamp: None });
//! let json = serde_json::to_string(&env).unwrap();
//! let back: Envelope = serde_json::from_str(&json).unwrap();
//! assert!(matches!(back.content, MessageContent::Ping { .. }));
//! ```

use conclave_ids::{ConnectionId, MessageId, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which hub a peer connected through; carried alongside an envelope once it
/// reaches the kernel (not itself part of the wire format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    Agent,
    Service,
    Client,
}

/// The full wire envelope. `request_id` marks this message as a reply to an
/// earlier one; `timestamp` is assigned by the orchestrator on egress and
/// ignored (not required) on ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    #[serde(flatten)]
    pub content: MessageContent,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<String>,
}

impl Envelope {
    pub fn new(content: MessageContent) -> Self {
        Self {
            id: MessageId::new(),
            content,
            request_id: None,
            timestamp: Some(conclave_ids::now_rfc3339()),
        }
    }

    pub fn reply_to(request_id: MessageId, content: MessageContent) -> Self {
        Self {
            id: MessageId::new(),
            content,
            request_id: Some(request_id),
            timestamp: Some(conclave_ids::now_rfc3339()),
        }
    }
}

/// Public projection of a registry record, used by discovery replies. Never
/// carries a connection handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub status: String,
}

/// Descriptor of a single tool exposed by a tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// Descriptor of a registered tool server, for `mcp.servers.list.response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerSummary {
    pub id: String,
    pub name: String,
    pub status: String,
}

/// A filter applied to discovery requests (`agent.list.request`,
/// `service.list`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryFilter {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
}

/// The full §6 message vocabulary, tagged on the wire by `type` in
/// `snake_case.dot.notation`. A handful of legacy aliases (e.g.
/// `mcp.servers.list.request` for `mcp.servers.list`) are accepted via
/// `#[serde(alias = ...)]` so the dispatch table never needs a second match
/// arm for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    // ── Identity ──────────────────────────────────────────────────────────
    #[serde(rename = "orchestrator.welcome")]
    OrchestratorWelcome {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
        #[serde(rename = "orchestratorVersion")]
        orchestrator_version: String,
    },
    #[serde(rename = "agent.register")]
    AgentRegister {
        name: String,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        manifest: Value,
    },
    #[serde(rename = "agent.registered")]
    AgentRegistered { id: String, name: String },
    #[serde(rename = "service.register")]
    ServiceRegister {
        name: String,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        manifest: Value,
    },
    #[serde(rename = "service.registered")]
    ServiceRegistered { id: String, name: String },
    #[serde(rename = "client.register")]
    ClientRegister {
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "client.registered")]
    ClientRegistered { id: String },

    // ── Discovery ─────────────────────────────────────────────────────────
    #[serde(rename = "agent.list.request")]
    AgentListRequest {
        #[serde(default)]
        filter: DiscoveryFilter,
    },
    #[serde(rename = "agent.list.response")]
    AgentListResponse { agents: Vec<PeerSummary> },
    #[serde(rename = "service.list")]
    ServiceList {
        #[serde(default)]
        filter: DiscoveryFilter,
    },
    #[serde(rename = "service.list.result")]
    ServiceListResult { services: Vec<PeerSummary> },
    #[serde(rename = "mcp.servers.list", alias = "mcp.servers.list.request")]
    McpServersList {},
    #[serde(rename = "mcp.servers.list.response")]
    McpServersListResponse { servers: Vec<ToolServerSummary> },
    #[serde(rename = "mcp.tools.list", alias = "mcp.tools.list.request")]
    McpToolsList {
        #[serde(rename = "serverId")]
        server_id: String,
    },
    #[serde(rename = "mcp.tools.list.response")]
    McpToolsListResponse { tools: Vec<ToolDescriptor> },

    // ── Tasks ─────────────────────────────────────────────────────────────
    #[serde(rename = "task.create")]
    TaskCreate {
        #[serde(rename = "agentName")]
        agent_name: String,
        #[serde(rename = "taskData")]
        task_data: Value,
    },
    #[serde(rename = "task.created")]
    TaskCreated {
        #[serde(rename = "taskId")]
        task_id: TaskId,
    },
    #[serde(rename = "task.execute")]
    TaskExecute {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        #[serde(rename = "taskType")]
        task_type: String,
        data: Value,
    },
    #[serde(rename = "task.status")]
    TaskStatus {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        status: String,
    },
    #[serde(rename = "task.result")]
    TaskResult {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        #[serde(default)]
        result: Value,
    },
    #[serde(rename = "task.error")]
    TaskError {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        error: String,
    },
    #[serde(rename = "task.notification")]
    TaskNotification {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        data: Value,
    },
    #[serde(rename = "notification.received")]
    NotificationReceived {
        #[serde(rename = "taskId")]
        task_id: TaskId,
    },

    // ── Agent-to-agent ────────────────────────────────────────────────────
    #[serde(rename = "agent.request")]
    AgentRequest {
        #[serde(rename = "targetAgentName")]
        target_agent_name: String,
        #[serde(rename = "taskData")]
        task_data: Value,
    },
    #[serde(rename = "agent.request.accepted")]
    AgentRequestAccepted {
        #[serde(rename = "taskId")]
        task_id: TaskId,
    },
    #[serde(rename = "agent.response")]
    AgentResponse {
        #[serde(default)]
        result: Value,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },

    // ── Services ──────────────────────────────────────────────────────────
    #[serde(rename = "service.task.request")]
    ServiceTaskRequest {
        #[serde(rename = "serviceId", skip_serializing_if = "Option::is_none", default)]
        service_id: Option<String>,
        #[serde(rename = "serviceName", skip_serializing_if = "Option::is_none", default)]
        service_name: Option<String>,
        #[serde(rename = "functionName")]
        function_name: String,
        #[serde(default)]
        params: Value,
        #[serde(rename = "async", default)]
        is_async: bool,
    },
    #[serde(rename = "service.task.execute")]
    ServiceTaskExecute {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        #[serde(rename = "functionName")]
        function_name: String,
        #[serde(default)]
        params: Value,
    },
    #[serde(rename = "service.task.result")]
    ServiceTaskResult {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        #[serde(default)]
        result: Value,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
    #[serde(rename = "service.notification")]
    ServiceNotification {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        data: Value,
    },

    // ── Tools ─────────────────────────────────────────────────────────────
    #[serde(rename = "mcp.tool.execute")]
    McpToolExecute {
        #[serde(rename = "serverId")]
        server_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        parameters: Value,
    },
    #[serde(rename = "mcp.tool.execution.result")]
    McpToolExecutionResult {
        status: ToolExecutionStatus,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },

    // ── Liveness ──────────────────────────────────────────────────────────
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "pingTimestamp", skip_serializing_if = "Option::is_none", default)]
        timestamp: Option<String>,
    },
    #[serde(rename = "pong")]
    Pong {
        #[serde(rename = "pongTimestamp", skip_serializing_if = "Option::is_none", default)]
        timestamp: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        details: Option<Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionStatus {
    Success,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_pong_round_trip_preserves_timestamp() {
        let env = Envelope::new(MessageContent::Ping {
            timestamp: Some("2026-01-01T00:00:00Z".into()),
        });
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        match back.content {
            MessageContent::Ping { timestamp } => {
                assert_eq!(timestamp.as_deref(), Some("2026-01-01T00:00:00Z"))
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn legacy_mcp_servers_list_alias_deserializes_to_same_variant() {
        let json = r#"{"id":"11111111-1111-1111-1111-111111111111","type":"mcp.servers.list.request"}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        assert!(matches!(env.content, MessageContent::McpServersList {}));
    }

    #[test]
    fn task_create_round_trips_with_camel_case_fields() {
        let env = Envelope::new(MessageContent::TaskCreate {
            agent_name: "Echo".into(),
            task_data: serde_json::json!({"taskType": "echo", "text": "hi"}),
        });
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"agentName\":\"Echo\""));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        match back.content {
            MessageContent::TaskCreate { agent_name, .. } => assert_eq!(agent_name, "Echo"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_fails_to_deserialize() {
        let json = r#"{"id":"11111111-1111-1111-1111-111111111111","type":"bogus.type"}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn reply_to_sets_request_id() {
        let req_id = MessageId::new();
        let env = Envelope::reply_to(req_id, MessageContent::Pong { timestamp: None });
        assert_eq!(env.request_id, Some(req_id));
    }
}
