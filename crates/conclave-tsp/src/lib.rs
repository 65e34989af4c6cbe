// SPDX-License-Identifier: Apache-2.0
//!
//! Tool server registration and the TSP adapter.
//!
//! The Tool Server Protocol is Model Context Protocol-compatible (§6), so
//! the adapter is built directly on `rmcp`'s client with a child-process
//! transport: each tool server is a subprocess reached over piped stdio,
//! the same shape [`tokio::process::Command`] spawn used elsewhere in the
//! corpus for backgrounded tool processes, but wired through `rmcp` for the
//! initialize / list-tools / call-tool exchange instead of raw stdio.

use std::collections::HashMap;
use std::sync::Arc;

use conclave_proto::ToolDescriptor;
use rmcp::model::CallToolRequestParam;
use rmcp::service::{RunningService, ServiceExt};
use rmcp::transport::TokioChildProcess;
use rmcp::RoleClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

type McpService = RunningService<RoleClient, ()>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Registered,
    Connecting,
    Online,
    Error,
    Disconnected,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Registered => "registered",
            ServerStatus::Connecting => "connecting",
            ServerStatus::Online => "online",
            ServerStatus::Error => "error",
            ServerStatus::Disconnected => "disconnected",
        }
    }
}

/// How to start a tool server's subprocess: an explicit command line, or a
/// script path paired with an interpreter type that resolves to a canonical
/// command. Deserializable so `tool_servers` entries in `OrchestratorConfig`
/// map onto it directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchSpec {
    Command { command: String, #[serde(default)] args: Vec<String> },
    Script { path: String, interpreter: Interpreter },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpreter {
    Python,
    Node,
}

impl LaunchSpec {
    /// Resolves to the `(program, args)` pair actually passed to
    /// [`tokio::process::Command`].
    pub fn resolve(&self) -> (String, Vec<String>) {
        match self {
            LaunchSpec::Command { command, args } => (command.clone(), args.clone()),
            LaunchSpec::Script { path, interpreter } => {
                let program = match interpreter {
                    Interpreter::Python => "python3",
                    Interpreter::Node => "node",
                };
                (program.to_string(), vec![path.clone()])
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolServerError {
    #[error("tool server '{0}' is not registered")]
    NotRegistered(String),
    #[error("failed to spawn tool server '{name}': {source}")]
    Spawn { name: String, source: std::io::Error },
    #[error("handshake with tool server '{name}' failed: {source}")]
    Handshake { name: String, source: anyhow::Error },
    #[error("tool '{tool}' not found on server '{server}'")]
    ToolNotFound { server: String, tool: String },
    #[error("tool call failed: {0}")]
    CallFailed(anyhow::Error),
}

struct ManagedServer {
    name: String,
    launch_spec: LaunchSpec,
    status: ServerStatus,
    tools: Vec<ToolDescriptor>,
    service: Option<Arc<McpService>>,
    /// Serializes calls against a server that doesn't advertise
    /// multiplexing (§4.7's "the adapter handles this by queuing").
    call_lock: Arc<Mutex<()>>,
}

/// Public, connection-handle-free projection of a tool server's status, for
/// `mcp.servers.list.response`.
#[derive(Debug, Clone)]
pub struct ToolServerView {
    pub name: String,
    pub status: ServerStatus,
    pub tools: Vec<ToolDescriptor>,
}

pub struct TspAdapter {
    servers: RwLock<HashMap<String, ManagedServer>>,
}

impl Default for TspAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl TspAdapter {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, name: impl Into<String>, launch_spec: LaunchSpec) {
        let name = name.into();
        self.servers.write().await.insert(
            name.clone(),
            ManagedServer {
                name,
                launch_spec,
                status: ServerStatus::Registered,
                tools: Vec::new(),
                service: None,
                call_lock: Arc::new(Mutex::new(())),
            },
        );
    }

    pub async fn view(&self, name: &str) -> Option<ToolServerView> {
        self.servers.read().await.get(name).map(|s| ToolServerView {
            name: s.name.clone(),
            status: s.status.clone(),
            tools: s.tools.clone(),
        })
    }

    pub async fn list(&self) -> Vec<ToolServerView> {
        self.servers
            .read()
            .await
            .values()
            .map(|s| ToolServerView {
                name: s.name.clone(),
                status: s.status.clone(),
                tools: s.tools.clone(),
            })
            .collect()
    }

    /// Spawns the subprocess, performs the MCP handshake, and caches its
    /// tool list. Idempotent: a server already `online` is left untouched.
    pub async fn ensure_connected(&self, name: &str) -> Result<(), ToolServerError> {
        {
            let guard = self.servers.read().await;
            let server = guard.get(name).ok_or_else(|| ToolServerError::NotRegistered(name.to_string()))?;
            if server.status == ServerStatus::Online {
                return Ok(());
            }
        }

        let launch_spec = {
            let mut guard = self.servers.write().await;
            let server = guard.get_mut(name).expect("checked above");
            server.status = ServerStatus::Connecting;
            server.launch_spec.clone()
        };

        let (program, args) = launch_spec.resolve();
        info!(server = name, program = %program, "tsp: spawning tool server");

        let mut command = Command::new(&program);
        command.args(&args);
        let transport = match TokioChildProcess::new(command) {
            Ok(t) => t,
            Err(e) => {
                self.mark_error(name).await;
                return Err(ToolServerError::Spawn { name: name.to_string(), source: e });
            }
        };

        let service = match ().serve(transport).await {
            Ok(svc) => svc,
            Err(e) => {
                self.mark_error(name).await;
                return Err(ToolServerError::Handshake { name: name.to_string(), source: anyhow::anyhow!(e) });
            }
        };

        let tools_result = match service.list_tools(Default::default()).await {
            Ok(t) => t,
            Err(e) => {
                self.mark_error(name).await;
                return Err(ToolServerError::Handshake { name: name.to_string(), source: anyhow::anyhow!(e) });
            }
        };

        let descriptors: Vec<ToolDescriptor> = tools_result
            .tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name.to_string(),
                description: t.description.clone().unwrap_or_default().to_string(),
                parameters_schema: serde_json::to_value(&t.input_schema).unwrap_or(Value::Null),
            })
            .collect();

        let mut guard = self.servers.write().await;
        if let Some(server) = guard.get_mut(name) {
            server.status = ServerStatus::Online;
            server.tools = descriptors;
            server.service = Some(Arc::new(service));
        }
        Ok(())
    }

    async fn mark_error(&self, name: &str) {
        let mut guard = self.servers.write().await;
        if let Some(server) = guard.get_mut(name) {
            server.status = ServerStatus::Error;
            server.service = None;
        }
    }

    /// Calls a tool, reconnecting lazily if the server isn't online. A tool
    /// error does not poison the server — it stays online.
    pub async fn call_tool(&self, server: &str, tool_name: &str, arguments: Value) -> Result<ToolOutcome, ToolServerError> {
        self.ensure_connected(server).await?;

        let (service, call_lock) = {
            let guard = self.servers.read().await;
            let s = guard.get(server).ok_or_else(|| ToolServerError::NotRegistered(server.to_string()))?;
            if !s.tools.iter().any(|t| t.name == tool_name) {
                return Err(ToolServerError::ToolNotFound {
                    server: server.to_string(),
                    tool: tool_name.to_string(),
                });
            }
            (
                s.service.clone().ok_or_else(|| ToolServerError::NotRegistered(server.to_string()))?,
                s.call_lock.clone(),
            )
        };

        // Serialize calls against this server per §4.7.
        let _permit = call_lock.lock().await;

        let result = service
            .call_tool(CallToolRequestParam {
                meta: None,
                name: tool_name.to_string().into(),
                arguments: arguments.as_object().cloned(),
                task: None,
            })
            .await
            .map_err(|e| ToolServerError::CallFailed(anyhow::anyhow!(e)))?;

        let is_error = result.is_error.unwrap_or(false);
        let text = result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.to_string()))
            .collect::<Vec<_>>()
            .join("\n");

        if is_error {
            warn!(server, tool = tool_name, "tsp: tool reported an error");
        }

        Ok(ToolOutcome { is_error, text })
    }

    /// Terminates every connected subprocess. Dropping the last `Arc` to a
    /// server's [`McpService`] drops its `TokioChildProcess` transport, which
    /// kills the child. Called once by the shutdown controller.
    pub async fn shutdown_all(&self) {
        let mut guard = self.servers.write().await;
        for server in guard.values_mut() {
            server.service = None;
            server.status = ServerStatus::Disconnected;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub is_error: bool,
    pub text: String,
}
