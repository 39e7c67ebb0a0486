use std::{
    io::IsTerminal,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use rmcp::{
    Json, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use renderdog_bridge::{
    BridgeDiagnostics, BridgeError, CallOptions, ClientBridge, DiagnosticsQuery,
};

mod any_json_schema {
    use schemars::Schema;

    pub fn schema(_gen: &mut schemars::SchemaGenerator) -> Schema {
        // Accepts any JSON value.
        Schema::default()
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, JsonSchema)]
struct BridgeCallResponse {
    method: String,
    elapsed_ms: u64,
    #[schemars(schema_with = "any_json_schema::schema")]
    result: Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct OpenCaptureRequest {
    #[serde(default)]
    cwd: Option<String>,
    capture_path: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GetDrawCallsRequest {
    #[serde(default = "default_true")]
    include_children: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    marker_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exclude_markers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id_min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id_max: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    only_actions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flags_filter: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GetPipelineStateRequest {
    event_id: u32,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct BridgeCallRequest {
    method: String,
    #[serde(default)]
    #[schemars(schema_with = "any_json_schema::schema")]
    args: Value,
    /// Overrides the configured budget for this call, in seconds.
    #[serde(default)]
    timeout_sec: Option<f64>,
}

fn resolve_base_cwd(cwd: Option<String>) -> Result<PathBuf, String> {
    match cwd {
        Some(cwd) => Ok(PathBuf::from(cwd)),
        None => std::env::current_dir().map_err(|e| format!("get current dir failed: {e}")),
    }
}

/// JSON-encoded `{code, message, context?}` so clients can branch on the code.
fn bridge_error_text(err: &BridgeError) -> String {
    serde_json::to_string(&err.info()).unwrap_or_else(|_| err.to_string())
}

#[derive(Clone)]
struct RenderdogMcpServer {
    bridge: Arc<ClientBridge>,
    tool_router: ToolRouter<Self>,
}

#[tool_handler(router = self.tool_router)]
impl rmcp::ServerHandler for RenderdogMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(
                "RenderDoc bridge MCP server - query the capture loaded in the RenderDoc UI and diagnose the bridge when calls stall"
                    .into(),
            ),
            ..Default::default()
        }
    }
}

impl RenderdogMcpServer {
    /// Runs one bridge call on the blocking pool.
    async fn forward(
        &self,
        tool: &'static str,
        method: String,
        args: Value,
        options: CallOptions,
    ) -> Result<Json<BridgeCallResponse>, String> {
        let start = Instant::now();
        let bridge = Arc::clone(&self.bridge);
        let call_method = method.clone();
        let joined =
            tokio::task::spawn_blocking(move || bridge.call_with(&call_method, args, options)).await;
        let result = match joined {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                tracing::error!(tool, method = %method, code = e.code().as_str(), "failed");
                tracing::debug!(tool, err = %e, "details");
                return Err(bridge_error_text(&e));
            }
            Err(e) => {
                tracing::error!(tool, method = %method, "failed");
                tracing::debug!(tool, err = %e, "details");
                return Err(format!("bridge call task failed: {e}"));
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(tool, method = %method, elapsed_ms, "ok");
        Ok(Json(BridgeCallResponse {
            method,
            elapsed_ms,
            result,
        }))
    }
}

#[tool_router(router = tool_router)]
impl RenderdogMcpServer {
    fn new(bridge: Arc<ClientBridge>) -> Self {
        Self {
            bridge,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "renderdoc_bridge_diagnostics",
        description = "Report bridge transport health for drop/timeout triage: heartbeat age, health status, queue depth, in-flight request, counters, and recent errors, from both this server and the RenderDoc extension. Falls back to the extension's last persisted snapshot when it does not answer."
    )]
    async fn bridge_diagnostics(
        &self,
        Parameters(query): Parameters<DiagnosticsQuery>,
    ) -> Result<Json<BridgeDiagnostics>, String> {
        let start = Instant::now();
        tracing::info!(tool = "renderdoc_bridge_diagnostics", "start");
        let bridge = Arc::clone(&self.bridge);
        let report = tokio::task::spawn_blocking(move || bridge.diagnostics(&query))
            .await
            .map_err(|e| {
                tracing::error!(tool = "renderdoc_bridge_diagnostics", "failed");
                tracing::debug!(tool = "renderdoc_bridge_diagnostics", err = %e, "details");
                format!("diagnostics task failed: {e}")
            })?;
        tracing::info!(
            tool = "renderdoc_bridge_diagnostics",
            elapsed_ms = start.elapsed().as_millis(),
            live = report.remote.is_live(),
            "ok"
        );
        Ok(Json(report))
    }

    #[tool(
        name = "renderdoc_ping",
        description = "Round-trip a ping through the bridge to check that the RenderDoc extension is answering."
    )]
    async fn ping(&self) -> Result<Json<BridgeCallResponse>, String> {
        tracing::info!(tool = "renderdoc_ping", "start");
        self.forward(
            "renderdoc_ping",
            "ping".into(),
            Value::Null,
            CallOptions::default(),
        )
        .await
    }

    #[tool(
        name = "renderdoc_get_capture_status",
        description = "Check whether a capture is currently loaded in RenderDoc, and its API type if so."
    )]
    async fn get_capture_status(&self) -> Result<Json<BridgeCallResponse>, String> {
        tracing::info!(tool = "renderdoc_get_capture_status", "start");
        self.forward(
            "renderdoc_get_capture_status",
            "get_capture_status".into(),
            Value::Null,
            CallOptions::default(),
        )
        .await
    }

    #[tool(
        name = "renderdoc_open_capture",
        description = "Open a .rdc capture in the running RenderDoc UI (closes any capture already open). Relative paths are resolved against `cwd`."
    )]
    async fn open_capture(
        &self,
        Parameters(req): Parameters<OpenCaptureRequest>,
    ) -> Result<Json<BridgeCallResponse>, String> {
        tracing::info!(
            tool = "renderdoc_open_capture",
            capture_path = %req.capture_path,
            "start"
        );
        let cwd = resolve_base_cwd(req.cwd)?;
        let capture_path = cwd.join(&req.capture_path).display().to_string();
        self.forward(
            "renderdoc_open_capture",
            "open_capture".into(),
            serde_json::json!({ "capture_path": capture_path }),
            CallOptions::default(),
        )
        .await
    }

    #[tool(
        name = "renderdoc_get_draw_calls",
        description = "List draw calls and actions of the loaded capture as a hierarchy, optionally filtered by marker, event id range, or action flags."
    )]
    async fn get_draw_calls(
        &self,
        Parameters(req): Parameters<GetDrawCallsRequest>,
    ) -> Result<Json<BridgeCallResponse>, String> {
        tracing::info!(
            tool = "renderdoc_get_draw_calls",
            include_children = req.include_children,
            "start"
        );
        let args = serde_json::to_value(&req).map_err(|e| format!("encode arguments failed: {e}"))?;
        self.forward(
            "renderdoc_get_draw_calls",
            "get_draw_calls".into(),
            args,
            CallOptions::default(),
        )
        .await
    }

    #[tool(
        name = "renderdoc_get_pipeline_state",
        description = "Get the full graphics pipeline state (shaders, resources, samplers, constant buffers, targets, viewports) at an event."
    )]
    async fn get_pipeline_state(
        &self,
        Parameters(req): Parameters<GetPipelineStateRequest>,
    ) -> Result<Json<BridgeCallResponse>, String> {
        tracing::info!(
            tool = "renderdoc_get_pipeline_state",
            event_id = req.event_id,
            "start"
        );
        let args = serde_json::to_value(&req).map_err(|e| format!("encode arguments failed: {e}"))?;
        self.forward(
            "renderdoc_get_pipeline_state",
            "get_pipeline_state".into(),
            args,
            CallOptions::default(),
        )
        .await
    }

    #[tool(
        name = "renderdoc_bridge_call",
        description = "Call any method exposed by the RenderDoc extension with raw JSON arguments. Uses the per-method timeout unless `timeout_sec` is given."
    )]
    async fn bridge_call(
        &self,
        Parameters(req): Parameters<BridgeCallRequest>,
    ) -> Result<Json<BridgeCallResponse>, String> {
        tracing::info!(tool = "renderdoc_bridge_call", method = %req.method, "start");
        let timeout = match req.timeout_sec {
            Some(secs) => Some(
                Duration::try_from_secs_f64(secs)
                    .map_err(|e| format!("invalid timeout_sec {secs}: {e}"))?,
            ),
            None => None,
        };
        self.forward(
            "renderdoc_bridge_call",
            req.method,
            req.args,
            CallOptions {
                timeout,
                cancel: None,
            },
        )
        .await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    if std::io::stdin().is_terminal() {
        eprintln!(
            "renderdog-mcp is an MCP stdio server.\n\
It is meant to be launched by an MCP client, with the RenderDoc bridge extension running.\n\
See the workspace README for setup: https://github.com/Latias94/renderdog\n"
        );
    }

    let bridge = ClientBridge::from_env()?;
    tracing::info!(spool_dir = %bridge.store().dir().display(), "bridge configured");

    let server = RenderdogMcpServer::new(Arc::new(bridge));
    let service = match server.serve(stdio()).await {
        Ok(v) => v,
        Err(e) => {
            eprintln!(
                "renderdog-mcp failed to start. If you ran it directly, make sure an MCP client is launching it.\n\
Error: {e}"
            );
            return Err(e.into());
        }
    };

    if let Err(e) = service.waiting().await {
        eprintln!(
            "renderdog-mcp stopped. If you ran it directly, this usually means stdin was closed.\n\
Launch it via an MCP client (stdio transport).\n\
Error: {e}"
        );
        return Err(e.into());
    }
    Ok(())
}
