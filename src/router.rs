//! Per-call JSON-RPC state machine for one virtual server.
//!
//! Every inbound call moves `Received -> Authenticated -> Resolved ->
//! Forwarding -> Completed`, or ends in `Failed`. Authentication always
//! precedes resolution, so a rejected key never reaches a provider.

use std::fmt;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::aggregator::Aggregator;
use crate::auth::AuthGuard;
use crate::catalog::{CapabilityRef, Catalog, RegistryEntry, VirtualServer};
use crate::connector::ProviderConnector;
use crate::error::RelayError;
use crate::namespace::is_namespaced_as;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Where a call is in its lifecycle. Logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Received,
    Authenticated,
    Resolved,
    Forwarding,
    Completed,
    Failed,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Received => "received",
            CallState::Authenticated => "authenticated",
            CallState::Resolved => "resolved",
            CallState::Forwarding => "forwarding",
            CallState::Completed => "completed",
            CallState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Initialize,
    ListTools,
    ListPrompts,
    Execute,
    GetPrompt,
    Ping,
}

impl Method {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "initialize" => Some(Method::Initialize),
            "tools.list" | "tools/list" => Some(Method::ListTools),
            "prompts.list" | "prompts/list" => Some(Method::ListPrompts),
            "tools.execute" | "tools/call" => Some(Method::Execute),
            "prompts.get" | "prompts/get" => Some(Method::GetPrompt),
            "ping" => Some(Method::Ping),
            _ => None,
        }
    }
}

/// The `data` member of a JSON-RPC error: stable kind plus cause.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorDetail {
    pub kind: String,
    pub cause: String,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    pub data: ErrorDetail,
}

impl From<&RelayError> for ErrorObject {
    fn from(err: &RelayError) -> Self {
        Self {
            code: err.rpc_code(),
            message: err.to_string(),
            data: ErrorDetail {
                kind: err.kind().to_string(),
                cause: cause_of(err),
            },
        }
    }
}

/// Human-readable cause without the entry/server prefix of the display form.
fn cause_of(err: &RelayError) -> String {
    match err {
        RelayError::Validation(_, cause)
        | RelayError::InUse(_, cause)
        | RelayError::Auth(_, cause)
        | RelayError::Unreachable(_, cause)
        | RelayError::ProtocolMismatch(_, cause)
        | RelayError::ProcessSpawn(_, cause)
        | RelayError::Upstream(_, cause) => cause.clone(),
        other => other.to_string(),
    }
}

/// One JSON-RPC 2.0 response. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, err: &RelayError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(err.into()),
        }
    }

    /// Parse failure on a body that is not JSON at all.
    pub fn parse_error(cause: impl Into<String>) -> Self {
        let cause = cause.into();
        Self {
            jsonrpc: "2.0",
            id: Value::Null,
            result: None,
            error: Some(ErrorObject {
                code: -32700,
                message: format!("parse error: {}", cause),
                data: ErrorDetail {
                    kind: "ProtocolError".to_string(),
                    cause,
                },
            }),
        }
    }
}

/// Tracks one call through its states for logging.
struct Call<'a> {
    server: &'a str,
    method: String,
    state: CallState,
}

impl<'a> Call<'a> {
    fn new(server: &'a str) -> Self {
        Self {
            server,
            method: String::new(),
            state: CallState::Received,
        }
    }

    fn advance(&mut self, next: CallState) {
        tracing::debug!(
            server = %self.server,
            method = %self.method,
            from = %self.state,
            to = %next,
            "call state"
        );
        self.state = next;
    }

    fn fail(&mut self, err: &RelayError) {
        tracing::info!(
            server = %self.server,
            method = %self.method,
            at = %self.state,
            kind = err.kind(),
            error = %err,
            "call failed"
        );
        self.state = CallState::Failed;
    }
}

/// Serves the JSON-RPC methods of every virtual server.
///
/// Each call is authenticated against the server's keys, resolved against
/// its refs and forwarded to the owning provider under the caller's deadline,
/// capped by the configured default.
#[derive(Clone)]
pub struct Router {
    catalog: Catalog,
    auth: AuthGuard,
    aggregator: Aggregator,
    connector: ProviderConnector,
    default_deadline: Duration,
}

impl Router {
    pub fn new(
        catalog: Catalog,
        auth: AuthGuard,
        aggregator: Aggregator,
        connector: ProviderConnector,
        default_deadline: Duration,
    ) -> Self {
        Self {
            catalog,
            auth,
            aggregator,
            connector,
            default_deadline,
        }
    }

    /// Handle one JSON-RPC message addressed to `vs_id`.
    ///
    /// The key may come from the transport (`presented_key`) or from a
    /// top-level `api_key` field in the body; the transport wins.
    pub async fn handle(
        &self,
        vs_id: &str,
        presented_key: Option<&str>,
        body: Value,
    ) -> JsonRpcResponse {
        let mut call = Call::new(vs_id);
        let id = body.get("id").cloned().unwrap_or(Value::Null);
        match self.run(&mut call, presented_key, &body).await {
            Ok(result) => {
                call.advance(CallState::Completed);
                JsonRpcResponse::success(id, result)
            }
            Err(err) => {
                call.fail(&err);
                JsonRpcResponse::failure(id, &err)
            }
        }
    }

    /// Handle a JSON-RPC batch. Members run concurrently and each is
    /// authenticated on its own; responses keep request order. An empty batch
    /// is itself an invalid request.
    pub async fn handle_batch(
        &self,
        vs_id: &str,
        presented_key: Option<&str>,
        batch: Vec<Value>,
    ) -> Vec<JsonRpcResponse> {
        if batch.is_empty() {
            let err = RelayError::Protocol("empty batch".to_string());
            return vec![JsonRpcResponse::failure(Value::Null, &err)];
        }
        tracing::debug!(server = %vs_id, size = batch.len(), "batch received");
        join_all(
            batch
                .into_iter()
                .map(|message| self.handle(vs_id, presented_key, message)),
        )
        .await
    }

    async fn run(
        &self,
        call: &mut Call<'_>,
        presented_key: Option<&str>,
        body: &Value,
    ) -> crate::Result<Value> {
        let object = body
            .as_object()
            .ok_or_else(|| RelayError::Protocol("request must be a JSON object".to_string()))?;
        let method_name = object
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Protocol("missing 'method'".to_string()))?;
        call.method = method_name.to_string();
        let method = Method::parse(method_name)
            .ok_or_else(|| RelayError::MethodNotFound(method_name.to_string()))?;
        let params = match object.get("params") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(RelayError::Protocol(
                    "'params' must be an object".to_string(),
                ));
            }
        };

        let key = presented_key.or_else(|| object.get("api_key").and_then(Value::as_str));
        let vs = self.auth.authenticate(call.server, key).await?;
        call.advance(CallState::Authenticated);

        match method {
            Method::Initialize => Ok(initialize_result(&vs)),
            Method::Ping => Ok(json!({})),
            Method::ListTools => {
                let listing = self.aggregator.listing_within(&vs, self.deadline(&params)).await?;
                Ok(json!({ "tools": listing.tools }))
            }
            Method::ListPrompts => {
                let listing = self.aggregator.listing_within(&vs, self.deadline(&params)).await?;
                Ok(json!({ "prompts": listing.prompts }))
            }
            Method::Execute => self.execute(call, &vs, &params).await,
            Method::GetPrompt => self.get_prompt(call, &vs, &params).await,
        }
    }

    /// `deadline_ms` from the params, never above the default.
    fn deadline(&self, params: &Map<String, Value>) -> Duration {
        params
            .get("deadline_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .map_or(self.default_deadline, |d| d.min(self.default_deadline))
    }

    /// Find the ref and its live catalog entry.
    async fn resolve(
        &self,
        refs: &[CapabilityRef],
        requested: &str,
    ) -> crate::Result<(RegistryEntry, String)> {
        let capability = resolve_ref(refs, requested)
            .ok_or_else(|| RelayError::CapabilityNotFound(requested.to_string()))?;
        let entry = match self.catalog.get(&capability.entry).await {
            Ok(entry) => entry,
            Err(RelayError::NotFound(_)) => {
                tracing::warn!(entry = %capability.entry, capability = %requested, "dangling reference");
                return Err(RelayError::CapabilityNotFound(requested.to_string()));
            }
            Err(e) => return Err(e),
        };
        Ok((entry, capability.name.clone()))
    }

    async fn execute(
        &self,
        call: &mut Call<'_>,
        vs: &VirtualServer,
        params: &Map<String, Value>,
    ) -> crate::Result<Value> {
        let requested = string_param(params, &["tool_id", "name"])?;
        let arguments = object_param(params, &["params", "arguments"])?;
        let deadline = self.deadline(params);

        let (entry, tool) = self.resolve(&vs.tool_refs, requested).await?;
        call.advance(CallState::Resolved);

        call.advance(CallState::Forwarding);
        match self.connector.invoke(&entry, &tool, arguments, deadline).await {
            Ok(payload) => {
                self.aggregator.note_invoke_success(&entry).await;
                Ok(payload)
            }
            Err(err) => Err(forwarding_error(&entry.id, err)),
        }
    }

    async fn get_prompt(
        &self,
        call: &mut Call<'_>,
        vs: &VirtualServer,
        params: &Map<String, Value>,
    ) -> crate::Result<Value> {
        let requested = string_param(params, &["name", "prompt_id"])?;
        let arguments = object_param(params, &["arguments", "params"])?;

        if let Some(inline) = vs.custom_prompts.iter().find(|p| p.name == requested) {
            call.advance(CallState::Resolved);
            let text = inline.render(&arguments)?;
            return Ok(json!({
                "description": inline.description,
                "messages": [{
                    "role": "user",
                    "content": { "type": "text", "text": text }
                }]
            }));
        }

        let deadline = self.deadline(params);
        let (entry, prompt) = self.resolve(&vs.prompt_refs, requested).await?;
        call.advance(CallState::Resolved);

        call.advance(CallState::Forwarding);
        self.connector
            .get_prompt(&entry, &prompt, arguments, deadline)
            .await
            .map_err(|err| forwarding_error(&entry.id, err))
    }
}

/// Namespaced names match exactly; bare names take the first ref in order.
fn resolve_ref<'a>(refs: &'a [CapabilityRef], requested: &str) -> Option<&'a CapabilityRef> {
    refs.iter()
        .find(|r| is_namespaced_as(requested, &r.entry, &r.name))
        .or_else(|| refs.iter().find(|r| r.name == requested))
}

/// Connection-level failures surface to the caller as upstream errors.
fn forwarding_error(entry_id: &str, err: RelayError) -> RelayError {
    match err {
        RelayError::Unreachable(..) | RelayError::ProtocolMismatch(..) => {
            RelayError::Upstream(entry_id.to_string(), err.to_string())
        }
        other => other,
    }
}

fn string_param<'a>(params: &'a Map<String, Value>, names: &[&str]) -> crate::Result<&'a str> {
    names
        .iter()
        .find_map(|n| params.get(*n).and_then(Value::as_str))
        .ok_or_else(|| RelayError::Protocol(format!("missing '{}'", names[0])))
}

fn object_param(params: &Map<String, Value>, names: &[&str]) -> crate::Result<Map<String, Value>> {
    match names.iter().find_map(|n| params.get(*n)) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(RelayError::Protocol(format!(
            "'{}' must be an object",
            names[0]
        ))),
    }
}

fn initialize_result(vs: &VirtualServer) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "serverInfo": {
            "name": vs.name,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "tools": { "listChanged": false },
            "prompts": { "listChanged": false },
        },
        "instructions": vs.description,
    })
}
