//! Management REST API under `/admin`, guarded by a bearer token.
//!
//! Registry entries and virtual servers are created, changed and removed
//! here while the gateway runs. Raw API keys are generated server-side and
//! returned exactly once; only their digests are stored.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use rand::RngCore;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::catalog::model::secrets_equal;
use crate::catalog::{CapabilityRef, EntryPatch, InlinePrompt, RegistryEntry, VirtualServer};
use crate::error::RelayError;
use crate::gateway::Gateway;

#[derive(Clone)]
struct AdminState {
    gateway: Arc<Gateway>,
    token: Arc<str>,
}

/// Admin routes. Every route requires `Authorization: Bearer <token>`.
pub fn routes(gateway: Arc<Gateway>, token: String) -> Router {
    let state = AdminState {
        gateway,
        token: token.into(),
    };
    Router::new()
        .route("/admin/entries", get(list_entries).post(add_entry))
        .route(
            "/admin/entries/:id",
            get(get_entry).patch(update_entry).delete(remove_entry),
        )
        .route("/admin/refresh", post(refresh))
        .route("/admin/servers", get(list_servers).post(create_server))
        .route(
            "/admin/servers/:id",
            get(get_server).put(replace_server).delete(remove_server),
        )
        .route("/admin/servers/:id/status", get(server_status))
        .route("/admin/servers/:id/regenerate-key", post(regenerate_key))
        .route("/admin/servers/:id/keys", post(issue_key))
        .route("/admin/servers/:id/keys/:hash", delete(revoke_key))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin))
        .with_state(state)
}

async fn require_admin(State(state): State<AdminState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| secrets_equal(presented.trim(), &state.token));
    if !authorized {
        tracing::warn!(path = %request.uri().path(), "admin request rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "admin token required", "kind": "AuthError" })),
        )
            .into_response();
    }
    next.run(request).await
}

/// Catalog failure rendered with a status code that fits it.
struct AdminError(RelayError);

impl From<RelayError> for AdminError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Conflict(_) | RelayError::InUse(..) => StatusCode::CONFLICT,
            RelayError::Validation(..) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, Json(body)).into_response()
    }
}

type AdminResult<T> = Result<T, AdminError>;

/// 32 random bytes, hex encoded.
fn generate_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn enabled_by_default() -> bool {
    true
}

/// Editable part of a virtual server. Keys are managed through their own routes.
#[derive(Debug, Deserialize)]
struct ServerSpec {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default)]
    tool_refs: Vec<CapabilityRef>,
    #[serde(default)]
    prompt_refs: Vec<CapabilityRef>,
    #[serde(default)]
    custom_prompts: Vec<InlinePrompt>,
}

impl ServerSpec {
    fn apply(self, vs: &mut VirtualServer) {
        vs.name = self.name;
        vs.description = self.description;
        vs.enabled = self.enabled;
        vs.tool_refs = self.tool_refs;
        vs.prompt_refs = self.prompt_refs;
        vs.custom_prompts = self.custom_prompts;
    }
}

#[derive(Debug, Deserialize)]
struct NewServer {
    id: String,
    #[serde(flatten)]
    spec: ServerSpec,
}

#[derive(Debug, Default, Deserialize)]
struct KeyRequest {
    #[serde(default)]
    label: Option<String>,
}

async fn list_entries(State(state): State<AdminState>) -> AdminResult<Json<Vec<RegistryEntry>>> {
    Ok(Json(state.gateway.catalog().list().await?))
}

async fn add_entry(
    State(state): State<AdminState>,
    Json(entry): Json<RegistryEntry>,
) -> AdminResult<(StatusCode, Json<RegistryEntry>)> {
    let id = entry.id.clone();
    state.gateway.add_entry(entry).await?;
    Ok((StatusCode::CREATED, Json(state.gateway.catalog().get(&id).await?)))
}

async fn get_entry(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<Json<RegistryEntry>> {
    Ok(Json(state.gateway.catalog().get(&id).await?))
}

async fn update_entry(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(patch): Json<EntryPatch>,
) -> AdminResult<Json<RegistryEntry>> {
    Ok(Json(state.gateway.update_entry(&id, patch).await?))
}

async fn remove_entry(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<StatusCode> {
    state.gateway.remove_entry(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refresh(State(state): State<AdminState>) -> Json<Value> {
    state.gateway.aggregator().invalidate_all().await;
    tracing::info!("capability listings refreshed on request");
    Json(json!({ "status": "refreshed" }))
}

async fn list_servers(State(state): State<AdminState>) -> AdminResult<Json<Vec<VirtualServer>>> {
    Ok(Json(state.gateway.catalog().list_virtual_servers().await?))
}

async fn create_server(
    State(state): State<AdminState>,
    Json(new): Json<NewServer>,
) -> AdminResult<(StatusCode, Json<Value>)> {
    let raw_key = generate_key();
    let mut vs = VirtualServer::new(new.id, String::new());
    new.spec.apply(&mut vs);
    let vs = vs.with_key(&raw_key);
    state.gateway.catalog().create_virtual_server(vs.clone()).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "server": vs, "api_key": raw_key })),
    ))
}

async fn get_server(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<Json<VirtualServer>> {
    Ok(Json(state.gateway.catalog().get_virtual_server(&id).await?))
}

/// Replace everything but the keys.
async fn replace_server(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(spec): Json<ServerSpec>,
) -> AdminResult<Json<VirtualServer>> {
    let catalog = state.gateway.catalog();
    let mut vs = catalog.get_virtual_server(&id).await?;
    spec.apply(&mut vs);
    catalog.put_virtual_server(vs.clone()).await?;
    Ok(Json(vs))
}

async fn remove_server(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<StatusCode> {
    state.gateway.catalog().remove_virtual_server(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn server_status(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<Json<Value>> {
    let vs = state.gateway.catalog().get_virtual_server(&id).await?;
    let live_keys = vs.api_keys.iter().filter(|k| !k.revoked).count();
    let (status, tools, prompts, unavailable) = if !vs.enabled {
        ("disabled", 0, 0, Vec::new())
    } else {
        match state.gateway.aggregator().listing(&vs).await {
            Ok(listing) if listing.unavailable.is_empty() => {
                ("ok", listing.tools.len(), listing.prompts.len(), Vec::new())
            }
            Ok(listing) => (
                "degraded",
                listing.tools.len(),
                listing.prompts.len(),
                listing.unavailable.clone(),
            ),
            Err(e) => {
                tracing::debug!(server = %id, error = %e, "status listing failed");
                let missing = vs.referenced_entries().into_iter().map(String::from).collect();
                ("unavailable", 0, 0, missing)
            }
        }
    };
    Ok(Json(json!({
        "id": vs.id,
        "name": vs.name,
        "enabled": vs.enabled,
        "status": status,
        "tools_count": tools,
        "prompts_count": prompts,
        "unavailable": unavailable,
        "live_keys": live_keys,
    })))
}

async fn regenerate_key(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<Json<Value>> {
    let raw_key = generate_key();
    let record = state
        .gateway
        .catalog()
        .rotate_api_key(&id, &raw_key, None)
        .await?;
    Ok(Json(json!({ "api_key": raw_key, "hash": record.hash })))
}

async fn issue_key(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(request): Json<KeyRequest>,
) -> AdminResult<(StatusCode, Json<Value>)> {
    let raw_key = generate_key();
    let record = state
        .gateway
        .catalog()
        .add_api_key(&id, &raw_key, request.label)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "api_key": raw_key, "hash": record.hash, "label": record.label })),
    ))
}

async fn revoke_key(
    State(state): State<AdminState>,
    Path((id, hash)): Path<(String, String)>,
) -> AdminResult<StatusCode> {
    state.gateway.catalog().revoke_api_key(&id, &hash).await?;
    Ok(StatusCode::NO_CONTENT)
}
