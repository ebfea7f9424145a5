//! # HTTP Server
//!
//! Two servers back the controller's operational surface:
//!
//! - the metrics/admin server: `/metrics`, `POST /reset-cooldown`,
//!   `GET|POST /force-reconcile`, `GET /admin/cache`,
//!   `POST /admin/cache/evict`
//! - the probe server: `/healthz`, `/readyz`
//!
//! Responses are always JSON. Admin operations answer 200 even for
//! "disabled" or "not ready" outcomes; only malformed requests (400) and
//! wrong methods (405) use error statuses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::parse_bool;
use crate::force::ForceReconciler;
use crate::mirror::{CacheEntry, Pusher};

/// Request body cap for admin endpoints.
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub struct ServerState {
    is_ready: AtomicBool,
    pusher: RwLock<Option<Arc<Pusher>>>,
    force: RwLock<Option<Arc<ForceReconciler>>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            is_ready: AtomicBool::new(false),
            pusher: RwLock::new(None),
            force: RwLock::new(None),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.is_ready.store(ready, Ordering::Relaxed);
    }

    pub fn set_pusher(&self, pusher: Arc<Pusher>) {
        *self.pusher.write().expect("server state poisoned") = Some(pusher);
    }

    pub fn set_force_reconciler(&self, force: Arc<ForceReconciler>) {
        *self.force.write().expect("server state poisoned") = Some(force);
    }

    fn pusher(&self) -> Option<Arc<Pusher>> {
        self.pusher.read().expect("server state poisoned").clone()
    }

    fn force(&self) -> Option<Arc<ForceReconciler>> {
        self.force.read().expect("server state poisoned").clone()
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn admin_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/reset-cooldown", post(reset_cooldown_handler))
        .route(
            "/force-reconcile",
            get(force_reconcile_handler).post(force_reconcile_handler),
        )
        .route("/admin/cache", get(cache_state_handler))
        .route("/admin/cache/evict", post(cache_evict_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

pub fn probe_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

pub async fn start_admin_server(addr: &str, state: Arc<ServerState>) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr, "metrics/admin server listening");
    axum::serve(listener, admin_router(state)).await?;
    Ok(())
}

pub async fn start_probe_server(addr: &str, state: Arc<ServerState>) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr, "health probe server listening");
    axum::serve(listener, probe_router(state)).await?;
    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = crate::metrics::REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %err, "failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("failed to encode metrics: {err}").into_bytes(),
        );
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CooldownResetResponse {
    pub reset: bool,
    pub cleared_targets: usize,
    pub message: String,
}

async fn reset_cooldown_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(reset_cooldown_response(&state))
}

fn reset_cooldown_response(state: &ServerState) -> CooldownResetResponse {
    let Some(pusher) = state.pusher() else {
        return CooldownResetResponse {
            reset: false,
            cleared_targets: 0,
            message: "cooldown reset service not ready".to_owned(),
        };
    };
    let (cleared, enabled) = pusher.reset_cooldown();
    let message = if !enabled {
        "failure cooldown disabled"
    } else if cleared == 0 {
        "no cooldown entries to reset"
    } else {
        "failure cooldown reset"
    };
    info!(cleared_targets = cleared, cooldown_enabled = enabled, "processed cooldown reset request");
    CooldownResetResponse {
        reset: enabled && cleared > 0,
        cleared_targets: cleared,
        message: message.to_owned(),
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ForceReconcileResponse {
    pub triggered: bool,
    pub success: bool,
    #[serde(rename = "workloadsProcessed")]
    pub workloads: usize,
    #[serde(rename = "imagesMirrored")]
    pub images: usize,
    pub message: String,
}

async fn force_reconcile_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let Some(force) = state.force() else {
        return Json(ForceReconcileResponse {
            triggered: false,
            success: false,
            workloads: 0,
            images: 0,
            message: "force reconcile service not ready".to_owned(),
        });
    };

    let (workloads, images, err) = force.force_reconcile().await;
    let response = match err {
        Some(err) => {
            error!(workloads, images, error = %err, "processed force reconcile request");
            ForceReconcileResponse {
                triggered: true,
                success: false,
                workloads,
                images,
                message: format!("force reconcile failed: {err}"),
            }
        }
        None => {
            info!(workloads, images, "processed force reconcile request");
            ForceReconcileResponse {
                triggered: true,
                success: true,
                workloads,
                images,
                message: "force reconcile completed".to_owned(),
            }
        }
    };
    Json(response)
}

#[derive(Debug, Serialize)]
pub struct CacheStateResponse {
    pub entries: Vec<CacheEntry>,
    pub count: usize,
}

async fn cache_state_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let entries = state.pusher().map(|p| p.cache_entries()).unwrap_or_default();
    let count = entries.len();
    Json(CacheStateResponse { entries, count })
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EvictionRequest {
    pub target: String,
    pub prefix: String,
    pub all: bool,
}

#[derive(Debug, Serialize)]
pub struct EvictionResponse {
    pub removed: Vec<String>,
    pub remaining: usize,
    pub entries: Vec<CacheEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn bad_request(message: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message }))
}

/// Merges the JSON body (unknown fields rejected) with query parameters;
/// the query wins where both are present.
pub fn parse_eviction_request(
    body: &[u8],
    query: &HashMap<String, String>,
) -> Result<EvictionRequest, String> {
    let mut request = if body.is_empty() {
        EvictionRequest::default()
    } else {
        serde_json::from_slice::<EvictionRequest>(body)
            .map_err(|err| format!("decode request body: {err}"))?
    };

    if let Some(target) = query.get("target") {
        if !target.trim().is_empty() {
            request.target = target.trim().to_owned();
        }
    }
    if let Some(prefix) = query.get("prefix") {
        if !prefix.trim().is_empty() {
            request.prefix = prefix.trim().to_owned();
        }
    }
    if let Some(all) = query.get("all") {
        if !all.trim().is_empty() {
            request.all = parse_bool(all);
        }
    }

    request.target = request.target.trim().to_owned();
    request.prefix = request.prefix.trim().to_owned();

    if !request.target.is_empty() && !request.prefix.is_empty() {
        return Err("specify either target or prefix, not both".to_owned());
    }
    if request.target.is_empty() && request.prefix.is_empty() && !request.all {
        // No selector means evict everything.
        request.all = true;
    }
    Ok(request)
}

async fn cache_evict_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<EvictionResponse>, (StatusCode, Json<ErrorResponse>)> {
    let request = parse_eviction_request(&body, &query).map_err(bad_request)?;

    let Some(pusher) = state.pusher() else {
        return Ok(Json(EvictionResponse {
            removed: Vec::new(),
            remaining: 0,
            entries: Vec::new(),
        }));
    };

    let removed = if !request.target.is_empty() {
        if pusher.evict(&request.target) {
            vec![request.target.clone()]
        } else {
            Vec::new()
        }
    } else if !request.prefix.is_empty() {
        pusher.evict_prefix(&request.prefix)
    } else {
        pusher.reset_cache()
    };

    let entries = pusher.cache_entries();
    if !removed.is_empty() {
        info!(removed = ?removed, remaining = entries.len(), "evicted push cache entries");
    }

    Ok(Json(EvictionResponse {
        remaining: entries.len(),
        removed,
        entries,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_request_defaults_to_all() {
        let request = parse_eviction_request(b"", &HashMap::new()).unwrap();
        assert!(request.all);
        assert!(request.target.is_empty());
    }

    #[test]
    fn eviction_request_rejects_unknown_fields() {
        let err = parse_eviction_request(br#"{"bogus": true}"#, &HashMap::new()).unwrap_err();
        assert!(err.contains("decode request body"));
    }

    #[test]
    fn eviction_request_rejects_target_and_prefix() {
        let body = br#"{"target": "a", "prefix": "b"}"#;
        assert!(parse_eviction_request(body, &HashMap::new()).is_err());
    }

    #[test]
    fn query_parameters_override_body() {
        let query = HashMap::from([
            ("target".to_owned(), "reg/mirror/app:1".to_owned()),
            ("all".to_owned(), "yes".to_owned()),
        ]);
        let request = parse_eviction_request(br#"{"target": "other"}"#, &query).unwrap();
        assert_eq!(request.target, "reg/mirror/app:1");
        assert!(request.all);
    }

    #[test]
    fn not_ready_cooldown_response() {
        let state = ServerState::new();
        let response = reset_cooldown_response(&state);
        assert!(!response.reset);
        assert_eq!(response.message, "cooldown reset service not ready");
    }
}
