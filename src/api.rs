use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::{LiveConfig, RuntimeConfig},
    derp_map::DerpMap,
    discovery::DiscoveryService,
    error::AppError,
    models::{Registry, RegistryStats},
    persistence::{save_json, Persistence, LAST_PUSH_KEY, LAST_RESET_KEY},
    push::{PushAck, PushTarget},
    ranking::{filter, top_k, FilterQuery, RankedRegion},
    registry::RegistryStore,
};

/// Everything the HTTP handlers need
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RegistryStore>,
    pub config: Arc<LiveConfig>,
    pub discovery: Arc<DiscoveryService>,
    pub store: Arc<dyn Persistence>,
    pub push: Option<Arc<PushTarget>>,
}

pub type SharedState = State<AppState>;

/// Build the router. Admin routes are only mounted when `enable_admin` is set.
pub fn router(state: AppState, enable_admin: bool) -> Router {
    let mut router = Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/derp.json", get(get_derp_map))
        .route("/registry.json", get(get_registry))
        .route("/derp_sort.json", get(get_sorted_derp_map))
        .route("/rank.json", get(get_ranking))
        .route("/update", get(trigger_push));

    if enable_admin {
        router = router
            .route("/admin/config", get(get_config).post(set_config))
            .route("/admin/reset", post(trigger_reset));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub stats: RegistryStats,
    pub push_configured: bool,
}

pub async fn index(State(state): SharedState) -> Json<IndexResponse> {
    Json(IndexResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        stats: RegistryStats::from(&state.registry.snapshot()),
        push_configured: state.push.is_some(),
    })
}

/// Health check endpoint
pub async fn health_check() -> StatusCode {
    StatusCode::OK
}

fn filtered(state: &AppState, query: &FilterQuery) -> Result<Registry, AppError> {
    let predicate = query.parse()?;
    Ok(filter(&state.registry.snapshot(), &predicate))
}

/// Filtered registry rendered as a DERP map
pub async fn get_derp_map(
    State(state): SharedState,
    Query(query): Query<FilterQuery>,
) -> Result<Json<DerpMap>, AppError> {
    let subset = filtered(&state, &query)?;
    Ok(Json(DerpMap::from_registry(&subset)))
}

/// Filtered registry with every health field
pub async fn get_registry(
    State(state): SharedState,
    Query(query): Query<FilterQuery>,
) -> Result<Json<Registry>, AppError> {
    Ok(Json(filtered(&state, &query)?))
}

/// Query parameters for ranking endpoints
#[derive(Debug, Default, Deserialize)]
pub struct RankQuery {
    pub k: Option<String>,
}

impl RankQuery {
    fn k(&self, default: usize) -> Result<usize, AppError> {
        match self.k.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(default),
            Some(raw) => match raw.parse::<usize>() {
                Ok(k) if k > 0 => Ok(k),
                _ => Err(AppError::ValidationError(format!(
                    "k must be a positive integer (got {:?})",
                    raw
                ))),
            },
        }
    }
}

fn ranked(state: &AppState, query: &RankQuery) -> Result<Vec<RankedRegion>, AppError> {
    let runtime = state.config.current();
    let k = query.k(runtime.schedule.push_top_k)?;
    Ok(top_k(&state.registry.snapshot(), k, &runtime.policy))
}

/// Top-K regions rendered as a DERP map
pub async fn get_sorted_derp_map(
    State(state): SharedState,
    Query(query): Query<RankQuery>,
) -> Result<Json<DerpMap>, AppError> {
    Ok(Json(DerpMap::from_ranked(&ranked(&state, &query)?)))
}

pub async fn get_ranking(
    State(state): SharedState,
    Query(query): Query<RankQuery>,
) -> Result<Json<Vec<RankedRegion>>, AppError> {
    Ok(Json(ranked(&state, &query)?))
}

/// Push the current top-K regions right away
pub async fn trigger_push(State(state): SharedState) -> Result<Json<PushAck>, AppError> {
    let target = state.push.as_ref().ok_or_else(|| {
        AppError::NotFoundError("configuration push is not configured".to_string())
    })?;

    let ack = target.push_now(&state.registry, &state.config).await?;
    if let Err(e) = save_json(state.store.as_ref(), LAST_PUSH_KEY, &Utc::now()).await {
        tracing::warn!("Failed to record {}: {}", LAST_PUSH_KEY, e);
    }
    Ok(Json(ack))
}

pub async fn get_config(State(state): SharedState) -> Json<RuntimeConfig> {
    Json(state.config.current())
}

/// Replace the runtime configuration. The body must be a complete configuration.
pub async fn set_config(
    State(state): SharedState,
    body: Bytes,
) -> Result<Json<RuntimeConfig>, AppError> {
    let update: RuntimeConfig = serde_json::from_slice(&body)
        .map_err(|e| AppError::ValidationError(format!("invalid configuration: {}", e)))?;
    Ok(Json(state.config.replace(update)?))
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub message: String,
    pub triggered: bool,
}

/// Start a wipe-and-rediscover pass in the background
pub async fn trigger_reset(State(state): SharedState) -> (StatusCode, Json<TriggerResponse>) {
    // Shared with the periodic reset job
    let Some(guard) = state.discovery.begin_reset() else {
        return (
            StatusCode::OK,
            Json(TriggerResponse {
                message: "A reset is already running".to_string(),
                triggered: false,
            }),
        );
    };

    let discovery = state.discovery.clone();
    let store = state.store.clone();
    tokio::spawn(async move {
        match discovery.reset_and_rediscover(guard).await {
            Ok(summary) => tracing::info!("On-demand reset rediscovered {} nodes", summary.inserted),
            Err(e) => tracing::error!("On-demand reset failed: {}", e),
        }
        if let Err(e) = save_json(store.as_ref(), LAST_RESET_KEY, &Utc::now()).await {
            tracing::warn!("Failed to record {}: {}", LAST_RESET_KEY, e);
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            message: "Registry reset and rediscovery triggered".to_string(),
            triggered: true,
        }),
    )
}
