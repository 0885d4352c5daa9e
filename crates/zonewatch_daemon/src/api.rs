use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;
use zonewatch_core::{
    Assignment, CorrelationEngine, SectionAllocator, SectionId, TelemetryEvent, TemperatureSample,
    Zone, ZoneOccupancy, ZonewatchError,
};

use crate::error::TransportError;
use crate::stats::{ServiceStats, StatsSnapshot};
use crate::transport::{MessageQueue, TopicStats};

#[derive(Clone)]
pub struct ApiState {
    pub allocator: Arc<SectionAllocator>,
    pub engine: Arc<CorrelationEngine>,
    pub queue: Arc<MessageQueue>,
    pub raw_topic: String,
    pub outbound_topic: String,
    pub stats: Arc<ServiceStats>,
}

/// Upper bound on events returned by one outbound drain.
const MAX_DRAIN: usize = 1_000;

// Response types
#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataAccepted {
    pub message_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub section: SectionId,
    pub mean: Option<f64>,
    pub samples: Vec<TemperatureSample>,
}

#[derive(Debug, Deserialize)]
pub struct DrainParams {
    #[serde(default = "default_drain")]
    pub max: usize,
}

fn default_drain() -> usize {
    100
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OutboundBatch {
    pub events: Vec<TelemetryEvent>,
    /// Events still waiting on the outbound topic.
    pub remaining: usize,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub counters: StatsSnapshot,
    pub allocated: usize,
    pub stored_samples: usize,
    pub topics: Vec<TopicStats>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(e: ZonewatchError) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

fn unavailable(e: TransportError) -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

// Handlers
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn register(State(state): State<ApiState>) -> Result<Json<Assignment>, ApiError> {
    state.allocator.register().map(Json).map_err(bad_request)
}

async fn ingest(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<(StatusCode, Json<DataAccepted>), ApiError> {
    state.stats.record_received();

    let event = TelemetryEvent::from_slice(&body).map_err(|e| {
        state.stats.record_malformed();
        warn!(error = %e, "Rejected malformed telemetry");
        bad_request(e)
    })?;

    state
        .allocator
        .validate(&event.device_id, event.zone, event.section)
        .map_err(|e| {
            state.stats.record_malformed();
            warn!(device_id = %event.device_id, error = %e, "Rejected telemetry location");
            bad_request(e)
        })?;

    let message_id = state
        .queue
        .publish(&state.raw_topic, event.to_vec())
        .map_err(|e| {
            warn!(error = %e, "Raw topic refused telemetry");
            unavailable(e)
        })?;

    // only published readings refresh the allocation
    if let Err(e) = state
        .allocator
        .touch(&event.device_id, event.zone, event.section)
    {
        warn!(device_id = %event.device_id, error = %e, "Allocation changed after publish");
    }

    Ok((StatusCode::ACCEPTED, Json(DataAccepted { message_id })))
}

async fn zones(State(state): State<ApiState>) -> Json<Vec<Zone>> {
    Json(state.engine.zones().zones().to_vec())
}

async fn allocations(State(state): State<ApiState>) -> Json<Vec<ZoneOccupancy>> {
    Json(state.allocator.snapshot())
}

async fn history(
    State(state): State<ApiState>,
    Path(section): Path<SectionId>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let history = state.engine.history();
    let samples = history.snapshot(section).map_err(bad_request)?;
    let mean = history.section_mean(section).map_err(bad_request)?;
    Ok(Json(HistoryResponse {
        section,
        mean,
        samples,
    }))
}

/// Hands accepted events on the outbound topic to an HTTP subscriber.
async fn drain_outbound(
    State(state): State<ApiState>,
    Query(params): Query<DrainParams>,
) -> Json<OutboundBatch> {
    let topic = state.queue.topic(&state.outbound_topic);
    let limit = params.max.min(MAX_DRAIN);
    let mut events = Vec::new();
    while events.len() < limit {
        let Some(delivery) = topic.try_next() else {
            break;
        };
        match TelemetryEvent::from_slice(delivery.body()) {
            Ok(event) => events.push(event),
            Err(e) => warn!(
                message_id = %delivery.id(),
                error = %e,
                "Dropping unreadable outbound message"
            ),
        }
        delivery.finish();
    }
    Json(OutboundBatch {
        events,
        remaining: topic.pending(),
    })
}

async fn stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        counters: state.stats.snapshot(),
        allocated: state.allocator.allocated_count(),
        stored_samples: state.engine.history().total_samples(),
        topics: state.queue.stats(),
    })
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/register", get(register).post(register))
        .route("/data", post(ingest))
        .route("/api/zones", get(zones))
        .route("/api/allocations", get(allocations))
        .route("/api/history/:section", get(history))
        .route("/api/outbound", get(drain_outbound))
        .route("/api/stats", get(stats))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn run_api_server<F>(
    listener: TcpListener,
    state: ApiState,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "API server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
