// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use livereel_api::{ControlEvent, Document, ErrorEnvelope};
use livereel_core::{keys, unix_ms_now, StreamState, StreamStats, StreamStatus};

use crate::gateway::state::AppState;
use crate::gateway::websocket;

/// Validity of playback URLs issued on the status resource.
const PLAYBACK_URL_TTL: Duration = Duration::from_secs(3600);

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Error responses wrap the shared envelope.
struct ApiError(ErrorEnvelope);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamAttributes {
    status: StreamStatus,
    chunk_count: u64,
    bucket: String,
    started_at_ms: i64,
    storage_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    playback_url: Option<String>,
}

async fn read_stream_state(
    app_state: &AppState,
    stream_id: &str,
) -> Result<StreamState, ApiError> {
    let fields = app_state
        .broker
        .hash_get_all(&keys::state_key(stream_id))
        .await
        .map_err(|e| ApiError(ErrorEnvelope::internal(e.to_string())))?;

    if fields.is_empty() {
        return Err(ApiError(ErrorEnvelope::not_found(format!(
            "no state for stream {stream_id}"
        ))));
    }

    StreamState::from_fields(&fields).map_err(|e| ApiError(ErrorEnvelope::internal(e)))
}

/// GET /api/v1/streams/{id} - the progress fallback for clients without a
/// live websocket.
async fn stream_status_handler(
    State(app_state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Json<Document<StreamAttributes>>, ApiError> {
    let stream_state = read_stream_state(&app_state, &stream_id).await?;

    let storage_key = keys::manifest_key(&stream_state.prefix, &stream_id);
    let playback_url = if stream_state.status == StreamStatus::Complete {
        app_state.store.signed_get_url(&storage_key, PLAYBACK_URL_TTL).await.ok()
    } else {
        None
    };

    let attributes = StreamAttributes {
        status: stream_state.status,
        chunk_count: stream_state.chunk_count,
        bucket: stream_state.bucket,
        started_at_ms: stream_state.started_at_ms,
        storage_key,
        playback_url,
    };

    Ok(Json(Document::new(stream_id, "stream", attributes)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StopAttributes {
    status: StreamStatus,
}

/// POST /api/v1/streams/{id}/stop - the stop fallback. Appends the same
/// control event the websocket path does; idempotent on repeat calls.
async fn stream_stop_handler(
    State(app_state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Json<Document<StopAttributes>>, ApiError> {
    let stream_state = read_stream_state(&app_state, &stream_id).await?;

    let status = match stream_state.status {
        StreamStatus::Starting | StreamStatus::Live => {
            app_state
                .broker
                .hash_set_field(
                    &keys::state_key(&stream_id),
                    "status",
                    StreamStatus::Ending.as_str(),
                )
                .await
                .map_err(|e| ApiError(ErrorEnvelope::internal(e.to_string())))?;

            let control = ControlEvent::StreamStop {
                stream_id: stream_id.clone(),
                stats: StreamStats::default(),
            };
            let payload = serde_json::to_string(&control)
                .map_err(|e| ApiError(ErrorEnvelope::internal(e.to_string())))?;
            app_state
                .broker
                .log_append(keys::CONTROL_LOG, &payload)
                .await
                .map_err(|e| ApiError(ErrorEnvelope::internal(e.to_string())))?;

            if let Err(e) = app_state
                .records
                .mark_streaming_stopped(&stream_id, &StreamStats::default(), unix_ms_now())
                .await
            {
                warn!(stream_id = %stream_id, error = %e, "Recording record update failed on stop");
            }

            app_state.streams.lock().await.detach(&stream_id);
            StreamStatus::Ending
        },
        // Already past Live: report the current status, publish nothing.
        status => status,
    };

    Ok(Json(Document::new(stream_id, "stream", StopAttributes { status })))
}

async fn ws_handler(
    State(app_state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| websocket::handle_websocket(socket, app_state))
}

/// Supports wildcard patterns in origins:
/// - `*` - Allow all origins
/// - `http://localhost:*` - Match any port on localhost
/// - Exact origins like `https://example.com`
fn origin_matches_pattern(origin: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix_without_port) = pattern.strip_suffix(":*") {
        let Some(rest) = origin.strip_prefix(prefix_without_port) else {
            return false;
        };

        let Some(port_str) = rest.strip_prefix(':') else {
            return false;
        };

        return !port_str.is_empty() && port_str.chars().all(|c| c.is_ascii_digit());
    }

    origin == pattern
}

fn create_cors_layer(config: &crate::config::CorsConfig) -> CorsLayer {
    if config.allowed_origins.iter().any(|o| o == "*") {
        info!("CORS configured to allow all origins (permissive mode)");
        return CorsLayer::permissive();
    }

    if config.allowed_origins.is_empty() {
        info!("CORS configured with no allowed origins (most restrictive)");
        return CorsLayer::new();
    }

    let patterns: Vec<String> = config.allowed_origins.clone();
    info!(allowed_origins = ?patterns, "CORS configured with origin allowlist");

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _request_parts| {
        let Ok(origin_str) = origin.to_str() else {
            return false;
        };
        patterns.iter().any(|pattern| origin_matches_pattern(origin_str, pattern))
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any)
}

/// Builds the gateway router. Exposed for integration tests.
pub fn create_app(app_state: Arc<AppState>) -> Router {
    let cors = create_cors_layer(&app_state.config.server.cors);

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/ws/stream", get(ws_handler))
        .route("/api/v1/streams/{id}", get(stream_status_handler))
        .route("/api/v1/streams/{id}/stop", post(stream_stop_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Binds the configured address and serves until a shutdown signal.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn serve(app_state: Arc<AppState>) -> anyhow::Result<()> {
    let address = app_state.config.server.address.clone();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(address = %address, "Gateway listening");

    let app = create_app(app_state);
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

#[cfg(test)]
mod cors_tests {
    use super::origin_matches_pattern;

    #[test]
    fn cors_wildcard_port_matches_localhost_port_only() {
        assert!(origin_matches_pattern("http://localhost:8080", "http://localhost:*"));
        assert!(origin_matches_pattern("https://localhost:12345", "https://localhost:*"));

        assert!(!origin_matches_pattern("http://localhost", "http://localhost:*"));
        assert!(!origin_matches_pattern("http://localhost:abc", "http://localhost:*"));
        assert!(!origin_matches_pattern("http://localhost123:8080", "http://localhost:*"));
        assert!(!origin_matches_pattern("http://127.0.0.1:8080", "http://localhost:*"));
    }

    #[test]
    fn cors_exact_match_only() {
        assert!(origin_matches_pattern("https://example.com", "https://example.com"));
        assert!(!origin_matches_pattern("https://example.com:443", "https://example.com"));
        assert!(!origin_matches_pattern("https://example.com", "https://example.com:*"));
    }
}
