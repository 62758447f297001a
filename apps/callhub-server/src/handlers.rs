use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::signaling::ParticipantInfo;
use crate::websocket::SignalingState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub rooms: usize,
    pub participants: usize,
    pub connections: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub room_id: String,
    pub admin_id: Option<String>,
    pub participants: Vec<ParticipantInfo>,
    pub created_at: DateTime<Utc>,
}

/// GET / - Banner
pub async fn index() -> &'static str {
    "CallHub signaling server is running"
}

/// GET /health - Health check endpoint
pub async fn health_check(State(state): State<SignalingState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        rooms: state.registry.room_count(),
        participants: state.registry.participant_count(),
        connections: state.open_connections(),
        timestamp: Utc::now(),
    })
}

/// GET /rooms/{room_id} - Participant snapshot for reconciliation
pub async fn get_room(
    State(state): State<SignalingState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomResponse>, StatusCode> {
    match state.registry.room_snapshot(&room_id) {
        Some(snapshot) => Ok(Json(RoomResponse {
            room_id: snapshot.room_id,
            admin_id: snapshot.admin_id,
            participants: snapshot.participants,
            created_at: snapshot.created_at,
        })),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}
