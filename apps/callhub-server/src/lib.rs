//! Room registry and signaling relay for admin-led peer-to-peer calls.
//!
//! The server keeps rooms of participants with at most one admin each, routes
//! opaque WebRTC signaling envelopes between them, and owns the microphone and
//! screen-share state. The `client` and `peer_link` modules hold the
//! client-side half of the protocol.

pub mod chat;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod media;
pub mod peer_link;
pub mod registry;
pub mod relay;
pub mod room;
pub mod screen_share;
pub mod signaling;
pub mod telemetry;
pub mod websocket;

#[cfg(test)]
mod test_support;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{get_room, health_check, index, metrics_handler};
use crate::websocket::{websocket_handler, SignalingState};

/// Build the HTTP and WebSocket routes. `/metrics` is only mounted when a
/// Prometheus recorder was installed.
pub fn router(signaling: SignalingState, metrics: Option<PrometheusHandle>) -> Router {
    let mut app = Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/rooms/:room_id", get(get_room))
        .route("/ws", get(websocket_handler))
        .with_state(signaling);

    if let Some(handle) = metrics {
        app = app.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(handle),
        );
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
