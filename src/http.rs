//! HTTP control surface (spec.md §6).
//!
//! Grounded on `examples/original_source/src/recstation/web.go`
//! (`corsHeaders`, `serveStatus`, `serveRecord`, `serveStop`, `StartWeb`).
//! `axum` is the idiomatic Tokio-native counterpart to Go's `net/http` +
//! handler-function style used there; `tower-http`'s `CorsLayer` replaces
//! the original's hand-rolled `corsHeaders` helper with the permissive
//! policy it implements (`Access-Control-Allow-Origin: *` plus the same
//! allowed-headers list).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::coordinator::CoordinatorHandle;

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Deserialize)]
struct PreviewQuery {
    sink: String,
    #[serde(default)]
    next: u8,
}

/// Builds the `axum` router exposing spec.md §6's four endpoints, with
/// permissive CORS applied to all of them.
pub fn router(coordinator: CoordinatorHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/status", get(serve_status))
        .route("/api/v1/record", post(serve_record))
        .route("/api/v1/stop", post(serve_stop))
        .route("/api/v1/preview", get(serve_preview))
        .layer(cors)
        .with_state(Arc::new(coordinator))
}

async fn serve_status(State(coordinator): State<Arc<CoordinatorHandle>>) -> impl IntoResponse {
    match coordinator.status().await {
        Some(status) => Json(status).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "coordinator unavailable").into_response(),
    }
}

async fn serve_record(State(coordinator): State<Arc<CoordinatorHandle>>) -> impl IntoResponse {
    let success = coordinator.record().await;
    Json(SuccessResponse { success })
}

async fn serve_stop(State(coordinator): State<Arc<CoordinatorHandle>>) -> impl IntoResponse {
    let success = coordinator.stop().await;
    Json(SuccessResponse { success })
}

async fn serve_preview(
    State(coordinator): State<Arc<CoordinatorHandle>>,
    Query(query): Query<PreviewQuery>,
) -> Response {
    let next = query.next != 0;
    match coordinator.preview(query.sink, next).await {
        Ok(Some(jpeg)) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"))],
            jpeg,
        )
            .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "no preview for sink").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn fresh_coordinator() -> CoordinatorHandle {
        use crate::config::{Group, Settings};
        use crate::source::audio;
        use crate::source::udp::UdpSource;
        use std::net::Ipv4Addr;
        use std::sync::Arc;
        use std::time::Duration;

        let settings = Arc::new(Settings {
            hostname: "rec1".to_string(),
            iface_name: "lo".to_string(),
            output_filename: "{{stream}}.ts".to_string(),
            output_timestamp: "%Y%m%d".to_string(),
            groups: vec![Group { name: "cam1".to_string(), addr: Ipv4Addr::new(239, 255, 42, 42) }],
            new_output_every: Duration::from_secs(3600),
            source_listen: "127.0.0.1:0".parse().unwrap(),
            heartbeat_listen: "127.0.0.1:0".parse().unwrap(),
            heartbeat_timeout: Duration::from_secs(3),
            http_listen: "127.0.0.1:0".parse().unwrap(),
            alsa_device: "hw:0,0".to_string(),
            alsa_num_channels: 2,
            alsa_bitrate: 48000,
        });

        let (udp, _udp_fatal) = UdpSource::bind("lo", "127.0.0.1:0".parse().unwrap()).expect("bind udp source");
        let (audio, audio_rx) = audio::spawn("hw:0,0".to_string(), 2, 48000);
        let (_hb_tx, hb_rx) = tokio::sync::mpsc::channel(1);

        crate::coordinator::spawn(settings, udp, audio, audio_rx, hb_rx)
    }

    #[tokio::test]
    async fn status_endpoint_reports_idle_state() {
        let app = router(fresh_coordinator());

        let response = app
            .oneshot(Request::builder().uri("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn record_then_stop_round_trips_through_http() {
        let app = router(fresh_coordinator());

        let record_resp = app
            .clone()
            .oneshot(Request::builder().method("POST").uri("/api/v1/record").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(record_resp.status(), StatusCode::OK);

        let stop_resp = app
            .oneshot(Request::builder().method("POST").uri("/api/v1/stop").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(stop_resp.status(), StatusCode::OK);
    }
}
