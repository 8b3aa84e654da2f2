use std::{path::PathBuf, sync::Arc};

use axum::{
    body::Body,
    extract::{Path as AxPath, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::{
    directory::{StreamDirectory, StreamState},
    error::ApiError,
    pipeline::PipelineOrchestrator,
};

use super::dto::{CreateStreamResponse, CreateStreamRequest, StatusResponse};

static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
static SEGMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^segment_\d+\.(m4s|ts)$").unwrap());

const ALLOWED_TIERS: [&str; 3] = ["64x64", "128x128", "256x256"];

#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<StreamDirectory>,
    pub pipeline: Arc<PipelineOrchestrator>,
    pub streams_dir: PathBuf,
}

pub fn router(state: AppState, static_dir: PathBuf) -> Router {
    let api = Router::new()
        .route("/stream", post(create_stream).options(cors_preflight))
        .route(
            "/stream/:id/status",
            get(stream_status).options(cors_preflight),
        )
        .route(
            "/stream/:id/master.m3u8",
            get(master_playlist).options(cors_preflight),
        )
        .route(
            "/stream/:id/:tier/index.m3u8",
            get(media_playlist).options(cors_preflight),
        )
        .route(
            "/stream/:id/:tier/:segment",
            get(segment).options(cors_preflight),
        )
        .with_state(state.clone());

    let static_service = tower_http::services::ServeDir::new(static_dir);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .nest("/api", api)
        .fallback_service(static_service)
        .layer(tower_http::catch_panic::CatchPanicLayer::new())
        .layer(axum::middleware::from_fn(telemetry::trace_http_request))
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics() -> impl IntoResponse {
    match telemetry::metrics::encode_metrics() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn cors_preflight() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [
            ("Access-Control-Allow-Origin", "*"),
            ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
        ],
    )
}

fn validate_id(id: &str) -> Result<(), ApiError> {
    if ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(ApiError::bad_request("invalid stream id"))
    }
}

fn validate_tier(tier: &str) -> Result<(), ApiError> {
    if ALLOWED_TIERS.contains(&tier) {
        Ok(())
    } else {
        Err(ApiError::bad_request("invalid quality tier"))
    }
}

async fn create_stream(
    State(state): State<AppState>,
    Json(req): Json<CreateStreamRequest>,
) -> Result<(StatusCode, Json<CreateStreamResponse>), ApiError> {
    if req.url.trim().is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }

    let record = state.directory.create(Utc::now());
    let stream_id = record.id.clone();

    telemetry::metrics::STREAMS_CREATED_TOTAL.inc();
    info!(stream_id = %stream_id, "stream create requested");

    let pipeline = state.pipeline.clone();
    let url = req.url.clone();
    tokio::spawn(async move {
        pipeline.run(stream_id, url).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateStreamResponse { stream_id: record.id, status: StreamState::Initializing }),
    ))
}

async fn stream_status(
    State(state): State<AppState>,
    AxPath(id): AxPath<String>,
) -> Result<Response, ApiError> {
    validate_id(&id)?;
    state.directory.touch(&id, Utc::now());
    let record = state
        .directory
        .get(&id)
        .ok_or_else(|| ApiError::not_found("unknown stream"))?;
    let timeout_secs = state.directory.timeout().as_secs();
    let body = Json(StatusResponse::from_record(record, timeout_secs));
    let mut response = body.into_response();
    response
        .headers_mut()
        .insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    Ok(response)
}

async fn master_playlist(
    State(state): State<AppState>,
    AxPath(id): AxPath<String>,
) -> Result<Response, ApiError> {
    validate_id(&id)?;
    let stream_dir = state.streams_dir.join(&id);
    if tokio::fs::metadata(&stream_dir).await.is_err() {
        return Err(ApiError::not_found("unknown stream"));
    }
    touch_or_register(&state.directory, &id);

    let body = crate::hls::build_master_playlist();
    Ok(hls_response(body.into_bytes(), "application/vnd.apple.mpegurl"))
}

async fn media_playlist(
    State(state): State<AppState>,
    AxPath((id, tier)): AxPath<(String, String)>,
) -> Result<Response, ApiError> {
    validate_id(&id)?;
    validate_tier(&tier)?;
    touch_or_register(&state.directory, &id);

    let path = state.streams_dir.join(&id).join(&tier).join("index.m3u8");
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found("playlist not found"))?;
    Ok(hls_response(bytes, "application/vnd.apple.mpegurl"))
}

async fn segment(
    State(state): State<AppState>,
    AxPath((id, tier, segment_name)): AxPath<(String, String, String)>,
) -> Result<Response, ApiError> {
    validate_id(&id)?;
    validate_tier(&tier)?;

    if segment_name != "init.mp4" && !SEGMENT_RE.is_match(&segment_name) {
        return Err(ApiError::bad_request("invalid segment name"));
    }

    touch_or_register(&state.directory, &id);

    let tier_dir = state.streams_dir.join(&id).join(&tier);
    let segment_path = tier_dir.join(&segment_name);

    match tokio::fs::read(&segment_path).await {
        Ok(bytes) => {
            let content_type = if segment_name.ends_with(".ts") {
                "video/MP2T"
            } else {
                "video/mp4"
            };
            Ok(hls_response(bytes, content_type))
        }
        Err(_) => {
            let playlist_path = tier_dir.join("index.m3u8");
            if tokio::fs::metadata(&playlist_path).await.is_ok() {
                Err(ApiError::not_ready("segment not ready"))
            } else {
                Err(ApiError::not_found("segment not found"))
            }
        }
    }
}

fn touch_or_register(directory: &StreamDirectory, id: &str) {
    let now = Utc::now();
    if !directory.touch(id, now) {
        directory.register(id, now);
    }
}

fn hls_response(body: Vec<u8>, content_type: &'static str) -> Response {
    let mut response = Response::new(Body::from(body));
    response
        .headers_mut()
        .insert("Content-Type", HeaderValue::from_static(content_type));
    response
        .headers_mut()
        .insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        extractor::ExtractorAdapter, registry::ProcessRegistry, transcoder::TranscoderAdapter,
    };
    use axum::{body::Body as AxBody, http::Request};
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(streams_dir: PathBuf) -> AppState {
        let directory = Arc::new(StreamDirectory::new(Duration::from_secs(300)));
        let extractor = Arc::new(ExtractorAdapter::new("yt-dlp", false));
        let transcoder = Arc::new(TranscoderAdapter::new("ffmpeg"));
        let registry = Arc::new(ProcessRegistry::new());
        let pipeline = Arc::new(PipelineOrchestrator::new(
            extractor,
            transcoder,
            directory.clone(),
            registry,
            streams_dir.clone(),
        ));
        AppState { directory, pipeline, streams_dir }
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path().to_path_buf());
        let app = router(state, tmp.path().to_path_buf());

        let resp = app
            .oneshot(Request::builder().uri("/health").body(AxBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_stream_returns_202_with_id() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path().to_path_buf());
        let app = router(state, tmp.path().to_path_buf());

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/stream")
                    .header("content-type", "application/json")
                    .body(AxBody::from(json!({ "url": "https://example.com/video" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: CreateStreamResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(!body.stream_id.is_empty());
    }

    #[tokio::test]
    async fn unknown_status_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path().to_path_buf());
        let app = router(state, tmp.path().to_path_buf());

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/stream/unknown/status")
                    .body(AxBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn known_status_reports_active_and_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path().to_path_buf());
        state.directory.register("abc", Utc::now());
        let app = router(state, tmp.path().to_path_buf());

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/stream/abc/status")
                    .body(AxBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("Access-Control-Allow-Origin").unwrap(), "*");
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["state"], "active");
        assert_eq!(body["inactivity_timeout_seconds"], 300);
    }

    #[tokio::test]
    async fn segment_not_ready_returns_202_with_retry_after() {
        let tmp = tempfile::tempdir().unwrap();
        let tier_dir = tmp.path().join("abc123").join("128x128");
        tokio::fs::create_dir_all(&tier_dir).await.unwrap();
        tokio::fs::write(tier_dir.join("index.m3u8"), b"#EXTM3U\n").await.unwrap();

        let state = test_state(tmp.path().to_path_buf());
        let app = router(state, tmp.path().to_path_buf());

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/stream/abc123/128x128/segment_00001.m4s")
                    .body(AxBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(resp.headers().get("Retry-After").unwrap(), "1");
    }

    #[tokio::test]
    async fn segment_served_with_correct_content_type() {
        let tmp = tempfile::tempdir().unwrap();
        let tier_dir = tmp.path().join("abc123").join("64x64");
        tokio::fs::create_dir_all(&tier_dir).await.unwrap();
        tokio::fs::write(tier_dir.join("segment_00001.m4s"), b"abc").await.unwrap();

        let state = test_state(tmp.path().to_path_buf());
        let app = router(state, tmp.path().to_path_buf());

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/stream/abc123/64x64/segment_00001.m4s")
                    .body(AxBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("Content-Type").unwrap(), "video/mp4");
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"abc");
    }

    #[tokio::test]
    async fn master_playlist_requires_existing_stream_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path().to_path_buf());
        let app = router(state, tmp.path().to_path_buf());

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/stream/missing/master.m3u8")
                    .body(AxBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_tier_is_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path().to_path_buf());
        let app = router(state, tmp.path().to_path_buf());

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/stream/abc/999x999/index.m3u8")
                    .body(AxBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_creation_preflight_returns_204() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path().to_path_buf());
        let app = router(state, tmp.path().to_path_buf());

        let resp = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/stream")
                    .body(AxBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers().get("Access-Control-Allow-Methods").unwrap(),
            "GET, POST, OPTIONS"
        );
    }
}
