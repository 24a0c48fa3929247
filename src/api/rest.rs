//! Axum REST API handlers

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
    extract::{State, Multipart, DefaultBodyLimit},
    http::StatusCode,
    response::Json,
};
use image::RgbImage;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::{DecodeError, PipelineError};
use crate::service::{EmotionService, PredictionResult};
use crate::utils::image::{decode_base64_rgb, decode_rgb};

use super::dto::*;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<EmotionService>,
}

/// Create the REST API router
pub fn create_rest_router(state: Arc<AppState>, body_limit: usize) -> Router {
    Router::new()
        .route("/detect_emotion", post(detect_emotion_handler))
        .route("/detect_emotion_base64", post(detect_emotion_base64_handler))
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        // Middleware
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Why a request did not produce a result
enum Rejection {
    Decode(DecodeError),
    Pipeline(PipelineError),
}

impl From<DecodeError> for Rejection {
    fn from(e: DecodeError) -> Self {
        Rejection::Decode(e)
    }
}

impl From<PipelineError> for Rejection {
    fn from(e: PipelineError) -> Self {
        Rejection::Pipeline(e)
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Decode(e) => {
                warn!("Rejected image: {}", e);
                (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.to_string(), e.code())))
            }
            Rejection::Pipeline(PipelineError::ServiceUnavailable) => not_initialized(),
            Rejection::Pipeline(PipelineError::Internal(e)) => {
                error!("Emotion detection failed: {:#}", e);
                internal_error()
            }
        }
    }
}

fn not_initialized() -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse::new(&PipelineError::ServiceUnavailable.to_string(), "MODEL_NOT_INITIALIZED")),
    )
}

fn internal_error() -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse::new("Internal server error", "INTERNAL_ERROR")))
}

/// Decode and predict on the blocking pool
async fn run_prediction<F>(service: Arc<EmotionService>, decode: F) -> Result<Json<EmotionResponse>, ApiError>
where
    F: FnOnce() -> Result<RgbImage, DecodeError> + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(move || -> Result<PredictionResult, Rejection> {
        let image = decode()?;
        Ok(service.predict(&image)?)
    })
    .await
    .map_err(|e| {
        error!("Prediction task failed: {}", e);
        internal_error()
    })?;

    let result = outcome.map_err(ApiError::from)?;
    Ok(Json(EmotionResponse::from(result)))
}

/// Detect emotion in an uploaded image file
async fn detect_emotion_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<EmotionResponse>, ApiError> {
    let mut image_data: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.to_string(), "MULTIPART_ERROR")))
    })? {
        let name = field.name().unwrap_or("").to_string();
        if name != "file" && name != "image" {
            continue;
        }

        let is_image = field
            .content_type()
            .is_some_and(|content_type| content_type.starts_with("image/"));
        if !is_image {
            return Err(Rejection::from(DecodeError::NotAnImage).into());
        }

        image_data = Some(field.bytes().await.map_err(|e| {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.to_string(), "READ_ERROR")))
        })?.to_vec());
        break;
    }

    let image_data = image_data.ok_or_else(|| {
        (StatusCode::BAD_REQUEST, Json(ErrorResponse::new("Missing image field", "MISSING_IMAGE")))
    })?;

    run_prediction(state.service.clone(), move || decode_rgb(&image_data)).await
}

/// Detect emotion in a base64 encoded image
async fn detect_emotion_base64_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Base64ImageRequest>,
) -> Result<Json<EmotionResponse>, ApiError> {
    run_prediction(state.service.clone(), move || decode_base64_rgb(&request.image)).await
}

/// Health check
async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, ApiError> {
    let health = state.service.health();
    if !health.ready {
        return Err(not_initialized());
    }
    Ok(Json(HealthResponse::from(health)))
}

/// Service description
async fn root_handler() -> Json<RootResponse> {
    let endpoints = [
        ("/detect_emotion", "POST - Upload image file for emotion detection"),
        ("/detect_emotion_base64", "POST - Send base64 encoded image for emotion detection"),
        ("/health", "GET - Check API health status"),
    ];

    Json(RootResponse {
        name: "Emotion Detection API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        endpoints: endpoints
            .into_iter()
            .map(|(path, what)| (path.to_string(), what.to_string()))
            .collect::<BTreeMap<_, _>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use image::{DynamicImage, Rgb};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::engine::model::tests::{load_fixed, write_weights};
    use crate::engine::{BoundingBox, ChannelOrder, FaceLocalizer, OrderedImage};
    use crate::utils::image::tests::png_bytes;

    const BOUNDARY: &str = "emofaceboundary";

    /// Reports a face covering the top-left quarter, or fails
    struct QuarterFace {
        fail: bool,
    }

    impl FaceLocalizer for QuarterFace {
        fn channel_order(&self) -> ChannelOrder {
            ChannelOrder::Bgr
        }

        fn detect(&self, image: &OrderedImage) -> anyhow::Result<Vec<BoundingBox>> {
            if self.fail {
                anyhow::bail!("localizer exploded");
            }
            let (w, h) = image.dimensions();
            Ok(vec![BoundingBox::new(0, 0, (w / 2) as i32, (h / 2) as i32)])
        }
    }

    fn test_app(fail: bool) -> (Router, Arc<EmotionService>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = write_weights(dir.path(), &[0.0, 0.1, 3.0, 0.2, 0.0]);
        let model = load_fixed(&path, 5, 0.5, -0.5);
        let service = Arc::new(EmotionService::new(Box::new(QuarterFace { fail }), model, 16));
        let router = create_rest_router(Arc::new(AppState { service: service.clone() }), 1024 * 1024);
        (router, service, dir)
    }

    fn png() -> Vec<u8> {
        png_bytes(&DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 30, Rgb([120, 80, 40]))))
    }

    fn multipart_request(field: &str, content_type: &str, data: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"face.png\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/detect_emotion")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    fn base64_request(image: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/detect_emotion_base64")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "image": image }).to_string()))
            .unwrap()
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_root_lists_endpoints() {
        let (router, _service, _dir) = test_app(false);
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (status, body) = send(router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Emotion Detection API");
        assert!(body["endpoints"]["/detect_emotion_base64"].is_string());
    }

    #[tokio::test]
    async fn test_health() {
        let (router, service, _dir) = test_app(false);
        let request = || Request::builder().uri("/health").body(Body::empty()).unwrap();

        let (status, body) = send(router.clone(), request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"status": "healthy", "model_loaded": true, "device": "cpu", "n_classes": 5})
        );

        service.shutdown();
        let (status, body) = send(router, request()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "MODEL_NOT_INITIALIZED");
    }

    #[tokio::test]
    async fn test_upload_prediction() {
        let (router, _service, _dir) = test_app(false);
        let (status, body) = send(router, multipart_request("file", "image/png", &png())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["face_detected"], true);
        assert_eq!(body["emotion"], "Sad");
        assert_eq!(body["face_bbox"], json!([0, 0, 20, 15]));
        assert_eq!(body["valence"], 0.5);
        assert_eq!(body["emotion_probabilities"].as_object().unwrap().len(), 5);
        assert!(body["message"].is_null());
    }

    #[tokio::test]
    async fn test_upload_must_be_an_image() {
        let (router, _service, _dir) = test_app(false);
        let (status, body) = send(router, multipart_request("image", "text/plain", b"hello")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "File must be an image", "code": "INVALID_CONTENT_TYPE"}));
    }

    #[tokio::test]
    async fn test_undecodable_upload() {
        let (router, _service, _dir) = test_app(false);
        let (status, body) = send(router, multipart_request("file", "image/jpeg", b"not a jpeg")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_IMAGE");
    }

    #[tokio::test]
    async fn test_base64_with_data_uri() {
        let (router, _service, _dir) = test_app(false);
        let encoded = format!("data:image/png;base64,{}", STANDARD.encode(png()));
        let (status, body) = send(router, base64_request(&encoded)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["face_detected"], true);
        assert_eq!(body["arousal"], -0.5);
    }

    #[tokio::test]
    async fn test_invalid_base64() {
        let (router, _service, _dir) = test_app(false);
        let (status, body) = send(router, base64_request("%%%")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_BASE64");
    }

    #[tokio::test]
    async fn test_internal_failure_is_generic() {
        let (router, _service, _dir) = test_app(true);
        let (status, body) = send(router, base64_request(&STANDARD.encode(png()))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": "Internal server error", "code": "INTERNAL_ERROR"}));
    }

    #[tokio::test]
    async fn test_prediction_after_shutdown() {
        let (router, service, _dir) = test_app(false);
        service.shutdown();
        let (status, body) = send(router, base64_request(&STANDARD.encode(png()))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({"error": "Model not initialized", "code": "MODEL_NOT_INITIALIZED"}));
    }
}
