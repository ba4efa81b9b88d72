use crate::{detection::Detection, model_service::ModelService, server::AppState};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::instrument;

const IMAGE_FIELD: &str = "image";
const SUCCESS_MESSAGE: &str = "Prediction successful";

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("No image file")]
    MissingImage,
    #[error("Image file too large: {0}")]
    TooLarge(String),
    #[error("Error processing image: {0}")]
    Processing(String),
}

impl PredictError {
    fn status(&self) -> StatusCode {
        match self {
            PredictError::MissingImage => StatusCode::BAD_REQUEST,
            PredictError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            PredictError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub message: String,
    pub predictions: Vec<Detection>,
}

fn too_large(err: &MultipartError) -> Option<PredictError> {
    (err.status() == StatusCode::PAYLOAD_TOO_LARGE).then(|| PredictError::TooLarge(err.body_text()))
}

/// Returns the bytes of the first `image` file part.
async fn read_image_field(multipart: &mut Multipart) -> Result<Bytes, PredictError> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Err(PredictError::MissingImage),
            Err(e) => {
                tracing::warn!("Malformed multipart body: {}", e);
                return Err(too_large(&e).unwrap_or(PredictError::MissingImage));
            }
        };

        if field.name() == Some(IMAGE_FIELD) && field.file_name().is_some() {
            return field.bytes().await.map_err(|e| {
                too_large(&e).unwrap_or_else(|| PredictError::Processing(e.body_text()))
            });
        }
    }
}

#[instrument(skip(state, multipart))]
pub async fn predict_image<M: ModelService>(
    State(state): State<AppState<M>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, PredictError> {
    let mut multipart = multipart.map_err(|e| {
        tracing::debug!("Request is not multipart: {}", e);
        PredictError::MissingImage
    })?;

    let image_data = read_image_field(&mut multipart).await?;
    tracing::debug!("Received image of {} bytes", image_data.len());

    let predictions = state
        .model_service
        .predict(image_data)
        .await
        .map_err(|e| {
            tracing::error!("Prediction failed: {}", e);
            PredictError::Processing(e.to_string())
        })?;

    tracing::debug!("Returning {} detections", predictions.len());
    for (i, detection) in predictions.iter().enumerate() {
        tracing::debug!(
            "Detection {}: class={} ({}), confidence={:.3}, center=({:.1}, {:.1}), size=({:.1}, {:.1})",
            i,
            detection.class_id,
            detection.name,
            detection.confidence,
            detection.xcenter,
            detection.ycenter,
            detection.width,
            detection.height
        );
    }

    Ok(Json(PredictionResponse {
        message: SUCCESS_MESSAGE.to_string(),
        predictions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        imaging::{decode_image, tests::png_bytes},
        model_service::ModelError,
        server::create_router,
    };
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{header, Method, Request},
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    const BOUNDARY: &str = "detection-test-boundary";

    /// Reports the decoded image width as the box width, so each response can
    /// be traced back to its own upload.
    struct MockModelService;

    #[async_trait]
    impl ModelService for MockModelService {
        async fn predict(&self, image_data: Bytes) -> Result<Vec<Detection>, ModelError> {
            let image = decode_image(&image_data)?;
            Ok(vec![Detection {
                xcenter: image.width() as f32 / 2.,
                ycenter: image.height() as f32 / 2.,
                width: image.width() as f32,
                height: image.height() as f32,
                confidence: 0.9,
                class_id: 0,
                name: "person".into(),
            }])
        }
    }

    struct EmptyModelService;

    #[async_trait]
    impl ModelService for EmptyModelService {
        async fn predict(&self, image_data: Bytes) -> Result<Vec<Detection>, ModelError> {
            decode_image(&image_data)?;
            Ok(Vec::new())
        }
    }

    fn app() -> Router {
        create_router(AppState::new(MockModelService), 16 * 1024 * 1024)
    }

    fn multipart_body(name: &str, file_name: Option<&str>, data: &[u8]) -> Vec<u8> {
        let disposition = match file_name {
            Some(file_name) => format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                name, file_name
            ),
            None => format!("Content-Disposition: form-data; name=\"{}\"\r\n", name),
        };

        let mut body = format!("--{}\r\n", BOUNDARY).into_bytes();
        body.extend_from_slice(disposition.as_bytes());
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn predict_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/predict")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn image_request(data: &[u8]) -> Request<Body> {
        predict_request(multipart_body("image", Some("upload.png"), data))
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_missing_image_field() {
        let request = predict_request(multipart_body("file", Some("upload.png"), b"abc"));

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({ "error": "No image file" }));
    }

    #[tokio::test]
    async fn test_image_field_without_file_name() {
        let request = predict_request(multipart_body("image", None, b"abc"));

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({ "error": "No image file" }));
    }

    #[tokio::test]
    async fn test_non_multipart_request() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/predict")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"image": "abc"}"#))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({ "error": "No image file" }));
    }

    #[tokio::test]
    async fn test_predict_image() {
        let response = app()
            .oneshot(image_request(&png_bytes(64, 48, [0, 255, 0])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["message"], "Prediction successful");

        let predictions = body["predictions"].as_array().unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0]["width"], 64.0);
        assert_eq!(predictions[0]["height"], 48.0);
        assert_eq!(predictions[0]["class"], 0);
        assert_eq!(predictions[0]["name"], "person");
    }

    #[tokio::test]
    async fn test_predict_image_without_detections() {
        let app = create_router(AppState::new(EmptyModelService), 16 * 1024 * 1024);

        let response = app
            .oneshot(image_request(&png_bytes(8, 8, [0, 0, 0])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["predictions"], json!([]));
    }

    #[tokio::test]
    async fn test_predict_non_image_payload() {
        let response = app()
            .oneshot(image_request(b"this is not an image"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        let error = body["error"].as_str().unwrap();
        assert!(error.starts_with("Error processing image: "));
        assert!(error.len() > "Error processing image: ".len());
    }

    #[tokio::test]
    async fn test_predict_is_deterministic() {
        let image = png_bytes(32, 32, [10, 20, 30]);

        let first = json_body(app().oneshot(image_request(&image)).await.unwrap()).await;
        let second = json_body(app().oneshot(image_request(&image)).await.unwrap()).await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_independent() {
        let app = app();
        let widths: Vec<u32> = (1..=8).map(|i| i * 10).collect();

        let responses = futures::future::join_all(widths.iter().map(|&width| {
            let app = app.clone();
            async move {
                let response = app
                    .oneshot(image_request(&png_bytes(width, 5, [1, 2, 3])))
                    .await
                    .unwrap();
                json_body(response).await
            }
        }))
        .await;

        for (width, body) in widths.iter().zip(responses) {
            assert_eq!(body["predictions"][0]["width"], *width as f64);
        }
    }

    #[tokio::test]
    async fn test_upload_over_body_limit() {
        let app = create_router(AppState::new(MockModelService), 256);
        let payload = vec![7u8; 4096];

        let response = app.oneshot(image_request(&payload)).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = json_body(response).await;
        let error = body["error"].as_str().unwrap();
        assert!(error.starts_with("Image file too large: "));
        assert!(error.len() > "Image file too large: ".len());
        assert!(body.get("predictions").is_none());
    }

    #[tokio::test]
    async fn test_predict_rejects_get() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/predict")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let mut request = image_request(&png_bytes(4, 4, [0, 0, 0]));
        request.headers_mut().insert(
            header::ORIGIN,
            "http://example.com".parse().unwrap(),
        );

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "Available");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
