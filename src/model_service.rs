use crate::detection::Detection;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Failures while turning an uploaded payload into detections. The `Display`
/// output is what clients see after `Error processing image: `.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("{0}")]
    Decode(#[from] image::ImageError),
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unexpected model output shape {0:?}")]
    OutputShape(Vec<usize>),
    #[error("session mutex poisoned: {0}")]
    SessionPoisoned(String),
    #[error("inference task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait ModelService: Send + Sync + 'static {
    async fn predict(&self, image_data: Bytes) -> Result<Vec<Detection>, ModelError>;
}
