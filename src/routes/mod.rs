mod health;
mod predict;

pub use health::healthcheck;
pub use predict::{predict_image, PredictError, PredictionResponse};
