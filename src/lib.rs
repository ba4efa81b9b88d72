mod app;
mod detection;
mod imaging;
mod labels;
mod model_service;
mod ort_service;
mod postprocess;
mod routes;
mod server;

pub mod config;

pub use app::start_app;
pub use detection::Detection;
pub use model_service::{ModelError, ModelService};
pub use routes::{PredictError, PredictionResponse};
pub use server::{create_router, AppState};
