use crate::{config::Config, labels::ClassLabels, ort_service::OrtModelService, server::HttpServer};
use std::error::Error;

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let labels = match ClassLabels::new(&config.labels) {
        Ok(labels) => labels,
        Err(e) => {
            tracing::error!("Failed to load class labels: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let model_service = match OrtModelService::new(&config.model, labels) {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("Failed to load detection model: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let server = HttpServer::new(model_service, &config.server).await?;
    server.run().await?;

    Ok(())
}
