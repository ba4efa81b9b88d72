use crate::{
    config::{ModelConfig, Validatable},
    detection::Detection,
    imaging::{decode_image, to_input_tensor, Letterbox},
    labels::ClassLabels,
    model_service::{ModelError, ModelService},
    postprocess::Postprocessor,
};
use async_trait::async_trait;
use bytes::Bytes;
use ndarray::{Array, ArrayD, ArrayViewD, Ix4};
#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

fn load_error(err: impl std::fmt::Display) -> ModelError {
    ModelError::Load(err.to_string())
}

fn inference_error(err: impl std::fmt::Display) -> ModelError {
    ModelError::Inference(err.to_string())
}

fn build_session(model_config: &ModelConfig) -> Result<Session, ModelError> {
    let builder = Session::builder().map_err(load_error)?;

    #[cfg(feature = "tensorrt")]
    let builder = builder
        .with_execution_providers([TensorRTExecutionProvider::default()
            .with_engine_cache(true)
            .build()])
        .map_err(load_error)?;

    builder
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(load_error)?
        .commit_from_file(model_config.get_path())
        .map_err(load_error)
}

/// Pool of ONNX Runtime sessions over one detector, loaded once at startup.
#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Mutex<Session>>>,
    counter: Arc<AtomicUsize>,
    postprocessor: Arc<Postprocessor>,
    labels: Arc<ClassLabels>,
    input_size: u32,
    output_name: String,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig, labels: ClassLabels) -> Result<Self, ModelError> {
        model_config
            .validate_parameters()
            .and_then(|_| model_config.validate())
            .map_err(ModelError::Load)?;

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| build_session(model_config).map(Mutex::new))
            .collect::<Result<Vec<_>, ModelError>>()?;

        let output_name = resolve_output_name(&sessions[0], &model_config.output_name)?;

        tracing::info!(
            "Created {} ONNX sessions for {:?} (output `{}`)",
            num_instances,
            model_config.get_path(),
            output_name
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            postprocessor: Arc::new(Postprocessor::from(model_config)),
            labels: Arc::new(labels),
            input_size: model_config.input_size,
            output_name,
        })
    }

    pub fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, ModelError> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| ModelError::SessionPoisoned(e.to_string()))?;

        tracing::debug!("Handling request with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view()).map_err(inference_error)?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(inference_error)?;

        let output = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(inference_error)?;

        Ok(output.to_owned())
    }

    fn predict_blocking(&self, image_data: &[u8]) -> Result<Vec<Detection>, ModelError> {
        let (input, letterbox) = prepare_input(image_data, self.input_size)?;
        let output = self.run_inference(&input)?;
        to_detections(&self.postprocessor, &self.labels, output.view(), &letterbox)
    }
}

/// Decodes an upload into the network input and its letterbox geometry.
fn prepare_input(
    image_data: &[u8],
    input_size: u32,
) -> Result<(Array<f32, Ix4>, Letterbox), ModelError> {
    let image = decode_image(image_data)?;
    tracing::debug!("Decoded {}x{} image", image.width(), image.height());
    Ok(to_input_tensor(&image, input_size))
}

fn to_detections(
    postprocessor: &Postprocessor,
    labels: &ClassLabels,
    output: ArrayViewD<'_, f32>,
    letterbox: &Letterbox,
) -> Result<Vec<Detection>, ModelError> {
    let boxes = postprocessor.process(output, letterbox)?;
    Ok(boxes
        .iter()
        .map(|bbox| Detection::from_box(bbox, labels.name(bbox.class_id)))
        .collect())
}

/// Uses the configured output if the graph has it, else the first output.
fn resolve_output_name(session: &Mutex<Session>, configured: &str) -> Result<String, ModelError> {
    let session = session
        .lock()
        .map_err(|e| ModelError::SessionPoisoned(e.to_string()))?;

    if session.outputs.iter().any(|output| output.name == configured) {
        return Ok(configured.to_string());
    }

    match session.outputs.first() {
        Some(output) => {
            tracing::warn!(
                "Model has no output named `{}`, using `{}`",
                configured,
                output.name
            );
            Ok(output.name.clone())
        }
        None => Err(ModelError::Load("model declares no outputs".into())),
    }
}

#[async_trait]
impl ModelService for OrtModelService {
    async fn predict(&self, image_data: Bytes) -> Result<Vec<Detection>, ModelError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.predict_blocking(&image_data)).await?
    }
}
