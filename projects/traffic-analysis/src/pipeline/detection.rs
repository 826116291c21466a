// Inference capability boundary
//
// The scheduler owns exactly one `Inference` value; `infer` takes `&mut self`
// so a second concurrent call cannot be expressed.

use crate::cli::DetectorKind;
use crate::config::DetectorConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::types::DetectionSet;
use image::DynamicImage;
use std::time::Duration;

/// Upper bound on one remote inference round trip.
const REMOTE_INFER_TIMEOUT: Duration = Duration::from_secs(120);

/// Synchronous batch detector. Output is one `DetectionSet` per input image,
/// in input order. Any error applies to the whole call.
pub trait Inference: Send {
    fn infer(&mut self, images: &[DynamicImage]) -> PipelineResult<Vec<DetectionSet>>;

    fn name(&self) -> &str {
        "detector"
    }
}

impl<T: Inference + ?Sized> Inference for Box<T> {
    fn infer(&mut self, images: &[DynamicImage]) -> PipelineResult<Vec<DetectionSet>> {
        (**self).infer(images)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Builds the detector on the thread that will own it.
pub type InferenceFactory = Box<dyn FnOnce() -> anyhow::Result<Box<dyn Inference>> + Send>;

/// Run `infer` and reject results that do not line up 1:1 with the input.
pub fn infer_checked(
    inference: &mut dyn Inference,
    images: &[DynamicImage],
) -> PipelineResult<Vec<DetectionSet>> {
    let sets = inference.infer(images)?;
    if sets.len() != images.len() {
        return Err(PipelineError::Inference(format!(
            "{} returned {} results for {} images",
            inference.name(),
            sets.len(),
            images.len()
        )));
    }
    Ok(sets)
}

pub fn detector_factory(config: &DetectorConfig) -> InferenceFactory {
    let config = config.clone();
    Box::new(move || -> anyhow::Result<Box<dyn Inference>> {
        match config.kind {
            DetectorKind::Remote => {
                tracing::info!("Using remote detector at {}", config.url);
                let detector = crate::pipeline::remote::RemoteDetector::new(
                    config.url.clone(),
                    REMOTE_INFER_TIMEOUT,
                    config.min_confidence,
                )?;
                Ok(Box::new(detector))
            }
            DetectorKind::Rtdetr => load_rtdetr(&config),
        }
    })
}

#[cfg(feature = "rtdetr")]
fn load_rtdetr(config: &DetectorConfig) -> anyhow::Result<Box<dyn Inference>> {
    tracing::info!("Loading RT-DETR model from {}", config.model_path.display());
    let detector =
        crate::pipeline::rtdetr::RtDetrDetector::new(&config.model_path, config.min_confidence)?;
    Ok(Box::new(detector))
}

#[cfg(not(feature = "rtdetr"))]
fn load_rtdetr(_config: &DetectorConfig) -> anyhow::Result<Box<dyn Inference>> {
    anyhow::bail!("DETECTOR=rtdetr requires a build with the `rtdetr` feature")
}
