use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::classes::TrafficClass;
use crate::pipeline::detection::Inference;
use crate::pipeline::types::{BBox, Detection, DetectionSet};
use anyhow::Result;
use image::{DynamicImage, GenericImageView};
use std::path::Path;
use usls::models::RTDETR;
use usls::{Config, Image};

/// In-process RT-DETR detector.
///
/// Corrects for the aspect-ratio padding bug in the underlying model library
/// and keeps only the counted traffic classes.
pub struct RtDetrDetector {
    model: RTDETR,
    min_confidence: f32,
}

impl RtDetrDetector {
    pub fn new(model_path: &Path, min_confidence: f32) -> Result<Self> {
        let model_path = model_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("model path is not valid UTF-8"))?;
        let config = Config::default()
            .with_model_file(model_path)
            .with_class_names(&usls::NAMES_COCO_80)
            .commit()?;
        let model = RTDETR::new(config)?;
        Ok(Self {
            model,
            min_confidence,
        })
    }
}

/// Scale factors that undo the letterbox distortion for a `w`x`h` image.
pub fn aspect_correction(w: f32, h: f32) -> (f32, f32) {
    if w > h {
        (w / h, 1.0)
    } else if h > w {
        (1.0, h / w)
    } else {
        (1.0, 1.0)
    }
}

impl Inference for RtDetrDetector {
    fn infer(&mut self, images: &[DynamicImage]) -> PipelineResult<Vec<DetectionSet>> {
        let mut usls_images = Vec::with_capacity(images.len());
        let mut corrections = Vec::with_capacity(images.len());

        for image in images {
            let (w, h) = image.dimensions();
            corrections.push(aspect_correction(w as f32, h as f32));
            usls_images.push(Image::from(image.clone()));
        }

        let results = self
            .model
            .forward(&usls_images)
            .map_err(|e| PipelineError::Inference(e.to_string()))?;

        let mut sets = Vec::with_capacity(results.len());
        for (y, (x_corr, y_corr)) in results.into_iter().zip(corrections) {
            let detections = y
                .hbbs
                .into_iter()
                .filter(|hbb| hbb.confidence().unwrap_or(0.0) >= self.min_confidence)
                .filter_map(|hbb| {
                    let class = hbb
                        .id()
                        .and_then(TrafficClass::from_coco_id)
                        .or_else(|| hbb.name().and_then(TrafficClass::from_label))?;
                    let x1 = hbb.xmin() * x_corr;
                    let y1 = hbb.ymin() * y_corr;
                    Some(Detection {
                        class,
                        confidence: hbb.confidence().unwrap_or(0.0),
                        bbox: BBox {
                            x1,
                            y1,
                            x2: x1 + hbb.width() * x_corr,
                            y2: y1 + hbb.height() * y_corr,
                        },
                    })
                })
                .collect();
            sets.push(DetectionSet::from_detections(detections));
        }

        Ok(sets)
    }

    fn name(&self) -> &str {
        "rtdetr"
    }
}
