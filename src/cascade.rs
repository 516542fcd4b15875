//! Cascade Inference Engine
//!
//! Runs an ordered list of detectors over one preprocessed tensor and stops at
//! the first stage that reports any valid detection. With the default setup
//! the broad "weapons" model runs first and the narrower "pistols" model only
//! runs when the first one found nothing.

use crate::config::DetectionConfig;
use crate::metrics::{self, Timer};
use crate::model::{DetectionResult, ModelHandle};
use crate::preprocess;
use crate::retry::wait_until_ready;
use image::RgbImage;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const WEAPONS_STAGE: &str = "weapons";
pub const PISTOLS_STAGE: &str = "pistols";

pub struct CascadeEngine {
    stages: Vec<Arc<ModelHandle>>,
    config: DetectionConfig,
}

impl CascadeEngine {
    /// Stages run in the given order.
    pub fn new(config: DetectionConfig, stages: Vec<Arc<ModelHandle>>) -> Self {
        Self { stages, config }
    }

    /// Two-stage weapons → pistols cascade with fresh, unloaded handles.
    pub fn weapons_then_pistols(config: DetectionConfig) -> Self {
        Self::new(
            config,
            vec![
                Arc::new(ModelHandle::new(WEAPONS_STAGE)),
                Arc::new(ModelHandle::new(PISTOLS_STAGE)),
            ],
        )
    }

    pub fn stages(&self) -> &[Arc<ModelHandle>] {
        &self.stages
    }

    pub fn stage(&self, label: &str) -> Option<&Arc<ModelHandle>> {
        self.stages.iter().find(|s| s.label() == label)
    }

    /// Ready only once every stage is ready.
    pub fn is_ready(&self) -> bool {
        !self.stages.is_empty() && self.stages.iter().all(|s| s.is_ready())
    }

    /// Run the cascade for one image.
    ///
    /// While any stage is still loading the call waits `not_ready_retry_ms`
    /// between checks without allocating tensors. Returns `None` when the
    /// wait is exhausted or a stage fails.
    pub async fn analyze(&self, src: &str, image: &RgbImage) -> Option<DetectionResult> {
        if !self.is_ready() {
            debug!(src = %src, "Waiting for models to load...");
        }

        if let Err(e) = wait_until_ready(
            || self.is_ready(),
            "cascade",
            self.config.not_ready_max_attempts,
            self.config.not_ready_retry_ms,
        )
        .await
        {
            warn!(src = %src, error = %e, "Models never became ready, skipping image");
            return None;
        }

        debug!(src = %src, "Predicting...");
        let input = Arc::new(preprocess::preprocess(image, self.config.input_size));

        let mut last = None;
        for stage in &self.stages {
            let label = stage.label();
            let timer = Timer::new();
            metrics::STAGE_RUNS.with_label_values(&[label]).inc();

            let result = match stage.execute(input.clone()).await {
                Ok(result) => result,
                Err(e) => {
                    error!(src = %src, stage = %label, error = %e, "Inference failed");
                    return None;
                }
            };

            timer.observe_stage(label);
            debug!(
                src = %src,
                stage = %label,
                elapsed_ms = %format!("{:.1}", timer.elapsed_ms()),
                valid_detections = result.valid_detections,
                "Stage inference done"
            );

            if result.has_detections() {
                info!(src = %src, stage = %label, "Found a {} candidate", label);
                return Some(result);
            }
            last = Some(result);
        }

        last
    }

    /// Analyze and threshold in one step.
    pub async fn verdict(&self, src: &str, image: &RgbImage) -> bool {
        match self.analyze(src, image).await {
            Some(result) => should_hide(src, &result, self.config.min_score),
            None => false,
        }
    }
}

/// True iff a valid detection's score, rounded to two decimals, reaches
/// `threshold`. The first qualifying index in model order wins.
pub fn should_hide(src: &str, result: &DetectionResult, threshold: f64) -> bool {
    debug!(src = %src, valid_detections = result.valid_detections, "Thresholding result");
    match result.first_at_or_above(threshold) {
        Some((index, score)) => {
            warn!(src = %src, index, score = %format!("{:.2}", score), "Found a pistol or weapon!");
            true
        }
        None => false,
    }
}
