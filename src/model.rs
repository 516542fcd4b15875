//! Detection results and the model handle wrapping one loaded detector.

use crate::error::{Result, SentryError};
use crate::metrics::{self, Timer};
use crate::preprocess;
use ndarray::{Array4, ArrayView4};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Raw output of one detector run.
///
/// The four sequences are parallel; only the first `valid_detections`
/// entries are meaningful, the rest is padding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionResult {
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub classes: Vec<f32>,
    pub valid_detections: usize,
}

impl DetectionResult {
    /// Clamps `valid_detections` to the number of scores.
    pub fn new(
        boxes: Vec<[f32; 4]>,
        scores: Vec<f32>,
        classes: Vec<f32>,
        valid_detections: usize,
    ) -> Self {
        let valid_detections = valid_detections.min(scores.len());
        Self {
            boxes,
            scores,
            classes,
            valid_detections,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_detections(&self) -> bool {
        self.valid_detections > 0
    }

    pub fn valid_scores(&self) -> &[f32] {
        &self.scores[..self.valid_detections.min(self.scores.len())]
    }

    /// First valid index (in model order) whose score, rounded to two
    /// decimals, meets `threshold`.
    pub fn first_at_or_above(&self, threshold: f64) -> Option<(usize, f64)> {
        self.valid_scores()
            .iter()
            .map(|&score| round2(score))
            .enumerate()
            .find(|&(_, score)| score >= threshold)
    }
}

fn round2(score: f32) -> f64 {
    (f64::from(score) * 100.0).round() / 100.0
}

/// Synchronous inference runtime behind a [`ModelHandle`].
///
/// `run` must release every intermediate buffer it allocates before it
/// returns, on success and on error.
pub trait InferenceBackend: Send + 'static {
    /// Expected input `(width, height)`.
    fn input_shape(&self) -> (usize, usize);

    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<DetectionResult>;
}

struct Loaded {
    shape: (usize, usize),
    backend: Arc<Mutex<Box<dyn InferenceBackend>>>,
}

/// One detection model. Starts NotReady, becomes Ready once loaded and
/// warmed up, and is never reloaded afterwards.
pub struct ModelHandle {
    label: String,
    loaded: OnceLock<Loaded>,
}

impl ModelHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            loaded: OnceLock::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_ready(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// `(width, height)` declared by the model; `None` until ready.
    pub fn input_shape(&self) -> Option<(usize, usize)> {
        self.loaded.get().map(|l| l.shape)
    }

    /// Build the backend on the blocking pool, warm it up and mark the
    /// handle ready. Failures are logged and leave the handle NotReady.
    pub async fn load<F, B>(&self, loader: F) -> Result<()>
    where
        F: FnOnce() -> Result<B> + Send + 'static,
        B: InferenceBackend,
    {
        if self.is_ready() {
            debug!(model = %self.label, "Model already loaded");
            return Ok(());
        }

        info!(model = %self.label, "Loading model...");
        let timer = Timer::new();

        let built = tokio::task::spawn_blocking(loader)
            .await
            .map_err(|e| self.load_error(format!("loader panicked: {}", e)))
            .and_then(|r| r);

        let backend = match built {
            Ok(backend) => backend,
            Err(e) => {
                error!(model = %self.label, error = %e, "Unable to load model");
                return Err(match e {
                    SentryError::ModelLoad { .. } => e,
                    other => self.load_error(other.to_string()),
                });
            }
        };

        self.install(backend).await?;
        info!(
            model = %self.label,
            elapsed_ms = timer.elapsed_ms() as u64,
            "Model loaded and initialized"
        );
        Ok(())
    }

    /// Warm up an already-built backend and mark the handle ready.
    pub async fn install<B: InferenceBackend>(&self, backend: B) -> Result<()> {
        let shape = backend.input_shape();
        let backend: Arc<Mutex<Box<dyn InferenceBackend>>> =
            Arc::new(Mutex::new(Box::new(backend)));

        // Pay the one-time initialization cost before real traffic arrives
        let warm_up = Arc::new(preprocess::zeros(shape.0, shape.1));
        if let Err(e) = run_blocking(&self.label, backend.clone(), warm_up).await {
            error!(model = %self.label, error = %e, "Model warm-up failed");
            return Err(self.load_error(format!("warm-up failed: {}", e)));
        }

        if self.loaded.set(Loaded { shape, backend }).is_ok() {
            metrics::MODELS_READY.inc();
        }
        debug!(model = %self.label, width = shape.0, height = shape.1, "Model ready");
        Ok(())
    }

    /// Run one inference. Calls on the same handle are serialized.
    pub async fn execute(&self, input: Arc<Array4<f32>>) -> Result<DetectionResult> {
        let loaded = self
            .loaded
            .get()
            .ok_or_else(|| SentryError::NotReady(self.label.clone()))?;

        run_blocking(&self.label, loaded.backend.clone(), input).await
    }

    fn load_error(&self, reason: String) -> SentryError {
        SentryError::ModelLoad {
            label: self.label.clone(),
            reason,
        }
    }
}

async fn run_blocking(
    label: &str,
    backend: Arc<Mutex<Box<dyn InferenceBackend>>>,
    input: Arc<Array4<f32>>,
) -> Result<DetectionResult> {
    let mut guard = backend.lock_owned().await;
    tokio::task::spawn_blocking(move || guard.run(input.view()))
        .await
        .map_err(|e| SentryError::inference(label, format!("inference task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    impl InferenceBackend for CountingBackend {
        fn input_shape(&self) -> (usize, usize) {
            (8, 8)
        }

        fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<DetectionResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SentryError::inference("counting", "boom"));
            }
            assert_eq!(input.shape()[3], 3);
            Ok(DetectionResult::new(vec![[0.0; 4]], vec![0.9], vec![1.0], 1))
        }
    }

    #[test]
    fn valid_detections_is_clamped() {
        let result = DetectionResult::new(vec![], vec![0.5, 0.2], vec![0.0, 0.0], 7);
        assert_eq!(result.valid_detections, 2);
        assert_eq!(result.valid_scores(), &[0.5, 0.2]);
    }

    #[test]
    fn padding_scores_are_ignored() {
        let result = DetectionResult::new(vec![], vec![0.1, 0.99], vec![0.0, 0.0], 1);
        assert_eq!(result.first_at_or_above(0.34), None);
    }

    #[test]
    fn rounding_happens_before_comparison() {
        let result = DetectionResult::new(vec![], vec![0.336], vec![0.0], 1);
        assert_eq!(result.first_at_or_above(0.34), Some((0, 0.34)));

        let result = DetectionResult::new(vec![], vec![0.334], vec![0.0], 1);
        assert_eq!(result.first_at_or_above(0.34), None);
    }

    #[tokio::test]
    async fn load_warms_up_before_ready() {
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = ModelHandle::new("weapons");
        assert!(!handle.is_ready());
        assert_eq!(handle.input_shape(), None);

        let counter = runs.clone();
        handle
            .load(move || Ok(CountingBackend { runs: counter, fail: false }))
            .await
            .unwrap();

        assert!(handle.is_ready());
        assert_eq!(handle.input_shape(), Some((8, 8)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let result = handle.execute(Arc::new(preprocess::zeros(8, 8))).await.unwrap();
        assert_eq!(result.valid_detections, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_load_leaves_handle_not_ready() {
        let handle = ModelHandle::new("pistols");
        let err = handle
            .load(|| -> Result<CountingBackend> {
                Err(SentryError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "missing")))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SentryError::ModelLoad { .. }));
        assert!(!handle.is_ready());

        let err = handle.execute(Arc::new(preprocess::zeros(8, 8))).await.unwrap_err();
        assert!(matches!(err, SentryError::NotReady(_)));
    }

    #[tokio::test]
    async fn failed_warm_up_leaves_handle_not_ready() {
        let handle = ModelHandle::new("pistols");
        let runs = Arc::new(AtomicUsize::new(0));
        let result = handle.install(CountingBackend { runs, fail: true }).await;
        assert!(matches!(result, Err(SentryError::ModelLoad { .. })));
        assert!(!handle.is_ready());
    }
}
