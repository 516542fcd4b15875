#![allow(dead_code)]

use image::{Rgb, RgbImage};
use image_sentry::{DetectionConfig, DetectionResult, InferenceBackend, ModelHandle, Result};
use ndarray::ArrayView4;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Backend that always answers with the same result and records what it saw.
pub struct ScriptedBackend {
    shape: (usize, usize),
    result: DetectionResult,
    runs: Arc<AtomicUsize>,
    shapes: Arc<Mutex<Vec<Vec<usize>>>>,
}

impl InferenceBackend for ScriptedBackend {
    fn input_shape(&self) -> (usize, usize) {
        self.shape
    }

    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<DetectionResult> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.shapes.lock().unwrap().push(input.shape().to_vec());
        Ok(self.result.clone())
    }
}

/// Observes a [`ScriptedBackend`] after it has been moved into a handle.
#[derive(Clone, Default)]
pub struct CallLog {
    pub runs: Arc<AtomicUsize>,
    pub shapes: Arc<Mutex<Vec<Vec<usize>>>>,
}

impl CallLog {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_shape(&self) -> Option<Vec<usize>> {
        self.shapes.lock().unwrap().last().cloned()
    }

    fn reset(&self) {
        self.runs.store(0, Ordering::SeqCst);
        self.shapes.lock().unwrap().clear();
    }
}

pub fn scripted(size: usize, result: DetectionResult) -> (ScriptedBackend, CallLog) {
    let calls = CallLog::default();
    let backend = ScriptedBackend {
        shape: (size, size),
        result,
        runs: calls.runs.clone(),
        shapes: calls.shapes.clone(),
    };
    (backend, calls)
}

/// Loaded handle whose call log ignores the warm-up run.
pub async fn ready_handle(
    label: &str,
    size: usize,
    result: DetectionResult,
) -> (Arc<ModelHandle>, CallLog) {
    let handle = Arc::new(ModelHandle::new(label));
    let (backend, calls) = scripted(size, result);
    handle.install(backend).await.unwrap();
    calls.reset();
    (handle, calls)
}

pub fn detections(scores: &[f32], valid: usize) -> DetectionResult {
    DetectionResult::new(
        vec![[0.1, 0.1, 0.5, 0.5]; scores.len()],
        scores.to_vec(),
        vec![0.0; scores.len()],
        valid,
    )
}

pub fn nothing() -> DetectionResult {
    detections(&[0.0, 0.0], 0)
}

/// Small model input keeps the tests fast.
pub fn detection_config(input_size: u32) -> DetectionConfig {
    DetectionConfig {
        input_size,
        ..DetectionConfig::default()
    }
}

pub fn solid_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([120, 80, 40]))
}

pub fn png_data_uri(width: u32, height: u32) -> String {
    use base64::Engine;

    let mut out = Cursor::new(Vec::new());
    solid_image(width, height)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(out.into_inner())
    )
}
