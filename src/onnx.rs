//! ONNX Runtime backend for [`ModelHandle`].
//!
//! Expects a detector exported with NHWC input `[1, w, h, 3]` and four outputs
//! in declaration order: boxes, scores, classes, valid detection count.

use crate::error::{Result, SentryError};
use crate::model::{DetectionResult, InferenceBackend, ModelHandle};
use ndarray::ArrayView4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::{DynValue, Tensor};
use std::path::{Path, PathBuf};
use tracing::debug;

const DETECTOR_NUM_OUTPUTS: usize = 4;

pub struct OnnxBackend {
    label: String,
    session: Session,
    input_shape: (usize, usize),
    output_names: Vec<String>,
}

fn load_error(label: &str, reason: impl std::fmt::Display) -> SentryError {
    SentryError::ModelLoad {
        label: label.to_string(),
        reason: reason.to_string(),
    }
}

impl OnnxBackend {
    /// Load a detector graph. Dynamic spatial dimensions fall back to
    /// `fallback_size`.
    pub fn load(label: &str, path: &Path, fallback_size: usize) -> Result<Self> {
        if !path.exists() {
            return Err(load_error(label, format!("model file not found: {}", path.display())));
        }

        let builder = Session::builder().map_err(|e| load_error(label, e))?;
        let builder = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_error(label, e))?;
        let session = builder.commit_from_file(path).map_err(|e| load_error(label, e))?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| load_error(label, "model has no inputs"))?;
        let dims: Vec<i64> = input
            .input_type
            .tensor_shape()
            .map(|shape| shape.iter().copied().collect())
            .ok_or_else(|| load_error(label, "first input is not a tensor"))?;
        let input_shape = spatial_dims(&dims, fallback_size)
            .ok_or_else(|| load_error(label, format!("expected 4D NHWC input, got {:?}", dims)))?;

        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if output_names.len() < DETECTOR_NUM_OUTPUTS {
            return Err(load_error(
                label,
                format!(
                    "expected {} outputs, model declares {}",
                    DETECTOR_NUM_OUTPUTS,
                    output_names.len()
                ),
            ));
        }

        debug!(
            model = %label,
            input = ?dims,
            outputs = ?output_names,
            "ONNX session created"
        );

        Ok(Self {
            label: label.to_string(),
            session,
            input_shape,
            output_names,
        })
    }
}

/// `(width, height)` from elements 1 and 2 of a 4D input shape.
fn spatial_dims(dims: &[i64], fallback: usize) -> Option<(usize, usize)> {
    if dims.len() != 4 {
        return None;
    }
    let to_dim = |d: i64| if d > 0 { d as usize } else { fallback };
    Some((to_dim(dims[1]), to_dim(dims[2])))
}

fn extract_f32(value: &DynValue, label: &str) -> Result<Vec<f32>> {
    let (_shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| SentryError::inference(label, e))?;
    Ok(data.to_vec())
}

/// The count tensor is int32 for most exports, but accept int64 and float too.
fn extract_count(value: &DynValue, label: &str) -> Result<usize> {
    if let Ok((_, data)) = value.try_extract_tensor::<i32>() {
        return Ok(clamp_count(data.first().map(|&v| f64::from(v))));
    }
    if let Ok((_, data)) = value.try_extract_tensor::<i64>() {
        return Ok(clamp_count(data.first().map(|&v| v as f64)));
    }
    let (_, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| SentryError::inference(label, format!("unsupported count tensor: {}", e)))?;
    Ok(clamp_count(data.first().map(|&v| f64::from(v))))
}

/// Empty or negative counts mean no detections.
fn clamp_count(first: Option<f64>) -> usize {
    first.unwrap_or(0.0).max(0.0) as usize
}

/// Look up the detector outputs by name, in declaration order.
fn collect_outputs<'a, F>(names: &[String], label: &str, lookup: F) -> Result<Vec<&'a DynValue>>
where
    F: Fn(&str) -> Option<&'a DynValue>,
{
    if names.len() < DETECTOR_NUM_OUTPUTS {
        return Err(SentryError::inference(
            label,
            format!("expected {} outputs, got {}", DETECTOR_NUM_OUTPUTS, names.len()),
        ));
    }
    names
        .iter()
        .take(DETECTOR_NUM_OUTPUTS)
        .map(|name| {
            lookup(name.as_str())
                .ok_or_else(|| SentryError::inference(label, format!("missing output {}", name)))
        })
        .collect()
}

/// Boxes, scores, classes and count, in that order.
fn detection_from_outputs(values: &[&DynValue], label: &str) -> Result<DetectionResult> {
    let boxes = extract_f32(values[0], label)?;
    let scores = extract_f32(values[1], label)?;
    let classes = extract_f32(values[2], label)?;
    let valid = extract_count(values[3], label)?;

    let boxes = boxes
        .chunks_exact(4)
        .map(|b| [b[0], b[1], b[2], b[3]])
        .collect();

    Ok(DetectionResult::new(boxes, scores, classes, valid))
}

impl InferenceBackend for OnnxBackend {
    fn input_shape(&self) -> (usize, usize) {
        self.input_shape
    }

    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<DetectionResult> {
        let label = self.label.as_str();
        let tensor = Tensor::from_array(input.to_owned())
            .map_err(|e| SentryError::inference(label, e))?;

        // `outputs` owns every buffer the runtime allocated for this call; it
        // is dropped when this function returns, on every path.
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| SentryError::inference(label, e))?;

        let values = collect_outputs(&self.output_names, label, |name| outputs.get(name))?;
        detection_from_outputs(&values, label)
    }
}

impl ModelHandle {
    /// Load an ONNX detector from `path` into this handle.
    pub async fn load_onnx(&self, path: &Path, fallback_size: usize) -> Result<()> {
        let label = self.label().to_string();
        let path: PathBuf = path.to_path_buf();
        self.load(move || OnnxBackend::load(&label, &path, fallback_size))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spatial_dims_reads_nhwc_positions() {
        assert_eq!(spatial_dims(&[1, 640, 480, 3], 320), Some((640, 480)));
    }

    #[test]
    fn dynamic_dims_fall_back() {
        assert_eq!(spatial_dims(&[-1, -1, -1, 3], 640), Some((640, 640)));
    }

    #[test]
    fn non_4d_inputs_are_rejected() {
        assert_eq!(spatial_dims(&[1, 3, 640], 640), None);
    }

    fn f32_tensor<const N: usize>(shape: [usize; N], data: Vec<f32>) -> DynValue {
        Tensor::from_array((shape, data)).unwrap().into_dyn()
    }

    #[test]
    fn count_is_clamped() {
        assert_eq!(clamp_count(None), 0);
        assert_eq!(clamp_count(Some(-3.0)), 0);
        assert_eq!(clamp_count(Some(2.0)), 2);
        assert_eq!(clamp_count(Some(1.9)), 1);
    }

    #[test]
    fn count_accepts_integer_and_float_tensors() {
        let int32 = Tensor::from_array(([1usize], vec![3i32])).unwrap().into_dyn();
        let int64 = Tensor::from_array(([1usize], vec![2i64])).unwrap().into_dyn();
        let float = f32_tensor([1], vec![4.0]);
        let negative = Tensor::from_array(([1usize], vec![-1i32])).unwrap().into_dyn();

        assert_eq!(extract_count(&int32, "t").unwrap(), 3);
        assert_eq!(extract_count(&int64, "t").unwrap(), 2);
        assert_eq!(extract_count(&float, "t").unwrap(), 4);
        assert_eq!(extract_count(&negative, "t").unwrap(), 0);
    }

    #[test]
    fn outputs_map_to_detection_result() {
        let boxes = f32_tensor([1, 2, 4], vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8]);
        let scores = f32_tensor([1, 2], vec![0.9, 0.05]);
        let classes = f32_tensor([1, 2], vec![1.0, 0.0]);
        let count = Tensor::from_array(([1usize], vec![1i32])).unwrap().into_dyn();

        let result = detection_from_outputs(&[&boxes, &scores, &classes, &count], "t").unwrap();
        assert_eq!(result.boxes, vec![[0.1, 0.2, 0.3, 0.4], [0.5, 0.6, 0.7, 0.8]]);
        assert_eq!(result.scores, vec![0.9, 0.05]);
        assert_eq!(result.classes, vec![1.0, 0.0]);
        assert_eq!(result.valid_detections, 1);
    }

    #[test]
    fn missing_output_is_an_inference_error() {
        let present = f32_tensor([1], vec![0.0]);
        let names: Vec<String> = ["boxes", "scores", "classes", "count"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let err = collect_outputs(&names, "t", |name| (name != "count").then_some(&present))
            .unwrap_err();
        assert!(matches!(err, SentryError::Inference { .. }));
        assert!(err.to_string().contains("missing output count"));

        let found = collect_outputs(&names, "t", |_| Some(&present)).unwrap();
        assert_eq!(found.len(), 4);

        let err = collect_outputs(&names[..2], "t", |_| Some(&present)).unwrap_err();
        assert!(matches!(err, SentryError::Inference { .. }));
    }

    #[tokio::test]
    async fn missing_model_file_fails_loudly() {
        let handle = ModelHandle::new("weapons");
        let err = handle
            .load_onnx(Path::new("/nonexistent/weapons.onnx"), 640)
            .await
            .unwrap_err();
        assert!(matches!(err, SentryError::ModelLoad { .. }));
        assert!(!handle.is_ready());
    }
}
