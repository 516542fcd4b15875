pub mod cache;
pub mod cascade;
pub mod config;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod model;
pub mod onnx;
pub mod preprocess;
pub mod protocol;
pub mod retry;
pub mod scanner;
pub mod service;

// Re-export commonly used types for easier testing
pub use crate::cache::{Claim, ResultCache};
pub use crate::cascade::{should_hide, CascadeEngine, PISTOLS_STAGE, WEAPONS_STAGE};
pub use crate::config::{Config, DetectionConfig, FetchConfig, ScannerConfig};
pub use crate::error::{Result, SentryError};
pub use crate::model::{DetectionResult, InferenceBackend, ModelHandle};
pub use crate::protocol::{ImageRequest, ImageResponse};
pub use crate::scanner::{Document, ImageCandidate, ScanStats, Scanner};
pub use crate::service::{load_models, InferenceService};
