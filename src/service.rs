//! Engine side of the message channel: request in, optional response out.

use crate::cascade::{CascadeEngine, PISTOLS_STAGE, WEAPONS_STAGE};
use crate::config::{Config, FetchConfig};
use crate::error::{Result, SentryError};
use crate::fetch::ImageFetcher;
use crate::metrics;
use crate::preprocess;
use crate::protocol::{ImageRequest, ImageResponse};
use crate::retry::retry_with_exponential_backoff;
use image::RgbImage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BASE_DELAY_MS: u64 = 500;

pub struct InferenceService {
    engine: Arc<CascadeEngine>,
    fetcher: ImageFetcher,
    config: FetchConfig,
}

impl InferenceService {
    pub fn new(engine: Arc<CascadeEngine>, config: FetchConfig) -> Result<Self> {
        let fetcher = ImageFetcher::new(&config)?;
        Ok(Self {
            engine,
            fetcher,
            config,
        })
    }

    /// Analyze one image. `None` means safe or not analyzable.
    pub async fn handle(&self, request: ImageRequest) -> Option<ImageResponse> {
        metrics::REQUESTS_RECEIVED.inc();
        let src = request.image_src().to_string();

        let image = match self.load_image(&src).await {
            Ok(image) => image,
            Err(e) => {
                metrics::FETCH_FAILURES.inc();
                warn!(src = %src, error = %e, "Unable to load image");
                return None;
            }
        };

        if !self.engine.verdict(&src, &image).await {
            debug!(src = %src, "Image is safe");
            return None;
        }

        metrics::IMAGES_FLAGGED.inc();
        Some(ImageResponse { src })
    }

    async fn load_image(&self, src: &str) -> Result<RgbImage> {
        let bytes = retry_with_exponential_backoff(
            || self.fetcher.fetch(src),
            FETCH_ATTEMPTS,
            FETCH_BASE_DELAY_MS,
        )
        .await?;

        let owned_src = src.to_string();
        let min_canvas = self.config.min_canvas_size_px;
        tokio::task::spawn_blocking(move || {
            preprocess::decode_image(&owned_src, &bytes, min_canvas)
        })
        .await
        .map_err(|e| SentryError::decode(src, format!("decode task failed: {}", e)))?
    }

    /// Serve requests until the request channel closes. Each request runs
    /// on its own task, so responses can come back out of order.
    pub async fn serve(
        self: Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<ImageRequest>,
        responses: mpsc::UnboundedSender<ImageResponse>,
    ) {
        info!("Inference service listening");
        while let Some(request) = requests.recv().await {
            let service = Arc::clone(&self);
            let responses = responses.clone();
            tokio::spawn(async move {
                if let Some(response) = service.handle(request).await {
                    if responses.send(response).is_err() {
                        warn!("Response channel closed, dropping verdict");
                    }
                }
            });
        }
        info!("Request channel closed, inference service stopping");
    }
}

/// Load both detectors concurrently. A stage that fails stays NotReady;
/// the error is logged and the process keeps running.
pub async fn load_models(engine: &CascadeEngine, config: &Config) {
    let fallback = config.detection.input_size as usize;

    let weapons = async {
        if let Some(handle) = engine.stage(WEAPONS_STAGE) {
            if let Err(e) = handle.load_onnx(&config.models.weapons_path, fallback).await {
                warn!(model = WEAPONS_STAGE, error = %e, "Image detection disabled");
            }
        }
    };
    let pistols = async {
        if let Some(handle) = engine.stage(PISTOLS_STAGE) {
            if let Err(e) = handle.load_onnx(&config.models.pistols_path, fallback).await {
                warn!(model = PISTOLS_STAGE, error = %e, "Image detection disabled");
            }
        }
    };
    futures::join!(weapons, pistols);

    if engine.is_ready() {
        info!("All models ready");
    }
}
