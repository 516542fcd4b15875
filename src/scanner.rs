//! Document-side scanner.
//!
//! Enumerates the images a [`Document`] currently shows, drops trivial ones,
//! and sends every unseen locator to the inference service exactly once.
//! Flagged responses coming back remove the image and persist the verdict.

use crate::cache::{Claim, ResultCache};
use crate::config::{Config, ScannerConfig};
use crate::error::{Result, SentryError};
use crate::metrics;
use crate::protocol::{ImageRequest, ImageResponse};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// One rendered image as seen by the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    pub src: String,
    pub width: u32,
    pub height: u32,
}

impl ImageCandidate {
    pub fn new(src: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            src: src.into(),
            width,
            height,
        }
    }
}

/// The page the scanner works on.
pub trait Document: Send + Sync {
    fn images(&self) -> Vec<ImageCandidate>;

    /// Remove every image showing `src`.
    fn remove_image(&self, src: &str);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub dispatched: usize,
    pub removed: usize,
    pub skipped: usize,
}

pub struct Scanner {
    cache: Arc<ResultCache>,
    requests: mpsc::UnboundedSender<ImageRequest>,
    min_size: u32,
}

impl Scanner {
    pub fn new(
        config: &ScannerConfig,
        cache: Arc<ResultCache>,
        requests: mpsc::UnboundedSender<ImageRequest>,
    ) -> Self {
        Self {
            cache,
            requests,
            min_size: config.min_image_size_px,
        }
    }

    /// Scanner backed by the persisted verdict store at `config.cache_path`.
    pub fn open(config: &Config, requests: mpsc::UnboundedSender<ImageRequest>) -> Result<Self> {
        let cache = Arc::new(ResultCache::open(&config.cache_path)?);
        Ok(Self::new(&config.scanner, cache, requests))
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    fn is_trivial(&self, candidate: &ImageCandidate) -> bool {
        candidate.src.is_empty()
            || candidate.width < self.min_size
            || candidate.height < self.min_size
    }

    /// One pass over the document.
    pub async fn scan(&self, doc: &dyn Document) -> ScanStats {
        let mut stats = ScanStats::default();

        for candidate in doc.images() {
            if self.is_trivial(&candidate) {
                stats.skipped += 1;
                continue;
            }

            match self.cache.claim(&candidate.src).await {
                Ok(Claim::InFlight) | Ok(Claim::Known(false)) => {
                    stats.skipped += 1;
                    continue;
                }
                Ok(Claim::Known(true)) => {
                    debug!(src = %candidate.src, "Previously flagged, removing");
                    doc.remove_image(&candidate.src);
                    stats.removed += 1;
                    continue;
                }
                Ok(Claim::New) => {}
                Err(e) => {
                    warn!(
                        src = %candidate.src,
                        error = %e,
                        "Verdict lookup failed, dispatching anyway"
                    );
                }
            }

            if let Err(e) = self.dispatch(&candidate) {
                warn!(error = %e, "Image left untouched");
                stats.skipped += 1;
                continue;
            }
            stats.dispatched += 1;
        }

        stats
    }

    fn dispatch(&self, candidate: &ImageCandidate) -> Result<()> {
        self.requests
            .send(ImageRequest::img_find(candidate.src.clone()))
            .map_err(|_| {
                SentryError::Channel(format!(
                    "request receiver dropped, {} not sent",
                    candidate.src
                ))
            })?;
        debug!(
            src = %candidate.src,
            width = candidate.width,
            height = candidate.height,
            "Image dispatched"
        );
        Ok(())
    }

    /// Apply a flagged verdict from the service.
    pub async fn handle_response(&self, response: &ImageResponse, doc: &dyn Document) {
        info!(src = %response.src, "Removing flagged image");
        doc.remove_image(&response.src);
        if let Err(e) = self.cache.set_verdict(&response.src, true).await {
            error!(src = %response.src, error = %e, "Failed to persist verdict");
        }
    }

    /// Rescan on every change notification and apply responses as they
    /// arrive. Returns once the change feed closes; responses still in
    /// flight at that point are abandoned.
    pub async fn run(
        self,
        doc: Arc<dyn Document>,
        mut changes: mpsc::Receiver<()>,
        mut responses: mpsc::UnboundedReceiver<ImageResponse>,
    ) {
        info!("Scanner started");
        self.scan(doc.as_ref()).await;

        let mut responses_open = true;
        loop {
            tokio::select! {
                // Verdicts already delivered are applied before the next rescan
                biased;

                response = responses.recv(), if responses_open => {
                    match response {
                        Some(response) => self.handle_response(&response, doc.as_ref()).await,
                        None => {
                            warn!("Response channel closed");
                            responses_open = false;
                        }
                    }
                }
                change = changes.recv() => {
                    match change {
                        Some(()) => {
                            let stats = self.scan(doc.as_ref()).await;
                            debug!(
                                ?stats,
                                cache_hit_rate = %format!("{:.1}%", metrics::cache_hit_rate()),
                                "Document rescanned"
                            );
                        }
                        None => break,
                    }
                }
            }
        }

        info!("Scanner stopped");
    }
}
