//! Result cache: an in-flight guard plus persisted per-locator verdicts.
//!
//! The guard lives in memory for the process lifetime. Verdicts go to a sled
//! tree (bincode-encoded `bool`) fronted by a small moka cache, so a locator
//! flagged in an earlier run is still known after a restart.

use crate::error::{Result, SentryError};
use crate::metrics;
use dashmap::DashMap;
use moka::future::Cache as MokaCache;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const VERDICT_TREE: &str = "verdicts";

/// Outcome of [`ResultCache::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Already submitted by this process.
    InFlight,
    /// Verdict persisted by an earlier run.
    Known(bool),
    /// Never seen; the caller should dispatch it.
    New,
}

pub struct ResultCache {
    seen: DashMap<String, ()>,
    db: sled::Db,
    verdicts: sled::Tree,
    hot: MokaCache<String, bool>,
}

impl ResultCache {
    /// Open (or create) the verdict store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(Some(1000))
            .use_compression(true)
            .open()?;
        let cache = Self::from_db(db)?;
        info!(path = ?path, persisted = cache.verdicts.len(), "Verdict cache opened");
        Ok(cache)
    }

    /// In-memory store that is discarded on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let verdicts = db.open_tree(VERDICT_TREE)?;
        Ok(Self {
            seen: DashMap::new(),
            db,
            verdicts,
            hot: MokaCache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(3600))
                .build(),
        })
    }

    /// Whether `id` is in flight or already has a verdict.
    pub async fn has(&self, id: &str) -> Result<bool> {
        Ok(self.seen.contains_key(id) || self.verdict(id).await?.is_some())
    }

    /// Mark `id` seen and report what the cache already knew about it.
    /// The guard is taken before the verdict lookup, so of several concurrent
    /// callers exactly one gets [`Claim::New`] or [`Claim::Known`].
    pub async fn claim(&self, id: &str) -> Result<Claim> {
        if !self.mark_seen(id) {
            metrics::CACHE_HITS.inc();
            return Ok(Claim::InFlight);
        }

        match self.verdict(id).await? {
            Some(flagged) => {
                metrics::CACHE_HITS.inc();
                Ok(Claim::Known(flagged))
            }
            None => {
                metrics::CACHE_MISSES.inc();
                Ok(Claim::New)
            }
        }
    }

    /// Mark `id` as submitted. Returns `false` if it already was.
    pub fn mark_seen(&self, id: &str) -> bool {
        self.seen.insert(id.to_string(), ()).is_none()
    }

    pub fn is_seen(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    /// Persist the verdict for `id`. Setting the same value twice is a no-op.
    pub async fn set_verdict(&self, id: &str, flagged: bool) -> Result<()> {
        self.mark_seen(id);
        if self.verdict(id).await? == Some(flagged) {
            return Ok(());
        }

        let tree = self.verdicts.clone();
        let key = id.to_string();
        tokio::task::spawn_blocking(move || {
            let value = bincode::serialize(&flagged)?;
            tree.insert(key.as_bytes(), value)?;
            Ok::<_, SentryError>(())
        })
        .await
        .map_err(|e| SentryError::Cache(format!("Thread join error: {}", e)))??;

        self.hot.insert(id.to_string(), flagged).await;
        debug!(src = %id, flagged, "Verdict stored");
        Ok(())
    }

    /// Stored verdict for `id`, if any.
    pub async fn verdict(&self, id: &str) -> Result<Option<bool>> {
        if let Some(flagged) = self.hot.get(id) {
            return Ok(Some(flagged));
        }

        let tree = self.verdicts.clone();
        let key = id.to_string();
        let stored = tokio::task::spawn_blocking(move || match tree.get(key.as_bytes())? {
            Some(bytes) => Ok::<_, SentryError>(Some(bincode::deserialize::<bool>(&bytes)?)),
            None => Ok(None),
        })
        .await
        .map_err(|e| SentryError::Cache(format!("Thread join error: {}", e)))??;

        if let Some(flagged) = stored {
            self.hot.insert(id.to_string(), flagged).await;
        }
        Ok(stored)
    }

    /// Number of persisted verdicts.
    pub fn persisted_len(&self) -> usize {
        self.verdicts.len()
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
