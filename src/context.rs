//! Per-run context shared by every pipeline stage.
//!
//! The original design reached global singletons for worker pools and
//! caches. Here one [`AlignContext`] owns the executor registry, the
//! feature store, the correspondence cache and the progress handle;
//! operations take the context explicitly, and cloning it is cheap so
//! tasks can carry their own handle across threads.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::executor::ExecutorRegistry;
use crate::features::FeatureStore;
use crate::matching::PairCache;
use crate::progress::Progress;

#[derive(Clone, Debug)]
pub struct AlignContext {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    executors: ExecutorRegistry,
    features: FeatureStore,
    matches: PairCache,
    progress: Progress,
}

impl AlignContext {
    pub fn new(features: FeatureStore) -> Self {
        Self::with_progress(features, Progress::new())
    }

    /// Attach an externally owned progress handle, e.g. one a UI polls.
    /// The correspondence cache shares the feature store's disk root.
    pub fn with_progress(features: FeatureStore, progress: Progress) -> Self {
        let matches = PairCache::new(features.root().map(Path::to_path_buf));
        Self {
            inner: Arc::new(Inner {
                executors: ExecutorRegistry::new(),
                features,
                matches,
                progress,
            }),
        }
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.inner.executors
    }

    pub fn feature_store(&self) -> &FeatureStore {
        &self.inner.features
    }

    pub fn match_cache(&self) -> &PairCache {
        &self.inner.matches
    }

    pub fn progress(&self) -> &Progress {
        &self.inner.progress
    }

    /// Cancellation boundary, see [`Progress::checkpoint`].
    #[inline]
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.progress.checkpoint()
    }

    /// Pass a task result through, flipping the cancellation flag on a
    /// real failure so sibling tasks of the same phase stop at their
    /// next checkpoint.
    pub fn cancel_on_error<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if !matches!(e, crate::error::Error::Cancelled) {
                self.inner.progress.cancel();
            }
        }
        result
    }

    /// Drop every reclaimable in-memory cache. Called when a collaborator
    /// reports resource exhaustion; the operation that failed is retried
    /// afterwards.
    pub fn release_caches(&self) {
        self.inner.features.release_memory();
        self.inner.matches.release_memory();
    }

    /// Join all worker pools. Optional; dropping the last context clone
    /// does the same.
    pub fn shutdown(&self) {
        self.inner.executors.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let context = AlignContext::new(FeatureStore::new(None));
        let view = context.clone();
        context.progress().cancel();
        assert!(view.checkpoint().is_err());
    }
}
