//! Experiment definitions and the read-through cache in front of them.
//!
//! [`ExperimentSource`] is where definitions live (an admin API, a database, a file).
//! [`ExperimentRegistry`] wraps a source with a per-experiment cache that expires after a fixed
//! TTL or on explicit invalidation, so replicas converge on edits within a bounded window without
//! sharing any global state.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, Instant},
};

use crate::{experiment::Experiment, Result};

mod http;
mod memory;

pub use http::{HttpExperimentSource, HttpExperimentSourceConfig};
pub use memory::InMemoryExperimentSource;

/// Backing storage for experiment definitions.
pub trait ExperimentSource: Send + Sync {
    /// Fetch the current definition of `test_id`, or `None` if it does not exist.
    fn fetch(&self, test_id: &str) -> Result<Option<Experiment>>;
}

impl<T: ExperimentSource + ?Sized> ExperimentSource for Arc<T> {
    fn fetch(&self, test_id: &str) -> Result<Option<Experiment>> {
        (**self).fetch(test_id)
    }
}

struct CacheEntry {
    experiment: Option<Arc<Experiment>>,
    fetched_at: Instant,
}

/// Read-through cache of experiment definitions.
///
/// Returned experiments are immutable snapshots: an assignment uses one snapshot throughout, even
/// if the cache is refreshed concurrently.
pub struct ExperimentRegistry {
    source: Box<dyn ExperimentSource>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl ExperimentRegistry {
    /// Create a registry reading through to `source`, caching entries for `ttl`. A zero TTL
    /// disables caching.
    pub fn new(source: impl ExperimentSource + 'static, ttl: Duration) -> ExperimentRegistry {
        ExperimentRegistry {
            source: Box::new(source),
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Get the experiment regardless of its status. The caller decides whether it is usable.
    ///
    /// Definitions that fail [`Experiment::validate`] are treated as missing. If the source fails
    /// and a stale entry exists, the stale entry is served.
    pub fn get_active(&self, test_id: &str) -> Result<Option<Arc<Experiment>>> {
        let now = Instant::now();

        {
            // The cache holds no invariants a panicking writer could break, so a poisoned lock is
            // still usable.
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.get(test_id) {
                if now.duration_since(entry.fetched_at) < self.ttl {
                    return Ok(entry.experiment.clone());
                }
            }
        }

        log::debug!(target: "abkit", test_id; "fetching experiment definition");
        let experiment = match self.source.fetch(test_id) {
            Ok(experiment) => experiment
                .filter(|experiment| match experiment.validate() {
                    Ok(()) => true,
                    Err(err) => {
                        log::warn!(target: "abkit", test_id; "ignoring invalid experiment definition: {err}");
                        false
                    }
                })
                .map(Arc::new),
            Err(err) => {
                let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
                return match cache.get(test_id) {
                    Some(stale) => {
                        log::warn!(target: "abkit", test_id; "serving stale experiment definition: {err}");
                        Ok(stale.experiment.clone())
                    }
                    None => Err(err),
                };
            }
        };

        // Constructing the entry before requesting the lock to minimize lock span.
        let entry = CacheEntry {
            experiment: experiment.clone(),
            fetched_at: now,
        };
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(test_id.to_owned(), entry);

        Ok(experiment)
    }

    /// Drop the cached entry for `test_id`; the next lookup reads through to the source.
    pub fn invalidate(&self, test_id: &str) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(test_id);
    }

    /// Drop every cached entry.
    pub fn invalidate_all(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
