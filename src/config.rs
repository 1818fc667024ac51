use std::{sync::Arc, time::Duration};

use crate::{
    assignment_logger::NoopAssignmentLogger,
    bucket::{BucketHasher, Md5BucketHasher},
    registry::ExperimentSource,
    store::AssignmentStore,
    AssignmentLogger, AssignmentService, RetryPolicy,
};

/// Configuration for [`AssignmentService`].
pub struct ServiceConfig {
    pub(crate) cache_ttl: Duration,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) assignment_logger: Box<dyn AssignmentLogger + Send + Sync>,
    pub(crate) track_last_seen: bool,
    pub(crate) hasher: Box<dyn BucketHasher + Send + Sync>,
}

impl ServiceConfig {
    /// Default value for [`ServiceConfig::cache_ttl`].
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

    /// Create a new `ServiceConfig` using default configuration.
    ///
    /// ```
    /// # use abkit::ServiceConfig;
    /// let config = ServiceConfig::new();
    /// ```
    pub fn new() -> ServiceConfig {
        ServiceConfig::default()
    }

    /// How long experiment definitions are cached before being read again. Edits made by the
    /// admin surface become visible to assignment within this window (or immediately after
    /// [`ExperimentRegistry::invalidate`](crate::ExperimentRegistry::invalidate)).
    ///
    /// Defaults to [`ServiceConfig::DEFAULT_CACHE_TTL`].
    pub fn cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    /// Retry policy for transient storage failures.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set assignment logger to pass newly created assignments to your data warehouse.
    ///
    /// ```
    /// # use abkit::ServiceConfig;
    /// let config = ServiceConfig::new().assignment_logger(|event| {
    ///   println!("{:?}", event);
    /// });
    /// ```
    pub fn assignment_logger(
        mut self,
        assignment_logger: impl AssignmentLogger + Send + Sync + 'static,
    ) -> Self {
        self.assignment_logger = Box::new(assignment_logger);
        self
    }

    /// Record `lastSeenAt` whenever a returning user is served their assignment. Failures to
    /// record are logged and never fail the request. Off by default as it costs a write per
    /// request.
    pub fn track_last_seen(mut self, track_last_seen: bool) -> Self {
        self.track_last_seen = track_last_seen;
        self
    }

    /// Use a different salt for the default MD5 hasher.
    ///
    /// Changing the salt reassigns every user who has no persisted assignment yet. Set it once per
    /// deployment.
    pub fn salt(self, salt: impl Into<String>) -> Self {
        self.hasher(Md5BucketHasher::new(salt))
    }

    /// Replace the bucket hasher.
    pub fn hasher(mut self, hasher: impl BucketHasher + Send + Sync + 'static) -> Self {
        self.hasher = Box::new(hasher);
        self
    }

    /// Create a new [`AssignmentService`] reading experiments from `source` and persisting
    /// assignments to `store`.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use abkit::{InMemoryAssignmentStore, InMemoryExperimentSource, ServiceConfig};
    /// let service = ServiceConfig::new().to_service(
    ///     InMemoryExperimentSource::new(),
    ///     Arc::new(InMemoryAssignmentStore::new()),
    /// );
    /// ```
    pub fn to_service(
        self,
        source: impl ExperimentSource + 'static,
        store: Arc<dyn AssignmentStore>,
    ) -> AssignmentService {
        AssignmentService::new(self, source, store)
    }
}

impl Default for ServiceConfig {
    fn default() -> ServiceConfig {
        ServiceConfig {
            cache_ttl: ServiceConfig::DEFAULT_CACHE_TTL,
            retry_policy: RetryPolicy::default(),
            assignment_logger: Box::new(NoopAssignmentLogger),
            track_last_seen: false,
            hasher: Box::new(Md5BucketHasher::default()),
        }
    }
}
