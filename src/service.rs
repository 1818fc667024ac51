use std::{sync::Arc, time::Instant};

use chrono::Utc;

use crate::{
    assignment_logger::AssignmentEvent,
    context::UserContext,
    eligibility,
    experiment::Experiment,
    registry::{ExperimentRegistry, ExperimentSource},
    selector,
    store::{Assignment, AssignmentStore, InsertOutcome},
    Error, Result, ServiceConfig,
};

/// Maximum length of `testId`, `userId` and `sessionId`, in bytes.
pub const MAX_ID_LEN: usize = 256;

/// Outcome of an assignment request.
///
/// Everything except [`Decision::Assigned`] folds into "no variant" for callers of
/// [`AssignmentService::assign_variant`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The user is in the experiment. This is the persisted, authoritative assignment.
    Assigned(Assignment),
    /// No experiment with this id exists (or its definition is invalid).
    ConfigNotFound,
    /// The experiment exists but is not running.
    TestNotActive,
    /// The experiment is running but outside its `[startAt, endAt]` window.
    OutsideSchedule,
    /// The user failed a targeting rule.
    NotEligible,
    /// The user's bucket is outside the traffic allocation.
    OutsideAllocation,
}

impl Decision {
    /// The assigned variant, if any.
    pub fn variant_id(&self) -> Option<&str> {
        match self {
            Decision::Assigned(assignment) => Some(&assignment.variant_id),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn into_variant_id(self) -> Option<String> {
        match self {
            Decision::Assigned(assignment) => Some(assignment.variant_id),
            _ => None,
        }
    }
}

/// Assigns users to experiment variants.
///
/// Assignments are deterministic (the same `(testId, userId)` always buckets the same way) and
/// sticky (once persisted, a user keeps their variant). The store, not this service, decides the
/// winner when several requests race to assign the same user, so any number of replicas may share
/// one store.
///
/// In order to create a service instance, first create [`ServiceConfig`].
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use abkit::{Experiment, ExperimentStatus, InMemoryAssignmentStore, InMemoryExperimentSource, ServiceConfig, Variant};
/// let experiments = InMemoryExperimentSource::new();
/// experiments
///     .insert(
///         Experiment::new("homepage-cta", "Homepage CTA", vec![Variant::new("A", 50.0), Variant::new("B", 50.0)])
///             .with_status(ExperimentStatus::Running),
///     )
///     .unwrap();
///
/// let service = ServiceConfig::new().to_service(experiments, Arc::new(InMemoryAssignmentStore::new()));
/// let variant = service.assign_variant("homepage-cta", "user-42", "sess-1", None).unwrap();
/// assert!(variant.is_some());
/// ```
pub struct AssignmentService {
    registry: ExperimentRegistry,
    store: Arc<dyn AssignmentStore>,
    config: ServiceConfig,
}

impl AssignmentService {
    /// Create a new `AssignmentService` using the specified configuration.
    pub fn new(
        config: ServiceConfig,
        source: impl ExperimentSource + 'static,
        store: Arc<dyn AssignmentStore>,
    ) -> AssignmentService {
        AssignmentService {
            registry: ExperimentRegistry::new(source, config.cache_ttl),
            store,
            config,
        }
    }

    /// The experiment cache. Call [`ExperimentRegistry::invalidate`] after editing an experiment
    /// to make the edit visible immediately.
    pub fn registry(&self) -> &ExperimentRegistry {
        &self.registry
    }

    /// Get the variant for the user, or `None` if the test is missing, not running, or the user
    /// is not eligible or outside the traffic allocation.
    ///
    /// `context` is evaluated against the experiment's targeting rules and snapshotted with a new
    /// assignment. `None` means an empty context (which fails any targeting rule).
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if an id is empty, longer than [`MAX_ID_LEN`] bytes, or contains
    ///   NUL.
    /// - [`Error::StorageUnavailable`] if the store stayed unavailable through every retry.
    /// - Other storage and experiment source errors as they occur.
    pub fn assign_variant(
        &self,
        test_id: &str,
        user_id: &str,
        session_id: &str,
        context: Option<UserContext>,
    ) -> Result<Option<String>> {
        self.assign_variant_details(test_id, user_id, session_id, context)
            .map(Decision::into_variant_id)
    }

    /// Same as [`AssignmentService::assign_variant`] but reports why no variant was assigned.
    pub fn assign_variant_details(
        &self,
        test_id: &str,
        user_id: &str,
        session_id: &str,
        context: Option<UserContext>,
    ) -> Result<Decision> {
        let problems = validate_ids(test_id, user_id, session_id);
        if !problems.is_empty() {
            return Err(Error::Validation(problems));
        }

        let started = Instant::now();
        let decision = self
            .decide(test_id, user_id, session_id, context.unwrap_or_default())
            .map_err(|err| {
                log::warn!(target: "abkit",
                           test_id,
                           user_id;
                           "error occurred while assigning a variant: {:?}", err);
                err
            })?;

        log::trace!(target: "abkit",
                    test_id,
                    user_id,
                    variant_id = decision.variant_id(),
                    decision:debug = DecisionKind(&decision),
                    elapsed:debug = started.elapsed();
                    "evaluated assignment");

        Ok(decision)
    }

    /// Run [`AssignmentService::assign_variant`] on tokio's blocking thread pool.
    ///
    /// Dropping the returned future does not cancel the assignment: the store write runs to
    /// completion, so a retried request observes the same sticky outcome.
    ///
    /// # Errors
    ///
    /// Same as [`AssignmentService::assign_variant`], plus [`Error::TaskPanicked`] if the blocking
    /// task panicked or the runtime shut down underneath it.
    pub async fn assign_variant_async(
        self: Arc<Self>,
        test_id: String,
        user_id: String,
        session_id: String,
        context: Option<UserContext>,
    ) -> Result<Option<String>> {
        tokio::task::spawn_blocking(move || {
            self.assign_variant(&test_id, &user_id, &session_id, context)
        })
        .await
        .map_err(|_| Error::TaskPanicked)?
    }

    fn decide(
        &self,
        test_id: &str,
        user_id: &str,
        session_id: &str,
        context: UserContext,
    ) -> Result<Decision> {
        // One snapshot for the whole request, even if the cache refreshes concurrently.
        let Some(experiment) = self.registry.get_active(test_id)? else {
            return Ok(Decision::ConfigNotFound);
        };
        if !experiment.is_running() {
            return Ok(Decision::TestNotActive);
        }
        if !experiment.is_within_schedule(Utc::now()) {
            return Ok(Decision::OutsideSchedule);
        }

        let existing = self
            .config
            .retry_policy
            .run("assignment lookup", || self.store.get_existing(test_id, user_id))?;
        let stale_version = match existing {
            // Rows written under a newer version than our cached snapshot are left alone.
            Some(existing)
                if existing.experiment_version >= experiment.version
                    || !experiment.rebucket_on_version_change =>
            {
                self.touch(&existing);
                return Ok(Decision::Assigned(existing));
            }
            Some(existing) => {
                log::debug!(target: "abkit",
                            test_id,
                            user_id,
                            from = existing.experiment_version,
                            to = experiment.version;
                            "re-bucketing user after experiment version change");
                Some(existing.experiment_version)
            }
            None => None,
        };

        if !eligibility::evaluate(
            &experiment.targeting_rules,
            &context.to_attributes(user_id, session_id),
        ) {
            return Ok(Decision::NotEligible);
        }

        let bucket = self.config.hasher.bucket(test_id, user_id);
        let Some(variant) = selector::select(&experiment, bucket) else {
            return Ok(Decision::OutsideAllocation);
        };

        let candidate = Assignment {
            test_id: test_id.to_owned(),
            user_id: user_id.to_owned(),
            variant_id: variant.variant_id.clone(),
            session_id: session_id.to_owned(),
            experiment_version: experiment.version,
            context_snapshot: context,
            assigned_at: Utc::now(),
            last_seen_at: None,
        };

        let outcome = self.persist(candidate, stale_version)?;
        if let InsertOutcome::Created(assignment) = &outcome {
            self.log_assignment(assignment, &experiment);
        }
        Ok(Decision::Assigned(outcome.into_assignment()))
    }

    /// Write the candidate, retrying transient failures. The returned row may belong to a
    /// concurrent writer that got there first.
    fn persist(&self, candidate: Assignment, stale_version: Option<u32>) -> Result<InsertOutcome> {
        self.config
            .retry_policy
            .run("assignment write", || match stale_version {
                Some(version) => self.store.replace_if_version(candidate.clone(), version),
                None => self.store.create_if_absent(candidate.clone()),
            })
    }

    fn log_assignment(&self, assignment: &Assignment, experiment: &Experiment) {
        let event = AssignmentEvent::from_assignment(assignment);
        log::trace!(target: "abkit",
                    test_id = experiment.id,
                    event:serde;
                    "logging assignment");
        self.config.assignment_logger.log_assignment(event);
    }

    /// Best-effort `lastSeenAt` bookkeeping.
    fn touch(&self, assignment: &Assignment) {
        if !self.config.track_last_seen {
            return;
        }
        if let Err(err) = self
            .store
            .touch(&assignment.test_id, &assignment.user_id, Utc::now())
        {
            log::warn!(target: "abkit",
                       test_id = assignment.test_id,
                       user_id = assignment.user_id;
                       "failed to record last seen time: {err}");
        }
    }
}

/// Check request ids, returning one message per problem.
pub(crate) fn validate_ids(test_id: &str, user_id: &str, session_id: &str) -> Vec<String> {
    [
        ("testId", test_id),
        ("userId", user_id),
        ("sessionId", session_id),
    ]
    .into_iter()
    .filter_map(|(name, value)| {
        if value.is_empty() {
            Some(format!("{name} is required"))
        } else if value.len() > MAX_ID_LEN {
            Some(format!("{name} must be at most {MAX_ID_LEN} bytes"))
        } else if value.contains('\0') {
            Some(format!("{name} must not contain NUL characters"))
        } else {
            None
        }
    })
    .collect()
}

/// Logs the decision without the full assignment row.
struct DecisionKind<'a>(&'a Decision);

impl std::fmt::Debug for DecisionKind<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.0 {
            Decision::Assigned(_) => "Assigned",
            Decision::ConfigNotFound => "ConfigNotFound",
            Decision::TestNotActive => "TestNotActive",
            Decision::OutsideSchedule => "OutsideSchedule",
            Decision::NotEligible => "NotEligible",
            Decision::OutsideAllocation => "OutsideAllocation",
        };
        f.write_str(kind)
    }
}
