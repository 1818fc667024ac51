//! Deterministic, sticky A/B test variant assignment.
//!
//! # Overview
//!
//! An [`AssignmentService`] decides which variant of an [`Experiment`] a user sees. The decision is
//! a pure function of `(testId, userId)` (see [`Md5BucketHasher`]), gated by the experiment's
//! lifecycle status, schedule, [targeting rules](TargetingRule) and traffic allocation. The first
//! decision is persisted to an [`AssignmentStore`] and every later request returns the persisted
//! row, even after weights change.
//!
//! Experiment definitions come from an [`ExperimentSource`]: [`InMemoryExperimentSource`] doubles
//! as the administrative surface (create, edit, lifecycle transitions), and
//! [`HttpExperimentSource`] reads definitions from a remote admin service. The service caches
//! definitions in an [`ExperimentRegistry`] with a fixed TTL.
//!
//! Assignments are stored in [`SqliteAssignmentStore`] for durable, multi-process use, or in
//! [`InMemoryAssignmentStore`] for tests and single-process deployments. Stores resolve concurrent
//! first requests for the same user with an atomic conditional insert, so every replica returns
//! the same variant.
//!
//! An [`AssignmentLogger`] receives one [`AssignmentEvent`] per newly created assignment,
//! facilitating exposure tracking in your data warehouse.
//!
//! [`handler::handle_assign`] exposes the service over a framework-agnostic JSON request/response
//! contract.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Users who are not eligible, not allocated, or whose test is not running are *not* errors: they
//! receive `Ok(None)`. Errors indicate malformed input ([`Error::Validation`]) or infrastructure
//! failures. Transient storage failures are retried according to the [`RetryPolicy`] before being
//! returned.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! structured key-values under the `abkit` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into assignment decisions.
//!
//! # Examples
//!
//! A runnable example lives in `demos/simple/main.rs`.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod assignment_logger;
mod config;
mod error;
mod retry;
mod service;

pub mod bucket;
pub mod context;
pub mod eligibility;
pub mod experiment;
pub mod handler;
pub mod registry;
pub mod selector;
pub mod store;

pub use assignment_logger::{AssignmentEvent, AssignmentLogger};
pub use bucket::{BucketHasher, Md5BucketHasher};
pub use config::ServiceConfig;
pub use context::{AttributeValue, Attributes, ContextFallback, UserContext};
pub use error::{Error, Result};
pub use experiment::{
    Experiment, ExperimentStatus, RuleOperator, RuleValue, TargetingRule, Timestamp, Value,
    Variant,
};
pub use registry::{
    ExperimentRegistry, ExperimentSource, HttpExperimentSource, HttpExperimentSourceConfig,
    InMemoryExperimentSource,
};
pub use retry::RetryPolicy;
pub use service::{AssignmentService, Decision, MAX_ID_LEN};
pub use store::{
    Assignment, AssignmentStore, InMemoryAssignmentStore, InsertOutcome, SqliteAssignmentStore,
};
