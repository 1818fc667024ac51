//! Durable, race-safe persistence of assignments.
//!
//! The uniqueness of `(testId, userId)` in the store is the single source of truth for which
//! variant a user sees. Services only *propose* a variant; whichever write lands first wins and
//! every concurrent caller adopts the winning row.
use serde::{Deserialize, Serialize};

use crate::{context::UserContext, experiment::Timestamp, Result};

mod memory;
mod sqlite;

pub use memory::InMemoryAssignmentStore;
pub use sqlite::SqliteAssignmentStore;

/// A persisted assignment. `variant_id` is never empty: non-assignments are not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Assignment {
    pub test_id: String,
    pub user_id: String,
    pub variant_id: String,
    /// Session of the request that created the row.
    pub session_id: String,
    /// Experiment version the variant was computed under.
    pub experiment_version: u32,
    /// Context as seen when the assignment was made.
    pub context_snapshot: UserContext,
    pub assigned_at: Timestamp,
    /// Bookkeeping only; never affects which variant is served.
    #[serde(default)]
    pub last_seen_at: Option<Timestamp>,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// This call's candidate was written.
    Created(Assignment),
    /// Another writer got there first; this is the row that won.
    Existing(Assignment),
}

impl InsertOutcome {
    /// The authoritative row, regardless of who wrote it.
    pub fn assignment(&self) -> &Assignment {
        match self {
            InsertOutcome::Created(a) | InsertOutcome::Existing(a) => a,
        }
    }

    #[allow(missing_docs)]
    pub fn into_assignment(self) -> Assignment {
        match self {
            InsertOutcome::Created(a) | InsertOutcome::Existing(a) => a,
        }
    }

    #[allow(missing_docs)]
    pub fn is_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }
}

/// Storage for assignments, safe to share between threads and between service replicas.
///
/// Implementations must make [`create_if_absent`](AssignmentStore::create_if_absent) and
/// [`replace_if_version`](AssignmentStore::replace_if_version) atomic with respect to every other
/// writer of the same `(testId, userId)`, including writers in other processes. Temporary failures
/// (busy database, dropped connection) should be reported as
/// [`Error::StorageUnavailable`](crate::Error::StorageUnavailable) so callers can retry.
pub trait AssignmentStore: Send + Sync {
    /// Look up the assignment for `(test_id, user_id)`.
    fn get_existing(&self, test_id: &str, user_id: &str) -> Result<Option<Assignment>>;

    /// Insert `candidate` unless a row for its `(test_id, user_id)` exists. Returns the row that is
    /// stored after the call.
    fn create_if_absent(&self, candidate: Assignment) -> Result<InsertOutcome>;

    /// Replace the stored row with `candidate` only if it still carries `expected_version` and that
    /// version is older than `candidate.experiment_version`. If no row exists the candidate is
    /// inserted. Used when an experiment re-buckets users after a version change; a row is never
    /// replaced by one from an older or equal version.
    fn replace_if_version(
        &self,
        candidate: Assignment,
        expected_version: u32,
    ) -> Result<InsertOutcome>;

    /// Record that the user was served their assignment again.
    fn touch(&self, test_id: &str, user_id: &str, at: Timestamp) -> Result<()>;
}
