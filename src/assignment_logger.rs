use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{context::UserContext, experiment::Timestamp, store::Assignment};

/// Emitted once per newly created assignment, for exposure analysis in your data warehouse.
///
/// Returning users who are served their existing assignment do not produce an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct AssignmentEvent {
    pub test_id: String,
    pub variant_id: String,
    pub user_id: String,
    pub session_id: String,
    /// Experiment version the user was bucketed under.
    pub experiment_version: u32,
    pub context_snapshot: UserContext,
    pub timestamp: Timestamp,
    /// Library name and version.
    pub meta_data: HashMap<String, String>,
}

impl AssignmentEvent {
    pub(crate) fn from_assignment(assignment: &Assignment) -> AssignmentEvent {
        AssignmentEvent {
            test_id: assignment.test_id.clone(),
            variant_id: assignment.variant_id.clone(),
            user_id: assignment.user_id.clone(),
            session_id: assignment.session_id.clone(),
            experiment_version: assignment.experiment_version,
            context_snapshot: assignment.context_snapshot.clone(),
            timestamp: assignment.assigned_at,
            meta_data: HashMap::from([
                ("sdkName".to_owned(), env!("CARGO_PKG_NAME").to_owned()),
                ("sdkVersion".to_owned(), env!("CARGO_PKG_VERSION").to_owned()),
            ]),
        }
    }
}

/// Receives [`AssignmentEvent`]s. Called synchronously on the assigning thread, so implementations
/// should hand events off rather than block.
pub trait AssignmentLogger {
    #[allow(missing_docs)]
    fn log_assignment(&self, event: AssignmentEvent);
}

pub(crate) struct NoopAssignmentLogger;
impl AssignmentLogger for NoopAssignmentLogger {
    fn log_assignment(&self, _event: AssignmentEvent) {}
}

impl<T: Fn(AssignmentEvent)> AssignmentLogger for T {
    fn log_assignment(&self, event: AssignmentEvent) {
        self(event);
    }
}
