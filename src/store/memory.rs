use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use super::{Assignment, AssignmentStore, InsertOutcome};
use crate::{experiment::Timestamp, Error, Result};

type Key = (String, String);

/// Process-local [`AssignmentStore`]. Atomicity comes from a single mutex, so it is only correct
/// for a single replica (tests, demos, embedded use).
#[derive(Default)]
pub struct InMemoryAssignmentStore {
    assignments: Mutex<HashMap<Key, Assignment>>,
}

impl InMemoryAssignmentStore {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        InMemoryAssignmentStore::default()
    }

    /// Number of stored assignments. Still counts rows after a writer panicked.
    pub fn len(&self) -> usize {
        self.assignments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Key, Assignment>>> {
        self.assignments
            .lock()
            .map_err(|_| Error::Storage("assignment map lock poisoned".into()))
    }
}

fn key(test_id: &str, user_id: &str) -> Key {
    (test_id.to_owned(), user_id.to_owned())
}

impl AssignmentStore for InMemoryAssignmentStore {
    fn get_existing(&self, test_id: &str, user_id: &str) -> Result<Option<Assignment>> {
        Ok(self.lock()?.get(&key(test_id, user_id)).cloned())
    }

    fn create_if_absent(&self, candidate: Assignment) -> Result<InsertOutcome> {
        let mut map = self.lock()?;
        let key = key(&candidate.test_id, &candidate.user_id);
        Ok(match map.get(&key) {
            Some(existing) => InsertOutcome::Existing(existing.clone()),
            None => {
                map.insert(key, candidate.clone());
                InsertOutcome::Created(candidate)
            }
        })
    }

    fn replace_if_version(
        &self,
        candidate: Assignment,
        expected_version: u32,
    ) -> Result<InsertOutcome> {
        let mut map = self.lock()?;
        let key = key(&candidate.test_id, &candidate.user_id);
        Ok(match map.get(&key) {
            Some(existing)
                if existing.experiment_version != expected_version
                    || existing.experiment_version >= candidate.experiment_version =>
            {
                InsertOutcome::Existing(existing.clone())
            }
            _ => {
                map.insert(key, candidate.clone());
                InsertOutcome::Created(candidate)
            }
        })
    }

    fn touch(&self, test_id: &str, user_id: &str, at: Timestamp) -> Result<()> {
        if let Some(assignment) = self.lock()?.get_mut(&key(test_id, user_id)) {
            assignment.last_seen_at = Some(at);
        }
        Ok(())
    }
}
