use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use chrono::Utc;

use super::ExperimentSource;
use crate::{
    experiment::{Experiment, ExperimentStatus, TargetingRule, Variant},
    Error, Result,
};

/// In-process experiment definitions with the administrative operations that edit them.
///
/// Structural edits (variants and weights) bump the experiment version; allocation, targeting and
/// lifecycle changes do not. Completed and archived experiments reject edits.
#[derive(Default)]
pub struct InMemoryExperimentSource {
    experiments: RwLock<HashMap<String, Experiment>>,
}

impl InMemoryExperimentSource {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        InMemoryExperimentSource::default()
    }

    /// Store `experiment` as-is (after validation), replacing any definition with the same id.
    /// Intended for seeding from an external source of truth.
    pub fn insert(&self, experiment: Experiment) -> Result<()> {
        experiment.validate()?;
        self.experiments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(experiment.id.clone(), experiment);
        Ok(())
    }

    /// Create a new experiment. It always starts as a `draft` at version 1.
    pub fn create(&self, mut experiment: Experiment) -> Result<Experiment> {
        let now = Utc::now();
        experiment.status = ExperimentStatus::Draft;
        experiment.version = 1;
        experiment.created_at = now;
        experiment.updated_at = now;
        experiment.validate()?;

        let mut experiments = self
            .experiments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if experiments.contains_key(&experiment.id) {
            return Err(Error::InvalidExperiment(format!(
                "experiment {:?} already exists",
                experiment.id
            )));
        }
        experiments.insert(experiment.id.clone(), experiment.clone());
        Ok(experiment)
    }

    #[allow(missing_docs)]
    pub fn get(&self, test_id: &str) -> Option<Experiment> {
        self.experiments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(test_id)
            .cloned()
    }

    /// All experiments, ordered by id.
    pub fn list(&self) -> Vec<Experiment> {
        let mut experiments: Vec<_> = self
            .experiments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        experiments.sort_by(|a, b| a.id.cmp(&b.id));
        experiments
    }

    /// Remove the definition. Later lookups treat the test as unknown, so nobody is assigned.
    pub fn delete(&self, test_id: &str) -> Result<Experiment> {
        self.experiments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(test_id)
            .ok_or_else(|| Error::ExperimentNotFound(test_id.to_owned()))
    }

    /// Replace variants and weights. Bumps the version if anything changed.
    pub fn update_variants(&self, test_id: &str, variants: Vec<Variant>) -> Result<Experiment> {
        self.edit(test_id, |experiment| {
            if experiment.variants != variants {
                experiment.variants = variants;
                experiment.version += 1;
            }
            Ok(())
        })
    }

    #[allow(missing_docs)]
    pub fn set_traffic_allocation(&self, test_id: &str, percent: f64) -> Result<Experiment> {
        self.edit(test_id, |experiment| {
            experiment.traffic_allocation_percent = percent;
            Ok(())
        })
    }

    #[allow(missing_docs)]
    pub fn set_targeting_rules(
        &self,
        test_id: &str,
        rules: Vec<TargetingRule>,
    ) -> Result<Experiment> {
        self.edit(test_id, |experiment| {
            experiment.targeting_rules = rules;
            Ok(())
        })
    }

    #[allow(missing_docs)]
    pub fn set_rebucket_on_version_change(
        &self,
        test_id: &str,
        rebucket: bool,
    ) -> Result<Experiment> {
        self.edit(test_id, |experiment| {
            experiment.rebucket_on_version_change = rebucket;
            Ok(())
        })
    }

    /// Move the experiment through its lifecycle.
    pub fn set_status(&self, test_id: &str, status: ExperimentStatus) -> Result<Experiment> {
        self.modify(test_id, |experiment| {
            if !experiment.status.can_transition_to(status) {
                return Err(Error::InvalidTransition {
                    from: experiment.status,
                    to: status,
                });
            }
            experiment.status = status;
            Ok(())
        })
    }

    /// Apply a structural edit; rejected on read-only experiments.
    fn edit(
        &self,
        test_id: &str,
        f: impl FnOnce(&mut Experiment) -> Result<()>,
    ) -> Result<Experiment> {
        self.modify(test_id, |experiment| {
            if experiment.status.is_read_only() {
                return Err(Error::ExperimentReadOnly(experiment.id.clone()));
            }
            f(experiment)
        })
    }

    /// Apply `f` to a copy, validate, then swap it in. A failed edit leaves the stored definition
    /// untouched.
    fn modify(
        &self,
        test_id: &str,
        f: impl FnOnce(&mut Experiment) -> Result<()>,
    ) -> Result<Experiment> {
        let mut experiments = self
            .experiments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let current = experiments
            .get(test_id)
            .ok_or_else(|| Error::ExperimentNotFound(test_id.to_owned()))?;

        let mut updated = current.clone();
        f(&mut updated)?;
        updated.validate()?;
        updated.updated_at = Utc::now();

        log::debug!(target: "abkit",
                    test_id,
                    version = updated.version,
                    status:debug = updated.status;
                    "experiment updated");
        experiments.insert(test_id.to_owned(), updated.clone());
        Ok(updated)
    }
}

impl ExperimentSource for InMemoryExperimentSource {
    fn fetch(&self, test_id: &str) -> Result<Option<Experiment>> {
        Ok(self.get(test_id))
    }
}
