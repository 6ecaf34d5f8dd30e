//! Ordered migration plans.
//!
//! A [`MigrationPlan`] is static input: an ordered list of [`MigrationStep`]s
//! whose identifiers are positive and strictly increase and whose structural
//! predecessors always appear earlier in the list. These rules are checked on
//! construction.
//!
//! Steps without postconditions are accepted, but the executor cannot detect
//! ledger divergence for them, so they are logged when the plan is built.

mod step;

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
pub use step::{MigrationStep, Postcondition, StepId};

use crate::{Error, Result, TRACING_TARGET_EXECUTOR};

/// Validated, ordered sequence of migration steps.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    steps: Vec<MigrationStep>,
}

#[derive(Deserialize)]
struct RawPlan {
    steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    /// Creates a plan after checking ordering rules.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPlan`] if an identifier is zero or not
    /// strictly increasing, a predecessor is unknown or declared later, or a
    /// step depends on itself.
    pub fn new(steps: Vec<MigrationStep>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let mut previous: Option<StepId> = None;

        for step in &steps {
            // Zero is the rollback target meaning "revert everything".
            if step.id.get() == 0 {
                return Err(Error::InvalidPlan(format!(
                    "step '{}' has id 0, step ids start at 1",
                    step.description
                )));
            }

            if let Some(prev) = previous
                && step.id <= prev
            {
                return Err(Error::InvalidPlan(format!(
                    "step {} must have an id greater than step {prev}",
                    step.id
                )));
            }

            if step.forward.trim().is_empty() {
                return Err(Error::InvalidPlan(format!(
                    "step {} has an empty forward action",
                    step.id
                )));
            }

            if let Some(missing) = step.after.iter().find(|p| !seen.contains(*p)) {
                let reason = if *missing == step.id {
                    "depends on itself".to_owned()
                } else {
                    format!("depends on step {missing}, which is not declared before it")
                };
                return Err(Error::InvalidPlan(format!("step {} {reason}", step.id)));
            }

            seen.insert(step.id);
            previous = Some(step.id);
        }

        let plan = Self { steps };
        for id in plan.unverified_steps() {
            tracing::warn!(
                target: TRACING_TARGET_EXECUTOR,
                step = %id,
                "Step declares no postconditions, ledger divergence cannot be detected"
            );
        }

        Ok(plan)
    }

    /// Parses a plan from JSON of the form `{ "steps": [...] }`.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawPlan = serde_json::from_str(json)
            .map_err(|e| Error::InvalidPlan(format!("malformed plan document: {e}")))?;
        Self::new(raw.steps)
    }

    /// Reads and parses a JSON plan file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidPlan(format!("failed to read plan {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Returns the steps in declared order.
    #[inline]
    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Looks up a step by identifier.
    pub fn get(&self, id: StepId) -> Option<&MigrationStep> {
        self.steps
            .binary_search_by_key(&id, |step| step.id)
            .ok()
            .map(|index| &self.steps[index])
    }

    /// Returns the steps that declare no postconditions.
    pub fn unverified_steps(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|step| step.postconditions.is_empty())
            .map(|step| step.id)
            .collect()
    }

    /// Returns the number of steps.
    #[inline]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns whether the plan has no steps.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl<'a> IntoIterator for &'a MigrationPlan {
    type IntoIter = std::slice::Iter<'a, MigrationStep>;
    type Item = &'a MigrationStep;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordered_plan() {
        let plan = MigrationPlan::new(vec![
            MigrationStep::new(1, "create", "CREATE TABLE t (id int)"),
            MigrationStep::new(2, "alter", "ALTER TABLE t ADD c int").after(1),
            MigrationStep::new(5, "other", "CREATE TABLE u (id int)"),
        ])
        .unwrap();

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.get(StepId::new(5)).unwrap().description, "other");
        assert!(plan.get(StepId::new(3)).is_none());
    }

    #[test]
    fn rejects_unordered_ids() {
        let err = MigrationPlan::new(vec![
            MigrationStep::new(2, "b", "SELECT 1"),
            MigrationStep::new(1, "a", "SELECT 1"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(_)));

        assert!(
            MigrationPlan::new(vec![
                MigrationStep::new(1, "a", "SELECT 1"),
                MigrationStep::new(1, "b", "SELECT 1"),
            ])
            .is_err()
        );
    }

    #[test]
    fn rejects_step_zero() {
        let err = MigrationPlan::new(vec![MigrationStep::new(0, "zero", "SELECT 1")]).unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(_)));

        let json = r#"{ "steps": [{ "id": 0, "description": "zero", "forward": "SELECT 1" }] }"#;
        assert!(MigrationPlan::from_json(json).is_err());
    }

    #[test]
    fn lists_steps_without_postconditions() {
        let plan = MigrationPlan::new(vec![
            MigrationStep::new(1, "create", "CREATE TABLE t (id int)").expects(Postcondition::table("t")),
            MigrationStep::new(2, "seed", "INSERT INTO t VALUES (1)"),
        ])
        .unwrap();

        assert_eq!(plan.unverified_steps(), vec![StepId::new(2)]);
    }

    #[test]
    fn rejects_forward_references() {
        let err = MigrationPlan::new(vec![
            MigrationStep::new(1, "a", "SELECT 1").after(2),
            MigrationStep::new(2, "b", "SELECT 1"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("not declared before it"));

        let err = MigrationPlan::new(vec![MigrationStep::new(1, "a", "SELECT 1").after(1)])
            .unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
    }

    #[test]
    fn rejects_empty_forward() {
        assert!(MigrationPlan::new(vec![MigrationStep::new(1, "a", "  ")]).is_err());
    }

    #[test]
    fn parses_json_plan() {
        let plan = MigrationPlan::from_json(
            r#"{ "steps": [
                { "id": 1, "description": "documents", "forward": "CREATE TABLE documents ()" },
                { "id": 2, "description": "embedding", "forward": "ALTER TABLE documents ADD embedding vector(3)",
                  "requires": ["vector"], "after": [1] }
            ] }"#,
        )
        .unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan.steps()[1].is_gated());

        assert!(MigrationPlan::from_json("{ not json").is_err());
    }
}
