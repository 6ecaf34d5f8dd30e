//! Migration step model.

use std::collections::BTreeSet;
use std::fmt;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use crate::capability::CapabilityName;

/// Unique, monotonically ordered step identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize, Display, From)]
#[serde(transparent)]
pub struct StepId(u32);

impl StepId {
    /// Creates a step identifier.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the numeric value.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// A cheap existence check proving that a step's effect is present.
///
/// Postconditions must describe objects the step itself creates: they are used
/// both to re-validate applied steps and to detect objects that exist although
/// the ledger says the step never ran.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Postcondition {
    /// A table (or view) with this name is visible on the search path.
    TableExists { table: String },
    /// The table has a column with this name.
    ColumnExists { table: String, column: String },
    /// An index with this name exists.
    IndexExists { index: String },
    /// The table has been converted to a time-partitioned hypertable.
    Hypertable { table: String },
    /// An extension with this name is installed.
    ExtensionActive { name: String },
}

impl Postcondition {
    /// Table existence check.
    pub fn table(table: impl Into<String>) -> Self {
        Self::TableExists {
            table: table.into(),
        }
    }

    /// Column existence check.
    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::ColumnExists {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Index existence check.
    pub fn index(index: impl Into<String>) -> Self {
        Self::IndexExists {
            index: index.into(),
        }
    }

    /// Hypertable conversion check.
    pub fn hypertable(table: impl Into<String>) -> Self {
        Self::Hypertable {
            table: table.into(),
        }
    }
}

impl fmt::Display for Postcondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableExists { table } => write!(f, "table {table} exists"),
            Self::ColumnExists { table, column } => write!(f, "column {table}.{column} exists"),
            Self::IndexExists { index } => write!(f, "index {index} exists"),
            Self::Hypertable { table } => write!(f, "table {table} is a hypertable"),
            Self::ExtensionActive { name } => write!(f, "extension {name} is installed"),
        }
    }
}

/// One ordered, capability-gated schema change.
///
/// The forward action is not assumed to be idempotent: the executor guarantees
/// it runs at most once per database by consulting the ledger under a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStep {
    /// Position of the step in the plan.
    pub id: StepId,
    /// Human-readable description.
    pub description: String,
    /// Forward SQL/DDL.
    pub forward: String,
    /// Reverse SQL/DDL used by rollback.
    #[serde(default)]
    pub reverse: Option<String>,
    /// Capabilities that must be active before the step may run.
    #[serde(default)]
    pub requires: BTreeSet<CapabilityName>,
    /// Earlier steps whose objects this step alters.
    #[serde(default)]
    pub after: BTreeSet<StepId>,
    /// Existence checks proving the step's effect.
    #[serde(default)]
    pub postconditions: Vec<Postcondition>,
    /// Whether action and ledger write share one transaction.
    #[serde(default = "default_atomic")]
    pub atomic: bool,
}

const fn default_atomic() -> bool {
    true
}

impl MigrationStep {
    /// Creates an atomic step without dependencies.
    pub fn new(id: u32, description: impl Into<String>, forward: impl Into<String>) -> Self {
        Self {
            id: StepId::new(id),
            description: description.into(),
            forward: forward.into(),
            reverse: None,
            requires: BTreeSet::new(),
            after: BTreeSet::new(),
            postconditions: Vec::new(),
            atomic: true,
        }
    }

    /// Sets the reverse action.
    pub fn with_reverse(mut self, reverse: impl Into<String>) -> Self {
        self.reverse = Some(reverse.into());
        self
    }

    /// Adds a capability dependency.
    pub fn requires(mut self, capability: impl Into<CapabilityName>) -> Self {
        self.requires.insert(capability.into());
        self
    }

    /// Adds a structural predecessor.
    pub fn after(mut self, step: u32) -> Self {
        self.after.insert(StepId::new(step));
        self
    }

    /// Adds a postcondition.
    pub fn expects(mut self, postcondition: Postcondition) -> Self {
        self.postconditions.push(postcondition);
        self
    }

    /// Marks the step as non-transactional.
    ///
    /// Needed for statements PostgreSQL refuses inside a transaction block,
    /// such as `CREATE INDEX CONCURRENTLY`.
    pub fn non_atomic(mut self) -> Self {
        self.atomic = false;
        self
    }

    /// Returns whether the step is gated on any capability.
    #[inline]
    pub fn is_gated(&self) -> bool {
        !self.requires.is_empty()
    }

    /// Returns whether rollback can reverse this step.
    #[inline]
    pub fn is_reversible(&self) -> bool {
        self.reverse.is_some()
    }
}
