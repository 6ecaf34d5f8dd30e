//! In-memory database double for tests.
//!
//! [`MemoryDatabase`] models the parts of a PostgreSQL server the orchestrator
//! touches: installable and installed extensions, schema objects described by
//! [`Postcondition`]s, the applied-state ledger and session-scoped advisory
//! locks. Every [`MemoryConnection`] obtained from the same database shares its
//! state, so several connections emulate concurrent processes.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use jiff::Timestamp;
use semver::Version;

use crate::capability::{Capability, CapabilityName, CapabilitySet};
use crate::plan::{MigrationStep, Postcondition, StepId};
use crate::store::{CapabilityStore, LedgerEntry, LedgerStore};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct MemoryState {
    available: BTreeMap<CapabilityName, Version>,
    installed: BTreeMap<CapabilityName, Version>,
    denied: BTreeMap<CapabilityName, String>,
    objects: HashSet<Postcondition>,
    ledger_created: bool,
    ledger: BTreeMap<StepId, LedgerEntry>,
    locks: BTreeMap<StepId, usize>,
    failing: BTreeMap<StepId, String>,
    forward_runs: BTreeMap<StepId, usize>,
    activations: usize,
    offline: bool,
    corrupt_probe: bool,
    apply_delay: Option<Duration>,
    failing_unlock: bool,
}

/// Shared in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
    sessions: Arc<AtomicUsize>,
}

/// A session on a [`MemoryDatabase`].
///
/// Advisory locks belong to the session and are released when it is dropped.
#[derive(Debug)]
pub struct MemoryConnection {
    session: usize,
    database: MemoryDatabase,
}

impl MemoryDatabase {
    /// Creates an empty database with no extensions available.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes an extension installable with the given version.
    pub fn with_available(self, name: impl Into<CapabilityName>, version: Version) -> Self {
        self.state().available.insert(name.into(), version);
        self
    }

    /// Installs an extension up front.
    pub fn with_installed(self, name: impl Into<CapabilityName>, version: Version) -> Self {
        self.state().installed.insert(name.into(), version);
        self
    }

    /// Makes activation of an extension fail with the given reason.
    pub fn with_denied(self, name: impl Into<CapabilityName>, reason: impl Into<String>) -> Self {
        self.state().denied.insert(name.into(), reason.into());
        self
    }

    /// Makes the forward action of a step fail.
    pub fn with_failing_step(self, step: u32, message: impl Into<String>) -> Self {
        self.state().failing.insert(StepId::new(step), message.into());
        self
    }

    /// Delays every forward action while the step lock is held.
    pub fn with_apply_delay(self, delay: Duration) -> Self {
        self.state().apply_delay = Some(delay);
        self
    }

    /// Makes releasing a step lock fail as if the session dropped.
    pub fn with_failing_unlock(self) -> Self {
        self.state().failing_unlock = true;
        self
    }

    /// Opens a new session.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            session: self.sessions.fetch_add(1, Ordering::Relaxed) + 1,
            database: self.clone(),
        }
    }

    /// Makes every query fail as if the server went away.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Makes probes return rows that cannot be decoded.
    pub fn set_corrupt_probe(&self, corrupt: bool) {
        self.state().corrupt_probe = corrupt;
    }

    /// Creates a schema object outside of any migration.
    pub fn create_object(&self, object: Postcondition) {
        self.state().objects.insert(object);
    }

    /// Drops a schema object outside of any migration.
    pub fn drop_object(&self, object: &Postcondition) {
        self.state().objects.remove(object);
    }

    /// Uninstalls an extension outside of the orchestrator.
    pub fn uninstall(&self, name: &CapabilityName) {
        self.state().installed.remove(name);
    }

    /// Returns whether the object exists.
    pub fn holds(&self, object: &Postcondition) -> bool {
        let state = self.state();
        evaluate(&state, object)
    }

    /// Returns the recorded step ids in ascending order.
    pub fn ledger(&self) -> Vec<StepId> {
        self.state().ledger.keys().copied().collect()
    }

    /// Returns how often the forward action of a step ran.
    pub fn forward_runs(&self, step: u32) -> usize {
        self.state()
            .forward_runs
            .get(&StepId::new(step))
            .copied()
            .unwrap_or_default()
    }

    /// Returns how many activations actually installed an extension.
    pub fn activations(&self) -> usize {
        self.state().activations
    }

    /// Returns whether any session holds the lock of a step.
    pub fn is_locked(&self, step: u32) -> bool {
        self.state().locks.contains_key(&StepId::new(step))
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryConnection {
    /// Returns the database this session belongs to.
    pub fn database(&self) -> &MemoryDatabase {
        &self.database
    }

    fn online(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let state = self.database.state();
        if state.offline {
            return Err(Error::connectivity_msg("connection refused"));
        }
        Ok(state)
    }

    fn installed_capability(state: &MemoryState, name: &CapabilityName) -> Option<Capability> {
        state
            .installed
            .get(name)
            .map(|version| Capability::active(name.clone(), version.clone()))
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let session = self.session;
        self.database
            .state()
            .locks
            .retain(|_, owner| *owner != session);
    }
}

fn evaluate(state: &MemoryState, postcondition: &Postcondition) -> bool {
    match postcondition {
        Postcondition::ExtensionActive { name } => {
            state.installed.contains_key(&CapabilityName::new(name))
        }
        other => state.objects.contains(other),
    }
}

impl CapabilityStore for MemoryConnection {
    async fn probe_capabilities(&mut self) -> Result<CapabilitySet> {
        let state = self.online()?;
        if state.corrupt_probe {
            return Err(Error::ProbeParse("unexpected column type for extversion".into()));
        }

        Ok(state
            .installed
            .iter()
            .map(|(name, version)| Capability::active(name.clone(), version.clone()))
            .collect())
    }

    async fn probe_capability(&mut self, name: &CapabilityName) -> Result<Option<Capability>> {
        let state = self.online()?;
        if state.corrupt_probe {
            return Err(Error::ProbeParse("unexpected column type for extversion".into()));
        }
        Ok(Self::installed_capability(&state, name))
    }

    async fn activate_capability(&mut self, name: &CapabilityName) -> Result<()> {
        let mut state = self.online()?;
        if state.installed.contains_key(name) {
            return Ok(());
        }

        if let Some(reason) = state.denied.get(name) {
            return Err(Error::ActivationDenied {
                capability: name.clone(),
                reason: reason.clone(),
            });
        }

        let Some(version) = state.available.get(name).cloned() else {
            return Err(Error::ActivationDenied {
                capability: name.clone(),
                reason: format!("extension \"{name}\" is not available"),
            });
        };

        state.installed.insert(name.clone(), version);
        state.activations += 1;
        Ok(())
    }

    async fn upgrade_capability(&mut self, name: &CapabilityName) -> Result<()> {
        let mut state = self.online()?;
        if !state.installed.contains_key(name) {
            return Err(Error::ActivationDenied {
                capability: name.clone(),
                reason: format!("extension \"{name}\" does not exist"),
            });
        }

        if let Some(version) = state.available.get(name).cloned() {
            state.installed.insert(name.clone(), version);
        }
        Ok(())
    }
}

impl LedgerStore for MemoryConnection {
    async fn ensure_ledger(&mut self) -> Result<()> {
        self.online()?.ledger_created = true;
        Ok(())
    }

    async fn ledger_entries(&mut self) -> Result<Vec<LedgerEntry>> {
        let state = self.online()?;
        Ok(state.ledger.values().cloned().collect())
    }

    async fn is_recorded(&mut self, step: StepId) -> Result<bool> {
        Ok(self.online()?.ledger.contains_key(&step))
    }

    async fn try_lock_step(&mut self, step: StepId) -> Result<bool> {
        let session = self.session;
        let mut state = self.online()?;
        let owner = *state.locks.entry(step).or_insert(session);
        Ok(owner == session)
    }

    async fn unlock_step(&mut self, step: StepId) -> Result<()> {
        let session = self.session;
        let mut state = self.online()?;
        if state.failing_unlock {
            return Err(Error::connectivity_msg("server closed the connection unexpectedly"));
        }
        if state.locks.get(&step) == Some(&session) {
            state.locks.remove(&step);
        }
        Ok(())
    }

    async fn check_postcondition(&mut self, postcondition: &Postcondition) -> Result<bool> {
        let state = self.online()?;
        Ok(evaluate(&state, postcondition))
    }

    async fn apply_step(&mut self, step: &MigrationStep) -> Result<()> {
        let delay = self.online()?.apply_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.online()?;
        if !state.ledger_created {
            return Err(Error::StepFailed {
                step: step.id,
                message: "relation \"pgforge_ledger\" does not exist".into(),
            });
        }

        *state.forward_runs.entry(step.id).or_default() += 1;
        if let Some(message) = state.failing.get(&step.id).cloned() {
            return Err(Error::StepFailed {
                step: step.id,
                message,
            });
        }

        let created: Vec<_> = step
            .postconditions
            .iter()
            .filter(|p| !matches!(p, Postcondition::ExtensionActive { .. }))
            .cloned()
            .collect();
        state.objects.extend(created);
        state.ledger.insert(step.id, LedgerEntry {
            step_id: step.id,
            description: step.description.clone(),
            applied_at: Timestamp::now(),
        });
        Ok(())
    }

    async fn revert_step(&mut self, step: &MigrationStep) -> Result<()> {
        let mut state = self.online()?;
        if step.reverse.is_none() {
            return Err(Error::Irreversible { step: step.id });
        }

        for postcondition in &step.postconditions {
            state.objects.remove(postcondition);
        }
        state.ledger.remove(&step.id);
        Ok(())
    }
}
