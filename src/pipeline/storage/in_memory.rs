use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{Batch, IsolatedCommit, RejectedRow, StoreConnector, StoreResult, TableSession};
use crate::domain::{Row, Scalar};
use crate::error::StoreError;
use crate::idempotency::checkpoint_key;
use crate::schema::TableSpec;

/// In-memory relational store for development/testing.
///
/// Enforces primary and foreign keys like the SQLite adapter, and can be
/// scripted to fail specific batches or reject specific rows.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    partial_application: bool,
}

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, HashMap<Vec<Scalar>, Row>>,
    checkpoints: HashMap<String, BTreeSet<usize>>,
    /// Errors returned, in order, by the next writes of (table, batch).
    batch_faults: HashMap<(String, usize), VecDeque<StoreError>>,
    connect_faults: VecDeque<StoreError>,
    /// (table, key) pairs the store refuses.
    rejected_keys: HashSet<(String, Vec<Scalar>)>,
    connects: usize,
    open_sessions: usize,
    commits: HashMap<(String, usize), usize>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(StoreState::default())), partial_application: true }
    }

    /// Store without row-by-row application; rejected batches fail whole.
    pub fn without_partial_application(mut self) -> Self {
        self.partial_application = false;
        self
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| StoreError::fatal("in-memory store lock poisoned"))
    }

    /// Make the next writes of `batch_index` in `table` fail with `errors`, one per attempt.
    pub fn fail_batch(&self, table: &str, batch_index: usize, errors: Vec<StoreError>) {
        if let Ok(mut state) = self.state() {
            state.batch_faults.entry((table.to_string(), batch_index)).or_default().extend(errors);
        }
    }

    pub fn fail_connect(&self, errors: Vec<StoreError>) {
        if let Ok(mut state) = self.state() {
            state.connect_faults.extend(errors);
        }
    }

    /// Refuse any row of `table` whose key equals `key`.
    pub fn reject_key(&self, table: &str, key: Vec<Scalar>) {
        if let Ok(mut state) = self.state() {
            state.rejected_keys.insert((table.to_string(), key));
        }
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state().map(|s| s.tables.get(table).map_or(0, HashMap::len)).unwrap_or(0)
    }

    pub fn contains_key(&self, table: &str, key: &[Scalar]) -> bool {
        self.state()
            .map(|s| s.tables.get(table).is_some_and(|rows| rows.contains_key(key)))
            .unwrap_or(false)
    }

    pub fn connects(&self) -> usize {
        self.state().map(|s| s.connects).unwrap_or(0)
    }

    pub fn open_sessions(&self) -> usize {
        self.state().map(|s| s.open_sessions).unwrap_or(0)
    }

    /// How many times batch `batch_index` of `table` was committed.
    pub fn commits_of(&self, table: &str, batch_index: usize) -> usize {
        self.state()
            .map(|s| s.commits.get(&(table.to_string(), batch_index)).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl StoreConnector for InMemoryStore {
    async fn connect(&self, table: &TableSpec) -> StoreResult<Box<dyn TableSession>> {
        let mut state = self.state()?;
        if let Some(err) = state.connect_faults.pop_front() {
            return Err(err);
        }
        state.connects += 1;
        state.open_sessions += 1;
        state.tables.entry(table.table.clone()).or_default();
        debug!(table = %table.table, "Opened in-memory session");

        let fk = table.foreign_key.as_ref().and_then(|fk| {
            let index = table.columns.iter().position(|c| c.name == fk.column)?;
            Some((index, fk.parent_table.clone()))
        });
        Ok(Box::new(InMemorySession {
            store: self.clone(),
            table: table.table.clone(),
            key_indices: table.key_indices(),
            fk,
        }))
    }
}

pub struct InMemorySession {
    store: InMemoryStore,
    table: String,
    key_indices: Vec<usize>,
    /// (column index, parent table)
    fk: Option<(usize, String)>,
}

impl InMemorySession {
    fn key_of(&self, row: &Row) -> Vec<Scalar> {
        self.key_indices.iter().map(|&i| row[i].clone()).collect()
    }

    fn check_row(&self, state: &StoreState, row: &Row) -> Result<Vec<Scalar>, String> {
        let key = self.key_of(row);
        if key.iter().any(Scalar::is_null) {
            return Err(format!("NOT NULL constraint failed: {}", self.table));
        }
        if state.rejected_keys.contains(&(self.table.clone(), key.clone())) {
            return Err(format!("CHECK constraint failed: {}", self.table));
        }
        if let Some((index, parent)) = &self.fk {
            let parent_key = vec![row[*index].clone()];
            let resolved = state.tables.get(parent).is_some_and(|rows| rows.contains_key(&parent_key));
            if !resolved {
                return Err("FOREIGN KEY constraint failed".to_string());
            }
        }
        Ok(key)
    }

    fn take_fault(&self, state: &mut StoreState, batch_index: usize) -> Option<StoreError> {
        state.batch_faults.get_mut(&(self.table.clone(), batch_index)).and_then(VecDeque::pop_front)
    }

    fn confirm(&self, state: &mut StoreState, batch: &Batch) {
        state.checkpoints.entry(checkpoint_key(&self.table, &batch.artifact_digest)).or_default().insert(batch.index);
        *state.commits.entry((self.table.clone(), batch.index)).or_default() += 1;
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if let Ok(mut state) = self.store.state() {
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
    }
}

#[async_trait]
impl TableSession for InMemorySession {
    fn supports_partial_application(&self) -> bool {
        self.store.partial_application
    }

    async fn confirmed_batches(&mut self, artifact_digest: &str) -> StoreResult<BTreeSet<usize>> {
        let state = self.store.state()?;
        Ok(state.checkpoints.get(&checkpoint_key(&self.table, artifact_digest)).cloned().unwrap_or_default())
    }

    async fn write_batch(&mut self, batch: &Batch) -> StoreResult<usize> {
        let store = self.store.clone();
        let mut state = store.state()?;
        if let Some(err) = self.take_fault(&mut state, batch.index) {
            return Err(err);
        }

        // validate everything first so a rejected batch applies nothing
        let mut keyed = Vec::with_capacity(batch.rows.len());
        for (offset, row) in batch.rows.iter().enumerate() {
            let key = self.check_row(&state, row).map_err(|reason| StoreError::rejected(reason, Some(offset)))?;
            keyed.push((key, row.clone()));
        }
        let table = state.tables.entry(self.table.clone()).or_default();
        for (key, row) in keyed {
            table.insert(key, row);
        }
        self.confirm(&mut state, batch);
        Ok(batch.rows.len())
    }

    async fn write_batch_isolating(&mut self, batch: &Batch) -> StoreResult<IsolatedCommit> {
        if !self.store.partial_application {
            return Err(StoreError::fatal("partial application is not supported by this store"));
        }
        let store = self.store.clone();
        let mut state = store.state()?;
        if let Some(err) = self.take_fault(&mut state, batch.index) {
            return Err(err);
        }

        let mut outcome = IsolatedCommit::default();
        for (offset, row) in batch.rows.iter().enumerate() {
            match self.check_row(&state, row) {
                Ok(key) => {
                    state.tables.entry(self.table.clone()).or_default().insert(key, row.clone());
                    outcome.committed += 1;
                }
                Err(reason) => outcome.rejected.push(RejectedRow { batch_index: batch.index, offset, reason }),
            }
        }
        self.confirm(&mut state, batch);
        Ok(outcome)
    }

    async fn row_count(&mut self) -> StoreResult<u64> {
        let state = self.store.state()?;
        Ok(state.tables.get(&self.table).map_or(0, HashMap::len) as u64)
    }
}
