//! Batch Loader: streams a transformed artifact into its relational table in
//! fixed-size atomic batches, with bounded retries and resumable checkpoints.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::constants::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_BATCH_SIZE, DEFAULT_MAX_RETRIES, MAX_RETRY_CEILING,
};
use crate::domain::DatasetKind;
use crate::error::{EtlError, Result, StoreError};
use crate::idempotency::artifact_digest;
use crate::metrics::LoadMetrics;
use crate::pipeline::artifact::{ArtifactReader, DecodedBatch};
use crate::pipeline::events::{EventSink, ProgressEvent, Stage, StopHandle};
use crate::pipeline::storage::{Batch, IsolatedCommit, RejectedRow, StoreConnector, TableSession};
use crate::schema::{DatasetSchema, TableSpec};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            max_delay: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        }
    }
}

impl RetryPolicy {
    /// Retries allowed per batch, never above the hard ceiling.
    pub fn retries(&self) -> u32 {
        self.max_retries.min(MAX_RETRY_CEILING)
    }

    /// Delay before retry number `attempt` (0-based): `min(base * 2^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Per-table load state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadState {
    Pending,
    Connecting,
    Inserting { batch: usize },
    Retrying { batch: usize, attempt: u32 },
    Failed,
    Completed,
    /// Stop requested; the batch in flight finished first.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub dataset: DatasetKind,
    pub table: String,
    pub state: LoadState,
    pub inserted: u64,
    /// Rows in batches skipped because they were already confirmed or before the start offset.
    pub skipped: u64,
    /// Rows in batches that could not be committed.
    pub failed: u64,
    pub rejected: Vec<RejectedRow>,
    pub failed_batches: Vec<usize>,
    pub batches_committed: usize,
    pub retries: u64,
    /// Table row count after the load, when the store could be queried.
    pub table_row_count: Option<u64>,
    pub error: Option<String>,
}

impl LoadReport {
    fn new(dataset: DatasetKind, table: &str) -> Self {
        Self {
            dataset,
            table: table.to_string(),
            state: LoadState::Pending,
            inserted: 0,
            skipped: 0,
            failed: 0,
            rejected: Vec::new(),
            failed_batches: Vec::new(),
            batches_committed: 0,
            retries: 0,
            table_row_count: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == LoadState::Completed && self.failed_batches.is_empty()
    }
}

/// Why a batch could not be written.
enum WriteFailure {
    Rejected(StoreError),
    Fatal { source: StoreError, attempts: u32 },
}

pub struct BatchLoader {
    connector: Arc<dyn StoreConnector>,
    sink: Arc<dyn EventSink>,
    policy: RetryPolicy,
    batch_size: usize,
    stop: StopHandle,
}

impl BatchLoader {
    pub fn new(connector: Arc<dyn StoreConnector>, sink: Arc<dyn EventSink>) -> Self {
        Self { connector, sink, policy: RetryPolicy::default(), batch_size: DEFAULT_BATCH_SIZE, stop: StopHandle::new() }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Load `artifact` into the dataset's table, starting no earlier than `start_batch`.
    ///
    /// Errors are returned only when the artifact cannot be opened. Store
    /// failures and read failures partway through end up in the report's
    /// state and error fields; undecodable rows are rejected individually.
    pub async fn load(&self, schema: &DatasetSchema, artifact: &Path, start_batch: usize) -> Result<LoadReport> {
        let spec = schema.table_spec();
        let mut report = LoadReport::new(schema.kind, &spec.table);

        let mut reader = ArtifactReader::open(schema.kind, artifact, spec.columns.clone())?;
        let digest = artifact_digest(artifact)?;

        info!("🔌 Connecting to store for table '{}'", spec.table);
        report.state = LoadState::Connecting;
        let mut session = match self.connect_with_retry(&spec, &mut report).await {
            Ok(session) => session,
            Err(failure) => {
                self.fail(&mut report, 0, failure);
                return Ok(report);
            }
        };

        let confirmed = match session.confirmed_batches(&digest).await {
            Ok(confirmed) => confirmed,
            Err(source) => {
                self.fail(&mut report, 0, WriteFailure::Fatal { source, attempts: 1 });
                return Ok(report);
            }
        };
        if !confirmed.is_empty() || start_batch > 0 {
            info!(
                "⏩ Resuming '{}': {} batch(es) already confirmed, start offset {}",
                spec.table,
                confirmed.len(),
                start_batch
            );
        }

        let mut index = 0usize;
        loop {
            if self.stop.is_stop_requested() {
                warn!("🛑 Stop requested, halting load of '{}' before batch {}", spec.table, index);
                report.state = LoadState::Stopped;
                break;
            }

            if index < start_batch || confirmed.contains(&index) {
                let skipped = match reader.skip(self.batch_size) {
                    Ok(skipped) => skipped,
                    Err(err) => {
                        self.artifact_unreadable(&mut report, index, err);
                        break;
                    }
                };
                if skipped == 0 {
                    break;
                }
                report.skipped += skipped as u64;
                index += 1;
                continue;
            }

            let mut decoded = match reader.read_batch(self.batch_size) {
                Ok(decoded) => decoded,
                Err(err) => {
                    self.artifact_unreadable(&mut report, index, err);
                    break;
                }
            };
            if decoded.is_empty() {
                break;
            }
            report.state = LoadState::Inserting { batch: index };
            self.undecodable(&mut report, index, &decoded.undecodable);
            let batch = Batch { index, artifact_digest: digest.clone(), rows: std::mem::take(&mut decoded.rows) };

            match self.write_with_retry(session.as_mut(), &batch, false, &mut report).await {
                Ok(written) => self.committed(&mut report, &batch, &decoded, written),
                Err(WriteFailure::Rejected(err)) if session.supports_partial_application() => {
                    warn!("⚠️ Batch {} of '{}' rejected ({}), isolating offending rows", index, spec.table, err);
                    match self.write_with_retry(session.as_mut(), &batch, true, &mut report).await {
                        Ok(written) => self.committed(&mut report, &batch, &decoded, written),
                        Err(WriteFailure::Rejected(err)) => self.batch_failed(&mut report, &batch, &decoded, &err),
                        Err(failure) => {
                            self.fail(&mut report, batch.rows.len() as u64, failure);
                            break;
                        }
                    }
                }
                Err(WriteFailure::Rejected(err)) => self.batch_failed(&mut report, &batch, &decoded, &err),
                Err(failure) => {
                    self.fail(&mut report, batch.rows.len() as u64, failure);
                    break;
                }
            }
            index += 1;
        }

        if !matches!(report.state, LoadState::Failed | LoadState::Stopped) {
            report.state = LoadState::Completed;
        }
        report.table_row_count = session.row_count().await.ok();
        drop(session);

        info!(
            "✅ Load of '{}' finished: state={:?} inserted={} skipped={} failed={} rejected={} retries={}",
            report.table,
            report.state,
            report.inserted,
            report.skipped,
            report.failed,
            report.rejected.len(),
            report.retries
        );
        Ok(report)
    }

    async fn connect_with_retry(
        &self,
        spec: &TableSpec,
        report: &mut LoadReport,
    ) -> std::result::Result<Box<dyn TableSession>, WriteFailure> {
        let mut attempt = 0u32;
        loop {
            match self.connector.connect(spec).await {
                Ok(session) => return Ok(session),
                Err(err) if err.is_transient() && attempt < self.policy.retries() => {
                    self.backoff(report, 0, attempt, &err).await;
                    attempt += 1;
                }
                Err(source) => return Err(WriteFailure::Fatal { source, attempts: attempt + 1 }),
            }
        }
    }

    async fn write_with_retry(
        &self,
        session: &mut dyn TableSession,
        batch: &Batch,
        isolating: bool,
        report: &mut LoadReport,
    ) -> std::result::Result<IsolatedCommit, WriteFailure> {
        let mut attempt = 0u32;
        loop {
            let result = if isolating {
                session.write_batch_isolating(batch).await
            } else {
                session.write_batch(batch).await.map(|committed| IsolatedCommit { committed, rejected: Vec::new() })
            };
            match result {
                Ok(written) => return Ok(written),
                Err(err) if err.is_transient() && attempt < self.policy.retries() => {
                    self.backoff(report, batch.index, attempt, &err).await;
                    attempt += 1;
                }
                Err(err @ StoreError::Rejected { .. }) => return Err(WriteFailure::Rejected(err)),
                Err(source) => return Err(WriteFailure::Fatal { source, attempts: attempt + 1 }),
            }
        }
    }

    async fn backoff(&self, report: &mut LoadReport, batch: usize, attempt: u32, err: &StoreError) {
        let delay = self.policy.delay_for(attempt);
        report.retries += 1;
        report.state = LoadState::Retrying { batch, attempt: attempt + 1 };
        LoadMetrics::record_retry(&report.table);
        warn!(
            "🔁 Transient error on '{}' batch {} (retry {}/{} in {:?}): {}",
            report.table,
            batch,
            attempt + 1,
            self.policy.retries(),
            delay,
            err
        );
        tokio::time::sleep(delay).await;
    }

    /// Records the artifact row that could not be decoded; the rest of the batch still goes in.
    fn undecodable(&self, report: &mut LoadReport, batch_index: usize, rows: &[(usize, String)]) {
        if rows.is_empty() {
            return;
        }
        LoadMetrics::record_rejected(&report.table, rows.len() as u64);
        for (offset, reason) in rows {
            warn!("🚫 Row {} of batch {} of '{}' could not be decoded: {}", offset, batch_index, report.table, reason);
            report.rejected.push(RejectedRow { batch_index, offset: *offset, reason: reason.clone() });
        }
        report.failed += rows.len() as u64;
    }

    fn committed(&self, report: &mut LoadReport, batch: &Batch, decoded: &DecodedBatch, written: IsolatedCommit) {
        let committed = written.committed as u64;
        report.inserted += committed;
        report.batches_committed += 1;
        if !written.rejected.is_empty() {
            LoadMetrics::record_rejected(&report.table, written.rejected.len() as u64);
            let rejected = written
                .rejected
                .into_iter()
                .map(|row| RejectedRow { offset: decoded.position_of(row.offset), ..row })
                .collect::<Vec<_>>();
            for row in &rejected {
                warn!("🚫 Row {} of batch {} rejected by '{}': {}", row.offset, row.batch_index, report.table, row.reason);
            }
            report.failed += rejected.len() as u64;
            report.rejected.extend(rejected);
        }
        LoadMetrics::record_batch_committed(&report.table, committed);
        self.sink.emit(&ProgressEvent::new(
            Stage::Load,
            report.dataset,
            batch.index,
            committed,
            report.inserted + report.skipped,
        ));
    }

    /// Batch refused and the store cannot apply it partially: surface it and move on.
    fn batch_failed(&self, report: &mut LoadReport, batch: &Batch, decoded: &DecodedBatch, err: &StoreError) {
        error!("❌ Batch {} of '{}' failed and needs manual inspection: {}", batch.index, report.table, err);
        let offset = match err {
            StoreError::Rejected { row: Some(row), .. } => decoded.position_of(*row),
            _ => 0,
        };
        report.failed += batch.rows.len() as u64;
        report.failed_batches.push(batch.index);
        report.rejected.push(RejectedRow { batch_index: batch.index, offset, reason: err.to_string() });
        LoadMetrics::record_rejected(&report.table, batch.rows.len() as u64);
    }

    /// The artifact stopped being readable partway through; keep what was committed.
    fn artifact_unreadable(&self, report: &mut LoadReport, batch_index: usize, err: EtlError) {
        error!("💥 Reading artifact for '{}' failed at batch {}: {}", report.table, batch_index, err);
        LoadMetrics::record_failed_load(&report.table);
        report.error = Some(format!("artifact read failed at batch {batch_index}: {err}"));
        report.state = LoadState::Failed;
    }

    fn fail(&self, report: &mut LoadReport, rows: u64, failure: WriteFailure) {
        let batch_index = match report.state {
            LoadState::Inserting { batch } | LoadState::Retrying { batch, .. } => batch,
            _ => 0,
        };
        let (source, attempts) = match failure {
            WriteFailure::Fatal { source, attempts } => (source, attempts),
            WriteFailure::Rejected(source) => (source, 1),
        };
        let err = EtlError::FatalLoad { table: report.table.clone(), batch_index, attempts, source };
        error!("💥 {}", err);
        LoadMetrics::record_failed_load(&report.table);
        report.failed += rows;
        if rows > 0 {
            report.failed_batches.push(batch_index);
        }
        report.error = Some(err.to_string());
        report.state = LoadState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Scalar;
    use crate::pipeline::artifact::ArtifactWriter;
    use crate::pipeline::events::MemorySink;
    use crate::pipeline::storage::InMemoryStore;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(4) }
    }

    /// Write `n` listings rows to an artifact and return its path.
    fn listings_artifact(dir: &Path, n: i64) -> std::path::PathBuf {
        let schema = DatasetSchema::for_kind(DatasetKind::Listings);
        let path = dir.join("listings.csv");
        let mut writer = ArtifactWriter::create(&path).unwrap();
        writer.write_header(&schema.header()).unwrap();
        let id = schema.column_index("listing_id").unwrap();
        for i in 1..=n {
            let mut row = vec![Scalar::Null; schema.columns().len()];
            row[id] = Scalar::Int(i);
            writer.write_row(&row).unwrap();
        }
        writer.commit().unwrap();
        path
    }

    fn loader(store: &InMemoryStore, sink: &MemorySink, max_retries: u32) -> BatchLoader {
        BatchLoader::new(Arc::new(store.clone()), Arc::new(sink.clone()))
            .with_policy(fast_policy(max_retries))
            .with_batch_size(1000)
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            max_retries: 50,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(5000),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1600));
        assert_eq!(policy.delay_for(10), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(5000));
        assert_eq!(policy.retries(), MAX_RETRY_CEILING);
    }

    #[tokio::test]
    async fn test_2500_rows_in_three_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = listings_artifact(dir.path(), 2500);
        let store = InMemoryStore::new();
        let sink = MemorySink::new();

        let schema = DatasetSchema::for_kind(DatasetKind::Listings);
        let report = loader(&store, &sink, 3).load(&schema, &path, 0).await.unwrap();

        assert_eq!(report.state, LoadState::Completed);
        assert_eq!(report.inserted, 2500);
        assert_eq!(report.batches_committed, 3);
        assert_eq!(report.table_row_count, Some(2500));

        let events = sink.events();
        let sizes: Vec<u64> = events.iter().map(|e| e.rows_committed).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(events.last().unwrap().cumulative_total, 2500);
        assert!(events.iter().all(|e| e.stage == Stage::Load && e.dataset == DatasetKind::Listings));
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_twice_then_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = listings_artifact(dir.path(), 2500);
        let store = InMemoryStore::new();
        store.fail_batch("listings", 1, vec![StoreError::transient("database is locked"); 2]);
        let sink = MemorySink::new();

        let schema = DatasetSchema::for_kind(DatasetKind::Listings);
        let report = loader(&store, &sink, 3).load(&schema, &path, 0).await.unwrap();

        assert_eq!(report.state, LoadState::Completed);
        assert_eq!(report.inserted, 2500);
        assert_eq!(report.retries, 2);
        assert_eq!(store.row_count("listings"), 2500);
        assert_eq!(store.commits_of("listings", 0), 1);
        assert_eq!(store.commits_of("listings", 1), 1);
        assert_eq!(sink.events().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = listings_artifact(dir.path(), 2500);
        let store = InMemoryStore::new();
        store.fail_batch("listings", 1, vec![StoreError::transient("connection reset"); 3]);
        let sink = MemorySink::new();
        let schema = DatasetSchema::for_kind(DatasetKind::Listings);

        let report = loader(&store, &sink, 2).load(&schema, &path, 0).await.unwrap();
        assert_eq!(report.state, LoadState::Failed);
        assert_eq!(report.inserted, 1000);
        assert_eq!(report.failed_batches, vec![1]);
        assert!(report.error.as_deref().unwrap().contains("failed at batch 1 after 3 attempt(s)"));
        assert_eq!(store.row_count("listings"), 1000);
        assert_eq!(store.open_sessions(), 0);

        let resumed = loader(&store, &sink, 2).load(&schema, &path, 0).await.unwrap();
        assert_eq!(resumed.state, LoadState::Completed);
        assert_eq!(resumed.skipped, 1000);
        assert_eq!(resumed.inserted, 1500);
        assert_eq!(store.row_count("listings"), 2500);
        assert_eq!(store.commits_of("listings", 0), 1);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = listings_artifact(dir.path(), 1200);
        let store = InMemoryStore::new();
        let sink = MemorySink::new();
        let schema = DatasetSchema::for_kind(DatasetKind::Listings);

        loader(&store, &sink, 3).load(&schema, &path, 0).await.unwrap();
        let again = loader(&store, &sink, 3).load(&schema, &path, 0).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.skipped, 1200);
        assert_eq!(store.row_count("listings"), 1200);
    }

    #[tokio::test]
    async fn test_explicit_start_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = listings_artifact(dir.path(), 2500);
        let store = InMemoryStore::new();
        let sink = MemorySink::new();
        let schema = DatasetSchema::for_kind(DatasetKind::Listings);

        let report = loader(&store, &sink, 3).load(&schema, &path, 2).await.unwrap();
        assert_eq!(report.skipped, 2000);
        assert_eq!(report.inserted, 500);
        assert_eq!(sink.events()[0].batch_index, 2);
    }

    #[tokio::test]
    async fn test_rejected_rows_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = listings_artifact(dir.path(), 10);
        let store = InMemoryStore::new();
        store.reject_key("listings", vec![Scalar::Int(4)]);
        let sink = MemorySink::new();
        let schema = DatasetSchema::for_kind(DatasetKind::Listings);

        let report = loader(&store, &sink, 3).load(&schema, &path, 0).await.unwrap();
        assert_eq!(report.state, LoadState::Completed);
        assert_eq!(report.inserted, 9);
        assert_eq!(report.failed, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].offset, 3);
        assert!(report.failed_batches.is_empty());
        assert_eq!(store.row_count("listings"), 9);
    }

    #[tokio::test]
    async fn test_undecodable_row_is_rejected_and_batch_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let schema = DatasetSchema::for_kind(DatasetKind::Listings);
        let path = dir.path().join("listings.csv");
        let id = schema.column_index("listing_id").unwrap();
        let mut text = schema.header().join(",");
        text.push('\n');
        for i in 1..=1500 {
            let mut fields = vec![String::new(); schema.columns().len()];
            fields[id] = if i == 1201 { "abc".to_string() } else { i.to_string() };
            text.push_str(&fields.join(","));
            text.push('\n');
        }
        std::fs::write(&path, text).unwrap();
        let store = InMemoryStore::new();
        store.reject_key("listings", vec![Scalar::Int(1300)]);
        let sink = MemorySink::new();

        let report = loader(&store, &sink, 3).load(&schema, &path, 0).await.unwrap();
        assert_eq!(report.state, LoadState::Completed);
        assert_eq!(report.batches_committed, 2);
        assert_eq!(report.inserted, 1498);
        assert_eq!(report.failed, 2);
        assert!(report.failed_batches.is_empty());
        assert_eq!(store.row_count("listings"), 1498);

        let rejected: Vec<(usize, usize)> = report.rejected.iter().map(|r| (r.batch_index, r.offset)).collect();
        assert_eq!(rejected, vec![(1, 200), (1, 299)]);
        assert!(report.rejected[0].reason.contains("listing_id"));
    }

    #[tokio::test]
    async fn test_rejected_batch_without_partial_application() {
        let dir = tempfile::tempdir().unwrap();
        let path = listings_artifact(dir.path(), 2500);
        let store = InMemoryStore::new().without_partial_application();
        store.reject_key("listings", vec![Scalar::Int(1500)]);
        let sink = MemorySink::new();
        let schema = DatasetSchema::for_kind(DatasetKind::Listings);

        let report = loader(&store, &sink, 3).load(&schema, &path, 0).await.unwrap();
        assert_eq!(report.state, LoadState::Completed);
        assert!(!report.succeeded());
        assert_eq!(report.failed_batches, vec![1]);
        assert_eq!(report.failed, 1000);
        assert_eq!(report.inserted, 1500);
        assert_eq!(store.row_count("listings"), 1500);
    }

    #[tokio::test]
    async fn test_fatal_store_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = listings_artifact(dir.path(), 10);
        let store = InMemoryStore::new();
        store.fail_batch("listings", 0, vec![StoreError::fatal("disk I/O error")]);
        let sink = MemorySink::new();
        let schema = DatasetSchema::for_kind(DatasetKind::Listings);

        let report = loader(&store, &sink, 3).load(&schema, &path, 0).await.unwrap();
        assert_eq!(report.state, LoadState::Failed);
        assert_eq!(report.retries, 0);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_transient_connect_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = listings_artifact(dir.path(), 5);
        let store = InMemoryStore::new();
        store.fail_connect(vec![StoreError::transient("connection refused")]);
        let sink = MemorySink::new();
        let schema = DatasetSchema::for_kind(DatasetKind::Listings);

        let report = loader(&store, &sink, 3).load(&schema, &path, 0).await.unwrap();
        assert_eq!(report.state, LoadState::Completed);
        assert_eq!(report.retries, 1);
        assert_eq!(store.connects(), 1);
    }

    #[tokio::test]
    async fn test_stop_between_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = listings_artifact(dir.path(), 2500);
        let store = InMemoryStore::new();
        let sink = MemorySink::new();
        let stop = StopHandle::new();
        stop.request_stop();
        let schema = DatasetSchema::for_kind(DatasetKind::Listings);

        let report = loader(&store, &sink, 3).with_stop_handle(stop).load(&schema, &path, 0).await.unwrap();
        assert_eq!(report.state, LoadState::Stopped);
        assert_eq!(report.inserted, 0);
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let store = InMemoryStore::new();
        let sink = MemorySink::new();
        let schema = DatasetSchema::for_kind(DatasetKind::Reviews);
        let err = loader(&store, &sink, 3).load(&schema, Path::new("/nonexistent/reviews.csv"), 0).await;
        assert!(matches!(err, Err(EtlError::MissingArtifact { .. })));
        assert_eq!(store.connects(), 0);
    }
}
