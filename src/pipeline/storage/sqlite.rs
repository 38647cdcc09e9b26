use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, Transaction};
use tracing::debug;

use super::{Batch, IsolatedCommit, RejectedRow, StoreConnector, StoreResult, TableSession};
use crate::constants::{CHECKPOINT_TABLE, DEFAULT_BUSY_TIMEOUT_MS};
use crate::domain::DatasetKind;
use crate::error::StoreError;
use crate::schema::{DatasetSchema, TableSpec};

/// Opens SQLite connections to the warehouse file.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnector {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf(), busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS) }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Open a connection and make sure the warehouse tables exist.
    pub fn open(&self) -> StoreResult<Connection> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::fatal(format!("cannot create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(&warehouse_ddl())?;
        Ok(conn)
    }
}

/// DDL for every warehouse table plus the checkpoint table. Parents come first.
pub fn warehouse_ddl() -> String {
    let mut statements: Vec<String> =
        DatasetKind::ALL.iter().map(|kind| DatasetSchema::for_kind(*kind).table_spec().create_sql()).collect();
    statements.push(format!(
        r#"CREATE TABLE IF NOT EXISTS {CHECKPOINT_TABLE} (
    table_name      TEXT NOT NULL,
    artifact_digest TEXT NOT NULL,
    batch_index     INTEGER NOT NULL,
    rows_committed  INTEGER NOT NULL,
    committed_at    TEXT NOT NULL,
    PRIMARY KEY (table_name, artifact_digest, batch_index)
)"#
    ));
    let mut ddl = statements.join(";\n");
    ddl.push(';');
    ddl
}

/// Run blocking SQLite work off the async workers.
async fn blocking<T, F>(work: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::fatal(format!("sqlite task failed: {e}")))?
}

#[async_trait]
impl StoreConnector for SqliteConnector {
    async fn connect(&self, table: &TableSpec) -> StoreResult<Box<dyn TableSession>> {
        let connector = self.clone();
        let conn = blocking(move || connector.open()).await?;
        debug!(table = %table.table, path = %self.path.display(), "Opened SQLite session");
        Ok(Box::new(SqliteSession {
            conn: Arc::new(Mutex::new(conn)),
            upsert: table.upsert_sql(),
            table: table.table.clone(),
        }))
    }
}

/// One warehouse connection. Every call runs on the blocking pool, so busy
/// waits never stall the runtime.
pub struct SqliteSession {
    conn: Arc<Mutex<Connection>>,
    table: String,
    upsert: String,
}

impl SqliteSession {
    async fn with_conn<T, F>(&self, work: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::fatal("sqlite connection lock poisoned"))?;
            work(&mut conn)
        })
        .await
    }
}

fn record_checkpoint(tx: &Transaction<'_>, table: &str, batch: &Batch, rows: usize) -> StoreResult<()> {
    tx.execute(
        &format!(
            "INSERT INTO {CHECKPOINT_TABLE} (table_name, artifact_digest, batch_index, rows_committed, committed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(table_name, artifact_digest, batch_index) DO UPDATE SET
                rows_committed=excluded.rows_committed, committed_at=excluded.committed_at"
        ),
        params![table, batch.artifact_digest, batch.index as i64, rows as i64, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn at_row(err: StoreError, offset: usize) -> StoreError {
    match err {
        StoreError::Rejected { message, .. } => StoreError::rejected(message, Some(offset)),
        other => other,
    }
}

#[async_trait]
impl TableSession for SqliteSession {
    fn supports_partial_application(&self) -> bool {
        true
    }

    async fn confirmed_batches(&mut self, artifact_digest: &str) -> StoreResult<BTreeSet<usize>> {
        let table = self.table.clone();
        let digest = artifact_digest.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT batch_index FROM {CHECKPOINT_TABLE} WHERE table_name = ?1 AND artifact_digest = ?2"
            ))?;
            let rows = stmt.query_map(params![table, digest], |row| row.get::<_, i64>(0))?;
            let mut confirmed = BTreeSet::new();
            for index in rows {
                confirmed.insert(index? as usize);
            }
            Ok(confirmed)
        })
        .await
    }

    async fn write_batch(&mut self, batch: &Batch) -> StoreResult<usize> {
        let (table, upsert, batch) = (self.table.clone(), self.upsert.clone(), batch.clone());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&upsert)?;
                for (offset, row) in batch.rows.iter().enumerate() {
                    stmt.execute(params_from_iter(row.iter())).map_err(|e| at_row(e.into(), offset))?;
                }
            }
            record_checkpoint(&tx, &table, &batch, batch.rows.len())?;
            tx.commit()?;
            Ok(batch.rows.len())
        })
        .await
    }

    async fn write_batch_isolating(&mut self, batch: &Batch) -> StoreResult<IsolatedCommit> {
        let (table, upsert, batch) = (self.table.clone(), self.upsert.clone(), batch.clone());
        self.with_conn(move |conn| {
            let mut tx = conn.transaction()?;
            let mut outcome = IsolatedCommit::default();
            for (offset, row) in batch.rows.iter().enumerate() {
                let sp = tx.savepoint()?;
                let result = sp.prepare_cached(&upsert).and_then(|mut stmt| stmt.execute(params_from_iter(row.iter())));
                match result {
                    Ok(_) => {
                        sp.commit()?;
                        outcome.committed += 1;
                    }
                    // savepoint rolls back on drop
                    Err(e) => match StoreError::from(e) {
                        StoreError::Rejected { message, .. } => {
                            outcome.rejected.push(RejectedRow { batch_index: batch.index, offset, reason: message });
                        }
                        other => return Err(other),
                    },
                }
            }
            record_checkpoint(&tx, &table, &batch, outcome.committed)?;
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn row_count(&mut self) -> StoreResult<u64> {
        let table = self.table.clone();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Scalar;
    use std::time::Instant;

    fn listing_row(schema: &DatasetSchema, id: i64) -> Vec<Scalar> {
        let mut row = vec![Scalar::Null; schema.columns().len()];
        row[schema.column_index("listing_id").unwrap()] = Scalar::Int(id);
        row[schema.column_index("name").unwrap()] = Scalar::Text(format!("Listing {id}"));
        row
    }

    fn review_row(schema: &DatasetSchema, id: i64, listing_id: i64) -> Vec<Scalar> {
        let mut row = vec![Scalar::Null; schema.columns().len()];
        row[schema.column_index("review_id").unwrap()] = Scalar::Int(id);
        row[schema.column_index("listing_id").unwrap()] = Scalar::Int(listing_id);
        row
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_checkpointed() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SqliteConnector::new(dir.path().join("warehouse.db"));
        let schema = DatasetSchema::for_kind(DatasetKind::Listings);
        let mut session = connector.connect(&schema.table_spec()).await.unwrap();

        let batch = Batch {
            index: 0,
            artifact_digest: "abc".to_string(),
            rows: vec![listing_row(&schema, 1), listing_row(&schema, 2)],
        };
        assert_eq!(session.write_batch(&batch).await.unwrap(), 2);
        assert_eq!(session.write_batch(&batch).await.unwrap(), 2);

        assert_eq!(session.row_count().await.unwrap(), 2);
        assert_eq!(session.confirmed_batches("abc").await.unwrap(), BTreeSet::from([0]));
        assert!(session.confirmed_batches("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_key_violation_rolls_back_batch() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SqliteConnector::new(dir.path().join("warehouse.db"));
        let listings = DatasetSchema::for_kind(DatasetKind::Listings);
        let reviews = DatasetSchema::for_kind(DatasetKind::Reviews);

        let mut session = connector.connect(&listings.table_spec()).await.unwrap();
        let batch = Batch { index: 0, artifact_digest: "l".into(), rows: vec![listing_row(&listings, 1)] };
        session.write_batch(&batch).await.unwrap();
        drop(session);

        let mut session = connector.connect(&reviews.table_spec()).await.unwrap();
        let batch = Batch {
            index: 0,
            artifact_digest: "r".into(),
            rows: vec![review_row(&reviews, 10, 1), review_row(&reviews, 11, 99), review_row(&reviews, 12, 1)],
        };
        let err = session.write_batch(&batch).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected { row: Some(1), .. }));
        assert_eq!(session.row_count().await.unwrap(), 0);
        assert!(session.confirmed_batches("r").await.unwrap().is_empty());

        let outcome = session.write_batch_isolating(&batch).await.unwrap();
        assert_eq!(outcome.committed, 2);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].offset, 1);
        assert_eq!(session.row_count().await.unwrap(), 2);
        assert_eq!(session.confirmed_batches("r").await.unwrap(), BTreeSet::from([0]));
    }

    #[tokio::test]
    async fn test_busy_wait_does_not_stall_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let connector =
            SqliteConnector::new(dir.path().join("warehouse.db")).with_busy_timeout(Duration::from_millis(300));
        let schema = DatasetSchema::for_kind(DatasetKind::Listings);
        let mut session = connector.connect(&schema.table_spec()).await.unwrap();

        let writer = connector.open().unwrap();
        writer.execute_batch("BEGIN IMMEDIATE").unwrap();

        let batch = Batch { index: 0, artifact_digest: "busy".into(), rows: vec![listing_row(&schema, 1)] };
        let ticker = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Instant::now()
        };
        let write = async {
            let result = session.write_batch(&batch).await;
            (result, Instant::now())
        };
        let (ticked_at, (result, written_at)) = tokio::join!(ticker, write);

        assert!(result.unwrap_err().is_transient());
        assert!(ticked_at < written_at);
        writer.execute_batch("ROLLBACK").unwrap();
    }

    #[test]
    fn test_ddl_creates_parents_first() {
        let ddl = warehouse_ddl();
        let listings = ddl.find("CREATE TABLE IF NOT EXISTS \"listings\"").unwrap();
        let reviews = ddl.find("CREATE TABLE IF NOT EXISTS \"reviews\"").unwrap();
        assert!(listings < reviews);
        assert!(ddl.contains(CHECKPOINT_TABLE));
    }
}
