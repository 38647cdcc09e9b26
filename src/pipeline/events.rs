//! Progress events and the collaborator they are emitted to.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::DatasetKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Transform,
    Load,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Transform => f.write_str("transform"),
            Stage::Load => f.write_str("load"),
        }
    }
}

/// One committed batch (or, for the transform stage, one written artifact).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub dataset: DatasetKind,
    pub batch_index: usize,
    pub rows_committed: u64,
    pub cumulative_total: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, dataset: DatasetKind, batch_index: usize, rows_committed: u64, cumulative_total: u64) -> Self {
        Self { stage, dataset, batch_index, rows_committed, cumulative_total, timestamp: Utc::now() }
    }
}

/// Receiver of progress events. Owned by the caller, not by the pipeline.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Emits events as structured tracing records on the `rental_etl::progress` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &ProgressEvent) {
        info!(
            target: "rental_etl::progress",
            stage = %event.stage,
            dataset = %event.dataset,
            batch_index = event.batch_index,
            rows_committed = event.rows_committed,
            cumulative_total = event.cumulative_total,
            timestamp = %event.timestamp.to_rfc3339(),
            "📦 Progress"
        );
    }
}

/// Collects events in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &ProgressEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// Cooperative stop request, honored between batches.
#[derive(Debug, Default, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
