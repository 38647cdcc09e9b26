//! Pipeline Coordinator: sequences Transform then Load per dataset and folds
//! the per-dataset outcomes into one run report.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::domain::DatasetKind;
use crate::error::{EtlError, IssueSummary, Result};
use crate::pipeline::events::{EventSink, StopHandle};
use crate::pipeline::load::{BatchLoader, LoadReport, LoadState};
use crate::pipeline::storage::StoreConnector;
use crate::pipeline::transform::{DatasetTransformReport, DatasetTransformer, StageStatus, TransformSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    TransformOnly,
    LoadOnly,
    TransformAndLoad,
}

impl PipelineStage {
    fn transforms(&self) -> bool {
        !matches!(self, PipelineStage::LoadOnly)
    }

    fn loads(&self) -> bool {
        !matches!(self, PipelineStage::TransformOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    PartiallyFailed,
    Failed,
}

/// Everything that happened to one dataset during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetOutcome {
    pub dataset: DatasetKind,
    pub succeeded: bool,
    pub transform: Option<DatasetTransformReport>,
    pub load: Option<LoadReport>,
    pub error: Option<String>,
}

impl DatasetOutcome {
    fn new(dataset: DatasetKind) -> Self {
        Self { dataset, succeeded: true, transform: None, load: None, error: None }
    }

    fn failed(&mut self, message: impl Into<String>) {
        self.succeeded = false;
        self.error.get_or_insert_with(|| message.into());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub stage: PipelineStage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: PipelineStatus,
    pub datasets: Vec<DatasetOutcome>,
    pub issues: IssueSummary,
}

impl PipelineReport {
    pub fn outcome(&self, dataset: DatasetKind) -> Option<&DatasetOutcome> {
        self.datasets.iter().find(|d| d.dataset == dataset)
    }

    /// Write the report as pretty JSON into `dir`, named after the run id.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("pipeline_report_{}.json", self.run_id));
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

pub struct PipelineCoordinator {
    config: Config,
    connector: Arc<dyn StoreConnector>,
    sink: Arc<dyn EventSink>,
    stop: StopHandle,
}

impl PipelineCoordinator {
    pub fn new(config: Config, connector: Arc<dyn StoreConnector>, sink: Arc<dyn EventSink>) -> Self {
        Self { config, connector, sink, stop: StopHandle::new() }
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Run `stage` for `datasets` (all three when empty).
    ///
    /// Transformation always covers every dataset, since the referential
    /// check needs the cleaned listings. Loads go parent first and carry on
    /// past a failed table.
    pub async fn run(&self, stage: PipelineStage, datasets: &[DatasetKind], start_batch: usize) -> Result<PipelineReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let selected: Vec<DatasetKind> =
            DatasetKind::ALL.into_iter().filter(|k| datasets.is_empty() || datasets.contains(k)).collect();
        info!("🚀 Pipeline run {} started: stage={:?} datasets={:?}", run_id, stage, selected);

        let mut outcomes: Vec<DatasetOutcome> = selected.iter().map(|&k| DatasetOutcome::new(k)).collect();
        let mut issues = IssueSummary::default();

        if stage.transforms() {
            let summary = DatasetTransformer::from_config(&self.config, self.sink.clone())?.run().await;
            issues.merge(&transform_issues(&summary, &selected));
            for outcome in &mut outcomes {
                let Some(report) = summary.get(outcome.dataset) else { continue };
                if report.status != StageStatus::Succeeded {
                    outcome.failed(report.error.clone().unwrap_or_else(|| "transformation failed".to_string()));
                }
                outcome.transform = Some(report.clone());
            }
        }

        if stage.loads() {
            let loader = BatchLoader::new(self.connector.clone(), self.sink.clone())
                .with_policy(self.config.load.retry_policy())
                .with_batch_size(self.config.load.batch_size)
                .with_stop_handle(self.stop.clone());

            for outcome in &mut outcomes {
                if !outcome.succeeded {
                    warn!("⏭️ Not loading {}: transformation did not succeed", outcome.dataset);
                    continue;
                }
                if self.stop.is_stop_requested() {
                    outcome.failed("stop requested before load started");
                    continue;
                }
                let schema = self.config.schema_for(outcome.dataset)?;
                let artifact = self.config.transformed_path(outcome.dataset);
                match loader.load(&schema, &artifact, start_batch).await {
                    Ok(report) => {
                        issues.merge(&load_issues(&report));
                        if !report.succeeded() {
                            let message = report.error.clone().unwrap_or_else(|| match report.state {
                                LoadState::Stopped => "load stopped before completion".to_string(),
                                _ => format!("batches {:?} could not be committed", report.failed_batches),
                            });
                            outcome.failed(message);
                        }
                        outcome.load = Some(report);
                    }
                    Err(err) => {
                        error!("❌ Load of {} could not start: {}", outcome.dataset, err);
                        if matches!(err, EtlError::Schema { .. } | EtlError::MissingArtifact { .. }) {
                            issues.schema_errors += 1;
                        }
                        outcome.failed(err.to_string());
                    }
                }
            }
        }

        let succeeded = outcomes.iter().filter(|o| o.succeeded).count();
        let status = if succeeded == outcomes.len() {
            PipelineStatus::Succeeded
        } else if succeeded == 0 {
            PipelineStatus::Failed
        } else {
            PipelineStatus::PartiallyFailed
        };

        let report =
            PipelineReport { run_id, stage, started_at, finished_at: Utc::now(), status, datasets: outcomes, issues };
        match report.status {
            PipelineStatus::Succeeded => info!("🎉 Pipeline run {} succeeded ({})", run_id, report.issues),
            _ => warn!("⚠️ Pipeline run {} finished with status {:?} ({})", run_id, report.status, report.issues),
        }
        Ok(report)
    }
}

fn transform_issues(summary: &TransformSummary, selected: &[DatasetKind]) -> IssueSummary {
    let scoped = TransformSummary {
        orphan_policy: summary.orphan_policy,
        datasets: summary.datasets.iter().filter(|d| selected.contains(&d.dataset)).cloned().collect(),
    };
    scoped.issues()
}

fn load_issues(report: &LoadReport) -> IssueSummary {
    IssueSummary {
        transient_store_errors: report.retries,
        constraint_violations: report.rejected.len() as u64,
        fatal_load_errors: u64::from(report.state == LoadState::Failed),
        ..Default::default()
    }
}
