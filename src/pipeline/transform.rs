//! Dataset Transformer: cleans the three raw dumps, applies the referential
//! check and derived columns, and publishes the flattened artifacts.
//!
//! Runs in three stages:
//! 1. clean each raw dump into a staging file (datasets in parallel),
//! 2. finalize each staging file into a pending artifact, which needs the
//!    listing key set and the listing price quartiles from stage 1,
//! 3. atomically publish every dataset that made it through both stages.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::domain::{DatasetKind, Scalar};
use crate::error::{EtlError, IssueSummary, Result};
use crate::metrics::TransformMetrics;
use crate::pipeline::artifact::{ArtifactReader, ArtifactWriter, PreparedArtifact, RawReader};
use crate::pipeline::events::{EventSink, ProgressEvent, Stage};
use crate::pipeline::processing::clean::{CleaningReport, RowCleaner};
use crate::pipeline::processing::enrich::PriceBands;
use crate::pipeline::processing::referential::{ListingKeys, OrphanPolicy, ReferentialFilter};
use crate::schema::DatasetSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Outcome of transforming one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetTransformReport {
    pub dataset: DatasetKind,
    pub status: StageStatus,
    pub cleaning: CleaningReport,
    pub orphans: u64,
    pub rows_written: u64,
    pub artifact: Option<PathBuf>,
    pub quarantine: Option<PathBuf>,
    /// Structural failure: the raw dump does not match the declared schema.
    pub schema_error: bool,
    pub error: Option<String>,
}

impl DatasetTransformReport {
    fn failed(dataset: DatasetKind, err: &EtlError, cleaning: CleaningReport) -> Self {
        Self {
            dataset,
            status: StageStatus::Failed,
            cleaning,
            orphans: 0,
            rows_written: 0,
            artifact: None,
            quarantine: None,
            schema_error: matches!(err, EtlError::Schema { .. } | EtlError::MissingArtifact { .. }),
            error: Some(err.to_string()),
        }
    }
}

/// Cross-dataset consistency report returned by [`DatasetTransformer::run`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformSummary {
    pub orphan_policy: OrphanPolicy,
    pub datasets: Vec<DatasetTransformReport>,
}

impl TransformSummary {
    pub fn get(&self, dataset: DatasetKind) -> Option<&DatasetTransformReport> {
        self.datasets.iter().find(|d| d.dataset == dataset)
    }

    pub fn succeeded(&self, dataset: DatasetKind) -> bool {
        self.get(dataset).is_some_and(|d| d.status == StageStatus::Succeeded)
    }

    pub fn issues(&self) -> IssueSummary {
        let mut issues = IssueSummary::default();
        for d in &self.datasets {
            issues.data_quality_warnings += d.cleaning.data_quality_warnings();
            issues.orphan_references += d.orphans;
            if d.schema_error {
                issues.schema_errors += 1;
            }
        }
        issues
    }
}

/// Result of stage 1 for one dataset.
struct StagedDataset {
    staging: PathBuf,
    report: CleaningReport,
    listing_keys: HashSet<Scalar>,
    prices: Vec<f64>,
}

/// Result of stage 2 for one dataset: artifacts written but not yet published.
struct PendingDataset {
    artifact: ArtifactWriter,
    quarantine: Option<ArtifactWriter>,
    orphans: u64,
}

#[derive(Debug, Clone)]
struct DatasetJob {
    schema: DatasetSchema,
    raw: PathBuf,
    staging: PathBuf,
    output: PathBuf,
    quarantine: PathBuf,
}

pub struct DatasetTransformer {
    jobs: Vec<DatasetJob>,
    orphan_policy: OrphanPolicy,
    parallel: bool,
    sink: Arc<dyn EventSink>,
}

impl DatasetTransformer {
    pub fn from_config(config: &Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        let jobs = DatasetKind::ALL
            .iter()
            .map(|&kind| {
                Ok(DatasetJob {
                    schema: config.schema_for(kind)?,
                    raw: config.raw_path(kind),
                    staging: config.paths.transformed_dir.join(format!(".{}.staging.csv", kind.name())),
                    output: config.transformed_path(kind),
                    quarantine: config.quarantine_path(kind),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { jobs, orphan_policy: config.transform.orphan_policy, parallel: config.transform.parallel, sink })
    }

    /// Transform all three datasets. Per-dataset failures are reported, not returned.
    pub async fn run(&self) -> TransformSummary {
        info!("🔄 Transforming datasets (orphan policy: {})", self.orphan_policy);
        let mut reports: Vec<Option<DatasetTransformReport>> = vec![None; self.jobs.len()];

        // Stage 1
        let staged = self
            .run_jobs(self.jobs.iter().cloned().map(|job| move || clean_to_staging(&job)).collect())
            .await;
        let mut cleaned: Vec<Option<StagedDataset>> = Vec::with_capacity(self.jobs.len());
        for (i, result) in staged.into_iter().enumerate() {
            match result {
                Ok(staged) => cleaned.push(Some(staged)),
                Err(err) => {
                    let kind = self.jobs[i].schema.kind;
                    error!("❌ Cleaning {} failed: {}", kind, err);
                    if matches!(err, EtlError::Schema { .. }) {
                        TransformMetrics::record_schema_error(kind.name());
                    }
                    reports[i] = Some(DatasetTransformReport::failed(kind, &err, CleaningReport::default()));
                    cleaned.push(None);
                }
            }
        }

        let listings = self.jobs.iter().position(|j| j.schema.kind == DatasetKind::Listings);
        let listing_stage = listings.and_then(|i| cleaned[i].as_ref());
        let keys: Option<ListingKeys> = listing_stage.map(|s| Arc::new(s.listing_keys.clone()));
        let bands = listing_stage.and_then(|s| PriceBands::from_prices(s.prices.clone()));
        if let Some(bands) = &bands {
            info!("💰 Price quartiles: p25={} p50={} p75={}", bands.p25, bands.p50, bands.p75);
        }

        // Stage 2
        let mut finalize = Vec::new();
        let mut finalize_index = Vec::new();
        for (i, (job, staged)) in self.jobs.iter().zip(&cleaned).enumerate() {
            let Some(staged) = staged else { continue };
            let needs_keys = job.schema.kind.references_listings();
            if needs_keys && keys.is_none() {
                let err = EtlError::schema(job.schema.kind, "listings could not be transformed, so listing references cannot be checked");
                warn!("⏭️ Skipping {}: {}", job.schema.kind, err);
                let mut report = DatasetTransformReport::failed(job.schema.kind, &err, staged.report.clone());
                report.status = StageStatus::Skipped;
                report.schema_error = false;
                reports[i] = Some(report);
                continue;
            }
            let job = job.clone();
            let staging = staged.staging.clone();
            let keys = if needs_keys { keys.clone() } else { None };
            let policy = self.orphan_policy;
            finalize.push(move || finalize_dataset(&job, &staging, policy, keys, bands));
            finalize_index.push(i);
        }
        let finalized = self.run_jobs(finalize).await;

        // Stage 3
        for (i, result) in finalize_index.into_iter().zip(finalized) {
            let kind = self.jobs[i].schema.kind;
            let cleaning = cleaned[i].as_ref().map(|s| s.report.clone()).unwrap_or_default();
            let report = match result.and_then(|pending| publish(kind, pending)) {
                Ok((rows_written, artifact, quarantine, orphans)) => {
                    TransformMetrics::record_dataset(kind.name(), rows_written, cleaning.duplicates_removed, orphans);
                    self.sink.emit(&ProgressEvent::new(Stage::Transform, kind, 0, rows_written, rows_written));
                    info!(
                        "✅ {}: {} rows written ({} read, {} duplicates, {} orphans, {} warnings)",
                        kind,
                        rows_written,
                        cleaning.rows_read,
                        cleaning.duplicates_removed,
                        orphans,
                        cleaning.data_quality_warnings()
                    );
                    DatasetTransformReport {
                        dataset: kind,
                        status: StageStatus::Succeeded,
                        cleaning,
                        orphans,
                        rows_written,
                        artifact: Some(artifact),
                        quarantine,
                        schema_error: false,
                        error: None,
                    }
                }
                Err(err) => {
                    error!("❌ Finalizing {} failed: {}", kind, err);
                    DatasetTransformReport::failed(kind, &err, cleaning)
                }
            };
            reports[i] = Some(report);
        }

        for staged in cleaned.into_iter().flatten() {
            remove_if_present(&staged.staging);
        }

        let datasets = reports
            .into_iter()
            .zip(&self.jobs)
            .map(|(report, job)| {
                report.unwrap_or_else(|| {
                    let err = EtlError::schema(job.schema.kind, "dataset was not processed");
                    DatasetTransformReport::failed(job.schema.kind, &err, CleaningReport::default())
                })
            })
            .collect();
        TransformSummary { orphan_policy: self.orphan_policy, datasets }
    }

    /// Run blocking jobs on the blocking pool, or inline when not parallel.
    async fn run_jobs<T, F>(&self, jobs: Vec<F>) -> Vec<Result<T>>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.parallel {
            return jobs.into_iter().map(|job| job()).collect();
        }
        let handles: Vec<_> = jobs.into_iter().map(tokio::task::spawn_blocking).collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.map_err(EtlError::from).and_then(|r| r));
        }
        results
    }
}

/// Stage 1: raw dump -> cleaned staging file.
fn clean_to_staging(job: &DatasetJob) -> Result<StagedDataset> {
    let schema = &job.schema;
    let mut raw = RawReader::open(schema.kind, &job.raw)?;
    let mut cleaner = RowCleaner::new(schema.clone(), raw.header())?;

    let header: Vec<String> = schema.cleaned_columns().into_iter().map(|c| c.name).collect();
    let key_index = schema.key_indices().first().copied();
    let price_index = schema.price_band.as_ref().and_then(|band| header.iter().position(|h| *h == band.source));
    let collect_keys = schema.kind == DatasetKind::Listings;

    let mut staging = ArtifactWriter::create(&job.staging)?;
    staging.write_header(&header)?;
    let mut listing_keys = HashSet::new();
    let mut prices = Vec::new();
    let mut record = Vec::new();
    while raw.next_record(&mut record)? {
        let Some(row) = cleaner.clean(&record) else { continue };
        if collect_keys {
            if let Some(i) = key_index {
                listing_keys.insert(row[i].clone());
            }
        }
        if let Some(price) = price_index.and_then(|i| row[i].as_f64()) {
            prices.push(price);
        }
        staging.write_row(&row)?;
    }
    let staging = staging.commit()?;
    Ok(StagedDataset { staging, report: cleaner.finish(), listing_keys, prices })
}

/// Stage 2: staging file -> pending artifact (+ quarantine), with derived
/// columns and the orphan policy applied.
fn finalize_dataset(
    job: &DatasetJob,
    staging: &Path,
    policy: OrphanPolicy,
    keys: Option<ListingKeys>,
    bands: Option<PriceBands>,
) -> Result<PendingDataset> {
    let schema = &job.schema;
    let cleaned_columns = schema.cleaned_columns();
    let header = schema.header();
    let price_index = schema
        .price_band
        .as_ref()
        .and_then(|band| cleaned_columns.iter().position(|c| c.name == band.source));

    let mut reader = ArtifactReader::open(schema.kind, staging, cleaned_columns)?;
    let mut artifact = ArtifactWriter::create(&job.output)?;
    artifact.write_header(&header)?;

    let mut filter = match (&schema.foreign_key, keys) {
        (Some(fk), Some(keys)) => {
            let fk_index = header
                .iter()
                .position(|h| *h == fk.column)
                .ok_or_else(|| EtlError::schema(schema.kind, format!("foreign key column '{}' not declared", fk.column)))?;
            let quarantine = match policy {
                OrphanPolicy::Quarantine => {
                    let mut writer = ArtifactWriter::create(&job.quarantine)?;
                    writer.write_header(&header)?;
                    Some(writer)
                }
                OrphanPolicy::Drop => None,
            };
            Some(ReferentialFilter::new(fk_index, keys, quarantine))
        }
        _ => None,
    };

    while let Some(mut row) = reader.next_row()? {
        if let Some(filter) = filter.as_mut() {
            if !filter.admit(&row)? {
                continue;
            }
        }
        if schema.price_band.is_some() {
            let band = match (&bands, price_index) {
                (Some(bands), Some(i)) => bands.classify(&row[i]),
                _ => Scalar::Null,
            };
            row.push(band);
        }
        artifact.write_row(&row)?;
    }

    let (orphans, quarantine) = match filter {
        Some(filter) => filter.finish(),
        None => (0, None),
    };
    if orphans > 0 {
        warn!("🔗 {}: {} orphan row(s) {}", schema.kind, orphans, match policy {
            OrphanPolicy::Drop => "dropped",
            OrphanPolicy::Quarantine => "quarantined",
        });
    }
    Ok(PendingDataset { artifact, quarantine, orphans })
}

/// Stage 3: publish the pending files. Returns (rows, artifact, quarantine, orphans).
///
/// Both files are synced before either is renamed, and the artifact goes
/// first, so a quarantine file is never published without its artifact.
fn publish(kind: DatasetKind, pending: PendingDataset) -> Result<(u64, PathBuf, Option<PathBuf>, u64)> {
    let rows = pending.artifact.rows();
    let artifact = pending.artifact.prepare()?;
    let quarantine = pending.quarantine.map(ArtifactWriter::prepare).transpose()?;
    let artifact = artifact.publish()?;
    let quarantine = quarantine.map(PreparedArtifact::publish).transpose()?;
    info!("📝 Published {} artifact at {}", kind, artifact.display());
    Ok((rows, artifact, quarantine, pending.orphans))
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!("Could not remove staging file {}: {}", path.display(), e);
        }
    }
}
