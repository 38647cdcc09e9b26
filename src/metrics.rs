//! Pipeline counters recorded through the `metrics` facade.
//!
//! No recorder is installed here; whoever embeds the pipeline decides where
//! the counters go.

/// Metrics for the transform stage
pub struct TransformMetrics;

impl TransformMetrics {
    pub fn record_dataset(dataset: &str, rows_written: u64, duplicates: u64, orphans: u64) {
        ::metrics::counter!("rental_etl_transform_rows_total", "dataset" => dataset.to_string()).increment(rows_written);
        ::metrics::counter!("rental_etl_transform_duplicates_total", "dataset" => dataset.to_string())
            .increment(duplicates);
        ::metrics::counter!("rental_etl_transform_orphans_total", "dataset" => dataset.to_string()).increment(orphans);
    }

    pub fn record_schema_error(dataset: &str) {
        ::metrics::counter!("rental_etl_transform_schema_errors_total", "dataset" => dataset.to_string()).increment(1);
    }
}

/// Metrics for the load stage
pub struct LoadMetrics;

impl LoadMetrics {
    pub fn record_batch_committed(table: &str, rows: u64) {
        ::metrics::counter!("rental_etl_load_batches_total", "table" => table.to_string()).increment(1);
        ::metrics::counter!("rental_etl_load_rows_committed_total", "table" => table.to_string()).increment(rows);
    }

    pub fn record_retry(table: &str) {
        ::metrics::counter!("rental_etl_load_retries_total", "table" => table.to_string()).increment(1);
    }

    pub fn record_rejected(table: &str, rows: u64) {
        ::metrics::counter!("rental_etl_load_rows_rejected_total", "table" => table.to_string()).increment(rows);
    }

    pub fn record_failed_load(table: &str) {
        ::metrics::counter!("rental_etl_load_failures_total", "table" => table.to_string()).increment(1);
    }
}
