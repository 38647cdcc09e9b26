/// Dataset names, shared by file names, table names and CLI arguments
pub const LISTINGS: &str = "listings";
pub const REVIEWS: &str = "reviews";
pub const CALENDAR: &str = "calendar";

// Raw dumps produced by extraction
pub const RAW_EXTENSION: &str = "csv.gz";
// Transformed artifacts consumed by the loader
pub const TRANSFORMED_EXTENSION: &str = "csv";

/// Table that records the last committed batch per (table, artifact digest)
pub const CHECKPOINT_TABLE: &str = "load_checkpoints";

// Defaults for the configuration surface
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const MAX_RETRY_CEILING: u32 = 10;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 200;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5_000;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CONFIG_FILE: &str = "rental_etl.toml";

// Environment overrides
pub const ENV_DATABASE_PATH: &str = "RENTAL_ETL_DATABASE_PATH";
pub const ENV_BATCH_SIZE: &str = "RENTAL_ETL_BATCH_SIZE";
pub const ENV_MAX_RETRIES: &str = "RENTAL_ETL_MAX_RETRIES";
pub const ENV_ORPHAN_POLICY: &str = "RENTAL_ETL_ORPHAN_POLICY";

/// Delimiter used when joining list values into one text column
pub const LIST_DELIMITER: &str = ",";

/// File name of the raw dump for a dataset, e.g. `listings.csv.gz`
pub fn raw_file_name(dataset: &str) -> String {
    format!("{dataset}.{RAW_EXTENSION}")
}

/// File name of the transformed artifact for a dataset, e.g. `listings.csv`
pub fn transformed_file_name(dataset: &str) -> String {
    format!("{dataset}.{TRANSFORMED_EXTENSION}")
}

/// File name of the quarantine file holding orphan rows for a dataset
pub fn quarantine_file_name(dataset: &str) -> String {
    format!("{dataset}_orphans.{TRANSFORMED_EXTENSION}")
}
