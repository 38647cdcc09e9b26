use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::domain::DatasetKind;
use crate::error::{EtlError, Result};
use crate::pipeline::load::RetryPolicy;
use crate::pipeline::processing::referential::OrphanPolicy;
use crate::schema::{DatasetSchema, RangeRule};

/// Configuration surface handed to the pipeline by the dispatcher.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub transform: TransformConfig,
    pub load: LoadConfig,
    /// Range policy overrides: `[clamp.<dataset>.<column>]`.
    pub clamp: BTreeMap<String, BTreeMap<String, RangeRule>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub raw_dir: PathBuf,
    pub transformed_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub report_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("data/raw"),
            transformed_dir: PathBuf::from("data/transformed"),
            quarantine_dir: PathBuf::from("data/quarantine"),
            report_dir: PathBuf::from("reports"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransformConfig {
    pub orphan_policy: OrphanPolicy,
    /// Clean the three datasets on separate worker threads.
    pub parallel: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self { orphan_policy: OrphanPolicy::Drop, parallel: true }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadConfig {
    pub database_path: PathBuf,
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub busy_timeout_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/warehouse.db"),
            batch_size: constants::DEFAULT_BATCH_SIZE,
            max_retries: constants::DEFAULT_MAX_RETRIES,
            backoff_base_ms: constants::DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: constants::DEFAULT_BACKOFF_MAX_MS,
            busy_timeout_ms: constants::DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl LoadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

impl Config {
    /// Load configuration from `path` (or `rental_etl.toml` when present),
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(constants::DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(constants::DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| EtlError::Config(format!("Failed to read config file '{}': {}", path.display(), e)))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment-style overrides. `lookup` returns the value of a variable, if set.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(constants::ENV_DATABASE_PATH) {
            self.load.database_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(constants::ENV_BATCH_SIZE) {
            self.load.batch_size = raw
                .trim()
                .parse()
                .map_err(|_| EtlError::Config(format!("{} must be a positive integer, got '{raw}'", constants::ENV_BATCH_SIZE)))?;
        }
        if let Some(raw) = lookup(constants::ENV_MAX_RETRIES) {
            self.load.max_retries = raw
                .trim()
                .parse()
                .map_err(|_| EtlError::Config(format!("{} must be an integer, got '{raw}'", constants::ENV_MAX_RETRIES)))?;
        }
        if let Some(raw) = lookup(constants::ENV_ORPHAN_POLICY) {
            self.transform.orphan_policy = raw.parse().map_err(EtlError::Config)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.load.batch_size == 0 {
            return Err(EtlError::Config("load.batch_size must be greater than zero".to_string()));
        }
        if self.load.max_retries > constants::MAX_RETRY_CEILING {
            return Err(EtlError::Config(format!(
                "load.max_retries {} exceeds the ceiling of {}",
                self.load.max_retries,
                constants::MAX_RETRY_CEILING
            )));
        }
        if self.load.backoff_base_ms > self.load.backoff_max_ms {
            return Err(EtlError::Config("load.backoff_base_ms must not exceed load.backoff_max_ms".to_string()));
        }
        for name in self.clamp.keys() {
            let kind: DatasetKind = name.parse().map_err(EtlError::Config)?;
            self.schema_for(kind)?;
        }
        Ok(())
    }

    /// Column rules for `kind` with configured range policies applied.
    pub fn schema_for(&self, kind: DatasetKind) -> Result<DatasetSchema> {
        DatasetSchema::for_kind(kind).with_overrides(self.clamp.get(kind.name()))
    }

    pub fn raw_path(&self, kind: DatasetKind) -> PathBuf {
        let gz = self.paths.raw_dir.join(constants::raw_file_name(kind.name()));
        if gz.exists() {
            return gz;
        }
        let plain = self.paths.raw_dir.join(constants::transformed_file_name(kind.name()));
        if plain.exists() {
            plain
        } else {
            gz
        }
    }

    pub fn transformed_path(&self, kind: DatasetKind) -> PathBuf {
        self.paths.transformed_dir.join(constants::transformed_file_name(kind.name()))
    }

    pub fn quarantine_path(&self, kind: DatasetKind) -> PathBuf {
        self.paths.quarantine_dir.join(constants::quarantine_file_name(kind.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RangeAction;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.load.batch_size, 1000);
        assert_eq!(config.load.max_retries, 3);
        assert_eq!(config.transform.orphan_policy, OrphanPolicy::Drop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml_with_clamp_overrides() {
        let config: Config = toml::from_str(
            r#"
            [transform]
            orphan_policy = "quarantine"

            [load]
            batch_size = 500

            [clamp.calendar.price]
            min = 0.0
            max = 10000.0
            action = "clamp"
            "#,
        )
        .unwrap();

        assert_eq!(config.transform.orphan_policy, OrphanPolicy::Quarantine);
        assert_eq!(config.load.batch_size, 500);
        assert_eq!(config.load.max_retries, 3);
        let rule = config.clamp["calendar"]["price"];
        assert_eq!(rule.action, RangeAction::Clamp);
        assert_eq!(rule.max, Some(10000.0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.load.batch_size = 0;
        assert!(matches!(config.validate(), Err(EtlError::Config(_))));

        let mut config = Config::default();
        config.load.max_retries = 11;
        assert!(matches!(config.validate(), Err(EtlError::Config(_))));

        let config: Config = toml::from_str(
            r#"
            [clamp.reviews.stars]
            min = 0.0
            action = "null"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(EtlError::Config(_))));

        let config: Config = toml::from_str(
            r#"
            [clamp.listings.price]
            min = 10.0
            max = 1.0
            action = "clamp"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(EtlError::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (constants::ENV_BATCH_SIZE, "250"),
            (constants::ENV_ORPHAN_POLICY, "quarantine"),
            (constants::ENV_DATABASE_PATH, "/tmp/x.db"),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.load.batch_size, 250);
        assert_eq!(config.transform.orphan_policy, OrphanPolicy::Quarantine);
        assert_eq!(config.load.database_path, PathBuf::from("/tmp/x.db"));

        let mut config = Config::default();
        let err = config.apply_overrides(|k| (k == constants::ENV_MAX_RETRIES).then(|| "lots".to_string()));
        assert!(matches!(err, Err(EtlError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_file(Path::new("/nonexistent/rental_etl.toml"));
        assert!(matches!(err, Err(EtlError::Config(_))));
    }
}
