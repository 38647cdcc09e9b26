//! Row Cleaner: applies a dataset's column rules to raw rows, repairs range
//! violations and drops duplicate keys.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{Row, Scalar};
use crate::error::{EtlError, Result};
use crate::pipeline::processing::normalize::{normalize_field, parse_cell, Applied};
use crate::schema::{DatasetSchema, FieldAction, RangeAction, RangeRule};

/// Counts produced while cleaning one dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningReport {
    pub rows_read: u64,
    pub rows_written: u64,
    /// Rows where at least one value was repaired, nulled or text-normalized.
    pub rows_modified: u64,
    pub nulls_introduced: u64,
    pub duplicates_removed: u64,
    pub coercion_failures: u64,
    pub out_of_range: u64,
    /// Rows dropped because a key column was null after cleaning.
    pub missing_keys: u64,
    /// Data-quality warnings per target column.
    pub warnings: BTreeMap<String, u64>,
    /// First few coercion failures, as `row N, column: message`.
    pub samples: Vec<String>,
}

impl CleaningReport {
    pub fn data_quality_warnings(&self) -> u64 {
        self.coercion_failures + self.out_of_range + self.missing_keys
    }
}

const MAX_WARNING_SAMPLES: usize = 20;

/// Outcome of applying a range policy to one value.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeOutcome {
    InRange,
    Clamped(Scalar),
    Nulled,
}

/// Check `value` against `rule`. Non-numeric and null values are always in range.
pub fn apply_range(value: &Scalar, rule: &RangeRule) -> RangeOutcome {
    let Some(v) = value.as_f64() else {
        return RangeOutcome::InRange;
    };
    let below = rule.min.filter(|min| v < *min);
    let above = rule.max.filter(|max| v > *max);
    let bound = match (below, above) {
        (Some(min), _) => min,
        (_, Some(max)) => max,
        _ => return RangeOutcome::InRange,
    };
    match rule.action {
        RangeAction::Null => RangeOutcome::Nulled,
        RangeAction::Clamp => match value {
            Scalar::Int(_) if below.is_some() => RangeOutcome::Clamped(Scalar::Int(bound.ceil() as i64)),
            Scalar::Int(_) => RangeOutcome::Clamped(Scalar::Int(bound.floor() as i64)),
            _ => RangeOutcome::Clamped(Scalar::Float(bound)),
        },
    }
}

/// Stateful cleaner for one dataset. Rows are fed in file order so that
/// the first occurrence of a key wins.
pub struct RowCleaner {
    schema: DatasetSchema,
    /// Raw column index for each rule, `None` when the column is absent.
    plan: Vec<Option<usize>>,
    targets: Vec<String>,
    key_indices: Vec<usize>,
    seen: HashSet<Vec<Scalar>>,
    report: CleaningReport,
}

impl RowCleaner {
    /// Bind the schema to a raw header. Fails when a required column is missing.
    pub fn new(schema: DatasetSchema, raw_header: &[String]) -> Result<Self> {
        let mut seen_header = HashSet::new();
        for name in raw_header {
            if !name.is_empty() && !seen_header.insert(name.as_str()) {
                return Err(EtlError::schema(schema.kind, format!("duplicate column '{name}' in raw header")));
            }
        }

        let missing: Vec<&str> = schema
            .required_sources()
            .into_iter()
            .filter(|source| !raw_header.iter().any(|h| h == source))
            .collect();
        if !missing.is_empty() {
            return Err(EtlError::schema(schema.kind, format!("missing required column(s): {}", missing.join(", "))));
        }

        let plan: Vec<Option<usize>> =
            schema.rules.iter().map(|rule| raw_header.iter().position(|h| *h == rule.source)).collect();

        let absent: Vec<&str> = schema
            .rules
            .iter()
            .zip(&plan)
            .filter(|(_, idx)| idx.is_none())
            .map(|(rule, _)| rule.source.as_str())
            .collect();
        if !absent.is_empty() {
            warn!(dataset = %schema.kind, columns = ?absent, "⚠️ Optional columns absent from raw dump, filling with null");
        }

        let targets = schema
            .rules
            .iter()
            .map(|rule| rule.action.outputs().first().map(|c| c.name.clone()).unwrap_or_else(|| rule.source.clone()))
            .collect();
        let cleaned = schema.cleaned_columns();
        let key_indices = schema
            .key
            .iter()
            .filter_map(|k| cleaned.iter().position(|c| &c.name == k))
            .collect();

        Ok(Self { schema, plan, targets, key_indices, seen: HashSet::new(), report: CleaningReport::default() })
    }

    /// Clean one raw record. Returns `None` for duplicates and rows without a key.
    pub fn clean(&mut self, record: &[String]) -> Option<Row> {
        self.report.rows_read += 1;
        let mut row = Vec::new();
        let mut modified = false;

        for ((rule, idx), target) in self.schema.rules.iter().zip(&self.plan).zip(&self.targets) {
            let raw = idx.and_then(|i| record.get(i)).map(|cell| parse_cell(cell)).unwrap_or(serde_json::Value::Null);
            let mut out = normalize_field(&rule.action, &raw);

            if out.text_changed {
                modified = true;
            }
            if out.applied == Applied::CoercionFailed {
                modified = true;
                self.report.coercion_failures += 1;
                *self.report.warnings.entry(target.clone()).or_default() += 1;
                if let Some(message) = out.warning.take() {
                    let row_number = self.report.rows_read;
                    debug!(dataset = %self.schema.kind, column = %target, row = row_number, "⚠️ {}", message);
                    if self.report.samples.len() < MAX_WARNING_SAMPLES {
                        self.report.samples.push(format!("row {row_number}, {target}: {message}"));
                    }
                }
            }
            if out.nulled {
                self.report.nulls_introduced += 1;
            }

            if let FieldAction::Scalar { range: Some(range), .. } = &rule.action {
                if let Some(first) = out.values.first_mut() {
                    match apply_range(first, range) {
                        RangeOutcome::InRange => {}
                        RangeOutcome::Clamped(v) => {
                            *first = v;
                            modified = true;
                            self.report.out_of_range += 1;
                            *self.report.warnings.entry(target.clone()).or_default() += 1;
                        }
                        RangeOutcome::Nulled => {
                            *first = Scalar::Null;
                            modified = true;
                            self.report.out_of_range += 1;
                            self.report.nulls_introduced += 1;
                            *self.report.warnings.entry(target.clone()).or_default() += 1;
                        }
                    }
                }
            }
            row.extend(out.values);
        }

        let key: Vec<Scalar> = self.key_indices.iter().map(|&i| row[i].clone()).collect();
        if key.iter().any(Scalar::is_null) {
            self.report.missing_keys += 1;
            return None;
        }
        if !self.seen.insert(key) {
            self.report.duplicates_removed += 1;
            return None;
        }
        if modified {
            self.report.rows_modified += 1;
        }
        self.report.rows_written += 1;
        Some(row)
    }

    pub fn finish(self) -> CleaningReport {
        self.report
    }
}

/// Clean an in-memory dataset in one go.
pub fn clean_rows<I>(schema: DatasetSchema, header: &[String], records: I) -> Result<(Vec<Row>, CleaningReport)>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut cleaner = RowCleaner::new(schema, header)?;
    let rows = records.into_iter().filter_map(|record| cleaner.clean(&record)).collect();
    Ok((rows, cleaner.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DatasetKind;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn calendar_header() -> Vec<String> {
        strings(&["listing_id", "date", "available", "price", "adjusted_price", "minimum_nights", "maximum_nights"])
    }

    fn calendar_schema() -> DatasetSchema {
        DatasetSchema::for_kind(DatasetKind::Calendar)
    }

    fn column(schema: &DatasetSchema, name: &str) -> usize {
        schema.cleaned_columns().iter().position(|c| c.name == name).unwrap()
    }

    #[test]
    fn test_missing_required_column_is_schema_error() {
        let header = strings(&["listing_id", "available"]);
        let err = RowCleaner::new(calendar_schema(), &header);
        assert!(matches!(err, Err(EtlError::Schema { dataset: DatasetKind::Calendar, .. })));
    }

    #[test]
    fn test_duplicates_keep_first_occurrence() {
        let records = vec![
            strings(&["1", "2024-01-01", "t", "$100.00", "", "2", "30"]),
            strings(&["1", "2024-01-01", "f", "$999.00", "", "2", "30"]),
            strings(&["1", "2024-01-02", "t", "$100.00", "", "2", "30"]),
        ];
        let schema = calendar_schema();
        let price = column(&schema, "price");
        let (rows, report) = clean_rows(schema, &calendar_header(), records).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][price], Scalar::Float(100.0));
        assert_eq!(report.duplicates_removed, 1);
        assert_eq!(report.rows_read, 3);
        assert_eq!(report.rows_written, 2);
    }

    #[test]
    fn test_range_policies() {
        let records = vec![strings(&["1", "2024-01-01", "t", "-5", "", "0", "30"])];
        let schema = calendar_schema();
        let price = column(&schema, "price");
        let min_nights = column(&schema, "minimum_nights");
        let (rows, report) = clean_rows(schema, &calendar_header(), records).unwrap();

        assert_eq!(rows[0][price], Scalar::Null);
        assert_eq!(rows[0][min_nights], Scalar::Int(1));
        assert_eq!(report.out_of_range, 2);
        assert_eq!(report.nulls_introduced, 1);
        assert_eq!(report.rows_modified, 1);
        assert_eq!(report.warnings.get("price"), Some(&1));
    }

    #[test]
    fn test_coercion_failure_is_a_warning_not_an_error() {
        let records = vec![strings(&["1", "2024-01-01", "t", "cheap", "", "2", "30"])];
        let (rows, report) = clean_rows(calendar_schema(), &calendar_header(), records).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(report.coercion_failures, 1);
        assert_eq!(report.data_quality_warnings(), 1);
        assert_eq!(report.samples.len(), 1);
        assert!(report.samples[0].starts_with("row 1, price: "));
        assert!(report.samples[0].contains("cheap"));
    }

    #[test]
    fn test_warning_samples_are_capped() {
        let records = (0..50).map(|i| {
            let id = (i + 1).to_string();
            strings(&[&id, "2024-01-01", "t", "cheap", "", "2", "30"])
        });
        let (rows, report) = clean_rows(calendar_schema(), &calendar_header(), records).unwrap();
        assert_eq!(rows.len(), 50);
        assert_eq!(report.coercion_failures, 50);
        assert_eq!(report.samples.len(), MAX_WARNING_SAMPLES);
        assert!(report.samples[1].starts_with("row 2, price: "));
    }

    #[test]
    fn test_null_key_drops_row() {
        let records = vec![strings(&["", "2024-01-01", "t", "", "", "", ""])];
        let (rows, report) = clean_rows(calendar_schema(), &calendar_header(), records).unwrap();
        assert!(rows.is_empty());
        assert_eq!(report.missing_keys, 1);
    }

    #[test]
    fn test_apply_range_clamps_ints_to_integral_bounds() {
        let rule = RangeRule { min: Some(0.5), max: Some(9.5), action: RangeAction::Clamp };
        assert_eq!(apply_range(&Scalar::Int(0), &rule), RangeOutcome::Clamped(Scalar::Int(1)));
        assert_eq!(apply_range(&Scalar::Int(12), &rule), RangeOutcome::Clamped(Scalar::Int(9)));
        assert_eq!(apply_range(&Scalar::Float(10.0), &rule), RangeOutcome::Clamped(Scalar::Float(9.5)));
        assert_eq!(apply_range(&Scalar::Text("x".into()), &rule), RangeOutcome::InRange);
        assert_eq!(apply_range(&Scalar::Null, &rule), RangeOutcome::InRange);
    }
}
