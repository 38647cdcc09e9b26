//! Declared column rule tables for the three datasets.
//!
//! Every raw source column that reaches the warehouse is named here together
//! with the normalization rule that turns it into scalar target columns. The
//! tables are the single place to audit how a nested source value is stored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::{self, LIST_DELIMITER};
use crate::domain::DatasetKind;
use crate::error::{EtlError, Result};

/// Declared type of a target column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    /// Real number written with currency symbols and thousands separators.
    Currency,
    /// Real number written with a trailing percent sign.
    Percent,
    Boolean,
    /// ISO `YYYY-MM-DD`.
    Date,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Date => "TEXT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real | ColumnType::Currency | ColumnType::Percent => "REAL",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Real | ColumnType::Currency | ColumnType::Percent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeAction {
    Clamp,
    Null,
}

/// Valid interval for a numeric column and what to do with values outside it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeRule {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    pub action: RangeAction,
}

impl RangeRule {
    pub fn validate(&self, column: &str) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(EtlError::Config(format!("range for '{column}' has min {min} > max {max}")));
            }
        }
        Ok(())
    }
}

/// How one raw source column becomes target columns.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldAction {
    /// Pass-through with coercion to the declared type.
    Scalar { target: String, ty: ColumnType, range: Option<RangeRule> },
    /// ISO date, optionally with derived year/month/day/quarter/weekday columns.
    Date { target: String, parts: bool },
    /// List joined in source order.
    Join { target: String, delimiter: String },
    /// Number of list items (or mapping keys).
    Count { target: String },
    /// One boolean presence column per declared value.
    Flags { prefix: String, values: Vec<String> },
    /// Mapping with a fixed key set, one text column per key.
    Flatten { prefix: String, keys: Vec<String> },
    /// Mapping with a variable key set, stored as canonical JSON text.
    Canonical { target: String },
    Drop,
}

pub const DATE_PART_SUFFIXES: [(&str, ColumnType); 5] = [
    ("year", ColumnType::Integer),
    ("month", ColumnType::Integer),
    ("day", ColumnType::Integer),
    ("quarter", ColumnType::Integer),
    ("weekday", ColumnType::Text),
];

impl FieldAction {
    /// Target columns produced by this action, in output order.
    pub fn outputs(&self) -> Vec<ColumnDef> {
        match self {
            FieldAction::Scalar { target, ty, .. } => vec![ColumnDef::new(target, *ty)],
            FieldAction::Date { target, parts } => {
                let mut cols = vec![ColumnDef::new(target, ColumnType::Date)];
                if *parts {
                    for (suffix, ty) in DATE_PART_SUFFIXES {
                        cols.push(ColumnDef::new(&format!("{target}_{suffix}"), ty));
                    }
                }
                cols
            }
            FieldAction::Join { target, .. } => vec![ColumnDef::new(target, ColumnType::Text)],
            FieldAction::Count { target } => vec![ColumnDef::new(target, ColumnType::Integer)],
            FieldAction::Flags { prefix, values } => values
                .iter()
                .map(|v| ColumnDef::new(&format!("{prefix}{}", sanitize_identifier(v)), ColumnType::Boolean))
                .collect(),
            FieldAction::Flatten { prefix, keys } => keys
                .iter()
                .map(|k| ColumnDef::new(&format!("{prefix}{}", sanitize_identifier(k)), ColumnType::Text))
                .collect(),
            FieldAction::Canonical { target } => vec![ColumnDef::new(target, ColumnType::Text)],
            FieldAction::Drop => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub source: String,
    pub required: bool,
    pub action: FieldAction,
}

impl FieldRule {
    fn new(source: &str, action: FieldAction) -> Self {
        Self { source: source.to_string(), required: false, action }
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn range(mut self, min: Option<f64>, max: Option<f64>, action: RangeAction) -> Self {
        if let FieldAction::Scalar { range, .. } = &mut self.action {
            *range = Some(RangeRule { min, max, action });
        }
        self
    }
}

fn scalar(source: &str, target: &str, ty: ColumnType) -> FieldRule {
    FieldRule::new(source, FieldAction::Scalar { target: target.to_string(), ty, range: None })
}

fn date(source: &str, parts: bool) -> FieldRule {
    FieldRule::new(source, FieldAction::Date { target: source.to_string(), parts })
}

fn join(source: &str) -> FieldRule {
    FieldRule::new(source, FieldAction::Join { target: source.to_string(), delimiter: LIST_DELIMITER.to_string() })
}

fn count(source: &str) -> FieldRule {
    FieldRule::new(source, FieldAction::Count { target: format!("{source}_count") })
}

fn flags(source: &str, prefix: &str, values: &[&str]) -> FieldRule {
    FieldRule::new(
        source,
        FieldAction::Flags { prefix: prefix.to_string(), values: values.iter().map(|v| v.to_string()).collect() },
    )
}

fn flatten(source: &str, keys: &[&str]) -> FieldRule {
    FieldRule::new(
        source,
        FieldAction::Flatten { prefix: format!("{source}_"), keys: keys.iter().map(|k| k.to_string()).collect() },
    )
}

fn canonical(source: &str) -> FieldRule {
    FieldRule::new(source, FieldAction::Canonical { target: source.to_string() })
}

fn drop_field(source: &str) -> FieldRule {
    FieldRule::new(source, FieldAction::Drop)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDef {
    fn new(name: &str, ty: ColumnType) -> Self {
        Self { name: name.to_string(), ty }
    }
}

/// Quartile band derived from a numeric column once the whole dataset is known.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceBand {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub column: String,
    pub parent_table: String,
    pub parent_column: String,
}

/// Full declaration of one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSchema {
    pub kind: DatasetKind,
    pub rules: Vec<FieldRule>,
    /// Unique (or composite) key, as target column names.
    pub key: Vec<String>,
    pub foreign_key: Option<ForeignKey>,
    pub price_band: Option<PriceBand>,
}

impl DatasetSchema {
    pub fn for_kind(kind: DatasetKind) -> Self {
        match kind {
            DatasetKind::Listings => listings(),
            DatasetKind::Reviews => reviews(),
            DatasetKind::Calendar => calendar(),
        }
    }

    /// Schema with configured range policies replacing the declared ones.
    pub fn with_overrides(mut self, overrides: Option<&BTreeMap<String, RangeRule>>) -> Result<Self> {
        let Some(overrides) = overrides else {
            return Ok(self);
        };
        for (column, rule) in overrides {
            rule.validate(column)?;
            let slot = self.rules.iter_mut().find_map(|r| match &mut r.action {
                FieldAction::Scalar { target, ty, range } if target == column && ty.is_numeric() => Some(range),
                _ => None,
            });
            match slot {
                Some(range) => *range = Some(*rule),
                None => {
                    return Err(EtlError::Config(format!(
                        "no numeric column '{column}' in {} for range override",
                        self.kind
                    )))
                }
            }
        }
        Ok(self)
    }

    /// Columns written by the row cleaner, before dataset-wide derivations.
    pub fn cleaned_columns(&self) -> Vec<ColumnDef> {
        self.rules.iter().flat_map(|r| r.action.outputs()).collect()
    }

    /// Columns of the transformed artifact and the relational table, in order.
    pub fn columns(&self) -> Vec<ColumnDef> {
        let mut cols = self.cleaned_columns();
        if let Some(band) = &self.price_band {
            cols.push(ColumnDef::new(&band.target, ColumnType::Text));
        }
        cols
    }

    pub fn header(&self) -> Vec<String> {
        self.columns().into_iter().map(|c| c.name).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns().iter().position(|c| c.name == name)
    }

    pub fn key_indices(&self) -> Vec<usize> {
        self.key.iter().filter_map(|k| self.column_index(k)).collect()
    }

    pub fn required_sources(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for rule in self.rules.iter().filter(|r| r.required) {
            if !out.contains(&rule.source.as_str()) {
                out.push(&rule.source);
            }
        }
        out
    }

    pub fn table_spec(&self) -> TableSpec {
        TableSpec {
            dataset: self.kind,
            table: self.kind.name().to_string(),
            columns: self.columns(),
            key: self.key.clone(),
            foreign_key: self.foreign_key.clone(),
        }
    }
}

/// Relational table derived from a dataset schema.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub dataset: DatasetKind,
    pub table: String,
    pub columns: Vec<ColumnDef>,
    pub key: Vec<String>,
    pub foreign_key: Option<ForeignKey>,
}

impl TableSpec {
    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let not_null = if self.key.contains(&c.name) { " NOT NULL" } else { "" };
                let check = if c.ty == ColumnType::Boolean {
                    format!(" CHECK ({} IN (0, 1))", quote_ident(&c.name))
                } else {
                    String::new()
                };
                format!("{} {}{}{}", quote_ident(&c.name), c.ty.sql_type(), not_null, check)
            })
            .collect();
        parts.push(format!("PRIMARY KEY ({})", quoted_list(&self.key)));
        if let Some(fk) = &self.foreign_key {
            parts.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_ident(&fk.column),
                quote_ident(&fk.parent_table),
                quote_ident(&fk.parent_column)
            ));
        }
        format!("CREATE TABLE IF NOT EXISTS {} (\n    {}\n)", quote_ident(&self.table), parts.join(",\n    "))
    }

    /// Insert-or-update by key, so re-running a batch never duplicates rows.
    pub fn upsert_sql(&self) -> String {
        let names: Vec<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = names
            .iter()
            .filter(|n| !self.key.contains(n))
            .map(|n| format!("{0} = excluded.{0}", quote_ident(n)))
            .collect();
        let conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            quote_ident(&self.table),
            quoted_list(&names),
            placeholders.join(", "),
            quoted_list(&self.key),
            conflict
        )
    }

    pub fn key_indices(&self) -> Vec<usize> {
        self.key
            .iter()
            .filter_map(|k| self.columns.iter().position(|c| &c.name == k))
            .collect()
    }
}

/// Lowercase identifier made of `[a-z0-9_]`, e.g. `Air conditioning` -> `air_conditioning`.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars().flat_map(|c| c.to_lowercase()) {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quoted_list(names: &[String]) -> String {
    names.iter().map(|n| quote_ident(n)).collect::<Vec<_>>().join(", ")
}

fn listing_fk() -> ForeignKey {
    ForeignKey {
        column: "listing_id".to_string(),
        parent_table: constants::LISTINGS.to_string(),
        parent_column: "listing_id".to_string(),
    }
}

fn listings() -> DatasetSchema {
    use ColumnType::*;
    use RangeAction::{Clamp, Null as Nulled};

    DatasetSchema {
        kind: DatasetKind::Listings,
        rules: vec![
            drop_field("_id"),
            scalar("id", "listing_id", Integer).required(),
            scalar("listing_url", "listing_url", Text),
            scalar("name", "name", Text).required(),
            scalar("description", "description", Text),
            scalar("neighborhood_overview", "neighborhood_overview", Text),
            scalar("host_id", "host_id", Integer).required(),
            scalar("host_name", "host_name", Text),
            date("host_since", true),
            scalar("host_response_rate", "host_response_rate", Percent).range(Some(0.0), Some(100.0), Clamp),
            scalar("host_acceptance_rate", "host_acceptance_rate", Percent).range(Some(0.0), Some(100.0), Clamp),
            scalar("host_is_superhost", "host_is_superhost", Boolean),
            join("host_verifications"),
            count("host_verifications"),
            flags("host_verifications", "verification_", &["email", "phone", "work_email", "government_id"]),
            scalar("host_identity_verified", "host_identity_verified", Boolean),
            scalar("neighbourhood_cleansed", "neighbourhood_cleansed", Text),
            scalar("latitude", "latitude", Real).range(Some(-90.0), Some(90.0), Nulled),
            scalar("longitude", "longitude", Real).range(Some(-180.0), Some(180.0), Nulled),
            scalar("property_type", "property_type", Text),
            scalar("room_type", "room_type", Text).required(),
            scalar("accommodates", "accommodates", Integer).range(Some(0.0), None, Nulled),
            scalar("bathrooms_text", "bathrooms_text", Text),
            scalar("bedrooms", "bedrooms", Integer).range(Some(0.0), None, Nulled),
            scalar("beds", "beds", Integer).range(Some(0.0), None, Nulled),
            join("amenities"),
            count("amenities"),
            flags(
                "amenities",
                "amenity_",
                &[
                    "Wifi",
                    "Kitchen",
                    "Pool",
                    "Air conditioning",
                    "Heating",
                    "Washer",
                    "Free parking on premises",
                    "Hot tub",
                    "Dedicated workspace",
                    "Pets allowed",
                ],
            ),
            scalar("price", "price", Currency).required().range(Some(0.0), None, Nulled),
            scalar("minimum_nights", "minimum_nights", Integer).range(Some(1.0), None, Clamp),
            scalar("maximum_nights", "maximum_nights", Integer).range(Some(1.0), None, Clamp),
            scalar("availability_365", "availability_365", Integer).range(Some(0.0), Some(365.0), Clamp),
            scalar("number_of_reviews", "number_of_reviews", Integer).range(Some(0.0), None, Nulled),
            date("first_review", false),
            date("last_review", false),
            scalar("review_scores_rating", "review_scores_rating", Real).range(Some(0.0), Some(100.0), Clamp),
            scalar("review_scores_cleanliness", "review_scores_cleanliness", Real).range(Some(0.0), Some(10.0), Clamp),
            scalar("review_scores_location", "review_scores_location", Real).range(Some(0.0), Some(10.0), Clamp),
            scalar("review_scores_value", "review_scores_value", Real).range(Some(0.0), Some(10.0), Clamp),
            scalar("instant_bookable", "instant_bookable", Boolean),
            scalar("calculated_host_listings_count", "calculated_host_listings_count", Integer)
                .range(Some(0.0), None, Nulled),
            scalar("reviews_per_month", "reviews_per_month", Real).range(Some(0.0), None, Nulled),
            date("last_scraped", false),
            flatten("address", &["street", "market", "country", "country_code"]),
            canonical("location"),
        ],
        key: vec!["listing_id".to_string()],
        foreign_key: None,
        price_band: Some(PriceBand { source: "price".to_string(), target: "price_category".to_string() }),
    }
}

fn reviews() -> DatasetSchema {
    use ColumnType::*;

    DatasetSchema {
        kind: DatasetKind::Reviews,
        rules: vec![
            drop_field("_id"),
            scalar("id", "review_id", Integer).required(),
            scalar("listing_id", "listing_id", Integer).required(),
            date("date", true).required(),
            scalar("reviewer_id", "reviewer_id", Integer),
            scalar("reviewer_name", "reviewer_name", Text),
            scalar("comments", "comments", Text),
        ],
        key: vec!["review_id".to_string()],
        foreign_key: Some(listing_fk()),
        price_band: None,
    }
}

fn calendar() -> DatasetSchema {
    use ColumnType::*;
    use RangeAction::{Clamp, Null as Nulled};

    DatasetSchema {
        kind: DatasetKind::Calendar,
        rules: vec![
            drop_field("_id"),
            scalar("listing_id", "listing_id", Integer).required(),
            date("date", true).required(),
            scalar("available", "available", Boolean).required(),
            scalar("price", "price", Currency).range(Some(0.0), None, Nulled),
            scalar("adjusted_price", "adjusted_price", Currency).range(Some(0.0), None, Nulled),
            scalar("minimum_nights", "minimum_nights", Integer).range(Some(1.0), None, Clamp),
            scalar("maximum_nights", "maximum_nights", Integer).range(Some(1.0), None, Clamp),
        ],
        key: vec!["listing_id".to_string(), "date".to_string()],
        foreign_key: Some(listing_fk()),
        price_band: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("Air conditioning"), "air_conditioning");
        assert_eq!(sanitize_identifier(" Free-parking on.premises "), "free_parking_on_premises");
        assert_eq!(sanitize_identifier("Wifi"), "wifi");
    }

    #[test]
    fn test_column_names_are_unique() {
        for kind in DatasetKind::ALL {
            let header = DatasetSchema::for_kind(kind).header();
            let unique: HashSet<_> = header.iter().collect();
            assert_eq!(unique.len(), header.len(), "duplicate column in {kind}");
        }
    }

    #[test]
    fn test_key_columns_exist() {
        for kind in DatasetKind::ALL {
            let schema = DatasetSchema::for_kind(kind);
            assert_eq!(schema.key_indices().len(), schema.key.len());
        }
    }

    #[test]
    fn test_listing_columns_include_flattened_fields() {
        let header = DatasetSchema::for_kind(DatasetKind::Listings).header();
        for expected in [
            "amenities",
            "amenities_count",
            "amenity_air_conditioning",
            "verification_government_id",
            "host_since_quarter",
            "address_country_code",
            "price_category",
        ] {
            assert!(header.iter().any(|h| h == expected), "missing {expected}");
        }
        assert!(!header.iter().any(|h| h == "_id"));
    }

    #[test]
    fn test_range_override_applies() {
        let mut overrides = BTreeMap::new();
        overrides.insert("price".to_string(), RangeRule { min: Some(10.0), max: Some(500.0), action: RangeAction::Clamp });
        let schema = DatasetSchema::for_kind(DatasetKind::Calendar).with_overrides(Some(&overrides)).unwrap();
        let price_rule = schema
            .rules
            .iter()
            .find_map(|r| match &r.action {
                FieldAction::Scalar { target, range, .. } if target == "price" => *range,
                _ => None,
            })
            .unwrap();
        assert_eq!(price_rule.max, Some(500.0));
    }

    #[test]
    fn test_range_override_rejects_unknown_column() {
        let mut overrides = BTreeMap::new();
        overrides.insert("reviewer_name".to_string(), RangeRule { min: Some(0.0), max: None, action: RangeAction::Null });
        let err = DatasetSchema::for_kind(DatasetKind::Reviews).with_overrides(Some(&overrides));
        assert!(matches!(err, Err(EtlError::Config(_))));
    }

    #[test]
    fn test_calendar_table_sql() {
        let spec = DatasetSchema::for_kind(DatasetKind::Calendar).table_spec();
        let ddl = spec.create_sql();
        assert!(ddl.contains("PRIMARY KEY (\"listing_id\", \"date\")"));
        assert!(ddl.contains("REFERENCES \"listings\" (\"listing_id\")"));

        let upsert = spec.upsert_sql();
        assert!(upsert.starts_with("INSERT INTO \"calendar\""));
        assert!(upsert.contains("ON CONFLICT (\"listing_id\", \"date\") DO UPDATE SET"));
        assert!(!upsert.contains("\"date\" = excluded"));
    }
}
