//! Type Normalizer: turns one raw field value of unknown shape into scalar
//! target values according to the column's declared rule.

mod literal;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::domain::Scalar;
use crate::schema::{ColumnType, FieldAction, DATE_PART_SUFFIXES};

pub use literal::parse_literal;

/// What the normalizer did to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Applied {
    PassThrough,
    Coerced,
    CoercionFailed,
    Joined,
    Counted,
    Flagged,
    Flattened,
    Serialized,
    Null,
    Dropped,
}

/// Scalar output of one field rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    /// One value per target column of the rule.
    pub values: Vec<Scalar>,
    pub applied: Applied,
    /// Text content was altered by whitespace/markup normalization.
    pub text_changed: bool,
    /// A non-null source value produced a null primary output.
    pub nulled: bool,
    /// Data-quality warning for this field, if any.
    pub warning: Option<String>,
}

impl Normalized {
    fn new(values: Vec<Scalar>, applied: Applied) -> Self {
        Self { values, applied, text_changed: false, nulled: false, warning: None }
    }

    fn failed(width: usize, warning: String) -> Self {
        Self {
            values: vec![Scalar::Null; width],
            applied: Applied::CoercionFailed,
            text_changed: false,
            nulled: true,
            warning: Some(warning),
        }
    }
}

static CRLF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r\n?").expect("valid regex"));
static BREAK_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid regex"));
static HORIZONTAL_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{00A0}]+").expect("valid regex"));
static LINE_EDGE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r" ?\n ?").expect("valid regex"));

const NULL_MARKERS: [&str; 7] = ["nan", "NaN", "None", "null", "NULL", "N/A", "NaT"];

/// Decode one raw CSV cell into a value of unknown shape.
pub fn parse_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() || NULL_MARKERS.contains(&trimmed) {
        return Value::Null;
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
            return v;
        }
        if let Ok(v) = parse_literal(trimmed) {
            return v;
        }
    }
    Value::String(raw.to_string())
}

/// Deterministic text cleanup. Returns `None` when nothing but whitespace remains.
pub fn normalize_text(raw: &str) -> Option<String> {
    let text = CRLF.replace_all(raw, "\n");
    let text = BREAK_TAG.replace_all(&text, "\n");
    let text = HORIZONTAL_WS.replace_all(&text, " ");
    let text: String = text.chars().filter(|c| *c == '\n' || !c.is_control()).collect();
    let text = LINE_EDGE_WS.replace_all(&text, "\n");
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Strip MongoDB extended-JSON wrappers such as `{"$numberDecimal": "12.50"}`.
fn unwrap_extended(value: &Value) -> &Value {
    if let Value::Object(map) = value {
        if map.len() == 1 {
            if let Some((key, inner)) = map.iter().next() {
                if matches!(
                    key.as_str(),
                    "$date" | "$numberDecimal" | "$numberInt" | "$numberLong" | "$numberDouble" | "$oid"
                ) {
                    return unwrap_extended(inner);
                }
            }
        }
    }
    value
}

/// Apply a field rule to a raw value.
pub fn normalize_field(action: &FieldAction, value: &Value) -> Normalized {
    let value = unwrap_extended(value);
    match action {
        FieldAction::Scalar { ty, .. } => normalize_scalar(value, *ty),
        FieldAction::Date { parts, .. } => normalize_date(value, *parts),
        FieldAction::Join { delimiter, .. } => normalize_join(value, delimiter),
        FieldAction::Count { .. } => normalize_count(value),
        FieldAction::Flags { values, .. } => normalize_flags(value, values),
        FieldAction::Flatten { keys, .. } => normalize_flatten(value, keys),
        FieldAction::Canonical { .. } => normalize_canonical(value),
        FieldAction::Drop => Normalized::new(Vec::new(), Applied::Dropped),
    }
}

fn text_value(raw: &str) -> Normalized {
    match normalize_text(raw) {
        Some(clean) => {
            let changed = clean != raw;
            let mut out = Normalized::new(vec![Scalar::Text(clean)], Applied::PassThrough);
            out.text_changed = changed;
            out
        }
        None => {
            let mut out = Normalized::new(vec![Scalar::Null], Applied::Null);
            out.nulled = true;
            out
        }
    }
}

/// Render a list item or mapping member as text; nested values become canonical JSON.
fn item_text(value: &Value) -> Option<String> {
    match unwrap_extended(value) {
        Value::Null => None,
        Value::String(s) => normalize_text(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        nested => Some(canonical_json(nested)),
    }
}

fn normalize_scalar(value: &Value, ty: ColumnType) -> Normalized {
    if value.is_null() {
        return Normalized::new(vec![Scalar::Null], Applied::Null);
    }
    if ty == ColumnType::Text {
        return match value {
            Value::String(s) => text_value(s),
            Value::Bool(b) => Normalized::new(vec![Scalar::Text(b.to_string())], Applied::Coerced),
            Value::Number(n) => Normalized::new(vec![Scalar::Text(n.to_string())], Applied::Coerced),
            nested => Normalized::new(vec![Scalar::Text(canonical_json(nested))], Applied::Serialized),
        };
    }
    if ty == ColumnType::Date {
        return match coerce_date(value) {
            Some(d) => Normalized::new(vec![Scalar::Text(d.format("%Y-%m-%d").to_string())], Applied::Coerced),
            None => Normalized::failed(1, format!("not a date: {}", describe(value))),
        };
    }
    match coerce(value, ty) {
        Ok(scalar) => {
            let applied = if value.is_string() { Applied::Coerced } else { Applied::PassThrough };
            Normalized::new(vec![scalar], applied)
        }
        Err(reason) => Normalized::failed(1, reason),
    }
}

fn coerce(value: &Value, ty: ColumnType) -> Result<Scalar, String> {
    match (ty, value) {
        (ColumnType::Boolean, Value::Bool(b)) => Ok(Scalar::Bool(*b)),
        (ColumnType::Boolean, Value::Number(n)) => match n.as_i64() {
            Some(0) => Ok(Scalar::Bool(false)),
            Some(1) => Ok(Scalar::Bool(true)),
            _ => Err(format!("not a boolean: {n}")),
        },
        (ColumnType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "1" | "yes" | "y" => Ok(Scalar::Bool(true)),
            "f" | "false" | "0" | "no" | "n" => Ok(Scalar::Bool(false)),
            _ => Err(format!("not a boolean: {s:?}")),
        },
        (ColumnType::Integer, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().and_then(integral))
            .map(Scalar::Int)
            .ok_or_else(|| format!("not an integer: {n}")),
        (ColumnType::Integer, Value::String(s)) => {
            let t = s.trim();
            t.parse::<i64>()
                .ok()
                .or_else(|| t.parse::<f64>().ok().and_then(integral))
                .map(Scalar::Int)
                .ok_or_else(|| format!("not an integer: {s:?}"))
        }
        (ColumnType::Real | ColumnType::Currency | ColumnType::Percent, Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .map(Scalar::Float)
            .ok_or_else(|| format!("not a number: {n}")),
        (ColumnType::Real | ColumnType::Currency | ColumnType::Percent, Value::String(s)) => {
            let cleaned: String = match ty {
                ColumnType::Currency => s.chars().filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace()).collect(),
                ColumnType::Percent => s.chars().filter(|c| *c != '%' && !c.is_whitespace()).collect(),
                _ => s.trim().to_string(),
            };
            cleaned
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Scalar::Float)
                .ok_or_else(|| format!("not a number: {s:?}"))
        }
        (_, other) => Err(format!("cannot coerce {} to {ty:?}", describe(other))),
    }
}

fn integral(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
        Some(f as i64)
    } else {
        None
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Array(_) => "list".to_string(),
        Value::Object(_) => "mapping".to_string(),
        Value::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}

/// Parse the date formats seen in extracted dumps.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|d| d.date_naive()))
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok().map(|d| d.date()))
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok().map(|d| d.date()))
        .or_else(|| NaiveDate::parse_from_str(s, "%m/%d/%Y").ok())
}

fn coerce_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(s) => parse_date(s),
        // epoch milliseconds, as stored in `$date`
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|d| d.date_naive()),
        _ => None,
    }
}

fn normalize_date(value: &Value, parts: bool) -> Normalized {
    let width = if parts { 1 + DATE_PART_SUFFIXES.len() } else { 1 };
    if value.is_null() {
        return Normalized::new(vec![Scalar::Null; width], Applied::Null);
    }
    let Some(date) = coerce_date(value) else {
        return Normalized::failed(width, format!("not a date: {}", describe(value)));
    };
    let mut values = vec![Scalar::Text(date.format("%Y-%m-%d").to_string())];
    if parts {
        values.push(Scalar::Int(i64::from(date.year())));
        values.push(Scalar::Int(i64::from(date.month())));
        values.push(Scalar::Int(i64::from(date.day())));
        values.push(Scalar::Int(i64::from((date.month() - 1) / 3 + 1)));
        values.push(Scalar::Text(date.format("%A").to_string()));
    }
    Normalized::new(values, Applied::Coerced)
}

fn normalize_join(value: &Value, delimiter: &str) -> Normalized {
    match value {
        Value::Null => Normalized::new(vec![Scalar::Null], Applied::Null),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(item_text).collect();
            if parts.is_empty() {
                Normalized::new(vec![Scalar::Null], Applied::Joined)
            } else {
                Normalized::new(vec![Scalar::Text(parts.join(delimiter))], Applied::Joined)
            }
        }
        Value::String(s) => text_value(s),
        Value::Object(_) => Normalized::new(vec![Scalar::Text(canonical_json(value))], Applied::Serialized),
        other => Normalized::new(vec![Scalar::Text(other.to_string())], Applied::Coerced),
    }
}

fn normalize_count(value: &Value) -> Normalized {
    let count = match value {
        Value::Null => return Normalized::new(vec![Scalar::Null], Applied::Null),
        Value::Array(items) => items.iter().filter(|v| !v.is_null()).count(),
        Value::Object(map) => map.len(),
        Value::String(s) if s.trim().is_empty() => 0,
        _ => 1,
    };
    Normalized::new(vec![Scalar::Int(count as i64)], Applied::Counted)
}

fn normalize_flags(value: &Value, declared: &[String]) -> Normalized {
    let present: Vec<String> = match value {
        Value::Null => return Normalized::new(vec![Scalar::Null; declared.len()], Applied::Null),
        Value::Array(items) => items.iter().filter_map(item_text).map(|s| s.to_lowercase()).collect(),
        Value::String(s) => normalize_text(s).map(|s| vec![s.to_lowercase()]).unwrap_or_default(),
        other => {
            return Normalized::failed(declared.len(), format!("expected a list, found {}", describe(other)));
        }
    };
    let values = declared
        .iter()
        .map(|d| Scalar::Bool(present.iter().any(|p| *p == d.to_lowercase())))
        .collect();
    Normalized::new(values, Applied::Flagged)
}

fn normalize_flatten(value: &Value, keys: &[String]) -> Normalized {
    match value {
        Value::Null => Normalized::new(vec![Scalar::Null; keys.len()], Applied::Null),
        Value::Object(map) => {
            let values = keys
                .iter()
                .map(|k| map.get(k).and_then(item_text).map(Scalar::Text).unwrap_or(Scalar::Null))
                .collect();
            Normalized::new(values, Applied::Flattened)
        }
        other => Normalized::failed(keys.len(), format!("expected a mapping, found {}", describe(other))),
    }
}

fn normalize_canonical(value: &Value) -> Normalized {
    match value {
        Value::Null => Normalized::new(vec![Scalar::Null], Applied::Null),
        Value::String(s) => text_value(s),
        Value::Array(_) | Value::Object(_) => {
            Normalized::new(vec![Scalar::Text(canonical_json(value))], Applied::Serialized)
        }
        other => Normalized::new(vec![Scalar::Text(other.to_string())], Applied::Coerced),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::LIST_DELIMITER;
    use serde_json::json;

    fn join_rule() -> FieldAction {
        FieldAction::Join { target: "amenities".into(), delimiter: LIST_DELIMITER.into() }
    }

    fn scalar_rule(ty: ColumnType) -> FieldAction {
        FieldAction::Scalar { target: "x".into(), ty, range: None }
    }

    #[test]
    fn test_parse_cell_shapes() {
        assert_eq!(parse_cell(""), Value::Null);
        assert_eq!(parse_cell("  NaN "), Value::Null);
        assert_eq!(parse_cell("[\"wifi\",\"pool\"]"), json!(["wifi", "pool"]));
        assert_eq!(parse_cell("['wifi', 'pool']"), json!(["wifi", "pool"]));
        assert_eq!(parse_cell("[not a list"), json!("[not a list"));
        assert_eq!(parse_cell("Lovely flat"), json!("Lovely flat"));
    }

    #[test]
    fn test_deeply_nested_cell_falls_back_to_text() {
        // blocking-pool sized stack
        let handle = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(|| parse_cell(&"[".repeat(200_000)))
            .unwrap();
        let value = handle.join().unwrap();
        assert_eq!(value.as_str().map(str::len), Some(200_000));
    }

    #[test]
    fn test_join_preserves_source_order() {
        let out = normalize_field(&join_rule(), &json!(["wifi", "pool"]));
        assert_eq!(out.values, vec![Scalar::Text("wifi,pool".into())]);
        assert_eq!(out.applied, Applied::Joined);
    }

    #[test]
    fn test_join_of_empty_list_is_null_but_count_is_zero() {
        let joined = normalize_field(&join_rule(), &json!([]));
        assert_eq!(joined.values, vec![Scalar::Null]);

        let counted = normalize_field(&FieldAction::Count { target: "amenities_count".into() }, &json!([]));
        assert_eq!(counted.values, vec![Scalar::Int(0)]);
    }

    #[test]
    fn test_null_stays_null() {
        for rule in [join_rule(), scalar_rule(ColumnType::Integer), scalar_rule(ColumnType::Text)] {
            let out = normalize_field(&rule, &Value::Null);
            assert_eq!(out.values, vec![Scalar::Null]);
            assert!(!out.nulled);
            assert!(out.warning.is_none());
        }
    }

    #[test]
    fn test_numeric_coercion() {
        let out = normalize_field(&scalar_rule(ColumnType::Integer), &json!("42"));
        assert_eq!(out.values, vec![Scalar::Int(42)]);
        assert_eq!(out.applied, Applied::Coerced);

        let out = normalize_field(&scalar_rule(ColumnType::Integer), &json!("3.0"));
        assert_eq!(out.values, vec![Scalar::Int(3)]);

        let out = normalize_field(&scalar_rule(ColumnType::Currency), &json!("$1,250.00"));
        assert_eq!(out.values, vec![Scalar::Float(1250.0)]);

        let out = normalize_field(&scalar_rule(ColumnType::Percent), &json!("93%"));
        assert_eq!(out.values, vec![Scalar::Float(93.0)]);

        let out = normalize_field(&scalar_rule(ColumnType::Currency), &json!({"$numberDecimal": "80.00"}));
        assert_eq!(out.values, vec![Scalar::Float(80.0)]);
    }

    #[test]
    fn test_coercion_failure_yields_null_and_warning() {
        let out = normalize_field(&scalar_rule(ColumnType::Integer), &json!("two"));
        assert_eq!(out.values, vec![Scalar::Null]);
        assert_eq!(out.applied, Applied::CoercionFailed);
        assert!(out.nulled);
        assert!(out.warning.is_some());

        let out = normalize_field(&scalar_rule(ColumnType::Real), &json!(["1"]));
        assert_eq!(out.applied, Applied::CoercionFailed);
    }

    #[test]
    fn test_boolean_coercion() {
        let rule = scalar_rule(ColumnType::Boolean);
        assert_eq!(normalize_field(&rule, &json!("t")).values, vec![Scalar::Bool(true)]);
        assert_eq!(normalize_field(&rule, &json!("FALSE")).values, vec![Scalar::Bool(false)]);
        assert_eq!(normalize_field(&rule, &json!(true)).values, vec![Scalar::Bool(true)]);
        assert_eq!(normalize_field(&rule, &json!("maybe")).applied, Applied::CoercionFailed);
    }

    #[test]
    fn test_date_with_parts() {
        let rule = FieldAction::Date { target: "date".into(), parts: true };
        let out = normalize_field(&rule, &json!("2019-08-17T00:00:00Z"));
        assert_eq!(
            out.values,
            vec![
                Scalar::Text("2019-08-17".into()),
                Scalar::Int(2019),
                Scalar::Int(8),
                Scalar::Int(17),
                Scalar::Int(3),
                Scalar::Text("Saturday".into()),
            ]
        );

        let mongo = normalize_field(&rule, &json!({"$date": 1_565_999_999_000_i64}));
        assert_eq!(mongo.values[0], Scalar::Text("2019-08-16".into()));
    }

    #[test]
    fn test_flags_are_case_insensitive_and_null_aware() {
        let declared = vec!["Wifi".to_string(), "Pool".to_string(), "Air conditioning".to_string()];
        let rule = FieldAction::Flags { prefix: "amenity_".into(), values: declared };
        let out = normalize_field(&rule, &json!(["wifi", "Air Conditioning"]));
        assert_eq!(out.values, vec![Scalar::Bool(true), Scalar::Bool(false), Scalar::Bool(true)]);

        let out = normalize_field(&rule, &Value::Null);
        assert_eq!(out.values, vec![Scalar::Null, Scalar::Null, Scalar::Null]);
    }

    #[test]
    fn test_flatten_fixed_keys() {
        let rule = FieldAction::Flatten { prefix: "address_".into(), keys: vec!["street".into(), "country".into()] };
        let out = normalize_field(&rule, &json!({"street": " Porto ", "suburb": "x"}));
        assert_eq!(out.values, vec![Scalar::Text("Porto".into()), Scalar::Null]);

        let out = normalize_field(&rule, &json!("Porto"));
        assert_eq!(out.applied, Applied::CoercionFailed);
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let rule = FieldAction::Canonical { target: "location".into() };
        let a = normalize_field(&rule, &json!({"type": "Point", "coordinates": [-8.6, 41.1]}));
        let b = normalize_field(&rule, &parse_cell("{'coordinates': [-8.6, 41.1], 'type': 'Point'}"));
        assert_eq!(a.values, b.values);
        assert_eq!(a.values[0], Scalar::Text(r#"{"coordinates":[-8.6,41.1],"type":"Point"}"#.into()));
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Cozy \t  room<br />near   beach\r\n "), Some("Cozy room\nnear beach".into()));
        assert_eq!(normalize_text(" \t "), None);
        assert_eq!(normalize_text("a\u{0}b"), Some("ab".into()));
    }
}
