//! Transform implementations.
//!
//! Each transform reads columns from a source row and produces either a
//! JSON value for the target field or nothing. Nothing means the data is
//! absent: null and missing columns never turn into empty strings or zeros.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Number, Value, json};

use crate::error::MappingError;
use crate::types::SourceRow;

use super::descriptor::{CodeOutput, CodeTarget, TemporalPrecision, Transform, UnmappedCode};

static LEADING_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([-+]?\d+(?:\.\d+)?)\s*(.*?)\s*$").expect("number pattern compiles")
});

const NAIVE_DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

/// Applies `transform` to `row` for the field at `target`.
pub(crate) fn apply(
    transform: &Transform,
    row: &SourceRow,
    target: &str,
) -> Result<Option<Value>, MappingError> {
    match transform {
        Transform::DirectCopy { column } => Ok(present(row, column).cloned()),

        Transform::Concatenate {
            columns,
            separator,
            as_array,
        } => {
            let parts: Vec<String> = columns
                .iter()
                .filter_map(|column| present(row, column).and_then(scalar_text))
                .filter(|part| !part.is_empty())
                .collect();
            if parts.is_empty() {
                Ok(None)
            } else if *as_array {
                Ok(Some(Value::from(parts)))
            } else {
                Ok(Some(Value::String(parts.join(separator))))
            }
        }

        Transform::CodeLookup {
            column,
            system,
            codes,
            case_insensitive,
            output,
            unmapped,
            fallback,
        } => {
            let Some(local) = present(row, column).and_then(scalar_text) else {
                return Ok(None);
            };

            let found = if *case_insensitive {
                let wanted = local.trim();
                codes
                    .iter()
                    .find(|(key, _)| key.trim().eq_ignore_ascii_case(wanted))
                    .map(|(_, target)| target)
            } else {
                codes.get(&local)
            };

            match found.or(fallback.as_ref()) {
                Some(code) => Ok(Some(render_code(code, system.as_deref(), *output))),
                None => match unmapped {
                    UnmappedCode::Passthrough => {
                        let code = CodeTarget {
                            system: None,
                            code: local,
                            display: None,
                        };
                        Ok(Some(render_code(&code, None, *output)))
                    }
                    UnmappedCode::Absent => Ok(None),
                    UnmappedCode::Error => Err(MappingError::InvalidValue {
                        field: target.to_string(),
                        message: format!("no mapping for local code '{local}'"),
                    }),
                },
            }
        }

        Transform::UnitPassthrough {
            value_column,
            unit_column,
            unit,
            system,
        } => {
            let Some(raw) = present(row, value_column) else {
                return Ok(None);
            };
            let (value, trailing_unit) = quantity_value(raw, target)?;
            let unit = unit_column
                .as_deref()
                .and_then(|column| present(row, column))
                .and_then(scalar_text)
                .filter(|u| !u.is_empty())
                .or_else(|| unit.clone())
                .or(trailing_unit);

            let mut quantity = Map::new();
            quantity.insert("value".to_string(), value);
            if let Some(unit) = unit {
                quantity.insert("unit".to_string(), Value::String(unit));
                if let Some(system) = system {
                    quantity.insert("system".to_string(), Value::String(system.clone()));
                }
            }
            Ok(Some(Value::Object(quantity)))
        }

        Transform::Constant { value } => Ok((!value.is_null()).then(|| value.clone())),

        Transform::Reference {
            column,
            target_type,
        } => Ok(present(row, column)
            .and_then(crate::source::key_string)
            .map(|id| {
                json!({
                    "type": target_type.as_str(),
                    "identifier": { "value": id }
                })
            })),

        Transform::Temporal { column, precision } => match present(row, column) {
            None => Ok(None),
            Some(raw) => normalize_temporal(raw, *precision)
                .map(|text| Some(Value::String(text)))
                .ok_or_else(|| MappingError::InvalidValue {
                    field: target.to_string(),
                    message: format!(
                        "'{}' is not a recognizable date or date-time",
                        scalar_text(raw).unwrap_or_else(|| raw.to_string())
                    ),
                }),
        },
    }
}

/// Returns the column value unless it is missing or null.
fn present<'a>(row: &'a SourceRow, column: &str) -> Option<&'a Value> {
    row.get(column).filter(|value| !value.is_null())
}

/// Renders a scalar as text; objects and arrays are not scalars.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn render_code(code: &CodeTarget, default_system: Option<&str>, output: CodeOutput) -> Value {
    if output == CodeOutput::Code {
        return Value::String(code.code.clone());
    }

    let mut coding = Map::new();
    if let Some(system) = code.system.as_deref().or(default_system) {
        coding.insert("system".to_string(), Value::String(system.to_string()));
    }
    coding.insert("code".to_string(), Value::String(code.code.clone()));
    if let Some(display) = &code.display {
        coding.insert("display".to_string(), Value::String(display.clone()));
    }

    match output {
        CodeOutput::CodeableConcept => json!({ "coding": [coding] }),
        _ => Value::Object(coding),
    }
}

/// Extracts a numeric quantity value, plus any unit text trailing it.
fn quantity_value(raw: &Value, target: &str) -> Result<(Value, Option<String>), MappingError> {
    if let Value::Number(n) = raw {
        return Ok((Value::Number(n.clone()), None));
    }

    let text = scalar_text(raw).unwrap_or_default();
    let invalid = || MappingError::InvalidValue {
        field: target.to_string(),
        message: format!("no numeric value in '{text}'"),
    };

    let captures = LEADING_NUMBER.captures(&text).ok_or_else(invalid)?;
    let number = &captures[1];
    let value = match number.parse::<i64>() {
        Ok(int) => Value::Number(int.into()),
        Err(_) => number
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(invalid)?,
    };
    let trailing = captures
        .get(2)
        .map(|m| m.as_str().to_string())
        .filter(|unit| !unit.is_empty());
    Ok((value, trailing))
}

/// Normalizes a date or date-time to FHIR form.
fn normalize_temporal(raw: &Value, precision: TemporalPrecision) -> Option<String> {
    let parsed = match raw {
        Value::Number(n) => Parsed::Instant(DateTime::<Utc>::from_timestamp(n.as_i64()?, 0)?),
        Value::String(s) => parse_temporal(s.trim())?,
        _ => return None,
    };

    Some(match (parsed, precision) {
        (Parsed::Date(date), _) => date.format("%Y-%m-%d").to_string(),
        (Parsed::Instant(instant), TemporalPrecision::Date) => {
            instant.date_naive().format("%Y-%m-%d").to_string()
        }
        (Parsed::Instant(instant), TemporalPrecision::DateTime) => {
            instant.to_rfc3339_opts(SecondsFormat::Secs, true)
        }
    })
}

enum Parsed {
    Date(NaiveDate),
    Instant(DateTime<Utc>),
}

fn parse_temporal(text: &str) -> Option<Parsed> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
        return Some(Parsed::Instant(instant.with_timezone(&Utc)));
    }
    // Source systems without zone information record local wall time; it is
    // taken as UTC.
    for format in NAIVE_DATE_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Parsed::Instant(naive.and_utc()));
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        .map(Parsed::Date)
}
