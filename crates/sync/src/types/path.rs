//! Dotted paths into canonical payloads.
//!
//! A path is a sequence of object keys, each optionally followed by an array
//! index: `name[0].given`, `valueQuantity.unit`, `subject`. Mapping rules
//! name their target with one, and resource links remember where in the
//! payload their reference object lives.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Returned when a path string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid field path '{path}': {message}")]
pub struct InvalidPath {
    /// The offending path.
    pub path: String,
    /// What is wrong with it.
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed payload path.
///
/// # Examples
///
/// ```
/// use helios_sync::types::FieldPath;
/// use serde_json::{json, Value};
///
/// let path: FieldPath = "name[0].given".parse().unwrap();
/// assert_eq!(path.root(), "name");
///
/// let mut payload = Value::Null;
/// path.set(&mut payload, json!(["Ali"])).unwrap();
/// assert_eq!(payload, json!({"name": [{"given": ["Ali"]}]}));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parses a dotted path.
    pub fn parse(path: &str) -> Result<Self, InvalidPath> {
        let invalid = |message: &str| InvalidPath {
            path: path.to_string(),
            message: message.to_string(),
        };

        if path.is_empty() {
            return Err(invalid("path is empty"));
        }

        let mut segments = Vec::new();
        for part in path.split('.') {
            let (key, mut rest) = match part.find('[') {
                Some(idx) => (&part[..idx], &part[idx..]),
                None => (part, ""),
            };
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(invalid("segments must be non-empty identifiers"));
            }
            segments.push(Segment::Key(key.to_string()));

            while !rest.is_empty() {
                let close = rest.find(']').ok_or_else(|| invalid("unclosed '['"))?;
                if !rest.starts_with('[') {
                    return Err(invalid("unexpected text after ']'"));
                }
                let index = rest[1..close]
                    .parse::<usize>()
                    .map_err(|_| invalid("array index must be a non-negative integer"))?;
                segments.push(Segment::Index(index));
                rest = &rest[close + 1..];
            }
        }

        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    /// Returns the top-level payload field this path writes into.
    pub fn root(&self) -> &str {
        match self.segments.first() {
            Some(Segment::Key(key)) => key,
            _ => "",
        }
    }

    /// Returns the path as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Writes `value` at this path, creating intermediate objects and arrays.
    ///
    /// Array slots skipped over are filled with `null`; callers compact them
    /// with [`prune_nulls`] once the payload is complete.
    pub fn set(&self, target: &mut Value, value: Value) -> Result<(), InvalidPath> {
        set_in(target, &self.segments, value).map_err(|message| InvalidPath {
            path: self.raw.clone(),
            message,
        })
    }

    /// Returns a mutable reference to the value at this path, if present.
    pub fn get_mut<'a>(&self, target: &'a mut Value) -> Option<&'a mut Value> {
        let mut current = target;
        for segment in &self.segments {
            current = match segment {
                Segment::Key(key) => current.as_object_mut()?.get_mut(key)?,
                Segment::Index(index) => current.as_array_mut()?.get_mut(*index)?,
            };
        }
        Some(current)
    }
}

fn set_in(current: &mut Value, segments: &[Segment], value: Value) -> Result<(), String> {
    let Some((first, rest)) = segments.split_first() else {
        *current = value;
        return Ok(());
    };

    match first {
        Segment::Key(key) => {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            let object = current
                .as_object_mut()
                .ok_or_else(|| format!("'{key}' addressed inside a non-object value"))?;
            let slot = object.entry(key.clone()).or_insert(Value::Null);
            set_in(slot, rest, value)
        }
        Segment::Index(index) => {
            if current.is_null() {
                *current = Value::Array(Vec::new());
            }
            let array = current
                .as_array_mut()
                .ok_or_else(|| format!("index [{index}] applied to a non-array value"))?;
            while array.len() <= *index {
                array.push(Value::Null);
            }
            set_in(&mut array[*index], rest, value)
        }
    }
}

/// Removes `null` members and array slots, then drops objects and arrays left
/// empty by that, so absent data stays absent instead of becoming `null`.
pub fn prune_nulls(value: &mut Value) {
    match value {
        Value::Object(object) => {
            for child in object.values_mut() {
                prune_nulls(child);
            }
            object.retain(|_, child| !is_vacant(child));
        }
        Value::Array(array) => {
            for child in array.iter_mut() {
                prune_nulls(child);
            }
            array.retain(|child| !is_vacant(child));
        }
        _ => {}
    }
}

fn is_vacant(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(object) => object.is_empty(),
        Value::Array(array) => array.is_empty(),
        _ => false,
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for FieldPath {
    type Err = InvalidPath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldPath::parse(s)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        FieldPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_segments() {
        let path = FieldPath::parse("name[0].given[1]").unwrap();
        assert_eq!(path.root(), "name");
        assert_eq!(path.segments.len(), 4);

        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("name..given").is_err());
        assert!(FieldPath::parse("name[x]").is_err());
        assert!(FieldPath::parse("name[0").is_err());
        assert!(FieldPath::parse("name[0]x").is_err());
    }

    #[test]
    fn test_set_nested() {
        let mut payload = json!({"resourceType": "Patient"});
        FieldPath::parse("name[0].family")
            .unwrap()
            .set(&mut payload, json!("Khan"))
            .unwrap();
        FieldPath::parse("name[0].given")
            .unwrap()
            .set(&mut payload, json!(["Ali"]))
            .unwrap();
        assert_eq!(
            payload,
            json!({"resourceType": "Patient", "name": [{"family": "Khan", "given": ["Ali"]}]})
        );
    }

    #[test]
    fn test_set_conflicting_shape_fails() {
        let mut payload = json!({"gender": "male"});
        let err = FieldPath::parse("gender.code")
            .unwrap()
            .set(&mut payload, json!("m"))
            .unwrap_err();
        assert!(err.message.contains("non-object"));
    }

    #[test]
    fn test_get_mut() {
        let mut payload = json!({"subject": {"type": "Patient"}});
        let path = FieldPath::parse("subject").unwrap();
        path.get_mut(&mut payload)
            .unwrap()
            .as_object_mut()
            .unwrap()
            .insert("reference".into(), json!("Patient/abc"));
        assert_eq!(payload["subject"]["reference"], "Patient/abc");
        assert!(FieldPath::parse("encounter").unwrap().get_mut(&mut payload).is_none());
    }

    #[test]
    fn test_prune_nulls() {
        let mut payload = json!({
            "name": [null, {"given": [null, "Ali"], "family": null}],
            "telecom": [{"value": null}],
            "gender": "male"
        });
        prune_nulls(&mut payload);
        assert_eq!(payload, json!({"name": [{"given": ["Ali"]}], "gender": "male"}));
    }

    #[test]
    fn test_serde_as_string() {
        let path: FieldPath = serde_json::from_str("\"valueQuantity.unit\"").unwrap();
        assert_eq!(path.root(), "valueQuantity");
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"valueQuantity.unit\"");
        assert!(serde_json::from_str::<FieldPath>("\"a[\"").is_err());
    }
}
