//! Declarative field-mapping descriptors.
//!
//! A descriptor tells the mapping engine how one tenant's source table
//! becomes one canonical resource type: which column is the row key, and
//! for each target field, which column(s) feed it and how. Descriptors are
//! data, produced by schema discovery and stored as JSON:
//!
//! ```json
//! {
//!   "tenant_id": "t1",
//!   "resource_type": "Encounter",
//!   "source_table": "admissions",
//!   "source_id_column": "admission_id",
//!   "source_system": "general-his",
//!   "fields": [
//!     { "target": "subject", "required": true,
//!       "transform": { "kind": "reference", "column": "patient_id", "target_type": "Patient" } },
//!     { "target": "status",
//!       "transform": { "kind": "code_lookup", "column": "state", "output": "code",
//!                      "codes": { "discharged": { "code": "finished" } } } },
//!     { "target": "period.start",
//!       "transform": { "kind": "temporal", "column": "admitted_at", "precision": "date_time" } }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::is_plain_identifier;
use crate::error::ConfigError;
use crate::source::SourceQuery;
use crate::tenant::TenantId;
use crate::types::{FieldPath, ResourceType};

/// How one source table maps onto one canonical resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingDescriptor {
    /// Tenant the descriptor applies to.
    pub tenant_id: TenantId,

    /// Canonical resource type produced.
    pub resource_type: ResourceType,

    /// Source table read.
    pub source_table: String,

    /// Column holding the row key (the source id).
    pub source_id_column: String,

    /// Tag recorded on every canonical resource produced.
    #[serde(default = "default_source_system")]
    pub source_system: String,

    /// System URI of the generated identifier. Defaults to
    /// `urn:helios:<tenant>:<table>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier_system: Option<String>,

    /// Field rules, applied in order.
    #[serde(default)]
    pub fields: Vec<FieldRule>,
}

fn default_source_system() -> String {
    "unknown".to_string()
}

fn default_separator() -> String {
    " ".to_string()
}

/// One target field and how to produce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Dotted path of the target field in the payload.
    pub target: FieldPath,

    /// How the value is produced.
    pub transform: Transform,

    /// Whether the row fails to map when no value can be produced.
    #[serde(default)]
    pub required: bool,
}

/// A transform kind and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// Copy one column as-is.
    DirectCopy {
        /// Source column.
        column: String,
    },

    /// Join the non-null values of several columns.
    Concatenate {
        /// Source columns, in output order.
        columns: Vec<String>,
        /// Joiner between values. Defaults to a single space.
        #[serde(default = "default_separator")]
        separator: String,
        /// Emit the values as an array instead of joining them.
        #[serde(default)]
        as_array: bool,
    },

    /// Map a local code to a standard coding.
    CodeLookup {
        /// Column holding the local code.
        column: String,
        /// Coding system applied to targets that do not name their own.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system: Option<String>,
        /// Local code to standard coding.
        #[serde(default)]
        codes: BTreeMap<String, CodeTarget>,
        /// Match local codes ignoring ASCII case and surrounding blanks.
        #[serde(default)]
        case_insensitive: bool,
        /// Shape written to the target.
        #[serde(default)]
        output: CodeOutput,
        /// Policy for codes with no entry and no fallback.
        #[serde(default)]
        unmapped: UnmappedCode,
        /// Target used for any code missing from `codes`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<CodeTarget>,
    },

    /// A measured value with its unit.
    UnitPassthrough {
        /// Column holding the value; numeric text is parsed.
        value_column: String,
        /// Column holding the unit.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit_column: Option<String>,
        /// Fixed unit used when there is no unit column.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        /// Unit system URI, written only alongside a unit.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system: Option<String>,
    },

    /// A fixed value.
    Constant {
        /// The value written.
        value: Value,
    },

    /// A logical reference to another resource of the same tenant.
    Reference {
        /// Column holding the referenced row's source id.
        column: String,
        /// Referenced resource type.
        target_type: ResourceType,
    },

    /// A date or date-time normalized to FHIR form.
    Temporal {
        /// Source column.
        column: String,
        /// Output precision.
        #[serde(default)]
        precision: TemporalPrecision,
    },
}

impl Transform {
    /// Returns the source columns this transform reads.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Transform::DirectCopy { column }
            | Transform::CodeLookup { column, .. }
            | Transform::Reference { column, .. }
            | Transform::Temporal { column, .. } => vec![column.as_str()],
            Transform::Concatenate { columns, .. } => columns.iter().map(String::as_str).collect(),
            Transform::UnitPassthrough {
                value_column,
                unit_column,
                ..
            } => std::iter::once(value_column.as_str())
                .chain(unit_column.as_deref())
                .collect(),
            Transform::Constant { .. } => Vec::new(),
        }
    }

    /// Returns the kind name as written in descriptors.
    pub fn kind(&self) -> &'static str {
        match self {
            Transform::DirectCopy { .. } => "direct_copy",
            Transform::Concatenate { .. } => "concatenate",
            Transform::CodeLookup { .. } => "code_lookup",
            Transform::UnitPassthrough { .. } => "unit_passthrough",
            Transform::Constant { .. } => "constant",
            Transform::Reference { .. } => "reference",
            Transform::Temporal { .. } => "temporal",
        }
    }
}

/// The coding a local code maps to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeTarget {
    /// Coding system URI; falls back to the lookup's `system`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Standard code.
    pub code: String,
    /// Human-readable display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// Shape a code lookup writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeOutput {
    /// A bare code string, for FHIR `code` fields such as `gender`.
    Code,
    /// A `{system, code, display}` coding.
    #[default]
    Coding,
    /// A `{coding: [...]}` codeable concept.
    CodeableConcept,
}

/// What a code lookup does with a code it has no entry for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedCode {
    /// Emit the local code without a system.
    #[default]
    Passthrough,
    /// Leave the target absent.
    Absent,
    /// Fail the row.
    Error,
}

/// Precision a temporal transform normalizes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalPrecision {
    /// `YYYY-MM-DD`.
    #[default]
    Date,
    /// RFC 3339 with seconds, or `YYYY-MM-DD` when the source has no time.
    DateTime,
}

impl MappingDescriptor {
    /// Returns the identifier system written into every payload.
    pub fn identifier_system(&self) -> String {
        self.identifier_system
            .clone()
            .unwrap_or_else(|| format!("urn:helios:{}:{}", self.tenant_id, self.source_table))
    }

    /// Returns every source column the descriptor reads, key column first.
    pub fn source_columns(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        std::iter::once(self.source_id_column.as_str())
            .chain(self.fields.iter().flat_map(|rule| rule.transform.columns()))
            .filter(|column| seen.insert(*column))
            .map(str::to_string)
            .collect()
    }

    /// Builds the source query for this descriptor.
    pub fn source_query(&self, batch_size: usize) -> SourceQuery {
        SourceQuery::new(
            self.tenant_id.clone(),
            &self.source_table,
            &self.source_id_column,
        )
        .with_columns(self.source_columns())
        .with_batch_size(batch_size)
    }

    /// Checks the descriptor against the resource type's fixed schema.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidDescriptor {
            resource_type: self.resource_type,
            message,
        };

        if !TenantId::is_valid(self.tenant_id.as_str()) {
            return Err(invalid(format!("invalid tenant id '{}'", self.tenant_id)));
        }
        for column in self.source_columns() {
            if !is_plain_identifier(&column) {
                return Err(invalid(format!("'{column}' is not a plain column name")));
            }
        }
        if !is_plain_identifier(&self.source_table) {
            return Err(invalid(format!(
                "'{}' is not a plain table name",
                self.source_table
            )));
        }

        let mut targets = BTreeSet::new();
        for rule in &self.fields {
            let root = rule.target.root();
            if root == "identifier" {
                return Err(invalid(
                    "'identifier' is generated from the source id and cannot be mapped".into(),
                ));
            }
            if !self.resource_type.allows_field(root) {
                return Err(invalid(format!(
                    "'{}' is not a field of {}",
                    rule.target, self.resource_type
                )));
            }
            if !targets.insert(rule.target.as_str()) {
                return Err(invalid(format!("'{}' is mapped twice", rule.target)));
            }
            match &rule.transform {
                Transform::Reference { target_type, .. }
                    if !self.resource_type.reference_targets().contains(target_type) =>
                {
                    return Err(invalid(format!(
                        "{} may not reference {target_type}",
                        self.resource_type
                    )));
                }
                Transform::Concatenate { columns, .. } if columns.is_empty() => {
                    return Err(invalid(format!(
                        "'{}' concatenates no columns",
                        rule.target
                    )));
                }
                _ => {}
            }
        }

        if self.resource_type.requires_patient() && self.patient_rule().is_none() {
            return Err(invalid(format!(
                "{} must carry a reference to Patient",
                self.resource_type
            )));
        }

        Ok(())
    }

    /// Returns the rule producing the Patient reference, if any.
    pub fn patient_rule(&self) -> Option<&FieldRule> {
        self.fields.iter().find(|rule| {
            matches!(
                rule.transform,
                Transform::Reference {
                    target_type: ResourceType::Patient,
                    ..
                }
            )
        })
    }
}
