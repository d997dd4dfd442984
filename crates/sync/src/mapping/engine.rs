//! The mapping engine: source row in, canonical document out.

use serde_json::{Value, json};

use crate::error::MappingError;
use crate::source::SourceRecord;
use crate::tenant::TenantId;
use crate::types::{
    CanonicalDocument, NaturalKey, ResourceLink, ResourceType, SourceRow, prune_nulls,
};

use super::descriptor::{MappingDescriptor, Transform};
use super::transforms;

/// Maps a source record with its descriptor.
///
/// See [`map_row`].
pub fn map_record(
    descriptor: &MappingDescriptor,
    record: &SourceRecord,
) -> Result<CanonicalDocument, MappingError> {
    map_row(descriptor, &record.source_id, &record.row)
}

/// Maps one source row to a canonical document.
///
/// The payload always carries `resourceType` and an `identifier` built from
/// the descriptor's identifier system and the source id. Field rules are
/// applied in order; a rule that produces nothing leaves its target absent
/// unless the rule is required. Dependent resource types must end up with a
/// Patient reference.
///
/// Pure and deterministic: the same row and descriptor always give a
/// byte-identical payload.
///
/// # Errors
///
/// * `MappingError::MissingRequired` - the tenant, the source id, a required
///   rule's value or the Patient reference could not be produced
/// * `MappingError::InvalidValue` - a transform rejected its input
///
/// # Example
///
/// ```
/// use helios_sync::mapping::{MappingDescriptor, map_row};
/// use serde_json::json;
///
/// let descriptor: MappingDescriptor = serde_json::from_value(json!({
///     "tenant_id": "t1",
///     "resource_type": "Patient",
///     "source_table": "patients",
///     "source_id_column": "patient_id",
///     "fields": [
///         {"target": "gender", "transform": {"kind": "direct_copy", "column": "gender"}},
///         {"target": "birthDate", "transform": {"kind": "direct_copy", "column": "dob"}}
///     ]
/// })).unwrap();
///
/// let row = json!({"patient_id": "P100", "gender": "male", "dob": null})
///     .as_object().unwrap().clone().into_iter().collect();
/// let doc = map_row(&descriptor, "P100", &row).unwrap();
///
/// assert_eq!(doc.payload["resourceType"], "Patient");
/// assert_eq!(doc.payload["gender"], "male");
/// assert!(doc.payload.get("birthDate").is_none());
/// ```
pub fn map_row(
    descriptor: &MappingDescriptor,
    source_id: &str,
    row: &SourceRow,
) -> Result<CanonicalDocument, MappingError> {
    if !TenantId::is_valid(descriptor.tenant_id.as_str()) {
        return Err(MappingError::MissingRequired {
            field: "tenant".to_string(),
        });
    }
    let source_id = source_id.trim();
    if source_id.is_empty() {
        return Err(MappingError::MissingRequired {
            field: "identifier".to_string(),
        });
    }

    let resource_type = descriptor.resource_type;
    let mut payload = json!({
        "resourceType": resource_type.as_str(),
        "identifier": [{
            "system": descriptor.identifier_system(),
            "value": source_id,
        }],
    });
    let mut links = Vec::new();

    for rule in &descriptor.fields {
        let field = rule.target.as_str();
        let value = transforms::apply(&rule.transform, row, field)?;

        let Some(value) = value else {
            if rule.required || is_patient_reference(&rule.transform) {
                return Err(MappingError::MissingRequired {
                    field: field.to_string(),
                });
            }
            continue;
        };

        if let Transform::Reference { target_type, .. } = &rule.transform {
            links.push(ResourceLink {
                path: rule.target.clone(),
                target_type: *target_type,
                target_source_id: reference_id(&value),
            });
        }

        rule.target
            .set(&mut payload, value)
            .map_err(|e| MappingError::InvalidValue {
                field: field.to_string(),
                message: e.message,
            })?;
    }

    prune_nulls(&mut payload);

    if resource_type.requires_patient()
        && !links
            .iter()
            .any(|link| link.target_type == ResourceType::Patient)
    {
        return Err(MappingError::MissingRequired {
            field: descriptor
                .patient_rule()
                .map_or("subject", |rule| rule.target.as_str())
                .to_string(),
        });
    }

    Ok(CanonicalDocument {
        key: NaturalKey::new(descriptor.tenant_id.clone(), resource_type, source_id),
        payload,
        links,
        source_system: descriptor.source_system.clone(),
    })
}

fn is_patient_reference(transform: &Transform) -> bool {
    matches!(
        transform,
        Transform::Reference {
            target_type: ResourceType::Patient,
            ..
        }
    )
}

fn reference_id(reference: &Value) -> String {
    reference["identifier"]["value"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MappingError;
    use crate::source::row_from_value;
    use serde_json::json;

    fn patient() -> MappingDescriptor {
        serde_json::from_value(json!({
            "tenant_id": "t1",
            "resource_type": "Patient",
            "source_table": "patients",
            "source_id_column": "patient_id",
            "source_system": "general-his",
            "fields": [
                {"target": "name[0].text",
                 "transform": {"kind": "direct_copy", "column": "name"}},
                {"target": "name[0].given",
                 "transform": {"kind": "concatenate", "columns": ["first_name"], "as_array": true}},
                {"target": "gender",
                 "transform": {"kind": "code_lookup", "column": "gender", "output": "code",
                               "case_insensitive": true,
                               "codes": {"m": {"code": "male"}, "male": {"code": "male"},
                                         "f": {"code": "female"}},
                               "fallback": {"code": "unknown"}}},
                {"target": "birthDate",
                 "transform": {"kind": "temporal", "column": "dob"}},
                {"target": "active",
                 "transform": {"kind": "constant", "value": true}}
            ]
        }))
        .unwrap()
    }

    fn observation() -> MappingDescriptor {
        serde_json::from_value(json!({
            "tenant_id": "t1",
            "resource_type": "Observation",
            "source_table": "lab_results",
            "source_id_column": "lab_id",
            "fields": [
                {"target": "subject",
                 "transform": {"kind": "reference", "column": "patient_id", "target_type": "Patient"}},
                {"target": "encounter",
                 "transform": {"kind": "reference", "column": "visit_id", "target_type": "Encounter"}},
                {"target": "code.text", "required": true,
                 "transform": {"kind": "direct_copy", "column": "test_name"}},
                {"target": "valueQuantity",
                 "transform": {"kind": "unit_passthrough", "value_column": "result", "unit_column": "unit"}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_maps_patient_row() {
        let row = row_from_value(json!({
            "patient_id": "P100",
            "name": "Ali Khan",
            "first_name": "Ali",
            "gender": "male",
            "dob": "1995-04-12"
        }));
        let doc = map_row(&patient(), "P100", &row).unwrap();

        assert_eq!(doc.key, NaturalKey::new("t1", ResourceType::Patient, "P100"));
        assert_eq!(doc.source_system, "general-his");
        assert!(doc.links.is_empty());
        assert_eq!(
            doc.payload,
            json!({
                "resourceType": "Patient",
                "identifier": [{"system": "urn:helios:t1:patients", "value": "P100"}],
                "name": [{"text": "Ali Khan", "given": ["Ali"]}],
                "gender": "male",
                "birthDate": "1995-04-12",
                "active": true
            })
        );
    }

    #[test]
    fn test_null_fields_stay_absent() {
        let row = row_from_value(json!({
            "patient_id": "P1", "name": null, "first_name": null, "gender": "F", "dob": null
        }));
        let doc = map_row(&patient(), "P1", &row).unwrap();
        assert!(doc.payload.get("name").is_none());
        assert!(doc.payload.get("birthDate").is_none());
        assert_eq!(doc.payload["gender"], "female");
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let row = row_from_value(json!({
            "patient_id": "P2", "name": "Sara Ahmed", "first_name": "Sara",
            "gender": "f", "dob": "1980-01-02"
        }));
        let first = map_row(&patient(), "P2", &row).unwrap();
        let second = map_row(&patient(), "P2", &row.clone()).unwrap();
        assert_eq!(first.payload_bytes(), second.payload_bytes());
    }

    #[test]
    fn test_missing_source_id() {
        let err = map_row(&patient(), "  ", &SourceRow::new()).unwrap_err();
        assert_eq!(err.field(), "identifier");
    }

    #[test]
    fn test_references_become_links() {
        let row = row_from_value(json!({
            "lab_id": "L1", "patient_id": "P100", "visit_id": null,
            "test_name": "Glucose", "result": "5.4", "unit": "mmol/L"
        }));
        let doc = map_row(&observation(), "L1", &row).unwrap();

        assert_eq!(doc.links.len(), 1);
        assert_eq!(doc.links[0].target_type, ResourceType::Patient);
        assert_eq!(doc.links[0].target_source_id, "P100");
        assert_eq!(doc.links[0].path.as_str(), "subject");
        assert_eq!(
            doc.payload["subject"],
            json!({"type": "Patient", "identifier": {"value": "P100"}})
        );
        assert!(doc.payload.get("encounter").is_none());
        assert_eq!(doc.payload["valueQuantity"]["value"], 5.4);
    }

    #[test]
    fn test_missing_patient_reference_fails() {
        let row = row_from_value(json!({
            "lab_id": "L2", "patient_id": null, "visit_id": "E1",
            "test_name": "Glucose", "result": null, "unit": null
        }));
        let err = map_row(&observation(), "L2", &row).unwrap_err();
        assert!(matches!(err, MappingError::MissingRequired { ref field } if field == "subject"));
    }

    #[test]
    fn test_required_rule_fails_when_absent() {
        let row = row_from_value(json!({
            "lab_id": "L3", "patient_id": "P1", "visit_id": null,
            "test_name": null, "result": "1", "unit": null
        }));
        let err = map_row(&observation(), "L3", &row).unwrap_err();
        assert_eq!(err.field(), "code.text");
    }
}
