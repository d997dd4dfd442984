//! Mapping descriptors and source rows for sync tests.
//!
//! The descriptors model one hospital schema: `patients`, `visits` and
//! `lab_results` tables mapped to Patient, Encounter and Observation.

use serde_json::{Value, json};

use helios_sync::mapping::MappingDescriptor;

/// Source table and key column for Patient rows.
pub const PATIENTS: (&str, &str) = ("patients", "patient_id");

/// Source table and key column for Encounter rows.
pub const VISITS: (&str, &str) = ("visits", "visit_id");

/// Source table and key column for Observation rows.
pub const LAB_RESULTS: (&str, &str) = ("lab_results", "lab_id");

/// Maps `patients` to Patient.
pub fn patient_descriptor(tenant: &str) -> MappingDescriptor {
    descriptor(json!({
        "tenant_id": tenant,
        "resource_type": "Patient",
        "source_table": PATIENTS.0,
        "source_id_column": PATIENTS.1,
        "source_system": "general-his",
        "fields": [
            {"target": "name[0].text",
             "transform": {"kind": "direct_copy", "column": "name"}},
            {"target": "gender",
             "transform": {"kind": "code_lookup", "column": "gender", "output": "code",
                           "case_insensitive": true,
                           "codes": {"m": {"code": "male"}, "male": {"code": "male"},
                                     "f": {"code": "female"}, "female": {"code": "female"}},
                           "fallback": {"code": "unknown"}}},
            {"target": "birthDate",
             "transform": {"kind": "temporal", "column": "dob"}}
        ]
    }))
}

/// Maps `visits` to Encounter.
pub fn encounter_descriptor(tenant: &str) -> MappingDescriptor {
    descriptor(json!({
        "tenant_id": tenant,
        "resource_type": "Encounter",
        "source_table": VISITS.0,
        "source_id_column": VISITS.1,
        "source_system": "general-his",
        "fields": [
            {"target": "subject",
             "transform": {"kind": "reference", "column": "patient_id", "target_type": "Patient"}},
            {"target": "status",
             "transform": {"kind": "constant", "value": "finished"}},
            {"target": "period.start",
             "transform": {"kind": "temporal", "column": "admitted_at", "precision": "date_time"}}
        ]
    }))
}

/// Maps `lab_results` to Observation. `test_name` is required.
pub fn observation_descriptor(tenant: &str) -> MappingDescriptor {
    descriptor(json!({
        "tenant_id": tenant,
        "resource_type": "Observation",
        "source_table": LAB_RESULTS.0,
        "source_id_column": LAB_RESULTS.1,
        "source_system": "general-lis",
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
}

fn descriptor(value: Value) -> MappingDescriptor {
    serde_json::from_value(value).expect("fixture descriptor should deserialize")
}

/// A `patients` row.
pub fn patient_row(id: &str, name: &str, gender: &str, dob: &str) -> Value {
    json!({"patient_id": id, "name": name, "gender": gender, "dob": dob})
}

/// A `visits` row.
pub fn visit_row(id: &str, patient_id: &str) -> Value {
    json!({"visit_id": id, "patient_id": patient_id, "admitted_at": "2024-03-01 08:30:00"})
}

/// A `lab_results` row.
pub fn lab_row(id: &str, patient_id: &str, visit_id: Option<&str>, test_name: &str) -> Value {
    json!({
        "lab_id": id,
        "patient_id": patient_id,
        "visit_id": visit_id,
        "test_name": test_name,
        "result": "5.4",
        "unit": "mmol/L"
    })
}
