//! The closed set of canonical resource types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A kind of canonical resource.
///
/// The set is fixed at compile time. Each variant knows where it sits in the
/// foreign-key dependency order, which top-level payload fields its fixed
/// schema allows, and which other types it may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    /// Patient demographics.
    Patient,
    /// A hospital visit.
    Encounter,
    /// A measurement or lab result.
    Observation,
    /// A prescribed medication.
    MedicationRequest,
    /// A recorded allergy or intolerance.
    AllergyIntolerance,
}

/// Returned when parsing an unknown resource type name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown resource type: {0}")]
pub struct UnknownResourceType(pub String);

const PATIENT_FIELDS: &[&str] = &[
    "identifier",
    "active",
    "name",
    "telecom",
    "gender",
    "birthDate",
    "deceasedBoolean",
    "deceasedDateTime",
    "address",
    "maritalStatus",
    "contact",
    "communication",
];

const ENCOUNTER_FIELDS: &[&str] = &[
    "identifier",
    "status",
    "class",
    "type",
    "subject",
    "period",
    "reasonCode",
    "diagnosis",
    "participant",
    "location",
    "serviceProvider",
    "hospitalization",
];

const OBSERVATION_FIELDS: &[&str] = &[
    "identifier",
    "status",
    "category",
    "code",
    "subject",
    "encounter",
    "effectiveDateTime",
    "issued",
    "valueQuantity",
    "valueString",
    "valueCodeableConcept",
    "interpretation",
    "referenceRange",
    "performer",
    "note",
];

const MEDICATION_REQUEST_FIELDS: &[&str] = &[
    "identifier",
    "status",
    "intent",
    "medicationCodeableConcept",
    "subject",
    "encounter",
    "authoredOn",
    "requester",
    "dosageInstruction",
    "note",
];

const ALLERGY_INTOLERANCE_FIELDS: &[&str] = &[
    "identifier",
    "clinicalStatus",
    "verificationStatus",
    "type",
    "category",
    "criticality",
    "code",
    "patient",
    "onsetDateTime",
    "recordedDate",
    "reaction",
    "note",
];

impl ResourceType {
    /// All resource types in dependency order.
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Patient,
        ResourceType::Encounter,
        ResourceType::Observation,
        ResourceType::MedicationRequest,
        ResourceType::AllergyIntolerance,
    ];

    /// Returns the FHIR resource type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Patient => "Patient",
            ResourceType::Encounter => "Encounter",
            ResourceType::Observation => "Observation",
            ResourceType::MedicationRequest => "MedicationRequest",
            ResourceType::AllergyIntolerance => "AllergyIntolerance",
        }
    }

    /// Returns the dependency tier. A type may only reference types in a
    /// strictly lower tier.
    pub fn tier(&self) -> u8 {
        match self {
            ResourceType::Patient => 0,
            ResourceType::Encounter => 1,
            ResourceType::Observation
            | ResourceType::MedicationRequest
            | ResourceType::AllergyIntolerance => 2,
        }
    }

    /// Groups all resource types by tier, lowest first.
    ///
    /// ```
    /// use helios_sync::types::ResourceType;
    ///
    /// let tiers = ResourceType::tiers();
    /// assert_eq!(tiers[0], vec![ResourceType::Patient]);
    /// assert_eq!(tiers[1], vec![ResourceType::Encounter]);
    /// assert_eq!(tiers[2].len(), 3);
    /// ```
    pub fn tiers() -> Vec<Vec<ResourceType>> {
        let mut tiers: Vec<Vec<ResourceType>> = Vec::new();
        for rt in Self::ALL {
            let tier = rt.tier() as usize;
            if tiers.len() <= tier {
                tiers.resize_with(tier + 1, Vec::new);
            }
            tiers[tier].push(rt);
        }
        tiers
    }

    /// Top-level payload fields the fixed schema of this type allows.
    pub fn schema_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceType::Patient => PATIENT_FIELDS,
            ResourceType::Encounter => ENCOUNTER_FIELDS,
            ResourceType::Observation => OBSERVATION_FIELDS,
            ResourceType::MedicationRequest => MEDICATION_REQUEST_FIELDS,
            ResourceType::AllergyIntolerance => ALLERGY_INTOLERANCE_FIELDS,
        }
    }

    /// Returns `true` if `field` is a top-level field of this type's schema.
    pub fn allows_field(&self, field: &str) -> bool {
        self.schema_fields().contains(&field)
    }

    /// Resource types this type may reference.
    pub fn reference_targets(&self) -> &'static [ResourceType] {
        match self {
            ResourceType::Patient => &[],
            ResourceType::Encounter | ResourceType::AllergyIntolerance => {
                &[ResourceType::Patient]
            }
            ResourceType::Observation | ResourceType::MedicationRequest => {
                &[ResourceType::Patient, ResourceType::Encounter]
            }
        }
    }

    /// Returns `true` if every resource of this type must reference a Patient.
    pub fn requires_patient(&self) -> bool {
        !matches!(self, ResourceType::Patient)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = UnknownResourceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|rt| rt.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownResourceType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("Patient".parse::<ResourceType>(), Ok(ResourceType::Patient));
        assert_eq!(
            "medicationrequest".parse::<ResourceType>(),
            Ok(ResourceType::MedicationRequest)
        );
        assert!("Condition".parse::<ResourceType>().is_err());
    }

    #[test]
    fn test_references_point_to_lower_tiers() {
        for rt in ResourceType::ALL {
            for target in rt.reference_targets() {
                assert!(target.tier() < rt.tier(), "{rt} -> {target}");
            }
        }
    }

    #[test]
    fn test_dependent_types_require_patient() {
        assert!(!ResourceType::Patient.requires_patient());
        for rt in &ResourceType::ALL[1..] {
            assert!(rt.requires_patient());
            assert!(rt.reference_targets().contains(&ResourceType::Patient));
        }
    }

    #[test]
    fn test_schema_fields() {
        assert!(ResourceType::Patient.allows_field("birthDate"));
        assert!(!ResourceType::Patient.allows_field("subject"));
        assert!(ResourceType::AllergyIntolerance.allows_field("patient"));
    }
}
