//! Mapping rows and their categorical labels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::code::SourceSystem;

/// FHIR-style relation between a source and a target concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum Equivalence {
    Equivalent,
    Wider,
    Narrower,
    Inexact,
    Unmatched,
    Disjoint,
}

impl Equivalence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equivalent => "EQUIVALENT",
            Self::Wider => "WIDER",
            Self::Narrower => "NARROWER",
            Self::Inexact => "INEXACT",
            Self::Unmatched => "UNMATCHED",
            Self::Disjoint => "DISJOINT",
        }
    }

    /// Lowercase code used in ConceptMap match groups.
    pub fn fhir_code(&self) -> &'static str {
        match self {
            Self::Equivalent => "equivalent",
            Self::Wider => "wider",
            Self::Narrower => "narrower",
            Self::Inexact => "inexact",
            Self::Unmatched => "unmatched",
            Self::Disjoint => "disjoint",
        }
    }
}

impl std::fmt::Display for Equivalence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Equivalence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EQUIVALENT" => Ok(Self::Equivalent),
            "WIDER" => Ok(Self::Wider),
            "NARROWER" => Ok(Self::Narrower),
            "INEXACT" => Ok(Self::Inexact),
            "UNMATCHED" => Ok(Self::Unmatched),
            "DISJOINT" => Ok(Self::Disjoint),
            other => Err(format!("unknown equivalence '{}'", other)),
        }
    }
}

/// Provenance of a mapping row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingSource {
    Deterministic,
    Semantic,
    AiValidated,
    HumanValidated,
}

impl MappingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deterministic => "DETERMINISTIC",
            Self::Semantic => "SEMANTIC",
            Self::AiValidated => "AI_VALIDATED",
            Self::HumanValidated => "HUMAN_VALIDATED",
        }
    }
}

impl std::fmt::Display for MappingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Review state of a mapping row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Pending,
    Approved,
    Rejected,
    NeedsReview,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::NeedsReview => "NEEDS_REVIEW",
        }
    }
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ValidationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "NEEDS_REVIEW" => Ok(Self::NeedsReview),
            other => Err(format!("unknown validation status '{}'", other)),
        }
    }
}

/// A persisted source → target mapping.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Mapping {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub equivalence: Equivalence,
    pub confidence: f32,
    pub mapping_source: MappingSource,
    pub validation_status: ValidationStatus,
    pub validator: Option<String>,
    pub validated_at: Option<DateTime<Utc>>,
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mapping joined with source and target code fields, the shape the listing
/// and batch-lookup endpoints return.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MappingDetail {
    pub id: Uuid,
    pub source_code: String,
    pub source_system: SourceSystem,
    pub source_term: String,
    pub source_english_name: Option<String>,
    pub target_code: String,
    pub target_title: String,
    pub equivalence: Equivalence,
    pub confidence: f32,
    pub mapping_source: MappingSource,
    pub validation_status: ValidationStatus,
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn equivalence_round_trip() {
        for label in ["EQUIVALENT", "WIDER", "NARROWER", "INEXACT", "UNMATCHED", "DISJOINT"] {
            let parsed = Equivalence::from_str(label).unwrap();
            assert_eq!(parsed.as_str(), label);
        }
        // Adjudicator output arrives in arbitrary case.
        assert_eq!(
            Equivalence::from_str("narrower").unwrap(),
            Equivalence::Narrower
        );
    }

    #[test]
    fn fhir_codes_are_lowercase() {
        assert_eq!(Equivalence::Equivalent.fhir_code(), "equivalent");
        assert_eq!(Equivalence::Unmatched.fhir_code(), "unmatched");
    }

    #[test]
    fn mapping_source_labels() {
        assert_eq!(MappingSource::AiValidated.as_str(), "AI_VALIDATED");
        assert_eq!(MappingSource::HumanValidated.as_str(), "HUMAN_VALIDATED");
    }

    #[test]
    fn validation_status_labels() {
        assert_eq!(ValidationStatus::NeedsReview.as_str(), "NEEDS_REVIEW");
        assert_eq!(
            ValidationStatus::from_str("needs_review").unwrap(),
            ValidationStatus::NeedsReview
        );
    }
}
