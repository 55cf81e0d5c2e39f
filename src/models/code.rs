//! Source (AYUSH) and target (ICD-11 TM2) code rows.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Traditional medicine classification a source code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum SourceSystem {
    Ayurveda,
    Siddha,
    Unani,
}

impl SourceSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ayurveda => "ayurveda",
            Self::Siddha => "siddha",
            Self::Unani => "unani",
        }
    }

    /// BCP-47 language tag for FHIR designations in this system's native
    /// script (Sanskrit, Tamil, Urdu).
    pub fn designation_language(&self) -> &'static str {
        match self {
            Self::Ayurveda => "sa",
            Self::Siddha => "ta",
            Self::Unani => "ur",
        }
    }

    /// Canonical CodeSystem URI for the FHIR surface.
    pub fn code_system_uri(&self) -> &'static str {
        match self {
            Self::Ayurveda => "https://terminology.tm2bridge.in/CodeSystem/ayurveda",
            Self::Siddha => "https://terminology.tm2bridge.in/CodeSystem/siddha",
            Self::Unani => "https://terminology.tm2bridge.in/CodeSystem/unani",
        }
    }

    pub fn all() -> [SourceSystem; 3] {
        [Self::Ayurveda, Self::Siddha, Self::Unani]
    }
}

impl std::fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SourceSystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ayurveda" => Ok(Self::Ayurveda),
            "siddha" => Ok(Self::Siddha),
            "unani" => Ok(Self::Unani),
            other => Err(format!(
                "unknown source system '{}' (expected ayurveda|siddha|unani)",
                other
            )),
        }
    }
}

/// One code from the Ayurveda/Siddha/Unani catalog.
///
/// The embedding column is intentionally not part of this row; vector reads
/// and writes go through dedicated queries.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SourceCode {
    pub id: Uuid,
    pub code: String,
    pub system: SourceSystem,
    pub term: String,
    pub term_normalized: Option<String>,
    pub native_script: Option<String>,
    pub short_definition: Option<String>,
    pub long_definition: Option<String>,
    pub english_name: Option<String>,
    pub searchable_text: Option<String>,
}

impl SourceCode {
    /// Best text for the mapping pipeline: first non-empty of the definition
    /// and name fields, trimmed and lowercased. Empty when the row carries
    /// no usable text at all.
    pub fn mapping_text(&self) -> String {
        [
            self.short_definition.as_deref(),
            self.english_name.as_deref(),
            self.long_definition.as_deref(),
            Some(self.term.as_str()),
            self.term_normalized.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .unwrap_or_default()
    }
}

/// One code from the ICD-11 TM2 catalog.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TargetCode {
    pub id: Uuid,
    pub code: String,
    pub title: String,
    pub definition: Option<String>,
    pub category: Option<String>,
    pub parent_code: Option<String>,
    pub synonyms: Vec<String>,
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
    pub traditional_systems: Vec<String>,
}

/// Embedding coverage for one code table.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EmbeddingCoverage {
    pub total: i64,
    pub embedded: i64,
    pub percentage: f64,
}

impl EmbeddingCoverage {
    pub fn new(total: i64, embedded: i64) -> Self {
        let percentage = if total > 0 {
            (embedded as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        Self {
            total,
            embedded,
            percentage,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EmbeddingCoverageReport {
    pub source: EmbeddingCoverage,
    pub target: EmbeddingCoverage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn bare_source(term: &str) -> SourceCode {
        SourceCode {
            id: Uuid::new_v4(),
            code: "AAA-1".to_string(),
            system: SourceSystem::Ayurveda,
            term: term.to_string(),
            term_normalized: None,
            native_script: None,
            short_definition: None,
            long_definition: None,
            english_name: None,
            searchable_text: None,
        }
    }

    #[test]
    fn system_parsing_is_case_insensitive() {
        assert_eq!(
            SourceSystem::from_str("Ayurveda").unwrap(),
            SourceSystem::Ayurveda
        );
        assert_eq!(SourceSystem::from_str("SIDDHA").unwrap(), SourceSystem::Siddha);
        assert!(SourceSystem::from_str("homeopathy").is_err());
    }

    #[test]
    fn designation_languages() {
        assert_eq!(SourceSystem::Ayurveda.designation_language(), "sa");
        assert_eq!(SourceSystem::Siddha.designation_language(), "ta");
        assert_eq!(SourceSystem::Unani.designation_language(), "ur");
    }

    #[test]
    fn mapping_text_prefers_short_definition() {
        let mut code = bare_source("ज्वर");
        code.short_definition = Some("  Fever with periodic onset ".to_string());
        code.english_name = Some("Jvara".to_string());
        assert_eq!(code.mapping_text(), "fever with periodic onset");
    }

    #[test]
    fn mapping_text_falls_through_blanks() {
        let mut code = bare_source("ज्वर");
        code.short_definition = Some("   ".to_string());
        code.english_name = Some("Jvara".to_string());
        assert_eq!(code.mapping_text(), "jvara");
    }

    #[test]
    fn mapping_text_empty_when_no_text() {
        let code = bare_source("   ");
        assert_eq!(code.mapping_text(), "");
    }
}
