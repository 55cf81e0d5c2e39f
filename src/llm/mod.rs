//! LLM adjudication of retrieval candidates.
//!
//! The adjudicator sees the source record and at most three candidates and
//! returns a structured verdict. Models answer in free-form text, so the
//! verdict is recovered by extracting the first balanced JSON object from
//! the reply; anything unparseable is an adjudicator failure and the
//! pipeline falls back to the top candidate.

pub mod gemini;

pub use gemini::GeminiAdjudicator;

use async_trait::async_trait;
use serde::Deserialize;

use crate::database::TargetCandidate;
use crate::error::{AppError, AppResult};
use crate::models::{Equivalence, SourceCode};

/// Definitions passed to the model are clipped to keep the prompt small.
const DEFINITION_CLIP: usize = 300;

/// Structured judgment over one source code and its candidates.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// Candidate code the model selected; `None` means no candidate fits.
    pub selected_code: Option<String>,
    pub confidence: f32,
    pub equivalence: Equivalence,
    pub reasoning: String,
}

#[async_trait]
pub trait Adjudicator: Send + Sync {
    /// Judge the candidates. `selected_code`, when present, is guaranteed by
    /// the caller-side validation in the pipeline, not here.
    async fn adjudicate(
        &self,
        source: &SourceCode,
        candidates: &[TargetCandidate],
    ) -> AppResult<Verdict>;
}

/// Fixed prompt template; candidates beyond the first three are never sent.
pub fn build_prompt(source: &SourceCode, candidates: &[TargetCandidate]) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(
        "You are a medical terminology expert mapping traditional medicine \
         diagnoses to ICD-11 Traditional Medicine Module 2 codes.\n\n",
    );
    prompt.push_str(&format!(
        "Source concept ({} code {}):\n",
        source.system, source.code
    ));
    prompt.push_str(&format!("  term: {}\n", source.term));
    if let Some(english) = source.english_name.as_deref().filter(|s| !s.is_empty()) {
        prompt.push_str(&format!("  english name: {}\n", english));
    }
    if let Some(definition) = source
        .short_definition
        .as_deref()
        .or(source.long_definition.as_deref())
        .filter(|s| !s.is_empty())
    {
        prompt.push_str(&format!("  definition: {}\n", clip(definition)));
    }

    prompt.push_str("\nCandidate ICD-11 TM2 codes:\n");
    for candidate in candidates {
        let definition = candidate
            .target
            .definition
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(clip)
            .unwrap_or_else(|| "(no definition)".to_string());
        prompt.push_str(&format!(
            "  {} — {}: {}\n",
            candidate.target.code, candidate.target.title, definition
        ));
    }

    prompt.push_str(
        "\nPick the best candidate, or none if nothing fits. Respond with a \
         single JSON object:\n\
         {\"selected_code\": \"<candidate code or null>\", \
         \"confidence\": <0.0-1.0>, \
         \"equivalence\": \"EQUIVALENT|WIDER|NARROWER|INEXACT|UNMATCHED\", \
         \"reasoning\": \"<one or two sentences>\"}\n",
    );
    prompt
}

fn clip(text: &str) -> String {
    if text.chars().count() <= DEFINITION_CLIP {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(DEFINITION_CLIP).collect();
        format!("{}…", clipped)
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    selected_code: Option<String>,
    confidence: f32,
    equivalence: String,
    #[serde(default)]
    reasoning: String,
}

/// Parse a model reply into a verdict. Fails when no balanced JSON object
/// exists, required fields are absent, or the equivalence label is unknown.
pub fn parse_verdict(reply: &str) -> AppResult<Verdict> {
    let object = extract_first_json_object(reply)
        .ok_or_else(|| AppError::Upstream("no JSON object in adjudicator reply".to_string()))?;
    let raw: RawVerdict = serde_json::from_str(object)
        .map_err(|e| AppError::Upstream(format!("malformed adjudicator verdict: {}", e)))?;

    let equivalence: Equivalence = raw
        .equivalence
        .parse()
        .map_err(|e: String| AppError::Upstream(e))?;
    if equivalence == Equivalence::Disjoint {
        return Err(AppError::Upstream(
            "adjudicator returned an equivalence outside its contract".to_string(),
        ));
    }

    let selected_code = raw
        .selected_code
        .filter(|code| !code.is_empty() && code != "null");

    Ok(Verdict {
        selected_code,
        confidence: raw.confidence.clamp(0.0, 1.0),
        equivalence,
        reasoning: raw.reasoning,
    })
}

/// First balanced `{…}` in the text, skipping braces inside JSON strings.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::RetrievalMethod;
    use crate::models::{SourceSystem, TargetCode};
    use uuid::Uuid;

    fn source() -> SourceCode {
        SourceCode {
            id: Uuid::new_v4(),
            code: "AAA-1".to_string(),
            system: SourceSystem::Ayurveda,
            term: "ज्वर".to_string(),
            term_normalized: Some("jvara".to_string()),
            native_script: None,
            short_definition: Some("Fever with periodic onset".to_string()),
            long_definition: None,
            english_name: Some("Jvara".to_string()),
            searchable_text: None,
        }
    }

    fn candidate(code: &str, title: &str) -> TargetCandidate {
        TargetCandidate {
            target: TargetCode {
                id: Uuid::new_v4(),
                code: code.to_string(),
                title: title.to_string(),
                definition: None,
                category: None,
                parent_code: None,
                synonyms: vec![],
                inclusions: vec![],
                exclusions: vec![],
                traditional_systems: vec![],
            },
            score: 0.6,
            method: RetrievalMethod::Vector,
        }
    }

    #[test]
    fn extracts_object_from_prose() {
        let reply = "Sure! Here is my assessment:\n{\"selected_code\": \"SK00.0\", \
                     \"confidence\": 0.8, \"equivalence\": \"EQUIVALENT\", \
                     \"reasoning\": \"close match\"}\nHope that helps.";
        let object = extract_first_json_object(reply).unwrap();
        assert!(object.starts_with('{') && object.ends_with('}'));
    }

    #[test]
    fn extracts_nested_objects_and_braces_in_strings() {
        let reply = r#"{"a": {"b": 1}, "note": "odd } brace"} trailing"#;
        assert_eq!(
            extract_first_json_object(reply).unwrap(),
            r#"{"a": {"b": 1}, "note": "odd } brace"}"#
        );
    }

    #[test]
    fn no_object_is_none() {
        assert!(extract_first_json_object("nothing here").is_none());
        assert!(extract_first_json_object("{unclosed").is_none());
    }

    #[test]
    fn parse_verdict_happy_path() {
        let verdict = parse_verdict(
            "{\"selected_code\": \"SK00.0\", \"confidence\": 0.78, \
             \"equivalence\": \"narrower\", \"reasoning\": \"subset\"}",
        )
        .unwrap();
        assert_eq!(verdict.selected_code.as_deref(), Some("SK00.0"));
        assert_eq!(verdict.equivalence, Equivalence::Narrower);
        assert!((verdict.confidence - 0.78).abs() < 1e-6);
    }

    #[test]
    fn parse_verdict_null_selection() {
        let verdict = parse_verdict(
            "{\"selected_code\": null, \"confidence\": 0.2, \
             \"equivalence\": \"UNMATCHED\", \"reasoning\": \"nothing fits\"}",
        )
        .unwrap();
        assert!(verdict.selected_code.is_none());
        assert_eq!(verdict.equivalence, Equivalence::Unmatched);
    }

    #[test]
    fn parse_verdict_clamps_confidence() {
        let verdict = parse_verdict(
            "{\"selected_code\": \"SK00.0\", \"confidence\": 1.7, \
             \"equivalence\": \"EQUIVALENT\", \"reasoning\": \"x\"}",
        )
        .unwrap();
        assert!((verdict.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn parse_verdict_rejects_garbage() {
        assert!(parse_verdict("no json at all").is_err());
        assert!(parse_verdict("{\"confidence\": 0.5}").is_err());
        assert!(parse_verdict(
            "{\"selected_code\": \"X\", \"confidence\": 0.5, \
             \"equivalence\": \"SIDEWAYS\", \"reasoning\": \"x\"}"
        )
        .is_err());
    }

    #[test]
    fn prompt_contains_source_and_candidates() {
        let prompt = build_prompt(
            &source(),
            &[candidate("SK00.0", "Fever disorder"), candidate("SK01.1", "Heat pattern")],
        );
        assert!(prompt.contains("AAA-1"));
        assert!(prompt.contains("SK00.0"));
        assert!(prompt.contains("SK01.1"));
        assert!(prompt.contains("selected_code"));
    }
}
