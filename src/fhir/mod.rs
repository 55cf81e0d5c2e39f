//! FHIR R4 resource shaping.
//!
//! The façade holds no state: these builders turn store rows and pipeline
//! output into the Parameters / OperationOutcome / ValueSet /
//! CapabilityStatement shapes the terminology operations return.

use serde_json::{json, Value};

use crate::models::{Equivalence, MappingSource, SourceCode, SourceSystem, TargetCode};

/// Canonical URI of the ICD-11 release the target catalog comes from.
pub const TM2_SYSTEM_URI: &str = "http://id.who.int/icd/release/11/mms";

pub fn parameters(entries: Vec<Value>) -> Value {
    json!({
        "resourceType": "Parameters",
        "parameter": entries,
    })
}

pub fn string_param(name: &str, value: &str) -> Value {
    json!({"name": name, "valueString": value})
}

pub fn boolean_param(name: &str, value: bool) -> Value {
    json!({"name": name, "valueBoolean": value})
}

pub fn decimal_param(name: &str, value: f64) -> Value {
    json!({"name": name, "valueDecimal": value})
}

pub fn operation_outcome(severity: &str, code: &str, diagnostics: &str) -> Value {
    json!({
        "resourceType": "OperationOutcome",
        "issue": [{
            "severity": severity,
            "code": code,
            "diagnostics": diagnostics,
        }],
    })
}

pub fn not_found_outcome(diagnostics: &str) -> Value {
    operation_outcome("error", "not-found", diagnostics)
}

/// $lookup response for a source code, with a native-script designation in
/// the language implied by its system.
pub fn lookup_source(code: &SourceCode) -> Value {
    let mut entries = vec![
        string_param("name", &format!("{} Terminology", title_case(code.system))),
        string_param("display", &code.term),
    ];
    if let Some(definition) = code
        .short_definition
        .as_deref()
        .or(code.long_definition.as_deref())
    {
        entries.push(string_param("definition", definition));
    }
    let designation_value = code.native_script.as_deref().unwrap_or(&code.term);
    entries.push(json!({
        "name": "designation",
        "part": [
            {"name": "language", "valueCode": code.system.designation_language()},
            {"name": "value", "valueString": designation_value},
        ],
    }));
    parameters(entries)
}

/// $lookup response for a target code.
pub fn lookup_target(code: &TargetCode) -> Value {
    let mut entries = vec![
        string_param("name", "ICD-11 Traditional Medicine Module 2"),
        string_param("display", &code.title),
    ];
    if let Some(definition) = code.definition.as_deref() {
        entries.push(string_param("definition", definition));
    }
    parameters(entries)
}

/// $translate response. `mapping_source` is the provenance label exposed in
/// the match group's `source` part.
pub fn translate_result(
    target: Option<(&str, &str)>,
    equivalence: Equivalence,
    confidence: f32,
    mapping_source: MappingSource,
) -> Value {
    match target {
        Some((code, display)) => parameters(vec![
            boolean_param("result", true),
            json!({
                "name": "match",
                "part": [
                    {"name": "equivalence", "valueCode": equivalence.fhir_code()},
                    {"name": "concept", "valueCoding": {
                        "system": TM2_SYSTEM_URI,
                        "code": code,
                        "display": display,
                    }},
                    {"name": "source", "valueString": mapping_source.as_str()},
                    {"name": "confidence", "valueDecimal": confidence},
                ],
            }),
        ]),
        None => parameters(vec![
            boolean_param("result", false),
            string_param("message", "No target concept found"),
        ]),
    }
}

/// $expand response over a page of source codes.
pub fn valueset_expansion(total: i64, offset: i64, codes: &[SourceCode]) -> Value {
    let contains: Vec<Value> = codes
        .iter()
        .map(|code| {
            json!({
                "system": code.system.code_system_uri(),
                "code": code.code,
                "display": code.term,
            })
        })
        .collect();
    json!({
        "resourceType": "ValueSet",
        "status": "active",
        "expansion": {
            "total": total,
            "offset": offset,
            "contains": contains,
        },
    })
}

/// CodeSystem resource summary for one source system.
pub fn code_system_summary(system: SourceSystem, count: i64) -> Value {
    json!({
        "resourceType": "CodeSystem",
        "id": system.as_str(),
        "url": system.code_system_uri(),
        "name": format!("{} Terminology", title_case(system)),
        "status": "active",
        "content": "complete",
        "count": count,
    })
}

/// Server capability statement: the three terminology operations plus the
/// resources they live on.
pub fn capability_statement() -> Value {
    json!({
        "resourceType": "CapabilityStatement",
        "status": "active",
        "kind": "instance",
        "fhirVersion": "4.0.1",
        "format": ["json"],
        "rest": [{
            "mode": "server",
            "resource": [
                {
                    "type": "CodeSystem",
                    "interaction": [{"code": "read"}, {"code": "search-type"}],
                    "operation": [{"name": "lookup", "definition": "http://hl7.org/fhir/OperationDefinition/CodeSystem-lookup"}],
                },
                {
                    "type": "ConceptMap",
                    "operation": [{"name": "translate", "definition": "http://hl7.org/fhir/OperationDefinition/ConceptMap-translate"}],
                },
                {
                    "type": "ValueSet",
                    "operation": [{"name": "expand", "definition": "http://hl7.org/fhir/OperationDefinition/ValueSet-expand"}],
                },
            ],
        }],
    })
}

fn title_case(system: SourceSystem) -> String {
    let name = system.as_str();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn source() -> SourceCode {
        SourceCode {
            id: Uuid::new_v4(),
            code: "AAA-1".to_string(),
            system: SourceSystem::Siddha,
            term: "வெப்பு நோய்".to_string(),
            term_normalized: None,
            native_script: Some("வெப்பு நோய்".to_string()),
            short_definition: Some("Heat disorder".to_string()),
            long_definition: None,
            english_name: Some("Veppu noi".to_string()),
            searchable_text: None,
        }
    }

    #[test]
    fn lookup_source_carries_designation_language() {
        let value = lookup_source(&source());
        let text = value.to_string();
        assert!(text.contains("\"resourceType\":\"Parameters\""));
        assert!(text.contains("\"valueCode\":\"ta\""));
        assert!(text.contains("Heat disorder"));
    }

    #[test]
    fn translate_result_match_shape() {
        let value = translate_result(
            Some(("SK00.0", "Fever disorder")),
            Equivalence::Narrower,
            0.78,
            MappingSource::AiValidated,
        );
        let text = value.to_string();
        assert!(text.contains("\"valueBoolean\":true"));
        assert!(text.contains("\"valueCode\":\"narrower\""));
        assert!(text.contains(TM2_SYSTEM_URI));
        assert!(text.contains("AI_VALIDATED"));
    }

    #[test]
    fn translate_result_unmatched() {
        let value = translate_result(None, Equivalence::Unmatched, 0.0, MappingSource::AiValidated);
        assert!(value.to_string().contains("\"valueBoolean\":false"));
    }

    #[test]
    fn expansion_pages() {
        let value = valueset_expansion(42, 10, &[source()]);
        assert_eq!(value["expansion"]["total"], 42);
        assert_eq!(value["expansion"]["offset"], 10);
        assert_eq!(value["expansion"]["contains"][0]["code"], "AAA-1");
    }

    #[test]
    fn outcome_not_found() {
        let value = not_found_outcome("no such code");
        assert_eq!(value["issue"][0]["code"], "not-found");
    }
}
