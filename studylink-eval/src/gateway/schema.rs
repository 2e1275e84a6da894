//! Stage output schemas
//!
//! Each stage declares the JSON schema it expects from the classifier and a
//! validator that turns a raw JSON value into a typed output. Validation first
//! repairs common near-misses:
//! - Markdown code fences around the JSON body
//! - JSON encoded as a string
//! - Discriminants in the wrong case, padded, or with spaces/hyphens
//! - `very_likely_study_ids` instead of `very_likely_ids`
//! - `"true"` / `"false"` strings for `has_match`
//!
//! Anything that still does not fit is an error, which the gateway treats
//! exactly like a failed invocation.

use crate::types::{Decision, NewCandidateSuggestion};
use serde_json::{json, Map, Value};

/// Schema handed to the backend alongside a request
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    /// Schema / tool name (`[a-zA-Z0-9_]+`)
    pub name: &'static str,
    pub description: &'static str,
    pub schema: Value,
}

/// Typed classifier output for one stage
pub trait StageOutput: Sized + Send {
    fn schema() -> OutputSchema;

    /// Repair and validate a raw classifier value
    fn from_value(value: Value) -> Result<Self, String>;
}

// ============================================================================
// Outputs
// ============================================================================

/// Initial triage verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialDecision {
    pub decision: Decision,
    pub rationale: String,
}

/// Grouped very-likely selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikelyGroupSelection {
    /// Raw identifiers as returned; resolved by the stage
    pub very_likely_ids: Vec<String>,
    pub rationale: String,
}

/// Final pairwise comparison verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairwiseVerdict {
    pub decision: Decision,
    /// Present whenever `decision` is `match`
    pub study_id: Option<String>,
    pub rationale: String,
}

/// Unsure / likely-rejected review verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewVerdict {
    pub decision: Decision,
    pub rationale: String,
}

/// Run summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryVerdict {
    pub has_match: bool,
    pub summary: String,
}

/// New study draft
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCandidateDraft {
    pub new_study: NewCandidateSuggestion,
}

const TRIAGE: &[Decision] = &[Decision::NotMatch, Decision::Unsure, Decision::LikelyMatch];
const PAIRWISE: &[Decision] = &[Decision::Match, Decision::Unsure];
const REVIEW: &[Decision] = &[Decision::Match, Decision::Unsure, Decision::NotMatch];

fn decision_schema(allowed: &[Decision]) -> Value {
    let names: Vec<&str> = allowed.iter().map(|d| d.as_str()).collect();
    json!({"type": "string", "enum": names})
}

impl StageOutput for InitialDecision {
    fn schema() -> OutputSchema {
        OutputSchema {
            name: "initial_decision",
            description: "First-pass relevance of one candidate study",
            schema: json!({
                "type": "object",
                "properties": {
                    "decision": decision_schema(TRIAGE),
                    "rationale": {"type": "string"}
                },
                "required": ["decision", "rationale"],
                "additionalProperties": false
            }),
        }
    }

    fn from_value(value: Value) -> Result<Self, String> {
        let map = into_object(value)?;
        Ok(Self {
            decision: take_decision(&map, TRIAGE)?,
            rationale: take_text(&map, &["rationale", "reason"])?,
        })
    }
}

impl StageOutput for LikelyGroupSelection {
    fn schema() -> OutputSchema {
        OutputSchema {
            name: "likely_group_selection",
            description: "Up to two candidate ids selected for final comparison",
            schema: json!({
                "type": "object",
                "properties": {
                    "very_likely_ids": {"type": "array", "items": {"type": "string"}},
                    "rationale": {"type": "string"}
                },
                "required": ["very_likely_ids", "rationale"],
                "additionalProperties": false
            }),
        }
    }

    fn from_value(value: Value) -> Result<Self, String> {
        let map = into_object(value)?;
        let raw = map
            .get("very_likely_ids")
            .or_else(|| map.get("very_likely_study_ids"))
            .ok_or_else(|| "missing very_likely_ids".to_string())?;
        let ids = match raw {
            Value::Array(items) => items.iter().filter_map(id_string).collect(),
            Value::Null => Vec::new(),
            other => id_string(other).into_iter().collect(),
        };
        Ok(Self {
            very_likely_ids: ids,
            rationale: take_text(&map, &["rationale", "reason"])?,
        })
    }
}

impl StageOutput for PairwiseVerdict {
    fn schema() -> OutputSchema {
        OutputSchema {
            name: "pairwise_verdict",
            description: "Definitive match among the very likely candidates, or unsure",
            schema: json!({
                "type": "object",
                "properties": {
                    "decision": decision_schema(PAIRWISE),
                    "study_id": {"type": ["string", "null"]},
                    "rationale": {"type": "string"}
                },
                "required": ["decision", "study_id", "rationale"],
                "additionalProperties": false
            }),
        }
    }

    fn from_value(value: Value) -> Result<Self, String> {
        let map = into_object(value)?;
        let decision = take_decision(&map, PAIRWISE)?;
        let study_id = map
            .get("study_id")
            .and_then(id_string)
            .filter(|s| !s.is_empty());
        if decision == Decision::Match && study_id.is_none() {
            return Err("decision is match but study_id is missing".to_string());
        }
        Ok(Self {
            decision,
            study_id,
            rationale: take_text(&map, &["rationale", "reason"])?,
        })
    }
}

impl StageOutput for ReviewVerdict {
    fn schema() -> OutputSchema {
        OutputSchema {
            name: "review_verdict",
            description: "Second-pass verdict on one candidate study",
            schema: json!({
                "type": "object",
                "properties": {
                    "decision": decision_schema(REVIEW),
                    "rationale": {"type": "string"}
                },
                "required": ["decision", "rationale"],
                "additionalProperties": false
            }),
        }
    }

    fn from_value(value: Value) -> Result<Self, String> {
        let map = into_object(value)?;
        Ok(Self {
            decision: take_decision(&map, REVIEW)?,
            rationale: take_text(&map, &["rationale", "reason"])?,
        })
    }
}

impl StageOutput for SummaryVerdict {
    fn schema() -> OutputSchema {
        OutputSchema {
            name: "evaluation_summary",
            description: "Overall verdict and explanation for the report",
            schema: json!({
                "type": "object",
                "properties": {
                    "has_match": {"type": "boolean"},
                    "summary": {"type": "string"}
                },
                "required": ["has_match", "summary"],
                "additionalProperties": false
            }),
        }
    }

    fn from_value(value: Value) -> Result<Self, String> {
        let map = into_object(value)?;
        let has_match = match map.get("has_match") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" => true,
                "false" => false,
                other => return Err(format!("has_match is not a boolean: {}", other)),
            },
            Some(other) => return Err(format!("has_match is not a boolean: {}", other)),
            None => return Err("missing has_match".to_string()),
        };
        Ok(Self {
            has_match,
            summary: take_text(&map, &["summary", "rationale"])?,
        })
    }
}

impl StageOutput for NewCandidateDraft {
    fn schema() -> OutputSchema {
        let text = json!({"type": ["string", "null"]});
        OutputSchema {
            name: "new_study_suggestion",
            description: "Draft record for a study that is not in the candidate list",
            schema: json!({
                "type": "object",
                "properties": {
                    "new_study": {
                        "type": "object",
                        "properties": {
                            "short_name": {"type": "string"},
                            "title": text,
                            "trial_registration_ids": {"type": "array", "items": {"type": "string"}},
                            "countries": text,
                            "number_participants": text,
                            "comparison": text,
                            "status": text,
                            "rationale": {"type": "string"}
                        },
                        "required": [
                            "short_name", "title", "trial_registration_ids", "countries",
                            "number_participants", "comparison", "status", "rationale"
                        ],
                        "additionalProperties": false
                    }
                },
                "required": ["new_study"],
                "additionalProperties": false
            }),
        }
    }

    fn from_value(value: Value) -> Result<Self, String> {
        let map = into_object(value)?;
        let inner = map
            .get("new_study")
            .cloned()
            .ok_or_else(|| "missing new_study".to_string())?;
        let inner = into_object(inner)?;
        let mut new_study: NewCandidateSuggestion = serde_json::from_value(Value::Object(inner))
            .map_err(|e| format!("new_study does not match the draft shape: {}", e))?;
        new_study.short_name = new_study.short_name.trim().to_string();
        new_study.rationale = new_study.rationale.trim().to_string();
        if new_study.short_name.is_empty() {
            return Err("new_study.short_name is empty".to_string());
        }
        Ok(Self { new_study })
    }
}

// ============================================================================
// Repair helpers
// ============================================================================

/// Coerce a classifier value into a JSON object
pub fn into_object(value: Value) -> Result<Map<String, Value>, String> {
    match value {
        Value::Object(map) => Ok(map),
        Value::String(text) => {
            let body = strip_code_fence(&text);
            match serde_json::from_str::<Value>(body) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(other) => Err(format!("expected a JSON object, got {}", kind(&other))),
                Err(e) => Err(format!("response is not JSON: {}", e)),
            }
        }
        other => Err(format!("expected a JSON object, got {}", kind(&other))),
    }
}

/// Strip a surrounding Markdown code fence (with optional language tag)
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn take_decision(map: &Map<String, Value>, allowed: &[Decision]) -> Result<Decision, String> {
    let raw = map
        .get("decision")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing decision".to_string())?;
    let normalized: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect();
    let decision: Decision = serde_json::from_value(Value::String(normalized.clone()))
        .map_err(|_| format!("unknown decision: {}", raw))?;
    if !allowed.contains(&decision) {
        return Err(format!("decision {} is not allowed here", normalized));
    }
    Ok(decision)
}

fn take_text(map: &Map<String, Value>, keys: &[&str]) -> Result<String, String> {
    keys.iter()
        .filter_map(|k| map.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| format!("missing or empty {}", keys[0]))
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
