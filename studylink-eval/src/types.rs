//! Core data model
//!
//! Input records ([`Report`], [`Candidate`]) keep the field names of the
//! upstream study register so they can be forwarded to the classifier
//! unchanged. Fields this crate does not interpret are preserved in `extra`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// Canonical candidate (study) identifier
///
/// The register emits numeric ids; classifiers echo them back as strings.
/// Both forms deserialize to the same trimmed string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CandidateId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<i64> for CandidateId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for CandidateId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Self::from(n),
            Raw::Str(s) => Self::new(s),
        })
    }
}

// ============================================================================
// Inputs
// ============================================================================

/// The submitted report being matched (one per run)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "CRGReportID")]
    pub report_id: i64,
    #[serde(rename = "CENTRALReportID", default)]
    pub central_report_id: Option<i64>,
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "OriginalTitle", default)]
    pub original_title: Option<String>,
    #[serde(rename = "Authors", default)]
    pub authors: Option<String>,
    #[serde(rename = "Journal", default)]
    pub journal: Option<String>,
    #[serde(rename = "Year", default)]
    pub year: Option<i32>,
    #[serde(rename = "Abstract", default)]
    pub abstract_text: Option<String>,
    #[serde(rename = "Notes", default)]
    pub notes: Option<String>,
    #[serde(rename = "DOI", default)]
    pub doi: Option<String>,
    #[serde(rename = "PMID", default)]
    pub pmid: Option<String>,
    #[serde(rename = "TrialRegistrationID", default)]
    pub trial_registration_id: Option<String>,
    /// Remaining register fields, forwarded verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Report {
    /// Minimal report for tests and examples
    pub fn new(report_id: i64, title: impl Into<String>) -> Self {
        Self {
            report_id,
            central_report_id: None,
            title: title.into(),
            original_title: None,
            authors: None,
            journal: None,
            year: None,
            abstract_text: None,
            notes: None,
            doi: None,
            pmid: None,
            trial_registration_id: None,
            extra: Map::new(),
        }
    }
}

/// A pre-existing study the report may belong to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "CRGStudyID")]
    pub id: CandidateId,
    #[serde(rename = "CENTRALStudyID", default)]
    pub central_id: Option<CandidateId>,
    #[serde(rename = "ShortName", default)]
    pub short_name: String,
    /// May hold several registrations separated by `;`, `,` or `|`
    #[serde(rename = "TrialRegistrationID", default)]
    pub trial_registration_id: Option<String>,
    #[serde(rename = "ISRCTN", default)]
    pub isrctn: Option<String>,
    #[serde(rename = "StatusofStudy", default)]
    pub status: Option<String>,
    #[serde(rename = "NumberParticipants", default)]
    pub number_participants: Option<String>,
    #[serde(rename = "Countries", default)]
    pub countries: Option<String>,
    #[serde(rename = "Comparison", default)]
    pub comparison: Option<String>,
    #[serde(rename = "Notes", default)]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Candidate {
    pub fn new(id: impl Into<CandidateId>, short_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            central_id: None,
            short_name: short_name.into(),
            trial_registration_id: None,
            isrctn: None,
            status: None,
            number_participants: None,
            countries: None,
            comparison: None,
            notes: None,
            extra: Map::new(),
        }
    }

    pub fn with_registration(mut self, registration: impl Into<String>) -> Self {
        self.trial_registration_id = Some(registration.into());
        self
    }

    /// External registration identifiers (trial registry ids and ISRCTN)
    pub fn registration_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .trial_registration_id
            .as_deref()
            .map(|raw| {
                raw.split(|c| matches!(c, ';' | ',' | '|' | '\n'))
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if let Some(isrctn) = self.isrctn.as_deref().map(str::trim) {
            if !isrctn.is_empty() {
                ids.push(isrctn);
            }
        }
        ids
    }

    /// Every string a classifier may use to refer to this candidate
    pub fn aliases(&self) -> Vec<&str> {
        let mut aliases = vec![self.id.as_str()];
        if !self.short_name.trim().is_empty() {
            aliases.push(self.short_name.as_str());
        }
        aliases.extend(self.registration_ids());
        if let Some(central) = &self.central_id {
            aliases.push(central.as_str());
        }
        aliases
    }

    /// Short name, or the id when the register left it blank
    pub fn display_name(&self) -> &str {
        if self.short_name.trim().is_empty() {
            self.id.as_str()
        } else {
            &self.short_name
        }
    }
}

// ============================================================================
// Decisions
// ============================================================================

/// Disposition of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    NotMatch,
    Unsure,
    LikelyMatch,
    Match,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotMatch => "not_match",
            Self::Unsure => "unsure",
            Self::LikelyMatch => "likely_match",
            Self::Match => "match",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage's verdict on one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub candidate_id: CandidateId,
    pub outcome: Decision,
    pub rationale: String,
}

impl DecisionRecord {
    pub fn new(candidate_id: CandidateId, outcome: Decision, rationale: impl Into<String>) -> Self {
        Self {
            candidate_id,
            outcome,
            rationale: rationale.into(),
        }
    }
}

/// Candidate promoted to the final pairwise comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VeryLikelyEntry {
    pub candidate_id: CandidateId,
    #[serde(default)]
    pub short_name: Option<String>,
    /// Rationale from initial triage
    pub prior_rationale: Option<String>,
    /// Rationale from the grouped selection call
    pub group_rationale: Option<String>,
}

/// Audit entry for a likely candidate that was not selected or not confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedLikelyEntry {
    pub candidate_id: CandidateId,
    pub initial_rationale: Option<String>,
    pub review_rationale: Option<String>,
}

/// Output of the summarization stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    /// None when the summarizer gave no usable verdict
    pub has_match: Option<bool>,
    pub summary: String,
}

/// Draft record for a study that does not exist yet
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewCandidateSuggestion {
    pub short_name: String,
    pub title: Option<String>,
    pub trial_registration_ids: Vec<String>,
    pub countries: Option<String>,
    pub number_participants: Option<String>,
    pub comparison: Option<String>,
    pub status: Option<String>,
    pub rationale: String,
}

// ============================================================================
// Result
// ============================================================================

/// Final outcome of one evaluation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    #[serde(rename = "match")]
    pub match_record: Option<DecisionRecord>,
    pub not_matches: Vec<DecisionRecord>,
    pub unsure: Vec<DecisionRecord>,
    pub likely_matches: Vec<DecisionRecord>,
    pub very_likely: Vec<VeryLikelyEntry>,
    pub evaluation_has_match: Option<bool>,
    pub evaluation_summary: String,
    pub new_candidate_suggestion: Option<NewCandidateSuggestion>,
    pub total_reviewed: usize,
    /// True when the summarizer's verdict disagrees with the match slot
    pub reconciliation_gap: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candidate_id_accepts_numbers_and_strings() {
        let from_int: CandidateId = serde_json::from_value(json!(35006)).unwrap();
        let from_str: CandidateId = serde_json::from_value(json!(" 35006 ")).unwrap();
        assert_eq!(from_int, from_str);
        assert_eq!(serde_json::to_value(&from_int).unwrap(), json!("35006"));
    }

    #[test]
    fn test_candidate_preserves_unknown_fields() {
        let candidate: Candidate = serde_json::from_value(json!({
            "CRGStudyID": 12,
            "ShortName": "Smith 2019",
            "TrialRegistrationID": "NCT01234567; ISRCTN99",
            "Duration": "12 weeks"
        }))
        .unwrap();

        assert_eq!(candidate.id.as_str(), "12");
        assert_eq!(candidate.registration_ids(), vec!["NCT01234567", "ISRCTN99"]);
        assert_eq!(candidate.extra["Duration"], json!("12 weeks"));

        let back = serde_json::to_value(&candidate).unwrap();
        assert_eq!(back["Duration"], json!("12 weeks"));
        assert_eq!(back["CRGStudyID"], json!("12"));
    }

    #[test]
    fn test_aliases_include_every_identifier() {
        let mut candidate = Candidate::new("7", "Lee 2020").with_registration("NCT0001");
        candidate.isrctn = Some("ISRCTN42".into());
        candidate.central_id = Some(CandidateId::new("9007"));
        assert_eq!(candidate.aliases(), vec!["7", "Lee 2020", "NCT0001", "ISRCTN42", "9007"]);
    }

    #[test]
    fn test_decision_wire_names() {
        assert_eq!(serde_json::to_value(Decision::LikelyMatch).unwrap(), json!("likely_match"));
        let parsed: Decision = serde_json::from_value(json!("not_match")).unwrap();
        assert_eq!(parsed, Decision::NotMatch);
    }

    #[test]
    fn test_result_serializes_match_key() {
        let result = EvaluationResult {
            match_record: Some(DecisionRecord::new("3".into(), Decision::Match, "same trial")),
            not_matches: vec![],
            unsure: vec![],
            likely_matches: vec![],
            very_likely: vec![],
            evaluation_has_match: Some(true),
            evaluation_summary: "ok".into(),
            new_candidate_suggestion: None,
            total_reviewed: 1,
            reconciliation_gap: false,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["match"]["candidate_id"], json!("3"));
        assert_eq!(value["match"]["outcome"], json!("match"));
    }
}
