//! Stage instructions
//!
//! A system prompt is composed as:
//! `background + stage prompt + rationale note + stage notes + attachment note`.
//! The background is not repeated when an override already contains it.
//! Blank overrides are ignored.

use serde::{Deserialize, Serialize};

pub const BACKGROUND_PROMPT: &str = "You are a clinical research assistant deciding whether a newly \
submitted report belongs to a study that already exists in a trials register.";

pub const DEFAULT_INITIAL_EVAL_PROMPT: &str = "First pass. Decide whether the candidate study \
could be the study this report describes. Answer not_match, unsure or likely_match only; a \
definitive match is never given in this pass. Prefer shared trial registration numbers, then \
participant counts, interventions, conditions and authors.";

pub const DEFAULT_LIKELY_GROUP_PROMPT: &str = "The candidates below were all judged likely \
matches. Pick at most two to carry into a final comparison and say why the others were left \
out. Return an empty list if none is strong enough.";

pub const DEFAULT_LIKELY_COMPARE_PROMPT: &str = "Compare the very likely candidates below. Answer \
match with the study_id only when one of them is clearly the study this report describes; \
otherwise answer unsure. Explain why the chosen study wins over the other.";

pub const DEFAULT_UNSURE_REVIEW_PROMPT: &str = "Second pass over a candidate that earlier passes \
could not settle. The rejected likely list is historical context. Answer match only when highly \
confident, otherwise unsure or not_match.";

pub const DEFAULT_LIKELY_REVIEW_PROMPT: &str = "This candidate was once judged a likely match but \
was not confirmed. Its earlier rationales and rejection history are included. Re-examine it \
against the report: answer match only when highly confident, otherwise unsure or not_match.";

pub const DEFAULT_SUMMARY_PROMPT: &str = "Summarize the evaluation for the report using the \
report details and every prior decision. With a match, explain why it matches and why each \
other study does not. Without a match, explain why no study matches and which fields a new \
study record should carry. has_match must reflect your own judgment.";

pub const DEFAULT_SUGGEST_NEW_CANDIDATE_PROMPT: &str = "No existing study matched this report. \
Draft a new study record from the report: a short name in the register's \"Author Year\" style, \
the title, every trial registration id mentioned, countries, number of participants, the \
comparison and the study status when stated. Leave unknown fields null.";

pub const RATIONALE_NOTE: &str = "Keep the rationale short and name the fields that decided it.";

pub const STUDY_ID_NOTE: &str = "Refer to studies by the exact study_id values given in the input.";

pub const SUMMARY_FORMAT_NOTE: &str = "The summary may use Markdown lists; do not wrap it in a code block.";

pub const ATTACHMENT_NOTE: &str = "The attached PDF is the full text of the report being matched \
and the payload metadata describes it. Use it as supporting evidence.";

/// Overridable prompt slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKey {
    Background,
    InitialEval,
    LikelyGroup,
    LikelyCompare,
    UnsureReview,
    LikelyReview,
    Summary,
    SuggestNewCandidate,
    AttachmentNote,
}

impl PromptKey {
    /// Override key as used in requests
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background_prompt",
            Self::InitialEval => "initial_eval_prompt",
            Self::LikelyGroup => "likely_group_prompt",
            Self::LikelyCompare => "likely_compare_prompt",
            Self::UnsureReview => "unsure_review_prompt",
            Self::LikelyReview => "likely_review_prompt",
            Self::Summary => "summary_prompt",
            Self::SuggestNewCandidate => "suggest_new_study_prompt",
            Self::AttachmentNote => "pdf_prompt_note",
        }
    }

    pub fn default_text(self) -> &'static str {
        match self {
            Self::Background => BACKGROUND_PROMPT,
            Self::InitialEval => DEFAULT_INITIAL_EVAL_PROMPT,
            Self::LikelyGroup => DEFAULT_LIKELY_GROUP_PROMPT,
            Self::LikelyCompare => DEFAULT_LIKELY_COMPARE_PROMPT,
            Self::UnsureReview => DEFAULT_UNSURE_REVIEW_PROMPT,
            Self::LikelyReview => DEFAULT_LIKELY_REVIEW_PROMPT,
            Self::Summary => DEFAULT_SUMMARY_PROMPT,
            Self::SuggestNewCandidate => DEFAULT_SUGGEST_NEW_CANDIDATE_PROMPT,
            Self::AttachmentNote => ATTACHMENT_NOTE,
        }
    }

    fn stage_notes(self) -> &'static [&'static str] {
        match self {
            Self::LikelyGroup | Self::LikelyCompare => &[STUDY_ID_NOTE],
            Self::Summary => &[SUMMARY_FORMAT_NOTE],
            _ => &[],
        }
    }
}

/// Per-run prompt overrides (request field `prompt_overrides`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptOverrides {
    pub background_prompt: Option<String>,
    pub initial_eval_prompt: Option<String>,
    pub likely_group_prompt: Option<String>,
    pub likely_compare_prompt: Option<String>,
    pub unsure_review_prompt: Option<String>,
    pub likely_review_prompt: Option<String>,
    pub summary_prompt: Option<String>,
    pub suggest_new_study_prompt: Option<String>,
    pub pdf_prompt_note: Option<String>,
}

impl PromptOverrides {
    /// Non-blank override for a slot
    pub fn get(&self, key: PromptKey) -> Option<&str> {
        let value = match key {
            PromptKey::Background => &self.background_prompt,
            PromptKey::InitialEval => &self.initial_eval_prompt,
            PromptKey::LikelyGroup => &self.likely_group_prompt,
            PromptKey::LikelyCompare => &self.likely_compare_prompt,
            PromptKey::UnsureReview => &self.unsure_review_prompt,
            PromptKey::LikelyReview => &self.likely_review_prompt,
            PromptKey::Summary => &self.summary_prompt,
            PromptKey::SuggestNewCandidate => &self.suggest_new_study_prompt,
            PromptKey::AttachmentNote => &self.pdf_prompt_note,
        };
        value.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Resolves and composes stage system prompts
#[derive(Debug, Clone, Default)]
pub struct PromptCatalog {
    overrides: PromptOverrides,
}

impl PromptCatalog {
    pub fn new(overrides: PromptOverrides) -> Self {
        Self { overrides }
    }

    pub fn text(&self, key: PromptKey) -> &str {
        self.overrides.get(key).unwrap_or_else(|| key.default_text())
    }

    /// Full system prompt for a stage
    pub fn system_prompt(&self, key: PromptKey, attachment_attached: bool) -> String {
        let background = self.text(PromptKey::Background).trim();
        let stage = self.text(key).trim();

        let mut prompt = if background.is_empty() || stage.contains(background) {
            stage.to_string()
        } else {
            format!("{} {}", background, stage)
        };

        append_note(&mut prompt, RATIONALE_NOTE);
        for note in key.stage_notes() {
            append_note(&mut prompt, note);
        }
        if attachment_attached {
            append_note(&mut prompt, self.text(PromptKey::AttachmentNote));
        }
        prompt
    }
}

fn append_note(prompt: &mut String, note: &str) {
    let note = note.trim();
    if note.is_empty() {
        return;
    }
    prompt.push(' ');
    prompt.push_str(note);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_composition() {
        let catalog = PromptCatalog::default();
        let prompt = catalog.system_prompt(PromptKey::LikelyGroup, false);

        assert!(prompt.starts_with(BACKGROUND_PROMPT));
        assert!(prompt.contains(DEFAULT_LIKELY_GROUP_PROMPT));
        assert!(prompt.contains(STUDY_ID_NOTE));
        assert!(!prompt.contains(ATTACHMENT_NOTE));
    }

    #[test]
    fn test_blank_override_is_ignored() {
        let catalog = PromptCatalog::new(PromptOverrides {
            initial_eval_prompt: Some("   ".into()),
            ..PromptOverrides::default()
        });
        assert_eq!(catalog.text(PromptKey::InitialEval), DEFAULT_INITIAL_EVAL_PROMPT);
    }

    #[test]
    fn test_background_not_repeated() {
        let custom = format!("{} Only use registration ids.", BACKGROUND_PROMPT);
        let catalog = PromptCatalog::new(PromptOverrides {
            initial_eval_prompt: Some(custom.clone()),
            ..PromptOverrides::default()
        });
        let prompt = catalog.system_prompt(PromptKey::InitialEval, true);

        assert_eq!(prompt.matches(BACKGROUND_PROMPT).count(), 1);
        assert!(prompt.starts_with(&custom));
        assert!(prompt.ends_with(ATTACHMENT_NOTE));
    }

    #[test]
    fn test_overrides_deserialize_from_request_keys() {
        let overrides: PromptOverrides =
            serde_json::from_str(r#"{"summary_prompt": "Be brief.", "unknown": 1}"#).unwrap();
        assert_eq!(overrides.get(PromptKey::Summary), Some("Be brief."));
        assert_eq!(overrides.get(PromptKey::LikelyReview), None);
    }
}
