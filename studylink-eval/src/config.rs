//! Per-run evaluation options
//!
//! Process-wide settings (endpoints, keys, retry policy) live in
//! [`studylink_common::config::StudylinkConfig`] and are resolved once at
//! startup. Everything here varies per evaluation request.

use crate::gateway::ClassifierVariant;
use crate::prompts::PromptOverrides;
use crate::types::{Candidate, Report};
use serde::{Deserialize, Serialize};
use studylink_common::{Error, Result};

/// Options for one evaluation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub prompt_overrides: PromptOverrides,
    pub variant: ClassifierVariant,
    /// Sampling temperature (0.0 - 2.0); ignored by variants without sampling control
    pub temperature: Option<f32>,
    /// Free-text guidance from the human reviewer, sent with every call
    pub reviewer_instructions: Option<String>,
    /// Fetch and attach the report PDF
    pub include_attachment: bool,
}

/// Evaluate request document (as accepted by the command-line entry point)
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluateRequest {
    pub report: Report,
    #[serde(default)]
    pub studies: Vec<Candidate>,
    #[serde(default)]
    pub model: Option<ClassifierVariant>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub prompt_overrides: Option<PromptOverrides>,
    #[serde(default)]
    pub evaluation_prompt: Option<String>,
    #[serde(default)]
    pub include_pdf: bool,
}

impl EvaluateRequest {
    pub fn from_json(json: &str) -> Result<Self> {
        let request: Self = serde_json::from_str(json)?;
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(Error::InvalidInput(format!(
                    "temperature must be between 0 and 2, got {}",
                    t
                )));
            }
        }
        Ok(())
    }

    /// Split into run inputs; `default_variant` applies when the request names no model
    pub fn into_parts(self, default_variant: ClassifierVariant) -> (Report, Vec<Candidate>, EvaluationConfig) {
        let config = EvaluationConfig {
            prompt_overrides: self.prompt_overrides.unwrap_or_default(),
            variant: self.model.unwrap_or(default_variant),
            temperature: self.temperature,
            reviewer_instructions: self.evaluation_prompt.filter(|s| !s.trim().is_empty()),
            include_attachment: self.include_pdf,
        };
        (self.report, self.studies, config)
    }
}
