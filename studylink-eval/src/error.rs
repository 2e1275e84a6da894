//! Error types for studylink-eval
//!
//! None of these abort an evaluation run. Stage handlers map them to a safe
//! default outcome and record the failure class in the rationale.

use crate::types::CandidateId;
use thiserror::Error;

/// Backend-level classifier failure
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// Strategy cannot be used with this backend/variant (no retry consumed)
    #[error("Strategy setup failed: {0}")]
    Setup(String),

    /// Network or connection failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Per-call timeout elapsed
    #[error("Classifier call timed out after {0} ms")]
    Timeout(u64),

    /// Non-success HTTP status
    #[error("Classifier API error {status}: {body}")]
    Api { status: u16, body: String },

    /// Response did not parse or validate against the stage schema
    #[error("Invalid classifier response: {0}")]
    InvalidResponse(String),
}

impl ClassifierError {
    /// Short failure class name used in rationales and logs
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Setup(_) => "SetupError",
            Self::Transport(_) => "TransportError",
            Self::Timeout(_) => "TimeoutError",
            Self::Api { .. } => "ApiError",
            Self::InvalidResponse(_) => "InvalidResponseError",
        }
    }
}

impl From<reqwest::Error> for ClassifierError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(0)
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Every strategy and attempt failed
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Classifier exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: ClassifierError,
    },
}

impl GatewayError {
    /// Failure class of the last attempt (e.g. "TimeoutError")
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Exhausted { last, .. } => last.class_name(),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Identifier could not be mapped to exactly one candidate
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Empty identifier")]
    Empty,

    #[error("Ambiguous identifier; matches {0:?}")]
    Ambiguous(Vec<CandidateId>),

    #[error("Identifier not found")]
    NotFound,
}

/// Attachment fetch or upload failure
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Document store transport error: {0}")]
    Transport(String),

    #[error("Document store returned status {0}")]
    Status(u16),

    #[error("Upload failed: {0}")]
    Upload(String),
}

impl From<reqwest::Error> for AttachmentError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
