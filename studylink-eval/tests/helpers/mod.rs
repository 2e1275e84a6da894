//! Test Helper Utilities
//!
//! A scripted classifier backend that answers by stage name and records every
//! request it receives.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use studylink_eval::error::ClassifierError;
use studylink_eval::gateway::schema::OutputSchema;
use studylink_eval::gateway::{
    ClassifierBackend, ClassifierGateway, ClassifierRequest, InvocationStrategy, RetryPolicy,
};
use studylink_eval::{Candidate, CandidateId};

pub type Responder = dyn Fn(&ClassifierRequest) -> Result<Value, ClassifierError> + Send + Sync;

/// One recorded backend invocation
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub stage: &'static str,
    pub strategy: InvocationStrategy,
    pub subject: Option<CandidateId>,
    pub system_prompt: String,
    pub payload: Value,
    pub has_attachment: bool,
}

pub struct ScriptedClassifier {
    responder: Box<Responder>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedClassifier {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&ClassifierRequest) -> Result<Value, ClassifierError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, stage: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.stage == stage).collect()
    }
}

#[async_trait]
impl ClassifierBackend for ScriptedClassifier {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        strategy: InvocationStrategy,
        request: &ClassifierRequest,
        _schema: &OutputSchema,
    ) -> Result<Value, ClassifierError> {
        self.calls.lock().unwrap().push(RecordedCall {
            stage: request.stage,
            strategy,
            subject: request.subject.clone(),
            system_prompt: request.system_prompt.clone(),
            payload: request.payload.clone(),
            has_attachment: request.attachment.is_some(),
        });
        (self.responder)(request)
    }
}

/// One retry, no backoff
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        base_backoff: Duration::ZERO,
        call_timeout: Duration::from_secs(5),
    }
}

pub fn gateway(backend: &Arc<ScriptedClassifier>) -> ClassifierGateway {
    ClassifierGateway::new(backend.clone(), fast_policy())
}

pub fn subject(request: &ClassifierRequest) -> &str {
    request.subject.as_ref().map(CandidateId::as_str).unwrap_or("")
}

pub fn decision(decision: &str, rationale: &str) -> Result<Value, ClassifierError> {
    Ok(json!({"decision": decision, "rationale": rationale}))
}

pub fn summary(has_match: bool, text: &str) -> Result<Value, ClassifierError> {
    Ok(json!({"has_match": has_match, "summary": text}))
}

pub fn new_study(short_name: &str) -> Result<Value, ClassifierError> {
    Ok(json!({
        "new_study": {
            "short_name": short_name,
            "title": "Aspirin for secondary stroke prevention",
            "trial_registration_ids": ["NCT09999999"],
            "countries": "Canada",
            "number_participants": "210",
            "comparison": "Aspirin vs placebo",
            "status": null,
            "rationale": "No listed study shares the registration"
        }
    }))
}

pub fn unexpected(request: &ClassifierRequest) -> Result<Value, ClassifierError> {
    Err(ClassifierError::InvalidResponse(format!("unexpected stage {}", request.stage)))
}

/// Candidates `1..=n` named "Study <i>"
pub fn candidates(n: usize) -> Vec<Candidate> {
    (1..=n as i64)
        .map(|i| Candidate::new(i, format!("Study {}", i)))
        .collect()
}
