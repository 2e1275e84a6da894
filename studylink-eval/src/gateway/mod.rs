//! Classifier Gateway
//!
//! The only path from pipeline stages to the classifier. One call to
//! [`ClassifierGateway::invoke`] tries two invocation strategies in fixed order
//! (`structured`, then `function_call`). Within a strategy it retries any
//! failure up to `max_retries` times with exponential backoff; a response that
//! fails schema validation counts as a failure. A strategy whose setup fails
//! is skipped without consuming retry budget.
//!
//! Worst case per call: `(max_retries + 1) * 2` backend invocations.

pub mod openai;
pub mod schema;

use crate::attachments::AttachmentHandle;
use crate::error::{ClassifierError, GatewayError};
use crate::types::CandidateId;
use async_trait::async_trait;
use schema::{OutputSchema, StageOutput};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use studylink_common::config::ClassifierSettings;
use tracing::{debug, info, warn};

/// How a backend is asked for structured output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationStrategy {
    /// JSON-schema constrained response format
    Structured,
    /// Forced tool call whose arguments carry the output
    FunctionCall,
}

impl InvocationStrategy {
    /// Fallback order
    pub const ORDER: [Self; 2] = [Self::Structured, Self::FunctionCall];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::FunctionCall => "function_call",
        }
    }
}

/// Classifier model variant selectable per run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClassifierVariant {
    #[serde(rename = "gpt-5.2")]
    Gpt52,
    #[default]
    #[serde(rename = "gpt-5")]
    Gpt5,
    #[serde(rename = "gpt-5-mini")]
    Gpt5Mini,
    #[serde(rename = "gpt-4.1")]
    Gpt41,
}

impl ClassifierVariant {
    pub fn model_name(self) -> &'static str {
        match self {
            Self::Gpt52 => "gpt-5.2",
            Self::Gpt5 => "gpt-5",
            Self::Gpt5Mini => "gpt-5-mini",
            Self::Gpt41 => "gpt-4.1",
        }
    }

    /// Reasoning variants only accept the default sampling temperature
    pub fn supports_temperature(self) -> bool {
        matches!(self, Self::Gpt41)
    }
}

impl fmt::Display for ClassifierVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.model_name())
    }
}

impl FromStr for ClassifierVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "gpt-5.2" => Ok(Self::Gpt52),
            "gpt-5" => Ok(Self::Gpt5),
            "gpt-5-mini" => Ok(Self::Gpt5Mini),
            "gpt-4.1" => Ok(Self::Gpt41),
            other => Err(format!("Unknown classifier variant: {}", other)),
        }
    }
}

/// Retry/backoff/timeout policy, resolved once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries per strategy (attempts per strategy = max_retries + 1)
    pub max_retries: u32,
    /// Delay before retry n (0-based) is `base_backoff * 2^n`
    pub base_backoff: Duration,
    /// Bound on a single backend invocation
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &ClassifierSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_backoff: Duration::from_millis(settings.backoff_base_ms),
            call_timeout: Duration::from_secs(settings.timeout_secs.max(1)),
        }
    }

    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }

    /// Upper bound on backend invocations for one gateway call
    pub fn max_invocations(&self) -> u32 {
        (self.max_retries + 1) * InvocationStrategy::ORDER.len() as u32
    }
}

/// One stage's request to the classifier
#[derive(Debug, Clone)]
pub struct ClassifierRequest {
    /// Stage name, for logs
    pub stage: &'static str,
    pub system_prompt: String,
    /// Sent as an additional system message ahead of the payload
    pub reviewer_instructions: Option<String>,
    pub payload: Value,
    pub attachment: Option<AttachmentHandle>,
    pub variant: ClassifierVariant,
    pub temperature: Option<f32>,
    /// Candidate under review, for logs
    pub subject: Option<CandidateId>,
}

/// Transport to a concrete classifier
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Check a strategy can be used for this request
    ///
    /// An error here skips the strategy without consuming retries.
    fn prepare(
        &self,
        _strategy: InvocationStrategy,
        _request: &ClassifierRequest,
        _schema: &OutputSchema,
    ) -> Result<(), ClassifierError> {
        Ok(())
    }

    /// Perform one invocation and return the raw structured value
    async fn invoke(
        &self,
        strategy: InvocationStrategy,
        request: &ClassifierRequest,
        schema: &OutputSchema,
    ) -> Result<Value, ClassifierError>;
}

/// Retrying, validating front end over a [`ClassifierBackend`]
#[derive(Clone)]
pub struct ClassifierGateway {
    backend: Arc<dyn ClassifierBackend>,
    policy: RetryPolicy,
}

impl ClassifierGateway {
    pub fn new(backend: Arc<dyn ClassifierBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Invoke the classifier and validate the output as `T`
    pub async fn invoke<T: StageOutput>(&self, request: &ClassifierRequest) -> Result<T, GatewayError> {
        let schema = T::schema();
        let mut attempts = 0u32;
        let mut last: Option<ClassifierError> = None;

        for strategy in InvocationStrategy::ORDER {
            if let Err(e) = self.backend.prepare(strategy, request, &schema) {
                info!(
                    stage = request.stage,
                    strategy = strategy.as_str(),
                    error = %e,
                    "Invocation strategy unavailable, falling back"
                );
                last = Some(e);
                continue;
            }

            for retry in 0..=self.policy.max_retries {
                if retry > 0 {
                    let delay = self.policy.backoff_for(retry - 1);
                    debug!(
                        stage = request.stage,
                        strategy = strategy.as_str(),
                        backoff_ms = delay.as_millis() as u64,
                        "Backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                }

                attempts += 1;
                match self.attempt::<T>(strategy, request, &schema).await {
                    Ok(output) => {
                        if attempts > 1 {
                            debug!(
                                stage = request.stage,
                                strategy = strategy.as_str(),
                                attempt = attempts,
                                "Classifier call succeeded after retry"
                            );
                        }
                        return Ok(output);
                    }
                    Err(e) => {
                        warn!(
                            stage = request.stage,
                            candidate_id = ?request.subject.as_ref().map(CandidateId::as_str),
                            strategy = strategy.as_str(),
                            attempt = attempts,
                            error_class = e.class_name(),
                            error = %e,
                            "Classifier attempt failed"
                        );
                        last = Some(e);
                    }
                }
            }
        }

        let last = last.unwrap_or_else(|| ClassifierError::Setup("no invocation strategy ran".to_string()));
        warn!(
            stage = request.stage,
            attempts,
            max_attempts = self.policy.max_invocations(),
            error_class = last.class_name(),
            "Classifier exhausted all strategies"
        );
        Err(GatewayError::Exhausted { attempts, last })
    }

    async fn attempt<T: StageOutput>(
        &self,
        strategy: InvocationStrategy,
        request: &ClassifierRequest,
        schema: &OutputSchema,
    ) -> Result<T, ClassifierError> {
        let call = self.backend.invoke(strategy, request, schema);
        let value = match tokio::time::timeout(self.policy.call_timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClassifierError::Timeout(
                    self.policy.call_timeout.as_millis() as u64,
                ))
            }
        };
        T::from_value(value).map_err(ClassifierError::InvalidResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::schema::ReviewVerdict;
    use super::*;
    use crate::types::Decision;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays canned results in order and records the strategy of each call
    struct Replay {
        results: Mutex<Vec<Result<Value, ClassifierError>>>,
        strategies: Mutex<Vec<InvocationStrategy>>,
        calls: AtomicU32,
        structured_unavailable: bool,
    }

    impl Replay {
        fn new(mut results: Vec<Result<Value, ClassifierError>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                strategies: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
                structured_unavailable: false,
            }
        }
    }

    #[async_trait]
    impl ClassifierBackend for Replay {
        fn name(&self) -> &str {
            "replay"
        }

        fn prepare(
            &self,
            strategy: InvocationStrategy,
            _request: &ClassifierRequest,
            _schema: &OutputSchema,
        ) -> Result<(), ClassifierError> {
            if self.structured_unavailable && strategy == InvocationStrategy::Structured {
                return Err(ClassifierError::Setup("no json_schema support".into()));
            }
            Ok(())
        }

        async fn invoke(
            &self,
            strategy: InvocationStrategy,
            _request: &ClassifierRequest,
            _schema: &OutputSchema,
        ) -> Result<Value, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.strategies.lock().unwrap().push(strategy);
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ClassifierError::Transport("no more results".into())))
        }
    }

    fn request() -> ClassifierRequest {
        ClassifierRequest {
            stage: "classify_unsure",
            system_prompt: "review".into(),
            reviewer_instructions: None,
            payload: json!({}),
            attachment: None,
            variant: ClassifierVariant::default(),
            temperature: None,
            subject: Some("1".into()),
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::ZERO,
            call_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(2000));
        assert_eq!(policy.max_invocations(), 4);
    }

    #[test]
    fn test_variant_names() {
        assert_eq!("gpt-5-mini".parse::<ClassifierVariant>(), Ok(ClassifierVariant::Gpt5Mini));
        assert!("gpt-3".parse::<ClassifierVariant>().is_err());
        assert_eq!(serde_json::to_value(ClassifierVariant::Gpt52).unwrap(), json!("gpt-5.2"));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let backend = Arc::new(Replay::new(vec![
            Err(ClassifierError::Transport("reset".into())),
            Ok(json!({"decision": "not_match", "rationale": "different population"})),
        ]));
        let gateway = ClassifierGateway::new(backend.clone(), fast_policy(1));

        let verdict: ReviewVerdict = gateway.invoke(&request()).await.unwrap();
        assert_eq!(verdict.decision, Decision::NotMatch);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *backend.strategies.lock().unwrap(),
            vec![InvocationStrategy::Structured, InvocationStrategy::Structured]
        );
    }

    #[tokio::test]
    async fn test_invalid_output_falls_through_to_function_call() {
        let backend = Arc::new(Replay::new(vec![
            Ok(json!({"decision": "likely_match", "rationale": "x"})),
            Ok(json!("garbage")),
            Ok(json!({"decision": "unsure", "rationale": "thin evidence"})),
        ]));
        let gateway = ClassifierGateway::new(backend.clone(), fast_policy(1));

        let verdict: ReviewVerdict = gateway.invoke(&request()).await.unwrap();
        assert_eq!(verdict.decision, Decision::Unsure);
        assert_eq!(backend.strategies.lock().unwrap()[2], InvocationStrategy::FunctionCall);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let backend = Arc::new(Replay::new(vec![]));
        let gateway = ClassifierGateway::new(backend.clone(), fast_policy(2));

        let err = gateway.invoke::<ReviewVerdict>(&request()).await.unwrap_err();
        assert_eq!(err.attempts(), 6);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 6);
        assert_eq!(err.class_name(), "TransportError");
    }

    #[tokio::test]
    async fn test_setup_failure_does_not_consume_retries() {
        let mut replay = Replay::new(vec![
            Err(ClassifierError::Api { status: 500, body: "oops".into() }),
            Ok(json!({"decision": "match", "rationale": "same registration"})),
        ]);
        replay.structured_unavailable = true;
        let backend = Arc::new(replay);
        let gateway = ClassifierGateway::new(backend.clone(), fast_policy(1));

        let verdict: ReviewVerdict = gateway.invoke(&request()).await.unwrap();
        assert_eq!(verdict.decision, Decision::Match);
        assert_eq!(
            *backend.strategies.lock().unwrap(),
            vec![InvocationStrategy::FunctionCall, InvocationStrategy::FunctionCall]
        );
    }

    struct Stalls;

    #[async_trait]
    impl ClassifierBackend for Stalls {
        fn name(&self) -> &str {
            "stalls"
        }

        async fn invoke(
            &self,
            _strategy: InvocationStrategy,
            _request: &ClassifierRequest,
            _schema: &OutputSchema,
        ) -> Result<Value, ClassifierError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure_class() {
        let policy = RetryPolicy {
            max_retries: 0,
            base_backoff: Duration::ZERO,
            call_timeout: Duration::from_millis(10),
        };
        let gateway = ClassifierGateway::new(Arc::new(Stalls), policy);
        let err = gateway.invoke::<ReviewVerdict>(&request()).await.unwrap_err();
        assert_eq!(err.class_name(), "TimeoutError");
        assert_eq!(err.attempts(), 2);
    }
}
