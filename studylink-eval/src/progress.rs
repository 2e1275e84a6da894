//! Progress events
//!
//! One [`ProgressEvent::Node`] per stage transition, described from the
//! stage's delta before it is merged. Emitters never block the workflow and
//! never fail it: an emitter whose consumer went away just drops events.

use crate::buckets::BucketOp;
use crate::types::Decision;
use crate::workflow::{RunContext, Stage, StateDelta};
use serde_json::{json, Value};
use studylink_common::events::ProgressEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// Sink for progress events
pub trait ProgressEmitter: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmitter;

impl ProgressEmitter for NullEmitter {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelEmitter {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl ProgressEmitter for ChannelEmitter {
    fn emit(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            // Consumer disconnected; the run continues regardless
            debug!("Progress receiver dropped; discarding event");
        }
    }
}

/// Describe what a stage did
pub fn describe(stage: Stage, delta: &StateDelta, ctx: &RunContext) -> ProgressEvent {
    let (message, details) = match stage {
        Stage::PrepareAttachment => {
            let status = delta.attachment.as_ref().map(|(status, _)| *status);
            (
                outcome_text(delta).unwrap_or_else(|| "Attachment step complete.".to_string()),
                Some(json!({"attachment_status": status})),
            )
        }
        Stage::LoadNextInitial => match delta.current.as_ref().and_then(Option::as_ref) {
            Some(id) => {
                let name = ctx.candidate(id).map(|c| c.display_name()).unwrap_or(id.as_str());
                (
                    format!(
                        "Evaluating study {} of {}: {}",
                        delta.cursor.unwrap_or_default(),
                        ctx.candidates.len(),
                        name
                    ),
                    Some(json!({"candidate_id": id})),
                )
            }
            None => ("No more studies.".to_string(), None),
        },
        Stage::ClassifyInitial => decision_message("Initial classification", delta),
        Stage::SelectVeryLikely => {
            let selected: Vec<&str> = delta
                .bucket_ops
                .iter()
                .filter_map(|op| match op {
                    BucketOp::PromoteVeryLikely(entry) => Some(entry.candidate_id.as_str()),
                    _ => None,
                })
                .collect();
            let message = if selected.is_empty() {
                format!(
                    "No very_likely candidates selected. {}",
                    outcome_text(delta).unwrap_or_default()
                )
            } else {
                format!("Selected very_likely candidates: {}", selected.join(", "))
            };
            (message.trim_end().to_string(), Some(json!({"very_likely_ids": selected})))
        }
        Stage::CompareVeryLikely => match &delta.set_match {
            Some(record) => (
                format!("Match found! {}: {}", record.candidate_id, record.rationale),
                Some(json!({"candidate_id": record.candidate_id, "decision": record.outcome})),
            ),
            None => (
                format!(
                    "No definitive match among very_likely candidates. {}",
                    outcome_text(delta).unwrap_or_default()
                )
                .trim_end()
                .to_string(),
                None,
            ),
        },
        Stage::PrepareUnsureReview => {
            let queued = delta.unsure_queue.as_ref().map(Vec::len).unwrap_or_default();
            (
                format!("Prepared unsure review queue ({} studies).", queued),
                Some(json!({"queued": queued})),
            )
        }
        Stage::LoadNextUnsure => match delta.current.as_ref().and_then(Option::as_ref) {
            Some(id) => (format!("Reviewing study {}", id), Some(json!({"candidate_id": id}))),
            None => ("Unsure review complete.".to_string(), None),
        },
        Stage::ClassifyUnsure => match &delta.set_match {
            Some(record) => (
                format!("Match found! {}: {}", record.candidate_id, record.rationale),
                Some(json!({"candidate_id": record.candidate_id, "decision": record.outcome})),
            ),
            None => decision_message("Review", delta),
        },
        Stage::MatchNotFound => ("No match found after all reviews.".to_string(), None),
        Stage::Summarize => match &delta.summary {
            Some(summary) => (
                summary.summary.clone(),
                Some(json!({"has_match": summary.has_match})),
            ),
            None => ("Summary unavailable.".to_string(), None),
        },
        Stage::SuggestNewCandidate => match &delta.suggestion {
            Some(suggestion) => (
                format!("Suggested a new study draft: {}", suggestion.short_name),
                Some(json!({"short_name": suggestion.short_name})),
            ),
            None => (
                outcome_text(delta).unwrap_or_else(|| "No new study suggestion.".to_string()),
                None,
            ),
        },
    };

    ProgressEvent::node(stage.as_str(), message, details)
}

fn outcome_text(delta: &StateDelta) -> Option<String> {
    delta.outcome.as_ref().map(|o| o.rationale.clone())
}

fn decision_message(label: &str, delta: &StateDelta) -> (String, Option<Value>) {
    match &delta.outcome {
        Some(outcome) => {
            let decision = outcome.decision.map(Decision::as_str).unwrap_or("none");
            (
                format!("{}: {}. {}", label, decision, outcome.rationale),
                Some(json!({"candidate_id": outcome.candidate_id, "decision": outcome.decision})),
            )
        }
        None => (format!("{}: no decision.", label), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvaluationConfig;
    use crate::error::ClassifierError;
    use crate::gateway::schema::OutputSchema;
    use crate::gateway::{ClassifierBackend, ClassifierGateway, ClassifierRequest, InvocationStrategy, RetryPolicy};
    use crate::types::{Candidate, DecisionRecord, Report, VeryLikelyEntry};
    use crate::workflow::StageOutcome;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Unused;

    #[async_trait]
    impl ClassifierBackend for Unused {
        fn name(&self) -> &str {
            "unused"
        }

        async fn invoke(
            &self,
            _strategy: InvocationStrategy,
            _request: &ClassifierRequest,
            _schema: &OutputSchema,
        ) -> Result<Value, ClassifierError> {
            Err(ClassifierError::Transport("unused".into()))
        }
    }

    fn context() -> RunContext {
        RunContext::new(
            Report::new(1, "Trial"),
            vec![Candidate::new("7", "Lee 2020"), Candidate::new("8", "Kim 2021")],
            EvaluationConfig::default(),
            ClassifierGateway::new(Arc::new(Unused), RetryPolicy::default()),
            None,
        )
    }

    #[test]
    fn test_initial_classification_message() {
        let record = DecisionRecord::new("7".into(), Decision::LikelyMatch, "same registration");
        let delta = StateDelta::with_outcome(StageOutcome::for_record(&record));
        let event = describe(Stage::ClassifyInitial, &delta, &context());

        match event {
            ProgressEvent::Node { node, message, details } => {
                assert_eq!(node, "classify_initial");
                assert_eq!(message, "Initial classification: likely_match. same registration");
                assert_eq!(details.unwrap()["candidate_id"], "7");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_selection_lists_promoted_ids() {
        let delta = StateDelta {
            bucket_ops: vec![BucketOp::PromoteVeryLikely(VeryLikelyEntry {
                candidate_id: "8".into(),
                short_name: None,
                prior_rationale: None,
                group_rationale: None,
            })],
            ..StateDelta::default()
        };
        let event = describe(Stage::SelectVeryLikely, &delta, &context());
        assert_eq!(event.node_name(), Some("select_very_likely"));
        match event {
            ProgressEvent::Node { message, .. } => assert_eq!(message, "Selected very_likely candidates: 8"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_load_next_names_the_study() {
        let delta = StateDelta {
            cursor: Some(2),
            current: Some(Some("8".into())),
            ..StateDelta::default()
        };
        match describe(Stage::LoadNextInitial, &delta, &context()) {
            ProgressEvent::Node { message, .. } => assert_eq!(message, "Evaluating study 2 of 2: Kim 2021"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_exhausted_initial_cursor_message() {
        let delta = StateDelta {
            current: Some(None),
            ..StateDelta::default()
        };
        match describe(Stage::LoadNextInitial, &delta, &context()) {
            ProgressEvent::Node { node, message, details } => {
                assert_eq!(node, "load_next_initial");
                assert_eq!(message, "No more studies.");
                assert!(details.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_channel_emitter_survives_dropped_receiver() {
        let (emitter, rx) = ChannelEmitter::channel();
        drop(rx);
        emitter.emit(ProgressEvent::Complete);
    }
}
