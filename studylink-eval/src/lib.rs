//! studylink-eval: match a submitted report against existing studies
//!
//! A run triages every candidate, narrows likely candidates down to at most
//! one definitive match, reviews whatever stayed uncertain, then summarizes
//! and (without a match) drafts a new study record. Runs never fail: every
//! classifier or attachment failure degrades to a safe default.

pub mod attachments;
pub mod buckets;
pub mod config;
pub mod error;
pub mod gateway;
pub mod output;
pub mod payloads;
pub mod progress;
pub mod prompts;
pub mod resolver;
pub mod types;
pub mod workflow;

pub use crate::attachments::{AttachmentHandle, AttachmentProvider};
pub use crate::config::{EvaluateRequest, EvaluationConfig};
pub use crate::gateway::{ClassifierGateway, ClassifierVariant, RetryPolicy};
pub use crate::types::{Candidate, CandidateId, Decision, DecisionRecord, EvaluationResult, Report};

use crate::progress::{ChannelEmitter, NullEmitter, ProgressEmitter};
use crate::workflow::{RunContext, StageGraph};
use futures::Stream;
use std::sync::Arc;
use studylink_common::events::ProgressEvent;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

/// Shared collaborators for evaluation runs
///
/// Cheap to clone; distinct runs may execute concurrently and share only the
/// attachment cache behind the provider.
#[derive(Clone)]
pub struct Evaluator {
    gateway: ClassifierGateway,
    attachments: Option<Arc<AttachmentProvider>>,
}

impl Evaluator {
    pub fn new(gateway: ClassifierGateway, attachments: Option<Arc<AttachmentProvider>>) -> Self {
        Self { gateway, attachments }
    }

    /// Run one evaluation to completion
    pub async fn evaluate(&self, report: Report, candidates: Vec<Candidate>, config: EvaluationConfig) -> EvaluationResult {
        let ctx = RunContext::new(report, candidates, config, self.gateway.clone(), self.attachments.clone());
        run(ctx, &NullEmitter).await
    }

    /// Run one evaluation on its own task, streaming one event per stage
    ///
    /// The stream ends with [`ProgressEvent::Complete`]. Dropping the stream
    /// does not stop the run; the returned handle still yields the result.
    pub fn evaluate_stream(
        &self,
        report: Report,
        candidates: Vec<Candidate>,
        config: EvaluationConfig,
    ) -> (JoinHandle<EvaluationResult>, impl Stream<Item = ProgressEvent>) {
        let (emitter, mut rx) = ChannelEmitter::channel();
        let ctx = RunContext::new(report, candidates, config, self.gateway.clone(), self.attachments.clone());
        let handle = tokio::spawn(async move { run(ctx, &emitter).await });

        let events = async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
            yield ProgressEvent::Complete;
        };

        (handle, events)
    }
}

/// Run one evaluation with a fresh [`Evaluator`]
pub async fn evaluate(
    report: Report,
    candidates: Vec<Candidate>,
    config: EvaluationConfig,
    gateway: ClassifierGateway,
    attachments: Option<Arc<AttachmentProvider>>,
) -> EvaluationResult {
    Evaluator::new(gateway, attachments)
        .evaluate(report, candidates, config)
        .await
}

async fn run(ctx: RunContext, emitter: &dyn ProgressEmitter) -> EvaluationResult {
    let span = info_span!(
        "evaluation",
        run_id = %ctx.run_id,
        report_id = ctx.report.report_id,
        variant = %ctx.config.variant
    );

    async {
        info!(
            candidates = ctx.candidates.len(),
            backend = ctx.gateway.backend_name(),
            "Starting evaluation"
        );

        let state = StageGraph::standard().run(&ctx, emitter).await;
        if state.reconciliation_gap() {
            warn!(
                match_set = state.match_slot.is_set(),
                "Summarizer verdict disagrees with the match slot"
            );
        }

        let result = state.into_result();
        info!(
            matched = ?result.match_record.as_ref().map(|r| r.candidate_id.as_str()),
            has_match = ?result.evaluation_has_match,
            total_reviewed = result.total_reviewed,
            "Evaluation complete"
        );
        result
    }
    .instrument(span)
    .await
}
