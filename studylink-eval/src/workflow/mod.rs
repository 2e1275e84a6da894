//! Evaluation workflow state machine
//!
//! Stages are plain functions `(context, state) -> delta` held in a dispatch
//! table together with a pure router `state -> next`. The runner merges each
//! delta into [`PipelineState`], emits one progress event, then asks the
//! router where to go:
//!
//! ```text
//! prepare_attachment → load_next_initial ⇄ classify_initial
//!   → select_very_likely → [compare_very_likely] → summarize (match)
//!   → prepare_unsure_review → load_next_unsure ⇄ classify_unsure
//!   → match_not_found → summarize → [suggest_new_candidate]
//! ```

pub mod stages;

use crate::attachments::{AttachmentHandle, AttachmentProvider};
use crate::buckets::{BucketOp, BucketStore, MatchSlot};
use crate::config::EvaluationConfig;
use crate::gateway::{ClassifierGateway, ClassifierRequest};
use crate::payloads;
use crate::progress::{self, ProgressEmitter};
use crate::prompts::{PromptCatalog, PromptKey};
use crate::types::{
    Candidate, CandidateId, Decision, DecisionRecord, EvaluationResult, EvaluationSummary,
    NewCandidateSuggestion, Report,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

// ============================================================================
// Stages and routing
// ============================================================================

/// Named workflow stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PrepareAttachment,
    LoadNextInitial,
    ClassifyInitial,
    SelectVeryLikely,
    CompareVeryLikely,
    PrepareUnsureReview,
    LoadNextUnsure,
    ClassifyUnsure,
    MatchNotFound,
    Summarize,
    SuggestNewCandidate,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::PrepareAttachment,
        Stage::LoadNextInitial,
        Stage::ClassifyInitial,
        Stage::SelectVeryLikely,
        Stage::CompareVeryLikely,
        Stage::PrepareUnsureReview,
        Stage::LoadNextUnsure,
        Stage::ClassifyUnsure,
        Stage::MatchNotFound,
        Stage::Summarize,
        Stage::SuggestNewCandidate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrepareAttachment => "prepare_attachment",
            Self::LoadNextInitial => "load_next_initial",
            Self::ClassifyInitial => "classify_initial",
            Self::SelectVeryLikely => "select_very_likely",
            Self::CompareVeryLikely => "compare_very_likely",
            Self::PrepareUnsureReview => "prepare_unsure_review",
            Self::LoadNextUnsure => "load_next_unsure",
            Self::ClassifyUnsure => "classify_unsure",
            Self::MatchNotFound => "match_not_found",
            Self::Summarize => "summarize",
            Self::SuggestNewCandidate => "suggest_new_candidate",
        }
    }
}

/// Router result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Stage(Stage),
    End,
}

impl Next {
    pub fn stage(self) -> Option<Stage> {
        match self {
            Self::Stage(stage) => Some(stage),
            Self::End => None,
        }
    }
}

pub type StageHandler = for<'a> fn(&'a RunContext, &'a PipelineState) -> BoxFuture<'a, StateDelta>;
pub type Router = fn(&PipelineState) -> Next;

/// Dispatch table entry
#[derive(Clone, Copy)]
pub struct StageNode {
    pub handler: StageHandler,
    pub router: Router,
}

fn after_prepare_attachment(_: &PipelineState) -> Next {
    Next::Stage(Stage::LoadNextInitial)
}

fn after_load_next_initial(state: &PipelineState) -> Next {
    if state.current.is_some() {
        Next::Stage(Stage::ClassifyInitial)
    } else {
        Next::Stage(Stage::SelectVeryLikely)
    }
}

fn after_classify_initial(_: &PipelineState) -> Next {
    Next::Stage(Stage::LoadNextInitial)
}

fn after_select_very_likely(state: &PipelineState) -> Next {
    if state.buckets.very_likely.is_empty() {
        Next::Stage(Stage::PrepareUnsureReview)
    } else {
        Next::Stage(Stage::CompareVeryLikely)
    }
}

fn after_compare_very_likely(state: &PipelineState) -> Next {
    if state.match_slot.is_set() {
        Next::Stage(Stage::Summarize)
    } else {
        Next::Stage(Stage::PrepareUnsureReview)
    }
}

fn after_prepare_unsure_review(_: &PipelineState) -> Next {
    Next::Stage(Stage::LoadNextUnsure)
}

fn after_load_next_unsure(state: &PipelineState) -> Next {
    if state.match_slot.is_set() {
        Next::Stage(Stage::Summarize)
    } else if state.current.is_none() {
        Next::Stage(Stage::MatchNotFound)
    } else {
        Next::Stage(Stage::ClassifyUnsure)
    }
}

fn after_classify_unsure(_: &PipelineState) -> Next {
    Next::Stage(Stage::LoadNextUnsure)
}

fn after_match_not_found(_: &PipelineState) -> Next {
    Next::Stage(Stage::Summarize)
}

/// Follows the summarizer's own verdict, even when it disagrees with the match slot
fn after_summarize(state: &PipelineState) -> Next {
    match state.summary.as_ref().and_then(|s| s.has_match) {
        Some(false) => Next::Stage(Stage::SuggestNewCandidate),
        Some(true) if !state.match_slot.is_set() => Next::Stage(Stage::SuggestNewCandidate),
        _ => Next::End,
    }
}

fn after_suggest_new_candidate(_: &PipelineState) -> Next {
    Next::End
}

// ============================================================================
// State
// ============================================================================

/// Report attachment status for the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    #[default]
    Disabled,
    Attached,
    Missing,
}

/// Verdict of the stage that ran last
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub candidate_id: Option<CandidateId>,
    pub decision: Option<Decision>,
    pub rationale: String,
}

impl StageOutcome {
    pub fn note(rationale: impl Into<String>) -> Self {
        Self {
            candidate_id: None,
            decision: None,
            rationale: rationale.into(),
        }
    }

    pub fn for_record(record: &DecisionRecord) -> Self {
        Self {
            candidate_id: Some(record.candidate_id.clone()),
            decision: Some(record.outcome),
            rationale: record.rationale.clone(),
        }
    }
}

/// One routing step (`to == None` means the run ended)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Option<Stage>,
    pub transitioned_at: DateTime<Utc>,
}

/// Mutable side of a run
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pub buckets: BucketStore,
    pub match_slot: MatchSlot,
    /// Initial-pass position in the candidate list
    pub cursor: usize,
    pub current: Option<CandidateId>,
    pub unsure_queue: Vec<CandidateId>,
    pub unsure_cursor: usize,
    pub attachment_status: AttachmentStatus,
    pub attachment: Option<AttachmentHandle>,
    pub summary: Option<EvaluationSummary>,
    pub suggestion: Option<NewCandidateSuggestion>,
    pub last_outcome: Option<StageOutcome>,
    pub history: Vec<StageTransition>,
    pub steps: usize,
}

/// Partial update returned by a stage; `None` fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    pub cursor: Option<usize>,
    pub current: Option<Option<CandidateId>>,
    /// Replaces the queue and resets its cursor to `unsure_cursor` (or 0)
    pub unsure_queue: Option<Vec<CandidateId>>,
    pub unsure_cursor: Option<usize>,
    pub attachment: Option<(AttachmentStatus, Option<AttachmentHandle>)>,
    pub bucket_ops: Vec<BucketOp>,
    pub set_match: Option<DecisionRecord>,
    pub summary: Option<EvaluationSummary>,
    pub suggestion: Option<NewCandidateSuggestion>,
    pub outcome: Option<StageOutcome>,
}

impl StateDelta {
    pub fn with_outcome(outcome: StageOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Self::default()
        }
    }
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a stage's delta
    ///
    /// Cursors only move forward except when a new unsure queue is installed,
    /// and the match slot is never overwritten.
    pub fn merge(&mut self, delta: StateDelta) {
        if let Some(cursor) = delta.cursor {
            if cursor < self.cursor {
                warn!(from = self.cursor, to = cursor, "Ignoring backwards initial cursor");
            } else {
                self.cursor = cursor;
            }
        }

        if let Some(current) = delta.current {
            self.current = current;
        }

        match delta.unsure_queue {
            Some(queue) => {
                self.unsure_queue = queue;
                self.unsure_cursor = delta.unsure_cursor.unwrap_or(0);
            }
            None => {
                if let Some(cursor) = delta.unsure_cursor {
                    if cursor < self.unsure_cursor {
                        warn!(from = self.unsure_cursor, to = cursor, "Ignoring backwards unsure cursor");
                    } else {
                        self.unsure_cursor = cursor;
                    }
                }
            }
        }

        if let Some((status, handle)) = delta.attachment {
            self.attachment_status = status;
            self.attachment = handle;
        }

        for op in delta.bucket_ops {
            self.buckets.apply(op);
        }

        if let Some(record) = delta.set_match {
            let candidate_id = record.candidate_id.clone();
            if !self.match_slot.set(record) {
                warn!(
                    candidate_id = %candidate_id,
                    existing = ?self.match_slot.id().map(CandidateId::as_str),
                    "Match already set; keeping the first"
                );
            }
        }

        if let Some(summary) = delta.summary {
            self.summary = Some(summary);
        }
        if let Some(suggestion) = delta.suggestion {
            self.suggestion = Some(suggestion);
        }
        self.last_outcome = delta.outcome;
    }

    /// True when the summarizer's verdict disagrees with the match slot
    pub fn reconciliation_gap(&self) -> bool {
        match self.summary.as_ref().and_then(|s| s.has_match) {
            Some(true) => !self.match_slot.is_set(),
            Some(false) => self.match_slot.is_set(),
            None => false,
        }
    }

    pub fn into_result(self) -> EvaluationResult {
        let reconciliation_gap = self.reconciliation_gap();
        let total_reviewed = self.buckets.reviewed_ids(self.match_slot.id()).len();
        let (evaluation_has_match, evaluation_summary) = match self.summary {
            Some(summary) => (summary.has_match, summary.summary),
            None => (None, String::new()),
        };

        EvaluationResult {
            match_record: self.match_slot.get().cloned(),
            not_matches: self.buckets.not_match.to_vec(),
            unsure: self.buckets.unsure.to_vec(),
            likely_matches: self.buckets.likely_match.to_vec(),
            very_likely: self.buckets.very_likely.to_vec(),
            evaluation_has_match,
            evaluation_summary,
            new_candidate_suggestion: self.suggestion,
            total_reviewed,
            reconciliation_gap,
        }
    }
}

// ============================================================================
// Run context
// ============================================================================

/// Immutable side of a run
pub struct RunContext {
    pub run_id: Uuid,
    pub report: Report,
    pub candidates: Vec<Candidate>,
    index: HashMap<CandidateId, usize>,
    pub config: EvaluationConfig,
    pub prompts: PromptCatalog,
    pub gateway: ClassifierGateway,
    pub attachments: Option<Arc<AttachmentProvider>>,
}

impl RunContext {
    /// Build a context; duplicate candidate ids keep their first occurrence
    pub fn new(
        report: Report,
        candidates: Vec<Candidate>,
        config: EvaluationConfig,
        gateway: ClassifierGateway,
        attachments: Option<Arc<AttachmentProvider>>,
    ) -> Self {
        let mut index = HashMap::new();
        let mut unique = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if index.contains_key(&candidate.id) {
                warn!(candidate_id = %candidate.id, "Dropping duplicate candidate");
                continue;
            }
            index.insert(candidate.id.clone(), unique.len());
            unique.push(candidate);
        }

        Self {
            run_id: Uuid::new_v4(),
            report,
            candidates: unique,
            index,
            prompts: PromptCatalog::new(config.prompt_overrides.clone()),
            config,
            gateway,
            attachments,
        }
    }

    pub fn candidate(&self, id: &CandidateId) -> Option<&Candidate> {
        self.index.get(id).map(|&i| &self.candidates[i])
    }

    /// Upper bound on stage transitions for this run
    pub fn max_steps(&self) -> usize {
        4 * self.candidates.len() + 32
    }

    /// Classifier request for a stage, carrying the run's attachment and options
    pub fn request(
        &self,
        stage: Stage,
        key: PromptKey,
        payload: Value,
        subject: Option<CandidateId>,
        state: &PipelineState,
    ) -> ClassifierRequest {
        let attached = state.attachment.is_some();
        let payload = if attached {
            payloads::with_attachment_metadata(payload, &self.report)
        } else {
            payload
        };

        ClassifierRequest {
            stage: stage.as_str(),
            system_prompt: self.prompts.system_prompt(key, attached),
            reviewer_instructions: self.config.reviewer_instructions.clone(),
            payload,
            attachment: state.attachment.clone(),
            variant: self.config.variant,
            temperature: self.config.temperature,
            subject,
        }
    }
}

// ============================================================================
// Graph
// ============================================================================

/// Dispatch table of stages and routers
pub struct StageGraph {
    entry: Stage,
    nodes: HashMap<Stage, StageNode>,
}

impl StageGraph {
    /// The evaluation workflow
    pub fn standard() -> Self {
        let mut nodes = HashMap::new();
        let mut add = |stage: Stage, handler: StageHandler, router: Router| {
            nodes.insert(stage, StageNode { handler, router });
        };

        add(Stage::PrepareAttachment, stages::prepare_attachment, after_prepare_attachment);
        add(Stage::LoadNextInitial, stages::load_next_initial, after_load_next_initial);
        add(Stage::ClassifyInitial, stages::classify_initial, after_classify_initial);
        add(Stage::SelectVeryLikely, stages::select_very_likely, after_select_very_likely);
        add(Stage::CompareVeryLikely, stages::compare_very_likely, after_compare_very_likely);
        add(Stage::PrepareUnsureReview, stages::prepare_unsure_review, after_prepare_unsure_review);
        add(Stage::LoadNextUnsure, stages::load_next_unsure, after_load_next_unsure);
        add(Stage::ClassifyUnsure, stages::classify_unsure, after_classify_unsure);
        add(Stage::MatchNotFound, stages::match_not_found, after_match_not_found);
        add(Stage::Summarize, stages::summarize, after_summarize);
        add(Stage::SuggestNewCandidate, stages::suggest_new_candidate, after_suggest_new_candidate);

        Self {
            entry: Stage::PrepareAttachment,
            nodes,
        }
    }

    pub fn entry(&self) -> Stage {
        self.entry
    }

    pub fn node(&self, stage: Stage) -> Option<&StageNode> {
        self.nodes.get(&stage)
    }

    /// Run to completion and return the final state
    ///
    /// Never fails: a missing node or an exceeded step guard is logged and
    /// the state reached so far is returned.
    pub async fn run(&self, ctx: &RunContext, emitter: &dyn ProgressEmitter) -> PipelineState {
        let mut state = PipelineState::new();
        let max_steps = ctx.max_steps();
        let mut stage = self.entry();

        loop {
            if state.steps >= max_steps {
                error!(
                    stage = stage.as_str(),
                    steps = state.steps,
                    max_steps,
                    "Step guard exceeded; stopping workflow"
                );
                break;
            }

            let Some(node) = self.node(stage) else {
                error!(stage = stage.as_str(), "No handler registered for stage");
                break;
            };

            let span = info_span!("stage", stage = stage.as_str());
            let delta = (node.handler)(ctx, &state).instrument(span).await;
            let event = progress::describe(stage, &delta, ctx);

            state.merge(delta);
            state.steps += 1;

            check_buckets(stage, &state);

            emitter.emit(event);

            let next = (node.router)(&state);
            state.history.push(StageTransition {
                from: stage,
                to: next.stage(),
                transitioned_at: Utc::now(),
            });
            debug!(from = stage.as_str(), to = ?next.stage().map(Stage::as_str), "Stage transition");

            match next {
                Next::Stage(following) => stage = following,
                Next::End => break,
            }
        }

        state
    }
}

/// Each id sits in at most one disposition bucket after every stage
fn check_buckets(stage: Stage, state: &PipelineState) {
    let overlaps = state.buckets.overlapping_ids();
    if !overlaps.is_empty() {
        error!(stage = stage.as_str(), ids = ?overlaps, "Candidate present in more than one bucket");
    }
    debug_assert!(
        overlaps.is_empty(),
        "candidate in more than one bucket after {}: {:?}",
        stage.as_str(),
        overlaps
    );
}
