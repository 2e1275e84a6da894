//! Stage handlers
//!
//! Every handler reads the state and returns a delta; none mutate state and
//! none fail. A classifier failure becomes the stage's safe default with the
//! rationale `Classifier call failed: <class>`.

use super::{AttachmentStatus, PipelineState, RunContext, Stage, StageOutcome, StateDelta};
use crate::buckets::BucketOp;
use crate::error::GatewayError;
use crate::gateway::schema::{
    InitialDecision, LikelyGroupSelection, NewCandidateDraft, PairwiseVerdict, ReviewVerdict,
    SummaryVerdict,
};
use crate::payloads;
use crate::prompts::PromptKey;
use crate::resolver::IdentifierResolver;
use crate::types::{
    Candidate, CandidateId, Decision, DecisionRecord, EvaluationSummary, RejectedLikelyEntry,
    VeryLikelyEntry,
};
use futures::future::{self, BoxFuture, FutureExt};
use tracing::{debug, info, warn};

/// Most candidates carried into the pairwise comparison
pub const MAX_VERY_LIKELY: usize = 2;

pub const NOT_SELECTED_PREFIX: &str = "Not selected as very_likely: ";
pub const NO_DEFINITIVE_MATCH_PREFIX: &str = "Very likely but no definitive match: ";
pub const NO_CANDIDATES_SUMMARY: &str =
    "No candidate studies were provided, so the report cannot match an existing study.";

pub fn failure_rationale(err: &GatewayError) -> String {
    format!("Classifier call failed: {}", err.class_name())
}

fn missing_current(stage: Stage) -> StateDelta {
    warn!(stage = stage.as_str(), "No current candidate to classify");
    StateDelta {
        current: Some(None),
        outcome: Some(StageOutcome::note("No current candidate.")),
        ..StateDelta::default()
    }
}

// ============================================================================
// Attachment
// ============================================================================

pub fn prepare_attachment<'a>(ctx: &'a RunContext, _state: &'a PipelineState) -> BoxFuture<'a, StateDelta> {
    async move {
        if !ctx.config.include_attachment {
            return StateDelta {
                attachment: Some((AttachmentStatus::Disabled, None)),
                outcome: Some(StageOutcome::note("Report attachment not requested.")),
                ..StateDelta::default()
            };
        }

        let Some(provider) = &ctx.attachments else {
            warn!(report_id = ctx.report.report_id, "Attachment requested but no document store is configured");
            return StateDelta {
                attachment: Some((AttachmentStatus::Missing, None)),
                outcome: Some(StageOutcome::note("Report attachment unavailable.")),
                ..StateDelta::default()
            };
        };

        match provider.get_or_create(ctx.report.report_id).await {
            Some(handle) => {
                info!(report_id = ctx.report.report_id, kind = handle.kind(), "Report attachment ready");
                StateDelta {
                    outcome: Some(StageOutcome::note(format!("Report attachment ready ({}).", handle.kind()))),
                    attachment: Some((AttachmentStatus::Attached, Some(handle))),
                    ..StateDelta::default()
                }
            }
            None => StateDelta {
                attachment: Some((AttachmentStatus::Missing, None)),
                outcome: Some(StageOutcome::note("Report attachment unavailable.")),
                ..StateDelta::default()
            },
        }
    }
    .boxed()
}

// ============================================================================
// Initial triage
// ============================================================================

pub fn load_next_initial<'a>(ctx: &'a RunContext, state: &'a PipelineState) -> BoxFuture<'a, StateDelta> {
    let delta = match ctx.candidates.get(state.cursor) {
        Some(candidate) => StateDelta {
            cursor: Some(state.cursor + 1),
            current: Some(Some(candidate.id.clone())),
            ..StateDelta::default()
        },
        None => StateDelta {
            current: Some(None),
            ..StateDelta::default()
        },
    };
    future::ready(delta).boxed()
}

pub fn classify_initial<'a>(ctx: &'a RunContext, state: &'a PipelineState) -> BoxFuture<'a, StateDelta> {
    async move {
        let Some(candidate) = state.current.as_ref().and_then(|id| ctx.candidate(id)) else {
            return missing_current(Stage::ClassifyInitial);
        };

        let request = ctx.request(
            Stage::ClassifyInitial,
            PromptKey::InitialEval,
            payloads::initial(&ctx.report, candidate),
            Some(candidate.id.clone()),
            state,
        );

        let record = match ctx.gateway.invoke::<InitialDecision>(&request).await {
            Ok(output) => DecisionRecord::new(candidate.id.clone(), output.decision, output.rationale),
            Err(e) => {
                warn!(candidate_id = %candidate.id, error = %e, "Initial classification failed");
                DecisionRecord::new(candidate.id.clone(), Decision::Unsure, failure_rationale(&e))
            }
        };

        StateDelta {
            outcome: Some(StageOutcome::for_record(&record)),
            bucket_ops: vec![BucketOp::Place(record)],
            ..StateDelta::default()
        }
    }
    .boxed()
}

// ============================================================================
// Very likely selection and comparison
// ============================================================================

pub fn select_very_likely<'a>(ctx: &'a RunContext, state: &'a PipelineState) -> BoxFuture<'a, StateDelta> {
    async move {
        let likely: Vec<(&Candidate, &DecisionRecord)> = state
            .buckets
            .likely_match
            .iter()
            .filter_map(|record| ctx.candidate(&record.candidate_id).map(|c| (c, record)))
            .collect();

        if likely.is_empty() {
            return StateDelta::with_outcome(StageOutcome::note("No likely candidates to select from."));
        }

        let request = ctx.request(
            Stage::SelectVeryLikely,
            PromptKey::LikelyGroup,
            payloads::likely_group(&ctx.report, &likely),
            None,
            state,
        );

        let (mut selected, group_rationale) = match ctx.gateway.invoke::<LikelyGroupSelection>(&request).await {
            Ok(output) => {
                let resolver = IdentifierResolver::new(likely.iter().map(|(c, _)| *c));
                (resolver.resolve_all(&output.very_likely_ids), output.rationale)
            }
            Err(e) => {
                warn!(likely = likely.len(), error = %e, "Very likely selection failed; selecting none");
                (Vec::new(), failure_rationale(&e))
            }
        };
        if selected.len() > MAX_VERY_LIKELY {
            debug!(returned = selected.len(), "Truncating very likely selection");
            selected.truncate(MAX_VERY_LIKELY);
        }

        let mut ops = Vec::with_capacity(likely.len() * 2);
        for (candidate, record) in &likely {
            if selected.contains(&candidate.id) {
                ops.push(BucketOp::PromoteVeryLikely(VeryLikelyEntry {
                    candidate_id: candidate.id.clone(),
                    short_name: Some(candidate.display_name().to_string()),
                    prior_rationale: Some(record.rationale.clone()),
                    group_rationale: Some(group_rationale.clone()),
                }));
            } else {
                ops.push(BucketOp::Place(DecisionRecord::new(
                    candidate.id.clone(),
                    Decision::Unsure,
                    format!("{}{}", NOT_SELECTED_PREFIX, group_rationale),
                )));
                ops.push(BucketOp::RecordRejected(RejectedLikelyEntry {
                    candidate_id: candidate.id.clone(),
                    initial_rationale: Some(record.rationale.clone()),
                    review_rationale: Some(group_rationale.clone()),
                }));
            }
        }

        info!(likely = likely.len(), selected = selected.len(), "Very likely selection complete");
        StateDelta {
            bucket_ops: ops,
            outcome: Some(StageOutcome::note(group_rationale)),
            ..StateDelta::default()
        }
    }
    .boxed()
}

pub fn compare_very_likely<'a>(ctx: &'a RunContext, state: &'a PipelineState) -> BoxFuture<'a, StateDelta> {
    async move {
        let entries: Vec<(&Candidate, &VeryLikelyEntry)> = state
            .buckets
            .very_likely
            .iter()
            .filter_map(|entry| ctx.candidate(&entry.candidate_id).map(|c| (c, entry)))
            .collect();

        let request = ctx.request(
            Stage::CompareVeryLikely,
            PromptKey::LikelyCompare,
            payloads::likely_compare(&ctx.report, &entries),
            None,
            state,
        );

        let rationale = match ctx.gateway.invoke::<PairwiseVerdict>(&request).await {
            Ok(PairwiseVerdict {
                decision: Decision::Match,
                study_id: Some(token),
                rationale,
            }) => {
                let resolver = IdentifierResolver::new(entries.iter().map(|(c, _)| *c));
                match resolver.resolve(&token) {
                    Ok(id) => {
                        info!(candidate_id = %id, "Pairwise comparison found a match");
                        let record = DecisionRecord::new(id, Decision::Match, rationale);
                        return StateDelta {
                            outcome: Some(StageOutcome::for_record(&record)),
                            bucket_ops: vec![BucketOp::Place(record.clone())],
                            set_match: Some(record),
                            ..StateDelta::default()
                        };
                    }
                    Err(e) => {
                        warn!(study_id = %token, error = %e, "Match identifier did not resolve; downgrading to unsure");
                        format!("{} (study identifier {:?} could not be resolved)", rationale, token)
                    }
                }
            }
            Ok(verdict) => verdict.rationale,
            Err(e) => {
                warn!(error = %e, "Pairwise comparison failed");
                failure_rationale(&e)
            }
        };

        let mut ops = Vec::with_capacity(entries.len() * 2);
        for (_, entry) in &entries {
            ops.push(BucketOp::Place(DecisionRecord::new(
                entry.candidate_id.clone(),
                Decision::Unsure,
                format!("{}{}", NO_DEFINITIVE_MATCH_PREFIX, rationale),
            )));
            ops.push(BucketOp::RecordRejected(RejectedLikelyEntry {
                candidate_id: entry.candidate_id.clone(),
                initial_rationale: entry.prior_rationale.clone(),
                review_rationale: Some(rationale.clone()),
            }));
        }

        StateDelta {
            bucket_ops: ops,
            outcome: Some(StageOutcome {
                candidate_id: None,
                decision: Some(Decision::Unsure),
                rationale,
            }),
            ..StateDelta::default()
        }
    }
    .boxed()
}

// ============================================================================
// Review loop
// ============================================================================

pub fn prepare_unsure_review<'a>(_ctx: &'a RunContext, state: &'a PipelineState) -> BoxFuture<'a, StateDelta> {
    let queue = state.buckets.unsure.ids();
    let delta = StateDelta {
        outcome: Some(StageOutcome::note(format!("{} studies queued for review.", queue.len()))),
        unsure_queue: Some(queue),
        unsure_cursor: Some(0),
        current: Some(None),
        ..StateDelta::default()
    };
    future::ready(delta).boxed()
}

pub fn load_next_unsure<'a>(ctx: &'a RunContext, state: &'a PipelineState) -> BoxFuture<'a, StateDelta> {
    let mut cursor = state.unsure_cursor;
    let mut next = None;

    if !state.match_slot.is_set() {
        while let Some(id) = state.unsure_queue.get(cursor) {
            cursor += 1;
            if ctx.candidate(id).is_some() {
                next = Some(id.clone());
                break;
            }
            debug!(candidate_id = %id, "Skipping queued id with no candidate");
        }
    }

    future::ready(StateDelta {
        unsure_cursor: Some(cursor),
        current: Some(next),
        ..StateDelta::default()
    })
    .boxed()
}

pub fn classify_unsure<'a>(ctx: &'a RunContext, state: &'a PipelineState) -> BoxFuture<'a, StateDelta> {
    async move {
        let Some(candidate) = state.current.as_ref().and_then(|id| ctx.candidate(id)) else {
            return missing_current(Stage::ClassifyUnsure);
        };

        let id = &candidate.id;
        let prior = state.buckets.unsure.lookup(id).map(|r| r.rationale.as_str());
        let rejections = state.buckets.rejections_for(id);
        let was_likely = !rejections.is_empty();

        let (key, payload) = if was_likely {
            (
                PromptKey::LikelyReview,
                payloads::likely_review(&ctx.report, candidate, prior, &rejections),
            )
        } else {
            let history: Vec<(&Candidate, &RejectedLikelyEntry)> = state
                .buckets
                .rejected_likely
                .iter()
                .filter_map(|e| ctx.candidate(&e.candidate_id).map(|c| (c, e)))
                .collect();
            (
                PromptKey::UnsureReview,
                payloads::unsure_review(&ctx.report, &history, candidate, prior),
            )
        };

        let request = ctx.request(Stage::ClassifyUnsure, key, payload, Some(id.clone()), state);
        let record = match ctx.gateway.invoke::<ReviewVerdict>(&request).await {
            Ok(output) => DecisionRecord::new(id.clone(), output.decision, output.rationale),
            Err(e) => {
                warn!(candidate_id = %id, error = %e, "Unsure review failed");
                DecisionRecord::new(id.clone(), Decision::Unsure, failure_rationale(&e))
            }
        };

        let mut delta = StateDelta {
            outcome: Some(StageOutcome::for_record(&record)),
            ..StateDelta::default()
        };

        if record.outcome == Decision::Match {
            info!(candidate_id = %id, "Review found a match");
            delta.bucket_ops.push(BucketOp::Place(record.clone()));
            delta.set_match = Some(record);
            return delta;
        }

        if was_likely {
            delta.bucket_ops.push(BucketOp::RecordRejected(RejectedLikelyEntry {
                candidate_id: id.clone(),
                initial_rationale: rejections.iter().find_map(|e| e.initial_rationale.clone()),
                review_rationale: Some(record.rationale.clone()),
            }));
        }
        delta.bucket_ops.insert(0, BucketOp::Place(record));
        delta
    }
    .boxed()
}

pub fn match_not_found<'a>(_ctx: &'a RunContext, _state: &'a PipelineState) -> BoxFuture<'a, StateDelta> {
    future::ready(StateDelta::with_outcome(StageOutcome::note("No match found after all reviews."))).boxed()
}

// ============================================================================
// Summary and suggestion
// ============================================================================

pub fn summarize<'a>(ctx: &'a RunContext, state: &'a PipelineState) -> BoxFuture<'a, StateDelta> {
    async move {
        if ctx.candidates.is_empty() {
            return StateDelta {
                summary: Some(EvaluationSummary {
                    has_match: Some(false),
                    summary: NO_CANDIDATES_SUMMARY.to_string(),
                }),
                outcome: Some(StageOutcome::note(NO_CANDIDATES_SUMMARY)),
                ..StateDelta::default()
            };
        }

        let payload = payloads::summary(&ctx.report, &state.buckets, state.match_slot.get(), |id: &CandidateId| {
            ctx.candidate(id)
        });
        let request = ctx.request(Stage::Summarize, PromptKey::Summary, payload, None, state);

        let summary = match ctx.gateway.invoke::<SummaryVerdict>(&request).await {
            Ok(output) => {
                if output.has_match != state.match_slot.is_set() {
                    warn!(
                        summarizer_has_match = output.has_match,
                        match_set = state.match_slot.is_set(),
                        "Summary verdict disagrees with the match slot"
                    );
                }
                EvaluationSummary {
                    has_match: Some(output.has_match),
                    summary: output.summary,
                }
            }
            Err(e) => {
                warn!(error = %e, "Summarization failed");
                EvaluationSummary {
                    has_match: None,
                    summary: failure_rationale(&e),
                }
            }
        };

        StateDelta {
            outcome: Some(StageOutcome::note(summary.summary.clone())),
            summary: Some(summary),
            ..StateDelta::default()
        }
    }
    .boxed()
}

pub fn suggest_new_candidate<'a>(ctx: &'a RunContext, state: &'a PipelineState) -> BoxFuture<'a, StateDelta> {
    async move {
        let payload = payloads::summary(&ctx.report, &state.buckets, state.match_slot.get(), |id: &CandidateId| {
            ctx.candidate(id)
        });
        let request = ctx.request(
            Stage::SuggestNewCandidate,
            PromptKey::SuggestNewCandidate,
            payload,
            None,
            state,
        );

        match ctx.gateway.invoke::<NewCandidateDraft>(&request).await {
            Ok(draft) => StateDelta {
                outcome: Some(StageOutcome::note(draft.new_study.rationale.clone())),
                suggestion: Some(draft.new_study),
                ..StateDelta::default()
            },
            Err(e) => {
                warn!(error = %e, "New study suggestion failed");
                StateDelta::with_outcome(StageOutcome::note(failure_rationale(&e)))
            }
        }
    }
    .boxed()
}
