//! Classifier payloads
//!
//! Each stage sends one JSON object as the user message. Candidates are sent
//! with their full register record next to a `study_id` the classifier can
//! echo back.

use crate::buckets::BucketStore;
use crate::types::{Candidate, CandidateId, DecisionRecord, RejectedLikelyEntry, Report, VeryLikelyEntry};
use serde_json::{json, Value};

/// Report + one candidate (initial triage)
pub fn initial(report: &Report, candidate: &Candidate) -> Value {
    json!({
        "report": report,
        "study": candidate,
    })
}

/// Likely candidates with their triage rationale (very-likely selection)
pub fn likely_group(report: &Report, candidates: &[(&Candidate, &DecisionRecord)]) -> Value {
    let items: Vec<Value> = candidates
        .iter()
        .map(|(candidate, record)| {
            json!({
                "study_id": candidate.id,
                "study": candidate,
                "prior_rationale": record.rationale,
            })
        })
        .collect();
    json!({"report": report, "candidates": items})
}

/// Very likely candidates with both rationales (pairwise comparison)
pub fn likely_compare(report: &Report, candidates: &[(&Candidate, &VeryLikelyEntry)]) -> Value {
    let items: Vec<Value> = candidates
        .iter()
        .map(|(candidate, entry)| {
            json!({
                "study_id": candidate.id,
                "study": candidate,
                "prior_rationale": entry.prior_rationale,
                "group_rationale": entry.group_rationale,
            })
        })
        .collect();
    json!({"report": report, "candidates": items})
}

/// Unsure review: rejected-likely history plus the current candidate
pub fn unsure_review(
    report: &Report,
    rejected: &[(&Candidate, &RejectedLikelyEntry)],
    current: &Candidate,
    prior_rationale: Option<&str>,
) -> Value {
    let history: Vec<Value> = rejected
        .iter()
        .map(|(candidate, entry)| {
            json!({
                "study_id": candidate.id,
                "study": candidate,
                "initial_rationale": entry.initial_rationale,
                "review_rationale": entry.review_rationale,
            })
        })
        .collect();
    json!({
        "report": report,
        "rejected_likely": history,
        "current": {
            "study_id": current.id,
            "study": current,
            "prior_rationale": prior_rationale,
        },
    })
}

/// Review of a candidate that was likely once but not confirmed
pub fn likely_review(
    report: &Report,
    current: &Candidate,
    prior_rationale: Option<&str>,
    rejections: &[&RejectedLikelyEntry],
) -> Value {
    let initial_rationale = rejections.iter().find_map(|e| e.initial_rationale.as_deref());
    let history: Vec<Value> = rejections
        .iter()
        .map(|e| json!({"review_rationale": e.review_rationale}))
        .collect();
    json!({
        "report": report,
        "current": {
            "study_id": current.id,
            "study": current,
            "initial_rationale": initial_rationale,
            "prior_rationale": prior_rationale,
            "rejections": history,
        },
    })
}

/// Full evaluation state (summary and new-candidate suggestion)
pub fn summary<'a, F>(
    report: &Report,
    buckets: &BucketStore,
    match_record: Option<&DecisionRecord>,
    lookup: F,
) -> Value
where
    F: Fn(&CandidateId) -> Option<&'a Candidate>,
{
    let attach = |record: &DecisionRecord| {
        json!({
            "study_id": record.candidate_id,
            "study": lookup(&record.candidate_id),
            "decision": record.outcome,
            "rationale": record.rationale,
        })
    };

    json!({
        "report": report,
        "match": match_record.map(&attach),
        "not_matches": buckets.not_match.iter().map(&attach).collect::<Vec<_>>(),
        "unsure": buckets.unsure.iter().map(&attach).collect::<Vec<_>>(),
        "likely_matches": buckets.likely_match.iter().map(&attach).collect::<Vec<_>>(),
        "very_likely": buckets.very_likely.to_vec(),
    })
}

/// Describe the attached PDF inside the payload
pub fn with_attachment_metadata(mut payload: Value, report: &Report) -> Value {
    if let Value::Object(map) = &mut payload {
        map.insert(
            "pdf_attachment".to_string(),
            json!({
                "attachment_index": 0,
                "report_id": report.report_id,
                "title": report.title,
            }),
        );
    }
    payload
}
