//! Decision buckets
//!
//! Each bucket is keyed by candidate id with the most recent upsert winning.
//! Buckets stay small (one entry per candidate at most), so they are plain
//! vectors searched linearly, which also keeps insertion order stable for the
//! final result.
//!
//! [`BucketStore::place`] and [`BucketStore::promote_very_likely`] clear an id
//! from every other disposition bucket before inserting it, so a candidate is
//! never in two of `not_match`, `unsure`, `likely_match`, `very_likely` at once.

use crate::types::{CandidateId, Decision, DecisionRecord, RejectedLikelyEntry, VeryLikelyEntry};
use std::collections::BTreeSet;

/// Records addressable by candidate id
pub trait Keyed {
    fn key(&self) -> &CandidateId;
}

impl Keyed for DecisionRecord {
    fn key(&self) -> &CandidateId {
        &self.candidate_id
    }
}

impl Keyed for VeryLikelyEntry {
    fn key(&self) -> &CandidateId {
        &self.candidate_id
    }
}

/// Key-unique collection of records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket<R> {
    entries: Vec<R>,
}

impl<R> Default for Bucket<R> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<R: Keyed> Bucket<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry with the same id, or append
    pub fn upsert(&mut self, record: R) {
        match self.entries.iter_mut().find(|e| e.key() == record.key()) {
            Some(existing) => *existing = record,
            None => self.entries.push(record),
        }
    }

    /// Remove and return the entry for `id`; no-op if absent
    pub fn remove(&mut self, id: &CandidateId) -> Option<R> {
        let pos = self.entries.iter().position(|e| e.key() == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn lookup(&self, id: &CandidateId) -> Option<&R> {
        self.entries.iter().find(|e| e.key() == id)
    }

    pub fn contains(&self, id: &CandidateId) -> bool {
        self.lookup(id).is_some()
    }

    pub fn ids(&self) -> Vec<CandidateId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<R>
    where
        R: Clone,
    {
        self.entries.clone()
    }
}

/// Disposition buckets (excludes the append-only rejection log)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    NotMatch,
    Unsure,
    LikelyMatch,
    VeryLikely,
}

impl Disposition {
    /// Bucket a decision lands in; `match` goes to the match slot instead
    pub fn for_decision(decision: Decision) -> Option<Self> {
        match decision {
            Decision::NotMatch => Some(Self::NotMatch),
            Decision::Unsure => Some(Self::Unsure),
            Decision::LikelyMatch => Some(Self::LikelyMatch),
            Decision::Match => None,
        }
    }
}

/// Bucket mutation carried in a stage's state delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketOp {
    Place(DecisionRecord),
    PromoteVeryLikely(VeryLikelyEntry),
    RecordRejected(RejectedLikelyEntry),
}

/// All named buckets of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketStore {
    pub not_match: Bucket<DecisionRecord>,
    pub unsure: Bucket<DecisionRecord>,
    pub likely_match: Bucket<DecisionRecord>,
    pub very_likely: Bucket<VeryLikelyEntry>,
    /// Append-only audit log; an id may appear several times
    pub rejected_likely: Vec<RejectedLikelyEntry>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, op: BucketOp) {
        match op {
            BucketOp::Place(record) => self.place(record),
            BucketOp::PromoteVeryLikely(entry) => self.promote_very_likely(entry),
            BucketOp::RecordRejected(entry) => self.rejected_likely.push(entry),
        }
    }

    /// Move a record into the bucket named by its outcome
    ///
    /// A `match` record has no bucket: the id is cleared from the decision
    /// buckets and any `very_likely` entry is left in place.
    pub fn place(&mut self, record: DecisionRecord) {
        let id = record.candidate_id.clone();
        match Disposition::for_decision(record.outcome) {
            Some(target) => {
                self.clear_except(&id, target);
                match target {
                    Disposition::NotMatch => self.not_match.upsert(record),
                    Disposition::Unsure => self.unsure.upsert(record),
                    Disposition::LikelyMatch => self.likely_match.upsert(record),
                    Disposition::VeryLikely => {}
                }
            }
            None => {
                self.not_match.remove(&id);
                self.unsure.remove(&id);
                self.likely_match.remove(&id);
            }
        }
    }

    pub fn promote_very_likely(&mut self, entry: VeryLikelyEntry) {
        self.clear_except(&entry.candidate_id, Disposition::VeryLikely);
        self.very_likely.upsert(entry);
    }

    fn clear_except(&mut self, id: &CandidateId, keep: Disposition) {
        if keep != Disposition::NotMatch {
            self.not_match.remove(id);
        }
        if keep != Disposition::Unsure {
            self.unsure.remove(id);
        }
        if keep != Disposition::LikelyMatch {
            self.likely_match.remove(id);
        }
        if keep != Disposition::VeryLikely {
            self.very_likely.remove(id);
        }
    }

    /// Rejection history for one id, oldest first
    pub fn rejections_for(&self, id: &CandidateId) -> Vec<&RejectedLikelyEntry> {
        self.rejected_likely
            .iter()
            .filter(|e| &e.candidate_id == id)
            .collect()
    }

    /// Distinct ids across the disposition buckets plus the match id
    pub fn reviewed_ids(&self, match_id: Option<&CandidateId>) -> BTreeSet<CandidateId> {
        let mut ids: BTreeSet<CandidateId> = BTreeSet::new();
        ids.extend(self.not_match.iter().map(|r| r.candidate_id.clone()));
        ids.extend(self.unsure.iter().map(|r| r.candidate_id.clone()));
        ids.extend(self.likely_match.iter().map(|r| r.candidate_id.clone()));
        ids.extend(self.very_likely.iter().map(|e| e.candidate_id.clone()));
        if let Some(id) = match_id {
            ids.insert(id.clone());
        }
        ids
    }

    /// Ids present in more than one disposition bucket (empty when consistent)
    pub fn overlapping_ids(&self) -> Vec<CandidateId> {
        let mut seen = BTreeSet::new();
        let mut overlaps = BTreeSet::new();
        let all = self
            .not_match
            .iter()
            .map(|r| &r.candidate_id)
            .chain(self.unsure.iter().map(|r| &r.candidate_id))
            .chain(self.likely_match.iter().map(|r| &r.candidate_id))
            .chain(self.very_likely.iter().map(|e| &e.candidate_id));
        for id in all {
            if !seen.insert(id.clone()) {
                overlaps.insert(id.clone());
            }
        }
        overlaps.into_iter().collect()
    }
}

/// Write-once slot for the definitive match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSlot {
    record: Option<DecisionRecord>,
}

impl MatchSlot {
    /// Store the match; returns false (and keeps the first) when already set
    pub fn set(&mut self, record: DecisionRecord) -> bool {
        if self.record.is_some() {
            return false;
        }
        self.record = Some(record);
        true
    }

    pub fn get(&self) -> Option<&DecisionRecord> {
        self.record.as_ref()
    }

    pub fn id(&self) -> Option<&CandidateId> {
        self.record.as_ref().map(|r| &r.candidate_id)
    }

    pub fn is_set(&self) -> bool {
        self.record.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, outcome: Decision, rationale: &str) -> DecisionRecord {
        DecisionRecord::new(CandidateId::new(id), outcome, rationale)
    }

    #[test]
    fn test_upsert_then_lookup_returns_equal_record() {
        let mut bucket = Bucket::new();
        let r = record("1", Decision::Unsure, "thin abstract");
        bucket.upsert(r.clone());
        assert_eq!(bucket.lookup(&CandidateId::new("1")), Some(&r));
    }

    #[test]
    fn test_most_recent_upsert_wins() {
        let mut bucket = Bucket::new();
        bucket.upsert(record("1", Decision::Unsure, "first"));
        bucket.upsert(record("2", Decision::Unsure, "other"));
        bucket.upsert(record("1", Decision::Unsure, "second"));

        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.lookup(&"1".into()).unwrap().rationale, "second");
        assert_eq!(bucket.ids(), vec![CandidateId::new("1"), CandidateId::new("2")]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut bucket: Bucket<DecisionRecord> = Bucket::new();
        assert!(bucket.remove(&"9".into()).is_none());
        assert!(bucket.is_empty());
    }

    #[test]
    fn test_place_moves_between_buckets() {
        let mut store = BucketStore::new();
        store.place(record("1", Decision::LikelyMatch, "same drug"));
        store.place(record("1", Decision::Unsure, "demoted"));

        assert!(store.likely_match.is_empty());
        assert!(store.unsure.contains(&"1".into()));
        assert!(store.overlapping_ids().is_empty());
    }

    #[test]
    fn test_promote_clears_likely() {
        let mut store = BucketStore::new();
        store.place(record("4", Decision::LikelyMatch, "close"));
        store.promote_very_likely(VeryLikelyEntry {
            candidate_id: "4".into(),
            short_name: None,
            prior_rationale: Some("close".into()),
            group_rationale: Some("best two".into()),
        });

        assert!(store.likely_match.is_empty());
        assert!(store.very_likely.contains(&"4".into()));
    }

    #[test]
    fn test_match_placement_keeps_very_likely_entry() {
        let mut store = BucketStore::new();
        store.promote_very_likely(VeryLikelyEntry {
            candidate_id: "4".into(),
            short_name: None,
            prior_rationale: None,
            group_rationale: None,
        });
        store.place(record("5", Decision::Unsure, "x"));
        store.place(record("4", Decision::Match, "same trial"));
        store.place(record("5", Decision::Match, "same trial"));

        assert!(store.very_likely.contains(&"4".into()));
        assert!(store.unsure.is_empty());
    }

    #[test]
    fn test_rejection_log_allows_repeats() {
        let mut store = BucketStore::new();
        for review in ["a", "b"] {
            store.apply(BucketOp::RecordRejected(RejectedLikelyEntry {
                candidate_id: "2".into(),
                initial_rationale: None,
                review_rationale: Some(review.into()),
            }));
        }
        assert_eq!(store.rejections_for(&"2".into()).len(), 2);
        assert!(store.rejections_for(&"3".into()).is_empty());
    }

    #[test]
    fn test_reviewed_ids_counts_distinct() {
        let mut store = BucketStore::new();
        store.place(record("1", Decision::NotMatch, "x"));
        store.place(record("2", Decision::Unsure, "x"));
        let match_id = CandidateId::new("3");
        assert_eq!(store.reviewed_ids(Some(&match_id)).len(), 3);
        assert_eq!(store.reviewed_ids(Some(&"2".into())).len(), 2);
    }

    #[test]
    fn test_match_slot_is_write_once() {
        let mut slot = MatchSlot::default();
        assert!(slot.set(record("1", Decision::Match, "first")));
        assert!(!slot.set(record("2", Decision::Match, "second")));
        assert_eq!(slot.id(), Some(&CandidateId::new("1")));
    }
}
