//! Identifier Resolver
//!
//! Maps a free-form identifier returned by the classifier onto the canonical
//! id of one candidate in the current stage's subset.
//!
//! # Resolution order (first hit wins)
//! 1. Exact match against subset ids
//! 2. Normalized alias match (lowercase, alphanumerics only) against id, short
//!    name, registration ids, ISRCTN and central id
//! 3. Numeric substrings of the token that equal a subset id
//!
//! Steps 2 and 3 fail with [`ResolveError::Ambiguous`] when more than one
//! candidate qualifies. Nothing is ever guessed.

use crate::error::ResolveError;
use crate::types::{Candidate, CandidateId};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use tracing::debug;

static NUMERIC_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Resolver over one stage's candidate subset
pub struct IdentifierResolver<'a> {
    subset: Vec<&'a Candidate>,
}

impl<'a> IdentifierResolver<'a> {
    pub fn new<I>(subset: I) -> Self
    where
        I: IntoIterator<Item = &'a Candidate>,
    {
        Self {
            subset: subset.into_iter().collect(),
        }
    }

    pub fn resolve(&self, token: &str) -> Result<CandidateId, ResolveError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ResolveError::Empty);
        }

        if let Some(candidate) = self.subset.iter().find(|c| c.id.as_str() == token) {
            return Ok(candidate.id.clone());
        }

        let normalized = normalize(token);
        if !normalized.is_empty() {
            let mut hits: Vec<CandidateId> = self
                .distinct(|c| c.aliases().iter().any(|alias| normalize(alias) == normalized));
            if hits.len() > 1 {
                debug!(token, matches = ?hits, "Identifier matches several aliases");
                return Err(ResolveError::Ambiguous(hits));
            }
            if let Some(id) = hits.pop() {
                return Ok(id);
            }
        }

        let numbers: BTreeSet<u64> = NUMERIC_RUN
            .find_iter(token)
            .filter_map(|m| m.as_str().parse::<u64>().ok())
            .collect();
        if !numbers.is_empty() {
            let mut hits: Vec<CandidateId> = self.distinct(|c| {
                c.id.as_str()
                    .parse::<u64>()
                    .map(|n| numbers.contains(&n))
                    .unwrap_or(false)
            });
            if hits.len() > 1 {
                debug!(token, matches = ?hits, "Identifier contains several candidate ids");
                return Err(ResolveError::Ambiguous(hits));
            }
            if let Some(id) = hits.pop() {
                return Ok(id);
            }
        }

        Err(ResolveError::NotFound)
    }

    /// Resolve many tokens, dropping failures and duplicates (first occurrence order)
    pub fn resolve_all<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<CandidateId> {
        let mut resolved: Vec<CandidateId> = Vec::new();
        for token in tokens {
            match self.resolve(token.as_ref()) {
                Ok(id) if !resolved.contains(&id) => resolved.push(id),
                Ok(_) => {}
                Err(e) => debug!(token = token.as_ref(), error = %e, "Dropping unresolved identifier"),
            }
        }
        resolved
    }

    fn distinct<F>(&self, predicate: F) -> Vec<CandidateId>
    where
        F: Fn(&Candidate) -> bool,
    {
        let mut hits: Vec<CandidateId> = Vec::new();
        for candidate in self.subset.iter().filter(|c| predicate(c)) {
            if !hits.contains(&candidate.id) {
                hits.push(candidate.id.clone());
            }
        }
        hits
    }
}

/// Lowercase and keep only alphanumerics
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}
