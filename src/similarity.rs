//! Duplicate detection between local and remote notes.
//!
//! Used by migration to decide whether a legacy note already exists on the
//! server. Checks run in order of confidence: exact title and body, title
//! only, then fuzzy body similarity (normalized Levenshtein) above
//! [`SIMILARITY_THRESHOLD`].

use std::collections::HashSet;

use strsim::normalized_levenshtein;
use tracing::warn;

use crate::gateway::RemoteNote;
use crate::models::Note;

/// Minimum fuzzy score (exclusive) for two bodies to count as duplicates.
pub const SIMILARITY_THRESHOLD: f64 = 0.8;

/// Which check produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Title,
    Fuzzy,
}

/// A remote note judged to be a duplicate of a local one.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateMatch {
    /// Index into the candidate slice
    pub index: usize,
    pub kind: MatchKind,
    /// 1.0 for exact and title matches
    pub score: f64,
}

/// Lowercase and collapse whitespace
fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Similarity of two bodies between 0.0 and 1.0.
pub fn content_similarity(a: &str, b: &str) -> f64 {
    let norm_a = normalize_text(a);
    let norm_b = normalize_text(b);

    if norm_a.is_empty() || norm_b.is_empty() {
        return 0.0;
    }
    if norm_a == norm_b {
        return 1.0;
    }
    normalized_levenshtein(&norm_a, &norm_b)
}

/// Find the most likely remote duplicate of `local`.
///
/// Candidates whose id is in `claimed` were already matched by another
/// local note and are skipped. Among several fuzzy candidates the highest
/// score wins; the ambiguity is logged.
pub fn find_duplicate(
    local: &Note,
    candidates: &[RemoteNote],
    claimed: &HashSet<String>,
) -> Option<DuplicateMatch> {
    let available = || {
        candidates
            .iter()
            .enumerate()
            .filter(move |(_, remote)| !claimed.contains(&remote.id))
    };
    let title = local.title.trim();
    let body = local.body.trim();

    if let Some((index, _)) =
        available().find(|(_, r)| r.title.trim() == title && r.body.trim() == body)
    {
        return Some(DuplicateMatch {
            index,
            kind: MatchKind::Exact,
            score: 1.0,
        });
    }

    if !title.is_empty() {
        // Several notes can share a title; prefer the closest body.
        let best = available()
            .filter(|(_, r)| r.title.trim() == title)
            .map(|(i, r)| (i, content_similarity(&local.body, &r.body)))
            .fold(None, |best: Option<(usize, f64)>, (i, score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((i, score)),
            });
        if let Some((index, _)) = best {
            return Some(DuplicateMatch {
                index,
                kind: MatchKind::Title,
                score: 1.0,
            });
        }
    }

    let mut above: Vec<(usize, f64)> = available()
        .map(|(i, r)| (i, content_similarity(&local.body, &r.body)))
        .filter(|(_, score)| *score > SIMILARITY_THRESHOLD)
        .collect();
    above.sort_by(|a, b| b.1.total_cmp(&a.1));

    if above.len() > 1 {
        warn!(
            note_id = %local.id,
            candidates = above.len(),
            best_score = above[0].1,
            "Ambiguous fuzzy duplicate, picking highest score"
        );
    }

    above.first().map(|&(index, score)| DuplicateMatch {
        index,
        kind: MatchKind::Fuzzy,
        score,
    })
}
