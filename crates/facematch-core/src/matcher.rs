//! Cosine nearest-neighbor search over the reference set and the confidence decision.

use crate::types::{Embedding, ReferenceEntry};

/// Best candidates scoring below this are reported as low confidence.
pub const SIMILARITY_THRESHOLD: f32 = 0.5;

/// Highest-scoring reference entry for one probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchCandidate {
    /// Position of the entry in stored order.
    pub index: usize,
    /// Cosine similarity in [-1, 1].
    pub similarity: f32,
}

/// Outcome of applying the confidence threshold to a candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Confirmed {
        actor: String,
        image: String,
        similarity: f32,
    },
    LowConfidence {
        best_guess: String,
        similarity: f32,
    },
}

/// Strategy for comparing a probe embedding against the reference entries.
pub trait Matcher {
    /// `None` only when no entry produced a comparable score.
    fn best_match(
        &self,
        probe: &Embedding,
        references: &[ReferenceEntry],
    ) -> Option<MatchCandidate>;
}

/// Cosine similarity matcher.
///
/// Scores every entry with no early exit; ties keep the first entry in stored order.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(
        &self,
        probe: &Embedding,
        references: &[ReferenceEntry],
    ) -> Option<MatchCandidate> {
        let mut best: Option<MatchCandidate> = None;

        for (index, entry) in references.iter().enumerate() {
            let similarity = probe.similarity(&entry.embedding);
            if similarity.is_nan() {
                continue;
            }
            if best.map_or(true, |b| similarity > b.similarity) {
                best = Some(MatchCandidate { index, similarity });
            }
        }

        best
    }
}

/// `true` when `similarity` is high enough to be reported as a match.
pub fn is_confident(similarity: f32) -> bool {
    similarity >= SIMILARITY_THRESHOLD
}

/// Apply the threshold to `candidate`, stripping `root_marker` from the image path of a match.
pub fn decide(candidate: MatchCandidate, entry: &ReferenceEntry, root_marker: &str) -> Decision {
    if is_confident(candidate.similarity) {
        Decision::Confirmed {
            actor: entry.actor.clone(),
            image: strip_dataset_root(&entry.image_path, root_marker).to_string(),
            similarity: candidate.similarity,
        }
    } else {
        Decision::LowConfidence {
            best_guess: entry.actor.clone(),
            similarity: candidate.similarity,
        }
    }
}

/// Return the part of `path` after the last occurrence of `marker`, or `path`
/// unchanged when the marker is absent or empty.
pub fn strip_dataset_root<'a>(path: &'a str, marker: &str) -> &'a str {
    if marker.is_empty() {
        return path;
    }
    path.rsplit_once(marker).map_or(path, |(_, rest)| rest)
}
