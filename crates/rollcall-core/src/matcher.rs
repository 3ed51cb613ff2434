//! Nearest-identity matching by cosine distance.

use crate::reference::ReferenceSet;
use crate::types::Embedding;
use thiserror::Error;

/// Accept a match only below this cosine distance.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.35;
/// Accept a match only at or above this display confidence (percent).
pub const DEFAULT_MIN_CONFIDENCE: f32 = 60.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: reference set is {expected}-dim, query is {actual}-dim")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Result of matching one query embedding.
///
/// `distance` is `None` only when there was nothing to compare against.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub identity_key: Option<String>,
    pub distance: Option<f32>,
}

impl MatchOutcome {
    pub fn untrained() -> Self {
        Self {
            identity_key: None,
            distance: None,
        }
    }
}

/// Display confidence in percent for a cosine distance.
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance) * 100.0
}

/// Strategy for matching a query embedding against the reference set.
pub trait Matcher {
    fn match_embedding(
        &self,
        query: &Embedding,
        reference: &ReferenceSet,
    ) -> Result<MatchOutcome, MatchError>;
}

/// Exhaustive cosine-distance matcher with two acceptance gates.
///
/// Scans every stored embedding of every identity and keeps the global
/// minimum. The match is accepted only if the distance is strictly below
/// `distance_threshold` and the derived confidence reaches `min_confidence`.
#[derive(Debug, Clone, Copy)]
pub struct IdentityMatcher {
    distance_threshold: f32,
    min_confidence: f32,
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_DISTANCE_THRESHOLD, DEFAULT_MIN_CONFIDENCE)
    }
}

impl IdentityMatcher {
    pub fn new(distance_threshold: f32, min_confidence: f32) -> Self {
        Self {
            distance_threshold,
            min_confidence,
        }
    }
}

impl Matcher for IdentityMatcher {
    fn match_embedding(
        &self,
        query: &Embedding,
        reference: &ReferenceSet,
    ) -> Result<MatchOutcome, MatchError> {
        let Some(expected) = reference.dimension() else {
            return Ok(MatchOutcome::untrained());
        };
        if query.dimension() != expected {
            return Err(MatchError::DimensionMismatch {
                expected,
                actual: query.dimension(),
            });
        }

        let mut best_distance = f32::INFINITY;
        let mut best_identity: Option<&str> = None;

        for (identity, embeddings) in reference.iter() {
            for stored in embeddings {
                let distance = query.cosine_distance(stored);
                if distance < best_distance {
                    best_distance = distance;
                    best_identity = Some(identity);
                }
            }
        }

        let Some(identity) = best_identity else {
            return Ok(MatchOutcome::untrained());
        };

        let confidence = confidence_from_distance(best_distance);
        let accepted = best_distance < self.distance_threshold && confidence >= self.min_confidence;

        if accepted {
            tracing::debug!(identity, distance = best_distance, confidence, "match accepted");
            Ok(MatchOutcome {
                identity_key: Some(identity.to_string()),
                distance: Some(best_distance),
            })
        } else {
            tracing::debug!(
                nearest = identity,
                distance = best_distance,
                threshold = self.distance_threshold,
                "no match"
            );
            Ok(MatchOutcome {
                identity_key: None,
                distance: Some(best_distance),
            })
        }
    }
}
