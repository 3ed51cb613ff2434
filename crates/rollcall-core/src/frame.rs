//! Per-frame recognition with frame-level identity uniqueness.

use crate::matcher::{confidence_from_distance, IdentityMatcher, MatchError, Matcher};
use crate::quality::DEFAULT_QUALITY_THRESHOLD;
use crate::reference::ReferenceSet;
use crate::types::{FaceCandidate, FaceMatch, FrameEntry, FrameResult};
use std::collections::HashSet;

/// Turns an ordered candidate list into a [`FrameResult`].
///
/// Candidates are processed strictly in order and the first candidate to
/// claim an identity keeps it; later claimants of the same identity are
/// reported as unmatched. No state survives between calls.
#[derive(Debug, Clone)]
pub struct FrameRecognizer<M = IdentityMatcher> {
    matcher: M,
    quality_threshold: f32,
}

impl Default for FrameRecognizer<IdentityMatcher> {
    fn default() -> Self {
        Self::new(IdentityMatcher::default(), DEFAULT_QUALITY_THRESHOLD)
    }
}

impl<M: Matcher> FrameRecognizer<M> {
    pub fn new(matcher: M, quality_threshold: f32) -> Self {
        Self {
            matcher,
            quality_threshold,
        }
    }

    /// Recognize every candidate against `reference`.
    ///
    /// Always returns one entry per candidate. Fails only on a dimension
    /// mismatch between a query and the reference set.
    pub fn recognize_frame(
        &self,
        reference: &ReferenceSet,
        candidates: &[FaceCandidate],
    ) -> Result<FrameResult, MatchError> {
        let mut accepted: HashSet<String> = HashSet::new();
        let mut entries = Vec::with_capacity(candidates.len());

        for (idx, candidate) in candidates.iter().enumerate() {
            let matched = self.recognize_one(idx, candidate, reference, &mut accepted)?;
            entries.push(FrameEntry {
                bbox: candidate.bbox,
                matched,
            });
        }

        tracing::debug!(
            candidates = candidates.len(),
            matched = accepted.len(),
            "frame recognized"
        );

        Ok(FrameResult { entries })
    }

    fn recognize_one(
        &self,
        idx: usize,
        candidate: &FaceCandidate,
        reference: &ReferenceSet,
        accepted: &mut HashSet<String>,
    ) -> Result<Option<FaceMatch>, MatchError> {
        if candidate.quality < self.quality_threshold {
            tracing::debug!(idx, quality = candidate.quality, "candidate rejected: low quality");
            return Ok(None);
        }

        let Some(embedding) = &candidate.embedding else {
            tracing::debug!(idx, "candidate has no embedding");
            return Ok(None);
        };

        let outcome = self.matcher.match_embedding(embedding, reference)?;
        let (Some(identity), Some(distance)) = (outcome.identity_key, outcome.distance) else {
            return Ok(None);
        };

        if accepted.contains(&identity) {
            tracing::debug!(idx, identity = %identity, distance, "duplicate identity in frame, discarding");
            return Ok(None);
        }

        accepted.insert(identity.clone());
        Ok(Some(FaceMatch {
            identity_key: identity,
            confidence: confidence_from_distance(distance),
            distance,
            display_name: None,
        }))
    }
}
