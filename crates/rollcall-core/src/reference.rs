//! Reference sets of per-identity enrolled embeddings, and their shared handle.

use crate::types::Embedding;
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReferenceSetError {
    #[error("identity {0} has no embeddings")]
    EmptyIdentity(String),
    #[error("identity {identity} has a zero-length embedding")]
    ZeroDimension { identity: String },
    #[error("identity {identity} has {actual}-dim embedding, reference set is {expected}-dim")]
    InconsistentDimension {
        identity: String,
        expected: usize,
        actual: usize,
    },
}

/// Immutable mapping from identity key to its ordered enrolled embeddings.
///
/// Every embedding shares one dimensionality and no identity is stored with
/// an empty list; both are enforced at construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceSet {
    identities: BTreeMap<String, Vec<Embedding>>,
    dimension: Option<usize>,
}

impl ReferenceSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_identities(
        identities: BTreeMap<String, Vec<Embedding>>,
    ) -> Result<Self, ReferenceSetError> {
        let mut dimension = None;

        for (identity, embeddings) in &identities {
            if embeddings.is_empty() {
                return Err(ReferenceSetError::EmptyIdentity(identity.clone()));
            }
            for embedding in embeddings {
                let actual = embedding.dimension();
                if actual == 0 {
                    return Err(ReferenceSetError::ZeroDimension {
                        identity: identity.clone(),
                    });
                }
                match dimension {
                    None => dimension = Some(actual),
                    Some(expected) if expected != actual => {
                        return Err(ReferenceSetError::InconsistentDimension {
                            identity: identity.clone(),
                            expected,
                            actual,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(Self {
            identities,
            dimension,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    pub fn sample_count(&self) -> usize {
        self.identities.values().map(Vec::len).sum()
    }

    /// Embedding dimensionality, `None` when empty.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.identities.contains_key(identity)
    }

    pub fn embeddings(&self, identity: &str) -> Option<&[Embedding]> {
        self.identities.get(identity).map(Vec::as_slice)
    }

    /// Identities in key order with their embeddings.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Embedding])> {
        self.identities
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn per_identity_counts(&self) -> BTreeMap<String, usize> {
        self.identities
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect()
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("reference store path not configured")]
    MissingPath,
    #[error("stored reference set is corrupt: {0}")]
    Corrupt(String),
    #[error("reference store backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Durable copy of the reference set between process runs.
pub trait ReferenceStore {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<ReferenceSet>, StoreError>;
    fn save(&self, set: &ReferenceSet) -> Result<(), StoreError>;
}

/// Shared owner of the current reference set.
///
/// Readers take a lock-free `Arc` snapshot, so a rebuild in progress never
/// blocks matching. Replacement swaps the whole set at once.
#[derive(Debug)]
pub struct ReferenceSetHandle {
    current: ArcSwap<ReferenceSet>,
    rebuild: Mutex<()>,
}

impl Default for ReferenceSetHandle {
    fn default() -> Self {
        Self::new(ReferenceSet::empty())
    }
}

impl ReferenceSetHandle {
    pub fn new(set: ReferenceSet) -> Self {
        Self {
            current: ArcSwap::from_pointee(set),
            rebuild: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<ReferenceSet> {
        self.current.load_full()
    }

    pub fn is_trained(&self) -> bool {
        !self.snapshot().is_empty()
    }

    /// Swap in a new set, returning the previous one.
    pub fn replace(&self, set: ReferenceSet) -> Arc<ReferenceSet> {
        self.current.swap(Arc::new(set))
    }

    /// Serializes builders. Hold the guard for the whole build-and-swap.
    pub fn lock_rebuild(&self) -> MutexGuard<'_, ()> {
        self.rebuild.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn set_of(entries: &[(&str, Vec<Embedding>)]) -> Result<ReferenceSet, ReferenceSetError> {
        ReferenceSet::from_identities(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_from_identities_counts() {
        let set = set_of(&[
            ("S1", vec![emb(&[1.0, 0.0]), emb(&[0.9, 0.1])]),
            ("S2", vec![emb(&[0.0, 1.0])]),
        ])
        .unwrap();
        assert_eq!(set.identity_count(), 2);
        assert_eq!(set.sample_count(), 3);
        assert_eq!(set.dimension(), Some(2));
        assert_eq!(set.per_identity_counts()["S1"], 2);
        assert!(set.contains("S2"));
        assert!(!set.contains("S3"));
    }

    #[test]
    fn test_rejects_empty_identity() {
        let err = set_of(&[("S1", vec![])]).unwrap_err();
        assert!(matches!(err, ReferenceSetError::EmptyIdentity(k) if k == "S1"));
    }

    #[test]
    fn test_rejects_mixed_dimensions() {
        let err = set_of(&[
            ("S1", vec![emb(&[1.0, 0.0])]),
            ("S2", vec![emb(&[1.0, 0.0, 0.0])]),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ReferenceSetError::InconsistentDimension { expected: 2, actual: 3, .. }
        ));
    }

    #[test]
    fn test_rejects_zero_dimension() {
        let err = set_of(&[("S1", vec![emb(&[])])]).unwrap_err();
        assert!(matches!(err, ReferenceSetError::ZeroDimension { .. }));
    }

    #[test]
    fn test_empty_set_has_no_dimension() {
        let set = ReferenceSet::empty();
        assert!(set.is_empty());
        assert_eq!(set.dimension(), None);
    }

    #[test]
    fn test_handle_replace_swaps_whole_set() {
        let handle = ReferenceSetHandle::default();
        assert!(!handle.is_trained());

        let before = handle.snapshot();
        let set = set_of(&[("S1", vec![emb(&[1.0])])]).unwrap();
        let previous = handle.replace(set);

        assert!(previous.is_empty());
        assert!(handle.is_trained());
        // Snapshots taken before the swap keep observing the old set.
        assert!(before.is_empty());
        assert!(handle.snapshot().contains("S1"));
    }

    #[test]
    fn test_handle_reads_during_rebuild_lock() {
        let handle = ReferenceSetHandle::new(set_of(&[("S1", vec![emb(&[1.0])])]).unwrap());
        let _guard = handle.lock_rebuild();
        assert!(handle.snapshot().contains("S1"));
    }
}
