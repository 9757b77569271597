//! Chunk-set manifests and the completeness check.
//!
//! A manifest is the ordered list of chunk source files (boundaries) of one
//! chunked encode. It is stored on every sibling chunk job as an opaque JSON
//! blob; only this module looks inside it.

use crate::jobs::{EncodingJob, EncodingStatus};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("manifest is not a JSON list of boundaries: {0}")]
    Malformed(String),

    #[error("manifest has no boundaries")]
    Empty,

    #[error("manifest lists boundary '{0}' more than once")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkManifest {
    boundaries: Vec<String>,
}

impl ChunkManifest {
    pub fn new(boundaries: Vec<String>) -> Result<Self, ManifestError> {
        if boundaries.is_empty() {
            return Err(ManifestError::Empty);
        }
        let mut seen = std::collections::HashSet::new();
        for b in &boundaries {
            if !seen.insert(b.as_str()) {
                return Err(ManifestError::Duplicate(b.clone()));
            }
        }
        Ok(Self { boundaries })
    }

    pub fn parse(blob: &str) -> Result<Self, ManifestError> {
        let boundaries: Vec<String> =
            serde_json::from_str(blob).map_err(|e| ManifestError::Malformed(e.to_string()))?;
        Self::new(boundaries)
    }

    pub fn to_blob(&self) -> String {
        // a Vec<String> always serializes
        serde_json::to_string(&self.boundaries).unwrap_or_default()
    }

    pub fn boundaries(&self) -> &[String] {
        &self.boundaries
    }

    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    pub fn position(&self, boundary: &str) -> Option<usize> {
        self.boundaries.iter().position(|b| b == boundary)
    }
}

/// SHA-256 hex digest of a manifest blob, used as the chunk-set key.
pub fn manifest_digest(blob: &str) -> String {
    hex::encode(Sha256::digest(blob.as_bytes()))
}

/// Result of checking a chunk set against its manifest.
#[derive(Debug, Clone, PartialEq)]
pub enum Completeness {
    /// Every boundary has exactly one successful sibling with an artifact.
    /// Siblings are returned in boundary order.
    Complete(Vec<EncodingJob>),
    Incomplete(Vec<String>),
}

impl Completeness {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completeness::Complete(_))
    }
}

/// Decides whether `siblings` cover `manifest` completely.
///
/// Counting rows is not enough: every boundary must appear exactly once, every
/// sibling must belong to the manifest, and every sibling must have succeeded
/// with a non-empty artifact.
pub fn check_completeness(manifest: &ChunkManifest, siblings: &[EncodingJob]) -> Completeness {
    let mut reasons = Vec::new();
    let mut by_boundary: HashMap<&str, Vec<&EncodingJob>> = HashMap::new();

    for job in siblings {
        match job.chunk_file_path.as_deref() {
            Some(b) if manifest.position(b).is_some() => by_boundary.entry(b).or_default().push(job),
            Some(b) => reasons.push(format!("sibling {} has unknown boundary {}", job.id, b)),
            None => reasons.push(format!("sibling {} has no boundary", job.id)),
        }
        if job.status != EncodingStatus::Success || !job.has_artifact() {
            reasons.push(format!("chunk {} has no output yet", job.id));
        }
    }

    let mut ordered = Vec::with_capacity(manifest.len());
    for boundary in manifest.boundaries() {
        match by_boundary.get(boundary.as_str()).map(Vec::as_slice) {
            Some([job]) => ordered.push((*job).clone()),
            Some([]) | None => reasons.push(format!("boundary {} is missing", boundary)),
            Some(many) => reasons.push(format!("boundary {} appears {} times", boundary, many.len())),
        }
    }

    if reasons.is_empty() {
        Completeness::Complete(ordered)
    } else {
        Completeness::Incomplete(reasons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn manifest(n: usize) -> ChunkManifest {
        ChunkManifest::new((0..n).map(|i| format!("/chunks/m1/part_{:04}.mp4", i)).collect()).unwrap()
    }

    fn done_chunk(m: &ChunkManifest, boundary: &str) -> EncodingJob {
        let mut job = EncodingJob::new_chunk("m1", 5, m.to_blob(), boundary);
        job.status = EncodingStatus::Success;
        job.artifact = Some(PathBuf::from(format!("{}.enc", boundary)));
        job
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_incomplete_when_any_boundary_or_artifact_missing(
            n in 1usize..12,
            drop_idx in 0usize..12,
            strip_idx in 0usize..12,
            mode in 0u8..3,
            extra_dupes in 0usize..3,
        ) {
            let m = manifest(n);
            let mut siblings: Vec<EncodingJob> =
                m.boundaries().iter().map(|b| done_chunk(&m, b)).collect();

            match mode {
                // a boundary without a row, padded back to the full count with duplicates
                0 => {
                    let idx = drop_idx % n;
                    siblings.remove(idx);
                    if n > 1 {
                        let b = m.boundaries()[(idx + 1) % n].clone();
                        for _ in 0..=extra_dupes {
                            siblings.push(done_chunk(&m, &b));
                        }
                    }
                }
                // a row without an artifact
                1 => siblings[strip_idx % n].artifact = None,
                // a row with an empty artifact path
                _ => siblings[strip_idx % n].artifact = Some(PathBuf::new()),
            }

            prop_assert!(!check_completeness(&m, &siblings).is_complete());
        }

        #[test]
        fn prop_complete_set_is_returned_in_boundary_order(n in 1usize..12, seed in any::<u64>()) {
            let m = manifest(n);
            let mut siblings: Vec<EncodingJob> =
                m.boundaries().iter().map(|b| done_chunk(&m, b)).collect();
            // deterministic shuffle
            let len = siblings.len();
            for i in 0..len {
                let j = ((seed >> (i % 64)) as usize).wrapping_add(i * 7) % len;
                siblings.swap(i, j);
            }

            match check_completeness(&m, &siblings) {
                Completeness::Complete(ordered) => {
                    let got: Vec<_> = ordered.iter().filter_map(|j| j.chunk_file_path.clone()).collect();
                    prop_assert_eq!(got, m.boundaries().to_vec());
                }
                Completeness::Incomplete(reasons) => prop_assert!(false, "incomplete: {:?}", reasons),
            }
        }
    }

    #[test]
    fn test_pending_sibling_blocks_completion() {
        let m = manifest(3);
        let mut siblings: Vec<EncodingJob> =
            m.boundaries().iter().map(|b| done_chunk(&m, b)).collect();
        siblings[1].status = EncodingStatus::Running;
        assert!(!check_completeness(&m, &siblings).is_complete());
    }

    #[test]
    fn test_unknown_boundary_blocks_completion() {
        let m = manifest(2);
        let mut siblings: Vec<EncodingJob> =
            m.boundaries().iter().map(|b| done_chunk(&m, b)).collect();
        siblings.push(done_chunk(&m, "/elsewhere.mp4"));
        assert!(!check_completeness(&m, &siblings).is_complete());
    }

    #[test]
    fn test_manifest_parse_errors() {
        assert!(matches!(ChunkManifest::parse("{"), Err(ManifestError::Malformed(_))));
        assert!(matches!(
            ChunkManifest::parse("{\"a\": 1}"),
            Err(ManifestError::Malformed(_))
        ));
        assert_eq!(ChunkManifest::parse("[]"), Err(ManifestError::Empty));
        assert_eq!(
            ChunkManifest::parse("[\"a\",\"a\"]"),
            Err(ManifestError::Duplicate("a".to_string()))
        );
    }

    #[test]
    fn test_blob_and_digest_are_stable() {
        let m = manifest(2);
        let blob = m.to_blob();
        assert_eq!(ChunkManifest::parse(&blob).unwrap(), m);
        assert_eq!(manifest_digest(&blob), manifest_digest(&m.to_blob()));
        assert_eq!(manifest_digest(&blob).len(), 64);
        assert_ne!(manifest_digest(&blob), manifest_digest(&manifest(3).to_blob()));
    }
}
