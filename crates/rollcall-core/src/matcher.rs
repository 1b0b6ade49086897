//! Nearest-neighbour matching of a query signature against a gallery.

use crate::types::{GalleryEntry, MatchResult, Signature};
use thiserror::Error;

/// Default maximum Euclidean distance for an accepted match.
pub const DEFAULT_RECOGNITION_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("signature dimension mismatch for {identity_id}: query has {expected}, gallery entry has {actual}")]
    DimensionMismatch {
        identity_id: String,
        expected: usize,
        actual: usize,
    },
}

/// Strategy for comparing a query signature against a gallery of enrolled faces.
pub trait Matcher {
    /// Return the closest entry if it is accepted, `Ok(None)` otherwise.
    fn compare(
        &self,
        query: &Signature,
        gallery: &[GalleryEntry],
    ) -> Result<Option<MatchResult>, MatchError>;
}

/// Euclidean nearest-neighbour matcher with a rejection threshold.
///
/// Scans the whole gallery; equal minimal distances resolve to the entry
/// that appears first. A match is accepted only when its distance is
/// strictly below the threshold.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    threshold: f32,
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_RECOGNITION_THRESHOLD)
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        query: &Signature,
        gallery: &[GalleryEntry],
    ) -> Result<Option<MatchResult>, MatchError> {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let distance = query.euclidean_distance(&entry.signature).ok_or_else(|| {
                MatchError::DimensionMismatch {
                    identity_id: entry.identity_id.clone(),
                    expected: query.len(),
                    actual: entry.signature.len(),
                }
            })?;
            if !distance.is_finite() {
                tracing::warn!(identity_id = %entry.identity_id, "non-finite distance, entry skipped");
                continue;
            }

            let closer = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if closer {
                best = Some((i, distance));
            }
        }

        let Some((idx, distance)) = best else {
            return Ok(None);
        };

        if distance < self.threshold {
            let entry = &gallery[idx];
            tracing::debug!(
                identity_id = %entry.identity_id,
                distance,
                threshold = self.threshold,
                "match accepted"
            );
            Ok(Some(MatchResult {
                identity_id: entry.identity_id.clone(),
                display_name: entry.display_name.clone(),
                distance,
            }))
        } else {
            tracing::debug!(
                nearest = %gallery[idx].identity_id,
                distance,
                threshold = self.threshold,
                "nearest neighbour above threshold"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry::new(id, format!("Student {id}"), values)
    }

    fn two_person_gallery() -> Vec<GalleryEntry> {
        vec![entry("A", vec![0.0, 0.0]), entry("B", vec![10.0, 10.0])]
    }

    #[test]
    fn test_empty_gallery_is_no_match() {
        let query = Signature::new(vec![0.1, 0.1]);
        let result = EuclideanMatcher::default().compare(&query, &[]).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_close_query_matches_nearest() {
        let query = Signature::new(vec![0.1, 0.1]);
        let result = EuclideanMatcher::default()
            .compare(&query, &two_person_gallery())
            .unwrap()
            .expect("A should match");
        assert_eq!(result.identity_id, "A");
        assert_eq!(result.display_name, "Student A");
        assert!((result.distance - 0.141_421_36).abs() < 1e-5);
    }

    #[test]
    fn test_equidistant_query_above_threshold_is_rejected() {
        // Midpoint: ~7.07 from both entries, far above 0.6.
        let query = Signature::new(vec![5.0, 5.0]);
        let result = EuclideanMatcher::default()
            .compare(&query, &two_person_gallery())
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_tie_resolves_to_first_entry() {
        let gallery = vec![
            entry("first", vec![1.0, 0.0]),
            entry("second", vec![-1.0, 0.0]),
        ];
        let query = Signature::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher::new(2.0)
            .compare(&query, &gallery)
            .unwrap()
            .unwrap();
        assert_eq!(result.identity_id, "first");
    }

    #[test]
    fn test_distance_equal_to_threshold_is_rejected() {
        let gallery = vec![entry("A", vec![3.0, 4.0])];
        let query = Signature::new(vec![0.0, 0.0]);
        assert!(EuclideanMatcher::new(5.0).compare(&query, &gallery).unwrap().is_none());
        assert!(EuclideanMatcher::new(5.001).compare(&query, &gallery).unwrap().is_some());
    }

    #[test]
    fn test_global_minimum_across_duplicate_identities() {
        // Same identity enrolled twice; a different identity sits in between.
        let gallery = vec![
            entry("A", vec![0.5, 0.0]),
            entry("B", vec![0.3, 0.0]),
            entry("A", vec![0.05, 0.0]),
        ];
        let query = Signature::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher::default()
            .compare(&query, &gallery)
            .unwrap()
            .unwrap();
        assert_eq!(result.identity_id, "A");
        assert!((result.distance - 0.05).abs() < 1e-6);

        for e in &gallery {
            let d = query.euclidean_distance(&e.signature).unwrap();
            assert!(d >= result.distance);
        }
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        // The exact match comes first; the mismatch further down still fails the call.
        let gallery = vec![entry("A", vec![0.0, 0.0]), entry("C", vec![0.0, 0.0, 0.0])];
        let query = Signature::new(vec![0.0, 0.0]);
        let err = EuclideanMatcher::default().compare(&query, &gallery).unwrap_err();
        assert_eq!(
            err,
            MatchError::DimensionMismatch {
                identity_id: "C".into(),
                expected: 2,
                actual: 3,
            }
        );
    }

    #[test]
    fn test_compare_is_deterministic() {
        let gallery = two_person_gallery();
        let query = Signature::new(vec![9.8, 10.1]);
        let matcher = EuclideanMatcher::default();
        let first = matcher.compare(&query, &gallery).unwrap();
        let second = matcher.compare(&query, &gallery).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.unwrap().identity_id, "B");
        assert_eq!(gallery, two_person_gallery());
    }

    #[test]
    fn test_non_finite_entry_never_shadows_real_match() {
        let query = Signature::new(vec![0.0, 0.0]);
        let gallery = vec![
            entry("corrupt", vec![f32::NAN, 0.0]),
            entry("A", vec![0.1, 0.0]),
        ];
        let result = EuclideanMatcher::default()
            .compare(&query, &gallery)
            .unwrap()
            .unwrap();
        assert_eq!(result.identity_id, "A");

        let nan_query = Signature::new(vec![f32::NAN, 0.0]);
        assert!(EuclideanMatcher::default()
            .compare(&nan_query, &gallery)
            .unwrap()
            .is_none());
    }
}
