use serde::{Deserialize, Serialize};

/// Face signature produced by the extraction model (typically 128-dimensional).
///
/// Immutable once built; the values are only exposed as a slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature {
    values: Vec<f32>,
}

impl Signature {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Dimensionality of the signature.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute Euclidean distance between two signatures.
    ///
    /// Returns `None` when the dimensionalities differ; the shorter vector is
    /// never silently zipped against the longer one.
    pub fn euclidean_distance(&self, other: &Signature) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>();
        Some(sum.sqrt())
    }
}

impl From<Vec<f32>> for Signature {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// An enrolled signature. One identity may own several entries
/// (e.g. one per enrollment photo).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity_id: String,
    pub display_name: String,
    pub signature: Signature,
}

impl GalleryEntry {
    pub fn new(
        identity_id: impl Into<String>,
        display_name: impl Into<String>,
        signature: impl Into<Signature>,
    ) -> Self {
        Self {
            identity_id: identity_id.into(),
            display_name: display_name.into(),
            signature: signature.into(),
        }
    }
}

/// Best gallery entry for a query, accepted under the recognition threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub identity_id: String,
    pub display_name: String,
    /// Euclidean distance to the query. Smaller = more similar.
    pub distance: f32,
}

impl MatchResult {
    /// Confidence in [0, 1], derived as `1 - distance`.
    pub fn confidence(&self) -> f32 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}
