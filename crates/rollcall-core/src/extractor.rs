//! Seam to the external feature-extraction model.

use crate::types::Signature;
use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
    #[error("extraction failed: {0}")]
    Failed(String),
    #[error("expected {expected}-dim signature, got {actual}")]
    BadDimension { expected: usize, actual: usize },
}

/// Maps a decoded frame to a face signature.
///
/// `Ok(None)` means the model ran but found no face; errors are reserved
/// for the extractor itself failing.
pub trait SignatureExtractor: Send {
    fn extract(&mut self, image: &DynamicImage) -> Result<Option<Signature>, ExtractorError>;
}

/// Check a signature against the dimensionality the deployment expects.
pub fn check_dimension(signature: &Signature, expected: usize) -> Result<(), ExtractorError> {
    if signature.len() != expected {
        return Err(ExtractorError::BadDimension {
            expected,
            actual: signature.len(),
        });
    }
    Ok(())
}
