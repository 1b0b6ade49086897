//! Decode → extract → match, as a single blocking stage.
//!
//! Decode failures, frames without a face, and downstream failures are kept
//! apart so the caller can report each one differently.

use crate::extractor::{ExtractorError, SignatureExtractor};
use crate::matcher::{MatchError, Matcher};
use crate::types::{GalleryEntry, MatchResult};
use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("frame decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Extract(#[from] ExtractorError),
    #[error(transparent)]
    Match(#[from] MatchError),
}

/// Outcome of running one frame through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Identification {
    /// The frame decoded but the model found no face in it.
    NoSignature,
    /// A face was found but nobody in the gallery is close enough.
    NotRecognized,
    Matched(MatchResult),
}

/// Decode an encoded frame (PNG, JPEG, ...) into an image.
pub fn decode_frame(bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Run one encoded frame through decode, extraction and matching.
pub fn identify<E, M>(
    extractor: &mut E,
    matcher: &M,
    frame: &[u8],
    gallery: &[GalleryEntry],
) -> Result<Identification, PipelineError>
where
    E: SignatureExtractor + ?Sized,
    M: Matcher + ?Sized,
{
    let image = decode_frame(frame)?;
    tracing::trace!(width = image.width(), height = image.height(), "frame decoded");

    let Some(signature) = extractor.extract(&image)? else {
        return Ok(Identification::NoSignature);
    };

    match matcher.compare(&signature, gallery)? {
        Some(m) => Ok(Identification::Matched(m)),
        None => Ok(Identification::NotRecognized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::EuclideanMatcher;
    use crate::types::Signature;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    struct FixedExtractor(Option<Vec<f32>>);

    impl SignatureExtractor for FixedExtractor {
        fn extract(&mut self, _image: &DynamicImage) -> Result<Option<Signature>, ExtractorError> {
            Ok(self.0.clone().map(Signature::new))
        }
    }

    struct BrokenExtractor;

    impl SignatureExtractor for BrokenExtractor {
        fn extract(&mut self, _image: &DynamicImage) -> Result<Option<Signature>, ExtractorError> {
            Err(ExtractorError::Failed("model crashed".into()))
        }
    }

    fn png_frame() -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(8, 8))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn gallery() -> Vec<GalleryEntry> {
        vec![GalleryEntry::new("s-1", "Ada", vec![0.0, 0.0])]
    }

    #[test]
    fn test_decode_failure() {
        let mut extractor = FixedExtractor(Some(vec![0.0, 0.0]));
        let err = identify(&mut extractor, &EuclideanMatcher::default(), b"not an image", &gallery())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn test_no_signature_found() {
        let mut extractor = FixedExtractor(None);
        let result =
            identify(&mut extractor, &EuclideanMatcher::default(), &png_frame(), &gallery()).unwrap();
        assert_eq!(result, Identification::NoSignature);
    }

    #[test]
    fn test_extractor_failure_is_distinct() {
        let err = identify(&mut BrokenExtractor, &EuclideanMatcher::default(), &png_frame(), &gallery())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Extract(ExtractorError::Failed(_))));
    }

    #[test]
    fn test_matched_and_not_recognized() {
        let frame = png_frame();
        let matcher = EuclideanMatcher::default();

        let mut near = FixedExtractor(Some(vec![0.1, 0.0]));
        match identify(&mut near, &matcher, &frame, &gallery()).unwrap() {
            Identification::Matched(m) => assert_eq!(m.identity_id, "s-1"),
            other => panic!("expected match, got {other:?}"),
        }

        let mut far = FixedExtractor(Some(vec![3.0, 3.0]));
        assert_eq!(
            identify(&mut far, &matcher, &frame, &gallery()).unwrap(),
            Identification::NotRecognized
        );
    }

    #[test]
    fn test_dimension_mismatch_propagates() {
        let mut extractor = FixedExtractor(Some(vec![0.0, 0.0, 0.0]));
        let err = identify(&mut extractor, &EuclideanMatcher::default(), &png_frame(), &gallery())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Match(MatchError::DimensionMismatch { .. })));
    }
}
