//! rollcall-core — Face signature matching for attendance capture.
//!
//! Signatures come from an external extraction model behind the
//! [`SignatureExtractor`] seam; this crate decides which enrolled identity,
//! if any, a captured frame belongs to.

pub mod extractor;
pub mod matcher;
pub mod pipeline;
pub mod types;

pub use extractor::{ExtractorError, SignatureExtractor};
pub use matcher::{EuclideanMatcher, MatchError, Matcher, DEFAULT_RECOGNITION_THRESHOLD};
pub use pipeline::{Identification, PipelineError};
pub use types::{GalleryEntry, MatchResult, Signature};
