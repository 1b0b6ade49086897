//! External-process signature extractor.
//!
//! The extraction model runs out of process: the decoded frame is written to
//! the command's stdin as PNG, and the command prints either a JSON array of
//! floats or `null` (no face) on stdout.

use image::{DynamicImage, ImageFormat};
use rollcall_core::extractor::check_dimension;
use rollcall_core::{ExtractorError, Signature, SignatureExtractor};
use std::io::{Cursor, Write};
use std::process::{Command, Stdio};

pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    expected_dim: Option<usize>,
}

impl CommandExtractor {
    pub fn new(command: &[String], expected_dim: Option<usize>) -> Result<Self, ExtractorError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ExtractorError::Unavailable("empty extractor command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            expected_dim,
        })
    }
}

/// Parse the extractor's stdout: a JSON float array, or `null` for no face.
pub fn parse_signature(stdout: &[u8]) -> Result<Option<Signature>, ExtractorError> {
    let values: Option<Vec<f32>> = serde_json::from_slice(stdout)
        .map_err(|e| ExtractorError::Failed(format!("bad extractor output: {e}")))?;
    Ok(values.map(Signature::new))
}

impl SignatureExtractor for CommandExtractor {
    fn extract(&mut self, image: &DynamicImage) -> Result<Option<Signature>, ExtractorError> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| ExtractorError::Failed(format!("frame encode: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExtractorError::Unavailable(format!("{}: {e}", self.program)))?;

        // Feed stdin from a helper thread so a chatty child cannot deadlock us.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExtractorError::Failed("extractor stdin unavailable".into()))?;
        let writer = std::thread::spawn(move || stdin.write_all(&png));

        let output = child
            .wait_with_output()
            .map_err(|e| ExtractorError::Failed(format!("extractor wait: {e}")))?;
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ExtractorError::Failed(format!("extractor stdin: {e}"))),
            Err(_) => return Err(ExtractorError::Failed("extractor stdin writer panicked".into())),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractorError::Failed(format!(
                "extractor exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let signature = parse_signature(&output.stdout)?;
        if let (Some(sig), Some(expected)) = (&signature, self.expected_dim) {
            check_dimension(sig, expected)?;
        }
        tracing::trace!(
            found = signature.is_some(),
            width = image.width(),
            height = image.height(),
            "extractor finished"
        );
        Ok(signature)
    }
}
