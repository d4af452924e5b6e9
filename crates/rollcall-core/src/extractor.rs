//! Descriptor extraction contract.
//!
//! The face model itself lives behind [`DescriptorExtractor`]; the pipeline
//! only needs "image bytes in, embedding or no face out". Malformed input is
//! an expected runtime condition and must come back as
//! [`Descriptor::NoFace`], never as an error.

use crate::frame::Frame;
use crate::types::Embedding;
use thiserror::Error;

/// What an extractor found in a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    Face(Embedding),
    NoFace,
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("descriptor backend unavailable: {0}")]
    Unavailable(String),
    #[error("descriptor backend returned malformed output: {0}")]
    Malformed(String),
}

impl ExtractError {
    /// Backend outages are worth retrying; malformed output is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExtractError::Unavailable(_))
    }
}

/// Turns encoded image bytes into a face descriptor.
///
/// Implementations must be deterministic for a given image. Each worker
/// owns its own instance, hence `&mut self`.
pub trait DescriptorExtractor: Send {
    fn extract(&mut self, image: &[u8]) -> Result<Descriptor, ExtractError>;
}

impl<E: DescriptorExtractor + ?Sized> DescriptorExtractor for Box<E> {
    fn extract(&mut self, image: &[u8]) -> Result<Descriptor, ExtractError> {
        (**self).extract(image)
    }
}

/// Decodes and screens frames locally before handing them to `inner`.
///
/// Undecodable and dark frames resolve to [`Descriptor::NoFace`] without
/// touching the backend.
pub struct ScreenedExtractor<E> {
    inner: E,
    dark_threshold_pct: f32,
}

impl<E: DescriptorExtractor> ScreenedExtractor<E> {
    pub fn new(inner: E, dark_threshold_pct: f32) -> Self {
        Self {
            inner,
            dark_threshold_pct,
        }
    }
}

impl<E: DescriptorExtractor> DescriptorExtractor for ScreenedExtractor<E> {
    fn extract(&mut self, image: &[u8]) -> Result<Descriptor, ExtractError> {
        let frame = match Frame::decode(image) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(error = %err, bytes = image.len(), "frame rejected: undecodable");
                return Ok(Descriptor::NoFace);
            }
        };

        if frame.is_dark(self.dark_threshold_pct) {
            tracing::debug!(
                width = frame.width,
                height = frame.height,
                brightness = frame.avg_brightness(),
                "frame rejected: too dark"
            );
            return Ok(Descriptor::NoFace);
        }

        let descriptor = self.inner.extract(image)?;
        if let Descriptor::Face(embedding) = &descriptor {
            if embedding.values.is_empty() || embedding.values.iter().any(|v| !v.is_finite()) {
                return Err(ExtractError::Malformed(
                    "embedding is empty or contains non-finite values".into(),
                ));
            }
        }
        Ok(descriptor)
    }
}
