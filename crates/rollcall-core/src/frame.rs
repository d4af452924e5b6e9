//! Decoded still frame and cheap pre-screening before descriptor extraction.

/// Luma below this counts as near-black.
const DARK_LEVEL: u8 = 32;

/// A decoded grayscale frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Decode an encoded still image (JPEG, PNG, ...) into grayscale.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        let gray = image::load_from_memory(bytes)?.to_luma8();
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        Ok(Self {
            data: gray.into_raw(),
            width,
            height,
        })
    }

    /// Mean luma, 0.0 to 255.0.
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let total: u64 = self.data.iter().map(|&p| u64::from(p)).sum();
        total as f32 / self.data.len() as f32
    }

    /// Share of near-black pixels, 0.0 to 1.0. An empty frame is all dark.
    pub fn dark_fraction(&self) -> f32 {
        if self.data.is_empty() {
            return 1.0;
        }
        let dark = self.data.iter().filter(|&&p| p < DARK_LEVEL).count();
        dark as f32 / self.data.len() as f32
    }

    /// Underexposed beyond use: more than `max_dark_fraction` of the pixels
    /// are near-black.
    pub fn is_dark(&self, max_dark_fraction: f32) -> bool {
        self.dark_fraction() > max_dark_fraction
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty image")]
    Empty,
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}
