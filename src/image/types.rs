//! Core types for image generation jobs.

use crate::error::{FluxViewError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Image formats recognised in downloaded artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// PNG format (lossless). The only format requested from the API.
    #[default]
    Png,
    /// JPEG format (lossy).
    Jpeg,
}

impl ImageFormat {
    /// Returns the file extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }

    /// Detects image format from magic bytes.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        // PNG: 89 50 4E 47 0D 0A 1A 0A
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(Self::Png);
        }

        // JPEG: FF D8 FF
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }

        None
    }
}

/// Aspect ratios accepted by the generation endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    /// 1:1 square aspect ratio.
    #[serde(rename = "1:1")]
    Square,
    /// 4:3 standard landscape aspect ratio.
    #[serde(rename = "4:3")]
    Standard,
    /// 16:9 landscape (widescreen) aspect ratio.
    #[serde(rename = "16:9")]
    Landscape,
    /// 21:9 ultrawide aspect ratio.
    #[serde(rename = "21:9")]
    Ultrawide,
    /// 3:4 standard portrait aspect ratio.
    #[serde(rename = "3:4")]
    StandardPortrait,
}

impl AspectRatio {
    /// Every supported ratio, in menu order.
    pub const ALL: [AspectRatio; 5] = [
        Self::Square,
        Self::Standard,
        Self::Landscape,
        Self::Ultrawide,
        Self::StandardPortrait,
    ];

    /// Returns the aspect ratio as a string (e.g., "16:9").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Standard => "4:3",
            Self::Landscape => "16:9",
            Self::Ultrawide => "21:9",
            Self::StandardPortrait => "3:4",
        }
    }
}

impl std::fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AspectRatio {
    type Err = FluxViewError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ar| ar.as_str() == s.trim())
            .ok_or_else(|| FluxViewError::InvalidRequest(format!("unsupported aspect ratio: {s}")))
    }
}

/// A request to generate an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// The text prompt describing the desired image.
    pub prompt: String,
    /// Aspect ratio of the output.
    pub aspect_ratio: Option<AspectRatio>,
    /// Ask for less processed, more natural looking output.
    pub raw: bool,
    /// Desired width in pixels.
    pub width: Option<u32>,
    /// Desired height in pixels.
    pub height: Option<u32>,
    /// Let the service rewrite the prompt before generating.
    pub prompt_upsampling: Option<bool>,
}

impl GenerationRequest {
    /// Creates a new request with the given prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            aspect_ratio: None,
            raw: false,
            width: None,
            height: None,
            prompt_upsampling: None,
        }
    }

    /// Sets the aspect ratio.
    pub fn with_aspect_ratio(mut self, ratio: AspectRatio) -> Self {
        self.aspect_ratio = Some(ratio);
        self
    }

    /// Sets the desired dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Enables or disables raw mode.
    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    /// Enables or disables prompt upsampling.
    pub fn with_prompt_upsampling(mut self, enabled: bool) -> Self {
        self.prompt_upsampling = Some(enabled);
        self
    }

    /// Output format sent with every request.
    pub fn output_format(&self) -> ImageFormat {
        ImageFormat::Png
    }

    /// Rejects requests that must never reach the network.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(FluxViewError::InvalidRequest("prompt must not be empty".into()));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(FluxViewError::InvalidRequest(
                "width and height must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A job accepted by the remote service.
#[derive(Debug, Clone)]
pub struct JobHandle {
    /// Opaque id issued by the service.
    pub id: String,
    /// When the job was accepted.
    pub submitted_at: DateTime<Utc>,
    /// The request that created the job.
    pub request: GenerationRequest,
}

/// Status of a remote job as reported by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Still queued or running.
    Pending,
    /// Finished; the image can be downloaded from `sample_url`.
    Ready { sample_url: String },
    /// Finished without an image.
    Failed { reason: String },
}

impl JobStatus {
    /// Returns true once no further polling is needed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A generated image materialised locally.
#[derive(Debug, Clone)]
#[must_use = "artifact should be saved or displayed"]
pub struct Artifact {
    /// Raw image bytes.
    pub bytes: Vec<u8>,
    /// Sample URL the bytes were downloaded from.
    pub source_url: String,
    /// Where the bytes were written, if they were saved.
    pub saved_path: Option<PathBuf>,
}

impl Artifact {
    /// Creates an unsaved artifact.
    pub fn new(bytes: Vec<u8>, source_url: impl Into<String>) -> Self {
        Self {
            bytes,
            source_url: source_url.into(),
            saved_path: None,
        }
    }

    /// Returns the size of the image data in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Returns the format detected from magic bytes.
    pub fn detected_format(&self) -> Option<ImageFormat> {
        ImageFormat::from_magic_bytes(&self.bytes)
    }

    /// Decodes the image and scales it down to fit inside the given box,
    /// keeping its aspect ratio. Images that already fit are not enlarged.
    pub fn preview(&self, max_width: u32, max_height: u32) -> Result<::image::RgbaImage> {
        if max_width == 0 || max_height == 0 {
            return Err(FluxViewError::InvalidRequest(
                "preview box must be non-empty".into(),
            ));
        }

        let decoded = ::image::load_from_memory(&self.bytes)?;
        if decoded.width() <= max_width && decoded.height() <= max_height {
            return Ok(decoded.to_rgba8());
        }

        Ok(decoded
            .resize(max_width, max_height, ::image::imageops::FilterType::Lanczos3)
            .to_rgba8())
    }
}
