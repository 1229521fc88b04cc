//! Encoder types and configuration
//!
//! Tiers, codec identifiers, settings and the error type shared by every
//! encoder backend.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Pure-Rust codecs available to the native tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NativeCodec {
    /// Motion-JPEG in AVI
    Mjpeg,
    /// Uncompressed DIB in AVI
    RawDib,
    /// Intra-only H.264 in MP4
    H264,
}

impl NativeCodec {
    /// Get the file extension for this codec
    pub fn extension(&self) -> &'static str {
        match self {
            NativeCodec::Mjpeg | NativeCodec::RawDib => "avi",
            NativeCodec::H264 => "mp4",
        }
    }

    /// Short name for logs
    pub fn label(&self) -> &'static str {
        match self {
            NativeCodec::Mjpeg => "MJPG",
            NativeCodec::RawDib => "DIB",
            NativeCodec::H264 => "H264",
        }
    }
}

/// Encoder backend tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "codec")]
pub enum EncoderTier {
    /// External FFmpeg process fed over stdin
    PipeProcess,
    /// Built-in container writer
    NativeCodec(NativeCodec),
    /// Numbered PNG stills
    ImageSequence,
}

impl std::fmt::Display for EncoderTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderTier::PipeProcess => write!(f, "ffmpeg pipe"),
            EncoderTier::NativeCodec(codec) => write!(f, "native {}", codec.label()),
            EncoderTier::ImageSequence => write!(f, "image sequence"),
        }
    }
}

/// Snapshot of an open encoder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderState {
    /// Active tier
    pub tier: EncoderTier,

    /// Output file (or directory for image sequences)
    pub output_path: PathBuf,

    /// Frames accepted so far
    pub frames_written: u64,

    /// Bytes written, when the backend can know it
    pub bytes_written: Option<u64>,
}

/// Parameters for opening an encoder
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Output path without extension, e.g. `<dir>/recording_20240101_120000`
    pub stem: PathBuf,

    /// Frame width in pixels (even)
    pub width: u32,

    /// Frame height in pixels (even)
    pub height: u32,

    /// Nominal frame rate
    pub fps: u32,
}

impl OpenRequest {
    /// Path for a given extension
    pub fn path_with_extension(&self, extension: &str) -> PathBuf {
        self.stem.with_extension(extension)
    }

    /// Directory used by the image-sequence tier
    pub fn frames_dir(&self) -> PathBuf {
        let mut name = self
            .stem
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push("_frames");
        self.stem.with_file_name(name)
    }
}

/// FFmpeg pipe encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipeEncoderSettings {
    /// Try the FFmpeg tier at all
    pub enabled: bool,

    /// Explicit FFmpeg executable; when set, no other location is searched
    pub ffmpeg_path: Option<PathBuf>,

    /// x264 preset
    pub preset: String,

    /// x264 constant rate factor
    pub crf: u8,
}

impl Default for PipeEncoderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ffmpeg_path: None,
            preset: "veryfast".to_string(),
            crf: 23,
        }
    }
}

/// Encoder selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncoderSettings {
    /// Pipe tier settings
    pub pipe: PipeEncoderSettings,

    /// Native codecs in priority order
    pub native_codecs: Vec<NativeCodec>,

    /// JPEG quality for Motion-JPEG (1-100)
    pub jpeg_quality: u8,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            pipe: PipeEncoderSettings::default(),
            native_codecs: vec![NativeCodec::Mjpeg, NativeCodec::RawDib, NativeCodec::H264],
            jpeg_quality: 85,
        }
    }
}

/// Encoder errors
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("PNG error: {0}")]
    Png(#[from] png::EncodingError),

    #[error("PNG decode error: {0}")]
    PngDecode(#[from] png::DecodingError),

    #[error("MP4 error: {0}")]
    Mp4(#[from] mp4::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    #[error("Encoder unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Verification failed: {0}")]
    Verification(String),
}

/// Result type for encoder operations
pub type EncoderResult<T> = Result<T, EncoderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_dir_next_to_stem() {
        let request = OpenRequest {
            stem: PathBuf::from("/tmp/out/recording_20240101_120000"),
            width: 2,
            height: 2,
            fps: 30,
        };
        assert_eq!(
            request.frames_dir(),
            PathBuf::from("/tmp/out/recording_20240101_120000_frames")
        );
        assert_eq!(
            request.path_with_extension("avi"),
            PathBuf::from("/tmp/out/recording_20240101_120000.avi")
        );
    }

    #[test]
    fn test_settings_defaults_from_partial_json() {
        let settings: EncoderSettings =
            serde_json::from_str(r#"{"pipe": {"enabled": false}}"#).unwrap();
        assert!(!settings.pipe.enabled);
        assert_eq!(settings.pipe.crf, 23);
        assert_eq!(settings.native_codecs.len(), 3);
    }
}
