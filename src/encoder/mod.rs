//! Video encoder backends
//!
//! Three tiers tried in order: an external FFmpeg process fed raw frames
//! over a pipe, built-in container writers (Motion-JPEG/DIB AVI, H.264 MP4),
//! and a PNG image sequence as the backend of last resort.

pub mod avi;
pub mod ffmpeg;
pub mod image_sequence;
pub mod mp4;
pub mod types;

pub use ffmpeg::{AbortHandle, FfmpegTools, PipeEncoderFactory};
pub use types::{
    EncoderError, EncoderResult, EncoderSettings, EncoderState, EncoderTier, NativeCodec,
    OpenRequest,
    PipeEncoderSettings,
};

use crate::capture::frame::Frame;
use std::path::{Path, PathBuf};

/// An open encoder accepting frames in capture order
pub trait EncoderBackend: Send {
    /// Active tier
    fn tier(&self) -> EncoderTier;

    /// Output file (or directory for image sequences)
    fn output_path(&self) -> &Path;

    /// Encode one frame
    fn write(&mut self, frame: &Frame) -> EncoderResult<()>;

    /// Frames accepted so far
    fn frames_written(&self) -> u64;

    /// Bytes written, when the backend can know it
    fn bytes_written(&self) -> Option<u64>;

    /// Handle for killing an external process from another thread
    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }

    /// Flush, close and return the final output path
    fn finalize(self: Box<Self>) -> EncoderResult<PathBuf>;

    /// Snapshot of the encoder's counters
    fn state(&self) -> EncoderState {
        EncoderState {
            tier: self.tier(),
            output_path: self.output_path().to_path_buf(),
            frames_written: self.frames_written(),
            bytes_written: self.bytes_written(),
        }
    }
}

/// Capability-checked constructor for one encoder tier
pub trait EncoderFactory: Send + Sync {
    /// Tier this factory opens
    fn tier(&self) -> EncoderTier;

    /// Open the encoder, or report why it is unavailable
    ///
    /// A failed attempt must release anything it created.
    fn try_open(&self, request: &OpenRequest) -> EncoderResult<Box<dyn EncoderBackend>>;
}

/// Built-in codec factory
pub struct NativeEncoderFactory {
    pub codec: NativeCodec,
    pub jpeg_quality: u8,
}

impl EncoderFactory for NativeEncoderFactory {
    fn tier(&self) -> EncoderTier {
        EncoderTier::NativeCodec(self.codec)
    }

    fn try_open(&self, request: &OpenRequest) -> EncoderResult<Box<dyn EncoderBackend>> {
        match self.codec {
            NativeCodec::Mjpeg | NativeCodec::RawDib => {
                let writer = avi::AviWriter::create(request, self.codec, self.jpeg_quality)?;
                Ok(Box::new(writer))
            }
            NativeCodec::H264 => {
                let writer = mp4::H264Mp4Writer::create(request)?;
                Ok(Box::new(writer))
            }
        }
    }
}

/// Build the default tier order for the given settings
///
/// `tools` is the located FFmpeg installation, if any; without it the pipe
/// tier is skipped.
pub fn default_chain(
    settings: &EncoderSettings,
    tools: Option<&FfmpegTools>,
) -> Vec<Box<dyn EncoderFactory>> {
    let mut chain: Vec<Box<dyn EncoderFactory>> = Vec::new();

    if settings.pipe.enabled {
        match tools {
            Some(tools) => {
                chain.push(Box::new(PipeEncoderFactory::new(tools.clone(), &settings.pipe)))
            }
            None => tracing::warn!("FFmpeg not found; skipping pipe encoder"),
        }
    }

    for codec in &settings.native_codecs {
        chain.push(Box::new(NativeEncoderFactory {
            codec: *codec,
            jpeg_quality: settings.jpeg_quality.clamp(1, 100),
        }));
    }

    chain.push(Box::new(image_sequence::ImageSequenceFactory));
    chain
}

/// Open the first tier that initializes
///
/// Fails with `EncoderError::Unavailable` only when every tier fails.
pub fn select_backend(
    chain: &[Box<dyn EncoderFactory>],
    request: &OpenRequest,
) -> EncoderResult<Box<dyn EncoderBackend>> {
    let mut failures = Vec::new();

    for factory in chain {
        match factory.try_open(request) {
            Ok(backend) => {
                tracing::info!(
                    "Encoder selected: {} -> {:?} ({}x{} @ {}fps)",
                    backend.tier(),
                    backend.output_path(),
                    request.width,
                    request.height,
                    request.fps
                );
                return Ok(backend);
            }
            Err(e) => {
                tracing::warn!("Encoder tier {} unavailable: {}", factory.tier(), e);
                failures.push(format!("{}: {}", factory.tier(), e));
            }
        }
    }

    Err(EncoderError::Unavailable(if failures.is_empty() {
        "no encoder tier configured".to_string()
    } else {
        failures.join("; ")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Factory that always fails, standing in for a codec that will not open
    struct ClosedFactory(EncoderTier);

    impl EncoderFactory for ClosedFactory {
        fn tier(&self) -> EncoderTier {
            self.0
        }

        fn try_open(&self, _request: &OpenRequest) -> EncoderResult<Box<dyn EncoderBackend>> {
            Err(EncoderError::Unavailable("writer did not report open".to_string()))
        }
    }

    fn request(dir: &Path) -> OpenRequest {
        OpenRequest {
            stem: dir.join("recording_test"),
            width: 16,
            height: 8,
            fps: 30,
        }
    }

    #[test]
    fn test_falls_back_to_image_sequence() {
        let dir = tempdir().unwrap();
        let chain: Vec<Box<dyn EncoderFactory>> = vec![
            Box::new(ClosedFactory(EncoderTier::PipeProcess)),
            Box::new(ClosedFactory(EncoderTier::NativeCodec(NativeCodec::Mjpeg))),
            Box::new(ClosedFactory(EncoderTier::NativeCodec(NativeCodec::RawDib))),
            Box::new(image_sequence::ImageSequenceFactory),
        ];

        let mut backend = select_backend(&chain, &request(dir.path())).unwrap();
        assert_eq!(backend.tier(), EncoderTier::ImageSequence);

        backend.write(&Frame::solid(0, 16, 8, [1, 2, 3])).unwrap();
        let path = backend.finalize().unwrap();
        assert!(path.is_dir());
    }

    #[test]
    fn test_all_tiers_closed_is_unavailable() {
        let dir = tempdir().unwrap();
        let chain: Vec<Box<dyn EncoderFactory>> =
            vec![Box::new(ClosedFactory(EncoderTier::PipeProcess))];

        let err = select_backend(&chain, &request(dir.path())).err().unwrap();
        assert!(matches!(err, EncoderError::Unavailable(_)));
        assert!(err.to_string().contains("ffmpeg pipe"));
    }

    #[test]
    fn test_default_chain_without_ffmpeg() {
        let settings = EncoderSettings::default();
        let chain = default_chain(&settings, None);

        let tiers: Vec<EncoderTier> = chain.iter().map(|f| f.tier()).collect();
        assert_eq!(
            tiers,
            vec![
                EncoderTier::NativeCodec(NativeCodec::Mjpeg),
                EncoderTier::NativeCodec(NativeCodec::RawDib),
                EncoderTier::NativeCodec(NativeCodec::H264),
                EncoderTier::ImageSequence,
            ]
        );
    }

    #[test]
    fn test_native_chain_prefers_mjpeg() {
        let dir = tempdir().unwrap();
        let settings = EncoderSettings {
            pipe: PipeEncoderSettings {
                enabled: false,
                ..PipeEncoderSettings::default()
            },
            ..EncoderSettings::default()
        };
        let chain = default_chain(&settings, None);

        let backend = select_backend(&chain, &request(dir.path())).unwrap();
        assert_eq!(backend.tier(), EncoderTier::NativeCodec(NativeCodec::Mjpeg));
        assert_eq!(backend.output_path().extension().unwrap(), "avi");
    }
}
