//! PNG image-sequence backend
//!
//! Writes `frame_000001.png`, `frame_000002.png`, ... into a dedicated
//! directory with a `sequence.json` manifest describing size and rate.

use super::types::{EncoderError, EncoderResult, EncoderTier, OpenRequest};
use super::{EncoderBackend, EncoderFactory};
use crate::capture::frame::Frame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "sequence.json";

/// Manifest stored next to the frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceManifest {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
    /// printf-style file name pattern
    pub pattern: String,
    pub created_at: DateTime<Utc>,
}

impl SequenceManifest {
    pub fn load(dir: &Path) -> EncoderResult<Self> {
        let content = std::fs::read_to_string(dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, dir: &Path) -> EncoderResult<()> {
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        Ok(())
    }

    pub fn duration_secs(&self) -> f64 {
        if self.fps > 0.0 {
            self.frame_count as f64 / self.fps
        } else {
            0.0
        }
    }
}

/// File name for a 1-based frame number
pub fn frame_file_name(number: u64) -> String {
    format!("frame_{:06}.png", number)
}

/// Factory for the image-sequence tier
pub struct ImageSequenceFactory;

impl EncoderFactory for ImageSequenceFactory {
    fn tier(&self) -> EncoderTier {
        EncoderTier::ImageSequence
    }

    fn try_open(&self, request: &OpenRequest) -> EncoderResult<Box<dyn EncoderBackend>> {
        Ok(Box::new(ImageSequenceWriter::create(request)?))
    }
}

/// Numbered PNG writer
pub struct ImageSequenceWriter {
    dir: PathBuf,
    width: u32,
    height: u32,
    fps: u32,
    frames: u64,
    bytes: u64,
}

impl ImageSequenceWriter {
    pub fn create(request: &OpenRequest) -> EncoderResult<Self> {
        let dir = request.frames_dir();
        std::fs::create_dir_all(&dir)?;

        let writer = Self {
            dir,
            width: request.width,
            height: request.height,
            fps: request.fps,
            frames: 0,
            bytes: 0,
        };
        // Manifest up front so a crash still leaves a readable directory
        writer.manifest().save(&writer.dir)?;
        Ok(writer)
    }

    fn manifest(&self) -> SequenceManifest {
        SequenceManifest {
            width: self.width,
            height: self.height,
            fps: self.fps as f64,
            frame_count: self.frames,
            pattern: "frame_%06d.png".to_string(),
            created_at: Utc::now(),
        }
    }
}

impl EncoderBackend for ImageSequenceWriter {
    fn tier(&self) -> EncoderTier {
        EncoderTier::ImageSequence
    }

    fn output_path(&self) -> &Path {
        &self.dir
    }

    fn write(&mut self, frame: &Frame) -> EncoderResult<()> {
        if frame.width != self.width || frame.height != self.height || !frame.is_well_formed() {
            return Err(EncoderError::InvalidFrame(format!(
                "frame {} is {}x{}, expected {}x{}",
                frame.seq, frame.width, frame.height, self.width, self.height
            )));
        }

        let path = self.dir.join(frame_file_name(self.frames + 1));
        write_png(&path, frame)?;

        self.bytes += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        self.frames += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn bytes_written(&self) -> Option<u64> {
        Some(self.bytes)
    }

    fn finalize(self: Box<Self>) -> EncoderResult<PathBuf> {
        self.manifest().save(&self.dir)?;
        tracing::info!("Image sequence finalized: {} frames in {:?}", self.frames, self.dir);
        Ok(self.dir)
    }
}

fn write_png(path: &Path, frame: &Frame) -> EncoderResult<()> {
    let file = File::create(path)?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), frame.width, frame.height);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_compression(png::Compression::Fast);

    let mut writer = encoder.write_header()?;
    writer.write_image_data(&frame.data)?;
    writer.finish()?;
    Ok(())
}

/// Decode a PNG and return its dimensions
pub fn read_png_dimensions(path: &Path) -> EncoderResult<(u32, u32)> {
    let file = File::open(path)?;
    let decoder = png::Decoder::new(file);
    let mut reader = decoder.read_info()?;

    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf)?;
    Ok((info.width, info.height))
}

/// Rewrite the manifest frame rate
pub fn retime(dir: &Path, fps: f64) -> EncoderResult<()> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(EncoderError::InvalidFrame(format!("invalid frame rate {}", fps)));
    }
    let mut manifest = SequenceManifest::load(dir)?;
    manifest.fps = (fps * 1000.0).round() / 1000.0;
    manifest.save(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sequence_writes_numbered_frames() {
        let dir = tempdir().unwrap();
        let request = OpenRequest {
            stem: dir.path().join("recording_seq"),
            width: 8,
            height: 4,
            fps: 30,
        };

        let mut writer: Box<dyn EncoderBackend> =
            Box::new(ImageSequenceWriter::create(&request).unwrap());
        for seq in 0..3 {
            writer.write(&Frame::solid(seq, 8, 4, [200, 100, 0])).unwrap();
        }
        let out = writer.finalize().unwrap();

        assert_eq!(out, dir.path().join("recording_seq_frames"));
        assert!(out.join("frame_000001.png").exists());
        assert!(out.join("frame_000003.png").exists());
        assert_eq!(read_png_dimensions(&out.join("frame_000003.png")).unwrap(), (8, 4));

        let manifest = SequenceManifest::load(&out).unwrap();
        assert_eq!(manifest.frame_count, 3);
        assert_eq!(manifest.fps, 30.0);
    }

    #[test]
    fn test_retime_updates_manifest() {
        let dir = tempdir().unwrap();
        let request = OpenRequest {
            stem: dir.path().join("recording_seq"),
            width: 2,
            height: 2,
            fps: 30,
        };
        let mut writer: Box<dyn EncoderBackend> =
            Box::new(ImageSequenceWriter::create(&request).unwrap());
        for seq in 0..10 {
            writer.write(&Frame::solid(seq, 2, 2, [0, 0, 0])).unwrap();
        }
        let out = writer.finalize().unwrap();

        retime(&out, 12.5).unwrap();
        let manifest = SequenceManifest::load(&out).unwrap();
        assert_eq!(manifest.fps, 12.5);
        assert!((manifest.duration_secs() - 0.8).abs() < 1e-9);
    }
}
