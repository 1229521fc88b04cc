//! Frame-rate reconciliation
//!
//! Frames are encoded at the nominal rate, but a slow source or a busy
//! machine delivers fewer. When the measured rate drifts beyond the
//! threshold, the video is re-timed so its duration matches wall-clock time.

use crate::encoder::{
    avi, image_sequence, mp4, EncoderError, EncoderResult, EncoderTier, FfmpegTools,
};
use std::path::Path;

/// Measured timing of a finished capture
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub target_fps: u32,
    pub frames_written: u64,
    pub duration_secs: f64,
}

impl Timing {
    pub fn actual_fps(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.frames_written as f64 / self.duration_secs
        } else {
            0.0
        }
    }

    /// Whether drift exceeds `threshold` and re-timing is possible
    pub fn needs_retime(&self, threshold: f64) -> bool {
        if self.frames_written == 0 || self.duration_secs <= 0.0 {
            return false;
        }
        (self.actual_fps() - self.target_fps as f64).abs() > threshold
    }
}

/// Re-time `path` to the measured rate when drift exceeds `threshold`
///
/// Returns whether the file was changed. FFmpeg is tried first when
/// available; the container-native patch is the fallback. On any failure the
/// original file is left as it was.
pub fn reconcile(
    path: &Path,
    tier: EncoderTier,
    timing: Timing,
    threshold: f64,
    tools: Option<&FfmpegTools>,
) -> EncoderResult<bool> {
    if !timing.needs_retime(threshold) {
        tracing::debug!(
            "No re-timing needed: {:.2} fps measured vs {} target",
            timing.actual_fps(),
            timing.target_fps
        );
        return Ok(false);
    }

    let fps = timing.actual_fps();
    tracing::info!(
        "Re-timing {:?}: {} frames over {:.2}s ({:.2} fps, target {})",
        path,
        timing.frames_written,
        timing.duration_secs,
        fps,
        timing.target_fps
    );

    if tier != EncoderTier::ImageSequence {
        if let Some(tools) = tools {
            match tools.retime(path, fps, timing.duration_secs) {
                Ok(()) => return Ok(true),
                Err(e) => tracing::warn!("FFmpeg re-timing failed, trying container patch: {}", e),
            }
        }
    }

    retime_native(path, tier, fps)?;
    Ok(true)
}

fn retime_native(path: &Path, tier: EncoderTier, fps: f64) -> EncoderResult<()> {
    if tier == EncoderTier::ImageSequence || path.is_dir() {
        return image_sequence::retime(path, fps);
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "avi" => avi::retime(path, fps),
        "mp4" => mp4::retime(path, fps),
        other => Err(EncoderError::Unavailable(format!("cannot re-time .{} files", other))),
    }
}
