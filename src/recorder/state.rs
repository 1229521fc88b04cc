//! Recording state management
//!
//! Defines the session state machine, configuration and output records.

use crate::capture::input::InputCapabilities;
use crate::capture::CaptureBackend;
use crate::encoder::{EncoderSettings, EncoderState, EncoderTier};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub const MIN_FPS: u32 = 15;
pub const MAX_FPS: u32 = 60;

/// Current state of the recording system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No recording has been started
    #[default]
    Idle,
    /// Probing the source and opening the encoder
    Starting,
    /// Workers running
    Recording,
    /// Draining and finalizing
    Stopping,
    /// Output written
    Finalized,
    /// Start failed
    Failed,
}

impl RecordingState {
    /// Whether `start()` may begin a new session from this state
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Finalized | Self::Failed)
    }
}

/// Session errors
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("Frame write failed: {0}")]
    FrameWriteFailed(String),

    #[error("Input listener unavailable: {0}")]
    ListenerUnavailable(String),

    #[error("Output verification failed: {0}")]
    OutputVerificationFailed(String),

    #[error("External process timed out: {0}")]
    ExternalProcessTimeout(String),

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type RecordingResult<T> = Result<T, RecordingError>;

/// Configuration for a recorder instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingConfig {
    /// Directory receiving the video and event log
    pub output_dir: PathBuf,

    /// Fraction of native resolution, clamped to [0.25, 1.0]
    pub scale: f64,

    /// Target frame rate, clamped to [15, 60]
    pub fps: u32,

    /// Display to capture
    pub display_index: u32,

    pub capture_backend: CaptureBackend,

    pub encoder: EncoderSettings,

    pub input: InputCapabilities,

    /// Drift beyond which the video is re-timed
    pub reconcile_threshold_fps: f64,

    /// Bounded wait for the capture worker at stop
    pub join_timeout_ms: u64,

    /// Bounded wait for the writer worker at stop
    pub writer_timeout_ms: u64,

    /// Timeout for FFmpeg helper invocations and encoder shutdown
    pub process_timeout_ms: u64,

    /// Frame queue depth, in seconds of video
    pub queue_seconds: f64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            scale: 1.0,
            fps: 30,
            display_index: 0,
            capture_backend: CaptureBackend::default(),
            encoder: EncoderSettings::default(),
            input: InputCapabilities::default(),
            reconcile_threshold_fps: 2.0,
            join_timeout_ms: 2_000,
            writer_timeout_ms: 30_000,
            process_timeout_ms: 120_000,
            queue_seconds: 2.5,
        }
    }
}

impl RecordingConfig {
    /// Load a JSON config file; missing fields take defaults
    pub fn from_file(path: &Path) -> RecordingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config.normalized())
    }

    /// Clamp scale and fps into their supported ranges
    pub fn normalized(mut self) -> Self {
        self.scale = crate::capture::frame::clamp_scale(self.scale);
        self.fps = self.fps.clamp(MIN_FPS, MAX_FPS);
        if !self.reconcile_threshold_fps.is_finite() || self.reconcile_threshold_fps < 0.0 {
            self.reconcile_threshold_fps = 2.0;
        }
        if !self.queue_seconds.is_finite() || self.queue_seconds <= 0.0 {
            self.queue_seconds = 2.5;
        }
        self
    }

    /// Frame queue capacity, at least one frame
    pub fn queue_capacity(&self) -> usize {
        ((self.fps as f64 * self.queue_seconds).ceil() as usize).max(1)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn writer_timeout(&self) -> Duration {
        Duration::from_millis(self.writer_timeout_ms)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.process_timeout_ms)
    }
}

/// Output locations for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPaths {
    /// `recording_<ts>`, without extension
    pub video_stem: PathBuf,

    /// `events_<ts>.json`
    pub events_path: PathBuf,
}

impl SessionPaths {
    /// Timestamped paths under `dir`, suffixed `_1`, `_2`, ... on collision
    pub fn resolve(dir: &Path, at: DateTime<Local>) -> Self {
        let stamp = at.format("%Y%m%d_%H%M%S").to_string();

        let mut suffix = 0u32;
        loop {
            let tag = if suffix == 0 {
                stamp.clone()
            } else {
                format!("{}_{}", stamp, suffix)
            };
            let paths = Self {
                video_stem: dir.join(format!("recording_{}", tag)),
                events_path: dir.join(format!("events_{}.json", tag)),
            };
            if !paths.collides() {
                return paths;
            }
            suffix += 1;
        }
    }

    fn collides(&self) -> bool {
        if self.events_path.exists() {
            return true;
        }
        let frames_dir = {
            let mut name = self.video_stem.as_os_str().to_os_string();
            name.push("_frames");
            PathBuf::from(name)
        };
        ["mp4", "avi"]
            .iter()
            .any(|ext| self.video_stem.with_extension(ext).exists())
            || frames_dir.exists()
    }
}

/// Identity of a recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub paths: SessionPaths,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub tier: EncoderTier,
}

/// Result of a completed recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOutput {
    pub session_id: Uuid,

    /// Final video file or image-sequence directory
    pub video_path: PathBuf,

    pub events_path: PathBuf,

    pub encoder: EncoderState,

    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub write_failures: u64,

    /// Capture loop wall-clock duration
    pub duration_secs: f64,

    /// Frames written per second of capture
    pub actual_fps: f64,

    /// Whether the video was re-timed to `actual_fps`
    pub retimed: bool,

    /// Whether the video passed verification (after repair, if any)
    pub verified: bool,

    pub events_logged: usize,

    /// Names of input listeners that ran
    pub listeners: Vec<String>,
}

/// Events broadcast to subscribers
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    /// Workers running
    Started(SessionInfo),
    /// Progress update (frames written, elapsed ms)
    Progress { frames: u64, elapsed_ms: f64 },
    /// Output finalized
    Stopped(RecordingOutput),
    /// Error occurred
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_state_transitions_allowed_from() {
        assert!(RecordingState::Idle.can_start());
        assert!(RecordingState::Finalized.can_start());
        assert!(RecordingState::Failed.can_start());
        assert!(!RecordingState::Starting.can_start());
        assert!(!RecordingState::Recording.can_start());
        assert!(!RecordingState::Stopping.can_start());
    }

    #[test]
    fn test_config_normalization() {
        let config = RecordingConfig {
            scale: 3.0,
            fps: 240,
            ..RecordingConfig::default()
        }
        .normalized();
        assert_eq!(config.scale, 1.0);
        assert_eq!(config.fps, 60);

        let config = RecordingConfig {
            scale: 0.01,
            fps: 1,
            ..RecordingConfig::default()
        }
        .normalized();
        assert_eq!(config.scale, 0.25);
        assert_eq!(config.fps, 15);
    }

    #[test]
    fn test_queue_capacity() {
        let config = RecordingConfig::default();
        assert_eq!(config.queue_capacity(), 75);
    }

    #[test]
    fn test_config_from_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "fps": 24, "captureBackend": "synthetic", "input": { "mouse": false } }"#,
        )
        .unwrap();

        let config = RecordingConfig::from_file(&path).unwrap();
        assert_eq!(config.fps, 24);
        assert_eq!(config.capture_backend, CaptureBackend::Synthetic);
        assert!(!config.input.mouse);
        assert!(config.input.keyboard);
        assert_eq!(config.reconcile_threshold_fps, 2.0);
    }

    #[test]
    fn test_session_paths_collision_suffix() {
        let dir = tempdir().unwrap();
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        let first = SessionPaths::resolve(dir.path(), at);
        assert_eq!(first.video_stem, dir.path().join("recording_20240309_140507"));
        assert_eq!(first.events_path, dir.path().join("events_20240309_140507.json"));

        std::fs::write(first.video_stem.with_extension("avi"), b"x").unwrap();
        let second = SessionPaths::resolve(dir.path(), at);
        assert_eq!(second.video_stem, dir.path().join("recording_20240309_140507_1"));
    }
}
