//! Recording coordinator
//!
//! `ScreenRecorder` drives one session at a time through
//! Idle -> Starting -> Recording -> Stopping -> Finalized (or Failed):
//! probe the frame source, open an encoder tier, run the capture and writer
//! workers, then finalize, re-time, verify and write the event log.

use super::queue::frame_queue;
use super::reconcile::{self, Timing};
use super::scheduler::{
    actual_fps, run_writer_loop, CaptureLoop, CaptureStats, WriterControl, WriterReport,
};
use super::state::{
    RecordingConfig, RecordingError, RecordingEvent, RecordingOutput, RecordingResult,
    RecordingState,
    SessionInfo, SessionPaths,
};
use super::verify;
use super::worker::{Joined, Worker};
use crate::capture::input::{platform_input_listener, EventLogger, InputListener};
use crate::capture::{logical_resolution, openers_for, resolve_source, SourceOpener};
use crate::encoder::{
    default_chain, select_backend, AbortHandle, EncoderFactory, EncoderState, FfmpegTools,
    OpenRequest,
};
use crate::utils::ErrorResponse;
use chrono::{DateTime, Local, Utc};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Extra wait for the writer after its process was killed
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Resources of the running session
struct ActiveSession {
    info: SessionInfo,
    started: Instant,
    stop: Arc<AtomicBool>,
    control: WriterControl,
    capture: Worker<CaptureStats>,
    writer: Worker<WriterReport>,
    abort: Option<AbortHandle>,
    /// Encoder counters at open; used when the writer never reports back
    opened_state: EncoderState,
    logger: EventLogger,
    listeners: Vec<String>,
}

/// Screen recorder with a host-facing start/stop API
pub struct ScreenRecorder {
    config: RecordingConfig,

    /// Current recording state
    state: Arc<RwLock<RecordingState>>,

    openers: Vec<Arc<dyn SourceOpener>>,

    /// Fixed encoder chain; built from the config when unset
    encoder_chain: Option<Vec<Box<dyn EncoderFactory>>>,

    listener: Option<Box<dyn InputListener>>,

    /// FFmpeg lookup result, resolved on first start
    tools: Option<Option<FfmpegTools>>,

    active: Option<ActiveSession>,
    last_session: Option<SessionInfo>,
    last_output: Option<RecordingOutput>,
    last_error: Option<ErrorResponse>,

    /// Event broadcaster
    event_tx: broadcast::Sender<RecordingEvent>,
}

impl ScreenRecorder {
    /// Create a recorder; config values are clamped into range
    pub fn new(config: RecordingConfig) -> Self {
        let config = config.normalized();
        let (event_tx, _) = broadcast::channel(100);

        Self {
            openers: openers_for(config.capture_backend),
            listener: platform_input_listener(&config.input),
            config,
            state: Arc::new(RwLock::new(RecordingState::Idle)),
            encoder_chain: None,
            tools: None,
            active: None,
            last_session: None,
            last_output: None,
            last_error: None,
            event_tx,
        }
    }

    /// Replace the frame source openers, tried in order
    pub fn with_openers(mut self, openers: Vec<Arc<dyn SourceOpener>>) -> Self {
        self.openers = openers;
        self
    }

    /// Use a fixed encoder tier order instead of the configured one
    pub fn with_encoder_chain(mut self, chain: Vec<Box<dyn EncoderFactory>>) -> Self {
        self.encoder_chain = Some(chain);
        self
    }

    /// Replace the platform input listener
    pub fn with_listener(mut self, listener: Option<Box<dyn InputListener>>) -> Self {
        self.listener = listener;
        self
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    /// Get the current recording state
    pub fn state(&self) -> RecordingState {
        *self.state.read()
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecordingState::Recording
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// Start time of the current (or last) session
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.current_session().map(|s| s.started_at)
    }

    /// Video path of the current (or last) session
    pub fn video_path(&self) -> Option<PathBuf> {
        if let Some(active) = &self.active {
            return Some(active.opened_state.output_path.clone());
        }
        self.last_output.as_ref().map(|o| o.video_path.clone())
    }

    /// Event log path of the current (or last) session
    pub fn events_path(&self) -> Option<PathBuf> {
        self.current_session().map(|s| s.paths.events_path.clone())
    }

    pub fn last_output(&self) -> Option<&RecordingOutput> {
        self.last_output.as_ref()
    }

    pub fn last_error(&self) -> Option<ErrorResponse> {
        self.last_error.clone()
    }

    /// Elapsed time of the running session in milliseconds
    pub fn duration_ms(&self) -> f64 {
        match &self.active {
            Some(active) => active.started.elapsed().as_secs_f64() * 1000.0,
            None => self.last_output.as_ref().map(|o| o.duration_secs * 1000.0).unwrap_or(0.0),
        }
    }

    /// Surface a non-fatal session error; the first one is kept
    fn report_error(&mut self, error: RecordingError) {
        tracing::warn!("{}", error);
        if self.last_error.is_none() {
            self.last_error = Some(ErrorResponse::from(&error));
        }
        let _ = self.event_tx.send(RecordingEvent::Error(error.to_string()));
    }

    fn current_session(&self) -> Option<&SessionInfo> {
        self.active.as_ref().map(|a| &a.info).or(self.last_session.as_ref())
    }

    /// Start recording; false if already running or start failed
    pub fn start_recording(&mut self) -> bool {
        match self.start() {
            Ok(_) => true,
            Err(RecordingError::AlreadyRecording) => {
                tracing::warn!("start_recording called while {:?}", self.state());
                false
            }
            Err(_) => false,
        }
    }

    /// Stop recording; false if not recording
    pub fn stop_recording(&mut self) -> bool {
        match self.stop() {
            Ok(_) => true,
            Err(RecordingError::NotRecording) => {
                tracing::warn!("stop_recording called while {:?}", self.state());
                false
            }
            Err(_) => false,
        }
    }

    /// Start recording
    pub fn start(&mut self) -> RecordingResult<SessionInfo> {
        {
            let mut state = self.state.write();
            if !state.can_start() {
                return Err(RecordingError::AlreadyRecording);
            }
            *state = RecordingState::Starting;
        }
        self.last_error = None;

        match self.begin() {
            Ok(active) => {
                let info = active.info.clone();
                self.active = Some(active);
                *self.state.write() = RecordingState::Recording;
                let _ = self.event_tx.send(RecordingEvent::Started(info.clone()));

                tracing::info!(
                    "Recording started: {}x{} @ {}fps via {} -> {:?}",
                    info.width,
                    info.height,
                    info.fps,
                    info.tier,
                    info.paths.video_stem
                );
                Ok(info)
            }
            Err(e) => {
                tracing::error!("Failed to start recording: {}", e);
                self.last_error = Some(ErrorResponse::from(&e));
                *self.state.write() = RecordingState::Failed;
                let _ = self.event_tx.send(RecordingEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn ffmpeg_tools(&mut self) -> Option<FfmpegTools> {
        if !self.config.encoder.pipe.enabled {
            return None;
        }
        if self.tools.is_none() {
            let located =
                FfmpegTools::locate(&self.config.encoder.pipe, self.config.process_timeout());
            if located.is_none() {
                tracing::warn!("FFmpeg not found; using built-in encoders");
            }
            self.tools = Some(located);
        }
        self.tools.clone().flatten()
    }

    fn begin(&mut self) -> RecordingResult<ActiveSession> {
        // Probe before touching the filesystem
        let source = resolve_source(&self.openers, self.config.display_index)
            .map_err(|e| RecordingError::CaptureUnavailable(e.to_string()))?;
        let (width, height) =
            logical_resolution(source.native_width, source.native_height, self.config.scale);
        tracing::info!(
            "Capture source {}: native {}x{}, recording {}x{}",
            source.opener.name(),
            source.native_width,
            source.native_height,
            width,
            height
        );

        std::fs::create_dir_all(&self.config.output_dir)?;
        let paths = SessionPaths::resolve(&self.config.output_dir, Local::now());

        let request = OpenRequest {
            stem: paths.video_stem.clone(),
            width,
            height,
            fps: self.config.fps,
        };
        let tools = self.ffmpeg_tools();
        let backend = match &self.encoder_chain {
            Some(chain) => select_backend(chain, &request),
            None => select_backend(&default_chain(&self.config.encoder, tools.as_ref()), &request),
        }
        .map_err(|e| RecordingError::EncoderUnavailable(e.to_string()))?;

        let info = SessionInfo {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            paths,
            width,
            height,
            fps: self.config.fps,
            tier: backend.tier(),
        };
        let opened_state = backend.state();
        let abort = backend.abort_handle();

        let logger = EventLogger::new();
        let origin = Instant::now();

        let (sender, receiver) = frame_queue(self.config.queue_capacity());
        let control = WriterControl::default();
        let writer = {
            let control = control.clone();
            Worker::spawn("frame-writer", move || run_writer_loop(backend, receiver, control))?
        };

        let stop = Arc::new(AtomicBool::new(false));
        let capture_loop = CaptureLoop {
            opener: source.opener,
            display_index: self.config.display_index,
            width,
            height,
            fps: self.config.fps,
            stop: Arc::clone(&stop),
            events: Some(self.event_tx.clone()),
        };
        let capture = match Worker::spawn("frame-capture", move || capture_loop.run(sender)) {
            Ok(worker) => worker,
            Err(e) => {
                // The sender went down with the closure; the writer finalizes on its own
                control.input_closed.store(true, Ordering::Relaxed);
                let _ = writer.join_timeout(self.config.writer_timeout());
                return Err(e.into());
            }
        };

        let mut listeners = Vec::new();
        if let Some(listener) = self.listener.as_mut() {
            match listener.start(logger.sink(origin, self.config.input.clone())) {
                Ok(()) => {
                    tracing::info!("Input listener {} active", listener.name());
                    listeners.push(listener.name().to_string());
                }
                Err(e) => {
                    let e = RecordingError::ListenerUnavailable(e.to_string());
                    tracing::warn!("{}; recording video only", e);
                }
            }
        } else {
            tracing::info!("No input listener; recording video only");
        }

        Ok(ActiveSession {
            info,
            started: origin,
            stop,
            control,
            capture,
            writer,
            abort,
            opened_state,
            logger,
            listeners,
        })
    }

    /// Stop recording
    pub fn stop(&mut self) -> RecordingResult<RecordingOutput> {
        {
            let mut state = self.state.write();
            if *state != RecordingState::Recording {
                return Err(RecordingError::NotRecording);
            }
            *state = RecordingState::Stopping;
        }

        let active = match self.active.take() {
            Some(active) => active,
            None => {
                *self.state.write() = RecordingState::Idle;
                return Err(RecordingError::NotRecording);
            }
        };

        tracing::info!("Stopping recording");
        let output = self.finish(active);

        self.last_output = Some(output.clone());
        *self.state.write() = RecordingState::Finalized;
        let _ = self.event_tx.send(RecordingEvent::Stopped(output.clone()));

        tracing::info!(
            "Recording finalized: {} frames ({:.2} fps) over {:.2}s -> {:?}",
            output.encoder.frames_written,
            output.actual_fps,
            output.duration_secs,
            output.video_path
        );
        Ok(output)
    }

    /// Tear down workers and produce the output; never fails
    fn finish(&mut self, active: ActiveSession) -> RecordingOutput {
        let ActiveSession {
            info,
            started,
            stop,
            control,
            capture,
            writer,
            abort,
            opened_state,
            logger,
            listeners,
        } = active;

        stop.store(true, Ordering::Relaxed);
        if let Some(listener) = self.listener.as_mut() {
            listener.stop();
        }

        let capture_stats = match capture.join_timeout(self.config.join_timeout()) {
            Joined::Finished(stats) => stats,
            _ => CaptureStats {
                duration: started.elapsed(),
                ..CaptureStats::default()
            },
        };
        control.input_closed.store(true, Ordering::Relaxed);
        if let Some(message) = capture_stats.open_error.clone() {
            self.report_error(RecordingError::CaptureUnavailable(message));
        }

        let report = match writer.join_timeout(self.config.writer_timeout()) {
            Joined::Finished(report) => Some(report),
            Joined::Panicked => None,
            Joined::TimedOut(writer) => {
                self.report_error(RecordingError::ExternalProcessTimeout(format!(
                    "writer still busy after {:?}; aborting",
                    self.config.writer_timeout()
                )));
                if let Some(abort) = &abort {
                    abort.abort();
                }
                control.abandon.store(true, Ordering::Relaxed);
                match writer.join_timeout(ABORT_GRACE) {
                    Joined::Finished(report) => Some(report),
                    _ => None,
                }
            }
        };

        let (encoder, writer_stats, video_path) = match report {
            Some(report) => {
                let path = match report.finalized {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::warn!("{}", RecordingError::FrameWriteFailed(e.to_string()));
                        report.state.output_path.clone()
                    }
                };
                (report.state, report.stats, path)
            }
            None => {
                let path = opened_state.output_path.clone();
                (opened_state, Default::default(), path)
            }
        };

        let duration_secs = capture_stats.duration.as_secs_f64();
        let tools = self.tools.clone().flatten();

        let timing = Timing {
            target_fps: info.fps,
            frames_written: writer_stats.written,
            duration_secs,
        };
        let retimed = if video_path.exists() {
            match reconcile::reconcile(
                &video_path,
                encoder.tier,
                timing,
                self.config.reconcile_threshold_fps,
                tools.as_ref(),
            ) {
                Ok(retimed) => retimed,
                Err(e) => {
                    tracing::warn!("Frame-rate reconciliation failed: {}", e);
                    false
                }
            }
        } else {
            false
        };

        let report = verify::verify_and_repair(&video_path, tools.as_ref());
        if !report.is_ok() {
            self.report_error(RecordingError::OutputVerificationFailed(report.problems.join("; ")));
        }

        let events_logged = match logger.flush(&info.paths.events_path) {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("Failed to write event log {:?}: {}", info.paths.events_path, e);
                0
            }
        };
        if listeners.is_empty() && events_logged == 0 {
            tracing::warn!("No input listener was active; event log is empty");
        }

        let output = RecordingOutput {
            session_id: info.id,
            video_path,
            events_path: info.paths.events_path.clone(),
            encoder: EncoderState {
                frames_written: writer_stats.written,
                ..encoder
            },
            frames_captured: capture_stats.captured,
            frames_dropped: capture_stats.dropped + writer_stats.abandoned,
            write_failures: writer_stats.failures,
            duration_secs,
            actual_fps: actual_fps(writer_stats.written, capture_stats.duration),
            retimed,
            verified: report.is_ok(),
            events_logged,
            listeners,
        };

        self.last_session = Some(info);
        output
    }
}

impl Drop for ScreenRecorder {
    fn drop(&mut self) {
        if self.is_recording() {
            tracing::warn!("Recorder dropped while recording; stopping");
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::input::listener::testing::ScriptedListener;
    use crate::capture::input::InputEvent;
    use crate::capture::SolidColorOpener;
    use crate::capture::frame::Frame;
    use crate::encoder::{
        EncoderBackend, EncoderResult, EncoderSettings, EncoderTier, NativeCodec,
        NativeEncoderFactory,
        PipeEncoderSettings,
    };
    use crate::recorder::verify::Container;
    use parking_lot::Mutex;
    use std::process::Child;
    use tempfile::tempdir;

    /// Encoder whose finalize hangs until released or its child exits
    struct StuckBackend {
        path: PathBuf,
        frames: u64,
        release: Arc<AtomicBool>,
        child: Option<Arc<Mutex<Child>>>,
    }

    impl EncoderBackend for StuckBackend {
        fn tier(&self) -> EncoderTier {
            EncoderTier::PipeProcess
        }

        fn output_path(&self) -> &Path {
            &self.path
        }

        fn write(&mut self, _frame: &Frame) -> EncoderResult<()> {
            self.frames += 1;
            Ok(())
        }

        fn frames_written(&self) -> u64 {
            self.frames
        }

        fn bytes_written(&self) -> Option<u64> {
            None
        }

        fn abort_handle(&self) -> Option<AbortHandle> {
            self.child.as_ref().map(|child| AbortHandle::for_child(Arc::clone(child)))
        }

        fn finalize(self: Box<Self>) -> EncoderResult<PathBuf> {
            loop {
                if self.release.load(Ordering::Relaxed) {
                    break;
                }
                if let Some(child) = &self.child {
                    if let Ok(Some(_)) = child.lock().try_wait() {
                        break;
                    }
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(self.path)
        }
    }

    struct StuckFactory {
        release: Arc<AtomicBool>,
        /// Back the encoder with a long-running process
        with_child: bool,
    }

    impl EncoderFactory for StuckFactory {
        fn tier(&self) -> EncoderTier {
            EncoderTier::PipeProcess
        }

        fn try_open(&self, request: &OpenRequest) -> EncoderResult<Box<dyn EncoderBackend>> {
            let child = if self.with_child {
                let child = std::process::Command::new("sleep").arg("30").spawn()?;
                Some(Arc::new(Mutex::new(child)))
            } else {
                None
            };
            Ok(Box::new(StuckBackend {
                path: request.path_with_extension("mp4"),
                frames: 0,
                release: Arc::clone(&self.release),
                child,
            }))
        }
    }

    fn stuck_recorder(dir: &Path, with_child: bool) -> (ScreenRecorder, Arc<AtomicBool>) {
        let release = Arc::new(AtomicBool::new(false));
        let mut cfg = config(dir, Vec::new());
        cfg.writer_timeout_ms = 300;

        let recorder = ScreenRecorder::new(cfg)
            .with_openers(synthetic(SolidColorOpener::new(16, 16, [0, 0, 0])))
            .with_encoder_chain(vec![Box::new(StuckFactory {
                release: Arc::clone(&release),
                with_child,
            })])
            .with_listener(None);
        (recorder, release)
    }

    fn config(dir: &Path, native_codecs: Vec<NativeCodec>) -> RecordingConfig {
        RecordingConfig {
            output_dir: dir.join("out"),
            fps: 30,
            scale: 1.0,
            encoder: EncoderSettings {
                pipe: PipeEncoderSettings {
                    enabled: false,
                    ..PipeEncoderSettings::default()
                },
                native_codecs,
                ..EncoderSettings::default()
            },
            ..RecordingConfig::default()
        }
    }

    fn synthetic(opener: SolidColorOpener) -> Vec<Arc<dyn SourceOpener>> {
        vec![Arc::new(opener)]
    }

    fn read_events(path: &Path) -> Vec<InputEvent> {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_two_second_synthetic_recording() {
        let dir = tempdir().unwrap();
        let mut recorder = ScreenRecorder::new(config(dir.path(), vec![NativeCodec::Mjpeg]))
            .with_openers(synthetic(SolidColorOpener::new(160, 120, [200, 40, 40])))
            .with_listener(None);

        assert!(recorder.start_recording());
        assert!(recorder.is_recording());
        assert!(recorder.start_time().is_some());
        std::thread::sleep(Duration::from_secs(2));
        assert!(recorder.stop_recording());
        assert_eq!(recorder.state(), RecordingState::Finalized);

        let output = recorder.last_output().unwrap().clone();
        assert_eq!(output.encoder.tier, EncoderTier::NativeCodec(NativeCodec::Mjpeg));
        assert!(
            (55..=65).contains(&output.encoder.frames_written),
            "frames {}",
            output.encoder.frames_written
        );
        assert!(output.verified);
        assert!(std::fs::metadata(&output.video_path).unwrap().len() > 0);
        assert_eq!(output.video_path.extension().unwrap(), "avi");
        assert_eq!(recorder.video_path(), Some(output.video_path.clone()));

        let events = std::fs::read_to_string(&output.events_path).unwrap();
        assert_eq!(events.trim(), "[]");
        assert_eq!(recorder.events_path(), Some(output.events_path));
    }

    #[test]
    fn test_double_start_is_rejected() {
        let dir = tempdir().unwrap();
        let mut recorder = ScreenRecorder::new(config(dir.path(), vec![NativeCodec::RawDib]))
            .with_openers(synthetic(SolidColorOpener::new(32, 32, [0, 0, 0])))
            .with_listener(None);

        assert!(recorder.start_recording());
        let first = recorder.video_path();
        assert!(!recorder.start_recording());
        assert_eq!(recorder.video_path(), first);
        assert!(recorder.stop_recording());

        let videos = std::fs::read_dir(dir.path().join("out"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().map(|x| x == "avi").unwrap_or(false))
            .count();
        assert_eq!(videos, 1);
    }

    #[test]
    fn test_stop_when_idle_is_rejected() {
        let dir = tempdir().unwrap();
        let mut recorder =
            ScreenRecorder::new(config(dir.path(), vec![NativeCodec::Mjpeg])).with_listener(None);

        assert!(!recorder.stop_recording());
        assert_eq!(recorder.state(), RecordingState::Idle);
        assert!(recorder.last_output().is_none());
    }

    #[test]
    fn test_failed_source_creates_nothing() {
        let dir = tempdir().unwrap();
        let mut recorder = ScreenRecorder::new(config(dir.path(), vec![NativeCodec::Mjpeg]))
            .with_openers(synthetic(SolidColorOpener::failing()))
            .with_listener(None);

        assert!(!recorder.start_recording());
        assert_eq!(recorder.state(), RecordingState::Failed);
        assert!(!dir.path().join("out").exists());
        assert_eq!(recorder.last_error().unwrap().code, "CAPTURE_UNAVAILABLE");

        // Failed sessions can be retried
        let mut recorder =
            recorder.with_openers(synthetic(SolidColorOpener::new(16, 16, [0, 0, 0])));
        assert!(recorder.start_recording());
        assert!(recorder.stop_recording());
    }

    #[test]
    fn test_falls_back_to_image_sequence() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), Vec::new());
        cfg.encoder.pipe = PipeEncoderSettings {
            enabled: true,
            ffmpeg_path: Some(dir.path().join("missing").join("ffmpeg")),
            ..PipeEncoderSettings::default()
        };

        let mut recorder = ScreenRecorder::new(cfg)
            .with_openers(synthetic(SolidColorOpener::new(48, 32, [0, 255, 0])))
            .with_listener(None);

        assert!(recorder.start_recording());
        std::thread::sleep(Duration::from_millis(500));
        assert!(recorder.stop_recording());

        let output = recorder.last_output().unwrap();
        assert_eq!(output.encoder.tier, EncoderTier::ImageSequence);
        assert!(output.video_path.is_dir());
        assert!(output.verified);
        assert!(output.events_path.exists());
    }

    #[test]
    fn test_slow_source_is_retimed_to_wall_clock() {
        let dir = tempdir().unwrap();
        let mut recorder = ScreenRecorder::new(config(dir.path(), vec![NativeCodec::Mjpeg]))
            .with_openers(synthetic(
                SolidColorOpener::new(32, 32, [9, 9, 9]).with_grab_delay(Duration::from_millis(60)),
            ))
            .with_listener(None);

        assert!(recorder.start_recording());
        std::thread::sleep(Duration::from_millis(2000));
        assert!(recorder.stop_recording());

        let output = recorder.last_output().unwrap();
        assert!(output.retimed, "actual fps {}", output.actual_fps);

        let report = verify::inspect(&output.video_path, None);
        assert_eq!(report.container, Container::Avi);
        assert!(
            (report.duration_secs - output.duration_secs).abs() < 0.5,
            "container {:.2}s vs measured {:.2}s",
            report.duration_secs,
            output.duration_secs
        );
    }

    #[test]
    fn test_listener_events_are_sorted() {
        let dir = tempdir().unwrap();
        let mut recorder = ScreenRecorder::new(config(dir.path(), vec![NativeCodec::Mjpeg]))
            .with_openers(synthetic(SolidColorOpener::new(16, 16, [0, 0, 0])))
            .with_listener(Some(Box::new(ScriptedListener::new())));

        assert!(recorder.start_recording());
        std::thread::sleep(Duration::from_millis(200));
        assert!(recorder.stop_recording());

        let output = recorder.last_output().unwrap();
        assert_eq!(output.listeners, vec!["scripted".to_string()]);
        assert_eq!(output.events_logged, 4);

        let events = read_events(&output.events_path);
        assert_eq!(events.len(), 4);
        assert!(events.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
        assert_eq!(events[0].type_name(), "key_press");
    }

    #[test]
    fn test_failing_listener_degrades_to_video_only() {
        let dir = tempdir().unwrap();
        let mut recorder = ScreenRecorder::new(config(dir.path(), vec![NativeCodec::Mjpeg]))
            .with_openers(synthetic(SolidColorOpener::new(16, 16, [0, 0, 0])))
            .with_listener(Some(Box::new(ScriptedListener::failing())));

        assert!(recorder.start_recording());
        assert!(recorder.stop_recording());

        let output = recorder.last_output().unwrap();
        assert!(output.listeners.is_empty());
        assert!(read_events(&output.events_path).is_empty());
    }

    #[test]
    fn test_stuck_writer_stop_is_bounded() {
        let dir = tempdir().unwrap();
        let (mut recorder, release) = stuck_recorder(dir.path(), false);
        let mut rx = recorder.subscribe();

        assert!(recorder.start_recording());
        std::thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        let output = recorder.stop().unwrap();
        let elapsed = started.elapsed();
        release.store(true, Ordering::Relaxed);

        // Writer timeout plus the abort grace, never the full hang
        assert!(elapsed < Duration::from_secs(8), "stop took {:?}", elapsed);
        assert!(elapsed >= Duration::from_millis(300));
        assert_eq!(recorder.state(), RecordingState::Finalized);
        assert_eq!(recorder.last_error().unwrap().code, "EXTERNAL_PROCESS_TIMEOUT");
        assert!(!output.verified);

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if let RecordingEvent::Error(message) = event {
                saw_error |= message.contains("writer still busy");
            }
        }
        assert!(saw_error);
    }

    #[cfg(unix)]
    #[test]
    fn test_writer_timeout_kills_encoder_process() {
        let dir = tempdir().unwrap();
        let (mut recorder, release) = stuck_recorder(dir.path(), true);

        assert!(recorder.start_recording());
        std::thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        let output = recorder.stop().unwrap();
        let elapsed = started.elapsed();
        release.store(true, Ordering::Relaxed);

        // Killing the process lets finalize return well inside the grace period
        assert!(elapsed < Duration::from_secs(4), "stop took {:?}", elapsed);
        assert_eq!(recorder.last_error().unwrap().code, "EXTERNAL_PROCESS_TIMEOUT");
        assert_eq!(output.encoder.tier, EncoderTier::PipeProcess);
        assert!(output.encoder.frames_written > 0);
    }

    #[test]
    fn test_capture_worker_open_failure_is_reported() {
        let dir = tempdir().unwrap();
        // Source resolution at start spends the only successful open
        let mut recorder = ScreenRecorder::new(config(dir.path(), vec![NativeCodec::Mjpeg]))
            .with_openers(synthetic(SolidColorOpener::new(16, 16, [0, 0, 0]).failing_after(1)))
            .with_listener(None);
        let mut rx = recorder.subscribe();

        assert!(recorder.start_recording());
        std::thread::sleep(Duration::from_millis(200));

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if let RecordingEvent::Error(message) = event {
                saw_error |= message.contains("could not open");
            }
        }
        assert!(saw_error);

        assert!(recorder.stop_recording());
        let output = recorder.last_output().unwrap();
        assert_eq!(output.frames_captured, 0);
        assert_eq!(recorder.last_error().unwrap().code, "CAPTURE_UNAVAILABLE");
    }

    #[cfg(unix)]
    #[test]
    fn test_session_retimes_through_ffmpeg_first() {
        use crate::encoder::ffmpeg::testing::{calls, fake_ffmpeg};

        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), vec![NativeCodec::Mjpeg]);
        cfg.encoder.pipe = PipeEncoderSettings {
            enabled: true,
            ffmpeg_path: Some(fake_ffmpeg(dir.path(), 0, None)),
            ..PipeEncoderSettings::default()
        };

        let mut recorder = ScreenRecorder::new(cfg)
            .with_openers(synthetic(
                SolidColorOpener::new(32, 32, [9, 9, 9]).with_grab_delay(Duration::from_millis(60)),
            ))
            .with_encoder_chain(vec![Box::new(NativeEncoderFactory {
                codec: NativeCodec::Mjpeg,
                jpeg_quality: 80,
            })])
            .with_listener(None);

        assert!(recorder.start_recording());
        std::thread::sleep(Duration::from_millis(1500));
        assert!(recorder.stop_recording());

        let output = recorder.last_output().unwrap();
        assert!(output.retimed, "actual fps {}", output.actual_fps);
        assert!(output.verified);
        assert!(calls(dir.path()).contains("-r "), "{}", calls(dir.path()));
    }

    #[test]
    fn test_duration_tracks_session() {
        let dir = tempdir().unwrap();
        let mut recorder = ScreenRecorder::new(config(dir.path(), vec![NativeCodec::RawDib]))
            .with_openers(synthetic(SolidColorOpener::new(16, 16, [0, 0, 0])))
            .with_listener(None);
        assert_eq!(recorder.duration_ms(), 0.0);

        assert!(recorder.start_recording());
        std::thread::sleep(Duration::from_millis(300));
        assert!(recorder.duration_ms() >= 250.0);
        assert!(recorder.stop_recording());

        let output = recorder.last_output().unwrap().clone();
        assert!((recorder.duration_ms() - output.duration_secs * 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_status_events_are_broadcast() {
        let dir = tempdir().unwrap();
        let mut recorder = ScreenRecorder::new(config(dir.path(), vec![NativeCodec::Mjpeg]))
            .with_openers(synthetic(SolidColorOpener::new(16, 16, [0, 0, 0])))
            .with_listener(None);
        let mut rx = recorder.subscribe();

        assert!(recorder.start_recording());
        assert!(recorder.stop_recording());

        assert!(matches!(rx.try_recv(), Ok(RecordingEvent::Started(_))));
        let mut stopped = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RecordingEvent::Stopped(_)) {
                stopped = true;
            }
        }
        assert!(stopped);
    }
}
