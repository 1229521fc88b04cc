//! FFmpeg pipe encoder and helpers
//!
//! Raw `rgb24` frames are piped into an `ffmpeg` child that encodes
//! H.264/yuv420p into MP4. The same installation is used after a recording
//! to probe, decode-check, re-time and repair output files.

use super::types::{EncoderError, EncoderResult, EncoderTier, OpenRequest, PipeEncoderSettings};
use super::{EncoderBackend, EncoderFactory};
use crate::capture::frame::Frame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const STDERR_TAIL_LINES: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(25);
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

fn executable_name(tool: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.exe", tool)
    } else {
        tool.to_string()
    }
}

/// Candidate FFmpeg locations, in search order
///
/// `env` looks up environment variables; `exe_dir` is the directory of the
/// running executable.
pub fn candidate_paths_with(
    env: &dyn Fn(&str) -> Option<OsString>,
    exe_dir: Option<&Path>,
) -> Vec<PathBuf> {
    let exe = executable_name("ffmpeg");
    let mut candidates = Vec::new();

    // PATH
    if let Some(path) = env("PATH") {
        for dir in std::env::split_paths(&path) {
            candidates.push(dir.join(&exe));
        }
    }

    // Known install directories
    let known: &[&str] = if cfg!(target_os = "windows") {
        &["C:\\ffmpeg\\bin", "C:\\Program Files\\ffmpeg\\bin"]
    } else {
        &["/usr/bin", "/usr/local/bin", "/opt/homebrew/bin", "/opt/local/bin", "/snap/bin"]
    };
    for dir in known {
        candidates.push(Path::new(dir).join(&exe));
    }

    // Environment hints
    if let Some(value) = env("FFMPEG_PATH") {
        let path = PathBuf::from(value);
        candidates.push(path.join(&exe));
        candidates.push(path);
    }
    if let Some(value) = env("FFMPEG_BINARY") {
        candidates.push(PathBuf::from(value));
    }
    if let Some(value) = env("FFMPEG_HOME") {
        let home = PathBuf::from(value);
        candidates.push(home.join("bin").join(&exe));
        candidates.push(home.join(&exe));
    }
    if let Some(value) = env("ProgramFiles") {
        candidates.push(PathBuf::from(value).join("ffmpeg").join("bin").join(&exe));
    }
    if let Some(value) = env("LOCALAPPDATA") {
        let local = PathBuf::from(value);
        candidates.push(local.join("Programs").join("ffmpeg").join("bin").join(&exe));
        candidates.push(local.join("Microsoft").join("WinGet").join("Links").join(&exe));
    }
    if let Some(value) = env("ChocolateyInstall") {
        candidates.push(PathBuf::from(value).join("bin").join(&exe));
    }
    if let Some(value) = env("SCOOP") {
        candidates.push(PathBuf::from(value).join("shims").join(&exe));
    }

    // Bundled next to the executable
    if let Some(dir) = exe_dir {
        candidates.push(dir.join(&exe));
        candidates.push(dir.join("ffmpeg").join("bin").join(&exe));
    }

    let mut seen = std::collections::HashSet::new();
    candidates.retain(|p| seen.insert(p.clone()));
    candidates
}

/// Whether `path` is an FFmpeg that answers `-version`
pub fn is_working_ffmpeg(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }

    let mut command = Command::new(path);
    command.arg("-version");
    matches!(
        run_with_timeout(&mut command, VERSION_CHECK_TIMEOUT),
        Ok(output) if output.status.success()
    )
}

/// Locate a working FFmpeg
///
/// With an explicit path only that path is tried.
pub fn locate_ffmpeg(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if is_working_ffmpeg(path) {
            return Some(path.to_path_buf());
        }
        tracing::warn!("Configured FFmpeg {:?} is not usable", path);
        return None;
    }

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf));
    let env = |key: &str| std::env::var_os(key);

    candidate_paths_with(&env, exe_dir.as_deref())
        .into_iter()
        .find(|p| is_working_ffmpeg(p))
}

/// Run a command to completion, killing it after `timeout`
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> EncoderResult<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout_thread = child.stdout.take().map(|mut out| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_thread = child.stderr.take().map(|mut err| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    let status = wait_with_deadline(&mut child, timeout);

    let stdout = stdout_thread.and_then(|h| h.join().ok()).unwrap_or_default();
    let stderr = stderr_thread.and_then(|h| h.join().ok()).unwrap_or_default();

    match status? {
        Some(status) => Ok(Output { status, stdout, stderr }),
        None => Err(EncoderError::Timeout(format!(
            "{:?} did not exit within {:?}",
            command.get_program(),
            timeout
        ))),
    }
}

/// Poll for exit; kill and return `None` once the deadline passes
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Stream metadata reported by ffprobe
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub frame_count: u64,
    pub fps: f64,
}

impl VideoProbe {
    /// Duration implied by frame count and rate
    pub fn duration_secs(&self) -> f64 {
        if self.fps > 0.0 {
            self.frame_count as f64 / self.fps
        } else {
            0.0
        }
    }
}

/// Parse `width,height,r_frame_rate,nb_read_packets` CSV from ffprobe
pub fn parse_probe_output(stdout: &str) -> EncoderResult<VideoProbe> {
    let line = stdout.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let parts: Vec<&str> = line.trim().split(',').collect();

    if parts.len() < 4 {
        return Err(EncoderError::Ffmpeg(format!("Unexpected ffprobe output: {}", stdout)));
    }

    let width: u32 = parts[0]
        .parse()
        .map_err(|_| EncoderError::Ffmpeg("Invalid width".to_string()))?;
    let height: u32 = parts[1]
        .parse()
        .map_err(|_| EncoderError::Ffmpeg("Invalid height".to_string()))?;

    // Frame rate format: "30/1" or "30000/1001"
    let fps = match parts[2].split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(1.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => parts[2].parse().unwrap_or(0.0),
    };

    let frame_count: u64 = parts[3].parse().unwrap_or(0);

    Ok(VideoProbe {
        width,
        height,
        frame_count,
        fps,
    })
}

/// Encoder arguments for a given output extension
fn codec_args(extension: &str, preset: &str, crf: u8) -> Vec<String> {
    if extension.eq_ignore_ascii_case("avi") {
        ["-c:v", "mjpeg", "-q:v", "3", "-pix_fmt", "yuvj420p"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else {
        vec![
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            preset.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-crf".to_string(),
            crf.to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
        ]
    }
}

/// Sibling path `<stem>.<tag>.<ext>` for temporary outputs
fn temp_sibling(path: &Path, tag: &str) -> PathBuf {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
    path.with_extension(format!("{}.{}", tag, ext))
}

/// A located FFmpeg installation
#[derive(Debug, Clone)]
pub struct FfmpegTools {
    ffmpeg: PathBuf,
    ffprobe: Option<PathBuf>,
    timeout: Duration,
    has_libx264: bool,
}

impl FfmpegTools {
    /// Locate FFmpeg (and ffprobe next to it) per the pipe settings
    pub fn locate(settings: &PipeEncoderSettings, timeout: Duration) -> Option<Self> {
        let ffmpeg = locate_ffmpeg(settings.ffmpeg_path.as_deref())?;
        Some(Self::from_path(ffmpeg, timeout))
    }

    /// Wrap a known-good FFmpeg executable
    pub fn from_path(ffmpeg: PathBuf, timeout: Duration) -> Self {
        let ffprobe = ffmpeg
            .parent()
            .map(|dir| dir.join(executable_name("ffprobe")))
            .filter(|p| p.is_file());

        let mut command = Command::new(&ffmpeg);
        command.args(["-hide_banner", "-encoders"]);
        let has_libx264 = run_with_timeout(&mut command, VERSION_CHECK_TIMEOUT)
            .map(|out| String::from_utf8_lossy(&out.stdout).contains("libx264"))
            .unwrap_or(false);

        tracing::info!(
            "Using FFmpeg at {:?} (ffprobe: {:?}, libx264: {})",
            ffmpeg,
            ffprobe,
            has_libx264
        );

        Self {
            ffmpeg,
            ffprobe,
            timeout,
            has_libx264,
        }
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn has_libx264(&self) -> bool {
        self.has_libx264
    }

    /// Probe stream size, rate and packet count
    pub fn probe(&self, path: &Path) -> EncoderResult<VideoProbe> {
        let ffprobe = self
            .ffprobe
            .as_ref()
            .ok_or_else(|| {
                EncoderError::Unavailable("ffprobe not found next to ffmpeg".to_string())
            })?;

        let mut command = Command::new(ffprobe);
        command.args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-count_packets",
            "-show_entries",
            "stream=width,height,r_frame_rate,nb_read_packets",
            "-of",
            "csv=p=0",
        ]);
        command.arg(path);

        let output = run_with_timeout(&mut command, self.timeout)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EncoderError::Ffmpeg(format!("ffprobe failed: {}", stderr.trim())));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Decode the first and the last frame
    pub fn decode_check(&self, path: &Path) -> EncoderResult<()> {
        let passes: [&[&str]; 2] = [&[], &["-sseof", "-1"]];
        for seek in passes {
            let mut command = Command::new(&self.ffmpeg);
            command.args(["-hide_banner", "-v", "error"]);
            command.args(seek);
            command.arg("-i").arg(path);
            command.args(["-frames:v", "1", "-f", "null", "-"]);

            let output = run_with_timeout(&mut command, self.timeout)?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !output.status.success() || !stderr.trim().is_empty() {
                return Err(EncoderError::Verification(format!(
                    "decode check failed: {}",
                    stderr.trim()
                )));
            }
        }
        Ok(())
    }

    /// Re-time a video to `fps`, cut to `duration_secs`
    ///
    /// Writes a temporary sibling that replaces the original only when FFmpeg
    /// succeeds and the result is non-empty.
    pub fn retime(&self, path: &Path, fps: f64, duration_secs: f64) -> EncoderResult<()> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(EncoderError::InvalidFrame(format!("invalid frame rate {}", fps)));
        }

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
        let tmp = temp_sibling(path, "retime");

        let mut command = Command::new(&self.ffmpeg);
        command.args(["-y", "-hide_banner", "-v", "error", "-r"]);
        command.arg(format!("{:.3}", fps)).arg("-i");
        command.arg(path);
        command.arg("-t").arg(format!("{:.3}", duration_secs.max(0.001)));
        command.args(codec_args(ext, "veryfast", 23));
        command.arg(&tmp);

        self.replace_with(&mut command, &tmp, path)
    }

    /// Re-encode a damaged file in place
    pub fn reencode(&self, path: &Path) -> EncoderResult<()> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
        let tmp = temp_sibling(path, "repaired");

        let mut command = Command::new(&self.ffmpeg);
        command.args(["-y", "-hide_banner", "-v", "error", "-err_detect", "ignore_err", "-i"]);
        command.arg(path);
        command.args(codec_args(ext, "veryfast", 23));
        command.arg(&tmp);

        self.replace_with(&mut command, &tmp, path)
    }

    fn replace_with(&self, command: &mut Command, tmp: &Path, target: &Path) -> EncoderResult<()> {
        let result = run_with_timeout(command, self.timeout).and_then(|output| {
            if !output.status.success() {
                return Err(EncoderError::Ffmpeg(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ));
            }
            match std::fs::metadata(tmp) {
                Ok(meta) if meta.len() > 0 => Ok(()),
                _ => Err(EncoderError::Ffmpeg("FFmpeg produced no output".to_string())),
            }
        });

        if let Err(e) = result {
            let _ = std::fs::remove_file(tmp);
            return Err(e);
        }

        std::fs::rename(tmp, target)?;
        Ok(())
    }
}

/// Kills the FFmpeg child from another thread
#[derive(Clone)]
pub struct AbortHandle {
    child: Arc<Mutex<Child>>,
}

impl AbortHandle {
    /// Handle that kills `child`
    pub fn for_child(child: Arc<Mutex<Child>>) -> Self {
        Self { child }
    }

    pub fn abort(&self) {
        let mut child = self.child.lock();
        if let Ok(None) = child.try_wait() {
            tracing::warn!("Killing FFmpeg process {}", child.id());
            let _ = child.kill();
        }
    }
}

/// Factory for the pipe tier
pub struct PipeEncoderFactory {
    tools: FfmpegTools,
    preset: String,
    crf: u8,
}

impl PipeEncoderFactory {
    pub fn new(tools: FfmpegTools, settings: &PipeEncoderSettings) -> Self {
        Self {
            tools,
            preset: settings.preset.clone(),
            crf: settings.crf,
        }
    }
}

impl EncoderFactory for PipeEncoderFactory {
    fn tier(&self) -> EncoderTier {
        EncoderTier::PipeProcess
    }

    fn try_open(&self, request: &OpenRequest) -> EncoderResult<Box<dyn EncoderBackend>> {
        if !self.tools.has_libx264() {
            return Err(EncoderError::Unavailable("FFmpeg build lacks libx264".to_string()));
        }
        Ok(Box::new(PipeEncoder::spawn(&self.tools, request, &self.preset, self.crf)?))
    }
}

/// FFmpeg child fed raw frames over stdin
pub struct PipeEncoder {
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_thread: Option<JoinHandle<()>>,
    path: PathBuf,
    width: u32,
    height: u32,
    frames: u64,
    timeout: Duration,
}

impl PipeEncoder {
    pub fn spawn(
        tools: &FfmpegTools,
        request: &OpenRequest,
        preset: &str,
        crf: u8,
    ) -> EncoderResult<Self> {
        let path = request.path_with_extension("mp4");

        let mut command = Command::new(tools.ffmpeg());
        command
            .args(["-y", "-hide_banner", "-loglevel", "warning"])
            .args(["-f", "rawvideo", "-pixel_format", "rgb24"])
            .arg("-video_size")
            .arg(format!("{}x{}", request.width, request.height))
            .arg("-framerate")
            .arg(request.fps.to_string())
            .args(["-i", "-"])
            .args(codec_args("mp4", preset, crf))
            .arg(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| EncoderError::Unavailable(format!("Failed to start FFmpeg: {}", e)))?;

        let stdin = child.stdin.take();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_thread = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&stderr_tail);
            std::thread::spawn(move || drain_stderr(stderr, tail))
        });

        let mut encoder = Self {
            child: Arc::new(Mutex::new(child)),
            stdin,
            stderr_tail,
            stderr_thread,
            path,
            width: request.width,
            height: request.height,
            frames: 0,
            timeout: tools.timeout(),
        };

        if encoder.stdin.is_none() {
            encoder.kill_and_cleanup();
            return Err(EncoderError::Unavailable("FFmpeg stdin not captured".to_string()));
        }

        // Argument errors make FFmpeg exit right away
        std::thread::sleep(Duration::from_millis(50));
        let exited = encoder.child.lock().try_wait().ok().flatten();
        if let Some(status) = exited {
            let tail = encoder.stderr_text();
            encoder.kill_and_cleanup();
            return Err(EncoderError::Unavailable(format!(
                "FFmpeg exited with {}: {}",
                status, tail
            )));
        }

        tracing::info!(
            "Started FFmpeg encoder: {}x{} @ {}fps, output: {:?}",
            request.width,
            request.height,
            request.fps,
            encoder.path
        );
        Ok(encoder)
    }

    fn stderr_text(&self) -> String {
        self.stderr_tail.lock().iter().cloned().collect::<Vec<_>>().join(" | ")
    }

    fn kill_and_cleanup(&mut self) {
        self.stdin = None;
        {
            let mut child = self.child.lock();
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn drain_stderr(stderr: impl Read, tail: Arc<Mutex<VecDeque<String>>>) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(content) => {
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    continue;
                }
                tracing::debug!("ffmpeg: {}", trimmed);
                let mut tail = tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(trimmed.to_string());
            }
            Err(e) => {
                tracing::warn!("Failed to read FFmpeg stderr: {}", e);
                break;
            }
        }
    }
}

impl EncoderBackend for PipeEncoder {
    fn tier(&self) -> EncoderTier {
        EncoderTier::PipeProcess
    }

    fn output_path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, frame: &Frame) -> EncoderResult<()> {
        if frame.width != self.width || frame.height != self.height || !frame.is_well_formed() {
            return Err(EncoderError::InvalidFrame(format!(
                "frame {} is {}x{}, expected {}x{}",
                frame.seq, frame.width, frame.height, self.width, self.height
            )));
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EncoderError::Ffmpeg("FFmpeg stdin closed".to_string()))?;

        if let Err(e) = stdin.write_all(&frame.data) {
            return Err(EncoderError::Ffmpeg(format!(
                "Failed to write frame: {} ({})",
                e,
                self.stderr_text()
            )));
        }
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
        Some(AbortHandle::for_child(Arc::clone(&self.child)))
    }

    fn finalize(mut self: Box<Self>) -> EncoderResult<PathBuf> {
        // Close stdin to signal EOF to FFmpeg
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.flush();
        }

        let status = {
            let deadline = Instant::now() + self.timeout;
            loop {
                let polled = self.child.lock().try_wait()?;
                if let Some(status) = polled {
                    break Some(status);
                }
                if Instant::now() >= deadline {
                    AbortHandle::for_child(Arc::clone(&self.child)).abort();
                    let _ = self.child.lock().wait();
                    break None;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        };

        if let Some(handle) = self.stderr_thread.take() {
            if handle.join().is_err() {
                tracing::warn!("FFmpeg stderr thread panicked");
            }
        }

        match status {
            None => Err(EncoderError::Timeout(format!(
                "FFmpeg did not finish within {:?}",
                self.timeout
            ))),
            Some(status) if !status.success() => {
                tracing::warn!("FFmpeg exited with status {}: {}", status, self.stderr_text());
                if self.path.exists() {
                    // Partial output is still handed to verification/repair
                    Ok(self.path.clone())
                } else {
                    Err(EncoderError::Ffmpeg(format!(
                        "FFmpeg exited with {}: {}",
                        status,
                        self.stderr_text()
                    )))
                }
            }
            Some(_) => {
                tracing::info!("FFmpeg encoder finished: {} frames written", self.frames);
                Ok(self.path.clone())
            }
        }
    }
}

impl Drop for PipeEncoder {
    fn drop(&mut self) {
        // Only reached with a live child when the encoder is dropped unfinalized
        if self.stdin.is_some() {
            self.stdin = None;
            let mut child = self.child.lock();
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

/// Shell stand-in for FFmpeg used by tests on Unix
#[cfg(all(test, unix))]
pub(crate) mod testing {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Write `dir/ffmpeg`
    ///
    /// The script answers `-version` and `-encoders`, appends every argument
    /// list to `dir/ffmpeg_calls.log`, and otherwise copies its `-i` input (or
    /// `replacement`, when given) to the last argument. A non-zero
    /// `exit_code` makes every transcoding call fail.
    pub fn fake_ffmpeg(dir: &Path, exit_code: i32, replacement: Option<&Path>) -> PathBuf {
        let source = match replacement {
            Some(path) => format!("\"{}\"", path.display()),
            None => "\"$input\"".to_string(),
        };
        let script = format!(
            r#"#!/bin/sh
echo "$@" >> "{log}"
if [ "$1" = "-version" ]; then echo "ffmpeg version 6.0-test"; exit 0; fi
if [ "$2" = "-encoders" ]; then echo " V..... libx264 H.264"; exit 0; fi
input=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-i" ]; then input="$arg"; fi
  prev="$arg"
done
if [ {code} -ne 0 ]; then echo "transcode failed" >&2; exit {code}; fi
if [ "$prev" != "-" ]; then cp {source} "$prev"; fi
exit 0
"#,
            log = calls_log(dir).display(),
            code = exit_code,
            source = source,
        );

        let path = dir.join("ffmpeg");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn calls_log(dir: &Path) -> PathBuf {
        dir.join("ffmpeg_calls.log")
    }

    /// Argument lists the script was called with, one per line
    pub fn calls(dir: &Path) -> String {
        std::fs::read_to_string(calls_log(dir)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_order() {
        let env = |key: &str| match key {
            "PATH" => Some(OsString::from(if cfg!(windows) { "C:\\tools" } else { "/opt/tools" })),
            "FFMPEG_HOME" => Some(OsString::from("/custom/ffmpeg")),
            _ => None,
        };
        let candidates = candidate_paths_with(&env, Some(Path::new("/app")));
        let exe = executable_name("ffmpeg");

        let path_pos = candidates
            .iter()
            .position(|p| p.parent().map(|d| d.ends_with("tools")).unwrap_or(false))
            .unwrap();
        let home_pos = candidates
            .iter()
            .position(|p| *p == Path::new("/custom/ffmpeg").join("bin").join(&exe))
            .unwrap();
        let adjacent_pos = candidates
            .iter()
            .position(|p| *p == Path::new("/app").join(&exe))
            .unwrap();

        assert!(path_pos < home_pos);
        assert!(home_pos < adjacent_pos);
    }

    #[test]
    fn test_explicit_missing_path_is_not_searched_further() {
        assert!(locate_ffmpeg(Some(Path::new("/definitely/not/here/ffmpeg"))).is_none());
    }

    #[test]
    fn test_parse_probe_output() {
        let probe = parse_probe_output("1920,1080,30000/1001,300\n").unwrap();
        assert_eq!((probe.width, probe.height), (1920, 1080));
        assert_eq!(probe.frame_count, 300);
        assert!((probe.fps - 29.97).abs() < 0.01);
        assert!((probe.duration_secs() - 10.01).abs() < 0.01);

        assert!(parse_probe_output("garbage").is_err());
    }

    #[test]
    fn test_temp_sibling_keeps_extension() {
        assert_eq!(
            temp_sibling(Path::new("/x/recording_1.mp4"), "retime"),
            PathBuf::from("/x/recording_1.retime.mp4")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_retime_and_repair_with_script() {
        let dir = tempfile::tempdir().unwrap();
        let fake = testing::fake_ffmpeg(dir.path(), 0, None);

        // PATH is searched before the well-known install directories
        let env = |key: &str| match key {
            "PATH" => Some(dir.path().as_os_str().to_os_string()),
            _ => None,
        };
        let found = candidate_paths_with(&env, None)
            .into_iter()
            .find(|p| is_working_ffmpeg(p))
            .unwrap();
        assert_eq!(found, fake);
        assert_eq!(locate_ffmpeg(Some(&fake)), Some(fake.clone()));

        let tools = FfmpegTools::from_path(fake, Duration::from_secs(10));
        assert!(tools.has_libx264());

        let video = dir.path().join("recording_script.mp4");
        std::fs::write(&video, b"video bytes").unwrap();

        tools.retime(&video, 12.5, 2.0).unwrap();
        tools.reencode(&video).unwrap();
        assert_eq!(std::fs::read(&video).unwrap(), b"video bytes");
        assert!(!dir.path().join("recording_script.retime.mp4").exists());
        assert!(!dir.path().join("recording_script.repaired.mp4").exists());

        let calls = testing::calls(dir.path());
        assert!(calls.contains("-r 12.500 -i"), "{}", calls);
        assert!(calls.contains("-t 2.000"), "{}", calls);
        assert!(calls.contains("-err_detect ignore_err"), "{}", calls);
        assert!(calls.contains("libx264"), "{}", calls);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_transcode_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let fake = testing::fake_ffmpeg(dir.path(), 1, None);
        let tools = FfmpegTools::from_path(fake, Duration::from_secs(10));

        let video = dir.path().join("recording_keep.mp4");
        std::fs::write(&video, b"original").unwrap();

        let err = tools.retime(&video, 20.0, 1.0).unwrap_err();
        assert!(err.to_string().contains("transcode failed"), "{}", err);
        assert!(tools.reencode(&video).is_err());

        assert_eq!(std::fs::read(&video).unwrap(), b"original");
        assert!(!dir.path().join("recording_keep.retime.mp4").exists());
        assert!(!dir.path().join("recording_keep.repaired.mp4").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_kills_hung_process() {
        let mut command = Command::new("sleep");
        command.arg("5");

        let started = Instant::now();
        let result = run_with_timeout(&mut command, Duration::from_millis(200));
        assert!(matches!(result, Err(EncoderError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_pipe_encoder_when_ffmpeg_present() {
        let Some(ffmpeg) = locate_ffmpeg(None) else {
            eprintln!("FFmpeg not found; skipping");
            return;
        };
        let tools = FfmpegTools::from_path(ffmpeg, Duration::from_secs(60));
        if !tools.has_libx264() {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let request = OpenRequest {
            stem: dir.path().join("recording_pipe"),
            width: 64,
            height: 48,
            fps: 30,
        };
        let mut encoder: Box<dyn EncoderBackend> =
            Box::new(PipeEncoder::spawn(&tools, &request, "veryfast", 23).unwrap());
        for seq in 0..30 {
            encoder.write(&Frame::solid(seq, 64, 48, [255, 0, 0])).unwrap();
        }
        let path = encoder.finalize().unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);

        if let Ok(probe) = tools.probe(&path) {
            assert_eq!(probe.frame_count, 30);
        }
        tools.decode_check(&path).unwrap();
    }
}
