//! Output verification and repair

use crate::encoder::image_sequence::{self, SequenceManifest};
use crate::encoder::{avi, mp4, FfmpegTools};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Container detected from the file header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Avi,
    Mp4,
    ImageSequence,
    Unknown,
}

/// Result of inspecting a recording
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub path: PathBuf,
    pub container: Container,
    pub size_bytes: u64,
    pub frame_count: u64,
    pub fps: f64,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub first_frame_ok: bool,
    pub last_frame_ok: bool,
    pub problems: Vec<String>,
}

impl VerifyReport {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            container: Container::Unknown,
            size_bytes: 0,
            frame_count: 0,
            fps: 0.0,
            duration_secs: 0.0,
            width: 0,
            height: 0,
            first_frame_ok: false,
            last_frame_ok: false,
            problems: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Detect the container from the leading bytes
pub fn sniff_container(header: &[u8]) -> Container {
    if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"AVI " {
        Container::Avi
    } else if header.len() >= 8 && &header[4..8] == b"ftyp" {
        Container::Mp4
    } else {
        Container::Unknown
    }
}

/// Check existence, size, header magic, frame count and first/last frames
pub fn inspect(path: &Path, tools: Option<&FfmpegTools>) -> VerifyReport {
    let mut report = VerifyReport::new(path);

    if !path.exists() {
        report.problems.push("output does not exist".to_string());
        return report;
    }

    if path.is_dir() {
        inspect_sequence(path, &mut report);
    } else {
        inspect_file(path, tools, &mut report);
    }

    if report.frame_count == 0 && report.problems.is_empty() {
        report.problems.push("no frames".to_string());
    }
    report
}

fn inspect_sequence(dir: &Path, report: &mut VerifyReport) {
    report.container = Container::ImageSequence;

    let manifest = match SequenceManifest::load(dir) {
        Ok(manifest) => manifest,
        Err(e) => {
            report.problems.push(format!("manifest unreadable: {}", e));
            return;
        }
    };

    report.frame_count = manifest.frame_count;
    report.fps = manifest.fps;
    report.duration_secs = manifest.duration_secs();
    report.width = manifest.width;
    report.height = manifest.height;
    report.size_bytes = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0);

    if manifest.frame_count == 0 {
        return;
    }

    let check = |number: u64| -> bool {
        let path = dir.join(image_sequence::frame_file_name(number));
        matches!(
            image_sequence::read_png_dimensions(&path),
            Ok(dims) if dims == (manifest.width, manifest.height)
        )
    };
    report.first_frame_ok = check(1);
    report.last_frame_ok = check(manifest.frame_count);
    frame_problems(report);
}

fn inspect_file(path: &Path, tools: Option<&FfmpegTools>, report: &mut VerifyReport) {
    report.size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if report.size_bytes == 0 {
        report.problems.push("output is empty".to_string());
        return;
    }

    let mut header = [0u8; 12];
    let read = std::fs::File::open(path).and_then(|mut f| f.read(&mut header));
    report.container = match read {
        Ok(n) => sniff_container(&header[..n]),
        Err(e) => {
            report.problems.push(format!("unreadable: {}", e));
            return;
        }
    };

    match report.container {
        Container::Avi => match avi::AviReader::open(path) {
            Ok(reader) => {
                report.frame_count = reader.frame_count();
                report.fps = reader.fps();
                report.duration_secs = reader.duration_secs();
                (report.width, report.height) = reader.dimensions();
                if reader.frame_count() > 0 {
                    report.first_frame_ok = reader.decode_frame(0).is_ok();
                    let last = reader.frame_count() as usize - 1;
                    report.last_frame_ok = reader.decode_frame(last).is_ok();
                }
                frame_problems(report);
            }
            Err(e) => report.problems.push(format!("AVI structure invalid: {}", e)),
        },
        Container::Mp4 => {
            match mp4::summarize(path) {
                Ok(summary) => {
                    report.frame_count = summary.sample_count as u64;
                    report.fps = summary.fps();
                    report.duration_secs = summary.duration_secs;
                    report.width = summary.width;
                    report.height = summary.height;
                    report.first_frame_ok = summary.first_sample_len > 0;
                    report.last_frame_ok = summary.last_sample_len > 0;
                }
                Err(e) => match tools.map(|t| t.probe(path)) {
                    Some(Ok(probe)) => {
                        report.frame_count = probe.frame_count;
                        report.fps = probe.fps;
                        report.duration_secs = probe.duration_secs();
                        report.width = probe.width;
                        report.height = probe.height;
                        report.first_frame_ok = true;
                        report.last_frame_ok = true;
                    }
                    _ => {
                        report.problems.push(format!("MP4 structure invalid: {}", e));
                        return;
                    }
                },
            }

            // A full decode is only possible with FFmpeg
            if let Some(tools) = tools {
                if let Err(e) = tools.decode_check(path) {
                    report.first_frame_ok = false;
                    report.problems.push(e.to_string());
                }
            }
            frame_problems(report);
        }
        Container::ImageSequence | Container::Unknown => {
            report.problems.push("unrecognized header".to_string());
        }
    }
}

fn frame_problems(report: &mut VerifyReport) {
    if report.frame_count == 0 {
        return;
    }
    if !report.first_frame_ok {
        report.problems.push("first frame unreadable".to_string());
    }
    if !report.last_frame_ok {
        report.problems.push("last frame unreadable".to_string());
    }
}

/// Verify `path`, re-encoding it with FFmpeg when the check fails
///
/// The unrepaired file is kept if repair is impossible or fails.
pub fn verify_and_repair(path: &Path, tools: Option<&FfmpegTools>) -> VerifyReport {
    let report = inspect(path, tools);
    if report.is_ok() {
        tracing::info!(
            "Verified {:?}: {:?}, {} frames, {:.2}s",
            path,
            report.container,
            report.frame_count,
            report.duration_secs
        );
        return report;
    }

    tracing::warn!("Output verification failed for {:?}: {}", path, report.problems.join("; "));

    let tools = match tools {
        Some(tools) if path.is_file() => tools,
        _ => return report,
    };

    match tools.reencode(path) {
        Ok(()) => {
            let repaired = inspect(path, Some(tools));
            if repaired.is_ok() {
                tracing::info!("Repaired {:?} by re-encoding", path);
            } else {
                tracing::warn!("Repair did not fix {:?}: {}", path, repaired.problems.join("; "));
            }
            repaired
        }
        Err(e) => {
            tracing::warn!("Repair failed; keeping original {:?}: {}", path, e);
            report
        }
    }
}
