//! screentrace - CLI entry point

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use screentrace::capture::{CaptureBackend, SolidColorOpener, SourceOpener};
use screentrace::encoder::FfmpegTools;
use screentrace::recorder::{inspect, Container};
use screentrace::{RecordingConfig, ScreenRecorder};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "screentrace")]
#[command(about = "Record the screen together with a keyboard/mouse event log")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the screen and input events
    Record {
        /// Stop after N seconds (default: wait for Enter)
        #[arg(long)]
        seconds: Option<f64>,

        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output directory
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Target frame rate (15-60)
        #[arg(long)]
        fps: Option<u32>,

        /// Resolution scale (0.25-1.0)
        #[arg(long)]
        scale: Option<f64>,

        /// Explicit FFmpeg executable
        #[arg(long)]
        ffmpeg: Option<PathBuf>,

        /// Skip the FFmpeg pipe encoder
        #[arg(long)]
        no_ffmpeg: bool,

        /// Record solid colour frames instead of the screen
        #[arg(long)]
        synthetic: bool,
    },

    /// Check a recorded video or image-sequence directory
    Verify {
        /// Video file or `_frames` directory
        path: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List capturable displays
    Displays,
}

fn main() -> Result<()> {
    screentrace::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Record {
            seconds,
            config,
            output,
            fps,
            scale,
            ffmpeg,
            no_ffmpeg,
            synthetic,
        } => {
            let mut cfg = match config {
                Some(path) => RecordingConfig::from_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => RecordingConfig::default(),
            };
            if let Some(output) = output {
                cfg.output_dir = output;
            }
            if let Some(fps) = fps {
                cfg.fps = fps;
            }
            if let Some(scale) = scale {
                cfg.scale = scale;
            }
            if let Some(ffmpeg) = ffmpeg {
                cfg.encoder.pipe.ffmpeg_path = Some(ffmpeg);
            }
            if no_ffmpeg {
                cfg.encoder.pipe.enabled = false;
            }
            if synthetic {
                cfg.capture_backend = CaptureBackend::Synthetic;
            }
            record(cfg, seconds, synthetic)
        }
        Commands::Verify { path, json } => verify(path, json),
        Commands::Displays => {
            let displays = screentrace::capture::get_displays();
            if displays.is_empty() {
                println!("No displays reported by the native capture backend");
            }
            for display in displays {
                println!(
                    "{}: {} {}x{}{}",
                    display.id,
                    display.name,
                    display.width,
                    display.height,
                    if display.is_primary { " (primary)" } else { "" }
                );
            }
            Ok(())
        }
    }
}

fn record(config: RecordingConfig, seconds: Option<f64>, synthetic: bool) -> Result<()> {
    let mut recorder = ScreenRecorder::new(config);
    if synthetic {
        // Headless runs: no input hooks, small frames
        let opener: Arc<dyn SourceOpener> =
            Arc::new(SolidColorOpener::new(640, 360, [32, 96, 160]));
        recorder = recorder.with_openers(vec![opener]).with_listener(None);
    }

    if let Err(e) = recorder.start() {
        bail!("Could not start recording: {}", e);
    }
    println!("Recording to {}", recorder.output_dir().display());

    match seconds {
        Some(secs) if secs.is_finite() && secs > 0.0 => {
            std::thread::sleep(Duration::from_secs_f64(secs))
        }
        _ => {
            println!("Press Enter to stop");
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
        }
    }

    println!("Stopping after {:.1}s", recorder.duration_ms() / 1000.0);
    let output = recorder.stop().context("Failed to stop recording")?;
    println!("Video:   {} ({})", output.video_path.display(), output.encoder.tier);
    println!("Events:  {} ({} events)", output.events_path.display(), output.events_logged);
    println!(
        "Frames:  {} written, {} dropped, {:.2} fps over {:.2}s{}",
        output.encoder.frames_written,
        output.frames_dropped,
        output.actual_fps,
        output.duration_secs,
        if output.retimed { " (re-timed)" } else { "" }
    );
    if let Some(error) = recorder.last_error() {
        println!("Warning: {} ({})", error.message, error.code);
    }
    if !output.verified {
        println!("Warning: output failed verification");
    }
    Ok(())
}

fn verify(path: PathBuf, json: bool) -> Result<()> {
    let tools = FfmpegTools::locate(&Default::default(), Duration::from_secs(60));
    let report = inspect(&path, tools.as_ref());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let magic = match report.container {
            Container::Avi => "RIFF/AVI",
            Container::Mp4 => "ftyp (MP4)",
            Container::ImageSequence => "PNG sequence",
            Container::Unknown => "unknown",
        };
        println!("Path:        {}", report.path.display());
        println!("Header:      {}", magic);
        println!("Size:        {} bytes", report.size_bytes);
        println!("Resolution:  {}x{}", report.width, report.height);
        println!("Frames:      {}", report.frame_count);
        println!("FPS:         {:.3}", report.fps);
        println!("Duration:    {:.3}s", report.duration_secs);
        println!("First frame: {}", if report.first_frame_ok { "ok" } else { "unreadable" });
        println!("Last frame:  {}", if report.last_frame_ok { "ok" } else { "unreadable" });
        for problem in &report.problems {
            println!("Problem:     {}", problem);
        }
    }

    if !report.is_ok() {
        bail!("{} failed verification", path.display());
    }
    Ok(())
}
