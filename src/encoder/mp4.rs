//! H.264 MP4 writer
//!
//! Frames are encoded intra-only with `less-avc` and muxed with `mp4`. Each
//! sample lasts one tick of a track timescale equal to the frame rate.

use super::types::{EncoderError, EncoderResult, EncoderTier, NativeCodec, OpenRequest};
use super::EncoderBackend;
use crate::capture::frame::Frame;
use ::mp4::{
    AvcConfig, Bytes, FourCC, MediaConfig, Mp4Config, Mp4Reader, Mp4Sample, Mp4Writer, TrackConfig,
    TrackType,
};
use less_avc::ycbcr_image::{DataPlane, Planes, YCbCrImage};
use less_avc::{BitDepth, H264Writer};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TRACK_ID: u32 = 1;
const MOVIE_TIMESCALE: u32 = 1000;

/// `Write` sink shared with the H.264 encoder so output can be taken per frame
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Split an Annex-B byte stream into NAL units (start codes removed)
pub fn split_annex_b(stream: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= stream.len() {
        if stream[i] == 0 && stream[i + 1] == 0 && stream[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &(_, payload_start)) in starts.iter().enumerate() {
        let mut end = starts.get(n + 1).map(|&(code, _)| code).unwrap_or(stream.len());
        // A 4-byte start code leaves a zero byte at the end of the previous unit
        while end > payload_start && stream[end - 1] == 0 && n + 1 < starts.len() {
            end -= 1;
        }
        if end > payload_start {
            units.push(&stream[payload_start..end]);
        }
    }
    units
}

/// 4:2:0 planes padded to whole macroblocks
struct Yuv420 {
    y: Vec<u8>,
    cb: Vec<u8>,
    cr: Vec<u8>,
    luma_stride: usize,
    chroma_stride: usize,
}

fn round_up_16(v: u32) -> usize {
    (v as usize).div_ceil(16) * 16
}

/// Convert packed RGB to 8-bit 4:2:0 planes
///
/// Uses the JFIF full-range coefficients; chroma is the mean of each 2x2 block.
/// Planes are padded to a multiple of 16 in both directions by repeating the
/// last column and row; the encoder crops the padding in the SPS.
fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Yuv420 {
    let (w, h) = (width as usize, height as usize);
    let (pw, ph) = (round_up_16(width), round_up_16(height));
    let (cw, ch) = (pw / 2, ph / 2);

    let pixel = |row: usize, col: usize| -> (f32, f32, f32) {
        let i = (row.min(h - 1) * w + col.min(w - 1)) * 3;
        (rgb[i] as f32, rgb[i + 1] as f32, rgb[i + 2] as f32)
    };

    let mut y = Vec::with_capacity(pw * ph);
    for row in 0..ph {
        for col in 0..pw {
            let (r, g, b) = pixel(row, col);
            y.push((0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8);
        }
    }

    let mut cb = Vec::with_capacity(cw * ch);
    let mut cr = Vec::with_capacity(cw * ch);
    for row in 0..ch {
        for col in 0..cw {
            let (mut u, mut v) = (0f32, 0f32);
            for (dr, dc) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let (r, g, b) = pixel(row * 2 + dr, col * 2 + dc);
                u += -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
                v += 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
            }
            cb.push((u / 4.0).round().clamp(0.0, 255.0) as u8);
            cr.push((v / 4.0).round().clamp(0.0, 255.0) as u8);
        }
    }

    Yuv420 {
        y,
        cb,
        cr,
        luma_stride: pw,
        chroma_stride: cw,
    }
}

/// Encode one RGB frame into Annex-B bytes
fn encode_frame(encoder: &mut H264Writer<SharedBuffer>, frame: &Frame) -> EncoderResult<()> {
    let planes = rgb_to_yuv420(&frame.data, frame.width, frame.height);

    let image = YCbCrImage {
        planes: Planes::YCbCr((
            DataPlane {
                data: &planes.y,
                stride: planes.luma_stride,
                bit_depth: BitDepth::Depth8,
            },
            DataPlane {
                data: &planes.cb,
                stride: planes.chroma_stride,
                bit_depth: BitDepth::Depth8,
            },
            DataPlane {
                data: &planes.cr,
                stride: planes.chroma_stride,
                bit_depth: BitDepth::Depth8,
            },
        )),
        width: frame.width,
        height: frame.height,
    };

    encoder
        .write(&image)
        .map_err(|e| EncoderError::Codec(format!("H.264 encode failed: {:?}", e)))
}

/// Annex-B NALs to one AVCC sample, pulling out parameter sets
fn to_avcc_sample(stream: &[u8], sps: &mut Option<Vec<u8>>, pps: &mut Option<Vec<u8>>) -> Vec<u8> {
    let mut sample = Vec::with_capacity(stream.len() + 16);
    for nal in split_annex_b(stream) {
        match nal[0] & 0x1f {
            7 => *sps = Some(nal.to_vec()),
            8 => *pps = Some(nal.to_vec()),
            _ => {
                sample.extend_from_slice(&(nal.len() as u32).to_be_bytes());
                sample.extend_from_slice(nal);
            }
        }
    }
    sample
}

fn mp4_config() -> EncoderResult<Mp4Config> {
    let brand = |s: &str| s.parse::<FourCC>().map_err(EncoderError::from);
    Ok(Mp4Config {
        major_brand: brand("isom")?,
        minor_version: 512,
        compatible_brands: vec![brand("isom")?, brand("iso2")?, brand("avc1")?, brand("mp41")?],
        timescale: MOVIE_TIMESCALE,
    })
}

fn track_config(
    width: u32,
    height: u32,
    timescale: u32,
    sps: Vec<u8>,
    pps: Vec<u8>,
) -> TrackConfig {
    TrackConfig {
        track_type: TrackType::Video,
        timescale,
        language: "und".to_string(),
        media_conf: MediaConfig::AvcConfig(AvcConfig {
            width: width as u16,
            height: height as u16,
            seq_param_set: sps,
            pic_param_set: pps,
        }),
    }
}

/// Intra-only H.264 in MP4
pub struct H264Mp4Writer {
    encoder: H264Writer<SharedBuffer>,
    buffer: SharedBuffer,
    muxer: Mp4Writer<BufWriter<File>>,
    path: PathBuf,
    width: u32,
    height: u32,
    fps: u32,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    track_added: bool,
    frames: u64,
    bytes: u64,
}

impl H264Mp4Writer {
    /// Create the file and run the codec self-test
    pub fn create(request: &OpenRequest) -> EncoderResult<Self> {
        if request.width % 2 != 0
            || request.height % 2 != 0
            || request.width == 0
            || request.height == 0
        {
            return Err(EncoderError::InvalidFrame(format!(
                "H.264 needs even dimensions, got {}x{}",
                request.width, request.height
            )));
        }
        if request.width > u16::MAX as u32 || request.height > u16::MAX as u32 || request.fps == 0 {
            return Err(EncoderError::InvalidFrame("unsupported geometry for MP4".to_string()));
        }

        // Self-test on a throwaway encoder
        {
            let probe = SharedBuffer::default();
            let mut test_encoder = H264Writer::new(probe.clone())
                .map_err(|e| EncoderError::Codec(format!("H.264 init failed: {:?}", e)))?;
            let blank = Frame::solid(0, request.width, request.height, [0, 0, 0]);
            encode_frame(&mut test_encoder, &blank)?;
            let (mut sps, mut pps) = (None, None);
            let sample = to_avcc_sample(&probe.take(), &mut sps, &mut pps);
            if sample.is_empty() || sps.is_none() || pps.is_none() {
                return Err(EncoderError::Codec("H.264 self-test produced no picture".to_string()));
            }
        }

        let buffer = SharedBuffer::default();
        let encoder = H264Writer::new(buffer.clone())
            .map_err(|e| EncoderError::Codec(format!("H.264 init failed: {:?}", e)))?;

        let path = request.path_with_extension(NativeCodec::H264.extension());
        let file = File::create(&path)?;
        let muxer = match Mp4Writer::write_start(BufWriter::new(file), &mp4_config()?) {
            Ok(muxer) => muxer,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }
        };

        tracing::debug!("MP4 writer open: {:?}", path);

        Ok(Self {
            encoder,
            buffer,
            muxer,
            path,
            width: request.width,
            height: request.height,
            fps: request.fps,
            sps: None,
            pps: None,
            track_added: false,
            frames: 0,
            bytes: 0,
        })
    }
}

impl EncoderBackend for H264Mp4Writer {
    fn tier(&self) -> EncoderTier {
        EncoderTier::NativeCodec(NativeCodec::H264)
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

        encode_frame(&mut self.encoder, frame)?;
        let sample = to_avcc_sample(&self.buffer.take(), &mut self.sps, &mut self.pps);
        if sample.is_empty() {
            return Err(EncoderError::Codec(format!("frame {} produced no slice data", frame.seq)));
        }

        if !self.track_added {
            let (Some(sps), Some(pps)) = (self.sps.clone(), self.pps.clone()) else {
                return Err(EncoderError::Codec("missing SPS/PPS before first picture".to_string()));
            };
            self.muxer
                .add_track(&track_config(self.width, self.height, self.fps, sps, pps))?;
            self.track_added = true;
        }

        self.bytes += sample.len() as u64;
        self.muxer.write_sample(
            TRACK_ID,
            &Mp4Sample {
                start_time: self.frames,
                duration: 1,
                rendering_offset: 0,
                is_sync: true,
                bytes: Bytes::from(sample),
            },
        )?;
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
        let mut this = *self;
        this.muxer.write_end()?;
        let mut writer = this.muxer.into_writer();
        writer.flush()?;
        writer.get_ref().sync_all()?;

        tracing::info!("MP4 finalized: {} frames, {:?}", this.frames, this.path);
        Ok(this.path)
    }
}

/// Summary of an MP4 read back from disk
#[derive(Debug, Clone)]
pub struct Mp4Summary {
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
    pub timescale: u32,
    pub duration_secs: f64,
    pub first_sample_len: usize,
    pub last_sample_len: usize,
}

impl Mp4Summary {
    pub fn fps(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.sample_count as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

fn open_reader(path: &Path) -> EncoderResult<Mp4Reader<BufReader<File>>> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    Ok(Mp4Reader::read_header(BufReader::new(file), size)?)
}

fn video_track_id(reader: &Mp4Reader<BufReader<File>>) -> EncoderResult<u32> {
    reader
        .tracks()
        .iter()
        .find(|(_, track)| matches!(track.track_type(), Ok(TrackType::Video)))
        .map(|(id, _)| *id)
        .ok_or_else(|| EncoderError::Verification("MP4 has no video track".to_string()))
}

/// Read sample count, timing and first/last sample sizes
pub fn summarize(path: &Path) -> EncoderResult<Mp4Summary> {
    let mut reader = open_reader(path)?;
    let track_id = video_track_id(&reader)?;

    let (width, height, timescale, duration_secs) = {
        let track = reader
            .tracks()
            .get(&track_id)
            .ok_or_else(|| EncoderError::Verification("MP4 track vanished".to_string()))?;
        (
            track.width() as u32,
            track.height() as u32,
            track.timescale(),
            track.duration().as_secs_f64(),
        )
    };

    let sample_count = reader.sample_count(track_id)?;
    let read_len = |reader: &mut Mp4Reader<BufReader<File>>, id: u32| -> EncoderResult<usize> {
        match reader.read_sample(track_id, id)? {
            Some(sample) => Ok(sample.bytes.len()),
            None => Err(EncoderError::Verification(format!("MP4 sample {} unreadable", id))),
        }
    };

    let (first_sample_len, last_sample_len) = if sample_count > 0 {
        (read_len(&mut reader, 1)?, read_len(&mut reader, sample_count)?)
    } else {
        (0, 0)
    };

    Ok(Mp4Summary {
        width,
        height,
        sample_count,
        timescale,
        duration_secs,
        first_sample_len,
        last_sample_len,
    })
}

/// Re-mux an MP4 so its samples play at `fps`
///
/// Samples are copied unchanged into a temporary file with a track
/// timescale of `fps * 1000`; the original is replaced only on success.
pub fn retime(path: &Path, fps: f64) -> EncoderResult<()> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(EncoderError::InvalidFrame(format!("invalid frame rate {}", fps)));
    }

    let tmp = path.with_extension("retime.mp4");
    let result = remux(path, &tmp, fps);
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn remux(src: &Path, dst: &Path, fps: f64) -> EncoderResult<()> {
    let mut reader = open_reader(src)?;
    let track_id = video_track_id(&reader)?;

    let (width, height, sps, pps) = {
        let track = reader
            .tracks()
            .get(&track_id)
            .ok_or_else(|| EncoderError::Verification("MP4 track vanished".to_string()))?;
        (
            track.width() as u32,
            track.height() as u32,
            track.sequence_parameter_set()?.to_vec(),
            track.picture_parameter_set()?.to_vec(),
        )
    };

    let timescale = (fps * 1000.0).round().max(1.0) as u32;
    let file = File::create(dst)?;
    let mut muxer = Mp4Writer::write_start(BufWriter::new(file), &mp4_config()?)?;
    muxer.add_track(&track_config(width, height, timescale, sps, pps))?;

    let count = reader.sample_count(track_id)?;
    for id in 1..=count {
        let Some(sample) = reader.read_sample(track_id, id)? else {
            return Err(EncoderError::Verification(format!("MP4 sample {} unreadable", id)));
        };
        muxer.write_sample(
            TRACK_ID,
            &Mp4Sample {
                start_time: (id as u64 - 1) * 1000,
                duration: 1000,
                rendering_offset: 0,
                is_sync: sample.is_sync,
                bytes: sample.bytes,
            },
        )?;
    }

    muxer.write_end()?;
    let mut writer = muxer.into_writer();
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_split_annex_b() {
        let stream = [0, 0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3, 0, 0, 0, 1, 0x65, 4, 5];
        let units = split_annex_b(&stream);
        assert_eq!(units, vec![&[0x67, 1, 2][..], &[0x68, 3][..], &[0x65, 4, 5][..]]);
    }

    #[test]
    fn test_parameter_sets_extracted() {
        let stream = [0, 0, 0, 1, 0x67, 1, 0, 0, 0, 1, 0x68, 2, 0, 0, 0, 1, 0x65, 9, 9];
        let (mut sps, mut pps) = (None, None);
        let sample = to_avcc_sample(&stream, &mut sps, &mut pps);
        assert_eq!(sps, Some(vec![0x67, 1]));
        assert_eq!(pps, Some(vec![0x68, 2]));
        assert_eq!(sample, vec![0, 0, 0, 3, 0x65, 9, 9]);
    }

    #[test]
    fn test_yuv_planes_sizes() {
        let rgb = crate::capture::frame::solid_rgb(4, 2, [255, 255, 255]);
        let planes = rgb_to_yuv420(&rgb, 4, 2);
        assert_eq!((planes.luma_stride, planes.chroma_stride), (16, 8));
        assert_eq!(planes.y.len(), 16 * 16);
        assert_eq!(planes.cb.len(), 8 * 8);
        assert_eq!(planes.cr.len(), 8 * 8);
        assert!(planes.y.iter().all(|&v| v == 255));
        assert!(planes.cb.iter().all(|&v| v == 128));
    }

    #[test]
    fn test_padding_repeats_edge_pixels() {
        // Left half black, right column white
        let mut rgb = crate::capture::frame::solid_rgb(18, 2, [0, 0, 0]);
        for row in 0..2 {
            let i = (row * 18 + 17) * 3;
            rgb[i..i + 3].copy_from_slice(&[255, 255, 255]);
        }
        let planes = rgb_to_yuv420(&rgb, 18, 2);
        assert_eq!(planes.luma_stride, 32);
        assert_eq!(planes.y.len(), 32 * 16);
        // Padded columns and rows copy the nearest real pixel
        assert_eq!(planes.y[0], 0);
        assert_eq!(planes.y[17], 255);
        assert_eq!(planes.y[31], 255);
        assert_eq!(planes.y[15 * 32 + 31], 255);
        assert_eq!(planes.y[15 * 32], 0);
    }

    fn record_one(dir: &Path, width: u32, height: u32) -> PathBuf {
        let request = OpenRequest {
            stem: dir.join(format!("recording_{}x{}", width, height)),
            width,
            height,
            fps: 30,
        };
        let mut writer: Box<dyn EncoderBackend> =
            Box::new(H264Mp4Writer::create(&request).unwrap());
        writer
            .write(&Frame::solid(0, width, height, [200, 40, 90]))
            .unwrap();
        writer.finalize().unwrap()
    }

    #[test]
    fn test_unaligned_resolutions() {
        let dir = tempdir().unwrap();
        for (width, height) in [(1920, 1080), (340, 192), (34, 18), (1364, 766)] {
            let path = record_one(dir.path(), width, height);
            let summary = summarize(&path).unwrap();
            assert_eq!(summary.sample_count, 1);
            assert_eq!((summary.width, summary.height), (width, height));

            let report = crate::recorder::inspect(&path, None);
            assert!(report.is_ok(), "{}x{}: {:?}", width, height, report.problems);
        }
    }

    #[test]
    fn test_write_and_retime() {
        let dir = tempdir().unwrap();
        let request = OpenRequest {
            stem: dir.path().join("recording_mp4"),
            width: 32,
            height: 32,
            fps: 30,
        };
        let mut writer: Box<dyn EncoderBackend> =
            Box::new(H264Mp4Writer::create(&request).unwrap());
        for seq in 0..30 {
            writer.write(&Frame::solid(seq, 32, 32, [seq as u8 * 8, 64, 128])).unwrap();
        }
        let path = writer.finalize().unwrap();

        let summary = summarize(&path).unwrap();
        assert_eq!(summary.sample_count, 30);
        assert_eq!((summary.width, summary.height), (32, 32));
        assert!((summary.duration_secs - 1.0).abs() < 0.05);
        assert!(summary.first_sample_len > 0 && summary.last_sample_len > 0);

        retime(&path, 15.0).unwrap();
        let summary = summarize(&path).unwrap();
        assert_eq!(summary.sample_count, 30);
        assert!((summary.duration_secs - 2.0).abs() < 0.05);
    }
}
