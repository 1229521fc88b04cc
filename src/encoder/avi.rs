//! AVI container writer and reader
//!
//! Writes a single-stream RIFF AVI with Motion-JPEG (`00dc`) or uncompressed
//! bottom-up BGR (`00db`) chunks and an `idx1` index. The header is written
//! with placeholder sizes and patched on finalize.

use super::types::{EncoderError, EncoderResult, EncoderTier, NativeCodec, OpenRequest};
use super::EncoderBackend;
use crate::capture::frame::{frame_len, Frame, BYTES_PER_PIXEL};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// Header field offsets for the fixed single-stream layout
const RIFF_SIZE: u64 = 4;
const AVIH_MICROSEC_PER_FRAME: u64 = 32;
const AVIH_TOTAL_FRAMES: u64 = 48;
const AVIH_SUGGESTED_BUFFER: u64 = 60;
const STRH_SCALE: u64 = 128;
const STRH_RATE: u64 = 132;
const STRH_LENGTH: u64 = 140;
const STRH_SUGGESTED_BUFFER: u64 = 144;
const MOVI_LIST_SIZE: u64 = 216;
/// Position of the `movi` fourcc; `idx1` offsets are relative to it
const MOVI_FOURCC: u64 = 220;
const HEADER_LEN: u64 = 224;

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;

/// AVI size fields are 32-bit; stop accepting frames well before they overflow
const MAX_RIFF_BYTES: u64 = u32::MAX as u64 - 64 * 1024 * 1024;

struct IndexEntry {
    offset: u32,
    size: u32,
}

/// Motion-JPEG / DIB AVI encoder
pub struct AviWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    codec: NativeCodec,
    width: u32,
    height: u32,
    jpeg_quality: u8,
    index: Vec<IndexEntry>,
    position: u64,
    max_chunk: u32,
    scratch: Vec<u8>,
}

impl AviWriter {
    /// Create the file, write the header and run the codec self-test
    pub fn create(
        request: &OpenRequest,
        codec: NativeCodec,
        jpeg_quality: u8,
    ) -> EncoderResult<Self> {
        if codec == NativeCodec::H264 {
            return Err(EncoderError::Unavailable("H.264 is not written to AVI".to_string()));
        }
        if request.width == 0 || request.height == 0 || request.fps == 0 {
            return Err(EncoderError::InvalidFrame(format!(
                "invalid geometry {}x{} @ {}fps",
                request.width, request.height, request.fps
            )));
        }

        // Self-test before touching the filesystem
        let mut scratch = Vec::new();
        let black = Frame::solid(0, request.width, request.height, [0, 0, 0]);
        encode_chunk(codec, jpeg_quality, &black, &mut scratch)?;
        if scratch.is_empty() {
            return Err(EncoderError::Codec(format!(
                "{} self-test produced no data",
                codec.label()
            )));
        }

        let path = request.path_with_extension(codec.extension());
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);

        let header = build_header(codec, request.width, request.height, request.fps);
        if let Err(e) = writer.write_all(&header).and_then(|_| writer.flush()) {
            drop(writer);
            let _ = std::fs::remove_file(&path);
            return Err(e.into());
        }

        tracing::debug!("AVI writer open: {:?} ({})", path, codec.label());

        Ok(Self {
            writer,
            path,
            codec,
            width: request.width,
            height: request.height,
            jpeg_quality,
            index: Vec::new(),
            position: HEADER_LEN,
            max_chunk: 0,
            scratch,
        })
    }

    fn chunk_id(&self) -> &'static [u8; 4] {
        match self.codec {
            NativeCodec::Mjpeg => b"00dc",
            _ => b"00db",
        }
    }
}

impl EncoderBackend for AviWriter {
    fn tier(&self) -> EncoderTier {
        EncoderTier::NativeCodec(self.codec)
    }

    fn output_path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, frame: &Frame) -> EncoderResult<()> {
        if frame.width != self.width || frame.height != self.height || !frame.is_well_formed() {
            return Err(EncoderError::InvalidFrame(format!(
                "frame {} is {}x{} ({} bytes), expected {}x{}",
                frame.seq,
                frame.width,
                frame.height,
                frame.data.len(),
                self.width,
                self.height
            )));
        }

        self.scratch.clear();
        encode_chunk(self.codec, self.jpeg_quality, frame, &mut self.scratch)?;

        let size = self.scratch.len() as u32;
        let padded = size as u64 + (size as u64 & 1);
        // chunk + idx1 entry + final idx1 header
        if self.position + 8 + padded + 16 * (self.index.len() as u64 + 1) + 8 > MAX_RIFF_BYTES {
            return Err(EncoderError::Codec("AVI size limit reached".to_string()));
        }

        self.writer.write_all(self.chunk_id())?;
        self.writer.write_all(&size.to_le_bytes())?;
        self.writer.write_all(&self.scratch)?;
        if size & 1 == 1 {
            self.writer.write_all(&[0])?;
        }

        self.index.push(IndexEntry {
            offset: (self.position - MOVI_FOURCC) as u32,
            size,
        });
        self.position += 8 + padded;
        self.max_chunk = self.max_chunk.max(size);
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.index.len() as u64
    }

    fn bytes_written(&self) -> Option<u64> {
        Some(self.position)
    }

    fn finalize(self: Box<Self>) -> EncoderResult<PathBuf> {
        let AviWriter {
            writer,
            path,
            index,
            position,
            max_chunk,
            codec,
            ..
        } = *self;

        let chunk_id = match codec {
            NativeCodec::Mjpeg => b"00dc",
            _ => b"00db",
        };

        let mut writer = writer;
        writer.write_all(b"idx1")?;
        writer.write_all(&((index.len() * 16) as u32).to_le_bytes())?;
        for entry in &index {
            writer.write_all(chunk_id)?;
            writer.write_all(&AVIIF_KEYFRAME.to_le_bytes())?;
            writer.write_all(&entry.offset.to_le_bytes())?;
            writer.write_all(&entry.size.to_le_bytes())?;
        }

        let mut file = writer.into_inner().map_err(|e| e.into_error())?;
        let total_len = position + 8 + index.len() as u64 * 16;
        let frames = index.len() as u32;
        let buffer = max_chunk + 8;

        patch_u32(&mut file, RIFF_SIZE, (total_len - 8) as u32)?;
        patch_u32(&mut file, MOVI_LIST_SIZE, (position - MOVI_FOURCC) as u32)?;
        patch_u32(&mut file, AVIH_TOTAL_FRAMES, frames)?;
        patch_u32(&mut file, AVIH_SUGGESTED_BUFFER, buffer)?;
        patch_u32(&mut file, STRH_LENGTH, frames)?;
        patch_u32(&mut file, STRH_SUGGESTED_BUFFER, buffer)?;
        file.sync_all()?;

        tracing::info!("AVI finalized: {} frames, {} bytes, {:?}", frames, total_len, path);
        Ok(path)
    }
}

fn patch_u32(file: &mut File, offset: u64, value: u32) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&value.to_le_bytes())
}

/// Encode one frame into chunk payload bytes
fn encode_chunk(
    codec: NativeCodec,
    jpeg_quality: u8,
    frame: &Frame,
    out: &mut Vec<u8>,
) -> EncoderResult<()> {
    match codec {
        NativeCodec::Mjpeg => {
            let mut encoder = JpegEncoder::new_with_quality(&mut *out, jpeg_quality);
            encoder.encode(&frame.data, frame.width, frame.height, ExtendedColorType::Rgb8)?;
            Ok(())
        }
        NativeCodec::RawDib => {
            rgb_to_dib(&frame.data, frame.width, frame.height, out);
            Ok(())
        }
        NativeCodec::H264 => Err(EncoderError::Unavailable(
            "H.264 is not written to AVI".to_string(),
        )),
    }
}

/// Row stride of a 24-bit DIB (rows padded to 4 bytes)
fn dib_stride(width: u32) -> usize {
    (width as usize * BYTES_PER_PIXEL + 3) & !3
}

/// Packed top-down RGB to bottom-up, padded BGR
fn rgb_to_dib(rgb: &[u8], width: u32, height: u32, out: &mut Vec<u8>) {
    let stride = dib_stride(width);
    let row_bytes = width as usize * BYTES_PER_PIXEL;
    out.resize(stride * height as usize, 0);

    for y in 0..height as usize {
        let src = &rgb[y * row_bytes..(y + 1) * row_bytes];
        let dst_row = height as usize - 1 - y;
        let dst = &mut out[dst_row * stride..dst_row * stride + row_bytes];
        for (d, s) in dst.chunks_exact_mut(3).zip(src.chunks_exact(3)) {
            d[0] = s[2];
            d[1] = s[1];
            d[2] = s[0];
        }
    }
}

/// Bottom-up, padded BGR back to packed top-down RGB
fn dib_to_rgb(dib: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
    let stride = dib_stride(width);
    if dib.len() < stride * height as usize {
        return None;
    }

    let row_bytes = width as usize * BYTES_PER_PIXEL;
    let mut rgb = Vec::with_capacity(frame_len(width, height));
    for y in (0..height as usize).rev() {
        for px in dib[y * stride..y * stride + row_bytes].chunks_exact(3) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }
    Some(rgb)
}

fn build_header(codec: NativeCodec, width: u32, height: u32, fps: u32) -> Vec<u8> {
    let mut h = Vec::with_capacity(HEADER_LEN as usize);
    let u32le = |h: &mut Vec<u8>, v: u32| h.extend_from_slice(&v.to_le_bytes());
    let u16le = |h: &mut Vec<u8>, v: u16| h.extend_from_slice(&v.to_le_bytes());

    let (handler, compression, image_size): (&[u8; 4], u32, u32) = match codec {
        NativeCodec::Mjpeg => (
            b"MJPG",
            u32::from_le_bytes(*b"MJPG"),
            frame_len(width, height) as u32,
        ),
        _ => (b"DIB ", 0, (dib_stride(width) * height as usize) as u32),
    };

    h.extend_from_slice(b"RIFF");
    u32le(&mut h, 0); // patched
    h.extend_from_slice(b"AVI ");

    h.extend_from_slice(b"LIST");
    u32le(&mut h, 192);
    h.extend_from_slice(b"hdrl");

    // avih
    h.extend_from_slice(b"avih");
    u32le(&mut h, 56);
    u32le(&mut h, 1_000_000 / fps.max(1));
    u32le(&mut h, 0); // max bytes per sec
    u32le(&mut h, 0); // padding granularity
    u32le(&mut h, AVIF_HASINDEX);
    u32le(&mut h, 0); // total frames, patched
    u32le(&mut h, 0); // initial frames
    u32le(&mut h, 1); // streams
    u32le(&mut h, 0); // suggested buffer, patched
    u32le(&mut h, width);
    u32le(&mut h, height);
    for _ in 0..4 {
        u32le(&mut h, 0);
    }

    h.extend_from_slice(b"LIST");
    u32le(&mut h, 116);
    h.extend_from_slice(b"strl");

    // strh
    h.extend_from_slice(b"strh");
    u32le(&mut h, 56);
    h.extend_from_slice(b"vids");
    h.extend_from_slice(handler);
    u32le(&mut h, 0); // flags
    u16le(&mut h, 0); // priority
    u16le(&mut h, 0); // language
    u32le(&mut h, 0); // initial frames
    u32le(&mut h, 1); // scale
    u32le(&mut h, fps);
    u32le(&mut h, 0); // start
    u32le(&mut h, 0); // length, patched
    u32le(&mut h, 0); // suggested buffer, patched
    u32le(&mut h, u32::MAX); // quality: default
    u32le(&mut h, 0); // sample size
    u16le(&mut h, 0);
    u16le(&mut h, 0);
    u16le(&mut h, width as u16);
    u16le(&mut h, height as u16);

    // strf: BITMAPINFOHEADER
    h.extend_from_slice(b"strf");
    u32le(&mut h, 40);
    u32le(&mut h, 40);
    u32le(&mut h, width);
    u32le(&mut h, height);
    u16le(&mut h, 1);
    u16le(&mut h, 24);
    u32le(&mut h, compression);
    u32le(&mut h, image_size);
    for _ in 0..4 {
        u32le(&mut h, 0);
    }

    h.extend_from_slice(b"LIST");
    u32le(&mut h, 4); // patched
    h.extend_from_slice(b"movi");

    debug_assert_eq!(h.len() as u64, HEADER_LEN);
    h
}

/// Read-back view of an AVI file
#[derive(Debug)]
pub struct AviReader {
    data: Vec<u8>,
    handler: [u8; 4],
    width: u32,
    height: u32,
    scale: u32,
    rate: u32,
    frames: Vec<(usize, usize)>,
}

impl AviReader {
    /// Parse an AVI file written by `AviWriter` (or any single-stream AVI with `idx1`)
    pub fn open(path: &Path) -> EncoderResult<Self> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        Self::parse(data)
    }

    fn parse(data: Vec<u8>) -> EncoderResult<Self> {
        let bad = |msg: &str| EncoderError::Verification(format!("AVI: {}", msg));

        if data.len() < 12 || &data[0..4] != b"RIFF" || &data[8..12] != b"AVI " {
            return Err(bad("missing RIFF/AVI magic"));
        }

        let mut handler = [0u8; 4];
        let (mut width, mut height, mut scale, mut rate) = (0, 0, 1, 0);
        let mut movi_start = None;
        let mut index = Vec::new();

        // Walk the chunk tree: top-level lists, plus the hdrl/strl sublists
        let mut stack = vec![(12usize, data.len())];
        while let Some((mut pos, end)) = stack.pop() {
            while pos + 8 <= end {
                let id = &data[pos..pos + 4];
                let size = read_u32(&data, pos + 4).ok_or_else(|| bad("truncated chunk"))? as usize;
                let body = pos + 8;
                let body_end = (body + size).min(end);

                match id {
                    b"LIST" if body + 4 <= body_end => {
                        let kind = &data[body..body + 4];
                        if kind == b"movi" {
                            movi_start = Some(body);
                        } else if kind == b"hdrl" || kind == b"strl" {
                            stack.push((body + 4, body_end));
                        }
                    }
                    b"strh" if size >= 36 => {
                        handler.copy_from_slice(&data[body + 4..body + 8]);
                        scale = read_u32(&data, body + 20).unwrap_or(1);
                        rate = read_u32(&data, body + 24).unwrap_or(0);
                    }
                    b"avih" if size >= 40 => {
                        width = read_u32(&data, body + 32).unwrap_or(0);
                        height = read_u32(&data, body + 36).unwrap_or(0);
                    }
                    b"idx1" => {
                        for entry in data[body..body_end].chunks_exact(16) {
                            let offset =
                                u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]])
                                    as usize;
                            let len =
                                u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]])
                                    as usize;
                            if &entry[2..4] == b"dc" || &entry[2..4] == b"db" {
                                index.push((offset, len));
                            }
                        }
                    }
                    _ => {}
                }

                pos = body + size + (size & 1);
            }
        }

        let movi_start = movi_start.ok_or_else(|| bad("no movi list"))?;
        let frames: Vec<(usize, usize)> = index
            .into_iter()
            .map(|(offset, len)| (movi_start + offset + 8, len))
            .filter(|(start, len)| start + len <= data.len())
            .collect();

        Ok(Self {
            data,
            handler,
            width,
            height,
            scale: scale.max(1),
            rate,
            frames,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frames.len() as u64
    }

    pub fn fps(&self) -> f64 {
        self.rate as f64 / self.scale as f64
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Duration in seconds implied by frame count and rate
    pub fn duration_secs(&self) -> f64 {
        if self.rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.fps()
    }

    /// Stream handler fourcc, e.g. `MJPG`
    pub fn handler(&self) -> String {
        String::from_utf8_lossy(&self.handler).to_string()
    }

    /// Decode one frame to packed RGB
    pub fn decode_frame(&self, index: usize) -> EncoderResult<Vec<u8>> {
        let (start, len) = *self
            .frames
            .get(index)
            .ok_or_else(|| EncoderError::Verification(format!("AVI frame {} missing", index)))?;
        let payload = &self.data[start..start + len];

        if &self.handler == b"MJPG" {
            let image = image::load_from_memory_with_format(payload, image::ImageFormat::Jpeg)?;
            Ok(image.to_rgb8().into_raw())
        } else {
            dib_to_rgb(payload, self.width, self.height)
                .ok_or_else(|| EncoderError::Verification(format!("AVI frame {} truncated", index)))
        }
    }
}

fn read_u32(data: &[u8], pos: usize) -> Option<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Rewrite the frame rate of an AVI in place
///
/// The change is made on a temporary copy which replaces the original only
/// once fully written.
pub fn retime(path: &Path, fps: f64) -> EncoderResult<()> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(EncoderError::InvalidFrame(format!("invalid frame rate {}", fps)));
    }

    // Validate before copying
    AviReader::open(path)?;

    let tmp = path.with_extension("retime.avi");
    std::fs::copy(path, &tmp)?;

    let result = (|| -> EncoderResult<()> {
        let mut file = std::fs::OpenOptions::new().write(true).open(&tmp)?;
        patch_u32(&mut file, AVIH_MICROSEC_PER_FRAME, (1_000_000.0 / fps).round() as u32)?;
        patch_u32(&mut file, STRH_SCALE, 1000)?;
        patch_u32(&mut file, STRH_RATE, (fps * 1000.0).round() as u32)?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    std::fs::rename(&tmp, path)?;
    Ok(())
}
