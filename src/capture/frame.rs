//! Frame buffers and pixel helpers
//!
//! Every frame handed to an encoder is packed RGB24, row-major, at the
//! session's logical resolution.

/// Bytes per pixel of the packed pixel format used downstream
pub const BYTES_PER_PIXEL: usize = 3;

/// Lower bound for the resolution scale factor
pub const MIN_SCALE: f64 = 0.25;

/// Upper bound for the resolution scale factor
pub const MAX_SCALE: f64 = 1.0;

/// Pixels as delivered by a capture backend, before sequencing
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Packed RGB24 pixel data
    pub data: Vec<u8>,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,
}

/// One captured screen image
///
/// Frames are never mutated after they enter the frame queue.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic sequence number (0, 1, 2, ...)
    pub seq: u64,

    /// Logical width in pixels
    pub width: u32,

    /// Logical height in pixels
    pub height: u32,

    /// Packed RGB24 pixel data, `width * height * 3` bytes
    pub data: Vec<u8>,
}

impl Frame {
    /// Build a frame, resampling to the logical size when the capture size differs
    pub fn from_raw(seq: u64, raw: RawFrame, width: u32, height: u32) -> Self {
        let data = if raw.width == width && raw.height == height {
            raw.data
        } else {
            resize_nearest(&raw.data, raw.width, raw.height, width, height)
        };

        Self {
            seq,
            width,
            height,
            data,
        }
    }

    /// Solid colour frame, mostly useful for codec self-tests
    pub fn solid(seq: u64, width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self {
            seq,
            width,
            height,
            data: solid_rgb(width, height, rgb),
        }
    }

    /// Expected buffer size for the frame's dimensions
    pub fn expected_len(&self) -> usize {
        frame_len(self.width, self.height)
    }

    /// Whether the buffer matches the frame's dimensions
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.expected_len()
    }
}

/// Buffer length of a packed RGB24 image
pub fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

/// Fill a packed RGB24 buffer with a single colour
pub fn solid_rgb(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let pixels = width as usize * height as usize;
    let mut data = Vec::with_capacity(pixels * BYTES_PER_PIXEL);
    for _ in 0..pixels {
        data.extend_from_slice(&rgb);
    }
    data
}

/// Clamp a resolution scale factor to the supported range
pub fn clamp_scale(scale: f64) -> f64 {
    if scale.is_nan() {
        return MAX_SCALE;
    }
    scale.clamp(MIN_SCALE, MAX_SCALE)
}

/// Compute the logical recording resolution for a native display size
///
/// Dimensions never exceed the native size and are even (YUV 4:2:0 encoders
/// require it) whenever the native dimension is at least 2.
pub fn logical_resolution(native_width: u32, native_height: u32, scale: f64) -> (u32, u32) {
    let scale = clamp_scale(scale);
    (
        even_dimension(native_width, scale),
        even_dimension(native_height, scale),
    )
}

fn even_dimension(native: u32, scale: f64) -> u32 {
    let scaled = (native as f64 * scale).floor() as u32;
    let scaled = scaled.min(native);
    let even = scaled & !1;
    even.max(2).min(native)
}

/// Nearest-neighbour resample of a packed RGB24 image
pub fn resize_nearest(
    src: &[u8],
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
) -> Vec<u8> {
    let mut dst = vec![0u8; frame_len(dst_width, dst_height)];
    if src_width == 0 || src_height == 0 || src.len() < frame_len(src_width, src_height) {
        return dst;
    }

    let src_stride = src_width as usize * BYTES_PER_PIXEL;
    let dst_stride = dst_width as usize * BYTES_PER_PIXEL;

    // Precompute the source column offsets once per call
    let columns: Vec<usize> = (0..dst_width as usize)
        .map(|x| (x * src_width as usize / dst_width as usize) * BYTES_PER_PIXEL)
        .collect();

    for y in 0..dst_height as usize {
        let sy = y * src_height as usize / dst_height as usize;
        let src_row = &src[sy * src_stride..(sy + 1) * src_stride];
        let dst_row = &mut dst[y * dst_stride..(y + 1) * dst_stride];
        for (x, &sx) in columns.iter().enumerate() {
            let d = x * BYTES_PER_PIXEL;
            dst_row[d..d + BYTES_PER_PIXEL].copy_from_slice(&src_row[sx..sx + BYTES_PER_PIXEL]);
        }
    }

    dst
}

/// Drop the alpha channel of an RGBA buffer
pub fn rgba_to_rgb(rgba: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(rgba.len() / 4 * BYTES_PER_PIXEL);
    for px in rgba.chunks_exact(4) {
        rgb.extend_from_slice(&px[..3]);
    }
    rgb
}

/// Reorder a BGRA buffer (GDI, CoreGraphics) into packed RGB
pub fn bgra_to_rgb(bgra: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(bgra.len() / 4 * BYTES_PER_PIXEL);
    for px in bgra.chunks_exact(4) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    rgb
}

/// Copy rows out of a padded BGRA buffer (stride larger than `width * 4`)
pub fn bgra_rows_to_rgb(bgra: &[u8], width: u32, height: u32, bytes_per_row: usize) -> Vec<u8> {
    let row_bytes = width as usize * 4;
    let mut rgb = Vec::with_capacity(frame_len(width, height));
    for y in 0..height as usize {
        let start = y * bytes_per_row;
        let Some(row) = bgra.get(start..start + row_bytes) else {
            break;
        };
        for px in row.chunks_exact(4) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_resolution_even_and_bounded() {
        let natives = [
            (1920, 1080),
            (2560, 1440),
            (1366, 768),
            (1365, 767),
            (3840, 2160),
            (801, 601),
        ];
        for (w, h) in natives {
            for step in 0..=75 {
                let scale = 0.25 + step as f64 * 0.01;
                let (lw, lh) = logical_resolution(w, h, scale);
                assert_eq!(lw % 2, 0, "width {} odd for {}x{} @ {}", lw, w, h, scale);
                assert_eq!(lh % 2, 0, "height {} odd for {}x{} @ {}", lh, w, h, scale);
                assert!(lw <= w && lh <= h);
            }
        }
    }

    #[test]
    fn test_logical_resolution_clamps_scale() {
        assert_eq!(logical_resolution(1920, 1080, 4.0), (1920, 1080));
        assert_eq!(logical_resolution(1920, 1080, 0.01), (480, 270));
        assert_eq!(logical_resolution(1366, 768, 0.25), (340, 192));
        assert_eq!(logical_resolution(1365, 767, 1.0), (1364, 766));
    }

    #[test]
    fn test_logical_resolution_tiny_native() {
        assert_eq!(logical_resolution(1, 1, 1.0), (1, 1));
        assert_eq!(logical_resolution(3, 1, 1.0), (2, 1));
        assert_eq!(logical_resolution(2, 2, 0.25), (2, 2));
        assert_eq!(logical_resolution(0, 0, 1.0), (0, 0));
    }

    #[test]
    fn test_resize_nearest_downscale() {
        // 4x2 image: left half red, right half blue
        let mut src = Vec::new();
        for _ in 0..2 {
            for x in 0..4 {
                if x < 2 {
                    src.extend_from_slice(&[255, 0, 0]);
                } else {
                    src.extend_from_slice(&[0, 0, 255]);
                }
            }
        }
        let dst = resize_nearest(&src, 4, 2, 2, 1);
        assert_eq!(dst, vec![255, 0, 0, 0, 0, 255]);
    }

    #[test]
    fn test_channel_conversions() {
        assert_eq!(rgba_to_rgb(&[1, 2, 3, 255, 4, 5, 6, 255]), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(bgra_to_rgb(&[3, 2, 1, 255]), vec![1, 2, 3]);
        // Two rows of one pixel each, padded to 8 bytes per row
        let padded = [3, 2, 1, 255, 0, 0, 0, 0, 6, 5, 4, 255, 0, 0, 0, 0];
        assert_eq!(bgra_rows_to_rgb(&padded, 1, 2, 8), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_from_raw_resamples() {
        let raw = RawFrame {
            data: solid_rgb(8, 8, [9, 9, 9]),
            width: 8,
            height: 8,
        };
        let frame = Frame::from_raw(7, raw, 4, 4);
        assert_eq!(frame.seq, 7);
        assert!(frame.is_well_formed());
        assert!(frame.data.iter().all(|&b| b == 9));
    }
}
