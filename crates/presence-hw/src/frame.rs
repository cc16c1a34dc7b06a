//! Frame type and pixel conversions: YUYV/Y16 to grayscale, dark detection.

use std::time::Instant;

/// A decoded 8-bit grayscale video frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes, row-major).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    /// Driver sequence number, monotonically increasing per stream.
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Build a frame from grayscale pixels, computing the dark flag.
    pub fn from_gray(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&data, DARK_FRAME_RATIO);
        Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
            sequence,
            is_dark,
        }
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("is_dark", &self.is_dark)
            .finish_non_exhaustive()
    }
}

/// Share of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

/// Extract the luma plane from packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair).
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            format: "YUYV",
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Downscale 16-bit little-endian grayscale to 8 bits by keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    let expected = pixels * 2;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength {
            format: "Y16",
            expected,
            actual: y16.len(),
        });
    }
    Ok(y16[..expected]
        .chunks_exact(2)
        .map(|px| (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8)
        .collect())
}

/// True if more than `threshold_pct` of the pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    (dark as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} buffer length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_keeps_luma_bytes() {
        let yuyv: Vec<u8> = (0..16).collect();
        let gray = yuyv_to_grayscale(&yuyv, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_yuyv_short_buffer() {
        let err = yuyv_to_grayscale(&[100, 128], 2, 1).unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength { expected: 4, actual: 2, .. }));
    }

    #[test]
    fn test_y16_high_byte() {
        // 0x1234 little-endian → [0x34, 0x12]; high byte 0x12
        let y16 = vec![0x34, 0x12, 0xff, 0xff];
        let gray = y16_to_grayscale(&y16, 2, 1).unwrap();
        assert_eq!(gray, vec![0x12, 0xff]);
    }

    #[test]
    fn test_y16_short_buffer() {
        assert!(y16_to_grayscale(&[0u8; 3], 2, 1).is_err());
    }

    #[test]
    fn test_dark_frame_thresholds() {
        assert!(is_dark_frame(&[], DARK_FRAME_RATIO));
        assert!(is_dark_frame(&[0u8; 1000], DARK_FRAME_RATIO));
        assert!(!is_dark_frame(&[128u8; 1000], DARK_FRAME_RATIO));

        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend([128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, DARK_FRAME_RATIO));

        let mut borderline = vec![10u8; 940];
        borderline.extend([128u8; 60]);
        assert!(!is_dark_frame(&borderline, DARK_FRAME_RATIO));
    }

    #[test]
    fn test_from_gray_flags_and_brightness() {
        let frame = Frame::from_gray(vec![100u8, 200], 2, 1, 7);
        assert!(!frame.is_dark);
        assert_eq!(frame.sequence, 7);
        assert!((frame.avg_brightness() - 150.0).abs() < 1e-6);
    }
}
