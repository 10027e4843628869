//! Frame type and pixel conversions (YUYV/Y16 to grayscale, dark detection).

use image::GrayImage;

/// A captured grayscale frame.
#[derive(Clone)]
pub struct Frame {
    pub image: GrayImage,
    /// Source-local frame counter.
    pub sequence: u32,
    pub captured_at: std::time::Instant,
    pub is_dark: bool,
}

impl Frame {
    pub fn new(image: GrayImage, sequence: u32) -> Self {
        let is_dark = is_dark_frame(image.as_raw(), DARK_FRAME_THRESHOLD);
        Self {
            image,
            sequence,
            captured_at: std::time::Instant::now(),
            is_dark,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Mean luma, 0.0 for an empty image.
    pub fn avg_brightness(&self) -> f32 {
        let pixels = self.image.as_raw();
        match pixels.len() {
            0 => 0.0,
            n => pixels.iter().map(|&p| u64::from(p)).sum::<u64>() as f32 / n as f32,
        }
    }
}

/// Share of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// Luma values below this count as near-black.
const DARK_LEVEL: u8 = 32;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer holds {actual} bytes, frame needs {expected}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Pick one byte out of every two-byte pixel.
fn take_byte(buf: &[u8], width: u32, height: u32, offset: usize) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    let pixels = buf.get(..expected).ok_or(FrameError::InvalidLength {
        expected,
        actual: buf.len(),
    })?;
    Ok(pixels.chunks_exact(2).map(|px| px[offset]).collect())
}

/// Luma plane of a packed YUYV buffer (`Y0 U Y1 V` per pixel pair).
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    take_byte(yuyv, width, height, 0)
}

/// 16-bit little-endian luma reduced to its high byte.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    take_byte(buf, width, height, 1)
}

/// Whether more than `threshold` of the pixels are near-black. Empty input is dark.
pub fn is_dark_frame(gray: &[u8], threshold: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let near_black = gray.iter().filter(|&&p| p < DARK_LEVEL).count();
    near_black as f32 > threshold * gray.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_yuyv_keeps_luma_bytes() {
        let packed = [50u8, 128, 60, 128, 70, 128, 80, 128];
        assert_eq!(yuyv_to_grayscale(&packed, 2, 2).unwrap(), vec![50, 60, 70, 80]);
        assert!(matches!(
            yuyv_to_grayscale(&packed[..6], 2, 2),
            Err(FrameError::InvalidLength { expected: 8, actual: 6 })
        ));
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x1234 and 0xABCD little-endian
        let buf = vec![0x34, 0x12, 0xCD, 0xAB];
        assert_eq!(y16_to_grayscale(&buf, 2, 1).unwrap(), vec![0x12, 0xAB]);
    }

    #[test]
    fn test_y16_invalid_length() {
        assert!(y16_to_grayscale(&[0, 0, 0], 2, 1).is_err());
    }

    #[test]
    fn test_dark_frame_cases() {
        let with_black = |black: usize| {
            let mut px = vec![5u8; black];
            px.resize(100, 180);
            px
        };
        assert!(is_dark_frame(&[], DARK_FRAME_THRESHOLD));
        assert!(is_dark_frame(&with_black(100), DARK_FRAME_THRESHOLD));
        assert!(is_dark_frame(&with_black(96), DARK_FRAME_THRESHOLD));
        assert!(!is_dark_frame(&with_black(94), DARK_FRAME_THRESHOLD));
        assert!(!is_dark_frame(&with_black(0), DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_frame_new_flags_darkness() {
        let dark = Frame::new(GrayImage::new(8, 8), 0);
        assert!(dark.is_dark);
        let lit = Frame::new(GrayImage::from_pixel(8, 8, Luma([200])), 1);
        assert!(!lit.is_dark);
        assert_eq!((lit.width(), lit.height()), (8, 8));
        assert!((lit.avg_brightness() - 200.0).abs() < 1e-4);
    }
}
