//! Grayscale frame type and pixel-format conversion.

use image::GrayImage;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wrap raw pixels; fails if the buffer does not match the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Convert into an `image` buffer for detection and cropping.
    pub fn into_gray_image(self) -> Result<GrayImage, FrameError> {
        let expected = self.width as usize * self.height as usize;
        let actual = self.data.len();
        GrayImage::from_raw(self.width, self.height, self.data)
            .ok_or(FrameError::InvalidLength { expected, actual })
    }
}

/// Extract the Y plane from packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair).
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    let packed = yuyv.get(..expected).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })?;
    Ok(packed.iter().step_by(2).copied().collect())
}

/// Downscale 16-bit little-endian gray to 8 bits by keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    let packed = y16.get(..expected).ok_or(FrameError::InvalidLength {
        expected,
        actual: y16.len(),
    })?;
    Ok(packed.chunks_exact(2).map(|px| px[1]).collect())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        let yuyv = vec![100, 128, 200, 128];
        assert_eq!(yuyv_to_grayscale(&yuyv, 2, 1).unwrap(), vec![100, 200]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_grayscale(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x12AB, 0xFF00 little-endian
        let y16 = vec![0xAB, 0x12, 0x00, 0xFF];
        assert_eq!(y16_to_grayscale(&y16, 2, 1).unwrap(), vec![0x12, 0xFF]);
    }

    #[test]
    fn test_frame_new_rejects_short_buffer() {
        let err = Frame::new(vec![0; 5], 2, 3).err().unwrap();
        assert!(matches!(err, FrameError::InvalidLength { expected: 6, actual: 5 }));
    }

    #[test]
    fn test_into_gray_image() {
        let frame = Frame::new((0..6).collect(), 3, 2).unwrap();
        let img = frame.into_gray_image().unwrap();
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(2, 1).0[0], 5);
    }
}
