use crate::{GlmError, Result};

/// An immutable RGB frame stored row-major as `[height, width, 3]` bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl Image {
    pub const CHANNELS: usize = 3;

    /// Build an image from packed RGB bytes.
    pub fn new(width: usize, height: usize, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(GlmError::InvalidInput(format!(
                "image dimensions must be non-zero, got {width}x{height}"
            )));
        }
        let expected = width * height * Self::CHANNELS;
        if pixels.len() != expected {
            return Err(GlmError::InvalidInput(format!(
                "expected {expected} bytes for a {width}x{height} RGB image, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Copy an image out of a caller-owned strided buffer.
    ///
    /// `shape` is `[height, width, channels]` and `strides` are in bytes. Only
    /// 3-channel, densely packed row-major layouts are accepted.
    pub fn from_buffer(data: &[u8], shape: &[usize], strides: &[usize]) -> Result<Self> {
        if shape.len() != 3 || strides.len() != 3 {
            return Err(GlmError::UnsupportedFormat(format!(
                "expected a 3-d [height, width, channels] buffer, got shape {shape:?}"
            )));
        }
        if shape[2] != Self::CHANNELS {
            return Err(GlmError::UnsupportedFormat(format!(
                "only RGB images are supported, got {} channels",
                shape[2]
            )));
        }
        if strides[2] != 1 {
            return Err(GlmError::UnsupportedFormat(format!(
                "innermost stride must be 1 byte, got {}",
                strides[2]
            )));
        }
        for i in 1..shape.len() {
            if strides[i] * shape[i] != strides[i - 1] {
                return Err(GlmError::UnsupportedFormat(format!(
                    "only contiguous buffers are supported (shape {shape:?}, strides {strides:?})"
                )));
            }
        }
        let len = shape.iter().product::<usize>();
        if data.len() < len {
            return Err(GlmError::InvalidInput(format!(
                "buffer holds {} bytes, shape {shape:?} needs {len}",
                data.len()
            )));
        }
        Self::new(shape[1], shape[0], data[..len].to_vec())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        Self::CHANNELS
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// `[height, width, channels]`
    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, Self::CHANNELS]
    }

    /// Byte strides matching [`Image::shape`].
    pub fn strides(&self) -> [usize; 3] {
        [self.width * Self::CHANNELS, Self::CHANNELS, 1]
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Image(width={}, height={}, channels={})",
            self.width,
            self.height,
            Self::CHANNELS
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn rejects_four_channels() {
        let data = vec![0u8; 2 * 2 * 4];
        let err = Image::from_buffer(&data, &[2, 2, 4], &[8, 4, 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn rejects_padded_rows() {
        // Rows padded to 8 bytes instead of 6.
        let data = vec![0u8; 2 * 8];
        let err = Image::from_buffer(&data, &[2, 2, 3], &[8, 3, 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn rejects_transposed_layout() {
        let data = vec![0u8; 12];
        let err = Image::from_buffer(&data, &[2, 2, 3], &[3, 6, 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn contiguous_buffer_round_trips() {
        let data: Vec<u8> = (0..2 * 3 * 3).map(|v| v as u8).collect();
        let image = Image::from_buffer(&data, &[2, 3, 3], &[9, 3, 1]).unwrap();
        assert_eq!(image.width(), 3);
        assert_eq!(image.height(), 2);
        assert_eq!(image.channels(), 3);
        assert_eq!(image.pixels(), &data[..]);
        assert_eq!(image.shape(), [2, 3, 3]);
        assert_eq!(image.strides(), [9, 3, 1]);
    }

    #[test]
    fn short_buffer_is_invalid_input() {
        let err = Image::from_buffer(&[0u8; 5], &[2, 2, 3], &[6, 3, 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
