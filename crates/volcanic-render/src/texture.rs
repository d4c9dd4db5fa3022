// SPDX-License-Identifier: CEPL-1.0
use std::borrow::Cow;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssetError {
    #[error("mesh has no vertices or no indices")]
    EmptyMesh,
    #[error("index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },
    #[error("texture has a zero dimension ({width}x{height})")]
    EmptyTexture { width: u32, height: u32 },
    #[error("unsupported channel count {0}, expected 3 or 4")]
    UnsupportedChannels(u8),
    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    PixelSize { expected: usize, actual: usize },
}

/// Borrowed, tightly packed 8-bit pixel data (row-major, top row first).
#[derive(Clone, Copy, Debug)]
pub struct TextureData<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl<'a> TextureData<'a> {
    pub fn rgba(pixels: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            pixels,
            width,
            height,
            channels: 4,
        }
    }

    /// Validates the buffer and returns RGBA8 pixels, expanding RGB with opaque alpha.
    pub fn to_rgba8(&self) -> Result<Cow<'a, [u8]>, AssetError> {
        if self.width == 0 || self.height == 0 {
            return Err(AssetError::EmptyTexture {
                width: self.width,
                height: self.height,
            });
        }
        if self.channels != 3 && self.channels != 4 {
            return Err(AssetError::UnsupportedChannels(self.channels));
        }
        let expected = self.width as usize * self.height as usize * self.channels as usize;
        if self.pixels.len() != expected {
            return Err(AssetError::PixelSize {
                expected,
                actual: self.pixels.len(),
            });
        }
        if self.channels == 4 {
            return Ok(Cow::Borrowed(self.pixels));
        }
        let mut out = Vec::with_capacity(expected / 3 * 4);
        for px in self.pixels.chunks_exact(3) {
            out.extend_from_slice(px);
            out.push(u8::MAX);
        }
        Ok(Cow::Owned(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_input_is_borrowed() {
        let px = [1u8, 2, 3, 4];
        let tex = TextureData::rgba(&px, 1, 1);
        assert!(matches!(tex.to_rgba8(), Ok(Cow::Borrowed(_))));
    }

    #[test]
    fn rgb_input_gains_opaque_alpha() {
        let px = [10u8, 20, 30, 40, 50, 60];
        let tex = TextureData {
            pixels: &px,
            width: 2,
            height: 1,
            channels: 3,
        };
        let out = tex.to_rgba8().unwrap();
        assert_eq!(&*out, &[10, 20, 30, 255, 40, 50, 60, 255]);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let px = [0u8; 12];
        let tex = TextureData::rgba(&px, 2, 2);
        assert_eq!(
            tex.to_rgba8().unwrap_err(),
            AssetError::PixelSize {
                expected: 16,
                actual: 12
            }
        );
    }

    #[test]
    fn odd_channel_counts_are_rejected() {
        let px = [0u8; 2];
        let tex = TextureData {
            pixels: &px,
            width: 1,
            height: 1,
            channels: 2,
        };
        assert_eq!(tex.to_rgba8().unwrap_err(), AssetError::UnsupportedChannels(2));
    }
}
