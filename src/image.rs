// image.rs — Host-side RGBA image container.
//
// The decode collaborator hands us 8-bit RGBA, four bytes per pixel,
// top-to-bottom row-major. Decoders may pad rows, so the container keeps an
// explicit stride (in pixels) just like a strided grayscale frame would:
//
//   stride = 5, width = 4:
//     row0: [p00 p01 p02 p03 _pad_]
//     row1: [p10 p11 p12 p13 _pad_]
//
// Device buffers are always packed (stride == width). `to_words()` performs
// the compaction and reinterprets every pixel as one little-endian `u32`
// (red in the low byte), which is what the kernels index.

use crate::error::{Result, SegmentError};

/// Bytes per RGBA pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// Opaque alpha in a packed pixel word.
pub const ALPHA_MASK: u32 = 0xff00_0000;

/// Pack an RGBA quadruple into the device word layout.
#[inline]
pub fn pack_rgba(px: [u8; 4]) -> u32 {
    u32::from_le_bytes(px)
}

/// Inverse of [`pack_rgba`].
#[inline]
pub fn unpack_rgba(word: u32) -> [u8; 4] {
    word.to_le_bytes()
}

/// An 8-bit RGBA image with runtime dimensions and row stride.
#[derive(Clone, PartialEq, Eq)]
pub struct RgbaImage {
    /// Pixel bytes, `height * stride * 4` long.
    data: Vec<u8>,
    width: usize,
    height: usize,
    /// Row stride in pixels. `stride >= width`.
    stride: usize,
}

impl std::fmt::Debug for RgbaImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RgbaImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish()
    }
}

impl RgbaImage {
    /// Transparent-black image with stride == width.
    pub fn new(width: usize, height: usize) -> Self {
        RgbaImage {
            data: vec![0; width * height * BYTES_PER_PIXEL],
            width,
            height,
            stride: width,
        }
    }

    /// Every pixel set to `color`.
    pub fn filled(width: usize, height: usize, color: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity(width * height * BYTES_PER_PIXEL);
        for _ in 0..width * height {
            data.extend_from_slice(&color);
        }
        RgbaImage { data, width, height, stride: width }
    }

    /// Wrap packed RGBA bytes (`width * height * 4` long).
    pub fn from_vec(width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
        Self::from_vec_with_stride(width, height, width, data)
    }

    /// Wrap RGBA bytes whose rows are `stride` pixels apart.
    pub fn from_vec_with_stride(
        width: usize,
        height: usize,
        stride: usize,
        data: Vec<u8>,
    ) -> Result<Self> {
        if stride < width {
            return Err(SegmentError::InvalidImage(format!(
                "stride ({stride}) must be >= width ({width})"
            )));
        }
        let expected = height * stride * BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(SegmentError::InvalidImage(format!(
                "{} bytes supplied for a {width}x{height} image with stride {stride} (expected {expected})",
                data.len()
            )));
        }
        Ok(RgbaImage { data, width, height, stride })
    }

    /// Build a packed image from device words.
    pub fn from_words(width: usize, height: usize, words: &[u32]) -> Result<Self> {
        if words.len() != width * height {
            return Err(SegmentError::InvalidImage(format!(
                "{} words for a {width}x{height} image",
                words.len()
            )));
        }
        let data = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        Ok(RgbaImage { data, width, height, stride: width })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Size of the packed device buffer: width × height × 4.
    pub fn packed_byte_size(&self) -> u64 {
        (self.pixel_count() * BYTES_PER_PIXEL) as u64
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> [u8; 4] {
        let i = (y * self.stride + x) * BYTES_PER_PIXEL;
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, px: [u8; 4]) {
        let i = (y * self.stride + x) * BYTES_PER_PIXEL;
        self.data[i..i + BYTES_PER_PIXEL].copy_from_slice(&px);
    }

    /// Packed pixel words, padding stripped.
    pub fn to_words(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.pixel_count());
        for y in 0..self.height {
            for x in 0..self.width {
                out.push(pack_rgba(self.get(x, y)));
            }
        }
        out
    }

    /// Packed RGBA bytes, padding stripped.
    pub fn to_packed_bytes(&self) -> Vec<u8> {
        if self.stride == self.width {
            return self.data.clone();
        }
        let row = self.width * BYTES_PER_PIXEL;
        let mut out = Vec::with_capacity(self.height * row);
        for y in 0..self.height {
            let start = y * self.stride * BYTES_PER_PIXEL;
            out.extend_from_slice(&self.data[start..start + row]);
        }
        out
    }

    /// Consume into packed RGBA bytes for the display/encode collaborator.
    pub fn into_packed_bytes(self) -> Vec<u8> {
        if self.stride == self.width {
            self.data
        } else {
            self.to_packed_bytes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_is_little_endian_rgba() {
        assert_eq!(pack_rgba([0x11, 0x22, 0x33, 0x44]), 0x4433_2211);
        assert_eq!(unpack_rgba(0x4433_2211), [0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        assert!(RgbaImage::from_vec(2, 2, vec![0; 15]).is_err());
        assert!(RgbaImage::from_vec(2, 2, vec![0; 16]).is_ok());
    }

    #[test]
    fn test_stride_must_cover_width() {
        assert!(RgbaImage::from_vec_with_stride(3, 1, 2, vec![0; 8]).is_err());
    }

    #[test]
    fn test_compaction_strips_padding() {
        // width 2, stride 3: the third pixel of every row is padding.
        let data = vec![
            1, 1, 1, 255, 2, 2, 2, 255, 9, 9, 9, 9, //
            3, 3, 3, 255, 4, 4, 4, 255, 9, 9, 9, 9,
        ];
        let img = RgbaImage::from_vec_with_stride(2, 2, 3, data).unwrap();
        assert_eq!(img.get(1, 1), [4, 4, 4, 255]);
        let words = img.to_words();
        assert_eq!(words.len(), 4);
        assert_eq!(unpack_rgba(words[2]), [3, 3, 3, 255]);
        let packed = img.to_packed_bytes();
        assert_eq!(packed.len(), 16);
        assert!(!packed.contains(&9));
    }

    #[test]
    fn test_words_round_trip() {
        let img = RgbaImage::filled(3, 2, [10, 20, 30, 255]);
        let back = RgbaImage::from_words(3, 2, &img.to_words()).unwrap();
        assert_eq!(back, img);
        assert_eq!(img.packed_byte_size(), 24);
    }
}
