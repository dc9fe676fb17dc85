#![cfg_attr(docsrs, feature(doc_cfg))]
//! Pixel format identifiers and helpers.
//!
//! Pixel formats are opaque 32-bit codes. Bits 16..23 encode the number of
//! bits per pixel; the low bits identify the vendor-defined layout. The
//! bit-per-pixel field is all the streaming layer needs to size receive
//! buffers.

/// Opaque 32-bit pixel format identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    /// Return the raw 32-bit code.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Number of bits used to store one pixel (bits 16..23 of the code).
    pub const fn bits_per_pixel(self) -> u32 {
        (self.0 >> 16) & 0xFF
    }

    /// Size in bytes of an image of the given dimensions in this format.
    ///
    /// Rounds up so that sub-byte formats over odd widths are not
    /// undersized.
    pub const fn image_size(self, width: u32, height: u32) -> usize {
        let bits = width as u64 * height as u64 * self.bits_per_pixel() as u64;
        ((bits + 7) / 8) as usize
    }
}

impl From<u32> for PixelFormat {
    fn from(raw: u32) -> Self {
        PixelFormat(raw)
    }
}

/// Common pixel format codes.
pub mod formats {
    use super::PixelFormat;

    pub const MONO_8: PixelFormat = PixelFormat(0x0108_0001);
    pub const MONO_10: PixelFormat = PixelFormat(0x0110_0003);
    pub const MONO_12: PixelFormat = PixelFormat(0x0110_0005);
    pub const MONO_12_PACKED: PixelFormat = PixelFormat(0x010C_0006);
    pub const MONO_16: PixelFormat = PixelFormat(0x0110_0007);
    pub const BAYER_GR_8: PixelFormat = PixelFormat(0x0108_0008);
    pub const BAYER_RG_8: PixelFormat = PixelFormat(0x0108_0009);
    pub const BAYER_GB_8: PixelFormat = PixelFormat(0x0108_000A);
    pub const BAYER_BG_8: PixelFormat = PixelFormat(0x0108_000B);
    pub const RGB_8: PixelFormat = PixelFormat(0x0218_0014);
    pub const BGR_8: PixelFormat = PixelFormat(0x0218_0015);
    pub const YUV_422_8: PixelFormat = PixelFormat(0x0210_0032);
}

/// Human readable name for a known pixel format code.
pub fn format_name(format: PixelFormat) -> Option<&'static str> {
    use formats::*;
    Some(match format {
        MONO_8 => "Mono8",
        MONO_10 => "Mono10",
        MONO_12 => "Mono12",
        MONO_12_PACKED => "Mono12Packed",
        MONO_16 => "Mono16",
        BAYER_GR_8 => "BayerGR8",
        BAYER_RG_8 => "BayerRG8",
        BAYER_GB_8 => "BayerGB8",
        BAYER_BG_8 => "BayerBG8",
        RGB_8 => "RGB8",
        BGR_8 => "BGR8",
        YUV_422_8 => "YUV422_8",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_per_pixel_field() {
        assert_eq!(formats::MONO_8.bits_per_pixel(), 8);
        assert_eq!(formats::MONO_12_PACKED.bits_per_pixel(), 12);
        assert_eq!(formats::RGB_8.bits_per_pixel(), 24);
    }

    #[test]
    fn image_size_rounds_up() {
        assert_eq!(formats::MONO_8.image_size(640, 480), 640 * 480);
        assert_eq!(formats::RGB_8.image_size(2, 2), 12);
        // 5 pixels of 12 bits = 60 bits = 7.5 bytes, rounded up to 8.
        assert_eq!(formats::MONO_12_PACKED.image_size(5, 1), 8);
    }

    #[test]
    fn known_names() {
        assert_eq!(format_name(formats::MONO_8), Some("Mono8"));
        assert_eq!(format_name(PixelFormat(0x1234_5678)), None);
    }
}
