//! Framebuffer pixel values and their wire encodings.

/// One framebuffer pixel; channels are normalized to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pixel {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub w: f32,
}

impl Pixel {
    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b, w: 0.0 }
    }

    pub const fn rgbw(r: f32, g: f32, b: f32, w: f32) -> Self {
        Self { r, g, b, w }
    }
}

/// Wire pixel formats a node may subscribe with.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb = 0,
    Rgbw = 1,
}

impl PixelFormat {
    /// Returns `None` for formats this server cannot produce.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PixelFormat::Rgb),
            1 => Some(PixelFormat::Rgbw),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Rgbw => 4,
        }
    }
}

fn quantize(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Appends `pixels` to `out` in the requested wire format, one output pixel per input.
pub fn encode_pixels(pixels: &[Pixel], format: PixelFormat, out: &mut Vec<u8>) {
    out.reserve(pixels.len() * format.bytes_per_pixel());
    for pixel in pixels {
        out.push(quantize(pixel.r));
        out.push(quantize(pixel.g));
        out.push(quantize(pixel.b));
        if format == PixelFormat::Rgbw {
            out.push(quantize(pixel.w));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_drops_white_channel() {
        let mut out = Vec::new();
        encode_pixels(&[Pixel::rgbw(1.0, 0.0, 0.5, 1.0)], PixelFormat::Rgb, &mut out);
        assert_eq!(out, vec![255, 0, 128]);
    }

    #[test]
    fn rgbw_keeps_four_channels() {
        let mut out = Vec::new();
        encode_pixels(
            &[Pixel::rgbw(0.0, 1.0, 0.0, 0.25), Pixel::rgb(1.0, 1.0, 1.0)],
            PixelFormat::Rgbw,
            &mut out,
        );
        assert_eq!(out, vec![0, 255, 0, 64, 255, 255, 255, 0]);
    }

    #[test]
    fn out_of_range_values_saturate() {
        let mut out = Vec::new();
        encode_pixels(&[Pixel::rgb(-3.0, 7.0, f32::NAN)], PixelFormat::Rgb, &mut out);
        assert_eq!(out, vec![0, 255, 0]);
    }

    #[test]
    fn unknown_format_codes_are_unsupported() {
        assert_eq!(PixelFormat::from_u8(1), Some(PixelFormat::Rgbw));
        assert_eq!(PixelFormat::from_u8(7), None);
    }
}
