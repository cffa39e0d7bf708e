use crate::render::RenderError;
use image::{load_from_memory, DynamicImage};
use png::{BitDepth as PngBitDepth, ColorType as PngColorType, Encoder as PngEncoder};

/// Re-encodes converter output as an opaque 8-bit RGB PNG.
///
/// Converters embed timestamps and other ancillary chunks; decoding to pixels
/// and re-encoding drops them, so equal inputs hash equal.
pub fn normalize_png(bytes: &[u8]) -> Result<Vec<u8>, RenderError> {
    let img = load_from_memory(bytes).map_err(|e| RenderError::Encoding(e.to_string()))?;

    // Flatten alpha over white; chat clients render transparency as black.
    let rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    let mut background = image::RgbaImage::from_pixel(w, h, image::Rgba([255, 255, 255, 255]));
    image::imageops::overlay(&mut background, &rgba, 0, 0);
    let raw = DynamicImage::ImageRgba8(background).to_rgb8().into_raw();

    let mut out = Vec::new();
    {
        let mut encoder = PngEncoder::new(&mut out, w, h);
        encoder.set_color(PngColorType::Rgb);
        encoder.set_depth(PngBitDepth::Eight);
        let mut writer = encoder
            .write_header()
            .map_err(|e| RenderError::Encoding(e.to_string()))?;
        writer
            .write_image_data(&raw)
            .map_err(|e| RenderError::Encoding(e.to_string()))?;
    }
    Ok(out)
}

/// Hex md5 of the normalised bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}
