//! Page image encoding for the vision model: PNG, base64, `detail: "high"`.
//!
//! PNG is lossless, so small print on invoices survives; JPEG artefacts on
//! digits cost more OCR accuracy than they save in bytes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page as a base64 PNG image attachment.
///
/// Colour is dropped first: scans are usually colour even when the invoice is
/// not, and a single luma channel shrinks the payload a lot.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let gray = DynamicImage::ImageLuma8(img.to_luma8());
    let mut buf = Vec::new();
    gray.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!(
        "Encoded {}x{} page → {} bytes base64",
        img.width(),
        img.height(),
        b64.len()
    );

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encodes_as_grayscale_png() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(12, 8, Rgba([200, 30, 30, 255])));
        let data = encode_page(&img).unwrap();
        assert_eq!(data.mime_type, "image/png");

        let png = STANDARD.decode(&data.data).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (12, 8));
        assert!(matches!(decoded, DynamicImage::ImageLuma8(_)));
    }
}
