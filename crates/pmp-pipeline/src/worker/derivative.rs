//! Image validation and rendition encoding
//!
//! Pure CPU work on in-memory buffers. The processor runs it on the blocking
//! thread pool.

use image::{imageops::FilterType, DynamicImage, ImageFormat, ImageReader};
use pmp_common::checksum::{digest, Digest};
use pmp_common::{DerivativeKind, Renditions};
use std::io::Cursor;

use crate::error::{PipelineError, PipelineResult};

/// Size and quality targets for each rendition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivativeSettings {
    pub min_dimension: u32,
    pub max_dimension: u32,
    /// Edge of the square, cover-cropped thumbnail
    pub thumb_size: u32,
    pub thumb_quality: f32,
    pub gallery_max_width: u32,
    pub gallery_quality: u8,
    pub pdf_max_width: u32,
    pub pdf_quality: u8,
}

impl Default for DerivativeSettings {
    fn default() -> Self {
        Self {
            min_dimension: 100,
            max_dimension: 8000,
            thumb_size: 150,
            thumb_quality: 60.0,
            gallery_max_width: 1280,
            gallery_quality: 80,
            pdf_max_width: 960,
            pdf_quality: 75,
        }
    }
}

/// Header facts about an accepted original
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct Rendition {
    pub kind: DerivativeKind,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub digest: Digest,
}

#[derive(Debug, Clone)]
pub struct GeneratedDerivatives {
    pub info: ImageInfo,
    pub original: Digest,
    pub renditions: Renditions<Rendition>,
}

const ACCEPTED_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Tiff,
];

fn reader(bytes: &[u8]) -> PipelineResult<ImageReader<Cursor<&[u8]>>> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PipelineError::validation(format!("Invalid image data: {e}")))
}

/// Check format and dimensions from the header without decoding pixels
pub fn validate_image(bytes: &[u8], settings: &DerivativeSettings) -> PipelineResult<ImageInfo> {
    if bytes.is_empty() {
        return Err(PipelineError::validation("Invalid image data: empty buffer"));
    }

    let reader = reader(bytes)?;
    let format = reader.format().ok_or_else(|| {
        PipelineError::validation("Invalid image data: unrecognized image format")
    })?;
    if !ACCEPTED_FORMATS.contains(&format) {
        return Err(PipelineError::validation(format!(
            "Unsupported image format: {}",
            format_name(format)
        )));
    }

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| PipelineError::validation(format!("Invalid image data: {e}")))?;

    if width < settings.min_dimension || height < settings.min_dimension {
        return Err(PipelineError::validation(format!(
            "Image too small (min {0}x{0}px)",
            settings.min_dimension
        )));
    }
    if width > settings.max_dimension || height > settings.max_dimension {
        return Err(PipelineError::validation(format!(
            "Image too large (max {0}x{0}px)",
            settings.max_dimension
        )));
    }

    Ok(ImageInfo {
        format,
        width,
        height,
    })
}

fn format_name(format: ImageFormat) -> String {
    format
        .extensions_str()
        .first()
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| format!("{format:?}").to_lowercase())
}

/// Validate `bytes` and produce the thumb, gallery and pdf renditions
pub fn generate_derivatives(
    bytes: &[u8],
    settings: &DerivativeSettings,
) -> PipelineResult<GeneratedDerivatives> {
    let info = validate_image(bytes, settings)?;
    let original = digest(bytes);

    let image = reader(bytes)?
        .decode()
        .map_err(|e| PipelineError::validation(format!("Invalid image data: {e}")))?;

    let thumb = encode_thumb(&image, settings)?;
    let gallery = encode_jpeg(
        &image,
        DerivativeKind::Gallery,
        settings.gallery_max_width,
        settings.gallery_quality,
        true,
    )?;
    let pdf = encode_jpeg(
        &image,
        DerivativeKind::Pdf,
        settings.pdf_max_width,
        settings.pdf_quality,
        false,
    )?;

    // The document renderer only reads baseline JPEG.
    if jpeg_is_progressive(&pdf.bytes) != Some(false) {
        return Err(PipelineError::Validation(
            "pdf rendition is not a baseline JPEG".to_string(),
        ));
    }

    Ok(GeneratedDerivatives {
        info,
        original,
        renditions: Renditions {
            thumb,
            gallery,
            pdf,
        },
    })
}

fn encode_thumb(image: &DynamicImage, settings: &DerivativeSettings) -> PipelineResult<Rendition> {
    let size = settings.thumb_size;
    let rgb = image.resize_to_fill(size, size, FilterType::Lanczos3).to_rgb8();
    let (width, height) = rgb.dimensions();

    let bytes = webp::Encoder::from_rgb(rgb.as_raw(), width, height)
        .encode(settings.thumb_quality)
        .to_vec();

    Ok(rendition(DerivativeKind::Thumb, bytes, width, height))
}

/// Width-bounded JPEG, never upscaled
fn encode_jpeg(
    image: &DynamicImage,
    kind: DerivativeKind,
    max_width: u32,
    quality: u8,
    progressive: bool,
) -> PipelineResult<Rendition> {
    let (width, height) = scaled_dimensions(image.width(), image.height(), max_width);
    let rgb = if width == image.width() {
        image.to_rgb8()
    } else {
        image.resize_exact(width, height, FilterType::Lanczos3).to_rgb8()
    };

    let (w, h) = (u16::try_from(width), u16::try_from(height));
    let (Ok(w), Ok(h)) = (w, h) else {
        return Err(PipelineError::validation(format!(
            "{kind} rendition too large for JPEG: {width}x{height}"
        )));
    };

    let mut bytes = Vec::new();
    let mut encoder = jpeg_encoder::Encoder::new(&mut bytes, quality);
    encoder.set_progressive(progressive);
    encoder
        .encode(rgb.as_raw(), w, h, jpeg_encoder::ColorType::Rgb)
        .map_err(|e| PipelineError::validation(format!("Failed to encode {kind} JPEG: {e}")))?;

    Ok(rendition(kind, bytes, width, height))
}

fn rendition(kind: DerivativeKind, bytes: Vec<u8>, width: u32, height: u32) -> Rendition {
    Rendition {
        kind,
        digest: digest(&bytes),
        bytes,
        width,
        height,
    }
}

/// Aspect-preserving fit to `max_width`
pub fn scaled_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width {
        return (width, height);
    }
    let scaled = (u64::from(height) * u64::from(max_width) + u64::from(width) / 2) / u64::from(width);
    (max_width, scaled.max(1) as u32)
}

/// Whether a JPEG's frame header is progressive
///
/// Walks marker segments up to the first SOF. `None` when the buffer is not a
/// JPEG or has no frame header before the scan data.
pub fn jpeg_is_progressive(bytes: &[u8]) -> Option<bool> {
    if bytes.get(..2)? != [0xFF, 0xD8] {
        return None;
    }

    let mut pos = 2;
    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xFF {
            return None;
        }
        let marker = bytes[pos + 1];
        match marker {
            // fill byte
            0xFF => {
                pos += 1;
                continue;
            },
            0xC0 | 0xC1 | 0xC3 => return Some(false),
            0xC2 | 0xC6 | 0xCA | 0xCE => return Some(true),
            // start of scan without a frame header
            0xDA => return None,
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            },
            _ => {},
        }
        let len = usize::from(u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]));
        pos += 2 + len;
    }
    None
}
