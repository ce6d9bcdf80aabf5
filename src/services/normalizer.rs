use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use std::io::Cursor;
use tracing::warn;

const QUALITY_FLOOR: u8 = 40;
const QUALITY_STEP: u8 = 15;

#[derive(Debug, Clone)]
pub struct NormalizeConstraints {
    pub max_bytes: usize,
    pub min_dim: u32,
    pub max_dim: u32,
    pub quality: u8,
    pub enhance: bool,
}

impl Default for NormalizeConstraints {
    fn default() -> Self {
        // 4 MiB keeps the base64 payload under the model's request ceiling.
        NormalizeConstraints {
            max_bytes: 4 * 1024 * 1024,
            min_dim: 800,
            max_dim: 1600,
            quality: 85,
            enhance: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub media_type: &'static str,
    /// Input could not be decoded; `bytes` are the original, untouched.
    pub passthrough: bool,
}

/// Re-encode an image for extraction: longest edge bounded to
/// `[min_dim, max_dim]`, optional OCR enhancement passes, then a
/// lossless-first encoding ladder under `max_bytes`. Always returns some
/// bytes; an over-budget result after the final rung is returned as-is.
pub fn normalize(input: &[u8], constraints: &NormalizeConstraints) -> NormalizedImage {
    let decoded = match image::load_from_memory(input) {
        Ok(img) => img,
        Err(err) => {
            warn!("image decode failed, passing original through: {}", err);
            return NormalizedImage {
                bytes: input.to_vec(),
                media_type: sniff_media_type(input),
                passthrough: true,
            };
        }
    };

    let mut img = fit_to_bounds(decoded, constraints.min_dim, constraints.max_dim);
    if constraints.enhance {
        img = enhance_for_ocr(&img);
    }

    // Lossless first.
    if let Some(png) = encode_png(&img) {
        if png.len() <= constraints.max_bytes {
            return NormalizedImage {
                bytes: png,
                media_type: "image/png",
                passthrough: false,
            };
        }
    }

    // Lossy ladder down to the quality floor.
    let mut quality = constraints.quality.max(QUALITY_FLOOR);
    let mut last_jpeg = None;
    loop {
        if let Some(jpeg) = encode_jpeg(&img, quality) {
            if jpeg.len() <= constraints.max_bytes {
                return NormalizedImage {
                    bytes: jpeg,
                    media_type: "image/jpeg",
                    passthrough: false,
                };
            }
            last_jpeg = Some(jpeg);
        }
        if quality <= QUALITY_FLOOR {
            break;
        }
        quality = quality.saturating_sub(QUALITY_STEP).max(QUALITY_FLOOR);
    }

    // Final rung: shrink dimensions once more and take whatever comes out.
    let (width, height) = img.dimensions();
    let longest = width.max(height);
    let target = if longest > constraints.min_dim {
        constraints.min_dim
    } else {
        (longest * 7 / 10).max(1)
    };
    let shrunk = scale_to_edge(&img, target);
    if let Some(jpeg) = encode_jpeg(&shrunk, QUALITY_FLOOR) {
        return NormalizedImage {
            bytes: jpeg,
            media_type: "image/jpeg",
            passthrough: false,
        };
    }

    match last_jpeg.or_else(|| encode_png(&img)) {
        Some(bytes) => {
            let media_type = if bytes.starts_with(&[0x89, b'P']) {
                "image/png"
            } else {
                "image/jpeg"
            };
            NormalizedImage {
                bytes,
                media_type,
                passthrough: false,
            }
        }
        None => NormalizedImage {
            bytes: input.to_vec(),
            media_type: sniff_media_type(input),
            passthrough: true,
        },
    }
}

/// Scale so the longest edge lands inside `[min_dim, max_dim]`, preserving
/// aspect ratio. Small scans are upscaled: character strokes below ~800px
/// transcribe measurably worse.
fn fit_to_bounds(img: DynamicImage, min_dim: u32, max_dim: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    let longest = width.max(height);

    if longest < min_dim {
        scale_to_edge(&img, min_dim)
    } else if longest > max_dim {
        scale_to_edge(&img, max_dim)
    } else {
        img
    }
}

fn scale_to_edge(img: &DynamicImage, edge: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    let longest = width.max(height).max(1);
    let scale = edge as f32 / longest as f32;
    let target_width = ((width as f32 * scale).round() as u32).max(1);
    let target_height = ((height as f32 * scale).round() as u32).max(1);
    img.resize_exact(target_width, target_height, FilterType::CatmullRom)
}

/// Pixel-to-pixel passes: grayscale, contrast stretch, light sharpen.
/// Deterministic for identical input and parameters.
fn enhance_for_ocr(img: &DynamicImage) -> DynamicImage {
    img.grayscale().adjust_contrast(25.0).unsharpen(1.2, 4)
}

fn encode_png(img: &DynamicImage) -> Option<Vec<u8>> {
    let mut buffer = Vec::new();
    match img.write_to(&mut Cursor::new(&mut buffer), ImageOutputFormat::Png) {
        Ok(()) => Some(buffer),
        Err(err) => {
            warn!("png encode failed: {}", err);
            None
        }
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Option<Vec<u8>> {
    let mut buffer = Vec::new();
    let rgb = img.to_rgb8();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    match encoder.encode_image(&rgb) {
        Ok(()) => Some(buffer),
        Err(err) => {
            warn!("jpeg encode failed at quality {}: {}", quality, err);
            None
        }
    }
}

fn sniff_media_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else {
        "image/jpeg"
    }
}
