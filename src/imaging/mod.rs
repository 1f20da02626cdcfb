//! DICOM decoding, detection overlay drawing and JPEG/base64 encoding.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::{open_file, DefaultDicomObject};
use dicom_pixeldata::PixelDecoder;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use snafu::{ensure, ResultExt};

use crate::error::{
    ConvertFieldSnafu, DecodePixelDataSnafu, EncodeImageSnafu, Error, MissingAttributeSnafu,
    ReadDicomSnafu, ShortPixelDataSnafu, UnsupportedBitDepthSnafu, UnsupportedSamplesPerPixelSnafu,
};
use crate::inference::Detection;

pub mod font;

/// Box and label color (red, as in the deployed overlay).
pub const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
/// Rectangle border thickness in pixels.
const BOX_THICKNESS: i64 = 2;
/// Vertical gap between the label and the box's top-left corner.
const LABEL_OFFSET: i64 = 10;
/// JPEG quality used for both the inference payload and the response image.
const JPEG_QUALITY: u8 = 90;

/// Decode a DICOM file into an 8-bit RGB image.
///
/// Pixel intensities are min-max normalized across the whole array to the
/// 0-255 range. Single-channel data is replicated into three channels so the
/// drawing stage works uniformly; 3-samples-per-pixel data is taken as
/// interleaved RGB. Multi-frame files contribute their first frame only.
pub fn decode_dicom(path: &Path) -> Result<RgbImage, Error> {
    let obj = open_file(path).context(ReadDicomSnafu)?;

    let rows = read_u16(&obj, tags::ROWS)? as u32;
    let cols = read_u16(&obj, tags::COLUMNS)? as u32;
    let bits_allocated = read_u16_or(&obj, tags::BITS_ALLOCATED, 16);
    let pixel_representation = read_u16_or(&obj, tags::PIXEL_REPRESENTATION, 0);
    let samples_per_pixel = read_u16_or(&obj, tags::SAMPLES_PER_PIXEL, 1);
    let num_frames = obj
        .element(tags::NUMBER_OF_FRAMES)
        .ok()
        .and_then(|e| e.to_int::<u32>().ok())
        .unwrap_or(1);

    // Handles both native and compressed transfer syntaxes.
    let decoded = obj.decode_pixel_data().context(DecodePixelDataSnafu)?;
    let mut raw = decoded.data().to_vec();

    if num_frames > 1 {
        let bytes_per_sample = (bits_allocated / 8).max(1) as usize;
        let frame_size =
            rows as usize * cols as usize * samples_per_pixel as usize * bytes_per_sample;
        ensure!(raw.len() >= frame_size, ShortPixelDataSnafu);
        raw.truncate(frame_size);
    }

    let samples = samples_to_f64(&raw, bits_allocated, pixel_representation)?;
    normalize_to_rgb(&samples, cols, rows, samples_per_pixel)
}

fn read_u16(obj: &DefaultDicomObject, tag: Tag) -> Result<u16, Error> {
    obj.element(tag)
        .context(MissingAttributeSnafu { tag })?
        .to_int::<u16>()
        .context(ConvertFieldSnafu { tag })
}

fn read_u16_or(obj: &DefaultDicomObject, tag: Tag, default: u16) -> u16 {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_int::<u16>().ok())
        .unwrap_or(default)
}

fn samples_to_f64(
    raw: &[u8],
    bits_allocated: u16,
    pixel_representation: u16,
) -> Result<Vec<f64>, Error> {
    match bits_allocated {
        8 => Ok(raw.iter().map(|&v| v as f64).collect()),
        16 => {
            let chunks = raw.chunks_exact(2);
            if pixel_representation == 0 {
                Ok(chunks
                    .map(|c| u16::from_le_bytes([c[0], c[1]]) as f64)
                    .collect())
            } else {
                Ok(chunks
                    .map(|c| i16::from_le_bytes([c[0], c[1]]) as f64)
                    .collect())
            }
        }
        bits => UnsupportedBitDepthSnafu { bits }.fail(),
    }
}

fn normalize_to_rgb(
    samples: &[f64],
    cols: u32,
    rows: u32,
    samples_per_pixel: u16,
) -> Result<RgbImage, Error> {
    let expected = rows as usize * cols as usize * samples_per_pixel as usize;
    ensure!(expected > 0 && samples.len() >= expected, ShortPixelDataSnafu);

    let min = samples[..expected]
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min);
    let max = samples[..expected]
        .iter()
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max);
    // Constant arrays map to zero instead of dividing by zero.
    let range = if (max - min).abs() < 1e-6 {
        1.0
    } else {
        max - min
    };
    let scale = |v: f64| (((v - min) / range) * 255.0).clamp(0.0, 255.0) as u8;

    match samples_per_pixel {
        1 => Ok(RgbImage::from_fn(cols, rows, |x, y| {
            let gray = scale(samples[(y * cols + x) as usize]);
            Rgb([gray, gray, gray])
        })),
        3 => Ok(RgbImage::from_fn(cols, rows, |x, y| {
            let i = ((y * cols + x) * 3) as usize;
            Rgb([scale(samples[i]), scale(samples[i + 1]), scale(samples[i + 2])])
        })),
        spp => UnsupportedSamplesPerPixelSnafu { samples: spp }.fail(),
    }
}

/// Axis-aligned box corners from a detection's center and size,
/// with integer truncation.
pub fn bounding_box(det: &Detection) -> (i64, i64, i64, i64) {
    let (x, y) = (det.x as i64, det.y as i64);
    let (w, h) = (det.width as i64, det.height as i64);
    (x - w / 2, y - h / 2, x + w / 2, y + h / 2)
}

/// Draw every detection's rectangle and class label on a copy of the image.
///
/// Drawing follows the order detections were returned; overlapping boxes
/// overdraw. Boxes partially outside the image are clipped.
pub fn draw_detections(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut out = image.clone();
    for det in detections {
        let (x1, y1, x2, y2) = bounding_box(det);
        draw_box(&mut out, x1, y1, x2, y2);
        draw_label(&mut out, &det.class_name, x1, y1 - LABEL_OFFSET);
    }
    out
}

fn draw_box(image: &mut RgbImage, x1: i64, y1: i64, x2: i64, y2: i64) {
    for inset in 0..BOX_THICKNESS {
        let width = x2 - x1 + 1 - 2 * inset;
        let height = y2 - y1 + 1 - 2 * inset;
        if width <= 0 || height <= 0 {
            break;
        }
        let rect =
            Rect::at((x1 + inset) as i32, (y1 + inset) as i32).of_size(width as u32, height as u32);
        draw_hollow_rect_mut(image, rect, BOX_COLOR);
    }
}

fn draw_label(image: &mut RgbImage, text: &str, x: i64, y: i64) {
    let (width, height) = (image.width() as i64, image.height() as i64);
    let mut cursor = x;
    for c in text.chars() {
        if let Some(rows) = font::glyph(c) {
            for gy in 0..font::GLYPH_HEIGHT {
                for gx in 0..font::GLYPH_WIDTH {
                    if !font::is_set(&rows, gx, gy) {
                        continue;
                    }
                    let px = cursor + gx as i64;
                    let py = y + gy as i64;
                    if px >= 0 && py >= 0 && px < width && py < height {
                        image.put_pixel(px as u32, py as u32, BOX_COLOR);
                    }
                }
            }
        }
        cursor += font::ADVANCE as i64;
    }
}

/// Encode an RGB image as JPEG bytes.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, Error> {
    let mut output = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut output, JPEG_QUALITY);
    encoder
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgb8,
        )
        .context(EncodeImageSnafu)?;
    Ok(output)
}

/// Standard base64 without line wrapping, as expected by browser `data:` URLs.
pub fn to_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}
