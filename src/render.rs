//! Decoding, windowing and PNG encoding of stored instances.
//!
//! Output bytes are stable for a fixed input and parameter set: the PNG
//! encoder runs with pinned compression and filter options and embeds no
//! timestamps, which is what makes content-addressed caching sound.

use dicom::dictionary_std::tags;
use dicom::object::DefaultDicomObject;
use dicom_pixeldata::PixelDecoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType as ResizeFilter;
use image::{ExtendedColorType, GrayImage, ImageEncoder, RgbImage};

use crate::error::RenderError;
use crate::metadata_index::InstanceFull;

/// An effective display window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSpec {
    pub center: f64,
    pub width: f64,
}

/// How to turn stored pixel values into an 8-bit raster.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderParams {
    /// Explicit window override; `None` falls back to the instance's first
    /// VOI window, then to pixel statistics.
    pub window: Option<WindowSpec>,
    /// Additional inversion on top of the photometric interpretation.
    pub invert: bool,
    /// Downsample so the longer edge does not exceed this many pixels.
    pub long_edge: Option<u32>,
}

/// A finished render.
#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub grayscale: bool,
    /// The window that was applied, when one was.
    pub window: Option<WindowSpec>,
}

/// Parse a stored object, with or without the 128-byte preamble.
pub fn parse_part10(bytes: &[u8]) -> Result<DefaultDicomObject, RenderError> {
    let stream = if bytes.len() > 132 && &bytes[128..132] == b"DICM" {
        &bytes[128..]
    } else {
        bytes
    };
    dicom::object::from_reader(stream).map_err(|e| RenderError::Decode(e.to_string()))
}

/// Render one stored instance to PNG.
pub fn render_instance(
    bytes: &[u8],
    meta: &InstanceFull,
    params: &RenderParams,
) -> Result<RenderedImage, RenderError> {
    let obj = parse_part10(bytes)?;
    let photometric = meta
        .photometric
        .as_deref()
        .unwrap_or("MONOCHROME2")
        .trim()
        .to_ascii_uppercase();
    if photometric.starts_with("MONOCHROME") {
        render_monochrome(&obj, meta, params, &photometric)
    } else {
        render_color(&obj, params)
    }
}

fn render_monochrome(
    obj: &DefaultDicomObject,
    meta: &InstanceFull,
    params: &RenderParams,
    photometric: &str,
) -> Result<RenderedImage, RenderError> {
    let decoded = obj
        .decode_pixel_data()
        .map_err(|e| RenderError::Decode(e.to_string()))?;
    let rows = u32::try_from(meta.rows).map_err(|_| RenderError::Unsupported("image height"))?;
    let columns =
        u32::try_from(meta.columns).map_err(|_| RenderError::Unsupported("image width"))?;
    let samples = stored_values(decoded.data(), meta, rows as usize * columns as usize)?;

    let window = params
        .window
        .or_else(|| instance_window(meta))
        .unwrap_or_else(|| statistics_window(&samples));
    let invert = (photometric == "MONOCHROME1") ^ params.invert;

    let mapped: Vec<u8> = samples
        .iter()
        .map(|&v| window_u8(v, window.center, window.width, invert))
        .collect();
    let img = GrayImage::from_raw(columns, rows, mapped)
        .ok_or(RenderError::Unsupported("pixel buffer shorter than Rows x Columns"))?;
    let img = match params.long_edge {
        Some(edge) => downsample_gray(img, edge),
        None => img,
    };
    Ok(RenderedImage {
        width: img.width(),
        height: img.height(),
        png: encode_png(img.as_raw(), img.width(), img.height(), ExtendedColorType::L8)?,
        grayscale: true,
        window: Some(window),
    })
}

fn render_color(
    obj: &DefaultDicomObject,
    params: &RenderParams,
) -> Result<RenderedImage, RenderError> {
    // Only interleaved RGB is served; planar colour is not decoded.
    let planar = obj
        .element(tags::PLANAR_CONFIGURATION)
        .ok()
        .and_then(|e| e.to_int::<i64>().ok());
    if planar == Some(1) {
        return Err(RenderError::Unsupported("planar colour pixel data"));
    }
    let decoded = obj
        .decode_pixel_data()
        .map_err(|e| RenderError::Decode(e.to_string()))?;
    let dynamic = decoded
        .to_dynamic_image(0)
        .map_err(|e| RenderError::Decode(e.to_string()))?;
    let rgb: RgbImage = dynamic.to_rgb8();
    let rgb = match params.long_edge {
        Some(edge) => downsample_rgb(rgb, edge),
        None => rgb,
    };
    Ok(RenderedImage {
        width: rgb.width(),
        height: rgb.height(),
        png: encode_png(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)?,
        grayscale: false,
        window: None,
    })
}

/// Frame 0 of the decoded buffer as rescaled stored values.
fn stored_values(raw: &[u8], meta: &InstanceFull, n: usize) -> Result<Vec<f64>, RenderError> {
    let bits = meta.bits_allocated.unwrap_or(16);
    let signed = meta.pixel_representation == Some(1);
    let slope = meta.rescale_slope.unwrap_or(1.0);
    let intercept = meta.rescale_intercept.unwrap_or(0.0);
    let values: Vec<f64> = match bits {
        8 => {
            if raw.len() < n {
                return Err(RenderError::Decode("pixel data shorter than Rows x Columns".into()));
            }
            raw[..n].iter().map(|&b| f64::from(b)).collect()
        }
        16 => {
            if raw.len() < n * 2 {
                return Err(RenderError::Decode("pixel data shorter than Rows x Columns".into()));
            }
            raw[..n * 2]
                .chunks_exact(2)
                .map(|pair| {
                    let word = u16::from_le_bytes([pair[0], pair[1]]);
                    if signed {
                        f64::from(word as i16)
                    } else {
                        f64::from(word)
                    }
                })
                .collect()
        }
        _ => return Err(RenderError::Unsupported("bits allocated other than 8 or 16")),
    };
    Ok(values.into_iter().map(|v| v * slope + intercept).collect())
}

/// The instance's first VOI window, when it carries a usable one.
fn instance_window(meta: &InstanceFull) -> Option<WindowSpec> {
    match (meta.window_center, meta.window_width) {
        (Some(center), Some(width)) if width >= 1.0 => Some(WindowSpec { center, width }),
        _ => None,
    }
}

/// Fallback window derived from pixel statistics.
fn statistics_window(samples: &[f64]) -> WindowSpec {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in samples {
        min = min.min(v);
        max = max.max(v);
    }
    if !min.is_finite() || !max.is_finite() {
        return WindowSpec { center: 128.0, width: 256.0 };
    }
    WindowSpec {
        center: (min + max) / 2.0,
        width: (max - min).max(1.0),
    }
}

/// Map one rescaled stored value through the linear VOI function.
fn window_u8(v: f64, center: f64, width: f64, invert: bool) -> u8 {
    let y = if width <= 1.0 {
        // Degenerate window: threshold at the center.
        if v <= center - 0.5 {
            0.0
        } else {
            1.0
        }
    } else {
        (((v - (center - 0.5)) / (width - 1.0)) + 0.5).clamp(0.0, 1.0)
    };
    let y = if invert { 1.0 - y } else { y };
    (y * 255.0).round() as u8
}

fn downsample_gray(img: GrayImage, edge: u32) -> GrayImage {
    match scaled_dimensions(img.width(), img.height(), edge) {
        Some((w, h)) => image::imageops::resize(&img, w, h, ResizeFilter::Triangle),
        None => img,
    }
}

fn downsample_rgb(img: RgbImage, edge: u32) -> RgbImage {
    match scaled_dimensions(img.width(), img.height(), edge) {
        Some((w, h)) => image::imageops::resize(&img, w, h, ResizeFilter::Triangle),
        None => img,
    }
}

/// Target dimensions for an area-averaged downsample to `edge`, or `None`
/// when the image already fits.
fn scaled_dimensions(width: u32, height: u32, edge: u32) -> Option<(u32, u32)> {
    let long = width.max(height);
    if long <= edge || edge == 0 {
        return None;
    }
    let scale = f64::from(edge) / f64::from(long);
    let w = ((f64::from(width) * scale).round() as u32).max(1);
    let h = ((f64::from(height) * scale).round() as u32).max(1);
    Some((w, h))
}

fn encode_png(
    raw: &[u8],
    width: u32,
    height: u32,
    color: ExtendedColorType,
) -> Result<Vec<u8>, RenderError> {
    let mut out = Vec::new();
    // Pinned options keep the output byte-stable across runs.
    let encoder =
        PngEncoder::new_with_quality(&mut out, CompressionType::Default, PngFilter::NoFilter);
    encoder
        .write_image(raw, width, height, color)
        .map_err(|e| RenderError::Encode(e.to_string()))?;
    Ok(out)
}
