//! OCR of single images, with bounding boxes.

use std::{io::Cursor, time::Duration};

use schemars::JsonSchema;

use crate::{prelude::*, quota::MeteredOutput};

pub mod annotate;
pub mod engines;

/// An image loaded into memory, ready to OCR.
#[derive(Clone, Debug)]
pub struct OcrImage {
    /// Where we loaded the image from.
    pub path: PathBuf,

    /// The encoded image.
    pub data: Vec<u8>,

    /// The MIME type, detected from the data.
    pub mime_type: String,

    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,
}

/// Image formats accepted by all our engines.
const SUPPORTED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png"];

impl OcrImage {
    /// Load an image from disk.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read image at path: {:?}", path))?;
        Self::from_bytes(path.to_owned(), data)
    }

    /// Wrap an encoded image, checking its format and reading its size.
    pub fn from_bytes(path: PathBuf, data: Vec<u8>) -> Result<Self> {
        let mime_type = infer::get(&data)
            .map(|kind| kind.mime_type())
            .ok_or_else(|| anyhow!("Cannot determine the type of {:?}", path))?;
        if !SUPPORTED_MIME_TYPES.contains(&mime_type) {
            bail!(
                "Unsupported image type {} for {:?} (expected JPEG or PNG)",
                mime_type,
                path
            );
        }
        let (width, height) = image::ImageReader::new(Cursor::new(&data))
            .with_guessed_format()
            .context("Failed to detect image format")?
            .into_dimensions()
            .with_context(|| format!("Failed to read image dimensions of {:?}", path))?;
        Ok(Self {
            path,
            data,
            mime_type: mime_type.to_owned(),
            width,
            height,
        })
    }
}

/// A point in pixel coordinates.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// An axis-aligned pixel rectangle, clamped to the image.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct Region {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

/// A piece of text found in an image.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Detection {
    /// The recognized text.
    pub text: String,

    /// How sure the engine is, from 0.0 to 1.0.
    pub confidence: f64,

    /// Corners of the text, clockwise from the top left.
    pub bbox: [Point; 4],

    /// The pixels covered by `bbox`.
    pub region: Region,
}

impl Detection {
    /// Create a detection inside an image of the given size.
    pub fn new(
        text: impl Into<String>,
        confidence: f64,
        bbox: [Point; 4],
        width: u32,
        height: u32,
    ) -> Self {
        let region = bounding_region(&bbox, width, height);
        Self {
            text: text.into(),
            confidence,
            bbox,
            region,
        }
    }

    /// Create a detection from an axis-aligned rectangle.
    pub fn from_rect(
        text: impl Into<String>,
        confidence: f64,
        (left, top, right, bottom): (f64, f64, f64, f64),
        width: u32,
        height: u32,
    ) -> Self {
        let bbox = [
            Point { x: left, y: top },
            Point { x: right, y: top },
            Point {
                x: right,
                y: bottom,
            },
            Point { x: left, y: bottom },
        ];
        Self::new(text, confidence, bbox, width, height)
    }
}

/// Compute the pixel rectangle containing `bbox`.
fn bounding_region(bbox: &[Point; 4], width: u32, height: u32) -> Region {
    let clamp = |v: f64, max: u32| -> u32 {
        if v.is_nan() || v <= 0.0 {
            0
        } else if v >= f64::from(max) {
            max
        } else {
            v as u32
        }
    };
    let xs = bbox.iter().map(|p| p.x);
    let ys = bbox.iter().map(|p| p.y);
    Region {
        x_min: clamp(xs.clone().fold(f64::INFINITY, f64::min), width),
        y_min: clamp(ys.clone().fold(f64::INFINITY, f64::min), height),
        x_max: clamp(xs.fold(f64::NEG_INFINITY, f64::max).ceil(), width),
        y_max: clamp(ys.fold(f64::NEG_INFINITY, f64::max).ceil(), height),
    }
}

/// Keep only detections more confident than `threshold`.
pub fn filter_by_confidence(detections: Vec<Detection>, threshold: f64) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence > threshold)
        .collect()
}

/// What an engine found in one image.
#[derive(Clone, Debug, Default)]
pub struct OcrPageOutput {
    /// Everything the engine found, before filtering.
    pub detections: Vec<Detection>,

    /// Billable units consumed. Zero for local engines.
    pub units_consumed: u64,
}

impl MeteredOutput for OcrPageOutput {
    fn units_consumed(&self) -> u64 {
        self.units_consumed
    }
}

/// An output record describing one OCRed image.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct OcrOutput {
    /// The input path.
    pub path: PathBuf,

    /// The engine used.
    pub engine: String,

    /// Image width in pixels.
    pub width: u32,

    /// Image height in pixels.
    pub height: u32,

    /// Detections at or below this confidence were dropped.
    pub threshold: f64,

    /// The detections we kept, in reading order.
    pub detections: Vec<Detection>,

    /// The text of all kept detections, one per line.
    pub text: String,

    /// Billable units consumed by this image.
    pub units_consumed: u64,

    /// Time spent in the OCR engine.
    pub elapsed_secs: f64,

    /// Units used this month after this image, for metered engines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_this_month: Option<u64>,
}

impl OcrOutput {
    /// Build an output record from an engine's results.
    pub fn new(
        image: &OcrImage,
        engine: &str,
        threshold: f64,
        page: OcrPageOutput,
        elapsed: Duration,
    ) -> Self {
        let detections = filter_by_confidence(page.detections, threshold);
        let text = detections
            .iter()
            .map(|d| d.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            path: image.path.clone(),
            engine: engine.to_owned(),
            width: image.width,
            height: image.height,
            threshold,
            detections,
            text,
            units_consumed: page.units_consumed,
            elapsed_secs: elapsed.as_secs_f64(),
            used_this_month: None,
        }
    }
}
