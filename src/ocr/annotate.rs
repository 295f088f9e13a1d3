//! Drawing detections on top of the original image, and cutting them out.

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage, imageops};
use imageproc::drawing::{draw_line_segment_mut, draw_text_mut, text_size};

use crate::prelude::*;

use super::{Detection, OcrImage, Point};

/// Outline and label color for detections.
const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Outline thickness in pixels.
const BOX_THICKNESS: u8 = 2;

/// Label height in pixels.
const LABEL_SCALE: f32 = 16.0;

/// Gap between a label and the top of its box.
const LABEL_GAP: i32 = 10;

/// Places we look for a label font when none is given.
const SYSTEM_FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// A TrueType or OpenType font for drawing detection labels.
pub struct LabelFont {
    font: FontVec,
}

impl LabelFont {
    /// Load a font file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read font at path: {:?}", path))?;
        let font = FontVec::try_from_vec(data)
            .map_err(|err| anyhow!("Failed to parse font {:?}: {}", path, err))?;
        Ok(Self { font })
    }

    /// Look for a common sans-serif font installed on this system.
    pub fn find_system() -> Option<Self> {
        SYSTEM_FONT_PATHS.iter().find_map(|path| {
            let path = Path::new(path);
            if !path.exists() {
                return None;
            }
            match Self::load(path) {
                Ok(font) => {
                    debug!(path = %path.display(), "Using system label font");
                    Some(font)
                }
                Err(err) => {
                    debug!(path = %path.display(), "Skipping unusable font: {err:#}");
                    None
                }
            }
        })
    }
}

/// Decode `image` into RGB pixels.
fn decode(image: &OcrImage) -> Result<RgbImage> {
    Ok(image::load_from_memory(&image.data)
        .with_context(|| format!("Failed to decode {:?}", image.path))?
        .to_rgb8())
}

/// Draw an outline around each detection, labelled with its text and
/// confidence if we have a font, and save the result to `out_path`. The
/// output format is chosen from the file extension.
#[instrument(level = "debug", skip_all, fields(out = %out_path.display()))]
pub fn write_annotated(
    image: &OcrImage,
    detections: &[Detection],
    font: Option<&LabelFont>,
    out_path: &Path,
) -> Result<()> {
    let mut canvas = decode(image)?;
    draw_detections(&mut canvas, detections, font);
    canvas
        .save(out_path)
        .with_context(|| format!("Failed to write annotated image to {:?}", out_path))?;
    debug!(count = detections.len(), "Wrote annotated image");
    Ok(())
}

/// Draw `detections` onto `canvas`.
pub fn draw_detections(canvas: &mut RgbImage, detections: &[Detection], font: Option<&LabelFont>) {
    for detection in detections {
        draw_outline(canvas, &detection.bbox);
        if let Some(font) = font {
            draw_label(canvas, font, detection);
        }
    }
}

/// The label drawn above a detection.
pub fn label_text(detection: &Detection) -> String {
    format!("{} ({:.2})", detection.text, detection.confidence)
}

/// Draw a closed outline through `corners`, `BOX_THICKNESS` pixels wide.
/// Anything outside the canvas is clipped.
fn draw_outline(canvas: &mut RgbImage, corners: &[Point; 4]) {
    for offset in 0..BOX_THICKNESS {
        let offset = f32::from(offset);
        for (i, from) in corners.iter().enumerate() {
            let to = &corners[(i + 1) % corners.len()];
            let start = (from.x as f32 + offset, from.y as f32 + offset);
            let end = (to.x as f32 + offset, to.y as f32 + offset);
            draw_line_segment_mut(canvas, start, end, BOX_COLOR);
        }
    }
}

/// Draw the label for `detection` just above its first corner, or inside the
/// top of the image if there's no room above.
fn draw_label(canvas: &mut RgbImage, font: &LabelFont, detection: &Detection) {
    let text = label_text(detection);
    let scale = PxScale::from(LABEL_SCALE);
    let (_, height) = text_size(scale, &font.font, &text);
    let top_left = &detection.bbox[0];
    let x = top_left.x.round() as i32;
    let y = (top_left.y.round() as i32 - LABEL_GAP - height as i32).max(0);
    draw_text_mut(canvas, BOX_COLOR, x, y, scale, &font.font, &text);
}

/// Save each detection's region of `image` as a separate PNG in `dir`,
/// named `{stem}-{n}.png` with `n` counting from 1. Empty regions are
/// skipped. Returns the paths written.
#[instrument(level = "debug", skip_all, fields(dir = %dir.display()))]
pub fn write_crops(
    image: &OcrImage,
    detections: &[Detection],
    dir: &Path,
    stem: &str,
) -> Result<Vec<PathBuf>> {
    let pixels = decode(image)?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create crop directory {:?}", dir))?;

    let mut written = Vec::new();
    for (i, detection) in detections.iter().enumerate() {
        let region = &detection.region;
        let width = region.x_max.saturating_sub(region.x_min);
        let height = region.y_max.saturating_sub(region.y_min);
        if width == 0 || height == 0 {
            trace!(index = i, "Skipping empty crop");
            continue;
        }
        let crop =
            imageops::crop_imm(&pixels, region.x_min, region.y_min, width, height).to_image();
        let path = dir.join(format!("{stem}-{:03}.png", i + 1));
        crop.save(&path)
            .with_context(|| format!("Failed to write crop to {:?}", path))?;
        written.push(path);
    }
    debug!(count = written.len(), "Wrote crops");
    Ok(written)
}
