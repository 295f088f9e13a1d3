//! OCR using a local `tesseract` install.

use std::{collections::BTreeMap, ffi::OsStr};

use tokio::process::Command;

use crate::{
    ocr::{Detection, OcrImage, OcrPageOutput},
    prelude::*,
};

use super::OcrEngine;

/// Languages we recognize unless told otherwise: English and Portuguese.
pub const DEFAULT_LANGUAGES: &str = "eng+por";

/// OCR engine wrapping the `tesseract` CLI tool. Runs locally, so it never
/// touches the usage quota.
pub struct TesseractOcrEngine {
    /// Tesseract language codes, joined with `+`.
    languages: String,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine recognizing `languages`, in
    /// tesseract's `eng+por` form.
    pub fn new(languages: impl Into<String>) -> Self {
        Self {
            languages: languages.into(),
        }
    }

    /// The arguments we pass to `tesseract` for `image`.
    fn args<'a>(&'a self, image: &'a OcrImage) -> [&'a OsStr; 5] {
        [
            image.path.as_os_str(),
            OsStr::new("stdout"),
            OsStr::new("-l"),
            OsStr::new(&self.languages),
            OsStr::new("tsv"),
        ]
    }
}

impl Default for TesseractOcrEngine {
    fn default() -> Self {
        Self::new(DEFAULT_LANGUAGES)
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn is_metered(&self) -> bool {
        false
    }

    #[instrument(level = "debug", skip_all, fields(path = %image.path.display()))]
    async fn ocr_image(&self, image: &OcrImage) -> Result<OcrPageOutput> {
        // Ask for TSV on stdout, which includes word boxes and confidences.
        let output = Command::new("tesseract")
            .args(self.args(image))
            .output()
            .await
            .context("cannot run tesseract (is it installed?)")?;
        check_for_command_failure("tesseract", &output)?;

        let tsv = String::from_utf8_lossy(&output.stdout);
        let detections = parse_tsv_lines(&tsv, image.width, image.height)?;
        Ok(OcrPageOutput {
            detections,
            units_consumed: 0,
        })
    }
}

/// Report any command failures, and include any error output.
fn check_for_command_failure(command_name: &str, output: &std::process::Output) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(command_name, output = %stderr, "Standard error from command");
    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!("{} failed with error output:\n{}", command_name, stderr))
    }
}

/// One row of `tesseract ... tsv` output. We ignore `word_num`.
#[derive(Debug, Deserialize)]
struct TsvRow {
    level: u32,
    page_num: u32,
    block_num: u32,
    par_num: u32,
    line_num: u32,
    left: f64,
    top: f64,
    width: f64,
    height: f64,
    conf: f64,
    #[serde(default)]
    text: String,
}

/// Tesseract's TSV level for individual words.
const WORD_LEVEL: u32 = 5;

/// A text line accumulated from word rows.
#[derive(Default)]
struct LineAccumulator {
    words: Vec<String>,
    confidence_sum: f64,
    left: f64,
    top: f64,
    right: f64,
    bottom: f64,
}

/// Parse `tesseract ... tsv` output into one detection per text line.
///
/// Tesseract reports one row per word (level 5), keyed by page, block,
/// paragraph and line numbers. We merge the words of each line, union their
/// boxes, and average their confidences (reported as 0-100).
fn parse_tsv_lines(tsv: &str, width: u32, height: u32) -> Result<Vec<Detection>> {
    // Tesseract doesn't quote its text column, so quotes are literal.
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .from_reader(tsv.as_bytes());
    let headers = rdr.headers().context("cannot read tesseract TSV header")?;
    if headers.get(0) != Some("level") {
        bail!("unexpected tesseract TSV header: {:?}", headers);
    }

    let mut lines = BTreeMap::<(u32, u32, u32, u32), LineAccumulator>::new();
    for row in rdr.deserialize::<TsvRow>() {
        let row = row.context("cannot parse tesseract TSV row")?;
        let text = row.text.trim();
        if row.level != WORD_LEVEL || text.is_empty() || row.conf < 0.0 {
            continue;
        }
        let key = (row.page_num, row.block_num, row.par_num, row.line_num);
        let (right, bottom) = (row.left + row.width, row.top + row.height);

        let acc = lines.entry(key).or_insert_with(|| LineAccumulator {
            left: row.left,
            top: row.top,
            right,
            bottom,
            ..LineAccumulator::default()
        });
        acc.words.push(text.to_owned());
        acc.confidence_sum += row.conf;
        acc.left = acc.left.min(row.left);
        acc.top = acc.top.min(row.top);
        acc.right = acc.right.max(right);
        acc.bottom = acc.bottom.max(bottom);
    }

    Ok(lines
        .into_values()
        .map(|acc| {
            let confidence = acc.confidence_sum / acc.words.len() as f64 / 100.0;
            Detection::from_rect(
                acc.words.join(" "),
                confidence,
                (acc.left, acc.top, acc.right, acc.bottom),
                width,
                height,
            )
        })
        .collect())
}
