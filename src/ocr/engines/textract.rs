//! OCR using AWS Textract.

use aws_sdk_textract::{
    operation::detect_document_text::DetectDocumentTextOutput,
    primitives::Blob,
    types::{Block, BlockType, Document},
};
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};

use crate::{
    aws::{AwsOpts, load_aws_config},
    ocr::{Detection, OcrImage, OcrPageOutput, Point},
    prelude::*,
    retry::{IsKnownTransient, retry_result_ok, try_potentially_transient},
};

use super::OcrEngine;

/// OCR engine wrapping the AWS Textract `DetectDocumentText` API.
pub struct TextractOcrEngine {
    /// AWS Textract client.
    client: aws_sdk_textract::Client,
}

impl TextractOcrEngine {
    /// Create a new `textract` engine.
    pub async fn new(aws_opts: &AwsOpts) -> Result<Self> {
        let config = load_aws_config(aws_opts).await?;
        let client = aws_sdk_textract::Client::new(&config);
        Ok(Self { client })
    }

    /// Call Textract once.
    async fn detect_once(
        &self,
        image: &OcrImage,
    ) -> RetryResult<(), (), DetectDocumentTextOutput, anyhow::Error> {
        let document = Document::builder()
            .bytes(Blob::new(image.data.clone()))
            .build();
        let response = try_potentially_transient!(
            self.client
                .detect_document_text()
                .document(document)
                .send()
                .await
        );
        retry_result_ok(response)
    }
}

#[async_trait]
impl OcrEngine for TextractOcrEngine {
    fn name(&self) -> &'static str {
        "textract"
    }

    fn is_metered(&self) -> bool {
        true
    }

    #[instrument(level = "debug", skip_all, fields(path = %image.path.display()))]
    async fn ocr_image(&self, image: &OcrImage) -> Result<OcrPageOutput> {
        // If we have a transient failure, back off exponentially. We only
        // report success once, after the final attempt, so usage is recorded
        // once per image no matter how many attempts it took.
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=30_000,
            re_attempts: 5,
            jitter_ratio: 0.2,
        };
        let result = self
            .detect_once(image)
            .await
            .retry_with_async(|_| async { self.detect_once(image).await })
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    "Textract succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            });

        let response = match result {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                output
            }
            ResolvedResult::Fatal { error, .. } => {
                return Err(error.context(
                    "AWS Textract request failed (check AWS credentials and region)",
                ));
            }
            ResolvedResult::GivenUp {
                retry_errors,
                fatal_error,
                ..
            }
            | ResolvedResult::Unrecoverable {
                retry_errors,
                fatal_error,
                ..
            } => {
                return Err(fatal_error.context(format!(
                    "AWS Textract request failed after {} retries",
                    retry_errors.len()
                )));
            }
        };
        trace!("Document response: {response:#?}");

        let detections = response
            .blocks()
            .iter()
            .filter_map(|block| line_detection(block, image.width, image.height))
            .collect::<Vec<_>>();
        let units_consumed = response
            .document_metadata()
            .and_then(|metadata| metadata.pages())
            .and_then(|pages| u64::try_from(pages).ok())
            .filter(|&pages| pages > 0)
            .unwrap_or(1);
        debug!(lines = detections.len(), units_consumed, "Textract finished");
        Ok(OcrPageOutput {
            detections,
            units_consumed,
        })
    }
}

/// Convert a Textract `LINE` block into a [`Detection`] in pixel coordinates.
///
/// Textract reports geometry as ratios of the page size. We prefer the
/// polygon, which follows rotated text, and fall back to the bounding box.
fn line_detection(block: &Block, width: u32, height: u32) -> Option<Detection> {
    if block.block_type() != Some(&BlockType::Line) {
        return None;
    }
    let text = block.text()?;
    let confidence = f64::from(block.confidence().unwrap_or_default()) / 100.0;
    let geometry = block.geometry()?;
    let (w, h) = (f64::from(width), f64::from(height));

    let polygon = geometry.polygon();
    if let [p0, p1, p2, p3] = polygon {
        let scale = |p: &aws_sdk_textract::types::Point| Point {
            x: f64::from(p.x()) * w,
            y: f64::from(p.y()) * h,
        };
        let bbox = [scale(p0), scale(p1), scale(p2), scale(p3)];
        return Some(Detection::new(text, confidence, bbox, width, height));
    }

    let bb = geometry.bounding_box()?;
    let left = f64::from(bb.left()) * w;
    let top = f64::from(bb.top()) * h;
    let right = left + f64::from(bb.width()) * w;
    let bottom = top + f64::from(bb.height()) * h;
    Some(Detection::from_rect(
        text,
        confidence,
        (left, top, right, bottom),
        width,
        height,
    ))
}
