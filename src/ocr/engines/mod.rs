//! OCR engine interface.

use std::sync::Arc;

use clap::ValueEnum;

use crate::{aws::AwsOpts, prelude::*};

use super::{OcrImage, OcrPageOutput};

pub mod tesseract;
pub mod textract;

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// A short name for the engine, used in output records.
    fn name(&self) -> &'static str;

    /// Does this engine draw from a usage quota?
    fn is_metered(&self) -> bool;

    /// OCR a single image.
    async fn ocr_image(&self, image: &OcrImage) -> Result<OcrPageOutput>;
}

/// The engines we support.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum EngineKind {
    /// AWS Textract. Billed per page, so it counts against the quota.
    #[default]
    Textract,
    /// A local `tesseract` install. Free, and not metered.
    Tesseract,
}

impl EngineKind {
    /// Will engines of this kind draw from a usage quota? Known before the
    /// engine is built.
    pub fn is_metered(self) -> bool {
        match self {
            EngineKind::Textract => true,
            EngineKind::Tesseract => false,
        }
    }
}

/// Create the engine for `kind`. `languages` uses tesseract's `eng+por`
/// form; Textract detects the language itself and ignores it.
pub async fn ocr_engine(
    kind: EngineKind,
    aws_opts: &AwsOpts,
    languages: &str,
) -> Result<Arc<dyn OcrEngine>> {
    let engine: Arc<dyn OcrEngine> = match kind {
        EngineKind::Textract => Arc::new(textract::TextractOcrEngine::new(aws_opts).await?),
        EngineKind::Tesseract => Arc::new(tesseract::TesseractOcrEngine::new(languages)),
    };
    debug_assert_eq!(engine.is_metered(), kind.is_metered());
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tesseract_is_unmetered() {
        let engine = ocr_engine(EngineKind::Tesseract, &AwsOpts::default(), "eng")
            .await
            .unwrap();
        assert_eq!(engine.name(), "tesseract");
        assert!(!engine.is_metered());
        assert!(!EngineKind::Tesseract.is_metered());
        assert!(EngineKind::Textract.is_metered());
    }
}
