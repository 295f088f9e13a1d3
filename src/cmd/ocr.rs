//! The `ocr` subcommand.

use std::time::Instant;

use clap::Args;

use crate::{
    aws::AwsOpts,
    cmd::QuotaOpts,
    ocr::{
        OcrImage, OcrOutput,
        annotate::{LabelFont, write_annotated, write_crops},
        engines::{EngineKind, OcrEngine, ocr_engine, tesseract::DEFAULT_LANGUAGES},
    },
    output::JsonlWriter,
    prelude::*,
    quota::{Admission, Metered, QuotaError, UsageQuotaTracker, run_metered},
    ui::{ProgressConfig, Ui},
};

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Images to OCR (JPEG or PNG).
    #[clap(required = true, value_name = "IMAGE")]
    pub image_paths: Vec<PathBuf>,

    /// Which OCR engine to use.
    #[clap(long, value_enum, default_value_t = EngineKind::Textract)]
    pub engine: EngineKind,

    /// Languages to recognize, as tesseract codes joined with `+`. Textract
    /// detects the language itself.
    #[clap(long = "lang", value_name = "LANGS", default_value = DEFAULT_LANGUAGES)]
    pub languages: String,

    /// Drop detections with this confidence or lower (0.0-1.0).
    #[clap(long, default_value = "0.5", value_parser = parse_threshold)]
    pub threshold: f64,

    /// Write a copy of each image with detections outlined and labelled.
    /// With several images, the image's file stem is appended to this
    /// path's stem.
    #[clap(long, value_name = "PATH")]
    pub annotate: Option<PathBuf>,

    /// Font for `--annotate` labels. Defaults to a common system font;
    /// without one, boxes are drawn unlabelled.
    #[clap(long, env = "OCR_METER_LABEL_FONT", value_name = "FONT")]
    pub label_font: Option<PathBuf>,

    /// Save each kept detection's region as a PNG in this directory.
    #[clap(long, value_name = "DIR")]
    pub crops: Option<PathBuf>,

    /// Output location, or stdout if not specified.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    #[clap(flatten)]
    pub quota: QuotaOpts,

    #[clap(flatten)]
    pub aws: AwsOpts,
}

/// Parse a confidence threshold.
fn parse_threshold(s: &str) -> Result<f64, String> {
    let threshold = s.parse::<f64>().map_err(|e| e.to_string())?;
    if (0.0..=1.0).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(format!("threshold must be between 0.0 and 1.0, got {threshold}"))
    }
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    // An exhausted quota must be reported before any engine setup can fail.
    let tracker = if opts.engine.is_metered() {
        let config = opts.quota.config();
        info!(
            class = %config.class,
            path = %config.path.display(),
            limit = config.limit,
            "Using usage quota"
        );
        let tracker = UsageQuotaTracker::open(&config)?;
        let admission = tracker.can_consume(1)?;
        if !admission.allowed {
            return Err(quota_exhausted(&tracker, &admission, &opts.image_paths[0]));
        }
        Some(tracker)
    } else {
        None
    };
    let engine = ocr_engine(opts.engine, &opts.aws, &opts.languages).await?;

    let label_font = match (&opts.annotate, &opts.label_font) {
        (None, _) => None,
        (Some(_), Some(path)) => Some(LabelFont::load(path)?),
        (Some(_), None) => {
            let font = LabelFont::find_system();
            if font.is_none() {
                warn!("No label font found; drawing boxes without labels (see --label-font)");
            }
            font
        }
    };

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔍",
            msg: "OCRing images",
            done_msg: "OCRed images",
        },
        opts.image_paths.len() as u64,
    );

    let many = opts.image_paths.len() > 1;
    let mut wtr = JsonlWriter::create(opts.output_path.as_deref()).await?;
    for path in &opts.image_paths {
        let image = OcrImage::from_path(path).await?;
        let (output, unrecorded) =
            ocr_one(engine.as_ref(), tracker.as_ref(), &image, opts.threshold).await?;
        if let Some(annotate) = &opts.annotate {
            let out_path = annotation_path(annotate, path, many);
            write_annotated(&image, &output.detections, label_font.as_ref(), &out_path)?;
        }
        if let Some(crops) = &opts.crops {
            let stem = path.file_stem().unwrap_or_default().to_string_lossy();
            write_crops(&image, &output.detections, crops, &stem)?;
        }
        info!(
            path = %path.display(),
            detections = output.detections.len(),
            elapsed_secs = output.elapsed_secs,
            "OCRed image"
        );
        wtr.write_record(&output).await?;
        pb.inc(1);

        // Keep the output of a page we were charged for, then stop.
        if let Some(error) = unrecorded {
            return Err(anyhow::Error::new(error).context(format!(
                "OCR of {:?} succeeded, but its usage could not be recorded",
                path
            )));
        }
    }
    Ok(())
}

/// OCR a single image, charging metered engines against `tracker`.
///
/// Also returns the recording error, if the OCR succeeded but could not be
/// charged.
async fn ocr_one(
    engine: &dyn OcrEngine,
    tracker: Option<&UsageQuotaTracker>,
    image: &OcrImage,
    threshold: f64,
) -> Result<(OcrOutput, Option<QuotaError>)> {
    let started = Instant::now();
    let Some(tracker) = tracker.filter(|_| engine.is_metered()) else {
        let page = engine.ocr_image(image).await?;
        let output = OcrOutput::new(image, engine.name(), threshold, page, started.elapsed());
        return Ok((output, None));
    };

    // Each image is one page, so that's what we ask the quota for.
    match run_metered(tracker, 1, || engine.ocr_image(image)).await? {
        Metered::Denied { admission } => Err(quota_exhausted(tracker, &admission, &image.path)),
        Metered::Completed { output, state } => {
            let mut output =
                OcrOutput::new(image, engine.name(), threshold, output, started.elapsed());
            output.used_this_month = Some(state.used_units);
            Ok((output, None))
        }
        Metered::Unrecorded { output, error } => {
            let output =
                OcrOutput::new(image, engine.name(), threshold, output, started.elapsed());
            Ok((output, Some(error)))
        }
    }
}

/// The error we report when `path` can't be sent because the quota is used up.
fn quota_exhausted(
    tracker: &UsageQuotaTracker,
    admission: &Admission,
    path: &Path,
) -> anyhow::Error {
    anyhow!(
        "Monthly OCR quota exhausted: {} of {} pages used in {}; not sending {:?}",
        admission.state.used_units,
        tracker.limit(),
        admission.state.period_key.as_deref().unwrap_or("this month"),
        path,
    )
}

/// Where should we write the annotated copy of `image_path`?
fn annotation_path(annotate: &Path, image_path: &Path, many: bool) -> PathBuf {
    if !many {
        return annotate.to_owned();
    }
    let stem = annotate.file_stem().unwrap_or_default().to_string_lossy();
    let image_stem = image_path.file_stem().unwrap_or_default().to_string_lossy();
    let ext = annotate
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_else(|| "png".to_owned());
    annotate.with_file_name(format!("{stem}-{image_stem}.{ext}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use clap::Parser;

    use super::*;
    use crate::{
        ocr::{Detection, OcrPageOutput},
        quota::{FixedClock, MemoryStore},
    };

    /// Parses just our options, for testing.
    #[derive(Debug, Parser)]
    struct TestOpts {
        #[clap(flatten)]
        ocr: OcrOpts,
    }

    /// A metered engine which finds one line, and counts its calls.
    struct CountingEngine {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl OcrEngine for CountingEngine {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn is_metered(&self) -> bool {
            true
        }

        async fn ocr_image(&self, image: &OcrImage) -> Result<OcrPageOutput> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(OcrPageOutput {
                detections: vec![Detection::from_rect(
                    "Olá",
                    0.9,
                    (0.0, 0.0, 2.0, 2.0),
                    image.width,
                    image.height,
                )],
                units_consumed: 1,
            })
        }
    }

    fn test_image() -> OcrImage {
        let mut bytes = Vec::new();
        image::RgbImage::new(4, 4)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        OcrImage::from_bytes("page.png".into(), bytes).unwrap()
    }

    fn test_tracker(contents: &str) -> UsageQuotaTracker {
        use chrono::TimeZone as _;
        let clock = FixedClock::new(chrono::Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap());
        UsageQuotaTracker::new(
            50,
            Box::new(MemoryStore::with_contents(contents)),
            Arc::new(clock),
        )
        .unwrap()
    }

    #[test]
    fn threshold_must_be_a_fraction() {
        assert_eq!(parse_threshold("0.25"), Ok(0.25));
        assert!(parse_threshold("1.5").is_err());
        assert!(parse_threshold("-0.1").is_err());
        assert!(parse_threshold("high").is_err());
    }

    #[test]
    fn languages_default_to_english_and_portuguese() {
        let opts = TestOpts::try_parse_from(["test", "a.png"]).unwrap();
        assert_eq!(opts.ocr.languages, "eng+por");
        let opts = TestOpts::try_parse_from(["test", "--lang", "por", "a.png"]).unwrap();
        assert_eq!(opts.ocr.languages, "por");
    }

    #[test]
    fn annotation_paths_are_unique_per_image() {
        let out = Path::new("out/boxes.png");
        assert_eq!(
            annotation_path(out, Path::new("scans/a.jpg"), false),
            PathBuf::from("out/boxes.png")
        );
        assert_eq!(
            annotation_path(out, Path::new("scans/a.jpg"), true),
            PathBuf::from("out/boxes-a.png")
        );
    }

    #[tokio::test]
    async fn metered_images_are_charged() {
        let engine = CountingEngine {
            calls: Default::default(),
        };
        let tracker = test_tracker(r#"{"month":"2025-01","used":3}"#);
        let (output, unrecorded) = ocr_one(&engine, Some(&tracker), &test_image(), 0.5)
            .await
            .unwrap();
        assert!(unrecorded.is_none());
        assert_eq!(output.used_this_month, Some(4));
        assert_eq!(output.text, "Olá");
    }

    #[tokio::test]
    async fn exhausted_quota_stops_before_ocr() {
        let engine = CountingEngine {
            calls: Default::default(),
        };
        let tracker = test_tracker(r#"{"month":"2025-01","used":50}"#);
        let err = ocr_one(&engine, Some(&tracker), &test_image(), 0.5)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota exhausted"), "{err}");
        assert_eq!(engine.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
