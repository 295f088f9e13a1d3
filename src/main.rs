use std::str::FromStr;

use clap::{Parser, Subcommand};
use ocr_meter::{cmd, prelude::*, ui::Ui};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

/// OCR images against a monthly usage quota.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OCR_METER_USAGE_DIR (optional): Directory holding the usage records.
    Defaults to the current directory.
  - OCR_METER_LABEL_FONT (optional): Font file for `--annotate` labels.
  - RUST_LOG (optional): Log filter, for example `ocr_meter=debug`.

  Standard AWS environment variables and credential files
  (AWS_PROFILE, AWS_REGION, etc.) are used for Textract.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR JPEG or PNG images, writing one JSON line per image.
    Ocr(cmd::ocr::OcrOpts),
    /// Report how much of the monthly quota has been used.
    Usage(cmd::usage::UsageOpts),
    /// Print schemas for our output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Ocr(opts) => opts.output_path.is_none(),
            Cmd::Usage(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Ocr(opts) => cmd::ocr::cmd_ocr(ui, opts).await?,
        Cmd::Usage(opts) => cmd::usage::cmd_usage(opts).await?,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await?,
    }
    Ok(())
}
