//! The `usage` subcommand.

use clap::Args;

use crate::{
    cmd::QuotaOpts,
    output::write_pretty_json,
    prelude::*,
    quota::{QuotaClass, UsageQuotaTracker, UsageReport},
};

/// Usage command line arguments.
#[derive(Debug, Args)]
pub struct UsageOpts {
    #[clap(flatten)]
    pub quota: QuotaOpts,

    /// Report on every class, not just `--class`.
    #[clap(long)]
    pub all: bool,

    /// The output path to write the report to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `usage` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_usage(opts: &UsageOpts) -> Result<()> {
    let classes = if opts.all {
        QuotaClass::ALL.to_vec()
    } else {
        vec![opts.quota.class]
    };

    let mut reports = Vec::with_capacity(classes.len());
    for class in classes {
        let config = opts.quota.config_for(class);
        let tracker = UsageQuotaTracker::open(&config)?;
        let state = tracker
            .load_state()
            .with_context(|| format!("Failed to load {class} usage"))?;
        reports.push(UsageReport::new(class, tracker.limit(), &state));
    }

    if opts.all {
        write_pretty_json(opts.output_path.as_deref(), &reports).await
    } else {
        write_pretty_json(opts.output_path.as_deref(), &reports[0]).await
    }
}
