//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    ocr::OcrOutput,
    output::write_pretty_json,
    prelude::*,
    quota::{UsageReport, UsageState},
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// The persisted usage record.
    UsageState,
    /// Output of the `usage` subcommand.
    UsageReport,
    /// Output of the `ocr` subcommand.
    OcrOutput,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::UsageState => schema_for!(UsageState),
        SchemaType::UsageReport => schema_for!(UsageReport),
        SchemaType::OcrOutput => schema_for!(OcrOutput),
    };
    write_pretty_json(schema_opts.output_path.as_deref(), &schema).await
}
