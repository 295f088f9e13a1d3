//! AWS configuration.
//!
//! Credentials come from the SDK's standard provider chain: environment
//! variables, then shared config and credential files, then web identity and
//! instance metadata. We only let the user pick a profile and a region.

use aws_config::{BehaviorVersion, Region};
use clap::Args;

use crate::prelude::*;

/// AWS-related options.
#[derive(Args, Clone, Debug, Default)]
pub struct AwsOpts {
    /// The AWS profile to use, instead of `AWS_PROFILE` or `default`.
    #[clap(long)]
    pub aws_profile: Option<String>,

    /// The AWS region to use, instead of `AWS_REGION` or the profile's region.
    #[clap(long)]
    pub aws_region: Option<String>,
}

/// Load the user's AWS configuration using standard conventions.
pub async fn load_aws_config(opts: &AwsOpts) -> Result<aws_config::SdkConfig> {
    let mut loader = aws_config::defaults(BehaviorVersion::v2025_01_17());
    if let Some(profile) = &opts.aws_profile {
        loader = loader.profile_name(profile);
    }
    if let Some(region) = &opts.aws_region {
        loader = loader.region(Region::new(region.clone()));
    }
    let config = loader.load().await;
    if config.region().is_none() {
        bail!("No AWS region configured. Set AWS_REGION or pass --aws-region.");
    }
    Ok(config)
}
