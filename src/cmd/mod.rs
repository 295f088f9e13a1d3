//! Command-line entry points.

use clap::Args;

use crate::{
    prelude::*,
    quota::{QuotaClass, QuotaConfig},
};

pub mod ocr;
pub mod schema;
pub mod usage;

/// Options selecting which usage quota to draw from.
#[derive(Args, Clone, Debug)]
pub struct QuotaOpts {
    /// Which quota class to charge.
    #[clap(long, value_enum, default_value_t = QuotaClass::Standard)]
    pub class: QuotaClass,

    /// Directory holding the usage records.
    #[clap(long, env = "OCR_METER_USAGE_DIR", default_value = ".")]
    pub usage_dir: PathBuf,

    /// Override the class's monthly page limit.
    #[clap(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub limit: Option<u64>,
}

impl QuotaOpts {
    /// The quota configuration for `class`, applying any overrides.
    pub fn config_for(&self, class: QuotaClass) -> QuotaConfig {
        let config = QuotaConfig::for_class(class, &self.usage_dir);
        match self.limit {
            Some(limit) => config.with_limit(limit),
            None => config,
        }
    }

    /// The quota configuration for the selected class.
    pub fn config(&self) -> QuotaConfig {
        self.config_for(self.class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_override_applies_to_selected_class() {
        let opts = QuotaOpts {
            class: QuotaClass::Trial,
            usage_dir: PathBuf::from("/var/lib/ocr"),
            limit: Some(10),
        };
        let config = opts.config();
        assert_eq!(config.class, QuotaClass::Trial);
        assert_eq!(config.limit, 10);
        assert_eq!(config.path, Path::new("/var/lib/ocr/usage_trial.json"));

        let opts = QuotaOpts { limit: None, ..opts };
        assert_eq!(opts.config_for(QuotaClass::Standard).limit, 1000);
    }
}
