//! Options of the taint engine.
use core::str::FromStr;

use log::info;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{shadow::ShadowLayout, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct TaintConfig {
    /// Track taint through pointer dereference
    #[builder(default = true)]
    pub tainted_pointer: bool,
    /// Inline taint operations
    #[builder(default = false)]
    pub inline: bool,
    /// Optimize installed taint programs
    #[builder(default = false)]
    pub optimize: bool,
    /// Trace every executed taint op
    #[builder(default = false)]
    pub debug: bool,
    #[builder(default)]
    pub layout: ShadowLayout,
}

impl Default for TaintConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn flag_status(enabled: bool) -> &'static str {
    if enabled {
        "ENABLED"
    } else {
        "DISABLED"
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::illegal_argument(format!(
            "Invalid value {value:?} for taint option {key}"
        ))),
    }
}

impl TaintConfig {
    pub fn log_status(&self) {
        info!(
            "propagation via pointer dereference {}",
            flag_status(self.tainted_pointer)
        );
        info!("taint operations inlining {}", flag_status(self.inline));
        info!("taint program optimizations {}", flag_status(self.optimize));
        info!("taint debugging {}", flag_status(self.debug));
    }
}

/// Parses plugin arguments such as `no_tp,opt=true`.
///
/// A bare key means `true`. Keys are `no_tp`, `inline`, `opt` and `debug`.
impl FromStr for TaintConfig {
    type Err = Error;

    fn from_str(args: &str) -> Result<Self, Self::Err> {
        let mut config = Self::default();
        for arg in args.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            let (key, value) = match arg.split_once('=') {
                Some((key, value)) => (key.trim(), parse_bool(key.trim(), value.trim())?),
                None => (arg, true),
            };
            match key {
                "no_tp" => config.tainted_pointer = !value,
                "inline" => config.inline = value,
                "opt" => config.optimize = value,
                "debug" => config.debug = value,
                _ => {
                    return Err(Error::illegal_argument(format!(
                        "Unknown taint option {key}"
                    )))
                }
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: TaintConfig = "".parse().unwrap();
        assert_eq!(config, TaintConfig::default());
        assert!(config.tainted_pointer);
        assert!(!config.inline && !config.optimize && !config.debug);
    }

    #[test]
    fn test_parse_args() {
        let config: TaintConfig = "no_tp, opt=true,debug=off,inline=1".parse().unwrap();
        assert!(!config.tainted_pointer);
        assert!(config.optimize);
        assert!(!config.debug);
        assert!(config.inline);

        let config: TaintConfig = "no_tp=no".parse().unwrap();
        assert!(config.tainted_pointer);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "turbo".parse::<TaintConfig>(),
            Err(Error::IllegalArgument(_))
        ));
        assert!("opt=maybe".parse::<TaintConfig>().is_err());
    }
}
