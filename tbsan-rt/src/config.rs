use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::BorTag;

/// Environment variable holding a comma-separated list of tags to track.
pub const TRACKED_TAGS_VAR: &str = "TBSAN_TRACKED_TAGS";
/// Environment variable that turns off foreign access skipping when set to anything but `0`.
pub const NO_FOREIGN_SKIPPING_VAR: &str = "TBSAN_NO_FOREIGN_SKIPPING";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read the configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

/// Runtime settings of the checker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Tags whose creation and transitions are logged at `info` level.
    pub tracked_tags: Vec<u64>,
    /// Skip subtrees that a foreign access is known to leave unchanged.
    pub foreign_access_skipping: bool,
    /// How many ranges a permission map may gain before equal neighbours are merged.
    pub merge_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { tracked_tags: Vec::new(), foreign_access_skipping: true, merge_threshold: 32 }
    }
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let contents: String = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Apply the `TBSAN_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Result<Config, ConfigError> {
        self.with_overrides_from(|var| std::env::var(var).ok())
    }

    fn with_overrides_from(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Config, ConfigError> {
        if let Some(value) = lookup(TRACKED_TAGS_VAR) {
            let tags = value
                .split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::parse::<u64>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| ConfigError::Env { var: TRACKED_TAGS_VAR, value: value.clone() })?;
            self.tracked_tags.extend(tags);
        }
        if let Some(value) = lookup(NO_FOREIGN_SKIPPING_VAR) {
            self.foreign_access_skipping = value.trim() == "0";
        }
        Ok(self)
    }

    pub fn is_tracked(&self, tag: BorTag) -> bool {
        self.tracked_tags.contains(&(tag.get() as u64))
    }
}
