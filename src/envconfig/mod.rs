use std::env;
use std::path::PathBuf;

pub const SOURCE_VAR: &str = "FER_CONVERT_SOURCE";
pub const OUTPUT_VAR: &str = "FER_CONVERT_OUTPUT";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Overrides read from the process environment. Unset or empty variables are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub source: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub log_filter: Option<String>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            source: non_empty(SOURCE_VAR).map(PathBuf::from),
            output: non_empty(OUTPUT_VAR).map(PathBuf::from),
            log_filter: non_empty("RUST_LOG"),
        }
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
