//! Report settings, read from the environment of the audited process.
//!
//! - `MEMCHECK_REPORT`: `text` (default), `json` or `off`
//! - `MEMCHECK_QUIET`: set to anything but `0` to skip the greeting

use std::{env, str::FromStr};

use crate::error::ParseReportFormatError;

pub const REPORT_VAR: &str = "MEMCHECK_REPORT";
pub const QUIET_VAR: &str = "MEMCHECK_QUIET";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReportFormat {
    /// Human readable, `==<pid>== `-prefixed lines on stderr
    #[default]
    Text,
    /// One JSON object per leak plus a summary object, on stderr
    JsonLines,
    /// Drain and check the ledger, but print nothing
    Off,
}

impl FromStr for ReportFormat {
    type Err = ParseReportFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "text" => Ok(Self::Text),
            "json" | "jsonl" | "json-lines" => Ok(Self::JsonLines),
            "off" | "none" => Ok(Self::Off),
            _ => Err(ParseReportFormatError {
                value: s.to_owned(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReportConfig {
    pub format: ReportFormat,
    pub quiet: bool,
}

impl ReportConfig {
    /// Read the config from the process environment. Bad values fall back to
    /// the defaults (with a warning), the report must always happen.
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var_os(key).and_then(|v| v.to_str().map(str::to_owned)))
    }

    /// Like [`ReportConfig::from_env()`], but with `lookup` standing in for
    /// the environment.
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let format = match lookup(REPORT_VAR) {
            Some(value) => value.parse().unwrap_or_else(|e| {
                log::warn!("{REPORT_VAR}: {e}, using text");
                ReportFormat::Text
            }),
            None => ReportFormat::default(),
        };
        let quiet = lookup(QUIET_VAR).is_some_and(|v| !v.is_empty() && v != "0");
        let config = Self { format, quiet };
        log::debug!("report config: {config:?}");
        config
    }
}
