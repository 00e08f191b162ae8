//! Tracing/logging initialization.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line (production).
    #[default]
    Json,
    /// Human-readable multi-line output (local development).
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

impl LogFormat {
    /// Resolve an optional setting such as `LOG_FORMAT`.
    ///
    /// Unset or blank means the default. An unrecognized value also falls back
    /// to the default, and the parse error is returned so the caller can log it
    /// once a subscriber is installed.
    pub fn from_setting(raw: Option<&str>) -> (Self, Option<String>) {
        match raw.map(str::trim).filter(|v| !v.is_empty()) {
            None => (Self::default(), None),
            Some(value) => match value.parse() {
                Ok(format) => (format, None),
                Err(e) => (Self::default(), Some(e)),
            },
        }
    }
}

/// Initialize tracing with JSON logs, filtered by `RUST_LOG` (default `info`).
pub fn init() {
    init_with(None, LogFormat::Json);
}

/// Initialize tracing with an explicit fallback filter and output format.
///
/// `RUST_LOG` still wins when set. Safe to call multiple times (subsequent
/// calls are no-ops).
pub fn init_with(default_filter: Option<&str>, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.unwrap_or("info")));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().with_target(true).try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn unknown_setting_falls_back_and_reports() {
        assert_eq!(LogFormat::from_setting(None), (LogFormat::Json, None));
        assert_eq!(LogFormat::from_setting(Some(" ")), (LogFormat::Json, None));
        assert_eq!(LogFormat::from_setting(Some("pretty")), (LogFormat::Pretty, None));

        let (format, err) = LogFormat::from_setting(Some("yaml"));
        assert_eq!(format, LogFormat::Json);
        assert_eq!(err.as_deref(), Some("unknown log format: yaml"));
    }

    #[test]
    fn init_is_idempotent() {
        init();
        init_with(Some("debug"), LogFormat::Pretty);
    }
}
