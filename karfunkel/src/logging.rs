//! Log output setup for the server binary.
//!
//! Everything in the workspace logs through the `log` facade; this module
//! installs `env_logger` as the backend. `RUST_LOG`, when set, takes
//! precedence over the configured level.

use std::io::Write;

use env_logger::{Builder, Env};
use log::{Record, SetLoggerError};
use serde_json::json;

use crate::config::{LogFormat, LogLevel};

/// Installs the global logger. Fails if a logger is already installed.
pub fn init(level: LogLevel, format: LogFormat) -> Result<(), SetLoggerError> {
    builder(level, format).try_init()
}

/// Builds the logger without installing it.
pub fn builder(level: LogLevel, format: LogFormat) -> Builder {
    let mut builder = Builder::from_env(Env::default().default_filter_or(level.as_str()));

    match format {
        LogFormat::Full => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "{} {:<5} [{}] {}",
                    buf.timestamp_millis(),
                    record.level(),
                    record.target(),
                    record.args()
                )
            });
        }
        LogFormat::Compact => {
            builder.format(|buf, record| writeln!(buf, "{:<5} {}", record.level(), record.args()));
        }
        LogFormat::Json => {
            builder.format(|buf, record| {
                let timestamp = buf.timestamp_millis().to_string();
                writeln!(buf, "{}", json_line(&timestamp, record))
            });
        }
    }

    builder
}

/// Renders one record as a single-line JSON object.
pub fn json_line(timestamp: &str, record: &Record<'_>) -> String {
    json!({
        "timestamp": timestamp,
        "level": record.level().as_str(),
        "target": record.target(),
        "message": record.args().to_string(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn test_json_line_fields() {
        let line = json_line(
            "2024-01-01T00:00:00.000Z",
            &Record::builder()
                .level(Level::Warn)
                .target("karfunkel::connection")
                .args(format_args!("client {} timed out", 3))
                .build(),
        );

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "WARN");
        assert_eq!(value["target"], "karfunkel::connection");
        assert_eq!(value["message"], "client 3 timed out");
        assert_eq!(value["timestamp"], "2024-01-01T00:00:00.000Z");
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_json_line_escapes_message() {
        let line = json_line(
            "t",
            &Record::builder()
                .level(Level::Info)
                .args(format_args!("quote \" and\nnewline"))
                .build(),
        );

        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["message"], "quote \" and\nnewline");
    }

    #[test]
    fn test_builder_accepts_every_format() {
        for format in [LogFormat::Full, LogFormat::Compact, LogFormat::Json] {
            let logger = builder(LogLevel::Debug, format).build();
            assert!(logger.filter() >= log::LevelFilter::Error);
        }
    }
}
