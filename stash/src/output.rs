//! Output formatting for CLI commands.
//!
//! Commands print either human-readable text or a JSON document.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use stash_core::{PopulateStats, PurgeStats, RepositoryStatus, StreamStats, SyncStats};
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write output using the configured format.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error to stderr, as a JSON object in JSON mode.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init` command.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    pub workspace: String,
}

/// Output for `sync` command.
#[derive(Debug, Serialize)]
pub struct SyncOutput {
    pub success: bool,
    pub result_code: u8,
    pub completed_at: DateTime<Utc>,
    pub workspace: String,
    #[serde(flatten)]
    pub stats: SyncStats,
}

/// Output for `clean`, `clear` and `repair`.
#[derive(Debug, Serialize)]
pub struct MaintenanceOutput {
    pub success: bool,
    pub result_code: u8,
    pub operation: String,
    pub completed_at: DateTime<Utc>,
}

/// Output for `purge` command.
#[derive(Debug, Serialize)]
pub struct PurgeOutput {
    pub success: bool,
    pub result_code: u8,
    pub max_bytes: u64,
    #[serde(flatten)]
    pub stats: PurgeStats,
}

/// Output for `status` command.
#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    #[serde(flatten)]
    pub status: RepositoryStatus,
}

/// Output for `populate` command.
#[derive(Debug, Serialize)]
pub struct PopulateOutput {
    pub success: bool,
    pub result_code: u8,
    pub completed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: PopulateStats,
}

/// Output for `dump` command.
#[derive(Debug, Serialize)]
pub struct DumpOutput {
    pub success: bool,
    pub result_code: u8,
    pub lines: Vec<String>,
}

/// Output for `stats` command.
#[derive(Debug, Serialize)]
pub struct StatsOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub stats: StreamStats,
}

/// Format a byte count the way the text output shows sizes.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
