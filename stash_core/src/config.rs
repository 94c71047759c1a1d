//! Repository configuration.
//!
//! Stored as `key=value` lines in the `config` file of the repository base
//! directory. Blank lines and lines starting with `#` are ignored, as are
//! unknown keys. Missing keys take their default.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Version written to and expected in the config file.
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryConfig {
    /// Number of workers fetching batches concurrently.
    pub sync_threads: usize,
    /// Upper bound on the bytes requested by one fetch batch.
    pub max_batch_bytes: u64,
    /// Free space that must remain on the workspace volume after fetching.
    pub min_scratch_space: u64,
    /// How often state is saved while fetches complete.
    #[serde(serialize_with = "serialize_secs")]
    pub checkpoint_interval: Duration,
    /// Keep every synced snapshot in the repository's snapshot store.
    pub persist_snapshots: bool,
}

fn serialize_secs<S: serde::Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_secs())
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            sync_threads: 4,
            max_batch_bytes: 256 * 1024 * 1024,
            min_scratch_space: 50 * 1024 * 1024 * 1024,
            checkpoint_interval: Duration::from_secs(60),
            persist_snapshots: false,
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::invalid_config(format!("bad value for {}: '{}'", key, value)))
}

impl RepositoryConfig {
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();
        let mut version = None;

        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::invalid_config(format!("expected key=value: '{}'", line)));
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "version" => version = Some(parse_value::<u32>(key, value)?),
                "sync_threads" => config.sync_threads = parse_value(key, value)?,
                "max_batch_bytes" => config.max_batch_bytes = parse_value(key, value)?,
                "min_scratch_space" => config.min_scratch_space = parse_value(key, value)?,
                "checkpoint_interval_secs" => {
                    config.checkpoint_interval = Duration::from_secs(parse_value(key, value)?)
                }
                "persist_snapshots" => config.persist_snapshots = parse_value(key, value)?,
                _ => {}
            }
        }

        match version {
            Some(CONFIG_VERSION) => {}
            Some(other) => return Err(Error::unsupported_version("config", i64::from(other))),
            None => return Err(Error::invalid_config("missing version")),
        }
        if config.sync_threads == 0 {
            return Err(Error::invalid_config("sync_threads must be at least 1"));
        }
        if config.max_batch_bytes == 0 {
            return Err(Error::invalid_config("max_batch_bytes must be at least 1"));
        }
        Ok(config)
    }

    /// Read the config file at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "version={}\nsync_threads={}\nmax_batch_bytes={}\nmin_scratch_space={}\ncheckpoint_interval_secs={}\npersist_snapshots={}\n",
            CONFIG_VERSION,
            self.sync_threads,
            self.max_batch_bytes,
            self.min_scratch_space,
            self.checkpoint_interval.as_secs(),
            self.persist_snapshots,
        )
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_config_string())?;
        Ok(())
    }
}
