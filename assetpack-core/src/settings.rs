use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::PackError;
use crate::writer::{ArchiveFormat, DEFAULT_BUFFER_SIZE};

/// 500 MiB, the package limit the asset front end used.
pub const DEFAULT_CAPACITY: u64 = 500 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackSettings {
    /// Max declared bytes per non-oversized archive.
    pub capacity: u64,
    pub naming_template: String,
    /// Stable-sort items by ascending size before batching.
    pub pre_sort: bool,
    pub format: ArchiveFormat,
    /// Stripped from virtual paths when deriving entry paths.
    pub root_prefix: Option<String>,
    /// Where archives are written (defaults to system temp)
    pub staging_dir: Option<PathBuf>,
    pub buffer_size: usize,
    /// Deflate or zstd level; `None` picks the format default.
    pub compression_level: Option<i32>,
    /// Plans written concurrently. 1 keeps the run strictly sequential.
    pub workers: usize,
    pub checksums: bool,
    pub ledger_path: Option<PathBuf>,
}

impl Default for PackSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            naming_template: "package".to_string(),
            pre_sort: false,
            format: ArchiveFormat::Zip,
            root_prefix: None,
            staging_dir: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            compression_level: None,
            workers: 1,
            checksums: true,
            ledger_path: None,
        }
    }
}

impl PackSettings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse settings")
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn compression_level(&self) -> i32 {
        self.compression_level
            .unwrap_or_else(|| self.format.default_level())
    }

    /// Reject settings no run could use. Capacity is checked by the run itself.
    pub fn validate(&self) -> Result<(), PackError> {
        let template = self.naming_template.trim();
        if template.is_empty() {
            return Err(PackError::InvalidSettings("naming template is empty".into()));
        }
        if template.contains(['/', '\\']) {
            return Err(PackError::InvalidSettings(format!(
                "naming template '{}' must not contain path separators",
                self.naming_template
            )));
        }
        if self.buffer_size == 0 {
            return Err(PackError::InvalidSettings("buffer size must be greater than zero".into()));
        }
        if self.workers == 0 {
            return Err(PackError::InvalidSettings("workers must be at least 1".into()));
        }
        Ok(())
    }
}

/// Parse a byte count such as `500M`, `2G`, `64k` or `1048576` (binary units).
pub fn parse_size(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{text}'"))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size unit '{other}'")),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{text}' is too large"))
}
