use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::writer::{ArchiveFormat, WriteOutcome};

/// Summary of one finalized archive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub index: u32,
    pub name: String,
    pub path: PathBuf,
    pub item_count: u32,
    pub total_uncompressed_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Manifests of a successful run, in plan-index order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PackagingResult {
    pub manifests: Vec<PackageManifest>,
}

impl PackagingResult {
    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    pub fn total_items(&self) -> u64 {
        self.manifests.iter().map(|m| u64::from(m.item_count)).sum()
    }

    pub fn total_uncompressed_size(&self) -> u64 {
        self.manifests.iter().map(|m| m.total_uncompressed_size).sum()
    }

    pub fn total_compressed_size(&self) -> u64 {
        self.manifests.iter().map(|m| m.compressed_size).sum()
    }
}

/// `compressed / uncompressed`, or 0.0 when nothing was stored.
pub fn compression_ratio(compressed: u64, uncompressed: u64) -> f64 {
    if uncompressed == 0 {
        return 0.0;
    }
    (compressed as f64) / (uncompressed as f64)
}

/// `<template>_<NNN>.<ext>`; the suffix is three digits wide and grows past 999.
pub fn package_name(template: &str, index: u32, format: ArchiveFormat) -> String {
    format!("{}_{:03}.{}", template, index, format.extension())
}

/// Build the manifest for a finalized archive.
pub fn summarize(
    index: u32,
    path: PathBuf,
    outcome: &WriteOutcome,
    compressed_size: u64,
    sha256: Option<String>,
) -> PackageManifest {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    PackageManifest {
        index,
        name,
        path,
        item_count: outcome.item_count,
        total_uncompressed_size: outcome.total_uncompressed_size,
        compressed_size,
        compression_ratio: compression_ratio(compressed_size, outcome.total_uncompressed_size),
        sha256,
        created_at: Utc::now(),
    }
}
