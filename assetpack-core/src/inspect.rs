use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use crate::writer::ArchiveFormat;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub size: u64,
}

/// List the file entries of a produced archive, in archive order.
pub fn list_entries(archive_path: &Path) -> Result<Vec<ListedEntry>> {
    let format = ArchiveFormat::from_path(archive_path)
        .ok_or_else(|| anyhow!("Unrecognized archive extension: {}", archive_path.display()))?;
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive: {}", archive_path.display()))?;
    let reader = BufReader::new(file);

    match format {
        ArchiveFormat::Zip => list_zip_entries(reader),
        ArchiveFormat::TarZst => list_tar_zst_entries(reader),
    }
    .with_context(|| format!("Failed to list {}", archive_path.display()))
}

pub fn list_zip_entries<R: Read + Seek>(reader: R) -> Result<Vec<ListedEntry>> {
    let mut archive = zip::ZipArchive::new(reader).context("Failed to read zip central directory")?;
    let mut out = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i).context("Failed to read zip entry")?;
        if entry.is_dir() {
            continue;
        }
        out.push(ListedEntry {
            name: entry.name().to_string(),
            size: entry.size(),
        });
    }
    Ok(out)
}

pub fn list_tar_zst_entries<R: Read>(reader: R) -> Result<Vec<ListedEntry>> {
    let decoder = zstd::stream::read::Decoder::new(reader).context("Failed to create zstd decoder")?;
    let mut archive = tar::Archive::new(decoder);
    let mut out = Vec::new();

    for entry in archive.entries().context("Failed to read tar entries")? {
        let entry = entry.context("Failed to read tar entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .context("Failed to read tar entry path")?
            .to_string_lossy()
            .replace('\\', "/");
        out.push(ListedEntry {
            name,
            size: entry.size(),
        });
    }
    Ok(out)
}
