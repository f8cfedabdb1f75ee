//! Atomic archive output in the staging directory.
//!
//! Archives are written into a hidden temp file next to their final location
//! and only renamed into place once the container is finalized. Dropping a
//! [`StagedArchive`] without committing removes the partial file.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub struct StagedArchive {
    tmp: NamedTempFile,
    dest: PathBuf,
}

impl StagedArchive {
    pub fn create(dir: &Path, file_name: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create staging directory: {}", dir.display()))?;

        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".partial")
            .tempfile_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;

        Ok(Self {
            tmp,
            dest: dir.join(file_name),
        })
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Handle the writer takes ownership of. It refers to the same open file.
    pub fn writer(&self) -> Result<File> {
        self.tmp
            .reopen()
            .with_context(|| format!("Failed to open temp file: {}", self.tmp.path().display()))
    }

    /// Length of the finalized archive.
    pub fn len(&self) -> Result<u64> {
        let mut f = self.tmp.as_file();
        f.seek(SeekFrom::End(0)).context("Failed to measure staged archive")
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn path(&self) -> &Path {
        self.tmp.path()
    }

    /// Move the temp file into its final location. An existing file at the
    /// destination is never replaced; the temp file is removed instead.
    pub fn commit(self) -> Result<PathBuf> {
        let Self { tmp, dest } = self;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("Failed to sync {}", dest.display()))?;
        tmp.persist_noclobber(&dest)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to move archive into place: {}", dest.display()))?;
        Ok(dest)
    }
}
