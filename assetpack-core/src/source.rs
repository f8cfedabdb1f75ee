//! Filesystem content source.
//!
//! Walks a root directory and yields every regular file as a [`ContentItem`]
//! whose virtual path is relative to the root. Listing is best-effort:
//! unreadable directories and metadata failures are logged and skipped.

use chrono::{DateTime, Utc};
use log::warn;
use std::path::{Path, PathBuf};

use crate::item::{ContentItem, FileContent};

#[derive(Clone, Debug)]
pub struct FsSource {
    root: PathBuf,
    extensions: Vec<String>,
}

impl FsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: Vec::new(),
        }
    }

    /// Only yield files whose extension matches one of `extensions`
    /// (case-insensitive, leading dot optional).
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazy, deterministic (name-sorted, depth-first) sequence of items.
    pub fn items(&self) -> impl Iterator<Item = ContentItem> + '_ {
        walkdir::WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("walk_failed root={} error={}", self.root.display(), e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter(move |entry| self.accepts(entry.path()))
            .filter_map(move |entry| self.to_item(entry.path()))
    }

    fn accepts(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|want| want.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    fn to_item(&self, path: &Path) -> Option<ContentItem> {
        let metadata = match path.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("metadata_failed file={} error={}", path.display(), e);
                return None;
            }
        };

        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let virtual_path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Some(ContentItem::new(
            virtual_path,
            metadata.len(),
            last_modified,
            FileContent::new(path),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;

    fn tree() -> Result<tempfile::TempDir> {
        let dir = tempfile::TempDir::new()?;
        fs::create_dir_all(dir.path().join("images/nested"))?;
        fs::write(dir.path().join("b.txt"), b"bb")?;
        fs::write(dir.path().join("a.xml"), b"<a/>")?;
        fs::write(dir.path().join("images/one.JPG"), vec![0u8; 10])?;
        fs::write(dir.path().join("images/nested/two.png"), vec![0u8; 20])?;
        Ok(dir)
    }

    #[test]
    fn yields_relative_slash_paths_in_name_order() -> Result<()> {
        let dir = tree()?;
        let items: Vec<_> = FsSource::new(dir.path()).items().collect();
        let paths: Vec<_> = items.iter().map(|i| i.virtual_path.as_str()).collect();
        assert_eq!(paths, vec!["a.xml", "b.txt", "images/nested/two.png", "images/one.JPG"]);
        assert_eq!(items[2].size_bytes, 20);
        Ok(())
    }

    #[test]
    fn extension_filter_is_case_insensitive() -> Result<()> {
        let dir = tree()?;
        let items: Vec<_> = FsSource::new(dir.path())
            .with_extensions([".jpg", "png"])
            .items()
            .collect();
        let paths: Vec<_> = items.iter().map(|i| i.virtual_path.as_str()).collect();
        assert_eq!(paths, vec!["images/nested/two.png", "images/one.JPG"]);
        Ok(())
    }

    #[test]
    fn missing_root_yields_nothing() {
        let items: Vec<_> = FsSource::new("/no/such/root/for/assetpack").items().collect();
        assert!(items.is_empty());
    }
}
