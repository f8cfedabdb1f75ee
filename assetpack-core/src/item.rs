use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;

/// Lazily opened content behind a [`ContentItem`].
///
/// `open` consumes the source, so a stream can be acquired at most once per
/// packaging attempt. The returned reader is owned by the caller and released
/// when it goes out of scope.
pub trait ContentSource: Send {
    fn open(self: Box<Self>) -> io::Result<Box<dyn Read + Send>>;
}

/// Content backed by a file on disk.
#[derive(Debug, Clone)]
pub struct FileContent {
    path: PathBuf,
}

impl FileContent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ContentSource for FileContent {
    fn open(self: Box<Self>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

/// Content held in memory.
#[derive(Debug, Clone)]
pub struct MemoryContent {
    data: Vec<u8>,
}

impl MemoryContent {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

impl ContentSource for MemoryContent {
    fn open(self: Box<Self>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data)))
    }
}

/// One discrete piece of content handed to the packer.
pub struct ContentItem {
    pub virtual_path: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    content: Box<dyn ContentSource>,
}

impl ContentItem {
    pub fn new(
        virtual_path: impl Into<String>,
        size_bytes: u64,
        last_modified: DateTime<Utc>,
        content: impl ContentSource + 'static,
    ) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            size_bytes,
            last_modified,
            content: Box::new(content),
        }
    }

    /// In-memory item whose size is the length of `data`.
    pub fn from_bytes(virtual_path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(virtual_path, size, Utc::now(), MemoryContent::new(data))
    }

    /// Open the content stream, consuming the item's source.
    pub fn open(self) -> io::Result<Box<dyn Read + Send>> {
        self.content.open()
    }

    pub fn header(&self) -> ItemHeader {
        ItemHeader {
            virtual_path: self.virtual_path.clone(),
            size_bytes: self.size_bytes,
            last_modified: self.last_modified,
        }
    }
}

impl fmt::Debug for ContentItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentItem")
            .field("virtual_path", &self.virtual_path)
            .field("size_bytes", &self.size_bytes)
            .field("last_modified", &self.last_modified)
            .finish_non_exhaustive()
    }
}

/// Item metadata without the content source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemHeader {
    pub virtual_path: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

/// Stable ascending sort by declared size. Items of equal size keep their
/// source order.
pub fn sort_by_size(items: &mut [ContentItem]) {
    items.sort_by_key(|item| item.size_bytes);
}
