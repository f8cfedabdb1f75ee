//! Streaming archive writer: one package plan into one compressed container.

use chrono::{DateTime, Datelike, Timelike, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::Path;

use crate::batcher::PackagePlan;
use crate::cancel::CancelToken;
use crate::error::PackError;
use crate::item::ItemHeader;

/// Default transfer buffer used when streaming item content into an entry.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Container format of produced archives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    /// ZIP with per-entry deflate.
    #[default]
    Zip,
    /// tar stream inside a single zstd frame.
    TarZst,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarZst => "tar.zst",
        }
    }

    /// Level used when the settings do not name one.
    pub fn default_level(&self) -> i32 {
        match self {
            Self::Zip => 6,
            Self::TarZst => 3,
        }
    }

    /// Guess the format of an existing archive from its file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".tar.zst") {
            Some(Self::TarZst)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// One entry written into an archive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub entry_path: String,
    pub virtual_path: String,
    pub size: u64,
}

/// Result of writing one plan.
#[derive(Clone, Debug, Default)]
pub struct WriteOutcome {
    pub item_count: u32,
    pub total_uncompressed_size: u64,
    pub entries: Vec<EntryRecord>,
}

/// Derive the archive entry path for a virtual path.
///
/// Backslashes become `/`, `root_prefix` is stripped when it matches at a
/// component boundary, and one leading `/` is removed. Empty results,
/// directory-like paths and `..` components are rejected.
pub fn entry_path(virtual_path: &str, root_prefix: Option<&str>) -> Result<String, PackError> {
    let normalized = virtual_path.replace('\\', "/");
    let mut rest = normalized.as_str();

    if let Some(prefix) = root_prefix {
        let prefix = prefix.replace('\\', "/");
        let prefix = prefix.trim_end_matches('/');
        if !prefix.is_empty() {
            if let Some(stripped) = rest.strip_prefix(prefix) {
                if stripped.is_empty() || stripped.starts_with('/') {
                    rest = stripped;
                }
            }
        }
    }

    let rest = rest.strip_prefix('/').unwrap_or(rest);
    let invalid = rest.is_empty() || rest.ends_with('/') || rest.split('/').any(|c| c == "..");
    if invalid {
        return Err(PackError::InvalidEntryPath {
            virtual_path: virtual_path.to_string(),
        });
    }

    Ok(rest.to_string())
}

/// Writes package plans into archive sinks.
#[derive(Clone, Debug)]
pub struct ArchiveWriter {
    format: ArchiveFormat,
    level: i32,
    buffer_size: usize,
    root_prefix: Option<String>,
    cancel: CancelToken,
}

impl ArchiveWriter {
    pub fn new(format: ArchiveFormat) -> Self {
        Self {
            format,
            level: format.default_level(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            root_prefix: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_root_prefix(mut self, root_prefix: Option<String>) -> Self {
        self.root_prefix = root_prefix;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Stream every item of `plan` into `sink` and finalize the container.
    ///
    /// Entry paths are validated before anything is written. Each item's
    /// content is opened right before its entry and dropped right after it.
    /// On error the sink holds a partial archive and must be discarded.
    pub fn write<W: Write + Seek>(&self, plan: PackagePlan, sink: W) -> Result<(WriteOutcome, W), PackError> {
        let entries = self.entry_paths(&plan)?;
        let sink = BufWriter::with_capacity(self.buffer_size, sink);

        let (outcome, sink) = match self.format {
            ArchiveFormat::Zip => {
                let mut zip = ZipSink::new(sink, self.level);
                let outcome = self.write_entries(plan, entries, &mut zip)?;
                (outcome, zip.finish()?)
            }
            ArchiveFormat::TarZst => {
                let mut tar = TarZstSink::new(sink, self.level)?;
                let outcome = self.write_entries(plan, entries, &mut tar)?;
                (outcome, tar.finish()?)
            }
        };

        let sink = sink
            .into_inner()
            .map_err(|e| PackError::sink(None, e.into_error()))?;
        Ok((outcome, sink))
    }

    fn entry_paths(&self, plan: &PackagePlan) -> Result<Vec<String>, PackError> {
        let mut seen = HashSet::with_capacity(plan.items.len());
        let mut paths = Vec::with_capacity(plan.items.len());
        for item in &plan.items {
            let entry = entry_path(&item.virtual_path, self.root_prefix.as_deref())?;
            if !seen.insert(entry.clone()) {
                return Err(PackError::DuplicateEntryPath {
                    entry,
                    virtual_path: item.virtual_path.clone(),
                });
            }
            paths.push(entry);
        }
        Ok(paths)
    }

    fn write_entries<S: EntrySink>(
        &self,
        plan: PackagePlan,
        entries: Vec<String>,
        sink: &mut S,
    ) -> Result<WriteOutcome, PackError> {
        let mut outcome = WriteOutcome::default();
        let mut buf = vec![0u8; self.buffer_size];

        for (item, entry) in plan.items.into_iter().zip(entries) {
            if self.cancel.is_cancelled() {
                return Err(PackError::Cancelled);
            }

            let header = item.header();
            let mut reader = item
                .open()
                .map_err(|e| PackError::read(&header.virtual_path, e))?;
            let written = sink.write_entry(&entry, &header, &mut reader, &mut buf)?;
            drop(reader);

            if written != header.size_bytes {
                warn!(
                    "size_mismatch entry={} declared={} streamed={}",
                    entry, header.size_bytes, written
                );
            }
            debug!("entry_written plan={} entry={} bytes={}", plan.index, entry, written);

            outcome.item_count += 1;
            outcome.total_uncompressed_size = outcome.total_uncompressed_size.saturating_add(written);
            outcome.entries.push(EntryRecord {
                entry_path: entry,
                virtual_path: header.virtual_path,
                size: written,
            });
        }

        Ok(outcome)
    }
}

/// A container that accepts entries one at a time.
trait EntrySink {
    /// Write one entry and return the number of content bytes streamed.
    fn write_entry(
        &mut self,
        entry: &str,
        header: &ItemHeader,
        reader: &mut dyn Read,
        buf: &mut [u8],
    ) -> Result<u64, PackError>;
}

/// Largest entry the ZIP writer accepts without the ZIP64 extension.
const ZIP32_LIMIT: u64 = u32::MAX as u64;

/// Copy `reader` into `writer` through `buf`, keeping read and write
/// failures apart. A stream longer than `limit` fails as a read error before
/// the excess reaches the writer.
fn copy_bounded(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    buf: &mut [u8],
    virtual_path: &str,
    limit: u64,
) -> Result<u64, PackError> {
    let mut copied = 0u64;
    loop {
        let n = match reader.read(buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PackError::read(virtual_path, e)),
        };
        if copied + n as u64 > limit {
            return Err(PackError::read(
                virtual_path,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("content runs past {limit} bytes, beyond its declared size"),
                ),
            ));
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| PackError::sink(Some(virtual_path), e))?;
        copied += n as u64;
    }
    Ok(copied)
}

struct ZipSink<W: Write + Seek> {
    zip: zip::ZipWriter<W>,
    level: i32,
}

impl<W: Write + Seek> ZipSink<W> {
    fn new(sink: W, level: i32) -> Self {
        Self {
            zip: zip::ZipWriter::new(sink),
            level,
        }
    }

    fn finish(mut self) -> Result<W, PackError> {
        Ok(self.zip.finish()?)
    }
}

impl<W: Write + Seek> EntrySink for ZipSink<W> {
    fn write_entry(
        &mut self,
        entry: &str,
        header: &ItemHeader,
        reader: &mut dyn Read,
        buf: &mut [u8],
    ) -> Result<u64, PackError> {
        // ZIP64 is chosen from the declared size; an undeclared 4 GiB stream
        // is rejected instead of corrupting the entry
        let large = header.size_bytes >= ZIP32_LIMIT;
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .compression_level(Some(self.level))
            .last_modified_time(zip_time(header.last_modified))
            .unix_permissions(0o644)
            .large_file(large);

        self.zip
            .start_file(entry, options)
            .map_err(|e| with_item(PackError::from(e), &header.virtual_path))?;

        let limit = if large { u64::MAX } else { ZIP32_LIMIT };
        copy_bounded(reader, &mut self.zip, buf, &header.virtual_path, limit)
    }
}

/// ZIP timestamps cannot express dates before 1980; those fall back to the
/// format's epoch.
fn zip_time(ts: DateTime<Utc>) -> zip::DateTime {
    let year = u16::try_from(ts.year()).unwrap_or(0);
    zip::DateTime::from_date_and_time(
        year,
        ts.month() as u8,
        ts.day() as u8,
        ts.hour() as u8,
        ts.minute() as u8,
        ts.second() as u8,
    )
    .unwrap_or_default()
}

fn with_item(err: PackError, virtual_path: &str) -> PackError {
    match err {
        PackError::SinkWriteFailure { source, .. } => PackError::sink(Some(virtual_path), source),
        other => other,
    }
}

struct TarZstSink<W: Write> {
    builder: tar::Builder<zstd::stream::write::Encoder<'static, W>>,
}

impl<W: Write> TarZstSink<W> {
    fn new(sink: W, level: i32) -> Result<Self, PackError> {
        let encoder = zstd::stream::write::Encoder::new(sink, level).map_err(|e| PackError::sink(None, e))?;
        Ok(Self {
            builder: tar::Builder::new(encoder),
        })
    }

    fn finish(self) -> Result<W, PackError> {
        // Finish tar, then finish zstd.
        let encoder = self.builder.into_inner().map_err(|e| PackError::sink(None, e))?;
        encoder.finish().map_err(|e| PackError::sink(None, e))
    }
}

impl<W: Write> EntrySink for TarZstSink<W> {
    fn write_entry(
        &mut self,
        entry: &str,
        header: &ItemHeader,
        reader: &mut dyn Read,
        _buf: &mut [u8],
    ) -> Result<u64, PackError> {
        let mut tar_header = tar::Header::new_gnu();
        tar_header.set_entry_type(tar::EntryType::Regular);
        tar_header.set_size(header.size_bytes);
        tar_header.set_mode(0o644);
        tar_header.set_mtime(u64::try_from(header.last_modified.timestamp()).unwrap_or(0));

        let mut tracked = ExactReader::new(reader, header.size_bytes);
        let appended = self.builder.append_data(&mut tar_header, entry, &mut tracked);

        if let Some(err) = tracked.read_error.take() {
            return Err(PackError::read(&header.virtual_path, err));
        }
        appended.map_err(|e| PackError::sink(Some(&header.virtual_path), e))?;

        // tar headers carry the size up front; the stream has to match it.
        let mut probe = [0u8; 1];
        let extra = loop {
            match tracked.inner.read(&mut probe) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PackError::read(&header.virtual_path, e)),
            }
        };
        if tracked.copied != header.size_bytes || extra > 0 {
            return Err(PackError::read(
                &header.virtual_path,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("content length differs from declared size {}", header.size_bytes),
                ),
            ));
        }

        Ok(tracked.copied)
    }
}

/// Reader capped at the declared size that remembers source failures, so a
/// read error can be told apart from a sink error after `append_data`.
struct ExactReader<'a> {
    inner: &'a mut dyn Read,
    remaining: u64,
    copied: u64,
    read_error: Option<io::Error>,
}

impl<'a> ExactReader<'a> {
    fn new(inner: &'a mut dyn Read, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
            copied: 0,
            read_error: None,
        }
    }
}

impl Read for ExactReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        match self.inner.read(&mut buf[..max]) {
            Ok(n) => {
                self.remaining -= n as u64;
                self.copied += n as u64;
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                self.read_error = Some(e);
                Err(io::Error::new(kind, message))
            }
        }
    }
}
