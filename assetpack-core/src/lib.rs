pub mod batcher;
pub mod cancel;
pub mod error;
pub mod hash;
pub mod inspect;
pub mod item;
pub mod ledger;
pub mod manifest;
pub mod orchestrator;
pub mod report;
pub mod settings;
pub mod source;
pub mod staging;
pub mod writer;

pub use batcher::{pack, PackagePlan};
pub use cancel::CancelToken;
pub use error::PackError;
pub use item::{ContentItem, ContentSource, FileContent, MemoryContent};
pub use manifest::{PackageManifest, PackagingResult};
pub use orchestrator::{run_packaging, Packager, ProgressFn};
pub use report::PackageReport;
pub use settings::PackSettings;
pub use source::FsSource;
pub use writer::{ArchiveFormat, ArchiveWriter};
