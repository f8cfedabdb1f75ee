//! Command-line interface for AssetPack

use assetpack_core::settings::parse_size;
use assetpack_core::ArchiveFormat;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "assetpack")]
#[command(about = "AssetPack - Split content trees into size-bounded archives", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Zip,
    TarZst,
}

impl From<FormatArg> for ArchiveFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Zip => ArchiveFormat::Zip,
            FormatArg::TarZst => ArchiveFormat::TarZst,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Package every file under a directory into size-bounded archives
    Pack {
        /// Content root; virtual paths are relative to it
        root: PathBuf,

        /// Directory the archives are written to (defaults to system temp)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Max bytes per archive, e.g. 500M or 2G
        #[arg(long, value_parser = parse_size)]
        capacity: Option<u64>,

        /// Archive base name; archives are named <NAME>_001.<ext>, ...
        #[arg(long)]
        name: Option<String>,

        /// Sort items by ascending size before batching
        #[arg(long)]
        pre_sort: bool,

        /// Archive container format
        #[arg(long, value_enum)]
        format: Option<FormatArg>,

        /// Only include files with this extension (can be specified multiple times)
        #[arg(long = "ext")]
        extensions: Vec<String>,

        /// Number of archives written concurrently
        #[arg(long)]
        workers: Option<usize>,

        /// Deflate (zip) or zstd (tar-zst) level
        #[arg(long)]
        compression_level: Option<i32>,

        /// TOML settings file; command-line flags override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// SQLite ledger recording produced packages
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Write the JSON run report to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Skip the SHA-256 checksum file
        #[arg(long)]
        no_checksums: bool,
    },

    /// List archive contents
    List {
        /// Archive file (.zip or .tar.zst)
        archive: PathBuf,
    },

    /// Verify archives against a checksum file
    Verify {
        /// Checksum file written by `pack`
        checksums: PathBuf,
    },

    /// Show packages recorded in a ledger
    Ledger {
        /// Ledger database
        db: PathBuf,

        /// Export all package records as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },
}
