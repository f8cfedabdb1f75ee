//! AssetPack - size-bounded archive packaging

use anyhow::{Context, Result};
use assetpack_core::hash::verify_checksums;
use assetpack_core::inspect::list_entries;
use assetpack_core::ledger::PackageLedger;
use assetpack_core::{FsSource, PackSettings, PackageReport, Packager, ProgressFn};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod cli;
use cli::{Cli, Commands, FormatArg};

/// Command-line overrides applied on top of the settings file.
#[derive(Default)]
struct Overrides {
    output: Option<PathBuf>,
    capacity: Option<u64>,
    name: Option<String>,
    pre_sort: bool,
    format: Option<FormatArg>,
    workers: Option<usize>,
    compression_level: Option<i32>,
    ledger: Option<PathBuf>,
    no_checksums: bool,
}

fn build_settings(config: Option<&Path>, overrides: Overrides) -> Result<PackSettings> {
    let mut settings = match config {
        Some(path) => PackSettings::from_toml_file(path)?,
        None => PackSettings::default(),
    };

    if let Some(output) = overrides.output {
        settings.staging_dir = Some(output);
    }
    if let Some(capacity) = overrides.capacity {
        settings.capacity = capacity;
    }
    if let Some(name) = overrides.name {
        settings.naming_template = name;
    }
    if overrides.pre_sort {
        settings.pre_sort = true;
    }
    if let Some(format) = overrides.format {
        settings.format = format.into();
    }
    if let Some(workers) = overrides.workers {
        settings.workers = workers;
    }
    if overrides.compression_level.is_some() {
        settings.compression_level = overrides.compression_level;
    }
    if overrides.ledger.is_some() {
        settings.ledger_path = overrides.ledger;
    }
    if overrides.no_checksums {
        settings.checksums = false;
    }

    Ok(settings)
}

fn write_report(path: &Path, report: &PackageReport) -> Result<()> {
    let json = report.to_json().context("Failed to serialize report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write report to {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Pack {
            root,
            output,
            capacity,
            name,
            pre_sort,
            format,
            extensions,
            workers,
            compression_level,
            config,
            ledger,
            report,
            no_checksums,
        } => {
            let settings = build_settings(
                config.as_deref(),
                Overrides {
                    output,
                    capacity,
                    name,
                    pre_sort,
                    format,
                    workers,
                    compression_level,
                    ledger,
                    no_checksums,
                },
            )?;

            println!("AssetPack - Packaging: {}", root.display());
            println!();
            println!("Settings:");
            println!("  Capacity: {} bytes", settings.capacity);
            println!("  Name: {}", settings.naming_template);
            println!("  Format: {:?} (level {})", settings.format, settings.compression_level());
            println!("  Pre-sort: {}", settings.pre_sort);
            println!("  Workers: {}", settings.workers);
            println!("  Output: {}", settings.staging_dir().display());
            println!();

            let pb = ProgressBar::new(0);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                    .progress_chars("#>-"),
            );

            let pb_clone = pb.clone();
            let progress_fn: Arc<ProgressFn> = Arc::new(move |current: usize, total: usize, msg: &str| {
                pb_clone.set_length(total as u64);
                pb_clone.set_position(current as u64);
                pb_clone.set_message(msg.to_string());
            });

            let source = FsSource::new(&root).with_extensions(&extensions);
            let packager = Packager::new(settings).with_progress(progress_fn);

            let result = match packager.run(source.items()) {
                Ok(result) => result,
                Err(err) => {
                    pb.abandon_with_message("Failed");
                    if let Some(ref path) = report {
                        write_report(path, &PackageReport::failure(&err))?;
                    }
                    return Err(err).with_context(|| format!("Packaging {} failed", root.display()));
                }
            };

            pb.finish_with_message("Complete");
            if let Some(ref path) = report {
                write_report(path, &PackageReport::success(&result))?;
                info!("report_written path={}", path.display());
            }

            println!();
            println!("Packaging complete!");
            println!("  Packages: {}", result.len());
            println!("  Items: {}", result.total_items());
            for m in &result.manifests {
                println!(
                    "  {} - {} items, {} -> {} bytes",
                    m.name, m.item_count, m.total_uncompressed_size, m.compressed_size
                );
            }

            let total_original = result.total_uncompressed_size();
            let total_compressed = result.total_compressed_size();
            let ratio = if total_original > 0 {
                (total_compressed as f64 / total_original as f64) * 100.0
            } else {
                0.0
            };

            println!();
            println!("Compression statistics:");
            println!("  Original size: {} MB", total_original / 1_000_000);
            println!("  Compressed size: {} MB", total_compressed / 1_000_000);
            println!("  Ratio: {:.2}%", ratio);

            Ok(())
        }

        Commands::List { archive } => {
            println!("Listing contents of: {}", archive.display());
            let entries = list_entries(&archive)?;
            for entry in &entries {
                println!("  {:>12}  {}", entry.size, entry.name);
            }
            println!("{} entries", entries.len());
            Ok(())
        }

        Commands::Verify { checksums } => {
            let verified = verify_checksums(&checksums)
                .with_context(|| format!("Verification failed for {}", checksums.display()))?;
            println!("Verified {} archives", verified);
            Ok(())
        }

        Commands::Ledger { db, json } => {
            let ledger = PackageLedger::open(&db)?;
            let packages = ledger.list_packages()?;
            for p in &packages {
                println!(
                    "  [{}] {} - {} items, {} bytes ({})",
                    p.run_id, p.name, p.item_count, p.compressed_size, p.created_at
                );
            }
            println!("{} packages recorded", packages.len());

            if let Some(path) = json {
                ledger.export_json(&path)?;
                println!("Exported to {}", path.display());
            }
            Ok(())
        }
    }
}
