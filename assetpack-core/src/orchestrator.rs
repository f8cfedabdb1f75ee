use chrono::Utc;
use log::{info, warn};
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::batcher::{self, PackagePlan};
use crate::cancel::CancelToken;
use crate::error::PackError;
use crate::hash;
use crate::item::{sort_by_size, ContentItem};
use crate::ledger::PackageLedger;
use crate::manifest::{package_name, summarize, PackageManifest, PackagingResult};
use crate::settings::PackSettings;
use crate::staging::StagedArchive;
use crate::writer::{ArchiveWriter, EntryRecord};

/// `(finished, total, message)` after each package.
pub type ProgressFn = dyn Fn(usize, usize, &str) + Send + Sync;

/// One finalized archive before the run is known to succeed.
#[derive(Debug)]
struct Produced {
    manifest: PackageManifest,
    entries: Vec<EntryRecord>,
}

/// Drives batching, archive writing and manifest building for one run.
pub struct Packager {
    settings: PackSettings,
    cancel: CancelToken,
    progress: Option<Arc<ProgressFn>>,
}

impl Packager {
    pub fn new(settings: PackSettings) -> Self {
        Self {
            settings,
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<ProgressFn>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn settings(&self) -> &PackSettings {
        &self.settings
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Package `items` into size-bounded archives in the staging directory.
    ///
    /// Either every plan is finalized and the manifests come back in plan
    /// order, or a single error names the failing plan. A failed run removes
    /// every archive it finalized; a cancelled run keeps them.
    pub fn run<I>(&self, items: I) -> Result<PackagingResult, PackError>
    where
        I: IntoIterator<Item = ContentItem>,
    {
        let settings = &self.settings;
        if settings.capacity == 0 {
            return Err(PackError::InvalidCapacity);
        }
        settings.validate()?;

        let mut items: Vec<ContentItem> = items.into_iter().collect();
        if items.is_empty() {
            return Err(PackError::NoItems);
        }
        if settings.pre_sort {
            sort_by_size(&mut items);
        }

        let item_count = items.len();
        let plans = batcher::pack(items, settings.capacity)?;
        let staging_dir = settings.staging_dir();
        info!(
            "packaging items={} plans={} capacity={} format={:?} staging={}",
            item_count,
            plans.len(),
            settings.capacity,
            settings.format,
            staging_dir.display()
        );

        self.check_destinations(&plans, &staging_dir)?;

        let run_cancel = self.cancel.child();
        let writer = ArchiveWriter::new(settings.format)
            .with_level(settings.compression_level())
            .with_buffer_size(settings.buffer_size)
            .with_root_prefix(settings.root_prefix.clone())
            .with_cancel(run_cancel.clone());

        let produced = if settings.workers > 1 && plans.len() > 1 {
            self.run_parallel(plans, &writer, &staging_dir, &run_cancel)?
        } else {
            self.run_sequential(plans, &writer, &staging_dir)?
        };

        self.finish_run(&staging_dir, &produced);

        Ok(PackagingResult {
            manifests: produced.into_iter().map(|p| p.manifest).collect(),
        })
    }

    /// Output of an earlier run is never overwritten, so a failing run cannot
    /// destroy archives it does not own.
    fn check_destinations(&self, plans: &[PackagePlan], staging_dir: &Path) -> Result<(), PackError> {
        let template = &self.settings.naming_template;
        for plan in plans {
            let dest = staging_dir.join(package_name(template, plan.index, self.settings.format));
            if dest.symlink_metadata().is_ok() {
                return Err(already_exists(&dest).in_plan(plan.index));
            }
        }
        if self.settings.checksums {
            let sums_path = checksums_path(staging_dir, template);
            if sums_path.symlink_metadata().is_ok() {
                return Err(already_exists(&sums_path));
            }
        }
        Ok(())
    }

    fn run_sequential(
        &self,
        plans: Vec<PackagePlan>,
        writer: &ArchiveWriter,
        staging_dir: &Path,
    ) -> Result<Vec<Produced>, PackError> {
        let total = plans.len();
        self.report(0, total, "Packaging...");

        let mut produced: Vec<Produced> = Vec::with_capacity(total);
        for plan in plans {
            let index = plan.index;
            let result = if self.cancel.is_cancelled() {
                Err(PackError::Cancelled)
            } else {
                self.process_plan(plan, writer, staging_dir)
            };

            match result {
                Ok(p) => {
                    self.report(produced.len() + 1, total, &p.manifest.name);
                    produced.push(p);
                }
                Err(err) => return Err(self.abort(err, index, &produced)),
            }
        }

        Ok(produced)
    }

    /// Plans are independent once emitted, so they can be written on a pool.
    /// The first failure trips `run_cancel` so the other workers stop early.
    fn run_parallel(
        &self,
        plans: Vec<PackagePlan>,
        writer: &ArchiveWriter,
        staging_dir: &Path,
        run_cancel: &CancelToken,
    ) -> Result<Vec<Produced>, PackError> {
        let total = plans.len();
        self.report(0, total, "Packaging...");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.workers)
            .build()
            .map_err(|e| PackError::InvalidSettings(format!("failed to create worker pool: {e}")))?;

        let (tx, rx) = flume::unbounded::<String>();
        let progress = self.progress.clone();
        let progress_thread = std::thread::spawn(move || {
            let mut done = 0usize;
            while let Ok(name) = rx.recv() {
                done += 1;
                if let Some(cb) = &progress {
                    cb(done, total, &name);
                }
            }
        });

        let results: Vec<(u32, Result<Produced, PackError>)> = pool.install(|| {
            plans
                .into_par_iter()
                .map(|plan| {
                    let index = plan.index;
                    if run_cancel.is_cancelled() {
                        return (index, Err(PackError::Cancelled));
                    }
                    let result = self.process_plan(plan, writer, staging_dir);
                    match &result {
                        Ok(p) => {
                            if tx.send(p.manifest.name.clone()).is_err() {
                                warn!("progress_dropped plan={} (reporter thread gone)", index);
                            }
                        }
                        Err(e) if !e.is_cancelled() => run_cancel.cancel(),
                        Err(_) => {}
                    }
                    (index, result)
                })
                .collect()
        });

        drop(tx);
        if progress_thread.join().is_err() {
            warn!("Progress reporter thread panicked");
        }

        let mut produced = Vec::with_capacity(results.len());
        let mut failure: Option<(u32, PackError)> = None;
        let mut cancelled: Option<u32> = None;
        for (index, result) in results {
            match result {
                Ok(p) => produced.push(p),
                Err(e) if e.is_cancelled() => {
                    cancelled.get_or_insert(index);
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some((index, e));
                    }
                }
            }
        }

        if let Some((index, err)) = failure {
            return Err(self.abort(err, index, &produced));
        }
        if let Some(index) = cancelled {
            return Err(self.abort(PackError::Cancelled, index, &produced));
        }
        Ok(produced)
    }

    fn process_plan(&self, plan: PackagePlan, writer: &ArchiveWriter, staging_dir: &Path) -> Result<Produced, PackError> {
        let index = plan.index;
        let name = package_name(&self.settings.naming_template, index, writer.format());

        let staged = StagedArchive::create(staging_dir, &name).map_err(staging_error)?;
        let sink = staged.writer().map_err(staging_error)?;

        let (outcome, sink) = writer.write(plan, sink)?;
        drop(sink);

        let compressed_size = staged.len().map_err(staging_error)?;
        let sha256 = if self.settings.checksums {
            Some(hash::sha256_file_hex(staged.path()).map_err(staging_error)?)
        } else {
            None
        };
        let path = staged.commit().map_err(staging_error)?;

        let manifest = summarize(index, path, &outcome, compressed_size, sha256);
        info!(
            "package_finalized name={} items={} uncompressed={} compressed={} ratio={:.3}",
            manifest.name,
            manifest.item_count,
            manifest.total_uncompressed_size,
            manifest.compressed_size,
            manifest.compression_ratio
        );

        Ok(Produced {
            manifest,
            entries: outcome.entries,
        })
    }

    /// Apply the failure policy and attach the plan index.
    fn abort(&self, err: PackError, index: u32, produced: &[Produced]) -> PackError {
        if err.is_cancelled() {
            warn!(
                "packaging_cancelled plan={} finalized={} (kept)",
                index,
                produced.len()
            );
        } else {
            warn!("packaging_failed plan={} error={}", index, err);
            discard(produced);
        }
        err.in_plan(index)
    }

    fn finish_run(&self, staging_dir: &Path, produced: &[Produced]) {
        if self.settings.checksums {
            let sums: Vec<(String, String)> = produced
                .iter()
                .filter_map(|p| p.manifest.sha256.clone().map(|h| (h, p.manifest.name.clone())))
                .collect();
            let sums_path = checksums_path(staging_dir, &self.settings.naming_template);
            if let Err(e) = hash::write_checksums_file(&sums, &sums_path) {
                warn!("checksums_write_failed path={} error={:#}", sums_path.display(), e);
            }
        }

        if let Some(ref db_path) = self.settings.ledger_path {
            let run_id = format!(
                "{}-{}",
                self.settings.naming_template,
                Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
            );
            let packages: Vec<(PackageManifest, Vec<EntryRecord>)> = produced
                .iter()
                .map(|p| (p.manifest.clone(), p.entries.clone()))
                .collect();
            let recorded = PackageLedger::open(db_path).and_then(|mut ledger| ledger.record_run(&run_id, &packages));
            if let Err(e) = recorded {
                warn!("ledger_record_failed db={} error={:#}", db_path.display(), e);
            }
        }
    }

    fn report(&self, current: usize, total: usize, msg: &str) {
        if let Some(ref cb) = self.progress {
            cb(current, total, msg);
        }
    }
}

/// Run a packaging pass with default cancellation and no progress reporting.
pub fn run_packaging<I>(items: I, settings: &PackSettings) -> Result<PackagingResult, PackError>
where
    I: IntoIterator<Item = ContentItem>,
{
    Packager::new(settings.clone()).run(items)
}

fn staging_error(err: anyhow::Error) -> PackError {
    PackError::sink(None, io::Error::new(io::ErrorKind::Other, format!("{err:#}")))
}

fn checksums_path(staging_dir: &Path, template: &str) -> PathBuf {
    staging_dir.join(format!("{template}.sha256"))
}

fn already_exists(path: &Path) -> PackError {
    PackError::sink(
        None,
        io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", path.display()),
        ),
    )
}

fn discard(produced: &[Produced]) {
    for p in produced {
        if let Err(e) = fs::remove_file(&p.manifest.path) {
            warn!("discard_failed file={} error={}", p.manifest.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ContentSource, MemoryContent};
    use crate::writer::ArchiveFormat;
    use anyhow::Result;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn settings(dir: &TempDir, capacity: u64) -> PackSettings {
        PackSettings {
            capacity,
            naming_template: "pkg".to_string(),
            staging_dir: Some(dir.path().to_path_buf()),
            ..PackSettings::default()
        }
    }

    fn sized(name: &str, size: usize) -> ContentItem {
        ContentItem::from_bytes(name, vec![b'a'; size])
    }

    /// Content whose open fails, counting how often it was attempted.
    struct Unreadable(Arc<AtomicUsize>);

    impl ContentSource for Unreadable {
        fn open(self: Box<Self>) -> io::Result<Box<dyn Read + Send>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
        }
    }

    fn archives_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".zip") || n.ends_with(".tar.zst"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn packs_items_into_sequential_archives() -> Result<()> {
        let dir = TempDir::new()?;
        let result = run_packaging(
            vec![sized("A", 30), sized("B", 40), sized("C", 50)],
            &settings(&dir, 100),
        )?;

        assert_eq!(result.len(), 2);
        let m1 = &result.manifests[0];
        let m2 = &result.manifests[1];
        assert_eq!((m1.index, m1.name.as_str(), m1.item_count, m1.total_uncompressed_size), (1, "pkg_001.zip", 2, 70));
        assert_eq!((m2.index, m2.name.as_str(), m2.item_count, m2.total_uncompressed_size), (2, "pkg_002.zip", 1, 50));
        assert_eq!(m1.compressed_size, fs::metadata(&m1.path)?.len());
        assert!(m1.sha256.is_some());
        assert_eq!(archives_in(dir.path()), vec!["pkg_001.zip", "pkg_002.zip"]);
        assert_eq!(hash::verify_checksums(dir.path().join("pkg.sha256"))?, 2);
        Ok(())
    }

    #[test]
    fn empty_input_is_no_items() {
        let dir = TempDir::new().unwrap();
        let err = run_packaging(Vec::new(), &settings(&dir, 100)).unwrap_err();
        assert!(matches!(err, PackError::NoItems));
        assert!(archives_in(dir.path()).is_empty());
    }

    #[test]
    fn zero_capacity_rejected_before_work() {
        let dir = TempDir::new().unwrap();
        let err = run_packaging(vec![sized("A", 1)], &settings(&dir, 0)).unwrap_err();
        assert!(matches!(err, PackError::InvalidCapacity));
        assert!(archives_in(dir.path()).is_empty());
    }

    #[test]
    fn empty_content_has_zero_ratio() -> Result<()> {
        let dir = TempDir::new()?;
        let result = run_packaging(vec![sized("empty.txt", 0)], &settings(&dir, 100))?;
        assert_eq!(result.manifests[0].total_uncompressed_size, 0);
        assert_eq!(result.manifests[0].compression_ratio, 0.0);
        Ok(())
    }

    #[test]
    fn failure_discards_earlier_archives() -> Result<()> {
        let dir = TempDir::new()?;
        let opened = Arc::new(AtomicUsize::new(0));
        let items = vec![
            sized("first/a", 60),
            sized("first/b", 30),
            sized("second/a", 50),
            ContentItem::new("second/bad", 10, Utc::now(), Unreadable(opened.clone())),
            sized("third/a", 90),
        ];

        let err = run_packaging(items, &settings(&dir, 100)).unwrap_err();
        assert_eq!(err.plan_index(), Some(2));
        assert_eq!(err.virtual_path(), Some("second/bad"));
        assert!(matches!(err.root_cause(), PackError::ItemReadFailure { .. }));
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        // nothing from the run survives, not even temp files
        let leftovers: Vec<_> = fs::read_dir(dir.path())?.filter_map(|e| e.ok()).collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        Ok(())
    }

    #[test]
    fn cancellation_keeps_finalized_archives() -> Result<()> {
        let dir = TempDir::new()?;
        let cancel = CancelToken::new();
        let trip = cancel.clone();
        let progress: Arc<ProgressFn> = Arc::new(move |done, _total, _msg| {
            if done == 1 {
                trip.cancel();
            }
        });

        let packager = Packager::new(settings(&dir, 10))
            .with_cancel(cancel)
            .with_progress(progress);
        let err = packager
            .run(vec![sized("a", 10), sized("b", 10), sized("c", 10)])
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.plan_index(), Some(2));
        assert_eq!(archives_in(dir.path()), vec!["pkg_001.zip"]);
        Ok(())
    }

    #[test]
    fn duplicate_paths_fail_the_run() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(&dir, 100);
        s.root_prefix = Some("/dam".into());
        let err = run_packaging(vec![sized("/dam/x.png", 1), sized("x.png", 1)], &s).unwrap_err();
        assert_eq!(err.plan_index(), Some(1));
        assert!(matches!(err.root_cause(), PackError::DuplicateEntryPath { .. }));
    }

    #[test]
    fn pre_sort_orders_items_before_batching() -> Result<()> {
        let items = || vec![sized("big", 90), sized("s1", 5), sized("mid", 80), sized("s2", 5)];

        let dir = TempDir::new()?;
        let unsorted = run_packaging(items(), &settings(&dir, 100))?;
        let counts: Vec<u32> = unsorted.manifests.iter().map(|m| m.item_count).collect();
        assert_eq!(counts, vec![2, 2]);

        let dir = TempDir::new()?;
        let mut s = settings(&dir, 100);
        s.pre_sort = true;
        let sorted = run_packaging(items(), &s)?;
        // 5+5+80 | 90
        let counts: Vec<u32> = sorted.manifests.iter().map(|m| m.item_count).collect();
        assert_eq!(counts, vec![3, 1]);
        Ok(())
    }

    #[test]
    fn parallel_workers_keep_plan_order() -> Result<()> {
        let dir = TempDir::new()?;
        let mut s = settings(&dir, 100);
        s.workers = 4;
        s.format = ArchiveFormat::TarZst;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let progress: Arc<ProgressFn> = Arc::new(move |done, total, _msg| {
            seen_cb.lock().unwrap().push((done, total));
        });

        let items: Vec<_> = (0..12).map(|i| sized(&format!("f{i:02}"), 40)).collect();
        let result = Packager::new(s).with_progress(progress).run(items)?;

        assert_eq!(result.len(), 6);
        let indices: Vec<u32> = result.manifests.iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(result.manifests[5].name, "pkg_006.tar.zst");
        assert_eq!(result.total_items(), 12);
        assert_eq!(seen.lock().unwrap().last(), Some(&(6, 6)));
        Ok(())
    }

    #[test]
    fn parallel_failure_is_all_or_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let mut s = settings(&dir, 100);
        s.workers = 3;

        let mut items: Vec<_> = (0..6).map(|i| sized(&format!("ok{i}"), 90)).collect();
        items.insert(3, ContentItem::new("bad", 90, Utc::now(), Unreadable(Arc::new(AtomicUsize::new(0)))));

        let err = Packager::new(s).run(items).unwrap_err();
        assert_eq!(err.plan_index(), Some(4));
        assert_eq!(err.virtual_path(), Some("bad"));
        assert!(archives_in(dir.path()).is_empty());
        Ok(())
    }

    #[test]
    fn panicking_progress_callback_does_not_fail_parallel_run() -> Result<()> {
        let dir = TempDir::new()?;
        let mut s = settings(&dir, 100);
        s.workers = 2;

        let progress: Arc<ProgressFn> = Arc::new(|done, _total, _msg| {
            if done >= 1 {
                panic!("progress sink broke");
            }
        });

        let items: Vec<_> = (0..4).map(|i| sized(&format!("f{i}"), 90)).collect();
        let result = Packager::new(s).with_progress(progress).run(items)?;
        assert_eq!(result.len(), 4);
        assert_eq!(archives_in(dir.path()).len(), 4);
        Ok(())
    }

    #[test]
    fn second_run_leaves_earlier_output_alone() -> Result<()> {
        let dir = TempDir::new()?;
        let first = run_packaging(vec![sized("a", 60), sized("b", 60)], &settings(&dir, 100))?;
        let before: Vec<Vec<u8>> = first.manifests.iter().map(|m| fs::read(&m.path)).collect::<io::Result<_>>()?;

        let items = vec![
            sized("c", 60),
            ContentItem::new("d", 60, Utc::now(), Unreadable(Arc::new(AtomicUsize::new(0)))),
        ];
        let err = run_packaging(items, &settings(&dir, 100)).unwrap_err();
        assert_eq!(err.plan_index(), Some(1));
        match err.root_cause() {
            PackError::SinkWriteFailure { source, .. } => assert_eq!(source.kind(), io::ErrorKind::AlreadyExists),
            other => panic!("unexpected error: {other}"),
        }

        let after: Vec<Vec<u8>> = first.manifests.iter().map(|m| fs::read(&m.path)).collect::<io::Result<_>>()?;
        assert_eq!(before, after);
        assert_eq!(hash::verify_checksums(dir.path().join("pkg.sha256"))?, 2);
        Ok(())
    }

    #[test]
    fn stale_checksum_file_blocks_run() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("pkg.sha256"), "")?;

        let err = run_packaging(vec![sized("a", 1)], &settings(&dir, 100)).unwrap_err();
        assert_eq!(err.plan_index(), None);
        assert!(matches!(err, PackError::SinkWriteFailure { .. }));
        assert!(archives_in(dir.path()).is_empty());

        let mut s = settings(&dir, 100);
        s.checksums = false;
        assert_eq!(run_packaging(vec![sized("a", 1)], &s)?.len(), 1);
        Ok(())
    }

    #[test]
    fn ledger_records_successful_run() -> Result<()> {
        let dir = TempDir::new()?;
        let db = dir.path().join("ledger.sqlite");
        let mut s = settings(&dir, 100);
        s.ledger_path = Some(db.clone());

        run_packaging(
            vec![
                ContentItem::new("/a.txt", 3, Utc::now(), MemoryContent::new(b"aaa".to_vec())),
                sized("b.txt", 99),
            ],
            &s,
        )?;

        let ledger = PackageLedger::open(&db)?;
        let packages = ledger.list_packages()?;
        assert_eq!(packages.len(), 2);
        assert_eq!(ledger.find_package_for("b.txt")?, Some("pkg_002.zip".to_string()));
        let entries = ledger.package_entries(packages[0].id.unwrap())?;
        assert_eq!(entries[0].entry_path, "a.txt");
        Ok(())
    }
}
