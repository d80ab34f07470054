//! Background polling of a download folder for new vendor archives.
//!
//! One coarse loop: scan, import whatever is new through the same sequential
//! pipeline the CLI uses, sleep, check the stop flag. A running flag keeps
//! the background pass and a foreground import from entering the
//! non-reentrant import path at the same time.

use crate::importer::{ImportReport, Importer, MIN_ARCHIVE_BYTES};
use anyhow::Result;
use log::{debug, warn};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Archives above this size are not component drops; vendors ship parts as
/// small zips.
pub const MAX_ARCHIVE_BYTES: u64 = 50 * 1024 * 1024;

/// Tracks which archive names have already been seen so each file is fed to
/// the importer once.
pub struct DirectoryScanner {
    folder: PathBuf,
    known: HashSet<PathBuf>,
}

impl DirectoryScanner {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            known: HashSet::new(),
        }
    }

    /// Marks every archive currently present as seen without importing it.
    /// Used when the watcher should only pick up files arriving from now on.
    pub fn mark_existing(&mut self) {
        for path in self.candidate_files() {
            self.known.insert(path);
        }
    }

    /// New `*.zip` files in sorted order. Files outside the size bounds are
    /// left unmarked; a partially-downloaded archive is retried on the next
    /// scan once it has grown past the minimum.
    pub fn scan(&mut self) -> Vec<PathBuf> {
        let mut fresh: Vec<PathBuf> = self
            .candidate_files()
            .into_iter()
            .filter(|path| !self.known.contains(path))
            .collect();
        fresh.sort();
        for path in &fresh {
            self.known.insert(path.clone());
        }
        fresh
    }

    fn candidate_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.folder) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("zip"))
                    .unwrap_or(false)
            })
            .filter(|path| {
                fs::metadata(path)
                    .map(|meta| {
                        meta.is_file()
                            && meta.len() >= MIN_ARCHIVE_BYTES
                            && meta.len() <= MAX_ARCHIVE_BYTES
                    })
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// Clonable stop signal for a running [`ImportWatcher`].
#[derive(Clone)]
pub struct WatchHandle {
    stop: Arc<AtomicBool>,
}

impl WatchHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub struct ImportWatcher {
    scanner: DirectoryScanner,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl ImportWatcher {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            scanner: DirectoryScanner::new(folder),
            stop: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// See [`DirectoryScanner::mark_existing`].
    pub fn mark_existing(&mut self) {
        self.scanner.mark_existing();
    }

    pub fn handle(&self) -> WatchHandle {
        WatchHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Imports every archive the scanner has not seen yet. Returns `false`
    /// without scanning when another import pass holds the running flag.
    pub fn import_pending(
        &mut self,
        importer: &Importer,
        mut on_result: impl FnMut(&Path, &Result<ImportReport>),
    ) -> bool {
        if self.running.swap(true, Ordering::Acquire) {
            debug!("import already in progress, skipping scan");
            return false;
        }
        for path in self.scanner.scan() {
            let outcome = importer.import_archive(&path);
            if let Err(err) = &outcome {
                warn!("import of {} failed: {err:#}", path.display());
            }
            on_result(&path, &outcome);
        }
        self.running.store(false, Ordering::Release);
        true
    }

    /// Polls until the stop flag is raised. The flag is checked once per
    /// sleep interval; cancellation is cooperative, not preemptive.
    pub fn run(
        &mut self,
        importer: &Importer,
        interval: Duration,
        mut on_result: impl FnMut(&Path, &Result<ImportReport>),
    ) {
        while !self.stop.load(Ordering::Relaxed) {
            self.import_pending(importer, &mut on_result);
            thread::sleep(interval);
        }
        debug!("watch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(dir: &Path, name: &str, payload_len: usize) -> PathBuf {
        // Deflate-resistant filler so the archive clears the size floor.
        let mut state = 1u32;
        let payload: Vec<u8> = (0..payload_len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                state.to_le_bytes()[3]
            })
            .collect();
        let path = dir.join(name);
        let file = fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("FOO.step", options).unwrap();
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn scanner_reports_each_archive_once() {
        let dir = tempfile::tempdir().unwrap();
        write_zip(dir.path(), "b.zip", 4096);
        write_zip(dir.path(), "a.zip", 4096);
        let mut scanner = DirectoryScanner::new(dir.path());

        let first = scanner.scan();
        assert_eq!(first.len(), 2);
        assert!(first[0].ends_with("a.zip"));
        assert!(scanner.scan().is_empty());

        write_zip(dir.path(), "c.zip", 4096);
        let second = scanner.scan();
        assert_eq!(second.len(), 1);
        assert!(second[0].ends_with("c.zip"));
    }

    #[test]
    fn scanner_ignores_files_outside_size_bounds() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tiny.zip"), b"PK").unwrap();
        fs::write(dir.path().join("notes.txt"), b"not an archive").unwrap();
        let mut scanner = DirectoryScanner::new(dir.path());
        assert!(scanner.scan().is_empty());
    }

    #[test]
    fn mark_existing_suppresses_the_backlog() {
        let dir = tempfile::tempdir().unwrap();
        write_zip(dir.path(), "old.zip", 4096);
        let mut scanner = DirectoryScanner::new(dir.path());
        scanner.mark_existing();
        assert!(scanner.scan().is_empty());
    }

    #[test]
    fn running_flag_rejects_reentrant_passes() {
        let dir = tempfile::tempdir().unwrap();
        let importer = Importer::new(dir.path().join("lib"));
        let mut watcher = ImportWatcher::new(dir.path());
        watcher.running.store(true, Ordering::Relaxed);
        assert!(!watcher.import_pending(&importer, |_, _| {}));
        watcher.running.store(false, Ordering::Relaxed);
        assert!(watcher.import_pending(&importer, |_, _| {}));
    }

    #[test]
    fn pending_archives_flow_through_the_importer() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("downloads");
        fs::create_dir_all(&source).unwrap();
        write_zip(&source, "part.zip", 4096);

        let lib = dir.path().join("lib");
        let importer = Importer::new(&lib);
        let mut watcher = ImportWatcher::new(&source);
        let mut seen = Vec::new();
        watcher.import_pending(&importer, |path, outcome| {
            assert!(outcome.is_ok());
            seen.push(path.to_path_buf());
        });
        assert_eq!(seen.len(), 1);
        assert!(lib.join("Partial.3dshapes").join("FOO.step").exists());
    }

    #[test]
    fn stopped_watcher_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let importer = Importer::new(dir.path().join("lib"));
        let mut watcher = ImportWatcher::new(dir.path());
        watcher.handle().stop();
        watcher.run(&importer, Duration::from_millis(1), |_, _| {});
    }
}
