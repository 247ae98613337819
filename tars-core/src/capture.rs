//! Deterministic state capture.
//!
//! Walks a root directory and streams the contents of every included regular
//! file into a single SHA-256 digest. The byte stream itself is never
//! retained.
//!
//! ## Traversal order
//! Iterative depth-first walk over an explicit stack. Entries of every
//! directory are sorted by raw file-name bytes before they are visited, so the
//! order only depends on the names present on disk.
//!
//! ## Entries that never contribute bytes
//! - paths matched by the [`ExclusionSet`] (a matching directory prunes its
//!   whole subtree)
//! - symbolic links, sockets, FIFOs and device nodes
//! - files that cannot be read: these are logged and contribute empty
//!   content, even when the failure happens part-way through the file

use crate::crypto::StateHasher;
use crate::exclusion::ExclusionSet;
use crate::types::Hash256;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Capture-level failure. Aborts the current cycle only.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("state root '{path}' is inaccessible: {source}")]
    RootInaccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state root '{0}' is not a directory")]
    RootNotDirectory(PathBuf),
}

/// Per-file read failure. Never aborts a capture.
#[derive(Debug, Clone, Error)]
#[error("failed to read '{}': {message}", path.display())]
pub struct FileReadError {
    pub path: PathBuf,
    pub message: String,
}

/// Source of file contents. Swappable so capture can be exercised against
/// failing readers.
pub trait FileOpener: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
}

/// Opens files straight from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileOpener;

impl FileOpener for StdFileOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(path)?))
    }
}

/// Outcome of one capture run.
#[derive(Debug, Clone)]
pub struct CaptureReport {
    /// SHA-256 over the ordered concatenation of included file contents
    pub digest: Hash256,
    /// Regular files whose bytes entered the digest
    pub files_hashed: u64,
    /// Total bytes fed into the digest
    pub bytes_hashed: u64,
    /// Files and directories skipped by an exclusion rule
    pub entries_excluded: u64,
    /// Symlinks and special files skipped by policy
    pub entries_skipped: u64,
    /// Files or directories that could not be read
    pub unreadable: Vec<FileReadError>,
}

impl CaptureReport {
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

/// Captures state digests for a fixed exclusion set.
#[derive(Clone)]
pub struct StateCapture {
    exclusions: ExclusionSet,
    opener: Arc<dyn FileOpener>,
}

impl StateCapture {
    /// Capture from the local filesystem.
    pub fn new(exclusions: ExclusionSet) -> Self {
        Self::with_opener(exclusions, Arc::new(StdFileOpener))
    }

    pub fn with_opener(exclusions: ExclusionSet, opener: Arc<dyn FileOpener>) -> Self {
        Self { exclusions, opener }
    }

    pub fn exclusions(&self) -> &ExclusionSet {
        &self.exclusions
    }

    /// Walk `root` and digest every included file.
    ///
    /// Only an inaccessible root is an error; individual unreadable entries
    /// are reported in [`CaptureReport::unreadable`].
    pub fn capture(&self, root: &Path) -> Result<CaptureReport, CaptureError> {
        let meta = fs::metadata(root).map_err(|source| CaptureError::RootInaccessible {
            path: root.to_path_buf(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(CaptureError::RootNotDirectory(root.to_path_buf()));
        }

        let mut hasher = StateHasher::new();
        let mut report = CaptureReport {
            digest: [0u8; 32],
            files_hashed: 0,
            bytes_hashed: 0,
            entries_excluded: 0,
            entries_skipped: 0,
            unreadable: Vec::new(),
        };

        // Children are pushed in reverse so the smallest name is popped first.
        let mut stack: Vec<PathBuf> = Vec::new();
        self.push_children(root, &mut stack, &mut report);

        while let Some(path) = stack.pop() {
            if self.exclusions.is_excluded(&path) {
                debug!(path = %path.display(), "excluded");
                report.entries_excluded += 1;
                continue;
            }

            let file_type = match fs::symlink_metadata(&path) {
                Ok(meta) => meta.file_type(),
                Err(e) => {
                    record_unreadable(&mut report, &path, &e);
                    continue;
                }
            };

            if file_type.is_dir() {
                self.push_children(&path, &mut stack, &mut report);
            } else if file_type.is_file() {
                self.hash_file(&path, &mut hasher, &mut report);
            } else {
                debug!(path = %path.display(), "skipping symlink or special file");
                report.entries_skipped += 1;
            }
        }

        report.bytes_hashed = hasher.bytes_hashed();
        report.digest = hasher.finalize();
        Ok(report)
    }

    fn push_children(&self, dir: &Path, stack: &mut Vec<PathBuf>, report: &mut CaptureReport) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                record_unreadable(report, dir, &e);
                return;
            }
        };

        let mut children = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => children.push(entry.path()),
                Err(e) => record_unreadable(report, dir, &e),
            }
        }

        children.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        stack.extend(children.into_iter().rev());
    }

    fn hash_file(&self, path: &Path, hasher: &mut StateHasher, report: &mut CaptureReport) {
        let checkpoint = hasher.checkpoint();
        match self.stream_into(path, hasher) {
            Ok(()) => report.files_hashed += 1,
            Err(e) => {
                hasher.rollback(checkpoint);
                record_unreadable(report, path, &e);
            }
        }
    }

    fn stream_into(&self, path: &Path, hasher: &mut StateHasher) -> io::Result<()> {
        let mut reader = self.opener.open(path)?;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => hasher.update(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn record_unreadable(report: &mut CaptureReport, path: &Path, err: &io::Error) {
    warn!(path = %path.display(), error = %err, "unreadable entry treated as empty");
    report.unreadable.push(FileReadError {
        path: path.to_path_buf(),
        message: err.to_string(),
    });
}

/// Capture `root` with the given exclusions from the local filesystem.
pub fn capture(root: &Path, exclusions: &ExclusionSet) -> Result<CaptureReport, CaptureError> {
    StateCapture::new(exclusions.clone()).capture(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &[u8]) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn exclusions(patterns: &[&str]) -> ExclusionSet {
        ExclusionSet::new(patterns.iter().copied()).unwrap()
    }

    #[test]
    fn test_capture_is_deterministic() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "etc/wg0.conf", b"[Interface]");
        write(dir.path(), "bin/tool", b"\x7fELF");
        write(dir.path(), "a.txt", b"hello");

        let set = exclusions(&[]);
        let first = capture(dir.path(), &set).unwrap();
        let second = capture(dir.path(), &set).unwrap();
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.files_hashed, 3);
    }

    #[test]
    fn test_traversal_order_is_by_name() {
        let dir = TempDir::new().unwrap();
        // Created out of order on purpose.
        write(dir.path(), "c.txt", b"C");
        write(dir.path(), "a.txt", b"A");
        write(dir.path(), "b/inner.txt", b"B");

        let report = capture(dir.path(), &exclusions(&[])).unwrap();
        assert_eq!(report.digest, sha256(b"ABC"));
    }

    #[test]
    fn test_excluded_file_contributes_nothing() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"hello");
        write(dir.path(), "b.log", b"skip me");

        let report = capture(dir.path(), &exclusions(&["*.log"])).unwrap();
        assert_eq!(report.digest, sha256(b"hello"));
        assert_eq!(report.entries_excluded, 1);

        fs::write(dir.path().join("b.log"), b"rotated").unwrap();
        let again = capture(dir.path(), &exclusions(&["*.log"])).unwrap();
        assert_eq!(report.digest, again.digest);
    }

    #[test]
    fn test_included_file_change_changes_digest() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"hello");
        let before = capture(dir.path(), &exclusions(&[])).unwrap();

        write(dir.path(), "a.txt", b"hellp");
        let after = capture(dir.path(), &exclusions(&[])).unwrap();
        assert_ne!(before.digest, after.digest);
    }

    #[test]
    fn test_excluded_directory_prunes_subtree() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "keep.txt", b"keep");
        write(dir.path(), "cache/deep/x.bin", b"volatile");

        let report = capture(dir.path(), &exclusions(&["cache"])).unwrap();
        assert_eq!(report.digest, sha256(b"keep"));
        assert_eq!(report.entries_excluded, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"hello");
        std::os::unix::fs::symlink(dir.path().join("a.txt"), dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();

        let report = capture(dir.path(), &exclusions(&[])).unwrap();
        assert_eq!(report.digest, sha256(b"hello"));
        assert_eq!(report.entries_skipped, 2);
    }

    #[test]
    fn test_missing_root_is_capture_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let err = capture(&missing, &exclusions(&[])).unwrap_err();
        assert!(matches!(err, CaptureError::RootInaccessible { .. }));
    }

    #[test]
    fn test_file_root_is_capture_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"hello");
        let err = capture(&dir.path().join("a.txt"), &exclusions(&[])).unwrap_err();
        assert!(matches!(err, CaptureError::RootNotDirectory(_)));
    }

    /// Fails to open one file and breaks another half-way through.
    struct FlakyOpener {
        deny: PathBuf,
        truncate: PathBuf,
        opened: Mutex<Vec<PathBuf>>,
    }

    struct BreaksAfter {
        data: Vec<u8>,
        served: bool,
    }

    impl Read for BreaksAfter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::new(io::ErrorKind::Other, "device went away"));
            }
            self.served = true;
            let n = self.data.len().min(buf.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            Ok(n)
        }
    }

    impl FileOpener for FlakyOpener {
        fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
            self.opened.lock().unwrap().push(path.to_path_buf());
            if path == self.deny {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            if path == self.truncate {
                return Ok(Box::new(BreaksAfter {
                    data: b"partial".to_vec(),
                    served: false,
                }));
            }
            StdFileOpener.open(path)
        }
    }

    #[test]
    fn test_unreadable_files_contribute_empty_content() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"hel");
        write(dir.path(), "b.secret", b"nope");
        write(dir.path(), "c.dev", b"partial and more");
        write(dir.path(), "d.txt", b"lo");

        let opener = Arc::new(FlakyOpener {
            deny: dir.path().join("b.secret"),
            truncate: dir.path().join("c.dev"),
            opened: Mutex::new(Vec::new()),
        });
        let capture = StateCapture::with_opener(exclusions(&[]), opener.clone());
        let report = capture.capture(dir.path()).unwrap();

        assert_eq!(report.digest, sha256(b"hello"));
        assert_eq!(report.files_hashed, 2);
        assert_eq!(report.bytes_hashed, 5);
        assert_eq!(report.unreadable.len(), 2);
        assert_eq!(report.unreadable[0].path, dir.path().join("b.secret"));
        assert_eq!(report.unreadable[1].path, dir.path().join("c.dev"));
        assert_eq!(opener.opened.lock().unwrap().len(), 4);
    }
}
