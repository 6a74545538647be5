//! Per-test-case scratch directories.

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{HarnessError, Result};
use crate::runner::Phase;

/// How many times removal is attempted when something is still busy.
const REMOVE_ATTEMPTS: u32 = 5;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// A fresh directory for one test case: a `work` subdirectory the test case
/// runs in, and next to it the results files the test case writes.
///
/// The whole tree is removed on drop.
#[derive(Debug)]
pub struct CaseDirectory {
    root: PathBuf,
    work: PathBuf,
    removed: bool,
}

impl CaseDirectory {
    /// Creates `<parent>/atf-run.<uuid>/work`.
    pub fn create(parent: &Path) -> Result<Self> {
        let root = parent.join(format!("atf-run.{}", Uuid::new_v4().simple()));
        fs::DirBuilder::new()
            .mode(0o700)
            .create(&root)
            .map_err(|e| HarnessError::io("cannot create directory", &root, e))?;

        let work = root.join("work");
        if let Err(e) = fs::DirBuilder::new().mode(0o755).create(&work) {
            let _ = fs::remove_dir_all(&root);
            return Err(HarnessError::io("cannot create directory", &work, e));
        }

        debug!(path = %root.display(), "created test case directory");
        Ok(Self {
            root,
            work,
            removed: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory the test case runs in and uses as `HOME`.
    pub fn work_path(&self) -> &Path {
        &self.work
    }

    /// Where the given phase writes its results file.
    pub fn results_path(&self, phase: Phase) -> PathBuf {
        self.root.join(format!("tcr.{phase}"))
    }

    /// Removes the directory tree now, reporting any failure.
    pub fn remove(mut self) -> Result<()> {
        self.removed = true;
        remove_tree(&self.root).map_err(|e| HarnessError::io("cannot remove", &self.root, e))
    }
}

impl Drop for CaseDirectory {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = remove_tree(&self.root) {
                warn!(path = %self.root.display(), error = %e, "cannot remove test case directory");
            }
        }
    }
}

/// Recursively removes `path`, first making every directory in it writable
/// (test cases may leave read-only directories behind) and retrying while
/// the kernel reports the tree as busy.
fn remove_tree(path: &Path) -> io::Result<()> {
    make_writable(path);

    let mut attempt = 1;
    loop {
        match fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < REMOVE_ATTEMPTS => {
                debug!(path = %path.display(), attempt, "directory busy, retrying removal");
                attempt += 1;
                sleep(REMOVE_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

fn make_writable(path: &Path) {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return;
    };
    if !metadata.is_dir() {
        return;
    }
    let mode = metadata.permissions().mode();
    if mode & 0o700 != 0o700 {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700));
    }
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            make_writable(&entry.path());
        }
    }
}
