//! The status directory: liveness-by-refcounted-descriptor.
//!
//! For every child it spawns, the monitor creates a zero-length sentinel
//! file under `${TMPDIR}/cronmon/<journal_id_hash>/`, hands the open
//! descriptor to the child as fd 3 and unlinks the path immediately. The
//! inode then lives exactly as long as the child does. A later cronmon
//! instance deciding whether a recorded PID is still "its" child checks
//! whether that process still holds fd 3 pointing at the sentinel path; a
//! recycled PID or a dead child cannot pass that test.

use std::fs::{DirBuilder, OpenOptions};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

/// The descriptor slot the sentinel occupies in a child, right after stdio.
pub const SENTINEL_FD: i32 = 3;

/// A per-journal directory of sentinel files.
///
/// The directory name hashes the journal identifier, so supervisors sharing
/// a journal share the directory and distinct journals never collide.
#[derive(Debug, Clone)]
pub struct StatusDir {
    dir: PathBuf,
}

impl StatusDir {
    /// Open (creating if needed, mode 0700) the status directory for
    /// `journal_id` under the system temp directory.
    pub fn open(journal_id: &str) -> io::Result<Self> {
        Self::open_in(std::env::temp_dir(), journal_id)
    }

    /// As [`StatusDir::open`], rooted at an explicit temp directory.
    pub fn open_in(tmpdir: impl Into<PathBuf>, journal_id: &str) -> io::Result<Self> {
        let digest = md5::compute(journal_id.as_bytes());
        let hash = URL_SAFE_NO_PAD.encode(digest.0);

        let dir = tmpdir.into().join("cronmon").join(hash);
        DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn sentinel_path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Create the sentinel for `file` and return its descriptor, opened
    /// read-only so the child cannot scribble on it. The caller unlinks the
    /// path (via [`StatusDir::remove_sentinel`]) once the descriptor has
    /// been handed to the child.
    pub fn create_sentinel(&self, file: &str) -> io::Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .mode(0o700)
            .custom_flags(libc::O_CREAT | libc::O_CLOEXEC)
            .open(self.sentinel_path(file))?;
        Ok(OwnedFd::from(file))
    }

    pub fn remove_sentinel(&self, file: &str) -> io::Result<()> {
        std::fs::remove_file(self.sentinel_path(file))
    }

    /// Decide whether `pid` still holds the sentinel for `file` on fd 3.
    ///
    /// The sentinel path is unlinked while the child lives, so the check
    /// goes through the process's fd table; the kernel reports unlinked
    /// targets with a ` (deleted)` suffix.
    pub fn sentinel_held(&self, file: &str, pid: i32) -> Result<(), String> {
        let want = self.sentinel_path(file);

        let target = cronmon_unix::fd_path(pid, SENTINEL_FD)
            .map_err(|err| format!("cannot inspect fd {SENTINEL_FD} of pid {pid}: {err}"))?;

        let target_str = target.to_string_lossy();
        let want_str = want.to_string_lossy();
        if target_str == want_str || target_str == format!("{want_str} (deleted)") {
            Ok(())
        } else {
            Err(format!(
                "fd {SENTINEL_FD} of pid {pid} points at '{target_str}', not the status file"
            ))
        }
    }
}
