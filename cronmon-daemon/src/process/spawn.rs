//! The real process spawner.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::debug;

use super::{ExitStatus, Process, WaitFuture};

/// Spawn `program` with no arguments and no stdio.
///
/// `extra_fds` are installed in the child starting at descriptor 3, in
/// order, after stdin/stdout/stderr; the supervisor uses slot 3 for the
/// status-file sentinel. The child gets a parent-death signal of SIGTERM on
/// platforms that support one, so an ungracefully dying supervisor takes its
/// children with it.
pub fn spawn(program: &Path, extra_fds: Vec<OwnedFd>) -> io::Result<Arc<dyn Process>> {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);

    let raw_fds: Vec<RawFd> = extra_fds.iter().map(|fd| fd.as_raw_fd()).collect();

    // SAFETY: runs in the forked child before exec. prctl, dup2 and fcntl
    // are async-signal-safe; nothing here allocates.
    unsafe {
        cmd.pre_exec(move || {
            let _ = cronmon_unix::set_parent_death_signal(libc::SIGTERM);

            for (slot, &fd) in raw_fds.iter().enumerate() {
                let target = 3 + slot as RawFd;
                if fd == target {
                    // Already in place; just clear close-on-exec.
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                    {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(fd, target) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    let child = cmd.spawn()?;
    // `extra_fds` stays alive until here, keeping the descriptors valid
    // through the fork; the child now holds its own duplicates.
    drop(extra_fds);

    let pid = child.id().map(|pid| pid as i32).unwrap_or(-1);
    debug!(program = %program.display(), pid, "spawned process");

    Ok(Arc::new(SpawnedProcess {
        pid,
        child: tokio::sync::Mutex::new(child),
    }))
}

/// A child we spawned ourselves; exit status comes from the OS wait.
#[derive(Debug)]
struct SpawnedProcess {
    pid: i32,
    child: tokio::sync::Mutex<Child>,
}

impl Process for SpawnedProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        kill(Pid::from_raw(self.pid), signal).map_err(io::Error::from)
    }

    fn wait(&self) -> WaitFuture<'_> {
        Box::pin(async move {
            let mut child = self.child.lock().await;
            match child.wait().await {
                Ok(status) => ExitStatus {
                    pid: self.pid,
                    // None means death by signal.
                    code: status.code().unwrap_or(-1),
                    error: None,
                },
                Err(err) => ExitStatus {
                    pid: self.pid,
                    code: -1,
                    error: Some(err.to_string()),
                },
            }
        })
    }
}
