//! Portable handle over a supervised OS process.
//!
//! The supervisor only ever needs four capabilities: the PID, signal
//! delivery, forceful kill, and an awaitable exit. [`spawn`] produces a
//! handle for a child we created; [`find`] produces one for a still-running
//! child adopted from a previous cronmon instance; [`SleepProcess`] is the
//! test double.

mod mock;
mod spawn;

pub use mock::SleepProcess;
pub use spawn::spawn;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// Poll interval for adopted processes when no pidfd is available.
const ADOPTED_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How a child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub pid: i32,
    /// Exit code; -1 when the child died to an uncatchable signal or the
    /// status could not be collected.
    pub code: i32,
    pub error: Option<String>,
}

pub type WaitFuture<'a> = Pin<Box<dyn Future<Output = ExitStatus> + Send + 'a>>;

/// A running process owned or adopted by a supervisor.
///
/// Handles are shared between the supervisor (which signals) and its wait
/// routine (which blocks for the exit), hence `&self` everywhere.
pub trait Process: Send + Sync + std::fmt::Debug {
    fn pid(&self) -> i32;

    fn signal(&self, signal: Signal) -> io::Result<()>;

    fn kill(&self) -> io::Result<()> {
        self.signal(Signal::SIGKILL)
    }

    /// Resolves exactly once, when the process has exited. Only one caller
    /// may wait.
    fn wait(&self) -> WaitFuture<'_>;
}

/// Adopt a running process by PID.
///
/// The process is not our OS child, so its exit status can never be reaped;
/// exit detection goes through a pidfd where the platform has one and falls
/// back to a liveness poll elsewhere.
pub fn find(pid: i32) -> io::Result<Arc<dyn Process>> {
    if !cronmon_unix::process_alive(pid) {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no process with pid {pid}"),
        ));
    }

    let pidfd = match cronmon_unix::pidfd_open(pid) {
        Ok(fd) => Some(AsyncFd::with_interest(fd, Interest::READABLE)?),
        Err(_) => None,
    };

    Ok(Arc::new(AdoptedProcess { pid, pidfd }))
}

/// A process taken over from a previous supervisor instance.
#[derive(Debug)]
struct AdoptedProcess {
    pid: i32,
    pidfd: Option<AsyncFd<std::os::fd::OwnedFd>>,
}

impl Process for AdoptedProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        kill(Pid::from_raw(self.pid), signal).map_err(io::Error::from)
    }

    fn wait(&self) -> WaitFuture<'_> {
        Box::pin(async move {
            match &self.pidfd {
                // A pidfd polls readable once the process exits.
                Some(fd) => {
                    let _ = fd.readable().await;
                }
                None => {
                    while cronmon_unix::process_alive(self.pid) {
                        tokio::time::sleep(ADOPTED_POLL_INTERVAL).await;
                    }
                }
            }

            ExitStatus {
                pid: self.pid,
                code: -1,
                error: Some("exit status unavailable for adopted process".to_owned()),
            }
        })
    }
}
