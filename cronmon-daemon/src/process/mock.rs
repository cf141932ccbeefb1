//! A sleep-for-a-while process used to exercise the supervisor without
//! touching the OS.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::sync::watch;

use super::{ExitStatus, Process, WaitFuture};

/// Exit code sentinel while the process is still running.
const RUNNING: i32 = -2;

/// A fake child that idles for `run_for`, then exits 0.
///
/// SIGINT and SIGTERM are honoured after `signal_delay` (exit 0); SIGKILL is
/// always immediate (exit -1). The delay exercises the supervisor's
/// kill-escalation path. The exit code is decided exactly once; later
/// signals lose.
#[derive(Debug)]
pub struct SleepProcess {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    pid: i32,
    run_for: Duration,
    signal_delay: Duration,
    exit: AtomicI32,
    stopped_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
}

impl SleepProcess {
    pub fn new(run_for: Duration, signal_delay: Duration, pid: i32) -> Self {
        let (stopped_tx, stopped_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                pid,
                run_for,
                signal_delay,
                exit: AtomicI32::new(RUNNING),
                stopped_tx,
                stopped_rx,
            }),
        }
    }
}

impl Inner {
    /// Decide the exit code if it is still undecided; wakes the waiter on
    /// success.
    fn settle(&self, code: i32) -> bool {
        let settled = self
            .exit
            .compare_exchange(RUNNING, code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if settled {
            self.stopped_tx.send_replace(true);
        }
        settled
    }
}

impl Process for SleepProcess {
    fn pid(&self) -> i32 {
        self.inner.pid
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        let code = match signal {
            Signal::SIGINT | Signal::SIGTERM => 0,
            Signal::SIGKILL => -1,
            _ => return Err(io::Error::other("unknown signal")),
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if code != -1 && !inner.signal_delay.is_zero() {
                let mut stopped = inner.stopped_rx.clone();
                tokio::select! {
                    _ = tokio::time::sleep(inner.signal_delay) => {}
                    _ = stopped.wait_for(|stopped| *stopped) => return,
                }
            }
            inner.settle(code);
        });

        Ok(())
    }

    fn wait(&self) -> WaitFuture<'_> {
        Box::pin(async move {
            let mut stopped = self.inner.stopped_rx.clone();
            tokio::select! {
                _ = stopped.wait_for(|stopped| *stopped) => {}
                _ = tokio::time::sleep(self.inner.run_for) => {
                    self.inner.settle(0);
                }
            }

            ExitStatus {
                pid: self.inner.pid,
                code: self.inner.exit.load(Ordering::Acquire),
                error: None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOREVER: Duration = Duration::MAX;

    #[tokio::test(start_paused = true)]
    async fn exits_naturally_after_its_lifetime() {
        let proc = SleepProcess::new(Duration::from_secs(3), Duration::ZERO, 9);
        let status = proc.wait().await;
        assert_eq!(status, ExitStatus { pid: 9, code: 0, error: None });
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_is_honoured_immediately_without_delay() {
        let proc = SleepProcess::new(FOREVER, Duration::ZERO, 1);
        proc.signal(Signal::SIGINT).unwrap();
        let status = proc.wait().await;
        assert_eq!(status.code, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_beats_a_delayed_interrupt() {
        let proc = SleepProcess::new(FOREVER, FOREVER, 1);
        proc.signal(Signal::SIGINT).unwrap();
        proc.kill().unwrap();
        let status = proc.wait().await;
        assert_eq!(status.code, -1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_signals_are_rejected() {
        let proc = SleepProcess::new(FOREVER, Duration::ZERO, 1);
        assert!(proc.signal(Signal::SIGUSR1).is_err());
    }
}
