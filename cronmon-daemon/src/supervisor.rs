//! Per-service supervision.
//!
//! Each service file gets one [`ServiceSupervisor`]: a handle over a
//! dedicated actor task that owns the service's state. Control operations
//! (start, takeover, stop) travel over the actor's command channel and are
//! therefore serialised: the actor task is the only mutator of its state,
//! and it alone decides when to spawn, back off, or escalate a kill.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Sleep};
use tracing::debug;

use crate::errors::{CronmonError, Result};
use crate::events::Event;
use crate::journal::{Journaler, JournalerExt};
use crate::process::{self, Process};
use crate::status::StatusDir;

/// Grace period between the first graceful signal and SIGKILL.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Backoff schedule for restarting a failing service; the last entry repeats
/// indefinitely.
pub fn default_retry_backoff() -> Vec<Duration> {
    vec![
        Duration::ZERO,
        Duration::from_secs(5),
        Duration::from_secs(15),
        Duration::from_secs(30),
    ]
}

/// Tuning knobs for one supervisor instance.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub wait_timeout: Duration,
    /// Must not be empty.
    pub retry_backoff: Vec<Duration>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            retry_backoff: default_retry_backoff(),
        }
    }
}

/// Produces a new child process for the service on each (re)start attempt.
pub type SpawnFn = Box<dyn FnMut() -> io::Result<Arc<dyn Process>> + Send>;

enum Command {
    Start { restart: bool },
    Takeover { pid: i32 },
    Stop,
}

/// Handle over one service's supervision actor.
pub struct ServiceSupervisor {
    file: String,
    ctl_tx: mpsc::UnboundedSender<Command>,
    done_rx: Option<oneshot::Receiver<Result<()>>>,
}

impl ServiceSupervisor {
    /// Supervise `file` inside `dir`, spawning it as `dir/file` with no
    /// arguments and a status-file sentinel on fd 3.
    pub fn new(
        dir: &Path,
        file: &str,
        journal: Arc<dyn Journaler>,
        status: Arc<StatusDir>,
        options: SupervisorOptions,
    ) -> Self {
        let spawner = sentinel_spawner(
            dir.join(file),
            file.to_owned(),
            Arc::clone(&status),
            Arc::clone(&journal),
        );
        Self::with_spawner(file, journal, status, options, spawner)
    }

    /// Supervise `file` using an explicit spawner. This is the seam the test
    /// doubles go through.
    pub fn with_spawner(
        file: &str,
        journal: Arc<dyn Journaler>,
        status: Arc<StatusDir>,
        options: SupervisorOptions,
        spawner: SpawnFn,
    ) -> Self {
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let (dead_tx, dead_rx) = mpsc::channel(1);

        let actor = Actor {
            file: file.to_owned(),
            journal,
            status,
            spawner,
            wait_timeout: options.wait_timeout,
            retry_backoff: options.retry_backoff,
            proc: None,
            ctl_rx,
            dead_tx,
            dead_rx,
        };
        tokio::spawn(actor.run(done_tx));

        Self {
            file: file.to_owned(),
            ctl_tx,
            done_rx: Some(done_rx),
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// Start the service. With `restart = false` this is a no-op if a child
    /// is already live; with `restart = true` a live child is stopped first.
    pub fn start(&self, restart: bool) {
        let _ = self.ctl_tx.send(Command::Start { restart });
    }

    /// Adopt a still-running child from a previous instance. No-op if a
    /// child is already owned; on failure the service is reported dead and
    /// started fresh.
    pub fn takeover(&self, pid: i32) {
        let _ = self.ctl_tx.send(Command::Takeover { pid });
    }

    /// Stop the child and shut the actor down.
    ///
    /// Blocks until the actor has acknowledged: when this returns, no
    /// background routine of this supervisor is still running and the child
    /// has either exited or been SIGKILLed. Idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(done_rx) = self.done_rx.take() else {
            return Ok(());
        };

        let _ = self.ctl_tx.send(Command::Stop);
        done_rx.await.unwrap_or(Ok(()))
    }
}

/// The actor task behind a [`ServiceSupervisor`].
struct Actor {
    file: String,
    journal: Arc<dyn Journaler>,
    status: Arc<StatusDir>,
    spawner: SpawnFn,
    wait_timeout: Duration,
    retry_backoff: Vec<Duration>,
    proc: Option<Arc<dyn Process>>,
    ctl_rx: mpsc::UnboundedReceiver<Command>,
    dead_tx: mpsc::Sender<()>,
    dead_rx: mpsc::Receiver<()>,
}

impl Actor {
    async fn run(mut self, done: oneshot::Sender<Result<()>>) {
        // Backoff bookkeeping. The index advances on every failure and
        // resets once a child outlives its reset window.
        let mut backoff_ix: isize = -1;
        let mut reset_at = Instant::now();
        let mut start_timer: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                command = self.ctl_rx.recv() => match command {
                    Some(Command::Start { restart }) => self.start(restart).await,
                    Some(Command::Takeover { pid }) => self.takeover(pid),
                    Some(Command::Stop) | None => {
                        let result = self.stop_child().await;
                        let _ = done.send(result);
                        return;
                    }
                },

                () = async {
                    match start_timer.as_mut() {
                        Some(timer) => timer.as_mut().await,
                        None => std::future::pending().await,
                    }
                } => {
                    start_timer = None;
                    self.start(false).await;
                }

                Some(()) = self.dead_rx.recv() => {
                    self.proc = None;
                    start_timer = None;

                    let now = Instant::now();
                    if now > reset_at {
                        // The last child outlived its reset window, so that
                        // start counted as a success.
                        backoff_ix = -1;
                    }

                    let (start_delay, reset_window) =
                        next_backoff(&self.retry_backoff, &mut backoff_ix);
                    reset_at = now + reset_window;
                    start_timer = Some(Box::pin(tokio::time::sleep(start_delay)));

                    debug!(
                        file = %self.file,
                        delay_ms = start_delay.as_millis() as u64,
                        "service dead, restart scheduled"
                    );
                }
            }
        }
    }

    async fn start(&mut self, restart: bool) {
        if self.proc.is_some() {
            if !restart {
                return;
            }
            if let Err(err) = self.stop_child().await {
                self.journal.log(Event::Warning {
                    component: "process".to_owned(),
                    message: format!("failed to stop {} for restart: {err}", self.file),
                });
            }
        }

        self.spawn_child();
    }

    fn spawn_child(&mut self) {
        match (self.spawner)() {
            Ok(proc) => {
                self.proc = Some(Arc::clone(&proc));
                self.watch_exit(proc);
            }
            Err(err) => {
                self.journal.log(Event::ProcessSpawnError {
                    file: self.file.clone(),
                    reason: err.to_string(),
                });
                // Report the service dead so the loop schedules a retry.
                let _ = self.dead_tx.try_send(());
            }
        }
    }

    fn takeover(&mut self, pid: i32) {
        if self.proc.is_some() {
            // The newer spawn wins.
            return;
        }

        let status_file = self.status.sentinel_path(&self.file);

        let adopted = self
            .status
            .sentinel_held(&self.file, pid)
            .map_err(io::Error::other)
            .and_then(|()| process::find(pid));

        match adopted {
            Ok(proc) => {
                self.proc = Some(Arc::clone(&proc));
                // The child keeps the sentinel it already holds; no new one
                // is created.
                self.watch_exit(proc);
            }
            Err(err) => {
                self.journal.log(Event::ProcessTakeoverError {
                    file: self.file.clone(),
                    pid,
                    reason: err.to_string(),
                    status_file: status_file.display().to_string(),
                });
                let _ = self.dead_tx.try_send(());
            }
        }
    }

    /// Journal the spawn and watch for the exit in a dedicated task.
    ///
    /// The exit record is written before `dead` is signalled; the loop and
    /// `stop_child` rely on that ordering to never lose an exit.
    fn watch_exit(&self, proc: Arc<dyn Process>) {
        self.journal.log(Event::ProcessSpawned {
            file: self.file.clone(),
            pid: proc.pid(),
        });

        let journal = Arc::clone(&self.journal);
        let dead_tx = self.dead_tx.clone();
        let file = self.file.clone();

        tokio::spawn(async move {
            let status = proc.wait().await;

            journal.log(Event::ProcessExited {
                file,
                pid: status.pid,
                error: status.error,
                exit_code: status.code,
            });

            let _ = dead_tx.send(()).await;
        });
    }

    /// Stop the current child, escalating to SIGKILL after `wait_timeout`.
    async fn stop_child(&mut self) -> Result<()> {
        let Some(proc) = self.proc.take() else {
            return Ok(());
        };

        // SIGINT first; if the signal cannot be delivered at all, go
        // straight for the kill.
        if proc.signal(Signal::SIGINT).is_err() {
            let _ = proc.kill();
        }

        tokio::select! {
            Some(()) = self.dead_rx.recv() => Ok(()),
            () = tokio::time::sleep(self.wait_timeout) => {
                let _ = proc.kill();
                let _ = self.dead_rx.recv().await;
                Err(CronmonError::StopTimeout)
            }
        }
    }
}

/// Compute the next `(start_delay, reset_window)` pair and advance the
/// backoff cursor.
///
/// The reset cursor trails one step behind the start cursor's successor but
/// stops advancing two entries before the end, so the success horizon is
/// slightly longer than the next backoff without ever reaching the final
/// entry early. The tests pin these exact pairs; don't simplify the cursor
/// rule.
fn next_backoff(backoffs: &[Duration], ix: &mut isize) -> (Duration, Duration) {
    if backoffs.is_empty() {
        return (Duration::ZERO, Duration::ZERO);
    }

    let len = backoffs.len() as isize;
    let mut start_ix = *ix;
    let mut reset_ix = start_ix;

    if start_ix < len - 1 {
        start_ix += 1;
        reset_ix += 1;
        *ix = start_ix;

        if reset_ix < len - 2 {
            reset_ix += 1;
        }
    }

    (
        backoffs[start_ix as usize],
        backoffs[reset_ix as usize],
    )
}

/// The production spawner: create the sentinel, spawn with it on fd 3,
/// unlink the sentinel path immediately.
fn sentinel_spawner(
    arg0: std::path::PathBuf,
    file: String,
    status: Arc<StatusDir>,
    journal: Arc<dyn Journaler>,
) -> SpawnFn {
    Box::new(move || match status.create_sentinel(&file) {
        Ok(fd) => {
            let spawned = process::spawn(&arg0, vec![fd]);

            // The inode survives in the child's descriptor table; the path
            // must go regardless of how the spawn went.
            if let Err(err) = status.remove_sentinel(&file) {
                journal.log(Event::Warning {
                    component: "process".to_owned(),
                    message: format!("failed to remove status file: {err}"),
                });
            }

            spawned
        }
        Err(err) => {
            // Not fatal: the child just becomes impossible to take over.
            journal.log(Event::Warning {
                component: "process".to_owned(),
                message: format!(
                    "failed to make status file at {}: {err}",
                    status.sentinel_path(&file).display()
                ),
            });
            process::spawn(&arg0, Vec::new())
        }
    })
}

#[cfg(test)]
mod tests;
