//! The top-level monitor.
//!
//! Owns the map of per-service supervisors and is its only mutator: one loop
//! multiplexes control commands, watcher events and shutdown, so every
//! mutation of the service map happens on that loop. Startup emits the
//! `acquired lock` record before anything else, then rescans the scripts
//! directory; the restore path additionally adopts children recorded by the
//! previous instance.

use std::collections::HashMap;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::errors::Result;
use crate::events::{Event, ListOp};
use crate::journal::{Journaler, JournalerExt, PreviousState};
use crate::status::StatusDir;
use crate::supervisor::{ServiceSupervisor, SpawnFn, SupervisorOptions};
use crate::watcher::{is_executable, DirWatcher};

/// Builds the spawner for a service file; lets tests substitute process
/// doubles for the whole monitor.
pub type SpawnerFactory = Arc<dyn Fn(&str) -> SpawnFn + Send + Sync>;

#[derive(Clone, Default)]
pub struct MonitorOptions {
    pub supervisor: SupervisorOptions,
    /// When set, supervisors spawn through this factory instead of executing
    /// the service files.
    pub spawner_factory: Option<SpawnerFactory>,
}

enum Command {
    /// Walk the scripts directory and add every eligible file, adopting the
    /// PIDs in `previous` where possible.
    Rescan { previous: HashMap<String, i32> },
    Stop,
}

/// Handle over the monitor loop.
pub struct Monitor {
    ctl_tx: mpsc::UnboundedSender<Command>,
    done_rx: Option<oneshot::Receiver<()>>,
}

impl Monitor {
    /// Start supervising `dir` from a clean slate.
    pub fn new(dir: impl Into<PathBuf>, journal: Arc<dyn Journaler>) -> Result<Self> {
        Self::with_options(dir, journal, MonitorOptions::default())
    }

    pub fn with_options(
        dir: impl Into<PathBuf>,
        journal: Arc<dyn Journaler>,
        options: MonitorOptions,
    ) -> Result<Self> {
        let dir = dir.into();
        ensure_scripts_dir(&dir)?;
        let watcher = DirWatcher::watch(dir.clone(), Arc::clone(&journal));
        Self::start(dir, journal, options, HashMap::new(), watcher)
    }

    /// Start supervising `dir`, adopting the still-running children of the
    /// previous instance instead of respawning them.
    pub fn restore(
        dir: impl Into<PathBuf>,
        journal: Arc<dyn Journaler>,
        previous: PreviousState,
    ) -> Result<Self> {
        Self::restore_with_options(dir, journal, previous, MonitorOptions::default())
    }

    pub fn restore_with_options(
        dir: impl Into<PathBuf>,
        journal: Arc<dyn Journaler>,
        previous: PreviousState,
        options: MonitorOptions,
    ) -> Result<Self> {
        let dir = dir.into();
        ensure_scripts_dir(&dir)?;
        let watcher = DirWatcher::watch(dir.clone(), Arc::clone(&journal));
        Self::start(dir, journal, options, previous.processes, watcher)
    }

    fn start(
        dir: PathBuf,
        journal: Arc<dyn Journaler>,
        options: MonitorOptions,
        previous: HashMap<String, i32>,
        watcher: DirWatcher,
    ) -> Result<Self> {
        ensure_scripts_dir(&dir)?;
        let status = Arc::new(StatusDir::open(journal.id())?);

        platform_capabilities(&journal);

        journal.log(Event::Acquired {
            journal_id: journal.id().to_owned(),
        });

        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let monitor_loop = MonitorLoop {
            dir,
            journal,
            status,
            options,
            services: HashMap::new(),
            ctl_rx,
            watcher,
        };
        tokio::spawn(monitor_loop.run(done_tx));

        let _ = ctl_tx.send(Command::Rescan { previous });

        Ok(Self {
            ctl_tx,
            done_rx: Some(done_rx),
        })
    }

    /// Stop every supervisor, write the `monitor quit` record and shut the
    /// loop down. Blocks until the loop has acknowledged. Idempotent.
    pub async fn stop(&mut self) {
        let Some(done_rx) = self.done_rx.take() else {
            return;
        };
        let _ = self.ctl_tx.send(Command::Stop);
        let _ = done_rx.await;
    }
}

fn ensure_scripts_dir(dir: &Path) -> Result<()> {
    DirBuilder::new().recursive(true).mode(0o750).create(dir)?;
    Ok(())
}

/// Journal warnings for missing platform capabilities and enable the ones we
/// have. Recovery and cleanup are best-effort without them.
fn platform_capabilities(journal: &Arc<dyn Journaler>) {
    match cronmon_unix::set_child_subreaper() {
        Ok(true) => {}
        Ok(false) => journal.log(Event::Warning {
            component: "monitor".to_owned(),
            message: "child subreaper is unsupported here; orphaned grandchildren will \
                      escape supervision"
                .to_owned(),
        }),
        Err(err) => journal.log(Event::Warning {
            component: "monitor".to_owned(),
            message: format!("failed to become child subreaper: {err}"),
        }),
    }

    if !cronmon_unix::parent_death_signal_supported() {
        journal.log(Event::Warning {
            component: "monitor".to_owned(),
            message: "parent-death signal is unsupported here; children may outlive an \
                      ungraceful supervisor exit"
                .to_owned(),
        });
    }
}

struct MonitorLoop {
    dir: PathBuf,
    journal: Arc<dyn Journaler>,
    status: Arc<StatusDir>,
    options: MonitorOptions,
    services: HashMap<String, ServiceSupervisor>,
    ctl_rx: mpsc::UnboundedReceiver<Command>,
    watcher: DirWatcher,
}

impl MonitorLoop {
    async fn run(mut self, done: oneshot::Sender<()>) {
        loop {
            tokio::select! {
                command = self.ctl_rx.recv() => match command {
                    Some(Command::Rescan { previous }) => self.rescan(previous).await,
                    Some(Command::Stop) | None => break,
                },

                event = self.watcher.recv() => {
                    if let Some((op, file)) = event {
                        self.journal.log(Event::ProcessListModify {
                            op,
                            file: file.clone(),
                        });
                        self.apply(op, file, None).await;
                    }
                }
            }
        }

        self.shutdown().await;
        let _ = done.send(());
    }

    /// Apply one process-list change. `takeover` carries the previous
    /// instance's PID during the restore rescan.
    async fn apply(&mut self, op: ListOp, file: String, takeover: Option<i32>) {
        match op {
            ListOp::Add => {
                if !self.services.contains_key(&file) {
                    let supervisor = self.new_supervisor(&file);
                    self.services.insert(file.clone(), supervisor);
                }
                // A later entry-point may re-add a known service; starting
                // without restart is a no-op for a live child either way.
                let Some(supervisor) = self.services.get(&file) else {
                    return;
                };
                match takeover {
                    Some(pid) => supervisor.takeover(pid),
                    None => supervisor.start(false),
                }
            }

            ListOp::Update => match self.services.get(&file) {
                Some(supervisor) => supervisor.start(true),
                None => self.journal.log(Event::Warning {
                    component: "monitor".to_owned(),
                    message: format!("update for unknown service {file}"),
                }),
            },

            ListOp::Remove => match self.services.remove(&file) {
                Some(mut supervisor) => {
                    if let Err(err) = supervisor.stop().await {
                        self.journal.log(Event::Warning {
                            component: "monitor".to_owned(),
                            message: format!("failed to stop removed service {file}: {err}"),
                        });
                    }
                }
                None => self.journal.log(Event::Warning {
                    component: "monitor".to_owned(),
                    message: format!("remove for unknown service {file}"),
                }),
            },
        }
    }

    /// Walk the scripts directory and add every executable file that is not
    /// already supervised.
    async fn rescan(&mut self, previous: HashMap<String, i32>) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                self.journal.log(Event::Warning {
                    component: "monitor".to_owned(),
                    message: format!("failed to list scripts directory: {err}"),
                });
                return;
            }
        };

        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() || !is_executable(&meta) {
                continue;
            }
            let Some(file) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if self.services.contains_key(&file) {
                continue;
            }

            self.journal.log(Event::ProcessListModify {
                op: ListOp::Add,
                file: file.clone(),
            });
            self.apply(ListOp::Add, file.clone(), previous.get(&file).copied())
                .await;
        }
    }

    fn new_supervisor(&self, file: &str) -> ServiceSupervisor {
        debug!(file, "creating supervisor");
        match &self.options.spawner_factory {
            Some(factory) => ServiceSupervisor::with_spawner(
                file,
                Arc::clone(&self.journal),
                Arc::clone(&self.status),
                self.options.supervisor.clone(),
                factory(file),
            ),
            None => ServiceSupervisor::new(
                &self.dir,
                file,
                Arc::clone(&self.journal),
                Arc::clone(&self.status),
                self.options.supervisor.clone(),
            ),
        }
    }

    async fn shutdown(&mut self) {
        for (file, mut supervisor) in self.services.drain() {
            if let Err(err) = supervisor.stop().await {
                self.journal.log(Event::Warning {
                    component: "monitor".to_owned(),
                    message: format!("failed to stop {file}: {err}"),
                });
            }
        }

        self.journal.log(Event::Quit {});
    }
}
