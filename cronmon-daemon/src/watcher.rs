//! Directory watching.
//!
//! Translates OS file notifications for the scripts directory into the
//! monitor's `{Add, Update, Remove}` vocabulary. Only events for direct
//! children of the watched directory count; renames are coalesced to
//! removes (platforms disagree on how the target side is reported), and a
//! permission change is an add or a remove depending on where the execute
//! bit ended up.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;

use crate::events::{Event, ListOp};
use crate::journal::{Journaler, JournalerExt};

/// Whether any of the owner/group/other execute bits is set.
pub(crate) fn is_executable(meta: &std::fs::Metadata) -> bool {
    meta.permissions().mode() & 0o111 != 0
}

/// Stream of process-list changes for one directory.
///
/// Owns the OS watch handle; dropping the watcher closes it exactly once.
/// If the watch could not be established the stream simply never yields, and
/// the monitor keeps running for the services found at startup.
pub struct DirWatcher {
    rx: mpsc::Receiver<(ListOp, String)>,
    /// Keeps `rx` open even when the notify side is gone, so `recv` blocks
    /// forever instead of returning `None` in a tight loop.
    _keepalive: mpsc::Sender<(ListOp, String)>,
    _watcher: Option<RecommendedWatcher>,
}

impl DirWatcher {
    /// Watch `dir`, reporting failures to the journal instead of the
    /// caller. A watcher that failed to initialise yields nothing, ever.
    pub fn watch(dir: PathBuf, journal: Arc<dyn Journaler>) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let keepalive = tx.clone();

        let watcher = match Self::init(dir, Arc::clone(&journal), tx) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                journal.log(Event::Warning {
                    component: "watcher".to_owned(),
                    message: format!("not watching directory: {err}"),
                });
                None
            }
        };

        Self {
            rx,
            _keepalive: keepalive,
            _watcher: watcher,
        }
    }

    fn init(
        dir: PathBuf,
        journal: Arc<dyn Journaler>,
        tx: mpsc::Sender<(ListOp, String)>,
    ) -> notify::Result<RecommendedWatcher> {
        let watch_dir = dir.clone();

        let mut watcher =
            notify::recommended_watcher(move |outcome: notify::Result<notify::Event>| {
                let event = match outcome {
                    Ok(event) => event,
                    Err(err) => {
                        journal.log(Event::Warning {
                            component: "watcher".to_owned(),
                            message: format!("watch error: {err}"),
                        });
                        return;
                    }
                };

                for path in &event.paths {
                    match translate(&event.kind, path, &dir) {
                        Translated::Change(op, file) => {
                            // Blocking send from notify's own thread; the
                            // monitor loop applies backpressure.
                            if tx.blocking_send((op, file)).is_err() {
                                return;
                            }
                        }
                        Translated::Skip => {}
                        Translated::Unknown => {
                            journal.log(Event::Warning {
                                component: "watcher".to_owned(),
                                message: format!(
                                    "skipped unknown {:?} event at {}",
                                    event.kind,
                                    path.display(),
                                ),
                            });
                        }
                    }
                }
            })?;

        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    /// Next directory change. Pending forever if the watch never came up.
    pub async fn recv(&mut self) -> Option<(ListOp, String)> {
        self.rx.recv().await
    }

    /// A watcher fed by hand instead of by the OS.
    #[cfg(test)]
    pub(crate) fn from_feed() -> (Self, mpsc::Sender<(ListOp, String)>) {
        let (tx, rx) = mpsc::channel(16);
        let keepalive = tx.clone();
        (
            Self {
                rx,
                _keepalive: keepalive,
                _watcher: None,
            },
            tx,
        )
    }
}

enum Translated {
    Change(ListOp, String),
    /// Not a change we care about (outside the directory, access noise,
    /// a chmod against a path that is already gone).
    Skip,
    /// A notification kind the mapping cannot classify.
    Unknown,
}

fn translate(kind: &EventKind, path: &Path, dir: &Path) -> Translated {
    // Only direct children of the watched directory count.
    if path.parent() != Some(dir) {
        return Translated::Skip;
    }
    let Some(file) = path.file_name().and_then(|name| name.to_str()) else {
        return Translated::Skip;
    };
    let file = file.to_owned();

    let op = match kind {
        EventKind::Create(_) => ListOp::Add,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => ListOp::Update,
        // Renames are reported inconsistently across platforms; treat any
        // rename leg as a removal and let a create event re-add the file.
        EventKind::Modify(ModifyKind::Name(_)) => ListOp::Remove,
        EventKind::Remove(_) => ListOp::Remove,
        EventKind::Modify(ModifyKind::Metadata(_)) => {
            // A permission flip decides whether the file is a service now.
            return match std::fs::metadata(path) {
                Ok(meta) if is_executable(&meta) => Translated::Change(ListOp::Add, file),
                Ok(_) => Translated::Change(ListOp::Remove, file),
                Err(_) => Translated::Skip,
            };
        }
        // Reads and closes are not directory modifications.
        EventKind::Access(_) => return Translated::Skip,
        _ => return Translated::Unknown,
    };

    Translated::Change(op, file)
}
