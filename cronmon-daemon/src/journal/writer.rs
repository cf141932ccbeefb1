//! Journal writers: the line-delimited JSON sink, the fan-out composite, and
//! the `tracing` sink used for operator-visible output.

use std::io::Write;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::Journaler;
use crate::errors::{CronmonError, Result};
use crate::events::{encode_record, Event};

/// Writes one JSON record per line into any `Write` sink.
///
/// Each record is emitted as a single `write_all` of a complete,
/// newline-terminated line under an internal mutex, so records are atomic
/// against concurrent writers within the process and readers never observe a
/// torn line boundary.
#[derive(Debug)]
pub struct JsonWriter<W> {
    id: String,
    sink: Mutex<W>,
}

impl<W: Write> JsonWriter<W> {
    pub fn new(id: impl Into<String>, sink: W) -> Self {
        Self {
            id: id.into(),
            sink: Mutex::new(sink),
        }
    }

    /// Access the underlying sink. Used by the file journal for truncation.
    pub(super) fn sink(&self) -> parking_lot::MutexGuard<'_, W> {
        self.sink.lock()
    }

    pub(super) fn into_inner(self) -> W {
        self.sink.into_inner()
    }
}

impl<W: Write + Send> Journaler for JsonWriter<W> {
    fn id(&self) -> &str {
        &self.id
    }

    fn write(&self, event: &Event) -> Result<()> {
        let line = encode_record(event, Utc::now())?;

        let mut sink = self.sink.lock();
        sink.write_all(&line).map_err(CronmonError::JournalIo)?;
        sink.flush().map_err(CronmonError::JournalIo)
    }
}

/// Fans a single event out to several journalers.
///
/// Every sink is attempted even after a failure; the first error is the one
/// returned. The composite's identifier is its children's identifiers joined
/// by `+`, and feeds the status-directory hash like any other identifier:
/// changing the combination of writers changes the hash.
pub struct MultiWriter {
    id: String,
    writers: Vec<Box<dyn Journaler>>,
}

impl MultiWriter {
    pub fn new(writers: Vec<Box<dyn Journaler>>) -> Self {
        let id = writers
            .iter()
            .map(|w| w.id())
            .collect::<Vec<_>>()
            .join("+");
        Self { id, writers }
    }
}

impl Journaler for MultiWriter {
    fn id(&self) -> &str {
        &self.id
    }

    fn write(&self, event: &Event) -> Result<()> {
        let mut first_err = None;
        for writer in &self.writers {
            if let Err(err) = writer.write(event) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Renders journal events through `tracing` for whoever is watching the
/// supervisor's stdout/stderr. Pure presentation: never fails.
#[derive(Default)]
pub struct TracingWriter;

impl TracingWriter {
    pub fn new() -> Self {
        Self
    }
}

impl Journaler for TracingWriter {
    fn id(&self) -> &str {
        "tracing"
    }

    fn write(&self, event: &Event) -> Result<()> {
        match event {
            Event::Warning { component, message } => warn!(component = %component, "{message}"),
            Event::Acquired { journal_id } => {
                info!(journal_id = %journal_id, "acquired journal lock")
            }
            Event::Quit {} => info!("monitor quit"),
            Event::LogTruncated { reason } => warn!("journal truncated: {reason}"),
            Event::ProcessTakeoverError {
                file,
                pid,
                reason,
                status_file,
            } => warn!(
                file = %file,
                pid = *pid,
                status_file = %status_file,
                "takeover failed: {reason}"
            ),
            Event::ProcessSpawnError { file, reason } => {
                warn!(file = %file, "failed to spawn process: {reason}")
            }
            Event::ProcessSpawned { file, pid } => {
                info!(file = %file, pid = *pid, "process spawned")
            }
            Event::ProcessExited {
                file,
                pid,
                error,
                exit_code,
            } => match error {
                Some(error) => warn!(
                    file = %file,
                    pid = *pid,
                    exit_code = *exit_code,
                    "process exited: {error}"
                ),
                None => info!(
                    file = %file,
                    pid = *pid,
                    exit_code = *exit_code,
                    "process exited"
                ),
            },
            Event::ProcessListModify { op, file } => {
                info!(file = %file, "process list: {op}")
            }
        }
        Ok(())
    }
}
