//! File-backed journal guarded by an advisory lock.
//!
//! One cronmon instance owns one journal file. The lock is what makes the
//! cron-driven re-invocation cheap: a second instance fails to acquire it and
//! exits silently. Readers never need the lock, since every record is
//! appended as a single synchronous write of one complete line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;

use super::reader::{read_previous_state, JsonReader, PreviousState};
use super::writer::JsonWriter;
use super::Journaler;
use crate::errors::{CronmonError, Result};
use crate::events::{encode_record, Event};

/// Polling interval of [`FileLockJournal::open_wait`].
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// A journal file held under an exclusive advisory lock for the lifetime of
/// the monitor.
///
/// The file is opened append-only with synchronous writes (`O_SYNC`), so a
/// torn suffix from a crash can never corrupt an earlier complete line. The
/// journal identifier is `file:<absolute path>`, which is what the
/// status-directory hash is derived from.
#[derive(Debug)]
pub struct FileLockJournal {
    path: PathBuf,
    writer: JsonWriter<File>,
}

impl FileLockJournal {
    /// Open `path` and take the lock, failing immediately with
    /// [`CronmonError::LockedElsewhere`] if another process holds it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, path) = open_journal_file(path.as_ref())?;
        try_lock(&file)?;
        Ok(Self::assemble(file, path))
    }

    /// Open `path` and poll for the lock every 25 ms until it is acquired or
    /// `timeout` has elapsed.
    pub async fn open_wait(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let (file, path) = open_journal_file(path.as_ref())?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match try_lock(&file) {
                Ok(()) => return Ok(Self::assemble(file, path)),
                Err(CronmonError::LockedElsewhere)
                    if tokio::time::Instant::now() < deadline =>
                {
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn assemble(file: File, path: PathBuf) -> Self {
        let id = format!("file:{}", path.display());
        Self {
            path,
            writer: JsonWriter::new(id, file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reconstruct the previous instance's state from the journal tail.
    ///
    /// A corrupt journal (undecodable or over-long record) is wiped on the
    /// spot, a `log truncated` record becomes its new first line, and the
    /// decode error is returned so the caller falls back to a fresh start.
    pub fn previous_state(&self) -> Result<PreviousState> {
        let reader = JsonReader::new(File::open(&self.path)?);
        match read_previous_state(reader) {
            Err(err @ (CronmonError::JournalDecode { .. } | CronmonError::LineTooLong { .. })) => {
                self.truncate(&err.to_string())?;
                Err(err)
            }
            other => other,
        }
    }

    /// Wipe the journal and record why.
    pub fn truncate(&self, reason: &str) -> Result<()> {
        let line = encode_record(
            &Event::LogTruncated {
                reason: reason.to_owned(),
            },
            Utc::now(),
        )?;

        let mut file = self.writer.sink();
        file.set_len(0).map_err(CronmonError::JournalIo)?;
        file.write_all(&line).map_err(CronmonError::JournalIo)?;
        file.flush().map_err(CronmonError::JournalIo)
    }

    /// Release the lock, then the descriptor. Dropping the journal without
    /// calling this releases both as well, just without error reporting.
    pub fn close(self) -> Result<()> {
        let file = self.writer.into_inner();
        FileExt::unlock(&file).map_err(CronmonError::JournalIo)?;
        drop(file);
        Ok(())
    }
}

impl Journaler for FileLockJournal {
    fn id(&self) -> &str {
        self.writer.id()
    }

    fn write(&self, event: &Event) -> Result<()> {
        self.writer.write(event)
    }
}

fn open_journal_file(path: &Path) -> Result<(File, PathBuf)> {
    let path = std::path::absolute(path).map_err(|source| CronmonError::JournalOpen {
        path: path.to_path_buf(),
        source,
    })?;

    let file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .mode(0o600)
        .custom_flags(libc::O_SYNC)
        .open(&path)
        .map_err(|source| CronmonError::JournalOpen {
            path: path.clone(),
            source,
        })?;

    Ok((file, path))
}

fn try_lock(file: &File) -> Result<()> {
    file.try_lock_exclusive().map_err(|err| {
        if err.kind() == fs2::lock_contended_error().kind() {
            CronmonError::LockedElsewhere
        } else {
            CronmonError::JournalIo(err)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalerExt;

    #[test]
    fn second_open_fails_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");

        let journal = FileLockJournal::open(&path).unwrap();
        let err = FileLockJournal::open(&path).unwrap_err();
        assert!(matches!(err, CronmonError::LockedElsewhere));

        journal.close().unwrap();
        FileLockJournal::open(&path).unwrap();
    }

    #[test]
    fn id_includes_the_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        let journal = FileLockJournal::open(&path).unwrap();
        assert_eq!(journal.id(), format!("file:{}", path.display()));
    }

    #[test]
    fn writes_then_recovers_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");

        let journal = FileLockJournal::open(&path).unwrap();
        journal.log(Event::Acquired { journal_id: journal.id().to_owned() });
        journal.log(Event::ProcessSpawned { file: "a".into(), pid: 41 });

        let state = journal.previous_state().unwrap();
        assert_eq!(state.processes.len(), 1);
        assert_eq!(state.processes["a"], 41);
    }

    #[test]
    fn corrupt_journal_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        std::fs::write(&path, "{\"time\":\"2020-01-01T00:00:00Z\",\"type\":\"nope\",\"data\":{}}\n")
            .unwrap();

        let journal = FileLockJournal::open(&path).unwrap();
        let err = journal.previous_state().unwrap_err();
        assert!(matches!(err, CronmonError::JournalDecode { .. }));

        // The file now holds exactly one record: the truncation notice.
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["type"], "log truncated");
    }

    #[tokio::test]
    async fn open_wait_times_out_against_a_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");

        let held = FileLockJournal::open(&path).unwrap();
        let err = FileLockJournal::open_wait(&path, Duration::from_millis(80))
            .await
            .unwrap_err();
        assert!(matches!(err, CronmonError::LockedElsewhere));
        drop(held);

        FileLockJournal::open_wait(&path, Duration::from_millis(80))
            .await
            .unwrap();
    }
}
