//! Journal reading and previous-state recovery.
//!
//! Records are decoded newest-first by walking the journal backwards, so the
//! recovery scan stops at the previous instance's `acquired lock` record
//! after touching only the journal tail.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek};

use chrono::{DateTime, Utc};

use super::reverse::ReverseLineScanner;
use crate::errors::{CronmonError, Result};
use crate::events::{decode_record, Event};

/// A source of journal records, newest first.
pub trait JournalRead {
    /// The next record moving backwards, or `Ok(None)` at the start of the
    /// journal.
    fn read_event(&mut self) -> Result<Option<(Event, DateTime<Utc>)>>;
}

/// Decodes line-delimited JSON records from a seekable stream, newest first.
/// Blank lines are skipped; an undecodable or unknown record is an error.
pub struct JsonReader<R> {
    scanner: ReverseLineScanner<R>,
}

impl<R: Read + Seek> JsonReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            scanner: ReverseLineScanner::new(source),
        }
    }
}

impl<R: Read + Seek> JournalRead for JsonReader<R> {
    fn read_event(&mut self) -> Result<Option<(Event, DateTime<Utc>)>> {
        loop {
            let Some(line) = self.scanner.read_until(b'\n')? else {
                return Ok(None);
            };

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return decode_record(&line)
                .map(Some)
                .map_err(|reason| CronmonError::JournalDecode { reason });
        }
    }
}

/// What the previous monitor instance left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousState {
    /// When the previous instance acquired the journal.
    pub started_at: DateTime<Utc>,
    /// Children that were still running when it went away: service file name
    /// to PID. Empty after a clean shutdown.
    pub processes: HashMap<String, i32>,
}

/// Reconstruct the state at the previous shutdown by scanning records newest
/// to oldest.
///
/// The first `acquired lock` record bounds the previous run and terminates
/// the scan. A `monitor quit` record means the shutdown was clean, so every
/// spawn seen beyond it is known stopped. The exited-PID set keeps a child
/// from being resurrected by a strictly older spawn record of the same PID.
pub fn read_previous_state<R: JournalRead>(mut reader: R) -> Result<PreviousState> {
    let mut exited: HashSet<i32> = HashSet::new();
    let mut has_quit = false;
    let mut processes: HashMap<String, i32> = HashMap::new();

    while let Some((event, time)) = reader.read_event()? {
        match event {
            Event::Acquired { .. } => {
                return Ok(PreviousState {
                    started_at: time,
                    processes,
                });
            }
            Event::Quit {} => has_quit = true,
            Event::ProcessExited { pid, .. } => {
                exited.insert(pid);
            }
            Event::ProcessSpawned { file, pid } => {
                if !has_quit && !exited.contains(&pid) {
                    processes.entry(file).or_insert(pid);
                }
            }
            _ => {}
        }
    }

    Err(CronmonError::UnexpectedEof)
}
