//! In-memory journal, used by the test suites and available to embedders
//! that want to inspect events without touching disk.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{JournalRead, Journaler};
use crate::errors::Result;
use crate::events::Event;

/// Records events in memory with their write timestamps.
///
/// `finalize()` flips the journal read-only; a write after that panics,
/// which test code uses to prove that no stray background routine is still
/// journaling after a shutdown.
#[derive(Default)]
pub struct MemoryJournal {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    finalized: bool,
    records: Vec<(DateTime<Utc>, Event)>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.inner
            .lock()
            .records
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// All records with their timestamps, oldest first.
    pub fn records(&self) -> Vec<(DateTime<Utc>, Event)> {
        self.inner.lock().records.clone()
    }

    /// Lock the journal; any further write panics.
    pub fn finalize(&self) {
        self.inner.lock().finalized = true;
    }

    /// A reader that replays the recorded events newest-first, the way the
    /// file journal is read during recovery.
    pub fn replay(&self) -> ReplayReader {
        let mut records = self.records();
        records.reverse();
        ReplayReader::new(records)
    }
}

impl Journaler for MemoryJournal {
    fn id(&self) -> &str {
        "memory"
    }

    fn write(&self, event: &Event) -> Result<()> {
        let mut inner = self.inner.lock();
        assert!(!inner.finalized, "journal write after finalize: {event:?}");
        inner.records.push((Utc::now(), event.clone()));
        Ok(())
    }
}

/// Feeds a pre-recorded event list to [`read_previous_state`], newest first.
///
/// [`read_previous_state`]: super::read_previous_state
pub struct ReplayReader {
    records: std::vec::IntoIter<(DateTime<Utc>, Event)>,
}

impl ReplayReader {
    /// `records` must already be ordered newest first.
    pub fn new(records: Vec<(DateTime<Utc>, Event)>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

impl JournalRead for ReplayReader {
    fn read_event(&mut self) -> Result<Option<(Event, DateTime<Utc>)>> {
        Ok(self.records.next().map(|(time, event)| (event, time)))
    }
}
