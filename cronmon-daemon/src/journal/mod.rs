//! Append-only event journal.
//!
//! The journal is the supervisor's source of truth: every state transition is
//! appended as one line-delimited JSON record, and on startup the tail of the
//! journal is scanned backwards to reconstruct which services were alive when
//! the previous instance stopped.

mod file;
mod memory;
mod reader;
mod reverse;
mod writer;

pub use file::FileLockJournal;
pub use memory::{MemoryJournal, ReplayReader};
pub use reader::{read_previous_state, JournalRead, JsonReader, PreviousState};
pub use reverse::ReverseLineScanner;
pub use writer::{JsonWriter, MultiWriter, TracingWriter};

use tracing::error;

use crate::errors::Result;
use crate::events::Event;

/// An event sink.
///
/// Implementations must serialise concurrent writes internally; callers from
/// any task hand over one event at a time and may share the journaler behind
/// an `Arc`.
pub trait Journaler: Send + Sync {
    /// Stable identifier of this journal. For file-backed journals this
    /// includes the absolute path, so the status-directory hash can be
    /// derived from it anywhere.
    fn id(&self) -> &str;

    fn write(&self, event: &Event) -> Result<()>;
}

/// Best-effort writing: journal write failures must not take the supervisor
/// down, so most call sites report them to stderr and move on.
pub trait JournalerExt {
    fn log(&self, event: Event);
}

impl<J: Journaler + ?Sized> JournalerExt for J {
    fn log(&self, event: Event) {
        if let Err(err) = self.write(&event) {
            error!(journal = self.id(), "failed to write journal event: {err}");
        }
    }
}
