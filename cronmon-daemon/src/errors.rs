use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronmonError {
    /// Another cronmon instance holds the journal lock. The CLI treats this
    /// as "already running" and exits silently.
    #[error("journal is locked by another process")]
    LockedElsewhere,

    #[error("failed to open journal '{path}': {source}")]
    JournalOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("journal I/O error: {0}")]
    JournalIo(#[from] io::Error),

    #[error("failed to encode journal event: {0}")]
    JournalEncode(#[from] serde_json::Error),

    #[error("failed to decode journal record: {reason}")]
    JournalDecode { reason: String },

    /// The reverse scanner filled a whole buffer without finding a line
    /// delimiter.
    #[error("journal line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    /// The journal ended before an `acquired lock` record was found, so the
    /// previous run cannot be reconstructed.
    #[error("journal ended before an acquire record was found")]
    UnexpectedEof,

    #[error("timed out waiting for program to exit")]
    StopTimeout,

    #[error("scripts path '{0}' is not a directory")]
    NotADirectory(PathBuf),
}

pub type Result<T> = std::result::Result<T, CronmonError>;
