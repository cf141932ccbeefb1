//! cronmon is a crontab-triggered, daemonless process supervisor.
//!
//! cronmon keeps one child process alive per executable file in a scripts
//! directory, restarting children with backoff when they exit and mirroring
//! directory changes as service add/update/remove. Every state transition is
//! appended to a journal file; a second invocation (cron fires one every
//! minute) finds the journal locked and exits, and an invocation after a
//! crash reads the journal tail to adopt children that are still running.

use std::path::PathBuf;

pub mod errors;
pub mod events;
pub mod journal;
pub mod monitor;
pub mod process;
pub mod status;
pub mod supervisor;
pub mod watcher;

/// Default journal path: `<config>/cronmon/journal.json`.
pub fn default_journal_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join("cronmon").join("journal.json"))
}

/// Default scripts directory: `<config>/cronmon/scripts`.
pub fn default_scripts_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join("cronmon").join("scripts"))
}
