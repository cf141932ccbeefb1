//! Journal events.
//!
//! Every state transition the monitor or a supervisor makes is described by
//! one [`Event`] and appended to the journal. The wire format is
//! line-delimited JSON: `{"time":"<RFC3339 UTC>","type":"<tag>","data":{…}}`.
//! The tag strings are part of the on-disk format and must never change; the
//! recovery path dispatches on them to decode old records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An operation against the monitor's process list, usually caused by a
/// change in the scripts directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListOp {
    Add,
    Remove,
    Update,
}

impl fmt::Display for ListOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListOp::Add => f.write_str("add"),
            ListOp::Remove => f.write_str("remove"),
            ListOp::Update => f.write_str("update"),
        }
    }
}

/// A journal record payload.
///
/// The serde representation is the record without its timestamp: the `type`
/// key carries the tag and `data` the variant fields. [`encode_record`] and
/// [`decode_record`] add and strip the envelope's `time` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A non-fatal anomaly somewhere in the supervisor.
    #[serde(rename = "warning")]
    Warning { component: String, message: String },

    /// The journal lock is held; emitted once per monitor instance, before
    /// any other record of that instance.
    #[serde(rename = "acquired lock")]
    Acquired { journal_id: String },

    /// The monitor has stopped all children; the last record of a clean
    /// shutdown.
    #[serde(rename = "monitor quit")]
    Quit {},

    /// The journal file was wiped, e.g. because it was corrupt.
    #[serde(rename = "log truncated")]
    LogTruncated { reason: String },

    /// A recovery attempt failed to adopt a still-running child.
    #[serde(rename = "process takeover error")]
    ProcessTakeoverError {
        file: String,
        pid: i32,
        reason: String,
        status_file: String,
    },

    /// An attempt to start a child failed.
    #[serde(rename = "process spawn error")]
    ProcessSpawnError { file: String, reason: String },

    /// A child is now running.
    #[serde(rename = "process spawned")]
    ProcessSpawned { file: String, pid: i32 },

    /// A child terminated. `exit_code` is -1 when death was by uncatchable
    /// signal or the status could not be collected.
    #[serde(rename = "process exited")]
    ProcessExited {
        file: String,
        pid: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        exit_code: i32,
    },

    /// The process list changed (scripts directory add/update/remove).
    #[serde(rename = "process list modified")]
    ProcessListModify { op: ListOp, file: String },
}

impl Event {
    /// The record's tag string, as written to the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Warning { .. } => "warning",
            Event::Acquired { .. } => "acquired lock",
            Event::Quit {} => "monitor quit",
            Event::LogTruncated { .. } => "log truncated",
            Event::ProcessTakeoverError { .. } => "process takeover error",
            Event::ProcessSpawnError { .. } => "process spawn error",
            Event::ProcessSpawned { .. } => "process spawned",
            Event::ProcessExited { .. } => "process exited",
            Event::ProcessListModify { .. } => "process list modified",
        }
    }

    /// Whether this exit record describes a graceful stop (anything but
    /// signal death).
    pub fn is_graceful_exit(&self) -> bool {
        matches!(self, Event::ProcessExited { exit_code, .. } if *exit_code != -1)
    }
}

/// Encode one journal line, newline-terminated.
pub(crate) fn encode_record(
    event: &Event,
    time: DateTime<Utc>,
) -> serde_json::Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Envelope<'a> {
        time: DateTime<Utc>,
        #[serde(flatten)]
        event: &'a Event,
    }

    let mut line = serde_json::to_vec(&Envelope { time, event })?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one journal line into its event and timestamp.
///
/// Decoding is two-phase: the outer object is parsed first, the `time` key is
/// split off, and the remaining `type`/`data` pair dispatches into the
/// matching [`Event`] variant. An unknown tag is a decode error.
pub(crate) fn decode_record(line: &[u8]) -> Result<(Event, DateTime<Utc>), String> {
    let mut object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(line).map_err(|err| err.to_string())?;

    let time = object
        .remove("time")
        .ok_or_else(|| "record is missing a time".to_owned())?;
    let time: DateTime<Utc> =
        serde_json::from_value(time).map_err(|err| format!("bad record time: {err}"))?;

    let event: Event = serde_json::from_value(serde_json::Value::Object(object))
        .map_err(|err| err.to_string())?;

    Ok((event, time))
}
