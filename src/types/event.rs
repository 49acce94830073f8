use serde::{Deserialize, Serialize};
use serde_json::Value;

/// QMP timestamp attached to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since epoch.
    pub seconds: i64,

    /// Microseconds within the second.
    pub microseconds: i64,
}

/// An asynchronous QMP event.
///
/// Events are delivered out of band: they never consume a queued callback.
/// `data` is kept as raw JSON so callers can decode the fields of the events
/// they care about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name, e.g. `STOP` or `BLOCK_JOB_READY`.
    #[serde(rename = "event")]
    pub name: String,

    /// Event data payload.
    #[serde(default)]
    pub data: Value,

    /// Timestamp, when the peer sent one.
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

impl Event {
    /// Events that fire too often to be worth logging at info level.
    pub(crate) const QUIET: &'static [&'static str] = &["RTC_CHANGE"];

    pub(crate) fn is_quiet(&self) -> bool {
        Self::QUIET.contains(&self.name.as_str())
    }
}
