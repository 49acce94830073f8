//! Wire data types.

mod event;
mod greeting;
mod message;
mod query;

pub use event::{Event, Timestamp};
pub use greeting::{Greeting, QemuVersion, QmpInfo, VersionTriple};
pub use message::{Command, CommandError, Response};
pub(crate) use query::BlockJobTracker;
pub use query::{BlockJob, BlockJobProgress, MigrateInfo, MigrateProgress, QueryStatus, TransferStats};
