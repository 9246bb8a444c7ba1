//! Session management: the transport manager and the per-radio connection

mod link;
mod manager;
mod tasks;

pub use link::{Connection, LogFormatter, utf8_log_formatter};
pub use manager::{RestoredConnection, TransportManager};
