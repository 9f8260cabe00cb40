//! Timestamps and ids stamped on lifecycle events and server log headers.

use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Unix-epoch seconds with a `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

/// Sortable unique id for one event line.
pub fn new_event_id() -> String {
    Ulid::new().to_string()
}
