//! What the status display gets to see.

use crate::reading::{Reading, RecentRow};
use crate::storage::RECENT_ROWS;

/// Read-only view of the logger state, handed to the display on each refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplaySnapshot {
    pub latest: Option<Reading>,
    /// Last logged rows, oldest first.
    pub recent: heapless::Vec<RecentRow, RECENT_ROWS>,
    pub row_count: u32,
    pub storage_available: bool,
    pub clock_ok: bool,
}

impl DisplaySnapshot {
    pub fn status_text(&self) -> &'static str {
        if !self.clock_ok {
            "NO CLOCK"
        } else if self.storage_available {
            "LOGGING"
        } else {
            "MONITOR ONLY"
        }
    }
}

/// The status display. Rendering is entirely up to the implementation.
pub trait StatusDisplay {
    fn show(&mut self, snapshot: &DisplaySnapshot);

    fn power_off(&mut self);
}
