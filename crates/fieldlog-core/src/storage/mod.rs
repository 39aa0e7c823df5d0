//! Persistent storage for the measurement log
//!
//! The log lives on a removable medium that may vanish, come back empty, or
//! silently swallow writes. [`Medium`] is the raw file-level interface to it;
//! [`LogStore`] layers the append-only CSV log on top, with bounded retries,
//! recovery cool-downs and read-back verification.

mod log_store;
pub mod memory;
mod retry;
pub mod sd_card;

pub use log_store::*;
pub use memory::MemoryMedium;
pub use retry::*;

use embassy_time::Instant;
use thiserror_no_std::Error;

use crate::config::ScheduleConfig;

/// Raw failures reported by a medium.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediumError {
    #[error("No card in the slot")]
    NoCard,
    #[error("Volume is not mounted")]
    NotMounted,
    #[error("File not found")]
    NotFound,
    #[error("I/O error: {0}")]
    Io(&'static str),
    #[error("Operation not supported by the medium")]
    Unsupported,
}

/// Log store failures, as seen by the rest of the system.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage medium absent")]
    MediumAbsent,
    #[error("Log file present but unreadable")]
    MediumUnreadable,
    #[error("Incomplete write: {written} of {expected} bytes")]
    WriteIncomplete { written: usize, expected: usize },
    #[error("Log holds {observed} rows but {tracked} were tracked")]
    VerifyMismatch { observed: u32, tracked: u32 },
}

impl StoreError {
    /// Whether the failure leaves the medium degraded. Only a verify mismatch does not.
    pub fn degrades_health(&self) -> bool {
        !matches!(self, StoreError::VerifyMismatch { .. })
    }
}

impl From<MediumError> for StoreError {
    fn from(e: MediumError) -> Self {
        match e {
            MediumError::NoCard | MediumError::NotMounted => StoreError::MediumAbsent,
            MediumError::NotFound | MediumError::Io(_) | MediumError::Unsupported => {
                StoreError::MediumUnreadable
            }
        }
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::MediumAbsent | StoreError::MediumUnreadable => true,
            // Repeating a partial write would leave a torn row in front of the retry.
            StoreError::WriteIncomplete { written, .. } => *written == 0,
            StoreError::VerifyMismatch { .. } => false,
        }
    }
}

/// File-level access to a removable storage medium. Operations are blocking.
pub trait Medium {
    /// Detect the card and mount its volume.
    fn mount(&mut self) -> Result<(), MediumError>;

    /// Release the volume and power down the card interface. Never fails.
    fn unmount(&mut self);

    fn exists(&mut self, name: &str) -> Result<bool, MediumError>;

    fn size(&mut self, name: &str) -> Result<u64, MediumError>;

    /// Create `name`, truncating any previous content, and write `contents`.
    /// Returns the number of bytes written.
    fn create(&mut self, name: &str, contents: &[u8]) -> Result<usize, MediumError>;

    /// Append `data` to `name`, flush and close. Returns the number of bytes written.
    fn append(&mut self, name: &str, data: &[u8]) -> Result<usize, MediumError>;

    /// Read `name` front to back, handing each chunk to `visit`. Returns the bytes read.
    fn scan<F: FnMut(&[u8])>(&mut self, name: &str, visit: F) -> Result<u64, MediumError>;

    fn rename(&mut self, from: &str, to: &str) -> Result<(), MediumError>;

    fn remove(&mut self, name: &str) -> Result<(), MediumError>;
}

/// When an initialization attempt happens. Boot gets a larger attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Boot,
    Running,
}

/// Availability of the log store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageHealth {
    pub available: bool,
    pub consecutive_failures: u32,
    /// When the last initialization attempt started.
    pub last_recovery_attempt: Option<Instant>,
}

impl StorageHealth {
    /// Measurement interval for the current health: logging or monitoring-only.
    pub fn interval_secs(&self, schedule: &ScheduleConfig) -> u32 {
        schedule.interval_secs(self.available)
    }
}
