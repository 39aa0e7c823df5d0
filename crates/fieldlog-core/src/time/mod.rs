//! Wall-clock and monotonic time for the logger
//!
//! Two clocks are in play. The monotonic clock ([`Monotonic`]) drives
//! conversion deadlines, sleep slices and recovery cool-downs. The
//! battery-backed wall clock ([`ClockSource`]) stamps readings and anchors the
//! measurement schedule; [`WallClock`] wraps it with the plausibility check
//! and the configured local time rule.

mod zone;

pub use zone::*;

use core::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use embassy_time::Instant;
use log::warn;
use thiserror_no_std::Error;

/// Earliest year a wall clock reading is believed.
pub const PLAUSIBLE_YEAR_MIN: i32 = 2024;
/// Latest year a wall clock reading is believed.
pub const PLAUSIBLE_YEAR_MAX: i32 = 2099;

/// Source of monotonic time. Injected so the scheduler can be driven by a virtual clock.
pub trait Monotonic {
    fn now(&self) -> Instant;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockError {
    #[error("Real-time clock not responding")]
    Unavailable,
    #[error("Real-time clock reports an implausible year ({0})")]
    Implausible(i32),
    #[error("Real-time clock cannot raise a wake alarm")]
    AlarmUnsupported,
}

/// Battery-backed real-time clock holding UTC.
pub trait ClockSource {
    /// Current UTC time as kept by the clock.
    fn now_utc(&mut self) -> Result<NaiveDateTime, ClockError>;

    /// Whether the clock lost its backup power since it was last adjusted.
    fn lost_power(&mut self) -> Result<bool, ClockError>;

    /// Set the clock. Only the boot-time bootstrap calls this.
    fn adjust(&mut self, utc: NaiveDateTime) -> Result<(), ClockError>;

    /// Assert the clock-interrupt wake line at `at` (UTC).
    fn arm_alarm(&mut self, at: NaiveDateTime) -> Result<(), ClockError>;

    /// Acknowledge and disarm the alarm, releasing the wake line.
    fn clear_alarm(&mut self) -> Result<(), ClockError>;
}

/// Whether a wall clock reading falls inside the believable year range.
pub fn is_plausible(utc: &NaiveDateTime) -> bool {
    (PLAUSIBLE_YEAR_MIN..=PLAUSIBLE_YEAR_MAX).contains(&utc.year())
}

/// The fixed timestamp recorded when no trustworthy clock is available.
pub fn placeholder() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// The build instant, used as a last-resort clock value when time sync fails.
///
/// The value is written to the clock as-is and is treated as local, non-authoritative time.
pub fn build_timestamp() -> NaiveDateTime {
    option_env!("FIELDLOG_BUILD_EPOCH")
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.naive_utc())
        .filter(is_plausible)
        .unwrap_or_else(|| {
            NaiveDate::from_ymd_opt(PLAUSIBLE_YEAR_MIN, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or_default()
        })
}

/// Seconds since the UNIX epoch for a UTC wall time.
pub fn epoch_secs(utc: &NaiveDateTime) -> i64 {
    utc.and_utc().timestamp()
}

/// Timestamp captured for one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub utc: NaiveDateTime,
    pub local: NaiveDateTime,
    /// True when the clock was unavailable and the fixed placeholder was used.
    pub placeholder: bool,
}

impl Timestamp {
    pub fn new(utc: NaiveDateTime, local: NaiveDateTime) -> Self {
        Self {
            utc,
            local,
            placeholder: false,
        }
    }

    pub fn placeholder() -> Self {
        let at = placeholder();
        Self {
            utc: at,
            local: at,
            placeholder: true,
        }
    }

    pub fn epoch_secs(&self) -> i64 {
        epoch_secs(&self.utc)
    }

    /// The `epoch_ms` column: whole UTC seconds scaled by 1000.
    ///
    /// The clock only resolves seconds, so the last three digits are always zero.
    pub fn epoch_ms(&self) -> i64 {
        self.epoch_secs() * 1000
    }
}

/// `YYYY-MM-DDTHH:MM:SSZ`
pub struct IsoUtc<'a>(pub &'a NaiveDateTime);

impl fmt::Display for IsoUtc<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.0;
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
            t.year(),
            t.month(),
            t.day(),
            t.hour(),
            t.minute(),
            t.second()
        )
    }
}

/// `YYYY-MM-DD HH:MM:SS`
pub struct LocalStamp<'a>(pub &'a NaiveDateTime);

impl fmt::Display for LocalStamp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.0;
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            t.year(),
            t.month(),
            t.day(),
            t.hour(),
            t.minute(),
            t.second()
        )
    }
}

/// `YYYYMMDD_HHMMSS`, the compact form used in archive file names.
pub struct CompactStamp<'a>(pub &'a NaiveDateTime);

impl fmt::Display for CompactStamp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.0;
        write!(
            f,
            "{:04}{:02}{:02}_{:02}{:02}{:02}",
            t.year(),
            t.month(),
            t.day(),
            t.hour(),
            t.minute(),
            t.second()
        )
    }
}

/// Wall clock with plausibility checking and local time conversion.
pub struct WallClock<C> {
    source: C,
    zone: TzRule,
}

impl<C: ClockSource> WallClock<C> {
    pub fn new(source: C, zone: TzRule) -> Self {
        Self { source, zone }
    }

    /// Current UTC time, or `None` when the clock is unavailable or implausible.
    pub fn now_utc(&mut self) -> Option<NaiveDateTime> {
        match self.checked_now() {
            Ok(utc) => Some(utc),
            Err(e) => {
                warn!("Wall clock unusable: {}", e);
                None
            }
        }
    }

    /// Like [`Self::now_utc`] but keeps the failure reason.
    pub fn checked_now(&mut self) -> Result<NaiveDateTime, ClockError> {
        let utc = self.source.now_utc()?;
        if is_plausible(&utc) {
            Ok(utc)
        } else {
            Err(ClockError::Implausible(utc.year()))
        }
    }

    /// Current UNIX seconds, or `None` when the clock cannot be trusted.
    pub fn epoch_now(&mut self) -> Option<i64> {
        self.now_utc().map(|utc| epoch_secs(&utc))
    }

    /// Timestamp for a new reading, falling back to the placeholder.
    pub fn stamp(&mut self) -> Timestamp {
        match self.now_utc() {
            Some(utc) => Timestamp::new(utc, self.zone.to_local(&utc)),
            None => Timestamp::placeholder(),
        }
    }

    pub fn to_local(&self, utc: &NaiveDateTime) -> NaiveDateTime {
        self.zone.to_local(utc)
    }

    pub fn source(&mut self) -> &mut C {
        &mut self.source
    }

    pub fn zone(&self) -> &TzRule {
        &self.zone
    }
}
