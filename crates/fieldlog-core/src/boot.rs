//! One-shot clock bootstrap at power-up
//!
//! The network time sync and the first-boot marker are external collaborators. This
//! module only decides whether the sync runs and what the clock is set to afterwards.

use chrono::NaiveDateTime;
use log::{info, warn};
use thiserror_no_std::Error;

use crate::time::{ClockSource, LocalStamp, WallClock, build_timestamp, is_plausible};

/// Marker value meaning the first boot completed with a successful time sync.
pub const FIRST_BOOT_DONE: u8 = 0xA5;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncError {
    #[error("No network available for time sync")]
    NoNetwork,
    #[error("Time server did not answer")]
    Timeout,
    #[error("Time server answered with an implausible time")]
    Implausible,
}

/// One-shot network time bootstrap.
pub trait TimeSync {
    /// Fetch the current UTC time. Called at most once per boot.
    fn sync(&mut self) -> impl Future<Output = Result<NaiveDateTime, TimeSyncError>>;
}

/// A single persisted byte recording that the first boot completed.
pub trait BootMarker {
    fn load(&mut self) -> u8;

    fn store(&mut self, value: u8);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    FirstRun,
    PowerLost,
    Implausible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockBootstrap {
    /// The clock was trusted as-is; no sync ran.
    Trusted,
    Synced(SyncReason),
    /// The sync failed. The clock was set to the build time if it could not be trusted.
    Fallback(SyncReason),
}

/// Run the time sync once if the clock needs it.
///
/// The sync runs on the first boot, after the clock lost backup power, or when it reports
/// an implausible time. On failure an untrustworthy clock is set to the build timestamp,
/// which is local time rather than authoritative UTC, and startup proceeds regardless.
pub async fn bootstrap_clock<C, B, N>(
    clock: &mut WallClock<C>,
    marker: &mut B,
    sync: &mut N,
) -> ClockBootstrap
where
    C: ClockSource,
    B: BootMarker,
    N: TimeSync,
{
    let lost_power = clock.source().lost_power().unwrap_or(true);
    let plausible = clock.checked_now().is_ok();
    let reason = if marker.load() != FIRST_BOOT_DONE {
        SyncReason::FirstRun
    } else if lost_power {
        SyncReason::PowerLost
    } else if !plausible {
        SyncReason::Implausible
    } else {
        return ClockBootstrap::Trusted;
    };

    info!("Running time sync ({:?})", reason);
    let synced = match sync.sync().await {
        Ok(utc) if is_plausible(&utc) => Ok(utc),
        Ok(_) => Err(TimeSyncError::Implausible),
        Err(e) => Err(e),
    };

    match synced {
        Ok(utc) => {
            if let Err(e) = clock.source().adjust(utc) {
                warn!("Could not set the clock: {}", e);
                return ClockBootstrap::Fallback(reason);
            }
            marker.store(FIRST_BOOT_DONE);
            info!("Clock set to {}", LocalStamp(&utc));
            ClockBootstrap::Synced(reason)
        }
        Err(e) => {
            warn!("Time sync failed: {}", e);
            if lost_power || !plausible {
                let fallback = build_timestamp();
                match clock.source().adjust(fallback) {
                    Ok(()) => warn!("Clock set to build time {}", LocalStamp(&fallback)),
                    Err(e) => warn!("Could not set the clock: {}", e),
                }
            }
            ClockBootstrap::Fallback(reason)
        }
    }
}
