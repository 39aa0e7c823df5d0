use embassy_time::Instant;

/// When the last measurement happened and how long to wait for the next one.
///
/// The reference is the wall clock (UNIX seconds) so that it survives sleep modes that
/// stop the monotonic timer. An unusable wall clock counts as the interval having
/// elapsed. A measurement recorded without a wall timestamp is measured from its
/// monotonic instant instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleState {
    last_wall: Option<i64>,
    last_mono: Option<Instant>,
    interval_secs: u32,
}

impl ScheduleState {
    pub const fn new(interval_secs: u32) -> Self {
        Self {
            last_wall: None,
            last_mono: None,
            interval_secs,
        }
    }

    pub fn interval_secs(&self) -> u32 {
        self.interval_secs
    }

    pub fn set_interval(&mut self, interval_secs: u32) {
        self.interval_secs = interval_secs;
    }

    pub fn last_measure(&self) -> Option<i64> {
        self.last_wall
    }

    /// Record a measurement attempt. Called once per acquisition, whatever its outcome.
    pub fn record(&mut self, wall: Option<i64>, mono: Instant) {
        self.last_wall = wall;
        self.last_mono = Some(mono);
    }

    /// Seconds since the last measurement, never negative.
    pub fn elapsed_secs(&self, wall_now: Option<i64>, mono_now: Instant) -> u64 {
        match (wall_now, self.last_wall) {
            (None, _) => self.interval_secs as u64,
            // A clock set backwards yields zero, not a negative span.
            (Some(now), Some(last)) => now.saturating_sub(last).max(0) as u64,
            (Some(_), None) => match self.last_mono {
                Some(last) => mono_now.saturating_duration_since(last).as_secs(),
                None => self.interval_secs as u64,
            },
        }
    }

    /// Whether the next measurement is due. The wall clock ticks in whole seconds, so a
    /// wake within the last second of the interval counts. A full interval on the
    /// monotonic clock is always due, whatever the wall clock says.
    pub fn is_due(&self, wall_now: Option<i64>, mono_now: Instant) -> bool {
        let interval = self.interval_secs as u64;
        self.elapsed_secs(wall_now, mono_now) + 1 >= interval
            || self
                .last_mono
                .is_some_and(|last| mono_now.saturating_duration_since(last).as_secs() >= interval)
    }

    /// Seconds to sleep before the next measurement, within `[1, max_sleep_secs]`.
    pub fn remaining_secs(&self, wall_now: Option<i64>, mono_now: Instant, max_sleep_secs: u32) -> u32 {
        let elapsed = self.elapsed_secs(wall_now, mono_now);
        let remaining = (self.interval_secs as u64).saturating_sub(elapsed);
        remaining.clamp(1, max_sleep_secs.max(1) as u64) as u32
    }
}
