//! Sleep/wake control loop
//!
//! The device spends almost all of its time asleep. [`SleepScheduler`] works out how
//! long it may sleep from the last measurement and the active interval, sleeps in
//! bounded slices that a button press can cut short, and on waking either runs a
//! logged measurement or a display session. A sleep capped below the interval wakes
//! early and goes straight back to sleep.
//!
//! ```text
//!   boot ──► AwakeMeasuring ──► Sleeping ──► Woken ──┬─► AwakeMeasuring (timer / clock alarm, due)
//!                 ▲                 ▲  ▲             ├─► Sleeping (timer / clock alarm, not due)
//!                 │                 │  └─────────────┤
//!                 │                 │                └─► AwakeDisplayActive (button)
//!                 └─────────────────┴──────────────────────────┘
//! ```

mod schedule;

pub use schedule::*;

use chrono::TimeDelta;
use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use log::{debug, error, info, warn};

use crate::acquisition::{Acquisition, CycleMode, LogOutcome};
use crate::config::ScheduleConfig;
use crate::display::{DisplaySnapshot, StatusDisplay};
use crate::reading::Reading;
use crate::sensors::{ClimateReadings, ConversionSensor, Sensor};
use crate::storage::{LogStore, Medium, Phase};
use crate::time::{ClockSource, Monotonic, WallClock};

/// Power management and wake lines of the board.
pub trait Platform: Monotonic + DelayNs {
    /// Enter low-power sleep for at most `duration`. May return early for any reason;
    /// the caller re-reads the wake lines afterwards.
    fn sleep(&mut self, duration: Duration) -> impl Future<Output = ()>;

    /// Level of the button wake line.
    fn button_asserted(&mut self) -> bool;

    /// Level of the clock-interrupt wake line.
    fn alarm_asserted(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    AwakeMeasuring,
    AwakeDisplayActive,
    Sleeping,
    Woken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Button,
    ClockAlarm,
    Timer,
}

/// The top-level control loop. Owns the platform, the wall clock, the display and the
/// schedule; the log store and the acquisition state are passed into each step.
pub struct SleepScheduler<P, C, V> {
    platform: P,
    clock: WallClock<C>,
    display: V,
    schedule: ScheduleState,
    config: ScheduleConfig,
    state: SchedulerState,
    alarm_armed: bool,
    last_wake: Option<WakeReason>,
}

impl<P, C, V> SleepScheduler<P, C, V>
where
    P: Platform,
    C: ClockSource,
    V: StatusDisplay,
{
    pub fn new(platform: P, clock: WallClock<C>, display: V, config: ScheduleConfig) -> Self {
        Self {
            platform,
            clock,
            display,
            schedule: ScheduleState::new(config.logging_interval_secs),
            config,
            state: SchedulerState::AwakeMeasuring,
            alarm_armed: false,
            last_wake: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn schedule(&self) -> &ScheduleState {
        &self.schedule
    }

    pub fn last_wake(&self) -> Option<WakeReason> {
        self.last_wake
    }

    pub fn platform(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn clock(&mut self) -> &mut WallClock<C> {
        &mut self.clock
    }

    pub fn display(&mut self) -> &mut V {
        &mut self.display
    }

    /// Bring up storage and sensors. The first [`Self::step`] afterwards measures.
    pub async fn boot<M, D, S, Q>(
        &mut self,
        store: &mut LogStore<'_, M, D>,
        acq: &mut Acquisition<S, Q>,
    ) where
        M: Medium,
        D: DelayNs,
        S: Sensor<Readings = ClimateReadings>,
        Q: ConversionSensor,
    {
        info!("Booting, logging every {} s", self.config.logging_interval_secs);
        if let Err(e) = store.ensure_ready(self.platform.now(), Phase::Boot).await {
            error!("No storage at boot ({}), monitoring only", e);
        }
        acq.init().await;
        self.state = SchedulerState::AwakeMeasuring;
    }

    /// Run the action of the current state and move to the next one.
    pub async fn step<M, D, S, Q>(
        &mut self,
        store: &mut LogStore<'_, M, D>,
        acq: &mut Acquisition<S, Q>,
    ) -> SchedulerState
    where
        M: Medium,
        D: DelayNs,
        S: Sensor<Readings = ClimateReadings>,
        Q: ConversionSensor,
    {
        self.state = match self.state {
            SchedulerState::AwakeMeasuring => {
                self.measure(store, acq).await;
                SchedulerState::Sleeping
            }
            SchedulerState::Sleeping => {
                self.sleep(store, acq).await;
                SchedulerState::Woken
            }
            SchedulerState::Woken => match self.classify_wake() {
                WakeReason::Button => SchedulerState::AwakeDisplayActive,
                WakeReason::ClockAlarm | WakeReason::Timer if self.measurement_due() => {
                    SchedulerState::AwakeMeasuring
                }
                WakeReason::ClockAlarm | WakeReason::Timer => {
                    debug!("Interval not over yet, back to sleep");
                    SchedulerState::Sleeping
                }
            },
            SchedulerState::AwakeDisplayActive => {
                self.display_session(store, acq).await;
                SchedulerState::Sleeping
            }
        };
        self.state
    }

    /// Step forever. Never returns.
    pub async fn run<M, D, S, Q>(&mut self, store: &mut LogStore<'_, M, D>, acq: &mut Acquisition<S, Q>)
    where
        M: Medium,
        D: DelayNs,
        S: Sensor<Readings = ClimateReadings>,
        Q: ConversionSensor,
    {
        loop {
            self.step(store, acq).await;
        }
    }

    async fn measure<M, D, S, Q>(&mut self, store: &mut LogStore<'_, M, D>, acq: &mut Acquisition<S, Q>)
    where
        M: Medium,
        D: DelayNs,
        S: Sensor<Readings = ClimateReadings>,
        Q: ConversionSensor,
    {
        if let Err(e) = store.ensure_ready(self.platform.now(), Phase::Running).await {
            debug!("Storage not ready for this cycle: {}", e);
        }

        let report = acq
            .run_cycle(CycleMode::Logged, &mut self.clock, store, &mut self.platform)
            .await;
        match report.log {
            LogOutcome::Appended { rows } => info!("Logged row {}", rows),
            LogOutcome::Mismatch { observed, tracked } => {
                warn!("Logged, but read-back found {} of {} rows", observed, tracked)
            }
            LogOutcome::Failed(e) => error!("Logging failed: {}", e),
            LogOutcome::NotAttempted => info!("Monitoring only, reading not logged"),
        }

        let stamp = report.reading.timestamp();
        let wall = (!stamp.placeholder).then(|| stamp.epoch_secs());
        self.schedule.record(wall, self.platform.now());
        self.schedule
            .set_interval(store.health().interval_secs(&self.config));
    }

    async fn sleep<M, D, S, Q>(&mut self, store: &mut LogStore<'_, M, D>, acq: &mut Acquisition<S, Q>)
    where
        M: Medium,
        D: DelayNs,
        S: Sensor<Readings = ClimateReadings>,
        Q: ConversionSensor,
    {
        self.schedule
            .set_interval(store.health().interval_secs(&self.config));

        // Nothing may be in flight once the device sleeps.
        acq.resolve_pending(&mut self.platform).await;

        let wall_now = self.clock.epoch_now();
        let remaining = self.schedule.remaining_secs(
            wall_now,
            self.platform.now(),
            self.config.max_sleep_secs,
        );

        if remaining > self.config.release_threshold_secs {
            store.release();
        }
        self.alarm_armed = remaining > self.config.alarm_threshold_secs && self.arm_alarm(remaining);

        info!(
            "Sleeping {} s (interval {} s, alarm {})",
            remaining,
            self.schedule.interval_secs(),
            if self.alarm_armed { "armed" } else { "off" }
        );
        self.sleep_slices(Duration::from_secs(remaining as u64)).await;
    }

    fn arm_alarm(&mut self, remaining: u32) -> bool {
        let Some(utc) = self.clock.now_utc() else {
            return false;
        };
        let at = utc + TimeDelta::seconds(remaining as i64);
        match self.clock.source().arm_alarm(at) {
            Ok(()) => true,
            Err(e) => {
                warn!("Clock alarm not armed: {}", e);
                false
            }
        }
    }

    /// Sleep until `total` has passed on the monotonic clock or the button is pressed.
    async fn sleep_slices(&mut self, total: Duration) {
        let deadline = self.platform.now() + total;
        let slice = self.config.sleep_slice();
        loop {
            if self.platform.button_asserted() {
                debug!("Button pressed, sleep cut short");
                return;
            }
            let now = self.platform.now();
            if now >= deadline {
                return;
            }
            let chunk = deadline.saturating_duration_since(now).min(slice);
            self.platform.sleep(chunk).await;
            if self.platform.alarm_asserted() {
                return;
            }
        }
    }

    fn measurement_due(&mut self) -> bool {
        let wall_now = self.clock.epoch_now();
        self.schedule.is_due(wall_now, self.platform.now())
    }

    fn classify_wake(&mut self) -> WakeReason {
        let button = self.platform.button_asserted();
        let alarm = self.platform.alarm_asserted();
        if self.alarm_armed {
            if let Err(e) = self.clock.source().clear_alarm() {
                warn!("Clock alarm not cleared: {}", e);
            }
            self.alarm_armed = false;
        }

        let reason = if button {
            WakeReason::Button
        } else if alarm {
            WakeReason::ClockAlarm
        } else {
            WakeReason::Timer
        };
        debug!("Woke up: {:?}", reason);
        self.last_wake = Some(reason);
        reason
    }

    async fn display_session<M, D, S, Q>(
        &mut self,
        store: &mut LogStore<'_, M, D>,
        acq: &mut Acquisition<S, Q>,
    ) where
        M: Medium,
        D: DelayNs,
        S: Sensor<Readings = ClimateReadings>,
        Q: ConversionSensor,
    {
        if let Err(e) = store.ensure_ready(self.platform.now(), Phase::Running).await {
            debug!("Storage not ready for display: {}", e);
        }

        let mut snapshot = self.refresh(store, acq).await;
        if self.watch_long_press(store).await {
            snapshot = self.snapshot(store, acq.latest());
            self.display.show(&snapshot);
        }

        let mut idle_ticks = 0;
        while idle_ticks < self.config.display_ticks {
            if self.wait_tick().await {
                snapshot = self.refresh(store, acq).await;
                if self.watch_long_press(store).await {
                    snapshot = self.snapshot(store, acq.latest());
                }
                idle_ticks = 0;
            } else {
                idle_ticks += 1;
            }
            self.display.show(&snapshot);
        }

        self.display.power_off();
        debug!("Display off");
    }

    /// One unlogged acquisition, then show the result.
    async fn refresh<M, D, S, Q>(
        &mut self,
        store: &mut LogStore<'_, M, D>,
        acq: &mut Acquisition<S, Q>,
    ) -> DisplaySnapshot
    where
        M: Medium,
        D: DelayNs,
        S: Sensor<Readings = ClimateReadings>,
        Q: ConversionSensor,
    {
        let report = acq
            .run_cycle(CycleMode::Display, &mut self.clock, store, &mut self.platform)
            .await;
        let snapshot = self.snapshot(store, Some(&report.reading));
        self.display.show(&snapshot);
        snapshot
    }

    fn snapshot<M: Medium, D: DelayNs>(
        &mut self,
        store: &mut LogStore<'_, M, D>,
        latest: Option<&Reading>,
    ) -> DisplaySnapshot {
        DisplaySnapshot {
            latest: latest.copied(),
            recent: store.snapshot_rows(),
            row_count: store.count_rows(),
            storage_available: store.is_available(),
            clock_ok: self.clock.checked_now().is_ok(),
        }
    }

    /// Poll the button while it is held. Holding it past the long-press threshold rotates
    /// the log. Returns whether a rotation was attempted.
    async fn watch_long_press<M: Medium, D: DelayNs>(&mut self, store: &mut LogStore<'_, M, D>) -> bool {
        let pressed_at = self.platform.now();
        let mut rotated = false;
        while self.platform.button_asserted() {
            let now = self.platform.now();
            if now.saturating_duration_since(pressed_at) >= self.config.long_press() {
                self.rotate(store, now).await;
                rotated = true;
                self.wait_release(self.platform.now()).await;
                break;
            }
            self.platform.delay_ms(self.config.button_poll_ms).await;
        }
        self.platform.delay_ms(self.config.debounce_ms).await;
        rotated
    }

    /// Wait for the button to be let go, bounded by the release timeout.
    async fn wait_release(&mut self, since: Instant) {
        while self.platform.button_asserted() {
            if self.platform.now().saturating_duration_since(since) >= self.config.release_wait() {
                warn!("Button still held, leaving it");
                return;
            }
            self.platform.delay_ms(self.config.button_poll_ms).await;
        }
    }

    async fn rotate<M: Medium, D: DelayNs>(&mut self, store: &mut LogStore<'_, M, D>, now: Instant) {
        let local = self.clock.stamp().local;
        info!("Long press, rotating the log");
        match store.rotate(&local, now).await {
            Ok(Some(archive)) => info!("Log archived as {}", archive),
            Ok(None) => warn!("Old log discarded, archiving failed"),
            Err(e) => error!("Rotation failed: {}", e),
        }
    }

    /// Wait one display tick. Returns `true` as soon as a new button press is seen.
    async fn wait_tick(&mut self) -> bool {
        let end = self.platform.now() + self.config.display_tick();
        let mut was_pressed = self.platform.button_asserted();
        while self.platform.now() < end {
            self.platform.delay_ms(self.config.button_poll_ms).await;
            let pressed = self.platform.button_asserted();
            if pressed && !was_pressed {
                return true;
            }
            was_pressed = pressed;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SensorConfig, StorageConfig};
    use crate::reading::HEADER;
    use crate::storage::MemoryMedium;
    use crate::testing::{FakeClimate, FakeClock, FakeDelay, FakePlatform, FakeProbe, RecordingDisplay, Rig};
    use crate::time::TzRule;
    use embassy_futures::block_on;

    struct Logger {
        rig: Rig,
        display: RecordingDisplay,
        scheduler: SleepScheduler<FakePlatform, FakeClock, RecordingDisplay>,
        store: LogStore<'static, MemoryMedium, FakeDelay>,
        acq: Acquisition<FakeClimate, FakeProbe>,
    }

    fn logger(probe: FakeProbe, card_inserted: bool) -> Logger {
        logger_with(ScheduleConfig::default(), probe, card_inserted)
    }

    fn logger_with(schedule: ScheduleConfig, probe: FakeProbe, card_inserted: bool) -> Logger {
        let rig = Rig::new();
        let display = RecordingDisplay::default();
        let mut medium = MemoryMedium::new();
        if !card_inserted {
            medium.eject();
        }
        let mut logger = Logger {
            scheduler: SleepScheduler::new(
                rig.platform(),
                WallClock::new(rig.clock(), TzRule::utc()),
                display.clone(),
                schedule,
            ),
            store: LogStore::new(medium, rig.delay(), StorageConfig::default()),
            acq: Acquisition::new(FakeClimate::steady(21.5, 55.0), probe, &SensorConfig::default()),
            display,
            rig,
        };
        block_on(logger.scheduler.boot(&mut logger.store, &mut logger.acq));
        logger
    }

    impl Logger {
        fn step(&mut self) -> SchedulerState {
            block_on(self.scheduler.step(&mut self.store, &mut self.acq))
        }

        fn step_expecting(&mut self, expected: SchedulerState) {
            assert_eq!(self.step(), expected);
        }

        fn slept_ms(&self) -> u64 {
            self.rig.sleeps().iter().sum()
        }
    }

    #[test]
    fn test_measure_sleep_measure() {
        let probe = FakeProbe::with_values(&[9.0]);
        let mut logger = logger(probe.clone(), true);
        assert_eq!(logger.scheduler.state(), SchedulerState::AwakeMeasuring);

        logger.step_expecting(SchedulerState::Sleeping);
        assert_eq!(logger.store.rows(), 1);
        assert!(logger.acq.probe().is_pending());

        logger.step_expecting(SchedulerState::Woken);
        // The conversion finished before sleeping, and sleep ran in bounded slices.
        assert!(!logger.acq.probe().is_pending());
        assert_eq!(probe.reads(), 1);
        assert!(logger.rig.sleeps().iter().all(|&ms| ms <= 1000));
        assert!((240_000..241_000).contains(&logger.rig.now_ms()));

        logger.step_expecting(SchedulerState::AwakeMeasuring);
        assert_eq!(logger.scheduler.last_wake(), Some(WakeReason::ClockAlarm));
        assert_eq!(logger.rig.alarm_at(), None);

        logger.step_expecting(SchedulerState::Sleeping);
        assert_eq!(logger.store.rows(), 2);
        assert_eq!(logger.acq.latest().and_then(|r| r.water_temp_c()), Some(9.0));
    }

    #[test]
    fn test_long_sleep_releases_storage_and_arms_alarm() {
        let mut logger = logger(FakeProbe::absent(), true);
        logger.step_expecting(SchedulerState::Sleeping);
        assert!(logger.store.is_mounted());

        let before = logger.rig.utc();
        logger.rig.press(5_000, 300);
        logger.step_expecting(SchedulerState::Woken);
        assert!(!logger.store.is_mounted());
        assert_eq!(logger.rig.alarm_at(), Some(before + TimeDelta::seconds(240)));
        assert!(logger.store.health().available);
    }

    #[test]
    fn test_monitoring_only_until_card_returns() {
        let mut logger = logger(FakeProbe::absent(), false);
        assert!(!logger.store.is_available());

        logger.step_expecting(SchedulerState::Sleeping);
        assert_eq!(logger.scheduler.schedule().interval_secs(), 60);
        assert_eq!(logger.store.rows(), 0);

        logger.step_expecting(SchedulerState::Woken);
        // 60 s is below the alarm threshold, so no alarm; the timer ends the sleep.
        assert_eq!(logger.rig.alarm_at(), None);
        assert_eq!(logger.slept_ms(), 60_000);
        logger.step_expecting(SchedulerState::AwakeMeasuring);
        assert_eq!(logger.scheduler.last_wake(), Some(WakeReason::Timer));

        logger.store.medium_mut().insert();
        logger.step_expecting(SchedulerState::Sleeping);
        assert!(logger.store.is_available());
        assert_eq!(logger.store.rows(), 1);
        assert_eq!(logger.scheduler.schedule().interval_secs(), 240);
    }

    #[test]
    fn test_button_opens_display_without_logging() {
        let mut logger = logger(FakeProbe::absent(), true);
        logger.step_expecting(SchedulerState::Sleeping);

        logger.rig.press(10_000, 200);
        logger.step_expecting(SchedulerState::Woken);
        assert!((10_000..10_200).contains(&logger.rig.now_ms()));
        logger.step_expecting(SchedulerState::AwakeDisplayActive);
        assert_eq!(logger.scheduler.last_wake(), Some(WakeReason::Button));

        logger.step_expecting(SchedulerState::Sleeping);
        assert_eq!(logger.display.power_offs(), 1);
        let shown = logger.display.shown();
        assert_eq!(shown.len(), 1 + ScheduleConfig::default().display_ticks as usize);
        assert_eq!(shown[0].row_count, 1);
        assert_eq!(shown[0].recent.len(), 1);
        assert!(shown[0].storage_available);
        assert_eq!(shown[0].latest.and_then(|r| r.temperature_c()), Some(21.5));
        assert_eq!(logger.store.rows(), 1);

        // The next measurement stays anchored to the first one.
        logger.step_expecting(SchedulerState::Woken);
        assert!((240_000..241_000).contains(&logger.rig.now_ms()));
        logger.step_expecting(SchedulerState::AwakeMeasuring);
        logger.step_expecting(SchedulerState::Sleeping);
        assert_eq!(logger.store.rows(), 2);
    }

    #[test]
    fn test_new_press_keeps_display_on() {
        let mut logger = logger(FakeProbe::absent(), true);
        logger.step_expecting(SchedulerState::Sleeping);
        logger.rig.press(10_000, 200);
        logger.rig.press(15_000, 200);
        logger.step_expecting(SchedulerState::Woken);
        logger.step_expecting(SchedulerState::AwakeDisplayActive);
        logger.step_expecting(SchedulerState::Sleeping);

        assert_eq!(logger.display.power_offs(), 1);
        assert!(logger.display.shown().len() > 1 + ScheduleConfig::default().display_ticks as usize);
        assert!(logger.rig.now_ms() > 25_000);
        assert_eq!(logger.store.rows(), 1);
    }

    #[test]
    fn test_long_press_rotates_log() {
        let mut logger = logger(FakeProbe::absent(), true);
        logger.step_expecting(SchedulerState::Sleeping);
        logger.rig.press(10_000, 4_000);
        logger.step_expecting(SchedulerState::Woken);
        logger.step_expecting(SchedulerState::AwakeDisplayActive);
        logger.step_expecting(SchedulerState::Sleeping);

        assert_eq!(logger.store.rows(), 0);
        let medium = logger.store.medium();
        assert_eq!(medium.file("data.csv"), Some(HEADER.as_bytes()));
        let archives: Vec<&str> = medium.file_names().filter(|n| *n != "data.csv").collect();
        assert_eq!(archives.len(), 1);
        assert!(archives[0].starts_with("data_20250501_0000"));
        assert_eq!(medium.file(archives[0]).map(|f| f.starts_with(HEADER.as_bytes())), Some(true));

        let shown = logger.display.shown();
        assert_eq!(shown[0].row_count, 1);
        assert_eq!(shown.last().map(|s| s.row_count), Some(0));
    }

    #[test]
    fn test_press_is_seen_within_one_slice() {
        let mut logger = logger(FakeProbe::absent(), true);
        logger.step_expecting(SchedulerState::Sleeping);

        logger.rig.press(10_500, 1_000);
        logger.step_expecting(SchedulerState::Woken);
        let latency = logger.rig.now_ms() - 10_500;
        assert!(latency <= ScheduleConfig::default().sleep_slice_ms as u64, "{}", latency);
        assert!(logger.rig.sleeps().iter().all(|&ms| ms <= 1000));
        logger.step_expecting(SchedulerState::AwakeDisplayActive);
    }

    #[test]
    fn test_capped_sleep_waits_out_the_interval() {
        let schedule = ScheduleConfig {
            logging_interval_secs: 3600,
            ..ScheduleConfig::default()
        };
        let mut logger = logger_with(schedule, FakeProbe::absent(), true);
        logger.step_expecting(SchedulerState::Sleeping);
        assert_eq!(logger.store.rows(), 1);

        let mut wakes = 0;
        for _ in 0..20 {
            if logger.step() == SchedulerState::Woken {
                wakes += 1;
            }
            if logger.store.rows() == 2 {
                break;
            }
        }
        assert_eq!(logger.store.rows(), 2);
        assert!((3_600_000..3_601_000).contains(&logger.rig.now_ms()));
        assert_eq!(wakes, 4);
        assert!(logger.rig.sleeps().iter().all(|&ms| ms <= 1000));
    }

    #[test]
    fn test_unavailable_clock_measures_after_shortest_sleep() {
        let mut logger = logger(FakeProbe::absent(), true);
        logger.rig.set_clock_fault(Some(crate::time::ClockError::Unavailable));
        logger.step_expecting(SchedulerState::Sleeping);
        assert_eq!(logger.scheduler.schedule().last_measure(), None);

        logger.step_expecting(SchedulerState::Woken);
        assert_eq!(logger.rig.alarm_at(), None);
        assert_eq!(logger.slept_ms(), 1_000);
        logger.step_expecting(SchedulerState::AwakeMeasuring);
        assert_eq!(logger.scheduler.last_wake(), Some(WakeReason::Timer));
        logger.step_expecting(SchedulerState::Sleeping);
        assert_eq!(logger.store.rows(), 2);
    }
}
