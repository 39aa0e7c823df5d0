//! One measurement cycle: both sensors, a timestamp and the log write.

use embedded_hal_async::delay::DelayNs;
use log::{debug, info, warn};

use crate::config::SensorConfig;
use crate::reading::Reading;
use crate::sensors::{ChannelPoll, ClimateReadings, ConversionSensor, ProbeChannel, ProbeOutcome, Sensor};
use crate::storage::{LogStore, Medium, StoreError};
use crate::time::{ClockSource, Monotonic, WallClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Scheduled measurement: the probe conversion is started and left pending, and the
    /// reading is logged.
    Logged,
    /// On-demand refresh for the display: the probe is read to completion, nothing is logged.
    Display,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    NotAttempted,
    Appended { rows: u32 },
    /// The row was appended but read-back found fewer rows than tracked.
    Mismatch { observed: u32, tracked: u32 },
    Failed(StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub reading: Reading,
    pub log: LogOutcome,
}

/// Sensors plus the bookkeeping that spans cycles: the climate sensor's health and
/// re-probe counter, the probe channel and the latest reading.
pub struct Acquisition<S, P> {
    climate: S,
    climate_healthy: bool,
    reprobe_every: u16,
    cycle: u32,
    probe: ProbeChannel<P>,
    latest: Option<Reading>,
}

impl<S, P> Acquisition<S, P>
where
    S: Sensor<Readings = ClimateReadings>,
    P: ConversionSensor,
{
    pub fn new(climate: S, probe: P, config: &SensorConfig) -> Self {
        Self {
            climate,
            climate_healthy: false,
            reprobe_every: config.reprobe_every.max(1),
            cycle: 0,
            probe: ProbeChannel::new(probe, config.probe_resolution, config.conversion_grace()),
            latest: None,
        }
    }

    /// Probe both sensors once at boot.
    pub async fn init(&mut self) {
        self.probe_climate().await;
        self.probe.init().await;
    }

    pub fn climate_healthy(&self) -> bool {
        self.climate_healthy
    }

    pub fn probe(&self) -> &ProbeChannel<P> {
        &self.probe
    }

    /// Logged cycles run so far.
    pub fn cycles(&self) -> u32 {
        self.cycle
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.latest.as_ref()
    }

    /// Finish any outstanding probe conversion. Called before sleeping.
    pub async fn resolve_pending<T: Monotonic + DelayNs>(&mut self, timer: &mut T) {
        if self.probe.is_pending() {
            let outcome = self.probe.resolve(timer).await;
            debug!("Pending probe conversion resolved: {:?}", outcome);
        }
    }

    /// Run one acquisition cycle.
    pub async fn run_cycle<C, M, D, T>(
        &mut self,
        mode: CycleMode,
        clock: &mut WallClock<C>,
        store: &mut LogStore<'_, M, D>,
        timer: &mut T,
    ) -> CycleReport
    where
        C: ClockSource,
        M: Medium,
        D: DelayNs,
        T: Monotonic + DelayNs,
    {
        if mode == CycleMode::Logged {
            self.cycle = self.cycle.wrapping_add(1);
            if !self.climate_healthy && self.cycle % self.reprobe_every as u32 == 0 {
                info!("Re-probing climate sensor on cycle {}", self.cycle);
                self.probe_climate().await;
            }
        }

        // Kick off the slow conversion first so it overlaps the climate read.
        let started = mode == CycleMode::Logged && self.probe.start(timer.now()).await;

        let climate = self.read_climate().await;

        let water = match mode {
            CycleMode::Display => self.probe.read_blocking(timer).await,
            CycleMode::Logged => match self.probe.poll(timer.now()).await {
                ChannelPoll::Ready(outcome) if started => outcome,
                _ => self.probe.latest().unwrap_or(ProbeOutcome::Invalid),
            },
        };

        let reading = Reading::new(clock.stamp(), climate, water.value());
        self.latest = Some(reading);

        let log = if mode == CycleMode::Logged && store.is_available() {
            Self::log(store, &reading).await
        } else {
            LogOutcome::NotAttempted
        };
        CycleReport { reading, log }
    }

    async fn log<M: Medium, D: DelayNs>(store: &mut LogStore<'_, M, D>, reading: &Reading) -> LogOutcome {
        let appended = match store.append(reading).await {
            Ok(rows) => rows,
            Err(e) => return LogOutcome::Failed(e),
        };
        match store.verify().await {
            Ok(rows) => LogOutcome::Appended { rows },
            Err(StoreError::VerifyMismatch { observed, tracked }) => {
                LogOutcome::Mismatch { observed, tracked }
            }
            Err(e) => {
                warn!("Row {} appended but verification failed: {}", appended, e);
                LogOutcome::Failed(e)
            }
        }
    }

    async fn probe_climate(&mut self) {
        match self.climate.init().await {
            Ok(()) => {
                info!("Climate sensor ready");
                self.climate_healthy = true;
            }
            Err(e) => {
                warn!("Climate sensor unavailable: {}", e);
                self.climate_healthy = false;
            }
        }
    }

    async fn read_climate(&mut self) -> Option<ClimateReadings> {
        if !self.climate_healthy {
            return None;
        }
        match self.climate.read().await {
            Ok(readings) if readings.is_nan() => {
                warn!("Climate sensor returned NaN, backing off");
                self.climate_healthy = false;
                None
            }
            Ok(readings) => Some(readings),
            Err(e) => {
                warn!("Climate read failed: {}, backing off", e);
                self.climate_healthy = false;
                None
            }
        }
    }
}
