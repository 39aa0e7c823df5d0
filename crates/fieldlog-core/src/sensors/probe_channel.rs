use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::ConversionSensor;
use crate::time::Monotonic;

/// Reading reported by a probe that lost its bus connection.
pub const DISCONNECTED_C: f32 = -127.0;
/// Reading reported before the first conversion after power-up.
pub const POWER_ON_RESET_C: f32 = 85.0;

/// Conversion resolution of the immersion probe.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Bits9,
    Bits10,
    Bits11,
    Bits12,
}

impl Resolution {
    pub const fn bits(self) -> u8 {
        match self {
            Resolution::Bits9 => 9,
            Resolution::Bits10 => 10,
            Resolution::Bits11 => 11,
            Resolution::Bits12 => 12,
        }
    }

    /// Worst-case conversion time from the datasheet. Never shortened.
    pub const fn conversion_time(self) -> Duration {
        match self {
            Resolution::Bits9 => Duration::from_millis(94),
            Resolution::Bits10 => Duration::from_millis(188),
            Resolution::Bits11 => Duration::from_millis(375),
            Resolution::Bits12 => Duration::from_millis(750),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Valid(f32),
    Invalid,
}

impl ProbeOutcome {
    pub fn value(self) -> Option<f32> {
        match self {
            ProbeOutcome::Valid(v) => Some(v),
            ProbeOutcome::Invalid => None,
        }
    }

    fn from_celsius(celsius: f32) -> Self {
        if celsius.is_nan() || celsius == DISCONNECTED_C || celsius == POWER_ON_RESET_C {
            ProbeOutcome::Invalid
        } else {
            ProbeOutcome::Valid(celsius)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConversionState {
    Idle,
    Pending { ready_at: Instant },
    /// The conversion was read; the outcome is cached until the next start.
    Resolved(ProbeOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelPoll {
    /// No conversion was started since the last restart.
    Idle,
    Pending,
    Ready(ProbeOutcome),
}

/// Non-blocking conversion channel around a [`ConversionSensor`].
///
/// At most one conversion is outstanding. The hardware result is fetched exactly once,
/// on the first poll at or after the ready deadline, and cached from then on. A reserved
/// or unreadable result disables the probe until the next restart.
pub struct ProbeChannel<P> {
    sensor: P,
    resolution: Resolution,
    grace: Duration,
    healthy: bool,
    state: ConversionState,
    last: Option<ProbeOutcome>,
}

impl<P: ConversionSensor> ProbeChannel<P> {
    pub fn new(sensor: P, resolution: Resolution, grace: Duration) -> Self {
        Self {
            sensor,
            resolution,
            grace,
            healthy: false,
            state: ConversionState::Idle,
            last: None,
        }
    }

    /// Detect the probe and configure its resolution. Called once at boot; the outcome
    /// is kept in [`Self::is_healthy`].
    pub async fn init(&mut self) {
        let result = async {
            self.sensor.detect().await?;
            self.sensor.set_resolution(self.resolution).await
        }
        .await;

        self.healthy = result.is_ok();
        match result {
            Ok(()) => info!("Probe ready at {} bit", self.resolution.bits()),
            Err(e) => warn!("Probe unavailable: {}", e),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn state(&self) -> ConversionState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, ConversionState::Pending { .. })
    }

    /// Outcome of the most recently resolved conversion.
    pub fn latest(&self) -> Option<ProbeOutcome> {
        self.last
    }

    /// Begin a conversion. Returns `false` without touching the bus when the probe is
    /// disabled or a conversion is already pending.
    pub async fn start(&mut self, now: Instant) -> bool {
        if !self.healthy {
            return false;
        }
        if self.is_pending() {
            debug!("Probe conversion already pending, start ignored");
            return false;
        }

        match self.sensor.start_conversion().await {
            Ok(()) => {
                self.state = ConversionState::Pending {
                    ready_at: now + self.resolution.conversion_time(),
                };
                true
            }
            Err(e) => {
                warn!("Probe conversion could not be started: {}", e);
                self.settle(ProbeOutcome::Invalid);
                false
            }
        }
    }

    pub async fn poll(&mut self, now: Instant) -> ChannelPoll {
        match self.state {
            ConversionState::Idle => ChannelPoll::Idle,
            ConversionState::Resolved(outcome) => ChannelPoll::Ready(outcome),
            ConversionState::Pending { ready_at } if now < ready_at => ChannelPoll::Pending,
            ConversionState::Pending { .. } => {
                let outcome = match self.sensor.read_celsius().await {
                    Ok(celsius) => ProbeOutcome::from_celsius(celsius),
                    Err(e) => {
                        warn!("Probe read failed: {}", e);
                        ProbeOutcome::Invalid
                    }
                };
                self.settle(outcome);
                ChannelPoll::Ready(outcome)
            }
        }
    }

    /// Wait out a pending conversion, bounded by the conversion time plus the grace period.
    /// A conversion still pending after that is given up as invalid.
    pub async fn resolve<T: Monotonic + DelayNs>(&mut self, timer: &mut T) -> Option<ProbeOutcome> {
        let ConversionState::Pending { ready_at } = self.state else {
            return self.last;
        };

        let now = timer.now();
        if now < ready_at {
            timer.delay_us(micros(ready_at - now)).await;
        }
        if self.poll(timer.now()).await == ChannelPoll::Pending {
            timer.delay_us(micros(self.grace)).await;
            if self.poll(timer.now()).await == ChannelPoll::Pending {
                warn!("Probe conversion did not complete in time, giving up");
                self.state = ConversionState::Resolved(ProbeOutcome::Invalid);
                self.last = Some(ProbeOutcome::Invalid);
            }
        }
        self.last
    }

    /// Start a conversion if none is pending and wait for it. Used by the display path.
    pub async fn read_blocking<T: Monotonic + DelayNs>(&mut self, timer: &mut T) -> ProbeOutcome {
        if !self.healthy && !self.is_pending() {
            return ProbeOutcome::Invalid;
        }
        if !self.is_pending() {
            self.start(timer.now()).await;
        }
        self.resolve(timer).await.unwrap_or(ProbeOutcome::Invalid)
    }

    fn settle(&mut self, outcome: ProbeOutcome) {
        if outcome == ProbeOutcome::Invalid && self.healthy {
            warn!("Probe returned an invalid conversion, disabled until restart");
            self.healthy = false;
        }
        self.state = ConversionState::Resolved(outcome);
        self.last = Some(outcome);
    }
}

fn micros(d: Duration) -> u32 {
    u32::try_from(d.as_micros()).unwrap_or(u32::MAX)
}
