//! Fakes shared by the unit tests.
//!
//! Everything time-related hangs off one [`Rig`]: a virtual monotonic clock in
//! nanoseconds, a wall clock derived from it, scripted button presses and the clock
//! alarm. Delays and sleeps advance the virtual clock instead of waiting.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;

use crate::display::{DisplaySnapshot, StatusDisplay};
use crate::reading::Reading;
use crate::scheduler::Platform;
use crate::sensors::{ClimateReadings, ConversionSensor, Resolution, Sensor, SensorError};
use crate::time::{ClockError, ClockSource, Monotonic, Timestamp};

struct RigState {
    now_ns: u64,
    /// Wall clock reading at monotonic zero.
    utc_base: NaiveDateTime,
    clock_fault: Option<ClockError>,
    lost_power: bool,
    alarm_at: Option<NaiveDateTime>,
    /// Button held during `[start, end)` in milliseconds.
    presses: Vec<(u64, u64)>,
    sleeps: Vec<u64>,
}

#[derive(Clone)]
pub(crate) struct Rig(Rc<RefCell<RigState>>);

impl Rig {
    /// Monotonic zero is 2025-05-01 00:00:00 UTC.
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(RigState {
            now_ns: 0,
            utc_base: NaiveDate::from_ymd_opt(2025, 5, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            clock_fault: None,
            lost_power: false,
            alarm_at: None,
            presses: Vec::new(),
            sleeps: Vec::new(),
        })))
    }

    pub fn now(&self) -> Instant {
        Instant::from_micros(self.0.borrow().now_ns / 1_000)
    }

    pub fn now_ms(&self) -> u64 {
        self.0.borrow().now_ns / 1_000_000
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_ns(ms * 1_000_000);
    }

    fn advance_ns(&self, ns: u64) {
        self.0.borrow_mut().now_ns += ns;
    }

    pub fn utc(&self) -> NaiveDateTime {
        let state = self.0.borrow();
        state.utc_base + TimeDelta::seconds((state.now_ns / 1_000_000_000) as i64)
    }

    pub fn set_utc(&self, utc: NaiveDateTime) {
        let mut state = self.0.borrow_mut();
        state.utc_base = utc - TimeDelta::seconds((state.now_ns / 1_000_000_000) as i64);
    }

    pub fn set_clock_fault(&self, fault: Option<ClockError>) {
        self.0.borrow_mut().clock_fault = fault;
    }

    pub fn set_lost_power(&self, lost: bool) {
        self.0.borrow_mut().lost_power = lost;
    }

    pub fn alarm_at(&self) -> Option<NaiveDateTime> {
        self.0.borrow().alarm_at
    }

    /// Hold the button from `start_ms` for `hold_ms`.
    pub fn press(&self, start_ms: u64, hold_ms: u64) {
        self.0.borrow_mut().presses.push((start_ms, start_ms + hold_ms));
    }

    /// Durations of every low-power sleep call, in milliseconds.
    pub fn sleeps(&self) -> Vec<u64> {
        self.0.borrow().sleeps.clone()
    }

    pub fn platform(&self) -> FakePlatform {
        FakePlatform(self.clone())
    }

    pub fn clock(&self) -> FakeClock {
        FakeClock(self.clone())
    }

    pub fn delay(&self) -> FakeDelay {
        FakeDelay(self.clone())
    }

    fn button(&self) -> bool {
        let now = self.now_ms();
        self.0
            .borrow()
            .presses
            .iter()
            .any(|&(start, end)| now >= start && now < end)
    }
}

pub(crate) struct FakePlatform(Rig);

impl Monotonic for FakePlatform {
    fn now(&self) -> Instant {
        self.0.now()
    }
}

impl DelayNs for FakePlatform {
    async fn delay_ns(&mut self, ns: u32) {
        self.0.advance_ns(ns as u64);
    }
}

impl Platform for FakePlatform {
    /// Always sleeps the full duration, so presses are only noticed between slices.
    async fn sleep(&mut self, duration: Duration) {
        let requested = duration.as_millis();
        self.0.0.borrow_mut().sleeps.push(requested);
        self.0.advance_ms(requested);
    }

    fn button_asserted(&mut self) -> bool {
        self.0.button()
    }

    fn alarm_asserted(&mut self) -> bool {
        let utc = self.0.utc();
        self.0.0.borrow().alarm_at.is_some_and(|at| utc >= at)
    }
}

pub(crate) struct FakeClock(Rig);

impl ClockSource for FakeClock {
    fn now_utc(&mut self) -> Result<NaiveDateTime, ClockError> {
        match self.0.0.borrow().clock_fault {
            Some(fault) => Err(fault),
            None => Ok(self.0.utc()),
        }
    }

    fn lost_power(&mut self) -> Result<bool, ClockError> {
        Ok(self.0.0.borrow().lost_power)
    }

    fn adjust(&mut self, utc: NaiveDateTime) -> Result<(), ClockError> {
        self.0.set_utc(utc);
        self.0.set_lost_power(false);
        Ok(())
    }

    fn arm_alarm(&mut self, at: NaiveDateTime) -> Result<(), ClockError> {
        self.0.0.borrow_mut().alarm_at = Some(at);
        Ok(())
    }

    fn clear_alarm(&mut self) -> Result<(), ClockError> {
        self.0.0.borrow_mut().alarm_at = None;
        Ok(())
    }
}

pub(crate) struct FakeDelay(Rig);

impl DelayNs for FakeDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.0.advance_ns(ns as u64);
    }
}

struct ClimateState {
    present: bool,
    steady: ClimateReadings,
    queue: VecDeque<ClimateReadings>,
    inits: u32,
}

/// Climate sensor answering with a steady value, optionally preceded by queued readings.
#[derive(Clone)]
pub(crate) struct FakeClimate(Rc<RefCell<ClimateState>>);

impl FakeClimate {
    pub fn steady(temperature_c: f32, humidity_pct: f32) -> Self {
        Self(Rc::new(RefCell::new(ClimateState {
            present: true,
            steady: ClimateReadings {
                temperature_c,
                humidity_pct,
            },
            queue: VecDeque::new(),
            inits: 0,
        })))
    }

    pub fn absent() -> Self {
        let sensor = Self::steady(0.0, 0.0);
        sensor.0.borrow_mut().present = false;
        sensor
    }

    pub fn push_reading(&self, temperature_c: f32, humidity_pct: f32) {
        self.0.borrow_mut().queue.push_back(ClimateReadings {
            temperature_c,
            humidity_pct,
        });
    }

    pub fn inits(&self) -> u32 {
        self.0.borrow().inits
    }
}

impl Sensor for FakeClimate {
    type Readings = ClimateReadings;

    async fn init(&mut self) -> Result<(), SensorError> {
        let mut state = self.0.borrow_mut();
        state.inits += 1;
        if state.present {
            Ok(())
        } else {
            Err(SensorError::Unavailable {
                sensor: "fake climate",
                details: "absent",
            })
        }
    }

    async fn read(&mut self) -> Result<ClimateReadings, SensorError> {
        let mut state = self.0.borrow_mut();
        if !state.present {
            return Err(SensorError::ReadFailed {
                sensor: "fake climate",
                operation: "read",
                details: "absent",
            });
        }
        Ok(state.queue.pop_front().unwrap_or(state.steady))
    }
}

struct ProbeState {
    present: bool,
    values: VecDeque<f32>,
    last: f32,
    reads: u32,
    conversions: u32,
}

/// Immersion probe returning scripted conversions; the last value repeats.
#[derive(Clone)]
pub(crate) struct FakeProbe(Rc<RefCell<ProbeState>>);

impl FakeProbe {
    pub fn with_values(values: &[f32]) -> Self {
        Self(Rc::new(RefCell::new(ProbeState {
            present: true,
            values: values.iter().copied().collect(),
            last: 10.0,
            reads: 0,
            conversions: 0,
        })))
    }

    pub fn absent() -> Self {
        let probe = Self::with_values(&[]);
        probe.0.borrow_mut().present = false;
        probe
    }

    pub fn reads(&self) -> u32 {
        self.0.borrow().reads
    }

    pub fn conversions(&self) -> u32 {
        self.0.borrow().conversions
    }
}

impl ConversionSensor for FakeProbe {
    async fn detect(&mut self) -> Result<(), SensorError> {
        if self.0.borrow().present {
            Ok(())
        } else {
            Err(SensorError::Unavailable {
                sensor: "fake probe",
                details: "no device on the bus",
            })
        }
    }

    async fn set_resolution(&mut self, _resolution: Resolution) -> Result<(), SensorError> {
        Ok(())
    }

    async fn start_conversion(&mut self) -> Result<(), SensorError> {
        self.0.borrow_mut().conversions += 1;
        Ok(())
    }

    async fn read_celsius(&mut self) -> Result<f32, SensorError> {
        let mut state = self.0.borrow_mut();
        state.reads += 1;
        if let Some(value) = state.values.pop_front() {
            state.last = value;
        }
        Ok(state.last)
    }
}

#[derive(Default)]
struct DisplayLog {
    shown: Vec<DisplaySnapshot>,
    power_offs: u32,
}

#[derive(Clone, Default)]
pub(crate) struct RecordingDisplay(Rc<RefCell<DisplayLog>>);

impl RecordingDisplay {
    pub fn shown(&self) -> Vec<DisplaySnapshot> {
        self.0.borrow().shown.clone()
    }

    pub fn power_offs(&self) -> u32 {
        self.0.borrow().power_offs
    }
}

impl StatusDisplay for RecordingDisplay {
    fn show(&mut self, snapshot: &DisplaySnapshot) {
        self.0.borrow_mut().shown.push(snapshot.clone());
    }

    fn power_off(&mut self) {
        self.0.borrow_mut().power_offs += 1;
    }
}

/// A reading taken at `minute` past midnight UTC on the given day.
pub(crate) fn reading_at(
    year: i32,
    month: u32,
    day: u32,
    minute: u32,
    climate: Option<ClimateReadings>,
    water_temp_c: Option<f32>,
) -> Reading {
    let utc = NaiveDate::from_ymd_opt(year, month, day)
        .unwrap()
        .and_hms_opt(0, minute, 0)
        .unwrap();
    Reading::new(Timestamp::new(utc, utc), climate, water_temp_c)
}
