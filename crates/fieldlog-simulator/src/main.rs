//! Desktop simulator for the fieldlog data logger.
//!
//! Runs the fieldlog-core scheduler against a virtual clock, so hours of logging
//! finish in well under a second. Sensors produce a synthetic day/night cycle and
//! the log store writes to an in-memory medium that is printed at the end.
//!
//! # Scenario variables
//!
//! Read from the environment or a `.env` file. Times are simulated minutes.
//!
//! | Variable                      | Effect                                         |
//! |-------------------------------|------------------------------------------------|
//! | `FIELDLOG_SIM_MINUTES`        | Length of the run (default 60)                 |
//! | `FIELDLOG_SIM_EJECT_AT`       | Pull the card                                  |
//! | `FIELDLOG_SIM_REINSERT_AT`    | Put the card back                              |
//! | `FIELDLOG_SIM_PRESS_AT`       | Short button press (display session)           |
//! | `FIELDLOG_SIM_LONG_PRESS_AT`  | Long button press (log rotation)               |
//! | `FIELDLOG_CONFIG`             | Path of a postcard config blob to load         |
//! | `FIELDLOG_WRITE_CONFIG`       | Write the effective config blob to this path   |

use std::cell::RefCell;
use std::env;
use std::f64::consts::TAU;
use std::fs;
use std::process;
use std::rc::Rc;

use chrono::{NaiveDateTime, TimeDelta, Timelike, Utc};
use embassy_futures::block_on;
use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use log::{error, info, warn};

use fieldlog_core::acquisition::Acquisition;
use fieldlog_core::boot::{BootMarker, TimeSync, TimeSyncError, bootstrap_clock};
use fieldlog_core::config::Config;
use fieldlog_core::display::{DisplaySnapshot, StatusDisplay};
use fieldlog_core::scheduler::{Platform, SleepScheduler};
use fieldlog_core::sensors::{ClimateReadings, ConversionSensor, Resolution, Sensor, SensorError};
use fieldlog_core::storage::{LogStore, MemoryMedium};
use fieldlog_core::time::{ClockError, ClockSource, Monotonic, WallClock};

// ---------------------------------------------------------------------------
// Scenario constants
// ---------------------------------------------------------------------------

const DEFAULT_MINUTES: u64 = 60;

/// How long a short press holds the button.
const SHORT_PRESS_MS: u64 = 200;

/// Extra hold beyond the long-press threshold.
const LONG_PRESS_MARGIN_MS: u64 = 500;

// ---------------------------------------------------------------------------
// Virtual world
// ---------------------------------------------------------------------------

/// Everything the simulated board shares: time, the clock chip and the button.
struct World {
    now_ns: u64,
    /// Clock chip reading at virtual time zero.
    utc_base: NaiveDateTime,
    lost_power: bool,
    alarm_at: Option<NaiveDateTime>,
    /// Button held during `[start, end)`, in virtual milliseconds.
    presses: Vec<(u64, u64)>,
}

type Shared = Rc<RefCell<World>>;

impl World {
    fn now_ms(&self) -> u64 {
        self.now_ns / 1_000_000
    }

    fn elapsed_secs(&self) -> f64 {
        self.now_ns as f64 / 1e9
    }

    fn utc(&self) -> NaiveDateTime {
        self.utc_base + TimeDelta::seconds((self.now_ns / 1_000_000_000) as i64)
    }

    fn advance_ns(&mut self, ns: u64) {
        self.now_ns += ns;
    }

    fn button(&self) -> bool {
        let now = self.now_ms();
        self.presses.iter().any(|&(start, end)| now >= start && now < end)
    }
}

struct SimPlatform(Shared);

impl Monotonic for SimPlatform {
    fn now(&self) -> Instant {
        Instant::from_micros(self.0.borrow().now_ns / 1_000)
    }
}

impl DelayNs for SimPlatform {
    async fn delay_ns(&mut self, ns: u32) {
        self.0.borrow_mut().advance_ns(ns as u64);
    }
}

impl Platform for SimPlatform {
    async fn sleep(&mut self, duration: Duration) {
        let mut world = self.0.borrow_mut();
        let now = world.now_ms();
        let end = now + duration.as_millis();
        let wake = world
            .presses
            .iter()
            .map(|&(start, _)| start)
            .filter(|&start| start > now && start <= end)
            .min()
            .unwrap_or(end);
        world.advance_ns((wake - now) * 1_000_000);
    }

    fn button_asserted(&mut self) -> bool {
        self.0.borrow().button()
    }

    fn alarm_asserted(&mut self) -> bool {
        let world = self.0.borrow();
        world.alarm_at.is_some_and(|at| world.utc() >= at)
    }
}

/// The battery-backed clock chip.
struct SimRtc(Shared);

impl ClockSource for SimRtc {
    fn now_utc(&mut self) -> Result<NaiveDateTime, ClockError> {
        Ok(self.0.borrow().utc())
    }

    fn lost_power(&mut self) -> Result<bool, ClockError> {
        Ok(self.0.borrow().lost_power)
    }

    fn adjust(&mut self, utc: NaiveDateTime) -> Result<(), ClockError> {
        let mut world = self.0.borrow_mut();
        world.utc_base = utc - TimeDelta::seconds((world.now_ns / 1_000_000_000) as i64);
        world.lost_power = false;
        Ok(())
    }

    fn arm_alarm(&mut self, at: NaiveDateTime) -> Result<(), ClockError> {
        self.0.borrow_mut().alarm_at = Some(at);
        Ok(())
    }

    fn clear_alarm(&mut self) -> Result<(), ClockError> {
        self.0.borrow_mut().alarm_at = None;
        Ok(())
    }
}

struct SimDelay(Shared);

impl DelayNs for SimDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.0.borrow_mut().advance_ns(ns as u64);
    }
}

// ---------------------------------------------------------------------------
// Mock sensors
// ---------------------------------------------------------------------------

/// Fraction of a simulated day, for the diurnal cycle.
fn day_phase(world: &Shared) -> f64 {
    TAU * world.borrow().elapsed_secs() / 86_400.0
}

/// Air temperature and humidity that swing opposite each other over the day.
struct MockClimate(Shared);

impl Sensor for MockClimate {
    type Readings = ClimateReadings;

    async fn init(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn read(&mut self) -> Result<ClimateReadings, SensorError> {
        let phase = day_phase(&self.0);
        let jitter = (self.0.borrow().elapsed_secs() / 700.0).cos();
        Ok(ClimateReadings {
            temperature_c: (16.0 + 6.0 * phase.sin() + 0.3 * jitter) as f32,
            humidity_pct: (65.0 - 15.0 * phase.sin() + 1.5 * jitter) as f32,
        })
    }
}

/// Water temperature lagging the air by a few hours.
struct MockProbe(Shared);

impl ConversionSensor for MockProbe {
    async fn detect(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn set_resolution(&mut self, resolution: Resolution) -> Result<(), SensorError> {
        info!("Probe resolution set to {} bits", resolution.bits());
        Ok(())
    }

    async fn start_conversion(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn read_celsius(&mut self) -> Result<f32, SensorError> {
        let phase = day_phase(&self.0);
        Ok((11.0 + 2.0 * (phase - 1.0).sin()) as f32)
    }
}

// ---------------------------------------------------------------------------
// Display, time sync and boot marker
// ---------------------------------------------------------------------------

fn show_value(value: Option<f32>, unit: &str) -> String {
    value.map_or_else(|| String::from("--"), |v| format!("{:.1}{}", v, unit))
}

/// Writes each refresh to the log instead of a screen.
struct LogDisplay;

impl StatusDisplay for LogDisplay {
    fn show(&mut self, snapshot: &DisplaySnapshot) {
        let latest = snapshot.latest.as_ref();
        info!(
            "[display] {} | {} rows | air {} {} | water {}",
            snapshot.status_text(),
            snapshot.row_count,
            show_value(latest.and_then(|r| r.temperature_c()), "C"),
            show_value(latest.and_then(|r| r.humidity_pct()), "%"),
            show_value(latest.and_then(|r| r.water_temp_c()), "C"),
        );
        for row in &snapshot.recent {
            info!(
                "[display]   {}  {}  {}  {}",
                row.local,
                show_value(Some(row.temperature_c), "C"),
                show_value(Some(row.humidity_pct), "%"),
                show_value(Some(row.water_temp_c), "C"),
            );
        }
    }

    fn power_off(&mut self) {
        info!("[display] off");
    }
}

/// Network time: the host clock.
struct HostTimeSync;

impl TimeSync for HostTimeSync {
    async fn sync(&mut self) -> Result<NaiveDateTime, TimeSyncError> {
        Ok(Utc::now().naive_utc())
    }
}

struct RamMarker(u8);

impl BootMarker for RamMarker {
    fn load(&mut self) -> u8 {
        self.0
    }

    fn store(&mut self, value: u8) {
        self.0 = value;
    }
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

fn env_minutes(name: &str) -> Option<u64> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(minutes) => Some(minutes),
        Err(_) => {
            warn!("Ignoring {}={:?}, expected whole minutes", name, value);
            None
        }
    }
}

struct Scenario {
    minutes: u64,
    eject_at: Option<u64>,
    reinsert_at: Option<u64>,
    press_at: Option<u64>,
    long_press_at: Option<u64>,
}

impl Scenario {
    fn from_env() -> Self {
        Self {
            minutes: env_minutes("FIELDLOG_SIM_MINUTES").unwrap_or(DEFAULT_MINUTES),
            eject_at: env_minutes("FIELDLOG_SIM_EJECT_AT"),
            reinsert_at: env_minutes("FIELDLOG_SIM_REINSERT_AT"),
            press_at: env_minutes("FIELDLOG_SIM_PRESS_AT"),
            long_press_at: env_minutes("FIELDLOG_SIM_LONG_PRESS_AT"),
        }
    }
}

fn load_config_blob() -> Option<Vec<u8>> {
    let path = env::var("FIELDLOG_CONFIG").ok()?;
    match fs::read(&path) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!("Cannot read config {}: {}", path, e);
            process::exit(1);
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    let _ = dotenvy::dotenv();
    env_logger::init();
    info!("Starting fieldlog simulator");

    let blob = load_config_blob();
    let config = match blob.as_deref().map(Config::decode) {
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            error!("Invalid config: {}", e);
            process::exit(1);
        }
        None => Config::default(),
    };
    if let Ok(path) = env::var("FIELDLOG_WRITE_CONFIG") {
        match config.encode().map(|bytes| fs::write(&path, bytes)) {
            Ok(Ok(())) => info!("Config written to {}", path),
            Ok(Err(e)) => error!("Cannot write config {}: {}", path, e),
            Err(e) => error!("Cannot encode config: {}", e),
        }
    }
    let zone = match config.zone() {
        Ok(zone) => zone,
        Err(e) => {
            error!("Invalid timezone {:?}: {}", config.timezone, e);
            process::exit(1);
        }
    };

    let scenario = Scenario::from_env();
    let world: Shared = Rc::new(RefCell::new(World {
        now_ns: 0,
        utc_base: Utc::now().naive_utc().with_nanosecond(0).unwrap_or_default(),
        lost_power: true,
        alarm_at: None,
        presses: Vec::new(),
    }));
    {
        let mut world = world.borrow_mut();
        if let Some(minute) = scenario.press_at {
            let start = minute * 60_000;
            world.presses.push((start, start + SHORT_PRESS_MS));
        }
        if let Some(minute) = scenario.long_press_at {
            let start = minute * 60_000;
            let hold = config.schedule.long_press_ms as u64 + LONG_PRESS_MARGIN_MS;
            world.presses.push((start, start + hold));
        }
    }

    let mut clock = WallClock::new(SimRtc(world.clone()), zone);
    let bootstrap = block_on(bootstrap_clock(&mut clock, &mut RamMarker(0), &mut HostTimeSync));
    info!("Clock bootstrap: {:?}", bootstrap);

    let mut scheduler = SleepScheduler::new(
        SimPlatform(world.clone()),
        clock,
        LogDisplay,
        config.schedule,
    );
    let mut store = LogStore::new(MemoryMedium::new(), SimDelay(world.clone()), config.storage);
    let mut acq = Acquisition::new(
        MockClimate(world.clone()),
        MockProbe(world.clone()),
        &config.sensors,
    );

    block_on(scheduler.boot(&mut store, &mut acq));

    let end_ms = scenario.minutes * 60_000;
    let mut ejected = false;
    let mut reinserted = false;
    loop {
        let now_ms = world.borrow().now_ms();
        if now_ms >= end_ms {
            break;
        }
        let minute = now_ms / 60_000;
        if !ejected && scenario.eject_at.is_some_and(|at| minute >= at) {
            warn!("Card pulled at minute {}", minute);
            store.medium_mut().eject();
            ejected = true;
        }
        if ejected && !reinserted && scenario.reinsert_at.is_some_and(|at| minute >= at) {
            info!("Card reinserted at minute {}", minute);
            store.medium_mut().insert();
            reinserted = true;
        }
        block_on(scheduler.step(&mut store, &mut acq));
    }

    info!(
        "Simulated {} minutes, {} rows in {}",
        scenario.minutes,
        store.count_rows(),
        store.file_name()
    );
    for name in store.medium().file_names() {
        if let Some(contents) = store.medium().file(name) {
            println!("==> {} <==", name);
            print!("{}", String::from_utf8_lossy(contents));
        }
    }
}
