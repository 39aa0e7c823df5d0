use alloc::vec::Vec;

use embassy_time::Duration;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::sensors::Resolution;
use crate::time::{TzError, TzRule};

/// Central European time, unless overridden at build time through `FIELDLOG_TZ`.
pub const DEFAULT_TIMEZONE: &str = match option_env!("FIELDLOG_TZ") {
    Some(tz) => tz,
    None => "CET-1CEST,M3.5.0,M10.5.0/3",
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Configuration blob could not be encoded or decoded: {0}")]
    Codec(postcard::Error),
    #[error("Invalid timezone rule: {0}")]
    Timezone(TzError),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl From<postcard::Error> for ConfigError {
    fn from(e: postcard::Error) -> Self {
        ConfigError::Codec(e)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(bound(deserialize = "'de: 'a"))]
pub struct Config<'a> {
    /// POSIX TZ rule used for local timestamps and archive names.
    pub timezone: &'a str,
    pub storage: StorageConfig<'a>,
    pub schedule: ScheduleConfig,
    pub sensors: SensorConfig,
}

impl Default for Config<'_> {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE,
            storage: StorageConfig::default(),
            schedule: ScheduleConfig::default(),
            sensors: SensorConfig::default(),
        }
    }
}

impl<'a> Config<'a> {
    pub fn encode(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode a blob written by [`Config::encode`]. String fields borrow from `bytes`.
    pub fn decode(bytes: &'a [u8]) -> Result<Self, ConfigError> {
        let config: Config<'a> = postcard::from_bytes(bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.zone()?;
        let nonzero = [
            (self.storage.boot_attempts as u64, "storage.boot_attempts"),
            (self.storage.running_attempts as u64, "storage.running_attempts"),
            (self.storage.append_attempts as u64, "storage.append_attempts"),
            (self.schedule.logging_interval_secs as u64, "schedule.logging_interval_secs"),
            (self.schedule.monitoring_interval_secs as u64, "schedule.monitoring_interval_secs"),
            (self.schedule.max_sleep_secs as u64, "schedule.max_sleep_secs"),
            (self.schedule.sleep_slice_ms as u64, "schedule.sleep_slice_ms"),
            (self.schedule.display_ticks as u64, "schedule.display_ticks"),
            (self.schedule.button_poll_ms as u64, "schedule.button_poll_ms"),
            (self.sensors.reprobe_every as u64, "sensors.reprobe_every"),
        ];
        match nonzero.iter().find(|(value, _)| *value == 0) {
            Some((_, name)) => Err(ConfigError::Zero(name)),
            None if self.storage.file_name.is_empty() => Err(ConfigError::Zero("storage.file_name")),
            None => Ok(()),
        }
    }

    pub fn zone(&self) -> Result<TzRule, ConfigError> {
        TzRule::parse(self.timezone).map_err(ConfigError::Timezone)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct StorageConfig<'a> {
    /// Canonical name of the active log file.
    pub file_name: &'a str,
    /// Initialization attempts per `ensure_ready` call during boot.
    pub boot_attempts: u8,
    /// Initialization attempts per `ensure_ready` call afterwards.
    pub running_attempts: u8,
    pub append_attempts: u8,
    /// Minimum time between recovery attempts once the medium is marked unavailable.
    pub recovery_cooldown_secs: u32,
    /// Pause after resetting the bus and between attempts.
    pub settle_ms: u32,
}

impl Default for StorageConfig<'_> {
    fn default() -> Self {
        Self {
            file_name: "data.csv",
            boot_attempts: 5,
            running_attempts: 3,
            append_attempts: 2,
            recovery_cooldown_secs: 60,
            settle_ms: 100,
        }
    }
}

impl StorageConfig<'_> {
    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_secs(self.recovery_cooldown_secs as u64)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms as u64)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ScheduleConfig {
    /// Measurement interval while the log store is available.
    pub logging_interval_secs: u32,
    /// Shorter interval used in monitoring-only mode.
    pub monitoring_interval_secs: u32,
    /// Hardware ceiling on any single sleep request.
    pub max_sleep_secs: u32,
    pub sleep_slice_ms: u32,
    /// Storage is released before sleeps longer than this.
    pub release_threshold_secs: u32,
    /// The clock alarm is armed only for sleeps longer than this.
    pub alarm_threshold_secs: u32,
    pub display_ticks: u16,
    pub display_tick_ms: u32,
    pub long_press_ms: u32,
    pub button_poll_ms: u32,
    pub debounce_ms: u32,
    /// Upper bound on waiting for the button to be released after a long press.
    pub release_wait_ms: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            logging_interval_secs: 240,
            monitoring_interval_secs: 60,
            max_sleep_secs: 900,
            sleep_slice_ms: 1000,
            release_threshold_secs: 30,
            alarm_threshold_secs: 120,
            display_ticks: 10,
            display_tick_ms: 1000,
            long_press_ms: 3000,
            button_poll_ms: 20,
            debounce_ms: 50,
            release_wait_ms: 5000,
        }
    }
}

impl ScheduleConfig {
    /// The active measurement interval for the given storage availability.
    pub fn interval_secs(&self, storage_available: bool) -> u32 {
        if storage_available {
            self.logging_interval_secs
        } else {
            self.monitoring_interval_secs
        }
    }

    pub fn sleep_slice(&self) -> Duration {
        Duration::from_millis(self.sleep_slice_ms as u64)
    }

    pub fn display_tick(&self) -> Duration {
        Duration::from_millis(self.display_tick_ms as u64)
    }

    pub fn long_press(&self) -> Duration {
        Duration::from_millis(self.long_press_ms as u64)
    }

    pub fn release_wait(&self) -> Duration {
        Duration::from_millis(self.release_wait_ms as u64)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SensorConfig {
    /// An unhealthy climate sensor is re-probed on every n-th logged cycle.
    pub reprobe_every: u16,
    pub probe_resolution: Resolution,
    /// Extra wait allowed past the conversion time before a pending conversion is given up.
    pub conversion_grace_ms: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            reprobe_every: 10,
            probe_resolution: Resolution::Bits12,
            conversion_grace_ms: 250,
        }
    }
}

impl SensorConfig {
    pub fn conversion_grace(&self) -> Duration {
        Duration::from_millis(self.conversion_grace_ms as u64)
    }
}
