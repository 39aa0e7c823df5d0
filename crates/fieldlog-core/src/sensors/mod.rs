//! Sensor traits and the probe conversion channel
//!
//! Two kinds of sensors feed a reading. The climate sensor answers a
//! measurement request within a few milliseconds and is read synchronously
//! through [`Sensor`]. The immersion probe needs hundreds of milliseconds per
//! conversion and is driven through [`ProbeChannel`] so the scheduler never
//! blocks on it.

mod probe_channel;
#[cfg(feature = "sensor-sht4x")]
mod sht4x;

pub use probe_channel::*;
#[cfg(feature = "sensor-sht4x")]
pub use sht4x::SHT4xSensor;

use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor} not detected: {details}")]
    Unavailable {
        sensor: &'static str,
        details: &'static str,
    },
    #[error("{sensor} failed to {operation}: {details}")]
    ReadFailed {
        sensor: &'static str,
        operation: &'static str,
        details: &'static str,
    },
    #[error("{sensor} returned a value that is not a number")]
    NotANumber { sensor: &'static str },
    #[error("{sensor} conversion produced a reserved code")]
    ConversionInvalid { sensor: &'static str },
}

/// Temperature and relative humidity from the climate sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReadings {
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

impl ClimateReadings {
    /// A reading with either value not a number is unusable as a whole.
    pub fn is_nan(&self) -> bool {
        self.temperature_c.is_nan() || self.humidity_pct.is_nan()
    }
}

/// Trait for sensors that answer a measurement request directly.
pub trait Sensor {
    /// The type of readings this sensor produces.
    type Readings;

    /// Probe the sensor and bring it into a state where it can be read.
    fn init(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    /// Read the sensor and return typed readings.
    fn read(&mut self) -> impl Future<Output = Result<Self::Readings, SensorError>>;
}

/// Trait for sensors that convert in the background and are read once the
/// conversion time has passed (one-wire immersion probes and the like).
pub trait ConversionSensor {
    /// Look for the device on its bus.
    fn detect(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    fn set_resolution(
        &mut self,
        resolution: Resolution,
    ) -> impl Future<Output = Result<(), SensorError>>;

    /// Kick off a conversion without waiting for it.
    fn start_conversion(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    /// Fetch the result of the last conversion in degrees Celsius.
    fn read_celsius(&mut self) -> impl Future<Output = Result<f32, SensorError>>;
}
