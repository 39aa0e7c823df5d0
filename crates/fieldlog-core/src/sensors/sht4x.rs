use embedded_hal_async::{delay::DelayNs, i2c::I2c};
use sht4x::Sht4xAsync;

use super::{ClimateReadings, Sensor, SensorError};

const SENSOR_NAME: &str = "SHT4x";

/// SHT4x climate sensor on an async I2C bus.
pub struct SHT4xSensor<I, D> {
    sensor: Sht4xAsync<I, D>,
    delay: D,
}

impl<I: I2c, D: DelayNs> SHT4xSensor<I, D> {
    pub fn new(i2c: I, delay: D) -> Self {
        Self {
            sensor: Sht4xAsync::<I, D>::new(i2c),
            delay,
        }
    }
}

impl<I: I2c, D: DelayNs> Sensor for SHT4xSensor<I, D> {
    type Readings = ClimateReadings;

    // The part has no identification handshake worth trusting, so a trial
    // measurement doubles as presence detection.
    async fn init(&mut self) -> Result<(), SensorError> {
        self.read().await.map(|_| ()).map_err(|_| SensorError::Unavailable {
            sensor: SENSOR_NAME,
            details: "no answer to a trial measurement",
        })
    }

    async fn read(&mut self) -> Result<ClimateReadings, SensorError> {
        let measurement = self
            .sensor
            .measure(sht4x::Precision::High, &mut self.delay)
            .await
            .map_err(|e| {
                log::error!("SHT4x measurement failed: {:?}", e);
                SensorError::ReadFailed {
                    sensor: SENSOR_NAME,
                    operation: "measure temperature/humidity",
                    details: "I2C communication error or sensor not responding",
                }
            })?;

        let readings = ClimateReadings {
            temperature_c: measurement.temperature_celsius().to_num::<f32>(),
            humidity_pct: measurement.humidity_percent().to_num::<f32>(),
        };
        if readings.is_nan() {
            return Err(SensorError::NotANumber {
                sensor: SENSOR_NAME,
            });
        }
        Ok(readings)
    }
}
