//! One measurement and its CSV representation.

use alloc::format;
use alloc::string::{String, ToString};
use core::fmt;

use crate::sensors::ClimateReadings;
use crate::time::{CompactStamp, IsoUtc, LocalStamp, Timestamp};

/// Column header, always row 0 of a log file.
pub const HEADER: &str = "ts_utc,epoch_ms,timestamp_local,temperature_C,humidity_pct,dewpoint_C,water_temp_C,sht_ok,water_ok\n";

pub const COLUMNS: usize = 9;

/// Magnus coefficients (Sonntag 1990), valid for -45 °C to 60 °C over water.
const MAGNUS_B: f32 = 17.62;
const MAGNUS_C: f32 = 243.12;

/// Dew point in °C from air temperature and relative humidity.
pub fn dew_point(temperature_c: f32, humidity_pct: f32) -> f32 {
    let gamma = libm::logf(humidity_pct / 100.0) + MAGNUS_B * temperature_c / (MAGNUS_C + temperature_c);
    MAGNUS_C * gamma / (MAGNUS_B - gamma)
}

/// A single timestamped measurement. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    timestamp: Timestamp,
    climate: Option<ClimateReadings>,
    dew_point_c: Option<f32>,
    water_temp_c: Option<f32>,
}

impl Reading {
    /// Build a reading. The dew point is derived only when both climate values are usable.
    pub fn new(timestamp: Timestamp, climate: Option<ClimateReadings>, water_temp_c: Option<f32>) -> Self {
        let climate = climate.filter(|c| !c.is_nan());
        let dew_point_c = climate
            .map(|c| dew_point(c.temperature_c, c.humidity_pct))
            .filter(|d| d.is_finite());
        Self {
            timestamp,
            climate,
            dew_point_c,
            water_temp_c: water_temp_c.filter(|w| !w.is_nan()),
        }
    }

    pub fn timestamp(&self) -> &Timestamp {
        &self.timestamp
    }

    pub fn climate(&self) -> Option<ClimateReadings> {
        self.climate
    }

    pub fn temperature_c(&self) -> Option<f32> {
        self.climate.map(|c| c.temperature_c)
    }

    pub fn humidity_pct(&self) -> Option<f32> {
        self.climate.map(|c| c.humidity_pct)
    }

    pub fn dew_point_c(&self) -> Option<f32> {
        self.dew_point_c
    }

    pub fn water_temp_c(&self) -> Option<f32> {
        self.water_temp_c
    }

    /// Serialize as one CSV line, newline included.
    pub fn to_row(&self) -> String {
        let ts = &self.timestamp;
        format!(
            "{},{},{},{},{},{},{},{},{}\n",
            IsoUtc(&ts.utc),
            ts.epoch_ms(),
            LocalStamp(&ts.local),
            Fixed(self.temperature_c(), 2),
            Fixed(self.humidity_pct(), 1),
            Fixed(self.dew_point_c, 2),
            Fixed(self.water_temp_c, 2),
            self.climate.is_some() as u8,
            self.water_temp_c.is_some() as u8,
        )
    }

    /// The subset of this reading kept for the display.
    pub fn to_recent(&self) -> RecentRow {
        RecentRow {
            local: LocalStamp(&self.timestamp.local).to_string(),
            temperature_c: self.temperature_c().unwrap_or(0.0),
            humidity_pct: self.humidity_pct().unwrap_or(0.0),
            water_temp_c: self.water_temp_c.unwrap_or(0.0),
        }
    }
}

/// Fixed-point column, empty when the value is absent.
struct Fixed(Option<f32>, usize);

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{:.*}", self.1, v),
            None => Ok(()),
        }
    }
}

/// Numeric fields of a logged row, as shown on the status display.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentRow {
    pub local: String,
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub water_temp_c: f32,
}

impl RecentRow {
    /// Parse a logged line. Rows without all columns or with a malformed `epoch_ms`
    /// are rejected; any other numeric field that does not parse reads as zero.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut fields = line.split(',');
        let mut cols: [&str; COLUMNS] = [""; COLUMNS];
        for col in cols.iter_mut() {
            *col = fields.next()?;
        }
        if fields.next().is_some() {
            return None;
        }
        cols[1].parse::<i64>().ok()?;

        let number = |s: &str| s.parse::<f32>().ok().filter(|v| v.is_finite()).unwrap_or(0.0);
        Some(Self {
            local: cols[2].to_string(),
            temperature_c: number(cols[3]),
            humidity_pct: number(cols[4]),
            water_temp_c: number(cols[6]),
        })
    }
}

/// Archive name for a rotation at local time `local`: `data_YYYYMMDD_HHMMSS.csv`.
pub fn archive_name(local: &chrono::NaiveDateTime) -> String {
    format!("data_{}.csv", CompactStamp(local))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn stamp() -> Timestamp {
        Timestamp::new(at(2025, 7, 1, 10, 0, 0), at(2025, 7, 1, 12, 0, 0))
    }

    #[test]
    fn test_full_row() {
        let climate = ClimateReadings {
            temperature_c: 22.45,
            humidity_pct: 58.3,
        };
        let reading = Reading::new(stamp(), Some(climate), Some(8.5));
        assert_eq!(
            reading.to_row(),
            "2025-07-01T10:00:00Z,1751364000000,2025-07-01 12:00:00,22.45,58.3,13.85,8.50,1,1\n"
        );
    }

    #[test]
    fn test_dew_point_needs_both_values() {
        let climate = ClimateReadings {
            temperature_c: 20.0,
            humidity_pct: f32::NAN,
        };
        let reading = Reading::new(stamp(), Some(climate), None);
        assert_eq!(reading.climate(), None);
        assert_eq!(reading.dew_point_c(), None);
        assert!(reading.to_row().ends_with(",,,,,0,0\n"));
    }

    #[test]
    fn test_dew_point_at_saturation_equals_temperature() {
        assert!((dew_point(15.0, 100.0) - 15.0).abs() < 0.01);
    }

    #[test]
    fn test_row_column_count_matches_header() {
        let reading = Reading::new(Timestamp::placeholder(), None, Some(3.0));
        let row = reading.to_row();
        assert_eq!(row.split(',').count(), COLUMNS);
        assert_eq!(HEADER.split(',').count(), COLUMNS);
        assert!(row.starts_with("2000-01-01T00:00:00Z,946684800000,"));
    }

    #[test]
    fn test_parse_recent_rows() {
        let row = RecentRow::parse_line("2025-07-01T10:00:00Z,1751364000000,2025-07-01 12:00:00,22.45,58.3,13.85,8.50,1,1\n")
            .unwrap();
        assert_eq!(row.local, "2025-07-01 12:00:00");
        assert_eq!(row.temperature_c, 22.45);
        assert_eq!(row.humidity_pct, 58.3);
        assert_eq!(row.water_temp_c, 8.5);

        let partial = RecentRow::parse_line("2025-07-01T10:00:00Z,1751364000000,2025-07-01 12:00:00,,,,x,0,0").unwrap();
        assert_eq!(partial.temperature_c, 0.0);
        assert_eq!(partial.water_temp_c, 0.0);

        assert_eq!(RecentRow::parse_line(HEADER), None);
        assert_eq!(RecentRow::parse_line("2025-07-01T10:00:00Z,17513,short"), None);
    }

    #[test]
    fn test_archive_name() {
        assert_eq!(archive_name(&at(2025, 3, 7, 9, 5, 2)), "data_20250307_090502.csv");
    }
}
