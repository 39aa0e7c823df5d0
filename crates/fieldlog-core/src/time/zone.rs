//! POSIX timezone rules (`TZ` strings) and UTC to local conversion.
//!
//! Supported grammar: `std offset [dst [offset] ,start[/time],end[/time]]` where the
//! transition dates use the `Mm.w.d` form. Zone names are either alphabetic or
//! quoted with angle brackets (`<+03>`). Offsets follow the POSIX sign convention
//! (positive west of Greenwich).

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeDelta};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{char, u32 as unsigned},
    combinator::opt,
    sequence::{delimited, preceded},
};
use thiserror_no_std::Error;

/// Default wall-clock time of a transition when none is given (02:00).
const DEFAULT_TRANSITION_SECS: i32 = 2 * 3600;

const MAX_CLOCK_HOURS: u32 = 167;

type PResult<'a, T> = IResult<&'a str, T>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TzError {
    #[error("Malformed timezone rule")]
    Malformed,
    #[error("Timezone rule field out of range: {0}")]
    OutOfRange(&'static str),
}

/// A daylight-saving transition: the `w`-th `weekday` of `month` at `time_secs` local time.
/// Week 5 means the last such weekday of the month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub month: u32,
    pub week: u32,
    pub weekday: u32,
    pub time_secs: i32,
}

impl Transition {
    /// Local wall time of this transition in `year`.
    fn local_in(&self, year: i32) -> Option<NaiveDateTime> {
        let first = NaiveDate::from_ymd_opt(year, self.month, 1)?;
        let first_weekday = first.weekday().num_days_from_sunday();
        let mut day = 1 + (self.weekday + 7 - first_weekday) % 7 + (self.week - 1) * 7;
        let last_day = days_in_month(year, self.month)?;
        while day > last_day {
            day -= 7;
        }
        let midnight = NaiveDate::from_ymd_opt(year, self.month, day)?.and_hms_opt(0, 0, 0)?;
        midnight.checked_add_signed(TimeDelta::seconds(self.time_secs as i64))
    }
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some(next.pred_opt()?.day())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DstRule {
    /// Offset east of UTC while daylight-saving time is in effect.
    pub offset_secs: i32,
    pub start: Transition,
    pub end: Transition,
}

/// Local time rule: a standard offset plus an optional daylight-saving rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TzRule {
    /// Offset east of UTC during standard time.
    pub std_offset_secs: i32,
    pub dst: Option<DstRule>,
}

impl Default for TzRule {
    fn default() -> Self {
        Self::utc()
    }
}

impl TzRule {
    pub const fn utc() -> Self {
        Self {
            std_offset_secs: 0,
            dst: None,
        }
    }

    pub fn parse(rule: &str) -> Result<Self, TzError> {
        let (rest, parsed) = tz_rule(rule.trim()).map_err(|_| TzError::Malformed)?;
        if !rest.is_empty() {
            return Err(TzError::Malformed);
        }
        parsed
    }

    /// Whether daylight-saving time is in effect at `utc`.
    pub fn is_dst(&self, utc: &NaiveDateTime) -> bool {
        let Some(dst) = self.dst else {
            return false;
        };
        let year = utc.year();
        let start = dst
            .start
            .local_in(year)
            .and_then(|t| t.checked_sub_signed(TimeDelta::seconds(self.std_offset_secs as i64)));
        let end = dst
            .end
            .local_in(year)
            .and_then(|t| t.checked_sub_signed(TimeDelta::seconds(dst.offset_secs as i64)));
        match (start, end) {
            (Some(start), Some(end)) if start < end => *utc >= start && *utc < end,
            // Southern hemisphere: the DST period spans the new year.
            (Some(start), Some(end)) => *utc >= start || *utc < end,
            _ => false,
        }
    }

    pub fn offset_secs(&self, utc: &NaiveDateTime) -> i32 {
        match self.dst {
            Some(dst) if self.is_dst(utc) => dst.offset_secs,
            _ => self.std_offset_secs,
        }
    }

    pub fn to_local(&self, utc: &NaiveDateTime) -> NaiveDateTime {
        let offset = TimeDelta::seconds(self.offset_secs(utc) as i64);
        utc.checked_add_signed(offset).unwrap_or(*utc)
    }
}

fn zone_name(input: &str) -> PResult<'_, &str> {
    alt((
        delimited(char('<'), take_while1(|c: char| c != '>'), char('>')),
        take_while1(|c: char| c.is_ascii_alphabetic()),
    ))
    .parse(input)
}

/// `[+-]hh[:mm[:ss]]` in seconds, sign as written. Hours are limited to POSIX's 0..=167.
fn clock_secs(input: &str) -> PResult<'_, Result<i32, TzError>> {
    let parsed: PResult<'_, _> = (
        opt(alt((char('+'), char('-')))),
        unsigned,
        opt(preceded(char(':'), unsigned)),
        opt(preceded(char(':'), unsigned)),
    )
        .parse(input);
    let (rest, (sign, hours, minutes, seconds)) = parsed?;
    let (minutes, seconds) = (minutes.unwrap_or(0), seconds.unwrap_or(0));
    if hours > MAX_CLOCK_HOURS || minutes > 59 || seconds > 59 {
        return Ok((rest, Err(TzError::OutOfRange("offset"))));
    }
    let secs = (hours * 3600 + minutes * 60 + seconds) as i32;
    Ok((rest, Ok(if sign == Some('-') { -secs } else { secs })))
}

fn transition(input: &str) -> PResult<'_, Result<Transition, TzError>> {
    let parsed: PResult<'_, _> = (
        char('M'),
        unsigned,
        char('.'),
        unsigned,
        char('.'),
        unsigned,
        opt(preceded(char('/'), clock_secs)),
    )
        .parse(input);
    let (rest, (_, month, _, week, _, weekday, time)) = parsed?;
    let time = match time.transpose() {
        Ok(time) => time,
        Err(_) => return Ok((rest, Err(TzError::OutOfRange("time")))),
    };

    let checked = if !(1..=12).contains(&month) {
        Err(TzError::OutOfRange("month"))
    } else if !(1..=5).contains(&week) {
        Err(TzError::OutOfRange("week"))
    } else if weekday > 6 {
        Err(TzError::OutOfRange("weekday"))
    } else {
        Ok(Transition {
            month,
            week,
            weekday,
            time_secs: time.unwrap_or(DEFAULT_TRANSITION_SECS),
        })
    };
    Ok((rest, checked))
}

fn comma(input: &str) -> PResult<'_, char> {
    char(',')(input)
}

fn tz_rule(input: &str) -> PResult<'_, Result<TzRule, TzError>> {
    let (input, _) = zone_name(input)?;
    let (input, std_west) = clock_secs(input)?;
    let std_offset_secs = match std_west {
        Ok(west) => -west,
        Err(e) => return Ok((input, Err(e))),
    };

    let (input, dst_name) = opt(zone_name).parse(input)?;
    if dst_name.is_none() {
        return Ok((
            input,
            Ok(TzRule {
                std_offset_secs,
                dst: None,
            }),
        ));
    }

    let (input, dst_west) = opt(clock_secs).parse(input)?;
    let dst_west = match dst_west.transpose() {
        Ok(west) => west,
        Err(e) => return Ok((input, Err(e))),
    };
    let (input, _) = comma(input)?;
    let (input, start) = transition(input)?;
    let (input, _) = comma(input)?;
    let (input, end) = transition(input)?;

    let rule = start.and_then(|start| {
        end.map(|end| TzRule {
            std_offset_secs,
            dst: Some(DstRule {
                offset_secs: dst_west.map(|w| -w).unwrap_or(std_offset_secs + 3600),
                start,
                end,
            }),
        })
    });
    Ok((input, rule))
}
