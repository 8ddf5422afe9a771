//! Recurrence intervals and next-runtime arithmetic.
//!
//! A workflow recurs `Every { quantity, unit }`, serialized as
//! `"<quantity>.<unit>"` (for example `"1.hour"`). Minutes and hours are
//! clock-time additions; days, weeks, months, and years follow the calendar,
//! so a monthly workflow scheduled on the 31st lands on the last day of
//! shorter months.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, Duration, Months, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EveryError {
    #[error("invalid every format {0:?}, expected \"<quantity>.<unit>\"")]
    Format(String),
    #[error("every quantity must be a positive integer, got {0:?}")]
    Quantity(String),
    #[error("unsupported every unit {0:?}")]
    Unit(String),
}

/// Unit of a recurrence interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EveryUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl EveryUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minute" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "year" => Some(Self::Year),
            _ => None,
        }
    }
}

/// A recurrence interval such as "3.day" or "1.month".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Every {
    pub quantity: u32,
    pub unit: EveryUnit,
}

impl Every {
    pub fn new(quantity: u32, unit: EveryUnit) -> Self {
        Self { quantity, unit }
    }
}

impl fmt::Display for Every {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.quantity, self.unit.as_str())
    }
}

impl FromStr for Every {
    type Err = EveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (quantity, unit) = s
            .split_once('.')
            .ok_or_else(|| EveryError::Format(s.to_string()))?;
        let quantity: u32 = quantity
            .parse()
            .map_err(|_| EveryError::Quantity(quantity.to_string()))?;
        if quantity == 0 {
            return Err(EveryError::Quantity(quantity.to_string()));
        }
        let unit = EveryUnit::parse(unit).ok_or_else(|| EveryError::Unit(unit.to_string()))?;
        Ok(Self { quantity, unit })
    }
}

/// Apply one recurrence step to a timestamp.
///
/// The `expect`s only fire past chrono's representable range (year 262143),
/// which no stored schedule can reach.
pub fn add_interval(t: DateTime<Utc>, every: &Every) -> DateTime<Utc> {
    let quantity = every.quantity;
    match every.unit {
        EveryUnit::Minute => t + Duration::minutes(i64::from(quantity)),
        EveryUnit::Hour => t + Duration::hours(i64::from(quantity)),
        EveryUnit::Day => t
            .checked_add_days(Days::new(u64::from(quantity)))
            .expect("next runtime out of range"),
        EveryUnit::Week => t
            .checked_add_days(Days::new(7 * u64::from(quantity)))
            .expect("next runtime out of range"),
        EveryUnit::Month => t
            .checked_add_months(Months::new(quantity))
            .expect("next runtime out of range"),
        EveryUnit::Year => t
            .checked_add_months(Months::new(quantity.saturating_mul(12)))
            .expect("next runtime out of range"),
    }
}

/// Compute the runtime that follows `start`.
///
/// With backfill the schedule advances exactly one step, even when the result
/// is still in the past, so missed runs are dispatched one-for-one on
/// subsequent ticks. Without backfill the schedule skips forward to the first
/// step strictly after `now`. Terminates because `quantity >= 1` moves every
/// unit strictly forward.
pub fn next_runtime(
    start: DateTime<Utc>,
    every: &Every,
    backfill: bool,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let mut next = add_interval(start, every);
    if backfill {
        return next;
    }
    while next <= now {
        next = add_interval(next, every);
    }
    next
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        for unit in ["minute", "hour", "day", "week", "month", "year"] {
            for quantity in [1u32, 7, 90] {
                let text = format!("{quantity}.{unit}");
                let every: Every = text.parse().expect("parse every");
                assert_eq!(every.to_string(), text);
            }
        }
    }

    #[test]
    fn parse_rejects_invalid_strings() {
        assert_eq!(
            "hourly".parse::<Every>(),
            Err(EveryError::Format("hourly".to_string()))
        );
        assert_eq!(
            "1.fortnight".parse::<Every>(),
            Err(EveryError::Unit("fortnight".to_string()))
        );
        assert_eq!(
            "x.hour".parse::<Every>(),
            Err(EveryError::Quantity("x".to_string()))
        );
        assert_eq!(
            "-1.hour".parse::<Every>(),
            Err(EveryError::Quantity("-1".to_string()))
        );
        assert!("".parse::<Every>().is_err());
    }

    #[test]
    fn parse_rejects_zero_quantity() {
        // A zero interval would never advance the schedule.
        assert_eq!(
            "0.minute".parse::<Every>(),
            Err(EveryError::Quantity("0".to_string()))
        );
    }

    #[test]
    fn add_interval_clock_units() {
        let t = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            add_interval(t, &Every::new(30, EveryUnit::Minute)),
            Utc.with_ymd_and_hms(2024, 3, 10, 12, 30, 0).unwrap()
        );
        assert_eq!(
            add_interval(t, &Every::new(6, EveryUnit::Hour)),
            Utc.with_ymd_and_hms(2024, 3, 10, 18, 0, 0).unwrap()
        );
    }

    #[test]
    fn add_interval_calendar_units() {
        let t = Utc.with_ymd_and_hms(2024, 1, 31, 9, 0, 0).unwrap();
        assert_eq!(
            add_interval(t, &Every::new(1, EveryUnit::Day)),
            Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap()
        );
        assert_eq!(
            add_interval(t, &Every::new(2, EveryUnit::Week)),
            Utc.with_ymd_and_hms(2024, 2, 14, 9, 0, 0).unwrap()
        );
        // Jan 31 + 1 month clamps to the end of February.
        assert_eq!(
            add_interval(t, &Every::new(1, EveryUnit::Month)),
            Utc.with_ymd_and_hms(2024, 2, 29, 9, 0, 0).unwrap()
        );
        assert_eq!(
            add_interval(t, &Every::new(1, EveryUnit::Year)),
            Utc.with_ymd_and_hms(2025, 1, 31, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_runtime_backfill_advances_one_step() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let start = now - Duration::hours(3);
        let every = Every::new(1, EveryUnit::Hour);
        let next = next_runtime(start, &every, true, now);
        assert_eq!(next, start + Duration::hours(1));
        assert!(next < now, "backfill keeps catch-up runs in the past");
    }

    #[test]
    fn next_runtime_without_backfill_skips_to_future() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let every = Every::new(1, EveryUnit::Hour);
        let next = next_runtime(now - Duration::hours(3), &every, false, now);
        assert!(next > now);
        assert_eq!(next, now + Duration::hours(1));
    }

    #[test]
    fn next_runtime_future_start_is_single_step_either_way() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let start = now + Duration::minutes(10);
        let every = Every::new(15, EveryUnit::Minute);
        let expected = start + Duration::minutes(15);
        assert_eq!(next_runtime(start, &every, false, now), expected);
        assert_eq!(next_runtime(start, &every, true, now), expected);
    }
}
