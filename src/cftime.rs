use chrono::{Datelike, Duration, NaiveDate};
use std::fmt;

use crate::dataset::DataArray;
use crate::error::DecimateError;

/// Cumulative day counts at the start of each month for the fixed
/// 365-day calendar.
const NOLEAP_MONTH_START: [i64; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];

/// Year-month label decoded from a CF time coordinate.
///
/// Ordering is chronological, so labels can be compared directly when
/// filtering against a requested window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        YearMonth { year, month }
    }

    /// The `YYYYMM` form used in archive filenames.
    pub fn compact(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Months,
    Years,
}

impl TimeUnit {
    fn parse(word: &str) -> Option<TimeUnit> {
        match word {
            "second" | "seconds" | "sec" | "secs" | "s" => Some(TimeUnit::Seconds),
            "minute" | "minutes" | "min" | "mins" => Some(TimeUnit::Minutes),
            "hour" | "hours" | "hr" | "hrs" | "h" => Some(TimeUnit::Hours),
            "day" | "days" | "d" => Some(TimeUnit::Days),
            "month" | "months" => Some(TimeUnit::Months),
            "year" | "years" | "yr" | "yrs" => Some(TimeUnit::Years),
            _ => None,
        }
    }

    fn seconds(self) -> Option<f64> {
        match self {
            TimeUnit::Seconds => Some(1.0),
            TimeUnit::Minutes => Some(60.0),
            TimeUnit::Hours => Some(3600.0),
            TimeUnit::Days => Some(86400.0),
            // month and year lengths depend on the calendar
            TimeUnit::Months | TimeUnit::Years => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Calendar {
    Standard,
    NoLeap,
    Day360,
}

impl Calendar {
    fn parse(name: Option<&str>) -> Result<Calendar, DecimateError> {
        match name.map(str::to_ascii_lowercase).as_deref() {
            None | Some("standard") | Some("gregorian") | Some("proleptic_gregorian") => {
                Ok(Calendar::Standard)
            }
            Some("noleap") | Some("365_day") => Ok(Calendar::NoLeap),
            Some("360_day") => Ok(Calendar::Day360),
            Some(other) => Err(DecimateError::TimeDecode {
                reason: format!("unsupported calendar '{}'", other),
            }),
        }
    }
}

/// Decodes raw CF time values into year-month labels using the
/// coordinate's `units` and `calendar` attributes.
#[derive(Debug, Clone)]
pub struct TimeDecoder {
    unit: TimeUnit,
    epoch: (i32, u32, u32),
    calendar: Calendar,
}

impl TimeDecoder {
    /// Parses a `"<unit> since <date>"` units string together with an
    /// optional calendar name.
    pub fn from_units(units: &str, calendar: Option<&str>) -> Result<Self, DecimateError> {
        let lowered = units.trim().to_ascii_lowercase();
        let (unit_word, origin) =
            lowered
                .split_once(" since ")
                .ok_or_else(|| DecimateError::TimeDecode {
                    reason: format!("units '{}' are not of the form '<unit> since <date>'", units),
                })?;
        let unit = TimeUnit::parse(unit_word.trim()).ok_or_else(|| DecimateError::TimeDecode {
            reason: format!("unrecognized time unit '{}'", unit_word.trim()),
        })?;
        let epoch = parse_epoch_date(origin.trim()).ok_or_else(|| DecimateError::TimeDecode {
            reason: format!("cannot parse epoch date from units '{}'", units),
        })?;
        let calendar = Calendar::parse(calendar)?;
        if calendar == Calendar::Standard {
            // reject epochs chrono cannot represent up front
            let (y, m, d) = epoch;
            if NaiveDate::from_ymd_opt(y, m, d).is_none() {
                return Err(DecimateError::TimeDecode {
                    reason: format!("epoch {:04}-{:02}-{:02} is not a valid date", y, m, d),
                });
            }
        }
        Ok(TimeDecoder {
            unit,
            epoch,
            calendar,
        })
    }

    /// Builds a decoder from a time coordinate's attributes.
    pub fn from_coordinate(var: &DataArray) -> Result<Self, DecimateError> {
        let units = var
            .attr_str("units")
            .ok_or_else(|| DecimateError::TimeDecode {
                reason: format!("coordinate '{}' is missing a 'units' attribute", var.name),
            })?;
        TimeDecoder::from_units(units, var.attr_str("calendar"))
    }

    /// The year-month label of one raw coordinate value.
    pub fn year_month(&self, value: f64) -> Result<YearMonth, DecimateError> {
        if !value.is_finite() {
            return Err(DecimateError::TimeDecode {
                reason: format!("non-finite time value {}", value),
            });
        }
        let (ey, em, ed) = self.epoch;
        match self.unit {
            TimeUnit::Months => {
                let months = ey as i64 * 12 + (em as i64 - 1) + value.floor() as i64;
                Ok(year_month_from_total_months(months))
            }
            TimeUnit::Years => {
                let years = ey as i64 + value.floor() as i64;
                Ok(YearMonth::new(years as i32, em))
            }
            unit => {
                let seconds = unit.seconds().unwrap_or(86400.0);
                let days = (value * seconds / 86400.0).floor() as i64;
                self.offset_days(ey, em, ed, days)
            }
        }
    }

    fn offset_days(&self, ey: i32, em: u32, ed: u32, days: i64) -> Result<YearMonth, DecimateError> {
        match self.calendar {
            Calendar::Standard => {
                let epoch = NaiveDate::from_ymd_opt(ey, em, ed).ok_or_else(|| {
                    DecimateError::TimeDecode {
                        reason: format!("epoch {:04}-{:02}-{:02} is not a valid date", ey, em, ed),
                    }
                })?;
                let date = epoch.checked_add_signed(Duration::days(days)).ok_or_else(|| {
                    DecimateError::TimeDecode {
                        reason: format!("time value {} days from epoch is out of range", days),
                    }
                })?;
                Ok(YearMonth::new(date.year(), date.month()))
            }
            Calendar::NoLeap => {
                let start = NOLEAP_MONTH_START[em as usize - 1];
                let total = ey as i64 * 365 + start + (ed as i64 - 1) + days;
                let year = total.div_euclid(365);
                let day_of_year = total.rem_euclid(365);
                let month = NOLEAP_MONTH_START
                    .iter()
                    .rposition(|&s| s <= day_of_year)
                    .unwrap_or(0);
                Ok(YearMonth::new(year as i32, month as u32 + 1))
            }
            Calendar::Day360 => {
                let total = ey as i64 * 360 + (em as i64 - 1) * 30 + (ed as i64 - 1) + days;
                let year = total.div_euclid(360);
                let month = total.rem_euclid(360) / 30;
                Ok(YearMonth::new(year as i32, month as u32 + 1))
            }
        }
    }
}

/// Decodes every value of a time coordinate into year-month labels.
pub fn decode_labels(var: &DataArray) -> Result<Vec<YearMonth>, DecimateError> {
    let decoder = TimeDecoder::from_coordinate(var)?;
    var.values.iter().map(|&v| decoder.year_month(v)).collect()
}

fn year_month_from_total_months(months: i64) -> YearMonth {
    let year = months.div_euclid(12);
    let month = months.rem_euclid(12);
    YearMonth::new(year as i32, month as u32 + 1)
}

/// Extracts (year, month, day) from the date part of a CF epoch such as
/// `1850-01-01`, `1850-1-1 00:00:00` or `2000-01-01T12:00:00Z`.
fn parse_epoch_date(origin: &str) -> Option<(i32, u32, u32)> {
    let date_part = origin
        .split(|c: char| c.is_whitespace() || c == 'T')
        .next()?;
    let mut fields = date_part.split('-');
    let year: i32 = fields.next()?.parse().ok()?;
    let month: u32 = fields.next()?.parse().ok()?;
    let day: u32 = fields.next()?.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some((year, month, day))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::AttributeValue;
    use std::collections::HashMap;

    fn decoder(units: &str, calendar: Option<&str>) -> TimeDecoder {
        TimeDecoder::from_units(units, calendar).unwrap()
    }

    #[test]
    fn test_standard_calendar_days() {
        let d = decoder("days since 1850-01-01", None);
        let expected = NaiveDate::from_ymd_opt(2000, 6, 16).unwrap()
            - NaiveDate::from_ymd_opt(1850, 1, 1).unwrap();
        let label = d.year_month(expected.num_days() as f64).unwrap();
        assert_eq!(label, YearMonth::new(2000, 6));
    }

    #[test]
    fn test_standard_calendar_hours_with_fraction() {
        let d = decoder("hours since 2000-01-01 00:00:00", Some("gregorian"));
        // 31 days and 12 hours lands mid-February
        let label = d.year_month(31.0 * 24.0 + 12.0).unwrap();
        assert_eq!(label, YearMonth::new(2000, 2));
    }

    #[test]
    fn test_noleap_calendar_ignores_leap_days() {
        let d = decoder("days since 1850-01-01", Some("noleap"));
        // 150 exact 365-day years later
        let label = d.year_month(150.0 * 365.0).unwrap();
        assert_eq!(label, YearMonth::new(2000, 1));
        // the day before rolls back to December
        let label = d.year_month(150.0 * 365.0 - 1.0).unwrap();
        assert_eq!(label, YearMonth::new(1999, 12));
    }

    #[test]
    fn test_360_day_calendar() {
        let d = decoder("days since 2000-01-01", Some("360_day"));
        assert_eq!(d.year_month(0.0).unwrap(), YearMonth::new(2000, 1));
        assert_eq!(d.year_month(30.0).unwrap(), YearMonth::new(2000, 2));
        assert_eq!(d.year_month(359.0).unwrap(), YearMonth::new(2000, 12));
        assert_eq!(d.year_month(360.0).unwrap(), YearMonth::new(2001, 1));
    }

    #[test]
    fn test_months_since_epoch() {
        let d = decoder("months since 1999-11-15", None);
        assert_eq!(d.year_month(0.0).unwrap(), YearMonth::new(1999, 11));
        assert_eq!(d.year_month(2.0).unwrap(), YearMonth::new(2000, 1));
        assert_eq!(d.year_month(13.0).unwrap(), YearMonth::new(2000, 12));
    }

    #[test]
    fn test_unsupported_calendar_is_an_error() {
        let err = TimeDecoder::from_units("days since 2000-01-01", Some("julian")).unwrap_err();
        assert!(err.to_string().contains("julian"));
    }

    #[test]
    fn test_malformed_units_are_an_error() {
        assert!(TimeDecoder::from_units("days", None).is_err());
        assert!(TimeDecoder::from_units("fortnights since 2000-01-01", None).is_err());
        assert!(TimeDecoder::from_units("days since yesterday", None).is_err());
    }

    #[test]
    fn test_decode_labels_reads_coordinate_attributes() {
        let mut attrs = HashMap::new();
        attrs.insert(
            "units".to_string(),
            AttributeValue::String("days since 2000-01-01".to_string()),
        );
        attrs.insert(
            "calendar".to_string(),
            AttributeValue::String("noleap".to_string()),
        );
        let time = DataArray::new(
            "time",
            vec!["time".to_string()],
            vec![3],
            vec![15.0, 45.0, 74.0],
        )
        .with_attributes(attrs);
        let labels = decode_labels(&time).unwrap();
        assert_eq!(
            labels,
            vec![
                YearMonth::new(2000, 1),
                YearMonth::new(2000, 2),
                YearMonth::new(2000, 3),
            ]
        );
        assert_eq!(labels[0].compact(), "200001");
    }

    #[test]
    fn test_missing_units_attribute_is_an_error() {
        let time = DataArray::new("time", vec!["time".to_string()], vec![1], vec![0.0]);
        let err = decode_labels(&time).unwrap_err();
        assert!(err.to_string().contains("units"));
    }

    #[test]
    fn test_year_month_ordering_and_formats() {
        assert!(YearMonth::new(1999, 12) < YearMonth::new(2000, 1));
        assert!(YearMonth::new(2000, 1) < YearMonth::new(2000, 2));
        assert_eq!(YearMonth::new(2000, 7).compact(), "200007");
        assert_eq!(YearMonth::new(2000, 7).to_string(), "2000-07");
    }
}
