//! Accounting periods (calendar months) and the input formats they are parsed from.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Largest serial accepted from a spreadsheet (9999-12-31 in the 1900 date system).
const MAX_SERIAL: f64 = 2_958_465.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PeriodError {
    #[error("period is empty")]
    Empty,
    #[error("unrecognized period: {0:?}")]
    Unrecognized(String),
    #[error("date serial out of range: {0}")]
    SerialOutOfRange(f64),
}

/// One accounting period: a calendar month.
///
/// Ordering follows time, so `BTreeSet<Period>` iterates oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    /// Returns `None` unless `month` is in `1..=12`.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn year(self) -> i32 {
        self.year
    }

    pub fn month(self) -> u32 {
        self.month
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Months since year 0; adjacent periods differ by exactly one.
    pub fn index(self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month) - 1
    }

    fn from_index(index: i64) -> Self {
        Self {
            year: index.div_euclid(12) as i32,
            month: index.rem_euclid(12) as u32 + 1,
        }
    }

    pub fn offset(self, months: i64) -> Self {
        Self::from_index(self.index() + months)
    }

    pub fn pred(self) -> Self {
        self.offset(-1)
    }

    pub fn succ(self) -> Self {
        self.offset(1)
    }

    /// Signed number of months from `self` to `other`.
    pub fn months_until(self, other: Period) -> i64 {
        other.index() - self.index()
    }

    /// Every period from `from` to `to`, both inclusive. Empty when `from > to`.
    pub fn span(from: Period, to: Period) -> impl Iterator<Item = Period> {
        (from.index()..=to.index()).map(Period::from_index)
    }

    /// Stable key form used in canonical keys and the persisted manifest, e.g. `2025-01`.
    pub fn key(self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// Convert a spreadsheet date serial (1900 date system) to the period containing it.
    ///
    /// Serial 1 is 1900-01-01. Serial 60 is the fictitious 1900-02-29 that the
    /// 1900 system inherited; it is treated as February 1900. Fractional parts
    /// (times of day) are ignored.
    pub fn from_serial(serial: f64) -> Result<Self, PeriodError> {
        if !serial.is_finite() || serial < 1.0 || serial > MAX_SERIAL {
            return Err(PeriodError::SerialOutOfRange(serial));
        }
        let days = serial.floor() as i64;
        if days == 60 {
            return Ok(Self {
                year: 1900,
                month: 2,
            });
        }
        let epoch = if days < 60 {
            NaiveDate::from_ymd_opt(1899, 12, 31)
        } else {
            NaiveDate::from_ymd_opt(1899, 12, 30)
        }
        .ok_or(PeriodError::SerialOutOfRange(serial))?;
        let date = epoch
            .checked_add_signed(Duration::days(days))
            .ok_or(PeriodError::SerialOutOfRange(serial))?;
        Ok(Self::from_date(date))
    }

    /// Parse a period label.
    ///
    /// Accepted forms (case and surrounding whitespace are ignored):
    /// `Jan 2025`, `January 2025`, `jan-2025`, `2025-01`, `2025-01-31`,
    /// `2025/01`, `1/2025`, and numeric date serials such as `45658`.
    pub fn parse(text: &str) -> Result<Self, PeriodError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(PeriodError::Empty);
        }
        let lowered = trimmed.to_lowercase();
        let unrecognized = || PeriodError::Unrecognized(trimmed.to_string());

        if let Ok(serial) = lowered.parse::<f64>() {
            return Self::from_serial(serial);
        }

        let parts: Vec<&str> = lowered
            .split(|c: char| c.is_whitespace() || c == '-' || c == '/' || c == ',')
            .filter(|part| !part.is_empty())
            .collect();

        match parts.as_slice() {
            // 2025-01 / 2025-01-31
            [year, month] | [year, month, _] if is_year(year) => {
                let month = month.parse::<u32>().map_err(|_| unrecognized())?;
                Self::new(parse_year(year)?, month).ok_or_else(unrecognized)
            }
            // 1/2025
            [month, year] if is_year(year) && month.chars().all(|c| c.is_ascii_digit()) => {
                let month = month.parse::<u32>().map_err(|_| unrecognized())?;
                Self::new(parse_year(year)?, month).ok_or_else(unrecognized)
            }
            // Jan 2025 / January 2025
            [name, year] if is_year(year) => {
                let month = month_from_name(name).ok_or_else(unrecognized)?;
                Self::new(parse_year(year)?, month).ok_or_else(unrecognized)
            }
            _ => Err(unrecognized()),
        }
    }
}

fn is_year(part: &str) -> bool {
    part.len() == 4 && part.chars().all(|c| c.is_ascii_digit())
}

fn parse_year(part: &str) -> Result<i32, PeriodError> {
    part.parse::<i32>()
        .map_err(|_| PeriodError::Unrecognized(part.to_string()))
}

fn month_from_name(name: &str) -> Option<u32> {
    if name.len() < 3 {
        return None;
    }
    let name = name.trim_end_matches('.');
    MONTH_NAMES
        .iter()
        .position(|full| full.starts_with(name))
        .map(|idx| idx as u32 + 1)
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = MONTH_NAMES[(self.month - 1) as usize];
        let mut chars = name.chars();
        let first = chars.next().map(|c| c.to_ascii_uppercase()).unwrap_or(' ');
        let rest: String = chars.take(2).collect();
        write!(f, "{first}{rest} {}", self.year)
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(year: i32, month: u32) -> Period {
        Period::new(year, month).expect("valid period")
    }

    #[test]
    fn parses_every_label_form_to_the_same_period() {
        for text in [
            "Jan 2025",
            "january 2025",
            "JAN-2025",
            "  2025-01 ",
            "2025-01-31",
            "2025/1",
            "1/2025",
            "01/2025",
            "Jan. 2025",
        ] {
            assert_eq!(Period::parse(text), Ok(p(2025, 1)), "input {text:?}");
        }
        assert_eq!(Period::parse("Sept 2024"), Ok(p(2024, 9)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Period::parse("   "), Err(PeriodError::Empty));
        assert!(matches!(
            Period::parse("Smarch 2025"),
            Err(PeriodError::Unrecognized(_))
        ));
        assert!(matches!(
            Period::parse("2025-13"),
            Err(PeriodError::Unrecognized(_))
        ));
        assert!(matches!(
            Period::parse("ja 2025"),
            Err(PeriodError::Unrecognized(_))
        ));
    }

    #[test]
    fn serials_follow_the_1900_date_system() {
        assert_eq!(Period::from_serial(1.0), Ok(p(1900, 1)));
        assert_eq!(Period::from_serial(59.0), Ok(p(1900, 2)));
        assert_eq!(Period::from_serial(60.0), Ok(p(1900, 2)));
        assert_eq!(Period::from_serial(61.0), Ok(p(1900, 3)));
        // 2025-01-01 and 2025-01-31 (with a time of day).
        assert_eq!(Period::from_serial(45658.0), Ok(p(2025, 1)));
        assert_eq!(Period::from_serial(45688.75), Ok(p(2025, 1)));
        assert_eq!(Period::from_serial(45689.0), Ok(p(2025, 2)));
        assert_eq!(Period::parse("45658"), Ok(p(2025, 1)));

        assert!(Period::from_serial(0.0).is_err());
        assert!(Period::from_serial(f64::NAN).is_err());
    }

    #[test]
    fn arithmetic_wraps_years() {
        assert_eq!(p(2025, 1).pred(), p(2024, 12));
        assert_eq!(p(2024, 12).succ(), p(2025, 1));
        assert_eq!(p(2024, 11).months_until(p(2025, 2)), 3);
        let span: Vec<_> = Period::span(p(2024, 11), p(2025, 2)).collect();
        assert_eq!(span, vec![p(2024, 11), p(2024, 12), p(2025, 1), p(2025, 2)]);
        assert_eq!(Period::span(p(2025, 2), p(2025, 1)).count(), 0);
    }

    #[test]
    fn display_and_key_forms() {
        assert_eq!(p(2025, 1).to_string(), "Jan 2025");
        assert_eq!(p(2025, 9).key(), "2025-09");
        assert_eq!(
            Period::from_date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
            p(2024, 2)
        );
    }
}
