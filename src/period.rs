//! Calendar buckets used as KPI period keys.
//!
//! Keys render as `2025-W09` (ISO week), `2025-03` (month) and `2025-Q1`
//! (quarter). A week belongs to the month and quarter containing its ISO
//! Thursday, so weekly readings roll up without straddling two months.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::GateError;

/// Aggregation granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Weekly,
    Monthly,
    Quarterly,
}

impl Window {
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Weekly => "weekly",
            Window::Monthly => "monthly",
            Window::Quarterly => "quarterly",
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Window {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(Window::Weekly),
            "monthly" => Ok(Window::Monthly),
            "quarterly" => Ok(Window::Quarterly),
            other => Err(GateError::InvalidPeriod(format!("unknown window {other}"))),
        }
    }
}

/// A calendar bucket. Ordering is chronological within a granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodKey {
    granularity: Window,
    start: NaiveDate,
}

impl PeriodKey {
    pub fn week(iso_year: i32, week: u32) -> Result<Self, GateError> {
        let start = NaiveDate::from_isoywd_opt(iso_year, week, Weekday::Mon)
            .ok_or_else(|| GateError::InvalidPeriod(format!("{iso_year}-W{week:02}")))?;
        Ok(Self { granularity: Window::Weekly, start })
    }

    pub fn month(year: i32, month: u32) -> Result<Self, GateError> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| GateError::InvalidPeriod(format!("{year}-{month:02}")))?;
        Ok(Self { granularity: Window::Monthly, start })
    }

    pub fn quarter(year: i32, quarter: u32) -> Result<Self, GateError> {
        if !(1..=4).contains(&quarter) {
            return Err(GateError::InvalidPeriod(format!("{year}-Q{quarter}")));
        }
        let start = NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1)
            .ok_or_else(|| GateError::InvalidPeriod(format!("{year}-Q{quarter}")))?;
        Ok(Self { granularity: Window::Quarterly, start })
    }

    /// The bucket of the given granularity that contains `date`.
    pub fn containing(granularity: Window, date: NaiveDate) -> Self {
        let start = match granularity {
            Window::Weekly => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
            Window::Monthly => date.with_day(1).unwrap_or(date),
            Window::Quarterly => {
                let first_month = (date.month0() / 3) * 3 + 1;
                NaiveDate::from_ymd_opt(date.year(), first_month, 1).unwrap_or(date)
            }
        };
        Self { granularity, start }
    }

    pub fn granularity(&self) -> Window {
        self.granularity
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start
    }

    pub fn end_date(&self) -> NaiveDate {
        self.next()
            .and_then(|next| next.start.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }

    /// Date used to place the bucket inside coarser buckets and date filters.
    pub fn anchor_date(&self) -> NaiveDate {
        match self.granularity {
            Window::Weekly => self.start + Duration::days(3),
            Window::Monthly | Window::Quarterly => self.start,
        }
    }

    pub fn year(&self) -> i32 {
        match self.granularity {
            Window::Weekly => self.start.iso_week().year(),
            Window::Monthly | Window::Quarterly => self.start.year(),
        }
    }

    /// Quarter number (1-4) of the quarter containing this bucket.
    pub fn quarter_number(&self) -> u32 {
        self.anchor_date().month0() / 3 + 1
    }

    pub fn next(&self) -> Option<Self> {
        let start = match self.granularity {
            Window::Weekly => self.start.checked_add_signed(Duration::days(7))?,
            Window::Monthly => self.start.checked_add_months(Months::new(1))?,
            Window::Quarterly => self.start.checked_add_months(Months::new(3))?,
        };
        Some(Self { granularity: self.granularity, start })
    }

    pub fn prev(&self) -> Option<Self> {
        let start = match self.granularity {
            Window::Weekly => self.start.checked_sub_signed(Duration::days(7))?,
            Window::Monthly => self.start.checked_sub_months(Months::new(1))?,
            Window::Quarterly => self.start.checked_sub_months(Months::new(3))?,
        };
        Some(Self { granularity: self.granularity, start })
    }

    /// The month a week or month rolls into. Quarters have none.
    pub fn month_bucket(&self) -> Option<Self> {
        match self.granularity {
            Window::Weekly => Some(Self::containing(Window::Monthly, self.anchor_date())),
            Window::Monthly => Some(*self),
            Window::Quarterly => None,
        }
    }

    pub fn quarter_bucket(&self) -> Self {
        Self::containing(Window::Quarterly, self.anchor_date())
    }

    /// Bucket of `granularity` this key rolls into, if it is fine enough.
    pub fn bucket_for(&self, granularity: Window) -> Option<Self> {
        match granularity {
            Window::Weekly => (self.granularity == Window::Weekly).then_some(*self),
            Window::Monthly => self.month_bucket(),
            Window::Quarterly => Some(self.quarter_bucket()),
        }
    }

    /// The three months of a quarter; a month yields itself; a week yields nothing.
    pub fn months(&self) -> Vec<Self> {
        match self.granularity {
            Window::Weekly => Vec::new(),
            Window::Monthly => vec![*self],
            Window::Quarterly => {
                let mut months = Vec::with_capacity(3);
                let mut month = Self { granularity: Window::Monthly, start: self.start };
                for _ in 0..3 {
                    months.push(month);
                    match month.next() {
                        Some(next) => month = next,
                        None => break,
                    }
                }
                months
            }
        }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.granularity {
            Window::Weekly => {
                let iso = self.start.iso_week();
                write!(f, "{:04}-W{:02}", iso.year(), iso.week())
            }
            Window::Monthly => write!(f, "{:04}-{:02}", self.start.year(), self.start.month()),
            Window::Quarterly => write!(f, "{:04}-Q{}", self.start.year(), self.quarter_number()),
        }
    }
}

impl FromStr for PeriodKey {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GateError::InvalidPeriod(s.to_string());
        let (year, rest) = s.split_once('-').ok_or_else(invalid)?;
        let year: i32 = year.parse().map_err(|_| invalid())?;

        if let Some(week) = rest.strip_prefix('W') {
            let week = week.parse().map_err(|_| invalid())?;
            Self::week(year, week).map_err(|_| invalid())
        } else if let Some(quarter) = rest.strip_prefix('Q') {
            let quarter = quarter.parse().map_err(|_| invalid())?;
            Self::quarter(year, quarter).map_err(|_| invalid())
        } else {
            if rest.len() != 2 {
                return Err(invalid());
            }
            let month = rest.parse().map_err(|_| invalid())?;
            Self::month(year, month).map_err(|_| invalid())
        }
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = GateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeriodKey> for String {
    fn from(value: PeriodKey) -> Self {
        value.to_string()
    }
}

/// Inclusive, same-granularity run of periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodRange {
    from: PeriodKey,
    to: PeriodKey,
}

impl PeriodRange {
    pub fn new(from: PeriodKey, to: PeriodKey) -> Result<Self, GateError> {
        if from.granularity() != to.granularity() {
            return Err(GateError::InvalidRange(format!(
                "{from} and {to} have different granularities"
            )));
        }
        if from > to {
            return Err(GateError::InvalidRange(format!("{from} is after {to}")));
        }
        Ok(Self { from, to })
    }

    pub fn single(period: PeriodKey) -> Self {
        Self { from: period, to: period }
    }

    pub fn from(&self) -> PeriodKey {
        self.from
    }

    pub fn to(&self) -> PeriodKey {
        self.to
    }

    pub fn granularity(&self) -> Window {
        self.from.granularity()
    }

    /// First and last calendar day covered by the range.
    pub fn date_span(&self) -> (NaiveDate, NaiveDate) {
        (self.from.start_date(), self.to.end_date())
    }

    /// Every period of the range in order, with no gaps.
    pub fn periods(&self) -> Vec<PeriodKey> {
        let mut out = Vec::new();
        let mut current = Some(self.from);
        while let Some(period) = current {
            if period > self.to {
                break;
            }
            out.push(period);
            current = period.next();
        }
        out
    }
}

impl fmt::Display for PeriodRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> PeriodKey {
        s.parse().unwrap()
    }

    #[test]
    fn parses_and_renders_all_granularities() {
        for raw in ["2025-W09", "2025-03", "2025-Q1", "2024-W52", "2026-Q4"] {
            assert_eq!(key(raw).to_string(), raw);
        }
        assert_eq!(key("2025-W09").granularity(), Window::Weekly);
        assert_eq!(key("2025-03").granularity(), Window::Monthly);
        assert_eq!(key("2025-Q1").granularity(), Window::Quarterly);
    }

    #[test]
    fn rejects_malformed_keys() {
        for raw in ["2025", "2025-13", "2025-Q5", "2025-W54", "abcd-01", "2025-3"] {
            assert!(raw.parse::<PeriodKey>().is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn weeks_roll_into_the_month_of_their_thursday() {
        // 2025-W05 runs Mon 27 Jan to Sun 2 Feb; Thursday is 30 Jan.
        assert_eq!(key("2025-W05").month_bucket(), Some(key("2025-01")));
        // 2025-W01 starts Mon 30 Dec 2024; Thursday is 2 Jan 2025.
        assert_eq!(key("2025-W01").month_bucket(), Some(key("2025-01")));
        assert_eq!(key("2025-W14").quarter_bucket(), key("2025-Q2"));
    }

    #[test]
    fn next_and_prev_cross_year_boundaries() {
        assert_eq!(key("2024-12").next(), Some(key("2025-01")));
        assert_eq!(key("2025-Q1").prev(), Some(key("2024-Q4")));
        assert_eq!(key("2024-W52").next(), Some(key("2025-W01")));
    }

    #[test]
    fn quarter_months_are_contiguous() {
        assert_eq!(
            key("2025-Q2").months(),
            vec![key("2025-04"), key("2025-05"), key("2025-06")]
        );
        assert_eq!(key("2025-Q2").end_date(), NaiveDate::from_ymd_opt(2025, 6, 30).unwrap());
    }

    #[test]
    fn range_requires_ordered_same_granularity_bounds() {
        assert!(matches!(
            PeriodRange::new(key("2025-04"), key("2025-01")),
            Err(GateError::InvalidRange(_))
        ));
        assert!(matches!(
            PeriodRange::new(key("2025-01"), key("2025-Q2")),
            Err(GateError::InvalidRange(_))
        ));

        let range = PeriodRange::new(key("2024-11"), key("2025-02")).unwrap();
        let periods: Vec<String> = range.periods().iter().map(ToString::to_string).collect();
        assert_eq!(periods, vec!["2024-11", "2024-12", "2025-01", "2025-02"]);
    }

    #[test]
    fn serde_uses_the_string_form() {
        let json = serde_json::to_string(&key("2025-Q3")).unwrap();
        assert_eq!(json, "\"2025-Q3\"");
        let back: PeriodKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key("2025-Q3"));
    }
}
