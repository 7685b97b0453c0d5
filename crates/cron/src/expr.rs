//! 5-field cron expressions: `minute hour day-of-month month day-of-week`.
//!
//! Supports `*`, `*/N`, `N`, `N-M`, `N-M/S` and comma lists. Day-of-week
//! runs 0-6 from Sunday; 7 is accepted as Sunday too.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};

use crate::CronError;

/// How far ahead [`CronExpr::next_after`] searches before giving up.
const SEARCH_LIMIT_MINUTES: i64 = 366 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::InvalidExpression {
                expr: expr.to_string(),
                reason: format!("expected 5 fields (minute hour dom month dow), got {}", fields.len()),
            });
        }
        let field = |i: usize, min: u32, max: u32| {
            parse_field(fields[i], min, max).map_err(|reason| CronError::InvalidExpression {
                expr: expr.to_string(),
                reason,
            })
        };

        let mut days_of_week = field(4, 0, 7)?;
        if days_of_week.contains(&7) {
            days_of_week.retain(|d| *d != 7);
            if !days_of_week.contains(&0) {
                days_of_week.insert(0, 0);
            }
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: field(0, 0, 59)?,
            hours: field(1, 0, 23)?,
            days_of_month: field(2, 1, 31)?,
            months: field(3, 1, 12)?,
            days_of_week,
        })
    }

    /// Whether the minute containing `dt` is a firing time.
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        self.minutes.contains(&dt.minute())
            && self.hours.contains(&dt.hour())
            && self.days_of_month.contains(&dt.day())
            && self.months.contains(&dt.month())
            && self.days_of_week.contains(&dt.weekday().num_days_from_sunday())
    }

    /// The first firing time strictly after `after`, on a minute boundary.
    ///
    /// `None` if nothing matches within a year (e.g. `0 0 31 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.duration_trunc(Duration::minutes(1)).ok()? + Duration::minutes(1);
        (0..SEARCH_LIMIT_MINUTES)
            .map(|i| start + Duration::minutes(i))
            .find(|t| self.matches(t))
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>, String> {
    let mut values = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| format!("invalid step '{step}'"))?;
                if step == 0 {
                    return Err("step cannot be zero".into());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = match range {
            "*" => (min, max),
            r if r.contains('-') => parse_range(r, min, max)?,
            // `N/S` runs from N to the field maximum
            n if step > 1 => (parse_value(n, min, max)?, max),
            n => {
                let v = parse_value(n, min, max)?;
                (v, v)
            }
        };
        values.extend((start..=end).step_by(step as usize));
    }

    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return Err(format!("field '{field}' matches nothing"));
    }
    Ok(values)
}

fn parse_range(range: &str, min: u32, max: u32) -> Result<(u32, u32), String> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| format!("invalid range '{range}'"))?;
    let (start, end) = (parse_value(start, min, max)?, parse_value(end, min, max)?);
    if start > end {
        return Err(format!("range {start}-{end} is backwards"));
    }
    Ok((start, end))
}

fn parse_value(s: &str, min: u32, max: u32) -> Result<u32, String> {
    let v: u32 = s.parse().map_err(|_| format!("invalid number '{s}'"))?;
    if !(min..=max).contains(&v) {
        return Err(format!("{v} out of range {min}-{max}"));
    }
    Ok(v)
}
