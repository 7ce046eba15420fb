//! Cron schedule matching for the scheduler.
//!
//! Supported grammar: five whitespace-separated fields
//! (minute hour day-of-month month day-of-week), each one of
//! `*`, `*/N`, `A,B,C`, `A-B`, or a literal integer.
//! Day-of-week is 0-6 with Sunday = 0.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike};

use crate::error::{Result, WatchError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronField {
    Any,
    Step(u32),
    List(Vec<u32>),
    Range(u32, u32),
    Exact(u32),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Step(n) => value % n == 0,
            CronField::List(values) => values.contains(&value),
            CronField::Range(lo, hi) => value >= *lo && value <= *hi,
            CronField::Exact(v) => value == *v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    pub day_of_week: CronField,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(WatchError::CronError(format!(
                "expected 5 fields, got {} in '{}'",
                fields.len(),
                expr
            )));
        }

        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_field(fields[4], 0, 6)?,
        })
    }

    /// Whether the expression matches the calendar minute of `t`.
    pub fn matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day_of_month.matches(t.day())
            && self.month.matches(t.month())
            && self.day_of_week.matches(t.weekday().num_days_from_sunday())
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<CronField> {
    let bad = |detail: &str| WatchError::CronError(format!("field '{}': {}", field, detail));
    let parse_value = |s: &str| -> Result<u32> {
        let v: u32 = s
            .parse()
            .map_err(|_| bad("not an integer"))?;
        if v < min || v > max {
            return Err(bad(&format!("value {} outside {}-{}", v, min, max)));
        }
        Ok(v)
    };

    if field == "*" {
        return Ok(CronField::Any);
    }
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step.parse().map_err(|_| bad("bad step"))?;
        if n == 0 {
            return Err(bad("step of zero"));
        }
        return Ok(CronField::Step(n));
    }
    if field.contains(',') {
        let values = field
            .split(',')
            .map(parse_value)
            .collect::<Result<Vec<_>>>()?;
        return Ok(CronField::List(values));
    }
    if let Some((lo, hi)) = field.split_once('-') {
        let lo = parse_value(lo)?;
        let hi = parse_value(hi)?;
        if lo > hi {
            return Err(bad("inverted range"));
        }
        return Ok(CronField::Range(lo, hi));
    }
    Ok(CronField::Exact(parse_value(field)?))
}

/// A cron expression plus the last minute it fired, so a tick that lands in
/// an already-fired minute does not schedule a second run.
#[derive(Debug, Clone)]
pub struct CronGate {
    expr: CronExpr,
    last_fired: Option<NaiveDateTime>,
}

impl CronGate {
    pub fn new(expr: CronExpr) -> Self {
        Self {
            expr,
            last_fired: None,
        }
    }

    /// True exactly once per matching calendar minute.
    pub fn should_fire<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> bool {
        if !self.expr.matches(now) {
            return false;
        }
        let minute = now
            .naive_local()
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or_else(|| now.naive_local());
        if self.last_fired == Some(minute) {
            return false;
        }
        self.last_fired = Some(minute);
        true
    }
}
