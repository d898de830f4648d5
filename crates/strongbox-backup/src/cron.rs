//! Five-field cron evaluation for BackupSchedules
//!
//! The `cron` crate expects a leading seconds field and numbers weekdays
//! 1-7 from Sunday. Schedules are written in the standard five-field form
//! (weekdays 0-7, both 0 and 7 Sunday), so a `0` seconds field is prepended
//! and the day-of-week field is rewritten into the crate's numbering.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use ::cron::Schedule;

use strongbox_common::kube_utils::truncate_name;
use strongbox_common::Error;

/// A parsed five-field cron expression, evaluated in UTC
#[derive(Clone, Debug)]
pub struct CronSchedule {
    inner: Schedule,
}

impl CronSchedule {
    /// Parse `minute hour day-of-month month day-of-week`
    pub fn parse(expr: &str) -> Result<Self, Error> {
        let fields = expr.split_whitespace().count();
        if fields != 5 {
            return Err(Error::validation_for_field(
                expr,
                "spec.schedule",
                format!("expected 5 cron fields, found {}", fields),
            ));
        }
        let invalid = |reason: String| {
            Error::validation_for_field(expr, "spec.schedule", format!("invalid cron: {}", reason))
        };
        let mut parts: Vec<&str> = expr.split_whitespace().collect();
        let weekdays = translate_day_of_week(parts[4]).map_err(invalid)?;
        parts[4] = &weekdays;

        let inner = Schedule::from_str(&format!("0 {}", parts.join(" ")))
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self { inner })
    }

    /// First slot strictly after `t`
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(&t).next()
    }

    /// Most recent slot in `(base, now]`, if any slot is due.
    ///
    /// Earlier missed slots are skipped.
    pub fn latest_due(&self, base: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(&base).take_while(|slot| *slot <= now).last()
    }
}

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn weekday(value: &str) -> Result<u32, String> {
    if let Some(n) = WEEKDAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(value))
    {
        return Ok(n as u32);
    }
    match value.parse::<u32>() {
        Ok(n) if n <= 7 => Ok(n),
        _ => Err(format!("day of week {:?} is not 0-7 or SUN-SAT", value)),
    }
}

/// Rewrite a standard day-of-week field as an explicit list in the `cron`
/// crate's numbering (Sunday = 1 ... Saturday = 7)
fn translate_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step = step
                    .parse::<u32>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid step {:?}", step))?;
                (base, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = match base.split_once('-') {
            _ if base == "*" => (0, 6),
            Some((start, end)) => (weekday(start)?, weekday(end)?),
            None => {
                let start = weekday(base)?;
                (start, if step.is_some() { start.max(6) } else { start })
            }
        };
        if start > end {
            return Err(format!("day of week range {:?} runs backwards", base));
        }

        for day in (start..=end).step_by(step.unwrap_or(1) as usize) {
            days[(day % 7) as usize] = true;
        }
    }

    Ok(days
        .iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .map(|(day, _)| (day + 1).to_string())
        .collect::<Vec<_>>()
        .join(","))
}

/// Name of the backup a schedule creates for `slot`: `{schedule}-{YYYYMMDD-HHMM}` in UTC
pub fn generate_name<Tz: TimeZone>(schedule: &str, slot: &DateTime<Tz>) -> String {
    let stamp = slot.with_timezone(&Utc).format("%Y%m%d-%H%M").to_string();
    truncate_name(schedule, &stamp)
}
