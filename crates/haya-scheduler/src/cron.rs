//! Standard 5-field cron expressions (minute hour day month weekday).
//!
//! Next-fire computation steps forward minute-by-minute in wall-clock time
//! up to a hard 400-day bound, so DST "missing" minutes are skipped
//! naturally. Both day fields restricted uses the standard either-matches
//! rule.

use chrono::{DateTime, Datelike, Duration, Local, Timelike, Utc};

use crate::error::{Result, SchedulerError};

/// Hard bound on the forward scan.
const MAX_SCAN_DAYS: i64 = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

/// One cron field as a membership set plus whether it was `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldSet {
    mask: u64,
    any: bool,
}

impl FieldSet {
    fn contains(&self, v: u32) -> bool {
        self.any || (self.mask >> v) & 1 == 1
    }
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "expected 5 fields, got {} in '{expr}'",
                fields.len()
            )));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_dow(fields[4])?,
        })
    }

    /// Whether this expression pins a single calendar instant per year
    /// (specific minute, hour, day and month). Reminders use this shape.
    pub fn is_one_shot_shape(&self) -> bool {
        !self.minute.any && !self.hour.any && !self.day_of_month.any && !self.month.any
    }

    fn matches_local(&self, dt: &DateTime<Local>) -> bool {
        if !self.minute.contains(dt.minute()) || !self.hour.contains(dt.hour()) {
            return false;
        }
        if !self.month.contains(dt.month()) {
            return false;
        }
        let dom_ok = self.day_of_month.contains(dt.day());
        let dow_ok = self
            .day_of_week
            .contains(dt.weekday().num_days_from_sunday());
        // standard rule: both restricted means either may match
        match (self.day_of_month.any, self.day_of_week.any) {
            (false, false) => dom_ok || dow_ok,
            _ => dom_ok && dow_ok,
        }
    }

    /// The next wall-clock fire strictly after `from`, or None when nothing
    /// matches within the scan bound.
    pub fn next_fire(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // start at the next whole minute
        let start = from + Duration::seconds(60 - i64::from(from.second()) % 60);
        let start = start - Duration::nanoseconds(i64::from(start.nanosecond()));
        let bound = from + Duration::days(MAX_SCAN_DAYS);

        let mut candidate = start;
        while candidate <= bound {
            if self.matches_local(&candidate.with_timezone(&Local)) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<FieldSet> {
    if field == "*" {
        return Ok(FieldSet { mask: 0, any: true });
    }
    let mut mask: u64 = 0;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| bad(field))?;
                if step == 0 {
                    return Err(bad(field));
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                a.parse().map_err(|_| bad(field))?,
                b.parse().map_err(|_| bad(field))?,
            )
        } else {
            let v: u32 = range.parse().map_err(|_| bad(field))?;
            (v, v)
        };
        if lo < min || hi > max || lo > hi {
            return Err(bad(field));
        }
        let mut v = lo;
        while v <= hi {
            mask |= 1u64 << v;
            v += step;
        }
    }
    Ok(FieldSet { mask, any: false })
}

/// Weekday field: 0-7 where both 0 and 7 mean Sunday.
fn parse_dow(field: &str) -> Result<FieldSet> {
    let parsed = parse_field(field, 0, 7)?;
    if parsed.any {
        return Ok(parsed);
    }
    let mut mask = parsed.mask;
    if (mask >> 7) & 1 == 1 {
        mask |= 1;
        mask &= !(1u64 << 7);
    }
    Ok(FieldSet { mask, any: false })
}

fn bad(field: &str) -> SchedulerError {
    SchedulerError::InvalidSchedule(format!("bad cron field '{field}'"))
}
