use crate::pm::error::{PmError, PmResult};
use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use std::str::FromStr;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed 5-field trigger expression (`minute hour day-of-month month day-of-week`),
/// evaluated in local time.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: Schedule,
}

impl CronExpr {
    pub fn parse(expr: &str) -> PmResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(PmError::invalid(
                "cronExpression",
                format!(
                    "{expr:?}: expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                    fields.len()
                ),
            ));
        }
        let normalized = normalize_cron_expr(&fields)
            .map_err(|e| PmError::invalid("cronExpression", format!("{expr:?}: {e}")))?;
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| PmError::invalid("cronExpression", format!("{expr:?}: {e}")))?;
        Ok(Self {
            source: fields.join(" "),
            schedule,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// First occurrence strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&t.with_timezone(&Local))
            .next()
            .map(|d| d.with_timezone(&Utc))
    }
}

/// Prepend `seconds=0` and rewrite numeric day-of-week (0-7, Sunday = 0 or 7) into names,
/// which is what the `cron` crate expects.
fn normalize_cron_expr(fields: &[&str]) -> Result<String, String> {
    let dow = map_day_of_week(fields[4])?;
    Ok(format!("0 {} {} {} {} {dow}", fields[0], fields[1], fields[2], fields[3]))
}

fn map_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }
    let num = |s: &str| -> Result<usize, String> {
        let v: usize = s.parse().map_err(|_| format!("bad day-of-week {s:?}"))?;
        if v > 7 {
            return Err(format!("day-of-week {v} out of range 0-7"));
        }
        Ok(v)
    };
    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((r, s)) => {
                let step: usize = s.parse().map_err(|_| format!("bad step {s:?}"))?;
                if step == 0 {
                    return Err("step must be >= 1".to_string());
                }
                (r, Some(step))
            }
            None => (item, None),
        };
        let (lo, hi) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (num(a)?, num(b)?)
        } else {
            let v = num(range)?;
            if step.is_some() { (v, 6) } else { (v, v) }
        };
        if lo > hi {
            return Err(format!("day-of-week range {range:?} is reversed"));
        }
        for d in (lo..=hi).step_by(step.unwrap_or(1)) {
            days[d % 7] = true;
        }
    }
    let names: Vec<&str> = (0..7).filter(|d| days[*d]).map(|d| DAY_NAMES[d]).collect();
    Ok(names.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn every_fifteen_minutes() {
        let c = CronExpr::parse("*/15 * * * *").unwrap();
        let next = c.next_after(local(2026, 10, 19, 10, 7)).unwrap();
        assert_eq!(next, local(2026, 10, 19, 10, 15));
        assert_eq!(c.next_after(next).unwrap(), local(2026, 10, 19, 10, 30));
    }

    #[test]
    fn daily_at_three_rolls_to_tomorrow_once_passed() {
        let c = CronExpr::parse("0 3 * * *").unwrap();
        assert_eq!(c.next_after(local(2026, 10, 19, 2, 0)).unwrap(), local(2026, 10, 19, 3, 0));
        assert_eq!(c.next_after(local(2026, 10, 19, 3, 0)).unwrap(), local(2026, 10, 20, 3, 0));
    }

    #[test]
    fn numeric_weekdays_use_sunday_zero() {
        assert_eq!(map_day_of_week("0,7").unwrap(), "Sun");
        assert_eq!(map_day_of_week("1-5").unwrap(), "Mon,Tue,Wed,Thu,Fri");
        assert_eq!(map_day_of_week("*/2").unwrap(), "Sun,Tue,Thu,Sat");

        // 2026-10-17 is a Saturday.
        let c = CronExpr::parse("0 9 * * 1-5").unwrap();
        let next = c.next_after(local(2026, 10, 17, 12, 0)).unwrap().with_timezone(&Local);
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in ["* * * *", "* * * * * *", "61 * * * *", "* * * * 8", "* * * * 5-1", ""] {
            let err = CronExpr::parse(bad).unwrap_err();
            assert!(matches!(err, PmError::Invalid { field: "cronExpression", .. }), "{bad:?}");
        }
    }
}
