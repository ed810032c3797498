use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

use crate::error::{Result, SchedulerError};

/// Compute the next fire time for `expr` strictly *after* `after`.
///
/// `after == 0` means "relative to now". Accepts standard 5-field cron
/// (minute hour day-of-month month day-of-week, Sunday as 0 or 7) and the
/// `@hourly`/`@daily`/... macros. When both day fields are restricted a day
/// matching either one fires.
pub fn next_fire_time(expr: &str, after: i64) -> Result<i64> {
    upcoming_fire_times(expr, after, 1)?
        .into_iter()
        .next()
        .ok_or_else(|| invalid(expr, "expression has no fire time after the reference"))
}

/// The next `count` fire times after `after` (same conventions as [`next_fire_time`]).
pub fn upcoming_fire_times(expr: &str, after: i64, count: usize) -> Result<Vec<i64>> {
    let schedules = parse(expr)?;
    let from = reference_time(expr, after)?;
    let mut fires: Vec<i64> = schedules
        .iter()
        .flat_map(|s| s.after(&from).take(count).map(|dt| dt.timestamp()))
        .collect();
    fires.sort_unstable();
    fires.dedup();
    fires.truncate(count);
    Ok(fires)
}

/// Fail with `InvalidExpression` unless `expr` parses.
pub fn validate_expression(expr: &str) -> Result<()> {
    parse(expr).map(|_| ())
}

fn reference_time(expr: &str, after: i64) -> Result<DateTime<Utc>> {
    if after == 0 {
        return Ok(Utc::now());
    }
    DateTime::from_timestamp(after, 0).ok_or_else(|| invalid(expr, "reference timestamp out of range"))
}

/// One schedule, or two whose union is the expression when both day fields
/// are restricted.
fn parse(expr: &str) -> Result<Vec<CronSchedule>> {
    normalize(expr)
        .map_err(|reason| invalid(expr, &reason))?
        .iter()
        .map(|n| CronSchedule::from_str(n).map_err(|e| invalid(expr, &e.to_string())))
        .collect()
}

/// Rewrite a 5-field expression into the seconds-first 6-field form the
/// `cron` crate parses.
///
/// The crate requires both day fields to match, standard cron either one, so
/// a restricted pair is split into a day-of-month half and a day-of-week half.
fn normalize(expr: &str) -> std::result::Result<Vec<String>, String> {
    let trimmed = expr.trim();
    if trimmed.starts_with('@') {
        return Ok(vec![trimmed.to_string()]);
    }
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, found {}", fields.len()));
    }
    let (minute, hour, dom, month) = (fields[0], fields[1], fields[2], fields[3]);
    let dow = translate_day_of_week(fields[4])?;
    if is_wildcard(dom) || is_wildcard(&dow) {
        return Ok(vec![format!("0 {minute} {hour} {dom} {month} {dow}")]);
    }
    Ok(vec![
        format!("0 {minute} {hour} {dom} {month} *"),
        format!("0 {minute} {hour} * {month} {dow}"),
    ])
}

fn is_wildcard(field: &str) -> bool {
    field == "*" || field == "?"
}

/// Map numeric day-of-week values from cron's 0-7 (0 and 7 = Sunday) onto the
/// `cron` crate's 1-7 (1 = Sunday). Named days pass through untouched.
fn translate_day_of_week(field: &str) -> std::result::Result<String, String> {
    if is_wildcard(field) {
        return Ok(field.to_string());
    }

    let mut out: Vec<String> = Vec::new();
    for part in field.split(',') {
        if part.chars().any(|c| c.is_ascii_alphabetic()) {
            out.push(part.to_string());
            continue;
        }

        let (base, step) = match part.split_once('/') {
            Some((b, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{s}'"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (b, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if base == "*" {
            (0, 6)
        } else if let Some((a, b)) = base.split_once('-') {
            (parse_dow(a)?, parse_dow(b)?)
        } else {
            let v = parse_dow(base)?;
            // "n/s" runs from n to the end of the week
            if part.contains('/') {
                (v, 6)
            } else {
                (v, v)
            }
        };
        if lo > hi {
            return Err(format!("invalid day-of-week range '{base}'"));
        }

        let mut v = lo;
        while v <= hi {
            let mapped = ((v % 7) + 1).to_string();
            if !out.contains(&mapped) {
                out.push(mapped);
            }
            v += step;
        }
    }
    Ok(out.join(","))
}

fn parse_dow(s: &str) -> std::result::Result<u32, String> {
    match s.parse::<u32>() {
        Ok(v) if v <= 7 => Ok(v),
        _ => Err(format!("invalid day-of-week value '{s}'")),
    }
}

fn invalid(expr: &str, reason: &str) -> SchedulerError {
    SchedulerError::InvalidExpression {
        expr: expr.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2023-11-14T22:13:20Z, a Tuesday
    const T: i64 = 1_700_000_000;
    const MIDNIGHT_NOV_15: i64 = 1_700_006_400;

    #[test]
    fn every_five_minutes() {
        assert_eq!(next_fire_time("*/5 * * * *", T).unwrap(), 1_700_000_100);
    }

    #[test]
    fn daily_is_strictly_after_reference() {
        assert_eq!(next_fire_time("0 0 * * *", T).unwrap(), MIDNIGHT_NOV_15);
        assert_eq!(
            next_fire_time("0 0 * * *", MIDNIGHT_NOV_15).unwrap(),
            MIDNIGHT_NOV_15 + 86_400
        );
    }

    #[test]
    fn monday_uses_standard_numbering() {
        // Monday 2023-11-20 09:00 UTC
        assert_eq!(next_fire_time("0 9 * * 1", T).unwrap(), 1_700_470_800);
    }

    #[test]
    fn sunday_as_zero_or_seven() {
        let sunday = 1_700_352_000; // 2023-11-19 00:00 UTC
        assert_eq!(next_fire_time("0 0 * * 0", T).unwrap(), sunday);
        assert_eq!(next_fire_time("0 0 * * 7", T).unwrap(), sunday);
        assert_eq!(next_fire_time("0 0 * * SUN", T).unwrap(), sunday);
    }

    #[test]
    fn restricted_day_fields_match_either_one() {
        // the 1st of the month or any Monday: Mon 2023-11-20 comes first
        assert_eq!(next_fire_time("0 0 1 * 1", T).unwrap(), 1_700_438_400);
        assert_eq!(
            upcoming_fire_times("0 0 1 * 1", T, 4).unwrap(),
            vec![1_700_438_400, 1_701_043_200, 1_701_388_800, 1_701_648_000]
        );
        // an unrestricted day-of-month leaves day-of-week in charge
        assert_eq!(next_fire_time("0 9 * * 1", T).unwrap(), 1_700_470_800);
    }

    #[test]
    fn shared_fire_times_are_listed_once() {
        // Fri 2023-12-01 is both the 1st and a Friday
        let fires = upcoming_fire_times("0 0 1 * 5", 1_701_043_200, 2).unwrap();
        assert_eq!(fires, vec![1_701_388_800, 1_701_993_600]);
    }

    #[test]
    fn macros_pass_through() {
        assert_eq!(next_fire_time("@daily", T).unwrap(), MIDNIGHT_NOV_15);
    }

    #[test]
    fn zero_reference_means_now() {
        let now = Utc::now().timestamp();
        let next = next_fire_time("* * * * *", 0).unwrap();
        assert!(next > now - 1 && next <= now + 60);
    }

    #[test]
    fn upcoming_lists_consecutive_fires() {
        let fires = upcoming_fire_times("0 * * * *", T, 3).unwrap();
        assert_eq!(fires, vec![1_700_002_800, 1_700_006_400, 1_700_010_000]);
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["not a cron", "* * * *", "61 * * * *", "* * * * 9", "* * * * 5-2", ""] {
            let err = next_fire_time(expr, T).unwrap_err();
            assert!(
                matches!(err, SchedulerError::InvalidExpression { .. }),
                "{expr:?} gave {err:?}"
            );
        }
        assert!(validate_expression("*/10 * * * *").is_ok());
    }

    #[test]
    fn day_of_week_translation() {
        assert_eq!(translate_day_of_week("1-5").unwrap(), "2,3,4,5,6");
        assert_eq!(translate_day_of_week("0,7").unwrap(), "1");
        assert_eq!(translate_day_of_week("*/2").unwrap(), "1,3,5,7");
        assert_eq!(translate_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert_eq!(translate_day_of_week("*").unwrap(), "*");
    }
}
