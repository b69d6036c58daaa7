//! Schedule parsing and next-run calculation.
//!
//! Everything here is pure: no clock reads, no I/O. Callers pass the
//! reference instant and the task's last run explicitly.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::error::{Result, SchedulerError};
use crate::types::TaskType;

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Guess the task type from the shape of `schedule`.
///
/// `@alias` or five or more whitespace-separated fields is cron, digits
/// followed by a unit is an interval, anything else is a one-shot.
pub fn infer_type(schedule: &str) -> TaskType {
    let s = schedule.trim();
    if s.starts_with('@') || s.split_whitespace().count() >= 5 {
        TaskType::Cron
    } else if split_interval(s).is_some() {
        TaskType::Interval
    } else {
        TaskType::Once
    }
}

/// Check `schedule` against the grammar of `task_type` without computing a run.
pub fn validate(task_type: TaskType, schedule: &str) -> Result<()> {
    match task_type {
        TaskType::Cron => CronExpr::parse(schedule).map(|_| ()),
        TaskType::Interval => parse_interval(schedule).map(|_| ()),
        TaskType::Once => parse_once(schedule).map(|_| ()),
        TaskType::Manual => Ok(()),
    }
}

/// Compute the next execution time.
///
/// Returns `Ok(None)` when the task has no further runs: a manual task, or a
/// once-task that has already fired.
pub fn compute_next_run(
    task_type: TaskType,
    schedule: &str,
    reference: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>> {
    let next = next_run_unchecked(task_type, schedule, reference, last_run)?;
    match next {
        Some(at) if at > latest_storable() => Err(SchedulerError::schedule(
            schedule.trim(),
            "next run falls after year 9999",
        )),
        other => Ok(other),
    }
}

/// Latest instant with a four-digit year. Timestamps are stored as
/// fixed-width text, and anything later would break their ordering.
fn latest_storable() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn next_run_unchecked(
    task_type: TaskType,
    schedule: &str,
    reference: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>> {
    match task_type {
        TaskType::Once => {
            let at = parse_once(schedule)?;
            if last_run.is_some() {
                return Ok(None);
            }
            Ok(Some(match at {
                Some(at) if at > reference => at,
                _ => reference,
            }))
        }

        TaskType::Interval => {
            let every = parse_interval(schedule)?;
            let base = last_run.unwrap_or(reference);
            base.checked_add_signed(every)
                .map(Some)
                .ok_or_else(|| SchedulerError::schedule(schedule, "next run is out of range"))
        }

        TaskType::Cron => Ok(CronExpr::parse(schedule)?.next_after(reference)),

        TaskType::Manual => Ok(None),
    }
}

/// Parse `<positive integer><unit>` with unit in `s`, `m`, `h`, `d`.
pub fn parse_interval(schedule: &str) -> Result<Duration> {
    let s = schedule.trim();
    let (digits, unit) = split_interval(s)
        .ok_or_else(|| SchedulerError::schedule(s, "expected <number><s|m|h|d>, e.g. 5m"))?;

    let n: u64 = digits
        .parse()
        .map_err(|_| SchedulerError::schedule(s, "interval count is too large"))?;
    if n == 0 {
        return Err(SchedulerError::schedule(s, "interval must be positive"));
    }

    let unit_ms = match unit {
        's' => SECOND_MS,
        'm' => MINUTE_MS,
        'h' => HOUR_MS,
        _ => DAY_MS,
    };
    n.checked_mul(unit_ms)
        .and_then(|ms| i64::try_from(ms).ok())
        .and_then(Duration::try_milliseconds)
        .ok_or_else(|| SchedulerError::schedule(s, "interval is too large"))
}

fn split_interval(s: &str) -> Option<(&str, char)> {
    let unit = s.chars().last()?;
    if !matches!(unit, 's' | 'm' | 'h' | 'd') {
        return None;
    }
    let digits = &s[..s.len() - 1];
    (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())).then_some((digits, unit))
}

/// `now` (or empty) fires immediately; an RFC 3339 instant delays the run.
fn parse_once(schedule: &str) -> Result<Option<DateTime<Utc>>> {
    let s = schedule.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("now") {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| Some(dt.with_timezone(&Utc)))
        .map_err(|e| SchedulerError::schedule(s, format!("expected 'now' or an RFC 3339 time: {e}")))
}

// ---------------------------------------------------------------------------
// Cron
// ---------------------------------------------------------------------------

/// A parsed 5-field cron expression, evaluated in UTC.
///
/// The `cron` crate wants a leading seconds field, numbers weekdays 1-7 from
/// Sunday, and ANDs day-of-month with day-of-week. Classic cron numbers
/// weekdays 0-7 (0 and 7 are Sunday) and ORs the two day fields when both are
/// restricted, so an expression with both restricted is split in two and the
/// earlier match wins.
#[derive(Debug, Clone)]
pub struct CronExpr {
    primary: cron::Schedule,
    alternate: Option<cron::Schedule>,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let expanded = if trimmed.starts_with('@') {
            expand_alias(trimmed)
                .ok_or_else(|| SchedulerError::schedule(trimmed, "unknown cron alias"))?
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::schedule(
                trimmed,
                format!("cron expression must have 5 fields, got {}", fields.len()),
            ));
        }
        let (minute, hour, dom, month, dow) = (fields[0], fields[1], fields[2], fields[3], fields[4]);

        let dow_days = parse_weekdays(dow).map_err(|reason| SchedulerError::schedule(trimmed, reason))?;
        let dom = if dom == "?" { "*" } else { dom };
        let dom_restricted = !dom.starts_with('*');
        let dow_restricted = !dow.starts_with('*') && dow != "?";

        let build = |dom: &str, dow: &str| -> Result<cron::Schedule> {
            let six = format!("0 {minute} {hour} {dom} {month} {dow}");
            cron::Schedule::from_str(&six)
                .map_err(|e| SchedulerError::schedule(trimmed, e.to_string()))
        };

        let (primary, alternate) = if dom_restricted && dow_restricted {
            (build(dom, "*")?, Some(build("*", &dow_days)?))
        } else {
            (build(dom, &dow_days)?, None)
        };

        let parsed = Self { primary, alternate };
        if parsed.next_after(DateTime::<Utc>::UNIX_EPOCH).is_none() {
            return Err(SchedulerError::schedule(trimmed, "expression never matches"));
        }
        Ok(parsed)
    }

    /// Soonest instant strictly after `reference` matching the expression.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let first = next_strictly_after(&self.primary, reference);
        let second = self
            .alternate
            .as_ref()
            .and_then(|s| next_strictly_after(s, reference));
        match (first, second) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

fn next_strictly_after(schedule: &cron::Schedule, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&reference).find(|t| *t > reference)
}

fn expand_alias(alias: &str) -> Option<&'static str> {
    match alias.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

/// Expand a classic day-of-week field into the `cron` crate's numbering
/// (Sunday = 1 … Saturday = 7). Returns `*` when every day matches.
fn parse_weekdays(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok("*".to_string());
    }

    let mut days = BTreeSet::new();
    for token in field.split(',') {
        let (range, step) = match token.split_once('/') {
            Some((r, s)) => {
                let step: u8 = s
                    .parse()
                    .map_err(|_| format!("day-of-week step '{s}' is not a number"))?;
                if step == 0 {
                    return Err("day-of-week step must be > 0".to_string());
                }
                (r, Some(step))
            }
            None => (token, None),
        };

        let (lo, hi) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (weekday_value(a)?, weekday_value(b)?)
        } else {
            let v = weekday_value(range)?;
            // `5/2` means "from Friday, every second day".
            (v, if step.is_some() { 6 } else { v })
        };
        if lo > hi {
            return Err(format!("day-of-week range '{range}' is reversed"));
        }

        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            days.insert(v % 7);
        }
    }

    if days.len() == 7 {
        return Ok("*".to_string());
    }
    Ok(days
        .iter()
        .map(|d| (d + 1).to_string())
        .collect::<Vec<_>>()
        .join(","))
}

fn weekday_value(token: &str) -> std::result::Result<u8, String> {
    const NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
    if let Ok(v) = token.parse::<u8>() {
        return if v <= 7 {
            Ok(v)
        } else {
            Err(format!("day-of-week {v} out of range 0-7"))
        };
    }
    let lower = token.to_ascii_lowercase();
    NAMES
        .iter()
        .position(|n| *n == lower)
        .map(|p| p as u8)
        .ok_or_else(|| format!("unknown day-of-week '{token}'"))
}
