//! Schedule parsing and next-occurrence computation for scheduled triggers.
//!
//! Two shapes are supported: fixed intervals anchored at the trigger's creation
//! time, and standard 5-field cron expressions evaluated in UTC.

use chrono::{DateTime, Duration, Utc};
use croner::Cron;
use once_cell::sync::Lazy;
use regex::Regex;

static RE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("valid regex"));

static RE_EVERY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:every|each)\s+(\d+)\s*(s|secs?|seconds?|m|mins?|minutes?|h|hrs?|hours?|d|days?)$",
    )
    .expect("valid regex")
});

static RE_AT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(daily|weekdays?|weekends?)\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$")
        .expect("valid regex")
});

/// A parsed, repeating schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fires every `interval`, counted from the trigger's creation.
    Interval(Duration),
    /// Fires on a 5-field cron expression (UTC).
    Cron(String),
}

impl Schedule {
    /// First occurrence strictly after `after`. `anchor` is the trigger's creation time.
    pub fn next_after(
        &self,
        anchor: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> anyhow::Result<DateTime<Utc>> {
        match self {
            Schedule::Interval(interval) => {
                let step = interval.num_milliseconds();
                if step <= 0 {
                    anyhow::bail!("Interval must be positive");
                }
                let offset = if after < anchor {
                    Some(*interval)
                } else {
                    let k = (after - anchor).num_milliseconds() / step + 1;
                    k.checked_mul(step).and_then(Duration::try_milliseconds)
                };
                offset
                    .and_then(|offset| anchor.checked_add_signed(offset))
                    .ok_or_else(|| anyhow::anyhow!("Next occurrence is out of range"))
            }
            Schedule::Cron(expr) => {
                let cron: Cron = expr
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Failed to parse cron '{}': {}", expr, e))?;
                cron.find_next_occurrence(&after, false)
                    .map_err(|e| anyhow::anyhow!("No next occurrence for '{}': {}", expr, e))
            }
        }
    }

    /// Whether an occurrence falls in `(last_checked, now]`. Several missed
    /// occurrences still count as a single due firing.
    pub fn is_due(
        &self,
        anchor: DateTime<Utc>,
        last_checked: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        Ok(self.next_after(anchor, last_checked)? <= now)
    }
}

/// Parse a schedule string.
///
/// Accepts a bare number of minutes, `every N <unit>`, the keywords
/// `hourly`/`daily`/`weekly`/`monthly`, `daily|weekdays|weekends at <time>`,
/// or a raw 5-field cron expression. The schedule must have an occurrence
/// after `now`.
pub fn parse_schedule(input: &str, now: DateTime<Utc>) -> anyhow::Result<Schedule> {
    let input = input.trim();
    if input.is_empty() {
        anyhow::bail!("Schedule must not be empty");
    }

    if RE_DIGITS.is_match(input) {
        let minutes: i64 = input.parse()?;
        return interval(Duration::try_minutes(minutes), now);
    }

    match input.to_lowercase().as_str() {
        "hourly" => return cron("0 * * * *", now),
        "daily" => return cron("0 0 * * *", now),
        "weekly" => return cron("0 0 * * 0", now),
        "monthly" => return cron("0 0 1 * *", now),
        _ => {}
    }

    if let Some(caps) = RE_EVERY.captures(input) {
        let n: i64 = caps[1].parse()?;
        let unit = caps[2].to_lowercase();
        let duration = if unit.starts_with('s') {
            Duration::try_seconds(n)
        } else if unit.starts_with('m') {
            Duration::try_minutes(n)
        } else if unit.starts_with('h') {
            Duration::try_hours(n)
        } else {
            Duration::try_days(n)
        };
        return interval(duration, now);
    }

    if let Some(caps) = RE_AT.captures(input) {
        let (hour, minute) = parse_time_captures(&caps)?;
        let days = match caps[1].to_lowercase().as_str() {
            "daily" => "*",
            d if d.starts_with("weekday") => "1-5",
            _ => "0,6",
        };
        return cron(&format!("{} {} * * {}", minute, hour, days), now);
    }

    let parts: Vec<&str> = input.split_whitespace().collect();
    if parts.len() == 5 {
        return cron(&parts.join(" "), now);
    }

    anyhow::bail!(
        "Unrecognized schedule format '{}'. Use a number of minutes, 'every 5m', 'hourly', 'daily at 9am', or a 5-field cron expression.",
        input
    )
}

fn interval(duration: Option<Duration>, now: DateTime<Utc>) -> anyhow::Result<Schedule> {
    let duration = duration.ok_or_else(|| anyhow::anyhow!("Interval is too large"))?;
    if duration <= Duration::zero() {
        anyhow::bail!("Interval must be greater than zero");
    }
    if now.checked_add_signed(duration).is_none() {
        anyhow::bail!("Interval is too large");
    }
    Ok(Schedule::Interval(duration))
}

fn cron(expr: &str, now: DateTime<Utc>) -> anyhow::Result<Schedule> {
    let parsed: Cron = expr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))?;
    // A valid expression must still have somewhere to go.
    parsed
        .find_next_occurrence(&now, false)
        .map_err(|e| anyhow::anyhow!("Cron expression '{}' never fires: {}", expr, e))?;
    Ok(Schedule::Cron(expr.to_string()))
}

/// Extract hour and minute from regex captures with optional AM/PM.
fn parse_time_captures(caps: &regex::Captures) -> anyhow::Result<(u32, u32)> {
    let mut hour: u32 = caps[2].parse()?;
    let minute: u32 = caps.get(3).map_or(Ok(0), |m| m.as_str().parse())?;
    if let Some(ampm) = caps.get(4) {
        let ampm = ampm.as_str().to_lowercase();
        if ampm == "pm" && hour < 12 {
            hour += 12;
        } else if ampm == "am" && hour == 12 {
            hour = 0;
        }
    }
    if hour > 23 {
        anyhow::bail!("Hour must be between 0 and 23");
    }
    if minute > 59 {
        anyhow::bail!("Minute must be between 0 and 59");
    }
    Ok((hour, minute))
}
