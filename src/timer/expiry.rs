//! Next-expiry calculation.
//!
//! Everything here is pure: all time inputs arrive as explicit arguments,
//! nothing reads the wall clock or the store. The dispatcher worker and the
//! public API both funnel through [`next_expiry`].

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use super::Timer;
use crate::error::{Error, Result};

/// Compute the next wall-clock instant at which `timer` must fire, strictly
/// after `now`.
///
/// The catch-up policy:
/// - `skip_if_offline = true` (the default) skips occurrences missed during
///   downtime and lands on the next future one;
/// - `skip_if_offline = false` anchors on the last scheduled instant
///   (`expires_at`, falling back to `inserted_at`) and yields the strictly
///   next occurrence in schedule order, even when it is far in the past.
///
/// A caller-supplied absolute instant (`expires_at` set, no firing recorded
/// yet) round-trips verbatim. Cron expressions are evaluated in their own
/// zone, so a `0 17 * * *` in Europe/Berlin fires at 17:00 local on both
/// sides of a DST transition.
pub fn next_expiry(timer: &Timer, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Some(at) = timer.expires_at
        && timer.calls == 0
    {
        return Ok(at);
    }

    if !timer.skip_if_offline {
        let mut strict = timer.clone();
        strict.skip_if_offline = true;
        let last_scheduled = timer.expires_at.unwrap_or(timer.inserted_at);
        return next_expiry(&strict, last_scheduled);
    }

    if let Some(expression) = &timer.crontab {
        return next_cron_occurrence(expression, timer.crontab_timezone.as_deref(), now);
    }

    // First firing of a duration or interval timer is anchored to insertion,
    // regardless of how late `now` is.
    if timer.calls == 0
        && let Some(lead_in) = timer.duration.or(timer.interval)
    {
        return Ok(timer.inserted_at + Duration::milliseconds(lead_in));
    }

    if let Some(interval) = timer.interval {
        if interval <= 0 {
            return Err(Error::InvalidSpec(format!(
                "timer {} has a non-positive interval", timer.id
            )));
        }
        let anchor = timer.inserted_at + Duration::milliseconds(timer.duration.unwrap_or(interval));
        return Ok(next_interval_occurrence(anchor, interval, now));
    }

    Err(Error::InvalidSpec(format!(
        "timer {} has no computable next expiry", timer.id
    )))
}

/// Least `anchor + k * interval_ms` (k >= 0) strictly greater than `now`.
fn next_interval_occurrence(
    anchor: DateTime<Utc>,
    interval_ms: i64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if anchor > now {
        return anchor;
    }
    let elapsed_ms = (now - anchor).num_milliseconds();
    let steps = elapsed_ms / interval_ms + 1;
    anchor + Duration::milliseconds(steps * interval_ms)
}

fn next_cron_occurrence(
    expression: &str,
    timezone: Option<&str>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let schedule = parse_crontab(expression)?;
    let tz = parse_timezone(timezone.unwrap_or("UTC"))?;
    let local_now = now.with_timezone(&tz);
    let next = schedule.after(&local_now).next().ok_or_else(|| {
        Error::InvalidSpec(format!(
            "cron expression `{expression}` has no future occurrences"
        ))
    })?;
    Ok(next.with_timezone(&Utc))
}

/// The `cron` crate wants second-granularity expressions; standard 5-field
/// input gets a literal `0` seconds column prepended.
pub(crate) fn normalize_crontab(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

pub(crate) fn parse_crontab(expression: &str) -> Result<cron::Schedule> {
    let normalized = normalize_crontab(expression);
    cron::Schedule::from_str(&normalized)
        .map_err(|error| Error::InvalidCron(format!("{expression}: {error}")))
}

pub(crate) fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| Error::InvalidSpec(format!("unknown IANA timezone: {name}")))
}
