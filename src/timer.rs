//! Timer row model and creation specs.

pub mod expiry;

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The action a timer fires: a registered handler name plus an opaque
/// argument payload. The scheduler never interprets any of the three fields;
/// the handler registry resolves `(module, function)` at dispatch time and
/// each handler defines its own payload codec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Callable {
    pub module: String,
    pub function: String,
    pub arguments: Vec<u8>,
}

impl Callable {
    pub fn new(
        module: impl Into<String>,
        function: impl Into<String>,
        arguments: Vec<u8>,
    ) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            arguments,
        }
    }
}

/// A persisted timer. One row per outstanding timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    pub id: Uuid,
    pub module: String,
    pub function: String,
    pub arguments: Vec<u8>,
    /// Next scheduled firing instant. Always set on a live row; `None` only
    /// occurs on in-memory values that have not been through the expiry
    /// calculator yet.
    pub expires_at: Option<DateTime<Utc>>,
    /// Milliseconds from `inserted_at` to the first firing.
    pub duration: Option<i64>,
    /// Milliseconds between recurring firings.
    pub interval: Option<i64>,
    /// Normalized cron expression.
    pub crontab: Option<String>,
    /// IANA zone the cron expression is evaluated in.
    pub crontab_timezone: Option<String>,
    /// Completed firings.
    pub calls: i64,
    /// Firing cap; the row is deleted after the firing that reaches it.
    pub max_calls: Option<i64>,
    /// Catch-up policy after downtime: `true` skips to the next future
    /// occurrence, `false` fires the strictly next occurrence in schedule
    /// order even if it is long past.
    pub skip_if_offline: bool,
    /// Optional unique handle for idempotent creation and cancel-by-name.
    pub name: Option<String>,
    /// In-flight lease flag, set while a worker has claimed the row.
    pub executing: bool,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Timer {
    /// Whether the timer produces more firings after the current one.
    pub fn is_recurring(&self) -> bool {
        self.interval.is_some() || self.crontab.is_some()
    }
}

/// Optional attributes accepted by every create call.
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub name: Option<String>,
    /// Defaults to `true` when unset.
    pub skip_if_offline: Option<bool>,
    pub max_calls: Option<i64>,
    pub inserted_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The schedule half of a timer spec.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fire once, `duration_ms` after insertion.
    After { duration_ms: i64 },
    /// Fire once at an absolute instant.
    At { instant: DateTime<Utc> },
    /// Fire every `interval_ms`; an omitted lead-in defaults to one full
    /// interval before the first firing.
    Every {
        lead_in_ms: Option<i64>,
        interval_ms: i64,
    },
    /// Fire on a cron expression evaluated in an IANA timezone.
    Cron { expression: String, timezone: String },
}

/// One element of a `create_many` batch; the single-create calls go through
/// the same type internally.
#[derive(Debug, Clone)]
pub struct TimerSpec {
    pub callable: Callable,
    pub schedule: Schedule,
    pub opts: CreateOpts,
}

impl TimerSpec {
    pub fn new(callable: Callable, schedule: Schedule) -> Self {
        Self {
            callable,
            schedule,
            opts: CreateOpts::default(),
        }
    }

    pub fn with_opts(mut self, opts: CreateOpts) -> Self {
        self.opts = opts;
        self
    }

    /// Validate the spec and materialize a row ready for insertion.
    /// `now` stamps `inserted_at`/`updated_at` unless the opts override them;
    /// `expires_at` comes out of the expiry calculator.
    pub(crate) fn into_timer(self, now: DateTime<Utc>) -> Result<Timer> {
        if self.callable.module.is_empty() || self.callable.function.is_empty() {
            return Err(Error::InvalidSpec(
                "callable module and function must be non-empty".to_string(),
            ));
        }

        let (duration, interval, crontab, crontab_timezone, expires_at) = match self.schedule {
            Schedule::After { duration_ms } => {
                if duration_ms < 0 {
                    return Err(Error::InvalidSpec(format!(
                        "duration must be non-negative, got {duration_ms}"
                    )));
                }
                (Some(duration_ms), None, None, None, None)
            }
            Schedule::At { instant } => (None, None, None, None, Some(instant)),
            Schedule::Every {
                lead_in_ms,
                interval_ms,
            } => {
                if interval_ms <= 0 {
                    return Err(Error::InvalidSpec(format!(
                        "interval must be positive, got {interval_ms}"
                    )));
                }
                let lead_in = lead_in_ms.unwrap_or(interval_ms);
                if lead_in < 0 {
                    return Err(Error::InvalidSpec(format!(
                        "interval lead-in must be non-negative, got {lead_in}"
                    )));
                }
                (Some(lead_in), Some(interval_ms), None, None, None)
            }
            Schedule::Cron {
                expression,
                timezone,
            } => {
                // Validated here so a row that made it into the store always
                // re-parses at fire time.
                expiry::parse_crontab(&expression)?;
                expiry::parse_timezone(&timezone)?;
                let normalized = expiry::normalize_crontab(&expression);
                (None, None, Some(normalized), Some(timezone), None)
            }
        };

        let inserted_at = self.opts.inserted_at.unwrap_or(now);
        let mut timer = Timer {
            id: Uuid::new_v4(),
            module: self.callable.module,
            function: self.callable.function,
            arguments: self.callable.arguments,
            expires_at,
            duration,
            interval,
            crontab,
            crontab_timezone,
            calls: 0,
            max_calls: self.opts.max_calls,
            skip_if_offline: self.opts.skip_if_offline.unwrap_or(true),
            name: self.opts.name,
            executing: false,
            inserted_at,
            updated_at: self.opts.updated_at.unwrap_or(now),
        };

        timer.expires_at = Some(expiry::next_expiry(&timer, now)?);
        Ok(timer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn callable() -> Callable {
        Callable::new("reports", "send_digest", b"{}".to_vec())
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn after_spec_anchors_expiry_to_insertion() {
        let now = utc(2020, 1, 1, 13, 0, 0);
        let timer = TimerSpec::new(callable(), Schedule::After { duration_ms: 60_000 })
            .into_timer(now)
            .expect("spec should materialize");

        assert_eq!(timer.expires_at, Some(utc(2020, 1, 1, 13, 1, 0)));
        assert_eq!(timer.duration, Some(60_000));
        assert_eq!(timer.calls, 0);
        assert!(!timer.executing);
        assert!(timer.skip_if_offline);
    }

    #[test]
    fn at_spec_round_trips_the_instant_verbatim() {
        let now = utc(2020, 1, 1, 0, 0, 0);
        let alarm = utc(2021, 6, 1, 9, 30, 0);
        let timer = TimerSpec::new(callable(), Schedule::At { instant: alarm })
            .into_timer(now)
            .expect("spec should materialize");

        assert_eq!(timer.expires_at, Some(alarm));
        assert!(timer.duration.is_none());
        assert!(!timer.is_recurring());
    }

    #[test]
    fn every_spec_defaults_lead_in_to_one_interval() {
        let now = utc(2020, 1, 1, 12, 0, 0);
        let timer = TimerSpec::new(
            callable(),
            Schedule::Every {
                lead_in_ms: None,
                interval_ms: 10_000,
            },
        )
        .into_timer(now)
        .expect("spec should materialize");

        assert_eq!(timer.duration, Some(10_000));
        assert_eq!(timer.expires_at, Some(utc(2020, 1, 1, 12, 0, 10)));
    }

    #[test]
    fn cron_spec_persists_the_normalized_expression() {
        let now = utc(2020, 1, 1, 0, 0, 0);
        let timer = TimerSpec::new(
            callable(),
            Schedule::Cron {
                expression: "0 17 * * *".to_string(),
                timezone: "Europe/Berlin".to_string(),
            },
        )
        .into_timer(now)
        .expect("spec should materialize");

        assert_eq!(timer.crontab.as_deref(), Some("0 0 17 * * *"));
        assert_eq!(timer.crontab_timezone.as_deref(), Some("Europe/Berlin"));
        assert!(timer.is_recurring());
    }

    #[test]
    fn rejects_empty_callable() {
        let error = TimerSpec::new(
            Callable::new("", "send_digest", Vec::new()),
            Schedule::After { duration_ms: 0 },
        )
        .into_timer(utc(2020, 1, 1, 0, 0, 0))
        .expect_err("empty module must be rejected");

        assert!(matches!(error, Error::InvalidSpec(_)));
    }

    #[test]
    fn rejects_non_positive_interval() {
        let error = TimerSpec::new(
            callable(),
            Schedule::Every {
                lead_in_ms: None,
                interval_ms: 0,
            },
        )
        .into_timer(utc(2020, 1, 1, 0, 0, 0))
        .expect_err("zero interval must be rejected");

        assert!(matches!(error, Error::InvalidSpec(_)));
    }

    #[test]
    fn rejects_bad_cron_expression() {
        let error = TimerSpec::new(
            callable(),
            Schedule::Cron {
                expression: "not a cron".to_string(),
                timezone: "UTC".to_string(),
            },
        )
        .into_timer(utc(2020, 1, 1, 0, 0, 0))
        .expect_err("garbage expression must be rejected");

        assert!(matches!(error, Error::InvalidCron(_)));
    }

    #[test]
    fn rejects_unknown_timezone() {
        let error = TimerSpec::new(
            callable(),
            Schedule::Cron {
                expression: "0 17 * * *".to_string(),
                timezone: "Mars/Olympus_Mons".to_string(),
            },
        )
        .into_timer(utc(2020, 1, 1, 0, 0, 0))
        .expect_err("unknown timezone must be rejected");

        assert!(matches!(error, Error::InvalidSpec(_)));
    }
}
