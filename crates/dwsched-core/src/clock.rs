//! Wall-clock access and the fixed civil timezone used for daily schedules.
//!
//! All persisted instants are UTC strings at second precision
//! (`2026-02-23T22:00:00Z`), which keeps lexical and chronological order
//! identical for the `next_run_at <= ?` polling query.

use std::sync::{Mutex, PoisonError};

use chrono::{
    DateTime, Duration, NaiveDate, NaiveTime, SecondsFormat, SubsecRound, TimeZone, Utc,
};
use chrono_tz::Tz;

use crate::error::{DwschedError, Result};

/// Source of "now" for all schedule math.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock, truncated to whole seconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(0)
    }
}

/// A clock that only moves when told to. Used by tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start.trunc_subsecs(0)),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = instant.trunc_subsecs(0);
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The civil timezone in which daily schedules are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilZone {
    tz: Tz,
}

impl CivilZone {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Parse an IANA zone name such as `America/Sao_Paulo`.
    pub fn from_name(name: &str) -> Result<Self> {
        name.parse::<Tz>()
            .map(Self::new)
            .map_err(|_| DwschedError::InvalidTimezone(name.to_string()))
    }

    pub fn name(&self) -> &'static str {
        self.tz.name()
    }

    pub fn to_civil(&self, instant: DateTime<Utc>) -> DateTime<Tz> {
        instant.with_timezone(&self.tz)
    }

    /// RFC 3339 rendering with the civil offset, e.g. `2026-02-23T22:00:00-03:00`.
    pub fn render(&self, instant: DateTime<Utc>) -> String {
        self.to_civil(instant)
            .to_rfc3339_opts(SecondsFormat::Secs, false)
    }

    /// Map a civil date + time-of-day to an absolute instant.
    ///
    /// Ambiguous wall times (DST fall-back) resolve to the earliest instant.
    /// Wall times that do not exist (DST spring-forward gap) move forward to
    /// the first valid minute after the gap.
    pub fn resolve(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = date.and_time(time);
        if let Some(local) = self.tz.from_local_datetime(&naive).earliest() {
            return local.with_timezone(&Utc);
        }
        // Real-world gaps are at most a couple of hours.
        for step in 1..=240 {
            let shifted = naive + Duration::minutes(step);
            if let Some(local) = self.tz.from_local_datetime(&shifted).earliest() {
                return local.with_timezone(&Utc);
            }
        }
        Utc.from_utc_datetime(&naive)
    }
}

/// Format an instant the way it is stored and returned by the API.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored instant. Accepts any RFC 3339 offset.
pub fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
