use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use dwsched_core::CivilZone;

use crate::{
    error::{Result, SchedulerError},
    types::{Job, JobSpec, Schedule},
};

/// Longest interval accepted for `interval` schedules (one year).
pub const MAX_INTERVAL_SECONDS: u64 = 365 * 24 * 3600;

/// Compute the next UTC execution time for `schedule`, strictly after
/// `reference`.
///
/// `last_due` is the instant the job was last due (its stored
/// `next_run_at`). Interval schedules keep their cadence aligned to it and
/// skip every slot that already passed, so a scheduler that was down for a
/// day owes one run, not a backlog. When `last_due` is absent or still in
/// the future the cadence restarts from `reference`.
///
/// Returns `None` when the schedule is exhausted (a one-shot daily job whose
/// instant is not in the future).
pub fn compute_next_run(
    schedule: &Schedule,
    zone: &CivilZone,
    last_due: Option<DateTime<Utc>>,
    reference: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Interval { interval_seconds } => {
            let step = i64::try_from(*interval_seconds).ok().filter(|s| *s > 0)?;
            let base = match last_due {
                Some(due) if due <= reference => due,
                _ => reference,
            };
            let behind = (reference - base).num_seconds();
            let slots = behind / step + 1;
            Some(base + Duration::seconds(slots * step))
        }

        Schedule::Daily {
            daily_time,
            daily_date,
            daily_repeat,
        } => {
            if let Some(date) = daily_date {
                let first = zone.resolve(*date, *daily_time);
                if first > reference {
                    return Some(first);
                }
            }
            if *daily_repeat {
                next_daily_occurrence(zone, *daily_time, reference)
            } else {
                None
            }
        }
    }
}

/// Next run for a stored job. Disabled jobs never have one.
pub fn next_run_for_job(job: &Job, zone: &CivilZone, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !job.enabled {
        return None;
    }
    compute_next_run(&job.schedule, zone, job.next_run_at, reference)
}

/// Today's occurrence of `time` if still ahead of `reference`, else
/// tomorrow's. Works on civil dates so DST shifts never move the wall time.
/// `None` only past the last representable date.
fn next_daily_occurrence(
    zone: &CivilZone,
    time: NaiveTime,
    reference: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let today = zone.to_civil(reference).date_naive();
    let candidate = zone.resolve(today, time);
    if candidate > reference {
        return Some(candidate);
    }
    // Today's window has passed; advance to tomorrow.
    let tomorrow = today.succ_opt()?;
    Some(zone.resolve(tomorrow, time))
}

/// Parse the `daily_at` input: `HH:MM`, or a civil date-time such as
/// `2026-02-23T22:00` / `2026-02-23 22:00`. Inputs carrying `Z` or an
/// explicit offset are converted into the civil zone first.
pub fn parse_daily_at(input: &str, zone: &CivilZone) -> Result<(NaiveTime, Option<NaiveDate>)> {
    let text = input.trim();
    if text.len() == 5 {
        if let Ok(time) = NaiveTime::parse_from_str(text, "%H:%M") {
            return Ok((time, None));
        }
    }

    let normalized = text.replacen(' ', "T", 1);
    let offset_form = normalized
        .strip_suffix('Z')
        .map(|head| format!("{head}+00:00"))
        .unwrap_or_else(|| normalized.clone());

    for fmt in ["%Y-%m-%dT%H:%M%:z", "%Y-%m-%dT%H:%M:%S%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(&offset_form, fmt) {
            let civil = zone.to_civil(dt.with_timezone(&Utc));
            return Ok(truncate_minutes(civil.naive_local()));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, fmt) {
            return Ok(truncate_minutes(naive));
        }
    }

    Err(SchedulerError::validation(format!(
        "daily_at must be HH:MM or YYYY-MM-DDTHH:MM (civil time), got '{input}'"
    )))
}

fn truncate_minutes(naive: NaiveDateTime) -> (NaiveTime, Option<NaiveDate>) {
    let time = naive
        .time()
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or_else(|| naive.time());
    (time, Some(naive.date()))
}

/// Convert an `interval_value` + `interval_unit` pair into seconds.
pub fn interval_from_unit(value: u64, unit: &str) -> Result<u64> {
    let factor = match unit.trim().to_ascii_lowercase().as_str() {
        "seconds" => 1,
        "minutes" => 60,
        "hours" => 3600,
        other => {
            return Err(SchedulerError::validation(format!(
                "interval_unit must be 'minutes' or 'hours', got '{other}'"
            )))
        }
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| SchedulerError::validation("interval is too large"))
}

/// Validate a job spec and fill in derived fields before it is stored.
///
/// A one-shot daily job given only a time of day is pinned to that time's
/// next occurrence. One-shot instants must lie in the future.
pub fn normalize_spec(spec: JobSpec, zone: &CivilZone, now: DateTime<Utc>) -> Result<JobSpec> {
    let name = spec.name.trim().to_string();
    if name.is_empty() {
        return Err(SchedulerError::validation("name must not be empty"));
    }
    if spec.options.rows_override == Some(0) {
        return Err(SchedulerError::validation("rows_override must be >= 1"));
    }

    let schedule = match spec.schedule {
        Schedule::Interval { interval_seconds } => {
            if interval_seconds == 0 {
                return Err(SchedulerError::validation("interval_seconds must be >= 1"));
            }
            if interval_seconds > MAX_INTERVAL_SECONDS {
                return Err(SchedulerError::validation(format!(
                    "interval_seconds must be <= {MAX_INTERVAL_SECONDS}"
                )));
            }
            Schedule::Interval { interval_seconds }
        }
        Schedule::Daily {
            daily_time,
            daily_date,
            daily_repeat,
        } => {
            let daily_date = match (daily_date, daily_repeat) {
                (None, false) => {
                    let next = next_daily_occurrence(zone, daily_time, now).ok_or_else(|| {
                        SchedulerError::validation("no future date left for this daily_at")
                    })?;
                    Some(zone.to_civil(next).date_naive())
                }
                (date, _) => date,
            };
            if let (Some(date), false) = (daily_date, daily_repeat) {
                if zone.resolve(date, daily_time) <= now {
                    return Err(SchedulerError::validation(
                        "a one-shot daily job needs a date and time in the future",
                    ));
                }
            }
            Schedule::Daily {
                daily_time,
                daily_date,
                daily_repeat,
            }
        }
    };

    Ok(JobSpec {
        name,
        schedule,
        ..spec
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dwsched_core::parse_instant;

    fn utc(s: &str) -> DateTime<Utc> {
        parse_instant(s).unwrap()
    }

    fn sao_paulo() -> CivilZone {
        CivilZone::from_name("America/Sao_Paulo").unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn daily_at_the_end_of_the_calendar_has_no_next_run() {
        let utc_zone = CivilZone::from_name("UTC").unwrap();
        let last = Utc.from_utc_datetime(&NaiveDate::MAX.and_hms_opt(23, 0, 0).unwrap());
        let sched = Schedule::Daily {
            daily_time: hm(7, 0),
            daily_date: None,
            daily_repeat: true,
        };
        assert_eq!(compute_next_run(&sched, &utc_zone, None, last), None);
    }

    #[test]
    fn interval_from_scratch_is_reference_plus_step() {
        let t0 = utc("2026-01-01T00:00:00Z");
        let sched = Schedule::Interval { interval_seconds: 1800 };
        assert_eq!(
            compute_next_run(&sched, &sao_paulo(), None, t0),
            Some(utc("2026-01-01T00:30:00Z"))
        );
    }

    #[test]
    fn interval_advances_from_due_instant() {
        let due = utc("2026-01-01T00:30:00Z");
        let sched = Schedule::Interval { interval_seconds: 1800 };
        assert_eq!(
            compute_next_run(&sched, &sao_paulo(), Some(due), due),
            Some(utc("2026-01-01T01:00:00Z"))
        );
    }

    #[test]
    fn interval_skips_missed_slots_without_backlog() {
        let due = utc("2026-01-01T00:30:00Z");
        let now = utc("2026-01-01T10:10:00Z");
        let sched = Schedule::Interval { interval_seconds: 1800 };
        let next = compute_next_run(&sched, &sao_paulo(), Some(due), now).unwrap();
        assert_eq!(next, utc("2026-01-01T10:30:00Z"));
        assert!(next > now);
    }

    #[test]
    fn interval_is_always_strictly_after_reference() {
        let sched = Schedule::Interval { interval_seconds: 7 };
        let base = utc("2026-01-01T00:00:00Z");
        for offset in 0..50 {
            let now = base + Duration::seconds(offset);
            let next = compute_next_run(&sched, &sao_paulo(), Some(base), now).unwrap();
            assert!(next > now, "offset {offset}: {next} <= {now}");
        }
    }

    #[test]
    fn daily_uses_today_when_not_yet_passed() {
        // 12:00 in São Paulo (-03:00).
        let now = utc("2026-02-23T15:00:00Z");
        let sched = Schedule::Daily {
            daily_time: hm(22, 0),
            daily_date: None,
            daily_repeat: true,
        };
        assert_eq!(
            compute_next_run(&sched, &sao_paulo(), None, now),
            Some(utc("2026-02-24T01:00:00Z"))
        );
    }

    #[test]
    fn daily_moves_to_tomorrow_when_passed() {
        let now = utc("2026-02-24T01:00:00Z"); // exactly 22:00 civil
        let sched = Schedule::Daily {
            daily_time: hm(22, 0),
            daily_date: None,
            daily_repeat: true,
        };
        assert_eq!(
            compute_next_run(&sched, &sao_paulo(), None, now),
            Some(utc("2026-02-25T01:00:00Z"))
        );
    }

    #[test]
    fn daily_keeps_wall_time_across_dst_change() {
        let zone = CivilZone::from_name("America/New_York").unwrap();
        // Saturday 2026-03-07 09:00 EST; DST starts Sunday 2026-03-08.
        let now = utc("2026-03-07T14:00:00Z");
        let sched = Schedule::Daily {
            daily_time: hm(8, 0),
            daily_date: None,
            daily_repeat: true,
        };
        let next = compute_next_run(&sched, &zone, None, now).unwrap();
        assert_eq!(next, utc("2026-03-08T12:00:00Z"));
        assert_eq!(zone.to_civil(next).format("%H:%M").to_string(), "08:00");
    }

    #[test]
    fn one_shot_fires_once_then_exhausts() {
        let sched = Schedule::Daily {
            daily_time: hm(22, 0),
            daily_date: NaiveDate::from_ymd_opt(2026, 2, 23),
            daily_repeat: false,
        };
        let zone = sao_paulo();
        let before = utc("2026-02-23T12:00:00Z");
        let at = utc("2026-02-24T01:00:00Z");
        assert_eq!(compute_next_run(&sched, &zone, None, before), Some(at));
        assert_eq!(compute_next_run(&sched, &zone, Some(at), at), None);
    }

    #[test]
    fn repeating_daily_with_start_date_waits_for_it() {
        let sched = Schedule::Daily {
            daily_time: hm(6, 30),
            daily_date: NaiveDate::from_ymd_opt(2026, 3, 1),
            daily_repeat: true,
        };
        let zone = sao_paulo();
        let now = utc("2026-02-20T12:00:00Z");
        assert_eq!(
            compute_next_run(&sched, &zone, None, now),
            Some(utc("2026-03-01T09:30:00Z"))
        );
        let later = utc("2026-03-05T12:00:00Z");
        assert_eq!(
            compute_next_run(&sched, &zone, None, later),
            Some(utc("2026-03-06T09:30:00Z"))
        );
    }

    #[test]
    fn parse_daily_at_accepts_time_and_datetimes() {
        let zone = sao_paulo();
        assert_eq!(parse_daily_at("07:15", &zone).unwrap(), (hm(7, 15), None));
        assert_eq!(
            parse_daily_at("2026-02-23T22:00", &zone).unwrap(),
            (hm(22, 0), NaiveDate::from_ymd_opt(2026, 2, 23))
        );
        assert_eq!(
            parse_daily_at("2026-02-23 22:00", &zone).unwrap(),
            (hm(22, 0), NaiveDate::from_ymd_opt(2026, 2, 23))
        );
        // 01:00Z on the 24th is 22:00 on the 23rd in São Paulo.
        assert_eq!(
            parse_daily_at("2026-02-24T01:00Z", &zone).unwrap(),
            (hm(22, 0), NaiveDate::from_ymd_opt(2026, 2, 23))
        );
        assert!(parse_daily_at("25:00", &zone).is_err());
        assert!(parse_daily_at("tomorrow", &zone).is_err());
    }

    #[test]
    fn interval_units() {
        assert_eq!(interval_from_unit(30, "minutes").unwrap(), 1800);
        assert_eq!(interval_from_unit(2, "Hours").unwrap(), 7200);
        assert!(interval_from_unit(2, "days").is_err());
    }

    fn spec(schedule: Schedule) -> JobSpec {
        JobSpec {
            name: "  nightly  ".into(),
            mode: dwsched_core::PipelineMode::Full,
            schedule,
            options: Default::default(),
            enabled: true,
        }
    }

    #[test]
    fn normalize_trims_name_and_rejects_bad_input() {
        let zone = sao_paulo();
        let now = utc("2026-02-23T12:00:00Z");
        let ok = normalize_spec(spec(Schedule::Interval { interval_seconds: 60 }), &zone, now).unwrap();
        assert_eq!(ok.name, "nightly");

        let mut blank = spec(Schedule::Interval { interval_seconds: 60 });
        blank.name = "   ".into();
        assert!(matches!(
            normalize_spec(blank, &zone, now),
            Err(SchedulerError::Validation(_))
        ));
        assert!(normalize_spec(spec(Schedule::Interval { interval_seconds: 0 }), &zone, now).is_err());
    }

    #[test]
    fn normalize_pins_one_shot_without_date() {
        let zone = sao_paulo();
        let now = utc("2026-02-24T02:00:00Z"); // 23:00 civil on the 23rd
        let out = normalize_spec(
            spec(Schedule::Daily {
                daily_time: hm(22, 0),
                daily_date: None,
                daily_repeat: false,
            }),
            &zone,
            now,
        )
        .unwrap();
        assert_eq!(
            out.schedule,
            Schedule::Daily {
                daily_time: hm(22, 0),
                daily_date: NaiveDate::from_ymd_opt(2026, 2, 24),
                daily_repeat: false,
            }
        );
    }

    #[test]
    fn normalize_rejects_one_shot_in_the_past() {
        let zone = sao_paulo();
        let now = utc("2026-02-24T02:00:00Z");
        let res = normalize_spec(
            spec(Schedule::Daily {
                daily_time: hm(22, 0),
                daily_date: NaiveDate::from_ymd_opt(2026, 2, 23),
                daily_repeat: false,
            }),
            &zone,
            now,
        );
        assert!(matches!(res, Err(SchedulerError::Validation(_))));
    }
}
