//! Pure due-ness decision for a subscription's recurrence rule.
//!
//! Nothing here reads the clock or touches storage; callers pass `now`.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};

use super::Recurrence;

const SECS_PER_HOUR: f64 = 3600.0;
const SECS_PER_DAY: f64 = 86_400.0;

/// How far forward [`next_due`] looks before giving up.
const PREVIEW_HORIZON_DAYS: u32 = 400;

/// Decide whether a rule fires at `now`.
///
/// `last_scheduled_run == None` counts as infinitely long ago. The
/// time-of-day and start-date gate applies to every recurrence.
pub fn should_fire(
    recurrence: Recurrence,
    time_of_day: NaiveTime,
    start_date: NaiveDate,
    last_scheduled_run: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> bool {
    if now.time() < time_of_day || now.date() < start_date {
        return false;
    }

    let elapsed_secs = match last_scheduled_run {
        Some(last) => (now - last).num_seconds() as f64,
        None => f64::INFINITY,
    };
    let hours_elapsed = elapsed_secs / SECS_PER_HOUR;
    let days_elapsed = elapsed_secs / SECS_PER_DAY;
    let today = now.date();

    match recurrence {
        Recurrence::Daily => hours_elapsed >= 24.0,
        Recurrence::Weekly => days_elapsed >= 7.0,
        Recurrence::Monthly => today.day() == start_date.day() || days_elapsed > 31.0,
        Recurrence::Yearly => {
            (today.month() == start_date.month() && today.day() == start_date.day())
                || days_elapsed >= 366.0
        }
    }
}

/// Earliest instant at or after `after` at which the rule would fire,
/// assuming no run happens in between. Used for dry-run previews.
pub fn next_due(
    recurrence: Recurrence,
    time_of_day: NaiveTime,
    start_date: NaiveDate,
    last_scheduled_run: Option<NaiveDateTime>,
    after: NaiveDateTime,
) -> Option<NaiveDateTime> {
    // Where the elapsed-time clause flips to true.
    let threshold = last_scheduled_run.map(|last| last + recurrence.min_interval());
    let fires = |at| should_fire(recurrence, time_of_day, start_date, last_scheduled_run, at);

    let mut day = after.date().max(start_date);
    for _ in 0..=PREVIEW_HORIZON_DAYS {
        let mut candidates = vec![day.and_time(time_of_day).max(after)];
        if let Some(t) = threshold.filter(|t| t.date() == day) {
            candidates.push(t.max(after));
        }
        candidates.sort();

        if let Some(hit) = candidates
            .into_iter()
            .filter(|c| c.date() == day)
            .find(|c| fires(*c))
        {
            return Some(hit);
        }
        day = day.succ_opt()?;
    }
    None
}

impl Recurrence {
    /// Elapsed time after which the fallback clause alone makes the rule fire.
    pub fn min_interval(self) -> Duration {
        match self {
            Recurrence::Daily => Duration::hours(24),
            Recurrence::Weekly => Duration::days(7),
            Recurrence::Monthly => Duration::days(31) + Duration::seconds(1),
            Recurrence::Yearly => Duration::days(366),
        }
    }
}
