//! Calendar arithmetic shared by the recurring scheduler, the budget monitor
//! and the report generator. Everything here is pure; month boundaries are
//! taken in the server's local time zone, instants are stored as UTC.

use chrono::{
    DateTime, Datelike, Days, Local, LocalResult, Months, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Timelike, Utc,
};

use crate::models::RecurringInterval;

/// Next scheduled instant after `from` for the given interval.
///
/// Monthly and yearly steps keep the day of month and clamp to the last day
/// when the target month is shorter (Jan 31 + 1 month = Feb 28/29).
pub(crate) fn next_occurrence(from: DateTime<Utc>, interval: RecurringInterval) -> DateTime<Utc> {
    match interval {
        RecurringInterval::Daily => from + Days::new(1),
        RecurringInterval::Weekly => from + Days::new(7),
        RecurringInterval::Fortnightly => from + Days::new(14),
        RecurringInterval::Monthly => from + Months::new(1),
        RecurringInterval::Yearly => from + Months::new(12),
    }
}

/// Half-open instant range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// The local calendar month containing `now`: first-of-month midnight up
    /// to (not including) the next month's first midnight, so the whole last
    /// day is covered.
    pub(crate) fn month_of(now: DateTime<Utc>) -> Self {
        let first = month_start(now.with_timezone(&Local).date_naive());
        Self::from_first_day(first)
    }

    /// The local calendar month before the one containing `now`.
    pub(crate) fn previous_month(now: DateTime<Utc>) -> Self {
        let first = month_start(now.with_timezone(&Local).date_naive());
        let prev = first - Months::new(1);
        Self::from_first_day(prev)
    }

    fn from_first_day(first: NaiveDate) -> Self {
        let next = first + Months::new(1);
        Self {
            start: local_midnight(first),
            end: local_midnight(next),
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// "October 2026"
    pub(crate) fn month_label(&self) -> String {
        self.start.with_timezone(&Local).format("%B %Y").to_string()
    }
}

pub(crate) fn month_start(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date)
}

/// Local midnight of `date` as a UTC instant. Falls back to the first valid
/// local time when midnight does not exist (DST gap).
pub(crate) fn local_midnight(date: NaiveDate) -> DateTime<Utc> {
    local_at(date.and_time(NaiveTime::MIN))
}

fn local_at(naive: NaiveDateTime) -> DateTime<Utc> {
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => match Local.from_local_datetime(&(naive + chrono::Duration::hours(1)))
        {
            LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
            LocalResult::None => Utc.from_utc_datetime(&naive),
        },
    }
}

/// True when `earlier` lies in a strictly earlier local calendar month than `now`.
pub(crate) fn is_earlier_month(earlier: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let a = earlier.with_timezone(&Local);
    let b = now.with_timezone(&Local);
    (a.year(), a.month()) < (b.year(), b.month())
}

/// Fixed trigger schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cadence {
    /// Every day at 00:00.
    Daily,
    /// 00:00, 06:00, 12:00 and 18:00.
    EverySixHours,
    /// 00:00 on the 1st of each month.
    Monthly,
}

impl Cadence {
    pub(crate) fn describe(&self) -> &'static str {
        match self {
            Self::Daily => "daily at 00:00",
            Self::EverySixHours => "every 6 hours",
            Self::Monthly => "monthly on the 1st",
        }
    }

    /// The next local wall-clock fire time strictly after `after`.
    pub(crate) fn next_fire_naive(&self, after: NaiveDateTime) -> NaiveDateTime {
        let date = after.date();
        match self {
            Self::Daily => (date + Days::new(1)).and_time(NaiveTime::MIN),
            Self::EverySixHours => {
                let slot = after.hour() / 6 + 1;
                if slot >= 4 {
                    (date + Days::new(1)).and_time(NaiveTime::MIN)
                } else {
                    date.and_time(NaiveTime::MIN) + chrono::Duration::hours(i64::from(slot * 6))
                }
            }
            Self::Monthly => (month_start(date) + Months::new(1)).and_time(NaiveTime::MIN),
        }
    }

    pub(crate) fn next_fire(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let local = after.with_timezone(&Local).naive_local();
        local_at(self.next_fire_naive(local))
    }
}

/// Source of "now" for processors; swapped for a fixed clock in tests.
pub(crate) trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub(crate) struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
