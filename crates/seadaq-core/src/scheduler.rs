//! Named-job scheduler driving instrument housekeeping.
//!
//! Jobs are registered under a unique name with a [`Trigger`] and a
//! callback. Callbacks must be quick and non-blocking; the intended use
//! is pushing an event onto a channel for a state machine to pick up.
//! Construction is cheap, timer tasks spawn per job, so a scheduler can
//! sit unused inside a driver that never schedules anything.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::debug;

use crate::error::{DriverResult, InstrumentError};

/// Invoked when a job fires. Keep it quick; timer tasks run callbacks
/// inline.
pub type JobCallback = Arc<dyn Fn() + Send + Sync + 'static>;

//============================================================
// Triggers
//============================================================

/// When a scheduled job fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire once at an absolute instant, then drop the job. A time in
    /// the past fires immediately.
    Absolute { at: DateTime<Utc> },
    /// Fire whenever the wall clock matches the cron fields.
    Cron(CronSpec),
    /// Fire every fixed period, first fire one full period after
    /// scheduling.
    Interval {
        #[serde(default)]
        weeks: u64,
        #[serde(default)]
        days: u64,
        #[serde(default)]
        hours: u64,
        #[serde(default)]
        minutes: u64,
        #[serde(default)]
        seconds: u64,
    },
    /// Fire on demand through [`Scheduler::poll_job`], rate-limited to
    /// at most one fire per `min_interval`. With `max_interval` set the
    /// job also fires unconditionally once that much time passes
    /// without a fire.
    PolledInterval {
        #[serde(with = "humantime_serde")]
        min_interval: Duration,
        #[serde(default, with = "humantime_serde")]
        max_interval: Option<Duration>,
    },
}

impl Trigger {
    /// Reject specs that could never fire sensibly.
    pub fn validate(&self) -> DriverResult<()> {
        match self {
            Trigger::Absolute { .. } => Ok(()),
            Trigger::Cron(spec) => spec.validate(),
            Trigger::Interval { .. } => {
                if self.interval_period() == Some(Duration::ZERO) {
                    return Err(InstrumentError::Configuration(
                        "interval trigger must cover a non-zero period".into(),
                    ));
                }
                Ok(())
            }
            Trigger::PolledInterval {
                min_interval,
                max_interval,
            } => {
                if min_interval.is_zero() {
                    return Err(InstrumentError::Configuration(
                        "polled interval needs a non-zero min_interval".into(),
                    ));
                }
                if let Some(max) = max_interval {
                    if max < min_interval {
                        return Err(InstrumentError::Configuration(
                            "polled interval max_interval is below min_interval".into(),
                        ));
                    }
                }
                Ok(())
            }
        }
    }

    fn interval_period(&self) -> Option<Duration> {
        match self {
            Trigger::Interval {
                weeks,
                days,
                hours,
                minutes,
                seconds,
            } => {
                let secs = weeks * 604_800 + days * 86_400 + hours * 3_600 + minutes * 60 + seconds;
                Some(Duration::from_secs(secs))
            }
            _ => None,
        }
    }
}

/// Calendar trigger over single-valued fields, most significant first:
/// year, month, day, ISO week, day of week (0 = Monday), hour, minute,
/// second.
///
/// Unspecified fields more significant than the least significant
/// specified one act as wildcards. Unspecified fields below it default
/// to their minimum, except `week` and `day_of_week`, which stay
/// wildcards. `CronSpec { minute: Some(30), ..Default::default() }`
/// therefore fires at second 0 of minute 30 of every hour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CronSpec {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub week: Option<u32>,
    pub day_of_week: Option<u32>,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub second: Option<u32>,
}

impl CronSpec {
    fn validate(&self) -> DriverResult<()> {
        let any = self.year.is_some()
            || self.month.is_some()
            || self.day.is_some()
            || self.week.is_some()
            || self.day_of_week.is_some()
            || self.hour.is_some()
            || self.minute.is_some()
            || self.second.is_some();
        if !any {
            return Err(InstrumentError::Configuration(
                "cron trigger needs at least one field".into(),
            ));
        }
        let in_range = |value: Option<u32>, lo: u32, hi: u32, what: &str| -> DriverResult<()> {
            if let Some(v) = value {
                if v < lo || v > hi {
                    return Err(InstrumentError::Configuration(format!(
                        "cron {what} {v} outside {lo}..={hi}"
                    )));
                }
            }
            Ok(())
        };
        in_range(self.month, 1, 12, "month")?;
        in_range(self.day, 1, 31, "day")?;
        in_range(self.week, 1, 53, "week")?;
        in_range(self.day_of_week, 0, 6, "day_of_week")?;
        in_range(self.hour, 0, 23, "hour")?;
        in_range(self.minute, 0, 59, "minute")?;
        in_range(self.second, 0, 59, "second")?;
        Ok(())
    }

    fn effective(&self) -> EffectiveCron {
        let specified = [
            self.year.is_some(),
            self.month.is_some(),
            self.day.is_some(),
            self.week.is_some(),
            self.day_of_week.is_some(),
            self.hour.is_some(),
            self.minute.is_some(),
            self.second.is_some(),
        ];
        // validate() guarantees at least one field is set.
        let least = specified.iter().rposition(|s| *s).unwrap_or(7);
        let fill = |index: usize, value: Option<u32>, minimum: u32| {
            if index > least {
                value.or(Some(minimum))
            } else {
                value
            }
        };
        EffectiveCron {
            year: self.year,
            month: fill(1, self.month, 1),
            day: fill(2, self.day, 1),
            // Week-shaped fields never default to a fixed value.
            week: self.week,
            day_of_week: self.day_of_week,
            hour: fill(5, self.hour, 0),
            minute: fill(6, self.minute, 0),
            second: fill(7, self.second, 0),
        }
    }

    /// Earliest matching instant strictly after `after`, or `None` when
    /// the fields cannot match again within the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let eff = self.effective();
        let after_naive = after.naive_utc();
        let mut date = after_naive.date();
        let horizon = match eff.year {
            Some(y) => {
                let jan1 = NaiveDate::from_ymd_opt(y, 1, 1)?;
                if date < jan1 {
                    date = jan1;
                }
                NaiveDate::from_ymd_opt(y, 12, 31)?
            }
            None => date.checked_add_days(Days::new(8 * 366))?,
        };
        while date <= horizon {
            if eff.matches_date(date) {
                let floor = (date == after_naive.date()).then(|| after_naive.time());
                if let Some(time) = eff.first_time(floor) {
                    return Some(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)));
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

struct EffectiveCron {
    year: Option<i32>,
    month: Option<u32>,
    day: Option<u32>,
    week: Option<u32>,
    day_of_week: Option<u32>,
    hour: Option<u32>,
    minute: Option<u32>,
    second: Option<u32>,
}

impl EffectiveCron {
    fn matches_date(&self, date: NaiveDate) -> bool {
        self.year.map_or(true, |y| date.year() == y)
            && self.month.map_or(true, |m| date.month() == m)
            && self.day.map_or(true, |d| date.day() == d)
            && self.week.map_or(true, |w| date.iso_week().week() == w)
            && self
                .day_of_week
                .map_or(true, |dw| date.weekday().num_days_from_monday() == dw)
    }

    /// Earliest time of day matching the hour/minute/second fields,
    /// strictly after `floor` when one is given.
    fn first_time(&self, floor: Option<NaiveTime>) -> Option<NaiveTime> {
        use std::cmp::Ordering;

        let hours: Vec<u32> = match self.hour {
            Some(h) => vec![h],
            None => (0..24).collect(),
        };
        for h in hours {
            let Some(at) = floor else {
                return NaiveTime::from_hms_opt(h, self.minute.unwrap_or(0), self.second.unwrap_or(0));
            };
            match h.cmp(&at.hour()) {
                Ordering::Less => continue,
                Ordering::Greater => {
                    return NaiveTime::from_hms_opt(
                        h,
                        self.minute.unwrap_or(0),
                        self.second.unwrap_or(0),
                    );
                }
                Ordering::Equal => {
                    let minutes: Vec<u32> = match self.minute {
                        Some(m) => vec![m],
                        None => (0..60).collect(),
                    };
                    for m in minutes {
                        match m.cmp(&at.minute()) {
                            Ordering::Less => continue,
                            Ordering::Greater => {
                                return NaiveTime::from_hms_opt(h, m, self.second.unwrap_or(0));
                            }
                            Ordering::Equal => {
                                let seconds: Vec<u32> = match self.second {
                                    Some(s) => vec![s],
                                    None => (0..60).collect(),
                                };
                                for s in seconds {
                                    if s > at.second() {
                                        return NaiveTime::from_hms_opt(h, m, s);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        None
    }
}

//============================================================
// Scheduler
//============================================================

struct PolledState {
    min: Duration,
    last_fire: Mutex<Instant>,
    callback: JobCallback,
}

struct Job {
    task: Option<JoinHandle<()>>,
    polled: Option<Arc<PolledState>>,
}

#[derive(Default)]
struct SchedulerInner {
    jobs: HashMap<String, Job>,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        for job in self.jobs.values_mut() {
            if let Some(task) = job.task.take() {
                task.abort();
            }
        }
    }
}

/// Shared handle to a set of named timer jobs. Clones refer to the same
/// job set; all timer tasks stop when the last clone drops.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Mutex<SchedulerInner>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `name`. Fails on an invalid trigger or
    /// a duplicate name. Must be called from within a tokio runtime.
    pub fn add_job(
        &self,
        name: impl Into<String>,
        trigger: Trigger,
        callback: JobCallback,
    ) -> DriverResult<()> {
        let name = name.into();
        trigger.validate()?;

        let polled = match &trigger {
            Trigger::PolledInterval { min_interval, .. } => Some(Arc::new(PolledState {
                min: *min_interval,
                last_fire: Mutex::new(Instant::now()),
                callback: Arc::clone(&callback),
            })),
            _ => None,
        };

        {
            let mut inner = self.inner.lock();
            if inner.jobs.contains_key(&name) {
                return Err(InstrumentError::Configuration(format!(
                    "job '{name}' is already scheduled"
                )));
            }
            inner.jobs.insert(
                name.clone(),
                Job {
                    task: None,
                    polled: polled.clone(),
                },
            );
        }

        let task = self.spawn_timer(&name, &trigger, callback, polled);
        debug!(job = %name, ?trigger, "scheduled job added");

        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&name) {
            Some(job) => job.task = task,
            // Removed (or self-removed) before we got back here.
            None => {
                if let Some(task) = task {
                    task.abort();
                }
            }
        }
        Ok(())
    }

    fn spawn_timer(
        &self,
        name: &str,
        trigger: &Trigger,
        callback: JobCallback,
        polled: Option<Arc<PolledState>>,
    ) -> Option<JoinHandle<()>> {
        match trigger {
            Trigger::Absolute { at } => {
                let weak = Arc::downgrade(&self.inner);
                let name = name.to_owned();
                let at = *at;
                Some(tokio::spawn(async move {
                    sleep(until(at)).await;
                    callback();
                    remove_entry(&weak, &name);
                }))
            }
            Trigger::Interval { .. } => {
                // validate() ran, so a period exists and is non-zero.
                let period = trigger.interval_period().unwrap_or(Duration::from_secs(1));
                Some(tokio::spawn(async move {
                    loop {
                        sleep(period).await;
                        callback();
                    }
                }))
            }
            Trigger::Cron(spec) => {
                let spec = spec.clone();
                let weak = Arc::downgrade(&self.inner);
                let name = name.to_owned();
                Some(tokio::spawn(async move {
                    loop {
                        let Some(next) = spec.next_after(Utc::now()) else {
                            remove_entry(&weak, &name);
                            break;
                        };
                        sleep(until(next)).await;
                        callback();
                    }
                }))
            }
            Trigger::PolledInterval { max_interval, .. } => {
                let max = (*max_interval)?;
                let state = polled?;
                Some(tokio::spawn(async move {
                    loop {
                        let deadline = *state.last_fire.lock() + max;
                        sleep_until(deadline).await;
                        let fire = {
                            let mut last = state.last_fire.lock();
                            let now = Instant::now();
                            if now >= *last + max {
                                *last = now;
                                true
                            } else {
                                false
                            }
                        };
                        if fire {
                            (state.callback)();
                        }
                    }
                }))
            }
        }
    }

    /// Request an immediate fire of a polled-interval job. Returns
    /// whether it fired; `Ok(false)` means the minimum interval since
    /// the last fire has not yet elapsed.
    pub fn poll_job(&self, name: &str) -> DriverResult<bool> {
        let state = {
            let inner = self.inner.lock();
            let job = inner.jobs.get(name).ok_or_else(|| {
                InstrumentError::Configuration(format!("no scheduled job named '{name}'"))
            })?;
            job.polled
                .as_ref()
                .map(Arc::clone)
                .ok_or_else(|| {
                    InstrumentError::Configuration(format!("job '{name}' is not polled"))
                })?
        };

        let fire = {
            let mut last = state.last_fire.lock();
            let now = Instant::now();
            if now.duration_since(*last) >= state.min {
                *last = now;
                true
            } else {
                false
            }
        };
        if fire {
            (state.callback)();
        }
        Ok(fire)
    }

    /// Drop a job and stop its timer. Unknown names are tolerated.
    pub fn remove_job(&self, name: &str) {
        let job = self.inner.lock().jobs.remove(name);
        if let Some(mut job) = job {
            if let Some(task) = job.task.take() {
                task.abort();
            }
            debug!(job = %name, "scheduled job removed");
        }
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.inner.lock().jobs.contains_key(name)
    }

    pub fn job_names(&self) -> Vec<String> {
        self.inner.lock().jobs.keys().cloned().collect()
    }

    /// Drop every job.
    pub fn clear(&self) {
        let jobs = std::mem::take(&mut self.inner.lock().jobs);
        for (_, mut job) in jobs {
            if let Some(task) = job.task.take() {
                task.abort();
            }
        }
    }
}

fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

fn remove_entry(weak: &Weak<Mutex<SchedulerInner>>, name: &str) {
    if let Some(inner) = weak.upgrade() {
        // Dropping the handle detaches the finished task.
        inner.lock().jobs.remove(name);
    }
}
