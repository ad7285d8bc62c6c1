use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use futures::future::BoxFuture;
use std::fmt;

use crate::config::parse_time_of_day;
use crate::db::now_local;
use crate::error::CrawlerError;

pub type TaskFn = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A job that fires once a day at a fixed time of day.
pub struct ScheduledTask {
    name: String,
    job: TaskFn,
    next_run: NaiveDateTime,
    done: bool,
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("next_run", &self.next_run)
            .field("done", &self.done)
            .finish()
    }
}

impl ScheduledTask {
    /// First run is today at `scheduled_time` (`"HH:MM"`), even if that is
    /// already in the past.
    pub fn new(name: &str, scheduled_time: &str, job: TaskFn) -> Result<Self, CrawlerError> {
        Self::new_at(name, scheduled_time, job, now_local())
    }

    pub fn new_at(
        name: &str,
        scheduled_time: &str,
        job: TaskFn,
        now: NaiveDateTime,
    ) -> Result<Self, CrawlerError> {
        let time = parse_time_of_day(scheduled_time)?;
        Ok(ScheduledTask {
            name: name.to_string(),
            job,
            next_run: now.date().and_time(time),
            done: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next_run(&self) -> NaiveDateTime {
        self.next_run
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready_at(now_local())
    }

    pub fn is_ready_at(&self, now: NaiveDateTime) -> bool {
        !self.done && now >= self.next_run
    }

    pub async fn run(&mut self) -> Result<()> {
        self.run_at(now_local()).await
    }

    /// Fire the job. Before the job starts the task is marked done and moved
    /// to the first scheduled time after `now`, so days missed while the
    /// process was stalled are skipped rather than replayed. A failing job
    /// is not retried.
    pub async fn run_at(&mut self, now: NaiveDateTime) -> Result<()> {
        self.done = true;
        let missed = (now - self.next_run).num_days().max(0);
        self.next_run += Duration::days(missed + 1);
        let result = (self.job)().await;
        self.done = false;
        result
    }
}
