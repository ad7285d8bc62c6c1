use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDateTime, NaiveTime, Timelike};
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::cache::Cache;
use crate::config::ConfigSnapshot;
use crate::db::{now_local, CycleLogRow, DbHandle};
use crate::error::CrawlerError;
use crate::grabber::{update, Grabber};
use crate::reconcile::ReconcileReport;
use crate::scheduled_task::ScheduledTask;
use crate::websocket::{DashboardEvent, EventSender};

/// What a post-processing hook did to the bids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HookReport {
    pub bids_notified: usize,
    pub bids_closed: usize,
}

impl AddAssign for HookReport {
    fn add_assign(&mut self, other: Self) {
        self.bids_notified += other.bids_notified;
        self.bids_closed += other.bids_closed;
    }
}

/// Work done after the grabbers of a working cycle (notifications,
/// auto-closing).
#[async_trait]
pub trait CycleHook: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self, _snapshot: &ConfigSnapshot) -> bool {
        true
    }

    async fn run(&self, snapshot: &ConfigSnapshot, now: NaiveDateTime) -> Result<HookReport>;
}

#[derive(Debug, Clone, Serialize)]
pub struct GrabberOutcome {
    pub resource: String,
    pub report: Option<ReconcileReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_number: i64,
    pub started: NaiveDateTime,
    pub working: bool,
    pub grabbers: Vec<GrabberOutcome>,
    pub hooks: HookReport,
    pub daily_fired: Vec<String>,
    pub sleep: Duration,
}

impl CycleReport {
    pub fn grabbers_failed(&self) -> usize {
        self.grabbers.iter().filter(|g| g.error.is_some()).count()
    }

    pub fn bids_inserted(&self) -> usize {
        self.grabbers
            .iter()
            .filter_map(|g| g.report.as_ref())
            .map(|r| r.inserted)
            .sum()
    }

    pub fn bids_inactivated(&self) -> usize {
        self.grabbers
            .iter()
            .filter_map(|g| g.report.as_ref())
            .map(|r| r.inactivated)
            .sum()
    }
}

/// Whether `now` falls inside the snapshot's working window. Both ends are
/// inclusive at minute precision; a window that starts after it ends spans
/// midnight.
pub fn working_time(snapshot: &ConfigSnapshot, now: NaiveDateTime) -> Result<bool, CrawlerError> {
    let (starts, ends) = snapshot.work_window()?;
    let minute = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(now.time());
    Ok(if starts <= ends {
        starts <= minute && minute <= ends
    } else {
        minute >= starts || minute <= ends
    })
}

/// The control loop: grabbers every cycle during working hours, hooks after
/// them, daily tasks whenever due, then a config-driven sleep.
pub struct Scheduler {
    db: DbHandle,
    cache: Arc<dyn Cache>,
    tasks: Vec<Box<dyn Grabber>>,
    daily_tasks: Vec<ScheduledTask>,
    hooks: Vec<Box<dyn CycleHook>>,
    default_refresh_minutes: u64,
    events: Option<EventSender>,
}

impl Scheduler {
    pub fn new(db: DbHandle, cache: Arc<dyn Cache>, default_refresh_minutes: u64) -> Self {
        Scheduler {
            db,
            cache,
            tasks: Vec::new(),
            daily_tasks: Vec::new(),
            hooks: Vec::new(),
            default_refresh_minutes,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = Box<dyn Grabber>>) {
        self.tasks.extend(tasks);
    }

    pub fn add_daily_tasks(&mut self, tasks: impl IntoIterator<Item = ScheduledTask>) {
        self.daily_tasks.extend(tasks);
    }

    pub fn add_hook(&mut self, hook: Box<dyn CycleHook>) {
        self.hooks.push(hook);
    }

    fn broadcast(&self, event: DashboardEvent) {
        if let Some(tx) = &self.events {
            // No subscribers is fine
            let _ = tx.send(event);
        }
    }

    /// Run every grabber concurrently and wait for all of them. A failing
    /// grabber is logged and does not affect the others.
    pub async fn run_tasks(
        &self,
        snapshot: &ConfigSnapshot,
        now: NaiveDateTime,
    ) -> Vec<GrabberOutcome> {
        let runs = self.tasks.iter().map(|grabber| async move {
            let result = update(grabber.as_ref(), &self.db, self.cache.as_ref(), snapshot, now).await;
            (grabber.name().to_string(), result)
        });

        join_all(runs)
            .await
            .into_iter()
            .map(|(resource, result)| match result {
                Ok(report) => {
                    self.broadcast(DashboardEvent::ResourceUpdated {
                        resource: resource.clone(),
                        fetched: report.fetched,
                        inserted: report.inserted,
                        inactivated: report.inactivated,
                    });
                    GrabberOutcome {
                        resource,
                        report: Some(report),
                        error: None,
                    }
                }
                Err(e) => {
                    error!(resource = %resource, "Grabber failed: {:#}", e);
                    GrabberOutcome {
                        resource,
                        report: None,
                        error: Some(format!("{:#}", e)),
                    }
                }
            })
            .collect()
    }

    /// Fire due daily tasks one after another, in registration order.
    /// Returns the names of the tasks that fired.
    pub async fn run_daily_tasks(&mut self, now: NaiveDateTime) -> Vec<String> {
        let mut fired = Vec::new();
        for task in self.daily_tasks.iter_mut() {
            if !task.is_ready_at(now) {
                continue;
            }
            info!(task = task.name(), "Running daily task");
            if let Err(e) = task.run_at(now).await {
                error!(task = task.name(), "Daily task failed: {:#}", e);
            }
            fired.push(task.name().to_string());
        }
        fired
    }

    async fn run_hooks(&self, snapshot: &ConfigSnapshot, now: NaiveDateTime) -> HookReport {
        let mut total = HookReport::default();
        for hook in &self.hooks {
            if !hook.enabled(snapshot) {
                continue;
            }
            match hook.run(snapshot, now).await {
                Ok(report) => total += report,
                Err(e) => error!(hook = hook.name(), "Cycle hook failed: {:#}", e),
            }
        }
        total
    }

    /// One iteration of the loop, everything decided against a single config
    /// snapshot read at the top.
    pub async fn run_cycle_at(&mut self, now: NaiveDateTime) -> Result<CycleReport> {
        let (snapshot, cycle_number) = {
            let db = self.db.acquire()?;
            (db.load_config()?, db.next_cycle_number()?)
        };
        let working = working_time(&snapshot, now)?;

        let (grabbers, hooks) = if working {
            let grabbers = self.run_tasks(&snapshot, now).await;
            let hooks = self.run_hooks(&snapshot, now).await;
            (grabbers, hooks)
        } else {
            info!(
                starts = %snapshot.time_day_starts,
                ends = %snapshot.time_day_ends,
                "Outside working hours, skipping grabbers"
            );
            (Vec::new(), HookReport::default())
        };

        let daily_fired = self.run_daily_tasks(now).await;

        let report = CycleReport {
            cycle_number,
            started: now,
            working,
            grabbers,
            hooks,
            daily_fired,
            sleep: snapshot.refresh_interval(self.default_refresh_minutes),
        };

        let row = CycleLogRow {
            cycle_number,
            working,
            grabbers_run: report.grabbers.len() as i64,
            grabbers_failed: report.grabbers_failed() as i64,
            bids_inserted: report.bids_inserted() as i64,
            bids_inactivated: report.bids_inactivated() as i64,
            bids_notified: report.hooks.bids_notified as i64,
            created: now,
        };
        if let Err(e) = self.db.acquire().and_then(|db| db.log_cycle(&row)) {
            warn!("Failed to log cycle summary: {:#}", e);
        }
        self.broadcast(DashboardEvent::CycleComplete {
            cycle_number,
            working,
            grabbers_run: row.grabbers_run,
            grabbers_failed: row.grabbers_failed,
            bids_inserted: row.bids_inserted,
            bids_inactivated: row.bids_inactivated,
            bids_notified: row.bids_notified,
        });

        info!(
            cycle = cycle_number,
            working,
            grabbers = row.grabbers_run,
            failed = row.grabbers_failed,
            inserted = row.bids_inserted,
            inactivated = row.bids_inactivated,
            notified = row.bids_notified,
            daily = report.daily_fired.len(),
            "Cycle complete"
        );
        Ok(report)
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.run_cycle_at(now_local()).await
    }

    /// Loop until Ctrl+C.
    pub async fn run_forever(&mut self) -> Result<()> {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl+C received, shutting down gracefully");
        })
        .await
    }

    /// Loop until `shutdown` resolves. The signal is watched during cycles as
    /// well as between them; an interrupted cycle is dropped mid-way. Errors
    /// that escape a cycle (no config row, broken database) end the loop.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            grabbers = self.tasks.len(),
            daily = self.daily_tasks.len(),
            hooks = self.hooks.len(),
            "Scheduler starting"
        );
        tokio::pin!(shutdown);
        loop {
            let report = tokio::select! {
                report = self.run_cycle() => report?,
                _ = &mut shutdown => return Ok(()),
            };
            info!("Sleeping {}s until next cycle", report.sleep.as_secs());

            tokio::select! {
                _ = tokio::time::sleep(report.sleep) => {}
                _ = &mut shutdown => return Ok(()),
            }
        }
    }

    /// Release grabber and cache resources. Best effort: failures are logged.
    pub async fn cleanup(&self) {
        for grabber in &self.tasks {
            if let Err(e) = grabber.close().await {
                warn!(resource = grabber.name(), "Failed to close grabber: {:#}", e);
            }
        }
        if let Err(e) = self.cache.close().await {
            warn!("Failed to close cache: {:#}", e);
        }
        info!("Scheduler cleaned up");
    }
}
