//! Cron-driven download tasks on top of `tokio-cron-scheduler`.
//!
//! Tasks live only in memory. A task is registered `stopped`; starting it adds
//! a cron job to the shared [`JobScheduler`], stopping it removes the job.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_QUALITY;
use crate::downloader::Downloader;
use crate::files;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task not found")]
    TaskNotFound(u64),

    #[error("Invalid cron schedule format")]
    InvalidCron,

    #[error("Scheduler failure: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    pub quality: String,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: u64,
    pub url: String,
    /// The expression as submitted.
    pub schedule: String,
    pub options: TaskOptions,
    pub status: TaskStatus,
    pub created: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

struct TaskEntry {
    task: ScheduledTask,
    /// Seconds-first form accepted by the cron engine.
    cron: String,
    /// Set while the task is running.
    job: Option<Uuid>,
}

type TaskTable = Arc<RwLock<BTreeMap<u64, TaskEntry>>>;

/// Everything a cron trigger needs, cloned into each job closure.
#[derive(Clone)]
struct Trigger {
    downloader: Arc<Downloader>,
    tasks: TaskTable,
    permits: Arc<Semaphore>,
}

impl Trigger {
    async fn fire(&self, id: u64) {
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };

        let (url, quality) = {
            let mut tasks = self.tasks.write();
            let Some(entry) = tasks.get_mut(&id) else {
                return;
            };
            // Stopped while queued behind other downloads.
            if entry.task.status != TaskStatus::Running {
                return;
            }
            entry.task.last_run = Some(Utc::now());
            (entry.task.url.clone(), entry.task.options.quality.clone())
        };

        info!(task = id, %url, "running scheduled download");
        match self.downloader.download(&url, &quality).await {
            Ok(result) => info!(
                task = id,
                file = %result.filepath.display(),
                "scheduled download finished"
            ),
            Err(err) => error!(task = id, %url, "scheduled download failed: {err}"),
        }
    }
}

pub struct TaskScheduler {
    scheduler: JobScheduler,
    trigger: Trigger,
    next_id: AtomicU64,
}

impl TaskScheduler {
    /// Creates and starts the underlying cron engine. `max_concurrent` bounds
    /// how many scheduled downloads run at once (at least one).
    pub async fn new(
        downloader: Arc<Downloader>,
        max_concurrent: usize,
    ) -> Result<Self, SchedulerError> {
        let scheduler = JobScheduler::new().await?;
        scheduler.start().await?;

        Ok(Self {
            scheduler,
            trigger: Trigger {
                downloader,
                tasks: Arc::new(RwLock::new(BTreeMap::new())),
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            },
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers a stopped task. The schedule is validated first, so a
    /// rejected expression leaves no trace and consumes no id.
    pub fn schedule_download(
        &self,
        url: &str,
        schedule: &str,
        options: TaskOptions,
    ) -> Result<u64, SchedulerError> {
        let cron = normalize_cron(schedule)?;
        validate_cron(&cron)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = ScheduledTask {
            id,
            url: url.to_owned(),
            schedule: schedule.to_owned(),
            options,
            status: TaskStatus::Stopped,
            created: Utc::now(),
            last_run: None,
        };
        self.trigger
            .tasks
            .write()
            .insert(id, TaskEntry { task, cron, job: None });

        info!(task = id, url, schedule, "scheduled download task");
        Ok(id)
    }

    /// Registers a task and, when `start` is set, starts it. A task that
    /// fails to start is discarded again before the error is returned.
    pub async fn create_task(
        &self,
        url: &str,
        schedule: &str,
        options: TaskOptions,
        start: bool,
    ) -> Result<ScheduledTask, SchedulerError> {
        let id = self.schedule_download(url, schedule, options)?;
        if start && let Err(err) = self.start_task(id).await {
            self.discard(id);
            return Err(err);
        }
        self.task(id)
    }

    /// Drops a task that never got a cron job.
    fn discard(&self, id: u64) {
        let mut tasks = self.trigger.tasks.write();
        if tasks.get(&id).is_some_and(|entry| entry.job.is_none()) {
            tasks.remove(&id);
            warn!(task = id, "discarded task that failed to start");
        }
    }

    pub async fn start_task(&self, id: u64) -> Result<(), SchedulerError> {
        let cron = {
            let tasks = self.trigger.tasks.read();
            let entry = tasks.get(&id).ok_or(SchedulerError::TaskNotFound(id))?;
            if entry.job.is_some() {
                return Ok(());
            }
            entry.cron.clone()
        };

        let trigger = self.trigger.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let trigger = trigger.clone();
            Box::pin(async move { trigger.fire(id).await })
        })?;
        let job_id = self.scheduler.add(job).await?;

        // The table may have changed while the job was being added.
        let outcome = {
            let mut tasks = self.trigger.tasks.write();
            match tasks.get_mut(&id) {
                Some(entry) if entry.job.is_none() => {
                    entry.job = Some(job_id);
                    entry.task.status = TaskStatus::Running;
                    Ok(None)
                }
                Some(_) => Ok(Some(job_id)),
                None => Err(job_id),
            }
        };

        match outcome {
            Ok(None) => {
                info!(task = id, "task started");
                Ok(())
            }
            Ok(Some(duplicate)) => {
                self.scheduler.remove(&duplicate).await?;
                Ok(())
            }
            Err(orphan) => {
                self.scheduler.remove(&orphan).await?;
                Err(SchedulerError::TaskNotFound(id))
            }
        }
    }

    pub async fn stop_task(&self, id: u64) -> Result<(), SchedulerError> {
        let job = {
            let mut tasks = self.trigger.tasks.write();
            let entry = tasks
                .get_mut(&id)
                .ok_or(SchedulerError::TaskNotFound(id))?;
            entry.task.status = TaskStatus::Stopped;
            entry.job.take()
        };

        if let Some(job) = job {
            self.scheduler.remove(&job).await?;
            info!(task = id, "task stopped");
        }
        Ok(())
    }

    pub async fn delete_task(&self, id: u64) -> Result<(), SchedulerError> {
        let entry = self
            .trigger
            .tasks
            .write()
            .remove(&id)
            .ok_or(SchedulerError::TaskNotFound(id))?;

        if let Some(job) = entry.job {
            self.scheduler.remove(&job).await?;
        }
        info!(task = id, "task deleted");
        Ok(())
    }

    /// Snapshot of every task, ordered by id.
    pub fn tasks(&self) -> Vec<ScheduledTask> {
        self.trigger
            .tasks
            .read()
            .values()
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub fn task(&self, id: u64) -> Result<ScheduledTask, SchedulerError> {
        self.trigger
            .tasks
            .read()
            .get(&id)
            .map(|entry| entry.task.clone())
            .ok_or(SchedulerError::TaskNotFound(id))
    }

    /// Registers a recurring job that deletes files in `dir` older than
    /// `retention_days`.
    pub async fn schedule_cleanup(
        &self,
        schedule: &str,
        dir: PathBuf,
        retention_days: u64,
    ) -> Result<Uuid, SchedulerError> {
        let cron = normalize_cron(schedule)?;
        let max_age = Duration::from_secs(retention_days.saturating_mul(SECONDS_PER_DAY));

        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let dir = dir.clone();
            Box::pin(async move {
                let target = dir.clone();
                match tokio::task::spawn_blocking(move || files::remove_older_than(&target, max_age))
                    .await
                {
                    Ok(removed) => {
                        info!(dir = %dir.display(), removed, "cleanup removed old files")
                    }
                    Err(err) => warn!(dir = %dir.display(), "cleanup job panicked: {err}"),
                }
            })
        })
        .map_err(|_| SchedulerError::InvalidCron)?;

        let job_id = self.scheduler.add(job).await?;
        info!(schedule, retention_days, "cleanup job registered");
        Ok(job_id)
    }

    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        Ok(())
    }
}

/// Accepts five-field cron (minute first) by prepending a zero seconds
/// field. Six and seven field expressions pass through.
pub fn normalize_cron(schedule: &str) -> Result<String, SchedulerError> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        _ => Err(SchedulerError::InvalidCron),
    }
}

fn validate_cron(cron: &str) -> Result<(), SchedulerError> {
    Job::new_async(cron, |_uuid, _l| Box::pin(async {}))
        .map(drop)
        .map_err(|_| SchedulerError::InvalidCron)
}
