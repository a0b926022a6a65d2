//! Persistent job scheduler: three schedule kinds, a single re-arming
//! timer, and a full-rewrite JSON store.
//!
//! Grounded on the teacher's `ferrobot-core::cron` module (store shape,
//! `compute_next_run`, file persistence) generalized to a third schedule
//! kind (`at`) and a `CronJobState` with status/error tracking, and on
//! `heartbeat::Heartbeat::run`'s `tokio::select!` pattern for the
//! re-arming timer — here the sleep duration is recomputed on every
//! mutation instead of being fixed at construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a job's fire times are computed. Exactly one kind per job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CronSchedule {
    Cron {
        #[serde(rename = "cronExpr")]
        cron_expr: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    Every {
        #[serde(rename = "everySeconds")]
        every_seconds: u64,
    },
    At {
        at: DateTime<Utc>,
    },
}

/// What firing a job does. The only action currently defined is
/// synthesizing an agent turn, routed back to its origin channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronPayload {
    pub action: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(rename = "chatId", skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

impl CronPayload {
    pub fn agent_turn(message: impl Into<String>, channel: Option<String>, chat_id: Option<String>) -> Self {
        Self { action: "agent_turn".into(), message: message.into(), channel, chat_id }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Error,
}

/// Derived, mutable run state for a job. `nextRunAt` of `null` means the
/// job is dormant — either disabled, or its schedule yields no future
/// fire time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronJobState {
    #[serde(rename = "nextRunAt")]
    pub next_run_at: Option<i64>,
    #[serde(rename = "lastRunAt")]
    pub last_run_at: Option<i64>,
    #[serde(rename = "lastStatus")]
    pub last_status: Option<JobStatus>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    #[serde(default)]
    pub state: CronJobState,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "deleteAfterRun")]
    pub delete_after_run: bool,
}

/// Persistent aggregate. `version` is carried through to allow future
/// schema migrations; this implementation only understands `1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronStore {
    pub version: u32,
    pub jobs: Vec<CronJob>,
}

impl Default for CronStore {
    fn default() -> Self {
        Self { version: 1, jobs: Vec::new() }
    }
}

/// `computeNextRun` — pure and total. Never panics; invalid schedules
/// resolve to `None` rather than an error.
pub fn compute_next_run(schedule: &CronSchedule, now_ms: i64) -> Option<i64> {
    match schedule {
        CronSchedule::Every { every_seconds } => Some(now_ms + (*every_seconds as i64) * 1000),
        CronSchedule::At { at } => {
            let at_ms = at.timestamp_millis();
            if at_ms > now_ms {
                Some(at_ms)
            } else {
                None
            }
        }
        CronSchedule::Cron { cron_expr, timezone } => {
            use std::str::FromStr;
            let schedule = cron::Schedule::from_str(cron_expr).ok()?;

            let now = DateTime::<Utc>::from_timestamp_millis(now_ms)?;

            if let Some(tz_name) = timezone {
                let tz: chrono_tz::Tz = tz_name.parse().ok()?;
                let now_tz = now.with_timezone(&tz);
                schedule.after(&now_tz).next().map(|dt| dt.timestamp_millis())
            } else {
                schedule.after(&now).next().map(|dt| dt.timestamp_millis())
            }
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Callback invoked once per due job, on every timer fire.
pub type JobFireCallback =
    Arc<dyn Fn(CronJob) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// Scheduler service: owns the job store exclusively and arms a single
/// timer to the earliest enabled job's `nextRunAt`.
pub struct CronService {
    store_path: PathBuf,
    store: Arc<Mutex<CronStore>>,
    rearm_tx: Option<mpsc::UnboundedSender<()>>,
    cancel: CancellationToken,
}

impl CronService {
    /// Construct a service backed by `store_path`. Does not load or start
    /// the timer yet — call [`CronService::start`] for that.
    pub fn new(store_path: PathBuf) -> Self {
        Self {
            store_path,
            store: Arc::new(Mutex::new(CronStore::default())),
            rearm_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    fn load_store(path: &Path) -> CronStore {
        if !path.exists() {
            return CronStore::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(error = %e, "cron store is schema-invalid; starting empty");
                CronStore::default()
            }),
            Err(e) => {
                warn!(error = %e, "cron store unreadable; starting empty");
                CronStore::default()
            }
        }
    }

    async fn save_store(&self) -> anyhow::Result<()> {
        let store = self.store.lock().await;
        write_store(&self.store_path, &store)
    }

    /// Load the store, recompute `nextRunAt` for every enabled job
    /// (discarding arrears accumulated while the process was down), and
    /// spawn the re-arming timer loop. `on_fire` is invoked once per due
    /// job, sequentially, on each tick.
    pub async fn start(&mut self, on_fire: JobFireCallback) -> anyhow::Result<()> {
        let loaded = Self::load_store(&self.store_path);
        {
            let mut store = self.store.lock().await;
            *store = loaded;
            let now = now_ms();
            for job in store.jobs.iter_mut() {
                job.state.next_run_at = if job.enabled {
                    compute_next_run(&job.schedule, now)
                } else {
                    None
                };
            }
        }
        self.save_store().await?;

        let (rearm_tx, mut rearm_rx) = mpsc::unbounded_channel::<()>();
        self.rearm_tx = Some(rearm_tx.clone());

        let store = Arc::clone(&self.store);
        let store_path = self.store_path.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let sleep_for = {
                    let store = store.lock().await;
                    earliest_next_run(&store)
                };

                let sleep_duration = match sleep_for {
                    Some(target) => {
                        let delta = (target - now_ms()).max(0);
                        Duration::from_millis(delta as u64)
                    }
                    // No enabled job has a next run time; wait for a mutation.
                    None => Duration::from_secs(3600),
                };

                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("cron service stopping");
                        return;
                    }
                    _ = tokio::time::sleep(sleep_duration) => {}
                    _ = rearm_rx.recv() => {
                        continue;
                    }
                }

                fire_due_jobs(&store, &store_path, &on_fire).await;
            }
        });

        info!("cron service started");
        Ok(())
    }

    /// Stop the timer loop. Does not touch the store file.
    pub fn stop(&mut self) {
        self.cancel.cancel();
    }

    fn rearm(&self) {
        if let Some(tx) = &self.rearm_tx {
            let _ = tx.send(());
        }
    }

    pub async fn add_job(
        &self,
        name: impl Into<String>,
        schedule: CronSchedule,
        payload: CronPayload,
        delete_after_run: bool,
    ) -> anyhow::Result<CronJob> {
        let now = Utc::now();
        let next_run_at = compute_next_run(&schedule, now.timestamp_millis());
        let job = CronJob {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            enabled: true,
            schedule,
            payload,
            state: CronJobState { next_run_at, ..Default::default() },
            created_at: now,
            updated_at: now,
            delete_after_run,
        };

        {
            let mut store = self.store.lock().await;
            store.jobs.push(job.clone());
        }
        self.save_store().await?;
        self.rearm();
        debug!(id = %job.id, name = %job.name, "added cron job");
        Ok(job)
    }

    pub async fn remove_job(&self, id: &str) -> anyhow::Result<bool> {
        let removed = {
            let mut store = self.store.lock().await;
            let before = store.jobs.len();
            store.jobs.retain(|j| j.id != id);
            store.jobs.len() < before
        };
        if removed {
            self.save_store().await?;
            self.rearm();
        }
        Ok(removed)
    }

    pub async fn enable_job(&self, id: &str, enabled: bool) -> anyhow::Result<bool> {
        let found = {
            let mut store = self.store.lock().await;
            if let Some(job) = store.jobs.iter_mut().find(|j| j.id == id) {
                job.enabled = enabled;
                job.updated_at = Utc::now();
                job.state.next_run_at = if enabled {
                    compute_next_run(&job.schedule, now_ms())
                } else {
                    None
                };
                true
            } else {
                false
            }
        };
        if found {
            self.save_store().await?;
            self.rearm();
        }
        Ok(found)
    }

    pub async fn list_jobs(&self) -> Vec<CronJob> {
        self.store.lock().await.jobs.clone()
    }

    pub async fn get_job(&self, id: &str) -> Option<CronJob> {
        self.store.lock().await.jobs.iter().find(|j| j.id == id).cloned()
    }
}

fn earliest_next_run(store: &CronStore) -> Option<i64> {
    store
        .jobs
        .iter()
        .filter(|j| j.enabled)
        .filter_map(|j| j.state.next_run_at)
        .min()
}

/// Collect jobs due at the current tick, fire them sequentially through
/// `on_fire`, update their run state, and remove or reschedule each.
/// Runs under the store mutex for the whole tick — jobs never race a
/// concurrent mutation mid-fire.
async fn fire_due_jobs(store: &Arc<Mutex<CronStore>>, store_path: &Path, on_fire: &JobFireCallback) {
    let now = now_ms();

    let due_ids: Vec<String> = {
        let store = store.lock().await;
        let mut due: Vec<&CronJob> = store
            .jobs
            .iter()
            .filter(|j| j.enabled && j.state.next_run_at.map(|t| t <= now).unwrap_or(false))
            .collect();
        due.sort_by_key(|j| (j.state.next_run_at.unwrap_or(0), j.id.clone()));
        due.into_iter().map(|j| j.id.clone()).collect()
    };

    if due_ids.is_empty() {
        return;
    }

    for id in due_ids {
        let job = {
            let store = store.lock().await;
            store.jobs.iter().find(|j| j.id == id).cloned()
        };
        let Some(job) = job else { continue };

        let outcome = on_fire(job.clone()).await;
        let fire_time = now_ms();

        let mut store = store.lock().await;
        let Some(entry) = store.jobs.iter_mut().find(|j| j.id == id) else { continue };

        entry.state.last_run_at = Some(fire_time);
        match outcome {
            Ok(()) => {
                entry.state.last_status = Some(JobStatus::Ok);
                entry.state.last_error = None;
            }
            Err(e) => {
                error!(id = %id, error = %e, "cron job fire failed");
                entry.state.last_status = Some(JobStatus::Error);
                entry.state.last_error = Some(e.to_string());
            }
        }
        entry.updated_at = Utc::now();

        if entry.delete_after_run {
            store.jobs.retain(|j| j.id != id);
        } else {
            let schedule = entry.schedule.clone();
            entry.state.next_run_at = compute_next_run(&schedule, fire_time);
        }

        if let Err(e) = write_store(store_path, &store) {
            error!(error = %e, "failed to persist cron store after firing job");
        }
    }
}

/// Write via a sibling temp file plus rename so a crash mid-write never
/// leaves a truncated or half-written store on disk.
fn write_store(path: &Path, store: &CronStore) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let json = serde_json::to_string_pretty(store)?;
    let tmp_path = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("cron"),
        Uuid::new_v4()
    ));
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        use chrono::TimeZone;
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap().timestamp_millis()
    }

    #[test]
    fn every_schedule_advances_by_fixed_interval() {
        let schedule = CronSchedule::Every { every_seconds: 10 };
        let t1 = ms(2026, 2, 8, 10, 0, 0);
        let t2 = t1 + 5_000;
        assert_eq!(compute_next_run(&schedule, t1), Some(t1 + 10_000));
        assert_eq!(compute_next_run(&schedule, t2), Some(t2 + 10_000));
    }

    #[test]
    fn at_schedule_returns_none_once_passed() {
        let at = DateTime::<Utc>::from_timestamp_millis(ms(2026, 2, 8, 10, 0, 5)).unwrap();
        let schedule = CronSchedule::At { at };
        assert_eq!(compute_next_run(&schedule, ms(2026, 2, 8, 10, 0, 0)), Some(at.timestamp_millis()));
        assert_eq!(compute_next_run(&schedule, ms(2026, 2, 8, 10, 0, 10)), None);
    }

    #[test]
    fn invalid_cron_expression_yields_none() {
        let schedule = CronSchedule::Cron { cron_expr: "not a cron expr".into(), timezone: None };
        assert_eq!(compute_next_run(&schedule, ms(2026, 2, 8, 10, 0, 0)), None);
    }

    #[tokio::test]
    async fn add_and_remove_job_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let service = CronService::new(dir.path().join("cron.json"));

        let job = service
            .add_job(
                "daily-summary",
                CronSchedule::Every { every_seconds: 60 },
                CronPayload::agent_turn("summarize", None, None),
                false,
            )
            .await
            .unwrap();

        let jobs = service.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);

        assert!(service.remove_job(&job.id).await.unwrap());
        assert!(service.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn disabling_a_job_clears_next_run_at() {
        let dir = tempfile::tempdir().unwrap();
        let service = CronService::new(dir.path().join("cron.json"));

        let job = service
            .add_job(
                "ping",
                CronSchedule::Every { every_seconds: 60 },
                CronPayload::agent_turn("ping", None, None),
                false,
            )
            .await
            .unwrap();
        assert!(job.state.next_run_at.is_some());

        service.enable_job(&job.id, false).await.unwrap();
        let disabled = service.get_job(&job.id).await.unwrap();
        assert!(!disabled.enabled);
        assert!(disabled.state.next_run_at.is_none());
    }

    #[tokio::test]
    async fn unreadable_store_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron.json");
        std::fs::write(&path, "not json").unwrap();

        let store = CronService::load_store(&path);
        assert!(store.jobs.is_empty());
        assert_eq!(store.version, 1);
    }

    #[tokio::test]
    async fn every_job_fires_and_reschedules() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = CronService::new(dir.path().join("cron.json"));

        service
            .add_job(
                "tick",
                CronSchedule::Every { every_seconds: 0 },
                CronPayload::agent_turn("tick", None, None),
                false,
            )
            .await
            .unwrap();

        let fired = Arc::new(Mutex::new(0u32));
        let fired_c = Arc::clone(&fired);
        let callback: JobFireCallback = Arc::new(move |_job| {
            let fired = Arc::clone(&fired_c);
            Box::pin(async move {
                *fired.lock().await += 1;
                Ok(())
            })
        });

        service.start(callback).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        service.stop();

        assert!(*fired.lock().await >= 1);
    }
}
