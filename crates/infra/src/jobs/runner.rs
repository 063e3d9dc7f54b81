//! Job runner: claims ready jobs and executes registered handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use pulse_core::TenantId;

use super::store::JobStore;
use super::types::{Job, JobKind, JobResult, JobStatus};

/// Handler for one job kind.
pub type JobHandler = Box<dyn Fn(&Job) -> JobResult + Send + Sync>;

#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    pub poll_interval: Duration,
    pub name: String,
    /// Restrict the runner to one tenant; `None` serves all.
    pub tenant_id: Option<TenantId>,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "job-runner".to_string(),
            tenant_id: None,
        }
    }
}

impl JobRunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

/// Handle to a running runner thread.
#[derive(Debug)]
pub struct JobRunnerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<RunnerStats>>,
}

impl JobRunnerHandle {
    /// Request graceful shutdown and wait for the thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RunnerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub uptime_secs: u64,
}

/// Background job runner.
///
/// Handlers are registered against a routing key: exact (`"indicators.rollup"`),
/// category (`"indicators.*"`), or wildcard (`"*"`).
pub struct JobRunner<S: JobStore> {
    store: S,
    handlers: HashMap<String, JobHandler>,
}

impl<S: JobStore + 'static> JobRunner<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    pub fn register_handler<F>(&mut self, key: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(key.into(), Box::new(handler));
    }

    fn handler_for(&self, kind: &JobKind) -> Option<&JobHandler> {
        let key = kind.route_key();
        if let Some(h) = self.handlers.get(key) {
            return Some(h);
        }

        for (pattern, handler) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if key.starts_with(prefix) {
                    return Some(handler);
                }
            }
        }

        self.handlers.get("*")
    }

    /// Spawn the runner on a background thread.
    pub fn spawn(self, config: JobRunnerConfig) -> JobRunnerHandle
    where
        S: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(RunnerStats::default()));
        let stats_clone = stats.clone();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || runner_loop(self, config, shutdown_rx, stats_clone))
            .expect("failed to spawn job runner thread");

        JobRunnerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    /// Execute one claimed job synchronously (tests, inline draining).
    pub fn execute_one(&self, job: &mut Job) -> Result<(), String> {
        let handler = self
            .handler_for(&job.kind)
            .ok_or_else(|| format!("no handler for job kind: {:?}", job.kind))?;
        run_handler(&self.store, handler, job)
    }
}

fn runner_loop<S: JobStore + 'static>(
    runner: JobRunner<S>,
    config: JobRunnerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<RunnerStats>>,
) {
    info!(runner = %config.name, "job runner started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        if let Ok(mut s) = stats.lock() {
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        match runner.store.claim_next(config.tenant_id) {
            Ok(Some(mut job)) => {
                debug!(runner = %config.name, job_id = %job.id, kind = ?job.kind, "claimed job");

                let result = match runner.handler_for(&job.kind) {
                    Some(handler) => run_handler(&runner.store, handler, &mut job),
                    None => {
                        let error = format!("no handler for job kind: {:?}", job.kind);
                        warn!(job_id = %job.id, error = %error, "unroutable job");
                        job.mark_failed(error.clone(), Utc::now());
                        runner.store.update(&job).ok();
                        Err(error)
                    }
                };

                if let Ok(mut s) = stats.lock() {
                    s.jobs_processed += 1;
                    match &result {
                        Ok(()) => s.jobs_succeeded += 1,
                        Err(_) => {
                            s.jobs_failed += 1;
                            if matches!(job.status, JobStatus::DeadLettered { .. }) {
                                s.jobs_dead_lettered += 1;
                            }
                        }
                    }
                }

                if let Err(e) = result {
                    debug!(
                        runner = %config.name,
                        job_id = %job.id,
                        error = %e,
                        status = ?job.status,
                        "job execution failed"
                    );
                }
            }
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                error!(runner = %config.name, error = ?e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(runner = %config.name, "job runner stopped");
}

fn run_handler<S: JobStore>(store: &S, handler: &JobHandler, job: &mut Job) -> Result<(), String> {
    let started = Utc::now();

    match handler(job) {
        JobResult::Success => {
            job.mark_completed(started);
            store.update(job).map_err(|e| e.to_string())?;
            Ok(())
        }
        JobResult::Failure(error) => {
            job.mark_failed(error.clone(), started);
            store.update(job).map_err(|e| e.to_string())?;

            if matches!(job.status, JobStatus::DeadLettered { .. }) {
                warn!(job_id = %job.id, error = %error, "job dead-lettered");
                store.dead_letter(job.clone(), error.clone()).ok();
            }

            Err(error)
        }
        JobResult::RetryNow => {
            job.mark_failed("retry requested".to_string(), started);
            job.scheduled_at = None;
            store.update(job).map_err(|e| e.to_string())?;
            Err("retry requested".to_string())
        }
        JobResult::RetryAfter(delay) => {
            job.mark_failed("retry after delay".to_string(), started);
            job.scheduled_at =
                Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            store.update(job).map_err(|e| e.to_string())?;
            Err("retry after delay".to_string())
        }
    }
}
