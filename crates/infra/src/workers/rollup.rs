//! Rollup worker: recomputes each indicator's configured calculation over
//! its full current series.
//!
//! The progress projection is incremental (latest value only); the rollup
//! applies the indicator's `CalculationMethod` — including custom formulas
//! over disaggregation slices — which needs the whole series and therefore
//! runs off the request path. The worker is per-tenant, triggered by
//! projection updates (coalesced), with a periodic cadence as a safety net
//! and bounded exponential backoff on read failures.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use pulse_core::TenantId;
use pulse_indicators::{CalculationMethod, IndicatorId, SeriesInputs, evaluate};

/// One indicator's inputs for a rollup pass.
#[derive(Debug, Clone)]
pub struct RollupSource {
    pub indicator_id: IndicatorId,
    pub name: String,
    pub calculation: CalculationMethod,
    pub inputs: SeriesInputs,
}

/// Result of rolling up one indicator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupSnapshot {
    pub indicator_id: IndicatorId,
    pub name: String,
    pub value: Option<f64>,
    pub error: Option<String>,
    pub computed_at: DateTime<Utc>,
}

/// Read side the worker pulls from (registry + series read models).
pub trait RollupReader: Send + Sync + 'static {
    fn sources(&self, tenant_id: TenantId) -> Result<Vec<RollupSource>, String>;
}

/// Sink for computed snapshots. Rollups are derived state, not domain
/// events, so they bypass the event stream.
pub trait RollupSink: Send + Sync + 'static {
    fn emit(&self, tenant_id: TenantId, snapshot: RollupSnapshot);
}

/// Config for the rollup worker.
#[derive(Debug, Clone)]
pub struct RollupRunner {
    pub interval: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RollupRunner {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_retries: 5,
            base_backoff: Duration::from_millis(250),
        }
    }
}

/// Handle for a running worker (shutdown + trigger hook).
#[derive(Debug)]
pub struct RollupRunnerHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl RollupRunnerHandle {
    /// Event-trigger hook: call after a projection update. Triggers are
    /// coalesced (capacity-1 queue); if a pass is already pending, this is a
    /// no-op.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Gracefully stop the worker thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl RollupRunner {
    /// Spawn a tenant-scoped worker.
    pub fn spawn_for_tenant<R, S>(
        &self,
        name: &'static str,
        tenant_id: TenantId,
        reader: Arc<R>,
        sink: Arc<S>,
    ) -> RollupRunnerHandle
    where
        R: RollupReader,
        S: RollupSink,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);

        let cfg = self.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runner_loop(name, tenant_id, cfg, shutdown_rx, trigger_rx, reader, sink))
            .expect("failed to spawn rollup worker thread");

        RollupRunnerHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join: Some(join),
        }
    }
}

/// Pure rollup pass over a set of sources. Split out so it is directly
/// testable without threads.
pub fn compute_rollups(sources: &[RollupSource]) -> Vec<RollupSnapshot> {
    sources
        .iter()
        .map(|src| {
            let computed_at = Utc::now();
            match evaluate(&src.calculation, &src.inputs, None) {
                Ok(value) => RollupSnapshot {
                    indicator_id: src.indicator_id,
                    name: src.name.clone(),
                    value: Some(value),
                    error: None,
                    computed_at,
                },
                Err(e) => RollupSnapshot {
                    indicator_id: src.indicator_id,
                    name: src.name.clone(),
                    value: None,
                    error: Some(e.to_string()),
                    computed_at,
                },
            }
        })
        .collect()
}

fn runner_loop<R, S>(
    name: &'static str,
    tenant_id: TenantId,
    cfg: RollupRunner,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
    reader: Arc<R>,
    sink: Arc<S>,
) where
    R: RollupReader,
    S: RollupSink,
{
    info!(worker = name, tenant = %tenant_id, "rollup worker started");

    let mut next_tick = Instant::now() + cfg.interval;
    let mut pending = true; // run once on startup
    let mut failures: u32 = 0;
    let mut backoff_until: Option<Instant> = None;

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            // Keep a stable cadence even if we were delayed.
            while next_tick <= now {
                next_tick += cfg.interval;
            }
        }

        // Drain triggers non-blocking; multiple updates coalesce into one
        // pass.
        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if let Some(until) = backoff_until {
            if Instant::now() < until {
                thread::sleep(Duration::from_millis(50));
                continue;
            }
            backoff_until = None;
        }

        if !pending {
            let sleep_for = next_tick
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(250));
            thread::sleep(sleep_for);
            continue;
        }

        pending = false;

        let sources = match reader.sources(tenant_id) {
            Ok(s) => s,
            Err(e) => {
                warn!(worker = name, tenant = %tenant_id, error = %e, "rollup read failed");
                failures += 1;
                if failures <= cfg.max_retries {
                    pending = true;
                    backoff_until = Some(Instant::now() + backoff(cfg.base_backoff, failures));
                } else {
                    failures = 0;
                }
                continue;
            }
        };

        failures = 0;
        for snapshot in compute_rollups(&sources) {
            sink.emit(tenant_id, snapshot);
        }
    }

    info!(worker = name, tenant = %tenant_id, "rollup worker stopped");
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    let pow = 1u32 << attempt.saturating_sub(1).min(10);
    let ms = base.as_millis().saturating_mul(pow as u128);
    Duration::from_millis(ms.min(10_000) as u64)
}
