//! Infrastructure wiring: stores, bus, projections, cache, jobs, workers.
//!
//! The in-memory wiring is the dev/test default; `USE_PERSISTENT_STORES=true`
//! (with the `persistent` feature) swaps in the Postgres event store and the
//! Redis response cache. Projections stay in-memory in both modes: they are
//! disposable and rebuild from the stream on demand.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};

use pulse_core::{AggregateId, DomainError, TenantId};
use pulse_events::{EventBus, EventEnvelope, InMemoryEventBus};
use pulse_indicators::{IndicatorId, IndicatorStatus};
use pulse_infra::{
    CommandDispatcher, DispatchError, InMemoryEventStore, InMemoryResponseCache,
    InMemoryTenantStore, ResponseCache, TenantStore,
    event_store::{EventFilter, EventQuery, EventQueryResult, EventStoreError, Pagination, StoredEvent},
    jobs::{InMemoryJobStore, Job, JobResult, JobRunner, JobRunnerConfig, JobRunnerHandle, JobStore},
    projections::{
        IndicatorReadModel, IndicatorRegistryProjection, ProgressProjection, ProgressReadModel,
        ValueSeriesProjection, ValueSeriesReadModel,
    },
    workers::{RollupReader, RollupRunner, RollupRunnerHandle, RollupSink, RollupSnapshot, RollupSource},
};

#[cfg(feature = "persistent")]
use pulse_infra::{cache::RedisResponseCache, event_store::PostgresEventStore};
#[cfg(feature = "persistent")]
use sqlx::PgPool;

pub const AGGREGATE_TYPE: &str = "indicators.indicator";

/// Realtime message broadcast to SSE subscribers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RealtimeMessage {
    pub tenant_id: TenantId,
    pub topic: String,
    pub payload: JsonValue,
}

type Env = EventEnvelope<JsonValue>;
type Bus = InMemoryEventBus<Env>;

type RegistryProjection =
    IndicatorRegistryProjection<Arc<InMemoryTenantStore<IndicatorId, IndicatorReadModel>>>;
type SeriesProjection =
    ValueSeriesProjection<Arc<InMemoryTenantStore<IndicatorId, ValueSeriesReadModel>>>;
type ProgressProj = ProgressProjection<Arc<InMemoryTenantStore<IndicatorId, ProgressReadModel>>>;
type RollupStore = Arc<InMemoryTenantStore<IndicatorId, RollupSnapshot>>;

type InMemoryDispatcher = CommandDispatcher<Arc<InMemoryEventStore>, Arc<Bus>>;
#[cfg(feature = "persistent")]
type PersistentDispatcher = CommandDispatcher<Arc<PostgresEventStore>, Arc<Bus>>;

/// Rollup read side backed by the registry + series projections.
pub struct ProjectionRollupReader {
    registry: Arc<RegistryProjection>,
    series: Arc<SeriesProjection>,
}

impl RollupReader for ProjectionRollupReader {
    fn sources(&self, tenant_id: TenantId) -> Result<Vec<RollupSource>, String> {
        Ok(self
            .registry
            .list(tenant_id)
            .into_iter()
            .filter(|rm| rm.status == IndicatorStatus::Active)
            .filter_map(|rm| {
                let calculation = rm.calculation?;
                let inputs = self
                    .series
                    .get(tenant_id, &rm.indicator_id)
                    .map(|s| s.inputs())
                    .unwrap_or_default();
                Some(RollupSource {
                    indicator_id: rm.indicator_id,
                    name: rm.name,
                    calculation,
                    inputs,
                })
            })
            .collect())
    }
}

/// Sink that stores snapshots and notifies SSE subscribers.
pub struct ApiRollupSink {
    snapshots: RollupStore,
    realtime_tx: broadcast::Sender<RealtimeMessage>,
}

impl RollupSink for ApiRollupSink {
    fn emit(&self, tenant_id: TenantId, snapshot: RollupSnapshot) {
        self.snapshots
            .upsert(tenant_id, snapshot.indicator_id, snapshot.clone());

        // Lossy notification; no backpressure on the worker.
        let _ = self.realtime_tx.send(RealtimeMessage {
            tenant_id,
            topic: "indicators.rollup_updated".to_string(),
            payload: serde_json::json!({
                "indicator_id": snapshot.indicator_id.to_string(),
                "value": snapshot.value,
            }),
        });
    }
}

/// Everything a handler needs, behind one clonable handle.
#[derive(Clone)]
pub enum AppServices {
    InMemory {
        dispatcher: Arc<InMemoryDispatcher>,
        event_store: Arc<InMemoryEventStore>,
        registry: Arc<RegistryProjection>,
        series: Arc<SeriesProjection>,
        progress: Arc<ProgressProj>,
        rollups: RollupStore,
        cache: Arc<dyn ResponseCache>,
        cache_ttl: Duration,
        job_store: Arc<InMemoryJobStore>,
        job_runner: Arc<JobRunnerHandle>,
        realtime_tx: broadcast::Sender<RealtimeMessage>,
    },
    #[cfg(feature = "persistent")]
    Persistent {
        dispatcher: Arc<PersistentDispatcher>,
        event_store: Arc<PostgresEventStore>,
        registry: Arc<RegistryProjection>,
        series: Arc<SeriesProjection>,
        progress: Arc<ProgressProj>,
        rollups: RollupStore,
        cache: Arc<dyn ResponseCache>,
        cache_ttl: Duration,
        job_store: Arc<InMemoryJobStore>,
        job_runner: Arc<JobRunnerHandle>,
        realtime_tx: broadcast::Sender<RealtimeMessage>,
    },
}

pub async fn build_services() -> AppServices {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_persistent {
        #[cfg(feature = "persistent")]
        {
            return build_persistent_services().await;
        }
        #[cfg(not(feature = "persistent"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but the persistent feature is not enabled, \
                 falling back to in-memory"
            );
        }
    }

    build_in_memory_services()
}

fn cache_ttl_from_env() -> Duration {
    let secs = std::env::var("CACHE_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    Duration::from_secs(secs)
}

/// Shared wiring: projections, rollup workers, cache invalidation, realtime
/// fan-out, all fed by a bus subscription on a blocking thread.
struct ProjectionWiring {
    registry: Arc<RegistryProjection>,
    series: Arc<SeriesProjection>,
    progress: Arc<ProgressProj>,
    rollups: RollupStore,
    realtime_tx: broadcast::Sender<RealtimeMessage>,
}

fn spawn_projection_worker(
    bus: &Arc<Bus>,
    wiring: ProjectionWiring,
    cache: Arc<dyn ResponseCache>,
    rollup_runners: Arc<Mutex<HashMap<TenantId, RollupRunnerHandle>>>,
) {
    let sub = bus.subscribe();
    let rollup_cfg = RollupRunner::default();

    tokio::task::spawn_blocking(move || {
        loop {
            match sub.recv() {
                Ok(env) => {
                    if env.aggregate_type() != AGGREGATE_TYPE {
                        continue;
                    }

                    let tenant_id = env.tenant_id();

                    let applied = wiring
                        .registry
                        .apply_envelope(&env)
                        .map_err(|e| e.to_string())
                        .and_then(|_| {
                            wiring.series.apply_envelope(&env).map_err(|e| e.to_string())
                        })
                        .and_then(|_| {
                            wiring
                                .progress
                                .apply_envelope(&env)
                                .map_err(|e| e.to_string())
                        });

                    if let Err(e) = applied {
                        tracing::warn!("projection apply failed: {e}");
                        continue;
                    }

                    // Computed responses for this indicator are stale now.
                    cache.invalidate_prefix(
                        tenant_id,
                        &format!("indicators:{}:", env.aggregate_id()),
                    );

                    let _ = wiring.realtime_tx.send(RealtimeMessage {
                        tenant_id,
                        topic: "indicators.projection_updated".to_string(),
                        payload: serde_json::json!({
                            "aggregate_id": env.aggregate_id().to_string(),
                            "sequence_number": env.sequence_number(),
                        }),
                    });

                    // Kick the tenant's rollup worker (spawned on first use).
                    let mut runners = match rollup_runners.lock() {
                        Ok(r) => r,
                        Err(_) => continue,
                    };
                    let handle = runners.entry(tenant_id).or_insert_with(|| {
                        rollup_cfg.spawn_for_tenant(
                            "indicators.rollup",
                            tenant_id,
                            Arc::new(ProjectionRollupReader {
                                registry: wiring.registry.clone(),
                                series: wiring.series.clone(),
                            }),
                            Arc::new(ApiRollupSink {
                                snapshots: wiring.rollups.clone(),
                                realtime_tx: wiring.realtime_tx.clone(),
                            }),
                        )
                    });
                    handle.trigger();
                }
                Err(_) => break,
            }
        }
    });
}

fn spawn_job_runner(
    job_store: Arc<InMemoryJobStore>,
    rollup_runners: Arc<Mutex<HashMap<TenantId, RollupRunnerHandle>>>,
    rebuild: impl Fn(TenantId) -> Result<(), String> + Send + Sync + 'static,
) -> Arc<JobRunnerHandle> {
    let mut runner = JobRunner::new(job_store);

    runner.register_handler("indicators.rollup", move |job: &Job| {
        let runners = match rollup_runners.lock() {
            Ok(r) => r,
            Err(_) => return JobResult::Failure("rollup runner registry poisoned".to_string()),
        };
        match runners.get(&job.tenant_id) {
            Some(handle) => {
                handle.trigger();
                JobResult::Success
            }
            // No worker yet means no events yet; nothing to roll up.
            None => JobResult::Success,
        }
    });

    runner.register_handler("projections.rebuild", move |job: &Job| {
        match rebuild(job.tenant_id) {
            Ok(()) => JobResult::Success,
            Err(e) => JobResult::Failure(e),
        }
    });

    Arc::new(runner.spawn(JobRunnerConfig::default().with_name("pulse-jobs")))
}

fn build_in_memory_services() -> AppServices {
    let store = Arc::new(InMemoryEventStore::new());
    let bus: Arc<Bus> = Arc::new(InMemoryEventBus::new());

    let registry: Arc<RegistryProjection> = Arc::new(IndicatorRegistryProjection::new(Arc::new(
        InMemoryTenantStore::new(),
    )));
    let series: Arc<SeriesProjection> =
        Arc::new(ValueSeriesProjection::new(Arc::new(InMemoryTenantStore::new())));
    let progress: Arc<ProgressProj> =
        Arc::new(ProgressProjection::new(Arc::new(InMemoryTenantStore::new())));
    let rollups: RollupStore = Arc::new(InMemoryTenantStore::new());

    let cache: Arc<dyn ResponseCache> = Arc::new(InMemoryResponseCache::new());
    let cache_ttl = cache_ttl_from_env();

    let (realtime_tx, _realtime_rx) = broadcast::channel::<RealtimeMessage>(256);

    let rollup_runners: Arc<Mutex<HashMap<TenantId, RollupRunnerHandle>>> =
        Arc::new(Mutex::new(HashMap::new()));

    spawn_projection_worker(
        &bus,
        ProjectionWiring {
            registry: registry.clone(),
            series: series.clone(),
            progress: progress.clone(),
            rollups: rollups.clone(),
            realtime_tx: realtime_tx.clone(),
        },
        cache.clone(),
        rollup_runners.clone(),
    );

    let job_store = InMemoryJobStore::arc();
    let job_runner = {
        let registry = registry.clone();
        let store = store.clone();
        spawn_job_runner(job_store.clone(), rollup_runners, move |tenant_id| {
            registry
                .rebuild_from_scratch(store.tenant_envelopes(tenant_id))
                .map_err(|e| e.to_string())
        })
    };

    let dispatcher: Arc<InMemoryDispatcher> =
        Arc::new(CommandDispatcher::new(store.clone(), bus.clone()));

    AppServices::InMemory {
        dispatcher,
        event_store: store,
        registry,
        series,
        progress,
        rollups,
        cache,
        cache_ttl,
        job_store,
        job_runner,
        realtime_tx,
    }
}

#[cfg(feature = "persistent")]
async fn build_persistent_services() -> AppServices {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

    let pool = PgPool::connect(&database_url)
        .await
        .expect("failed to connect to Postgres");
    let store = Arc::new(PostgresEventStore::new(pool));

    let bus: Arc<Bus> = Arc::new(InMemoryEventBus::new());

    let registry: Arc<RegistryProjection> = Arc::new(IndicatorRegistryProjection::new(Arc::new(
        InMemoryTenantStore::new(),
    )));
    let series: Arc<SeriesProjection> =
        Arc::new(ValueSeriesProjection::new(Arc::new(InMemoryTenantStore::new())));
    let progress: Arc<ProgressProj> =
        Arc::new(ProgressProjection::new(Arc::new(InMemoryTenantStore::new())));
    let rollups: RollupStore = Arc::new(InMemoryTenantStore::new());

    let cache: Arc<dyn ResponseCache> = Arc::new(
        RedisResponseCache::new(&redis_url).expect("failed to create Redis response cache"),
    );
    let cache_ttl = cache_ttl_from_env();

    let (realtime_tx, _realtime_rx) = broadcast::channel::<RealtimeMessage>(256);

    let rollup_runners: Arc<Mutex<HashMap<TenantId, RollupRunnerHandle>>> =
        Arc::new(Mutex::new(HashMap::new()));

    spawn_projection_worker(
        &bus,
        ProjectionWiring {
            registry: registry.clone(),
            series: series.clone(),
            progress: progress.clone(),
            rollups: rollups.clone(),
            realtime_tx: realtime_tx.clone(),
        },
        cache.clone(),
        rollup_runners.clone(),
    );

    let job_store = InMemoryJobStore::arc();
    let job_runner = {
        let registry = registry.clone();
        let store = store.clone();
        // The job thread has no runtime of its own; drive the async query
        // through the server's handle.
        let rt = tokio::runtime::Handle::current();
        spawn_job_runner(job_store.clone(), rollup_runners, move |tenant_id| {
            let mut envelopes = Vec::new();
            let mut offset = 0u32;
            loop {
                let page = rt
                    .block_on(store.query_events(
                        tenant_id,
                        EventFilter::default(),
                        Pagination {
                            limit: Pagination::MAX_LIMIT,
                            offset,
                        },
                    ))
                    .map_err(|e| e.to_string())?;
                envelopes.extend(page.events.iter().map(StoredEvent::to_envelope));
                if !page.has_more {
                    break;
                }
                offset += Pagination::MAX_LIMIT;
            }
            registry
                .rebuild_from_scratch(envelopes)
                .map_err(|e| e.to_string())
        })
    };

    let dispatcher: Arc<PersistentDispatcher> =
        Arc::new(CommandDispatcher::new(store.clone(), bus.clone()));

    AppServices::Persistent {
        dispatcher,
        event_store: store,
        registry,
        series,
        progress,
        rollups,
        cache,
        cache_ttl,
        job_store,
        job_runner,
        realtime_tx,
    }
}

macro_rules! on_services {
    ($self:expr, $field:ident => $body:expr) => {
        match $self {
            AppServices::InMemory { $field, .. } => $body,
            #[cfg(feature = "persistent")]
            AppServices::Persistent { $field, .. } => $body,
        }
    };
}

impl AppServices {
    pub fn realtime_tx(&self) -> &broadcast::Sender<RealtimeMessage> {
        on_services!(self, realtime_tx => realtime_tx)
    }

    pub fn cache(&self) -> &Arc<dyn ResponseCache> {
        on_services!(self, cache => cache)
    }

    pub fn cache_ttl(&self) -> Duration {
        *on_services!(self, cache_ttl => cache_ttl)
    }

    pub fn jobs(&self) -> &Arc<InMemoryJobStore> {
        on_services!(self, job_store => job_store)
    }

    pub fn job_runner_stats(&self) -> pulse_infra::jobs::RunnerStats {
        on_services!(self, job_runner => job_runner.stats())
    }

    pub fn enqueue_job(&self, job: Job) -> Result<pulse_infra::jobs::JobId, pulse_infra::jobs::JobStoreError> {
        self.jobs().enqueue(job)
    }

    pub fn dispatch<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        command: A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: pulse_core::Aggregate<Error = DomainError>,
        A::Event: pulse_events::Event + serde::Serialize + serde::de::DeserializeOwned,
    {
        match self {
            AppServices::InMemory { dispatcher, .. } => dispatcher.dispatch::<A>(
                tenant_id,
                aggregate_id,
                AGGREGATE_TYPE,
                command,
                make_aggregate,
            ),
            #[cfg(feature = "persistent")]
            AppServices::Persistent { dispatcher, .. } => dispatcher.dispatch::<A>(
                tenant_id,
                aggregate_id,
                AGGREGATE_TYPE,
                command,
                make_aggregate,
            ),
        }
    }

    pub fn registry_get(
        &self,
        tenant_id: TenantId,
        indicator_id: &IndicatorId,
    ) -> Option<IndicatorReadModel> {
        on_services!(self, registry => registry.get(tenant_id, indicator_id))
    }

    pub fn registry_list(&self, tenant_id: TenantId) -> Vec<IndicatorReadModel> {
        on_services!(self, registry => registry.list(tenant_id))
    }

    pub fn series_get(
        &self,
        tenant_id: TenantId,
        indicator_id: &IndicatorId,
    ) -> Option<ValueSeriesReadModel> {
        on_services!(self, series => series.get(tenant_id, indicator_id))
    }

    pub fn progress_get(
        &self,
        tenant_id: TenantId,
        indicator_id: &IndicatorId,
    ) -> Option<ProgressReadModel> {
        on_services!(self, progress => progress.get(tenant_id, indicator_id))
    }

    pub fn progress_list(&self, tenant_id: TenantId) -> Vec<ProgressReadModel> {
        on_services!(self, progress => progress.list(tenant_id))
    }

    pub fn rollup_get(
        &self,
        tenant_id: TenantId,
        indicator_id: &IndicatorId,
    ) -> Option<RollupSnapshot> {
        on_services!(self, rollups => rollups.get(tenant_id, indicator_id))
    }

    pub async fn query_events(
        &self,
        tenant_id: TenantId,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError> {
        on_services!(self, event_store => event_store.query_events(tenant_id, filter, pagination).await)
    }

    pub async fn get_aggregate_events(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        pagination: Option<Pagination>,
    ) -> Result<EventQueryResult, EventStoreError> {
        on_services!(self, event_store => {
            event_store
                .get_aggregate_events(tenant_id, aggregate_id, pagination)
                .await
        })
    }

    pub async fn get_event_by_id(
        &self,
        tenant_id: TenantId,
        event_id: uuid::Uuid,
    ) -> Result<Option<StoredEvent>, EventStoreError> {
        on_services!(self, event_store => event_store.get_event_by_id(tenant_id, event_id).await)
    }
}

/// SSE stream for a tenant (used by `/stream`).
pub fn tenant_sse_stream(
    services: Arc<AppServices>,
    tenant_id: TenantId,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.realtime_tx().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(m) if m.tenant_id == tenant_id => {
            let data = serde_json::to_string(&m.payload).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(m.topic).data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
