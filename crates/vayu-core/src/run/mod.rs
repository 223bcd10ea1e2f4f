mod strategy;

pub use strategy::LoadStrategy;

use crate::error::VayuError;
use crate::eventloop::{EventLoop, EventLoopConfig};
use crate::metrics::{LiveStats, MetricsCollector};
use crate::model::{LoadStrategyConfig, MetricName, MetricPoint, RunConfig, RunStatus};
use crate::script::{ScriptPool, ScriptScopes};
use crate::storage::Storage;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const METRICS_TICK: Duration = Duration::from_millis(500);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub live_stats: LiveStats,
}

/// Lives from run start to terminal transition. Held by `RunManager`'s
/// registry; worker and metrics tasks get their own `Arc` clones, including
/// a clone of the registry itself so the worker can unregister the run on
/// its own terminal transition without routing back through the manager.
pub struct RunContext {
    pub id: Uuid,
    pub config: RunConfig,
    pub scopes: ScriptScopes,
    pub metrics: Arc<MetricsCollector>,
    pub should_stop: AtomicBool,
    is_running: AtomicBool,
    stop_claimed: AtomicBool,
    status_tx: watch::Sender<RunStatus>,
    stats_tx: watch::Sender<LiveStats>,
    started_at: chrono::DateTime<Utc>,
    registry: Arc<DashMap<Uuid, Arc<RunContext>>>,
}

impl RunContext {
    pub fn status(&self) -> RunStatus {
        *self.status_tx.borrow()
    }

    pub fn live_stats(&self) -> LiveStats {
        self.stats_tx.borrow().clone()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<LiveStats> {
        self.stats_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RunStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn started_at(&self) -> chrono::DateTime<Utc> {
        self.started_at
    }
}

pub struct RunManager {
    storage: Storage,
    script_pool: Option<Arc<ScriptPool>>,
    runs: Arc<DashMap<Uuid, Arc<RunContext>>>,
}

impl RunManager {
    pub fn new(storage: Storage, script_pool: Option<Arc<ScriptPool>>) -> Self {
        Self {
            storage,
            script_pool,
            runs: Arc::new(DashMap::new()),
        }
    }

    /// Allocates a `RunContext`, registers it, persists the initial run row,
    /// and spawns the worker and metrics tasks.
    pub async fn start_run(&self, config: RunConfig) -> Result<Uuid, VayuError> {
        let run_id = Uuid::new_v4();
        let snapshot = serde_json::to_value(&config)?;
        self.storage.create_run(run_id, strategy_type_tag(&config.strategy), snapshot).await?;

        let target_rps = match &config.strategy {
            LoadStrategyConfig::ConstantRps { target_rps, .. } => *target_rps,
            _ => 0.0,
        };
        let event_loop = Arc::new(EventLoop::new(EventLoopConfig { target_rps, ..Default::default() }));
        let metrics = Arc::new(MetricsCollector::with_sample_rate(run_id, config.sample_rate as u64));
        let scopes = ScriptScopes {
            environment: config.environment.clone().unwrap_or_default(),
            ..Default::default()
        };

        let (status_tx, _) = watch::channel(RunStatus::Pending);
        let (stats_tx, _) = watch::channel(metrics.live_stats());

        let ctx = Arc::new(RunContext {
            id: run_id,
            config: config.clone(),
            scopes,
            metrics: Arc::clone(&metrics),
            should_stop: AtomicBool::new(false),
            is_running: AtomicBool::new(true),
            stop_claimed: AtomicBool::new(false),
            status_tx,
            stats_tx,
            started_at: Utc::now(),
            registry: Arc::clone(&self.runs),
        });

        self.runs.insert(run_id, Arc::clone(&ctx));
        self.storage.update_run_status(run_id, RunStatus::Running, None).await?;
        let _ = ctx.status_tx.send(RunStatus::Running);

        let strategy = LoadStrategy::from_config(&config.strategy);
        let script_pool = self.script_pool.clone();
        let storage = self.storage.clone();
        let worker_ctx = Arc::clone(&ctx);
        let worker_event_loop = Arc::clone(&event_loop);
        tokio::spawn(async move {
            strategy.run(Arc::clone(&worker_ctx), worker_event_loop, script_pool).await;
            finalize_run(worker_ctx, storage).await;
        });

        let metrics_ctx = Arc::clone(&ctx);
        let metrics_storage = self.storage.clone();
        tokio::spawn(metrics_task(metrics_ctx, metrics_storage));

        Ok(run_id)
    }

    pub fn get_run(&self, run_id: Uuid) -> Option<Arc<RunContext>> {
        self.runs.get(&run_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn active_count(&self) -> usize {
        self.runs.len()
    }

    pub fn get_all_active_runs(&self) -> Vec<Uuid> {
        self.runs.iter().map(|entry| *entry.key()).collect()
    }

    /// Idempotent: the first caller to win `stop_claimed`'s compare-exchange
    /// sets `should_stop` and waits (bounded) for the worker to drain;
    /// everyone else — the original caller included, on a re-entrant call —
    /// just waits for the same terminal transition and reads its summary.
    pub async fn stop_run(&self, run_id: Uuid) -> Result<RunSummary, VayuError> {
        let ctx = self.get_run(run_id).ok_or(VayuError::RunNotFound(run_id))?;

        if ctx.stop_claimed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            ctx.should_stop.store(true, Ordering::Release);
            let _ = ctx.status_tx.send(RunStatus::Stopping);
        }

        let mut status_rx = ctx.status_tx.subscribe();
        let _ = tokio::time::timeout(STOP_GRACE_PERIOD, async {
            while !status_rx.borrow().is_terminal() {
                if status_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        Ok(RunSummary {
            run_id,
            status: ctx.status(),
            live_stats: ctx.live_stats(),
        })
    }
}

fn strategy_type_tag(strategy: &LoadStrategyConfig) -> &'static str {
    match strategy {
        LoadStrategyConfig::ConstantRps { .. } => "constant_rps",
        LoadStrategyConfig::Iterations { .. } => "iterations",
        LoadStrategyConfig::RampUp { .. } => "ramp_up",
    }
}

/// Drains remaining metrics, flushes to storage, determines the terminal
/// status (`stopped` if an external stop was observed, `completed`
/// otherwise — the strategy loop returns for both reasons, so this is the
/// only place that needs to tell them apart), persists it, and unregisters
/// the run.
async fn finalize_run(ctx: Arc<RunContext>, storage: Storage) {
    let _ = ctx.status_tx.send(RunStatus::Stopping);
    ctx.is_running.store(false, Ordering::Release);

    if let Err(e) = ctx.metrics.flush(&storage).await {
        tracing::error!(run_id = %ctx.id, error = %e, "failed to flush run metrics");
    }

    let final_status = if ctx.should_stop.load(Ordering::Acquire) { RunStatus::Stopped } else { RunStatus::Completed };

    if let Err(e) = storage.update_run_status(ctx.id, final_status, Some(Utc::now())).await {
        tracing::error!(run_id = %ctx.id, error = %e, "failed to persist terminal run status");
    }

    let _ = ctx.status_tx.send(final_status);
    ctx.registry.remove(&ctx.id);
}

/// Periodically snapshots live stats for SSE subscribers and writes one
/// metric row per tracked metric name. Exits once `finalize_run` has
/// cleared `is_running`.
async fn metrics_task(ctx: Arc<RunContext>, storage: Storage) {
    let mut ticker = tokio::time::interval(METRICS_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let stats = ctx.metrics.live_stats();
        let _ = ctx.stats_tx.send(stats.clone());

        let points = [
            (MetricName::RequestsCompleted, stats.requests_completed as f64),
            (MetricName::RequestsFailed, stats.requests_failed as f64),
            (MetricName::CurrentRps, stats.current_rps),
            (MetricName::AvgLatencyMs, stats.avg_latency_ms),
            (MetricName::CurrentConcurrency, stats.current_concurrency as f64),
            (MetricName::Throughput, stats.throughput),
            (MetricName::SendRate, stats.send_rate),
        ];
        for (name, value) in points {
            let point = MetricPoint {
                run_id: ctx.id,
                timestamp: Utc::now(),
                name,
                value,
                labels: None,
            };
            if let Err(e) = storage.append_metric_point(point).await {
                tracing::warn!(run_id = %ctx.id, error = %e, "failed to persist metric point");
            }
        }

        if !ctx.is_running() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BodyMode, Headers, Method, RedirectPolicy, Request};

    fn iterations_config(iterations: u64, concurrency: u32, url: String) -> RunConfig {
        RunConfig {
            strategy: LoadStrategyConfig::Iterations { iterations, concurrency },
            request: Request {
                method: Method::Get,
                url,
                headers: Headers::new(),
                body: BodyMode::None,
                timeout_ms: 2_000,
                redirect: RedirectPolicy::default(),
                verify_ssl: true,
                pre_request_script: None,
                post_request_script: None,
            },
            sample_rate: 100,
            environment: None,
        }
    }

    async fn spawn_echo_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let body = b"{\"ok\":true}";
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(resp.as_bytes()).await;
                    let _ = socket.write_all(body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/echo")
    }

    #[tokio::test]
    async fn start_run_registers_and_transitions_to_completed() {
        let url = spawn_echo_server().await;
        let storage = Storage::open_in_memory().unwrap();
        let manager = RunManager::new(storage, None);

        let run_id = manager.start_run(iterations_config(5, 2, url)).await.unwrap();
        assert!(manager.get_run(run_id).is_some());

        let ctx = manager.get_run(run_id).unwrap();
        let mut status_rx = ctx.subscribe_status();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !status_rx.borrow().is_terminal() {
                status_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(*status_rx.borrow(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn stop_run_is_idempotent_across_concurrent_callers() {
        let url = spawn_echo_server().await;
        let storage = Storage::open_in_memory().unwrap();
        let manager = Arc::new(RunManager::new(storage, None));

        let run_id = manager.start_run(iterations_config(100_000, 4, url)).await.unwrap();

        let m1 = Arc::clone(&manager);
        let m2 = Arc::clone(&manager);
        let (a, b) = tokio::join!(
            tokio::spawn(async move { m1.stop_run(run_id).await }),
            tokio::spawn(async move { m2.stop_run(run_id).await }),
        );
        let summary_a = a.unwrap().unwrap();
        let summary_b = b.unwrap().unwrap();
        assert_eq!(summary_a.status, RunStatus::Stopped);
        assert_eq!(summary_b.status, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_run_unknown_id_errors() {
        let storage = Storage::open_in_memory().unwrap();
        let manager = RunManager::new(storage, None);
        let err = manager.stop_run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, VayuError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn active_count_drops_after_completion() {
        let url = spawn_echo_server().await;
        let storage = Storage::open_in_memory().unwrap();
        let manager = RunManager::new(storage, None);
        let run_id = manager.start_run(iterations_config(3, 1, url)).await.unwrap();
        assert_eq!(manager.active_count(), 1);

        let ctx = manager.get_run(run_id).unwrap();
        let mut status_rx = ctx.subscribe_status();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !status_rx.borrow().is_terminal() {
                status_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(manager.active_count(), 0);
        assert!(manager.get_run(run_id).is_none());
    }
}
