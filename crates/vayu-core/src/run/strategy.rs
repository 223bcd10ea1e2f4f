use super::RunContext;
use crate::eventloop::EventLoop;
use crate::metrics::MetricsCollector;
use crate::model::{ErrorCode, LoadStrategyConfig, Request, ResponseSample};
use crate::script::{ScriptPool, ScriptScopes};
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Caps outstanding submissions for the constant-rate strategy so the
/// dispatch loop doesn't spawn unboundedly far ahead of what the event
/// loop's rate limiter is actually willing to send.
const CONSTANT_MAX_OUTSTANDING: usize = 4096;

#[derive(Debug, Clone)]
pub enum LoadStrategy {
    Constant { target_rps: f64, duration: Duration },
    Iterations { iterations: u64, concurrency: u32 },
    RampUp {
        start_concurrency: u32,
        target_concurrency: u32,
        ramp_up_duration: Duration,
        duration: Duration,
    },
}

impl LoadStrategy {
    pub fn from_config(config: &LoadStrategyConfig) -> Self {
        match config {
            LoadStrategyConfig::ConstantRps { target_rps, duration_secs } => LoadStrategy::Constant {
                target_rps: *target_rps,
                duration: Duration::from_secs(*duration_secs),
            },
            LoadStrategyConfig::Iterations { iterations, concurrency } => LoadStrategy::Iterations {
                iterations: *iterations,
                concurrency: *concurrency,
            },
            LoadStrategyConfig::RampUp {
                start_concurrency,
                target_concurrency,
                ramp_up_duration_secs,
                duration_secs,
            } => LoadStrategy::RampUp {
                start_concurrency: *start_concurrency,
                target_concurrency: *target_concurrency,
                ramp_up_duration: Duration::from_secs(*ramp_up_duration_secs),
                duration: Duration::from_secs(*duration_secs),
            },
        }
    }

    /// Single dispatch point; each variant drives its own loop inside the
    /// worker task until exhausted or `ctx.should_stop` is observed.
    pub async fn run(self, ctx: Arc<RunContext>, event_loop: Arc<EventLoop>, script_pool: Option<Arc<ScriptPool>>) {
        match self {
            LoadStrategy::Constant { duration, .. } => run_constant(ctx, event_loop, script_pool, duration).await,
            LoadStrategy::Iterations { iterations, concurrency } => {
                run_iterations(ctx, event_loop, script_pool, iterations, concurrency).await
            }
            LoadStrategy::RampUp { start_concurrency, target_concurrency, ramp_up_duration, duration } => {
                run_ramp_up(ctx, event_loop, script_pool, start_concurrency, target_concurrency, ramp_up_duration, duration).await
            }
        }
    }
}

/// Submits one request, applying the pre-request script (if any) before
/// dispatch and the post-request test script (if any) against the
/// response, then records the outcome into the run's metrics collector.
async fn run_one_request(metrics: Arc<MetricsCollector>, event_loop: Arc<EventLoop>, script_pool: Option<Arc<ScriptPool>>, request: Request, scopes: ScriptScopes) {
    metrics.request_started();

    let mut request = request;
    if let Some(pool) = &script_pool {
        if let Some(script) = request.pre_request_script.clone() {
            if let Ok((mutated, _outcome)) = pool.execute_prerequest(&script, &request, &scopes).await {
                request = mutated;
            }
        }
    }

    let post_request_script = request.post_request_script.clone();
    let start = Instant::now();

    let outcome = match event_loop.submit_async(request.clone()).await {
        Ok((_, rx)) => rx.await.unwrap_or(Err(crate::error::VayuError::Cancelled)),
        Err(e) => Err(e),
    };
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    match outcome {
        Ok(response) => {
            if let (Some(pool), Some(script)) = (&script_pool, post_request_script) {
                let _ = pool.execute_test(&script, &request, &response, &scopes).await;
            }
            let sample = ResponseSample {
                status_code: response.status_code,
                headers: response.headers.clone(),
                body: String::from_utf8_lossy(&response.body).into_owned(),
                latency_ms,
                timestamp: Utc::now(),
            };
            metrics.record_success(response.status_code, latency_ms, Some(sample));
        }
        Err(err) => {
            let code = ErrorCode::from(&err);
            metrics.record_error(code, err.to_string(), latency_ms, None);
        }
    }
}

async fn run_constant(ctx: Arc<RunContext>, event_loop: Arc<EventLoop>, script_pool: Option<Arc<ScriptPool>>, duration: Duration) {
    let semaphore = Arc::new(Semaphore::new(CONSTANT_MAX_OUTSTANDING));
    let mut handles = JoinSet::new();
    let start = Instant::now();

    while start.elapsed() < duration && !ctx.should_stop.load(Ordering::Acquire) {
        let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
            tokio::time::sleep(Duration::from_millis(1)).await;
            continue;
        };
        let metrics = Arc::clone(&ctx.metrics);
        let event_loop = Arc::clone(&event_loop);
        let script_pool = script_pool.clone();
        let request = ctx.config.request.clone();
        let scopes = ctx.scopes.clone();
        handles.spawn(async move {
            run_one_request(metrics, event_loop, script_pool, request, scopes).await;
            drop(permit);
        });
    }

    while handles.join_next().await.is_some() {}
}

async fn run_iterations(ctx: Arc<RunContext>, event_loop: Arc<EventLoop>, script_pool: Option<Arc<ScriptPool>>, iterations: u64, concurrency: u32) {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1) as usize));
    let mut handles = JoinSet::new();

    for _ in 0..iterations {
        if ctx.should_stop.load(Ordering::Acquire) {
            break;
        }
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else { break };
        let metrics = Arc::clone(&ctx.metrics);
        let event_loop = Arc::clone(&event_loop);
        let script_pool = script_pool.clone();
        let request = ctx.config.request.clone();
        let scopes = ctx.scopes.clone();
        handles.spawn(async move {
            run_one_request(metrics, event_loop, script_pool, request, scopes).await;
            drop(permit);
        });
    }

    while handles.join_next().await.is_some() {}
}

/// Concurrency grows linearly from `start_concurrency` to
/// `target_concurrency` over `ramp_up_duration`, then holds for the
/// remainder of `duration`. Permits are only ever added, never revoked —
/// matching the spec's description of a monotonic ramp.
#[allow(clippy::too_many_arguments)]
async fn run_ramp_up(
    ctx: Arc<RunContext>,
    event_loop: Arc<EventLoop>,
    script_pool: Option<Arc<ScriptPool>>,
    start_concurrency: u32,
    target_concurrency: u32,
    ramp_up_duration: Duration,
    duration: Duration,
) {
    let initial = start_concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(initial as usize));
    let mut granted = initial;
    let mut handles = JoinSet::new();
    let start = Instant::now();

    while start.elapsed() < duration && !ctx.should_stop.load(Ordering::Acquire) {
        let elapsed = start.elapsed();
        let desired = if elapsed < ramp_up_duration && ramp_up_duration > Duration::ZERO {
            let t = elapsed.as_secs_f64() / ramp_up_duration.as_secs_f64();
            (start_concurrency as f64 + t * (target_concurrency as f64 - start_concurrency as f64)) as u32
        } else {
            target_concurrency
        };
        if desired > granted {
            semaphore.add_permits((desired - granted) as usize);
            granted = desired;
        }

        let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        };
        let metrics = Arc::clone(&ctx.metrics);
        let event_loop = Arc::clone(&event_loop);
        let script_pool = script_pool.clone();
        let request = ctx.config.request.clone();
        let scopes = ctx.scopes.clone();
        handles.spawn(async move {
            run_one_request(metrics, event_loop, script_pool, request, scopes).await;
            drop(permit);
        });
    }

    while handles.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_maps_each_variant() {
        let constant = LoadStrategy::from_config(&LoadStrategyConfig::ConstantRps { target_rps: 500.0, duration_secs: 30 });
        assert!(matches!(constant, LoadStrategy::Constant { target_rps, .. } if target_rps == 500.0));

        let iterations = LoadStrategy::from_config(&LoadStrategyConfig::Iterations { iterations: 100, concurrency: 10 });
        assert!(matches!(iterations, LoadStrategy::Iterations { iterations: 100, concurrency: 10 }));

        let ramp = LoadStrategy::from_config(&LoadStrategyConfig::RampUp {
            start_concurrency: 1,
            target_concurrency: 50,
            ramp_up_duration_secs: 10,
            duration_secs: 60,
        });
        assert!(matches!(ramp, LoadStrategy::RampUp { start_concurrency: 1, target_concurrency: 50, .. }));
    }
}
