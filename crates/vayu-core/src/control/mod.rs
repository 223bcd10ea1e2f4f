mod dto;

use crate::config::Config;
use crate::error::VayuError;
use crate::eventloop::HttpTransport;
use crate::model::{Request as EngineRequest, RunConfig};
use crate::run::RunManager;
use crate::script::{ScriptOutcome, ScriptPool, ScriptScopes};
use crate::storage::{CollectionRecord, EnvironmentRecord, Pagination, RequestRecord, Storage};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use dto::*;
use futures_util::stream::Stream;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub config: Arc<Config>,
    pub run_manager: Arc<RunManager>,
    pub script_pool: Option<Arc<ScriptPool>>,
    pub transport: Arc<HttpTransport>,
}

pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new().route("/health", get(health));

    let config_routes = Router::new().route("/config", get(get_config).patch(patch_config));

    let request_routes = Router::new().route("/request", post(execute_request));

    let run_routes = Router::new()
        .route("/run", get(list_runs).post(start_run))
        .route("/run/{id}", get(get_run))
        .route("/run/{id}/stop", post(stop_run))
        .route("/run/{id}/report", get(run_report))
        .route("/run/{id}/stats", get(run_stats))
        .route("/run/{id}/stream", get(run_stream))
        .route("/run/{id}/timeseries", get(run_timeseries));

    let collection_routes = Router::new()
        .route("/collections", get(list_collections).post(create_collection))
        .route("/collections/{id}", get(get_collection).delete(delete_collection));

    let saved_request_routes = Router::new()
        .route("/requests", get(list_saved_requests).post(create_saved_request))
        .route("/requests/{id}", get(get_saved_request).delete(delete_saved_request));

    let environment_routes = Router::new()
        .route("/environments", get(list_environments).post(create_environment))
        .route("/environments/{id}", get(get_environment).delete(delete_environment));

    let global_routes = Router::new()
        .route("/globals", get(list_globals))
        .route("/globals/{key}", axum::routing::put(set_global).delete(delete_global));

    Router::new()
        .merge(health_routes)
        .merge(config_routes)
        .merge(request_routes)
        .merge(run_routes)
        .merge(collection_routes)
        .merge(saved_request_routes)
        .merge(environment_routes)
        .merge(global_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_config(State(state): State<AppState>) -> Json<Vec<ConfigEntryDto>> {
    Json(state.config.list().into_iter().map(ConfigEntryDto::from_pair).collect())
}

async fn patch_config(State(state): State<AppState>, Json(body): Json<ConfigPatchRequest>) -> Result<Json<Vec<ConfigEntryDto>>, VayuError> {
    for entry in body.entries {
        let constraints = entry.constraints.map(|c| c.into_constraints());
        state.config.set(&entry.key, entry.value.into_config_value(), constraints).await?;
    }
    Ok(Json(state.config.list().into_iter().map(ConfigEntryDto::from_pair).collect()))
}

async fn execute_request(State(state): State<AppState>, Json(request): Json<EngineRequest>) -> Result<Json<RequestExecutionResponse>, VayuError> {
    let mut request = request;
    let mut pre_outcome: Option<ScriptOutcome> = None;

    if let (Some(pool), Some(script)) = (&state.script_pool, request.pre_request_script.clone()) {
        let (mutated, outcome) = pool.execute_prerequest(&script, &request, &ScriptScopes::default()).await?;
        request = mutated;
        pre_outcome = Some(outcome);
    }

    let request_id = Uuid::new_v4();
    let response = state.transport.send(&request, request_id).await?;

    let post_outcome = if let (Some(pool), Some(script)) = (&state.script_pool, request.post_request_script.clone()) {
        Some(pool.execute_test(&script, &request, &response, &ScriptScopes::default()).await?)
    } else {
        None
    };

    Ok(Json(RequestExecutionResponse { response, pre_request_script: pre_outcome, post_request_script: post_outcome }))
}

async fn list_runs(State(state): State<AppState>, Query(params): Query<TimeseriesQuery>) -> Result<Json<RunListResponse>, VayuError> {
    let pagination = Pagination { offset: params.offset.unwrap_or(0), limit: params.limit.unwrap_or(100) };
    let page = state.storage.list_runs(pagination).await?;
    Ok(Json(RunListResponse { runs: page.runs, total: page.total }))
}

async fn start_run(State(state): State<AppState>, Json(config): Json<RunConfig>) -> Result<Json<StartRunResponse>, VayuError> {
    let run_id = state.run_manager.start_run(config).await?;
    Ok(Json(StartRunResponse { run_id, status: "starting".to_string() }))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<RunStatusResponse>, VayuError> {
    match state.run_manager.get_run(id) {
        Some(ctx) => Ok(Json(RunStatusResponse {
            run_id: id,
            status: ctx.status(),
            started_at: ctx.started_at(),
        })),
        None => {
            let raw = state.storage.get_run_status(id).await?.ok_or(VayuError::RunNotFound(id))?;
            Ok(Json(RunStatusResponse {
                run_id: id,
                status: parse_run_status(&raw).unwrap_or(crate::model::RunStatus::Failed),
                started_at: chrono::Utc::now(),
            }))
        }
    }
}

async fn stop_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<StopRunResponse>, VayuError> {
    let summary = state.run_manager.stop_run(id).await?;
    Ok(Json(StopRunResponse { status: summary.status, summary: summary.live_stats }))
}

async fn run_report(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<RunReportResponse>, VayuError> {
    if let Some(ctx) = state.run_manager.get_run(id) {
        let status = ctx.status();
        if !status.is_terminal() {
            return Ok(Json(RunReportResponse { run_id: id, status, percentiles: None, calculating: true }));
        }
        return Ok(Json(RunReportResponse {
            run_id: id,
            status,
            percentiles: Some(ctx.metrics.calculate_percentiles()),
            calculating: false,
        }));
    }

    let raw = state.storage.get_run_status(id).await?.ok_or(VayuError::RunNotFound(id))?;
    let status = parse_run_status(&raw).unwrap_or(crate::model::RunStatus::Failed);
    Ok(Json(RunReportResponse { run_id: id, status, percentiles: None, calculating: false }))
}

async fn run_stats(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<crate::metrics::LiveStats>, VayuError> {
    let ctx = state.run_manager.get_run(id).ok_or(VayuError::RunNotFound(id))?;
    Ok(Json(ctx.live_stats()))
}

/// Emits one `stats` event per tick or change, closing the stream after the
/// event that observes a terminal status — so subscribers always see the
/// final snapshot before the connection ends.
async fn run_stream(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, VayuError> {
    let ctx = state.run_manager.get_run(id).ok_or(VayuError::RunNotFound(id))?;
    let stats_rx = ctx.subscribe_stats();
    let status_rx = ctx.subscribe_status();

    let stream = futures_util::stream::unfold((stats_rx, status_rx, false), |(mut stats_rx, mut status_rx, done)| async move {
        if done {
            return None;
        }

        let stats = stats_rx.borrow_and_update().clone();
        let payload = serde_json::to_string(&stats).unwrap_or_default();
        let event = Event::default().event("stats").data(payload);

        if status_rx.borrow().is_terminal() {
            return Some((Ok(event), (stats_rx, status_rx, true)));
        }

        tokio::select! {
            _ = stats_rx.changed() => {}
            _ = status_rx.changed() => {}
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        Some((Ok(event), (stats_rx, status_rx, false)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn run_timeseries(State(state): State<AppState>, Path(id): Path<Uuid>, Query(params): Query<TimeseriesQuery>) -> Result<Json<TimeseriesResponse>, VayuError> {
    let pagination = Pagination { offset: params.offset.unwrap_or(0), limit: params.limit.unwrap_or(100) };
    let page = state.storage.list_metric_points(id, pagination).await?;
    Ok(Json(TimeseriesResponse { points: page.points, total: page.total }))
}

// Collections/requests/environments: thin pass-through over Storage, no
// business-logic validation beyond what the DTOs' field types enforce.

async fn list_collections(State(state): State<AppState>) -> Result<Json<Vec<CollectionRecord>>, VayuError> {
    Ok(Json(state.storage.list_collections().await?))
}

async fn create_collection(State(state): State<AppState>, Json(body): Json<CreateCollectionRequest>) -> Result<Json<CollectionRecord>, VayuError> {
    let record = state.storage.create_collection(body.name, body.parent_id, body.variables).await?;
    Ok(Json(record))
}

async fn get_collection(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<CollectionRecord>, VayuError> {
    let record = state.storage.get_collection(id).await?.ok_or_else(|| VayuError::NotFound(format!("collection {id}")))?;
    Ok(Json(record))
}

async fn delete_collection(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<axum::http::StatusCode, VayuError> {
    state.storage.delete_collection(id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn list_saved_requests(State(state): State<AppState>, Query(params): Query<ListRequestsQuery>) -> Result<Json<Vec<RequestRecord>>, VayuError> {
    Ok(Json(state.storage.list_requests(params.collection_id).await?))
}

async fn create_saved_request(State(state): State<AppState>, Json(body): Json<CreateRequestRequest>) -> Result<Json<RequestRecord>, VayuError> {
    let record = RequestRecord {
        id: Uuid::new_v4(),
        collection_id: body.collection_id,
        name: body.name,
        method: body.method,
        url: body.url,
        headers: body.headers,
        body: body.body,
        auth: body.auth,
        scripts: body.scripts,
        created_at: chrono::Utc::now(),
    };
    let record = state.storage.create_request(record).await?;
    Ok(Json(record))
}

async fn get_saved_request(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<RequestRecord>, VayuError> {
    let record = state.storage.get_request(id).await?.ok_or_else(|| VayuError::NotFound(format!("request {id}")))?;
    Ok(Json(record))
}

async fn delete_saved_request(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<axum::http::StatusCode, VayuError> {
    state.storage.delete_request(id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn list_environments(State(state): State<AppState>) -> Result<Json<Vec<EnvironmentRecord>>, VayuError> {
    Ok(Json(state.storage.list_environments().await?))
}

async fn create_environment(State(state): State<AppState>, Json(body): Json<CreateEnvironmentRequest>) -> Result<Json<EnvironmentRecord>, VayuError> {
    let record = state.storage.create_environment(body.name, body.variables, body.active).await?;
    Ok(Json(record))
}

async fn get_environment(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<EnvironmentRecord>, VayuError> {
    let record = state.storage.get_environment(id).await?.ok_or_else(|| VayuError::NotFound(format!("environment {id}")))?;
    Ok(Json(record))
}

async fn delete_environment(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<axum::http::StatusCode, VayuError> {
    state.storage.delete_environment(id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn list_globals(State(state): State<AppState>) -> Result<Json<Vec<GlobalEntryDto>>, VayuError> {
    let entries = state.storage.list_globals().await?.into_iter().map(|(key, value)| GlobalEntryDto { key, value }).collect();
    Ok(Json(entries))
}

async fn set_global(State(state): State<AppState>, Path(key): Path<String>, Json(body): Json<SetGlobalRequest>) -> Result<Json<GlobalEntryDto>, VayuError> {
    state.storage.set_global(key.clone(), body.value.clone()).await?;
    Ok(Json(GlobalEntryDto { key, value: body.value }))
}

async fn delete_global(State(state): State<AppState>, Path(key): Path<String>) -> Result<axum::http::StatusCode, VayuError> {
    state.storage.delete_global(key).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
