use crate::config::{ConfigConstraints, ConfigValue};
use crate::metrics::Percentiles;
use crate::model::{MetricPoint, Response, RunStatus};
use crate::script::ScriptOutcome;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Wire representation of a `ConfigValue` — the internal enum isn't
/// `Serialize` since it round-trips through the storage layer as a
/// separately-tagged `(value, type_tag)` pair instead.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConfigValueDto {
    Int(i64),
    Double(f64),
    Bool(bool),
    String(String),
}

impl ConfigValueDto {
    pub fn into_config_value(self) -> ConfigValue {
        match self {
            ConfigValueDto::Int(v) => ConfigValue::Int(v),
            ConfigValueDto::Double(v) => ConfigValue::Double(v),
            ConfigValueDto::Bool(v) => ConfigValue::Bool(v),
            ConfigValueDto::String(v) => ConfigValue::String(v),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigEntryDto {
    pub key: String,
    pub value: ConfigValueDto,
}

impl ConfigEntryDto {
    pub fn from_pair((key, value): (String, ConfigValue)) -> Self {
        let value = match value {
            ConfigValue::Int(v) => ConfigValueDto::Int(v),
            ConfigValue::Double(v) => ConfigValueDto::Double(v),
            ConfigValue::Bool(v) => ConfigValueDto::Bool(v),
            ConfigValue::String(v) => ConfigValueDto::String(v),
        };
        Self { key, value }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatchRequest {
    pub entries: Vec<ConfigPatchEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigConstraintsDto {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ConfigConstraintsDto {
    pub fn into_constraints(self) -> ConfigConstraints {
        ConfigConstraints { min: self.min, max: self.max }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatchEntry {
    pub key: String,
    pub value: ConfigValueDto,
    #[serde(default)]
    pub constraints: Option<ConfigConstraintsDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestExecutionResponse {
    pub response: Response,
    pub pre_request_script: Option<ScriptOutcome>,
    pub post_request_script: Option<ScriptOutcome>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResponse {
    pub run_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusResponse {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRunResponse {
    pub status: RunStatus,
    pub summary: crate::metrics::LiveStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReportResponse {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub percentiles: Option<Percentiles>,
    pub calculating: bool,
}

#[derive(Debug, Deserialize)]
pub struct TimeseriesQuery {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct TimeseriesResponse {
    pub points: Vec<MetricPoint>,
    pub total: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunListResponse {
    pub runs: Vec<crate::storage::RunSummaryRow>,
    pub total: u64,
}

/// Thin pass-through create bodies for the collections/requests/environments
/// surface — no validation beyond what serde's field types already enforce.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCollectionRequest {
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub variables: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestRequest {
    pub collection_id: Uuid,
    pub name: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: serde_json::Value,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub auth: Option<serde_json::Value>,
    #[serde(default)]
    pub scripts: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequestsQuery {
    pub collection_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironmentRequest {
    pub name: String,
    #[serde(default)]
    pub variables: serde_json::Value,
    #[serde(default)]
    pub active: bool,
}

/// `pm.globals` is a flat, engine-wide key/value store, unlike the
/// per-environment `variables` blob above.
#[derive(Debug, Serialize)]
pub struct GlobalEntryDto {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct SetGlobalRequest {
    pub value: String,
}

/// Parses the status string persisted by `Storage::get_run_status`, which
/// stores `RunStatus`'s `Display` form rather than the enum itself.
pub fn parse_run_status(raw: &str) -> Option<RunStatus> {
    match raw {
        "pending" => Some(RunStatus::Pending),
        "running" => Some(RunStatus::Running),
        "stopping" => Some(RunStatus::Stopping),
        "completed" => Some(RunStatus::Completed),
        "stopped" => Some(RunStatus::Stopped),
        "failed" => Some(RunStatus::Failed),
        _ => None,
    }
}
