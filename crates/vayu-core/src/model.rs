use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Method
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Method {
    type Err = crate::error::VayuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            other => Err(crate::error::VayuError::InvalidMethod(other.to_string())),
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

// ---------------------------------------------------------------------------
// Headers — ordered, case-insensitive lookup, insertion order on the wire.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(IndexMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Case-insensitive lookup, as headers are on the wire.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// BodyMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum BodyMode {
    None,
    Text(String),
    Json(serde_json::Value),
    #[serde(rename = "form-urlencoded")]
    FormUrlEncoded(Vec<(String, String)>),
    #[serde(rename = "form-multipart")]
    FormMultipart(Vec<MultipartField>),
    /// Base64-encoded on the wire; decoded before dispatch.
    Binary(String),
    GraphQl {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variables: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_name: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MultipartField {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl BodyMode {
    pub fn decode_binary(&self) -> Result<Option<Vec<u8>>, crate::error::VayuError> {
        use base64::Engine;
        match self {
            BodyMode::Binary(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|e| crate::error::VayuError::Validation(format!("invalid base64 body: {e}"))),
            _ => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// RedirectPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectPolicy {
    pub follow: bool,
    pub max: u32,
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self { follow: true, max: 10 }
    }
}

// ---------------------------------------------------------------------------
// Request — immutable once handed to the event loop.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: Method,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default = "default_body_mode")]
    pub body: BodyMode,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub redirect: RedirectPolicy,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_request_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_request_script: Option<String>,
}

fn default_body_mode() -> BodyMode {
    BodyMode::None
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// TimingBreakdown / Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingBreakdown {
    pub dns_ms: f64,
    pub connect_ms: f64,
    pub tls_ms: f64,
    pub first_byte_ms: f64,
    pub download_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status_code: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(with = "serde_bytes_as_base64")]
    pub body: Vec<u8>,
    pub body_size: usize,
    pub timing: TimingBreakdown,
    pub request_id: Uuid,
}

/// Encodes a raw response body as base64 on the wire; `serde_bytes` would
/// otherwise fall back to a JSON array of integers.
mod serde_bytes_as_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode — spec §7 taxonomy, as recorded alongside a result.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidUrl,
    InvalidMethod,
    Timeout,
    ConnectionFailed,
    DnsError,
    SslError,
    Cancelled,
    ScriptError,
    EngineError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", serde_json::to_value(self).unwrap().as_str().unwrap())
    }
}

impl From<&crate::error::VayuError> for ErrorCode {
    fn from(err: &crate::error::VayuError) -> Self {
        use crate::error::VayuError as E;
        match err {
            E::InvalidUrl(_) => ErrorCode::InvalidUrl,
            E::InvalidMethod(_) => ErrorCode::InvalidMethod,
            E::Timeout(_) => ErrorCode::Timeout,
            E::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            E::DnsError(_) => ErrorCode::DnsError,
            E::SslError(_) => ErrorCode::SslError,
            E::Cancelled => ErrorCode::Cancelled,
            E::Script(_) => ErrorCode::ScriptError,
            _ => ErrorCode::EngineError,
        }
    }
}

// ---------------------------------------------------------------------------
// ResultRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<serde_json::Value>,
}

impl ResultRecord {
    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }
}

// ---------------------------------------------------------------------------
// ResponseSample
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSample {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    pub body: String,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Metric point
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    RequestsCompleted,
    RequestsFailed,
    CurrentRps,
    AvgLatencyMs,
    CurrentConcurrency,
    Throughput,
    SendRate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPoint {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub name: MetricName,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// RunStatus — the state machine's states (§4.F).
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Stopping,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Stopped | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Stopping => "stopping",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// RunConfig — the load-test request a caller submits to POST /run.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LoadStrategyConfig {
    ConstantRps {
        target_rps: f64,
        duration_secs: u64,
    },
    Iterations {
        iterations: u64,
        concurrency: u32,
    },
    RampUp {
        start_concurrency: u32,
        target_concurrency: u32,
        ramp_up_duration_secs: u64,
        duration_secs: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(flatten)]
    pub strategy: LoadStrategyConfig,
    pub request: Request,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
}

fn default_sample_rate() -> u32 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_display_and_parse_roundtrip() {
        for m in [
            Method::Get,
            Method::Post,
            Method::Put,
            Method::Patch,
            Method::Delete,
            Method::Head,
            Method::Options,
        ] {
            let parsed: Method = m.to_string().parse().unwrap();
            assert_eq!(parsed, m);
        }
    }

    #[test]
    fn method_parse_rejects_unknown_token() {
        let err = "TRACE".parse::<Method>().unwrap_err();
        assert!(matches!(err, crate::error::VayuError::InvalidMethod(_)));
    }

    #[test]
    fn method_serializes_screaming_snake_case() {
        assert_eq!(serde_json::to_string(&Method::Patch).unwrap(), "\"PATCH\"");
    }

    #[test]
    fn headers_lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.insert("Content-Type", "application/json");
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn headers_preserve_insertion_order_on_wire() {
        let mut h = Headers::new();
        h.insert("Z-First", "1");
        h.insert("A-Second", "2");
        let json = serde_json::to_string(&h).unwrap();
        assert!(json.find("Z-First").unwrap() < json.find("A-Second").unwrap());
    }

    #[test]
    fn body_mode_serde_roundtrip_json() {
        let body = BodyMode::Json(serde_json::json!({"a": 1}));
        let json = serde_json::to_string(&body).unwrap();
        let parsed: BodyMode = serde_json::from_str(&json).unwrap();
        matches!(parsed, BodyMode::Json(_));
    }

    #[test]
    fn body_mode_binary_decodes_base64() {
        let body = BodyMode::Binary(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            b"hello",
        ));
        let decoded = body.decode_binary().unwrap().unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn body_mode_binary_rejects_invalid_base64() {
        let body = BodyMode::Binary("not valid base64!!".to_string());
        assert!(body.decode_binary().is_err());
    }

    #[test]
    fn body_mode_non_binary_decode_is_none() {
        assert!(BodyMode::None.decode_binary().unwrap().is_none());
        assert!(BodyMode::Text("x".into()).decode_binary().unwrap().is_none());
    }

    #[test]
    fn request_defaults_apply_on_deserialize() {
        let json = r#"{"method":"GET","url":"http://example.com"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(req.timeout_ms, 30_000);
        assert!(req.verify_ssl);
        assert!(req.redirect.follow);
        assert_eq!(req.redirect.max, 10);
        assert!(matches!(req.body, BodyMode::None));
    }

    #[test]
    fn response_body_roundtrips_as_base64_on_wire() {
        let resp = Response {
            status_code: 200,
            status_text: "OK".to_string(),
            headers: Headers::new(),
            body: b"{\"ok\":true}".to_vec(),
            body_size: 11,
            timing: TimingBreakdown::default(),
            request_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.body, resp.body);
    }

    #[test]
    fn error_code_from_vayu_error_maps_known_kinds() {
        let err = crate::error::VayuError::Timeout(500);
        assert_eq!(ErrorCode::from(&err), ErrorCode::Timeout);
        let err = crate::error::VayuError::Cancelled;
        assert_eq!(ErrorCode::from(&err), ErrorCode::Cancelled);
    }

    #[test]
    fn error_code_unmatched_kinds_fall_back_to_engine_error() {
        let err = crate::error::VayuError::Internal("boom".into());
        assert_eq!(ErrorCode::from(&err), ErrorCode::EngineError);
    }

    #[test]
    fn result_record_is_error_reflects_error_code() {
        let ok = ResultRecord {
            timestamp: Utc::now(),
            status_code: Some(200),
            latency_ms: 12.0,
            error_code: None,
            error_message: None,
            trace: None,
        };
        assert!(!ok.is_error());

        let failed = ResultRecord {
            error_code: Some(ErrorCode::Timeout),
            ..ok
        };
        assert!(failed.is_error());
    }

    #[test]
    fn run_status_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Stopping.is_terminal());
    }

    #[test]
    fn run_status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&RunStatus::Stopping).unwrap(), "\"stopping\"");
    }

    #[test]
    fn load_strategy_config_serde_roundtrip_each_variant() {
        let strategies = vec![
            LoadStrategyConfig::ConstantRps { target_rps: 1000.0, duration_secs: 10 },
            LoadStrategyConfig::Iterations { iterations: 500, concurrency: 50 },
            LoadStrategyConfig::RampUp {
                start_concurrency: 10,
                target_concurrency: 200,
                ramp_up_duration_secs: 20,
                duration_secs: 40,
            },
        ];
        for s in strategies {
            let json = serde_json::to_string(&s).unwrap();
            let _parsed: LoadStrategyConfig = serde_json::from_str(&json).unwrap();
        }
    }

    #[test]
    fn run_config_sample_rate_defaults_to_100() {
        let json = r#"{
            "mode": "iterations",
            "iterations": 10,
            "concurrency": 1,
            "request": {"method": "GET", "url": "http://example.com"}
        }"#;
        let cfg: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.sample_rate, 100);
    }
}
