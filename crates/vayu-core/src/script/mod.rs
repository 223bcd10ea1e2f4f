mod prelude;

use crate::error::VayuError;
use crate::model::{Request, Response};
use rquickjs::{Context, Ctx, Function, Object, Runtime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_STACK_SIZE: usize = 256 * 1024;
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POOL_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct ScriptConfig {
    pub pool_size: usize,
    pub memory_limit: usize,
    pub max_stack_size: usize,
    pub exec_timeout: Duration,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScriptOutcome {
    pub success: bool,
    pub tests: Vec<TestResult>,
    pub console_output: Vec<String>,
    pub error_message: Option<String>,
}

/// Per-context key/value scopes exposed as `pm.environment` /
/// `pm.globals` / `pm.collectionVariables`.
#[derive(Debug, Clone, Default)]
pub struct ScriptScopes {
    pub environment: HashMap<String, String>,
    pub globals: HashMap<String, String>,
    pub collection_variables: HashMap<String, String>,
}

/// A pre-initialized JS runtime with its own memory/stack caps applied once
/// at creation. Each use gets a brand-new `Context` on top of it — cheaper
/// than tearing down and rebuilding the `Runtime` itself, and it sidesteps
/// having to hand-clear every global a previous script may have set.
struct ScriptSlot {
    runtime: Runtime,
}

impl ScriptSlot {
    fn new(config: &ScriptConfig) -> Result<Self, VayuError> {
        let runtime = Runtime::new().map_err(|e| VayuError::Script(format!("failed to create JS runtime: {e}")))?;
        runtime.set_memory_limit(config.memory_limit);
        runtime.set_max_stack_size(config.max_stack_size);
        Ok(Self { runtime })
    }
}

/// Pool of pre-initialized contexts. Acquisition hands out exclusive,
/// temporary use of one slot; release resets its globals and re-runs the
/// `pm.*` prelude before returning it to the pool.
pub struct ScriptPool {
    config: ScriptConfig,
    slots: Arc<Mutex<Vec<ScriptSlot>>>,
    permits: Arc<Semaphore>,
}

impl ScriptPool {
    pub fn new(config: ScriptConfig) -> Result<Self, VayuError> {
        let mut slots = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            slots.push(ScriptSlot::new(&config)?);
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.pool_size)),
            slots: Arc::new(Mutex::new(slots)),
            config,
        })
    }

    async fn acquire(&self) -> Result<(tokio::sync::OwnedSemaphorePermit, ScriptSlot), VayuError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| VayuError::Internal("script pool semaphore closed".to_string()))?;
        let slot = self
            .slots
            .lock()
            .expect("script pool mutex poisoned")
            .pop()
            .expect("semaphore guarantees a slot is available");
        Ok((permit, slot))
    }

    fn release(&self, slot: ScriptSlot) {
        self.slots.lock().expect("script pool mutex poisoned").push(slot);
    }

    pub async fn execute_prerequest(&self, script: &str, request: &Request, scopes: &ScriptScopes) -> Result<(Request, ScriptOutcome), VayuError> {
        let (_permit, slot) = self.acquire().await?;
        let timeout = self.config.exec_timeout;
        let script = script.to_string();
        let request = request.clone();
        let scopes = scopes.clone();

        let (result, slot) = tokio::task::spawn_blocking(move || {
            let outcome = run_in_context(&slot, &script, Some(&request), None, &scopes, timeout, Phase::PreRequest);
            (outcome, slot)
        })
        .await
        .map_err(|e| VayuError::Internal(format!("script task panicked: {e}")))?;

        self.release(slot);
        result
    }

    pub async fn execute_test(&self, script: &str, request: &Request, response: &Response, scopes: &ScriptScopes) -> Result<ScriptOutcome, VayuError> {
        let (_permit, slot) = self.acquire().await?;
        let timeout = self.config.exec_timeout;
        let script = script.to_string();
        let request = request.clone();
        let response = response.clone();
        let scopes = scopes.clone();

        let (result, slot) = tokio::task::spawn_blocking(move || {
            let outcome = run_in_context(&slot, &script, Some(&request), Some(&response), &scopes, timeout, Phase::Test);
            (outcome.map(|(_, outcome)| outcome), slot)
        })
        .await
        .map_err(|e| VayuError::Internal(format!("script task panicked: {e}")))?;

        self.release(slot);
        result
    }
}

#[derive(Clone, Copy)]
enum Phase {
    PreRequest,
    Test,
}

/// Runs `script` inside `slot`'s context, binding the `pm.*` surface fresh
/// for this invocation. For `execute_prerequest`, mutations the script made
/// to request-derived fields are read back out and returned.
fn run_in_context(
    slot: &ScriptSlot,
    script: &str,
    request: Option<&Request>,
    response: Option<&Response>,
    scopes: &ScriptScopes,
    timeout: Duration,
    phase: Phase,
) -> Result<(Request, ScriptOutcome), VayuError> {
    let console_output = Arc::new(Mutex::new(Vec::<String>::new()));
    let tests = Arc::new(Mutex::new(Vec::<TestResult>::new()));
    let environment = Arc::new(Mutex::new(scopes.environment.clone()));
    let globals = Arc::new(Mutex::new(scopes.globals.clone()));
    let collection_vars = Arc::new(Mutex::new(scopes.collection_variables.clone()));
    let interrupted = Arc::new(AtomicBool::new(false));

    let deadline = Instant::now() + timeout;
    {
        let interrupted = Arc::clone(&interrupted);
        slot.runtime.set_interrupt_handler(Some(Box::new(move || {
            if Instant::now() >= deadline {
                interrupted.store(true, Ordering::SeqCst);
                true
            } else {
                false
            }
        })));
    }

    let context = Context::full(&slot.runtime).map_err(|e| VayuError::Script(format!("failed to create JS context: {e}")))?;
    let (outcome, mutated_request_json) = context.with(|ctx| -> Result<(ScriptOutcome, Option<String>), VayuError> {
        bind_console(&ctx, Arc::clone(&console_output))?;
        bind_store(&ctx, "__pm_env", Arc::clone(&environment))?;
        bind_store(&ctx, "__pm_globals", Arc::clone(&globals))?;
        bind_store(&ctx, "__pm_collection", Arc::clone(&collection_vars))?;
        bind_test_recorder(&ctx, Arc::clone(&tests))?;
        bind_request_response(&ctx, request, response)?;

        ctx.eval::<(), _>(prelude::PRELUDE)
            .map_err(|e| VayuError::Script(format!("prelude failed to load: {e}")))?;

        let outcome = match ctx.eval::<(), _>(script) {
            Ok(()) => ScriptOutcome {
                success: true,
                tests: tests.lock().expect("poisoned").clone(),
                console_output: console_output.lock().expect("poisoned").clone(),
                error_message: None,
            },
            Err(e) => ScriptOutcome {
                success: false,
                tests: tests.lock().expect("poisoned").clone(),
                console_output: console_output.lock().expect("poisoned").clone(),
                error_message: Some(e.to_string()),
            },
        };

        // Pre-request scripts may mutate `pm.request` in place; read the live
        // JS object back out rather than trusting a hardcoded env key, since
        // nothing else in the bound surface has a way to signal a mutation.
        let mutated_request_json = if matches!(phase, Phase::PreRequest) {
            ctx.eval::<String, _>("JSON.stringify(pm.request)").ok()
        } else {
            None
        };

        Ok((outcome, mutated_request_json))
    })?;

    slot.runtime.set_interrupt_handler(None);

    let outcome = if interrupted.load(Ordering::SeqCst) {
        ScriptOutcome {
            success: false,
            error_message: Some(format!("script exceeded {}ms execution budget", timeout.as_millis())),
            ..outcome
        }
    } else {
        outcome
    };

    let mutated_request = match (phase, request) {
        (Phase::PreRequest, Some(original)) => mutated_request_json
            .and_then(|json| serde_json::from_str::<Request>(&json).ok())
            .unwrap_or_else(|| original.clone()),
        (_, Some(original)) => original.clone(),
        (_, None) => {
            return Err(VayuError::Internal("script execution requires a request".to_string()));
        }
    };

    Ok((mutated_request, outcome))
}

fn bind_console(ctx: &Ctx<'_>, buffer: Arc<Mutex<Vec<String>>>) -> Result<(), VayuError> {
    let func = Function::new(ctx.clone(), move |level: String, message: String| {
        buffer.lock().expect("poisoned").push(format!("[{level}] {message}"));
    })
    .map_err(|e| VayuError::Script(e.to_string()))?;
    ctx.globals()
        .set("__pm_console", func)
        .map_err(|e| VayuError::Script(e.to_string()))
}

fn bind_store(ctx: &Ctx<'_>, prefix: &str, store: Arc<Mutex<HashMap<String, String>>>) -> Result<(), VayuError> {
    let get_store = Arc::clone(&store);
    let get = Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<Option<String>> { Ok(get_store.lock().expect("poisoned").get(&key).cloned()) })
        .map_err(|e| VayuError::Script(e.to_string()))?;

    let set_store = Arc::clone(&store);
    let set = Function::new(ctx.clone(), move |key: String, value: String| {
        set_store.lock().expect("poisoned").insert(key, value);
    })
    .map_err(|e| VayuError::Script(e.to_string()))?;

    let unset_store = Arc::clone(&store);
    let unset = Function::new(ctx.clone(), move |key: String| {
        unset_store.lock().expect("poisoned").remove(&key);
    })
    .map_err(|e| VayuError::Script(e.to_string()))?;

    let globals = ctx.globals();
    globals.set(format!("{prefix}_get"), get).map_err(|e| VayuError::Script(e.to_string()))?;
    globals.set(format!("{prefix}_set"), set).map_err(|e| VayuError::Script(e.to_string()))?;
    globals.set(format!("{prefix}_unset"), unset).map_err(|e| VayuError::Script(e.to_string()))
}

fn bind_test_recorder(ctx: &Ctx<'_>, tests: Arc<Mutex<Vec<TestResult>>>) -> Result<(), VayuError> {
    let func = Function::new(ctx.clone(), move |name: String, passed: bool, error: Option<String>| {
        tests.lock().expect("poisoned").push(TestResult { name, passed, error });
    })
    .map_err(|e| VayuError::Script(e.to_string()))?;
    ctx.globals().set("__pm_record_test", func).map_err(|e| VayuError::Script(e.to_string()))
}

fn bind_request_response(ctx: &Ctx<'_>, request: Option<&Request>, response: Option<&Response>) -> Result<(), VayuError> {
    let globals = ctx.globals();
    let pm = Object::new(ctx.clone()).map_err(|e| VayuError::Script(e.to_string()))?;

    if let Some(request) = request {
        let json = serde_json::to_string(request).map_err(VayuError::from)?;
        let value: rquickjs::Value = ctx
            .eval(format!("({json})"))
            .map_err(|e| VayuError::Script(format!("failed to bind pm.request: {e}")))?;
        pm.set("request", value).map_err(|e| VayuError::Script(e.to_string()))?;
    }

    if let Some(response) = response {
        let body_text = String::from_utf8_lossy(&response.body).into_owned();
        let mut plain = serde_json::to_value(response).map_err(VayuError::from)?;
        if let Some(obj) = plain.as_object_mut() {
            obj.insert("bodyText".to_string(), serde_json::Value::String(body_text));
            obj.insert("code".to_string(), serde_json::Value::from(response.status_code));
        }
        let json = plain.to_string();
        let value: rquickjs::Value = ctx
            .eval(format!("({json})"))
            .map_err(|e| VayuError::Script(format!("failed to bind pm.response: {e}")))?;
        pm.set("response", value).map_err(|e| VayuError::Script(e.to_string()))?;
    }

    globals.set("pm", pm).map_err(|e| VayuError::Script(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BodyMode, Headers, Method, RedirectPolicy};

    fn sample_request() -> Request {
        Request {
            method: Method::Get,
            url: "http://example.com".to_string(),
            headers: Headers::new(),
            body: BodyMode::None,
            timeout_ms: 1000,
            redirect: RedirectPolicy::default(),
            verify_ssl: true,
            pre_request_script: None,
            post_request_script: None,
        }
    }

    fn sample_response(status: u16) -> Response {
        Response {
            status_code: status,
            status_text: "OK".to_string(),
            headers: Headers::new(),
            body: b"{}".to_vec(),
            body_size: 2,
            timing: Default::default(),
            request_id: uuid::Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn passing_test_assertion_is_recorded() {
        let pool = ScriptPool::new(ScriptConfig { pool_size: 1, ..Default::default() }).unwrap();
        let script = r#"pm.test("status", () => pm.expect(pm.response.code).to.equal(200));"#;
        let outcome = pool
            .execute_test(script, &sample_request(), &sample_response(200), &ScriptScopes::default())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.tests.len(), 1);
        assert!(outcome.tests[0].passed);
    }

    #[tokio::test]
    async fn failing_test_assertion_is_recorded_with_error() {
        let pool = ScriptPool::new(ScriptConfig { pool_size: 1, ..Default::default() }).unwrap();
        let script = r#"pm.test("status", () => pm.expect(pm.response.code).to.equal(200));"#;
        let outcome = pool
            .execute_test(script, &sample_request(), &sample_response(404), &ScriptScopes::default())
            .await
            .unwrap();
        assert!(!outcome.tests[0].passed);
        assert!(outcome.tests[0].error.is_some());
    }

    #[tokio::test]
    async fn console_log_is_captured() {
        let pool = ScriptPool::new(ScriptConfig { pool_size: 1, ..Default::default() }).unwrap();
        let outcome = pool
            .execute_test("console.log('hello', 'world');", &sample_request(), &sample_response(200), &ScriptScopes::default())
            .await
            .unwrap();
        assert_eq!(outcome.console_output.len(), 1);
        assert!(outcome.console_output[0].contains("hello world"));
    }

    #[tokio::test]
    async fn script_exception_is_recoverable() {
        let pool = ScriptPool::new(ScriptConfig { pool_size: 1, ..Default::default() }).unwrap();
        let outcome = pool
            .execute_test("throw new Error('boom');", &sample_request(), &sample_response(200), &ScriptScopes::default())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error_message.is_some());
    }

    #[tokio::test]
    async fn script_timeout_is_recoverable() {
        let pool = ScriptPool::new(ScriptConfig {
            pool_size: 1,
            exec_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap();
        let outcome = pool
            .execute_test("while (true) {}", &sample_request(), &sample_response(200), &ScriptScopes::default())
            .await
            .unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn context_is_reset_between_uses_no_state_leak() {
        let pool = ScriptPool::new(ScriptConfig { pool_size: 1, ..Default::default() }).unwrap();
        pool.execute_test("globalThis.leaked = 42;", &sample_request(), &sample_response(200), &ScriptScopes::default())
            .await
            .unwrap();
        let outcome = pool
            .execute_test(
                "pm.test('no leak', () => pm.expect(typeof globalThis.leaked).to.equal('undefined'));",
                &sample_request(),
                &sample_response(200),
                &ScriptScopes::default(),
            )
            .await
            .unwrap();
        assert!(outcome.tests[0].passed);
    }

    #[tokio::test]
    async fn prerequest_script_mutation_of_request_url_takes_effect() {
        let pool = ScriptPool::new(ScriptConfig { pool_size: 1, ..Default::default() }).unwrap();
        let script = r#"pm.request.url = "http://example.com/mutated";"#;
        let (mutated, _outcome) = pool
            .execute_prerequest(script, &sample_request(), &ScriptScopes::default())
            .await
            .unwrap();
        assert_eq!(mutated.url, "http://example.com/mutated");
    }

    #[tokio::test]
    async fn prerequest_script_mutation_of_request_header_takes_effect() {
        let pool = ScriptPool::new(ScriptConfig { pool_size: 1, ..Default::default() }).unwrap();
        let script = r#"pm.request.headers["X-Token"] = "abc123";"#;
        let (mutated, _outcome) = pool
            .execute_prerequest(script, &sample_request(), &ScriptScopes::default())
            .await
            .unwrap();
        assert_eq!(mutated.headers.get("X-Token"), Some("abc123"));
    }

    #[tokio::test]
    async fn environment_set_and_get_round_trip() {
        let pool = ScriptPool::new(ScriptConfig { pool_size: 1, ..Default::default() }).unwrap();
        let script = r#"
            pm.environment.set("token", "abc123");
            pm.test("env roundtrip", () => pm.expect(pm.environment.get("token")).to.equal("abc123"));
        "#;
        let outcome = pool
            .execute_test(script, &sample_request(), &sample_response(200), &ScriptScopes::default())
            .await
            .unwrap();
        assert!(outcome.tests[0].passed);
    }
}
