use crate::error::VayuError;
use crate::model::{BodyMode, Method, RedirectPolicy, Request, Response, TimingBreakdown};
use std::time::{Duration, Instant};

/// The client-level policy baked in at builder time — requests that ask for
/// exactly this reuse the pooled client instead of paying for a one-off.
const DEFAULT_REDIRECT: RedirectPolicy = RedirectPolicy { follow: true, max: 10 };

/// Wraps a `reqwest::Client` as the "multi-handle transport" — connection
/// reuse, DNS caching and keep-alive are all delegated to it.
#[derive(Clone)]
pub struct HttpTransport {
    inner: reqwest::Client,
    /// Built lazily: most runs verify certificates, so the insecure client
    /// is only constructed the first time a request asks to skip it.
    insecure: std::sync::Arc<tokio::sync::OnceCell<reqwest::Client>>,
    user_agent: String,
}

pub struct HttpTransportBuilder {
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Duration,
    user_agent: String,
    tcp_keepalive: Duration,
}

impl Default for HttpTransportBuilder {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 100,
            pool_idle_timeout: Duration::from_secs(90),
            user_agent: format!("vayu/{}", env!("CARGO_PKG_VERSION")),
            tcp_keepalive: Duration::from_secs(60),
        }
    }
}

impl HttpTransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_max_idle_per_host(mut self, n: usize) -> Self {
        self.pool_max_idle_per_host = n;
        self
    }

    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn build(self) -> Result<HttpTransport, VayuError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout)
            .tcp_keepalive(self.tcp_keepalive)
            .user_agent(self.user_agent.clone())
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(VayuError::from_transport)?;
        Ok(HttpTransport {
            inner: client,
            insecure: std::sync::Arc::new(tokio::sync::OnceCell::new()),
            user_agent: self.user_agent,
        })
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        HttpTransportBuilder::default()
            .build()
            .expect("default HttpTransport should always build")
    }
}

impl HttpTransport {
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::new()
    }

    /// Dispatches one request, classifying any transport failure per the
    /// error taxonomy and measuring the timing breakdown available from the
    /// client's own lifecycle (DNS/connect/TLS sub-timings are not exposed
    /// by `reqwest`, so only first-byte/download/total are split out).
    pub async fn send(&self, request: &Request, request_id: uuid::Uuid) -> Result<Response, VayuError> {
        let parsed = reqwest::Url::parse(&request.url).map_err(|e| VayuError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(VayuError::InvalidUrl(format!("unsupported scheme `{}`", parsed.scheme())));
        }

        let pooled = if request.verify_ssl {
            &self.inner
        } else {
            self.insecure
                .get_or_try_init(|| async {
                    reqwest::Client::builder()
                        .danger_accept_invalid_certs(true)
                        .user_agent(self.user_agent.clone())
                        .gzip(true)
                        .brotli(true)
                        .build()
                })
                .await
                .map_err(VayuError::from_transport)?
        };

        // The pooled clients above are built with the default redirect
        // policy; a request that asks for something else (don't follow, or
        // a different cap) gets a throwaway client built with that policy
        // instead of mutating shared state.
        let one_off;
        let client = if redirect_matches_default(&request.redirect) {
            pooled
        } else {
            one_off = reqwest::Client::builder()
                .danger_accept_invalid_certs(!request.verify_ssl)
                .user_agent(self.user_agent.clone())
                .gzip(true)
                .brotli(true)
                .redirect(redirect_policy(&request.redirect))
                .build()
                .map_err(VayuError::from_transport)?;
            &one_off
        };

        let method: reqwest::Method = request.method.into();
        let mut builder = client
            .request(method, &request.url)
            .timeout(Duration::from_millis(request.timeout_ms));

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        builder = apply_body(builder, &request.body)?;

        let start = Instant::now();
        let response = builder.send().await.map_err(VayuError::from_transport)?;
        let first_byte = start.elapsed();

        let status_code = response.status().as_u16();
        let status_text = response.status().canonical_reason().unwrap_or("").to_string();
        let mut headers = crate::model::Headers::new();
        for (k, v) in response.headers().iter() {
            if let Ok(value) = v.to_str() {
                headers.insert(k.as_str(), value);
            }
        }

        let body = response.bytes().await.map_err(VayuError::from_transport)?;
        let total = start.elapsed();

        Ok(Response {
            status_code,
            status_text,
            headers,
            body_size: body.len(),
            body: body.to_vec(),
            timing: TimingBreakdown {
                dns_ms: 0.0,
                connect_ms: 0.0,
                tls_ms: 0.0,
                first_byte_ms: first_byte.as_secs_f64() * 1000.0,
                download_ms: (total - first_byte).as_secs_f64() * 1000.0,
                total_ms: total.as_secs_f64() * 1000.0,
            },
            request_id,
        })
    }
}

fn redirect_matches_default(redirect: &RedirectPolicy) -> bool {
    redirect.follow == DEFAULT_REDIRECT.follow && redirect.max == DEFAULT_REDIRECT.max
}

fn redirect_policy(redirect: &RedirectPolicy) -> reqwest::redirect::Policy {
    if !redirect.follow {
        reqwest::redirect::Policy::none()
    } else {
        reqwest::redirect::Policy::limited(redirect.max as usize)
    }
}

fn apply_body(mut builder: reqwest::RequestBuilder, body: &BodyMode) -> Result<reqwest::RequestBuilder, VayuError> {
    builder = match body {
        BodyMode::None => builder,
        BodyMode::Text(text) => builder.body(text.clone()),
        BodyMode::Json(value) => builder.json(value),
        BodyMode::FormUrlEncoded(pairs) => builder.form(pairs),
        BodyMode::FormMultipart(fields) => {
            let mut form = reqwest::multipart::Form::new();
            for field in fields {
                form = form.text(field.name.clone(), field.value.clone());
            }
            builder.multipart(form)
        }
        BodyMode::Binary(_) => {
            let bytes = body
                .decode_binary()?
                .expect("Binary variant always decodes to Some");
            builder.body(bytes)
        }
        BodyMode::GraphQl { query, variables, operation_name } => {
            let payload = serde_json::json!({
                "query": query,
                "variables": variables,
                "operationName": operation_name,
            });
            builder.json(&payload)
        }
    };
    Ok(builder)
}
