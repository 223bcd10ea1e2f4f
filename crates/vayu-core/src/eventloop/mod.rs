mod ratelimiter;
mod transport;

pub use ratelimiter::TokenBucket;
pub use transport::{HttpTransport, HttpTransportBuilder};

use crate::error::VayuError;
use crate::model::{Request, Response};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const DEFAULT_RING_CAPACITY: usize = 65_536;

#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    pub worker_count: usize,
    pub target_rps: f64,
    pub burst: Option<f64>,
    pub ring_capacity: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            target_rps: 0.0,
            burst: None,
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

struct Job {
    id: Uuid,
    request: Request,
    cancelled: Arc<AtomicBool>,
    respond: oneshot::Sender<Result<Response, VayuError>>,
}

#[derive(Debug, Clone, Copy)]
pub struct EventLoopStats {
    pub active: u64,
    pub pending: u64,
    pub processed: u64,
}

/// One per active run. Owns a fixed worker pool, each with its own inbox
/// channel (standing in for the spec's per-worker SPSC ring) and a shared
/// `reqwest` transport; submissions are handed out round-robin by a single
/// dispatch point, matching the "thread-safe external submit, SPSC internal
/// enqueue" shape.
pub struct EventLoop {
    workers: Vec<mpsc::Sender<Job>>,
    next_worker: AtomicUsize,
    cancelled: Arc<DashMap<Uuid, Arc<AtomicBool>>>,
    active: Arc<AtomicU64>,
    pending: Arc<AtomicU64>,
    processed: Arc<AtomicU64>,
}

impl EventLoop {
    pub fn new(config: EventLoopConfig) -> Self {
        let transport = Arc::new(HttpTransport::default());
        let limiter = Arc::new(TokenBucket::new(config.target_rps, config.burst));
        let cancelled: Arc<DashMap<Uuid, Arc<AtomicBool>>> = Arc::new(DashMap::new());
        let active = Arc::new(AtomicU64::new(0));
        let pending = Arc::new(AtomicU64::new(0));
        let processed = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::with_capacity(config.worker_count.max(1));
        for _ in 0..config.worker_count.max(1) {
            let (tx, mut rx) = mpsc::channel::<Job>(config.ring_capacity);
            let transport = Arc::clone(&transport);
            let limiter = Arc::clone(&limiter);
            let active = Arc::clone(&active);
            let pending = Arc::clone(&pending);
            let processed = Arc::clone(&processed);
            let cancelled_registry = Arc::clone(&cancelled);

            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    pending.fetch_sub(1, Ordering::Relaxed);
                    if job.cancelled.load(Ordering::Acquire) {
                        let _ = job.respond.send(Err(VayuError::Cancelled));
                        cancelled_registry.remove(&job.id);
                        continue;
                    }
                    limiter.acquire().await;
                    active.fetch_add(1, Ordering::Relaxed);
                    let result = transport.send(&job.request, job.id).await;
                    active.fetch_sub(1, Ordering::Relaxed);
                    processed.fetch_add(1, Ordering::Relaxed);
                    let suppressed = job.cancelled.load(Ordering::Acquire);
                    cancelled_registry.remove(&job.id);
                    if suppressed {
                        continue;
                    }
                    let _ = job.respond.send(result);
                }
            });

            workers.push(tx);
        }

        Self {
            workers,
            next_worker: AtomicUsize::new(0),
            cancelled,
            active,
            pending,
            processed,
        }
    }

    fn pick_worker(&self) -> &mpsc::Sender<Job> {
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[idx]
    }

    /// Submits a request, delivering the result on a worker task via the
    /// `on_complete` callback. Returns promptly with the request's id.
    pub async fn submit<F>(&self, request: Request, on_complete: F) -> Result<Uuid, VayuError>
    where
        F: FnOnce(Result<Response, VayuError>) + Send + 'static,
    {
        let (id, rx) = self.enqueue(request).await?;
        tokio::spawn(async move {
            if let Ok(result) = rx.await {
                on_complete(result);
            }
        });
        Ok(id)
    }

    /// Submits a request, returning its id and a receiver that resolves on
    /// completion — the spec's "settable future".
    pub async fn submit_async(&self, request: Request) -> Result<(Uuid, oneshot::Receiver<Result<Response, VayuError>>), VayuError> {
        self.enqueue(request).await
    }

    async fn enqueue(&self, request: Request) -> Result<(Uuid, oneshot::Receiver<Result<Response, VayuError>>), VayuError> {
        let id = Uuid::new_v4();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancelled.insert(id, Arc::clone(&cancel_flag));
        let (tx, rx) = oneshot::channel();
        let job = Job {
            id,
            request,
            cancelled: cancel_flag,
            respond: tx,
        };
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.pick_worker()
            .send(job)
            .await
            .map_err(|_| VayuError::Engine("event loop worker channel closed".to_string()))?;
        Ok((id, rx))
    }

    /// Best-effort cancel: a request already in the transport may still
    /// complete, but its result is suppressed from the caller.
    pub fn cancel(&self, request_id: Uuid) -> bool {
        match self.cancelled.get(&request_id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Blocking convenience: submits every request and awaits all results.
    pub async fn execute_batch(&self, requests: Vec<Request>) -> Vec<Result<Response, VayuError>> {
        let mut receivers = Vec::with_capacity(requests.len());
        for request in requests {
            match self.submit_async(request).await {
                Ok((_, rx)) => receivers.push(rx),
                Err(e) => {
                    let (tx, rx) = oneshot::channel();
                    let _ = tx.send(Err(e));
                    receivers.push(rx);
                }
            }
        }
        let mut results = Vec::with_capacity(receivers.len());
        for rx in receivers {
            results.push(rx.await.unwrap_or(Err(VayuError::Cancelled)));
        }
        results
    }

    pub fn stats(&self) -> EventLoopStats {
        EventLoopStats {
            active: self.active.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BodyMode, Headers, Method, RedirectPolicy};

    fn echo_request(url: String) -> Request {
        Request {
            method: Method::Get,
            url,
            headers: Headers::new(),
            body: BodyMode::None,
            timeout_ms: 2_000,
            redirect: RedirectPolicy::default(),
            verify_ssl: true,
            pre_request_script: None,
            post_request_script: None,
        }
    }

    async fn spawn_echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
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
        (format!("http://{addr}/echo"), handle)
    }

    #[tokio::test]
    async fn submit_async_delivers_response() {
        let (url, _server) = spawn_echo_server().await;
        let event_loop = EventLoop::new(EventLoopConfig { worker_count: 2, ..Default::default() });
        let (_, rx) = event_loop.submit_async(echo_request(url)).await.unwrap();
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.status_code, 200);
    }

    #[tokio::test]
    async fn cancel_suppresses_delivery() {
        let (url, _server) = spawn_echo_server().await;
        let event_loop = EventLoop::new(EventLoopConfig { worker_count: 1, ..Default::default() });
        let (id, rx) = event_loop.submit_async(echo_request(url)).await.unwrap();
        assert!(event_loop.cancel(id));
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(VayuError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_unknown_id_returns_false() {
        let event_loop = EventLoop::new(EventLoopConfig::default());
        assert!(!event_loop.cancel(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn execute_batch_returns_one_result_per_request() {
        let (url, _server) = spawn_echo_server().await;
        let event_loop = EventLoop::new(EventLoopConfig { worker_count: 4, ..Default::default() });
        let requests: Vec<_> = (0..5).map(|_| echo_request(url.clone())).collect();
        let results = event_loop.execute_batch(requests).await;
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn stats_processed_increments_after_completion() {
        let (url, _server) = spawn_echo_server().await;
        let event_loop = EventLoop::new(EventLoopConfig { worker_count: 1, ..Default::default() });
        let (_, rx) = event_loop.submit_async(echo_request(url)).await.unwrap();
        rx.await.unwrap().unwrap();
        assert_eq!(event_loop.stats().processed, 1);
    }

    #[tokio::test]
    async fn submit_invokes_callback_on_worker_task() {
        let (url, _server) = spawn_echo_server().await;
        let event_loop = EventLoop::new(EventLoopConfig { worker_count: 1, ..Default::default() });
        let (tx, rx) = oneshot::channel();
        event_loop
            .submit(echo_request(url), move |result| {
                let _ = tx.send(result.is_ok());
            })
            .await
            .unwrap();
        assert!(rx.await.unwrap());
    }
}
