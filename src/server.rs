//! Ephemeral local HTTP server publishing in-memory content as URLs.
//!
//! ## Why a server?
//!
//! A browser page loaded from `file://` cannot fetch sibling files in most
//! engines, and WebDriver gives us no other way to hand a page a 2 MB
//! script. Publishing the host page and runtime scripts on `127.0.0.1`
//! sidesteps both problems.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──start()──▶ running ──stop()──▶ stopped ──publish()──▶ running (new port)
//! ```
//!
//! `start` is idempotent, `stop` is safe when never started, and `publish`
//! restarts a stopped server transparently. URLs issued before a `stop` are
//! dead afterwards.
//!
//! The route table is a [`DashMap`] shared with the accept loop, so
//! publishing never blocks requests being served.

use crate::error::SaveError;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A one-shot byte stream served as a chunked body.
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

type Routes = Arc<DashMap<String, Resource>>;

enum ResourceBody {
    Static(Bytes),
    Stream(std::sync::Mutex<Option<ByteStream>>),
}

struct Resource {
    body: ResourceBody,
    headers: HeaderMap,
    once: bool,
}

struct Running {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Local HTTP server for host pages and runtime scripts.
pub struct ResourceServer {
    routes: Routes,
    running: Mutex<Option<Running>>,
}

impl Default for ResourceServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceServer")
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl ResourceServer {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
            running: Mutex::new(None),
        }
    }

    /// Headers letting a sandboxed page fetch the resource cross-origin.
    pub fn cors_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers
    }

    /// Bind an ephemeral loopback port and start serving. Idempotent.
    pub async fn start(&self) -> Result<SocketAddr, SaveError> {
        let mut running = self.running.lock().await;
        self.start_locked(&mut running).await
    }

    /// Start under an already held lifecycle lock.
    async fn start_locked(&self, running: &mut Option<Running>) -> Result<SocketAddr, SaveError> {
        if let Some(ref r) = *running {
            if !r.task.is_finished() {
                return Ok(r.addr);
            }
            warn!("Resource server on {} exited unexpectedly; restarting", r.addr);
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| SaveError::Server(format!("failed to bind 127.0.0.1:0: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| SaveError::Server(format!("failed to read bound address: {e}")))?;

        let router = Router::new()
            .fallback(serve_resource)
            .with_state(Arc::clone(&self.routes));
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                });
            if let Err(e) = server.await {
                warn!("Resource server on {} failed: {}", addr, e);
            }
        });

        info!("Resource server listening on http://{}", addr);
        *running = Some(Running {
            addr,
            shutdown: Some(tx),
            task,
        });
        Ok(addr)
    }

    /// Address of the running server, if any.
    pub async fn addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    /// Publish `content` at `route` (a fresh UUID route when `None` or empty)
    /// and return its absolute URL. Starts the server if needed.
    pub async fn publish(
        &self,
        content: impl Into<Bytes>,
        route: Option<&str>,
        headers: HeaderMap,
    ) -> Result<String, SaveError> {
        self.insert(
            route,
            Resource {
                body: ResourceBody::Static(content.into()),
                headers,
                once: false,
            },
        )
        .await
    }

    /// Like [`publish`](Self::publish), but the resource is removed after
    /// its first fetch.
    pub async fn publish_once(
        &self,
        content: impl Into<Bytes>,
        route: Option<&str>,
        headers: HeaderMap,
    ) -> Result<String, SaveError> {
        self.insert(
            route,
            Resource {
                body: ResourceBody::Static(content.into()),
                headers,
                once: true,
            },
        )
        .await
    }

    /// Serve `stream` once, as a chunked body.
    pub async fn publish_stream(
        &self,
        stream: ByteStream,
        route: Option<&str>,
        headers: HeaderMap,
    ) -> Result<String, SaveError> {
        self.insert(
            route,
            Resource {
                body: ResourceBody::Stream(std::sync::Mutex::new(Some(stream))),
                headers,
                once: true,
            },
        )
        .await
    }

    /// Remove a published route. Returns whether it existed.
    pub fn unpublish(&self, route: &str) -> bool {
        self.routes.remove(normalize_route(route)).is_some()
    }

    /// Stop serving and forget every route. Safe to call repeatedly.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        self.routes.clear();
        if let Some(mut r) = running.take() {
            if let Some(tx) = r.shutdown.take() {
                let _ = tx.send(());
            }
            // Browsers hold keep-alive connections open; do not wait on them.
            r.task.abort();
            info!("Resource server on {} stopped", r.addr);
        }
    }

    /// The lifecycle lock is held across start and insert, so a concurrent
    /// `stop` cannot clear the route before its URL is returned.
    async fn insert(&self, route: Option<&str>, resource: Resource) -> Result<String, SaveError> {
        let mut running = self.running.lock().await;
        let addr = self.start_locked(&mut running).await?;
        let route = match route.map(normalize_route) {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => uuid::Uuid::new_v4().simple().to_string(),
        };
        debug!("Publishing /{}", route);
        self.routes.insert(route.clone(), resource);
        Ok(format!("http://{addr}/{route}"))
    }
}

fn normalize_route(route: &str) -> &str {
    route.trim().trim_start_matches('/')
}

fn guess_content_type(route: &str) -> &'static str {
    match route.rsplit_once('.').map(|(_, ext)| ext) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

async fn serve_resource(State(routes): State<Routes>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let route = normalize_route(uri.path()).to_string();

    let once = match routes.get(&route) {
        Some(entry) => entry.once,
        None => {
            debug!("404 /{}", route);
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let (body, mut headers) = if once {
        match routes.remove(&route) {
            Some((_, resource)) => {
                let body = match resource.body {
                    ResourceBody::Static(bytes) => Body::from(bytes),
                    ResourceBody::Stream(slot) => {
                        let stream = slot
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .take();
                        match stream {
                            Some(s) => Body::from_stream(s),
                            None => return StatusCode::GONE.into_response(),
                        }
                    }
                };
                (body, resource.headers)
            }
            // Raced with another fetch of the same one-shot resource.
            None => return StatusCode::NOT_FOUND.into_response(),
        }
    } else {
        match routes.get(&route) {
            Some(entry) => match &entry.body {
                ResourceBody::Static(bytes) => (Body::from(bytes.clone()), entry.headers.clone()),
                ResourceBody::Stream(_) => return StatusCode::GONE.into_response(),
            },
            None => return StatusCode::NOT_FOUND.into_response(),
        }
    };

    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(guess_content_type(&route)),
        );
    }
    (StatusCode::OK, headers, body).into_response()
}
