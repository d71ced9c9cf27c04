//! W3C WebDriver client for chromedriver and geckodriver.
//!
//! Each [`WebDriverSession`] owns its driver server process (spawned with
//! `kill_on_drop`, so dropping the session terminates the browser) and
//! talks to it over HTTP with reqwest.

use super::{Driver, DriverFactory, DriverKind};
use crate::error::SaveError;
use crate::locate::locate;
use async_trait::async_trait;
use exec_locator::Locate;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long to wait for a freshly spawned driver server to report ready.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Headroom added to the HTTP timeout on top of the page/script timeout,
/// so the browser's own timeout error arrives before reqwest gives up.
const HTTP_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

/// Whether the process runs with an effective UID of 0.
pub fn is_superuser() -> bool {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Command-line arguments for a headless browser of `kind`.
///
/// Chrome's sandbox cannot start as root, so `--no-sandbox` is added only
/// then, and always ahead of `--headless`.
pub fn browser_args(kind: DriverKind, superuser: bool) -> Vec<&'static str> {
    match kind {
        DriverKind::Chrome => {
            let mut args = Vec::with_capacity(2);
            if superuser {
                args.push("--no-sandbox");
            }
            args.push("--headless");
            args
        }
        DriverKind::Firefox => vec!["-headless"],
    }
}

/// `POST /session` body requesting a headless browser with bounded timeouts.
pub fn session_capabilities(kind: DriverKind, timeout: Duration, superuser: bool) -> Value {
    let ms = timeout.as_millis() as u64;
    let args = browser_args(kind, superuser);
    let mut always = json!({
        "timeouts": { "pageLoad": ms, "script": ms },
    });
    match kind {
        DriverKind::Chrome => {
            always["browserName"] = json!("chrome");
            always["goog:chromeOptions"] = json!({ "args": args });
        }
        DriverKind::Firefox => {
            always["browserName"] = json!("firefox");
            always["moz:firefoxOptions"] = json!({ "args": args });
        }
    }
    json!({ "capabilities": { "alwaysMatch": always } })
}

// ── Factory ──────────────────────────────────────────────────────────────

/// Launches chromedriver/geckodriver found by an executable locator.
pub struct WebDriverFactory {
    locator: Arc<dyn Locate>,
}

impl WebDriverFactory {
    pub fn new(locator: Arc<dyn Locate>) -> Self {
        Self { locator }
    }
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    async fn launch(&self, kind: DriverKind, timeout: Duration) -> Result<Box<dyn Driver>, SaveError> {
        let unavailable = |reason: String| SaveError::DriverUnavailable {
            driver: kind.name().to_string(),
            reason,
        };

        let program = locate(&self.locator, kind.driver_program())
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let port = free_port().map_err(|e| unavailable(format!("no free port: {e}")))?;
        let child = spawn_driver(&program, port).map_err(|e| {
            unavailable(format!("failed to start {}: {e}", program.display()))
        })?;

        let client = Client::builder()
            .timeout(timeout + HTTP_TIMEOUT_SLACK)
            .build()
            .map_err(|e| SaveError::Internal(format!("HTTP client: {e}")))?;
        let base = format!("http://127.0.0.1:{port}");

        let mut session = WebDriverSession {
            endpoint: Endpoint { client, base },
            session_id: None,
            child: Some(child),
            kind,
        };
        session
            .wait_ready()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let caps = session_capabilities(kind, timeout, is_superuser());
        let created = session
            .endpoint
            .request(Method::POST, "/session", Some(caps))
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let id = created
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| unavailable(format!("no sessionId in response: {created}")))?;
        info!("{} session {} on port {}", kind, id, port);
        session.session_id = Some(id.to_string());
        Ok(Box::new(session))
    }
}

fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn spawn_driver(program: &Path, port: u16) -> std::io::Result<Child> {
    Command::new(program)
        .arg(format!("--port={port}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

// ── Session ──────────────────────────────────────────────────────────────

/// A live WebDriver session and the driver process behind it.
pub struct WebDriverSession {
    endpoint: Endpoint,
    session_id: Option<String>,
    child: Option<Child>,
    kind: DriverKind,
}

struct Endpoint {
    client: Client,
    base: String,
}

impl WebDriverSession {
    async fn wait_ready(&mut self) -> Result<(), SaveError> {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            if let Some(ref mut child) = self.child {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(SaveError::WebDriver {
                        command: "status".into(),
                        detail: format!("{} exited during startup ({status})", self.kind.driver_program()),
                    });
                }
            }
            match self.endpoint.request(Method::GET, "/status", None).await {
                Ok(v) if v.get("ready").and_then(Value::as_bool).unwrap_or(false) => return Ok(()),
                Ok(_) | Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Ok(v) => {
                    return Err(SaveError::WebDriver {
                        command: "status".into(),
                        detail: format!("driver not ready: {v}"),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn session_path(&self, suffix: &str) -> Result<String, SaveError> {
        let id = self.session_id.as_deref().ok_or_else(|| SaveError::WebDriver {
            command: suffix.to_string(),
            detail: "session already closed".into(),
        })?;
        Ok(format!("/session/{id}{suffix}"))
    }
}

impl Endpoint {
    /// Send one command and unwrap the `value` member of the response.
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, SaveError> {
        let url = format!("{}{}", self.base, path);
        let command = format!("{method} {path}");
        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| SaveError::WebDriver {
            command: command.clone(),
            detail: e.to_string(),
        })?;
        let status = resp.status();
        let payload: Value = resp.json().await.map_err(|e| SaveError::WebDriver {
            command: command.clone(),
            detail: format!("HTTP {status}: unreadable response: {e}"),
        })?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        // A successful script may itself return an `error` member, so only
        // error statuses are decoded as WebDriver errors.
        if !status.is_success() {
            let detail = match value.get("error").and_then(Value::as_str) {
                Some(error) => {
                    let message = value.get("message").and_then(Value::as_str).unwrap_or("");
                    format!("{error}: {message}")
                }
                None => format!("HTTP {status}: {value}"),
            };
            return Err(SaveError::WebDriver { command, detail });
        }
        // Legacy chromedriver responses put sessionId beside value.
        if path == "/session" && value.get("sessionId").is_none() {
            if let Some(id) = payload.get("sessionId") {
                return Ok(json!({ "sessionId": id }));
            }
        }
        Ok(value)
    }
}

#[async_trait]
impl Driver for WebDriverSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SaveError> {
        debug!("{} navigate {}", self.kind, url);
        let path = self.session_path("/url")?;
        self.endpoint
            .request(Method::POST, &path, Some(json!({ "url": url })))
            .await
            .map(|_| ())
            .map_err(|e| SaveError::PageLoad {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn element_exists(&mut self, selector: &str) -> Result<bool, SaveError> {
        let path = self.session_path("/elements")?;
        let found = self
            .endpoint
            .request(
                Method::POST,
                &path,
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;
        Ok(found.as_array().is_some_and(|a| !a.is_empty()))
    }

    async fn execute(&mut self, script: &str, args: Vec<Value>) -> Result<Value, SaveError> {
        let path = self.session_path("/execute/sync")?;
        self.endpoint
            .request(Method::POST, &path, Some(json!({ "script": script, "args": args })))
            .await
    }

    async fn execute_async(&mut self, script: &str, args: Vec<Value>) -> Result<Value, SaveError> {
        let path = self.session_path("/execute/async")?;
        self.endpoint
            .request(Method::POST, &path, Some(json!({ "script": script, "args": args })))
            .await
    }

    async fn quit(&mut self) -> Result<(), SaveError> {
        let result = match self.session_path("") {
            Ok(path) => self
                .endpoint
                .request(Method::DELETE, &path, None)
                .await
                .map(|_| ()),
            Err(_) => Ok(()),
        };
        self.session_id = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", self.kind.driver_program(), e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_gets_no_sandbox_only_as_root() {
        assert_eq!(browser_args(DriverKind::Chrome, false), vec!["--headless"]);
        assert_eq!(
            browser_args(DriverKind::Chrome, true),
            vec!["--no-sandbox", "--headless"]
        );
        assert_eq!(browser_args(DriverKind::Firefox, true), vec!["-headless"]);
    }

    #[test]
    fn capabilities_carry_timeouts_and_args() {
        let caps = session_capabilities(DriverKind::Chrome, Duration::from_secs(20), false);
        let always = &caps["capabilities"]["alwaysMatch"];
        assert_eq!(always["browserName"], "chrome");
        assert_eq!(always["timeouts"]["pageLoad"], 20_000);
        assert_eq!(always["timeouts"]["script"], 20_000);
        assert_eq!(always["goog:chromeOptions"]["args"], json!(["--headless"]));

        let caps = session_capabilities(DriverKind::Firefox, Duration::from_millis(500), true);
        let always = &caps["capabilities"]["alwaysMatch"];
        assert_eq!(always["moz:firefoxOptions"]["args"], json!(["-headless"]));
        assert_eq!(always["timeouts"]["pageLoad"], 500);
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(free_port().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_driver_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let locator = exec_locator::ExecLocator::with_dirs([dir.path()]);
        let factory = WebDriverFactory::new(Arc::new(locator));
        let err = factory
            .launch(DriverKind::Firefox, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(err.is_unavailable(), "got: {err}");
        assert!(err.to_string().contains("geckodriver"), "got: {err}");
    }
}
