//! Browser driver pool.
//!
//! Starting chromedriver plus a headless Chrome costs one to three seconds,
//! so the pool keeps at most one live driver per [`DriverKind`] and hands
//! out shared [`DriverHandle`]s. A handle wraps the driver in an async
//! mutex: exports sharing a driver queue instead of interleaving WebDriver
//! commands on one page.
//!
//! Process launching sits behind [`DriverFactory`];
//! [`webdriver::WebDriverFactory`] is the real one.

pub mod webdriver;

use crate::error::SaveError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// How long a failed launch keeps a kind out of [`DriverPool::select_available`].
const FAILURE_RETRY_WINDOW: Duration = Duration::from_secs(60);

// ── Kinds ────────────────────────────────────────────────────────────────

/// A browser engine with a WebDriver implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Chrome,
    Firefox,
}

impl DriverKind {
    /// Probe order used when the caller does not pick a driver.
    pub const PREFERENCE: [DriverKind; 2] = [DriverKind::Chrome, DriverKind::Firefox];

    pub fn name(self) -> &'static str {
        match self {
            DriverKind::Chrome => "chrome",
            DriverKind::Firefox => "firefox",
        }
    }

    /// The WebDriver server executable for this engine.
    pub fn driver_program(self) -> &'static str {
        match self {
            DriverKind::Chrome => "chromedriver",
            DriverKind::Firefox => "geckodriver",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DriverKind {
    type Err = SaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chrome" | "chromium" | "chromedriver" => Ok(DriverKind::Chrome),
            "firefox" | "gecko" | "geckodriver" => Ok(DriverKind::Firefox),
            other => Err(SaveError::InvalidConfig(format!(
                "unknown browser driver '{other}' (expected chrome or firefox)"
            ))),
        }
    }
}

// ── Driver seam ──────────────────────────────────────────────────────────

/// The WebDriver operations an export needs.
#[async_trait]
pub trait Driver: Send {
    /// Load `url` and wait for the page load to finish.
    async fn navigate(&mut self, url: &str) -> Result<(), SaveError>;

    /// Whether an element matches the CSS `selector`.
    async fn element_exists(&mut self, selector: &str) -> Result<bool, SaveError>;

    /// Run a synchronous script and return its value.
    async fn execute(&mut self, script: &str, args: Vec<Value>) -> Result<Value, SaveError>;

    /// Run an asynchronous script. The script receives a completion callback
    /// as its last argument; the call returns the value passed to it.
    async fn execute_async(&mut self, script: &str, args: Vec<Value>) -> Result<Value, SaveError>;

    /// End the session and terminate the browser.
    async fn quit(&mut self) -> Result<(), SaveError>;
}

/// Launches drivers for the pool.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Start a driver whose page loads and scripts time out after `timeout`.
    ///
    /// "Cannot run here" failures must be reported as
    /// [`SaveError::DriverUnavailable`].
    async fn launch(&self, kind: DriverKind, timeout: Duration)
        -> Result<Box<dyn Driver>, SaveError>;
}

// ── Handles ──────────────────────────────────────────────────────────────

struct DriverSlot {
    kind: Option<DriverKind>,
    driver: Mutex<Box<dyn Driver>>,
}

/// Shared reference to a live driver.
#[derive(Clone)]
pub struct DriverHandle {
    slot: Arc<DriverSlot>,
}

impl DriverHandle {
    /// Wrap a driver the caller opened itself.
    pub fn new(driver: Box<dyn Driver>) -> Self {
        Self::with_kind(None, driver)
    }

    fn with_kind(kind: Option<DriverKind>, driver: Box<dyn Driver>) -> Self {
        Self {
            slot: Arc::new(DriverSlot {
                kind,
                driver: Mutex::new(driver),
            }),
        }
    }

    /// The kind this handle was launched as; `None` for caller-supplied drivers.
    pub fn kind(&self) -> Option<DriverKind> {
        self.slot.kind
    }

    /// Exclusive access to the driver; other holders wait.
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn Driver>> {
        self.slot.driver.lock().await
    }

    /// Identity comparison.
    pub fn same_as(&self, other: &DriverHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle")
            .field("kind", &self.slot.kind)
            .field("ptr", &Arc::as_ptr(&self.slot))
            .finish()
    }
}

/// A driver kind to launch (or reuse), or an already-open handle.
#[derive(Debug, Clone)]
pub enum DriverChoice {
    Kind(DriverKind),
    Handle(DriverHandle),
}

impl From<DriverKind> for DriverChoice {
    fn from(kind: DriverKind) -> Self {
        DriverChoice::Kind(kind)
    }
}

impl From<DriverHandle> for DriverChoice {
    fn from(handle: DriverHandle) -> Self {
        DriverChoice::Handle(handle)
    }
}

// ── Pool ─────────────────────────────────────────────────────────────────

/// At most one live driver per kind, created lazily.
///
/// Each kind has its own slot lock, so a slow Chrome launch never holds up
/// a Firefox one.
pub struct DriverPool {
    factory: Arc<dyn DriverFactory>,
    chrome: Mutex<Option<DriverHandle>>,
    firefox: Mutex<Option<DriverHandle>>,
    failures: std::sync::Mutex<HashMap<DriverKind, Instant>>,
    retry_window: Duration,
}

impl fmt::Debug for DriverPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverPool")
            .field("retry_window", &self.retry_window)
            .finish()
    }
}

impl DriverPool {
    pub fn new(factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            factory,
            chrome: Mutex::new(None),
            firefox: Mutex::new(None),
            failures: std::sync::Mutex::new(HashMap::new()),
            retry_window: FAILURE_RETRY_WINDOW,
        }
    }

    /// Override how long a failed kind is skipped by probes.
    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = window;
        self
    }

    /// Resolve a choice to a live handle.
    ///
    /// Caller-supplied handles pass through unchanged. For a kind, the
    /// cached handle is returned, or a driver is launched and cached.
    /// Concurrent calls for one kind launch at most one driver.
    pub async fn get(&self, choice: &DriverChoice, timeout: Duration) -> Result<DriverHandle, SaveError> {
        match choice {
            DriverChoice::Handle(handle) => Ok(handle.clone()),
            DriverChoice::Kind(kind) => self.get_kind(*kind, timeout).await,
        }
    }

    fn slot(&self, kind: DriverKind) -> &Mutex<Option<DriverHandle>> {
        match kind {
            DriverKind::Chrome => &self.chrome,
            DriverKind::Firefox => &self.firefox,
        }
    }

    async fn get_kind(&self, kind: DriverKind, timeout: Duration) -> Result<DriverHandle, SaveError> {
        let mut slot = self.slot(kind).lock().await;
        if let Some(ref handle) = *slot {
            return Ok(handle.clone());
        }

        let started = Instant::now();
        let driver = match self.factory.launch(kind, timeout).await {
            Ok(d) => d,
            Err(e) => {
                self.record_failure(kind);
                return Err(e);
            }
        };
        info!(
            "Launched {} driver in {}ms",
            kind,
            started.elapsed().as_millis()
        );
        let handle = DriverHandle::with_kind(Some(kind), driver);
        *slot = Some(handle.clone());
        self.clear_failure(kind);
        Ok(handle)
    }

    /// First kind in `kinds` that yields a driver, or `None`.
    ///
    /// [`SaveError::DriverUnavailable`] moves on quietly; any other error is
    /// logged as a warning and also moves on. Kinds that failed within the
    /// retry window are skipped without a launch attempt.
    pub async fn select_available(&self, kinds: &[DriverKind], timeout: Duration) -> Option<DriverKind> {
        for &kind in kinds {
            if self.is_live(kind).await {
                return Some(kind);
            }
            if self.failed_recently(kind) {
                debug!("Skipping {} driver: failed within the last {:?}", kind, self.retry_window);
                continue;
            }
            match self.get_kind(kind, timeout).await {
                Ok(_) => return Some(kind),
                Err(e) if e.is_unavailable() => {
                    debug!("{} driver unavailable: {}", kind, e);
                }
                Err(e) => {
                    warn!("Unexpected failure probing {} driver: {}", kind, e);
                }
            }
        }
        None
    }

    /// Whether a driver of this kind is already running.
    pub async fn is_live(&self, kind: DriverKind) -> bool {
        self.slot(kind).lock().await.is_some()
    }

    /// Quit every pooled driver. Later `get` calls launch fresh ones.
    pub async fn shutdown(&self) {
        for kind in DriverKind::PREFERENCE {
            let Some(handle) = self.slot(kind).lock().await.take() else {
                continue;
            };
            let mut driver = handle.lock().await;
            match driver.quit().await {
                Ok(()) => info!("Closed {} driver", kind),
                Err(e) => warn!("Failed to close {} driver cleanly: {}", kind, e),
            }
        }
    }

    fn failed_recently(&self, kind: DriverKind) -> bool {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .is_some_and(|at| at.elapsed() < self.retry_window)
    }

    fn record_failure(&self, kind: DriverKind) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind, Instant::now());
    }

    fn clear_failure(&self, kind: DriverKind) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&kind);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory drivers for unit and integration tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A driver that records calls and replays a scripted async response.
    pub struct ScriptedDriver {
        pub calls: Arc<std::sync::Mutex<Vec<String>>>,
        pub has_mount: bool,
        pub online: bool,
        pub response: Value,
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        async fn navigate(&mut self, url: &str) -> Result<(), SaveError> {
            self.calls.lock().unwrap().push(format!("navigate {url}"));
            Ok(())
        }

        async fn element_exists(&mut self, selector: &str) -> Result<bool, SaveError> {
            self.calls.lock().unwrap().push(format!("find {selector}"));
            Ok(self.has_mount)
        }

        async fn execute(&mut self, script: &str, _args: Vec<Value>) -> Result<Value, SaveError> {
            self.calls.lock().unwrap().push(format!("execute {script}"));
            Ok(Value::Bool(self.online))
        }

        async fn execute_async(&mut self, _script: &str, args: Vec<Value>) -> Result<Value, SaveError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("execute_async {}", Value::Array(args)));
            Ok(self.response.clone())
        }

        async fn quit(&mut self) -> Result<(), SaveError> {
            self.calls.lock().unwrap().push("quit".into());
            Ok(())
        }
    }

    /// Factory whose launches either succeed with a no-op driver or fail.
    pub struct CountingFactory {
        pub launches: AtomicUsize,
        pub fail_with: Option<fn(DriverKind) -> SaveError>,
        pub delay: Duration,
    }

    impl CountingFactory {
        pub fn ok() -> Self {
            Self {
                launches: AtomicUsize::new(0),
                fail_with: None,
                delay: Duration::ZERO,
            }
        }

        pub fn unavailable() -> Self {
            Self {
                launches: AtomicUsize::new(0),
                fail_with: Some(|kind| SaveError::DriverUnavailable {
                    driver: kind.name().into(),
                    reason: "not installed".into(),
                }),
                delay: Duration::ZERO,
            }
        }

        pub fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DriverFactory for CountingFactory {
        async fn launch(&self, kind: DriverKind, _timeout: Duration) -> Result<Box<dyn Driver>, SaveError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(fail) = self.fail_with {
                return Err(fail(kind));
            }
            Ok(Box::new(ScriptedDriver {
                calls: Arc::default(),
                has_mount: true,
                online: true,
                response: Value::Null,
            }))
        }
    }
}
