//! Entry points: pick a backend for each request and run it.
//!
//! ## Backend selection
//!
//! ```text
//! format ──▶ configured backend? ──yes──▶ use it (errors surface as-is)
//!                  │ no
//!                  ▼
//!   basic → html → browser → subprocess
//!   (skip kinds that cannot produce the format for this mode,
//!    then take the first whose available() probe passes)
//! ```
//!
//! No capable kind at all is [`SaveError::UnsupportedFormat`]; capable but
//! unavailable kinds only is [`SaveError::NoBackendAvailable`].

use crate::backend::basic::BasicBackend;
use crate::backend::browser::BrowserBackend;
use crate::backend::html::HtmlBackend;
use crate::backend::subprocess::SubprocessBackend;
use crate::backend::{infer_format, write_content, Backend, BackendKind, Sink};
use crate::config::ExportConfig;
use crate::content::{Content, Format, FormatList, MimeBundle, Mode, Purpose, Spec};
use crate::driver::webdriver::WebDriverFactory;
use crate::driver::DriverPool;
use crate::error::SaveError;
use crate::server::ResourceServer;
use exec_locator::{ExecLocator, Locate};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// ── Services ─────────────────────────────────────────────────────────────

/// Long-lived resources shared by exports: the browser driver pool, the
/// local resource server and the executable locator.
///
/// Create one per application and share it via [`Exporter::with_services`];
/// call [`shutdown`](Self::shutdown) before exit to close browsers.
pub struct ExportServices {
    pub drivers: Arc<DriverPool>,
    pub server: Arc<ResourceServer>,
    pub locator: Arc<dyn Locate>,
}

impl ExportServices {
    pub fn new() -> Self {
        Self::with_locator(Arc::new(ExecLocator::new()))
    }

    /// Services whose converters and browser drivers come from `locator`.
    pub fn with_locator(locator: Arc<dyn Locate>) -> Self {
        let factory = Arc::new(WebDriverFactory::new(Arc::clone(&locator)));
        Self {
            drivers: Arc::new(DriverPool::new(factory)),
            server: Arc::new(ResourceServer::new()),
            locator,
        }
    }

    /// Quit pooled browsers and stop the resource server.
    pub async fn shutdown(&self) {
        self.drivers.shutdown().await;
        self.server.stop().await;
    }
}

impl Default for ExportServices {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExportServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportServices")
            .field("drivers", &self.drivers)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

// ── Exporter ─────────────────────────────────────────────────────────────

/// Exports specs with one configuration.
///
/// # Example
/// ```rust,no_run
/// use chart_saver::{ExportConfig, Exporter, Mode, Sink};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let spec = serde_json::from_str(r#"{"mark": "point", "data": {"values": []}}"#)?;
///     let exporter = Exporter::new(ExportConfig::default());
///     exporter.export(&spec, Some(Sink::path("chart.png")), None).await?;
///     exporter.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Exporter {
    config: ExportConfig,
    services: Arc<ExportServices>,
}

impl Exporter {
    /// An exporter with its own services.
    pub fn new(config: ExportConfig) -> Self {
        Self::with_services(config, Arc::new(ExportServices::new()))
    }

    pub fn with_services(config: ExportConfig, services: Arc<ExportServices>) -> Self {
        Self { config, services }
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn services(&self) -> &Arc<ExportServices> {
        &self.services
    }

    /// Construct the backend of `kind` for `spec`.
    pub fn backend(&self, kind: BackendKind, spec: Spec) -> Box<dyn Backend> {
        self.backend_with(kind, spec, self.config.clone())
    }

    fn backend_with(&self, kind: BackendKind, spec: Spec, config: ExportConfig) -> Box<dyn Backend> {
        match kind {
            BackendKind::Basic => Box::new(BasicBackend::new(spec, config)),
            BackendKind::Html => Box::new(HtmlBackend::new(spec, config)),
            BackendKind::Browser => Box::new(BrowserBackend::new(
                spec,
                config,
                Arc::clone(&self.services.drivers),
                Arc::clone(&self.services.server),
            )),
            BackendKind::Subprocess => Box::new(SubprocessBackend::new(
                spec,
                config,
                Arc::clone(&self.services.locator),
            )),
        }
    }

    /// The backend that will produce `format` for `spec`.
    pub async fn select_backend(&self, spec: &Spec, format: Format) -> Result<Box<dyn Backend>, SaveError> {
        if let Some(kind) = self.config.backend {
            let backend = self.backend(kind, spec.clone());
            backend.check_format(format)?;
            return Ok(backend);
        }

        let mode = self.config.mode;
        let capable: Vec<BackendKind> = BackendKind::SELECTION_ORDER
            .into_iter()
            .filter(|k| k.supports(mode, format))
            .collect();
        if capable.is_empty() {
            return Err(SaveError::UnsupportedFormat {
                format,
                mode,
                allowed: FormatList(supported_formats(mode).into_iter().collect()),
            });
        }

        for kind in capable {
            let backend = self.backend(kind, spec.clone());
            if backend.available().await {
                debug!("Selected {} backend for {}", kind, format);
                return Ok(backend);
            }
            debug!("{} backend unavailable for {}", kind, format);
        }
        Err(SaveError::NoBackendAvailable { format, mode })
    }

    /// Export `spec` to `sink`, or return the content when `sink` is `None`.
    ///
    /// `format` defaults to the one implied by the sink's file name.
    pub async fn export(
        &self,
        spec: &Spec,
        sink: Option<Sink>,
        format: Option<Format>,
    ) -> Result<Option<Content>, SaveError> {
        let format = match format {
            Some(f) => f,
            None => infer_format(sink.as_ref())?,
        };
        let result = self.export_inner(spec, sink, format).await;
        if let (Err(e), Some(cb)) = (&result, &self.config.progress_callback) {
            cb.on_export_error(format, &e.to_string());
        }
        result
    }

    async fn export_inner(
        &self,
        spec: &Spec,
        sink: Option<Sink>,
        format: Format,
    ) -> Result<Option<Content>, SaveError> {
        let backend = self.select_backend(spec, format).await?;
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_export_start(format, backend.kind());
        }
        let content = backend.serialize(format, Purpose::Save).await?;
        let size = content.len();
        let out = match sink {
            None => Some(content),
            Some(sink) => {
                info!("Writing {} ({} bytes) to {:?}", format, size, sink);
                write_content(sink, format, &content).await?;
                None
            }
        };
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_export_complete(format, size);
        }
        Ok(out)
    }

    /// Export to a file, inferring the format from its name.
    pub async fn save(&self, spec: &Spec, path: impl AsRef<Path>) -> Result<(), SaveError> {
        self.export(spec, Some(Sink::path(path.as_ref())), None)
            .await
            .map(|_| ())
    }

    /// Serialize every format, choosing a backend per format.
    ///
    /// All formats are checked before anything is rendered.
    pub async fn bundle(&self, spec: &Spec, formats: &[Format]) -> Result<MimeBundle, SaveError> {
        self.check_bundle(formats)?;
        let mut bundle = MimeBundle::with_capacity(formats.len());
        for &format in formats {
            let (mimetype, content) = self.bundle_entry(spec, format).await?;
            bundle.insert(mimetype, content);
        }
        Ok(bundle)
    }

    pub(crate) fn check_bundle(&self, formats: &[Format]) -> Result<(), SaveError> {
        if let Some(kind) = self.config.backend {
            let allowed = kind.capabilities(self.config.mode);
            if let Some(&bad) = formats.iter().find(|f| !allowed.contains(f)) {
                return Err(SaveError::UnsupportedFormat {
                    format: bad,
                    mode: self.config.mode,
                    allowed: FormatList(allowed.to_vec()),
                });
            }
            return Ok(());
        }
        let supported = supported_formats(self.config.mode);
        match formats.iter().find(|f| !supported.contains(f)) {
            Some(&bad) => Err(SaveError::UnsupportedFormat {
                format: bad,
                mode: self.config.mode,
                allowed: FormatList(supported.into_iter().collect()),
            }),
            None => Ok(()),
        }
    }

    pub(crate) async fn bundle_entry(&self, spec: &Spec, format: Format) -> Result<(String, Content), SaveError> {
        let backend = self.select_backend(spec, format).await?;
        let content = backend.serialize(format, Purpose::Bundle).await?;
        Ok((format.mimetype(&self.config.versions), content))
    }

    /// Formats some currently available backend can produce for `mode`.
    pub async fn available_formats(&self, mode: Mode) -> BTreeSet<Format> {
        let mut config = self.config.clone();
        config.mode = mode;
        let mut formats = BTreeSet::new();
        for kind in BackendKind::SELECTION_ORDER {
            if self.config.backend.is_some_and(|k| k != kind) {
                continue;
            }
            let backend = self.backend_with(kind, Spec::new(), config.clone());
            if backend.available().await {
                formats.extend(backend.capabilities().iter().copied());
            }
        }
        formats
    }

    /// Close the shared services. See [`ExportServices::shutdown`].
    pub async fn shutdown(&self) {
        self.services.shutdown().await;
    }

    /// Blocking [`export`](Self::export) on a private runtime.
    ///
    /// Browsers and the resource server are tied to that runtime, so the
    /// services are shut down before returning.
    pub fn export_sync(
        &self,
        spec: &Spec,
        sink: Option<Sink>,
        format: Option<Format>,
    ) -> Result<Option<Content>, SaveError> {
        self.block_on(self.export(spec, sink, format))
    }

    /// Blocking [`bundle`](Self::bundle); see [`export_sync`](Self::export_sync).
    pub fn bundle_sync(&self, spec: &Spec, formats: &[Format]) -> Result<MimeBundle, SaveError> {
        self.block_on(self.bundle(spec, formats))
    }

    fn block_on<T>(&self, fut: impl std::future::Future<Output = Result<T, SaveError>>) -> Result<T, SaveError> {
        tokio::runtime::Runtime::new()
            .map_err(|e| SaveError::Internal(format!("Failed to create tokio runtime: {}", e)))?
            .block_on(async {
                let result = fut.await;
                self.services.shutdown().await;
                result
            })
    }
}

/// Union of every backend's capabilities for `mode`.
pub fn supported_formats(mode: Mode) -> BTreeSet<Format> {
    BackendKind::SELECTION_ORDER
        .into_iter()
        .flat_map(|k| k.capabilities(mode).iter().copied())
        .collect()
}
