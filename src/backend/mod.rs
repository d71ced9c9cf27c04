//! The export contract every backend implements.
//!
//! ## Data Flow
//!
//! ```text
//! export_to(sink, format?) ──▶ infer format ──▶ serialize ──▶ write sink
//!                                                  │
//!                          capability check ◀──────┘  (before any work)
//!                                                  │
//!                                               render  (backend specific)
//! ```
//!
//! Backends implement [`Backend::render`]; the provided methods do the
//! capability check, mime bundle assembly, and sink writes, so no backend
//! can skip them.
//!
//! | Backend | vega | vega-lite |
//! |---------|------|-----------|
//! | [`basic`]      | raw-json, compiled-json | raw-json, source-json |
//! | [`html`]       | embeddable-markup | embeddable-markup |
//! | [`browser`]    | raster-image, vector-image | raster-image, vector-image, compiled-json |
//! | [`subprocess`] | paginated-document, raster-image, vector-image | paginated-document, raster-image, vector-image, compiled-json |

pub mod basic;
pub mod browser;
pub mod html;
pub mod subprocess;

use crate::config::ExportConfig;
use crate::content::{Content, Format, FormatList, MimeBundle, Mode, Purpose, Spec};
use crate::error::SaveError;
use async_trait::async_trait;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

// ── Backend kinds ────────────────────────────────────────────────────────

/// The registered backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Basic,
    Html,
    Browser,
    Subprocess,
}

const BASIC_LOW: &[Format] = &[Format::RawJson, Format::CompiledJson];
const BASIC_HIGH: &[Format] = &[Format::RawJson, Format::SourceJson];
const HTML_ANY: &[Format] = &[Format::Markup];
const BROWSER_LOW: &[Format] = &[Format::Raster, Format::Vector];
const BROWSER_HIGH: &[Format] = &[Format::Raster, Format::Vector, Format::CompiledJson];
const SUBPROCESS_LOW: &[Format] = &[Format::Document, Format::Raster, Format::Vector];
const SUBPROCESS_HIGH: &[Format] = &[
    Format::Document,
    Format::Raster,
    Format::Vector,
    Format::CompiledJson,
];

impl BackendKind {
    /// Order in which the exporter tries backends: cheapest first.
    pub const SELECTION_ORDER: [BackendKind; 4] = [
        BackendKind::Basic,
        BackendKind::Html,
        BackendKind::Browser,
        BackendKind::Subprocess,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Basic => "basic",
            BackendKind::Html => "html",
            BackendKind::Browser => "browser",
            BackendKind::Subprocess => "subprocess",
        }
    }

    /// Formats this backend produces for `mode`, in preference order.
    pub fn capabilities(self, mode: Mode) -> &'static [Format] {
        match (self, mode) {
            (BackendKind::Basic, Mode::LowLevel) => BASIC_LOW,
            (BackendKind::Basic, Mode::HighLevel) => BASIC_HIGH,
            (BackendKind::Html, _) => HTML_ANY,
            (BackendKind::Browser, Mode::LowLevel) => BROWSER_LOW,
            (BackendKind::Browser, Mode::HighLevel) => BROWSER_HIGH,
            (BackendKind::Subprocess, Mode::LowLevel) => SUBPROCESS_LOW,
            (BackendKind::Subprocess, Mode::HighLevel) => SUBPROCESS_HIGH,
        }
    }

    pub fn supports(self, mode: Mode, format: Format) -> bool {
        self.capabilities(mode).contains(&format)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = SaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(BackendKind::Basic),
            "html" => Ok(BackendKind::Html),
            "browser" | "selenium" | "webdriver" => Ok(BackendKind::Browser),
            "subprocess" | "node" => Ok(BackendKind::Subprocess),
            _ => Err(SaveError::UnknownBackend { name: s.to_string() }),
        }
    }
}

// ── Contract ─────────────────────────────────────────────────────────────

/// A pluggable exporter for one spec.
///
/// A backend holds its spec and config and nothing mutable; `serialize` is
/// idempotent for an unchanged spec and config.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn spec(&self) -> &Spec;

    fn config(&self) -> &ExportConfig;

    /// Produce `format`. Only called after the capability check passed.
    async fn render(&self, format: Format, purpose: Purpose) -> Result<Content, SaveError>;

    /// Best-effort probe: can this backend run here? Never fails.
    async fn available(&self) -> bool;

    fn mode(&self) -> Mode {
        self.config().mode
    }

    fn capabilities(&self) -> &'static [Format] {
        self.kind().capabilities(self.mode())
    }

    /// `Err(UnsupportedFormat)` unless `format` is in [`capabilities`](Self::capabilities).
    fn check_format(&self, format: Format) -> Result<(), SaveError> {
        if self.capabilities().contains(&format) {
            Ok(())
        } else {
            Err(SaveError::UnsupportedFormat {
                format,
                mode: self.mode(),
                allowed: FormatList(self.capabilities().to_vec()),
            })
        }
    }

    async fn serialize(&self, format: Format, purpose: Purpose) -> Result<Content, SaveError> {
        self.check_format(format)?;
        debug!("{} backend serializing {} ({:?})", self.kind(), format, purpose);
        self.render(format, purpose).await
    }

    /// Serialize every format into a mimetype-keyed bundle.
    ///
    /// All formats are validated before any is rendered.
    async fn mimebundle(&self, formats: &[Format]) -> Result<MimeBundle, SaveError> {
        for &format in formats {
            self.check_format(format)?;
        }
        let versions = &self.config().versions;
        let mut bundle = MimeBundle::with_capacity(formats.len());
        for &format in formats {
            let content = self.serialize(format, Purpose::Bundle).await?;
            bundle.insert(format.mimetype(versions), content);
        }
        Ok(bundle)
    }

    /// Serialize `format` (inferred from the sink name when `None`) and
    /// write it to `sink`, or return it when there is no sink.
    async fn export_to(
        &self,
        sink: Option<Sink>,
        format: Option<Format>,
    ) -> Result<Option<Content>, SaveError> {
        let format = match format {
            Some(f) => f,
            None => infer_format(sink.as_ref())?,
        };
        let content = self.serialize(format, Purpose::Save).await?;
        match sink {
            None => Ok(Some(content)),
            Some(sink) => {
                write_content(sink, format, &content).await?;
                Ok(None)
            }
        }
    }
}

// ── Sinks ────────────────────────────────────────────────────────────────

/// Destination for an export.
pub enum Sink {
    /// A file, written atomically.
    Path(PathBuf),
    /// Any writer; `name` (a file name) enables format inference.
    Writer {
        name: Option<String>,
        writer: Box<dyn Write + Send>,
    },
}

impl Sink {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Sink::Path(path.into())
    }

    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        Sink::Writer {
            name: None,
            writer: Box::new(writer),
        }
    }

    pub fn named_writer(name: impl Into<String>, writer: impl Write + Send + 'static) -> Self {
        Sink::Writer {
            name: Some(name.into()),
            writer: Box::new(writer),
        }
    }

    /// File name used for format inference.
    pub fn name(&self) -> Option<&Path> {
        match self {
            Sink::Path(p) => Some(p.as_path()),
            Sink::Writer { name, .. } => name.as_deref().map(Path::new),
        }
    }

    fn display_path(&self) -> PathBuf {
        match self {
            Sink::Path(p) => p.clone(),
            Sink::Writer { name, .. } => PathBuf::from(name.as_deref().unwrap_or("<writer>")),
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Sink::Writer { name, .. } => f.debug_struct("Writer").field("name", name).finish(),
        }
    }
}

/// Format implied by the sink's name.
pub fn infer_format(sink: Option<&Sink>) -> Result<Format, SaveError> {
    let name = sink.and_then(Sink::name).ok_or(SaveError::CannotInferFormat)?;
    Format::from_path(name)
}

/// Write `content` to `sink`, dispatching on the content variant.
///
/// Content of a variant `format` cannot carry is an
/// [`SaveError::InvariantViolation`]; it is never coerced.
pub async fn write_content(sink: Sink, format: Format, content: &Content) -> Result<(), SaveError> {
    if !format.accepts(content) {
        return Err(SaveError::InvariantViolation(format!(
            "{} content cannot be saved as {}",
            content.kind(),
            format
        )));
    }
    let bytes = content.to_bytes()?;
    let target = sink.display_path();
    let write_failed = |source: std::io::Error| SaveError::OutputWriteFailed {
        path: target.clone(),
        source,
    };

    match sink {
        Sink::Path(path) => {
            let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
                Some(parent) => parent.to_path_buf(),
                None => PathBuf::from("."),
            };
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(write_failed)?;
            let len = bytes.len();
            // Temp file beside the target so the rename never crosses filesystems.
            let written = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
                let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
                tmp.write_all(&bytes)?;
                tmp.as_file().sync_all()?;
                tmp.persist(&path).map_err(|e| e.error)?;
                Ok(path)
            })
            .await
            .map_err(|e| SaveError::Internal(format!("write task failed: {e}")))?
            .map_err(write_failed)?;
            debug!("Wrote {} bytes to {}", len, written.display());
        }
        Sink::Writer { mut writer, .. } => {
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                writer.write_all(&bytes)?;
                writer.flush()
            })
            .await
            .map_err(|e| SaveError::Internal(format!("write task failed: {e}")))?
            .map_err(write_failed)?;
        }
    }
    Ok(())
}
