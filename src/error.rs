//! Error types for the chart-saver library.
//!
//! Every failure is a [`SaveError`]. The variants fall into three groups:
//!
//! * **Request errors**: the caller asked for something no backend can do
//!   (`UnsupportedFormat`, `CannotInferFormat`, `UnknownFormat`). Raised
//!   before any process is spawned or page loaded, and never retried.
//!
//! * **Unavailability**: `ExecutableNotFound` and `DriverUnavailable` mean
//!   "this backend cannot run here". Probes ([`crate::Backend::available`])
//!   turn them into `false` so a selector can move on; see
//!   [`SaveError::is_unavailable`].
//!
//! * **Execution errors**: a chosen backend started and failed
//!   (`ConversionFailed`, `JavascriptError`, `PageLoad`, `WebDriver`). They
//!   carry the raw stderr or in-page message.

use crate::content::{Format, FormatList, Mode};
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the chart-saver library.
#[derive(Debug, Error)]
pub enum SaveError {
    // ── Request errors ────────────────────────────────────────────────────
    /// The format is outside the backend's capabilities for this mode.
    #[error("Format '{format}' is not supported for {mode} specs.\nSupported: {allowed}")]
    UnsupportedFormat {
        format: Format,
        mode: Mode,
        allowed: FormatList,
    },

    /// No format was given and the sink has no name to infer one from.
    #[error("Cannot infer an output format: no format given and the output has no file extension.\nPass the format explicitly.")]
    CannotInferFormat,

    /// A format name or file extension that maps to no known format.
    #[error("Unknown output format '{name}'\nKnown formats: png, svg, pdf, vega, vega-lite, html, json")]
    UnknownFormat { name: String },

    /// A mode name that is neither vega nor vega-lite.
    #[error("Unknown spec mode '{name}' (expected 'vega' or 'vega-lite')")]
    UnknownMode { name: String },

    /// A backend name that is not registered.
    #[error("Unknown backend '{name}' (expected basic, html, browser or subprocess)")]
    UnknownBackend { name: String },

    // ── Unavailability ────────────────────────────────────────────────────
    /// A converter or driver executable is not installed.
    #[error(
        "Executable '{name}' not found.\n\
Install the converters with: npm install vega-lite vega-cli canvas\n\
or point CHART_SAVER_BIN_DIR at the directory containing '{name}'."
    )]
    ExecutableNotFound { name: String },

    /// A browser driver cannot be started in this environment.
    #[error("Browser driver '{driver}' is unavailable: {reason}")]
    DriverUnavailable { driver: String, reason: String },

    /// Every backend able to produce the format is unavailable.
    #[error("No available backend can produce '{format}' from {mode} specs.\nInstall a browser driver (chromedriver/geckodriver) or the vega-cli converters.")]
    NoBackendAvailable { format: Format, mode: Mode },

    // ── Execution errors ──────────────────────────────────────────────────
    /// A converter process exited unsuccessfully (or timed out, with no exit code).
    #[error("{program} failed (exit code {exit_code:?}):\n{stderr}")]
    ConversionFailed {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A converter process could not be spawned.
    #[error("Failed to run {program}: {source}")]
    ConverterSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The in-page compile/render step reported an error.
    #[error("Javascript error while rendering chart: {0}")]
    JavascriptError(String),

    /// The host page failed to load or a precondition on it failed.
    #[error("Could not load {url}: {reason}")]
    PageLoad { url: String, reason: String },

    /// A WebDriver command failed.
    #[error("WebDriver command '{command}' failed: {detail}")]
    WebDriver { command: String, detail: String },

    /// The local resource server could not be started.
    #[error("Resource server error: {0}")]
    Server(String),

    /// An offline runtime script is missing.
    #[error(
        "Script {package}@{version} not found at '{path}'.\n\
Download it to that path or set CHART_SAVER_SCRIPT_DIR, or export with offline = false."
    )]
    ScriptNotFound {
        package: String,
        version: String,
        path: PathBuf,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not write the exported chart.
    #[error("Failed to write output '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Internal ──────────────────────────────────────────────────────────
    /// An internal contract was broken, e.g. text content for a PNG export.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SaveError {
    /// `true` for the "cannot run here" class that availability probes absorb.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            SaveError::ExecutableNotFound { .. } | SaveError::DriverUnavailable { .. }
        )
    }
}

impl From<exec_locator::LocateError> for SaveError {
    fn from(e: exec_locator::LocateError) -> Self {
        match e {
            exec_locator::LocateError::NotFound { name, .. } => {
                SaveError::ExecutableNotFound { name }
            }
            exec_locator::LocateError::InvalidName(name) => SaveError::ExecutableNotFound { name },
        }
    }
}
