//! Progress-callback trait for export events and converter diagnostics.
//!
//! Inject an [`Arc<dyn ExportProgressCallback>`] via
//! [`crate::config::ExportConfigBuilder::progress_callback`] to observe an
//! export as it runs.
//!
//! # Converter stderr
//!
//! The subprocess backend captures each converter's stderr, filters it line
//! by line, and hands the surviving lines to
//! [`ExportProgressCallback::on_converter_stderr`]. With no callback
//! configured those lines go to the process's own stderr.
//!
//! # Example
//!
//! ```rust
//! use chart_saver::{ExportConfig, ExportProgressCallback, Format};
//! use std::sync::{Arc, Mutex};
//!
//! #[derive(Default)]
//! struct Collect {
//!     lines: Mutex<Vec<String>>,
//! }
//!
//! impl ExportProgressCallback for Collect {
//!     fn on_converter_stderr(&self, program: &str, line: &str) {
//!         self.lines.lock().unwrap().push(format!("{program}: {line}"));
//!     }
//! }
//!
//! let config = ExportConfig::builder()
//!     .progress_callback(Arc::new(Collect::default()))
//!     .build()
//!     .unwrap();
//! ```

use crate::backend::BackendKind;
use crate::content::Format;
use std::sync::Arc;

/// Called by the exporter and the backends as an export runs.
///
/// Implementations must be `Send + Sync`: exports may run on any tokio
/// worker thread. All methods default to no-ops.
pub trait ExportProgressCallback: Send + Sync {
    /// A backend has been chosen and is about to produce `format`.
    fn on_export_start(&self, format: Format, backend: BackendKind) {
        let _ = (format, backend);
    }

    /// A step of the export began, e.g. `"vl2vg"` or `"navigate"`.
    fn on_stage_start(&self, stage: &str) {
        let _ = stage;
    }

    /// A filtered stderr line from a converter process.
    fn on_converter_stderr(&self, program: &str, line: &str) {
        let _ = (program, line);
    }

    /// The export produced `bytes` bytes of `format`.
    fn on_export_complete(&self, format: Format, bytes: usize) {
        let _ = (format, bytes);
    }

    /// The export failed.
    fn on_export_error(&self, format: Format, error: &str) {
        let _ = (format, error);
    }
}

/// A no-op implementation.
pub struct NoopProgressCallback;

impl ExportProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExportConfig`].
pub type ProgressCallback = Arc<dyn ExportProgressCallback>;
