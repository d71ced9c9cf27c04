//! # chart-saver
//!
//! Export Vega and Vega-Lite charts to PNG, SVG, PDF, HTML and compiled JSON.
//!
//! ## Why this crate?
//!
//! A chart spec is only a description; turning it into pixels needs the
//! JavaScript runtime that defines the grammar. This crate drives that
//! runtime in whichever way the host supports: a headless browser over
//! WebDriver, or the Node converters from `vega-cli`. It falls back between
//! them automatically, and formats that need no rendering (JSON, HTML) are
//! produced in-process.
//!
//! ## Backends
//!
//! ```text
//! spec + format
//!  │
//!  ├─ basic       spec as JSON                      (always available)
//!  ├─ html        page/fragment embedding the chart (always available)
//!  ├─ browser     chromedriver/geckodriver → page → vega-embed → PNG/SVG
//!  └─ subprocess  vl2vg → vg2png / vg2svg / vg2pdf
//! ```
//!
//! The [`Exporter`] tries them in that order and uses the first one that
//! both supports the format and can run here.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chart_saver::{ExportConfig, Exporter, Format, Mode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let spec = serde_json::from_str(r#"{
//!         "data": {"values": [{"a": 1}, {"a": 3}]},
//!         "mark": "bar",
//!         "encoding": {"y": {"field": "a", "type": "quantitative"}}
//!     }"#)?;
//!     let exporter = Exporter::new(ExportConfig::default());
//!     exporter.save(&spec, "chart.svg").await?;
//!
//!     let bundle = exporter.bundle(&spec, &[Format::SourceJson, Format::Markup]).await?;
//!     eprintln!("{} bundle entries", bundle.len());
//!     exporter.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `chartsave` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ## Environment
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `CHART_SAVER_BIN_DIR` | searched first for converters and browser drivers |
//! | `CHART_SAVER_SCRIPT_DIR` | directory of `{package}-{version}.js` runtime scripts |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod content;
pub mod driver;
pub mod error;
pub mod export;
pub mod locate;
pub mod pipeline;
pub mod progress;
pub mod scripts;
pub mod server;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{Backend, BackendKind, Sink};
pub use config::{ExportConfig, ExportConfigBuilder, StderrFilter};
pub use content::{Content, Format, MimeBundle, Mode, Purpose, RuntimeVersions, Spec};
pub use driver::{DriverChoice, DriverHandle, DriverKind, DriverPool};
pub use error::SaveError;
pub use exec_locator::{ExecLocator, Locate};
pub use export::{supported_formats, ExportServices, Exporter};
pub use progress::{ExportProgressCallback, NoopProgressCallback, ProgressCallback};
pub use scripts::{DirectoryScripts, ScriptSource, StaticScripts};
pub use server::ResourceServer;
pub use stream::{bundle_stream, BundleStream};
