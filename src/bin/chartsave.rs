//! CLI binary for chart-saver.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ExportConfig` and writes the exported chart.

use anyhow::{bail, Context, Result};
use base64::Engine;
use chart_saver::{
    BackendKind, Content, DirectoryScripts, DriverKind, ExportConfig, ExportProgressCallback,
    Exporter, Format, Mode, ProgressCallback, Sink, Spec,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner showing the current stage, with converter stderr printed above it.
struct CliProgressCallback {
    bar: ProgressBar,
    started: Instant,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.set_message("selecting a backend…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            started: Instant::now(),
        })
    }
}

impl ExportProgressCallback for CliProgressCallback {
    fn on_export_start(&self, format: Format, backend: BackendKind) {
        self.bar.set_prefix("Exporting");
        self.bar.set_message(format!("{format} via {backend}"));
    }

    fn on_stage_start(&self, stage: &str) {
        self.bar.set_message(stage.to_string());
    }

    fn on_converter_stderr(&self, program: &str, line: &str) {
        self.bar.println(format!("  {} {}", dim(program), line));
    }

    fn on_export_complete(&self, format: Format, bytes: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} {}",
            green("✔"),
            bold(format.name()),
            dim(&format!(
                "{bytes} bytes  {:.1}s",
                self.started.elapsed().as_secs_f64()
            )),
        );
    }

    fn on_export_error(&self, format: Format, _error: &str) {
        self.bar.finish_and_clear();
        eprintln!("{} {} failed", red("✘"), bold(format.name()));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Save a Vega-Lite chart as PNG (format inferred from the extension)
  chartsave chart.vl.json -o chart.png

  # Compile Vega-Lite to Vega on stdout
  chartsave chart.vl.json -f vega

  # A low-level Vega spec from stdin, rendered to PDF via vega-cli
  cat chart.vg.json | chartsave - --mode vega --backend subprocess -o chart.pdf

  # Standalone HTML with the runtime inlined
  chartsave chart.vl.json -o chart.html --inline

  # Several formats at once, as a JSON mime bundle
  chartsave chart.vl.json --bundle png,svg,vega-lite > bundle.json

  # What can this machine produce?
  chartsave --list-formats --mode vega

FORMATS:
  png        raster image        browser, subprocess
  svg        vector image        browser, subprocess
  pdf        paginated document  subprocess
  vega       compiled Vega JSON  basic (vega specs), browser, subprocess
  vega-lite  source spec JSON    basic
  json       raw spec JSON       basic
  html       embeddable markup   html

ENVIRONMENT VARIABLES:
  CHART_SAVER_BIN_DIR     Directory searched first for vl2vg, vg2png, chromedriver, …
  CHART_SAVER_SCRIPT_DIR  Directory holding {package}-{version}.js runtime scripts
  RUST_LOG                Overrides -v / -q log filtering

SETUP:
  Browser backend:     install Chrome + chromedriver or Firefox + geckodriver
  Subprocess backend:  npm install vega-lite vega-cli canvas
"#;

/// Export Vega and Vega-Lite charts.
#[derive(Parser, Debug)]
#[command(
    name = "chartsave",
    version,
    about = "Export Vega and Vega-Lite charts to PNG, SVG, PDF, HTML and JSON",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Chart spec file, or `-` for stdin.
    #[arg(required_unless_present = "list_formats")]
    input: Option<String>,

    /// Write the chart to this file instead of stdout.
    #[arg(short, long, env = "CHARTSAVE_OUTPUT")]
    output: Option<PathBuf>,

    /// Output format (png, svg, pdf, vega, vega-lite, json, html). Default: from --output.
    #[arg(short, long, env = "CHARTSAVE_FORMAT")]
    format: Option<String>,

    /// Spec dialect: vega-lite or vega.
    #[arg(long, env = "CHARTSAVE_MODE", default_value = "vega-lite")]
    mode: String,

    /// Force a backend: basic, html, browser, subprocess.
    #[arg(long, env = "CHARTSAVE_BACKEND")]
    backend: Option<String>,

    /// Browser driver: chrome or firefox. Default: first that starts.
    #[arg(long, env = "CHARTSAVE_DRIVER")]
    driver: Option<String>,

    /// Browser page-load and script timeout in seconds.
    #[arg(long, env = "CHARTSAVE_DRIVER_TIMEOUT", default_value_t = 20)]
    driver_timeout: u64,

    /// Load the runtime from the CDN instead of serving it locally.
    #[arg(long, env = "CHARTSAVE_ONLINE")]
    online: bool,

    /// Output scale for png/svg.
    #[arg(long, env = "CHARTSAVE_SCALE_FACTOR", default_value_t = 1.0)]
    scale_factor: f64,

    /// vega-embed options as a JSON object.
    #[arg(long, env = "CHARTSAVE_EMBED_OPTIONS")]
    embed_options: Option<String>,

    /// Inline the runtime scripts into standalone HTML.
    #[arg(long, env = "CHARTSAVE_INLINE")]
    inline: bool,

    /// Full HTML document (true) or embeddable fragment (false).
    #[arg(long, env = "CHARTSAVE_STANDALONE")]
    standalone: Option<bool>,

    /// Extra argument for vg2png/vg2svg/vg2pdf (repeatable).
    #[arg(long = "converter-arg", allow_hyphen_values = true)]
    converter_args: Vec<String>,

    /// Kill a converter after this many seconds.
    #[arg(long, env = "CHARTSAVE_CONVERTER_TIMEOUT")]
    converter_timeout: Option<u64>,

    /// Directory of offline runtime scripts.
    #[arg(long, env = "CHART_SAVER_SCRIPT_DIR")]
    script_dir: Option<PathBuf>,

    /// Export several formats (comma-separated) as a JSON mime bundle.
    #[arg(long, value_delimiter = ',')]
    bundle: Vec<String>,

    /// List the formats this machine can produce for --mode, then exit.
    #[arg(long)]
    list_formats: bool,

    /// Disable the progress spinner.
    #[arg(long, env = "CHARTSAVE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "CHARTSAVE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "CHARTSAVE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.list_formats && cli.bundle.is_empty();
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExportProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;
    let exporter = Exporter::new(config);

    let result = run(&cli, &exporter).await;
    exporter.shutdown().await;
    result
}

async fn run(cli: &Cli, exporter: &Exporter) -> Result<()> {
    // ── List formats ─────────────────────────────────────────────────────
    if cli.list_formats {
        let mode = exporter.config().mode;
        let formats = exporter.available_formats(mode).await;
        if formats.is_empty() {
            bail!("No backend can export {mode} specs on this machine");
        }
        for format in formats {
            println!("{:<10} {}", format.short_name(), dim(format.name()));
        }
        return Ok(());
    }

    let input = cli.input.as_deref().context("No input given")?;
    let spec = read_spec(input).await?;

    // ── Bundle ───────────────────────────────────────────────────────────
    if !cli.bundle.is_empty() {
        let formats = cli
            .bundle
            .iter()
            .map(|f| f.parse::<Format>())
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid --bundle format")?;
        let bundle = exporter
            .bundle(&spec, &formats)
            .await
            .context("Export failed")?;
        let json: Map<String, Value> = bundle
            .into_iter()
            .map(|(mimetype, content)| (mimetype, bundle_value(content)))
            .collect();
        let text = serde_json::to_string_pretty(&json).context("Failed to serialise bundle")?;
        return write_text(cli.output.as_ref(), &text);
    }

    // ── Single export ────────────────────────────────────────────────────
    let format = cli
        .format
        .as_deref()
        .map(str::parse::<Format>)
        .transpose()
        .context("Invalid --format")?;
    let sink = match cli.output {
        Some(ref path) => Sink::path(path),
        None => {
            if format.is_none() {
                bail!("--format is required when writing to stdout");
            }
            Sink::writer(io::stdout())
        }
    };
    exporter
        .export(&spec, Some(sink), format)
        .await
        .context("Export failed")?;

    if !cli.quiet && !cli.no_progress {
        if let Some(ref path) = cli.output {
            eprintln!("   →  {}", bold(&path.display().to_string()));
        }
    }
    Ok(())
}

/// Map CLI args to `ExportConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExportConfig> {
    let mode: Mode = cli.mode.parse().context("Invalid --mode")?;
    let mut builder = ExportConfig::builder()
        .mode(mode)
        .driver_timeout(Duration::from_secs(cli.driver_timeout))
        .offline(!cli.online)
        .scale_factor(cli.scale_factor)
        .inline(cli.inline)
        .converter_args(cli.converter_args.iter().cloned());

    if let Some(ref name) = cli.backend {
        let kind: BackendKind = name.parse().context("Invalid --backend")?;
        builder = builder.backend(kind);
    }
    if let Some(ref name) = cli.driver {
        let kind: DriverKind = name.parse().context("Invalid --driver")?;
        builder = builder.driver(kind.into());
    }
    if let Some(ref raw) = cli.embed_options {
        let options: Map<String, Value> = serde_json::from_str(raw)
            .context("--embed-options must be a JSON object")?;
        builder = builder.embed_options(options);
    }
    if let Some(standalone) = cli.standalone {
        builder = builder.standalone(standalone);
    }
    if let Some(secs) = cli.converter_timeout {
        builder = builder.converter_timeout(Duration::from_secs(secs));
    }
    if let Some(ref dir) = cli.script_dir {
        builder = builder.scripts(Arc::new(DirectoryScripts::new(dir)));
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

async fn read_spec(input: &str) -> Result<Spec> {
    let text = if input == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read spec from stdin")?;
        buf
    } else {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("Failed to read spec from {input}"))?
    };
    match serde_json::from_str::<Value>(&text).context("Spec is not valid JSON")? {
        Value::Object(spec) => Ok(spec),
        other => bail!("Spec must be a JSON object, got {}", json_kind(&other)),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Bundle entries as JSON; binary content is base64-encoded.
fn bundle_value(content: Content) -> Value {
    match content {
        Content::Json(v) => v,
        Content::Text(s) => Value::String(s),
        Content::Binary(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}

fn write_text(path: Option<&PathBuf>, text: &str) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, text)
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(text.as_bytes())
                .and_then(|_| handle.write_all(b"\n"))
                .context("Failed to write to stdout")
        }
    }
}
