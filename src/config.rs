//! Configuration types for chart export.
//!
//! Every export knob lives in [`ExportConfig`], built via its
//! [`ExportConfigBuilder`]. Backends receive a clone of the config together
//! with the spec; none of them read process-wide settings on their own.

use crate::backend::BackendKind;
use crate::content::{Mode, RuntimeVersions};
use crate::driver::DriverChoice;
use crate::error::SaveError;
use crate::progress::ProgressCallback;
use crate::scripts::{DirectoryScripts, ScriptSource};
use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate over converter stderr lines: `true` keeps the line.
pub type StderrFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A warning vg2png and friends print for every chart with interactive
/// signals; it never indicates a problem.
pub const BENIGN_CONVERTER_WARNING: &str = "WARN Can not resolve event source: window";

/// The filter used when none is configured.
pub fn default_stderr_filter() -> StderrFilter {
    Arc::new(|line: &str| line.trim() != BENIGN_CONVERTER_WARNING)
}

/// Configuration for an export.
///
/// Built via [`ExportConfig::builder()`] or [`ExportConfig::default()`].
///
/// # Example
/// ```rust
/// use chart_saver::{ExportConfig, Mode};
///
/// let config = ExportConfig::builder()
///     .mode(Mode::LowLevel)
///     .scale_factor(2.0)
///     .offline(false)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExportConfig {
    /// Dialect of the input spec. Default: [`Mode::HighLevel`].
    pub mode: Mode,

    /// Force a backend. `None` lets the exporter pick the first available
    /// backend that supports the format (basic, html, browser, subprocess).
    pub backend: Option<BackendKind>,

    /// Options passed to vega-embed (browser and HTML backends).
    pub embed_options: Map<String, Value>,

    /// Runtime package versions. Default: vega 5.9.0, vega-lite 4.0.2,
    /// vega-embed 6.2.1.
    pub versions: RuntimeVersions,

    /// Browser driver to use. `None` probes chrome, then firefox.
    pub driver: Option<DriverChoice>,

    /// Page-load and script timeout for browser exports. Default: 20 s.
    pub driver_timeout: Duration,

    /// Serve runtime scripts locally instead of loading them from the CDN.
    /// Default: true.
    pub offline: bool,

    /// Output scale for raster and vector images. Default: 1.0.
    ///
    /// An explicit `scaleFactor` in [`embed_options`](Self::embed_options)
    /// takes precedence.
    pub scale_factor: f64,

    /// Source of runtime script text for offline and inline use.
    /// `None` reads from [`crate::scripts::DirectoryScripts::from_env`].
    pub scripts: Option<Arc<dyn ScriptSource>>,

    /// Inline the runtime scripts into standalone HTML. Default: false.
    pub inline: bool,

    /// Emit a full HTML document rather than an embeddable fragment.
    /// `None` means standalone when saving, fragment when bundling.
    pub standalone: Option<bool>,

    /// Extra arguments appended to each render-stage converter.
    pub converter_args: Vec<String>,

    /// Filter for converter stderr. `None` forwards every line.
    /// Default: drops [`BENIGN_CONVERTER_WARNING`].
    pub stderr_filter: Option<StderrFilter>,

    /// Kill a converter that runs longer than this. Default: no limit.
    pub converter_timeout: Option<Duration>,

    /// Optional event sink for export progress and converter diagnostics.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            backend: None,
            embed_options: Map::new(),
            versions: RuntimeVersions::default(),
            driver: None,
            driver_timeout: Duration::from_secs(20),
            offline: true,
            scale_factor: 1.0,
            scripts: None,
            inline: false,
            standalone: None,
            converter_args: Vec::new(),
            stderr_filter: Some(default_stderr_filter()),
            converter_timeout: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportConfig")
            .field("mode", &self.mode)
            .field("backend", &self.backend)
            .field("embed_options", &self.embed_options)
            .field("versions", &self.versions)
            .field("driver", &self.driver)
            .field("driver_timeout", &self.driver_timeout)
            .field("offline", &self.offline)
            .field("scale_factor", &self.scale_factor)
            .field("scripts", &self.scripts.as_ref().map(|_| "<dyn ScriptSource>"))
            .field("inline", &self.inline)
            .field("standalone", &self.standalone)
            .field("converter_args", &self.converter_args)
            .field("stderr_filter", &self.stderr_filter.as_ref().map(|_| "<fn>"))
            .field("converter_timeout", &self.converter_timeout)
            .finish()
    }
}

impl ExportConfig {
    /// Create a new builder for `ExportConfig`.
    pub fn builder() -> ExportConfigBuilder {
        ExportConfigBuilder {
            config: Self::default(),
            suppress_patterns: Vec::new(),
        }
    }

    /// The configured script source, or the directory one from the environment.
    pub fn script_source(&self) -> Arc<dyn ScriptSource> {
        match self.scripts {
            Some(ref source) => Arc::clone(source),
            None => Arc::new(DirectoryScripts::from_env()),
        }
    }

    /// Whether a converter stderr line should be forwarded.
    pub fn keep_stderr_line(&self, line: &str) -> bool {
        self.stderr_filter.as_ref().map_or(true, |f| f(line))
    }
}

/// Builder for [`ExportConfig`].
pub struct ExportConfigBuilder {
    config: ExportConfig,
    suppress_patterns: Vec<String>,
}

impl fmt::Debug for ExportConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportConfigBuilder")
            .field("config", &self.config)
            .field("suppress_patterns", &self.suppress_patterns)
            .finish()
    }
}

impl ExportConfigBuilder {
    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.backend = Some(kind);
        self
    }

    pub fn embed_options(mut self, options: Map<String, Value>) -> Self {
        self.config.embed_options = options;
        self
    }

    pub fn embed_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.embed_options.insert(key.into(), value);
        self
    }

    pub fn versions(mut self, versions: RuntimeVersions) -> Self {
        self.config.versions = versions;
        self
    }

    pub fn driver(mut self, driver: DriverChoice) -> Self {
        self.config.driver = Some(driver);
        self
    }

    pub fn driver_timeout(mut self, timeout: Duration) -> Self {
        self.config.driver_timeout = timeout;
        self
    }

    pub fn offline(mut self, v: bool) -> Self {
        self.config.offline = v;
        self
    }

    pub fn scale_factor(mut self, factor: f64) -> Self {
        self.config.scale_factor = factor;
        self
    }

    pub fn scripts(mut self, source: Arc<dyn ScriptSource>) -> Self {
        self.config.scripts = Some(source);
        self
    }

    pub fn inline(mut self, v: bool) -> Self {
        self.config.inline = v;
        self
    }

    pub fn standalone(mut self, v: bool) -> Self {
        self.config.standalone = Some(v);
        self
    }

    pub fn converter_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.converter_args.push(arg.into());
        self
    }

    pub fn converter_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .converter_args
            .extend(args.into_iter().map(Into::into));
        self
    }

    /// Replace the stderr filter. The predicate returns `true` to keep a line.
    pub fn stderr_filter(mut self, filter: StderrFilter) -> Self {
        self.config.stderr_filter = Some(filter);
        self
    }

    /// Forward every converter stderr line unfiltered.
    pub fn no_stderr_filter(mut self) -> Self {
        self.config.stderr_filter = None;
        self
    }

    /// Also drop stderr lines matching `pattern` (a regex, compiled in `build`).
    pub fn suppress_stderr_matching(mut self, pattern: impl Into<String>) -> Self {
        self.suppress_patterns.push(pattern.into());
        self
    }

    pub fn converter_timeout(mut self, timeout: Duration) -> Self {
        self.config.converter_timeout = Some(timeout);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExportConfig, SaveError> {
        let mut config = self.config;
        if !config.scale_factor.is_finite() || config.scale_factor <= 0.0 {
            return Err(SaveError::InvalidConfig(format!(
                "scale factor must be a positive number, got {}",
                config.scale_factor
            )));
        }
        if config.driver_timeout.is_zero() {
            return Err(SaveError::InvalidConfig(
                "driver timeout must be greater than zero".into(),
            ));
        }
        if config.converter_timeout.is_some_and(|t| t.is_zero()) {
            return Err(SaveError::InvalidConfig(
                "converter timeout must be greater than zero".into(),
            ));
        }

        if !self.suppress_patterns.is_empty() {
            let patterns = self
                .suppress_patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        SaveError::InvalidConfig(format!("invalid stderr pattern '{p}': {e}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let base = config.stderr_filter.take();
            config.stderr_filter = Some(Arc::new(move |line: &str| {
                base.as_ref().map_or(true, |f| f(line))
                    && !patterns.iter().any(|re| re.is_match(line))
            }));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ExportConfig::default();
        assert_eq!(c.mode, Mode::HighLevel);
        assert_eq!(c.driver_timeout, Duration::from_secs(20));
        assert!(c.offline);
        assert_eq!(c.scale_factor, 1.0);
        assert!(c.converter_timeout.is_none());
        assert!(c.standalone.is_none());
    }

    #[test]
    fn default_filter_drops_benign_warning_only() {
        let c = ExportConfig::default();
        assert!(!c.keep_stderr_line(BENIGN_CONVERTER_WARNING));
        assert!(c.keep_stderr_line("Error: Invalid specification"));
    }

    #[test]
    fn no_filter_keeps_everything() {
        let c = ExportConfig::builder().no_stderr_filter().build().unwrap();
        assert!(c.keep_stderr_line(BENIGN_CONVERTER_WARNING));
    }

    #[test]
    fn suppress_patterns_combine_with_default_filter() {
        let c = ExportConfig::builder()
            .suppress_stderr_matching(r"^DEPRECATION")
            .build()
            .unwrap();
        assert!(!c.keep_stderr_line("DEPRECATION: old flag"));
        assert!(!c.keep_stderr_line(BENIGN_CONVERTER_WARNING));
        assert!(c.keep_stderr_line("real error"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = ExportConfig::builder()
            .suppress_stderr_matching("(")
            .build()
            .unwrap_err();
        assert!(matches!(err, SaveError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_non_positive_scale() {
        for factor in [0.0, -1.0, f64::NAN] {
            assert!(ExportConfig::builder().scale_factor(factor).build().is_err());
        }
    }

    #[test]
    fn rejects_zero_timeouts() {
        assert!(ExportConfig::builder()
            .driver_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(ExportConfig::builder()
            .converter_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn builder_collects_converter_args() {
        let c = ExportConfig::builder()
            .converter_arg("--scale")
            .converter_args(["2", "--seed"])
            .build()
            .unwrap();
        assert_eq!(c.converter_args, vec!["--scale", "2", "--seed"]);
    }

    #[test]
    fn debug_hides_callbacks() {
        let s = format!("{:?}", ExportConfig::default());
        assert!(s.contains("stderr_filter: Some(\"<fn>\")"), "{s}");
    }
}
