//! Browser backend: renders charts in headless Chrome or Firefox.
//!
//! ## Flow
//!
//! ```text
//! resolve driver ─▶ publish host page ─▶ navigate ─▶ check #vis ─▶ execute_async ─▶ decode
//!                   (+ runtime scripts         (about:blank first)       │
//!                    when offline)                                       ▼
//!                                                         {result} | {error}
//! ```
//!
//! The whole sequence runs while holding the driver handle's lock, so two
//! exports sharing a driver never interleave commands on one page.

use super::{Backend, BackendKind};
use crate::config::ExportConfig;
use crate::content::{Content, Format, Purpose, Spec};
use crate::driver::{Driver, DriverChoice, DriverKind, DriverPool};
use crate::error::SaveError;
use crate::scripts::{cdn_url, load_scripts, script_file_name};
use crate::server::ResourceServer;
use async_trait::async_trait;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Runs in the page. Arguments: spec, embed options, wire format, callback.
const EXTRACT_SCRIPT: &str = r#"
let spec = arguments[0];
const embedOpt = arguments[1];
const format = arguments[2];
const done = arguments[3];

if (format === 'vega') {
    if (embedOpt.mode === 'vega-lite') {
        const vegaLite = (typeof window.vegaLite === "undefined") ? window.vl : window.vegaLite;
        try {
            spec = vegaLite.compile(spec).spec;
        } catch (error) {
            done({error: error.toString()});
            return;
        }
    }
    done({result: spec});
    return;
}

vegaEmbed('#vis', spec, embedOpt).then(function(result) {
    if (format === 'png') {
        result.view
            .toCanvas(embedOpt.scaleFactor || 1)
            .then(function(canvas) { return canvas.toDataURL('image/png'); })
            .then(result => done({result}))
            .catch(function(err) { done({error: err.toString()}); });
    } else if (format === 'svg') {
        result.view
            .toSVG(embedOpt.scaleFactor || 1)
            .then(result => done({result}))
            .catch(function(err) { done({error: err.toString()}); });
    } else {
        done({error: "Unrecognized format: " + format});
    }
}).catch(function(err) {
    done({error: err.toString()});
});
"#;

static PNG_DATA_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^data:image/png;base64,(.*)$").unwrap());

fn host_page(sources: &[String; 3]) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>Chart export</title>
  <script src="{}"></script>
  <script src="{}"></script>
  <script src="{}"></script>
</head>
<body>
  <div id="vis"></div>
</body>
</html>
"#,
        sources[0], sources[1], sources[2]
    )
}

/// Exports raster and vector images (and compiled JSON) through a browser.
pub struct BrowserBackend {
    spec: Spec,
    config: ExportConfig,
    drivers: Arc<DriverPool>,
    server: Arc<ResourceServer>,
}

impl BrowserBackend {
    pub fn new(
        spec: Spec,
        config: ExportConfig,
        drivers: Arc<DriverPool>,
        server: Arc<ResourceServer>,
    ) -> Self {
        Self {
            spec,
            config,
            drivers,
            server,
        }
    }

    /// Embed options plus `mode`, with the configured scale factor applied
    /// only when the options carry none.
    pub fn merged_options(&self) -> Map<String, Value> {
        let mut opt = self.config.embed_options.clone();
        if self.config.scale_factor != 1.0 && !opt.contains_key("scaleFactor") {
            opt.insert("scaleFactor".into(), Value::from(self.config.scale_factor));
        }
        opt.insert("mode".into(), Value::String(self.config.mode.name().into()));
        opt
    }

    async fn resolve_choice(&self) -> Result<DriverChoice, SaveError> {
        if let Some(ref choice) = self.config.driver {
            return Ok(choice.clone());
        }
        self.drivers
            .select_available(&DriverKind::PREFERENCE, self.config.driver_timeout)
            .await
            .map(DriverChoice::Kind)
            .ok_or_else(|| SaveError::DriverUnavailable {
                driver: "chrome, firefox".into(),
                reason: "no browser driver could be started".into(),
            })
    }

    /// Publish the runtime scripts (offline) and the host page; returns the
    /// page URL and its route.
    ///
    /// Script routes carry the package version (`/vega-lite-4.0.2.js`), so
    /// exporters sharing a server with different runtimes never overwrite
    /// each other's scripts. They stay published for later exports.
    async fn publish_page(&self) -> Result<(String, String), SaveError> {
        let versions = &self.config.versions;
        let sources: [String; 3] = if self.config.offline {
            let texts = load_scripts(self.config.script_source(), versions).await?;
            let routes = versions.packages().map(|(p, v)| script_file_name(p, v));
            for (route, text) in routes.iter().zip(texts) {
                self.server
                    .publish(text, Some(route.as_str()), ResourceServer::cors_headers())
                    .await?;
            }
            routes.map(|r| format!("/{r}"))
        } else {
            versions.packages().map(|(p, v)| cdn_url(p, v))
        };

        let url = self
            .server
            .publish(host_page(&sources), None, ResourceServer::cors_headers())
            .await?;
        let route = route_of(&url);
        Ok((url, route))
    }

    async fn extract(&self, driver: &mut dyn Driver, url: &str, format: Format) -> Result<Value, SaveError> {
        self.stage("navigate");
        driver.navigate("about:blank").await?;
        driver.navigate(url).await?;

        if !driver.element_exists("#vis").await? {
            return Err(SaveError::PageLoad {
                url: url.to_string(),
                reason: "Could not load the host page (#vis missing)".into(),
            });
        }
        if !self.config.offline {
            let online = driver.execute("return navigator.onLine", Vec::new()).await?;
            if online != Value::Bool(true) {
                return Err(SaveError::PageLoad {
                    url: url.to_string(),
                    reason: format!(
                        "Internet connection required for saving chart as {} with offline=false",
                        format.short_name()
                    ),
                });
            }
        }

        self.stage("extract");
        let args = vec![
            Value::Object(self.spec.clone()),
            Value::Object(self.merged_options()),
            Value::String(format.short_name().into()),
        ];
        let reply = driver.execute_async(EXTRACT_SCRIPT, args).await?;
        if let Some(error) = reply.get("error") {
            let message = match error {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            if !message.is_empty() {
                return Err(SaveError::JavascriptError(message));
            }
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    fn stage(&self, name: &str) {
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_start(name);
        }
    }
}

#[async_trait]
impl Backend for BrowserBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Browser
    }

    fn spec(&self) -> &Spec {
        &self.spec
    }

    fn config(&self) -> &ExportConfig {
        &self.config
    }

    async fn render(&self, format: Format, _purpose: Purpose) -> Result<Content, SaveError> {
        let choice = self.resolve_choice().await?;
        let handle = self.drivers.get(&choice, self.config.driver_timeout).await?;
        let (url, page_route) = self.publish_page().await?;
        info!("Rendering {} via {} at {}", format, handle.kind().map_or("custom", DriverKind::name), url);

        let result = {
            let mut driver = handle.lock().await;
            self.extract(&mut **driver, &url, format).await
        };
        self.server.unpublish(&page_route);
        decode(format, result?)
    }

    async fn available(&self) -> bool {
        match self.config.driver {
            Some(DriverChoice::Handle(_)) => true,
            Some(DriverChoice::Kind(kind)) => self
                .drivers
                .select_available(&[kind], self.config.driver_timeout)
                .await
                .is_some(),
            None => self
                .drivers
                .select_available(&DriverKind::PREFERENCE, self.config.driver_timeout)
                .await
                .is_some(),
        }
    }
}

fn route_of(url: &str) -> String {
    url.splitn(4, '/').nth(3).unwrap_or_default().to_string()
}

/// Turn the page's result into content for `format`.
fn decode(format: Format, result: Value) -> Result<Content, SaveError> {
    match format {
        Format::Raster => {
            let encoded = result
                .as_str()
                .and_then(|s| PNG_DATA_URL.captures(s))
                .and_then(|c| c.get(1))
                .ok_or_else(|| {
                    SaveError::JavascriptError(format!("expected a PNG data URL, got {result}"))
                })?
                .as_str();
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| SaveError::JavascriptError(format!("invalid PNG data URL: {e}")))?;
            debug!("Decoded {} PNG bytes", bytes.len());
            Ok(Content::Binary(bytes))
        }
        Format::Vector => match result {
            Value::String(svg) => Ok(Content::Text(svg)),
            other => Err(SaveError::JavascriptError(format!("expected SVG markup, got {other}"))),
        },
        Format::CompiledJson => Ok(Content::Json(result)),
        other => Err(SaveError::InvariantViolation(format!(
            "browser backend cannot decode {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExportConfigBuilder;
    use crate::content::Mode;
    use crate::driver::testing::{CountingFactory, ScriptedDriver};
    use crate::driver::DriverHandle;
    use crate::scripts::StaticScripts;
    use serde_json::json;
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<String>>>;

    fn spec() -> Spec {
        match json!({"mark": "point", "data": {"values": []}}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    fn scripted(response: Value, has_mount: bool, online: bool) -> (DriverHandle, Calls) {
        let calls: Calls = Arc::default();
        let handle = DriverHandle::new(Box::new(ScriptedDriver {
            calls: Arc::clone(&calls),
            has_mount,
            online,
            response,
        }));
        (handle, calls)
    }

    fn backend(config: ExportConfig) -> (BrowserBackend, Arc<CountingFactory>, Arc<ResourceServer>) {
        let factory = Arc::new(CountingFactory::ok());
        let server = Arc::new(ResourceServer::new());
        let b = BrowserBackend::new(
            spec(),
            config,
            Arc::new(DriverPool::new(factory.clone())),
            Arc::clone(&server),
        );
        (b, factory, server)
    }

    fn online_config(handle: DriverHandle) -> ExportConfigBuilder {
        ExportConfig::builder().driver(handle.into()).offline(false)
    }

    #[tokio::test]
    async fn unsupported_format_never_launches_a_driver() {
        let config = ExportConfig::builder().mode(Mode::LowLevel).build().unwrap();
        let (b, factory, _) = backend(config);
        let err = b.serialize(Format::CompiledJson, Purpose::Save).await.unwrap_err();
        assert!(matches!(err, SaveError::UnsupportedFormat { .. }));
        assert_eq!(factory.launches(), 0);
    }

    #[tokio::test]
    async fn png_data_url_is_decoded() {
        let (handle, calls) = scripted(json!({"result": "data:image/png;base64,iVBORw0KGgo="}), true, true);
        let (b, _, server) = backend(online_config(handle).build().unwrap());
        let out = b.serialize(Format::Raster, Purpose::Save).await.unwrap();
        assert_eq!(out, Content::Binary(vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]));

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls[0], "navigate about:blank");
        assert!(calls[1].starts_with("navigate http://127.0.0.1:"));
        assert_eq!(calls[2], "find #vis");
        assert_eq!(calls[3], "execute return navigator.onLine");
        assert!(calls[4].contains(r#""png""#), "{}", calls[4]);
        server.stop().await;
    }

    #[tokio::test]
    async fn javascript_errors_propagate() {
        let (handle, _) = scripted(json!({"error": "Error: Invalid specification"}), true, true);
        let (b, _, server) = backend(online_config(handle).build().unwrap());
        let err = b.serialize(Format::Vector, Purpose::Save).await.unwrap_err();
        match err {
            SaveError::JavascriptError(msg) => assert!(msg.contains("Invalid specification")),
            other => panic!("unexpected: {other}"),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn missing_mount_point_is_a_page_load_error() {
        let (handle, calls) = scripted(json!({"result": "<svg/>"}), false, true);
        let (b, _, server) = backend(online_config(handle).build().unwrap());
        let err = b.serialize(Format::Vector, Purpose::Save).await.unwrap_err();
        assert!(matches!(err, SaveError::PageLoad { .. }), "{err}");
        assert!(!calls.lock().unwrap().iter().any(|c| c.starts_with("execute_async")));
        server.stop().await;
    }

    #[tokio::test]
    async fn cdn_scripts_require_network() {
        let (handle, _) = scripted(json!({"result": "<svg/>"}), true, false);
        let (b, _, server) = backend(online_config(handle).build().unwrap());
        let err = b.serialize(Format::Vector, Purpose::Save).await.unwrap_err();
        assert!(err.to_string().contains("Internet connection required"), "{err}");
        server.stop().await;
    }

    #[tokio::test]
    async fn offline_mode_serves_scripts_locally() {
        let versions = crate::content::RuntimeVersions::default();
        let scripts = StaticScripts::new()
            .with("vega", &versions.vega, "1")
            .with("vega-lite", &versions.vega_lite, "2")
            .with("vega-embed", &versions.vega_embed, "3");
        let (handle, calls) = scripted(json!({"result": "<svg/>"}), true, false);
        let config = ExportConfig::builder()
            .driver(handle.into())
            .scripts(Arc::new(scripts))
            .build()
            .unwrap();
        let (b, _, server) = backend(config);
        let out = b.serialize(Format::Vector, Purpose::Save).await.unwrap();
        assert_eq!(out, Content::Text("<svg/>".into()));
        // No connectivity probe when offline.
        assert!(!calls.lock().unwrap().iter().any(|c| c.contains("navigator.onLine")));
        // The host page is withdrawn after the export; scripts stay.
        let page = calls.lock().unwrap()[1].trim_start_matches("navigate ").to_string();
        assert!(!server.unpublish(&route_of(&page)));
        assert!(server.unpublish(&format!("vega-{}.js", versions.vega)));
        server.stop().await;
    }

    #[tokio::test]
    async fn offline_runtimes_of_different_versions_coexist() {
        let server = Arc::new(ResourceServer::new());
        let pool = Arc::new(DriverPool::new(Arc::new(CountingFactory::ok())));
        let v4 = crate::content::RuntimeVersions::default();
        let v5 = crate::content::RuntimeVersions {
            vega_lite: "5.0.0".into(),
            ..v4.clone()
        };

        for (versions, marker) in [(&v4, "vl4"), (&v5, "vl5")] {
            let scripts = StaticScripts::new()
                .with("vega", &versions.vega, "vega")
                .with("vega-lite", &versions.vega_lite, marker)
                .with("vega-embed", &versions.vega_embed, "embed");
            let (handle, _) = scripted(json!({"result": "<svg/>"}), true, false);
            let config = ExportConfig::builder()
                .driver(handle.into())
                .versions(versions.clone())
                .scripts(Arc::new(scripts))
                .build()
                .unwrap();
            let b = BrowserBackend::new(spec(), config, Arc::clone(&pool), Arc::clone(&server));
            b.serialize(Format::Vector, Purpose::Save).await.unwrap();
        }

        let addr = server.addr().await.unwrap();
        for (version, marker) in [("4.0.2", "vl4"), ("5.0.0", "vl5")] {
            let url = format!("http://{addr}/vega-lite-{version}.js");
            let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
            assert_eq!(body, marker, "{url}");
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn compiled_json_is_returned_as_json() {
        let (handle, _) = scripted(json!({"result": {"$schema": "vega", "marks": []}}), true, true);
        let (b, _, server) = backend(online_config(handle).build().unwrap());
        let out = b.serialize(Format::CompiledJson, Purpose::Save).await.unwrap();
        assert_eq!(out, Content::Json(json!({"$schema": "vega", "marks": []})));
        server.stop().await;
    }

    #[test]
    fn scale_factor_applies_only_when_options_lack_one() {
        let config = ExportConfig::builder().scale_factor(2.0).build().unwrap();
        let (b, _, _) = backend(config);
        let opt = b.merged_options();
        assert_eq!(opt["scaleFactor"], json!(2.0));
        assert_eq!(opt["mode"], json!("vega-lite"));

        let config = ExportConfig::builder()
            .scale_factor(2.0)
            .embed_option("scaleFactor", json!(3))
            .build()
            .unwrap();
        let (b, _, _) = backend(config);
        assert_eq!(b.merged_options()["scaleFactor"], json!(3));

        let (b, _, _) = backend(ExportConfig::default());
        assert!(!b.merged_options().contains_key("scaleFactor"));
    }

    #[tokio::test]
    async fn no_driver_means_unavailable() {
        let server = Arc::new(ResourceServer::new());
        let b = BrowserBackend::new(
            spec(),
            ExportConfig::default(),
            Arc::new(DriverPool::new(Arc::new(CountingFactory::unavailable()))),
            server,
        );
        assert!(!b.available().await);
        let err = b.serialize(Format::Raster, Purpose::Save).await.unwrap_err();
        assert!(err.is_unavailable(), "{err}");
    }

    #[test]
    fn decode_rejects_malformed_png() {
        assert!(decode(Format::Raster, json!("no comma here")).is_err());
        assert!(decode(Format::Raster, json!(42)).is_err());
        assert!(decode(Format::Raster, json!("data:image/jpeg;base64,AAAA")).is_err());
    }

    #[test]
    fn route_is_path_after_host() {
        assert_eq!(route_of("http://127.0.0.1:4000/abc"), "abc");
        assert_eq!(route_of("http://127.0.0.1:4000"), "");
    }
}
