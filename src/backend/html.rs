//! HTML backend: wraps the spec in a page (or fragment) rendered by vega-embed.
//!
//! Three shapes are produced:
//!
//! | standalone | inline | output |
//! |------------|--------|--------|
//! | yes | no  | full document loading the runtime from the CDN |
//! | yes | yes | full document with the runtime scripts inlined |
//! | no  | -   | fragment that loads the runtime on demand (notebook friendly) |
//!
//! Standalone defaults to `true` when saving and `false` when bundling.

use super::{Backend, BackendKind};
use crate::config::ExportConfig;
use crate::content::{Content, Format, Purpose, RuntimeVersions, Spec};
use crate::error::SaveError;
use crate::scripts::{cdn_url, load_scripts};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

/// Renders embeddable markup. Never touches the network.
#[derive(Debug, Clone)]
pub struct HtmlBackend {
    spec: Spec,
    config: ExportConfig,
}

impl HtmlBackend {
    pub fn new(spec: Spec, config: ExportConfig) -> Self {
        Self { spec, config }
    }

    fn embed_options(&self) -> Map<String, Value> {
        let mut opt = self.config.embed_options.clone();
        opt.insert("mode".into(), Value::String(self.config.mode.name().into()));
        opt
    }

    async fn page(&self, purpose: Purpose) -> Result<String, SaveError> {
        let standalone = self.config.standalone.unwrap_or(purpose == Purpose::Save);
        let chart = Chart {
            spec: script_json(&self.spec)?,
            embed_options: script_json(&self.embed_options())?,
            output_div: format!("vega-visualization-{}", uuid::Uuid::new_v4().simple()),
        };
        let versions = &self.config.versions;

        if !standalone {
            if self.config.inline {
                warn!("inline ignored for non-standalone HTML");
            }
            return Ok(fragment(&chart, versions));
        }
        if self.config.inline {
            let texts = load_scripts(self.config.script_source(), versions).await?;
            let mut scripts = String::new();
            for ((package, version), text) in versions.packages().into_iter().zip(&texts) {
                scripts.push_str(&format!(
                    "    // {package}.js v{version}\n{}\n",
                    escape_script(text)
                ));
            }
            return Ok(inline_document(&chart, &scripts));
        }
        Ok(cdn_document(&chart, versions))
    }
}

#[async_trait]
impl Backend for HtmlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Html
    }

    fn spec(&self) -> &Spec {
        &self.spec
    }

    fn config(&self) -> &ExportConfig {
        &self.config
    }

    async fn render(&self, _format: Format, purpose: Purpose) -> Result<Content, SaveError> {
        Ok(Content::Text(self.page(purpose).await?))
    }

    async fn available(&self) -> bool {
        true
    }
}

// ── Templates ────────────────────────────────────────────────────────────

struct Chart {
    spec: String,
    embed_options: String,
    output_div: String,
}

/// JSON safe to place inside a `<script>` element.
fn script_json<T: Serialize>(value: &T) -> Result<String, SaveError> {
    serde_json::to_string(value)
        .map(|s| escape_script(&s))
        .map_err(|e| SaveError::Internal(format!("JSON serialisation failed: {e}")))
}

/// Break up `</` so embedded text cannot close the surrounding script tag.
fn escape_script(text: &str) -> String {
    text.replace("</", "<\\/")
}

fn cdn_document(chart: &Chart, versions: &RuntimeVersions) -> String {
    let [vega, vega_lite, vega_embed] = versions.packages().map(|(p, v)| cdn_url(p, v));
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <script src="{vega}"></script>
  <script src="{vega_lite}"></script>
  <script src="{vega_embed}"></script>
</head>
<body>
<div class="vega-visualization" id="{div}"></div>
<script type="text/javascript">
  const spec = {spec};
  const embedOpt = {opt};
  vegaEmbed('#{div}', spec, embedOpt).catch(console.error);
</script>
</body>
</html>
"#,
        div = chart.output_div,
        spec = chart.spec,
        opt = chart.embed_options,
    )
}

fn inline_document(chart: &Chart, scripts: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <script type="text/javascript">
{scripts}  </script>
</head>
<body>
<div class="vega-visualization" id="{div}"></div>
<script type="text/javascript">
  const spec = {spec};
  const embedOpt = {opt};
  vegaEmbed('#{div}', spec, embedOpt).catch(console.error);
</script>
</body>
</html>
"#,
        div = chart.output_div,
        spec = chart.spec,
        opt = chart.embed_options,
    )
}

fn fragment(chart: &Chart, versions: &RuntimeVersions) -> String {
    let [vega, vega_lite, vega_embed] = versions.packages().map(|(p, v)| cdn_url(p, v));
    format!(
        r#"<div class="vega-visualization" id="{div}"></div>
<script type="text/javascript">
  (function(spec, embedOpt) {{
    let outputDiv = document.currentScript.previousElementSibling;
    if (outputDiv.id !== "{div}") {{
      outputDiv = document.getElementById("{div}");
    }}
    const paths = {{
      "vega": "{vega}?noext",
      "vega-lite": "{vega_lite}?noext",
      "vega-embed": "{vega_embed}?noext",
    }};
    function loadScript(lib) {{
      return new Promise(function(resolve, reject) {{
        var s = document.createElement('script');
        s.src = paths[lib];
        s.async = true;
        s.onload = () => resolve(paths[lib]);
        s.onerror = () => reject(`Error loading script: ${{paths[lib]}}`);
        document.getElementsByTagName("head")[0].appendChild(s);
      }});
    }}
    function showError(err) {{
      outputDiv.innerHTML = `<div class="error" style="color:red;">${{err}}</div>`;
      throw err;
    }}
    function displayChart(vegaEmbed) {{
      vegaEmbed(outputDiv, spec, embedOpt)
        .catch(err => showError(`Javascript Error: ${{err.message}}<br>Check the chart specification; the browser console has the full trace.`));
    }}
    if (typeof define === "function" && define.amd) {{
      requirejs.config({{paths}});
      require(["vega-embed"], displayChart, err => showError(`Error loading script: ${{err.message}}`));
    }} else if (typeof vegaEmbed === "function") {{
      displayChart(vegaEmbed);
    }} else {{
      loadScript("vega")
        .then(() => loadScript("vega-lite"))
        .then(() => loadScript("vega-embed"))
        .catch(showError)
        .then(() => displayChart(vegaEmbed));
    }}
  }})({spec}, {opt});
</script>
"#,
        div = chart.output_div,
        spec = chart.spec,
        opt = chart.embed_options,
    )
}
