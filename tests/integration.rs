//! Integration tests through the public API.
//!
//! No browser or Node toolchain is needed: converters are fake shell
//! scripts, and browser drivers are looked up in an empty directory.

use chart_saver::{
    bundle_stream, BackendKind, Content, ExecLocator, ExportConfig, ExportProgressCallback,
    ExportServices, Exporter, Format, Locate, Mode, ResourceServer, SaveError, Sink, Spec,
};
use exec_locator::LocateError;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn spec(v: Value) -> Spec {
    match v {
        Value::Object(m) => m,
        other => panic!("not an object: {other}"),
    }
}

fn bar_chart() -> Spec {
    spec(json!({
        "data": {"values": [{"a": "A", "b": 28}, {"a": "B", "b": 55}]},
        "mark": "bar",
        "encoding": {
            "x": {"field": "a", "type": "ordinal"},
            "y": {"field": "b", "type": "quantitative"}
        }
    }))
}

fn exporter_in(dir: &TempDir, config: ExportConfig) -> Exporter {
    let services = ExportServices::with_locator(Arc::new(ExecLocator::with_dirs([dir.path()])));
    Exporter::with_services(config, Arc::new(services))
}

#[cfg(unix)]
fn fake_converter(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// A locator backed by a fixed table.
struct TableLocator(HashMap<String, PathBuf>);

impl Locate for TableLocator {
    fn locate(&self, name: &str) -> Result<PathBuf, LocateError> {
        self.0.get(name).cloned().ok_or_else(|| LocateError::NotFound {
            name: name.to_string(),
            searched: self.0.len(),
        })
    }
}

// ── In-process formats ───────────────────────────────────────────────────────

#[tokio::test]
async fn compiled_json_name_is_inferred_for_vega_specs() {
    let dir = TempDir::new().unwrap();
    let config = ExportConfig::builder().mode(Mode::LowLevel).build().unwrap();
    let ex = exporter_in(&dir, config);
    let vega = spec(json!({"$schema": "https://vega.github.io/schema/vega/v5.json", "marks": []}));
    let path = dir.path().join("chart.compiled.json");

    assert_ok!(ex.export(&vega, Some(Sink::path(&path)), None).await);
    let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written, Value::Object(vega));
}

#[tokio::test]
async fn vega_lite_specs_cannot_be_compiled_without_a_renderer() {
    let dir = TempDir::new().unwrap();
    let ex = exporter_in(&dir, ExportConfig::default());
    let err = assert_err!(ex.export(&bar_chart(), None, Some(Format::CompiledJson)).await);
    assert!(matches!(err, SaveError::NoBackendAvailable { .. }), "{err}");
}

#[tokio::test]
async fn html_goes_to_a_named_writer() {
    #[derive(Clone, Default)]
    struct Buf(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for Buf {
        fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(b);
            Ok(b.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let dir = TempDir::new().unwrap();
    let ex = exporter_in(&dir, ExportConfig::default());
    let buf = Buf::default();
    ex.export(&bar_chart(), Some(Sink::named_writer("chart.html", buf.clone())), None)
        .await
        .unwrap();
    let html = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    assert!(html.starts_with("<!DOCTYPE html>"));
    assert!(html.contains("vega-lite@4.0.2"));
}

#[tokio::test]
async fn unknown_extension_is_reported() {
    let dir = TempDir::new().unwrap();
    let ex = exporter_in(&dir, ExportConfig::default());
    let err = assert_err!(ex.save(&bar_chart(), dir.path().join("chart.gif")).await);
    assert!(matches!(err, SaveError::UnknownFormat { ref name } if name == "gif"));
    assert!(!dir.path().join("chart.gif").exists());
}

#[tokio::test]
async fn bundle_keys_are_mimetypes() {
    let dir = TempDir::new().unwrap();
    let ex = exporter_in(&dir, ExportConfig::default());
    let bundle = ex
        .bundle(&bar_chart(), &[Format::SourceJson, Format::Markup, Format::RawJson])
        .await
        .unwrap();
    let mut keys: Vec<_> = bundle.keys().cloned().collect();
    keys.sort();
    assert_eq!(
        keys,
        vec!["application/json", "application/vnd.vegalite.v4+json", "text/html"]
    );
}

// ── Subprocess backend with fake converters ──────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn pdf_export_through_fake_converters() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("stages.log");
    fake_converter(
        &dir,
        "vl2vg",
        &format!("echo vl2vg >> {}; cat >/dev/null; echo '{{\"marks\": []}}'", log.display()),
    );
    fake_converter(
        &dir,
        "vg2pdf",
        &format!("echo vg2pdf >> {}; cat >/dev/null; printf '%%PDF-1.4 fake'", log.display()),
    );

    let ex = exporter_in(&dir, ExportConfig::default());
    let out = dir.path().join("out").join("chart.pdf");
    ex.save(&bar_chart(), &out).await.unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), b"%PDF-1.4 fake");
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "vl2vg\nvg2pdf\n");
}

#[cfg(unix)]
#[tokio::test]
async fn converter_failure_carries_stderr() {
    let dir = TempDir::new().unwrap();
    let vl2vg = fake_converter(
        &dir,
        "vl2vg",
        "cat >/dev/null; echo 'Error: Invalid specification {\"mark\": 12}' >&2; exit 1",
    );
    let locator = TableLocator(HashMap::from([("vl2vg".to_string(), vl2vg)]));
    let services = ExportServices::with_locator(Arc::new(locator));
    let config = ExportConfig::builder()
        .backend(BackendKind::Subprocess)
        .build()
        .unwrap();
    let ex = Exporter::with_services(config, Arc::new(services));

    let err = assert_err!(ex.export(&bar_chart(), None, Some(Format::CompiledJson)).await);
    match err {
        SaveError::ConversionFailed {
            program,
            exit_code,
            stderr,
        } => {
            assert_eq!(program, "vl2vg");
            assert_eq!(exit_code, Some(1));
            assert!(stderr.contains("Invalid specification"));
        }
        other => panic!("unexpected: {other}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn svg_export_with_callback_and_suppressed_stderr() {
    #[derive(Default)]
    struct Record(Mutex<Vec<String>>);
    impl ExportProgressCallback for Record {
        fn on_stage_start(&self, stage: &str) {
            self.0.lock().unwrap().push(format!("stage {stage}"));
        }
        fn on_converter_stderr(&self, program: &str, line: &str) {
            self.0.lock().unwrap().push(format!("{program}: {line}"));
        }
    }

    let dir = TempDir::new().unwrap();
    fake_converter(
        &dir,
        "vg2svg",
        "cat >/dev/null; echo 'DEPRECATED: flag' >&2; echo 'font missing' >&2; printf '<svg></svg>'",
    );
    let record = Arc::new(Record::default());
    let config = ExportConfig::builder()
        .mode(Mode::LowLevel)
        .suppress_stderr_matching("^DEPRECATED")
        .progress_callback(record.clone())
        .build()
        .unwrap();
    let ex = exporter_in(&dir, config);

    let out = ex
        .export(&spec(json!({"marks": []})), None, Some(Format::Vector))
        .await
        .unwrap();
    assert_eq!(out, Some(Content::Text("<svg></svg>".into())));
    assert_eq!(
        *record.0.lock().unwrap(),
        vec!["stage vg2svg", "vg2svg: font missing"]
    );
}

#[cfg(unix)]
#[tokio::test]
async fn available_formats_grow_with_installed_converters() {
    let dir = TempDir::new().unwrap();
    let ex = exporter_in(&dir, ExportConfig::default());
    assert!(!ex.available_formats(Mode::HighLevel).await.contains(&Format::Raster));

    fake_converter(&dir, "vl2vg", "cat");
    fake_converter(&dir, "vg2png", "cat");
    let ex = exporter_in(&dir, ExportConfig::default());
    let formats = ex.available_formats(Mode::HighLevel).await;
    assert!(formats.contains(&Format::Raster));
    assert!(formats.contains(&Format::Document), "one complete chain is enough");
}

#[cfg(unix)]
#[tokio::test]
async fn streamed_bundle_mixes_backends() {
    let dir = TempDir::new().unwrap();
    fake_converter(&dir, "vg2png", "cat >/dev/null; printf PNG");
    let config = ExportConfig::builder().mode(Mode::LowLevel).build().unwrap();
    let ex = exporter_in(&dir, config);
    let vega = spec(json!({"marks": []}));

    let entries: HashMap<String, Content> = bundle_stream(&ex, &vega, &[Format::Raster, Format::CompiledJson])
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(entries["image/png"], Content::Binary(b"PNG".to_vec()));
    assert_eq!(entries["application/vnd.vega.v5+json"], Content::Json(Value::Object(vega)));
}

// ── Resource server ──────────────────────────────────────────────────────────

#[tokio::test]
async fn resource_server_serves_and_forgets() {
    let server = ResourceServer::new();
    let url = server
        .publish("console.log(1)", Some("vega.js"), ResourceServer::cors_headers())
        .await
        .unwrap();
    assert!(url.ends_with("/vega.js"));

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    assert_eq!(resp.text().await.unwrap(), "console.log(1)");

    server.stop().await;
    assert!(server.addr().await.is_none());

    // Publishing again restarts transparently.
    let url = server
        .publish("again", None, Default::default())
        .await
        .unwrap();
    assert_eq!(reqwest::get(&url).await.unwrap().text().await.unwrap(), "again");
    server.stop().await;
}
