//! Shared value types: what a chart is exported *to* and what comes back.
//!
//! A [`Format`] names the requested output, a [`Mode`] names the dialect the
//! input spec is written in, and [`Content`] carries the serialized result.
//! Persistence always dispatches on the `Content` variant: the same format
//! can arrive as text from one backend and as bytes from another.

use crate::error::SaveError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// A chart specification: an opaque JSON object, never mutated.
pub type Spec = Map<String, Value>;

/// Mimetype → serialized content, for multi-format retrieval.
pub type MimeBundle = HashMap<String, Content>;

// ── Mode ─────────────────────────────────────────────────────────────────

/// The dialect a spec is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Declarative Vega-Lite; compiled before most formats can be produced.
    #[default]
    #[serde(rename = "vega-lite")]
    HighLevel,
    /// Directly renderable Vega.
    #[serde(rename = "vega")]
    LowLevel,
}

impl Mode {
    /// The name the rendering runtime uses (`"vega-lite"` / `"vega"`).
    pub fn name(self) -> &'static str {
        match self {
            Mode::HighLevel => "vega-lite",
            Mode::LowLevel => "vega",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mode {
    type Err = SaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vega-lite" | "vegalite" | "vl" | "high-level" => Ok(Mode::HighLevel),
            "vega" | "vg" | "low-level" => Ok(Mode::LowLevel),
            _ => Err(SaveError::UnknownMode { name: s.to_string() }),
        }
    }
}

// ── Format ───────────────────────────────────────────────────────────────

/// An output kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Format {
    /// PNG image.
    #[serde(rename = "raster-image")]
    Raster,
    /// SVG image.
    #[serde(rename = "vector-image")]
    Vector,
    /// PDF document.
    #[serde(rename = "paginated-document")]
    Document,
    /// Low-level (Vega) JSON, compiled from a high-level spec when needed.
    CompiledJson,
    /// HTML page or fragment embedding the chart.
    #[serde(rename = "embeddable-markup")]
    Markup,
    /// The input spec as plain JSON.
    RawJson,
    /// The input spec tagged with the high-level dialect's mimetype.
    SourceJson,
}

impl Format {
    pub const ALL: [Format; 7] = [
        Format::Raster,
        Format::Vector,
        Format::Document,
        Format::CompiledJson,
        Format::Markup,
        Format::RawJson,
        Format::SourceJson,
    ];

    /// Canonical name, e.g. `raster-image`.
    pub fn name(self) -> &'static str {
        match self {
            Format::Raster => "raster-image",
            Format::Vector => "vector-image",
            Format::Document => "paginated-document",
            Format::CompiledJson => "compiled-json",
            Format::Markup => "embeddable-markup",
            Format::RawJson => "raw-json",
            Format::SourceJson => "source-json",
        }
    }

    /// Short name, also used on the in-page wire protocol (`png`, `svg`, `vega`).
    pub fn short_name(self) -> &'static str {
        match self {
            Format::Raster => "png",
            Format::Vector => "svg",
            Format::Document => "pdf",
            Format::CompiledJson => "vega",
            Format::Markup => "html",
            Format::RawJson => "json",
            Format::SourceJson => "vega-lite",
        }
    }

    /// Preferred file extension (without the leading dot).
    pub fn extension(self) -> &'static str {
        match self {
            Format::Raster => "png",
            Format::Vector => "svg",
            Format::Document => "pdf",
            Format::CompiledJson => "vg.json",
            Format::Markup => "html",
            Format::RawJson => "json",
            Format::SourceJson => "vl.json",
        }
    }

    /// Mimetype for this format. The JSON dialects are versioned by the
    /// major version of the runtime that defines them.
    pub fn mimetype(self, versions: &RuntimeVersions) -> String {
        match self {
            Format::Raster => "image/png".into(),
            Format::Vector => "image/svg+xml".into(),
            Format::Document => "application/pdf".into(),
            Format::CompiledJson => {
                format!("application/vnd.vega.v{}+json", major(&versions.vega))
            }
            Format::Markup => "text/html".into(),
            Format::RawJson => "application/json".into(),
            Format::SourceJson => {
                format!("application/vnd.vegalite.v{}+json", major(&versions.vega_lite))
            }
        }
    }

    /// Inverse of [`mimetype`](Self::mimetype). The vendor JSON types match
    /// on their prefix, so any runtime version maps back to its dialect.
    pub fn from_mimetype(mimetype: &str) -> Option<Format> {
        let mimetype = mimetype.trim().to_ascii_lowercase();
        if mimetype.starts_with("application/vnd.vegalite") {
            return Some(Format::SourceJson);
        }
        if mimetype.starts_with("application/vnd.vega") {
            return Some(Format::CompiledJson);
        }
        match mimetype.as_str() {
            "image/png" => Some(Format::Raster),
            "image/svg+xml" => Some(Format::Vector),
            "application/pdf" => Some(Format::Document),
            "text/html" => Some(Format::Markup),
            "application/json" => Some(Format::RawJson),
            _ => None,
        }
    }

    /// Infer a format from a file name.
    ///
    /// Compound extensions are checked first, so `chart.vg.json` is
    /// compiled JSON rather than raw JSON.
    pub fn from_path(path: &Path) -> Result<Format, SaveError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .ok_or(SaveError::CannotInferFormat)?;

        for (suffix, format) in [
            (".vg.json", Format::CompiledJson),
            (".compiled.json", Format::CompiledJson),
            (".vl.json", Format::SourceJson),
        ] {
            if name.ends_with(suffix) {
                return Ok(format);
            }
        }

        let ext = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
            _ => return Err(SaveError::CannotInferFormat),
        };
        match ext {
            "json" => Ok(Format::RawJson),
            "png" => Ok(Format::Raster),
            "svg" => Ok(Format::Vector),
            "pdf" => Ok(Format::Document),
            "html" | "htm" => Ok(Format::Markup),
            other => Err(SaveError::UnknownFormat {
                name: other.to_string(),
            }),
        }
    }

    /// Whether `content` is a variant this format may carry.
    pub fn accepts(self, content: &Content) -> bool {
        match self {
            Format::Raster | Format::Document => matches!(content, Content::Binary(_)),
            Format::Vector => matches!(content, Content::Text(_) | Content::Binary(_)),
            Format::Markup => matches!(content, Content::Text(_)),
            Format::CompiledJson | Format::RawJson | Format::SourceJson => {
                matches!(content, Content::Json(_))
            }
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = SaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Format::ALL
            .into_iter()
            .find(|f| f.name() == wanted || f.short_name() == wanted)
            .ok_or_else(|| SaveError::UnknownFormat {
                name: s.to_string(),
            })
    }
}

/// A list of formats, displayed comma-separated in error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatList(pub Vec<Format>);

impl fmt::Display for FormatList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(none)");
        }
        let names: Vec<&str> = self.0.iter().map(|fmt| fmt.name()).collect();
        f.write_str(&names.join(", "))
    }
}

// ── Content ──────────────────────────────────────────────────────────────

/// Serialized export result. Exactly one variant per (spec, format).
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

impl Content {
    /// `"json"`, `"text"` or `"binary"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Content::Json(_) => "json",
            Content::Text(_) => "text",
            Content::Binary(_) => "binary",
        }
    }

    /// Bytes as they are written to a sink; JSON is pretty-printed.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SaveError> {
        match self {
            Content::Json(v) => serde_json::to_vec_pretty(v)
                .map_err(|e| SaveError::Internal(format!("JSON serialisation failed: {e}"))),
            Content::Text(s) => Ok(s.as_bytes().to_vec()),
            Content::Binary(b) => Ok(b.clone()),
        }
    }

    /// Length of [`to_bytes`](Self::to_bytes) without building the buffer.
    pub fn len(&self) -> usize {
        match self {
            Content::Json(v) => {
                let mut counter = ByteCounter(0);
                match serde_json::to_writer_pretty(&mut counter, v) {
                    Ok(()) => counter.0,
                    Err(_) => 0,
                }
            }
            Content::Text(s) => s.len(),
            Content::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Content::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Content::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// Counts bytes written and discards them.
struct ByteCounter(usize);

impl std::io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ── Purpose ──────────────────────────────────────────────────────────────

/// Where serialized content is headed. Presentation defaults, such as
/// standalone vs. embedded markup, differ between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Bundle,
    Save,
}

// ── Runtime versions ─────────────────────────────────────────────────────

/// Versions of the three JavaScript packages that render a chart.
///
/// They select CDN URLs and offline script files, and version the
/// `application/vnd.vega*` mimetypes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeVersions {
    pub vega: String,
    pub vega_lite: String,
    pub vega_embed: String,
}

impl Default for RuntimeVersions {
    fn default() -> Self {
        Self {
            vega: "5.9.0".into(),
            vega_lite: "4.0.2".into(),
            vega_embed: "6.2.1".into(),
        }
    }
}

impl RuntimeVersions {
    /// `(package, version)` pairs in load order.
    pub fn packages(&self) -> [(&'static str, &str); 3] {
        [
            ("vega", &self.vega),
            ("vega-lite", &self.vega_lite),
            ("vega-embed", &self.vega_embed),
        ]
    }
}

/// Major component of a version string: `"5.9.0"` → `"5"`, `"v4"` → `"4"`.
pub fn major(version: &str) -> &str {
    let v = version.trim().trim_start_matches('v');
    v.split('.').next().unwrap_or(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn compound_extensions_win() {
        let cases = [
            ("chart.compiled.json", Format::CompiledJson),
            ("chart.vg.json", Format::CompiledJson),
            ("chart.vl.json", Format::SourceJson),
            ("chart.json", Format::RawJson),
            ("out/CHART.PNG", Format::Raster),
            ("chart.svg", Format::Vector),
            ("chart.pdf", Format::Document),
            ("chart.htm", Format::Markup),
        ];
        for (name, expected) in cases {
            assert_eq!(
                Format::from_path(&PathBuf::from(name)).unwrap(),
                expected,
                "{name}"
            );
        }
    }

    #[test]
    fn names_without_extension_cannot_be_inferred() {
        for name in ["chart", ".json", ""] {
            let err = Format::from_path(&PathBuf::from(name)).unwrap_err();
            assert!(matches!(err, SaveError::CannotInferFormat), "{name}: {err}");
        }
    }

    #[test]
    fn unknown_extension_is_named() {
        let err = Format::from_path(&PathBuf::from("chart.bmp")).unwrap_err();
        assert!(err.to_string().contains("bmp"));
    }

    #[test]
    fn format_parses_both_name_styles() {
        assert_eq!("png".parse::<Format>().unwrap(), Format::Raster);
        assert_eq!("raster-image".parse::<Format>().unwrap(), Format::Raster);
        assert_eq!("Vega".parse::<Format>().unwrap(), Format::CompiledJson);
        assert_eq!("vega-lite".parse::<Format>().unwrap(), Format::SourceJson);
        assert!("gif".parse::<Format>().is_err());
    }

    #[test]
    fn mode_parses_aliases() {
        assert_eq!("vega-lite".parse::<Mode>().unwrap(), Mode::HighLevel);
        assert_eq!("low-level".parse::<Mode>().unwrap(), Mode::LowLevel);
        assert!("d3".parse::<Mode>().is_err());
    }

    #[test]
    fn mimetypes_track_major_versions() {
        let versions = RuntimeVersions::default();
        assert_eq!(
            Format::CompiledJson.mimetype(&versions),
            "application/vnd.vega.v5+json"
        );
        assert_eq!(
            Format::SourceJson.mimetype(&versions),
            "application/vnd.vegalite.v4+json"
        );
        let newer = RuntimeVersions {
            vega_lite: "v5.2.0".into(),
            ..RuntimeVersions::default()
        };
        assert_eq!(
            Format::SourceJson.mimetype(&newer),
            "application/vnd.vegalite.v5+json"
        );
    }

    #[test]
    fn mimetype_mapping_is_invertible() {
        let versions = RuntimeVersions::default();
        for f in Format::ALL {
            assert_eq!(Format::from_mimetype(&f.mimetype(&versions)), Some(f));
        }
        assert_eq!(Format::from_mimetype("image/gif"), None);
    }

    #[test]
    fn vendor_mimetypes_match_any_version() {
        assert_eq!(
            Format::from_mimetype("application/vnd.vegalite.v4.1+json"),
            Some(Format::SourceJson)
        );
        assert_eq!(
            Format::from_mimetype("application/vnd.vegalite.v5+json"),
            Some(Format::SourceJson)
        );
        assert_eq!(
            Format::from_mimetype("application/vnd.vega.v3+json"),
            Some(Format::CompiledJson)
        );
        assert_eq!(Format::from_mimetype("application/xml"), None);
    }

    #[test]
    fn len_matches_written_bytes() {
        let cases = [
            Content::Json(serde_json::json!({"mark": "point", "data": {"values": [1, 2]}})),
            Content::Text("<svg>é</svg>".into()),
            Content::Binary(vec![0x89, b'P', b'N', b'G']),
            Content::Binary(Vec::new()),
        ];
        for c in &cases {
            assert_eq!(c.len(), c.to_bytes().unwrap().len(), "{}", c.kind());
        }
        assert!(cases[3].is_empty());
    }

    #[test]
    fn json_content_is_pretty_printed() {
        let c = Content::Json(serde_json::json!({"mark": "point"}));
        let text = String::from_utf8(c.to_bytes().unwrap()).unwrap();
        assert_eq!(text, "{\n  \"mark\": \"point\"\n}");
    }

    #[test]
    fn raster_rejects_text() {
        assert!(!Format::Raster.accepts(&Content::Text("png?".into())));
        assert!(Format::Raster.accepts(&Content::Binary(vec![0x89])));
        assert!(Format::Vector.accepts(&Content::Binary(vec![])));
        assert!(!Format::RawJson.accepts(&Content::Text("{}".into())));
    }

    #[test]
    fn serde_uses_canonical_names() {
        for f in Format::ALL {
            assert_eq!(serde_json::to_value(f).unwrap(), Value::String(f.name().into()));
        }
        assert_eq!(serde_json::to_value(Mode::LowLevel).unwrap(), "vega");
        let versions: RuntimeVersions = serde_json::from_str(r#"{"vega": "5.20.0"}"#).unwrap();
        assert_eq!(versions.vega, "5.20.0");
        assert_eq!(versions.vega_lite, RuntimeVersions::default().vega_lite);
    }

    #[test]
    fn format_list_display() {
        let list = FormatList(vec![Format::Raster, Format::Vector]);
        assert_eq!(list.to_string(), "raster-image, vector-image");
        assert_eq!(FormatList(vec![]).to_string(), "(none)");
    }
}
