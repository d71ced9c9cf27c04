//! Converter pipeline for the subprocess backend.
//!
//! Each stage is one external command reading JSON on stdin and writing its
//! result to stdout. A high-level spec is compiled first; everything after
//! that works on the compiled spec.
//!
//! ## Data Flow
//!
//! ```text
//! vega-lite ──▶ vl2vg ──▶ vega ──┬──▶ vg2png ──▶ PNG bytes
//!                                ├──▶ vg2svg ──▶ SVG text
//!                                └──▶ vg2pdf ──▶ PDF bytes
//! ```
//!
//! [`plan`] picks the stages for a (mode, format) pair;
//! [`subprocess::run_converter`] runs one of them.

pub mod subprocess;

use crate::content::{Format, Mode};

/// One converter invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// vega-lite → vega.
    Compile,
    Png,
    Svg,
    Pdf,
}

impl Stage {
    /// Executable name.
    pub fn program(self) -> &'static str {
        match self {
            Stage::Compile => "vl2vg",
            Stage::Png => "vg2png",
            Stage::Svg => "vg2svg",
            Stage::Pdf => "vg2pdf",
        }
    }

    /// Render stages receive the user's extra converter arguments.
    pub fn is_render(self) -> bool {
        !matches!(self, Stage::Compile)
    }

    fn render_for(format: Format) -> Option<Stage> {
        match format {
            Format::Raster => Some(Stage::Png),
            Format::Vector => Some(Stage::Svg),
            Format::Document => Some(Stage::Pdf),
            _ => None,
        }
    }
}

/// Stages producing `format` from a `mode` spec, or `None` when the
/// converters cannot produce it.
pub fn plan(mode: Mode, format: Format) -> Option<Vec<Stage>> {
    let render = Stage::render_for(format);
    match (mode, format, render) {
        (Mode::HighLevel, Format::CompiledJson, _) => Some(vec![Stage::Compile]),
        (Mode::HighLevel, _, Some(stage)) => Some(vec![Stage::Compile, stage]),
        (Mode::LowLevel, _, Some(stage)) => Some(vec![stage]),
        _ => None,
    }
}
