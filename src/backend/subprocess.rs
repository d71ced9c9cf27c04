//! Subprocess backend: the vega-cli / vega-lite converters.

use super::{Backend, BackendKind};
use crate::config::ExportConfig;
use crate::content::{Content, Format, Purpose, Spec};
use crate::error::SaveError;
use crate::locate::{locate_all, with_locator};
use crate::pipeline::subprocess::run_converter;
use crate::pipeline::{plan, Stage};
use async_trait::async_trait;
use exec_locator::Locate;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Exports by piping the spec through `vl2vg` and `vg2*`.
pub struct SubprocessBackend {
    spec: Spec,
    config: ExportConfig,
    locator: Arc<dyn Locate>,
}

impl SubprocessBackend {
    pub fn new(spec: Spec, config: ExportConfig, locator: Arc<dyn Locate>) -> Self {
        Self {
            spec,
            config,
            locator,
        }
    }

    fn stages(&self, format: Format) -> Result<Vec<Stage>, SaveError> {
        plan(self.mode(), format).ok_or_else(|| {
            SaveError::InvariantViolation(format!("no converter chain produces {format}"))
        })
    }
}

#[async_trait]
impl Backend for SubprocessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    fn spec(&self) -> &Spec {
        &self.spec
    }

    fn config(&self) -> &ExportConfig {
        &self.config
    }

    async fn render(&self, format: Format, _purpose: Purpose) -> Result<Content, SaveError> {
        let stages = self.stages(format)?;
        // Locate the whole chain before running any of it.
        let names: Vec<&'static str> = stages.iter().map(|s| s.program()).collect();
        let programs = locate_all(&self.locator, &names).await?;

        let mut data = serde_json::to_vec(&self.spec)
            .map_err(|e| SaveError::Internal(format!("JSON serialisation failed: {e}")))?;
        for (stage, program) in stages.iter().zip(&programs) {
            if let Some(ref cb) = self.config.progress_callback {
                cb.on_stage_start(stage.program());
            }
            let args: &[String] = if stage.is_render() {
                &self.config.converter_args
            } else {
                &[]
            };
            debug!("Running {} ({})", stage.program(), program.display());
            data = run_converter(program, stage.program(), args, data, &self.config).await?;
        }

        match format {
            Format::CompiledJson => serde_json::from_slice::<Value>(&data)
                .map(Content::Json)
                .map_err(|e| SaveError::ConversionFailed {
                    program: Stage::Compile.program().into(),
                    exit_code: Some(0),
                    stderr: format!("output is not valid JSON: {e}"),
                }),
            Format::Vector => String::from_utf8(data)
                .map(Content::Text)
                .map_err(|e| SaveError::ConversionFailed {
                    program: Stage::Svg.program().into(),
                    exit_code: Some(0),
                    stderr: format!("output is not UTF-8: {e}"),
                }),
            _ => Ok(Content::Binary(data)),
        }
    }

    async fn available(&self) -> bool {
        let mode = self.mode();
        let chains: Vec<Vec<Stage>> = self
            .capabilities()
            .iter()
            .filter_map(|&format| plan(mode, format))
            .collect();
        with_locator(&self.locator, move |locator| {
            chains
                .iter()
                .any(|stages| stages.iter().all(|s| locator.locate(s.program()).is_ok()))
        })
        .await
        .unwrap_or(false)
    }
}
