//! Pass-through backend: the spec is its own JSON output.

use super::{Backend, BackendKind};
use crate::config::ExportConfig;
use crate::content::{Content, Format, Purpose, Spec};
use crate::error::SaveError;
use async_trait::async_trait;
use serde_json::Value;

/// Emits the spec unchanged, as raw JSON or tagged with its dialect
/// (compiled-json for low-level specs, source-json for high-level ones).
#[derive(Debug, Clone)]
pub struct BasicBackend {
    spec: Spec,
    config: ExportConfig,
}

impl BasicBackend {
    pub fn new(spec: Spec, config: ExportConfig) -> Self {
        Self { spec, config }
    }
}

#[async_trait]
impl Backend for BasicBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Basic
    }

    fn spec(&self) -> &Spec {
        &self.spec
    }

    fn config(&self) -> &ExportConfig {
        &self.config
    }

    async fn render(&self, _format: Format, _purpose: Purpose) -> Result<Content, SaveError> {
        Ok(Content::Json(Value::Object(self.spec.clone())))
    }

    async fn available(&self) -> bool {
        true
    }
}
