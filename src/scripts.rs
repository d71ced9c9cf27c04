//! Sources for the JavaScript runtime (vega, vega-lite, vega-embed).
//!
//! Offline browser exports and inlined HTML need the script text itself
//! rather than a CDN URL. Scripts are stored one file per package as
//! `{package}-{version}.js`.

use crate::content::RuntimeVersions;
use crate::error::SaveError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory override for [`DirectoryScripts::from_env`].
pub const SCRIPT_DIR_ENV: &str = "CHART_SAVER_SCRIPT_DIR";

/// CDN location of a runtime package.
pub fn cdn_url(package: &str, version: &str) -> String {
    format!("https://cdn.jsdelivr.net/npm/{package}@{version}")
}

/// File name a script is stored under.
pub fn script_file_name(package: &str, version: &str) -> String {
    format!("{package}-{version}.js")
}

/// Supplies runtime script text.
pub trait ScriptSource: Send + Sync {
    fn script(&self, package: &str, version: &str) -> Result<String, SaveError>;
}

/// The three runtime scripts for `versions`, in load order.
///
/// Sources may read multi-megabyte files, so the reads run on the blocking
/// pool.
pub async fn load_scripts(
    source: Arc<dyn ScriptSource>,
    versions: &RuntimeVersions,
) -> Result<[String; 3], SaveError> {
    let versions = versions.clone();
    tokio::task::spawn_blocking(move || -> Result<[String; 3], SaveError> {
        let [vega, vega_lite, vega_embed] = versions.packages();
        Ok([
            source.script(vega.0, vega.1)?,
            source.script(vega_lite.0, vega_lite.1)?,
            source.script(vega_embed.0, vega_embed.1)?,
        ])
    })
    .await
    .map_err(|e| SaveError::Internal(format!("script load task failed: {e}")))?
}

/// Reads scripts from a directory.
#[derive(Debug, Clone)]
pub struct DirectoryScripts {
    dir: PathBuf,
}

impl DirectoryScripts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `CHART_SAVER_SCRIPT_DIR`, else `<data dir>/chart-saver/scripts`.
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os(SCRIPT_DIR_ENV).filter(|v| !v.is_empty()) {
            return Self::new(dir);
        }
        let base = dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .unwrap_or_else(std::env::temp_dir);
        Self::new(base.join("chart-saver").join("scripts"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ScriptSource for DirectoryScripts {
    fn script(&self, package: &str, version: &str) -> Result<String, SaveError> {
        let path = self.dir.join(script_file_name(package, version));
        std::fs::read_to_string(&path).map_err(|_| SaveError::ScriptNotFound {
            package: package.to_string(),
            version: version.to_string(),
            path,
        })
    }
}

/// In-memory scripts keyed by `{package}-{version}.js`.
#[derive(Debug, Clone, Default)]
pub struct StaticScripts {
    scripts: HashMap<String, String>,
}

impl StaticScripts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, package: &str, version: &str, text: impl Into<String>) -> Self {
        self.scripts
            .insert(script_file_name(package, version), text.into());
        self
    }
}

impl ScriptSource for StaticScripts {
    fn script(&self, package: &str, version: &str) -> Result<String, SaveError> {
        let name = script_file_name(package, version);
        self.scripts
            .get(&name)
            .cloned()
            .ok_or_else(|| SaveError::ScriptNotFound {
                package: package.to_string(),
                version: version.to_string(),
                path: PathBuf::from(name),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cdn_url_format() {
        assert_eq!(
            cdn_url("vega-embed", "6.2.1"),
            "https://cdn.jsdelivr.net/npm/vega-embed@6.2.1"
        );
    }

    #[test]
    fn directory_scripts_read_versioned_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("vega-5.9.0.js"), "var vega = {};").unwrap();
        let scripts = DirectoryScripts::new(dir.path());

        assert_eq!(scripts.script("vega", "5.9.0").unwrap(), "var vega = {};");
        match scripts.script("vega", "5.10.0").unwrap_err() {
            SaveError::ScriptNotFound { path, .. } => {
                assert!(path.ends_with("vega-5.10.0.js"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_scripts_reads_all_three_in_order() {
        let versions = RuntimeVersions::default();
        let dir = TempDir::new().unwrap();
        for (package, version) in versions.packages() {
            std::fs::write(dir.path().join(script_file_name(package, version)), package).unwrap();
        }
        let source: Arc<dyn ScriptSource> = Arc::new(DirectoryScripts::new(dir.path()));
        let texts = load_scripts(source, &versions).await.unwrap();
        assert_eq!(texts, ["vega", "vega-lite", "vega-embed"].map(String::from));

        std::fs::remove_file(dir.path().join(script_file_name("vega-embed", &versions.vega_embed))).unwrap();
        let source: Arc<dyn ScriptSource> = Arc::new(DirectoryScripts::new(dir.path()));
        let err = load_scripts(source, &versions).await.unwrap_err();
        assert!(matches!(err, SaveError::ScriptNotFound { ref package, .. } if package == "vega-embed"), "{err}");
    }

    #[test]
    fn static_scripts_lookup() {
        let scripts = StaticScripts::new().with("vega-lite", "4.0.2", "var vl;");
        assert_eq!(scripts.script("vega-lite", "4.0.2").unwrap(), "var vl;");
        assert!(scripts.script("vega-lite", "4.0.0").is_err());
    }
}
