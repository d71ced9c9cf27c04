//! # exec-locator
//!
//! Find the external converter executables (`vl2vg`, `vg2png`, `vg2svg`,
//! `vg2pdf`, `chromedriver`, `geckodriver`) that chart-saver shells out to,
//! without asking users to put every npm install on their `PATH`.
//!
//! ## How it works
//!
//! [`ExecLocator::locate`] walks a prioritised list of directories and
//! returns the first executable match:
//!
//! 1. `CHART_SAVER_BIN_DIR`, when set.
//! 2. Every entry of the process `PATH`.
//! 3. The npm per-project bin directory (`$(npm prefix)/node_modules/.bin`).
//! 4. The npm global bin directory (`$(npm prefix --global)/bin`).
//!
//! The two `npm prefix` calls run at most once per locator. Successful
//! resolutions are memoized per tool name for the locator's lifetime; a
//! changed install needs a new locator (or a new process).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use exec_locator::{ExecLocator, Locate};
//!
//! let locator = ExecLocator::new();
//! match locator.locate("vg2png") {
//!     Ok(path) => println!("vg2png at {}", path.display()),
//!     Err(e) => eprintln!("{e}"),
//! }
//! ```
//!
//! ## Environment variable overrides
//!
//! - `CHART_SAVER_BIN_DIR`: directory searched before anything else.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, OnceLock};

use thiserror::Error;
use tracing::debug;

// ── Public constants ─────────────────────────────────────────────────────────

/// Directory searched ahead of `PATH` and the npm bin directories.
pub const BIN_DIR_ENV: &str = "CHART_SAVER_BIN_DIR";

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors returned by executable lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocateError {
    /// No search root contains an executable with this name.
    #[error("Executable '{name}' not found in {searched} search directories")]
    NotFound { name: String, searched: usize },

    /// The name is empty.
    #[error("Invalid executable name '{0}'")]
    InvalidName(String),
}

// ── Lookup seam ──────────────────────────────────────────────────────────────

/// Resolves a tool name to an executable path.
///
/// Backends hold an `Arc<dyn Locate>` so tests can substitute a locator that
/// knows nothing about the real filesystem.
pub trait Locate: Send + Sync {
    fn locate(&self, name: &str) -> Result<PathBuf, LocateError>;
}

/// Where a search directory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchRoot {
    /// `CHART_SAVER_BIN_DIR`.
    EnvOverride,
    /// An entry of `PATH`.
    SystemPath,
    /// `$(npm prefix)/node_modules/.bin`.
    NpmProject,
    /// The npm global bin directory.
    NpmGlobal,
    /// A directory passed to [`ExecLocator::with_dirs`].
    Explicit,
}

// ── Locator ──────────────────────────────────────────────────────────────────

enum Roots {
    Default,
    Fixed(Vec<PathBuf>),
}

#[derive(Debug, Default)]
struct NpmDirs {
    project: Option<PathBuf>,
    global: Option<PathBuf>,
}

/// Memoizing executable locator.
pub struct ExecLocator {
    roots: Roots,
    npm_dirs: OnceLock<NpmDirs>,
    resolved: Mutex<HashMap<String, PathBuf>>,
}

impl Default for ExecLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecLocator")
            .field("explicit", &matches!(self.roots, Roots::Fixed(_)))
            .field("npm_dirs", &self.npm_dirs.get())
            .finish()
    }
}

impl ExecLocator {
    /// A locator over the default roots (env override, `PATH`, npm).
    pub fn new() -> Self {
        Self {
            roots: Roots::Default,
            npm_dirs: OnceLock::new(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// A locator that searches only `dirs`, in order.
    ///
    /// Never consults `PATH` or npm.
    pub fn with_dirs<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: Roots::Fixed(dirs.into_iter().map(Into::into).collect()),
            npm_dirs: OnceLock::new(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// The directories [`locate`](Self::locate) will search, in priority order.
    pub fn search_dirs(&self) -> Vec<(SearchRoot, PathBuf)> {
        match &self.roots {
            Roots::Fixed(dirs) => dirs
                .iter()
                .map(|d| (SearchRoot::Explicit, d.clone()))
                .collect(),
            Roots::Default => {
                let mut dirs = Vec::new();
                if let Some(dir) = std::env::var_os(BIN_DIR_ENV).filter(|v| !v.is_empty()) {
                    dirs.push((SearchRoot::EnvOverride, PathBuf::from(dir)));
                }
                if let Some(path) = std::env::var_os("PATH") {
                    dirs.extend(
                        std::env::split_paths(&path).map(|d| (SearchRoot::SystemPath, d)),
                    );
                }
                let npm = self.npm_dirs.get_or_init(query_npm_dirs);
                if let Some(ref d) = npm.project {
                    dirs.push((SearchRoot::NpmProject, d.clone()));
                }
                if let Some(ref d) = npm.global {
                    dirs.push((SearchRoot::NpmGlobal, d.clone()));
                }
                dirs
            }
        }
    }

    /// Resolve `name`, returning the memoized path on repeat calls.
    pub fn locate(&self, name: &str) -> Result<PathBuf, LocateError> {
        if name.trim().is_empty() {
            return Err(LocateError::InvalidName(name.to_string()));
        }
        if let Some(path) = self.cached(name) {
            return Ok(path);
        }

        // A name with a separator is already a path.
        if name.contains('/') || name.contains(std::path::MAIN_SEPARATOR) {
            let p = PathBuf::from(name);
            return if is_executable(&p) {
                self.remember(name, &p);
                Ok(p)
            } else {
                Err(LocateError::NotFound {
                    name: name.to_string(),
                    searched: 0,
                })
            };
        }

        let dirs = self.search_dirs();
        for (root, dir) in &dirs {
            if let Some(found) = executable_in(dir, name) {
                debug!("Located {} via {:?}: {}", name, root, found.display());
                self.remember(name, &found);
                return Ok(found);
            }
        }

        debug!("{} not found in {} directories", name, dirs.len());
        Err(LocateError::NotFound {
            name: name.to_string(),
            searched: dirs.len(),
        })
    }

    /// The memoized path for `name`, if it was resolved before.
    pub fn cached(&self, name: &str) -> Option<PathBuf> {
        self.resolved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    fn remember(&self, name: &str, path: &Path) {
        self.resolved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), path.to_path_buf());
    }
}

impl Locate for ExecLocator {
    fn locate(&self, name: &str) -> Result<PathBuf, LocateError> {
        ExecLocator::locate(self, name)
    }
}

// ── Internal helpers ─────────────────────────────────────────────────────────

fn npm_program() -> &'static str {
    if cfg!(windows) {
        "npm.cmd"
    } else {
        "npm"
    }
}

fn query_npm_dirs() -> NpmDirs {
    let project = npm_prefix(false).map(|p| p.join("node_modules").join(".bin"));
    let global = npm_prefix(true).map(|p| {
        if cfg!(windows) {
            p
        } else {
            p.join("bin")
        }
    });
    NpmDirs { project, global }
}

/// `npm prefix [--global]`, or `None` when npm is missing or fails.
fn npm_prefix(global: bool) -> Option<PathBuf> {
    let mut cmd = Command::new(npm_program());
    cmd.arg("prefix");
    if global {
        cmd.arg("--global");
    }
    match cmd.output() {
        Ok(out) if out.status.success() => {
            let prefix = String::from_utf8_lossy(&out.stdout).trim().to_string();
            (!prefix.is_empty()).then(|| PathBuf::from(prefix))
        }
        Ok(out) => {
            debug!(
                "npm prefix{} exited with {}",
                if global { " --global" } else { "" },
                out.status
            );
            None
        }
        Err(e) => {
            debug!("npm unavailable: {}", e);
            None
        }
    }
}

fn executable_in(dir: &Path, name: &str) -> Option<PathBuf> {
    candidate_names(name)
        .into_iter()
        .map(|candidate| dir.join(candidate))
        .find(|p| is_executable(p))
}

#[cfg(windows)]
fn candidate_names(name: &str) -> Vec<String> {
    if Path::new(name).extension().is_some() {
        return vec![name.to_string()];
    }
    let exts = std::env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
    let mut names: Vec<String> = exts
        .split(';')
        .filter(|e| !e.is_empty())
        .map(|e| format!("{name}{}", e.to_ascii_lowercase()))
        .collect();
    names.push(name.to_string());
    names
}

#[cfg(not(windows))]
fn candidate_names(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn install(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let p = dir.join(name);
        std::fs::write(&p, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = std::fs::metadata(&p).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&p, perms).unwrap();
        p
    }

    #[test]
    fn empty_name_is_rejected() {
        let locator = ExecLocator::with_dirs(Vec::<PathBuf>::new());
        assert_eq!(
            locator.locate("  "),
            Err(LocateError::InvalidName("  ".into()))
        );
    }

    #[test]
    fn missing_tool_reports_searched_count() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let locator = ExecLocator::with_dirs([a.path(), b.path()]);
        let err = locator.locate("vg2png").unwrap_err();
        assert_eq!(
            err,
            LocateError::NotFound {
                name: "vg2png".into(),
                searched: 2
            }
        );
        assert!(err.to_string().contains("vg2png"));
    }

    #[cfg(unix)]
    #[test]
    fn first_directory_wins() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        install(b.path(), "vl2vg");
        let expected = install(a.path(), "vl2vg");

        let locator = ExecLocator::with_dirs([a.path(), b.path()]);
        assert_eq!(locator.locate("vl2vg").unwrap(), expected);
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_files_are_skipped() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        std::fs::write(a.path().join("vg2svg"), "not a program").unwrap();
        let expected = install(b.path(), "vg2svg");

        let locator = ExecLocator::with_dirs([a.path(), b.path()]);
        assert_eq!(locator.locate("vg2svg").unwrap(), expected);
    }

    #[cfg(unix)]
    #[test]
    fn resolution_is_memoized() {
        let dir = TempDir::new().unwrap();
        let path = install(dir.path(), "vg2pdf");
        let locator = ExecLocator::with_dirs([dir.path()]);

        assert_eq!(locator.cached("vg2pdf"), None);
        assert_eq!(locator.locate("vg2pdf").unwrap(), path);

        // Removing the file does not invalidate the cache.
        std::fs::remove_file(&path).unwrap();
        assert_eq!(locator.locate("vg2pdf").unwrap(), path);
        assert_eq!(locator.cached("vg2pdf"), Some(path));
    }

    #[cfg(unix)]
    #[test]
    fn explicit_path_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = install(dir.path(), "chromedriver");
        let locator = ExecLocator::with_dirs(Vec::<PathBuf>::new());
        let name = path.to_string_lossy().to_string();
        assert_eq!(locator.locate(&name).unwrap(), path);
    }

    #[test]
    fn explicit_dirs_are_tagged() {
        let dir = TempDir::new().unwrap();
        let locator = ExecLocator::with_dirs([dir.path()]);
        let dirs = locator.search_dirs();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].0, SearchRoot::Explicit);
    }

    #[test]
    fn env_override_is_searched_first() {
        let dir = TempDir::new().unwrap();
        std::env::set_var(BIN_DIR_ENV, dir.path());
        let dirs = ExecLocator::new().search_dirs();
        std::env::remove_var(BIN_DIR_ENV);
        assert_eq!(dirs[0], (SearchRoot::EnvOverride, dir.path().to_path_buf()));
    }
}
