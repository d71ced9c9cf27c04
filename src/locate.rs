//! Executable lookup from async code.
//!
//! [`Locate`] is synchronous: a first lookup stats every search directory and
//! may run `npm prefix` twice. These helpers move that work onto the
//! blocking pool so the runtime (and the resource server on it) keeps
//! running.

use crate::error::SaveError;
use exec_locator::Locate;
use std::path::PathBuf;
use std::sync::Arc;

/// Run `f` against the locator on the blocking pool.
pub async fn with_locator<T, F>(locator: &Arc<dyn Locate>, f: F) -> Result<T, SaveError>
where
    F: FnOnce(&dyn Locate) -> T + Send + 'static,
    T: Send + 'static,
{
    let locator = Arc::clone(locator);
    tokio::task::spawn_blocking(move || f(locator.as_ref()))
        .await
        .map_err(|e| SaveError::Internal(format!("locate task failed: {e}")))
}

/// Resolve one executable.
pub async fn locate(locator: &Arc<dyn Locate>, name: &'static str) -> Result<PathBuf, SaveError> {
    with_locator(locator, move |l| l.locate(name).map_err(SaveError::from)).await?
}

/// Resolve every executable in `names`, failing on the first one missing.
pub async fn locate_all(
    locator: &Arc<dyn Locate>,
    names: &[&'static str],
) -> Result<Vec<PathBuf>, SaveError> {
    let names = names.to_vec();
    with_locator(locator, move |l| {
        names
            .iter()
            .map(|name| l.locate(name).map_err(SaveError::from))
            .collect::<Result<Vec<_>, _>>()
    })
    .await?
}
