//! Streaming bundle API: emit each format as soon as it is ready.
//!
//! ## Why stream?
//!
//! A bundle mixing cheap formats (JSON, HTML) with expensive ones (a browser
//! PNG, a converter PDF) would otherwise wait for the slowest entry.
//! [`bundle_stream`] yields `(mimetype, content)` items in completion order;
//! collect into a [`crate::MimeBundle`] if order does not matter.

use crate::content::{Content, Format, Spec};
use crate::error::SaveError;
use crate::export::Exporter;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::info;

/// One bundle entry: `(mimetype, content)`, or the error for that format.
pub type BundleItem = Result<(String, Content), SaveError>;

/// A boxed stream of bundle entries.
pub type BundleStream = Pin<Box<dyn Stream<Item = BundleItem> + Send>>;

/// Render every format concurrently, yielding entries as they complete.
///
/// The formats are validated up front, exactly as for
/// [`Exporter::bundle`]; a failure there is returned instead of a stream.
/// Browser entries still queue on their driver.
pub fn bundle_stream(exporter: &Exporter, spec: &Spec, formats: &[Format]) -> Result<BundleStream, SaveError> {
    exporter.check_bundle(formats)?;
    info!("Streaming bundle of {} formats", formats.len());

    let concurrency = formats.len().max(1);
    let exporter = exporter.clone();
    let spec = spec.clone();
    let items = stream::iter(formats.to_vec())
        .map(move |format| {
            let exporter = exporter.clone();
            let spec = spec.clone();
            async move { exporter.bundle_entry(&spec, format).await }
        })
        .buffer_unordered(concurrency);
    Ok(Box::pin(items))
}
