//! Running a single converter process.

use crate::config::ExportConfig;
use crate::error::SaveError;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

/// Run `program` with `args`, feeding `input` on stdin, and return stdout.
///
/// Stderr is captured separately. Lines passing the configured filter go
/// to the progress callback, or to this process's stderr when there is
/// none. A non-zero exit is [`SaveError::ConversionFailed`] carrying the
/// unfiltered stderr; so is running past `converter_timeout`, with no exit
/// code, after the child has been killed.
pub async fn run_converter(
    program: &Path,
    name: &str,
    args: &[String],
    input: Vec<u8>,
    config: &ExportConfig,
) -> Result<Vec<u8>, SaveError> {
    let started_at = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            warn!(
                target = "pipeline::subprocess",
                op = "converter::spawn",
                result = "error",
                program = name,
                error = %err,
                "Failed to spawn converter"
            );
            if err.kind() == ErrorKind::NotFound {
                SaveError::ExecutableNotFound {
                    name: name.to_string(),
                }
            } else {
                SaveError::ConverterSpawn {
                    program: name.to_string(),
                    source: err,
                }
            }
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SaveError::Internal(format!("{name}: stdin was not captured")))?;
    let input_len = input.len();
    // Written concurrently with reading stdout so a large result cannot
    // deadlock against a large input.
    let writer = tokio::spawn(async move {
        stdin.write_all(&input).await?;
        stdin.shutdown().await
    });

    let waited = match config.converter_timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(result) => result,
            Err(_) => {
                writer.abort();
                warn!(
                    target = "pipeline::subprocess",
                    op = "converter::run",
                    result = "timeout",
                    program = name,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Converter timed out and was killed"
                );
                return Err(SaveError::ConversionFailed {
                    program: name.to_string(),
                    exit_code: None,
                    stderr: format!("timed out after {limit:?}"),
                });
            }
        },
        None => child.wait_with_output().await,
    };
    let output = waited.map_err(|err| SaveError::ConverterSpawn {
        program: name.to_string(),
        source: err,
    })?;

    match writer.await {
        Ok(Ok(())) => {}
        // The converter may exit before reading all input; its exit status says why.
        Ok(Err(err)) if err.kind() == ErrorKind::BrokenPipe => {}
        Ok(Err(err)) => warn!("{}: failed writing stdin: {}", name, err),
        Err(err) => warn!("{}: stdin writer task failed: {}", name, err),
    }

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    forward_stderr(name, &stderr, config);

    if !output.status.success() {
        let exit_code = output.status.code();
        warn!(
            target = "pipeline::subprocess",
            op = "converter::run",
            result = "error",
            program = name,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            exit_code = exit_code.map(i64::from).unwrap_or(-1),
            "Converter exited unsuccessfully"
        );
        return Err(SaveError::ConversionFailed {
            program: name.to_string(),
            exit_code,
            stderr,
        });
    }

    info!(
        target = "pipeline::subprocess",
        op = "converter::run",
        result = "ok",
        program = name,
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        input_bytes = input_len,
        output_bytes = output.stdout.len(),
        "Converter finished"
    );
    Ok(output.stdout)
}

fn forward_stderr(name: &str, stderr: &str, config: &ExportConfig) {
    for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
        if !config.keep_stderr_line(line) {
            continue;
        }
        match config.progress_callback {
            Some(ref cb) => cb.on_converter_stderr(name, line),
            None => eprintln!("{name}: {line}"),
        }
    }
}
