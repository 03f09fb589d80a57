//! Engine stream demultiplexing.
//!
//! The engine answers builds and pulls with a stream of JSON records, one
//! per line: `{"stream": ...}` for raw output, `{"status": ...}` for
//! progress, `{"aux": {"ID": ...}}` for the structured result, and
//! `{"error": ...}` on failure. Human-readable lines are forwarded to the
//! build logger; the image id is extracted from the terminal
//! "Successfully built" line or the aux record, the aux record winning.

use crate::engine::EngineStream;
use crate::error::{KilnError, Result};
use crate::notify::{BuildLogger, LogStream};
use futures::StreamExt;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct EngineRecord {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    progress: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    aux: Option<AuxRecord>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "errorDetail")]
    error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct AuxRecord {
    #[serde(default, rename = "ID")]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// Consume an engine JSON stream, forwarding output to the logger.
///
/// Returns the extracted image id, if the stream produced one. An error
/// record in the stream fails the call.
pub async fn demux_engine_stream(
    mut stream: EngineStream,
    logger: &BuildLogger,
) -> Result<Option<String>> {
    let mut image_id: Option<String> = None;
    let mut aux_id: Option<String> = None;
    let mut pending = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        pending.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            process_record(line.trim(), logger, &mut image_id, &mut aux_id)?;
        }
    }
    // A final record may arrive without a trailing newline.
    if !pending.trim().is_empty() {
        let line = std::mem::take(&mut pending);
        process_record(line.trim(), logger, &mut image_id, &mut aux_id)?;
    }

    Ok(aux_id.or(image_id))
}

fn process_record(
    line: &str,
    logger: &BuildLogger,
    image_id: &mut Option<String>,
    aux_id: &mut Option<String>,
) -> Result<()> {
    if line.is_empty() {
        return Ok(());
    }
    let Ok(record) = serde_json::from_str::<EngineRecord>(line) else {
        // Not JSON; surface it raw rather than lose it.
        logger.line(LogStream::Stdout, line);
        return Ok(());
    };

    if let Some(error) = record.error {
        let message = record
            .error_detail
            .and_then(|d| d.message)
            .unwrap_or(error);
        logger.line(LogStream::Stderr, &message);
        return Err(KilnError::BuildFailed { reason: message });
    }

    if let Some(text) = record.stream {
        if !text.trim().is_empty() {
            logger.line(LogStream::Stdout, text.trim_end());
        }
        if let Some(rest) = text.trim().strip_prefix("Successfully built ") {
            if let Some(token) = rest.split_whitespace().next() {
                *image_id = Some(token.trim_start_matches("sha256:").to_string());
            }
        }
    }

    if let Some(status) = record.status {
        let mut line = status;
        if let Some(progress) = record.progress {
            line.push(' ');
            line.push_str(&progress);
        }
        if let Some(id) = record.id {
            line = format!("[{}] {}", id, line);
        }
        logger.line(LogStream::Stdout, &line);
    }

    if let Some(aux) = record.aux {
        if let Some(id) = aux.id {
            *aux_id = Some(id.trim_start_matches("sha256:").to_string());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullNotifier;
    use bytes::Bytes;
    use std::sync::Arc;

    fn stream_of(lines: &[&str]) -> EngineStream {
        let chunks: Vec<crate::error::Result<Bytes>> = lines
            .iter()
            .map(|l| Ok(Bytes::from(format!("{}\n", l))))
            .collect();
        futures::stream::iter(chunks).boxed()
    }

    fn logger() -> BuildLogger {
        BuildLogger::new("b", Arc::new(NullNotifier))
    }

    #[tokio::test]
    async fn test_id_from_successfully_built_line() {
        let stream = stream_of(&[
            r#"{"stream":"Step 1/1 : FROM alpine\n"}"#,
            r#"{"stream":"Successfully built 4a1b2c3d4e5f\n"}"#,
        ]);
        let logger = logger();
        let id = demux_engine_stream(stream, &logger).await.unwrap();
        assert_eq!(id.as_deref(), Some("4a1b2c3d4e5f"));
        assert!(logger.transcript().contains("Step 1/1"));
    }

    #[tokio::test]
    async fn test_aux_record_preferred() {
        let stream = stream_of(&[
            r#"{"stream":"Successfully built 4a1b2c3d4e5f\n"}"#,
            r#"{"aux":{"ID":"sha256:feedfacecafe"}}"#,
        ]);
        let id = demux_engine_stream(stream, &logger()).await.unwrap();
        assert_eq!(id.as_deref(), Some("feedfacecafe"));
    }

    #[tokio::test]
    async fn test_error_record_fails() {
        let stream = stream_of(&[
            r#"{"stream":"Step 1/2 : FROM alpine\n"}"#,
            r#"{"error":"oops","errorDetail":{"message":"The command '/bin/false' returned a non-zero code: 1"}}"#,
        ]);
        let err = demux_engine_stream(stream, &logger()).await.unwrap_err();
        assert!(err.to_string().contains("non-zero code"));
    }

    #[tokio::test]
    async fn test_status_and_progress_forwarded() {
        let stream = stream_of(&[
            r#"{"status":"Downloading","progress":"[=>   ] 12%","id":"layer1"}"#,
        ]);
        let logger = logger();
        let id = demux_engine_stream(stream, &logger).await.unwrap();
        assert!(id.is_none());
        assert!(logger.transcript().contains("[layer1] Downloading [=>   ] 12%"));
    }

    #[tokio::test]
    async fn test_record_split_across_chunks() {
        let chunks: Vec<crate::error::Result<Bytes>> = vec![
            Ok(Bytes::from(r#"{"aux":{"ID":"sha2"#)),
            Ok(Bytes::from("56:00ff00ff\"}}\n")),
        ];
        let stream = futures::stream::iter(chunks).boxed();
        let id = demux_engine_stream(stream, &logger()).await.unwrap();
        assert_eq!(id.as_deref(), Some("00ff00ff"));
    }
}
