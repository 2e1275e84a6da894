//! CLI output
//!
//! In streaming mode the result travels as a `result` node frame just ahead
//! of the completion sentinel, so `complete` is always the last frame written.

use crate::types::EvaluationResult;
use futures::{Stream, StreamExt};
use std::io::Write;
use std::path::Path;
use studylink_common::events::ProgressEvent;
use studylink_common::{Error, Result};
use tokio::task::JoinHandle;
use tracing::debug;

/// Node name of the frame carrying the final result
pub const RESULT_NODE: &str = "result";

/// Wrap the final result as a node event (result JSON in `details`)
pub fn result_event(result: &EvaluationResult) -> Result<ProgressEvent> {
    let details = serde_json::to_value(result)?;
    Ok(ProgressEvent::node(RESULT_NODE, "Evaluation complete.", Some(details)))
}

/// Write stage events as SSE frames, then the result frame, then `complete`
///
/// Any sentinel arriving from `events` is held back until the run's result
/// has been written.
pub async fn write_sse<S, W>(events: S, run: JoinHandle<EvaluationResult>, out: &mut W) -> Result<EvaluationResult>
where
    S: Stream<Item = ProgressEvent>,
    W: Write,
{
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        if event.is_complete() {
            break;
        }
        write_frame(out, &event)?;
    }

    let result = run
        .await
        .map_err(|e| Error::Internal(format!("Evaluation task failed: {}", e)))?;

    write_frame(out, &result_event(&result)?)?;
    write_frame(out, &ProgressEvent::Complete)?;
    Ok(result)
}

/// Write the result as pretty JSON
pub fn write_result_file(path: &Path, result: &EvaluationResult) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(path, json)?;
    debug!(path = %path.display(), "Wrote evaluation result");
    Ok(())
}

fn write_frame<W: Write>(out: &mut W, event: &ProgressEvent) -> Result<()> {
    out.write_all(event.to_sse_frame().as_bytes())?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::PipelineState;
    use studylink_common::events::parse_sse_line;

    fn frames(bytes: &[u8]) -> Vec<ProgressEvent> {
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        text.split("\n\n")
            .filter(|chunk| !chunk.trim().is_empty())
            .map(|chunk| parse_sse_line(chunk).expect("every chunk is a data frame"))
            .collect()
    }

    fn finished_run() -> JoinHandle<EvaluationResult> {
        tokio::spawn(async { PipelineState::new().into_result() })
    }

    #[tokio::test]
    async fn test_sentinel_is_last_frame() {
        let events = futures::stream::iter(vec![
            ProgressEvent::node("prepare_attachment", "No attachment.", None),
            ProgressEvent::node("summarize", "Nothing matched.", None),
            ProgressEvent::Complete,
        ]);
        let mut out = Vec::new();
        let result = write_sse(events, finished_run(), &mut out).await.unwrap();

        let written = frames(&out);
        assert_eq!(written.len(), 4);
        assert_eq!(written.last(), Some(&ProgressEvent::Complete));
        assert_eq!(written.iter().filter(|e| e.is_complete()).count(), 1);
        assert_eq!(written[2].node_name(), Some(RESULT_NODE));

        match &written[2] {
            ProgressEvent::Node { details: Some(details), .. } => {
                let carried: EvaluationResult = serde_json::from_value(details.clone()).unwrap();
                assert_eq!(carried, result);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sentinel_written_when_stream_lacks_one() {
        let events = futures::stream::iter(vec![ProgressEvent::node("summarize", "Done.", None)]);
        let mut out = Vec::new();
        write_sse(events, finished_run(), &mut out).await.unwrap();

        let written = frames(&out);
        assert_eq!(written.len(), 3);
        assert_eq!(written[1].node_name(), Some(RESULT_NODE));
        assert_eq!(written.last(), Some(&ProgressEvent::Complete));
    }

    #[tokio::test]
    async fn test_failed_run_is_an_internal_error() {
        async fn aborted() -> EvaluationResult {
            panic!("run aborted")
        }

        let run = tokio::spawn(aborted());
        let mut out = Vec::new();
        let err = write_sse(futures::stream::empty(), run, &mut out).await.unwrap_err();

        assert!(matches!(err, Error::Internal(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_result_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        let result = PipelineState::new().into_result();

        write_result_file(&path, &result).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  \"match\": null"));
        let read_back: EvaluationResult = serde_json::from_str(&raw).unwrap();
        assert_eq!(read_back, result);
    }

    #[test]
    fn test_result_file_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("result.json");
        let err = write_result_file(&path, &PipelineState::new().into_result()).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
