//! Line-oriented job loop.
//!
//! Reads one JSON job request per input line and writes one JSON response
//! per output line. A line that does not parse yields a `ValidationError`
//! response; the loop only stops at end of input or on an I/O error.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use renderpod_core::job::{JobRequest, JobResponse};

use crate::handler::JobHandler;

/// Serve jobs from `input` until it is exhausted. Returns the number handled.
///
/// Lines are read as raw bytes so that invalid UTF-8 is answered like any
/// other malformed request instead of ending the loop.
pub async fn run<R, W>(handler: &JobHandler, mut input: R, mut output: W) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    let mut handled = 0usize;

    loop {
        line.clear();
        if input.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let response = match serde_json::from_slice::<JobRequest>(&line) {
            Ok(request) => handler.handle(&request).await,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed job request");
                JobResponse::error("ValidationError", format!("invalid job request: {e}"))
            }
        };

        let mut text = serde_json::to_string(&response).map_err(std::io::Error::other)?;
        text.push('\n');
        output.write_all(text.as_bytes()).await?;
        output.flush().await?;
        handled += 1;
    }

    Ok(handled)
}

#[cfg(test)]
mod tests {
    use renderpod_core::config::WorkerConfig;
    use serde_json::Value;

    use super::*;

    fn handler(root: &std::path::Path) -> JobHandler {
        let out = root.join("out").display().to_string();
        let models = root.join("models").display().to_string();
        let config = WorkerConfig::from_lookup(|key| match key {
            "OUTPUT_DIR" => Some(out.clone()),
            "MODEL_DIR" => Some(models.clone()),
            "MODEL_MANIFEST" => Some("/nonexistent/manifest.txt".into()),
            _ => None,
        })
        .expect("config");
        JobHandler::new(config, None)
    }

    #[tokio::test]
    async fn malformed_and_invalid_requests_get_validation_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input: &[u8] = b"not json\n\n{\"input\": {}}\n{\"input\": {\"workflow\": \"{oops\"}}\n";
        let mut output = Vec::new();

        let handled = run(&handler(dir.path()), input, &mut output)
            .await
            .expect("run");
        assert_eq!(handled, 3);

        let responses: Vec<Value> = String::from_utf8(output)
            .expect("utf8")
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(responses.len(), 3);
        for response in &responses {
            assert_eq!(response["status"], "error");
            assert_eq!(response["error_kind"], "ValidationError");
        }
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_answered_and_loop_continues() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input: &[u8] = b"{\"input\": \xff}\n{\"input\": {}}\n";
        let mut output = Vec::new();

        let handled = run(&handler(dir.path()), input, &mut output)
            .await
            .expect("invalid bytes must not end the loop");
        assert_eq!(handled, 2);

        let text = String::from_utf8(output).expect("utf8");
        let responses: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r["error_kind"] == "ValidationError"));
    }

    #[tokio::test]
    async fn last_line_without_newline_is_handled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut output = Vec::new();
        let handled = run(&handler(dir.path()), &b"{\"input\": {}}"[..], &mut output)
            .await
            .expect("run");
        assert_eq!(handled, 1);
    }

    #[tokio::test]
    async fn empty_input_handles_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut output = Vec::new();
        let handled = run(&handler(dir.path()), &b""[..], &mut output)
            .await
            .expect("run");
        assert_eq!(handled, 0);
        assert!(output.is_empty());
    }
}
