//! Streaming safety wrapper: reassembles raw upstream bytes into whole SSE
//! frames, detects mid-stream error payloads, and enforces an inter-chunk
//! read timeout. Dropping the wrapper drops the upstream body, which cancels
//! the connection, so client disconnects propagate upstream.

use crate::error::GatewayError;
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};

/// Default inter-chunk read timeout for streaming responses.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// One server-sent event, reduced to its data payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    /// Concatenated `data:` lines of the event.
    pub data: String,
}

impl SseFrame {
    /// The `data: [DONE]` terminator used by OpenAI-wire streams.
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

pin_project! {
    /// Stream adapter yielding well-formed SSE frames from a byte stream.
    pub struct SseFrames<S> {
        #[pin]
        inner: S,
        #[pin]
        idle: Sleep,
        idle_timeout: Duration,
        buffer: String,
        inspect_errors: bool,
        finished: bool,
    }
}

impl<S> SseFrames<S> {
    /// `inspect_errors` enables JSON inspection of each frame for embedded
    /// error payloads. Passthrough callers that forward frames verbatim turn
    /// it off to skip the re-parse.
    pub fn new(inner: S, idle_timeout: Duration, inspect_errors: bool) -> Self {
        Self {
            inner,
            idle: sleep(idle_timeout),
            idle_timeout,
            buffer: String::new(),
            inspect_errors,
            finished: false,
        }
    }
}

/// Pull the next complete data-bearing event (terminated by a blank line)
/// out of `buffer`, skipping comment/keepalive events.
fn extract_frame(buffer: &mut String) -> Option<SseFrame> {
    loop {
        // Events end at a blank line; tolerate both \n\n and \r\n\r\n.
        let boundary = buffer.find("\n\n").map(|i| (i, 2)).or_else(|| {
            buffer.find("\r\n\r\n").map(|i| (i, 4))
        })?;
        let (index, sep_len) = boundary;
        let raw: String = buffer.drain(..index + sep_len).collect();
        if let Some(frame) = parse_event(&raw) {
            return Some(frame);
        }
    }
}

fn parse_event(raw: &str) -> Option<SseFrame> {
    let mut data_lines: Vec<&str> = Vec::new();
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Comment lines (":keepalive") and event/id fields are dropped.
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(SseFrame { data: data_lines.join("\n") })
}

/// Error payloads some providers push inside an otherwise-200 stream.
fn embedded_error(data: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    if value.get("type").and_then(|t| t.as_str()) == Some("error") {
        let message = value
            .pointer("/error/message")
            .and_then(|m| m.as_str())
            .unwrap_or(data);
        return Some(message.to_string());
    }
    if let Some(error) = value.get("error") {
        if error.is_object() || error.is_string() {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .or_else(|| error.as_str())
                .unwrap_or(data);
            return Some(message.to_string());
        }
    }
    None
}

impl<S, E> Stream for SseFrames<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<GatewayError>,
{
    type Item = Result<SseFrame, GatewayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(frame) = extract_frame(this.buffer) {
                if *this.inspect_errors {
                    if let Some(message) = embedded_error(&frame.data) {
                        *this.finished = true;
                        return Poll::Ready(Some(Err(GatewayError::Streamed(
                            crate::providers::sanitize::sanitize_api_error(&message),
                        ))));
                    }
                }
                return Poll::Ready(Some(Ok(frame)));
            }
            if *this.finished {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.push_str(&String::from_utf8_lossy(&chunk));
                    this.idle
                        .as_mut()
                        .reset(Instant::now() + *this.idle_timeout);
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(e.into())));
                }
                Poll::Ready(None) => {
                    *this.finished = true;
                    // A final event without the trailing blank line still
                    // counts.
                    if !this.buffer.trim().is_empty() {
                        let rest = std::mem::take(this.buffer);
                        if let Some(frame) = parse_event(&rest) {
                            return Poll::Ready(Some(Ok(frame)));
                        }
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    if this.idle.as_mut().poll(cx).is_ready() {
                        *this.finished = true;
                        return Poll::Ready(Some(Err(GatewayError::Timeout(format!(
                            "no stream data for {:?}",
                            this.idle_timeout
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn byte_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<Bytes, GatewayError>> {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes()))),
        )
    }

    async fn collect(
        chunks: Vec<&'static str>,
        inspect: bool,
    ) -> Vec<Result<SseFrame, GatewayError>> {
        SseFrames::new(byte_stream(chunks), STREAM_IDLE_TIMEOUT, inspect)
            .collect()
            .await
    }

    #[tokio::test]
    async fn reassembles_frames_split_across_chunks() {
        let frames = collect(
            vec!["data: {\"a\":", "1}\n\ndata: {\"b\":2}\n", "\n"],
            false,
        )
        .await;
        let payloads: Vec<String> = frames.into_iter().map(|f| f.unwrap().data).collect();
        assert_eq!(payloads, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[tokio::test]
    async fn concatenation_preserves_payloads() {
        let chunks = vec![
            "data: hello\n\n",
            ": keepalive\n\n",
            "event: delta\ndata: world\n\n",
            "data: [DONE]\n\n",
        ];
        let frames = collect(chunks, false).await;
        let joined: String = frames
            .into_iter()
            .map(|f| f.unwrap().data)
            .collect::<Vec<_>>()
            .join("");
        assert_eq!(joined, "helloworld[DONE]");
    }

    #[tokio::test]
    async fn multi_line_data_joins_with_newline() {
        let frames = collect(vec!["data: a\ndata: b\n\n"], false).await;
        assert_eq!(frames[0].as_ref().unwrap().data, "a\nb");
    }

    #[tokio::test]
    async fn detects_mid_stream_error_frames() {
        let chunks = vec![
            "data: {\"choices\":[]}\n\n",
            "data: {\"type\":\"error\",\"error\":{\"message\":\"overloaded\"}}\n\n",
        ];
        let frames = collect(chunks, true).await;
        assert!(frames[0].is_ok());
        match &frames[1] {
            Err(GatewayError::Streamed(message)) => assert!(message.contains("overloaded")),
            other => panic!("expected streamed error, got {other:?}"),
        }
        // The stream terminates after an error frame.
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn passthrough_skips_error_inspection() {
        let chunks = vec!["data: {\"error\":{\"message\":\"x\"}}\n\n"];
        let frames = collect(chunks, false).await;
        assert!(frames[0].is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fails_the_stream() {
        let pending = futures::stream::pending::<Result<Bytes, GatewayError>>();
        let frames = SseFrames::new(pending, Duration::from_secs(180), true);
        tokio::pin!(frames);
        let next = frames.next();
        // Paused clock: the idle timer fires as soon as time advances past it.
        let result = tokio::time::timeout(Duration::from_secs(181), next)
            .await
            .expect("timer should fire");
        assert!(matches!(result, Some(Err(GatewayError::Timeout(_)))));
    }

    #[tokio::test]
    async fn final_frame_without_trailing_blank_line() {
        let frames = collect(vec!["data: tail"], false).await;
        assert_eq!(frames[0].as_ref().unwrap().data, "tail");
    }
}
