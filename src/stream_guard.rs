//! Wraps upstream byte streams so that every failure becomes an in-band error
//! event followed by the stream sentinel, and nothing is sent after it.

use crate::error::RETRY_AFTER_SECS;
use crate::metrics::{LifecycleEvent, MetricsSink};
use crate::translate::anthropic_types::{ErrorBody, ErrorResponse};
use crate::translate::streaming::SseFrame;
use crate::translate::{Dialect, StreamTranscoder, STREAM_SENTINEL};
use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::Stream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;
use tracing::{debug, error, warn};

pub type GuardedStream = std::pin::Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Reports `StreamClosed` exactly once, including when the client goes away
/// and the stream is dropped mid-flight.
pub struct CloseReporter {
    request_id: String,
    metrics: Arc<dyn MetricsSink>,
    started: Instant,
    input_tokens: u64,
    output_tokens: u64,
    errored: bool,
}

impl CloseReporter {
    pub fn new(request_id: impl Into<String>, metrics: Arc<dyn MetricsSink>, started: Instant) -> Self {
        Self {
            request_id: request_id.into(),
            metrics,
            started,
            input_tokens: 0,
            output_tokens: 0,
            // cleared once the stream ends on its own
            errored: true,
        }
    }

    fn complete(&mut self, usage: (u64, u64), errored: bool) {
        self.input_tokens = usage.0;
        self.output_tokens = usage.1;
        self.errored = errored;
    }
}

impl Drop for CloseReporter {
    fn drop(&mut self) {
        let duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.metrics.record(
            &self.request_id,
            LifecycleEvent::StreamClosed {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
                duration_ms,
                errored: self.errored,
            },
        );
    }
}

pub fn timeout_error(idle: Duration) -> ErrorBody {
    ErrorBody {
        code: Some("read_timeout".to_string()),
        retry_after: Some(RETRY_AFTER_SECS),
        ..ErrorBody::new(
            "upstream_timeout",
            format!("Upstream sent nothing for {}s", idle.as_secs()),
        )
    }
}

fn transport_error(err: &reqwest::Error, idle: Duration) -> ErrorBody {
    if err.is_timeout() {
        return timeout_error(idle);
    }
    ErrorBody {
        status: err.status().map(|s| s.as_u16()),
        ..ErrorBody::new("api_error", format!("Upstream stream failed: {err}"))
    }
}

fn event_stream_error(err: EventStreamError<reqwest::Error>, idle: Duration) -> ErrorBody {
    match err {
        EventStreamError::Transport(e) => transport_error(&e, idle),
        other => ErrorBody::new("api_error", format!("Malformed upstream event stream: {other}")),
    }
}

/// Error event plus sentinel in the client's dialect.
pub fn error_frames(dialect: Dialect, error: ErrorBody) -> [Bytes; 2] {
    let data = serde_json::to_string(&ErrorResponse::from_body(error)).unwrap_or_default();
    let frame = SseFrame {
        event: (dialect == Dialect::Anthropic).then_some("error"),
        data,
    };
    [frame.to_bytes(), Bytes::from_static(STREAM_SENTINEL.as_bytes())]
}

/// Decode upstream SSE, transcode it, and turn every failure into an error event.
pub fn guard_translated<S>(
    upstream: S,
    transcoder: StreamTranscoder,
    idle: Duration,
    reporter: CloseReporter,
) -> GuardedStream
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    Box::pin(translated_stream(upstream, transcoder, idle, reporter))
}

fn translated_stream<S>(
    upstream: S,
    mut transcoder: StreamTranscoder,
    idle: Duration,
    mut reporter: CloseReporter,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    async_stream::stream! {
        let events = upstream.eventsource().timeout(idle);
        tokio::pin!(events);
        let mut errored = false;

        loop {
            let failure = match events.next().await {
                None => {
                    for bytes in transcoder.finish() {
                        yield Ok(bytes);
                    }
                    break;
                }
                Some(Err(_elapsed)) => {
                    warn!(request_id = %reporter.request_id, idle_secs = idle.as_secs(), "Upstream stream idle timeout");
                    timeout_error(idle)
                }
                Some(Ok(Err(e))) => {
                    warn!(request_id = %reporter.request_id, error = %e, "Upstream stream failed");
                    event_stream_error(e, idle)
                }
                Some(Ok(Ok(event))) => match transcoder.process(&event.data) {
                    Ok(out) => {
                        for bytes in out {
                            yield Ok(bytes);
                        }
                        if transcoder.is_closed() {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        error!(request_id = %reporter.request_id, error = %e, data = %event.data, "Failed to convert upstream event");
                        ErrorBody::new("api_error", e.to_string())
                    }
                },
            };

            errored = true;
            for bytes in transcoder.fail(failure) {
                yield Ok(bytes);
            }
            break;
        }

        let errored = errored || transcoder.failed();
        debug!(
            request_id = %reporter.request_id,
            errored,
            state = ?transcoder.state(),
            tool_calls = transcoder.tool_calls().len(),
            "Translated stream closed"
        );
        reporter.complete(transcoder.usage(), errored);
    }
}

/// Forward upstream bytes unchanged. A clean end gets the sentinel appended
/// unless upstream already sent it. Failures append an error event and the
/// sentinel in `dialect`, then end the stream.
pub fn guard_passthrough<S>(
    upstream: S,
    dialect: Dialect,
    idle: Duration,
    reporter: CloseReporter,
) -> GuardedStream
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    Box::pin(passthrough_stream(upstream, dialect, idle, reporter))
}

fn passthrough_stream<S>(
    upstream: S,
    dialect: Dialect,
    idle: Duration,
    mut reporter: CloseReporter,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    async_stream::stream! {
        let chunks = upstream.timeout(idle);
        tokio::pin!(chunks);
        let mut errored = false;
        let mut tail: Vec<u8> = Vec::new();

        while let Some(item) = chunks.next().await {
            let failure = match item {
                Ok(Ok(bytes)) => {
                    remember_tail(&mut tail, &bytes);
                    yield Ok(bytes);
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(request_id = %reporter.request_id, error = %e, "Passthrough stream failed");
                    transport_error(&e, idle)
                }
                Err(_elapsed) => {
                    warn!(request_id = %reporter.request_id, idle_secs = idle.as_secs(), "Passthrough stream idle timeout");
                    timeout_error(idle)
                }
            };
            errored = true;
            for bytes in error_frames(dialect, failure) {
                yield Ok(bytes);
            }
            break;
        }

        if !errored && !ends_with_sentinel(&tail) {
            yield Ok(Bytes::from_static(STREAM_SENTINEL.as_bytes()));
        }
        reporter.complete((0, 0), errored);
    }
}

/// Keep the last few bytes seen, enough to recognise a trailing sentinel.
fn remember_tail(tail: &mut Vec<u8>, bytes: &[u8]) {
    const KEEP: usize = 32;
    tail.extend_from_slice(&bytes[bytes.len().saturating_sub(KEEP)..]);
    if tail.len() > KEEP {
        tail.drain(..tail.len() - KEEP);
    }
}

fn ends_with_sentinel(tail: &[u8]) -> bool {
    tail.trim_ascii_end().ends_with(STREAM_SENTINEL.trim_end().as_bytes())
}
