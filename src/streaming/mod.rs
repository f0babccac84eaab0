//! Full-duplex-aware streaming engine: pumps bytes from an upstream
//! response into the client while honoring two independent cancellation
//! signals and a per-read liveness deadline.

use crate::errors::DispatchError;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub buffer_size: usize,
    pub read_timeout: Duration,
    pub client_disconnect_bytes_threshold: u64,
    pub client_disconnect_time_threshold: Duration,
    pub last_chunk_inline_capacity: usize,
}

/// Per-stream state; owned exclusively by the task handling the request
/// for its lifetime.
#[derive(Debug, Default)]
pub struct StreamState {
    pub total_bytes: u64,
    pub client_disconnected: bool,
    pub disconnect_time: Option<Instant>,
    pub bytes_before_disconnect: u64,
    pub bytes_after_disconnect: u64,
    pub last_chunk: Vec<u8>,
}

#[derive(Debug)]
pub struct StreamOutcome {
    pub total_bytes: u64,
    /// Bytes actually delivered to the client. Equal to `total_bytes`
    /// unless the client disconnected mid-stream, in which case this
    /// freezes at the point of disconnect and excludes the post-disconnect
    /// drain.
    pub bytes_delivered: u64,
    pub client_disconnected: bool,
    pub last_chunk: Vec<u8>,
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Detect whether a response should be treated as a flush-per-chunk
/// stream: SSE or chunked-transfer content types, or an explicit
/// request-scoped override.
pub fn is_streaming_mode(content_type: Option<&str>, forced: bool) -> bool {
    if forced {
        return true;
    }
    match content_type {
        Some(ct) => {
            let lower = ct.to_ascii_lowercase();
            lower.contains("text/event-stream") || lower.contains("application/x-ndjson")
        }
        None => false,
    }
}

/// Pumps `upstream` into `sink` (the channel feeding an
/// `axum::body::Body::from_stream`), applying the client-disconnect
/// drain policy and the per-read deadline. Client disconnect is detected
/// the only way it actually manifests here: axum drops the body's
/// receiving end when the connection closes, which makes `sink.send`
/// fail. Returns once the upstream stream ends, a hard abort is
/// triggered, or an unrecoverable error occurs.
pub async fn pump(
    mut upstream: ByteStream,
    sink: mpsc::Sender<Result<Bytes, std::io::Error>>,
    upstream_cancel: CancellationToken,
    config: &StreamingConfig,
    endpoint: &str,
) -> Result<StreamOutcome, DispatchError> {
    use futures::StreamExt;

    let mut state = StreamState {
        last_chunk: Vec::with_capacity(config.last_chunk_inline_capacity),
        ..StreamState::default()
    };
    let started = Instant::now();
    let mut deadline = tokio::time::sleep(config.read_timeout);

    loop {
        if upstream_cancel.is_cancelled() {
            warn!(endpoint, "upstream context canceled, hard aborting stream");
            return Err(DispatchError::Stream {
                phase: "streaming",
                elapsed: started.elapsed(),
                message: "upstream context canceled".to_string(),
            });
        }

        if state.client_disconnected {
            let disconnected_for = state
                .disconnect_time
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if state.bytes_after_disconnect >= config.client_disconnect_bytes_threshold
                || disconnected_for >= config.client_disconnect_time_threshold
            {
                debug!(endpoint, "post-disconnect drain window elapsed, aborting");
                break;
            }
        }

        tokio::select! {
            biased;
            _ = &mut deadline => {
                return Err(DispatchError::ReadTimeout {
                    endpoint: endpoint.to_string(),
                    elapsed: started.elapsed(),
                });
            }
            next = upstream.next() => {
                match next {
                    None => break,
                    Some(Err(err)) => {
                        return Err(DispatchError::Stream {
                            phase: "streaming",
                            elapsed: started.elapsed(),
                            message: err.to_string(),
                        });
                    }
                    Some(Ok(chunk)) => {
                        deadline = tokio::time::sleep(config.read_timeout);
                        let len = chunk.len() as u64;
                        state.total_bytes += len;

                        capture_last_chunk(&mut state.last_chunk, &chunk, config.last_chunk_inline_capacity);

                        if state.client_disconnected {
                            state.bytes_after_disconnect += len;
                            continue;
                        }

                        if sink.send(Ok(chunk)).await.is_err() {
                            // Client write failed; treat exactly like a
                            // context cancellation from here on. The chunk
                            // that failed to send was never delivered, so
                            // the disconnect snapshot excludes it.
                            state.client_disconnected = true;
                            state.disconnect_time = Some(Instant::now());
                            state.bytes_before_disconnect = state.total_bytes - len;
                            debug!(endpoint, bytes = state.bytes_before_disconnect, "client disconnected, draining");
                        }
                    }
                }
            }
        }
    }

    let bytes_delivered = if state.client_disconnected {
        state.bytes_before_disconnect
    } else {
        state.total_bytes
    };

    Ok(StreamOutcome {
        total_bytes: state.total_bytes,
        bytes_delivered,
        client_disconnected: state.client_disconnected,
        last_chunk: state.last_chunk,
    })
}

/// Keep only the most recent `capacity` bytes seen, reusing the buffer
/// across chunks rather than reallocating per call where possible.
fn capture_last_chunk(buffer: &mut Vec<u8>, chunk: &Bytes, capacity: usize) {
    buffer.clear();
    if chunk.len() <= capacity {
        buffer.extend_from_slice(chunk);
    } else {
        buffer.extend_from_slice(&chunk[chunk.len() - capacity..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_mode_detected_from_sse_content_type() {
        assert!(is_streaming_mode(Some("text/event-stream"), false));
        assert!(!is_streaming_mode(Some("application/json"), false));
    }

    #[test]
    fn forced_override_wins_regardless_of_content_type() {
        assert!(is_streaming_mode(Some("application/json"), true));
    }

    #[test]
    fn last_chunk_capture_truncates_to_capacity() {
        let mut buffer = Vec::new();
        let chunk = Bytes::from(vec![1u8; 100]);
        capture_last_chunk(&mut buffer, &chunk, 10);
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer, vec![1u8; 10]);
    }

    #[test]
    fn last_chunk_capture_keeps_whole_chunk_under_capacity() {
        let mut buffer = Vec::new();
        let chunk = Bytes::from(vec![2u8; 5]);
        capture_last_chunk(&mut buffer, &chunk, 10);
        assert_eq!(buffer, vec![2u8; 5]);
    }

    #[tokio::test]
    async fn pump_reads_entire_stream_into_sink() {
        let chunks: Vec<reqwest::Result<Bytes>> =
            vec![Ok(Bytes::from_static(b"hello")), Ok(Bytes::from_static(b"world"))];
        let upstream: ByteStream = Box::pin(futures::stream::iter(chunks));
        let (tx, mut rx) = mpsc::channel(8);

        let config = StreamingConfig {
            buffer_size: 64 * 1024,
            read_timeout: Duration::from_secs(5),
            client_disconnect_bytes_threshold: 1024,
            client_disconnect_time_threshold: Duration::from_secs(5),
            last_chunk_inline_capacity: 8192,
        };

        let outcome = pump(upstream, tx, CancellationToken::new(), &config, "e1")
            .await
            .unwrap();

        assert_eq!(outcome.total_bytes, 10);
        assert_eq!(outcome.last_chunk, b"world");
        assert!(!outcome.client_disconnected);

        let mut received = Vec::new();
        while let Some(Ok(chunk)) = rx.recv().await {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"helloworld");
    }

    #[tokio::test]
    async fn pump_excludes_drain_bytes_from_bytes_delivered() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from(vec![0u8; 10_240])),
            Ok(Bytes::from(vec![0u8; 4_096])),
        ];
        let upstream: ByteStream = Box::pin(futures::stream::iter(chunks));
        let (tx, mut rx) = mpsc::channel(1);

        let config = StreamingConfig {
            buffer_size: 64 * 1024,
            read_timeout: Duration::from_secs(5),
            client_disconnect_bytes_threshold: 1,
            client_disconnect_time_threshold: Duration::from_secs(5),
            last_chunk_inline_capacity: 8192,
        };

        let handle = tokio::spawn(async move {
            let config = config;
            pump(upstream, tx, CancellationToken::new(), &config, "e1").await
        });

        // Consume the first chunk, then close the receiver the way axum
        // does on client disconnect, so the second chunk falls entirely
        // in the post-disconnect drain.
        rx.recv().await.unwrap();
        drop(rx);

        let outcome = handle.await.unwrap().unwrap();

        assert!(outcome.client_disconnected);
        assert_eq!(outcome.bytes_delivered, 10_240);
        assert_eq!(outcome.total_bytes, 10_240 + 4_096);
    }

    #[tokio::test]
    async fn pump_aborts_on_upstream_cancellation() {
        let upstream: ByteStream = Box::pin(futures::stream::pending());
        let (tx, _rx) = mpsc::channel(8);
        let upstream_cancel = CancellationToken::new();
        upstream_cancel.cancel();

        let config = StreamingConfig {
            buffer_size: 64 * 1024,
            read_timeout: Duration::from_secs(5),
            client_disconnect_bytes_threshold: 1024,
            client_disconnect_time_threshold: Duration::from_secs(5),
            last_chunk_inline_capacity: 8192,
        };

        let result = pump(upstream, tx, upstream_cancel, &config, "e1").await;
        assert!(matches!(result, Err(DispatchError::Stream { .. })));
    }
}
