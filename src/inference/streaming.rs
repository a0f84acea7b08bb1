//! SSE streaming response decoder for the Messages API.
//!
//! Reads a response body as a byte stream, splits it into lines, parses each
//! `data: ` payload as a [`StreamEvent`], and yields the text deltas in order.
//!
//! Framing is deliberately permissive: lines without the data prefix are
//! skipped, payloads that fail to parse are skipped, and a body that ends
//! without a stop event is a clean close. Only a transport error ends the
//! sequence abnormally.

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;

use super::errors::InferenceError;
use super::types::StreamEvent;

/// Prefix of every data-bearing SSE line.
pub const DATA_PREFIX: &str = "data: ";

/// Payload meaning "the server closed the stream".
pub const DONE_SENTINEL: &str = "[DONE]";

/// Longest line the decoder will buffer. A line that grows past this is
/// dropped up to its next newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Fragments buffered between the decode task and the consumer.
const FRAGMENT_CHANNEL_DEPTH: usize = 1;

/// One item of a fragment stream.
pub type FragmentResult = Result<String, InferenceError>;

// ─── Decoder ─────────────────────────────────────────────────────────────────

/// Lifecycle of a single decoded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Reading,
    Done,
    Failed,
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a full line is available, so a multi-byte UTF-8
/// character split across two network chunks still decodes correctly. Once
/// the decoder leaves `Reading`, further input is ignored.
#[derive(Debug)]
pub struct SseDecoder {
    state: DecoderState,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a newline.
    scanned: usize,
    /// Discarding an oversized line until its newline arrives.
    overflowed: bool,
    max_line_bytes: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::with_line_limit(MAX_LINE_BYTES)
    }

    pub fn with_line_limit(max_line_bytes: usize) -> Self {
        Self {
            state: DecoderState::Reading,
            buffer: Vec::new(),
            scanned: 0,
            overflowed: false,
            max_line_bytes,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// `true` once the decoder has reached `Done` or `Failed`.
    pub fn is_finished(&self) -> bool {
        self.state != DecoderState::Reading
    }

    /// Feed a chunk of raw bytes, returning the fragments of every line it
    /// completes. Stops at the first terminating line; the rest is discarded.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut fragments = Vec::new();
        if self.is_finished() {
            return fragments;
        }

        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + offset;
            self.scanned = end + 1;

            if self.overflowed {
                self.overflowed = false;
                start = end + 1;
                continue;
            }

            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            start = end + 1;

            if let Some(fragment) = self.decode_line(&line) {
                fragments.push(fragment);
            }
            if self.is_finished() {
                self.clear_buffer();
                return fragments;
            }
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line_bytes {
            if !self.overflowed {
                tracing::warn!(limit = self.max_line_bytes, "SSE line too long, dropping it");
            }
            self.clear_buffer();
            self.overflowed = true;
        }
        fragments
    }

    fn clear_buffer(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }

    /// Signal end of input. A trailing line without a newline is still
    /// decoded. End of input is a clean close, never an error.
    pub fn finish(&mut self) -> Option<String> {
        if self.is_finished() {
            return None;
        }

        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        let fragment = if rest.is_empty() || self.overflowed {
            None
        } else {
            let line = String::from_utf8_lossy(&rest).into_owned();
            self.decode_line(&line)
        };

        self.state = DecoderState::Done;
        fragment
    }

    /// Mark the stream as failed by the transport.
    pub fn fail(&mut self) {
        self.state = DecoderState::Failed;
        self.clear_buffer();
    }

    /// Decode one complete line (without its `\n`).
    ///
    /// Returns the text delta the line carries, if any. An empty delta is
    /// returned as `Some("")`; appending it is a no-op for the caller.
    pub fn decode_line(&mut self, line: &str) -> Option<String> {
        if self.is_finished() {
            return None;
        }

        let line = line.strip_suffix('\r').unwrap_or(line);
        let payload = line.strip_prefix(DATA_PREFIX)?;

        if payload == DONE_SENTINEL {
            self.state = DecoderState::Done;
            return None;
        }

        let event: StreamEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, payload = %payload, "skipping undecodable SSE payload");
                return None;
            }
        };

        if event.is_error() {
            tracing::warn!(error = ?event.error, "server reported an error inside the stream");
        }

        let fragment = event.text().map(str::to_string);
        if event.is_terminal() {
            self.state = DecoderState::Done;
        }
        fragment
    }
}

// ─── Stream adapters ─────────────────────────────────────────────────────────

/// Decode a byte stream into a lazy stream of text fragments.
///
/// A transport error is yielded once as `Err(StreamError)` and ends the
/// stream; everything else ends it with `None`.
pub fn decode_stream<S, B, E>(byte_stream: S) -> impl Stream<Item = FragmentResult>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let byte_stream = Box::pin(byte_stream);

    stream::unfold(
        (byte_stream, SseDecoder::new(), VecDeque::new()),
        |(mut byte_stream, mut decoder, mut pending)| async move {
            loop {
                if let Some(fragment) = pending.pop_front() {
                    return Some((Ok(fragment), (byte_stream, decoder, pending)));
                }
                if decoder.is_finished() {
                    return None;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => pending.extend(decoder.push_bytes(bytes.as_ref())),
                    Some(Err(e)) => {
                        decoder.fail();
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, decoder, pending),
                        ));
                    }
                    None => pending.extend(decoder.finish()),
                }
            }
        },
    )
}

/// Run [`decode_stream`] on its own task and hand fragments over a depth-1
/// channel.
///
/// The task stops as soon as the returned [`TextStream`] is dropped, which
/// drops the byte stream and releases the connection.
pub fn spawn_decoder<S, B, E>(byte_stream: S) -> TextStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, text_stream) = TextStream::channel();

    tokio::spawn(async move {
        let fragments = decode_stream(byte_stream);
        futures::pin_mut!(fragments);
        while let Some(item) = fragments.next().await {
            if tx.send(item).await.is_err() {
                tracing::debug!("fragment consumer dropped, closing stream");
                return;
            }
        }
    });

    text_stream
}

// ─── TextStream ──────────────────────────────────────────────────────────────

/// Single-pass, forward-only stream of reply text fragments.
///
/// Not restartable: once it has yielded `None` it keeps yielding `None`.
#[derive(Debug)]
pub struct TextStream {
    rx: mpsc::Receiver<FragmentResult>,
}

impl TextStream {
    /// Create a stream plus the sender a producer pushes fragments into.
    /// Dropping the sender ends the stream normally.
    pub fn channel() -> (mpsc::Sender<FragmentResult>, TextStream) {
        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_DEPTH);
        (tx, TextStream { rx })
    }
}

impl Stream for TextStream {
    type Item = FragmentResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_line(text: &str) -> String {
        format!(
            "data: {}",
            serde_json::json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": text}
            })
        )
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> {
        let items: Vec<_> = parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(items)
    }

    async fn collect_ok<S: Stream<Item = FragmentResult>>(s: S) -> Vec<String> {
        s.map(|r| r.expect("unexpected stream error")).collect().await
    }

    #[test]
    fn test_non_data_lines_are_ignored() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode_line("").is_none());
        assert!(decoder.decode_line("event: content_block_delta").is_none());
        assert!(decoder.decode_line(": keep-alive").is_none());
        assert!(decoder.decode_line("data:{\"type\":\"ping\"}").is_none());
        assert_eq!(decoder.state(), DecoderState::Reading);
    }

    #[test]
    fn test_text_delta_is_emitted() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.decode_line(&delta_line("Hel")).as_deref(), Some("Hel"));
        assert_eq!(decoder.state(), DecoderState::Reading);
    }

    #[test]
    fn test_empty_delta_is_forwarded() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.decode_line(&delta_line("")).as_deref(), Some(""));
    }

    #[test]
    fn test_done_sentinel_ends_stream() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode_line("data: [DONE]").is_none());
        assert_eq!(decoder.state(), DecoderState::Done);
        assert!(decoder.decode_line(&delta_line("late")).is_none());
    }

    #[test]
    fn test_message_stop_ends_stream() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode_line(r#"data: {"type":"message_stop"}"#).is_none());
        assert_eq!(decoder.state(), DecoderState::Done);
    }

    #[test]
    fn test_message_stop_with_text_emits_then_ends() {
        let mut decoder = SseDecoder::new();
        let line = r#"data: {"type":"message_stop","delta":{"text":"bye"}}"#;
        assert_eq!(decoder.decode_line(line).as_deref(), Some("bye"));
        assert_eq!(decoder.state(), DecoderState::Done);
    }

    #[test]
    fn test_malformed_payload_is_skipped() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode_line("data: {not json").is_none());
        assert!(decoder.decode_line(r#"data: {"delta":{"text":"no type"}}"#).is_none());
        assert_eq!(decoder.state(), DecoderState::Reading);
        assert_eq!(decoder.decode_line(&delta_line("ok")).as_deref(), Some("ok"));
    }

    #[test]
    fn test_error_event_does_not_abort() {
        let mut decoder = SseDecoder::new();
        let line = r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert!(decoder.decode_line(line).is_none());
        assert_eq!(decoder.state(), DecoderState::Reading);
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut decoder = SseDecoder::new();
        let input = format!("{}\r\n\r\ndata: [DONE]\r\n", delta_line("Hi"));
        assert_eq!(decoder.push_bytes(input.as_bytes()), vec!["Hi".to_string()]);
        assert_eq!(decoder.state(), DecoderState::Done);
    }

    #[test]
    fn test_push_bytes_across_chunk_boundaries() {
        let mut decoder = SseDecoder::new();
        let line = format!("{}\n", delta_line("café"));
        let bytes = line.as_bytes();
        // Split inside the two-byte 'é'.
        let split = line.find('é').unwrap() + 1;

        assert!(decoder.push_bytes(&bytes[..split]).is_empty());
        assert_eq!(decoder.push_bytes(&bytes[split..]), vec!["café".to_string()]);
    }

    #[test]
    fn test_sentinel_discards_following_lines_in_same_chunk() {
        let mut decoder = SseDecoder::new();
        let input = format!("{}\ndata: [DONE]\n{}\n", delta_line("a"), delta_line("b"));
        assert_eq!(decoder.push_bytes(input.as_bytes()), vec!["a".to_string()]);
        assert!(decoder.push_bytes(delta_line("c").as_bytes()).is_empty());
    }

    #[test]
    fn test_finish_decodes_trailing_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push_bytes(delta_line("tail").as_bytes()).is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
        assert_eq!(decoder.state(), DecoderState::Done);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_long_line_fed_one_byte_at_a_time() {
        let mut decoder = SseDecoder::new();
        let text = "x".repeat(4096);
        let input = format!("{}\n{}\n", delta_line(&text), delta_line("next"));
        let bytes = input.as_bytes();

        let mut fragments = Vec::new();
        for byte in bytes {
            fragments.extend(decoder.push_bytes(std::slice::from_ref(byte)));
        }
        assert_eq!(fragments, vec![text, "next".to_string()]);
        assert!(decoder.buffer.is_empty());
        assert_eq!(decoder.scanned, 0);
    }

    #[test]
    fn test_oversized_line_is_dropped_up_to_newline() {
        let mut decoder = SseDecoder::with_line_limit(128);
        let oversized = format!("data: {}", "x".repeat(300));

        for piece in oversized.as_bytes().chunks(50) {
            assert!(decoder.push_bytes(piece).is_empty());
            assert!(decoder.buffer.len() <= 128);
        }

        let rest = format!("tail of the long line\n{}\n", delta_line("ok"));
        assert_eq!(decoder.push_bytes(rest.as_bytes()), vec!["ok".to_string()]);
        assert_eq!(decoder.state(), DecoderState::Reading);
    }

    #[test]
    fn test_oversized_trailing_line_is_not_decoded_at_finish() {
        let mut decoder = SseDecoder::with_line_limit(32);
        assert!(decoder.push_bytes(delta_line("too long to keep").as_bytes()).is_empty());
        assert!(decoder.finish().is_none());
        assert_eq!(decoder.state(), DecoderState::Done);
    }

    #[tokio::test]
    async fn test_decode_stream_concatenates_fragments() {
        let body = format!(
            "event: message_start\n\
             data: {{\"type\":\"message_start\",\"message\":{{\"id\":\"msg_1\"}}}}\n\n\
             {}\n\n{}\n\n\
             data: {{\"type\":\"message_stop\"}}\n\n",
            delta_line("Hel"),
            delta_line("lo!")
        );
        let (head, tail) = body.split_at(body.len() / 2);
        let fragments = collect_ok(decode_stream(chunks(&[head, tail]))).await;
        assert_eq!(fragments, vec!["Hel", "lo!"]);
        assert_eq!(fragments.concat(), "Hello!");
    }

    #[tokio::test]
    async fn test_decode_stream_clean_close_without_stop() {
        let body = format!("{}\n", delta_line("partial"));
        let fragments = collect_ok(decode_stream(chunks(&[&body]))).await;
        assert_eq!(fragments, vec!["partial"]);
    }

    #[tokio::test]
    async fn test_decode_stream_propagates_transport_error() {
        let items: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(format!("{}\n", delta_line("one")).into_bytes()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer")),
            Ok(format!("{}\n", delta_line("never")).into_bytes()),
        ];
        let results: Vec<FragmentResult> = decode_stream(stream::iter(items)).collect().await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_deref().unwrap(), "one");
        match &results[1] {
            Err(InferenceError::StreamError { reason }) => assert!(reason.contains("reset by peer")),
            other => panic!("expected stream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_decoder_delivers_in_order() {
        let body = format!(
            "{}\n{}\n{}\ndata: [DONE]\n{}\n",
            delta_line("a"),
            delta_line(""),
            delta_line("b"),
            delta_line("ignored")
        );
        let mut text = spawn_decoder(chunks(&[&body]));

        let mut got = Vec::new();
        while let Some(item) = text.next().await {
            got.push(item.unwrap());
        }
        assert_eq!(got, vec!["a", "", "b"]);

        // Single-pass: exhausted streams stay exhausted.
        assert!(text.next().await.is_none());
    }

    #[tokio::test]
    async fn test_text_stream_channel_closes_on_sender_drop() {
        let (tx, mut text) = TextStream::channel();
        tokio::spawn(async move {
            tx.send(Ok("x".to_string())).await.unwrap();
        });
        assert_eq!(text.next().await.unwrap().unwrap(), "x");
        assert!(text.next().await.is_none());
    }
}
