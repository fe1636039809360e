use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

// Boxed form of `reqwest::Response::bytes_stream`, the only body shape the
// dispatchers pass around.
pub type UpstreamByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

// Decoder for the upstream `alt=sse` byte stream: reassembles lines across
// chunk boundaries and yields each `data:` payload as parsed JSON. Event
// names and comment heartbeats are dropped; only payloads matter here.
pub struct SseLineStream<S> {
    inner: S,
    buffer: String,
    pending: Vec<Value>,
    done: bool,
}

#[derive(Debug)]
pub enum SseError {
    Transport(String),
}

impl<S> SseLineStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: String::new(),
            pending: Vec::new(),
            done: false,
        }
    }

    fn drain_buffer(&mut self) {
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end();
            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim_start();
                if payload.is_empty() || payload == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<Value>(payload) {
                    Ok(value) => self.pending.push(value),
                    Err(e) => debug!("skipping unparseable SSE payload: {}", e),
                }
            }
        }
    }

    // Next data payload, None at end of stream.
    pub async fn next_payload(&mut self) -> Option<Result<Value, SseError>> {
        loop {
            if !self.pending.is_empty() {
                return Some(Ok(self.pending.remove(0)));
            }
            if self.done {
                return None;
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                    self.drain_buffer();
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(SseError::Transport(e.to_string())));
                }
                None => {
                    self.done = true;
                    // Flush a final unterminated line, if any
                    if !self.buffer.is_empty() {
                        self.buffer.push('\n');
                        self.drain_buffer();
                    }
                }
            }
        }
    }
}

// Outcome of waiting for the first payload of a fresh stream. `Empty` covers
// both a stream that closed without data and one that never produced any
// within the timeout; the dispatcher treats both as an empty response.
pub enum FirstPayload {
    Payload(Value),
    Empty,
    Transport(String),
}

pub async fn peek_first_payload<S>(
    stream: &mut SseLineStream<S>,
    timeout: Duration,
) -> FirstPayload
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    match tokio::time::timeout(timeout, stream.next_payload()).await {
        Ok(Some(Ok(payload))) => FirstPayload::Payload(payload),
        Ok(Some(Err(SseError::Transport(e)))) => FirstPayload::Transport(e),
        Ok(None) => FirstPayload::Empty,
        Err(_) => {
            debug!("timed out waiting for first SSE payload");
            FirstPayload::Empty
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Unpin {
        Box::pin(futures::stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from(c))),
        ))
    }

    #[tokio::test]
    async fn payloads_split_across_chunks_are_reassembled() {
        let stream = byte_stream(vec![
            "data: {\"a\"",
            ": 1}\n\ndata: {\"b\": 2}\n\n",
        ]);
        let mut sse = SseLineStream::new(stream);

        let first = sse.next_payload().await.unwrap().unwrap();
        assert_eq!(first["a"], 1);
        let second = sse.next_payload().await.unwrap().unwrap();
        assert_eq!(second["b"], 2);
        assert!(sse.next_payload().await.is_none());
    }

    #[tokio::test]
    async fn comments_and_done_markers_are_skipped() {
        let stream = byte_stream(vec![": heartbeat\n", "data: [DONE]\n", "data: {\"x\": 3}\n"]);
        let mut sse = SseLineStream::new(stream);

        let payload = sse.next_payload().await.unwrap().unwrap();
        assert_eq!(payload["x"], 3);
        assert!(sse.next_payload().await.is_none());
    }

    #[tokio::test]
    async fn unterminated_trailing_line_is_flushed_at_eof() {
        let stream = byte_stream(vec!["data: {\"tail\": true}"]);
        let mut sse = SseLineStream::new(stream);

        let payload = sse.next_payload().await.unwrap().unwrap();
        assert_eq!(payload["tail"], true);
    }

    #[tokio::test]
    async fn peek_reports_empty_stream() {
        let stream = byte_stream(vec![]);
        let mut sse = SseLineStream::new(stream);
        match peek_first_payload(&mut sse, Duration::from_millis(100)).await {
            FirstPayload::Empty => {}
            _ => panic!("expected empty"),
        }
    }

    #[tokio::test]
    async fn peek_returns_first_payload() {
        let stream = byte_stream(vec!["data: {\"ok\": 1}\n"]);
        let mut sse = SseLineStream::new(stream);
        match peek_first_payload(&mut sse, Duration::from_millis(100)).await {
            FirstPayload::Payload(v) => assert_eq!(v["ok"], 1),
            _ => panic!("expected payload"),
        }
    }
}
