//! Request logging: one record per completed request, queued off the
//! request path. Sink failures never reach the caller.

use time::OffsetDateTime;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct RequestLogEntry {
    pub at: OffsetDateTime,
    pub source_api: String,
    pub target_api: String,
    pub source_model: String,
    pub target_model: String,
    pub provider: String,
    pub request_body: String,
    /// Serialized response, `{"stream":true}` for streams, `None` on error.
    pub response_body: Option<String>,
    pub status_code: u16,
    pub error_message: Option<String>,
    pub processing_seconds: f64,
}

pub trait RequestLogSink: Send + Sync {
    /// Fire-and-forget append.
    fn append(&self, entry: RequestLogEntry);
}

pub struct NoopLogSink;

impl RequestLogSink for NoopLogSink {
    fn append(&self, _entry: RequestLogEntry) {}
}

/// Bounded queue feeding a writer task (see the storage crate). A full
/// queue drops the entry and says so.
pub struct QueueLogSink {
    tx: mpsc::Sender<RequestLogEntry>,
}

impl QueueLogSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RequestLogEntry>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl RequestLogSink for QueueLogSink {
    fn append(&self, entry: RequestLogEntry) {
        if let Err(err) = self.tx.try_send(entry) {
            tracing::warn!(%err, "request log entry dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: u16) -> RequestLogEntry {
        RequestLogEntry {
            at: OffsetDateTime::now_utc(),
            source_api: "/v1/chat/completions".to_string(),
            target_api: "/openai/chat/completions".to_string(),
            source_model: "gpt-4".to_string(),
            target_model: "gpt-4-0613".to_string(),
            provider: "openai".to_string(),
            request_body: "{}".to_string(),
            response_body: None,
            status_code: status,
            error_message: None,
            processing_seconds: 0.1,
        }
    }

    #[tokio::test]
    async fn queue_delivers_in_order() {
        let (sink, mut rx) = QueueLogSink::new(4);
        sink.append(entry(200));
        sink.append(entry(429));
        assert_eq!(rx.recv().await.unwrap().status_code, 200);
        assert_eq!(rx.recv().await.unwrap().status_code, 429);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (sink, mut rx) = QueueLogSink::new(1);
        sink.append(entry(200));
        sink.append(entry(500));
        assert_eq!(rx.recv().await.unwrap().status_code, 200);
        assert!(rx.try_recv().is_err());
    }
}
