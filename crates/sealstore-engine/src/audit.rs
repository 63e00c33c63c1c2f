//! Audit and metrics notification sinks
//!
//! The engine emits one-way notifications for chunk traffic and
//! authentication failures. Sinks are infallible by signature and must not
//! block: a sink that talks to an external system is expected to buffer or
//! drop internally. A failing audit path never fails the underlying I/O.

/// One-way notification sink for engine events
pub trait AuditSink: Send + Sync {
    /// A chunk was encrypted and appended (`bytes` = plaintext bytes)
    fn on_chunk_written(&self, blob_id: &str, index: u64, bytes: usize);

    /// A chunk was decrypted and emitted (`bytes` = plaintext bytes emitted)
    fn on_chunk_read(&self, blob_id: &str, index: u64, bytes: usize);

    /// Tag verification failed with every candidate key
    fn on_auth_failure(&self, blob_id: &str, index: u64);
}

/// Sink that discards all events
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn on_chunk_written(&self, _blob_id: &str, _index: u64, _bytes: usize) {}
    fn on_chunk_read(&self, _blob_id: &str, _index: u64, _bytes: usize) {}
    fn on_auth_failure(&self, _blob_id: &str, _index: u64) {}
}

/// Sink that emits structured tracing events
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn on_chunk_written(&self, blob_id: &str, index: u64, bytes: usize) {
        tracing::debug!(blob_id, index, bytes, "chunk written");
    }

    fn on_chunk_read(&self, blob_id: &str, index: u64, bytes: usize) {
        tracing::debug!(blob_id, index, bytes, "chunk read");
    }

    fn on_auth_failure(&self, blob_id: &str, index: u64) {
        tracing::warn!(blob_id, index, "chunk authentication failure");
    }
}
