//! Panic-containment shim for provider stream producers (§4.5, §9).
//!
//! Every provider's `stream()` implementation runs its SSE-reading producer
//! as a dedicated task, forwarding chunks through this module's channel.
//! Whatever happens inside the producer — happy path, cancellation, or a
//! panic while decoding a malformed payload — the channel is guaranteed to
//! close, and a panic additionally gets one best-effort final `done=true`
//! chunk so the consumer's loop terminates cleanly instead of hanging on a
//! receiver that silently stopped yielding.
//!
//! This is the one place in the crate where a panic is allowed to cross a
//! task boundary without taking the process down with it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;

use crate::error::LlmError;
use crate::metrics::LlmMetricsSink;
use crate::types::LlmChunk;

/// Per spec §5: "Chunk channels from providers are unbuffered — the
/// consumer paces the producer". A bounded channel of depth 0 in tokio
/// still allows one in-flight permit; depth 1 is the closest practical
/// analogue without the producer ever getting more than one chunk ahead.
pub const CHUNK_CHANNEL_DEPTH: usize = 1;

pub type ChunkSender = mpsc::Sender<Result<LlmChunk, LlmError>>;
pub type ChunkReceiver = mpsc::Receiver<Result<LlmChunk, LlmError>>;

/// Spawns `produce` (which owns `tx` and sends chunks through it) as a
/// guarded tokio task. Returns immediately with the paired receiver.
pub fn spawn_guarded<F>(
    provider: &'static str,
    metrics: Arc<dyn LlmMetricsSink>,
    produce: F,
) -> ChunkReceiver
where
    F: FnOnce(ChunkSender) -> Box<dyn Future<Output = ()> + Send> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_DEPTH);
    let guard_tx = tx.clone();
    tokio::spawn(async move {
        let fut = Box::into_pin(produce(tx));
        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            tracing::error!(provider, "provider stream producer panicked");
            metrics.record_provider_error(provider);
            let _ = guard_tx.try_send(Ok(LlmChunk::done()));
        }
        // `tx` (and `guard_tx`) drop here regardless of path, closing the
        // channel and unblocking the consumer's next recv().
    });
    rx
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio_stream::wrappers::ReceiverStream;
    use futures::StreamExt;

    use super::*;

    #[derive(Default)]
    struct CountingSink {
        errors: AtomicU32,
    }

    impl LlmMetricsSink for CountingSink {
        fn record_provider_error(&self, _provider: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn record_request(&self, _provider: &str) {}
    }

    #[tokio::test]
    async fn happy_path_forwards_chunks_and_closes() {
        let sink = Arc::new(CountingSink::default());
        let rx = spawn_guarded("test", sink.clone(), |tx| {
            Box::new(async move {
                let _ = tx.send(Ok(LlmChunk::delta("hi"))).await;
                let _ = tx.send(Ok(LlmChunk::done())).await;
            })
        });

        let chunks: Vec<_> = ReceiverStream::new(rx).collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].as_ref().unwrap().done);
        assert_eq!(sink.errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panic_yields_final_done_chunk_and_increments_metric() {
        let sink = Arc::new(CountingSink::default());
        let rx = spawn_guarded("test", sink.clone(), |tx| {
            Box::new(async move {
                let _ = tx.send(Ok(LlmChunk::delta("partial"))).await;
                panic!("malformed payload");
            })
        });

        let chunks: Vec<_> = ReceiverStream::new(rx).collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.last().unwrap().as_ref().unwrap().done);
        assert_eq!(sink.errors.load(Ordering::SeqCst), 1);
    }
}
