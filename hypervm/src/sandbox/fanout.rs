//! Response stream broadcaster.
//!
//! One dispatcher task reads the sandbox response stream and clones every
//! item into each live subscriber's bounded buffer. A subscriber that stops
//! draining falls behind, overflows its buffer, and is detached; the source
//! is never blocked by a slow consumer.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::sandbox::response::VmResponse;

/// Default per-subscriber buffer depth.
pub const SUBSCRIBER_BUFFER: usize = 128;

struct Entry {
    id: u64,
    tx: mpsc::Sender<VmResponse>,
}

struct FanoutInner {
    subscribers: Vec<Entry>,
    next_id: u64,
    capacity: usize,
    closed: bool,
}

/// Handle for acquiring and releasing response subscribers.
#[derive(Clone)]
pub struct Fanout {
    inner: Arc<Mutex<FanoutInner>>,
}

/// One subscription to the response stream. Sees every response emitted
/// after it was acquired, until released, detached for lagging, or the
/// stream closes.
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<VmResponse>,
}

impl Subscriber {
    pub async fn recv(&mut self) -> Option<VmResponse> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<VmResponse> {
        self.rx.try_recv().ok()
    }
}

impl Fanout {
    /// Start the dispatcher over `source` with per-subscriber buffers of
    /// `capacity`.
    pub fn start(mut source: mpsc::Receiver<VmResponse>, capacity: usize) -> Self {
        let inner = Arc::new(Mutex::new(FanoutInner {
            subscribers: Vec::new(),
            next_id: 0,
            capacity,
            closed: false,
        }));

        let dispatcher = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(response) = source.recv().await {
                let mut guard = dispatcher.lock();
                guard.subscribers.retain(|entry| {
                    match entry.tx.try_send(response.clone()) {
                        Ok(()) => true,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::warn!(subscriber = entry.id, "detaching lagging subscriber");
                            false
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    }
                });
            }
            // Source closed: drop all senders so subscribers see the end.
            let mut guard = dispatcher.lock();
            guard.closed = true;
            guard.subscribers.clear();
        });

        Self { inner }
    }

    /// Subscribe to responses emitted from now on. Subscribing to a closed
    /// fanout yields a subscriber that immediately reports end-of-stream.
    pub fn acquire(&self) -> Subscriber {
        let mut guard = self.inner.lock();
        let (tx, rx) = mpsc::channel(guard.capacity.max(1));
        let id = guard.next_id;
        guard.next_id += 1;
        if !guard.closed {
            guard.subscribers.push(Entry { id, tx });
        }
        Subscriber { id, rx }
    }

    pub fn release(&self, subscriber: Subscriber) {
        let mut guard = self.inner.lock();
        guard.subscribers.retain(|entry| entry.id != subscriber.id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::response::{Reporter, ResponseCode};

    fn response_source() -> (Reporter, mpsc::Receiver<VmResponse>) {
        let (tx, rx) = mpsc::channel(256);
        (Reporter::new("vm-test".into(), tx), rx)
    }

    #[tokio::test]
    async fn test_subscriber_sees_items_emitted_after_acquire() {
        let (mut reporter, rx) = response_source();
        let fanout = Fanout::start(rx, SUBSCRIBER_BUFFER);

        // Emitted before subscription: dropped.
        reporter.vm_running();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut sub = fanout.acquire();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        reporter.pod_running();

        let got = sub.recv().await.unwrap();
        assert_eq!(got.code, ResponseCode::PodRunning);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lagging_subscriber_is_detached_reader_sees_all() {
        let (tx, rx) = mpsc::channel(16);
        let fanout = Fanout::start(rx, 64);

        let _lagging = fanout.acquire();
        let mut reading = fanout.acquire();

        const TOTAL: u64 = 10_000;
        let reader = tokio::spawn(async move {
            let mut seen = 0u64;
            let mut last_generation = 0u64;
            while let Some(response) = reading.recv().await {
                assert!(response.generation > last_generation, "out of order");
                last_generation = response.generation;
                seen += 1;
                if seen == TOTAL {
                    break;
                }
            }
            seen
        });

        for i in 0..TOTAL {
            // Blocking send: the dispatcher provides backpressure for the
            // source, never for subscribers.
            tx.send(VmResponse {
                vm_id: "vm-test".into(),
                code: ResponseCode::Ok,
                cause: format!("item {}", i),
                data: None,
                generation: i + 1,
            })
            .await
            .unwrap();
            // Let the dispatcher and the reader keep pace.
            tokio::task::yield_now().await;
        }

        assert_eq!(reader.await.unwrap(), TOTAL);
        // The never-reading subscriber overflowed its bounded buffer and
        // was dropped along the way.
        assert_eq!(fanout.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_release_stops_delivery() {
        let (mut reporter, rx) = response_source();
        let fanout = Fanout::start(rx, SUBSCRIBER_BUFFER);

        let sub = fanout.acquire();
        assert_eq!(fanout.subscriber_count(), 1);
        fanout.release(sub);
        assert_eq!(fanout.subscriber_count(), 0);

        reporter.success("nobody listening");
    }

    #[tokio::test]
    async fn test_source_close_ends_subscribers() {
        let (reporter, rx) = response_source();
        let fanout = Fanout::start(rx, SUBSCRIBER_BUFFER);
        let mut sub = fanout.acquire();

        drop(reporter);
        assert!(sub.recv().await.is_none());
    }
}
