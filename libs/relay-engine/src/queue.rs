use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

use relay_api::Record;

/// Returned by `RelayProducer::push` once the consumer is gone.
/// Hands the record back so the caller can decide what to do with it.
#[derive(Debug, thiserror::Error)]
#[error("relay queue closed")]
pub struct QueueClosed(pub Record);

/// Create the in-process hand-off between receiver and writer.
///
/// Unbounded: `push` never waits. Pressure is applied upstream by flow
/// control, which caps how many messages can be in flight at all.
pub fn relay_queue() -> (RelayProducer, RelayConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        RelayProducer { tx, depth: depth.clone() },
        RelayConsumer { rx, depth },
    )
}

/// Sending half. Cheap to clone; the queue closes when every producer is dropped.
#[derive(Debug, Clone)]
pub struct RelayProducer {
    tx: mpsc::UnboundedSender<Record>,
    depth: Arc<AtomicUsize>,
}

impl RelayProducer {
    pub fn push(&self, record: Record) -> Result<(), QueueClosed> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.tx.send(record).map_err(|e| {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            QueueClosed(e.0)
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Records queued and not yet taken by the writer.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

/// Receiving half, owned by the single writer.
#[derive(Debug)]
pub struct RelayConsumer {
    rx: mpsc::UnboundedReceiver<Record>,
    depth: Arc<AtomicUsize>,
}

impl RelayConsumer {
    /// Wait for the next record. `None` once the queue is empty and every
    /// producer has been dropped (or the consumer was closed).
    pub async fn pop(&mut self) -> Option<Record> {
        let record = self.rx.recv().await;
        if record.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        record
    }

    pub fn try_pop(&mut self) -> Option<Record> {
        let record = self.rx.try_recv().ok();
        if record.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        record
    }

    /// Refuse further pushes. Records already queued can still be popped.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
