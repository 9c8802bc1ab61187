//! In-flight structural operations.
//!
//! Every device mutation parks its caller's result sink here until the
//! terminal event (`*Inserted`, `*Ejected`, `DevSkip`, or a failure)
//! arrives. One operation per `(kind, id)` at a time; a second attempt on
//! the same key is rejected `Busy` without touching the first.

use std::collections::HashMap;

use hypervm_shared::{VmError, VmResult};

use crate::devices::ResourceKind;
use crate::sandbox::events::{OpOutcome, ResultSink};

/// Direction of a pending structural change, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpDirection {
    Insert,
    Eject,
}

struct PendingOp {
    direction: OpDirection,
    sink: Option<ResultSink<OpOutcome>>,
}

/// Table of in-flight operations keyed by `(kind, id)`.
#[derive(Default)]
pub struct PendingOps {
    ops: HashMap<(ResourceKind, String), PendingOp>,
}

impl PendingOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new operation. Fails `Busy` when one is already in flight
    /// for the same resource.
    pub fn insert(
        &mut self,
        kind: ResourceKind,
        id: &str,
        direction: OpDirection,
        sink: Option<ResultSink<OpOutcome>>,
    ) -> VmResult<()> {
        let key = (kind, id.to_string());
        if let Some(existing) = self.ops.get(&key) {
            return Err(VmError::Busy(format!(
                "{} {} already has a {:?} in flight",
                kind, id, existing.direction
            )));
        }
        self.ops.insert(key, PendingOp { direction, sink });
        Ok(())
    }

    pub fn contains(&self, kind: ResourceKind, id: &str) -> bool {
        self.ops.contains_key(&(kind, id.to_string()))
    }

    /// Pop the operation and resolve its sink. Unknown keys are ignored:
    /// a completion may race a caller that already gave up.
    pub fn complete(&mut self, kind: ResourceKind, id: &str, result: VmResult<OpOutcome>) {
        if let Some(op) = self.ops.remove(&(kind, id.to_string()))
            && let Some(sink) = op.sink
        {
            // The caller may have dropped its receiver; that is not an
            // error for the loop.
            let _ = sink.send(result);
        }
    }

    /// Resolve every outstanding operation with `Interrupted`.
    pub fn interrupt_all(&mut self, reason: &str) {
        for ((kind, id), op) in self.ops.drain() {
            tracing::debug!(%kind, %id, "interrupting pending op");
            if let Some(sink) = op.sink {
                let _ = sink.send(Err(VmError::Interrupted(reason.to_string())));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_second_op_on_same_key_is_busy() {
        let mut pending = PendingOps::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();

        pending
            .insert(ResourceKind::Interface, "net0", OpDirection::Insert, Some(tx1))
            .unwrap();
        let err = pending
            .insert(ResourceKind::Interface, "net0", OpDirection::Eject, Some(tx2))
            .unwrap_err();
        assert!(matches!(err, VmError::Busy(_)));

        // The rejected sink was returned to the caller untouched.
        assert!(rx2.try_recv().is_err());

        // A different id is independent.
        pending
            .insert(ResourceKind::Interface, "net1", OpDirection::Insert, None)
            .unwrap();
    }

    #[tokio::test]
    async fn test_complete_resolves_sink() {
        let mut pending = PendingOps::new();
        let (tx, rx) = oneshot::channel();
        pending
            .insert(ResourceKind::Block, "v1", OpDirection::Insert, Some(tx))
            .unwrap();

        pending.complete(ResourceKind::Block, "v1", Ok(OpOutcome::Done));
        assert_eq!(rx.await.unwrap().unwrap(), OpOutcome::Done);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_complete_tolerates_dropped_receiver() {
        let mut pending = PendingOps::new();
        let (tx, rx) = oneshot::channel();
        pending
            .insert(ResourceKind::Volume, "v1", OpDirection::Eject, Some(tx))
            .unwrap();
        drop(rx);
        // Must not panic or block.
        pending.complete(ResourceKind::Volume, "v1", Ok(OpOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_interrupt_all() {
        let mut pending = PendingOps::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending
            .insert(ResourceKind::Interface, "net0", OpDirection::Insert, Some(tx1))
            .unwrap();
        pending
            .insert(ResourceKind::Container, "c1", OpDirection::Insert, Some(tx2))
            .unwrap();

        pending.interrupt_all("sandbox shutting down");
        assert!(matches!(rx1.await.unwrap(), Err(VmError::Interrupted(_))));
        assert!(matches!(rx2.await.unwrap(), Err(VmError::Interrupted(_))));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unknown_completion_is_ignored() {
        let mut pending = PendingOps::new();
        pending.complete(ResourceKind::Serial, "ghost", Ok(OpOutcome::Done));
    }
}
