//! Pending-request registry: the rendezvous between a requester and the
//! session reader.
//!
//! Each in-flight request owns a one-shot completion slot indexed by its
//! packet id. The reader settles slots as responses arrive; disconnects
//! settle everything left with the loss reason. Settlement is sticky: a
//! response delivered before the requester first polls its slot is not
//! lost.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ZonisError;
use crate::packet::packet_id;

/// How a pending slot resolves.
pub type Outcome = Result<Value, ZonisError>;

/// Correlation map from packet id to completion slot.
///
/// Cheap to clone; all clones share one map. Mutated by requesters (open,
/// cancel-on-drop) and by the reader (settle), never held across an await.
#[derive(Clone, Default)]
pub struct PendingRegistry {
    slots: Arc<Mutex<HashMap<String, oneshot::Sender<Outcome>>>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh packet id and install its completion slot.
    pub fn open(&self) -> PendingRequest {
        let id = packet_id();
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id.clone(), tx);
        PendingRequest {
            registry: self.clone(),
            id,
            rx,
        }
    }

    /// Fulfill the slot for `id`, at most once.
    ///
    /// An unknown id is a silent no-op: it may be a concurrently cancelled
    /// slot or a stale reply from the peer.
    pub fn settle(&self, id: &str, outcome: Outcome) {
        match self.slots.lock().remove(id) {
            Some(slot) => {
                // The requester may have given up; a dead receiver is fine.
                let _ = slot.send(outcome);
            }
            None => debug!(packet_id = id, "dropping response for unknown packet"),
        }
    }

    /// Settle every outstanding slot with `reason`. Used on disconnect.
    pub fn cancel_all(&self, reason: ZonisError) {
        let drained: Vec<_> = {
            let mut slots = self.slots.lock();
            slots.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), reason = %reason, "cancelling outstanding requests");
        }
        for (_, slot) in drained {
            let _ = slot.send(Err(reason.clone()));
        }
    }

    fn discard(&self, id: &str) {
        self.slots.lock().remove(id);
    }

    /// Number of outstanding slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One in-flight request: the id on the wire plus the slot to await.
///
/// Dropping a `PendingRequest` before settlement removes its slot from the
/// registry, so an abandoned caller cannot leak entries; a late response
/// for the id is then silently discarded.
pub struct PendingRequest {
    registry: PendingRegistry,
    id: String,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingRequest {
    /// The correlation id to place on the outbound frame.
    pub fn packet_id(&self) -> &str {
        &self.id
    }

    /// Await settlement.
    ///
    /// A registry torn down without settling (both halves dropped) reads
    /// as transport loss.
    pub async fn wait(mut self) -> Outcome {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ZonisError::TransportClosed),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.registry.discard(&self.id);
    }
}
