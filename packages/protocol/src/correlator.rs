//! Request/Response Correlator
//!
//! Pairs requests issued on a connection with the replies that echo their
//! id. A caller registers a [`Slot`] before sending, then waits on it while
//! the connection's read loop keeps delivering unrelated traffic and calls
//! [`Correlator::resolve`] for every reply.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::error::CorrelationError;

type Reply = Result<Envelope, CorrelationError>;

/// Per-connection table of outstanding requests.
#[derive(Default)]
pub struct Correlator {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Entry>,
    next_generation: u64,
    closed: bool,
}

struct Entry {
    generation: u64,
    tx: oneshot::Sender<Reply>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a reply slot for `id`.
    ///
    /// Fails with `Disconnected` once the correlator has been failed, so a
    /// caller racing a disconnect never waits out its full timeout.
    pub fn register(self: &Arc<Self>, id: &str) -> Result<Slot, CorrelationError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CorrelationError::Disconnected);
        }
        if inner.slots.contains_key(id) {
            return Err(CorrelationError::DuplicateId(id.to_string()));
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        let (tx, rx) = oneshot::channel();
        inner.slots.insert(id.to_string(), Entry { generation, tx });

        Ok(Slot {
            id: id.to_string(),
            generation,
            rx,
            owner: Arc::clone(self),
        })
    }

    /// Deliver a reply to the slot registered under its id.
    ///
    /// Returns `false` when no caller is waiting (late arrival after a
    /// timeout, a duplicate reply, or an id nobody issued); the envelope is
    /// dropped rather than handed to anyone else.
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let entry = self.inner.lock().slots.remove(&envelope.id);
        match entry {
            Some(entry) => {
                let id = envelope.id.clone();
                if entry.tx.send(Ok(envelope)).is_err() {
                    debug!(request_id = %id, "Waiter gone before reply was delivered");
                    return false;
                }
                true
            }
            None => {
                warn!(
                    request_id = %envelope.id,
                    message_type = %envelope.kind,
                    "No waiting request for reply, dropping"
                );
                false
            }
        }
    }

    /// Wake every waiter with `error` and refuse new registrations.
    pub fn fail_all(&self, error: CorrelationError) {
        let drained: Vec<Entry> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.slots.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), %error, "Failing outstanding requests");
        }
        for entry in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
    }

    /// Number of outstanding slots.
    pub fn pending(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn release(&self, id: &str, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.slots.get(id).is_some_and(|e| e.generation == generation) {
            inner.slots.remove(id);
        }
    }
}

/// A registered reply slot. Dropping it deregisters the id.
pub struct Slot {
    id: String,
    generation: u64,
    rx: oneshot::Receiver<Reply>,
    owner: Arc<Correlator>,
}

impl Slot {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the reply, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Envelope, CorrelationError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(CorrelationError::Disconnected),
            Err(_) => Err(CorrelationError::Timeout),
        }
    }

    /// Non-blocking check; `None` while the reply is still outstanding.
    pub fn try_take(&mut self) -> Option<Result<Envelope, CorrelationError>> {
        match self.rx.try_recv() {
            Ok(reply) => Some(reply),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(CorrelationError::Disconnected)),
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.owner.release(&self.id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use crate::payloads::{CommandResult, PongPayload};

    fn reply(id: &str, stdout: &str) -> Envelope {
        Envelope::new(Payload::CommandResult(CommandResult {
            stdout: stdout.to_string(),
            ..Default::default()
        }))
        .unwrap()
        .with_id(id)
    }

    #[tokio::test]
    async fn test_resolve_delivers_to_matching_slot() {
        let correlator = Correlator::new();
        let a = correlator.register("a").unwrap();
        let b = correlator.register("b").unwrap();

        assert!(correlator.resolve(reply("b", "for b")));
        assert!(correlator.resolve(reply("a", "for a")));

        let got_a = a.wait(Duration::from_secs(1)).await.unwrap();
        let got_b = b.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got_a.data["stdout"], "for a");
        assert_eq!(got_b.data["stdout"], "for b");
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_second_reply_is_dropped() {
        let correlator = Correlator::new();
        let slot = correlator.register("x").unwrap();

        assert!(correlator.resolve(reply("x", "first")));
        assert!(!correlator.resolve(reply("x", "second")));

        let got = slot.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.data["stdout"], "first");
    }

    #[tokio::test]
    async fn test_timeout_deregisters_slot() {
        let correlator = Correlator::new();
        let slot = correlator.register("slow").unwrap();

        let err = slot.wait(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, CorrelationError::Timeout);
        assert_eq!(correlator.pending(), 0);

        // Late arrival finds nobody.
        assert!(!correlator.resolve(reply("slow", "late")));
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters() {
        let correlator = Correlator::new();
        let slot = correlator.register("w").unwrap();

        let waiter = tokio::spawn(slot.wait(Duration::from_secs(30)));
        correlator.fail_all(CorrelationError::Disconnected);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), CorrelationError::Disconnected);
        assert!(matches!(
            correlator.register("later"),
            Err(CorrelationError::Disconnected)
        ));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let correlator = Correlator::new();
        let _slot = correlator.register("dup").unwrap();
        assert_eq!(
            correlator.register("dup").err(),
            Some(CorrelationError::DuplicateId("dup".to_string()))
        );
    }

    #[test]
    fn test_try_take() {
        let correlator = Correlator::new();
        let mut slot = correlator.register("p").unwrap();
        assert!(slot.try_take().is_none());

        let pong = Envelope::new(Payload::Pong(PongPayload::default()))
            .unwrap()
            .with_id("p");
        assert!(correlator.resolve(pong));
        assert!(matches!(slot.try_take(), Some(Ok(_))));
    }
}
