//! In-process request-id rendezvous. Concurrent arrivals sharing a
//! `request_id` collapse: the first caller owns the work, later callers
//! wait on a watch channel for its outcome. A finished request is answered
//! from the audit log instead (the owner entry is gone by then).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use uuid::Uuid;

/// Outcome shared with waiting duplicates: response status plus the JSON
/// body the owner sent.
#[derive(Debug, Clone)]
pub struct SharedOutcome {
    pub status: u16,
    pub body: serde_json::Value,
}

type Slot = watch::Sender<Option<SharedOutcome>>;

#[derive(Clone, Default)]
pub struct Rendezvous {
    inner: Arc<Mutex<HashMap<Uuid, Slot>>>,
}

pub enum Claim {
    /// This caller computes the response and must call
    /// [`CompletionGuard::complete`] (or drop the guard on failure).
    Owner(CompletionGuard),
    Follower(watch::Receiver<Option<SharedOutcome>>),
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, request_id: Uuid) -> Claim {
        let mut inner = lock(&self.inner);
        if let Some(sender) = inner.get(&request_id) {
            return Claim::Follower(sender.subscribe());
        }

        let (sender, _receiver) = watch::channel(None);
        inner.insert(request_id, sender);
        Claim::Owner(CompletionGuard {
            request_id,
            inner: Arc::clone(&self.inner),
        })
    }
}

pub struct CompletionGuard {
    request_id: Uuid,
    inner: Arc<Mutex<HashMap<Uuid, Slot>>>,
}

impl CompletionGuard {
    /// Publish the outcome to any waiting duplicate and release the slot.
    pub fn complete(self, outcome: SharedOutcome) {
        let sender = lock(&self.inner).remove(&self.request_id);
        if let Some(sender) = sender {
            let _ = sender.send(Some(outcome));
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        // If the owner bailed without completing, drop the slot so waiters
        // observe channel closure and fall back to the audit log.
        lock(&self.inner).remove(&self.request_id);
    }
}

/// Wait for the owner's outcome. `None` means the owner went away without
/// publishing; the caller should re-read the audit log.
pub async fn wait(
    mut receiver: watch::Receiver<Option<SharedOutcome>>,
) -> Option<SharedOutcome> {
    loop {
        if let Some(outcome) = receiver.borrow().clone() {
            return Some(outcome);
        }
        if receiver.changed().await.is_err() {
            return receiver.borrow().clone();
        }
    }
}

fn lock<'a>(
    inner: &'a Arc<Mutex<HashMap<Uuid, Slot>>>,
) -> std::sync::MutexGuard<'a, HashMap<Uuid, Slot>> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
