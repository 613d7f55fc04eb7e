use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::broker::SenderLink;

/// Publish side of one address, cheap to clone into send tasks.
#[derive(Clone)]
pub(crate) struct SenderHandle {
    pub(crate) link: Arc<dyn SenderLink>,
}

impl SenderHandle {
    pub(crate) fn new(link: Arc<dyn SenderLink>) -> Self {
        Self { link }
    }
}

/// Cancellation handle for one receive loop.
pub(crate) struct ReceiverHandle {
    cancel: watch::Sender<bool>,
}

impl ReceiverHandle {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (cancel, watch_rx) = watch::channel(false);
        (Self { cancel }, watch_rx)
    }

    pub(crate) fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// State of a registered sender address.
pub(crate) enum SenderSlot {
    Live(SenderHandle),
    /// The link died mid-publish; the entry stays so the reconnector can
    /// resurrect it, and create commands stay no-ops meanwhile.
    Broken,
}

#[derive(Default)]
struct Maps {
    senders: HashMap<String, Option<SenderHandle>>,
    receivers: HashMap<String, ReceiverHandle>,
}

/// Address-keyed sender and receiver handles. One mutex guards both maps so
/// reconnect replay never observes a torn view.
#[derive(Default)]
pub(crate) struct EndpointRegistry {
    inner: Mutex<Maps>,
}

impl EndpointRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_sender(&self, address: &str, handle: SenderHandle) {
        self.inner
            .lock()
            .senders
            .insert(address.to_string(), Some(handle));
    }

    pub(crate) fn sender(&self, address: &str) -> Option<SenderSlot> {
        self.inner.lock().senders.get(address).map(|slot| match slot {
            Some(handle) => SenderSlot::Live(handle.clone()),
            None => SenderSlot::Broken,
        })
    }

    pub(crate) fn contains_sender(&self, address: &str) -> bool {
        self.inner.lock().senders.contains_key(address)
    }

    /// Flip a present sender to the broken sentinel. Absent keys stay absent.
    pub(crate) fn mark_sender_broken(&self, address: &str) {
        if let Some(slot) = self.inner.lock().senders.get_mut(address) {
            *slot = None;
        }
    }

    pub(crate) fn remove_sender(&self, address: &str) -> Option<SenderHandle> {
        self.inner.lock().senders.remove(address).flatten()
    }

    /// Snapshot of every registered sender address, broken entries included.
    pub(crate) fn sender_addresses(&self) -> Vec<String> {
        self.inner.lock().senders.keys().cloned().collect()
    }

    pub(crate) fn set_receiver(&self, address: &str, handle: ReceiverHandle) {
        self.inner
            .lock()
            .receivers
            .insert(address.to_string(), handle);
    }

    pub(crate) fn contains_receiver(&self, address: &str) -> bool {
        self.inner.lock().receivers.contains_key(address)
    }

    pub(crate) fn remove_receiver(&self, address: &str) -> Option<ReceiverHandle> {
        self.inner.lock().receivers.remove(address)
    }

    /// Empty both maps, returning everything for teardown.
    pub(crate) fn drain(&self) -> (Vec<(String, SenderHandle)>, Vec<(String, ReceiverHandle)>) {
        let mut guard = self.inner.lock();
        let senders = guard
            .senders
            .drain()
            .filter_map(|(address, slot)| slot.map(|handle| (address, handle)))
            .collect();
        let receivers = guard.receivers.drain().collect();
        (senders, receivers)
    }

    #[cfg(test)]
    pub(crate) fn sender_count(&self) -> usize {
        self.inner.lock().senders.len()
    }

    #[cfg(test)]
    pub(crate) fn receiver_count(&self) -> usize {
        self.inner.lock().receivers.len()
    }
}
