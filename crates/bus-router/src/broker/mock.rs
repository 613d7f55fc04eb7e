//! In-memory broker used by tests and local development. Messages published
//! to an address fan out to every receiver attached to it. `sever` simulates
//! a connection loss: every link attached under the old connection starts
//! reporting [`TransportError::Severed`] until the broker is redialed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use super::{Connection, Dialer, ReceiverLink, SenderLink, Session, TransportError};

const TOPIC_DEPTH: usize = 64;

#[derive(Clone)]
pub struct MockBroker {
    shared: Arc<Shared>,
}

struct Shared {
    epoch: watch::Sender<u64>,
    refuse_dial: AtomicBool,
    rejected: Mutex<HashSet<String>>,
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    published: Mutex<Vec<(String, Bytes)>>,
    publish_attempts: AtomicUsize,
    dial_attempts: AtomicUsize,
    sender_attaches: Mutex<HashMap<String, usize>>,
    receiver_attaches: Mutex<HashMap<String, usize>>,
    live_receivers: Mutex<HashMap<String, usize>>,
}

impl Shared {
    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    fn sender_for(&self, address: &str) -> broadcast::Sender<Bytes> {
        let mut guard = self.topics.lock();
        guard
            .entry(address.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_DEPTH).0)
            .clone()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                epoch,
                refuse_dial: AtomicBool::new(false),
                rejected: Mutex::new(HashSet::new()),
                topics: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                publish_attempts: AtomicUsize::new(0),
                dial_attempts: AtomicUsize::new(0),
                sender_attaches: Mutex::new(HashMap::new()),
                receiver_attaches: Mutex::new(HashMap::new()),
                live_receivers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Kill the current connection: every link attached under it reports
    /// `Severed` from now on.
    pub fn sever(&self) {
        self.shared.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Make subsequent dial attempts fail until re-enabled.
    pub fn refuse_dial(&self, refuse: bool) {
        self.shared.refuse_dial.store(refuse, Ordering::SeqCst);
    }

    /// Reject (without severing) every publish to `address`.
    pub fn reject_publishes_to(&self, address: &str) {
        self.shared.rejected.lock().insert(address.to_string());
    }

    pub fn accept_publishes_to(&self, address: &str) {
        self.shared.rejected.lock().remove(address);
    }

    /// Push an inbound message to every receiver attached to `address`.
    pub fn inject(&self, address: &str, payload: Bytes) {
        let _ = self.shared.sender_for(address).send(payload);
    }

    pub fn dial_attempts(&self) -> usize {
        self.shared.dial_attempts.load(Ordering::SeqCst)
    }

    pub fn sender_attach_count(&self, address: &str) -> usize {
        self.shared
            .sender_attaches
            .lock()
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn receiver_attach_count(&self, address: &str) -> usize {
        self.shared
            .receiver_attaches
            .lock()
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// Receivers currently attached (attaches minus dropped links).
    pub fn live_receiver_count(&self, address: &str) -> usize {
        self.shared
            .live_receivers
            .lock()
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.shared.published.lock().clone()
    }

    pub fn publish_count(&self) -> usize {
        self.shared.published.lock().len()
    }

    /// Publishes attempted, whether or not they were accepted.
    pub fn publish_attempts(&self) -> usize {
        self.shared.publish_attempts.load(Ordering::SeqCst)
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for MockBroker {
    async fn dial(&self, target: &str) -> Result<Box<dyn Connection>, TransportError> {
        self.shared.dial_attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.refuse_dial.load(Ordering::SeqCst) {
            return Err(TransportError::Dial(format!("{target}: connection refused")));
        }
        Ok(Box::new(MockConnection {
            shared: Arc::clone(&self.shared),
            epoch: self.shared.current_epoch(),
        }))
    }
}

struct MockConnection {
    shared: Arc<Shared>,
    epoch: u64,
}

impl MockConnection {
    fn severed(&self) -> bool {
        self.shared.current_epoch() != self.epoch
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn open_session(&self) -> Result<Box<dyn Session>, TransportError> {
        if self.severed() {
            return Err(TransportError::Severed);
        }
        Ok(Box::new(MockSession {
            shared: Arc::clone(&self.shared),
            epoch: self.epoch,
        }))
    }
}

struct MockSession {
    shared: Arc<Shared>,
    epoch: u64,
}

#[async_trait]
impl Session for MockSession {
    async fn attach_sender(&self, address: &str) -> Result<Arc<dyn SenderLink>, TransportError> {
        if self.shared.current_epoch() != self.epoch {
            return Err(TransportError::Severed);
        }
        *self
            .shared
            .sender_attaches
            .lock()
            .entry(address.to_string())
            .or_insert(0) += 1;
        Ok(Arc::new(MockSenderLink {
            shared: Arc::clone(&self.shared),
            epoch: self.epoch,
            address: address.to_string(),
        }))
    }

    async fn attach_receiver(
        &self,
        address: &str,
        _link_credit: u32,
    ) -> Result<Box<dyn ReceiverLink>, TransportError> {
        if self.shared.current_epoch() != self.epoch {
            return Err(TransportError::Severed);
        }
        *self
            .shared
            .receiver_attaches
            .lock()
            .entry(address.to_string())
            .or_insert(0) += 1;
        *self
            .shared
            .live_receivers
            .lock()
            .entry(address.to_string())
            .or_insert(0) += 1;
        let rx = self.shared.sender_for(address).subscribe();
        let epoch_rx = self.shared.epoch.subscribe();
        Ok(Box::new(MockReceiverLink {
            shared: Arc::clone(&self.shared),
            epoch: self.epoch,
            address: address.to_string(),
            rx,
            epoch_rx,
        }))
    }
}

struct MockSenderLink {
    shared: Arc<Shared>,
    epoch: u64,
    address: String,
}

#[async_trait]
impl SenderLink for MockSenderLink {
    async fn publish(&self, payload: Bytes) -> Result<(), TransportError> {
        self.shared.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.current_epoch() != self.epoch {
            return Err(TransportError::Severed);
        }
        if self.shared.rejected.lock().contains(&self.address) {
            return Err(TransportError::Rejected("delivery refused".into()));
        }
        self.shared
            .published
            .lock()
            .push((self.address.clone(), payload.clone()));
        // No subscribers is fine; the message is still recorded above.
        let _ = self.shared.sender_for(&self.address).send(payload);
        Ok(())
    }

    async fn close(&self) {}
}

struct MockReceiverLink {
    shared: Arc<Shared>,
    epoch: u64,
    address: String,
    rx: broadcast::Receiver<Bytes>,
    epoch_rx: watch::Receiver<u64>,
}

#[async_trait]
impl ReceiverLink for MockReceiverLink {
    async fn next(&mut self) -> Result<Bytes, TransportError> {
        loop {
            if *self.epoch_rx.borrow() != self.epoch {
                return Err(TransportError::Severed);
            }
            tokio::select! {
                changed = self.epoch_rx.changed() => {
                    if changed.is_err() || *self.epoch_rx.borrow() != self.epoch {
                        return Err(TransportError::Severed);
                    }
                }
                msg = self.rx.recv() => match msg {
                    Ok(payload) => return Ok(payload),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TransportError::Severed);
                    }
                },
            }
        }
    }
}

impl Drop for MockReceiverLink {
    fn drop(&mut self) {
        if let Some(count) = self.shared.live_receivers.lock().get_mut(&self.address) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn attach_pair(
        broker: &MockBroker,
        address: &str,
    ) -> (Arc<dyn SenderLink>, Box<dyn ReceiverLink>) {
        let conn = broker.dial("mock").await.expect("dial ok");
        let session = conn.open_session().await.expect("session ok");
        let sender = session.attach_sender(address).await.expect("sender ok");
        let receiver = session
            .attach_receiver(address, 50)
            .await
            .expect("receiver ok");
        (sender, receiver)
    }

    #[tokio::test]
    async fn publish_fans_out_to_receiver() {
        let broker = MockBroker::new();
        let (sender, mut receiver) = attach_pair(&broker, "hw/events").await;

        sender
            .publish(Bytes::from_static(b"ping"))
            .await
            .expect("publish ok");
        let payload = receiver.next().await.expect("receive ok");
        assert_eq!(payload, Bytes::from_static(b"ping"));
        assert_eq!(broker.publish_count(), 1);
        assert_eq!(broker.live_receiver_count("hw/events"), 1);
    }

    #[tokio::test]
    async fn sever_kills_links_from_old_connection() {
        let broker = MockBroker::new();
        let (sender, mut receiver) = attach_pair(&broker, "hw/events").await;

        broker.sever();
        assert!(matches!(
            sender.publish(Bytes::from_static(b"ping")).await,
            Err(TransportError::Severed)
        ));
        assert!(matches!(receiver.next().await, Err(TransportError::Severed)));

        // A fresh dial works and gets a live link again.
        let (sender, _receiver) = attach_pair(&broker, "hw/events").await;
        sender
            .publish(Bytes::from_static(b"pong"))
            .await
            .expect("publish ok after redial");
        assert_eq!(broker.sender_attach_count("hw/events"), 2);
    }

    #[tokio::test]
    async fn refused_dial_and_rejected_publish() {
        let broker = MockBroker::new();
        broker.refuse_dial(true);
        assert!(broker.dial("mock").await.is_err());
        assert_eq!(broker.dial_attempts(), 1);

        broker.refuse_dial(false);
        let (sender, _receiver) = attach_pair(&broker, "hw/events").await;
        broker.reject_publishes_to("hw/events");
        assert!(matches!(
            sender.publish(Bytes::from_static(b"ping")).await,
            Err(TransportError::Rejected(_))
        ));
        broker.accept_publishes_to("hw/events");
        sender
            .publish(Bytes::from_static(b"ping"))
            .await
            .expect("publish ok once accepted");
    }

    #[tokio::test]
    async fn dropping_receiver_updates_live_count() {
        let broker = MockBroker::new();
        let (_sender, receiver) = attach_pair(&broker, "hw/events").await;
        assert_eq!(broker.live_receiver_count("hw/events"), 1);
        drop(receiver);
        assert_eq!(broker.live_receiver_count("hw/events"), 0);
    }
}
