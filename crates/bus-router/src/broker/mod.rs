//! Broker transport seam. Protocol framing and encoding live behind these
//! traits; the router only cares about dialing, attaching links, publishing,
//! and pulling messages. [`mock`] implements the seam in memory.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

pub mod mock;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    Dial(String),
    /// End-of-stream on the link: the connection underneath is gone. This is
    /// the only failure that triggers a reconnect episode.
    #[error("link severed")]
    Severed,
    #[error("rejected by broker: {0}")]
    Rejected(String),
    #[error("link attach failed: {0}")]
    Attach(String),
    #[error("client construction failed: {0}")]
    Client(String),
}

/// Dials the broker. One attempt per call; retry policy belongs to the
/// caller.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &str) -> Result<Box<dyn Connection>, TransportError>;
}

/// A live broker connection. Dropped wholesale on reconnect; never repaired
/// in place.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn Session>, TransportError>;
}

/// A session scoping one or more links on a connection.
#[async_trait]
pub trait Session: Send + Sync {
    async fn attach_sender(&self, address: &str) -> Result<Arc<dyn SenderLink>, TransportError>;

    async fn attach_receiver(
        &self,
        address: &str,
        link_credit: u32,
    ) -> Result<Box<dyn ReceiverLink>, TransportError>;
}

/// Publish side of one address.
#[async_trait]
pub trait SenderLink: Send + Sync {
    /// Attempt one publish. `Err(Severed)` means the connection is gone;
    /// any other error leaves the link usable.
    async fn publish(&self, payload: Bytes) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Consume side of one address.
#[async_trait]
pub trait ReceiverLink: Send {
    /// Pull the next message, pending until one arrives. `Err(Severed)`
    /// means the link died and the receiver must be recreated.
    async fn next(&mut self) -> Result<Bytes, TransportError>;
}
