use thiserror::Error;

use crate::broker::TransportError;

/// Router-level failures. Creation failures surface synchronously to the
/// dispatcher; delivery failures are reported asynchronously as Failed
/// deliveries and never through this type.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("sender {address} error: {reason}")]
    Sender { address: String, reason: String },
    #[error("receiver {address} error: {reason}")]
    Receiver { address: String, reason: String },
    #[error("sender {0} not found")]
    SenderNotFound(String),
    #[error("receiver {0} not found")]
    ReceiverNotFound(String),
    #[error("transport client construction error: {0}")]
    ClientConstruction(String),
    #[error("router command queue closed")]
    ChannelClosed,
}

impl RouterError {
    /// Classify a transport failure observed while creating a sender.
    pub(crate) fn for_sender(address: &str, err: TransportError) -> Self {
        match err {
            TransportError::Client(reason) => RouterError::ClientConstruction(reason),
            TransportError::Dial(reason) => RouterError::Connection(reason),
            other => RouterError::Sender {
                address: address.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Classify a transport failure observed while creating a receiver.
    pub(crate) fn for_receiver(address: &str, err: TransportError) -> Self {
        match err {
            TransportError::Client(reason) => RouterError::ClientConstruction(reason),
            TransportError::Dial(reason) => RouterError::Connection(reason),
            other => RouterError::Receiver {
                address: address.to_string(),
                reason: other.to_string(),
            },
        }
    }
}
