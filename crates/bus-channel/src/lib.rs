use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

/// What a command or delivery is about: an endpoint kind for lifecycle
/// commands, a message kind for deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Listener,
    Sender,
    Event,
    Status,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Listener => "listener",
            Kind::Sender => "sender",
            Kind::Event => "event",
            Kind::Status => "status",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Delete,
    Deliver,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Delete => "delete",
            Action::Deliver => "deliver",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome attached to a [`Delivery`]. `New` marks an inbound message that no
/// transformer has judged yet; collaborators process it themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    New,
    Success,
    Delete,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::New => "new",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Delete => "delete",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a delivery failed. Only `ConnectionReset` triggers reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The transport link was severed; the connection is being re-established.
    ConnectionReset,
    /// The broker rejected the message or the publish timed out.
    Rejected,
    /// No sender is registered for the address.
    NoSender,
}

/// Validates and rewrites an inbound message before it is surfaced to
/// collaborators. Bound once per address at receiver creation.
pub trait MessageTransformer: Send + Sync {
    fn transform(&self, payload: &Bytes, out: &mut Delivery) -> Result<(), TransformError>;
}

/// Post-processing hook carried through on a delivery for the collaborator
/// consuming the result queue.
pub trait ResultConsumer: Send + Sync {
    fn consume(&self, delivery: &Delivery) -> Result<(), ConsumeError>;
}

#[derive(Debug, Error)]
#[error("transform rejected: {0}")]
pub struct TransformError(pub String);

#[derive(Debug, Error)]
#[error("consume failed: {0}")]
pub struct ConsumeError(pub String);

/// One unit of intent submitted to the router: create or delete an endpoint,
/// or deliver a message through an existing sender.
#[derive(Clone)]
pub struct Command {
    pub address: String,
    pub kind: Kind,
    pub action: Action,
    pub payload: Option<Bytes>,
    pub transformer: Option<Arc<dyn MessageTransformer>>,
    pub consumer: Option<Arc<dyn ResultConsumer>>,
}

impl Command {
    fn new(address: impl Into<String>, kind: Kind, action: Action) -> Self {
        Self {
            address: address.into(),
            kind,
            action,
            payload: None,
            transformer: None,
            consumer: None,
        }
    }

    pub fn create_sender(address: impl Into<String>) -> Self {
        Self::new(address, Kind::Sender, Action::Create)
    }

    pub fn delete_sender(address: impl Into<String>) -> Self {
        Self::new(address, Kind::Sender, Action::Delete)
    }

    pub fn create_listener(address: impl Into<String>) -> Self {
        Self::new(address, Kind::Listener, Action::Create)
    }

    pub fn delete_listener(address: impl Into<String>) -> Self {
        Self::new(address, Kind::Listener, Action::Delete)
    }

    /// Listener whose inbound messages are validated by `transformer` before
    /// they reach collaborators, with `consumer` carried on each delivery.
    pub fn status_listener(
        address: impl Into<String>,
        transformer: Arc<dyn MessageTransformer>,
        consumer: Option<Arc<dyn ResultConsumer>>,
    ) -> Self {
        let mut cmd = Self::new(address, Kind::Listener, Action::Create);
        cmd.transformer = Some(transformer);
        cmd.consumer = consumer;
        cmd
    }

    pub fn deliver_event(address: impl Into<String>, payload: Bytes) -> Self {
        let mut cmd = Self::new(address, Kind::Event, Action::Deliver);
        cmd.payload = Some(payload);
        cmd
    }

    pub fn deliver_status(address: impl Into<String>, payload: Bytes) -> Self {
        let mut cmd = Self::new(address, Kind::Status, Action::Deliver);
        cmd.payload = Some(payload);
        cmd
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("action", &self.action)
            .field("payload", &self.payload.as_ref().map(Bytes::len))
            .field("transformer", &self.transformer.is_some())
            .field("consumer", &self.consumer.is_some())
            .finish()
    }
}

/// One per-operation outcome reported on the router's result queue.
#[derive(Clone)]
pub struct Delivery {
    pub address: String,
    pub kind: Kind,
    pub status: DeliveryStatus,
    pub payload: Option<Bytes>,
    pub reason: Option<FailureKind>,
    pub consumer: Option<Arc<dyn ResultConsumer>>,
}

impl Delivery {
    pub fn new(address: impl Into<String>, kind: Kind, status: DeliveryStatus) -> Self {
        Self {
            address: address.into(),
            kind,
            status,
            payload: None,
            reason: None,
            consumer: None,
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_reason(mut self, reason: FailureKind) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Run the attached consumer, if any.
    pub fn process(&self) -> Result<(), ConsumeError> {
        match &self.consumer {
            Some(consumer) => consumer.consume(self),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("payload", &self.payload.as_ref().map(Bytes::len))
            .field("reason", &self.reason)
            .field("consumer", &self.consumer.is_some())
            .finish()
    }
}
