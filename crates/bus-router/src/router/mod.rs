//! The dispatcher loop and the collaborator-facing handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bus_channel::{Action, Command, Delivery, DeliveryStatus, FailureKind, Kind};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::broker::Dialer;
use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::metrics::{self, MetricStatus};

pub mod connection;
pub(crate) mod registry;

mod receive;
mod reconnect;
mod send;

use connection::{ConnectionManager, ConnectivityState};
use reconnect::ReplayEntry;
use registry::{EndpointRegistry, ReceiverHandle, SenderHandle, SenderSlot};

/// State shared by the dispatcher, send tasks, receive loops, and reconnect
/// episodes.
pub(crate) struct Core {
    pub(crate) cfg: RouterConfig,
    pub(crate) conn: Arc<ConnectionManager>,
    pub(crate) registry: EndpointRegistry,
    pub(crate) data_out: mpsc::Sender<Delivery>,
    pub(crate) replay_tx: mpsc::Sender<ReplayEntry>,
    pub(crate) replay_rx: AsyncMutex<mpsc::Receiver<ReplayEntry>>,
    pub(crate) episodes: Arc<AtomicU64>,
}

impl Core {
    /// Open a session and attach a sender link for `address`, replacing
    /// whatever the registry held (including the broken sentinel).
    pub(crate) async fn new_sender(&self, address: &str) -> Result<(), RouterError> {
        let conn = self
            .conn
            .connection()
            .ok_or_else(|| RouterError::Connection("no active broker connection".into()))?;
        let session = conn
            .open_session()
            .await
            .map_err(|err| RouterError::for_sender(address, err))?;
        let link = session
            .attach_sender(address)
            .await
            .map_err(|err| RouterError::for_sender(address, err))?;
        self.registry.set_sender(address, SenderHandle::new(link));
        info!(address = %address, "created new sender");
        Ok(())
    }

    /// Attach a receiver link for `address` and spawn its receive loop.
    pub(crate) async fn build_receiver(
        self: &Arc<Self>,
        address: &str,
        transformer: Option<Arc<dyn bus_channel::MessageTransformer>>,
        consumer: Option<Arc<dyn bus_channel::ResultConsumer>>,
    ) -> Result<(), RouterError> {
        let conn = self
            .conn
            .connection()
            .ok_or_else(|| RouterError::Connection("no active broker connection".into()))?;
        let session = conn
            .open_session()
            .await
            .map_err(|err| RouterError::for_receiver(address, err))?;
        let link = session
            .attach_receiver(address, self.cfg.link_credit)
            .await
            .map_err(|err| RouterError::for_receiver(address, err))?;
        let (handle, cancel_rx) = ReceiverHandle::new();
        self.registry.set_receiver(address, handle);
        receive::spawn(
            Arc::clone(self),
            address.to_string(),
            transformer,
            consumer,
            link,
            cancel_rx,
        );
        Ok(())
    }

    pub(crate) async fn forward(&self, delivery: Delivery) {
        if self.data_out.send(delivery).await.is_err() {
            debug!("result queue consumer is gone; dropping delivery");
        }
    }

    async fn dispatch(self: &Arc<Self>, cmd: Command) {
        match (cmd.kind, cmd.action) {
            (Kind::Listener, Action::Create) => {
                if self.registry.contains_receiver(&cmd.address) {
                    info!(address = %cmd.address, "listener already exists, not creating again");
                } else if let Err(err) = self
                    .build_receiver(&cmd.address, cmd.transformer, cmd.consumer)
                    .await
                {
                    error!(address = %cmd.address, %err, "error setting up receiver");
                    metrics::record_receiver(&cmd.address, MetricStatus::Failed, 1);
                }
            }
            (Kind::Listener, Action::Delete) => {
                if let Some(handle) = self.registry.remove_receiver(&cmd.address) {
                    handle.cancel();
                    metrics::record_receiver(&cmd.address, MetricStatus::Active, -1);
                    info!(address = %cmd.address, "deleted listener");
                }
            }
            (Kind::Sender, Action::Create) => {
                if self.registry.contains_sender(&cmd.address) {
                    info!(address = %cmd.address, "sender already exists, not creating again");
                } else {
                    match self.new_sender(&cmd.address).await {
                        Ok(()) => metrics::record_sender(&cmd.address, MetricStatus::Active, 1),
                        Err(err) => {
                            error!(address = %cmd.address, %err, "error creating sender");
                            metrics::record_sender(&cmd.address, MetricStatus::Failed, 1);
                        }
                    }
                }
            }
            (Kind::Sender, Action::Delete) => {
                if let Some(handle) = self.registry.remove_sender(&cmd.address) {
                    handle.link.close().await;
                    metrics::record_sender(&cmd.address, MetricStatus::Active, -1);
                    info!(address = %cmd.address, "deleted sender");
                }
            }
            (Kind::Event | Kind::Status, Action::Deliver) => self.dispatch_deliver(cmd).await,
            (kind, action) => {
                debug!(%kind, %action, address = %cmd.address, "ignoring unsupported command");
            }
        }
    }

    async fn dispatch_deliver(self: &Arc<Self>, cmd: Command) {
        let payload = cmd.payload.unwrap_or_default();
        if !self.conn.is_connected() {
            error!(
                address = %cmd.address,
                "connection is not in connected state; ignoring delivery"
            );
            record_publish_outcome(cmd.kind, &cmd.address, MetricStatus::ConnectionReset);
            let mut out = Delivery::new(cmd.address, cmd.kind, DeliveryStatus::Failed)
                .with_payload(payload)
                .with_reason(FailureKind::ConnectionReset);
            out.consumer = cmd.consumer;
            self.forward(out).await;
            return;
        }
        match self.registry.sender(&cmd.address) {
            Some(SenderSlot::Live(handle)) => {
                send::spawn(
                    Arc::clone(self),
                    cmd.kind,
                    cmd.address,
                    payload,
                    cmd.consumer,
                    handle,
                );
            }
            Some(SenderSlot::Broken) => {
                error!(
                    address = %cmd.address,
                    "delivery failed due to connection error, sender waiting to be reconnected"
                );
                record_publish_outcome(cmd.kind, &cmd.address, MetricStatus::Failed);
                let mut out = Delivery::new(cmd.address, cmd.kind, DeliveryStatus::Failed)
                    .with_payload(payload)
                    .with_reason(FailureKind::ConnectionReset);
                out.consumer = cmd.consumer;
                self.forward(out).await;
            }
            None => {
                let err = RouterError::SenderNotFound(cmd.address.clone());
                warn!("{err}, will not try to create");
                record_publish_outcome(cmd.kind, &cmd.address, MetricStatus::Failed);
                let mut out = Delivery::new(cmd.address, cmd.kind, DeliveryStatus::Failed)
                    .with_payload(payload)
                    .with_reason(FailureKind::NoSender);
                out.consumer = cmd.consumer;
                self.forward(out).await;
            }
        }
    }

    async fn close_all(&self) {
        warn!("shutting down bus listeners and senders");
        self.conn.set_state(ConnectivityState::Closed);
        let (senders, receivers) = self.registry.drain();
        for (address, handle) in senders {
            handle.link.close().await;
            debug!(address = %address, "closed sender link");
        }
        for (address, handle) in receivers {
            handle.cancel();
            debug!(address = %address, "cancelled receiver");
        }
        // Stop the replay queue: a late episode must find nothing to redo.
        let mut replay = self.replay_rx.lock().await;
        while replay.try_recv().is_ok() {}
    }
}

pub(crate) fn record_publish_outcome(kind: Kind, address: &str, status: MetricStatus) {
    match kind {
        Kind::Status => metrics::record_status_check_published(address, status, 1),
        _ => metrics::record_event_published(address, status, 1),
    }
}

/// The dispatcher: single consumer of the command queue, sole author of
/// registry structure.
pub struct Router {
    core: Arc<Core>,
    data_in: mpsc::Receiver<Command>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Router {
    /// Dial the broker once and assemble the router and its handle. A failed
    /// dial surfaces here; afterwards reconnection is automatic.
    pub async fn connect(
        cfg: RouterConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Result<(Router, RouterHandle), RouterError> {
        let (command_tx, command_rx) = mpsc::channel(cfg.channel_capacity);
        let (result_tx, result_rx) = mpsc::channel(cfg.channel_capacity);
        let (replay_tx, replay_rx) = mpsc::channel(cfg.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let conn = Arc::new(ConnectionManager::new(dialer, cfg.target.clone()));
        conn.dial().await?;
        conn.set_state(ConnectivityState::Connected);
        let episodes = Arc::new(AtomicU64::new(0));

        let core = Arc::new(Core {
            cfg,
            conn: Arc::clone(&conn),
            registry: EndpointRegistry::new(),
            data_out: result_tx,
            replay_tx,
            replay_rx: AsyncMutex::new(replay_rx),
            episodes: Arc::clone(&episodes),
        });
        let router = Router {
            core,
            data_in: command_rx,
            shutdown_rx,
        };
        let handle = RouterHandle {
            conn,
            episodes,
            commands: command_tx,
            results: result_rx,
            shutdown: shutdown_tx,
        };
        Ok((router, handle))
    }

    /// Consume commands until shutdown. Run this on its own task.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        self.core.close_all().await;
                        return;
                    }
                }
                cmd = self.data_in.recv() => match cmd {
                    Some(cmd) => self.core.dispatch(cmd).await,
                    None => {
                        // Every handle is gone; nothing can submit anymore.
                        self.core.close_all().await;
                        return;
                    }
                },
            }
        }
    }
}

/// Collaborator-facing side of the router: submit commands, consume
/// deliveries, observe connectivity, trigger shutdown.
pub struct RouterHandle {
    conn: Arc<ConnectionManager>,
    episodes: Arc<AtomicU64>,
    commands: mpsc::Sender<Command>,
    results: mpsc::Receiver<Delivery>,
    shutdown: watch::Sender<bool>,
}

impl RouterHandle {
    pub async fn submit(&self, cmd: Command) -> Result<(), RouterError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| RouterError::ChannelClosed)
    }

    /// Next delivery off the result queue. `None` once the router and its
    /// remaining workers have shut down.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.results.recv().await
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn state(&self) -> ConnectivityState {
        self.conn.state()
    }

    /// Reconnect episodes started since startup.
    pub fn reconnect_episodes(&self) -> u64 {
        self.episodes.load(Ordering::SeqCst)
    }

    pub async fn create_sender(&self, address: impl Into<String>) -> Result<(), RouterError> {
        self.submit(Command::create_sender(address)).await
    }

    pub async fn delete_sender(&self, address: impl Into<String>) -> Result<(), RouterError> {
        self.submit(Command::delete_sender(address)).await
    }

    pub async fn create_listener(&self, address: impl Into<String>) -> Result<(), RouterError> {
        self.submit(Command::create_listener(address)).await
    }

    pub async fn status_listener(
        &self,
        address: impl Into<String>,
        transformer: Arc<dyn bus_channel::MessageTransformer>,
        consumer: Option<Arc<dyn bus_channel::ResultConsumer>>,
    ) -> Result<(), RouterError> {
        self.submit(Command::status_listener(address, transformer, consumer))
            .await
    }

    pub async fn delete_listener(&self, address: impl Into<String>) -> Result<(), RouterError> {
        self.submit(Command::delete_listener(address)).await
    }

    pub async fn publish_event(
        &self,
        address: impl Into<String>,
        payload: bytes::Bytes,
    ) -> Result<(), RouterError> {
        self.submit(Command::deliver_event(address, payload)).await
    }

    pub async fn publish_status(
        &self,
        address: impl Into<String>,
        payload: bytes::Bytes,
    ) -> Result<(), RouterError> {
        self.submit(Command::deliver_status(address, payload)).await
    }
}
