use std::sync::Arc;

use bus_channel::{Delivery, DeliveryStatus, Kind, MessageTransformer, ResultConsumer};
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::metrics::{self, MetricStatus};

use super::connection::ConnectivityState;
use super::reconnect::{self, ReplayEntry};
use super::Core;

/// Long-lived consume loop for one address. Exits on cancellation or on a
/// severed link; in the latter case it queues its own recreation before
/// waking the reconnector.
pub(crate) fn spawn(
    core: Arc<Core>,
    address: String,
    transformer: Option<Arc<dyn MessageTransformer>>,
    consumer: Option<Arc<dyn ResultConsumer>>,
    mut link: Box<dyn crate::broker::ReceiverLink>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        info!(address = %address, "waiting and listening");
        metrics::record_receiver(&address, MetricStatus::Active, 1);
        loop {
            tokio::select! {
                _ = cancel_rx.changed() => {
                    debug!(address = %address, "receiver cancelled");
                    return;
                }
                msg = link.next() => match msg {
                    Ok(payload) => {
                        core.handle_inbound(&address, transformer.as_deref(), &consumer, payload)
                            .await;
                    }
                    Err(err) => {
                        warn!(address = %address, %err, "receiver error, will try to reconnect");
                        metrics::record_receiver(&address, MetricStatus::ConnectionReset, 1);
                        metrics::record_receiver(&address, MetricStatus::Active, -1);
                        if core.registry.contains_receiver(&address)
                            && core.conn.state() != ConnectivityState::Closed
                        {
                            let entry = ReplayEntry {
                                address: address.clone(),
                                transformer,
                                consumer,
                            };
                            // Queue first so a winning episode always sees
                            // this receiver, then wake the reconnector.
                            if core.replay_tx.send(entry).await.is_ok() {
                                reconnect::trigger(&core);
                            }
                        } else {
                            info!(address = %address, "router was closed");
                        }
                        return;
                    }
                },
            }
        }
    });
}

impl Core {
    async fn handle_inbound(
        &self,
        address: &str,
        transformer: Option<&dyn MessageTransformer>,
        consumer: &Option<Arc<dyn ResultConsumer>>,
        payload: Bytes,
    ) {
        let mut out = Delivery::new(address, Kind::Event, DeliveryStatus::New)
            .with_payload(payload.clone());
        out.consumer = consumer.clone();
        match transformer {
            Some(transformer) => match transformer.transform(&payload, &mut out) {
                Ok(()) => {
                    out.status = DeliveryStatus::Success;
                    metrics::record_event_received(address, MetricStatus::Success, 1);
                }
                Err(err) => {
                    debug!(address = %address, %err, "transform rejected inbound message");
                    out.status = DeliveryStatus::Failed;
                    metrics::record_event_received(address, MetricStatus::Failed, 1);
                }
            },
            None => metrics::record_event_received(address, MetricStatus::Success, 1),
        }
        self.forward(out).await;
    }
}
