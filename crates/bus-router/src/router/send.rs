use std::sync::Arc;

use bus_channel::{Delivery, DeliveryStatus, FailureKind, Kind, ResultConsumer};
use bytes::Bytes;
use tokio::time::timeout;
use tracing::error;

use crate::broker::TransportError;
use crate::metrics::MetricStatus;

use super::registry::SenderHandle;
use super::{record_publish_outcome, reconnect, Core};

/// One publish attempt on its own task, bounded by the cancel timeout. The
/// dispatcher never waits on the outcome; a stuck address cannot stall
/// delivery to the others.
pub(crate) fn spawn(
    core: Arc<Core>,
    kind: Kind,
    address: String,
    payload: Bytes,
    consumer: Option<Arc<dyn ResultConsumer>>,
    handle: SenderHandle,
) {
    tokio::spawn(async move {
        let outcome = timeout(core.cfg.cancel_timeout, handle.link.publish(payload.clone())).await;
        let mut out = Delivery::new(address.clone(), kind, DeliveryStatus::Success)
            .with_payload(payload);
        out.consumer = consumer;
        match outcome {
            Ok(Ok(())) => {
                record_publish_outcome(kind, &address, MetricStatus::Success);
            }
            Ok(Err(TransportError::Severed)) => {
                // The link is gone with the connection; keep the address
                // registered but broken until the reconnector rebuilds it.
                error!(address = %address, %kind, "failed to send: link severed");
                core.registry.mark_sender_broken(&address);
                record_publish_outcome(kind, &address, MetricStatus::ConnectionReset);
                out.status = DeliveryStatus::Failed;
                out.reason = Some(FailureKind::ConnectionReset);
                core.forward(out).await;
                reconnect::trigger(&core);
                return;
            }
            Ok(Err(err)) => {
                error!(address = %address, %kind, %err, "failed to send");
                record_publish_outcome(kind, &address, MetricStatus::Failed);
                out.status = DeliveryStatus::Failed;
                out.reason = Some(FailureKind::Rejected);
            }
            Err(_) => {
                error!(address = %address, %kind, "send timed out");
                record_publish_outcome(kind, &address, MetricStatus::Failed);
                out.status = DeliveryStatus::Failed;
                out.reason = Some(FailureKind::Rejected);
            }
        }
        core.forward(out).await;
    });
}
