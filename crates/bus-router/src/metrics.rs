use once_cell::sync::Lazy;
use prometheus::{IntGaugeVec, Opts, Registry};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Label value attached to every per-address gauge sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricStatus {
    Active,
    Success,
    Failed,
    ConnectionReset,
}

impl MetricStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricStatus::Active => "active",
            MetricStatus::Success => "success",
            MetricStatus::Failed => "failed",
            MetricStatus::ConnectionReset => "connection reset",
        }
    }
}

pub static EVENTS_RECEIVED: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new(
            "bus_transport_events_received",
            "Events received by the transport",
        ),
        &["address", "status"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static EVENTS_PUBLISHED: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new(
            "bus_transport_events_published",
            "Events published by the transport",
        ),
        &["address", "status"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static CONNECTION_RESETS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new(
            "bus_transport_connection_resets",
            "Broker connection resets observed",
        ),
        &[],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static SENDERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("bus_transport_senders", "Sender links created"),
        &["address", "status"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static RECEIVERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("bus_transport_receivers", "Receiver links created"),
        &["address", "status"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static STATUS_CHECKS_PUBLISHED: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new(
            "bus_transport_status_checks_published",
            "Status checks published by the transport",
        ),
        &["address", "status"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn record_connection_reset(delta: i64) {
    CONNECTION_RESETS.with_label_values(&[]).add(delta);
}

pub fn record_event_received(address: &str, status: MetricStatus, delta: i64) {
    EVENTS_RECEIVED
        .with_label_values(&[address, status.as_str()])
        .add(delta);
}

pub fn record_event_published(address: &str, status: MetricStatus, delta: i64) {
    EVENTS_PUBLISHED
        .with_label_values(&[address, status.as_str()])
        .add(delta);
}

pub fn record_sender(address: &str, status: MetricStatus, delta: i64) {
    SENDERS
        .with_label_values(&[address, status.as_str()])
        .add(delta);
}

pub fn record_receiver(address: &str, status: MetricStatus, delta: i64) {
    RECEIVERS
        .with_label_values(&[address, status.as_str()])
        .add(delta);
}

pub fn record_status_check_published(address: &str, status: MetricStatus, delta: i64) {
    STATUS_CHECKS_PUBLISHED
        .with_label_values(&[address, status.as_str()])
        .add(delta);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_track_deltas_per_address_and_status() {
        record_sender("metrics-test", MetricStatus::Active, 1);
        record_sender("metrics-test", MetricStatus::Active, 1);
        record_sender("metrics-test", MetricStatus::Active, -1);
        let value = SENDERS
            .with_label_values(&["metrics-test", MetricStatus::Active.as_str()])
            .get();
        assert_eq!(value, 1);
    }

    #[test]
    fn connection_reset_gauge_has_no_labels() {
        let before = CONNECTION_RESETS.with_label_values(&[]).get();
        record_connection_reset(1);
        assert_eq!(CONNECTION_RESETS.with_label_values(&[]).get(), before + 1);
    }
}
