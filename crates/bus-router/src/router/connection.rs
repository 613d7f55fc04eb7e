use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::broker::{Connection, Dialer};
use crate::error::RouterError;

/// Connectivity of the shared broker connection. `Closed` is terminal; the
/// `Error`/`Connecting`/`Connected` cycle may repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectivityState {
    Error = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl ConnectivityState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectivityState::Connecting,
            2 => ConnectivityState::Connected,
            3 => ConnectivityState::Closed,
            _ => ConnectivityState::Error,
        }
    }
}

/// Owns the single broker connection and the connectivity flag. `dial`
/// performs exactly one attempt; retrying is the reconnector's job.
pub(crate) struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    target: String,
    conn: RwLock<Option<Arc<dyn Connection>>>,
    state: AtomicU8,
}

impl ConnectionManager {
    pub(crate) fn new(dialer: Arc<dyn Dialer>, target: impl Into<String>) -> Self {
        Self {
            dialer,
            target: target.into(),
            conn: RwLock::new(None),
            state: AtomicU8::new(ConnectivityState::Error as u8),
        }
    }

    /// One dial attempt; on success the fresh connection replaces the old
    /// one. The connectivity flag is left to the caller.
    pub(crate) async fn dial(&self) -> Result<(), RouterError> {
        let conn = self
            .dialer
            .dial(&self.target)
            .await
            .map_err(|err| RouterError::Connection(err.to_string()))?;
        *self.conn.write() = Some(Arc::from(conn));
        debug!(target = "router.connection", host = %self.target, "broker connection established");
        Ok(())
    }

    pub(crate) fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.conn.read().clone()
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ConnectivityState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectivityState::Connected
    }

    /// Claim the reconnect episode: Connected -> Connecting, exactly one
    /// winner per disconnection.
    pub(crate) fn begin_reconnect(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectivityState::Connected as u8,
                ConnectivityState::Connecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;

    #[tokio::test]
    async fn dial_swaps_connection_and_reports_failure() {
        let broker = MockBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), "mock");
        assert!(manager.connection().is_none());

        manager.dial().await.expect("dial ok");
        assert!(manager.connection().is_some());

        broker.refuse_dial(true);
        let err = manager.dial().await.expect_err("dial refused");
        assert!(matches!(err, RouterError::Connection(_)));
        // The previous connection stays in place on a failed dial.
        assert!(manager.connection().is_some());
    }

    #[tokio::test]
    async fn reconnect_claim_needs_connected_state() {
        let manager = ConnectionManager::new(Arc::new(MockBroker::new()), "mock");
        assert_eq!(manager.state(), ConnectivityState::Error);
        assert!(!manager.begin_reconnect());

        manager.set_state(ConnectivityState::Connected);
        assert!(manager.begin_reconnect());
        assert_eq!(manager.state(), ConnectivityState::Connecting);
        // Second claim loses while the episode is still running.
        assert!(!manager.begin_reconnect());

        manager.set_state(ConnectivityState::Closed);
        assert!(!manager.begin_reconnect());
    }
}
