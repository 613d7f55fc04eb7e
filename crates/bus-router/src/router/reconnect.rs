use std::sync::atomic::Ordering;
use std::sync::Arc;

use bus_channel::{MessageTransformer, ResultConsumer};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::error::RouterError;
use crate::metrics;

use super::connection::ConnectivityState;
use super::Core;

/// A receiver waiting to be recreated on the next connection.
pub(crate) struct ReplayEntry {
    pub(crate) address: String,
    pub(crate) transformer: Option<Arc<dyn MessageTransformer>>,
    pub(crate) consumer: Option<Arc<dyn ResultConsumer>>,
}

/// Start a reconnect episode unless one is already running or the router is
/// closed. Safe to call from every failing send and receive loop at once;
/// the Connected -> Connecting swap picks a single winner.
pub(crate) fn trigger(core: &Arc<Core>) {
    if core.conn.state() == ConnectivityState::Closed {
        return;
    }
    if core.conn.begin_reconnect() {
        metrics::record_connection_reset(1);
        core.episodes.fetch_add(1, Ordering::SeqCst);
        info!("trying to reconnect again ...");
        let core = Arc::clone(core);
        tokio::spawn(async move {
            run_episode(core).await;
        });
    }
}

async fn run_episode(core: Arc<Core>) {
    loop {
        if core.conn.state() == ConnectivityState::Closed {
            info!("router closed while reconnecting, abandoning episode");
            return;
        }
        match core.conn.dial().await {
            Ok(()) => break,
            Err(err) => {
                info!(%err, "retrying broker connection");
                sleep(core.cfg.retry_interval).await;
            }
        }
    }

    info!("fixing existing receivers with the new connection");
    drain_replay(&core).await;

    info!("fixing existing senders with the new connection");
    for address in core.registry.sender_addresses() {
        if let Err(err) = core.new_sender(&address).await {
            error!(address = %address, %err, "error recreating sender");
        }
    }

    core.conn.set_state(ConnectivityState::Connected);

    // Receivers that failed while this episode was completing already queued
    // themselves (they enqueue before triggering), so one more sweep picks
    // them up. Anything arriving later finds the state Connected, wins the
    // swap, and gets a fresh episode.
    drain_replay(&core).await;
}

async fn drain_replay(core: &Arc<Core>) {
    let mut replay = core.replay_rx.lock().await;
    loop {
        match replay.try_recv() {
            Ok(entry) => {
                if !core.registry.contains_receiver(&entry.address) {
                    debug!(
                        "skipping replay, {}",
                        RouterError::ReceiverNotFound(entry.address)
                    );
                    continue;
                }
                if let Err(err) = core
                    .build_receiver(&entry.address, entry.transformer, entry.consumer)
                    .await
                {
                    error!(address = %entry.address, %err, "error creating new receiver");
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
}
