//! Transport router: multiplexes named publish/subscribe endpoints over a
//! single broker connection, recreating them transparently after a
//! connection loss.
//!
//! Collaborators enqueue [`bus_channel::Command`]s through a
//! [`RouterHandle`] and consume [`bus_channel::Delivery`] outcomes from the
//! same handle. The broker protocol itself lives behind the traits in
//! [`broker`]; [`broker::mock`] provides an in-memory implementation for
//! tests and local development.

pub mod broker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod router;

pub use config::RouterConfig;
pub use error::RouterError;
pub use router::connection::ConnectivityState;
pub use router::{Router, RouterHandle};
