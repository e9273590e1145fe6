//! Presence-aware delivery and reconciliation server for a peer-to-peer chat
//! client: routes contact-request, channel and message events to online
//! users, stores them for offline ones, and replays the outbox on reconnect.

pub mod channels;
pub mod cli;
pub mod config;
pub mod contact;
pub mod delivery;
pub mod error;
pub mod handlers;
pub mod messages;
pub mod model;
pub mod outbox;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod websocket;

#[cfg(test)]
mod test_support;

pub use crate::error::{CoreError, CoreResult};
pub use crate::state::{Courier, DeliverySettings};
