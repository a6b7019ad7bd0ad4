//! MQTT v3.1.1 broker library.
//!
//! The crate is organised around the command engine in [`broker`]: every
//! decoded control packet is dispatched to a handler that mutates broker
//! state (sessions, the topic tree, retained messages, inflight tables) and
//! stages fully encoded outbound packets onto per-client queues. The
//! [`server`] module owns the accept loop and the per-connection tasks that
//! feed the engine and drain those queues.

pub mod auth;
pub mod broker;
pub mod error;
pub mod server;

mod connection;
mod session;
mod shutdown;
mod topic_tree;
