//! Core types shared by the iris MQTT broker crates.
//!
//! This crate provides the primitives the packet codec and the broker engine
//! are built on: the `Encoder`/`Decoder` traits, the variable byte integer,
//! QoS levels, CONNACK return codes and topic name utilities.

pub mod codec;
pub mod error;
pub mod qos;
pub mod return_code;
pub mod topic;

/// A specialized `Result` type for iris operations.
///
/// This is defined as a convenience
pub type Result<T> = core::result::Result<T, crate::error::Error>;
