#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jbdbms_lib
//!
//! This crate implements the request/response protocol of JBD (Jiabaida)
//! battery management systems reachable over a half-duplex serial bus. It
//! can query pack telemetry, per-cell voltages and the hardware id, and
//! switch the charge/discharge MOSFETs.
//!
//! The protocol engine is transport-agnostic: it consumes a byte-stream
//! [`transport::Transport`], an optional [`transport::DirectionControl`]
//! for buses that need manual transmit/receive switching, and a
//! [`transport::Clock`] for the mandatory quiet time between exchanges.
//! The `serialport` feature provides the usual serial implementations.
//!
//! ## Features
//!
//! - `serialport`: Enables the synchronous serial transport using the
//!   `serialport` crate.
//! - `bin-dependencies` (default): Everything the `jbdbms` command-line
//!   tool needs.

/// Contains error types for the library.
mod error;
/// Frame construction, checksum and telemetry records.
pub mod protocol;
/// Capability interfaces the protocol engine is built against.
pub mod transport;

/// The transaction executor and typed commands.
pub mod client;

pub use error::Error;

/// Serial transport for JBD communication.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
