//! UDP interface to the GeRM detector readout FPGA.
//!
//! This crate provides the protocol engine used by the `germ_gige` capture
//! server and the `germctl` tool:
//!
//! - `register`: register read/write over UDP with a bounded reply wait
//! - `data`: frame reassembly from the high-rate datagram stream, with
//!   sequence-gap detection and throughput measurement
//! - `capture`: the request/reply handshake with the data-collection client
//!   that gates each frame's capture and persistence
//! - `control`: the request/reply transport (TCP or in-process)
//! - `frame`: the reusable reassembly arena, frame metadata and file output
//! - `sim`: a simulated module for bench testing without hardware
pub mod capture;
pub mod config;
pub mod control;
pub mod data;
pub mod error;
pub mod frame;
pub mod iface;
pub mod logging;
pub mod register;
pub mod shutdown;
pub mod sim;

pub use error::{GermError, Result};
