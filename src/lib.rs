//! netlab - namespace forwarding emulator
//!
//! A deterministic model of how a Linux-style network stack resolves
//! neighbors, switches frames, routes packets and masquerades flows.
//! Nothing touches a real NIC: packets are injected on virtual interfaces
//! and every table can be inspected afterwards.

pub mod config;
pub mod dataplane;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod telemetry;
pub mod topology;

pub use engine::{Engine, InjectReport, Names, Resolution};
pub use error::{Error, Result};
