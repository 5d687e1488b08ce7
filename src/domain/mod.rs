//! Domain layer - Core types and port definitions
//!
//! This module defines the ports the driver core depends on (array command
//! channel, volume catalog) and the request/response types it exchanges
//! with callers, following hexagonal architecture principles.

pub mod ports;

pub use ports::*;
