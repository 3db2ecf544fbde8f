//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the relay service and the port interfaces that
//! connect it to the upstream and subscriber transports.

/// Port interfaces for the upstream connector and subscriber connections.
pub mod ports;

/// Relay service and client registry.
pub mod services;
