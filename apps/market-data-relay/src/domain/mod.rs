//! Domain Layer - Core relay types and state machines.
//!
//! This layer contains the wire types, the consolidated subscription ledger
//! and the upstream session state machine. Nothing here performs I/O.

/// Wire messages, codec and credentials.
pub mod streaming;

/// Consolidated subscription ledger.
pub mod subscription;

/// Upstream session lifecycle and reconnect backoff.
pub mod session;
