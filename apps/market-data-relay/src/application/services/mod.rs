//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `Relay`: Owns the upstream session, subscription ledger and subscribers
//! - `ClientRegistry`: Subscriber set with liveness flags

mod registry;
mod relay;

pub use registry::{ClientRegistry, Sweep};
pub use relay::{
    BroadcastReport, ClientMessageOutcome, ProbeReport, Relay, RelaySettings, RelayStatus,
};
