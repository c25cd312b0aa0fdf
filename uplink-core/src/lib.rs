//! # uplink-core
//!
//! Building blocks for the uplink state-synchronization server.
//!
//! This crate provides the server-held key/value store with diff-based
//! change records, the listener registries, the pattern dispatch tables,
//! and the socket wire vocabulary. Everything here is synchronous and
//! runtime-free; the serving layer lives in `uplink-server`.

pub mod bus;
pub mod contract;
pub mod diff;
pub mod hash;
pub mod protocol;
pub mod router;
pub mod store;

pub use bus::EventBus;
pub use contract::{ensure, ContractViolation, RunMode};
pub use diff::{apply_patch, structural_diff};
pub use hash::content_hash;
pub use protocol::{ClientCommand, DiffRecord, Frame, ServerFrame};
pub use router::PathRouter;
pub use store::{Store, StoreError, StoreUpdate};
