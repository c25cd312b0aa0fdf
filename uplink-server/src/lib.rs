//! Library entrypoint for uplink-server so other binaries can embed an
//! uplink instance (or mount its router inside a larger app) without
//! shelling out to the bundled daemon.
//!
//! An uplink keeps many client sessions synchronized with a server-side
//! key/value store and event bus. Clients ride a WebSocket when they can and
//! fall back to plain HTTP when they cannot; sessions survive socket drops
//! for a configurable grace period, with missed frames queued and flushed in
//! order on reconnect.

pub mod cli;
mod connection;
pub mod error;
pub mod server;
mod session;
pub mod spec;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

pub use error::UplinkError;
pub use server::UplinkServer;
pub use spec::{ActionFn, BootstrapFn, SessionFn, UplinkSpec};

pub use uplink_core::{
    apply_patch, content_hash, structural_diff, DiffRecord, Frame, RunMode, ServerFrame,
};

pub fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
