//! Run-mode aware contract checks.
//!
//! A violated contract (duplicate subscribe, handshake on a connection that
//! already has one) is a bug in the caller rather than a runtime condition,
//! so the failure policy depends on the run mode: development panics at the
//! violation site, production logs it and hands back an error the protocol
//! layer can surface to the offending client.

use thiserror::Error;
use tracing::warn;

/// Deployment posture. Defaults from the build profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Development,
    Production,
}

impl Default for RunMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            RunMode::Development
        } else {
            RunMode::Production
        }
    }
}

impl RunMode {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "production" | "prod" => RunMode::Production,
            _ => RunMode::Development,
        }
    }

    pub fn is_dev(self) -> bool {
        matches!(self, RunMode::Development)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ContractViolation(pub String);

/// Enforce `cond`. Panics in development; warns and errs in production.
pub fn ensure(mode: RunMode, cond: bool, msg: &str) -> Result<(), ContractViolation> {
    if cond {
        return Ok(());
    }
    if mode.is_dev() {
        panic!("contract violation: {msg}");
    }
    warn!("contract violation: {msg}");
    Err(ContractViolation(msg.to_string()))
}
