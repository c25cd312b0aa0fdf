//! Error taxonomy and its HTTP rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use uplink_core::{ContractViolation, RunMode, StoreError};

/// Everything a request or socket operation can fail with.
#[derive(Debug, Error)]
pub enum UplinkError {
    /// A request that failed shape or state validation. The message goes to
    /// the client verbatim.
    #[error("{0}")]
    Validation(String),

    #[error("Unknown store key")]
    UnknownStoreKey,

    #[error("Unknown event name")]
    UnknownEventName,

    #[error("Unknown action")]
    UnknownAction,

    /// A caller bug caught by a contract check (production mode only;
    /// development panics instead).
    #[error(transparent)]
    Contract(#[from] ContractViolation),

    /// Diff or hash failure at the write boundary. The store is unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An action or lifecycle handler failed.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl UplinkError {
    /// Render as the HTTP error contract: status 500 with an `err` field,
    /// plus the debug representation in development.
    pub(crate) fn into_http(self, mode: RunMode) -> Response {
        let mut body = json!({ "err": self.to_string() });
        if mode.is_dev() {
            body["stack"] = json!(format!("{self:?}"));
        }
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_error_strings() {
        assert_eq!(UplinkError::UnknownStoreKey.to_string(), "Unknown store key");
        assert_eq!(UplinkError::UnknownEventName.to_string(), "Unknown event name");
        assert_eq!(UplinkError::UnknownAction.to_string(), "Unknown action");
    }

    #[test]
    fn test_contract_violation_passes_through() {
        let err: UplinkError = ContractViolation("subscribeTo('/x'): already subscribed.".into()).into();
        assert_eq!(err.to_string(), "subscribeTo('/x'): already subscribed.");
    }
}
