//! Plugin error responses.

use crate::plugin::types::ErrResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Error returned by a plugin handler.
///
/// Every variant renders as `{"Err": "<message>"}`, which is what the
/// container engine shows the user.
#[derive(Debug)]
pub enum PluginError {
    /// Malformed request body (400).
    BadRequest(String),
    /// The driver operation failed (500).
    Driver(crate::error::Error),
    /// The blocking task failed (500).
    Internal(String),
}

impl PluginError {
    fn message(&self) -> String {
        match self {
            PluginError::BadRequest(msg) | PluginError::Internal(msg) => msg.clone(),
            PluginError::Driver(e) => e.to_string(),
        }
    }
}

impl IntoResponse for PluginError {
    fn into_response(self) -> Response {
        let status = match self {
            PluginError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PluginError::Driver(_) | PluginError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrResponse { err: self.message() });
        (status, body).into_response()
    }
}

impl From<crate::error::Error> for PluginError {
    fn from(err: crate::error::Error) -> Self {
        PluginError::Driver(err)
    }
}

impl From<tokio::task::JoinError> for PluginError {
    fn from(err: tokio::task::JoinError) -> Self {
        PluginError::Internal(format!("task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let resp = PluginError::BadRequest("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = PluginError::from(crate::error::Error::remote("Volume vol1 not found")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_driver_error_message_is_verbatim() {
        let err = PluginError::from(crate::error::Error::remote("Volume vol1 not found"));
        assert_eq!(err.message(), "Volume vol1 not found");
    }
}
