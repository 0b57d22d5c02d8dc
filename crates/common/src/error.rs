use serde::{Deserialize, Serialize};

use crate::token::TokenError;

/// Error returned by every API call. Serialises to the `{"errors":[...]}`
/// envelope; the status travels out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{}", .errors.join("; "))]
pub struct ApiError {
    #[serde(skip, default = "default_status")]
    pub status: u16,
    pub errors: Vec<String>,
}

fn default_status() -> u16 {
    500
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            errors: vec![message.into()],
        }
    }

    pub fn with_errors(status: u16, errors: Vec<String>) -> Self {
        Self { status, errors }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(422, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn not_implemented(method: &str) -> Self {
        Self::new(501, format!("{method} is not implemented"))
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(502, message)
    }

    pub fn constraints_not_satisfiable(message: impl Into<String>) -> Self {
        Self::new(422, format!("constraints not satisfiable: {}", message.into()))
    }

    pub fn http_status(&self) -> u16 {
        self.status
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub fn is_retryable(&self) -> bool {
        self.status >= 500 || self.status == 429
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::BadFormat | TokenError::Obsolete => ApiError::unauthorized(err.to_string()),
            TokenError::Salted => ApiError::forbidden(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::bad_request(err.to_string())
    }
}
