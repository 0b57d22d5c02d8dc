pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod manifest;
pub mod model;
pub mod options;
pub mod token;

pub use api::{Api, Endpoint, endpoint};
pub use context::RequestContext;
pub use error::ApiError;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub health: String,
}

impl HealthStatus {
    pub fn ok() -> Self {
        Self {
            health: "OK".to_string(),
        }
    }
}
