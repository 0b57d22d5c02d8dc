use std::sync::Arc;

use async_trait::async_trait;
use common::{ApiError, RequestContext};

mod conn;

pub use conn::RpcConn;

/// Supplies the bearer tokens for one outgoing call. The first token is the
/// caller's credential; any others are sent as `reader_tokens`.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn tokens(&self, ctx: &RequestContext) -> Result<Vec<String>, ApiError>;
}

pub struct ContextTokens;

#[async_trait]
impl TokenProvider for ContextTokens {
    async fn tokens(&self, ctx: &RequestContext) -> Result<Vec<String>, ApiError> {
        Ok(ctx.tokens.clone())
    }
}

pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn tokens(&self, _ctx: &RequestContext) -> Result<Vec<String>, ApiError> {
        Ok(vec![self.0.clone()])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSettings {
    pub api_host: String,
    pub api_token: String,
    pub insecure: bool,
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl EnvSettings {
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ApiError> {
        let api_host = lookup("ARVADOS_API_HOST")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::internal("ARVADOS_API_HOST is not set"))?;
        Ok(Self {
            api_host,
            api_token: lookup("ARVADOS_API_TOKEN").unwrap_or_default(),
            insecure: lookup("ARVADOS_API_HOST_INSECURE")
                .as_deref()
                .is_some_and(truthy),
        })
    }

    pub fn base_url(&self) -> String {
        if self.api_host.contains("://") {
            self.api_host.clone()
        } else {
            format!("https://{}", self.api_host)
        }
    }

    pub fn connect(&self, cluster_id: &str) -> Result<RpcConn, ApiError> {
        RpcConn::new(
            cluster_id,
            &self.base_url(),
            self.insecure,
            Arc::new(StaticToken(self.api_token.clone())),
        )
    }
}
