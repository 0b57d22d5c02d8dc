use std::sync::Arc;

use async_trait::async_trait;
use client_sdk::TokenProvider;
use common::ids::cluster_of;
use common::options::GetOptions;
use common::token::{TokenError, forwarding_token};
use common::{Api, ApiError, RequestContext};

pub struct SaltedTokens {
    local_id: String,
    login_cluster: String,
    remote_id: String,
    local: Arc<dyn Api>,
}

impl SaltedTokens {
    pub fn new(
        local_id: impl Into<String>,
        login_cluster: impl Into<String>,
        remote_id: impl Into<String>,
        local: Arc<dyn Api>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            login_cluster: login_cluster.into(),
            remote_id: remote_id.into(),
            local,
        }
    }

    fn is_locally_issued(&self, token: &str) -> bool {
        let prefix = format!("v2/{}-", self.local_id);
        token.starts_with(&prefix)
            && !token.starts_with(&format!("{prefix}gj3su-anonymouspublic/"))
    }

    async fn salt_one(&self, ctx: &RequestContext, token: &str) -> Result<String, ApiError> {
        match forwarding_token(token, &self.remote_id) {
            Ok(token) => Ok(token),
            Err(TokenError::Obsolete) => {
                let ctx = ctx.with_tokens(vec![token.to_string()]);
                let aca = match self
                    .local
                    .api_client_authorization_current(&ctx, GetOptions::default())
                    .await
                {
                    Ok(aca) => aca,
                    Err(err) if err.http_status() == 401 => return Ok(token.to_string()),
                    Err(err) => return Err(err),
                };
                if cluster_of(&aca.uuid) == self.remote_id {
                    return Ok(aca.token_v2());
                }
                Ok(forwarding_token(&aca.token_v2(), &self.remote_id)?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl TokenProvider for SaltedTokens {
    async fn tokens(&self, ctx: &RequestContext) -> Result<Vec<String>, ApiError> {
        if ctx.tokens.is_empty() {
            return Err(ApiError::unauthorized("no token provided"));
        }
        let mut out = Vec::with_capacity(ctx.tokens.len());
        for token in &ctx.tokens {
            if self.remote_id == self.login_cluster && self.is_locally_issued(token) {
                return Err(ApiError::unauthorized(format!(
                    "cannot use a locally issued token to forward a request to our login cluster ({})",
                    self.remote_id
                )));
            }
            out.push(self.salt_one(ctx, token).await?);
        }
        Ok(out)
    }
}
