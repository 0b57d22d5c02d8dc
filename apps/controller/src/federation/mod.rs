//! Cluster-aware dispatch: every call goes to the local backend, a single
//! remote, or several of them, depending on the object it names.

pub mod list;
pub mod salt;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use client_sdk::RpcConn;
use common::config::Cluster;
use common::ids::{UUID_LEN, cluster_of};
use common::manifest::{portable_data_hash, rewrite_manifest};
use common::model::*;
use common::options::*;
use common::token::parse_v2;
use common::{Api, ApiError, RequestContext};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::auth::mint_token;
use salt::SaltedTokens;

const USER_CACHE_ATTRS: [&str; 10] = [
    "created_at",
    "email",
    "first_name",
    "is_active",
    "is_admin",
    "is_invited",
    "last_name",
    "modified_at",
    "prefs",
    "username",
];

pub struct Remote {
    pub api: Arc<dyn Api>,
    pub base_url: String,
}

pub struct Federation {
    cluster: Arc<Cluster>,
    local: Arc<dyn Api>,
    remotes: HashMap<String, Remote>,
}

impl Federation {
    pub fn new(cluster: Arc<Cluster>, local: Arc<dyn Api>) -> Result<Self, ApiError> {
        let mut remotes = HashMap::new();
        for (id, remote) in cluster.proxy_remotes() {
            let base_url = remote.base_url();
            let tokens = Arc::new(SaltedTokens::new(
                &cluster.cluster_id,
                &cluster.login.login_cluster,
                id,
                Arc::clone(&local),
            ));
            let conn = RpcConn::new(id, &base_url, remote.insecure, tokens)?;
            debug!(remote = %id, url = %base_url, "configured remote cluster");
            remotes.insert(
                id.clone(),
                Remote {
                    api: Arc::new(conn),
                    base_url,
                },
            );
        }
        Ok(Self::with_remotes(cluster, local, remotes))
    }

    pub fn with_remotes(
        cluster: Arc<Cluster>,
        local: Arc<dyn Api>,
        remotes: HashMap<String, Remote>,
    ) -> Self {
        Self {
            cluster,
            local,
            remotes,
        }
    }

    fn remote_for(&self, id: &str) -> Option<Arc<dyn Api>> {
        let cluster = match id.len() {
            UUID_LEN => cluster_of(id),
            5 => id,
            _ => return None,
        };
        if cluster == self.cluster.cluster_id {
            return None;
        }
        self.remotes.get(cluster).map(|r| Arc::clone(&r.api))
    }

    fn backend(&self, id: &str) -> Arc<dyn Api> {
        self.remote_for(id)
            .unwrap_or_else(|| Arc::clone(&self.local))
    }

    fn login_cluster(&self) -> Option<&str> {
        let id = self.cluster.login.login_cluster.as_str();
        (!id.is_empty() && id != self.cluster.cluster_id).then_some(id)
    }

    fn forwarded_for(&self, previous: &str) -> String {
        format!("{}-{previous}", self.cluster.cluster_id)
    }

    /// Call the local backend; on 404, ask every remote concurrently and
    /// take the first success. `call` gets `""` as the remote id for the
    /// local backend.
    async fn try_local_then_remotes<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        fan_out: bool,
        call: F,
    ) -> Result<T, ApiError>
    where
        T: Send,
        F: Fn(String, Arc<dyn Api>, RequestContext) -> Fut + Sync,
        Fut: Future<Output = Result<T, ApiError>> + Send,
    {
        match call(String::new(), Arc::clone(&self.local), ctx.clone()).await {
            Err(err) if err.is_not_found() && fan_out => {}
            other => return other,
        }

        let fanout = ctx.child();
        let mut pending: FuturesUnordered<_> = self
            .remotes
            .iter()
            .map(|(id, remote)| call(id.clone(), Arc::clone(&remote.api), fanout.clone()))
            .collect();
        let mut errors = Vec::new();
        while let Some(result) = pending.next().await {
            match result {
                Ok(value) => {
                    fanout.cancel.cancel();
                    return Ok(value);
                }
                Err(err) => errors.push(err),
            }
        }
        Err(mix_errors(errors))
    }

    async fn cache_users(
        &self,
        ctx: &RequestContext,
        users: &[User],
        select: &[String],
    ) -> Result<(), ApiError> {
        let Some(login_cluster) = self.login_cluster() else {
            return Ok(());
        };
        let now = Value::String(Utc::now().to_rfc3339());
        let mut updates = Map::new();
        for user in users.iter().filter(|u| cluster_of(&u.uuid) == login_cluster) {
            let Value::Object(full) = serde_json::to_value(user)
                .map_err(|err| ApiError::internal(format!("encoding user {}: {err}", user.uuid)))?
            else {
                continue;
            };
            let mut attrs = Map::new();
            for key in USER_CACHE_ATTRS {
                if !select.is_empty() && !select.iter().any(|s| s == key) {
                    continue;
                }
                if let Some(value) = full.get(key) {
                    attrs.insert(key.to_string(), value.clone());
                }
            }
            for key in ["created_at", "modified_at"] {
                if attrs.get(key).is_none_or(Value::is_null) {
                    attrs.insert(key.to_string(), now.clone());
                }
            }
            updates.insert(user.uuid.clone(), Value::Object(attrs));
        }
        if updates.is_empty() {
            return Ok(());
        }

        let count = updates.len();
        let root = ctx.with_tokens(vec![self.cluster.system_root_token.clone()]);
        self.local
            .user_batch_update(&root, UserBatchUpdateOptions { updates })
            .await
            .map_err(|err| ApiError::internal(format!("error updating local user records: {err}")))?;
        debug!(count, login_cluster, "cached users from login cluster");
        Ok(())
    }

    fn logout_issuer(&self, ctx: &RequestContext) -> String {
        if let Some(id) = self.login_cluster() {
            return id.to_string();
        }
        ctx.first_token()
            .and_then(parse_v2)
            .map(|t| cluster_of(t.uuid).to_string())
            .unwrap_or_default()
    }
}

// All 404 → 404; anything retryable → 502; otherwise 422.
fn mix_errors(errors: Vec<ApiError>) -> ApiError {
    if errors.iter().all(ApiError::is_not_found) {
        return ApiError::not_found("not found");
    }
    let status = if errors.iter().any(ApiError::is_retryable) {
        502
    } else {
        422
    };
    let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
    ApiError::new(status, format!("errors: [{}]", joined.join(" ")))
}

#[async_trait]
impl Api for Federation {
    async fn config_get(&self, ctx: &RequestContext, opts: EmptyOptions) -> Result<Value, ApiError> {
        self.local.config_get(ctx, opts).await
    }
    async fn vocabulary_get(&self, ctx: &RequestContext, opts: EmptyOptions) -> Result<Value, ApiError> {
        self.local.vocabulary_get(ctx, opts).await
    }
    async fn discovery_document(&self, ctx: &RequestContext, opts: EmptyOptions) -> Result<DiscoveryDocument, ApiError> {
        self.local.discovery_document(ctx, opts).await
    }

    async fn login(&self, ctx: &RequestContext, opts: LoginOptions) -> Result<LoginResponse, ApiError> {
        let Some(id) = self.login_cluster() else {
            return self.local.login(ctx, opts).await;
        };
        let remote = self.remotes.get(id).ok_or_else(|| {
            ApiError::internal(format!(
                "configuration problem: designated login cluster {id:?} is not defined"
            ))
        })?;
        let mut target = Url::parse(&remote.base_url)
            .and_then(|base| base.join("login"))
            .map_err(|err| ApiError::internal(format!("internal error getting redirect target: {err}")))?;
        target
            .query_pairs_mut()
            .append_pair("remote", &opts.remote)
            .append_pair("return_to", &opts.return_to);
        Ok(LoginResponse {
            redirect_location: target.to_string(),
            ..Default::default()
        })
    }

    async fn logout(&self, ctx: &RequestContext, opts: LogoutOptions) -> Result<LogoutResponse, ApiError> {
        let issuer = self.logout_issuer(ctx);
        match self.remotes.get(&issuer) {
            Some(remote) if issuer != self.cluster.cluster_id => {
                debug!(issuer = %issuer, "forwarding logout");
                remote.api.logout(ctx, opts).await
            }
            _ => self.local.logout(ctx, opts).await,
        }
    }

    async fn collection_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Collection, ApiError> {
        self.backend(&opts.cluster_id).collection_create(ctx, opts).await
    }
    async fn collection_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Collection, ApiError> {
        self.backend(&opts.uuid).collection_update(ctx, opts).await
    }

    async fn collection_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Collection, ApiError> {
        if opts.uuid.len() == UUID_LEN {
            let Some(remote) = self.remote_for(&opts.uuid) else {
                return self.local.collection_get(ctx, opts).await;
            };
            let remote_id = cluster_of(&opts.uuid).to_string();
            let mut coll = remote.collection_get(ctx, opts).await?;
            coll.manifest_text = rewrite_manifest(&coll.manifest_text, &remote_id);
            return Ok(coll);
        }

        let wanted = opts.uuid.clone();
        let fan_out = opts.forwarded_for.is_empty();
        let opts = &opts;
        let wanted = &wanted;
        self.try_local_then_remotes(ctx, fan_out, |remote_id, backend, ctx| async move {
            let mut opts = opts.clone();
            if !remote_id.is_empty() {
                opts.forwarded_for = self.forwarded_for(&opts.forwarded_for);
            }
            let mut coll = backend.collection_get(&ctx, opts).await?;
            let pdh = portable_data_hash(&coll.manifest_text);
            if pdh != *wanted && !wanted.starts_with(&format!("{pdh}+")) {
                let err = ApiError::bad_gateway(format!(
                    "bad portable data hash {pdh:?} received from remote {remote_id:?} (expected {wanted:?})"
                ));
                warn!(error = %err, "rejecting collection");
                return Err(err);
            }
            if !remote_id.is_empty() {
                coll.manifest_text = rewrite_manifest(&coll.manifest_text, &remote_id);
            }
            Ok(coll)
        })
        .await
    }

    async fn collection_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Collection>, ApiError> {
        self.split_list(ctx, opts, |api, ctx, opts| async move { api.collection_list(&ctx, opts).await })
            .await
    }
    async fn collection_provenance(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Map<String, Value>, ApiError> {
        self.backend(&opts.uuid).collection_provenance(ctx, opts).await
    }
    async fn collection_used_by(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Map<String, Value>, ApiError> {
        self.backend(&opts.uuid).collection_used_by(ctx, opts).await
    }
    async fn collection_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Collection, ApiError> {
        self.backend(&opts.uuid).collection_delete(ctx, opts).await
    }
    async fn collection_trash(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Collection, ApiError> {
        self.backend(&opts.uuid).collection_trash(ctx, opts).await
    }
    async fn collection_untrash(&self, ctx: &RequestContext, opts: UntrashOptions) -> Result<Collection, ApiError> {
        self.backend(&opts.uuid).collection_untrash(ctx, opts).await
    }

    async fn container_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Container, ApiError> {
        self.backend(&opts.cluster_id).container_create(ctx, opts).await
    }
    async fn container_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Container, ApiError> {
        self.backend(&opts.uuid).container_update(ctx, opts).await
    }
    async fn container_priority_update(&self, ctx: &RequestContext, opts: UpdatePriorityOptions) -> Result<Container, ApiError> {
        self.backend(&opts.uuid).container_priority_update(ctx, opts).await
    }
    async fn container_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Container, ApiError> {
        self.backend(&opts.uuid).container_get(ctx, opts).await
    }
    async fn container_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Container>, ApiError> {
        self.split_list(ctx, opts, |api, ctx, opts| async move { api.container_list(&ctx, opts).await })
            .await
    }
    async fn container_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Container, ApiError> {
        self.backend(&opts.uuid).container_delete(ctx, opts).await
    }
    async fn container_lock(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Container, ApiError> {
        self.backend(&opts.uuid).container_lock(ctx, opts).await
    }
    async fn container_unlock(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Container, ApiError> {
        self.backend(&opts.uuid).container_unlock(ctx, opts).await
    }

    async fn container_request_create(&self, ctx: &RequestContext, mut opts: CreateOptions) -> Result<ContainerRequest, ApiError> {
        let Some(remote) = self.remote_for(&opts.cluster_id) else {
            return self.local.container_request_create(ctx, opts).await;
        };
        if !opts.attrs.contains_key("runtime_token") {
            let aca = self
                .local
                .api_client_authorization_current(ctx, GetOptions::default())
                .await?;
            if !aca.has_full_scope() {
                return Err(ApiError::forbidden("token scope is not [all]"));
            }
            let token = if cluster_of(&aca.uuid) == self.cluster.cluster_id {
                let ttl = chrono::Duration::from_std(self.cluster.collections.blob_signing_ttl.as_std())
                    .map_err(|err| ApiError::internal(format!("invalid BlobSigningTTL: {err}")))?;
                mint_token(ctx, &self.cluster.cluster_id, &aca.owner_uuid, Utc::now() + ttl)
                    .await?
                    .token_v2()
            } else {
                aca.token_v2()
            };
            opts.attrs.insert("runtime_token".to_string(), Value::String(token));
        }
        remote.container_request_create(ctx, opts).await
    }
    async fn container_request_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<ContainerRequest, ApiError> {
        self.backend(&opts.uuid).container_request_update(ctx, opts).await
    }
    async fn container_request_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<ContainerRequest, ApiError> {
        self.backend(&opts.uuid).container_request_get(ctx, opts).await
    }
    async fn container_request_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<ContainerRequest>, ApiError> {
        self.split_list(ctx, opts, |api, ctx, opts| async move {
            api.container_request_list(&ctx, opts).await
        })
        .await
    }
    async fn container_request_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<ContainerRequest, ApiError> {
        self.backend(&opts.uuid).container_request_delete(ctx, opts).await
    }

    async fn group_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Group, ApiError> {
        self.backend(&opts.cluster_id).group_create(ctx, opts).await
    }
    async fn group_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Group, ApiError> {
        self.backend(&opts.uuid).group_update(ctx, opts).await
    }
    async fn group_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Group, ApiError> {
        self.backend(&opts.uuid).group_get(ctx, opts).await
    }
    async fn group_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Group>, ApiError> {
        self.split_list(ctx, opts, |api, ctx, opts| async move { api.group_list(&ctx, opts).await })
            .await
    }
    async fn group_contents(&self, ctx: &RequestContext, opts: GroupContentsOptions) -> Result<ObjectList, ApiError> {
        let backend = if opts.cluster_id.is_empty() {
            self.backend(&opts.uuid)
        } else {
            self.backend(&opts.cluster_id)
        };
        backend.group_contents(ctx, opts).await
    }
    async fn group_shared(&self, ctx: &RequestContext, opts: ListOptions) -> Result<ObjectList, ApiError> {
        self.backend(&opts.cluster_id).group_shared(ctx, opts).await
    }
    async fn group_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Group, ApiError> {
        self.backend(&opts.uuid).group_delete(ctx, opts).await
    }
    async fn group_trash(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Group, ApiError> {
        self.backend(&opts.uuid).group_trash(ctx, opts).await
    }
    async fn group_untrash(&self, ctx: &RequestContext, opts: UntrashOptions) -> Result<Group, ApiError> {
        self.backend(&opts.uuid).group_untrash(ctx, opts).await
    }

    async fn link_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Link, ApiError> {
        self.backend(&opts.cluster_id).link_create(ctx, opts).await
    }
    async fn link_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Link, ApiError> {
        self.backend(&opts.uuid).link_update(ctx, opts).await
    }
    async fn link_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Link, ApiError> {
        self.backend(&opts.uuid).link_get(ctx, opts).await
    }
    async fn link_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Link>, ApiError> {
        self.split_list(ctx, opts, |api, ctx, opts| async move { api.link_list(&ctx, opts).await })
            .await
    }
    async fn link_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Link, ApiError> {
        self.backend(&opts.uuid).link_delete(ctx, opts).await
    }

    async fn specimen_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Specimen, ApiError> {
        self.backend(&opts.cluster_id).specimen_create(ctx, opts).await
    }
    async fn specimen_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Specimen, ApiError> {
        self.backend(&opts.uuid).specimen_update(ctx, opts).await
    }
    async fn specimen_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Specimen, ApiError> {
        self.backend(&opts.uuid).specimen_get(ctx, opts).await
    }
    async fn specimen_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Specimen>, ApiError> {
        self.split_list(ctx, opts, |api, ctx, opts| async move { api.specimen_list(&ctx, opts).await })
            .await
    }
    async fn specimen_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Specimen, ApiError> {
        self.backend(&opts.uuid).specimen_delete(ctx, opts).await
    }

    async fn sys_trash_sweep(&self, ctx: &RequestContext, opts: EmptyOptions) -> Result<Value, ApiError> {
        self.local.sys_trash_sweep(ctx, opts).await
    }

    async fn user_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<User, ApiError> {
        self.backend(&opts.cluster_id).user_create(ctx, opts).await
    }
    async fn user_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<User, ApiError> {
        if opts.bypass_federation {
            return self.local.user_update(ctx, opts).await;
        }
        self.backend(&opts.uuid).user_update(ctx, opts).await
    }
    async fn user_merge(&self, ctx: &RequestContext, opts: UserMergeOptions) -> Result<User, ApiError> {
        self.backend(&opts.old_user_uuid).user_merge(ctx, opts).await
    }
    async fn user_activate(&self, ctx: &RequestContext, opts: UserActivateOptions) -> Result<User, ApiError> {
        self.backend(&opts.uuid).user_activate(ctx, opts).await
    }
    async fn user_setup(&self, ctx: &RequestContext, opts: UserSetupOptions) -> Result<Map<String, Value>, ApiError> {
        self.backend(&opts.uuid).user_setup(ctx, opts).await
    }
    async fn user_unsetup(&self, ctx: &RequestContext, opts: GetOptions) -> Result<User, ApiError> {
        self.backend(&opts.uuid).user_unsetup(ctx, opts).await
    }

    async fn user_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<User, ApiError> {
        if !opts.bypass_federation
            && let Some(id) = self.login_cluster()
            && let Some(remote) = self.remote_for(id)
        {
            let select = opts.select.clone();
            let user = remote.user_get(ctx, opts).await?;
            self.cache_users(ctx, std::slice::from_ref(&user), &select).await?;
            return Ok(user);
        }
        self.backend(&opts.uuid).user_get(ctx, opts).await
    }
    async fn user_get_current(&self, ctx: &RequestContext, opts: GetOptions) -> Result<User, ApiError> {
        self.backend(&opts.uuid).user_get_current(ctx, opts).await
    }
    async fn user_get_system(&self, ctx: &RequestContext, opts: GetOptions) -> Result<User, ApiError> {
        self.local.user_get_system(ctx, opts).await
    }

    async fn user_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<User>, ApiError> {
        if !opts.bypass_federation
            && let Some(id) = self.login_cluster()
            && let Some(remote) = self.remote_for(id)
        {
            let select = opts.select.clone();
            let list = remote.user_list(ctx, opts).await?;
            self.cache_users(ctx, &list.items, &select).await?;
            return Ok(list);
        }
        self.split_list(ctx, opts, |api, ctx, opts| async move { api.user_list(&ctx, opts).await })
            .await
    }
    async fn user_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<User, ApiError> {
        self.backend(&opts.uuid).user_delete(ctx, opts).await
    }
    async fn user_batch_update(&self, ctx: &RequestContext, opts: UserBatchUpdateOptions) -> Result<List<User>, ApiError> {
        self.local.user_batch_update(ctx, opts).await
    }
    async fn user_authenticate(&self, ctx: &RequestContext, opts: UserAuthenticateOptions) -> Result<ApiClientAuthorization, ApiError> {
        self.local.user_authenticate(ctx, opts).await
    }

    async fn api_client_authorization_current(&self, ctx: &RequestContext, opts: GetOptions) -> Result<ApiClientAuthorization, ApiError> {
        self.backend(&opts.uuid).api_client_authorization_current(ctx, opts).await
    }
    async fn api_client_authorization_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<ApiClientAuthorization, ApiError> {
        self.backend(&opts.cluster_id).api_client_authorization_create(ctx, opts).await
    }
    async fn api_client_authorization_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<ApiClientAuthorization>, ApiError> {
        self.split_list(ctx, opts, |api, ctx, opts| async move {
            api.api_client_authorization_list(&ctx, opts).await
        })
        .await
    }

    async fn keep_service_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<KeepService>, ApiError> {
        self.local.keep_service_list(ctx, opts).await
    }
}

#[cfg(test)]
#[path = "federation_tests.rs"]
mod tests;
