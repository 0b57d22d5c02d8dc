//! The local backend: everything the persistence tier serves, plus the
//! bits the controller owns itself (blob signing, cluster config, token
//! introspection, the priority reconciler trigger).

pub mod priority;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::config::Cluster;
use common::manifest::sign_manifest;
use common::model::*;
use common::options::*;
use common::{Api, ApiError, RequestContext};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::{AuthLookup, current_auth};

const LOCK_SELECT: [&str; 5] = ["uuid", "state", "priority", "auth_uuid", "locked_by_uuid"];

pub struct LocalDb {
    cluster: Arc<Cluster>,
    rails: Arc<dyn Api>,
    priority_trigger: mpsc::Sender<()>,
}

impl LocalDb {
    pub fn new(cluster: Arc<Cluster>, rails: Arc<dyn Api>, priority_trigger: mpsc::Sender<()>) -> Self {
        Self {
            cluster,
            rails,
            priority_trigger,
        }
    }

    fn sign(&self, ctx: &RequestContext, coll: &mut Collection) {
        let cfg = &self.cluster.collections;
        if !cfg.blob_signing || coll.is_trashed || coll.manifest_text.is_empty() {
            return;
        }
        let Some(token) = ctx.first_token() else {
            return;
        };
        let ttl = cfg.blob_signing_ttl.as_std();
        let mut expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        if let Some(trash_at) = coll.trash_at {
            expires = expires.min(trash_at.timestamp());
        }
        coll.manifest_text = sign_manifest(
            &coll.manifest_text,
            token,
            expires,
            ttl.as_secs(),
            cfg.blob_signing_key.as_bytes(),
        );
    }

    fn signed(&self, ctx: &RequestContext, mut coll: Collection) -> Collection {
        self.sign(ctx, &mut coll);
        coll
    }

    fn check_constraints(&self, attrs: &Map<String, Value>) -> Result<(), ApiError> {
        if self.cluster.instance_types.is_empty() {
            return Ok(());
        }
        let Some(raw) = attrs.get("runtime_constraints") else {
            return Ok(());
        };
        let rc: RuntimeConstraints = serde_json::from_value(raw.clone())?;
        let fits = self
            .cluster
            .instance_types
            .values()
            .any(|it| rc.vcpus <= it.vcpus && rc.ram <= it.ram);
        if fits {
            Ok(())
        } else {
            Err(ApiError::constraints_not_satisfiable(format!(
                "no instance type has {} VCPUs and {} bytes of RAM",
                rc.vcpus, rc.ram
            )))
        }
    }

    fn kick_priority_reconciler(&self) {
        if self.priority_trigger.try_send(()).is_err() {
            debug!("priority reconciler already pending");
        }
    }
}

// Signing needs these two fields even when the caller did not ask for them.
fn with_signing_fields(mut select: Vec<String>) -> Vec<String> {
    if select.is_empty() {
        return select;
    }
    for field in ["trash_at", "is_trashed"] {
        if !select.iter().any(|s| s == field) {
            select.insert(0, field.to_string());
        }
    }
    select
}

fn with_lock_select(mut opts: GetOptions) -> GetOptions {
    if opts.select.is_empty() {
        opts.select = LOCK_SELECT.iter().map(ToString::to_string).collect();
    }
    opts
}

fn public_config(cluster: &Cluster) -> Value {
    let remotes: Map<String, Value> = cluster
        .remote_clusters
        .iter()
        .map(|(id, remote)| {
            (
                id.clone(),
                json!({
                    "Host": remote.host,
                    "Scheme": remote.scheme,
                    "Insecure": remote.insecure,
                    "Proxy": remote.proxy,
                    "ActivateUsers": remote.activate_users,
                }),
            )
        })
        .collect();
    json!({
        "ClusterID": cluster.cluster_id,
        "Services": {
            "Controller": {"ExternalURL": cluster.services.controller.external_url},
            "Keepstore": {"ExternalURL": cluster.services.keepstore.external_url},
        },
        "RemoteClusters": remotes,
        "Login": {"LoginCluster": cluster.login.login_cluster},
        "Collections": {
            "BlobSigning": cluster.collections.blob_signing,
            "BlobSigningTTL": cluster.collections.blob_signing_ttl.to_string(),
            "DefaultReplication": cluster.collections.default_replication,
        },
        "API": {
            "MaxItemsPerResponse": cluster.api.max_items_per_response,
            "RequestTimeout": cluster.api.request_timeout.to_string(),
        },
    })
}

#[async_trait]
impl Api for LocalDb {
    async fn config_get(&self, _ctx: &RequestContext, _opts: EmptyOptions) -> Result<Value, ApiError> {
        Ok(public_config(&self.cluster))
    }
    async fn vocabulary_get(&self, ctx: &RequestContext, opts: EmptyOptions) -> Result<Value, ApiError> {
        self.rails.vocabulary_get(ctx, opts).await
    }
    async fn discovery_document(&self, ctx: &RequestContext, opts: EmptyOptions) -> Result<DiscoveryDocument, ApiError> {
        self.rails.discovery_document(ctx, opts).await
    }
    async fn login(&self, ctx: &RequestContext, opts: LoginOptions) -> Result<LoginResponse, ApiError> {
        self.rails.login(ctx, opts).await
    }
    async fn logout(&self, ctx: &RequestContext, opts: LogoutOptions) -> Result<LogoutResponse, ApiError> {
        self.rails.logout(ctx, opts).await
    }

    async fn collection_create(&self, ctx: &RequestContext, mut opts: CreateOptions) -> Result<Collection, ApiError> {
        opts.select = with_signing_fields(opts.select);
        let coll = self.rails.collection_create(ctx, opts).await?;
        Ok(self.signed(ctx, coll))
    }
    async fn collection_update(&self, ctx: &RequestContext, mut opts: UpdateOptions) -> Result<Collection, ApiError> {
        opts.select = with_signing_fields(opts.select);
        let coll = self.rails.collection_update(ctx, opts).await?;
        Ok(self.signed(ctx, coll))
    }
    async fn collection_get(&self, ctx: &RequestContext, mut opts: GetOptions) -> Result<Collection, ApiError> {
        opts.select = with_signing_fields(opts.select);
        let coll = self.rails.collection_get(ctx, opts).await?;
        Ok(self.signed(ctx, coll))
    }
    async fn collection_list(&self, ctx: &RequestContext, mut opts: ListOptions) -> Result<List<Collection>, ApiError> {
        opts.select = with_signing_fields(opts.select);
        let mut list = self.rails.collection_list(ctx, opts).await?;
        for coll in &mut list.items {
            self.sign(ctx, coll);
        }
        Ok(list)
    }
    async fn collection_provenance(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Map<String, Value>, ApiError> {
        self.rails.collection_provenance(ctx, opts).await
    }
    async fn collection_used_by(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Map<String, Value>, ApiError> {
        self.rails.collection_used_by(ctx, opts).await
    }
    async fn collection_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Collection, ApiError> {
        self.rails.collection_delete(ctx, opts).await
    }
    async fn collection_trash(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Collection, ApiError> {
        self.rails.collection_trash(ctx, opts).await
    }
    async fn collection_untrash(&self, ctx: &RequestContext, opts: UntrashOptions) -> Result<Collection, ApiError> {
        let coll = self.rails.collection_untrash(ctx, opts).await?;
        Ok(self.signed(ctx, coll))
    }

    async fn container_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Container, ApiError> {
        self.rails.container_create(ctx, opts).await
    }
    async fn container_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Container, ApiError> {
        let ctr = self.rails.container_update(ctx, opts).await?;
        self.kick_priority_reconciler();
        Ok(ctr)
    }
    async fn container_priority_update(&self, ctx: &RequestContext, opts: UpdatePriorityOptions) -> Result<Container, ApiError> {
        self.rails.container_priority_update(ctx, opts).await
    }
    async fn container_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Container, ApiError> {
        self.rails.container_get(ctx, opts).await
    }
    async fn container_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Container>, ApiError> {
        self.rails.container_list(ctx, opts).await
    }
    async fn container_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Container, ApiError> {
        self.rails.container_delete(ctx, opts).await
    }
    async fn container_lock(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Container, ApiError> {
        self.rails.container_lock(ctx, with_lock_select(opts)).await
    }
    async fn container_unlock(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Container, ApiError> {
        self.rails.container_unlock(ctx, with_lock_select(opts)).await
    }

    async fn container_request_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<ContainerRequest, ApiError> {
        self.check_constraints(&opts.attrs)?;
        self.rails.container_request_create(ctx, opts).await
    }
    async fn container_request_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<ContainerRequest, ApiError> {
        self.check_constraints(&opts.attrs)?;
        self.rails.container_request_update(ctx, opts).await
    }
    async fn container_request_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<ContainerRequest, ApiError> {
        self.rails.container_request_get(ctx, opts).await
    }
    async fn container_request_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<ContainerRequest>, ApiError> {
        self.rails.container_request_list(ctx, opts).await
    }
    async fn container_request_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<ContainerRequest, ApiError> {
        self.rails.container_request_delete(ctx, opts).await
    }

    async fn group_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Group, ApiError> {
        self.rails.group_create(ctx, opts).await
    }
    async fn group_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Group, ApiError> {
        self.rails.group_update(ctx, opts).await
    }
    async fn group_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Group, ApiError> {
        self.rails.group_get(ctx, opts).await
    }
    async fn group_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Group>, ApiError> {
        self.rails.group_list(ctx, opts).await
    }
    async fn group_contents(&self, ctx: &RequestContext, opts: GroupContentsOptions) -> Result<ObjectList, ApiError> {
        self.rails.group_contents(ctx, opts).await
    }
    async fn group_shared(&self, ctx: &RequestContext, opts: ListOptions) -> Result<ObjectList, ApiError> {
        self.rails.group_shared(ctx, opts).await
    }
    async fn group_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Group, ApiError> {
        self.rails.group_delete(ctx, opts).await
    }
    async fn group_trash(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Group, ApiError> {
        self.rails.group_trash(ctx, opts).await
    }
    async fn group_untrash(&self, ctx: &RequestContext, opts: UntrashOptions) -> Result<Group, ApiError> {
        self.rails.group_untrash(ctx, opts).await
    }

    async fn link_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Link, ApiError> {
        self.rails.link_create(ctx, opts).await
    }
    async fn link_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Link, ApiError> {
        self.rails.link_update(ctx, opts).await
    }
    async fn link_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Link, ApiError> {
        self.rails.link_get(ctx, opts).await
    }
    async fn link_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Link>, ApiError> {
        self.rails.link_list(ctx, opts).await
    }
    async fn link_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Link, ApiError> {
        self.rails.link_delete(ctx, opts).await
    }

    async fn specimen_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Specimen, ApiError> {
        self.rails.specimen_create(ctx, opts).await
    }
    async fn specimen_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Specimen, ApiError> {
        self.rails.specimen_update(ctx, opts).await
    }
    async fn specimen_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Specimen, ApiError> {
        self.rails.specimen_get(ctx, opts).await
    }
    async fn specimen_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Specimen>, ApiError> {
        self.rails.specimen_list(ctx, opts).await
    }
    async fn specimen_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Specimen, ApiError> {
        self.rails.specimen_delete(ctx, opts).await
    }

    async fn sys_trash_sweep(&self, ctx: &RequestContext, opts: EmptyOptions) -> Result<Value, ApiError> {
        self.rails.sys_trash_sweep(ctx, opts).await
    }

    async fn user_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<User, ApiError> {
        self.rails.user_create(ctx, opts).await
    }
    async fn user_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<User, ApiError> {
        self.rails.user_update(ctx, opts).await
    }
    async fn user_merge(&self, ctx: &RequestContext, opts: UserMergeOptions) -> Result<User, ApiError> {
        self.rails.user_merge(ctx, opts).await
    }
    async fn user_activate(&self, ctx: &RequestContext, opts: UserActivateOptions) -> Result<User, ApiError> {
        self.rails.user_activate(ctx, opts).await
    }
    async fn user_setup(&self, ctx: &RequestContext, opts: UserSetupOptions) -> Result<Map<String, Value>, ApiError> {
        self.rails.user_setup(ctx, opts).await
    }
    async fn user_unsetup(&self, ctx: &RequestContext, opts: GetOptions) -> Result<User, ApiError> {
        self.rails.user_unsetup(ctx, opts).await
    }
    async fn user_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<User, ApiError> {
        self.rails.user_get(ctx, opts).await
    }
    async fn user_get_current(&self, ctx: &RequestContext, opts: GetOptions) -> Result<User, ApiError> {
        self.rails.user_get_current(ctx, opts).await
    }
    async fn user_get_system(&self, ctx: &RequestContext, opts: GetOptions) -> Result<User, ApiError> {
        self.rails.user_get_system(ctx, opts).await
    }
    async fn user_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<User>, ApiError> {
        self.rails.user_list(ctx, opts).await
    }
    async fn user_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<User, ApiError> {
        self.rails.user_delete(ctx, opts).await
    }
    async fn user_batch_update(&self, ctx: &RequestContext, opts: UserBatchUpdateOptions) -> Result<List<User>, ApiError> {
        self.rails.user_batch_update(ctx, opts).await
    }
    async fn user_authenticate(&self, ctx: &RequestContext, opts: UserAuthenticateOptions) -> Result<ApiClientAuthorization, ApiError> {
        self.rails.user_authenticate(ctx, opts).await
    }

    async fn api_client_authorization_current(&self, ctx: &RequestContext, opts: GetOptions) -> Result<ApiClientAuthorization, ApiError> {
        if ctx.value::<AuthLookup>().is_none() {
            return self.rails.api_client_authorization_current(ctx, opts).await;
        }
        let auth = current_auth(ctx).await?;
        Ok(auth.authz)
    }
    async fn api_client_authorization_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<ApiClientAuthorization, ApiError> {
        self.rails.api_client_authorization_create(ctx, opts).await
    }
    async fn api_client_authorization_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<ApiClientAuthorization>, ApiError> {
        self.rails.api_client_authorization_list(ctx, opts).await
    }

    async fn keep_service_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<KeepService>, ApiError> {
        self.rails.keep_service_list(ctx, opts).await
    }
}

#[cfg(test)]
#[path = "localdb_tests.rs"]
mod tests;
