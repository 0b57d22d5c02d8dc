//! One balancing run: find the storage nodes, learn where every block is
//! and how many copies it should have, then tell the nodes what to pull
//! and what to trash.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use balance_core::rendezvous::fingerprint;
use balance_core::{BalanceStats, BlockStateMap, ChangeSet, MountSlot, ServiceSlot, compute_change_sets};
use chrono::Utc;
use common::config::KeepBalanceConfig;
use common::ids::new_request_id;
use common::manifest::block_digests;
use common::model::{Collection, KeepMount, KeepService};
use common::options::{EmptyOptions, Filter, GetOptions, ListOptions};
use common::{Api, RequestContext};
use futures::future::{join_all, try_join_all};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::collections;
use crate::error::BalanceError;
use crate::keep_service::KeepClient;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub commit_pulls: bool,
    pub commit_trash: bool,
    pub dump: bool,
    pub chunk_prefix: String,
    pub safe_rendezvous_state: String,
}

#[derive(Debug, Default)]
pub struct RunOutcome {
    pub stats: BalanceStats,
    pub collections: usize,
    pub dump: Vec<String>,
}

struct CurrentState {
    blocks: Arc<BlockStateMap>,
    min_mtime: i64,
    default_replication: i64,
    collections: usize,
    deferred: Vec<String>,
}

pub struct Balancer {
    api: Arc<dyn Api>,
    keep: KeepClient,
    config: KeepBalanceConfig,
    root_token: String,
}

impl Balancer {
    pub fn new(api: Arc<dyn Api>, keep: KeepClient, config: KeepBalanceConfig, root_token: impl Into<String>) -> Self {
        Self {
            api,
            keep,
            config,
            root_token: root_token.into(),
        }
    }

    /// Run every phase once. `opts.safe_rendezvous_state` is updated as
    /// soon as trash lists have been cleared, even if a later phase fails.
    pub async fn run(&self, opts: &mut RunOptions) -> Result<RunOutcome> {
        let started = Instant::now();
        let mut ctx = RequestContext::with_token(self.root_token.clone());
        ctx.request_id = new_request_id();

        let services = self.keep_services(&ctx).await?;
        self.check_sanity_early(&ctx, &services).await?;
        let mounts = self.mounts(&services).await?;

        let state = fingerprint(&services);
        if opts.commit_trash && state != opts.safe_rendezvous_state {
            if !opts.safe_rendezvous_state.is_empty() {
                info!("keep service list has changed since last run");
            }
            info!("clearing existing trash lists, in case the new rendezvous order differs from previous run");
            commit(
                "clear trash list",
                &services,
                services.iter().map(|svc| self.keep.send_trashes(svc, Vec::new())),
            )
            .await?;
            info!(services = services.len(), "trash lists cleared");
            opts.safe_rendezvous_state = state;
        }

        let current = self
            .current_state(&ctx, &services, &mounts, &opts.chunk_prefix)
            .await?;

        let change_sets: Arc<Vec<ChangeSet>> =
            Arc::new(services.iter().map(|_| ChangeSet::default()).collect());
        let slots: Vec<ServiceSlot> = services
            .iter()
            .map(|svc| ServiceSlot {
                uuid: svc.uuid.clone(),
                url_base: svc.url_base(),
            })
            .collect();
        let workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let mount_count = mounts.len();
        let compute_started = Instant::now();
        let computed = {
            let blocks = Arc::clone(&current.blocks);
            let change_sets = Arc::clone(&change_sets);
            let (min_mtime, dump) = (current.min_mtime, opts.dump);
            tokio::task::spawn_blocking(move || {
                compute_change_sets(&blocks, &slots, &mounts, &change_sets, min_mtime, workers, dump)
            })
            .await
            .context("change set computation panicked")?
        };
        info!(
            blocks = current.blocks.len(),
            mounts = mount_count,
            workers,
            elapsed_ms = compute_started.elapsed().as_millis() as u64,
            "computed change sets"
        );

        let service_lines: Vec<String> = services
            .iter()
            .zip(change_sets.iter())
            .map(|(svc, cs)| format!("{svc}: {}", cs.snapshot()))
            .collect();
        for line in computed.stats.report_lines(&service_lines) {
            info!("{line}");
        }

        check_sanity_late(&current)?;

        if opts.commit_pulls {
            commit(
                "send pull list",
                &services,
                services
                    .iter()
                    .zip(change_sets.iter())
                    .map(|(svc, cs)| self.keep.send_pulls(svc, cs.pulls())),
            )
            .await?;
        }
        if opts.commit_trash {
            commit(
                "send trash list",
                &services,
                services
                    .iter()
                    .zip(change_sets.iter())
                    .map(|(svc, cs)| self.keep.send_trashes(svc, cs.trashes())),
            )
            .await?;
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            pulls = computed.stats.pulls,
            trashes = computed.stats.trashes,
            "balance run finished"
        );
        Ok(RunOutcome {
            stats: computed.stats,
            collections: current.collections,
            dump: computed.dump,
        })
    }

    async fn keep_services(&self, ctx: &RequestContext) -> Result<Vec<KeepService>> {
        let mut services = if !self.config.keep_service_list.is_empty() {
            self.config.keep_service_list.clone()
        } else {
            let list = self
                .api
                .keep_service_list(ctx, ListOptions::default())
                .await
                .context("failed to list keep services")?;
            list.items
                .into_iter()
                .filter(|svc| {
                    let wanted = self.config.keep_service_types.contains(&svc.service_type);
                    if !wanted {
                        info!(uuid = %svc.uuid, service_type = %svc.service_type, "skipping keep service");
                    }
                    wanted
                })
                .collect()
        };
        services.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        Ok(services)
    }

    async fn mounts(&self, services: &[KeepService]) -> Result<Vec<MountSlot>> {
        let listed = try_join_all(services.iter().map(|svc| async move {
            self.keep
                .mounts(svc)
                .await
                .with_context(|| format!("{svc}: list mounts"))
        }))
        .await?;
        Ok(mount_slots(services, listed))
    }

    async fn check_sanity_early(&self, ctx: &RequestContext, services: &[KeepService]) -> Result<()> {
        let user = self
            .api
            .user_get_current(ctx, GetOptions::default())
            .await
            .context("failed to look up current user")?;
        if !user.is_active || !user.is_admin {
            return Err(BalanceError::NotAdmin(user.uuid).into());
        }
        if let Some(proxy) = services.iter().find(|svc| svc.service_type == "proxy") {
            return Err(BalanceError::ProxyService(proxy.to_string()).into());
        }
        let nulls = collections::count(
            self.api.as_ref(),
            ctx,
            vec![Filter::new("modified_at", "=", Value::Null)],
        )
        .await
        .context("failed to count collections with null modified_at")?;
        if nulls > 0 {
            return Err(BalanceError::NullModifiedAt(nulls).into());
        }
        Ok(())
    }

    async fn current_state(
        &self,
        ctx: &RequestContext,
        services: &[KeepService],
        mounts: &[MountSlot],
        prefix: &str,
    ) -> Result<CurrentState> {
        let started = Instant::now();
        let dd = self
            .api
            .discovery_document(ctx, EmptyOptions {})
            .await
            .context("failed to fetch discovery document")?;
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let min_mtime = now.saturating_sub(dd.blob_signature_ttl.saturating_mul(1_000_000_000));
        let default_replication = dd.default_collection_replication;
        let blocks = Arc::new(BlockStateMap::new());

        let indexes = try_join_all(index_groups(mounts).into_iter().map(|group| {
            let blocks = &blocks;
            let mount = &mounts[group[0]];
            let svc = &services[mount.service];
            async move {
                info!(service = %svc, mount = %mount.uuid, "retrieve index");
                let fetched = if mount.uuid.is_empty() {
                    self.keep.index(svc, prefix).await
                } else {
                    self.keep.mount_index(svc, &mount.uuid, prefix).await
                };
                let index = fetched.with_context(|| format!("{svc}: retrieve index"))?;
                for &idx in &group {
                    blocks.add_replicas(idx, &index);
                }
                info!(service = %svc, mount = %mount.uuid, entries = index.len(), "index done");
                anyhow::Ok(())
            }
        }));

        let (tx, mut rx) = mpsc::channel::<Collection>(self.config.collection_buffers.max(1));
        let producer = collections::each_collection(self.api.as_ref(), ctx, self.config.collection_batch_size, tx);
        let consumer = async {
            let mut scanned = 0usize;
            let mut deferred = Vec::new();
            while let Some(coll) = rx.recv().await {
                match block_digests(&coll.manifest_text) {
                    Ok(mut digests) => {
                        if !prefix.is_empty() {
                            digests.retain(|d| d.hash().starts_with(prefix));
                        }
                        let repl = coll.replication_desired.unwrap_or(default_replication);
                        debug!(uuid = %coll.uuid, blocks = digests.len(), repl, "collection");
                        blocks.increase_desired(repl, &digests);
                    }
                    Err(err) => {
                        warn!(uuid = %coll.uuid, error = %err, "cannot parse manifest");
                        deferred.push(format!("{}: {err}", coll.uuid));
                    }
                }
                scanned += 1;
            }
            anyhow::Ok((scanned, deferred))
        };

        let (_, _, (collections, deferred)) = tokio::try_join!(indexes, producer, consumer)?;
        info!(
            blocks = blocks.len(),
            collections,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "got current state"
        );
        Ok(CurrentState {
            blocks,
            min_mtime,
            default_replication,
            collections,
            deferred,
        })
    }
}

fn mount_slots(services: &[KeepService], listed: Vec<Option<Vec<KeepMount>>>) -> Vec<MountSlot> {
    let mut mounts = Vec::new();
    for (idx, (svc, list)) in services.iter().zip(listed).enumerate() {
        let Some(list) = list else {
            debug!(service = %svc, "no mount list");
            mounts.push(MountSlot::whole_service(idx, !svc.read_only));
            continue;
        };
        for mnt in list {
            let replication = if mnt.replication > 0 {
                mnt.replication
            } else {
                warn!(service = %svc, mount = %mnt.uuid, replication = mnt.replication, "using replication=1");
                1
            };
            mounts.push(MountSlot {
                service: idx,
                uuid: mnt.uuid,
                device_id: mnt.device_id,
                writable: !mnt.read_only && !svc.read_only,
                replication,
            });
        }
    }

    let rw_devices: HashSet<String> = mounts
        .iter()
        .filter(|m| m.writable && !m.device_id.is_empty())
        .map(|m| m.device_id.clone())
        .collect();
    mounts.retain(|m| {
        let shadowed = !m.writable && rw_devices.contains(&m.device_id);
        if shadowed {
            info!(mount = %m.uuid, device = %m.device_id, "skipping read-only mount of a device mounted read-write elsewhere");
        }
        !shadowed
    });
    mounts
}

// Mount indexes grouped by device: each group is indexed once, through
// its first mount, and the result applies to all of them.
fn index_groups(mounts: &[MountSlot]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut by_device: HashMap<&str, usize> = HashMap::new();
    for (idx, mount) in mounts.iter().enumerate() {
        if !mount.device_id.is_empty() {
            if let Some(&group) = by_device.get(mount.device_id.as_str()) {
                groups[group].push(idx);
                continue;
            }
            by_device.insert(&mount.device_id, groups.len());
        }
        groups.push(vec![idx]);
    }
    groups
}

fn check_sanity_late(current: &CurrentState) -> Result<(), BalanceError> {
    if !current.deferred.is_empty() {
        for err in &current.deferred {
            error!(error = %err, "deferred error");
        }
        return Err(BalanceError::DeferredErrors(current.deferred.len()));
    }
    if current.collections == 0 {
        return Err(BalanceError::ZeroCollections);
    }
    if !current.blocks.any_desired() {
        return Err(BalanceError::NothingDesired);
    }
    if current.default_replication < 1 {
        return Err(BalanceError::DefaultReplication(current.default_replication));
    }
    Ok(())
}

async fn commit<F>(label: &str, services: &[KeepService], calls: impl Iterator<Item = F>) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let started = Instant::now();
    let results = join_all(calls).await;
    let mut last = None;
    for (svc, result) in services.iter().zip(results) {
        if let Err(err) = result {
            let err = err.context(format!("{svc}: {label}"));
            error!(error = %format!("{err:#}"), "commit failed");
            last = Some(err);
        }
    }
    info!(
        label,
        services = services.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "commit done"
    );
    match last {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
#[path = "balancer_tests.rs"]
mod tests;
