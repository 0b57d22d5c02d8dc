use std::fmt::Write as _;
use std::thread;

use common::manifest::SizedDigest;

use crate::balance::{Action, Assignment, MountSlot, Replica, balance_block};
use crate::block_state::{BlockState, BlockStateMap};
use crate::change_set::{ChangeSet, Pull, Trash};
use crate::rendezvous::mount_order;
use crate::stats::BalanceStats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSlot {
    pub uuid: String,
    pub url_base: String,
}

#[derive(Debug, Default)]
pub struct ComputeOutput {
    pub stats: BalanceStats,
    pub dump: Vec<String>,
}

/// Balance every known block and append the resulting pulls and trashes to
/// `change_sets` (one per service, same order as `services`). Each mount
/// names its service by index.
pub fn compute_change_sets(
    blocks: &BlockStateMap,
    services: &[ServiceSlot],
    mounts: &[MountSlot],
    change_sets: &[ChangeSet],
    min_mtime: i64,
    workers: usize,
    dump: bool,
) -> ComputeOutput {
    let uuids: Vec<&str> = services.iter().map(|s| s.uuid.as_str()).collect();

    let (stats, mut dump_lines) = blocks.with_blocks(|map| {
        let entries: Vec<(&SizedDigest, &BlockState)> = map.iter().collect();
        let chunk = entries.len().div_ceil(workers.max(1)).max(1);
        thread::scope(|scope| {
            let handles: Vec<_> = entries
                .chunks(chunk)
                .map(|part| {
                    let uuids = &uuids;
                    scope.spawn(move || {
                        let mut stats = BalanceStats::default();
                        let mut lines = Vec::new();
                        for (digest, blk) in part {
                            let order =
                                mount_order(digest.hash(), uuids.as_slice(), mounts, &blk.replicas);
                            let plan =
                                balance_block(blk.desired, &blk.replicas, min_mtime, &order, mounts);
                            record_plan(digest, &plan, services, mounts, change_sets, &mut stats);
                            let stored = distinct_replicas(&blk.replicas, mounts);
                            stats.record(digest.size(), blk.desired, &stored, min_mtime);
                            if dump {
                                lines.push(dump_line(digest, blk, &plan, mounts, services));
                            }
                        }
                        (stats, lines)
                    })
                })
                .collect();

            let mut total = BalanceStats::default();
            let mut lines = Vec::new();
            for handle in handles {
                match handle.join() {
                    Ok((stats, part_lines)) => {
                        total.merge(&stats);
                        lines.extend(part_lines);
                    }
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            (total, lines)
        })
    });

    dump_lines.sort();
    ComputeOutput {
        stats,
        dump: dump_lines,
    }
}

fn distinct_replicas(replicas: &[Replica], mounts: &[MountSlot]) -> Vec<Replica> {
    let mut devices: Vec<&str> = Vec::new();
    replicas
        .iter()
        .copied()
        .filter(|r| {
            let device = mounts
                .get(r.mount)
                .map(|m| m.device_id.as_str())
                .filter(|id| !id.is_empty());
            match device {
                Some(id) if devices.contains(&id) => false,
                Some(id) => {
                    devices.push(id);
                    true
                }
                None => true,
            }
        })
        .collect()
}

fn record_plan(
    digest: &SizedDigest,
    plan: &[Assignment],
    services: &[ServiceSlot],
    mounts: &[MountSlot],
    change_sets: &[ChangeSet],
    stats: &mut BalanceStats,
) {
    for assignment in plan {
        let Some(mount) = mounts.get(assignment.mount) else {
            continue;
        };
        let Some(change_set) = change_sets.get(mount.service) else {
            continue;
        };
        match assignment.action {
            Action::Pull { source } => {
                change_set.add_pull(Pull {
                    locator: digest.to_string(),
                    servers: mounts
                        .get(source)
                        .and_then(|m| services.get(m.service))
                        .map(|s| vec![s.url_base.clone()])
                        .unwrap_or_default(),
                    mount_uuid: mount.uuid.clone(),
                });
                stats.pulls += 1;
            }
            Action::Trash { mtime } => {
                change_set.add_trash(Trash {
                    locator: digest.to_string(),
                    block_mtime: mtime,
                    mount_uuid: mount.uuid.clone(),
                });
                stats.trashes += 1;
            }
            Action::Keep { .. } | Action::Ignore => {}
        }
    }
}

fn dump_line(
    digest: &SizedDigest,
    blk: &BlockState,
    plan: &[Assignment],
    mounts: &[MountSlot],
    services: &[ServiceSlot],
) -> String {
    let mut line = format!(
        "{digest} refs={} desired={} have={}",
        blk.ref_count,
        blk.desired,
        blk.replicas.len()
    );
    let name = |idx: usize| {
        let Some(mount) = mounts.get(idx) else {
            return "?".to_string();
        };
        let service = services.get(mount.service).map_or("?", |s| s.uuid.as_str());
        if mount.uuid.is_empty() {
            service.to_string()
        } else {
            format!("{service}/{}", mount.uuid)
        }
    };
    for assignment in plan {
        let here = name(assignment.mount);
        let _ = match assignment.action {
            Action::Keep { mtime } => write!(line, " {here}=keep,{mtime}"),
            Action::Trash { mtime } => write!(line, " {here}=trash,{mtime}"),
            Action::Pull { source } => write!(line, " {here}=pull<{}", name(source)),
            Action::Ignore => Ok(()),
        };
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexEntry;

    const OLD: i64 = 1_000;
    const MIN_MTIME: i64 = 1_000_000;

    struct Cluster {
        services: Vec<ServiceSlot>,
        mounts: Vec<MountSlot>,
        change_sets: Vec<ChangeSet>,
    }

    impl Cluster {
        fn new(services: usize, mounts_each: usize) -> Self {
            let services: Vec<ServiceSlot> = (0..services)
                .map(|i| ServiceSlot {
                    uuid: format!("zzzzz-bi6l4-{i:015x}"),
                    url_base: format!("http://keep{i}.zzzzz.arvadosapi.com:25107"),
                })
                .collect();
            let mounts = (0..services.len() * mounts_each)
                .map(|i| MountSlot {
                    service: i / mounts_each,
                    uuid: format!("zzzzz-ivpuk-{i:015x}"),
                    device_id: format!("dev{i}"),
                    writable: true,
                    replication: 1,
                })
                .collect();
            let change_sets = services.iter().map(|_| ChangeSet::default()).collect();
            Self {
                services,
                mounts,
                change_sets,
            }
        }

        fn compute(&self, blocks: &BlockStateMap, workers: usize, dump: bool) -> ComputeOutput {
            compute_change_sets(
                blocks,
                &self.services,
                &self.mounts,
                &self.change_sets,
                MIN_MTIME,
                workers,
                dump,
            )
        }
    }

    fn digest(i: u64) -> SizedDigest {
        let hash = format!("{:x}", md5::compute(format!("{i:064x}")));
        SizedDigest::from_locator(&format!("{hash}+64")).unwrap()
    }

    fn old_entry(d: &SizedDigest) -> IndexEntry {
        IndexEntry {
            digest: d.clone(),
            mtime: OLD,
        }
    }

    #[test]
    fn underreplicated_block_is_pulled_from_existing_replica() {
        let cluster = Cluster::new(4, 1);
        let blocks = BlockStateMap::new();
        let d = digest(0);
        blocks.add_replicas(2, &[old_entry(&d)]);
        blocks.increase_desired(2, std::slice::from_ref(&d));

        let out = cluster.compute(&blocks, 3, true);
        assert_eq!(out.stats.pulls, 1);
        assert_eq!(out.stats.trashes, 0);
        assert_eq!(out.stats.underreplicated.blocks, 1);

        let (service, pulls) = cluster
            .change_sets
            .iter()
            .enumerate()
            .find_map(|(i, cs)| Some((i, cs.pulls())).filter(|(_, p)| !p.is_empty()))
            .unwrap();
        assert_ne!(service, 2);
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].locator, d.to_string());
        assert_eq!(pulls[0].servers, vec![cluster.services[2].url_base.clone()]);
        assert_eq!(pulls[0].mount_uuid, cluster.mounts[service].uuid);
        assert_eq!(out.dump.len(), 1);
        assert!(out.dump[0].starts_with(&format!("{d} refs=1 desired=2 have=1")));
        assert!(out.dump[0].contains(&format!(
            "{}/{}=keep,{OLD}",
            cluster.services[2].uuid, cluster.mounts[2].uuid
        )));
    }

    #[test]
    fn garbage_is_trashed_on_every_holder_and_stats_total_up() {
        let cluster = Cluster::new(3, 1);
        let blocks = BlockStateMap::new();
        for i in 0..10 {
            let entry = old_entry(&digest(i));
            blocks.add_replicas(0, std::slice::from_ref(&entry));
            blocks.add_replicas(1, std::slice::from_ref(&entry));
        }

        let out = cluster.compute(&blocks, 4, false);
        assert_eq!(out.stats.trashes, 20);
        assert_eq!(out.stats.garbage.blocks, 10);
        assert_eq!(out.stats.garbage.replicas, 20);
        assert_eq!(out.stats.garbage.bytes, 20 * 64);
        assert_eq!(out.stats.replication_histogram, vec![0, 0, 10]);
        assert_eq!(cluster.change_sets[0].trashes().len(), 10);
        assert_eq!(cluster.change_sets[1].trashes().len(), 10);
        assert!(cluster.change_sets[2].trashes().is_empty());
        assert!(out.dump.is_empty());
    }

    #[test]
    fn trash_names_the_mount_holding_the_replica() {
        let cluster = Cluster::new(2, 3);
        let blocks = BlockStateMap::new();
        let d = digest(7);
        blocks.add_replicas(4, &[old_entry(&d)]);

        let out = cluster.compute(&blocks, 1, false);
        assert_eq!(out.stats.trashes, 1);
        let trashes = cluster.change_sets[1].trashes();
        assert_eq!(trashes.len(), 1);
        assert_eq!(trashes[0].mount_uuid, cluster.mounts[4].uuid);
        assert!(cluster.change_sets[0].trashes().is_empty());
    }

    #[test]
    fn second_copy_goes_to_another_service() {
        let cluster = Cluster::new(3, 2);
        let blocks = BlockStateMap::new();
        for i in 0..20 {
            let d = digest(i);
            blocks.add_replicas(0, &[old_entry(&d)]);
            blocks.increase_desired(2, &[d]);
        }

        let out = cluster.compute(&blocks, 2, false);
        assert!(out.stats.pulls >= 20);
        assert!(cluster.change_sets[0].pulls().is_empty());
        let mounts_of = |service: usize| -> Vec<&str> {
            cluster
                .mounts
                .iter()
                .filter(|m| m.service == service)
                .map(|m| m.uuid.as_str())
                .collect()
        };
        for service in 1..3 {
            for pull in cluster.change_sets[service].pulls() {
                assert!(mounts_of(service).contains(&pull.mount_uuid.as_str()));
            }
        }
    }

    #[test]
    fn shared_device_is_one_stored_copy() {
        let mut cluster = Cluster::new(2, 1);
        cluster.mounts[1].device_id = cluster.mounts[0].device_id.clone();
        let blocks = BlockStateMap::new();
        let d = digest(3);
        blocks.add_replicas(0, &[old_entry(&d)]);
        blocks.add_replicas(1, &[old_entry(&d)]);
        blocks.increase_desired(1, std::slice::from_ref(&d));

        let out = cluster.compute(&blocks, 1, false);
        assert_eq!(out.stats.just_right.blocks, 1);
        assert_eq!(out.stats.current.replicas, 1);
        assert_eq!(out.stats.trashes, 0);
    }

    #[test]
    fn read_only_mounts_are_left_alone() {
        let mut cluster = Cluster::new(2, 1);
        cluster.mounts[1].writable = false;
        let blocks = BlockStateMap::new();
        blocks.add_replicas(1, &[old_entry(&digest(5))]);

        let out = cluster.compute(&blocks, 1, false);
        assert_eq!(out.stats.trashes, 0);
        assert_eq!(out.stats.garbage.blocks, 1);
        assert!(cluster.change_sets[1].trashes().is_empty());
    }
}
