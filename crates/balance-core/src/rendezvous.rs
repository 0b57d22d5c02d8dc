use common::ids::UUID_LEN;
use common::model::KeepService;

use crate::balance::{MountSlot, Replica};

/// Rendezvous weight of `uuid` for a block. Only the random part of a
/// full UUID takes part, so the same service keeps its position across
/// cluster renames.
pub fn weight(block_hash: &str, uuid: &str) -> String {
    let suffix = if uuid.len() == UUID_LEN { &uuid[12..] } else { uuid };
    format!("{:x}", md5::compute(format!("{block_hash}{suffix}")))
}

pub fn service_order<S: AsRef<str>>(block_hash: &str, service_uuids: &[S]) -> Vec<usize> {
    let weights: Vec<String> = service_uuids
        .iter()
        .map(|uuid| weight(block_hash, uuid.as_ref()))
        .collect();
    let mut order: Vec<usize> = (0..service_uuids.len()).collect();
    order.sort_by(|&a, &b| weights[b].cmp(&weights[a]));
    order
}

/// Indexes into `mounts` in the order a block's replicas are placed.
///
/// Every service's best mount comes first, in service order; the remaining
/// mounts follow in the same order, so copies land on distinct services
/// before any service gets a second one. Within a service, mounts that
/// already hold the block lead, then the rest by device weight.
pub fn mount_order<S: AsRef<str>>(
    block_hash: &str,
    service_uuids: &[S],
    mounts: &[MountSlot],
    replicas: &[Replica],
) -> Vec<usize> {
    let mut by_service: Vec<Vec<usize>> = vec![Vec::new(); service_uuids.len()];
    for (idx, mount) in mounts.iter().enumerate() {
        if let Some(list) = by_service.get_mut(mount.service) {
            list.push(idx);
        }
    }
    let holds = |idx: usize| replicas.iter().any(|r| r.mount == idx);
    let weights: Vec<String> = mounts
        .iter()
        .map(|m| {
            let key = if m.device_id.is_empty() { &m.uuid } else { &m.device_id };
            weight(block_hash, key)
        })
        .collect();
    for list in &mut by_service {
        list.sort_by(|&a, &b| {
            holds(b)
                .cmp(&holds(a))
                .then_with(|| weights[b].cmp(&weights[a]))
        });
    }

    let mut first = Vec::with_capacity(mounts.len());
    let mut rest = Vec::new();
    for service in service_order(block_hash, service_uuids) {
        let mut list = by_service[service].iter().copied();
        first.extend(list.next());
        rest.extend(list);
    }
    first.extend(rest);
    first
}

pub fn fingerprint(services: &[KeepService]) -> String {
    let mut parts: Vec<String> = services.iter().map(ToString::to_string).collect();
    parts.sort();
    parts.join("; ")
}
