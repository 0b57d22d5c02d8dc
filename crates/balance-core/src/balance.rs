#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSlot {
    pub service: usize,
    pub uuid: String,
    pub device_id: String,
    pub writable: bool,
    pub replication: i64,
}

impl MountSlot {
    pub fn whole_service(service: usize, writable: bool) -> Self {
        Self {
            service,
            uuid: String::new(),
            device_id: String::new(),
            writable,
            replication: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replica {
    pub mount: usize,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Keep { mtime: i64 },
    Trash { mtime: i64 },
    Pull { source: usize },
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub mount: usize,
    pub action: Action,
}

struct Walk<'a> {
    desired: i64,
    min_mtime: i64,
    mounts: &'a [MountSlot],
    best_kept: i64,
    kept_mtimes: Vec<i64>,
    devices: Vec<&'a str>,
}

impl<'a> Walk<'a> {
    fn writable(&self, mount: usize) -> bool {
        self.mounts.get(mount).is_some_and(|m| m.writable)
    }

    fn replication(&self, mount: usize) -> i64 {
        self.mounts.get(mount).map_or(1, |m| m.replication.max(1))
    }

    fn device(&self, mount: usize) -> Option<&'a str> {
        self.mounts
            .get(mount)
            .map(|m| m.device_id.as_str())
            .filter(|id| !id.is_empty())
    }

    fn device_taken(&self, mount: usize) -> bool {
        self.device(mount).is_some_and(|id| self.devices.contains(&id))
    }

    fn take_device(&mut self, mount: usize) {
        if let Some(id) = self.device(mount) {
            self.devices.push(id);
        }
    }

    fn decide(&mut self, replica: &Replica) -> Action {
        let keep = Action::Keep {
            mtime: replica.mtime,
        };
        // Same storage as a copy already kept: neither another copy nor
        // safe to trash.
        if self.device_taken(replica.mount) {
            return keep;
        }
        let trash = self.best_kept >= self.desired
            && replica.mtime < self.min_mtime
            && !self.kept_mtimes.contains(&replica.mtime)
            && self.writable(replica.mount);
        if trash {
            return Action::Trash {
                mtime: replica.mtime,
            };
        }
        self.best_kept += self.replication(replica.mount);
        self.kept_mtimes.push(replica.mtime);
        self.take_device(replica.mount);
        keep
    }
}

/// Decide what every mount in `order` should do about one block.
///
/// `order` is the block's mount walk order (see
/// [`mount_order`](crate::rendezvous::mount_order)). A mount's first
/// reported replica is judged in walk order; any further replicas on the
/// same mount are judged after the walk, against whatever has been kept by
/// then. A replica is only trashed once enough others are kept, and never
/// when it is newer than `min_mtime`, sits on a read-only mount or shares
/// its mtime with a kept replica (the node cannot tell such replicas
/// apart, so trashing one would trash both). Mounts on a device that
/// already holds a kept or pulled copy count for nothing.
pub fn balance_block(
    desired: i64,
    replicas: &[Replica],
    min_mtime: i64,
    order: &[usize],
    mounts: &[MountSlot],
) -> Vec<Assignment> {
    let mut walk = Walk {
        desired,
        min_mtime,
        mounts,
        best_kept: 0,
        kept_mtimes: Vec::new(),
        devices: Vec::new(),
    };
    let mut pulled = 0i64;
    let mut extras = Vec::new();
    let mut out = Vec::with_capacity(order.len());

    for &mount in order {
        let mut here = replicas.iter().filter(|r| r.mount == mount);
        let action = match here.next() {
            Some(primary) => {
                let action = walk.decide(primary);
                extras.extend(here);
                action
            }
            None => {
                if pulled + walk.best_kept < desired
                    && !replicas.is_empty()
                    && walk.writable(mount)
                    && !walk.device_taken(mount)
                {
                    pulled += walk.replication(mount);
                    walk.take_device(mount);
                    Action::Pull {
                        source: replicas[0].mount,
                    }
                } else {
                    Action::Ignore
                }
            }
        };
        out.push(Assignment { mount, action });
    }

    for replica in extras {
        let action = walk.decide(replica);
        out.push(Assignment {
            mount: replica.mount,
            action,
        });
    }
    out
}
