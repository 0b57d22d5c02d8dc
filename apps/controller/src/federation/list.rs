use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use common::ids::{UUID_LEN, cluster_of};
use common::model::*;
use common::options::ListOptions;
use common::{Api, ApiError, RequestContext};
use futures::future::try_join_all;
use serde_json::Value;
use tracing::debug;

use super::Federation;

pub trait HasUuid {
    fn uuid(&self) -> &str;
}

macro_rules! has_uuid {
    ($($ty:ty),* $(,)?) => {
        $(impl HasUuid for $ty {
            fn uuid(&self) -> &str {
                &self.uuid
            }
        })*
    };
}

has_uuid!(
    Collection,
    Container,
    ContainerRequest,
    Group,
    User,
    Link,
    Specimen,
    ApiClientAuthorization,
    KeepService,
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListPlan {
    Single(String),
    Empty,
    Split(BTreeMap<String, BTreeSet<String>>),
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) fn plan_list(
    local_id: &str,
    opts: &ListOptions,
    max_items: usize,
) -> Result<ListPlan, ApiError> {
    if opts.bypass_federation || !opts.forwarded_for.is_empty() {
        return Ok(ListPlan::Single(local_id.to_string()));
    }
    if !opts.cluster_id.is_empty() {
        return Ok(ListPlan::Single(opts.cluster_id.clone()));
    }

    let mut cannot_split = false;
    let mut wanted: Option<BTreeSet<String>> = None;
    for filter in &opts.filters {
        if filter.attr != "uuid" {
            cannot_split = true;
            continue;
        }
        let uuids: BTreeSet<String> = match filter.operator.as_str() {
            "=" => match &filter.operand {
                Value::String(uuid) => BTreeSet::from([uuid.clone()]),
                other => {
                    return Err(ApiError::bad_request(format!(
                        "invalid operand type {} for filter {:?}",
                        json_type(other),
                        filter
                    )));
                }
            },
            "in" => match &filter.operand {
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect(),
                other => {
                    return Err(ApiError::bad_request(format!(
                        "invalid operand type {} in filter {:?}",
                        json_type(other),
                        filter
                    )));
                }
            },
            _ => {
                cannot_split = true;
                continue;
            }
        };
        wanted = Some(match wanted {
            None => uuids,
            Some(prev) => prev.intersection(&uuids).cloned().collect(),
        });
    }

    let Some(wanted) = wanted else {
        return Ok(ListPlan::Single(local_id.to_string()));
    };

    let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for uuid in wanted {
        if uuid.len() != UUID_LEN {
            continue;
        }
        groups
            .entry(cluster_of(&uuid).to_string())
            .or_default()
            .insert(uuid);
    }
    if groups.is_empty() {
        return Ok(ListPlan::Empty);
    }
    if groups.len() == 1 && groups.contains_key(local_id) {
        return Ok(ListPlan::Single(local_id.to_string()));
    }

    let n: usize = groups.values().map(BTreeSet::len).sum();
    if cannot_split {
        return Err(ApiError::bad_request(
            "cannot execute federated list query: each filter must be either 'uuid = ...' or 'uuid in [...]'",
        ));
    }
    if opts.count != "none" {
        return Err(ApiError::bad_request(
            "cannot execute federated list query unless count==\"none\"",
        ));
    }
    if (opts.limit >= 0 && (opts.limit as usize) < n) || opts.offset > 0 || !opts.order.is_empty() {
        return Err(ApiError::bad_request(format!(
            "cannot execute federated list query with limit ({}) < nUUIDs ({}), offset ({}) > 0, or order ({:?}) parameter",
            opts.limit, n, opts.offset, opts.order
        )));
    }
    if !opts.select.is_empty() && !opts.select.iter().any(|s| s == "uuid") {
        return Err(ApiError::bad_request(
            "cannot execute federated list query with a select list that does not include uuid",
        ));
    }
    if n > max_items {
        return Err(ApiError::bad_request(format!(
            "cannot execute federated list query because number of UUIDs ({n}) exceeds page size limit {max_items}"
        )));
    }
    Ok(ListPlan::Split(groups))
}

impl Federation {
    /// Serve a list call, fanning out across clusters when its uuid
    /// filters name objects owned elsewhere.
    pub(super) async fn split_list<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        opts: ListOptions,
        call: F,
    ) -> Result<List<T>, ApiError>
    where
        T: HasUuid + Send,
        F: Fn(Arc<dyn Api>, RequestContext, ListOptions) -> Fut + Sync,
        Fut: Future<Output = Result<List<T>, ApiError>> + Send,
    {
        let local_id = &self.cluster.cluster_id;
        let forward = |mut opts: ListOptions| {
            opts.forwarded_for = format!("{local_id}-{}", opts.forwarded_for);
            opts
        };

        let groups = match plan_list(local_id, &opts, self.cluster.api.max_items_per_response)? {
            ListPlan::Single(cluster) => {
                return call(self.backend(&cluster), ctx.clone(), forward(opts)).await;
            }
            ListPlan::Empty => return Ok(List::default()),
            ListPlan::Split(groups) => groups,
        };

        let fanout = ctx.child();
        let per_cluster = groups.into_iter().map(|(cluster, todo)| {
            let ctx = fanout.clone();
            let opts = opts.clone();
            let call = &call;
            let forward = &forward;
            async move {
                let backend = if &cluster == local_id {
                    Arc::clone(&self.local)
                } else {
                    self.remote_for(&cluster).ok_or_else(|| {
                        ApiError::not_found(format!(
                            "cannot execute federated list query: no proxy available for cluster {cluster:?}"
                        ))
                    })?
                };
                let mut todo = todo;
                let mut items = Vec::new();
                while !todo.is_empty() {
                    let mut batch = forward(opts.clone());
                    batch.filters = vec![common::options::Filter::new(
                        "uuid",
                        "in",
                        todo.iter().cloned().collect::<Vec<_>>(),
                    )];
                    let page = call(Arc::clone(&backend), ctx.clone(), batch)
                        .await
                        .map_err(|err| ApiError::bad_gateway(err.to_string()))?;
                    if page.items.is_empty() {
                        break;
                    }
                    let before = todo.len();
                    let returned = page.items.len();
                    for item in page.items {
                        if todo.remove(item.uuid()) {
                            items.push(item);
                        }
                    }
                    if todo.len() == before {
                        return Err(ApiError::bad_gateway(format!(
                            "cannot make progress in federated list query: cluster {cluster:?} returned {returned} items but none had the requested UUIDs"
                        )));
                    }
                }
                debug!(cluster = %cluster, items = items.len(), "federated list batch done");
                Ok::<_, ApiError>(items)
            }
        });

        let result = try_join_all(per_cluster).await;
        if result.is_err() {
            fanout.cancel.cancel();
        }
        let mut merged: Vec<T> = result?.into_iter().flatten().collect();
        merged.sort_by(|a, b| a.uuid().cmp(b.uuid()));
        merged.dedup_by(|a, b| a.uuid() == b.uuid());
        Ok(List::from_items(merged))
    }
}
