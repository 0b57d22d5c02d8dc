//! Paging through every collection, oldest modification first.

use anyhow::{Context, Result, anyhow};
use chrono::SecondsFormat;
use common::model::{Collection, Timestamp};
use common::options::{Filter, ListOptions};
use common::{Api, RequestContext};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::BalanceError;

const SELECT: &[&str] = &[
    "uuid",
    "manifest_text",
    "modified_at",
    "portable_data_hash",
    "replication_desired",
];

fn scan_options() -> ListOptions {
    ListOptions {
        include_trash: true,
        include_old_versions: true,
        ..Default::default()
    }
}

fn rfc3339(t: &Timestamp) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub async fn count(api: &dyn Api, ctx: &RequestContext, filters: Vec<Filter>) -> Result<i64> {
    let page = api
        .collection_list(
            ctx,
            ListOptions {
                limit: 0,
                count: "exact".into(),
                filters,
                ..scan_options()
            },
        )
        .await?;
    Ok(page.items_available)
}

/// Send every collection to `tx`, ordered by `(modified_at, uuid)`, and
/// return how many were sent.
///
/// Each page asks for `modified_at >=` the last timestamp seen; entries
/// already sent are skipped. A full page with nothing new means more
/// collections share one timestamp than fit on a page, and the scan gives
/// up rather than loop.
pub async fn each_collection(
    api: &dyn Api,
    ctx: &RequestContext,
    page_size: usize,
    tx: mpsc::Sender<Collection>,
) -> Result<usize> {
    let expect = count(api, ctx, Vec::new())
        .await
        .context("failed to count collections")?;
    let limit = if page_size == 0 {
        i64::from(i32::MAX)
    } else {
        page_size as i64
    };
    let mut opts = ListOptions {
        limit,
        count: "none".into(),
        order: vec!["modified_at".into(), "uuid".into()],
        select: SELECT.iter().map(ToString::to_string).collect(),
        ..scan_options()
    };

    let mut last: Option<(Timestamp, String)> = None;
    let mut sent = 0usize;
    loop {
        debug!(sent, expect, "collections");
        let page = api
            .collection_list(ctx, opts.clone())
            .await
            .context("failed to list collections")?;
        let returned = page.items.len();
        let mut fresh = 0usize;
        for coll in page.items {
            let Some(modified_at) = coll.modified_at else {
                return Err(BalanceError::MissingModifiedAt(coll.uuid).into());
            };
            if let Some((t, uuid)) = &last
                && (modified_at < *t || (modified_at == *t && coll.uuid <= *uuid))
            {
                continue;
            }
            last = Some((modified_at, coll.uuid.clone()));
            tx.send(coll)
                .await
                .map_err(|_| anyhow!("collection consumer stopped"))?;
            sent += 1;
            fresh += 1;
        }

        let Some((t, uuid)) = &last else {
            break;
        };
        if fresh == 0 {
            if (returned as i64) < limit {
                break;
            }
            return Err(BalanceError::NoProgress(rfc3339(t)).into());
        }
        opts.filters = vec![
            Filter::new("modified_at", ">=", rfc3339(t)),
            Filter::new("uuid", "!=", uuid.clone()),
        ];
    }
    info!(collections = sent, expected = expect, "collection scan done");

    // Anything modified before the last timestamp we saw should have been
    // seen; if not, the ordering changed under us.
    if let Some((t, _)) = &last {
        let want = count(api, ctx, vec![Filter::new("modified_at", "<=", rfc3339(t))])
            .await
            .context("failed to recount collections")?;
        if (sent as i64) < want {
            return Err(BalanceError::MissedCollections {
                got: sent,
                want,
                until: rfc3339(t),
            }
            .into());
        }
    }
    Ok(sent)
}
