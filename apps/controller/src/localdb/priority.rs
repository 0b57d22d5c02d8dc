use std::sync::Arc;
use std::time::Duration;

use common::ids::new_request_id;
use common::options::UpdatePriorityOptions;
use common::{Api, ApiError, RequestContext};
use rusqlite::OptionalExtension;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::Database;

pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

// A committed request with positive priority whose parent (if any) is
// itself still wanted.
const WANTED: &str = "EXISTS (SELECT 1 FROM container_requests cr \
     LEFT JOIN containers parent ON parent.uuid = cr.requesting_container_uuid \
     WHERE cr.container_uuid = containers.uuid AND cr.state = 'Committed' AND cr.priority > 0 \
     AND (cr.requesting_container_uuid IS NULL OR parent.priority > 0))";

const ACTIVE: &str = "state IN ('Queued', 'Locked', 'Running')";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub zeroed: usize,
    pub updated: usize,
}

pub struct PriorityReconciler {
    db: Database,
    rails: Arc<dyn Api>,
    root_token: String,
}

impl PriorityReconciler {
    pub fn new(db: Database, rails: Arc<dyn Api>, root_token: impl Into<String>) -> Self {
        Self {
            db,
            rails,
            root_token: root_token.into(),
        }
    }

    pub async fn run_once(&self) -> Result<ReconcileOutcome, ApiError> {
        let mut outcome = ReconcileOutcome::default();

        // Zeroing a parent can leave its children unwanted, so repeat until
        // nothing changes.
        loop {
            let changed = self
                .db
                .run(|conn| {
                    conn.execute(
                        &format!(
                            "UPDATE containers SET priority = 0 WHERE {ACTIVE} AND priority > 0 AND NOT {WANTED}"
                        ),
                        [],
                    )
                })
                .await?;
            if changed == 0 {
                break;
            }
            outcome.zeroed += changed;
        }

        let active: i64 = self
            .db
            .run(|conn| {
                conn.query_row(
                    &format!("SELECT count(*) FROM containers WHERE {ACTIVE}"),
                    [],
                    |row| row.get(0),
                )
            })
            .await?;
        let budget = active.max(0) as usize;

        let mut ctx = RequestContext::with_token(self.root_token.clone());
        ctx.request_id = new_request_id();
        let mut last: Option<String> = None;
        loop {
            let next: Option<String> = self
                .db
                .run(|conn| {
                    conn.query_row(
                        &format!(
                            "SELECT uuid FROM containers WHERE {ACTIVE} AND priority = 0 AND {WANTED} \
                             ORDER BY created_at, uuid LIMIT 1"
                        ),
                        [],
                        |row| row.get(0),
                    )
                    .optional()
                })
                .await?;
            let Some(uuid) = next else {
                break;
            };
            if last.as_deref() == Some(uuid.as_str()) {
                return Err(ApiError::internal(format!(
                    "priority update for container {uuid} did not take effect"
                )));
            }
            if outcome.updated >= budget {
                return Err(ApiError::internal(format!(
                    "container priority reconciliation did not converge after {budget} updates"
                )));
            }
            debug!(container = %uuid, "restoring container priority");
            self.rails
                .container_priority_update(&ctx, UpdatePriorityOptions { uuid: uuid.clone() })
                .await?;
            outcome.updated += 1;
            last = Some(uuid);
        }

        if outcome != ReconcileOutcome::default() {
            info!(
                zeroed = outcome.zeroed,
                updated = outcome.updated,
                "reconciled container priorities"
            );
        }
        Ok(outcome)
    }

    /// Reconcile on every trigger and every [`RECONCILE_INTERVAL`] until
    /// `cancel` fires.
    pub async fn run(self, mut trigger: mpsc::Receiver<()>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                Some(()) = trigger.recv() => {}
            }
            if let Err(err) = self.run_once().await {
                warn!(error = %err, "container priority reconciliation failed");
            }
        }
        debug!("container priority reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use common::model::Container;
    use rusqlite::params;

    struct TreeRails {
        db: Database,
    }

    #[async_trait]
    impl Api for TreeRails {
        async fn container_priority_update(
            &self,
            _ctx: &RequestContext,
            opts: UpdatePriorityOptions,
        ) -> Result<Container, ApiError> {
            let uuid = opts.uuid.clone();
            self.db
                .run(move |conn| {
                    conn.execute(
                        "UPDATE containers SET priority = COALESCE((
                            SELECT MAX(CASE WHEN cr.requesting_container_uuid IS NULL THEN cr.priority ELSE parent.priority END)
                            FROM container_requests cr
                            LEFT JOIN containers parent ON parent.uuid = cr.requesting_container_uuid
                            WHERE cr.container_uuid = ?1 AND cr.state = 'Committed' AND cr.priority > 0
                              AND (cr.requesting_container_uuid IS NULL OR parent.priority > 0)), 0)
                         WHERE uuid = ?1",
                        [uuid],
                    )
                })
                .await?;
            Ok(Container {
                uuid: opts.uuid,
                ..Default::default()
            })
        }
    }

    struct StuckRails;

    #[async_trait]
    impl Api for StuckRails {
        async fn container_priority_update(
            &self,
            _ctx: &RequestContext,
            _opts: UpdatePriorityOptions,
        ) -> Result<Container, ApiError> {
            Ok(Container::default())
        }
    }

    fn ctr(i: usize) -> String {
        format!("zzzzz-dz642-{i:015}")
    }

    async fn build_tree(db: &Database) -> Result<usize> {
        let count = db
            .run(|conn| {
                let mut next = 0usize;
                let mut add = |conn: &rusqlite::Connection, parent: Option<String>| {
                    let uuid = ctr(next);
                    conn.execute(
                        "INSERT INTO containers (uuid, state, priority) VALUES (?1, 'Queued', 1)",
                        [&uuid],
                    )?;
                    conn.execute(
                        "INSERT INTO container_requests (uuid, state, priority, container_uuid, requesting_container_uuid) \
                         VALUES (?1, 'Committed', 1, ?2, ?3)",
                        params![format!("zzzzz-xvhdp-{next:015}"), uuid, parent],
                    )?;
                    next += 1;
                    Ok::<_, rusqlite::Error>(uuid)
                };
                let mut level = vec![add(conn, None)?];
                for fanout in [2, 3, 4] {
                    let mut children = Vec::new();
                    for parent in &level {
                        for _ in 0..fanout {
                            children.push(add(conn, Some(parent.clone()))?);
                        }
                    }
                    level = children;
                }
                Ok(next)
            })
            .await?;
        Ok(count)
    }

    async fn priorities(db: &Database) -> Result<Vec<i64>> {
        Ok(db
            .run(|conn| {
                conn.prepare("SELECT priority FROM containers ORDER BY uuid")?
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()
            })
            .await?)
    }

    async fn set_priority(db: &Database, table: &'static str, uuid: String, priority: i64) -> Result<()> {
        db.run(move |conn| {
            conn.execute(
                &format!("UPDATE {table} SET priority = ?1 WHERE uuid = ?2"),
                params![priority, uuid],
            )
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn priority_cascade_recovers_and_then_drains() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Database::open(dir.path().join("db.sqlite3")).await?;
        assert_eq!(build_tree(&db).await?, 33);
        let reconciler = PriorityReconciler::new(
            db.clone(),
            Arc::new(TreeRails { db: db.clone() }),
            "systemroottoken",
        );

        for i in [1, 5, 20] {
            set_priority(&db, "containers", ctr(i), 0).await?;
        }
        let outcome = reconciler.run_once().await?;
        assert!(outcome.updated >= 3 && outcome.updated <= 33);
        assert!(priorities(&db).await?.iter().all(|&p| p > 0));

        set_priority(&db, "container_requests", "zzzzz-xvhdp-000000000000000".into(), 0).await?;
        let outcome = reconciler.run_once().await?;
        assert_eq!(outcome.zeroed, 33);
        assert_eq!(outcome.updated, 0);
        assert!(priorities(&db).await?.iter().all(|&p| p == 0));

        assert_eq!(reconciler.run_once().await?, ReconcileOutcome::default());
        Ok(())
    }

    #[tokio::test]
    async fn repeated_container_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Database::open(dir.path().join("db.sqlite3")).await?;
        build_tree(&db).await?;
        set_priority(&db, "containers", ctr(0), 0).await?;
        let reconciler = PriorityReconciler::new(db.clone(), Arc::new(StuckRails), "root");
        let err = reconciler.run_once().await.unwrap_err();
        assert!(err.errors[0].contains("did not take effect"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn trigger_and_cancel_drive_the_loop() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Database::open(dir.path().join("db.sqlite3")).await?;
        build_tree(&db).await?;
        let reconciler = PriorityReconciler::new(
            db.clone(),
            Arc::new(TreeRails { db: db.clone() }),
            "root",
        );
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reconciler.run(rx, cancel.clone()));

        set_priority(&db, "containers", ctr(0), 0).await?;
        tx.send(()).await?;
        let mut recovered = false;
        for _ in 0..100 {
            if priorities(&db).await?.iter().all(|&p| p > 0) {
                recovered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(recovered);

        cancel.cancel();
        task.await?;
        Ok(())
    }
}
