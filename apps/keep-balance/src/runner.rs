use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::balancer::{Balancer, RunOptions, RunOutcome};

pub struct Runner {
    balancer: Balancer,
    options: RunOptions,
    period: Duration,
}

impl Runner {
    pub fn new(balancer: Balancer, options: RunOptions, period: Duration) -> Self {
        Self {
            balancer,
            options,
            period,
        }
    }

    pub async fn run_once(&mut self) -> Result<RunOutcome> {
        let outcome = self.balancer.run(&mut self.options).await?;
        for line in &outcome.dump {
            println!("{line}");
        }
        Ok(outcome)
    }

    /// Run now, then every `period` until `cancel` fires. A message on
    /// `kick` starts the next run immediately and restarts the timer. A
    /// failed run is logged and retried on the next tick.
    pub async fn run_forever(mut self, mut kick: mpsc::Receiver<()>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut runs = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.run_once() => {
                    runs += 1;
                    if let Err(err) = result {
                        error!(error = %format!("{err:#}"), run = runs, "balance run failed");
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = kick.recv() => {
                    info!("manual kick received, running now");
                    ticker.reset();
                }
                _ = ticker.tick() => {}
            }
        }
        info!(runs, "balancer stopped");
    }

    #[cfg(test)]
    pub fn options(&self) -> &RunOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keep_service::KeepClient;
    use async_trait::async_trait;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::{get, put};
    use common::config::KeepBalanceConfig;
    use common::model::{Collection, DiscoveryDocument, KeepService, List, User};
    use common::options::{EmptyOptions, GetOptions, ListOptions};
    use common::{Api, ApiError, RequestContext};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    const FOO: &str = "acbd18db4cc2f85cedef654fccc4a4d8+3";

    struct Rails {
        service: KeepService,
    }

    #[async_trait]
    impl Api for Rails {
        async fn user_get_current(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<User, ApiError> {
            Ok(User {
                uuid: "zzzzz-tpzed-000000000000000".into(),
                is_active: true,
                is_admin: true,
                ..Default::default()
            })
        }
        async fn discovery_document(&self, _ctx: &RequestContext, _opts: EmptyOptions) -> Result<DiscoveryDocument, ApiError> {
            Ok(DiscoveryDocument::default())
        }
        async fn keep_service_list(&self, _ctx: &RequestContext, _opts: ListOptions) -> Result<List<KeepService>, ApiError> {
            Ok(List::from_items(vec![self.service.clone()]))
        }
        async fn collection_list(&self, _ctx: &RequestContext, opts: ListOptions) -> Result<List<Collection>, ApiError> {
            if !opts.filters.is_empty() {
                return Ok(List::default());
            }
            let mut list = List::from_items(vec![Collection {
                uuid: "zzzzz-4zz18-znfnqtbbv4spc3w".into(),
                manifest_text: format!(". {FOO} 0:3:foo\n"),
                modified_at: "2014-02-03T17:22:54Z".parse().ok(),
                ..Default::default()
            }]);
            if opts.limit == 0 {
                list.items.clear();
            }
            Ok(list)
        }
    }

    #[derive(Default)]
    struct Counts {
        pulls: AtomicUsize,
        trashes: AtomicUsize,
    }

    async fn runner(period: Duration) -> anyhow::Result<(Runner, Arc<Counts>)> {
        let counts = Arc::new(Counts::default());
        let app = Router::new()
            .route("/index/", get(|| async { format!("{FOO} 12345678\n\n") }))
            .route(
                "/pull",
                put({
                    let counts = Arc::clone(&counts);
                    move || async move {
                        counts.pulls.fetch_add(1, Ordering::SeqCst);
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/trash",
                put({
                    let counts = Arc::clone(&counts);
                    move || async move {
                        counts.trashes.fetch_add(1, Ordering::SeqCst);
                        StatusCode::OK
                    }
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, app).await });

        let rails = Arc::new(Rails {
            service: KeepService {
                uuid: "zzzzz-bi6l4-000000000000000".into(),
                service_host: addr.ip().to_string(),
                service_port: addr.port(),
                service_type: "disk".into(),
                ..Default::default()
            },
        });
        let balancer = Balancer::new(
            rails,
            KeepClient::new("root-token", false)?,
            KeepBalanceConfig::default(),
            "root-token",
        );
        let options = RunOptions {
            commit_pulls: true,
            commit_trash: true,
            ..Default::default()
        };
        Ok((Runner::new(balancer, options, period), counts))
    }

    async fn wait_for(counts: &Counts, pulls: usize) {
        for _ in 0..2000 {
            if counts.pulls.load(Ordering::SeqCst) >= pulls {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn once_remembers_the_cleared_service_set() -> anyhow::Result<()> {
        let (mut runner, counts) = runner(Duration::from_secs(3600)).await?;
        runner.run_once().await?;
        assert!(!runner.options().safe_rendezvous_state.is_empty());
        runner.run_once().await?;
        assert_eq!(counts.pulls.load(Ordering::SeqCst), 2);
        // One clear, then one real list per run.
        assert_eq!(counts.trashes.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn forever_runs_on_the_timer_until_cancelled() -> anyhow::Result<()> {
        let (runner, counts) = runner(Duration::from_millis(1)).await?;
        let (_kick_tx, kick_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(runner.run_forever(kick_rx, cancel.clone()));

        wait_for(&counts, 4).await;
        cancel.cancel();
        task.await?;

        let pulls = counts.pulls.load(Ordering::SeqCst);
        assert!(pulls >= 4, "only {pulls} runs");
        // One clear up front; the run in flight at cancel may not have
        // reached its trash list.
        let trashes = counts.trashes.load(Ordering::SeqCst);
        assert!(trashes == pulls || trashes == pulls + 1, "{trashes} trash lists for {pulls} runs");
        Ok(())
    }

    #[tokio::test]
    async fn kick_starts_a_run_before_the_timer() -> anyhow::Result<()> {
        let (runner, counts) = runner(Duration::from_secs(3600)).await?;
        let (kick_tx, kick_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(runner.run_forever(kick_rx, cancel.clone()));

        wait_for(&counts, 1).await;
        kick_tx.send(()).await?;
        wait_for(&counts, 2).await;
        cancel.cancel();
        task.await?;
        assert_eq!(counts.pulls.load(Ordering::SeqCst), 2);
        Ok(())
    }
}
