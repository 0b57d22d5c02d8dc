use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use client_sdk::{ContextTokens, RpcConn};
use common::Api;
use common::config::Cluster;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::auth::{self, AuthCache};
use crate::db::Database;
use crate::federation::Federation;
use crate::localdb::LocalDb;
use crate::localdb::priority::PriorityReconciler;
use crate::router::ApiRouter;

pub struct Server {
    addr: SocketAddr,
    cancel: CancellationToken,
    http: JoinHandle<std::io::Result<()>>,
    reconciler: JoinHandle<()>,
}

pub fn listen_address(cluster: &Cluster) -> Result<String> {
    let raw = cluster
        .services
        .controller
        .first_internal_url()
        .ok_or_else(|| anyhow!("Services.Controller.InternalURLs is empty"))?;
    let url = Url::parse(raw).with_context(|| format!("invalid controller URL {raw:?}"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("controller URL {raw:?} has no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("controller URL {raw:?} has no port"))?;
    Ok(format!("{host}:{port}"))
}

impl Server {
    pub async fn start(cluster: Cluster, bind: &str) -> Result<Self> {
        let rails_url = cluster
            .services
            .rails_api
            .first_internal_url()
            .ok_or_else(|| anyhow!("Services.RailsAPI.InternalURLs is empty"))?;
        let rails = RpcConn::new(
            &cluster.cluster_id,
            rails_url,
            cluster.tls.insecure,
            Arc::new(ContextTokens),
        )?;
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind {bind}"))?;
        Self::start_with(cluster, Arc::new(rails), listener).await
    }

    pub async fn start_with(cluster: Cluster, rails: Arc<dyn Api>, listener: TcpListener) -> Result<Self> {
        cluster.validate()?;
        let cluster = Arc::new(cluster);
        let db = Database::open(&cluster.database.path)
            .await
            .with_context(|| format!("failed to open database {}", cluster.database.path.display()))?;

        let cancel = CancellationToken::new();
        let (trigger, trigger_rx) = mpsc::channel(1);
        let reconciler = PriorityReconciler::new(
            db.clone(),
            Arc::clone(&rails),
            cluster.system_root_token.clone(),
        );
        let reconciler = tokio::spawn(reconciler.run(trigger_rx, cancel.child_token()));

        let local: Arc<dyn Api> = Arc::new(LocalDb::new(Arc::clone(&cluster), rails, trigger));
        let federation = Federation::new(Arc::clone(&cluster), local)?;
        let auth = Arc::new(AuthCache::new(
            db.clone(),
            cluster.system_root_token.clone(),
            auth::DEFAULT_TTL,
        ));
        let app = ApiRouter::new(Arc::new(federation))
            .with_database(db)
            .with_auth_cache(auth)
            .with_request_timeout(cluster.api.request_timeout.as_std())
            .into_router();

        let addr = listener.local_addr()?;
        let shutdown = cancel.clone();
        let http = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });
        info!(%addr, cluster_id = %cluster.cluster_id, "controller listening");

        Ok(Self {
            addr,
            cancel,
            http,
            reconciler,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn close(self) -> Result<()> {
        self.cancel.cancel();
        self.http
            .await
            .context("HTTP server task failed")?
            .context("HTTP server failed")?;
        self.reconciler
            .await
            .context("priority reconciler task failed")?;
        info!(addr = %self.addr, "controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::config::Config;
    use common::model::{Collection, DiscoveryDocument};
    use common::options::{EmptyOptions, GetOptions};
    use common::{ApiError, HealthStatus, RequestContext};
    use rusqlite::params;
    use serde_json::Value;

    const TOKEN: &str = "v2/zzzzz-gj3su-077z32aux8dg2s1/3kg6k6lzmp9kj5cpkcoxie963cmvjahbt2fod9zru30k1jqdmi";

    struct Rails;

    #[async_trait]
    impl Api for Rails {
        async fn discovery_document(&self, _ctx: &RequestContext, _opts: EmptyOptions) -> Result<DiscoveryDocument, ApiError> {
            Ok(DiscoveryDocument {
                uuid_prefix: "zzzzz".into(),
                ..Default::default()
            })
        }
        async fn collection_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Collection, ApiError> {
            if ctx.first_token() != Some(TOKEN) {
                return Err(ApiError::unauthorized("wrong token"));
            }
            Ok(Collection {
                uuid: opts.uuid,
                ..Default::default()
            })
        }
    }

    fn cluster(dir: &std::path::Path) -> anyhow::Result<Cluster> {
        let yaml = format!(
            r#"
Clusters:
  zzzzz:
    SystemRootToken: systemroottoken
    Collections:
      BlobSigningKey: zfhgfenhffzltr9dixws36j1yhksjoll2grmku38mi7yxd66h5j4q9w4jzanezacp8s6q0ro3hxakfye02152hncy6zml2ed0uc
    Database:
      Path: {}
"#,
            dir.join("db.sqlite3").display()
        );
        Ok(Config::from_yaml(&yaml)?.single_cluster()?)
    }

    fn controller_at(url: &str) -> anyhow::Result<Cluster> {
        let yaml = format!(
            "Clusters:\n  zzzzz:\n    Collections:\n      BlobSigning: false\n    Services:\n      Controller:\n        InternalURLs:\n          \"{url}\": {{}}\n"
        );
        Ok(Config::from_yaml(&yaml)?.single_cluster()?)
    }

    #[test]
    fn listen_address_uses_first_internal_url() -> anyhow::Result<()> {
        assert_eq!(listen_address(&controller_at("http://localhost:8003/")?)?, "localhost:8003");
        assert_eq!(listen_address(&controller_at("https://ctrl.example/")?)?, "ctrl.example:443");
        assert!(listen_address(&Cluster::default()).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn serves_until_closed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::start_with(cluster(dir.path())?, Arc::new(Rails), listener).await?;
        let base = format!("http://{}", server.local_addr());
        let http = reqwest::Client::new();

        let health: HealthStatus = http
            .get(format!("{base}/_health/ping"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(health, HealthStatus::ok());

        let doc: Value = http
            .get(format!("{base}/discovery/v1/apis/arvados/v1/rest"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(doc["uuidPrefix"], "zzzzz");

        let coll: Value = http
            .get(format!("{base}/arvados/v1/collections/zzzzz-4zz18-fy296fx3hot09f7"))
            .bearer_auth(TOKEN)
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(coll["uuid"], "zzzzz-4zz18-fy296fx3hot09f7");
        assert_eq!(coll["kind"], "arvados#collection");

        server.close().await?;
        let fresh = reqwest::Client::new();
        assert!(fresh.get(format!("{base}/_health/ping")).send().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn schema_is_created_on_start() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cluster = cluster(dir.path())?;
        let path = cluster.database.path.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::start_with(cluster, Arc::new(Rails), listener).await?;
        server.close().await?;

        let db = Database::open(&path).await?;
        let n: i64 = db
            .run(|conn| {
                conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params!["api_client_authorizations"],
                    |row| row.get(0),
                )
            })
            .await?;
        assert_eq!(n, 1);
        Ok(())
    }
}
