#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::path::{Path, PathBuf};
    use std::process::Stdio;
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;

    use anyhow::{Context, Result, anyhow, bail, ensure};
    use axum::extract::{Path as UrlPath, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use common::manifest::portable_data_hash;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio::process::{Child, Command};
    use tokio::time::sleep;

    const FOO: &str = "acbd18db4cc2f85cedef654fccc4a4d8+3";
    const BAR: &str = "37b51d194a7513e45b56f6524f2d51f2+3";
    const SIGNATURE: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4@65536f00";
    const SECRET: &str = "3kg6k6lzmp9kj5cpkcoxie963cmvjahbt2fod9zru30k1jqdmi";
    const TOKEN_UUID: &str = "zzzzz-gj3su-077z32aux8dg2s1";
    const LOCAL_COLL: &str = "zzzzz-4zz18-fy296fx3hot09f7";
    const REMOTE_COLL: &str = "bbbbb-4zz18-fy296fx3hot09f7";
    const ROOT_TOKEN: &str = "systemroottoken1234567890";

    fn token() -> String {
        format!("v2/{TOKEN_UUID}/{SECRET}")
    }

    fn local_manifest() -> String {
        format!(". {FOO} 0:3:foo\n")
    }

    fn remote_manifest() -> String {
        format!(". {FOO}+A{SIGNATURE} 0:3:foo\n")
    }

    #[tokio::test]
    async fn controller_serves_local_and_federated_collections() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rails = serve(rails_stub()).await?;
        let remote = Arc::new(RemoteCluster::default());
        let remote_addr = serve(remote_stub(Arc::clone(&remote))).await?;
        let bind = format!("127.0.0.1:{}", free_port()?);
        let config = write_config(
            dir.path(),
            &controller_config(&bind, rails, remote_addr, &dir.path().join("controller.sqlite3")),
        )?;
        let mut controller = start_controller(&config, &bind).await?;
        let base_url = format!("http://{bind}");
        let client = reqwest::Client::new();

        let result = async {
            let resp = client
                .get(format!("{base_url}/arvados/v1/config"))
                .header("X-Request-Id", "req-systemtests00000000")
                .send()
                .await?
                .error_for_status()?;
            assert_eq!(
                resp.headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok()),
                Some("req-systemtests00000000")
            );
            assert_eq!(
                resp.headers()
                    .get("access-control-allow-origin")
                    .and_then(|v| v.to_str().ok()),
                Some("*")
            );
            let config: Value = resp.json().await?;
            assert_eq!(config["ClusterID"], "zzzzz");

            let local = get_json(&client, &format!("{base_url}/arvados/v1/collections/{LOCAL_COLL}")).await?;
            assert_eq!(local["kind"], "arvados#collection");
            let manifest = local["manifest_text"].as_str().unwrap_or_default();
            assert!(manifest.contains(&format!("{FOO}+A")), "unsigned manifest: {manifest}");
            assert_eq!(portable_data_hash(manifest), portable_data_hash(&local_manifest()));

            let by_uuid = get_json(&client, &format!("{base_url}/arvados/v1/collections/{REMOTE_COLL}")).await?;
            assert_eq!(
                by_uuid["manifest_text"],
                format!(". {FOO}+Rbbbbb-{SIGNATURE} 0:3:foo\n")
            );

            let pdh = portable_data_hash(&remote_manifest());
            let by_pdh = get_json(&client, &format!("{base_url}/arvados/v1/collections/{pdh}")).await?;
            assert_eq!(by_pdh["uuid"], REMOTE_COLL);
            assert!(
                by_pdh["manifest_text"]
                    .as_str()
                    .is_some_and(|m| m.contains("+Rbbbbb-"))
            );

            let seen = remote.auth.lock().clone();
            assert!(!seen.is_empty());
            for header in &seen {
                assert!(header.starts_with(&format!("Bearer v2/{TOKEN_UUID}/")), "{header}");
                assert!(!header.contains(SECRET), "unsalted token sent to remote");
            }

            let status = client
                .get(format!("{base_url}/arvados/v1/no_such_things"))
                .bearer_auth(token())
                .send()
                .await?
                .status();
            assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

            Ok::<(), anyhow::Error>(())
        }
        .await;

        shutdown(&mut controller).await;
        result
    }

    #[tokio::test]
    async fn keep_balance_once_commits_pulls_and_trash() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let node0 = Arc::new(StorageNode::new(
            0,
            &[format!("{FOO} 12345678"), format!("{BAR} 12345678")],
        ));
        let node1 = Arc::new(StorageNode::new(1, &[]));
        let services = vec![
            keep_service(0, serve(node_stub(Arc::clone(&node0))).await?),
            keep_service(1, serve(node_stub(Arc::clone(&node1))).await?),
        ];
        let api = serve(api_stub(Arc::new(ApiStub::new(true, services)))).await?;
        let config = write_config(dir.path(), &balance_config(api))?;

        let output = run_keep_balance(&config, &["--once", "--commit-pulls", "--commit-trash", "--dump"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(
            output.status.success(),
            "keep-balance failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        assert!(stdout.contains(&FOO[..32]), "dump lacks foo: {stdout}");

        let pulls = node1.pulls.lock().clone();
        assert!(
            pulls
                .iter()
                .any(|body| body.contains(&FOO[..32]) && body.contains(&node1.mount)),
            "no pull for foo onto node1's mount: {pulls:?}"
        );
        assert!(node0.pulls.lock().iter().all(|body| !body.contains(&FOO[..32])));

        let trashes = node0.trashes.lock().clone();
        assert!(
            trashes
                .iter()
                .any(|body| body.contains(&BAR[..32]) && body.contains(&node0.mount)),
            "no trash for bar on node0's mount: {trashes:?}"
        );
        assert!(node0.trashes.lock().iter().all(|body| !body.contains(&FOO[..32])));
        Ok(())
    }

    #[tokio::test]
    async fn keep_balance_refuses_to_run_as_non_admin() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let node = Arc::new(StorageNode::new(0, &[format!("{BAR} 12345678")]));
        let services = vec![keep_service(0, serve(node_stub(Arc::clone(&node))).await?)];
        let api = serve(api_stub(Arc::new(ApiStub::new(false, services)))).await?;
        let config = write_config(dir.path(), &balance_config(api))?;

        let output = run_keep_balance(&config, &["--once", "--commit-pulls", "--commit-trash"]).await?;
        assert!(!output.status.success());
        assert!(node.pulls.lock().is_empty());
        assert!(node.trashes.lock().iter().all(|body| !body.contains(&BAR[..32])));
        Ok(())
    }

    async fn get_json(client: &reqwest::Client, url: &str) -> Result<Value> {
        let resp = client
            .get(url)
            .bearer_auth(token())
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            bail!("GET {url}: {status}: {body}");
        }
        serde_json::from_str(&body).with_context(|| format!("GET {url}: bad JSON {body:?}"))
    }

    async fn serve(app: Router) -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, app).await });
        Ok(addr)
    }

    fn free_port() -> Result<u16> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        Ok(listener.local_addr()?.port())
    }

    fn not_found() -> (StatusCode, Json<Value>) {
        (StatusCode::NOT_FOUND, Json(json!({"errors": ["Path not found"]})))
    }

    fn rails_stub() -> Router {
        Router::new().route(
            "/arvados/v1/collections/{id}",
            get(|UrlPath(id): UrlPath<String>| async move {
                if id != LOCAL_COLL {
                    return not_found();
                }
                (
                    StatusCode::OK,
                    Json(json!({
                        "uuid": LOCAL_COLL,
                        "portable_data_hash": portable_data_hash(&local_manifest()),
                        "manifest_text": local_manifest(),
                    })),
                )
            }),
        )
    }

    #[derive(Default)]
    struct RemoteCluster {
        auth: Mutex<Vec<String>>,
    }

    async fn remote_collection(
        State(remote): State<Arc<RemoteCluster>>,
        UrlPath(id): UrlPath<String>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<Value>) {
        if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            remote.auth.lock().push(auth.to_string());
        }
        let pdh = portable_data_hash(&remote_manifest());
        if id != REMOTE_COLL && id != pdh {
            return not_found();
        }
        (
            StatusCode::OK,
            Json(json!({
                "uuid": REMOTE_COLL,
                "portable_data_hash": pdh,
                "manifest_text": remote_manifest(),
            })),
        )
    }

    fn remote_stub(remote: Arc<RemoteCluster>) -> Router {
        Router::new()
            .route("/arvados/v1/collections/{id}", get(remote_collection))
            .with_state(remote)
    }

    #[derive(Default)]
    struct StorageNode {
        mount: String,
        lines: Vec<String>,
        pulls: Mutex<Vec<String>>,
        trashes: Mutex<Vec<String>>,
    }

    impl StorageNode {
        fn new(i: usize, lines: &[String]) -> Self {
            Self {
                mount: format!("zzzzz-ivpuk-{i:015}"),
                lines: lines.to_vec(),
                ..Default::default()
            }
        }
    }

    async fn node_mounts(State(node): State<Arc<StorageNode>>) -> Json<Value> {
        Json(json!([{
            "uuid": node.mount,
            "device_id": format!("{}-disk", node.mount),
            "replication": 1,
        }]))
    }

    async fn node_mount_blocks(
        state: State<Arc<StorageNode>>,
        UrlPath(_mount): UrlPath<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> String {
        let prefix = query.get("prefix").cloned().unwrap_or_default();
        node_index(state, UrlPath(prefix)).await
    }

    async fn node_index(State(node): State<Arc<StorageNode>>, UrlPath(prefix): UrlPath<String>) -> String {
        let mut body = String::new();
        for line in node.lines.iter().filter(|l| l.starts_with(&prefix)) {
            body.push_str(line);
            body.push('\n');
        }
        body.push('\n');
        body
    }

    async fn node_index_all(state: State<Arc<StorageNode>>) -> String {
        node_index(state, UrlPath(String::new())).await
    }

    fn node_stub(node: Arc<StorageNode>) -> Router {
        let pull_node = Arc::clone(&node);
        let trash_node = Arc::clone(&node);
        Router::new()
            .route("/index/", get(node_index_all))
            .route("/index/{prefix}", get(node_index))
            .route("/mounts", get(node_mounts))
            .route("/mounts/{uuid}/blocks", get(node_mount_blocks))
            .route(
                "/pull",
                put(move |body: String| async move {
                    pull_node.pulls.lock().push(body);
                    StatusCode::OK
                }),
            )
            .route(
                "/trash",
                put(move |body: String| async move {
                    trash_node.trashes.lock().push(body);
                    StatusCode::OK
                }),
            )
            .with_state(node)
    }

    fn keep_service(i: usize, addr: SocketAddr) -> Value {
        json!({
            "uuid": format!("zzzzz-bi6l4-{i:015}"),
            "service_host": addr.ip().to_string(),
            "service_port": addr.port(),
            "service_ssl_flag": false,
            "service_type": "disk",
        })
    }

    struct ApiStub {
        admin: bool,
        services: Vec<Value>,
        collections: Vec<Value>,
    }

    impl ApiStub {
        fn new(admin: bool, services: Vec<Value>) -> Self {
            Self {
                admin,
                services,
                collections: vec![json!({
                    "uuid": "zzzzz-4zz18-znfnqtbbv4spc3w",
                    "manifest_text": local_manifest(),
                    "modified_at": "2014-02-03T17:22:54Z",
                    "replication_desired": 2,
                })],
            }
        }
    }

    async fn api_collections(
        State(api): State<Arc<ApiStub>>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        let filters: Vec<Value> = query
            .get("filters")
            .and_then(|f| serde_json::from_str(f).ok())
            .unwrap_or_default();
        let operators: Vec<&str> = filters
            .iter()
            .filter_map(|f| f.get(1).and_then(Value::as_str))
            .collect();
        let available = if operators.contains(&"=") {
            0
        } else {
            api.collections.len()
        };
        let listing = filters.is_empty() && query.get("limit").map(String::as_str) != Some("0");
        let items = if listing {
            api.collections.clone()
        } else {
            Vec::new()
        };
        Json(json!({"items": items, "items_available": available}))
    }

    fn api_stub(api: Arc<ApiStub>) -> Router {
        Router::new()
            .route(
                "/arvados/v1/users/current",
                get(|State(api): State<Arc<ApiStub>>| async move {
                    Json(json!({
                        "uuid": "zzzzz-tpzed-000000000000000",
                        "is_active": true,
                        "is_admin": api.admin,
                    }))
                }),
            )
            .route(
                "/discovery/v1/apis/arvados/v1/rest",
                get(|| async {
                    Json(json!({
                        "defaultCollectionReplication": 2,
                        "blobSignatureTtl": 1_209_600,
                        "uuidPrefix": "zzzzz",
                    }))
                }),
            )
            .route(
                "/arvados/v1/keep_services/accessible",
                get(|State(api): State<Arc<ApiStub>>| async move {
                    Json(json!({"items": api.services, "items_available": api.services.len()}))
                }),
            )
            .route("/arvados/v1/collections", get(api_collections))
            .with_state(api)
    }

    fn controller_config(bind: &str, rails: SocketAddr, remote: SocketAddr, db: &Path) -> String {
        format!(
            r#"Clusters:
  zzzzz:
    SystemRootToken: {ROOT_TOKEN}
    Services:
      Controller:
        InternalURLs:
          "http://{bind}/": {{}}
      RailsAPI:
        InternalURLs:
          "http://{rails}/": {{}}
    RemoteClusters:
      bbbbb:
        Host: "{remote}"
        Scheme: http
        Proxy: true
    Collections:
      BlobSigning: true
      BlobSigningKey: zfhgfenhffzltr9dixws36j1yhksjoll2grmku38mi7yxd66h5j4q9w4jzanezacp8s6q0ro3hxakfye02152hncy6zml2ed0uc
      BlobSigningTTL: 336h
    API:
      MaxItemsPerResponse: 1000
      RequestTimeout: 30s
    Database:
      Path: "{db}"
"#,
            db = db.display()
        )
    }

    fn balance_config(api: SocketAddr) -> String {
        format!(
            r#"Clusters:
  zzzzz:
    SystemRootToken: {ROOT_TOKEN}
    Services:
      Controller:
        ExternalURL: "http://{api}"
    KeepBalance:
      RunPeriod: 10m
      CollectionBatchSize: 100
      CollectionBuffers: 10
      KeepServiceTypes: [disk]
"#
        )
    }

    fn write_config(dir: &Path, yaml: &str) -> Result<PathBuf> {
        let path = dir.join("config.yml");
        std::fs::write(&path, yaml).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    async fn start_controller(config: &Path, bind: &str) -> Result<Child> {
        let mut child = Command::new(workspace_binary("arvados-controller")?)
            .arg("--config")
            .arg(config)
            .arg("--bind")
            .arg(bind)
            .env("RUST_LOG", "warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("spawning arvados-controller")?;

        let ping = format!("http://{bind}/_health/ping");
        if let Err(err) = until_healthy(&ping, Duration::from_secs(10)).await {
            shutdown(&mut child).await;
            return Err(err.context("arvados-controller never became healthy"));
        }
        Ok(child)
    }

    async fn run_keep_balance(config: &Path, flags: &[&str]) -> Result<std::process::Output> {
        let run = Command::new(workspace_binary("keep-balance")?)
            .arg("--config")
            .arg(config)
            .args(flags)
            .env("RUST_LOG", "info")
            .kill_on_drop(true)
            .output();
        tokio::time::timeout(Duration::from_secs(60), run)
            .await
            .context("keep-balance still running after 60s")?
            .context("spawning keep-balance")
    }

    async fn until_healthy(url: &str, within: Duration) -> Result<()> {
        let http = reqwest::Client::new();
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let last = match http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => resp.status().to_string(),
                Err(err) => err.to_string(),
            };
            if tokio::time::Instant::now() >= deadline {
                bail!("GET {url}: still failing after {within:?} ({last})");
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    async fn shutdown(child: &mut Child) {
        child.kill().await.ok();
        child.wait().await.ok();
    }

    // Path of a workspace binary. The first call builds both daemons; later
    // calls reuse that outcome, failure included.
    fn workspace_binary(name: &str) -> Result<PathBuf> {
        static BIN_DIR: OnceLock<Result<PathBuf, String>> = OnceLock::new();
        let dir = BIN_DIR
            .get_or_init(|| build_daemons().map_err(|err| format!("{err:#}")))
            .as_ref()
            .map_err(|msg| anyhow!("daemons unavailable: {msg}"))?;
        let path = dir.join(format!("{name}{}", std::env::consts::EXE_SUFFIX));
        ensure!(path.is_file(), "{name}: no binary at {}", path.display());
        Ok(path)
    }

    fn build_daemons() -> Result<PathBuf> {
        let root = Path::new(env!("CARGO_MANIFEST_DIR"))
            .ancestors()
            .nth(2)
            .context("system-tests is not two levels below the workspace root")?;
        let cargo = std::env::var_os("CARGO").unwrap_or_else(|| "cargo".into());
        let status = std::process::Command::new(cargo)
            .args(["build", "--bin", "arvados-controller", "--bin", "keep-balance"])
            .current_dir(root)
            .status()
            .context("invoking cargo build")?;
        ensure!(status.success(), "cargo build exited with {status}");
        let target = std::env::var_os("CARGO_TARGET_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("target"));
        Ok(target.join("debug"))
    }
}
