use std::time::Duration;

use anyhow::{Context, Result, bail};
use balance_core::{IndexEntry, Pull, Trash, parse_index};
use common::model::{KeepMount, KeepService};
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;

#[derive(Clone)]
pub struct KeepClient {
    http: Client,
    token: String,
}

impl std::fmt::Debug for KeepClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepClient").finish_non_exhaustive()
    }
}

impl KeepClient {
    // No overall timeout: a large node's index takes minutes.
    pub fn new(token: impl Into<String>, insecure: bool) -> Result<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            token: token.into(),
        })
    }

    pub async fn mounts(&self, svc: &KeepService) -> Result<Option<Vec<KeepMount>>> {
        let url = format!("{}/mounts", svc.url_base());
        let resp = self.get(&url).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let mounts = check_status(resp, "GET", &url)
            .await?
            .json()
            .await
            .with_context(|| format!("GET {url}: decoding mount list"))?;
        Ok(Some(mounts))
    }

    pub async fn index(&self, svc: &KeepService, prefix: &str) -> Result<Vec<IndexEntry>> {
        let url = format!("{}/index/{prefix}", svc.url_base());
        self.fetch_index(&url, prefix).await
    }

    pub async fn mount_index(&self, svc: &KeepService, mount_uuid: &str, prefix: &str) -> Result<Vec<IndexEntry>> {
        let url = format!("{}/mounts/{mount_uuid}/blocks?prefix={prefix}", svc.url_base());
        self.fetch_index(&url, prefix).await
    }

    async fn fetch_index(&self, url: &str, prefix: &str) -> Result<Vec<IndexEntry>> {
        let resp = self.get(url).await?;
        let body = check_status(resp, "GET", url)
            .await?
            .text()
            .await
            .with_context(|| format!("GET {url}: reading body"))?;
        Ok(parse_index(&body, prefix)?)
    }

    async fn get(&self, url: &str) -> Result<Response> {
        self.http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {url}"))
    }

    pub async fn send_pulls(&self, svc: &KeepService, pulls: Vec<Pull>) -> Result<()> {
        self.put_list(svc, "pull", &pulls).await
    }

    /// An empty list cancels whatever trash work the node still has queued.
    pub async fn send_trashes(&self, svc: &KeepService, trashes: Vec<Trash>) -> Result<()> {
        self.put_list(svc, "trash", &trashes).await
    }

    async fn put_list<T: Serialize>(&self, svc: &KeepService, path: &str, list: &[T]) -> Result<()> {
        let url = format!("{}/{path}", svc.url_base());
        let resp = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .json(list)
            .send()
            .await
            .with_context(|| format!("PUT {url}"))?;
        check_status(resp, "PUT", &url).await?;
        Ok(())
    }
}

async fn check_status(resp: Response, method: &str, url: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    bail!("{method} {url}: {status}: {}", body.trim())
}
