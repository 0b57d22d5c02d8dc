use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::api::endpoint;
use common::model::*;
use common::options::*;
use common::{Api, ApiError, Endpoint, RequestContext};
use reqwest::header::{AUTHORIZATION, LOCATION};
use reqwest::{Client, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use url::Url;

use crate::TokenProvider;

#[derive(Clone)]
pub struct RpcConn {
    cluster_id: String,
    base_url: Url,
    http: Client,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for RpcConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConn")
            .field("cluster_id", &self.cluster_id)
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl RpcConn {
    pub fn new(
        cluster_id: &str,
        base_url: &str,
        insecure: bool,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, ApiError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|err| ApiError::internal(format!("invalid base URL {base_url:?}: {err}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        // Per-connection client; TLS settings are never shared between peers.
        let http = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| ApiError::internal(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            cluster_id: cluster_id.to_string(),
            base_url,
            http,
            tokens,
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn request<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        ep: &Endpoint,
        opts: &impl Serialize,
    ) -> Result<T, ApiError> {
        let tokens = self.tokens.tokens(ctx).await?;
        let opts = serde_json::to_value(opts)
            .map_err(|err| ApiError::internal(format!("failed to encode options: {err}")))?;
        let (path, params) = encode_request(ep, opts, &tokens)?;
        let url = self
            .base_url
            .join(&path)
            .map_err(|err| ApiError::internal(format!("invalid request path {path:?}: {err}")))?;
        let method = Method::from_bytes(ep.method.as_bytes())
            .map_err(|err| ApiError::internal(format!("invalid method {}: {err}", ep.method)))?;

        let mut req = self.http.request(method.clone(), url.clone()).header(
            AUTHORIZATION,
            format!("Bearer {}", tokens.first().map(String::as_str).unwrap_or("-")),
        );
        if !ctx.request_id.is_empty() {
            req = req.header("X-Request-Id", &ctx.request_id);
        }
        req = if method == Method::GET || method == Method::DELETE || method == Method::HEAD {
            req.query(&params)
        } else {
            req.form(&params)
        };

        let resp = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(ApiError::internal(format!("{method} {url}: request cancelled")));
            }
            resp = req.send() => resp,
        };
        let resp =
            resp.map_err(|err| ApiError::bad_gateway(format!("{method} {url}: {err}")))?;

        let status = resp.status();
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp
            .bytes()
            .await
            .map_err(|err| ApiError::bad_gateway(format!("{method} {url}: reading body: {err}")))?;

        if status.is_redirection()
            && let Some(location) = location
        {
            return serde_json::from_value(json!({ "redirect_location": location })).map_err(
                |err| ApiError::bad_gateway(format!("{method} {url}: decoding redirect: {err}")),
            );
        }
        if status.as_u16() >= 400 {
            return Err(error_from_response(status.as_u16(), &body, &method, &url));
        }

        let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
            b"{}"
        } else {
            &body
        };
        serde_json::from_slice(body)
            .map_err(|err| ApiError::bad_gateway(format!("{method} {url}: decoding response: {err}")))
    }

    // Strip scheme and host from a location on this connection's own host.
    fn relative_to_base_url(&self, location: String) -> String {
        let Ok(parsed) = Url::parse(&location) else {
            return location;
        };
        let same_host = parsed.scheme() == self.base_url.scheme()
            && parsed.host_str().map(str::to_ascii_lowercase)
                == self.base_url.host_str().map(str::to_ascii_lowercase)
            && parsed.port_or_known_default() == self.base_url.port_or_known_default();
        if !same_host {
            return location;
        }
        let mut relative = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            relative.push('?');
            relative.push_str(query);
        }
        if let Some(fragment) = parsed.fragment() {
            relative.push('#');
            relative.push_str(fragment);
        }
        relative
    }
}

pub(crate) fn encode_request(
    ep: &Endpoint,
    opts: Value,
    tokens: &[String],
) -> Result<(String, Vec<(String, String)>), ApiError> {
    let mut params = match opts {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(ApiError::internal(format!(
                "options must encode to an object, got {other}"
            )));
        }
    };

    if !ep.attrs_key.is_empty()
        && let Some(attrs) = params.remove("attrs")
    {
        params.insert(ep.attrs_key.to_string(), attrs);
    }
    if params
        .get("limit")
        .and_then(Value::as_i64)
        .is_some_and(|limit| limit < 0)
    {
        params.remove("limit");
    }

    let mut path = ep.path.to_string();
    if path.contains("{uuid}") {
        let uuid = match params.remove("uuid") {
            Some(Value::String(uuid)) if !uuid.is_empty() => uuid,
            _ => return Err(ApiError::bad_request(format!("{} {}: missing uuid", ep.method, ep.path))),
        };
        path = path.replace("{uuid}", &uuid);
    }

    if tokens.len() > 1 {
        params.insert("reader_tokens".to_string(), Value::from(tokens[1..].to_vec()));
    }

    let pairs = params
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect();
    Ok((path, pairs))
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

fn error_from_response(status: u16, body: &[u8], method: &Method, url: &Url) -> ApiError {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => ApiError::with_errors(status, parsed.errors),
        _ => {
            let text = String::from_utf8_lossy(body);
            let text = text.trim();
            if text.is_empty() {
                ApiError::new(status, format!("{method} {url}: HTTP {status}"))
            } else {
                ApiError::new(status, format!("{method} {url}: HTTP {status}: {text}"))
            }
        }
    }
}

#[async_trait]
impl Api for RpcConn {
    async fn config_get(&self, ctx: &RequestContext, opts: EmptyOptions) -> Result<Value, ApiError> {
        self.request(ctx, &endpoint::CONFIG_GET, &opts).await
    }
    async fn vocabulary_get(&self, ctx: &RequestContext, opts: EmptyOptions) -> Result<Value, ApiError> {
        self.request(ctx, &endpoint::VOCABULARY_GET, &opts).await
    }
    async fn discovery_document(&self, ctx: &RequestContext, opts: EmptyOptions) -> Result<DiscoveryDocument, ApiError> {
        self.request(ctx, &endpoint::DISCOVERY_DOCUMENT, &opts).await
    }
    async fn login(&self, ctx: &RequestContext, opts: LoginOptions) -> Result<LoginResponse, ApiError> {
        let mut resp: LoginResponse = self.request(ctx, &endpoint::LOGIN, &opts).await?;
        resp.redirect_location = self.relative_to_base_url(resp.redirect_location);
        Ok(resp)
    }
    async fn logout(&self, ctx: &RequestContext, opts: LogoutOptions) -> Result<LogoutResponse, ApiError> {
        let mut resp: LogoutResponse = self.request(ctx, &endpoint::LOGOUT, &opts).await?;
        resp.redirect_location = self.relative_to_base_url(resp.redirect_location);
        Ok(resp)
    }

    async fn collection_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Collection, ApiError> {
        self.request(ctx, &endpoint::COLLECTION_CREATE, &opts).await
    }
    async fn collection_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Collection, ApiError> {
        self.request(ctx, &endpoint::COLLECTION_UPDATE, &opts).await
    }
    async fn collection_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Collection, ApiError> {
        self.request(ctx, &endpoint::COLLECTION_GET, &opts).await
    }
    async fn collection_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Collection>, ApiError> {
        self.request(ctx, &endpoint::COLLECTION_LIST, &opts).await
    }
    async fn collection_provenance(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Map<String, Value>, ApiError> {
        self.request(ctx, &endpoint::COLLECTION_PROVENANCE, &opts).await
    }
    async fn collection_used_by(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Map<String, Value>, ApiError> {
        self.request(ctx, &endpoint::COLLECTION_USED_BY, &opts).await
    }
    async fn collection_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Collection, ApiError> {
        self.request(ctx, &endpoint::COLLECTION_DELETE, &opts).await
    }
    async fn collection_trash(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Collection, ApiError> {
        self.request(ctx, &endpoint::COLLECTION_TRASH, &opts).await
    }
    async fn collection_untrash(&self, ctx: &RequestContext, opts: UntrashOptions) -> Result<Collection, ApiError> {
        self.request(ctx, &endpoint::COLLECTION_UNTRASH, &opts).await
    }

    async fn container_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Container, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_CREATE, &opts).await
    }
    async fn container_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Container, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_UPDATE, &opts).await
    }
    async fn container_priority_update(&self, ctx: &RequestContext, opts: UpdatePriorityOptions) -> Result<Container, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_PRIORITY_UPDATE, &opts).await
    }
    async fn container_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Container, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_GET, &opts).await
    }
    async fn container_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Container>, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_LIST, &opts).await
    }
    async fn container_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Container, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_DELETE, &opts).await
    }
    async fn container_lock(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Container, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_LOCK, &opts).await
    }
    async fn container_unlock(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Container, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_UNLOCK, &opts).await
    }

    async fn container_request_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<ContainerRequest, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_REQUEST_CREATE, &opts).await
    }
    async fn container_request_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<ContainerRequest, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_REQUEST_UPDATE, &opts).await
    }
    async fn container_request_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<ContainerRequest, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_REQUEST_GET, &opts).await
    }
    async fn container_request_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<ContainerRequest>, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_REQUEST_LIST, &opts).await
    }
    async fn container_request_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<ContainerRequest, ApiError> {
        self.request(ctx, &endpoint::CONTAINER_REQUEST_DELETE, &opts).await
    }

    async fn group_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Group, ApiError> {
        self.request(ctx, &endpoint::GROUP_CREATE, &opts).await
    }
    async fn group_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Group, ApiError> {
        self.request(ctx, &endpoint::GROUP_UPDATE, &opts).await
    }
    async fn group_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Group, ApiError> {
        self.request(ctx, &endpoint::GROUP_GET, &opts).await
    }
    async fn group_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Group>, ApiError> {
        self.request(ctx, &endpoint::GROUP_LIST, &opts).await
    }
    async fn group_contents(&self, ctx: &RequestContext, opts: GroupContentsOptions) -> Result<ObjectList, ApiError> {
        let ep = if opts.uuid.is_empty() {
            &endpoint::GROUP_CONTENTS
        } else {
            &endpoint::GROUP_CONTENTS_UUID_IN_PATH
        };
        self.request(ctx, ep, &opts).await
    }
    async fn group_shared(&self, ctx: &RequestContext, opts: ListOptions) -> Result<ObjectList, ApiError> {
        self.request(ctx, &endpoint::GROUP_SHARED, &opts).await
    }
    async fn group_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Group, ApiError> {
        self.request(ctx, &endpoint::GROUP_DELETE, &opts).await
    }
    async fn group_trash(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Group, ApiError> {
        self.request(ctx, &endpoint::GROUP_TRASH, &opts).await
    }
    async fn group_untrash(&self, ctx: &RequestContext, opts: UntrashOptions) -> Result<Group, ApiError> {
        self.request(ctx, &endpoint::GROUP_UNTRASH, &opts).await
    }

    async fn link_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Link, ApiError> {
        self.request(ctx, &endpoint::LINK_CREATE, &opts).await
    }
    async fn link_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Link, ApiError> {
        self.request(ctx, &endpoint::LINK_UPDATE, &opts).await
    }
    async fn link_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Link, ApiError> {
        self.request(ctx, &endpoint::LINK_GET, &opts).await
    }
    async fn link_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Link>, ApiError> {
        self.request(ctx, &endpoint::LINK_LIST, &opts).await
    }
    async fn link_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Link, ApiError> {
        self.request(ctx, &endpoint::LINK_DELETE, &opts).await
    }

    async fn specimen_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<Specimen, ApiError> {
        self.request(ctx, &endpoint::SPECIMEN_CREATE, &opts).await
    }
    async fn specimen_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<Specimen, ApiError> {
        self.request(ctx, &endpoint::SPECIMEN_UPDATE, &opts).await
    }
    async fn specimen_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<Specimen, ApiError> {
        self.request(ctx, &endpoint::SPECIMEN_GET, &opts).await
    }
    async fn specimen_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<Specimen>, ApiError> {
        self.request(ctx, &endpoint::SPECIMEN_LIST, &opts).await
    }
    async fn specimen_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<Specimen, ApiError> {
        self.request(ctx, &endpoint::SPECIMEN_DELETE, &opts).await
    }

    async fn sys_trash_sweep(&self, ctx: &RequestContext, opts: EmptyOptions) -> Result<Value, ApiError> {
        self.request(ctx, &endpoint::SYS_TRASH_SWEEP, &opts).await
    }

    async fn user_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<User, ApiError> {
        self.request(ctx, &endpoint::USER_CREATE, &opts).await
    }
    async fn user_update(&self, ctx: &RequestContext, opts: UpdateOptions) -> Result<User, ApiError> {
        self.request(ctx, &endpoint::USER_UPDATE, &opts).await
    }
    async fn user_merge(&self, ctx: &RequestContext, opts: UserMergeOptions) -> Result<User, ApiError> {
        self.request(ctx, &endpoint::USER_MERGE, &opts).await
    }
    async fn user_activate(&self, ctx: &RequestContext, opts: UserActivateOptions) -> Result<User, ApiError> {
        self.request(ctx, &endpoint::USER_ACTIVATE, &opts).await
    }
    async fn user_setup(&self, ctx: &RequestContext, opts: UserSetupOptions) -> Result<Map<String, Value>, ApiError> {
        self.request(ctx, &endpoint::USER_SETUP, &opts).await
    }
    async fn user_unsetup(&self, ctx: &RequestContext, opts: GetOptions) -> Result<User, ApiError> {
        self.request(ctx, &endpoint::USER_UNSETUP, &opts).await
    }
    async fn user_get(&self, ctx: &RequestContext, opts: GetOptions) -> Result<User, ApiError> {
        self.request(ctx, &endpoint::USER_GET, &opts).await
    }
    async fn user_get_current(&self, ctx: &RequestContext, opts: GetOptions) -> Result<User, ApiError> {
        self.request(ctx, &endpoint::USER_GET_CURRENT, &opts).await
    }
    async fn user_get_system(&self, ctx: &RequestContext, opts: GetOptions) -> Result<User, ApiError> {
        self.request(ctx, &endpoint::USER_GET_SYSTEM, &opts).await
    }
    async fn user_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<User>, ApiError> {
        self.request(ctx, &endpoint::USER_LIST, &opts).await
    }
    async fn user_delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> Result<User, ApiError> {
        self.request(ctx, &endpoint::USER_DELETE, &opts).await
    }
    async fn user_batch_update(&self, ctx: &RequestContext, opts: UserBatchUpdateOptions) -> Result<List<User>, ApiError> {
        self.request(ctx, &endpoint::USER_BATCH_UPDATE, &opts).await
    }
    async fn user_authenticate(&self, ctx: &RequestContext, opts: UserAuthenticateOptions) -> Result<ApiClientAuthorization, ApiError> {
        self.request(ctx, &endpoint::USER_AUTHENTICATE, &opts).await
    }

    async fn api_client_authorization_current(&self, ctx: &RequestContext, opts: GetOptions) -> Result<ApiClientAuthorization, ApiError> {
        self.request(ctx, &endpoint::API_CLIENT_AUTHORIZATION_CURRENT, &opts).await
    }
    async fn api_client_authorization_create(&self, ctx: &RequestContext, opts: CreateOptions) -> Result<ApiClientAuthorization, ApiError> {
        self.request(ctx, &endpoint::API_CLIENT_AUTHORIZATION_CREATE, &opts).await
    }
    async fn api_client_authorization_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<ApiClientAuthorization>, ApiError> {
        self.request(ctx, &endpoint::API_CLIENT_AUTHORIZATION_LIST, &opts).await
    }

    async fn keep_service_list(&self, ctx: &RequestContext, opts: ListOptions) -> Result<List<KeepService>, ApiError> {
        self.request(ctx, &endpoint::KEEP_SERVICE_LIST, &opts).await
    }
}

#[cfg(test)]
#[path = "conn_tests.rs"]
mod tests;
