//! HTTP front end: maps each REST endpoint onto a typed `Api` call.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use common::api::endpoint;
use common::ids::{self, new_request_id};
use common::token::log_label;
use common::{Api, ApiError, Endpoint, HealthStatus, RequestContext};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::auth::{AuthCache, AuthLookup};
use crate::db::{Database, wrap_in_transaction};
use crate::params;

const MAX_BODY: usize = 128 << 20;
const NOT_FOUND: &str = "API endpoint not found";
const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const METHOD_OVERRIDE: HeaderName = HeaderName::from_static("x-http-method-override");

const CORS_METHODS: &str = "GET, HEAD, OPTIONS, PROPFIND, PUT, POST, PATCH, DELETE";
const CORS_HEADERS: &str = "Authorization, Content-Type, Range, X-Http-Method-Override";

type CallFuture = Pin<Box<dyn Future<Output = Result<Value, ApiError>> + Send>>;
type Call = Box<dyn Fn(Arc<dyn Api>, RequestContext, Map<String, Value>) -> CallFuture + Send + Sync>;

struct Route {
    endpoint: Endpoint,
    segments: Vec<&'static str>,
    call: Call,
}

impl Route {
    fn capture(&self, path: &[&str]) -> Option<Option<String>> {
        if path.len() != self.segments.len() {
            return None;
        }
        let mut uuid = None;
        for (want, got) in self.segments.iter().zip(path) {
            if *want == "{uuid}" {
                if got.is_empty() {
                    return None;
                }
                uuid = Some(got.to_string());
            } else if want != got {
                return None;
            }
        }
        Some(uuid)
    }

    fn accepts(&self, method: &str) -> bool {
        let want = self.endpoint.method;
        want == method || (want == "PATCH" && method == "PUT") || (want == "GET" && method == "HEAD")
    }

    fn placeholders(&self) -> usize {
        self.segments.iter().filter(|s| **s == "{uuid}").count()
    }
}

fn route<O, T, F, Fut>(endpoint: Endpoint, f: F) -> Route
where
    O: DeserializeOwned + 'static,
    T: Serialize + Send + 'static,
    F: Fn(Arc<dyn Api>, RequestContext, O) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
{
    let call: Call = Box::new(
        move |api: Arc<dyn Api>, ctx: RequestContext, params: Map<String, Value>| -> CallFuture {
            let opts: O = match serde_json::from_value(Value::Object(params)) {
                Ok(opts) => opts,
                Err(err) => {
                    let err = ApiError::bad_request(format!("error decoding parameters: {err}"));
                    return Box::pin(async move { Err(err) });
                }
            };
            let fut = f(api, ctx, opts);
            Box::pin(async move {
                let out = fut.await?;
                serde_json::to_value(out).map_err(|err| ApiError::internal(err.to_string()))
            })
        },
    );
    Route {
        endpoint,
        segments: endpoint.path.split('/').collect(),
        call,
    }
}

macro_rules! api_route {
    ($ep:ident => $method:ident) => {
        route(endpoint::$ep, |api: Arc<dyn Api>, ctx: RequestContext, opts| async move {
            api.$method(&ctx, opts).await
        })
    };
}

// Routes with literal segments sort ahead of `{uuid}` routes of the same
// shape, so `users/current` wins over `users/{uuid}`.
fn routes() -> Vec<Route> {
    let mut routes = vec![
        api_route!(CONFIG_GET => config_get),
        api_route!(VOCABULARY_GET => vocabulary_get),
        api_route!(DISCOVERY_DOCUMENT => discovery_document),
        api_route!(LOGIN => login),
        api_route!(LOGOUT => logout),
        api_route!(COLLECTION_CREATE => collection_create),
        api_route!(COLLECTION_UPDATE => collection_update),
        api_route!(COLLECTION_GET => collection_get),
        api_route!(COLLECTION_LIST => collection_list),
        api_route!(COLLECTION_PROVENANCE => collection_provenance),
        api_route!(COLLECTION_USED_BY => collection_used_by),
        api_route!(COLLECTION_DELETE => collection_delete),
        api_route!(COLLECTION_TRASH => collection_trash),
        api_route!(COLLECTION_UNTRASH => collection_untrash),
        api_route!(CONTAINER_CREATE => container_create),
        api_route!(CONTAINER_UPDATE => container_update),
        api_route!(CONTAINER_PRIORITY_UPDATE => container_priority_update),
        api_route!(CONTAINER_GET => container_get),
        api_route!(CONTAINER_LIST => container_list),
        api_route!(CONTAINER_DELETE => container_delete),
        api_route!(CONTAINER_LOCK => container_lock),
        api_route!(CONTAINER_UNLOCK => container_unlock),
        api_route!(CONTAINER_REQUEST_CREATE => container_request_create),
        api_route!(CONTAINER_REQUEST_UPDATE => container_request_update),
        api_route!(CONTAINER_REQUEST_GET => container_request_get),
        api_route!(CONTAINER_REQUEST_LIST => container_request_list),
        api_route!(CONTAINER_REQUEST_DELETE => container_request_delete),
        api_route!(GROUP_CREATE => group_create),
        api_route!(GROUP_UPDATE => group_update),
        api_route!(GROUP_GET => group_get),
        api_route!(GROUP_LIST => group_list),
        api_route!(GROUP_CONTENTS => group_contents),
        api_route!(GROUP_CONTENTS_UUID_IN_PATH => group_contents),
        api_route!(GROUP_SHARED => group_shared),
        api_route!(GROUP_DELETE => group_delete),
        api_route!(GROUP_TRASH => group_trash),
        api_route!(GROUP_UNTRASH => group_untrash),
        api_route!(LINK_CREATE => link_create),
        api_route!(LINK_UPDATE => link_update),
        api_route!(LINK_GET => link_get),
        api_route!(LINK_LIST => link_list),
        api_route!(LINK_DELETE => link_delete),
        api_route!(SPECIMEN_CREATE => specimen_create),
        api_route!(SPECIMEN_UPDATE => specimen_update),
        api_route!(SPECIMEN_GET => specimen_get),
        api_route!(SPECIMEN_LIST => specimen_list),
        api_route!(SPECIMEN_DELETE => specimen_delete),
        api_route!(SYS_TRASH_SWEEP => sys_trash_sweep),
        api_route!(USER_CREATE => user_create),
        api_route!(USER_UPDATE => user_update),
        api_route!(USER_MERGE => user_merge),
        api_route!(USER_ACTIVATE => user_activate),
        api_route!(USER_SETUP => user_setup),
        api_route!(USER_UNSETUP => user_unsetup),
        api_route!(USER_GET => user_get),
        api_route!(USER_GET_CURRENT => user_get_current),
        api_route!(USER_GET_SYSTEM => user_get_system),
        api_route!(USER_LIST => user_list),
        api_route!(USER_DELETE => user_delete),
        api_route!(USER_BATCH_UPDATE => user_batch_update),
        api_route!(USER_AUTHENTICATE => user_authenticate),
        api_route!(API_CLIENT_AUTHORIZATION_CURRENT => api_client_authorization_current),
        api_route!(API_CLIENT_AUTHORIZATION_CREATE => api_client_authorization_create),
        api_route!(API_CLIENT_AUTHORIZATION_LIST => api_client_authorization_list),
        api_route!(KEEP_SERVICE_LIST => keep_service_list),
    ];
    routes.sort_by_key(Route::placeholders);
    routes
}

pub struct ApiRouter {
    api: Arc<dyn Api>,
    db: Option<Database>,
    auth: Option<Arc<AuthCache>>,
    request_timeout: Option<Duration>,
}

impl ApiRouter {
    pub fn new(api: Arc<dyn Api>) -> Self {
        Self {
            api,
            db: None,
            auth: None,
            request_timeout: None,
        }
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_auth_cache(mut self, auth: Arc<AuthCache>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_request_timeout(mut self, limit: Duration) -> Self {
        self.request_timeout = Some(limit).filter(|d| !d.is_zero());
        self
    }

    pub fn into_router(self) -> Router {
        let dispatcher = Arc::new(Dispatcher {
            routes: routes(),
            api: self.api,
            db: self.db,
            auth: self.auth,
            request_timeout: self.request_timeout,
        });
        Router::new()
            .route("/_health/ping", get(health_ping))
            .fallback(dispatch)
            .with_state(dispatcher)
    }
}

struct Dispatcher {
    routes: Vec<Route>,
    api: Arc<dyn Api>,
    db: Option<Database>,
    auth: Option<Arc<AuthCache>>,
    request_timeout: Option<Duration>,
}

async fn health_ping() -> Json<HealthStatus> {
    Json(HealthStatus::ok())
}

async fn dispatch(State(rtr): State<Arc<Dispatcher>>, req: Request) -> Response {
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let request_id = parts
        .headers
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(new_request_id);
    let path = parts.uri.path().trim_start_matches('/');

    let (mut resp, tokens) = if parts.method == Method::OPTIONS {
        (StatusCode::OK.into_response(), Vec::new())
    } else {
        rtr.serve(&parts, body, &request_id, path).await
    };

    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID, v);
    }
    if !cors_exempt(path) {
        add_cors_headers(headers);
    }

    let token_uuids: Vec<String> = tokens.iter().map(|t| log_label(t)).collect();
    info!(
        method = %parts.method,
        path = %parts.uri.path(),
        status = resp.status().as_u16(),
        request_id = %request_id,
        token_uuids = ?token_uuids,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    resp
}

// Login and logout pages set cookies and redirect; cross-origin callers
// must not drive them.
fn cors_exempt(path: &str) -> bool {
    matches!(path.split('/').next(), Some("login" | "logout" | "auth"))
}

fn add_cors_headers(headers: &mut HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(CORS_METHODS));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(CORS_HEADERS));
    headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static("Content-Range"));
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86486400"));
}

fn error_response(err: &ApiError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

impl Dispatcher {
    async fn serve(&self, parts: &Parts, body: Body, request_id: &str, path: &str) -> (Response, Vec<String>) {
        let bytes = match to_bytes(body, MAX_BODY).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let err = ApiError::bad_request(format!("error reading request body: {err}"));
                return (error_response(&err), Vec::new());
            }
        };
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let mut loaded = match params::load(parts.uri.query(), content_type, &bytes) {
            Ok(loaded) => loaded,
            Err(err) => return (error_response(&err), Vec::new()),
        };

        let mut tokens: Vec<String> = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(params::header_token)
            .map(ToString::to_string)
            .into_iter()
            .collect();
        tokens.append(&mut loaded.tokens);

        let mut method = parts.method.as_str().to_string();
        if parts.method == Method::POST {
            if let Some(m) = loaded.method_override.take() {
                method = m;
            } else if let Some(m) = parts
                .headers
                .get(&METHOD_OVERRIDE)
                .and_then(|v| v.to_str().ok())
                .filter(|m| !m.is_empty())
            {
                method = m.to_ascii_uppercase();
            }
        }

        let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
        let (route, uuid) = match self.find(&segments, &method) {
            Ok(found) => found,
            Err(err) => return (error_response(&err), tokens),
        };

        loaded.take_attrs(route.endpoint.attrs_key);
        let mut params = loaded.params;
        if let Some(uuid) = uuid {
            params.insert("uuid".into(), Value::String(uuid));
        }
        let select: Vec<String> = params
            .get("select")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(ToString::to_string)).collect())
            .unwrap_or_default();

        let mut ctx = RequestContext::new();
        ctx.tokens = tokens.clone();
        ctx.request_id = request_id.to_string();
        if let Some(cache) = &self.auth {
            ctx = ctx.with_value(Arc::new(AuthLookup(Arc::clone(cache))));
        }
        // Outstanding fan-out work stops once the response is decided or
        // the client goes away.
        let _cancel = ctx.cancel.clone().drop_guard();

        let resp = match self.call(route, ctx, params).await {
            Ok(value) => reply(route.endpoint, &method, value, &select),
            Err(err) => {
                if err.http_status() >= 500 {
                    error!(error = %err, request_id, "API call failed");
                }
                error_response(&err)
            }
        };
        (resp, tokens)
    }

    fn find(&self, segments: &[&str], method: &str) -> Result<(&Route, Option<String>), ApiError> {
        let mut shape_matched = false;
        for route in &self.routes {
            let Some(uuid) = route.capture(segments) else {
                continue;
            };
            if route.accepts(method) {
                return Ok((route, uuid));
            }
            shape_matched = true;
        }
        Err(if shape_matched {
            ApiError::new(405, NOT_FOUND)
        } else {
            ApiError::not_found(NOT_FOUND)
        })
    }

    async fn call(&self, route: &Route, ctx: RequestContext, params: Map<String, Value>) -> Result<Value, ApiError> {
        let api = Arc::clone(&self.api);
        let cancel = ctx.cancel.clone();
        let work = async {
            match &self.db {
                Some(db) => wrap_in_transaction(db, ctx, |ctx| (route.call)(api, ctx, params)).await,
                None => (route.call)(api, ctx, params).await,
            }
        };
        let Some(limit) = self.request_timeout else {
            return work.await;
        };
        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(ApiError::new(504, format!("request timed out after {limit:?}")))
            }
        }
    }
}

fn reply(endpoint: Endpoint, method: &str, value: Value, select: &[String]) -> Response {
    if endpoint == endpoint::LOGIN || endpoint == endpoint::LOGOUT {
        if let Some(location) = value
            .get("redirect_location")
            .and_then(Value::as_str)
            .filter(|l| !l.is_empty())
        {
            return match HeaderValue::from_str(location) {
                Ok(location) => (StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response(),
                Err(_) => error_response(&ApiError::internal(format!(
                    "invalid redirect location {location:?}"
                ))),
            };
        }
        if let Some(html) = value.get("html").and_then(Value::as_str).filter(|h| !h.is_empty()) {
            return Html(html.to_string()).into_response();
        }
    }
    if method == "HEAD" {
        return StatusCode::OK.into_response();
    }
    Json(decorate(value, endpoint, select)).into_response()
}

fn decorate(mut value: Value, endpoint: Endpoint, select: &[String]) -> Value {
    let is_list = value.get("items").is_some_and(Value::is_array);
    if !is_list {
        shape_object(&mut value, select);
        return value;
    }
    if let Some(Value::Array(items)) = value.get_mut("items") {
        for item in items {
            shape_object(item, select);
        }
    }
    if let (Some(kind), Value::Object(obj)) = (list_kind(endpoint.path), &mut value) {
        obj.entry("kind").or_insert(Value::String(kind));
    }
    value
}

fn shape_object(value: &mut Value, select: &[String]) {
    let Value::Object(obj) = value else {
        return;
    };
    let kind = obj.get("uuid").and_then(Value::as_str).and_then(object_kind);
    if !select.is_empty() {
        obj.retain(|k, _| k == "kind" || select.iter().any(|s| s == k));
    }
    if let Some(kind) = kind {
        obj.entry("kind").or_insert(Value::String(kind.to_string()));
    }
}

fn object_kind(uuid: &str) -> Option<&'static str> {
    Some(match ids::object_type(uuid) {
        ids::COLLECTION => "arvados#collection",
        ids::CONTAINER => "arvados#container",
        ids::CONTAINER_REQUEST => "arvados#containerRequest",
        ids::GROUP => "arvados#group",
        ids::USER => "arvados#user",
        ids::LINK => "arvados#link",
        ids::SPECIMEN => "arvados#specimen",
        ids::API_CLIENT_AUTHORIZATION => "arvados#apiClientAuthorization",
        ids::KEEP_SERVICE => "arvados#keepService",
        _ => return None,
    })
}

fn list_kind(path: &str) -> Option<String> {
    let mut segments = path.split('/');
    if segments.next() != Some("arvados") {
        return None;
    }
    let resource = segments.nth(1)?;
    if path.ends_with("/contents") || path.ends_with("/shared") {
        return Some("arvados#objectList".to_string());
    }
    let singular = resource.strip_suffix('s').unwrap_or(resource);
    let mut kind = String::from("arvados#");
    for (i, word) in singular.split('_').enumerate() {
        let mut chars = word.chars();
        if i > 0
            && let Some(first) = chars.next()
        {
            kind.extend(first.to_uppercase());
        }
        kind.push_str(chars.as_str());
    }
    kind.push_str("List");
    Some(kind)
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
