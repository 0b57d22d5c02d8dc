use common::ApiError;
use serde_json::{Map, Value};
use url::form_urlencoded;

const BOOL_PARAMS: &[&str] = &[
    "bypass_federation",
    "distinct",
    "ensure_unique_name",
    "exclude_home_project",
    "include_old_versions",
    "include_trash",
    "recursive",
    "redirect_to_new_user",
    "send_notification_email",
];

const INT_PARAMS: &[&str] = &["limit", "offset"];

#[derive(Debug, Default, PartialEq)]
pub struct Loaded {
    pub params: Map<String, Value>,
    pub tokens: Vec<String>,
    pub method_override: Option<String>,
    json_body: Option<Map<String, Value>>,
}

impl Loaded {
    pub fn take_attrs(&mut self, attrs_key: &str) {
        let params = &mut self.params;
        if attrs_key.is_empty() {
            return;
        }
        if let Some(v) = params.remove(attrs_key) {
            params.insert("attrs".into(), v);
        } else if !params.contains_key("attrs")
            && let Some(body) = self.json_body.take()
        {
            params.insert("attrs".into(), Value::Object(body));
        }
        if let Some(Value::String(s)) = params.get("attrs")
            && let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(s)
        {
            params.insert("attrs".into(), v);
        }
    }
}

pub fn load(
    query: Option<&str>,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<Loaded, ApiError> {
    let mut params = Map::new();
    if let Some(query) = query {
        merge_form(&mut params, query.as_bytes());
    }

    let mut json_body = None;
    let content_type = content_type.unwrap_or("");
    if content_type.starts_with("application/x-www-form-urlencoded") {
        merge_form(&mut params, body);
    } else if !body.iter().all(u8::is_ascii_whitespace) {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(obj)) => {
                for (k, v) in &obj {
                    params.insert(k.clone(), v.clone());
                }
                json_body = Some(obj);
            }
            Ok(_) => return Err(ApiError::bad_request("request body must be a JSON object")),
            Err(err) if content_type.starts_with("application/json") => {
                return Err(ApiError::bad_request(format!(
                    "error decoding request body: {err}"
                )));
            }
            // Clients routinely post empty or opaque bodies without a
            // content type; those carry no parameters.
            Err(_) => {}
        }
    }

    let method_override = match params.remove("_method") {
        Some(Value::String(m)) if !m.is_empty() => Some(m.to_ascii_uppercase()),
        _ => None,
    };

    let mut tokens = Vec::new();
    if let Some(Value::String(token)) = params.remove("api_token")
        && !token.is_empty()
    {
        tokens.push(token);
    }
    match params.remove("reader_tokens") {
        Some(Value::Array(items)) => {
            tokens.extend(items.into_iter().filter_map(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s),
                _ => None,
            }));
        }
        Some(Value::String(s)) if !s.is_empty() => tokens.push(s),
        _ => {}
    }

    coerce(&mut params)?;

    Ok(Loaded {
        params,
        tokens,
        method_override,
        json_body,
    })
}

fn merge_form(params: &mut Map<String, Value>, raw: &[u8]) {
    for (k, v) in form_urlencoded::parse(raw) {
        params.insert(k.into_owned(), form_value(&v));
    }
}

fn form_value(raw: &str) -> Value {
    if (raw.starts_with('[') || raw.starts_with('{'))
        && let Ok(v) = serde_json::from_str(raw)
    {
        return v;
    }
    Value::String(raw.to_string())
}

fn coerce(params: &mut Map<String, Value>) -> Result<(), ApiError> {
    for key in BOOL_PARAMS {
        if let Some(v) = params.get_mut(*key) {
            *v = Value::Bool(parse_bool(key, v)?);
        }
    }
    for key in INT_PARAMS {
        if let Some(Value::String(s)) = params.get(*key) {
            let n: i64 = s.trim().parse().map_err(|_| {
                ApiError::bad_request(format!("invalid value {s:?} for integer parameter {key}"))
            })?;
            params.insert(key.to_string(), Value::from(n));
        }
    }

    for key in ["order", "select"] {
        if let Some(v) = params.get_mut(key) {
            *v = Value::Array(string_list(v).into_iter().map(Value::String).collect());
        }
    }
    if let Some(v) = params.get_mut("include") {
        *v = Value::String(string_list(v).join(","));
    }

    if let Some(Value::Array(filters)) = params.get_mut("filters") {
        for f in filters.iter_mut() {
            if let Value::String(expr) = f {
                *f = Value::Array(vec![
                    Value::String(std::mem::take(expr)),
                    Value::String("=".into()),
                    Value::Bool(true),
                ]);
            }
        }
    }
    Ok(())
}

fn parse_bool(key: &str, v: &Value) -> Result<bool, ApiError> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::Number(n) => Ok(n.as_i64() != Some(0)),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" | "" => Ok(false),
            _ => Err(ApiError::bad_request(format!(
                "invalid value {s:?} for boolean parameter {key}"
            ))),
        },
        _ => Err(ApiError::bad_request(format!(
            "invalid value {v} for boolean parameter {key}"
        ))),
    }
}

fn string_list(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

pub fn header_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    match scheme {
        "Bearer" | "OAuth2" => Some(token.trim()).filter(|t| !t.is_empty()),
        _ => None,
    }
}
