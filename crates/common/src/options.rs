use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn default_limit() -> i64 {
    -1
}

// `order` arrives either as `"a desc,b"` or as `["a desc","b"]`.
fn order_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Order {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match Order::deserialize(deserializer)? {
        Order::One(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Order::Many(v) => v,
        Order::Null(()) => Vec::new(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(String, String, Value)", into = "(String, String, Value)")]
pub struct Filter {
    pub attr: String,
    pub operator: String,
    pub operand: Value,
}

impl Filter {
    pub fn new(attr: impl Into<String>, operator: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self {
            attr: attr.into(),
            operator: operator.into(),
            operand: operand.into(),
        }
    }
}

impl From<(String, String, Value)> for Filter {
    fn from((attr, operator, operand): (String, String, Value)) -> Self {
        Self {
            attr,
            operator,
            operand,
        }
    }
}

impl From<Filter> for (String, String, Value) {
    fn from(f: Filter) -> Self {
        (f.attr, f.operator, f.operand)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmptyOptions {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub include_trash: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub bypass_federation: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub forwarded_for: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub offset: i64,
    #[serde(deserialize_with = "order_list", skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub distinct: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub count: String,
    #[serde(skip_serializing_if = "is_false")]
    pub include_trash: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub include_old_versions: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub bypass_federation: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub forwarded_for: String,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            select: Vec::new(),
            filters: Vec::new(),
            limit: -1,
            offset: 0,
            order: Vec::new(),
            distinct: false,
            count: String::new(),
            include_trash: false,
            include_old_versions: false,
            bypass_federation: false,
            forwarded_for: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupContentsOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub offset: i64,
    #[serde(deserialize_with = "order_list", skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub count: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub include: String,
    #[serde(skip_serializing_if = "is_false")]
    pub recursive: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub include_trash: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub include_old_versions: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub exclude_home_project: bool,
}

impl Default for GroupContentsOptions {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            uuid: String::new(),
            select: Vec::new(),
            filters: Vec::new(),
            limit: -1,
            offset: 0,
            order: Vec::new(),
            count: String::new(),
            include: String::new(),
            recursive: false,
            include_trash: false,
            include_old_versions: false,
            exclude_home_project: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,
    #[serde(skip_serializing_if = "is_false")]
    pub ensure_unique_name: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    pub attrs: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    pub attrs: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub bypass_federation: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UntrashOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(skip_serializing_if = "is_false")]
    pub ensure_unique_name: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePriorityOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub return_to: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogoutOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub return_to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserActivateOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSetupOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub openid_prefix: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub repo_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub vm_uuid: String,
    #[serde(skip_serializing_if = "is_false")]
    pub send_notification_email: bool,
    pub attrs: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserMergeOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub new_user_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub new_owner_uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub new_user_uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub old_user_uuid: String,
    #[serde(skip_serializing_if = "is_false")]
    pub redirect_to_new_user: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserBatchUpdateOptions {
    pub updates: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAuthenticateOptions {
    pub username: String,
    pub password: String,
}
