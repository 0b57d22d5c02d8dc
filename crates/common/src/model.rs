use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Timestamp = DateTime<Utc>;
pub type Properties = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List<T> {
    #[serde(default)]
    pub items: Vec<T>,
    #[serde(default)]
    pub items_available: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub limit: i64,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::from_items(Vec::new())
    }
}

impl<T> List<T> {
    pub fn from_items(items: Vec<T>) -> Self {
        let items_available = items.len() as i64;
        Self {
            items,
            items_available,
            offset: 0,
            limit: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectList {
    pub items: Vec<Value>,
    pub included: Vec<Value>,
    pub items_available: i64,
    pub offset: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Collection {
    pub uuid: String,
    pub owner_uuid: String,
    pub created_at: Option<Timestamp>,
    pub modified_at: Option<Timestamp>,
    pub modified_by_user_uuid: String,
    pub name: String,
    pub description: Option<String>,
    pub properties: Properties,
    pub portable_data_hash: String,
    pub manifest_text: String,
    pub replication_desired: Option<i64>,
    pub replication_confirmed: Option<i64>,
    pub storage_classes_desired: Vec<String>,
    pub trash_at: Option<Timestamp>,
    pub delete_at: Option<Timestamp>,
    pub is_trashed: bool,
    pub current_version_uuid: String,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    #[default]
    Queued,
    Locked,
    Running,
    Complete,
    Cancelled,
}

impl ContainerState {
    pub const ACTIVE: [ContainerState; 3] = [
        ContainerState::Queued,
        ContainerState::Locked,
        ContainerState::Running,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContainerState::Queued => "Queued",
            ContainerState::Locked => "Locked",
            ContainerState::Running => "Running",
            ContainerState::Complete => "Complete",
            ContainerState::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConstraints {
    pub vcpus: i64,
    pub ram: i64,
    pub keep_cache_ram: i64,
    #[serde(rename = "API")]
    pub api: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Container {
    pub uuid: String,
    pub owner_uuid: String,
    pub created_at: Option<Timestamp>,
    pub modified_at: Option<Timestamp>,
    pub state: ContainerState,
    pub priority: i64,
    pub command: Vec<String>,
    pub container_image: String,
    pub cwd: String,
    pub output_path: String,
    pub mounts: Properties,
    pub runtime_constraints: RuntimeConstraints,
    pub runtime_status: Properties,
    pub auth_uuid: String,
    pub locked_by_uuid: String,
    pub exit_code: Option<i64>,
    pub output: Option<String>,
    pub log: Option<String>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerRequestState {
    #[default]
    Uncommitted,
    Committed,
    Final,
}

impl ContainerRequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerRequestState::Uncommitted => "Uncommitted",
            ContainerRequestState::Committed => "Committed",
            ContainerRequestState::Final => "Final",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRequest {
    pub uuid: String,
    pub owner_uuid: String,
    pub created_at: Option<Timestamp>,
    pub modified_at: Option<Timestamp>,
    pub name: String,
    pub description: Option<String>,
    pub properties: Properties,
    pub state: ContainerRequestState,
    pub priority: i64,
    pub container_uuid: Option<String>,
    pub requesting_container_uuid: Option<String>,
    pub container_image: String,
    pub command: Vec<String>,
    pub cwd: String,
    pub output_path: String,
    pub mounts: Properties,
    pub runtime_constraints: RuntimeConstraints,
    pub runtime_token: String,
    pub use_existing: bool,
    pub container_count_max: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    pub uuid: String,
    pub owner_uuid: String,
    pub created_at: Option<Timestamp>,
    pub modified_at: Option<Timestamp>,
    pub name: String,
    pub group_class: String,
    pub description: Option<String>,
    pub properties: Properties,
    pub trash_at: Option<Timestamp>,
    pub delete_at: Option<Timestamp>,
    pub is_trashed: bool,
    pub writable_by: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub uuid: String,
    pub owner_uuid: String,
    pub created_at: Option<Timestamp>,
    pub modified_at: Option<Timestamp>,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub identity_url: String,
    pub is_active: bool,
    pub is_admin: bool,
    pub is_invited: bool,
    pub prefs: Properties,
    pub writable_by: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Link {
    pub uuid: String,
    pub owner_uuid: String,
    pub created_at: Option<Timestamp>,
    pub modified_at: Option<Timestamp>,
    pub link_class: String,
    pub name: String,
    pub head_uuid: String,
    pub tail_uuid: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Specimen {
    pub uuid: String,
    pub owner_uuid: String,
    pub created_at: Option<Timestamp>,
    pub modified_at: Option<Timestamp>,
    pub material: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiClientAuthorization {
    pub uuid: String,
    pub api_token: String,
    pub owner_uuid: String,
    pub created_at: Option<Timestamp>,
    pub expires_at: Option<Timestamp>,
    pub scopes: Vec<String>,
}

impl ApiClientAuthorization {
    pub fn token_v2(&self) -> String {
        format!("v2/{}/{}", self.uuid, self.api_token)
    }

    pub fn has_full_scope(&self) -> bool {
        self.scopes.len() == 1 && self.scopes[0] == "all"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepService {
    pub uuid: String,
    pub service_host: String,
    pub service_port: u16,
    pub service_ssl_flag: bool,
    pub service_type: String,
    pub read_only: bool,
}

impl KeepService {
    pub fn url_base(&self) -> String {
        let scheme = if self.service_ssl_flag { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.service_host, self.service_port)
    }
}

impl std::fmt::Display for KeepService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.uuid, self.url_base())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepMount {
    pub uuid: String,
    // Mounts sharing a device id share the underlying storage.
    pub device_id: String,
    pub read_only: bool,
    pub replication: i64,
}

impl Default for KeepMount {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            device_id: String::new(),
            read_only: false,
            replication: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub redirect_location: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub html: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogoutResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub redirect_location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryDocument {
    pub default_collection_replication: i64,
    pub blob_signature_ttl: i64,
    pub default_trash_lifetime: i64,
    pub uuid_prefix: String,
    pub revision: String,
}

impl Default for DiscoveryDocument {
    fn default() -> Self {
        Self {
            default_collection_replication: 2,
            blob_signature_ttl: 1_209_600,
            default_trash_lifetime: 1_209_600,
            uuid_prefix: String::new(),
            revision: String::new(),
        }
    }
}
