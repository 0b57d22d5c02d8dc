use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::model::*;
use crate::options::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub method: &'static str,
    pub path: &'static str,
    pub attrs_key: &'static str,
}

const fn ep(method: &'static str, path: &'static str, attrs_key: &'static str) -> Endpoint {
    Endpoint {
        method,
        path,
        attrs_key,
    }
}

pub mod endpoint {
    use super::{Endpoint, ep};

    pub const CONFIG_GET: Endpoint = ep("GET", "arvados/v1/config", "");
    pub const VOCABULARY_GET: Endpoint = ep("GET", "arvados/v1/vocabulary", "");
    pub const DISCOVERY_DOCUMENT: Endpoint = ep("GET", "discovery/v1/apis/arvados/v1/rest", "");
    pub const LOGIN: Endpoint = ep("GET", "login", "");
    pub const LOGOUT: Endpoint = ep("GET", "logout", "");

    pub const COLLECTION_CREATE: Endpoint = ep("POST", "arvados/v1/collections", "collection");
    pub const COLLECTION_UPDATE: Endpoint = ep("PATCH", "arvados/v1/collections/{uuid}", "collection");
    pub const COLLECTION_GET: Endpoint = ep("GET", "arvados/v1/collections/{uuid}", "");
    pub const COLLECTION_LIST: Endpoint = ep("GET", "arvados/v1/collections", "");
    pub const COLLECTION_PROVENANCE: Endpoint = ep("GET", "arvados/v1/collections/{uuid}/provenance", "");
    pub const COLLECTION_USED_BY: Endpoint = ep("GET", "arvados/v1/collections/{uuid}/used_by", "");
    pub const COLLECTION_DELETE: Endpoint = ep("DELETE", "arvados/v1/collections/{uuid}", "");
    pub const COLLECTION_TRASH: Endpoint = ep("POST", "arvados/v1/collections/{uuid}/trash", "");
    pub const COLLECTION_UNTRASH: Endpoint = ep("POST", "arvados/v1/collections/{uuid}/untrash", "");

    pub const CONTAINER_CREATE: Endpoint = ep("POST", "arvados/v1/containers", "container");
    pub const CONTAINER_UPDATE: Endpoint = ep("PATCH", "arvados/v1/containers/{uuid}", "container");
    pub const CONTAINER_PRIORITY_UPDATE: Endpoint = ep("POST", "arvados/v1/containers/{uuid}/update_priority", "container");
    pub const CONTAINER_GET: Endpoint = ep("GET", "arvados/v1/containers/{uuid}", "");
    pub const CONTAINER_LIST: Endpoint = ep("GET", "arvados/v1/containers", "");
    pub const CONTAINER_DELETE: Endpoint = ep("DELETE", "arvados/v1/containers/{uuid}", "");
    pub const CONTAINER_LOCK: Endpoint = ep("POST", "arvados/v1/containers/{uuid}/lock", "");
    pub const CONTAINER_UNLOCK: Endpoint = ep("POST", "arvados/v1/containers/{uuid}/unlock", "");

    pub const CONTAINER_REQUEST_CREATE: Endpoint = ep("POST", "arvados/v1/container_requests", "container_request");
    pub const CONTAINER_REQUEST_UPDATE: Endpoint = ep("PATCH", "arvados/v1/container_requests/{uuid}", "container_request");
    pub const CONTAINER_REQUEST_GET: Endpoint = ep("GET", "arvados/v1/container_requests/{uuid}", "");
    pub const CONTAINER_REQUEST_LIST: Endpoint = ep("GET", "arvados/v1/container_requests", "");
    pub const CONTAINER_REQUEST_DELETE: Endpoint = ep("DELETE", "arvados/v1/container_requests/{uuid}", "");

    pub const GROUP_CREATE: Endpoint = ep("POST", "arvados/v1/groups", "group");
    pub const GROUP_UPDATE: Endpoint = ep("PATCH", "arvados/v1/groups/{uuid}", "group");
    pub const GROUP_GET: Endpoint = ep("GET", "arvados/v1/groups/{uuid}", "");
    pub const GROUP_LIST: Endpoint = ep("GET", "arvados/v1/groups", "");
    pub const GROUP_CONTENTS: Endpoint = ep("GET", "arvados/v1/groups/contents", "");
    pub const GROUP_CONTENTS_UUID_IN_PATH: Endpoint = ep("GET", "arvados/v1/groups/{uuid}/contents", "");
    pub const GROUP_SHARED: Endpoint = ep("GET", "arvados/v1/groups/shared", "");
    pub const GROUP_DELETE: Endpoint = ep("DELETE", "arvados/v1/groups/{uuid}", "");
    pub const GROUP_TRASH: Endpoint = ep("POST", "arvados/v1/groups/{uuid}/trash", "");
    pub const GROUP_UNTRASH: Endpoint = ep("POST", "arvados/v1/groups/{uuid}/untrash", "");

    pub const LINK_CREATE: Endpoint = ep("POST", "arvados/v1/links", "link");
    pub const LINK_UPDATE: Endpoint = ep("PATCH", "arvados/v1/links/{uuid}", "link");
    pub const LINK_GET: Endpoint = ep("GET", "arvados/v1/links/{uuid}", "");
    pub const LINK_LIST: Endpoint = ep("GET", "arvados/v1/links", "");
    pub const LINK_DELETE: Endpoint = ep("DELETE", "arvados/v1/links/{uuid}", "");

    pub const SPECIMEN_CREATE: Endpoint = ep("POST", "arvados/v1/specimens", "specimen");
    pub const SPECIMEN_UPDATE: Endpoint = ep("PATCH", "arvados/v1/specimens/{uuid}", "specimen");
    pub const SPECIMEN_GET: Endpoint = ep("GET", "arvados/v1/specimens/{uuid}", "");
    pub const SPECIMEN_LIST: Endpoint = ep("GET", "arvados/v1/specimens", "");
    pub const SPECIMEN_DELETE: Endpoint = ep("DELETE", "arvados/v1/specimens/{uuid}", "");

    pub const SYS_TRASH_SWEEP: Endpoint = ep("POST", "sys/trash_sweep", "");

    pub const USER_CREATE: Endpoint = ep("POST", "arvados/v1/users", "user");
    pub const USER_UPDATE: Endpoint = ep("PATCH", "arvados/v1/users/{uuid}", "user");
    pub const USER_MERGE: Endpoint = ep("POST", "arvados/v1/users/merge", "");
    pub const USER_ACTIVATE: Endpoint = ep("POST", "arvados/v1/users/{uuid}/activate", "");
    pub const USER_SETUP: Endpoint = ep("POST", "arvados/v1/users/setup", "user");
    pub const USER_UNSETUP: Endpoint = ep("POST", "arvados/v1/users/{uuid}/unsetup", "");
    pub const USER_GET: Endpoint = ep("GET", "arvados/v1/users/{uuid}", "");
    pub const USER_GET_CURRENT: Endpoint = ep("GET", "arvados/v1/users/current", "");
    pub const USER_GET_SYSTEM: Endpoint = ep("GET", "arvados/v1/users/system", "");
    pub const USER_LIST: Endpoint = ep("GET", "arvados/v1/users", "");
    pub const USER_DELETE: Endpoint = ep("DELETE", "arvados/v1/users/{uuid}", "");
    pub const USER_BATCH_UPDATE: Endpoint = ep("PATCH", "arvados/v1/users/batch_update", "");
    pub const USER_AUTHENTICATE: Endpoint = ep("POST", "arvados/v1/users/authenticate", "");

    pub const API_CLIENT_AUTHORIZATION_CURRENT: Endpoint = ep("GET", "arvados/v1/api_client_authorizations/current", "");
    pub const API_CLIENT_AUTHORIZATION_CREATE: Endpoint = ep("POST", "arvados/v1/api_client_authorizations", "api_client_authorization");
    pub const API_CLIENT_AUTHORIZATION_LIST: Endpoint = ep("GET", "arvados/v1/api_client_authorizations", "");

    pub const KEEP_SERVICE_LIST: Endpoint = ep("GET", "arvados/v1/keep_services/accessible", "");
}

macro_rules! unimplemented_call {
    ($name:literal) => {
        Err(ApiError::not_implemented($name))
    };
}

/// The typed API surface shared by the router, the federation layer, the
/// local backend and peer connections. Every method defaults to 501 so
/// partial implementations (stubs, proxies for a subset) stay small.
#[async_trait]
pub trait Api: Send + Sync {
    async fn config_get(&self, _ctx: &RequestContext, _opts: EmptyOptions) -> Result<Value, ApiError> {
        unimplemented_call!("ConfigGet")
    }
    async fn vocabulary_get(&self, _ctx: &RequestContext, _opts: EmptyOptions) -> Result<Value, ApiError> {
        unimplemented_call!("VocabularyGet")
    }
    async fn discovery_document(&self, _ctx: &RequestContext, _opts: EmptyOptions) -> Result<DiscoveryDocument, ApiError> {
        unimplemented_call!("DiscoveryDocument")
    }
    async fn login(&self, _ctx: &RequestContext, _opts: LoginOptions) -> Result<LoginResponse, ApiError> {
        unimplemented_call!("Login")
    }
    async fn logout(&self, _ctx: &RequestContext, _opts: LogoutOptions) -> Result<LogoutResponse, ApiError> {
        unimplemented_call!("Logout")
    }

    async fn collection_create(&self, _ctx: &RequestContext, _opts: CreateOptions) -> Result<Collection, ApiError> {
        unimplemented_call!("CollectionCreate")
    }
    async fn collection_update(&self, _ctx: &RequestContext, _opts: UpdateOptions) -> Result<Collection, ApiError> {
        unimplemented_call!("CollectionUpdate")
    }
    async fn collection_get(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<Collection, ApiError> {
        unimplemented_call!("CollectionGet")
    }
    async fn collection_list(&self, _ctx: &RequestContext, _opts: ListOptions) -> Result<List<Collection>, ApiError> {
        unimplemented_call!("CollectionList")
    }
    async fn collection_provenance(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<Map<String, Value>, ApiError> {
        unimplemented_call!("CollectionProvenance")
    }
    async fn collection_used_by(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<Map<String, Value>, ApiError> {
        unimplemented_call!("CollectionUsedBy")
    }
    async fn collection_delete(&self, _ctx: &RequestContext, _opts: DeleteOptions) -> Result<Collection, ApiError> {
        unimplemented_call!("CollectionDelete")
    }
    async fn collection_trash(&self, _ctx: &RequestContext, _opts: DeleteOptions) -> Result<Collection, ApiError> {
        unimplemented_call!("CollectionTrash")
    }
    async fn collection_untrash(&self, _ctx: &RequestContext, _opts: UntrashOptions) -> Result<Collection, ApiError> {
        unimplemented_call!("CollectionUntrash")
    }

    async fn container_create(&self, _ctx: &RequestContext, _opts: CreateOptions) -> Result<Container, ApiError> {
        unimplemented_call!("ContainerCreate")
    }
    async fn container_update(&self, _ctx: &RequestContext, _opts: UpdateOptions) -> Result<Container, ApiError> {
        unimplemented_call!("ContainerUpdate")
    }
    async fn container_priority_update(&self, _ctx: &RequestContext, _opts: UpdatePriorityOptions) -> Result<Container, ApiError> {
        unimplemented_call!("ContainerPriorityUpdate")
    }
    async fn container_get(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<Container, ApiError> {
        unimplemented_call!("ContainerGet")
    }
    async fn container_list(&self, _ctx: &RequestContext, _opts: ListOptions) -> Result<List<Container>, ApiError> {
        unimplemented_call!("ContainerList")
    }
    async fn container_delete(&self, _ctx: &RequestContext, _opts: DeleteOptions) -> Result<Container, ApiError> {
        unimplemented_call!("ContainerDelete")
    }
    async fn container_lock(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<Container, ApiError> {
        unimplemented_call!("ContainerLock")
    }
    async fn container_unlock(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<Container, ApiError> {
        unimplemented_call!("ContainerUnlock")
    }

    async fn container_request_create(&self, _ctx: &RequestContext, _opts: CreateOptions) -> Result<ContainerRequest, ApiError> {
        unimplemented_call!("ContainerRequestCreate")
    }
    async fn container_request_update(&self, _ctx: &RequestContext, _opts: UpdateOptions) -> Result<ContainerRequest, ApiError> {
        unimplemented_call!("ContainerRequestUpdate")
    }
    async fn container_request_get(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<ContainerRequest, ApiError> {
        unimplemented_call!("ContainerRequestGet")
    }
    async fn container_request_list(&self, _ctx: &RequestContext, _opts: ListOptions) -> Result<List<ContainerRequest>, ApiError> {
        unimplemented_call!("ContainerRequestList")
    }
    async fn container_request_delete(&self, _ctx: &RequestContext, _opts: DeleteOptions) -> Result<ContainerRequest, ApiError> {
        unimplemented_call!("ContainerRequestDelete")
    }

    async fn group_create(&self, _ctx: &RequestContext, _opts: CreateOptions) -> Result<Group, ApiError> {
        unimplemented_call!("GroupCreate")
    }
    async fn group_update(&self, _ctx: &RequestContext, _opts: UpdateOptions) -> Result<Group, ApiError> {
        unimplemented_call!("GroupUpdate")
    }
    async fn group_get(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<Group, ApiError> {
        unimplemented_call!("GroupGet")
    }
    async fn group_list(&self, _ctx: &RequestContext, _opts: ListOptions) -> Result<List<Group>, ApiError> {
        unimplemented_call!("GroupList")
    }
    async fn group_contents(&self, _ctx: &RequestContext, _opts: GroupContentsOptions) -> Result<ObjectList, ApiError> {
        unimplemented_call!("GroupContents")
    }
    async fn group_shared(&self, _ctx: &RequestContext, _opts: ListOptions) -> Result<ObjectList, ApiError> {
        unimplemented_call!("GroupShared")
    }
    async fn group_delete(&self, _ctx: &RequestContext, _opts: DeleteOptions) -> Result<Group, ApiError> {
        unimplemented_call!("GroupDelete")
    }
    async fn group_trash(&self, _ctx: &RequestContext, _opts: DeleteOptions) -> Result<Group, ApiError> {
        unimplemented_call!("GroupTrash")
    }
    async fn group_untrash(&self, _ctx: &RequestContext, _opts: UntrashOptions) -> Result<Group, ApiError> {
        unimplemented_call!("GroupUntrash")
    }

    async fn link_create(&self, _ctx: &RequestContext, _opts: CreateOptions) -> Result<Link, ApiError> {
        unimplemented_call!("LinkCreate")
    }
    async fn link_update(&self, _ctx: &RequestContext, _opts: UpdateOptions) -> Result<Link, ApiError> {
        unimplemented_call!("LinkUpdate")
    }
    async fn link_get(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<Link, ApiError> {
        unimplemented_call!("LinkGet")
    }
    async fn link_list(&self, _ctx: &RequestContext, _opts: ListOptions) -> Result<List<Link>, ApiError> {
        unimplemented_call!("LinkList")
    }
    async fn link_delete(&self, _ctx: &RequestContext, _opts: DeleteOptions) -> Result<Link, ApiError> {
        unimplemented_call!("LinkDelete")
    }

    async fn specimen_create(&self, _ctx: &RequestContext, _opts: CreateOptions) -> Result<Specimen, ApiError> {
        unimplemented_call!("SpecimenCreate")
    }
    async fn specimen_update(&self, _ctx: &RequestContext, _opts: UpdateOptions) -> Result<Specimen, ApiError> {
        unimplemented_call!("SpecimenUpdate")
    }
    async fn specimen_get(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<Specimen, ApiError> {
        unimplemented_call!("SpecimenGet")
    }
    async fn specimen_list(&self, _ctx: &RequestContext, _opts: ListOptions) -> Result<List<Specimen>, ApiError> {
        unimplemented_call!("SpecimenList")
    }
    async fn specimen_delete(&self, _ctx: &RequestContext, _opts: DeleteOptions) -> Result<Specimen, ApiError> {
        unimplemented_call!("SpecimenDelete")
    }

    async fn sys_trash_sweep(&self, _ctx: &RequestContext, _opts: EmptyOptions) -> Result<Value, ApiError> {
        unimplemented_call!("SysTrashSweep")
    }

    async fn user_create(&self, _ctx: &RequestContext, _opts: CreateOptions) -> Result<User, ApiError> {
        unimplemented_call!("UserCreate")
    }
    async fn user_update(&self, _ctx: &RequestContext, _opts: UpdateOptions) -> Result<User, ApiError> {
        unimplemented_call!("UserUpdate")
    }
    async fn user_merge(&self, _ctx: &RequestContext, _opts: UserMergeOptions) -> Result<User, ApiError> {
        unimplemented_call!("UserMerge")
    }
    async fn user_activate(&self, _ctx: &RequestContext, _opts: UserActivateOptions) -> Result<User, ApiError> {
        unimplemented_call!("UserActivate")
    }
    async fn user_setup(&self, _ctx: &RequestContext, _opts: UserSetupOptions) -> Result<Map<String, Value>, ApiError> {
        unimplemented_call!("UserSetup")
    }
    async fn user_unsetup(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<User, ApiError> {
        unimplemented_call!("UserUnsetup")
    }
    async fn user_get(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<User, ApiError> {
        unimplemented_call!("UserGet")
    }
    async fn user_get_current(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<User, ApiError> {
        unimplemented_call!("UserGetCurrent")
    }
    async fn user_get_system(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<User, ApiError> {
        unimplemented_call!("UserGetSystem")
    }
    async fn user_list(&self, _ctx: &RequestContext, _opts: ListOptions) -> Result<List<User>, ApiError> {
        unimplemented_call!("UserList")
    }
    async fn user_delete(&self, _ctx: &RequestContext, _opts: DeleteOptions) -> Result<User, ApiError> {
        unimplemented_call!("UserDelete")
    }
    async fn user_batch_update(&self, _ctx: &RequestContext, _opts: UserBatchUpdateOptions) -> Result<List<User>, ApiError> {
        unimplemented_call!("UserBatchUpdate")
    }
    async fn user_authenticate(&self, _ctx: &RequestContext, _opts: UserAuthenticateOptions) -> Result<ApiClientAuthorization, ApiError> {
        unimplemented_call!("UserAuthenticate")
    }

    async fn api_client_authorization_current(&self, _ctx: &RequestContext, _opts: GetOptions) -> Result<ApiClientAuthorization, ApiError> {
        unimplemented_call!("APIClientAuthorizationCurrent")
    }
    async fn api_client_authorization_create(&self, _ctx: &RequestContext, _opts: CreateOptions) -> Result<ApiClientAuthorization, ApiError> {
        unimplemented_call!("APIClientAuthorizationCreate")
    }
    async fn api_client_authorization_list(&self, _ctx: &RequestContext, _opts: ListOptions) -> Result<List<ApiClientAuthorization>, ApiError> {
        unimplemented_call!("APIClientAuthorizationList")
    }

    async fn keep_service_list(&self, _ctx: &RequestContext, _opts: ListOptions) -> Result<List<KeepService>, ApiError> {
        unimplemented_call!("KeepServiceList")
    }
}
