use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::ids::{API_CLIENT_AUTHORIZATION, new_uuid};
use common::model::{ApiClientAuthorization, User};
use common::token::{hmac_sha256_hex, log_label, parse_v2};
use common::{ApiError, RequestContext};
use parking_lot::Mutex;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rusqlite::{Row, params};
use tracing::debug;

use crate::db::{Database, current_tx};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

const SELECT_AUTH: &str = "SELECT aca.uuid, aca.api_token, aca.owner_uuid, aca.created_at, aca.expires_at, aca.scopes, \
     u.uuid, u.email, u.username, u.first_name, u.last_name, u.is_active, u.is_admin \
     FROM api_client_authorizations aca JOIN users u ON u.uuid = aca.owner_uuid";

#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub user: User,
    pub authz: ApiClientAuthorization,
}

struct Entry {
    auth: Authorization,
    expires: Instant,
}

pub struct AuthCache {
    db: Database,
    root_token: String,
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl AuthCache {
    pub fn new(db: Database, root_token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            db,
            root_token: root_token.into(),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, token: &str) -> Result<Authorization, ApiError> {
        self.lookup_at(token, Utc::now()).await
    }

    pub async fn lookup_at(&self, token: &str, now: DateTime<Utc>) -> Result<Authorization, ApiError> {
        if let Some(auth) = self.cached(token, now) {
            return Ok(auth);
        }

        let rows = self.query(token).await?;
        let Some(auth) = rows
            .into_iter()
            .find(|auth| auth.authz.expires_at.is_none_or(|exp| exp > now))
        else {
            debug!(token = %log_label(token), "token not found or expired");
            return Err(ApiError::unauthorized("unauthenticated: token is not valid"));
        };

        self.insert(token, auth.clone());
        Ok(auth)
    }

    fn cached(&self, token: &str, now: DateTime<Utc>) -> Option<Authorization> {
        let entries = self.entries.lock();
        let entry = entries.get(token)?;
        if entry.expires <= Instant::now() {
            return None;
        }
        if entry.auth.authz.expires_at.is_some_and(|exp| exp <= now) {
            return None;
        }
        Some(entry.auth.clone())
    }

    fn insert(&self, token: &str, auth: Authorization) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.expires > now);
        entries.insert(
            token.to_string(),
            Entry {
                auth,
                expires: now + self.ttl,
            },
        );
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    async fn query(&self, token: &str) -> Result<Vec<Authorization>, ApiError> {
        let rows = if let Some(v2) = parse_v2(token) {
            let (uuid, secret) = (v2.uuid.to_string(), v2.secret.to_string());
            self.db
                .run(move |conn| {
                    let sql = format!("{SELECT_AUTH} WHERE aca.uuid = ?1 AND aca.api_token = ?2");
                    conn.prepare(&sql)?
                        .query_map(params![uuid, secret], auth_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                })
                .await?
        } else {
            let hashed = hmac_sha256_hex(self.root_token.as_bytes(), token.as_bytes());
            let token = token.to_string();
            self.db
                .run(move |conn| {
                    let sql = format!("{SELECT_AUTH} WHERE aca.api_token IN (?1, ?2)");
                    conn.prepare(&sql)?
                        .query_map(params![token, hashed], auth_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                })
                .await?
        };
        Ok(rows.into_iter().flatten().collect())
    }
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

// Rows with an unparseable expiry are treated as invalid rather than
// as never expiring.
fn auth_from_row(row: &Row<'_>) -> rusqlite::Result<Option<Authorization>> {
    let expires_raw: Option<String> = row.get(4)?;
    let expires_at = parse_time(expires_raw.clone());
    if expires_raw.is_some() && expires_at.is_none() {
        return Ok(None);
    }
    let scopes: String = row.get(5)?;
    let authz = ApiClientAuthorization {
        uuid: row.get(0)?,
        api_token: row.get(1)?,
        owner_uuid: row.get(2)?,
        created_at: parse_time(row.get(3)?),
        expires_at,
        scopes: serde_json::from_str(&scopes).unwrap_or_default(),
    };
    let user = User {
        uuid: row.get(6)?,
        email: row.get(7)?,
        username: row.get(8)?,
        first_name: row.get(9)?,
        last_name: row.get(10)?,
        is_active: row.get(11)?,
        is_admin: row.get(12)?,
        ..Default::default()
    };
    Ok(Some(Authorization { user, authz }))
}

pub struct AuthLookup(pub Arc<AuthCache>);

pub async fn current_auth(ctx: &RequestContext) -> Result<Authorization, ApiError> {
    let lookup = ctx
        .value::<AuthLookup>()
        .ok_or_else(|| ApiError::internal("no auth cache in this context"))?;
    let token = ctx
        .first_token()
        .ok_or_else(|| ApiError::unauthorized("unauthenticated: no token provided"))?;
    lookup.0.lookup(token).await
}

pub async fn mint_token(
    ctx: &RequestContext,
    cluster_id: &str,
    owner_uuid: &str,
    expires_at: DateTime<Utc>,
) -> Result<ApiClientAuthorization, ApiError> {
    let authz = ApiClientAuthorization {
        uuid: new_uuid(cluster_id, API_CLIENT_AUTHORIZATION),
        api_token: random_secret(),
        owner_uuid: owner_uuid.to_string(),
        created_at: Some(Utc::now()),
        expires_at: Some(expires_at),
        scopes: vec!["all".to_string()],
    };
    let row = authz.clone();
    let tx = current_tx(ctx).await?;
    tx.run(move |conn| {
        conn.execute(
            "INSERT INTO api_client_authorizations (uuid, api_token, owner_uuid, created_at, expires_at, scopes) \
             VALUES (?1, ?2, ?3, ?4, ?5, '[\"all\"]')",
            params![
                row.uuid,
                row.api_token,
                row.owner_uuid,
                row.created_at.map(|t| t.to_rfc3339()),
                row.expires_at.map(|t| t.to_rfc3339()),
            ],
        )
    })
    .await?;
    debug!(uuid = %authz.uuid, owner = %authz.owner_uuid, "minted token");
    Ok(authz)
}

fn random_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(49)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::TimeZone;

    const USER: &str = "zzzzz-tpzed-xurymjxw79nv3jz";
    const AUTHZ: &str = "zzzzz-gj3su-077z32aux8dg2s1";
    const SECRET: &str = "3kg6k6lzmp9kj5cpkcoxie963cmvjahbt2fod9zru30k1jqdmi";
    const ROOT: &str = "systemroottoken";

    async fn setup(expires_at: Option<&str>) -> Result<(tempfile::TempDir, Database)> {
        let dir = tempfile::tempdir()?;
        let db = Database::open(dir.path().join("db.sqlite3")).await?;
        let expires = expires_at.map(str::to_string);
        let hashed = hmac_sha256_hex(ROOT.as_bytes(), b"oidc-access-token");
        db.run(move |conn| {
            conn.execute(
                "INSERT INTO users (uuid, email, is_active, is_admin) VALUES (?1, 'active@example.com', 1, 0)",
                [USER],
            )?;
            conn.execute(
                "INSERT INTO api_client_authorizations (uuid, api_token, owner_uuid, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![AUTHZ, SECRET, USER, expires],
            )?;
            conn.execute(
                "INSERT INTO api_client_authorizations (uuid, api_token, owner_uuid) VALUES ('zzzzz-gj3su-000000000000oid', ?1, ?2)",
                params![hashed, USER],
            )?;
            Ok(())
        })
        .await?;
        Ok((dir, db))
    }

    fn v2() -> String {
        format!("v2/{AUTHZ}/{SECRET}")
    }

    #[tokio::test]
    async fn v2_token_resolves_user() -> Result<()> {
        let (_dir, db) = setup(None).await?;
        let cache = AuthCache::new(db, ROOT, DEFAULT_TTL);
        let auth = cache.lookup(&v2()).await?;
        assert_eq!(auth.user.uuid, USER);
        assert!(auth.user.is_active);
        assert_eq!(auth.authz.token_v2(), v2());
        assert_eq!(auth.authz.scopes, vec!["all"]);
        Ok(())
    }

    #[tokio::test]
    async fn bare_secret_and_hashed_access_token_are_accepted() -> Result<()> {
        let (_dir, db) = setup(None).await?;
        let cache = AuthCache::new(db, ROOT, DEFAULT_TTL);
        assert_eq!(cache.lookup(SECRET).await?.authz.uuid, AUTHZ);
        assert_eq!(
            cache.lookup("oidc-access-token").await?.authz.uuid,
            "zzzzz-gj3su-000000000000oid"
        );
        Ok(())
    }

    #[tokio::test]
    async fn token_expiring_exactly_now_is_rejected() -> Result<()> {
        let (_dir, db) = setup(Some("2030-01-01T00:00:00Z")).await?;
        let cache = AuthCache::new(db, ROOT, DEFAULT_TTL);
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let err = cache.lookup_at(&v2(), at).await.unwrap_err();
        assert_eq!(err.http_status(), 401);
        assert!(cache.lookup_at(&v2(), at - chrono::Duration::seconds(1)).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_not_cached_but_successes_are() -> Result<()> {
        let (_dir, db) = setup(None).await?;
        let cache = AuthCache::new(db.clone(), ROOT, DEFAULT_TTL);
        let token = "v2/zzzzz-gj3su-000000000000new/newsecret";
        assert_eq!(cache.lookup(token).await.unwrap_err().http_status(), 401);
        assert_eq!(cache.len(), 0);

        db.run(|conn| {
            conn.execute(
                "INSERT INTO api_client_authorizations (uuid, api_token, owner_uuid) VALUES ('zzzzz-gj3su-000000000000new', 'newsecret', ?1)",
                [USER],
            )
        })
        .await?;
        cache.lookup(token).await?;

        db.run(|conn| conn.execute("DELETE FROM api_client_authorizations", []))
            .await?;
        assert!(cache.lookup(token).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn expired_entries_are_swept_on_insert() -> Result<()> {
        let (_dir, db) = setup(None).await?;
        let cache = AuthCache::new(db, ROOT, Duration::ZERO);
        cache.lookup(&v2()).await?;
        cache.lookup(SECRET).await?;
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn minted_token_is_committed_and_usable() -> Result<()> {
        let (_dir, db) = setup(None).await?;
        let expires = Utc::now() + chrono::Duration::hours(1);
        let authz = crate::db::wrap_in_transaction(&db, RequestContext::new(), |ctx| async move {
            mint_token(&ctx, "zzzzz", USER, expires).await
        })
        .await?;
        assert!(authz.uuid.starts_with("zzzzz-gj3su-"));
        assert_eq!(authz.api_token.len(), 49);
        assert!(authz.has_full_scope());

        let cache = AuthCache::new(db, ROOT, DEFAULT_TTL);
        let auth = cache.lookup(&authz.token_v2()).await?;
        assert_eq!(auth.user.uuid, USER);
        assert_eq!(auth.authz.expires_at.map(|t| t.timestamp()), Some(expires.timestamp()));
        Ok(())
    }
}
