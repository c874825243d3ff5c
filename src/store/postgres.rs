use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{CredentialStore, PersonalAccessToken, StoreError, UserSshKey};
use crate::hashing::HashAlgorithm;

const TOKEN_COLUMNS: &str = "id, owner_id, label, scopes, algorithm, hash, hash_prefix, active, \
                             created_at, updated_at, expires_at, last_used_at";

const SSH_KEY_COLUMNS: &str =
    "id, owner_id, key_name, public_key, fingerprint, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let Some(db) = e.as_database_error() {
            if db.is_unique_violation() {
                return match db.constraint() {
                    Some(c) if c.contains("fingerprint") => {
                        StoreError::Duplicate("user_ssh_keys.fingerprint")
                    }
                    _ => StoreError::Duplicate("unique index"),
                };
            }
        }
        StoreError::Backend(e.into())
    }
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    id: Uuid,
    owner_id: String,
    label: String,
    scopes: Vec<String>,
    algorithm: String,
    hash: String,
    hash_prefix: String,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
}

impl TryFrom<TokenRow> for PersonalAccessToken {
    type Error = StoreError;

    fn try_from(row: TokenRow) -> Result<Self, Self::Error> {
        let algorithm: HashAlgorithm = row
            .algorithm
            .parse()
            .map_err(|e: String| StoreError::Backend(anyhow::anyhow!("token {}: {e}", row.id)))?;
        Ok(PersonalAccessToken {
            id: row.id,
            owner_id: row.owner_id,
            label: row.label,
            scopes: row.scopes,
            algorithm,
            hash: row.hash,
            hash_prefix: row.hash_prefix,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
        })
    }
}

fn into_tokens(rows: Vec<TokenRow>) -> Result<Vec<PersonalAccessToken>, StoreError> {
    rows.into_iter().map(PersonalAccessToken::try_from).collect()
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // -- Token Operations --

    async fn insert_token(&self, token: &PersonalAccessToken) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO personal_access_tokens
                 (id, owner_id, label, scopes, algorithm, hash, hash_prefix, active, created_at, updated_at, expires_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(token.id)
        .bind(&token.owner_id)
        .bind(&token.label)
        .bind(&token.scopes)
        .bind(token.algorithm.as_str())
        .bind(&token.hash)
        .bind(&token.hash_prefix)
        .bind(token.active)
        .bind(token.created_at)
        .bind(token.updated_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_active_tokens_by_prefix(
        &self,
        prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PersonalAccessToken>, StoreError> {
        let rows = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM personal_access_tokens \
             WHERE hash_prefix = $1 AND active = true AND (expires_at IS NULL OR expires_at > $2)"
        ))
        .bind(prefix)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        into_tokens(rows)
    }

    async fn list_tokens(&self, owner_id: &str) -> Result<Vec<PersonalAccessToken>, StoreError> {
        let rows = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM personal_access_tokens \
             WHERE owner_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        into_tokens(rows)
    }

    async fn revoke_token(
        &self,
        owner_id: &str,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PersonalAccessToken>, StoreError> {
        // CASE keeps updated_at untouched on a repeat revoke.
        let row = sqlx::query_as::<_, TokenRow>(&format!(
            "UPDATE personal_access_tokens \
             SET updated_at = CASE WHEN active THEN $3 ELSE updated_at END, active = false \
             WHERE id = $1 AND owner_id = $2 RETURNING {TOKEN_COLUMNS}"
        ))
        .bind(token_id)
        .bind(owner_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PersonalAccessToken::try_from).transpose()
    }

    async fn revoke_active_tokens_by_label(
        &self,
        owner_id: &str,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PersonalAccessToken>, StoreError> {
        let rows = sqlx::query_as::<_, TokenRow>(&format!(
            "UPDATE personal_access_tokens SET active = false, updated_at = $3 \
             WHERE owner_id = $1 AND label = $2 AND active = true RETURNING {TOKEN_COLUMNS}"
        ))
        .bind(owner_id)
        .bind(label)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        into_tokens(rows)
    }

    async fn touch_token_last_used(
        &self,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE personal_access_tokens SET last_used_at = $2 WHERE id = $1")
            .bind(token_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- SSH Key Operations --

    async fn find_ssh_key_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<UserSshKey>, StoreError> {
        let row = sqlx::query_as::<_, UserSshKey>(&format!(
            "SELECT {SSH_KEY_COLUMNS} FROM user_ssh_keys WHERE fingerprint = $1"
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_ssh_key(&self, key: &UserSshKey) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO user_ssh_keys (id, owner_id, key_name, public_key, fingerprint, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(key.id)
        .bind(&key.owner_id)
        .bind(&key.key_name)
        .bind(&key.public_key)
        .bind(&key.fingerprint)
        .bind(key.created_at)
        .bind(key.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_ssh_keys(&self, owner_id: &str) -> Result<Vec<UserSshKey>, StoreError> {
        let rows = sqlx::query_as::<_, UserSshKey>(&format!(
            "SELECT {SSH_KEY_COLUMNS} FROM user_ssh_keys WHERE owner_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_ssh_key(&self, key_id: Uuid) -> Result<Option<UserSshKey>, StoreError> {
        let row = sqlx::query_as::<_, UserSshKey>(&format!(
            "SELECT {SSH_KEY_COLUMNS} FROM user_ssh_keys WHERE id = $1"
        ))
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_ssh_key(&self, owner_id: &str, key_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM user_ssh_keys WHERE id = $1 AND owner_id = $2")
            .bind(key_id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
