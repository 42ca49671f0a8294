//! Account registration, login, and refresh-token rotation.
//!
//! Passwords are argon2id-hashed. Refresh tokens rotate on every use and
//! belong to a family; presenting a revoked or unknown-but-expired token
//! revokes the whole family, cutting off a stolen token chain.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng as ArgonOsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::tokens::HmacTokenService;
use crate::chat::UserId;
use crate::errors::{Result, TetherError};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RefreshRecord {
    pub token_hash: String,
    pub user: UserId,
    pub family: Uuid,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert a new user; duplicate email or username is a `Conflict`.
    async fn insert_user(&self, user: &UserRecord) -> Result<()>;
    async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>>;
    async fn user_by_id(&self, id: UserId) -> Result<Option<UserRecord>>;

    async fn insert_refresh(&self, record: &RefreshRecord) -> Result<()>;
    async fn refresh_by_hash(&self, token_hash: &str) -> Result<Option<RefreshRecord>>;
    async fn revoke_refresh(&self, token_hash: &str) -> Result<()>;
    async fn revoke_family(&self, family: Uuid) -> Result<()>;
}

pub struct SqliteAccountStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> TetherError {
    TetherError::Internal(anyhow::anyhow!("account store: {}", e))
}

impl SqliteAccountStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("open account store: {}", e)))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("open account store: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        let _: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(db_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS refresh_tokens (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                family TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_refresh_family ON refresh_tokens(family);",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        email: row.get(1)?,
        username: row.get(2)?,
        password_hash: row.get(3)?,
        created_at: DateTime::from_timestamp_micros(row.get(4)?).unwrap_or_default(),
    })
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn insert_user(&self, user: &UserRecord) -> Result<()> {
        let conn = self.lock();
        let outcome = conn.execute(
            "INSERT INTO users (id, email, username, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id.to_string(),
                user.email,
                user.username,
                user.password_hash,
                user.created_at.timestamp_micros(),
            ],
        );
        match outcome {
            Ok(_) => Ok(()),
            Err(e) => {
                let text = e.to_string();
                if text.contains("users.email") {
                    Err(TetherError::conflict(
                        "EMAIL_ALREADY_EXISTS",
                        "an account with this email already exists",
                    ))
                } else if text.contains("users.username") {
                    Err(TetherError::conflict(
                        "USERNAME_ALREADY_EXISTS",
                        "this username is taken",
                    ))
                } else {
                    Err(db_err(e))
                }
            }
        }
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, email, username, password_hash, created_at FROM users WHERE email = ?1",
            params![email],
            row_to_user,
        )
        .optional()
        .map_err(db_err)
    }

    async fn user_by_id(&self, id: UserId) -> Result<Option<UserRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, email, username, password_hash, created_at FROM users WHERE id = ?1",
            params![id.to_string()],
            row_to_user,
        )
        .optional()
        .map_err(db_err)
    }

    async fn insert_refresh(&self, record: &RefreshRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO refresh_tokens (token_hash, user_id, family, expires_at, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.token_hash,
                record.user.to_string(),
                record.family.to_string(),
                record.expires_at.timestamp_micros(),
                record.revoked,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn refresh_by_hash(&self, token_hash: &str) -> Result<Option<RefreshRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT token_hash, user_id, family, expires_at, revoked
             FROM refresh_tokens WHERE token_hash = ?1",
            params![token_hash],
            |row| {
                Ok(RefreshRecord {
                    token_hash: row.get(0)?,
                    user: Uuid::parse_str(&row.get::<_, String>(1)?).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    family: Uuid::parse_str(&row.get::<_, String>(2)?).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    expires_at: DateTime::from_timestamp_micros(row.get(3)?).unwrap_or_default(),
                    revoked: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    async fn revoke_refresh(&self, token_hash: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE refresh_tokens SET revoked = 1 WHERE token_hash = ?1",
            params![token_hash],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn revoke_family(&self, family: Uuid) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE refresh_tokens SET revoked = 1 WHERE family = ?1",
            params![family.to_string()],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

pub struct AuthService {
    store: Arc<dyn AccountStore>,
    tokens: Arc<HmacTokenService>,
    refresh_ttl: Duration,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn AccountStore>,
        tokens: Arc<HmacTokenService>,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            store,
            tokens,
            refresh_ttl,
        }
    }

    pub async fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
    ) -> Result<(UserRecord, TokenPair)> {
        let email = email.trim().to_lowercase();
        if !email.contains('@') || email.len() < 3 {
            return Err(TetherError::validation("email", "not a valid email address"));
        }
        let username = username.trim();
        if username.is_empty() {
            return Err(TetherError::validation("username", "must not be empty"));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(TetherError::validation(
                "password",
                format!("must be at least {} characters", MIN_PASSWORD_LEN),
            ));
        }

        let user = UserRecord {
            id: Uuid::new_v4(),
            email,
            username: username.to_string(),
            password_hash: hash_password(password)?,
            created_at: Utc::now(),
        };
        self.store.insert_user(&user).await?;
        info!("registered user {} ({})", user.id, user.username);

        let pair = self.issue_pair(user.id, Uuid::new_v4()).await?;
        Ok((user, pair))
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<(UserRecord, TokenPair)> {
        let email = email.trim().to_lowercase();
        // One uniform error for unknown email and wrong password, so the
        // endpoint cannot be used to enumerate accounts.
        let denied = || TetherError::Authentication("invalid email or password".into());

        let user = self.store.user_by_email(&email).await?.ok_or_else(denied)?;
        if !verify_password(password, &user.password_hash) {
            return Err(denied());
        }

        let pair = self.issue_pair(user.id, Uuid::new_v4()).await?;
        Ok((user, pair))
    }

    /// Rotate a refresh token. Reuse of a revoked or expired token
    /// revokes its whole family.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let hash = hash_refresh(refresh_token);
        let record = self
            .store
            .refresh_by_hash(&hash)
            .await?
            .ok_or_else(|| TetherError::Authentication("unknown refresh token".into()))?;

        if record.revoked || record.expires_at <= Utc::now() {
            warn!(
                "refresh token reuse for family {}, revoking the family",
                record.family
            );
            self.store.revoke_family(record.family).await?;
            return Err(TetherError::Authentication(
                "refresh token no longer valid".into(),
            ));
        }

        self.store.revoke_refresh(&hash).await?;
        self.issue_pair(record.user, record.family).await
    }

    async fn issue_pair(&self, user: UserId, family: Uuid) -> Result<TokenPair> {
        let (access_token, expires_at) = self.tokens.issue(user)?;

        let mut raw = [0u8; 32];
        OsRng.try_fill_bytes(&mut raw).map_err(|e| {
            TetherError::Fatal(format!("random source failure generating refresh token: {}", e))
        })?;
        let refresh_token = hex::encode(raw);
        self.store
            .insert_refresh(&RefreshRecord {
                token_hash: hash_refresh(&refresh_token),
                user,
                family,
                expires_at: Utc::now() + self.refresh_ttl,
                revoked: false,
            })
            .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_at,
        })
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut ArgonOsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| TetherError::Internal(anyhow::anyhow!("password hashing failed: {}", e)))
}

fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Refresh tokens are stored hashed so a leaked table cannot be replayed.
fn hash_refresh(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
