use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// A registered account, as stored in the `users` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub display_name: String,
    pub bio: String,
    pub avatar_url: String,
    pub is_adult: bool,
    pub adult_mode: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Everything needed to create an account. The password is already hashed.
#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub display_name: String,
    pub is_adult: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore {
    /// Insert a new account. Returns `None` when the email or username is already taken.
    async fn create(&self, user: &NewUser) -> Result<Option<User>>;
    async fn get_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn get_by_id(&self, id: i64) -> Result<Option<User>>;
}

const USER_COLUMNS: &str = "id, email, username, password_hash, display_name, bio, avatar_url, \
     is_adult, adult_mode, created_at, updated_at";

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> PgUserStore {
        PgUserStore { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create(&self, user: &NewUser) -> Result<Option<User>> {
        let now = OffsetDateTime::now_utc();

        // Any unique violation turns into an empty result rather than an error.
        let created = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, username, password_hash, display_name, bio, avatar_url,
                               is_adult, adult_mode, created_at, updated_at)
            VALUES ($1, $2, $3, $4, '', '', $5, FALSE, $6, $6)
            ON CONFLICT DO NOTHING
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.display_name)
        .bind(user.is_adult)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(created)
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }
}

/// In-memory user store with sequential ids.
#[derive(Clone, Default)]
pub struct MemoryUserStore {
    users: Arc<RwLock<Vec<User>>>,
    next_id: Arc<AtomicI64>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryUserStore {
    pub fn new() -> MemoryUserStore {
        MemoryUserStore::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("memory user store is unavailable"));
        }

        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, user: &NewUser) -> Result<Option<User>> {
        self.check()?;

        let mut users = self.users.write().await;
        if users
            .iter()
            .any(|u| u.email == user.email || u.username == user.username)
        {
            return Ok(None);
        }

        let now = OffsetDateTime::now_utc();
        let created = User {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            email: user.email.clone(),
            username: user.username.clone(),
            password_hash: user.password_hash.clone(),
            display_name: user.display_name.clone(),
            bio: String::new(),
            avatar_url: String::new(),
            is_adult: user.is_adult,
            adult_mode: false,
            created_at: now,
            updated_at: now,
        };
        users.push(created.clone());

        Ok(Some(created))
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        self.check()?;

        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.email == email).cloned())
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        self.check()?;

        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.id == id).cloned())
    }
}
