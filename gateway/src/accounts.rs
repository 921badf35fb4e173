//! Account registration and login. Successful calls are answered with a bearer token from the
//! shared `JwtManager`, the same one `require_auth` validates against.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::api::{AuthResponse, GatewayError};
use crate::auth::JwtManager;
use crate::users::{NewUser, User, UserStore};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    pub display_name: String,
    #[serde(default)]
    pub is_adult: bool,
}

impl RegisterRequest {
    fn validate(&self) -> Result<(), GatewayError> {
        validate_email(&self.email)?;
        validate_password(&self.password)?;

        let username_len = self.username.chars().count();
        if !(3..=30).contains(&username_len) {
            return Err(GatewayError::InvalidInput(String::from(
                "username must be between 3 and 30 characters",
            )));
        }

        let display_len = self.display_name.chars().count();
        if !(1..=50).contains(&display_len) {
            return Err(GatewayError::InvalidInput(String::from(
                "display name must be between 1 and 50 characters",
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

fn validate_email(email: &str) -> Result<(), GatewayError> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(GatewayError::InvalidInput(format!(
            "invalid email address {email:?}"
        ))),
    }
}

fn validate_password(password: &str) -> Result<(), GatewayError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(GatewayError::InvalidInput(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    Ok(())
}

/// Argon2id, PHC string format with a random salt.
fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("password hashing failed: {}", e))
}

fn verify_password(password: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| anyhow!("malformed password hash: {}", e))?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(anyhow!("password verification failed: {}", e)),
    }
}

fn invalid_credentials() -> GatewayError {
    GatewayError::Unauthorized(String::from("invalid email or password"))
}

pub struct AccountService {
    users: Arc<dyn UserStore + Send + Sync>,
    jwt: Arc<JwtManager>,
    timeout: Duration,
}

impl AccountService {
    pub fn new<U>(users: U, jwt: JwtManager, timeout: Duration) -> AccountService
    where
        U: UserStore + Send + Sync + 'static,
    {
        AccountService {
            users: Arc::new(users),
            jwt: Arc::new(jwt),
            timeout,
        }
    }

    pub fn jwt(&self) -> Arc<JwtManager> {
        self.jwt.clone()
    }

    #[instrument(skip_all, fields(username = %request.username))]
    pub async fn register(&self, request: RegisterRequest) -> Result<AuthResponse, GatewayError> {
        request.validate()?;

        let password = request.password;
        // CPU bound, so off the async workers.
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| GatewayError::Internal(format!("hashing task failed: {}", e)))?
            .map_err(|e| {
                tracing::error!("{:#}", e);
                GatewayError::Internal(String::from("failed to create user"))
            })?;

        let new_user = NewUser {
            email: request.email,
            username: request.username,
            password_hash,
            display_name: request.display_name,
            is_adult: request.is_adult,
        };

        let user = self
            .bounded(self.users.create(&new_user))
            .await?
            .ok_or_else(|| {
                GatewayError::Conflict(String::from(
                    "a user with this email or username already exists",
                ))
            })?;

        tracing::info!(user_id = user.id, "registered user");
        self.issue(user)
    }

    #[instrument(skip_all)]
    pub async fn login(&self, request: LoginRequest) -> Result<AuthResponse, GatewayError> {
        let user = self
            .bounded(self.users.get_by_email(&request.email))
            .await?
            .ok_or_else(invalid_credentials)?;

        let hash = user.password_hash.clone();
        let matches =
            tokio::task::spawn_blocking(move || verify_password(&request.password, &hash))
                .await
                .map_err(|e| GatewayError::Internal(format!("hashing task failed: {}", e)))?
                .map_err(|e| {
                    tracing::error!(user_id = user.id, "{:#}", e);
                    GatewayError::Internal(String::from("failed to authenticate user"))
                })?;

        if !matches {
            return Err(invalid_credentials());
        }

        self.issue(user)
    }

    #[instrument(skip(self))]
    pub async fn profile(&self, user_id: i64) -> Result<User, GatewayError> {
        self.bounded(self.users.get_by_id(user_id))
            .await?
            .ok_or(GatewayError::NotFound("user"))
    }

    fn issue(&self, user: User) -> Result<AuthResponse, GatewayError> {
        let token = self.jwt.generate(user.id, &user.email, &user.username)?;

        Ok(AuthResponse { token, user })
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, GatewayError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!("user store call failed: {:#}", e);
                Err(GatewayError::Unavailable(String::from("user store")))
            }
            Err(_) => {
                tracing::error!("user store call timed out after {:?}", self.timeout);
                Err(GatewayError::Unavailable(String::from("user store")))
            }
        }
    }
}
