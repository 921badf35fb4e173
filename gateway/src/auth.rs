use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::api::GatewayError;

/// Bearer token claims. Handlers behind `require_auth` can read these from request extensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub email: String,
    pub username: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

pub struct JwtManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiration: time::Duration,
}

impl JwtManager {
    pub fn new(secret: &str, expiration: time::Duration) -> JwtManager {
        JwtManager {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expiration,
        }
    }

    /// Issue an HS256 token for a user.
    pub fn generate(
        &self,
        user_id: i64,
        email: &str,
        username: &str,
    ) -> Result<String, GatewayError> {
        let now = time::OffsetDateTime::now_utc();
        let claims = Claims {
            user_id,
            email: email.to_string(),
            username: username.to_string(),
            iat: now.unix_timestamp(),
            nbf: now.unix_timestamp(),
            exp: (now + self.expiration).unix_timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|e| {
            tracing::error!("failed to encode token: {}", e);
            GatewayError::Internal(String::from("token encoding failed"))
        })
    }

    pub fn validate(&self, token: &str) -> Result<Claims, GatewayError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;

        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => {
                    GatewayError::Unauthorized(String::from("token has expired"))
                }
                _ => {
                    tracing::debug!("token validation failed: {}", e);
                    GatewayError::Unauthorized(String::from("invalid token"))
                }
            })
    }
}

/// axum middleware requiring `Authorization: Bearer <token>`.
pub async fn require_auth<B>(
    State(jwt): State<Arc<JwtManager>>,
    mut request: Request<B>,
    next: Next<B>,
) -> Result<Response, GatewayError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::Unauthorized(String::from("missing authorization header")))?
        .strip_prefix("Bearer ")
        .ok_or_else(|| GatewayError::Unauthorized(String::from("expected a bearer token")))?;

    let claims = jwt.validate(token)?;
    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}
