use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::{
    accounts::{LoginRequest, RegisterRequest},
    api::{AuthResponse, EngagementUpdate, GatewayError, HealthResponse, SuccessResponse},
    auth::Claims,
    engagement::EnrichedVideo,
    router,
    users::User,
};

const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub live: Option<bool>,
}

impl PageQuery {
    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

fn parse_id(raw: &str, what: &str) -> Result<i64, GatewayError> {
    raw.parse()
        .map_err(|_| GatewayError::InvalidInput(format!("invalid {what} id {raw:?}")))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, GatewayError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| GatewayError::InvalidInput(rejection.body_text()))
}

pub async fn health(state: State<router::State>) -> (StatusCode, Json<HealthResponse>) {
    let (database, redis) = state.engagement.health().await;

    let (code, status) = if database && redis {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            database,
            redis,
            time: state.timesource.current_time(),
        }),
    )
}

pub async fn get_video(
    state: State<router::State>,
    Path(id): Path<String>,
) -> Result<Json<EnrichedVideo>, GatewayError> {
    let id = parse_id(&id, "video")?;

    Ok(Json(state.engagement.get_video(id).await?))
}

pub async fn list_videos(
    state: State<router::State>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<EnrichedVideo>>, GatewayError> {
    let videos = state
        .engagement
        .list_videos(page.limit(), page.offset(), page.live.unwrap_or(false))
        .await?;

    Ok(Json(videos))
}

pub async fn list_user_videos(
    state: State<router::State>,
    Path(user_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<EnrichedVideo>>, GatewayError> {
    let user_id = parse_id(&user_id, "user")?;

    let videos = state
        .engagement
        .list_videos_by_owner(user_id, page.limit(), page.offset())
        .await?;

    Ok(Json(videos))
}

pub async fn increment_engagement(
    state: State<router::State>,
    Extension(claims): Extension<Claims>,
    Path((id, metric)): Path<(String, String)>,
) -> Result<Json<SuccessResponse<EngagementUpdate>>, GatewayError> {
    let id = parse_id(&id, "video")?;
    tracing::debug!(user_id = claims.user_id, video_id = id, %metric, "engagement increment");

    let value = state.engagement.increment_engagement(id, &metric).await?;

    Ok(Json(SuccessResponse {
        message: String::from("Engagement incremented successfully"),
        data: Some(EngagementUpdate { metric, value }),
    }))
}

pub async fn register(
    state: State<router::State>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AuthResponse>), GatewayError> {
    let request = json_body(payload)?;

    Ok((
        StatusCode::CREATED,
        Json(state.accounts.register(request).await?),
    ))
}

pub async fn login(
    state: State<router::State>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, GatewayError> {
    let request = json_body(payload)?;

    Ok(Json(state.accounts.login(request).await?))
}

pub async fn profile(
    state: State<router::State>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<User>, GatewayError> {
    Ok(Json(state.accounts.profile(claims.user_id).await?))
}

#[cfg(test)]
mod tests {
    use crate::api::GatewayError;
    use crate::handlers::{parse_id, PageQuery};

    #[test]
    fn page_defaults() {
        let page = PageQuery::default();

        assert_eq!(page.limit(), 20);
        assert_eq!(page.offset(), 0);
    }

    #[test]
    fn malformed_ids_are_invalid_input() {
        assert_eq!(parse_id("42", "video").unwrap(), 42);
        assert!(matches!(
            parse_id("forty-two", "video"),
            Err(GatewayError::InvalidInput(_))
        ));
    }
}
