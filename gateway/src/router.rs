use std::future::ready;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use axum_client_ip::SecureClientIpSource;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{
    accounts::AccountService,
    auth,
    engagement::EngagementService,
    handlers,
    prometheus::{setup_metrics_recorder, track_metrics},
    rate_limit::{self, ClientLimiter},
    time::TimeSource,
};

#[derive(Clone)]
pub struct State {
    pub engagement: Arc<EngagementService>,
    pub accounts: Arc<AccountService>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
}

/// `allowed_origins` is either `*` or a comma-separated list of origins.
pub fn cors(allowed_origins: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]);

    if allowed_origins.trim() == "*" {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin, "ignoring malformed CORS origin");
                None
            }
        })
        .collect();

    layer.allow_origin(origins)
}

/// `client_ip_source` selects how the rate limiter identifies clients. `None` trusts the
/// leftmost `X-Forwarded-For` entry, which only suits deployments with no proxy in front.
pub fn router<TZ: TimeSource + Send + Sync + 'static>(
    timesource: TZ,
    engagement: EngagementService,
    accounts: AccountService,
    limiter: ClientLimiter,
    allowed_origins: &str,
    client_ip_source: Option<SecureClientIpSource>,
    metrics: bool,
) -> Router {
    let jwt = accounts.jwt();
    let state = State {
        engagement: Arc::new(engagement),
        accounts: Arc::new(accounts),
        timesource: Arc::new(timesource),
    };

    let protected = Router::new()
        .route(
            "/videos/:id/engagement/:metric",
            post(handlers::increment_engagement),
        )
        .route("/auth/me", get(handlers::profile))
        .route_layer(middleware::from_fn_with_state(jwt, auth::require_auth));

    let api = Router::new()
        .route("/auth/register", post(handlers::register))
        .route("/auth/login", post(handlers::login))
        .route("/videos", get(handlers::list_videos))
        .route("/videos/:id", get(handlers::get_video))
        .route("/users/:user_id/videos", get(handlers::list_user_videos))
        .merge(protected);

    let router = Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api);

    let router = match client_ip_source {
        Some(source) => router
            .layer(middleware::from_fn_with_state(
                limiter,
                rate_limit::enforce_trusted,
            ))
            .layer(source.into_extension()),
        None => router.layer(middleware::from_fn_with_state(limiter, rate_limit::enforce)),
    };

    // Layers wrap outside-in: tracing sees every request, CORS preflights never spend tokens.
    let router = router
        .layer(cors(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(track_metrics))
        .with_state(state);

    // Installing a global recorder when the gateway is used as a library (during tests etc)
    // does not work well, so only do it when asked.
    if !metrics {
        return router;
    }

    match setup_metrics_recorder() {
        Ok(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        Err(e) => {
            tracing::error!("failed to install metrics recorder, /metrics disabled: {}", e);
            router
        }
    }
}
