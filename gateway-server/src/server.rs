use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use gateway::{
    accounts::AccountService, auth::JwtManager, engagement::EngagementService,
    rate_limit::{self, ClientLimiter}, redis::RedisCounterStore, router, users::PgUserStore,
    video::PgVideoStore,
};

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let store_timeout = Duration::from_millis(config.store_timeout_ms);

    // Neither store connects up front: the gateway starts and reports unhealthy while they are down.
    let videos = PgVideoStore::connect_lazy(
        &config.database_url,
        config.database_max_connections,
        store_timeout,
    )?;
    let users = PgUserStore::new(videos.pool());
    let counters = RedisCounterStore::new(config.redis_url)?;
    let engagement = EngagementService::new(videos, counters, store_timeout);

    let jwt = JwtManager::new(
        &config.jwt_secret,
        time::Duration::hours(config.jwt_expiration_hours),
    );
    let accounts = AccountService::new(users, jwt, store_timeout);

    let client_ip_source = config
        .client_ip_source
        .as_deref()
        .map(rate_limit::parse_client_ip_source)
        .transpose()
        .context("invalid CLIENT_IP_SOURCE")?;

    let limiter = ClientLimiter::new(config.rate_limit_per_second, config.rate_limit_burst)
        .with_reclaim_interval(Duration::from_secs(config.rate_limit_reclaim_secs));
    let reclaimer = limiter.start_reclaimer();

    let app = router::router(
        gateway::time::SystemTime {},
        engagement,
        accounts,
        limiter,
        &config.cors_allowed_origins,
        client_ip_source,
        config.export_prometheus,
    );

    // run our app with hyper
    // `axum::Server` is a re-export of `hyper::Server`
    tracing::info!("listening on {:?}", listener.local_addr()?);
    let served = axum::Server::from_tcp(listener)?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await;

    reclaimer.abort();
    served?;

    Ok(())
}
