use std::net::SocketAddr;
use std::num::NonZeroU32;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:8080")]
    pub address: SocketAddr,

    pub database_url: String,
    #[envconfig(default = "100")]
    pub database_max_connections: u32,
    pub redis_url: String,
    // Applies to every individual store call
    #[envconfig(default = "3000")]
    pub store_timeout_ms: u64,

    #[envconfig(default = "1000")]
    pub rate_limit_per_second: NonZeroU32,
    #[envconfig(default = "2000")]
    pub rate_limit_burst: NonZeroU32,
    #[envconfig(default = "3600")]
    pub rate_limit_reclaim_secs: u64,

    pub jwt_secret: String,
    #[envconfig(default = "24")]
    pub jwt_expiration_hours: i64,

    #[envconfig(default = "*")]
    pub cors_allowed_origins: String,
    // e.g. RightmostXForwardedFor behind a proxy; unset trusts the leftmost X-Forwarded-For
    pub client_ip_source: Option<String>,

    #[envconfig(default = "false")]
    pub export_prometheus: bool,
}
