pub mod accounts;
pub mod api;
pub mod auth;
pub mod engagement;
pub mod handlers;
pub mod prometheus;
pub mod rate_limit;
pub mod redis;
pub mod router;
pub mod time;
pub mod users;
pub mod video;
