//! Per-client admission control for every inbound request.
//!
//! Each client identity (normally the source IP) gets its own token bucket: `per_second` tokens
//! refill continuously up to `burst`, and every admitted request spends one. A client that has
//! spent its burst is rejected until the bucket refills, and the caller responds with a 429.
//!
//! Buckets are created lazily on first sight of an identity. They are never aged individually;
//! instead a background task discards the whole mapping every `reclaim_every` (an hour by
//! default). That bounds memory for an unbounded set of client IPs, at the cost of handing
//! every client, abusive ones included, a full burst again after each sweep.
//!
//! Client identity comes from one of two middlewares. `enforce` keys on the leftmost
//! `X-Forwarded-For` entry when present, falling back to the peer address. Any client can put
//! whatever it likes in that header, so it is only a fair key when the gateway faces clients
//! directly. Behind a known proxy, use `enforce_trusted`, which reads the address from the
//! configured `SecureClientIpSource` instead.

use std::hash::Hash;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use axum_client_ip::{InsecureClientIp, SecureClientIp, SecureClientIpSource};
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock, Reference};
use metrics::counter;
use serde::de::{value, IntoDeserializer};
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::api::GatewayError;

pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(60 * 60);

struct Bucket<I> {
    tokens: f64,
    last_refill: I,
}

impl<I: Reference> Bucket<I> {
    fn full(capacity: f64, now: I) -> Self {
        Bucket {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Credit the tokens earned since the last refill, never beyond `capacity`, then try to
    /// spend one.
    fn try_spend(&mut self, now: I, per_second: f64, capacity: f64) -> bool {
        let elapsed = Duration::from(now.duration_since(self.last_refill));
        self.tokens = (self.tokens + elapsed.as_secs_f64() * per_second).min(capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

type Buckets<K, I> = DashMap<K, Bucket<I>>;

#[derive(Clone)]
pub struct ClientLimiter<K = IpAddr, C = DefaultClock>
where
    K: Hash + Eq + Clone,
    C: Clock,
{
    per_second: f64,
    capacity: f64,
    clock: C,
    reclaim_every: Duration,
    buckets: Arc<RwLock<Buckets<K, C::Instant>>>,
}

impl<K> ClientLimiter<K, DefaultClock>
where
    K: Hash + Eq + Clone,
{
    pub fn new(per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        Self::with_clock(per_second, burst, DefaultClock::default())
    }
}

impl<K, C> ClientLimiter<K, C>
where
    K: Hash + Eq + Clone,
    C: Clock,
{
    pub fn with_clock(per_second: NonZeroU32, burst: NonZeroU32, clock: C) -> Self {
        ClientLimiter {
            per_second: f64::from(per_second.get()),
            capacity: f64::from(burst.get()),
            clock,
            reclaim_every: DEFAULT_RECLAIM_INTERVAL,
            buckets: Arc::new(RwLock::new(DashMap::new())),
        }
    }

    pub fn with_reclaim_interval(mut self, every: Duration) -> Self {
        self.reclaim_every = every;
        self
    }

    /// Spend one token from `identity`'s bucket, creating a full bucket on first sight.
    ///
    /// Returns false without spending anything when the bucket holds less than one token. The
    /// refill, the check and the deduction all happen under the bucket's shard lock, so
    /// concurrent callers never both spend the last token.
    pub async fn admit(&self, identity: &K) -> bool {
        // The read guard only keeps a sweep from swapping the mapping out mid-check.
        let buckets = self.buckets.read().await;
        let now = self.clock.now();

        let mut bucket = buckets
            .entry(identity.clone())
            .or_insert_with(|| Bucket::full(self.capacity, now));

        bucket.try_spend(now, self.per_second, self.capacity)
    }

    /// Drop every bucket at once, returning how many were discarded.
    pub async fn reclaim(&self) -> usize {
        let mut buckets = self.buckets.write().await;
        let discarded = buckets.len();
        *buckets = DashMap::new();

        discarded
    }

    pub async fn tracked_clients(&self) -> usize {
        self.buckets.read().await.len()
    }

    /// Spawn the tokio reclamation task.
    ///
    /// The first sweep happens one full interval after this call. The task runs until the returned
    /// handle is aborted or the runtime shuts down. A zero interval disables reclamation.
    pub fn start_reclaimer(&self) -> JoinHandle<()>
    where
        K: Send + Sync + 'static,
        C: Send + Sync + 'static,
    {
        let limiter = self.clone();
        let every = self.reclaim_every;

        if every.is_zero() {
            tracing::warn!("rate limiter reclamation disabled, buckets will accumulate");
            return tokio::spawn(async {});
        }

        tokio::spawn(async move {
            // interval_at rather than interval: the latter ticks immediately and would wipe the
            // buckets right at startup.
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);

            loop {
                interval.tick().await;

                let discarded = limiter.reclaim().await;
                counter!("gateway_limiter_buckets_reclaimed_total", discarded as u64);
                tracing::info!(discarded, "reclaimed rate limiter buckets");
            }
        })
    }
}

/// Parse a `SecureClientIpSource` variant name, e.g. `RightmostXForwardedFor`.
pub fn parse_client_ip_source(name: &str) -> Result<SecureClientIpSource, value::Error> {
    SecureClientIpSource::deserialize(name.into_deserializer())
}

async fn admit_or_reject<B>(
    limiter: &ClientLimiter,
    ip: IpAddr,
    request: Request<B>,
    next: Next<B>,
) -> Result<Response, GatewayError> {
    if !limiter.admit(&ip).await {
        counter!("gateway_rate_limited_total", 1);
        tracing::debug!(%ip, "rate limit exceeded");
        return Err(GatewayError::RateLimited);
    }

    Ok(next.run(request).await)
}

/// axum middleware rejecting requests from clients that ran out of tokens.
///
/// Trusts the leftmost `X-Forwarded-For` entry, see the module docs.
pub async fn enforce<B>(
    State(limiter): State<ClientLimiter>,
    InsecureClientIp(ip): InsecureClientIp,
    request: Request<B>,
    next: Next<B>,
) -> Result<Response, GatewayError> {
    admit_or_reject(&limiter, ip, request, next).await
}

/// Like `enforce`, but keyed on the address reported by the `SecureClientIpSource` extension.
pub async fn enforce_trusted<B>(
    State(limiter): State<ClientLimiter>,
    SecureClientIp(ip): SecureClientIp,
    request: Request<B>,
    next: Next<B>,
) -> Result<Response, GatewayError> {
    admit_or_reject(&limiter, ip, request, next).await
}
