//! Read-through enrichment of durable video rows with live engagement counters.
//!
//! Videos live in the video store, counters in the counter store, and nothing keeps the two in
//! sync: an enriched video is assembled at read time. The two stores are treated asymmetrically.
//! Video store failures always propagate. Counter reads are best effort, so a video whose counters
//! cannot be read is still served, with every counter at zero. Counter writes do propagate, since
//! an increment that vanished silently would be lost data.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::future::join_all;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::api::GatewayError;
use crate::redis::CounterStore;
use crate::video::{Video, VideoStore};

/// Pages larger than this are silently clamped.
pub const MAX_PAGE_SIZE: u32 = 100;
const COUNTER_NAMESPACE: &str = "video";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    LiveViewers,
    Likes,
    Comments,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::LiveViewers, Metric::Likes, Metric::Comments];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::LiveViewers => "live_viewers",
            Metric::Likes => "likes",
            Metric::Comments => "comments",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| GatewayError::InvalidInput(format!("unknown engagement metric {s:?}")))
    }
}

/// Counter store key for one metric of one video, e.g. `video:42:likes`.
///
/// Ids are integers and metric names contain no `:`, so keys never collide across videos or
/// metrics.
pub fn counter_key(video_id: i64, metric: Metric) -> String {
    format!("{COUNTER_NAMESPACE}:{video_id}:{metric}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementCounters {
    pub live_viewers: i64,
    #[serde(rename = "like_count")]
    pub likes: i64,
    #[serde(rename = "comment_count")]
    pub comments: i64,
}

impl EngagementCounters {
    fn set(&mut self, metric: Metric, value: i64) {
        match metric {
            Metric::LiveViewers => self.live_viewers = value,
            Metric::Likes => self.likes = value,
            Metric::Comments => self.comments = value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedVideo {
    #[serde(flatten)]
    pub video: Video,
    #[serde(flatten)]
    pub engagement: EngagementCounters,
}

pub struct EngagementService {
    videos: Arc<dyn VideoStore + Send + Sync>,
    counters: Arc<dyn CounterStore + Send + Sync>,
    timeout: Duration,
}

impl EngagementService {
    /// `timeout` bounds every individual store call.
    pub fn new<V, C>(videos: V, counters: C, timeout: Duration) -> EngagementService
    where
        V: VideoStore + Send + Sync + 'static,
        C: CounterStore + Send + Sync + 'static,
    {
        EngagementService {
            videos: Arc::new(videos),
            counters: Arc::new(counters),
            timeout,
        }
    }

    #[instrument(skip(self))]
    pub async fn get_video(&self, id: i64) -> Result<EnrichedVideo, GatewayError> {
        let video = self
            .bounded(self.videos.get_by_id(id))
            .await
            .map_err(|e| {
                tracing::error!("failed to fetch video: {:#}", e);
                GatewayError::Unavailable(String::from("video store"))
            })?
            .ok_or(GatewayError::NotFound("video"))?;

        Ok(self.enrich(video).await)
    }

    #[instrument(skip(self))]
    pub async fn list_videos(
        &self,
        limit: u32,
        offset: u32,
        live_only: bool,
    ) -> Result<Vec<EnrichedVideo>, GatewayError> {
        let videos = self
            .bounded(self.videos.list(live_only, limit.min(MAX_PAGE_SIZE), offset))
            .await
            .map_err(|e| {
                tracing::error!("failed to list videos: {:#}", e);
                GatewayError::Unavailable(String::from("video store"))
            })?;

        Ok(self.enrich_page(videos).await)
    }

    #[instrument(skip(self))]
    pub async fn list_videos_by_owner(
        &self,
        owner_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<EnrichedVideo>, GatewayError> {
        let videos = self
            .bounded(
                self.videos
                    .list_by_owner(owner_id, limit.min(MAX_PAGE_SIZE), offset),
            )
            .await
            .map_err(|e| {
                tracing::error!("failed to list videos by owner: {:#}", e);
                GatewayError::Unavailable(String::from("video store"))
            })?;

        Ok(self.enrich_page(videos).await)
    }

    /// Add one to a video's counter and return the new value.
    ///
    /// The count only lives in the counter store; it is never written back to the video row.
    #[instrument(skip(self))]
    pub async fn increment_engagement(
        &self,
        video_id: i64,
        metric: &str,
    ) -> Result<i64, GatewayError> {
        let metric: Metric = metric.parse()?;

        self.bounded(self.counters.incr(&counter_key(video_id, metric)))
            .await
            .map_err(|e| {
                tracing::error!("failed to increment {}: {:#}", metric, e);
                GatewayError::Unavailable(String::from("counter store"))
            })
    }

    /// Overwrite a video's counter, e.g. to resync live viewers from the streaming backend.
    #[instrument(skip(self))]
    pub async fn set_engagement(
        &self,
        video_id: i64,
        metric: &str,
        value: i64,
    ) -> Result<(), GatewayError> {
        let metric: Metric = metric.parse()?;

        self.bounded(self.counters.set(&counter_key(video_id, metric), value))
            .await
            .map_err(|e| {
                tracing::error!("failed to set {}: {:#}", metric, e);
                GatewayError::Unavailable(String::from("counter store"))
            })
    }

    /// Reachability of (video store, counter store).
    pub async fn health(&self) -> (bool, bool) {
        let (videos, counters) = tokio::join!(
            self.bounded(self.videos.ping()),
            self.bounded(self.counters.ping())
        );

        (videos.is_ok(), counters.is_ok())
    }

    async fn enrich_page(&self, videos: Vec<Video>) -> Vec<EnrichedVideo> {
        // join_all keeps input order regardless of which lookup finishes first.
        join_all(videos.into_iter().map(|video| self.enrich(video))).await
    }

    async fn enrich(&self, video: Video) -> EnrichedVideo {
        let engagement = match self.counters_for(video.id).await {
            Ok(engagement) => engagement,
            Err(e) => {
                counter!("gateway_counter_read_fallbacks_total", 1);
                tracing::warn!(video_id = video.id, "serving zero engagement: {:#}", e);
                EngagementCounters::default()
            }
        };

        EnrichedVideo { video, engagement }
    }

    /// All of a video's counters in a single round trip.
    async fn counters_for(&self, video_id: i64) -> anyhow::Result<EngagementCounters> {
        let keys: Vec<String> = Metric::ALL
            .iter()
            .map(|m| counter_key(video_id, *m))
            .collect();

        let values = self.bounded(self.counters.mget(&keys)).await?;
        if values.len() != keys.len() {
            return Err(anyhow!(
                "expected {} counters, store returned {}",
                keys.len(),
                values.len()
            ));
        }

        let mut engagement = EngagementCounters::default();
        for (metric, value) in Metric::ALL.into_iter().zip(values) {
            engagement.set(metric, value.unwrap_or(0));
        }

        Ok(engagement)
    }

    async fn bounded<T, F>(&self, call: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, call).await;
        histogram!(
            "gateway_store_call_duration_seconds",
            start.elapsed().as_secs_f64()
        );

        match outcome {
            Ok(result) => result,
            Err(_) => {
                counter!("gateway_store_timeouts_total", 1);
                Err(anyhow!("store call timed out after {:?}", self.timeout))
            }
        }
    }
}
