use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Durable video metadata, as stored in the `videos` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Video {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: String,
    pub thumbnail_url: String,
    pub stream_url: String,
    pub is_live: bool,
    pub is_adult_content: bool,
    pub view_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The video store. Listings are ordered newest first and paginated by offset.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoStore {
    async fn get_by_id(&self, id: i64) -> Result<Option<Video>>;
    /// A page of videos. `live_only` restricts the page to videos currently streaming.
    async fn list(&self, live_only: bool, limit: u32, offset: u32) -> Result<Vec<Video>>;
    async fn list_by_owner(&self, owner_id: i64, limit: u32, offset: u32) -> Result<Vec<Video>>;
    async fn ping(&self) -> Result<()>;
}

const VIDEO_COLUMNS: &str = "id, user_id, title, description, thumbnail_url, stream_url, \
     is_live, is_adult_content, view_count, created_at, updated_at";

#[derive(Clone)]
pub struct PgVideoStore {
    pool: PgPool,
}

impl PgVideoStore {
    pub fn new(pool: PgPool) -> PgVideoStore {
        PgVideoStore { pool }
    }

    /// Build a pool that only opens connections when a query needs one.
    pub fn connect_lazy(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<PgVideoStore> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)?;

        Ok(PgVideoStore { pool })
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}

#[async_trait]
impl VideoStore for PgVideoStore {
    async fn get_by_id(&self, id: i64) -> Result<Option<Video>> {
        let video = sqlx::query_as::<_, Video>(&format!(
            "SELECT {VIDEO_COLUMNS} FROM videos WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(video)
    }

    async fn list(&self, live_only: bool, limit: u32, offset: u32) -> Result<Vec<Video>> {
        let videos = sqlx::query_as::<_, Video>(&format!(
            r#"
            SELECT {VIDEO_COLUMNS}
            FROM videos
            WHERE ($1 = FALSE OR is_live = TRUE)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(live_only)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        Ok(videos)
    }

    async fn list_by_owner(&self, owner_id: i64, limit: u32, offset: u32) -> Result<Vec<Video>> {
        let videos = sqlx::query_as::<_, Video>(&format!(
            r#"
            SELECT {VIDEO_COLUMNS}
            FROM videos
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(owner_id)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        Ok(videos)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;

        Ok(())
    }
}

/// In-memory video store, for tests and local runs without Postgres.
#[derive(Clone, Default)]
pub struct MemoryVideoStore {
    videos: Arc<RwLock<Vec<Video>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryVideoStore {
    pub fn new() -> MemoryVideoStore {
        MemoryVideoStore::default()
    }

    pub async fn insert(&self, video: Video) {
        let mut videos = self.videos.write().await;
        videos.retain(|v| v.id != video.id);
        videos.push(video);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("memory video store is unavailable"));
        }

        Ok(())
    }

    async fn page<F>(&self, filter: F, limit: u32, offset: u32) -> Result<Vec<Video>>
    where
        F: Fn(&Video) -> bool,
    {
        self.check()?;

        let videos = self.videos.read().await;
        let mut matching: Vec<Video> = videos.iter().filter(|v| filter(v)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

#[async_trait]
impl VideoStore for MemoryVideoStore {
    async fn get_by_id(&self, id: i64) -> Result<Option<Video>> {
        self.check()?;

        let videos = self.videos.read().await;
        Ok(videos.iter().find(|v| v.id == id).cloned())
    }

    async fn list(&self, live_only: bool, limit: u32, offset: u32) -> Result<Vec<Video>> {
        self.page(|v| !live_only || v.is_live, limit, offset).await
    }

    async fn list_by_owner(&self, owner_id: i64, limit: u32, offset: u32) -> Result<Vec<Video>> {
        self.page(|v| v.user_id == owner_id, limit, offset).await
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use time::Duration;

    use crate::video::{MemoryVideoStore, Video, VideoStore};

    fn video(id: i64, user_id: i64, is_live: bool, minutes: i64) -> Video {
        let created_at = datetime!(2024-03-01 12:00 UTC) + Duration::minutes(minutes);

        Video {
            id,
            user_id,
            title: format!("video {id}"),
            description: String::new(),
            thumbnail_url: format!("https://cdn.example.com/{id}.jpg"),
            stream_url: format!("https://live.example.com/{id}.m3u8"),
            is_live,
            is_adult_content: false,
            view_count: 0,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn lists_newest_first_with_offset() {
        let store = MemoryVideoStore::new();
        for id in 1..=5 {
            store.insert(video(id, 1, false, id)).await;
        }

        let page: Vec<i64> = store
            .list(false, 2, 1)
            .await
            .unwrap()
            .iter()
            .map(|v| v.id)
            .collect();

        assert_eq!(page, vec![4, 3]);
    }

    #[tokio::test]
    async fn live_only_filters_and_false_does_not() {
        let store = MemoryVideoStore::new();
        store.insert(video(1, 1, true, 1)).await;
        store.insert(video(2, 1, false, 2)).await;

        assert_eq!(store.list(true, 10, 0).await.unwrap().len(), 1);
        assert_eq!(store.list(false, 10, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lists_by_owner() {
        let store = MemoryVideoStore::new();
        store.insert(video(1, 7, false, 1)).await;
        store.insert(video(2, 8, false, 2)).await;
        store.insert(video(3, 7, true, 3)).await;

        let owned: Vec<i64> = store
            .list_by_owner(7, 10, 0)
            .await
            .unwrap()
            .iter()
            .map(|v| v.id)
            .collect();

        assert_eq!(owned, vec![3, 1]);
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = MemoryVideoStore::new();
        store.insert(video(1, 1, false, 1)).await;
        store.set_unavailable(true);

        assert!(store.get_by_id(1).await.is_err());
        assert!(store.ping().await.is_err());
    }
}
