//! Finished episodes: the rows a feed is rendered from.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use castline_core::{EpisodeId, SubmissionId};
use castline_events::EpisodeChange;

use crate::error::StoreError;
use crate::store::poisoned;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub start_secs: u32,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub submission_id: Option<SubmissionId>,
    pub title: String,
    pub description: String,
    pub audio_url: String,
    pub audio_bytes: u64,
    pub duration_secs: u32,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub chapters: Vec<Chapter>,
    pub transcript: Option<String>,
}

impl Episode {
    /// Minimal episode, mostly for tests and fixtures.
    pub fn new(title: impl Into<String>, audio_url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: EpisodeId::new(),
            submission_id: None,
            title: title.into(),
            description: String::new(),
            audio_url: audio_url.into(),
            audio_bytes: 0,
            duration_secs: 0,
            published_at: now,
            updated_at: now,
            chapters: Vec::new(),
            transcript: None,
        }
    }
}

/// Read side consulted on a feed cache miss.
#[async_trait]
pub trait EpisodeSource: Send + Sync {
    /// Newest first.
    async fn list_episodes(&self, limit: usize, offset: usize) -> Result<Vec<Episode>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

/// Write side used by the job runner once processing produced an episode.
#[async_trait]
pub trait EpisodeSink: Send + Sync {
    /// Insert or replace; reports which of the two happened.
    async fn publish(&self, episode: Episode) -> Result<EpisodeChange, StoreError>;

    /// Returns `false` when there was nothing to remove.
    async fn remove(&self, id: EpisodeId) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryEpisodeStore {
    episodes: RwLock<HashMap<EpisodeId, Episode>>,
}

impl InMemoryEpisodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl EpisodeSource for InMemoryEpisodeStore {
    async fn list_episodes(&self, limit: usize, offset: usize) -> Result<Vec<Episode>, StoreError> {
        let episodes = self.episodes.read().map_err(poisoned)?;
        let mut all: Vec<_> = episodes.values().cloned().collect();
        all.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then_with(|| b.id.as_uuid().cmp(a.id.as_uuid()))
        });
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.episodes.read().map_err(poisoned)?.len())
    }
}

#[async_trait]
impl EpisodeSink for InMemoryEpisodeStore {
    async fn publish(&self, episode: Episode) -> Result<EpisodeChange, StoreError> {
        let mut episodes = self.episodes.write().map_err(poisoned)?;
        let change = match episodes.insert(episode.id, episode) {
            Some(_) => EpisodeChange::Updated,
            None => EpisodeChange::Published,
        };
        Ok(change)
    }

    async fn remove(&self, id: EpisodeId) -> Result<bool, StoreError> {
        Ok(self.episodes.write().map_err(poisoned)?.remove(&id).is_some())
    }
}
