//! Render options and the two fingerprints derived from them: the cache key
//! (which entry) and the ETag (is that entry still current).

use core::fmt;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use castline_core::{DomainError, DomainResult, FeedId};

use crate::episodes::Episode;

pub const DEFAULT_EPISODE_LIMIT: usize = 50;
pub const MAX_EPISODE_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

impl SortOrder {
    fn as_str(self) -> &'static str {
        match self {
            SortOrder::NewestFirst => "newest",
            SortOrder::OldestFirst => "oldest",
        }
    }
}

/// Options that change the rendered bytes of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderOptions {
    pub include_chapters: bool,
    pub include_transcript: bool,
    pub limit: usize,
    pub sort: SortOrder,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            include_chapters: true,
            include_transcript: false,
            limit: DEFAULT_EPISODE_LIMIT,
            sort: SortOrder::NewestFirst,
        }
    }
}

impl RenderOptions {
    pub fn with_chapters(mut self, on: bool) -> Self {
        self.include_chapters = on;
        self
    }

    pub fn with_transcript(mut self, on: bool) -> Self {
        self.include_transcript = on;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.limit == 0 || self.limit > MAX_EPISODE_LIMIT {
            return Err(DomainError::validation(format!(
                "episode limit must be between 1 and {MAX_EPISODE_LIMIT}"
            )));
        }
        Ok(())
    }

    /// Stable serialization: fields in alphabetical order, fixed spelling.
    pub fn canonical(&self) -> String {
        format!(
            "chapters={};limit={};sort={};transcript={}",
            u8::from(self.include_chapters),
            self.limit,
            self.sort.as_str(),
            u8::from(self.include_transcript),
        )
    }
}

/// Address of one rendered variant of one feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// `feed:{feed_id}:{options fingerprint}`.
    pub fn derive(feed_id: &FeedId, options: &RenderOptions) -> Self {
        let digest = Sha256::digest(options.canonical().as_bytes());
        Self(format!("{}{}", Self::feed_prefix(feed_id), hex::encode(&digest[..8])))
    }

    /// Prefix shared by every key of `feed_id`.
    pub fn feed_prefix(feed_id: &FeedId) -> String {
        format!("feed:{feed_id}:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 64-bit content fingerprint over the inputs that determine a rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ETag(String);

impl ETag {
    /// Fingerprint `episodes` (in id order, each with its last update time)
    /// together with `options`.
    ///
    /// Adding, removing or editing an episode changes the tag, and so does any
    /// option change. Presentation order is fixed by `options.sort`.
    pub fn compute(episodes: &[Episode], options: &RenderOptions) -> Self {
        let mut pairs: Vec<_> = episodes
            .iter()
            .map(|e| (e.id, e.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true)))
            .collect();
        pairs.sort_by(|a, b| a.0.as_uuid().cmp(b.0.as_uuid()));

        let mut hasher = Sha256::new();
        for (id, updated_at) in &pairs {
            hasher.update(id.as_uuid().as_bytes());
            hasher.update(updated_at.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(options.canonical().as_bytes());

        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
