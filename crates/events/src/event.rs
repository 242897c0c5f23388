use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use castline_core::{EpisodeId, FeedId, JobId, SubmissionId};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "job.terminal").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Terminal outcome carried by a [`JobTerminal`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    Failed,
}

impl core::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            JobOutcome::Completed => f.write_str("completed"),
            JobOutcome::Failed => f.write_str("failed"),
        }
    }
}

/// Event: a processing job reached a state it will not leave on its own
/// (completed, or failed and given up on).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTerminal {
    pub feed_id: FeedId,
    pub job_id: JobId,
    pub submission_id: SubmissionId,
    pub outcome: JobOutcome,
    pub error_message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// What happened to an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeChange {
    Published,
    Updated,
    Removed,
}

/// Event: the episode set behind a feed changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeChanged {
    pub feed_id: FeedId,
    pub episode_id: EpisodeId,
    pub change: EpisodeChange,
    /// Job that produced the change. Its `JobTerminal` follows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub occurred_at: DateTime<Utc>,
}

/// Everything the pipeline publishes on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobTerminal(JobTerminal),
    EpisodeChanged(EpisodeChanged),
}

impl PipelineEvent {
    pub fn feed_id(&self) -> &FeedId {
        match self {
            PipelineEvent::JobTerminal(e) => &e.feed_id,
            PipelineEvent::EpisodeChanged(e) => &e.feed_id,
        }
    }

    /// Short human-readable description used as an invalidation reason.
    pub fn describe(&self) -> String {
        match self {
            PipelineEvent::JobTerminal(e) => {
                format!("job {} {} (submission {})", e.job_id, e.outcome, e.submission_id)
            }
            PipelineEvent::EpisodeChanged(e) => {
                let change = match e.change {
                    EpisodeChange::Published => "published",
                    EpisodeChange::Updated => "updated",
                    EpisodeChange::Removed => "removed",
                };
                format!("episode {} {change}", e.episode_id)
            }
        }
    }
}

impl Event for PipelineEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::JobTerminal(_) => "job.terminal",
            PipelineEvent::EpisodeChanged(_) => "episode.changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PipelineEvent::JobTerminal(e) => e.occurred_at,
            PipelineEvent::EpisodeChanged(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = PipelineEvent::EpisodeChanged(EpisodeChanged {
            feed_id: FeedId::parse("main").unwrap(),
            episode_id: EpisodeId::new(),
            change: EpisodeChange::Published,
            job_id: None,
            occurred_at: Utc::now(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "episode_changed");
        assert_eq!(json["feed_id"], "main");
        assert_eq!(json["change"], "published");
        assert_eq!(event.event_type(), "episode.changed");
        assert!(json.get("job_id").is_none());
    }

    #[test]
    fn job_id_is_optional_on_the_wire() {
        let json = serde_json::json!({
            "type": "episode_changed",
            "feed_id": "main",
            "episode_id": EpisodeId::new(),
            "change": "removed",
            "occurred_at": "2026-01-01T00:00:00Z",
        });
        let PipelineEvent::EpisodeChanged(event) = serde_json::from_value(json).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(event.job_id, None);
    }
}
