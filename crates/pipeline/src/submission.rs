use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use castline_core::{DomainError, DomainResult, SubmissionId};

/// Longest free-text note accepted with a submission.
pub const MAX_NOTE_LEN: usize = 1_000;

/// What kind of content a submission points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Url,
    Youtube,
    Pdf,
    Document,
}

impl core::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ContentKind::Url => "url",
            ContentKind::Youtube => "youtube",
            ContentKind::Pdf => "pdf",
            ContentKind::Document => "document",
        })
    }
}

impl core::str::FromStr for ContentKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "url" => Ok(ContentKind::Url),
            "youtube" => Ok(ContentKind::Youtube),
            "pdf" => Ok(ContentKind::Pdf),
            "document" => Ok(ContentKind::Document),
            other => Err(DomainError::validation(format!(
                "unknown content kind `{other}` (expected url, youtube, pdf or document)"
            ))),
        }
    }
}

/// Submission status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SubmissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubmissionStatus::Completed | SubmissionStatus::Failed)
    }

    /// States reachable in one step from `self`.
    pub fn allowed_targets(self) -> &'static [SubmissionStatus] {
        match self {
            SubmissionStatus::Pending => &[SubmissionStatus::Processing],
            SubmissionStatus::Processing => {
                &[SubmissionStatus::Completed, SubmissionStatus::Failed]
            }
            SubmissionStatus::Completed | SubmissionStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(self, target: SubmissionStatus) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl core::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Processing => "processing",
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::Failed => "failed",
        })
    }
}

/// The user-facing record of one content item to be turned into an episode.
///
/// Values are immutable: every lifecycle change produces a new
/// `ContentSubmission` through [`SubmissionStateMachine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSubmission {
    id: SubmissionId,
    source_url: String,
    content_kind: ContentKind,
    note: Option<String>,
    status: SubmissionStatus,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl ContentSubmission {
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn content_kind(&self) -> ContentKind {
        self.content_kind
    }

    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    pub fn status(&self) -> SubmissionStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn transition(
        &self,
        target: SubmissionStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<ContentSubmission> {
        SubmissionStateMachine::transition(self, target, error_message, now)
    }
}

/// Validation and lifecycle rules for [`ContentSubmission`].
///
/// `pending -> processing -> {completed, failed}`; both outcomes are terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmissionStateMachine;

impl SubmissionStateMachine {
    /// Validate input and produce a new submission in `pending`.
    pub fn create(
        source_url: &str,
        content_kind: ContentKind,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> DomainResult<ContentSubmission> {
        let url = validate_source_url(source_url, content_kind)?;

        let note = match note.map(str::trim) {
            Some(n) if n.chars().count() > MAX_NOTE_LEN => {
                return Err(DomainError::validation(format!(
                    "note must be at most {MAX_NOTE_LEN} characters"
                )));
            }
            Some("") | None => None,
            Some(n) => Some(n.to_string()),
        };

        Ok(ContentSubmission {
            id: SubmissionId::new(),
            source_url: url.to_string(),
            content_kind,
            note,
            status: SubmissionStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        })
    }

    /// Produce the successor of `current` in state `target`.
    ///
    /// `current` is never modified; on error the caller still holds the
    /// untouched original.
    pub fn transition(
        current: &ContentSubmission,
        target: SubmissionStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<ContentSubmission> {
        if !current.status.can_transition_to(target) {
            return Err(DomainError::invalid_transition(current.status, target));
        }

        let error_message = match target {
            SubmissionStatus::Failed => {
                let msg = error_message.map(|m| m.trim().to_string()).unwrap_or_default();
                if msg.is_empty() {
                    return Err(DomainError::validation(
                        "a failed submission requires an error message",
                    ));
                }
                Some(msg)
            }
            _ => None,
        };

        let processed_at = if target.is_terminal() {
            Some(now)
        } else {
            current.processed_at
        };

        Ok(ContentSubmission {
            status: target,
            error_message,
            updated_at: now,
            processed_at,
            ..current.clone()
        })
    }
}

/// Check that `raw` is an absolute `http`/`https` URL, and for YouTube
/// submissions that it points at a video.
pub fn validate_source_url(raw: &str, kind: ContentKind) -> DomainResult<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DomainError::validation("source url must not be empty"));
    }

    let url = Url::parse(raw)
        .map_err(|e| DomainError::validation(format!("source url is not a valid URL: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(DomainError::validation(format!(
            "source url must use http or https, got `{}`",
            url.scheme()
        )));
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(DomainError::validation("source url must include a host"));
    }

    if kind == ContentKind::Youtube && youtube_video_id(&url).is_none() {
        return Err(DomainError::validation(
            "youtube submissions must link to a video (youtube.com/watch?v=…, youtu.be/…, /shorts/…)",
        ));
    }

    Ok(url)
}

/// Extract the 11-character video id from a YouTube URL, if it has one.
pub fn youtube_video_id(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let candidate = match host {
        "youtu.be" => url.path_segments()?.next().map(str::to_string),
        "youtube.com" | "m.youtube.com" | "music.youtube.com" => {
            let mut segments = url.path_segments()?;
            match segments.next() {
                Some("watch") => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned()),
                Some("shorts" | "embed" | "live") => segments.next().map(str::to_string),
                _ => None,
            }
        }
        _ => None,
    }?;

    let valid = candidate.len() == 11
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn pending() -> ContentSubmission {
        SubmissionStateMachine::create("https://example.com/a", ContentKind::Url, None, now())
            .unwrap()
    }

    #[test]
    fn create_produces_pending_submission() {
        let at = now();
        let s = SubmissionStateMachine::create(
            "https://example.com/a",
            ContentKind::Url,
            Some("  weekly digest  "),
            at,
        )
        .unwrap();

        assert_eq!(s.status(), SubmissionStatus::Pending);
        assert_eq!(s.source_url(), "https://example.com/a");
        assert_eq!(s.note(), Some("weekly digest"));
        assert_eq!(s.created_at(), at);
        assert!(s.processed_at().is_none());
        assert!(s.error_message().is_none());
    }

    #[test]
    fn create_rejects_malformed_and_non_http_urls() {
        for bad in ["", "not a url", "ftp://example.com/file", "mailto:someone@example.com"] {
            let err = SubmissionStateMachine::create(bad, ContentKind::Url, None, now()).unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "{bad} should be rejected");
        }
    }

    #[test]
    fn youtube_kind_requires_video_shape() {
        for good in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://m.youtube.com/shorts/dQw4w9WgXcQ",
        ] {
            assert!(
                SubmissionStateMachine::create(good, ContentKind::Youtube, None, now()).is_ok(),
                "{good} should be accepted"
            );
        }

        for bad in [
            "https://example.com/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/channel/abc",
            "https://www.youtube.com/watch?v=short",
        ] {
            let err =
                SubmissionStateMachine::create(bad, ContentKind::Youtube, None, now()).unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "{bad} should be rejected");
        }
    }

    #[test]
    fn pdf_and_document_kinds_only_need_http_url() {
        assert!(
            SubmissionStateMachine::create("https://example.com/x.pdf", ContentKind::Pdf, None, now())
                .is_ok()
        );
        assert!(
            SubmissionStateMachine::create("http://docs.example.com/d", ContentKind::Document, None, now())
                .is_ok()
        );
    }

    #[test]
    fn overlong_note_is_rejected() {
        let note = "x".repeat(MAX_NOTE_LEN + 1);
        let err = SubmissionStateMachine::create(
            "https://example.com/a",
            ContentKind::Url,
            Some(&note),
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn processed_at_is_set_exactly_when_terminal_state_is_entered() {
        let s = pending();
        let t1 = s.created_at() + Duration::seconds(1);
        let t2 = t1 + Duration::seconds(5);

        let processing = s.transition(SubmissionStatus::Processing, None, t1).unwrap();
        assert!(processing.processed_at().is_none());
        assert_eq!(processing.updated_at(), t1);

        let done = processing.transition(SubmissionStatus::Completed, None, t2).unwrap();
        assert_eq!(done.processed_at(), Some(t2));
        assert_eq!(done.id(), s.id());
    }

    #[test]
    fn failed_requires_error_message() {
        let processing = pending()
            .transition(SubmissionStatus::Processing, None, now())
            .unwrap();

        let err = processing
            .transition(SubmissionStatus::Failed, Some("   ".into()), now())
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let failed = processing
            .transition(SubmissionStatus::Failed, Some("extraction timed out".into()), now())
            .unwrap();
        assert_eq!(failed.error_message(), Some("extraction timed out"));
        assert!(failed.processed_at().is_some());
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        let done = pending()
            .transition(SubmissionStatus::Processing, None, now())
            .unwrap()
            .transition(SubmissionStatus::Completed, None, now())
            .unwrap();

        for target in [
            SubmissionStatus::Pending,
            SubmissionStatus::Processing,
            SubmissionStatus::Completed,
            SubmissionStatus::Failed,
        ] {
            let err = done.transition(target, Some("x".into()), now()).unwrap_err();
            assert!(matches!(err, DomainError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn rejected_transition_leaves_original_unchanged() {
        let s = pending();
        let before = s.clone();

        let err = s
            .transition(SubmissionStatus::Completed, None, now())
            .unwrap_err();

        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: "pending".into(),
                to: "completed".into()
            }
        );
        assert_eq!(s, before);
    }

    #[test]
    fn content_kind_parses_case_insensitively() {
        assert_eq!("YouTube".parse::<ContentKind>().unwrap(), ContentKind::Youtube);
        assert!("video".parse::<ContentKind>().is_err());
    }
}
