//! Feed rendering: the expensive step the cache sits in front of.

use std::fmt::Write as _;

use castline_core::FeedId;

use super::options::{RenderOptions, SortOrder};
use crate::episodes::Episode;

/// Channel-level metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMeta {
    pub feed_id: FeedId,
    pub title: String,
    pub link: String,
    pub description: String,
    pub language: String,
}

impl FeedMeta {
    pub fn new(feed_id: FeedId, link: impl Into<String>) -> Self {
        Self {
            title: format!("castline: {feed_id}"),
            feed_id,
            link: link.into(),
            description: String::new(),
            language: "en".to_string(),
        }
    }
}

pub trait FeedRenderer: Send + Sync {
    /// MIME type of the rendered body.
    fn content_type(&self) -> &'static str;

    /// Render `episodes` (any order, any length) honouring `options`.
    fn render(&self, meta: &FeedMeta, episodes: &[Episode], options: &RenderOptions) -> String;
}

/// RSS 2.0 with iTunes and Podlove simple-chapters extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RssRenderer;

impl FeedRenderer for RssRenderer {
    fn content_type(&self) -> &'static str {
        "application/rss+xml; charset=utf-8"
    }

    fn render(&self, meta: &FeedMeta, episodes: &[Episode], options: &RenderOptions) -> String {
        let mut ordered: Vec<&Episode> = episodes.iter().collect();
        match options.sort {
            SortOrder::NewestFirst => ordered.sort_by(|a, b| b.published_at.cmp(&a.published_at)),
            SortOrder::OldestFirst => ordered.sort_by(|a, b| a.published_at.cmp(&b.published_at)),
        }
        ordered.truncate(options.limit);

        let mut out = String::with_capacity(1024 + ordered.len() * 512);
        out.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        out.push('\n');
        out.push_str(concat!(
            r#"<rss version="2.0" "#,
            r#"xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd" "#,
            r#"xmlns:content="http://purl.org/rss/1.0/modules/content/" "#,
            r#"xmlns:psc="http://podlove.org/simple-chapters">"#,
        ));
        out.push_str("<channel>");
        element(&mut out, "title", &meta.title);
        element(&mut out, "link", &meta.link);
        element(&mut out, "description", &meta.description);
        element(&mut out, "language", &meta.language);

        for episode in ordered {
            render_item(&mut out, episode, options);
        }

        out.push_str("</channel></rss>\n");
        out
    }
}

fn render_item(out: &mut String, episode: &Episode, options: &RenderOptions) {
    out.push_str("<item>");
    element(out, "title", &episode.title);
    element(out, "description", &episode.description);
    let _ = write!(
        out,
        r#"<guid isPermaLink="false">{}</guid>"#,
        episode.id
    );
    element(out, "pubDate", &episode.published_at.to_rfc2822());
    let _ = write!(
        out,
        r#"<enclosure url="{}" length="{}" type="audio/mpeg"/>"#,
        escape(&episode.audio_url),
        episode.audio_bytes
    );
    element(out, "itunes:duration", &format_timestamp(episode.duration_secs));

    if options.include_chapters && !episode.chapters.is_empty() {
        out.push_str(r#"<psc:chapters version="1.2">"#);
        for chapter in &episode.chapters {
            let _ = write!(
                out,
                r#"<psc:chapter start="{}" title="{}"/>"#,
                format_timestamp(chapter.start_secs),
                escape(&chapter.title)
            );
        }
        out.push_str("</psc:chapters>");
    }

    if options.include_transcript {
        if let Some(transcript) = &episode.transcript {
            element(out, "content:encoded", transcript);
        }
    }

    out.push_str("</item>");
}

fn element(out: &mut String, name: &str, text: &str) {
    let _ = write!(out, "<{name}>{}</{name}>", escape(text));
}

fn format_timestamp(total_secs: u32) -> String {
    let (h, m, s) = (total_secs / 3600, (total_secs / 60) % 60, total_secs % 60);
    format!("{h:02}:{m:02}:{s:02}")
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::episodes::Chapter;

    fn meta() -> FeedMeta {
        FeedMeta::new(FeedId::parse("main").unwrap(), "https://example.com/feeds/main")
    }

    fn episodes() -> Vec<Episode> {
        let t0 = Utc::now();
        let mut first = Episode::new("First & foremost", "https://cdn.example.com/1.mp3", t0);
        first.duration_secs = 3_725;
        first.chapters = vec![Chapter { start_secs: 60, title: "Intro <1>".into() }];
        first.transcript = Some("hello world".into());
        let second = Episode::new("Second", "https://cdn.example.com/2.mp3", t0 + Duration::hours(1));
        vec![first, second]
    }

    #[test]
    fn renders_escaped_items_newest_first() {
        let xml = RssRenderer.render(&meta(), &episodes(), &RenderOptions::default());

        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("First &amp; foremost"));
        assert!(xml.contains("<itunes:duration>01:02:05</itunes:duration>"));
        assert!(xml.find("Second").unwrap() < xml.find("First").unwrap());
        assert!(xml.contains(r#"title="Intro &lt;1&gt;""#));
        assert!(!xml.contains("content:encoded>hello"));
    }

    #[test]
    fn options_toggle_chapters_transcript_order_and_limit() {
        let opts = RenderOptions::default()
            .with_chapters(false)
            .with_transcript(true)
            .with_sort(SortOrder::OldestFirst)
            .with_limit(1);
        let xml = RssRenderer.render(&meta(), &episodes(), &opts);

        assert!(!xml.contains("psc:chapter "));
        assert!(xml.contains("<content:encoded>hello world</content:encoded>"));
        assert_eq!(xml.matches("<item>").count(), 1);
        assert!(xml.contains("First &amp; foremost"));
    }
}
