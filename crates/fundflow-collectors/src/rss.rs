//! RSS/Atom feed collector.
//!
//! Polls a configured feed list; per feed it keeps the set of item ids it
//! has already emitted so only new items become candidates. A fetch error
//! is a soft failure; a repeated error on the same feed escalates to a
//! hard failure (and eventually opens the collector's breaker).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use fundflow::adapters::HttpFetcher;
use fundflow::collector::{Collector, CollectorContext, SeenHashes};
use fundflow::health::Outcome;
use fundflow::record::{CandidateRecord, CollectorKind, ExtractedFields, Priority, RawPayload};
use fundflow::{Error, Result};

/// A first fetch error on a feed is soft; a repeated (consecutive) error
/// escalates to hard and counts toward the breaker.
const HARD_FAILURE_AFTER: u32 = 2;

/// A parsed feed item.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FeedItem {
    pub id: String,
    pub title: String,
    pub link: String,
    pub description: String,
}

/// RSS/Atom feed collector.
pub struct RssCollector {
    feeds: Vec<String>,
    fetcher: Arc<dyn HttpFetcher>,
    poll_interval: Duration,
    fetch_timeout: Duration,
    seen: SeenHashes,
    seen_items: Mutex<HashMap<String, HashSet<String>>>,
    feed_errors: Mutex<HashMap<String, u32>>,
}

impl RssCollector {
    /// Create a builder.
    #[must_use]
    pub fn builder(fetcher: Arc<dyn HttpFetcher>) -> RssCollectorBuilder {
        RssCollectorBuilder {
            fetcher,
            feeds: Vec::new(),
            poll_interval: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(30),
        }
    }

    async fn poll_feed(&self, ctx: &CollectorContext, feed_url: &str) {
        if let Err(e) = ctx.acquire(CollectorKind::Rss, Duration::from_secs(30)).await {
            debug!(feed = feed_url, error = %e, "rss admission denied; skipping poll");
            return;
        }

        let started = Instant::now();
        let response = self
            .fetcher
            .fetch(feed_url, &HashMap::new(), self.fetch_timeout)
            .await;
        let body = match response {
            Ok(response) if (200..300).contains(&response.status) => response.body,
            Ok(response) => {
                self.report_feed_error(ctx, feed_url, &format!("HTTP {}", response.status));
                return;
            }
            Err(e) => {
                self.report_feed_error(ctx, feed_url, &e.to_string());
                return;
            }
        };

        let items = match parse_feed(&body) {
            Ok(items) => items,
            Err(e) => {
                self.report_feed_error(ctx, feed_url, &e.to_string());
                return;
            }
        };
        self.feed_errors.lock().remove(feed_url);

        let mut emitted = 0usize;
        for item in items {
            let is_new = self
                .seen_items
                .lock()
                .entry(feed_url.to_string())
                .or_default()
                .insert(item.id.clone());
            if !is_new {
                continue;
            }

            let fields = ExtractedFields {
                title: item.title.clone(),
                description: item.description.clone(),
                ..ExtractedFields::default()
            };
            let urls = if item.link.is_empty() {
                vec![feed_url.to_string()]
            } else {
                vec![item.link.clone()]
            };
            let record = CandidateRecord::new(
                CollectorKind::Rss,
                RawPayload::Text(format!("{}\n{}", item.title, item.description)),
                fields,
                urls,
            )
            .with_priority(Priority::Normal);

            match ctx.emit(&self.seen, record).await {
                Ok(true) => emitted += 1,
                Ok(false) => {} // duplicate content, dropped silently
                Err(e) if e.is_backpressure() => {
                    debug!(feed = feed_url, error = %e, "rss emission paused by breaker");
                    return;
                }
                Err(e) => {
                    warn!(feed = feed_url, error = %e, "rss emission failed");
                    return;
                }
            }
        }

        ctx.report(
            CollectorKind::Rss,
            &Outcome::Success {
                latency: started.elapsed(),
                quality_hint: None,
            },
        );
        debug!(feed = feed_url, emitted, "rss poll complete");
    }

    fn report_feed_error(&self, ctx: &CollectorContext, feed_url: &str, error: &str) {
        let mut errors = self.feed_errors.lock();
        let count = errors.entry(feed_url.to_string()).or_insert(0);
        *count += 1;
        if *count >= HARD_FAILURE_AFTER {
            warn!(feed = feed_url, consecutive = *count, error, "repeated feed failure");
            ctx.report(
                CollectorKind::Rss,
                &Outcome::HardFailure(format!("{feed_url}: {error}")),
            );
        } else {
            debug!(feed = feed_url, consecutive = *count, error, "feed fetch failed");
            ctx.report(
                CollectorKind::Rss,
                &Outcome::SoftFailure(format!("{feed_url}: {error}")),
            );
        }
    }
}

#[async_trait]
impl Collector for RssCollector {
    fn id(&self) -> CollectorKind {
        CollectorKind::Rss
    }

    async fn run(&self, ctx: CollectorContext) -> Result<()> {
        let mut shutdown = ctx.shutdown.clone();
        loop {
            for feed_url in &self.feeds {
                if ctx.is_shutdown() {
                    return Ok(());
                }
                self.poll_feed(&ctx, feed_url).await;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Builder for [`RssCollector`].
pub struct RssCollectorBuilder {
    fetcher: Arc<dyn HttpFetcher>,
    feeds: Vec<String>,
    poll_interval: Duration,
    fetch_timeout: Duration,
}

impl RssCollectorBuilder {
    /// Add a feed URL to poll.
    #[must_use]
    pub fn feed(mut self, url: impl Into<String>) -> Self {
        self.feeds.push(url.into());
        self
    }

    /// Set the poll interval (default: 5 min).
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build the collector.
    #[must_use]
    pub fn build(self) -> RssCollector {
        RssCollector {
            feeds: self.feeds,
            fetcher: self.fetcher,
            poll_interval: self.poll_interval,
            fetch_timeout: self.fetch_timeout,
            seen: SeenHashes::new(),
            seen_items: Mutex::new(HashMap::new()),
            feed_errors: Mutex::new(HashMap::new()),
        }
    }
}

/// Parse an RSS 2.0 or Atom document into feed items.
pub(crate) fn parse_feed(xml: &str) -> Result<Vec<FeedItem>> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut current: Option<FeedItem> = None;
    let mut text_buffer = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "item" || name == "entry" {
                    current = Some(FeedItem {
                        id: String::new(),
                        title: String::new(),
                        link: String::new(),
                        description: String::new(),
                    });
                } else if name == "link" {
                    // Atom links carry the URL in an href attribute.
                    if let Some(item) = current.as_mut() {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"href" && item.link.is_empty() {
                                item.link = String::from_utf8_lossy(&attr.value).to_string();
                            }
                        }
                    }
                }
                text_buffer.clear();
            }
            Ok(Event::Text(e)) => {
                text_buffer = e.unescape().unwrap_or_default().to_string();
            }
            Ok(Event::CData(e)) => {
                text_buffer = String::from_utf8_lossy(&e.into_inner()).to_string();
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "item" || name == "entry" {
                    if let Some(mut item) = current.take() {
                        if item.id.is_empty() {
                            item.id = if item.link.is_empty() {
                                item.title.clone()
                            } else {
                                item.link.clone()
                            };
                        }
                        if !item.title.is_empty() {
                            items.push(item);
                        }
                    }
                } else if let Some(item) = current.as_mut() {
                    match name.as_str() {
                        "title" => item.title = text_buffer.clone(),
                        "link" => {
                            if item.link.is_empty() {
                                item.link = text_buffer.clone();
                            }
                        }
                        "description" | "summary" | "content" => {
                            item.description = text_buffer.clone();
                        }
                        "guid" | "id" => item.id = text_buffer.clone(),
                        _ => {}
                    }
                }
                text_buffer.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::SchemaViolation(format!("feed XML parse error: {e}")));
            }
            _ => {}
        }
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS_SAMPLE: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>African Tech Funding</title>
    <item>
      <title>Applications open for the AI Growth Grant</title>
      <link>https://news.example/grant</link>
      <guid>grant-2026</guid>
      <description>Apply by 30 September for grants up to $50,000.</description>
    </item>
    <item>
      <title>Foo Ltd raises $5M Series A</title>
      <link>https://news.example/foo</link>
      <guid>foo-5m</guid>
      <description><![CDATA[Foo Ltd announces funding led by Bar Capital.]]></description>
    </item>
  </channel>
</rss>"#;

    const ATOM_SAMPLE: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Funding Feed</title>
  <entry>
    <id>urn:entry:1</id>
    <title>Call for proposals: agritech accelerator</title>
    <link href="https://atom.example/agritech"/>
    <summary>Accepting applications until November.</summary>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_rss_items() {
        let items = parse_feed(RSS_SAMPLE).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "grant-2026");
        assert_eq!(items[0].title, "Applications open for the AI Growth Grant");
        assert_eq!(items[0].link, "https://news.example/grant");
        assert!(items[0].description.contains("Apply by 30 September"));
        // CDATA description survives.
        assert!(items[1].description.contains("Bar Capital"));
    }

    #[test]
    fn test_parse_atom_entries() {
        let items = parse_feed(ATOM_SAMPLE).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "urn:entry:1");
        assert_eq!(items[0].link, "https://atom.example/agritech");
        assert!(items[0].description.contains("Accepting applications"));
    }

    #[test]
    fn test_parse_feed_without_guid_falls_back_to_link() {
        let xml = r#"<rss><channel><item>
            <title>No guid here</title>
            <link>https://news.example/noguid</link>
            <description>d</description>
        </item></channel></rss>"#;
        let items = parse_feed(xml).unwrap();
        assert_eq!(items[0].id, "https://news.example/noguid");
    }

    #[test]
    fn test_parse_skips_untitled_items() {
        let xml = r#"<rss><channel><item>
            <link>https://news.example/untitled</link>
        </item></channel></rss>"#;
        let items = parse_feed(xml).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_malformed_xml_is_schema_violation() {
        let err = parse_feed("<rss><channel><item></rss>").unwrap_err();
        assert!(matches!(err, Error::SchemaViolation(_)));
    }
}
