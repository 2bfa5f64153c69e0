//! Web-search collector.
//!
//! Rotates a configured query set against the search API. The default
//! rotation includes non-English queries so francophone and East African
//! coverage is not an afterthought; hits from underserved-region queries
//! are emitted at high priority. Low-relevance results are dropped here,
//! at the collector, before they cost anything downstream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use fundflow::adapters::{SearchHit, SearchProvider};
use fundflow::collector::{Collector, CollectorContext, SeenHashes};
use fundflow::health::Outcome;
use fundflow::record::{CandidateRecord, CollectorKind, ExtractedFields, Priority, RawPayload};
use fundflow::Result;

/// One query in the rotation.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Query text
    pub query: String,
    /// BCP 47 locale passed to the provider
    pub locale: String,
    /// Marks queries targeting underserved regions; their hits are
    /// emitted at high priority
    pub underserved_region: bool,
}

impl SearchQuery {
    /// A query in the default (English) locale.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            locale: "en".to_string(),
            underserved_region: false,
        }
    }

    /// Set the locale.
    #[must_use]
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// Mark the query as targeting an underserved region.
    #[must_use]
    pub fn underserved(mut self) -> Self {
        self.underserved_region = true;
        self
    }
}

/// The default query rotation.
#[must_use]
pub fn default_queries() -> Vec<SearchQuery> {
    vec![
        SearchQuery::new("African AI startup funding opportunity"),
        SearchQuery::new("AI grant application Africa deadline"),
        SearchQuery::new("accelerator accepting applications artificial intelligence Africa"),
        SearchQuery::new("financement startup intelligence artificielle Afrique")
            .locale("fr")
            .underserved(),
        SearchQuery::new("subvention technologie Afrique francophone candidature")
            .locale("fr")
            .underserved(),
        SearchQuery::new("ufadhili wa teknolojia Afrika Mashariki")
            .locale("sw")
            .underserved(),
    ]
}

/// Web-search collector.
pub struct WebSearchCollector {
    provider: Arc<dyn SearchProvider>,
    queries: Vec<SearchQuery>,
    relevance_floor: f64,
    poll_interval: Duration,
    seen: SeenHashes,
}

impl WebSearchCollector {
    /// Create a builder.
    #[must_use]
    pub fn builder(provider: Arc<dyn SearchProvider>) -> WebSearchCollectorBuilder {
        WebSearchCollectorBuilder {
            provider,
            queries: default_queries(),
            relevance_floor: 0.4,
            poll_interval: Duration::from_secs(900),
        }
    }

    async fn run_query(&self, ctx: &CollectorContext, query: &SearchQuery) {
        if let Err(e) = ctx
            .acquire(CollectorKind::WebSearch, Duration::from_secs(30))
            .await
        {
            debug!(query = %query.query, error = %e, "search admission denied; skipping");
            return;
        }

        let started = Instant::now();
        let hits = match self.provider.search(&query.query, &query.locale).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(query = %query.query, error = %e, "search failed");
                let outcome = if e.is_transient() {
                    Outcome::SoftFailure(e.to_string())
                } else {
                    Outcome::HardFailure(e.to_string())
                };
                ctx.report(CollectorKind::WebSearch, &outcome);
                return;
            }
        };

        let mut emitted = 0usize;
        let mut dropped = 0usize;
        for hit in hits {
            if hit.relevance.unwrap_or(0.0) < self.relevance_floor {
                dropped += 1;
                continue;
            }
            let record = self.to_candidate(query, &hit);
            match ctx.emit(&self.seen, record).await {
                Ok(true) => emitted += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!(query = %query.query, error = %e, "search emission stopped");
                    return;
                }
            }
        }

        ctx.report(
            CollectorKind::WebSearch,
            &Outcome::Success {
                latency: started.elapsed(),
                quality_hint: None,
            },
        );
        debug!(query = %query.query, emitted, dropped, "search query complete");
    }

    fn to_candidate(&self, query: &SearchQuery, hit: &SearchHit) -> CandidateRecord {
        let priority = if query.underserved_region {
            Priority::High
        } else {
            Priority::Normal
        };
        let fields = ExtractedFields {
            title: hit.title.clone(),
            description: hit.snippet.clone(),
            ..ExtractedFields::default()
        };
        CandidateRecord::new(
            CollectorKind::WebSearch,
            RawPayload::Text(format!("{}\n{}", hit.title, hit.snippet)),
            fields,
            vec![hit.url.clone()],
        )
        .with_priority(priority)
        .with_language(query.locale.split('-').next().unwrap_or("en"))
    }
}

#[async_trait]
impl Collector for WebSearchCollector {
    fn id(&self) -> CollectorKind {
        CollectorKind::WebSearch
    }

    async fn run(&self, ctx: CollectorContext) -> Result<()> {
        let mut shutdown = ctx.shutdown.clone();
        loop {
            for query in &self.queries {
                if ctx.is_shutdown() {
                    return Ok(());
                }
                self.run_query(&ctx, query).await;
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

/// Builder for [`WebSearchCollector`].
pub struct WebSearchCollectorBuilder {
    provider: Arc<dyn SearchProvider>,
    queries: Vec<SearchQuery>,
    relevance_floor: f64,
    poll_interval: Duration,
}

impl WebSearchCollectorBuilder {
    /// Replace the query rotation.
    #[must_use]
    pub fn queries(mut self, queries: Vec<SearchQuery>) -> Self {
        self.queries = queries;
        self
    }

    /// Set the relevance floor below which hits are dropped (default: 0.4).
    #[must_use]
    pub fn relevance_floor(mut self, floor: f64) -> Self {
        self.relevance_floor = floor;
        self
    }

    /// Set the rotation interval (default: 15 min).
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build the collector.
    #[must_use]
    pub fn build(self) -> WebSearchCollector {
        WebSearchCollector {
            provider: self.provider,
            queries: self.queries,
            relevance_floor: self.relevance_floor,
            poll_interval: self.poll_interval,
            seen: SeenHashes::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyProvider;

    #[async_trait]
    impl SearchProvider for EmptyProvider {
        async fn search(&self, _query: &str, _locale: &str) -> Result<Vec<SearchHit>> {
            Ok(vec![])
        }
    }

    fn hit(relevance: Option<f64>) -> SearchHit {
        SearchHit {
            title: "AI grant applications open".to_string(),
            url: "https://news.example/grant".to_string(),
            snippet: "Apply by December".to_string(),
            relevance,
        }
    }

    #[test]
    fn test_default_queries_include_non_english() {
        let queries = default_queries();
        assert!(queries.iter().any(|q| q.locale == "fr"));
        assert!(queries.iter().any(|q| q.locale == "sw"));
        assert!(queries.iter().any(|q| q.underserved_region));
    }

    #[test]
    fn test_underserved_query_emits_high_priority() {
        let collector = WebSearchCollector::builder(Arc::new(EmptyProvider)).build();
        let underserved = SearchQuery::new("q").locale("fr").underserved();
        let record = collector.to_candidate(&underserved, &hit(Some(0.9)));
        assert_eq!(record.priority, Priority::High);
        assert_eq!(record.language.as_deref(), Some("fr"));

        let plain = SearchQuery::new("q");
        let record = collector.to_candidate(&plain, &hit(Some(0.9)));
        assert_eq!(record.priority, Priority::Normal);
    }

    #[test]
    fn test_candidate_carries_hit_url() {
        let collector = WebSearchCollector::builder(Arc::new(EmptyProvider)).build();
        let record = collector.to_candidate(&SearchQuery::new("q"), &hit(Some(0.9)));
        assert_eq!(record.source_urls, vec!["https://news.example/grant".to_string()]);
        assert_eq!(record.collector, CollectorKind::WebSearch);
    }
}
