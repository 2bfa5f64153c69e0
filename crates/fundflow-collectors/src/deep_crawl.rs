//! Deep-crawl collector.
//!
//! Consumes pages fetched by the scrape workers and turns them into
//! enriched candidates. Extraction is a three-rung ladder: a site-specific
//! template when one is configured for the hostname, generic content
//! selectors otherwise, and LLM extraction over the cleaned text for the
//! structured fields neither can pull out. The enriched record
//! back-references the parked original by content-hash.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use scraper::{Html, Selector};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use fundflow::adapters::{llm_retry, LlmClient};
use fundflow::collector::{Collector, CollectorContext};
use fundflow::health::Outcome;
use fundflow::record::{CandidateRecord, CollectorKind, ExtractedFields, RawPayload};
use fundflow::scrape::ScrapeFetched;
use fundflow::{Error, Result};

/// CSS selectors for a site we crawl often enough to know its layout.
#[derive(Debug, Clone)]
pub struct SiteTemplate {
    /// Selector for the opportunity title
    pub title_selector: String,
    /// Selector for the main content block
    pub body_selector: String,
}

/// Deep-crawl collector.
pub struct DeepCrawlCollector {
    llm: Arc<dyn LlmClient>,
    templates: HashMap<String, SiteTemplate>,
    rx: Mutex<Option<mpsc::Receiver<ScrapeFetched>>>,
    llm_timeout: Duration,
    max_text_len: usize,
}

impl DeepCrawlCollector {
    /// Build a collector over the scrape-result stream.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>, fetched_rx: mpsc::Receiver<ScrapeFetched>) -> Self {
        Self {
            llm,
            templates: HashMap::new(),
            rx: Mutex::new(Some(fetched_rx)),
            llm_timeout: Duration::from_secs(30),
            max_text_len: 20_000,
        }
    }

    /// Register a site-specific template keyed by hostname.
    #[must_use]
    pub fn with_template(mut self, host: impl Into<String>, template: SiteTemplate) -> Self {
        self.templates.insert(host.into(), template);
        self
    }

    async fn handle_fetched(&self, ctx: &CollectorContext, fetched: ScrapeFetched) {
        let started = std::time::Instant::now();
        let template = self.templates.get(&fetched.request.host);
        let page = extract_page(&fetched.body, template, self.max_text_len);

        let fields = match self.llm_fields(&page).await {
            Ok(fields) => fields,
            Err(e) => {
                debug!(url = %fetched.request.url, error = %e, "LLM extraction failed; using page fields only");
                page.to_fields()
            }
        };

        // One enriched record per subscribed candidate: each park is
        // replaced independently.
        let mut emitted = 0usize;
        for candidate_hash in &fetched.subscribers {
            let record = CandidateRecord::enriched(
                candidate_hash.clone(),
                fetched.request.priority,
                RawPayload::Html(fetched.body.clone()),
                fields.clone(),
                vec![fetched.request.url.clone()],
            );
            match ctx.submit_with_backpressure(record).await {
                Ok(()) => emitted += 1,
                Err(e) => {
                    warn!(url = %fetched.request.url, error = %e, "enriched emission failed");
                    ctx.report(
                        CollectorKind::DeepCrawl,
                        &Outcome::SoftFailure(e.to_string()),
                    );
                    return;
                }
            }
        }

        ctx.report(
            CollectorKind::DeepCrawl,
            &Outcome::Success {
                latency: started.elapsed(),
                quality_hint: None,
            },
        );
        debug!(url = %fetched.request.url, emitted, "deep crawl complete");
    }

    /// LLM extraction over the cleaned text, mapped into extracted fields.
    async fn llm_fields(&self, page: &ExtractedPage) -> Result<ExtractedFields> {
        if page.text.trim().is_empty() {
            return Err(Error::SchemaViolation("empty page text".to_string()));
        }
        let schema = extraction_schema();
        let llm = Arc::clone(&self.llm);
        let text = page.text.clone();
        let value = tokio::time::timeout(
            self.llm_timeout,
            llm_retry("llm.extract", || {
                let llm = Arc::clone(&llm);
                let text = text.clone();
                let schema = schema.clone();
                async move { llm.extract(&text, &schema).await }
            }),
        )
        .await
        .map_err(|_| Error::DeadlineExceeded {
            operation: "llm.extract".to_string(),
            deadline: self.llm_timeout,
        })??;
        Ok(fields_from_value(&value, page))
    }
}

#[async_trait]
impl Collector for DeepCrawlCollector {
    fn id(&self) -> CollectorKind {
        CollectorKind::DeepCrawl
    }

    async fn run(&self, ctx: CollectorContext) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| Error::InternalInvariant("deep-crawl collector already running".to_string()))?;
        let mut shutdown = ctx.shutdown.clone();

        loop {
            let fetched = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { return Ok(()); }
                    continue;
                }
                fetched = rx.recv() => match fetched {
                    Some(fetched) => fetched,
                    None => return Ok(()),
                },
            };
            self.handle_fetched(&ctx, fetched).await;
        }
    }
}

/// Title and cleaned text pulled out of a page. Owns plain strings so no
/// parser state crosses an await point.
#[derive(Debug, Clone)]
struct ExtractedPage {
    title: Option<String>,
    text: String,
}

impl ExtractedPage {
    fn to_fields(&self) -> ExtractedFields {
        ExtractedFields {
            title: self.title.clone().unwrap_or_default(),
            description: self.text.chars().take(2000).collect(),
            ..ExtractedFields::default()
        }
    }
}

/// Extract title and content text, preferring the site template, then the
/// generic content areas, then the whole body.
fn extract_page(html: &str, template: Option<&SiteTemplate>, max_len: usize) -> ExtractedPage {
    let document = Html::parse_document(html);

    let mut title = None;
    let mut text = String::new();

    if let Some(template) = template {
        if let Ok(selector) = Selector::parse(&template.title_selector) {
            title = document
                .select(&selector)
                .next()
                .map(|el| collapse_whitespace(&el.text().collect::<Vec<_>>().join(" ")));
        }
        if let Ok(selector) = Selector::parse(&template.body_selector) {
            text = document
                .select(&selector)
                .map(|el| el.text().collect::<Vec<_>>().join(" "))
                .collect::<Vec<_>>()
                .join("\n");
        }
    }

    if title.is_none() {
        if let Ok(selector) = Selector::parse("title") {
            title = document
                .select(&selector)
                .next()
                .map(|el| collapse_whitespace(&el.text().collect::<Vec<_>>().join(" ")));
        }
    }

    if text.trim().is_empty() {
        // Generic content areas first, whole body as a last resort.
        for selector_str in ["article", "main", ".content", "#content", "body"] {
            if let Ok(selector) = Selector::parse(selector_str) {
                if let Some(element) = document.select(&selector).next() {
                    let extracted = element.text().collect::<Vec<_>>().join(" ");
                    if !extracted.trim().is_empty() {
                        text = extracted;
                        break;
                    }
                }
            }
        }
    }

    let text = clean_text(&text);
    let text = if text.chars().count() > max_len {
        text.chars().take(max_len).collect()
    } else {
        text
    };
    ExtractedPage { title, text }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_text(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn extraction_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "title": { "type": "string" },
            "description": { "type": "string" },
            "amount_usd": { "type": "number" },
            "deadline": { "type": "string", "format": "date" },
            "organizations": { "type": "array", "items": { "type": "string" } },
            "geography": { "type": "array", "items": { "type": "string" } },
            "sectors": { "type": "array", "items": { "type": "string" } },
            "stage": { "type": "string" }
        }
    })
}

fn string_list(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Map the LLM's extraction JSON into fields, falling back to the page's
/// own title/text where the model returned nothing.
fn fields_from_value(value: &serde_json::Value, page: &ExtractedPage) -> ExtractedFields {
    let fallback = page.to_fields();
    ExtractedFields {
        title: value["title"]
            .as_str()
            .map(str::to_string)
            .filter(|t| !t.is_empty())
            .unwrap_or(fallback.title),
        description: value["description"]
            .as_str()
            .map(str::to_string)
            .filter(|d| !d.is_empty())
            .unwrap_or(fallback.description),
        amount_usd: value["amount_usd"].as_f64(),
        deadline: value["deadline"]
            .as_str()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
        transaction_date: value["transaction_date"]
            .as_str()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
        organizations: {
            let mut orgs = string_list(&value["organizations"]);
            if orgs.is_empty() {
                if let Some(org) = value["organization"].as_str() {
                    orgs.push(org.to_string());
                }
            }
            orgs
        },
        geography: string_list(&value["geography"]),
        sectors: string_list(&value["sectors"]),
        stage: value["stage"].as_str().map(str::to_string),
        inclusion: Default::default(),
    }
}
