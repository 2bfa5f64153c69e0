//! # FundFlow Collectors
//!
//! The four sources feeding the ingestion core, all conforming to the
//! [`fundflow::collector::Collector`] contract:
//!
//! - [`RssCollector`]: polls configured RSS/Atom feeds, emitting only
//!   items it has not seen before.
//! - [`WebSearchCollector`]: rotates a configured query set (including
//!   non-English queries for geographic equity) against the search API.
//! - [`UserSubmissionCollector`]: receives records pushed through an
//!   admission endpoint, validating their schema.
//! - [`DeepCrawlCollector`]: consumes fetched pages from the scrape queue
//!   and emits enriched candidates back into the pipeline.
//!
//! Every collector reports an outcome to the source-health registry after
//! each unit of work, and respects the router's suspend hint.

mod deep_crawl;
mod rss;
mod submission;
mod web_search;

pub use deep_crawl::{DeepCrawlCollector, SiteTemplate};
pub use rss::{RssCollector, RssCollectorBuilder};
pub use submission::{Submission, SubmissionHandle, UserSubmissionCollector};
pub use web_search::{SearchQuery, WebSearchCollector, WebSearchCollectorBuilder};
