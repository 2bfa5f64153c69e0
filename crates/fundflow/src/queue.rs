// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! SQLite-backed persistence for the scrape queue, the review queue and the
//! dead-letter sink.
//!
//! ## Safety & Concurrency
//!
//! `rusqlite::Connection` is not `Send`/`Sync`. All SQLite I/O runs on a
//! dedicated blocking worker thread that owns the connection and processes
//! commands serially from an async channel; callers get their results back
//! over oneshot channels. Serial processing is also what makes
//! `claim_next_ready` atomic - no two workers can observe the same ready
//! row.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use url::Url;

use crate::dead_letter::DeadLetterEntry;
use crate::error::{Error, Result};
use crate::record::{CollectorKind, Priority};

/// Status of a persisted scrape request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScrapeStatus {
    /// Waiting for a worker
    Pending,
    /// Claimed by a worker
    Processing,
    /// Fetched successfully
    Completed,
    /// Exhausted its attempts
    Failed,
    /// Backed off, waiting for its next attempt
    Retrying,
}

impl ScrapeStatus {
    /// Stable label used in queue rows and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeStatus::Pending => "pending",
            ScrapeStatus::Processing => "processing",
            ScrapeStatus::Completed => "completed",
            ScrapeStatus::Failed => "failed",
            ScrapeStatus::Retrying => "retrying",
        }
    }

    fn parse(s: &str) -> ScrapeStatus {
        match s {
            "processing" => ScrapeStatus::Processing,
            "completed" => ScrapeStatus::Completed,
            "failed" => ScrapeStatus::Failed,
            "retrying" => ScrapeStatus::Retrying,
            _ => ScrapeStatus::Pending,
        }
    }
}

/// A scrape request before it has been persisted.
#[derive(Debug, Clone)]
pub struct NewScrapeRequest {
    /// Target URL
    pub url: String,
    /// Queue priority
    pub priority: Priority,
    /// Collector that asked for the crawl
    pub collector: CollectorKind,
    /// Content-hash of the candidate awaiting enrichment
    pub candidate_hash: String,
    /// Fields the classifier wants extracted
    pub requested_fields: Vec<String>,
    /// Attempts before the request is marked failed
    pub max_attempts: u32,
}

/// A persisted scrape request as claimed by a worker.
#[derive(Debug, Clone)]
pub struct StoredScrapeRequest {
    /// Row id
    pub id: i64,
    /// Target URL
    pub url: String,
    /// Hostname, for per-domain rate limiting
    pub host: String,
    /// Queue priority
    pub priority: Priority,
    /// Collector that asked for the crawl
    pub collector: CollectorKind,
    /// Content-hash of the candidate awaiting enrichment
    pub candidate_hash: String,
    /// Fields the classifier wants extracted
    pub requested_fields: Vec<String>,
    /// Attempts consumed so far (including the in-flight one)
    pub attempts: u32,
    /// Attempt budget
    pub max_attempts: u32,
    /// Current status
    pub status: ScrapeStatus,
}

/// Result of enqueueing a scrape request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new request row was created
    Created(i64),
    /// An identical URL was already pending/processing; the candidate was
    /// subscribed to the existing request instead
    Subscribed(i64),
}

/// Terminal outcome of a failed attempt.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Rescheduled for another attempt
    Retrying,
    /// Attempts exhausted; these candidates should be released unenriched
    Failed {
        /// Subscribed candidate hashes
        subscribers: Vec<String>,
    },
}

/// A pending review-queue item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    /// Row id
    pub id: i64,
    /// JSON-serialized opportunity awaiting adjudication
    pub payload: serde_json::Value,
    /// Reasons the record was routed to review
    pub reasons: Vec<String>,
}

/// A stored dead-letter row.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterRow {
    /// Row id
    pub id: i64,
    /// The entry
    pub entry: DeadLetterEntry,
}

enum WorkerCommand {
    ScrapeEnqueue {
        req: NewScrapeRequest,
        host: String,
        resp: oneshot::Sender<Result<EnqueueOutcome>>,
    },
    ScrapeClaimNextReady {
        worker_id: String,
        resp: oneshot::Sender<Result<Option<StoredScrapeRequest>>>,
    },
    ScrapeComplete {
        id: i64,
        resp: oneshot::Sender<Result<Vec<String>>>,
    },
    ScrapeRetry {
        id: i64,
        error: String,
        scheduled_at: i64,
        refund_attempt: bool,
        resp: oneshot::Sender<Result<()>>,
    },
    ScrapeFail {
        id: i64,
        error: String,
        resp: oneshot::Sender<Result<Vec<String>>>,
    },
    ScrapeDrain {
        resp: oneshot::Sender<Result<Vec<String>>>,
    },
    ReviewEnqueue {
        payload: serde_json::Value,
        reasons: Vec<String>,
        resp: oneshot::Sender<Result<i64>>,
    },
    ReviewListPending {
        limit: usize,
        resp: oneshot::Sender<Result<Vec<ReviewItem>>>,
    },
    DeadLetterPut {
        entry: Box<DeadLetterEntry>,
        resp: oneshot::Sender<Result<i64>>,
    },
    DeadLetterList {
        limit: usize,
        resp: oneshot::Sender<Result<Vec<DeadLetterRow>>>,
    },
    DeadLetterTake {
        id: i64,
        resp: oneshot::Sender<Result<Option<DeadLetterEntry>>>,
    },
    Close,
}

/// Async handle to the queue database. Cheap to clone.
#[derive(Clone)]
pub struct PersistedQueue {
    tx: mpsc::Sender<WorkerCommand>,
}

impl PersistedQueue {
    /// Open (or create) the queue database. `None` keeps everything in
    /// memory, which loses state on restart.
    pub async fn open(path: Option<PathBuf>) -> Result<Self> {
        let tx = start_worker(path).await?;
        Ok(Self { tx })
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> WorkerCommand,
    ) -> Result<T> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(build(resp_tx))
            .await
            .map_err(|_| Error::Database("queue worker has shut down".to_string()))?;
        resp_rx
            .await
            .map_err(|_| Error::Database("queue worker dropped the response".to_string()))?
    }

    /// Enqueue a scrape request, suppressing duplicate in-flight URLs by
    /// subscribing the candidate to the existing request.
    pub async fn scrape_enqueue(&self, req: NewScrapeRequest) -> Result<EnqueueOutcome> {
        let host = Url::parse(&req.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| Error::SchemaViolation(format!("unparseable scrape URL {}", req.url)))?;
        self.send(|resp| WorkerCommand::ScrapeEnqueue { req, host, resp })
            .await
    }

    /// Atomically claim the highest-priority ready request for `worker_id`.
    pub async fn scrape_claim_next_ready(
        &self,
        worker_id: &str,
    ) -> Result<Option<StoredScrapeRequest>> {
        let worker_id = worker_id.to_string();
        self.send(|resp| WorkerCommand::ScrapeClaimNextReady { worker_id, resp })
            .await
    }

    /// Mark a request completed; returns the subscribed candidate hashes.
    pub async fn scrape_complete(&self, id: i64) -> Result<Vec<String>> {
        self.send(|resp| WorkerCommand::ScrapeComplete { id, resp })
            .await
    }

    /// Reschedule a failed attempt for `scheduled_at` (unix seconds).
    pub async fn scrape_retry(&self, id: i64, error: &str, scheduled_at: i64) -> Result<()> {
        let error = error.to_string();
        self.send(|resp| WorkerCommand::ScrapeRetry {
            id,
            error,
            scheduled_at,
            refund_attempt: false,
            resp,
        })
        .await
    }

    /// Reschedule without consuming an attempt (used when a claim is
    /// deferred by a per-domain rate limit rather than a fetch failure).
    pub async fn scrape_defer(&self, id: i64, reason: &str, scheduled_at: i64) -> Result<()> {
        let error = reason.to_string();
        self.send(|resp| WorkerCommand::ScrapeRetry {
            id,
            error,
            scheduled_at,
            refund_attempt: true,
            resp,
        })
        .await
    }

    /// Mark a request failed for good; returns the subscribed candidate
    /// hashes so their parks can be released unenriched.
    pub async fn scrape_fail(&self, id: i64, error: &str) -> Result<Vec<String>> {
        let error = error.to_string();
        self.send(|resp| WorkerCommand::ScrapeFail { id, error, resp })
            .await
    }

    /// Fail every pending/retrying request (operator drain); returns all
    /// released candidate hashes.
    pub async fn scrape_drain(&self) -> Result<Vec<String>> {
        self.send(|resp| WorkerCommand::ScrapeDrain { resp }).await
    }

    /// Append an opportunity to the review queue.
    pub async fn review_enqueue(
        &self,
        payload: serde_json::Value,
        reasons: Vec<String>,
    ) -> Result<i64> {
        self.send(|resp| WorkerCommand::ReviewEnqueue {
            payload,
            reasons,
            resp,
        })
        .await
    }

    /// List pending review items (consumed externally by the adjudication
    /// frontend).
    pub async fn review_list_pending(&self, limit: usize) -> Result<Vec<ReviewItem>> {
        self.send(|resp| WorkerCommand::ReviewListPending { limit, resp })
            .await
    }

    /// Store a dead-letter entry.
    pub async fn dead_letter_put(&self, entry: DeadLetterEntry) -> Result<i64> {
        self.send(|resp| WorkerCommand::DeadLetterPut {
            entry: Box::new(entry),
            resp,
        })
        .await
    }

    /// List dead-letter rows, newest first.
    pub async fn dead_letter_list(&self, limit: usize) -> Result<Vec<DeadLetterRow>> {
        self.send(|resp| WorkerCommand::DeadLetterList { limit, resp })
            .await
    }

    /// Remove a dead-letter row for reprocessing, returning its entry.
    pub async fn dead_letter_take(&self, id: i64) -> Result<Option<DeadLetterEntry>> {
        self.send(|resp| WorkerCommand::DeadLetterTake { id, resp })
            .await
    }

    /// Ask the worker to close its connection. Pending commands already in
    /// the channel are processed first.
    pub async fn close(&self) {
        let _ = self.tx.send(WorkerCommand::Close).await;
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scrape_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    host TEXT NOT NULL,
    priority INTEGER NOT NULL,
    collector TEXT NOT NULL,
    candidate_hash TEXT NOT NULL,
    requested_fields TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    scheduled_at INTEGER NOT NULL,
    worker_id TEXT,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scrape_ready
ON scrape_queue(status, scheduled_at, priority);

CREATE INDEX IF NOT EXISTS idx_scrape_url
ON scrape_queue(url, status);

CREATE TABLE IF NOT EXISTS scrape_subscribers (
    request_id INTEGER NOT NULL,
    candidate_hash TEXT NOT NULL,
    UNIQUE(request_id, candidate_hash)
);

CREATE TABLE IF NOT EXISTS review_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    reasons TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letter (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    candidate_hash TEXT NOT NULL,
    stage TEXT NOT NULL,
    error TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    entry TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
"#;

fn db_err(e: impl std::fmt::Display) -> Error {
    Error::Database(e.to_string())
}

/// Start the blocking worker thread that owns the SQLite connection.
async fn start_worker(path: Option<PathBuf>) -> Result<mpsc::Sender<WorkerCommand>> {
    let (tx, mut rx) = mpsc::channel::<WorkerCommand>(128);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

    tokio::task::spawn_blocking(move || {
        let open_result: Result<rusqlite::Connection> = match path {
            Some(ref p) => rusqlite::Connection::open(p)
                .map_err(db_err)
                .and_then(|conn| {
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
                        .map_err(db_err)?;
                    Ok(conn)
                }),
            None => {
                warn!(
                    "queue database using in-memory storage - scrape/review state \
                     WILL BE LOST on restart; set a path to enable persistence"
                );
                rusqlite::Connection::open_in_memory().map_err(db_err)
            }
        };

        let conn = match open_result.and_then(|conn| {
            conn.execute_batch(SCHEMA).map_err(db_err)?;
            Ok(conn)
        }) {
            Ok(conn) => {
                let _ = ready_tx.send(Ok(()));
                conn
            }
            Err(e) => {
                let msg = e.to_string();
                if ready_tx.send(Err(e)).is_err() {
                    warn!(error = %msg, "queue database initialization error lost (receiver dropped)");
                }
                return;
            }
        };

        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                WorkerCommand::ScrapeEnqueue { req, host, resp } => {
                    let _ = resp.send(scrape_enqueue(&conn, &req, &host));
                }
                WorkerCommand::ScrapeClaimNextReady { worker_id, resp } => {
                    let _ = resp.send(scrape_claim_next_ready(&conn, &worker_id));
                }
                WorkerCommand::ScrapeComplete { id, resp } => {
                    let _ = resp.send(scrape_finish(&conn, id, ScrapeStatus::Completed, None));
                }
                WorkerCommand::ScrapeRetry {
                    id,
                    error,
                    scheduled_at,
                    refund_attempt,
                    resp,
                } => {
                    let _ = resp.send(scrape_retry(&conn, id, &error, scheduled_at, refund_attempt));
                }
                WorkerCommand::ScrapeFail { id, error, resp } => {
                    let _ = resp.send(scrape_finish(
                        &conn,
                        id,
                        ScrapeStatus::Failed,
                        Some(&error),
                    ));
                }
                WorkerCommand::ScrapeDrain { resp } => {
                    let _ = resp.send(scrape_drain(&conn));
                }
                WorkerCommand::ReviewEnqueue {
                    payload,
                    reasons,
                    resp,
                } => {
                    let _ = resp.send(review_enqueue(&conn, &payload, &reasons));
                }
                WorkerCommand::ReviewListPending { limit, resp } => {
                    let _ = resp.send(review_list_pending(&conn, limit));
                }
                WorkerCommand::DeadLetterPut { entry, resp } => {
                    let _ = resp.send(dead_letter_put(&conn, &entry));
                }
                WorkerCommand::DeadLetterList { limit, resp } => {
                    let _ = resp.send(dead_letter_list(&conn, limit));
                }
                WorkerCommand::DeadLetterTake { id, resp } => {
                    let _ = resp.send(dead_letter_take(&conn, id));
                }
                WorkerCommand::Close => break,
            }
        }
    });

    ready_rx
        .await
        .map_err(|_| Error::Database("queue worker exited before reporting ready".to_string()))??;
    Ok(tx)
}

fn scrape_enqueue(
    conn: &rusqlite::Connection,
    req: &NewScrapeRequest,
    host: &str,
) -> Result<EnqueueOutcome> {
    let now = Utc::now().timestamp();

    // Duplicate URL suppression: subscribe to an identical pending or
    // processing request instead of duplicating work.
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM scrape_queue
             WHERE url = ?1 AND status IN ('pending', 'processing', 'retrying')
             ORDER BY id LIMIT 1",
            rusqlite::params![req.url],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(db_err(other)),
        })?;

    if let Some(id) = existing {
        conn.execute(
            "INSERT OR IGNORE INTO scrape_subscribers (request_id, candidate_hash) VALUES (?1, ?2)",
            rusqlite::params![id, req.candidate_hash],
        )
        .map_err(db_err)?;
        return Ok(EnqueueOutcome::Subscribed(id));
    }

    let fields = serde_json::to_string(&req.requested_fields)
        .map_err(|e| Error::SchemaViolation(e.to_string()))?;
    conn.execute(
        "INSERT INTO scrape_queue
         (url, host, priority, collector, candidate_hash, requested_fields,
          attempts, max_attempts, status, scheduled_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, 'pending', ?8, ?8, ?8)",
        rusqlite::params![
            req.url,
            host,
            req.priority.rank(),
            req.collector.as_str(),
            req.candidate_hash,
            fields,
            req.max_attempts,
            now,
        ],
    )
    .map_err(db_err)?;
    let id = conn.last_insert_rowid();
    conn.execute(
        "INSERT OR IGNORE INTO scrape_subscribers (request_id, candidate_hash) VALUES (?1, ?2)",
        rusqlite::params![id, req.candidate_hash],
    )
    .map_err(db_err)?;
    Ok(EnqueueOutcome::Created(id))
}

fn scrape_claim_next_ready(
    conn: &rusqlite::Connection,
    worker_id: &str,
) -> Result<Option<StoredScrapeRequest>> {
    let now = Utc::now().timestamp();
    let row = conn
        .query_row(
            "SELECT id, url, host, priority, collector, candidate_hash,
                    requested_fields, attempts, max_attempts
             FROM scrape_queue
             WHERE status IN ('pending', 'retrying') AND scheduled_at <= ?1
             ORDER BY priority DESC, id ASC
             LIMIT 1",
            rusqlite::params![now],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, u32>(7)?,
                    row.get::<_, u32>(8)?,
                ))
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(db_err(other)),
        })?;

    let Some((id, url, host, priority, collector, candidate_hash, fields, attempts, max_attempts)) =
        row
    else {
        return Ok(None);
    };

    conn.execute(
        "UPDATE scrape_queue
         SET status = 'processing', worker_id = ?1, attempts = attempts + 1, updated_at = ?2
         WHERE id = ?3",
        rusqlite::params![worker_id, now, id],
    )
    .map_err(db_err)?;

    let priority = match priority {
        2 => Priority::High,
        1 => Priority::Normal,
        _ => Priority::Low,
    };
    let collector = collector
        .parse::<CollectorKind>()
        .unwrap_or(CollectorKind::DeepCrawl);
    let requested_fields: Vec<String> = serde_json::from_str(&fields).unwrap_or_default();

    Ok(Some(StoredScrapeRequest {
        id,
        url,
        host,
        priority,
        collector,
        candidate_hash,
        requested_fields,
        attempts: attempts + 1,
        max_attempts,
        status: ScrapeStatus::Processing,
    }))
}

fn scrape_subscribers(conn: &rusqlite::Connection, id: i64) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT candidate_hash FROM scrape_subscribers WHERE request_id = ?1")
        .map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params![id], |row| row.get::<_, String>(0))
        .map_err(db_err)?;
    let mut subscribers = Vec::new();
    for row in rows {
        subscribers.push(row.map_err(db_err)?);
    }
    Ok(subscribers)
}

fn scrape_finish(
    conn: &rusqlite::Connection,
    id: i64,
    status: ScrapeStatus,
    error: Option<&str>,
) -> Result<Vec<String>> {
    let now = Utc::now().timestamp();
    conn.execute(
        "UPDATE scrape_queue
         SET status = ?1, error = ?2, worker_id = NULL, updated_at = ?3
         WHERE id = ?4",
        rusqlite::params![status.as_str(), error, now, id],
    )
    .map_err(db_err)?;
    scrape_subscribers(conn, id)
}

fn scrape_retry(
    conn: &rusqlite::Connection,
    id: i64,
    error: &str,
    scheduled_at: i64,
    refund_attempt: bool,
) -> Result<()> {
    let now = Utc::now().timestamp();
    conn.execute(
        "UPDATE scrape_queue
         SET status = 'retrying', error = ?1, worker_id = NULL,
             attempts = MAX(attempts - ?2, 0),
             scheduled_at = ?3, updated_at = ?4
         WHERE id = ?5",
        rusqlite::params![error, i64::from(refund_attempt), scheduled_at, now, id],
    )
    .map_err(db_err)?;
    Ok(())
}

fn scrape_drain(conn: &rusqlite::Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT s.candidate_hash
             FROM scrape_subscribers s
             JOIN scrape_queue q ON q.id = s.request_id
             WHERE q.status IN ('pending', 'retrying')",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(db_err)?;
    let mut released = Vec::new();
    for row in rows {
        released.push(row.map_err(db_err)?);
    }

    let now = Utc::now().timestamp();
    conn.execute(
        "UPDATE scrape_queue
         SET status = 'failed', error = 'drained by operator', updated_at = ?1
         WHERE status IN ('pending', 'retrying')",
        rusqlite::params![now],
    )
    .map_err(db_err)?;
    Ok(released)
}

fn review_enqueue(
    conn: &rusqlite::Connection,
    payload: &serde_json::Value,
    reasons: &[String],
) -> Result<i64> {
    let now = Utc::now().timestamp();
    let reasons_json =
        serde_json::to_string(reasons).map_err(|e| Error::SchemaViolation(e.to_string()))?;
    conn.execute(
        "INSERT INTO review_queue (payload, reasons, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![payload.to_string(), reasons_json, now],
    )
    .map_err(db_err)?;
    Ok(conn.last_insert_rowid())
}

fn review_list_pending(conn: &rusqlite::Connection, limit: usize) -> Result<Vec<ReviewItem>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, payload, reasons FROM review_queue
             WHERE status = 'pending' ORDER BY id LIMIT ?1",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(db_err)?;
    let mut items = Vec::new();
    for row in rows {
        let (id, payload, reasons) = row.map_err(db_err)?;
        items.push(ReviewItem {
            id,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            reasons: serde_json::from_str(&reasons).unwrap_or_default(),
        });
    }
    Ok(items)
}

fn dead_letter_put(conn: &rusqlite::Connection, entry: &DeadLetterEntry) -> Result<i64> {
    let json = serde_json::to_string(entry).map_err(|e| Error::SchemaViolation(e.to_string()))?;
    conn.execute(
        "INSERT INTO dead_letter
         (candidate_hash, stage, error, error_kind, entry, trace_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            entry.candidate_hash,
            entry.stage,
            entry.error,
            entry.error_kind,
            json,
            entry.trace_id,
            entry.created_at.timestamp(),
        ],
    )
    .map_err(db_err)?;
    Ok(conn.last_insert_rowid())
}

fn dead_letter_list(conn: &rusqlite::Connection, limit: usize) -> Result<Vec<DeadLetterRow>> {
    let mut stmt = conn
        .prepare("SELECT id, entry FROM dead_letter ORDER BY id DESC LIMIT ?1")
        .map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params![limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(db_err)?;
    let mut items = Vec::new();
    for row in rows {
        let (id, json) = row.map_err(db_err)?;
        if let Ok(entry) = serde_json::from_str(&json) {
            items.push(DeadLetterRow { id, entry });
        }
    }
    Ok(items)
}

fn dead_letter_take(conn: &rusqlite::Connection, id: i64) -> Result<Option<DeadLetterEntry>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT entry FROM dead_letter WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(db_err(other)),
        })?;
    let Some(json) = json else {
        return Ok(None);
    };
    conn.execute(
        "DELETE FROM dead_letter WHERE id = ?1",
        rusqlite::params![id],
    )
    .map_err(db_err)?;
    let entry = serde_json::from_str(&json).map_err(|e| Error::Database(e.to_string()))?;
    Ok(Some(entry))
}
