// ABOUTME: Pagination driver - walks @odata.nextLink pages for one resource kind
// ABOUTME: Appends each page, advances the cursor, then paces before the next request

use std::time::Instant;

use tokio::sync::watch;

use crate::cursor::CursorStore;
use crate::error::{ReplicationError, Result};
use crate::fetch::{FetchResponse, Fetcher, Page};
use crate::pacing::Pacer;
use crate::resource::ResourceKind;
use crate::sink::RecordSink;

/// Response bodies quoted in errors are cut to this many bytes.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Total attempts per page before a transient failure aborts the run
    pub max_attempts: u32,
    /// Stop after this many pages. `None` follows links until exhausted.
    pub max_iterations: Option<u32>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_iterations: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The last page carried no continuation link.
    Exhausted,
    /// The configured page cap was reached.
    IterationCap,
    /// Shutdown was requested between pages.
    Cancelled,
}

/// Outcome of one replication pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub resource: ResourceKind,
    pub pages: u32,
    pub records: u64,
    /// HTTP requests issued, retries included
    pub requests: u32,
    pub final_cursor: Option<String>,
    pub stop_reason: StopReason,
    pub duration_ms: u64,
}

impl RunStats {
    fn new(resource: ResourceKind) -> Self {
        Self {
            resource,
            pages: 0,
            records: 0,
            requests: 0,
            final_cursor: None,
            stop_reason: StopReason::Exhausted,
            duration_ms: 0,
        }
    }
}

/// Drives one resource kind through its pages, strictly in order.
///
/// Page N+1 is only requested after page N was appended to the sink and the
/// cursor was saved, so a crash never leaves the cursor ahead of stored data.
pub struct PaginationDriver<'a> {
    fetcher: &'a dyn Fetcher,
    sink: &'a dyn RecordSink,
    cursors: &'a dyn CursorStore,
    pacer: Pacer,
    config: DriverConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<'a> PaginationDriver<'a> {
    pub fn new(
        fetcher: &'a dyn Fetcher,
        sink: &'a dyn RecordSink,
        cursors: &'a dyn CursorStore,
        pacer: Pacer,
        config: DriverConfig,
    ) -> Self {
        Self {
            fetcher,
            sink,
            cursors,
            pacer,
            config,
            shutdown: None,
        }
    }

    /// Check `shutdown` between pages and stop cleanly once it reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub async fn run(
        &mut self,
        resource: ResourceKind,
        initial_url: &str,
        auth_header: &str,
    ) -> Result<RunStats> {
        let start = Instant::now();
        let mut stats = RunStats::new(resource);
        let mut next = Some(initial_url.to_string());

        tracing::info!("Replicating {} starting at {}", resource, initial_url);

        while let Some(url) = next.take() {
            if let Some(cap) = self.config.max_iterations {
                if stats.pages >= cap {
                    tracing::info!(
                        "Stopping {} after {} pages (iteration cap)",
                        resource,
                        stats.pages
                    );
                    stats.stop_reason = StopReason::IterationCap;
                    break;
                }
            }

            if self.shutdown_requested() {
                tracing::info!("Shutdown requested, stopping {} between pages", resource);
                stats.stop_reason = StopReason::Cancelled;
                break;
            }

            tracing::debug!("{}: Fetching page {}", resource, stats.pages + 1);
            let page = self.fetch_page(&url, auth_header, &mut stats).await?;
            stats.pages += 1;

            if page.value.is_empty() {
                tracing::debug!(
                    "{}: page {} is empty, nothing to append",
                    resource,
                    stats.pages
                );
            } else {
                let count = page.value.len();
                tracing::debug!("{}: Appending {} records", resource, count);
                let max_timestamp = self
                    .sink
                    .append(resource, &page.value)
                    .await
                    .map_err(|e| match e {
                        // Report the page, not just the resource
                        ReplicationError::MalformedResponse { message, .. } => {
                            ReplicationError::MalformedResponse {
                                url: url.clone(),
                                message,
                            }
                        }
                        other => other,
                    })?;

                tracing::debug!("{}: Advancing cursor to {}", resource, max_timestamp);
                self.cursors.save(resource, &max_timestamp).await?;

                stats.records += count as u64;
                tracing::info!(
                    "{}: wrote {} records (page {}), cursor now {}",
                    resource,
                    count,
                    stats.pages,
                    max_timestamp
                );
                stats.final_cursor = Some(max_timestamp);
            }

            next = page.next_link;
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "{}: done ({:?}) - {} records in {} pages, {} requests, {}ms",
            resource,
            stats.stop_reason,
            stats.records,
            stats.pages,
            stats.requests,
            stats.duration_ms
        );
        Ok(stats)
    }

    /// Fetch and parse one page, retrying transient failures through the pacer.
    async fn fetch_page(
        &mut self,
        url: &str,
        auth_header: &str,
        stats: &mut RunStats,
    ) -> Result<Page> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            self.pacer.wait().await;
            stats.requests += 1;

            match self.fetcher.get(url, auth_header).await {
                Ok(response) if response.is_success() => {
                    return Page::parse(url, &response.body);
                }
                Ok(response) if response.is_transient() => {
                    last_error = format!(
                        "HTTP {}: {}",
                        response.status,
                        truncate(&response.body, MAX_ERROR_BODY)
                    );
                }
                Ok(FetchResponse { status, body }) => {
                    if status == 401 || status == 403 {
                        tracing::error!(
                            "API token was rejected (HTTP {}); check MLSGRID_API_TOKEN",
                            status
                        );
                    }
                    return Err(ReplicationError::UpstreamRejected {
                        url: url.to_string(),
                        status,
                        body: truncate(&body, MAX_ERROR_BODY).to_string(),
                    });
                }
                Err(e) => {
                    last_error = if e.timed_out {
                        format!("timeout: {}", e)
                    } else {
                        e.to_string()
                    };
                }
            }

            if attempt < max_attempts {
                tracing::warn!(
                    "Fetch failed (attempt {}/{}): {}, retrying after {:?}",
                    attempt,
                    max_attempts,
                    last_error,
                    self.pacer.interval()
                );
            }
        }

        Err(ReplicationError::TransientFetch {
            url: url.to_string(),
            attempts: max_attempts,
            message: last_error,
        })
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

fn truncate(body: &str, max: usize) -> &str {
    if body.len() <= max {
        return body;
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
