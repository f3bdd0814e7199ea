//! Paginated catalog harvesting.
//!
//! Pages are fetched strictly in order starting at 1. Each page runs its own
//! retry loop (see [`backoff`]); a page that never succeeds ends the harvest
//! instead of being skipped, since a gap would silently shift pagination.

pub mod backoff;
pub mod filters;
pub mod session;

use serde::Serialize;

use crate::config::HarvestConfig;
use crate::listings::RawListing;
use backoff::{classify, random_delay, PageOutcome, RetryPolicy, RetryReason, RetryState, Sleeper};
pub use filters::{HarvestFilters, IdList};
use session::{CatalogSession, SessionError, SessionProvider};

#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("could not open a session: {0}")]
    Session(#[from] SessionError),

    #[error("invalid harvest request: {0}")]
    InvalidRequest(String),
}

/// Bounds for one harvest run.
#[derive(Debug, Clone)]
pub struct HarvestRequest {
    pub filters: HarvestFilters,
    pub max_pages: u32,
    pub per_page: u32,
    pub max_retries: u32,
    /// Seconds to pause between successful pages
    pub pause_range: (f64, f64),
}

impl HarvestRequest {
    pub fn from_config(filters: HarvestFilters, config: &HarvestConfig) -> Self {
        Self {
            filters,
            max_pages: config.max_pages,
            per_page: config.per_page,
            max_retries: config.max_retries,
            pause_range: config.pause_range,
        }
    }
}

/// Why the harvest ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// A page came back shorter than `per_page`
    EndOfResults,
    /// `max_pages` pages were fetched
    PageLimit,
    /// 401: public access blocked, nothing will recover it automatically
    AccessDenied { page: u32 },
    /// A page used up its retry budget
    RetriesExhausted { page: u32, last_error: String },
}

#[derive(Debug)]
pub struct HarvestReport {
    pub items: Vec<RawListing>,
    pub pages_fetched: u32,
    pub sessions_created: u32,
    pub stop: StopReason,
}

impl HarvestReport {
    /// True when the run stopped for a reason the caller should look at.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self.stop,
            StopReason::AccessDenied { .. } | StopReason::RetriesExhausted { .. }
        )
    }
}

/// Page position and counters, owned by one harvest call.
#[derive(Debug, Default)]
struct HarvestCursor {
    page: u32,
    collected: usize,
}

enum PageResult {
    /// Items accepted; `last` when the page was short
    Accepted { items: Vec<RawListing>, last: bool },
    Abort,
    Exhausted(String),
}

pub struct Harvester<'a> {
    sessions: &'a dyn SessionProvider,
    sleeper: &'a dyn Sleeper,
    clock: fn() -> i64,
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl<'a> Harvester<'a> {
    pub fn new(sessions: &'a dyn SessionProvider, sleeper: &'a dyn Sleeper) -> Self {
        Self {
            sessions,
            sleeper,
            clock: unix_now,
        }
    }

    /// Fetch every page the request allows, returning all accepted items.
    ///
    /// Only session creation at the very start is an error; everything that
    /// goes wrong afterwards ends the run early with the items gathered so far
    /// and a [`StopReason`] describing why.
    pub fn fetch(&self, request: &HarvestRequest) -> Result<HarvestReport, HarvestError> {
        if request.max_pages == 0 || request.per_page == 0 || request.max_retries == 0 {
            return Err(HarvestError::InvalidRequest(
                "max_pages, per_page and max_retries must all be positive".to_string(),
            ));
        }

        let policy = RetryPolicy::new(request.max_retries);
        let mut session = self.sessions.create_session()?;
        let mut sessions_created = 1;
        let mut items: Vec<RawListing> = Vec::new();
        let mut cursor = HarvestCursor::default();

        let stop = loop {
            cursor.page += 1;

            let result = self.fetch_page(
                request,
                &policy,
                cursor.page,
                &mut session,
                &mut sessions_created,
            );

            match result {
                PageResult::Accepted { items: page_items, last } => {
                    log::info!(
                        "Page {}: fetched {} items (total so far {})",
                        cursor.page,
                        page_items.len(),
                        cursor.collected
                    );
                    cursor.collected += page_items.len();
                    items.extend(page_items);

                    if last {
                        log::info!("No more pages (fewer results than per_page). Stopping.");
                        break StopReason::EndOfResults;
                    }
                    if cursor.page >= request.max_pages {
                        break StopReason::PageLimit;
                    }

                    let pause = random_delay(request.pause_range);
                    log::debug!("Sleeping {:.2}s", pause.as_secs_f64());
                    self.sleeper.sleep(pause);
                }
                PageResult::Abort => {
                    log::error!(
                        "401 Unauthorized on page {}. Public access blocked; consider adding authenticated cookies.",
                        cursor.page
                    );
                    break StopReason::AccessDenied { page: cursor.page };
                }
                PageResult::Exhausted(last_error) => {
                    log::error!(
                        "Failed to fetch page {} after {} attempts ({last_error}). Stopping.",
                        cursor.page,
                        request.max_retries
                    );
                    break StopReason::RetriesExhausted {
                        page: cursor.page,
                        last_error,
                    };
                }
            }
        };

        let pages_fetched = match stop {
            StopReason::EndOfResults | StopReason::PageLimit => cursor.page,
            _ => cursor.page - 1,
        };

        Ok(HarvestReport {
            items,
            pages_fetched,
            sessions_created,
            stop,
        })
    }

    fn fetch_page(
        &self,
        request: &HarvestRequest,
        policy: &RetryPolicy,
        page: u32,
        session: &mut Box<dyn CatalogSession>,
        sessions_created: &mut u32,
    ) -> PageResult {
        let params = request
            .filters
            .to_query(page, request.per_page, (self.clock)());
        let mut retry = RetryState::new(policy);
        let mut last_error = String::new();

        while retry.begin_attempt() {
            let outcome = match session.get_page(&params) {
                Ok(response) => classify(&response),
                Err(err) => PageOutcome::Retry(RetryReason::Transport(err.to_string())),
            };

            let reason = match outcome {
                PageOutcome::Accepted(items) => {
                    let last = items.len() < request.per_page as usize;
                    return PageResult::Accepted { items, last };
                }
                PageOutcome::Abort => return PageResult::Abort,
                PageOutcome::Retry(reason) => reason,
            };

            log::warn!(
                "{reason} on page {page} (attempt {}/{})",
                retry.attempt(),
                retry.max_attempts()
            );

            if reason.needs_new_session() {
                match self.sessions.create_session() {
                    Ok(fresh) => {
                        if !fresh.has_token() {
                            log::debug!("replacement session has no anti-bot token");
                        }
                        *session = fresh;
                        *sessions_created += 1;
                    }
                    Err(err) => log::error!("Could not refresh session: {err}"),
                }
            }

            last_error = reason.to_string();

            // no point waiting when there is no attempt left
            if retry.attempt() < retry.max_attempts() {
                self.sleeper.sleep(retry.backoff_for(&reason));
            }
        }

        PageResult::Exhausted(last_error)
    }
}

#[cfg(test)]
impl<'a> Harvester<'a> {
    pub(crate) fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }
}
