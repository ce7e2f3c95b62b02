//! Browser-driven search walking + JSON detail retrieval for the Monster job board.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::Page;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use jlh_core::{JobRecord, LocationKey};
use jlh_storage::{FetchError, JsonSource, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "jlh-adapters";

pub const SEARCH_BASE_URL: &str = "https://www.monster.com/jobs/search/";
pub const DETAILS_BASE_URL: &str = "https://job-openings.monster.com/v2/job/pure-json-view";

/// Result cards in display order. `apas-ad` marks sponsored placements.
pub const RESULT_CARD_SELECTOR: &str = "#SearchResults > .card-content:not(.apas-ad)";
pub const LOAD_MORE_SELECTOR: &str = "#loadMoreJobs";
pub const LISTING_ID_ATTRIBUTE: &str = "data-jobid";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no element matching `{selector}` within {timeout:?}")]
    ElementNotFound { selector: String, timeout: Duration },
    #[error("browser error: {0}")]
    Browser(String),
    #[error("giving up on listing {listing_id} after {attempts} attempts: {last_error}")]
    RetrievalExhausted {
        listing_id: String,
        attempts: usize,
        last_error: String,
    },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

fn browser_error(err: impl std::fmt::Display) -> AdapterError {
    AdapterError::Browser(err.to_string())
}

/// The subset of browser automation the scraper relies on. Selectors are CSS.
#[async_trait]
pub trait BrowserSession: Send {
    type Element: Send + Sync;

    async fn navigate(&mut self, url: &str) -> Result<(), AdapterError>;

    /// All elements currently matching `selector`; empty when nothing matches.
    async fn find_all(&mut self, selector: &str) -> Result<Vec<Self::Element>, AdapterError>;

    async fn click_via_script(&mut self, element: &Self::Element) -> Result<(), AdapterError>;

    async fn read_attribute(
        &mut self,
        element: &Self::Element,
        name: &str,
    ) -> Result<Option<String>, AdapterError>;

    async fn close(self) -> Result<(), AdapterError>;

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(250)
    }

    /// Poll until the first element matching `selector` shows up.
    async fn wait_until_present(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Self::Element, AdapterError> {
        // `None` when the timeout is too large to represent: wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(element) = self.find_all(selector).await?.into_iter().next() {
                return Ok(element);
            }
            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(AdapterError::ElementNotFound {
                        selector: selector.to_string(),
                        timeout,
                    });
                }
                Some(deadline) => self.poll_interval().min(deadline - now),
                None => self.poll_interval(),
            };
            tokio::time::sleep(pause).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChromiumConfig {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// One browser process with a single tab. The CDP handler task and the
/// browser process are torn down by [`BrowserSession::close`] or, failing
/// that, on drop.
pub struct ChromiumSession {
    browser: Option<Browser>,
    page: Page,
    handler: JoinHandle<()>,
}

impl ChromiumSession {
    pub async fn launch(config: &ChromiumConfig) -> Result<Self, AdapterError> {
        let mut builder = BrowserConfig::builder().request_timeout(config.request_timeout);
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = &config.executable {
            builder = builder.chrome_executable(executable);
        }
        let browser_config = builder.build().map_err(AdapterError::Browser)?;

        let (browser, mut events) = Browser::launch(browser_config)
            .await
            .map_err(browser_error)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "cdp handler stopped");
                    break;
                }
            }
        });

        match browser.new_page("about:blank").await {
            Ok(page) => {
                info!(headless = config.headless, "browser session started");
                Ok(Self {
                    browser: Some(browser),
                    page,
                    handler,
                })
            }
            Err(err) => {
                handler.abort();
                Err(browser_error(err))
            }
        }
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    type Element = Element;

    async fn navigate(&mut self, url: &str) -> Result<(), AdapterError> {
        self.page.goto(url).await.map_err(browser_error)?;
        Ok(())
    }

    async fn find_all(&mut self, selector: &str) -> Result<Vec<Self::Element>, AdapterError> {
        self.page.find_elements(selector).await.map_err(browser_error)
    }

    async fn click_via_script(&mut self, element: &Self::Element) -> Result<(), AdapterError> {
        element
            .call_js_fn("function() { this.click(); }", false)
            .await
            .map_err(browser_error)?;
        Ok(())
    }

    async fn read_attribute(
        &mut self,
        element: &Self::Element,
        name: &str,
    ) -> Result<Option<String>, AdapterError> {
        element.attribute(name).await.map_err(browser_error)
    }

    async fn close(mut self) -> Result<(), AdapterError> {
        info!("closing browser session");
        if let Some(mut browser) = self.browser.take() {
            browser.close().await.map_err(browser_error)?;
            browser.wait().await.map_err(browser_error)?;
        }
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if self.browser.take().is_some() {
            warn!("browser session dropped without close");
        }
        self.handler.abort();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WalkerConfig {
    pub wait_timeout: Duration,
    /// Consecutive failed load-more attempts that end pagination.
    pub max_load_failures: usize,
    /// Value of the `tm` search parameter.
    pub recency_days: u32,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(5),
            max_load_failures: 3,
            recency_days: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkOutcome {
    pub search_url: String,
    pub listing_ids: Vec<String>,
    /// Initial page plus every successful load-more.
    pub pages: usize,
    pub load_failures: usize,
}

pub fn build_search_url(term: &str, location: &str, recency_days: u32) -> Result<String, AdapterError> {
    let tm = recency_days.to_string();
    let url = Url::parse_with_params(
        SEARCH_BASE_URL,
        &[("where", location), ("q", term), ("tm", tm.as_str())],
    )?;
    Ok(url.to_string())
}

pub struct PageWalker<B> {
    session: B,
    config: WalkerConfig,
}

impl<B: BrowserSession> PageWalker<B> {
    pub fn new(session: B, config: WalkerConfig) -> Self {
        Self { session, config }
    }

    pub fn session(&self) -> &B {
        &self.session
    }

    pub fn into_session(self) -> B {
        self.session
    }

    pub async fn walk(&mut self, term: &str, location: &str) -> Result<WalkOutcome, AdapterError> {
        let search_url = build_search_url(term, location, self.config.recency_days)?;
        info!(url = %search_url, "loading search results");
        self.session.navigate(&search_url).await?;
        self.session
            .wait_until_present(RESULT_CARD_SELECTOR, self.config.wait_timeout)
            .await?;

        let (pages, load_failures) = self.load_all_pages().await;

        let cards = self.session.find_all(RESULT_CARD_SELECTOR).await?;
        info!(cards = cards.len(), pages, "collecting listing ids");
        let mut listing_ids = Vec::with_capacity(cards.len());
        for (index, card) in cards.iter().enumerate() {
            match self.session.read_attribute(card, LISTING_ID_ATTRIBUTE).await? {
                Some(id) if !id.trim().is_empty() => listing_ids.push(id.trim().to_string()),
                _ => warn!(index, "result card without {LISTING_ID_ATTRIBUTE}, skipping"),
            }
        }

        Ok(WalkOutcome {
            search_url,
            listing_ids,
            pages,
            load_failures,
        })
    }

    async fn load_all_pages(&mut self) -> (usize, usize) {
        let max_failures = self.config.max_load_failures;
        let mut pages = 1;
        let mut failures = 0;
        while failures < max_failures {
            debug!(try_no = failures + 1, max_failures, page = pages, "loading more results");
            match self.load_more().await {
                Ok(()) => {
                    failures = 0;
                    pages += 1;
                }
                Err(err) => {
                    failures += 1;
                    debug!(error = %err, failures, "load more failed");
                }
            }
        }
        (pages, failures)
    }

    async fn load_more(&mut self) -> Result<(), AdapterError> {
        let button = self
            .session
            .wait_until_present(LOAD_MORE_SELECTOR, self.config.wait_timeout)
            .await?;
        self.session.click_via_script(&button).await
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonsterCompanyInfo {
    pub name: String,
    pub company_header: String,
}

/// Shape of the `pure-json-view` detail payload; unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonsterDetail {
    pub company_info: MonsterCompanyInfo,
    pub job_description: String,
    #[serde(default)]
    pub is_custom_apply_online_job: bool,
    #[serde(default)]
    pub custom_apply_url: Option<String>,
    #[serde(default)]
    pub submit_button_url: Option<String>,
    #[serde(default)]
    pub job_location_country: Option<String>,
    #[serde(default)]
    pub job_location_region: Option<String>,
    #[serde(default)]
    pub job_location_city: Option<String>,
}

impl MonsterDetail {
    pub fn into_record(self, fetched_at: DateTime<Utc>) -> JobRecord {
        let title = strip_company_suffix(&self.company_info.company_header, &self.company_info.name);
        let apply_url = if self.is_custom_apply_online_job {
            self.custom_apply_url
        } else {
            self.submit_button_url
        };
        JobRecord {
            title,
            description: self.job_description,
            company_name: self.company_info.name,
            apply_url,
            location: LocationKey {
                city: title_case(self.job_location_city.as_deref().unwrap_or_default()),
                state_province: title_case(self.job_location_region.as_deref().unwrap_or_default()),
                country: self.job_location_country.unwrap_or_default(),
            },
            posted_at: fetched_at,
        }
    }
}

/// `"Data Analyst at Acme"` -> `"Data Analyst"` for company `Acme`.
pub fn strip_company_suffix(header: &str, company: &str) -> String {
    header.replace(&format!(" at {company}"), "").trim().to_string()
}

/// Uppercase the first letter of every run of letters, lowercase the rest.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut inside_word = false;
    for ch in input.chars() {
        if ch.is_alphabetic() {
            if inside_word {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            inside_word = true;
        } else {
            out.push(ch);
            inside_word = false;
        }
    }
    out
}

pub fn build_details_url(listing_id: &str) -> Result<String, AdapterError> {
    let url = Url::parse_with_params(DETAILS_BASE_URL, &[("jobid", listing_id)])?;
    Ok(url.to_string())
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected detail payload: {0}")]
    Shape(#[from] serde_json::Error),
}

pub struct DetailFetcher<J> {
    source: J,
    retry: RetryPolicy,
}

impl<J: JsonSource> DetailFetcher<J> {
    pub fn new(source: J, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    pub fn source(&self) -> &J {
        &self.source
    }

    pub async fn fetch(&self, listing_id: &str) -> Result<JobRecord, AdapterError> {
        let url = build_details_url(listing_id)?;
        let max_attempts = self.retry.max_attempts;
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            match self.fetch_once(&url).await {
                Ok(detail) => {
                    let record = detail.into_record(Utc::now());
                    debug!(listing_id, title = %record.title, company = %record.company_name, "got details");
                    return Ok(record);
                }
                Err(err) => {
                    warn!(
                        listing_id,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %err,
                        "detail retrieval failed"
                    );
                    last_error = err.to_string();
                    if let Some(delay) = self.retry.delay_after_attempt(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(AdapterError::RetrievalExhausted {
            listing_id: listing_id.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<MonsterDetail, AttemptError> {
        let payload = self.source.get_json(url).await?;
        Ok(serde_json::from_value(payload)?)
    }
}
