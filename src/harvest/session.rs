//! Browser-like HTTP sessions for the catalog API.
//!
//! A session carries a cookie jar, one user agent picked from the configured
//! pool, browser headers, and (when the site hands one out) the anti-bot CSRF
//! token scraped from the landing page. Sessions are never patched: when the
//! site flags one, the harvester asks for a brand new one.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::seq::IndexedRandom;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use super::backoff::{random_delay, Sleeper};
use crate::config::HarvestConfig;

const CSRF_HEADER: &str = "X-CSRF-Token";

static CSRF_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""CSRF_TOKEN":"([^"]+)""#).expect("static csrf regex is valid")
});

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("no user agent configured")]
    NoUserAgent,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Status and body of one catalog request.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub body: String,
}

/// A live identity able to request catalog pages.
pub trait CatalogSession {
    fn get_page(&self, params: &[(String, String)]) -> Result<PageResponse, SessionError>;

    /// Whether an anti-bot token was negotiated for this session.
    fn has_token(&self) -> bool;
}

/// Creates fresh sessions on demand.
pub trait SessionProvider {
    fn create_session(&self) -> Result<Box<dyn CatalogSession>, SessionError>;
}

pub struct Session {
    client: Client,
    api_url: Url,
    csrf_token: Option<String>,
}

impl CatalogSession for Session {
    fn get_page(&self, params: &[(String, String)]) -> Result<PageResponse, SessionError> {
        let mut request = self.client.get(self.api_url.clone()).query(params);
        if let Some(token) = &self.csrf_token {
            request = request.header(CSRF_HEADER, token);
        }

        let response = request.send()?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|err| SessionError::Transport(format!("reading {status} body: {err}")))?;

        Ok(PageResponse { status, body })
    }

    fn has_token(&self) -> bool {
        self.csrf_token.is_some()
    }
}

/// Builds [`Session`]s from the harvest config.
pub struct SessionManager<'a> {
    config: HarvestConfig,
    sleeper: &'a dyn Sleeper,
}

impl<'a> SessionManager<'a> {
    pub fn new(config: HarvestConfig, sleeper: &'a dyn Sleeper) -> Self {
        Self { config, sleeper }
    }

    fn pick_user_agent(&self) -> Result<String, SessionError> {
        let pool: Vec<&String> = self
            .config
            .user_agents
            .iter()
            .filter(|ua| !ua.trim().is_empty())
            .collect();

        pool.choose(&mut rand::rng())
            .map(|ua| ua.to_string())
            .ok_or(SessionError::NoUserAgent)
    }

    fn browser_headers(&self, base_url: &Url) -> Result<HeaderMap, SessionError> {
        let origin = base_url.as_str().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        let mut set = |name: &'static str, value: &str| -> Result<(), SessionError> {
            headers.insert(HeaderName::from_static(name), HeaderValue::from_str(value)?);
            Ok(())
        };

        set("accept", "application/json, text/plain, */*")?;
        set("accept-language", &self.config.accept_language)?;
        set("referer", &format!("{origin}/"))?;
        set("origin", &origin)?;
        set(
            "sec-ch-ua",
            r#""Google Chrome";v="126", "Chromium";v="126", "Not=A?Brand";v="99""#,
        )?;
        set("sec-ch-ua-platform", r#""Windows""#)?;
        set("sec-fetch-site", "same-origin")?;
        set("sec-fetch-mode", "cors")?;
        set("sec-fetch-dest", "empty")?;

        Ok(headers)
    }

    fn cookie_jar(&self, base_url: &Url) -> Arc<Jar> {
        let jar = Jar::default();
        if let Some(cookies) = &self.config.cookies {
            let mut count = 0;
            for cookie in cookies.split(';').map(str::trim).filter(|c| c.contains('=')) {
                jar.add_cookie_str(cookie, base_url);
                count += 1;
            }
            log::info!("Seeded {count} cookies for {}", base_url.host_str().unwrap_or_default());
        }
        Arc::new(jar)
    }

    /// Build a client, wait a human-looking moment, then warm it up against
    /// the landing page. Warm-up failures leave the session usable but
    /// tokenless.
    pub fn create(&self) -> Result<Session, SessionError> {
        let base_url = Url::parse(&self.config.base_url)?;
        let api_url = Url::parse(&self.config.api_url())?;
        let user_agent = self.pick_user_agent()?;

        let client = Client::builder()
            .user_agent(user_agent.clone())
            .default_headers(self.browser_headers(&base_url)?)
            .cookie_provider(self.cookie_jar(&base_url))
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        self.sleeper
            .sleep(random_delay(self.config.warmup_delay_range));

        let csrf_token = match client.get(base_url.clone()).send() {
            Ok(resp) if resp.status().is_success() => match resp.text() {
                Ok(html) => extract_csrf_token(&html),
                Err(err) => {
                    log::warn!("Could not read landing page: {err}");
                    None
                }
            },
            Ok(resp) => {
                log::warn!("Initial page load failed with {}", resp.status().as_u16());
                None
            }
            Err(err) => {
                log::warn!("Initial page load failed: {err}");
                None
            }
        };

        if csrf_token.is_none() {
            log::warn!("No anti-bot token found, continuing without it");
        }

        log::debug!("new session, user agent {user_agent:?}, token: {}", csrf_token.is_some());

        Ok(Session {
            client,
            api_url,
            csrf_token,
        })
    }
}

impl SessionProvider for SessionManager<'_> {
    fn create_session(&self) -> Result<Box<dyn CatalogSession>, SessionError> {
        Ok(Box::new(self.create()?))
    }
}

/// Pull the anti-bot token out of the landing page, either from the inlined
/// app state or from a `csrf-token` meta tag.
pub fn extract_csrf_token(html: &str) -> Option<String> {
    if let Some(token) = CSRF_REGEX
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
    {
        return Some(token);
    }

    let document = scraper::Html::parse_document(html);
    let selector = scraper::Selector::parse(r#"meta[name="csrf-token"]"#).ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|content| !content.is_empty())
        .map(str::to_string)
}
