//! Retry bookkeeping for a single catalog page.
//!
//! Each page gets a fresh [`RetryState`]. Every response is classified into a
//! [`PageOutcome`]; retryable outcomes consume one attempt and yield the delay
//! to wait before the next one. The terminal states are success (the page was
//! accepted), exhaustion (attempt budget spent) and abort (access denied).

use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use super::session::PageResponse;

/// Something that can block the current thread for a while.
///
/// Production code sleeps for real; tests record the requested delays.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Uniformly random duration within `(min, max)` seconds.
pub fn random_delay((min, max): (f64, f64)) -> Duration {
    if max <= min {
        return Duration::from_secs_f64(min.max(0.0));
    }
    Duration::from_secs_f64(rand::rng().random_range(min..=max))
}

/// Why a page attempt did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryReason {
    /// 403: the session was flagged as a bot
    Forbidden,
    /// 429
    RateLimited,
    /// 5xx
    ServerError(u16),
    /// Any other unexpected status
    UnexpectedStatus(u16),
    /// 200, but the body is not the expected JSON
    Malformed(String),
    /// Connection failure, timeout, unreadable body
    Transport(String),
}

impl RetryReason {
    /// Whether the session must be discarded before the next attempt.
    pub fn needs_new_session(&self) -> bool {
        matches!(self, RetryReason::Forbidden)
    }
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryReason::Forbidden => write!(f, "403 Forbidden"),
            RetryReason::RateLimited => write!(f, "429 Too Many Requests"),
            RetryReason::ServerError(status) => write!(f, "server error {status}"),
            RetryReason::UnexpectedStatus(status) => write!(f, "unexpected status {status}"),
            RetryReason::Malformed(err) => write!(f, "invalid JSON response: {err}"),
            RetryReason::Transport(err) => write!(f, "request error: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Accepted(Vec<Value>),
    Retry(RetryReason),
    /// 401: public access is blocked, stop the whole harvest
    Abort,
}

/// Classify a catalog response.
pub fn classify(response: &PageResponse) -> PageOutcome {
    match response.status {
        401 => PageOutcome::Abort,
        403 => PageOutcome::Retry(RetryReason::Forbidden),
        429 => PageOutcome::Retry(RetryReason::RateLimited),
        status if status >= 500 => PageOutcome::Retry(RetryReason::ServerError(status)),
        200 => match serde_json::from_str::<Value>(&response.body) {
            Ok(Value::Object(mut data)) => match data.remove("items") {
                Some(Value::Array(items)) => PageOutcome::Accepted(items),
                // no "items" key means nothing left to list
                None | Some(Value::Null) => PageOutcome::Accepted(vec![]),
                Some(other) => PageOutcome::Retry(RetryReason::Malformed(format!(
                    "\"items\" is not an array: {}",
                    kind_of(&other)
                ))),
            },
            Ok(other) => PageOutcome::Retry(RetryReason::Malformed(format!(
                "expected an object, got {}",
                kind_of(&other)
            ))),
            Err(err) => PageOutcome::Retry(RetryReason::Malformed(err.to_string())),
        },
        status => PageOutcome::Retry(RetryReason::UnexpectedStatus(status)),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Backoff schedule per failure kind.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Random pause after replacing a flagged session, in seconds
    pub forbidden_range: (f64, f64),
    pub rate_limit_base: Duration,
    pub rate_limit_step: Duration,
    pub server_error_step: Duration,
    pub malformed_step: Duration,
    pub transport_step: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            forbidden_range: (2.0, 5.0),
            rate_limit_base: Duration::from_secs(5),
            rate_limit_step: Duration::from_secs(3),
            server_error_step: Duration::from_secs(2),
            malformed_step: Duration::from_secs(2),
            transport_step: Duration::from_millis(1500),
        }
    }

    /// Delay before retrying after the `attempt`-th (1-based) failure.
    pub fn backoff(&self, reason: &RetryReason, attempt: u32) -> Duration {
        match reason {
            RetryReason::Forbidden => random_delay(self.forbidden_range),
            RetryReason::RateLimited => self.rate_limit_base + self.rate_limit_step * attempt,
            RetryReason::ServerError(_) => self.server_error_step * attempt,
            RetryReason::Malformed(_) | RetryReason::UnexpectedStatus(_) => {
                self.malformed_step * attempt
            }
            RetryReason::Transport(_) => self.transport_step * attempt,
        }
    }
}

/// Per-page attempt counter.
#[derive(Debug)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    attempt: u32,
}

impl<'a> RetryState<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Attempts used so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Claim the next attempt, or `false` once the budget is spent.
    pub fn begin_attempt(&mut self) -> bool {
        if self.attempt >= self.policy.max_attempts {
            return false;
        }
        self.attempt += 1;
        true
    }

    /// Backoff for a failure of the current attempt.
    pub fn backoff_for(&self, reason: &RetryReason) -> Duration {
        self.policy.backoff(reason, self.attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> PageResponse {
        PageResponse {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_classify_statuses() {
        assert_eq!(classify(&response(401, "")), PageOutcome::Abort);
        assert_eq!(
            classify(&response(403, "")),
            PageOutcome::Retry(RetryReason::Forbidden)
        );
        assert_eq!(
            classify(&response(429, "")),
            PageOutcome::Retry(RetryReason::RateLimited)
        );
        assert_eq!(
            classify(&response(503, "")),
            PageOutcome::Retry(RetryReason::ServerError(503))
        );
        assert_eq!(
            classify(&response(404, "{}")),
            PageOutcome::Retry(RetryReason::UnexpectedStatus(404))
        );
    }

    #[test]
    fn test_classify_bodies() {
        assert_eq!(
            classify(&response(200, r#"{"items": [{"id": 1}, {"id": 2}]}"#)),
            PageOutcome::Accepted(vec![
                serde_json::json!({"id": 1}),
                serde_json::json!({"id": 2})
            ])
        );
        assert_eq!(
            classify(&response(200, r#"{"pagination": {}}"#)),
            PageOutcome::Accepted(vec![])
        );
        assert!(matches!(
            classify(&response(200, "<html>challenge</html>")),
            PageOutcome::Retry(RetryReason::Malformed(_))
        ));
        assert!(matches!(
            classify(&response(200, r#"{"items": "nope"}"#)),
            PageOutcome::Retry(RetryReason::Malformed(_))
        ));
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::new(3);

        assert_eq!(
            policy.backoff(&RetryReason::RateLimited, 1),
            Duration::from_secs(8)
        );
        assert_eq!(
            policy.backoff(&RetryReason::RateLimited, 3),
            Duration::from_secs(14)
        );
        assert_eq!(
            policy.backoff(&RetryReason::ServerError(500), 2),
            Duration::from_secs(4)
        );
        assert_eq!(
            policy.backoff(&RetryReason::Transport("timeout".into()), 2),
            Duration::from_secs(3)
        );

        let forbidden = policy.backoff(&RetryReason::Forbidden, 1);
        assert!(forbidden >= Duration::from_secs(2) && forbidden <= Duration::from_secs(5));
    }

    #[test]
    fn test_retry_state_budget() {
        let policy = RetryPolicy::new(2);
        let mut state = RetryState::new(&policy);

        assert!(state.begin_attempt());
        assert!(state.begin_attempt());
        assert!(!state.begin_attempt());
        assert_eq!(state.attempt(), 2);
    }

    #[test]
    fn test_random_delay_bounds() {
        for _ in 0..50 {
            let delay = random_delay((1.0, 2.5));
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(2500));
        }
        assert_eq!(random_delay((0.5, 0.5)), Duration::from_millis(500));
    }
}
