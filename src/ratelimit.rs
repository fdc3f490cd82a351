//! Rate-Limit Controller (C6): classify failures, schedule retries.
//!
//! Classification is regex-based, matching known rate-limit/transient-
//! network markers (`"rate limit"`, `"429"`, `"ECONNRESET"`, etc.) in
//! captured stderr.

use std::time::Duration;

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;

lazy_static! {
    static ref RATE_LIMIT_RE: Regex =
        Regex::new(r"(?i)rate.?limit|too many requests|\b429\b").unwrap();
    static ref AUTH_RE: Regex =
        Regex::new(r"(?i)\b401\b|\b403\b|unauthorized|forbidden|missing credential|invalid api key")
            .unwrap();
    static ref NOT_FOUND_RE: Regex =
        Regex::new(r"(?i)\b404\b|not found|no such repository|repository does not exist").unwrap();
    static ref TRANSIENT_RE: Regex = Regex::new(
        r"(?i)connection reset|econnreset|unexpected eof|dns|could not resolve|timed out|timeout"
    )
    .unwrap();
    static ref RETRY_AFTER_RE: Regex = Regex::new(r"(?i)retry_after=(\d+)").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureClass {
    RateLimited {
        retry_after: Option<Duration>,
        reset_at: Option<std::time::SystemTime>,
    },
    TransientNetwork,
    Authentication,
    NotFound,
    Permanent,
}

/// Classify a completed external invocation's exit status and captured
/// stderr into a failure category, checked in priority order: a
/// rate-limit marker always wins even if the text also happens to
/// contain, say, a 404-shaped substring.
pub fn classify(exit_code: Option<i32>, stderr: &str) -> FailureClass {
    if exit_code == Some(0) {
        // Not actually a failure; callers should not call classify() in
        // this case, but degrade gracefully rather than panicking.
        return FailureClass::Permanent;
    }

    if RATE_LIMIT_RE.is_match(stderr) {
        let retry_after = RETRY_AFTER_RE
            .captures(stderr)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .map(Duration::from_secs);
        return FailureClass::RateLimited {
            retry_after,
            reset_at: None,
        };
    }
    if AUTH_RE.is_match(stderr) {
        return FailureClass::Authentication;
    }
    if NOT_FOUND_RE.is_match(stderr) {
        return FailureClass::NotFound;
    }
    if TRANSIENT_RE.is_match(stderr) {
        return FailureClass::TransientNetwork;
    }
    FailureClass::Permanent
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

/// Scheduling decision returned by the controller for a single failed
/// attempt.
pub enum Decision {
    RetryAfter(Duration),
    FailNow,
}

impl RetryPolicy {
    /// Decide whether `attempt` (1-based: this is the Nth attempt that
    /// just failed) should be retried, and if so after how long.
    pub fn decide(&self, attempt: u32, class: &FailureClass) -> Decision {
        match class {
            FailureClass::RateLimited {
                retry_after,
                reset_at,
            } => {
                // Bounded like every other class: a backend that never
                // stops returning 429 must not block its subtest forever.
                if attempt > self.max_retries {
                    return Decision::FailNow;
                }
                if let Some(reset_at) = reset_at {
                    let now = std::time::SystemTime::now();
                    let delay = reset_at
                        .duration_since(now)
                        .unwrap_or(Duration::from_secs(0));
                    return Decision::RetryAfter(delay);
                }
                let backoff = self.exponential_backoff(attempt);
                let delay = match retry_after {
                    Some(explicit) => std::cmp::max(*explicit, backoff),
                    None => backoff,
                };
                Decision::RetryAfter(delay)
            }
            FailureClass::TransientNetwork => {
                if attempt > self.max_retries {
                    Decision::FailNow
                } else {
                    Decision::RetryAfter(self.jittered_backoff(attempt))
                }
            }
            FailureClass::Authentication | FailureClass::NotFound | FailureClass::Permanent => {
                Decision::FailNow
            }
        }
    }

    fn exponential_backoff(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * 2f64.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let backoff = self.exponential_backoff(attempt);
        let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..0.25);
        Duration::from_secs_f64(backoff.as_secs_f64() * (1.0 + jitter_frac))
    }
}
