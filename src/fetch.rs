use crate::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::thread;
use std::time::Duration;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
const DEFAULT_PAGE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MEDIA_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_ATTEMPTS: u32 = 1;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub page_timeout_secs: u64,
    pub media_timeout_secs: u64,
    /// Total tries per URL, so `1` disables retries.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            page_timeout_secs: DEFAULT_PAGE_TIMEOUT_SECS,
            media_timeout_secs: DEFAULT_MEDIA_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Page,
    Media,
}

pub trait Fetch: Sync {
    fn fetch(&self, url: &str, kind: FetchKind) -> Result<Vec<u8>>;
}

/// Blocking HTTP transport with a fixed-backoff retry policy.
pub struct HttpFetcher {
    page_agent: ureq::Agent,
    media_agent: ureq::Agent,
    config: HttpClientConfig,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Self {
        let page_agent = build_agent(&config.user_agent, config.page_timeout_secs);
        let media_agent = build_agent(&config.user_agent, config.media_timeout_secs);
        Self {
            page_agent,
            media_agent,
            config,
        }
    }

    fn fetch_once(&self, url: &str, kind: FetchKind) -> Result<Vec<u8>> {
        let agent = match kind {
            FetchKind::Page => &self.page_agent,
            FetchKind::Media => &self.media_agent,
        };
        let mut response = agent.get(url).call().map_err(|err| HarvestError::Transport {
            url: url.to_string(),
            detail: err.to_string(),
        })?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(HarvestError::HttpStatus {
                url: url.to_string(),
                status,
            });
        }

        let mut buf = Vec::new();
        response
            .body_mut()
            .as_reader()
            .read_to_end(&mut buf)
            .map_err(|err| HarvestError::Transport {
                url: url.to_string(),
                detail: format!("body read failed: {err}"),
            })?;
        Ok(buf)
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &str, kind: FetchKind) -> Result<Vec<u8>> {
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        with_retries(self.config.max_attempts, delay, |attempt| {
            let out = self.fetch_once(url, kind);
            if let Err(err) = &out {
                eprintln!(
                    "  -> request failed (attempt {attempt}/{}): {err}",
                    self.config.max_attempts.max(1)
                );
            }
            out
        })
    }
}

fn build_agent(user_agent: &str, timeout_secs: u64) -> ureq::Agent {
    let mut config = ureq::Agent::config_builder();
    config = config
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(timeout_secs.max(1))))
        .user_agent(user_agent);
    config.build().into()
}

/// Runs `attempt` up to `max_attempts` times (at least once), sleeping `delay`
/// between tries. Only transport-level errors are retried.
pub fn with_retries<T, F>(max_attempts: u32, delay: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let max_attempts = max_attempts.max(1);
    let mut current = 1;
    loop {
        match attempt(current) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transport() && current < max_attempts => {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                current += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(url: &str) -> HarvestError {
        HarvestError::Transport {
            url: url.to_string(),
            detail: "connection reset".to_string(),
        }
    }

    #[test]
    fn single_attempt_policy_fails_fast() {
        let mut calls = 0;
        let out: Result<()> = with_retries(1, Duration::ZERO, |_| {
            calls += 1;
            Err(transport("https://web.archive.org/x"))
        });
        assert!(out.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn retries_until_success_within_budget() {
        let mut calls = 0;
        let out = with_retries(3, Duration::ZERO, |attempt| {
            calls += 1;
            if attempt < 3 {
                Err(transport("https://web.archive.org/x"))
            } else {
                Ok(attempt)
            }
        })
        .expect("third attempt succeeds");
        assert_eq!(out, 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn non_transport_errors_are_not_retried() {
        let mut calls = 0;
        let out: Result<()> = with_retries(5, Duration::ZERO, |_| {
            calls += 1;
            Err(HarvestError::InvalidRequest("bad".to_string()))
        });
        assert!(out.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _: Result<()> = with_retries(0, Duration::ZERO, |_| {
            calls += 1;
            Err(HarvestError::HttpStatus {
                url: "https://web.archive.org/x".to_string(),
                status: 503,
            })
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn default_config_matches_fail_fast_behavior() {
        let config = HttpClientConfig::default();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.page_timeout_secs, 30);
        assert_eq!(config.media_timeout_secs, 60);
        let parsed: HttpClientConfig =
            serde_json::from_str(r#"{"max_attempts": 3}"#).expect("partial config");
        assert_eq!(parsed.max_attempts, 3);
        assert_eq!(parsed.retry_delay_ms, 1_500);
    }
}
