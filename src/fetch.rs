//! HTTP fetch path for origin listings and item pages.
//!
//! Speaks standard conditional HTTP: validators from the
//! [`ConditionalFetchCache`](crate::validators::ConditionalFetchCache) become
//! `If-None-Match` / `If-Modified-Since`, and `304 Not Modified` is reported
//! as [`FetchOutcome::NotModified`] rather than an error.
//!
//! Retry strategy:
//! - network error, HTTP 429 or 5xx → retry with linear delay (`retry_delay × attempt`)
//! - other 4xx → fail immediately with [`PipelineError::Http`]
//!
//! With SSRF protection on, URLs (and every redirect hop) must be http(s)
//! and must not point at localhost or a private, loopback or link-local address.

use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{redirect, StatusCode, Url};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::config::DownloadConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::Validator;

#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub body: String,
    pub validator: Validator,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The origin confirmed our validator; nothing new.
    NotModified,
    Fetched(FetchedResource),
}

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    max_attempts: u32,
    retry_delay: Duration,
    ssrf_protection: bool,
}

impl Fetcher {
    pub fn new(config: &DownloadConfig) -> PipelineResult<Self> {
        let max_redirects = config.max_redirects;
        let ssrf = config.ssrf_protection;
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= max_redirects {
                attempt.error("too many redirects")
            } else if ssrf && check_url(attempt.url().as_str()).is_err() {
                attempt.error("redirect to a blocked address")
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .redirect(policy)
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_attempts: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            ssrf_protection: ssrf,
        })
    }

    /// Fetch `url`, sending conditional headers when a validator is supplied.
    pub async fn fetch(&self, url: &str, validator: Option<&Validator>) -> PipelineResult<FetchOutcome> {
        if self.ssrf_protection {
            check_url(url)?;
        }

        let mut last_err = PipelineError::TransientNetwork("no attempt made".into());

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.retry_delay * (attempt - 1);
                tracing::debug!(url, attempt, wait_ms = delay.as_millis() as u64, "retrying fetch");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.get(url);
            if let Some(v) = validator {
                if let Some(ref etag) = v.etag {
                    request = request.header(IF_NONE_MATCH, etag);
                }
                if let Some(ref modified) = v.last_modified {
                    request = request.header(IF_MODIFIED_SINCE, modified);
                }
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = PipelineError::TransientNetwork(e.to_string());
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::NOT_MODIFIED {
                return Ok(FetchOutcome::NotModified);
            }

            if status.is_success() {
                let validator = Validator {
                    etag: header_string(&response, ETAG),
                    last_modified: header_string(&response, LAST_MODIFIED),
                };
                let body = match response.text().await {
                    Ok(b) => b,
                    Err(e) => {
                        last_err = PipelineError::TransientNetwork(e.to_string());
                        continue;
                    }
                };
                return Ok(FetchOutcome::Fetched(FetchedResource { body, validator }));
            }

            // Rate limited or server error: retry
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                last_err = PipelineError::TransientNetwork(format!("HTTP {}", status.as_u16()));
                continue;
            }

            return Err(PipelineError::Http {
                status: status.as_u16(),
            });
        }

        Err(last_err)
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Reject URLs that could reach internal services.
pub fn check_url(url: &str) -> PipelineResult<()> {
    let blocked = |reason: &str| PipelineError::Blocked {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let parsed = Url::parse(url).map_err(|_| blocked("not a valid URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(blocked("scheme must be http or https"));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| blocked("missing host"))?
        .to_ascii_lowercase();

    if host == "localhost" || host.ends_with(".localhost") {
        return Err(blocked("localhost"));
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_internal_ip(&ip) {
            return Err(blocked("private or reserved address"));
        }
    }

    Ok(())
}

fn is_internal_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 carrier-grade NAT
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64)
}

fn is_internal_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_internal_ipv4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
        || (first & 0xffc0) == 0xfe80 // link-local fe80::/10
}

fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_ipv4(v4),
        IpAddr::V6(v6) => is_internal_ipv6(v6),
    }
}
