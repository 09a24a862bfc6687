//! Enrichment client: multi-model fallback behind per-model circuit breakers.
//!
//! [`EnrichmentClient::enrich`] turns an item into a validated
//! [`Enrichment`] (summary, category, scores, keywords):
//!
//! 1. The body is cleaned and deterministically truncated, then rendered into
//!    the prompt template.
//! 2. The response cache is consulted for every candidate model's key. A hit
//!    returns immediately: no network call, no breaker interaction.
//! 3. Candidates are tried in declared order, each through its own
//!    [`CircuitBreaker`] and optional requests-per-minute limiter.
//!    - breaker open: next candidate, no delay
//!    - transient failure (network, 429, 5xx): retry the same candidate with
//!      exponential backoff, up to `max_retries` attempts
//!    - invalid response, content filter, other 4xx: next candidate
//! 4. All candidates exhausted: `EnrichmentUnavailable`, nothing is written.
//!
//! The remote side is abstracted by [`CompletionBackend`] so tests can script
//! responses; [`HttpCompletionBackend`] speaks the OpenAI-compatible
//! `POST {host}/chat/completions` protocol.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use metrics::{counter, histogram};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{cache_key, EnrichmentCache};
use crate::circuit_breaker::{BreakerError, BreakerMetrics, BreakerState, CircuitBreaker};
use crate::config::EnrichmentConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::extract::prepare_for_enrichment;
use crate::metrics::{ENRICH_FAILURES, ENRICH_LATENCY_MS, ENRICH_REQUESTS};
use crate::models::{Category, Enrichment, Item, Scores, SCORE_MAX, SCORE_MIN};

/// Upper bound on keywords kept from a response.
pub const MAX_KEYWORDS: usize = 8;
const MAX_KEYWORD_CHARS: usize = 64;
/// Rough characters-per-token ratio used for the token budget.
const CHARS_PER_TOKEN: usize = 4;

/// A remote text-completion endpoint.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Send one system + user message pair to `model`, returning the raw reply text.
    async fn complete(&self, model: &str, system: &str, user: &str) -> PipelineResult<String>;
}

/// OpenAI-compatible chat completions over HTTP.
pub struct HttpCompletionBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    max_tokens: u32,
    temperature: f64,
}

impl HttpCompletionBackend {
    pub fn new(config: &EnrichmentConfig, host: &str, api_key: String) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", host.trim_end_matches('/')),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionBackend {
    async fn complete(&self, model: &str, system: &str, user: &str) -> PipelineResult<String> {
        let body = serde_json::json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let json: Value = response.json().await?;
            return json
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .ok_or_else(|| {
                    PipelineError::Validation("response has no choices[0].message.content".into())
                });
        }

        // Rate limited or server error: retryable
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(PipelineError::TransientNetwork(format!("HTTP {}", status.as_u16())));
        }

        // The API answers 400 when a content filter rejects the input
        if status.as_u16() == 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Validation(format!(
                "request rejected (HTTP 400): {}",
                text.chars().take(200).collect::<String>()
            )));
        }

        Err(PipelineError::Http {
            status: status.as_u16(),
        })
    }
}

struct Candidate {
    model: String,
    breaker: CircuitBreaker,
    limiter: Option<DefaultDirectRateLimiter>,
}

/// Retry and prompt settings copied out of [`EnrichmentConfig`].
#[derive(Debug, Clone)]
struct Settings {
    system_prompt: String,
    user_prompt: String,
    max_content_chars: usize,
    max_content_tokens: usize,
    max_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    jitter: bool,
}

pub struct EnrichmentClient {
    backend: Arc<dyn CompletionBackend>,
    candidates: Vec<Candidate>,
    cache: EnrichmentCache,
    settings: Settings,
}

impl EnrichmentClient {
    pub fn new(
        config: &EnrichmentConfig,
        backend: Arc<dyn CompletionBackend>,
        cache: EnrichmentCache,
    ) -> Self {
        let candidates = config
            .models
            .iter()
            .map(|model| Candidate {
                model: model.clone(),
                breaker: CircuitBreaker::new(
                    model.clone(),
                    config.breaker_failure_threshold,
                    Duration::from_secs(config.breaker_recovery_secs),
                ),
                limiter: config
                    .rpm_for(model)
                    .and_then(NonZeroU32::new)
                    .map(|rpm| RateLimiter::direct(Quota::per_minute(rpm))),
            })
            .collect();

        Self {
            backend,
            candidates,
            cache,
            settings: Settings {
                system_prompt: config.system_prompt.clone(),
                user_prompt: config.user_prompt.clone(),
                max_content_chars: config.max_content_chars,
                max_content_tokens: config.max_content_tokens,
                max_retries: config.max_retries.max(1),
                backoff_base: Duration::from_millis(config.backoff_base_ms),
                backoff_max: Duration::from_millis(config.backoff_max_ms),
                jitter: config.jitter,
            },
        }
    }

    /// Client speaking HTTP to the configured host, with the credential from the environment.
    pub fn from_config(config: &EnrichmentConfig, cache: EnrichmentCache) -> PipelineResult<Self> {
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| PipelineError::Config("enrichment.host is not set".into()))?;
        if config.models.is_empty() {
            return Err(PipelineError::Config("enrichment.models is empty".into()));
        }
        let api_key = config.api_key().ok_or_else(|| {
            PipelineError::Config(format!(
                "no API key: set the {} environment variable",
                config.api_key_env
            ))
        })?;
        let backend = HttpCompletionBackend::new(config, host, api_key)?;
        Ok(Self::new(config, Arc::new(backend), cache))
    }

    pub fn models(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.model.as_str()).collect()
    }

    /// Per-model breaker state and lifetime counters.
    pub fn breaker_states(&self) -> Vec<(String, BreakerState, BreakerMetrics)> {
        self.candidates
            .iter()
            .map(|c| (c.model.clone(), c.breaker.state(), c.breaker.metrics()))
            .collect()
    }

    /// Render the user message for an item: cleaned, truncated content in the template.
    pub fn render_prompt(&self, title: &str, body: &str) -> String {
        let cleaned = prepare_for_enrichment(body);
        let limit = self
            .settings
            .max_content_chars
            .min(self.settings.max_content_tokens.saturating_mul(CHARS_PER_TOKEN));
        let content = truncate_at_boundary(&cleaned, limit);
        self.settings
            .user_prompt
            .replace("{title}", title.trim())
            .replace("{content}", content)
    }

    pub async fn enrich(&self, item: &Item) -> PipelineResult<Enrichment> {
        let user = self.render_prompt(&item.title, &item.body);
        let system = self.settings.system_prompt.as_str();

        for candidate in &self.candidates {
            let key = cache_key(&candidate.model, system, &user);
            if let Some(hit) = self.cache.get(&key).await? {
                tracing::debug!(url = %item.url, model = %candidate.model, "enrichment cache hit");
                return Ok(hit);
            }
        }

        let mut last_error = String::from("no enrichment models configured");

        for candidate in &self.candidates {
            match self.try_candidate(candidate, system, &user, &item.url).await {
                Ok(enrichment) => {
                    let key = cache_key(&candidate.model, system, &user);
                    self.cache.put(&key, &candidate.model, &enrichment).await?;
                    return Ok(enrichment);
                }
                Err(e) => {
                    last_error = format!("{}: {}", candidate.model, e);
                }
            }
        }

        Err(PipelineError::EnrichmentUnavailable { last_error })
    }

    async fn try_candidate(
        &self,
        candidate: &Candidate,
        system: &str,
        user: &str,
        url: &str,
    ) -> PipelineResult<Enrichment> {
        let mut attempt: u32 = 1;
        loop {
            let result = candidate
                .breaker
                .call(|| async {
                    if let Some(ref limiter) = candidate.limiter {
                        limiter.until_ready().await;
                    }
                    counter!(ENRICH_REQUESTS, "model" => candidate.model.clone()).increment(1);
                    let started = Instant::now();
                    let text = self.backend.complete(&candidate.model, system, user).await;
                    histogram!(ENRICH_LATENCY_MS, "model" => candidate.model.clone())
                        .record(started.elapsed().as_secs_f64() * 1000.0);
                    parse_enrichment(&text?)
                })
                .await;

            if matches!(result, Err(BreakerError::Inner(_))) {
                counter!(ENRICH_FAILURES, "model" => candidate.model.clone()).increment(1);
            }

            let err = match result {
                Ok(enrichment) => return Ok(enrichment),
                Err(BreakerError::Open) => {
                    tracing::info!(url, model = %candidate.model, "breaker open, skipping model");
                    return Err(PipelineError::TransientNetwork("circuit open".into()));
                }
                Err(BreakerError::Inner(e)) => e,
            };

            if !err.is_retryable() || attempt >= self.settings.max_retries {
                tracing::warn!(url, model = %candidate.model, attempt, error = %err, "model failed");
                return Err(err);
            }

            let wait = self.backoff(attempt);
            tracing::warn!(
                url,
                model = %candidate.model,
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "enrichment call failed, retrying"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    /// Delay before retry number `attempt` (1-based): base doubling, capped, optionally jittered.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .settings
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.settings.backoff_max);
        if !self.settings.jitter || delay.is_zero() {
            return delay;
        }
        // Equal jitter: half fixed, half random.
        let half = delay / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    }
}

/// Cut `text` to at most `max_chars` characters, preferring a paragraph,
/// then a sentence, then a word boundary within the second half of the window.
pub fn truncate_at_boundary(text: &str, max_chars: usize) -> &str {
    let Some((hard_end, _)) = text.char_indices().nth(max_chars) else {
        return text;
    };
    let window = &text[..hard_end];
    let floor = window
        .char_indices()
        .nth(max_chars / 2)
        .map(|(i, _)| i)
        .unwrap_or(0);

    let cut = window
        .rfind("\n\n")
        .filter(|&i| i >= floor)
        .or_else(|| {
            [". ", "! ", "? ", ".\n", "!\n", "?\n"]
                .iter()
                .filter_map(|p| window.rfind(p).map(|i| i + 1))
                .filter(|&i| i >= floor)
                .max()
        })
        .or_else(|| {
            window
                .rfind(char::is_whitespace)
                .filter(|&i| i >= floor)
        })
        .unwrap_or(hard_end);

    window[..cut].trim_end()
}

#[derive(Debug, Deserialize)]
struct RawScores {
    relevance: Option<Value>,
    quality: Option<Value>,
    timeliness: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawEnrichment {
    summary: Option<String>,
    category: Option<String>,
    relevance: Option<Value>,
    quality: Option<Value>,
    timeliness: Option<Value>,
    scores: Option<RawScores>,
    #[serde(default)]
    keywords: Option<Value>,
}

/// Parse and validate a model reply. Tolerates markdown code fences and prose around the JSON.
pub fn parse_enrichment(text: &str) -> PipelineResult<Enrichment> {
    let json = extract_json_object(text)
        .ok_or_else(|| PipelineError::Validation("no JSON object in response".into()))?;
    let raw: RawEnrichment = serde_json::from_str(json)
        .map_err(|e| PipelineError::Validation(format!("malformed JSON: {}", e)))?;

    let summary = raw.summary.as_deref().map(str::trim).unwrap_or_default();
    if summary.is_empty() {
        return Err(PipelineError::Validation("summary is empty".into()));
    }

    let category = raw
        .category
        .as_deref()
        .map(Category::from_label)
        .unwrap_or(Category::Other);

    let (relevance, quality, timeliness) = match raw.scores {
        Some(s) => (s.relevance, s.quality, s.timeliness),
        None => (raw.relevance, raw.quality, raw.timeliness),
    };
    let scores = match (
        score_value(relevance.as_ref()),
        score_value(quality.as_ref()),
        score_value(timeliness.as_ref()),
    ) {
        (Some(relevance), Some(quality), Some(timeliness)) => Some(Scores {
            relevance,
            quality,
            timeliness,
        }),
        _ => None,
    };

    Ok(Enrichment {
        summary: summary.to_string(),
        category,
        scores,
        keywords: normalize_keywords(raw.keywords.as_ref()),
    })
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn score_value(value: Option<&Value>) -> Option<i64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    let n = n.round() as i64;
    (SCORE_MIN..=SCORE_MAX).contains(&n).then_some(n)
}

fn normalize_keywords(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };

    let mut out: Vec<String> = Vec::new();
    for kw in raw {
        let kw = kw.trim();
        if kw.is_empty() || kw.chars().count() > MAX_KEYWORD_CHARS {
            continue;
        }
        if out.iter().any(|k| k.eq_ignore_ascii_case(kw)) {
            continue;
        }
        out.push(kw.to_string());
        if out.len() == MAX_KEYWORDS {
            break;
        }
    }
    out
}
