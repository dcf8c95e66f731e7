//! Upstream odds source.
//!
//! The core only sees [`OddsSource`]; [`TheOddsApi`] is the production
//! implementation over The Odds API v4. Retries and backoff are left to the
//! scheduler.

use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::Serialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::info;

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::model::OddsApiEvent;

/// API usage reported by the upstream in response headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApiQuota {
    pub requests_used: Option<u64>,
    pub requests_remaining: Option<u64>,
}

/// One successful (2xx) upstream response.
#[derive(Debug, Clone, Default)]
pub struct FetchedOdds {
    pub events: Vec<OddsApiEvent>,
    pub quota: Option<ApiQuota>,
}

#[async_trait]
pub trait OddsSource: Send + Sync {
    async fn fetch_odds(&self) -> Result<FetchedOdds, FeedError>;
}

/// Parse a quota header that may be an integer or float (e.g. "14527.0").
fn parse_quota_header(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u64)
}

/// The Odds API client
pub struct TheOddsApi {
    config: FeedConfig,
    http_client: reqwest::Client,
    rate_limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl TheOddsApi {
    pub fn new(config: FeedConfig) -> Result<Self> {
        let per_minute = NonZeroU32::new(config.rate_limit_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_minute(per_minute));

        // HTTP client with timeouts
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            http_client,
            rate_limiter,
        })
    }

    fn odds_url(&self) -> String {
        format!(
            "{}/v4/sports/{}/odds",
            self.config.base_url.trim_end_matches('/'),
            self.config.sport
        )
    }
}

#[async_trait]
impl OddsSource for TheOddsApi {
    async fn fetch_odds(&self) -> Result<FetchedOdds, FeedError> {
        // Wait for rate limit
        self.rate_limiter.until_ready().await;

        let response = self
            .http_client
            .get(self.odds_url())
            .query(&[
                ("apiKey", self.config.api_key.as_str()),
                ("regions", self.config.regions.as_str()),
                ("markets", self.config.markets.as_str()),
                ("oddsFormat", self.config.odds_format.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        let status = response.status();
        let quota = ApiQuota {
            requests_used: parse_quota_header(response.headers(), "x-requests-used"),
            requests_remaining: parse_quota_header(response.headers(), "x-requests-remaining"),
        };
        if let Some(remaining) = quota.requests_remaining {
            info!("API requests remaining (upstream): {}", remaining);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FeedError::Decode(format!("failed to read response body: {}", e)))?;
        let events: Vec<OddsApiEvent> =
            serde_json::from_str(&body).map_err(|e| FeedError::Decode(e.to_string()))?;

        info!("Fetched {} events from The Odds API", events.len());
        Ok(FetchedOdds {
            events,
            quota: Some(quota),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn quota_headers_accept_float_values() {
        let mut headers = HeaderMap::new();
        headers.insert("x-requests-used", HeaderValue::from_static("12.0"));
        headers.insert("x-requests-remaining", HeaderValue::from_static("488"));
        headers.insert("x-broken", HeaderValue::from_static("lots"));

        assert_eq!(parse_quota_header(&headers, "x-requests-used"), Some(12));
        assert_eq!(parse_quota_header(&headers, "x-requests-remaining"), Some(488));
        assert_eq!(parse_quota_header(&headers, "x-broken"), None);
        assert_eq!(parse_quota_header(&headers, "x-missing"), None);
    }

    #[test]
    fn odds_url_ignores_trailing_slash() {
        let api = TheOddsApi::new(FeedConfig {
            api_key: "k".to_string(),
            base_url: "https://api.the-odds-api.com/".to_string(),
            sport: "americanfootball_nfl".to_string(),
            regions: "us".to_string(),
            markets: "h2h,spreads,totals".to_string(),
            odds_format: "american".to_string(),
            rate_limit_per_minute: 0,
        })
        .unwrap();

        assert_eq!(
            api.odds_url(),
            "https://api.the-odds-api.com/v4/sports/americanfootball_nfl/odds"
        );
    }

    #[test]
    fn only_decode_failures_are_billable() {
        assert!(FeedError::Decode("bad json".into()).is_billable());
        assert!(!FeedError::Transport("timeout".into()).is_billable());
        assert!(!FeedError::Status { status: 401, body: String::new() }.is_billable());
    }
}
