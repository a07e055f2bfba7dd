use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, MerchantRecord>>,
    limiter: Arc<TokenBuckets>,
}

/// Identity attached to the request once the key checks out.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub merchant_id: String,
    pub api_key_id: String,
}

#[derive(Clone)]
struct MerchantRecord {
    merchant_id: String,
    api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let records = Arc::new(load_keys_from_env());
        let limiter = Arc::new(TokenBuckets::from_env());
        Self { records, limiter }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            merchant_id: record.merchant_id.clone(),
            api_key_id: record.api_key_id.clone(),
        })
    }

    async fn consume(&self, merchant_id: &str) -> Result<RatePermit, RateExceeded> {
        self.limiter.consume(merchant_id).await
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Peddler-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    match state.consume(&context.merchant_id).await {
        Ok(permit) => {
            request.extensions_mut().insert(context.clone());
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests",
            );
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Peddler-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

fn load_keys_from_env() -> HashMap<String, MerchantRecord> {
    let raw =
        env::var("MERCHANT_API_KEYS").unwrap_or_else(|_| "demo-merchant:demo-key".to_string());
    keys_with_fallback(&raw)
}

/// `merchant:key` pairs separated by commas. Malformed entries are skipped;
/// an empty result falls back to the demo credentials so local runs work
/// without any env.
fn keys_with_fallback(raw: &str) -> HashMap<String, MerchantRecord> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let merchant_id = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (merchant_id, key) {
            (Some(merchant), Some(secret)) => {
                let record = MerchantRecord {
                    merchant_id: merchant.to_string(),
                    api_key_id: format!("key-{:02}", idx + 1),
                };
                entries.insert(secret.to_string(), record);
            }
            _ => warn!(
                target = "peddler.api",
                "ignored malformed MERCHANT_API_KEYS entry: {trimmed}"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "peddler.api",
            "MERCHANT_API_KEYS produced no keys; falling back to demo credentials"
        );
        entries.insert(
            "demo-key".to_string(),
            MerchantRecord {
                merchant_id: "demo-merchant".to_string(),
                api_key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(
            target = "peddler.api",
            key_count = entries.len(),
            "loaded API keys from env"
        );
    }

    entries
}

#[derive(Clone)]
struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Arc<Mutex<HashMap<String, BucketState>>>,
}

impl TokenBuckets {
    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self::new(rate_per_sec, capacity)
    }

    async fn consume(&self, key: &str) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            let retry_after = (deficit / self.rate_per_sec).max(0.0);
            Err(RateExceeded {
                retry_after,
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
pub struct RatePermit {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        rate_headers(headers, self.capacity, self.tokens, self.rate);
    }
}

#[derive(Debug, Clone)]
pub struct RateExceeded {
    retry_after: f64,
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let retry = self.retry_after.ceil().max(0.0) as u64;
        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from_str(&retry.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("1")),
        );
        rate_headers(headers, self.capacity, self.tokens, self.rate);
    }
}

fn rate_headers(headers: &mut http::HeaderMap, capacity: f64, tokens: f64, rate: f64) {
    let remaining = tokens.max(0.0).floor() as u64;
    let reset = ((capacity - tokens) / rate).ceil().max(0.0) as u64;
    insert_numeric(headers, "X-RateLimit-Limit", capacity as u64);
    insert_numeric(headers, "X-RateLimit-Remaining", remaining);
    insert_numeric(headers, "X-RateLimit-Reset", reset);
}

fn insert_numeric(headers: &mut http::HeaderMap, name: &'static str, value: u64) {
    headers.insert(
        name,
        HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_key_entries() {
        let entries = keys_with_fallback("alice:key-a, bob:key-b");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["key-a"].merchant_id, "alice");
        assert_eq!(entries["key-b"].merchant_id, "bob");
        assert_eq!(entries["key-b"].api_key_id, "key-02");
    }

    #[test]
    fn skips_malformed_entries() {
        let entries = keys_with_fallback("alice:key-a,garbage,:nope,bob:key-b");
        assert_eq!(entries.len(), 2);
        assert!(entries.contains_key("key-a"));
        assert!(entries.contains_key("key-b"));
    }

    #[test]
    fn empty_config_falls_back_to_demo_credentials() {
        let entries = keys_with_fallback("  , ,");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["demo-key"].merchant_id, "demo-merchant");
    }

    #[test]
    fn extracts_bearer_and_custom_header() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer secret-token"),
        );
        assert_eq!(extract_api_key(&headers).as_deref(), Some("secret-token"));

        let mut headers = http::HeaderMap::new();
        headers.insert("X-Peddler-Key", HeaderValue::from_static("other-token"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("other-token"));

        assert!(extract_api_key(&http::HeaderMap::new()).is_none());
    }

    #[tokio::test]
    async fn bucket_exhausts_and_reports_retry() {
        let limiter = TokenBuckets::new(1.0, 3.0);
        for _ in 0..3 {
            limiter.consume("alice").await.expect("permit");
        }
        let exceeded = limiter.consume("alice").await.expect_err("exhausted");
        assert!(exceeded.retry_after > 0.0);

        // Other merchants keep their own bucket.
        limiter.consume("bob").await.expect("permit");
    }
}
