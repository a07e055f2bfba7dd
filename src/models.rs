use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DefaultOnNull, serde_as};

use crate::matching::RelevanceResult;

/// Body for `POST /listings`. The photo is the only required field; any
/// seller-supplied field wins over what the vision model reads off the image.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateListingRequest {
    /// Base64 image bytes, raw or wrapped in a `data:` URL.
    pub image: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ListingResponse {
    pub listing_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_link: Option<String>,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A published listing as the matching side sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub seller: String,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub location: String,
}

/// A registered buyer with their stated shopping preferences. The store
/// serves `null` for empty profile columns, so the row must parse either way.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buyer {
    pub id: i64,
    pub name: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub preferences: Vec<String>,
}

/// Body for `POST /matching/push`. The merchant defaults to the caller's
/// authenticated identity; an explicit id overrides it.
#[derive(Debug, Clone, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub merchant_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PushReceipt {
    pub merchant_id: String,
    pub listings: usize,
    pub buyers: usize,
    pub matches: Vec<RelevanceResult>,
}
