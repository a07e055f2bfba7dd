use crate::llm::{ChatMessage, LlmClient, LlmError, OutputFormat, strip_markdown_fence};
use crate::models::{Buyer, Listing};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const SCORE_SYSTEM_PROMPT: &str = r#"
You rate how relevant a marketplace listing is to one buyer. Given the listing
details and the buyer's stated preferences, respond with a valid JSON object
of the form {"score": N} where N is an integer from 1 (irrelevant) to 10
(perfect match). Output JSON only.
"#;

/// How strongly one listing matches one buyer, on the fixed ten-point scale
/// the scoring model is held to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelevanceResult {
    pub listing_id: i64,
    pub buyer_id: i64,
    pub buyer_name: String,
    pub score: u8,
}

#[derive(Debug, Error)]
pub enum ScoreError {
    /// The scoring backend could not be reached or did not answer in time.
    #[error("scoring backend unavailable: {0}")]
    Service(String),
    /// The backend answered, but outside the agreed score contract.
    #[error("malformed relevance response: {0}")]
    MalformedResponse(String),
}

#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(&self, listing: &Listing, buyer: &Buyer) -> Result<RelevanceResult, ScoreError>;
}

pub struct LlmRelevanceScorer {
    llm: Arc<LlmClient>,
}

impl LlmRelevanceScorer {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl RelevanceScorer for LlmRelevanceScorer {
    async fn score(&self, listing: &Listing, buyer: &Buyer) -> Result<RelevanceResult, ScoreError> {
        let payload = json!({
            "listing": {
                "title": listing.title,
                "description": listing.description,
                "price": listing.price,
                "location": listing.location,
            },
            "buyer_preferences": buyer.preferences,
        });

        let messages = vec![
            ChatMessage::text("system", SCORE_SYSTEM_PROMPT),
            ChatMessage::text("user", payload.to_string()),
        ];

        let response = self
            .llm
            .chat(&messages, OutputFormat::JsonObject)
            .await
            .map_err(|err| match err {
                LlmError::InvalidResponse(detail) => ScoreError::MalformedResponse(detail),
                other => ScoreError::Service(other.to_string()),
            })?;

        if let Some(usage) = &response.usage {
            debug!(
                target = "peddler.llm",
                listing_id = listing.id,
                buyer_id = buyer.id,
                prompt_tokens = usage.prompt_tokens.unwrap_or(0),
                completion_tokens = usage.completion_tokens.unwrap_or(0),
                "score_call_usage"
            );
        }

        let score = parse_score(&response.text)?;
        Ok(RelevanceResult {
            listing_id: listing.id,
            buyer_id: buyer.id,
            buyer_name: buyer.name.clone(),
            score,
        })
    }
}

/// Strict read of the model's answer. Accepts `{"score": N}` or a bare
/// integer; anything else, a fractional value, or a value outside 1..=10 is
/// rejected rather than clamped.
fn parse_score(raw: &str) -> Result<u8, ScoreError> {
    let cleaned = strip_markdown_fence(raw);
    let value: Value = serde_json::from_str(cleaned.trim())
        .map_err(|_| ScoreError::MalformedResponse(format!("not json: {}", preview(&cleaned))))?;

    let field = match &value {
        Value::Object(map) => map
            .get("score")
            .cloned()
            .ok_or_else(|| ScoreError::MalformedResponse("missing `score` field".into()))?,
        other => other.clone(),
    };

    let score = field
        .as_i64()
        .ok_or_else(|| ScoreError::MalformedResponse(format!("score is not an integer: {field}")))?;

    if !(1..=10).contains(&score) {
        return Err(ScoreError::MalformedResponse(format!(
            "score {score} outside 1..=10"
        )));
    }

    Ok(score as u8)
}

fn preview(text: &str) -> String {
    text.chars().take(48).collect()
}
