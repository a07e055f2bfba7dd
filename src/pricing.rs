use crate::llm::{ChatMessage, LlmClient, OutputFormat, strip_markdown_fence};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PRICE_SYSTEM_PROMPT: &str = r#"
You estimate secondhand marketplace prices. Given a short item description,
respond with a valid JSON object with keys `min_price` and `max_price`, both
numbers in US dollars for a realistic private-sale range. Output JSON only.
"#;

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("price estimation call failed: {0}")]
    Llm(String),
    #[error("unable to parse price range: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min_price: f64,
    pub max_price: f64,
}

pub async fn suggest_price_range(llm: &LlmClient, query: &str) -> Result<PriceRange, PricingError> {
    let messages = vec![
        ChatMessage::text("system", PRICE_SYSTEM_PROMPT),
        ChatMessage::text("user", query),
    ];

    let response = llm
        .chat(&messages, OutputFormat::JsonObject)
        .await
        .map_err(|err| PricingError::Llm(err.to_string()))?;

    parse_price_range(&response.text)
}

pub(crate) fn parse_price_range(raw: &str) -> Result<PriceRange, PricingError> {
    let cleaned = strip_markdown_fence(raw);
    let range: PriceRange = serde_json::from_str(cleaned.trim())
        .map_err(|err| PricingError::Parse(err.to_string()))?;

    if !range.min_price.is_finite() || !range.max_price.is_finite() {
        return Err(PricingError::Parse("non-finite bound".into()));
    }
    if range.min_price < 0.0 {
        return Err(PricingError::Parse(format!(
            "negative lower bound {}",
            range.min_price
        )));
    }
    if range.max_price < range.min_price {
        return Err(PricingError::Parse(format!(
            "inverted range {}..{}",
            range.min_price, range.max_price
        )));
    }
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_range() {
        let range = parse_price_range(r#"{"min_price": 40, "max_price": 75.5}"#).expect("range");
        assert_eq!(
            range,
            PriceRange {
                min_price: 40.0,
                max_price: 75.5
            }
        );
    }

    #[test]
    fn parses_fenced_range() {
        let raw = "```json\n{\"min_price\": 10, \"max_price\": 20}\n```";
        let range = parse_price_range(raw).expect("range");
        assert_eq!(range.min_price, 10.0);
        assert_eq!(range.max_price, 20.0);
    }

    #[test]
    fn rejects_inverted_range() {
        let err = parse_price_range(r#"{"min_price": 50, "max_price": 20}"#).unwrap_err();
        assert!(err.to_string().contains("inverted"));
    }

    #[test]
    fn rejects_negative_bound() {
        assert!(parse_price_range(r#"{"min_price": -5, "max_price": 20}"#).is_err());
    }

    #[test]
    fn rejects_prose() {
        assert!(parse_price_range("somewhere between 10 and 20 dollars").is_err());
    }
}
