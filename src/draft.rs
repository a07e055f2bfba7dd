use crate::llm::{ChatMessage, LlmClient, OutputFormat, strip_markdown_fence};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const DRAFT_SYSTEM_PROMPT: &str = r#"
You write marketplace listings from a single product photo. Respond with a
valid JSON object with keys `title`, `description`, `price`, and `location`.
`price` is a number in US dollars without a currency sign. Keep the title
under 80 characters and the description to a few sentences a private seller
would write. Output JSON only.
"#;

#[derive(Debug, Error)]
pub enum DraftError {
    #[error("vision call failed: {0}")]
    Llm(String),
    #[error("unable to parse listing draft: {0}")]
    Parse(String),
}

/// Listing fields ready for persistence, extracted from the photo or carried
/// over from the seller's form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftListing {
    pub title: String,
    pub description: String,
    pub price: f64,
    #[serde(default)]
    pub location: Option<String>,
}

/// What the seller typed in alongside the photo. Anything present here wins
/// over what the vision model extracts.
#[derive(Debug, Clone, Default)]
pub struct SellerFields {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub location: Option<String>,
}

impl SellerFields {
    /// A draft needs a title, a description, and a positive price. When the
    /// seller supplied all three the vision model has nothing left to add.
    pub fn complete_draft(&self) -> Option<DraftListing> {
        let title = non_empty(self.title.as_deref())?;
        let description = non_empty(self.description.as_deref())?;
        let price = self.price.filter(|p| p.is_finite() && *p > 0.0)?;
        Some(DraftListing {
            title,
            description,
            price,
            location: non_empty(self.location.as_deref()),
        })
    }
}

pub async fn infer_draft(
    llm: &LlmClient,
    image_data_url: &str,
    seller: &SellerFields,
) -> Result<DraftListing, DraftError> {
    let mut instruction = String::from("Draft the listing for the attached photo.");
    if let Some(title) = non_empty(seller.title.as_deref()) {
        instruction.push_str(&format!(" The seller already titled it `{title}`; keep that."));
    }
    if let Some(location) = non_empty(seller.location.as_deref()) {
        instruction.push_str(&format!(" It is located in {location}."));
    }
    if let Some(price) = seller.price.filter(|p| p.is_finite() && *p > 0.0) {
        instruction.push_str(&format!(" The asking price is {price}."));
    }

    let messages = vec![
        ChatMessage::text("system", DRAFT_SYSTEM_PROMPT),
        ChatMessage::user_with_image(instruction, image_data_url),
    ];

    let response = llm
        .chat(&messages, OutputFormat::JsonObject)
        .await
        .map_err(|err| DraftError::Llm(err.to_string()))?;

    let mut draft = parse_draft(&response.text)?;
    apply_seller_fields(&mut draft, seller);
    validate_draft(&draft)?;
    Ok(draft)
}

/// Shape-level read of the model output. Semantic checks happen after the
/// seller's fields are applied on top.
pub(crate) fn parse_draft(raw: &str) -> Result<DraftListing, DraftError> {
    let cleaned = strip_markdown_fence(raw);
    let mut value: Value =
        serde_json::from_str(cleaned.trim()).map_err(|err| DraftError::Parse(err.to_string()))?;
    normalize_draft_value(&mut value);
    serde_json::from_value(value).map_err(|err| DraftError::Parse(err.to_string()))
}

pub(crate) fn apply_seller_fields(draft: &mut DraftListing, seller: &SellerFields) {
    if let Some(title) = non_empty(seller.title.as_deref()) {
        draft.title = title;
    }
    if let Some(description) = non_empty(seller.description.as_deref()) {
        draft.description = description;
    }
    if let Some(price) = seller.price.filter(|p| p.is_finite() && *p > 0.0) {
        draft.price = price;
    }
    if let Some(location) = non_empty(seller.location.as_deref()) {
        draft.location = Some(location);
    }
}

pub(crate) fn validate_draft(draft: &DraftListing) -> Result<(), DraftError> {
    if draft.title.trim().is_empty() {
        return Err(DraftError::Parse("empty title".into()));
    }
    if draft.description.trim().is_empty() {
        return Err(DraftError::Parse("empty description".into()));
    }
    if !draft.price.is_finite() || draft.price <= 0.0 {
        return Err(DraftError::Parse(format!(
            "price must be positive, got {}",
            draft.price
        )));
    }
    Ok(())
}

// Models occasionally pad text fields or quote the price. Trim the strings
// and coerce a numeric price string back to a number before the typed parse.
fn normalize_draft_value(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    for field in ["title", "description"] {
        let trimmed = obj
            .get(field)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string());
        if let Some(text) = trimmed {
            obj.insert(field.into(), Value::String(text));
        }
    }
    let coerced_price = match obj.get("price") {
        Some(Value::String(raw)) => raw.trim().trim_start_matches('$').parse::<f64>().ok(),
        _ => None,
    };
    if let Some(parsed) = coerced_price {
        obj.insert("price".into(), Value::from(parsed));
    }
    let blank_location = obj
        .get("location")
        .and_then(Value::as_str)
        .is_some_and(|s| s.trim().is_empty());
    if blank_location {
        obj.insert("location".into(), Value::Null);
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
