use crate::http::build_client;
use once_cell::sync::Lazy;
use std::env;
use thiserror::Error;

pub static STRIPE_API_BASE: Lazy<String> =
    Lazy::new(|| env::var("STRIPE_API_BASE").unwrap_or_else(|_| "https://api.stripe.com/v1".to_string()));

static SECRET_KEY: Lazy<String> = Lazy::new(|| env::var("STRIPE_SECRET_KEY").unwrap_or_default());

pub static DEFAULT_CURRENCY: Lazy<String> =
    Lazy::new(|| env::var("STRIPE_CURRENCY").unwrap_or_else(|_| "usd".to_string()));

#[derive(Debug, Error)]
pub enum StripeError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("stripe secret key is not configured")]
    MissingCredentials,
}

pub fn configured() -> bool {
    !SECRET_KEY.trim().is_empty()
}

/// Stripe prices are integer minor units.
pub fn amount_in_cents(price: f64) -> i64 {
    (price * 100.0).round() as i64
}

fn secret_key() -> Result<&'static str, StripeError> {
    let key = SECRET_KEY.trim();
    if key.is_empty() {
        return Err(StripeError::MissingCredentials);
    }
    Ok(key)
}

async fn post_form<T: serde::de::DeserializeOwned>(
    path: &str,
    params: &[(&str, String)],
) -> Result<T, StripeError> {
    let client = build_client();
    let url = format!("{}/{path}", *STRIPE_API_BASE);
    let response = client
        .post(url)
        .bearer_auth(secret_key()?)
        .form(params)
        .send()
        .await
        .map_err(|err| StripeError::Request(err.to_string()))?;
    if !response.status().is_success() {
        return Err(StripeError::Request(format!("HTTP {}", response.status())));
    }
    response
        .json()
        .await
        .map_err(|err| StripeError::Request(err.to_string()))
}

pub async fn create_product(name: &str) -> Result<String, StripeError> {
    #[derive(serde::Deserialize)]
    struct ProductResponse {
        id: String,
    }
    let payload: ProductResponse =
        post_form("products", &[("name", name.to_string())]).await?;
    Ok(payload.id)
}

pub async fn create_price(
    product_id: &str,
    amount_cents: i64,
    currency: &str,
) -> Result<String, StripeError> {
    #[derive(serde::Deserialize)]
    struct PriceResponse {
        id: String,
    }
    let payload: PriceResponse = post_form(
        "prices",
        &[
            ("product", product_id.to_string()),
            ("unit_amount", amount_cents.to_string()),
            ("currency", currency.to_string()),
        ],
    )
    .await?;
    Ok(payload.id)
}

pub(crate) fn payment_link_params(price_id: &str) -> Vec<(&'static str, String)> {
    vec![
        ("line_items[0][price]", price_id.to_string()),
        ("line_items[0][quantity]", "1".to_string()),
    ]
}

pub async fn create_payment_link(price_id: &str) -> Result<String, StripeError> {
    #[derive(serde::Deserialize)]
    struct PaymentLinkResponse {
        url: String,
    }
    let payload: PaymentLinkResponse =
        post_form("payment_links", &payment_link_params(price_id)).await?;
    Ok(payload.url)
}

/// Product, price, and shareable link in one go.
pub async fn payment_link_for(
    title: &str,
    price: f64,
    currency: &str,
) -> Result<String, StripeError> {
    let product_id = create_product(title).await?;
    let price_id = create_price(&product_id, amount_in_cents(price), currency).await?;
    create_payment_link(&price_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_prices_to_cents() {
        assert_eq!(amount_in_cents(19.99), 1999);
        assert_eq!(amount_in_cents(120.0), 12000);
        assert_eq!(amount_in_cents(0.99), 99);
        assert_eq!(amount_in_cents(0.0), 0);
    }

    #[test]
    fn payment_link_params_use_indexed_form_keys() {
        let params = payment_link_params("price_123");
        assert_eq!(
            params,
            vec![
                ("line_items[0][price]", "price_123".to_string()),
                ("line_items[0][quantity]", "1".to_string()),
            ]
        );
    }
}
