use crate::http::build_client;
use crate::models::{Buyer, Listing};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_with::{DefaultOnNull, serde_as, skip_serializing_none};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Row of the `listings` table. `image_encoding` holds the seller photo as
/// base64 and is only selected where a caller actually needs it. PostgREST
/// serves NULL columns as explicit `null`, so `description` parses that too.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingRow {
    pub id: i64,
    pub username: String,
    pub title: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub description: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_link: Option<String>,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        Listing {
            id: row.id,
            seller: row.username,
            title: row.title,
            description: row.description,
            price: row.price,
            location: row.location.unwrap_or_default(),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct NewListingRow {
    pub username: String,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub location: Option<String>,
    pub image_encoding: Option<String>,
    pub payment_link: Option<String>,
}

const MATCHING_COLUMNS: &str = "id,username,title,description,price,location";

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    /// All listings a merchant has published, without the image payloads.
    pub async fn fetch_listings(&self, seller: &str) -> Result<Vec<Listing>, SupabaseError> {
        let url = format!(
            "{}/rest/v1/listings?username=eq.{}&select={}&order=id.asc",
            self.base_url,
            urlencoding::encode(seller),
            MATCHING_COLUMNS,
        );
        let rows: Vec<ListingRow> = self.get_json(&url).await?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }

    pub async fn fetch_buyers(&self) -> Result<Vec<Buyer>, SupabaseError> {
        let url = format!(
            "{}/rest/v1/buyers?select=id,name,preferences&order=id.asc",
            self.base_url,
        );
        self.get_json(&url).await
    }

    /// Full catalog dump, photos included.
    pub async fn list_listings(&self) -> Result<Vec<ListingRow>, SupabaseError> {
        let url = format!("{}/rest/v1/listings?select=*&order=id.asc", self.base_url);
        self.get_json(&url).await
    }

    pub async fn insert_listing(&self, row: &NewListingRow) -> Result<ListingRow, SupabaseError> {
        let url = format!("{}/rest/v1/listings", self.base_url);
        let response = self
            .authed(self.http.post(url))
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let mut payload: Vec<ListingRow> = response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))?;
        payload
            .pop()
            .ok_or_else(|| SupabaseError::Deserialize("insert returned no row".into()))
    }

    pub async fn set_payment_link(&self, listing_id: i64, link: &str) -> Result<(), SupabaseError> {
        let url = format!(
            "{}/rest/v1/listings?id=eq.{listing_id}",
            self.base_url
        );
        let response = self
            .authed(self.http.patch(url))
            .json(&serde_json::json!({ "payment_link": link }))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, SupabaseError> {
        let response = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }
}
