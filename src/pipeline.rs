use crate::draft::{DraftListing, SellerFields, infer_draft};
use crate::llm::{LlmClient, LlmConfig};
use crate::models::{CreateListingRequest, ListingResponse, StageReport};
use crate::security::AuthContext;
use crate::stripe;
use crate::supabase::{NewListingRow, SupabaseClient};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::Serialize;
use serde_json::{Value, json};
use std::{env, future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct Pipeline {
    pub llm: Arc<LlmClient>,
    supabase: Option<SupabaseClient>,
    payments_enabled: bool,
}

impl Pipeline {
    pub fn new(
        llm: Arc<LlmClient>,
        supabase: Option<SupabaseClient>,
        payments_enabled: bool,
    ) -> Self {
        Self {
            llm,
            supabase,
            payments_enabled,
        }
    }

    pub fn from_env() -> Self {
        let llm = Arc::new(LlmClient::new(LlmConfig::from_env()));
        let supabase = SupabaseClient::from_env();
        Self::new(llm, supabase, stripe::configured())
    }

    pub fn store(&self) -> Option<&SupabaseClient> {
        self.supabase.as_ref()
    }

    pub async fn run(
        &self,
        request: CreateListingRequest,
        auth: Option<AuthContext>,
    ) -> Result<ListingResponse, PipelineError> {
        let mut stages = Vec::new();
        let seller = auth
            .as_ref()
            .map(|ctx| ctx.merchant_id.clone())
            .unwrap_or_else(|| "demo-merchant".to_string());
        let seller_fields = SellerFields {
            title: request.title.clone(),
            description: request.description.clone(),
            price: request.price,
            location: request.location.clone(),
        };

        let image = self
            .capture_stage("decode_image", &mut stages, {
                let raw = request.image.clone();
                async move { stages::decode_image(&raw) }
            })
            .await?;

        let draft = self
            .capture_stage("draft_listing", &mut stages, {
                let llm = self.llm.clone();
                let image = image.clone();
                let seller_fields = seller_fields.clone();
                async move { stages::draft_listing(&llm, &image, &seller_fields).await }
            })
            .await?;

        if request.dry_run {
            return Ok(ListingResponse {
                listing_id: format!("PREVIEW-{}", Uuid::new_v4().simple()),
                payment_link: None,
                stages,
            });
        }

        let stored = self
            .capture_stage("persist_listing", &mut stages, {
                let store = self.supabase.clone();
                let seller = seller.clone();
                let draft = draft.clone();
                let image = image.clone();
                async move { stages::persist_listing(store.as_ref(), &seller, &draft, &image).await }
            })
            .await?;

        let payment_link = self
            .capture_stage("create_payment_link", &mut stages, {
                let store = self.supabase.clone();
                let enabled = self.payments_enabled;
                let draft = draft.clone();
                let stored = stored.clone();
                async move {
                    stages::create_payment_link(store.as_ref(), enabled, &draft, &stored).await
                }
            })
            .await?;

        Ok(ListingResponse {
            listing_id: stored.listing_id,
            payment_link,
            stages,
        })
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        // Lightweight metrics: stage elapsed (trace-based)
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

/// Decoded seller photo, kept both as raw base64 for storage and as a data
/// URL for vision calls.
#[derive(Debug, Clone, Serialize)]
pub struct ImagePayload {
    pub data_url: String,
    pub base64: String,
    pub mime: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredListing {
    pub listing_id: String,
    pub row_id: Option<i64>,
}

pub mod stages {
    use super::*;

    pub(super) fn decode_image(raw: &str) -> Result<StageOutcome<ImagePayload>, PipelineError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PipelineError::invalid_input(
                "decode_image",
                "empty image payload",
            ));
        }

        let (mime, payload) = match raw.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest.split_once(',').ok_or_else(|| {
                    PipelineError::invalid_input("decode_image", "malformed data url")
                })?;
                if !header.contains("base64") {
                    return Err(PipelineError::invalid_input(
                        "decode_image",
                        "unsupported data url encoding",
                    ));
                }
                let mime = header
                    .split(';')
                    .next()
                    .filter(|value| !value.is_empty())
                    .unwrap_or("image/jpeg");
                (mime.to_string(), payload)
            }
            None => ("image/jpeg".to_string(), raw),
        };

        let compact: String = payload.chars().filter(|ch| !ch.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(PipelineError::invalid_input(
                "decode_image",
                "empty image payload",
            ));
        }

        let decoded = BASE64
            .decode(compact.as_bytes())
            .map_err(|_| PipelineError::invalid_input("decode_image", "invalid base64 payload"))?;
        if decoded.is_empty() {
            return Err(PipelineError::invalid_input(
                "decode_image",
                "empty image payload",
            ));
        }
        if decoded.len() > max_image_bytes() {
            return Err(PipelineError::invalid_input("decode_image", "image_too_large"));
        }

        let image = ImagePayload {
            data_url: format!("data:{mime};base64,{compact}"),
            base64: compact,
            mime,
            bytes: decoded.len(),
        };
        Ok(StageOutcome::new(
            image.clone(),
            json!({
                "mime": image.mime,
                "bytes": image.bytes,
            }),
        ))
    }

    pub(super) async fn draft_listing(
        llm: &LlmClient,
        image: &ImagePayload,
        seller: &SellerFields,
    ) -> Result<StageOutcome<DraftListing>, PipelineError> {
        if let Some(draft) = seller.complete_draft() {
            return Ok(StageOutcome::new(
                draft.clone(),
                json!({
                    "title": draft.title,
                    "price": draft.price,
                    "location": draft.location,
                    "source": "seller",
                }),
            ));
        }

        let draft = infer_draft(llm, &image.data_url, seller)
            .await
            .map_err(|err| PipelineError::internal("draft_listing", err.to_string()))?;

        Ok(StageOutcome::new(
            draft.clone(),
            json!({
                "title": draft.title,
                "price": draft.price,
                "location": draft.location,
                "model": llm.model(),
                "source": "vision",
            }),
        ))
    }

    pub(super) async fn persist_listing(
        store: Option<&SupabaseClient>,
        seller: &str,
        draft: &DraftListing,
        image: &ImagePayload,
    ) -> Result<StageOutcome<StoredListing>, PipelineError> {
        let Some(client) = store else {
            let stored = StoredListing {
                listing_id: format!("PED-{}", Uuid::new_v4().simple()),
                row_id: None,
            };
            return Ok(StageOutcome::new(
                stored.clone(),
                json!({
                    "listing_id": stored.listing_id,
                    "status": "skipped_no_store",
                }),
            ));
        };

        let row = NewListingRow {
            username: seller.to_string(),
            title: draft.title.clone(),
            description: draft.description.clone(),
            price: draft.price,
            location: draft.location.clone(),
            image_encoding: Some(image.base64.clone()),
            payment_link: None,
        };
        let inserted = client
            .insert_listing(&row)
            .await
            .map_err(|err| PipelineError::internal("persist_listing", err.to_string()))?;

        let stored = StoredListing {
            listing_id: inserted.id.to_string(),
            row_id: Some(inserted.id),
        };
        Ok(StageOutcome::new(
            stored.clone(),
            json!({
                "listing_id": stored.listing_id,
                "seller": seller,
                "status": "inserted",
            }),
        ))
    }

    pub(super) async fn create_payment_link(
        store: Option<&SupabaseClient>,
        enabled: bool,
        draft: &DraftListing,
        stored: &StoredListing,
    ) -> Result<StageOutcome<Option<String>>, PipelineError> {
        if !enabled {
            return Ok(StageOutcome::new(
                None,
                json!({ "status": "skipped_no_payments" }),
            ));
        }

        let link = stripe::payment_link_for(
            &draft.title,
            draft.price,
            stripe::DEFAULT_CURRENCY.as_str(),
        )
        .await
        .map_err(|err| PipelineError::internal("create_payment_link", err.to_string()))?;

        if let (Some(client), Some(row_id)) = (store, stored.row_id)
            && let Err(err) = client.set_payment_link(row_id, &link).await
        {
            warn!(target = "peddler.store", listing_id = row_id, error = %err, "payment_link_save_failed");
        }

        Ok(StageOutcome::new(
            Some(link.clone()),
            json!({
                "link": link,
                "status": "created",
            }),
        ))
    }
}

fn max_image_bytes() -> usize {
    env::var("MAX_IMAGE_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(5 * 1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_pipeline() -> Pipeline {
        let config = LlmConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            realtime_model: "gpt-4o-realtime-preview-2024-12-17".to_string(),
            realtime_voice: "verse".to_string(),
        };
        Pipeline::new(Arc::new(LlmClient::new(config)), None, false)
    }

    fn encoded_photo() -> String {
        BASE64.encode(b"not a real jpeg, close enough for the decoder")
    }

    fn sample_request() -> CreateListingRequest {
        CreateListingRequest {
            image: encoded_photo(),
            title: Some("Vintage Road Bike".to_string()),
            description: Some("Steel frame, rides smooth.".to_string()),
            price: Some(150.0),
            location: Some("Austin".to_string()),
            dry_run: false,
        }
    }

    #[test]
    fn decode_accepts_raw_base64() {
        let out = stages::decode_image(&encoded_photo()).expect("decode");
        assert_eq!(out.value.mime, "image/jpeg");
        assert!(out.value.data_url.starts_with("data:image/jpeg;base64,"));
        assert!(out.value.bytes > 0);
    }

    #[test]
    fn decode_accepts_data_url() {
        let raw = format!("data:image/png;base64,{}", encoded_photo());
        let out = stages::decode_image(&raw).expect("decode");
        assert_eq!(out.value.mime, "image/png");
        assert_eq!(out.value.data_url, raw);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = stages::decode_image("%%% not base64 %%%").expect_err("should reject");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(err.stage(), "decode_image");
    }

    #[test]
    fn decode_rejects_empty_payload() {
        let err = stages::decode_image("   ").expect_err("should reject");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn seller_fields_skip_the_vision_call() {
        let pipeline = offline_pipeline();
        let image = stages::decode_image(&encoded_photo()).expect("decode").value;
        let seller = SellerFields {
            title: Some("Desk".to_string()),
            description: Some("Oak, minor scratches.".to_string()),
            price: Some(40.0),
            location: None,
        };
        let out = stages::draft_listing(&pipeline.llm, &image, &seller)
            .await
            .expect("draft");
        assert_eq!(out.value.title, "Desk");
        assert_eq!(out.output["source"], json!("seller"));
    }

    #[tokio::test]
    async fn pipeline_run_stage_sequence() {
        let pipeline = offline_pipeline();
        let resp = pipeline
            .run(sample_request(), None)
            .await
            .expect("pipeline run");
        let names: Vec<String> = resp.stages.iter().map(|s| s.name.clone()).collect();
        assert_eq!(
            names,
            vec![
                "decode_image",
                "draft_listing",
                "persist_listing",
                "create_payment_link",
            ]
        );
        assert!(resp.listing_id.starts_with("PED-"));
        assert!(resp.payment_link.is_none());
    }

    #[tokio::test]
    async fn pipeline_dry_run_stops_after_draft() {
        let pipeline = offline_pipeline();
        let mut req = sample_request();
        req.dry_run = true;
        let resp = pipeline.run(req, None).await.expect("pipeline run");
        let names: Vec<String> = resp.stages.iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["decode_image", "draft_listing"]);
        assert!(resp.listing_id.starts_with("PREVIEW-"));
    }

    #[tokio::test]
    async fn missing_draft_material_fails_at_draft_stage() {
        let pipeline = offline_pipeline();
        let req = CreateListingRequest {
            image: encoded_photo(),
            title: None,
            description: None,
            price: None,
            location: None,
            dry_run: true,
        };
        let err = pipeline.run(req, None).await.expect_err("should fail");
        assert_eq!(err.stage(), "draft_listing");
        assert_eq!(err.kind(), PipelineErrorKind::Internal);
    }
}
