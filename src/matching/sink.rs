use crate::matching::scorer::RelevanceResult;
use async_trait::async_trait;
use tracing::info;

/// Terminal consumer for a fully scored batch.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn consume(&self, results: &[RelevanceResult]);
}

/// Writes one line per match to the log.
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn consume(&self, results: &[RelevanceResult]) {
        for result in results {
            info!(
                target = "peddler.match",
                listing_id = result.listing_id,
                buyer_id = result.buyer_id,
                buyer = %result.buyer_name,
                score = result.score,
                "buyer_match"
            );
        }
    }
}
