use crate::matching::pairs::ScoringPair;
use crate::matching::scorer::{RelevanceResult, RelevanceScorer, ScoreError};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::warn;

/// Concurrency budget for one scoring batch: at most `max_in_flight` calls
/// against the backend at a time, each given `call_timeout` to answer.
#[derive(Debug, Clone, Copy)]
pub struct FanOutLimits {
    pub max_in_flight: usize,
    pub call_timeout: Duration,
}

impl Default for FanOutLimits {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl FanOutLimits {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_in_flight = std::env::var("SCORING_MAX_IN_FLIGHT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(defaults.max_in_flight);
        let call_timeout = std::env::var("SCORING_CALL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 1)
            .map(Duration::from_secs)
            .unwrap_or(defaults.call_timeout);
        Self {
            max_in_flight,
            call_timeout,
        }
    }
}

/// A batch that was abandoned because one pair could not be scored. Carries
/// enough identity to say exactly which pair sank it.
#[derive(Debug, Error)]
#[error(
    "scoring aborted at pair {pair_index} (listing {listing_id}, buyer {buyer_id} `{buyer_name}`): {source}"
)]
pub struct BatchFailure {
    pub pair_index: usize,
    pub listing_id: i64,
    pub buyer_id: i64,
    pub buyer_name: String,
    #[source]
    pub source: ScoreError,
}

/// Scores every pair, keeping at most `limits.max_in_flight` calls running at
/// once. Results come back in pair-enumeration order no matter how the calls
/// interleave. The first failed call aborts the whole batch: in-flight
/// siblings are dropped and pairs not yet started are never issued.
pub async fn score_batch(
    scorer: &dyn RelevanceScorer,
    pairs: &[ScoringPair],
    limits: FanOutLimits,
) -> Result<Vec<RelevanceResult>, BatchFailure> {
    if pairs.is_empty() {
        return Ok(Vec::new());
    }

    // Owned pairs keep the per-call futures free of the input slice lifetime.
    let owned = pairs.to_vec();
    let mut scored: Vec<(usize, RelevanceResult)> = stream::iter(owned.into_iter().enumerate())
        .map(|(index, pair)| async move {
            let outcome = match timeout(
                limits.call_timeout,
                scorer.score(&pair.listing, &pair.buyer),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ScoreError::Service(format!(
                    "no answer within {:?}",
                    limits.call_timeout
                ))),
            };
            outcome.map(|result| (index, result)).map_err(|source| {
                warn!(
                    target = "peddler.match",
                    pair_index = index,
                    listing_id = pair.listing.id,
                    buyer_id = pair.buyer.id,
                    error = %source,
                    "scoring_call_failed"
                );
                BatchFailure {
                    pair_index: index,
                    listing_id: pair.listing.id,
                    buyer_id: pair.buyer.id,
                    buyer_name: pair.buyer.name.clone(),
                    source,
                }
            })
        })
        .buffer_unordered(limits.max_in_flight.max(1))
        .try_collect()
        .await?;

    scored.sort_unstable_by_key(|(index, _)| *index);
    Ok(scored.into_iter().map(|(_, result)| result).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::pairs::enumerate_pairs;
    use crate::models::{Buyer, Listing};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn listing(id: i64) -> Listing {
        Listing {
            id,
            seller: "pat".to_string(),
            title: format!("Item {id}"),
            description: "well kept".to_string(),
            price: 15.0,
            location: "Austin".to_string(),
        }
    }

    fn buyer(id: i64) -> Buyer {
        Buyer {
            id,
            name: format!("Buyer {id}"),
            preferences: vec!["anything".to_string()],
        }
    }

    /// Scorer that sleeps instead of calling a backend and keeps counters of
    /// how many calls started and how many ran at once.
    struct StubScorer {
        delay: Duration,
        stagger: bool,
        fail_pair: Option<(i64, i64)>,
        started: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl StubScorer {
        fn new(delay_ms: u64) -> Self {
            Self {
                delay: Duration::from_millis(delay_ms),
                stagger: false,
                fail_pair: None,
                started: Arc::new(AtomicUsize::new(0)),
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn staggered(mut self) -> Self {
            self.stagger = true;
            self
        }

        fn failing_on(mut self, listing_id: i64, buyer_id: i64) -> Self {
            self.fail_pair = Some((listing_id, buyer_id));
            self
        }
    }

    #[async_trait]
    impl RelevanceScorer for StubScorer {
        async fn score(
            &self,
            listing: &Listing,
            buyer: &Buyer,
        ) -> Result<RelevanceResult, ScoreError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);

            let mut delay = self.delay;
            if self.stagger && (listing.id + buyer.id) % 2 == 0 {
                delay *= 3;
            }
            tokio::time::sleep(delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail_pair == Some((listing.id, buyer.id)) {
                return Err(ScoreError::Service("stub outage".into()));
            }
            Ok(RelevanceResult {
                listing_id: listing.id,
                buyer_id: buyer.id,
                buyer_name: buyer.name.clone(),
                score: ((listing.id + buyer.id) % 10 + 1) as u8,
            })
        }
    }

    fn limits(max_in_flight: usize, timeout_ms: u64) -> FanOutLimits {
        FanOutLimits {
            max_in_flight,
            call_timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn results_follow_pair_order_despite_interleaving() {
        let listings: Vec<_> = (1..=3).map(listing).collect();
        let buyers: Vec<_> = (10..=11).map(buyer).collect();
        let pairs = enumerate_pairs(&listings, &buyers);
        let stub = StubScorer::new(5).staggered();

        let results = score_batch(&stub, &pairs, limits(6, 5_000))
            .await
            .expect("batch");

        assert_eq!(results.len(), pairs.len());
        for (result, pair) in results.iter().zip(pairs.iter()) {
            assert_eq!(result.listing_id, pair.listing.id);
            assert_eq!(result.buyer_id, pair.buyer.id);
            assert_eq!(result.buyer_name, pair.buyer.name);
        }
    }

    #[tokio::test]
    async fn one_listing_two_buyers_issues_exactly_two_calls() {
        let listings = vec![listing(1)];
        let buyers = vec![buyer(10), buyer(11)];
        let pairs = enumerate_pairs(&listings, &buyers);
        let stub = StubScorer::new(5);

        let results = score_batch(&stub, &pairs, limits(4, 5_000))
            .await
            .expect("batch");

        assert_eq!(stub.started.load(Ordering::SeqCst), 2);
        assert_eq!(results.len(), 2);
        assert_eq!(
            (results[0].buyer_id, results[0].buyer_name.as_str()),
            (10, "Buyer 10")
        );
        assert_eq!(
            (results[1].buyer_id, results[1].buyer_name.as_str()),
            (11, "Buyer 11")
        );
    }

    #[tokio::test]
    async fn empty_batch_makes_no_calls() {
        let stub = StubScorer::new(5);
        let results = score_batch(&stub, &[], limits(4, 5_000))
            .await
            .expect("batch");
        assert!(results.is_empty());
        assert_eq!(stub.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn in_flight_calls_never_exceed_ceiling() {
        let listings: Vec<_> = (1..=9).map(listing).collect();
        let buyers = vec![buyer(20)];
        let pairs = enumerate_pairs(&listings, &buyers);
        let stub = StubScorer::new(30);

        let results = score_batch(&stub, &pairs, limits(3, 5_000))
            .await
            .expect("batch");

        assert_eq!(results.len(), 9);
        assert_eq!(stub.started.load(Ordering::SeqCst), 9);
        let peak = stub.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak} exceeded ceiling");
        assert!(peak >= 2, "fan-out never ran calls in parallel");
    }

    #[tokio::test]
    async fn ceiling_forces_sequential_waves() {
        let listings: Vec<_> = (1..=4).map(listing).collect();
        let buyers = vec![buyer(20)];
        let pairs = enumerate_pairs(&listings, &buyers);
        let stub = StubScorer::new(60);

        let started_at = Instant::now();
        score_batch(&stub, &pairs, limits(2, 5_000))
            .await
            .expect("batch");
        let elapsed = started_at.elapsed();

        assert!(
            elapsed >= Duration::from_millis(110),
            "4 calls of 60ms under a ceiling of 2 finished in {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn first_failure_aborts_and_cancels_the_rest() {
        let listings: Vec<_> = (1..=8).map(listing).collect();
        let buyers = vec![buyer(10)];
        let pairs = enumerate_pairs(&listings, &buyers);
        let stub = StubScorer::new(40).failing_on(3, 10);

        let failure = score_batch(&stub, &pairs, limits(2, 5_000))
            .await
            .expect_err("batch should abort");

        assert_eq!(failure.pair_index, 2);
        assert_eq!(failure.listing_id, 3);
        assert_eq!(failure.buyer_id, 10);
        assert_eq!(failure.buyer_name, "Buyer 10");
        assert!(matches!(failure.source, ScoreError::Service(_)));

        let started = stub.started.load(Ordering::SeqCst);
        assert!(started < pairs.len(), "all pairs were issued before abort");

        // Dropped futures never resume, so the counter must not move again.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(stub.started.load(Ordering::SeqCst), started);
    }

    #[tokio::test]
    async fn slow_call_hits_the_deadline() {
        let listings = vec![listing(1)];
        let buyers = vec![buyer(10)];
        let pairs = enumerate_pairs(&listings, &buyers);
        let stub = StubScorer::new(200);

        let failure = score_batch(&stub, &pairs, limits(2, 30))
            .await
            .expect_err("deadline should trip");

        assert_eq!(failure.pair_index, 0);
        assert!(matches!(failure.source, ScoreError::Service(_)));
    }
}
