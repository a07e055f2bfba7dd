use tracing::trace;

// Lightweight metrics helpers that are safe in demo builds.
// These intentionally avoid pulling in metrics macros to keep deps stable.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "peddler.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "peddler.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn batch_scored(pairs: usize, elapsed_ms: u128) {
    trace!(
        target = "peddler.metrics",
        pairs = pairs,
        elapsed_ms = elapsed_ms as u64,
        "relevance_batch_scored"
    );
}
