pub mod fanout;
pub mod pairs;
pub mod scorer;
pub mod sink;

pub use fanout::{BatchFailure, FanOutLimits, score_batch};
pub use pairs::enumerate_pairs;
pub use scorer::{LlmRelevanceScorer, RelevanceResult, RelevanceScorer};
pub use sink::{LogSink, ResultSink};
