use crate::models::{Buyer, Listing};

/// One unit of scoring work: a single listing put in front of a single buyer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringPair {
    pub listing: Listing,
    pub buyer: Buyer,
}

/// Expands listings and buyers into their full cross product, listing-major:
/// every buyer for the first listing, then every buyer for the second, and so
/// on. Pair `i * buyers.len() + j` is `(listings[i], buyers[j])`. Either
/// input being empty yields no pairs.
pub fn enumerate_pairs(listings: &[Listing], buyers: &[Buyer]) -> Vec<ScoringPair> {
    let mut pairs = Vec::with_capacity(listings.len() * buyers.len());
    for listing in listings {
        for buyer in buyers {
            pairs.push(ScoringPair {
                listing: listing.clone(),
                buyer: buyer.clone(),
            });
        }
    }
    pairs
}
