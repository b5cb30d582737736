use bacon_core::payout::{self, Cents, RewardRate};
use bacon_core::CoreError;
use serde::{Deserialize, Serialize};

use crate::types::{ChainId, ListingId, ReferralLink, UserId};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayoutLine {
    pub degree: u8,
    pub referrer_id: UserId,
    pub weight_bps: u32,
    pub amount: Cents,
}

/// Payout record for one completed sale. Written once, never mutated.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaconDistribution {
    pub chain_id: ChainId,
    pub listing_id: ListingId,
    pub sale_price: Cents,
    pub reward: RewardRate,
    pub pool: Cents,
    pub lines: Vec<PayoutLine>,
    /// Routed to the overflow fund.
    pub unallocated: Cents,
    pub computed_at_ms: u64,
}

impl BaconDistribution {
    pub fn distributed(&self) -> Cents {
        self.lines.iter().map(|l| l.amount).sum()
    }
}

/// Compute the distribution for a sale over the chain's current links.
pub fn distribute(
    chain_id: ChainId,
    listing_id: &str,
    sale_price: Cents,
    reward: RewardRate,
    links: &[ReferralLink],
    computed_at_ms: u64,
) -> Result<BaconDistribution, CoreError> {
    let degrees: Vec<u8> = links.iter().map(|l| l.degree).collect();
    let split = payout::distribute(sale_price, reward, &degrees)?;
    let lines = split
        .shares
        .iter()
        .filter_map(|share| {
            links
                .iter()
                .find(|l| l.degree == share.degree)
                .map(|link| PayoutLine {
                    degree: share.degree,
                    referrer_id: link.referrer_id.clone(),
                    weight_bps: share.weight_bps,
                    amount: share.amount,
                })
        })
        .collect();
    Ok(BaconDistribution {
        chain_id,
        listing_id: listing_id.to_string(),
        sale_price,
        reward,
        pool: split.pool,
        lines,
        unallocated: split.unallocated,
        computed_at_ms,
    })
}
