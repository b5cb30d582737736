use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::MAX_DEGREES;

/// Share of the pool paid to each degree, in basis points. Sums to 10 000.
pub const DEGREE_WEIGHTS_BPS: [u32; MAX_DEGREES as usize] = [5_000, 2_500, 1_000, 750, 500, 250];

const BPS_SCALE: u128 = 10_000;

/// Money in minor units (cents).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Cents(pub u64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    pub fn from_dollars(dollars: u64) -> Self {
        Cents(dollars.saturating_mul(100))
    }

    pub fn saturating_sub(self, other: Cents) -> Cents {
        Cents(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl std::iter::Sum for Cents {
    fn sum<I: Iterator<Item = Cents>>(iter: I) -> Self {
        Cents(iter.map(|c| c.0).sum())
    }
}

/// Fraction of a sale allocated to the referral pool, in basis points.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u32", into = "u32")]
pub struct RewardRate(u32);

impl RewardRate {
    pub fn from_bps(bps: u32) -> Result<Self, CoreError> {
        if bps as u128 > BPS_SCALE {
            return Err(CoreError::InvalidRewardRate { bps });
        }
        Ok(Self(bps))
    }

    pub fn from_percent(percent: u32) -> Result<Self, CoreError> {
        Self::from_bps(percent.saturating_mul(100))
    }

    pub fn bps(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for RewardRate {
    type Error = CoreError;

    fn try_from(bps: u32) -> Result<Self, Self::Error> {
        Self::from_bps(bps)
    }
}

impl From<RewardRate> for u32 {
    fn from(rate: RewardRate) -> u32 {
        rate.0
    }
}

/// Weight of `degree` in basis points of the pool.
pub fn degree_weight_bps(degree: u8) -> Option<u32> {
    if degree == 0 {
        return None;
    }
    DEGREE_WEIGHTS_BPS.get(degree as usize - 1).copied()
}

/// The referral pool for a sale: `sale * rate`, rounded down to the cent.
pub fn pool(sale_price: Cents, rate: RewardRate) -> Cents {
    let pool = sale_price.0 as u128 * rate.0 as u128 / BPS_SCALE;
    Cents(pool as u64)
}

/// Payout owed to one degree, computed from the pool alone.
pub fn degree_amount(pool: Cents, degree: u8) -> Option<Cents> {
    let weight = degree_weight_bps(degree)?;
    Some(Cents((pool.0 as u128 * weight as u128 / BPS_SCALE) as u64))
}

/// One computed line of a distribution.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DegreeShare {
    pub degree: u8,
    pub weight_bps: u32,
    pub amount: Cents,
}

/// Output of [`distribute`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Distribution {
    pub pool: Cents,
    pub shares: Vec<DegreeShare>,
    /// Share of unoccupied degrees plus rounding, routed to the overflow fund.
    /// Zero when all six degrees are occupied.
    pub unallocated: Cents,
}

impl Distribution {
    pub fn distributed(&self) -> Cents {
        self.shares.iter().map(|s| s.amount).sum()
    }
}

/// Split the pool of a sale across the occupied degrees.
///
/// The pool is computed once; every degree is then computed independently
/// from it and rounded down. Unoccupied degrees keep their share in
/// `unallocated` along with the rounding remainder, except on a full chain,
/// where the remainder is added to degree 1 so the lines sum to the pool.
pub fn distribute(
    sale_price: Cents,
    rate: RewardRate,
    occupied: &[u8],
) -> Result<Distribution, CoreError> {
    let pool = pool(sale_price, rate);
    let mut degrees = occupied.to_vec();
    degrees.sort_unstable();
    degrees.dedup();

    let mut shares = Vec::with_capacity(degrees.len());
    for degree in degrees {
        let weight_bps = degree_weight_bps(degree).ok_or(CoreError::InvalidDegree(degree))?;
        let amount = degree_amount(pool, degree).ok_or(CoreError::InvalidDegree(degree))?;
        shares.push(DegreeShare {
            degree,
            weight_bps,
            amount,
        });
    }
    let mut distributed: Cents = shares.iter().map(|s| s.amount).sum();
    if shares.len() == MAX_DEGREES as usize {
        // Every degree is occupied: the rounding remainder goes to degree 1.
        let dust = pool.saturating_sub(distributed);
        shares[0].amount = Cents(shares[0].amount.0 + dust.0);
        distributed = pool;
    }
    Ok(Distribution {
        pool,
        shares,
        unallocated: pool.saturating_sub(distributed),
    })
}

/// Preview of what `degree` would earn on a sale at `asking_price`.
pub fn potential_bacon(asking_price: Cents, rate: RewardRate, degree: u8) -> Option<Cents> {
    degree_amount(pool(asking_price, rate), degree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn twenty_percent() -> RewardRate {
        RewardRate::from_percent(20).unwrap()
    }

    #[test]
    fn weights_sum_to_whole_pool() {
        assert_eq!(DEGREE_WEIGHTS_BPS.iter().sum::<u32>(), 10_000);
    }

    #[test]
    fn full_chain_distribution_matches_table() {
        let dist = distribute(Cents::from_dollars(1_000), twenty_percent(), &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(dist.pool, Cents::from_dollars(200));
        let amounts: Vec<u64> = dist.shares.iter().map(|s| s.amount.0 / 100).collect();
        assert_eq!(amounts, vec![100, 50, 20, 15, 10, 5]);
        assert_eq!(dist.distributed(), dist.pool);
        assert_eq!(dist.unallocated, Cents::ZERO);
    }

    #[test]
    fn short_chain_leaves_remainder_unallocated() {
        let dist = distribute(Cents::from_dollars(1_000), twenty_percent(), &[1, 2]).unwrap();
        let amounts: Vec<Cents> = dist.shares.iter().map(|s| s.amount).collect();
        assert_eq!(amounts, vec![Cents::from_dollars(100), Cents::from_dollars(50)]);
        assert_eq!(dist.unallocated, Cents::from_dollars(50));
    }

    #[test]
    fn full_chain_pays_rounding_remainder_to_first_degree() {
        let dist = distribute(Cents(1_999), twenty_percent(), &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(dist.pool, Cents(399));
        let amounts: Vec<u64> = dist.shares.iter().map(|s| s.amount.0).collect();
        assert_eq!(amounts, vec![204, 99, 39, 29, 19, 9]);
        assert_eq!(dist.distributed(), dist.pool);
        assert_eq!(dist.unallocated, Cents::ZERO);
    }

    #[test]
    fn short_chain_keeps_rounding_in_overflow() {
        let dist = distribute(Cents(1_999), twenty_percent(), &[1, 2, 3]).unwrap();
        let amounts: Vec<u64> = dist.shares.iter().map(|s| s.amount.0).collect();
        assert_eq!(amounts, vec![199, 99, 39]);
        assert_eq!(dist.unallocated, Cents(62));
    }

    #[test]
    fn degree_outside_table_is_rejected() {
        let err = distribute(Cents(100), twenty_percent(), &[7]).unwrap_err();
        assert_eq!(err, CoreError::InvalidDegree(7));
        assert_eq!(potential_bacon(Cents(100), twenty_percent(), 0), None);
    }

    #[test]
    fn reward_rate_is_bounded() {
        assert!(RewardRate::from_percent(100).is_ok());
        assert_eq!(
            RewardRate::from_bps(10_001).unwrap_err(),
            CoreError::InvalidRewardRate { bps: 10_001 }
        );
        let parsed: Result<RewardRate, _> = serde_json::from_str("20000");
        assert!(parsed.is_err());
    }

    #[test]
    fn potential_bacon_uses_asking_price() {
        let preview = potential_bacon(Cents::from_dollars(50), RewardRate::from_percent(10).unwrap(), 2);
        assert_eq!(preview, Some(Cents(125)));
    }

    #[test]
    fn cents_display() {
        assert_eq!(Cents(123_405).to_string(), "$1234.05");
    }

    proptest! {
        #[test]
        fn never_pays_more_than_pool(
            sale in 0u64..10_000_000_000,
            bps in 0u32..=10_000,
            occupied in proptest::collection::vec(1u8..=6, 0..6),
        ) {
            let rate = RewardRate::from_bps(bps).unwrap();
            let dist = distribute(Cents(sale), rate, &occupied).unwrap();
            prop_assert!(dist.distributed() <= dist.pool);
            prop_assert_eq!(Cents(dist.distributed().0 + dist.unallocated.0), dist.pool);
            let again = distribute(Cents(sale), rate, &occupied).unwrap();
            prop_assert_eq!(dist, again);
        }

        #[test]
        fn full_chain_pays_exactly_the_pool(
            sale in 0u64..10_000_000_000,
            bps in 0u32..=10_000,
        ) {
            let rate = RewardRate::from_bps(bps).unwrap();
            let dist = distribute(Cents(sale), rate, &[1, 2, 3, 4, 5, 6]).unwrap();
            prop_assert_eq!(dist.distributed(), dist.pool);
            prop_assert_eq!(dist.unallocated, Cents::ZERO);
        }
    }
}
