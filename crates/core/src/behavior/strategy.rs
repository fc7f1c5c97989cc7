// Bid strategies used by bidding choosers

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Decides whether and how much a user bids on an item
pub trait BidStrategy: Send + Sync {
    fn should_bid(
        &self,
        item_name: &str,
        current_bid: f64,
        credit_limit: f64,
        rng: &mut dyn RngCore,
    ) -> bool;

    fn bid_amount(
        &self,
        item_name: &str,
        current_bid: f64,
        credit_limit: f64,
        rng: &mut dyn RngCore,
    ) -> f64;
}

/// Strategy selection in workload configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum BidStrategyKind {
    #[default]
    Random,
    LowerRandom,
}

impl BidStrategyKind {
    pub fn build(self) -> RandomBidStrategy {
        match self {
            BidStrategyKind::Random => RandomBidStrategy::new(0.2),
            BidStrategyKind::LowerRandom => RandomBidStrategy::new(0.05),
        }
    }
}

/// Bids with a fixed probability, raising by a clamped normal percentage
#[derive(Debug, Clone)]
pub struct RandomBidStrategy {
    bid_probability: f64,
    increase_avg: f64,
    increase_std_dev: f64,
    increase_min: f64,
    increase_max: f64,
    max_bid: f64,
}

impl RandomBidStrategy {
    pub fn new(bid_probability: f64) -> Self {
        Self {
            bid_probability,
            increase_avg: 0.02,
            increase_std_dev: 0.02,
            increase_min: 0.005,
            increase_max: 0.06,
            max_bid: 1000.0,
        }
    }

    pub fn bid_probability(&self) -> f64 {
        self.bid_probability
    }
}

/// Standard normal sample (Box-Muller)
pub(crate) fn standard_normal(rng: &mut dyn RngCore) -> f64 {
    // 1 - u keeps the log argument in (0, 1]
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Exponential sample with the given mean
pub(crate) fn negative_exponential(mean: f64, rng: &mut dyn RngCore) -> f64 {
    let u = 1.0 - rng.gen::<f64>();
    -u.ln() * mean
}

impl BidStrategy for RandomBidStrategy {
    fn should_bid(
        &self,
        _item_name: &str,
        current_bid: f64,
        credit_limit: f64,
        rng: &mut dyn RngCore,
    ) -> bool {
        let draw = rng.gen::<f64>();
        let max_next_bid = (current_bid * (1.0 + self.increase_max)).round();
        draw <= self.bid_probability && max_next_bid < credit_limit && max_next_bid < self.max_bid
    }

    fn bid_amount(
        &self,
        _item_name: &str,
        current_bid: f64,
        credit_limit: f64,
        rng: &mut dyn RngCore,
    ) -> f64 {
        let increase = (standard_normal(rng) * self.increase_std_dev + self.increase_avg)
            .clamp(self.increase_min, self.increase_max);

        let mut amount = ((current_bid * (1.0 + increase)) * 100.0).round() / 100.0;
        if amount <= current_bid {
            amount = current_bid + 0.01;
        }
        amount.min(credit_limit).min(self.max_bid)
    }
}
