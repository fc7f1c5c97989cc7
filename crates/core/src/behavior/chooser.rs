// Transition choosers
//
// A chooser picks which of the completed operation's transition matrices
// drives the next draw. It reads only settled provider state and never blocks.

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use super::providers::{BidSnapshot, ProviderState};
use super::strategy::BidStrategy;
use super::BehaviorId;

/// Chooser bound to one operation of a behavior spec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum TransitionChooserKind {
    #[default]
    #[serde(alias = "Default")]
    Default,
    #[serde(alias = "BidOther")]
    BidOther,
    #[serde(alias = "BidLeaveOther")]
    BidLeaveOther,
    #[serde(alias = "LogoutJoinLeave")]
    LogoutJoinLeave,
    #[serde(alias = "OtherLogoutJoin")]
    OtherLogoutJoin,
    #[serde(alias = "GetNextBid")]
    GetNextBid,
}

/// What a chooser decided
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionChooserResponse {
    /// Index into the completed operation's transition matrices
    pub matrix: usize,
    /// Sub-behaviors to stop before the next operation starts
    pub stop_at_start: Vec<BehaviorId>,
    /// Sub-behaviors to stop once the next operation completes
    pub stop_at_end: Vec<BehaviorId>,
    /// Sub-behavior whose state parameterizes the next operation
    pub data_source: Option<BehaviorId>,
    pub auction_id_to_leave: Option<i64>,
}

impl TransitionChooserResponse {
    fn matrix(matrix: usize) -> Self {
        Self {
            matrix,
            ..Self::default()
        }
    }

    fn leave(key: BehaviorId, auction_id: i64, matrix: usize) -> Self {
        Self {
            matrix,
            stop_at_start: vec![key],
            auction_id_to_leave: Some(auction_id),
            ..Self::default()
        }
    }
}

/// Everything a chooser may look at
pub struct ChooserContext<'a> {
    pub behavior_id: BehaviorId,
    pub active_sub_behaviors: &'a [BehaviorId],
    /// Free slots in the user's async-id pool
    pub async_ids_available: usize,
    pub providers: &'a ProviderState,
    pub strategy: &'a dyn BidStrategy,
}

impl ChooserContext<'_> {
    /// Sub-behaviors with a bid whose bidder and state are known
    fn known_bids(&self, order: &[BehaviorId]) -> Vec<(BehaviorId, BidSnapshot)> {
        order
            .iter()
            .filter_map(|key| {
                let bid = self.providers.current_bid(*key)?;
                if bid.user_id.is_none() || bid.bidding_state.is_none() {
                    return None;
                }
                Some((*key, bid.clone()))
            })
            .collect()
    }

    /// First sub-behavior the strategy wants to bid on
    fn first_bid_target(
        &self,
        candidates: &[(BehaviorId, BidSnapshot)],
        rng: &mut dyn RngCore,
    ) -> Option<BehaviorId> {
        let profile = self.providers.user_profile()?;
        for (key, bid) in candidates {
            let Some(item) = self.providers.current_item(*key) else {
                continue;
            };
            let biddable = bid.bidding_state.is_some_and(|s| s.is_biddable());
            let outbid_by_other = bid.user_id.as_deref() != Some(profile.id.as_str());
            if biddable
                && outbid_by_other
                && self
                    .strategy
                    .should_bid(&item.name, bid.amount, profile.credit_limit, rng)
            {
                return Some(*key);
            }
        }
        None
    }

    fn shuffled(&self, rng: &mut dyn RngCore) -> Vec<BehaviorId> {
        let mut order = self.active_sub_behaviors.to_vec();
        order.shuffle(rng);
        order
    }
}

impl TransitionChooserKind {
    /// Transition matrices an operation using this chooser must define
    pub fn required_matrices(self) -> usize {
        match self {
            TransitionChooserKind::Default => 1,
            TransitionChooserKind::BidOther => 2,
            TransitionChooserKind::BidLeaveOther
            | TransitionChooserKind::LogoutJoinLeave
            | TransitionChooserKind::OtherLogoutJoin
            | TransitionChooserKind::GetNextBid => 3,
        }
    }

    pub fn choose(
        self,
        ctx: &ChooserContext<'_>,
        rng: &mut dyn RngCore,
    ) -> TransitionChooserResponse {
        match self {
            TransitionChooserKind::Default => TransitionChooserResponse::matrix(0),
            TransitionChooserKind::BidOther => bid_other(ctx, rng),
            TransitionChooserKind::BidLeaveOther => bid_leave_other(ctx, rng),
            TransitionChooserKind::LogoutJoinLeave => logout_join_leave(ctx, rng),
            TransitionChooserKind::OtherLogoutJoin => other_logout_join(ctx),
            TransitionChooserKind::GetNextBid => get_next_bid(ctx),
        }
    }
}

// 0 = bid on another attended auction, 1 = something else
fn bid_other(ctx: &ChooserContext<'_>, rng: &mut dyn RngCore) -> TransitionChooserResponse {
    let order = ctx.shuffled(rng);
    let candidates = ctx.known_bids(&order);
    match ctx.first_bid_target(&candidates, rng) {
        Some(key) => TransitionChooserResponse {
            data_source: Some(key),
            ..TransitionChooserResponse::matrix(0)
        },
        None => TransitionChooserResponse::matrix(1),
    }
}

// 0 = bid, 1 = leave a concluded auction, 2 = something else
fn bid_leave_other(ctx: &ChooserContext<'_>, rng: &mut dyn RngCore) -> TransitionChooserResponse {
    let order = ctx.shuffled(rng);
    let candidates = ctx.known_bids(&order);

    let concluded = candidates
        .iter()
        .find(|(_, bid)| bid.bidding_state.is_some_and(|s| s.is_concluded()));
    if let Some((key, bid)) = concluded {
        return TransitionChooserResponse::leave(*key, bid.auction_id, 1);
    }

    match ctx.first_bid_target(&candidates, rng) {
        Some(key) => TransitionChooserResponse {
            data_source: Some(key),
            ..TransitionChooserResponse::matrix(0)
        },
        None => TransitionChooserResponse::matrix(2),
    }
}

// 0 = logout, 1 = join another auction, 2 = leave an auction
fn logout_join_leave(ctx: &ChooserContext<'_>, rng: &mut dyn RngCore) -> TransitionChooserResponse {
    for key in ctx.active_sub_behaviors {
        let Some(bid) = ctx.providers.current_bid(*key) else {
            continue;
        };
        if bid.bidding_state.is_some_and(|s| s.is_concluded()) {
            return TransitionChooserResponse::leave(*key, bid.auction_id, 2);
        }
    }

    if ctx.providers.active_auctions().is_empty() {
        return TransitionChooserResponse::matrix(0);
    }

    if ctx.async_ids_available == 0 && !ctx.active_sub_behaviors.is_empty() {
        let pick = ctx.active_sub_behaviors[rng.gen_range(0..ctx.active_sub_behaviors.len())];
        return match ctx.providers.current_bid(pick) {
            Some(bid) => TransitionChooserResponse::leave(pick, bid.auction_id, 2),
            None => TransitionChooserResponse::matrix(0),
        };
    }

    TransitionChooserResponse::matrix(1)
}

// 1 = something other than joining, 2 = join
fn other_logout_join(ctx: &ChooserContext<'_>) -> TransitionChooserResponse {
    if ctx.providers.active_auctions().is_empty() {
        return TransitionChooserResponse::matrix(1);
    }
    if ctx.async_ids_available > 0 {
        TransitionChooserResponse::matrix(2)
    } else {
        TransitionChooserResponse::matrix(1)
    }
}

// Reads the behavior's own bid
fn get_next_bid(ctx: &ChooserContext<'_>) -> TransitionChooserResponse {
    use super::providers::BiddingState::*;

    let state = ctx
        .providers
        .current_bid(ctx.behavior_id)
        .and_then(|bid| bid.bidding_state);
    let matrix = match state {
        Some(Open | LastCall) => 0,
        Some(Sold | Info | ItemNotActive) => 1,
        _ => 2,
    };
    TransitionChooserResponse::matrix(matrix)
}
