// Per-user view of system-under-test state that transition choosers read
//
// Operations report what they learned as `ProviderUpdate`s. The user applies
// them once the operation completes, so choosers only ever see settled state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::BehaviorId;

/// Bidding state reported by the system under test for an auction item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BiddingState {
    Open,
    LastCall,
    Sold,
    Info,
    AuctionComplete,
    AuctionNotActive,
    NoSuchAuction,
    ItemNotActive,
    NoSuchItem,
    NoSuchUser,
    Accepted,
    Unknown,
}

impl BiddingState {
    /// Item can still take bids
    pub fn is_biddable(self) -> bool {
        matches!(self, BiddingState::Open | BiddingState::LastCall)
    }

    /// Auction is over and should be left
    pub fn is_concluded(self) -> bool {
        matches!(
            self,
            BiddingState::AuctionComplete | BiddingState::AuctionNotActive
        )
    }
}

/// Latest bid seen by a behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidSnapshot {
    pub auction_id: i64,
    #[serde(default)]
    pub item_id: i64,
    /// Bidder that holds the current high bid
    #[serde(default)]
    pub user_id: Option<String>,
    pub amount: f64,
    #[serde(default)]
    pub bidding_state: Option<BiddingState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSnapshot {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub credit_limit: f64,
}

/// Something an operation learned about the system under test
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderUpdate {
    LoggedIn(UserProfile),
    LoggedOut,
    ActiveAuctions(Vec<i64>),
    /// Stored against the operation's data sink
    CurrentBid(BidSnapshot),
    /// Stored against the operation's data sink
    CurrentItem(ItemSnapshot),
}

/// State one user has accumulated across all of its behaviors
#[derive(Debug, Clone, Default)]
pub struct ProviderState {
    user_profile: Option<UserProfile>,
    active_auctions: Vec<i64>,
    current_bids: HashMap<BehaviorId, BidSnapshot>,
    current_items: HashMap<BehaviorId, ItemSnapshot>,
    auction_id_to_leave: Option<i64>,
}

impl ProviderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, sink: BehaviorId, update: ProviderUpdate) {
        match update {
            ProviderUpdate::LoggedIn(profile) => self.user_profile = Some(profile),
            ProviderUpdate::LoggedOut => self.clear(),
            ProviderUpdate::ActiveAuctions(ids) => self.active_auctions = ids,
            ProviderUpdate::CurrentBid(bid) => {
                self.current_bids.insert(sink, bid);
            }
            ProviderUpdate::CurrentItem(item) => {
                self.current_items.insert(sink, item);
            }
        }
    }

    /// Drop everything a stopped behavior left behind
    pub fn forget(&mut self, id: BehaviorId) {
        self.current_bids.remove(&id);
        self.current_items.remove(&id);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn user_profile(&self) -> Option<&UserProfile> {
        self.user_profile.as_ref()
    }

    pub fn active_auctions(&self) -> &[i64] {
        &self.active_auctions
    }

    pub fn current_bid(&self, id: BehaviorId) -> Option<&BidSnapshot> {
        self.current_bids.get(&id)
    }

    pub fn current_item(&self, id: BehaviorId) -> Option<&ItemSnapshot> {
        self.current_items.get(&id)
    }

    pub fn auction_id_to_leave(&self) -> Option<i64> {
        self.auction_id_to_leave
    }

    pub fn set_auction_id_to_leave(&mut self, auction_id: Option<i64>) {
        self.auction_id_to_leave = auction_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_bidding_state_wire_names() {
        assert_eq!(
            serde_json::to_value(BiddingState::LastCall).unwrap(),
            "LASTCALL"
        );
        let state: BiddingState = serde_json::from_value(serde_json::json!("AUCTIONNOTACTIVE")).unwrap();
        assert!(state.is_concluded());
        assert!(!state.is_biddable());
        assert!(BiddingState::Open.is_biddable());
    }

    #[test]
    fn test_updates_land_on_sink() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let mut state = ProviderState::new();
        state.apply(
            b,
            ProviderUpdate::CurrentBid(BidSnapshot {
                auction_id: 4,
                item_id: 9,
                user_id: None,
                amount: 10.0,
                bidding_state: Some(BiddingState::Open),
            }),
        );
        assert!(state.current_bid(a).is_none());
        assert_eq!(state.current_bid(b).map(|bid| bid.auction_id), Some(4));

        state.forget(b);
        assert!(state.current_bid(b).is_none());
    }

    #[test]
    fn test_logout_clears_everything() {
        let id = Uuid::now_v7();
        let mut state = ProviderState::new();
        state.apply(
            id,
            ProviderUpdate::LoggedIn(UserProfile {
                id: "u1".into(),
                credit_limit: 500.0,
            }),
        );
        state.apply(id, ProviderUpdate::ActiveAuctions(vec![1, 2]));
        state.set_auction_id_to_leave(Some(2));

        state.apply(id, ProviderUpdate::LoggedOut);
        assert!(state.user_profile().is_none());
        assert!(state.active_auctions().is_empty());
        assert_eq!(state.auction_id_to_leave(), None);
    }
}
