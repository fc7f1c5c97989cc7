// Behavior state machine for one simulated user
//
// The tree owns the root behavior and every sub-behavior it has started.
// Stopping a behavior removes it and all of its descendants; operations still
// in flight for a removed behavior complete into nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, RngCore};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::chooser::ChooserContext;
use super::providers::ProviderState;
use super::registry::BehaviorSpecRegistry;
use super::spec::BehaviorSpec;
use super::strategy::{negative_exponential, BidStrategy};
use super::{BehaviorError, BehaviorId};

/// An operation a behavior wants run
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledOperation {
    pub behavior_id: BehaviorId,
    pub operation_index: usize,
    pub operation_name: String,
    pub start_at: Instant,
    pub cycle_time: Duration,
    /// Behavior whose provider state parameterizes the operation
    pub data_source: BehaviorId,
    /// Behavior the operation's provider updates are stored against
    pub data_sink: BehaviorId,
}

/// Outcome of completing an operation
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Operations to schedule (empty when the behavior was already stopped)
    Next(Vec<ScheduledOperation>),
    /// The completed operation ends the user session
    Reset,
}

#[derive(Debug)]
struct Behavior {
    id: BehaviorId,
    spec: Arc<BehaviorSpec>,
    parent: Option<BehaviorId>,
    current_operation: usize,
    current_cycle_time: Duration,
    last_start: Option<Instant>,
    active_sub_behaviors: Vec<BehaviorId>,
    /// Started once the operation that created it completes
    pending: Option<Box<Behavior>>,
    stop_at_end: Vec<BehaviorId>,
}

impl Behavior {
    fn new(spec: Arc<BehaviorSpec>, parent: Option<BehaviorId>) -> Self {
        Self {
            id: Uuid::now_v7(),
            current_operation: spec.initial_state,
            spec,
            parent,
            current_cycle_time: Duration::ZERO,
            last_start: None,
            active_sub_behaviors: Vec::new(),
            pending: None,
            stop_at_end: Vec::new(),
        }
    }

    fn first_operation(&mut self, now: Instant, rng: &mut dyn RngCore) -> ScheduledOperation {
        let op = self.spec.initial_state;
        self.current_operation = op;
        self.current_cycle_time = cycle_time(&self.spec, op, rng);
        self.last_start = Some(now);
        ScheduledOperation {
            behavior_id: self.id,
            operation_index: op,
            operation_name: self.spec.operation_name(op).to_string(),
            start_at: now,
            cycle_time: self.current_cycle_time,
            data_source: self.id,
            data_sink: self.id,
        }
    }

    /// Previous start plus the completed operation's cycle time, never in the past
    fn next_start(&self, now: Instant) -> Instant {
        match self.last_start {
            Some(last) => (last + self.current_cycle_time).max(now),
            None => now,
        }
    }
}

fn cycle_time(spec: &BehaviorSpec, op: usize, rng: &mut dyn RngCore) -> Duration {
    let mean = spec.mean_cycle_time_ms(op);
    if mean <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_millis(negative_exponential(mean, rng).ceil() as u64)
}

pub struct BehaviorTree {
    root: BehaviorId,
    root_spec: Arc<BehaviorSpec>,
    behaviors: HashMap<BehaviorId, Behavior>,
    registry: Arc<BehaviorSpecRegistry>,
    strategy: Arc<dyn BidStrategy>,
}

impl BehaviorTree {
    pub fn new(
        root_spec: Arc<BehaviorSpec>,
        registry: Arc<BehaviorSpecRegistry>,
        strategy: Arc<dyn BidStrategy>,
    ) -> Self {
        let root = Behavior::new(root_spec.clone(), None);
        let root_id = root.id;
        Self {
            root: root_id,
            root_spec,
            behaviors: HashMap::from([(root_id, root)]),
            registry,
            strategy,
        }
    }

    pub fn root(&self) -> BehaviorId {
        self.root
    }

    pub fn contains(&self, id: BehaviorId) -> bool {
        self.behaviors.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }

    pub fn active_sub_behaviors(&self, id: BehaviorId) -> &[BehaviorId] {
        self.behaviors
            .get(&id)
            .map_or(&[], |b| b.active_sub_behaviors.as_slice())
    }

    /// Sub-behaviors (started or pending) held against the user's pool
    fn async_ids_in_use(&self) -> usize {
        let pending = self.behaviors.values().filter(|b| b.pending.is_some()).count();
        self.behaviors.len() - 1 + pending
    }

    fn async_ids_available(&self) -> usize {
        self.root_spec
            .max_num_async_behaviors
            .saturating_sub(self.async_ids_in_use())
    }

    /// Schedule the root's first operation
    pub fn start(&mut self, now: Instant, rng: &mut dyn RngCore) -> Option<ScheduledOperation> {
        let root = self.behaviors.get_mut(&self.root)?;
        Some(root.first_operation(now, rng))
    }

    /// Drop every behavior and begin again with a fresh root
    pub fn reset(
        &mut self,
        providers: &mut ProviderState,
        now: Instant,
        rng: &mut dyn RngCore,
    ) -> ScheduledOperation {
        self.behaviors.clear();
        providers.clear();
        let mut root = Behavior::new(self.root_spec.clone(), None);
        let first = root.first_operation(now, rng);
        self.root = root.id;
        self.behaviors.insert(root.id, root);
        first
    }

    /// Stop a behavior and everything under it; returns the removed ids
    pub fn stop(&mut self, id: BehaviorId, providers: &mut ProviderState) -> Vec<BehaviorId> {
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(behavior) = self.behaviors.remove(&next) {
                stack.extend(behavior.active_sub_behaviors.iter().copied());
                if let Some(parent) = behavior.parent.and_then(|p| self.behaviors.get_mut(&p)) {
                    parent.active_sub_behaviors.retain(|child| *child != next);
                }
                providers.forget(next);
                if let Some(pending) = behavior.pending {
                    providers.forget(pending.id);
                }
                removed.push(next);
            }
        }
        if !removed.is_empty() {
            debug!(behavior = %id, stopped = removed.len(), "stopped behavior");
        }
        removed
    }

    fn stop_all_sub_behaviors(&mut self, id: BehaviorId, providers: &mut ProviderState) {
        let children = self
            .behaviors
            .get(&id)
            .map(|b| b.active_sub_behaviors.clone())
            .unwrap_or_default();
        for child in children {
            self.stop(child, providers);
        }
    }

    /// Advance a behavior after its current operation completed
    pub fn operation_complete(
        &mut self,
        id: BehaviorId,
        providers: &mut ProviderState,
        now: Instant,
        rng: &mut dyn RngCore,
    ) -> Result<Transition, BehaviorError> {
        let Some(behavior) = self.behaviors.get_mut(&id) else {
            return Ok(Transition::Next(Vec::new()));
        };
        let completed = behavior.current_operation;
        if behavior.spec.is_reset_state(completed) {
            return Ok(Transition::Reset);
        }

        let stop_at_end = std::mem::take(&mut behavior.stop_at_end);
        for stale in stop_at_end {
            self.stop(stale, providers);
        }

        let mut scheduled = Vec::new();
        if let Some(behavior) = self.behaviors.get_mut(&id) {
            if let Some(mut pending) = behavior.pending.take() {
                behavior.active_sub_behaviors.push(pending.id);
                scheduled.push(pending.first_operation(now, rng));
                self.behaviors.insert(pending.id, *pending);
            }
        }

        let available = self.async_ids_available();
        let Some(behavior) = self.behaviors.get(&id) else {
            return Ok(Transition::Next(scheduled));
        };
        let spec = behavior.spec.clone();
        let response = spec.chooser(completed).choose(
            &ChooserContext {
                behavior_id: id,
                active_sub_behaviors: &behavior.active_sub_behaviors,
                async_ids_available: available,
                providers,
                strategy: self.strategy.as_ref(),
            },
            rng,
        );

        for stale in &response.stop_at_start {
            self.stop(*stale, providers);
        }
        if response.auction_id_to_leave.is_some() {
            providers.set_auction_id_to_leave(response.auction_id_to_leave);
        }

        let next = spec
            .select_next(completed, response.matrix, rng.gen())
            .ok_or_else(|| BehaviorError::NoTransition {
                spec: spec.name.clone(),
                operation: completed,
                matrix: response.matrix,
            })?;

        let mut pending = None;
        let available = self.async_ids_available();
        if let Some(child_name) = spec.async_behavior(next) {
            let active = self.active_sub_behaviors(id).len();
            if active < spec.max_num_async_behaviors && available > 0 {
                match self.registry.get(child_name) {
                    Ok(child_spec) => pending = Some(Box::new(Behavior::new(child_spec, Some(id)))),
                    Err(e) => warn!(behavior = %id, error = %e, "cannot start sub-behavior"),
                }
            }
        }

        if spec.is_reset_state(next) {
            self.stop_all_sub_behaviors(id, providers);
        }

        let Some(behavior) = self.behaviors.get_mut(&id) else {
            return Ok(Transition::Next(scheduled));
        };
        let start_at = behavior.next_start(now);
        let data_source = response.data_source.unwrap_or(id);
        let data_sink = pending.as_ref().map_or(data_source, |p| p.id);

        behavior.current_operation = next;
        behavior.current_cycle_time = cycle_time(&spec, next, rng);
        behavior.last_start = Some(start_at);
        behavior.stop_at_end = response.stop_at_end;
        behavior.pending = pending;

        scheduled.push(ScheduledOperation {
            behavior_id: id,
            operation_index: next,
            operation_name: spec.operation_name(next).to_string(),
            start_at,
            cycle_time: behavior.current_cycle_time,
            data_source,
            data_sink,
        });
        Ok(Transition::Next(scheduled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::chooser::TransitionChooserKind;
    use crate::behavior::providers::{BidSnapshot, BiddingState, ProviderUpdate};
    use crate::behavior::spec::fixtures::two_state;
    use crate::behavior::strategy::RandomBidStrategy;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tree(specs: Vec<BehaviorSpec>, root: &str) -> BehaviorTree {
        let registry = Arc::new(BehaviorSpecRegistry::from_specs(specs).unwrap());
        BehaviorTree::new(
            registry.get(root).unwrap(),
            registry,
            Arc::new(RandomBidStrategy::new(0.2)),
        )
    }

    fn next(transition: Transition) -> Vec<ScheduledOperation> {
        match transition {
            Transition::Next(ops) => ops,
            Transition::Reset => panic!("unexpected reset"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_walks_transition_matrix() {
        let mut tree = tree(vec![two_state("user", None)], "user");
        let mut providers = ProviderState::new();
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();

        let first = tree.start(now, &mut rng).unwrap();
        assert_eq!(first.operation_index, 0);
        assert_eq!(first.start_at, now);
        assert_eq!(first.data_source, tree.root());

        // operation 0 always moves to operation 1
        let ops = next(tree.operation_complete(tree.root(), &mut providers, now, &mut rng).unwrap());
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation_index, 1);
        assert_eq!(ops[0].operation_name, "user-b");
        assert_eq!(ops[0].start_at, now + first.cycle_time);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_time_never_in_past() {
        let mut tree = tree(vec![two_state("user", None)], "user");
        let mut providers = ProviderState::new();
        let mut rng = StdRng::seed_from_u64(2);
        let start = Instant::now();
        let first = tree.start(start, &mut rng).unwrap();

        let late = start + first.cycle_time + Duration::from_secs(30);
        let ops = next(tree.operation_complete(tree.root(), &mut providers, late, &mut rng).unwrap());
        assert_eq!(ops[0].start_at, late);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_behavior_started_after_creating_operation() {
        let mut user = two_state("user", Some("auction"));
        // always go to the joining operation
        user.transition_matrices = vec![vec![vec![0.0, 1.0]], vec![vec![0.0, 1.0]]];
        let mut tree = tree(vec![user, two_state("auction", None)], "user");
        let mut providers = ProviderState::new();
        let mut rng = StdRng::seed_from_u64(3);
        let now = Instant::now();
        let root = tree.root();
        tree.start(now, &mut rng);

        // scheduling the join creates a pending sub-behavior as the data sink
        let ops = next(tree.operation_complete(root, &mut providers, now, &mut rng).unwrap());
        let join = &ops[0];
        assert_ne!(join.data_sink, root);
        assert!(!tree.contains(join.data_sink));
        assert!(tree.active_sub_behaviors(root).is_empty());

        // completing the join starts it
        let ops = next(tree.operation_complete(root, &mut providers, now, &mut rng).unwrap());
        assert_eq!(tree.active_sub_behaviors(root), &[join.data_sink]);
        assert!(tree.contains(join.data_sink));
        let child_first = ops
            .iter()
            .find(|op| op.behavior_id == join.data_sink)
            .unwrap();
        assert_eq!(child_first.operation_name, "auction-a");
        assert_eq!(tree.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_pool_is_bounded() {
        let mut user = two_state("user", Some("auction"));
        user.transition_matrices = vec![vec![vec![0.0, 1.0]], vec![vec![0.0, 1.0]]];
        user.max_num_async_behaviors = 2;
        let mut tree = tree(vec![user, two_state("auction", None)], "user");
        let mut providers = ProviderState::new();
        let mut rng = StdRng::seed_from_u64(4);
        let now = Instant::now();
        let root = tree.root();
        tree.start(now, &mut rng);

        for _ in 0..6 {
            tree.operation_complete(root, &mut providers, now, &mut rng).unwrap();
        }
        assert_eq!(tree.active_sub_behaviors(root).len(), 2);
        assert_eq!(tree.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_stops_concluded_sub_behavior() {
        let mut user = two_state("user", Some("auction"));
        user.transition_matrices = vec![
            vec![vec![0.0, 1.0]],
            vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![0.0, 1.0]],
        ];
        let mut tree = tree(vec![user.clone(), two_state("auction", None)], "user");
        let mut providers = ProviderState::new();
        let mut rng = StdRng::seed_from_u64(5);
        let now = Instant::now();
        let root = tree.root();
        tree.start(now, &mut rng);
        tree.operation_complete(root, &mut providers, now, &mut rng).unwrap();
        tree.operation_complete(root, &mut providers, now, &mut rng).unwrap();
        let child = tree.active_sub_behaviors(root)[0];

        // swap in a spec whose joining operation uses the leave chooser
        user.transition_choosers[1] = TransitionChooserKind::BidLeaveOther;
        let registry = Arc::new(
            BehaviorSpecRegistry::from_specs([user, two_state("auction", None)]).unwrap(),
        );
        tree.root_spec = registry.get("user").unwrap();
        if let Some(root_behavior) = tree.behaviors.get_mut(&root) {
            root_behavior.spec = tree.root_spec.clone();
        }

        providers.apply(
            child,
            ProviderUpdate::CurrentBid(BidSnapshot {
                auction_id: 12,
                item_id: 1,
                user_id: Some("other".into()),
                amount: 5.0,
                bidding_state: Some(BiddingState::AuctionComplete),
            }),
        );
        let ops = next(tree.operation_complete(root, &mut providers, now, &mut rng).unwrap());
        assert!(!tree.contains(child));
        assert!(providers.current_bid(child).is_none());
        assert_eq!(providers.auction_id_to_leave(), Some(12));
        // matrix 1 of the joining operation leads back to operation 0
        assert_eq!(ops.last().map(|op| op.operation_index), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_state_restarts_user() {
        let mut user = two_state("user", None);
        user.is_reset_state = vec![false, true];
        let mut tree = tree(vec![user], "user");
        let mut providers = ProviderState::new();
        let mut rng = StdRng::seed_from_u64(6);
        let now = Instant::now();
        let old_root = tree.root();
        tree.start(now, &mut rng);
        tree.operation_complete(old_root, &mut providers, now, &mut rng).unwrap();

        let transition = tree.operation_complete(old_root, &mut providers, now, &mut rng).unwrap();
        assert_eq!(transition, Transition::Reset);

        let first = tree.reset(&mut providers, now, &mut rng);
        assert_ne!(tree.root(), old_root);
        assert!(!tree.contains(old_root));
        assert_eq!(first.operation_index, 0);

        // late completion of the old root is ignored
        let ops = next(tree.operation_complete(old_root, &mut providers, now, &mut rng).unwrap());
        assert!(ops.is_empty());
    }
}
