//! Order ledger - authoritative level to order bindings
//!
//! The ledger owns one optional [`OrderBinding`] per grid level and applies
//! versioned events to it. It never talks to the exchange; the engine feeds it
//! acknowledgements, fills and cancels, and reads back what needs to be done.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, warn};
use rust_decimal::Decimal;

use super::errors::{GridError, GridResult};
use super::planner::GridPlanner;
use super::types::{BindingState, GridLevel, OrderBinding, OrderId, OrderSide};

/// How many recent exchange sequence numbers are remembered in-session
pub const SEQ_WINDOW: usize = 4096;

/// Mutation requested on a binding
#[derive(Debug, Clone, PartialEq)]
pub enum BindingEventKind {
    /// Place request handed to the dispatcher
    Submitted,
    /// Venue accepted the order
    Acknowledged { order_id: OrderId },
    /// Venue refused the order
    Rejected { reason: String },
    /// Place request failed after retries; the level can be placed again
    SubmitFailed,
    Fill { delta: Decimal },
    CancelRequested,
    /// Cancel did not go through; the order is still resting
    CancelFailed,
    Cancelled,
    /// Replace finished: the old order is gone and `order_id` rests for `size`
    Replaced { order_id: OrderId, size: Decimal },
}

/// Event addressed to a specific binding version
#[derive(Debug, Clone, PartialEq)]
pub struct BindingEvent {
    pub version: u64,
    pub kind: BindingEventKind,
}

impl BindingEvent {
    pub fn new(version: u64, kind: BindingEventKind) -> Self {
        Self { version, kind }
    }
}

/// Result of applying a [`BindingEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(BindingState),
    /// Event tagged with an older version than the binding's
    Stale,
    /// Transition not valid from the current state
    Ignored,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }
}

/// In-memory ledger of grid bindings
#[derive(Debug, Clone)]
pub struct OrderLedger {
    levels: Vec<GridLevel>,
    bindings: Vec<Option<OrderBinding>>,
    oid_to_level: HashMap<OrderId, u32>,
    /// Highest exchange sequence number processed
    last_event_seq: Option<u64>,
    /// Everything at or below this was processed before the last restart
    seq_floor: Option<u64>,
    recent_seqs: VecDeque<u64>,
    recent_set: HashSet<u64>,
}

impl OrderLedger {
    /// Create an empty ledger over planned levels
    pub fn new(levels: Vec<GridLevel>) -> Self {
        let bindings = vec![None; levels.len()];
        Self {
            levels,
            bindings,
            oid_to_level: HashMap::new(),
            last_event_seq: None,
            seq_floor: None,
            recent_seqs: VecDeque::new(),
            recent_set: HashSet::new(),
        }
    }

    /// Give every level an unplaced binding on its construction side, except
    /// the gap level just above the reference price.
    pub fn seed(&mut self, reference_price: Decimal) {
        let gap = GridPlanner::gap_level(&self.levels, reference_price);
        for level in &self.levels {
            if Some(level.index()) == gap {
                continue;
            }
            self.bindings[level.index() as usize] =
                Some(OrderBinding::unplaced(level, level.side(), 0));
        }
        debug!(
            "Ledger seeded: levels={}, gap={:?}",
            self.levels.len(),
            gap
        );
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn level(&self, index: u32) -> GridResult<&GridLevel> {
        self.levels
            .get(index as usize)
            .ok_or(GridError::LevelNotFound(index))
    }

    pub fn binding(&self, index: u32) -> Option<&OrderBinding> {
        self.bindings.get(index as usize).and_then(Option::as_ref)
    }

    /// All bindings in ascending level order
    pub fn bindings(&self) -> impl Iterator<Item = &OrderBinding> {
        self.bindings.iter().flatten()
    }

    pub fn level_for_order(&self, order_id: &str) -> Option<u32> {
        self.oid_to_level.get(order_id).copied()
    }

    pub fn last_event_seq(&self) -> Option<u64> {
        self.last_event_seq
    }

    /// Levels whose binding waits to be placed, ascending
    pub fn placeable_levels(&self) -> Vec<u32> {
        self.bindings()
            .filter(|b| b.state == BindingState::Unplaced && !b.risk_deferred)
            .map(|b| b.level_index)
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.bindings().filter(|b| b.state.is_live()).count()
    }

    /// Record an exchange sequence number. Returns false for duplicates.
    pub fn observe_seq(&mut self, seq: u64) -> bool {
        if self.seq_floor.is_some_and(|floor| seq <= floor) || self.recent_set.contains(&seq) {
            return false;
        }
        if self.recent_seqs.len() == SEQ_WINDOW
            && self.recent_seqs.front().is_some_and(|&oldest| seq < oldest)
        {
            // older than anything still remembered
            return false;
        }

        self.recent_seqs.push_back(seq);
        self.recent_set.insert(seq);
        if self.recent_seqs.len() > SEQ_WINDOW {
            if let Some(evicted) = self.recent_seqs.pop_front() {
                self.recent_set.remove(&evicted);
            }
        }
        self.last_event_seq = self.last_event_seq.max(Some(seq));
        true
    }

    /// Apply a versioned event to the binding at `index`
    pub fn apply(&mut self, index: u32, event: BindingEvent) -> GridResult<ApplyOutcome> {
        let binding = self
            .bindings
            .get_mut(index as usize)
            .and_then(Option::as_mut)
            .ok_or(GridError::LevelNotFound(index))?;

        if event.version < binding.version {
            debug!(
                "Stale binding event: level={}, event_version={}, current={}",
                index, event.version, binding.version
            );
            return Ok(ApplyOutcome::Stale);
        }
        if event.version > binding.version {
            warn!(
                "Binding event from the future: level={}, event_version={}, current={}",
                index, event.version, binding.version
            );
            return Ok(ApplyOutcome::Ignored);
        }

        let mut unmap: Option<OrderId> = None;
        let mut map: Option<OrderId> = None;

        match (binding.state, event.kind) {
            (BindingState::Unplaced, BindingEventKind::Submitted) => {
                binding.state = BindingState::Pending;
                binding.risk_deferred = false;
                binding.reject_reason = None;
            }
            (BindingState::Pending, BindingEventKind::Acknowledged { order_id }) => {
                binding.state = BindingState::Open;
                binding.exchange_order_id = Some(order_id.clone());
                map = Some(order_id);
            }
            (BindingState::Pending, BindingEventKind::Rejected { reason }) => {
                binding.state = BindingState::Rejected;
                binding.reject_reason = Some(reason);
            }
            (BindingState::Pending, BindingEventKind::SubmitFailed) => {
                binding.state = BindingState::Unplaced;
            }
            (BindingState::Open, BindingEventKind::Fill { delta }) => {
                binding.last_known_filled_size += delta;
                if binding.last_known_filled_size >= binding.size {
                    binding.last_known_filled_size = binding.size;
                    binding.state = BindingState::Filled;
                    binding.cancel_requested = false;
                    unmap = binding.exchange_order_id.clone();
                }
            }
            (BindingState::Open, BindingEventKind::CancelRequested) => {
                binding.cancel_requested = true;
            }
            (BindingState::Open, BindingEventKind::CancelFailed) => {
                binding.cancel_requested = false;
            }
            (BindingState::Open, BindingEventKind::Cancelled) => {
                binding.state = BindingState::Cancelled;
                unmap = binding.exchange_order_id.clone();
            }
            (BindingState::Open, BindingEventKind::Replaced { order_id, size }) => {
                unmap = binding.exchange_order_id.replace(order_id.clone());
                map = Some(order_id);
                binding.size = size;
                binding.last_known_filled_size = Decimal::ZERO;
                binding.cancel_requested = false;
            }
            (state, kind) => {
                debug!(
                    "Ignored binding event: level={}, state={:?}, event={:?}",
                    index, state, kind
                );
                return Ok(ApplyOutcome::Ignored);
            }
        }

        binding.version += 1;
        let state = binding.state;

        if let Some(oid) = unmap {
            self.oid_to_level.remove(&oid);
        }
        if let Some(oid) = map {
            self.oid_to_level.insert(oid, index);
        }

        Ok(ApplyOutcome::Applied(state))
    }

    /// Replace the binding at `index` with a fresh unplaced one on `side`.
    ///
    /// Fails when the current binding still has a request in flight or an
    /// order resting; those are never silently overwritten.
    pub fn rebind(&mut self, index: u32, side: OrderSide) -> GridResult<&OrderBinding> {
        let level = self.level(index)?.clone();
        let slot = &mut self.bindings[index as usize];

        let version = match slot {
            Some(existing) if existing.state.is_live() => {
                return Err(GridError::LogicInconsistency(format!(
                    "level {} already holds a {:?} binding (order {:?})",
                    index, existing.state, existing.exchange_order_id
                )));
            }
            Some(existing) => existing.version + 1,
            None => 0,
        };

        if let Some(oid) = slot.as_ref().and_then(|b| b.exchange_order_id.clone()) {
            self.oid_to_level.remove(&oid);
        }

        let binding = slot.insert(OrderBinding::unplaced(&level, side, version));
        Ok(binding)
    }

    /// Arm the mirror of a completed fill at `index` on `side`.
    ///
    /// Besides live bindings, an unplaced intent on the other side is refused:
    /// replacing it would drop a mirror recorded while actions were suspended.
    /// Risk-deferred bindings and same-side intents are replaced.
    pub fn rebind_mirror(&mut self, index: u32, side: OrderSide) -> GridResult<&OrderBinding> {
        if let Some(existing) = self.binding(index) {
            if existing.state == BindingState::Unplaced
                && existing.side != side
                && !existing.risk_deferred
            {
                return Err(GridError::LogicInconsistency(format!(
                    "level {} already holds an unplaced {} intent, mirror wants {}",
                    index, existing.side, side
                )));
            }
        }
        self.rebind(index, side)
    }

    /// Bind an order found on the exchange to a level during recovery
    pub fn adopt(
        &mut self,
        index: u32,
        side: OrderSide,
        order_id: OrderId,
        filled_size: Decimal,
    ) -> GridResult<()> {
        let pending = self
            .binding(index)
            .is_some_and(|b| b.state == BindingState::Pending);

        if !pending {
            self.rebind(index, side)?;
            let version = self.binding_version(index)?;
            self.apply(index, BindingEvent::new(version, BindingEventKind::Submitted))?;
        }

        let version = self.binding_version(index)?;
        self.apply(
            index,
            BindingEvent::new(version, BindingEventKind::Acknowledged { order_id }),
        )?;

        if filled_size > Decimal::ZERO {
            let version = self.binding_version(index)?;
            self.apply(
                index,
                BindingEvent::new(version, BindingEventKind::Fill { delta: filled_size }),
            )?;
        }
        Ok(())
    }

    pub fn binding_version(&self, index: u32) -> GridResult<u64> {
        self.binding(index)
            .map(|b| b.version)
            .ok_or(GridError::LevelNotFound(index))
    }

    /// Flag or clear a risk deferral without touching the order state
    pub fn set_risk_deferred(&mut self, index: u32, deferred: bool) -> GridResult<()> {
        let binding = self
            .bindings
            .get_mut(index as usize)
            .and_then(Option::as_mut)
            .ok_or(GridError::LevelNotFound(index))?;
        if binding.risk_deferred != deferred {
            binding.risk_deferred = deferred;
            binding.version += 1;
        }
        Ok(())
    }

    /// Clear every risk deferral; returns how many were cleared
    pub fn clear_risk_deferrals(&mut self) -> usize {
        let mut cleared = 0;
        for binding in self.bindings.iter_mut().flatten() {
            if binding.risk_deferred {
                binding.risk_deferred = false;
                binding.version += 1;
                cleared += 1;
            }
        }
        cleared
    }

    /// Bindings in ascending level order, for persistence
    pub fn snapshot(&self) -> Vec<OrderBinding> {
        self.bindings().cloned().collect()
    }

    /// Load persisted bindings.
    ///
    /// A binding is kept only if its level still exists with the same price
    /// and size; anything else belongs to a previous grid layout and is
    /// dropped, so its order surfaces during recovery instead.
    pub fn restore(&mut self, bindings: Vec<OrderBinding>, last_event_seq: Option<u64>) -> usize {
        self.bindings = vec![None; self.levels.len()];
        self.oid_to_level.clear();

        let mut dropped = 0;
        for binding in bindings {
            let matches = self.levels.get(binding.level_index as usize).is_some_and(|l| {
                l.price() == binding.price
                    && (l.size() == binding.size || binding.state == BindingState::Open)
            });
            if !matches {
                warn!(
                    "Dropping persisted binding that no longer fits the grid: level={}, price={}, state={:?}",
                    binding.level_index, binding.price, binding.state
                );
                dropped += 1;
                continue;
            }
            if let (true, Some(oid)) = (binding.state.is_live(), &binding.exchange_order_id) {
                self.oid_to_level.insert(oid.clone(), binding.level_index);
            }
            let index = binding.level_index as usize;
            self.bindings[index] = Some(binding);
        }

        self.last_event_seq = last_event_seq;
        self.seq_floor = last_event_seq;
        self.recent_seqs.clear();
        self.recent_set.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn ladder() -> Vec<GridLevel> {
        vec![
            GridLevel::new(0, dec!(90), OrderSide::Buy, dec!(1)),
            GridLevel::new(1, dec!(100), OrderSide::Buy, dec!(1)),
            GridLevel::new(2, dec!(110), OrderSide::Sell, dec!(1)),
        ]
    }

    fn seeded() -> OrderLedger {
        let mut ledger = OrderLedger::new(ladder());
        ledger.seed(dec!(100));
        ledger
    }

    fn open(ledger: &mut OrderLedger, index: u32, oid: &str) {
        let v = ledger.binding_version(index).unwrap();
        ledger
            .apply(index, BindingEvent::new(v, BindingEventKind::Submitted))
            .unwrap();
        ledger
            .apply(
                index,
                BindingEvent::new(
                    v + 1,
                    BindingEventKind::Acknowledged {
                        order_id: oid.to_string(),
                    },
                ),
            )
            .unwrap();
    }

    #[test]
    fn test_seed_leaves_gap() {
        let ledger = seeded();
        assert!(ledger.binding(0).is_some());
        assert!(ledger.binding(1).is_some());
        assert!(ledger.binding(2).is_none());
        assert_eq!(ledger.placeable_levels(), vec![0, 1]);
    }

    #[test]
    fn test_lifecycle_to_filled() {
        let mut ledger = seeded();
        open(&mut ledger, 1, "oid-1");
        assert_eq!(ledger.level_for_order("oid-1"), Some(1));

        let v = ledger.binding_version(1).unwrap();
        let outcome = ledger
            .apply(1, BindingEvent::new(v, BindingEventKind::Fill { delta: dec!(0.4) }))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(BindingState::Open));

        let outcome = ledger
            .apply(
                1,
                BindingEvent::new(v + 1, BindingEventKind::Fill { delta: dec!(0.6) }),
            )
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(BindingState::Filled));
        assert_eq!(ledger.level_for_order("oid-1"), None);
        assert_eq!(ledger.binding(1).unwrap().last_known_filled_size, dec!(1));
    }

    #[test]
    fn test_stale_event_is_noop() {
        let mut ledger = seeded();
        open(&mut ledger, 0, "a");
        let before = ledger.binding(0).cloned();

        let outcome = ledger
            .apply(
                0,
                BindingEvent::new(
                    0,
                    BindingEventKind::Acknowledged {
                        order_id: "b".into(),
                    },
                ),
            )
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(ledger.binding(0).cloned(), before);
    }

    #[test]
    fn test_rebind_refuses_live_binding() {
        let mut ledger = seeded();
        open(&mut ledger, 0, "a");
        assert!(matches!(
            ledger.rebind(0, OrderSide::Sell),
            Err(GridError::LogicInconsistency(_))
        ));

        // terminal bindings are replaced with the next version
        let v = ledger.binding_version(0).unwrap();
        ledger
            .apply(0, BindingEvent::new(v, BindingEventKind::Cancelled))
            .unwrap();
        let fresh = ledger.rebind(0, OrderSide::Sell).unwrap();
        assert_eq!(fresh.state, BindingState::Unplaced);
        assert_eq!(fresh.side, OrderSide::Sell);
        assert_eq!(fresh.version, v + 2);

        // an event aimed at the cancelled instance no longer applies
        let outcome = ledger
            .apply(0, BindingEvent::new(v + 1, BindingEventKind::SubmitFailed))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Stale);
    }

    #[test]
    fn test_mirror_keeps_opposite_unplaced_intent() {
        let mut ledger = seeded();
        let v = ledger.binding_version(1).unwrap();

        // level 1 waits to place a buy; a sell mirror must not erase it
        assert!(matches!(
            ledger.rebind_mirror(1, OrderSide::Sell),
            Err(GridError::LogicInconsistency(_))
        ));
        assert_eq!(ledger.binding(1).unwrap().side, OrderSide::Buy);
        assert_eq!(ledger.binding_version(1).unwrap(), v);

        // same side replaces the intent with the next version
        let fresh = ledger.rebind_mirror(1, OrderSide::Buy).unwrap();
        assert_eq!(fresh.version, v + 1);

        // an intent parked by the risk guard gives way
        ledger.set_risk_deferred(1, true).unwrap();
        let fresh = ledger.rebind_mirror(1, OrderSide::Sell).unwrap();
        assert_eq!(fresh.side, OrderSide::Sell);
        assert!(!fresh.risk_deferred);

        // the empty gap level takes a mirror freely
        assert!(ledger.rebind_mirror(2, OrderSide::Sell).is_ok());
    }

    #[test]
    fn test_replace_resets_fill_counter() {
        let mut ledger = seeded();
        open(&mut ledger, 0, "a");
        let v = ledger.binding_version(0).unwrap();
        ledger
            .apply(0, BindingEvent::new(v, BindingEventKind::Fill { delta: dec!(0.25) }))
            .unwrap();
        ledger
            .apply(
                0,
                BindingEvent::new(
                    v + 1,
                    BindingEventKind::Replaced {
                        order_id: "b".into(),
                        size: dec!(0.75),
                    },
                ),
            )
            .unwrap();

        let binding = ledger.binding(0).unwrap();
        assert_eq!(binding.exchange_order_id.as_deref(), Some("b"));
        assert_eq!(binding.last_known_filled_size, dec!(0));
        assert_eq!(binding.size, dec!(0.75));
        assert_eq!(ledger.level_for_order("a"), None);
        assert_eq!(ledger.level_for_order("b"), Some(0));
    }

    #[test]
    fn test_sequence_dedupe() {
        let mut ledger = seeded();
        assert!(ledger.observe_seq(5));
        assert!(!ledger.observe_seq(5));
        assert!(ledger.observe_seq(3));
        assert_eq!(ledger.last_event_seq(), Some(5));

        let snapshot = ledger.snapshot();
        let mut restarted = OrderLedger::new(ladder());
        restarted.restore(snapshot, ledger.last_event_seq());
        assert!(!restarted.observe_seq(4));
        assert!(restarted.observe_seq(6));
    }

    #[test]
    fn test_first_event_at_sequence_zero() {
        let mut ledger = seeded();
        assert_eq!(ledger.last_event_seq(), None);
        assert!(ledger.observe_seq(0));
        assert!(!ledger.observe_seq(0));
        assert_eq!(ledger.last_event_seq(), Some(0));

        // a snapshot taken before any event keeps seq 0 fresh
        let mut restarted = OrderLedger::new(ladder());
        restarted.restore(seeded().snapshot(), None);
        assert!(restarted.observe_seq(0));

        let mut restarted = OrderLedger::new(ladder());
        restarted.restore(ledger.snapshot(), ledger.last_event_seq());
        assert!(!restarted.observe_seq(0));
        assert!(restarted.observe_seq(1));
    }

    #[test]
    fn test_restore_drops_bindings_for_moved_levels() {
        let mut ledger = seeded();
        open(&mut ledger, 0, "a");
        let snapshot = ledger.snapshot();

        let moved = vec![
            GridLevel::new(0, dec!(95), OrderSide::Buy, dec!(1)),
            GridLevel::new(1, dec!(100), OrderSide::Buy, dec!(1)),
            GridLevel::new(2, dec!(110), OrderSide::Sell, dec!(1)),
        ];
        let mut restored = OrderLedger::new(moved);
        let dropped = restored.restore(snapshot, Some(0));

        assert_eq!(dropped, 1);
        assert!(restored.binding(0).is_none());
        assert!(restored.binding(1).is_some());
        assert_eq!(restored.level_for_order("a"), None);
    }

    #[test]
    fn test_adopt_pending_binding() {
        let mut ledger = seeded();
        let v = ledger.binding_version(1).unwrap();
        ledger
            .apply(1, BindingEvent::new(v, BindingEventKind::Submitted))
            .unwrap();

        ledger.adopt(1, OrderSide::Buy, "x".into(), dec!(0.5)).unwrap();
        let binding = ledger.binding(1).unwrap();
        assert_eq!(binding.state, BindingState::Open);
        assert_eq!(binding.last_known_filled_size, dec!(0.5));
        assert_eq!(ledger.level_for_order("x"), Some(1));

        // the empty gap level can adopt too
        ledger.adopt(2, OrderSide::Sell, "y".into(), dec!(0)).unwrap();
        assert_eq!(ledger.binding(2).unwrap().side, OrderSide::Sell);
    }

    proptest! {
        /// Replaying already-delivered events in any order leaves the
        /// binding exactly where in-order delivery put it.
        #[test]
        fn prop_redelivery_is_order_independent(
            fills in proptest::collection::vec(1u32..20, 1..6),
            replays in proptest::collection::vec((0usize..64, 0usize..64), 0..24),
        ) {
            let mut events = vec![
                BindingEventKind::Submitted,
                BindingEventKind::Acknowledged { order_id: "oid".into() },
            ];
            for f in &fills {
                events.push(BindingEventKind::Fill { delta: Decimal::from(*f) / dec!(100) });
            }
            let tagged: Vec<BindingEvent> = events
                .into_iter()
                .enumerate()
                .map(|(v, kind)| BindingEvent::new(v as u64, kind))
                .collect();

            let mut in_order = seeded();
            for event in &tagged {
                in_order.apply(0, event.clone()).unwrap();
            }

            let mut shuffled = seeded();
            let mut delivered = 0usize;
            let mut replays = replays.into_iter();
            while delivered < tagged.len() {
                shuffled.apply(0, tagged[delivered].clone()).unwrap();
                delivered += 1;
                if let Some((a, b)) = replays.next() {
                    let older = &tagged[a % delivered];
                    let other = &tagged[b % delivered];
                    prop_assert_eq!(shuffled.apply(0, other.clone()).unwrap(), ApplyOutcome::Stale);
                    prop_assert_eq!(shuffled.apply(0, older.clone()).unwrap(), ApplyOutcome::Stale);
                }
            }

            prop_assert_eq!(in_order.binding(0), shuffled.binding(0));
            prop_assert_eq!(in_order.level_for_order("oid"), shuffled.level_for_order("oid"));
        }
    }
}
