//! Reconciliation engine - the single writer over ledger, risk guard and dispatcher
//!
//! Every input reaches the engine through one channel: exchange events from
//! the ingestion task, dispatcher outcomes, snapshot acknowledgements, mark
//! prices and operator commands. The engine applies them one at a time, so the
//! ledger is never touched concurrently.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::config::GridConfig;
use super::dispatcher::{DispatchOutcome, ExecutionDispatcher, Submission};
use super::errors::{GridError, GridResult};
use super::executor::GridExchange;
use super::ledger::{ApplyOutcome, BindingEvent, BindingEventKind, OrderLedger};
use super::planner::GridPlanner;
use super::recovery::{RecoveryCoordinator, RecoveryPlan};
use super::risk::{PnlTracker, RiskGuard};
use super::state::{EngineSnapshot, GridFingerprint, SnapshotStore, SnapshotWriter};
use super::types::{
    ActionKind, BindingState, CancelAck, EngineStatus, ExchangeEvent, FillEvent, GridLevel,
    OrderBinding, OrderId, OrderSide, ReconciliationAction,
};

/// How long [`ReconciliationEngine::settle`] waits for the next event
const SETTLE_IDLE: Duration = Duration::from_millis(50);

/// Commands from the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Pause,
    /// Re-run recovery and resume trading
    Resume,
    /// Cancel the level's order; `version` is the binding version the operator saw
    CancelLevel { level: u32, version: u64 },
    /// Cancel and re-place the level's order at its grid price
    Requote { level: u32, version: u64 },
    Shutdown,
}

/// Everything the engine reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Exchange(ExchangeEvent),
    Dispatch(DispatchOutcome),
    SnapshotPersisted { write_seq: u64 },
    SnapshotFailed { write_seq: u64, reason: String },
    MarkPrice(Decimal),
    Operator(OperatorCommand),
}

/// Whether the loop keeps going after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Read-only projection published after every event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineView {
    pub status: EngineStatus,
    pub bindings: Vec<OrderBinding>,
    pub last_event_seq: Option<u64>,
    pub reserved_exposure: Decimal,
    pub committed_exposure: Decimal,
    pub pnl: PnlTracker,
    pub in_flight: usize,
    pub persisted_write_seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// Cloneable handle for operators and dashboards
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
    view: watch::Receiver<EngineView>,
}

impl EngineHandle {
    pub fn send(&self, command: OperatorCommand) -> GridResult<()> {
        self.tx
            .send(EngineEvent::Operator(command))
            .map_err(|_| GridError::ChannelClosed("engine".into()))
    }

    pub fn pause(&self) -> GridResult<()> {
        self.send(OperatorCommand::Pause)
    }

    pub fn resume(&self) -> GridResult<()> {
        self.send(OperatorCommand::Resume)
    }

    pub fn shutdown(&self) -> GridResult<()> {
        self.send(OperatorCommand::Shutdown)
    }

    pub fn cancel_level(&self, level: u32, version: u64) -> GridResult<()> {
        self.send(OperatorCommand::CancelLevel { level, version })
    }

    pub fn requote(&self, level: u32, version: u64) -> GridResult<()> {
        self.send(OperatorCommand::Requote { level, version })
    }

    /// Feed a market price used for unrealized PnL and band triggers
    pub fn mark_price(&self, price: Decimal) -> GridResult<()> {
        self.tx
            .send(EngineEvent::MarkPrice(price))
            .map_err(|_| GridError::ChannelClosed("engine".into()))
    }

    /// Latest published view
    pub fn view(&self) -> EngineView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<EngineView> {
        self.view.clone()
    }
}

pub struct ReconciliationEngine<E: GridExchange + 'static> {
    config: GridConfig,
    exchange: Arc<E>,
    fingerprint: GridFingerprint,
    ledger: OrderLedger,
    risk: RiskGuard,
    dispatcher: ExecutionDispatcher<E>,
    recovery: RecoveryCoordinator<E>,
    status: EngineStatus,

    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    /// Events pulled off the channel but not yet handled
    backlog: VecDeque<EngineEvent>,
    /// Fills that arrived before their order's acknowledgement
    early_fills: HashMap<OrderId, Vec<FillEvent>>,
    ingest: Option<JoinHandle<()>>,

    writer: Option<SnapshotWriter>,
    write_seq: u64,
    persisted_seq: u64,
    dirty: bool,
    /// Persistence suspended after an inconsistency until the operator resumes
    frozen: bool,

    recovery_due: bool,
    last_band: Option<usize>,
    view_tx: watch::Sender<EngineView>,
}

impl<E: GridExchange + 'static> ReconciliationEngine<E> {
    /// Plan the grid, restore or seed the ledger and start the snapshot writer.
    ///
    /// The engine starts halted; [`start`](Self::start) or [`run`](Self::run)
    /// performs recovery before anything is placed.
    pub async fn new(
        config: GridConfig,
        exchange: Arc<E>,
        store: Arc<dyn SnapshotStore>,
    ) -> GridResult<Self> {
        let levels = GridPlanner::plan(&config)?;
        let fingerprint = GridFingerprint::new(&config, levels.len());
        let mut ledger = OrderLedger::new(levels);
        let mut risk = RiskGuard::new(config.risk.clone());
        let mut write_seq = 0;

        match store.load().await? {
            Some(snapshot) => {
                snapshot.validate_against(&fingerprint)?;
                let dropped = ledger.restore(snapshot.bindings, snapshot.last_event_seq);
                risk.restore_pnl(snapshot.pnl);
                write_seq = snapshot.write_seq;
                info!(
                    "Restored ledger: bindings={}, live={}, dropped={}, event_seq={:?}, write_seq={}",
                    ledger.bindings().count(),
                    ledger.live_count(),
                    dropped,
                    ledger.last_event_seq(),
                    write_seq
                );
            }
            None => {
                ledger.seed(config.reference_price);
                info!(
                    "New grid for {}: {} levels in [{}, {}], reference {}",
                    config.asset,
                    ledger.levels().len(),
                    config.lower_price,
                    config.upper_price,
                    config.reference_price
                );
            }
        }
        risk.rebuild(ledger.bindings());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = ExecutionDispatcher::new(
            exchange.clone(),
            config.asset.clone(),
            config.retry.clone(),
            config.request_timeout(),
            events_tx.clone(),
        );
        let recovery = RecoveryCoordinator::new(
            exchange.clone(),
            config.asset.clone(),
            config.retry.clone(),
            config.request_timeout(),
        );
        let writer = SnapshotWriter::spawn(store, events_tx.clone());

        let status = EngineStatus::Halted {
            reason: "recovery pending".into(),
        };
        let (view_tx, _) = watch::channel(build_view(&status, &ledger, &risk, 0, write_seq));

        Ok(Self {
            config,
            exchange,
            fingerprint,
            ledger,
            risk,
            dispatcher,
            recovery,
            status,
            events_tx,
            events_rx,
            backlog: VecDeque::new(),
            early_fills: HashMap::new(),
            ingest: None,
            writer: Some(writer),
            write_seq,
            persisted_seq: write_seq,
            dirty: false,
            frozen: false,
            recovery_due: false,
            last_band: None,
            view_tx,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.events_tx.clone(),
            view: self.view_tx.subscribe(),
        }
    }

    pub fn status(&self) -> &EngineStatus {
        &self.status
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    pub fn risk(&self) -> &RiskGuard {
        &self.risk
    }

    pub fn levels(&self) -> &[GridLevel] {
        self.ledger.levels()
    }

    pub fn view(&self) -> EngineView {
        build_view(
            &self.status,
            &self.ledger,
            &self.risk,
            self.dispatcher.in_flight_count(),
            self.persisted_seq,
        )
    }

    /// Subscribe to exchange events and run the initial recovery
    pub async fn start(&mut self) -> GridResult<()> {
        let result = self.recover().await;
        self.flush();
        result
    }

    /// Run until an operator shutdown, then drain and write the final snapshot
    pub async fn run(mut self) -> GridResult<()> {
        if let Err(e) = self.start().await {
            error!("Initial recovery failed, engine stays halted: {}", e);
        }

        while let Some(event) = self.next_event().await {
            self.dispatcher.reap();
            if self.handle_event(event).await == Flow::Stop {
                break;
            }
        }

        self.shutdown().await
    }

    /// Handle queued events until none arrives for a short while or the
    /// engine is told to stop
    pub async fn settle(&mut self) -> Flow {
        loop {
            self.dispatcher.reap();
            match tokio::time::timeout(SETTLE_IDLE, self.next_event()).await {
                Ok(Some(event)) => {
                    if self.handle_event(event).await == Flow::Stop {
                        return Flow::Stop;
                    }
                }
                _ => return Flow::Continue,
            }
        }
    }

    async fn next_event(&mut self) -> Option<EngineEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.events_rx.recv().await
    }

    fn try_next_event(&mut self) -> Option<EngineEvent> {
        self.backlog
            .pop_front()
            .or_else(|| self.events_rx.try_recv().ok())
    }

    /// Apply one event and everything it triggers
    pub async fn handle_event(&mut self, event: EngineEvent) -> Flow {
        let flow = match event {
            EngineEvent::Exchange(ExchangeEvent::Fill(fill)) => {
                let mut batch = vec![fill];
                self.take_queued_fills(&mut batch);
                self.on_fills(batch);
                Flow::Continue
            }
            EngineEvent::Exchange(ExchangeEvent::Cancelled {
                order_id,
                event_seq,
            }) => {
                self.on_venue_cancel(&order_id, event_seq);
                Flow::Continue
            }
            EngineEvent::Exchange(ExchangeEvent::ConnectionLost { reason }) => {
                self.on_connection_lost(reason);
                Flow::Continue
            }
            EngineEvent::Exchange(ExchangeEvent::ConnectionRestored) => {
                self.on_connection_restored().await;
                Flow::Continue
            }
            EngineEvent::Dispatch(outcome) => {
                self.on_dispatch(outcome);
                Flow::Continue
            }
            EngineEvent::SnapshotPersisted { write_seq } => {
                self.persisted_seq = self.persisted_seq.max(write_seq);
                self.risk.commit_through(write_seq);
                Flow::Continue
            }
            EngineEvent::SnapshotFailed { write_seq, reason } => {
                // the next durable transition writes the full state again
                error!(
                    "Snapshot {} not persisted: {} (last durable write {})",
                    write_seq, reason, self.persisted_seq
                );
                Flow::Continue
            }
            EngineEvent::MarkPrice(price) => {
                self.on_mark_price(price);
                Flow::Continue
            }
            EngineEvent::Operator(command) => self.on_operator(command).await,
        };

        if self.recovery_due
            && self.status.is_running()
            && self.dispatcher.in_flight_count() == 0
        {
            self.recovery_due = false;
            info!("Reconciling with exchange after an unattributed order change");
            if let Err(e) = self.recover().await {
                warn!("Reconciliation failed: {}", e);
            }
        }

        self.flush();
        flow
    }

    /// Move consecutive queued fills into `batch`
    fn take_queued_fills(&mut self, batch: &mut Vec<FillEvent>) {
        while let Some(event) = self.try_next_event() {
            match event {
                EngineEvent::Exchange(ExchangeEvent::Fill(fill)) => batch.push(fill),
                other => {
                    self.backlog.push_front(other);
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Exchange events
    // ------------------------------------------------------------------

    fn on_fills(&mut self, fills: Vec<FillEvent>) {
        let mut completed = BTreeSet::new();

        for fill in fills {
            if !self.ledger.observe_seq(fill.event_seq) {
                debug!("Duplicate fill ignored: seq={}, oid={}", fill.event_seq, fill.order_id);
                continue;
            }
            match self.ledger.level_for_order(&fill.order_id) {
                Some(level) => match self.apply_fill(level, fill.filled_delta, fill.price) {
                    Ok(true) => {
                        completed.insert(level);
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Fill not applied: oid={}, {}", fill.order_id, e),
                },
                None => {
                    debug!(
                        "Buffering fill for unacknowledged order: oid={}, size={}",
                        fill.order_id, fill.filled_delta
                    );
                    self.early_fills
                        .entry(fill.order_id.clone())
                        .or_default()
                        .push(fill);
                }
            }
        }

        self.complete_levels(completed);
    }

    /// Apply `delta` to the level's open order. Returns true when it completes the order.
    fn apply_fill(&mut self, level: u32, delta: Decimal, price: Option<Decimal>) -> GridResult<bool> {
        let binding = self
            .ledger
            .binding(level)
            .ok_or(GridError::LevelNotFound(level))?;
        let (version, side, order_price) = (binding.version, binding.side, binding.price);
        let delta = delta.min(binding.remaining_size());
        if delta <= Decimal::ZERO {
            return Ok(false);
        }

        match self
            .ledger
            .apply(level, BindingEvent::new(version, BindingEventKind::Fill { delta }))?
        {
            ApplyOutcome::Applied(state) => {
                let fill_price = price.unwrap_or(order_price);
                self.risk.record_fill(side, fill_price, delta);
                self.risk.reduce(level, order_price, delta);
                self.dirty = true;
                info!(
                    "Fill received: level={}, side={}, price={}, size={}, state={:?}",
                    level, side, fill_price, delta, state
                );
                if state == BindingState::Filled {
                    self.risk.release(level);
                    return Ok(true);
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Mirror completed levels in ascending order, then re-check risk and replenish
    fn complete_levels(&mut self, completed: BTreeSet<u32>) {
        if completed.is_empty() {
            return;
        }
        for level in completed {
            if let Err(e) = self.arm_mirror(level) {
                error!("Mirror for level {} failed: {}", level, e);
                return;
            }
        }

        self.check_risk_halt();
        if self.can_act() {
            let cleared = self.ledger.clear_risk_deferrals();
            if cleared > 0 {
                debug!("Retrying {} risk-deferred levels after fill", cleared);
            }
            self.replenish();
        }
    }

    /// Give the adjacent level a fresh binding on the opposite side
    fn arm_mirror(&mut self, level: u32) -> GridResult<()> {
        let side = self
            .ledger
            .binding(level)
            .map(|b| b.side)
            .ok_or(GridError::LevelNotFound(level))?;

        let mirror = match side {
            OrderSide::Buy => Some(level + 1)
                .filter(|i| (*i as usize) < self.ledger.levels().len()),
            OrderSide::Sell => level.checked_sub(1),
        };
        let Some(mirror) = mirror else {
            info!("Fill at grid edge has no mirror: level={}, side={}", level, side);
            return Ok(());
        };

        let armed = self
            .ledger
            .rebind_mirror(mirror, side.opposite())
            .map(|b| (b.side, b.price));
        match armed {
            Ok((mirror_side, price)) => {
                info!(
                    "Mirror armed: filled_level={}, mirror_level={}, side={}, price={}",
                    level, mirror, mirror_side, price
                );
                self.dirty = true;
                Ok(())
            }
            Err(e @ GridError::LogicInconsistency(_)) => {
                self.halt_inconsistent(&e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn on_venue_cancel(&mut self, order_id: &str, event_seq: u64) {
        if !self.ledger.observe_seq(event_seq) {
            debug!("Duplicate cancel ignored: seq={}", event_seq);
            return;
        }
        let Some(level) = self.ledger.level_for_order(order_id) else {
            debug!("Cancel for untracked order: oid={}", order_id);
            return;
        };
        if self.dispatcher.in_flight_kind(level) == Some(ActionKind::Replace) {
            debug!("Cancel echo during replace: level={}, oid={}", level, order_id);
            return;
        }
        let Some(binding) = self.ledger.binding(level) else {
            return;
        };
        let (version, requested, side) = (binding.version, binding.cancel_requested, binding.side);

        if !self.apply_binding(level, version, BindingEventKind::Cancelled) {
            return;
        }
        self.risk.release(level);

        if requested {
            info!("Order cancelled: level={}, oid={}", level, order_id);
            return;
        }

        warn!("Venue cancelled order, re-arming level: level={}, oid={}", level, order_id);
        if let Err(e) = self.ledger.rebind(level, side) {
            error!("Could not re-arm level {}: {}", level, e);
            return;
        }
        self.replenish();
    }

    fn on_connection_lost(&mut self, reason: String) {
        if self.status.is_running() {
            warn!("Connection lost, engine degraded: {}", reason);
            self.status = EngineStatus::Degraded { reason };
        } else {
            warn!("Connection lost while {:?}: {}", self.status, reason);
        }
    }

    async fn on_connection_restored(&mut self) {
        if matches!(self.status, EngineStatus::Degraded { .. }) {
            info!("Connection restored, running recovery before resuming");
            if let Err(e) = self.recover().await {
                warn!("Recovery after reconnect failed: {}", e);
            }
        } else {
            info!("Connection restored while {:?}", self.status);
        }
    }

    fn on_mark_price(&mut self, price: Decimal) {
        self.risk.mark(price);
        self.check_risk_halt();

        let band = GridPlanner::band_of(self.ledger.levels(), price);
        let previous = self.last_band.replace(band);
        if previous.is_some_and(|b| b != band) && self.can_act() {
            let cleared = self.ledger.clear_risk_deferrals();
            if cleared > 0 {
                debug!("Price entered band {}, retrying {} deferred levels", band, cleared);
                self.replenish();
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatcher outcomes
    // ------------------------------------------------------------------

    fn on_dispatch(&mut self, outcome: DispatchOutcome) {
        let level = outcome.level();
        let version = outcome.version();

        match outcome {
            DispatchOutcome::PlaceAcked { order_id, .. } => {
                let kind = BindingEventKind::Acknowledged {
                    order_id: order_id.clone(),
                };
                if self.apply_binding(level, version, kind) {
                    self.risk.acknowledge(level, self.write_seq + 1);
                    info!("Order resting: level={}, oid={}", level, order_id);
                    self.replay_early_fills(level, &order_id);
                } else {
                    warn!(
                        "Acknowledgement for a superseded binding, reconciling: level={}, oid={}",
                        level, order_id
                    );
                    self.recovery_due = true;
                }
            }
            DispatchOutcome::PlaceRejected { reason, .. } => {
                let kind = BindingEventKind::Rejected {
                    reason: reason.clone(),
                };
                if self.apply_binding(level, version, kind) {
                    self.risk.on_rejected(level, &reason);
                }
            }
            DispatchOutcome::CancelAcked {
                ack: CancelAck::Cancelled,
                ..
            } => {
                if self.apply_binding(level, version, BindingEventKind::Cancelled) {
                    self.risk.release(level);
                    info!("Order cancelled: level={}", level);
                } else if self
                    .ledger
                    .binding(level)
                    .is_some_and(|b| b.state == BindingState::Open && b.cancel_requested)
                {
                    self.recovery_due = true;
                }
            }
            DispatchOutcome::CancelAcked {
                ack: CancelAck::AlreadyClosed,
                ..
            } => {
                // the stream reports the fill or cancel that closed it
                debug!("Cancel found order already closed: level={}", level);
                self.apply_binding(level, version, BindingEventKind::CancelFailed);
            }
            DispatchOutcome::ReplaceAcked { order_id, size, .. } => {
                let kind = BindingEventKind::Replaced {
                    order_id: order_id.clone(),
                    size,
                };
                if self.apply_binding(level, version, kind) {
                    self.risk.acknowledge(level, self.write_seq + 1);
                    info!("Order re-quoted: level={}, oid={}, size={}", level, order_id, size);
                    self.replay_early_fills(level, &order_id);
                } else {
                    self.recovery_due = true;
                }
            }
            DispatchOutcome::ReplaceIncomplete { reason, .. } => {
                if self.apply_binding(level, version, BindingEventKind::Cancelled) {
                    self.risk.release(level);
                    warn!("Re-quote left level empty, re-arming: level={}, {}", level, reason);
                    let side = self.ledger.binding(level).map(|b| b.side);
                    if let Some(side) = side {
                        if let Err(e) = self.ledger.rebind(level, side) {
                            error!("Could not re-arm level {}: {}", level, e);
                        }
                    }
                } else {
                    self.recovery_due = true;
                }
            }
            DispatchOutcome::ActionFailed { kind, reason, .. } => {
                warn!(
                    "Action failed: level={}, kind={:?}, reason={}",
                    level, kind, reason
                );
                match kind {
                    ActionKind::Place => {
                        if self.apply_binding(level, version, BindingEventKind::SubmitFailed) {
                            self.risk.release(level);
                            // the request may have reached the book before timing out
                            self.recovery_due = true;
                        }
                    }
                    ActionKind::Cancel | ActionKind::Replace => {
                        self.apply_binding(level, version, BindingEventKind::CancelFailed);
                    }
                }
            }
        }

        self.dirty = true;
        if let Some(kind) = self.dispatcher.complete(level) {
            self.follow_up(level, kind);
        }
    }

    fn apply_binding(&mut self, level: u32, version: u64, kind: BindingEventKind) -> bool {
        match self.ledger.apply(level, BindingEvent::new(version, kind)) {
            Ok(outcome) => outcome.is_applied(),
            Err(e) => {
                warn!("Binding event dropped: level={}, {}", level, e);
                false
            }
        }
    }

    fn replay_early_fills(&mut self, level: u32, order_id: &str) {
        let Some(fills) = self.early_fills.remove(order_id) else {
            return;
        };
        debug!("Replaying {} early fills: level={}, oid={}", fills.len(), level, order_id);

        let mut completed = BTreeSet::new();
        for fill in fills {
            match self.apply_fill(level, fill.filled_delta, fill.price) {
                Ok(true) => {
                    completed.insert(level);
                }
                Ok(false) => {}
                Err(e) => warn!("Early fill not applied: oid={}, {}", order_id, e),
            }
        }
        self.complete_levels(completed);
    }

    /// Issue whatever was deferred while the level was busy
    fn follow_up(&mut self, level: u32, kind: ActionKind) {
        match kind {
            ActionKind::Cancel if self.can_cancel() => self.issue_cancel(level),
            ActionKind::Place if self.can_act() => self.issue_place(level),
            ActionKind::Replace if self.can_act() => self.issue_replace(level),
            _ => debug!(
                "Deferred {:?} dropped: level={}, status={:?}",
                kind, level, self.status
            ),
        }
    }

    // ------------------------------------------------------------------
    // Corrective actions
    // ------------------------------------------------------------------

    fn can_act(&self) -> bool {
        self.status.is_running() && self.dispatcher.is_accepting()
    }

    fn can_cancel(&self) -> bool {
        !matches!(self.status, EngineStatus::Degraded { .. }) && self.dispatcher.is_accepting()
    }

    /// Place every non-deferred unplaced binding, lowest level first
    fn replenish(&mut self) {
        if !self.can_act() {
            return;
        }
        for level in self.ledger.placeable_levels() {
            self.issue_place(level);
            if !self.can_act() {
                break;
            }
        }
    }

    fn issue_place(&mut self, level: u32) {
        let Some(binding) = self.ledger.binding(level) else {
            return;
        };
        if binding.state != BindingState::Unplaced || binding.risk_deferred {
            return;
        }
        if self.dispatcher.is_busy(level) {
            self.dispatcher.defer(level, ActionKind::Place);
            return;
        }
        let (version, price, size) = (binding.version, binding.price, binding.size);

        if let Err(e) = self.risk.admit(level, price, size) {
            warn!("{}; level {} waits for the next price trigger", e, level);
            if let Err(e) = self.ledger.set_risk_deferred(level, true) {
                warn!("Could not defer level {}: {}", level, e);
            }
            self.dirty = true;
            return;
        }

        if !self.apply_binding(level, version, BindingEventKind::Submitted) {
            self.risk.release(level);
            return;
        }
        self.dirty = true;

        let Some(binding) = self.ledger.binding(level) else {
            return;
        };
        let action = ReconciliationAction::place(level, binding.version);
        match self.dispatcher.submit(action, binding) {
            Submission::Dispatched => {
                debug!("Place dispatched: level={}, side={}, price={}", level, binding.side, price);
            }
            other => {
                warn!("Place not dispatched: level={}, {:?}", level, other);
                let version = binding.version;
                self.apply_binding(level, version, BindingEventKind::SubmitFailed);
                self.risk.release(level);
            }
        }
    }

    fn issue_cancel(&mut self, level: u32) {
        let Some(binding) = self.ledger.binding(level) else {
            return;
        };
        match binding.state {
            BindingState::Pending if self.dispatcher.is_busy(level) => {
                // collapses with the in-flight place into a single cancel
                self.dispatcher.defer(level, ActionKind::Cancel);
                return;
            }
            BindingState::Open if !binding.cancel_requested => {}
            state => {
                debug!("Nothing to cancel: level={}, state={:?}", level, state);
                return;
            }
        }
        if self.dispatcher.is_busy(level) {
            self.dispatcher.defer(level, ActionKind::Cancel);
            return;
        }

        let version = binding.version;
        if !self.apply_binding(level, version, BindingEventKind::CancelRequested) {
            return;
        }
        self.dirty = true;

        let Some(binding) = self.ledger.binding(level) else {
            return;
        };
        let action = ReconciliationAction::cancel(level, binding.version);
        if self.dispatcher.submit(action, binding) != Submission::Dispatched {
            let version = binding.version;
            self.apply_binding(level, version, BindingEventKind::CancelFailed);
        }
    }

    fn issue_replace(&mut self, level: u32) {
        let Some(binding) = self.ledger.binding(level) else {
            return;
        };
        if binding.state != BindingState::Open || binding.cancel_requested {
            debug!("Nothing to re-quote: level={}, state={:?}", level, binding.state);
            return;
        }
        if self.dispatcher.is_busy(level) {
            self.dispatcher.defer(level, ActionKind::Replace);
            return;
        }
        let (version, price, remaining) = (binding.version, binding.price, binding.remaining_size());

        if let Err(e) = self.risk.admit(level, price, remaining) {
            warn!("Re-quote refused: {}", e);
            return;
        }
        if !self.apply_binding(level, version, BindingEventKind::CancelRequested) {
            return;
        }
        self.dirty = true;

        let Some(binding) = self.ledger.binding(level) else {
            return;
        };
        let action = ReconciliationAction::replace(level, binding.version);
        if self.dispatcher.submit(action, binding) != Submission::Dispatched {
            let version = binding.version;
            self.apply_binding(level, version, BindingEventKind::CancelFailed);
        }
    }

    // ------------------------------------------------------------------
    // Status changes
    // ------------------------------------------------------------------

    fn check_risk_halt(&mut self) {
        if self.status.is_halted() {
            return;
        }
        if let Some(reason) = self.risk.halt_reason() {
            self.halt(reason);
        }
    }

    /// Stop emitting actions. Open orders stay on the book.
    fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        let discarded = self.dispatcher.discard_deferred_places();
        error!(
            "Engine halted: {} (discarded {} deferred actions, {} orders left live)",
            reason,
            discarded,
            self.ledger.live_count()
        );
        self.status = EngineStatus::Halted { reason };
        self.dirty = true;
    }

    /// Halt, write the state once for inspection and stop persisting
    fn halt_inconsistent(&mut self, err: &GridError) {
        self.halt(err.to_string());
        self.persist();
        self.frozen = true;
    }

    async fn on_operator(&mut self, command: OperatorCommand) -> Flow {
        info!("Operator command: {:?}", command);
        match command {
            OperatorCommand::Pause => {
                if !self.status.is_halted() {
                    self.halt("paused by operator");
                }
            }
            OperatorCommand::Resume => self.resume().await,
            OperatorCommand::CancelLevel { level, version } => {
                if self.operator_version_matches(level, version) {
                    if self.can_cancel() {
                        self.issue_cancel(level);
                    } else {
                        warn!("Cancel refused while {:?}", self.status);
                    }
                }
            }
            OperatorCommand::Requote { level, version } => {
                if self.operator_version_matches(level, version) {
                    if self.can_act() {
                        self.issue_replace(level);
                    } else {
                        warn!("Re-quote refused while {:?}", self.status);
                    }
                }
            }
            OperatorCommand::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    fn operator_version_matches(&self, level: u32, version: u64) -> bool {
        match self.ledger.binding(level) {
            Some(binding) if binding.version == version => true,
            Some(binding) => {
                warn!(
                    "Operator command for level {} ignored: saw version {}, now {} ({:?})",
                    level, version, binding.version, binding.state
                );
                false
            }
            None => {
                warn!("Operator command for level {} ignored: no binding", level);
                false
            }
        }
    }

    async fn resume(&mut self) {
        self.frozen = false;

        let rejected: Vec<(u32, OrderSide)> = self
            .ledger
            .bindings()
            .filter(|b| b.state == BindingState::Rejected)
            .map(|b| (b.level_index, b.side))
            .collect();
        for (level, side) in rejected {
            if let Err(e) = self.ledger.rebind(level, side) {
                warn!("Could not re-arm rejected level {}: {}", level, e);
            }
        }
        self.ledger.clear_risk_deferrals();
        self.risk.rearm();
        self.dirty = true;

        if let Err(e) = self.recover().await {
            warn!("Resume failed, engine stays halted: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    async fn subscribe(&mut self) -> GridResult<()> {
        if self.ingest.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let mut rx = self.exchange.subscribe_fills(&self.config.asset).await?;
        let tx = self.events_tx.clone();
        self.ingest = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if tx.send(EngineEvent::Exchange(event)).is_err() {
                    return;
                }
            }
            let _ = tx.send(EngineEvent::Exchange(ExchangeEvent::ConnectionLost {
                reason: "event stream closed".into(),
            }));
        }));
        debug!("Subscribed to exchange events for {}", self.config.asset);
        Ok(())
    }

    /// Converge the ledger with the exchange and resume trading.
    ///
    /// On failure the engine is left halted with the reason.
    pub async fn recover(&mut self) -> GridResult<()> {
        self.status = EngineStatus::Halted {
            reason: "recovery in progress".into(),
        };

        if let Err(e) = self.subscribe().await {
            let err = GridError::RecoveryIncomplete(format!("subscription failed: {e}"));
            self.halt(err.to_string());
            return Err(err);
        }

        self.settle_in_flight().await;

        let plan = match self.recovery.plan(&self.ledger).await {
            Ok(plan) => plan,
            Err(e) => {
                self.halt(e.to_string());
                return Err(e);
            }
        };
        self.apply_plan(plan)
    }

    /// Let in-flight calls finish and apply their outcomes ahead of other events
    async fn settle_in_flight(&mut self) {
        if self.dispatcher.in_flight_count() == 0 {
            return;
        }
        self.dispatcher.wait_idle(self.config.shutdown_grace()).await;

        let mut others = VecDeque::new();
        while let Some(event) = self.try_next_event() {
            match event {
                EngineEvent::Dispatch(outcome) => self.on_dispatch(outcome),
                other => others.push_back(other),
            }
        }
        self.backlog = others;
    }

    fn apply_plan(&mut self, plan: RecoveryPlan) -> GridResult<()> {
        if plan.is_noop() {
            debug!("Ledger consistent with exchange: {} orders", plan.consistent);
        }

        let mut completed = BTreeSet::new();

        for adoption in plan.adopt {
            match self.ledger.adopt(
                adoption.level,
                adoption.side,
                adoption.order_id.clone(),
                adoption.filled_size,
            ) {
                Ok(()) => info!(
                    "Adopted exchange order: level={}, oid={}, side={}",
                    adoption.level, adoption.order_id, adoption.side
                ),
                Err(e) => warn!("Could not adopt {}: {}", adoption.order_id, e),
            }
        }

        for update in plan.fill_updates {
            if let Ok(true) = self.apply_fill(update.level, update.unseen_fill, None) {
                completed.insert(update.level);
            }
        }

        for resolution in plan.filled {
            let remaining = self
                .ledger
                .binding(resolution.level)
                .map(|b| b.remaining_size())
                .unwrap_or_default();
            match self.apply_fill(resolution.level, remaining, None) {
                Ok(true) => {
                    info!("Order filled while away: level={}", resolution.level);
                    completed.insert(resolution.level);
                }
                Ok(false) => {}
                Err(e) => warn!("Could not resolve level {}: {}", resolution.level, e),
            }
        }

        for resolution in plan.cancelled {
            let level = resolution.level;
            if resolution.unseen_fill > Decimal::ZERO {
                if let Ok(true) = self.apply_fill(level, resolution.unseen_fill, None) {
                    completed.insert(level);
                    continue;
                }
            }
            let Some(binding) = self.ledger.binding(level) else {
                continue;
            };
            let (version, side) = (binding.version, binding.side);
            if self.apply_binding(level, version, BindingEventKind::Cancelled) {
                self.risk.release(level);
                info!("Order gone while away, re-arming: level={}", level);
                if let Err(e) = self.ledger.rebind(level, side) {
                    warn!("Could not re-arm level {}: {}", level, e);
                }
            }
        }

        for level in plan.reset_pending {
            if let Ok(version) = self.ledger.binding_version(level) {
                self.apply_binding(level, version, BindingEventKind::SubmitFailed);
                debug!("Unconfirmed place reset: level={}", level);
            }
        }

        self.early_fills.clear();
        self.risk.rebuild(self.ledger.bindings());
        self.dirty = true;

        for level in completed {
            self.arm_mirror(level)?;
        }

        if !plan.unknown.is_empty() {
            let err = GridError::UnknownOrder(plan.unknown);
            self.halt(err.to_string());
            return Err(err);
        }

        if let Some(reason) = self.risk.halt_reason() {
            self.halt(reason);
            return Ok(());
        }

        self.status = EngineStatus::Running;
        info!(
            "Recovery complete, engine running: live_orders={}, placeable={}",
            self.ledger.live_count(),
            self.ledger.placeable_levels().len()
        );
        self.replenish();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence and view
    // ------------------------------------------------------------------

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            bindings: self.ledger.snapshot(),
            last_event_seq: self.ledger.last_event_seq(),
            write_seq: self.write_seq,
            fingerprint: self.fingerprint.clone(),
            pnl: self.risk.pnl().clone(),
            saved_at: Utc::now(),
        }
    }

    fn persist(&mut self) {
        self.dirty = false;
        if self.frozen {
            return;
        }
        let Some(writer) = &self.writer else {
            return;
        };
        self.write_seq += 1;
        let snapshot = self.snapshot();
        if let Err(e) = writer.submit(snapshot) {
            error!("Snapshot {} not queued: {}", self.write_seq, e);
        }
    }

    fn flush(&mut self) {
        if self.dirty {
            self.persist();
        }
        self.view_tx.send_replace(self.view());
    }

    /// Stop issuing calls, wait for in-flight ones, write the final snapshot
    pub async fn shutdown(mut self) -> GridResult<()> {
        info!("Shutting down: in_flight={}", self.dispatcher.in_flight_count());
        self.dispatcher.close();
        self.dispatcher.wait_idle(self.config.shutdown_grace()).await;

        while let Some(event) = self.try_next_event() {
            match event {
                EngineEvent::Dispatch(outcome) => self.on_dispatch(outcome),
                EngineEvent::SnapshotPersisted { write_seq } => {
                    self.persisted_seq = self.persisted_seq.max(write_seq);
                }
                _ => {}
            }
        }

        let discarded = self.dispatcher.discard_deferred();
        if discarded > 0 {
            info!("Discarded {} deferred actions", discarded);
        }
        if let Some(ingest) = self.ingest.take() {
            ingest.abort();
        }

        let last = if self.frozen {
            None
        } else {
            self.write_seq += 1;
            Some(self.snapshot())
        };
        let final_seq = self.write_seq;
        self.view_tx.send_replace(self.view());

        if let Some(writer) = self.writer.take() {
            writer.shutdown(last).await?;
        }
        info!(
            "Engine stopped: status={:?}, live_orders={}, write_seq={}",
            self.status,
            self.ledger.live_count(),
            final_seq
        );
        Ok(())
    }
}

fn build_view(
    status: &EngineStatus,
    ledger: &OrderLedger,
    risk: &RiskGuard,
    in_flight: usize,
    persisted_write_seq: u64,
) -> EngineView {
    EngineView {
        status: status.clone(),
        bindings: ledger.snapshot(),
        last_event_seq: ledger.last_event_seq(),
        reserved_exposure: risk.reserved_exposure(),
        committed_exposure: risk.committed_exposure(),
        pnl: risk.pnl().clone(),
        in_flight,
        persisted_write_seq,
        updated_at: Utc::now(),
    }
}
