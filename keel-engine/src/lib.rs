//! Strategy lifecycle controller and the downstream control surface.
//!
//! The engine owns the run-state map, drives each strategy through its phase
//! machine, and is the only component that mutates phases outside of
//! reconciliation. Every transition is persisted before the call returns and
//! mirrored on the broadcast event channel.

mod strategy;

pub use strategy::{EntrySignal, StrategyKind, StrategySpec, TradePlan};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use keel_config::AppConfig;
use keel_core::{
    Alert, BracketOutcome, EngineEvent, OrderId, ProtectedPosition, RollbackTrigger, StrategyId,
    StrategyPhase, StrategyRunState,
};
use keel_execution::{BracketConfig, BracketError, BracketIntent, BracketManager};
use keel_persist::{PersistError, PersistedState, StateRepository};
use keel_reconcile::{Reconciler, ReconcilerHandle, SharedRunStates};
use keel_risk::{size_position, SizeError, SizeRequest};
use keel_transport::{ExchangeApi, TransportError};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const EVENT_BUFFER: usize = 256;
const COOLDOWN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(StrategyId),
    #[error("strategy '{0}' is already registered")]
    DuplicateStrategy(StrategyId),
    #[error("strategy '{0}' already has an operation in flight")]
    Busy(StrategyId),
    #[error("strategy is in phase {phase:?} and not accepting signals")]
    NotAcceptingSignals { phase: StrategyPhase },
    #[error("illegal phase transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: StrategyPhase,
        to: StrategyPhase,
    },
    #[error("signal rejected: {0}")]
    InvalidSignal(String),
    #[error("bracket could not be verifiably unwound; still resting: {remaining:?}")]
    Unrecoverable { remaining: Vec<OrderId> },
    #[error("exchange rejected the bracket: {0}")]
    BracketRejected(String),
    #[error(transparent)]
    Size(#[from] SizeError),
    #[error(transparent)]
    Bracket(#[from] BracketError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("background task failed: {0}")]
    Background(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Engine {
    api: Arc<dyn ExchangeApi>,
    repo: Arc<dyn StateRepository>,
    brackets: BracketManager,
    run_states: SharedRunStates,
    specs: Mutex<HashMap<StrategyId, StrategySpec>>,
    busy: Mutex<HashSet<StrategyId>>,
    idle_notify: Notify,
    events: broadcast::Sender<EngineEvent>,
    ticker_stop: watch::Sender<bool>,
    ticker_task: Mutex<Option<JoinHandle<()>>>,
    reconcile_handle: Mutex<Option<ReconcilerHandle>>,
}

/// Marks a strategy busy for the lifetime of one signal submission.
struct BusyGuard<'a> {
    engine: &'a Engine,
    id: StrategyId,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        lock(&self.engine.busy).remove(&self.id);
        self.engine.idle_notify.notify_waiters();
    }
}

impl Engine {
    /// Load persisted state, run one reconciliation scan, then start the
    /// periodic scan and cooldown timers. Signals are accepted only after
    /// the startup scan has had its chance to correct stale state.
    pub async fn start(
        api: Arc<dyn ExchangeApi>,
        repo: Arc<dyn StateRepository>,
        config: &AppConfig,
    ) -> Result<Arc<Self>, EngineError> {
        let loaded = {
            let repo = Arc::clone(&repo);
            tokio::task::spawn_blocking(move || repo.load())
                .await
                .map_err(|err| EngineError::Background(err.to_string()))??
        };
        if !loaded.run_states.is_empty() {
            info!(strategies = loaded.run_states.len(), "resuming persisted run states");
        }

        let run_states: SharedRunStates = Arc::new(Mutex::new(loaded.run_states));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let cooldown = config.engine.cooldown();
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&api),
            Arc::clone(&run_states),
            events.clone(),
            cooldown,
        ));

        match reconciler.scan().await {
            Ok(report) => {
                if !report.orphans_cancelled.is_empty() {
                    warn!(
                        orphans = report.orphans_cancelled.len(),
                        "startup scan cleaned orphaned orders"
                    );
                }
            }
            Err(err) => warn!(error = %err, "startup reconciliation scan failed"),
        }
        let reconcile_handle = Arc::clone(&reconciler).spawn_loop(config.reconcile.scan_interval());

        let (ticker_stop, ticker_rx) = watch::channel(false);
        let brackets = BracketManager::new(
            Arc::clone(&api),
            BracketConfig::from(&config.execution),
        );
        let engine = Arc::new(Self {
            api,
            repo,
            brackets,
            run_states,
            specs: Mutex::new(HashMap::new()),
            busy: Mutex::new(HashSet::new()),
            idle_notify: Notify::new(),
            events,
            ticker_stop,
            ticker_task: Mutex::new(None),
            reconcile_handle: Mutex::new(Some(reconcile_handle)),
        });

        let ticker = tokio::spawn(run_cooldown_ticker(Arc::clone(&engine), ticker_rx));
        *lock(&engine.ticker_task) = Some(ticker);
        Ok(engine)
    }

    /// Register a strategy. If a persisted run state with the same id exists
    /// it is re-adopted as-is (including an open, protected position).
    pub async fn start_strategy(&self, spec: StrategySpec) -> Result<StrategyId, EngineError> {
        let id = spec.id.clone();
        {
            let mut specs = lock(&self.specs);
            if specs.contains_key(&id) {
                return Err(EngineError::DuplicateStrategy(id));
            }
            specs.insert(id.clone(), spec.clone());
        }

        let resumed_phase = {
            let mut states = lock(&self.run_states);
            match states.get(&id) {
                Some(existing) => Some(existing.phase),
                None => {
                    states.insert(
                        id.clone(),
                        StrategyRunState::new(id.clone(), spec.instrument.instrument.clone()),
                    );
                    None
                }
            }
        };
        match resumed_phase {
            Some(phase) => info!(strategy = %id, ?phase, "re-adopted persisted strategy"),
            None => {
                self.transition(&id, StrategyPhase::Analyzing)?;
                info!(strategy = %id, "strategy started");
            }
        }
        self.persist().await?;
        Ok(id)
    }

    /// Act on an entry decision. Accepted only while `Analyzing` (or once a
    /// cooldown has elapsed). A bracket that rolls back cleanly returns
    /// `Ok`; the outcome is on the event channel either way.
    pub async fn submit_signal(
        &self,
        id: &StrategyId,
        signal: EntrySignal,
    ) -> Result<(), EngineError> {
        let spec = lock(&self.specs)
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStrategy(id.clone()))?;

        {
            let mut busy = lock(&self.busy);
            if busy.contains(id) {
                return Err(EngineError::Busy(id.clone()));
            }
            busy.insert(id.clone());
        }
        let _busy = BusyGuard {
            engine: self,
            id: id.clone(),
        };

        let (phase, cooldown_until) = {
            let states = lock(&self.run_states);
            let run = states
                .get(id)
                .ok_or_else(|| EngineError::UnknownStrategy(id.clone()))?;
            (run.phase, run.cooldown_until)
        };
        let phase = if phase == StrategyPhase::Cooldown
            && cooldown_until.map_or(true, |until| Utc::now() >= until)
        {
            self.transition(id, StrategyPhase::Analyzing)?;
            self.persist().await?;
            StrategyPhase::Analyzing
        } else {
            phase
        };
        if phase != StrategyPhase::Analyzing {
            return Err(EngineError::NotAcceptingSignals { phase });
        }

        let plan = spec.kind.plan(&signal)?;
        let equity = self.api.account_equity(&spec.currency).await?;
        let size = size_position(&SizeRequest {
            equity,
            mode: spec.risk,
            entry_price: plan.entry,
            stop_price: plan.stop,
            instrument: spec.instrument.clone(),
        })?;
        info!(
            strategy = %id,
            quantity = %size.quantity,
            leverage = %size.leverage,
            "signal sized, placing bracket"
        );

        self.transition(id, StrategyPhase::EntryPending)?;
        self.persist().await?;

        let placed = self
            .brackets
            .place(BracketIntent {
                strategy: id.clone(),
                instrument: spec.instrument.instrument.clone(),
                side: plan.side,
                quantity: size.quantity,
                entry_price: plan.entry,
                stop_price: plan.stop,
                target_price: plan.target,
            })
            .await;

        let transaction = match placed {
            Ok(transaction) => transaction,
            Err(err) => {
                // Nothing reached the exchange; back to watching the market.
                // Orphans blocking an entry also go out as an alert.
                if let BracketError::OrphansPresent { instrument, orders } = &err {
                    self.emit(EngineEvent::Alert(Alert::OrphansDetected {
                        instrument: instrument.clone(),
                        orders: orders.clone(),
                    }));
                }
                self.transition(id, StrategyPhase::Analyzing)?;
                self.persist().await?;
                return Err(err.into());
            }
        };

        let outcome = transaction.outcome.clone().unwrap_or_else(|| {
            BracketOutcome::RolledBack {
                reason: "bracket ended without an outcome".into(),
                trigger: RollbackTrigger::ConnectivityLost,
            }
        });
        self.emit(EngineEvent::BracketResolved {
            strategy: id.clone(),
            transaction: transaction.id,
            outcome: outcome.clone(),
        });

        match outcome {
            BracketOutcome::Confirmed {
                entry_id,
                stop_id,
                target_id,
            } => {
                self.transition(id, StrategyPhase::PositionOpen)?;
                self.update_run(id, |run| {
                    run.active_transaction = Some(transaction.id);
                    run.protected = Some(ProtectedPosition {
                        transaction: transaction.id,
                        entry_id,
                        stop_id,
                        target_id,
                        quantity: transaction.quantity,
                    });
                })?;
                self.persist().await?;
                Ok(())
            }
            BracketOutcome::RolledBack { reason, trigger } => {
                if trigger == RollbackTrigger::OrderRejected {
                    // A rejected order would reject again on retry.
                    error!(strategy = %id, %reason, "exchange rejected the bracket, halting");
                    self.halt(id, format!("exchange rejected bracket: {reason}"), None)?;
                    self.persist().await?;
                    return Err(EngineError::BracketRejected(reason));
                }
                info!(strategy = %id, %reason, ?trigger, "bracket rolled back, resuming analysis");
                self.transition(id, StrategyPhase::Analyzing)?;
                self.persist().await?;
                Ok(())
            }
            BracketOutcome::Unrecoverable { remaining } => {
                error!(strategy = %id, ?remaining, "bracket unrecoverable, halting strategy");
                self.halt(
                    id,
                    format!("unrecoverable bracket {}", transaction.id),
                    Some(Alert::UnrecoverableBracket {
                        transaction: transaction.id,
                        remaining: remaining.clone(),
                    }),
                )?;
                self.persist().await?;
                Err(EngineError::Unrecoverable { remaining })
            }
        }
    }

    /// Deregister a strategy. Waits for any in-flight bracket or rollback to
    /// finish first. An open position keeps its protective orders resting;
    /// stopping monitoring must never strip protection.
    pub async fn stop_strategy(&self, id: &StrategyId) -> Result<(), EngineError> {
        if lock(&self.specs).remove(id).is_none() {
            return Err(EngineError::UnknownStrategy(id.clone()));
        }
        self.wait_until_idle(id).await;
        self.persist().await?;
        info!(strategy = %id, "strategy stopped");
        Ok(())
    }

    /// The explicit operator action required to leave `Error`.
    pub async fn restart_strategy(&self, id: &StrategyId) -> Result<(), EngineError> {
        if !lock(&self.specs).contains_key(id) {
            return Err(EngineError::UnknownStrategy(id.clone()));
        }
        let phase = lock(&self.run_states)
            .get(id)
            .map(|run| run.phase)
            .ok_or_else(|| EngineError::UnknownStrategy(id.clone()))?;
        if phase != StrategyPhase::Error {
            return Err(EngineError::IllegalTransition {
                from: phase,
                to: StrategyPhase::Analyzing,
            });
        }
        self.transition(id, StrategyPhase::Analyzing)?;
        self.persist().await?;
        info!(strategy = %id, "strategy restarted after halt");
        Ok(())
    }

    pub fn status(&self, id: &StrategyId) -> Result<StrategyRunState, EngineError> {
        lock(&self.run_states)
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStrategy(id.clone()))
    }

    /// The push channel: phase changes, bracket outcomes and alerts.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Stop background loops, wait out in-flight work and write the final
    /// snapshot.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let _ = self.ticker_stop.send(true);
        if let Some(task) = lock(&self.ticker_task).take() {
            let _ = task.await;
        }
        let handle = lock(&self.reconcile_handle).take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        loop {
            let notified = self.idle_notify.notified();
            if lock(&self.busy).is_empty() {
                break;
            }
            notified.await;
        }
        self.persist().await?;
        info!("engine shut down");
        Ok(())
    }

    async fn wait_until_idle(&self, id: &StrategyId) {
        loop {
            let notified = self.idle_notify.notified();
            if !lock(&self.busy).contains(id) {
                return;
            }
            notified.await;
        }
    }

    fn transition(&self, id: &StrategyId, to: StrategyPhase) -> Result<(), EngineError> {
        let from = {
            let mut states = lock(&self.run_states);
            let run = states
                .get_mut(id)
                .ok_or_else(|| EngineError::UnknownStrategy(id.clone()))?;
            if !run.phase.can_transition_to(to) {
                return Err(EngineError::IllegalTransition {
                    from: run.phase,
                    to,
                });
            }
            let from = run.phase;
            run.phase = to;
            if to == StrategyPhase::Analyzing {
                run.cooldown_until = None;
                run.active_transaction = None;
            }
            run.updated_at = Utc::now();
            from
        };
        self.emit(EngineEvent::PhaseChanged {
            strategy: id.clone(),
            from,
            to,
        });
        Ok(())
    }

    fn update_run(
        &self,
        id: &StrategyId,
        mutate: impl FnOnce(&mut StrategyRunState),
    ) -> Result<(), EngineError> {
        let mut states = lock(&self.run_states);
        let run = states
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownStrategy(id.clone()))?;
        mutate(run);
        run.updated_at = Utc::now();
        Ok(())
    }

    fn halt(
        &self,
        id: &StrategyId,
        reason: String,
        alert: Option<Alert>,
    ) -> Result<(), EngineError> {
        self.transition(id, StrategyPhase::Error)?;
        self.update_run(id, |run| {
            run.error_count += 1;
            run.active_transaction = None;
            run.protected = None;
        })?;
        if let Some(alert) = alert {
            self.emit(EngineEvent::Alert(alert));
        }
        self.emit(EngineEvent::Alert(Alert::StrategyHalted {
            strategy: id.clone(),
            reason,
        }));
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    async fn persist(&self) -> Result<(), EngineError> {
        let snapshot = PersistedState {
            run_states: lock(&self.run_states).clone(),
        };
        let repo = Arc::clone(&self.repo);
        tokio::task::spawn_blocking(move || repo.save(&snapshot))
            .await
            .map_err(|err| EngineError::Background(err.to_string()))??;
        Ok(())
    }
}

/// Moves strategies out of `Cooldown` once their window has elapsed.
async fn run_cooldown_ticker(engine: Arc<Engine>, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(COOLDOWN_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                let expired: Vec<StrategyId> = lock(&engine.run_states)
                    .values()
                    .filter(|run| {
                        run.phase == StrategyPhase::Cooldown && run.cooldown_elapsed(now)
                    })
                    .map(|run| run.id.clone())
                    .collect();
                if expired.is_empty() {
                    continue;
                }
                for id in &expired {
                    if let Err(err) = engine.transition(id, StrategyPhase::Analyzing) {
                        warn!(strategy = %id, error = %err, "cooldown advance failed");
                    }
                }
                if let Err(err) = engine.persist().await {
                    warn!(error = %err, "persist after cooldown advance failed");
                }
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    return;
                }
            }
        }
    }
}
