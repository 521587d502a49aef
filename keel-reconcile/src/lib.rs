//! Orphan cleanup and run-state reconciliation.
//!
//! The exchange is the source of truth. `scan` compares what actually rests
//! on the venue against what the engine believes, cancels protective orders
//! that guard nothing, and corrects run states whose position has vanished.
//! It only ever acts on live exchange state, so re-running it against an
//! unchanged venue is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use keel_core::{
    Alert, EngineEvent, InstrumentId, OrderId, OrderRecord, StrategyId, StrategyPhase,
    StrategyRunState,
};
use keel_transport::{ExchangeApi, TransportError};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Run states shared between the engine and the reconciler. Guarded by a
/// std mutex; critical sections never await.
pub type SharedRunStates = Arc<Mutex<HashMap<StrategyId, StrategyRunState>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What one scan found and did.
#[derive(Clone, Debug, Default)]
pub struct ScanReport {
    pub orphans_cancelled: Vec<OrderId>,
    pub monitoring_restored: Vec<StrategyId>,
    pub cooldowns_started: Vec<StrategyId>,
    pub alerts: Vec<Alert>,
}

pub struct Reconciler {
    api: Arc<dyn ExchangeApi>,
    run_states: SharedRunStates,
    events: broadcast::Sender<EngineEvent>,
    cooldown: Duration,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        run_states: SharedRunStates,
        events: broadcast::Sender<EngineEvent>,
        cooldown: Duration,
    ) -> Self {
        Self {
            api,
            run_states,
            events,
            cooldown,
        }
    }

    /// One full pass over every instrument any strategy cares about.
    pub async fn scan(&self) -> Result<ScanReport, TransportError> {
        let mut report = ScanReport::default();
        let snapshot: Vec<StrategyRunState> = lock(&self.run_states).values().cloned().collect();
        let mut instruments: Vec<InstrumentId> = snapshot
            .iter()
            .map(|run| run.instrument.clone())
            .collect();
        instruments.sort();
        instruments.dedup();

        for instrument in &instruments {
            let open = self.api.open_orders(instrument).await?;
            let position_size = self
                .api
                .position(instrument)
                .await?
                .map(|position| position.size)
                .unwrap_or(Decimal::ZERO);

            if position_size.is_zero() {
                self.cancel_orphans(instrument, &open, &mut report).await;
            }

            for run in snapshot
                .iter()
                .filter(|run| &run.instrument == instrument && run.phase == StrategyPhase::PositionOpen)
            {
                self.check_position_open(run, position_size, &open, &mut report);
            }
        }

        for alert in &report.alerts {
            let _ = self.events.send(EngineEvent::Alert(alert.clone()));
        }
        if !report.orphans_cancelled.is_empty()
            || !report.cooldowns_started.is_empty()
            || !report.alerts.is_empty()
        {
            info!(
                orphans = report.orphans_cancelled.len(),
                cooldowns = report.cooldowns_started.len(),
                alerts = report.alerts.len(),
                "reconciliation scan acted"
            );
        }
        Ok(report)
    }

    /// With no position, every bracket-labeled or reduce-only order guards
    /// nothing and must go. Unlabeled working orders are not ours to touch.
    async fn cancel_orphans(
        &self,
        instrument: &str,
        open: &[OrderRecord],
        report: &mut ScanReport,
    ) {
        let orphans: Vec<&OrderRecord> = open
            .iter()
            .filter(|order| order.bracket_label().is_some() || order.reduce_only)
            .collect();
        if orphans.is_empty() {
            return;
        }

        let mut cancelled = Vec::new();
        for orphan in orphans {
            match self.api.cancel_order(&orphan.order_id).await {
                Ok(()) => {
                    warn!(order_id = %orphan.order_id, instrument, "cancelled orphaned order");
                    cancelled.push(orphan.order_id.clone());
                }
                Err(err) => {
                    warn!(order_id = %orphan.order_id, error = %err, "orphan cancel failed");
                }
            }
        }
        if !cancelled.is_empty() {
            report.alerts.push(Alert::OrphansCancelled {
                instrument: instrument.to_string(),
                orders: cancelled.clone(),
            });
            report.orphans_cancelled.extend(cancelled);
        }
    }

    fn check_position_open(
        &self,
        run: &StrategyRunState,
        position_size: Decimal,
        open: &[OrderRecord],
        report: &mut ScanReport,
    ) {
        if position_size.is_zero() {
            // Stop or target filled while we were not looking; the trade is
            // over and the strategy moves on through cooldown.
            self.start_cooldown(&run.id, report);
            return;
        }

        let Some(protected) = &run.protected else {
            report.alerts.push(Alert::PositionWithoutProtection {
                instrument: run.instrument.clone(),
                size: position_size,
            });
            return;
        };
        let is_live = |order_id: &OrderId| {
            open.iter()
                .any(|order| &order.order_id == order_id && order.state.is_live())
        };
        let stop_live = is_live(&protected.stop_id);
        let target_live = is_live(&protected.target_id);

        match (stop_live, target_live) {
            (true, true) => report.monitoring_restored.push(run.id.clone()),
            (false, false) => report.alerts.push(Alert::PositionWithoutProtection {
                instrument: run.instrument.clone(),
                size: position_size,
            }),
            _ => report.alerts.push(Alert::PartialProtection {
                strategy: run.id.clone(),
                instrument: run.instrument.clone(),
            }),
        }
    }

    fn start_cooldown(&self, strategy: &StrategyId, report: &mut ScanReport) {
        let mut states = lock(&self.run_states);
        let Some(run) = states.get_mut(strategy) else {
            return;
        };
        if run.phase != StrategyPhase::PositionOpen {
            return;
        }
        let from = run.phase;
        run.phase = StrategyPhase::Cooldown;
        run.protected = None;
        run.active_transaction = None;
        run.cooldown_until = Some(
            Utc::now()
                + chrono::Duration::from_std(self.cooldown).unwrap_or(chrono::Duration::zero()),
        );
        run.updated_at = Utc::now();
        info!(strategy = %strategy, "position closed on venue, entering cooldown");
        let _ = self.events.send(EngineEvent::PhaseChanged {
            strategy: strategy.clone(),
            from,
            to: StrategyPhase::Cooldown,
        });
        report.cooldowns_started.push(strategy.clone());
    }

    /// Periodic scanning with a watch-channel stop signal.
    pub fn spawn_loop(self: Arc<Self>, interval: Duration) -> ReconcilerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick is the startup scan's job
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.scan().await {
                            warn!(error = %err, "reconciliation scan failed");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
        ReconcilerHandle { stop_tx, task }
    }
}

pub struct ReconcilerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}
