//! Atomic bracket placement.
//!
//! A bracket is an entry plus its two protective orders. `place` either ends
//! with the position fully protected, verifiably unwinds everything it
//! placed, or reports exactly which orders it could not remove. It never
//! leaves the outcome ambiguous and it is never cancelled mid-flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use keel_config::ExecutionConfig;
use keel_core::{
    BracketOutcome, BracketTransaction, InstrumentId, OrderId, OrderIntent, OrderKind,
    OrderRecord, OrderRole, OrderState, Price, Quantity, RollbackTrigger, Side, StrategyId,
    TransactionId,
};
use keel_transport::{ExchangeApi, TransportError};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Timing bounds for the placement protocol's polling steps.
#[derive(Clone, Debug)]
pub struct BracketConfig {
    pub fill_poll_attempts: u32,
    pub fill_poll_interval: Duration,
    pub position_confirm_attempts: u32,
    pub position_confirm_interval: Duration,
    pub cancel_verify_attempts: u32,
}

impl Default for BracketConfig {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

impl From<&ExecutionConfig> for BracketConfig {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            fill_poll_attempts: config.fill_poll_attempts,
            fill_poll_interval: config.fill_poll_interval(),
            position_confirm_attempts: config.position_confirm_attempts,
            position_confirm_interval: config.position_confirm_interval(),
            cancel_verify_attempts: config.cancel_verify_attempts,
        }
    }
}

/// What a strategy asks for: a protected position.
#[derive(Clone, Debug)]
pub struct BracketIntent {
    pub strategy: StrategyId,
    pub instrument: InstrumentId,
    pub side: Side,
    pub quantity: Quantity,
    pub entry_price: Price,
    pub stop_price: Price,
    pub target_price: Price,
}

#[derive(Debug, Error)]
pub enum BracketError {
    #[error("a bracket for {strategy} on {instrument} is already in flight")]
    AlreadyInFlight {
        strategy: StrategyId,
        instrument: InstrumentId,
    },
    #[error("orphaned bracket orders rest on {instrument}: {orders:?}")]
    OrphansPresent {
        instrument: InstrumentId,
        orders: Vec<OrderId>,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

type InFlightSet = Mutex<HashSet<(StrategyId, InstrumentId)>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Retryable failures are connectivity problems; everything else is the
/// exchange refusing the order outright.
fn placement_trigger(err: &TransportError) -> RollbackTrigger {
    if err.is_retryable() {
        RollbackTrigger::ConnectivityLost
    } else {
        RollbackTrigger::OrderRejected
    }
}

/// Removes the in-flight key when the attempt ends, however it ends.
struct InFlightGuard<'a> {
    set: &'a InFlightSet,
    key: (StrategyId, InstrumentId),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.key);
    }
}

pub struct BracketManager {
    api: Arc<dyn ExchangeApi>,
    config: BracketConfig,
    in_flight: InFlightSet,
}

impl BracketManager {
    pub fn new(api: Arc<dyn ExchangeApi>, config: BracketConfig) -> Self {
        Self {
            api,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Run the full placement protocol. Once the entry has been sent this
    /// always returns a transaction with a terminal [`BracketOutcome`];
    /// errors are only possible before anything touched the exchange.
    pub async fn place(&self, intent: BracketIntent) -> Result<BracketTransaction, BracketError> {
        let key = (intent.strategy.clone(), intent.instrument.clone());
        {
            let mut in_flight = lock(&self.in_flight);
            if in_flight.contains(&key) {
                // Reject, never queue: a queued entry would execute against
                // market conditions the strategy no longer believes in.
                return Err(BracketError::AlreadyInFlight {
                    strategy: key.0,
                    instrument: key.1,
                });
            }
            in_flight.insert(key.clone());
        }
        let _guard = InFlightGuard {
            set: &self.in_flight,
            key,
        };

        self.check_for_orphans(&intent.instrument).await?;

        let mut transaction = BracketTransaction {
            id: TransactionId::generate(),
            strategy: intent.strategy.clone(),
            instrument: intent.instrument.clone(),
            side: intent.side,
            quantity: intent.quantity,
            entry_price: intent.entry_price,
            stop_price: intent.stop_price,
            target_price: intent.target_price,
            placed_orders: Vec::new(),
            outcome: None,
            created_at: Utc::now(),
        };
        let outcome = self.run_protocol(&intent, &mut transaction).await;
        info!(
            transaction = %transaction.id,
            strategy = %intent.strategy,
            confirmed = outcome.is_confirmed(),
            "bracket resolved"
        );
        transaction.outcome = Some(outcome);
        Ok(transaction)
    }

    /// Labeled or reduce-only orders resting against a flat position mean a
    /// previous attempt was not fully cleaned up; entering on top of them
    /// could double the exposure. Against a live position the same orders
    /// are its protection and must not block anything.
    async fn check_for_orphans(&self, instrument: &str) -> Result<(), BracketError> {
        let position = self.api.position(instrument).await?;
        if position.map_or(false, |position| !position.is_flat()) {
            return Ok(());
        }
        let open = self.api.open_orders(instrument).await?;
        let orphans: Vec<OrderId> = open
            .iter()
            .filter(|order| order.bracket_label().is_some() || order.reduce_only)
            .map(|order| order.order_id.clone())
            .collect();
        if orphans.is_empty() {
            Ok(())
        } else {
            Err(BracketError::OrphansPresent {
                instrument: instrument.to_string(),
                orders: orphans,
            })
        }
    }

    async fn run_protocol(
        &self,
        intent: &BracketIntent,
        transaction: &mut BracketTransaction,
    ) -> BracketOutcome {
        // Step 1: labeled market entry.
        let entry = match self
            .api
            .place_order(&OrderIntent {
                instrument: intent.instrument.clone(),
                side: intent.side,
                kind: OrderKind::Market,
                quantity: intent.quantity,
                price: None,
                trigger_price: None,
                label: Some(transaction.label(OrderRole::Entry)),
                reduce_only: false,
            })
            .await
        {
            Ok(entry) => entry,
            Err(err) => {
                // Nothing reached the book; no cleanup needed.
                warn!(error = %err, "entry placement rejected");
                return BracketOutcome::RolledBack {
                    reason: format!("entry rejected: {err}"),
                    trigger: placement_trigger(&err),
                };
            }
        };
        transaction.placed_orders.push(entry.order_id.clone());
        debug!(order_id = %entry.order_id, "entry placed");

        // Step 2: bounded fill confirmation.
        let filled_quantity = match self.await_fill(&entry).await {
            Some(filled) => filled,
            None => {
                warn!(order_id = %entry.order_id, "entry did not fill in time");
                return self
                    .rollback(
                        transaction,
                        "entry fill confirmation timed out",
                        RollbackTrigger::FillTimeout,
                    )
                    .await;
            }
        };

        // Step 3: the position must actually exist before we protect it.
        if !self.confirm_position(intent, filled_quantity).await {
            warn!(instrument = %intent.instrument, "position not confirmed after fill");
            return self
                .rollback(
                    transaction,
                    "position confirmation failed",
                    RollbackTrigger::PositionUnconfirmed,
                )
                .await;
        }

        // Step 4: reduce-only stop sized to the confirmed fill.
        let stop = match self
            .api
            .place_order(&OrderIntent {
                instrument: intent.instrument.clone(),
                side: intent.side.inverse(),
                kind: OrderKind::StopMarket,
                quantity: filled_quantity,
                price: None,
                trigger_price: Some(intent.stop_price),
                label: Some(transaction.label(OrderRole::StopLoss)),
                reduce_only: true,
            })
            .await
        {
            Ok(stop) => stop,
            Err(err) => {
                warn!(error = %err, "stop placement failed");
                return self
                    .rollback(
                        transaction,
                        &format!("stop placement failed: {err}"),
                        placement_trigger(&err),
                    )
                    .await;
            }
        };
        transaction.placed_orders.push(stop.order_id.clone());
        debug!(order_id = %stop.order_id, "stop placed");

        // Step 5: reduce-only target.
        let target = match self
            .api
            .place_order(&OrderIntent {
                instrument: intent.instrument.clone(),
                side: intent.side.inverse(),
                kind: OrderKind::Limit,
                quantity: filled_quantity,
                price: Some(intent.target_price),
                trigger_price: None,
                label: Some(transaction.label(OrderRole::TakeProfit)),
                reduce_only: true,
            })
            .await
        {
            Ok(target) => target,
            Err(err) => {
                warn!(error = %err, "target placement failed");
                return self
                    .rollback(
                        transaction,
                        &format!("target placement failed: {err}"),
                        placement_trigger(&err),
                    )
                    .await;
            }
        };
        transaction.placed_orders.push(target.order_id.clone());
        debug!(order_id = %target.order_id, "target placed");

        BracketOutcome::Confirmed {
            entry_id: entry.order_id.clone(),
            stop_id: stop.order_id.clone(),
            target_id: target.order_id.clone(),
        }
    }

    /// Poll the entry until it fills. Transport hiccups count as a spent
    /// attempt rather than aborting a possibly half-filled entry.
    async fn await_fill(&self, entry: &OrderRecord) -> Option<Quantity> {
        for attempt in 1..=self.config.fill_poll_attempts {
            match self.api.order_state(&entry.order_id).await {
                Ok(order) if order.state == OrderState::Filled => {
                    return Some(order.filled_quantity)
                }
                Ok(order)
                    if order.state == OrderState::Cancelled
                        || order.state == OrderState::Rejected =>
                {
                    warn!(order_id = %entry.order_id, state = ?order.state, "entry died on the book");
                    return None;
                }
                Ok(_) => {}
                Err(err) => warn!(attempt, error = %err, "fill poll failed"),
            }
            tokio::time::sleep(self.config.fill_poll_interval).await;
        }
        None
    }

    async fn confirm_position(&self, intent: &BracketIntent, filled: Quantity) -> bool {
        for attempt in 1..=self.config.position_confirm_attempts {
            match self.api.position(&intent.instrument).await {
                Ok(Some(position)) => {
                    let aligned = match intent.side {
                        Side::Buy => position.size > Decimal::ZERO,
                        Side::Sell => position.size < Decimal::ZERO,
                    };
                    if aligned && position.abs_size() >= filled {
                        return true;
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(attempt, error = %err, "position confirm failed"),
            }
            tokio::time::sleep(self.config.position_confirm_interval).await;
        }
        false
    }

    /// Cancel everything this transaction placed, then prove the book is
    /// clean. Runs to completion regardless of individual failures; whatever
    /// survives is reported, never forgotten.
    async fn rollback(
        &self,
        transaction: &BracketTransaction,
        reason: &str,
        trigger: RollbackTrigger,
    ) -> BracketOutcome {
        info!(transaction = %transaction.id, reason, "rolling back bracket");
        for order_id in &transaction.placed_orders {
            if let Err(err) = self.api.cancel_order(order_id).await {
                warn!(order_id = %order_id, error = %err, "cancel failed during rollback");
            }
        }

        for attempt in 1..=self.config.cancel_verify_attempts {
            match self.api.open_orders(&transaction.instrument).await {
                Ok(open) => {
                    let survivors: Vec<OrderId> = open
                        .iter()
                        .filter(|order| transaction.placed_orders.contains(&order.order_id))
                        .map(|order| order.order_id.clone())
                        .collect();
                    if survivors.is_empty() {
                        return BracketOutcome::RolledBack {
                            reason: reason.to_string(),
                            trigger,
                        };
                    }
                    warn!(attempt, ?survivors, "orders survived rollback, re-cancelling");
                    for order_id in &survivors {
                        if let Err(err) = self.api.cancel_order(order_id).await {
                            warn!(order_id = %order_id, error = %err, "re-cancel failed");
                        }
                    }
                    if attempt == self.config.cancel_verify_attempts {
                        error!(
                            transaction = %transaction.id,
                            ?survivors,
                            "rollback could not be verified"
                        );
                        return BracketOutcome::Unrecoverable {
                            remaining: survivors,
                        };
                    }
                }
                Err(err) => {
                    warn!(attempt, error = %err, "rollback verification query failed");
                    if attempt == self.config.cancel_verify_attempts {
                        // Cannot see the book at all; assume the worst.
                        return BracketOutcome::Unrecoverable {
                            remaining: transaction.placed_orders.clone(),
                        };
                    }
                }
            }
        }
        BracketOutcome::Unrecoverable {
            remaining: transaction.placed_orders.clone(),
        }
    }
}
