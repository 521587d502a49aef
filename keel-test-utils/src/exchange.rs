//! Scripted in-memory exchange for exercising execution and reconciliation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use keel_core::{
    InstrumentId, OrderId, OrderIntent, OrderKind, OrderRecord, OrderRole, OrderState,
    PositionSnapshot, Quantity, Side,
};
use keel_transport::{ExchangeApi, TransportError, TransportResult};
use rust_decimal::Decimal;

/// Which API interaction a [`FailureScript`] fires on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureTrigger {
    /// Placement of an order whose label carries this bracket role.
    PlaceRole(OrderRole),
    /// Any order placement.
    PlaceAny,
    /// Cancellation of this specific order id.
    CancelOrder(OrderId),
    /// Any cancellation.
    CancelAny,
}

/// One scripted failure; fires `times` times, then disarms.
#[derive(Clone, Debug)]
pub struct FailureScript {
    pub trigger: FailureTrigger,
    pub error: TransportError,
    pub times: u32,
}

/// Journal entry recorded for every API call.
#[derive(Clone, Debug)]
pub enum ApiCall {
    Place {
        instrument: InstrumentId,
        label: Option<String>,
        role: Option<OrderRole>,
        reduce_only: bool,
        quantity: Quantity,
    },
    Cancel(OrderId),
    OrderState(OrderId),
    OpenOrders(InstrumentId),
    Position(InstrumentId),
    Equity(String),
}

#[derive(Default)]
struct MockState {
    next_seq: u64,
    orders: HashMap<OrderId, OrderRecord>,
    /// Entry price remembered per order so fills can move the position.
    entry_prices: HashMap<OrderId, Option<Decimal>>,
    positions: HashMap<InstrumentId, PositionSnapshot>,
    equity: Decimal,
    /// Market orders stay `Open` for this many `order_state` polls.
    fill_after_polls: u32,
    poll_countdown: HashMap<OrderId, u32>,
    scripts: Vec<FailureScript>,
    calls: Vec<ApiCall>,
}

/// In-memory [`ExchangeApi`] with scripted failures and delayed fills.
#[derive(Clone, Default)]
pub struct MockExchangeApi {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockExchangeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_equity(&self, equity: Decimal) {
        lock(&self.state).equity = equity;
    }

    pub fn seed_position(&self, instrument: &str, size: Quantity, average_price: Decimal) {
        lock(&self.state).positions.insert(
            instrument.to_string(),
            PositionSnapshot {
                instrument: instrument.to_string(),
                size,
                average_price: Some(average_price),
                updated_at: Utc::now(),
            },
        );
    }

    /// Seed an already-resting order, e.g. an orphan for reconciliation.
    pub fn seed_open_order(&self, record: OrderRecord) {
        let mut state = lock(&self.state);
        state.entry_prices.insert(record.order_id.clone(), record.price);
        state.orders.insert(record.order_id.clone(), record);
    }

    /// Market orders will report `Open` for this many polls before filling.
    pub fn set_fill_after_polls(&self, polls: u32) {
        lock(&self.state).fill_after_polls = polls;
    }

    pub fn script_failure(&self, trigger: FailureTrigger, error: TransportError, times: u32) {
        lock(&self.state).scripts.push(FailureScript {
            trigger,
            error,
            times,
        });
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        lock(&self.state).calls.clone()
    }

    pub fn order(&self, order_id: &str) -> Option<OrderRecord> {
        lock(&self.state).orders.get(order_id).cloned()
    }

    pub fn live_orders(&self, instrument: &str) -> Vec<OrderRecord> {
        lock(&self.state)
            .orders
            .values()
            .filter(|order| order.instrument == instrument && order.state.is_live())
            .cloned()
            .collect()
    }

    pub fn position_size(&self, instrument: &str) -> Quantity {
        lock(&self.state)
            .positions
            .get(instrument)
            .map(|position| position.size)
            .unwrap_or_default()
    }
}

impl MockState {
    fn fire_script(&mut self, probe: impl Fn(&FailureTrigger) -> bool) -> Option<TransportError> {
        let index = self.scripts.iter().position(|script| probe(&script.trigger))?;
        let error = self.scripts[index].error.clone();
        self.scripts[index].times -= 1;
        if self.scripts[index].times == 0 {
            self.scripts.remove(index);
        }
        Some(error)
    }

    fn apply_fill(&mut self, order_id: &OrderId) {
        let Some(order) = self.orders.get_mut(order_id) else {
            return;
        };
        if order.state == OrderState::Filled {
            return;
        }
        order.state = OrderState::Filled;
        order.filled_quantity = order.quantity;
        order.updated_at = Utc::now();

        let signed = match order.side {
            Side::Buy => order.quantity,
            Side::Sell => -order.quantity,
        };
        let fill_price = self.entry_prices.get(order_id).copied().flatten();
        let position = self
            .positions
            .entry(order.instrument.clone())
            .or_insert_with(|| PositionSnapshot {
                instrument: order.instrument.clone(),
                size: Decimal::ZERO,
                average_price: None,
                updated_at: Utc::now(),
            });
        position.size += signed;
        if position.average_price.is_none() {
            position.average_price = fill_price;
        }
        position.updated_at = Utc::now();
    }
}

#[async_trait]
impl ExchangeApi for MockExchangeApi {
    async fn place_order(&self, intent: &OrderIntent) -> TransportResult<OrderRecord> {
        let mut state = lock(&self.state);
        let role = intent
            .label
            .as_deref()
            .and_then(|raw| raw.parse::<keel_core::BracketLabel>().ok())
            .map(|label| label.role);
        state.calls.push(ApiCall::Place {
            instrument: intent.instrument.clone(),
            label: intent.label.clone(),
            role,
            reduce_only: intent.reduce_only,
            quantity: intent.quantity,
        });

        if let Some(error) = state.fire_script(|trigger| match trigger {
            FailureTrigger::PlaceAny => true,
            FailureTrigger::PlaceRole(scripted) => role == Some(*scripted),
            _ => false,
        }) {
            return Err(error);
        }

        state.next_seq += 1;
        let order_id = format!("mock-{}", state.next_seq);
        let initial_state = match intent.kind {
            OrderKind::StopMarket => OrderState::Untriggered,
            OrderKind::Market | OrderKind::Limit => OrderState::Open,
        };
        let record = OrderRecord {
            order_id: order_id.clone(),
            label: intent.label.clone(),
            instrument: intent.instrument.clone(),
            side: intent.side,
            quantity: intent.quantity,
            filled_quantity: Decimal::ZERO,
            price: intent.price.or(intent.trigger_price),
            state: initial_state,
            reduce_only: intent.reduce_only,
            updated_at: Utc::now(),
        };
        state
            .entry_prices
            .insert(order_id.clone(), intent.price.or(intent.trigger_price));
        state.orders.insert(order_id.clone(), record.clone());

        if intent.kind == OrderKind::Market {
            let countdown = state.fill_after_polls;
            if countdown == 0 {
                state.apply_fill(&order_id);
            } else {
                state.poll_countdown.insert(order_id.clone(), countdown);
            }
        }
        Ok(state
            .orders
            .get(&order_id)
            .cloned()
            .unwrap_or(record))
    }

    async fn cancel_order(&self, order_id: &OrderId) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(ApiCall::Cancel(order_id.clone()));

        if let Some(error) = state.fire_script(|trigger| match trigger {
            FailureTrigger::CancelAny => true,
            FailureTrigger::CancelOrder(scripted) => scripted == order_id,
            _ => false,
        }) {
            return Err(error);
        }

        match state.orders.get_mut(order_id) {
            Some(order) if order.state.is_live() => {
                order.state = OrderState::Cancelled;
                order.updated_at = Utc::now();
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(TransportError::InvalidParams(format!(
                "unknown order {order_id}"
            ))),
        }
    }

    async fn order_state(&self, order_id: &OrderId) -> TransportResult<OrderRecord> {
        let mut state = lock(&self.state);
        state.calls.push(ApiCall::OrderState(order_id.clone()));

        if let Some(remaining) = state.poll_countdown.get(order_id).copied() {
            if remaining <= 1 {
                state.poll_countdown.remove(order_id);
                state.apply_fill(order_id);
            } else {
                state.poll_countdown.insert(order_id.clone(), remaining - 1);
            }
        }
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| TransportError::InvalidParams(format!("unknown order {order_id}")))
    }

    async fn open_orders(&self, instrument: &str) -> TransportResult<Vec<OrderRecord>> {
        let mut state = lock(&self.state);
        state.calls.push(ApiCall::OpenOrders(instrument.to_string()));
        Ok(state
            .orders
            .values()
            .filter(|order| order.instrument == instrument && order.state.is_live())
            .cloned()
            .collect())
    }

    async fn position(&self, instrument: &str) -> TransportResult<Option<PositionSnapshot>> {
        let mut state = lock(&self.state);
        state.calls.push(ApiCall::Position(instrument.to_string()));
        Ok(state.positions.get(instrument).cloned())
    }

    async fn account_equity(&self, currency: &str) -> TransportResult<Decimal> {
        let mut state = lock(&self.state);
        state.calls.push(ApiCall::Equity(currency.to_string()));
        Ok(state.equity)
    }
}
