//! Typed exchange surface consumed by execution and reconciliation.

use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use keel_core::{
    OrderId, OrderIntent, OrderKind, OrderRecord, OrderState, PositionSnapshot, Quantity, Side,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::client::RpcClient;
use crate::error::{TransportError, TransportResult};

/// The operations the trading core needs from a venue. Implemented over the
/// RPC client in production and by a scripted mock in tests.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn place_order(&self, intent: &OrderIntent) -> TransportResult<OrderRecord>;
    async fn cancel_order(&self, order_id: &OrderId) -> TransportResult<()>;
    async fn order_state(&self, order_id: &OrderId) -> TransportResult<OrderRecord>;
    async fn open_orders(&self, instrument: &str) -> TransportResult<Vec<OrderRecord>>;
    async fn position(&self, instrument: &str) -> TransportResult<Option<PositionSnapshot>>;
    async fn account_equity(&self, currency: &str) -> TransportResult<Decimal>;
}

/// [`ExchangeApi`] over a live [`RpcClient`], rate limited ahead of every
/// outbound call.
pub struct RpcExchangeApi {
    client: Arc<RpcClient>,
    limiter: DefaultDirectRateLimiter,
}

impl RpcExchangeApi {
    #[must_use]
    pub fn new(client: Arc<RpcClient>, requests_per_second: u32) -> Self {
        let per_second = NonZeroU32::new(requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            client,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
        }
    }

    async fn call(&self, method: &str, params: Value) -> TransportResult<Value> {
        self.limiter.until_ready().await;
        self.client.call(method, params).await
    }

    /// Queries and cancels are idempotent; transient failures are retried.
    /// Placement is not: a lost reply can mean the order reached the book.
    async fn call_idempotent(&self, method: &str, params: Value) -> TransportResult<Value> {
        self.limiter.until_ready().await;
        self.client
            .call_with_retry(method, params, QUERY_RETRY_ATTEMPTS)
            .await
    }
}

const QUERY_RETRY_ATTEMPTS: u32 = 3;

#[async_trait]
impl ExchangeApi for RpcExchangeApi {
    async fn place_order(&self, intent: &OrderIntent) -> TransportResult<OrderRecord> {
        let method = match intent.side {
            Side::Buy => "private/buy",
            Side::Sell => "private/sell",
        };
        let result = self.call(method, place_params(intent)?).await?;
        let response: PlaceResponse = decode(result)?;
        response.order.into_record()
    }

    async fn cancel_order(&self, order_id: &OrderId) -> TransportResult<()> {
        self.call_idempotent("private/cancel", json!({ "order_id": order_id }))
            .await?;
        debug!(order_id = %order_id, "cancel acknowledged");
        Ok(())
    }

    async fn order_state(&self, order_id: &OrderId) -> TransportResult<OrderRecord> {
        let result = self
            .call_idempotent("private/get_order_state", json!({ "order_id": order_id }))
            .await?;
        let dto: OrderDto = decode(result)?;
        dto.into_record()
    }

    async fn open_orders(&self, instrument: &str) -> TransportResult<Vec<OrderRecord>> {
        let result = self
            .call_idempotent(
                "private/get_open_orders_by_instrument",
                json!({ "instrument_name": instrument }),
            )
            .await?;
        let dtos: Vec<OrderDto> = decode(result)?;
        dtos.into_iter().map(OrderDto::into_record).collect()
    }

    async fn position(&self, instrument: &str) -> TransportResult<Option<PositionSnapshot>> {
        let result = self
            .call_idempotent(
                "private/get_position",
                json!({ "instrument_name": instrument }),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let dto: PositionDto = decode(result)?;
        Ok(dto.into_snapshot())
    }

    async fn account_equity(&self, currency: &str) -> TransportResult<Decimal> {
        let result = self
            .call_idempotent(
                "private/get_account_summary",
                json!({ "currency": currency }),
            )
            .await?;
        let summary: AccountSummaryDto = decode(result)?;
        Ok(summary.equity)
    }
}

fn place_params(intent: &OrderIntent) -> TransportResult<Value> {
    let mut params = Map::new();
    params.insert("instrument_name".into(), json!(intent.instrument));
    params.insert("amount".into(), json!(intent.quantity));
    params.insert(
        "type".into(),
        json!(match intent.kind {
            OrderKind::Market => "market",
            OrderKind::Limit => "limit",
            OrderKind::StopMarket => "stop_market",
        }),
    );
    if let Some(price) = intent.price {
        params.insert("price".into(), json!(price));
    }
    if let Some(trigger) = intent.trigger_price {
        params.insert("trigger_price".into(), json!(trigger));
        params.insert("trigger".into(), json!("mark_price"));
    } else if intent.kind == OrderKind::StopMarket {
        return Err(TransportError::InvalidParams(
            "stop_market order without trigger price".into(),
        ));
    }
    if let Some(label) = &intent.label {
        params.insert("label".into(), json!(label));
    }
    if intent.reduce_only {
        params.insert("reduce_only".into(), json!(true));
    }
    Ok(Value::Object(params))
}

fn decode<T: DeserializeOwned>(value: Value) -> TransportResult<T> {
    serde_json::from_value(value).map_err(|err| TransportError::Unknown {
        code: 0,
        message: format!("undecodable exchange response: {err}"),
    })
}

#[derive(Debug, Deserialize)]
struct PlaceResponse {
    order: OrderDto,
}

#[derive(Debug, Deserialize)]
struct OrderDto {
    order_id: OrderId,
    #[serde(default)]
    label: Option<String>,
    instrument_name: String,
    direction: String,
    amount: Quantity,
    #[serde(default)]
    filled_amount: Quantity,
    #[serde(default)]
    price: Option<Decimal>,
    order_state: String,
    #[serde(default)]
    reduce_only: bool,
    #[serde(default)]
    last_update_timestamp: Option<i64>,
}

impl OrderDto {
    fn into_record(self) -> TransportResult<OrderRecord> {
        let side = match self.direction.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            other => {
                return Err(TransportError::Unknown {
                    code: 0,
                    message: format!("unknown order direction '{other}'"),
                })
            }
        };
        let state = match self.order_state.as_str() {
            "open" => OrderState::Open,
            "untriggered" => OrderState::Untriggered,
            "filled" => OrderState::Filled,
            "cancelled" => OrderState::Cancelled,
            "rejected" => OrderState::Rejected,
            other => {
                return Err(TransportError::Unknown {
                    code: 0,
                    message: format!("unknown order state '{other}'"),
                })
            }
        };
        Ok(OrderRecord {
            order_id: self.order_id,
            label: self.label,
            instrument: self.instrument_name,
            side,
            quantity: self.amount,
            filled_quantity: self.filled_amount,
            price: self.price,
            state,
            reduce_only: self.reduce_only,
            updated_at: millis_to_datetime(self.last_update_timestamp),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PositionDto {
    instrument_name: String,
    size: Quantity,
    #[serde(default)]
    average_price: Option<Decimal>,
    #[serde(default)]
    last_update_timestamp: Option<i64>,
}

impl PositionDto {
    fn into_snapshot(self) -> Option<PositionSnapshot> {
        Some(PositionSnapshot {
            instrument: self.instrument_name,
            size: self.size,
            average_price: self.average_price,
            updated_at: millis_to_datetime(self.last_update_timestamp),
        })
    }
}

#[derive(Debug, Deserialize)]
struct AccountSummaryDto {
    equity: Decimal,
}

fn millis_to_datetime(millis: Option<i64>) -> DateTime<Utc> {
    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_dto_maps_states_and_sides() {
        let dto: OrderDto = serde_json::from_value(json!({
            "order_id": "ETH-42",
            "label": "keel:00000000-0000-0000-0000-000000000000:entry",
            "instrument_name": "ETH-PERPETUAL",
            "direction": "buy",
            "amount": "1.5",
            "filled_amount": "0.5",
            "price": "2000",
            "order_state": "open",
            "reduce_only": false,
        }))
        .unwrap();
        let record = dto.into_record().unwrap();
        assert_eq!(record.side, Side::Buy);
        assert_eq!(record.state, OrderState::Open);
        assert_eq!(record.filled_quantity, dec!(0.5));
    }

    #[test]
    fn unknown_order_state_is_an_error() {
        let dto: OrderDto = serde_json::from_value(json!({
            "order_id": "1",
            "instrument_name": "ETH-PERPETUAL",
            "direction": "sell",
            "amount": "1",
            "order_state": "archived",
        }))
        .unwrap();
        assert!(dto.into_record().is_err());
    }

    #[test]
    fn stop_market_requires_trigger() {
        let intent = OrderIntent {
            instrument: "BTC-PERPETUAL".into(),
            side: Side::Sell,
            kind: OrderKind::StopMarket,
            quantity: dec!(0.2),
            price: None,
            trigger_price: None,
            label: None,
            reduce_only: true,
        };
        assert!(place_params(&intent).is_err());
    }

    #[test]
    fn place_params_carry_label_and_reduce_only() {
        let intent = OrderIntent {
            instrument: "BTC-PERPETUAL".into(),
            side: Side::Sell,
            kind: OrderKind::StopMarket,
            quantity: dec!(0.2),
            price: None,
            trigger_price: Some(dec!(49500)),
            label: Some("keel:x:stop".into()),
            reduce_only: true,
        };
        let params = place_params(&intent).unwrap();
        assert_eq!(params["trigger_price"], json!(dec!(49500)));
        assert_eq!(params["reduce_only"], json!(true));
        assert_eq!(params["label"], json!("keel:x:stop"));
    }
}
