//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for exchange instrument names (e.g. `BTC-PERPETUAL`).
pub type InstrumentId = String;
/// Unique identifier assigned to orders by the exchange.
pub type OrderId = String;

/// Exchange environment a connection targets.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    Testnet,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => f.write_str("production"),
            Self::Testnet => f.write_str("testnet"),
        }
    }
}

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Execute immediately at best available price.
    Market,
    /// Execute at the provided limit price.
    Limit,
    /// Conditional market order triggered by a price movement.
    StopMarket,
}

/// Role an order plays inside a bracket transaction.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    Entry,
    StopLoss,
    TakeProfit,
}

impl OrderRole {
    /// True for the two protective legs of a bracket.
    #[must_use]
    pub fn is_protective(self) -> bool {
        matches!(self, Self::StopLoss | Self::TakeProfit)
    }
}

/// Exchange-reported order state mirrored locally.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Open,
    /// Conditional order resting but not yet triggered.
    Untriggered,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    /// True while the order may still rest on the book.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Open | Self::Untriggered)
    }
}

/// Immutable trading constraints for one instrument.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct InstrumentSpec {
    pub instrument: InstrumentId,
    pub tick_size: Price,
    pub lot_size: Quantity,
    pub min_trade_amount: Quantity,
    pub max_leverage: Decimal,
}

/// Desired order placement parameters sent to the exchange.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderIntent {
    pub instrument: InstrumentId,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: Quantity,
    pub price: Option<Price>,
    pub trigger_price: Option<Price>,
    pub label: Option<String>,
    pub reduce_only: bool,
}

/// Local mirror of an order believed to exist on the exchange.
///
/// Records are only ever created from exchange acknowledgments and mutated by
/// transport events or bracket/reconciliation logic.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub label: Option<String>,
    pub instrument: InstrumentId,
    pub side: Side,
    pub quantity: Quantity,
    pub filled_quantity: Quantity,
    pub price: Option<Price>,
    pub state: OrderState,
    pub reduce_only: bool,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Parse the bracket label, if any.
    #[must_use]
    pub fn bracket_label(&self) -> Option<BracketLabel> {
        self.label.as_deref().and_then(|raw| raw.parse().ok())
    }

    /// Role within its bracket, when the label identifies one.
    #[must_use]
    pub fn bracket_role(&self) -> Option<OrderRole> {
        self.bracket_label().map(|label| label.role)
    }
}

/// Direction of an open position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionDirection {
    Long,
    Short,
    Flat,
}

/// Exchange-reported truth for one instrument's position. Read-only; this is
/// the reconciliation ground truth and is never adjusted locally.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PositionSnapshot {
    pub instrument: InstrumentId,
    /// Signed size: positive long, negative short.
    pub size: Quantity,
    pub average_price: Option<Price>,
    pub updated_at: DateTime<Utc>,
}

impl PositionSnapshot {
    #[must_use]
    pub fn direction(&self) -> PositionDirection {
        if self.size > Decimal::ZERO {
            PositionDirection::Long
        } else if self.size < Decimal::ZERO {
            PositionDirection::Short
        } else {
            PositionDirection::Flat
        }
    }

    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }

    /// Unsigned position size.
    #[must_use]
    pub fn abs_size(&self) -> Quantity {
        self.size.abs()
    }
}

/// Unique identifier of one bracket transaction.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raised when an order label does not follow the bracket label grammar.
#[derive(Clone, Debug, Error)]
#[error("invalid bracket label '{raw}'")]
pub struct LabelParseError {
    raw: String,
}

/// Order label tying an exchange order back to its bracket transaction.
///
/// Canonical form: `keel:{transaction-uuid}:{entry|stop|target}`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BracketLabel {
    pub transaction: TransactionId,
    pub role: OrderRole,
}

impl BracketLabel {
    pub const PREFIX: &'static str = "keel";

    #[must_use]
    pub fn new(transaction: TransactionId, role: OrderRole) -> Self {
        Self { transaction, role }
    }
}

impl fmt::Display for BracketLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            OrderRole::Entry => "entry",
            OrderRole::StopLoss => "stop",
            OrderRole::TakeProfit => "target",
        };
        write!(f, "{}:{}:{role}", Self::PREFIX, self.transaction)
    }
}

impl FromStr for BracketLabel {
    type Err = LabelParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let err = || LabelParseError {
            raw: raw.to_string(),
        };
        let mut parts = raw.splitn(3, ':');
        if parts.next() != Some(Self::PREFIX) {
            return Err(err());
        }
        let uuid = parts
            .next()
            .and_then(|field| Uuid::parse_str(field).ok())
            .ok_or_else(err)?;
        let role = match parts.next() {
            Some("entry") => OrderRole::Entry,
            Some("stop") => OrderRole::StopLoss,
            Some("target") => OrderRole::TakeProfit,
            _ => return Err(err()),
        };
        Ok(Self {
            transaction: TransactionId(uuid),
            role,
        })
    }
}

/// What forced a bracket to unwind. Rejections are business errors the
/// strategy must not blindly retry; the other triggers are transient.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    /// The entry never filled inside the polling window.
    FillTimeout,
    /// The entry filled but no matching position appeared.
    PositionUnconfirmed,
    /// The exchange rejected one of the bracket's orders.
    OrderRejected,
    /// A connectivity failure interrupted placement.
    ConnectivityLost,
}

/// Terminal result of a bracket transaction.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BracketOutcome {
    /// Entry filled and both protective orders confirmed resting.
    Confirmed {
        entry_id: OrderId,
        stop_id: OrderId,
        target_id: OrderId,
    },
    /// Everything placed for the transaction was verifiably unwound.
    RolledBack {
        reason: String,
        trigger: RollbackTrigger,
    },
    /// Rollback could not be verified; these orders may still rest.
    Unrecoverable { remaining: Vec<OrderId> },
}

impl BracketOutcome {
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }
}

/// One atomic "open a protected position" attempt.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BracketTransaction {
    pub id: TransactionId,
    pub strategy: StrategyId,
    pub instrument: InstrumentId,
    pub side: Side,
    pub quantity: Quantity,
    pub entry_price: Price,
    pub stop_price: Price,
    pub target_price: Price,
    /// Every order id placed on behalf of this transaction, in order.
    pub placed_orders: Vec<OrderId>,
    pub outcome: Option<BracketOutcome>,
    pub created_at: DateTime<Utc>,
}

impl BracketTransaction {
    #[must_use]
    pub fn label(&self, role: OrderRole) -> String {
        BracketLabel::new(self.id, role).to_string()
    }
}

/// Identifier of one running strategy.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StrategyId(pub String);

impl StrategyId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StrategyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle phase of a running strategy.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyPhase {
    Idle,
    Analyzing,
    EntryPending,
    PositionOpen,
    Cooldown,
    Error,
}

impl StrategyPhase {
    /// Legal phase transitions. `Error` is reachable from anywhere; leaving
    /// it requires an explicit restart (modeled as `Error -> Analyzing`).
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if next == Self::Error {
            return true;
        }
        matches!(
            (self, next),
            (Self::Idle, Self::Analyzing)
                | (Self::Analyzing, Self::EntryPending)
                | (Self::EntryPending, Self::PositionOpen)
                | (Self::EntryPending, Self::Analyzing)
                | (Self::PositionOpen, Self::Cooldown)
                | (Self::Cooldown, Self::Analyzing)
                | (Self::Error, Self::Analyzing)
        )
    }
}

/// Order ids guarding a confirmed open position.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProtectedPosition {
    pub transaction: TransactionId,
    pub entry_id: OrderId,
    pub stop_id: OrderId,
    pub target_id: OrderId,
    pub quantity: Quantity,
}

/// Persistent per-strategy run state.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrategyRunState {
    pub id: StrategyId,
    pub instrument: InstrumentId,
    pub phase: StrategyPhase,
    /// Transaction currently in flight, if any.
    pub active_transaction: Option<TransactionId>,
    /// Confirmed bracket guarding the open position, while `PositionOpen`.
    pub protected: Option<ProtectedPosition>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl StrategyRunState {
    #[must_use]
    pub fn new(id: StrategyId, instrument: InstrumentId) -> Self {
        Self {
            id,
            instrument,
            phase: StrategyPhase::Idle,
            active_transaction: None,
            protected: None,
            cooldown_until: None,
            error_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// True once the cooldown window has elapsed (or none is set).
    #[must_use]
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map_or(true, |until| now >= until)
    }
}

/// Severity attached to engine-integrity alerts.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Engine-integrity findings surfaced to the push channel.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum Alert {
    OrphansCancelled {
        instrument: InstrumentId,
        orders: Vec<OrderId>,
    },
    /// Leftover bracket orders blocked a new entry.
    OrphansDetected {
        instrument: InstrumentId,
        orders: Vec<OrderId>,
    },
    /// An open position with zero resting protective orders. The single most
    /// dangerous state; never silently tolerated.
    PositionWithoutProtection {
        instrument: InstrumentId,
        size: Quantity,
    },
    /// Exactly one of the two protective orders is missing.
    PartialProtection {
        strategy: StrategyId,
        instrument: InstrumentId,
    },
    UnrecoverableBracket {
        transaction: TransactionId,
        remaining: Vec<OrderId>,
    },
    StrategyHalted {
        strategy: StrategyId,
        reason: String,
    },
}

impl Alert {
    #[must_use]
    pub fn severity(&self) -> AlertSeverity {
        match self {
            Self::PositionWithoutProtection { .. } | Self::UnrecoverableBracket { .. } => {
                AlertSeverity::Critical
            }
            Self::OrphansCancelled { .. }
            | Self::OrphansDetected { .. }
            | Self::PartialProtection { .. }
            | Self::StrategyHalted { .. } => AlertSeverity::Warning,
        }
    }
}

/// Events published on the downstream push channel.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PhaseChanged {
        strategy: StrategyId,
        from: StrategyPhase,
        to: StrategyPhase,
    },
    BracketResolved {
        strategy: StrategyId,
        transaction: TransactionId,
        outcome: BracketOutcome,
    },
    Alert(Alert),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn bracket_label_round_trips() {
        let label = BracketLabel::new(TransactionId::generate(), OrderRole::StopLoss);
        let raw = label.to_string();
        assert!(raw.starts_with("keel:"));
        assert!(raw.ends_with(":stop"));
        let parsed: BracketLabel = raw.parse().unwrap();
        assert_eq!(parsed, label);
    }

    #[test]
    fn bracket_label_rejects_foreign_labels() {
        assert!("someone-elses-label".parse::<BracketLabel>().is_err());
        assert!("keel:not-a-uuid:stop".parse::<BracketLabel>().is_err());
        let uuid = Uuid::new_v4();
        assert!(format!("keel:{uuid}:unknown")
            .parse::<BracketLabel>()
            .is_err());
    }

    #[test]
    fn position_direction_follows_signed_size() {
        let mut snapshot = PositionSnapshot {
            instrument: "BTC-PERPETUAL".into(),
            size: dec!(5),
            average_price: Some(dec!(50000)),
            updated_at: Utc::now(),
        };
        assert_eq!(snapshot.direction(), PositionDirection::Long);
        snapshot.size = dec!(-2.5);
        assert_eq!(snapshot.direction(), PositionDirection::Short);
        assert_eq!(snapshot.abs_size(), dec!(2.5));
        snapshot.size = Decimal::ZERO;
        assert!(snapshot.is_flat());
    }

    #[test]
    fn phase_transition_matrix() {
        use StrategyPhase::*;
        assert!(Idle.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(EntryPending));
        assert!(EntryPending.can_transition_to(PositionOpen));
        assert!(EntryPending.can_transition_to(Analyzing));
        assert!(PositionOpen.can_transition_to(Cooldown));
        assert!(Cooldown.can_transition_to(Analyzing));
        assert!(PositionOpen.can_transition_to(Error));
        assert!(Error.can_transition_to(Analyzing));

        assert!(!Idle.can_transition_to(PositionOpen));
        assert!(!Analyzing.can_transition_to(PositionOpen));
        assert!(!Cooldown.can_transition_to(EntryPending));
        assert!(!Error.can_transition_to(PositionOpen));
    }

    #[test]
    fn alert_severity_escalates_naked_positions() {
        let alert = Alert::PositionWithoutProtection {
            instrument: "ETH-PERPETUAL".into(),
            size: dec!(5),
        };
        assert_eq!(alert.severity(), AlertSeverity::Critical);
        let alert = Alert::OrphansCancelled {
            instrument: "ETH-PERPETUAL".into(),
            orders: vec!["42".into()],
        };
        assert_eq!(alert.severity(), AlertSeverity::Warning);
        let alert = Alert::OrphansDetected {
            instrument: "ETH-PERPETUAL".into(),
            orders: vec!["42".into()],
        };
        assert_eq!(alert.severity(), AlertSeverity::Warning);
    }

    #[test]
    fn order_record_links_back_to_its_bracket() {
        let txn = TransactionId::generate();
        let record = OrderRecord {
            order_id: "1".into(),
            label: Some(BracketLabel::new(txn, OrderRole::TakeProfit).to_string()),
            instrument: "BTC-PERPETUAL".into(),
            side: Side::Sell,
            quantity: dec!(0.2),
            filled_quantity: Decimal::ZERO,
            price: Some(dec!(51000)),
            state: OrderState::Open,
            reduce_only: true,
            updated_at: Utc::now(),
        };
        let label = record.bracket_label().unwrap();
        assert_eq!(label.transaction, txn);
        assert_eq!(record.bracket_role(), Some(OrderRole::TakeProfit));
    }
}
