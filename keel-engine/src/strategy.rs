//! The closed set of strategy kinds the engine can run.
//!
//! A strategy kind does exactly one thing: turn an externally supplied entry
//! decision into concrete entry, stop and target prices. Deciding *when* to
//! enter is someone else's problem.

use keel_core::{InstrumentSpec, Price, Side, StrategyId};
use keel_risk::RiskMode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Externally supplied entry decision.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EntrySignal {
    pub side: Side,
    pub entry_price: Price,
    pub stop_price: Option<Price>,
    pub target_price: Option<Price>,
}

/// Concrete prices for one bracket attempt.
#[derive(Clone, Copy, Debug)]
pub struct TradePlan {
    pub side: Side,
    pub entry: Price,
    pub stop: Price,
    pub target: Price,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyKind {
    /// The signal must carry its own stop and target.
    Manual,
    /// Stop at a fixed distance from entry, target at `reward_ratio` times
    /// that distance on the other side.
    FixedRatio {
        stop_distance_pct: Decimal,
        reward_ratio: Decimal,
    },
}

impl StrategyKind {
    pub fn plan(&self, signal: &EntrySignal) -> Result<TradePlan, EngineError> {
        if signal.entry_price <= Decimal::ZERO {
            return Err(EngineError::InvalidSignal(format!(
                "entry price {} is not positive",
                signal.entry_price
            )));
        }
        let plan = match self {
            Self::Manual => {
                let stop = signal.stop_price.ok_or_else(|| {
                    EngineError::InvalidSignal("manual signal is missing a stop price".into())
                })?;
                let target = signal.target_price.ok_or_else(|| {
                    EngineError::InvalidSignal("manual signal is missing a target price".into())
                })?;
                TradePlan {
                    side: signal.side,
                    entry: signal.entry_price,
                    stop,
                    target,
                }
            }
            Self::FixedRatio {
                stop_distance_pct,
                reward_ratio,
            } => {
                if *stop_distance_pct <= Decimal::ZERO || *reward_ratio <= Decimal::ZERO {
                    return Err(EngineError::InvalidSignal(
                        "fixed-ratio parameters must be positive".into(),
                    ));
                }
                let distance = signal.entry_price * *stop_distance_pct;
                let (stop, target) = match signal.side {
                    Side::Buy => (
                        signal.entry_price - distance,
                        signal.entry_price + distance * *reward_ratio,
                    ),
                    Side::Sell => (
                        signal.entry_price + distance,
                        signal.entry_price - distance * *reward_ratio,
                    ),
                };
                TradePlan {
                    side: signal.side,
                    entry: signal.entry_price,
                    stop,
                    target,
                }
            }
        };
        plan.validate()?;
        Ok(plan)
    }
}

impl TradePlan {
    /// Stop and target must sit on opposite sides of the entry.
    fn validate(&self) -> Result<(), EngineError> {
        let ordered = match self.side {
            Side::Buy => self.stop < self.entry && self.entry < self.target,
            Side::Sell => self.target < self.entry && self.entry < self.stop,
        };
        if self.stop <= Decimal::ZERO || self.target <= Decimal::ZERO {
            return Err(EngineError::InvalidSignal(
                "stop and target must be positive".into(),
            ));
        }
        if ordered {
            Ok(())
        } else {
            Err(EngineError::InvalidSignal(format!(
                "prices are mis-ordered for a {:?}: stop {}, entry {}, target {}",
                self.side, self.stop, self.entry, self.target
            )))
        }
    }
}

/// Everything needed to run one strategy.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrategySpec {
    pub id: StrategyId,
    pub instrument: InstrumentSpec,
    pub kind: StrategyKind,
    pub risk: RiskMode,
    /// Settlement currency for equity lookups.
    pub currency: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn signal(side: Side) -> EntrySignal {
        EntrySignal {
            side,
            entry_price: dec!(50000),
            stop_price: None,
            target_price: None,
        }
    }

    #[test]
    fn fixed_ratio_derives_both_sides() {
        let kind = StrategyKind::FixedRatio {
            stop_distance_pct: dec!(0.01),
            reward_ratio: dec!(2),
        };
        let long = kind.plan(&signal(Side::Buy)).unwrap();
        assert_eq!(long.stop, dec!(49500));
        assert_eq!(long.target, dec!(51000));

        let short = kind.plan(&signal(Side::Sell)).unwrap();
        assert_eq!(short.stop, dec!(50500));
        assert_eq!(short.target, dec!(49000));
    }

    #[test]
    fn manual_requires_both_protective_prices() {
        let err = StrategyKind::Manual.plan(&signal(Side::Buy)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSignal(_)));

        let mut full = signal(Side::Buy);
        full.stop_price = Some(dec!(49500));
        full.target_price = Some(dec!(51000));
        assert!(StrategyKind::Manual.plan(&full).is_ok());
    }

    #[test]
    fn misordered_manual_prices_are_rejected() {
        let mut inverted = signal(Side::Buy);
        inverted.stop_price = Some(dec!(51000));
        inverted.target_price = Some(dec!(49500));
        assert!(StrategyKind::Manual.plan(&inverted).is_err());
    }
}
