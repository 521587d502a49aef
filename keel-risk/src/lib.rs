//! Pure position sizing.
//!
//! Translates a risk budget into an order quantity for one instrument. The
//! sizer is deterministic and does no I/O; every decision it makes is
//! reproducible from the [`SizeRequest`] alone.

use keel_core::{InstrumentSpec, Price, Quantity};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the risk budget is derived from account equity.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum RiskMode {
    /// Risk a fraction of current equity, e.g. `0.01` for 1%.
    PercentOfEquity(Decimal),
    /// Risk a fixed currency amount regardless of equity.
    FixedAmount(Decimal),
}

/// Inputs to one sizing decision.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SizeRequest {
    pub equity: Decimal,
    pub mode: RiskMode,
    pub entry_price: Price,
    pub stop_price: Price,
    pub instrument: InstrumentSpec,
}

/// Non-fatal adjustments applied during sizing.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeWarning {
    /// Quantity was scaled down to respect the instrument's leverage cap.
    LeverageCapped,
}

/// Result of a successful sizing decision.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SizeOutcome {
    pub quantity: Quantity,
    pub notional: Decimal,
    pub leverage: Decimal,
    pub warnings: Vec<SizeWarning>,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SizeError {
    #[error("equity must be positive, got {0}")]
    NonPositiveEquity(Decimal),
    #[error("prices must be positive (entry {entry}, stop {stop})")]
    NonPositivePrice { entry: Price, stop: Price },
    #[error("risk fraction must be in (0, 1], got {0}")]
    InvalidRiskFraction(Decimal),
    #[error("fixed risk amount {amount} must be positive and at most equity {equity}")]
    InvalidRiskAmount { amount: Decimal, equity: Decimal },
    #[error("entry and stop price are identical, risk distance is zero")]
    ZeroRiskDistance,
    #[error("sized quantity {quantity} is below the minimum trade amount {minimum}")]
    BelowMinTradeAmount {
        quantity: Quantity,
        minimum: Quantity,
    },
    #[error("instrument lot size must be positive, got {0}")]
    InvalidLotSize(Quantity),
    #[error("arithmetic overflow while sizing")]
    Overflow,
}

/// Size a position so that losing the full entry-to-stop distance costs
/// exactly the requested risk budget, subject to the instrument's leverage
/// cap and lot grid.
pub fn size_position(request: &SizeRequest) -> Result<SizeOutcome, SizeError> {
    if request.equity <= Decimal::ZERO {
        return Err(SizeError::NonPositiveEquity(request.equity));
    }
    if request.entry_price <= Decimal::ZERO || request.stop_price <= Decimal::ZERO {
        return Err(SizeError::NonPositivePrice {
            entry: request.entry_price,
            stop: request.stop_price,
        });
    }
    let spec = &request.instrument;
    if spec.lot_size <= Decimal::ZERO {
        return Err(SizeError::InvalidLotSize(spec.lot_size));
    }

    let risk_amount = match request.mode {
        RiskMode::PercentOfEquity(fraction) => {
            if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
                return Err(SizeError::InvalidRiskFraction(fraction));
            }
            request
                .equity
                .checked_mul(fraction)
                .ok_or(SizeError::Overflow)?
        }
        RiskMode::FixedAmount(amount) => {
            if amount <= Decimal::ZERO || amount > request.equity {
                return Err(SizeError::InvalidRiskAmount {
                    amount,
                    equity: request.equity,
                });
            }
            amount
        }
    };

    let distance = (request.entry_price - request.stop_price).abs();
    if distance.is_zero() {
        return Err(SizeError::ZeroRiskDistance);
    }

    let mut quantity = risk_amount
        .checked_div(distance)
        .ok_or(SizeError::Overflow)?;
    let mut warnings = Vec::new();

    // Leverage cap: notional may not exceed equity * max_leverage.
    let max_notional = request
        .equity
        .checked_mul(spec.max_leverage)
        .ok_or(SizeError::Overflow)?;
    let notional = quantity
        .checked_mul(request.entry_price)
        .ok_or(SizeError::Overflow)?;
    if spec.max_leverage > Decimal::ZERO && notional > max_notional {
        quantity = max_notional
            .checked_div(request.entry_price)
            .ok_or(SizeError::Overflow)?;
        warnings.push(SizeWarning::LeverageCapped);
    }

    let quantity = round_to_lot(quantity, spec.lot_size).ok_or(SizeError::Overflow)?;
    if quantity < spec.min_trade_amount || quantity.is_zero() {
        return Err(SizeError::BelowMinTradeAmount {
            quantity,
            minimum: spec.min_trade_amount,
        });
    }

    let notional = quantity
        .checked_mul(request.entry_price)
        .ok_or(SizeError::Overflow)?;
    let leverage = notional
        .checked_div(request.equity)
        .ok_or(SizeError::Overflow)?;

    Ok(SizeOutcome {
        quantity,
        notional,
        leverage,
        warnings,
    })
}

/// Snap a raw quantity to the nearest multiple of `lot`.
fn round_to_lot(quantity: Quantity, lot: Quantity) -> Option<Quantity> {
    let lots = quantity.checked_div(lot)?;
    let lots = lots.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    lots.checked_mul(lot)
}
