use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use ulid::Ulid;

use crate::limits::{DAY_MS, HOUR_MS};
use crate::model::*;

use super::conflict::validate_span;
use super::{Engine, EngineError};

/// Round to `places` decimal places with banker's rounding.
pub fn round_money(amount: Decimal, places: u32) -> Decimal {
    amount.round_dp_with_strategy(places, RoundingStrategy::MidpointNearestEven)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingUnit {
    Day,
    Hour,
}

impl BillingUnit {
    fn length_ms(&self) -> Ms {
        match self {
            BillingUnit::Day => DAY_MS,
            BillingUnit::Hour => HOUR_MS,
        }
    }
}

/// The billed window and how many whole units it counts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BillingPeriod {
    pub start: Ms,
    pub end: Ms,
    pub units: i64,
    pub unit: BillingUnit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceQuote {
    pub charging_type: ChargingType,
    pub period: BillingPeriod,
    #[serde(with = "rust_decimal::serde::str")]
    pub price_per_unit: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub base_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub discount_percentage: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub discount_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
}

/// Price a window. Partial units bill as whole ones; associates of the owning
/// company get the product's discount percentage off the base amount.
pub fn calculate_price(
    pricing: &ProductPricing,
    span: &Span,
    charging_type: ChargingType,
    is_associate: bool,
) -> Result<PriceQuote, EngineError> {
    if !pricing.charging_model.supports(charging_type) {
        return Err(EngineError::invalid(format!(
            "charging type {charging_type} is not offered for this product"
        )));
    }
    let duration = span.duration_ms();
    if duration <= 0 {
        return Err(EngineError::invalid("start must be before end"));
    }

    let (unit, price) = match charging_type {
        ChargingType::PerDay => (BillingUnit::Day, pricing.daily_price),
        ChargingType::PerHour => (BillingUnit::Hour, pricing.hourly_price),
    };
    let price_per_unit = price.ok_or_else(|| {
        EngineError::invalid(match unit {
            BillingUnit::Day => "product has no daily price",
            BillingUnit::Hour => "product has no hourly price",
        })
    })?;

    let len = unit.length_ms();
    let units = (duration + len - 1) / len;
    let base_amount = price_per_unit * Decimal::from(units);

    let discount_percentage = match pricing.discount_percentage {
        Some(pct) if is_associate => {
            if pct < Decimal::ZERO || pct > Decimal::ONE_HUNDRED {
                return Err(EngineError::invalid("discount percentage must be between 0 and 100"));
            }
            pct
        }
        _ => Decimal::ZERO,
    };
    let discount_amount = round_money(base_amount * discount_percentage / Decimal::ONE_HUNDRED, 2);

    Ok(PriceQuote {
        charging_type,
        period: BillingPeriod { start: span.start, end: span.end, units, unit },
        price_per_unit,
        base_amount,
        discount_percentage,
        discount_amount,
        total_amount: base_amount - discount_amount,
    })
}

impl Engine {
    /// Quote a window for `user_id` without reserving anything.
    pub async fn calculate_price(
        &self,
        product_id: Ulid,
        span: Span,
        charging_type: ChargingType,
        user_id: Ulid,
    ) -> Result<PriceQuote, EngineError> {
        validate_span(&span)?;
        let product = self.live_product(product_id).await?;
        let is_associate = self.catalog.is_associate(user_id, product.company_id).await?;
        calculate_price(&product.pricing, &span, charging_type, is_associate)
    }
}
