use chrono::{Days, NaiveDate};
use serde::Deserialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{evaluate_window, generate_hour_range, AvailabilityEntry, DayRules};
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct AvailabilityQuery {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub include_hours: bool,
}

/// Resolve the optional bounds of a report to a concrete inclusive window.
/// A missing start means today; a missing end means 30 days after the start.
pub fn resolve_window(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<(NaiveDate, NaiveDate), EngineError> {
    let first = start.unwrap_or(today);
    let last = match end {
        Some(end) => end,
        None => first
            .checked_add_days(Days::new(DEFAULT_AVAILABILITY_WINDOW_DAYS as u64))
            .ok_or_else(|| EngineError::invalid("start date out of range"))?,
    };
    if first > last {
        return Err(EngineError::invalid(format!("start date {first} is after end date {last}")));
    }
    if (last - first).num_days() > MAX_AVAILABILITY_WINDOW_DAYS {
        return Err(EngineError::invalid(format!(
            "availability window may not exceed {MAX_AVAILABILITY_WINDOW_DAYS} days"
        )));
    }
    Ok((first, last))
}

impl Engine {
    pub async fn get_available_dates(
        &self,
        product_id: Ulid,
        query: AvailabilityQuery,
    ) -> Result<Vec<AvailabilityEntry>, EngineError> {
        let (first, last) = resolve_window(query.start_date, query.end_date, self.today())?;
        let product = self.live_product(product_id).await?;

        let window = Span::new(day_start(first), day_start(last) + DAY_MS);
        let weekly = self.rules.find_weekly_availability(product_id).await?;
        let overrides = self.rules.find_date_overrides(product_id, first, last).await?;
        let reservations = self.ledger.find_conflicting_reservations(product_id, window).await?;

        let rules = DayRules {
            weekly: &weekly,
            overrides: &overrides,
            reservations: &reservations,
        };
        Ok(evaluate_window(first, last, &rules, &product.pricing, query.include_hours))
    }

    /// Bookable hourly slot starts on `date`.
    ///
    /// Products billed only per day are all-or-nothing: any reservation that
    /// day blocks every hour. Hourly-capable products lose only the slots a
    /// reservation overlaps, and fail with a conflict once none are left.
    pub async fn get_available_hours(
        &self,
        product_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeOfDay>, EngineError> {
        if date < self.today() {
            return Err(EngineError::invalid(format!("date {date} is in the past")));
        }
        let product = self.live_product(product_id).await?;

        let weekday = weekday_index(date);
        let slot = self
            .rules
            .find_weekly_availability(product_id)
            .await?
            .into_iter()
            .find(|s| s.day_of_week == weekday && s.is_available)
            .ok_or_else(|| {
                let day = weekday_name(weekday);
                let reason = format!("no operating hours on {day} for product {product_id}");
                EngineError::NotFound(reason)
            })?;

        let overrides = self.rules.find_date_overrides(product_id, date, date).await?;
        if overrides.iter().any(|o| o.covers(date) && !o.is_available) {
            return Err(EngineError::conflict("blocked by owner", Vec::new()));
        }

        let hours = generate_hour_range(slot.start, slot.end);
        let reservations = self
            .ledger
            .find_conflicting_reservations(product_id, day_span(date))
            .await?;
        if reservations.is_empty() {
            return Ok(hours);
        }
        if !product.pricing.charging_model.supports_hourly() {
            return Err(EngineError::conflict("occupied by rental", reservations));
        }

        let base = day_start(date);
        let closing = base + slot.end.offset_ms();
        let free: Vec<TimeOfDay> = hours
            .into_iter()
            .filter(|h| {
                let start = base + h.offset_ms();
                let slot_span = Span::new(start, (start + HOUR_MS).min(closing));
                !reservations
                    .iter()
                    .any(|r| Span::new(r.start, r.end).overlaps(&slot_span))
            })
            .collect();
        if free.is_empty() {
            return Err(EngineError::conflict("occupied by rental", reservations));
        }
        Ok(free)
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.ledger
            .find_reservation(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("reservation {id} not found")))
    }
}
