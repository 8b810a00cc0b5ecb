use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::model::*;

/// Slot start times, one per hour from `start` while strictly before `end`.
///
/// `08:00`–`11:30` gives `08:00, 09:00, 10:00`; a window shorter than the
/// first step gives nothing.
pub fn generate_hour_range(start: TimeOfDay, end: TimeOfDay) -> Vec<TimeOfDay> {
    (start.minutes()..end.minutes())
        .step_by(60)
        .filter_map(TimeOfDay::from_minutes)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    OccupiedByRental,
    BlockedByOwner,
    OutsideOperatingHours,
    ScheduleNotConfigured,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnavailableReason::OccupiedByRental => "occupied by rental",
            UnavailableReason::BlockedByOwner => "blocked by owner",
            UnavailableReason::OutsideOperatingHours => "outside operating hours",
            UnavailableReason::ScheduleNotConfigured => "schedule not configured",
        })
    }
}

/// One day of an availability report. `reason` is set exactly when the day
/// is unavailable; hours and price only ever accompany an available day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityEntry {
    pub date: NaiveDate,
    pub is_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnavailableReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_hours: Option<Vec<TimeOfDay>>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::str_option"
    )]
    pub price: Option<Decimal>,
}

impl AvailabilityEntry {
    fn available(date: NaiveDate, price: Option<Decimal>, hours: Option<Vec<TimeOfDay>>) -> Self {
        Self {
            date,
            is_available: true,
            reason: None,
            available_hours: hours,
            price,
        }
    }

    fn unavailable(date: NaiveDate, reason: UnavailableReason) -> Self {
        Self {
            date,
            is_available: false,
            reason: Some(reason),
            available_hours: None,
            price: None,
        }
    }
}

/// Everything fetched from the stores for one product over the report window.
#[derive(Debug, Clone, Copy)]
pub struct DayRules<'a> {
    pub weekly: &'a [WeeklySlot],
    /// In store order; the first covering override wins.
    pub overrides: &'a [DateOverride],
    /// Occupying reservations only.
    pub reservations: &'a [ConflictingReservation],
}

/// Occupied > override > weekly pattern > unconfigured.
pub fn evaluate_day(
    date: NaiveDate,
    rules: &DayRules<'_>,
    pricing: &ProductPricing,
    include_hours: bool,
) -> AvailabilityEntry {
    let day = day_span(date);
    if rules
        .reservations
        .iter()
        .any(|r| r.status.occupies() && Span::new(r.start, r.end).overlaps(&day))
    {
        return AvailabilityEntry::unavailable(date, UnavailableReason::OccupiedByRental);
    }

    if let Some(o) = rules.overrides.iter().find(|o| o.covers(date)) {
        if !o.is_available {
            return AvailabilityEntry::unavailable(date, UnavailableReason::BlockedByOwner);
        }
        return AvailabilityEntry::available(date, o.price_override.or(pricing.daily_price), None);
    }

    let weekday = weekday_index(date);
    match rules.weekly.iter().find(|s| s.day_of_week == weekday) {
        Some(slot) if slot.is_available => {
            let hours = (include_hours && pricing.charging_model.supports_hourly())
                .then(|| generate_hour_range(slot.start, slot.end));
            AvailabilityEntry::available(date, pricing.daily_price, hours)
        }
        Some(_) => AvailabilityEntry::unavailable(date, UnavailableReason::OutsideOperatingHours),
        None => AvailabilityEntry::unavailable(date, UnavailableReason::ScheduleNotConfigured),
    }
}

/// One entry per day of `[first, last]`, ascending.
pub fn evaluate_window(
    first: NaiveDate,
    last: NaiveDate,
    rules: &DayRules<'_>,
    pricing: &ProductPricing,
    include_hours: bool,
) -> Vec<AvailabilityEntry> {
    first
        .iter_days()
        .take_while(|d| *d <= last)
        .map(|d| evaluate_day(d, rules, pricing, include_hours))
        .collect()
}
