use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::DAY_MS;

/// Wall-clock milliseconds since the epoch, in the caller's timezone.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Calendar days from the start instant's date through the end
    /// instant's date, both inclusive.
    pub fn days(&self) -> (NaiveDate, NaiveDate) {
        (date_of(self.start), date_of(self.end))
    }
}

// ── Calendar helpers ─────────────────────────────────────────────

pub fn date_of(ms: Ms) -> NaiveDate {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.date_naive())
        .unwrap_or(NaiveDate::MIN)
}

pub fn day_start(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

pub fn day_span(date: NaiveDate) -> Span {
    let start = day_start(date);
    Span::new(start, start + DAY_MS)
}

/// 0 = Sunday … 6 = Saturday.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

pub fn weekday_name(day_of_week: u8) -> &'static str {
    match day_of_week {
        0 => "Sunday",
        1 => "Monday",
        2 => "Tuesday",
        3 => "Wednesday",
        4 => "Thursday",
        5 => "Friday",
        6 => "Saturday",
        _ => "unknown day",
    }
}

/// Minute of day, written as zero-padded `HH:MM`. `24:00` is a valid closing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    minutes: u16,
}

impl TimeOfDay {
    pub const MAX_MINUTES: u16 = 24 * 60;

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= Self::MAX_MINUTES).then_some(Self { minutes })
    }

    pub fn hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        Self::from_minutes(hour.checked_mul(60)?.checked_add(minute)?)
    }

    pub fn minutes(&self) -> u16 {
        self.minutes
    }

    pub fn offset_ms(&self) -> Ms {
        self.minutes as Ms * 60_000
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.minutes / 60, self.minutes % 60)
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("invalid time of day '{s}', expected HH:MM");
        let (h, m) = s.split_once(':').ok_or_else(bad)?;
        if h.len() != 2 || m.len() != 2 {
            return Err(bad());
        }
        let hour: u16 = h.parse().map_err(|_| bad())?;
        let minute: u16 = m.parse().map_err(|_| bad())?;
        Self::hm(hour, minute).ok_or_else(bad)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

// ── Pricing configuration ────────────────────────────────────────

/// How a product may be billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargingModel {
    #[serde(alias = "POR_DIA")]
    PerDay,
    #[serde(alias = "POR_HORA")]
    PerHour,
    #[serde(alias = "AMBOS")]
    Both,
}

impl ChargingModel {
    pub fn supports(&self, charging_type: ChargingType) -> bool {
        match self {
            ChargingModel::Both => true,
            ChargingModel::PerDay => charging_type == ChargingType::PerDay,
            ChargingModel::PerHour => charging_type == ChargingType::PerHour,
        }
    }

    pub fn supports_hourly(&self) -> bool {
        self.supports(ChargingType::PerHour)
    }
}

/// How a single reservation is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargingType {
    #[serde(alias = "POR_DIA")]
    PerDay,
    #[serde(alias = "POR_HORA")]
    PerHour,
}

impl fmt::Display for ChargingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChargingType::PerDay => f.write_str("PER_DAY"),
            ChargingType::PerHour => f.write_str("PER_HOUR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductPricing {
    pub charging_model: ChargingModel,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub daily_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub hourly_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub discount_percentage: Option<Decimal>,
}

impl ProductPricing {
    /// Every price the charging model needs must be present and positive.
    pub fn validate(&self) -> Result<(), &'static str> {
        let positive = |p: Option<Decimal>| p.is_some_and(|p| p > Decimal::ZERO);
        match self.charging_model {
            ChargingModel::PerDay if !positive(self.daily_price) => {
                return Err("PER_DAY products need a daily price greater than zero");
            }
            ChargingModel::PerHour if !positive(self.hourly_price) => {
                return Err("PER_HOUR products need an hourly price greater than zero");
            }
            ChargingModel::Both if !positive(self.daily_price) || !positive(self.hourly_price) => {
                return Err("BOTH products need daily and hourly prices greater than zero");
            }
            _ => {}
        }
        if let Some(pct) = self.discount_percentage
            && (pct < Decimal::ZERO || pct > Decimal::ONE_HUNDRED)
        {
            return Err("discount percentage must be between 0 and 100");
        }
        Ok(())
    }
}

// ── Availability rules ───────────────────────────────────────────

/// Operating hours for one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySlot {
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub is_available: bool,
}

impl WeeklySlot {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.day_of_week > 6 {
            return Err("day_of_week must be between 0 (Sunday) and 6 (Saturday)");
        }
        if self.start >= self.end {
            return Err("weekly slot start must be before its end");
        }
        Ok(())
    }

    /// The slot's opening hours on a concrete date.
    pub fn span_on(&self, date: NaiveDate) -> Span {
        let base = day_start(date);
        Span::new(base + self.start.offset_ms(), base + self.end.offset_ms())
    }
}

/// Date-range exception to the weekly pattern. Both bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOverride {
    pub id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_available: bool,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price_override: Option<Decimal>,
}

impl DateOverride {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    pub fn intersects(&self, first: NaiveDate, last: NaiveDate) -> bool {
        self.start_date <= last && first <= self.end_date
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Ulid,
    pub company_id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub pricing: ProductPricing,
    /// Soft-deletion instant.
    pub deleted_at: Option<Ms>,
}

impl Product {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    /// Whether a reservation in this status blocks its window.
    pub fn occupies(&self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub product_id: Ulid,
    pub user_id: Ulid,
    pub company_id: Ulid,
    pub span: Span,
    pub charging_type: ChargingType,
    pub status: ReservationStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub discount_applied: Decimal,
    pub product_name: String,
    pub company_name: String,
    pub client_name: String,
    pub created_at: Ms,
}

/// A reservation as handed to the ledger, before it has an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub product_id: Ulid,
    pub user_id: Ulid,
    pub company_id: Ulid,
    pub span: Span,
    pub charging_type: ChargingType,
    pub total_amount: Decimal,
    pub discount_applied: Decimal,
    pub product_name: String,
    pub company_name: String,
    pub client_name: String,
    pub created_at: Ms,
}

impl NewReservation {
    pub fn into_pending(self, id: Ulid) -> Reservation {
        Reservation {
            id,
            product_id: self.product_id,
            user_id: self.user_id,
            company_id: self.company_id,
            span: self.span,
            charging_type: self.charging_type,
            status: ReservationStatus::Pending,
            total_amount: self.total_amount,
            discount_applied: self.discount_applied,
            product_name: self.product_name,
            company_name: self.company_name,
            client_name: self.client_name,
            created_at: self.created_at,
        }
    }
}

/// Identity and window of a reservation blocking a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingReservation {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: ReservationStatus,
}

impl From<&Reservation> for ConflictingReservation {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            start: r.span.start,
            end: r.span.end,
            status: r.status,
        }
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CompanyRegistered {
        id: Ulid,
        name: String,
    },
    ClientRegistered {
        id: Ulid,
        name: String,
        email: Option<String>,
    },
    AssociateLinked {
        user_id: Ulid,
        company_id: Ulid,
    },
    ProductRegistered {
        id: Ulid,
        company_id: Ulid,
        name: String,
        description: Option<String>,
        pricing: ProductPricing,
    },
    ProductDeleted {
        id: Ulid,
        at: Ms,
    },
    WeeklyScheduleSet {
        product_id: Ulid,
        slots: Vec<WeeklySlot>,
    },
    OverrideAdded {
        product_id: Ulid,
        entry: DateOverride,
    },
    OverrideRemoved {
        product_id: Ulid,
        id: Ulid,
    },
    ReservationPlaced {
        reservation: Reservation,
    },
    ReservationStatusChanged {
        id: Ulid,
        product_id: Ulid,
        status: ReservationStatus,
    },
}

impl Event {
    /// The product whose state this event changes, if any.
    pub fn product_id(&self) -> Option<Ulid> {
        match self {
            Event::ProductRegistered { id, .. } | Event::ProductDeleted { id, .. } => Some(*id),
            Event::WeeklyScheduleSet { product_id, .. }
            | Event::OverrideAdded { product_id, .. }
            | Event::OverrideRemoved { product_id, .. }
            | Event::ReservationStatusChanged { product_id, .. } => Some(*product_id),
            Event::ReservationPlaced { reservation } => Some(reservation.product_id),
            Event::CompanyRegistered { .. }
            | Event::ClientRegistered { .. }
            | Event::AssociateLinked { .. } => None,
        }
    }
}
