use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Deserialize;
use ulid::Ulid;

use crate::engine::RentalDecision;
use crate::model::*;

/// Wall-clock instant as written on the wire: `YYYY-MM-DDTHH:MM[:SS]`, or a
/// bare `YYYY-MM-DD` meaning midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Timestamp(pub Ms);

impl FromStr for Timestamp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                return Ok(Timestamp(dt.and_utc().timestamp_millis()));
            }
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(|d| Timestamp(day_start(d)))
            .map_err(|_| {
                format!("invalid instant '{s}', expected YYYY-MM-DDTHH:MM[:SS] or YYYY-MM-DD")
            })
    }
}

impl TryFrom<String> for Timestamp {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl Timestamp {
    /// Half-open window between two wire instants. Ordering is left to the
    /// engine so that a reversed window gets its usual error.
    pub fn window(start: Timestamp, end: Timestamp) -> Span {
        Span { start: start.0, end: end.0 }
    }
}

/// One request line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Auth {
        password: String,
    },
    GetAvailableDates {
        product_id: Ulid,
        #[serde(default)]
        start_date: Option<NaiveDate>,
        #[serde(default)]
        end_date: Option<NaiveDate>,
        #[serde(default)]
        include_hours: bool,
    },
    GetAvailableHours {
        product_id: Ulid,
        date: NaiveDate,
    },
    CheckAvailability {
        product_id: Ulid,
        start: Timestamp,
        end: Timestamp,
    },
    CalculatePrice {
        product_id: Ulid,
        user_id: Ulid,
        start: Timestamp,
        end: Timestamp,
        charging_type: ChargingType,
    },
    CreateRentalRequest {
        user_id: Ulid,
        product_id: Ulid,
        start: Timestamp,
        end: Timestamp,
        charging_type: ChargingType,
    },
    ConfirmRental {
        rental_id: Ulid,
        decision: RentalDecision,
    },
    GetReservation {
        id: Ulid,
    },
    RegisterCompany {
        #[serde(default)]
        id: Option<Ulid>,
        name: String,
    },
    RegisterClient {
        #[serde(default)]
        id: Option<Ulid>,
        name: String,
        #[serde(default)]
        email: Option<String>,
    },
    LinkAssociate {
        user_id: Ulid,
        company_id: Ulid,
    },
    RegisterProduct {
        #[serde(default)]
        id: Option<Ulid>,
        company_id: Ulid,
        name: String,
        #[serde(default)]
        description: Option<String>,
        pricing: ProductPricing,
    },
    DeleteProduct {
        id: Ulid,
    },
    SetWeeklySchedule {
        product_id: Ulid,
        slots: Vec<WeeklySlot>,
    },
    AddDateOverride {
        product_id: Ulid,
        #[serde(default)]
        id: Option<Ulid>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        is_available: bool,
        #[serde(default, with = "rust_decimal::serde::str_option")]
        price_override: Option<Decimal>,
    },
    RemoveDateOverride {
        product_id: Ulid,
        id: Ulid,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("empty request")]
    Empty,
    #[error("malformed request: {0}")]
    Malformed(String),
}

pub fn parse_request(line: &str) -> Result<Request, CommandError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(CommandError::Empty);
    }
    serde_json::from_str(trimmed).map_err(|e| CommandError::Malformed(e.to_string()))
}
