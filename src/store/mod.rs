//! Data-access contracts the engine runs against, plus the WAL-backed
//! in-memory implementation used by the server.

mod durable;
mod state;

pub use durable::DurableStore;
pub use state::ProductState;

use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The insert would overlap reservations that occupy the window.
    #[error("overlaps {} existing reservation(s)", .0.len())]
    Overlap(Vec<ConflictingReservation>),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("reservation {id} is {from}, expected {expected}")]
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        expected: ReservationStatus,
    },
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

/// Products, companies, clients and the associate relation.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn find_product(&self, id: Ulid) -> Result<Option<Product>, StoreError>;

    async fn find_company(&self, id: Ulid) -> Result<Option<Company>, StoreError>;

    async fn find_client(&self, id: Ulid) -> Result<Option<Client>, StoreError>;

    /// Whether `user_id` is a recognized associate of the company, which
    /// entitles them to the product discount.
    async fn is_associate(&self, user_id: Ulid, company_id: Ulid) -> Result<bool, StoreError>;
}

/// Weekly operating hours and date-range overrides.
#[async_trait]
pub trait RulesStore: Send + Sync {
    async fn find_weekly_availability(
        &self,
        product_id: Ulid,
    ) -> Result<Vec<WeeklySlot>, StoreError>;

    /// Overrides intersecting the inclusive date range `[first, last]`,
    /// ordered by start date.
    async fn find_date_overrides(
        &self,
        product_id: Ulid,
        first: NaiveDate,
        last: NaiveDate,
    ) -> Result<Vec<DateOverride>, StoreError>;
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// PENDING and CONFIRMED reservations overlapping `span`.
    async fn find_conflicting_reservations(
        &self,
        product_id: Ulid,
        span: Span,
    ) -> Result<Vec<ConflictingReservation>, StoreError>;

    /// Insert as PENDING. Implementations must refuse an insert that overlaps
    /// an occupying reservation of the same product, atomically with the write.
    async fn insert_reservation(&self, record: NewReservation) -> Result<Reservation, StoreError>;

    async fn find_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    /// Compare-and-set the status; fails with `InvalidTransition` when the
    /// current status is not `from`.
    async fn transition_reservation(
        &self,
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> Result<Reservation, StoreError>;
}
