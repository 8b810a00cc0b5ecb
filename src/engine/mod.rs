mod availability;
mod conflict;
mod error;
mod mutations;
mod pricing;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{
    evaluate_day, evaluate_window, generate_hour_range, AvailabilityEntry, DayRules,
    UnavailableReason,
};
pub use conflict::{find_blocker, AvailabilityCheck, Blocker};
pub use error::{EngineError, ErrorKind};
pub use mutations::{RentalConfirmation, RentalDecision, RentalRequest, ProductSummary};
pub use pricing::{calculate_price, round_money, BillingPeriod, BillingUnit, PriceQuote};
pub use queries::{resolve_window, AvailabilityQuery};

use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::store::{Catalog, DurableStore, Ledger, RulesStore};

/// Source of "now" in the caller's wall-clock timezone.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;

    fn today(&self) -> NaiveDate {
        date_of(self.now_ms())
    }
}

/// Local wall clock of the host.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        chrono::Local::now().naive_local().and_utc().timestamp_millis()
    }
}

/// A clock that never moves.
pub struct FixedClock(pub Ms);

impl Clock for FixedClock {
    fn now_ms(&self) -> Ms {
        self.0
    }
}

/// Availability, pricing and rental orchestration over injected stores.
///
/// The engine holds no mutable state of its own; every decision is made
/// from what the stores return, and the ledger's insert-time exclusion is
/// what keeps concurrent rental requests from double-booking.
pub struct Engine {
    pub(super) catalog: Arc<dyn Catalog>,
    pub(super) rules: Arc<dyn RulesStore>,
    pub(super) ledger: Arc<dyn Ledger>,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        rules: Arc<dyn RulesStore>,
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { catalog, rules, ledger, clock }
    }

    /// Engine over a single store that implements all three contracts.
    pub fn over_store(store: Arc<DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self::new(store.clone(), store.clone(), store, clock)
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Product that exists and is not soft-deleted.
    pub(super) async fn live_product(&self, id: Ulid) -> Result<Product, EngineError> {
        let product = self
            .catalog
            .find_product(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("product {id} not found")))?;
        if product.is_deleted() {
            return Err(EngineError::Gone(format!("product {id} has been deleted")));
        }
        Ok(product)
    }
}
