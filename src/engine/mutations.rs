use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::conflict::validate_span;
use super::pricing::{calculate_price, PriceQuote};
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RentalRequest {
    pub product_id: Ulid,
    pub span: Span,
    pub charging_type: ChargingType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RentalDecision {
    Confirm,
    Reject,
}

impl RentalDecision {
    fn target(&self) -> ReservationStatus {
        match self {
            RentalDecision::Confirm => ReservationStatus::Confirmed,
            RentalDecision::Reject => ReservationStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductSummary {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub charging_model: ChargingModel,
}

/// Everything a caller needs to show the outcome of a rental request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RentalConfirmation {
    pub reservation: Reservation,
    pub pricing: PriceQuote,
    pub product: ProductSummary,
    pub company: Company,
    pub client: Client,
}

impl Engine {
    /// Validate, check, price, then insert one PENDING reservation.
    ///
    /// Nothing is written unless every step passes. The availability check
    /// here is advisory: two overlapping requests can both pass it, and the
    /// ledger's insert decides which one wins.
    pub async fn create_rental_request(
        &self,
        user_id: Ulid,
        request: RentalRequest,
    ) -> Result<RentalConfirmation, EngineError> {
        let RentalRequest { product_id, span, charging_type } = request;
        validate_span(&span)?;

        let product = self.live_product(product_id).await?;
        let owner = product.company_id;
        let company = self.catalog.find_company(owner).await?.ok_or_else(|| {
            EngineError::NotFound(format!("company {owner} owning product {product_id} not found"))
        })?;
        let client = self
            .catalog
            .find_client(user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("client {user_id} not found")))?;

        if let Some(blocker) = self.blocker_for(product_id, &span).await? {
            debug!("rental request on {product_id} refused: {}", blocker.reason());
            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL, "stage" => "check")
                .increment(1);
            return Err(blocker.into_error());
        }

        let is_associate = self.catalog.is_associate(user_id, company.id).await?;
        let pricing = calculate_price(&product.pricing, &span, charging_type, is_associate)?;

        let record = NewReservation {
            product_id,
            user_id,
            company_id: company.id,
            span,
            charging_type,
            total_amount: pricing.total_amount,
            discount_applied: pricing.discount_amount,
            product_name: product.name.clone(),
            company_name: company.name.clone(),
            client_name: client.name.clone(),
            created_at: self.clock.now_ms(),
        };
        let reservation = match self.ledger.insert_reservation(record).await {
            Ok(r) => r,
            Err(e) => {
                let e = EngineError::from(e);
                if matches!(e, EngineError::Conflict { .. }) {
                    metrics::counter!(
                        observability::RESERVATION_CONFLICTS_TOTAL,
                        "stage" => "insert"
                    )
                    .increment(1);
                }
                return Err(e);
            }
        };

        metrics::counter!(
            observability::RESERVATIONS_CREATED_TOTAL,
            "charging_type" => charging_type.to_string()
        )
        .increment(1);
        info!(
            "reservation {} PENDING: product {product_id}, user {user_id}, total {}",
            reservation.id, reservation.total_amount
        );

        Ok(RentalConfirmation {
            reservation,
            pricing,
            product: ProductSummary {
                id: product.id,
                name: product.name,
                description: product.description,
                charging_model: product.pricing.charging_model,
            },
            company,
            client,
        })
    }

    /// Move a PENDING reservation to CONFIRMED or CANCELLED. Any other
    /// current status, or an unknown id, is reported as not found.
    pub async fn confirm_rental(
        &self,
        rental_id: Ulid,
        decision: RentalDecision,
    ) -> Result<Reservation, EngineError> {
        let updated = self
            .ledger
            .transition_reservation(rental_id, ReservationStatus::Pending, decision.target())
            .await?;
        let label = match decision {
            RentalDecision::Confirm => "confirm",
            RentalDecision::Reject => "reject",
        };
        metrics::counter!(observability::RENTAL_DECISIONS_TOTAL, "decision" => label).increment(1);
        info!("reservation {rental_id} is now {}", updated.status);
        Ok(updated)
    }
}
