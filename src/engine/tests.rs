use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal_macros::dec;
use ulid::Ulid;

use super::*;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::store::{Catalog, DurableStore, Ledger, StoreError};

/// 2025-03-01T00:00, a Saturday.
const TODAY: Ms = 1_740_787_200_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("rentable_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, m, d).unwrap()
}

fn at(m: u32, d: u32, hour: i64) -> Ms {
    day_start(date(m, d)) + hour * HOUR_MS
}

fn march(from: u32, to: u32) -> Span {
    Span::new(at(3, from, 0), at(3, to, 0))
}

fn pricing(model: ChargingModel) -> ProductPricing {
    ProductPricing {
        charging_model: model,
        daily_price: Some(dec!(100.00)),
        hourly_price: Some(dec!(20.00)),
        discount_percentage: Some(dec!(10)),
    }
}

fn week(days: &[u8]) -> Vec<WeeklySlot> {
    days.iter()
        .map(|&d| WeeklySlot {
            day_of_week: d,
            start: TimeOfDay::hm(8, 0).unwrap(),
            end: TimeOfDay::hm(18, 0).unwrap(),
            is_available: true,
        })
        .collect()
}

struct Fixture {
    engine: Arc<Engine>,
    store: Arc<DurableStore>,
    company: Ulid,
    client: Ulid,
    product: Ulid,
}

async fn fixture(name: &str, model: ChargingModel) -> Fixture {
    let notify = Arc::new(NotifyHub::new());
    let store = Arc::new(DurableStore::open(test_wal_path(name), notify).unwrap());
    let company = Ulid::new();
    let client = Ulid::new();
    let product = Ulid::new();
    store.register_company(company, "Acme Spaces".into()).await.unwrap();
    store
        .register_client(client, "Ana".into(), Some("ana@example.com".into()))
        .await
        .unwrap();
    store
        .register_product(product, company, "Loft".into(), Some("Top floor".into()), pricing(model))
        .await
        .unwrap();
    store
        .set_weekly_schedule(product, week(&[0, 1, 2, 3, 4, 5, 6]))
        .await
        .unwrap();
    let engine = Arc::new(Engine::over_store(store.clone(), Arc::new(FixedClock(TODAY))));
    Fixture { engine, store, company, client, product }
}

fn daily(product_id: Ulid, span: Span) -> RentalRequest {
    RentalRequest { product_id, span, charging_type: ChargingType::PerDay }
}

fn hourly(product_id: Ulid, span: Span) -> RentalRequest {
    RentalRequest { product_id, span, charging_type: ChargingType::PerHour }
}

async fn occupying(f: &Fixture) -> usize {
    f.store
        .find_conflicting_reservations(
            f.product,
            Span::new(MIN_VALID_TIMESTAMP_MS, MAX_VALID_TIMESTAMP_MS),
        )
        .await
        .unwrap()
        .len()
}

// ── Availability reports ─────────────────────────────────

#[tokio::test]
async fn window_over_ninety_days_always_rejected() {
    let f = fixture("window_cap.wal", ChargingModel::PerDay).await;
    let query = AvailabilityQuery {
        start_date: Some(date(3, 1)),
        end_date: Some(date(5, 31)),
        include_hours: false,
    };
    let result = f.engine.get_available_dates(f.product, query).await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));

    // even for a product that does not exist
    let result = f.engine.get_available_dates(Ulid::new(), query).await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
}

#[tokio::test]
async fn default_report_covers_thirty_days_from_today() {
    let f = fixture("default_window.wal", ChargingModel::PerDay).await;
    let report = f
        .engine
        .get_available_dates(f.product, AvailabilityQuery::default())
        .await
        .unwrap();
    assert_eq!(report.len(), 31);
    assert_eq!(report[0].date, date(3, 1));
    assert_eq!(report[30].date, date(3, 31));
    assert!(report.iter().all(|e| e.is_available && e.price == Some(dec!(100.00))));
}

#[tokio::test]
async fn occupied_day_beats_open_weekday() {
    let f = fixture("precedence.wal", ChargingModel::PerDay).await;
    let confirmation = f
        .engine
        .create_rental_request(f.client, daily(f.product, march(5, 6)))
        .await
        .unwrap();
    f.engine
        .confirm_rental(confirmation.reservation.id, RentalDecision::Confirm)
        .await
        .unwrap();

    let query = AvailabilityQuery {
        start_date: Some(date(3, 4)),
        end_date: Some(date(3, 6)),
        include_hours: false,
    };
    let report = f.engine.get_available_dates(f.product, query).await.unwrap();
    assert_eq!(report.len(), 3);
    assert!(report[0].is_available);
    assert_eq!(report[1].reason, Some(UnavailableReason::OccupiedByRental));
    assert!(report[2].is_available);
}

#[tokio::test]
async fn report_lists_hours_for_hourly_products() {
    let f = fixture("report_hours.wal", ChargingModel::Both).await;
    let query = AvailabilityQuery {
        start_date: Some(date(3, 3)),
        end_date: Some(date(3, 3)),
        include_hours: true,
    };
    let report = f.engine.get_available_dates(f.product, query).await.unwrap();
    let hours = report[0].available_hours.as_ref().unwrap();
    assert_eq!(hours.len(), 10);
    assert_eq!(hours[0].to_string(), "08:00");
    assert_eq!(hours[9].to_string(), "17:00");
}

#[tokio::test]
async fn report_applies_overrides() {
    let f = fixture("report_overrides.wal", ChargingModel::PerDay).await;
    f.store
        .add_date_override(
            f.product,
            DateOverride {
                id: Ulid::new(),
                start_date: date(3, 8),
                end_date: date(3, 9),
                is_available: true,
                price_override: Some(dec!(150)),
            },
        )
        .await
        .unwrap();
    f.store
        .add_date_override(
            f.product,
            DateOverride {
                id: Ulid::new(),
                start_date: date(3, 10),
                end_date: date(3, 10),
                is_available: false,
                price_override: None,
            },
        )
        .await
        .unwrap();

    let query = AvailabilityQuery {
        start_date: Some(date(3, 8)),
        end_date: Some(date(3, 11)),
        include_hours: false,
    };
    let report = f.engine.get_available_dates(f.product, query).await.unwrap();
    assert_eq!(report[0].price, Some(dec!(150)));
    assert_eq!(report[1].price, Some(dec!(150)));
    assert_eq!(report[2].reason, Some(UnavailableReason::BlockedByOwner));
    assert_eq!(report[3].price, Some(dec!(100.00)));
}

#[tokio::test]
async fn missing_and_deleted_products() {
    let f = fixture("missing_deleted.wal", ChargingModel::PerDay).await;
    let result = f
        .engine
        .get_available_dates(Ulid::new(), AvailabilityQuery::default())
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));

    f.store.delete_product(f.product, TODAY).await.unwrap();
    let result = f.engine.get_available_dates(f.product, AvailabilityQuery::default()).await;
    assert!(matches!(result, Err(EngineError::Gone(_))));
    let result = f.engine.create_rental_request(f.client, daily(f.product, march(3, 4))).await;
    assert!(matches!(result, Err(EngineError::Gone(_))));
    let result = f.engine.check_availability(f.product, march(3, 4)).await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Gone);
}

// ── Hour lookups ─────────────────────────────────────────

#[tokio::test]
async fn hours_reject_past_dates() {
    let f = fixture("hours_past.wal", ChargingModel::PerHour).await;
    let result = f.engine.get_available_hours(f.product, date(2, 28)).await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    // today is fine
    let hours = f.engine.get_available_hours(f.product, date(3, 1)).await.unwrap();
    assert_eq!(hours.len(), 10);
}

#[tokio::test]
async fn hours_need_weekly_entry() {
    let f = fixture("hours_no_weekday.wal", ChargingModel::PerHour).await;
    // open Monday to Friday only
    f.store
        .set_weekly_schedule(f.product, week(&[1, 2, 3, 4, 5]))
        .await
        .unwrap();
    let result = f.engine.get_available_hours(f.product, date(3, 2)).await;
    assert!(matches!(result, Err(EngineError::NotFound(ref r)) if r.contains("Sunday")));
}

#[tokio::test]
async fn hours_blocked_by_owner_override() {
    let f = fixture("hours_blocked.wal", ChargingModel::PerHour).await;
    f.store
        .add_date_override(
            f.product,
            DateOverride {
                id: Ulid::new(),
                start_date: date(3, 3),
                end_date: date(3, 7),
                is_available: false,
                price_override: None,
            },
        )
        .await
        .unwrap();
    let result = f.engine.get_available_hours(f.product, date(3, 5)).await;
    assert!(matches!(result, Err(EngineError::Conflict { .. })));
}

#[tokio::test]
async fn hourly_products_lose_only_reserved_slots() {
    let f = fixture("hours_per_slot.wal", ChargingModel::PerHour).await;
    f.engine
        .create_rental_request(f.client, hourly(f.product, Span::new(at(3, 4, 9), at(3, 4, 11))))
        .await
        .unwrap();

    let hours: Vec<String> = f
        .engine
        .get_available_hours(f.product, date(3, 4))
        .await
        .unwrap()
        .iter()
        .map(|h| h.to_string())
        .collect();
    assert_eq!(hours.len(), 8);
    assert!(!hours.contains(&"09:00".to_string()));
    assert!(!hours.contains(&"10:00".to_string()));
    assert!(hours.contains(&"08:00".to_string()));
    assert!(hours.contains(&"11:00".to_string()));
}

#[tokio::test]
async fn hourly_products_conflict_when_fully_booked() {
    let f = fixture("hours_full.wal", ChargingModel::PerHour).await;
    f.engine
        .create_rental_request(f.client, hourly(f.product, Span::new(at(3, 4, 8), at(3, 4, 18))))
        .await
        .unwrap();
    let result = f.engine.get_available_hours(f.product, date(3, 4)).await;
    match result {
        Err(EngineError::Conflict { conflicts, .. }) => assert_eq!(conflicts.len(), 1),
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn daily_products_block_whole_day_for_hours() {
    let f = fixture("hours_daily.wal", ChargingModel::PerDay).await;
    f.engine
        .create_rental_request(f.client, daily(f.product, march(4, 5)))
        .await
        .unwrap();
    let result = f.engine.get_available_hours(f.product, date(3, 4)).await;
    assert!(matches!(result, Err(EngineError::Conflict { .. })));
    assert!(f.engine.get_available_hours(f.product, date(3, 5)).await.is_ok());
}

// ── Conflict detection and rental requests ───────────────

#[tokio::test]
async fn half_open_boundary_between_rentals() {
    let f = fixture("symmetry.wal", ChargingModel::PerDay).await;
    let a = f
        .engine
        .create_rental_request(f.client, daily(f.product, march(1, 5)))
        .await
        .unwrap();
    f.engine
        .confirm_rental(a.reservation.id, RentalDecision::Confirm)
        .await
        .unwrap();

    let b = f
        .engine
        .create_rental_request(f.client, daily(f.product, march(4, 6)))
        .await;
    match b {
        Err(EngineError::Conflict { reason, conflicts }) => {
            assert_eq!(reason, "period already reserved");
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].id, a.reservation.id);
            assert_eq!(conflicts[0].status, ReservationStatus::Confirmed);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    f.engine
        .create_rental_request(f.client, daily(f.product, march(5, 6)))
        .await
        .unwrap();
}

#[tokio::test]
async fn check_availability_reports_conflicts() {
    let f = fixture("check_conflicts.wal", ChargingModel::PerDay).await;
    let a = f
        .engine
        .create_rental_request(f.client, daily(f.product, march(10, 12)))
        .await
        .unwrap();

    let check = f.engine.check_availability(f.product, march(11, 13)).await.unwrap();
    assert!(!check.is_available);
    assert_eq!(check.reason.as_deref(), Some("period already reserved"));
    assert_eq!(check.conflicts[0].id, a.reservation.id);

    let free = f.engine.check_availability(f.product, march(12, 13)).await.unwrap();
    assert!(free.is_available);

    let backwards = Span { start: at(3, 13, 0), end: at(3, 12, 0) };
    let reversed = f.engine.check_availability(f.product, backwards).await;
    assert!(matches!(reversed, Err(EngineError::InvalidArgument(_))));
}

#[tokio::test]
async fn blocked_period_and_closed_day() {
    let f = fixture("blocked_closed.wal", ChargingModel::PerDay).await;
    f.store
        .add_date_override(
            f.product,
            DateOverride {
                id: Ulid::new(),
                start_date: date(3, 20),
                end_date: date(3, 21),
                is_available: false,
                price_override: None,
            },
        )
        .await
        .unwrap();
    let blocked = f.engine.create_rental_request(f.client, daily(f.product, march(19, 22))).await;
    assert!(matches!(
        blocked,
        Err(EngineError::Conflict { ref reason, .. }) if reason == "blocked for this period"
    ));

    // closed on Sundays
    f.store
        .set_weekly_schedule(f.product, week(&[1, 2, 3, 4, 5, 6]))
        .await
        .unwrap();
    let closed = f.engine.create_rental_request(f.client, daily(f.product, march(8, 10))).await;
    assert!(matches!(closed, Err(EngineError::InvalidArgument(ref r)) if r.contains("Sunday")));
    assert_eq!(occupying(&f).await, 0);
}

#[tokio::test]
async fn confirmation_carries_pricing_and_summaries() {
    let f = fixture("confirmation.wal", ChargingModel::Both).await;
    let mut rx = f.store.notify.subscribe(f.product);

    let c = f
        .engine
        .create_rental_request(
            f.client,
            hourly(f.product, Span::new(at(3, 3, 9), at(3, 3, 11) + 1)),
        )
        .await
        .unwrap();
    assert_eq!(c.reservation.status, ReservationStatus::Pending);
    assert_eq!(c.pricing.period.units, 3);
    assert_eq!(c.pricing.base_amount, dec!(60.00));
    assert_eq!(c.reservation.total_amount, dec!(60.00));
    assert_eq!(c.reservation.discount_applied, dec!(0));
    assert_eq!(c.reservation.company_name, "Acme Spaces");
    assert_eq!(c.reservation.client_name, "Ana");
    assert_eq!(c.reservation.created_at, TODAY);
    assert_eq!(c.product.name, "Loft");
    assert_eq!(c.company.id, f.company);
    assert_eq!(c.client.email.as_deref(), Some("ana@example.com"));

    match rx.recv().await.unwrap() {
        Event::ReservationPlaced { reservation } => assert_eq!(reservation.id, c.reservation.id),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn unknown_client_rejected_without_write() {
    let f = fixture("unknown_client.wal", ChargingModel::PerDay).await;
    let result = f.engine.create_rental_request(Ulid::new(), daily(f.product, march(3, 4))).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
    assert_eq!(occupying(&f).await, 0);
}

#[tokio::test]
async fn incompatible_charging_type_writes_nothing() {
    let f = fixture("incompatible.wal", ChargingModel::PerDay).await;
    let result = f
        .engine
        .create_rental_request(f.client, hourly(f.product, Span::new(at(3, 3, 9), at(3, 3, 10))))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    assert_eq!(occupying(&f).await, 0);
}

/// Catalog whose products have lost their hourly price.
struct NoHourlyPrice(Arc<DurableStore>);

#[async_trait]
impl Catalog for NoHourlyPrice {
    async fn find_product(&self, id: Ulid) -> Result<Option<Product>, StoreError> {
        Ok(self.0.find_product(id).await?.map(|mut p| {
            p.pricing.hourly_price = None;
            p
        }))
    }

    async fn find_company(&self, id: Ulid) -> Result<Option<Company>, StoreError> {
        self.0.find_company(id).await
    }

    async fn find_client(&self, id: Ulid) -> Result<Option<Client>, StoreError> {
        self.0.find_client(id).await
    }

    async fn is_associate(&self, user_id: Ulid, company_id: Ulid) -> Result<bool, StoreError> {
        self.0.is_associate(user_id, company_id).await
    }
}

#[tokio::test]
async fn pricing_failure_leaves_no_reservation() {
    let f = fixture("no_partial_write.wal", ChargingModel::Both).await;
    let engine = Engine::new(
        Arc::new(NoHourlyPrice(f.store.clone())),
        f.store.clone(),
        f.store.clone(),
        Arc::new(FixedClock(TODAY)),
    );
    let result = engine
        .create_rental_request(f.client, hourly(f.product, Span::new(at(3, 3, 9), at(3, 3, 10))))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(ref r)) if r.contains("hourly")));
    assert_eq!(occupying(&f).await, 0);
}

#[tokio::test]
async fn twenty_five_hours_bill_as_two_days() {
    let f = fixture("ceil_days.wal", ChargingModel::PerDay).await;
    let quote = f
        .engine
        .calculate_price(
            f.product,
            Span::new(at(3, 3, 0), at(3, 4, 1)),
            ChargingType::PerDay,
            f.client,
        )
        .await
        .unwrap();
    assert_eq!(quote.period.units, 2);
    assert_eq!(quote.total_amount, dec!(200.00));
}

#[tokio::test]
async fn associate_discount_is_stable() {
    let f = fixture("associate.wal", ChargingModel::PerDay).await;
    f.store.link_associate(f.client, f.company).await.unwrap();

    let span = march(3, 6);
    let first = f
        .engine
        .calculate_price(f.product, span, ChargingType::PerDay, f.client)
        .await
        .unwrap();
    let second = f
        .engine
        .calculate_price(f.product, span, ChargingType::PerDay, f.client)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(first.discount_amount, dec!(30.00));
    assert_eq!(first.total_amount, dec!(270.00));

    let c = f.engine.create_rental_request(f.client, daily(f.product, span)).await.unwrap();
    assert_eq!(c.reservation.total_amount, dec!(270.00));
    assert_eq!(c.reservation.discount_applied, dec!(30.00));
}

// ── Confirmation state machine ───────────────────────────

#[tokio::test]
async fn confirm_only_from_pending() {
    let f = fixture("state_machine.wal", ChargingModel::PerDay).await;
    let c = f
        .engine
        .create_rental_request(f.client, daily(f.product, march(3, 4)))
        .await
        .unwrap();
    let id = c.reservation.id;

    let confirmed = f.engine.confirm_rental(id, RentalDecision::Confirm).await.unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);

    let again = f.engine.confirm_rental(id, RentalDecision::Confirm).await;
    assert!(matches!(again, Err(EngineError::NotFound(_))));
    let reject = f.engine.confirm_rental(id, RentalDecision::Reject).await;
    assert!(matches!(reject, Err(EngineError::NotFound(_))));
    assert_eq!(f.engine.get_reservation(id).await.unwrap().status, ReservationStatus::Confirmed);

    let missing = f.engine.confirm_rental(Ulid::new(), RentalDecision::Confirm).await;
    assert!(matches!(missing, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn rejected_rental_frees_window() {
    let f = fixture("reject_frees.wal", ChargingModel::PerDay).await;
    let c = f
        .engine
        .create_rental_request(f.client, daily(f.product, march(3, 5)))
        .await
        .unwrap();
    let cancelled = f
        .engine
        .confirm_rental(c.reservation.id, RentalDecision::Reject)
        .await
        .unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);

    let again = f.engine.confirm_rental(c.reservation.id, RentalDecision::Confirm).await;
    assert!(matches!(again, Err(EngineError::NotFound(_))));

    f.engine
        .create_rental_request(f.client, daily(f.product, march(3, 5)))
        .await
        .unwrap();
}

// ── Concurrency and durability ───────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_requests_admit_exactly_one() {
    let f = fixture("race.wal", ChargingModel::PerHour).await;
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = f.engine.clone();
        let (client, product) = (f.client, f.product);
        // all windows share 12:00-13:00
        let span = Span::new(at(3, 4, 10 + (i % 3)), at(3, 4, 13));
        handles.push(tokio::spawn(async move {
            engine.create_rental_request(client, hourly(product, span)).await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(occupying(&f).await, 1);
}

#[tokio::test]
async fn reservations_survive_restart() {
    let path = test_wal_path("restart.wal");
    let (product, id) = {
        let f = fixture("restart.wal", ChargingModel::PerDay).await;
        let c = f
            .engine
            .create_rental_request(f.client, daily(f.product, march(3, 5)))
            .await
            .unwrap();
        f.engine
            .confirm_rental(c.reservation.id, RentalDecision::Confirm)
            .await
            .unwrap();
        (f.product, c.reservation.id)
    };

    let store = Arc::new(DurableStore::open(path, Arc::new(NotifyHub::new())).unwrap());
    let engine = Engine::over_store(store, Arc::new(FixedClock(TODAY)));
    assert_eq!(engine.get_reservation(id).await.unwrap().status, ReservationStatus::Confirmed);
    let check = engine.check_availability(product, march(4, 6)).await.unwrap();
    assert!(!check.is_available);
}
