use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

use super::state::ProductState;
use super::{Catalog, Ledger, RulesStore, StoreError};

pub type SharedProductState = Arc<RwLock<ProductState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every append that is already queued when the first one
/// arrives joins its batch, and the whole batch shares one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.stage(event))
        .and_then(|()| wal.sync());
    if let Err(e) = &result {
        warn!("WAL batch of {} failed, rolling back: {e}", batch.len());
        if let Err(rollback) = wal.rollback() {
            error!("WAL rollback failed, refusing further appends: {rollback}");
        }
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_snapshot(wal.path(), &events)
                .and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.records_since_snapshot());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

fn wal_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Wal(e.to_string())
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), StoreError> {
    if value.len() > max {
        return Err(StoreError::LimitExceeded(what));
    }
    Ok(())
}

/// In-memory catalog, rules store and ledger, made durable by a WAL.
///
/// Each product's schedule, overrides and reservations sit behind one
/// `RwLock`; every write to a product takes that lock, re-validates against
/// the locked state, appends to the WAL, then applies. Writers take the
/// compaction gate (shared) before any product lock, so a snapshot never
/// misses an event that reached the old log.
pub struct DurableStore {
    products: DashMap<Ulid, SharedProductState>,
    companies: DashMap<Ulid, Company>,
    clients: DashMap<Ulid, Client>,
    /// (user, company) pairs entitled to the product discount.
    associates: DashSet<(Ulid, Ulid)>,
    /// Reservation id → product id.
    reservation_index: DashMap<Ulid, Ulid>,
    catalog_lock: Mutex<()>,
    gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl DurableStore {
    /// Replay the log at `wal_path` and start the writer task. Must be
    /// called inside a Tokio runtime.
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            products: DashMap::new(),
            companies: DashMap::new(),
            clients: DashMap::new(),
            associates: DashSet::new(),
            reservation_index: DashMap::new(),
            catalog_lock: Mutex::new(()),
            gate: RwLock::new(()),
            wal_tx,
            notify,
        };

        // Nobody else holds these locks yet, so try_write cannot fail here.
        for event in &events {
            if store.apply_catalog(event) {
                continue;
            }
            let Some(product_id) = event.product_id() else { continue };
            let Some(shared) = store.get_product(&product_id) else {
                warn!("replay: event for unknown product {product_id}, skipped");
                continue;
            };
            if let Ok(mut guard) = shared.try_write() {
                store.apply_to_product(&mut guard, event);
            }
        }
        info!(
            "replayed {} events: {} products, {} reservations",
            events.len(),
            store.products.len(),
            store.reservation_index.len()
        );

        Ok(store)
    }

    /// Apply catalog-wide events. Returns false for product-scoped ones.
    fn apply_catalog(&self, event: &Event) -> bool {
        match event {
            Event::CompanyRegistered { id, name } => {
                self.companies.insert(*id, Company { id: *id, name: name.clone() });
            }
            Event::ClientRegistered { id, name, email } => {
                self.clients.insert(
                    *id,
                    Client { id: *id, name: name.clone(), email: email.clone() },
                );
            }
            Event::AssociateLinked { user_id, company_id } => {
                self.associates.insert((*user_id, *company_id));
            }
            Event::ProductRegistered { id, company_id, name, description, pricing } => {
                let product = Product {
                    id: *id,
                    company_id: *company_id,
                    name: name.clone(),
                    description: description.clone(),
                    pricing: pricing.clone(),
                    deleted_at: None,
                };
                self.products
                    .insert(*id, Arc::new(RwLock::new(ProductState::new(product))));
            }
            _ => return false,
        }
        true
    }

    fn apply_to_product(&self, ps: &mut ProductState, event: &Event) {
        if let Event::ReservationPlaced { reservation } = event {
            self.reservation_index.insert(reservation.id, reservation.product_id);
        }
        ps.apply(event);
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| wal_error("WAL writer shut down"))?;
        rx.await
            .map_err(|_| wal_error("WAL writer dropped response"))?
            .map_err(wal_error)
    }

    /// WAL-append, apply, notify. The caller holds the product's write lock.
    async fn persist_and_apply(
        &self,
        ps: &mut ProductState,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        self.apply_to_product(ps, event);
        self.notify.send(ps.product.id, event);
        Ok(())
    }

    /// Same as `persist_and_apply` for catalog-wide events.
    async fn persist_catalog(&self, event: &Event) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        if let Some(product_id) = event.product_id() {
            self.notify.send(product_id, event);
        }
        Ok(())
    }

    pub fn get_product(&self, id: &Ulid) -> Option<SharedProductState> {
        self.products.get(id).map(|e| e.value().clone())
    }

    async fn product_write(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProductState>, StoreError> {
        let shared = self.get_product(&id).ok_or(StoreError::NotFound(id))?;
        Ok(shared.write_owned().await)
    }

    async fn product_read<T>(&self, id: Ulid, f: impl FnOnce(&ProductState) -> T) -> Option<T> {
        let shared = self.get_product(&id)?;
        let guard = shared.read().await;
        Some(f(&guard))
    }

    // ── Catalog and rule writes ──────────────────────────────

    pub async fn register_company(&self, id: Ulid, name: String) -> Result<(), StoreError> {
        check_len(&name, MAX_NAME_LEN, "company name too long")?;
        let _gate = self.gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.companies.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        self.persist_catalog(&Event::CompanyRegistered { id, name }).await
    }

    pub async fn register_client(
        &self,
        id: Ulid,
        name: String,
        email: Option<String>,
    ) -> Result<(), StoreError> {
        check_len(&name, MAX_NAME_LEN, "client name too long")?;
        if let Some(e) = &email {
            check_len(e, MAX_NAME_LEN, "client email too long")?;
        }
        let _gate = self.gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.clients.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        self.persist_catalog(&Event::ClientRegistered { id, name, email }).await
    }

    pub async fn link_associate(&self, user_id: Ulid, company_id: Ulid) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if !self.companies.contains_key(&company_id) {
            return Err(StoreError::NotFound(company_id));
        }
        if self.associates.contains(&(user_id, company_id)) {
            return Ok(());
        }
        self.persist_catalog(&Event::AssociateLinked { user_id, company_id }).await
    }

    pub async fn register_product(
        &self,
        id: Ulid,
        company_id: Ulid,
        name: String,
        description: Option<String>,
        pricing: ProductPricing,
    ) -> Result<(), StoreError> {
        check_len(&name, MAX_NAME_LEN, "product name too long")?;
        if let Some(d) = &description {
            check_len(d, MAX_DESCRIPTION_LEN, "product description too long")?;
        }
        pricing.validate().map_err(|e| StoreError::Invalid(e.into()))?;

        let _gate = self.gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.products.len() >= MAX_PRODUCTS {
            return Err(StoreError::LimitExceeded("too many products"));
        }
        if self.products.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        if !self.companies.contains_key(&company_id) {
            return Err(StoreError::NotFound(company_id));
        }
        let event = Event::ProductRegistered { id, company_id, name, description, pricing };
        self.persist_catalog(&event).await
    }

    /// Soft delete. Reservations are kept; the product answers as gone.
    pub async fn delete_product(&self, id: Ulid, at: Ms) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        let mut guard = self.product_write(id).await?;
        if guard.product.is_deleted() {
            return Err(StoreError::Invalid(format!("product {id} is already deleted")));
        }
        self.persist_and_apply(&mut guard, &Event::ProductDeleted { id, at }).await
    }

    /// Replace the whole weekly pattern.
    pub async fn set_weekly_schedule(
        &self,
        product_id: Ulid,
        slots: Vec<WeeklySlot>,
    ) -> Result<(), StoreError> {
        let mut seen = [false; 7];
        for slot in &slots {
            slot.validate().map_err(|e| StoreError::Invalid(e.into()))?;
            let day = usize::from(slot.day_of_week);
            if seen[day] {
                return Err(StoreError::Invalid(format!(
                    "{} appears more than once in the weekly schedule",
                    weekday_name(slot.day_of_week)
                )));
            }
            seen[day] = true;
        }
        let _gate = self.gate.read().await;
        let mut guard = self.product_write(product_id).await?;
        self.persist_and_apply(&mut guard, &Event::WeeklyScheduleSet { product_id, slots })
            .await
    }

    /// Overrides of one product never overlap; an overlapping range is refused here
    /// so reads never have to pick between two matches.
    pub async fn add_date_override(
        &self,
        product_id: Ulid,
        entry: DateOverride,
    ) -> Result<(), StoreError> {
        if entry.start_date > entry.end_date {
            return Err(StoreError::Invalid("override start_date is after end_date".into()));
        }
        if let Some(price) = entry.price_override
            && price < rust_decimal::Decimal::ZERO
        {
            return Err(StoreError::Invalid("override price must not be negative".into()));
        }
        let _gate = self.gate.read().await;
        let mut guard = self.product_write(product_id).await?;
        if guard.overrides.len() >= MAX_OVERRIDES_PER_PRODUCT {
            return Err(StoreError::LimitExceeded("too many overrides on product"));
        }
        if guard.overrides.iter().any(|o| o.id == entry.id) {
            return Err(StoreError::AlreadyExists(entry.id));
        }
        if let Some(existing) = guard.overrides_between(entry.start_date, entry.end_date).next() {
            return Err(StoreError::Invalid(format!(
                "override {} to {} overlaps existing override {} ({} to {})",
                entry.start_date,
                entry.end_date,
                existing.id,
                existing.start_date,
                existing.end_date
            )));
        }
        self.persist_and_apply(&mut guard, &Event::OverrideAdded { product_id, entry })
            .await
    }

    pub async fn remove_date_override(&self, product_id: Ulid, id: Ulid) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        let mut guard = self.product_write(product_id).await?;
        if !guard.overrides.iter().any(|o| o.id == id) {
            return Err(StoreError::NotFound(id));
        }
        self.persist_and_apply(&mut guard, &Event::OverrideRemoved { product_id, id })
            .await
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _gate = self.gate.write().await;

        let mut events: Vec<Event> = Vec::new();
        events.extend(self.companies.iter().map(|c| Event::CompanyRegistered {
            id: c.id,
            name: c.name.clone(),
        }));
        events.extend(self.clients.iter().map(|c| Event::ClientRegistered {
            id: c.id,
            name: c.name.clone(),
            email: c.email.clone(),
        }));
        events.extend(self.associates.iter().map(|pair| {
            let (user_id, company_id) = *pair;
            Event::AssociateLinked { user_id, company_id }
        }));

        let products: Vec<SharedProductState> =
            self.products.iter().map(|e| e.value().clone()).collect();
        for shared in products {
            events.extend(shared.read().await.snapshot_events());
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| wal_error("WAL writer shut down"))?;
        rx.await
            .map_err(|_| wal_error("WAL writer dropped response"))?
            .map_err(wal_error)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Catalog for DurableStore {
    async fn find_product(&self, id: Ulid) -> Result<Option<Product>, StoreError> {
        Ok(self.product_read(id, |ps| ps.product.clone()).await)
    }

    async fn find_company(&self, id: Ulid) -> Result<Option<Company>, StoreError> {
        Ok(self.companies.get(&id).map(|c| c.value().clone()))
    }

    async fn find_client(&self, id: Ulid) -> Result<Option<Client>, StoreError> {
        Ok(self.clients.get(&id).map(|c| c.value().clone()))
    }

    async fn is_associate(&self, user_id: Ulid, company_id: Ulid) -> Result<bool, StoreError> {
        Ok(self.associates.contains(&(user_id, company_id)))
    }
}

#[async_trait]
impl RulesStore for DurableStore {
    async fn find_weekly_availability(
        &self,
        product_id: Ulid,
    ) -> Result<Vec<WeeklySlot>, StoreError> {
        self.product_read(product_id, |ps| ps.weekly.clone())
            .await
            .ok_or(StoreError::NotFound(product_id))
    }

    async fn find_date_overrides(
        &self,
        product_id: Ulid,
        first: NaiveDate,
        last: NaiveDate,
    ) -> Result<Vec<DateOverride>, StoreError> {
        self.product_read(product_id, |ps| ps.overrides_between(first, last).cloned().collect())
            .await
            .ok_or(StoreError::NotFound(product_id))
    }
}

#[async_trait]
impl Ledger for DurableStore {
    async fn find_conflicting_reservations(
        &self,
        product_id: Ulid,
        span: Span,
    ) -> Result<Vec<ConflictingReservation>, StoreError> {
        self.product_read(product_id, |ps| {
            ps.occupying(&span).map(ConflictingReservation::from).collect()
        })
        .await
            .ok_or(StoreError::NotFound(product_id))
    }

    async fn insert_reservation(&self, record: NewReservation) -> Result<Reservation, StoreError> {
        let _gate = self.gate.read().await;
        let mut guard = self.product_write(record.product_id).await?;
        if guard.product.is_deleted() {
            return Err(StoreError::NotFound(record.product_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_PRODUCT {
            return Err(StoreError::LimitExceeded("too many reservations on product"));
        }

        // The exclusion check that makes concurrent overlapping requests safe:
        // it runs against the locked state, in the same critical section as the write.
        let conflicts: Vec<ConflictingReservation> = guard
            .occupying(&record.span)
            .map(ConflictingReservation::from)
            .collect();
        if !conflicts.is_empty() {
            return Err(StoreError::Overlap(conflicts));
        }

        let reservation = record.into_pending(Ulid::new());
        let event = Event::ReservationPlaced { reservation: reservation.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("reservation {} placed on product {}", reservation.id, reservation.product_id);
        Ok(reservation)
    }

    async fn find_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        let Some(product_id) = self.reservation_index.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self
            .product_read(product_id, |ps| ps.reservation(id).cloned())
            .await
            .flatten())
    }

    async fn transition_reservation(
        &self,
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> Result<Reservation, StoreError> {
        let product_id = self
            .reservation_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        let _gate = self.gate.read().await;
        let mut guard = self.product_write(product_id).await?;
        let current = guard.reservation(id).ok_or(StoreError::NotFound(id))?.status;
        if current != from {
            return Err(StoreError::InvalidTransition { id, from: current, expected: from });
        }
        let event = Event::ReservationStatusChanged { id, product_id, status: to };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.reservation(id).cloned().ok_or(StoreError::NotFound(id))
    }
}
