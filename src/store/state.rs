use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// Everything the engine needs to know about one product, guarded by a
/// single lock in the store.
#[derive(Debug, Clone)]
pub struct ProductState {
    pub product: Product,
    /// At most one entry per weekday, ordered by `day_of_week`.
    pub weekly: Vec<WeeklySlot>,
    /// Non-overlapping, ordered by `start_date`.
    pub overrides: Vec<DateOverride>,
    /// All reservations regardless of status, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl ProductState {
    pub fn new(product: Product) -> Self {
        Self {
            product,
            weekly: Vec::new(),
            overrides: Vec::new(),
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations of any status whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Overlapping reservations that still block the window.
    pub fn occupying(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        self.overlapping(query).filter(|r| r.status.occupies())
    }

    pub fn overrides_between(
        &self,
        first: NaiveDate,
        last: NaiveDate,
    ) -> impl Iterator<Item = &DateOverride> {
        self.overrides.iter().filter(move |o| o.intersects(first, last))
    }

    /// Apply an event that targets this product. The caller holds the lock.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ProductDeleted { at, .. } => {
                self.product.deleted_at = Some(*at);
            }
            Event::WeeklyScheduleSet { slots, .. } => {
                let mut slots = slots.clone();
                slots.sort_by_key(|s| s.day_of_week);
                self.weekly = slots;
            }
            Event::OverrideAdded { entry, .. } => {
                let pos = self
                    .overrides
                    .partition_point(|o| o.start_date <= entry.start_date);
                self.overrides.insert(pos, entry.clone());
            }
            Event::OverrideRemoved { id, .. } => {
                self.overrides.retain(|o| o.id != *id);
            }
            Event::ReservationPlaced { reservation } => {
                self.insert_reservation(reservation.clone());
            }
            Event::ReservationStatusChanged { id, status, .. } => {
                if let Some(r) = self.reservation_mut(*id) {
                    r.status = *status;
                }
            }
            // Registration is handled at the map level; catalog-wide events
            // never reach a product.
            Event::ProductRegistered { .. }
            | Event::CompanyRegistered { .. }
            | Event::ClientRegistered { .. }
            | Event::AssociateLinked { .. } => {}
        }
    }

    /// Events that recreate this product from nothing, used by compaction.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let p = &self.product;
        let mut events = vec![Event::ProductRegistered {
            id: p.id,
            company_id: p.company_id,
            name: p.name.clone(),
            description: p.description.clone(),
            pricing: p.pricing.clone(),
        }];
        if !self.weekly.is_empty() {
            events.push(Event::WeeklyScheduleSet {
                product_id: p.id,
                slots: self.weekly.clone(),
            });
        }
        for entry in &self.overrides {
            events.push(Event::OverrideAdded {
                product_id: p.id,
                entry: entry.clone(),
            });
        }
        for reservation in &self.reservations {
            events.push(Event::ReservationPlaced {
                reservation: reservation.clone(),
            });
        }
        if let Some(at) = p.deleted_at {
            events.push(Event::ProductDeleted { id: p.id, at });
        }
        events
    }
}
