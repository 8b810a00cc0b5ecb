use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::invalid("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::invalid("timestamp out of range"));
    }
    if span.duration_ms() > MAX_RENTAL_DURATION_MS {
        return Err(EngineError::invalid("rental period is longer than 366 days"));
    }
    Ok(())
}

/// The first thing standing in the way of a requested window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    Reserved(Vec<ConflictingReservation>),
    BlockedByOwner { override_id: Ulid },
    ClosedDay { date: NaiveDate, day_of_week: u8 },
}

impl Blocker {
    pub fn reason(&self) -> String {
        match self {
            Blocker::Reserved(_) => "period already reserved".to_string(),
            Blocker::BlockedByOwner { .. } => "blocked for this period".to_string(),
            Blocker::ClosedDay { date, day_of_week } => {
                format!("not available on {} ({date})", weekday_name(*day_of_week))
            }
        }
    }

    pub fn into_error(self) -> EngineError {
        let reason = self.reason();
        match self {
            Blocker::Reserved(conflicts) => EngineError::conflict(reason, conflicts),
            Blocker::BlockedByOwner { .. } => EngineError::conflict(reason, Vec::new()),
            Blocker::ClosedDay { .. } => EngineError::invalid(reason),
        }
    }
}

/// Checks, in order: occupying reservations, blocking overrides, then each
/// calendar day from the start instant through the end instant (inclusive)
/// against overrides and the weekly pattern.
pub fn find_blocker(
    span: &Span,
    reservations: &[ConflictingReservation],
    overrides: &[DateOverride],
    weekly: &[WeeklySlot],
) -> Option<Blocker> {
    let taken: Vec<ConflictingReservation> = reservations
        .iter()
        .filter(|r| r.status.occupies() && Span::new(r.start, r.end).overlaps(span))
        .copied()
        .collect();
    if !taken.is_empty() {
        return Some(Blocker::Reserved(taken));
    }

    let (first, last) = span.days();
    if let Some(o) = overrides
        .iter()
        .find(|o| !o.is_available && o.intersects(first, last))
    {
        return Some(Blocker::BlockedByOwner { override_id: o.id });
    }

    for date in first.iter_days().take_while(|d| *d <= last) {
        let day_of_week = weekday_index(date);
        let open = match overrides.iter().find(|o| o.covers(date)) {
            Some(o) => o.is_available,
            None => weekly
                .iter()
                .any(|s| s.day_of_week == day_of_week && s.is_available),
        };
        if !open {
            return Some(Blocker::ClosedDay { date, day_of_week });
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityCheck {
    pub is_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictingReservation>,
}

impl From<Option<&Blocker>> for AvailabilityCheck {
    fn from(blocker: Option<&Blocker>) -> Self {
        match blocker {
            None => Self { is_available: true, reason: None, conflicts: Vec::new() },
            Some(b) => Self {
                is_available: false,
                reason: Some(b.reason()),
                conflicts: match b {
                    Blocker::Reserved(c) => c.clone(),
                    _ => Vec::new(),
                },
            },
        }
    }
}

impl Engine {
    /// Fetch what the window needs and run `find_blocker`. Not atomic with
    /// any later insert; the ledger re-checks overlap when writing.
    pub(super) async fn blocker_for(
        &self,
        product_id: Ulid,
        span: &Span,
    ) -> Result<Option<Blocker>, EngineError> {
        let reservations = self.ledger.find_conflicting_reservations(product_id, *span).await?;
        let (first, last) = span.days();
        let overrides = self.rules.find_date_overrides(product_id, first, last).await?;
        let weekly = self.rules.find_weekly_availability(product_id).await?;
        Ok(find_blocker(span, &reservations, &overrides, &weekly))
    }

    pub async fn check_availability(
        &self,
        product_id: Ulid,
        span: Span,
    ) -> Result<AvailabilityCheck, EngineError> {
        validate_span(&span)?;
        self.live_product(product_id).await?;
        let blocker = self.blocker_for(product_id, &span).await?;
        Ok(AvailabilityCheck::from(blocker.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::HOUR_MS;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn days(from: u32, to: u32) -> Span {
        Span::new(day_start(date(from)), day_start(date(to)))
    }

    fn open_week() -> Vec<WeeklySlot> {
        (0..7)
            .map(|d| WeeklySlot {
                day_of_week: d,
                start: TimeOfDay::hm(0, 0).unwrap(),
                end: TimeOfDay::hm(24, 0).unwrap(),
                is_available: true,
            })
            .collect()
    }

    fn held(span: Span, status: ReservationStatus) -> ConflictingReservation {
        ConflictingReservation { id: Ulid::new(), start: span.start, end: span.end, status }
    }

    fn window_override(from: u32, to: u32, is_available: bool) -> DateOverride {
        DateOverride {
            id: Ulid::new(),
            start_date: date(from),
            end_date: date(to),
            is_available,
            price_override: None,
        }
    }

    #[test]
    fn overlap_is_half_open() {
        let week = open_week();
        let existing = [held(days(1, 5), ReservationStatus::Confirmed)];

        let b = find_blocker(&days(4, 6), &existing, &[], &week);
        assert!(matches!(b, Some(Blocker::Reserved(ref c)) if c.len() == 1));

        assert_eq!(find_blocker(&days(5, 6), &existing, &[], &week), None);
    }

    #[test]
    fn released_reservations_do_not_block() {
        let week = open_week();
        let existing = [
            held(days(1, 5), ReservationStatus::Cancelled),
            held(days(1, 5), ReservationStatus::Completed),
        ];
        assert_eq!(find_blocker(&days(2, 3), &existing, &[], &week), None);
    }

    #[test]
    fn blocking_override_reported_after_reservations() {
        let week = open_week();
        let blocked = [window_override(3, 3, false)];
        let b = find_blocker(&days(2, 4), &[], &blocked, &week).unwrap();
        assert_eq!(b.reason(), "blocked for this period");

        let existing = [held(days(2, 3), ReservationStatus::Pending)];
        let b = find_blocker(&days(2, 4), &existing, &blocked, &week).unwrap();
        assert_eq!(b.reason(), "period already reserved");
    }

    #[test]
    fn closed_weekday_named_in_reason() {
        // Sunday closed
        let week: Vec<WeeklySlot> =
            open_week().into_iter().filter(|s| s.day_of_week != 0).collect();
        // Sat 1st .. Mon 3rd touches Sunday the 2nd
        let b = find_blocker(&days(1, 4), &[], &[], &week).unwrap();
        assert_eq!(b, Blocker::ClosedDay { date: date(2), day_of_week: 0 });
        assert!(b.reason().contains("Sunday"));
        assert!(matches!(b.into_error(), EngineError::InvalidArgument(_)));
    }

    #[test]
    fn end_instant_day_is_walked() {
        // Closed on Sunday; window Saturday 00:00 to Sunday 00:00 ends on Sunday.
        let week: Vec<WeeklySlot> =
            open_week().into_iter().filter(|s| s.day_of_week != 0).collect();
        assert_eq!(
            find_blocker(&days(1, 2), &[], &[], &week),
            Some(Blocker::ClosedDay { date: date(2), day_of_week: 0 })
        );
    }

    #[test]
    fn blocking_override_on_end_day_counts() {
        let blocked = [window_override(4, 4, false)];
        let b = find_blocker(&days(2, 4), &[], &blocked, &open_week());
        assert!(matches!(b, Some(Blocker::BlockedByOwner { .. })));
    }

    #[test]
    fn available_override_opens_closed_weekday() {
        let week: Vec<WeeklySlot> =
            open_week().into_iter().filter(|s| s.day_of_week != 0).collect();
        let opened = [window_override(2, 2, true)];
        assert_eq!(find_blocker(&days(1, 4), &[], &opened, &week), None);
    }

    #[test]
    fn disabled_weekday_blocks_hourly_window() {
        let mut week = open_week();
        week[3].is_available = false; // Wednesday
        let wednesday = day_start(date(5));
        let span = Span::new(wednesday + 9 * HOUR_MS, wednesday + 11 * HOUR_MS);
        assert!(matches!(
            find_blocker(&span, &[], &[], &week),
            Some(Blocker::ClosedDay { day_of_week: 3, .. })
        ));
    }

    #[test]
    fn check_result_carries_conflicts() {
        let existing = [held(days(1, 5), ReservationStatus::Confirmed)];
        let blocker = find_blocker(&days(4, 6), &existing, &[], &open_week());
        let check = AvailabilityCheck::from(blocker.as_ref());
        assert!(!check.is_available);
        assert_eq!(check.conflicts, existing.to_vec());

        let free = AvailabilityCheck::from(None::<&Blocker>);
        assert!(free.is_available && free.reason.is_none());
    }

    #[test]
    fn span_validation() {
        let start = day_start(date(1));
        assert!(validate_span(&Span { start, end: start }).is_err());
        assert!(validate_span(&Span::new(start, start + 367 * DAY_MS)).is_err());
        assert!(validate_span(&Span::new(0, 1_000)).is_err());
        assert!(validate_span(&Span::new(start, start + DAY_MS)).is_ok());
    }
}
