use crate::model::Ms;

pub const DAY_MS: Ms = 86_400_000;
pub const HOUR_MS: Ms = 3_600_000;

/// Hard cap on the span of an availability report, in days.
pub const MAX_AVAILABILITY_WINDOW_DAYS: i64 = 90;
/// Window length used when the caller omits one or both bounds.
pub const DEFAULT_AVAILABILITY_WINDOW_DAYS: i64 = 30;

// 2000-01-01T00:00:00 .. 2200-01-01T00:00:00
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_RENTAL_DURATION_MS: Ms = 366 * DAY_MS;

pub const MAX_RESERVATIONS_PER_PRODUCT: usize = 100_000;
pub const MAX_OVERRIDES_PER_PRODUCT: usize = 1_000;
pub const MAX_PRODUCTS: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;

/// Longest accepted request line on the wire, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
