//! Hard caps. Everything user-supplied is bounded so a misbehaving client
//! cannot grow the engine without limit.

use crate::model::Ms;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_BOOKINGS: usize = 1_000_000;
pub const MAX_ALLOCATIONS_PER_RESOURCE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTE_LEN: usize = 4_096;
pub const MAX_SERIAL_LEN: usize = 128;
pub const MAX_CATEGORY_LEN: usize = 64;
pub const MAX_TENANT_TAG_LEN: usize = 32;
pub const MAX_EXTRAS_BYTES: usize = 16_384;

/// Per-field cap on learners and facilitators; keeps the combined
/// headcount far from u32 overflow.
pub const MAX_HEADCOUNT: u32 = 10_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// One booking may span at most a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
/// Availability/occupancy queries may cover at most two years.
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * 24 * 3_600_000;
