use crate::model::{Ms, Rank};

/// Rows per tenant. Rank planning is linear in this.
pub const MAX_SLOTS_PER_TENANT: usize = 10_000;

pub const MAX_EVENT_ID_LEN: usize = 128;

/// Largest WAL record replay will allocate for. A compaction snapshot of a
/// full tenant stays well below this.
pub const MAX_COMMIT_BYTES: usize = 64 * 1024 * 1024;

/// User-supplied ranks. Leaves headroom so shifts cannot overflow `i32`.
pub const MIN_RANK: Rank = -1_000_000_000;
pub const MAX_RANK: Rank = 1_000_000_000;

/// 1970-01-01 .. 2200-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
