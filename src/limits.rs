/// Upper bound on physical units of one room type.
pub const MAX_CAPACITY: u32 = 10_000;

/// Longest stay accepted by `reserve_stay` / `release_stay`, in nights.
pub const MAX_STAY_NIGHTS: u32 = 365;

/// Widest date window a single availability query may cover.
pub const MAX_QUERY_DAYS: u32 = 731;

/// Largest rolling horizon `open_horizon` provisions in one call.
pub const MAX_HORIZON_DAYS: u32 = 731;

pub const MAX_LABEL_LEN: usize = 256;

pub const MAX_ENTRIES: usize = 5_000_000;

/// Reservations held by one entry. Admission is bounded by capacity already;
/// this caps replayed legacy occupancy.
pub const MAX_OCCUPANCY_PER_ENTRY: usize = MAX_CAPACITY as usize;

pub const MAX_IMPORT_RECORDS: usize = 1_000_000;

pub const MAX_BATCH_ROWS: usize = 1_000;
