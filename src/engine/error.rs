use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{Channel, EntryKey, EntryStatus, ModelError, Nights};

/// How a failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected outcome of admission; the booking workflow picks another
    /// room, date or property.
    Business,
    /// Operator or configuration mistake.
    Setup,
    /// The write-ahead log could not be written. Nothing was committed.
    Storage,
}

/// One night of a stay that could not be reserved or released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFailure {
    pub date: NaiveDate,
    pub cause: Box<LedgerError>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("entry already exists: {0}")]
    DuplicateEntry(EntryKey),
    #[error("no inventory provisioned for {0}")]
    NotProvisioned(EntryKey),
    #[error("capacity exhausted on {0}")]
    CapacityExhausted(EntryKey),
    #[error("channel {channel} is closed on {key}")]
    ChannelClosed { key: EntryKey, channel: Channel },
    #[error("entry {key} is {status}, not accepting reservations")]
    EntryNotOpen { key: EntryKey, status: EntryStatus },
    #[error("reservation {reservation_id} not found on {key}")]
    ReservationNotFound { key: EntryKey, reservation_id: Ulid },
    #[error("reservation {reservation_id} already holds a unit on {key}")]
    DuplicateReservation { key: EntryKey, reservation_id: Ulid },
    #[error("{nights}-night stay violates [{min_stay}, {max_stay}] on {date}")]
    StayLengthViolation {
        date: NaiveDate,
        nights: Nights,
        min_stay: Nights,
        max_stay: Nights,
    },
    #[error("invalid capacity {0}: must be at least 1")]
    InvalidCapacity(u32),
    #[error("invalid stay bounds [{min_stay}, {max_stay}]")]
    InvalidStayBounds { min_stay: Nights, max_stay: Nights },
    #[error("invalid stay: check-out {check_out} is not after check-in {check_in}")]
    InvalidStay {
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    #[error("stay rejected on {} night(s): {}", .failures.len(), describe_failures(.failures))]
    CrossDateReservationFailure { failures: Vec<DateFailure> },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

fn describe_failures(failures: &[DateFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.date, f.cause))
        .collect::<Vec<_>>()
        .join(", ")
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::CapacityExhausted(_)
            | LedgerError::ChannelClosed { .. }
            | LedgerError::EntryNotOpen { .. }
            | LedgerError::ReservationNotFound { .. }
            | LedgerError::DuplicateReservation { .. }
            | LedgerError::StayLengthViolation { .. }
            | LedgerError::NotProvisioned(_)
            | LedgerError::CrossDateReservationFailure { .. } => ErrorKind::Business,
            LedgerError::DuplicateEntry(_)
            | LedgerError::InvalidCapacity(_)
            | LedgerError::InvalidStayBounds { .. }
            | LedgerError::InvalidStay { .. }
            | LedgerError::Model(_)
            | LedgerError::LimitExceeded(_) => ErrorKind::Setup,
            LedgerError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// For a rejected stay, the first night that failed and why.
    pub fn first_failure(&self) -> Option<&DateFailure> {
        match self {
            LedgerError::CrossDateReservationFailure { failures } => failures.first(),
            _ => None,
        }
    }

    /// Short stable label for metrics.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::DuplicateEntry(_) => "duplicate_entry",
            LedgerError::NotProvisioned(_) => "not_provisioned",
            LedgerError::CapacityExhausted(_) => "capacity_exhausted",
            LedgerError::ChannelClosed { .. } => "channel_closed",
            LedgerError::EntryNotOpen { .. } => "entry_not_open",
            LedgerError::ReservationNotFound { .. } => "reservation_not_found",
            LedgerError::DuplicateReservation { .. } => "duplicate_reservation",
            LedgerError::StayLengthViolation { .. } => "stay_length_violation",
            LedgerError::InvalidCapacity(_) => "invalid_capacity",
            LedgerError::InvalidStayBounds { .. } => "invalid_stay_bounds",
            LedgerError::InvalidStay { .. } => "invalid_stay",
            LedgerError::CrossDateReservationFailure { .. } => "cross_date_failure",
            LedgerError::Model(_) => "invalid_input",
            LedgerError::LimitExceeded(_) => "limit_exceeded",
            LedgerError::Storage(_) => "storage",
        }
    }
}
