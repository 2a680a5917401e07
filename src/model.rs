use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Stay length in nights.
pub type Nights = u32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("unknown entry status: {0}")]
    UnknownStatus(String),
    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),
    #[error("invalid rate: {0} (must be >= 0 minor units)")]
    InvalidRate(i64),
}

// ── Channels & status ────────────────────────────────────────────

/// A distribution source: an OTA or the direct booking path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    Direct,
    Airbnb,
    Booking,
    Expedia,
    Agoda,
    Vrbo,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Direct,
        Channel::Airbnb,
        Channel::Booking,
        Channel::Expedia,
        Channel::Agoda,
        Channel::Vrbo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Direct => "direct",
            Channel::Airbnb => "airbnb",
            Channel::Booking => "booking",
            Channel::Expedia => "expedia",
            Channel::Agoda => "agoda",
            Channel::Vrbo => "vrbo",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Channel::Direct),
            "airbnb" => Ok(Channel::Airbnb),
            "booking" | "booking.com" => Ok(Channel::Booking),
            "expedia" => Ok(Channel::Expedia),
            "agoda" => Ok(Channel::Agoda),
            "vrbo" => Ok(Channel::Vrbo),
            _ => Err(ModelError::UnknownChannel(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    Open,
    Closed,
    Maintenance,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Open => "OPEN",
            EntryStatus::Closed => "CLOSED",
            EntryStatus::Maintenance => "MAINTENANCE",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Ok(EntryStatus::Open),
            "CLOSED" => Ok(EntryStatus::Closed),
            "MAINTENANCE" => Ok(EntryStatus::Maintenance),
            _ => Err(ModelError::UnknownStatus(s.to_string())),
        }
    }
}

// ── Money ────────────────────────────────────────────────────────

/// ISO-4217 alphabetic code, always three uppercase ASCII letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency([u8; 3]);

impl Currency {
    pub fn new(code: &str) -> Result<Self, ModelError> {
        let bytes = code.trim().as_bytes();
        match bytes {
            [a, b, c] if bytes.iter().all(u8::is_ascii_alphabetic) => Ok(Self([
                a.to_ascii_uppercase(),
                b.to_ascii_uppercase(),
                c.to_ascii_uppercase(),
            ])),
            _ => Err(ModelError::InvalidCurrency(code.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nightly price in minor units (cents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    pub amount_minor: i64,
    pub currency: Currency,
}

impl Rate {
    pub fn new(amount_minor: i64, currency: Currency) -> Result<Self, ModelError> {
        if amount_minor < 0 {
            return Err(ModelError::InvalidRate(amount_minor));
        }
        Ok(Self { amount_minor, currency })
    }
}

// ── Keys ─────────────────────────────────────────────────────────

/// One room type of one property; the scope of a stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomTypeKey {
    pub property_id: Ulid,
    pub room_type_id: Ulid,
}

impl RoomTypeKey {
    pub fn new(property_id: Ulid, room_type_id: Ulid) -> Self {
        Self { property_id, room_type_id }
    }

    pub fn on(&self, date: NaiveDate) -> EntryKey {
        EntryKey {
            property_id: self.property_id,
            room_type_id: self.room_type_id,
            date,
        }
    }
}

/// Unique identity of a ledger entry. Ordering is (property, room type, date),
/// which is the global lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    pub property_id: Ulid,
    pub room_type_id: Ulid,
    pub date: NaiveDate,
}

impl EntryKey {
    pub fn new(property_id: Ulid, room_type_id: Ulid, date: NaiveDate) -> Self {
        Self { property_id, room_type_id, date }
    }

    pub fn room(&self) -> RoomTypeKey {
        RoomTypeKey::new(self.property_id, self.room_type_id)
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.property_id, self.room_type_id, self.date)
    }
}

// ── Entry contents ───────────────────────────────────────────────

/// One consumed unit on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: Ulid,
    pub channel: Channel,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Permissible stay length, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayRestrictions {
    pub min_stay: Nights,
    pub max_stay: Nights,
}

impl StayRestrictions {
    pub const DEFAULT_MAX_STAY: Nights = 30;

    pub fn allows(&self, nights: Nights) -> bool {
        self.min_stay <= nights && nights <= self.max_stay
    }

    pub fn is_valid(&self) -> bool {
        self.min_stay >= 1 && self.min_stay <= self.max_stay
    }
}

impl Default for StayRestrictions {
    fn default() -> Self {
        Self {
            min_stay: 1,
            max_stay: Self::DEFAULT_MAX_STAY,
        }
    }
}

/// What an entry is opened with. Doubles as the room-type master data
/// (default capacity, base rate) consulted by bulk provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySpec {
    pub total_capacity: u32,
    pub base_rate: Rate,
    pub rates: BTreeMap<Channel, Rate>,
    pub restrictions: StayRestrictions,
}

impl EntrySpec {
    pub fn new(total_capacity: u32, base_rate: Rate) -> Self {
        Self {
            total_capacity,
            base_rate,
            rates: BTreeMap::new(),
            restrictions: StayRestrictions::default(),
        }
    }

    pub fn with_rate(mut self, channel: Channel, rate: Rate) -> Self {
        self.rates.insert(channel, rate);
        self
    }

    pub fn with_restrictions(mut self, min_stay: Nights, max_stay: Nights) -> Self {
        self.restrictions = StayRestrictions { min_stay, max_stay };
        self
    }
}

/// The per (property, room type, date) capacity record.
///
/// Fields are private: every change goes through the ledger, which holds the
/// entry's write lock. `available_units` is derived on every read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    key: EntryKey,
    total_capacity: u32,
    occupancy: Vec<Reservation>,
    blocked_units: u32,
    base_rate: Rate,
    rates: BTreeMap<Channel, Rate>,
    restrictions: StayRestrictions,
    status: EntryStatus,
    closed_channels: BTreeSet<Channel>,
    /// Set once the entry has been pruned or its opening rolled back. A task
    /// that was waiting on the lock must not act on a retired entry.
    retired: bool,
}

impl LedgerEntry {
    pub(crate) fn open(key: EntryKey, spec: EntrySpec) -> Self {
        Self {
            key,
            total_capacity: spec.total_capacity,
            occupancy: Vec::new(),
            blocked_units: 0,
            base_rate: spec.base_rate,
            rates: spec.rates,
            restrictions: spec.restrictions,
            status: EntryStatus::Open,
            closed_channels: BTreeSet::new(),
            retired: false,
        }
    }

    pub fn key(&self) -> EntryKey {
        self.key
    }

    pub fn date(&self) -> NaiveDate {
        self.key.date
    }

    pub fn total_capacity(&self) -> u32 {
        self.total_capacity
    }

    pub fn blocked_units(&self) -> u32 {
        self.blocked_units
    }

    pub fn occupancy(&self) -> &[Reservation] {
        &self.occupancy
    }

    pub fn occupied_units(&self) -> u32 {
        self.occupancy.len() as u32
    }

    /// `total_capacity − occupied − blocked`, clamped at zero.
    pub fn available_units(&self) -> u32 {
        self.total_capacity
            .saturating_sub(self.occupied_units())
            .saturating_sub(self.blocked_units)
    }

    /// Commitments exceed physical capacity. Only reachable by lowering
    /// capacity or blocking units after reservations were admitted.
    pub fn overcommitted(&self) -> bool {
        self.occupied_units() as u64 + self.blocked_units as u64 > self.total_capacity as u64
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn restrictions(&self) -> StayRestrictions {
        self.restrictions
    }

    pub fn base_rate(&self) -> Rate {
        self.base_rate
    }

    pub fn rates(&self) -> &BTreeMap<Channel, Rate> {
        &self.rates
    }

    /// Channel-specific rate, falling back to the base rate.
    pub fn rate_for(&self, channel: Channel) -> Rate {
        self.rates.get(&channel).copied().unwrap_or(self.base_rate)
    }

    pub fn closed_channels(&self) -> &BTreeSet<Channel> {
        &self.closed_channels
    }

    pub fn is_channel_closed(&self, channel: Channel) -> bool {
        self.closed_channels.contains(&channel)
    }

    pub fn holds(&self, reservation_id: Ulid) -> bool {
        self.occupancy.iter().any(|r| r.reservation_id == reservation_id)
    }

    /// Occupied units per channel. Every channel reads the same
    /// `available_units`; this is only the audit breakdown.
    pub fn occupancy_by_channel(&self) -> BTreeMap<Channel, u32> {
        let mut counts = BTreeMap::new();
        for r in &self.occupancy {
            *counts.entry(r.channel).or_insert(0) += 1;
        }
        counts
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    // ── Raw mutators (caller holds the write lock) ───────────────

    pub(crate) fn push_reservation(&mut self, reservation: Reservation) {
        self.occupancy.push(reservation);
    }

    pub(crate) fn remove_reservation(&mut self, reservation_id: Ulid) -> Option<Reservation> {
        let pos = self
            .occupancy
            .iter()
            .position(|r| r.reservation_id == reservation_id)?;
        Some(self.occupancy.remove(pos))
    }

    pub(crate) fn set_total_capacity(&mut self, total_capacity: u32) {
        self.total_capacity = total_capacity;
    }

    pub(crate) fn set_blocked_units(&mut self, blocked_units: u32) {
        self.blocked_units = blocked_units;
    }

    pub(crate) fn set_status(&mut self, status: EntryStatus) {
        self.status = status;
    }

    pub(crate) fn close_channel(&mut self, channel: Channel) {
        self.closed_channels.insert(channel);
    }

    pub(crate) fn reopen_channel(&mut self, channel: Channel) {
        self.closed_channels.remove(&channel);
    }

    pub(crate) fn set_rate(&mut self, channel: Channel, rate: Rate) {
        self.rates.insert(channel, rate);
    }

    pub(crate) fn set_restrictions(&mut self, restrictions: StayRestrictions) {
        self.restrictions = restrictions;
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    /// The spec this entry would be reopened with during WAL compaction.
    pub(crate) fn current_spec(&self) -> EntrySpec {
        EntrySpec {
            total_capacity: self.total_capacity,
            base_rate: self.base_rate,
            rates: self.rates.clone(),
            restrictions: self.restrictions,
        }
    }
}

/// One event per ledger mutation. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    EntryOpened {
        key: EntryKey,
        spec: EntrySpec,
    },
    Reserved {
        key: EntryKey,
        reservation: Reservation,
    },
    Released {
        key: EntryKey,
        reservation_id: Ulid,
    },
    /// A whole stay admitted at once: one reservation per night.
    StayReserved {
        room: RoomTypeKey,
        nights: Vec<NaiveDate>,
        reservation: Reservation,
    },
    StayReleased {
        room: RoomTypeKey,
        nights: Vec<NaiveDate>,
        reservation_id: Ulid,
    },
    CapacityAdjusted {
        key: EntryKey,
        total_capacity: u32,
    },
    BlockedSet {
        key: EntryKey,
        blocked_units: u32,
    },
    StatusSet {
        key: EntryKey,
        status: EntryStatus,
    },
    ChannelClosed {
        key: EntryKey,
        channel: Channel,
    },
    ChannelReopened {
        key: EntryKey,
        channel: Channel,
    },
    RateSet {
        key: EntryKey,
        channel: Channel,
        rate: Rate,
    },
    RestrictionsSet {
        key: EntryKey,
        restrictions: StayRestrictions,
    },
    EntryPruned {
        key: EntryKey,
    },
}

impl Event {
    /// Every entry the event touches, ascending.
    pub fn keys(&self) -> Vec<EntryKey> {
        match self {
            Event::StayReserved { room, nights, .. } | Event::StayReleased { room, nights, .. } => {
                nights.iter().map(|d| room.on(*d)).collect()
            }
            Event::EntryOpened { key, .. }
            | Event::Reserved { key, .. }
            | Event::Released { key, .. }
            | Event::CapacityAdjusted { key, .. }
            | Event::BlockedSet { key, .. }
            | Event::StatusSet { key, .. }
            | Event::ChannelClosed { key, .. }
            | Event::ChannelReopened { key, .. }
            | Event::RateSet { key, .. }
            | Event::RestrictionsSet { key, .. }
            | Event::EntryPruned { key } => vec![*key],
        }
    }

    pub fn room(&self) -> RoomTypeKey {
        match self {
            Event::StayReserved { room, .. } | Event::StayReleased { room, .. } => *room,
            Event::EntryOpened { key, .. }
            | Event::Reserved { key, .. }
            | Event::Released { key, .. }
            | Event::CapacityAdjusted { key, .. }
            | Event::BlockedSet { key, .. }
            | Event::StatusSet { key, .. }
            | Event::ChannelClosed { key, .. }
            | Event::ChannelReopened { key, .. }
            | Event::RateSet { key, .. }
            | Event::RestrictionsSet { key, .. }
            | Event::EntryPruned { key } => key.room(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn usd(amount_minor: i64) -> Rate {
        Rate::new(amount_minor, Currency::new("USD").unwrap()).unwrap()
    }

    pub(crate) fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    pub(crate) fn reservation(channel: Channel) -> Reservation {
        Reservation {
            reservation_id: Ulid::new(),
            channel,
            label: None,
            created_at: Utc::now(),
        }
    }

    fn entry(total_capacity: u32) -> LedgerEntry {
        let key = EntryKey::new(Ulid::new(), Ulid::new(), date("2025-11-15"));
        LedgerEntry::open(key, EntrySpec::new(total_capacity, usd(10_000)))
    }

    #[test]
    fn channel_parse_is_case_insensitive() {
        assert_eq!("Airbnb".parse::<Channel>().unwrap(), Channel::Airbnb);
        assert_eq!("booking.com".parse::<Channel>().unwrap(), Channel::Booking);
        assert_eq!(" DIRECT ".parse::<Channel>().unwrap(), Channel::Direct);
        assert!(matches!(
            "hostelworld".parse::<Channel>(),
            Err(ModelError::UnknownChannel(_))
        ));
        for ch in Channel::ALL {
            assert_eq!(ch.as_str().parse::<Channel>().unwrap(), ch);
        }
    }

    #[test]
    fn status_parse() {
        assert_eq!("maintenance".parse::<EntryStatus>().unwrap(), EntryStatus::Maintenance);
        assert_eq!(EntryStatus::Closed.to_string(), "CLOSED");
        assert!("paused".parse::<EntryStatus>().is_err());
    }

    #[test]
    fn currency_validation() {
        assert_eq!(Currency::new("eur").unwrap().as_str(), "EUR");
        assert!(Currency::new("EURO").is_err());
        assert!(Currency::new("E1R").is_err());
        assert!(Currency::new("").is_err());
    }

    #[test]
    fn negative_rate_rejected() {
        let usd = Currency::new("USD").unwrap();
        assert_eq!(Rate::new(-1, usd), Err(ModelError::InvalidRate(-1)));
        assert!(Rate::new(0, usd).is_ok());
    }

    #[test]
    fn available_units_is_derived() {
        let mut e = entry(4);
        assert_eq!(e.available_units(), 4);
        e.push_reservation(reservation(Channel::Airbnb));
        e.push_reservation(reservation(Channel::Booking));
        e.set_blocked_units(1);
        assert_eq!(e.available_units(), 1);
        assert!(!e.overcommitted());
    }

    #[test]
    fn available_units_clamps_when_overcommitted() {
        let mut e = entry(3);
        for _ in 0..3 {
            e.push_reservation(reservation(Channel::Direct));
        }
        e.set_total_capacity(1);
        assert_eq!(e.available_units(), 0);
        assert!(e.overcommitted());

        e.set_total_capacity(3);
        e.set_blocked_units(u32::MAX);
        assert_eq!(e.available_units(), 0);
    }

    #[test]
    fn remove_reservation_by_id() {
        let mut e = entry(2);
        let a = reservation(Channel::Airbnb);
        let b = reservation(Channel::Expedia);
        e.push_reservation(a.clone());
        e.push_reservation(b.clone());
        assert_eq!(e.remove_reservation(a.reservation_id), Some(a.clone()));
        assert!(e.remove_reservation(a.reservation_id).is_none());
        assert_eq!(e.occupancy(), &[b]);
    }

    #[test]
    fn rate_falls_back_to_base() {
        let key = EntryKey::new(Ulid::new(), Ulid::new(), date("2025-11-15"));
        let spec = EntrySpec::new(2, usd(10_000)).with_rate(Channel::Airbnb, usd(12_500));
        let e = LedgerEntry::open(key, spec);
        assert_eq!(e.rate_for(Channel::Airbnb), usd(12_500));
        assert_eq!(e.rate_for(Channel::Direct), usd(10_000));
    }

    #[test]
    fn occupancy_breakdown_by_channel() {
        let mut e = entry(4);
        e.push_reservation(reservation(Channel::Airbnb));
        e.push_reservation(reservation(Channel::Booking));
        e.push_reservation(reservation(Channel::Booking));
        let counts = e.occupancy_by_channel();
        assert_eq!(counts.get(&Channel::Airbnb), Some(&1));
        assert_eq!(counts.get(&Channel::Booking), Some(&2));
        assert_eq!(counts.get(&Channel::Direct), None);
    }

    #[test]
    fn restrictions_bounds() {
        let r = StayRestrictions { min_stay: 2, max_stay: 5 };
        assert!(!r.allows(1));
        assert!(r.allows(2));
        assert!(r.allows(5));
        assert!(!r.allows(6));
        assert!(r.is_valid());
        assert!(!StayRestrictions { min_stay: 0, max_stay: 5 }.is_valid());
        assert!(!StayRestrictions { min_stay: 6, max_stay: 5 }.is_valid());
    }

    #[test]
    fn stay_event_keys_cover_every_night() {
        let room = RoomTypeKey::new(Ulid::new(), Ulid::new());
        let nights = vec![date("2025-11-15"), date("2025-11-16"), date("2025-11-17")];
        let event = Event::StayReserved {
            room,
            nights: nights.clone(),
            reservation: reservation(Channel::Direct),
        };
        let keys = event.keys();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[2], room.on(nights[2]));
        assert_eq!(event.room(), room);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let key = EntryKey::new(Ulid::new(), Ulid::new(), date("2026-01-31"));
        let event = Event::EntryOpened {
            key,
            spec: EntrySpec::new(5, usd(9_900)).with_rate(Channel::Vrbo, usd(11_000)),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
