use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{EntryKey, Event, RoomTypeKey};

const CHANNEL_CAPACITY: usize = 256;

/// One committed change to one entry, with the availability it left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChange {
    pub key: EntryKey,
    pub available_units: u32,
    pub total_capacity: u32,
    pub event: Event,
}

/// Broadcast hub per room type, so channel managers can push the shared
/// availability to every OTA after each commit.
pub struct NotifyHub {
    channels: DashMap<RoomTypeKey, broadcast::Sender<LedgerChange>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes of one room type. Creates the channel if needed.
    pub fn subscribe(&self, room: RoomTypeKey) -> broadcast::Receiver<LedgerChange> {
        let sender = self
            .channels
            .entry(room)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a change. No-op if nobody is listening.
    pub fn send(&self, room: RoomTypeKey, change: LedgerChange) {
        if let Some(sender) = self.channels.get(&room) {
            let _ = sender.send(change);
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune_idle(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::date;
    use ulid::Ulid;

    fn change(room: RoomTypeKey) -> LedgerChange {
        let key = room.on(date("2025-11-15"));
        LedgerChange {
            key,
            available_units: 2,
            total_capacity: 3,
            event: Event::BlockedSet { key, blocked_units: 1 },
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let room = RoomTypeKey::new(Ulid::new(), Ulid::new());
        let mut rx = hub.subscribe(room);

        hub.send(room, change(room));
        assert_eq!(rx.recv().await.unwrap(), change(room));
    }

    #[tokio::test]
    async fn other_rooms_not_delivered() {
        let hub = NotifyHub::new();
        let a = RoomTypeKey::new(Ulid::new(), Ulid::new());
        let b = RoomTypeKey::new(a.property_id, Ulid::new());
        let mut rx = hub.subscribe(a);

        hub.send(b, change(b));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn idle_channels_pruned() {
        let hub = NotifyHub::new();
        let room = RoomTypeKey::new(Ulid::new(), Ulid::new());
        let rx = hub.subscribe(room);
        hub.prune_idle();
        assert_eq!(hub.channel_count(), 1);
        drop(rx);
        hub.prune_idle();
        assert_eq!(hub.channel_count(), 0);
        // Sending with no channel is a no-op.
        hub.send(room, change(room));
    }
}
