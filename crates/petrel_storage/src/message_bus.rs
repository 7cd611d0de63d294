//! Bounded multi-producer/single-consumer ring queues carrying WAL-apply
//! notifications and async writer commands.
//!
//! Producers claim a cursor before touching a slot: `next()` returns the
//! claimed sequence, `-1` when the queue is full (the caller must fall back,
//! never drop the signal) or `-2` when a competing producer won the claim
//! and the caller should retry. `done(cursor)` publishes the slot to the
//! consumer.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use petrel_common::types::TableToken;

pub const CURSOR_FULL: i64 = -1;
pub const CURSOR_RETRY: i64 = -2;

/// One entry per committed WAL txn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalTxnNotification {
    pub token: TableToken,
}

/// A serialized ALTER/UPDATE handed to the writer thread when the caller
/// could not acquire the writer directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterCommand {
    pub cmd_type: i32,
    pub correlation_id: i64,
    pub token: TableToken,
    pub sql: String,
}

pub struct RingQueue<T> {
    slots: Box<[Mutex<Option<T>>]>,
    /// Sequence last published into each slot; -1 when never written.
    published: Box<[AtomicI64]>,
    pub_cursor: AtomicI64,
    sub_cursor: AtomicI64,
    capacity: i64,
}

impl<T> RingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            published: (0..capacity).map(|_| AtomicI64::new(-1)).collect(),
            pub_cursor: AtomicI64::new(0),
            sub_cursor: AtomicI64::new(0),
            capacity: capacity as i64,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Claims the next publish cursor. `>= 0` is a claimed slot the caller
    /// must fill and `done()`; `CURSOR_FULL` means no room; `CURSOR_RETRY`
    /// means a competing producer moved the cursor first.
    pub fn next(&self) -> i64 {
        let sub = self.sub_cursor.load(Ordering::Acquire);
        let cur = self.pub_cursor.load(Ordering::Acquire);
        if cur - sub >= self.capacity {
            return CURSOR_FULL;
        }
        match self.pub_cursor.compare_exchange(
            cur,
            cur + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => cur,
            Err(_) => CURSOR_RETRY,
        }
    }

    /// Stores the value into the claimed slot; `done` makes it visible.
    pub fn set(&self, cursor: i64, value: T) {
        let slot = &self.slots[(cursor % self.capacity) as usize];
        *slot.lock() = Some(value);
    }

    /// Releases the claimed cursor to the consumer.
    pub fn done(&self, cursor: i64) {
        self.published[(cursor % self.capacity) as usize].store(cursor, Ordering::Release);
    }

    /// Single-consumer take of the next published entry.
    pub fn try_consume(&self) -> Option<T> {
        let seq = self.sub_cursor.load(Ordering::Acquire);
        let idx = (seq % self.capacity) as usize;
        if self.published[idx].load(Ordering::Acquire) != seq {
            return None;
        }
        let value = self.slots[idx].lock().take();
        self.sub_cursor.store(seq + 1, Ordering::Release);
        value
    }

    pub fn len(&self) -> usize {
        let sub = self.sub_cursor.load(Ordering::Acquire);
        let cur = self.pub_cursor.load(Ordering::Acquire);
        (cur - sub).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MessageBus {
    pub wal_txn_notifications: RingQueue<WalTxnNotification>,
    pub writer_commands: RingQueue<WriterCommand>,
}

impl MessageBus {
    pub fn new(notification_capacity: usize, command_capacity: usize) -> Self {
        Self {
            wal_txn_notifications: RingQueue::new(notification_capacity),
            writer_commands: RingQueue::new(command_capacity),
        }
    }
}

/// Publishes a WAL txn notification, retrying lost claims. On a full queue
/// the signal is never dropped: `unpublished` is bumped so the periodic
/// rescan picks the txn up, and `false` is returned.
pub fn publish_wal_txn(bus: &MessageBus, unpublished: &AtomicI64, token: &TableToken) -> bool {
    loop {
        let cursor = bus.wal_txn_notifications.next();
        if cursor >= 0 {
            bus.wal_txn_notifications.set(
                cursor,
                WalTxnNotification {
                    token: token.clone(),
                },
            );
            bus.wal_txn_notifications.done(cursor);
            return true;
        }
        if cursor == CURSOR_FULL {
            tracing::info!(table = %token, "wal txn notification queue full, deferring to rescan");
            unpublished.fetch_add(1, Ordering::AcqRel);
            return false;
        }
        std::hint::spin_loop();
    }
}
