//! Generic reusable resource pool with per-table locking and busy/idle
//! tracking. Writers, readers, both metadata flavors and WAL writers are
//! factory specializations of this one shape.
//!
//! `get` and `lock` never block: contention surfaces as
//! `PetrelError::EntryUnavailable` and the caller picks a retry policy, so
//! pools cannot deadlock against each other.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::TableToken;

/// Builds and recycles one resource kind.
pub trait ResourceFactory<T>: Send + Sync {
    fn new_resource(&self, token: &TableToken) -> PetrelResult<T>;

    /// Prepares a pooled resource for reuse (e.g. a reader refreshing its
    /// snapshot). Returning `false` discards the resource.
    fn prepare_reuse(&self, _resource: &mut T, _token: &TableToken) -> bool {
        true
    }
}

/// Observation hook for test harnesses asserting leak-freedom.
pub trait PoolListener: Send + Sync {
    fn on_event(&self, pool: &'static str, event: PoolEvent, token: &TableToken);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Create,
    Get,
    Return,
    Lock,
    Unlock,
    CloseIdle,
    CloseAll,
}

struct SlotSet<T> {
    token: TableToken,
    available: Vec<(T, Instant)>,
    checked_out: usize,
    /// Reasons given by the current holders, oldest first. Surfaces in
    /// `EntryUnavailable` so the blocked caller knows who has the resource.
    out_reasons: Vec<String>,
    lock_reason: Option<String>,
}

pub struct ResourcePool<T: Send + 'static> {
    name: &'static str,
    capacity: usize,
    entries: DashMap<String, Mutex<SlotSet<T>>>,
    factory: Box<dyn ResourceFactory<T>>,
    listener: RwLock<Option<Arc<dyn PoolListener>>>,
}

impl<T: Send + 'static> ResourcePool<T> {
    pub fn new(
        name: &'static str,
        capacity: usize,
        factory: impl ResourceFactory<T> + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            capacity,
            entries: DashMap::new(),
            factory: Box::new(factory),
            listener: RwLock::new(None),
        })
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn PoolListener>>) {
        *self.listener.write() = listener;
    }

    fn notify(&self, event: PoolEvent, token: &TableToken) {
        if let Some(listener) = self.listener.read().as_ref() {
            listener.on_event(self.name, event, token);
        }
    }

    /// Checks a resource out, constructing one when a slot is free. Fails
    /// fast with `EntryUnavailable` when the entry is locked or at capacity.
    pub fn get(self: &Arc<Self>, token: &TableToken, reason: &str) -> PetrelResult<PoolGuard<T>> {
        let entry = self
            .entries
            .entry(token.dir_name().to_string())
            .or_insert_with(|| {
                Mutex::new(SlotSet {
                    token: token.clone(),
                    available: Vec::new(),
                    checked_out: 0,
                    out_reasons: Vec::new(),
                    lock_reason: None,
                })
            });
        let mut slots = entry.lock();
        if let Some(lock_reason) = &slots.lock_reason {
            return Err(PetrelError::entry_unavailable(lock_reason.clone()));
        }
        slots.token = token.clone();

        while let Some((mut resource, _)) = slots.available.pop() {
            if self.factory.prepare_reuse(&mut resource, token) {
                slots.checked_out += 1;
                slots.out_reasons.push(reason.to_string());
                drop(slots);
                drop(entry);
                self.notify(PoolEvent::Get, token);
                return Ok(PoolGuard {
                    pool: Arc::clone(self),
                    token: token.clone(),
                    resource: Some(resource),
                });
            }
            // stale resource, fall through and try the next one
        }

        if slots.checked_out >= self.capacity {
            let holder = slots
                .out_reasons
                .first()
                .cloned()
                .unwrap_or_else(|| format!("busy{}", self.name));
            return Err(PetrelError::entry_unavailable(holder));
        }

        let resource = self.factory.new_resource(token)?;
        slots.checked_out += 1;
        slots.out_reasons.push(reason.to_string());
        drop(slots);
        drop(entry);
        self.notify(PoolEvent::Create, token);
        self.notify(PoolEvent::Get, token);
        Ok(PoolGuard {
            pool: Arc::clone(self),
            token: token.clone(),
            resource: Some(resource),
        })
    }

    fn release(&self, token: &TableToken, resource: T) {
        if let Some(entry) = self.entries.get(token.dir_name()) {
            let mut slots = entry.lock();
            slots.checked_out = slots.checked_out.saturating_sub(1);
            slots.out_reasons.pop();
            // A locked entry takes no returns; the resource closes here so
            // DDL can mutate the files it covered.
            if slots.lock_reason.is_none() {
                slots.available.push((resource, Instant::now()));
            }
        }
        self.notify(PoolEvent::Return, token);
    }

    /// Atomically locks every slot of the token. Returns the blocking
    /// holder's reason when any resource is checked out; `Ok` means the
    /// entry is locked and its idle resources are closed.
    pub fn lock(&self, token: &TableToken, reason: &str) -> Result<(), String> {
        let entry = self
            .entries
            .entry(token.dir_name().to_string())
            .or_insert_with(|| {
                Mutex::new(SlotSet {
                    token: token.clone(),
                    available: Vec::new(),
                    checked_out: 0,
                    out_reasons: Vec::new(),
                    lock_reason: None,
                })
            });
        let mut slots = entry.lock();
        if let Some(existing) = &slots.lock_reason {
            return Err(existing.clone());
        }
        if slots.checked_out > 0 {
            return Err(slots
                .out_reasons
                .first()
                .cloned()
                .unwrap_or_else(|| format!("busy{}", self.name)));
        }
        slots.available.clear();
        slots.lock_reason = Some(reason.to_string());
        drop(slots);
        drop(entry);
        self.notify(PoolEvent::Lock, token);
        Ok(())
    }

    pub fn unlock(&self, token: &TableToken) {
        if let Some(entry) = self.entries.get(token.dir_name()) {
            entry.lock().lock_reason = None;
        }
        self.notify(PoolEvent::Unlock, token);
    }

    /// Closes resources idle longer than `ttl`. True when any slot was
    /// freed, so the maintenance job can report useful work.
    pub fn release_inactive(&self, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut closed = Vec::new();
        for entry in self.entries.iter() {
            let mut slots = entry.lock();
            let before = slots.available.len();
            slots
                .available
                .retain(|(_, since)| now.duration_since(*since) < ttl);
            if slots.available.len() < before {
                closed.push(slots.token.clone());
            }
        }
        for token in &closed {
            self.notify(PoolEvent::CloseIdle, token);
        }
        !closed.is_empty()
    }

    /// Closes all idle resources. True when nothing remained checked out.
    pub fn release_all(&self) -> bool {
        let mut clean = true;
        let mut closed = Vec::new();
        for entry in self.entries.iter() {
            let mut slots = entry.lock();
            if !slots.available.is_empty() {
                slots.available.clear();
                closed.push(slots.token.clone());
            }
            if slots.checked_out > 0 {
                clean = false;
            }
        }
        for token in &closed {
            self.notify(PoolEvent::CloseAll, token);
        }
        clean
    }

    pub fn busy_count(&self) -> usize {
        self.entries.iter().map(|e| e.lock().checked_out).sum()
    }

    /// Drops the token's entry entirely; used after a table directory is
    /// gone.
    pub fn purge(&self, token: &TableToken) {
        self.entries
            .remove_if(token.dir_name(), |_, entry| entry.lock().checked_out == 0);
    }
}

/// Exclusive ownership of a pooled resource; returns it to the pool on
/// drop.
pub struct PoolGuard<T: Send + 'static> {
    pool: Arc<ResourcePool<T>>,
    token: TableToken,
    resource: Option<T>,
}

impl<T: Send + 'static> PoolGuard<T> {
    pub fn token(&self) -> &TableToken {
        &self.token
    }

    /// Detaches the resource from the pool; it will not be recycled.
    pub fn detach(mut self) -> T {
        let resource = self.resource.take().expect("resource present");
        if let Some(entry) = self.pool.entries.get(self.token.dir_name()) {
            let mut slots = entry.lock();
            slots.checked_out = slots.checked_out.saturating_sub(1);
            slots.out_reasons.pop();
        }
        resource
    }
}

impl<T: Send + 'static> std::fmt::Debug for PoolGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").field("token", &self.token).finish()
    }
}

impl<T: Send + 'static> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().expect("resource present")
    }
}

impl<T: Send + 'static> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("resource present")
    }
}

impl<T: Send + 'static> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(&self.token, resource);
        }
    }
}
