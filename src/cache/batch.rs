// SPDX-License-Identifier: MPL-2.0

//! Shared batch cache.
//!
//! Architecture:
//! - Entries are keyed by [`CacheKey`] (kind, scope, sorted IDs) and hold one
//!   slot per ID. A read is served from whichever entry holds the newest slot
//!   for each ID, so overlapping requests share entries.
//! - Missing IDs are collected per scope for a short window and fetched with
//!   one bulk call. Requests whose IDs are already covered by a batch in flight
//!   join it instead of starting another (single-flight).
//! - Stale entries are served immediately and revalidated in the background.
//! - Every write is stamped with a monotonic sequence number. A response never
//!   replaces a slot written after its fetch started, nor a slot pinned by a
//!   mutation that has not settled yet.
//! - Only the mutation controller writes through [`BatchCache::patch`],
//!   [`BatchCache::settle`] and [`BatchCache::restore`]. Widgets only read.

use crate::cache::key::{CacheKey, ResourceKind, Scope, canonical_ids};
use crate::lock;
use crate::model::ResourceId;
use crate::remote::{RemoteError, RemoteResult};
use async_trait::async_trait;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Bulk source for one kind of cached data.
#[async_trait]
pub trait BatchFetcher<V>: Send + Sync {
    /// IDs absent from the returned map are cached as `V::default()`.
    async fn fetch(&self, scope: &Scope, ids: &[ResourceId]) -> RemoteResult<HashMap<ResourceId, V>>;
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup<V> {
    pub data: HashMap<ResourceId, V>,
    /// Some requested IDs have no value yet and a fetch is pending
    pub is_loading: bool,
    /// Some values are past their freshness window and being revalidated
    pub is_stale: bool,
}

impl<V> Lookup<V> {
    pub fn get(&self, id: &str) -> Option<&V> {
        self.data.get(id)
    }
}

/// Values a [`BatchCache::patch`] replaced, for rolling back.
#[derive(Debug, Clone)]
pub struct CacheSnapshot<V> {
    scope: Scope,
    resource_id: ResourceId,
    applied_seq: u64,
    previous: Vec<(CacheKey, Slot<V>)>,
}

impl<V> CacheSnapshot<V> {
    /// Number of entries the patch touched.
    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    seq: u64,
    /// Unsettled patches holding this slot
    pins: u32,
}

struct Entry<V> {
    slots: HashMap<ResourceId, Slot<V>>,
    fetched_at: Instant,
    /// Sequence number of the fetch that produced this entry
    seq: u64,
    invalidated: bool,
}

struct Batch {
    scope: Scope,
    ids: BTreeSet<ResourceId>,
    waiters: Vec<oneshot::Sender<RemoteResult<()>>>,
}

impl Batch {
    fn covers(&self, scope: &Scope, ids: &[ResourceId]) -> bool {
        self.scope == *scope && ids.iter().all(|id| self.ids.contains(id))
    }
}

struct Inner<V> {
    entries: HashMap<CacheKey, Entry<V>>,
    /// Batches still accepting IDs, at most one per scope
    collecting: HashMap<Scope, Batch>,
    /// Batches whose fetch has started, by sequence number
    in_flight: HashMap<u64, Batch>,
    /// Sequence number at which each scope was last removed
    retired: HashMap<Scope, u64>,
    next_seq: u64,
}

impl<V> Inner<V> {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

pub struct BatchCache<V> {
    kind: ResourceKind,
    freshness: Duration,
    window: Duration,
    fetcher: Arc<dyn BatchFetcher<V>>,
    inner: Mutex<Inner<V>>,
    revision: watch::Sender<u64>,
}

impl<V> BatchCache<V>
where
    V: Clone + Default + Send + Sync + 'static,
{
    pub fn new(
        kind: ResourceKind,
        freshness: Duration,
        window: Duration,
        fetcher: Arc<dyn BatchFetcher<V>>,
    ) -> Arc<Self> {
        let (revision, _) = watch::channel(0);
        Arc::new(Self {
            kind,
            freshness,
            window,
            fetcher,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                collecting: HashMap::new(),
                in_flight: HashMap::new(),
                retired: HashMap::new(),
                next_seq: 0,
            }),
            revision,
        })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Revision counter bumped whenever cached values change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Read without waiting. Missing or stale IDs are fetched in the background.
    pub fn peek(self: &Arc<Self>, scope: &Scope, ids: &[ResourceId]) -> Lookup<V> {
        let ids = canonical_ids(ids.iter().cloned());
        let (lookup, _) = self.plan(scope, &ids);
        lookup
    }

    /// Read, waiting for a fetch only when some IDs have never been loaded.
    ///
    /// Stale values are returned immediately while a refresh runs.
    pub async fn get(self: &Arc<Self>, scope: &Scope, ids: &[ResourceId]) -> RemoteResult<Lookup<V>> {
        let ids = canonical_ids(ids.iter().cloned());
        let (lookup, waiter) = self.plan(scope, &ids);
        let Some(waiter) = waiter else {
            return Ok(lookup);
        };
        waiter
            .await
            .map_err(|_| RemoteError::Transient("batch fetch abandoned".into()))??;
        let inner = lock(&self.inner);
        let (data, _, stale) = self.resolve(&inner, scope, &ids, Instant::now());
        Ok(Lookup {
            data,
            is_loading: false,
            is_stale: !stale.is_empty(),
        })
    }

    /// Seed values known from elsewhere, such as server-rendered initial data.
    pub fn prime(&self, scope: &Scope, values: HashMap<ResourceId, V>) {
        if values.is_empty() {
            return;
        }
        {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            let seq = inner.bump_seq();
            let key = CacheKey::new(self.kind, scope.clone(), values.keys().cloned());
            let slots = values
                .into_iter()
                .map(|(id, value)| (id, Slot { value, seq, pins: 0 }))
                .collect();
            inner.entries.insert(key, Entry::fresh(slots, seq));
        }
        self.bump_revision();
    }

    /// Replace `id` in every entry of `scope` with `f(old)`.
    ///
    /// The patched slots are pinned: fetches landing before the returned
    /// snapshot is passed to [`settle`](Self::settle) or
    /// [`restore`](Self::restore) leave them alone.
    pub fn patch(&self, scope: &Scope, id: &str, f: impl Fn(&V) -> V) -> CacheSnapshot<V> {
        let snapshot = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            let seq = inner.bump_seq();
            let mut previous = Vec::new();
            for (key, entry) in inner.entries.iter_mut() {
                if key.scope() != scope {
                    continue;
                }
                if let Some(slot) = entry.slots.get_mut(id) {
                    let next = Slot {
                        value: f(&slot.value),
                        seq,
                        pins: slot.pins + 1,
                    };
                    previous.push((key.clone(), std::mem::replace(slot, next)));
                }
            }
            CacheSnapshot {
                scope: scope.clone(),
                resource_id: id.to_string(),
                applied_seq: seq,
                previous,
            }
        };
        if !snapshot.is_empty() {
            self.bump_revision();
        }
        snapshot
    }

    /// Write the authoritative value for a patched ID and release the patch.
    ///
    /// Every entry of the scope holding the ID takes `value`, or a new entry
    /// is created when none does. Nothing is written if the scope was removed
    /// after the patch.
    pub fn settle(&self, snapshot: CacheSnapshot<V>, value: V) {
        {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            if inner
                .retired
                .get(&snapshot.scope)
                .is_some_and(|removed| *removed > snapshot.applied_seq)
            {
                debug!(
                    kind = self.kind.as_str(),
                    resource_id = %snapshot.resource_id,
                    scope = ?snapshot.scope,
                    "scope removed before settlement, dropping result"
                );
                return;
            }

            let seq = inner.bump_seq();
            let release = u32::from(!snapshot.is_empty());
            let mut touched = false;
            for (key, entry) in inner.entries.iter_mut() {
                if key.scope() != &snapshot.scope {
                    continue;
                }
                if let Some(slot) = entry.slots.get_mut(&snapshot.resource_id) {
                    *slot = Slot {
                        value: value.clone(),
                        seq,
                        pins: slot.pins.saturating_sub(release),
                    };
                    touched = true;
                }
            }
            if !touched {
                let key = CacheKey::new(self.kind, snapshot.scope.clone(), [snapshot.resource_id.clone()]);
                let slots = HashMap::from([(snapshot.resource_id, Slot { value, seq, pins: 0 })]);
                inner.entries.insert(key, Entry::fresh(slots, seq));
            }
        }
        self.bump_revision();
    }

    /// Undo a patch and release it. Slots written by anything newer than the
    /// patch keep their value.
    pub fn restore(&self, snapshot: CacheSnapshot<V>) {
        let Some(fallback) = snapshot
            .previous
            .iter()
            .map(|(_, slot)| slot)
            .max_by_key(|slot| slot.seq)
        else {
            return;
        };
        let mut restored = 0;
        {
            let mut inner = lock(&self.inner);
            for (key, entry) in inner.entries.iter_mut() {
                if key.scope() != &snapshot.scope {
                    continue;
                }
                let Some(current) = entry.slots.get_mut(&snapshot.resource_id) else {
                    continue;
                };
                current.pins = current.pins.saturating_sub(1);
                if current.seq == snapshot.applied_seq {
                    // The slot may have moved into an entry created after the patch
                    let previous = snapshot
                        .previous
                        .iter()
                        .find(|(patched, _)| patched == key)
                        .map_or(fallback, |(_, slot)| slot);
                    current.value = previous.value.clone();
                    current.seq = previous.seq;
                    restored += 1;
                }
            }
        }
        debug!(
            kind = self.kind.as_str(),
            resource_id = %snapshot.resource_id,
            scope = ?snapshot.scope,
            restored,
            "rolled back cache patch"
        );
        if restored > 0 {
            self.bump_revision();
        }
    }

    /// Mark every entry holding `id` as stale and refetch it now.
    ///
    /// The refetch always starts a new fetch; one already in flight may have
    /// been issued before whatever made the entry stale.
    pub fn invalidate(self: &Arc<Self>, id: &str) {
        {
            let mut guard = lock(&self.inner);
            let keys: Vec<CacheKey> = guard
                .entries
                .iter_mut()
                .filter(|(key, _)| key.contains(id))
                .map(|(key, entry)| {
                    entry.invalidated = true;
                    key.clone()
                })
                .collect();
            for key in keys {
                self.schedule(&mut guard, key.scope(), key.ids(), None, false);
            }
        }
        self.bump_revision();
    }

    /// Mark every entry stale and refetch them all.
    pub fn invalidate_all(self: &Arc<Self>) {
        {
            let mut guard = lock(&self.inner);
            let keys: Vec<CacheKey> = guard
                .entries
                .iter_mut()
                .map(|(key, entry)| {
                    entry.invalidated = true;
                    key.clone()
                })
                .collect();
            for key in keys {
                self.schedule(&mut guard, key.scope(), key.ids(), None, false);
            }
        }
        self.bump_revision();
    }

    /// Drop everything cached for `scope`, including fetches still in flight.
    pub fn remove_scope(&self, scope: &Scope) {
        {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            inner.entries.retain(|key, _| key.scope() != scope);
            inner.collecting.remove(scope);
            inner.in_flight.retain(|_, batch| batch.scope != *scope);
            let seq = inner.bump_seq();
            inner.retired.insert(scope.clone(), seq);
        }
        self.bump_revision();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn is_stale(&self, entry: &Entry<V>, now: Instant) -> bool {
        entry.invalidated || now.duration_since(entry.fetched_at) >= self.freshness
    }

    /// Newest slot per ID, the IDs nothing holds, and the stale entries consulted.
    fn resolve(
        &self,
        inner: &Inner<V>,
        scope: &Scope,
        ids: &[ResourceId],
        now: Instant,
    ) -> (HashMap<ResourceId, V>, Vec<ResourceId>, Vec<CacheKey>) {
        let mut data = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        let mut stale: Vec<CacheKey> = Vec::new();

        for id in ids {
            let best = inner
                .entries
                .iter()
                .filter(|(key, _)| key.scope() == scope)
                .filter_map(|(key, entry)| entry.slots.get(id).map(|slot| (key, entry, slot)))
                .max_by_key(|(_, _, slot)| slot.seq);

            match best {
                Some((key, entry, slot)) => {
                    data.insert(id.clone(), slot.value.clone());
                    if self.is_stale(entry, now) && !stale.contains(key) {
                        stale.push(key.clone());
                    }
                }
                None => missing.push(id.clone()),
            }
        }
        (data, missing, stale)
    }

    fn plan(
        self: &Arc<Self>,
        scope: &Scope,
        ids: &[ResourceId],
    ) -> (Lookup<V>, Option<oneshot::Receiver<RemoteResult<()>>>) {
        if ids.is_empty() {
            return (
                Lookup {
                    data: HashMap::new(),
                    is_loading: false,
                    is_stale: false,
                },
                None,
            );
        }

        let mut inner = lock(&self.inner);
        let (data, missing, stale) = self.resolve(&inner, scope, ids, Instant::now());

        for key in &stale {
            self.schedule(&mut inner, key.scope(), key.ids(), None, true);
        }

        let waiter = if missing.is_empty() {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            self.schedule(&mut inner, scope, &missing, Some(tx), true);
            Some(rx)
        };

        let lookup = Lookup {
            data,
            is_loading: waiter.is_some(),
            is_stale: !stale.is_empty(),
        };
        (lookup, waiter)
    }

    /// Attach `ids` to a batch: one already in flight that covers them when
    /// `join_in_flight` allows it, or the scope's collecting batch, opening it
    /// (and spawning its leader) if needed.
    fn schedule(
        self: &Arc<Self>,
        inner: &mut Inner<V>,
        scope: &Scope,
        ids: &[ResourceId],
        waiter: Option<oneshot::Sender<RemoteResult<()>>>,
        join_in_flight: bool,
    ) {
        if join_in_flight
            && let Some(batch) = inner
                .in_flight
                .values_mut()
                .find(|batch| batch.covers(scope, ids))
        {
            batch.waiters.extend(waiter);
            return;
        }

        match inner.collecting.entry(scope.clone()) {
            MapEntry::Occupied(mut open) => {
                let batch = open.get_mut();
                batch.ids.extend(ids.iter().cloned());
                batch.waiters.extend(waiter);
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Batch {
                    scope: scope.clone(),
                    ids: ids.iter().cloned().collect(),
                    waiters: waiter.into_iter().collect(),
                });
                let cache = Arc::clone(self);
                let scope = scope.clone();
                tokio::spawn(async move { cache.run_batch(scope).await });
            }
        }
    }

    async fn run_batch(self: Arc<Self>, scope: Scope) {
        if self.window.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.window).await;
        }

        let (seq, ids) = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            let Some(batch) = inner.collecting.remove(&scope) else {
                return;
            };
            let seq = inner.bump_seq();
            let ids: Vec<ResourceId> = batch.ids.iter().cloned().collect();
            inner.in_flight.insert(seq, batch);
            (seq, ids)
        };

        debug!(
            kind = self.kind.as_str(),
            scope = ?scope,
            ids = ids.len(),
            seq,
            "batch fetch started"
        );
        let result = self.fetcher.fetch(&scope, &ids).await;

        let (waiters, outcome) = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            let Some(batch) = inner.in_flight.remove(&seq) else {
                debug!(seq, "batch discarded while in flight");
                return;
            };
            let outcome = match result {
                Ok(values) => {
                    let key = CacheKey::new(self.kind, scope.clone(), ids);
                    self.store(inner, key, values, seq);
                    Ok(())
                }
                Err(e) => {
                    warn!(kind = self.kind.as_str(), error = %e, "batch fetch failed");
                    Err(e)
                }
            };
            (batch.waiters, outcome)
        };

        if outcome.is_ok() {
            self.bump_revision();
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn store(
        &self,
        inner: &mut Inner<V>,
        key: CacheKey,
        mut values: HashMap<ResourceId, V>,
        seq: u64,
    ) {
        let now = Instant::now();

        if let Some(existing) = inner.entries.get(&key)
            && existing.seq > seq
        {
            debug!(key = %key, seq, newer = existing.seq, "discarding stale response");
            return;
        }

        let mut slots: HashMap<ResourceId, Slot<V>> = key
            .ids()
            .iter()
            .map(|id| {
                let value = values.remove(id).unwrap_or_default();
                (id.clone(), Slot { value, seq, pins: 0 })
            })
            .collect();

        // Slots written after this fetch started or still pinned win over the
        // response, and entries this one supersedes hand them over before being dropped.
        let scope = key.scope().clone();
        let superseded: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(other, entry)| {
                other.scope() == &scope && entry.seq <= seq && key.covers(other.ids())
            })
            .map(|(other, _)| other.clone())
            .collect();
        for other in superseded {
            if let Some(entry) = inner.entries.remove(&other) {
                for (id, slot) in entry.slots {
                    if slot.seq > seq || slot.pins > 0 {
                        slots.insert(id, slot);
                    }
                }
            }
        }
        // A slot pinned in an entry kept beside this one stays the only value for its ID
        let pinned: Vec<ResourceId> = inner
            .entries
            .iter()
            .filter(|(other, _)| other.scope() == &scope)
            .flat_map(|(_, entry)| entry.slots.iter())
            .filter(|(id, slot)| slot.pins > 0 && key.contains(id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in pinned {
            if slots.get(&id).is_some_and(|slot| slot.pins == 0) {
                slots.remove(&id);
            }
        }

        inner.entries.insert(
            key,
            Entry {
                slots,
                fetched_at: now,
                seq,
                invalidated: false,
            },
        );
    }
}

impl<V> Entry<V> {
    fn fresh(slots: HashMap<ResourceId, Slot<V>>, seq: u64) -> Self {
        Self {
            slots,
            fetched_at: Instant::now(),
            seq,
            invalidated: false,
        }
    }
}
