//! In-process fast store.
//!
//! `MemoryStore` implements [`KvStore`], [`ScriptStore`] and [`StreamStore`]
//! over a single mutex-guarded state, so the admission script runs with no
//! interleaving and the stream append inside it is part of the same atomic
//! step. This is the single-writer variant of the fast store: suitable for a
//! single-process deployment and for tests. State lives only as long as the
//! process; deployments with more than one process use `RedisStore`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flashsale_core::{
    EntryId, QueueEntry, QueueFields, ReadOffset, StoreError, StoreResult, FIELD_ORDER_ID,
    FIELD_USER_ID, FIELD_VOUCHER_ID,
};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::kv::KvStore;
use crate::script::{
    AdmissionArgs, AdmissionKeys, ScriptStore, CODE_ADMITTED, CODE_DUPLICATE, CODE_SOLD_OUT,
};
use crate::stream::StreamStore;

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: Option<EntryId>,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: BTreeMap<EntryId, QueueFields>,
    last_id: Option<EntryId>,
    groups: HashMap<String, GroupState>,
}

impl StreamLog {
    fn append(&mut self, fields: QueueFields) -> EntryId {
        let now_millis = Utc::now().timestamp_millis().max(1) as u64;
        let id = match self.last_id {
            Some(last) => last.next_after(now_millis),
            None => EntryId::new(now_millis, 0),
        };
        self.entries.insert(id, fields);
        self.last_id = Some(id);
        id
    }

    fn group_mut(&mut self, stream_key: &str, group: &str) -> StoreResult<&mut GroupState> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| StoreError::NoSuchGroup {
                stream: stream_key.to_string(),
                group: group.to_string(),
            })
    }

    fn deliver_next(
        &mut self,
        stream_key: &str,
        group: &str,
        consumer: &str,
    ) -> StoreResult<Option<QueueEntry>> {
        self.group_mut(stream_key, group)?;
        let StreamLog {
            entries, groups, ..
        } = self;
        let Some(state) = groups.get_mut(group) else {
            return Ok(None);
        };
        let lower = match state.last_delivered {
            Some(last) => Bound::Excluded(last),
            None => Bound::Unbounded,
        };
        let Some((id, fields)) = entries.range((lower, Bound::Unbounded)).next() else {
            return Ok(None);
        };
        state.last_delivered = Some(*id);
        state.pending.insert(
            *id,
            PendingEntry {
                consumer: consumer.to_string(),
                delivery_count: 1,
            },
        );
        Ok(Some(QueueEntry {
            stream_key: stream_key.to_string(),
            id: *id,
            fields: fields.clone(),
            delivery_count: 1,
        }))
    }

    fn deliver_pending(
        &mut self,
        stream_key: &str,
        group: &str,
        consumer: &str,
    ) -> StoreResult<Option<QueueEntry>> {
        self.group_mut(stream_key, group)?;
        let StreamLog {
            entries, groups, ..
        } = self;
        let Some(state) = groups.get_mut(group) else {
            return Ok(None);
        };
        let Some((id, pending)) = state
            .pending
            .iter_mut()
            .find(|(_, pending)| pending.consumer == consumer)
        else {
            return Ok(None);
        };
        pending.delivery_count += 1;
        Ok(Some(QueueEntry {
            stream_key: stream_key.to_string(),
            id: *id,
            fields: entries.get(id).cloned().unwrap_or_default(),
            delivery_count: pending.delivery_count,
        }))
    }
}

#[derive(Debug, Default)]
struct StoreState {
    strings: HashMap<String, StringEntry>,
    sets: HashMap<String, HashSet<String>>,
    streams: HashMap<String, StreamLog>,
}

impl StoreState {
    fn live_string(&mut self, key: &str, now: Instant) -> Option<&mut StringEntry> {
        let live = self.strings.get(key).map(|e| e.is_live(now))?;
        if !live {
            self.strings.remove(key);
            return None;
        }
        self.strings.get_mut(key)
    }
}

/// Single-writer in-memory implementation of the fast store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    appended: Notify,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "memory store is offline".to_string(),
            });
        }
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Remaining TTL of a string key, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        let mut state = self.state()?;
        Ok(state
            .live_string(key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    /// Members of a set key, sorted.
    pub fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let state = self.state()?;
        let mut members: Vec<String> = state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    /// Number of entries ever appended to a stream.
    pub fn stream_len(&self, stream_key: &str) -> StoreResult<usize> {
        let state = self.state()?;
        Ok(state
            .streams
            .get(stream_key)
            .map(|log| log.entries.len())
            .unwrap_or(0))
    }

    /// All entries of a stream in id order.
    pub fn stream_entries(&self, stream_key: &str) -> StoreResult<Vec<(EntryId, QueueFields)>> {
        let state = self.state()?;
        Ok(state
            .streams
            .get(stream_key)
            .map(|log| {
                log.entries
                    .iter()
                    .map(|(id, fields)| (*id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn expiry(ttl: Option<Duration>, now: Instant) -> Option<Instant> {
    ttl.map(|ttl| now + ttl)
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let mut state = self.state()?;
        Ok(state.live_string(key, now).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        let mut state = self.state()?;
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: expiry(ttl, now),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut state = self.state()?;
        if state.live_string(key, now).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: expiry(ttl, now),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut state = self.state()?;
        let had_string = state.live_string(key, now).is_some();
        state.strings.remove(key);
        let had_set = state.sets.remove(key).is_some();
        let had_stream = state.streams.remove(key).is_some();
        Ok(had_string || had_set || had_stream)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut state = self.state()?;
        let matches = state
            .live_string(key, now)
            .map_or(false, |e| e.value == expected);
        if matches {
            state.strings.remove(key);
        }
        Ok(matches)
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let now = Instant::now();
        let mut state = self.state()?;
        match state.live_string(key, now) {
            Some(entry) => {
                let current: i64 = entry.value.parse().map_err(|_| StoreError::WrongType {
                    key: key.to_string(),
                    reason: "value is not an integer".to_string(),
                })?;
                let next = current.checked_add(1).ok_or_else(|| StoreError::WrongType {
                    key: key.to_string(),
                    reason: "increment would overflow".to_string(),
                })?;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                state.strings.insert(
                    key.to_string(),
                    StringEntry {
                        value: "1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn eval_admission(
        &self,
        keys: &AdmissionKeys,
        args: &AdmissionArgs,
    ) -> StoreResult<i64> {
        let now = Instant::now();
        let user = args.user_id.to_string();
        {
            let mut state = self.state()?;

            let stock = match state.live_string(&keys.stock_key, now) {
                Some(entry) => entry.value.parse::<i64>().map_err(|_| StoreError::WrongType {
                    key: keys.stock_key.clone(),
                    reason: "stock is not an integer".to_string(),
                })?,
                None => return Ok(CODE_SOLD_OUT),
            };
            if stock <= 0 {
                return Ok(CODE_SOLD_OUT);
            }
            if state
                .sets
                .get(&keys.order_set_key)
                .map_or(false, |members| members.contains(&user))
            {
                return Ok(CODE_DUPLICATE);
            }

            if let Some(entry) = state.live_string(&keys.stock_key, now) {
                entry.value = (stock - 1).to_string();
            }
            state
                .sets
                .entry(keys.order_set_key.clone())
                .or_default()
                .insert(user.clone());

            let mut fields = QueueFields::new();
            fields.insert(FIELD_USER_ID.to_string(), user);
            fields.insert(FIELD_VOUCHER_ID.to_string(), args.voucher_id.to_string());
            fields.insert(FIELD_ORDER_ID.to_string(), args.order_id.to_string());
            state
                .streams
                .entry(keys.stream_key.clone())
                .or_default()
                .append(fields);
        }
        self.appended.notify_waiters();
        Ok(CODE_ADMITTED)
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn create_group(&self, stream_key: &str, group: &str) -> StoreResult<()> {
        let mut state = self.state()?;
        state
            .streams
            .entry(stream_key.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn append(&self, stream_key: &str, fields: &QueueFields) -> StoreResult<EntryId> {
        let id = {
            let mut state = self.state()?;
            state
                .streams
                .entry(stream_key.to_string())
                .or_default()
                .append(fields.clone())
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        offset: ReadOffset,
        block: Duration,
    ) -> StoreResult<Option<QueueEntry>> {
        let no_group = || StoreError::NoSuchGroup {
            stream: stream_key.to_string(),
            group: group.to_string(),
        };

        if offset == ReadOffset::Pending {
            let mut state = self.state()?;
            let log = state.streams.get_mut(stream_key).ok_or_else(no_group)?;
            return log.deliver_pending(stream_key, group, consumer);
        }

        let deadline = Instant::now() + block;
        loop {
            // Registered before the check so an append in between still wakes us.
            let notified = self.appended.notified();
            {
                let mut state = self.state()?;
                let log = state.streams.get_mut(stream_key).ok_or_else(no_group)?;
                if let Some(entry) = log.deliver_next(stream_key, group, consumer)? {
                    return Ok(Some(entry));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, stream_key: &str, group: &str, id: EntryId) -> StoreResult<bool> {
        let mut state = self.state()?;
        let Some(log) = state.streams.get_mut(stream_key) else {
            return Ok(false);
        };
        let group = log.group_mut(stream_key, group)?;
        Ok(group.pending.remove(&id).is_some())
    }

    async fn pending_count(&self, stream_key: &str, group: &str) -> StoreResult<u64> {
        let mut state = self.state()?;
        let Some(log) = state.streams.get_mut(stream_key) else {
            return Ok(0);
        };
        let group = log.group_mut(stream_key, group)?;
        Ok(group.pending.len() as u64)
    }
}
