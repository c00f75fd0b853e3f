// Queue: priority/TTL-bounded store-and-forward queue
//
// Envelopes waiting to go on air, our own and ones we relay. Ordering is
// (priority ascending, enqueued_at ascending); fast-path entries sit in
// front of everything, newest first. An entry never leaves `dequeue_next`
// once its hop budget or its type's max age is spent.

use crate::config::QueueConfig;
use crate::message::Envelope;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Envelope {0} is already expired")]
    Expired(String),
    #[error("Envelope {0} is already queued")]
    AlreadyQueued(String),
    #[error("Queue full ({0} entries) and nothing less urgent to evict")]
    Full(usize),
    #[error("No queue entry for {0}")]
    NotFound(String),
}

/// An envelope plus its scheduling metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub envelope: Envelope,
    pub priority: u8,
    pub fast_path: bool,
    pub enqueued_at: u64,
    pub attempts: u32,
    pub next_retry_at: u64,
    pub delivered: bool,
    seq: u64,
}

impl QueueEntry {
    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.envelope.is_hop_exhausted()
            || now.saturating_sub(self.enqueued_at) > self.envelope.message_type.max_age_ms()
    }

    pub fn is_ready(&self, now: u64) -> bool {
        self.next_retry_at <= now
    }

    fn order_key(&self) -> OrderKey {
        if self.fast_path {
            OrderKey {
                lane: 0,
                priority: 0,
                enqueued_at: 0,
                seq: u64::MAX - self.seq,
            }
        } else {
            OrderKey {
                lane: 1,
                priority: self.priority,
                enqueued_at: self.enqueued_at,
                seq: self.seq,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    lane: u8,
    priority: u8,
    enqueued_at: u64,
    seq: u64,
}

/// What happened to an entry after a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { attempts: u32, next_retry_at: u64 },
    Dropped { attempts: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub ready: usize,
    pub waiting_retry: usize,
    pub in_flight: usize,
    pub fast_path: usize,
    pub expired_total: u64,
    pub dropped_total: u64,
    pub delivered_total: u64,
    pub evicted_total: u64,
}

/// Persisted form of the queue. In-flight entries go back into the
/// ordered set on restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub entries: Vec<QueueEntry>,
    pub next_seq: u64,
}

pub struct PriorityQueue {
    config: QueueConfig,
    order: BTreeMap<OrderKey, String>,
    entries: HashMap<String, QueueEntry>,
    in_flight: HashMap<String, QueueEntry>,
    next_seq: u64,
    expired_total: u64,
    dropped_total: u64,
    delivered_total: u64,
    evicted_total: u64,
}

impl PriorityQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            order: BTreeMap::new(),
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            next_seq: 0,
            expired_total: 0,
            dropped_total: 0,
            delivered_total: 0,
            evicted_total: 0,
        }
    }

    /// Add an envelope. Fast-path entries go to the head of the queue.
    pub fn enqueue(
        &mut self,
        envelope: Envelope,
        priority: u8,
        fast_path: bool,
        now: u64,
    ) -> Result<(), QueueError> {
        let id = envelope.id.clone();
        if self.entries.contains_key(&id) || self.in_flight.contains_key(&id) {
            return Err(QueueError::AlreadyQueued(id));
        }

        let entry = QueueEntry {
            envelope,
            priority,
            fast_path,
            enqueued_at: now,
            attempts: 0,
            next_retry_at: now,
            delivered: false,
            seq: self.next_seq,
        };
        if entry.is_expired(now) {
            self.expired_total += 1;
            return Err(QueueError::Expired(id));
        }

        if self.len() >= self.config.max_entries {
            self.evict_for(&entry)?;
        }

        self.next_seq += 1;
        self.insert(entry);
        debug!(id = %id, priority, fast_path, "enqueued");
        Ok(())
    }

    fn insert(&mut self, entry: QueueEntry) {
        self.order.insert(entry.order_key(), entry.envelope.id.clone());
        self.entries.insert(entry.envelope.id.clone(), entry);
    }

    fn take(&mut self, id: &str) -> Option<QueueEntry> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.order_key());
        Some(entry)
    }

    // Make room by dropping the least urgent queued entry, if the incoming
    // one outranks it.
    fn evict_for(&mut self, incoming: &QueueEntry) -> Result<(), QueueError> {
        let victim = self
            .order
            .iter()
            .next_back()
            .map(|(key, id)| (*key, id.clone()));

        match victim {
            Some((key, id)) if incoming.order_key() < key => {
                self.take(&id);
                self.evicted_total += 1;
                warn!(id = %id, "queue full, evicted least urgent entry");
                Ok(())
            }
            _ => Err(QueueError::Full(self.config.max_entries)),
        }
    }

    /// Pop the most urgent ready entry, dropping expired ones on the way.
    /// The returned entry stays in flight until marked delivered or failed.
    pub fn dequeue_next(&mut self, now: u64) -> Option<QueueEntry> {
        let mut expired = Vec::new();
        let mut picked = None;

        for id in self.order.values() {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            if entry.is_expired(now) {
                expired.push(id.clone());
            } else if entry.is_ready(now) {
                picked = Some(id.clone());
                break;
            }
        }

        for id in expired {
            self.take(&id);
            self.expired_total += 1;
            debug!(id = %id, "dropped expired queue entry");
        }

        let entry = self.take(&picked?)?;
        self.in_flight.insert(entry.envelope.id.clone(), entry.clone());
        Some(entry)
    }

    pub fn mark_delivered(&mut self, id: &str) -> Result<QueueEntry, QueueError> {
        let mut entry = self
            .in_flight
            .remove(id)
            .or_else(|| self.take(id))
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        entry.delivered = true;
        self.delivered_total += 1;
        Ok(entry)
    }

    /// Record a failed attempt: linear backoff, dropped at the attempt limit.
    pub fn mark_failed(&mut self, id: &str, now: u64) -> Result<FailureOutcome, QueueError> {
        let mut entry = self
            .in_flight
            .remove(id)
            .or_else(|| self.take(id))
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        entry.attempts += 1;
        if entry.attempts >= self.config.max_attempts {
            self.dropped_total += 1;
            warn!(id = %id, attempts = entry.attempts, "dropping entry after repeated send failures");
            return Ok(FailureOutcome::Dropped {
                attempts: entry.attempts,
            });
        }

        entry.next_retry_at = now + entry.attempts as u64 * self.config.retry_backoff_ms;
        let outcome = FailureOutcome::Retrying {
            attempts: entry.attempts,
            next_retry_at: entry.next_retry_at,
        };
        self.insert(entry);
        Ok(outcome)
    }

    /// Drop every expired entry now rather than lazily on dequeue.
    pub fn purge_expired(&mut self, now: u64) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.envelope.id.clone())
            .collect();
        for id in &expired {
            self.take(id);
        }
        self.expired_total += expired.len() as u64;
        expired.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id) || self.in_flight.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&QueueEntry> {
        self.entries.get(id).or_else(|| self.in_flight.get(id))
    }

    /// Queued entries in dequeue order (excludes in-flight).
    pub fn iter_ordered(&self) -> impl Iterator<Item = &QueueEntry> {
        self.order.values().filter_map(|id| self.entries.get(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, now: u64) -> QueueStats {
        let ready = self
            .entries
            .values()
            .filter(|e| e.is_ready(now) && !e.is_expired(now))
            .count();
        let waiting_retry = self.entries.values().filter(|e| !e.is_ready(now)).count();
        let fast_path = self.entries.values().filter(|e| e.fast_path).count();

        QueueStats {
            total: self.len(),
            ready,
            waiting_retry,
            in_flight: self.in_flight.len(),
            fast_path,
            expired_total: self.expired_total,
            dropped_total: self.dropped_total,
            delivered_total: self.delivered_total,
            evicted_total: self.evicted_total,
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut entries: Vec<QueueEntry> = self.iter_ordered().cloned().collect();
        entries.extend(self.in_flight.values().cloned());
        QueueSnapshot {
            entries,
            next_seq: self.next_seq,
        }
    }

    /// Replace contents with a snapshot. Entries over capacity are dropped,
    /// least urgent first.
    pub fn restore(&mut self, snapshot: QueueSnapshot) {
        self.order.clear();
        self.entries.clear();
        self.in_flight.clear();
        self.next_seq = snapshot
            .next_seq
            .max(snapshot.entries.iter().map(|e| e.seq + 1).max().unwrap_or(0));

        let mut entries = snapshot.entries;
        entries.sort_by_key(QueueEntry::order_key);
        entries.truncate(self.config.max_entries);
        for entry in entries {
            if !self.entries.contains_key(entry.id()) {
                self.insert(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EarlyWarningPayload, HelpPayload, Payload, PingPayload};

    fn help(ts: u64) -> Envelope {
        Envelope::new(
            [1u8; 32],
            Payload::Help(HelpPayload {
                under_rubble: false,
                injured: true,
                people_count: 1,
                note: None,
            }),
            ts,
        )
    }

    fn ping(ts: u64) -> Envelope {
        Envelope::new([2u8; 32], Payload::Ping(PingPayload { battery_percent: Some(50) }), ts)
    }

    fn warning(ts: u64) -> Envelope {
        Envelope::new(
            [3u8; 32],
            Payload::EarlyWarning(EarlyWarningPayload {
                magnitude: 5.8,
                depth_km: Some(10.0),
                epicenter: None,
                issued_at: ts,
            }),
            ts,
        )
    }

    fn queue() -> PriorityQueue {
        PriorityQueue::new(QueueConfig::default())
    }

    #[test]
    fn test_orders_by_priority_then_age() {
        let mut q = queue();
        let p1 = ping(0);
        let h1 = help(0);
        let h2 = help(0);
        q.enqueue(p1.clone(), 5, false, 100).unwrap();
        q.enqueue(h1.clone(), 1, false, 200).unwrap();
        q.enqueue(h2.clone(), 1, false, 150).unwrap();

        assert_eq!(q.dequeue_next(1_000).unwrap().id(), h2.id);
        assert_eq!(q.dequeue_next(1_000).unwrap().id(), h1.id);
        assert_eq!(q.dequeue_next(1_000).unwrap().id(), p1.id);
        assert!(q.dequeue_next(1_000).is_none());
    }

    #[test]
    fn test_fast_path_goes_first() {
        let mut q = queue();
        let h = help(0);
        q.enqueue(h.clone(), 0, false, 10).unwrap();
        let w1 = warning(0);
        let w2 = warning(0);
        q.enqueue(w1.clone(), 0, true, 20).unwrap();
        q.enqueue(w2.clone(), 0, true, 30).unwrap();

        // Newest fast-path entry is at the head
        assert_eq!(q.dequeue_next(100).unwrap().id(), w2.id);
        assert_eq!(q.dequeue_next(100).unwrap().id(), w1.id);
        assert_eq!(q.dequeue_next(100).unwrap().id(), h.id);
    }

    #[test]
    fn test_hop_exhausted_never_dequeued() {
        let mut q = queue();
        let mut env = help(0);
        env.ttl = 3;
        env.hop = 3;
        assert_eq!(
            q.enqueue(env.clone(), 1, false, 0),
            Err(QueueError::Expired(env.id.clone()))
        );

        let zero = help(0).with_ttl(0);
        assert!(q.enqueue(zero, 1, false, 0).is_err());
        assert!(q.dequeue_next(0).is_none());
        assert_eq!(q.stats(0).expired_total, 2);
    }

    #[test]
    fn test_max_age_expiry() {
        let mut q = queue();
        let env = ping(0);
        q.enqueue(env, 5, false, 0).unwrap();
        let later = crate::message::MessageType::Ping.max_age_ms() + 1;
        assert!(q.dequeue_next(later).is_none());
        assert!(q.is_empty());
        assert_eq!(q.stats(later).expired_total, 1);
    }

    #[test]
    fn test_retry_backoff_and_bound() {
        let mut q = queue();
        let env = help(0);
        let id = env.id.clone();
        q.enqueue(env, 1, false, 0).unwrap();

        q.dequeue_next(0).unwrap();
        assert_eq!(
            q.mark_failed(&id, 0).unwrap(),
            FailureOutcome::Retrying {
                attempts: 1,
                next_retry_at: 5_000
            }
        );
        assert!(q.dequeue_next(4_999).is_none());

        q.dequeue_next(5_000).unwrap();
        assert_eq!(
            q.mark_failed(&id, 5_000).unwrap(),
            FailureOutcome::Retrying {
                attempts: 2,
                next_retry_at: 15_000
            }
        );

        q.dequeue_next(15_000).unwrap();
        assert_eq!(
            q.mark_failed(&id, 15_000).unwrap(),
            FailureOutcome::Dropped { attempts: 3 }
        );
        assert!(!q.contains(&id));
        assert!(q.dequeue_next(1_000_000).is_none());
        assert_eq!(q.stats(0).dropped_total, 1);
    }

    #[test]
    fn test_mark_delivered_removes() {
        let mut q = queue();
        let env = help(0);
        let id = env.id.clone();
        q.enqueue(env, 1, false, 0).unwrap();
        let entry = q.dequeue_next(0).unwrap();
        assert_eq!(q.stats(0).in_flight, 1);

        let done = q.mark_delivered(entry.id()).unwrap();
        assert!(done.delivered);
        assert!(q.is_empty());
        assert_eq!(q.mark_delivered(&id), Err(QueueError::NotFound(id)));
    }

    #[test]
    fn test_duplicate_enqueue_rejected() {
        let mut q = queue();
        let env = help(0);
        q.enqueue(env.clone(), 1, false, 0).unwrap();
        assert!(matches!(
            q.enqueue(env, 1, false, 0),
            Err(QueueError::AlreadyQueued(_))
        ));
    }

    #[test]
    fn test_capacity_evicts_least_urgent() {
        let mut q = PriorityQueue::new(QueueConfig {
            max_entries: 2,
            ..QueueConfig::default()
        });
        let p = ping(0);
        q.enqueue(p.clone(), 5, false, 0).unwrap();
        q.enqueue(help(0), 1, false, 0).unwrap();

        // A more urgent entry pushes out the ping
        q.enqueue(help(0), 1, false, 1).unwrap();
        assert!(!q.contains(&p.id));
        assert_eq!(q.stats(1).evicted_total, 1);

        // A less urgent one is refused
        assert_eq!(q.enqueue(ping(0), 5, false, 2), Err(QueueError::Full(2)));
    }

    #[test]
    fn test_snapshot_restore_requeues_in_flight() {
        let mut q = queue();
        let a = help(0);
        let b = ping(0);
        q.enqueue(a.clone(), 1, false, 0).unwrap();
        q.enqueue(b.clone(), 5, false, 0).unwrap();
        q.dequeue_next(0).unwrap();

        let snapshot = q.snapshot();
        let mut restored = queue();
        restored.restore(snapshot);

        assert_eq!(restored.len(), 2);
        assert_eq!(restored.stats(0).in_flight, 0);
        assert_eq!(restored.dequeue_next(0).unwrap().id(), a.id);

        // Sequence numbers keep growing after restore
        restored.enqueue(help(0), 1, false, 0).unwrap();
        assert_eq!(restored.len(), 3);
    }

    #[test]
    fn test_stats() {
        let mut q = queue();
        q.enqueue(warning(0), 0, true, 0).unwrap();
        let h = help(0);
        q.enqueue(h.clone(), 1, false, 0).unwrap();
        q.enqueue(ping(0), 5, false, 0).unwrap();

        q.dequeue_next(0).unwrap();
        q.dequeue_next(0).unwrap();
        q.mark_failed(&h.id, 0).unwrap();

        let stats = q.stats(0);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.waiting_retry, 1);
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.fast_path, 0);
    }
}
