//! Timestamp-ordered reader/writer lock guarding one resource.
//!
//! The lock never runs anything itself; it only decides who may proceed and
//! hands back the payloads of admitted waiters to the owning queue.
//!
//! Conflicts follow wound-wait: the transaction at the front of the line never
//! waits for a younger holder. [`ReadWriteLock::contention`] names the younger
//! holders in its way, and the queue aborts those that have not prepared.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::transaction::AccessMode;
use crate::types::{Priority, Timestamp, TxnId};

/// Admission order of a waiter: timestamp first, then priority, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitKey {
    pub timestamp: Timestamp,
    pub priority: Priority,
    pub txn: TxnId,
}

#[derive(Debug, Clone, Copy)]
struct Hold {
    mode: AccessMode,
    key: WaitKey,
}

#[derive(Debug)]
struct Waiter<W> {
    mode: AccessMode,
    since: Instant,
    payload: W,
}

#[derive(Debug)]
struct PendingUpgrade<W> {
    txn: TxnId,
    since: Instant,
    payload: W,
}

/// A waiter that has just been admitted.
#[derive(Debug)]
pub struct Granted<W> {
    pub txn: TxnId,
    pub timestamp: Timestamp,
    pub mode: AccessMode,
    pub upgrade: bool,
    pub payload: W,
}

/// Answer to an upgrade request from a read holder.
#[derive(Debug)]
pub enum Upgrade<W> {
    /// Sole holder; the write lock is held now.
    Granted(W),
    /// Other readers still hold the lock; the upgrade waits for them.
    Queued,
    /// Someone else is already upgrading.
    Conflict(W),
}

/// Holders standing in the way of the transaction at the front of the line.
#[derive(Debug, PartialEq, Eq)]
pub struct Contention {
    pub contender: WaitKey,
    /// The contender is a read holder waiting to upgrade.
    pub upgrade: bool,
    /// Conflicting holders that sort after the contender.
    pub younger: Vec<TxnId>,
}

/// Waiter dropped because it waited too long.
#[derive(Debug)]
pub struct Expired<W> {
    pub txn: TxnId,
    pub upgrade: bool,
    pub payload: W,
}

#[derive(Debug)]
pub struct ReadWriteLock<W> {
    holders: HashMap<TxnId, Hold>,
    waiting: BTreeMap<WaitKey, Waiter<W>>,
    index: HashMap<TxnId, WaitKey>,
    upgrade: Option<PendingUpgrade<W>>,
}

impl<W> Default for ReadWriteLock<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> ReadWriteLock<W> {
    pub fn new() -> Self {
        Self {
            holders: HashMap::new(),
            waiting: BTreeMap::new(),
            index: HashMap::new(),
            upgrade: None,
        }
    }

    pub fn holder_mode(&self, txn: TxnId) -> Option<AccessMode> {
        self.holders.get(&txn).map(|hold| hold.mode)
    }

    /// Order `txn` was admitted under.
    pub fn holder_key(&self, txn: TxnId) -> Option<WaitKey> {
        self.holders.get(&txn).map(|hold| hold.key)
    }

    /// Holder currently waiting to upgrade, if any.
    pub fn pending_upgrade(&self) -> Option<WaitKey> {
        let pending = self.upgrade.as_ref()?;
        self.holder_key(pending.txn)
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len() + usize::from(self.upgrade.is_some())
    }

    pub fn is_waiting(&self, txn: TxnId) -> bool {
        self.index.contains_key(&txn) || self.upgrade.as_ref().is_some_and(|u| u.txn == txn)
    }

    pub fn enqueue(&mut self, key: WaitKey, mode: AccessMode, payload: W, now: Instant) {
        self.index.insert(key.txn, key);
        self.waiting.insert(
            key,
            Waiter {
                mode,
                since: now,
                payload,
            },
        );
    }

    /// Ask to turn `txn`'s read lock into a write lock.
    pub fn request_upgrade(&mut self, txn: TxnId, payload: W, now: Instant) -> Upgrade<W> {
        match self.holder_mode(txn) {
            Some(AccessMode::Write) => Upgrade::Granted(payload),
            Some(AccessMode::Read) if self.upgrade.is_some() => Upgrade::Conflict(payload),
            Some(AccessMode::Read) if self.holders.len() == 1 => {
                self.set_mode(txn, AccessMode::Write);
                Upgrade::Granted(payload)
            }
            Some(AccessMode::Read) => {
                self.upgrade = Some(PendingUpgrade {
                    txn,
                    since: now,
                    payload,
                });
                Upgrade::Queued
            }
            None => Upgrade::Conflict(payload),
        }
    }

    /// Drop `txn`'s hold. Returns whether it held the lock.
    pub fn release(&mut self, txn: TxnId) -> bool {
        self.holders.remove(&txn).is_some()
    }

    /// Remove `txn` from the wait queue (or the pending upgrade slot).
    pub fn remove_waiter(&mut self, txn: TxnId) -> Option<W> {
        if let Some(key) = self.index.remove(&txn) {
            return self.waiting.remove(&key).map(|waiter| waiter.payload);
        }
        if self.upgrade.as_ref().is_some_and(|u| u.txn == txn) {
            return self.upgrade.take().map(|u| u.payload);
        }
        None
    }

    /// Hold `key.txn` without queueing; used when restoring prepared writers.
    pub fn install_holder(&mut self, key: WaitKey, mode: AccessMode) {
        self.holders.insert(key.txn, Hold { mode, key });
    }

    fn set_mode(&mut self, txn: TxnId, mode: AccessMode) {
        if let Some(hold) = self.holders.get_mut(&txn) {
            hold.mode = mode;
        }
    }

    /// Younger holders that conflict with the front of the line: the pending
    /// upgrade if there is one, otherwise the first waiter. `None` when
    /// nothing younger is in the way.
    pub fn contention(&self) -> Option<Contention> {
        let (contender, mode, upgrade) = match &self.upgrade {
            Some(pending) => (self.holder_key(pending.txn)?, AccessMode::Write, true),
            None => {
                let (key, waiter) = self.waiting.first_key_value()?;
                (*key, waiter.mode, false)
            }
        };

        let mut younger: Vec<TxnId> = self
            .holders
            .values()
            .filter(|hold| hold.key > contender && hold.key.txn != contender.txn)
            .filter(|hold| mode == AccessMode::Write || hold.mode == AccessMode::Write)
            .map(|hold| hold.key.txn)
            .collect();
        if younger.is_empty() {
            return None;
        }
        younger.sort();
        Some(Contention {
            contender,
            upgrade,
            younger,
        })
    }

    /// Admit every waiter that can run now, in order.
    ///
    /// A pending upgrade goes first and blocks new admissions until it is
    /// granted. Waiters are never skipped: a reader behind a queued writer
    /// keeps waiting even if it would be compatible with the holders.
    pub fn grant(&mut self) -> Vec<Granted<W>> {
        let mut granted = Vec::new();

        if let Some(pending) = &self.upgrade {
            let sole_holder = self.holders.len() == 1 && self.holders.contains_key(&pending.txn);
            if !sole_holder {
                return granted;
            }
            if let Some(pending) = self.upgrade.take() {
                self.set_mode(pending.txn, AccessMode::Write);
                granted.push(Granted {
                    txn: pending.txn,
                    timestamp: 0,
                    mode: AccessMode::Write,
                    upgrade: true,
                    payload: pending.payload,
                });
            }
            return granted;
        }

        while let Some(entry) = self.waiting.first_entry() {
            let mode = entry.get().mode;
            let compatible = match mode {
                AccessMode::Read => self
                    .holders
                    .values()
                    .all(|held| held.mode == AccessMode::Read),
                AccessMode::Write => self.holders.is_empty(),
            };
            if !compatible {
                break;
            }

            let (key, waiter) = entry.remove_entry();
            self.index.remove(&key.txn);
            self.holders.insert(key.txn, Hold { mode, key });
            granted.push(Granted {
                txn: key.txn,
                timestamp: key.timestamp,
                mode,
                upgrade: false,
                payload: waiter.payload,
            });
            if mode == AccessMode::Write {
                break;
            }
        }

        granted
    }

    /// Remove waiters queued for longer than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<Expired<W>> {
        let stale: Vec<WaitKey> = self
            .waiting
            .iter()
            .filter(|(_, waiter)| now.duration_since(waiter.since) >= timeout)
            .map(|(key, _)| *key)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for key in stale {
            self.index.remove(&key.txn);
            if let Some(waiter) = self.waiting.remove(&key) {
                expired.push(Expired {
                    txn: key.txn,
                    upgrade: false,
                    payload: waiter.payload,
                });
            }
        }

        if self
            .upgrade
            .as_ref()
            .is_some_and(|u| now.duration_since(u.since) >= timeout)
            && let Some(pending) = self.upgrade.take()
        {
            expired.push(Expired {
                txn: pending.txn,
                upgrade: true,
                payload: pending.payload,
            });
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(timestamp: Timestamp, seq: u64) -> WaitKey {
        WaitKey {
            timestamp,
            priority: 0,
            txn: TxnId::for_replica(1, seq),
        }
    }

    fn granted_txns(granted: &[Granted<&'static str>]) -> Vec<&'static str> {
        granted.iter().map(|g| g.payload).collect()
    }

    #[test]
    fn waiters_are_admitted_in_timestamp_order_not_arrival_order() {
        let now = Instant::now();
        let mut lock = ReadWriteLock::new();
        lock.enqueue(key(101, 2), AccessMode::Write, "t2", now);
        lock.enqueue(key(100, 1), AccessMode::Write, "t1", now);

        assert_eq!(granted_txns(&lock.grant()), vec!["t1"]);
        assert!(lock.grant().is_empty());

        lock.release(TxnId::for_replica(1, 1));
        assert_eq!(granted_txns(&lock.grant()), vec!["t2"]);
    }

    #[test]
    fn readers_share_until_a_writer_is_next() {
        let now = Instant::now();
        let mut lock = ReadWriteLock::new();
        lock.enqueue(key(1, 1), AccessMode::Read, "r1", now);
        lock.enqueue(key(2, 2), AccessMode::Read, "r2", now);
        lock.enqueue(key(3, 3), AccessMode::Write, "w3", now);
        lock.enqueue(key(4, 4), AccessMode::Read, "r4", now);

        assert_eq!(granted_txns(&lock.grant()), vec!["r1", "r2"]);
        lock.release(TxnId::for_replica(1, 1));
        assert!(lock.grant().is_empty());
        lock.release(TxnId::for_replica(1, 2));
        assert_eq!(granted_txns(&lock.grant()), vec!["w3"]);
    }

    #[test]
    fn second_upgrader_conflicts_and_first_wins_once_alone() {
        let now = Instant::now();
        let mut lock = ReadWriteLock::new();
        lock.enqueue(key(1, 1), AccessMode::Read, "a", now);
        lock.enqueue(key(2, 2), AccessMode::Read, "b", now);
        lock.grant();

        let a = TxnId::for_replica(1, 1);
        let b = TxnId::for_replica(1, 2);
        assert!(matches!(lock.request_upgrade(a, "a-up", now), Upgrade::Queued));
        assert!(matches!(lock.request_upgrade(b, "b-up", now), Upgrade::Conflict("b-up")));

        lock.release(b);
        let granted = lock.grant();
        assert_eq!(granted.len(), 1);
        assert!(granted[0].upgrade);
        assert_eq!(lock.holder_mode(a), Some(AccessMode::Write));
    }

    #[test]
    fn pending_upgrade_blocks_new_readers() {
        let now = Instant::now();
        let mut lock = ReadWriteLock::new();
        lock.enqueue(key(1, 1), AccessMode::Read, "a", now);
        lock.enqueue(key(2, 2), AccessMode::Read, "b", now);
        lock.grant();
        let a = TxnId::for_replica(1, 1);
        assert!(matches!(lock.request_upgrade(a, "a-up", now), Upgrade::Queued));

        lock.enqueue(key(3, 3), AccessMode::Read, "c", now);
        assert!(lock.grant().is_empty());
    }

    #[test]
    fn expire_drops_only_stale_waiters() {
        let start = Instant::now();
        let mut lock = ReadWriteLock::new();
        lock.install_holder(key(9, 9), AccessMode::Write);
        lock.enqueue(key(1, 1), AccessMode::Write, "old", start);
        let later = start + Duration::from_millis(50);
        lock.enqueue(key(2, 2), AccessMode::Write, "new", later);

        let expired = lock.expire(later, Duration::from_millis(40));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].payload, "old");
        assert!(!lock.is_waiting(TxnId::for_replica(1, 1)));
        assert!(lock.is_waiting(TxnId::for_replica(1, 2)));
    }

    #[test]
    fn older_waiter_names_younger_conflicting_holders() {
        let now = Instant::now();
        let mut lock = ReadWriteLock::new();
        lock.enqueue(key(5, 5), AccessMode::Read, "r5", now);
        lock.enqueue(key(6, 6), AccessMode::Read, "r6", now);
        lock.grant();
        assert_eq!(lock.contention(), None);

        // Readers only block writers.
        lock.enqueue(key(3, 3), AccessMode::Read, "r3", now);
        assert_eq!(lock.contention(), None);
        assert_eq!(granted_txns(&lock.grant()), vec!["r3"]);

        lock.enqueue(key(4, 4), AccessMode::Write, "w4", now);
        let contention = lock.contention().expect("w4 is older than r5 and r6");
        assert_eq!(contention.contender, key(4, 4));
        assert!(!contention.upgrade);
        assert_eq!(
            contention.younger,
            vec![TxnId::for_replica(1, 5), TxnId::for_replica(1, 6)]
        );

        lock.release(TxnId::for_replica(1, 5));
        lock.release(TxnId::for_replica(1, 6));
        assert_eq!(lock.contention(), None);
        assert!(lock.grant().is_empty(), "r3 is older and still holds");
        lock.release(TxnId::for_replica(1, 3));
        assert_eq!(granted_txns(&lock.grant()), vec!["w4"]);
    }

    #[test]
    fn pending_upgrade_contends_with_younger_readers_only() {
        let now = Instant::now();
        let mut lock = ReadWriteLock::new();
        lock.enqueue(key(1, 1), AccessMode::Read, "a", now);
        lock.enqueue(key(2, 2), AccessMode::Read, "b", now);
        lock.enqueue(key(3, 3), AccessMode::Read, "c", now);
        lock.grant();

        let b = TxnId::for_replica(1, 2);
        assert!(matches!(lock.request_upgrade(b, "b-up", now), Upgrade::Queued));
        assert_eq!(lock.pending_upgrade(), Some(key(2, 2)));
        let contention = lock.contention().expect("c is younger than the upgrader");
        assert!(contention.upgrade);
        assert_eq!(contention.younger, vec![TxnId::for_replica(1, 3)]);
    }
}
