//! Update batching
//!
//! Mutations bound for the same receiver are collected and flushed as one
//! program per receiver. Within a flush window only the latest update per
//! (pointer, property) survives unless intermediate updates are requested.

use std::collections::BTreeMap;
use std::time::Duration;

use datex_core::{DatexResult, Endpoint, PointerId, Timestamp};

use crate::{compile_updates, ChangeKind, PointerChange};

/// Scheduler configuration
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub flush_interval: Duration,
    /// Keep every update of every pointer
    pub intermediate_updates: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            flush_interval: Duration::from_millis(100),
            intermediate_updates: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum UpdateKey {
    Value,
    Property(String),
    Unique(u64),
}

/// Compiled updates for one receiver
#[derive(Clone, Debug)]
pub struct ScheduledBatch {
    pub receiver: Endpoint,
    pub program: Vec<u8>,
    pub changes: usize,
}

type PendingUpdates = BTreeMap<PointerId, Vec<(UpdateKey, PointerChange)>>;

/// Coalesces outbound pointer updates
#[derive(Debug, Default)]
pub struct UpdateScheduler {
    config: SchedulerConfig,
    running: bool,
    last_flush: Timestamp,
    pending: BTreeMap<Endpoint, PendingUpdates>,
    seq: u64,
}

impl UpdateScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        UpdateScheduler {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self, now: Timestamp) {
        self.running = true;
        self.last_flush = now;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Number of updates waiting for the next flush
    pub fn pending_count(&self) -> usize {
        self.pending
            .values()
            .flat_map(|pointers| pointers.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn enqueue(&mut self, receiver: Endpoint, change: PointerChange, intermediate: bool) {
        self.seq += 1;
        let key = if intermediate || self.config.intermediate_updates {
            UpdateKey::Unique(self.seq)
        } else {
            match &change.kind {
                ChangeKind::Replace(_) => UpdateKey::Value,
                ChangeKind::Set { key, .. } | ChangeKind::Delete { key } => match key.key_string() {
                    Some(k) => UpdateKey::Property(k),
                    None => UpdateKey::Unique(self.seq),
                },
                _ => UpdateKey::Unique(self.seq),
            }
        };

        let updates = self
            .pending
            .entry(receiver)
            .or_default()
            .entry(change.pointer)
            .or_default();
        // the latest update moves to the end so it still applies after
        // operations queued in between
        updates.retain(|(k, _)| *k != key);
        updates.push((key, change));
    }

    /// Flush if the interval elapsed
    pub fn trigger(&mut self, now: Timestamp) -> DatexResult<Vec<ScheduledBatch>> {
        if !self.running {
            return Ok(Vec::new());
        }
        let elapsed = now.as_millis().saturating_sub(self.last_flush.as_millis());
        if elapsed < self.config.flush_interval.as_millis() as u64 {
            return Ok(Vec::new());
        }
        self.last_flush = now;
        self.flush()
    }

    /// Compile everything pending, one program per receiver
    pub fn flush(&mut self) -> DatexResult<Vec<ScheduledBatch>> {
        let pending = std::mem::take(&mut self.pending);
        let mut batches = Vec::with_capacity(pending.len());
        for (receiver, pointers) in pending {
            let changes: Vec<PointerChange> = pointers
                .into_values()
                .flat_map(|updates| updates.into_iter().map(|(_, c)| c))
                .collect();
            let program = compile_updates(&changes)?;
            tracing::debug!(receiver = %receiver, changes = changes.len(), "flushing pointer updates");
            batches.push(ScheduledBatch {
                receiver,
                program,
                changes: changes.len(),
            });
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datex_core::Value;

    fn set(key: &str, value: i64) -> PointerChange {
        PointerChange {
            pointer: PointerId::from_bytes([1; 26]),
            kind: ChangeKind::Set {
                key: Value::text(key),
                value: Value::Int(value),
            },
        }
    }

    #[test]
    fn test_coalesces_per_property() {
        let bob = Endpoint::person("bob");
        let mut scheduler = UpdateScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(bob.clone(), set("a", 1), false);
        scheduler.enqueue(bob.clone(), set("b", 1), false);
        scheduler.enqueue(bob.clone(), set("a", 2), false);
        assert_eq!(scheduler.pending_count(), 2);

        let batches = scheduler.flush().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].receiver, bob);
        assert_eq!(batches[0].changes, 2);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_intermediate_updates_kept() {
        let bob = Endpoint::person("bob");
        let mut scheduler = UpdateScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(bob.clone(), set("a", 1), true);
        scheduler.enqueue(bob, set("a", 2), true);
        assert_eq!(scheduler.pending_count(), 2);
    }

    #[test]
    fn test_one_batch_per_receiver() {
        let mut scheduler = UpdateScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(Endpoint::person("bob"), set("a", 1), false);
        scheduler.enqueue(Endpoint::person("carol"), set("a", 1), false);
        assert_eq!(scheduler.flush().unwrap().len(), 2);
    }

    #[test]
    fn test_trigger_respects_interval() {
        let mut scheduler = UpdateScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(Endpoint::person("bob"), set("a", 1), false);
        assert!(scheduler.trigger(Timestamp::from_millis(1000)).unwrap().is_empty());

        scheduler.start(Timestamp::from_millis(1000));
        assert!(scheduler.trigger(Timestamp::from_millis(1050)).unwrap().is_empty());
        assert_eq!(scheduler.trigger(Timestamp::from_millis(1100)).unwrap().len(), 1);

        scheduler.stop();
        assert!(!scheduler.is_running());
    }
}
