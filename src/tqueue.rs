// src/tqueue.rs
//
// Durable per-bot FIFO of update events.
//
// ─ Model ────────────────────────────────────────────────────────────────────
//
//   queue_id (i64)  ──>  ordered events with strictly increasing int32 ids
//
//   Each event carries an absolute expiry time and an opaque `extra` value
//   (the conversation id used by webhook dispatch).  Expired events are
//   never returned and are reclaimed by the incremental garbage collector.
//
// ─ Durability ───────────────────────────────────────────────────────────────
//
//   Every push and forget appends a record to the binlog; startup replays
//   the log to reconstruct the exact pre-shutdown state (modulo events that
//   expired in between).  Records that fail to decode are dropped
//   individually with a warning.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::binlog::Binlog;

pub const MAX_EVENT_ID: i32 = 1 << 30;
pub const MAX_PAYLOAD_SIZE: usize = 65536;

/// Queues scanned per `run_gc` call; keeps each call short.
const GC_QUEUES_PER_RUN: usize = 32;

// ─── EventId ────────────────────────────────────────────────────────────────

/// Identifier of one queued event.  Valid ids lie in `[1, 2^30)`; the zero
/// value is the "empty" sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(i32);

impl EventId {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(value: i32) -> Option<Self> {
        if (1..MAX_EVENT_ID).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn value(self) -> i32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn next(self) -> Option<Self> {
        Self::new(self.0 + 1)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub expires_at: i32,
    pub extra: i64,
    pub payload: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TQueueError {
    #[error("event payload is too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("queue has exhausted its event ids")]
    QueueFull,
}

#[derive(Serialize, Deserialize)]
enum LogRecord {
    Push {
        queue_id: i64,
        id: i32,
        expires_at: i32,
        extra: i64,
        payload: String,
    },
    Forget {
        queue_id: i64,
        id: i32,
    },
}

// ─── Queue state ────────────────────────────────────────────────────────────

struct QueueState {
    /// Next id to assign.
    tail: i32,
    events: VecDeque<Event>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            tail: 1,
            events: VecDeque::new(),
        }
    }

    fn head(&self) -> i32 {
        self.events.front().map(|e| e.id.value()).unwrap_or(self.tail)
    }
}

struct Inner {
    queues: BTreeMap<i64, QueueState>,
    /// Next queue to visit in the incremental GC walk; None = start over.
    gc_cursor: Option<i64>,
}

/// The queue store.  All operations are synchronous and never block on I/O;
/// log appends are handed to the binlog writer thread.
pub struct TQueue {
    inner: Mutex<Inner>,
    log: Mutex<Option<Binlog>>,
}

impl TQueue {
    pub fn new(log: Option<Binlog>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: BTreeMap::new(),
                gc_cursor: None,
            }),
            log: Mutex::new(log),
        }
    }

    /// Build a queue store from replayed binlog records.  Individually
    /// undecodable records are dropped with a warning.
    pub fn with_replay(log: Option<Binlog>, records: &[Vec<u8>]) -> Self {
        let tqueue = Self::new(None);
        let mut loaded = 0usize;
        let mut failed = 0usize;
        {
            let mut inner = tqueue.inner.lock().unwrap();
            for record in records {
                match serde_json::from_slice::<LogRecord>(record) {
                    Ok(LogRecord::Push {
                        queue_id,
                        id,
                        expires_at,
                        extra,
                        payload,
                    }) => {
                        let Some(id) = EventId::new(id) else {
                            failed += 1;
                            warn!(queue_id, id, "dropping push record with invalid event id");
                            continue;
                        };
                        let queue = inner.queues.entry(queue_id).or_insert_with(QueueState::new);
                        if id.value() < queue.tail {
                            failed += 1;
                            warn!(queue_id, id = id.value(), "dropping out-of-order push record");
                            continue;
                        }
                        queue.tail = id.value() + 1;
                        queue.events.push_back(Event {
                            id,
                            expires_at,
                            extra,
                            payload,
                        });
                        loaded += 1;
                    }
                    Ok(LogRecord::Forget { queue_id, id }) => {
                        if let Some(queue) = inner.queues.get_mut(&queue_id) {
                            if let Some(pos) = queue.events.iter().position(|e| e.id.value() == id)
                            {
                                queue.events.remove(pos);
                            }
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        warn!(error = %e, "dropping undecodable queue log record");
                    }
                }
            }
        }
        if failed > 0 {
            warn!(failed, "failed to replay some queue log records");
        }
        info!(loaded, "replayed queue events");
        *tqueue.log.lock().unwrap() = log;
        tqueue
    }

    fn append_log(&self, record: &LogRecord) {
        if let Some(log) = self.log.lock().unwrap().as_ref() {
            match serde_json::to_vec(record) {
                Ok(bytes) => {
                    if let Err(e) = log.append(bytes) {
                        warn!(error = %e, "failed to append queue log record");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode queue log record"),
            }
        }
    }

    /// Append one event; returns its id.
    pub fn push(
        &self,
        queue_id: i64,
        payload: String,
        expires_at: i32,
        extra: i64,
    ) -> Result<EventId, TQueueError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TQueueError::PayloadTooLarge(payload.len()));
        }
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let queue = inner.queues.entry(queue_id).or_insert_with(QueueState::new);
            let Some(id) = EventId::new(queue.tail) else {
                return Err(TQueueError::QueueFull);
            };
            queue.tail += 1;
            queue.events.push_back(Event {
                id,
                expires_at,
                extra,
                payload: payload.clone(),
            });
            id
        };
        self.append_log(&LogRecord::Push {
            queue_id,
            id: id.value(),
            expires_at,
            extra,
            payload,
        });
        Ok(id)
    }

    /// Copy up to `limit` non-expired events with `id >= from_id` into `out`
    /// and return the total number of non-expired events available from that
    /// position (callers detect backlog beyond the buffer).
    ///
    /// A `from_id` older than the queue head is advanced to the head.  With
    /// `forget_before`, events preceding `from_id` are acknowledged and
    /// removed first.
    pub fn get(
        &self,
        queue_id: i64,
        from_id: EventId,
        forget_before: bool,
        now: i32,
        limit: usize,
        out: &mut Vec<Event>,
    ) -> usize {
        out.clear();
        let mut forgotten = Vec::new();
        let total = {
            let mut inner = self.inner.lock().unwrap();
            let Some(queue) = inner.queues.get_mut(&queue_id) else {
                return 0;
            };

            if forget_before {
                while let Some(front) = queue.events.front() {
                    if front.id < from_id {
                        forgotten.push(front.id);
                        queue.events.pop_front();
                    } else {
                        break;
                    }
                }
            }

            let effective_from = from_id.value().max(queue.head());
            let mut total = 0usize;
            for event in &queue.events {
                if event.id.value() < effective_from || event.expires_at <= now {
                    continue;
                }
                if out.len() < limit {
                    out.push(event.clone());
                }
                total += 1;
            }
            total
        };
        for id in forgotten {
            self.append_log(&LogRecord::Forget {
                queue_id,
                id: id.value(),
            });
        }
        total
    }

    /// Id of the first stored event, or the next id to be assigned when the
    /// queue is empty.  Empty sentinel when the queue does not exist.
    pub fn head(&self, queue_id: i64) -> EventId {
        let inner = self.inner.lock().unwrap();
        match inner.queues.get(&queue_id) {
            Some(queue) => EventId(queue.head()),
            None => EventId::empty(),
        }
    }

    /// The next id to be assigned.  Empty sentinel when the queue does not
    /// exist.
    pub fn tail(&self, queue_id: i64) -> EventId {
        let inner = self.inner.lock().unwrap();
        match inner.queues.get(&queue_id) {
            Some(queue) => EventId(queue.tail),
            None => EventId::empty(),
        }
    }

    /// Acknowledge one event.
    pub fn forget(&self, queue_id: i64, id: EventId) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            match inner.queues.get_mut(&queue_id) {
                Some(queue) => queue
                    .events
                    .iter()
                    .position(|e| e.id == id)
                    .map(|pos| {
                        queue.events.remove(pos);
                    })
                    .is_some(),
                None => false,
            }
        };
        if removed {
            self.append_log(&LogRecord::Forget {
                queue_id,
                id: id.value(),
            });
        }
    }

    /// Drop every pending event of a queue; returns the number removed.
    pub fn clear(&self, queue_id: i64) -> usize {
        let removed: Vec<EventId> = {
            let mut inner = self.inner.lock().unwrap();
            match inner.queues.get_mut(&queue_id) {
                Some(queue) => queue.events.drain(..).map(|e| e.id).collect(),
                None => Vec::new(),
            }
        };
        for id in &removed {
            self.append_log(&LogRecord::Forget {
                queue_id,
                id: id.value(),
            });
        }
        removed.len()
    }

    /// One increment of the expiry walk.  Returns `(deleted, finished)`;
    /// the caller reschedules at 60 s when finished, 1 s otherwise.
    pub fn run_gc(&self, now: i32) -> (u64, bool) {
        let mut tombstones = Vec::new();
        let finished = {
            let mut inner = self.inner.lock().unwrap();
            let start = inner.gc_cursor;
            let mut visited = 0usize;
            let mut last = None;
            let range: Vec<i64> = match start {
                Some(cursor) => inner
                    .queues
                    .range((Bound::Excluded(cursor), Bound::Unbounded))
                    .map(|(&id, _)| id)
                    .take(GC_QUEUES_PER_RUN)
                    .collect(),
                None => inner
                    .queues
                    .keys()
                    .copied()
                    .take(GC_QUEUES_PER_RUN)
                    .collect(),
            };
            for queue_id in range {
                let queue = inner.queues.get_mut(&queue_id).unwrap();
                queue.events.retain(|event| {
                    if event.expires_at <= now {
                        tombstones.push((queue_id, event.id));
                        false
                    } else {
                        true
                    }
                });
                visited += 1;
                last = Some(queue_id);
            }
            if visited < GC_QUEUES_PER_RUN {
                inner.gc_cursor = None;
                true
            } else {
                inner.gc_cursor = last;
                false
            }
        };
        let deleted = tombstones.len() as u64;
        for (queue_id, id) in tombstones {
            self.append_log(&LogRecord::Forget {
                queue_id,
                id: id.value(),
            });
        }
        (deleted, finished)
    }

    /// Flush and close the backing log.
    pub fn close(&self) {
        if let Some(log) = self.log.lock().unwrap().take() {
            log.close();
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const NEVER: i32 = i32::MAX;

    fn drain(tqueue: &TQueue, queue_id: i64, now: i32) -> Vec<i32> {
        let mut out = Vec::new();
        tqueue.get(queue_id, EventId::new(1).unwrap(), false, now, 100, &mut out);
        out.iter().map(|e| e.id.value()).collect()
    }

    #[test]
    fn push_order_is_preserved() {
        let tqueue = TQueue::new(None);
        for i in 0..5 {
            let id = tqueue.push(7, format!("e{i}"), NEVER, 0).unwrap();
            assert_eq!(id.value(), i + 1);
        }
        assert_eq!(drain(&tqueue, 7, 0), vec![1, 2, 3, 4, 5]);
        assert_eq!(tqueue.head(7).value(), 1);
        assert_eq!(tqueue.tail(7).value(), 6);
    }

    #[test]
    fn forget_removes_event() {
        let tqueue = TQueue::new(None);
        for i in 0..3 {
            tqueue.push(1, format!("e{i}"), NEVER, 0).unwrap();
        }
        tqueue.forget(1, EventId::new(2).unwrap());
        assert_eq!(drain(&tqueue, 1, 0), vec![1, 3]);
        // Forgetting the head advances it.
        tqueue.forget(1, EventId::new(1).unwrap());
        assert_eq!(tqueue.head(1).value(), 3);
    }

    #[test]
    fn expired_events_are_never_returned() {
        let tqueue = TQueue::new(None);
        tqueue.push(1, "old".to_string(), 100, 0).unwrap();
        tqueue.push(1, "new".to_string(), 200, 0).unwrap();
        assert_eq!(drain(&tqueue, 1, 150), vec![2]);
        // Exactly at the expiry boundary counts as expired.
        assert_eq!(drain(&tqueue, 1, 200), Vec::<i32>::new());
    }

    #[test]
    fn gc_reclaims_expired_events() {
        let tqueue = TQueue::new(None);
        tqueue.push(1, "old".to_string(), 100, 0).unwrap();
        tqueue.push(1, "new".to_string(), NEVER, 0).unwrap();
        tqueue.push(2, "old".to_string(), 100, 0).unwrap();

        let (deleted, finished) = tqueue.run_gc(150);
        assert_eq!(deleted, 2);
        assert!(finished);
        assert_eq!(drain(&tqueue, 1, 0), vec![2]);
        assert_eq!(drain(&tqueue, 2, 0), Vec::<i32>::new());
    }

    #[test]
    fn get_reports_backlog_beyond_buffer() {
        let tqueue = TQueue::new(None);
        for i in 0..10 {
            tqueue.push(1, format!("e{i}"), NEVER, 0).unwrap();
        }
        let mut out = Vec::new();
        let total = tqueue.get(1, EventId::new(1).unwrap(), false, 0, 3, &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(total, 10);
    }

    #[test]
    fn stale_from_id_advances_to_head() {
        let tqueue = TQueue::new(None);
        for i in 0..3 {
            tqueue.push(1, format!("e{i}"), NEVER, 0).unwrap();
        }
        tqueue.forget(1, EventId::new(1).unwrap());

        let mut out = Vec::new();
        let total = tqueue.get(1, EventId::new(1).unwrap(), false, 0, 10, &mut out);
        assert_eq!(total, 2);
        assert_eq!(out[0].id.value(), 2);
    }

    #[test]
    fn forget_before_acknowledges_prefix() {
        let tqueue = TQueue::new(None);
        for i in 0..5 {
            tqueue.push(1, format!("e{i}"), NEVER, 0).unwrap();
        }
        let mut out = Vec::new();
        let total = tqueue.get(1, EventId::new(4).unwrap(), true, 0, 10, &mut out);
        assert_eq!(total, 2);
        assert_eq!(tqueue.head(1).value(), 4);
    }

    #[test]
    fn payload_size_is_capped() {
        let tqueue = TQueue::new(None);
        let oversized = "x".repeat(MAX_PAYLOAD_SIZE + 1);
        match tqueue.push(1, oversized, NEVER, 0) {
            Err(TQueueError::PayloadTooLarge(_)) => {}
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn extra_is_carried_through() {
        let tqueue = TQueue::new(None);
        tqueue.push(1, "e".to_string(), NEVER, 42).unwrap();
        let mut out = Vec::new();
        tqueue.get(1, EventId::new(1).unwrap(), false, 0, 10, &mut out);
        assert_eq!(out[0].extra, 42);
    }

    #[test]
    fn durability_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tqueue.binlog");

        {
            let (log, records) = Binlog::open(&path).unwrap();
            let tqueue = TQueue::with_replay(Some(log), &records);
            tqueue.push(1, "a".to_string(), NEVER, 10).unwrap();
            tqueue.push(1, "b".to_string(), NEVER, 10).unwrap();
            tqueue.push(2, "c".to_string(), NEVER, 0).unwrap();
            tqueue.forget(1, EventId::new(1).unwrap());
            tqueue.close();
        }

        let (log, records) = Binlog::open(&path).unwrap();
        let tqueue = TQueue::with_replay(Some(log), &records);
        assert_eq!(drain(&tqueue, 1, 0), vec![2]);
        assert_eq!(drain(&tqueue, 2, 0), vec![1]);
        // Ids keep increasing after restart.
        let id = tqueue.push(1, "d".to_string(), NEVER, 0).unwrap();
        assert_eq!(id.value(), 3);
        tqueue.close();
    }

    #[test]
    fn replay_skips_bad_records() {
        let records = vec![
            serde_json::to_vec(&LogRecord::Push {
                queue_id: 1,
                id: 1,
                expires_at: NEVER,
                extra: 0,
                payload: "good".to_string(),
            })
            .unwrap(),
            b"garbage".to_vec(),
            serde_json::to_vec(&LogRecord::Push {
                queue_id: 1,
                id: 2,
                expires_at: NEVER,
                extra: 0,
                payload: "also good".to_string(),
            })
            .unwrap(),
        ];
        let tqueue = TQueue::with_replay(None, &records);
        assert_eq!(drain(&tqueue, 1, 0), vec![1, 2]);
    }

    #[test]
    fn clear_drops_everything() {
        let tqueue = TQueue::new(None);
        for i in 0..4 {
            tqueue.push(1, format!("e{i}"), NEVER, 0).unwrap();
        }
        assert_eq!(tqueue.clear(1), 4);
        assert_eq!(drain(&tqueue, 1, 0), Vec::<i32>::new());
        // Tail is unaffected; new pushes continue the sequence.
        assert_eq!(tqueue.push(1, "e".to_string(), NEVER, 0).unwrap().value(), 5);
    }

    #[test]
    fn gc_is_incremental_over_many_queues() {
        let tqueue = TQueue::new(None);
        for queue_id in 0..(GC_QUEUES_PER_RUN as i64 * 2 + 5) {
            tqueue.push(queue_id, "e".to_string(), 100, 0).unwrap();
        }
        let (_, finished) = tqueue.run_gc(200);
        assert!(!finished);
        let (_, finished) = tqueue.run_gc(200);
        assert!(!finished);
        let (_, finished) = tqueue.run_gc(200);
        assert!(finished);
        for queue_id in 0..(GC_QUEUES_PER_RUN as i64 * 2 + 5) {
            assert_eq!(drain(&tqueue, queue_id, 0), Vec::<i32>::new());
        }
    }
}
