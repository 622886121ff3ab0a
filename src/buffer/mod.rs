//! Fixed-capacity rolling event history
//!
//! Holds the most recent `capacity` events in arrival order. Once the buffer
//! has been filled for the first time it is *primed* and stays primed for
//! the rest of its lifetime, even though every later push evicts the oldest
//! event.

use crate::types::EventRecord;
use std::collections::VecDeque;

/// FIFO ring buffer of detector events.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    events: VecDeque<EventRecord>,
    capacity: usize,
    primed: bool,
    /// Total events ever pushed
    pushed: u64,
}

impl RingBuffer {
    /// Create an empty buffer. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            primed: false,
            pushed: 0,
        }
    }

    /// Append an event, evicting the oldest when at capacity.
    ///
    /// Returns the evicted event, if any.
    pub fn push(&mut self, record: EventRecord) -> Option<EventRecord> {
        let evicted = if self.events.len() >= self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(record);
        self.pushed += 1;
        if self.events.len() == self.capacity {
            self.primed = true;
        }
        evicted
    }

    /// True once the buffer has held `capacity` events at least once.
    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// Chronological copy of the current contents.
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.events.iter().cloned().collect()
    }

    /// Read-only view of the contents, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &EventRecord> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_pushed(&self) -> u64 {
        self.pushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn make_event(seq: u64) -> EventRecord {
        EventRecord {
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000 + seq as i64 * 1000).unwrap(),
            sequence: seq,
            detector_event: seq,
            detector_time_ms: seq * 1000,
            adc: 400,
            sipm_mv: 30.0,
            dead_time_ms: 0,
            temperature_c: 20.0,
            interval: (seq > 0).then(|| Duration::from_secs(1)),
        }
    }

    #[test]
    fn test_fifo_keeps_most_recent_in_order() {
        let mut buffer = RingBuffer::new(5);
        for seq in 0..23 {
            buffer.push(make_event(seq));
            let expected_first = (seq + 1).saturating_sub(5);
            let seqs: Vec<u64> = buffer.iter().map(|e| e.sequence).collect();
            let expected: Vec<u64> = (expected_first..=seq).collect();
            assert_eq!(seqs, expected, "after pushing {seq}");
            assert!(buffer.len() <= 5);
        }
        assert_eq!(buffer.total_pushed(), 23);
    }

    #[test]
    fn test_push_returns_evicted_oldest() {
        let mut buffer = RingBuffer::new(2);
        assert!(buffer.push(make_event(0)).is_none());
        assert!(buffer.push(make_event(1)).is_none());
        let evicted = buffer.push(make_event(2)).unwrap();
        assert_eq!(evicted.sequence, 0);
    }

    #[test]
    fn test_primed_is_terminal() {
        let mut buffer = RingBuffer::new(3);
        buffer.push(make_event(0));
        buffer.push(make_event(1));
        assert!(!buffer.is_primed());
        buffer.push(make_event(2));
        assert!(buffer.is_primed());
        for seq in 3..10 {
            buffer.push(make_event(seq));
            assert!(buffer.is_primed());
        }
    }

    #[test]
    fn test_snapshot_is_detached_from_live_buffer() {
        let mut buffer = RingBuffer::new(3);
        for seq in 0..3 {
            buffer.push(make_event(seq));
        }
        let snapshot = buffer.snapshot();
        buffer.push(make_event(3));
        buffer.push(make_event(4));

        let seqs: Vec<u64> = snapshot.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(buffer.iter().last().unwrap().sequence, 4);
    }
}
