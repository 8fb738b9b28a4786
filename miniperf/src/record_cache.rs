use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use miniperf_record::Record;

struct CacheItem {
    time: u64,
    is_sample: bool,
    seq: u64,
    record: Record,
}

impl CacheItem {
    // Total order: earlier time first; at equal time a non-sample record
    // precedes a sample so map/comm changes are applied before the sample
    // that depends on them; arrival order breaks the remaining ties.
    fn key(&self) -> (u64, bool, u64) {
        (self.time, self.is_sample, self.seq)
    }
}

impl PartialEq for CacheItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for CacheItem {}

impl Ord for CacheItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the smallest key first.
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for CacheItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reorders records arriving from per-CPU ring buffers into a stable total
/// order.
///
/// The kernel may deliver records out of global time order across buffers.
/// Records are held until the cache is deeper than `min_cache_size` *and*
/// the oldest record is at least `min_time_diff_ns` older than the newest
/// timestamp seen, which tolerates bounded skew. Records whose skew exceeds
/// the watermark emerge out of order; that loss is accepted.
pub struct RecordCache {
    has_timestamp: bool,
    min_cache_size: usize,
    min_time_diff_ns: u64,
    max_seen_time: u64,
    next_seq: u64,
    heap: BinaryHeap<CacheItem>,
    fifo: VecDeque<Record>,
}

impl RecordCache {
    pub fn new(has_timestamp: bool, min_cache_size: usize, min_time_diff_ns: u64) -> Self {
        RecordCache {
            has_timestamp,
            min_cache_size,
            min_time_diff_ns,
            max_seen_time: 0,
            next_seq: 0,
            heap: BinaryHeap::new(),
            fifo: VecDeque::new(),
        }
    }

    pub fn push(&mut self, record: Record) {
        if !self.has_timestamp {
            self.fifo.push_back(record);
            return;
        }
        let time = record.timestamp();
        self.max_seen_time = self.max_seen_time.max(time);
        self.heap.push(CacheItem {
            time,
            is_sample: record.is_sample(),
            seq: self.next_seq,
            record,
        });
        self.next_seq += 1;
    }

    /// Take the oldest record if the watermark allows releasing it.
    pub fn pop(&mut self) -> Option<Record> {
        if !self.has_timestamp {
            return self.fifo.pop_front();
        }
        if self.heap.len() < self.min_cache_size {
            return None;
        }
        let watermark = self.max_seen_time.saturating_sub(self.min_time_diff_ns);
        if self.heap.peek()?.time > watermark {
            return None;
        }
        self.heap.pop().map(|item| item.record)
    }

    /// Release everything still cached, in order. Used at the end of a run.
    pub fn drain(&mut self) -> Vec<Record> {
        if !self.has_timestamp {
            return self.fifo.drain(..).collect();
        }
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(item) = self.heap.pop() {
            out.push(item.record);
        }
        out
    }

    pub fn len(&self) -> usize {
        if self.has_timestamp {
            self.heap.len()
        } else {
            self.fifo.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniperf_record::{CommRecord, MmapRecord, SampleId, SampleRecord};

    fn mmap_at(time: u64) -> Record {
        Record::Mmap(MmapRecord {
            sample_id: SampleId {
                time,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn comm_at(time: u64) -> Record {
        Record::Comm(CommRecord {
            sample_id: SampleId {
                time,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn sample_at(time: u64) -> Record {
        Record::Sample(SampleRecord {
            time,
            ..Default::default()
        })
    }

    #[test]
    fn watermark_orders_equal_timestamps() {
        let mut cache = RecordCache::new(true, 2, 50);
        cache.push(mmap_at(100));
        cache.push(sample_at(100));
        cache.push(comm_at(100));
        cache.push(sample_at(150));

        let mut order = Vec::new();
        while let Some(record) = cache.pop() {
            order.push((record.timestamp(), record.is_sample()));
        }
        // Sample@150 stays behind the watermark until drain.
        assert_eq!(order, vec![(100, false), (100, false), (100, true)]);
        let rest = cache.drain();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].timestamp(), 150);
    }

    #[test]
    fn pop_respects_cache_floor() {
        let mut cache = RecordCache::new(true, 4, 0);
        cache.push(sample_at(1));
        cache.push(sample_at(2));
        cache.push(sample_at(3));
        assert!(cache.pop().is_none());
        cache.push(sample_at(4));
        assert_eq!(cache.pop().unwrap().timestamp(), 1);
    }

    #[test]
    fn drained_sequence_is_time_sorted() {
        let mut cache = RecordCache::new(true, 0, 0);
        for time in [5u64, 3, 9, 1, 7, 3] {
            cache.push(sample_at(time));
        }
        let times: Vec<u64> = cache.drain().iter().map(|r| r.timestamp()).collect();
        assert_eq!(times, vec![1, 3, 3, 5, 7, 9]);
    }

    #[test]
    fn arrival_order_breaks_ties_within_kind() {
        let mut cache = RecordCache::new(true, 0, 0);
        cache.push(comm_at(10));
        cache.push(mmap_at(10));
        let drained = cache.drain();
        assert!(matches!(drained[0], Record::Comm(_)));
        assert!(matches!(drained[1], Record::Mmap(_)));
    }

    #[test]
    fn no_timestamp_passes_through() {
        let mut cache = RecordCache::new(false, 10, 1000);
        cache.push(sample_at(9));
        cache.push(sample_at(1));
        assert_eq!(cache.pop().unwrap().timestamp(), 9);
        assert_eq!(cache.pop().unwrap().timestamp(), 1);
        assert!(cache.pop().is_none());
    }
}
