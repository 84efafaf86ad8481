//! K-way merge of independently time-sorted record streams into one
//! globally time-ascending sequence.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use tickforge_core::TickRecord;

/// Min-heap entry holding one reader's current head. Ties resolve by
/// reader input order, which also preserves file order within a reader.
struct HeadEntry {
    record: TickRecord,
    reader: usize,
}

impl HeadEntry {
    fn key(&self) -> (DateTime<Utc>, usize) {
        (self.record.time, self.reader)
    }
}

impl PartialEq for HeadEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for HeadEntry {}

impl PartialOrd for HeadEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeadEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, the merge needs the minimum.
        other.key().cmp(&self.key())
    }
}

/// Merges N exhausted-on-demand readers. Primed at construction: every
/// reader contributes its head before the first value is observable, so
/// `Iterator::next` is the advance-then-read step of the merge.
pub struct StreamSynchronizer<R> {
    readers: Vec<R>,
    heap: BinaryHeap<HeadEntry>,
}

impl<R> StreamSynchronizer<R>
where
    R: Iterator<Item = TickRecord>,
{
    pub fn new(readers: Vec<R>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(readers.len()),
            readers,
        };
        for index in 0..merge.readers.len() {
            merge.refill(index);
        }
        merge
    }

    /// Number of readers still holding a head record.
    #[must_use]
    pub fn active_readers(&self) -> usize {
        self.heap.len()
    }

    fn refill(&mut self, index: usize) {
        if let Some(record) = self.readers[index].next() {
            self.heap.push(HeadEntry {
                record,
                reader: index,
            });
        }
    }
}

impl<R> Iterator for StreamSynchronizer<R>
where
    R: Iterator<Item = TickRecord>,
{
    type Item = TickRecord;

    fn next(&mut self) -> Option<TickRecord> {
        let entry = self.heap.pop()?;
        self.refill(entry.reader);
        Some(entry.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rust_decimal::Decimal;
    use tickforge_core::{time_from_offset, Instrument, TickData};

    fn record(offset_ms: i64, size: i64) -> TickRecord {
        let date = chrono::NaiveDate::from_ymd_opt(2015, 12, 24).unwrap();
        TickRecord {
            instrument: Instrument::equity("AAPL"),
            time: time_from_offset(date, offset_ms),
            data: TickData::Trade {
                price: Decimal::from(100),
                size: Decimal::from(size),
            },
        }
    }

    #[test]
    fn merged_output_is_sorted_and_a_multiset_union() {
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        for _ in 0..25 {
            let reader_count = rng.gen_range(1..6);
            let mut inputs = Vec::new();
            for _ in 0..reader_count {
                let len = rng.gen_range(0..40);
                let mut offsets: Vec<i64> = (0..len).map(|_| rng.gen_range(0..500)).collect();
                offsets.sort_unstable();
                inputs.push(offsets);
            }

            let readers: Vec<_> = inputs
                .iter()
                .map(|offsets| {
                    offsets
                        .iter()
                        .map(|&ms| record(ms, 1))
                        .collect::<Vec<_>>()
                        .into_iter()
                })
                .collect();
            let merged: Vec<_> = StreamSynchronizer::new(readers).collect();

            let mut expected: Vec<i64> = inputs.into_iter().flatten().collect();
            expected.sort_unstable();
            let emitted: Vec<i64> = merged
                .iter()
                .map(|r| r.time.timestamp_millis() % 86_400_000)
                .collect();
            assert!(emitted.windows(2).all(|w| w[0] <= w[1]), "output not sorted");
            let mut emitted_sorted = emitted.clone();
            emitted_sorted.sort_unstable();
            assert_eq!(emitted_sorted, expected, "output is not a multiset union");
        }
    }

    #[test]
    fn ties_resolve_by_reader_input_order() {
        let a = vec![record(1_000, 1)].into_iter();
        let b = vec![record(1_000, 2)].into_iter();
        let merged: Vec<_> = StreamSynchronizer::new(vec![a, b]).collect();
        assert_eq!(
            merged
                .iter()
                .map(|r| match r.data {
                    TickData::Trade { size, .. } => size,
                    _ => unreachable!(),
                })
                .collect::<Vec<_>>(),
            vec![Decimal::from(1), Decimal::from(2)]
        );
    }

    #[test]
    fn equal_timestamps_within_a_reader_keep_file_order() {
        let a = vec![record(1_000, 1), record(1_000, 2), record(1_000, 3)].into_iter();
        let b = vec![record(500, 9)].into_iter();
        let merged: Vec<_> = StreamSynchronizer::new(vec![a, b]).collect();
        let sizes: Vec<_> = merged
            .iter()
            .map(|r| match r.data {
                TickData::Trade { size, .. } => size,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            sizes,
            vec![
                Decimal::from(9),
                Decimal::from(1),
                Decimal::from(2),
                Decimal::from(3)
            ]
        );
    }

    #[test]
    fn exhausted_readers_leave_the_merge() {
        let a = vec![record(1_000, 1)].into_iter();
        let b = vec![record(500, 2), record(2_000, 3)].into_iter();
        let mut merge = StreamSynchronizer::new(vec![a, b]);
        assert_eq!(merge.active_readers(), 2);
        merge.next();
        merge.next();
        assert_eq!(merge.active_readers(), 1);
        assert!(merge.next().is_some());
        assert!(merge.next().is_none());
    }
}
