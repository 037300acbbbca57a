use std::sync::atomic::{
    AtomicU64,
    Ordering,
};

/// One counter stamped with the second it counts for. The stamp sits in the
/// high half of the word and the byte count in the low half, so moving to a
/// new second and resetting the count is a single compare-and-swap.
struct StampedCounter(AtomicU64);

impl StampedCounter {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn pack(second: u32, bytes: u32) -> u64 {
        (u64::from(second) << 32) | u64::from(bytes)
    }

    fn unpack(word: u64) -> (u32, u32) {
        ((word >> 32) as u32, word as u32)
    }

    fn add(&self, second: u32, bytes: u32) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let (stamp, count) = Self::unpack(current);
            let next = match stamp.cmp(&second) {
                // The slot already moved on to a later second.
                std::cmp::Ordering::Greater => return,
                std::cmp::Ordering::Equal => Self::pack(stamp, count.saturating_add(bytes)),
                std::cmp::Ordering::Less => Self::pack(second, bytes),
            };
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn get(&self, second: u32) -> u64 {
        let (stamp, count) = Self::unpack(self.0.load(Ordering::Acquire));
        if stamp != second {
            return 0;
        }
        u64::from(count)
    }
}

struct RateBucket {
    read_bytes: StampedCounter,
    write_bytes: StampedCounter,
}

/// Lock-free ring of one-second buckets. A counter only counts for the second
/// it is stamped with; the first writer in a newer second restamps it, and
/// writes for a second the slot has already left behind are dropped.
///
/// Seconds are unix seconds, which fit in 32 bits until 2106. Per-second
/// counts saturate at 4 GiB.
pub struct RateBuckets {
    buckets: Box<[RateBucket]>,
}

impl RateBuckets {
    pub fn new(count: usize) -> Self {
        Self {
            buckets: (0..count.max(1))
                .map(|_| RateBucket {
                    read_bytes: StampedCounter::new(),
                    write_bytes: StampedCounter::new(),
                })
                .collect(),
        }
    }

    fn slot(&self, second: u64) -> (&RateBucket, u32) {
        let bucket = &self.buckets[(second % self.buckets.len() as u64) as usize];
        (bucket, u32::try_from(second).unwrap_or(u32::MAX))
    }

    pub fn add_read(&self, second: u64, bytes: u64) {
        let (bucket, second) = self.slot(second);
        bucket
            .read_bytes
            .add(second, u32::try_from(bytes).unwrap_or(u32::MAX));
    }

    pub fn add_write(&self, second: u64, bytes: u64) {
        let (bucket, second) = self.slot(second);
        bucket
            .write_bytes
            .add(second, u32::try_from(bytes).unwrap_or(u32::MAX));
    }

    pub fn read_kb(&self, second: u64) -> u64 {
        let (bucket, second) = self.slot(second);
        bucket.read_bytes.get(second) / 1024
    }

    pub fn write_kb(&self, second: u64) -> u64 {
        let (bucket, second) = self.slot(second);
        bucket.write_bytes.get(second) / 1024
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::RateBuckets;

    proptest! {
        #![proptest_config(ProptestConfig { failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn test_same_second_writes_accumulate(
            n in 1u64..200,
            k in 1u64..10_000,
            second in 1_000u64..1_000_000,
        ) {
            let buckets = RateBuckets::new(10);
            for _ in 0..n {
                buckets.add_write(second, k);
            }
            prop_assert_eq!(buckets.write_kb(second), n * k / 1024);
            prop_assert_eq!(buckets.read_kb(second), 0);

            buckets.add_write(second + 1, k);
            prop_assert_eq!(buckets.write_kb(second), n * k / 1024);
            prop_assert_eq!(buckets.write_kb(second + 1), k / 1024);
        }
    }

    #[test]
    fn test_stale_bucket_is_reclaimed() {
        let buckets = RateBuckets::new(4);
        buckets.add_read(100, 4096);
        assert_eq!(buckets.read_kb(100), 4);
        // Second 104 maps onto the same slot as 100.
        buckets.add_read(104, 1024);
        assert_eq!(buckets.read_kb(104), 1);
        assert_eq!(buckets.read_kb(100), 0);
        assert_eq!(buckets.read_kb(108), 0);
    }

    #[test]
    fn test_late_write_does_not_reset_newer_second() {
        let buckets = RateBuckets::new(4);
        buckets.add_write(104, 8192);
        // A writer still on second 100 arrives after the slot moved on.
        buckets.add_write(100, 1024);
        assert_eq!(buckets.write_kb(104), 8);
        assert_eq!(buckets.write_kb(100), 0);
    }

    #[test]
    fn test_concurrent_writers_across_a_second_boundary() {
        let buckets = std::sync::Arc::new(RateBuckets::new(4));
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let buckets = buckets.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        buckets.add_write(100 + 4 * (i % 2), 1024);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // Every write for the newest second is counted, whatever the
        // interleaving with writers for the older one.
        assert_eq!(buckets.write_kb(104), 4_000);
        assert_eq!(buckets.write_kb(100), 0);
    }
}
