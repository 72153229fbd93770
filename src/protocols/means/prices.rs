use std::collections::BTreeMap;

/// Price history of one connection, keyed by timestamp.
#[derive(Debug, Default)]
pub struct Prices {
    by_time: BTreeMap<i32, i32>,
}

impl Prices {
    /// Record a price. A repeated timestamp overwrites the earlier price.
    pub fn insert(&mut self, timestamp: i32, price: i32) {
        self.by_time.insert(timestamp, price);
    }

    /// Mean of the prices with `mintime <= timestamp <= maxtime`, truncated
    /// toward zero. Zero when the range is empty or inverted.
    pub fn mean(&self, mintime: i32, maxtime: i32) -> i32 {
        if mintime > maxtime {
            return 0;
        }

        let (sum, count) = self
            .by_time
            .range(mintime..=maxtime)
            .fold((0i64, 0i64), |(sum, count), (_, &price)| {
                (sum + i64::from(price), count + 1)
            });

        if count == 0 {
            return 0;
        }
        // The mean of i32 values always fits in an i32.
        (sum / count) as i32
    }

    pub fn len(&self) -> usize {
        self.by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_time.is_empty()
    }
}
