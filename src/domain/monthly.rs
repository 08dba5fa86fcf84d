use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// Dense integer encoding of a year-month, used as the bucket key for
/// per-feed story counts and for the monthly storage partitions.
pub fn id_of_month(year: i32, month: u32) -> i64 {
    i64::from(year) * 12 + i64::from(month) - 1
}

/// Inverse of [`id_of_month`].
pub fn month_of_id(month_id: i64) -> (i32, u32) {
    let year = (month_id / 12) as i32;
    let month = (month_id % 12 + 1) as u32;
    (year, month)
}

pub fn month_id_of_datetime(dt: DateTime<Utc>) -> i64 {
    id_of_month(dt.year(), dt.month())
}

/// Per-feed mapping of month id to the number of storys published in that
/// month. Persisted as a JSON object column on the feed row and maintained
/// as a side effect of bulk story save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonthlyStoryCount(BTreeMap<i64, i64>);

impl MonthlyStoryCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, year: i32, month: u32) -> i64 {
        self.get_by_id(id_of_month(year, month))
    }

    pub fn get_by_id(&self, month_id: i64) -> i64 {
        self.0.get(&month_id).copied().unwrap_or(0)
    }

    pub fn incr(&mut self, month_id: i64) {
        *self.0.entry(month_id).or_insert(0) += 1;
    }

    /// Decrement, never going below zero. Empty buckets are removed so the
    /// serialized map stays small.
    pub fn decr(&mut self, month_id: i64) {
        if let Some(count) = self.0.get_mut(&month_id) {
            *count -= 1;
            if *count <= 0 {
                self.0.remove(&month_id);
            }
        }
    }

    pub fn put(&mut self, month_id: i64, count: i64) {
        if count > 0 {
            self.0.insert(month_id, count);
        } else {
            self.0.remove(&month_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
