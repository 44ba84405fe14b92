#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Below this many rows per shard, splitting work costs more than it saves.
pub const DEFAULT_MIN_ROWS_PER_SHARD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// One pass in row order. Float results are bit-reproducible.
    Sequential,
    /// Contiguous row shards processed on the rayon pool, merged in row order.
    Parallel,
}

/// How grouping and reduction passes are executed.
///
/// Deserializable with every field optional, so a harness can write
/// `{"mode": "parallel", "max_shards": 8}` and keep the other defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimePolicy {
    pub mode: RuntimeMode,
    /// Upper bound on shards; `None` means one per rayon worker thread.
    pub max_shards: Option<usize>,
    pub min_rows_per_shard: usize,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self::sequential()
    }
}

impl RuntimePolicy {
    #[must_use]
    pub fn sequential() -> Self {
        Self {
            mode: RuntimeMode::Sequential,
            max_shards: None,
            min_rows_per_shard: DEFAULT_MIN_ROWS_PER_SHARD,
        }
    }

    #[must_use]
    pub fn parallel(max_shards: Option<usize>) -> Self {
        Self {
            mode: RuntimeMode::Parallel,
            max_shards,
            min_rows_per_shard: DEFAULT_MIN_ROWS_PER_SHARD,
        }
    }

    #[must_use]
    pub fn with_min_rows_per_shard(mut self, min_rows_per_shard: usize) -> Self {
        self.min_rows_per_shard = min_rows_per_shard;
        self
    }

    /// Effective number of shards for an input of `rows` rows. Always >= 1.
    #[must_use]
    pub fn shard_count(&self, rows: usize) -> usize {
        match self.mode {
            RuntimeMode::Sequential => 1,
            RuntimeMode::Parallel => {
                let workers = self
                    .max_shards
                    .unwrap_or_else(rayon::current_num_threads)
                    .max(1);
                let by_rows = rows / self.min_rows_per_shard.max(1);
                workers.min(by_rows).max(1)
            }
        }
    }

    /// Split `0..rows` into `shard_count(rows)` contiguous, near-equal ranges.
    #[must_use]
    pub fn shard_ranges(&self, rows: usize) -> Vec<Range<usize>> {
        let shards = self.shard_count(rows);
        let base = rows / shards;
        let remainder = rows % shards;
        let mut ranges = Vec::with_capacity(shards);
        let mut start = 0;
        for shard in 0..shards {
            let len = base + usize::from(shard < remainder);
            ranges.push(start..start + len);
            start += len;
        }
        ranges
    }
}

/// One executed step, as recorded in an [`ExecutionLedger`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub ts_unix_ms: u64,
    pub operation: Cow<'static, str>,
    /// Column the step ran against.
    pub subject: String,
    /// Implementation path taken (for example the grouping strategy).
    pub strategy: Cow<'static, str>,
    pub rows: usize,
    pub groups: usize,
    pub shards: usize,
}

impl ExecutionRecord {
    #[must_use]
    pub fn new(
        operation: impl Into<Cow<'static, str>>,
        subject: impl Into<String>,
        strategy: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            ts_unix_ms: now_unix_ms(),
            operation: operation.into(),
            subject: subject.into(),
            strategy: strategy.into(),
            rows: 0,
            groups: 0,
            shards: 1,
        }
    }

    #[must_use]
    pub fn with_counts(mut self, rows: usize, groups: usize, shards: usize) -> Self {
        self.rows = rows;
        self.groups = groups;
        self.shards = shards;
        self
    }
}

/// Append-only log of executed steps.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLedger {
    records: Vec<ExecutionRecord>,
}

impl ExecutionLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: ExecutionRecord) {
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    #[must_use]
    pub fn last(&self) -> Option<&ExecutionRecord> {
        self.records.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{
        DEFAULT_MIN_ROWS_PER_SHARD, ExecutionLedger, ExecutionRecord, RuntimeMode, RuntimePolicy,
    };

    #[test]
    fn sequential_policy_never_shards() {
        let policy = RuntimePolicy::sequential();
        assert_eq!(policy.shard_count(10_000_000), 1);
        assert_eq!(policy.shard_ranges(5), vec![0..5]);
        assert_eq!(RuntimePolicy::default(), policy);
    }

    #[test]
    fn parallel_policy_respects_row_floor_and_cap() {
        let policy = RuntimePolicy::parallel(Some(4));
        assert_eq!(policy.shard_count(10), 1);
        assert_eq!(policy.shard_count(DEFAULT_MIN_ROWS_PER_SHARD * 2), 2);
        assert_eq!(policy.shard_count(DEFAULT_MIN_ROWS_PER_SHARD * 100), 4);

        let unbounded = RuntimePolicy::parallel(None).with_min_rows_per_shard(1);
        assert!(unbounded.shard_count(1_000) >= 1);
    }

    #[test]
    fn shard_ranges_are_contiguous_and_cover_all_rows() {
        let policy = RuntimePolicy::parallel(Some(3)).with_min_rows_per_shard(1);
        let ranges = policy.shard_ranges(10);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);

        let tiny = policy.shard_ranges(2);
        assert_eq!(tiny, vec![0..1, 1..2]);

        assert_eq!(policy.shard_ranges(0), vec![0..0]);
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: RuntimePolicy =
            serde_json::from_str(r#"{"mode": "parallel", "max_shards": 8}"#).expect("parse");
        assert_eq!(policy.mode, RuntimeMode::Parallel);
        assert_eq!(policy.max_shards, Some(8));
        assert_eq!(policy.min_rows_per_shard, DEFAULT_MIN_ROWS_PER_SHARD);

        let empty: RuntimePolicy = serde_json::from_str("{}").expect("parse empty");
        assert_eq!(empty, RuntimePolicy::sequential());
    }

    #[test]
    fn ledger_appends_records() {
        let mut ledger = ExecutionLedger::new();
        assert!(ledger.is_empty());
        ledger.push(ExecutionRecord::new("groupby", "key", "dense").with_counts(6, 3, 1));
        ledger.push(ExecutionRecord::new("reduce", "value", "sum").with_counts(6, 3, 2));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.records()[0].groups, 3);
        let last = ledger.last().expect("last record");
        assert_eq!(last.operation, "reduce");
        assert_eq!(last.shards, 2);
    }
}
