#![forbid(unsafe_code)]

use std::fmt;
use std::mem::size_of;
use std::ops::Range;

use ahash::RandomState;
use bumpalo::{Bump, collections::Vec as BumpVec};
use cf_columnar::{Column, ColumnData, ColumnError, Dictionary};
use cf_frame::{Frame, FrameError};
use cf_runtime::{ExecutionLedger, ExecutionRecord, RuntimePolicy};
use cf_types::DType;
use hashbrown::HashMap;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, trace};

/// Normalized per-row grouping key: the raw value of an `Int64` column, the
/// dictionary code of a string column, or the canonical bit pattern of a
/// `Float64` column.
pub type GroupKey = i64;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GroupByError {
    #[error("unknown column '{name}'")]
    UnknownColumn { name: String },
    #[error("value column has {value_len} rows but the grouping column has {key_len}")]
    ColumnLengthMismatch { key_len: usize, value_len: usize },
    #[error("cannot compute {func} over non-numeric column of dtype {dtype}")]
    NonNumericValues { dtype: DType, func: AggFunc },
    #[error("int64 accumulator overflowed for group {group}")]
    SumOverflow { group: usize },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// Widest key span (max - min + 1) served by a direct slot table.
pub const DENSE_KEY_SPAN_LIMIT: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupByExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
    pub dense_key_span_limit: usize,
}

impl Default for GroupByExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
            dense_key_span_limit: DENSE_KEY_SPAN_LIMIT,
        }
    }
}

/// Fixed seeds keep hashed grouping reproducible between runs.
const GROUP_HASH_STATE: RandomState = RandomState::with_seeds(
    0x9e37_79b9_7f4a_7c15,
    0xbf58_476d_1ce4_e5b9,
    0x94d0_49bb_1331_11eb,
    0x2545_f491_4f6c_dd1d,
);

const NO_GROUP: usize = usize::MAX;

// ---------------------------------------------------------------------------
// Key encoding
// ---------------------------------------------------------------------------

/// Typed view of a grouping column producing one [`GroupKey`] per row.
///
/// The column dtype is matched once when the encoder is created; the
/// grouping loops are then monomorphized per variant so the hot path never
/// dispatches on dtype or touches string bytes.
#[derive(Debug, Clone, Copy)]
pub enum KeyEncoder<'a> {
    Int64(&'a [i64]),
    Float64(&'a [f64]),
    Dictionary {
        codes: &'a [u32],
        dictionary: &'a Dictionary,
    },
}

/// Contiguous key range `[min, min + span)` small enough for a slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyDomain {
    min: GroupKey,
    span: usize,
}

impl<'a> KeyEncoder<'a> {
    #[must_use]
    pub fn new(column: &'a Column) -> Self {
        match column.data() {
            ColumnData::Int64(values) => Self::Int64(values),
            ColumnData::Float64(values) => Self::Float64(values),
            ColumnData::Utf8Dictionary { codes, dictionary } => Self::Dictionary {
                codes: codes.as_slice(),
                dictionary,
            },
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Dictionary { .. } => DType::Utf8Dictionary,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int64(values) => values.len(),
            Self::Float64(values) => values.len(),
            Self::Dictionary { codes, .. } => codes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key of a single row. Prefer the grouping entry points for bulk work.
    #[must_use]
    pub fn key(&self, row: usize) -> Option<GroupKey> {
        match self {
            Self::Int64(values) => values.get(row).copied(),
            Self::Float64(values) => values.get(row).copied().map(float_key),
            Self::Dictionary { codes, .. } => codes.get(row).copied().map(GroupKey::from),
        }
    }

    /// Encoder over a contiguous sub-range of rows. `rows` must lie within
    /// `0..len()`.
    #[must_use]
    pub(crate) fn slice(&self, rows: Range<usize>) -> Self {
        match *self {
            Self::Int64(values) => Self::Int64(&values[rows]),
            Self::Float64(values) => Self::Float64(&values[rows]),
            Self::Dictionary { codes, dictionary } => Self::Dictionary {
                codes: &codes[rows],
                dictionary,
            },
        }
    }

    /// Rebuild a column of the encoder's dtype from group keys, resolving
    /// dictionary codes back to their strings.
    pub fn decode(&self, keys: &[GroupKey]) -> Result<Column, ColumnError> {
        match self {
            Self::Int64(_) => Ok(Column::from_i64(keys.to_vec())),
            Self::Float64(_) => Ok(Column::from_f64(
                keys.iter().map(|&key| f64::from_bits(key as u64)).collect(),
            )),
            Self::Dictionary { dictionary, .. } => {
                let labels = keys
                    .iter()
                    .map(|&key| {
                        let code = u32::try_from(key).unwrap_or(u32::MAX);
                        dictionary
                            .resolve(code)
                            .ok_or(ColumnError::CodeOutOfRange {
                                code,
                                len: dictionary.len(),
                            })
                    })
                    .collect::<Result<Vec<&str>, _>>()?;
                Column::from_strings(labels)
            }
        }
    }
}

/// NaNs collapse to one key and `-0.0` groups with `0.0`.
fn float_key(value: f64) -> GroupKey {
    let canonical = if value.is_nan() {
        f64::NAN
    } else if value == 0.0 {
        0.0
    } else {
        value
    };
    canonical.to_bits() as GroupKey
}

/// Scan `values` once for min/max and accept the range when it is narrow.
fn int64_domain(values: &[i64], span_limit: usize) -> Option<KeyDomain> {
    if values.is_empty() {
        return None;
    }
    let (min, max) = values
        .iter()
        .fold((i64::MAX, i64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let span = i128::from(max) - i128::from(min) + 1;
    let span = usize::try_from(span).ok()?;
    (span <= span_limit).then_some(KeyDomain { min, span })
}

fn dictionary_domain(dictionary: &Dictionary, span_limit: usize) -> Option<KeyDomain> {
    let span = dictionary.len();
    (span > 0 && span <= span_limit).then_some(KeyDomain { min: 0, span })
}

// ---------------------------------------------------------------------------
// Grouping index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingStrategy {
    /// Direct slot table over a narrow key range (dictionary codes, small ints).
    Dense,
    /// Open-addressed hash table keyed by [`GroupKey`].
    Hashed,
}

impl GroupingStrategy {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Dense => "dense",
            Self::Hashed => "hashed",
        }
    }
}

/// Row-to-group assignment plus the distinct keys, in first-occurrence order.
///
/// `distinct_keys[group_of_row[i]]` is the key of row `i`, and every key
/// appears in `distinct_keys` exactly once. Group ids are *not* sorted by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingIndex {
    group_of_row: Vec<usize>,
    distinct_keys: Vec<GroupKey>,
    strategy: GroupingStrategy,
    shards: usize,
}

impl GroupingIndex {
    /// Build the index in one pass, sharding across the rayon pool when the
    /// policy asks for it.
    #[must_use]
    pub fn build(
        encoder: &KeyEncoder<'_>,
        options: &GroupByExecutionOptions,
        policy: &RuntimePolicy,
    ) -> Self {
        let ranges = policy.shard_ranges(encoder.len());
        if ranges.len() <= 1 {
            Self::build_local(encoder, options)
        } else {
            Self::build_sharded(encoder, options, &ranges)
        }
    }

    fn build_local(encoder: &KeyEncoder<'_>, options: &GroupByExecutionOptions) -> Self {
        let limit = options.dense_key_span_limit;
        let ((group_of_row, distinct_keys), strategy) = match *encoder {
            KeyEncoder::Int64(values) => match int64_domain(values, limit) {
                Some(domain) => (
                    assign_dense(values.iter().copied(), domain, options),
                    GroupingStrategy::Dense,
                ),
                None => (
                    assign_hashed(values.iter().copied()),
                    GroupingStrategy::Hashed,
                ),
            },
            KeyEncoder::Float64(values) => (
                assign_hashed(values.iter().copied().map(float_key)),
                GroupingStrategy::Hashed,
            ),
            KeyEncoder::Dictionary { codes, dictionary } => {
                let keys = codes.iter().copied().map(GroupKey::from);
                match dictionary_domain(dictionary, limit) {
                    Some(domain) => (
                        assign_dense(keys, domain, options),
                        GroupingStrategy::Dense,
                    ),
                    None => (assign_hashed(keys), GroupingStrategy::Hashed),
                }
            }
        };

        Self {
            group_of_row,
            distinct_keys,
            strategy,
            shards: 1,
        }
    }

    /// Build one local index per shard in parallel, then merge shard-local
    /// keys by key equality. Shards are merged in row order, so the global
    /// group order is the same first-occurrence order a sequential pass gives.
    fn build_sharded(
        encoder: &KeyEncoder<'_>,
        options: &GroupByExecutionOptions,
        ranges: &[Range<usize>],
    ) -> Self {
        let mut locals: Vec<Self> = ranges
            .par_iter()
            .enumerate()
            .map(|(shard, rows)| {
                let local = Self::build_local(&encoder.slice(rows.clone()), options);
                trace!(
                    shard,
                    rows = local.len(),
                    groups = local.group_count(),
                    strategy = local.strategy.name(),
                    "built shard-local grouping index"
                );
                local
            })
            .collect();

        let mut global_slots: HashMap<GroupKey, usize, RandomState> =
            HashMap::with_hasher(GROUP_HASH_STATE);
        let mut distinct_keys = Vec::new();
        let mut remaps = Vec::with_capacity(locals.len());
        for local in &locals {
            let mut remap = Vec::with_capacity(local.distinct_keys.len());
            for &key in &local.distinct_keys {
                let next = distinct_keys.len();
                let group = *global_slots.entry(key).or_insert_with(|| {
                    distinct_keys.push(key);
                    next
                });
                remap.push(group);
            }
            remaps.push(remap);
        }

        locals
            .par_iter_mut()
            .zip(remaps.par_iter())
            .for_each(|(local, remap)| {
                for group in &mut local.group_of_row {
                    *group = remap[*group];
                }
            });

        let strategy = if locals
            .iter()
            .all(|local| local.strategy == GroupingStrategy::Dense)
        {
            GroupingStrategy::Dense
        } else {
            GroupingStrategy::Hashed
        };

        let mut group_of_row = Vec::with_capacity(encoder.len());
        for local in &locals {
            group_of_row.extend_from_slice(&local.group_of_row);
        }

        Self {
            group_of_row,
            distinct_keys,
            strategy,
            shards: ranges.len(),
        }
    }

    #[must_use]
    pub fn group_of_row(&self) -> &[usize] {
        &self.group_of_row
    }

    #[must_use]
    pub fn distinct_keys(&self) -> &[GroupKey] {
        &self.distinct_keys
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.distinct_keys.len()
    }

    /// Number of rows covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.group_of_row.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.group_of_row.is_empty()
    }

    #[must_use]
    pub fn strategy(&self) -> GroupingStrategy {
        self.strategy
    }

    #[must_use]
    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Rows per group, aligned with `distinct_keys`.
    #[must_use]
    pub fn group_sizes(&self) -> Vec<i64> {
        let mut sizes = vec![0_i64; self.group_count()];
        for &group in &self.group_of_row {
            sizes[group] += 1;
        }
        sizes
    }
}

fn assign_dense<I>(
    keys: I,
    domain: KeyDomain,
    options: &GroupByExecutionOptions,
) -> (Vec<usize>, Vec<GroupKey>)
where
    I: Iterator<Item = GroupKey>,
{
    let slot_bytes = domain.span.saturating_mul(size_of::<usize>());
    if options.use_arena && slot_bytes <= options.arena_budget_bytes {
        // The slot table is scratch; it is released with the arena.
        let arena = Bump::with_capacity(slot_bytes);
        let mut slots = BumpVec::with_capacity_in(domain.span, &arena);
        slots.resize(domain.span, NO_GROUP);
        assign_with_slots(keys, domain.min, &mut slots)
    } else {
        let mut slots = vec![NO_GROUP; domain.span];
        assign_with_slots(keys, domain.min, &mut slots)
    }
}

fn assign_with_slots<I>(
    keys: I,
    min: GroupKey,
    slots: &mut [usize],
) -> (Vec<usize>, Vec<GroupKey>)
where
    I: Iterator<Item = GroupKey>,
{
    let mut group_of_row = Vec::with_capacity(keys.size_hint().0);
    let mut distinct_keys = Vec::new();
    for key in keys {
        // Every key lies in [min, min + span), so the offset fits the table.
        let slot = &mut slots[key.wrapping_sub(min) as u64 as usize];
        if *slot == NO_GROUP {
            *slot = distinct_keys.len();
            distinct_keys.push(key);
        }
        group_of_row.push(*slot);
    }
    (group_of_row, distinct_keys)
}

fn assign_hashed<I>(keys: I) -> (Vec<usize>, Vec<GroupKey>)
where
    I: Iterator<Item = GroupKey>,
{
    let mut group_of_row = Vec::with_capacity(keys.size_hint().0);
    let mut distinct_keys = Vec::new();
    let mut slots: HashMap<GroupKey, usize, RandomState> =
        HashMap::with_capacity_and_hasher(64, GROUP_HASH_STATE);
    for key in keys {
        let next = distinct_keys.len();
        let group = *slots.entry(key).or_insert_with(|| {
            distinct_keys.push(key);
            next
        });
        group_of_row.push(group);
    }
    (group_of_row, distinct_keys)
}

// ---------------------------------------------------------------------------
// Reduction
// ---------------------------------------------------------------------------

/// Aggregation function selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggFunc {
    Sum,
    Count,
    Min,
    Max,
    Mean,
}

impl AggFunc {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Mean => "mean",
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduce `values` per group of `index`.
///
/// Accumulators form an arena indexed by group id. Sequentially, rows are
/// folded in row order, so float sums are bit-reproducible. Under a parallel
/// policy each shard folds into its own arena and arenas are combined in
/// shard order: integer results match the sequential pass exactly, float
/// sums may differ in the last bits between shard counts.
///
/// Sum, Min and Max keep the value dtype, Count is `Int64` and Mean is
/// `Float64`. Int64 sums accumulate in `i128` and fail with `SumOverflow`
/// only when a group's final total does not fit in `i64`, so the outcome
/// never depends on row order or shard count. Float min/max skip NaN values;
/// a group holding only NaN yields NaN.
pub fn reduce_groups(
    index: &GroupingIndex,
    values: &Column,
    func: AggFunc,
    policy: &RuntimePolicy,
) -> Result<Column, GroupByError> {
    if values.len() != index.len() {
        return Err(GroupByError::ColumnLengthMismatch {
            key_len: index.len(),
            value_len: values.len(),
        });
    }

    let ranges = policy.shard_ranges(index.len());
    let non_numeric = || GroupByError::NonNumericValues {
        dtype: values.dtype(),
        func,
    };

    let out = match (func, values.data()) {
        (AggFunc::Count, _) => Column::from_i64(index.group_sizes()),
        (AggFunc::Sum, ColumnData::Int64(v)) => {
            let wide = fold_groups(
                index,
                v,
                &ranges,
                0_i128,
                |acc, x| acc.checked_add(i128::from(x)),
                i128::checked_add,
            )?;
            Column::from_i64(narrow_sums(wide)?)
        }
        (AggFunc::Sum, ColumnData::Float64(v)) => Column::from_f64(fold_groups(
            index,
            v,
            &ranges,
            0.0_f64,
            |acc, x| Some(acc + x),
            |a, b| Some(a + b),
        )?),
        (AggFunc::Min, ColumnData::Int64(v)) => Column::from_i64(fold_groups(
            index,
            v,
            &ranges,
            i64::MAX,
            |acc, x| Some(acc.min(x)),
            |a, b| Some(a.min(b)),
        )?),
        (AggFunc::Min, ColumnData::Float64(v)) => Column::from_f64(fold_groups(
            index,
            v,
            &ranges,
            f64::NAN,
            |acc: f64, x| Some(acc.min(x)),
            |a: f64, b| Some(a.min(b)),
        )?),
        (AggFunc::Max, ColumnData::Int64(v)) => Column::from_i64(fold_groups(
            index,
            v,
            &ranges,
            i64::MIN,
            |acc, x| Some(acc.max(x)),
            |a, b| Some(a.max(b)),
        )?),
        (AggFunc::Max, ColumnData::Float64(v)) => Column::from_f64(fold_groups(
            index,
            v,
            &ranges,
            f64::NAN,
            |acc: f64, x| Some(acc.max(x)),
            |a: f64, b| Some(a.max(b)),
        )?),
        (AggFunc::Mean, ColumnData::Int64(v)) => {
            let sums = fold_groups(
                index,
                v,
                &ranges,
                0.0_f64,
                |acc, x| Some(acc + x as f64),
                |a, b| Some(a + b),
            )?;
            Column::from_f64(divide_by_sizes(sums, &index.group_sizes()))
        }
        (AggFunc::Mean, ColumnData::Float64(v)) => {
            let sums = fold_groups(
                index,
                v,
                &ranges,
                0.0_f64,
                |acc, x| Some(acc + x),
                |a, b| Some(a + b),
            )?;
            Column::from_f64(divide_by_sizes(sums, &index.group_sizes()))
        }
        (_, ColumnData::Utf8Dictionary { .. }) => return Err(non_numeric()),
    };

    Ok(out)
}

fn narrow_sums(wide: Vec<i128>) -> Result<Vec<i64>, GroupByError> {
    wide.into_iter()
        .enumerate()
        .map(|(group, total)| {
            i64::try_from(total).map_err(|_| GroupByError::SumOverflow { group })
        })
        .collect()
}

fn divide_by_sizes(sums: Vec<f64>, sizes: &[i64]) -> Vec<f64> {
    sums.into_iter()
        .zip(sizes)
        .map(|(sum, &size)| sum / size as f64)
        .collect()
}

/// Fold every row into the accumulator of its group, one arena per shard,
/// then combine shard arenas in shard order. `step`/`combine` return `None`
/// on accumulator overflow.
fn fold_groups<A, T, S, C>(
    index: &GroupingIndex,
    values: &[T],
    ranges: &[Range<usize>],
    identity: A,
    step: S,
    combine: C,
) -> Result<Vec<A>, GroupByError>
where
    A: Copy + Send + Sync,
    T: Copy + Sync,
    S: Fn(A, T) -> Option<A> + Sync,
    C: Fn(A, A) -> Option<A>,
{
    let group_count = index.group_count();
    let group_of_row = index.group_of_row();
    if ranges.len() <= 1 {
        return fold_rows(group_of_row, values, group_count, identity, &step);
    }

    let partials = ranges
        .par_iter()
        .map(|rows| {
            fold_rows(
                &group_of_row[rows.clone()],
                &values[rows.clone()],
                group_count,
                identity,
                &step,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut partials = partials.into_iter();
    let mut merged = partials
        .next()
        .unwrap_or_else(|| vec![identity; group_count]);
    for partial in partials {
        for (group, (slot, value)) in merged.iter_mut().zip(partial).enumerate() {
            match combine(*slot, value) {
                Some(next) => *slot = next,
                None => return Err(GroupByError::SumOverflow { group }),
            }
        }
    }
    Ok(merged)
}

fn fold_rows<A, T, S>(
    group_of_row: &[usize],
    values: &[T],
    group_count: usize,
    identity: A,
    step: &S,
) -> Result<Vec<A>, GroupByError>
where
    A: Copy,
    T: Copy,
    S: Fn(A, T) -> Option<A>,
{
    let mut acc = vec![identity; group_count];
    for (&group, &value) in group_of_row.iter().zip(values) {
        match step(acc[group], value) {
            Some(next) => acc[group] = next,
            None => return Err(GroupByError::SumOverflow { group }),
        }
    }
    Ok(acc)
}

// ---------------------------------------------------------------------------
// Frame-level entry points
// ---------------------------------------------------------------------------

/// One row per group: the distinct keys (in the grouping column's dtype) and
/// the aggregated values, aligned by position.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    key_name: String,
    value_name: String,
    func: AggFunc,
    keys: Column,
    values: Column,
}

impl AggregationResult {
    #[must_use]
    pub fn keys(&self) -> &Column {
        &self.keys
    }

    #[must_use]
    pub fn values(&self) -> &Column {
        &self.values
    }

    #[must_use]
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    #[must_use]
    pub fn value_name(&self) -> &str {
        &self.value_name
    }

    #[must_use]
    pub fn func(&self) -> AggFunc {
        self.func
    }

    /// Number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn into_parts(self) -> (Column, Column) {
        (self.keys, self.values)
    }

    /// Result table `{key, value}`. When a column was grouped by itself the
    /// value column is suffixed with the aggregation name.
    pub fn into_frame(self) -> Result<Frame, GroupByError> {
        let value_name = if self.value_name == self.key_name {
            format!("{}_{}", self.value_name, self.func)
        } else {
            self.value_name
        };
        Ok(Frame::new(vec![
            (self.key_name, self.keys),
            (value_name, self.values),
        ])?)
    }
}

/// A frame grouped by one column, ready to reduce any value column.
#[derive(Debug, Clone)]
pub struct GroupingHandle<'a> {
    frame: &'a Frame,
    key_name: String,
    encoder: KeyEncoder<'a>,
    index: GroupingIndex,
    policy: RuntimePolicy,
}

impl<'a> GroupingHandle<'a> {
    #[must_use]
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    #[must_use]
    pub fn index(&self) -> &GroupingIndex {
        &self.index
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.index.group_count()
    }

    #[must_use]
    pub fn frame(&self) -> &'a Frame {
        self.frame
    }

    /// Distinct keys in group order, in the grouping column's dtype.
    pub fn keys(&self) -> Result<Column, GroupByError> {
        Ok(self.encoder.decode(self.index.distinct_keys())?)
    }

    /// Per-group sum of `value_name`.
    pub fn reduce(&self, value_name: &str) -> Result<AggregationResult, GroupByError> {
        self.aggregate(value_name, AggFunc::Sum)
    }

    pub fn aggregate(
        &self,
        value_name: &str,
        func: AggFunc,
    ) -> Result<AggregationResult, GroupByError> {
        let values = lookup_column(self.frame, value_name)?;
        self.run_aggregate(value_name, values, func, None)
    }

    pub fn aggregate_with_ledger(
        &self,
        value_name: &str,
        func: AggFunc,
        ledger: &mut ExecutionLedger,
    ) -> Result<AggregationResult, GroupByError> {
        let values = lookup_column(self.frame, value_name)?;
        self.run_aggregate(value_name, values, func, Some(ledger))
    }

    /// Aggregate a column that does not live in the grouped frame. Its length
    /// must match the grouping column.
    pub fn aggregate_column(
        &self,
        value_name: &str,
        values: &Column,
        func: AggFunc,
    ) -> Result<AggregationResult, GroupByError> {
        self.run_aggregate(value_name, values, func, None)
    }

    fn run_aggregate(
        &self,
        value_name: &str,
        values: &Column,
        func: AggFunc,
        ledger: Option<&mut ExecutionLedger>,
    ) -> Result<AggregationResult, GroupByError> {
        let aggregated = reduce_groups(&self.index, values, func, &self.policy)?;
        let keys = self.encoder.decode(self.index.distinct_keys())?;
        let shards = self.policy.shard_count(self.index.len());

        debug!(
            key = %self.key_name,
            value = value_name,
            func = func.name(),
            rows = self.index.len(),
            groups = self.index.group_count(),
            shards,
            "aggregated groups"
        );
        if let Some(ledger) = ledger {
            ledger.push(
                ExecutionRecord::new("aggregate", value_name.to_owned(), func.name())
                    .with_counts(self.index.len(), self.index.group_count(), shards),
            );
        }

        Ok(AggregationResult {
            key_name: self.key_name.clone(),
            value_name: value_name.to_owned(),
            func,
            keys,
            values: aggregated,
        })
    }
}

fn lookup_column<'a>(frame: &'a Frame, name: &str) -> Result<&'a Column, GroupByError> {
    frame
        .column(name)
        .ok_or_else(|| GroupByError::UnknownColumn {
            name: name.to_owned(),
        })
}

/// Group `frame` by `column` with the sequential policy and default options.
pub fn groupby<'a>(frame: &'a Frame, column: &str) -> Result<GroupingHandle<'a>, GroupByError> {
    groupby_with_options(
        frame,
        column,
        &RuntimePolicy::default(),
        GroupByExecutionOptions::default(),
        None,
    )
}

pub fn groupby_with_policy<'a>(
    frame: &'a Frame,
    column: &str,
    policy: &RuntimePolicy,
    ledger: &mut ExecutionLedger,
) -> Result<GroupingHandle<'a>, GroupByError> {
    groupby_with_options(
        frame,
        column,
        policy,
        GroupByExecutionOptions::default(),
        Some(ledger),
    )
}

pub fn groupby_with_options<'a>(
    frame: &'a Frame,
    column: &str,
    policy: &RuntimePolicy,
    exec_options: GroupByExecutionOptions,
    ledger: Option<&mut ExecutionLedger>,
) -> Result<GroupingHandle<'a>, GroupByError> {
    let key_column = lookup_column(frame, column)?;
    let encoder = KeyEncoder::new(key_column);
    let index = GroupingIndex::build(&encoder, &exec_options, policy);

    debug!(
        key = column,
        dtype = %encoder.dtype(),
        rows = index.len(),
        groups = index.group_count(),
        strategy = index.strategy().name(),
        shards = index.shards(),
        "built grouping index"
    );
    if let Some(ledger) = ledger {
        ledger.push(
            ExecutionRecord::new("groupby", column.to_owned(), index.strategy().name())
                .with_counts(index.len(), index.group_count(), index.shards()),
        );
    }

    Ok(GroupingHandle {
        frame,
        key_name: column.to_owned(),
        encoder,
        index,
        policy: *policy,
    })
}

/// `frame.groupby("col").reduce("other")` call style.
pub trait FrameGroupByExt {
    fn groupby(&self, column: &str) -> Result<GroupingHandle<'_>, GroupByError>;
}

impl FrameGroupByExt for Frame {
    fn groupby(&self, column: &str) -> Result<GroupingHandle<'_>, GroupByError> {
        groupby(self, column)
    }
}
