#![forbid(unsafe_code)]

//! Conformance harness for grouped aggregation.
//!
//! Fixtures describe a two-column frame (`group-col`, `reduce-col`) by row
//! count, key/value cardinality and dtype. The harness generates the frame
//! from a seed, runs it through the grouping engine and checks the output
//! against a brute-force oracle that knows nothing about dictionaries, slot
//! tables or shards.

use std::fs;
use std::path::{Path, PathBuf};

use cf_columnar::{Column, ColumnError};
use cf_frame::{Frame, FrameError};
use cf_groupby::{AggFunc, GroupByError, groupby_with_policy};
use cf_runtime::{ExecutionLedger, RuntimePolicy};
use cf_types::{DType, Scalar, TypeError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const KEY_COLUMN: &str = "group-col";
pub const VALUE_COLUMN: &str = "reduce-col";

/// Relative tolerance for float aggregates folded across more than one shard.
pub const SHARDED_FLOAT_TOLERANCE: f64 = 1e-9;

const MAX_REPORTED_MISMATCHES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
        }
    }

    #[must_use]
    pub fn with_fixture_root(fixture_root: impl Into<PathBuf>) -> Self {
        Self {
            fixture_root: fixture_root.into(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Error)]
pub enum ConformanceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    GroupBy(#[from] GroupByError),
    #[error("fixture '{name}' is invalid: {reason}")]
    InvalidFixture { name: String, reason: String },
    #[error("oracle int64 sum overflowed for group {group}")]
    OracleOverflow { group: usize },
}

// ---------------------------------------------------------------------------
// Fixture model
// ---------------------------------------------------------------------------

/// Generated column type. Narrow integer/float names and the `str8`/`str16`
/// string encodings are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    #[serde(
        alias = "int8",
        alias = "int16",
        alias = "int32",
        alias = "uint8",
        alias = "uint16",
        alias = "uint32"
    )]
    Int64,
    #[serde(alias = "float32")]
    Float64,
    #[serde(alias = "str8", alias = "str16")]
    Utf8,
}

impl ColumnKind {
    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::Int64 => DType::Int64,
            Self::Float64 => DType::Float64,
            Self::Utf8 => DType::Utf8Dictionary,
        }
    }
}

/// One generated column: integers drawn from `0..K`, floats from
/// `K * [0, 1)`, or strings from the first `K` labels of [`label_strings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    #[serde(rename = "K")]
    pub k: u32,
    #[serde(rename = "type")]
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureFunc {
    #[default]
    Sum,
    Count,
    Min,
    Max,
    Mean,
}

impl From<FixtureFunc> for AggFunc {
    fn from(func: FixtureFunc) -> Self {
        match func {
            FixtureFunc::Sum => Self::Sum,
            FixtureFunc::Count => Self::Count,
            FixtureFunc::Min => Self::Min,
            FixtureFunc::Max => Self::Max,
            FixtureFunc::Mean => Self::Mean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureSpec {
    pub name: String,
    #[serde(rename = "N")]
    pub rows: usize,
    pub key: ColumnSpec,
    pub value: ColumnSpec,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub func: FixtureFunc,
    #[serde(default)]
    pub policy: RuntimePolicy,
}

impl FixtureSpec {
    pub fn validate(&self) -> Result<(), ConformanceError> {
        let invalid = |reason: &str| ConformanceError::InvalidFixture {
            name: self.name.clone(),
            reason: reason.to_owned(),
        };
        if self.rows > 0 && (self.key.k == 0 || self.value.k == 0) {
            return Err(invalid("K must be positive when N > 0"));
        }
        if self.value.kind == ColumnKind::Utf8 && self.func != FixtureFunc::Count {
            return Err(invalid("string value columns only support count"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Data generation
// ---------------------------------------------------------------------------

/// The first `k` labels of the fixed-width lowercase alphabet sequence.
///
/// Width is the smallest `L` with `26^L >= k`, so `k = 3` gives
/// `a, b, c` and `k = 27` gives `aa, ab, ..., az, ba`.
#[must_use]
pub fn label_strings(k: usize) -> Vec<String> {
    let width = label_width(k);
    (0..k).map(|index| label_at(index, width)).collect()
}

fn label_width(k: usize) -> usize {
    let mut width = 0;
    let mut capacity = 1_usize;
    while capacity < k {
        capacity = capacity.saturating_mul(26);
        width += 1;
    }
    width
}

fn label_at(mut index: usize, width: usize) -> String {
    let mut label = vec!['a'; width];
    for slot in label.iter_mut().rev() {
        *slot = char::from(b'a' + (index % 26) as u8);
        index /= 26;
    }
    label.into_iter().collect()
}

/// Deterministically build the `group-col` / `reduce-col` frame a fixture
/// describes. The same fixture and seed always produce the same frame.
pub fn generate_frame(fixture: &FixtureSpec) -> Result<Frame, ConformanceError> {
    fixture.validate()?;
    let mut rng = StdRng::seed_from_u64(fixture.seed);
    let keys = generate_column(&mut rng, fixture.rows, &fixture.key)?;
    let values = generate_column(&mut rng, fixture.rows, &fixture.value)?;
    debug!(
        fixture = %fixture.name,
        rows = fixture.rows,
        key_dtype = %keys.dtype(),
        value_dtype = %values.dtype(),
        "generated fixture frame"
    );
    Ok(Frame::new(vec![
        (KEY_COLUMN.to_owned(), keys),
        (VALUE_COLUMN.to_owned(), values),
    ])?)
}

fn generate_column(
    rng: &mut StdRng,
    rows: usize,
    column_spec: &ColumnSpec,
) -> Result<Column, ConformanceError> {
    let k = column_spec.k;
    let column = match column_spec.kind {
        ColumnKind::Int64 => Column::from_i64(
            (0..rows)
                .map(|_| i64::from(rng.random_range(0..k)))
                .collect(),
        ),
        ColumnKind::Float64 => Column::from_f64(
            (0..rows)
                .map(|_| f64::from(k) * rng.random::<f64>())
                .collect(),
        ),
        ColumnKind::Utf8 => {
            let labels = label_strings(k as usize);
            let picks: Vec<usize> = (0..rows)
                .map(|_| rng.random_range(0..k) as usize)
                .collect();
            Column::from_strings(picks.into_iter().map(|pick| labels[pick].as_str()))?
        }
    };
    Ok(column)
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

/// Groups as computed by the oracle, in first-occurrence order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleGroups {
    pub keys: Vec<Scalar>,
    pub values: Vec<Scalar>,
}

/// Quadratic reference aggregation over plain scalars.
///
/// Keys compare with [`Scalar::semantic_eq`] (NaN equals NaN, `-0.0`
/// equals `0.0`). Sums fold in row order.
pub fn brute_force_aggregate(
    keys: &[Scalar],
    values: &[Scalar],
    func: AggFunc,
) -> Result<OracleGroups, ConformanceError> {
    if keys.len() != values.len() {
        return Err(GroupByError::ColumnLengthMismatch {
            key_len: keys.len(),
            value_len: values.len(),
        }
        .into());
    }

    let mut group_keys: Vec<Scalar> = Vec::new();
    let mut members: Vec<Vec<&Scalar>> = Vec::new();
    for (key, value) in keys.iter().zip(values) {
        match group_keys.iter().position(|seen| seen.semantic_eq(key)) {
            Some(group) => members[group].push(value),
            None => {
                group_keys.push(key.clone());
                members.push(vec![value]);
            }
        }
    }

    let values = members
        .iter()
        .enumerate()
        .map(|(group, rows)| oracle_reduce(group, rows, func))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OracleGroups {
        keys: group_keys,
        values,
    })
}

fn oracle_reduce(
    group: usize,
    rows: &[&Scalar],
    func: AggFunc,
) -> Result<Scalar, ConformanceError> {
    if func == AggFunc::Count {
        return Ok(Scalar::Int64(rows.len() as i64));
    }

    let all_ints = rows.iter().all(|value| matches!(value, Scalar::Int64(_)));
    if all_ints {
        let ints = rows.iter().filter_map(|value| match value {
            Scalar::Int64(v) => Some(*v),
            _ => None,
        });
        return match func {
            AggFunc::Sum => {
                let total: i128 = ints.map(i128::from).sum();
                i64::try_from(total)
                    .map(Scalar::Int64)
                    .map_err(|_| ConformanceError::OracleOverflow { group })
            }
            AggFunc::Min => Ok(Scalar::Int64(ints.min().unwrap_or(i64::MAX))),
            AggFunc::Max => Ok(Scalar::Int64(ints.max().unwrap_or(i64::MIN))),
            AggFunc::Mean => {
                let total: f64 = ints.fold(0.0, |acc, v| acc + v as f64);
                Ok(Scalar::Float64(total / rows.len() as f64))
            }
            AggFunc::Count => Ok(Scalar::Int64(rows.len() as i64)),
        };
    }

    let floats = rows
        .iter()
        .map(|value| value.to_f64())
        .collect::<Result<Vec<f64>, _>>()?;
    let out = match func {
        AggFunc::Sum => floats.iter().fold(0.0, |acc, v| acc + v),
        // NaN seed: min/max skip NaN, so a NaN-only group stays NaN.
        AggFunc::Min => floats.iter().fold(f64::NAN, |acc, &v| acc.min(v)),
        AggFunc::Max => floats.iter().fold(f64::NAN, |acc, &v| acc.max(v)),
        AggFunc::Mean => floats.iter().fold(0.0, |acc, v| acc + v) / floats.len() as f64,
        AggFunc::Count => floats.len() as f64,
    };
    Ok(Scalar::Float64(out))
}

// ---------------------------------------------------------------------------
// Fixture execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FixtureReport {
    pub name: String,
    pub func: String,
    pub rows: usize,
    pub groups: usize,
    pub strategy: String,
    pub shards: usize,
    pub passed: bool,
    pub mismatches: Vec<String>,
    pub ledger: ExecutionLedger,
}

/// Generate the fixture frame, aggregate it with the engine and compare to
/// the oracle. Keys must match exactly and in order; values match exactly
/// except float aggregates under a sharded run, which use
/// [`SHARDED_FLOAT_TOLERANCE`].
pub fn run_fixture(fixture: &FixtureSpec) -> Result<FixtureReport, ConformanceError> {
    let frame = generate_frame(fixture)?;
    let func = AggFunc::from(fixture.func);

    let mut ledger = ExecutionLedger::new();
    let grouped = groupby_with_policy(&frame, KEY_COLUMN, &fixture.policy, &mut ledger)?;
    let result = grouped.aggregate_with_ledger(VALUE_COLUMN, func, &mut ledger)?;

    let oracle = brute_force_aggregate(
        &frame.require_column(KEY_COLUMN)?.to_scalars(),
        &frame.require_column(VALUE_COLUMN)?.to_scalars(),
        func,
    )?;

    let shards = grouped.index().shards();
    let exact_values = fixture.policy.shard_count(fixture.rows) == 1;
    let mut mismatches = Vec::new();
    compare_scalars("key", &result.keys().to_scalars(), &oracle.keys, true, &mut mismatches);
    compare_scalars(
        "value",
        &result.values().to_scalars(),
        &oracle.values,
        exact_values,
        &mut mismatches,
    );

    let passed = mismatches.is_empty();
    if passed {
        debug!(fixture = %fixture.name, groups = result.len(), shards, "fixture passed");
    } else {
        warn!(
            fixture = %fixture.name,
            mismatches = mismatches.len(),
            first = %mismatches[0],
            "fixture failed"
        );
    }

    Ok(FixtureReport {
        name: fixture.name.clone(),
        func: func.name().to_owned(),
        rows: frame.len(),
        groups: grouped.group_count(),
        strategy: grouped.index().strategy().name().to_owned(),
        shards,
        passed,
        mismatches,
        ledger,
    })
}

fn compare_scalars(
    label: &str,
    actual: &[Scalar],
    expected: &[Scalar],
    exact: bool,
    mismatches: &mut Vec<String>,
) {
    if actual.len() != expected.len() {
        mismatches.push(format!(
            "{label} count: engine produced {}, oracle produced {}",
            actual.len(),
            expected.len()
        ));
        return;
    }
    for (position, (got, want)) in actual.iter().zip(expected).enumerate() {
        if mismatches.len() >= MAX_REPORTED_MISMATCHES {
            return;
        }
        if !scalars_match(got, want, exact) {
            mismatches.push(format!("{label}[{position}]: engine {got}, oracle {want}"));
        }
    }
}

fn scalars_match(got: &Scalar, want: &Scalar, exact: bool) -> bool {
    match (got, want) {
        (Scalar::Float64(a), Scalar::Float64(b)) if !exact && a.is_finite() && b.is_finite() => {
            (a - b).abs() <= SHARDED_FLOAT_TOLERANCE * a.abs().max(b.abs()).max(1.0)
        }
        _ => got.semantic_eq(want),
    }
}

// ---------------------------------------------------------------------------
// Suites
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteReport {
    pub fixture_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub reports: Vec<FixtureReport>,
}

impl SuiteReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0
    }
}

/// Run every fixture under `config.fixture_root`, optionally only the ones
/// whose name contains `name_filter`.
pub fn run_suite(
    config: &HarnessConfig,
    name_filter: Option<&str>,
) -> Result<SuiteReport, ConformanceError> {
    let fixtures = load_fixtures(config, name_filter)?;
    let reports = fixtures
        .iter()
        .map(run_fixture)
        .collect::<Result<Vec<_>, _>>()?;
    let passed = reports.iter().filter(|report| report.passed).count();
    Ok(SuiteReport {
        fixture_count: reports.len(),
        passed,
        failed: reports.len() - passed,
        reports,
    })
}

/// Load fixtures from every `*.json` file under the fixture root. Each file
/// holds an array of fixture specs.
pub fn load_fixtures(
    config: &HarnessConfig,
    name_filter: Option<&str>,
) -> Result<Vec<FixtureSpec>, ConformanceError> {
    let mut fixtures = Vec::new();
    for path in list_fixture_files(&config.fixture_root)? {
        for fixture in load_fixture_file(&path)? {
            if name_filter.is_none_or(|filter| fixture.name.contains(filter)) {
                fixtures.push(fixture);
            }
        }
    }
    fixtures.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(fixtures)
}

pub fn load_fixture_file(path: &Path) -> Result<Vec<FixtureSpec>, ConformanceError> {
    let body = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

fn list_fixture_files(root: &Path) -> Result<Vec<PathBuf>, ConformanceError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}
