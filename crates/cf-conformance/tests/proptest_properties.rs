#![forbid(unsafe_code)]

//! Property-based checks for grouping and grouped reduction.
//!
//! Inputs are small random key/value columns; every property is checked
//! against either the brute-force oracle or a second engine configuration
//! that must agree with the first.

use proptest::prelude::*;

use cf_columnar::Column;
use cf_conformance::{
    ColumnKind, ColumnSpec, FixtureFunc, FixtureSpec, brute_force_aggregate, label_strings,
    run_fixture,
};
use cf_frame::Frame;
use cf_groupby::{
    AggFunc, GroupByError, GroupByExecutionOptions, GroupingIndex, KeyEncoder, groupby,
    groupby_with_options,
};
use cf_runtime::{ExecutionLedger, RuntimePolicy};

// ---------------------------------------------------------------------------
// Strategy generators
// ---------------------------------------------------------------------------

/// Integer keys from a small range (so rows actually share groups) paired
/// with integer values of the same length.
fn arb_int_rows(max_len: usize) -> impl Strategy<Value = (Vec<i64>, Vec<i64>)> {
    (0..=max_len).prop_flat_map(|len| {
        (
            proptest::collection::vec(-5i64..5, len),
            proptest::collection::vec(-1_000_000i64..1_000_000, len),
        )
    })
}

/// Integer keys paired with float values.
fn arb_float_rows(max_len: usize) -> impl Strategy<Value = (Vec<i64>, Vec<f64>)> {
    (0..=max_len).prop_flat_map(|len| {
        (
            proptest::collection::vec(0i64..8, len),
            proptest::collection::vec(-1e6_f64..1e6_f64, len),
        )
    })
}

/// Keys drawn from a possibly wide range, so both the slot-table and the
/// hash-table strategies get exercised.
fn arb_sparse_keys(max_len: usize) -> impl Strategy<Value = Vec<i64>> {
    prop_oneof![
        proptest::collection::vec(0i64..16, 0..=max_len),
        proptest::collection::vec(-1_000_000_000i64..1_000_000_000, 0..=max_len),
    ]
}

fn int_frame(keys: &[i64], values: &[i64]) -> Frame {
    Frame::new(vec![
        ("key".to_owned(), Column::from_i64(keys.to_vec())),
        ("value".to_owned(), Column::from_i64(values.to_vec())),
    ])
    .expect("int frame")
}

fn label_frame(keys: &[i64], values: &[i64]) -> Frame {
    let labels = label_strings(10);
    let key_column = Column::from_strings(keys.iter().map(|&k| labels[(k + 5) as usize].as_str()))
        .expect("label column");
    Frame::new(vec![
        ("key".to_owned(), key_column),
        ("value".to_owned(), Column::from_i64(values.to_vec())),
    ])
    .expect("label frame")
}

fn sharded(max_shards: usize) -> RuntimePolicy {
    RuntimePolicy::parallel(Some(max_shards)).with_min_rows_per_shard(1)
}

// ---------------------------------------------------------------------------
// Property: grouping index invariants
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Every row maps to the group holding its own key.
    #[test]
    fn prop_every_row_maps_to_its_key(keys in arb_sparse_keys(60)) {
        let column = Column::from_i64(keys.clone());
        let encoder = KeyEncoder::new(&column);
        let index = GroupingIndex::build(
            &encoder,
            &GroupByExecutionOptions::default(),
            &RuntimePolicy::sequential(),
        );
        prop_assert_eq!(index.len(), keys.len());
        for (row, &group) in index.group_of_row().iter().enumerate() {
            prop_assert_eq!(index.distinct_keys()[group], keys[row]);
        }
    }

    /// 1 <= G <= N for non-empty input, G == 0 exactly when N == 0, and
    /// distinct keys are unique.
    #[test]
    fn prop_group_count_bounds(keys in arb_sparse_keys(60)) {
        let column = Column::from_i64(keys.clone());
        let index = GroupingIndex::build(
            &KeyEncoder::new(&column),
            &GroupByExecutionOptions::default(),
            &RuntimePolicy::sequential(),
        );
        let groups = index.group_count();
        prop_assert!(groups <= keys.len());
        prop_assert_eq!(groups == 0, keys.is_empty());

        let distinct = index.distinct_keys();
        for (i, key) in distinct.iter().enumerate() {
            prop_assert!(!distinct[..i].contains(key), "duplicate key {}", key);
        }
        let sizes: i64 = index.group_sizes().iter().sum();
        prop_assert_eq!(sizes as usize, keys.len());
    }

    /// Slot-table and hash-table grouping produce the same index.
    #[test]
    fn prop_dense_and_hashed_agree(keys in arb_sparse_keys(60)) {
        let column = Column::from_i64(keys);
        let encoder = KeyEncoder::new(&column);
        let policy = RuntimePolicy::sequential();
        let default = GroupingIndex::build(&encoder, &GroupByExecutionOptions::default(), &policy);
        let hashed = GroupingIndex::build(
            &encoder,
            &GroupByExecutionOptions {
                dense_key_span_limit: 0,
                ..GroupByExecutionOptions::default()
            },
            &policy,
        );
        prop_assert_eq!(default.group_of_row(), hashed.group_of_row());
        prop_assert_eq!(default.distinct_keys(), hashed.distinct_keys());
    }

    /// Sharded index construction preserves first-occurrence group order.
    #[test]
    fn prop_sharded_index_matches_sequential(keys in arb_sparse_keys(80), shards in 1usize..7) {
        let column = Column::from_i64(keys);
        let encoder = KeyEncoder::new(&column);
        let options = GroupByExecutionOptions::default();
        let sequential = GroupingIndex::build(&encoder, &options, &RuntimePolicy::sequential());
        let parallel = GroupingIndex::build(&encoder, &options, &sharded(shards));
        prop_assert_eq!(sequential.group_of_row(), parallel.group_of_row());
        prop_assert_eq!(sequential.distinct_keys(), parallel.distinct_keys());
    }
}

// ---------------------------------------------------------------------------
// Property: reduction invariants
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Per-group sums equal a brute-force scan.
    #[test]
    fn prop_sum_matches_brute_force((keys, values) in arb_int_rows(100)) {
        let frame = int_frame(&keys, &values);
        let result = groupby(&frame, "key")
            .expect("groupby")
            .reduce("value")
            .expect("reduce");

        let oracle = brute_force_aggregate(
            &Column::from_i64(keys).to_scalars(),
            &Column::from_i64(values).to_scalars(),
            AggFunc::Sum,
        )
        .expect("oracle");
        prop_assert_eq!(result.keys().to_scalars(), oracle.keys);
        prop_assert_eq!(result.values().to_scalars(), oracle.values);
    }

    /// Count, min, max and mean agree with the oracle too.
    #[test]
    fn prop_other_reducers_match_brute_force((keys, values) in arb_int_rows(60)) {
        let frame = int_frame(&keys, &values);
        let grouped = groupby(&frame, "key").expect("groupby");
        let key_scalars = Column::from_i64(keys).to_scalars();
        let value_scalars = Column::from_i64(values).to_scalars();
        for func in [AggFunc::Count, AggFunc::Min, AggFunc::Max, AggFunc::Mean] {
            let result = grouped.aggregate("value", func).expect("aggregate");
            let oracle = brute_force_aggregate(&key_scalars, &value_scalars, func).expect("oracle");
            prop_assert_eq!(result.values().to_scalars(), oracle.values, "func {}", func);
        }
    }

    /// Grouping by integer keys or by the equivalent labels yields the same
    /// sums in the same group order.
    #[test]
    fn prop_key_type_does_not_change_sums((keys, values) in arb_int_rows(80)) {
        let by_int = int_frame(&keys, &values);
        let by_label = label_frame(&keys, &values);
        let int_result = groupby(&by_int, "key").expect("int").reduce("value").expect("int sum");
        let label_result = groupby(&by_label, "key")
            .expect("label")
            .reduce("value")
            .expect("label sum");

        prop_assert_eq!(int_result.values(), label_result.values());

        let labels = label_strings(10);
        let expected_labels: Vec<String> = int_result
            .keys()
            .as_i64()
            .expect("int keys")
            .iter()
            .map(|&k| labels[(k + 5) as usize].clone())
            .collect();
        let actual_labels: Vec<String> = label_result
            .keys()
            .to_scalars()
            .iter()
            .filter_map(|scalar| scalar.as_str().map(str::to_owned))
            .collect();
        prop_assert_eq!(actual_labels, expected_labels);
    }

    /// Repeated sequential runs over float values are bit-identical.
    #[test]
    fn prop_sequential_float_sums_are_deterministic((keys, values) in arb_float_rows(100)) {
        let frame = Frame::new(vec![
            ("key".to_owned(), Column::from_i64(keys)),
            ("value".to_owned(), Column::from_f64(values)),
        ])
        .expect("frame");
        let first = groupby(&frame, "key").expect("g1").reduce("value").expect("r1");
        let second = groupby(&frame, "key").expect("g2").reduce("value").expect("r2");
        let bits = |column: &Column| -> Vec<u64> {
            column.as_f64().expect("float output").iter().map(|v| v.to_bits()).collect()
        };
        prop_assert_eq!(bits(first.values()), bits(second.values()));
    }

    /// Integer sums and group order are identical under any shard count.
    #[test]
    fn prop_parallel_int_sums_match_sequential(
        (keys, values) in arb_int_rows(120),
        shards in 1usize..7,
    ) {
        let frame = int_frame(&keys, &values);
        let sequential = groupby(&frame, "key").expect("seq").reduce("value").expect("seq sum");

        let mut ledger = ExecutionLedger::new();
        let parallel = groupby_with_options(
            &frame,
            "key",
            &sharded(shards),
            GroupByExecutionOptions::default(),
            Some(&mut ledger),
        )
        .expect("par")
        .reduce("value")
        .expect("par sum");

        prop_assert_eq!(sequential, parallel);
        prop_assert_eq!(ledger.len(), 1);
    }

    /// A value column of a different length is rejected.
    #[test]
    fn prop_length_mismatch_is_rejected((keys, values) in arb_int_rows(40), extra in 1usize..5) {
        let frame = int_frame(&keys, &values);
        let grouped = groupby(&frame, "key").expect("groupby");
        let mut longer = values.clone();
        longer.extend(std::iter::repeat_n(0, extra));
        let err = grouped
            .aggregate_column("longer", &Column::from_i64(longer), AggFunc::Sum)
            .expect_err("mismatch");
        prop_assert_eq!(
            err,
            GroupByError::ColumnLengthMismatch {
                key_len: keys.len(),
                value_len: keys.len() + extra,
            }
        );
    }
}

// ---------------------------------------------------------------------------
// Property: generated fixtures
// ---------------------------------------------------------------------------

fn arb_column_kind() -> impl Strategy<Value = ColumnKind> {
    prop_oneof![
        Just(ColumnKind::Int64),
        Just(ColumnKind::Float64),
        Just(ColumnKind::Utf8),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any seed, size and key kind produces a frame the engine aggregates the
    /// same way the oracle does.
    #[test]
    fn prop_generated_fixtures_pass(
        seed in any::<u64>(),
        rows in 0usize..300,
        key_k in 1u32..40,
        key_kind in arb_column_kind(),
        numeric_values in any::<bool>(),
        shards in 1usize..5,
    ) {
        let fixture = FixtureSpec {
            name: format!("generated_{seed}"),
            rows,
            key: ColumnSpec { k: key_k, kind: key_kind },
            value: ColumnSpec {
                k: 50,
                kind: if numeric_values { ColumnKind::Int64 } else { ColumnKind::Float64 },
            },
            seed,
            func: FixtureFunc::Sum,
            policy: sharded(shards),
        };
        let report = run_fixture(&fixture).expect("report");
        prop_assert!(report.passed, "{:?}", report.mismatches);
    }
}
