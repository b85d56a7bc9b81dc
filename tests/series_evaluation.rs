use chrono::{Duration, NaiveDate, NaiveDateTime};

use entwine::datatype::{parameter_value, DbValue, MapKey, ParameterValue, Scalar};
use entwine::evaluate::CallArgs;
use entwine::timeline::TimeSlice;

fn dt(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn slice(start: NaiveDateTime, end: NaiveDateTime) -> TimeSlice {
    TimeSlice::new(start, end, Vec::new()).unwrap()
}

fn real_of(value: &ParameterValue) -> f64 {
    match value {
        ParameterValue::Scalar(Scalar::Real(r)) => *r,
        other => panic!("expected a real, got {other}"),
    }
}

fn demand() -> ParameterValue {
    parameter_value(DbValue::TimeSeries {
        indexes: vec![dt(2000, 1, 1), dt(2000, 1, 2), dt(2000, 1, 3)],
        values: vec![10.0, f64::NAN, 20.0],
        ignore_year: false,
        repeat: false,
    })
    .unwrap()
}

#[test]
fn slice_aggregation_skips_nan() {
    let pv = demand();
    let window = slice(dt(2000, 1, 1), dt(2000, 1, 4));
    let value = pv.call(&CallArgs::new().over(&window), None);
    assert_eq!(real_of(&value), 15.0);
}

#[test]
fn slice_before_the_first_index_is_nothing() {
    let pv = demand();
    let window = slice(dt(1999, 12, 1), dt(1999, 12, 31));
    assert!(pv.call(&CallArgs::new().over(&window), None).is_nothing());
}

#[test]
fn slice_after_the_last_index_is_nothing() {
    let pv = demand();
    let window = slice(dt(2000, 2, 1), dt(2000, 2, 2));
    assert!(pv.call(&CallArgs::new().over(&window), None).is_nothing());
}

#[test]
fn point_lookup_takes_the_preceding_index() {
    let pv = demand();
    // Strictly between the first two indexes: the first value holds.
    let t = dt(2000, 1, 1) + Duration::hours(12);
    assert_eq!(real_of(&pv.call(&CallArgs::new().at(t), None)), 10.0);
    // On an index exactly, that index's value holds.
    assert_eq!(real_of(&pv.call(&CallArgs::new().at(dt(2000, 1, 3)), None)), 20.0);
}

#[test]
fn point_lookup_out_of_range_is_nothing() {
    let pv = demand();
    assert!(pv.call(&CallArgs::new().at(dt(1999, 6, 1)), None).is_nothing());
    assert!(pv.call(&CallArgs::new().at(dt(2000, 2, 1)), None).is_nothing());
}

#[test]
fn no_arguments_return_the_series_itself() {
    let pv = demand();
    assert_eq!(pv.call(&CallArgs::default(), None), pv);
}

#[test]
fn ignore_year_matches_any_year_and_keeps_the_tail() {
    let pv = parameter_value(DbValue::TimeSeries {
        indexes: vec![dt(2000, 1, 1), dt(2000, 1, 2), dt(2000, 1, 3)],
        values: vec![10.0, 20.0, 30.0],
        ignore_year: true,
        repeat: false,
    })
    .unwrap();
    let t = dt(2015, 1, 2) + Duration::hours(6);
    assert_eq!(real_of(&pv.call(&CallArgs::new().at(t), None)), 20.0);
    // Past the last index the cutoff is disabled.
    assert_eq!(real_of(&pv.call(&CallArgs::new().at(dt(2015, 6, 1)), None)), 30.0);
    // Slice aggregation re-anchors the window the same way.
    let window = slice(dt(2023, 1, 1), dt(2023, 1, 4));
    assert_eq!(real_of(&pv.call(&CallArgs::new().over(&window), None)), 20.0);
}

fn repeating() -> ParameterValue {
    parameter_value(DbValue::TimeSeries {
        indexes: vec![dt(2000, 1, 1), dt(2000, 1, 2)],
        values: vec![1.0, 3.0],
        ignore_year: false,
        repeat: true,
    })
    .unwrap()
}

#[test]
fn repeating_slice_two_spans_out_equals_the_first_period() {
    let pv = repeating();
    let start = dt(2000, 1, 1);
    let span = Duration::days(1);
    let shifted = slice(start + span * 2, start + span * 2 + Duration::hours(12));
    let base = slice(start, start + Duration::hours(12));
    let shifted_value = pv.call(&CallArgs::new().over(&shifted), None);
    let base_value = pv.call(&CallArgs::new().over(&base), None);
    assert_eq!(real_of(&shifted_value), real_of(&base_value));
    assert_eq!(real_of(&base_value), 1.0);
}

#[test]
fn repeating_point_lookup_is_span_periodic() {
    let pv = repeating();
    let t = dt(2000, 1, 1) + Duration::hours(6);
    for n in 0..5 {
        let shifted = t + Duration::days(n);
        assert_eq!(
            real_of(&pv.call(&CallArgs::new().at(shifted), None)),
            1.0,
            "lookup at {shifted} should wrap into the first period"
        );
    }
}

#[test]
fn repeating_slice_spanning_periods_uses_the_weighted_mean() {
    let pv = repeating();
    // Tail of period zero, two whole wraps, head of period two:
    // (asum + bsum + (reps - 1) * valsum) / (alen + blen + (reps - 1) * len)
    // = (4 + 1 + 4) / (2 + 1 + 2) = 1.8
    let window = slice(
        dt(2000, 1, 1) + Duration::hours(12),
        dt(2000, 1, 3) + Duration::hours(6),
    );
    let value = pv.call(&CallArgs::new().over(&window), None);
    assert!((real_of(&value) - 1.8).abs() < 1e-12);
}

#[test]
fn array_lookup_is_one_based_and_bounded() {
    let pv = parameter_value(DbValue::List(vec![
        DbValue::Real(4.0),
        DbValue::Real(8.0),
        DbValue::Real(15.0),
    ]))
    .unwrap();
    assert_eq!(real_of(&pv.call(&CallArgs::new().with_i(2), None)), 8.0);
    assert!(pv.call(&CallArgs::new().with_i(0), None).is_nothing());
    assert!(pv.call(&CallArgs::new().with_i(4), None).is_nothing());
    match pv.call(&CallArgs::default(), None) {
        ParameterValue::Array(values) => assert_eq!(values.len(), 3),
        other => panic!("expected the array back, got {other}"),
    }
}

#[test]
fn scalars_and_nothing_ignore_all_arguments() {
    let pv = ParameterValue::real(42.0);
    let window = slice(dt(2000, 1, 1), dt(2000, 1, 2));
    assert_eq!(pv.call(&CallArgs::new().over(&window), None), pv);
    assert!(ParameterValue::Nothing
        .call(&CallArgs::new().with_i(1), None)
        .is_nothing());
}

#[test]
fn symbol_map_descends_by_exact_key() {
    let pv = parameter_value(DbValue::Map(vec![
        (MapKey::Symbol("low".to_string()), DbValue::Real(1.0)),
        (MapKey::Symbol("high".to_string()), DbValue::Real(2.0)),
    ]))
    .unwrap();
    let hit = pv.call(
        &CallArgs::new().with_ind(MapKey::Symbol("high".to_string())),
        None,
    );
    assert_eq!(real_of(&hit), 2.0);
    // A miss falls back to the undescended map.
    let miss = pv.call(
        &CallArgs::new().with_ind(MapKey::Symbol("mid".to_string())),
        None,
    );
    assert_eq!(miss, pv);
}

#[test]
fn timestamp_map_descends_nearest_or_last_and_forwards_time() {
    let inner_a = DbValue::TimeSeries {
        indexes: vec![dt(2000, 1, 1), dt(2000, 1, 2)],
        values: vec![5.0, 6.0],
        ignore_year: false,
        repeat: false,
    };
    let pv = parameter_value(DbValue::Map(vec![
        (MapKey::Timestamp(dt(2000, 1, 1)), inner_a),
        (MapKey::Timestamp(dt(2001, 1, 1)), DbValue::Real(9.0)),
    ]))
    .unwrap();
    // Within the first entry's reign the time query descends and keeps
    // working on the entry.
    let value = pv.call(&CallArgs::new().at(dt(2000, 1, 1)), None);
    assert_eq!(real_of(&value), 5.0);
    // Past the second key the lookup lands on the later entry.
    let value = pv.call(&CallArgs::new().at(dt(2005, 6, 1)), None);
    assert_eq!(real_of(&value), 9.0);
    // Before the first key the position floors to the first entry.
    let value = pv.call(&CallArgs::new().at(dt(1999, 1, 1)), None);
    assert!(value.is_nothing(), "inner series has no value before 2000");
}

#[test]
fn nested_map_chain_of_keys() {
    let pv = parameter_value(DbValue::Map(vec![(
        MapKey::Symbol("scenario".to_string()),
        DbValue::Map(vec![
            (MapKey::Real(1.0), DbValue::Real(10.0)),
            (MapKey::Real(2.0), DbValue::Real(20.0)),
        ]),
    )]))
    .unwrap();
    let value = pv.call(
        &CallArgs::new().with_inds(vec![
            MapKey::Symbol("scenario".to_string()),
            MapKey::Real(1.5),
        ]),
        None,
    );
    // Real keys are nearest-or-last: 1.5 lands on the 1.0 entry.
    assert_eq!(real_of(&value), 10.0);
}

#[test]
fn time_pattern_point_and_slice_means() {
    let pv = parameter_value(DbValue::TimePattern(vec![
        ("M1-4,M9-12".to_string(), 10.0),
        ("M5-8".to_string(), 20.0),
    ]))
    .unwrap();
    let value = pv.call(&CallArgs::new().at(dt(2000, 2, 15)), None);
    assert_eq!(real_of(&value), 10.0);
    let value = pv.call(&CallArgs::new().at(dt(2000, 6, 1)), None);
    assert_eq!(real_of(&value), 20.0);
    // A slice footprint touching both branches averages them.
    let window = slice(dt(2000, 4, 15), dt(2000, 5, 15));
    let value = pv.call(&CallArgs::new().over(&window), None);
    assert_eq!(real_of(&value), 15.0);
}

#[test]
fn time_pattern_without_a_match_is_nothing() {
    let pv = parameter_value(DbValue::TimePattern(vec![("M1-4".to_string(), 10.0)]))
        .unwrap();
    assert!(pv.call(&CallArgs::new().at(dt(2000, 6, 1)), None).is_nothing());
}

#[test]
fn ingestion_rejects_malformed_series() {
    let unsorted = parameter_value(DbValue::TimeSeries {
        indexes: vec![dt(2000, 1, 2), dt(2000, 1, 1)],
        values: vec![1.0, 2.0],
        ignore_year: false,
        repeat: false,
    });
    assert!(unsorted.is_err());
    let mismatched = parameter_value(DbValue::TimeSeries {
        indexes: vec![dt(2000, 1, 1)],
        values: vec![1.0, 2.0],
        ignore_year: false,
        repeat: false,
    });
    assert!(mismatched.is_err());
    let mixed_keys = parameter_value(DbValue::Map(vec![
        (MapKey::Symbol("a".to_string()), DbValue::Real(1.0)),
        (MapKey::Real(1.0), DbValue::Real(2.0)),
    ]));
    assert!(mixed_keys.is_err());
}

#[test]
fn repeating_metadata_is_computed_eagerly() {
    match repeating() {
        ParameterValue::RepeatingTimeSeries(r) => {
            assert_eq!(r.span, Duration::days(1));
            assert_eq!(r.valsum, 4.0);
            assert_eq!(r.len, 2);
        }
        other => panic!("expected a repeating series, got {other}"),
    }
}

#[test]
fn deep_merge_of_map_values() {
    use entwine::datatype::merge_values;
    let old = parameter_value(DbValue::Map(vec![
        (MapKey::Symbol("a".to_string()), DbValue::Real(1.0)),
        (MapKey::Symbol("b".to_string()), DbValue::Real(2.0)),
    ]))
    .unwrap();
    let new = parameter_value(DbValue::Map(vec![
        (MapKey::Symbol("b".to_string()), DbValue::Real(20.0)),
        (MapKey::Symbol("c".to_string()), DbValue::Real(30.0)),
    ]))
    .unwrap();
    let merged = merge_values(&old, new).unwrap();
    let get = |key: &str| {
        real_of(&merged.call(
            &CallArgs::new().with_ind(MapKey::Symbol(key.to_string())),
            None,
        ))
    };
    assert_eq!(get("a"), 1.0);
    assert_eq!(get("b"), 20.0);
    assert_eq!(get("c"), 30.0);
}

#[test]
fn arrays_keep_mixed_scalars() {
    let pv = parameter_value(DbValue::List(vec![
        DbValue::Int(1),
        DbValue::Text("peak".to_string()),
    ]))
    .unwrap();
    assert_eq!(
        pv.call(&CallArgs::new().with_i(1), None),
        ParameterValue::Scalar(Scalar::Int(1))
    );
    assert_eq!(
        pv.call(&CallArgs::new().with_i(2), None),
        ParameterValue::symbol("peak")
    );
}
