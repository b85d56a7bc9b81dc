use std::sync::Arc;

use entwine::construct::{
    ObjectArg, ObjectClass, Relationship, RelationshipClass, SelectOptions, Selection,
};
use entwine::error::EntwineError;

struct Fixture {
    node: Arc<ObjectClass>,
    commodity: Arc<ObjectClass>,
    flow: Arc<RelationshipClass>,
}

fn setup() -> Fixture {
    let node = ObjectClass::new("node");
    for name in ["Sthlm", "Dublin", "Nimes", "Espoo", "Leuven"] {
        node.create_object(name);
    }
    let commodity = ObjectClass::new("commodity");
    for name in ["wind", "water", "gas"] {
        commodity.create_object(name);
    }
    let flow = RelationshipClass::new(
        "node__commodity",
        vec!["node".to_string(), "commodity".to_string()],
    )
    .unwrap();
    for (n, c) in [
        ("Dublin", "wind"),
        ("Espoo", "wind"),
        ("Leuven", "wind"),
        ("Nimes", "water"),
        ("Sthlm", "water"),
    ] {
        flow.add_relationship(vec![node.get(n).unwrap(), commodity.get(c).unwrap()])
            .unwrap();
    }
    Fixture {
        node,
        commodity,
        flow,
    }
}

fn names(selection: &Selection) -> Vec<String> {
    match selection {
        Selection::Objects(objects) => objects.iter().map(|o| o.name().to_string()).collect(),
        other => panic!("expected single-component selection, got {other:?}"),
    }
}

#[test]
fn no_filter_returns_raw_rows() {
    let f = setup();
    match f.flow.select(&[], &SelectOptions::default()).unwrap() {
        Selection::Rows(rows) => {
            assert_eq!(rows.len(), 5);
            assert_eq!(rows[0].get("node").unwrap().name(), "Dublin");
            assert_eq!(rows[0].get("commodity").unwrap().name(), "wind");
        }
        other => panic!("expected rows, got {other:?}"),
    }
}

#[test]
fn filter_by_commodity_projects_nodes() {
    let f = setup();
    let water = f.commodity.get("water").unwrap();
    let selection = f
        .flow
        .select(&[("commodity", ObjectArg::One(water))], &SelectOptions::default())
        .unwrap();
    assert_eq!(names(&selection), ["Nimes", "Sthlm"]);
}

#[test]
fn filter_by_several_nodes_deduplicates() {
    let f = setup();
    let dublin = f.node.get("Dublin").unwrap();
    let espoo = f.node.get("Espoo").unwrap();
    let selection = f
        .flow
        .select(
            &[("node", ObjectArg::Many(vec![dublin, espoo]))],
            &SelectOptions::default(),
        )
        .unwrap();
    assert_eq!(names(&selection), ["wind"]);
}

#[test]
fn anything_filter_deduplicates_remaining_dimension() {
    let f = setup();
    let selection = f
        .flow
        .select(&[("node", ObjectArg::Anything)], &SelectOptions::default())
        .unwrap();
    assert_eq!(names(&selection), ["wind", "water"]);
}

#[test]
fn no_match_yields_default() {
    let f = setup();
    let gas = f.commodity.get("gas").unwrap();
    let selection = f
        .flow
        .select(&[("commodity", ObjectArg::One(gas))], &SelectOptions::default())
        .unwrap();
    assert!(selection.is_default());
    // The caller substitutes its own fallback.
    let fallback = Selection::Objects(vec![f.node.get("Sthlm").unwrap()]);
    assert_eq!(selection.or(fallback.clone()), fallback);
}

#[test]
fn unknown_label_is_a_filter_error() {
    let f = setup();
    let err = f
        .flow
        .select(&[("fuel", ObjectArg::Anything)], &SelectOptions::default())
        .unwrap_err();
    match err {
        EntwineError::Filter { key, class } => {
            assert_eq!(key, "fuel");
            assert_eq!(class, "node__commodity");
        }
        other => panic!("expected filter error, got {other}"),
    }
}

#[test]
fn filtered_rows_match_a_naive_linear_scan() {
    let f = setup();
    let water = f.commodity.get("water").unwrap();
    let naive: Vec<Relationship> = f
        .flow
        .relationships()
        .into_iter()
        .filter(|r| r.get("commodity").unwrap().name() == "water")
        .collect();
    match f
        .flow
        .select(
            &[("commodity", ObjectArg::One(water))],
            &SelectOptions { compact: false },
        )
        .unwrap()
    {
        Selection::Rows(rows) => assert_eq!(rows, naive),
        other => panic!("expected rows, got {other:?}"),
    }
}

#[test]
fn compact_equals_deduplicated_projection_of_full_rows() {
    let f = setup();
    let wind = f.commodity.get("wind").unwrap();
    let full = match f
        .flow
        .select(
            &[("commodity", ObjectArg::One(wind.clone()))],
            &SelectOptions { compact: false },
        )
        .unwrap()
    {
        Selection::Rows(rows) => rows,
        other => panic!("expected rows, got {other:?}"),
    };
    let mut projected: Vec<String> = Vec::new();
    for row in &full {
        let name = row.get("node").unwrap().name().to_string();
        if !projected.contains(&name) {
            projected.push(name);
        }
    }
    let compact = f
        .flow
        .select(&[("commodity", ObjectArg::One(wind))], &SelectOptions::default())
        .unwrap();
    assert_eq!(names(&compact), projected);
}

#[test]
fn row_map_finds_every_row_through_each_dimension() {
    let f = setup();
    for row in f.flow.relationships() {
        for label in ["node", "commodity"] {
            let object = row.get(label).unwrap().clone();
            let rows = match f
                .flow
                .select(
                    &[(label, ObjectArg::One(object))],
                    &SelectOptions { compact: false },
                )
                .unwrap()
            {
                Selection::Rows(rows) => rows,
                other => panic!("expected rows, got {other:?}"),
            };
            assert!(
                rows.contains(&row),
                "row {row} not reachable through {label}"
            );
        }
    }
}

#[test]
fn repeated_queries_are_stable_across_the_memo() {
    let f = setup();
    let water = f.commodity.get("water").unwrap();
    let first = f
        .flow
        .select(&[("commodity", ObjectArg::One(water.clone()))], &SelectOptions::default())
        .unwrap();
    let second = f
        .flow
        .select(&[("commodity", ObjectArg::One(water))], &SelectOptions::default())
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn memo_is_invalidated_by_new_rows() {
    let f = setup();
    let gas = f.commodity.get("gas").unwrap();
    let before = f
        .flow
        .select(&[("commodity", ObjectArg::One(gas.clone()))], &SelectOptions::default())
        .unwrap();
    assert!(before.is_default());
    f.flow
        .add_relationship(vec![f.node.get("Leuven").unwrap(), gas.clone()])
        .unwrap();
    let after = f
        .flow
        .select(&[("commodity", ObjectArg::One(gas))], &SelectOptions::default())
        .unwrap();
    assert_eq!(names(&after), ["Leuven"]);
}

#[test]
fn duplicate_rows_are_kept_once() {
    let f = setup();
    let before = f.flow.len();
    f.flow
        .add_relationship(vec![
            f.node.get("Dublin").unwrap(),
            f.commodity.get("wind").unwrap(),
        ])
        .unwrap();
    assert_eq!(f.flow.len(), before);
}

#[test]
fn arity_mismatch_is_an_invariant_error() {
    let f = setup();
    let err = f
        .flow
        .add_relationship(vec![f.node.get("Dublin").unwrap()])
        .unwrap_err();
    assert!(matches!(err, EntwineError::Invariant(_)));
}

#[test]
fn duplicate_dimension_labels_are_rejected_at_construction() {
    let err = RelationshipClass::new(
        "node__node",
        vec!["node".to_string(), "node".to_string()],
    )
    .unwrap_err();
    assert!(matches!(err, EntwineError::Invariant(_)));
}
