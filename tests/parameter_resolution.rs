use std::sync::Arc;

use entwine::construct::{
    ClassRef, Entity, ObjectArg, ObjectClass, Parameter, RelationshipClass,
};
use entwine::datatype::{ParameterValue, Scalar};
use entwine::error::EntwineError;
use entwine::evaluate::CallArgs;
use entwine::timeline::Period;

struct Fixture {
    node: Arc<ObjectClass>,
    commodity: Arc<ObjectClass>,
    flow: Arc<RelationshipClass>,
    tax_net_flow: Arc<Parameter>,
}

fn setup() -> Fixture {
    let node = ObjectClass::new("node");
    for name in ["Sthlm", "Dublin", "Nimes"] {
        node.create_object(name);
    }
    let commodity = ObjectClass::new("commodity");
    for name in ["wind", "water"] {
        commodity.create_object(name);
    }
    let flow = RelationshipClass::new(
        "node__commodity",
        vec!["node".to_string(), "commodity".to_string()],
    )
    .unwrap();
    for (n, c) in [("Dublin", "wind"), ("Nimes", "water"), ("Sthlm", "water")] {
        flow.add_relationship(vec![node.get(n).unwrap(), commodity.get(c).unwrap()])
            .unwrap();
    }
    flow.add_parameter_values(
        &[node.get("Sthlm").unwrap(), commodity.get("water").unwrap()],
        vec![("tax_net_flow".to_string(), ParameterValue::real(4.0))],
        false,
    )
    .unwrap();
    let tax_net_flow = Parameter::new("tax_net_flow");
    tax_net_flow.add_class(ClassRef::Relationship(Arc::clone(&flow)));
    Fixture {
        node,
        commodity,
        flow,
        tax_net_flow,
    }
}

#[test]
fn fully_bound_lookup_resolves_the_stored_value() {
    let f = setup();
    let value = f
        .tax_net_flow
        .value(
            &[
                ("node", ObjectArg::One(f.node.get("Sthlm").unwrap())),
                ("commodity", ObjectArg::One(f.commodity.get("water").unwrap())),
            ],
            &CallArgs::default(),
        )
        .unwrap();
    assert_eq!(value, ParameterValue::real(4.0));
}

#[test]
fn unbound_dimensions_are_not_found_when_strict() {
    let f = setup();
    let err = f
        .tax_net_flow
        .value(
            &[("node", ObjectArg::One(f.node.get("Sthlm").unwrap()))],
            &CallArgs::default(),
        )
        .unwrap_err();
    match err {
        EntwineError::NotFound { parameter, args } => {
            assert_eq!(parameter, "tax_net_flow");
            assert!(args.contains("Sthlm"));
        }
        other => panic!("expected not-found, got {other}"),
    }
}

#[test]
fn lenient_lookup_returns_the_supplied_default() {
    let f = setup();
    let value = f.tax_net_flow.value_or(
        &[("fuel", ObjectArg::Anything)],
        &CallArgs::default(),
        ParameterValue::symbol("nogas"),
    );
    assert_eq!(value, ParameterValue::symbol("nogas"));
}

#[test]
fn undefined_entity_resolves_to_nothing() {
    let f = setup();
    let value = f
        .tax_net_flow
        .value(
            &[
                ("node", ObjectArg::One(f.node.get("Dublin").unwrap())),
                ("commodity", ObjectArg::One(f.commodity.get("wind").unwrap())),
            ],
            &CallArgs::default(),
        )
        .unwrap();
    assert!(value.is_nothing());
}

#[test]
fn wildcard_component_resolves_when_unique() {
    let f = setup();
    let value = f
        .tax_net_flow
        .value(
            &[
                ("node", ObjectArg::Anything),
                ("commodity", ObjectArg::One(f.commodity.get("water").unwrap())),
            ],
            &CallArgs::default(),
        )
        .unwrap();
    assert_eq!(value, ParameterValue::real(4.0));
}

#[test]
fn ambiguous_wildcard_resolves_to_nothing_silently() {
    let f = setup();
    f.flow
        .add_parameter_values(
            &[f.node.get("Nimes").unwrap(), f.commodity.get("water").unwrap()],
            vec![("tax_net_flow".to_string(), ParameterValue::real(7.0))],
            false,
        )
        .unwrap();
    let value = f
        .tax_net_flow
        .value(
            &[
                ("node", ObjectArg::Anything),
                ("commodity", ObjectArg::One(f.commodity.get("water").unwrap())),
            ],
            &CallArgs::default(),
        )
        .unwrap();
    assert!(value.is_nothing(), "two stored values match the wildcard");
}

#[test]
fn highest_dimensionality_class_wins() {
    let f = setup();
    // The same parameter also lives on the node class with a different value.
    f.node
        .add_parameter_values(
            &f.node.get("Sthlm").unwrap(),
            vec![("tax_net_flow".to_string(), ParameterValue::real(99.0))],
            false,
        )
        .unwrap();
    f.tax_net_flow
        .add_class(ClassRef::Object(Arc::clone(&f.node)));
    // Binding both dimensions picks the relationship class.
    let value = f
        .tax_net_flow
        .value(
            &[
                ("node", ObjectArg::One(f.node.get("Sthlm").unwrap())),
                ("commodity", ObjectArg::One(f.commodity.get("water").unwrap())),
            ],
            &CallArgs::default(),
        )
        .unwrap();
    assert_eq!(value, ParameterValue::real(4.0));
    // Binding only the node falls through to the object class.
    let value = f
        .tax_net_flow
        .value(
            &[("node", ObjectArg::One(f.node.get("Sthlm").unwrap()))],
            &CallArgs::default(),
        )
        .unwrap();
    assert_eq!(value, ParameterValue::real(99.0));
}

#[test]
fn indices_yield_defined_entities_only() {
    let f = setup();
    let indexed = f.tax_net_flow.indices(&[]);
    assert_eq!(indexed.len(), 1);
    match &indexed[0] {
        Entity::Tuple(relationship) => {
            assert_eq!(relationship.get("node").unwrap().name(), "Sthlm");
            assert_eq!(relationship.get("commodity").unwrap().name(), "water");
        }
        other => panic!("expected a tuple entity, got {other}"),
    }
}

#[test]
fn indices_respect_dimension_constraints() {
    let f = setup();
    let constrained = f.tax_net_flow.indices(&[(
        "node",
        ObjectArg::One(f.node.get("Dublin").unwrap()),
    )]);
    assert!(constrained.is_empty());
}

#[test]
fn indices_as_tuples_label_object_entities_with_their_class() {
    let f = setup();
    f.node
        .add_parameter_values(
            &f.node.get("Dublin").unwrap(),
            vec![("tax_net_flow".to_string(), ParameterValue::real(1.0))],
            false,
        )
        .unwrap();
    f.tax_net_flow
        .add_class(ClassRef::Object(Arc::clone(&f.node)));
    let tuples = f.tax_net_flow.indices_as_tuples(&[]);
    assert_eq!(tuples.len(), 2);
    assert!(tuples
        .iter()
        .any(|t| t.labels() == ["node"] && t.get("node").unwrap().name() == "Dublin"));
}

#[test]
fn maximum_skips_nan_and_ranks_periods_by_upper_bound() {
    let stock = ObjectClass::new("stock");
    let (a, _) = stock.create_object("a");
    let (b, _) = stock.create_object("b");
    let (c, _) = stock.create_object("c");
    stock
        .add_parameter_values(
            &a,
            vec![("horizon".to_string(), ParameterValue::Scalar(Scalar::Real(f64::NAN)))],
            false,
        )
        .unwrap();
    stock
        .add_parameter_values(
            &b,
            vec![(
                "horizon".to_string(),
                ParameterValue::Scalar(Scalar::Period(Period::Days(360))),
            )],
            false,
        )
        .unwrap();
    stock
        .add_parameter_values(
            &c,
            vec![(
                "horizon".to_string(),
                ParameterValue::Scalar(Scalar::Period(Period::Years(1))),
            )],
            false,
        )
        .unwrap();
    let horizon = Parameter::new("horizon");
    horizon.add_class(ClassRef::Object(stock));
    // A year counts as 366 days, above 360 plain days; NaN never wins.
    assert_eq!(horizon.maximum_value(), Some(Scalar::Period(Period::Years(1))));
}

#[test]
fn maximum_recurses_into_containers() {
    let stock = ObjectClass::new("stock");
    let (a, _) = stock.create_object("a");
    stock
        .add_parameter_values(
            &a,
            vec![(
                "levels".to_string(),
                ParameterValue::Array(Arc::new(vec![
                    Scalar::Real(2.0),
                    Scalar::Real(f64::NAN),
                    Scalar::Real(11.0),
                ])),
            )],
            false,
        )
        .unwrap();
    let levels = Parameter::new("levels");
    levels.add_class(ClassRef::Object(stock));
    assert_eq!(levels.maximum_value(), Some(Scalar::Real(11.0)));
}
