//! Saving and restoring essential values.

mod common;

use indexmap::IndexMap;
use proptest::prelude::*;
use statecraft_core::{ComponentId, Engine, EngineConfig, EngineError, MathTree, NewComponent, SavedState, Value};

fn answer_document(engine: &Engine) -> (ComponentId, ComponentId) {
    let count = engine.add_component(NewComponent::new("number").named("count")).unwrap();
    let answer = engine.add_component(NewComponent::new("answer").named("answer1")).unwrap();
    (count, answer)
}

async fn submitted_engine() -> Engine {
    let (engine, _) = common::engine(EngineConfig::default());
    let (count, answer) = answer_document(&engine);
    engine.set_essential_value(count, "value", 1.0).unwrap();

    let report = common::submit(&engine, answer, 2.0).await;
    assert!(report.success, "{:?}", report.failures);
    assert_eq!(report.applied.len(), 3);
    assert_eq!(engine.evaluate(answer, "creditAchieved").await.unwrap(), Value::Number(1.0));
    assert_eq!(engine.evaluate(answer, "justSubmitted").await.unwrap(), Value::Bool(true));
    engine
}

#[tokio::test]
async fn credit_survives_a_json_round_trip() {
    let engine = submitted_engine().await;
    let json = engine.save_state().to_json().unwrap();

    let (reloaded, _) = common::engine(EngineConfig::default());
    let (_, answer) = answer_document(&reloaded);
    assert_eq!(reloaded.evaluate(answer, "creditAchieved").await.unwrap(), Value::Number(0.0));

    let report = reloaded.restore_state(&SavedState::from_json(&json).unwrap()).unwrap();
    assert!(report.contains(answer, "creditAchieved"));
    assert_eq!(reloaded.evaluate(answer, "creditAchieved").await.unwrap(), Value::Number(1.0));
    assert_eq!(reloaded.evaluate(answer, "justSubmitted").await.unwrap(), Value::Bool(true));
    assert_eq!(reloaded.evaluate(answer, "currentResponse").await.unwrap(), Value::Number(2.0));
    assert_eq!(reloaded.evaluate(answer, "expectedResponse").await.unwrap(), Value::Number(2.0));
}

#[tokio::test]
async fn credit_survives_a_msgpack_round_trip() {
    let engine = submitted_engine().await;
    let bytes = engine.save_state().to_msgpack().unwrap();

    let (reloaded, _) = common::engine(EngineConfig::default());
    let (_, answer) = answer_document(&reloaded);
    reloaded
        .restore_state(&SavedState::from_msgpack(&bytes).unwrap())
        .unwrap();
    assert_eq!(reloaded.evaluate(answer, "creditAchieved").await.unwrap(), Value::Number(1.0));
    assert_eq!(reloaded.save_state(), engine.save_state());
}

#[tokio::test]
async fn saved_values_wait_for_their_components() {
    let engine = submitted_engine().await;
    let saved = engine.save_state();
    assert_eq!(saved.get("answer1", "creditAchieved"), Some(&Value::Number(1.0)));
    assert_eq!(saved.get("count", "value"), Some(&Value::Number(1.0)));

    let (reloaded, _) = common::engine(EngineConfig::default());
    let report = reloaded.restore_state(&saved).unwrap();
    assert!(report.is_empty());

    let (_, answer) = answer_document(&reloaded);
    assert_eq!(reloaded.evaluate(answer, "justSubmitted").await.unwrap(), Value::Bool(true));
    assert_eq!(reloaded.evaluate_named("count", "value").await.unwrap(), Value::Number(1.0));
}

#[tokio::test]
async fn restoring_replaces_every_essential_value() {
    let (engine, _) = common::engine(EngineConfig::default());
    let (count, answer) = answer_document(&engine);
    let empty = engine.save_state();

    engine.set_essential_value(count, "value", 4.0).unwrap();
    common::submit(&engine, answer, 5.0).await;
    assert_eq!(engine.evaluate(answer, "justSubmitted").await.unwrap(), Value::Bool(true));
    assert_eq!(engine.evaluate(answer, "creditAchieved").await.unwrap(), Value::Number(1.0));

    engine.restore_state(&empty).unwrap();
    assert_eq!(engine.peek(answer, "justSubmitted"), None);
    assert_eq!(engine.evaluate(answer, "justSubmitted").await.unwrap(), Value::Bool(false));
    assert_eq!(engine.evaluate(answer, "currentResponse").await.unwrap(), Value::Null);
    assert_eq!(engine.evaluate(answer, "expectedResponse").await.unwrap(), Value::Number(1.0));
}

#[tokio::test]
async fn unsupported_versions_are_refused() {
    let json = r#"{"version": 99, "components": {"count": {"value": {"number": 3.0}}}}"#;
    assert!(SavedState::from_json(json).is_err());

    let (engine, _) = common::engine(EngineConfig::default());
    let (count, _) = answer_document(&engine);
    let saved = SavedState {
        version: 99,
        ..SavedState::default()
    };
    assert!(matches!(engine.restore_state(&saved), Err(EngineError::Persistence(_))));
    assert_eq!(engine.evaluate(count, "value").await.unwrap(), Value::Number(0.0));
}

#[tokio::test]
async fn infinite_values_survive_a_json_round_trip() {
    let (engine, _) = common::engine(EngineConfig::default());
    let (count, _) = answer_document(&engine);
    engine.set_essential_value(count, "value", f64::INFINITY).unwrap();

    let json = engine.save_state().to_json().unwrap();
    assert!(json.contains(r#""Infinity""#), "{json}");

    let (reloaded, _) = common::engine(EngineConfig::default());
    let (count, _) = answer_document(&reloaded);
    reloaded.restore_state(&SavedState::from_json(&json).unwrap()).unwrap();
    assert_eq!(reloaded.evaluate(count, "value").await.unwrap(), Value::Number(f64::INFINITY));
}

fn number() -> impl Strategy<Value = f64> {
    prop_oneof![
        4 => any::<f64>(),
        1 => Just(f64::INFINITY),
        1 => Just(f64::NEG_INFINITY),
        1 => Just(f64::NAN),
    ]
}

fn math() -> impl Strategy<Value = MathTree> {
    let leaf = prop_oneof![number().prop_map(MathTree::Number), "[a-z]{1,3}".prop_map(MathTree::Symbol)];
    leaf.prop_recursive(3, 16, 3, |inner| {
        ("[-+*/^]", prop::collection::vec(inner, 0..3)).prop_map(|(operator, operands)| MathTree::Apply {
            operator,
            operands,
        })
    })
}

fn value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        number().prop_map(Value::Number),
        ".{0,8}".prop_map(Value::String),
        math().prop_map(Value::Math),
    ];
    leaf.prop_recursive(2, 12, 3, |inner| prop::collection::vec(inner, 0..3).prop_map(Value::List))
}

fn same_number(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

fn same_math(a: &MathTree, b: &MathTree) -> bool {
    match (a, b) {
        (MathTree::Number(x), MathTree::Number(y)) => same_number(*x, *y),
        (
            MathTree::Apply { operator, operands },
            MathTree::Apply {
                operator: other_operator,
                operands: other_operands,
            },
        ) => {
            operator == other_operator
                && operands.len() == other_operands.len()
                && operands.iter().zip(other_operands).all(|(x, y)| same_math(x, y))
        }
        _ => a == b,
    }
}

/// Equality with every NaN equal to every other.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => same_number(*x, *y),
        (Value::Math(x), Value::Math(y)) => same_math(x, y),
        (Value::List(xs), Value::List(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| same_value(x, y))
        }
        _ => a == b,
    }
}

fn saved(values: &[Value]) -> SavedState {
    let variables: IndexMap<String, Value> = values
        .iter()
        .enumerate()
        .map(|(i, value)| (format!("v{i}"), value.clone()))
        .collect();
    SavedState {
        components: IndexMap::from([("c".to_string(), variables)]),
        ..SavedState::default()
    }
}

fn same_state(a: &SavedState, b: &SavedState) -> bool {
    a.version == b.version
        && a.components.len() == b.components.len()
        && a.components.iter().zip(&b.components).all(|((name, vars), (other_name, other_vars))| {
            name == other_name
                && vars.len() == other_vars.len()
                && vars
                    .iter()
                    .zip(other_vars)
                    .all(|((v, x), (w, y))| v == w && same_value(x, y))
        })
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn any_value_survives_json(values in prop::collection::vec(value(), 1..4)) {
        let state = saved(&values);
        let json = state.to_json().unwrap();
        let loaded = SavedState::from_json(&json).unwrap();
        prop_assert!(same_state(&state, &loaded), "{json}");
    }

    #[test]
    fn any_value_survives_msgpack(values in prop::collection::vec(value(), 1..4)) {
        let state = saved(&values);
        let loaded = SavedState::from_msgpack(&state.to_msgpack().unwrap()).unwrap();
        prop_assert!(same_state(&state, &loaded), "{:?}", loaded);
    }
}
