//! Invalidation over chains of arbitrary length.

mod common;

use std::sync::Arc;

use proptest::prelude::*;
use statecraft_core::{
    AttributeValue, ComponentId, ComposedType, DefinitionResult, DependencySpec, Dependencies, Engine, EngineConfig,
    Freshness, NewComponent, Registry, StateVariableDefinition, Value,
};

/// `value` is the previous link's value plus one.
fn link_type() -> ComposedType {
    ComposedType::new("link").state_variable(
        "value",
        StateVariableDefinition::new(
            |_| Dependencies::new().with("previous", DependencySpec::attribute_refs("previous", ["value"])),
            |ctx| match ctx.dependency_values.components("previous")?.first() {
                Some(previous) => Ok(DefinitionResult::value(previous.value("value")?.expect_number()? + 1.0)),
                None => Ok(DefinitionResult::use_essential_or_default()),
            },
        )
        .with_default(0.0)
        .public(),
    )
}

fn chain_registry() -> Arc<Registry> {
    Registry::builder()
        .register(common::number_type())
        .register(link_type())
        .build()
        .unwrap()
}

/// `l0` is a number, `l1..=len` are links each reading the one before.
fn chain(engine: &Engine, len: usize) -> Vec<ComponentId> {
    let mut ids = vec![engine.add_component(NewComponent::new("number").named("l0")).unwrap()];
    for i in 1..=len {
        let previous = format!("l{}", i - 1);
        ids.push(
            engine
                .add_component(
                    NewComponent::new("link")
                        .named(format!("l{i}"))
                        .attribute("previous", AttributeValue::References(vec![previous])),
                )
                .unwrap(),
        );
    }
    ids
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 48, .. ProptestConfig::default() })]

    #[test]
    fn writes_mark_exactly_what_was_read(len in 1usize..12, read in 0usize..12, value in -100i32..100) {
        let read = read.min(len);
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            common::init_tracing();
            let engine = Engine::new(chain_registry(), EngineConfig::default());
            let ids = chain(&engine, len);

            prop_assert_eq!(engine.evaluate(ids[read], "value").await.unwrap(), Value::Number(read as f64));

            let report = engine.set_essential_value(ids[0], "value", value).unwrap();
            prop_assert_eq!(report.len(), read + 1);
            for (i, id) in ids.iter().enumerate() {
                prop_assert_eq!(report.contains(*id, "value"), i <= read);
                prop_assert_eq!(engine.status(*id, "value").unwrap(), Freshness::Stale);
            }

            let last = engine.evaluate(ids[len], "value").await.unwrap();
            prop_assert_eq!(last, Value::Number(f64::from(value) + len as f64));
            Ok(())
        });
        result?;
    }

    #[test]
    fn second_writes_only_reach_recomputed_records(len in 2usize..10, value in -50i32..50) {
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            let engine = Engine::new(chain_registry(), EngineConfig::default());
            let ids = chain(&engine, len);
            engine.evaluate(ids[len], "value").await.unwrap();

            let first = engine.set_essential_value(ids[0], "value", value).unwrap();
            prop_assert_eq!(first.len(), len + 1);

            // Nothing was read in between, so only the root changes state.
            let second = engine.set_essential_value(ids[0], "value", value + 1).unwrap();
            prop_assert_eq!(second.len(), 0);

            prop_assert_eq!(
                engine.evaluate(ids[len], "value").await.unwrap(),
                Value::Number(f64::from(value + 1) + len as f64)
            );
            Ok(())
        });
        result?;
    }
}
