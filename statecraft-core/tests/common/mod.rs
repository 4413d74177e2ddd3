//! Shared component types for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use statecraft_core::component::Outcome;
use statecraft_core::{
    AttributeSpec, ChildGroup, ComponentId, ComposedType, DefinitionContext, DefinitionError, DefinitionResult,
    DependencySpec, Dependencies, Engine, EngineConfig, InverseInstruction, InverseResult, MathTree, Registry,
    StateVariableDefinition, UpdateInstruction, UpdateReport, Value,
};
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once. `RUST_LOG` controls the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Definition-call counters, one per instrumented type.
#[derive(Debug, Clone, Default)]
pub struct Calls {
    pub runaway: Arc<AtomicUsize>,
    pub split: Arc<AtomicUsize>,
    pub slow: Arc<AtomicUsize>,
    pub total: Arc<AtomicUsize>,
}

impl Calls {
    pub fn get(counter: &Arc<AtomicUsize>) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

fn fixed_attribute() -> AttributeSpec {
    AttributeSpec::new().state_variable("fixed").default_value(false)
}

fn number(ctx: &DefinitionContext, name: &str) -> Result<f64, DefinitionError> {
    ctx.dependency_values.value(name)?.expect_number()
}

/// Essential number. `number` is an alias of `value`.
pub fn number_type() -> ComposedType {
    ComposedType::new("number")
        .attribute("fixed", fixed_attribute())
        .state_variable("value", StateVariableDefinition::essential(0.0).public())
        .state_variable("number", StateVariableDefinition::alias("value"))
}

/// A math expression: the value of its single math child, or its own
/// essential value.
pub fn math_type() -> ComposedType {
    ComposedType::new("math")
        .attribute("fixed", fixed_attribute())
        .child_group(ChildGroup::new("maths", ["math"]))
        .state_variable(
            "value",
            StateVariableDefinition::new(
                |_| Dependencies::new().with("children", DependencySpec::child(["maths"], ["value"])),
                |ctx| match ctx.dependency_values.components("children")? {
                    [only] => Ok(DefinitionResult::value(only.value("value")?.clone())),
                    _ => Ok(DefinitionResult::use_essential_or_default()),
                },
            )
            .with_essential()
            .with_default(MathTree::blank())
            .with_inverse(|ctx| {
                let instruction = if ctx.dependency_values.components("children")?.len() == 1 {
                    InverseInstruction::set_dependency_at("children", 0, 0, ctx.desired_value.clone())
                } else {
                    InverseInstruction::set_essential("value", ctx.desired_value.clone())
                };
                Ok(InverseResult::success(vec![instruction]))
            })
            .public(),
        )
}

/// A point whose `y` is its partner's `x`. Two partnered points look
/// circular but their variables are not.
pub fn point_type() -> ComposedType {
    ComposedType::new("point")
        .state_variable("x", StateVariableDefinition::essential(0.0).public())
        .state_variable(
            "y",
            StateVariableDefinition::new(
                |_| Dependencies::new().with("partner", DependencySpec::attribute_refs("partner", ["x"])),
                |ctx| match ctx.dependency_values.components("partner")?.first() {
                    Some(partner) => Ok(DefinitionResult::value(partner.value("x")?.clone())),
                    None => Ok(DefinitionResult::use_essential_or_default()),
                },
            )
            .with_default(0.0)
            .with_inverse(|ctx| {
                Ok(InverseResult::success(vec![InverseInstruction::set_dependency_at(
                    "partner",
                    0,
                    0,
                    ctx.desired_value.clone(),
                )]))
            })
            .public(),
        )
}

/// `low = min(high, 5)`, `high = max(low, 3)`: a real cycle with the fixed
/// point 3.
pub fn clamp_type() -> ComposedType {
    ComposedType::new("clamp")
        .state_variable(
            "low",
            StateVariableDefinition::new(
                |_| Dependencies::new().with("high", DependencySpec::state_variable("high")),
                |ctx| Ok(DefinitionResult::value(number(ctx, "high")?.min(5.0))),
            )
            .with_default(0.0),
        )
        .state_variable(
            "high",
            StateVariableDefinition::new(
                |_| Dependencies::new().with("low", DependencySpec::state_variable("low")),
                |ctx| Ok(DefinitionResult::value(number(ctx, "low")?.max(3.0))),
            )
            .with_default(0.0),
        )
}

/// `low = min(high, p)`, `high = max(low, 3)` where `p` is the value of the
/// number named `p`. Settles on `low = min(p, 3)`, `high = 3`.
pub fn bounded_type() -> ComposedType {
    ComposedType::new("bounded")
        .state_variable(
            "low",
            StateVariableDefinition::new(
                |_| {
                    Dependencies::new()
                        .with("high", DependencySpec::state_variable("high"))
                        .with("ceiling", DependencySpec::of("p", "value"))
                },
                |ctx| Ok(DefinitionResult::value(number(ctx, "high")?.min(number(ctx, "ceiling")?))),
            )
            .with_default(0.0)
            .public(),
        )
        .state_variable(
            "high",
            StateVariableDefinition::new(
                |_| Dependencies::new().with("low", DependencySpec::state_variable("low")),
                |ctx| Ok(DefinitionResult::value(number(ctx, "low")?.max(3.0))),
            )
            .with_default(0.0)
            .public(),
        )
}

/// `a = b + 1`, `b = a + 1`: a cycle without a fixed point.
pub fn runaway_type(calls: Arc<AtomicUsize>) -> ComposedType {
    let (a_calls, b_calls) = (calls.clone(), calls);
    ComposedType::new("runaway")
        .state_variable(
            "a",
            StateVariableDefinition::new(
                |_| Dependencies::new().with("b", DependencySpec::state_variable("b")),
                move |ctx| {
                    a_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(DefinitionResult::value(number(ctx, "b")? + 1.0))
                },
            )
            .with_default(0.0),
        )
        .state_variable(
            "b",
            StateVariableDefinition::new(
                |_| Dependencies::new().with("a", DependencySpec::state_variable("a")),
                move |ctx| {
                    b_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(DefinitionResult::value(number(ctx, "a")? + 1.0))
                },
            )
            .with_default(0.0),
        )
}

/// Composite whose replacements are iterations.
pub fn repeat_type() -> ComposedType {
    ComposedType::new("repeat").state_variable(
        "count",
        StateVariableDefinition::new(
            |_| Dependencies::new().with("replacements", DependencySpec::replacements(Vec::<&str>::new())),
            |ctx| {
                let count = ctx.dependency_values.components("replacements")?.len();
                Ok(DefinitionResult::value(count as f64))
            },
        ),
    )
}

/// One iteration of a repeat; `index` is its 1-based position.
pub fn iteration_type() -> ComposedType {
    ComposedType::new("iteration").state_variable(
        "index",
        StateVariableDefinition::new(
            |_| Dependencies::new().with("position", DependencySpec::count_among_siblings(Some("iteration"))),
            |ctx| Ok(DefinitionResult::value(ctx.dependency_values.value("position")?.clone())),
        )
        .public(),
    )
}

/// Integer that takes the index of its enclosing iteration, if any.
pub fn integer_type() -> ComposedType {
    ComposedType::new("integer")
        .attribute("fixed", fixed_attribute())
        .state_variable(
            "value",
            StateVariableDefinition::new(
                |_| Dependencies::new().with("iteration", DependencySpec::parent(["index"]).optional()),
                |ctx| {
                    let index = ctx
                        .dependency_values
                        .component("iteration")?
                        .and_then(|iteration| iteration.get("index"));
                    match index {
                        Some(index) => Ok(DefinitionResult::value(index.clone())),
                        None => Ok(DefinitionResult::use_essential_or_default()),
                    }
                },
            )
            .with_essential()
            .with_default(0.0)
            .with_inverse(|ctx| {
                Ok(InverseResult::success(vec![InverseInstruction::set_essential(
                    "value",
                    ctx.desired_value.clone(),
                )]))
            })
            .public(),
        )
}

/// An answer checked against the `count` component. `creditAchieved` and
/// `justSubmitted` are one essential batch.
pub fn answer_type() -> ComposedType {
    ComposedType::new("answer")
        .state_variable("currentResponse", StateVariableDefinition::essential(Value::Null))
        .state_variable(
            "expectedResponse",
            StateVariableDefinition::new(
                |_| Dependencies::new().with("count", DependencySpec::of("count", "value")),
                |ctx| Ok(DefinitionResult::value(number(ctx, "count")? + 1.0)),
            ),
        )
        .state_variable(
            "creditAchieved",
            StateVariableDefinition::new(
                |_| Dependencies::new(),
                |_| {
                    Ok(DefinitionResult::empty()
                        .with("creditAchieved", Outcome::UseEssentialOrDefault)
                        .with("justSubmitted", Outcome::UseEssentialOrDefault))
                },
            )
            .with_additional(["justSubmitted"])
            .with_essential()
            .with_default(0.0)
            .with_additional_default("justSubmitted", false)
            .with_inverse(|ctx| {
                Ok(InverseResult::success(vec![InverseInstruction::set_essential(
                    ctx.variable.clone(),
                    ctx.desired_value.clone(),
                )]))
            })
            .public(),
        )
}

/// `whole` and `half` computed together from `input`.
pub fn split_type(calls: Arc<AtomicUsize>) -> ComposedType {
    ComposedType::new("split")
        .state_variable("input", StateVariableDefinition::essential(0.0))
        .state_variable(
            "whole",
            StateVariableDefinition::new(
                |_| Dependencies::new().with("input", DependencySpec::state_variable("input")),
                move |ctx| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let input = number(ctx, "input")?;
                    Ok(DefinitionResult::value(input).set("half", input / 2.0))
                },
            )
            .with_additional(["half"])
            .public(),
        )
}

/// `2 * n.value`, computed asynchronously after a short sleep.
pub fn slow_double_type(calls: Arc<AtomicUsize>) -> ComposedType {
    ComposedType::new("slowDouble").state_variable(
        "value",
        StateVariableDefinition::new_async(
            |_| Dependencies::new().with("n", DependencySpec::of("n", "value")),
            move |ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let n = ctx.dependency_values.value("n")?.expect_number()?;
                    Ok::<_, DefinitionError>(DefinitionResult::value(2.0 * n))
                }
                .boxed()
            },
        )
        .with_default(-1.0),
    )
}

/// Definitions that misbehave.
pub fn fragile_type() -> ComposedType {
    ComposedType::new("fragile")
        .state_variable(
            "panics",
            StateVariableDefinition::new(|_| Dependencies::new(), |_| panic!("definition exploded")).with_default(7.0),
        )
        .state_variable(
            "stalls",
            StateVariableDefinition::new_async(
                |_| Dependencies::new(),
                |_| {
                    async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok::<_, DefinitionError>(DefinitionResult::value(1.0))
                    }
                    .boxed()
                },
            )
            .with_default(-1.0),
        )
}

/// A section sums the values of its `items` children.
pub fn section_type(calls: Arc<AtomicUsize>) -> ComposedType {
    ComposedType::new("section")
        .child_group(ChildGroup::new("items", ["number"]))
        .state_variable(
            "total",
            StateVariableDefinition::new(
                |_| Dependencies::new().with("items", DependencySpec::child(["items"], ["value"])),
                move |ctx| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let mut total = 0.0;
                    for item in ctx.dependency_values.components("items")? {
                        total += item.value("value")?.expect_number()?;
                    }
                    Ok(DefinitionResult::value(total))
                },
            )
            .public(),
        )
        .state_variable(
            "numberCount",
            StateVariableDefinition::new(
                |_| {
                    Dependencies::new()
                        .with("numbers", DependencySpec::descendant(["number"], Vec::<&str>::new()).skip_copies())
                },
                |ctx| {
                    let count = ctx.dependency_values.components("numbers")?.len();
                    Ok(DefinitionResult::value(count as f64))
                },
            ),
        )
}

/// A numbered exercise: its position among all exercises in the document.
pub fn exercise_type() -> ComposedType {
    ComposedType::new("exercise").state_variable(
        "ordinal",
        StateVariableDefinition::new(
            |_| Dependencies::new().with("ordinal", DependencySpec::counter("exercise")),
            |ctx| Ok(DefinitionResult::value(ctx.dependency_values.value("ordinal")?.clone())),
        )
        .for_renderer(),
    )
}

pub fn registry(calls: &Calls) -> Arc<Registry> {
    Registry::builder()
        .register(number_type())
        .register(math_type())
        .register(point_type())
        .register(clamp_type())
        .register(bounded_type())
        .register(runaway_type(calls.runaway.clone()))
        .register(repeat_type())
        .register(iteration_type())
        .register(integer_type())
        .register(answer_type())
        .register(split_type(calls.split.clone()))
        .register(slow_double_type(calls.slow.clone()))
        .register(fragile_type())
        .register(section_type(calls.total.clone()))
        .register(exercise_type())
        .build()
        .expect("fixture registry is valid")
}

pub fn engine(config: EngineConfig) -> (Engine, Calls) {
    init_tracing();
    let calls = Calls::default();
    (Engine::new(registry(&calls), config), calls)
}

/// Submit `response` to an answer the way the authoring layer does: one
/// transaction writing the response, the credit and the submitted flag.
pub async fn submit(engine: &Engine, answer: ComponentId, response: f64) -> UpdateReport {
    let expected = engine.evaluate(answer, "expectedResponse").await.unwrap();
    let credit = if expected == Value::Number(response) { 1.0 } else { 0.0 };
    engine
        .perform_update(vec![
            UpdateInstruction::new(answer, "currentResponse", response),
            UpdateInstruction::new(answer, "creditAchieved", credit),
            UpdateInstruction::new(answer, "justSubmitted", true),
        ])
        .await
}
