use nova_config::TraceConfig;
use nova_stream_debug::fake_vm::{FakeProgram, Lambda, ProgramStage, ProgramTerminal};
use nova_stream_debug::helpers::{STREAM_DEBUGGER_UTILS, UNIVERSAL_COLLECTOR};
use nova_stream_debug::{ElementType, FailureKey, StreamCall, TraceOutcome, TraceState, TraceValue};
use pretty_assertions::assert_eq;

use crate::harness::{attach, attach_with};

fn three_stage_program() -> FakeProgram {
    FakeProgram::objects(["a", "bb"])
        .stage(ProgramStage::Filter(Lambda::predicate(|_| true)))
        .stage(ProgramStage::Peek(Lambda::sink()))
        .stage(ProgramStage::Filter(Lambda::predicate(|_| true)))
        .terminal(ProgramTerminal::Count)
}

#[tokio::test]
async fn at_most_one_method_request_is_armed_at_a_time() {
    let traced = attach(three_stage_program());

    traced.trace().await.evaluated();
    let vm = traced.finish().await;

    assert!(vm.method_requests_set() >= 8, "entry and exit per stage");
    assert_eq!(vm.max_enabled_method_requests(), 1);
    assert_eq!(vm.active_requests(), 0, "every request is cleared afterwards");
}

#[tokio::test]
async fn pinned_values_are_released_after_the_trace() {
    let traced = attach(three_stage_program());

    traced.trace().await.evaluated();
    let vm = traced.finish().await;

    assert_eq!(vm.pinned_objects(), 0);
}

#[tokio::test]
async fn helper_classes_are_defined_once_per_vm() {
    let program = FakeProgram::objects(["a"])
        .stage(ProgramStage::Map(Lambda::function(Clone::clone)))
        .terminal(ProgramTerminal::Count)
        .repeated(2);
    let traced = attach(program);

    let (first, _) = traced.trace().await.evaluated();
    let (second, _) = traced.trace().await.evaluated();
    let vm = traced.finish().await;

    assert_eq!(first.outcome, TraceOutcome::Returned(TraceValue::Long(1)));
    assert_eq!(second.outcome, first.outcome);
    assert_eq!(second.stages, first.stages, "each trace starts a fresh clock");
    assert_eq!(vm.define_count(STREAM_DEBUGGER_UTILS), 1);
    assert_eq!(vm.define_count(UNIVERSAL_COLLECTOR), 1);
}

#[tokio::test]
async fn unknown_stream_call_cannot_be_placed() {
    let program = FakeProgram::objects(["a"])
        .stage(ProgramStage::Filter(Lambda::predicate(|_| true)))
        .terminal(ProgramTerminal::Count);
    let traced = attach(program);
    let mut chain = traced.program.chain();
    chain.intermediate_calls[0] = StreamCall::new(
        "frobnicate",
        ElementType::Object.stream_type(),
        ["java.util.function.Predicate"],
        Some(ElementType::Object),
        Some(ElementType::Object),
    );

    let (expression, failure) = traced.trace_chain(chain.clone()).await.failed();

    assert_eq!(expression, chain.text);
    assert_eq!(failure.key, FailureKey::CannotFindPlaces);
    assert!(failure.message.contains("frobnicate"), "{failure}");

    let vm = traced.finish().await;
    assert!(vm.is_suspended(), "a trace that never started leaves the thread alone");
    assert_eq!(vm.active_requests(), 0);
}

#[tokio::test]
async fn manager_state_tracks_the_trace() {
    let traced = attach(three_stage_program());
    assert_eq!(traced.state(), TraceState::Idle);

    traced.trace().await.evaluated();

    assert_eq!(traced.state(), TraceState::Completed);
}

#[tokio::test]
async fn helper_types_are_resolved_before_the_chain_runs() {
    let program = FakeProgram::ints([1, 6])
        .stage(ProgramStage::Filter(Lambda::predicate(|_| true)))
        .terminal(ProgramTerminal::AnyMatch(Lambda::predicate(|e| {
            e.as_int().is_some_and(|x| x > 5)
        })));
    let traced = attach(program);

    traced.trace().await.evaluated();
    let vm = traced.finish().await;

    assert_eq!(vm.stalled_invocations(), Vec::<String>::new());
    let defined = vm
        .invocations()
        .iter()
        .filter(|call| call.contains(".defineClass("))
        .count();
    assert!(defined >= 2, "collector and matcher are defined up front");
}

fn mapped_program() -> FakeProgram {
    FakeProgram::objects(["a", "b"])
        .stage(ProgramStage::Map(Lambda::function(Clone::clone)))
        .terminal(ProgramTerminal::Count)
}

#[tokio::test]
async fn rejected_return_substitution_is_reported_and_tracing_goes_on() {
    let traced = attach(mapped_program());
    traced.vm.reject_forced_returns();

    let reports = traced.trace().await;

    assert!(!reports.setup_failures.is_empty());
    assert!(
        reports.setup_failures[0].contains("incompatible thread state"),
        "{:?}",
        reports.setup_failures
    );
    let (trace, _) = reports.evaluated();
    assert_eq!(trace.outcome, TraceOutcome::Returned(TraceValue::Long(2)));
    let map = trace.stage("map").expect("map stage");
    assert!(map.before.is_empty(), "no collector was spliced in");
}

#[tokio::test]
async fn rejected_return_substitution_fails_the_trace_when_configured() {
    let config = TraceConfig {
        fail_on_substitution_error: true,
        ..TraceConfig::default()
    };
    let traced = attach_with(mapped_program(), config);
    traced.vm.reject_forced_returns();

    let reports = traced.trace().await;

    assert_eq!(reports.setup_failures, Vec::<String>::new());
    let (_, failure) = reports.failed();
    assert_eq!(failure.key, FailureKey::CannotInitializeBreakpoints);

    let vm = traced.finish().await;
    assert_eq!(vm.active_requests(), 0);
}
