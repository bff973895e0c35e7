use nova_stream_debug::fake_vm::{
    Element, FakeProgram, Lambda, LambdaOutcome, ProgramStage, ProgramTerminal,
};
use nova_stream_debug::{FailureKey, TraceOutcome, TraceValue};
use pretty_assertions::assert_eq;

use crate::harness::attach;

#[track_caller]
fn assert_thrown(outcome: &TraceOutcome, exception: &str) {
    match outcome {
        TraceOutcome::Thrown(TraceValue::Object { type_name, .. }) => {
            assert_eq!(type_name, exception)
        }
        other => panic!("expected {exception} to be thrown, got {other:?}"),
    }
}

#[tokio::test]
async fn null_mapper_fails_the_chain_before_any_element_flows() {
    let program = FakeProgram::objects(["a", "b"])
        .stage(ProgramStage::Filter(Lambda::predicate(|_| true)))
        .stage(ProgramStage::MapNull)
        .terminal(ProgramTerminal::Count);
    let traced = attach(program);

    let (trace, _) = traced.trace().await.evaluated();

    assert!(trace.is_thrown());
    assert_thrown(&trace.outcome, "java.lang.NullPointerException");
    for stage in &trace.stages {
        assert!(stage.before.is_empty(), "{} saw elements", stage.call);
        assert!(stage.after.is_empty(), "{} passed elements on", stage.call);
    }
}

#[tokio::test]
async fn exception_thrown_by_a_lambda_ends_the_trace() {
    let program = FakeProgram::objects(["a", "b"])
        .stage(ProgramStage::Map(Lambda::throwing("java.lang.IllegalStateException")))
        .terminal(ProgramTerminal::Count);
    let traced = attach(program);

    let (trace, _) = traced.trace().await.evaluated();

    assert_thrown(&trace.outcome, "java.lang.IllegalStateException");
    let map = trace.stage("map").expect("map stage");
    assert_eq!(map.before.len(), 1, "the second element is never reached");
    assert!(map.after.is_empty());
    let count = trace.stage("count").expect("count stage");
    assert!(count.before.is_empty());
}

#[tokio::test]
async fn exception_handled_inside_a_lambda_is_not_an_outcome() {
    let program = FakeProgram::objects(["a", "b"])
        .stage(ProgramStage::Map(Lambda::new(|_| LambdaOutcome::Throw {
            exception: "java.lang.IllegalStateException".to_string(),
            caught_inside: Some(Element::from("fallback")),
        })))
        .terminal(ProgramTerminal::Count);
    let traced = attach(program);

    let (trace, _) = traced.trace().await.evaluated();

    assert_eq!(trace.outcome, TraceOutcome::Returned(TraceValue::Long(2)));
    let map = trace.stage("map").expect("map stage");
    let produced: Vec<&TraceValue> = map.after.iter().map(|v| &v.value).collect();
    let fallback = TraceValue::String("fallback".to_string());
    assert_eq!(produced, vec![&fallback, &fallback]);
}

#[tokio::test]
async fn exception_replaced_while_unwinding_keeps_the_first_outcome() {
    let program = FakeProgram::objects(["a", "b"])
        .stage(ProgramStage::Map(Lambda::new(|_| LambdaOutcome::ThrowReplaced {
            exception: "java.lang.IllegalStateException".to_string(),
            replaced_by: "java.lang.UnsupportedOperationException".to_string(),
        })))
        .terminal(ProgramTerminal::Count);
    let traced = attach(program);

    let (trace, _) = traced.trace().await.evaluated();
    let vm = traced.finish().await;

    assert_thrown(&trace.outcome, "java.lang.IllegalStateException");
    assert_eq!(vm.active_requests(), 0, "no step request is left behind");
}

#[tokio::test]
async fn vm_exit_during_the_chain_is_reported_as_a_failure() {
    let program = FakeProgram::objects(["a"])
        .stage(ProgramStage::Map(Lambda::new(|_| LambdaOutcome::ExitVm)))
        .terminal(ProgramTerminal::Count);
    let traced = attach(program);
    let expression = traced.program.chain().text;

    let (reported, failure) = traced.trace().await.failed();

    assert_eq!(reported, expression);
    assert_eq!(failure.key, FailureKey::ExceptionDuringExecution);

    // Cleanup against a dead VM must not hang the manager.
    traced.finish().await;
}
