use nova_config::TraceConfig;
use nova_stream_debug::fake_vm::{FakeProgram, Lambda, ProgramStage, ProgramTerminal};
use nova_stream_debug::{FailureKey, TraceValue};
use pretty_assertions::assert_eq;

use crate::harness::{attach, attach_with};

/// `numbers` is slot 1 of `Main.run`.
const QUALIFIER_SLOT: u32 = 1;

#[tokio::test]
async fn variable_qualifier_is_replaced_then_restored_once() {
    let program = FakeProgram::ints([3, 4])
        .stage(ProgramStage::Filter(Lambda::predicate(|e| {
            e.as_int().is_some_and(|x| x % 2 == 0)
        })))
        .terminal(ProgramTerminal::Count);
    let traced = attach(program);
    let original = traced.vm.local(QUALIFIER_SLOT).expect("numbers is set");

    let (trace, _) = traced.trace().await.evaluated();
    let vm = traced.finish().await;

    let writes = vm.local_writes(QUALIFIER_SLOT);
    assert_eq!(writes.len(), 2, "one substitution and one restore: {writes:?}");
    assert_ne!(writes[0], original);
    assert_eq!(writes[1], original);
    assert_eq!(vm.local(QUALIFIER_SLOT), Some(original));

    // The source ticker runs on the substituted stream.
    let filter = trace.stage("filter").expect("filter stage");
    let times: Vec<i32> = filter.before.iter().map(|v| v.time).collect();
    assert_eq!(times, vec![1, 2]);
    assert_eq!(filter.after.len(), 1);
    assert_eq!(filter.after[0].value, TraceValue::Int(4));
}

#[tokio::test]
async fn qualifier_is_restored_in_the_invoking_frame_after_a_failure() {
    let program = FakeProgram::ints([3, 4])
        .stage(ProgramStage::Map(Lambda::throwing("java.lang.IllegalStateException")))
        .terminal(ProgramTerminal::Count);
    // Stepping back out of the lambda is refused, so the trace fails while
    // the thread is stopped several frames above `Main.run`.
    let config = TraceConfig {
        max_step_attempts: 0,
        ..TraceConfig::default()
    };
    let traced = attach_with(program, config);
    let original = traced.vm.local(QUALIFIER_SLOT).expect("numbers is set");

    let (_, failure) = traced.trace().await.failed();
    let vm = traced.finish().await;

    assert_eq!(failure.key, FailureKey::ExceptionDuringExecution);
    let writes = vm.local_writes(QUALIFIER_SLOT);
    assert_eq!(writes.len(), 2, "one substitution and one restore: {writes:?}");
    assert_eq!(vm.local(QUALIFIER_SLOT), Some(original));
}

#[tokio::test]
async fn sequential_source_can_be_turned_off() {
    let program = FakeProgram::ints([1, 2]).terminal(ProgramTerminal::Count);
    let config = TraceConfig {
        sequential_source: false,
        ..TraceConfig::default()
    };
    let traced = attach_with(program, config);

    let (trace, _) = traced.trace().await.evaluated();

    assert_eq!(
        trace.outcome,
        nova_stream_debug::TraceOutcome::Returned(TraceValue::Long(2))
    );
}

#[tokio::test]
async fn collection_qualifier_leaves_locals_alone() {
    let program = FakeProgram::objects(["a"]).terminal(ProgramTerminal::Count);
    let traced = attach(program);

    traced.trace().await.evaluated();
    let vm = traced.finish().await;

    assert_eq!(vm.local_writes(QUALIFIER_SLOT), Vec::new());
}
