use std::time::Duration;

use nova_config::TraceConfig;
use nova_jdwp::JdwpValue;
use nova_stream_debug::fake_vm::{Element, FakeProgram, Lambda, ProgramStage, ProgramTerminal, MAIN_THREAD};
use nova_stream_debug::{DebugTarget, TerminalPayload, TraceOutcome, TraceValue, TracedValue};
use pretty_assertions::assert_eq;

use crate::harness::{attach, attach_with};

fn string(time: i32, value: &str) -> TracedValue {
    TracedValue {
        time,
        value: TraceValue::String(value.to_string()),
    }
}

fn int(time: i32, value: i32) -> TracedValue {
    TracedValue {
        time,
        value: TraceValue::Int(value),
    }
}

fn upper(element: &Element) -> Element {
    Element::Str(element.as_str().unwrap_or_default().to_uppercase())
}

#[tokio::test]
async fn filter_map_count_records_every_stage() {
    let program = FakeProgram::objects(["a", "bb", "ccc"])
        .stage(ProgramStage::Filter(Lambda::predicate(|e| {
            e.as_str().is_some_and(|s| s.len() > 1)
        })))
        .stage(ProgramStage::Map(Lambda::function(upper)))
        .terminal(ProgramTerminal::Count);
    let traced = attach(program);

    let reports = traced.trace().await;
    assert_eq!(reports.setup_failures, Vec::<String>::new());
    let (trace, context) = reports.evaluated();
    assert_eq!(traced.vm.stalled_invocations(), Vec::<String>::new());

    assert_eq!(context.thread, MAIN_THREAD);
    let calls: Vec<&str> = trace.stages.iter().map(|s| s.call.as_str()).collect();
    assert_eq!(calls, vec!["filter", "map", "count"]);

    let filter = trace.stage("filter").expect("filter stage");
    assert_eq!(filter.before, vec![string(1, "a"), string(2, "bb"), string(5, "ccc")]);
    assert_eq!(filter.after, vec![string(3, "bb"), string(6, "ccc")]);

    let map = trace.stage("map").expect("map stage");
    assert_eq!(map.before, filter.after);
    assert_eq!(map.after, vec![string(4, "BB"), string(7, "CCC")]);

    let count = trace.stage("count").expect("count stage");
    assert_eq!(count.before, map.after);
    assert!(count.after.is_empty());

    assert_eq!(trace.terminal, TerminalPayload::None);
    assert_eq!(trace.outcome, TraceOutcome::Returned(TraceValue::Long(2)));
    assert!(trace.elapsed_ms >= 0);
}

#[tokio::test]
async fn the_program_still_computes_its_own_result() {
    let program = FakeProgram::objects(["a", "bb", "ccc"])
        .stage(ProgramStage::Map(Lambda::function(upper)))
        .terminal(ProgramTerminal::Count);
    let traced = attach(program);

    let (trace, _) = traced.trace().await.evaluated();
    let vm = traced.finish().await;

    assert_eq!(trace.outcome, TraceOutcome::Returned(TraceValue::Long(3)));
    assert!(vm.is_suspended(), "the thread stays suspended after a trace");
    assert_eq!(vm.program_result(), None, "the statement has not completed yet");
    assert_eq!(vm.stalled_invocations(), Vec::<String>::new());

    vm.vm_resume().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while vm.program_result().is_none() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("the statement completes once resumed");
    assert_eq!(vm.program_result(), Some(JdwpValue::Long(3)));
}

#[tokio::test]
async fn parallel_stage_is_switched_back_to_sequential() {
    let program = FakeProgram::ints([1, 2])
        .stage(ProgramStage::Parallel)
        .stage(ProgramStage::Filter(Lambda::predicate(|e| {
            e.as_int().is_some_and(|x| x > 1)
        })))
        .terminal(ProgramTerminal::Count);
    // Only the `parallel()` stage asks for a sequential stream then.
    let config = TraceConfig {
        sequential_source: false,
        ..TraceConfig::default()
    };
    let traced = attach_with(program, config);

    let (trace, _) = traced.trace().await.evaluated();
    let vm = traced.finish().await;

    let sequential = vm
        .invocations()
        .iter()
        .filter(|call| call.contains(".sequential("))
        .count();
    assert_eq!(sequential, 1);

    let parallel = trace.stage("parallel").expect("parallel stage");
    let values = |traced: &[TracedValue]| -> Vec<TraceValue> {
        traced.iter().map(|v| v.value.clone()).collect()
    };
    assert_eq!(values(&parallel.before), vec![TraceValue::Int(1), TraceValue::Int(2)]);
    assert_eq!(values(&parallel.after), values(&parallel.before));
    let filter = trace.stage("filter").expect("filter stage");
    assert_eq!(values(&filter.after), vec![TraceValue::Int(2)]);
    assert_eq!(trace.outcome, TraceOutcome::Returned(TraceValue::Long(1)));
}

#[tokio::test]
async fn any_match_stops_at_the_first_match() {
    let program = FakeProgram::ints([1, 5, 7, 2])
        .terminal(ProgramTerminal::AnyMatch(Lambda::predicate(|e| {
            e.as_int().is_some_and(|x| x > 4)
        })));
    let traced = attach(program);

    let (trace, _) = traced.trace().await.evaluated();

    let any_match = trace.stage("anyMatch").expect("anyMatch stage");
    assert_eq!(any_match.before, vec![int(1, 1), int(2, 5)]);
    assert_eq!(any_match.after, vec![int(3, 5)]);
    assert_eq!(
        trace.terminal,
        TerminalPayload::Match {
            result: TraceValue::Boolean(true)
        }
    );
    assert_eq!(trace.outcome, TraceOutcome::Returned(TraceValue::Boolean(true)));
}

#[tokio::test]
async fn any_match_without_a_match_sees_every_element() {
    let program = FakeProgram::ints([1, 2])
        .terminal(ProgramTerminal::AnyMatch(Lambda::predicate(|_| false)));
    let traced = attach(program);

    let (trace, _) = traced.trace().await.evaluated();

    let any_match = trace.stage("anyMatch").expect("anyMatch stage");
    assert_eq!(any_match.before, vec![int(1, 1), int(2, 2)]);
    assert!(any_match.after.is_empty());
    assert_eq!(
        trace.terminal,
        TerminalPayload::Match {
            result: TraceValue::Boolean(false)
        }
    );
}

#[tokio::test]
async fn find_first_reports_the_optional_content() {
    let program = FakeProgram::objects(["x", "y"]).terminal(ProgramTerminal::FindFirst);
    let traced = attach(program);

    let (trace, _) = traced.trace().await.evaluated();

    let find_first = trace.stage("findFirst").expect("findFirst stage");
    let seen: Vec<&TraceValue> = find_first.before.iter().map(|v| &v.value).collect();
    assert_eq!(seen, vec![&TraceValue::String("x".to_string())]);
    assert_eq!(
        trace.terminal,
        TerminalPayload::Optional {
            present: true,
            value: TraceValue::String("x".to_string()),
        }
    );
    match &trace.outcome {
        TraceOutcome::Returned(TraceValue::Object { type_name, .. }) => {
            assert_eq!(type_name, "java.util.Optional")
        }
        other => panic!("expected an Optional to be returned, got {other:?}"),
    }
}

#[tokio::test]
async fn find_first_on_an_empty_stream_is_absent() {
    let program = FakeProgram::ints(Vec::new()).terminal(ProgramTerminal::FindFirst);
    let traced = attach(program);

    let (trace, _) = traced.trace().await.evaluated();

    assert_eq!(
        trace.terminal,
        TerminalPayload::Optional {
            present: false,
            value: TraceValue::Null,
        }
    );
    assert!(trace.stages.iter().all(|s| s.before.is_empty()));
}

#[tokio::test]
async fn to_list_reports_a_collection_payload() {
    let program = FakeProgram::objects(["a", "b"])
        .stage(ProgramStage::Map(Lambda::function(upper)))
        .terminal(ProgramTerminal::ToList);
    let traced = attach(program);

    let (trace, _) = traced.trace().await.evaluated();

    let to_list = trace.stage("toList").expect("toList stage");
    let seen: Vec<&TraceValue> = to_list.before.iter().map(|v| &v.value).collect();
    assert_eq!(
        seen,
        vec![
            &TraceValue::String("A".to_string()),
            &TraceValue::String("B".to_string())
        ]
    );
    assert!(matches!(trace.terminal, TerminalPayload::Collection { .. }));
    assert!(matches!(trace.outcome, TraceOutcome::Returned(TraceValue::Object { .. })));
}

#[tokio::test]
async fn for_each_is_void() {
    let program = FakeProgram::objects(["a"])
        .stage(ProgramStage::Peek(Lambda::sink()))
        .terminal(ProgramTerminal::ForEach(Lambda::sink()));
    let traced = attach(program);

    let (trace, _) = traced.trace().await.evaluated();

    assert_eq!(trace.outcome, TraceOutcome::Void);
    let peek = trace.stage("peek").expect("peek stage");
    assert_eq!(peek.before.len(), 1);
    assert_eq!(peek.after.len(), 1);
}
