use std::sync::Arc;
use std::time::Duration;

use nova_config::TraceConfig;
use nova_stream_debug::fake_vm::{FakeProgram, FakeVm, MAIN_THREAD};
use nova_stream_debug::{
    ChainTrace, DebugTarget, EvaluationContext, StreamChain, TraceFailure, TraceManager,
    TraceReport, TraceRequest, TraceState, TracerOptions,
};
use tokio::sync::mpsc;

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// A fake debuggee with a trace manager attached to it.
pub struct Traced {
    pub vm: FakeVm,
    pub program: FakeProgram,
    manager: TraceManager,
}

/// Everything the callback saw for one trace, ending with its final report.
#[derive(Debug)]
pub struct Reports {
    pub setup_failures: Vec<String>,
    pub last: TraceReport,
}

impl Reports {
    #[track_caller]
    pub fn evaluated(self) -> (ChainTrace, EvaluationContext) {
        match self.last {
            TraceReport::Evaluated { result, context } => (result, context),
            other => panic!("expected the chain to be traced, got {other:?}"),
        }
    }

    #[track_caller]
    pub fn failed(self) -> (String, TraceFailure) {
        match self.last {
            TraceReport::Failed {
                expression,
                failure,
            } => (expression, failure),
            other => panic!("expected the trace to fail, got {other:?}"),
        }
    }
}

pub fn attach(program: FakeProgram) -> Traced {
    attach_with(program, TraceConfig::default())
}

pub fn attach_with(program: FakeProgram, config: TraceConfig) -> Traced {
    let vm = FakeVm::launch(program.clone());
    let target: Arc<dyn DebugTarget> = Arc::new(vm.clone());
    let options = TracerOptions::new(config).with_bytecode(Arc::new(FakeVm::helper_bytecode()));
    let manager = TraceManager::spawn(target, options);
    Traced {
        vm,
        program,
        manager,
    }
}

impl Traced {
    /// Traces the chain the program evaluates.
    pub async fn trace(&self) -> Reports {
        self.trace_chain(self.program.chain()).await
    }

    pub async fn trace_chain(&self, chain: StreamChain) -> Reports {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.manager
            .trace(TraceRequest {
                chain,
                thread: MAIN_THREAD,
                callback: Arc::new(tx),
            })
            .expect("trace manager accepts requests");

        let mut setup_failures = Vec::new();
        loop {
            let report = tokio::time::timeout(REPORT_TIMEOUT, rx.recv())
                .await
                .expect("timed out waiting for a trace report")
                .expect("callback dropped without a final report");
            match report {
                TraceReport::SetupFailed(message) => setup_failures.push(message),
                last => {
                    return Reports {
                        setup_failures,
                        last,
                    }
                }
            }
        }
    }

    pub fn state(&self) -> TraceState {
        self.manager.state()
    }

    /// Stops the manager once the running trace has cleaned up after itself.
    pub async fn finish(self) -> FakeVm {
        tokio::time::timeout(REPORT_TIMEOUT, self.manager.shutdown())
            .await
            .expect("trace manager did not shut down");
        self.vm
    }
}
