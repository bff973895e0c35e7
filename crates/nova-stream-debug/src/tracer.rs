//! The trace state machine and the task that runs it.
//!
//! A [`TraceManager`] owns one background task. Each [`TraceRequest`] is
//! traced to completion before the next queued one starts: placements are
//! resolved, one entry/exit request pair is created per stage (all disabled),
//! and then each hit enables the next request in the chain so that at most one
//! stage is armed at a time.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use nova_config::{StreamDebugConfig, TraceConfig};
use nova_jdwp::wire::{
    CAPABILITY_CAN_FORCE_EARLY_RETURN, EVENT_KIND_EXCEPTION, EVENT_KIND_SINGLE_STEP,
};
use nova_jdwp::{
    FrameInfo, JdwpClient, JdwpClientConfig, JdwpEvent, JdwpValue, Location, ObjectId, ThreadId,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::ValueBridge;
use crate::callback::{EvaluationContext, FailureKey, TraceFailure, TracingCallback};
use crate::chain::{QualifierExpression, StreamChain};
use crate::error::{ErrorCategory, Result, TraceError};
use crate::formatter::{format_trace_result, interpret, ChainTrace, StreamTraceValues};
use crate::handlers::{StageHandler, TraceContext};
use crate::helpers::{
    BytecodeProvider, DirectoryBytecodeProvider, NoBytecode, ATOMIC_INTEGER, LINKED_HASH_MAP,
    STREAM_DEBUGGER_UTILS, UNIVERSAL_COLLECTOR,
};
use crate::requests::{BreakpointFactory, MethodBreakpoint, MethodEventKind};
use crate::resolve::{BreakpointResolver, JdkStreamResolver, StreamChainBreakpointPlaces};
use crate::target::DebugTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceState {
    /// No trace is running.
    Idle,
    PlacingBreakpoints,
    /// Substituting the stream held by the qualifier variable.
    AwaitingQualifierReplacement,
    /// The entry or exit of this stage is armed.
    StageActive(usize),
    /// The terminal returned, or an exception escaped; waiting to get back
    /// to the invoking frame.
    Completing,
    Completed,
    Failed,
}

impl fmt::Display for TraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::PlacingBreakpoints => write!(f, "placing breakpoints"),
            Self::AwaitingQualifierReplacement => write!(f, "awaiting qualifier replacement"),
            Self::StageActive(stage) => write!(f, "stage {stage} active"),
            Self::Completing => write!(f, "completing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Clone)]
pub struct TracerOptions {
    pub trace: TraceConfig,
    pub bytecode: Arc<dyn BytecodeProvider>,
    pub resolver: Arc<dyn BreakpointResolver>,
}

impl TracerOptions {
    /// Helper classes come from `helper_classes_dir` when it is configured.
    pub fn new(trace: TraceConfig) -> Self {
        let bytecode: Arc<dyn BytecodeProvider> = match &trace.helper_classes_dir {
            Some(dir) => Arc::new(DirectoryBytecodeProvider::new(PathBuf::from(dir))),
            None => Arc::new(NoBytecode),
        };
        Self {
            trace,
            bytecode,
            resolver: Arc::new(JdkStreamResolver),
        }
    }

    pub fn with_bytecode(mut self, bytecode: Arc<dyn BytecodeProvider>) -> Self {
        self.bytecode = bytecode;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn BreakpointResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

impl fmt::Debug for TracerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerOptions")
            .field("trace", &self.trace)
            .finish_non_exhaustive()
    }
}

/// A chain to trace on a thread that is suspended in the frame evaluating it.
#[derive(Clone)]
pub struct TraceRequest {
    pub chain: StreamChain,
    pub thread: ThreadId,
    pub callback: Arc<dyn TracingCallback>,
}

enum Command {
    Trace(TraceRequest),
}

pub struct TraceManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<TraceState>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl fmt::Debug for TraceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceManager")
            .field("state", &*self.state.borrow())
            .field("stopped", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl TraceManager {
    /// Starts the manager task on the current tokio runtime.
    pub fn spawn(target: Arc<dyn DebugTarget>, options: TracerOptions) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TraceState::Idle);
        let shutdown = CancellationToken::new();

        let task = ManagerTask {
            target,
            options,
            commands: commands_rx,
            commands_open: true,
            pending: VecDeque::new(),
            state: state_tx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(task.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            shutdown,
            task,
        }
    }

    /// Queues a trace. The outcome is delivered through the request's callback.
    pub fn trace(&self, request: TraceRequest) -> Result<()> {
        self.commands
            .send(Command::Trace(request))
            .map_err(|_| TraceError::ManagerClosed)
    }

    pub fn state(&self) -> TraceState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TraceState> {
        self.state.clone()
    }

    /// Stops the manager. A trace in flight fails; queued traces are dropped.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// Connects to a JVM waiting for a debugger and starts a [`TraceManager`]
/// driving that connection.
pub async fn attach(
    addr: SocketAddr,
    config: &StreamDebugConfig,
) -> Result<(JdwpClient, TraceManager)> {
    let client = JdwpClient::connect_with_config(
        addr,
        JdwpClientConfig {
            handshake_timeout: config.jdwp.handshake_timeout(),
            reply_timeout: config.jdwp.reply_timeout(),
            event_channel_size: config.jdwp.event_channel_size,
        },
    )
    .await?;
    // Every stage transition replaces a returned stream.
    let capabilities = client.capabilities_new().await?;
    if !capabilities
        .get(CAPABILITY_CAN_FORCE_EARLY_RETURN)
        .copied()
        .unwrap_or(false)
    {
        return Err(TraceError::UnsupportedVm("force early returns"));
    }
    tracing::info!(target: "nova.stream_debug", %addr, "attached to debuggee");

    let target: Arc<dyn DebugTarget> = Arc::new(client.clone());
    let manager = TraceManager::spawn(target, TracerOptions::new(config.trace.clone()));
    Ok((client, manager))
}

struct ManagerTask {
    target: Arc<dyn DebugTarget>,
    options: TracerOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    pending: VecDeque<TraceRequest>,
    state: watch::Sender<TraceState>,
    shutdown: CancellationToken,
}

type TraceOutput = std::result::Result<(ChainTrace, EvaluationContext), TraceFailure>;

impl ManagerTask {
    async fn run(mut self) {
        loop {
            let request = match self.pending.pop_front() {
                Some(request) => request,
                None => {
                    if !self.commands_open {
                        break;
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        command = self.commands.recv() => match command {
                            Some(Command::Trace(request)) => request,
                            None => break,
                        },
                    }
                }
            };

            let span = tracing::info_span!(
                target: "nova.stream_debug",
                "stream_trace",
                chain = %request.chain.text,
                thread = request.thread
            );
            self.run_trace(request).instrument(span).await;

            if self.shutdown.is_cancelled() {
                break;
            }
        }
        tracing::debug!(target: "nova.stream_debug", "trace manager stopped");
    }

    async fn run_trace(&mut self, request: TraceRequest) {
        let expression = request.chain.text.clone();
        let callback = request.callback.clone();
        // Subscribe before anything is resumed so no event is missed.
        let mut events = self.target.subscribe_events();

        let mut session = match TraceSession::open(
            self.target.clone(),
            &self.options,
            request,
            self.state.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(failure) => {
                self.report_failure(&expression, callback.as_ref(), &failure);
                return;
            }
        };

        let output = match session.setup().await {
            Ok(()) => self.pump(&mut session, &mut events).await,
            Err(failure) => Err(failure),
        };
        if output.is_err() {
            session.abandon().await;
        }

        match output {
            Ok((trace, context)) => {
                tracing::info!(
                    target: "nova.stream_debug",
                    stages = trace.stages.len(),
                    elapsed_ms = trace.elapsed_ms,
                    "stream trace completed"
                );
                self.state.send_replace(TraceState::Completed);
                callback.evaluated(trace, &context);
            }
            Err(failure) => self.report_failure(&expression, callback.as_ref(), &failure),
        }
        session.dispose().await;
    }

    fn report_failure(
        &self,
        expression: &str,
        callback: &dyn TracingCallback,
        failure: &TraceFailure,
    ) {
        tracing::error!(
            target: "nova.stream_debug",
            key = failure.key.message_key(),
            cause = %failure.message,
            "stream trace failed"
        );
        self.state.send_replace(TraceState::Failed);
        callback.evaluation_failed(expression, failure);
    }

    /// Feeds protocol events to the session until it finishes. Trace commands
    /// arriving meanwhile are queued.
    async fn pump(
        &mut self,
        session: &mut TraceSession,
        events: &mut broadcast::Receiver<JdwpEvent>,
    ) -> TraceOutput {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(TraceFailure {
                        key: FailureKey::ExceptionDuringExecution,
                        message: "trace manager shut down".to_string(),
                    });
                }
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(Command::Trace(request)) => {
                        tracing::debug!(
                            target: "nova.stream_debug",
                            chain = %request.chain.text,
                            "trace queued behind the running one"
                        );
                        self.pending.push_back(request);
                    }
                    None => self.commands_open = false,
                },
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(done) = session.handle_event(event).await? {
                            return Ok(done);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target: "nova.stream_debug",
                            skipped,
                            "stream trace lagged behind JDWP events"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TraceFailure {
                            key: FailureKey::ExceptionDuringExecution,
                            message: "JDWP event stream closed".to_string(),
                        });
                    }
                },
            }
        }
    }
}

/// Types every trace creates or calls into. They are resolved before any
/// request is armed: a class load failing inside `Class.forName` would
/// otherwise raise an exception event on the suspended thread.
const PRELOADED_TYPES: [&str; 6] = [
    ATOMIC_INTEGER,
    LINKED_HASH_MAP,
    UNIVERSAL_COLLECTOR,
    STREAM_DEBUGGER_UTILS,
    "java.lang.Object[]",
    "int[]",
];

/// Breakpoint pair and handler of one stage.
struct StageRuntimeInfo {
    handler: StageHandler,
    entry: MethodBreakpoint,
    exit: MethodBreakpoint,
}

/// The original value of the qualifier variable, restored exactly once.
struct QualifierSubstitution {
    slot: u32,
    original: JdwpValue,
    restored: bool,
}

struct TraceSession {
    target: Arc<dyn DebugTarget>,
    config: TraceConfig,
    resolver: Arc<dyn BreakpointResolver>,
    chain: StreamChain,
    thread: ThreadId,
    callback: Arc<dyn TracingCallback>,
    state: watch::Sender<TraceState>,
    bridge: ValueBridge,
    factory: BreakpointFactory,
    invoking: Location,
    base_depth: i32,
    time: JdwpValue,
    /// Stage 0 is the source when the qualifier is a method call.
    stages: Vec<StageRuntimeInfo>,
    has_source_stage: bool,
    qualifier: Option<QualifierSubstitution>,
    guard: Option<i32>,
    step: Option<i32>,
    step_attempts: u32,
    thrown: Option<ObjectId>,
    started: Instant,
}

fn fail(key: FailureKey) -> impl Fn(TraceError) -> TraceFailure {
    move |err| TraceFailure::new(key, &err)
}

fn running_failure(err: TraceError) -> TraceFailure {
    TraceFailure::new(FailureKey::for_error(&err), &err)
}

impl TraceSession {
    /// Reads the invoking frame; nothing is created in the debuggee yet.
    async fn open(
        target: Arc<dyn DebugTarget>,
        options: &TracerOptions,
        request: TraceRequest,
        state: watch::Sender<TraceState>,
    ) -> std::result::Result<Self, TraceFailure> {
        let init = fail(FailureKey::CannotInitializeBreakpoints);
        let thread = request.thread;
        let frame = top_frame(target.as_ref(), thread)
            .await
            .map_err(&init)?;
        let base_depth = target
            .thread_frame_count(thread)
            .await
            .map_err(|err| init(err.into()))?;

        let bridge = ValueBridge::new(
            target.clone(),
            thread,
            frame.location.class_id,
            options.bytecode.clone(),
            options.trace.invoke_single_threaded,
        );
        let factory = BreakpointFactory::new(target.clone(), thread);

        Ok(Self {
            target,
            config: options.trace.clone(),
            resolver: options.resolver.clone(),
            chain: request.chain,
            thread,
            callback: request.callback,
            state,
            bridge,
            factory,
            invoking: frame.location,
            base_depth,
            time: JdwpValue::NULL,
            stages: Vec::new(),
            has_source_stage: false,
            qualifier: None,
            guard: None,
            step: None,
            step_attempts: 0,
            thrown: None,
            started: Instant::now(),
        })
    }

    fn set_state(&self, state: TraceState) {
        tracing::debug!(target: "nova.stream_debug", %state, "trace state");
        self.state.send_replace(state);
    }

    async fn setup(&mut self) -> std::result::Result<(), TraceFailure> {
        self.set_state(TraceState::PlacingBreakpoints);
        let places = self
            .resolver
            .find_places(&self.chain)
            .map_err(fail(FailureKey::CannotFindPlaces))?;
        let init = fail(FailureKey::CannotInitializeBreakpoints);
        self.create_stages(&places).await.map_err(&init)?;
        self.preload_types().await.map_err(&init)?;
        self.time = TraceContext::new(&self.bridge).await.map_err(&init)?.time;

        if !self.has_source_stage {
            self.set_state(TraceState::AwaitingQualifierReplacement);
            self.replace_qualifier().await.map_err(&init)?;
        }

        self.guard = Some(
            self.factory
                .create_exception_guard()
                .await
                .map_err(&init)?,
        );
        if let Some(first) = self.stages.first_mut() {
            self.factory.enable(&mut first.entry).await.map_err(&init)?;
        }
        self.set_state(TraceState::StageActive(0));

        tracing::debug!(
            target: "nova.stream_debug",
            stages = self.stages.len(),
            base_depth = self.base_depth,
            "breakpoints placed, resuming"
        );
        self.started = Instant::now();
        self.target
            .vm_resume()
            .await
            .map_err(|err| running_failure(err.into()))
    }

    async fn create_stages(&mut self, places: &StreamChainBreakpointPlaces) -> Result<()> {
        let mut handlers = Vec::new();
        if places.qualifier_expression_method.is_some() {
            handlers.push(StageHandler::source(
                self.chain.source_element_type(),
                self.config.sequential_source,
            ));
            self.has_source_stage = true;
        }
        handlers.extend(
            self.chain
                .intermediate_calls
                .iter()
                .map(StageHandler::for_intermediate),
        );
        handlers.push(StageHandler::for_terminal(&self.chain.termination_call));

        for (handler, signature) in handlers.into_iter().zip(places.all()) {
            let entry = self.factory.create_method_entry(signature).await?;
            let exit = self.factory.create_method_exit(signature).await?;
            self.stages.push(StageRuntimeInfo {
                handler,
                entry,
                exit,
            });
        }
        Ok(())
    }

    async fn preload_types(&self) -> Result<()> {
        let matchers = self
            .stages
            .iter()
            .filter_map(|stage| stage.handler.matcher_type());
        for class_name in PRELOADED_TYPES.into_iter().chain(matchers) {
            self.bridge.get_type(class_name).await?;
        }
        Ok(())
    }

    /// Replaces the stream held by the qualifier variable with
    /// `first.before_call(source.after_call(value))`.
    async fn replace_qualifier(&mut self) -> Result<()> {
        let QualifierExpression::Variable { variable_name, .. } = &self.chain.qualifier_expression
        else {
            return Ok(());
        };
        if self.qualifier.is_some() {
            return Err(TraceError::ValueInterception(format!(
                "variable `{variable_name}` was already replaced"
            )));
        }

        let frame = top_frame(self.target.as_ref(), self.thread).await?;
        let (_, variables) = self
            .target
            .method_variable_table(frame.location.class_id, frame.location.method_id)
            .await?;
        let variable = variables
            .iter()
            .find(|v| v.name == *variable_name && v.is_visible_at(frame.location.index))
            .ok_or_else(|| {
                TraceError::ValueInterception(format!(
                    "variable `{variable_name}` is not visible in the current frame"
                ))
            })?;
        let values = self
            .target
            .stack_frame_get_values(
                self.thread,
                frame.frame_id,
                &[(variable.slot, variable.signature.clone())],
            )
            .await?;
        let original = values.first().copied().ok_or_else(|| {
            TraceError::ValueInterception(format!("variable `{variable_name}` has no value"))
        })?;

        let cx = TraceContext {
            bridge: &self.bridge,
            time: self.time,
        };
        let mut source =
            StageHandler::source(self.chain.source_element_type(), self.config.sequential_source);
        let value = source.after_call(&cx, original).await?;
        let value = match self.stages.first_mut() {
            Some(first) => first.handler.before_call(&cx, value).await?,
            None => value,
        };

        self.target
            .stack_frame_set_values(self.thread, frame.frame_id, &[(variable.slot, value)])
            .await
            .map_err(TraceError::substitution)?;
        self.qualifier = Some(QualifierSubstitution {
            slot: variable.slot,
            original,
            restored: false,
        });
        Ok(())
    }

    async fn restore_qualifier(&mut self) -> Result<()> {
        let Some(qualifier) = self.qualifier.as_mut() else {
            return Ok(());
        };
        if qualifier.restored {
            return Ok(());
        }
        qualifier.restored = true;
        let (slot, original) = (qualifier.slot, qualifier.original);

        // The invoking frame sits `base_depth` frames up from the bottom,
        // whatever the tracer stopped in above it.
        let count = self.target.thread_frame_count(self.thread).await?;
        if count < self.base_depth {
            tracing::debug!(target: "nova.stream_debug", "invoking frame is gone, qualifier left as is");
            return Ok(());
        }
        let frame = self
            .target
            .thread_frames(self.thread, count - self.base_depth, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TraceError::Tracing("invoking frame is missing".to_string()))?;
        if !frame.location.same_method(&self.invoking) {
            tracing::debug!(target: "nova.stream_debug", "invoking frame was replaced, qualifier left as is");
            return Ok(());
        }
        self.target
            .stack_frame_set_values(self.thread, frame.frame_id, &[(slot, original)])
            .await
            .map_err(TraceError::substitution)
    }

    /// `Ok(Some(..))` once the trace is complete.
    async fn handle_event(
        &mut self,
        event: JdwpEvent,
    ) -> std::result::Result<Option<(ChainTrace, EvaluationContext)>, TraceFailure> {
        if let Some(thread) = event.thread() {
            if thread != self.thread {
                return Ok(None);
            }
        }

        match event {
            JdwpEvent::VmDeath => Err(TraceFailure {
                key: FailureKey::ExceptionDuringExecution,
                message: "the debuggee terminated".to_string(),
            }),
            JdwpEvent::MethodEntry {
                request_id,
                location,
                ..
            } => {
                self.on_method_event(MethodEventKind::Entry, request_id, location, JdwpValue::Void)
                    .await
                    .map_err(running_failure)?;
                Ok(None)
            }
            JdwpEvent::MethodExitWithReturnValue {
                request_id,
                location,
                value,
                ..
            } => {
                self.on_method_event(MethodEventKind::Exit, request_id, location, value)
                    .await
                    .map_err(running_failure)?;
                Ok(None)
            }
            JdwpEvent::SingleStep { request_id, .. } if self.step == Some(request_id) => {
                self.step = None;
                if let Err(err) = self.factory.clear(EVENT_KIND_SINGLE_STEP, request_id).await {
                    tracing::debug!(target: "nova.stream_debug", error = %err, "step request already gone");
                }
                self.on_paused().await
            }
            JdwpEvent::Exception {
                request_id,
                exception,
                catch_location,
                ..
            } if self.guard == Some(request_id) => {
                if self.step.is_some() {
                    // Already on the way back to the invoking frame.
                    self.resume().await.map_err(running_failure)?;
                    return Ok(None);
                }
                let escapes = self
                    .escapes_pipeline(catch_location)
                    .await
                    .map_err(running_failure)?;
                if !escapes {
                    tracing::trace!(target: "nova.stream_debug", exception, "exception caught inside the pipeline");
                    self.resume().await.map_err(running_failure)?;
                    return Ok(None);
                }

                tracing::debug!(target: "nova.stream_debug", exception, "exception escaped the pipeline");
                self.bridge
                    .keep(JdwpValue::object(exception))
                    .await
                    .map_err(running_failure)?;
                self.thrown = Some(exception);
                // The first escaping exception is the outcome; whatever is
                // thrown while unwinding is not reported.
                if let Some(guard) = self.guard.take() {
                    if let Err(err) = self.factory.clear(EVENT_KIND_EXCEPTION, guard).await {
                        tracing::debug!(target: "nova.stream_debug", error = %err, "exception request already gone");
                    }
                }
                self.set_state(TraceState::Completing);
                self.on_paused().await
            }
            _ => Ok(None),
        }
    }

    async fn on_method_event(
        &mut self,
        kind: MethodEventKind,
        request_id: i32,
        location: Location,
        value: JdwpValue,
    ) -> Result<()> {
        let Some(index) = self.stages.iter().position(|stage| {
            let breakpoint = match kind {
                MethodEventKind::Entry => &stage.entry,
                MethodEventKind::Exit => &stage.exit,
            };
            breakpoint.request_id() == Some(request_id)
        }) else {
            return Ok(());
        };

        let breakpoint = match kind {
            MethodEventKind::Entry => &self.stages[index].entry,
            MethodEventKind::Exit => &self.stages[index].exit,
        };
        if self.factory.matches(breakpoint, &location).await? {
            match kind {
                MethodEventKind::Entry => self.on_entry(index).await?,
                MethodEventKind::Exit => self.on_exit(index, value).await?,
            }
        }
        self.resume().await
    }

    async fn on_entry(&mut self, index: usize) -> Result<()> {
        let frame = top_frame(self.target.as_ref(), self.thread).await?;
        let stage = &mut self.stages[index];
        self.factory.consume(&mut stage.entry).await?;

        let cx = TraceContext {
            bridge: &self.bridge,
            time: self.time,
        };
        let arguments = self
            .factory
            .read_arguments(&stage.entry, frame.frame_id)
            .await?;
        let substituted = stage
            .handler
            .transform_arguments(&cx, arguments.clone())
            .await?;
        let written = self
            .factory
            .write_arguments(&stage.entry, frame.frame_id, &arguments, &substituted)
            .await;
        self.substitution(written)?;
        // Armed only once the remote calls above are done.
        self.factory.enable(&mut self.stages[index].exit).await
    }

    async fn on_exit(&mut self, index: usize, returned: JdwpValue) -> Result<()> {
        let (current, rest) = self.stages[index..]
            .split_first_mut()
            .ok_or_else(|| TraceError::Tracing(format!("no stage {index}")))?;
        self.factory.consume(&mut current.exit).await?;

        let cx = TraceContext {
            bridge: &self.bridge,
            time: self.time,
        };
        let Some(next) = rest.first_mut() else {
            current.handler.after_call(&cx, returned).await?;
            self.step = Some(self.factory.create_step_out().await?);
            self.set_state(TraceState::Completing);
            return Ok(());
        };

        let value = current.handler.after_call(&cx, returned).await?;
        let value = next.handler.before_call(&cx, value).await?;
        self.factory.enable(&mut next.entry).await?;
        self.state.send_replace(TraceState::StageActive(index + 1));
        if value == returned {
            return Ok(());
        }
        let forced = self.factory.force_return(&value).await;
        self.substitution(forced)
    }

    /// Reports a failed write and goes on, unless configured to abort.
    fn substitution(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(err)
                if err.category() == ErrorCategory::Substitution
                    && !self.config.fail_on_substitution_error =>
            {
                tracing::warn!(target: "nova.stream_debug", error = %err, "value substitution failed");
                self.callback.breakpoint_setup_failed(&err);
                Ok(())
            }
            other => other,
        }
    }

    /// Whether a thrown exception leaves the frames the pipeline runs in.
    async fn escapes_pipeline(&self, catch_location: Option<Location>) -> Result<bool> {
        let Some(catch_location) = catch_location else {
            return Ok(true);
        };
        let count = self.target.thread_frame_count(self.thread).await?;
        let inner = count - self.base_depth;
        if inner <= 0 {
            return Ok(true);
        }
        let frames = self.target.thread_frames(self.thread, 0, inner).await?;
        Ok(!frames
            .iter()
            .any(|frame| frame.location.same_method(&catch_location)))
    }

    /// The thread stopped after a step or an escaping exception: keep stepping
    /// until the invoking frame is on top, then finish.
    async fn on_paused(
        &mut self,
    ) -> std::result::Result<Option<(ChainTrace, EvaluationContext)>, TraceFailure> {
        let count = self
            .target
            .thread_frame_count(self.thread)
            .await
            .map_err(|err| running_failure(err.into()))?;
        if count > self.base_depth {
            self.step_attempts += 1;
            if self.step_attempts > self.config.max_step_attempts {
                return Err(running_failure(TraceError::Tracing(format!(
                    "did not return to the invoking frame after {} steps",
                    self.config.max_step_attempts
                ))));
            }
            let step = self
                .factory
                .create_step_into()
                .await
                .map_err(running_failure)?;
            self.step = Some(step);
            self.resume().await.map_err(running_failure)?;
            return Ok(None);
        }

        self.complete().await.map(Some)
    }

    async fn complete(
        &mut self,
    ) -> std::result::Result<(ChainTrace, EvaluationContext), TraceFailure> {
        self.set_state(TraceState::Completing);
        self.clear_requests().await;
        let restored = self.restore_qualifier().await;
        self.substitution(restored).map_err(running_failure)?;

        let interpret_failure = fail(FailureKey::CannotInterpretResult);
        let values = self.harvest().await.map_err(&interpret_failure)?;
        let formatted = format_trace_result(&self.bridge, &values)
            .await
            .map_err(&interpret_failure)?;
        let trace = interpret(&self.bridge, &self.chain, formatted)
            .await
            .map_err(&interpret_failure)?;

        Ok((
            trace,
            EvaluationContext {
                thread: self.thread,
                location: self.invoking,
            },
        ))
    }

    async fn harvest(&self) -> Result<StreamTraceValues> {
        let cx = TraceContext {
            bridge: &self.bridge,
            time: self.time,
        };
        let skip = usize::from(self.has_source_stage);
        let mut results = Vec::with_capacity(self.stages.len());
        for stage in &self.stages[skip..] {
            if let Some(result) = stage.handler.result(&cx).await? {
                results.push(result);
            }
        }
        let terminal = results
            .pop()
            .ok_or_else(|| TraceError::Interpret("the terminal produced no result".to_string()))?;

        Ok(StreamTraceValues {
            intermediate_values: results,
            terminal,
            thrown: self.thrown,
            elapsed_ms: i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX),
        })
    }

    /// Best-effort removal of every request this trace installed.
    async fn clear_requests(&mut self) {
        for stage in &mut self.stages {
            for breakpoint in [&mut stage.entry, &mut stage.exit] {
                if let Err(err) = self.factory.disable(breakpoint).await {
                    tracing::debug!(target: "nova.stream_debug", error = %err, "failed to disable method request");
                }
            }
        }
        let requests = [
            (EVENT_KIND_EXCEPTION, self.guard.take()),
            (EVENT_KIND_SINGLE_STEP, self.step.take()),
        ];
        for (kind, id) in requests {
            let Some(id) = id else { continue };
            if let Err(err) = self.factory.clear(kind, id).await {
                tracing::debug!(target: "nova.stream_debug", error = %err, request = id, "failed to clear request");
            }
        }
    }

    /// Cleans up after a failure. The thread is left as it is.
    async fn abandon(&mut self) {
        self.clear_requests().await;
        if let Err(err) = self.restore_qualifier().await {
            tracing::debug!(target: "nova.stream_debug", error = %err, "failed to restore qualifier variable");
        }
    }

    async fn dispose(&self) {
        self.bridge.dispose().await;
    }

    async fn resume(&self) -> Result<()> {
        Ok(self.target.thread_resume(self.thread).await?)
    }
}

async fn top_frame(target: &dyn DebugTarget, thread: ThreadId) -> Result<FrameInfo> {
    target
        .thread_frames(thread, 0, 1)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| TraceError::Tracing(format!("thread {thread} has no frames")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_vm::{FakeProgram, FakeVm};
    use pretty_assertions::assert_eq;

    #[test]
    fn states_render_for_logs() {
        assert_eq!(TraceState::StageActive(2).to_string(), "stage 2 active");
        assert_eq!(TraceState::AwaitingQualifierReplacement.to_string(), "awaiting qualifier replacement");
        assert_eq!(TraceState::Idle.to_string(), "idle");
    }

    #[test]
    fn options_default_from_trace_config() {
        let options = TracerOptions::new(TraceConfig::default());
        assert!(format!("{options:?}").starts_with("TracerOptions"));
        assert_eq!(options.trace.max_step_attempts, 1_000);
    }

    #[tokio::test]
    async fn manager_renders_its_state_for_logs() {
        let vm = FakeVm::launch(FakeProgram::objects(["a"]));
        let manager = TraceManager::spawn(Arc::new(vm), TracerOptions::new(TraceConfig::default()));

        let rendered = format!("{manager:?}");
        assert!(rendered.starts_with("TraceManager"), "{rendered}");
        assert!(rendered.contains("state: Idle"), "{rendered}");

        manager.shutdown().await;
    }
}
