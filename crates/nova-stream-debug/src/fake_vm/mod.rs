//! An in-process JVM stand-in that runs one scripted stream chain.
//!
//! [`FakeVm`] implements [`DebugTarget`] over a small class table and heap.
//! The program thread starts suspended at the statement evaluating the
//! chain (`Main.run`), exactly where a real trace begins. Method entry/exit,
//! step and exception requests stop it the way a JVM would, and debugger
//! invocations (`Class.forName`, `defineClass`, `peek`, the helper classes)
//! are answered synchronously. An invocation that would raise an armed
//! entry, exit or exception event times out instead, since a real VM
//! suspends the invoking thread and never replies.

mod program;
mod state;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use nova_jdwp::wire::{
    EventModifier, InvokeOutcome, ERROR_INVALID_CLASS, ERROR_INVALID_INDEX, ERROR_INVALID_OBJECT,
    ERROR_INVALID_THREAD, ERROR_OPAQUE_FRAME, ERROR_THREAD_NOT_SUSPENDED, TAG_OBJECT,
};
use nova_jdwp::{
    ClassInfo, FrameId, FrameInfo, JdwpError, JdwpEvent, JdwpValue, MethodId, MethodInfo,
    ObjectId, ReferenceTypeId, Result, ThreadId, VariableInfo,
};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{broadcast, Notify};

use self::program::{PreparedCall, Script, ScriptQualifier};
use self::state::{stream_methods, Frame, HeapObject, StreamOp, VmState, MAIN, RUN_INDEX};
use crate::chain::{ElementType, QualifierExpression, StreamCall, StreamChain, TerminatorCall};
use crate::helpers::{InMemoryBytecodeProvider, HELPER_CLASSES};
use crate::signature::MethodSignature;
use crate::target::DebugTarget;

/// The only thread of the fake VM.
pub const MAIN_THREAD: ThreadId = 1;

/// JDWP `ABSENT_INFORMATION`.
const ERROR_ABSENT_INFORMATION: u16 = 101;

/// A stream element as the program sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
}

impl Element {
    pub fn is_true(&self) -> bool {
        matches!(self, Element::Bool(true))
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Element::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Element::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Element {
    fn from(value: &str) -> Self {
        Element::Str(value.to_string())
    }
}

impl From<i32> for Element {
    fn from(value: i32) -> Self {
        Element::Int(value)
    }
}

/// What a program lambda does with one element.
#[derive(Debug, Clone, PartialEq)]
pub enum LambdaOutcome {
    Value(Element),
    /// Throws `exception`. With `caught_inside` the lambda handles it itself
    /// and returns that value instead.
    Throw {
        exception: String,
        caught_inside: Option<Element>,
    },
    /// Throws `exception`, then a `finally` block throws `replaced_by` out of
    /// the same frame while it unwinds.
    ThrowReplaced {
        exception: String,
        replaced_by: String,
    },
    /// Terminates the VM.
    ExitVm,
}

#[derive(Clone)]
pub struct Lambda {
    body: Arc<dyn Fn(&Element) -> LambdaOutcome + Send + Sync>,
}

impl Lambda {
    pub fn new(body: impl Fn(&Element) -> LambdaOutcome + Send + Sync + 'static) -> Self {
        Self {
            body: Arc::new(body),
        }
    }

    pub fn function(f: impl Fn(&Element) -> Element + Send + Sync + 'static) -> Self {
        Self::new(move |e| LambdaOutcome::Value(f(e)))
    }

    pub fn predicate(f: impl Fn(&Element) -> bool + Send + Sync + 'static) -> Self {
        Self::new(move |e| LambdaOutcome::Value(Element::Bool(f(e))))
    }

    /// A consumer that ignores its element.
    pub fn sink() -> Self {
        Self::new(|_| LambdaOutcome::Value(Element::Null))
    }

    pub fn throwing(exception: &str) -> Self {
        let exception = exception.to_string();
        Self::new(move |_| LambdaOutcome::Throw {
            exception: exception.clone(),
            caught_inside: None,
        })
    }

    fn invoke(&self, element: &Element) -> LambdaOutcome {
        (self.body)(element)
    }
}

impl fmt::Debug for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Lambda")
    }
}

#[derive(Debug, Clone)]
pub enum ProgramQualifier {
    /// A local variable of `Main.run` already holding the stream.
    Variable(String),
    /// `collection.stream()` on a local list.
    CollectionStream(String),
}

#[derive(Debug, Clone)]
pub enum ProgramStage {
    Filter(Lambda),
    Map(Lambda),
    /// `map(null)`: throws `NullPointerException` when the call is made.
    MapNull,
    Peek(Lambda),
    Parallel,
}

#[derive(Debug, Clone)]
pub enum ProgramTerminal {
    Count,
    AnyMatch(Lambda),
    FindFirst,
    ToList,
    ForEach(Lambda),
}

/// The chain `Main.run` evaluates, with the elements its source yields.
#[derive(Debug, Clone)]
pub struct FakeProgram {
    element: ElementType,
    source: Vec<Element>,
    qualifier: ProgramQualifier,
    stages: Vec<ProgramStage>,
    terminal: ProgramTerminal,
    runs: usize,
}

impl FakeProgram {
    /// `list.stream()...` over reference elements.
    pub fn objects<I, E>(source: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Element>,
    {
        Self {
            element: ElementType::Object,
            source: source.into_iter().map(Into::into).collect(),
            qualifier: ProgramQualifier::CollectionStream("list".to_string()),
            stages: Vec::new(),
            terminal: ProgramTerminal::Count,
            runs: 1,
        }
    }

    /// `numbers...` where `numbers` is a local `IntStream`.
    pub fn ints(source: impl IntoIterator<Item = i32>) -> Self {
        Self {
            element: ElementType::Int,
            source: source.into_iter().map(Element::Int).collect(),
            qualifier: ProgramQualifier::Variable("numbers".to_string()),
            stages: Vec::new(),
            terminal: ProgramTerminal::Count,
            runs: 1,
        }
    }

    /// Starts the chain from a local variable instead of a collection.
    pub fn from_variable(mut self, name: impl Into<String>) -> Self {
        self.qualifier = ProgramQualifier::Variable(name.into());
        self
    }

    pub fn stage(mut self, stage: ProgramStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn terminal(mut self, terminal: ProgramTerminal) -> Self {
        self.terminal = terminal;
        self
    }

    /// Evaluates the statement `runs` times in a row.
    pub fn repeated(mut self, runs: usize) -> Self {
        self.runs = runs.max(1);
        self
    }

    fn functional_type(&self, name: &str) -> &'static str {
        match (self.element, name) {
            (ElementType::Int, "filter" | "anyMatch") => "java.util.function.IntPredicate",
            (ElementType::Int, "map") => "java.util.function.IntUnaryOperator",
            (ElementType::Int, _) => "java.util.function.IntConsumer",
            (_, "filter" | "anyMatch") => "java.util.function.Predicate",
            (_, "map") => "java.util.function.Function",
            _ => "java.util.function.Consumer",
        }
    }

    fn stage_name(stage: &ProgramStage) -> &'static str {
        match stage {
            ProgramStage::Filter(_) => "filter",
            ProgramStage::Map(_) | ProgramStage::MapNull => "map",
            ProgramStage::Peek(_) => "peek",
            ProgramStage::Parallel => "parallel",
        }
    }

    fn terminal_name(&self) -> &'static str {
        match self.terminal {
            ProgramTerminal::Count => "count",
            ProgramTerminal::AnyMatch(_) => "anyMatch",
            ProgramTerminal::FindFirst => "findFirst",
            ProgramTerminal::ToList => "toList",
            ProgramTerminal::ForEach(_) => "forEach",
        }
    }

    fn descriptor(&self, name: &str) -> String {
        stream_methods(self.element)
            .into_iter()
            .find(|(method, _)| *method == name)
            .map(|(_, descriptor)| descriptor.to_string())
            .unwrap_or_else(|| "()Ljava/util/stream/BaseStream;".to_string())
    }

    /// The chain model a caller would hand the tracer for this program.
    pub fn chain(&self) -> StreamChain {
        let declaring = self.element.stream_type();
        let element = Some(self.element);
        let mut text = match &self.qualifier {
            ProgramQualifier::Variable(name) => name.clone(),
            ProgramQualifier::CollectionStream(name) => format!("{name}.stream()"),
        };

        let mut intermediate_calls = Vec::new();
        for stage in &self.stages {
            let name = Self::stage_name(stage);
            let arguments: Vec<&str> = match stage {
                ProgramStage::Parallel => Vec::new(),
                _ => vec![self.functional_type(name)],
            };
            text.push_str(&format!(".{name}({})", if arguments.is_empty() { "" } else { "f" }));
            intermediate_calls.push(StreamCall::new(name, declaring, arguments, element, element));
        }

        let name = self.terminal_name();
        let (arguments, result_type): (Vec<&str>, &str) = match (&self.terminal, self.element) {
            (ProgramTerminal::Count, _) => (Vec::new(), "long"),
            (ProgramTerminal::AnyMatch(_), _) => (vec![self.functional_type(name)], "boolean"),
            (ProgramTerminal::FindFirst, ElementType::Int) => (Vec::new(), "java.util.OptionalInt"),
            (ProgramTerminal::FindFirst, _) => (Vec::new(), "java.util.Optional"),
            (ProgramTerminal::ToList, _) => (Vec::new(), "java.util.List"),
            (ProgramTerminal::ForEach(_), _) => (vec![self.functional_type(name)], "void"),
        };
        text.push_str(&format!(".{name}({})", if arguments.is_empty() { "" } else { "f" }));
        let termination_call = TerminatorCall::new(
            StreamCall::new(name, declaring, arguments, element, None),
            result_type,
        );

        let qualifier_expression = match &self.qualifier {
            ProgramQualifier::Variable(name) => QualifierExpression::Variable {
                text: name.clone(),
                variable_name: name.clone(),
            },
            ProgramQualifier::CollectionStream(name) => QualifierExpression::MethodCall {
                text: format!("{name}.stream()"),
                signature: MethodSignature::new(
                    "java.util.Collection",
                    "stream",
                    Vec::<String>::new(),
                    "java.util.stream.Stream",
                ),
            },
        };

        StreamChain::new(text, qualifier_expression, intermediate_calls, termination_call)
    }
}

struct Inner {
    state: Mutex<VmState>,
    events: broadcast::Sender<JdwpEvent>,
    wake: Notify,
    script: Script,
}

/// A simulated debuggee. Cloning shares the VM.
#[derive(Clone)]
pub struct FakeVm {
    inner: Arc<Inner>,
}

impl fmt::Debug for FakeVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FakeVm")
            .field("frames", &state.frames.len())
            .field("suspended", &state.suspended)
            .field("dead", &state.dead)
            .finish()
    }
}

impl FakeVm {
    /// Loads `program` and starts its thread, suspended before the chain is
    /// evaluated. Must be called from within a Tokio runtime.
    pub fn launch(program: FakeProgram) -> Self {
        let mut state = VmState::new();
        let lambda_class = |state: &VmState, interface: &str| {
            let simple = interface.rsplit('.').next().unwrap_or(interface);
            state
                .class_named(&format!("Main$$Lambda${simple}"), state.app_loader)
                .unwrap_or_default()
        };

        let mut calls = Vec::new();
        for stage in &program.stages {
            let name = FakeProgram::stage_name(stage);
            let args = match stage {
                ProgramStage::Filter(lambda) | ProgramStage::Map(lambda) | ProgramStage::Peek(lambda) => {
                    let class = lambda_class(&state, program.functional_type(name));
                    let id = state.alloc(class, HeapObject::Lambda(lambda.clone()));
                    vec![state.value_of(id)]
                }
                ProgramStage::MapNull => vec![JdwpValue::NULL],
                ProgramStage::Parallel => Vec::new(),
            };
            calls.push(PreparedCall {
                name: name.to_string(),
                descriptor: program.descriptor(name),
                args,
            });
        }
        let name = program.terminal_name();
        let args = match &program.terminal {
            ProgramTerminal::AnyMatch(lambda) | ProgramTerminal::ForEach(lambda) => {
                let class = lambda_class(&state, program.functional_type(name));
                let id = state.alloc(class, HeapObject::Lambda(lambda.clone()));
                vec![state.value_of(id)]
            }
            _ => Vec::new(),
        };
        calls.push(PreparedCall {
            name: name.to_string(),
            descriptor: program.descriptor(name),
            args,
        });

        let (local, signature, qualifier) = match &program.qualifier {
            ProgramQualifier::Variable(variable) => {
                let class = match program.element {
                    ElementType::Int => "java.util.stream.IntPipeline",
                    _ => "java.util.stream.ReferencePipeline",
                };
                let id = state.alloc_named(
                    class,
                    HeapObject::Stream {
                        element: program.element,
                        op: StreamOp::Source(program.source.clone()),
                    },
                );
                (
                    (variable.clone(), state.value_of(id)),
                    format!("L{};", program.element.stream_type().replace('.', "/")),
                    ScriptQualifier::Slot(1),
                )
            }
            ProgramQualifier::CollectionStream(variable) => {
                let id = state.alloc_named("java.util.ArrayList", HeapObject::List(program.source.clone()));
                let list = state.value_of(id);
                (
                    (variable.clone(), list),
                    "Ljava/util/List;".to_string(),
                    ScriptQualifier::Stream { collection: list },
                )
            }
        };

        let main = state.class_named(MAIN, state.app_loader).unwrap_or_default();
        let (main_method, run_method) = match state.class(main) {
            Ok(class) => (
                class.method("main", "([Ljava/lang/String;)V").map(|m| m.id).unwrap_or_default(),
                class.method("run", "()V").map(|m| m.id).unwrap_or_default(),
            ),
            Err(_) => (0, 0),
        };
        let this = state.alloc(main, HeapObject::Plain);
        state.set_run_variables(vec![
            VariableInfo {
                code_index: 0,
                name: "this".to_string(),
                signature: "LMain;".to_string(),
                length: 100,
                slot: 0,
            },
            VariableInfo {
                code_index: 0,
                name: local.0,
                signature,
                length: 100,
                slot: 1,
            },
        ]);
        for (method, index, slots) in [
            (main_method, 3, vec![(0, JdwpValue::NULL)]),
            (
                run_method,
                RUN_INDEX,
                vec![(0, JdwpValue::Object { tag: TAG_OBJECT, id: this }), (1, local.1)],
            ),
        ] {
            let id = state.next_id();
            let location = state.location(main, method, index);
            state.frames.push(Frame {
                id,
                location,
                slots: slots.into_iter().collect(),
            });
        }

        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(Inner {
            state: Mutex::new(state),
            events,
            wake: Notify::new(),
            script: Script {
                qualifier,
                calls,
                runs: program.runs,
            },
        });
        tokio::spawn(inner.clone().run());
        Self { inner }
    }

    /// Bytecode for every helper class; the fake only checks the magic number.
    pub fn helper_bytecode() -> InMemoryBytecodeProvider {
        let mut provider = InMemoryBytecodeProvider::new();
        for class in HELPER_CLASSES {
            provider.insert(class, vec![0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 52]);
        }
        provider
    }

    pub fn thread(&self) -> ThreadId {
        MAIN_THREAD
    }

    /// Ends the VM as if the debuggee exited.
    pub fn kill(&self) {
        self.inner.kill();
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspended
    }

    /// Number of times `class_name` went through `defineClass`.
    pub fn define_count(&self, class_name: &str) -> u32 {
        self.inner
            .state
            .lock()
            .defined
            .get(class_name)
            .copied()
            .unwrap_or(0)
    }

    /// Debugger writes to `slot` of `Main.run`, in order.
    pub fn local_writes(&self, slot: u32) -> Vec<JdwpValue> {
        let state = self.inner.state.lock();
        let Some(run) = state.frames.get(1).map(|frame| frame.id) else {
            return Vec::new();
        };
        state
            .frame_writes
            .iter()
            .filter(|(frame, written, _)| *frame == run && *written == slot)
            .map(|(_, _, value)| *value)
            .collect()
    }

    /// Current value of a local of `Main.run`.
    pub fn local(&self, slot: u32) -> Option<JdwpValue> {
        let state = self.inner.state.lock();
        state.frames.get(1).and_then(|frame| frame.slots.get(&slot).copied())
    }

    /// Objects currently exempt from collection.
    pub fn pinned_objects(&self) -> usize {
        self.inner.state.lock().pins.values().filter(|n| **n > 0).count()
    }

    /// Method entry/exit requests installed over the VM's lifetime.
    pub fn method_requests_set(&self) -> usize {
        self.inner.state.lock().method_requests_set
    }

    /// Most method entry/exit requests ever installed at once.
    pub fn max_enabled_method_requests(&self) -> usize {
        self.inner.state.lock().max_enabled_method_requests
    }

    pub fn active_requests(&self) -> usize {
        self.inner.state.lock().active_requests()
    }

    /// Completed debugger invocations, as `Class.method(descriptor)` or
    /// `new Class(descriptor)`.
    pub fn invocations(&self) -> Vec<String> {
        self.inner.state.lock().invocations.clone()
    }

    /// Makes every later `ForceEarlyReturn` fail with `OPAQUE_FRAME`, as for
    /// a native frame.
    pub fn reject_forced_returns(&self) {
        self.inner.state.lock().reject_forced_returns = true;
    }

    /// Debugger invocations that would have hung a real VM: an armed
    /// request fired on the thread while it ran the call.
    pub fn stalled_invocations(&self) -> Vec<String> {
        self.inner.state.lock().stalled_invocations.clone()
    }

    /// What the last completed evaluation of the chain returned.
    pub fn program_result(&self) -> Option<JdwpValue> {
        self.inner.state.lock().program_result
    }

    pub fn read_string(&self, value: JdwpValue) -> Option<String> {
        self.inner.state.lock().string(value)
    }

    fn live(&self) -> Result<MutexGuard<'_, VmState>> {
        let state = self.inner.state.lock();
        if state.dead {
            return Err(JdwpError::ConnectionClosed);
        }
        Ok(state)
    }

    /// Thread commands need the program thread, stopped.
    fn stopped(&self, thread: ThreadId) -> Result<MutexGuard<'_, VmState>> {
        if thread != MAIN_THREAD {
            return Err(JdwpError::VmError(ERROR_INVALID_THREAD));
        }
        let state = self.live()?;
        if !state.suspended {
            return Err(JdwpError::VmError(ERROR_THREAD_NOT_SUSPENDED));
        }
        Ok(state)
    }

    fn resume(&self) -> Result<()> {
        self.live()?.suspended = false;
        self.inner.wake.notify_waiters();
        Ok(())
    }

    fn array(state: &VmState, array_id: ObjectId) -> Result<&Vec<JdwpValue>> {
        match &state.entry(array_id)?.object {
            HeapObject::Array { values, .. } => Ok(values),
            _ => Err(JdwpError::VmError(ERROR_INVALID_OBJECT)),
        }
    }
}

#[async_trait]
impl DebugTarget for FakeVm {
    fn subscribe_events(&self) -> broadcast::Receiver<JdwpEvent> {
        self.inner.events.subscribe()
    }

    async fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>> {
        Ok(self.live()?.classes_by_signature(signature))
    }

    async fn vm_resume(&self) -> Result<()> {
        self.resume()
    }

    async fn vm_create_string(&self, value: &str) -> Result<ObjectId> {
        let mut state = self.live()?;
        Ok(state.new_string(value).object_id().unwrap_or_default())
    }

    async fn reference_type_signature(&self, class_id: ReferenceTypeId) -> Result<String> {
        Ok(self.live()?.class(class_id)?.signature.clone())
    }

    async fn reference_type_class_loader(&self, class_id: ReferenceTypeId) -> Result<ObjectId> {
        Ok(self.live()?.class(class_id)?.loader)
    }

    async fn reference_type_methods(&self, class_id: ReferenceTypeId) -> Result<Vec<MethodInfo>> {
        self.live()?.methods(class_id)
    }

    async fn reference_type_interfaces(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<ReferenceTypeId>> {
        Ok(self.live()?.class(class_id)?.interfaces.clone())
    }

    async fn class_type_superclass(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Option<ReferenceTypeId>> {
        let state = self.live()?;
        let class = state.class(class_id)?;
        if class.is_interface {
            return Err(JdwpError::VmError(ERROR_INVALID_CLASS));
        }
        Ok(class.superclass)
    }

    async fn class_type_invoke_method(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        _options: u32,
    ) -> Result<InvokeOutcome> {
        self.stopped(thread)?.invoke(None, class_id, method_id, args)
    }

    async fn class_type_new_instance(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        _options: u32,
    ) -> Result<InvokeOutcome> {
        self.stopped(thread)?.new_instance(class_id, method_id, args)
    }

    async fn array_type_new_instance(
        &self,
        array_type: ReferenceTypeId,
        length: i32,
    ) -> Result<ObjectId> {
        let mut state = self.live()?;
        let component = {
            let class = state.class(array_type)?;
            if !class.is_array {
                return Err(JdwpError::VmError(ERROR_INVALID_CLASS));
            }
            class.signature[1..].to_string()
        };
        let default = match component.as_str() {
            "B" => JdwpValue::Byte(0),
            "Z" => JdwpValue::Boolean(false),
            "I" => JdwpValue::Int(0),
            "J" => JdwpValue::Long(0),
            "D" => JdwpValue::Double(0.0),
            _ => JdwpValue::NULL,
        };
        let values = vec![default; length.max(0) as usize];
        Ok(state.alloc(array_type, HeapObject::Array { component, values }))
    }

    async fn class_object_reflected_type(
        &self,
        class_object: ObjectId,
    ) -> Result<ReferenceTypeId> {
        match self.live()?.entry(class_object)?.object {
            HeapObject::ClassObject(type_id) => Ok(type_id),
            _ => Err(JdwpError::VmError(ERROR_INVALID_OBJECT)),
        }
    }

    async fn method_variable_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<(u32, Vec<VariableInfo>)> {
        let state = self.live()?;
        let variables = state
            .class(class_id)?
            .variables
            .get(&method_id)
            .cloned()
            .ok_or(JdwpError::VmError(ERROR_ABSENT_INFORMATION))?;
        Ok((1, variables))
    }

    async fn object_reference_reference_type(
        &self,
        object_id: ObjectId,
    ) -> Result<ReferenceTypeId> {
        Ok(self.live()?.entry(object_id)?.class)
    }

    async fn object_reference_invoke_method(
        &self,
        object_id: ObjectId,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
        args: &[JdwpValue],
        _options: u32,
    ) -> Result<InvokeOutcome> {
        self.stopped(thread)?
            .invoke(Some(object_id), class_id, method_id, args)
    }

    async fn object_reference_disable_collection(&self, object_id: ObjectId) -> Result<()> {
        let mut state = self.live()?;
        state.entry(object_id)?;
        *state.pins.entry(object_id).or_default() += 1;
        Ok(())
    }

    async fn object_reference_enable_collection(&self, object_id: ObjectId) -> Result<()> {
        let mut state = self.live()?;
        state.entry(object_id)?;
        if let Some(pins) = state.pins.get_mut(&object_id) {
            *pins = pins.saturating_sub(1);
            if *pins == 0 {
                state.pins.remove(&object_id);
            }
        }
        Ok(())
    }

    async fn string_reference_value(&self, string_id: ObjectId) -> Result<String> {
        match &self.live()?.entry(string_id)?.object {
            HeapObject::Str(value) => Ok(value.clone()),
            _ => Err(JdwpError::VmError(ERROR_INVALID_OBJECT)),
        }
    }

    async fn array_reference_length(&self, array_id: ObjectId) -> Result<i32> {
        let state = self.live()?;
        Ok(Self::array(&state, array_id)?.len() as i32)
    }

    async fn array_reference_get_values(
        &self,
        array_id: ObjectId,
        first_index: i32,
        length: i32,
    ) -> Result<Vec<JdwpValue>> {
        let state = self.live()?;
        let values = Self::array(&state, array_id)?;
        let first = usize::try_from(first_index).map_err(|_| JdwpError::VmError(ERROR_INVALID_INDEX))?;
        let end = first + usize::try_from(length).map_err(|_| JdwpError::VmError(ERROR_INVALID_INDEX))?;
        values
            .get(first..end)
            .map(<[JdwpValue]>::to_vec)
            .ok_or(JdwpError::VmError(ERROR_INVALID_INDEX))
    }

    async fn array_reference_set_values(
        &self,
        array_id: ObjectId,
        first_index: i32,
        values: &[JdwpValue],
    ) -> Result<()> {
        self.live()?.array_set(array_id, first_index, values)
    }

    async fn thread_resume(&self, thread: ThreadId) -> Result<()> {
        if thread != MAIN_THREAD {
            return Err(JdwpError::VmError(ERROR_INVALID_THREAD));
        }
        self.resume()
    }

    async fn thread_frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>> {
        Ok(self.stopped(thread)?.frames_top_down(start, length))
    }

    async fn thread_frame_count(&self, thread: ThreadId) -> Result<i32> {
        Ok(self.stopped(thread)?.frames.len() as i32)
    }

    async fn thread_force_early_return(&self, thread: ThreadId, value: &JdwpValue) -> Result<()> {
        let mut state = self.stopped(thread)?;
        if state.reject_forced_returns {
            return Err(JdwpError::VmError(ERROR_OPAQUE_FRAME));
        }
        state.forced_return = Some(*value);
        Ok(())
    }

    async fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, String)],
    ) -> Result<Vec<JdwpValue>> {
        self.stopped(thread)?.get_slots(frame_id, slots)
    }

    async fn stack_frame_set_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        values: &[(u32, JdwpValue)],
    ) -> Result<()> {
        self.stopped(thread)?.set_slots(frame_id, values)
    }

    async fn event_request_set(
        &self,
        event_kind: u8,
        _suspend_policy: u8,
        modifiers: Vec<EventModifier>,
    ) -> Result<i32> {
        Ok(self.live()?.add_request(event_kind, modifiers))
    }

    async fn event_request_clear(&self, event_kind: u8, request_id: i32) -> Result<()> {
        self.live()?.clear_request(event_kind, request_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_jdwp::wire::{EVENT_KIND_EXCEPTION, EVENT_KIND_METHOD_ENTRY, SUSPEND_POLICY_EVENT_THREAD};
    use pretty_assertions::assert_eq;

    impl FakeVm {
        async fn new_instance_for_test(
            &self,
            class: ReferenceTypeId,
            init: MethodId,
        ) -> Result<InvokeOutcome> {
            self.class_type_new_instance(class, MAIN_THREAD, init, &[], 0).await
        }
    }

    #[tokio::test]
    async fn launches_suspended_in_main_run() {
        let vm = FakeVm::launch(FakeProgram::objects(["a", "b"]));
        assert!(vm.is_suspended());

        let frames = vm.thread_frames(MAIN_THREAD, 0, -1).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].location.index, RUN_INDEX);

        let signature = vm
            .reference_type_signature(frames[0].location.class_id)
            .await
            .unwrap();
        assert_eq!(signature, "LMain;");
    }

    #[tokio::test]
    async fn interfaces_have_no_superclass() {
        let vm = FakeVm::launch(FakeProgram::objects(["a"]));
        let stream = vm
            .classes_by_signature("Ljava/util/stream/Stream;")
            .await
            .unwrap();
        let err = vm.class_type_superclass(stream[0].type_id).await.unwrap_err();
        assert!(matches!(err, JdwpError::VmError(ERROR_INVALID_CLASS)));
    }

    async fn atomic_integer(vm: &FakeVm) -> (ReferenceTypeId, MethodId) {
        let class = vm
            .classes_by_signature("Ljava/util/concurrent/atomic/AtomicInteger;")
            .await
            .unwrap()[0]
            .type_id;
        let init = vm
            .reference_type_methods(class)
            .await
            .unwrap()
            .into_iter()
            .find(|m| m.name == "<init>" && m.signature == "()V")
            .unwrap();
        (class, init.method_id)
    }

    #[tokio::test]
    async fn invocation_entering_an_armed_class_never_returns() {
        let vm = FakeVm::launch(FakeProgram::objects(["a"]));
        let (class, init) = atomic_integer(&vm).await;

        vm.new_instance_for_test(class, init).await.unwrap();
        assert!(vm.stalled_invocations().is_empty());

        vm.event_request_set(
            EVENT_KIND_METHOD_ENTRY,
            SUSPEND_POLICY_EVENT_THREAD,
            vec![EventModifier::ClassOnly { class_id: class }],
        )
        .await
        .unwrap();
        let err = vm.new_instance_for_test(class, init).await.unwrap_err();

        assert!(matches!(err, JdwpError::Timeout));
        assert_eq!(
            vm.stalled_invocations(),
            vec!["new java.util.concurrent.atomic.AtomicInteger()V: method entry".to_string()]
        );
    }

    #[tokio::test]
    async fn exception_inside_an_invocation_hits_the_exception_request() {
        let vm = FakeVm::launch(FakeProgram::objects(["a"]));
        let class_class = vm
            .classes_by_signature("Ljava/lang/Class;")
            .await
            .unwrap()[0]
            .type_id;
        let for_name = vm
            .reference_type_methods(class_class)
            .await
            .unwrap()
            .into_iter()
            .find(|m| m.name == "forName")
            .unwrap();
        let name = JdwpValue::object(vm.vm_create_string("com.example.Missing").await.unwrap());
        let args = [name, JdwpValue::Boolean(true), JdwpValue::NULL];

        let outcome = vm
            .class_type_invoke_method(class_class, MAIN_THREAD, for_name.method_id, &args, 0)
            .await
            .unwrap();
        assert!(outcome.exception.is_some(), "missing classes throw");

        vm.event_request_set(
            EVENT_KIND_EXCEPTION,
            SUSPEND_POLICY_EVENT_THREAD,
            vec![EventModifier::ExceptionOnly {
                exception_or_null: 0,
                caught: true,
                uncaught: true,
            }],
        )
        .await
        .unwrap();
        let err = vm
            .class_type_invoke_method(class_class, MAIN_THREAD, for_name.method_id, &args, 0)
            .await
            .unwrap_err();

        assert!(matches!(err, JdwpError::Timeout));
        assert_eq!(vm.stalled_invocations().len(), 1);
    }

    #[test]
    fn chain_matches_the_program() {
        let program = FakeProgram::ints([1, 2, 3])
            .stage(ProgramStage::Filter(Lambda::predicate(|_| true)))
            .terminal(ProgramTerminal::AnyMatch(Lambda::predicate(|_| false)));
        let chain = program.chain();

        assert_eq!(chain.text, "numbers.filter(f).anyMatch(f)");
        assert_eq!(chain.intermediate_calls[0].arguments, vec!["java.util.function.IntPredicate"]);
        assert_eq!(chain.termination_call.result_type, "boolean");
        assert!(!chain.has_source_call());
    }
}
