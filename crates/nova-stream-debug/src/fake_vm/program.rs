//! Runs the scripted chain on the simulated thread, stopping wherever an
//! installed request says the debugger wants to look.

use std::collections::HashMap;
use std::sync::Arc;

use nova_jdwp::wire::{EVENT_KIND_METHOD_ENTRY, EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE};
use nova_jdwp::{JdwpEvent, JdwpValue, MethodId, ObjectId, ReferenceTypeId};

use super::state::{parameter_tags, Frame, HeapObject, StepPoint, StreamOp, VmState, NPE};
use super::{Element, Inner, Lambda, LambdaOutcome};
use crate::chain::ElementType;

const ILLEGAL_STATE: &str = "java.lang.IllegalStateException";

/// Why control left a call abruptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Abrupt {
    Thrown,
    Exited,
}

type Flow<T> = std::result::Result<T, Abrupt>;

/// Where the first call of the chain gets its receiver.
pub(super) enum ScriptQualifier {
    /// A local of `Main.run`.
    Slot(u32),
    /// `collection.stream()`.
    Stream { collection: JdwpValue },
}

#[derive(Debug, Clone)]
pub(super) struct PreparedCall {
    pub name: String,
    pub descriptor: String,
    pub args: Vec<JdwpValue>,
}

pub(super) struct Script {
    pub qualifier: ScriptQualifier,
    pub calls: Vec<PreparedCall>,
    pub runs: usize,
}

#[derive(Clone, Copy)]
enum PipelineOp {
    Filter(ObjectId),
    Map(ObjectId),
    Peek(ObjectId),
}

#[derive(Clone, Copy)]
enum Sink {
    Count,
    AnyMatch(ObjectId),
    FindFirst,
    ToList,
    ForEach(ObjectId),
}

enum Callee {
    Lambda(Lambda),
    Collector {
        map: Option<ObjectId>,
        time: ObjectId,
        tick: bool,
    },
    Matcher {
        before: ObjectId,
        after: ObjectId,
        time: ObjectId,
        predicate: ObjectId,
    },
    Missing,
}

enum Receiver {
    List(Vec<Element>),
    Stream(ElementType),
    Other,
}

impl VmState {
    fn entered(&mut self) -> Option<JdwpEvent> {
        let location = self.frames.last()?.location;
        self.method_event(EVENT_KIND_METHOD_ENTRY, location, JdwpValue::Void)
            .or_else(|| self.step_event(StepPoint::Entered))
    }

    fn exiting(&mut self, value: JdwpValue) -> Option<JdwpEvent> {
        let location = self.frames.last()?.location;
        self.method_event(EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE, location, value)
    }

    /// `time.incrementAndGet()` when `advance`, else `time.get()`.
    fn tick(&mut self, time: ObjectId, advance: bool) -> i32 {
        match self.heap.get_mut(&time).map(|e| &mut e.object) {
            Some(HeapObject::Atomic(value)) => {
                if advance {
                    *value += 1;
                }
                *value
            }
            _ => 0,
        }
    }

    fn put(&mut self, map: ObjectId, key: i32, element: Element) {
        if let Some(HeapObject::Map(entries)) = self.heap.get_mut(&map).map(|e| &mut e.object) {
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = element,
                None => entries.push((key, element)),
            }
        }
    }
}

/// Frame slots of a call with `descriptor`; `long` and `double` take two.
fn argument_slots(descriptor: &str) -> Vec<u32> {
    let mut slot = 1;
    parameter_tags(descriptor)
        .into_iter()
        .map(|tag| {
            let current = slot;
            slot += if matches!(tag, b'J' | b'D') { 2 } else { 1 };
            current
        })
        .collect()
}

impl Inner {
    pub(super) async fn run(self: Arc<Self>) {
        for _ in 0..self.script.runs {
            if self.wait_resumed().await.is_err() {
                return;
            }
            match self.run_chain().await {
                Ok(value) => self.state.lock().program_result = Some(value),
                Err(Abrupt::Thrown) => {
                    // The exception is caught around the statement in `Main.run`.
                    if self.stop(|s| s.step_event(StepPoint::Returned)).await.is_err() {
                        return;
                    }
                }
                Err(Abrupt::Exited) => return,
            }
        }
    }

    async fn wait_resumed(&self) -> Flow<()> {
        loop {
            let notified = self.wake.notified();
            {
                let state = self.state.lock();
                if state.dead {
                    return Err(Abrupt::Exited);
                }
                if !state.suspended {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Suspends the thread on the event `decide` picks; runs on when there is none.
    async fn stop(&self, decide: impl FnOnce(&mut VmState) -> Option<JdwpEvent>) -> Flow<()> {
        {
            let mut state = self.state.lock();
            if state.dead {
                return Err(Abrupt::Exited);
            }
            let Some(event) = decide(&mut state) else {
                return Ok(());
            };
            state.suspended = true;
            let _ = self.events.send(event);
        }
        self.wait_resumed().await
    }

    pub(super) fn kill(&self) {
        {
            let mut state = self.state.lock();
            if state.dead {
                return;
            }
            state.dead = true;
            let _ = self.events.send(JdwpEvent::VmDeath);
        }
        self.wake.notify_waiters();
    }

    async fn run_chain(&self) -> Flow<JdwpValue> {
        let mut current = match &self.script.qualifier {
            ScriptQualifier::Slot(slot) => {
                let state = self.state.lock();
                state
                    .frames
                    .last()
                    .and_then(|frame| frame.slots.get(slot).copied())
                    .unwrap_or(JdwpValue::NULL)
            }
            ScriptQualifier::Stream { collection } => {
                self.call(*collection, "stream", "()Ljava/util/stream/Stream;", Vec::new())
                    .await?
            }
        };
        for call in &self.script.calls {
            current = self
                .call(current, &call.name, &call.descriptor, call.args.clone())
                .await?;
        }
        Ok(current)
    }

    fn push(
        &self,
        class: ReferenceTypeId,
        method: MethodId,
        receiver: JdwpValue,
        descriptor: &str,
        args: &[JdwpValue],
    ) {
        let mut state = self.state.lock();
        let id = state.next_id();
        let location = state.location(class, method, 0);
        let mut slots = HashMap::from([(0, receiver)]);
        slots.extend(argument_slots(descriptor).into_iter().zip(args.iter().copied()));
        state.frames.push(Frame { id, location, slots });
    }

    fn pop(&self) {
        self.state.lock().frames.pop();
    }

    /// Throws `class_name` out of the current frame with no handler in sight.
    async fn raise(&self, class_name: &str) -> Abrupt {
        let exception = self.state.lock().new_throwable(class_name);
        match self.stop(|s| s.exception_event(exception, None)).await {
            Ok(()) => Abrupt::Thrown,
            Err(abrupt) => abrupt,
        }
    }

    /// An invocation from program code: entry stop, body, exit stop, return stop.
    async fn call(
        &self,
        receiver: JdwpValue,
        name: &str,
        descriptor: &str,
        args: Vec<JdwpValue>,
    ) -> Flow<JdwpValue> {
        let Some(receiver_id) = receiver.object_id() else {
            return Err(self.raise(NPE).await);
        };
        let target = {
            let state = self.state.lock();
            state
                .entry(receiver_id)
                .ok()
                .and_then(|entry| state.dispatch(entry.class, name, descriptor))
        };
        let Some((class, method)) = target else {
            return Err(self.raise(ILLEGAL_STATE).await);
        };

        self.push(class, method, receiver, descriptor, &args);
        if let Err(abrupt) = self.stop(VmState::entered).await {
            self.pop();
            return Err(abrupt);
        }

        // The debugger may have replaced the arguments while stopped.
        let args = {
            let state = self.state.lock();
            match state.frames.last() {
                Some(frame) => argument_slots(descriptor)
                    .iter()
                    .zip(&args)
                    .map(|(slot, arg)| frame.slots.get(slot).copied().unwrap_or(*arg))
                    .collect(),
                None => args,
            }
        };

        let value = match self.body(receiver_id, name, &args).await {
            Ok(value) => value,
            Err(abrupt) => {
                self.pop();
                return Err(abrupt);
            }
        };
        if let Err(abrupt) = self.stop(|s| s.exiting(value)).await {
            self.pop();
            return Err(abrupt);
        }
        let value = self.state.lock().forced_return.take().unwrap_or(value);
        self.pop();
        self.stop(|s| s.step_event(StepPoint::Returned)).await?;
        Ok(value)
    }

    async fn body(&self, receiver: ObjectId, name: &str, args: &[JdwpValue]) -> Flow<JdwpValue> {
        let (kind, class) = {
            let state = self.state.lock();
            match state.entry(receiver) {
                Ok(entry) => {
                    let kind = match &entry.object {
                        HeapObject::List(items) => Receiver::List(items.clone()),
                        HeapObject::Stream { element, .. } => Receiver::Stream(*element),
                        _ => Receiver::Other,
                    };
                    (kind, entry.class)
                }
                Err(_) => (Receiver::Other, 0),
            }
        };
        let function = args.first().and_then(JdwpValue::object_id);

        match (kind, name) {
            (Receiver::List(items), "stream") => {
                let mut state = self.state.lock();
                let id = state.alloc_named(
                    "java.util.stream.ReferencePipeline",
                    HeapObject::Stream {
                        element: ElementType::Object,
                        op: StreamOp::Source(items),
                    },
                );
                Ok(state.value_of(id))
            }
            (Receiver::Stream(element), "filter" | "map" | "peek") => {
                let Some(function) = function else {
                    return Err(self.raise(NPE).await);
                };
                let op = match name {
                    "filter" => StreamOp::Filter {
                        upstream: receiver,
                        predicate: function,
                    },
                    "map" => StreamOp::Map {
                        upstream: receiver,
                        function,
                    },
                    _ => StreamOp::Peek {
                        upstream: receiver,
                        consumer: function,
                    },
                };
                let mut state = self.state.lock();
                let id = state.alloc(class, HeapObject::Stream { element, op });
                Ok(state.value_of(id))
            }
            (Receiver::Stream(element), "parallel" | "sequential") => {
                let mut state = self.state.lock();
                let id = state.alloc(
                    class,
                    HeapObject::Stream {
                        element,
                        op: StreamOp::Pass { upstream: receiver },
                    },
                );
                Ok(state.value_of(id))
            }
            (Receiver::Stream(element), terminal) => {
                let sink = match (terminal, function) {
                    ("count", _) => Sink::Count,
                    ("anyMatch", Some(predicate)) => Sink::AnyMatch(predicate),
                    ("findFirst", _) => Sink::FindFirst,
                    ("toList", _) => Sink::ToList,
                    ("forEach", Some(consumer)) => Sink::ForEach(consumer),
                    ("anyMatch" | "forEach", None) => return Err(self.raise(NPE).await),
                    _ => return Err(self.raise(ILLEGAL_STATE).await),
                };
                self.run_terminal(receiver, element, sink).await
            }
            _ => Err(self.raise(ILLEGAL_STATE).await),
        }
    }

    /// Source elements and the operations between the source and `stream`.
    fn pipeline(&self, stream: ObjectId) -> (Vec<Element>, Vec<PipelineOp>) {
        let state = self.state.lock();
        let mut ops = Vec::new();
        let mut current = stream;
        let source = loop {
            let op = match state.entry(current).map(|e| &e.object) {
                Ok(HeapObject::Stream { op, .. }) => op.clone(),
                _ => break Vec::new(),
            };
            current = match op {
                StreamOp::Source(items) => break items,
                StreamOp::Filter {
                    upstream,
                    predicate,
                } => {
                    ops.push(PipelineOp::Filter(predicate));
                    upstream
                }
                StreamOp::Map { upstream, function } => {
                    ops.push(PipelineOp::Map(function));
                    upstream
                }
                StreamOp::Peek { upstream, consumer } => {
                    ops.push(PipelineOp::Peek(consumer));
                    upstream
                }
                StreamOp::Pass { upstream } => upstream,
            };
        };
        ops.reverse();
        (source, ops)
    }

    async fn run_terminal(&self, stream: ObjectId, element: ElementType, sink: Sink) -> Flow<JdwpValue> {
        let (source, ops) = self.pipeline(stream);
        let mut count = 0_i64;
        let mut collected = Vec::new();

        for item in source {
            let Some(item) = self.through(&ops, item).await? else {
                continue;
            };
            match sink {
                Sink::Count => count += 1,
                Sink::AnyMatch(predicate) => {
                    if self.apply(predicate, item).await?.is_true() {
                        return Ok(JdwpValue::Boolean(true));
                    }
                }
                Sink::FindFirst => return Ok(self.optional(element, Some(item))),
                Sink::ToList => collected.push(item),
                Sink::ForEach(consumer) => {
                    self.apply(consumer, item).await?;
                }
            }
        }

        Ok(match sink {
            Sink::Count => JdwpValue::Long(count),
            Sink::AnyMatch(_) => JdwpValue::Boolean(false),
            Sink::FindFirst => self.optional(element, None),
            Sink::ToList => {
                let mut state = self.state.lock();
                let id = state.alloc_named("java.util.ArrayList", HeapObject::List(collected));
                state.value_of(id)
            }
            Sink::ForEach(_) => JdwpValue::Void,
        })
    }

    fn optional(&self, element: ElementType, content: Option<Element>) -> JdwpValue {
        let class = match element {
            ElementType::Int => "java.util.OptionalInt",
            _ => "java.util.Optional",
        };
        let mut state = self.state.lock();
        let id = state.alloc_named(class, HeapObject::Optional(content));
        state.value_of(id)
    }

    /// Pushes one element through the intermediate operations; `None` when filtered out.
    async fn through(&self, ops: &[PipelineOp], item: Element) -> Flow<Option<Element>> {
        let mut item = item;
        for op in ops {
            match *op {
                PipelineOp::Filter(predicate) => {
                    if !self.apply(predicate, item.clone()).await?.is_true() {
                        return Ok(None);
                    }
                }
                PipelineOp::Map(function) => item = self.apply(function, item).await?,
                PipelineOp::Peek(consumer) => {
                    self.apply(consumer, item.clone()).await?;
                }
            }
        }
        Ok(Some(item))
    }

    /// Calls a functional object: a program lambda or one of the injected helpers.
    async fn apply(&self, function: ObjectId, item: Element) -> Flow<Element> {
        let callee = {
            let state = self.state.lock();
            match state.entry(function).map(|e| &e.object) {
                Ok(HeapObject::Lambda(lambda)) => Callee::Lambda(lambda.clone()),
                Ok(HeapObject::Collector { map, time, tick }) => Callee::Collector {
                    map: *map,
                    time: *time,
                    tick: *tick,
                },
                Ok(HeapObject::Matcher {
                    before,
                    after,
                    time,
                    predicate,
                }) => Callee::Matcher {
                    before: *before,
                    after: *after,
                    time: *time,
                    predicate: *predicate,
                },
                _ => Callee::Missing,
            }
        };

        match callee {
            Callee::Lambda(lambda) => self.call_lambda(function, &lambda, item).await,
            Callee::Collector { map, time, tick } => {
                let mut state = self.state.lock();
                let now = state.tick(time, tick);
                if let Some(map) = map {
                    state.put(map, now, item.clone());
                }
                Ok(item)
            }
            Callee::Matcher {
                before,
                after,
                time,
                predicate,
            } => {
                {
                    let mut state = self.state.lock();
                    let now = state.tick(time, false);
                    state.put(before, now, item.clone());
                }
                let lambda = {
                    let state = self.state.lock();
                    match state.entry(predicate).map(|e| &e.object) {
                        Ok(HeapObject::Lambda(lambda)) => Some(lambda.clone()),
                        _ => None,
                    }
                };
                let Some(lambda) = lambda else {
                    return Err(self.raise(NPE).await);
                };
                let result = self.call_lambda(predicate, &lambda, item.clone()).await?;
                if result.is_true() {
                    let mut state = self.state.lock();
                    let now = state.tick(time, true);
                    state.put(after, now, item);
                }
                Ok(result)
            }
            Callee::Missing => Err(self.raise(NPE).await),
        }
    }

    async fn call_lambda(&self, function: ObjectId, lambda: &Lambda, item: Element) -> Flow<Element> {
        let target = {
            let mut state = self.state.lock();
            let target = state.entry(function).ok().and_then(|entry| {
                let class = state.class(entry.class).ok()?;
                let method = class.methods.first()?;
                Some((entry.class, method.id, method.descriptor.clone()))
            });
            target.map(|(class, method, descriptor)| {
                let element = if descriptor.starts_with("(I") {
                    ElementType::Int
                } else {
                    ElementType::Object
                };
                let arg = state.materialize(&item, element);
                let receiver = state.value_of(function);
                (class, method, descriptor, receiver, arg)
            })
        };
        let Some((class, method, descriptor, receiver, arg)) = target else {
            return Err(self.raise(NPE).await);
        };

        self.push(class, method, receiver, &descriptor, &[arg]);
        if let Err(abrupt) = self.stop(VmState::entered).await {
            self.pop();
            return Err(abrupt);
        }

        let result = match lambda.invoke(&item) {
            LambdaOutcome::Value(value) => Ok(value),
            LambdaOutcome::Throw {
                exception,
                caught_inside: Some(fallback),
            } => {
                let (exception, handler) = {
                    let mut state = self.state.lock();
                    let handler = state.frames.last().map(|frame| {
                        let mut handler = frame.location;
                        handler.index += 4;
                        handler
                    });
                    (state.new_throwable(&exception), handler)
                };
                self.stop(|s| s.exception_event(exception, handler))
                    .await
                    .map(|()| fallback)
            }
            LambdaOutcome::Throw {
                exception,
                caught_inside: None,
            } => Err(self.raise(&exception).await),
            LambdaOutcome::ThrowReplaced {
                exception,
                replaced_by,
            } => match self.raise(&exception).await {
                Abrupt::Thrown => Err(self.raise(&replaced_by).await),
                abrupt => Err(abrupt),
            },
            LambdaOutcome::ExitVm => {
                self.kill();
                Err(Abrupt::Exited)
            }
        };

        self.pop();
        let value = result?;
        self.stop(|s| s.step_event(StepPoint::Returned)).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wide_arguments_take_two_slots() {
        assert_eq!(argument_slots("(JLjava/lang/Object;D[I)V"), vec![1, 3, 4, 6]);
        assert_eq!(argument_slots("()J"), Vec::<u32>::new());
    }
}
