//! Method entry/exit, exception and step requests for one traced thread.

use std::collections::HashMap;
use std::sync::Arc;

use nova_jdwp::wire::{
    EventModifier, EVENT_KIND_EXCEPTION, EVENT_KIND_METHOD_ENTRY,
    EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE, EVENT_KIND_SINGLE_STEP, STEP_DEPTH_INTO,
    STEP_DEPTH_OUT, STEP_SIZE_LINE, STEP_SIZE_MIN, SUSPEND_POLICY_EVENT_THREAD,
};
use nova_jdwp::{FrameId, JdwpValue, Location, MethodInfo, ReferenceTypeId, ThreadId};
use parking_lot::Mutex;

use crate::error::{Result, TraceError};
use crate::signature::{type_name_to_signature, MethodSignature};
use crate::target::DebugTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodEventKind {
    Entry,
    Exit,
}

impl MethodEventKind {
    pub fn event_kind(self) -> u8 {
        match self {
            MethodEventKind::Entry => EVENT_KIND_METHOD_ENTRY,
            MethodEventKind::Exit => EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE,
        }
    }
}

/// A method entry or exit request bound to a resolved method.
///
/// Created disabled. Enabling installs the JDWP request; the first matching
/// event consumes it for good.
#[derive(Debug, Clone)]
pub struct MethodBreakpoint {
    kind: MethodEventKind,
    signature: MethodSignature,
    declaring_type: ReferenceTypeId,
    method: MethodInfo,
    request_id: Option<i32>,
    consumed: bool,
}

impl MethodBreakpoint {
    pub fn kind(&self) -> MethodEventKind {
        self.kind
    }

    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    pub fn request_id(&self) -> Option<i32> {
        self.request_id
    }

    pub fn is_enabled(&self) -> bool {
        self.request_id.is_some()
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    pub fn is_static(&self) -> bool {
        self.method.is_static()
    }
}

pub struct BreakpointFactory {
    target: Arc<dyn DebugTarget>,
    thread: ThreadId,
    methods: Mutex<HashMap<ReferenceTypeId, Arc<[MethodInfo]>>>,
}

impl BreakpointFactory {
    pub fn new(target: Arc<dyn DebugTarget>, thread: ThreadId) -> Self {
        Self {
            target,
            thread,
            methods: Mutex::new(HashMap::new()),
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub async fn create_method_entry(&self, signature: &MethodSignature) -> Result<MethodBreakpoint> {
        self.create(MethodEventKind::Entry, signature).await
    }

    pub async fn create_method_exit(&self, signature: &MethodSignature) -> Result<MethodBreakpoint> {
        self.create(MethodEventKind::Exit, signature).await
    }

    async fn create(
        &self,
        kind: MethodEventKind,
        signature: &MethodSignature,
    ) -> Result<MethodBreakpoint> {
        let descriptor = signature.descriptor();
        let not_found = || TraceError::MethodNotFound {
            name: signature.name.clone(),
            signature: descriptor.clone(),
            declaring_type: signature.containing_class.clone(),
        };

        let classes = self
            .target
            .classes_by_signature(&type_name_to_signature(&signature.containing_class))
            .await?;
        let class = classes.first().ok_or_else(not_found)?;
        let methods = self.methods_of(class.type_id).await?;
        let method = methods
            .iter()
            .find(|m| signature.matches(&m.name, &m.signature))
            .cloned()
            .ok_or_else(not_found)?;

        Ok(MethodBreakpoint {
            kind,
            signature: signature.clone(),
            declaring_type: class.type_id,
            method,
            request_id: None,
            consumed: false,
        })
    }

    async fn methods_of(&self, type_id: ReferenceTypeId) -> Result<Arc<[MethodInfo]>> {
        if let Some(methods) = self.methods.lock().get(&type_id) {
            return Ok(methods.clone());
        }
        let methods: Arc<[MethodInfo]> = self.target.reference_type_methods(type_id).await?.into();
        self.methods.lock().insert(type_id, methods.clone());
        Ok(methods)
    }

    /// Installs the request, filtered to the traced thread and the declaring
    /// type. Consumed breakpoints stay off.
    pub async fn enable(&self, breakpoint: &mut MethodBreakpoint) -> Result<()> {
        if breakpoint.is_enabled() || breakpoint.consumed {
            return Ok(());
        }
        let id = self
            .target
            .event_request_set(
                breakpoint.kind.event_kind(),
                SUSPEND_POLICY_EVENT_THREAD,
                vec![
                    EventModifier::ThreadOnly {
                        thread: self.thread,
                    },
                    EventModifier::ClassOnly {
                        class_id: breakpoint.declaring_type,
                    },
                ],
            )
            .await?;
        tracing::trace!(
            target: "nova.stream_debug",
            request = id,
            kind = ?breakpoint.kind,
            method = %breakpoint.signature,
            "enabled method request"
        );
        breakpoint.request_id = Some(id);
        Ok(())
    }

    pub async fn disable(&self, breakpoint: &mut MethodBreakpoint) -> Result<()> {
        if let Some(id) = breakpoint.request_id.take() {
            self.target
                .event_request_clear(breakpoint.kind.event_kind(), id)
                .await?;
        }
        Ok(())
    }

    /// Disables the request so it never fires again.
    pub async fn consume(&self, breakpoint: &mut MethodBreakpoint) -> Result<()> {
        breakpoint.consumed = true;
        self.disable(breakpoint).await
    }

    /// Class filters also match subtypes, so events are checked against the
    /// method's name and descriptor.
    pub async fn matches(&self, breakpoint: &MethodBreakpoint, location: &Location) -> Result<bool> {
        let methods = self.methods_of(location.class_id).await?;
        Ok(methods
            .iter()
            .find(|m| m.method_id == location.method_id)
            .is_some_and(|m| breakpoint.signature.matches(&m.name, &m.signature)))
    }

    /// Reads the arguments of the method entered in `frame`.
    pub async fn read_arguments(
        &self,
        breakpoint: &MethodBreakpoint,
        frame: FrameId,
    ) -> Result<Vec<JdwpValue>> {
        let slots = breakpoint.signature.argument_slots(breakpoint.is_static());
        if slots.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .target
            .stack_frame_get_values(self.thread, frame, &slots)
            .await?)
    }

    /// Writes back the arguments that differ from `original`.
    pub async fn write_arguments(
        &self,
        breakpoint: &MethodBreakpoint,
        frame: FrameId,
        original: &[JdwpValue],
        substituted: &[JdwpValue],
    ) -> Result<()> {
        let slots = breakpoint.signature.argument_slots(breakpoint.is_static());
        let changed: Vec<(u32, JdwpValue)> = slots
            .iter()
            .zip(original.iter().zip(substituted))
            .filter(|(_, (before, after))| before != after)
            .map(|((slot, _), (_, after))| (*slot, *after))
            .collect();
        if changed.is_empty() {
            return Ok(());
        }
        self.target
            .stack_frame_set_values(self.thread, frame, &changed)
            .await
            .map_err(TraceError::substitution)
    }

    /// Replaces the value the current method is about to return.
    pub async fn force_return(&self, value: &JdwpValue) -> Result<()> {
        self.target
            .thread_force_early_return(self.thread, value)
            .await
            .map_err(TraceError::substitution)
    }

    /// Caught and uncaught exceptions of any type on the traced thread.
    pub async fn create_exception_guard(&self) -> Result<i32> {
        Ok(self
            .target
            .event_request_set(
                EVENT_KIND_EXCEPTION,
                SUSPEND_POLICY_EVENT_THREAD,
                vec![
                    EventModifier::ExceptionOnly {
                        exception_or_null: 0,
                        caught: true,
                        uncaught: true,
                    },
                    EventModifier::ThreadOnly {
                        thread: self.thread,
                    },
                ],
            )
            .await?)
    }

    pub async fn create_step_out(&self) -> Result<i32> {
        self.create_step(STEP_SIZE_LINE, STEP_DEPTH_OUT).await
    }

    pub async fn create_step_into(&self) -> Result<i32> {
        self.create_step(STEP_SIZE_MIN, STEP_DEPTH_INTO).await
    }

    async fn create_step(&self, size: u32, depth: u32) -> Result<i32> {
        Ok(self
            .target
            .event_request_set(
                EVENT_KIND_SINGLE_STEP,
                SUSPEND_POLICY_EVENT_THREAD,
                vec![
                    EventModifier::Step {
                        thread: self.thread,
                        size,
                        depth,
                    },
                    EventModifier::Count { count: 1 },
                ],
            )
            .await?)
    }

    pub async fn clear(&self, event_kind: u8, request_id: i32) -> Result<()> {
        Ok(self.target.event_request_clear(event_kind, request_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_vm::{FakeProgram, FakeVm, MAIN_THREAD};
    use pretty_assertions::assert_eq;

    fn factory(vm: &FakeVm) -> BreakpointFactory {
        BreakpointFactory::new(Arc::new(vm.clone()), MAIN_THREAD)
    }

    fn filter() -> MethodSignature {
        MethodSignature::new(
            "java.util.stream.ReferencePipeline",
            "filter",
            ["java.util.function.Predicate"],
            "java.util.stream.Stream",
        )
    }

    #[tokio::test]
    async fn breakpoints_start_disabled_and_consume_once() {
        let vm = FakeVm::launch(FakeProgram::objects(["a"]));
        let factory = factory(&vm);

        let mut entry = factory.create_method_entry(&filter()).await.unwrap();
        assert!(!entry.is_enabled());
        assert_eq!(vm.active_requests(), 0);

        factory.enable(&mut entry).await.unwrap();
        assert!(entry.request_id().is_some());
        assert_eq!(vm.active_requests(), 1);

        factory.consume(&mut entry).await.unwrap();
        factory.enable(&mut entry).await.unwrap();
        assert!(entry.is_consumed());
        assert!(!entry.is_enabled());
        assert_eq!(vm.active_requests(), 0);
    }

    #[tokio::test]
    async fn unknown_method_is_reported_with_its_descriptor() {
        let vm = FakeVm::launch(FakeProgram::objects(["a"]));
        let signature = MethodSignature::new(
            "java.util.stream.ReferencePipeline",
            "frobnicate",
            Vec::<String>::new(),
            "void",
        );

        let err = factory(&vm).create_method_exit(&signature).await.unwrap_err();

        match err {
            TraceError::MethodNotFound {
                name, signature, ..
            } => {
                assert_eq!(name, "frobnicate");
                assert_eq!(signature, "()V");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
