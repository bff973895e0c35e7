//! The slice of JDWP the tracer drives.
//!
//! [`DebugTarget`] mirrors the [`JdwpClient`] commands one to one so that a
//! simulated VM can stand in for a real connection in tests.

use async_trait::async_trait;
use nova_jdwp::wire::{EventModifier, InvokeOutcome};
use nova_jdwp::{
    ClassInfo, FrameId, FrameInfo, JdwpClient, JdwpEvent, JdwpValue, MethodId, MethodInfo,
    ObjectId, ReferenceTypeId, Result, ThreadId, VariableInfo,
};
use tokio::sync::broadcast;

#[async_trait]
pub trait DebugTarget: Send + Sync {
    fn subscribe_events(&self) -> broadcast::Receiver<JdwpEvent>;

    async fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>>;
    async fn vm_resume(&self) -> Result<()>;
    async fn vm_create_string(&self, value: &str) -> Result<ObjectId>;

    async fn reference_type_signature(&self, class_id: ReferenceTypeId) -> Result<String>;
    async fn reference_type_class_loader(&self, class_id: ReferenceTypeId) -> Result<ObjectId>;
    async fn reference_type_methods(&self, class_id: ReferenceTypeId) -> Result<Vec<MethodInfo>>;
    async fn reference_type_interfaces(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<ReferenceTypeId>>;
    async fn class_type_superclass(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Option<ReferenceTypeId>>;
    async fn class_type_invoke_method(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeOutcome>;
    async fn class_type_new_instance(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeOutcome>;
    async fn array_type_new_instance(
        &self,
        array_type: ReferenceTypeId,
        length: i32,
    ) -> Result<ObjectId>;
    async fn class_object_reflected_type(&self, class_object: ObjectId)
        -> Result<ReferenceTypeId>;
    async fn method_variable_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<(u32, Vec<VariableInfo>)>;

    async fn object_reference_reference_type(&self, object_id: ObjectId)
        -> Result<ReferenceTypeId>;
    async fn object_reference_invoke_method(
        &self,
        object_id: ObjectId,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeOutcome>;
    async fn object_reference_disable_collection(&self, object_id: ObjectId) -> Result<()>;
    async fn object_reference_enable_collection(&self, object_id: ObjectId) -> Result<()>;
    async fn string_reference_value(&self, string_id: ObjectId) -> Result<String>;
    async fn array_reference_length(&self, array_id: ObjectId) -> Result<i32>;
    async fn array_reference_get_values(
        &self,
        array_id: ObjectId,
        first_index: i32,
        length: i32,
    ) -> Result<Vec<JdwpValue>>;
    async fn array_reference_set_values(
        &self,
        array_id: ObjectId,
        first_index: i32,
        values: &[JdwpValue],
    ) -> Result<()>;

    async fn thread_resume(&self, thread: ThreadId) -> Result<()>;
    async fn thread_frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>>;
    async fn thread_frame_count(&self, thread: ThreadId) -> Result<i32>;
    async fn thread_force_early_return(&self, thread: ThreadId, value: &JdwpValue) -> Result<()>;
    async fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, String)],
    ) -> Result<Vec<JdwpValue>>;
    async fn stack_frame_set_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        values: &[(u32, JdwpValue)],
    ) -> Result<()>;

    async fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: Vec<EventModifier>,
    ) -> Result<i32>;
    async fn event_request_clear(&self, event_kind: u8, request_id: i32) -> Result<()>;
}

#[async_trait]
impl DebugTarget for JdwpClient {
    fn subscribe_events(&self) -> broadcast::Receiver<JdwpEvent> {
        JdwpClient::subscribe_events(self)
    }

    async fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>> {
        JdwpClient::classes_by_signature(self, signature).await
    }

    async fn vm_resume(&self) -> Result<()> {
        JdwpClient::vm_resume(self).await
    }

    async fn vm_create_string(&self, value: &str) -> Result<ObjectId> {
        JdwpClient::vm_create_string(self, value).await
    }

    async fn reference_type_signature(&self, class_id: ReferenceTypeId) -> Result<String> {
        JdwpClient::reference_type_signature(self, class_id).await
    }

    async fn reference_type_class_loader(&self, class_id: ReferenceTypeId) -> Result<ObjectId> {
        JdwpClient::reference_type_class_loader(self, class_id).await
    }

    async fn reference_type_methods(&self, class_id: ReferenceTypeId) -> Result<Vec<MethodInfo>> {
        JdwpClient::reference_type_methods(self, class_id).await
    }

    async fn reference_type_interfaces(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<ReferenceTypeId>> {
        JdwpClient::reference_type_interfaces(self, class_id).await
    }

    async fn class_type_superclass(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Option<ReferenceTypeId>> {
        JdwpClient::class_type_superclass(self, class_id).await
    }

    async fn class_type_invoke_method(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeOutcome> {
        JdwpClient::class_type_invoke_method(self, class_id, thread, method_id, args, options).await
    }

    async fn class_type_new_instance(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeOutcome> {
        JdwpClient::class_type_new_instance(self, class_id, thread, method_id, args, options).await
    }

    async fn array_type_new_instance(
        &self,
        array_type: ReferenceTypeId,
        length: i32,
    ) -> Result<ObjectId> {
        JdwpClient::array_type_new_instance(self, array_type, length).await
    }

    async fn class_object_reflected_type(
        &self,
        class_object: ObjectId,
    ) -> Result<ReferenceTypeId> {
        JdwpClient::class_object_reflected_type(self, class_object).await
    }

    async fn method_variable_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<(u32, Vec<VariableInfo>)> {
        JdwpClient::method_variable_table(self, class_id, method_id).await
    }

    async fn object_reference_reference_type(
        &self,
        object_id: ObjectId,
    ) -> Result<ReferenceTypeId> {
        JdwpClient::object_reference_reference_type(self, object_id).await
    }

    async fn object_reference_invoke_method(
        &self,
        object_id: ObjectId,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeOutcome> {
        JdwpClient::object_reference_invoke_method(
            self, object_id, thread, class_id, method_id, args, options,
        )
        .await
    }

    async fn object_reference_disable_collection(&self, object_id: ObjectId) -> Result<()> {
        JdwpClient::object_reference_disable_collection(self, object_id).await
    }

    async fn object_reference_enable_collection(&self, object_id: ObjectId) -> Result<()> {
        JdwpClient::object_reference_enable_collection(self, object_id).await
    }

    async fn string_reference_value(&self, string_id: ObjectId) -> Result<String> {
        JdwpClient::string_reference_value(self, string_id).await
    }

    async fn array_reference_length(&self, array_id: ObjectId) -> Result<i32> {
        JdwpClient::array_reference_length(self, array_id).await
    }

    async fn array_reference_get_values(
        &self,
        array_id: ObjectId,
        first_index: i32,
        length: i32,
    ) -> Result<Vec<JdwpValue>> {
        JdwpClient::array_reference_get_values(self, array_id, first_index, length).await
    }

    async fn array_reference_set_values(
        &self,
        array_id: ObjectId,
        first_index: i32,
        values: &[JdwpValue],
    ) -> Result<()> {
        JdwpClient::array_reference_set_values(self, array_id, first_index, values).await
    }

    async fn thread_resume(&self, thread: ThreadId) -> Result<()> {
        JdwpClient::thread_resume(self, thread).await
    }

    async fn thread_frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>> {
        JdwpClient::thread_frames(self, thread, start, length).await
    }

    async fn thread_frame_count(&self, thread: ThreadId) -> Result<i32> {
        JdwpClient::thread_frame_count(self, thread).await
    }

    async fn thread_force_early_return(&self, thread: ThreadId, value: &JdwpValue) -> Result<()> {
        JdwpClient::thread_force_early_return(self, thread, value).await
    }

    async fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, String)],
    ) -> Result<Vec<JdwpValue>> {
        JdwpClient::stack_frame_get_values(self, thread, frame_id, slots).await
    }

    async fn stack_frame_set_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        values: &[(u32, JdwpValue)],
    ) -> Result<()> {
        JdwpClient::stack_frame_set_values(self, thread, frame_id, values).await
    }

    async fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: Vec<EventModifier>,
    ) -> Result<i32> {
        JdwpClient::event_request_set(self, event_kind, suspend_policy, modifiers).await
    }

    async fn event_request_clear(&self, event_kind: u8, request_id: i32) -> Result<()> {
        JdwpClient::event_request_clear(self, event_kind, request_id).await
    }
}
