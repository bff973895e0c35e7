//! Creating and calling things inside the suspended debuggee.
//!
//! Everything the tracer injects (collector maps, helper instances, wrapper
//! streams, formatted result arrays) is created through [`ValueBridge`] and
//! pinned in its [`ObjectStorage`] until the trace is over.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use nova_jdwp::wire::{INVOKE_SINGLE_THREADED, ERROR_TYPE_MISMATCH, TAG_ARRAY, TAG_STRING};
use nova_jdwp::{JdwpError, JdwpValue, MethodInfo, ObjectId, ReferenceTypeId, ThreadId};
use parking_lot::Mutex;

use crate::error::{Result, TraceError};
use crate::helpers::BytecodeProvider;
use crate::signature::{class_for_name, signature_to_type_name, type_name_to_signature};
use crate::target::DebugTarget;

const CLASS_NOT_FOUND_EXCEPTION: &str = "java.lang.ClassNotFoundException";
const FOR_NAME_DESCRIPTOR: &str = "(Ljava/lang/String;ZLjava/lang/ClassLoader;)Ljava/lang/Class;";
const DEFINE_CLASS_DESCRIPTOR: &str = "(Ljava/lang/String;[BII)Ljava/lang/Class;";

/// A host value to copy into the debuggee.
#[derive(Debug, Clone, PartialEq)]
pub enum Mirror {
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
}

impl From<bool> for Mirror {
    fn from(value: bool) -> Self {
        Mirror::Boolean(value)
    }
}

impl From<i32> for Mirror {
    fn from(value: i32) -> Self {
        Mirror::Int(value)
    }
}

impl From<i64> for Mirror {
    fn from(value: i64) -> Self {
        Mirror::Long(value)
    }
}

impl From<f64> for Mirror {
    fn from(value: f64) -> Self {
        Mirror::Double(value)
    }
}

impl From<&str> for Mirror {
    fn from(value: &str) -> Self {
        Mirror::String(value.to_string())
    }
}

pub struct ValueBridge {
    target: Arc<dyn DebugTarget>,
    thread: ThreadId,
    frame_class: ReferenceTypeId,
    bytecode: Arc<dyn BytecodeProvider>,
    invoke_options: u32,
    storage: ObjectStorage,
    class_loader: Mutex<Option<ObjectId>>,
    types: Mutex<HashMap<String, ReferenceTypeId>>,
    type_names: Mutex<HashMap<ReferenceTypeId, String>>,
    methods: Mutex<HashMap<ReferenceTypeId, Arc<[MethodInfo]>>>,
}

impl ValueBridge {
    /// `frame_class` is the class of the invoking frame; its loader is used
    /// to find and define classes.
    pub fn new(
        target: Arc<dyn DebugTarget>,
        thread: ThreadId,
        frame_class: ReferenceTypeId,
        bytecode: Arc<dyn BytecodeProvider>,
        single_threaded: bool,
    ) -> Self {
        Self {
            storage: ObjectStorage::new(target.clone()),
            target,
            thread,
            frame_class,
            bytecode,
            invoke_options: if single_threaded {
                INVOKE_SINGLE_THREADED
            } else {
                0
            },
            class_loader: Mutex::new(None),
            types: Mutex::new(HashMap::new()),
            type_names: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
        }
    }

    pub fn target(&self) -> &Arc<dyn DebugTarget> {
        &self.target
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn storage(&self) -> &ObjectStorage {
        &self.storage
    }

    /// Finds `class_name` through the frame's class loader, defining it from
    /// registered bytecode when the loader does not know it yet.
    pub async fn get_type(&self, class_name: &str) -> Result<ReferenceTypeId> {
        if let Some(id) = self.types.lock().get(class_name).copied() {
            return Ok(id);
        }

        let id = match self.loaded_type(class_name).await? {
            Some(id) => id,
            None => match self.class_for_name(class_name).await? {
                Some(id) => id,
                None => {
                    self.define_class(class_name).await?;
                    self.class_for_name(class_name).await?.ok_or_else(|| {
                        TraceError::ValueInstantiation {
                            class_name: class_name.to_string(),
                            reason: "class is still missing after it was defined".to_string(),
                        }
                    })?
                }
            },
        };

        self.types.lock().insert(class_name.to_string(), id);
        Ok(id)
    }

    async fn loaded_type(&self, class_name: &str) -> Result<Option<ReferenceTypeId>> {
        let classes = self
            .target
            .classes_by_signature(&type_name_to_signature(class_name))
            .await?;
        if classes.len() <= 1 {
            return Ok(classes.first().map(|class| class.type_id));
        }

        // Same name under several loaders: prefer the frame's.
        let loader = self.class_loader().await?;
        for class in &classes {
            if self.target.reference_type_class_loader(class.type_id).await? == loader {
                return Ok(Some(class.type_id));
            }
        }
        Ok(classes.first().map(|class| class.type_id))
    }

    async fn class_loader(&self) -> Result<ObjectId> {
        if let Some(loader) = *self.class_loader.lock() {
            return Ok(loader);
        }
        let loader = self
            .target
            .reference_type_class_loader(self.frame_class)
            .await?;
        *self.class_loader.lock() = Some(loader);
        Ok(loader)
    }

    /// `Class.forName(name, true, loader)`; `None` on `ClassNotFoundException`.
    async fn class_for_name(&self, class_name: &str) -> Result<Option<ReferenceTypeId>> {
        let class_class = self
            .loaded_type("java.lang.Class")
            .await?
            .ok_or_else(|| TraceError::ValueInstantiation {
                class_name: class_name.to_string(),
                reason: "java.lang.Class is not loaded".to_string(),
            })?;
        let (declaring, method) = self
            .method(class_class, "forName", FOR_NAME_DESCRIPTOR)
            .await?;
        let name = self.mirror(class_for_name(class_name).as_str()).await?;
        let loader = JdwpValue::Object {
            tag: nova_jdwp::wire::TAG_CLASS_LOADER,
            id: self.class_loader().await?,
        };

        let outcome = self
            .target
            .class_type_invoke_method(
                declaring,
                self.thread,
                method.method_id,
                &[name, JdwpValue::Boolean(true), loader],
                self.invoke_options,
            )
            .await?;
        if let Some(exception) = outcome.exception {
            let exception_type = self.type_of(JdwpValue::object(exception)).await?;
            if exception_type == CLASS_NOT_FOUND_EXCEPTION {
                return Ok(None);
            }
            return Err(TraceError::ValueInstantiation {
                class_name: class_name.to_string(),
                reason: format!("Class.forName threw {exception_type}"),
            });
        }

        let class_object = outcome
            .value
            .object_id()
            .ok_or_else(|| TraceError::ValueInstantiation {
                class_name: class_name.to_string(),
                reason: "Class.forName returned null".to_string(),
            })?;
        Ok(Some(
            self.target.class_object_reflected_type(class_object).await?,
        ))
    }

    async fn define_class(&self, class_name: &str) -> Result<()> {
        let instantiation = |reason: &str| TraceError::ValueInstantiation {
            class_name: class_name.to_string(),
            reason: reason.to_string(),
        };

        let bytes = self
            .bytecode
            .class_bytes(class_name)
            .await?
            .ok_or_else(|| instantiation("no bytecode is registered for this class"))?;
        let loader = self.class_loader().await?;
        if loader == 0 {
            return Err(instantiation("the frame's class has no class loader"));
        }

        tracing::debug!(
            target: "nova.stream_debug",
            class = class_name,
            size = bytes.len(),
            "defining helper class"
        );

        let byte_array_type = match self.loaded_type("byte[]").await? {
            Some(id) => id,
            None => self
                .class_for_name("byte[]")
                .await?
                .ok_or_else(|| instantiation("byte[] is not loaded"))?,
        };
        let values: Vec<JdwpValue> = bytes.iter().map(|b| JdwpValue::Byte(*b as i8)).collect();
        let array_id = self
            .target
            .array_type_new_instance(byte_array_type, values.len() as i32)
            .await?;
        let byte_array = JdwpValue::Object {
            tag: TAG_ARRAY,
            id: array_id,
        };
        self.storage.keep("byte[]", byte_array).await?;
        self.target
            .array_reference_set_values(array_id, 0, &values)
            .await?;
        let name = self.mirror(class_name).await?;
        let loader_type = self.target.object_reference_reference_type(loader).await?;
        let (declaring, method) = self
            .method(loader_type, "defineClass", DEFINE_CLASS_DESCRIPTOR)
            .await?;

        let outcome = self
            .target
            .object_reference_invoke_method(
                loader,
                self.thread,
                declaring,
                method.method_id,
                &[name, byte_array, JdwpValue::Int(0), JdwpValue::Int(values.len() as i32)],
                self.invoke_options,
            )
            .await?;
        if let Some(exception) = outcome.exception {
            let exception_type = self.type_of(JdwpValue::object(exception)).await?;
            return Err(instantiation(&format!("defineClass threw {exception_type}")));
        }
        Ok(())
    }

    /// Finds a method declared by `type_id` or inherited by it, returning the
    /// declaring type along with the method.
    pub async fn method(
        &self,
        type_id: ReferenceTypeId,
        name: &str,
        descriptor: &str,
    ) -> Result<(ReferenceTypeId, MethodInfo)> {
        let mut queue = VecDeque::from([type_id]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            let methods = self.methods_of(current).await?;
            if let Some(found) = methods
                .iter()
                .find(|m| m.name == name && m.signature == descriptor)
            {
                return Ok((current, found.clone()));
            }
            queue.extend(self.supertypes(current).await?);
        }

        Err(TraceError::MethodNotFound {
            name: name.to_string(),
            signature: descriptor.to_string(),
            declaring_type: self.type_name(type_id).await?,
        })
    }

    /// Methods declared by `type_id`, cached per type.
    pub async fn methods_of(&self, type_id: ReferenceTypeId) -> Result<Arc<[MethodInfo]>> {
        if let Some(methods) = self.methods.lock().get(&type_id) {
            return Ok(methods.clone());
        }
        let methods: Arc<[MethodInfo]> = self.target.reference_type_methods(type_id).await?.into();
        self.methods.lock().insert(type_id, methods.clone());
        Ok(methods)
    }

    async fn supertypes(&self, type_id: ReferenceTypeId) -> Result<Vec<ReferenceTypeId>> {
        let mut supertypes = Vec::new();
        // Interfaces have no superclass; the VM answers with an error code.
        match self.target.class_type_superclass(type_id).await {
            Ok(superclass) => supertypes.extend(superclass),
            Err(JdwpError::VmError(_)) => {}
            Err(err) => return Err(err.into()),
        }
        supertypes.extend(self.target.reference_type_interfaces(type_id).await?);
        Ok(supertypes)
    }

    /// Java source name of a reference type (`java.lang.String`, `int[]`).
    pub async fn type_name(&self, type_id: ReferenceTypeId) -> Result<String> {
        if let Some(name) = self.type_names.lock().get(&type_id) {
            return Ok(name.clone());
        }
        let signature = self.target.reference_type_signature(type_id).await?;
        let name = signature_to_type_name(&signature).unwrap_or(signature);
        self.type_names.lock().insert(type_id, name.clone());
        Ok(name)
    }

    /// Runtime type name of a value; primitives report their keyword and null reports `null`.
    pub async fn type_of(&self, value: JdwpValue) -> Result<String> {
        if let Some(name) = value.primitive_type_name() {
            return Ok(name.to_string());
        }
        match value.object_id() {
            Some(id) => {
                let type_id = self.target.object_reference_reference_type(id).await?;
                self.type_name(type_id).await
            }
            None if value == JdwpValue::Void => Ok("void".to_string()),
            None => Ok("null".to_string()),
        }
    }

    /// Whether the runtime type of `value` is `expected` or a subtype of it.
    pub async fn is_instance_of(&self, value: JdwpValue, expected: &str) -> Result<bool> {
        let Some(id) = value.object_id() else {
            return Ok(false);
        };
        let mut queue = VecDeque::from([self.target.object_reference_reference_type(id).await?]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if self.type_name(current).await? == expected {
                return Ok(true);
            }
            queue.extend(self.supertypes(current).await?);
        }
        Ok(false)
    }

    pub async fn assert_instance_of(&self, value: JdwpValue, expected: &str) -> Result<()> {
        if self.is_instance_of(value, expected).await? {
            return Ok(());
        }
        Err(TraceError::IncorrectValueType {
            expected: expected.to_string(),
            actual: self.type_of(value).await?,
        })
    }

    /// Creates an object through the constructor with descriptor `ctor`.
    ///
    /// For array types (`int[]`, `java.lang.Object[]`) the first argument is
    /// the length.
    pub async fn instance(
        &self,
        class_name: &str,
        ctor: &str,
        args: &[JdwpValue],
    ) -> Result<JdwpValue> {
        if class_name.ends_with("[]") {
            let length = args.first().and_then(JdwpValue::as_int).ok_or_else(|| {
                TraceError::ArgumentTypeMismatch {
                    method: format!("{class_name}.<init>{ctor}"),
                }
            })?;
            return self.new_array(class_name, length).await;
        }

        let type_id = self.get_type(class_name).await?;
        let (_, method) = self.method(type_id, "<init>", ctor).await?;
        let outcome = self
            .target
            .class_type_new_instance(
                type_id,
                self.thread,
                method.method_id,
                args,
                self.invoke_options,
            )
            .await
            .map_err(|err| invoke_error(err, || format!("{class_name}.<init>{ctor}")))?;
        if let Some(exception) = outcome.exception {
            let exception_type = self.type_of(JdwpValue::object(exception)).await?;
            return Err(TraceError::ValueInstantiation {
                class_name: class_name.to_string(),
                reason: format!("constructor threw {exception_type}"),
            });
        }

        self.storage.keep(class_name, outcome.value).await?;
        Ok(outcome.value)
    }

    async fn new_array(&self, array_type: &str, length: i32) -> Result<JdwpValue> {
        let type_id = self.get_type(array_type).await?;
        let id = self.target.array_type_new_instance(type_id, length).await?;
        let value = JdwpValue::Object { tag: TAG_ARRAY, id };
        self.storage.keep(array_type, value).await?;
        Ok(value)
    }

    /// Copies a host value into the debuggee. Strings become pinned remote objects.
    pub async fn mirror(&self, value: impl Into<Mirror>) -> Result<JdwpValue> {
        Ok(match value.into() {
            Mirror::Boolean(v) => JdwpValue::Boolean(v),
            Mirror::Int(v) => JdwpValue::Int(v),
            Mirror::Long(v) => JdwpValue::Long(v),
            Mirror::Double(v) => JdwpValue::Double(v),
            Mirror::String(v) => {
                let id = self.target.vm_create_string(&v).await?;
                let value = JdwpValue::Object { tag: TAG_STRING, id };
                self.storage.keep("java.lang.String", value).await?;
                value
            }
        })
    }

    /// A new `component[]` holding `values`.
    pub async fn array_of(&self, component: &str, values: &[JdwpValue]) -> Result<JdwpValue> {
        let array = self
            .instance(&format!("{component}[]"), "(I)V", &[JdwpValue::Int(values.len() as i32)])
            .await?;
        if !values.is_empty() {
            let id = array.object_id().unwrap_or_default();
            self.target
                .array_reference_set_values(id, 0, values)
                .await
                .map_err(|err| invoke_error(err, || format!("{component}[] store")))?;
        }
        Ok(array)
    }

    /// An array whose component type is inferred from `values`: `java.lang.Object`
    /// for references, the primitive type when all values share one.
    pub async fn array(&self, values: &[JdwpValue]) -> Result<JdwpValue> {
        let component = if values.iter().all(JdwpValue::is_reference) {
            "java.lang.Object"
        } else {
            let first = values.first().and_then(JdwpValue::primitive_type_name);
            match first {
                Some(name)
                    if values
                        .iter()
                        .all(|v| v.primitive_type_name() == Some(name)) =>
                {
                    name
                }
                _ => {
                    return Err(TraceError::Tracing(
                        "array values must be all references or share one primitive type"
                            .to_string(),
                    ))
                }
            }
        };
        self.array_of(component, values).await
    }

    /// Invokes an instance method, dispatching on the receiver's runtime type.
    pub async fn invoke(
        &self,
        receiver: JdwpValue,
        name: &str,
        descriptor: &str,
        args: &[JdwpValue],
    ) -> Result<JdwpValue> {
        let Some(object) = receiver.object_id() else {
            return Err(TraceError::IncorrectValueType {
                expected: "object".to_string(),
                actual: self.type_of(receiver).await?,
            });
        };
        let type_id = self.target.object_reference_reference_type(object).await?;
        let (declaring, method) = self.method(type_id, name, descriptor).await?;
        let outcome = self
            .target
            .object_reference_invoke_method(
                object,
                self.thread,
                declaring,
                method.method_id,
                args,
                self.invoke_options,
            )
            .await
            .map_err(|err| invoke_error(err, || format!("{name}{descriptor}")))?;
        self.finish_invoke(name, outcome).await
    }

    pub async fn invoke_static(
        &self,
        class_name: &str,
        name: &str,
        descriptor: &str,
        args: &[JdwpValue],
    ) -> Result<JdwpValue> {
        let type_id = self.get_type(class_name).await?;
        let (declaring, method) = self.method(type_id, name, descriptor).await?;
        let outcome = self
            .target
            .class_type_invoke_method(
                declaring,
                self.thread,
                method.method_id,
                args,
                self.invoke_options,
            )
            .await
            .map_err(|err| invoke_error(err, || format!("{class_name}.{name}{descriptor}")))?;
        self.finish_invoke(&format!("{class_name}.{name}"), outcome)
            .await
    }

    async fn finish_invoke(
        &self,
        method: &str,
        outcome: nova_jdwp::wire::InvokeOutcome,
    ) -> Result<JdwpValue> {
        if let Some(exception) = outcome.exception {
            return Err(TraceError::RemoteException {
                method: method.to_string(),
                exception,
            });
        }
        self.keep(outcome.value).await?;
        Ok(outcome.value)
    }

    /// Pins a value under its runtime class name. Primitives and null are ignored.
    pub async fn keep(&self, value: JdwpValue) -> Result<()> {
        if value.object_id().is_none() {
            return Ok(());
        }
        let class_name = self.type_of(value).await?;
        self.storage.keep(&class_name, value).await
    }

    pub async fn read_string(&self, value: JdwpValue) -> Result<String> {
        let id = value.object_id().ok_or_else(|| TraceError::IncorrectValueType {
            expected: "java.lang.String".to_string(),
            actual: "null".to_string(),
        })?;
        Ok(self.target.string_reference_value(id).await?)
    }

    pub async fn read_array(&self, value: JdwpValue) -> Result<Vec<JdwpValue>> {
        let id = value.object_id().ok_or_else(|| TraceError::IncorrectValueType {
            expected: "array".to_string(),
            actual: "null".to_string(),
        })?;
        let length = self.target.array_reference_length(id).await?;
        if length == 0 {
            return Ok(Vec::new());
        }
        Ok(self.target.array_reference_get_values(id, 0, length).await?)
    }

    /// Releases every pinned value. Later calls do nothing.
    pub async fn dispose(&self) {
        self.storage.dispose().await;
    }
}

fn invoke_error(err: JdwpError, method: impl FnOnce() -> String) -> TraceError {
    match err.vm_error_code() {
        Some(ERROR_TYPE_MISMATCH) => TraceError::ArgumentTypeMismatch { method: method() },
        _ => TraceError::Jdwp(err),
    }
}

/// References pinned against garbage collection, grouped by class name.
///
/// Released exactly once, by [`ObjectStorage::dispose`] or, failing that, on drop.
pub struct ObjectStorage {
    target: Arc<dyn DebugTarget>,
    state: Mutex<StorageState>,
}

#[derive(Default)]
struct StorageState {
    by_class: HashMap<String, Vec<ObjectId>>,
    pinned: HashSet<ObjectId>,
    released: bool,
}

impl ObjectStorage {
    pub fn new(target: Arc<dyn DebugTarget>) -> Self {
        Self {
            target,
            state: Mutex::new(StorageState::default()),
        }
    }

    pub async fn keep(&self, class_name: &str, value: JdwpValue) -> Result<()> {
        let Some(id) = value.object_id() else {
            return Ok(());
        };
        {
            let state = self.state.lock();
            if state.released {
                return Err(TraceError::StorageReleased);
            }
            if state.pinned.contains(&id) {
                return Ok(());
            }
        }

        self.target.object_reference_disable_collection(id).await?;

        let mut state = self.state.lock();
        state.pinned.insert(id);
        state
            .by_class
            .entry(class_name.to_string())
            .or_default()
            .push(id);
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// Pinned ids per class name.
    pub fn pinned(&self) -> HashMap<String, Vec<ObjectId>> {
        self.state.lock().by_class.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pinned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-enables collection for every pinned reference. Returns `false` if
    /// the storage was already released.
    pub async fn dispose(&self) -> bool {
        let ids = {
            let mut state = self.state.lock();
            if state.released {
                return false;
            }
            state.released = true;
            state.by_class.clear();
            std::mem::take(&mut state.pinned)
        };

        for id in ids {
            if let Err(err) = self.target.object_reference_enable_collection(id).await {
                tracing::debug!(
                    target: "nova.stream_debug",
                    object = id,
                    error = %err,
                    "failed to re-enable collection"
                );
            }
        }
        true
    }
}

impl Drop for ObjectStorage {
    fn drop(&mut self) {
        let ids = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            std::mem::take(&mut state.pinned)
        };
        if ids.is_empty() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let target = self.target.clone();
        handle.spawn(async move {
            for id in ids {
                let _ = target.object_reference_enable_collection(id).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_vm::{FakeProgram, FakeVm, MAIN_THREAD};
    use crate::helpers::STREAM_DEBUGGER_UTILS;
    use pretty_assertions::assert_eq;

    async fn bridge(vm: &FakeVm) -> ValueBridge {
        let target: Arc<dyn DebugTarget> = Arc::new(vm.clone());
        let frames = target.thread_frames(MAIN_THREAD, 0, 1).await.unwrap();
        ValueBridge::new(
            target,
            MAIN_THREAD,
            frames[0].location.class_id,
            Arc::new(FakeVm::helper_bytecode()),
            true,
        )
    }

    #[tokio::test]
    async fn mirrored_string_reads_back_through_a_remote_call() {
        let vm = FakeVm::launch(FakeProgram::objects(["a"]));
        let bridge = bridge(&vm).await;

        let hello = bridge.mirror("hello").await.unwrap();
        let length = bridge.invoke(hello, "length", "()I", &[]).await.unwrap();

        assert_eq!(length, JdwpValue::Int(5));
        assert_eq!(bridge.read_string(hello).await.unwrap(), "hello");
        assert_eq!(bridge.mirror(5).await.unwrap(), JdwpValue::Int(5));
    }

    #[tokio::test]
    async fn pinned_values_are_released_once() {
        let vm = FakeVm::launch(FakeProgram::objects(["a"]));
        let bridge = bridge(&vm).await;

        bridge.mirror("x").await.unwrap();
        bridge.mirror("y").await.unwrap();
        assert_eq!(bridge.storage().len(), 2);
        assert_eq!(vm.pinned_objects(), 2);

        assert!(bridge.storage().dispose().await);
        assert!(!bridge.storage().dispose().await);
        assert_eq!(vm.pinned_objects(), 0);
        assert!(matches!(
            bridge.mirror("z").await,
            Err(TraceError::StorageReleased)
        ));
    }

    #[tokio::test]
    async fn helper_class_is_defined_only_when_missing() {
        let vm = FakeVm::launch(FakeProgram::objects(["a"]));

        let first = bridge(&vm).await.get_type(STREAM_DEBUGGER_UTILS).await.unwrap();
        let second = bridge(&vm).await.get_type(STREAM_DEBUGGER_UTILS).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(vm.define_count(STREAM_DEBUGGER_UTILS), 1);
    }

    #[tokio::test]
    async fn arrays_take_one_component_type() {
        let vm = FakeVm::launch(FakeProgram::objects(["a"]));
        let bridge = bridge(&vm).await;

        let ints = bridge
            .array(&[JdwpValue::Int(1), JdwpValue::Int(2)])
            .await
            .unwrap();
        assert_eq!(
            bridge.read_array(ints).await.unwrap(),
            vec![JdwpValue::Int(1), JdwpValue::Int(2)]
        );

        let mixed = bridge.array(&[JdwpValue::Int(1), JdwpValue::Long(2)]).await;
        assert!(matches!(mixed, Err(TraceError::Tracing(_))), "{mixed:?}");
        let text = bridge.mirror("x").await.unwrap();
        let mixed = bridge.array(&[text, JdwpValue::Int(1)]).await;
        assert!(matches!(mixed, Err(TraceError::Tracing(_))), "{mixed:?}");
    }

    #[tokio::test]
    async fn instance_checks_walk_supertypes() {
        let vm = FakeVm::launch(FakeProgram::objects(["a"]));
        let bridge = bridge(&vm).await;
        let text = bridge.mirror("text").await.unwrap();

        assert!(bridge.is_instance_of(text, "java.lang.Object").await.unwrap());
        let err = bridge
            .assert_instance_of(text, "java.util.Map")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TraceError::IncorrectValueType { ref actual, .. } if actual == "java.lang.String"
        ));
    }
}
