//! Classes, heap and event requests of the simulated VM.

use std::collections::{HashMap, HashSet, VecDeque};

use nova_jdwp::wire::{
    InvokeOutcome, ERROR_INVALID_CLASS, ERROR_INVALID_FRAMEID, ERROR_INVALID_METHODID,
    ERROR_INVALID_OBJECT, ERROR_INVALID_SLOT, ERROR_NOT_IMPLEMENTED, ERROR_TYPE_MISMATCH,
    EVENT_KIND_EXCEPTION, EVENT_KIND_METHOD_ENTRY, EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE,
    EVENT_KIND_SINGLE_STEP, MODIFIER_STATIC, STEP_DEPTH_INTO, STEP_DEPTH_OUT, STEP_DEPTH_OVER,
    TAG_ARRAY, TAG_CLASS_LOADER, TAG_CLASS_OBJECT, TAG_OBJECT, TAG_STRING, TYPE_TAG_ARRAY,
    TYPE_TAG_CLASS, TYPE_TAG_INTERFACE,
};
use nova_jdwp::{
    ClassInfo, EventModifier, FrameId, FrameInfo, JdwpError, JdwpEvent, JdwpValue, Location,
    MethodId, MethodInfo, ObjectId, ReferenceTypeId, VariableInfo,
};

use super::{Element, Lambda, MAIN_THREAD};
use crate::chain::ElementType;
use crate::helpers::{
    matcher_for_predicate, DOUBLE_MATCHER, FORMAT_MAP_DESCRIPTOR, INT_MATCHER, LONG_MATCHER,
    OBJECT_MATCHER, STREAM_DEBUGGER_UTILS, UNIVERSAL_COLLECTOR, UNIVERSAL_COLLECTOR_CTOR,
};
use crate::signature::{signature_to_type_name, type_name_to_signature};

pub(super) type VmResult<T> = std::result::Result<T, JdwpError>;

pub(super) const MAIN: &str = "Main";
pub(super) const OBJECT: &str = "java.lang.Object";
pub(super) const STRING: &str = "java.lang.String";
pub(super) const NPE: &str = "java.lang.NullPointerException";
const CLASS_NOT_FOUND: &str = "java.lang.ClassNotFoundException";
const LINKAGE_ERROR: &str = "java.lang.LinkageError";
const CLASS_FORMAT_ERROR: &str = "java.lang.ClassFormatError";

/// Code index of the invoking statement in `Main.run`.
pub(super) const RUN_INDEX: u64 = 10;

pub(super) struct MethodDef {
    pub id: MethodId,
    pub name: String,
    pub descriptor: String,
    pub is_static: bool,
    pub is_abstract: bool,
}

pub(super) struct ClassDef {
    pub id: ReferenceTypeId,
    pub name: String,
    pub signature: String,
    pub is_interface: bool,
    pub is_array: bool,
    pub superclass: Option<ReferenceTypeId>,
    pub interfaces: Vec<ReferenceTypeId>,
    pub methods: Vec<MethodDef>,
    pub loader: ObjectId,
    pub class_object: Option<ObjectId>,
    pub variables: HashMap<MethodId, Vec<VariableInfo>>,
}

impl ClassDef {
    fn type_tag(&self) -> u8 {
        if self.is_array {
            TYPE_TAG_ARRAY
        } else if self.is_interface {
            TYPE_TAG_INTERFACE
        } else {
            TYPE_TAG_CLASS
        }
    }

    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodDef> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }
}

#[derive(Clone)]
pub(super) enum StreamOp {
    Source(Vec<Element>),
    Filter { upstream: ObjectId, predicate: ObjectId },
    Map { upstream: ObjectId, function: ObjectId },
    Peek { upstream: ObjectId, consumer: ObjectId },
    /// `parallel()` and `sequential()`: the fake always runs sequentially.
    Pass { upstream: ObjectId },
}

pub(super) enum HeapObject {
    Plain,
    Str(String),
    Array { component: String, values: Vec<JdwpValue> },
    Map(Vec<(i32, Element)>),
    Atomic(i32),
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
    Lambda(Lambda),
    Stream { element: ElementType, op: StreamOp },
    Optional(Option<Element>),
    ClassObject(ReferenceTypeId),
    ClassLoader,
    Throwable,
    List(Vec<Element>),
    Boxed(Element),
}

pub(super) struct HeapEntry {
    pub class: ReferenceTypeId,
    pub object: HeapObject,
}

pub(super) struct Frame {
    pub id: FrameId,
    pub location: Location,
    pub slots: HashMap<u32, JdwpValue>,
}

struct ActiveRequest {
    id: i32,
    kind: u8,
    modifiers: Vec<EventModifier>,
    /// Frame count when the request was created; step depth is relative to it.
    depth: usize,
}

/// Where a pending step request may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StepPoint {
    Entered,
    Returned,
}

pub(super) struct VmState {
    next_id: u64,
    classes: Vec<ClassDef>,
    pub heap: HashMap<ObjectId, HeapEntry>,
    pub pins: HashMap<ObjectId, u32>,
    requests: Vec<ActiveRequest>,
    next_request: i32,
    pub frames: Vec<Frame>,
    pub suspended: bool,
    pub dead: bool,
    pub forced_return: Option<JdwpValue>,
    pub defined: HashMap<String, u32>,
    pub frame_writes: Vec<(FrameId, u32, JdwpValue)>,
    pub method_requests_set: usize,
    pub max_enabled_method_requests: usize,
    pub program_result: Option<JdwpValue>,
    pub app_loader: ObjectId,
    /// Debugger invocations that ran into an armed request.
    pub stalled_invocations: Vec<String>,
    /// Debugger invocations that completed, in order.
    pub invocations: Vec<String>,
    pub reject_forced_returns: bool,
}

impl VmState {
    pub fn new() -> Self {
        let mut state = Self {
            next_id: 1_000,
            classes: Vec::new(),
            heap: HashMap::new(),
            pins: HashMap::new(),
            requests: Vec::new(),
            next_request: 1,
            frames: Vec::new(),
            suspended: true,
            dead: false,
            forced_return: None,
            defined: HashMap::new(),
            frame_writes: Vec::new(),
            method_requests_set: 0,
            max_enabled_method_requests: 0,
            program_result: None,
            app_loader: 0,
            stalled_invocations: Vec::new(),
            invocations: Vec::new(),
            reject_forced_returns: false,
        };
        state.bootstrap();
        state
    }

    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn bootstrap(&mut self) {
        self.define(OBJECT, None, &[], false, 0, &[("<init>", "()V", false)]);
        self.define(
            "java.lang.Class",
            Some(OBJECT),
            &[],
            false,
            0,
            &[(
                "forName",
                "(Ljava/lang/String;ZLjava/lang/ClassLoader;)Ljava/lang/Class;",
                true,
            )],
        );
        self.define(
            "java.lang.ClassLoader",
            Some(OBJECT),
            &[],
            false,
            0,
            &[("defineClass", "(Ljava/lang/String;[BII)Ljava/lang/Class;", false)],
        );
        let app_loader_class = self.define(
            "jdk.internal.loader.ClassLoaders$AppClassLoader",
            Some("java.lang.ClassLoader"),
            &[],
            false,
            0,
            &[],
        );
        self.app_loader = self.alloc(app_loader_class, HeapObject::ClassLoader);

        self.define(STRING, Some(OBJECT), &[], false, 0, &[("length", "()I", false)]);
        self.define("java.lang.Integer", Some(OBJECT), &[], false, 0, &[("intValue", "()I", false)]);
        self.define("java.lang.Long", Some(OBJECT), &[], false, 0, &[]);
        self.define("java.lang.Double", Some(OBJECT), &[], false, 0, &[]);
        self.define("java.lang.Boolean", Some(OBJECT), &[], false, 0, &[]);

        self.define("java.lang.Throwable", Some(OBJECT), &[], false, 0, &[]);
        self.define("java.lang.Exception", Some("java.lang.Throwable"), &[], false, 0, &[]);
        self.define("java.lang.RuntimeException", Some("java.lang.Exception"), &[], false, 0, &[]);
        for name in ["java.lang.IllegalStateException", NPE] {
            self.define(name, Some("java.lang.RuntimeException"), &[], false, 0, &[]);
        }
        self.define(CLASS_NOT_FOUND, Some("java.lang.Exception"), &[], false, 0, &[]);
        self.define(LINKAGE_ERROR, Some("java.lang.Throwable"), &[], false, 0, &[]);
        self.define(CLASS_FORMAT_ERROR, Some(LINKAGE_ERROR), &[], false, 0, &[]);

        for component in ["B", "I", "J", "D", "Z", "Ljava/lang/Object;"] {
            self.define_array(component, 0);
        }

        self.define("java.util.Map", None, &[], true, 0, &[]);
        self.define(
            "java.util.LinkedHashMap",
            Some(OBJECT),
            &["java.util.Map"],
            false,
            0,
            &[("<init>", "()V", false)],
        );
        self.define(
            "java.util.concurrent.atomic.AtomicInteger",
            Some(OBJECT),
            &[],
            false,
            0,
            &[
                ("<init>", "()V", false),
                ("<init>", "(I)V", false),
                ("get", "()I", false),
                ("incrementAndGet", "()I", false),
            ],
        );
        self.define(
            "java.util.Collection",
            None,
            &[],
            true,
            0,
            &[("stream", "()Ljava/util/stream/Stream;", false)],
        );
        self.define("java.util.List", None, &["java.util.Collection"], true, 0, &[]);
        self.define(
            "java.util.ArrayList",
            Some(OBJECT),
            &["java.util.List"],
            false,
            0,
            &[("size", "()I", false)],
        );
        self.define(
            "java.util.Optional",
            Some(OBJECT),
            &[],
            false,
            0,
            &[
                ("isPresent", "()Z", false),
                ("orElse", "(Ljava/lang/Object;)Ljava/lang/Object;", false),
            ],
        );
        self.define(
            "java.util.OptionalInt",
            Some(OBJECT),
            &[],
            false,
            0,
            &[("isPresent", "()Z", false), ("orElse", "(I)I", false)],
        );

        for (name, method, descriptor) in FUNCTIONAL_INTERFACES {
            self.define_abstract(name, &[], &[(method, descriptor)]);
        }

        self.define_abstract(
            "java.util.stream.BaseStream",
            &[],
            &[
                ("sequential", "()Ljava/util/stream/BaseStream;"),
                ("parallel", "()Ljava/util/stream/BaseStream;"),
            ],
        );
        self.define_abstract(
            "java.util.stream.Stream",
            &["java.util.stream.BaseStream"],
            &stream_methods(ElementType::Object),
        );
        self.define_abstract(
            "java.util.stream.IntStream",
            &["java.util.stream.BaseStream"],
            &stream_methods(ElementType::Int),
        );
        self.define(
            "java.util.stream.AbstractPipeline",
            Some(OBJECT),
            &["java.util.stream.BaseStream"],
            false,
            0,
            &[
                ("sequential", "()Ljava/util/stream/BaseStream;", false),
                ("parallel", "()Ljava/util/stream/BaseStream;", false),
            ],
        );
        for (name, interface, element) in [
            (
                "java.util.stream.ReferencePipeline",
                "java.util.stream.Stream",
                ElementType::Object,
            ),
            ("java.util.stream.IntPipeline", "java.util.stream.IntStream", ElementType::Int),
        ] {
            let methods: Vec<(&str, &str, bool)> = stream_methods(element)
                .into_iter()
                .map(|(name, descriptor)| (name, descriptor, false))
                .collect();
            self.define(
                name,
                Some("java.util.stream.AbstractPipeline"),
                &[interface],
                false,
                0,
                &methods,
            );
        }

        for (name, method, descriptor) in FUNCTIONAL_INTERFACES {
            let simple = name.rsplit('.').next().unwrap_or(name);
            self.define(
                &format!("Main$$Lambda${simple}"),
                Some(OBJECT),
                &[name],
                false,
                self.app_loader,
                &[(method, descriptor, false)],
            );
        }

        let app_loader = self.app_loader;
        self.define(
            MAIN,
            Some(OBJECT),
            &[],
            false,
            app_loader,
            &[("main", "([Ljava/lang/String;)V", true), ("run", "()V", false)],
        );
    }

    fn define(
        &mut self,
        name: &str,
        superclass: Option<&str>,
        interfaces: &[&str],
        is_interface: bool,
        loader: ObjectId,
        methods: &[(&str, &str, bool)],
    ) -> ReferenceTypeId {
        let id = self.next_id();
        let superclass = superclass.and_then(|s| self.class_named(s, loader));
        let interfaces = interfaces
            .iter()
            .filter_map(|i| self.class_named(i, loader))
            .collect();
        let methods = methods
            .iter()
            .map(|(name, descriptor, is_static)| MethodDef {
                id: self.next_id(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                is_static: *is_static,
                is_abstract: false,
            })
            .collect();
        self.classes.push(ClassDef {
            id,
            name: name.to_string(),
            signature: type_name_to_signature(name),
            is_interface,
            is_array: false,
            superclass,
            interfaces,
            methods,
            loader,
            class_object: None,
            variables: HashMap::new(),
        });
        id
    }

    fn define_abstract(&mut self, name: &str, interfaces: &[&str], methods: &[(&str, &str)]) {
        let methods: Vec<(&str, &str, bool)> = methods.iter().map(|(n, d)| (*n, *d, false)).collect();
        let id = self.define(name, None, interfaces, true, 0, &methods);
        if let Some(class) = self.classes.iter_mut().find(|c| c.id == id) {
            for method in &mut class.methods {
                method.is_abstract = true;
            }
        }
    }

    fn define_array(&mut self, component: &str, loader: ObjectId) -> ReferenceTypeId {
        let signature = format!("[{component}");
        let name = signature_to_type_name(&signature).unwrap_or_else(|| signature.clone());
        let id = self.next_id();
        let superclass = self.class_named(OBJECT, 0);
        self.classes.push(ClassDef {
            id,
            name,
            signature,
            is_interface: false,
            is_array: true,
            superclass,
            interfaces: Vec::new(),
            methods: Vec::new(),
            loader,
            class_object: None,
            variables: HashMap::new(),
        });
        id
    }

    /// Installs the local variable table of `Main.run`.
    pub fn set_run_variables(&mut self, variables: Vec<VariableInfo>) {
        let Some(class) = self.classes.iter_mut().find(|c| c.name == MAIN) else {
            return;
        };
        if let Some(run) = class.methods.iter().find(|m| m.name == "run").map(|m| m.id) {
            class.variables.insert(run, variables);
        }
    }

    pub fn class(&self, id: ReferenceTypeId) -> VmResult<&ClassDef> {
        self.classes
            .iter()
            .find(|c| c.id == id)
            .ok_or(JdwpError::VmError(ERROR_INVALID_CLASS))
    }

    /// A class visible to `loader`: its own or a bootstrap class.
    pub fn class_named(&self, name: &str, loader: ObjectId) -> Option<ReferenceTypeId> {
        self.classes
            .iter()
            .find(|c| c.name == name && (c.loader == 0 || c.loader == loader))
            .map(|c| c.id)
    }

    pub fn classes_by_signature(&self, signature: &str) -> Vec<ClassInfo> {
        self.classes
            .iter()
            .filter(|c| c.signature == signature)
            .map(|c| ClassInfo {
                ref_type_tag: c.type_tag(),
                type_id: c.id,
                signature: c.signature.clone(),
                status: 7,
            })
            .collect()
    }

    pub fn methods(&self, class: ReferenceTypeId) -> VmResult<Vec<MethodInfo>> {
        Ok(self
            .class(class)?
            .methods
            .iter()
            .map(|m| MethodInfo {
                method_id: m.id,
                name: m.name.clone(),
                signature: m.descriptor.clone(),
                mod_bits: if m.is_static { MODIFIER_STATIC } else { 0x0001 },
            })
            .collect())
    }

    pub fn method_of(&self, class: ReferenceTypeId, method: MethodId) -> VmResult<&MethodDef> {
        self.class(class)?
            .methods
            .iter()
            .find(|m| m.id == method)
            .ok_or(JdwpError::VmError(ERROR_INVALID_METHODID))
    }

    /// Virtual dispatch: the first concrete `name`+`descriptor` found from
    /// `class` up through superclasses, then default methods of interfaces.
    pub fn dispatch(
        &self,
        class: ReferenceTypeId,
        name: &str,
        descriptor: &str,
    ) -> Option<(ReferenceTypeId, MethodId)> {
        let mut queue = VecDeque::from([class]);
        let mut interfaces = Vec::new();
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front().or_else(|| {
            if interfaces.is_empty() {
                None
            } else {
                Some(interfaces.remove(0))
            }
        }) {
            if !seen.insert(current) {
                continue;
            }
            let Ok(def) = self.class(current) else { continue };
            if let Some(method) = def.method(name, descriptor).filter(|m| !m.is_abstract) {
                return Some((current, method.id));
            }
            queue.extend(def.superclass);
            interfaces.extend(def.interfaces.iter().copied());
        }
        None
    }

    pub fn is_subtype(&self, class: ReferenceTypeId, of: ReferenceTypeId) -> bool {
        let mut queue = VecDeque::from([class]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if current == of {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Ok(def) = self.class(current) {
                queue.extend(def.superclass);
                queue.extend(def.interfaces.iter().copied());
            }
        }
        false
    }

    pub fn location(&self, class: ReferenceTypeId, method: MethodId, index: u64) -> Location {
        Location {
            type_tag: self.class(class).map(ClassDef::type_tag).unwrap_or(TYPE_TAG_CLASS),
            class_id: class,
            method_id: method,
            index,
        }
    }

    pub fn alloc(&mut self, class: ReferenceTypeId, object: HeapObject) -> ObjectId {
        let id = self.next_id();
        self.heap.insert(id, HeapEntry { class, object });
        id
    }

    pub fn alloc_named(&mut self, class_name: &str, object: HeapObject) -> ObjectId {
        let class = self.class_named(class_name, self.app_loader).unwrap_or_default();
        self.alloc(class, object)
    }

    pub fn entry(&self, id: ObjectId) -> VmResult<&HeapEntry> {
        self.heap.get(&id).ok_or(JdwpError::VmError(ERROR_INVALID_OBJECT))
    }

    pub fn entry_mut(&mut self, id: ObjectId) -> VmResult<&mut HeapEntry> {
        self.heap
            .get_mut(&id)
            .ok_or(JdwpError::VmError(ERROR_INVALID_OBJECT))
    }

    /// The tagged value referring to heap object `id`.
    pub fn value_of(&self, id: ObjectId) -> JdwpValue {
        let tag = match self.heap.get(&id).map(|e| &e.object) {
            Some(HeapObject::Str(_)) => TAG_STRING,
            Some(HeapObject::Array { .. }) => TAG_ARRAY,
            Some(HeapObject::ClassObject(_)) => TAG_CLASS_OBJECT,
            Some(HeapObject::ClassLoader) => TAG_CLASS_LOADER,
            _ => TAG_OBJECT,
        };
        JdwpValue::Object { tag, id }
    }

    pub fn new_string(&mut self, value: &str) -> JdwpValue {
        let id = self.alloc_named(STRING, HeapObject::Str(value.to_string()));
        self.value_of(id)
    }

    pub fn string(&self, value: JdwpValue) -> Option<String> {
        match self.heap.get(&value.object_id()?).map(|e| &e.object) {
            Some(HeapObject::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn new_array(&mut self, component: &str, values: Vec<JdwpValue>) -> JdwpValue {
        let signature = format!("[{component}");
        let class = match self.classes.iter().find(|c| c.signature == signature) {
            Some(class) => class.id,
            None => self.define_array(component, 0),
        };
        let id = self.alloc(
            class,
            HeapObject::Array {
                component: component.to_string(),
                values,
            },
        );
        self.value_of(id)
    }

    pub fn new_throwable(&mut self, class_name: &str) -> ObjectId {
        self.alloc_named(class_name, HeapObject::Throwable)
    }

    /// A host element as a reference (`Object[]` slots, `Optional.orElse`).
    pub fn boxed(&mut self, element: &Element) -> JdwpValue {
        let class = match element {
            Element::Null => return JdwpValue::NULL,
            Element::Str(s) => return self.new_string(s),
            Element::Bool(_) => "java.lang.Boolean",
            Element::Int(_) => "java.lang.Integer",
            Element::Long(_) => "java.lang.Long",
            Element::Double(_) => "java.lang.Double",
        };
        let id = self.alloc_named(class, HeapObject::Boxed(element.clone()));
        self.value_of(id)
    }

    pub fn primitive(element: &Element) -> JdwpValue {
        match element {
            Element::Bool(v) => JdwpValue::Boolean(*v),
            Element::Int(v) => JdwpValue::Int(*v),
            Element::Long(v) => JdwpValue::Long(*v),
            Element::Double(v) => JdwpValue::Double(*v),
            Element::Null | Element::Str(_) => JdwpValue::NULL,
        }
    }

    pub fn materialize(&mut self, element: &Element, stream: ElementType) -> JdwpValue {
        match stream {
            ElementType::Object => self.boxed(element),
            _ => Self::primitive(element),
        }
    }

    // --- frames -------------------------------------------------------------

    pub fn frame_mut(&mut self, id: FrameId) -> VmResult<&mut Frame> {
        self.frames
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(JdwpError::VmError(ERROR_INVALID_FRAMEID))
    }

    pub fn frames_top_down(&self, start: i32, length: i32) -> Vec<FrameInfo> {
        let all = self.frames.iter().rev().skip(start.max(0) as usize);
        let frames: Vec<FrameInfo> = all
            .map(|f| FrameInfo {
                frame_id: f.id,
                location: f.location,
            })
            .collect();
        if length < 0 {
            frames
        } else {
            frames.into_iter().take(length as usize).collect()
        }
    }

    pub fn get_slots(&mut self, frame: FrameId, slots: &[(u32, String)]) -> VmResult<Vec<JdwpValue>> {
        let frame = self.frame_mut(frame)?;
        slots
            .iter()
            .map(|(slot, _)| {
                frame
                    .slots
                    .get(slot)
                    .copied()
                    .ok_or(JdwpError::VmError(ERROR_INVALID_SLOT))
            })
            .collect()
    }

    pub fn set_slots(&mut self, frame: FrameId, values: &[(u32, JdwpValue)]) -> VmResult<()> {
        let target = self.frame_mut(frame)?;
        for (slot, value) in values {
            let current = target
                .slots
                .get(slot)
                .ok_or(JdwpError::VmError(ERROR_INVALID_SLOT))?;
            if current.is_reference() != value.is_reference() {
                return Err(JdwpError::VmError(ERROR_TYPE_MISMATCH));
            }
            target.slots.insert(*slot, *value);
        }
        self.frame_writes
            .extend(values.iter().map(|(slot, value)| (frame, *slot, *value)));
        Ok(())
    }

    // --- event requests -------------------------------------------------------

    pub fn add_request(&mut self, kind: u8, modifiers: Vec<EventModifier>) -> i32 {
        let id = self.next_request;
        self.next_request += 1;
        self.requests.push(ActiveRequest {
            id,
            kind,
            modifiers,
            depth: self.frames.len(),
        });
        if is_method_kind(kind) {
            self.method_requests_set += 1;
            let enabled = self.requests.iter().filter(|r| is_method_kind(r.kind)).count();
            self.max_enabled_method_requests = self.max_enabled_method_requests.max(enabled);
        }
        id
    }

    pub fn clear_request(&mut self, kind: u8, id: i32) {
        self.requests.retain(|r| !(r.kind == kind && r.id == id));
    }

    pub fn active_requests(&self) -> usize {
        self.requests.len()
    }

    fn modifiers_match(&self, request: &ActiveRequest, location: &Location) -> bool {
        request.modifiers.iter().all(|modifier| match modifier {
            EventModifier::ThreadOnly { thread } => *thread == MAIN_THREAD,
            EventModifier::ClassOnly { class_id } => self.is_subtype(location.class_id, *class_id),
            EventModifier::LocationOnly { location: only } => only == location,
            _ => true,
        })
    }

    /// Takes the request from the table when its count runs out.
    fn fire(&mut self, index: usize) -> i32 {
        let id = self.requests[index].id;
        let once = self.requests[index]
            .modifiers
            .iter()
            .any(|m| matches!(m, EventModifier::Count { .. }));
        if once {
            self.requests.remove(index);
        }
        id
    }

    pub fn method_event(&mut self, kind: u8, location: Location, value: JdwpValue) -> Option<JdwpEvent> {
        let index = self
            .requests
            .iter()
            .position(|r| r.kind == kind && self.modifiers_match(r, &location))?;
        let request_id = self.fire(index);
        Some(match kind {
            EVENT_KIND_METHOD_ENTRY => JdwpEvent::MethodEntry {
                request_id,
                thread: MAIN_THREAD,
                location,
            },
            _ => JdwpEvent::MethodExitWithReturnValue {
                request_id,
                thread: MAIN_THREAD,
                location,
                value,
            },
        })
    }

    fn armed_at(&self, kind: u8, location: &Location) -> bool {
        self.requests
            .iter()
            .any(|r| r.kind == kind && self.modifiers_match(r, location))
    }

    /// Whether an exception leaving a debugger invocation would be reported.
    fn exception_armed(&self) -> bool {
        self.requests.iter().any(|r| {
            r.kind == EVENT_KIND_EXCEPTION
                && r.modifiers.iter().all(|m| match m {
                    EventModifier::ExceptionOnly { uncaught, .. } => *uncaught,
                    EventModifier::ThreadOnly { thread } => *thread == MAIN_THREAD,
                    _ => true,
                })
        })
    }

    /// An event raised inside a debugger invocation suspends the invoking
    /// thread, so the reply never arrives.
    fn stall(&mut self, invocation: String) -> VmResult<InvokeOutcome> {
        self.stalled_invocations.push(invocation);
        Err(JdwpError::Timeout)
    }

    /// Runs `body` as a debugger invocation of the method at `entered`.
    fn invocation(
        &mut self,
        what: String,
        entered: Location,
        body: impl FnOnce(&mut Self) -> VmResult<InvokeOutcome>,
    ) -> VmResult<InvokeOutcome> {
        if self.armed_at(EVENT_KIND_METHOD_ENTRY, &entered) {
            return self.stall(format!("{what}: method entry"));
        }
        let outcome = body(self)?;
        if outcome.exception.is_some() {
            if self.exception_armed() {
                return self.stall(format!("{what}: exception"));
            }
        } else if self.armed_at(EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE, &entered) {
            return self.stall(format!("{what}: method exit"));
        }
        self.invocations.push(what);
        Ok(outcome)
    }

    pub fn step_event(&mut self, point: StepPoint) -> Option<JdwpEvent> {
        let depth_now = self.frames.len();
        let location = self.frames.last()?.location;
        let index = self.requests.iter().position(|r| {
            r.kind == EVENT_KIND_SINGLE_STEP
                && r.modifiers.iter().any(|m| match m {
                    EventModifier::Step { depth, .. } => match point {
                        StepPoint::Entered => *depth == STEP_DEPTH_INTO,
                        StepPoint::Returned => {
                            *depth == STEP_DEPTH_INTO
                                || (*depth == STEP_DEPTH_OUT && depth_now < r.depth)
                                || (*depth == STEP_DEPTH_OVER && depth_now <= r.depth)
                        }
                    },
                    _ => false,
                })
        })?;
        let request_id = self.fire(index);
        Some(JdwpEvent::SingleStep {
            request_id,
            thread: MAIN_THREAD,
            location,
        })
    }

    pub fn exception_event(
        &mut self,
        exception: ObjectId,
        catch_location: Option<Location>,
    ) -> Option<JdwpEvent> {
        let location = self.frames.last()?.location;
        let index = self.requests.iter().position(|r| {
            r.kind == EVENT_KIND_EXCEPTION
                && r.modifiers.iter().all(|m| match m {
                    EventModifier::ExceptionOnly { caught, uncaught, .. } => {
                        if catch_location.is_some() {
                            *caught
                        } else {
                            *uncaught
                        }
                    }
                    EventModifier::ThreadOnly { thread } => *thread == MAIN_THREAD,
                    _ => true,
                })
        })?;
        let request_id = self.fire(index);
        Some(JdwpEvent::Exception {
            request_id,
            thread: MAIN_THREAD,
            location,
            exception,
            catch_location,
        })
    }

    // --- debugger invocations -------------------------------------------------

    pub fn new_instance(
        &mut self,
        class: ReferenceTypeId,
        method: MethodId,
        args: &[JdwpValue],
    ) -> VmResult<InvokeOutcome> {
        let (class_name, descriptor) = {
            let def = self.class(class)?;
            let method = self.method_of(class, method)?;
            if method.name != "<init>" {
                return Err(JdwpError::VmError(ERROR_INVALID_METHODID));
            }
            (def.name.clone(), method.descriptor.clone())
        };
        check_arguments(&descriptor, args)?;

        let entered = self.location(class, method, 0);
        let what = format!("new {class_name}{descriptor}");
        let args = args.to_vec();
        self.invocation(what, entered, move |state| {
            state.construct(class, &class_name, &descriptor, &args)
        })
    }

    fn construct(
        &mut self,
        class: ReferenceTypeId,
        class_name: &str,
        descriptor: &str,
        args: &[JdwpValue],
    ) -> VmResult<InvokeOutcome> {
        let object = match class_name {
            OBJECT => HeapObject::Plain,
            "java.util.LinkedHashMap" => HeapObject::Map(Vec::new()),
            "java.util.concurrent.atomic.AtomicInteger" => {
                HeapObject::Atomic(args.first().and_then(JdwpValue::as_int).unwrap_or(0))
            }
            UNIVERSAL_COLLECTOR if descriptor == UNIVERSAL_COLLECTOR_CTOR => {
                let map = args[0].object_id();
                if let Some(map) = map {
                    self.expect(map, |o| matches!(o, HeapObject::Map(_)))?;
                }
                let time = self.expect_atomic(args[1])?;
                HeapObject::Collector {
                    map,
                    time,
                    tick: args[2].as_bool().unwrap_or(false),
                }
            }
            OBJECT_MATCHER | INT_MATCHER | LONG_MATCHER | DOUBLE_MATCHER => {
                let before = self.expect_map(args[0])?;
                let after = self.expect_map(args[1])?;
                let time = self.expect_atomic(args[2])?;
                let predicate = args[3]
                    .object_id()
                    .ok_or(JdwpError::VmError(ERROR_TYPE_MISMATCH))?;
                HeapObject::Matcher {
                    before,
                    after,
                    time,
                    predicate,
                }
            }
            _ => return Err(JdwpError::VmError(ERROR_NOT_IMPLEMENTED)),
        };
        let id = self.alloc(class, object);
        Ok(InvokeOutcome {
            value: self.value_of(id),
            exception: None,
        })
    }

    fn expect(&self, id: ObjectId, check: impl Fn(&HeapObject) -> bool) -> VmResult<ObjectId> {
        if check(&self.entry(id)?.object) {
            Ok(id)
        } else {
            Err(JdwpError::VmError(ERROR_TYPE_MISMATCH))
        }
    }

    fn expect_map(&self, value: JdwpValue) -> VmResult<ObjectId> {
        let id = value
            .object_id()
            .ok_or(JdwpError::VmError(ERROR_TYPE_MISMATCH))?;
        self.expect(id, |o| matches!(o, HeapObject::Map(_)))
    }

    fn expect_atomic(&self, value: JdwpValue) -> VmResult<ObjectId> {
        let id = value
            .object_id()
            .ok_or(JdwpError::VmError(ERROR_TYPE_MISMATCH))?;
        self.expect(id, |o| matches!(o, HeapObject::Atomic(_)))
    }

    fn returned(value: JdwpValue) -> VmResult<InvokeOutcome> {
        Ok(InvokeOutcome {
            value,
            exception: None,
        })
    }

    fn thrown(&mut self, class_name: &str) -> VmResult<InvokeOutcome> {
        let exception = self.new_throwable(class_name);
        Ok(InvokeOutcome {
            value: JdwpValue::NULL,
            exception: Some(exception),
        })
    }

    /// `ClassType.InvokeMethod` and `ObjectReference.InvokeMethod`.
    pub fn invoke(
        &mut self,
        receiver: Option<ObjectId>,
        class: ReferenceTypeId,
        method: MethodId,
        args: &[JdwpValue],
    ) -> VmResult<InvokeOutcome> {
        let (class_name, name, descriptor, is_static) = {
            let def = self.class(class)?;
            let method = self.method_of(class, method)?;
            (
                def.name.clone(),
                method.name.clone(),
                method.descriptor.clone(),
                method.is_static,
            )
        };
        if is_static != receiver.is_none() {
            return Err(JdwpError::VmError(ERROR_INVALID_METHODID));
        }
        check_arguments(&descriptor, args)?;

        if let Some(receiver) = receiver {
            let runtime = self.entry(receiver)?.class;
            if !self.is_subtype(runtime, class) {
                return Err(JdwpError::VmError(ERROR_INVALID_METHODID));
            }
        }

        let entered = match receiver {
            Some(receiver) => {
                let runtime = self.entry(receiver)?.class;
                let (class, method) = self
                    .dispatch(runtime, &name, &descriptor)
                    .unwrap_or((class, method));
                self.location(class, method, 0)
            }
            None => self.location(class, method, 0),
        };
        let what = format!("{class_name}.{name}{descriptor}");
        let args = args.to_vec();
        self.invocation(what, entered, move |state| {
            match (class_name.as_str(), name.as_str(), receiver) {
                ("java.lang.Class", "forName", None) => state.for_name(&args),
                (STREAM_DEBUGGER_UTILS, format, None) if descriptor == FORMAT_MAP_DESCRIPTOR => {
                    state.format_map(format, args[0])
                }
                (_, "defineClass", Some(loader)) => state.define_helper(loader, &args),
                (_, _, Some(receiver)) => state.invoke_virtual(receiver, &name, &descriptor, &args),
                _ => Err(JdwpError::VmError(ERROR_NOT_IMPLEMENTED)),
            }
        })
    }

    fn invoke_virtual(
        &mut self,
        receiver: ObjectId,
        name: &str,
        descriptor: &str,
        args: &[JdwpValue],
    ) -> VmResult<InvokeOutcome> {
        let class = self.entry(receiver)?.class;
        let value = match (&self.entry(receiver)?.object, name) {
            (HeapObject::Str(s), "length") => JdwpValue::Int(s.encode_utf16().count() as i32),
            (HeapObject::Boxed(Element::Int(v)), "intValue") => JdwpValue::Int(*v),
            (HeapObject::List(items), "size") => JdwpValue::Int(items.len() as i32),
            (HeapObject::Atomic(v), "get") => JdwpValue::Int(*v),
            (HeapObject::Atomic(_), "incrementAndGet") => {
                let HeapObject::Atomic(v) = &mut self.entry_mut(receiver)?.object else {
                    return Err(JdwpError::VmError(ERROR_INVALID_OBJECT));
                };
                *v += 1;
                JdwpValue::Int(*v)
            }
            (HeapObject::Optional(content), "isPresent") => JdwpValue::Boolean(content.is_some()),
            (HeapObject::Optional(content), "orElse") => {
                let content = content.clone();
                let primitive = descriptor == "(I)I";
                match content {
                    Some(element) if primitive => Self::primitive(&element),
                    Some(element) => self.boxed(&element),
                    None => args[0],
                }
            }
            (HeapObject::Stream { element, .. }, "peek") => {
                let element = *element;
                let consumer = args[0]
                    .object_id()
                    .ok_or(JdwpError::VmError(ERROR_TYPE_MISMATCH))?;
                let id = self.alloc(
                    class,
                    HeapObject::Stream {
                        element,
                        op: StreamOp::Peek {
                            upstream: receiver,
                            consumer,
                        },
                    },
                );
                self.value_of(id)
            }
            (HeapObject::Stream { element, .. }, "sequential" | "parallel") => {
                let element = *element;
                let id = self.alloc(
                    class,
                    HeapObject::Stream {
                        element,
                        op: StreamOp::Pass { upstream: receiver },
                    },
                );
                self.value_of(id)
            }
            _ => return Err(JdwpError::VmError(ERROR_NOT_IMPLEMENTED)),
        };
        Self::returned(value)
    }

    /// `Class.forName(name, initialize, loader)`.
    fn for_name(&mut self, args: &[JdwpValue]) -> VmResult<InvokeOutcome> {
        let name = self
            .string(args[0])
            .ok_or(JdwpError::VmError(ERROR_TYPE_MISMATCH))?;
        let loader = args[2].object_id().unwrap_or(0);

        let class = if let Some(component) = name.strip_prefix('[') {
            let signature = name.replace('.', "/");
            match self.classes.iter().find(|c| c.signature == signature) {
                Some(class) => Some(class.id),
                None => {
                    let component = component.replace('.', "/");
                    let known = match signature_to_type_name(&component) {
                        Some(element) if component.starts_with('L') => {
                            self.class_named(&element, loader).is_some()
                        }
                        Some(_) => true,
                        None => false,
                    };
                    known.then(|| self.define_array(&component, 0))
                }
            }
        } else {
            self.class_named(&name, loader)
        };

        let Some(class) = class else {
            return self.thrown(CLASS_NOT_FOUND);
        };
        let object = self.class_object(class)?;
        Self::returned(JdwpValue::Object {
            tag: TAG_CLASS_OBJECT,
            id: object,
        })
    }

    pub fn class_object(&mut self, class: ReferenceTypeId) -> VmResult<ObjectId> {
        if let Some(id) = self.class(class)?.class_object {
            return Ok(id);
        }
        let class_class = self.class_named("java.lang.Class", 0).unwrap_or_default();
        let id = self.alloc(class_class, HeapObject::ClassObject(class));
        if let Some(def) = self.classes.iter_mut().find(|c| c.id == class) {
            def.class_object = Some(id);
        }
        Ok(id)
    }

    /// `ClassLoader.defineClass(name, bytes, offset, length)` for the helper classes.
    fn define_helper(&mut self, loader: ObjectId, args: &[JdwpValue]) -> VmResult<InvokeOutcome> {
        let name = self
            .string(args[0])
            .ok_or(JdwpError::VmError(ERROR_TYPE_MISMATCH))?;
        let bytes = match args[1].object_id().map(|id| self.entry(id)) {
            Some(Ok(HeapEntry {
                object: HeapObject::Array { values, .. },
                ..
            })) => values.clone(),
            _ => return Err(JdwpError::VmError(ERROR_TYPE_MISMATCH)),
        };
        let magic = [0xca_u8, 0xfe, 0xba, 0xbe].map(|b| JdwpValue::Byte(b as i8));
        if !bytes.starts_with(&magic) {
            return self.thrown(CLASS_FORMAT_ERROR);
        }
        if self
            .classes
            .iter()
            .any(|c| c.name == name && c.loader == loader)
        {
            return self.thrown(LINKAGE_ERROR);
        }

        let class = match name.as_str() {
            STREAM_DEBUGGER_UTILS => {
                let methods: Vec<(&str, &str, bool)> = [
                    ElementType::Object,
                    ElementType::Int,
                    ElementType::Long,
                    ElementType::Double,
                ]
                .iter()
                .map(|e| (e.format_method(), FORMAT_MAP_DESCRIPTOR, true))
                .collect();
                self.define(&name, Some(OBJECT), &[], false, loader, &methods)
            }
            UNIVERSAL_COLLECTOR => self.define(
                &name,
                Some(OBJECT),
                &["java.util.function.Consumer", "java.util.function.IntConsumer"],
                false,
                loader,
                &[
                    ("<init>", UNIVERSAL_COLLECTOR_CTOR, false),
                    ("accept", "(Ljava/lang/Object;)V", false),
                    ("accept", "(I)V", false),
                ],
            ),
            OBJECT_MATCHER | INT_MATCHER | LONG_MATCHER | DOUBLE_MATCHER => {
                let predicate = match name.as_str() {
                    OBJECT_MATCHER => "java.util.function.Predicate",
                    INT_MATCHER => "java.util.function.IntPredicate",
                    LONG_MATCHER => "java.util.function.LongPredicate",
                    _ => "java.util.function.DoublePredicate",
                };
                let ctor = matcher_for_predicate(predicate)
                    .map(|(_, ctor)| ctor)
                    .unwrap_or_default();
                self.define(
                    &name,
                    Some(OBJECT),
                    &[predicate],
                    false,
                    loader,
                    &[("<init>", ctor.as_str(), false)],
                )
            }
            _ => return self.thrown(CLASS_FORMAT_ERROR),
        };
        *self.defined.entry(name).or_default() += 1;

        let object = self.class_object(class)?;
        Self::returned(JdwpValue::Object {
            tag: TAG_CLASS_OBJECT,
            id: object,
        })
    }

    /// `StreamDebuggerUtils.formatXMap(map)`: `{int[] keys, X[] values}`.
    fn format_map(&mut self, method: &str, map: JdwpValue) -> VmResult<InvokeOutcome> {
        let map = self.expect_map(map)?;
        let HeapObject::Map(entries) = &self.entry(map)?.object else {
            return Err(JdwpError::VmError(ERROR_TYPE_MISMATCH));
        };
        let entries = entries.clone();
        let element = [
            ElementType::Object,
            ElementType::Int,
            ElementType::Long,
            ElementType::Double,
        ]
        .into_iter()
        .find(|e| e.format_method() == method)
        .unwrap_or(ElementType::Object);

        let keys = entries.iter().map(|(k, _)| JdwpValue::Int(*k)).collect();
        let values = entries
            .iter()
            .map(|(_, v)| self.materialize(v, element))
            .collect();
        let component = match element {
            ElementType::Object => "Ljava/lang/Object;",
            ElementType::Int => "I",
            ElementType::Long => "J",
            ElementType::Double => "D",
        };
        let keys = self.new_array("I", keys);
        let values = self.new_array(component, values);
        let result = self.new_array("Ljava/lang/Object;", vec![keys, values]);
        Self::returned(result)
    }

    pub fn array_set(&mut self, array: ObjectId, first: i32, values: &[JdwpValue]) -> VmResult<()> {
        let HeapObject::Array {
            component,
            values: slots,
        } = &mut self.entry_mut(array)?.object
        else {
            return Err(JdwpError::VmError(ERROR_INVALID_OBJECT));
        };
        let reference = component.starts_with('L') || component.starts_with('[');
        for value in values {
            let ok = if reference {
                value.is_reference()
            } else {
                component.as_bytes().first() == Some(&value.tag())
            };
            if !ok {
                return Err(JdwpError::VmError(ERROR_TYPE_MISMATCH));
            }
        }
        let first = first.max(0) as usize;
        if first + values.len() > slots.len() {
            return Err(JdwpError::VmError(nova_jdwp::wire::ERROR_INVALID_INDEX));
        }
        slots[first..first + values.len()].copy_from_slice(values);
        Ok(())
    }
}

fn is_method_kind(kind: u8) -> bool {
    kind == EVENT_KIND_METHOD_ENTRY || kind == EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE
}

/// Rejects argument lists whose count or primitive kinds disagree with `descriptor`.
fn check_arguments(descriptor: &str, args: &[JdwpValue]) -> VmResult<()> {
    let params = parameter_tags(descriptor);
    if params.len() != args.len() {
        return Err(JdwpError::VmError(ERROR_TYPE_MISMATCH));
    }
    for (param, arg) in params.iter().zip(args) {
        let ok = match param {
            b'L' | b'[' => arg.is_reference(),
            tag => arg.tag() == *tag,
        };
        if !ok {
            return Err(JdwpError::VmError(ERROR_TYPE_MISMATCH));
        }
    }
    Ok(())
}

/// First character of every parameter type in a method descriptor.
pub(super) fn parameter_tags(descriptor: &str) -> Vec<u8> {
    let bytes = descriptor.as_bytes();
    let mut tags = Vec::new();
    let mut i = 1;
    while i < bytes.len() && bytes[i] != b')' {
        let start = i;
        while bytes[i] == b'[' {
            i += 1;
        }
        if bytes[i] == b'L' {
            while i < bytes.len() && bytes[i] != b';' {
                i += 1;
            }
        }
        i += 1;
        tags.push(bytes[start]);
    }
    tags
}

/// `(interface, method, descriptor)` of the functional interfaces lambdas implement.
pub(super) const FUNCTIONAL_INTERFACES: [(&str, &str, &str); 6] = [
    ("java.util.function.Predicate", "test", "(Ljava/lang/Object;)Z"),
    ("java.util.function.Function", "apply", "(Ljava/lang/Object;)Ljava/lang/Object;"),
    ("java.util.function.Consumer", "accept", "(Ljava/lang/Object;)V"),
    ("java.util.function.IntPredicate", "test", "(I)Z"),
    ("java.util.function.IntUnaryOperator", "applyAsInt", "(I)I"),
    ("java.util.function.IntConsumer", "accept", "(I)V"),
];

/// Declared stream methods as `(name, descriptor)`.
pub(super) fn stream_methods(element: ElementType) -> Vec<(&'static str, &'static str)> {
    match element {
        ElementType::Int => vec![
            ("filter", "(Ljava/util/function/IntPredicate;)Ljava/util/stream/IntStream;"),
            ("map", "(Ljava/util/function/IntUnaryOperator;)Ljava/util/stream/IntStream;"),
            ("peek", "(Ljava/util/function/IntConsumer;)Ljava/util/stream/IntStream;"),
            ("parallel", "()Ljava/util/stream/IntStream;"),
            ("count", "()J"),
            ("anyMatch", "(Ljava/util/function/IntPredicate;)Z"),
            ("findFirst", "()Ljava/util/OptionalInt;"),
            ("forEach", "(Ljava/util/function/IntConsumer;)V"),
        ],
        _ => vec![
            ("filter", "(Ljava/util/function/Predicate;)Ljava/util/stream/Stream;"),
            ("map", "(Ljava/util/function/Function;)Ljava/util/stream/Stream;"),
            ("peek", "(Ljava/util/function/Consumer;)Ljava/util/stream/Stream;"),
            ("count", "()J"),
            ("anyMatch", "(Ljava/util/function/Predicate;)Z"),
            ("findFirst", "()Ljava/util/Optional;"),
            ("toList", "()Ljava/util/List;"),
            ("forEach", "(Ljava/util/function/Consumer;)V"),
        ],
    }
}
