use thiserror::Error;

pub type ObjectId = u64;
pub type ThreadId = u64;
pub type FrameId = u64;
pub type MethodId = u64;
pub type ReferenceTypeId = u64;

pub type Result<T> = std::result::Result<T, JdwpError>;

// Event kinds (JDWP `EventKind`).
pub const EVENT_KIND_SINGLE_STEP: u8 = 1;
pub const EVENT_KIND_BREAKPOINT: u8 = 2;
pub const EVENT_KIND_EXCEPTION: u8 = 4;
pub const EVENT_KIND_CLASS_PREPARE: u8 = 8;
pub const EVENT_KIND_METHOD_ENTRY: u8 = 40;
pub const EVENT_KIND_METHOD_EXIT: u8 = 41;
pub const EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE: u8 = 42;
pub const EVENT_KIND_VM_START: u8 = 90;
pub const EVENT_KIND_VM_DEATH: u8 = 99;

// Event request modifiers (JDWP `EventRequest.Set` modKind).
pub const EVENT_MODIFIER_KIND_COUNT: u8 = 1;
pub const EVENT_MODIFIER_KIND_THREAD_ONLY: u8 = 3;
pub const EVENT_MODIFIER_KIND_CLASS_ONLY: u8 = 4;
pub const EVENT_MODIFIER_KIND_CLASS_MATCH: u8 = 5;
pub const EVENT_MODIFIER_KIND_LOCATION_ONLY: u8 = 7;
pub const EVENT_MODIFIER_KIND_EXCEPTION_ONLY: u8 = 8;
pub const EVENT_MODIFIER_KIND_STEP: u8 = 10;

pub const SUSPEND_POLICY_NONE: u8 = 0;
pub const SUSPEND_POLICY_EVENT_THREAD: u8 = 1;
pub const SUSPEND_POLICY_ALL: u8 = 2;

pub const STEP_SIZE_MIN: u32 = 0;
pub const STEP_SIZE_LINE: u32 = 1;
pub const STEP_DEPTH_INTO: u32 = 0;
pub const STEP_DEPTH_OVER: u32 = 1;
pub const STEP_DEPTH_OUT: u32 = 2;

pub const INVOKE_SINGLE_THREADED: u32 = 0x01;
pub const INVOKE_NONVIRTUAL: u32 = 0x02;

pub const TYPE_TAG_CLASS: u8 = 1;
pub const TYPE_TAG_INTERFACE: u8 = 2;
pub const TYPE_TAG_ARRAY: u8 = 3;

pub const MODIFIER_STATIC: u32 = 0x0008;

/// Index of `canForceEarlyReturn` in the `CapabilitiesNew` reply.
pub const CAPABILITY_CAN_FORCE_EARLY_RETURN: usize = 20;

// JDWP error codes (subset).
pub const ERROR_INVALID_THREAD: u16 = 10;
pub const ERROR_THREAD_NOT_SUSPENDED: u16 = 13;
pub const ERROR_INVALID_OBJECT: u16 = 20;
pub const ERROR_INVALID_CLASS: u16 = 21;
pub const ERROR_CLASS_NOT_PREPARED: u16 = 22;
pub const ERROR_INVALID_METHODID: u16 = 23;
pub const ERROR_INVALID_FRAMEID: u16 = 30;
pub const ERROR_OPAQUE_FRAME: u16 = 32;
pub const ERROR_TYPE_MISMATCH: u16 = 34;
pub const ERROR_INVALID_SLOT: u16 = 35;
pub const ERROR_NOT_FOUND: u16 = 41;
pub const ERROR_NOT_IMPLEMENTED: u16 = 99;
pub const ERROR_INVALID_INDEX: u16 = 503;
pub const ERROR_INVALID_LENGTH: u16 = 504;

// Value tags for object-like values.
pub const TAG_OBJECT: u8 = b'L';
pub const TAG_ARRAY: u8 = b'[';
pub const TAG_STRING: u8 = b's';
pub const TAG_THREAD: u8 = b't';
pub const TAG_CLASS_LOADER: u8 = b'l';
pub const TAG_CLASS_OBJECT: u8 = b'c';

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error("timed out waiting for JDWP reply")]
    Timeout,
    #[error("JDWP request cancelled")]
    Cancelled,
    #[error("JDWP connection closed")]
    ConnectionClosed,
    #[error("JDWP command failed with error code {} ({})", .0, error_code_name(*.0))]
    VmError(u16),
}

impl JdwpError {
    /// The raw JDWP error code when the VM rejected a command.
    pub fn vm_error_code(&self) -> Option<u16> {
        match self {
            JdwpError::VmError(code) => Some(*code),
            _ => None,
        }
    }
}

pub fn error_code_name(code: u16) -> &'static str {
    match code {
        ERROR_INVALID_THREAD => "INVALID_THREAD",
        ERROR_THREAD_NOT_SUSPENDED => "THREAD_NOT_SUSPENDED",
        ERROR_INVALID_OBJECT => "INVALID_OBJECT",
        ERROR_INVALID_CLASS => "INVALID_CLASS",
        ERROR_CLASS_NOT_PREPARED => "CLASS_NOT_PREPARED",
        ERROR_INVALID_METHODID => "INVALID_METHODID",
        ERROR_INVALID_FRAMEID => "INVALID_FRAMEID",
        ERROR_OPAQUE_FRAME => "OPAQUE_FRAME",
        ERROR_TYPE_MISMATCH => "TYPE_MISMATCH",
        ERROR_INVALID_SLOT => "INVALID_SLOT",
        ERROR_NOT_FOUND => "NOT_FOUND",
        ERROR_NOT_IMPLEMENTED => "NOT_IMPLEMENTED",
        ERROR_INVALID_INDEX => "INVALID_INDEX",
        ERROR_INVALID_LENGTH => "INVALID_LENGTH",
        _ => "UNKNOWN",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JdwpIdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl Default for JdwpIdSizes {
    fn default() -> Self {
        Self {
            field_id: 8,
            method_id: 8,
            object_id: 8,
            reference_type_id: 8,
            frame_id: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

impl Location {
    /// Two locations are in the same method when class and method ids agree.
    pub fn same_method(&self, other: &Location) -> bool {
        self.class_id == other.class_id && self.method_id == other.method_id
    }
}

/// A JDWP value as it appears on the wire.
///
/// Object-like values carry their tag (`L`, `s`, `[`, ...) so they can be
/// re-encoded without another round-trip. The null reference is an object
/// value with id `0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JdwpValue {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object { tag: u8, id: ObjectId },
    Void,
}

impl JdwpValue {
    pub const NULL: JdwpValue = JdwpValue::Object {
        tag: TAG_OBJECT,
        id: 0,
    };

    pub fn object(id: ObjectId) -> Self {
        JdwpValue::Object { tag: TAG_OBJECT, id }
    }

    pub fn tag(&self) -> u8 {
        match *self {
            JdwpValue::Boolean(_) => b'Z',
            JdwpValue::Byte(_) => b'B',
            JdwpValue::Char(_) => b'C',
            JdwpValue::Short(_) => b'S',
            JdwpValue::Int(_) => b'I',
            JdwpValue::Long(_) => b'J',
            JdwpValue::Float(_) => b'F',
            JdwpValue::Double(_) => b'D',
            JdwpValue::Object { tag, .. } => tag,
            JdwpValue::Void => b'V',
        }
    }

    /// Non-null object id, if this is a reference.
    pub fn object_id(&self) -> Option<ObjectId> {
        match *self {
            JdwpValue::Object { id, .. } if id != 0 => Some(id),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JdwpValue::Object { id: 0, .. })
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, JdwpValue::Object { .. })
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self, JdwpValue::Object { .. } | JdwpValue::Void)
    }

    pub fn as_int(&self) -> Option<i32> {
        match *self {
            JdwpValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match *self {
            JdwpValue::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            JdwpValue::Boolean(v) => Some(v),
            _ => None,
        }
    }

    /// Java source name of the primitive type, e.g. `int`.
    pub fn primitive_type_name(&self) -> Option<&'static str> {
        Some(match self {
            JdwpValue::Boolean(_) => "boolean",
            JdwpValue::Byte(_) => "byte",
            JdwpValue::Char(_) => "char",
            JdwpValue::Short(_) => "short",
            JdwpValue::Int(_) => "int",
            JdwpValue::Long(_) => "long",
            JdwpValue::Float(_) => "float",
            JdwpValue::Double(_) => "double",
            JdwpValue::Object { .. } | JdwpValue::Void => return None,
        })
    }

    /// The all-zero value for a JNI type signature (`I` -> `0`, `L...;` -> null).
    pub fn default_for_signature(signature: &str) -> JdwpValue {
        match signature.as_bytes().first().copied() {
            Some(b'Z') => JdwpValue::Boolean(false),
            Some(b'B') => JdwpValue::Byte(0),
            Some(b'C') => JdwpValue::Char(0),
            Some(b'S') => JdwpValue::Short(0),
            Some(b'I') => JdwpValue::Int(0),
            Some(b'J') => JdwpValue::Long(0),
            Some(b'F') => JdwpValue::Float(0.0),
            Some(b'D') => JdwpValue::Double(0.0),
            Some(b'V') => JdwpValue::Void,
            Some(b'[') => JdwpValue::Object { tag: TAG_ARRAY, id: 0 },
            _ => JdwpValue::NULL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub ref_type_tag: u8,
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

impl MethodInfo {
    pub fn is_static(&self) -> bool {
        self.mod_bits & MODIFIER_STATIC != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub code_index: u64,
    pub name: String,
    pub signature: String,
    pub length: u32,
    pub slot: u32,
}

impl VariableInfo {
    /// Whether the variable is in scope at `index` within its method.
    pub fn is_visible_at(&self, index: u64) -> bool {
        index >= self.code_index && index < self.code_index + u64::from(self.length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JdwpEvent {
    SingleStep {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Exception {
        request_id: i32,
        thread: ThreadId,
        location: Location,
        exception: ObjectId,
        catch_location: Option<Location>,
    },
    MethodEntry {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    MethodExit {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    MethodExitWithReturnValue {
        request_id: i32,
        thread: ThreadId,
        location: Location,
        value: JdwpValue,
    },
    ClassPrepare {
        request_id: i32,
        thread: ThreadId,
        ref_type_tag: u8,
        type_id: ReferenceTypeId,
        signature: String,
        status: u32,
    },
    VmStart {
        request_id: i32,
        thread: ThreadId,
    },
    VmDeath,
}

impl JdwpEvent {
    pub fn request_id(&self) -> Option<i32> {
        match self {
            JdwpEvent::SingleStep { request_id, .. }
            | JdwpEvent::Breakpoint { request_id, .. }
            | JdwpEvent::Exception { request_id, .. }
            | JdwpEvent::MethodEntry { request_id, .. }
            | JdwpEvent::MethodExit { request_id, .. }
            | JdwpEvent::MethodExitWithReturnValue { request_id, .. }
            | JdwpEvent::ClassPrepare { request_id, .. }
            | JdwpEvent::VmStart { request_id, .. } => Some(*request_id),
            JdwpEvent::VmDeath => None,
        }
    }

    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            JdwpEvent::SingleStep { thread, .. }
            | JdwpEvent::Breakpoint { thread, .. }
            | JdwpEvent::Exception { thread, .. }
            | JdwpEvent::MethodEntry { thread, .. }
            | JdwpEvent::MethodExit { thread, .. }
            | JdwpEvent::MethodExitWithReturnValue { thread, .. }
            | JdwpEvent::ClassPrepare { thread, .. }
            | JdwpEvent::VmStart { thread, .. } => Some(*thread),
            JdwpEvent::VmDeath => None,
        }
    }
}

/// Outcome of `ClassType.InvokeMethod`/`ObjectReference.InvokeMethod`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvokeOutcome {
    pub value: JdwpValue,
    /// Thrown exception, if the invoked method completed abruptly.
    pub exception: Option<ObjectId>,
}
