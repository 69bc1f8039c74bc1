// File: src/value.rs
//
// Value representation and heap object kinds for the Ruff bytecode VM.
// Values are a small tagged union; heap objects (strings, functions,
// closures, ...) live behind a single generic GcRef pointer so the
// collector in `memory.rs` can walk them uniformly.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::vm::Vm;

/// A value on the operand stack, in a constant pool, or in a field/global slot.
///
/// `Empty` is an internal sentinel (hash-table tombstones, declared-but-
/// undefined globals, omitted default arguments) and is never produced by
/// source-level evaluation.
#[derive(Clone, Copy)]
pub enum Value {
    Bool(bool),
    Nil,
    Number(f64),
    Obj(GcRef),
    Empty,
}

impl Value {
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<GcRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }

    pub fn kind_of(&self) -> Option<ObjKind> {
        self.as_obj().map(|r| unsafe { r.as_ref() }.kind())
    }

    pub fn is_string(&self) -> bool {
        matches!(self.kind_of(), Some(ObjKind::Str))
    }

    pub fn as_string(&self) -> Option<&ObjString> {
        match self {
            Value::Obj(r) => match unsafe { &r.as_ref().data } {
                ObjData::Str(s) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&ObjFunction> {
        match self {
            Value::Obj(r) => match unsafe { &r.as_ref().data } {
                ObjData::Function(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&ObjClosure> {
        match self {
            Value::Obj(r) => match unsafe { &r.as_ref().data } {
                ObjData::Closure(c) => Some(c),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ObjClass> {
        match self {
            Value::Obj(r) => match unsafe { &r.as_ref().data } {
                ObjData::Class(c) => Some(c),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&ObjInstance> {
        match self {
            Value::Obj(r) => match unsafe { &r.as_ref().data } {
                ObjData::Instance(i) => Some(i),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_bound_method(&self) -> Option<&ObjBoundMethod> {
        match self {
            Value::Obj(r) => match unsafe { &r.as_ref().data } {
                ObjData::BoundMethod(b) => Some(b),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&ObjCollection> {
        match self {
            Value::Obj(r) => match unsafe { &r.as_ref().data } {
                ObjData::Collection(c) => Some(c),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&ObjNative> {
        match self {
            Value::Obj(r) => match unsafe { &r.as_ref().data } {
                ObjData::Native(n) => Some(n),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Nil => "nil",
            Value::Number(_) => "number",
            Value::Empty => "empty",
            Value::Obj(_) => match self.kind_of().unwrap() {
                ObjKind::Str => "string",
                ObjKind::Function => "function",
                ObjKind::Native => "native function",
                ObjKind::Closure => "function",
                ObjKind::Upvalue => "upvalue",
                ObjKind::Class => "class",
                ObjKind::Instance => "instance",
                ObjKind::BoundMethod => "method",
                ObjKind::Collection => "collection",
            },
        }
    }

    /// `hashValue` (spec §4.5): per-kind 32-bit hash used by `Table`.
    pub fn hash_value(&self) -> u32 {
        match self {
            Value::Bool(true) => 3,
            Value::Bool(false) => 4,
            Value::Nil => 8,
            Value::Empty => 0,
            Value::Number(n) => hash_double(*n),
            Value::Obj(r) => match unsafe { &r.as_ref().data } {
                ObjData::Str(s) => s.hash,
                _ => r.as_ptr() as usize as u32,
            },
        }
    }
}

fn hash_double(value: f64) -> u32 {
    let bits = (value + 1.0).to_bits();
    (bits as u32) ^ ((bits >> 32) as u32)
}

/// Value equality (spec §3): booleans/numbers by value (NaN != NaN),
/// `Nil` always equal, objects by pointer identity — which coincides with
/// content equality for strings because strings are interned.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            (Value::Empty, Value::Empty) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_value(self))
    }
}

/// Renders a value the way `print`/`toString` would.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Nil => "nil".to_string(),
        Value::Number(n) => format_number(*n),
        Value::Empty => "<empty>".to_string(),
        Value::Obj(r) => format_object(*r),
    }
}

fn format_number(n: f64) -> String {
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn format_object(r: GcRef) -> String {
    match unsafe { &r.as_ref().data } {
        ObjData::Str(s) => String::from_utf8_lossy(&s.bytes).into_owned(),
        ObjData::Function(f) => match f.name {
            Some(name) => format!("<fn {}>", format_object(name)),
            None => "<script>".to_string(),
        },
        ObjData::Native(n) => format!("<native fn {}>", format_object(n.name)),
        ObjData::Closure(c) => format_object(c.function),
        ObjData::Upvalue(_) => "<upvalue>".to_string(),
        ObjData::Class(c) => format!("<class {}>", format_object(c.name)),
        ObjData::Instance(i) => {
            let class = unsafe { i.class.as_ref() };
            match &class.data {
                ObjData::Class(c) => format!("<instance {}>", format_object(c.name)),
                _ => unreachable!(),
            }
        }
        ObjData::BoundMethod(b) => format_value(&b.method),
        ObjData::Collection(c) => {
            let items = c.items.borrow();
            let parts: Vec<String> = items.iter().map(format_value).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

/// Tag identifying the payload of a `GcObject`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjKind {
    Str,
    Function,
    Native,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
    Collection,
}

/// A pointer to a heap object. Objects are never moved or freed while
/// reachable from a GC root (operand stack, frames, globals, open
/// upvalues, or the in-progress compiler chain) — see `memory.rs`.
pub type GcRef = NonNull<GcObject>;

/// Every heap object: a mark bit (compared against `Heap::marker`, see
/// `memory.rs`), a forward link threading all live objects in allocation
/// order, and the kind-specific payload.
pub struct GcObject {
    pub marked: Cell<bool>,
    pub next: Cell<Option<GcRef>>,
    pub data: ObjData,
}

impl GcObject {
    pub fn kind(&self) -> ObjKind {
        match &self.data {
            ObjData::Str(_) => ObjKind::Str,
            ObjData::Function(_) => ObjKind::Function,
            ObjData::Native(_) => ObjKind::Native,
            ObjData::Closure(_) => ObjKind::Closure,
            ObjData::Upvalue(_) => ObjKind::Upvalue,
            ObjData::Class(_) => ObjKind::Class,
            ObjData::Instance(_) => ObjKind::Instance,
            ObjData::BoundMethod(_) => ObjKind::BoundMethod,
            ObjData::Collection(_) => ObjKind::Collection,
        }
    }

    /// Approximate heap footprint, used to drive `bytes_allocated`.
    pub fn size(&self) -> usize {
        std::mem::size_of::<GcObject>() + approx_data_size(&self.data)
    }
}

/// Payload-only portion of `GcObject::size`, usable before a payload has
/// been wrapped in a `GcObject` (the allocator needs a size estimate to
/// decide whether to collect *before* constructing the object).
pub fn approx_data_size(data: &ObjData) -> usize {
    match data {
        ObjData::Str(s) => s.bytes.len(),
        ObjData::Function(f) => f.chunk.approx_size(),
        ObjData::Native(_) => 0,
        ObjData::Closure(c) => c.upvalues.len() * std::mem::size_of::<GcRef>(),
        ObjData::Upvalue(_) => 0,
        ObjData::Class(c) => c.methods.approx_size(),
        ObjData::Instance(i) => i.fields.approx_size(),
        ObjData::BoundMethod(_) => 0,
        ObjData::Collection(c) => c.items.borrow().len() * std::mem::size_of::<Value>(),
    }
}

pub enum ObjData {
    Str(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Collection(ObjCollection),
}

/// Immutable UTF-8-agnostic byte sequence. All strings are interned:
/// pointer equality of two `ObjString`s implies content equality.
pub struct ObjString {
    pub bytes: Box<[u8]>,
    pub hash: u32,
}

impl ObjString {
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// FNV-1a, 32-bit (spec §3: "32-bit FNV-1a hash").
pub fn fnv1a(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// An upvalue descriptor recorded by the compiler: where the closure
/// should pull value `i` from when `CLOSURE` constructs it.
#[derive(Clone, Copy, Debug)]
pub struct UpvalueDesc {
    pub index: u8,
    pub is_local: bool,
}

/// Immutable after compilation. Uniquely owned by the `Closure` (or the
/// top-level script wrapper) that references it.
pub struct ObjFunction {
    pub arity: u8,
    pub default_count: u8,
    pub name: Option<GcRef>,
    pub chunk: Chunk,
    pub upvalues: Vec<UpvalueDesc>,
    /// Constant-expression default values for the trailing `default_count`
    /// parameters, evaluated once at compile time (spec.md §4.2 expansion:
    /// default arguments).
    pub defaults: Vec<Value>,
}

impl ObjFunction {
    pub fn new(name: Option<GcRef>) -> Self {
        ObjFunction {
            arity: 0,
            default_count: 0,
            name,
            chunk: Chunk::new(),
            upvalues: Vec::new(),
            defaults: Vec::new(),
        }
    }
}

pub type NativeFn = fn(&mut Vm, &mut [Value]) -> Result<Value, String>;

pub struct ObjNative {
    pub name: GcRef,
    pub arity: u8,
    pub function: NativeFn,
}

/// A `Function` together with the captured `Upvalue`s its body needs.
pub struct ObjClosure {
    pub function: GcRef,
    pub upvalues: Vec<GcRef>,
}

/// Either *open* (proxies operand-stack slot `index`) or *closed* (owns a
/// private `Value` cell). At most one open upvalue exists per stack slot
/// (enforced by `Vm::capture_upvalue`).
#[derive(Clone, Copy)]
pub enum UpvalueLoc {
    Open(usize),
    Closed,
}

pub struct ObjUpvalue {
    pub loc: Cell<UpvalueLoc>,
    pub closed: Cell<Value>,
    /// Link to the next open upvalue, stack slots in descending order.
    /// Meaningless once `loc` is `Closed`.
    pub open_next: Cell<Option<GcRef>>,
}

pub struct ObjClass {
    pub name: GcRef,
    pub methods: Table,
    pub initializer: Cell<Option<Value>>,
}

pub struct ObjInstance {
    pub class: GcRef,
    pub fields: Table,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: Value,
}

/// Ordered sequence of Values with O(1) push/pop at the back, plus a
/// fixed table of built-in method names dispatched in `vm.rs`.
pub struct ObjCollection {
    pub items: RefCell<Vec<Value>>,
}

pub const COLLECTION_METHODS: &[&str] = &["push", "pop", "len", "get", "set"];
