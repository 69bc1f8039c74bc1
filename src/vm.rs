// File: src/vm.rs
//
// Virtual Machine for executing Ruff bytecode.
// Stack-based VM with call frames, closures, upvalues, classes, methods,
// and collections. Owns the heap (see `memory.rs` for the GC half of this
// type's impl) so that every allocation made during compilation or
// execution is visible to one set of roots.

use std::cell::{Cell, RefCell};
use std::io::{self, Write};

use crate::chunk::OpCode;
use crate::table::Table;
use crate::value::{
    fnv1a, GcRef, ObjBoundMethod, ObjClass, ObjClosure, ObjCollection, ObjData, ObjInstance,
    ObjKind, ObjString, ObjUpvalue, UpvalueLoc, Value, COLLECTION_METHODS,
};

const FRAMES_MAX: usize = 256;

#[derive(Clone, Copy)]
pub(crate) struct CallFrame {
    pub(crate) closure: GcRef,
    ip: usize,
    base: usize,
}

/// Name -> slot table paired with the dense value array it indexes.
/// Kept behind one API so the two halves (REDESIGN FLAG b) can never
/// drift out of lockstep: a slot is always allocated in both at once.
pub struct Globals {
    pub(crate) names: Table,
    pub(crate) values: RefCell<Vec<Value>>,
}

impl Globals {
    fn new() -> Self {
        Globals { names: Table::new(), values: RefCell::new(Vec::new()) }
    }

    /// Finds the slot for `name`, allocating one (with value `Empty`) the
    /// first time this name is referenced.
    pub fn slot_for(&self, name: GcRef) -> usize {
        let key = Value::Obj(name);
        if let Some(existing) = self.names.get(key) {
            return existing.as_number().unwrap() as usize;
        }
        let mut values = self.values.borrow_mut();
        let slot = values.len();
        values.push(Value::Empty);
        drop(values);
        self.names.set(key, Value::Number(slot as f64));
        slot
    }

    pub fn get(&self, slot: usize) -> Value {
        self.values.borrow()[slot]
    }

    pub fn define(&self, slot: usize, value: Value) {
        self.values.borrow_mut()[slot] = value;
    }

    /// Assigns only if the slot is already defined; returns whether it was.
    pub fn assign(&self, slot: usize, value: Value) -> bool {
        let mut values = self.values.borrow_mut();
        if matches!(values[slot], Value::Empty) {
            return false;
        }
        values[slot] = value;
        true
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

pub struct Vm {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) globals: Globals,
    pub(crate) open_upvalues: Option<GcRef>,
    pub(crate) init_string: GcRef,

    // --- heap state (mark-sweep GC lives in memory.rs) ---
    pub(crate) objects: Cell<Option<GcRef>>,
    pub(crate) strings: Table,
    pub(crate) bytes_allocated: Cell<usize>,
    pub(crate) next_gc: Cell<usize>,
    pub(crate) marker: Cell<bool>,
    pub(crate) gray_stack: RefCell<Vec<GcRef>>,
    pub(crate) stress_gc: bool,
    /// Functions currently being compiled (innermost last); kept reachable
    /// even though nothing in the VM-visible graph points to them yet.
    pub(crate) compiler_roots: RefCell<Vec<GcRef>>,

    stdout: RefCell<Box<dyn Write>>,
}

const INIT_NEXT_GC: usize = 1024 * 1024;

impl Vm {
    pub fn new() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    /// Constructs a VM writing `print` output to `writer` instead of real
    /// stdout — used by the integration tests to capture program output.
    pub fn with_writer(writer: Box<dyn Write>) -> Self {
        let stress_gc = std::env::var("RUFF_GC_STRESS").map(|v| v == "1").unwrap_or(false);
        let mut vm = Vm {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            globals: Globals::new(),
            open_upvalues: None,
            init_string: unsafe { GcRef::dangling() },
            objects: Cell::new(None),
            strings: Table::new(),
            bytes_allocated: Cell::new(0),
            next_gc: Cell::new(INIT_NEXT_GC),
            marker: Cell::new(true),
            gray_stack: RefCell::new(Vec::new()),
            stress_gc,
            compiler_roots: RefCell::new(Vec::new()),
            stdout: RefCell::new(writer),
        };
        vm.init_string = vm.intern_str("init");
        crate::builtins::register(&mut vm);
        vm
    }

    pub fn reset_stacks(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // --- stack helpers ---

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    // --- string interning ---

    /// `copy_string` (spec §3): returns the canonical String object for
    /// `bytes`, allocating a new one only if the content is not already
    /// interned.
    pub fn intern(&mut self, bytes: &[u8]) -> GcRef {
        let hash = fnv1a(bytes);
        if let Some(existing) = self.strings.find_string(bytes, hash) {
            return existing;
        }
        let obj = self.alloc_object(ObjData::Str(ObjString { bytes: bytes.into(), hash }));
        // Root it on the stack before the intern-table insert, which cannot
        // itself allocate past capacity without going through `Table::set`
        // (no further GC-triggering allocation happens here, but the
        // discipline is kept uniform per the allocation-safety rule).
        self.push(Value::Obj(obj));
        self.strings.set(Value::Obj(obj), Value::Bool(true));
        self.pop();
        obj
    }

    pub fn intern_str(&mut self, s: &str) -> GcRef {
        self.intern(s.as_bytes())
    }

    // --- program entry points ---

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        self.interpret_with_base(source, None)
    }

    /// Compiles and runs `source` as if it were read from a file in
    /// `base_dir` — relative `import` paths resolve against this directory
    /// (spec.md §6 expansion). Used by the CLI's file-execution mode; the
    /// REPL and `interpret` resolve imports against the process's current
    /// directory instead.
    pub fn interpret_file(&mut self, source: &str, base_dir: &std::path::Path) -> InterpretResult {
        self.interpret_with_base(source, Some(base_dir.to_path_buf()))
    }

    fn interpret_with_base(
        &mut self,
        source: &str,
        base_dir: Option<std::path::PathBuf>,
    ) -> InterpretResult {
        let function = match crate::compiler::compile(self, source, base_dir) {
            Some(f) => f,
            None => return InterpretResult::CompileError,
        };
        self.push(Value::Obj(function));
        let closure = self.alloc_object(ObjData::Closure(ObjClosure { function, upvalues: Vec::new() }));
        self.pop();
        self.push(Value::Obj(closure));
        self.frames.push(CallFrame { closure, ip: 0, base: 0 });
        self.run()
    }

    fn function_of(closure: GcRef) -> GcRef {
        match unsafe { &closure.as_ref().data } {
            ObjData::Closure(c) => c.function,
            _ => unreachable!("CallFrame.closure is always a Closure"),
        }
    }

    fn frame_line(frame: &CallFrame) -> u32 {
        let function = Self::function_of(frame.closure);
        match unsafe { &function.as_ref().data } {
            ObjData::Function(f) => f.chunk.get_line(frame.ip.saturating_sub(1)),
            _ => 0,
        }
    }

    fn frame_name(frame: &CallFrame) -> String {
        let function = Self::function_of(frame.closure);
        match unsafe { &function.as_ref().data } {
            ObjData::Function(f) => match f.name {
                Some(name) => format!("{}()", crate::value::format_object(name)),
                None => "script".to_string(),
            },
            _ => "?".to_string(),
        }
    }

    /// Reports a runtime error with a full frame trace (spec §4.3 "Failure
    /// semantics") and resets the VM's stacks so it stays reusable.
    fn runtime_error(&mut self, message: String) -> InterpretResult {
        let line = self.frames.last().map(Self::frame_line).unwrap_or(0);
        eprintln!(
            "{}",
            crate::errors::RuffError::runtime_error(
                message,
                crate::errors::SourceLocation::new(line as usize),
            )
        );
        for frame in self.frames.iter().rev() {
            eprintln!("  [line {}] in {}", Self::frame_line(frame), Self::frame_name(frame));
        }
        self.reset_stacks();
        InterpretResult::RuntimeError
    }

    // --- execution loop ---

    fn run(&mut self) -> InterpretResult {
        let mut frame_idx = self.frames.len() - 1;
        let mut closure = self.frames[frame_idx].closure;
        let mut function = Self::function_of(closure);
        let mut ip = self.frames[frame_idx].ip;
        let mut base = self.frames[frame_idx].base;

        macro_rules! chunk {
            () => {
                match unsafe { &function.as_ref().data } {
                    ObjData::Function(f) => &f.chunk,
                    _ => unreachable!(),
                }
            };
        }
        macro_rules! save {
            () => {
                self.frames[frame_idx].ip = ip;
            };
        }
        macro_rules! runtime_err {
            ($($arg:tt)*) => {{
                save!();
                return self.runtime_error(format!($($arg)*));
            }};
        }

        loop {
            let byte = chunk!().code[ip];
            ip += 1;
            let op = OpCode::from_u8(byte);

            macro_rules! read_u8 {
                () => {{
                    let b = chunk!().code[ip];
                    ip += 1;
                    b
                }};
            }
            macro_rules! read_u16 {
                () => {{
                    let hi = chunk!().code[ip] as u16;
                    let lo = chunk!().code[ip + 1] as u16;
                    ip += 2;
                    (hi << 8) | lo
                }};
            }
            macro_rules! read_constant {
                () => {{
                    let idx = read_u8!() as usize;
                    chunk!().constants[idx]
                }};
            }
            macro_rules! read_constant_long {
                () => {{
                    let idx = read_u16!() as usize;
                    chunk!().constants[idx]
                }};
            }
            macro_rules! read_string {
                () => {
                    read_constant!().as_string().expect("constant is a string").bytes.clone()
                };
            }

            match op {
                OpCode::Constant => {
                    let v = read_constant!();
                    self.push(v);
                }
                OpCode::ConstantLong => {
                    let v = read_constant_long!();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let v = self.peek(0);
                    self.push(v);
                }
                OpCode::GetLocal => {
                    let slot = read_u8!() as usize;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = read_u8!() as usize;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let slot = read_u16!() as usize;
                    let v = self.globals.get(slot);
                    if matches!(v, Value::Empty) {
                        runtime_err!("Undefined variable.");
                    }
                    self.push(v);
                }
                OpCode::SetGlobal => {
                    let slot = read_u16!() as usize;
                    let v = self.peek(0);
                    if !self.globals.assign(slot, v) {
                        runtime_err!("Undefined variable.");
                    }
                }
                OpCode::DefineGlobal => {
                    let slot = read_u16!() as usize;
                    let v = self.pop();
                    self.globals.define(slot, v);
                }
                OpCode::GetUpvalue => {
                    let slot = read_u8!() as usize;
                    let upvalues = match unsafe { &closure.as_ref().data } {
                        ObjData::Closure(c) => &c.upvalues,
                        _ => unreachable!(),
                    };
                    let up = upvalues[slot];
                    self.push(self.read_upvalue(up));
                }
                OpCode::SetUpvalue => {
                    let slot = read_u8!() as usize;
                    let v = self.peek(0);
                    let upvalues = match unsafe { &closure.as_ref().data } {
                        ObjData::Closure(c) => &c.upvalues,
                        _ => unreachable!(),
                    };
                    let up = upvalues[slot];
                    self.write_upvalue(up, v);
                }
                OpCode::GetProperty => {
                    let name_bytes = read_string!();
                    let receiver = self.peek(0);
                    let instance = match receiver.as_instance() {
                        Some(i) => i,
                        None => runtime_err!("Only instances have properties."),
                    };
                    let name_val = Value::Obj(self.intern(&name_bytes));
                    if let Some(v) = instance.fields.get(name_val) {
                        self.pop();
                        self.push(v);
                    } else {
                        let class = unsafe { instance.class.as_ref() };
                        let methods = match &class.data {
                            ObjData::Class(c) => &c.methods,
                            _ => unreachable!(),
                        };
                        match methods.get(name_val) {
                            Some(method) => {
                                self.pop();
                                save!();
                                match self.bind_method(receiver.as_obj().unwrap(), method) {
                                    Ok(bound) => self.push(bound),
                                    Err(e) => return self.runtime_error(e),
                                }
                            }
                            None => runtime_err!("Undefined property."),
                        }
                    }
                }
                OpCode::SetProperty => {
                    let name_bytes = read_string!();
                    let value = self.peek(0);
                    let receiver = self.peek(1);
                    let instance = match receiver.as_instance() {
                        Some(i) => i,
                        None => runtime_err!("Only instances have fields."),
                    };
                    let name_val = Value::Obj(self.intern(&name_bytes));
                    instance.fields.set(name_val, value);
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name_bytes = read_string!();
                    let superclass = self.pop();
                    let receiver = self.pop();
                    let name_val = Value::Obj(self.intern(&name_bytes));
                    let class = match superclass.as_obj() {
                        Some(c) => c,
                        None => runtime_err!("Superclass is not a class."),
                    };
                    let methods = match unsafe { &class.as_ref().data } {
                        ObjData::Class(c) => &c.methods,
                        _ => unreachable!(),
                    };
                    match methods.get(name_val) {
                        Some(method) => {
                            save!();
                            match self.bind_method(receiver.as_obj().unwrap(), method) {
                                Ok(bound) => self.push(bound),
                                Err(e) => return self.runtime_error(e),
                            }
                        }
                        None => runtime_err!("Undefined property."),
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    let (a, b) = self.pop_numbers();
                    match (a, b) {
                        (Some(a), Some(b)) => self.push(Value::Bool(a > b)),
                        _ => runtime_err!("Operands must be numbers."),
                    }
                }
                OpCode::Less => {
                    let (a, b) = self.pop_numbers();
                    match (a, b) {
                        (Some(a), Some(b)) => self.push(Value::Bool(a < b)),
                        _ => runtime_err!("Operands must be numbers."),
                    }
                }
                OpCode::Add => {
                    save!();
                    if let Err(e) = self.op_add() {
                        return self.runtime_error(e);
                    }
                }
                OpCode::Subtract => {
                    let (a, b) = self.pop_numbers();
                    match (a, b) {
                        (Some(a), Some(b)) => self.push(Value::Number(a - b)),
                        _ => runtime_err!("Operands must be numbers."),
                    }
                }
                OpCode::Multiply => {
                    let (a, b) = self.pop_numbers();
                    match (a, b) {
                        (Some(a), Some(b)) => self.push(Value::Number(a * b)),
                        _ => runtime_err!("Operands must be numbers."),
                    }
                }
                OpCode::Divide => {
                    let (a, b) = self.pop_numbers();
                    match (a, b) {
                        (Some(a), Some(b)) => self.push(Value::Number(a / b)),
                        _ => runtime_err!("Operands must be numbers."),
                    }
                }
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let v = self.pop();
                    match v.as_number() {
                        Some(n) => self.push(Value::Number(-n)),
                        None => runtime_err!("Operand must be a number."),
                    }
                }
                OpCode::Print => {
                    let v = self.pop();
                    let mut out = self.stdout.borrow_mut();
                    let _ = writeln!(out, "{}", crate::value::format_value(&v));
                }
                OpCode::Jump => {
                    let offset = read_u16!();
                    ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = read_u16!();
                    if self.peek(0).is_falsey() {
                        ip += offset as usize;
                    }
                }
                OpCode::JumpIfEmpty => {
                    let offset = read_u16!();
                    if matches!(self.peek(0), Value::Empty) {
                        ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = read_u16!();
                    ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = read_u8!() as usize;
                    save!();
                    match self.call_value(self.peek(argc), argc) {
                        Ok(Some(new_frame)) => {
                            self.frames.push(new_frame);
                            frame_idx = self.frames.len() - 1;
                            closure = new_frame.closure;
                            function = Self::function_of(closure);
                            ip = 0;
                            base = new_frame.base;
                        }
                        Ok(None) => {}
                        Err(e) => return self.runtime_error(e),
                    }
                }
                OpCode::Invoke => {
                    let name_bytes = read_string!();
                    let argc = read_u8!() as usize;
                    save!();
                    match self.invoke(&name_bytes, argc) {
                        Ok(Some(new_frame)) => {
                            self.frames.push(new_frame);
                            frame_idx = self.frames.len() - 1;
                            closure = new_frame.closure;
                            function = Self::function_of(closure);
                            ip = 0;
                            base = new_frame.base;
                        }
                        Ok(None) => {}
                        Err(e) => return self.runtime_error(e),
                    }
                }
                OpCode::SuperInvoke => {
                    let name_bytes = read_string!();
                    let argc = read_u8!() as usize;
                    let superclass = self.pop();
                    save!();
                    let class = superclass.as_obj().expect("superclass operand");
                    match self.invoke_from_class(class, &name_bytes, argc) {
                        Ok(new_frame) => {
                            self.frames.push(new_frame);
                            frame_idx = self.frames.len() - 1;
                            closure = new_frame.closure;
                            function = Self::function_of(closure);
                            ip = 0;
                            base = new_frame.base;
                        }
                        Err(e) => return self.runtime_error(e),
                    }
                }
                OpCode::Closure => {
                    let fn_val = read_constant!();
                    let fn_ref = fn_val.as_obj().expect("CLOSURE operand is a function");
                    let upvalue_count = match unsafe { &fn_ref.as_ref().data } {
                        ObjData::Function(f) => f.upvalues.len(),
                        _ => unreachable!(),
                    };
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = read_u8!() != 0;
                        let index = read_u8!() as usize;
                        if is_local {
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let enclosing = match unsafe { &closure.as_ref().data } {
                                ObjData::Closure(c) => c.upvalues[index],
                                _ => unreachable!(),
                            };
                            upvalues.push(enclosing);
                        }
                    }
                    let new_closure = self.alloc_object(ObjData::Closure(ObjClosure {
                        function: fn_ref,
                        upvalues,
                    }));
                    self.push(Value::Obj(new_closure));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    self.close_upvalues(base);
                    save!();
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return InterpretResult::Ok;
                    }
                    self.stack.truncate(base);
                    self.push(result);
                    frame_idx = self.frames.len() - 1;
                    let f = self.frames[frame_idx];
                    closure = f.closure;
                    function = Self::function_of(closure);
                    ip = f.ip;
                    base = f.base;
                }
                OpCode::Class => {
                    let name_bytes = read_string!();
                    let name = self.intern(&name_bytes);
                    let class = self.alloc_object(ObjData::Class(ObjClass {
                        name,
                        methods: Table::new(),
                        initializer: Cell::new(None),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let subclass = self.peek(0);
                    let super_obj = match superclass.as_class() {
                        Some(c) => c,
                        None => runtime_err!("Superclass must be a class."),
                    };
                    let sub_obj = subclass.as_class().expect("INHERIT operand is a class");
                    sub_obj.methods.add_all(&super_obj.methods);
                    if let Some(init) = super_obj.initializer.get() {
                        sub_obj.initializer.set(Some(init));
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name_bytes = read_string!();
                    let method = self.peek(0);
                    let class = self.peek(1);
                    let name = self.intern(&name_bytes);
                    let class_obj = class.as_class().expect("METHOD operand is a class");
                    class_obj.methods.set(Value::Obj(name), method);
                    if name_bytes.as_ref() == b"init" {
                        class_obj.initializer.set(Some(method));
                    }
                    self.pop();
                }
                OpCode::Del => {
                    let name_bytes = read_string!();
                    let receiver = self.pop();
                    let instance = match receiver.as_instance() {
                        Some(i) => i,
                        None => runtime_err!("Only instances have fields."),
                    };
                    let name_val = Value::Obj(self.intern(&name_bytes));
                    instance.fields.delete(name_val);
                }
                OpCode::Collection => {
                    let count = read_u16!() as usize;
                    let start = self.stack.len() - count;
                    let items: Vec<Value> = self.stack.drain(start..).collect();
                    let collection =
                        self.alloc_object(ObjData::Collection(ObjCollection { items: items.into() }));
                    self.push(Value::Obj(collection));
                }
                OpCode::Range => {
                    let hi = self.pop();
                    let lo = self.pop();
                    let (lo, hi) = match (lo.as_number(), hi.as_number()) {
                        (Some(lo), Some(hi)) => (lo, hi),
                        _ => runtime_err!("Range bounds must be numbers."),
                    };
                    let items: Vec<Value> =
                        (lo as i64..hi as i64).map(|n| Value::Number(n as f64)).collect();
                    let collection =
                        self.alloc_object(ObjData::Collection(ObjCollection { items: items.into() }));
                    self.push(Value::Obj(collection));
                }
                OpCode::RandomAccess => {
                    let index = self.pop();
                    let target = self.pop();
                    let idx = match index.as_number() {
                        Some(n) => n as i64,
                        None => runtime_err!("Index must be a number."),
                    };
                    match target.as_collection() {
                        Some(c) => {
                            let items = c.items.borrow();
                            if idx < 0 || idx as usize >= items.len() {
                                runtime_err!("Index out of bounds.");
                            }
                            self.push(items[idx as usize]);
                        }
                        None => runtime_err!("Only collections support indexing."),
                    }
                }
                OpCode::Conditional => {
                    let else_branch = self.pop();
                    let then_branch = self.pop();
                    let cond = self.pop();
                    self.push(if cond.is_falsey() { else_branch } else { then_branch });
                }
            }
        }
    }

    fn pop_numbers(&mut self) -> (Option<f64>, Option<f64>) {
        let b = self.pop();
        let a = self.pop();
        (a.as_number(), b.as_number())
    }

    /// `ADD` (spec §4.3): overloaded across Number, String, and Collection.
    fn op_add(&mut self) -> Result<(), String> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Some(a), Some(b)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            self.push(Value::Number(a + b));
            return Ok(());
        }
        if a.is_string() && b.is_string() {
            let a_bytes = a.as_string().unwrap().bytes.clone();
            let b_bytes = b.as_string().unwrap().bytes.clone();
            let mut combined = Vec::with_capacity(a_bytes.len() + b_bytes.len());
            combined.extend_from_slice(&a_bytes);
            combined.extend_from_slice(&b_bytes);
            self.pop();
            self.pop();
            let result = self.intern(&combined);
            self.push(Value::Obj(result));
            return Ok(());
        }
        if let (Some(ca), Some(cb)) = (a.as_collection(), b.as_collection()) {
            let mut merged = ca.items.borrow().clone();
            merged.extend(cb.items.borrow().iter().copied());
            self.pop();
            self.pop();
            let result = self.alloc_object(ObjData::Collection(ObjCollection { items: merged.into() }));
            self.push(Value::Obj(result));
            return Ok(());
        }
        Err("Operands must be two numbers, two strings, or two collections.".to_string())
    }

    // --- calls ---

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<Option<CallFrame>, String> {
        match callee.as_obj().map(|r| unsafe { r.as_ref() }.kind()) {
            Some(ObjKind::Closure) => Ok(Some(self.call_closure(callee.as_obj().unwrap(), argc)?)),
            Some(ObjKind::Class) => self.call_class(callee.as_obj().unwrap(), argc),
            Some(ObjKind::BoundMethod) => {
                let bound = callee.as_bound_method().unwrap();
                let receiver = bound.receiver;
                let method = bound.method;
                let base = self.stack.len() - argc - 1;
                self.stack[base] = receiver;
                Ok(Some(self.call_closure(method.as_obj().unwrap(), argc)?))
            }
            Some(ObjKind::Native) => {
                self.call_native(callee.as_obj().unwrap(), argc)?;
                Ok(None)
            }
            Some(ObjKind::Collection) => {
                // Collections as callees act as their own constructor:
                // `Collection(1, 2, 3)` copies the argument list.
                let start = self.stack.len() - argc;
                let items: Vec<Value> = self.stack.drain(start..).collect();
                self.pop();
                let result =
                    self.alloc_object(ObjData::Collection(ObjCollection { items: items.into() }));
                self.push(Value::Obj(result));
                Ok(None)
            }
            _ => Err("Can only call functions and classes.".to_string()),
        }
    }

    fn call_closure(&mut self, closure: GcRef, argc: usize) -> Result<CallFrame, String> {
        let function = Self::function_of(closure);
        let (arity, default_count, defaults) = match unsafe { &function.as_ref().data } {
            ObjData::Function(f) => (f.arity as usize, f.default_count as usize, f.defaults.clone()),
            _ => unreachable!(),
        };
        let min_argc = arity - default_count;
        if argc < min_argc || argc > arity {
            return Err(format!("Expected {} arguments but got {}.", arity, argc));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        for i in argc..arity {
            self.push(defaults[i - min_argc]);
        }
        let base = self.stack.len() - arity - 1;
        Ok(CallFrame { closure, ip: 0, base })
    }

    /// Replaces the callee slot with a freshly allocated Instance and, if
    /// the class has an initializer, hands back its call frame so the
    /// dispatch loop runs it the same way as any other call (spec §4.3:
    /// "Class: replaces the callee slot with a new Instance; if the class
    /// has an initializer, call it with the given args").
    fn call_class(&mut self, class: GcRef, argc: usize) -> Result<Option<CallFrame>, String> {
        let class_data = match unsafe { &class.as_ref().data } {
            ObjData::Class(c) => c,
            _ => unreachable!(),
        };
        let initializer = class_data.initializer.get();
        let instance = self.alloc_object(ObjData::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }));
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::Obj(instance);
        match initializer {
            Some(init) => self.call_closure(init.as_obj().unwrap(), argc).map(Some),
            None => {
                if argc != 0 {
                    return Err("Expected 0 arguments for a class with no initializer.".to_string());
                }
                Ok(None)
            }
        }
    }

    fn call_native(&mut self, native: GcRef, argc: usize) -> Result<(), String> {
        let (func, arity) = match unsafe { &native.as_ref().data } {
            ObjData::Native(n) => (n.function, n.arity as usize),
            _ => unreachable!(),
        };
        if argc != arity {
            return Err(format!("Expected {} arguments but got {}.", arity, argc));
        }
        let start = self.stack.len() - argc;
        let mut args: Vec<Value> = self.stack[start..].to_vec();
        let result = func(self, &mut args);
        self.stack.truncate(start - 1);
        match result {
            Ok(v) => {
                self.push(v);
                Ok(())
            }
            Err(msg) => Err(msg),
        }
    }

    fn bind_method(&mut self, receiver: GcRef, method: Value) -> Result<Value, String> {
        let bound = self.alloc_object(ObjData::BoundMethod(ObjBoundMethod {
            receiver: Value::Obj(receiver),
            method,
        }));
        Ok(Value::Obj(bound))
    }

    fn invoke(&mut self, name_bytes: &[u8], argc: usize) -> Result<Option<CallFrame>, String> {
        let receiver = self.peek(argc);
        if let Some(instance) = receiver.as_instance() {
            let name_val = Value::Obj(self.intern(name_bytes));
            if let Some(field) = instance.fields.get(name_val) {
                let base = self.stack.len() - argc - 1;
                self.stack[base] = field;
                return self.call_value(field, argc);
            }
            return self
                .invoke_from_class(instance.class, name_bytes, argc)
                .map(Some);
        }
        if let Some(collection) = receiver.as_collection() {
            let result = self.invoke_collection_method(collection, name_bytes, argc)?;
            let base = self.stack.len() - argc - 1;
            self.stack.truncate(base);
            self.push(result);
            return Ok(None);
        }
        Err("Only instances and collections have methods.".to_string())
    }

    fn invoke_from_class(
        &mut self,
        class: GcRef,
        name_bytes: &[u8],
        argc: usize,
    ) -> Result<CallFrame, String> {
        let name_val = Value::Obj(self.intern(name_bytes));
        let methods = match unsafe { &class.as_ref().data } {
            ObjData::Class(c) => &c.methods,
            _ => unreachable!(),
        };
        match methods.get(name_val) {
            Some(method) => self.call_closure(method.as_obj().unwrap(), argc),
            None => Err("Undefined property.".to_string()),
        }
    }

    /// Built-in method dispatch for Collections (spec §4.3 expansion:
    /// `push`, `pop`, `len`, `get`, `set`), matched by name rather than
    /// through an allocated method table.
    fn invoke_collection_method(
        &mut self,
        collection: &ObjCollection,
        name_bytes: &[u8],
        argc: usize,
    ) -> Result<Value, String> {
        let name = std::str::from_utf8(name_bytes).unwrap_or("");
        if !COLLECTION_METHODS.contains(&name) {
            return Err(format!("Undefined collection method '{}'.", name));
        }
        let args: Vec<Value> = (0..argc).rev().map(|i| self.peek(i)).collect();
        match name {
            "push" => {
                collection.items.borrow_mut().push(args[0]);
                Ok(Value::Nil)
            }
            "pop" => collection.items.borrow_mut().pop().ok_or_else(|| "Collection is empty.".to_string()),
            "len" => Ok(Value::Number(collection.items.borrow().len() as f64)),
            "get" => {
                let idx = args[0].as_number().ok_or("Index must be a number.")? as i64;
                let items = collection.items.borrow();
                if idx < 0 || idx as usize >= items.len() {
                    return Err("Index out of bounds.".to_string());
                }
                Ok(items[idx as usize])
            }
            "set" => {
                let idx = args[0].as_number().ok_or("Index must be a number.")? as i64;
                let mut items = collection.items.borrow_mut();
                if idx < 0 || idx as usize >= items.len() {
                    return Err("Index out of bounds.".to_string());
                }
                items[idx as usize] = args[1];
                Ok(args[1])
            }
            _ => unreachable!(),
        }
    }

    // --- upvalues ---

    fn read_upvalue(&self, up: GcRef) -> Value {
        let data = match unsafe { &up.as_ref().data } {
            ObjData::Upvalue(u) => u,
            _ => unreachable!(),
        };
        match data.loc.get() {
            UpvalueLoc::Open(slot) => self.stack[slot],
            UpvalueLoc::Closed => data.closed.get(),
        }
    }

    fn write_upvalue(&mut self, up: GcRef, value: Value) {
        let data = match unsafe { &up.as_ref().data } {
            ObjData::Upvalue(u) => u,
            _ => unreachable!(),
        };
        match data.loc.get() {
            UpvalueLoc::Open(slot) => self.stack[slot] = value,
            UpvalueLoc::Closed => data.closed.set(value),
        }
    }

    /// `capture_upvalue` (spec §4.3): reuses an existing open upvalue for
    /// `slot` if one exists; otherwise inserts a new one into the
    /// descending-address-ordered open list.
    fn capture_upvalue(&mut self, slot: usize) -> GcRef {
        let mut prev: Option<GcRef> = None;
        let mut current = self.open_upvalues;
        while let Some(node) = current {
            let node_slot = match unsafe { &node.as_ref().data } {
                ObjData::Upvalue(u) => match u.loc.get() {
                    UpvalueLoc::Open(s) => s,
                    UpvalueLoc::Closed => usize::MAX,
                },
                _ => unreachable!(),
            };
            if node_slot == slot {
                return node;
            }
            if node_slot < slot {
                break;
            }
            prev = Some(node);
            current = match unsafe { &node.as_ref().data } {
                ObjData::Upvalue(u) => u.open_next.get(),
                _ => unreachable!(),
            };
        }

        let created = self.alloc_object(ObjData::Upvalue(ObjUpvalue {
            loc: Cell::new(UpvalueLoc::Open(slot)),
            closed: Cell::new(Value::Nil),
            open_next: Cell::new(current),
        }));

        match prev {
            Some(p) => match unsafe { &p.as_ref().data } {
                ObjData::Upvalue(u) => u.open_next.set(Some(created)),
                _ => unreachable!(),
            },
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// `close_upvalues(min_slot)` (spec §4.3): every open upvalue at or
    /// above `min_slot` is closed in place.
    fn close_upvalues(&mut self, min_slot: usize) {
        while let Some(node) = self.open_upvalues {
            let (slot, value) = match unsafe { &node.as_ref().data } {
                ObjData::Upvalue(u) => match u.loc.get() {
                    UpvalueLoc::Open(s) if s >= min_slot => (s, self.stack[s]),
                    _ => break,
                },
                _ => unreachable!(),
            };
            let data = match unsafe { &node.as_ref().data } {
                ObjData::Upvalue(u) => u,
                _ => unreachable!(),
            };
            data.closed.set(value);
            data.loc.set(UpvalueLoc::Closed);
            self.open_upvalues = data.open_next.get();
            let _ = slot;
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_capture(source: &str) -> (InterpretResult, String) {
        let buf = std::rc::Rc::new(RefCell::new(Vec::<u8>::new()));
        struct SharedWriter(std::rc::Rc<RefCell<Vec<u8>>>);
        impl Write for SharedWriter {
            fn write(&mut self, data: &[u8]) -> io::Result<usize> {
                self.0.borrow_mut().write(data)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut vm = Vm::with_writer(Box::new(SharedWriter(buf.clone())));
        let result = vm.interpret(source);
        let out = String::from_utf8(buf.borrow().clone()).unwrap();
        (result, out)
    }

    #[test]
    fn arithmetic_precedence() {
        let (result, out) = run_capture("print 1 + 2 * 3;");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "7\n");
    }

    #[test]
    fn string_interning_equality() {
        let (result, out) = run_capture(r#"var a = "hi"; var b = "hi"; print a == b;"#);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "true\n");
    }

    #[test]
    fn closure_shares_upvalue() {
        let source = r#"
            fun make() {
                var x = 0;
                fun inc() { x = x + 1; return x; }
                return inc;
            }
            var f = make();
            print f();
            print f();
        "#;
        let (result, out) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "1\n2\n");
    }

    #[test]
    fn method_inheritance_via_copy() {
        let source = r#"
            class A { greet() { print "hi"; } }
            class B < A {}
            B().greet();
        "#;
        let (result, out) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "hi\n");
    }

    #[test]
    fn mixed_type_add_is_runtime_error() {
        let (result, _out) = run_capture(r#"print "a" + 1;"#);
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn collection_literal_and_random_access() {
        let (result, out) = run_capture("var c = [1,2,3]; print c[1];");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "2\n");
    }

    #[test]
    fn default_arguments_pad_missing_trailing_args() {
        let (result, out) = run_capture("fun f(a, b = 10) { print a + b; } f(1);");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "11\n");
    }

    #[test]
    fn break_and_continue_in_nested_loops() {
        let source = r#"
            var total = 0;
            for (var i = 0; i < 5; i = i + 1) {
                if (i == 3) break;
                for (var j = 0; j < 5; j = j + 1) {
                    if (j == 1) continue;
                    total = total + 1;
                }
            }
            print total;
        "#;
        let (result, out) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "12\n");
    }

    #[test]
    fn switch_does_not_fall_through() {
        let source = r#"
            var x = 1;
            switch (x) {
                case 1: print "one";
                case 2: print "two";
                default: print "other";
            }
        "#;
        let (result, out) = run_capture(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "one\n");
    }
}
