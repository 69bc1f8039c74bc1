// File: src/memory.rs
//
// Allocator hook and tracing mark-sweep collector (spec §4.4). Grounded on
// the toggle-marker scheme spec.md §3 describes ("mark = !vm.marker" at
// birth, flipped on survivors instead of reset every collection) rather
// than the simpler always-reset pass in `original_source`'s cpplox port —
// spec.md is explicit about the toggle and is treated as authoritative
// where the two disagree.
//
// Implemented as `impl Vm` so the collector has direct access to every
// root (operand stack, frames, globals, open upvalues, compiler chain)
// without a separate ownership story for the heap.

use crate::value::{approx_data_size, GcObject, GcRef, ObjData, Value};
use crate::vm::Vm;

const GC_HEAP_GROW_FACTOR: usize = 2;

impl Vm {
    /// Allocates `data` on the heap, running a collection first if the
    /// allocation would push the heap over `next_gc` (or under the stress
    /// flag). The allocation-safety rule (spec §5) requires callers to
    /// root the returned reference (push it on the stack, store it in a
    /// field already reachable from a root, ...) before any further
    /// allocation can occur.
    pub(crate) fn alloc_object(&mut self, data: ObjData) -> GcRef {
        let size = std::mem::size_of::<GcObject>() + approx_data_size(&data);
        if self.stress_gc || self.bytes_allocated.get() + size > self.next_gc.get() {
            self.collect_garbage();
        }

        let obj = Box::new(GcObject {
            marked: std::cell::Cell::new(!self.marker.get()),
            next: std::cell::Cell::new(self.objects.get()),
            data,
        });
        let ptr = std::ptr::NonNull::from(Box::leak(obj));
        self.objects.set(Some(ptr));
        self.bytes_allocated.set(self.bytes_allocated.get() + size);
        ptr
    }

    /// Full mark-sweep pass: mark roots, blacken the gray stack, sweep the
    /// string table, sweep the object list, then grow `next_gc`.
    pub(crate) fn collect_garbage(&mut self) {
        self.mark_roots();
        self.trace_references();
        self.strings.remove_white(self.marker.get());
        self.sweep();
        self.next_gc.set(self.bytes_allocated.get() * GC_HEAP_GROW_FACTOR);
        self.marker.set(!self.marker.get());
    }

    fn mark_value(&self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    fn mark_object(&self, obj: GcRef) {
        let header = unsafe { obj.as_ref() };
        if header.marked.get() == self.marker.get() {
            return;
        }
        header.marked.set(self.marker.get());
        self.gray_stack.borrow_mut().push(obj);
    }

    /// Roots (spec §4.4): operand stack, every frame's callable, every
    /// open upvalue, every defined global (name-table keys and value
    /// array), the init-String, and the currently-compiling function
    /// chain.
    fn mark_roots(&self) {
        for &value in &self.stack {
            self.mark_value(value);
        }
        for frame in &self.frames {
            self.mark_object(frame.closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(up) = upvalue {
            self.mark_object(up);
            upvalue = match unsafe { &up.as_ref().data } {
                ObjData::Upvalue(u) => u.open_next.get(),
                _ => None,
            };
        }
        for (name, _slot) in self.globals.names.iter() {
            self.mark_value(name);
        }
        for &value in self.globals.values.borrow().iter() {
            self.mark_value(value);
        }
        self.mark_object(self.init_string);
        for &function in self.compiler_roots.borrow().iter() {
            self.mark_object(function);
        }
    }

    /// Blacken (spec §4.4): pop a gray object, mark everything it
    /// references, continue until the gray stack is empty.
    fn trace_references(&self) {
        loop {
            let obj = self.gray_stack.borrow_mut().pop();
            let obj = match obj {
                Some(o) => o,
                None => break,
            };
            self.blacken(obj);
        }
    }

    fn blacken(&self, obj: GcRef) {
        match unsafe { &obj.as_ref().data } {
            ObjData::Str(_) | ObjData::Native(_) => {}
            ObjData::Function(f) => {
                if let Some(name) = f.name {
                    self.mark_object(name);
                }
                for &constant in &f.chunk.constants {
                    self.mark_value(constant);
                }
            }
            ObjData::Closure(c) => {
                self.mark_object(c.function);
                for &up in &c.upvalues {
                    self.mark_object(up);
                }
            }
            ObjData::Upvalue(u) => {
                self.mark_value(u.closed.get());
            }
            ObjData::Class(c) => {
                self.mark_object(c.name);
                for (key, value) in c.methods.iter() {
                    self.mark_value(key);
                    self.mark_value(value);
                }
                if let Some(init) = c.initializer.get() {
                    self.mark_value(init);
                }
            }
            ObjData::Instance(i) => {
                self.mark_object(i.class);
                for (key, value) in i.fields.iter() {
                    self.mark_value(key);
                    self.mark_value(value);
                }
            }
            ObjData::BoundMethod(b) => {
                self.mark_value(b.receiver);
                self.mark_value(b.method);
            }
            ObjData::Collection(c) => {
                for &item in c.items.borrow().iter() {
                    self.mark_value(item);
                }
            }
        }
    }

    /// Sweep (spec §4.4): walk the allocation-order list, free unmarked
    /// objects, flip the mark bit of survivors (no reset pass needed
    /// because `marker` itself flips at the end of `collect_garbage`).
    fn sweep(&mut self) {
        let mut prev: Option<GcRef> = None;
        let mut current = self.objects.get();
        while let Some(obj) = current {
            let header = unsafe { obj.as_ref() };
            let next = header.next.get();
            if header.marked.get() == self.marker.get() {
                prev = Some(obj);
                current = next;
            } else {
                match prev {
                    Some(p) => unsafe { p.as_ref().next.set(next) },
                    None => self.objects.set(next),
                }
                let size = std::mem::size_of::<GcObject>() + approx_data_size(&header.data);
                self.bytes_allocated.set(self.bytes_allocated.get().saturating_sub(size));
                // SAFETY: `obj` is unreachable (unmarked after a full
                // trace) and was allocated via `Box::leak` in `alloc_object`.
                drop(unsafe { Box::from_raw(obj.as_ptr()) });
                current = next;
            }
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        let mut current = self.objects.get();
        while let Some(obj) = current {
            let next = unsafe { obj.as_ref().next.get() };
            drop(unsafe { Box::from_raw(obj.as_ptr()) });
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::InterpretResult;

    #[test]
    fn gc_stress_does_not_corrupt_output() {
        std::env::set_var("RUFF_GC_STRESS", "1");
        let mut vm = Vm::with_writer(Box::new(Vec::new()));
        let result = vm.interpret(
            r#"
                fun make() {
                    var x = 0;
                    fun inc() { x = x + 1; return x; }
                    return inc;
                }
                var f = make();
                print f();
                print f();
                print f();
            "#,
        );
        std::env::remove_var("RUFF_GC_STRESS");
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn unreachable_strings_are_collected() {
        let mut vm = Vm::with_writer(Box::new(Vec::new()));
        let before = vm.bytes_allocated.get();
        for _ in 0..64 {
            vm.interpret(r#"var s = "a very particular string that will not live long";"#);
        }
        vm.collect_garbage();
        assert!(vm.bytes_allocated.get() <= before + 4096);
    }
}
