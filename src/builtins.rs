// File: src/builtins.rs
//
// Native functions exposed to Ruff source programs (spec.md §6): `clock`,
// `getLine`, `hasField`, `getField`, `setField`, `toString`, `interpolate`,
// `error`, `runtimeError`. Each is a plain `fn(&mut Vm, &mut [Value]) ->
// Result<Value, String>` (the `NativeFn` convention fixed in `value.rs`)
// registered into the global slot for its name at `Vm::new()`.

use std::io::BufRead;
use std::time::Instant;

use once_cell::sync::Lazy;

use crate::value::{format_value, ObjData, ObjNative, Value};
use crate::vm::Vm;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Registers every built-in native into `vm`'s globals. Called once from
/// `Vm::with_writer` before any user source is compiled, so natives are
/// visible as ordinary (already-defined) globals from the first line of a
/// script or REPL session.
pub fn register(vm: &mut Vm) {
    define_native(vm, "clock", 0, native_clock);
    define_native(vm, "getLine", 0, native_get_line);
    define_native(vm, "hasField", 2, native_has_field);
    define_native(vm, "getField", 2, native_get_field);
    define_native(vm, "setField", 3, native_set_field);
    define_native(vm, "toString", 1, native_to_string);
    define_native(vm, "interpolate", 2, native_interpolate);
    define_native(vm, "error", 1, native_error);
    define_native(vm, "runtimeError", 1, native_runtime_error);
}

fn define_native(vm: &mut Vm, name: &str, arity: u8, function: crate::value::NativeFn) {
    let name_ref = vm.intern_str(name);
    // `name_ref` must stay rooted across the `alloc_object` below, which
    // may itself trigger a collection (allocation-safety rule, spec §5).
    vm.push(Value::Obj(name_ref));
    let native = vm.alloc_object(ObjData::Native(ObjNative { name: name_ref, arity, function }));
    vm.pop();
    vm.push(Value::Obj(native));
    let slot = vm.globals.slot_for(name_ref);
    vm.globals.define(slot, vm.peek(0));
    vm.pop();
}

/// `clock()` -> seconds elapsed since the process (first VM) started.
fn native_clock(_vm: &mut Vm, _args: &mut [Value]) -> Result<Value, String> {
    Ok(Value::Number(START_TIME.elapsed().as_secs_f64()))
}

/// `getLine()` -> one line read from standard input, newline stripped.
/// `Ok(String::new())` (an empty string, not an error) at EOF.
fn native_get_line(vm: &mut Vm, _args: &mut [Value]) -> Result<Value, String> {
    let stdin = std::io::stdin();
    let mut line = String::new();
    stdin
        .lock()
        .read_line(&mut line)
        .map_err(|e| format!("Could not read line: {}", e))?;
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(Value::Obj(vm.intern_str(&line)))
}

fn expect_instance(args: &[Value], index: usize) -> Result<&crate::value::ObjInstance, String> {
    args.get(index)
        .and_then(Value::as_instance)
        .ok_or_else(|| "Expected an instance argument.".to_string())
}

fn expect_string_bytes(args: &[Value], index: usize) -> Result<Vec<u8>, String> {
    let s = args
        .get(index)
        .and_then(Value::as_string)
        .ok_or_else(|| "Expected a string argument.".to_string())?;
    Ok(s.bytes.to_vec())
}

/// `hasField(inst, name)` -> Bool.
fn native_has_field(vm: &mut Vm, args: &mut [Value]) -> Result<Value, String> {
    let instance = expect_instance(args, 0)?;
    let name_bytes = expect_string_bytes(args, 1)?;
    let name_val = Value::Obj(vm.intern(&name_bytes));
    Ok(Value::Bool(instance.fields.get(name_val).is_some()))
}

/// `getField(inst, name)` -> the field's value, or `Nil` if unset.
fn native_get_field(vm: &mut Vm, args: &mut [Value]) -> Result<Value, String> {
    let instance = expect_instance(args, 0)?;
    let name_bytes = expect_string_bytes(args, 1)?;
    let name_val = Value::Obj(vm.intern(&name_bytes));
    Ok(instance.fields.get(name_val).unwrap_or(Value::Nil))
}

/// `setField(inst, name, v)` -> `v`, after writing it into the instance's
/// field table (bypassing `SET_PROPERTY`'s compile-time name, useful for
/// dynamic field names built at runtime).
fn native_set_field(vm: &mut Vm, args: &mut [Value]) -> Result<Value, String> {
    let instance = expect_instance(args, 0)?;
    let name_bytes = expect_string_bytes(args, 1)?;
    let name_val = Value::Obj(vm.intern(&name_bytes));
    let value = args[2];
    instance.fields.set(name_val, value);
    Ok(value)
}

/// `toString(v)` -> the same rendering `print` would produce.
fn native_to_string(vm: &mut Vm, args: &mut [Value]) -> Result<Value, String> {
    let rendered = format_value(&args[0]);
    Ok(Value::Obj(vm.intern_str(&rendered)))
}

/// `interpolate(fmt, values)` -> `fmt` with each `${}` placeholder
/// replaced, in order, by `toString` of the matching element of the
/// `values` collection.
fn native_interpolate(vm: &mut Vm, args: &mut [Value]) -> Result<Value, String> {
    let fmt_bytes = expect_string_bytes(args, 0)?;
    let fmt = String::from_utf8_lossy(&fmt_bytes).into_owned();
    let values = args
        .get(1)
        .and_then(Value::as_collection)
        .ok_or_else(|| "interpolate expects a collection of values.".to_string())?;
    let items = values.items.borrow();
    let mut it = items.iter();

    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '$' && fmt[i..].starts_with("${}") {
            match it.next() {
                Some(v) => out.push_str(&format_value(v)),
                None => return Err("interpolate: not enough values for placeholders.".to_string()),
            }
            chars.next();
            chars.next();
        } else {
            out.push(c);
        }
    }
    Ok(Value::Obj(vm.intern_str(&out)))
}

/// `error(msg)` -> never returns successfully; raises a runtime error
/// carrying `msg`, upgraded by `call_native`'s `Err` path the same way any
/// other native failure is.
fn native_error(_vm: &mut Vm, args: &mut [Value]) -> Result<Value, String> {
    Err(format_value(&args[0]))
}

/// `runtimeError(msg)` -> alias of `error`, named to match spec.md §6.
fn native_runtime_error(_vm: &mut Vm, args: &mut [Value]) -> Result<Value, String> {
    Err(format_value(&args[0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::InterpretResult;

    #[test]
    fn clock_returns_a_number() {
        let mut vm = Vm::new();
        let result = vm.interpret("var t = clock(); print t >= 0.0;");
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn to_string_round_trips_numbers() {
        let mut vm = Vm::new();
        let result = vm.interpret(r#"print toString(1) == "1";"#);
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn has_get_set_field_on_instance() {
        let mut vm = Vm::new();
        let result = vm.interpret(
            r#"
            class Point {}
            var p = Point();
            setField(p, "x", 3);
            print hasField(p, "x");
            print getField(p, "x");
            print hasField(p, "y");
            "#,
        );
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn interpolate_replaces_placeholders_in_order() {
        let mut vm = Vm::new();
        let result = vm.interpret(
            r#"print interpolate("${} plus ${} is ${}", [1, 2, 3]);"#,
        );
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn error_native_raises_runtime_error() {
        let mut vm = Vm::new();
        let result = vm.interpret(r#"error("boom");"#);
        assert_eq!(result, InterpretResult::RuntimeError);
    }
}
