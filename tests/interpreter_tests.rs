// Integration tests for the Ruff bytecode interpreter.
//
// Each test drives `ruff::vm::Vm` through its public `interpret`/
// `interpret_file` API exactly as the CLI and REPL do, and asserts on
// captured stdout plus the returned `InterpretResult`. Covers the
// scenarios enumerated in spec.md §8 plus the additional invariant
// coverage called for by SPEC_FULL.md §8.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use ruff::vm::{InterpretResult, Vm};

#[derive(Clone)]
struct CapturedWriter(Rc<RefCell<Vec<u8>>>);

impl Write for CapturedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(data)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (InterpretResult, String) {
    let buf = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::with_writer(Box::new(CapturedWriter(buf.clone())));
    let result = vm.interpret(source);
    let out = String::from_utf8(buf.borrow().clone()).expect("utf8 stdout");
    (result, out)
}

// --- spec.md §8 numbered scenarios ---

#[test]
fn scenario_1_arithmetic_precedence() {
    let (result, out) = run("print 1 + 2 * 3;");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "7\n");
}

#[test]
fn scenario_2_string_interning_equality() {
    let (result, out) = run(r#"var a = "hi"; var b = "hi"; print a == b;"#);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "true\n");
}

#[test]
fn scenario_3_closure_shares_upvalue() {
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
    let (result, out) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "1\n2\n");
}

#[test]
fn scenario_4_method_inheritance_via_inherit_copy() {
    let source = r#"
        class A { greet() { print "hi"; } }
        class B < A {}
        B().greet();
    "#;
    let (result, out) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "hi\n");
}

#[test]
fn scenario_5_mixed_type_add_is_runtime_error() {
    let (result, _out) = run(r#"print "a" + 1;"#);
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn scenario_6_collection_literal_and_random_access() {
    let (result, out) = run("var c = [1,2,3]; print c[1];");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "2\n");
}

// --- additional invariant coverage (SPEC_FULL.md §8 expansion) ---

#[test]
fn default_arguments_pad_missing_trailing_args() {
    let (result, out) =
        run("fun f(a, b = 10, c = 20) { print a + b + c; } f(1); f(1, 2); f(1, 2, 3);");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "31\n23\n6\n");
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
    let (result, out) = run(source);
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
    let (result, out) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "one\n");
}

#[test]
fn undefined_global_is_a_runtime_error() {
    let (result, _out) = run("print undefined_name;");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn shadowing_a_local_in_the_same_scope_is_a_compile_error() {
    let (result, _out) = run("{ var a = 1; var a = 2; }");
    assert_eq!(result, InterpretResult::CompileError);
}

#[test]
fn reading_a_local_before_its_initializer_finishes_is_a_compile_error() {
    let (result, _out) = run("{ var a = a; }");
    assert_eq!(result, InterpretResult::CompileError);
}

#[test]
fn const_reassignment_is_a_compile_error() {
    let (result, _out) = run("const a = 1; a = 2;");
    assert_eq!(result, InterpretResult::CompileError);
}

#[test]
fn collections_concatenate_with_plus() {
    let (result, out) = run("var c = [1, 2] + [3]; print c[2]; print c.len();");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "3\n3\n");
}

#[test]
fn collection_builtin_methods_push_pop_get_set() {
    let source = r#"
        var c = [1, 2, 3];
        c.push(4);
        print c.len();
        print c.pop();
        c.set(0, 99);
        print c.get(0);
    "#;
    let (result, out) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "4\n4\n99\n");
}

#[test]
fn super_invoke_resolves_from_the_superclass() {
    let source = r#"
        class A { greet() { print "A"; } }
        class B < A { greet() { super.greet(); print "B"; } }
        B().greet();
    "#;
    let (result, out) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "A\nB\n");
}

#[test]
fn conditional_operator_evaluates_the_taken_branch() {
    let (result, out) = run(r#"print true ? "yes" : "no";"#);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "yes\n");
}

#[test]
fn calling_with_wrong_arity_is_a_runtime_error() {
    let (result, _out) = run("fun f(a, b) { return a + b; } f(1);");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn gc_stress_does_not_corrupt_a_live_program() {
    // RUFF_GC_STRESS forces a collection on every growing allocation
    // (spec.md §9 "stress flag"); this builds a long-lived collection by
    // repeated allocation under that pressure and checks the final count
    // still reflects every push.
    std::env::set_var("RUFF_GC_STRESS", "1");
    let source = r#"
        var c = [];
        for (var i = 0; i < 200; i = i + 1) {
            c.push(i);
        }
        print c.len();
    "#;
    let (result, out) = run(source);
    std::env::remove_var("RUFF_GC_STRESS");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "200\n");
}

#[test]
fn import_pulls_declarations_into_the_same_global_namespace() {
    let dir = std::env::temp_dir().join(format!("ruff_integration_import_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let lib_path = dir.join("greeting.ruff");
    std::fs::write(&lib_path, r#"fun greet() { print "hi from import"; }"#).unwrap();

    let main_source = r#"
        import "greeting.ruff";
        greet();
    "#;

    let buf = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::with_writer(Box::new(CapturedWriter(buf.clone())));
    let result = vm.interpret_file(main_source, &dir);
    let out = String::from_utf8(buf.borrow().clone()).unwrap();

    std::fs::remove_dir_all(&dir).ok();

    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "hi from import\n");
}

#[test]
fn native_functions_are_available_as_globals() {
    let source = r#"
        class Point {}
        var p = Point();
        setField(p, "x", 3);
        print hasField(p, "x");
        print getField(p, "x");
        print toString(42);
        print clock() >= 0.0;
    "#;
    let (result, out) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "true\n3\n42\ntrue\n");
}

#[test]
fn error_native_raises_a_runtime_error_with_the_given_message() {
    let (result, _out) = run(r#"error("boom");"#);
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn runtime_errors_reset_the_vm_so_it_stays_reusable() {
    let buf = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::with_writer(Box::new(CapturedWriter(buf.clone())));

    let first = vm.interpret(r#"print "a" + 1;"#);
    assert_eq!(first, InterpretResult::RuntimeError);

    let second = vm.interpret("print 1 + 1;");
    assert_eq!(second, InterpretResult::Ok);

    let out = String::from_utf8(buf.borrow().clone()).unwrap();
    assert_eq!(out, "2\n");
}
