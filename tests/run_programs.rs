//! End-to-end tests: compile a source program, run it on a capturing
//! VM, and check the output, the exit condition, and the machine-state
//! invariants (balanced operand stack, swept frame allocations).

use cinder::runtime::fault::Fault;
use cinder::runtime::vm::Vm;
use cinder::{Module, compile_source};

fn run(src: &str) -> (Result<(), Fault>, String, usize) {
    let compiled = compile_source(src).expect("compile error");
    let mut vm = Vm::with_capture();
    let result = vm.run(&compiled.module);
    let depth = vm.stack_depth();
    (result, vm.take_output(), depth)
}

fn run_ok(src: &str) -> String {
    let (result, output, depth) = run(src);
    assert!(result.is_ok(), "unexpected fault: {:?}", result);
    assert_eq!(depth, 0, "operand stack must be balanced after a run");
    output
}

// =============================================================================
// Core scenarios
// =============================================================================

#[test]
fn test_function_call_returns_sum() {
    let out = run_ok("function add(int a, int b): int { return a + b; } print(add(2, 3));");
    assert_eq!(out, "5\n");
}

#[test]
fn test_while_loop_counts_down() {
    let out = run_ok("int x = 10; while (x > 0) { x = x - 1; } print(x);");
    assert_eq!(out, "0\n");
}

#[test]
fn test_try_catch_prints_payload_and_continues() {
    let out = run_ok("try { throw \"boom\"; } catch (e) { print(e); }");
    assert_eq!(out, "boom\n");
}

#[test]
fn test_tuple_unpack_declaration() {
    let out = run_ok(
        "function split(int n): (int, int) { return n / 2, n - n / 2; }
         int a, b = split(7);
         print(a);
         print(b);",
    );
    assert_eq!(out, "3\n4\n");
}

#[test]
fn test_division_by_zero_faults_with_no_output() {
    let (result, output, _) = run("print(1 / 0);");
    assert_eq!(result, Err(Fault::DivisionByZero));
    assert_eq!(output, "");
}

#[test]
fn test_modulo_by_zero_faults() {
    let (result, _, _) = run("print(1 % 0);");
    assert_eq!(result, Err(Fault::DivisionByZero));
}

// =============================================================================
// Expressions and types
// =============================================================================

#[test]
fn test_float_arithmetic_prints_six_decimals() {
    let out = run_ok("print(0.1 + 0.2);");
    assert_eq!(out, format!("{:.6}\n", 0.1_f64 + 0.2_f64));
}

#[test]
fn test_float_subtraction_round_trip() {
    let out = run_ok("print((0.1 + 0.2) - 0.2);");
    assert_eq!(out, format!("{:.6}\n", (0.1_f64 + 0.2_f64) - 0.2_f64));
}

#[test]
fn test_negative_numbers() {
    let out = run_ok("print(-5); print(3 - 10);");
    assert_eq!(out, "-5\n-7\n");
}

#[test]
fn test_modulo() {
    let out = run_ok("print(10 % 3);");
    assert_eq!(out, "1\n");
}

#[test]
fn test_ternary_takes_the_true_branch() {
    let out = run_ok("print(1 < 2 ? 10 : 20); print(2 < 1 ? 10 : 20);");
    assert_eq!(out, "10\n20\n");
}

#[test]
fn test_char_prints_without_newline() {
    let out = run_ok("char c = 65; print(c); print(c);");
    assert_eq!(out, "AA");
}

#[test]
fn test_string_printing() {
    let out = run_ok("print(\"hello\");");
    assert_eq!(out, "hello\n");
}

#[test]
fn test_formatted_print() {
    let out = run_ok("print(\"x = %{int}, y = %{float}, s = %{str}\", 7, 1.5, \"hi\");");
    assert_eq!(out, "x = 7, y = 1.500000, s = hi\n");
}

#[test]
fn test_comparison_operators() {
    let out = run_ok("print(2 <= 2); print(2 != 2); print(3 >= 4); print(1 == 1);");
    assert_eq!(out, "1\n0\n0\n1\n");
}

// =============================================================================
// Scoping and control flow
// =============================================================================

#[test]
fn test_block_scope_shadows_and_restores() {
    let out = run_ok(
        "int x = 1;
         {
             int x = 2;
             print(x);
         }
         print(x);",
    );
    assert_eq!(out, "2\n1\n");
}

#[test]
fn test_for_loop_with_break_and_continue() {
    let out = run_ok(
        "int total = 0;
         for (int i = 0; i < 10; i++) {
             if (i == 3) { continue; }
             if (i == 6) { break; }
             total += i;
         }
         print(total);",
    );
    // 0 + 1 + 2 + 4 + 5
    assert_eq!(out, "12\n");
}

#[test]
fn test_nested_loops_break_targets_innermost() {
    let out = run_ok(
        "int hits = 0;
         for (int i = 0; i < 3; i++) {
             for (int j = 0; j < 10; j++) {
                 if (j == 2) { break; }
                 hits++;
             }
         }
         print(hits);",
    );
    assert_eq!(out, "6\n");
}

#[test]
fn test_compound_assignment_on_scalars() {
    let out = run_ok("int x = 10; x += 5; x -= 3; x++; x--; print(x);");
    assert_eq!(out, "12\n");
}

#[test]
fn test_recursion() {
    let out = run_ok(
        "function fib(int n): int {
             if (n < 2) { return n; }
             return fib(n - 1) + fib(n - 2);
         }
         print(fib(10));",
    );
    assert_eq!(out, "55\n");
}

#[test]
fn test_mutual_recursion_via_forward_reference() {
    let out = run_ok(
        "function is_even(int n): int {
             if (n == 0) { return 1; }
             return is_odd(n - 1);
         }
         function is_odd(int n): int {
             if (n == 0) { return 0; }
             return is_even(n - 1);
         }
         print(is_even(10));
         print(is_odd(10));",
    );
    assert_eq!(out, "1\n0\n");
}

#[test]
fn test_top_level_runs_before_main() {
    let out = run_ok(
        "int x = 5;
         function main() { print(x); }
         print(100);",
    );
    assert_eq!(out, "100\n5\n");
}

#[test]
fn test_namespaced_function_call() {
    let out = run_ok("function math.sq(int n): int { return n * n; } print(math.sq(5));");
    assert_eq!(out, "25\n");
}

#[test]
fn test_c_style_function_definition() {
    let out = run_ok("int twice(int n) { return n * 2; } print(twice(21));");
    assert_eq!(out, "42\n");
}

// =============================================================================
// Structs and arrays
// =============================================================================

#[test]
fn test_struct_field_round_trip() {
    let out = run_ok(
        "struct Point { int x; int y; }
         Point p = new(Point);
         p.x = 3;
         p.y = 4;
         print(p.x + p.y);",
    );
    assert_eq!(out, "7\n");
}

#[test]
fn test_array_round_trip() {
    let out = run_ok(
        "int[] a = new(int, 3);
         a[0] = 5;
         a[1] = 6;
         a[2] = a[0] + a[1];
         print(a[2]);",
    );
    assert_eq!(out, "11\n");
}

#[test]
fn test_compound_assignment_on_field_and_index() {
    let out = run_ok(
        "struct C { int n; }
         C c = new(C);
         c.n += 5;
         c.n++;
         print(c.n);
         int[] a = new(int, 1);
         a[0]++;
         a[0]++;
         a[0]--;
         print(a[0]);",
    );
    assert_eq!(out, "6\n1\n");
}

#[test]
fn test_struct_array_elements_are_structs() {
    let out = run_ok(
        "struct P { int v; }
         P[] ps = new(P, 2);
         ps[0] = new(P);
         ps[1] = new(P);
         P first = ps[0];
         first.v = 9;
         print(first.v);",
    );
    assert_eq!(out, "9\n");
}

#[test]
fn test_array_index_out_of_bounds_faults() {
    let (result, _, _) = run("int[] a = new(int, 2); print(a[5]);");
    assert!(matches!(result, Err(Fault::IndexOutOfBounds { .. })));
}

#[test]
fn test_use_after_free_faults() {
    let (result, _, _) = run(
        "struct B { int a; }
         B b = new(B);
         free(b);
         print(b.a);",
    );
    assert_eq!(result, Err(Fault::BadHandle));
}

#[test]
fn test_double_free_faults() {
    let (result, _, _) = run(
        "struct B { int a; }
         B b = new(B);
         free(b);
         free(b);",
    );
    assert_eq!(result, Err(Fault::BadHandle));
}

// =============================================================================
// Heap registry and frame-scoped allocations
// =============================================================================

fn run_vm(src: &str) -> (Vm, String) {
    let compiled = compile_source(src).expect("compile error");
    let mut vm = Vm::with_capture();
    vm.run(&compiled.module).expect("run error");
    let out = vm.take_output();
    (vm, out)
}

#[test]
fn test_frame_scoped_allocation_swept_on_return() {
    let (vm, _) = run_vm(
        "struct Buf { int a; int b; }
         function g() {
             Buf tmp = stack(Buf);
             tmp.a = 1;
         }
         g();",
    );
    assert_eq!(vm.heap().live_count(), 0);
}

#[test]
fn test_plain_allocation_survives_return() {
    let (vm, _) = run_vm(
        "struct Buf { int a; }
         function g(): Buf { return new(Buf); }
         Buf b = g();",
    );
    assert_eq!(vm.heap().live_count(), 1);
}

#[test]
fn test_free_empties_the_registry() {
    let (vm, _) = run_vm(
        "struct Buf { int a; }
         Buf b = new(Buf);
         free(b);",
    );
    assert_eq!(vm.heap().live_count(), 0);
}

#[test]
fn test_heapdump_lists_live_allocations() {
    let out = run_ok(
        "struct Buf { int a; }
         Buf b = new(Buf);
         heapdump();",
    );
    assert!(out.contains("=== live allocations ==="));
    assert!(out.contains("Buf"));
    assert!(out.contains("1 allocation(s)"));
}

// =============================================================================
// Exceptions
// =============================================================================

#[test]
fn test_uncaught_throw_terminates() {
    let (result, output, _) = run("throw \"kaboom\";");
    assert_eq!(result, Err(Fault::UncaughtException("kaboom".to_string())));
    assert_eq!(output, "");
}

#[test]
fn test_throw_across_call_frames_rewinds() {
    let out = run_ok(
        "function risky(int n) {
             if (n == 0) { throw \"deep\"; }
             risky(n - 1);
         }
         try {
             risky(5);
         } catch (e) {
             print(e);
         }
         print(\"after\");",
    );
    assert_eq!(out, "deep\nafter\n");
}

#[test]
fn test_nested_try_inner_catches_first() {
    let out = run_ok(
        "try {
             try {
                 throw \"inner\";
             } catch (e) {
                 print(e);
             }
             throw \"outer\";
         } catch (e) {
             print(e);
         }",
    );
    assert_eq!(out, "inner\nouter\n");
}

#[test]
fn test_exception_leaves_earlier_work_intact() {
    let out = run_ok(
        "int done = 0;
         function work(): int {
             done = 1;
             throw \"stop\";
         }
         try {
             print(work());
         } catch (e) {
             print(e);
         }
         print(done);",
    );
    assert_eq!(out, "stop\n1\n");
}

// =============================================================================
// Multi-return
// =============================================================================

#[test]
fn test_tuple_unpack_into_existing_variables() {
    let out = run_ok(
        "function mm(int a, int b): (int, int) { return a + 1, b + 1; }
         int x;
         int y;
         x, y = mm(10, 20);
         print(x);
         print(y);",
    );
    assert_eq!(out, "11\n21\n");
}

#[test]
fn test_named_return_values() {
    let out = run_ok(
        "function divmod(int a, int b): (int q, int r) {
             q = a / b;
             r = a % b;
             return q, r;
         }
         int q, r = divmod(17, 5);
         print(q);
         print(r);",
    );
    assert_eq!(out, "3\n2\n");
}

#[test]
fn test_three_return_values() {
    let out = run_ok(
        "function spread(int n): (int, int, int) { return n - 1, n, n + 1; }
         int a, b, c = spread(5);
         print(a);
         print(b);
         print(c);",
    );
    assert_eq!(out, "4\n5\n6\n");
}

#[test]
fn test_void_call_statement_is_balanced() {
    let out = run_ok(
        "function shout() { print(\"hi\"); }
         shout();
         shout();",
    );
    assert_eq!(out, "hi\nhi\n");
}

#[test]
fn test_local_tuple_declaration_in_function() {
    let out = run_ok(
        "function pair(): (int, int) { return 7, 9; }
         function f() {
             int a, b = pair();
             print(a);
             print(b);
         }
         f();",
    );
    assert_eq!(out, "7\n9\n");
}

// =============================================================================
// Module round trip and imports
// =============================================================================

#[test]
fn test_module_survives_encode_decode() {
    let compiled =
        compile_source("function add(int a, int b): int { return a + b; } print(add(2, 3));")
            .unwrap();
    let bytes = compiled.module.encode().unwrap();
    let module = Module::decode(&bytes).unwrap();

    let mut vm = Vm::with_capture();
    assert!(vm.run(&module).is_ok());
    assert_eq!(vm.take_output(), "5\n");
}

#[test]
fn test_import_splices_a_library_once() {
    let dir = std::env::temp_dir().join("cinder_import_test");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("lib.cn"),
        "function triple(int n): int { return n * 3; }",
    )
    .unwrap();
    // the second import must be deduplicated, not redefine triple
    std::fs::write(
        dir.join("main.cn"),
        "import lib;\nimport lib;\nprint(triple(14));",
    )
    .unwrap();

    let compiled = cinder::compile_file(&dir.join("main.cn")).expect("compile error");
    let mut vm = Vm::with_capture();
    assert!(vm.run(&compiled.module).is_ok());
    assert_eq!(vm.take_output(), "42\n");
}

#[test]
fn test_missing_import_is_a_compile_error() {
    let dir = std::env::temp_dir().join("cinder_missing_import_test");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("main.cn"), "import nowhere;").unwrap();

    let err = cinder::compile_file(&dir.join("main.cn")).unwrap_err();
    assert!(err.to_string().contains("import"));
}
