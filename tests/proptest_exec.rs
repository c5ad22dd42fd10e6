//! Property tests over the compile-and-run pipeline: integer results
//! match host arithmetic, float cells survive bit-for-bit, and every
//! run leaves the operand stack balanced.

use cinder::compile_source;
use cinder::runtime::vm::Vm;
use proptest::prelude::*;

fn run_capture(src: &str) -> (String, usize) {
    let compiled = compile_source(src).expect("compile error");
    let mut vm = Vm::with_capture();
    vm.run(&compiled.module).expect("runtime fault");
    let depth = vm.stack_depth();
    (vm.take_output(), depth)
}

proptest! {
    #[test]
    fn prop_int_arithmetic_matches_host(a in -10_000i64..10_000, b in -10_000i64..10_000) {
        let src = format!("print({} * {} + {});", a, b, a);
        let expected = a * b + a;
        let (out, depth) = run_capture(&src);
        prop_assert_eq!(out, format!("{}\n", expected));
        prop_assert_eq!(depth, 0);
    }

    #[test]
    fn prop_division_matches_host(a in -10_000i64..10_000, b in 1i64..10_000) {
        let src = format!("print({} / {}); print({} % {});", a, b, a, b);
        let (out, depth) = run_capture(&src);
        prop_assert_eq!(out, format!("{}\n{}\n", a / b, a % b));
        prop_assert_eq!(depth, 0);
    }

    #[test]
    fn prop_float_round_trip_is_bit_exact(a in -1000.0f64..1000.0, b in -1000.0f64..1000.0) {
        // Literals are written with fixed precision, then the expected
        // value is computed from the exact parsed-back operands: what
        // the program computes must match the host bit-for-bit.
        let a_lit = format!("{:.6}", a);
        let b_lit = format!("{:.6}", b);
        let a_val: f64 = a_lit.parse().unwrap();
        let b_val: f64 = b_lit.parse().unwrap();

        let src = format!("print(({} + {}) - {});", a_lit, b_lit, b_lit);
        let expected = (a_val + b_val) - b_val;
        let (out, depth) = run_capture(&src);
        prop_assert_eq!(out, format!("{:.6}\n", expected));
        prop_assert_eq!(depth, 0);
    }

    #[test]
    fn prop_while_loop_always_terminates_balanced(n in 0i64..200) {
        let src = format!(
            "int x = {}; while (x > 0) {{ x = x - 1; }} print(x);",
            n
        );
        let (out, depth) = run_capture(&src);
        prop_assert_eq!(out, "0\n");
        prop_assert_eq!(depth, 0);
    }

    #[test]
    fn prop_call_return_symmetry(args in prop::collection::vec(-1000i64..1000, 1..8)) {
        // A function of N parameters returning their sum: after the
        // call completes the stack holds exactly the printed result.
        let params: Vec<String> = (0..args.len()).map(|i| format!("int p{}", i)).collect();
        let sum_expr: Vec<String> = (0..args.len()).map(|i| format!("p{}", i)).collect();
        let arg_list: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let src = format!(
            "function total({}): int {{ return {}; }} print(total({}));",
            params.join(", "),
            sum_expr.join(" + "),
            arg_list.join(", ")
        );
        let expected: i64 = args.iter().sum();
        let (out, depth) = run_capture(&src);
        prop_assert_eq!(out, format!("{}\n", expected));
        prop_assert_eq!(depth, 0);
    }

    #[test]
    fn prop_ternary_selects_correct_branch(a in -100i64..100, b in -100i64..100) {
        let src = format!("print({} < {} ? 1 : 0);", a, b);
        let (out, _) = run_capture(&src);
        prop_assert_eq!(out, format!("{}\n", (a < b) as i64));
    }
}
