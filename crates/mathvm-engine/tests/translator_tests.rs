//! Bytecode-level checks on translator output: instruction selection,
//! short forms, predicate inversion, inlining decisions, and idempotence.

use mathvm_engine::compiler::{compile, Bytecode, Code, Opcode};

/// Decode a byte stream into its opcode sequence.
fn opcodes(bc: &Bytecode) -> Vec<Opcode> {
    let mut result = Vec::new();
    let mut offset = 0u32;
    while offset < bc.len() {
        let insn = Opcode::from_u8(bc.get(offset)).expect("valid opcode");
        result.push(insn);
        offset += insn.len() as u32;
    }
    result
}

fn top_opcodes(source: &str) -> (Code, Vec<Opcode>) {
    let code = compile(source).unwrap();
    let ops = opcodes(&code.function_by_id(0).bytecode);
    (code, ops)
}

#[test]
fn test_expression_statement_sequence() {
    // int x; x = 2 + 3 * 4; print(x);
    let (code, ops) = top_opcodes("int x; x = 2 + 3 * 4; print(x);");
    assert_eq!(
        ops,
        vec![
            Opcode::Iload, // 4
            Opcode::Iload, // 3
            Opcode::Imul,
            Opcode::Iload, // 2
            Opcode::Iadd,
            Opcode::StoreIvar0,
            Opcode::LoadIvar0,
            Opcode::Iprint,
            Opcode::Return,
        ]
    );
    let bc = &code.function_by_id(0).bytecode;
    assert_eq!(bc.get_i64(1), 4);
    assert_eq!(bc.get_i64(10), 3);
    assert_eq!(bc.get_i64(20), 2);
}

#[test]
fn test_short_form_constants() {
    let (_, ops) = top_opcodes("print(0, 1, 0.0, 1.0, '');");
    assert_eq!(
        ops,
        vec![
            Opcode::Iload0,
            Opcode::Iprint,
            Opcode::Iload1,
            Opcode::Iprint,
            Opcode::Dload0,
            Opcode::Dprint,
            Opcode::Dload1,
            Opcode::Dprint,
            Opcode::Sload0,
            Opcode::Sprint,
            Opcode::Return,
        ]
    );
}

#[test]
fn test_short_form_slots_up_to_three() {
    let (code, ops) = top_opcodes(
        "int a; int b; int c; int d; int e; \
         a = 9; b = 9; c = 9; d = 9; e = 9;",
    );
    assert_eq!(
        ops,
        vec![
            Opcode::Iload,
            Opcode::StoreIvar0,
            Opcode::Iload,
            Opcode::StoreIvar1,
            Opcode::Iload,
            Opcode::StoreIvar2,
            Opcode::Iload,
            Opcode::StoreIvar3,
            Opcode::Iload,
            Opcode::StoreIvar, // slot 4 takes the long form
            Opcode::Return,
        ]
    );
    assert_eq!(code.function_by_id(0).locals_number(), 5);
}

#[test]
fn test_comparison_predicate_inversion() {
    // a < b compiles to IFICMPG over cmp(upper=a, lower=b).
    let (_, ops) = top_opcodes("print(1 < 2);");
    assert_eq!(
        ops,
        vec![
            Opcode::Iload, // 2, right operand first
            Opcode::Iload1,
            Opcode::Icmp,
            Opcode::Iload0,
            Opcode::IfIcmpG,
            Opcode::Iload0,
            Opcode::Ja,
            Opcode::Iload1,
            Opcode::Iprint,
            Opcode::Return,
        ]
    );

    let (_, ops) = top_opcodes("print(1 >= 2);");
    assert!(ops.contains(&Opcode::IfIcmpLe));
    let (_, ops) = top_opcodes("print(1 == 2);");
    assert!(ops.contains(&Opcode::IfIcmpE));
}

#[test]
fn test_double_comparison_uses_dcmp() {
    let (_, ops) = top_opcodes("print(1.5 < 2);");
    assert!(ops.contains(&Opcode::Dcmp));
    assert!(!ops.contains(&Opcode::Icmp));
    // The int endpoint widens.
    assert!(ops.contains(&Opcode::I2d));
}

#[test]
fn test_numeric_coercion_on_store() {
    // double a; a = 2;  →  ILOAD 2; I2D; STOREDVAR0
    let (_, ops) = top_opcodes("double a; a = 2; a = a + 0.5; print(a);");
    assert_eq!(
        &ops[..3],
        &[Opcode::Iload, Opcode::I2d, Opcode::StoreDvar0]
    );
    assert!(ops.contains(&Opcode::Dadd));
    assert!(ops.contains(&Opcode::Dprint));
}

#[test]
fn test_recursive_call_stays_a_call() {
    let (code, ops) = top_opcodes(
        "function int fact(int n) { if (n < 2) { return 1; } return n * fact(n - 1); } \
         print(fact(6));",
    );
    assert!(ops.contains(&Opcode::Call));
    // fact calls itself.
    let fact_ops = opcodes(&code.function_by_id(1).bytecode);
    assert!(fact_ops.contains(&Opcode::Call));
}

#[test]
fn test_non_recursive_call_is_inlined() {
    let (code, ops) = top_opcodes("function int twice(int n) { return n * 2; } print(twice(21));");
    assert!(!ops.contains(&Opcode::Call));
    // The callee still exists as a standalone function.
    assert_eq!(code.functions_count(), 2);
    // Its parameter became a caller local, stored from the stack.
    assert!(ops.contains(&Opcode::StoreIvar0));
}

#[test]
fn test_closure_access_compiles_to_ctx_forms() {
    let code = compile(
        "function int outer() { \
           int x; x = 41; \
           function int inner() { return x + 1; } \
           return inner(); \
         } \
         print(outer());",
    )
    .unwrap();
    let inner_ops = opcodes(&code.function_by_id(2).bytecode);
    assert!(inner_ops.contains(&Opcode::LoadCtxIvar));
    // Neither outer nor inner was inlined.
    let top_ops = opcodes(&code.function_by_id(0).bytecode);
    let outer_ops = opcodes(&code.function_by_id(1).bytecode);
    assert!(top_ops.contains(&Opcode::Call));
    assert!(outer_ops.contains(&Opcode::Call));
}

#[test]
fn test_for_loop_allocates_bound_temporary() {
    let code = compile("int i; for (i in 0..3) { print(i); }").unwrap();
    let top = code.function_by_id(0);
    // i plus the synthetic loop bound.
    assert_eq!(top.locals_number(), 2);
    let ops = opcodes(&top.bytecode);
    assert!(ops.contains(&Opcode::IfIcmpG));
    assert!(ops.contains(&Opcode::Ja));
}

#[test]
fn test_logical_and_or_short_circuit_shape() {
    let (_, ops) = top_opcodes("print(1 && 0);");
    assert!(ops.contains(&Opcode::IfIcmpE));
    let (_, ops) = top_opcodes("print(1 || 0);");
    assert!(ops.contains(&Opcode::IfIcmpNe));
}

#[test]
fn test_not_pattern_shape() {
    let (_, ops) = top_opcodes("print(!5);");
    assert_eq!(
        &ops[..8],
        &[
            Opcode::Iload, // 5
            Opcode::Iload0,
            Opcode::Icmp,
            Opcode::Iload, // -1
            Opcode::Iaxor,
            Opcode::Iload1,
            Opcode::Iaand,
            Opcode::Iprint,
        ]
    );
}

#[test]
fn test_all_branches_resolved() {
    let code = compile(
        "int i; \
         for (i in 0..5) { \
           if (i % 2 == 0) { print(i); } else { print('-'); } \
           while (i > 3) { i += 1; if (i > 10) { return; } } \
         }",
    )
    .unwrap();
    for function in code.functions() {
        let bc = &function.bytecode;
        let mut offset = 0u32;
        while offset < bc.len() {
            let insn = Opcode::from_u8(bc.get(offset)).expect("valid opcode");
            if insn.is_branch() {
                let target = offset as i64 + 1 + bc.get_i16(offset + 1) as i64;
                assert!(
                    target >= 0 && target <= bc.len() as i64,
                    "unresolved or wild branch at {}",
                    offset
                );
            }
            offset += insn.len() as u32;
        }
    }
}

#[test]
fn test_translation_is_idempotent() {
    let source = "function int fib(int n) { \
                    if (n < 2) { return n; } \
                    return fib(n - 1) + fib(n - 2); \
                  } \
                  int i; \
                  for (i in 0..10) { print(fib(i), ' '); }";
    let a = compile(source).unwrap();
    let b = compile(source).unwrap();
    assert_eq!(a.functions_count(), b.functions_count());
    for (fa, fb) in a.functions().zip(b.functions()) {
        assert_eq!(fa.bytecode.bytes(), fb.bytecode.bytes());
        assert_eq!(fa.locals_number(), fb.locals_number());
    }
}

#[test]
fn test_void_expression_statement_pops() {
    // A bare non-void call in statement position drops its result.
    let (_, ops) = top_opcodes(
        "function int f() { return 7; } \
         function int g() { return f(); } \
         function int h() { return g() + g(); } \
         h();",
    );
    // h is non-recursive and closure-free, so the whole chain inlines; the
    // discarded result is popped.
    assert!(ops.contains(&Opcode::Pop));
}

#[test]
fn test_nested_inlining() {
    let code = compile(
        "function int f() { return 7; } \
         function int g() { return f(); } \
         print(g());",
    )
    .unwrap();
    let ops = opcodes(&code.function_by_id(0).bytecode);
    // Both g and f splice into the top level.
    assert!(!ops.contains(&Opcode::Call));
    assert!(ops.contains(&Opcode::Iload));
}
