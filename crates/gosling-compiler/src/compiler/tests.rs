use std::rc::Rc;

use gosling_bytecode::{disassemble, make, OpCode};
use gosling_object::Value;

use crate::compiler::{Bytecode, CompileError, Compiler};
use crate::program::{Input, Program};

fn compile_input(src: &str, is_stmt: bool) -> Bytecode {
    let input = if is_stmt {
        Input::statements(src)
    } else {
        Input::file("test.go", src)
    };
    let prog = Program::parse(&input).expect("parse failed");
    let mut compiler = Compiler::new();
    compiler.compile_program(&prog).expect("compile failed");
    compiler.bytecode()
}

fn compile_stmts(src: &str) -> Bytecode {
    compile_input(src, true)
}

fn compile_err(src: &str) -> CompileError {
    let prog = Program::parse(&Input::statements(src)).expect("parse failed");
    let mut compiler = Compiler::new();
    compiler
        .compile_program(&prog)
        .expect_err("expected a compile error")
}

fn concat(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.iter().flatten().copied().collect()
}

#[track_caller]
fn assert_instructions(expected: &[Vec<u8>], actual: &[u8]) {
    let expected = concat(expected);
    assert_eq!(
        expected,
        actual,
        "wrong instructions.\nwant:\n{}\ngot:\n{}",
        disassemble(&expected),
        disassemble(actual)
    );
}

#[track_caller]
fn assert_constants(expected: &[Value], actual: &[Value]) {
    assert_eq!(
        expected.len(),
        actual.len(),
        "wrong number of constants: want={}, got={:?}",
        expected.len(),
        actual
    );
    for (i, (want, got)) in expected.iter().zip(actual).enumerate() {
        match (want, got) {
            (Value::CompiledFunction(want_fn), Value::CompiledFunction(got_fn)) => {
                assert_eq!(
                    want_fn.instructions,
                    got_fn.instructions,
                    "constant {}: wrong function instructions.\nwant:\n{}\ngot:\n{}",
                    i,
                    disassemble(&want_fn.instructions),
                    disassemble(&got_fn.instructions)
                );
            }
            _ => assert_eq!(want, got, "constant {} mismatch", i),
        }
    }
}

fn func_constant(instructions: &[Vec<u8>]) -> Value {
    Value::CompiledFunction(Rc::new(gosling_object::CompiledFunction {
        name: String::new(),
        instructions: concat(instructions),
        num_locals: 0,
        num_params: 0,
        num_results: 0,
        free_count: 0,
    }))
}

#[test]
fn test_integer_arithmetic() {
    let cases: &[(&str, Vec<Value>, Vec<Vec<u8>>)] = &[
        (
            "1 + 2",
            vec![Value::Int(1), Value::Int(2)],
            vec![
                make(OpCode::Const, &[0]),
                make(OpCode::Const, &[1]),
                make(OpCode::Add, &[]),
                make(OpCode::Pop, &[]),
            ],
        ),
        (
            "1 - 2",
            vec![Value::Int(1), Value::Int(2)],
            vec![
                make(OpCode::Const, &[0]),
                make(OpCode::Const, &[1]),
                make(OpCode::Sub, &[]),
                make(OpCode::Pop, &[]),
            ],
        ),
        (
            "1 * 2",
            vec![Value::Int(1), Value::Int(2)],
            vec![
                make(OpCode::Const, &[0]),
                make(OpCode::Const, &[1]),
                make(OpCode::Mul, &[]),
                make(OpCode::Pop, &[]),
            ],
        ),
        (
            "2 / 1",
            vec![Value::Int(2), Value::Int(1)],
            vec![
                make(OpCode::Const, &[0]),
                make(OpCode::Const, &[1]),
                make(OpCode::Quo, &[]),
                make(OpCode::Pop, &[]),
            ],
        ),
        (
            "-1",
            vec![Value::Int(1)],
            vec![
                make(OpCode::Const, &[0]),
                make(OpCode::PrefixSub, &[]),
                make(OpCode::Pop, &[]),
            ],
        ),
        (
            "1 & 2",
            vec![Value::Int(1), Value::Int(2)],
            vec![
                make(OpCode::Const, &[0]),
                make(OpCode::Const, &[1]),
                make(OpCode::And, &[]),
                make(OpCode::Pop, &[]),
            ],
        ),
        (
            "1 &^ 2",
            vec![Value::Int(1), Value::Int(2)],
            vec![
                make(OpCode::Const, &[0]),
                make(OpCode::Const, &[1]),
                make(OpCode::AndNot, &[]),
                make(OpCode::Pop, &[]),
            ],
        ),
    ];

    for (src, constants, instructions) in cases {
        let bytecode = compile_stmts(src);
        assert_constants(constants, &bytecode.constants);
        assert_instructions(instructions, &bytecode.instructions);
    }
}

#[test]
fn test_boolean_expressions() {
    let cases: &[(&str, Vec<Value>, Vec<Vec<u8>>)] = &[
        (
            "true",
            vec![],
            vec![make(OpCode::True, &[]), make(OpCode::Pop, &[])],
        ),
        (
            "1 > 2",
            vec![Value::Int(1), Value::Int(2)],
            vec![
                make(OpCode::Const, &[0]),
                make(OpCode::Const, &[1]),
                make(OpCode::Gtr, &[]),
                make(OpCode::Pop, &[]),
            ],
        ),
        (
            "1 != 2",
            vec![Value::Int(1), Value::Int(2)],
            vec![
                make(OpCode::Const, &[0]),
                make(OpCode::Const, &[1]),
                make(OpCode::Neq, &[]),
                make(OpCode::Pop, &[]),
            ],
        ),
        (
            "true == false",
            vec![],
            vec![
                make(OpCode::True, &[]),
                make(OpCode::False, &[]),
                make(OpCode::Eql, &[]),
                make(OpCode::Pop, &[]),
            ],
        ),
        (
            "!true",
            vec![],
            vec![
                make(OpCode::True, &[]),
                make(OpCode::Not, &[]),
                make(OpCode::Pop, &[]),
            ],
        ),
    ];

    for (src, constants, instructions) in cases {
        let bytecode = compile_stmts(src);
        assert_constants(constants, &bytecode.constants);
        assert_instructions(instructions, &bytecode.instructions);
    }
}

#[test]
fn test_string_expressions() {
    let bytecode = compile_stmts(r#""gos" + "ling""#);
    assert_constants(
        &[Value::Str(Rc::from("gos")), Value::Str(Rc::from("ling"))],
        &bytecode.constants,
    );
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::Const, &[1]),
            make(OpCode::Add, &[]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );
}

#[test]
fn test_var_statements() {
    let bytecode = compile_stmts("var one, two = 1, 2\none");
    assert_constants(&[Value::Int(1), Value::Int(2)], &bytecode.constants);
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::SetGlobal, &[0]),
            make(OpCode::Const, &[1]),
            make(OpCode::SetGlobal, &[1]),
            make(OpCode::GetGlobal, &[0]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("one := 1\none");
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::SetGlobal, &[0]),
            make(OpCode::GetGlobal, &[0]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("var one = 1\nvar two = one\ntwo");
    assert_constants(&[Value::Int(1)], &bytecode.constants);
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::SetGlobal, &[0]),
            make(OpCode::GetGlobal, &[0]),
            make(OpCode::SetGlobal, &[1]),
            make(OpCode::GetGlobal, &[1]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );
}

#[test]
fn test_typed_var_without_initializer() {
    let bytecode = compile_stmts("var a int\na");
    assert_constants(&[Value::Int(0)], &bytecode.constants);
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::SetGlobal, &[0]),
            make(OpCode::GetGlobal, &[0]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );
}

#[test]
fn test_literal_coerced_to_declared_type() {
    let bytecode = compile_stmts("var f float64 = 1\nf");
    assert_constants(&[Value::Float64(1.0)], &bytecode.constants);
}

#[test]
fn test_array_literals() {
    let bytecode = compile_stmts("[]int{}");
    assert_constants(&[], &bytecode.constants);
    assert_instructions(
        &[make(OpCode::Array, &[0]), make(OpCode::Pop, &[])],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("[]int{1, 2, 3}");
    assert_constants(
        &[Value::Int(1), Value::Int(2), Value::Int(3)],
        &bytecode.constants,
    );
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::Const, &[1]),
            make(OpCode::Const, &[2]),
            make(OpCode::Array, &[3]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("[]int{1 + 2, 3 - 4, 5 * 6}");
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::Const, &[1]),
            make(OpCode::Add, &[]),
            make(OpCode::Const, &[2]),
            make(OpCode::Const, &[3]),
            make(OpCode::Sub, &[]),
            make(OpCode::Const, &[4]),
            make(OpCode::Const, &[5]),
            make(OpCode::Mul, &[]),
            make(OpCode::Array, &[3]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );
}

#[test]
fn test_hash_literals() {
    let bytecode = compile_stmts("map[string]int{}");
    assert_instructions(
        &[make(OpCode::Hash, &[0]), make(OpCode::Pop, &[])],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("map[int]int{1: 2, 3: 4, 5: 6}");
    assert_constants(
        &[
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
            Value::Int(4),
            Value::Int(5),
            Value::Int(6),
        ],
        &bytecode.constants,
    );
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::Const, &[1]),
            make(OpCode::Const, &[2]),
            make(OpCode::Const, &[3]),
            make(OpCode::Const, &[4]),
            make(OpCode::Const, &[5]),
            make(OpCode::Hash, &[6]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("map[int]int{1: 2 + 3, 4: 5 * 6}");
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::Const, &[1]),
            make(OpCode::Const, &[2]),
            make(OpCode::Add, &[]),
            make(OpCode::Const, &[3]),
            make(OpCode::Const, &[4]),
            make(OpCode::Const, &[5]),
            make(OpCode::Mul, &[]),
            make(OpCode::Hash, &[4]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );
}

#[test]
fn test_unhashable_map_key_rejected() {
    let err = compile_err("map[[]int]int{}");
    match err {
        CompileError::At { message, .. } => assert!(message.contains("HashKey")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_index_expressions() {
    let bytecode = compile_stmts("[]int{1, 2, 3}[1 + 1]");
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::Const, &[1]),
            make(OpCode::Const, &[2]),
            make(OpCode::Array, &[3]),
            make(OpCode::Const, &[3]),
            make(OpCode::Const, &[4]),
            make(OpCode::Add, &[]),
            make(OpCode::Index, &[]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("var a = []int{1, 2, 3}\na[1 + 1]");
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::Const, &[1]),
            make(OpCode::Const, &[2]),
            make(OpCode::Array, &[3]),
            make(OpCode::SetGlobal, &[0]),
            make(OpCode::GetGlobal, &[0]),
            make(OpCode::Const, &[3]),
            make(OpCode::Const, &[4]),
            make(OpCode::Add, &[]),
            make(OpCode::Index, &[]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );
}

#[test]
fn test_index_assignment() {
    let bytecode = compile_stmts("a := []int{1}\na[0] = 2");
    // Value first, then container and index, then the indexed store
    // carrying the container's symbol index.
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::Array, &[1]),
            make(OpCode::SetGlobal, &[0]),
            make(OpCode::Const, &[1]),
            make(OpCode::GetGlobal, &[0]),
            make(OpCode::Const, &[2]),
            make(OpCode::SetGlobalIndex, &[0]),
        ],
        &bytecode.instructions,
    );
}

#[test]
fn test_conditionals() {
    let bytecode = compile_stmts("if true { 10 }");
    assert_constants(&[Value::Int(10)], &bytecode.constants);
    assert_instructions(
        &[
            // 0000
            make(OpCode::True, &[]),
            // 0001
            make(OpCode::JumpNotTruthy, &[10]),
            // 0004
            make(OpCode::Const, &[0]),
            // 0007
            make(OpCode::Jump, &[10]),
            // 0010
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("if true { 10 } else { 20 }");
    assert_constants(&[Value::Int(10), Value::Int(20)], &bytecode.constants);
    assert_instructions(
        &[
            make(OpCode::True, &[]),
            make(OpCode::JumpNotTruthy, &[10]),
            make(OpCode::Const, &[0]),
            make(OpCode::Jump, &[13]),
            make(OpCode::Const, &[1]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("if 1 > 2 { 1 } else if 1 == 2 { 0 } else { -1 }");
    assert_instructions(
        &[
            // 0000
            make(OpCode::Const, &[0]),
            // 0003
            make(OpCode::Const, &[1]),
            // 0006
            make(OpCode::Gtr, &[]),
            // 0007
            make(OpCode::JumpNotTruthy, &[16]),
            // 0010
            make(OpCode::Const, &[2]),
            // 0013
            make(OpCode::Jump, &[36]),
            // 0016
            make(OpCode::Const, &[3]),
            // 0019
            make(OpCode::Const, &[4]),
            // 0022
            make(OpCode::Eql, &[]),
            // 0023
            make(OpCode::JumpNotTruthy, &[32]),
            // 0026
            make(OpCode::Const, &[5]),
            // 0029
            make(OpCode::Jump, &[36]),
            // 0032
            make(OpCode::Const, &[6]),
            // 0035
            make(OpCode::PrefixSub, &[]),
            // 0036
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );
}

#[test]
fn test_functions() {
    let bytecode = compile_stmts("func() int { return 5 + 10 }");
    assert_constants(
        &[
            Value::Int(5),
            Value::Int(10),
            func_constant(&[
                make(OpCode::Const, &[0]),
                make(OpCode::Const, &[1]),
                make(OpCode::Add, &[]),
                make(OpCode::ReturnValue, &[1]),
            ]),
        ],
        &bytecode.constants,
    );
    assert_instructions(
        &[make(OpCode::Closure, &[2, 0]), make(OpCode::Pop, &[])],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("func() { 5 + 10 }");
    assert_constants(
        &[
            Value::Int(5),
            Value::Int(10),
            func_constant(&[
                make(OpCode::Const, &[0]),
                make(OpCode::Const, &[1]),
                make(OpCode::Add, &[]),
                make(OpCode::Return, &[]),
            ]),
        ],
        &bytecode.constants,
    );

    let bytecode = compile_stmts("func() { }");
    assert_constants(
        &[func_constant(&[make(OpCode::Return, &[])])],
        &bytecode.constants,
    );
}

#[test]
fn test_function_scopes() {
    let bytecode = compile_stmts("func() int {\nvar num = 55\nreturn num\n}");
    assert_constants(
        &[
            Value::Int(55),
            func_constant(&[
                make(OpCode::Const, &[0]),
                make(OpCode::SetLocal, &[0]),
                make(OpCode::GetLocal, &[0]),
                make(OpCode::ReturnValue, &[1]),
            ]),
        ],
        &bytecode.constants,
    );

    let bytecode =
        compile_stmts("var num = 55\nvar b = func() int { return num }\nvar a = 3\nvar c = b()");
    assert_constants(
        &[
            Value::Int(55),
            func_constant(&[
                make(OpCode::GetGlobal, &[0]),
                make(OpCode::ReturnValue, &[1]),
            ]),
            Value::Int(3),
        ],
        &bytecode.constants,
    );
    assert_instructions(
        &[
            make(OpCode::Const, &[0]),
            make(OpCode::SetGlobal, &[0]),
            make(OpCode::Closure, &[1, 0]),
            make(OpCode::SetGlobal, &[1]),
            make(OpCode::Const, &[2]),
            make(OpCode::SetGlobal, &[2]),
            make(OpCode::GetGlobal, &[1]),
            make(OpCode::Call, &[0]),
            make(OpCode::SetGlobal, &[3]),
        ],
        &bytecode.instructions,
    );
}

#[test]
fn test_function_calls() {
    let bytecode = compile_stmts("func() int { return 24 }()");
    assert_instructions(
        &[
            make(OpCode::Closure, &[1, 0]),
            make(OpCode::Call, &[0]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("func(a, b int) int { return a + b }(3, 4)");
    assert_constants(
        &[
            func_constant(&[
                make(OpCode::GetLocal, &[0]),
                make(OpCode::GetLocal, &[1]),
                make(OpCode::Add, &[]),
                make(OpCode::ReturnValue, &[1]),
            ]),
            Value::Int(3),
            Value::Int(4),
        ],
        &bytecode.constants,
    );
    assert_instructions(
        &[
            make(OpCode::Closure, &[0, 0]),
            make(OpCode::Const, &[1]),
            make(OpCode::Const, &[2]),
            make(OpCode::Call, &[2]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("noArg := func() int { return 24 }\nnoArg()");
    assert_instructions(
        &[
            make(OpCode::Closure, &[1, 0]),
            make(OpCode::SetGlobal, &[0]),
            make(OpCode::GetGlobal, &[0]),
            make(OpCode::Call, &[0]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("add := func(a, b int) int { return a + b }\nadd(3, 4)");
    assert_instructions(
        &[
            make(OpCode::Closure, &[0, 0]),
            make(OpCode::SetGlobal, &[0]),
            make(OpCode::GetGlobal, &[0]),
            make(OpCode::Const, &[1]),
            make(OpCode::Const, &[2]),
            make(OpCode::Call, &[2]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );
}

#[test]
fn test_named_results_pad_the_call() {
    let src = "package tmp\nfunc main() { f(1) }\nfunc f(a int) (out int) {\nout = a\nreturn\n}";
    let bytecode = compile_input(src, false);
    // The call pushes the argument plus one zero for the named result.
    let listing = disassemble(&bytecode.instructions);
    assert!(listing.contains("OpCall 2"), "listing:\n{}", listing);
}

#[test]
fn test_builtins() {
    let bytecode = compile_stmts("len([]int{})");
    assert_instructions(
        &[
            make(OpCode::GetBuiltin, &[13]),
            make(OpCode::Array, &[0]),
            make(OpCode::Call, &[1]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts("append([]int{}, 1)");
    assert_instructions(
        &[
            make(OpCode::GetBuiltin, &[14]),
            make(OpCode::Array, &[0]),
            make(OpCode::Const, &[0]),
            make(OpCode::Call, &[2]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );
}

#[test]
fn test_closures() {
    let bytecode = compile_stmts(
        "func(a int) func(int) int {\nreturn func(b int) int { return a + b }\n}",
    );
    assert_constants(
        &[
            func_constant(&[
                make(OpCode::GetFree, &[0]),
                make(OpCode::GetLocal, &[0]),
                make(OpCode::Add, &[]),
                make(OpCode::ReturnValue, &[1]),
            ]),
            func_constant(&[
                make(OpCode::GetLocal, &[0]),
                make(OpCode::Closure, &[0, 1]),
                make(OpCode::ReturnValue, &[1]),
            ]),
        ],
        &bytecode.constants,
    );
    assert_instructions(
        &[make(OpCode::Closure, &[1, 0]), make(OpCode::Pop, &[])],
        &bytecode.instructions,
    );

    let bytecode = compile_stmts(
        "newAdder := func(a, b int) func(int) int {\nreturn func(c int) int { return a + b + c }\n}\nadder := newAdder(1, 2)\nadder(8)",
    );
    assert_constants(
        &[
            func_constant(&[
                make(OpCode::GetFree, &[0]),
                make(OpCode::GetFree, &[1]),
                make(OpCode::Add, &[]),
                make(OpCode::GetLocal, &[0]),
                make(OpCode::Add, &[]),
                make(OpCode::ReturnValue, &[1]),
            ]),
            func_constant(&[
                make(OpCode::GetLocal, &[0]),
                make(OpCode::GetLocal, &[1]),
                make(OpCode::Closure, &[0, 2]),
                make(OpCode::ReturnValue, &[1]),
            ]),
            Value::Int(1),
            Value::Int(2),
            Value::Int(8),
        ],
        &bytecode.constants,
    );
    assert_instructions(
        &[
            make(OpCode::Closure, &[1, 0]),
            make(OpCode::SetGlobal, &[0]),
            make(OpCode::GetGlobal, &[0]),
            make(OpCode::Const, &[2]),
            make(OpCode::Const, &[3]),
            make(OpCode::Call, &[2]),
            make(OpCode::SetGlobal, &[1]),
            make(OpCode::GetGlobal, &[1]),
            make(OpCode::Const, &[4]),
            make(OpCode::Call, &[1]),
            make(OpCode::Pop, &[]),
        ],
        &bytecode.instructions,
    );
}

#[test]
fn test_recursive_function_uses_current_closure() {
    let src = "package tmp\nfunc main() { countDown(1) }\nfunc countDown(x int) int {\nif x == 0 { return 0 } else { return countDown(x - 1) }\n}";
    let bytecode = compile_input(src, false);
    let Some(Value::CompiledFunction(func)) = bytecode
        .constants
        .iter()
        .find(|c| matches!(c, Value::CompiledFunction(f) if f.name == "countDown"))
    else {
        panic!("countDown constant missing");
    };
    let listing = disassemble(&func.instructions);
    assert!(
        listing.contains("OpCurrentClosure"),
        "listing:\n{}",
        listing
    );
}

#[test]
fn test_forward_reference_retry() {
    let src = "package tmp\nfunc main() { a(1) }\nfunc a(x int) int { return b(x) + 1 }\nfunc b(x int) int { return x }";
    let bytecode = compile_input(src, false);
    // Both functions compiled; b landed first because a's compile
    // retried after compiling its forward reference.
    let names: Vec<&str> = bytecode
        .constants
        .iter()
        .filter_map(|c| match c {
            Value::CompiledFunction(f) if !f.name.is_empty() => Some(f.name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["b", "a"]);
}

#[test]
fn test_for_loop_template() {
    let bytecode = compile_stmts("b := 0\nfor i := 0; i < 5; i++ { b += i }");
    let Some(Value::ForLoop(template)) = bytecode
        .constants
        .iter()
        .find(|c| matches!(c, Value::ForLoop(_)))
    else {
        panic!("for-loop template missing");
    };
    assert_eq!(template.num_locals, 1);
    assert_eq!(template.free_count(), 0);
    assert!(!template.init.is_empty());
    assert!(!template.cond.is_empty());
    assert!(!template.body.is_empty());
    assert!(!template.post.is_empty());

    // The loop closure and driver opcode follow the loop constant.
    let listing = disassemble(&bytecode.instructions);
    assert!(listing.contains("OpForLoop"), "listing:\n{}", listing);
}

#[test]
fn test_for_without_condition_compiles_true() {
    let bytecode = compile_stmts("for { break }");
    let Some(Value::ForLoop(template)) = bytecode
        .constants
        .iter()
        .find(|c| matches!(c, Value::ForLoop(_)))
    else {
        panic!("for-loop template missing");
    };
    assert_eq!(template.cond, make(OpCode::True, &[]));
}

#[test]
fn test_range_loop_template() {
    let bytecode = compile_stmts("a := []int{1, 2}\nvar b int\nfor _, item := range a { b += item }");
    let Some(Value::RangeLoop(template)) = bytecode
        .constants
        .iter()
        .find(|c| matches!(c, Value::RangeLoop(_)))
    else {
        panic!("range-loop template missing");
    };
    assert!(!template.is_anonymous);
    // loop_K, loop_V, and the user's value binding.
    assert_eq!(template.num_locals, 3);

    let listing = disassemble(&bytecode.instructions);
    assert!(listing.contains("OpRangeLoop"), "listing:\n{}", listing);
}

#[test]
fn test_range_over_literal_is_anonymous() {
    let bytecode = compile_stmts("var b int\nfor _, item := range []int{1, 2} { b += item }");
    let Some(Value::RangeLoop(template)) = bytecode
        .constants
        .iter()
        .find(|c| matches!(c, Value::RangeLoop(_)))
    else {
        panic!("range-loop template missing");
    };
    assert!(template.is_anonymous);
    // loop_x, loop_K, loop_V, and the user's value binding.
    assert_eq!(template.num_locals, 4);
}

#[test]
fn test_compiler_scopes() {
    let mut compiler = Compiler::new();
    assert_eq!(compiler.scope_index, 0);

    compiler.emit(OpCode::Mul, &[]);

    compiler.enter_scope();
    assert_eq!(compiler.scope_index, 1);

    compiler.emit(OpCode::Sub, &[]);
    assert_eq!(compiler.scopes[compiler.scope_index].instructions.len(), 1);
    assert_eq!(
        compiler.scopes[compiler.scope_index].last.unwrap().opcode,
        OpCode::Sub
    );
    assert!(compiler.symbol_table.outer.is_some());

    compiler.leave_scope();
    assert_eq!(compiler.scope_index, 0);
    assert!(compiler.symbol_table.outer.is_none());

    compiler.emit(OpCode::Add, &[]);
    assert_eq!(compiler.scopes[compiler.scope_index].instructions.len(), 2);
    assert_eq!(
        compiler.scopes[compiler.scope_index].last.unwrap().opcode,
        OpCode::Add
    );
    assert_eq!(
        compiler.scopes[compiler.scope_index]
            .previous
            .unwrap()
            .opcode,
        OpCode::Mul
    );
}

#[test]
fn test_undefined_variable() {
    assert_eq!(
        compile_err("foo"),
        CompileError::Undefined("foo".to_string())
    );
}

#[test]
fn test_const_unsupported() {
    match compile_err("const a = 1") {
        CompileError::At { message, line, .. } => {
            assert!(message.contains("not support const"));
            assert_eq!(line, 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_no_new_variables() {
    match compile_err("a := 1\na := 2") {
        CompileError::At { message, line, .. } => {
            assert!(message.contains("no new variables"));
            assert_eq!(line, 2);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_multi_return_destructuring_emits_two_stores() {
    let src = "package tmp\nfunc main() {\ne, f := two(3, 4)\nprintln(e)\nprintln(f)\n}\nfunc two(a, b int) (int, int) { return a + b, a - b }";
    let bytecode = compile_input(src, false);
    let listing = disassemble(&bytecode.instructions);
    let stores = listing.matches("OpSetGlobal").count();
    assert_eq!(stores, 2, "listing:\n{}", listing);
}
