use gosling::compiler::{Compiler, Input, Program};
use gosling::object::Value;
use gosling::vm::VM;

/// Compile and run a raw statement block, returning the program's value.
fn run(source: &str) -> Result<Value, String> {
    run_input(Input::statements(source))
}

/// Compile and run a full source file.
fn run_file(source: &str) -> Result<Value, String> {
    run_input(Input::file("test.go", source))
}

fn run_input(input: Input) -> Result<Value, String> {
    let prog = Program::parse(&input).map_err(|e| format!("parse error: {}", e))?;
    let mut compiler = Compiler::new();
    compiler
        .compile_program(&prog)
        .map_err(|e| format!("compile error: {}", e))?;
    let mut vm = VM::new(compiler.bytecode());
    vm.run().map_err(|e| format!("runtime error: {}", e))?;
    Ok(vm.last_popped().clone())
}

fn as_int(value: &Value) -> i64 {
    value.widen().unwrap_or_else(|| panic!("not an integer: {:?}", value))
}

#[test]
fn test_simple_addition() {
    assert_eq!(as_int(&run("1 + 2").unwrap()), 3);
}

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(as_int(&run("(5 + 10 * 2 + 15 / 3) * 2 + -10").unwrap()), 50);
}

#[test]
fn test_if_else_returns() {
    assert_eq!(
        as_int(&run("if 1 > 2 { return 10 } else { return 20 }").unwrap()),
        20
    );
}

#[test]
fn test_recursive_fibonacci() {
    let source = r#"
package tmp

func main() {
	fibonacci(15)
}

func fibonacci(x int) int {
	if x == 0 || x == 1 {
		return x
	} else {
		return fibonacci(x-1) + fibonacci(x-2)
	}
}
"#;
    assert_eq!(as_int(&run_file(source).unwrap()), 610);
}

#[test]
fn test_curried_adder() {
    let source = "\
newAdder := func(a, b int) func(int) int {
	return func(c int) int {
		return a + b + c
	}
}
newAdder(1, 2)(8)";
    assert_eq!(as_int(&run(source).unwrap()), 11);
}

#[test]
fn test_range_sum() {
    let source = "\
a := []int{1, 2, 3, 4, 5}
var b int
for _, item := range a {
	b += item
}
b";
    assert_eq!(as_int(&run(source).unwrap()), 15);
}

#[test]
fn test_loop_with_continue_and_break() {
    let source = "\
a := []int{1, 2, 3, 4, 5}
var b int
for i := 0; i < len(a); i++ {
	if i < 1 {
		continue
	} else if i > 3 {
		break
	}
	b += a[i]
}
b";
    // a[1] + a[2] + a[3]
    assert_eq!(as_int(&run(source).unwrap()), 9);
}

#[test]
fn test_map_exists_flag() {
    let source = "\
m := map[string]int{\"A\": 1}
v, ok := m[\"A\"]
ok";
    assert_eq!(run(source).unwrap(), Value::Bool(true));

    let source = "\
m := map[string]int{\"A\": 1}
_, ok := m[\"Z\"]
ok";
    assert_eq!(run(source).unwrap(), Value::Bool(false));
}

#[test]
fn test_wrong_argument_count_error() {
    let err = run("func(a int) int { return a }(1, 2)").unwrap_err();
    assert_eq!(
        err,
        "runtime error: execute function wrong number of arguments: want=1, got=2"
    );
}

#[test]
fn test_full_program_with_siblings() {
    let source = r#"
package tmp

func main() {
	b := 0
	a := []int{1, 2, 3, 4, 5}
	for i := 0; i < len(a); i++ {
		if i == 0 {
			a[i] = a[i] + 15
		}
		if i < 1 {
			continue
		}
		if i > 3 {
			break
		}
		b += a[i]
	}

	mm := map[string]int{"A": 1, "B": 2}
	m, ok := mm["A"]
	b += m

	e, f := ff(3, 4)
	b += e + f

	var adder = func(x int) func(int) int {
		return func(a int) int { return a + x }
	}
	addTwo := adder(2)
	b + addTwo(5)
}

func add(a, b int) int {
	return a + b
}

func ff(a, b int) (int, int) {
	c := add(a, b)
	return c, a - b
}
"#;
    // b = 2+3+4 = 9, +1 (map), +7-1 (ff) = 16, + addTwo(5) = 23
    assert_eq!(as_int(&run_file(source).unwrap()), 23);
}

#[test]
fn test_string_concat_and_builtin_len() {
    assert_eq!(
        run(r#""gos" + "ling""#).unwrap(),
        Value::Str(std::rc::Rc::from("gosling"))
    );
    assert_eq!(as_int(&run(r#"len("gosling")"#).unwrap()), 6);
}

#[test]
fn test_append_grows_array() {
    let source = "\
a := []int{1}
a = append(a, 2)
len(a)";
    assert_eq!(as_int(&run(source).unwrap()), 2);
}

#[test]
fn test_numeric_conversion_chain() {
    assert_eq!(run("float64(int32(7))").unwrap(), Value::Float64(7.0));
    assert_eq!(run("uint8(300)").unwrap(), Value::Uint8(44));
}
