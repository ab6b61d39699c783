//! The fixed-index builtin table.
//!
//! Order matters: the compiler emits `GetBuiltin` with these indices and
//! tests pin them. Conversions come first, then the container and I/O
//! builtins.

use crate::convert::{narrow_float, narrow_int};
use crate::value::{new_error, TypeTag, Value};

pub type BuiltinFn = fn(&[Value]) -> Option<Value>;

pub struct Builtin {
    pub name: &'static str,
    /// Number of values the builtin produces (0 for `println`).
    pub result_count: usize,
    pub func: BuiltinFn,
}

pub static BUILTINS: &[Builtin] = &[
    Builtin { name: "int", result_count: 1, func: |args| convert(args, TypeTag::Int) },
    Builtin { name: "int8", result_count: 1, func: |args| convert(args, TypeTag::Int8) },
    Builtin { name: "int16", result_count: 1, func: |args| convert(args, TypeTag::Int16) },
    Builtin { name: "int32", result_count: 1, func: |args| convert(args, TypeTag::Int32) },
    Builtin { name: "int64", result_count: 1, func: |args| convert(args, TypeTag::Int64) },
    Builtin { name: "uint", result_count: 1, func: |args| convert(args, TypeTag::Uint) },
    Builtin { name: "uint8", result_count: 1, func: |args| convert(args, TypeTag::Uint8) },
    Builtin { name: "uint16", result_count: 1, func: |args| convert(args, TypeTag::Uint16) },
    Builtin { name: "uint32", result_count: 1, func: |args| convert(args, TypeTag::Uint32) },
    Builtin { name: "uint64", result_count: 1, func: |args| convert(args, TypeTag::Uint64) },
    Builtin { name: "byte", result_count: 1, func: |args| convert(args, TypeTag::Uint8) },
    Builtin { name: "float32", result_count: 1, func: |args| convert(args, TypeTag::Float32) },
    Builtin { name: "float64", result_count: 1, func: |args| convert(args, TypeTag::Float64) },
    Builtin { name: "len", result_count: 1, func: builtin_len },
    Builtin { name: "append", result_count: 1, func: builtin_append },
    Builtin { name: "println", result_count: 0, func: builtin_println },
];

/// Look up a builtin by name, returning its fixed index.
pub fn builtin_by_name(name: &str) -> Option<(usize, &'static Builtin)> {
    BUILTINS
        .iter()
        .enumerate()
        .find(|(_, b)| b.name == name)
}

fn convert(args: &[Value], target: TypeTag) -> Option<Value> {
    if args.len() != 1 {
        return Some(new_error(format!(
            "wrong number of arguments. want=1, got={}",
            args.len()
        )));
    }
    let arg = &args[0];
    if arg.type_tag() == target {
        return Some(arg.clone());
    }
    let converted = if target.is_float() {
        // Float conversions accept both integer and float sources.
        if let Some(f) = arg.as_float() {
            narrow_float(target, f)
        } else if let Some(w) = arg.widen() {
            narrow_float(target, w as f64)
        } else {
            conversion_error(arg, target)
        }
    } else if let Some(w) = arg.widen() {
        narrow_int(target, w)
    } else {
        conversion_error(arg, target)
    };
    Some(converted)
}

fn conversion_error(arg: &Value, target: TypeTag) -> Value {
    new_error(format!(
        "cannot convert the type '{}' to type '{}'",
        arg.type_tag(),
        target
    ))
}

fn builtin_len(args: &[Value]) -> Option<Value> {
    if args.len() != 1 {
        return Some(new_error(format!(
            "wrong number of arguments. want=1, got={}",
            args.len()
        )));
    }
    let result = match &args[0] {
        Value::Str(s) => Value::Int(s.len() as i64),
        Value::Array(arr) => Value::Int(arr.borrow().elements.len() as i64),
        Value::Hash(hash) => Value::Int(hash.borrow().pairs.len() as i64),
        other => new_error(format!(
            "argument to 'len' not support, got {}",
            other.type_tag()
        )),
    };
    Some(result)
}

fn builtin_append(args: &[Value]) -> Option<Value> {
    if args.len() != 2 {
        return Some(new_error(format!(
            "wrong number of arguments. want=2, got={}",
            args.len()
        )));
    }
    match &args[0] {
        Value::Array(arr) => {
            arr.borrow_mut().elements.push(args[1].clone());
            Some(args[0].clone())
        }
        other => Some(new_error(format!(
            "argument to 'append' must be array, got {}",
            other.type_tag()
        ))),
    }
}

fn builtin_println(args: &[Value]) -> Option<Value> {
    for arg in args {
        println!("{}", arg);
    }
    None
}
