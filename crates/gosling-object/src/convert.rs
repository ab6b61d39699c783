//! Default values and numeric conversions.

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::{new_error, ArrayObj, ElemType, HashObj, HashPair, TypeTag, Value};

/// The language's zero value for a base type tag.
pub fn default_of_tag(tag: TypeTag) -> Value {
    match tag {
        TypeTag::Int => Value::Int(0),
        TypeTag::Int8 => Value::Int8(0),
        TypeTag::Int16 => Value::Int16(0),
        TypeTag::Int32 => Value::Int32(0),
        TypeTag::Int64 => Value::Int64(0),
        TypeTag::Uint => Value::Uint(0),
        TypeTag::Uint8 => Value::Uint8(0),
        TypeTag::Uint16 => Value::Uint16(0),
        TypeTag::Uint32 => Value::Uint32(0),
        TypeTag::Uint64 => Value::Uint64(0),
        TypeTag::Float32 => Value::Float32(0.0),
        TypeTag::Float64 => Value::Float64(0.0),
        TypeTag::Bool => Value::Bool(false),
        TypeTag::Str => Value::Str(Rc::from("")),
        _ => Value::Null,
    }
}

/// The zero value for a source-level type name.
pub fn default_of_name(name: &str) -> Value {
    match TypeTag::from_name(name) {
        Some(tag) => default_of_tag(tag),
        None => Value::Null,
    }
}

/// The zero value for a resolved static type. Fixed-length arrays are
/// pre-populated with element zeros.
pub fn default_of_elem(elem: &ElemType) -> Value {
    match elem {
        ElemType::Scalar(tag) => default_of_tag(*tag),
        ElemType::Array { elem, len } => {
            let elements = match len {
                Some(n) => vec![default_of_tag(*elem); *n],
                None => Vec::new(),
            };
            Value::Array(Rc::new(RefCell::new(ArrayObj {
                elements,
                elem_type: *elem,
                fixed: len.is_some(),
            })))
        }
        ElemType::Map { key, value } => Value::Hash(Rc::new(RefCell::new(HashObj {
            pairs: Default::default(),
            key_type: Some(*key),
            value_type: Some(*value),
        }))),
        ElemType::Func => Value::Null,
    }
}

/// Narrow a widened integer back to a concrete width, wrapping in the
/// target's bit width.
pub fn narrow_int(tag: TypeTag, v: i64) -> Value {
    match tag {
        TypeTag::Int => Value::Int(v),
        TypeTag::Int8 => Value::Int8(v as i8),
        TypeTag::Int16 => Value::Int16(v as i16),
        TypeTag::Int32 => Value::Int32(v as i32),
        TypeTag::Int64 => Value::Int64(v),
        TypeTag::Uint => Value::Uint(v as u64),
        TypeTag::Uint8 => Value::Uint8(v as u8),
        TypeTag::Uint16 => Value::Uint16(v as u16),
        TypeTag::Uint32 => Value::Uint32(v as u32),
        TypeTag::Uint64 => Value::Uint64(v as u64),
        other => new_error(format!("cannot narrow an integer to type '{}'", other)),
    }
}

/// Narrow a 64-bit float back to a concrete float width.
pub fn narrow_float(tag: TypeTag, v: f64) -> Value {
    match tag {
        TypeTag::Float32 => Value::Float32(v as f32),
        TypeTag::Float64 => Value::Float64(v),
        other => new_error(format!("cannot narrow a float to type '{}'", other)),
    }
}

/// Coerce a value to the shape of a template value. Numeric widths widen
/// or narrow with two's-complement wrap; arrays and hashes are deep-copied
/// under the template's element types; anything else is an error value.
pub fn convert_with(v: &Value, template: &Value) -> Value {
    let target = template.type_tag();
    if v.type_tag() == target {
        return v.clone();
    }

    match template {
        _ if target.is_integer() => {
            if let Some(w) = v.widen() {
                narrow_int(target, w)
            } else if let Some(f) = v.as_float() {
                narrow_int(target, f as i64)
            } else {
                conversion_error(v, target)
            }
        }
        _ if target.is_float() => {
            if let Some(f) = v.as_float() {
                narrow_float(target, f)
            } else if let Some(w) = v.widen() {
                narrow_float(target, w as f64)
            } else {
                conversion_error(v, target)
            }
        }
        Value::Array(template_arr) => {
            let elem_type = template_arr.borrow().elem_type;
            let elem_template = default_of_tag(elem_type);
            match v {
                Value::Array(arr) => {
                    let mut elements = Vec::with_capacity(arr.borrow().elements.len());
                    for elem in &arr.borrow().elements {
                        let converted = convert_with(elem, &elem_template);
                        if converted.is_error() {
                            return converted;
                        }
                        elements.push(converted);
                    }
                    Value::Array(Rc::new(RefCell::new(ArrayObj {
                        elements,
                        elem_type,
                        fixed: arr.borrow().fixed,
                    })))
                }
                _ => conversion_error(v, target),
            }
        }
        Value::Hash(template_hash) => {
            let (key_type, value_type) = {
                let t = template_hash.borrow();
                (t.key_type, t.value_type)
            };
            let key_template = default_of_tag(key_type.unwrap_or(TypeTag::Null));
            let value_template = default_of_tag(value_type.unwrap_or(TypeTag::Null));
            match v {
                Value::Hash(hash) => {
                    let mut out = HashObj {
                        pairs: Default::default(),
                        key_type,
                        value_type,
                    };
                    for pair in hash.borrow().pairs.values() {
                        let key = convert_with(&pair.key, &key_template);
                        if key.is_error() {
                            return key;
                        }
                        let value = convert_with(&pair.value, &value_template);
                        if value.is_error() {
                            return value;
                        }
                        let Some(hash_key) = key.hash_key() else {
                            return new_error(format!("unusable as hash key: {}", key.type_tag()));
                        };
                        out.pairs.insert(hash_key, HashPair { key, value });
                    }
                    Value::Hash(Rc::new(RefCell::new(out)))
                }
                _ => conversion_error(v, target),
            }
        }
        _ => conversion_error(v, target),
    }
}

fn conversion_error(v: &Value, target: TypeTag) -> Value {
    new_error(format!(
        "cannot convert the type '{}' to type '{}'",
        v.type_tag(),
        target
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(default_of_name("int"), Value::Int(0));
        assert_eq!(default_of_name("string"), Value::Str(Rc::from("")));
        assert_eq!(default_of_name("bool"), Value::Bool(false));
        assert_eq!(default_of_name("nosuch"), Value::Null);
    }

    #[test]
    fn test_fixed_array_default() {
        let v = default_of_elem(&ElemType::Array {
            elem: TypeTag::Int,
            len: Some(3),
        });
        let Value::Array(arr) = &v else {
            panic!("expected array");
        };
        let arr = arr.borrow();
        assert!(arr.fixed);
        assert_eq!(arr.elements, vec![Value::Int(0); 3]);
    }

    #[test]
    fn test_narrow_wraps() {
        assert_eq!(narrow_int(TypeTag::Int8, 300), Value::Int8(44));
        assert_eq!(narrow_int(TypeTag::Uint8, -1), Value::Uint8(255));
        assert_eq!(narrow_int(TypeTag::Uint16, 65536), Value::Uint16(0));
    }

    #[test]
    fn test_convert_with_widths() {
        let converted = convert_with(&Value::Int(7), &Value::Int64(0));
        assert_eq!(converted, Value::Int64(7));
        let converted = convert_with(&Value::Int(7), &Value::Float64(0.0));
        assert_eq!(converted, Value::Float64(7.0));
    }

    #[test]
    fn test_convert_error() {
        let converted = convert_with(&Value::Str(Rc::from("x")), &Value::Int(0));
        assert!(converted.is_error());
    }

    #[test]
    fn test_convert_array_deep() {
        let src = Value::Array(Rc::new(RefCell::new(ArrayObj {
            elements: vec![Value::Int(1), Value::Int(2)],
            elem_type: TypeTag::Int,
            fixed: false,
        })));
        let template = default_of_elem(&ElemType::Array {
            elem: TypeTag::Int64,
            len: None,
        });
        let converted = convert_with(&src, &template);
        let Value::Array(arr) = &converted else {
            panic!("expected array");
        };
        assert_eq!(arr.borrow().elements, vec![Value::Int64(1), Value::Int64(2)]);
    }
}
