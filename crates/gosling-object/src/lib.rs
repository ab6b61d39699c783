mod builtins;
mod convert;
mod value;

pub use builtins::{builtin_by_name, Builtin, BuiltinFn, BUILTINS};
pub use convert::{convert_with, default_of_elem, default_of_name, default_of_tag, narrow_float, narrow_int};
pub use value::{
    bool_value, new_error, ArrayObj, Callable, Closure, CompiledFunction, ElemType, FreeList,
    FreeRef, FuncParam, FuncResult, FuncSig, HashKey, HashObj, HashPair, RangeLoopTemplate,
    ForLoopTemplate, TypeTag, Value,
};
