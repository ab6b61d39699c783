pub mod eval;

pub use gosling_bytecode as bytecode;
pub use gosling_compiler as compiler;
pub use gosling_lexer as lexer;
pub use gosling_object as object;
pub use gosling_parser as parser;
pub use gosling_vm as vm;
