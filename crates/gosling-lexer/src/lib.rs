mod span;
mod token;
mod lexer;

pub use span::{LineIndex, Position, Span};
pub use token::TokenKind;
pub use lexer::{parse_char, parse_int, parse_float, parse_string, Lexer, Token};
