//! Program assembly: input wrapping, declaration splitting, and the
//! lowering of syntactic types into the value model's static types.

use gosling_lexer::LineIndex;
use gosling_object::{
    default_of_elem, ElemType, FuncParam, FuncResult, FuncSig, TypeTag, Value,
};
use gosling_parser::{
    parse_file, BasicLit, Decl, Expr, Field, FuncLit, FuncType, LitKind, ParseError, Stmt,
    TypeExpr,
};

/// The template the host wraps raw statement input into.
const STMT_TEMPLATE_HEAD: &str = "package tmp\nfunc main() {\n";
const STMT_TEMPLATE_TAIL: &str = "\n}";

/// Lines the template adds before the user's content; subtracted from
/// reported positions for statement input.
pub const STMT_WRAPPER_LINES: u32 = 2;

/// A unit of source input, either a full file or a raw statement block.
#[derive(Debug, Clone)]
pub struct Input {
    pub name: String,
    pub content: String,
    pub is_stmt: bool,
}

impl Input {
    pub fn file(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            is_stmt: false,
        }
    }

    pub fn statements(content: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            content: content.into(),
            is_stmt: true,
        }
    }

    /// The source text actually parsed: statement input is wrapped into a
    /// `main` function first.
    pub fn source(&self) -> String {
        if self.is_stmt {
            format!("{}{}{}", STMT_TEMPLATE_HEAD, self.content, STMT_TEMPLATE_TAIL)
        } else {
            self.content.clone()
        }
    }
}

/// A named top-level function awaiting compilation.
#[derive(Debug, Clone)]
pub struct NamedFunction {
    pub name: String,
    pub lit: FuncLit,
}

/// The compiler's view of a parsed program: the statements of `main` and
/// the sibling top-level functions in declaration order.
#[derive(Debug, Clone)]
pub struct Program {
    pub functions: Vec<NamedFunction>,
    pub statements: Vec<Stmt>,
    pub global_decls: usize,
    pub line_index: LineIndex,
    /// Lines to subtract from reported positions (wrapped input).
    pub line_offset: u32,
}

impl Program {
    /// Parse an input into a program. Parse errors for statement input
    /// have their line numbers adjusted past the wrapper.
    pub fn parse(input: &Input) -> Result<Program, ParseError> {
        let source = input.source();
        let file = parse_file(&source)?;
        let line_index = LineIndex::new(&source);

        let mut functions = Vec::new();
        let mut statements = Vec::new();
        let mut global_decls = 0;

        for decl in file.decls {
            match decl {
                Decl::Func(func) => {
                    if func.name.name == "main" {
                        statements = func.body.stmts;
                    } else {
                        functions.push(NamedFunction {
                            name: func.name.name.clone(),
                            lit: FuncLit {
                                ty: func.ty,
                                body: func.body,
                                span: func.span,
                            },
                        });
                        global_decls += 1;
                    }
                }
                Decl::Var(_) => {}
            }
        }

        Ok(Program {
            functions,
            statements,
            global_decls,
            line_index,
            line_offset: if input.is_stmt { STMT_WRAPPER_LINES } else { 0 },
        })
    }
}

/// The base tag a type expression reduces to when used as an element type.
pub fn tag_of_type_expr(ty: &TypeExpr) -> TypeTag {
    match ty {
        TypeExpr::Named(ident) => TypeTag::from_name(&ident.name).unwrap_or(TypeTag::Null),
        TypeExpr::Array { .. } => TypeTag::Array,
        TypeExpr::Map { .. } => TypeTag::Hash,
        TypeExpr::Func(_) => TypeTag::Function,
    }
}

/// Lower a syntactic type to the value model's static type.
pub fn lower_type_expr(ty: &TypeExpr) -> ElemType {
    match ty {
        TypeExpr::Named(ident) => {
            ElemType::Scalar(TypeTag::from_name(&ident.name).unwrap_or(TypeTag::Null))
        }
        TypeExpr::Array { len, elem, .. } => ElemType::Array {
            elem: tag_of_type_expr(elem),
            len: len.as_deref().and_then(const_len),
        },
        TypeExpr::Map { key, value, .. } => ElemType::Map {
            key: tag_of_type_expr(key),
            value: tag_of_type_expr(value),
        },
        TypeExpr::Func(_) => ElemType::Func,
    }
}

/// The zero value for a syntactic type; array and map defaults carry their
/// element tags so composite contexts can type their elements.
pub fn default_of_type_expr(ty: &TypeExpr) -> Value {
    default_of_elem(&lower_type_expr(ty))
}

fn const_len(expr: &Expr) -> Option<usize> {
    match expr {
        Expr::BasicLit(BasicLit {
            kind: LitKind::Int,
            value,
            ..
        }) => value.parse().ok(),
        _ => None,
    }
}

/// Lower a function type into a signature. Unnamed parameters get
/// synthetic names so their stack slots are still accounted for.
pub fn lower_func_sig(ty: &FuncType) -> FuncSig {
    let mut params = Vec::new();
    for (group, field) in ty.params.iter().enumerate() {
        if field.names.is_empty() {
            params.push(FuncParam {
                name: format!("_arg{}", group),
                elem: lower_type_expr(&field.ty),
            });
        } else {
            for name in &field.names {
                params.push(FuncParam {
                    name: name.name.clone(),
                    elem: lower_type_expr(&field.ty),
                });
            }
        }
    }

    let mut results = Vec::new();
    for field in &ty.results {
        results.extend(lower_result_field(field));
    }

    FuncSig { params, results }
}

fn lower_result_field(field: &Field) -> Vec<FuncResult> {
    if let TypeExpr::Func(func_ty) = &field.ty {
        let sig = lower_func_sig(func_ty);
        let name = field.names.first().map(|n| n.name.clone());
        return vec![FuncResult {
            name,
            elem: ElemType::Func,
            func: Some(Box::new(sig)),
        }];
    }

    let elem = lower_type_expr(&field.ty);
    if field.names.is_empty() {
        vec![FuncResult {
            name: None,
            elem,
            func: None,
        }]
    } else {
        field
            .names
            .iter()
            .map(|name| FuncResult {
                name: Some(name.name.clone()),
                elem: elem.clone(),
                func: None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_wrapping() {
        let input = Input::statements("1 + 2");
        let prog = Program::parse(&input).unwrap();
        assert_eq!(prog.statements.len(), 1);
        assert!(prog.functions.is_empty());
        assert_eq!(prog.line_offset, STMT_WRAPPER_LINES);
    }

    #[test]
    fn test_full_file_split() {
        let src = "package tmp\nfunc main() { add(1, 2) }\nfunc add(a, b int) int { return a + b }";
        let prog = Program::parse(&Input::file("t.go", src)).unwrap();
        assert_eq!(prog.statements.len(), 1);
        assert_eq!(prog.functions.len(), 1);
        assert_eq!(prog.functions[0].name, "add");
        assert_eq!(prog.global_decls, 1);
        assert_eq!(prog.line_offset, 0);
    }

    #[test]
    fn test_lower_array_type() {
        let prog = Program::parse(&Input::statements("var a [3]int")).unwrap();
        let Stmt::Decl(decl) = &prog.statements[0] else {
            panic!("expected decl");
        };
        let ty = decl.specs[0].ty.as_ref().unwrap();
        assert_eq!(
            lower_type_expr(ty),
            ElemType::Array {
                elem: TypeTag::Int,
                len: Some(3)
            }
        );
    }

    #[test]
    fn test_lower_func_sig() {
        let src = "package tmp\nfunc f(a, b int) (c int, d string) { return }\nfunc main() {}";
        let prog = Program::parse(&Input::file("t.go", src)).unwrap();
        let sig = lower_func_sig(&prog.functions[0].lit.ty);
        assert_eq!(sig.params.len(), 2);
        assert_eq!(sig.params[1].name, "b");
        assert_eq!(sig.results.len(), 2);
        assert_eq!(sig.results[0].name.as_deref(), Some("c"));
        assert_eq!(sig.results[1].elem, ElemType::Scalar(TypeTag::Str));
    }

    #[test]
    fn test_lower_func_returning_func() {
        let src = "package tmp\nfunc f(a int) func(int) int { return g }\nfunc main() {}";
        let prog = Program::parse(&Input::file("t.go", src)).unwrap();
        let sig = lower_func_sig(&prog.functions[0].lit.ty);
        assert_eq!(sig.results.len(), 1);
        let nested = sig.results[0].func.as_ref().unwrap();
        assert_eq!(nested.params.len(), 1);
        assert_eq!(nested.results.len(), 1);
    }
}
