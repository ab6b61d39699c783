use gosling_lexer::{Lexer, Span, Token, TokenKind};
use thiserror::Error;

use crate::ast::*;

/// A parse error with the offending source span.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl ParseError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

type PResult<T> = Result<T, ParseError>;

/// Parse a full source file.
pub fn parse_file(source: &str) -> PResult<File> {
    Parser::new(source).parse_file()
}

/// Recursive-descent parser over a pre-lexed token stream.
///
/// The raw newline tokens are folded into semicolons first, following Go's
/// automatic-semicolon rule, so statement termination is uniform.
pub struct Parser<'src> {
    source: &'src str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'src> Parser<'src> {
    pub fn new(source: &'src str) -> Self {
        let raw = Lexer::new(source).collect_all();
        let mut tokens = Vec::with_capacity(raw.len());
        for token in raw {
            if token.kind == TokenKind::Newline {
                let terminates = tokens
                    .last()
                    .map_or(false, |prev: &Token| prev.kind.ends_statement());
                if terminates {
                    tokens.push(Token::new(TokenKind::Semicolon, token.span));
                }
            } else {
                tokens.push(token);
            }
        }
        Self {
            source,
            tokens,
            pos: 0,
        }
    }

    fn peek(&self) -> Token {
        self.nth(0)
    }

    fn nth(&self, n: usize) -> Token {
        self.tokens
            .get(self.pos + n)
            .copied()
            .unwrap_or_else(|| Token::new(TokenKind::Eof, Span::new(self.source.len(), self.source.len())))
    }

    fn bump(&mut self) -> Token {
        let token = self.peek();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<Token> {
        let token = self.peek();
        if token.kind == kind {
            Ok(self.bump())
        } else {
            Err(ParseError::new(
                format!("expected {}, found {}", kind, token.kind),
                token.span,
            ))
        }
    }

    fn slice(&self, span: Span) -> &'src str {
        &self.source[span.start as usize..span.end as usize]
    }

    fn skip_semis(&mut self) {
        while self.at(TokenKind::Semicolon) {
            self.bump();
        }
    }

    // ---
    // File and declarations
    // ---

    pub fn parse_file(&mut self) -> PResult<File> {
        self.skip_semis();
        self.expect(TokenKind::Package)?;
        let name = self.parse_ident()?;
        self.skip_semis();

        let mut decls = Vec::new();
        while !self.at(TokenKind::Eof) {
            match self.peek().kind {
                TokenKind::Func => decls.push(Decl::Func(self.parse_func_decl()?)),
                TokenKind::Var | TokenKind::Const => decls.push(Decl::Var(self.parse_gen_decl()?)),
                other => {
                    return Err(ParseError::new(
                        format!("expected declaration, found {}", other),
                        self.peek().span,
                    ))
                }
            }
            self.skip_semis();
        }

        Ok(File {
            package: name.name,
            decls,
        })
    }

    fn parse_func_decl(&mut self) -> PResult<FuncDecl> {
        let start = self.expect(TokenKind::Func)?.span;
        let name = self.parse_ident()?;
        let ty = self.parse_func_type(start)?;
        let body = self.parse_block()?;
        let span = start.merge(body.span);
        Ok(FuncDecl {
            name,
            ty,
            body,
            span,
        })
    }

    fn parse_gen_decl(&mut self) -> PResult<GenDecl> {
        let token = self.bump();
        let kind = match token.kind {
            TokenKind::Var => DeclKind::Var,
            _ => DeclKind::Const,
        };

        let mut specs = Vec::new();
        if self.eat(TokenKind::LParen) {
            self.skip_semis();
            while !self.at(TokenKind::RParen) {
                specs.push(self.parse_value_spec()?);
                self.skip_semis();
            }
            self.expect(TokenKind::RParen)?;
        } else {
            specs.push(self.parse_value_spec()?);
        }

        let span = specs
            .last()
            .map(|s| token.span.merge(s.span))
            .unwrap_or(token.span);
        Ok(GenDecl { kind, specs, span })
    }

    fn parse_value_spec(&mut self) -> PResult<ValueSpec> {
        let mut names = vec![self.parse_ident()?];
        while self.eat(TokenKind::Comma) {
            names.push(self.parse_ident()?);
        }

        let ty = if self.type_start() {
            Some(self.parse_type()?)
        } else {
            None
        };

        let mut values = Vec::new();
        if self.eat(TokenKind::Assign) {
            values = self.parse_expr_list()?;
        }

        let start = names[0].span;
        let end = values
            .last()
            .map(|e| e.span())
            .or_else(|| ty.as_ref().map(|t| t.span()))
            .unwrap_or(names.last().unwrap().span);
        Ok(ValueSpec {
            names,
            ty,
            values,
            span: start.merge(end),
        })
    }

    fn parse_ident(&mut self) -> PResult<Ident> {
        let token = self.expect(TokenKind::Ident)?;
        Ok(Ident {
            name: self.slice(token.span).to_string(),
            span: token.span,
        })
    }

    // ---
    // Types
    // ---

    fn type_start(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Ident | TokenKind::LBracket | TokenKind::Map | TokenKind::Func
        )
    }

    fn parse_type(&mut self) -> PResult<TypeExpr> {
        match self.peek().kind {
            TokenKind::Ident => Ok(TypeExpr::Named(self.parse_ident()?)),
            TokenKind::LBracket => {
                let start = self.bump().span;
                let len = if self.at(TokenKind::RBracket) {
                    None
                } else {
                    Some(Box::new(self.parse_expr()?))
                };
                self.expect(TokenKind::RBracket)?;
                let elem = self.parse_type()?;
                let span = start.merge(elem.span());
                Ok(TypeExpr::Array {
                    len,
                    elem: Box::new(elem),
                    span,
                })
            }
            TokenKind::Map => {
                let start = self.bump().span;
                self.expect(TokenKind::LBracket)?;
                let key = self.parse_type()?;
                self.expect(TokenKind::RBracket)?;
                let value = self.parse_type()?;
                let span = start.merge(value.span());
                Ok(TypeExpr::Map {
                    key: Box::new(key),
                    value: Box::new(value),
                    span,
                })
            }
            TokenKind::Func => {
                let start = self.bump().span;
                Ok(TypeExpr::Func(self.parse_func_type(start)?))
            }
            other => Err(ParseError::new(
                format!("expected type, found {}", other),
                self.peek().span,
            )),
        }
    }

    /// Parse the `(params) results` part of a function type; the `func`
    /// keyword (and name, for declarations) is already consumed.
    fn parse_func_type(&mut self, start: Span) -> PResult<FuncType> {
        self.expect(TokenKind::LParen)?;
        let params = self.parse_field_list()?;
        let close = self.expect(TokenKind::RParen)?;

        let mut results = Vec::new();
        let mut end = close.span;
        if self.eat(TokenKind::LParen) {
            results = self.parse_field_list()?;
            end = self.expect(TokenKind::RParen)?.span;
        } else if self.type_start() {
            let ty = self.parse_type()?;
            end = ty.span();
            results.push(Field {
                names: Vec::new(),
                span: ty.span(),
                ty,
            });
        }

        Ok(FuncType {
            params,
            results,
            span: start.merge(end),
        })
    }

    /// Parse a parenthesized field list: `a, b int, c string`, `int, int`,
    /// or named results. The caller consumes the parentheses.
    ///
    /// Entries are first read as either `name type` pairs or bare types;
    /// when any entry is named, preceding bare identifiers are names that
    /// share the next entry's type (Go's grouped form).
    fn parse_field_list(&mut self) -> PResult<Vec<Field>> {
        enum Entry {
            Named(Ident, TypeExpr),
            Bare(TypeExpr),
        }

        let mut entries = Vec::new();
        self.skip_semis();
        while !self.at(TokenKind::RParen) {
            if self.at(TokenKind::Ident)
                && matches!(
                    self.nth(1).kind,
                    TokenKind::Ident | TokenKind::LBracket | TokenKind::Map | TokenKind::Func
                )
            {
                let name = self.parse_ident()?;
                let ty = self.parse_type()?;
                entries.push(Entry::Named(name, ty));
            } else {
                entries.push(Entry::Bare(self.parse_type()?));
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
            self.skip_semis();
        }

        let any_named = entries.iter().any(|e| matches!(e, Entry::Named(..)));
        let mut fields = Vec::new();
        let mut pending: Vec<Ident> = Vec::new();
        for entry in entries {
            match entry {
                Entry::Named(name, ty) => {
                    let mut names = std::mem::take(&mut pending);
                    names.push(name);
                    let span = names[0].span.merge(ty.span());
                    fields.push(Field { names, ty, span });
                }
                Entry::Bare(ty) => {
                    if any_named {
                        // A bare identifier in a named list is a grouped name.
                        match ty {
                            TypeExpr::Named(ident) => pending.push(ident),
                            other => {
                                return Err(ParseError::new(
                                    "cannot mix named and unnamed parameters",
                                    other.span(),
                                ))
                            }
                        }
                    } else {
                        let span = ty.span();
                        fields.push(Field {
                            names: Vec::new(),
                            ty,
                            span,
                        });
                    }
                }
            }
        }
        if let Some(stray) = pending.first() {
            return Err(ParseError::new("missing parameter type", stray.span));
        }
        Ok(fields)
    }

    // ---
    // Statements
    // ---

    fn parse_block(&mut self) -> PResult<Block> {
        let open = self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        self.skip_semis();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            stmts.push(self.parse_stmt()?);
            self.expect_stmt_end()?;
        }
        let close = self.expect(TokenKind::RBrace)?;
        Ok(Block {
            stmts,
            span: open.span.merge(close.span),
        })
    }

    fn expect_stmt_end(&mut self) -> PResult<()> {
        if self.at(TokenKind::Semicolon) {
            self.skip_semis();
            Ok(())
        } else if self.at(TokenKind::RBrace) || self.at(TokenKind::Eof) {
            Ok(())
        } else {
            Err(ParseError::new(
                format!("expected newline or semicolon, found {}", self.peek().kind),
                self.peek().span,
            ))
        }
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        match self.peek().kind {
            TokenKind::Var | TokenKind::Const => Ok(Stmt::Decl(self.parse_gen_decl()?)),
            TokenKind::Return => {
                let token = self.bump();
                let mut results = Vec::new();
                if !self.at(TokenKind::Semicolon)
                    && !self.at(TokenKind::RBrace)
                    && !self.at(TokenKind::Eof)
                {
                    results = self.parse_expr_list()?;
                }
                let span = results
                    .last()
                    .map(|e| token.span.merge(e.span()))
                    .unwrap_or(token.span);
                Ok(Stmt::Return(ReturnStmt { results, span }))
            }
            TokenKind::Break => {
                let token = self.bump();
                Ok(Stmt::Branch(BranchStmt {
                    kind: BranchKind::Break,
                    span: token.span,
                }))
            }
            TokenKind::Continue => {
                let token = self.bump();
                Ok(Stmt::Branch(BranchStmt {
                    kind: BranchKind::Continue,
                    span: token.span,
                }))
            }
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::LBrace => Ok(Stmt::Block(self.parse_block()?)),
            _ => self.parse_simple_stmt(),
        }
    }

    /// An expression statement, assignment, or inc/dec statement.
    fn parse_simple_stmt(&mut self) -> PResult<Stmt> {
        let lhs = self.parse_expr_list()?;

        let token = self.peek();
        if token.kind.is_assign_op() {
            self.bump();
            let op = assign_op(token.kind);
            let rhs = self.parse_expr_list()?;
            let span = lhs[0].span().merge(rhs.last().unwrap().span());
            return Ok(Stmt::Assign(AssignStmt { lhs, op, rhs, span }));
        }
        if token.kind == TokenKind::Inc || token.kind == TokenKind::Dec {
            self.bump();
            if lhs.len() != 1 {
                return Err(ParseError::new("expected one operand", token.span));
            }
            let x = lhs.into_iter().next().unwrap();
            let span = x.span().merge(token.span);
            return Ok(Stmt::IncDec(IncDecStmt {
                x,
                inc: token.kind == TokenKind::Inc,
                span,
            }));
        }

        if lhs.len() != 1 {
            return Err(ParseError::new(
                "expected assignment after expression list",
                token.span,
            ));
        }
        Ok(Stmt::Expr(lhs.into_iter().next().unwrap()))
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let start = self.expect(TokenKind::If)?.span;

        let mut init = None;
        let mut cond_stmt = self.parse_simple_stmt()?;
        if self.eat(TokenKind::Semicolon) {
            init = Some(Box::new(cond_stmt));
            cond_stmt = self.parse_simple_stmt()?;
        }
        let cond = match cond_stmt {
            Stmt::Expr(e) => e,
            other => {
                return Err(ParseError::new(
                    "expected condition expression",
                    other.span(),
                ))
            }
        };

        let body = self.parse_block()?;
        let mut span = start.merge(body.span);

        let else_branch = if self.eat(TokenKind::Else) {
            let branch = if self.at(TokenKind::If) {
                self.parse_if()?
            } else {
                Stmt::Block(self.parse_block()?)
            };
            span = span.merge(branch.span());
            Some(Box::new(branch))
        } else {
            None
        };

        Ok(Stmt::If(IfStmt {
            init,
            cond,
            body,
            else_branch,
            span,
        }))
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        let start = self.expect(TokenKind::For)?.span;

        // `for { … }`
        if self.at(TokenKind::LBrace) {
            let body = self.parse_block()?;
            let span = start.merge(body.span);
            return Ok(Stmt::For(ForStmt {
                init: None,
                cond: None,
                post: None,
                body,
                span,
            }));
        }

        // `for range x { … }`
        if self.eat(TokenKind::Range) {
            let x = self.parse_expr()?;
            let body = self.parse_block()?;
            let span = start.merge(body.span);
            return Ok(Stmt::Range(RangeStmt {
                key: None,
                value: None,
                x,
                body,
                span,
            }));
        }

        // `for ; cond; post { … }`
        if self.eat(TokenKind::Semicolon) {
            return self.parse_for_clause(start, None);
        }

        let lhs = self.parse_expr_list()?;
        let token = self.peek();

        // `for k, v := range x { … }` (also with `=`)
        if (token.kind == TokenKind::Define || token.kind == TokenKind::Assign)
            && self.nth(1).kind == TokenKind::Range
        {
            self.bump();
            self.bump();
            let x = self.parse_expr()?;
            let (key, value) = self.range_vars(lhs)?;
            let body = self.parse_block()?;
            let span = start.merge(body.span);
            return Ok(Stmt::Range(RangeStmt {
                key,
                value,
                x,
                body,
                span,
            }));
        }

        // An init statement followed by `; cond; post`, or a bare condition.
        let stmt = self.finish_simple_stmt(lhs)?;
        if self.eat(TokenKind::Semicolon) {
            return self.parse_for_clause(start, Some(Box::new(stmt)));
        }
        match stmt {
            Stmt::Expr(cond) => {
                let body = self.parse_block()?;
                let span = start.merge(body.span);
                Ok(Stmt::For(ForStmt {
                    init: None,
                    cond: Some(cond),
                    post: None,
                    body,
                    span,
                }))
            }
            other => Err(ParseError::new(
                "expected for-loop condition",
                other.span(),
            )),
        }
    }

    fn parse_for_clause(&mut self, start: Span, init: Option<Box<Stmt>>) -> PResult<Stmt> {
        let cond = if self.at(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(TokenKind::Semicolon)?;
        let post = if self.at(TokenKind::LBrace) {
            None
        } else {
            Some(Box::new(self.parse_simple_stmt()?))
        };
        let body = self.parse_block()?;
        let span = start.merge(body.span);
        Ok(Stmt::For(ForStmt {
            init,
            cond,
            post,
            body,
            span,
        }))
    }

    /// Resume `parse_simple_stmt` after the expression list has been read.
    fn finish_simple_stmt(&mut self, lhs: Vec<Expr>) -> PResult<Stmt> {
        let token = self.peek();
        if token.kind.is_assign_op() {
            self.bump();
            let op = assign_op(token.kind);
            let rhs = self.parse_expr_list()?;
            let span = lhs[0].span().merge(rhs.last().unwrap().span());
            return Ok(Stmt::Assign(AssignStmt { lhs, op, rhs, span }));
        }
        if token.kind == TokenKind::Inc || token.kind == TokenKind::Dec {
            self.bump();
            let x = lhs.into_iter().next().unwrap();
            let span = x.span().merge(token.span);
            return Ok(Stmt::IncDec(IncDecStmt {
                x,
                inc: token.kind == TokenKind::Inc,
                span,
            }));
        }
        if lhs.len() != 1 {
            return Err(ParseError::new(
                "expected assignment after expression list",
                token.span,
            ));
        }
        Ok(Stmt::Expr(lhs.into_iter().next().unwrap()))
    }

    fn range_vars(&self, lhs: Vec<Expr>) -> PResult<(Option<Ident>, Option<Ident>)> {
        let mut idents = Vec::new();
        for expr in lhs {
            match expr {
                Expr::Ident(i) => idents.push(i),
                other => {
                    return Err(ParseError::new(
                        "range variables must be identifiers",
                        other.span(),
                    ))
                }
            }
        }
        let mut iter = idents.into_iter();
        Ok((iter.next(), iter.next()))
    }

    // ---
    // Expressions
    // ---

    fn parse_expr_list(&mut self) -> PResult<Vec<Expr>> {
        let mut list = vec![self.parse_expr()?];
        while self.eat(TokenKind::Comma) {
            list.push(self.parse_expr()?);
        }
        Ok(list)
    }

    pub fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_binary(1)
    }

    fn parse_binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut x = self.parse_unary()?;
        loop {
            let token = self.peek();
            let Some((op, prec)) = binary_op(token.kind) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.bump();
            let y = self.parse_binary(prec + 1)?;
            let span = x.span().merge(y.span());
            x = Expr::Binary(BinaryExpr {
                x: Box::new(x),
                op,
                y: Box::new(y),
                span,
            });
        }
        Ok(x)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let token = self.peek();
        let op = match token.kind {
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Plus => Some(UnaryOp::Pos),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let x = self.parse_unary()?;
            let span = token.span.merge(x.span());
            return Ok(Expr::Unary(UnaryExpr {
                op,
                x: Box::new(x),
                span,
            }));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut x = self.parse_primary()?;
        loop {
            match self.peek().kind {
                TokenKind::LParen => {
                    self.bump();
                    let mut args = Vec::new();
                    self.skip_semis();
                    while !self.at(TokenKind::RParen) {
                        args.push(self.parse_expr()?);
                        if !self.eat(TokenKind::Comma) {
                            break;
                        }
                        self.skip_semis();
                    }
                    self.skip_semis();
                    let close = self.expect(TokenKind::RParen)?;
                    let span = x.span().merge(close.span);
                    x = Expr::Call(CallExpr {
                        fun: Box::new(x),
                        args,
                        span,
                    });
                }
                TokenKind::LBracket => {
                    self.bump();
                    let index = self.parse_expr()?;
                    let close = self.expect(TokenKind::RBracket)?;
                    let span = x.span().merge(close.span);
                    x = Expr::Index(IndexExpr {
                        x: Box::new(x),
                        index: Box::new(index),
                        span,
                    });
                }
                _ => break,
            }
        }
        Ok(x)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let token = self.peek();
        match token.kind {
            TokenKind::IntLit => Ok(self.parse_basic_lit(LitKind::Int)),
            TokenKind::FloatLit => Ok(self.parse_basic_lit(LitKind::Float)),
            TokenKind::StringLit => Ok(self.parse_basic_lit(LitKind::String)),
            TokenKind::CharLit => Ok(self.parse_basic_lit(LitKind::Char)),
            TokenKind::Ident => Ok(Expr::Ident(self.parse_ident()?)),
            TokenKind::LParen => {
                let open = self.bump();
                let x = self.parse_expr()?;
                let close = self.expect(TokenKind::RParen)?;
                Ok(Expr::Paren(ParenExpr {
                    x: Box::new(x),
                    span: open.span.merge(close.span),
                }))
            }
            TokenKind::Func => {
                let start = self.bump().span;
                let ty = self.parse_func_type(start)?;
                let body = self.parse_block()?;
                let span = start.merge(body.span);
                Ok(Expr::FuncLit(FuncLit { ty, body, span }))
            }
            TokenKind::LBracket | TokenKind::Map => {
                let ty = self.parse_type()?;
                self.parse_composite_body(Some(ty))
            }
            other => Err(ParseError::new(
                format!("expected expression, found {}", other),
                token.span,
            )),
        }
    }

    fn parse_basic_lit(&mut self, kind: LitKind) -> Expr {
        let token = self.bump();
        Expr::BasicLit(BasicLit {
            kind,
            value: self.slice(token.span).to_string(),
            span: token.span,
        })
    }

    fn parse_composite_body(&mut self, ty: Option<TypeExpr>) -> PResult<Expr> {
        let open = self.expect(TokenKind::LBrace)?;
        let mut elts = Vec::new();
        self.skip_semis();
        while !self.at(TokenKind::RBrace) {
            let first = self.parse_composite_elt_expr()?;
            if self.eat(TokenKind::Colon) {
                let value = self.parse_composite_elt_expr()?;
                elts.push(CompositeElt::KeyValue { key: first, value });
            } else {
                elts.push(CompositeElt::Value(first));
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
            self.skip_semis();
        }
        self.skip_semis();
        let close = self.expect(TokenKind::RBrace)?;
        let span = ty
            .as_ref()
            .map(|t| t.span())
            .unwrap_or(open.span)
            .merge(close.span);
        Ok(Expr::Composite(CompositeLit { ty, elts, span }))
    }

    /// A composite element: an expression, or a nested untyped composite.
    fn parse_composite_elt_expr(&mut self) -> PResult<Expr> {
        if self.at(TokenKind::LBrace) {
            return self.parse_composite_body(None);
        }
        self.parse_expr()
    }
}

fn assign_op(kind: TokenKind) -> AssignOp {
    match kind {
        TokenKind::Assign => AssignOp::Assign,
        TokenKind::Define => AssignOp::Define,
        TokenKind::PlusEq => AssignOp::AddAssign,
        TokenKind::MinusEq => AssignOp::SubAssign,
        TokenKind::StarEq => AssignOp::MulAssign,
        TokenKind::SlashEq => AssignOp::QuoAssign,
        TokenKind::PercentEq => AssignOp::RemAssign,
        TokenKind::AmpEq => AssignOp::AndAssign,
        TokenKind::PipeEq => AssignOp::OrAssign,
        TokenKind::CaretEq => AssignOp::XorAssign,
        TokenKind::ShlEq => AssignOp::ShlAssign,
        TokenKind::ShrEq => AssignOp::ShrAssign,
        TokenKind::AmpCaretEq => AssignOp::AndNotAssign,
        _ => unreachable!("not an assignment operator"),
    }
}

fn binary_op(kind: TokenKind) -> Option<(BinaryOp, u8)> {
    let pair = match kind {
        TokenKind::PipePipe => (BinaryOp::LOr, 1),
        TokenKind::AmpAmp => (BinaryOp::LAnd, 2),
        TokenKind::EqEq => (BinaryOp::Eql, 3),
        TokenKind::BangEq => (BinaryOp::Neq, 3),
        TokenKind::Lt => (BinaryOp::Lss, 3),
        TokenKind::LtEq => (BinaryOp::Leq, 3),
        TokenKind::Gt => (BinaryOp::Gtr, 3),
        TokenKind::GtEq => (BinaryOp::Geq, 3),
        TokenKind::Plus => (BinaryOp::Add, 4),
        TokenKind::Minus => (BinaryOp::Sub, 4),
        TokenKind::Pipe => (BinaryOp::Or, 4),
        TokenKind::Caret => (BinaryOp::Xor, 4),
        TokenKind::Star => (BinaryOp::Mul, 5),
        TokenKind::Slash => (BinaryOp::Quo, 5),
        TokenKind::Percent => (BinaryOp::Rem, 5),
        TokenKind::Shl => (BinaryOp::Shl, 5),
        TokenKind::Shr => (BinaryOp::Shr, 5),
        TokenKind::Amp => (BinaryOp::And, 5),
        TokenKind::AmpCaret => (BinaryOp::AndNot, 5),
        _ => return None,
    };
    Some(pair)
}
