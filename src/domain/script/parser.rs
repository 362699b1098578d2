//! Recursive descent parser for strategy programs.
//!
//! Errors carry the line and column of the offending token plus what was
//! expected and what was found. Nesting (brackets, blocks, operator chains)
//! is capped so that hostile input cannot exhaust the host stack.

use std::rc::Rc;

use super::ast::{
    BinOp, BoolOp, CmpOp, CompClause, ExceptHandler, Expr, ExprKind, FStringPart, FunctionDef,
    ImportName, Param, Program, Stmt, StmtKind, Target, UnaryOp,
};
use super::lexer::{tokenize, tokenize_fragment, Tok, Token};
use crate::domain::error::ParseError;

/// Maximum syntactic nesting accepted by the parser.
pub const MAX_NESTING_DEPTH: usize = 100;

/// Parse a complete strategy program.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens, 0);
    parser.parse_program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    /// Enclosing loops in the current function body.
    loops: usize,
    in_function: bool,
}

impl Parser {
    fn new(mut tokens: Vec<Token>, depth: usize) -> Self {
        if tokens.last().map(|t| &t.tok) != Some(&Tok::Eof) {
            let (line, column) = tokens.last().map_or((1, 1), |t| (t.line, t.column));
            tokens.push(Token {
                tok: Tok::Eof,
                line,
                column,
            });
        }
        Parser {
            tokens,
            pos: 0,
            depth,
            loops: 0,
            in_function: false,
        }
    }

    fn current(&self) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[self.pos.min(last)]
    }

    fn peek(&self) -> &Tok {
        &self.current().tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + offset).min(last)].tok
    }

    fn line(&self) -> usize {
        self.current().line
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if token.tok != Tok::Eof {
            self.pos += 1;
        }
        token
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn at_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Keyword(k) if *k == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        let token = self.current();
        ParseError::new(message, token.line, token.column)
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        self.error_here(format!("expected {expected}, found {}", self.peek().describe()))
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ParseError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{op}'")))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<(), ParseError> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{kw}'")))
        }
    }

    fn expect_name(&mut self) -> Result<String, ParseError> {
        match self.peek().clone() {
            Tok::Name(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    fn expect_newline(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(())
            }
            Tok::Eof => Ok(()),
            _ => Err(self.unexpected("end of line")),
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(self.error_here(format!(
                "code is nested too deeply (limit {MAX_NESTING_DEPTH})"
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn leave_chain(&mut self, links: usize) {
        self.depth = self.depth.saturating_sub(links);
    }

    fn starts_expression(&self) -> bool {
        match self.peek() {
            Tok::Name(_) | Tok::Int(_) | Tok::Float(_) | Tok::Str { .. } => true,
            Tok::Keyword(k) => matches!(*k, "None" | "True" | "False" | "not" | "lambda"),
            Tok::Op(o) => matches!(*o, "(" | "[" | "{" | "-" | "+" | "~"),
            _ => false,
        }
    }

    // ---- statements ----

    fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(Program { body })
    }

    fn parse_statement(&mut self) -> Result<Vec<Stmt>, ParseError> {
        match self.peek() {
            Tok::Keyword("if") => Ok(vec![self.parse_if()?]),
            Tok::Keyword("while") => Ok(vec![self.parse_while()?]),
            Tok::Keyword("for") => Ok(vec![self.parse_for()?]),
            Tok::Keyword("def") => Ok(vec![self.parse_def()?]),
            Tok::Keyword("try") => Ok(vec![self.parse_try()?]),
            Tok::Keyword("class") => Err(self.error_here("class definitions are not supported")),
            Tok::Keyword(kw @ ("with" | "async" | "await" | "yield")) => {
                Err(self.error_here(format!("'{kw}' is not supported")))
            }
            Tok::Op("@") => Err(self.error_here("decorators are not supported")),
            Tok::Indent => Err(self.error_here("unexpected indent")),
            _ => self.parse_simple_statements(),
        }
    }

    fn parse_simple_statements(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = vec![self.parse_small_statement()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            stmts.push(self.parse_small_statement()?);
        }
        self.expect_newline()?;
        Ok(stmts)
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect_op(":")?;
        if !matches!(self.peek(), Tok::Newline) {
            return self.parse_simple_statements();
        }
        self.advance();
        if !matches!(self.peek(), Tok::Indent) {
            return Err(self.error_here("expected an indented block"));
        }
        self.advance();
        self.enter()?;

        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.advance();
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
        self.leave();
        Ok(body)
    }

    fn parse_small_statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        let kind = match self.peek() {
            Tok::Keyword("pass") => {
                self.advance();
                StmtKind::Pass
            }
            Tok::Keyword("break") => {
                if self.loops == 0 {
                    return Err(self.error_here("'break' outside loop"));
                }
                self.advance();
                StmtKind::Break
            }
            Tok::Keyword("continue") => {
                if self.loops == 0 {
                    return Err(self.error_here("'continue' not properly in loop"));
                }
                self.advance();
                StmtKind::Continue
            }
            Tok::Keyword("return") => {
                if !self.in_function {
                    return Err(self.error_here("'return' outside function"));
                }
                self.advance();
                if self.starts_expression() {
                    StmtKind::Return(Some(self.parse_testlist()?))
                } else {
                    StmtKind::Return(None)
                }
            }
            Tok::Keyword("raise") => {
                self.advance();
                if self.starts_expression() {
                    let exc = self.parse_test()?;
                    if self.eat_kw("from") {
                        self.parse_test()?;
                    }
                    StmtKind::Raise(Some(exc))
                } else {
                    StmtKind::Raise(None)
                }
            }
            Tok::Keyword("assert") => {
                self.advance();
                let test = self.parse_test()?;
                let message = if self.eat_op(",") {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                StmtKind::Assert { test, message }
            }
            Tok::Keyword(kw @ ("global" | "nonlocal")) => {
                let is_global = *kw == "global";
                self.advance();
                let mut names = vec![self.expect_name()?];
                while self.eat_op(",") {
                    names.push(self.expect_name()?);
                }
                if is_global {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                }
            }
            Tok::Keyword("del") => {
                self.advance();
                let start = self.current().clone();
                let exprs = self.parse_testlist()?;
                let targets = match exprs.kind {
                    ExprKind::Tuple(items) => items
                        .into_iter()
                        .map(|e| to_target(e, &start))
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => vec![to_target(exprs, &start)?],
                };
                StmtKind::Del(targets)
            }
            Tok::Keyword("import") => {
                self.advance();
                let mut names = vec![self.parse_import_name()?];
                while self.eat_op(",") {
                    names.push(self.parse_import_name()?);
                }
                StmtKind::Import(names)
            }
            Tok::Keyword("from") => self.parse_from_import()?,
            _ => self.parse_expression_statement()?,
        };
        Ok(Stmt { kind, line })
    }

    fn parse_dotted_name(&mut self) -> Result<String, ParseError> {
        if self.at_op(".") || self.at_op("...") {
            return Err(self.error_here("relative imports are not supported"));
        }
        let mut path = self.expect_name()?;
        while self.eat_op(".") {
            path.push('.');
            path.push_str(&self.expect_name()?);
        }
        Ok(path)
    }

    fn parse_import_name(&mut self) -> Result<ImportName, ParseError> {
        let path = self.parse_dotted_name()?;
        let alias = if self.eat_kw("as") {
            Some(self.expect_name()?)
        } else {
            None
        };
        Ok(ImportName { path, alias })
    }

    fn parse_from_import(&mut self) -> Result<StmtKind, ParseError> {
        self.expect_kw("from")?;
        let module = self.parse_dotted_name()?;
        self.expect_kw("import")?;

        if self.eat_op("*") {
            return Ok(StmtKind::FromImport {
                module,
                names: Vec::new(),
            });
        }

        let parenthesized = self.eat_op("(");
        let mut names = Vec::new();
        loop {
            let path = self.expect_name()?;
            let alias = if self.eat_kw("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            names.push(ImportName { path, alias });
            if !self.eat_op(",") {
                break;
            }
            if parenthesized && self.at_op(")") {
                break;
            }
        }
        if parenthesized {
            self.expect_op(")")?;
        }
        Ok(StmtKind::FromImport { module, names })
    }

    fn parse_expression_statement(&mut self) -> Result<StmtKind, ParseError> {
        let start = self.current().clone();
        let first = self.parse_testlist()?;

        if self.at_op(":") {
            // Annotation: `name: type [= value]`
            let target = to_target(first, &start)?;
            self.advance();
            self.parse_test()?;
            if self.eat_op("=") {
                let value = self.parse_testlist()?;
                return Ok(StmtKind::Assign {
                    targets: vec![target],
                    value,
                });
            }
            return Ok(StmtKind::Pass);
        }

        if let Tok::Op(op) = self.peek() {
            let aug = match *op {
                "+=" => Some(BinOp::Add),
                "-=" => Some(BinOp::Sub),
                "*=" => Some(BinOp::Mul),
                "/=" => Some(BinOp::Div),
                "//=" => Some(BinOp::FloorDiv),
                "%=" => Some(BinOp::Mod),
                "**=" => Some(BinOp::Pow),
                ">>=" | "<<=" | "&=" | "|=" | "^=" | "@=" => {
                    return Err(self.error_here(format!("operator '{op}' is not supported")));
                }
                _ => None,
            };
            if let Some(op) = aug {
                self.advance();
                let target = to_target(first, &start)?;
                if matches!(target, Target::Tuple(_)) {
                    return Err(ParseError::new(
                        "illegal target for augmented assignment",
                        start.line,
                        start.column,
                    ));
                }
                let value = self.parse_testlist()?;
                return Ok(StmtKind::AugAssign { target, op, value });
            }
        }

        if self.at_op("=") {
            let mut exprs = vec![first];
            while self.eat_op("=") {
                exprs.push(self.parse_testlist()?);
            }
            let Some(value) = exprs.pop() else {
                return Err(self.unexpected("an expression"));
            };
            let targets = exprs
                .into_iter()
                .map(|e| to_target(e, &start))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(StmtKind::Assign { targets, value });
        }

        Ok(StmtKind::Expr(first))
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect_kw("if")?;
        let mut branches = Vec::new();
        let test = self.parse_test()?;
        branches.push((test, self.parse_block()?));

        let mut orelse = Vec::new();
        loop {
            if self.eat_kw("elif") {
                let test = self.parse_test()?;
                branches.push((test, self.parse_block()?));
            } else if self.eat_kw("else") {
                orelse = self.parse_block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt {
            kind: StmtKind::If { branches, orelse },
            line,
        })
    }

    fn reject_loop_else(&self) -> Result<(), ParseError> {
        if self.at_kw("else") {
            return Err(self.error_here("'else' clauses on loops are not supported"));
        }
        Ok(())
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect_kw("while")?;
        let test = self.parse_test()?;
        let body = self.parse_loop_body()?;
        self.reject_loop_else()?;
        Ok(Stmt {
            kind: StmtKind::While { test, body },
            line,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect_kw("for")?;
        let target = self.parse_target_list()?;
        self.expect_kw("in")?;
        let iter = self.parse_testlist()?;
        let body = self.parse_loop_body()?;
        self.reject_loop_else()?;
        Ok(Stmt {
            kind: StmtKind::For { target, iter, body },
            line,
        })
    }

    fn parse_loop_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.loops += 1;
        let body = self.parse_block();
        self.loops -= 1;
        body
    }

    fn parse_try(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect_kw("try")?;
        let body = self.parse_block()?;

        let mut handlers = Vec::new();
        while self.at_kw("except") {
            let handler_line = self.line();
            self.advance();
            let (kind, name) = if self.at_op(":") {
                (None, None)
            } else {
                let kind = self.parse_test()?;
                let name = if self.eat_kw("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                (Some(kind), name)
            };
            let body = self.parse_block()?;
            handlers.push(ExceptHandler {
                kind,
                name,
                body,
                line: handler_line,
            });
        }

        let orelse = if !handlers.is_empty() && self.eat_kw("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_kw("finally") {
            self.parse_block()?
        } else {
            Vec::new()
        };

        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.unexpected("'except' or 'finally'"));
        }
        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
            line,
        })
    }

    fn parse_def(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect_kw("def")?;
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.parse_params(")")?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.parse_test()?;
        }
        let outer = (self.loops, self.in_function);
        (self.loops, self.in_function) = (0, true);
        let body = self.parse_block();
        (self.loops, self.in_function) = outer;
        let body = body?;
        Ok(Stmt {
            kind: StmtKind::FunctionDef(Rc::new(FunctionDef {
                name,
                params,
                body,
                line,
            })),
            line,
        })
    }

    /// Parameters up to (not including) `close`.
    fn parse_params(&mut self, close: &str) -> Result<Vec<Param>, ParseError> {
        let mut params: Vec<Param> = Vec::new();
        while !self.at_op(close) {
            if self.at_op("*") || self.at_op("**") || self.at_op("/") {
                return Err(self.error_here("variadic and positional-only parameters are not supported"));
            }
            let name = self.expect_name()?;
            if params.iter().any(|p| p.name == name) {
                return Err(self.error_here(format!("duplicate parameter '{name}'")));
            }
            // Lambdas end their parameter list with ':', so only `def` takes annotations.
            if close == ")" && self.eat_op(":") {
                self.parse_test()?;
            }
            let default = if self.eat_op("=") {
                Some(self.parse_test()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                return Err(self.error_here("parameter without a default follows parameter with a default"));
            }
            params.push(Param { name, default });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    /// Loop and comprehension targets: `x`, `i, row`, `(a, b)`.
    fn parse_target_list(&mut self) -> Result<Target, ParseError> {
        let start = self.current().clone();
        let first = self.parse_arith()?;
        if !self.at_op(",") {
            return to_target(first, &start);
        }
        let mut targets = vec![to_target(first, &start)?];
        while self.eat_op(",") {
            if self.at_kw("in") {
                break;
            }
            let item_start = self.current().clone();
            let expr = self.parse_arith()?;
            targets.push(to_target(expr, &item_start)?);
        }
        Ok(Target::Tuple(targets))
    }

    // ---- expressions ----

    fn parse_testlist(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let first = self.parse_test()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    fn parse_test(&mut self) -> Result<Expr, ParseError> {
        if self.at_kw("lambda") {
            return self.parse_lambda();
        }
        self.enter()?;
        let line = self.line();
        let body = self.parse_or()?;
        let expr = if self.eat_kw("if") {
            let test = self.parse_or()?;
            self.expect_kw("else")?;
            let orelse = self.parse_test()?;
            Expr::new(
                ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                line,
            )
        } else {
            body
        };
        self.leave();
        Ok(expr)
    }

    fn parse_lambda(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        self.expect_kw("lambda")?;
        self.enter()?;
        let params = self.parse_params(":")?;
        self.expect_op(":")?;
        let body = self.parse_test()?;
        self.leave();
        let def = FunctionDef {
            name: "<lambda>".to_string(),
            params,
            body: vec![Stmt {
                kind: StmtKind::Return(Some(body)),
                line,
            }],
            line,
        };
        Ok(Expr::new(ExprKind::Lambda(Rc::new(def)), line))
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        let mut links = 0;
        while self.at_kw("or") {
            let line = self.line();
            self.advance();
            self.enter()?;
            links += 1;
            let right = self.parse_and()?;
            left = Expr::new(
                ExprKind::BoolOp {
                    op: BoolOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        self.leave_chain(links);
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        let mut links = 0;
        while self.at_kw("and") {
            let line = self.line();
            self.advance();
            self.enter()?;
            links += 1;
            let right = self.parse_not()?;
            left = Expr::new(
                ExprKind::BoolOp {
                    op: BoolOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        self.leave_chain(links);
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.at_kw("not") {
            let line = self.line();
            self.advance();
            self.enter()?;
            let operand = self.parse_not()?;
            self.leave();
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                line,
            ));
        }
        self.parse_comparison()
    }

    fn comparison_operator(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::NotEq,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::LtE,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::GtE,
            Tok::Keyword("in") => CmpOp::In,
            Tok::Keyword("not") if matches!(self.peek_at(1), Tok::Keyword("in")) => {
                self.advance();
                CmpOp::NotIn
            }
            Tok::Keyword("is") => {
                if matches!(self.peek_at(1), Tok::Keyword("not")) {
                    self.advance();
                    CmpOp::IsNot
                } else {
                    CmpOp::Is
                }
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let left = self.parse_arith()?;
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_operator() {
            ops.push((op, self.parse_arith()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
            line,
        ))
    }

    fn binary_chain(
        &mut self,
        operand: fn(&mut Self) -> Result<Expr, ParseError>,
        operator: fn(&Tok) -> Option<BinOp>,
    ) -> Result<Expr, ParseError> {
        let mut left = operand(self)?;
        let mut links = 0;
        while let Some(op) = operator(self.peek()) {
            let line = self.line();
            self.advance();
            self.enter()?;
            links += 1;
            let right = operand(self)?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        self.leave_chain(links);
        Ok(left)
    }

    fn parse_arith(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::parse_term, |tok| match tok {
            Tok::Op("+") => Some(BinOp::Add),
            Tok::Op("-") => Some(BinOp::Sub),
            _ => None,
        })
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        if let Tok::Op(op @ ("@" | "&" | "|" | "^" | "<<" | ">>")) = self.peek() {
            return Err(self.error_here(format!("operator '{op}' is not supported")));
        }
        let expr = self.binary_chain(Self::parse_factor, |tok| match tok {
            Tok::Op("*") => Some(BinOp::Mul),
            Tok::Op("/") => Some(BinOp::Div),
            Tok::Op("//") => Some(BinOp::FloorDiv),
            Tok::Op("%") => Some(BinOp::Mod),
            _ => None,
        })?;
        if let Tok::Op(op @ ("@" | "&" | "|" | "^" | "<<" | ">>")) = self.peek() {
            return Err(self.error_here(format!("operator '{op}' is not supported")));
        }
        Ok(expr)
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            Tok::Op("~") => return Err(self.error_here("operator '~' is not supported")),
            _ => return self.parse_power(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_factor()?;
        self.leave();
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            line,
        ))
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_postfix()?;
        if !self.at_op("**") {
            return Ok(base);
        }
        let line = self.line();
        self.advance();
        self.enter()?;
        let exponent = self.parse_factor()?;
        self.leave();
        Ok(Expr::new(
            ExprKind::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            },
            line,
        ))
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_atom()?;
        let mut links = 0;
        loop {
            let line = self.line();
            if self.eat_op("(") {
                self.enter()?;
                links += 1;
                let (args, keywords) = self.parse_call_args()?;
                self.expect_op(")")?;
                expr = Expr::new(
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                        keywords,
                    },
                    line,
                );
            } else if self.eat_op("[") {
                self.enter()?;
                links += 1;
                let index = self.parse_subscript()?;
                self.expect_op("]")?;
                expr = Expr::new(
                    ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                );
            } else if self.eat_op(".") {
                self.enter()?;
                links += 1;
                let attr = self.expect_name()?;
                expr = Expr::new(
                    ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                    },
                    line,
                );
            } else {
                break;
            }
        }
        self.leave_chain(links);
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ParseError> {
        let mut args = Vec::new();
        let mut keywords: Vec<(String, Expr)> = Vec::new();
        while !self.at_op(")") {
            if self.at_op("*") || self.at_op("**") {
                return Err(self.error_here("argument unpacking is not supported"));
            }
            let is_keyword = matches!(self.peek(), Tok::Name(_)) && matches!(self.peek_at(1), Tok::Op("="));
            if is_keyword {
                let name = self.expect_name()?;
                if keywords.iter().any(|(k, _)| *k == name) {
                    return Err(self.error_here(format!("keyword argument repeated: {name}")));
                }
                self.advance();
                keywords.push((name, self.parse_test()?));
            } else {
                if !keywords.is_empty() {
                    return Err(self.error_here("positional argument follows keyword argument"));
                }
                let line = self.line();
                let expr = self.parse_test()?;
                if self.at_kw("for") {
                    let clauses = self.parse_comp_clauses()?;
                    args.push(Expr::new(
                        ExprKind::ListComp {
                            element: Box::new(expr),
                            clauses,
                        },
                        line,
                    ));
                } else {
                    args.push(expr);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok((args, keywords))
    }

    fn parse_subscript(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let start = if self.eat_op(":") {
            None
        } else {
            let first = self.parse_test()?;
            if self.at_op(",") {
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op("]") {
                        break;
                    }
                    items.push(self.parse_test()?);
                }
                return Ok(Expr::new(ExprKind::Tuple(items), line));
            }
            if !self.eat_op(":") {
                return Ok(first);
            }
            Some(Box::new(first))
        };

        let stop = if self.at_op("]") || self.at_op(":") {
            None
        } else {
            Some(Box::new(self.parse_test()?))
        };
        let step = if self.eat_op(":") && !self.at_op("]") {
            Some(Box::new(self.parse_test()?))
        } else {
            None
        };
        Ok(Expr::new(ExprKind::Slice { start, stop, step }, line))
    }

    fn parse_comp_clauses(&mut self) -> Result<Vec<CompClause>, ParseError> {
        let mut clauses = Vec::new();
        while self.eat_kw("for") {
            let target = self.parse_target_list()?;
            self.expect_kw("in")?;
            let iter = self.parse_or()?;
            clauses.push(CompClause::For { target, iter });
            while self.eat_kw("if") {
                clauses.push(CompClause::If(self.parse_or()?));
            }
        }
        Ok(clauses)
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let token = self.current().clone();
        let line = token.line;
        let kind = match token.tok {
            Tok::Name(name) => {
                self.advance();
                ExprKind::Name(name)
            }
            Tok::Int(value) => {
                self.advance();
                ExprKind::Int(value)
            }
            Tok::Float(value) => {
                self.advance();
                ExprKind::Float(value)
            }
            Tok::Str { .. } => return self.parse_strings(),
            Tok::Keyword("None") => {
                self.advance();
                ExprKind::None
            }
            Tok::Keyword("True") => {
                self.advance();
                ExprKind::Bool(true)
            }
            Tok::Keyword("False") => {
                self.advance();
                ExprKind::Bool(false)
            }
            Tok::Op("(") => {
                self.advance();
                self.enter()?;
                let kind = self.parse_paren_contents()?;
                self.expect_op(")")?;
                self.leave();
                kind
            }
            Tok::Op("[") => {
                self.advance();
                self.enter()?;
                let kind = self.parse_list_contents()?;
                self.expect_op("]")?;
                self.leave();
                kind
            }
            Tok::Op("{") => {
                self.advance();
                self.enter()?;
                let kind = self.parse_dict_contents()?;
                self.expect_op("}")?;
                self.leave();
                kind
            }
            _ => return Err(self.unexpected("an expression")),
        };
        Ok(Expr::new(kind, line))
    }

    fn parse_paren_contents(&mut self) -> Result<ExprKind, ParseError> {
        if self.at_op(")") {
            return Ok(ExprKind::Tuple(Vec::new()));
        }
        let first = self.parse_test()?;
        if self.at_kw("for") {
            let clauses = self.parse_comp_clauses()?;
            return Ok(ExprKind::ListComp {
                element: Box::new(first),
                clauses,
            });
        }
        if !self.at_op(",") {
            return Ok(first.kind);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op(")") {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(ExprKind::Tuple(items))
    }

    fn parse_list_contents(&mut self) -> Result<ExprKind, ParseError> {
        if self.at_op("]") {
            return Ok(ExprKind::List(Vec::new()));
        }
        let first = self.parse_test()?;
        if self.at_kw("for") {
            let clauses = self.parse_comp_clauses()?;
            return Ok(ExprKind::ListComp {
                element: Box::new(first),
                clauses,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(ExprKind::List(items))
    }

    fn parse_dict_contents(&mut self) -> Result<ExprKind, ParseError> {
        if self.at_op("}") {
            return Ok(ExprKind::Dict(Vec::new()));
        }
        if self.at_op("**") {
            return Err(self.error_here("dict unpacking is not supported"));
        }
        let key = self.parse_test()?;
        if !self.at_op(":") {
            return Err(self.error_here("set literals are not supported"));
        }
        self.advance();
        let value = self.parse_test()?;
        if self.at_kw("for") {
            let clauses = self.parse_comp_clauses()?;
            return Ok(ExprKind::DictComp {
                key: Box::new(key),
                value: Box::new(value),
                clauses,
            });
        }
        let mut entries = vec![(key, value)];
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            let key = self.parse_test()?;
            self.expect_op(":")?;
            let value = self.parse_test()?;
            entries.push((key, value));
        }
        Ok(ExprKind::Dict(entries))
    }

    /// Adjacent string literals concatenate; any f-string makes the whole
    /// run an f-string.
    fn parse_strings(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let mut parts: Vec<FStringPart> = Vec::new();
        let mut any_fstring = false;

        while let Tok::Str { value, fstring } = self.peek().clone() {
            let token = self.advance();
            if fstring {
                any_fstring = true;
                parts.extend(self.parse_fstring(&value, token.line, token.column)?);
            } else {
                parts.push(FStringPart::Literal(value));
            }
        }

        if !any_fstring {
            let text = parts
                .into_iter()
                .map(|p| match p {
                    FStringPart::Literal(s) => s,
                    FStringPart::Field { .. } => String::new(),
                })
                .collect();
            return Ok(Expr::new(ExprKind::Str(text), line));
        }
        Ok(Expr::new(ExprKind::FString(parts), line))
    }

    fn parse_fstring(&mut self, text: &str, line: usize, column: usize) -> Result<Vec<FStringPart>, ParseError> {
        let chars: Vec<char> = text.chars().collect();
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '{' if chars.get(i + 1) == Some(&'{') => {
                    literal.push('{');
                    i += 2;
                }
                '}' if chars.get(i + 1) == Some(&'}') => {
                    literal.push('}');
                    i += 2;
                }
                '}' => {
                    return Err(ParseError::new("f-string: single '}' is not allowed", line, column));
                }
                '{' => {
                    let end = field_end(&chars, i + 1).ok_or_else(|| {
                        ParseError::new("f-string: expecting '}'", line, column)
                    })?;
                    let field: String = chars[i + 1..end].iter().collect();
                    if !literal.is_empty() {
                        parts.push(FStringPart::Literal(std::mem::take(&mut literal)));
                    }
                    // +2 for the prefix and quote, +1 for the brace.
                    parts.push(self.parse_fstring_field(&field, line, column + i + 3)?);
                    i = end + 1;
                }
                c => {
                    literal.push(c);
                    i += 1;
                }
            }
        }
        if !literal.is_empty() {
            parts.push(FStringPart::Literal(literal));
        }
        Ok(parts)
    }

    fn parse_fstring_field(&mut self, field: &str, line: usize, column: usize) -> Result<FStringPart, ParseError> {
        let (expr_text, conversion, spec) = split_field(field);
        if expr_text.trim().is_empty() {
            return Err(ParseError::new("f-string: empty expression not allowed", line, column));
        }
        if expr_text.trim_end().ends_with('=') && !expr_text.trim_end().ends_with("==") {
            return Err(ParseError::new("f-string: '=' specifier is not supported", line, column));
        }
        let conversion = match conversion {
            None => None,
            Some(c @ ('r' | 's')) => Some(c),
            Some(c) => {
                return Err(ParseError::new(
                    format!("f-string: invalid conversion character '{c}'"),
                    line,
                    column,
                ));
            }
        };

        let tokens = tokenize_fragment(expr_text, line, column.max(2))?;
        let mut sub = Parser::new(tokens, self.depth + 1);
        let expr = sub.parse_testlist()?;
        if !matches!(sub.peek(), Tok::Newline | Tok::Eof) {
            return Err(sub.unexpected("'}'"));
        }
        Ok(FStringPart::Field {
            expr,
            conversion,
            spec: spec.map(str::to_string),
        })
    }
}

/// Index of the `}` closing a replacement field that starts at `start`.
fn field_end(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (offset, &c) in chars[start..].iter().enumerate() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']') => depth = depth.saturating_sub(1),
            (None, '}') if depth == 0 => return Some(start + offset),
            (None, '}') => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Split `expr!c:spec` at the top level.
fn split_field(field: &str) -> (&str, Option<char>, Option<&str>) {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut expr_end = field.len();
    let mut conversion = None;
    let mut spec = None;

    let bytes: Vec<(usize, char)> = field.char_indices().collect();
    let mut i = 0;
    while i < bytes.len() {
        let (pos, c) = bytes[i];
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth = depth.saturating_sub(1),
            (None, '!') if depth == 0 && bytes.get(i + 1).is_some_and(|&(_, n)| n != '=') => {
                expr_end = expr_end.min(pos);
                conversion = bytes.get(i + 1).map(|&(_, n)| n);
                i += 2;
                if let Some(&(colon_pos, ':')) = bytes.get(i) {
                    spec = Some(&field[colon_pos + 1..]);
                }
                break;
            }
            (None, ':') if depth == 0 => {
                expr_end = expr_end.min(pos);
                spec = Some(&field[pos + 1..]);
                break;
            }
            _ => {}
        }
        i += 1;
    }
    (&field[..expr_end], conversion, spec)
}

fn to_target(expr: Expr, start: &Token) -> Result<Target, ParseError> {
    let line = expr.line;
    match expr.kind {
        ExprKind::Name(name) => Ok(Target::Name(name, line)),
        ExprKind::Subscript { value, index } => Ok(Target::Subscript { value, index }),
        ExprKind::Attribute { value, attr } => Ok(Target::Attribute { value, attr, line }),
        ExprKind::Tuple(items) | ExprKind::List(items) => Ok(Target::Tuple(
            items
                .into_iter()
                .map(|item| to_target(item, start))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        _ => Err(ParseError::new("cannot assign to expression", start.line, start.column)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        match parse(src) {
            Ok(program) => program,
            Err(e) => panic!("parse failed: {}", e.display_with_context(src)),
        }
    }

    fn only_expr(src: &str) -> ExprKind {
        let program = parse_ok(src);
        match &program.body[0].kind {
            StmtKind::Expr(e) => e.kind.clone(),
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn precedence_of_arithmetic() {
        match only_expr("1 + 2 * 3\n") {
            ExprKind::Binary { op: BinOp::Add, right, .. } => {
                assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unary_minus_binds_looser_than_power() {
        match only_expr("-2 ** 2\n") {
            ExprKind::Unary { op: UnaryOp::Neg, operand } => {
                assert!(matches!(operand.kind, ExprKind::Binary { op: BinOp::Pow, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn chained_comparison_and_membership() {
        match only_expr("0 < x <= 10 not in y\n") {
            ExprKind::Compare { ops, .. } => {
                let kinds: Vec<CmpOp> = ops.iter().map(|(op, _)| *op).collect();
                assert_eq!(kinds, vec![CmpOp::Lt, CmpOp::LtE, CmpOp::NotIn]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn function_with_defaults_and_annotations() {
        let program = parse_ok("def f(data: dict, n: int = 3) -> list:\n    return [n]\n");
        match &program.body[0].kind {
            StmtKind::FunctionDef(def) => {
                assert_eq!(def.name, "f");
                assert_eq!(def.params.len(), 2);
                assert!(def.params[0].default.is_none());
                assert!(def.params[1].default.is_some());
                assert_eq!(def.body.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn if_elif_else_and_loops() {
        let src = "\
for i, x in enumerate(xs):
    if x > 0:
        pos += 1
    elif x < 0:
        neg += 1
    else:
        continue
while n > 0:
    n -= 1
";
        let program = parse_ok(src);
        assert_eq!(program.body.len(), 2);
        match &program.body[0].kind {
            StmtKind::For { target, body, .. } => {
                assert!(matches!(target, Target::Tuple(t) if t.len() == 2));
                match &body[0].kind {
                    StmtKind::If { branches, orelse } => {
                        assert_eq!(branches.len(), 2);
                        assert_eq!(orelse.len(), 1);
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(program.body[1].line, 8);
    }

    #[test]
    fn comprehensions() {
        assert!(matches!(
            only_expr("[x * 2 for x in xs if x > 0]\n"),
            ExprKind::ListComp { ref clauses, .. } if clauses.len() == 2
        ));
        assert!(matches!(
            only_expr("{k: v for k, v in pairs}\n"),
            ExprKind::DictComp { .. }
        ));
        match only_expr("sum(x for x in xs)\n") {
            ExprKind::Call { args, .. } => {
                assert!(matches!(args[0].kind, ExprKind::ListComp { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn slices_and_keywords() {
        match only_expr("f(xs[1:-1], ys[::2], key=lambda t: t[0])\n") {
            ExprKind::Call { args, keywords, .. } => {
                assert_eq!(args.len(), 2);
                assert_eq!(keywords[0].0, "key");
                assert!(matches!(keywords[0].1.kind, ExprKind::Lambda(_)));
                match &args[1].kind {
                    ExprKind::Subscript { index, .. } => match &index.kind {
                        ExprKind::Slice { start, stop, step } => {
                            assert!(start.is_none() && stop.is_none() && step.is_some());
                        }
                        other => panic!("unexpected {other:?}"),
                    },
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fstring_fields_and_specs() {
        match only_expr("f'pnl={total:.2f} n={len(xs)!r} {{lit}}'\n") {
            ExprKind::FString(parts) => {
                assert_eq!(parts.len(), 5);
                assert_eq!(parts[0], FStringPart::Literal("pnl=".into()));
                match &parts[1] {
                    FStringPart::Field { spec, conversion, .. } => {
                        assert_eq!(spec.as_deref(), Some(".2f"));
                        assert_eq!(*conversion, None);
                    }
                    other => panic!("unexpected {other:?}"),
                }
                match &parts[3] {
                    FStringPart::Field { conversion, .. } => assert_eq!(*conversion, Some('r')),
                    other => panic!("unexpected {other:?}"),
                }
                assert_eq!(parts[4], FStringPart::Literal(" {lit}".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn imports() {
        let program = parse_ok("import math as m, statistics\nfrom indicators import sma, ema as e\nfrom math import *\n");
        match &program.body[0].kind {
            StmtKind::Import(names) => {
                assert_eq!(names[0].path, "math");
                assert_eq!(names[0].alias.as_deref(), Some("m"));
                assert_eq!(names[1].path, "statistics");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &program.body[1].kind {
            StmtKind::FromImport { module, names } => {
                assert_eq!(module, "indicators");
                assert_eq!(names.len(), 2);
                assert_eq!(names[1].alias.as_deref(), Some("e"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&program.body[2].kind, StmtKind::FromImport { names, .. } if names.is_empty()));
    }

    #[test]
    fn try_except_finally() {
        let src = "try:\n    x = 1 / 0\nexcept (ZeroDivisionError, ValueError) as e:\n    x = 0\nfinally:\n    done = True\n";
        match &parse_ok(src).body[0].kind {
            StmtKind::Try { handlers, finalbody, .. } => {
                assert_eq!(handlers.len(), 1);
                assert_eq!(handlers[0].name.as_deref(), Some("e"));
                assert_eq!(finalbody.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn multiple_assignment_targets_and_unpacking() {
        match &parse_ok("a = b = 1\nx, y = y, x\n").body[..] {
            [first, second] => {
                assert!(matches!(&first.kind, StmtKind::Assign { targets, .. } if targets.len() == 2));
                assert!(matches!(
                    &second.kind,
                    StmtKind::Assign { targets, value } if matches!(targets[0], Target::Tuple(_))
                        && matches!(value.kind, ExprKind::Tuple(_))
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn annotated_assignment() {
        let program = parse_ok("x: float = 1.5\ny: int\n");
        assert!(matches!(program.body[0].kind, StmtKind::Assign { .. }));
        assert!(matches!(program.body[1].kind, StmtKind::Pass));
    }

    #[test]
    fn syntax_error_has_position() {
        let err = parse("x = 1\nif x\n    y = 2\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 5);
        assert!(err.message.contains("expected ':'"), "{}", err.message);
    }

    #[test]
    fn assignment_to_call_is_rejected() {
        let err = parse("f() = 3\n").unwrap_err();
        assert!(err.message.contains("cannot assign"));
    }

    #[test]
    fn unsupported_constructs_are_reported() {
        assert!(parse("class A:\n    pass\n").unwrap_err().message.contains("class"));
        assert!(parse("with x:\n    pass\n").unwrap_err().message.contains("with"));
        assert!(parse("s = {1, 2}\n").unwrap_err().message.contains("set"));
        assert!(parse("f(*xs)\n").unwrap_err().message.contains("unpacking"));
    }

    #[test]
    fn deep_nesting_is_rejected_not_overflowed() {
        let src = format!("x = {}1{}\n", "(".repeat(5_000), ")".repeat(5_000));
        let err = parse(&src).unwrap_err();
        assert!(err.message.contains("nested too deeply"));

        let chain = format!("x = {}\n", vec!["1"; 10_000].join(" + "));
        assert!(parse(&chain).is_err());

        let unary = format!("x = {}1\n", "-".repeat(10_000));
        assert!(parse(&unary).is_err());
    }

    #[test]
    fn control_flow_outside_its_context_is_rejected() {
        assert_eq!(parse("break\n").unwrap_err().message, "'break' outside loop");
        assert_eq!(parse("return 1\n").unwrap_err().message, "'return' outside function");
        let err = parse("for x in y:\n    def f():\n        continue\n").unwrap_err();
        assert_eq!(err.line, 3);
        parse_ok("def f():\n    while True:\n        break\n    return 1\n");
    }

    #[test]
    fn moderate_nesting_is_fine() {
        let src = format!("x = {}1{}\n", "[".repeat(20), "]".repeat(20));
        parse_ok(&src);
    }
}
