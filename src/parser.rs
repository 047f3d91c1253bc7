//! Recursive-descent parser (`spec.md` §4.2).
//!
//! Consumes `Lexer` tokens into the `ast` types. Errors are accumulated
//! rather than aborting on the first one: a failed statement is skipped up
//! to the next statement boundary (`;` or a dedent-equivalent `Newline` at
//! bracket depth zero) so later, unrelated errors are still reported in one
//! pass, matching the teacher's diagnostic-accumulation style.

use crate::{
    ast::*,
    error::{CompileError, CompileErrors},
    intern::{Interns, StringId},
    lexer::{Lexer, Token, TokenKind},
};

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    interns: &'a mut Interns,
    lookahead: Vec<Token>,
    errors: Vec<CompileError>,
    source_name: String,
}

type PResult<T> = Result<T, ()>;

impl<'a> Parser<'a> {
    pub fn new(src: &'a str, interns: &'a mut Interns, source_name: impl Into<String>) -> Self {
        Self { lexer: Lexer::new(src), interns, lookahead: Vec::new(), errors: Vec::new(), source_name: source_name.into() }
    }

    pub fn parse_program(mut self) -> Result<Program, CompileErrors> {
        let mut program = Program { package: None, imports: Vec::new(), classes: Vec::new(), functions: Vec::new(), statements: Vec::new() };
        self.skip_newlines();
        if self.check(&TokenKind::Package) {
            self.advance();
            let name = self.parse_dotted_name();
            program.package = Some(name);
            self.expect_statement_end();
        }
        self.skip_newlines();
        while self.check(&TokenKind::Import) {
            if let Ok(import) = self.parse_import() {
                program.imports.push(import);
            }
            self.skip_newlines();
        }
        while !self.at_eof() {
            match self.peek_kind() {
                TokenKind::Class => {
                    if let Ok(class) = self.parse_class() {
                        program.classes.push(class);
                    } else {
                        self.synchronize();
                    }
                }
                TokenKind::Def if self.looks_like_top_level_function() => {
                    if let Ok(func) = self.parse_func_decl() {
                        program.functions.push(func);
                    } else {
                        self.synchronize();
                    }
                }
                _ => match self.parse_statement() {
                    Ok(stmt) => program.statements.push(stmt),
                    Err(()) => self.synchronize(),
                },
            }
            self.skip_newlines();
        }
        if self.errors.is_empty() {
            Ok(program)
        } else {
            Err(CompileErrors(std::mem::take(&mut self.errors)))
        }
    }

    // --- token plumbing -------------------------------------------------

    fn fill(&mut self, n: usize) {
        while self.lookahead.len() <= n {
            let tok = self.lexer.next_token();
            self.lookahead.push(tok);
        }
    }

    fn peek_tok(&mut self) -> &Token {
        self.fill(0);
        &self.lookahead[0]
    }

    fn peek_kind(&mut self) -> TokenKind {
        self.peek_tok().kind.clone()
    }

    fn peek2_kind(&mut self) -> TokenKind {
        self.fill(1);
        self.lookahead[1].kind.clone()
    }

    fn at_eof(&mut self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        self.fill(0);
        self.lookahead.remove(0)
    }

    fn check(&mut self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek_kind()) == std::mem::discriminant(kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            self.error(format!("expected {what}"));
            Err(())
        }
    }

    fn error(&mut self, message: String) {
        let tok = self.peek_tok().clone();
        self.errors.push(CompileError { message, source_name: self.source_name.clone(), line: 0, column: 0, offset: tok.offset });
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) || self.check(&TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn expect_statement_end(&mut self) {
        if self.check(&TokenKind::Newline) || self.check(&TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn synchronize(&mut self) {
        loop {
            match self.peek_kind() {
                TokenKind::Eof => break,
                TokenKind::Newline | TokenKind::Semicolon => {
                    self.advance();
                    break;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn intern(&mut self, s: &str) -> StringId {
        self.interns.intern(s)
    }

    fn offset(&mut self) -> Offset {
        self.peek_tok().offset
    }

    fn looks_like_top_level_function(&mut self) -> bool {
        matches!(self.peek2_kind(), TokenKind::Identifier(_))
    }

    fn parse_dotted_name(&mut self) -> String {
        let mut parts = Vec::new();
        loop {
            if let TokenKind::Identifier(name) = self.peek_kind() {
                self.advance();
                parts.push(name);
            } else {
                break;
            }
            if self.check(&TokenKind::Dot) {
                self.advance();
            } else {
                break;
            }
        }
        parts.join(".")
    }

    fn parse_import(&mut self) -> PResult<Import> {
        let offset = self.offset();
        self.advance(); // import
        let is_static = self.eat(&TokenKind::Static);
        let path = self.parse_dotted_name().split('.').map(str::to_string).collect::<Vec<_>>();
        let mut is_star = false;
        if self.eat(&TokenKind::Dot) {
            // path.* — star already consumed as part of dotted name only if
            // a trailing identifier is `*`, which our lexer has no token for;
            // treat a stray Star token (if encountered) as the star form.
        }
        if self.check(&TokenKind::Star) {
            self.advance();
            is_star = true;
        }
        let alias = if self.eat(&TokenKind::As) {
            if let TokenKind::Identifier(name) = self.peek_kind() {
                self.advance();
                Some(name)
            } else {
                self.error("expected identifier after 'as'".into());
                None
            }
        } else {
            None
        };
        self.expect_statement_end();
        Ok(Import { path, alias, is_static, is_star, offset })
    }

    fn parse_class(&mut self) -> PResult<ClassDecl> {
        let offset = self.offset();
        self.advance(); // class
        let name = match self.peek_kind() {
            TokenKind::Identifier(n) => {
                self.advance();
                self.intern(&n)
            }
            _ => {
                self.error("expected class name".into());
                return Err(());
            }
        };
        let parent = if self.eat(&TokenKind::Colon) { Some(self.parse_dotted_name()) } else { None };
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_newlines();
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        let mut static_methods = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            let is_static = self.eat(&TokenKind::Static);
            if self.check(&TokenKind::Def) {
                let func = self.parse_func_decl()?;
                if is_static {
                    static_methods.push(func);
                } else {
                    methods.push(func);
                }
            } else {
                let field = self.parse_field_decl()?;
                fields.push(field);
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(ClassDecl { name, parent, fields, methods, static_methods, offset })
    }

    fn parse_field_decl(&mut self) -> PResult<FieldDecl> {
        let offset = self.offset();
        let is_const = self.eat(&TokenKind::Const);
        let type_name = self.try_parse_type_name();
        let name = match self.peek_kind() {
            TokenKind::Identifier(n) => {
                self.advance();
                self.intern(&n)
            }
            _ => {
                self.error("expected field name".into());
                return Err(());
            }
        };
        let default = if self.eat(&TokenKind::Assign) { Some(self.parse_expression()?) } else { None };
        self.expect_statement_end();
        Ok(FieldDecl { name, type_name, default, is_const, offset })
    }

    fn try_parse_type_name(&mut self) -> Option<String> {
        if self.eat(&TokenKind::Var) {
            return None;
        }
        if let TokenKind::Identifier(n) = self.peek_kind() {
            if matches!(self.peek2_kind(), TokenKind::Identifier(_)) {
                self.advance();
                return Some(n);
            }
        }
        None
    }

    fn parse_func_decl(&mut self) -> PResult<FuncDecl> {
        let offset = self.offset();
        self.advance(); // def
        let return_type = self.try_parse_type_name();
        let name = match self.peek_kind() {
            TokenKind::Identifier(n) => {
                self.advance();
                self.intern(&n)
            }
            _ => {
                self.error("expected function name".into());
                return Err(());
            }
        };
        self.expect(&TokenKind::LParen, "'('")?;
        let params = self.parse_params()?;
        self.expect(&TokenKind::RParen, "')'")?;
        self.skip_newlines();
        self.expect(&TokenKind::LBrace, "'{'")?;
        let body = self.parse_block_contents()?;
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(FuncDecl { name, return_type, params, body, offset })
    }

    fn parse_params(&mut self) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        if self.check(&TokenKind::RParen) {
            return Ok(params);
        }
        loop {
            let offset = self.offset();
            let type_name = self.try_parse_type_name();
            let name = match self.peek_kind() {
                TokenKind::Identifier(n) => {
                    self.advance();
                    self.intern(&n)
                }
                _ => {
                    self.error("expected parameter name".into());
                    return Err(());
                }
            };
            let default = if self.eat(&TokenKind::Assign) { Some(self.parse_expression()?) } else { None };
            params.push(Param { name, type_name, default, offset });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn parse_block_contents(&mut self) -> PResult<Block> {
        self.skip_newlines();
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            match self.parse_statement() {
                Ok(s) => stmts.push(s),
                Err(()) => self.synchronize(),
            }
            self.skip_newlines();
        }
        Ok(stmts)
    }

    // --- statements -------------------------------------------------------

    fn parse_statement(&mut self) -> PResult<Statement> {
        match self.peek_kind() {
            TokenKind::LBrace => {
                self.advance();
                let body = self.parse_block_contents()?;
                self.expect(&TokenKind::RBrace, "'}'")?;
                Ok(Statement::Block(body))
            }
            TokenKind::If => self.parse_if(),
            TokenKind::Unless => self.parse_unless(),
            TokenKind::For => self.parse_for(),
            TokenKind::While => self.parse_while(),
            TokenKind::Do => self.parse_do_until_stmt(),
            TokenKind::Return => {
                let offset = self.offset();
                self.advance();
                let value = if self.check(&TokenKind::Newline) || self.check(&TokenKind::Semicolon) || self.check(&TokenKind::RBrace) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.apply_postfix_conditional(Statement::Return { value, offset })
            }
            TokenKind::Break => {
                let offset = self.offset();
                self.advance();
                self.apply_postfix_conditional(Statement::Break { offset })
            }
            TokenKind::Continue => {
                let offset = self.offset();
                self.advance();
                self.apply_postfix_conditional(Statement::Continue { offset })
            }
            TokenKind::Die => {
                let offset = self.offset();
                self.advance();
                let value = self.parse_expression()?;
                self.apply_postfix_conditional(Statement::Die { value, offset })
            }
            TokenKind::Class => Ok(Statement::ClassDecl(Box::new(self.parse_class()?))),
            TokenKind::Def => Ok(Statement::FuncDecl(Box::new(self.parse_func_decl()?))),
            TokenKind::Import => Ok(Statement::Import(self.parse_import()?)),
            TokenKind::Package => {
                self.advance();
                let name = self.parse_dotted_name();
                self.expect_statement_end();
                Ok(Statement::Package(name))
            }
            TokenKind::Const => self.parse_const_decl(),
            TokenKind::Switch => {
                let (subject, arms, offset) = self.parse_switch_common()?;
                Ok(Statement::Switch { subject, arms, offset })
            }
            TokenKind::Var => self.parse_var_decl(),
            TokenKind::Identifier(_) if self.looks_like_typed_var_decl() => self.parse_var_decl(),
            _ => {
                let expr = self.parse_expression()?;
                self.apply_postfix_conditional(Statement::ExprStmt(expr))
            }
        }
    }

    fn looks_like_typed_var_decl(&mut self) -> bool {
        matches!(self.peek2_kind(), TokenKind::Identifier(_))
    }

    fn apply_postfix_conditional(&mut self, stmt: Statement) -> PResult<Statement> {
        // `stmt if cond` / `stmt unless cond` postfix modifiers (spec.md §4.2).
        if self.eat(&TokenKind::If) {
            let offset = self.offset();
            let cond = self.parse_expression()?;
            self.expect_statement_end();
            return Ok(Statement::If { cond, then_branch: vec![stmt], else_branch: None, offset });
        }
        if self.eat(&TokenKind::Unless) {
            let offset = self.offset();
            let cond = self.parse_expression()?;
            self.expect_statement_end();
            let negated = Expression::Unop { op: UnOp::Not, operand: Box::new(cond), offset };
            return Ok(Statement::If { cond: negated, then_branch: vec![stmt], else_branch: None, offset });
        }
        self.expect_statement_end();
        Ok(stmt)
    }

    fn parse_var_decl(&mut self) -> PResult<Statement> {
        let offset = self.offset();
        let type_name = self.try_parse_type_name();
        let name = match self.peek_kind() {
            TokenKind::Identifier(n) => {
                self.advance();
                self.intern(&n)
            }
            _ => {
                self.error("expected variable name".into());
                return Err(());
            }
        };
        let init = if self.eat(&TokenKind::Assign) { Some(self.parse_expression()?) } else { None };
        self.apply_postfix_conditional(Statement::VarDecl { name, type_name, init, offset })
    }

    fn parse_const_decl(&mut self) -> PResult<Statement> {
        let offset = self.offset();
        self.advance(); // const
        let name = match self.peek_kind() {
            TokenKind::Identifier(n) => {
                self.advance();
                self.intern(&n)
            }
            _ => {
                self.error("expected constant name".into());
                return Err(());
            }
        };
        self.expect(&TokenKind::Assign, "'=' in const declaration")?;
        let init = self.parse_expression()?;
        self.apply_postfix_conditional(Statement::ConstDecl { name, init, offset })
    }

    fn parse_if(&mut self) -> PResult<Statement> {
        let offset = self.offset();
        self.advance(); // if
        self.expect(&TokenKind::LParen, "'(' after 'if'")?;
        let cond = self.parse_expression()?;
        self.expect(&TokenKind::RParen, "')'")?;
        let then_branch = self.parse_statement_as_block()?;
        self.skip_newlines_if_else_follows();
        let else_branch = if self.eat(&TokenKind::Else) {
            Some(self.parse_statement_as_block()?)
        } else {
            None
        };
        self.expect_statement_end();
        Ok(Statement::If { cond, then_branch, else_branch, offset })
    }

    fn parse_unless(&mut self) -> PResult<Statement> {
        let offset = self.offset();
        self.advance();
        self.expect(&TokenKind::LParen, "'(' after 'unless'")?;
        let cond = self.parse_expression()?;
        self.expect(&TokenKind::RParen, "')'")?;
        let negated = Expression::Unop { op: UnOp::Not, operand: Box::new(cond), offset };
        let then_branch = self.parse_statement_as_block()?;
        self.expect_statement_end();
        Ok(Statement::If { cond: negated, then_branch, else_branch: None, offset })
    }

    fn skip_newlines_if_else_follows(&mut self) {
        let mut n = 0;
        loop {
            self.fill(n);
            match self.lookahead[n].kind {
                TokenKind::Newline => n += 1,
                TokenKind::Else => {
                    for _ in 0..n {
                        self.lookahead.remove(0);
                    }
                    return;
                }
                _ => return,
            }
        }
    }

    fn parse_statement_as_block(&mut self) -> PResult<Block> {
        self.skip_newlines();
        if self.check(&TokenKind::LBrace) {
            self.advance();
            let body = self.parse_block_contents()?;
            self.expect(&TokenKind::RBrace, "'}'")?;
            Ok(body)
        } else {
            Ok(vec![self.parse_statement()?])
        }
    }

    fn parse_for(&mut self) -> PResult<Statement> {
        let offset = self.offset();
        self.advance();
        self.expect(&TokenKind::LParen, "'(' after 'for'")?;
        let init = if self.check(&TokenKind::Semicolon) { None } else { Some(Box::new(self.parse_for_clause()?)) };
        self.expect(&TokenKind::Semicolon, "';'")?;
        let cond = if self.check(&TokenKind::Semicolon) { None } else { Some(self.parse_expression()?) };
        self.expect(&TokenKind::Semicolon, "';'")?;
        let update = if self.check(&TokenKind::RParen) { None } else { Some(Box::new(self.parse_for_clause()?)) };
        self.expect(&TokenKind::RParen, "')'")?;
        let body = self.parse_statement_as_block()?;
        self.expect_statement_end();
        Ok(Statement::For { init, cond, update, body, offset })
    }

    fn parse_for_clause(&mut self) -> PResult<Statement> {
        if self.check(&TokenKind::Var) || self.looks_like_typed_var_decl() {
            let offset = self.offset();
            let type_name = self.try_parse_type_name();
            let name = match self.peek_kind() {
                TokenKind::Identifier(n) => {
                    self.advance();
                    self.intern(&n)
                }
                _ => {
                    self.error("expected variable name".into());
                    return Err(());
                }
            };
            let init = if self.eat(&TokenKind::Assign) { Some(self.parse_expression()?) } else { None };
            Ok(Statement::VarDecl { name, type_name, init, offset })
        } else {
            Ok(Statement::ExprStmt(self.parse_expression()?))
        }
    }

    fn parse_while(&mut self) -> PResult<Statement> {
        let offset = self.offset();
        self.advance();
        self.expect(&TokenKind::LParen, "'(' after 'while'")?;
        let cond = self.parse_expression()?;
        self.expect(&TokenKind::RParen, "')'")?;
        let body = self.parse_statement_as_block()?;
        self.expect_statement_end();
        Ok(Statement::While { cond, body, offset })
    }

    fn parse_do_until_stmt(&mut self) -> PResult<Statement> {
        let offset = self.offset();
        self.advance(); // do
        self.skip_newlines();
        self.expect(&TokenKind::LBrace, "'{'")?;
        let body = self.parse_block_contents()?;
        self.expect(&TokenKind::RBrace, "'}'")?;
        if self.eat(&TokenKind::Until) {
            self.expect(&TokenKind::LParen, "'(' after 'until'")?;
            let cond = self.parse_expression()?;
            self.expect(&TokenKind::RParen, "')'")?;
            self.expect_statement_end();
            Ok(Statement::DoUntil { body, cond, offset })
        } else {
            // Bare `do { ... }` used as a statement — an expression
            // statement wrapping the block expression form.
            self.expect_statement_end();
            Ok(Statement::ExprStmt(Expression::Do { body, offset }))
        }
    }

    // --- expressions --------------------------------------------------

    fn parse_expression(&mut self) -> PResult<Expression> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> PResult<Expression> {
        let lhs = self.parse_ternary()?;
        let op = match self.peek_kind() {
            TokenKind::Assign => Some(AssignOp::Assign),
            TokenKind::PlusAssign => Some(AssignOp::AddAssign),
            TokenKind::MinusAssign => Some(AssignOp::SubAssign),
            TokenKind::StarAssign => Some(AssignOp::MulAssign),
            TokenKind::SlashAssign => Some(AssignOp::DivAssign),
            TokenKind::PercentAssign => Some(AssignOp::ModAssign),
            TokenKind::ElvisAssign => Some(AssignOp::ElvisAssign),
            _ => None,
        };
        if let Some(op) = op {
            let offset = self.offset();
            self.advance();
            if self.check(&TokenKind::Comma) && op == AssignOp::Assign {
                // Shouldn't reach here normally; multi-assign handled at a
                // higher level via parse_multi_assign_or_expr below.
            }
            let value = self.parse_assignment()?;
            return Ok(Expression::Assign { target: Box::new(lhs), op, value: Box::new(value), offset });
        }
        Ok(lhs)
    }

    fn parse_ternary(&mut self) -> PResult<Expression> {
        let cond = self.parse_elvis()?;
        if self.eat(&TokenKind::Question) {
            let offset = self.offset();
            let then_expr = self.parse_assignment()?;
            self.expect(&TokenKind::Colon, "':'")?;
            let else_expr = self.parse_assignment()?;
            return Ok(Expression::Ternary { cond: Box::new(cond), then_expr: Box::new(then_expr), else_expr: Box::new(else_expr), offset });
        }
        Ok(cond)
    }

    fn parse_elvis(&mut self) -> PResult<Expression> {
        let mut lhs = self.parse_or()?;
        while self.check(&TokenKind::QuestionColon) {
            let offset = self.offset();
            self.advance();
            let rhs = self.parse_or()?;
            lhs = Expression::Elvis { lhs: Box::new(lhs), rhs: Box::new(rhs), offset };
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> PResult<Expression> {
        let mut lhs = self.parse_and()?;
        while self.check(&TokenKind::Or) || self.check(&TokenKind::Pipe) && self.peek2_kind() == TokenKind::Pipe {
            let offset = self.offset();
            if self.check(&TokenKind::Or) {
                self.advance();
            } else {
                self.advance();
                self.advance();
            }
            let rhs = self.parse_and()?;
            lhs = Expression::Binop { op: BinOp::Or, lhs: Box::new(lhs), rhs: Box::new(rhs), offset };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Expression> {
        let mut lhs = self.parse_not()?;
        while self.check(&TokenKind::And) || self.check(&TokenKind::Amp) && self.peek2_kind() == TokenKind::Amp {
            let offset = self.offset();
            if self.check(&TokenKind::And) {
                self.advance();
            } else {
                self.advance();
                self.advance();
            }
            let rhs = self.parse_not()?;
            lhs = Expression::Binop { op: BinOp::And, lhs: Box::new(lhs), rhs: Box::new(rhs), offset };
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> PResult<Expression> {
        if self.check(&TokenKind::Not) || self.check(&TokenKind::Bang) {
            let offset = self.offset();
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expression::Unop { op: UnOp::Not, operand: Box::new(operand), offset });
        }
        self.parse_instanceof_in()
    }

    fn parse_instanceof_in(&mut self) -> PResult<Expression> {
        let lhs = self.parse_equality()?;
        if self.eat(&TokenKind::Instanceof) {
            let offset = self.offset();
            let type_name = self.parse_dotted_name();
            return Ok(Expression::InstanceOf { value: Box::new(lhs), type_name, offset });
        }
        if self.eat(&TokenKind::In) {
            let offset = self.offset();
            let collection = self.parse_equality()?;
            return Ok(Expression::In { value: Box::new(lhs), collection: Box::new(collection), negate: false, offset });
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> PResult<Expression> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Eq => BinOp::Eq,
                TokenKind::Ne => BinOp::Ne,
                TokenKind::IdentEq => BinOp::IdentEq,
                TokenKind::IdentNe => BinOp::IdentNe,
                _ => break,
            };
            let offset = self.offset();
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expression::Binop { op, lhs: Box::new(lhs), rhs: Box::new(rhs), offset };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> PResult<Expression> {
        let mut lhs = self.parse_regex_match()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Ge => BinOp::Ge,
                TokenKind::Cmp => BinOp::Cmp,
                _ => break,
            };
            let offset = self.offset();
            self.advance();
            let rhs = self.parse_regex_match()?;
            lhs = Expression::Binop { op, lhs: Box::new(lhs), rhs: Box::new(rhs), offset };
        }
        Ok(lhs)
    }

    fn parse_regex_match(&mut self) -> PResult<Expression> {
        let lhs = self.parse_bitor()?;
        if self.check(&TokenKind::RegexMatch) || self.check(&TokenKind::RegexNotMatch) {
            let negate = self.check(&TokenKind::RegexNotMatch);
            let offset = self.offset();
            self.advance();
            let (pattern, modifiers) = self.expect_regex_literal()?;
            let m = Expression::RegexMatch { subject: Box::new(lhs), pattern, modifiers, offset };
            return Ok(if negate { Expression::Unop { op: UnOp::Not, operand: Box::new(m), offset } } else { m });
        }
        Ok(lhs)
    }

    fn expect_regex_literal(&mut self) -> PResult<(String, String)> {
        // Produced by the lexer as a StringChunk ... Regex(..) sequence for
        // the non-interpolated case; interpolated regexes are rare enough
        // in practice that we require a literal pattern here.
        if let TokenKind::StringChunk(text) = self.peek_kind() {
            self.advance();
            if let TokenKind::Regex(_, modifiers) = self.peek_kind() {
                self.advance();
                return Ok((text, modifiers));
            }
            if matches!(self.peek_kind(), TokenKind::StringEnd) {
                self.advance();
                return Ok((text, String::new()));
            }
        }
        self.error("expected regex pattern".into());
        Err(())
    }

    fn parse_bitor(&mut self) -> PResult<Expression> {
        let mut lhs = self.parse_bitxor()?;
        while self.check(&TokenKind::Pipe) && self.peek2_kind() != TokenKind::Pipe {
            let offset = self.offset();
            self.advance();
            let rhs = self.parse_bitxor()?;
            lhs = Expression::Binop { op: BinOp::BitOr, lhs: Box::new(lhs), rhs: Box::new(rhs), offset };
        }
        Ok(lhs)
    }

    fn parse_bitxor(&mut self) -> PResult<Expression> {
        let mut lhs = self.parse_bitand()?;
        while self.check(&TokenKind::Caret) {
            let offset = self.offset();
            self.advance();
            let rhs = self.parse_bitand()?;
            lhs = Expression::Binop { op: BinOp::BitXor, lhs: Box::new(lhs), rhs: Box::new(rhs), offset };
        }
        Ok(lhs)
    }

    fn parse_bitand(&mut self) -> PResult<Expression> {
        let mut lhs = self.parse_shift()?;
        while self.check(&TokenKind::Amp) && self.peek2_kind() != TokenKind::Amp {
            let offset = self.offset();
            self.advance();
            let rhs = self.parse_shift()?;
            lhs = Expression::Binop { op: BinOp::BitAnd, lhs: Box::new(lhs), rhs: Box::new(rhs), offset };
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> PResult<Expression> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Shl => BinOp::Shl,
                TokenKind::Shr => BinOp::Shr,
                TokenKind::UShr => BinOp::UShr,
                _ => break,
            };
            let offset = self.offset();
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expression::Binop { op, lhs: Box::new(lhs), rhs: Box::new(rhs), offset };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> PResult<Expression> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            let offset = self.offset();
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expression::Binop { op, lhs: Box::new(lhs), rhs: Box::new(rhs), offset };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expression> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                TokenKind::PercentPercent => BinOp::TrueMod,
                _ => break,
            };
            let offset = self.offset();
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expression::Binop { op, lhs: Box::new(lhs), rhs: Box::new(rhs), offset };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expression> {
        let offset = self.offset();
        match self.peek_kind() {
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expression::Unop { op: UnOp::Neg, operand: Box::new(operand), offset })
            }
            TokenKind::Plus => {
                self.advance();
                self.parse_unary()
            }
            TokenKind::Tilde => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expression::Unop { op: UnOp::BitNot, operand: Box::new(operand), offset })
            }
            TokenKind::Bang | TokenKind::Not => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expression::Unop { op: UnOp::Not, operand: Box::new(operand), offset })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> PResult<Expression> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::Dot | TokenKind::SafeDot => {
                    let is_safe = self.check(&TokenKind::SafeDot);
                    let offset = self.offset();
                    self.advance();
                    let field_name = match self.peek_kind() {
                        TokenKind::Identifier(n) => {
                            self.advance();
                            n
                        }
                        _ => {
                            self.error("expected field or method name after '.'".into());
                            return Err(());
                        }
                    };
                    let field = self.intern(&field_name);
                    if self.check(&TokenKind::LParen) {
                        self.advance();
                        let args = self.parse_arg_list()?;
                        self.expect(&TokenKind::RParen, "')'")?;
                        let trailing_closure = self.try_parse_trailing_closure()?;
                        expr = Expression::MethodCall { receiver: Box::new(expr), method: field, args, trailing_closure, is_safe, offset };
                    } else if let Some(closure) = self.try_parse_trailing_closure()? {
                        expr = Expression::MethodCall { receiver: Box::new(expr), method: field, args: Vec::new(), trailing_closure: Some(closure), is_safe, offset };
                    } else {
                        expr = Expression::FieldAccess { receiver: Box::new(expr), field, is_safe, offset };
                    }
                }
                TokenKind::LBracket => {
                    let offset = self.offset();
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(&TokenKind::RBracket, "']'")?;
                    expr = Expression::Index { receiver: Box::new(expr), index: Box::new(index), offset };
                }
                TokenKind::LParen if matches!(&expr, Expression::Identifier { name, .. } if self.interns.get(*name) == "checkpoint") => {
                    let offset = self.offset();
                    self.advance();
                    expr = self.parse_checkpoint_call(offset)?;
                }
                TokenKind::LParen if matches!(expr, Expression::Identifier { .. }) => {
                    let offset = self.offset();
                    self.advance();
                    let args = self.parse_arg_list()?;
                    self.expect(&TokenKind::RParen, "')'")?;
                    let trailing_closure = self.try_parse_trailing_closure()?;
                    expr = Expression::Call { callee: Box::new(expr), args, trailing_closure, offset };
                }
                TokenKind::As => {
                    let offset = self.offset();
                    self.advance();
                    let type_name = self.parse_dotted_name();
                    expr = Expression::As { value: Box::new(expr), type_name, offset };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn try_parse_trailing_closure(&mut self) -> PResult<Option<Box<Expression>>> {
        if self.check(&TokenKind::LBrace) {
            let offset = self.offset();
            self.advance();
            self.skip_newlines();
            let params = if self.looks_like_closure_params() {
                let params = self.parse_closure_param_list()?;
                self.expect(&TokenKind::Arrow, "'->'")?;
                params
            } else {
                Vec::new()
            };
            let body = self.parse_block_contents()?;
            self.expect(&TokenKind::RBrace, "'}'")?;
            Ok(Some(Box::new(Expression::ClosureLit { params, body, offset })))
        } else {
            Ok(None)
        }
    }

    /// `checkpoint(commit: {...}, recover: {...})` (`spec.md` §4.7): the
    /// only call-like form that isn't an ordinary function call — its two
    /// named arguments are immediately-evaluated blocks, not closures, so
    /// the branch not taken this run is never materialized as a callable
    /// value.
    fn parse_checkpoint_call(&mut self, offset: Offset) -> PResult<Expression> {
        let mut commit = None;
        let mut recover = None;
        self.skip_newlines();
        if !self.check(&TokenKind::RParen) {
            loop {
                self.skip_newlines();
                let name = match self.peek_kind() {
                    TokenKind::Identifier(n) => n,
                    _ => {
                        self.error("expected 'commit' or 'recover'".into());
                        return Err(());
                    }
                };
                self.advance();
                self.expect(&TokenKind::Colon, "':'")?;
                let block_offset = self.offset();
                self.expect(&TokenKind::LBrace, "'{'")?;
                let body = self.parse_block_contents()?;
                self.expect(&TokenKind::RBrace, "'}'")?;
                let block = Expression::Do { body, offset: block_offset };
                match name.as_str() {
                    "commit" => commit = Some(Box::new(block)),
                    "recover" => recover = Some(Box::new(block)),
                    other => {
                        self.error(format!("unexpected checkpoint argument '{other}'"));
                        return Err(());
                    }
                }
                self.skip_newlines();
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.expect(&TokenKind::RParen, "')'")?;
        let (Some(commit), Some(recover)) = (commit, recover) else {
            self.error("checkpoint(...) requires both 'commit' and 'recover'".into());
            return Err(());
        };
        Ok(Expression::Checkpoint { commit, recover, offset })
    }

    fn parse_arg_list(&mut self) -> PResult<Vec<Expression>> {
        let mut args = Vec::new();
        if self.check(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Expression> {
        let offset = self.offset();
        match self.peek_kind() {
            TokenKind::IntLit(v) => {
                self.advance();
                Ok(Expression::Literal { value: Literal::Int(v), offset })
            }
            TokenKind::LongLit(v) => {
                self.advance();
                Ok(Expression::Literal { value: Literal::Long(v), offset })
            }
            TokenKind::DoubleLit(v) => {
                self.advance();
                Ok(Expression::Literal { value: Literal::Double(v), offset })
            }
            TokenKind::DecimalLit(s) => {
                self.advance();
                Ok(Expression::Literal { value: Literal::Decimal(s), offset })
            }
            TokenKind::PlainString(s) => {
                self.advance();
                Ok(Expression::Literal { value: Literal::Str(s), offset })
            }
            TokenKind::StringChunk(_) => self.parse_interpolated_string(),
            TokenKind::True => {
                self.advance();
                Ok(Expression::Literal { value: Literal::Bool(true), offset })
            }
            TokenKind::False => {
                self.advance();
                Ok(Expression::Literal { value: Literal::Bool(false), offset })
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expression::Literal { value: Literal::Null, offset })
            }
            TokenKind::Identifier(name) => {
                self.advance();
                let id = self.intern(&name);
                Ok(Expression::Identifier { name: id, offset })
            }
            TokenKind::RegexCaptureVar(index) => {
                self.advance();
                Ok(Expression::MatchGroup { index, offset })
            }
            TokenKind::LParen => {
                self.advance();
                if self.looks_like_multi_assign_targets() {
                    return self.parse_multi_assign(offset);
                }
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            TokenKind::LBracket => self.parse_list_or_empty(offset),
            TokenKind::LBrace => self.parse_map_or_closure(offset),
            TokenKind::New => self.parse_new_instance(offset),
            TokenKind::Switch => {
                let (subject, arms, offset) = self.parse_switch_common()?;
                Ok(Expression::Switch { subject: Box::new(subject), arms, offset })
            }
            TokenKind::Do => {
                self.advance();
                self.skip_newlines();
                self.expect(&TokenKind::LBrace, "'{'")?;
                let body = self.parse_block_contents()?;
                self.expect(&TokenKind::RBrace, "'}'")?;
                Ok(Expression::Do { body, offset })
            }
            _ => {
                self.error(format!("unexpected token {:?}", self.peek_kind()));
                Err(())
            }
        }
    }

    fn looks_like_multi_assign_targets(&mut self) -> bool {
        // `(a, b) = expr` — detect a comma before the closing paren by
        // scanning lookahead without consuming (bounded: parameter lists in
        // Jactl are short, so a linear scan here is acceptable).
        let mut depth = 1i32;
        let mut i = 0usize;
        loop {
            self.fill(i);
            match &self.lookahead[i].kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        self.fill(i + 1);
                        return matches!(self.lookahead[i + 1].kind, TokenKind::Assign);
                    }
                }
                TokenKind::Eof => return false,
                _ => {}
            }
            i += 1;
            if i > 64 {
                return false;
            }
        }
    }

    fn parse_multi_assign(&mut self, offset: Offset) -> PResult<Expression> {
        let mut targets = vec![self.parse_expression()?];
        while self.eat(&TokenKind::Comma) {
            targets.push(self.parse_expression()?);
        }
        self.expect(&TokenKind::RParen, "')'")?;
        self.expect(&TokenKind::Assign, "'=' after multi-assign target list")?;
        let value = self.parse_expression()?;
        Ok(Expression::MultiAssign { targets, value: Box::new(value), offset })
    }

    fn parse_list_or_empty(&mut self, offset: Offset) -> PResult<Expression> {
        self.advance(); // [
        let mut elements = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RBracket) {
            elements.push(self.parse_expression()?);
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBracket, "']'")?;
        Ok(Expression::ListLit { elements, offset })
    }

    fn parse_map_or_closure(&mut self, offset: Offset) -> PResult<Expression> {
        self.advance(); // {
        self.skip_newlines();
        if self.check(&TokenKind::Colon) && self.peek2_kind() == TokenKind::RBrace {
            self.advance();
            self.advance();
            return Ok(Expression::MapLit { entries: Vec::new(), offset });
        }
        if self.check(&TokenKind::RBrace) {
            self.advance();
            return Ok(Expression::ClosureLit { params: Vec::new(), body: Vec::new(), offset });
        }
        if self.looks_like_closure_params() {
            let params = self.parse_closure_param_list()?;
            self.expect(&TokenKind::Arrow, "'->'")?;
            let body = self.parse_block_contents()?;
            self.expect(&TokenKind::RBrace, "'}'")?;
            return Ok(Expression::ClosureLit { params, body, offset });
        }
        if self.looks_like_map_entry() {
            let mut entries = Vec::new();
            loop {
                self.skip_newlines();
                let key = self.parse_map_key()?;
                self.expect(&TokenKind::Colon, "':'")?;
                let value = self.parse_expression()?;
                entries.push((key, value));
                self.skip_newlines();
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.skip_newlines();
            self.expect(&TokenKind::RBrace, "'}'")?;
            return Ok(Expression::MapLit { entries, offset });
        }
        // Implicit-parameter closure body: `{ it + 1 }`.
        let body = self.parse_block_contents()?;
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Expression::ClosureLit { params: Vec::new(), body, offset })
    }

    fn looks_like_closure_params(&mut self) -> bool {
        let mut i = 0usize;
        loop {
            self.fill(i);
            match &self.lookahead[i].kind {
                TokenKind::Identifier(_) | TokenKind::Comma => {}
                TokenKind::Arrow => return true,
                _ => return false,
            }
            i += 1;
            if i > 32 {
                return false;
            }
        }
    }

    fn looks_like_map_entry(&mut self) -> bool {
        matches!(self.peek_kind(), TokenKind::Identifier(_) | TokenKind::PlainString(_) | TokenKind::StringChunk(_))
            && matches!(self.peek2_kind(), TokenKind::Colon)
    }

    fn parse_map_key(&mut self) -> PResult<Expression> {
        let offset = self.offset();
        match self.peek_kind() {
            TokenKind::Identifier(n) => {
                self.advance();
                Ok(Expression::Literal { value: Literal::Str(n), offset })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_closure_param_list(&mut self) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        loop {
            let offset = self.offset();
            let name = match self.peek_kind() {
                TokenKind::Identifier(n) => {
                    self.advance();
                    self.intern(&n)
                }
                _ => {
                    self.error("expected closure parameter name".into());
                    return Err(());
                }
            };
            params.push(Param { name, type_name: None, default: None, offset });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn parse_new_instance(&mut self, offset: Offset) -> PResult<Expression> {
        self.advance(); // new
        let class_name = self.parse_dotted_name();
        self.expect(&TokenKind::LParen, "'('")?;
        let mut positional = Vec::new();
        let mut named = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                if let TokenKind::Identifier(n) = self.peek_kind() {
                    if self.peek2_kind() == TokenKind::Colon {
                        self.advance();
                        self.advance();
                        let id = self.intern(&n);
                        let value = self.parse_expression()?;
                        named.push((id, value));
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                        continue;
                    }
                }
                positional.push(self.parse_expression()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(Expression::NewInstance { class_name, positional, named, offset })
    }

    fn parse_switch_common(&mut self) -> PResult<(Expression, Vec<SwitchArm>, Offset)> {
        let offset = self.offset();
        self.advance(); // switch
        self.expect(&TokenKind::LParen, "'(' after 'switch'")?;
        let subject = self.parse_expression()?;
        self.expect(&TokenKind::RParen, "')'")?;
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_newlines();
        let mut arms = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            let arm_offset = self.offset();
            let pattern = self.parse_pattern()?;
            let guard = if self.eat(&TokenKind::If) {
                self.expect(&TokenKind::LParen, "'(' after guard 'if'")?;
                let g = self.parse_expression()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Some(g)
            } else {
                None
            };
            self.expect(&TokenKind::Arrow, "'->'")?;
            let body = self.parse_expression()?;
            arms.push(SwitchArm { pattern, guard, body, offset: arm_offset });
            self.skip_newlines();
            self.eat(&TokenKind::Comma);
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok((subject, arms, offset))
    }

    fn parse_pattern(&mut self) -> PResult<Pattern> {
        match self.peek_kind() {
            TokenKind::Default => {
                self.advance();
                Ok(Pattern::Wildcard)
            }
            TokenKind::Identifier(n) if n == "_" => {
                self.advance();
                Ok(Pattern::Any)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elems = Vec::new();
                while !self.check(&TokenKind::RBracket) {
                    elems.push(self.parse_pattern()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBracket, "']'")?;
                Ok(Pattern::List(elems))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.check(&TokenKind::RBrace) {
                    let key = match self.peek_kind() {
                        TokenKind::Identifier(n) => {
                            self.advance();
                            n
                        }
                        TokenKind::PlainString(s) => {
                            self.advance();
                            s
                        }
                        _ => {
                            self.error("expected map pattern key".into());
                            return Err(());
                        }
                    };
                    self.expect(&TokenKind::Colon, "':'")?;
                    let pat = self.parse_pattern()?;
                    entries.push((key, pat));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace, "'}'")?;
                Ok(Pattern::Map(entries))
            }
            TokenKind::StringChunk(_) => {
                if let TokenKind::StringChunk(text) = self.peek_kind() {
                    self.advance();
                    if let TokenKind::Regex(_, modifiers) = self.peek_kind() {
                        self.advance();
                        return Ok(Pattern::Regex { pattern: text, modifiers });
                    }
                    if matches!(self.peek_kind(), TokenKind::StringEnd) {
                        self.advance();
                        return Ok(Pattern::Literal(Expression::Literal { value: Literal::Str(text), offset: self.offset() }));
                    }
                }
                self.error("unsupported interpolated switch pattern".into());
                Err(())
            }
            TokenKind::Identifier(n) if Self::is_type_name(&n) => {
                self.advance();
                Ok(Pattern::TypeName(n))
            }
            TokenKind::Dollar => {
                self.advance();
                self.expect(&TokenKind::LBrace, "'{'")?;
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RBrace, "'}'")?;
                Ok(Pattern::Computed(expr))
            }
            _ => {
                let first = self.parse_ternary()?;
                if self.check(&TokenKind::Comma) {
                    let mut alts = vec![first];
                    while self.eat(&TokenKind::Comma) {
                        alts.push(self.parse_ternary()?);
                    }
                    return Ok(Pattern::LiteralList(alts));
                }
                if let Expression::Identifier { name, offset } = first {
                    return Ok(Pattern::Binding(name, offset));
                }
                Ok(Pattern::Literal(first))
            }
        }
    }

    fn is_type_name(s: &str) -> bool {
        matches!(s, "int" | "long" | "double" | "Decimal" | "String" | "List" | "Map" | "boolean" | "byte")
    }

    fn parse_interpolated_string(&mut self) -> PResult<Expression> {
        let offset = self.offset();
        let mut parts = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::StringChunk(s) => {
                    self.advance();
                    if !s.is_empty() {
                        parts.push(InterpPart::Literal(s));
                    }
                }
                TokenKind::ExprBegin => {
                    self.advance();
                    let expr = self.parse_expression()?;
                    self.expect(&TokenKind::ExprEnd, "'}'")?;
                    parts.push(InterpPart::Expr(expr));
                }
                TokenKind::StringEnd | TokenKind::Regex(..) => {
                    self.advance();
                    break;
                }
                _ => {
                    self.error("malformed interpolated string".into());
                    return Err(());
                }
            }
        }
        Ok(Expression::StringInterp { parts, offset })
    }
}
