//! Recursive-descent parser producing the surface AST.
//!
//! Syntax errors abort parsing. Either the lexer diagnostics or the
//! first parse error is reported, and no contract is returned.

use crate::ast::{
    BinaryOp, Block, Contract, Expr, ExprKind, FunctionDecl, Ident, Param, Stmt, StmtKind,
    StorageDecl, TypeName, UnaryOp,
};
use crate::diagnostic::{Diagnostic, Stage};
use crate::lexer::{Token, TokenKind, lex};

/// Nesting bound for blocks and expressions; deeper input is a syntax error.
const MAX_DEPTH: usize = 256;

#[derive(Debug)]
pub struct ParseResult {
    pub contract: Option<Contract>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn parse(source: &str) -> ParseResult {
    let lexed = lex(source);
    if !lexed.diagnostics.is_empty() {
        return ParseResult {
            contract: None,
            diagnostics: lexed.diagnostics,
        };
    }

    let mut parser = Parser {
        source,
        tokens: &lexed.tokens,
        position: 0,
        depth: 0,
    };
    match parser.parse_contract() {
        Ok(contract) => ParseResult {
            contract: Some(contract),
            diagnostics: Vec::new(),
        },
        Err(diag) => ParseResult {
            contract: None,
            diagnostics: vec![diag],
        },
    }
}

type PResult<T> = Result<T, Diagnostic>;

struct Parser<'a> {
    source: &'a str,
    tokens: &'a [Token],
    position: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn parse_contract(&mut self) -> PResult<Contract> {
        let start = self.expect(TokenKind::Contract, "`contract`")?.span;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LBrace, "`{`")?;

        let mut storage = Vec::new();
        let mut functions = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::Storage => storage.push(self.parse_storage()?),
                TokenKind::Function => functions.push(self.parse_function()?),
                TokenKind::RBrace => break,
                _ => return Err(self.unexpected("`storage`, `function` or `}`")),
            }
        }
        let end = self.expect(TokenKind::RBrace, "`}`")?.span;
        if self.peek().kind != TokenKind::Eof {
            return Err(self.error_here("E0104", "unexpected input after contract body"));
        }

        Ok(Contract {
            name,
            storage,
            functions,
            span: start.to(end),
        })
    }

    fn parse_storage(&mut self) -> PResult<StorageDecl> {
        let start = self.advance().span;
        let name = self.expect_ident()?;
        self.expect(TokenKind::Colon, "`:`")?;
        let ty = self.parse_type()?;
        let end = self.expect(TokenKind::Semi, "`;`")?.span;
        Ok(StorageDecl {
            name,
            ty,
            span: start.to(end),
        })
    }

    fn parse_function(&mut self) -> PResult<FunctionDecl> {
        let start = self.advance().span;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if self.peek().kind != TokenKind::RParen {
            loop {
                let name = self.expect_ident()?;
                self.expect(TokenKind::Colon, "`:`")?;
                let ty = self.parse_type()?;
                params.push(Param { name, ty });
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;

        let mut public = false;
        let mut view = false;
        loop {
            match self.peek().kind {
                TokenKind::Public => public = true,
                TokenKind::Private => public = false,
                TokenKind::View => view = true,
                _ => break,
            }
            self.advance();
        }

        let result = if self.eat(TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let body = self.parse_block()?;
        let span = start.to(body.span);
        Ok(FunctionDecl {
            name,
            params,
            result,
            public,
            view,
            body,
            span,
        })
    }

    fn parse_type(&mut self) -> PResult<TypeName> {
        match self.peek().kind {
            TokenKind::I32 => {
                self.advance();
                Ok(TypeName::I32)
            }
            TokenKind::Bool => {
                self.advance();
                Ok(TypeName::Bool)
            }
            _ => Err(self.unexpected("a type (`i32` or `bool`)")),
        }
    }

    fn parse_block(&mut self) -> PResult<Block> {
        self.enter()?;
        let start = self.expect(TokenKind::LBrace, "`{`")?.span;
        let mut stmts = Vec::new();
        while !matches!(self.peek().kind, TokenKind::RBrace | TokenKind::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        let end = self.expect(TokenKind::RBrace, "`}`")?.span;
        self.depth -= 1;
        Ok(Block {
            stmts,
            span: start.to(end),
        })
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        let start = self.peek().span;
        let kind = match self.peek().kind {
            TokenKind::Let => {
                self.advance();
                let name = self.expect_ident()?;
                let ty = if self.eat(TokenKind::Colon) {
                    Some(self.parse_type()?)
                } else {
                    None
                };
                self.expect(TokenKind::Assign, "`=`")?;
                let value = self.parse_expr()?;
                StmtKind::Let { name, ty, value }
            }
            TokenKind::If => return self.parse_if(),
            TokenKind::While => {
                self.advance();
                let cond = self.parse_paren_expr()?;
                let body = self.parse_block()?;
                let span = start.to(body.span);
                return Ok(Stmt {
                    kind: StmtKind::While { cond, body },
                    span,
                });
            }
            TokenKind::Return => {
                self.advance();
                if self.peek().kind == TokenKind::Semi {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_expr()?))
                }
            }
            TokenKind::Require => {
                self.advance();
                StmtKind::Require(self.parse_paren_expr()?)
            }
            TokenKind::Ident if self.peek_at(1).kind == TokenKind::Assign => {
                let target = self.expect_ident()?;
                self.advance();
                let value = self.parse_expr()?;
                StmtKind::Assign { target, value }
            }
            _ => StmtKind::Expr(self.parse_expr()?),
        };
        let end = self.expect(TokenKind::Semi, "`;`")?.span;
        Ok(Stmt {
            kind,
            span: start.to(end),
        })
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        self.enter()?;
        let start = self.advance().span;
        let cond = self.parse_paren_expr()?;
        let then_block = self.parse_block()?;
        let mut span = start.to(then_block.span);
        let else_block = if self.eat(TokenKind::Else) {
            let block = if self.peek().kind == TokenKind::If {
                let nested = self.parse_if()?;
                Block {
                    span: nested.span,
                    stmts: vec![nested],
                }
            } else {
                self.parse_block()?
            };
            span = span.to(block.span);
            Some(block)
        } else {
            None
        };
        self.depth -= 1;
        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then_block,
                else_block,
            },
            span,
        })
    }

    fn parse_paren_expr(&mut self) -> PResult<Expr> {
        self.expect(TokenKind::LParen, "`(`")?;
        let expr = self.parse_expr()?;
        self.expect(TokenKind::RParen, "`)`")?;
        Ok(expr)
    }

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_binary(1)
    }

    /// Precedence climbing; all binary operators are left-associative.
    fn parse_binary(&mut self, min_precedence: u8) -> PResult<Expr> {
        self.enter()?;
        let mut lhs = self.parse_unary()?;
        // Every fold puts `lhs` one level deeper in the tree.
        let mut folds = 0;
        while let Some(op) = binary_op(self.peek().kind) {
            let precedence = op.precedence();
            if precedence < min_precedence {
                break;
            }
            self.advance();
            self.enter()?;
            folds += 1;
            let rhs = self.parse_binary(precedence + 1)?;
            let span = lhs.span.to(rhs.span);
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            };
        }
        self.depth -= 1 + folds;
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.parse_primary(),
        };
        self.enter()?;
        let start = self.advance().span;
        let operand = self.parse_unary()?;
        self.depth -= 1;
        let span = start.to(operand.span);
        Ok(Expr {
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        })
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let token = *self.peek();
        match token.kind {
            TokenKind::IntLiteral => {
                self.advance();
                let digits: String = token
                    .text(self.source)
                    .chars()
                    .filter(|c| *c != '_')
                    .collect();
                let value = digits.parse::<i64>().map_err(|_| {
                    Diagnostic::error(
                        Stage::Syntax,
                        "E0102",
                        "integer literal is too large",
                        token.span,
                    )
                })?;
                Ok(Expr {
                    kind: ExprKind::Int(value),
                    span: token.span,
                })
            }
            TokenKind::BoolLiteral => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Bool(token.text(self.source) == "true"),
                    span: token.span,
                })
            }
            TokenKind::Ident => {
                let callee = self.expect_ident()?;
                if !self.eat(TokenKind::LParen) {
                    return Ok(Expr {
                        span: callee.span,
                        kind: ExprKind::Ident(callee.name),
                    });
                }
                let mut args = Vec::new();
                if self.peek().kind != TokenKind::RParen {
                    loop {
                        args.push(self.parse_expr()?);
                        if !self.eat(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                let end = self.expect(TokenKind::RParen, "`)`")?.span;
                Ok(Expr {
                    span: callee.span.to(end),
                    kind: ExprKind::Call { callee, args },
                })
            }
            TokenKind::LParen => {
                self.advance();
                let mut inner = self.parse_expr()?;
                let end = self.expect(TokenKind::RParen, "`)`")?.span;
                inner.span = token.span.to(end);
                Ok(inner)
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    // -----------------------------------------------------------------
    // Token helpers
    // -----------------------------------------------------------------

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.position + offset).min(last)]
    }

    fn advance(&mut self) -> Token {
        let token = *self.peek();
        if token.kind != TokenKind::Eof {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> PResult<Token> {
        if self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_ident(&mut self) -> PResult<Ident> {
        let token = self.expect(TokenKind::Ident, "an identifier")?;
        Ok(Ident {
            name: token.text(self.source).to_string(),
            span: token.span,
        })
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error_here("E0105", "nesting is too deep"));
        }
        Ok(())
    }

    fn unexpected(&self, expected: &str) -> Diagnostic {
        let token = self.peek();
        let found = if token.kind == TokenKind::Eof {
            "end of input".to_string()
        } else {
            format!("`{}`", token.text(self.source))
        };
        Diagnostic::error(
            Stage::Syntax,
            "E0103",
            format!("expected {expected}, found {found}"),
            token.span,
        )
    }

    fn error_here(&self, code: &'static str, message: &str) -> Diagnostic {
        Diagnostic::error(Stage::Syntax, code, message, self.peek().span)
    }
}

fn binary_op(kind: TokenKind) -> Option<BinaryOp> {
    Some(match kind {
        TokenKind::Plus => BinaryOp::Add,
        TokenKind::Minus => BinaryOp::Sub,
        TokenKind::Star => BinaryOp::Mul,
        TokenKind::Slash => BinaryOp::Div,
        TokenKind::Percent => BinaryOp::Rem,
        TokenKind::EqEq => BinaryOp::Eq,
        TokenKind::NotEq => BinaryOp::Ne,
        TokenKind::Less => BinaryOp::Lt,
        TokenKind::LessEq => BinaryOp::Le,
        TokenKind::Greater => BinaryOp::Gt,
        TokenKind::GreaterEq => BinaryOp::Ge,
        TokenKind::AndAnd => BinaryOp::And,
        TokenKind::OrOr => BinaryOp::Or,
        _ => return None,
    })
}
