//! Recursive-descent SBText parser.
//!
//! Statement level is newline-significant (blank lines are skipped at
//! statement boundaries); expression level is Pratt-style with a small
//! precedence table.  Several constructs need context to disambiguate:
//!
//! - `if <…> then` vs `if on edge bounce` — decided by the keyword after
//!   `if`.
//! - the `end` that closes an event script vs the `end` that closes its
//!   target — decided by one-token lookahead past newlines (see
//!   [`Parser::looks_like_event_end`]); the lookahead never consumes.
//! - `set [v] to (…)` vs `set x to (…)` — decided by the token after the
//!   statement keyword.
//!
//! A bare identifier followed by `(` in expression position is a hard error:
//! procedure calls are statements only.

use crate::ast::{
    BinaryOp, BuiltinReporter, CostumeDecl, EventKind, EventScript, Expr, ExprKind, ListDecl, Pos,
    Procedure, Project, Stmt, StmtKind, Target, UnaryOp, VariableDecl,
};
use crate::error::{CompileError, ParseError};
use crate::lexer::{Lexer, Token, TokenKind};

// ── Public entry points ───────────────────────────────────────────────────────

/// Tokenize and parse a full source text into a [`Project`].
pub fn parse_source(source: &str) -> Result<Project, CompileError> {
    let tokens = Lexer::new(source).tokenize()?;
    let project = Parser::new(tokens).parse_project()?;
    Ok(project)
}

// ── Parser ────────────────────────────────────────────────────────────────────

pub struct Parser {
    tokens: Vec<Token>,
    index: usize,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, index: 0 }
    }

    // ── project / targets ────────────────────────────────────────────────────

    pub fn parse_project(&mut self) -> PResult<Project> {
        self.skip_newlines();
        let pos = self.current_pos();
        let mut targets = Vec::new();
        while !self.at_end() {
            let start = self.current_pos();
            if self.match_keyword("sprite") {
                targets.push(self.parse_sprite(start)?);
            } else if self.match_keyword("stage") {
                targets.push(self.parse_stage(start)?);
            } else {
                return Err(self.error_here("Expected 'sprite' or 'stage'."));
            }
            self.skip_newlines();
        }
        if targets.is_empty() {
            return Err(ParseError::new(
                "Expected at least one 'stage' or 'sprite' block.",
                pos.line,
                pos.column,
            ));
        }
        Ok(Project { pos, targets })
    }

    fn parse_sprite(&mut self, pos: Pos) -> PResult<Target> {
        let name = self.parse_name_token()?;
        self.skip_newlines();
        self.parse_target_body(name, false, pos)
    }

    fn parse_stage(&mut self, pos: Pos) -> PResult<Target> {
        // The stage name is optional and defaults to "Stage".
        let name = if matches!(self.current().kind, TokenKind::Ident | TokenKind::Str) {
            self.parse_name_token()?
        } else {
            "Stage".to_string()
        };
        self.skip_newlines();
        self.parse_target_body(name, true, pos)
    }

    fn parse_target_body(&mut self, name: String, is_stage: bool, pos: Pos) -> PResult<Target> {
        let mut target = Target::new(pos, name, is_stage);
        loop {
            self.skip_newlines();
            if self.at_end() {
                return Err(self.error_here(&format!(
                    "Unterminated target block for '{}'. Expected 'end'.",
                    target.name
                )));
            }
            if self.match_keyword("end") {
                break;
            }
            if self.match_keyword("var") {
                let decl_pos = self.previous_pos();
                let name = self.parse_decl_name()?;
                target.variables.push(VariableDecl {
                    pos: decl_pos,
                    name,
                });
                continue;
            }
            if self.match_keyword("list") {
                let decl_pos = self.previous_pos();
                let name = self.parse_decl_name()?;
                target.lists.push(ListDecl {
                    pos: decl_pos,
                    name,
                });
                continue;
            }
            if self.match_keyword("costume") {
                let decl_pos = self.previous_pos();
                let path = self
                    .consume_kind(TokenKind::Str, "Expected costume path string.")?
                    .text;
                target.costumes.push(CostumeDecl {
                    pos: decl_pos,
                    path,
                });
                continue;
            }
            if self.match_keyword("define") {
                let def_pos = self.previous_pos();
                target.procedures.push(self.parse_procedure(def_pos)?);
                continue;
            }
            if self.match_keyword("when") {
                let when_pos = self.previous_pos();
                target.scripts.push(self.parse_event_script(when_pos)?);
                continue;
            }
            return Err(self.error_here(
                "Expected 'var', 'list', 'costume', 'define', 'when', or 'end' inside target.",
            ));
        }
        Ok(target)
    }

    /// `var score`, `var [score]`, `list [inventory]`, …  A leading `var`
    /// token inside the bracket form is stripped so `var [var score]` and
    /// `set [var score] …` agree on the name.
    fn parse_decl_name(&mut self) -> PResult<String> {
        if self.check_kind(TokenKind::LBracket) {
            self.parse_variable_field_name()
        } else {
            self.parse_name_token()
        }
    }

    // ── procedures ───────────────────────────────────────────────────────────

    fn parse_procedure(&mut self, pos: Pos) -> PResult<Procedure> {
        let name = self.parse_name_token()?;
        let mut params = Vec::new();
        while self.check_kind(TokenKind::LParen) {
            self.consume_kind(TokenKind::LParen, "Expected '('.")?;
            // `define f ()` declares a zero-parameter procedure; an empty
            // group contributes nothing.
            if self.check_kind(TokenKind::RParen) {
                self.advance();
                continue;
            }
            params.push(self.parse_name_token()?);
            self.consume_kind(TokenKind::RParen, "Expected ')' after parameter name.")?;
        }
        self.skip_newlines();
        let body = self.parse_statement_block(&["end"], false)?;
        self.consume_keyword("end", "Expected 'end' to close procedure definition.")?;
        Ok(Procedure {
            pos,
            name,
            params,
            body,
        })
    }

    // ── event scripts ────────────────────────────────────────────────────────

    fn parse_event_script(&mut self, pos: Pos) -> PResult<EventScript> {
        let kind = if self.match_keyword("flag") {
            self.consume_keyword("clicked", "Expected 'clicked' after 'when flag'.")?;
            EventKind::FlagClicked
        } else if self.match_keyword("this") {
            self.consume_keyword("sprite", "Expected 'sprite' in 'when this sprite clicked'.")?;
            self.consume_keyword("clicked", "Expected 'clicked' in 'when this sprite clicked'.")?;
            EventKind::ThisSpriteClicked
        } else if self.match_keyword("i") {
            self.consume_keyword("receive", "Expected 'receive' after 'when I'.")?;
            let message = self.parse_bracket_text()?;
            if message.is_empty() {
                return Err(self.error_here("Broadcast message cannot be empty."));
            }
            EventKind::Receive(message)
        } else {
            return Err(self.error_here("Unknown event header after 'when'."));
        };
        self.skip_newlines();
        let body =
            self.parse_statement_block(&["when", "define", "var", "list", "costume", "end"], false)?;
        // An explicit `end` after an event script is optional.  Consume it
        // only when it cannot be the target terminator.
        if self.check_keyword("end") && self.looks_like_event_end() {
            self.advance();
        }
        Ok(EventScript { pos, kind, body })
    }

    /// Decide whether an `end` at the current position closes the event
    /// script or its enclosing target: if the next significant token starts a
    /// new top-level block (or the file ends), the `end` belongs to the
    /// target.
    fn looks_like_event_end(&self) -> bool {
        let mut idx = self.index + 1;
        while idx < self.tokens.len() && self.tokens[idx].kind == TokenKind::Newline {
            idx += 1;
        }
        let Some(token) = self.tokens.get(idx) else {
            return false;
        };
        if token.kind == TokenKind::Eof {
            return false;
        }
        !(token.is_keyword("sprite") || token.is_keyword("stage"))
    }

    // ── statement blocks ─────────────────────────────────────────────────────

    fn parse_statement_block(&mut self, until: &[&str], consume_until: bool) -> PResult<Vec<Stmt>> {
        let mut statements = Vec::new();
        loop {
            self.skip_newlines();
            if self.at_end() {
                break;
            }
            let token = self.current();
            if token.kind == TokenKind::Keyword && until.contains(&token.text.as_str()) {
                if consume_until {
                    self.advance();
                }
                break;
            }
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_statement(&mut self) -> PResult<Stmt> {
        let token = self.current().clone();
        if token.kind == TokenKind::Keyword {
            return match token.text.as_str() {
                "broadcast" => self.parse_broadcast_stmt(),
                "set" => self.parse_set_stmt(),
                "change" => self.parse_change_stmt(),
                "move" => self.parse_move_stmt(),
                "turn" => self.parse_turn_stmt(),
                "go" => self.parse_go_to_stmt(),
                "point" => self.parse_point_stmt(),
                "say" => self.parse_say_like(StmtFactory::Say),
                "think" => self.parse_say_like(StmtFactory::Think),
                "show" => self.parse_simple_stmt(StmtKind::Show),
                "hide" => self.parse_simple_stmt(StmtKind::Hide),
                "next" => self.parse_next_stmt(),
                "wait" => self.parse_wait_stmt(),
                "repeat" => self.parse_repeat_stmt(),
                "forever" => self.parse_forever_stmt(),
                "if" => self.parse_if_stmt(),
                "stop" => self.parse_stop_stmt(),
                "ask" => self.parse_ask_stmt(),
                "reset" => self.parse_reset_stmt(),
                "add" => self.parse_add_to_list_stmt(),
                "delete" => self.parse_delete_stmt(),
                "insert" => self.parse_insert_stmt(),
                "replace" => self.parse_replace_stmt(),
                _ => Err(self.error_here("Unknown statement.")),
            };
        }
        if token.kind == TokenKind::Ident {
            return self.parse_call_stmt();
        }
        Err(self.error_here("Unknown statement."))
    }

    // ── individual statements ────────────────────────────────────────────────

    fn parse_broadcast_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("broadcast", "Expected 'broadcast'.")?;
        let message = self.parse_bracket_text()?;
        if message.is_empty() {
            return Err(self.error_here("Broadcast message cannot be empty."));
        }
        Ok(stmt(start, StmtKind::Broadcast { message }))
    }

    fn parse_set_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("set", "Expected 'set'.")?;
        for (axis, make) in [
            ("x", StmtFactory::SetX),
            ("y", StmtFactory::SetY),
            ("size", StmtFactory::SetSize),
        ] {
            if self.match_keyword(axis) {
                self.consume_keyword("to", &format!("Expected 'to' in 'set {axis}' statement."))?;
                let value = self.parse_wrapped_expression()?;
                return Ok(stmt(start, make.build(value)));
            }
        }
        let name = self.parse_variable_field_name()?;
        self.consume_keyword("to", "Expected 'to' in set statement.")?;
        let value = self.parse_wrapped_expression()?;
        Ok(stmt(start, StmtKind::SetVar { name, value }))
    }

    fn parse_change_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("change", "Expected 'change'.")?;
        for (axis, make) in [
            ("x", StmtFactory::ChangeX),
            ("y", StmtFactory::ChangeY),
            ("size", StmtFactory::ChangeSize),
        ] {
            if self.match_keyword(axis) {
                self.consume_keyword("by", &format!("Expected 'by' in 'change {axis}' statement."))?;
                let value = self.parse_wrapped_expression()?;
                return Ok(stmt(start, make.build(value)));
            }
        }
        let name = self.parse_variable_field_name()?;
        self.consume_keyword("by", "Expected 'by' in change statement.")?;
        let delta = self.parse_wrapped_expression()?;
        Ok(stmt(start, StmtKind::ChangeVar { name, delta }))
    }

    fn parse_move_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("move", "Expected 'move'.")?;
        let steps = self.parse_wrapped_expression()?;
        self.match_keyword("steps"); // optional
        Ok(stmt(start, StmtKind::Move { steps }))
    }

    fn parse_turn_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("turn", "Expected 'turn'.")?;
        if self.match_keyword("right") {
            let degrees = self.parse_wrapped_expression()?;
            return Ok(stmt(start, StmtKind::TurnRight { degrees }));
        }
        if self.match_keyword("left") {
            let degrees = self.parse_wrapped_expression()?;
            return Ok(stmt(start, StmtKind::TurnLeft { degrees }));
        }
        Err(self.error_here("Expected 'right' or 'left' after 'turn'."))
    }

    fn parse_go_to_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("go", "Expected 'go'.")?;
        self.consume_keyword("to", "Expected 'to' after 'go'.")?;
        self.consume_keyword("x", "Expected 'x' in 'go to x (…) y (…)'.")?;
        let x = self.parse_wrapped_expression()?;
        self.consume_keyword("y", "Expected 'y' in 'go to x (…) y (…)'.")?;
        let y = self.parse_wrapped_expression()?;
        Ok(stmt(start, StmtKind::GoToXy { x, y }))
    }

    fn parse_point_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("point", "Expected 'point'.")?;
        self.consume_keyword("in", "Expected 'in' after 'point'.")?;
        self.consume_keyword("direction", "Expected 'direction' in point statement.")?;
        let direction = self.parse_wrapped_expression()?;
        Ok(stmt(start, StmtKind::PointInDirection { direction }))
    }

    fn parse_say_like(&mut self, make: StmtFactory) -> PResult<Stmt> {
        let start = self.advance().clone();
        let message = self.parse_wrapped_expression()?;
        Ok(stmt(start, make.build(message)))
    }

    fn parse_simple_stmt(&mut self, kind: StmtKind) -> PResult<Stmt> {
        let start = self.advance().clone();
        Ok(stmt(start, kind))
    }

    fn parse_next_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("next", "Expected 'next'.")?;
        if self.match_keyword("costume") {
            return Ok(stmt(start, StmtKind::NextCostume));
        }
        if self.match_keyword("backdrop") {
            return Ok(stmt(start, StmtKind::NextBackdrop));
        }
        Err(self.error_here("Expected 'costume' or 'backdrop' after 'next'."))
    }

    fn parse_wait_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("wait", "Expected 'wait'.")?;
        let duration = self.parse_wrapped_expression()?;
        Ok(stmt(start, StmtKind::Wait { duration }))
    }

    fn parse_repeat_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("repeat", "Expected 'repeat'.")?;
        let times = self.parse_wrapped_expression()?;
        self.skip_newlines();
        let body = self.parse_statement_block(&["end"], false)?;
        self.consume_keyword("end", "Expected 'end' to close repeat block.")?;
        Ok(stmt(start, StmtKind::Repeat { times, body }))
    }

    fn parse_forever_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("forever", "Expected 'forever'.")?;
        self.skip_newlines();
        let body = self.parse_statement_block(&["end"], false)?;
        self.consume_keyword("end", "Expected 'end' to close forever block.")?;
        Ok(stmt(start, StmtKind::Forever { body }))
    }

    fn parse_if_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("if", "Expected 'if'.")?;
        // `if on edge bounce` shares the leading keyword with the if
        // statement.
        if self.match_keyword("on") {
            self.consume_keyword("edge", "Expected 'edge' in 'if on edge bounce'.")?;
            self.consume_keyword("bounce", "Expected 'bounce' in 'if on edge bounce'.")?;
            return Ok(stmt(start, StmtKind::IfOnEdgeBounce));
        }
        let mut condition_tokens = self.collect_tokens_until_keyword("then")?;
        if condition_tokens.is_empty() {
            return Err(ParseError::new(
                "Expected condition after 'if'.",
                start.line,
                start.column,
            ));
        }
        // Strip a literal `<…>` wrapper around the whole condition.
        let first_is_lt = condition_tokens[0].kind == TokenKind::Op && condition_tokens[0].text == "<";
        if first_is_lt {
            let last = condition_tokens
                .last()
                .expect("condition_tokens is non-empty");
            if !(last.kind == TokenKind::Op && last.text == ">") {
                return Err(ParseError::new(
                    "Expected condition enclosed in '<...>' before 'then'.",
                    start.line,
                    start.column,
                ));
            }
            condition_tokens = condition_tokens[1..condition_tokens.len() - 1].to_vec();
            if condition_tokens.is_empty() {
                return Err(ParseError::new(
                    "Expected condition after 'if'.",
                    start.line,
                    start.column,
                ));
            }
        }
        let condition = parse_expression_from_tokens(condition_tokens)?;
        self.consume_keyword("then", "Expected 'then' in if statement.")?;
        self.skip_newlines();
        let then_body = self.parse_statement_block(&["else", "end"], false)?;
        let else_body = if self.match_keyword("else") {
            self.skip_newlines();
            self.parse_statement_block(&["end"], false)?
        } else {
            Vec::new()
        };
        self.consume_keyword("end", "Expected 'end' to close if statement.")?;
        Ok(stmt(
            start,
            StmtKind::If {
                condition,
                then_body,
                else_body,
            },
        ))
    }

    fn parse_stop_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("stop", "Expected 'stop'.")?;
        let option = self.parse_bracket_text()?;
        if option.is_empty() {
            return Err(self.error_here("Stop option cannot be empty."));
        }
        Ok(stmt(start, StmtKind::Stop { option }))
    }

    fn parse_ask_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("ask", "Expected 'ask'.")?;
        let question = self.parse_wrapped_expression()?;
        // `and wait` suffix is optional, like `steps` after `move`.
        if self.match_keyword("and") {
            self.consume_keyword("wait", "Expected 'wait' after 'ask (…) and'.")?;
        }
        Ok(stmt(start, StmtKind::Ask { question }))
    }

    fn parse_reset_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("reset", "Expected 'reset'.")?;
        self.consume_keyword("timer", "Expected 'timer' after 'reset'.")?;
        Ok(stmt(start, StmtKind::ResetTimer))
    }

    fn parse_add_to_list_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("add", "Expected 'add'.")?;
        let item = self.parse_wrapped_expression()?;
        self.consume_keyword("to", "Expected 'to' in add statement.")?;
        let list = self.parse_list_field_name()?;
        Ok(stmt(start, StmtKind::AddToList { list, item }))
    }

    fn parse_delete_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("delete", "Expected 'delete'.")?;
        if self.match_keyword("all") {
            self.consume_keyword("of", "Expected 'of' in 'delete all of [list]'.")?;
            let list = self.parse_list_field_name()?;
            return Ok(stmt(start, StmtKind::DeleteAllOfList { list }));
        }
        let index = self.parse_wrapped_expression()?;
        self.consume_keyword("of", "Expected 'of' in delete statement.")?;
        let list = self.parse_list_field_name()?;
        Ok(stmt(start, StmtKind::DeleteOfList { list, index }))
    }

    fn parse_insert_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("insert", "Expected 'insert'.")?;
        let item = self.parse_wrapped_expression()?;
        self.consume_keyword("at", "Expected 'at' in insert statement.")?;
        let index = self.parse_wrapped_expression()?;
        self.consume_keyword("of", "Expected 'of' in insert statement.")?;
        let list = self.parse_list_field_name()?;
        Ok(stmt(start, StmtKind::InsertAtList { list, item, index }))
    }

    fn parse_replace_stmt(&mut self) -> PResult<Stmt> {
        let start = self.consume_keyword("replace", "Expected 'replace'.")?;
        self.consume_keyword("item", "Expected 'item' after 'replace'.")?;
        let index = self.parse_wrapped_expression()?;
        self.consume_keyword("of", "Expected 'of' in replace statement.")?;
        let list = self.parse_list_field_name()?;
        self.consume_keyword("with", "Expected 'with' in replace statement.")?;
        let item = self.parse_wrapped_expression()?;
        Ok(stmt(start, StmtKind::ReplaceItemOfList { list, index, item }))
    }

    fn parse_call_stmt(&mut self) -> PResult<Stmt> {
        let name_token = self.consume_kind(TokenKind::Ident, "Expected procedure name.")?;
        let mut args = Vec::new();
        while self.check_kind(TokenKind::LParen) {
            // `f ()` is a zero-argument call, mirroring `define f ()`.
            if self.peek_next().kind == TokenKind::RParen {
                self.advance();
                self.advance();
                continue;
            }
            args.push(self.parse_wrapped_expression()?);
        }
        Ok(stmt(
            name_token.clone(),
            StmtKind::Call {
                name: name_token.text,
                args,
            },
        ))
    }

    // ── expressions ──────────────────────────────────────────────────────────

    fn parse_wrapped_expression(&mut self) -> PResult<Expr> {
        self.consume_kind(TokenKind::LParen, "Expected '('.")?;
        let expr = self.parse_expression(&[TokenKind::RParen], 1)?;
        self.consume_kind(TokenKind::RParen, "Expected ')' after expression.")?;
        Ok(expr)
    }

    fn parse_expression(&mut self, stops: &[TokenKind], min_precedence: u8) -> PResult<Expr> {
        let mut left = self.parse_unary(stops)?;
        loop {
            let token = self.current();
            if stops.contains(&token.kind) {
                break;
            }
            let Some(op) = as_operator(token) else {
                break;
            };
            let precedence = op_precedence(op);
            if precedence < min_precedence {
                break;
            }
            let op_pos = self.current_pos();
            self.advance();
            let right = self.parse_expression(stops, precedence + 1)?;
            left = Expr::new(
                op_pos,
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self, stops: &[TokenKind]) -> PResult<Expr> {
        let token = self.current();
        if token.kind == TokenKind::Op && token.text == "-" {
            let pos = self.current_pos();
            self.advance();
            let operand = self.parse_unary(stops)?;
            return Ok(Expr::new(
                pos,
                ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
            ));
        }
        if token.is_keyword("not") {
            let pos = self.current_pos();
            self.advance();
            let operand = self.parse_unary(stops)?;
            return Ok(Expr::new(
                pos,
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
            ));
        }
        self.parse_primary(stops)
    }

    fn parse_primary(&mut self, stops: &[TokenKind]) -> PResult<Expr> {
        let token = self.current().clone();
        if stops.contains(&token.kind) {
            return Err(self.error_here("Expected expression."));
        }
        let pos = Pos::new(token.line, token.column);
        match token.kind {
            TokenKind::Number => {
                self.advance();
                let value: f64 = token.text.parse().map_err(|_| {
                    ParseError::new(
                        format!("Invalid number literal '{}'.", token.text),
                        pos.line,
                        pos.column,
                    )
                })?;
                Ok(Expr::new(pos, ExprKind::Number(value)))
            }
            TokenKind::Str => {
                self.advance();
                Ok(Expr::new(pos, ExprKind::Str(token.text)))
            }
            TokenKind::Ident => {
                if self.peek_next().kind == TokenKind::LParen {
                    return Err(ParseError::new(
                        format!(
                            "Procedure call '{}' cannot appear inside an expression.",
                            token.text
                        ),
                        pos.line,
                        pos.column,
                    ));
                }
                self.advance();
                Ok(Expr::new(pos, ExprKind::Var(token.text)))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression(&[TokenKind::RParen], 1)?;
                self.consume_kind(TokenKind::RParen, "Expected ')' after grouped expression.")?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                let name = self.parse_variable_field_name()?;
                // `[list] contains (item)` is a list predicate, any other
                // bracketed name in expression position is a variable read.
                if self.check_keyword("contains") {
                    self.advance();
                    let item = self.parse_wrapped_expression()?;
                    return Ok(Expr::new(
                        pos,
                        ExprKind::ListContains {
                            list: name,
                            item: Box::new(item),
                        },
                    ));
                }
                Ok(Expr::new(pos, ExprKind::Var(name)))
            }
            TokenKind::Keyword => self.parse_keyword_reporter(&token, pos),
            _ => Err(self.error_here("Expected expression.")),
        }
    }

    fn parse_keyword_reporter(&mut self, token: &Token, pos: Pos) -> PResult<Expr> {
        match token.text.as_str() {
            "pick" => {
                self.advance();
                self.consume_keyword("random", "Expected 'random' after 'pick'.")?;
                let from = self.parse_wrapped_expression()?;
                self.consume_keyword("to", "Expected 'to' in 'pick random (…) to (…)'.")?;
                let to = self.parse_wrapped_expression()?;
                Ok(Expr::new(
                    pos,
                    ExprKind::PickRandom {
                        from: Box::new(from),
                        to: Box::new(to),
                    },
                ))
            }
            "item" => {
                self.advance();
                let index = self.parse_wrapped_expression()?;
                self.consume_keyword("of", "Expected 'of' in 'item (…) of [list]'.")?;
                let list = self.parse_list_field_name()?;
                Ok(Expr::new(
                    pos,
                    ExprKind::ListItem {
                        list,
                        index: Box::new(index),
                    },
                ))
            }
            "length" => {
                self.advance();
                self.consume_keyword("of", "Expected 'of' in 'length of [list]'.")?;
                let list = self.parse_list_field_name()?;
                Ok(Expr::new(pos, ExprKind::ListLength { list }))
            }
            "key" => {
                self.advance();
                let key = self.parse_wrapped_expression()?;
                self.consume_pressed_marker()?;
                Ok(Expr::new(pos, ExprKind::KeyPressed { key: Box::new(key) }))
            }
            "answer" => {
                self.advance();
                Ok(Expr::new(pos, ExprKind::Builtin(BuiltinReporter::Answer)))
            }
            "mouse" => {
                self.advance();
                if self.match_keyword("x") {
                    Ok(Expr::new(pos, ExprKind::Builtin(BuiltinReporter::MouseX)))
                } else if self.match_keyword("y") {
                    Ok(Expr::new(pos, ExprKind::Builtin(BuiltinReporter::MouseY)))
                } else {
                    Err(self.error_here("Expected 'x' or 'y' after 'mouse'."))
                }
            }
            "timer" => {
                self.advance();
                Ok(Expr::new(pos, ExprKind::Builtin(BuiltinReporter::Timer)))
            }
            _ => Err(self.error_here("Expected expression.")),
        }
    }

    /// The trailing marker of `key (…) pressed?`.  The lexer produces either
    /// the keyword `pressed` or an identifier `pressed?` depending on whether
    /// the source used the question mark.
    fn consume_pressed_marker(&mut self) -> PResult<()> {
        let token = self.current();
        let matches_marker = token.is_keyword("pressed")
            || (token.kind == TokenKind::Ident && token.text.eq_ignore_ascii_case("pressed?"));
        if matches_marker {
            self.advance();
            Ok(())
        } else {
            Err(self.error_here("Expected 'pressed?' after key expression."))
        }
    }

    // ── bracketed names ──────────────────────────────────────────────────────

    /// `[…]` naming a variable; a leading `var` token is stripped.
    fn parse_variable_field_name(&mut self) -> PResult<String> {
        let contents = self.parse_bracket_tokens()?;
        if contents.is_empty() {
            return Err(self.error_here("Variable name cannot be empty."));
        }
        let mut parts: Vec<&str> = contents.iter().map(|t| t.text.as_str()).collect();
        if parts[0].eq_ignore_ascii_case("var") {
            parts.remove(0);
        }
        let name = parts.join(" ").trim().to_string();
        if name.is_empty() {
            return Err(self.error_here("Variable name cannot be empty."));
        }
        Ok(name)
    }

    /// `[…]` naming a list.
    fn parse_list_field_name(&mut self) -> PResult<String> {
        let name = self.parse_bracket_text()?;
        if name.is_empty() {
            return Err(self.error_here("List name cannot be empty."));
        }
        Ok(name)
    }

    /// `[…]` as free text: the space-joined token lexemes.
    fn parse_bracket_text(&mut self) -> PResult<String> {
        let contents = self.parse_bracket_tokens()?;
        let text = contents
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(text.trim().to_string())
    }

    fn parse_bracket_tokens(&mut self) -> PResult<Vec<Token>> {
        self.consume_kind(TokenKind::LBracket, "Expected '['.")?;
        let mut tokens = Vec::new();
        while !self.at_end() && !self.check_kind(TokenKind::RBracket) {
            if self.check_kind(TokenKind::Newline) {
                return Err(self.error_here("Unexpected newline in bracket expression."));
            }
            tokens.push(self.advance().clone());
        }
        self.consume_kind(TokenKind::RBracket, "Expected ']'.")?;
        Ok(tokens)
    }

    // ── condition collection ─────────────────────────────────────────────────

    /// Collect tokens until `keyword` appears at paren depth 0 and bracket
    /// depth 0.  Unbalanced delimiters are reported at the current position.
    fn collect_tokens_until_keyword(&mut self, keyword: &str) -> PResult<Vec<Token>> {
        let mut out = Vec::new();
        let mut depth_paren = 0i32;
        let mut depth_bracket = 0i32;
        while !self.at_end() {
            let token = self.current();
            if token.is_keyword(keyword) && depth_paren == 0 && depth_bracket == 0 {
                break;
            }
            match token.kind {
                TokenKind::LParen => depth_paren += 1,
                TokenKind::RParen => depth_paren -= 1,
                TokenKind::LBracket => depth_bracket += 1,
                TokenKind::RBracket => depth_bracket -= 1,
                _ => {}
            }
            out.push(self.advance().clone());
        }
        if depth_paren != 0 || depth_bracket != 0 {
            return Err(self.error_here("Unbalanced delimiters while reading condition."));
        }
        Ok(out)
    }

    // ── token stream helpers ─────────────────────────────────────────────────

    fn current(&self) -> &Token {
        &self.tokens[self.index]
    }

    fn current_pos(&self) -> Pos {
        let t = self.current();
        Pos::new(t.line, t.column)
    }

    fn previous_pos(&self) -> Pos {
        let t = &self.tokens[self.index - 1];
        Pos::new(t.line, t.column)
    }

    fn peek_next(&self) -> &Token {
        self.tokens
            .get(self.index + 1)
            .unwrap_or_else(|| self.tokens.last().expect("token stream ends with Eof"))
    }

    fn advance(&mut self) -> &Token {
        self.index += 1;
        &self.tokens[self.index - 1]
    }

    fn at_end(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn check_kind(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn check_keyword(&self, value: &str) -> bool {
        self.current().is_keyword(value)
    }

    fn match_keyword(&mut self, value: &str) -> bool {
        if self.check_keyword(value) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume_keyword(&mut self, value: &str, message: &str) -> PResult<Token> {
        if self.check_keyword(value) {
            Ok(self.advance().clone())
        } else {
            Err(self.error_here(message))
        }
    }

    fn consume_kind(&mut self, kind: TokenKind, message: &str) -> PResult<Token> {
        if self.check_kind(kind) {
            Ok(self.advance().clone())
        } else {
            Err(self.error_here(message))
        }
    }

    /// A sprite/stage name: a bare identifier or a quoted string.
    fn parse_name_token(&mut self) -> PResult<String> {
        let token = self.current();
        if matches!(token.kind, TokenKind::Ident | TokenKind::Str) {
            return Ok(self.advance().text.clone());
        }
        Err(self.error_here("Expected name."))
    }

    fn skip_newlines(&mut self) {
        while self.check_kind(TokenKind::Newline) {
            self.advance();
        }
    }

    fn error_here(&self, message: &str) -> ParseError {
        let token = self.current();
        ParseError::new(message, token.line, token.column)
    }
}

// ── helpers ───────────────────────────────────────────────────────────────────

fn stmt(start: Token, kind: StmtKind) -> Stmt {
    Stmt {
        pos: Pos::new(start.line, start.column),
        kind,
    }
}

/// Re-parse a collected token slice (an `if` condition) as one expression.
fn parse_expression_from_tokens(tokens: Vec<Token>) -> PResult<Expr> {
    let last = tokens.last().expect("caller checked non-empty").clone();
    let mut synthetic = tokens;
    synthetic.push(Token {
        kind: TokenKind::Eof,
        text: String::new(),
        line: last.line,
        column: last.column,
    });
    let mut parser = Parser::new(synthetic);
    let expr = parser.parse_expression(&[TokenKind::Eof], 1)?;
    parser.consume_kind(TokenKind::Eof, "Unexpected trailing tokens in expression.")?;
    Ok(expr)
}

fn as_operator(token: &Token) -> Option<BinaryOp> {
    match token.kind {
        TokenKind::Op => match token.text.as_str() {
            "+" => Some(BinaryOp::Add),
            "-" => Some(BinaryOp::Sub),
            "*" => Some(BinaryOp::Mul),
            "/" => Some(BinaryOp::Div),
            "%" => Some(BinaryOp::Mod),
            "<" => Some(BinaryOp::Lt),
            "<=" => Some(BinaryOp::Le),
            ">" => Some(BinaryOp::Gt),
            ">=" => Some(BinaryOp::Ge),
            "=" | "==" => Some(BinaryOp::Eq),
            "!=" => Some(BinaryOp::Ne),
            _ => None,
        },
        TokenKind::Keyword => match token.text.as_str() {
            "and" => Some(BinaryOp::And),
            "or" => Some(BinaryOp::Or),
            _ => None,
        },
        _ => None,
    }
}

fn op_precedence(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Or => 1,
        BinaryOp::And => 2,
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            3
        }
        BinaryOp::Add | BinaryOp::Sub => 4,
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 5,
    }
}

/// Shared constructor for the statement families whose shape only differs
/// in the produced [`StmtKind`] (`set x/y/size`, `change x/y/size`,
/// `say`/`think`).
#[derive(Clone, Copy)]
enum StmtFactory {
    Say,
    Think,
    SetX,
    SetY,
    SetSize,
    ChangeX,
    ChangeY,
    ChangeSize,
}

impl StmtFactory {
    fn build(self, value: Expr) -> StmtKind {
        match self {
            StmtFactory::Say => StmtKind::Say { message: value },
            StmtFactory::Think => StmtKind::Think { message: value },
            StmtFactory::SetX => StmtKind::SetX { value },
            StmtFactory::SetY => StmtKind::SetY { value },
            StmtFactory::SetSize => StmtKind::SetSize { value },
            StmtFactory::ChangeX => StmtKind::ChangeX { value },
            StmtFactory::ChangeY => StmtKind::ChangeY { value },
            StmtFactory::ChangeSize => StmtKind::ChangeSize { value },
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
