//! The single-pass parser (component C6): turns a token stream straight
//! into three-address code, with no intermediate AST. Control structures
//! are compiled through a small backpatch stack — a conditional or loop
//! emits its test with a placeholder jump target, keeps the instruction
//! index around, and rewrites the operand in place once the matching
//! `end`/`else` token is seen.
//!
//! Every open scope (the top level, or a `function ... end function` body)
//! gets its own instruction buffer and its own temp-register counter, so a
//! nested function's numbering doesn't collide with its enclosing one's.

use std::cell::RefCell;
use std::rc::Rc;

use miniscript_core::value::{FunctionValue, MsMap};
use miniscript_core::{Error, Line, Location, Opcode, Param, Result, Value};

use crate::lexer::Lexer;
use crate::token::{Token, TokenType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Else,
    ElseIf,
    EndIf,
    EndWhile,
    EndFor,
    EndFunction,
    Eof,
}

struct LoopMarks {
    continue_target: usize,
    break_jumps: Vec<usize>,
}

struct Scope {
    lines: Vec<Line>,
    next_temp: usize,
    loops: Vec<LoopMarks>,
}

impl Scope {
    fn new() -> Self {
        Scope {
            lines: Vec::new(),
            next_temp: 0,
            loops: Vec::new(),
        }
    }
}

/// The result of compiling one chunk of source. `incomplete` is set instead
/// of an error when input ended with a block (`if`, `while`, `for`,
/// `function`) still open — the REPL uses this to keep reading lines
/// rather than reporting a syntax error; a file compile treats it as one.
pub struct ParseOutcome {
    pub lines: Vec<Line>,
    pub incomplete: bool,
    /// Set alongside `incomplete` to the innermost still-open opener keyword
    /// and the line one past the end of input — what a non-REPL (file)
    /// compile reports as the unmatched-block error.
    pub unmatched: Option<(&'static str, usize)>,
}

pub struct Parser {
    lexer: Lexer,
    context_name: String,
    scopes: Vec<Scope>,
    incomplete: bool,
    /// Every currently-open `if`/`while`/`for`/`function` block, in the
    /// order opened, with the 1-based line its opening keyword sat on.
    /// Popped on a matching `end ...`; whatever remains when input runs out
    /// is what "unmatched-block detection" reports.
    open_blocks: Vec<(&'static str, usize)>,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        Parser {
            lexer: Lexer::new(source),
            context_name: String::new(),
            scopes: Vec::new(),
            incomplete: false,
            open_blocks: Vec::new(),
        }
    }

    /// Compile `source` as one complete program (or REPL chunk) in a single
    /// call. `context_name` is attached to every emitted line's source
    /// location.
    pub fn parse_source(source: &str, context_name: &str) -> Result<ParseOutcome> {
        Parser::new(source).parse_program(context_name)
    }

    pub fn parse_program(mut self, context_name: &str) -> Result<ParseOutcome> {
        tracing::debug!(context = %context_name, "parsing program");
        self.context_name = context_name.to_string();
        self.scopes.push(Scope::new());
        self.parse_block(&[Marker::Eof])?;
        if self.incomplete {
            tracing::debug!(context = %context_name, "parse incomplete, awaiting more input");
            let eof_line = self.peek().line;
            let unmatched = self.open_blocks.last().map(|(kw, _)| (*kw, eof_line));
            return Ok(ParseOutcome { lines: Vec::new(), incomplete: true, unmatched });
        }
        let scope = self.scopes.pop().expect("top-level scope");
        tracing::debug!(context = %context_name, lines = scope.lines.len(), "parse complete");
        Ok(ParseOutcome { lines: scope.lines, incomplete: false, unmatched: None })
    }

    // ---- token helpers ----------------------------------------------

    fn advance(&mut self) -> Token {
        self.lexer.dequeue()
    }

    fn peek(&self) -> Token {
        self.lexer.peek()
    }

    fn peek_is(&self, kind: TokenType) -> bool {
        self.peek().kind == kind
    }

    fn peek_is_keyword(&self, text: &str) -> bool {
        let t = self.peek();
        t.kind == TokenType::Keyword && t.text == text
    }

    fn expect(&mut self, kind: TokenType) -> Result<Token> {
        let t = self.peek();
        if t.kind == kind {
            Ok(self.advance())
        } else {
            Err(Error::compile(format!("expected {kind:?}, found {}", describe(&t))))
        }
    }

    fn expect_keyword(&mut self, text: &str) -> Result<()> {
        if self.peek_is_keyword(text) {
            self.advance();
            Ok(())
        } else {
            Err(Error::compile(format!("expected '{text}', found {}", describe(&self.peek()))))
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        let t = self.expect(TokenType::Identifier)?;
        Ok(t.text)
    }

    fn at_eol(&self) -> bool {
        matches!(self.peek().kind, TokenType::Eol | TokenType::Eof)
    }

    fn skip_eols(&mut self) {
        while self.peek_is(TokenType::Eol) {
            self.advance();
        }
    }

    /// Required after a simple statement: a newline, `;`, end of input, or
    /// (leniently) a following block-closing keyword on the same line.
    fn expect_statement_end(&mut self) -> Result<()> {
        match self.peek().kind {
            TokenType::Eol => {
                self.advance();
                Ok(())
            }
            TokenType::Eof => Ok(()),
            TokenType::Keyword if matches!(self.peek().text.as_str(), "else" | "end") => Ok(()),
            _ => Err(Error::compile(format!("expected end of line, found {}", describe(&self.peek())))),
        }
    }

    // ---- emission helpers ---------------------------------------------

    fn scope_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("at least one open scope")
    }

    fn next_line_index(&self) -> usize {
        self.scopes.last().expect("at least one open scope").lines.len()
    }

    fn new_temp(&mut self) -> Value {
        let scope = self.scope_mut();
        let t = scope.next_temp;
        scope.next_temp += 1;
        Value::Temp(t)
    }

    fn emit(&mut self, line: Line) -> usize {
        let source_line = self.peek().line;
        let located = line.with_location(Location::new(self.context_name.clone(), source_line));
        let scope = self.scope_mut();
        scope.lines.push(located);
        scope.lines.len() - 1
    }

    fn emit_cond_jump(&mut self, op: Opcode, cond: Value) -> usize {
        self.emit(Line::new(None, op, Some(Value::Number(-1.0)), Some(cond)))
    }

    fn emit_jump(&mut self) -> usize {
        self.emit(Line::new(None, Opcode::GotoA, Some(Value::Number(-1.0)), None))
    }

    fn patch_target(&mut self, idx: usize, target: usize) {
        self.scope_mut().lines[idx].rhs_a = Some(Value::Number(target as f64));
    }

    // ---- block-marker recognition --------------------------------------

    /// Recognizes (and, if matched, consumes) a two-word block-closing
    /// marker. The lexer hands these over word-at-a-time; the parser is
    /// what glues `else if`/`end if`/`end while`/... back together.
    fn try_match_marker(&mut self) -> Option<Marker> {
        let t0 = self.peek();
        if t0.kind != TokenType::Keyword {
            return None;
        }
        match t0.text.as_str() {
            "else" => {
                let t1 = self.lexer.peek_ahead(1);
                if t1.kind == TokenType::Keyword && t1.text == "if" {
                    self.advance();
                    self.advance();
                    Some(Marker::ElseIf)
                } else {
                    self.advance();
                    Some(Marker::Else)
                }
            }
            "end" => {
                let t1 = self.lexer.peek_ahead(1);
                if t1.kind != TokenType::Keyword {
                    return None;
                }
                let marker = match t1.text.as_str() {
                    "if" => Marker::EndIf,
                    "while" => Marker::EndWhile,
                    "for" => Marker::EndFor,
                    "function" => Marker::EndFunction,
                    _ => return None,
                };
                self.advance();
                self.advance();
                Some(marker)
            }
            _ => None,
        }
    }

    /// Parses statements until a marker in `stops` is found (and consumes
    /// it), or input runs out. Running out of input when `Eof` isn't an
    /// accepted stop sets `self.incomplete` rather than erroring.
    fn parse_block(&mut self, stops: &[Marker]) -> Result<Marker> {
        tracing::trace!(context = %self.context_name, stops = ?stops, "entering block");
        loop {
            self.skip_eols();
            if self.peek_is(TokenType::Eof) {
                if stops.contains(&Marker::Eof) {
                    return Ok(Marker::Eof);
                }
                self.incomplete = true;
                return Ok(Marker::Eof);
            }
            if let Some(m) = self.try_match_marker() {
                if stops.contains(&m) {
                    return Ok(m);
                }
                return Err(Error::compile(format!("unexpected '{}'", marker_text(m))));
            }
            self.parse_statement()?;
            if self.incomplete {
                return Ok(Marker::Eof);
            }
        }
    }

    // ---- statements -----------------------------------------------------

    fn parse_statement(&mut self) -> Result<()> {
        let tok = self.peek();
        if tok.kind == TokenType::Keyword {
            match tok.text.as_str() {
                "if" => return self.parse_if(),
                "while" => return self.parse_while(),
                "for" => return self.parse_for(),
                "return" => return self.parse_return(),
                "break" => return self.parse_break(),
                "continue" => return self.parse_continue(),
                _ => {}
            }
        }
        self.parse_simple_statement()
    }

    fn parse_simple_statement(&mut self) -> Result<()> {
        let lhs_candidate = self.parse_expression()?;
        if self.peek_is(TokenType::OpAssign) {
            self.advance();
            let rhs = self.parse_expression()?;
            match &lhs_candidate {
                Value::Var(_, _) | Value::SeqElem(_, _, _) => {
                    self.emit(Line::new(Some(lhs_candidate), Opcode::AssignA, Some(rhs), None));
                }
                _ => return Err(Error::compile("invalid assignment target")),
            }
        } else if is_callable_head(&lhs_candidate) && self.can_start_parenless_call_args() {
            let result = self.parse_parenless_call(lhs_candidate)?;
            self.emit(Line::new(None, Opcode::AssignImplicit, Some(result), None));
        } else {
            self.emit(Line::new(None, Opcode::AssignImplicit, Some(lhs_candidate), None));
        }
        self.expect_statement_end()
    }

    /// Whether the current token could begin a parenless-call argument —
    /// i.e. the start of a brand new expression rather than an operator
    /// that would already have been consumed while parsing `lhs_candidate`
    /// (binary operators loop-match inside the precedence chain regardless
    /// of spacing, so if one were next it would already be gone).
    fn can_start_parenless_call_args(&self) -> bool {
        let t = self.peek();
        match t.kind {
            TokenType::Identifier
            | TokenType::Number
            | TokenType::String
            | TokenType::LParen
            | TokenType::LSquare
            | TokenType::LCurly
            | TokenType::AddressOf => true,
            TokenType::Keyword => matches!(t.text.as_str(), "null" | "true" | "false" | "function" | "new" | "not"),
            _ => false,
        }
    }

    /// A MiniScript call statement needs no parentheses around its argument
    /// list: `print x` is sugar for `print(x)`, and `foo a, b` for
    /// `foo(a, b)`. Each argument is a full expression, so `print "ab" * 3 +
    /// "c"` still binds `*`/`+` before the call happens.
    fn parse_parenless_call(&mut self, callee: Value) -> Result<Value> {
        let mut args = vec![self.parse_expression()?];
        while self.peek_is(TokenType::Comma) {
            self.advance();
            args.push(self.parse_expression()?);
        }
        for a in args {
            self.emit(Line::new(None, Opcode::PushParam, Some(a), None));
        }
        let t = self.new_temp();
        self.emit(Line::new(Some(t.clone()), Opcode::CallFunctionA, Some(callee), None));
        Ok(t)
    }

    fn parse_return(&mut self) -> Result<()> {
        self.expect_keyword("return")?;
        let value = if self.at_eol() { None } else { Some(self.parse_expression()?) };
        self.emit(Line::new(None, Opcode::ReturnA, value, None));
        self.expect_statement_end()
    }

    fn parse_break(&mut self) -> Result<()> {
        self.expect_keyword("break")?;
        let idx = self.emit_jump();
        let scope = self.scope_mut();
        match scope.loops.last_mut() {
            Some(lm) => lm.break_jumps.push(idx),
            None => return Err(Error::compile("'break' outside of a loop")),
        }
        self.expect_statement_end()
    }

    fn parse_continue(&mut self) -> Result<()> {
        self.expect_keyword("continue")?;
        let target = {
            let scope = self.scopes.last().expect("open scope");
            match scope.loops.last() {
                Some(lm) => lm.continue_target,
                None => return Err(Error::compile("'continue' outside of a loop")),
            }
        };
        self.emit(Line::new(None, Opcode::GotoA, Some(Value::Number(target as f64)), None));
        self.expect_statement_end()
    }

    fn parse_if(&mut self) -> Result<()> {
        let open_line = self.peek().line;
        self.expect_keyword("if")?;
        let cond = self.parse_expression()?;
        self.expect_keyword("then")?;

        if self.at_eol() {
            self.open_blocks.push(("if", open_line));
            self.skip_eols();
            let mut false_jump = Some(self.emit_cond_jump(Opcode::GotoAifNotB, cond));
            let mut end_jumps = Vec::new();
            let mut seen_else = false;
            loop {
                let stops: &[Marker] = if seen_else {
                    &[Marker::EndIf]
                } else {
                    &[Marker::Else, Marker::ElseIf, Marker::EndIf]
                };
                let marker = self.parse_block(stops)?;
                if self.incomplete {
                    return Ok(());
                }
                match marker {
                    Marker::ElseIf => {
                        end_jumps.push(self.emit_jump());
                        if let Some(fj) = false_jump.take() {
                            let target = self.next_line_index();
                            self.patch_target(fj, target);
                        }
                        let cond2 = self.parse_expression()?;
                        self.expect_keyword("then")?;
                        self.skip_eols();
                        false_jump = Some(self.emit_cond_jump(Opcode::GotoAifNotB, cond2));
                    }
                    Marker::Else => {
                        end_jumps.push(self.emit_jump());
                        if let Some(fj) = false_jump.take() {
                            let target = self.next_line_index();
                            self.patch_target(fj, target);
                        }
                        self.skip_eols();
                        seen_else = true;
                    }
                    Marker::EndIf => {
                        if let Some(fj) = false_jump.take() {
                            let target = self.next_line_index();
                            self.patch_target(fj, target);
                        }
                        let end_target = self.next_line_index();
                        for ej in end_jumps {
                            self.patch_target(ej, end_target);
                        }
                        self.open_blocks.pop();
                        break;
                    }
                    _ => unreachable!("parse_block only returns a requested stop"),
                }
            }
            Ok(())
        } else {
            let false_jump = self.emit_cond_jump(Opcode::GotoAifNotB, cond);
            self.parse_statement()?;
            if self.peek_is_keyword("else") {
                self.advance();
                let end_jump = self.emit_jump();
                let else_target = self.next_line_index();
                self.patch_target(false_jump, else_target);
                self.parse_statement()?;
                let end_target = self.next_line_index();
                self.patch_target(end_jump, end_target);
            } else {
                let end_target = self.next_line_index();
                self.patch_target(false_jump, end_target);
            }
            Ok(())
        }
    }

    fn parse_while(&mut self) -> Result<()> {
        let open_line = self.peek().line;
        self.expect_keyword("while")?;
        let cond_start = self.next_line_index();
        let cond = self.parse_expression()?;
        self.expect_statement_end()?;
        let false_jump = self.emit_cond_jump(Opcode::GotoAifNotB, cond);

        self.open_blocks.push(("while", open_line));
        self.scope_mut().loops.push(LoopMarks { continue_target: cond_start, break_jumps: Vec::new() });
        let marker = self.parse_block(&[Marker::EndWhile])?;
        if self.incomplete {
            return Ok(());
        }
        debug_assert!(matches!(marker, Marker::EndWhile));
        self.open_blocks.pop();

        self.emit(Line::new(None, Opcode::GotoA, Some(Value::Number(cond_start as f64)), None));
        let end_target = self.next_line_index();
        self.patch_target(false_jump, end_target);
        let lm = self.scope_mut().loops.pop().expect("loop marker pushed above");
        for bj in lm.break_jumps {
            self.patch_target(bj, end_target);
        }
        Ok(())
    }

    fn parse_for(&mut self) -> Result<()> {
        let open_line = self.peek().line;
        self.expect_keyword("for")?;
        let var_name = self.expect_identifier()?;
        self.expect_keyword("in")?;
        let seq_expr = self.parse_expression()?;
        self.expect_statement_end()?;

        let seq_temp = self.new_temp();
        self.emit(Line::new(Some(seq_temp.clone()), Opcode::AssignA, Some(seq_expr), None));
        let idx_temp = self.new_temp();
        self.emit(Line::new(Some(idx_temp.clone()), Opcode::AssignA, Some(Value::Number(0.0)), None));

        let cond_start = self.next_line_index();
        let len_temp = self.new_temp();
        self.emit(Line::new(Some(len_temp.clone()), Opcode::LengthOfA, Some(seq_temp.clone()), None));
        let cmp_temp = self.new_temp();
        self.emit(Line::new(Some(cmp_temp.clone()), Opcode::ALessThanB, Some(idx_temp.clone()), Some(len_temp)));
        let false_jump = self.emit_cond_jump(Opcode::GotoAifNotB, cmp_temp);

        let item_temp = self.new_temp();
        self.emit(Line::new(Some(item_temp.clone()), Opcode::ElemBofIterA, Some(seq_temp.clone()), Some(idx_temp.clone())));
        self.emit(Line::new(
            Some(Value::Var(Rc::from(var_name.as_str()), false)),
            Opcode::AssignA,
            Some(item_temp),
            None,
        ));

        self.open_blocks.push(("for", open_line));
        self.scope_mut().loops.push(LoopMarks { continue_target: cond_start, break_jumps: Vec::new() });
        let marker = self.parse_block(&[Marker::EndFor])?;
        if self.incomplete {
            return Ok(());
        }
        debug_assert!(matches!(marker, Marker::EndFor));
        self.open_blocks.pop();

        self.emit(Line::new(Some(idx_temp.clone()), Opcode::APlusB, Some(idx_temp), Some(Value::Number(1.0))));
        self.emit(Line::new(None, Opcode::GotoA, Some(Value::Number(cond_start as f64)), None));

        let end_target = self.next_line_index();
        self.patch_target(false_jump, end_target);
        let lm = self.scope_mut().loops.pop().expect("loop marker pushed above");
        for bj in lm.break_jumps {
            self.patch_target(bj, end_target);
        }
        Ok(())
    }

    // ---- expressions, low to high precedence -----------------------------
    //
    // or > and > not > comparison (chained) > isa > additive > multiplicative
    // > unary minus > power > postfix > primary.

    fn parse_expression(&mut self) -> Result<Value> {
        self.parse_or()
    }

    /// Short-circuit `or` (§4.6): each operand, once evaluated, is tested
    /// with `GotoAifTrulyB` (integer-truthy, so a merely fuzzy-positive
    /// intermediate does not short-circuit) against the accumulated value;
    /// a hit skips evaluating every later operand — and their side
    /// effects — and jumps straight to a `set-to-1` line. Falling through
    /// without ever testing true still combines operands via the real
    /// `AOrB` fuzzy-or, so an all-fuzzy chain keeps its fuzzy value.
    fn parse_or(&mut self) -> Result<Value> {
        let mut val = self.parse_and()?;
        let mut jumps_to_true = Vec::new();
        while self.peek_is_keyword("or") {
            self.advance();
            jumps_to_true.push(self.emit_cond_jump(Opcode::GotoAifTrulyB, val.clone()));
            let right = self.parse_and()?;
            let t = self.new_temp();
            self.emit(Line::new(Some(t.clone()), Opcode::AOrB, Some(val), Some(right)));
            val = t;
        }
        if !jumps_to_true.is_empty() {
            let skip = self.emit_jump();
            let true_target = self.next_line_index();
            self.emit(Line::new(Some(val.clone()), Opcode::AssignA, Some(Value::Number(1.0)), None));
            let end_target = self.next_line_index();
            self.patch_target(skip, end_target);
            for j in jumps_to_true {
                self.patch_target(j, true_target);
            }
        }
        Ok(val)
    }

    /// Short-circuit `and` (§4.6), symmetric to `parse_or`: `GotoAifNotB`
    /// (any non-zero truth) tests the accumulated value after each operand;
    /// a falsy hit skips the rest and jumps to a `set-to-0` line, otherwise
    /// operands combine via the real `AAndB` fuzzy-and.
    fn parse_and(&mut self) -> Result<Value> {
        let mut val = self.parse_not()?;
        let mut jumps_to_false = Vec::new();
        while self.peek_is_keyword("and") {
            self.advance();
            jumps_to_false.push(self.emit_cond_jump(Opcode::GotoAifNotB, val.clone()));
            let right = self.parse_not()?;
            let t = self.new_temp();
            self.emit(Line::new(Some(t.clone()), Opcode::AAndB, Some(val), Some(right)));
            val = t;
        }
        if !jumps_to_false.is_empty() {
            let skip = self.emit_jump();
            let false_target = self.next_line_index();
            self.emit(Line::new(Some(val.clone()), Opcode::AssignA, Some(Value::Number(0.0)), None));
            let end_target = self.next_line_index();
            self.patch_target(skip, end_target);
            for j in jumps_to_false {
                self.patch_target(j, false_target);
            }
        }
        Ok(val)
    }

    fn parse_not(&mut self) -> Result<Value> {
        if self.peek_is_keyword("not") {
            self.advance();
            let operand = self.parse_not()?;
            let t = self.new_temp();
            self.emit(Line::new(Some(t.clone()), Opcode::NotA, Some(operand), None));
            Ok(t)
        } else {
            self.parse_comparison()
        }
    }

    fn comparison_opcode(&self) -> Option<Opcode> {
        match self.peek().kind {
            TokenType::OpEqual => Some(Opcode::AEqualB),
            TokenType::OpNotEqual => Some(Opcode::ANotEqualB),
            TokenType::OpGreater => Some(Opcode::AGreaterThanB),
            TokenType::OpGreatEqual => Some(Opcode::AGreatOrEqualB),
            TokenType::OpLesser => Some(Opcode::ALessThanB),
            TokenType::OpLessEqual => Some(Opcode::ALessOrEqualB),
            _ => None,
        }
    }

    /// Chained comparisons (`a < b < c`) lower to an `and` of each adjacent
    /// pairwise test, matching the mathematical reading rather than
    /// left-to-right boolean chaining of the raw comparison results.
    fn parse_comparison(&mut self) -> Result<Value> {
        let mut left = self.parse_isa()?;
        let mut chain: Option<Value> = None;
        loop {
            let Some(op) = self.comparison_opcode() else { break };
            self.advance();
            let right = self.parse_isa()?;
            let t = self.new_temp();
            self.emit(Line::new(Some(t.clone()), op, Some(left), Some(right.clone())));
            chain = Some(match chain {
                None => t,
                Some(prev) => {
                    let at = self.new_temp();
                    self.emit(Line::new(Some(at.clone()), Opcode::AAndB, Some(prev), Some(t)));
                    at
                }
            });
            left = right;
        }
        Ok(chain.unwrap_or(left))
    }

    fn parse_isa(&mut self) -> Result<Value> {
        let mut left = self.parse_additive()?;
        while self.peek_is_keyword("isa") {
            self.advance();
            let right = self.parse_additive()?;
            let t = self.new_temp();
            self.emit(Line::new(Some(t.clone()), Opcode::AisaB, Some(left), Some(right)));
            left = t;
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Value> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenType::OpPlus => Opcode::APlusB,
                TokenType::OpMinus => Opcode::AMinusB,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            let t = self.new_temp();
            self.emit(Line::new(Some(t.clone()), op, Some(left), Some(right)));
            left = t;
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Value> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenType::OpTimes => Opcode::ATimesB,
                TokenType::OpDivide => Opcode::ADividedByB,
                TokenType::OpMod => Opcode::AModB,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            let t = self.new_temp();
            self.emit(Line::new(Some(t.clone()), op, Some(left), Some(right)));
            left = t;
        }
        Ok(left)
    }

    /// Unary minus on a literal number folds directly into a negative
    /// constant rather than emitting a `0 - x` subtraction.
    fn parse_unary(&mut self) -> Result<Value> {
        if self.peek_is(TokenType::OpMinus) {
            self.advance();
            let operand = self.parse_unary()?;
            if let Value::Number(n) = operand {
                return Ok(Value::Number(-n));
            }
            let t = self.new_temp();
            self.emit(Line::new(Some(t.clone()), Opcode::AMinusB, Some(Value::Number(0.0)), Some(operand)));
            Ok(t)
        } else {
            self.parse_power()
        }
    }

    fn parse_power(&mut self) -> Result<Value> {
        let base = self.parse_addr_of()?;
        if self.peek_is(TokenType::OpPower) {
            self.advance();
            let exponent = self.parse_unary()?;
            let t = self.new_temp();
            self.emit(Line::new(Some(t.clone()), Opcode::APowB, Some(base), Some(exponent)));
            Ok(t)
        } else {
            Ok(base)
        }
    }

    /// `@name`/`@obj.method` suppresses the no-parens auto-invoke rule,
    /// yielding the function itself.
    fn parse_addr_of(&mut self) -> Result<Value> {
        if self.peek_is(TokenType::AddressOf) {
            self.advance();
            let v = self.parse_postfix()?;
            Ok(set_no_invoke(v))
        } else {
            self.parse_postfix()
        }
    }

    /// A `.`/`[`/`(` only continues the current postfix chain when it
    /// directly abuts the preceding token. A space before it ends the chain
    /// instead — this is what lets a bare call like `print x` or
    /// `print [1,2]` distinguish "start a new parenless-call argument" from
    /// "index/call into what was just parsed", using the same whitespace
    /// rule the lexer already records via `after_space`.
    fn parse_postfix(&mut self) -> Result<Value> {
        let mut base = self.parse_primary()?;
        loop {
            let tok = self.peek();
            if tok.after_space {
                break;
            }
            match tok.kind {
                TokenType::Dot => {
                    self.advance();
                    let name = self.expect_identifier()?;
                    base = Value::SeqElem(Box::new(base), Box::new(Value::string(name)), false);
                }
                TokenType::LSquare => {
                    self.advance();
                    base = self.parse_index_or_slice(base)?;
                }
                TokenType::LParen => {
                    self.advance();
                    base = self.parse_call(base)?;
                }
                _ => break,
            }
        }
        Ok(base)
    }

    fn parse_index_or_slice(&mut self, base: Value) -> Result<Value> {
        if self.peek_is(TokenType::Colon) {
            self.advance();
            let to = if self.peek_is(TokenType::RSquare) { None } else { Some(self.parse_expression()?) };
            self.expect(TokenType::RSquare)?;
            return Ok(self.emit_slice_call(base, None, to));
        }
        let first = self.parse_expression()?;
        if self.peek_is(TokenType::Colon) {
            self.advance();
            let to = if self.peek_is(TokenType::RSquare) { None } else { Some(self.parse_expression()?) };
            self.expect(TokenType::RSquare)?;
            Ok(self.emit_slice_call(base, Some(first), to))
        } else {
            self.expect(TokenType::RSquare)?;
            Ok(Value::SeqElem(Box::new(base), Box::new(first), false))
        }
    }

    /// `seq[a:b]` sugars to a call of the `slice` intrinsic/global, so it
    /// rides the same `CallFunctionA` machinery as any other call instead
    /// of needing a dedicated opcode.
    fn emit_slice_call(&mut self, seq: Value, from: Option<Value>, to: Option<Value>) -> Value {
        self.emit(Line::new(None, Opcode::PushParam, Some(seq), None));
        self.emit(Line::new(None, Opcode::PushParam, Some(from.unwrap_or(Value::Null)), None));
        self.emit(Line::new(None, Opcode::PushParam, Some(to.unwrap_or(Value::Null)), None));
        let t = self.new_temp();
        self.emit(Line::new(Some(t.clone()), Opcode::CallFunctionA, Some(Value::Var(Rc::from("slice"), false)), None));
        t
    }

    fn parse_call(&mut self, callee: Value) -> Result<Value> {
        let mut args = Vec::new();
        if !self.peek_is(TokenType::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if self.peek_is(TokenType::Comma) {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect(TokenType::RParen)?;
        for a in args {
            self.emit(Line::new(None, Opcode::PushParam, Some(a), None));
        }
        let t = self.new_temp();
        self.emit(Line::new(Some(t.clone()), Opcode::CallFunctionA, Some(callee), None));
        Ok(t)
    }

    fn parse_primary(&mut self) -> Result<Value> {
        let tok = self.peek();
        match tok.kind {
            TokenType::Number => {
                self.advance();
                let n: f64 = tok.text.parse().map_err(|_| Error::compile(format!("invalid number literal '{}'", tok.text)))?;
                Ok(Value::Number(n))
            }
            TokenType::String => {
                self.advance();
                Ok(Value::string(tok.text))
            }
            TokenType::Identifier => {
                self.advance();
                Ok(Value::Var(Rc::from(tok.text.as_str()), false))
            }
            TokenType::LParen => {
                self.advance();
                let v = self.parse_expression()?;
                self.expect(TokenType::RParen)?;
                Ok(v)
            }
            TokenType::LSquare => self.parse_list_literal(),
            TokenType::LCurly => self.parse_map_literal(),
            TokenType::Keyword => match tok.text.as_str() {
                "null" => {
                    self.advance();
                    Ok(Value::Null)
                }
                "true" => {
                    self.advance();
                    Ok(Value::Number(1.0))
                }
                "false" => {
                    self.advance();
                    Ok(Value::Number(0.0))
                }
                "function" => self.parse_function_literal(),
                "new" => {
                    self.advance();
                    let proto = self.parse_postfix()?;
                    let mut m = MsMap::new();
                    m.set_isa(proto);
                    let blueprint = Value::map(m);
                    let t = self.new_temp();
                    self.emit(Line::new(Some(t.clone()), Opcode::CopyA, Some(blueprint), None));
                    Ok(t)
                }
                other => Err(Error::compile(format!("unexpected keyword '{other}'"))),
            },
            _ => Err(Error::compile(format!("unexpected token {}", describe(&tok)))),
        }
    }

    fn parse_list_literal(&mut self) -> Result<Value> {
        self.expect(TokenType::LSquare)?;
        self.skip_eols();
        let mut items = Vec::new();
        if !self.peek_is(TokenType::RSquare) {
            loop {
                self.skip_eols();
                items.push(self.parse_expression()?);
                self.skip_eols();
                if self.peek_is(TokenType::Comma) {
                    self.advance();
                    self.skip_eols();
                    continue;
                }
                break;
            }
        }
        self.skip_eols();
        self.expect(TokenType::RSquare)?;
        let blueprint = Value::list(items);
        let t = self.new_temp();
        self.emit(Line::new(Some(t.clone()), Opcode::CopyA, Some(blueprint), None));
        Ok(t)
    }

    fn parse_map_literal(&mut self) -> Result<Value> {
        self.expect(TokenType::LCurly)?;
        self.skip_eols();
        let mut m = MsMap::new();
        if !self.peek_is(TokenType::RCurly) {
            loop {
                self.skip_eols();
                let key = self.parse_expression()?;
                self.expect(TokenType::Colon)?;
                self.skip_eols();
                let value = self.parse_expression()?;
                m.set(key, value);
                self.skip_eols();
                if self.peek_is(TokenType::Comma) {
                    self.advance();
                    self.skip_eols();
                    continue;
                }
                break;
            }
        }
        self.skip_eols();
        self.expect(TokenType::RCurly)?;
        let blueprint = Value::map(m);
        let t = self.new_temp();
        self.emit(Line::new(Some(t.clone()), Opcode::CopyA, Some(blueprint), None));
        Ok(t)
    }

    /// A parameter default must already be a concrete value at parse time
    /// (there's no machine running yet to evaluate an arbitrary
    /// expression), so only literals are accepted.
    fn parse_literal_value(&mut self) -> Result<Value> {
        let negate = if self.peek_is(TokenType::OpMinus) {
            self.advance();
            true
        } else {
            false
        };
        let tok = self.peek();
        let v = match tok.kind {
            TokenType::Number => {
                self.advance();
                Value::Number(tok.text.parse().map_err(|_| Error::compile(format!("invalid number literal '{}'", tok.text)))?)
            }
            TokenType::String => {
                self.advance();
                Value::string(tok.text)
            }
            TokenType::Keyword if tok.text == "null" => {
                self.advance();
                Value::Null
            }
            TokenType::Keyword if tok.text == "true" => {
                self.advance();
                Value::Number(1.0)
            }
            TokenType::Keyword if tok.text == "false" => {
                self.advance();
                Value::Number(0.0)
            }
            _ => return Err(Error::compile("default parameter value must be a literal")),
        };
        Ok(if negate {
            match v {
                Value::Number(n) => Value::Number(-n),
                other => other,
            }
        } else {
            v
        })
    }

    fn parse_function_literal(&mut self) -> Result<Value> {
        let open_line = self.peek().line;
        self.expect_keyword("function")?;
        let mut params = Vec::new();
        if self.peek_is(TokenType::LParen) {
            self.advance();
            if !self.peek_is(TokenType::RParen) {
                loop {
                    let name = self.expect_identifier()?;
                    let default = if self.peek_is(TokenType::OpAssign) {
                        self.advance();
                        Some(self.parse_literal_value()?)
                    } else {
                        None
                    };
                    params.push(Param { name: Rc::from(name.as_str()), default });
                    if self.peek_is(TokenType::Comma) {
                        self.advance();
                        continue;
                    }
                    break;
                }
            }
            self.expect(TokenType::RParen)?;
        }
        self.expect_statement_end()?;

        self.open_blocks.push(("function", open_line));
        self.scopes.push(Scope::new());
        let marker = self.parse_block(&[Marker::EndFunction])?;
        let body = self.scopes.pop().expect("function scope pushed above");
        if self.incomplete {
            // Discard: the whole outer parse is incomplete and about to
            // unwind; there's no valid function value to produce.
            return Ok(Value::Null);
        }
        self.open_blocks.pop();
        debug_assert!(matches!(marker, Marker::EndFunction));

        let fv = FunctionValue {
            params,
            code: Rc::new(RefCell::new(body.lines)),
            outer_vars: RefCell::new(None),
        };
        let func = Value::Function(Rc::new(fv));
        let t = self.new_temp();
        self.emit(Line::new(Some(t.clone()), Opcode::BindAssignA, Some(func), None));
        Ok(t)
    }
}

/// Only a bare name or dot/index chain that hasn't suppressed auto-invoke
/// (i.e. wasn't written with `@`) can head a parenless call — a call result
/// or literal can't have more arguments tacked onto it this way.
fn is_callable_head(v: &Value) -> bool {
    matches!(v, Value::Var(_, false) | Value::SeqElem(_, _, false))
}

fn set_no_invoke(v: Value) -> Value {
    match v {
        Value::Var(name, _) => Value::Var(name, true),
        Value::SeqElem(seq, idx, _) => Value::SeqElem(seq, idx, true),
        other => other,
    }
}

fn marker_text(m: Marker) -> &'static str {
    match m {
        Marker::Else => "else",
        Marker::ElseIf => "else if",
        Marker::EndIf => "end if",
        Marker::EndWhile => "end while",
        Marker::EndFor => "end for",
        Marker::EndFunction => "end function",
        Marker::Eof => "end of input",
    }
}

fn describe(t: &Token) -> String {
    if t.kind == TokenType::Eof {
        "end of input".to_string()
    } else {
        format!("'{}'", t.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> Vec<Line> {
        Parser::parse_source(src, "<test>").expect("parse should succeed").lines
    }

    #[test]
    fn simple_assignment_emits_one_line() {
        let lines = compile("x = 1 + 2\n");
        assert!(lines.iter().any(|l| l.op == Opcode::APlusB));
        assert!(lines.iter().any(|l| l.op == Opcode::AssignA));
    }

    #[test]
    fn if_else_patches_both_branches() {
        let lines = compile("if x then\n  y = 1\nelse\n  y = 2\nend if\n");
        let gotos = lines.iter().filter(|l| l.op == Opcode::GotoA).count();
        assert_eq!(gotos, 1);
        let cond_jumps = lines.iter().filter(|l| l.op == Opcode::GotoAifNotB).count();
        assert_eq!(cond_jumps, 1);
    }

    #[test]
    fn while_loop_jumps_back_to_condition() {
        let lines = compile("while x\n  x = x - 1\nend while\n");
        let back_jump = lines.iter().find(|l| l.op == Opcode::GotoA).unwrap();
        assert_eq!(back_jump.rhs_a, Some(Value::Number(0.0)));
    }

    #[test]
    fn for_loop_emits_iteration_machinery() {
        let lines = compile("for x in items\n  print(x)\nend for\n");
        assert!(lines.iter().any(|l| l.op == Opcode::ElemBofIterA));
        assert!(lines.iter().any(|l| l.op == Opcode::LengthOfA));
    }

    #[test]
    fn unclosed_block_is_reported_incomplete() {
        let outcome = Parser::parse_source("if x then\n  y = 1\n", "<test>").unwrap();
        assert!(outcome.incomplete);
        assert_eq!(outcome.unmatched.map(|(kw, _)| kw), Some("if"));
    }

    #[test]
    fn unmatched_opener_names_the_innermost_open_block() {
        let outcome = Parser::parse_source("for x in items\n  while x\n    y = 1\n", "<test>").unwrap();
        assert!(outcome.incomplete);
        assert_eq!(outcome.unmatched.map(|(kw, _)| kw), Some("while"));
    }

    #[test]
    fn chained_comparison_lowers_to_and() {
        let lines = compile("z = 1 < 2 < 3\n");
        assert!(lines.iter().any(|l| l.op == Opcode::ALessThanB));
        assert!(lines.iter().any(|l| l.op == Opcode::AAndB));
    }

    #[test]
    fn function_literal_binds_closure() {
        let lines = compile("f = function(x)\n  return x\nend function\n");
        assert!(lines.iter().any(|l| l.op == Opcode::BindAssignA));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let err = Parser::parse_source("break\n", "<test>").unwrap_err();
        assert_eq!(err.message(), "'break' outside of a loop");
    }
}
