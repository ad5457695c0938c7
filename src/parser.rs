/*
Copyright 2025 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::Arc;

use anyhow::Result;
use bytes::{Buf, Bytes};
use memchr::memchr;
use parking_lot::Mutex;

use crate::{
    context::Context,
    expr::{ParseExprOpt, Value, parse_expr, parse_expr_impl, parse_expr_impl_ext},
    loc::Loc,
    stmt::{
        AssignDirective, AssignOp, AssignStmt, CommandStmt, CondOp, CondStmt, ExportStmt,
        IncludeStmt, ParseErrorStmt, RuleSep, RuleStmt, Stmt, StmtList,
    },
    strutil::{
        find_end_of_line, find_outside_paren, trim_left_space, trim_right_space, trim_space,
    },
    symtab::Symbol,
    warn_loc,
};

/// An open `define` whose body is still being collected.
struct DefineBlock {
    name: Bytes,
    nest: i32,
    body_start: Option<usize>,
    start_line: i32,
}

/// An open conditional. `elif_extra` counts conditionals opened by
/// `else ifeq`-style chains on top of this one; `endif` closes them all.
struct CondFrame {
    stmt: Arc<CondStmt>,
    in_else: bool,
    elif_extra: i32,
}

struct Parser<'a> {
    ctx: &'a mut Context,
    buf: Bytes,
    // Byte offset of the line being handled.
    offset: usize,
    loc: Loc,
    fixed_lineno: bool,

    // Whether the previous line was a rule or a bare expression (an
    // expression can expand into a rule, so tab lines after one are
    // commands).
    after_rule: bool,

    top: StmtList,
    conds: Vec<CondFrame>,
    pending_elif: i32,
    define: Option<DefineBlock>,

    // The line as read, before directive prefixes were stripped.
    raw_line: Bytes,
    directive: Option<AssignDirective>,
}

fn directive_word(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .position(|c| matches!(c, b' ' | b'\t' | b'#'))
        .unwrap_or(line.len());
    &line[..end]
}

fn strip_line_comment(line: &[u8]) -> &[u8] {
    match find_outside_paren(line, b"#") {
        Some(idx) => &line[..idx],
        None => line,
    }
}

impl<'a> Parser<'a> {
    fn new(
        ctx: &'a mut Context,
        buf: &Bytes,
        loc: Loc,
        top: StmtList,
        fixed_lineno: bool,
    ) -> Self {
        Self {
            ctx,
            buf: buf.clone(),
            offset: 0,
            loc,
            fixed_lineno,
            after_rule: false,
            top,
            conds: Vec::new(),
            pending_elif: 0,
            define: None,
            raw_line: Bytes::new(),
            directive: None,
        }
    }

    /// Where new statements go: the innermost open conditional branch, or
    /// the top level.
    fn sink(&self) -> StmtList {
        match self.conds.last() {
            None => self.top.clone(),
            Some(frame) if frame.in_else => frame.stmt.false_stmts.clone(),
            Some(frame) => frame.stmt.true_stmts.clone(),
        }
    }

    fn emit(&mut self, stmt: Stmt) {
        self.sink().lock().push(stmt);
    }

    /// Records a syntax problem as a sentinel that fails only if evaluated.
    fn syntax_error(&mut self, msg: String) {
        let stmt = ParseErrorStmt::new(self.loc, msg);
        self.emit(stmt);
    }

    fn run(&mut self) -> Result<()> {
        while self.offset < self.buf.len() {
            let eol = find_end_of_line(&self.buf.slice(self.offset..));
            let line_end = self.offset + eol.line.len();
            if !self.fixed_lineno {
                self.loc.line += 1;
            }
            let mut line = eol.line;
            if line.ends_with(b"\r") {
                line.truncate(line.len() - 1);
            }
            self.raw_line = line.clone();
            self.handle_line(line)?;
            if !self.fixed_lineno {
                self.loc.line += eol.lf_cnt - 1;
            }
            if line_end == self.buf.len() {
                break;
            }
            self.offset = line_end + 1;
        }

        // Unterminated blocks fail even if no branch would have run, so the
        // sentinel goes to the top-level list.
        if !self.conds.is_empty() {
            self.loc.line += 1;
            self.top
                .lock()
                .push(ParseErrorStmt::new(self.loc, "*** missing `endif'.".to_string()));
        } else if let Some(define) = &self.define {
            self.loc.line = define.start_line;
            self.top.lock().push(ParseErrorStmt::new(
                self.loc,
                "*** missing `endef', unterminated `define'.".to_string(),
            ));
        }

        Ok(())
    }

    fn handle_line(&mut self, line: Bytes) -> Result<()> {
        if self.define.is_some() {
            return self.collect_define_line(line);
        }

        if line.is_empty() || &*line == b"\r" {
            return Ok(());
        }

        self.directive = None;

        if line.starts_with(b"\t") && self.after_rule {
            let mut expr_loc = self.loc;
            let expr = parse_expr(
                self.ctx,
                &mut expr_loc,
                line.slice(1..),
                ParseExprOpt::Command,
            )?;
            let stmt = CommandStmt::new(self.loc, line, expr);
            self.emit(stmt);
            return Ok(());
        }

        let line = line.slice_ref(trim_left_space(&line));

        if line.starts_with(b"#") {
            return Ok(());
        }

        if self.dispatch_directive(&line)? {
            return Ok(());
        }

        self.parse_rule_or_assign(line)
    }

    fn dispatch_directive(&mut self, line: &Bytes) -> Result<bool> {
        let word = directive_word(line);
        let rest = line.slice_ref(trim_right_space(strip_line_comment(trim_left_space(
            &line[word.len()..],
        ))));
        match word {
            b"include" | b"-include" | b"sinclude" => {
                self.parse_include(rest, word[0] == b'i')?
            }
            b"define" => self.open_define(rest)?,
            b"ifdef" | b"ifndef" | b"ifeq" | b"ifneq" => self.parse_cond(rest, word)?,
            b"else" => self.parse_else(rest)?,
            b"endif" => self.parse_endif(rest)?,
            b"override" => self.parse_override(rest)?,
            b"export" => self.parse_export(rest)?,
            b"unexport" => self.emit_export(&rest, false)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    // Line classification: the first unnested `:`, `=` or `;` decides
    // between a rule and an assignment.
    fn parse_rule_or_assign(&mut self, line: Bytes) -> Result<()> {
        match find_outside_paren(&line, b":=;") {
            None => self.parse_rule(line, None),
            Some(idx) => match line[idx] {
                b';' => self.parse_rule(line, None),
                b'=' => self.parse_assign(line, idx),
                b':' if line[idx + 1..].starts_with(b"=") => self.parse_assign(line, idx + 1),
                b':' => self.parse_rule(line, Some(idx)),
                _ => unreachable!(),
            },
        }
    }

    fn parse_rule(&mut self, line: Bytes, mut sep: Option<usize>) -> Result<()> {
        let mut line = line;
        if self.directive.is_some() {
            if self.in_export() {
                // `export foo: bar` only exports; the rule part is dropped.
                return Ok(());
            }
            // Keep the directive keywords as part of the rule text.
            if let Some(sep) = sep.as_mut() {
                *sep += self.raw_line.len() - line.len()
            }
            line = self.raw_line.clone();
        }

        line = line.slice_ref(trim_left_space(&line));
        if line.is_empty() {
            return Ok(());
        }

        if self.raw_line.starts_with(b"\t") {
            self.syntax_error("*** commands commence before first target.".to_string());
            return Ok(());
        }

        let loc = self.loc;
        let mut expr_loc = self.loc;
        let after_targets = sep.map(|idx| idx + 1).unwrap_or(0);

        let (lhs, sep_kind, rhs) =
            match find_outside_paren(&line[after_targets..], b"=;").map(|i| i + after_targets) {
                None => {
                    let lhs = parse_expr(self.ctx, &mut expr_loc, line, ParseExprOpt::Normal)?;
                    (lhs, RuleSep::Null, None)
                }
                Some(mut found) => {
                    let lhs = parse_expr(
                        self.ctx,
                        &mut expr_loc,
                        line.slice_ref(trim_space(&line[..found])),
                        ParseExprOpt::Normal,
                    )?;
                    let sep_kind = if line[found] == b';' {
                        RuleSep::Semicolon
                    } else if line[found..].starts_with(b"=$=") {
                        found += 2;
                        RuleSep::FinalEq
                    } else {
                        RuleSep::Eq
                    };
                    let opt = if sep_kind == RuleSep::Semicolon {
                        ParseExprOpt::Command
                    } else {
                        ParseExprOpt::Normal
                    };
                    let rhs = parse_expr(
                        self.ctx,
                        &mut expr_loc,
                        line.slice_ref(trim_left_space(&line[found + 1..])),
                        opt,
                    )?;
                    (lhs, sep_kind, Some(rhs))
                }
            };

        self.after_rule = true;
        let stmt = RuleStmt::new(loc, lhs, sep_kind, rhs);
        self.emit(stmt);
        Ok(())
    }

    fn parse_assign(&mut self, line: Bytes, separator_pos: usize) -> Result<()> {
        if separator_pos == 0 {
            self.syntax_error("*** empty variable name ***".to_string());
            return Ok(());
        }
        let mut assign = parse_assign_statement(&line, separator_pos);

        // `X := $= v` is a final assignment: the value becomes readonly,
        // as if followed by `.KATI_READONLY := X`.
        let is_final = assign.rhs.starts_with(b"$=");
        if is_final {
            assign.rhs = trim_left_space(&assign.rhs[2..]);
        }

        let loc = self.loc;
        let mut expr_loc = self.loc;
        let lhs = parse_expr(
            self.ctx,
            &mut expr_loc,
            line.slice_ref(assign.lhs),
            ParseExprOpt::Normal,
        )?;
        let orig_rhs = line.slice_ref(assign.rhs);
        let rhs = parse_expr(self.ctx, &mut expr_loc, orig_rhs.clone(), ParseExprOpt::Normal)?;

        self.after_rule = false;
        let stmt = AssignStmt::new(loc, lhs, rhs, orig_rhs, assign.op, self.directive, is_final);
        self.emit(stmt);
        Ok(())
    }

    fn parse_include(&mut self, line: Bytes, should_exist: bool) -> Result<()> {
        let loc = self.loc;
        let mut expr_loc = self.loc;
        let expr = parse_expr(self.ctx, &mut expr_loc, line, ParseExprOpt::Normal)?;
        let stmt = IncludeStmt::new(loc, expr, should_exist);
        self.emit(stmt);
        self.after_rule = false;
        Ok(())
    }

    fn open_define(&mut self, name: Bytes) -> Result<()> {
        if name.is_empty() {
            self.syntax_error("*** empty variable name.".to_string());
            return Ok(());
        }
        self.define = Some(DefineBlock {
            name,
            nest: 1,
            body_start: None,
            start_line: self.loc.line,
        });
        self.after_rule = false;
        Ok(())
    }

    fn collect_define_line(&mut self, line: Bytes) -> Result<()> {
        let trimmed = line.slice_ref(trim_left_space(&line));
        let word = directive_word(&trimmed);
        {
            let define = self.define.as_mut().unwrap();
            if word == b"define" {
                define.nest += 1;
            } else if word == b"endef" {
                define.nest -= 1;
            }
            if define.nest > 0 {
                if define.body_start.is_none() {
                    define.body_start = Some(self.offset);
                }
                return Ok(());
            }
        }

        let tail = trim_right_space(strip_line_comment(trim_left_space(
            &trimmed["endef".len()..],
        )));
        if !tail.is_empty() {
            warn_loc!(
                &*self.ctx,
                Some(&self.loc),
                "extraneous text after `endef' directive"
            );
        }

        let define = self.define.take().unwrap();
        let loc = Loc::new(self.loc.filename, define.start_line);
        let mut expr_loc = loc;
        let lhs = parse_expr(self.ctx, &mut expr_loc, define.name, ParseExprOpt::Normal)?;
        expr_loc.line += 1;
        let orig_rhs = match define.body_start {
            Some(start) => self.buf.slice(start..self.offset - 1),
            None => Bytes::new(),
        };
        let rhs = parse_expr(self.ctx, &mut expr_loc, orig_rhs.clone(), ParseExprOpt::Define)?;

        let stmt = AssignStmt::new(loc, lhs, rhs, orig_rhs, AssignOp::Eq, self.directive, false);
        self.emit(stmt);
        Ok(())
    }

    fn open_cond(&mut self, stmt: Arc<CondStmt>) {
        self.emit(Stmt::Cond(stmt.clone()));
        self.conds.push(CondFrame {
            stmt,
            in_else: false,
            elif_extra: self.pending_elif,
        });
    }

    fn parse_cond(&mut self, rest: Bytes, word: &[u8]) -> Result<()> {
        match word {
            b"ifdef" | b"ifndef" => {
                let op = if word == b"ifndef" {
                    CondOp::Ifndef
                } else {
                    CondOp::Ifdef
                };
                let mut expr_loc = self.loc;
                let lhs = parse_expr(self.ctx, &mut expr_loc, rest, ParseExprOpt::Normal)?;
                let stmt = CondStmt::new(self.loc, op, lhs, None);
                self.open_cond(stmt);
            }
            _ => {
                let op = if word == b"ifneq" {
                    CondOp::Ifneq
                } else {
                    CondOp::Ifeq
                };
                self.parse_ifeq(rest, op)?;
            }
        }
        Ok(())
    }

    fn parse_ifeq(&mut self, mut line: Bytes, op: CondOp) -> Result<()> {
        let loc = self.loc;
        let mut expr_loc = self.loc;

        let comparands = if line.first() == Some(&b'(') && line.last() == Some(&b')') {
            // ifeq (lhs,rhs)
            line = line.slice(1..line.len() - 1);
            let (n, lhs) = parse_expr_impl(
                self.ctx,
                &mut expr_loc,
                line.clone(),
                Some(b","),
                ParseExprOpt::Normal,
                true,
            )?;
            line.advance(n);
            if line.first() != Some(&b',') {
                None
            } else {
                line = line.slice_ref(trim_left_space(&line[1..]));
                let (n, rhs) = parse_expr_impl_ext(
                    self.ctx,
                    &mut expr_loc,
                    line.clone(),
                    None,
                    ParseExprOpt::Normal,
                    false,
                    true,
                )?;
                line = line.slice_ref(trim_left_space(&line[n.min(line.len())..]));
                Some((lhs, rhs))
            }
        } else {
            // ifeq "lhs" "rhs" (also with single quotes)
            match self.quoted_comparand(&line) {
                Some((lhs, rest)) => match self.quoted_comparand(&rest) {
                    Some((rhs, rest)) => {
                        line = rest;
                        Some((lhs, rhs))
                    }
                    None => None,
                },
                None => None,
            }
        };

        let Some((lhs, rhs)) = comparands else {
            self.syntax_error("*** invalid syntax in conditional.".to_string());
            return Ok(());
        };

        if !line.is_empty() {
            warn_loc!(
                &*self.ctx,
                Some(&self.loc),
                "extraneous text after `ifeq' directive"
            )
        }

        let stmt = CondStmt::new(loc, op, lhs, Some(rhs));
        self.open_cond(stmt);
        Ok(())
    }

    // One quoted comparand; returns the expression and the remainder after
    // the close quote.
    fn quoted_comparand(&mut self, line: &Bytes) -> Option<(Arc<Value>, Bytes)> {
        let quote = *line.first()?;
        if quote != b'\'' && quote != b'"' {
            return None;
        }
        let close = memchr(quote, &line[1..])?;
        let mut expr_loc = self.loc;
        let expr = parse_expr(
            self.ctx,
            &mut expr_loc,
            line.slice(1..close + 1),
            ParseExprOpt::Normal,
        )
        .ok()?;
        let rest = line.slice_ref(trim_left_space(&line[close + 2..]));
        Some((expr, rest))
    }

    fn parse_else(&mut self, line: Bytes) -> Result<()> {
        let Some(state) = self.conds.last().map(|f| (f.in_else, f.elif_extra)) else {
            self.syntax_error("*** extraneous `else'.".to_string());
            return Ok(());
        };
        let (in_else, elif_extra) = state;
        if in_else {
            self.syntax_error("*** only one `else' per conditional.".to_string());
            return Ok(());
        }
        self.conds.last_mut().unwrap().in_else = true;

        let chained = trim_left_space(&line);
        if chained.is_empty() {
            return Ok(());
        }

        // `else ifeq ...` opens a nested conditional that the matching
        // `endif` also closes.
        self.pending_elif = elif_extra + 1;
        let chained = line.slice_ref(chained);
        let word = directive_word(&chained);
        if matches!(word, b"ifdef" | b"ifndef" | b"ifeq" | b"ifneq") {
            let rest = chained.slice_ref(trim_right_space(strip_line_comment(trim_left_space(
                &chained[word.len()..],
            ))));
            self.parse_cond(rest, word)?;
        } else {
            warn_loc!(
                &*self.ctx,
                Some(&self.loc),
                "extraneous text after `else' directive"
            );
        }
        self.pending_elif = 0;
        Ok(())
    }

    fn parse_endif(&mut self, line: Bytes) -> Result<()> {
        let Some(to_close) = self.conds.last().map(|f| f.elif_extra + 1) else {
            self.syntax_error("*** extraneous `endif'.".to_string());
            return Ok(());
        };
        if !line.is_empty() {
            self.syntax_error("extraneous text after `endif` directive".to_string());
            return Ok(());
        }
        for _ in 0..to_close {
            self.conds.pop();
        }
        Ok(())
    }

    fn in_export(&self) -> bool {
        self.directive.is_some_and(|d| d.export)
    }

    fn emit_export(&mut self, line: &Bytes, is_export: bool) -> Result<()> {
        let loc = self.loc;
        let mut expr_loc = self.loc;
        let expr = parse_expr(self.ctx, &mut expr_loc, line.clone(), ParseExprOpt::Normal)?;
        let stmt = ExportStmt::new(loc, expr, is_export);
        self.emit(stmt);
        Ok(())
    }

    fn parse_override(&mut self, line: Bytes) -> Result<()> {
        let mut directive = self.directive.unwrap_or_default();
        directive.is_override = true;
        self.directive = Some(directive);
        if self.chained_assign_directive(&line)? {
            return Ok(());
        }
        if self.in_export() {
            self.emit_export(&line, true)?;
        }
        self.parse_rule_or_assign(line)
    }

    fn parse_export(&mut self, line: Bytes) -> Result<()> {
        let mut directive = self.directive.unwrap_or_default();
        directive.export = true;
        self.directive = Some(directive);
        if self.chained_assign_directive(&line)? {
            return Ok(());
        }
        self.emit_export(&line, true)?;
        self.parse_rule_or_assign(line)
    }

    // `override export define NAME` style chains.
    fn chained_assign_directive(&mut self, line: &Bytes) -> Result<bool> {
        let word = directive_word(line);
        let rest = line.slice_ref(trim_right_space(strip_line_comment(trim_left_space(
            &line[word.len()..],
        ))));
        match word {
            b"define" => self.open_define(rest)?,
            b"override" => self.parse_override(rest)?,
            b"export" => self.parse_export(rest)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

pub fn parse_file(ctx: &mut Context, buf: &Bytes, filename: Symbol) -> Result<StmtList> {
    parse_into(ctx, buf, Loc::new(filename, 0), false)
}

pub fn parse_buf(ctx: &mut Context, buf: &Bytes, loc: Loc) -> Result<StmtList> {
    parse_into(ctx, buf, loc, true)
}

fn parse_into(ctx: &mut Context, buf: &Bytes, loc: Loc, fixed_lineno: bool) -> Result<StmtList> {
    let stmts: StmtList = Arc::new(Mutex::new(Vec::new()));
    Parser::new(ctx, buf, loc, stmts.clone(), fixed_lineno).run()?;
    Ok(stmts)
}

pub struct ParsedAssign<'a> {
    pub lhs: &'a [u8],
    pub rhs: &'a [u8],
    pub op: AssignOp,
}

/// Splits `NAME op VALUE` at the already-located separator, classifying the
/// operator from the byte before the `=`.
pub fn parse_assign_statement(line: &[u8], sep: usize) -> ParsedAssign<'_> {
    assert!(sep != 0);
    let (op, lhs_end) = match line[sep - 1] {
        b':' => (AssignOp::ColonEq, sep - 1),
        b'+' => (AssignOp::PlusEq, sep - 1),
        b'?' => (AssignOp::QuestionEq, sep - 1),
        _ => (AssignOp::Eq, sep),
    };
    ParsedAssign {
        lhs: trim_space(&line[..lhs_end]),
        rhs: trim_left_space(&line[line.len().min(sep + 1)..]),
        op,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_word() {
        assert_eq!(directive_word(b"ifdef VAR"), b"ifdef");
        assert_eq!(directive_word(b"endif"), b"endif");
        assert_eq!(directive_word(b"-include foo.mk"), b"-include");
        assert_eq!(directive_word(b"a#b"), b"a");
    }

    #[test]
    fn test_parse_assign_statement() {
        let a = parse_assign_statement(b"FOO := bar", 4);
        assert_eq!(a.lhs, b"FOO");
        assert_eq!(a.rhs, b"bar");
        assert_eq!(a.op, AssignOp::ColonEq);

        let a = parse_assign_statement(b"X += y", 2);
        assert_eq!(a.lhs, b"X");
        assert_eq!(a.op, AssignOp::PlusEq);

        let a = parse_assign_statement(b"X ?= y", 2);
        assert_eq!(a.op, AssignOp::QuestionEq);

        let a = parse_assign_statement(b"X = y", 2);
        assert_eq!(a.op, AssignOp::Eq);
    }

    #[test]
    fn test_parse_simple_file() {
        let mut ctx = Context::for_tests();
        let file = ctx.intern("test.mk");
        let stmts = parse_file(
            &mut ctx,
            &Bytes::from_static(b"A := 1\nall:\n\techo $(A)\n"),
            file,
        )
        .unwrap();
        let stmts = stmts.lock();
        assert_eq!(stmts.len(), 3);
        assert!(matches!(stmts[0], Stmt::Assign(_)));
        assert!(matches!(stmts[1], Stmt::Rule(_)));
        assert!(matches!(stmts[2], Stmt::Command(_)));
    }

    #[test]
    fn test_parse_cond_nesting() {
        let mut ctx = Context::for_tests();
        let file = ctx.intern("test.mk");
        let stmts = parse_file(
            &mut ctx,
            &Bytes::from_static(b"ifdef A\nX := 1\nelse ifdef B\nX := 2\nelse\nX := 3\nendif\n"),
            file,
        )
        .unwrap();
        // The top level sees a single conditional; the chain nests inside
        // its false branch.
        let stmts = stmts.lock();
        assert_eq!(stmts.len(), 1);
        let Stmt::Cond(outer) = &stmts[0] else {
            panic!("expected a conditional");
        };
        assert_eq!(outer.true_stmts.lock().len(), 1);
        assert_eq!(outer.false_stmts.lock().len(), 1);
    }

    #[test]
    fn test_unterminated_cond_is_deferred() {
        let mut ctx = Context::for_tests();
        let file = ctx.intern("test.mk");
        // A missing endif parses; the error is a sentinel statement appended
        // after the conditional itself.
        let stmts = parse_file(&mut ctx, &Bytes::from_static(b"ifdef A\nX := 1\n"), file).unwrap();
        let stmts = stmts.lock();
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[1], Stmt::ParseError(_)));
    }

    #[test]
    fn test_define_body_is_verbatim() {
        let mut ctx = Context::for_tests();
        let file = ctx.intern("test.mk");
        let stmts = parse_file(
            &mut ctx,
            &Bytes::from_static(b"define R\nline1\nline2\nendef\n"),
            file,
        )
        .unwrap();
        let stmts = stmts.lock();
        assert_eq!(stmts.len(), 1);
        let Stmt::Assign(assign) = &stmts[0] else {
            panic!("expected an assignment");
        };
        assert_eq!(assign.orig_rhs, Bytes::from_static(b"line1\nline2"));
        assert_eq!(assign.op, AssignOp::Eq);
    }
}
