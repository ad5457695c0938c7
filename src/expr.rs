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
use bytes::{BufMut, Bytes, BytesMut};
use memchr::memchr;

use crate::context::Context;
use crate::eval::{Evaluator, FrameType};
use crate::func::{FuncInfo, get_func_info};
use crate::loc::Loc;
use crate::strutil::{Pattern, WordWriter, trim_right_space, trim_suffix, word_scanner};
use crate::symtab::Symbol;
use crate::{error_loc, log, maku_warn_loc};

/// Expansion deeper than this is reported as a diagnostic instead of
/// overflowing the stack.
const MAX_EXPAND_DEPTH: i32 = 1000;

pub trait Evaluable {
    fn eval(&self, ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()>;

    fn eval_to_buf_mut(&self, ev: &mut Evaluator) -> Result<BytesMut> {
        let mut out = BytesMut::new();
        self.eval(ev, &mut out)?;
        Ok(out)
    }

    fn eval_to_buf(&self, ev: &mut Evaluator) -> Result<Bytes> {
        Ok(self.eval_to_buf_mut(ev)?.freeze())
    }

    // Whether this Evaluable is either knowably a function (e.g. one of the
    // built-ins) or likely to be a function-type macro, i.e. one that has
    // positional $(1) arguments to be expanded inside it. This is only a
    // heuristic used to filter the .KATI_SYMBOLS list; it must not evaluate
    // anything (evaluation could run $(error) or a nested $(eval)), so the
    // case where the variable name is itself a deferred expansion is not
    // handled and reports true.
    fn is_func(&self, ctx: &Context) -> bool;
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ParseExprOpt {
    Normal,
    Define,
    Command,
    Func,
}

/// A parsed, unevaluated expression: a lazy, read-only tree re-expanded on
/// demand.
#[derive(Debug, PartialEq)]
pub enum Value {
    Literal(Option<Loc>, Bytes),
    Concat(Option<Loc>, Vec<Arc<Value>>),
    SymRef(Loc, Symbol),
    VarRef(Loc, Arc<Value>),
    VarSubst {
        loc: Loc,
        name: Arc<Value>,
        pat: Arc<Value>,
        subst: Arc<Value>,
    },
    Func {
        loc: Loc,
        fi: &'static FuncInfo,
        args: Vec<Arc<Value>>,
    },
}

impl Evaluable for Value {
    fn eval(&self, ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
        if ev.expand_depth >= MAX_EXPAND_DEPTH {
            error_loc!(
                &*ev.ctx,
                self.loc().as_ref().or(ev.loc.as_ref()),
                "*** expanding too deep (circular expansion?)"
            );
        }
        ev.expand_depth += 1;
        let result = self.eval_inner(ev, out);
        ev.expand_depth -= 1;
        result
    }

    fn is_func(&self, ctx: &Context) -> bool {
        match self {
            Value::Func { .. } => true,
            Value::Concat(_, list) => list.iter().any(|v| v.is_func(ctx)),
            Value::SymRef(_, sym) => {
                // A reference to an all-digits name is a positional
                // parameter, which makes the enclosing variable look like a
                // function-style macro.
                crate::strutil::is_integer(&ctx.symtab.resolve(*sym))
            }
            Value::VarRef(_, _) => {
                // The unhandled edge case described on Evaluable::is_func.
                true
            }
            Value::VarSubst {
                name, pat, subst, ..
            } => name.is_func(ctx) || pat.is_func(ctx) || subst.is_func(ctx),
            Value::Literal(_, _) => false,
        }
    }
}

impl Value {
    fn eval_inner(&self, ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
        match self {
            Value::Literal(_, lit) => out.put_slice(lit),
            Value::Concat(_, vec) => {
                for v in vec {
                    v.eval(ev, out)?;
                }
            }
            Value::SymRef(_, sym) => {
                let sym = *sym;
                if let Some(v) = ev.lookup_var_for_eval(sym)? {
                    let v = v.read();
                    v.used(ev, sym)?;
                    v.eval(ev, out)?;
                    v.check_current_referencing_file(ev.ctx, &ev.loc, sym)?;
                    ev.var_eval_complete(sym);
                }
            }
            Value::VarRef(_, var) => {
                ev.eval_depth += 1;
                let name = var.eval_to_buf(ev)?;
                ev.eval_depth -= 1;
                let sym = ev.intern(name);
                if let Some(v) = ev.lookup_var_for_eval(sym)? {
                    let v = v.read();
                    v.used(ev, sym)?;
                    v.eval(ev, out)?;
                    v.check_current_referencing_file(ev.ctx, &ev.loc, sym)?;
                    ev.var_eval_complete(sym);
                }
            }
            Value::VarSubst {
                loc: _,
                name,
                pat,
                subst,
            } => {
                ev.eval_depth += 1;
                let name = name.eval_to_buf(ev)?;
                let sym = ev.intern(name);
                let v = ev.lookup_var(sym)?;
                let pat_str = pat.eval_to_buf(ev)?;
                let subst = subst.eval_to_buf(ev)?;
                ev.eval_depth -= 1;
                if let Some(v) = v {
                    let v = v.read();
                    v.used(ev, sym)?;
                    let value = v.eval_to_buf(ev)?;
                    let mut ww = WordWriter::new(out);
                    let pat = Pattern::new(pat_str);
                    for tok in word_scanner(&value) {
                        ww.maybe_add_space();
                        let tok = value.slice_ref(tok);
                        ww.out.put_slice(&pat.append_subst_ref(&tok, &subst));
                    }
                }
            }
            Value::Func { loc, fi, args } => {
                let _frame = ev.enter(FrameType::FunCall, Bytes::from_static(fi.name), *loc);
                log!(
                    "Invoke func {}({:?})",
                    String::from_utf8_lossy(fi.name),
                    args
                );
                ev.eval_depth += 1;
                let result = (fi.func)(args, ev, out);
                ev.eval_depth -= 1;
                result?;
            }
        }
        Ok(())
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Value::Literal(_, _))
    }

    pub fn loc(&self) -> Option<Loc> {
        match self {
            Value::Literal(loc, _) => *loc,
            Value::Concat(loc, _) => *loc,
            Value::SymRef(loc, _) => Some(*loc),
            Value::VarRef(loc, _) => Some(*loc),
            Value::VarSubst { loc, .. } => Some(*loc),
            Value::Func { loc, .. } => Some(*loc),
        }
    }
}

fn close_paren(c: u8) -> Option<u8> {
    match c {
        b'(' => Some(b')'),
        b'{' => Some(b'}'),
        _ => None,
    }
}

fn should_handle_comments(opt: ParseExprOpt) -> bool {
    !matches!(opt, ParseExprOpt::Define | ParseExprOpt::Command)
}

fn skip_spaces(loc: &mut Loc, s: &[u8], terms: &[u8]) -> usize {
    let mut i = 0;
    while i < s.len() {
        let remaining = &s[i..];
        let c = remaining[0];
        if terms.contains(&c) {
            return i;
        }

        if !c.is_ascii_whitespace() {
            if !remaining.starts_with(b"\\\r") && !remaining.starts_with(b"\\\n") {
                return i;
            }

            loc.line += 1; // escaped newline
        }
        i += 1;
    }
    s.len()
}

fn parse_func_args(
    ctx: &mut Context,
    loc: &mut Loc,
    fi: &FuncInfo,
    s: Bytes,
    mut i: usize,
    mut terms: Vec<u8>,
) -> Result<(usize, Vec<Arc<Value>>)> {
    let start_loc = *loc;
    terms.truncate(2);
    terms[1] = b',';
    i += skip_spaces(loc, &s[i..], &terms);
    if i == s.len() {
        return Ok((i, vec![]));
    }

    let mut nargs = 1;
    let mut args = Vec::new();
    loop {
        if fi.arity > 0 && nargs >= fi.arity {
            terms.truncate(1); // Drop ','.
        }

        if fi.trim_space {
            while i < s.len() {
                let c = s[i];
                if c.is_ascii_whitespace() {
                    i += 1;
                    continue;
                }

                let t = &s[i..];
                if t.starts_with(b"\\\r") || t.starts_with(b"\\\n") {
                    loc.line += 1;
                    i += 1;
                    continue;
                }

                break;
            }
        }

        let trim_right_space = fi.trim_space || (nargs == 1 && fi.trim_right_space_1st);
        let (n, val) = parse_expr_impl(
            ctx,
            loc,
            s.slice(i..),
            Some(&terms),
            ParseExprOpt::Func,
            trim_right_space,
        )?;
        args.push(val);
        i += n;
        if i == s.len() {
            error_loc!(
                ctx,
                Some(&start_loc),
                "*** unterminated call to function '{}': missing '{}'.",
                String::from_utf8_lossy(fi.name),
                char::from(terms[0])
            );
        }
        nargs += 1;
        if s[i] == terms[0] {
            i += 1;
            break;
        }
        i += 1; // Should be ','.
        if i == s.len() {
            break;
        }
    }

    if nargs <= fi.min_arity {
        error_loc!(
            ctx,
            Some(&start_loc),
            "*** insufficient number of arguments ({}) to function `{}'.",
            nargs - 1,
            String::from_utf8_lossy(fi.name)
        );
    }

    Ok((i, args))
}

fn parse_dollar(
    ctx: &mut Context,
    loc: &mut Loc,
    s: Bytes,
    end_paren: bool,
) -> Result<(usize, Arc<Value>)> {
    assert!(s.len() >= 2);
    assert!(s.starts_with(b"$"));
    assert!(!s.starts_with(b"$$"));

    let start_loc = *loc;

    let Some(cp) = close_paren(s[1]) else {
        let sym = ctx.intern(s.slice(1..2));
        return Ok((2, Arc::new(Value::SymRef(start_loc, sym))));
    };

    let mut terms = vec![cp, b':', b' '];
    let mut i = 2;
    loop {
        let (n, vname) = parse_expr_impl(
            ctx,
            loc,
            s.slice(i..),
            Some(&terms),
            ParseExprOpt::Normal,
            false,
        )?;
        i += n;

        let t: &[u8] = &s[i..];
        if t.first() == Some(&cp) || (end_paren && t.is_empty() && cp == b')') {
            if let Value::Literal(_, lit) = &*vname {
                let sym = ctx.intern(lit.clone());
                if ctx.flags.enable_extra_warnings
                    && let Some(found) = ctx.sym(sym).find([' ', '(', '{'])
                {
                    let name = ctx.sym(sym);
                    maku_warn_loc!(
                        ctx,
                        Some(&start_loc),
                        "*warning*: variable lookup with '{}': {}",
                        &name[found..found + 1],
                        String::from_utf8_lossy(&s)
                    )
                }
                return Ok((i + 1, Arc::new(Value::SymRef(start_loc, sym))));
            }
            return Ok((i + 1, Arc::new(Value::VarRef(start_loc, vname))));
        }

        if t.first() == Some(&b' ') || t.first() == Some(&b'\\') {
            // ${func ...}
            if let Value::Literal(_, lit) = &*vname {
                if let Some(fi) = get_func_info(lit) {
                    let (idx, args) = parse_func_args(ctx, loc, fi, s, i + 1, terms)?;
                    return Ok((
                        idx,
                        Arc::new(Value::Func {
                            loc: start_loc,
                            fi,
                            args,
                        }),
                    ));
                } else {
                    maku_warn_loc!(
                        ctx,
                        Some(&start_loc),
                        "*warning*: unknown make function {lit:?}: {}",
                        String::from_utf8_lossy(&s)
                    );
                }
            }

            // Not a function. Drop ' ' from |terms| and parse it
            // again. This is inefficient, but this code path should be
            // rarely used.
            terms.truncate(2);
            i = 2;
            continue;
        }

        if t.first() == Some(&b':') {
            terms.truncate(2);
            terms[1] = b'=';
            let (n, pat) = parse_expr_impl(
                ctx,
                loc,
                s.slice(i + 1..),
                Some(&terms),
                ParseExprOpt::Normal,
                false,
            )?;
            i += 1 + n;
            if s.get(i) == Some(&cp) {
                return Ok((
                    i + 1,
                    Arc::new(Value::VarRef(
                        start_loc,
                        Arc::new(Value::Concat(
                            Some(start_loc),
                            vec![
                                vname,
                                Arc::new(Value::Literal(None, Bytes::from_static(b":"))),
                                pat,
                            ],
                        )),
                    )),
                ));
            }

            terms.truncate(1);
            let (n, subst) = parse_expr_impl(
                ctx,
                loc,
                s.slice(i + 1..),
                Some(&terms),
                ParseExprOpt::Normal,
                false,
            )?;
            i += 1 + n;
            return Ok((
                i + 1,
                Arc::new(Value::VarSubst {
                    loc: start_loc,
                    name: vname,
                    pat,
                    subst,
                }),
            ));
        }

        // GNU make accepts expressions like $((). See unmatched_paren*.mk
        // for detail.
        if let Some(found) = memchr(cp, &s) {
            maku_warn_loc!(
                ctx,
                Some(&start_loc),
                "*warning*: unmatched parentheses: {}",
                String::from_utf8_lossy(&s)
            );
            let sym = ctx.intern(s.slice(2..found));
            return Ok((s.len(), Arc::new(Value::SymRef(start_loc, sym))));
        }

        error_loc!(ctx, Some(&start_loc), "*** unterminated variable reference.");
    }
}

pub fn parse_expr_impl(
    ctx: &mut Context,
    loc: &mut Loc,
    s: Bytes,
    terms: Option<&[u8]>,
    opt: ParseExprOpt,
    trim_right_sp: bool,
) -> Result<(usize, Arc<Value>)> {
    parse_expr_impl_ext(ctx, loc, s, terms, opt, trim_right_sp, false)
}

pub fn parse_expr_impl_ext(
    ctx: &mut Context,
    loc: &mut Loc,
    s: Bytes,
    terms: Option<&[u8]>,
    opt: ParseExprOpt,
    trim_right_sp: bool,
    // Accept a missing close paren at end of input, as the original C++
    // implementation read past the end of its string view.
    end_paren: bool,
) -> Result<(usize, Arc<Value>)> {
    let list_loc = *loc;

    let s = s.slice_ref(trim_suffix(&s, b"\r"));

    let mut b = 0usize;
    let mut save_paren: Option<u8> = None;
    let mut paren_depth: i32 = 0;
    let mut i = 0usize;
    let mut list: Vec<Arc<Value>> = Vec::new();
    let mut terms_ignored = 0;

    while i < s.len() {
        let item_loc = *loc;

        let remaining = &s[i..];
        let c = remaining[0];
        if let Some(terms) = terms
            && save_paren.is_none()
            && terms[terms_ignored..].contains(&c)
        {
            break;
        }

        // Handle a comment
        if terms.is_none() && c == b'#' && should_handle_comments(opt) {
            if i > b {
                list.push(Arc::new(Value::Literal(None, s.slice(b..i))));
            }
            let mut was_backslash = false;
            while i < s.len() && s[i] != b'\n' || was_backslash {
                was_backslash = !was_backslash && s[i] == b'\\';
                i += 1;
            }
            if list.len() == 1 {
                return Ok((i, list.pop().unwrap()));
            }
            return Ok((i, Arc::new(Value::Concat(Some(item_loc), list))));
        }

        if c == b'$' {
            if i + 1 >= s.len() {
                break;
            }

            if i > b {
                list.push(Arc::new(Value::Literal(None, s.slice(b..i))));
            }

            if remaining.starts_with(b"$$") {
                list.push(Arc::new(Value::Literal(None, Bytes::from_static(b"$"))));
                i += 2;
                b = i;
                continue;
            }

            if let Some(terms) = terms
                && terms[terms_ignored..].contains(&remaining[1])
            {
                let val = Arc::new(Value::Literal(None, Bytes::from_static(b"$")));
                if list.is_empty() {
                    return Ok((i + 1, val));
                }
                list.push(val);
                return Ok((i + 1, Arc::new(Value::Concat(Some(item_loc), list))));
            }

            let (n, v) = parse_dollar(ctx, loc, s.slice(i..), end_paren)?;
            list.push(v);
            i += n;
            b = i;
            continue;
        }

        if (c == b'(' || c == b'{') && opt == ParseExprOpt::Func {
            let cp = close_paren(c);
            if terms
                .map(|v| v[terms_ignored..].first() == cp.as_ref())
                .unwrap_or(false)
            {
                paren_depth += 1;
                save_paren = cp;
                terms_ignored += 1;
            } else if cp == save_paren {
                paren_depth += 1;
            }
            i += 1;
            continue;
        }

        if Some(c) == save_paren {
            paren_depth -= 1;
            if paren_depth == 0 {
                terms_ignored -= 1;
                save_paren = None;
            }
        }

        if c == b'\\' && i + 1 < s.len() && opt != ParseExprOpt::Command {
            let n = remaining[1];
            if n == b'\\' {
                i += 2;
                continue;
            }
            if n == b'#' && should_handle_comments(opt) {
                list.push(Arc::new(Value::Literal(None, s.slice(b..i))));
                i += 1;
                b = i;
                i += 1;
                continue;
            }
            if n == b'\r' || n == b'\n' {
                loc.line += 1;
                if let Some(terms) = terms
                    && terms.contains(&b' ')
                {
                    break;
                }
                if i > b {
                    list.push(Arc::new(Value::Literal(
                        None,
                        s.slice_ref(trim_right_space(&s[b..i])),
                    )));
                }
                list.push(Arc::new(Value::Literal(None, Bytes::from_static(b" "))));
                // Skip the current escaped newline
                i += 2;
                if n == b'\r' && i < s.len() && s[i] == b'\n' {
                    i += 1;
                }
                // Then continue skipping escaped newlines, spaces, and tabs
                while i < s.len() {
                    let t = &s[i..];
                    if t.starts_with(b"\\\r") || t.starts_with(b"\\\n") {
                        loc.line += 1;
                        i += 2;
                        continue;
                    }
                    if !(t[0] == b' ' || t[0] == b'\t') {
                        break;
                    }
                    i += 1;
                }
                b = i;
                i -= 1;
            }
        }

        i += 1;
    }

    if i > b {
        let mut rest = &s[b..i];
        if trim_right_sp {
            rest = trim_right_space(rest);
        }
        if !rest.is_empty() {
            list.push(Arc::new(Value::Literal(None, s.slice_ref(rest))))
        }
    }
    if list.len() == 1 {
        Ok((i, list.pop().unwrap()))
    } else {
        Ok((i, Arc::new(Value::Concat(Some(list_loc), list))))
    }
}

pub fn parse_expr(
    ctx: &mut Context,
    loc: &mut Loc,
    s: Bytes,
    opt: ParseExprOpt,
) -> Result<Arc<Value>> {
    let (_i, val) = parse_expr_impl(ctx, loc, s, None, opt, false)?;
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expr() {
        let mut ctx = Context::for_tests();
        assert_eq!(
            parse_expr(
                &mut ctx,
                &mut Loc::default(),
                Bytes::from_static(b"foo"),
                ParseExprOpt::Normal
            )
            .unwrap(),
            Arc::new(Value::Literal(None, Bytes::from_static(b"foo")))
        );
        let foo = ctx.intern("foo");
        assert_eq!(
            parse_expr(
                &mut ctx,
                &mut Loc::default(),
                Bytes::from_static(b"$(foo)"),
                ParseExprOpt::Normal
            )
            .unwrap(),
            Arc::new(Value::SymRef(Loc::default(), foo))
        );
    }

    #[test]
    fn test_parse_deferred_eval() {
        let mut ctx = Context::for_tests();
        let s = Bytes::from_static(b"$(eval dst := $$(notdir $$(src)))");
        assert_eq!(
            parse_expr(&mut ctx, &mut Loc::default(), s, ParseExprOpt::Define).unwrap(),
            Arc::new(Value::Func {
                loc: Loc::default(),
                fi: get_func_info(b"eval").unwrap(),
                args: vec![Arc::new(Value::Concat(
                    Some(Loc::default()),
                    vec![
                        Arc::new(Value::Literal(None, Bytes::from_static(b"dst := "))),
                        Arc::new(Value::Literal(None, Bytes::from_static(b"$"))),
                        Arc::new(Value::Literal(None, Bytes::from_static(b"(notdir "))),
                        Arc::new(Value::Literal(None, Bytes::from_static(b"$"))),
                        Arc::new(Value::Literal(None, Bytes::from_static(b"(src))"))),
                    ]
                ))],
            })
        )
    }

    #[test]
    fn test_parse_dollar() {
        let mut ctx = Context::for_tests();
        let foo = ctx.intern("foo");
        assert_eq!(
            parse_dollar(
                &mut ctx,
                &mut Loc::default(),
                Bytes::from_static(b"${foo}bar"),
                false
            )
            .unwrap(),
            (6, Arc::new(Value::SymRef(Loc::default(), foo)))
        );
        assert_eq!(
            parse_dollar(
                &mut ctx,
                &mut Loc::default(),
                Bytes::from_static(b"$(info ***   - Re-execute)"),
                false,
            )
            .unwrap(),
            (
                26,
                Arc::new(Value::Func {
                    loc: Loc::default(),
                    fi: get_func_info(b"info").unwrap(),
                    args: vec![Arc::new(Value::Literal(
                        None,
                        Bytes::from_static(b"***   - Re-execute")
                    ))],
                })
            )
        );
        assert_eq!(
            parse_dollar(
                &mut ctx,
                &mut Loc::default(),
                Bytes::from_static(b"$(info ***   - Re-execute envsetup (\". envsetup.sh\"))"),
                false,
            )
            .unwrap(),
            (
                53,
                Arc::new(Value::Func {
                    loc: Loc::default(),
                    fi: get_func_info(b"info").unwrap(),
                    args: vec![Arc::new(Value::Literal(
                        None,
                        Bytes::from_static(b"***   - Re-execute envsetup (\". envsetup.sh\")")
                    ))],
                })
            )
        );
    }

    #[test]
    fn test_call_func() {
        let mut ctx = Context::for_tests();
        let upper = ctx.intern("upper");
        assert_eq!(
            parse_expr(
                &mut ctx,
                &mut Loc::default(),
                Bytes::from_static(b"$(call to-lower,$(upper))"),
                ParseExprOpt::Normal
            )
            .unwrap(),
            Arc::new(Value::Func {
                loc: Loc::default(),
                fi: get_func_info(b"call").unwrap(),
                args: vec![
                    Arc::new(Value::Literal(None, Bytes::from_static(b"to-lower"))),
                    Arc::new(Value::SymRef(Loc::default(), upper)),
                ],
            })
        )
    }

    #[test]
    fn test_subst2() {
        let mut ctx = Context::for_tests();
        let space = ctx.intern("space");
        let foo = ctx.intern("foo");
        assert_eq!(
            parse_expr(
                &mut ctx,
                &mut Loc::default(),
                Bytes::from_static(b"$(subst $(space),$,,$(foo))"),
                ParseExprOpt::Normal
            )
            .unwrap(),
            Arc::new(Value::Func {
                loc: Loc::default(),
                fi: get_func_info(b"subst").unwrap(),
                args: vec![
                    Arc::new(Value::SymRef(Loc::default(), space)),
                    Arc::new(Value::Literal(None, Bytes::from_static(b"$"))),
                    Arc::new(Value::Concat(
                        Some(Loc::default()),
                        vec![
                            Arc::new(Value::Literal(None, Bytes::from_static(b","))),
                            Arc::new(Value::SymRef(Loc::default(), foo)),
                        ]
                    )),
                ],
            })
        )
    }

    #[test]
    fn test_end_paren_compat() {
        // `ifeq (foo,$(BAR)` must parse: the RHS expression reads `$(BAR`
        // and the missing close paren is tolerated in end_paren mode only.
        let mut ctx = Context::for_tests();
        let mut loc = Loc::default();
        assert_eq!(
            parse_expr_impl_ext(
                &mut ctx,
                &mut loc,
                Bytes::from_static(b"$(BAR"),
                None,
                ParseExprOpt::Normal,
                false,
                false
            )
            .unwrap_err()
            .to_string(),
            "<unknown>:0: *** unterminated variable reference."
        );
        let bar = ctx.intern("BAR");
        assert_eq!(
            parse_expr_impl_ext(
                &mut ctx,
                &mut loc,
                Bytes::from_static(b"$(BAR"),
                None,
                ParseExprOpt::Normal,
                false,
                true
            )
            .unwrap(),
            (6, Arc::new(Value::SymRef(loc, bar)))
        );
    }
}
