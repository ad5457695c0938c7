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

use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    fmt::Debug,
    fs::File,
    io::Write,
    os::unix::ffi::{OsStrExt, OsStringExt},
    sync::{Arc, LazyLock},
};

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    error_loc,
    eval::{Evaluator, ExportAllowed, FrameType},
    expr::{Evaluable, Value},
    fileutil::{RedirectStderr, run_command},
    find::FindCommand,
    flags::Flags,
    loc::Loc,
    log, maku_warn_loc,
    parser::parse_buf,
    strutil::{
        WordWriter, echo_escape, format_for_command_substitution, has_path_prefix, normalize_path,
        trim_left_space, trim_space, word_scanner,
    },
    symtab::Symbol,
    var::{Var, VarOrigin, Variable},
    warn_loc,
};

type MakeFuncImpl = fn(&[Arc<Value>], &mut Evaluator, &mut dyn BufMut) -> Result<()>;

pub struct FuncInfo {
    pub name: &'static [u8],
    pub func: MakeFuncImpl,
    pub arity: i16,
    pub min_arity: i16,
    // For all parameters.
    pub trim_space: bool,
    // Only for the first parameter.
    pub trim_right_space_1st: bool,
}

// Function pointers are not comparable, so just compare by name
impl PartialEq for FuncInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Debug for FuncInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Func({})", String::from_utf8_lossy(self.name))
    }
}

fn strip_shell_comment(cmd: Bytes) -> Bytes {
    if !cmd.contains(&b'#') {
        return cmd;
    }

    let mut res = BytesMut::new();
    let mut prev_backslash = false;
    // Set space as an initial value so the leading comment will be
    // stripped out.
    let mut prev_char = b' ';
    let mut quote = None;
    let mut inp = cmd;
    while !inp.is_empty() {
        let c = inp[0];
        match c {
            b'#' => {
                if quote.is_none() && prev_char.is_ascii_whitespace() {
                    while inp.len() > 1 && !inp.starts_with(b"\n") {
                        inp.advance(1);
                    }
                } else {
                    if let Some(q) = quote {
                        if q == c {
                            quote = None;
                        }
                    } else if !prev_backslash {
                        quote = Some(c);
                    }
                    res.put_u8(c);
                }
            }
            b'\'' | b'"' | b'`' => {
                if let Some(q) = quote {
                    if q == c {
                        quote = None;
                    }
                } else if !prev_backslash {
                    quote = Some(c);
                }
                res.put_u8(c);
            }
            _ => res.put_u8(c),
        }

        if inp.starts_with(b"\\") {
            prev_backslash = !prev_backslash;
        } else {
            prev_backslash = false;
        }

        prev_char = c;
        inp.advance(1);
    }
    res.into()
}

fn patsubst_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let pat_str = args[0].eval_to_buf(ev)?;
    let repl = args[1].eval_to_buf(ev)?;
    let s = args[2].eval_to_buf(ev)?;
    let mut ww = WordWriter::new(out);
    let pat = crate::strutil::Pattern::new(pat_str);
    for tok in word_scanner(&s) {
        let tok = s.slice_ref(tok);
        ww.write(&pat.append_subst(&tok, &repl));
    }
    Ok(())
}

fn strip_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let s = args[0].eval_to_buf(ev)?;
    let mut ww = WordWriter::new(out);
    for tok in word_scanner(&s) {
        ww.write(tok);
    }
    Ok(())
}

fn subst_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let pat = args[0].eval_to_buf(ev)?;
    let repl = args[1].eval_to_buf(ev)?;
    let s = args[2].eval_to_buf(ev)?;
    if pat.is_empty() {
        out.put_slice(&s);
        out.put_slice(&repl);
        return Ok(());
    }
    let f = memchr::memmem::Finder::new(&pat);
    let mut remainder = s.as_ref();
    while !remainder.is_empty() {
        let Some(found) = f.find(remainder) else {
            out.put_slice(remainder);
            break;
        };
        out.put_slice(&remainder[..found]);
        out.put_slice(&repl);
        remainder = &remainder[found + pat.len()..];
    }
    Ok(())
}

fn findstring_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let find = args[0].eval_to_buf(ev)?;
    let f = memchr::memmem::Finder::new(&find);
    let haystack = args[1].eval_to_buf(ev)?;
    if f.find(&haystack).is_some() {
        out.put_slice(&find);
    }
    Ok(())
}

fn filter_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let pat_buf = args[0].eval_to_buf(ev)?;
    let text = args[1].eval_to_buf(ev)?;
    let pats: Vec<crate::strutil::Pattern> = word_scanner(&pat_buf)
        .map(|p| crate::strutil::Pattern::new(pat_buf.slice_ref(p)))
        .collect();
    let mut ww = WordWriter::new(out);
    for tok in word_scanner(&text) {
        for pat in &pats {
            if pat.matches(tok) {
                ww.write(tok);
                break;
            }
        }
    }
    Ok(())
}

fn filter_out_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let pat_buf = args[0].eval_to_buf(ev)?;
    let text = args[1].eval_to_buf(ev)?;
    let pats: Vec<crate::strutil::Pattern> = word_scanner(&pat_buf)
        .map(|p| crate::strutil::Pattern::new(pat_buf.slice_ref(p)))
        .collect();
    let mut ww = WordWriter::new(out);
    for tok in word_scanner(&text) {
        let mut matched = false;
        for pat in &pats {
            if pat.matches(tok) {
                matched = true;
                break;
            }
        }
        if !matched {
            ww.write(tok);
        }
    }
    Ok(())
}

fn sort_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let list = args[0].eval_to_buf(ev)?;
    let mut toks: Vec<&[u8]> = word_scanner(&list).collect();
    toks.sort();
    let mut ww = WordWriter::new(out);
    let mut prev = [].as_slice();
    for tok in toks {
        if tok != prev {
            ww.write(tok);
            prev = tok;
        }
    }
    Ok(())
}

fn get_numeric_value_for_func(buf: &[u8]) -> Result<usize> {
    let s = std::str::from_utf8(trim_left_space(buf))?;
    Ok(s.parse::<usize>()?)
}

fn word_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let n_str = args[0].eval_to_buf(ev)?;
    let Ok(mut n) = get_numeric_value_for_func(&n_str) else {
        error_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*** non-numeric first argument to `word' function: '{}'.",
            String::from_utf8_lossy(&n_str)
        );
    };
    if n == 0 {
        error_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*** first argument to `word' function must be greater than 0."
        );
    }

    let text = args[1].eval_to_buf(ev)?;
    for tok in word_scanner(&text) {
        n -= 1;
        if n == 0 {
            out.put_slice(tok);
            break;
        }
    }
    Ok(())
}

fn wordlist_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let s_str = args[0].eval_to_buf(ev)?;
    let Ok(si) = get_numeric_value_for_func(&s_str) else {
        error_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*** non-numeric first argument to `wordlist' function: '{}'.",
            String::from_utf8_lossy(&s_str)
        );
    };
    if si == 0 {
        error_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*** invalid first argument to `wordlist' function: {}`",
            String::from_utf8_lossy(&s_str)
        );
    }

    let e_str = args[1].eval_to_buf(ev)?;
    let Ok(ei) = get_numeric_value_for_func(&e_str) else {
        error_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*** non-numeric second argument to `wordlist' function: '{}'.",
            String::from_utf8_lossy(&e_str)
        );
    };

    let text = args[2].eval_to_buf(ev)?;
    let mut ww = WordWriter::new(out);
    let mut i = 0;
    for tok in word_scanner(&text) {
        i += 1;
        if si <= i {
            if i <= ei {
                ww.write(tok);
            } else {
                break;
            }
        }
    }
    Ok(())
}

fn words_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let text = args[0].eval_to_buf(ev)?;
    let n = word_scanner(&text).count();
    out.put_slice(format!("{n}").as_bytes());
    Ok(())
}

fn firstword_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let text = args[0].eval_to_buf(ev)?;
    if let Some(tok) = word_scanner(&text).next() {
        out.put_slice(tok);
    }
    Ok(())
}

fn lastword_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let text = args[0].eval_to_buf(ev)?;
    if let Some(tok) = word_scanner(&text).last() {
        out.put_slice(tok);
    }
    Ok(())
}

fn join_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let list1 = args[0].eval_to_buf(ev)?;
    let list2 = args[1].eval_to_buf(ev)?;
    let mut ws1 = word_scanner(&list1);
    let mut ws2 = word_scanner(&list2);
    let mut ww = WordWriter::new(out);
    loop {
        match (ws1.next(), ws2.next()) {
            (Some(tok1), Some(tok2)) => {
                ww.write(tok1);
                ww.out.put_slice(tok2);
            }
            (Some(tok), None) => ww.write(tok),
            (None, Some(tok)) => ww.write(tok),
            (None, None) => break,
        }
    }
    Ok(())
}

fn wildcard_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let pat = args[0].eval_to_buf(ev)?;
    // GNU make does not delay the execution of $(wildcard), so avoid_io
    // does not apply here.
    let mut ww = WordWriter::new(out);
    for tok in word_scanner(&pat) {
        let tok = pat.slice_ref(tok);
        let files = ev.ctx.glob(tok);
        if let Ok(files) = files.as_ref() {
            for f in files {
                ww.write(f);
            }
        }
    }
    Ok(())
}

fn dir_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let text = args[0].eval_to_buf(ev)?;
    let mut ww = WordWriter::new(out);
    for tok in word_scanner(&text) {
        let tok = text.slice_ref(tok);
        ww.write(&crate::strutil::dirname(&tok));
        ww.out.put_u8(b'/');
    }
    Ok(())
}

fn notdir_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let text = args[0].eval_to_buf(ev)?;
    let mut ww = WordWriter::new(out);
    for tok in word_scanner(&text) {
        if tok == b"/" {
            ww.write(b"");
        } else {
            ww.write(crate::strutil::basename(tok));
        }
    }
    Ok(())
}

fn suffix_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let text = args[0].eval_to_buf(ev)?;
    let mut ww = WordWriter::new(out);
    for tok in word_scanner(&text) {
        if let Some(suf) = crate::strutil::get_ext(tok) {
            ww.write(suf);
        }
    }
    Ok(())
}

fn basename_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let text = args[0].eval_to_buf(ev)?;
    let mut ww = WordWriter::new(out);
    for tok in word_scanner(&text) {
        ww.write(crate::strutil::strip_ext(tok));
    }
    Ok(())
}

fn addsuffix_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let suf = args[0].eval_to_buf(ev)?;
    let text = args[1].eval_to_buf(ev)?;
    let mut ww = WordWriter::new(out);
    for tok in word_scanner(&text) {
        ww.write(tok);
        ww.out.put_slice(&suf);
    }
    Ok(())
}

fn addprefix_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let pre = args[0].eval_to_buf(ev)?;
    let text = args[1].eval_to_buf(ev)?;
    let mut ww = WordWriter::new(out);
    for tok in word_scanner(&text) {
        ww.write(&pre);
        ww.out.put_slice(tok);
    }
    Ok(())
}

fn realpath_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let text = args[0].eval_to_buf(ev)?;
    if ev.avoid_io {
        // Resolution has to happen at build time; emit a subshell that
        // re-invokes this binary.
        out.put_slice(b"$(");
        out.put_slice(std::env::current_exe()?.as_os_str().as_bytes());
        out.put_slice(b" --realpath ");
        out.put_slice(&text);
        out.put_slice(b" 2> /dev/null)");
        return Ok(());
    }

    let mut ww = WordWriter::new(out);
    for tok in word_scanner(&text) {
        let tok = <OsStr as OsStrExt>::from_bytes(tok);
        if let Ok(path) = std::fs::canonicalize(tok) {
            ww.write(path.as_os_str().as_bytes());
        }
    }
    Ok(())
}

fn abspath_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let text = args[0].eval_to_buf(ev)?;
    let mut ww = WordWriter::new(out);
    for tok in word_scanner(&text) {
        ww.write(&crate::strutil::abs_path(tok)?);
    }
    Ok(())
}

fn if_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let cond = args[0].eval_to_buf(ev)?;
    if cond.is_empty() {
        if args.len() > 2 {
            args[2].eval(ev, out)?;
        }
    } else {
        args[1].eval(ev, out)?;
    }
    Ok(())
}

fn and_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let mut cond = Bytes::new();
    for a in args {
        cond = a.eval_to_buf(ev)?;
        if cond.is_empty() {
            return Ok(());
        }
    }
    if !cond.is_empty() {
        out.put_slice(&cond);
    }
    Ok(())
}

fn or_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    for a in args {
        let cond = a.eval_to_buf(ev)?;
        if !cond.is_empty() {
            out.put_slice(&cond);
            break;
        }
    }
    Ok(())
}

fn value_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let var_name = args[0].eval_to_buf(ev)?;
    let sym = ev.intern(var_name);
    let Some(var) = ev.lookup_var(sym)? else {
        return Ok(());
    };
    out.put_slice(&var.read().string(ev.ctx)?);
    Ok(())
}

fn eval_func(args: &[Arc<Value>], ev: &mut Evaluator, _out: &mut dyn BufMut) -> Result<()> {
    let text = args[0].eval_to_buf(ev)?;
    if ev.avoid_io {
        maku_warn_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*warning*: $(eval) in a recipe is not recommended: {}",
            String::from_utf8_lossy(&text)
        );
    }
    let stmts = parse_buf(ev.ctx, &text, ev.loc.unwrap_or_default())?;
    let stmts = stmts.lock();
    for stmt in stmts.iter() {
        log!("{:?}", stmt);
        stmt.eval(ev)?;
    }
    Ok(())
}

// An Android-ism: expressions like $((3+4)) have to be evaluated when the
// ninja file is emitted, because their results feed other make functions.
fn has_no_io_in_shell_script(cmd: &[u8]) -> bool {
    if cmd.is_empty() {
        return true;
    }
    if cmd.starts_with(b"echo $((") && cmd.ends_with(b")") {
        return true;
    }
    false
}

fn shell_func_impl(
    ev: &mut Evaluator,
    shell: &[u8],
    shellflag: &[u8],
    cmd: &Bytes,
    loc: &Loc,
) -> Result<(i32, Bytes, Option<FindCommand>)> {
    log!("ShellFunc: {:?}", cmd);

    if ev.ctx.flags.use_find_emulator
        && let Some(fc) = crate::find::parse(&ev.ctx.flags, cmd)?
    {
        let ctx = &*ev.ctx;
        if let Some(out) = ctx.find.find(ctx, cmd, &fc, loc)? {
            return Ok((0, out, Some(fc)));
        }
    }

    let (status, output) = run_command(shell, shellflag, cmd, RedirectStderr::None)?;
    let output = Bytes::from(format_for_command_substitution(output));

    if let Some(exit_code) = status.code() {
        return Ok((exit_code, output, None));
    }
    let exit_code = if status.success() { 0 } else { 1 };
    Ok((exit_code, output, None))
}

fn should_store_command_result(flags: &Flags, cmd: &[u8]) -> bool {
    // BUILD_DATETIME would make every run dirty.
    if cmd == b"date +%s" {
        return false;
    }

    if let Some(pat) = &flags.ignore_dirty_pattern {
        let nopat = &flags.no_ignore_dirty_pattern;
        for tok in word_scanner(cmd) {
            if pat.matches(tok) && !nopat.as_ref().map(|p| p.matches(tok)).unwrap_or(false) {
                return false;
            }
        }
    }

    true
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum CommandOp {
    Shell,
    Find,
    Read,
    ReadMissing,
    Write,
    Append,
}

/// One logged `$(shell)` / `$(file)` operation; consumed by external
/// regeneration checkers.
pub struct CommandResult {
    pub op: CommandOp,
    pub shell: Bytes,
    pub shellflag: Bytes,
    pub cmd: Bytes,
    pub find: Option<FindCommand>,
    pub result: Bytes,
    pub loc: Loc,
}

fn shell_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let cmd = args[0].eval_to_buf(ev)?;
    if ev.avoid_io && !has_no_io_in_shell_script(&cmd) {
        if ev.eval_depth > 1 {
            error_loc!(
                &*ev.ctx,
                ev.loc.as_ref(),
                "passing results of $(shell) to other make constructs is not supported: {}",
                String::from_utf8_lossy(&cmd)
            );
        }
        let cmd = strip_shell_comment(cmd);
        out.put_slice(b"$(");
        out.put_slice(&cmd);
        out.put_u8(b')');
        return Ok(());
    }

    let loc = ev.loc.unwrap_or_default();
    let shell = ev.get_shell()?;
    let shellflag = ev.get_shell_flag();

    let (exit_code, output, fc) = shell_func_impl(ev, &shell, shellflag, &cmd, &loc)?;
    out.put_slice(&output);
    if should_store_command_result(&ev.ctx.flags, &cmd) {
        ev.ctx.command_log.push(CommandResult {
            op: if fc.is_some() {
                CommandOp::Find
            } else {
                CommandOp::Shell
            },
            shell,
            shellflag: Bytes::from_static(shellflag),
            cmd,
            find: fc,
            result: output,
            loc,
        })
    }
    ev.ctx.shell_status = Some(exit_code);
    Ok(())
}

fn shell_no_rerun_func(
    args: &[Arc<Value>],
    ev: &mut Evaluator,
    out: &mut dyn BufMut,
) -> Result<()> {
    let cmd = args[0].eval_to_buf(ev)?;
    if ev.avoid_io && !has_no_io_in_shell_script(&cmd) {
        // A $(shell) inside a rule already only runs at build time, so
        // the no-rerun variant has nothing to add there.
        error_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "KATI_shell_no_rerun provides no benefit over regular $(shell) inside of a rule."
        );
    }

    let loc = ev.loc.unwrap_or_default();
    let shell = ev.get_shell()?;
    let shellflag = ev.get_shell_flag();

    let (exit_code, output, _) = shell_func_impl(ev, &shell, shellflag, &cmd, &loc)?;
    out.put_slice(&output);
    ev.ctx.shell_status = Some(exit_code);
    Ok(())
}

fn call_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let func_name_buf = args[0].eval_to_buf(ev)?;
    let func_name_buf = func_name_buf.slice_ref(trim_space(&func_name_buf));
    let func_sym = ev.intern(func_name_buf.clone());
    let func = ev.lookup_var(func_sym)?;
    if let Some(func) = &func {
        func.read().used(ev, func_sym)?;
    } else {
        maku_warn_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*warning*: undefined user function: {}",
            ev.sym(func_sym)
        );
    }
    let mut av = Vec::with_capacity(args.len() - 1);
    for arg in &args[1..] {
        let value = arg.eval_to_buf(ev)?;
        av.push(Variable::simple(value, VarOrigin::Automatic).cell());
    }
    // Bind $1..$N; existing bindings from an outer $(call) beyond N are
    // blanked. Everything is restored on unwind.
    let mut saved: Vec<(Symbol, Option<Var>)> = Vec::new();
    let mut i = 1;
    loop {
        let positional = ev.intern(format!("{i}"));
        if let Some(a) = av.get(i - 1) {
            let orig = ev.ctx.swap_global(positional, Some(a.clone()));
            saved.push((positional, orig));
        } else {
            let Some(v) = ev.lookup_var(positional)? else {
                break;
            };
            if v.read().origin() != VarOrigin::Automatic {
                break;
            }

            let blank = Variable::empty(VarOrigin::Automatic).cell();
            let orig = ev.ctx.swap_global(positional, Some(blank));
            saved.push((positional, orig));
        }
        i += 1;
    }

    ev.eval_depth -= 1;
    let result = {
        let _frame = ev.enter(FrameType::Call, func_name_buf, ev.loc.unwrap_or_default());
        match &func {
            Some(func) => func.read().eval(ev, out),
            None => Ok(()),
        }
    };
    ev.eval_depth += 1;

    for (sym, orig) in saved.into_iter().rev() {
        ev.ctx.swap_global(sym, orig);
    }

    result
}

fn foreach_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let varname = {
        let name = args[0].eval_to_buf(ev)?;
        ev.intern(name)
    };
    let list = args[1].eval_to_buf(ev)?;
    ev.eval_depth -= 1;
    let orig = ev.ctx.swap_global(varname, None);
    let mut result = Ok(());
    {
        let mut ww = WordWriter::new(out);
        for tok in word_scanner(&list) {
            let tok = list.slice_ref(tok);
            let v = Variable::simple(tok, VarOrigin::Automatic).cell();
            ev.ctx.swap_global(varname, Some(v));
            ww.maybe_add_space();
            if let Err(err) = args[2].eval(ev, ww.out) {
                result = Err(err);
                break;
            }
        }
    }
    ev.ctx.swap_global(varname, orig);
    ev.eval_depth += 1;
    result
}

fn foreach_sep_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let varname = {
        let name = args[0].eval_to_buf(ev)?;
        ev.intern(name)
    };
    let separator = args[1].eval_to_buf(ev)?;
    let list = args[2].eval_to_buf(ev)?;
    ev.eval_depth -= 1;
    let orig = ev.ctx.swap_global(varname, None);
    let mut result = Ok(());
    {
        let mut ww = WordWriter::new(out);
        for tok in word_scanner(&list) {
            let tok = list.slice_ref(tok);
            let v = Variable::simple(tok, VarOrigin::Automatic).cell();
            ev.ctx.swap_global(varname, Some(v));
            ww.maybe_add_separator(&separator);
            if let Err(err) = args[3].eval(ev, ww.out) {
                result = Err(err);
                break;
            }
        }
    }
    ev.ctx.swap_global(varname, orig);
    ev.eval_depth += 1;
    result
}

fn origin_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let var_name = args[0].eval_to_buf(ev)?;
    let sym = ev.intern(var_name);
    if let Some(var) = ev.lookup_var(sym)? {
        let orig = var.read().origin();
        out.put_slice(crate::var::get_origin_str(orig).as_bytes());
    } else {
        out.put_slice(b"undefined");
    }
    Ok(())
}

fn flavor_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    let var_name = args[0].eval_to_buf(ev)?;
    let sym = ev.intern(var_name);
    if let Some(var) = ev.lookup_var(sym)? {
        out.put_slice(var.read().flavor().as_bytes());
    } else {
        out.put_slice(b"undefined");
    }
    Ok(())
}

fn info_func(args: &[Arc<Value>], ev: &mut Evaluator, _out: &mut dyn BufMut) -> Result<()> {
    let a = args[0].eval_to_buf(ev)?;
    if ev.avoid_io {
        let mut s = BytesMut::new();
        s.put_slice(b"echo -e \"");
        s.put_slice(&echo_escape(&a));
        s.put_u8(b'"');
        ev.delayed_output_commands.push(s.freeze());
    } else {
        println!("{}", String::from_utf8_lossy(&a));
    }
    Ok(())
}

fn warning_func(args: &[Arc<Value>], ev: &mut Evaluator, _out: &mut dyn BufMut) -> Result<()> {
    let a = args[0].eval_to_buf(ev)?;
    if ev.avoid_io {
        let mut s = BytesMut::new();
        s.put_slice(b"echo -e \"");
        s.put_slice(
            ev.loc
                .unwrap_or_default()
                .render(&ev.ctx.symtab)
                .as_bytes(),
        );
        s.put_slice(b": ");
        s.put_slice(&echo_escape(&a));
        s.put_slice(b"\" 2>&1");
        ev.delayed_output_commands.push(s.freeze());
        return Ok(());
    }
    warn_loc!(
        &*ev.ctx,
        ev.loc.as_ref(),
        "{}",
        String::from_utf8_lossy(&a)
    );
    Ok(())
}

fn error_func(args: &[Arc<Value>], ev: &mut Evaluator, _out: &mut dyn BufMut) -> Result<()> {
    let a = args[0].eval_to_buf(ev)?;
    if ev.avoid_io {
        let mut s = BytesMut::new();
        s.put_slice(b"echo -e \"");
        s.put_slice(
            ev.loc
                .unwrap_or_default()
                .render(&ev.ctx.symtab)
                .as_bytes(),
        );
        s.put_slice(b": *** ");
        s.put_slice(&echo_escape(&a));
        s.put_slice(b".\" 2>&1 && false");
        ev.delayed_output_commands.push(s.freeze());
        return Ok(());
    }
    error_loc!(
        &*ev.ctx,
        ev.loc.as_ref(),
        "*** {}.",
        String::from_utf8_lossy(&a)
    );
}

fn file_read_func(
    ev: &mut Evaluator,
    filename: &OsStr,
    out: &mut dyn BufMut,
    rerun: bool,
) -> Result<()> {
    if !std::fs::exists(filename)? {
        if should_store_command_result(&ev.ctx.flags, filename.as_bytes()) {
            let loc = ev.loc.unwrap_or_default();
            ev.ctx.command_log.push(CommandResult {
                op: CommandOp::ReadMissing,
                shell: Bytes::new(),
                shellflag: Bytes::new(),
                cmd: Bytes::from(filename.as_bytes().to_vec()),
                find: None,
                result: Bytes::new(),
                loc,
            })
        }
        return Ok(());
    }

    let mut buf = std::fs::read(filename)?;
    if buf.ends_with(b"\n") {
        buf.pop();
    }
    let buf = Bytes::from(buf);

    if rerun && should_store_command_result(&ev.ctx.flags, filename.as_bytes()) {
        let loc = ev.loc.unwrap_or_default();
        ev.ctx.command_log.push(CommandResult {
            op: CommandOp::Read,
            shell: Bytes::new(),
            shellflag: Bytes::new(),
            cmd: Bytes::from(filename.as_bytes().to_vec()),
            find: None,
            result: buf.clone(),
            loc,
        })
    }
    out.put_slice(&buf);
    Ok(())
}

fn file_write_func(
    ev: &mut Evaluator,
    filename: &OsStr,
    append: bool,
    text: Bytes,
    rerun: bool,
) -> Result<()> {
    {
        let mut f = File::options()
            .write(true)
            .append(append)
            .truncate(!append)
            .create(true)
            .open(filename)?;
        f.write_all(&text)?;
    }

    if rerun && should_store_command_result(&ev.ctx.flags, filename.as_bytes()) {
        let loc = ev.loc.unwrap_or_default();
        ev.ctx.command_log.push(CommandResult {
            op: if append {
                CommandOp::Append
            } else {
                CommandOp::Write
            },
            shell: Bytes::new(),
            shellflag: Bytes::new(),
            cmd: Bytes::from(filename.as_bytes().to_vec()),
            find: None,
            result: text,
            loc,
        })
    }

    Ok(())
}

fn file_func_impl(
    args: &[Arc<Value>],
    ev: &mut Evaluator,
    out: &mut dyn BufMut,
    rerun: bool,
) -> Result<()> {
    if ev.avoid_io {
        error_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*** $(file ...) is not supported in rules."
        );
    }

    let arg = args[0].eval_to_buf(ev)?;
    let filename = trim_space(&arg);

    if filename.is_empty() {
        error_loc!(&*ev.ctx, ev.loc.as_ref(), "*** Missing filename");
    }

    if filename[0] == b'<' {
        let filename = trim_left_space(&filename[1..]);
        if filename.is_empty() {
            error_loc!(&*ev.ctx, ev.loc.as_ref(), "*** Missing filename");
        }
        if args.len() > 1 {
            error_loc!(&*ev.ctx, ev.loc.as_ref(), "*** invalid argument");
        }

        let filename = <OsStr as OsStrExt>::from_bytes(filename);
        file_read_func(ev, filename, out, rerun)?;
    } else if filename[0] == b'>' {
        let append = filename.starts_with(b">>");
        let filename = trim_left_space(&filename[if append { 2 } else { 1 }..]);
        if filename.is_empty() {
            error_loc!(&*ev.ctx, ev.loc.as_ref(), "*** Missing filename");
        }

        let mut text = BytesMut::new();
        if let Some(contents) = args.get(1) {
            contents.eval(ev, &mut text)?;
            if text.is_empty() || !text.ends_with(b"\n") {
                text.put_u8(b'\n');
            }
        }

        let filename = <OsStr as OsStrExt>::from_bytes(filename);
        file_write_func(ev, filename, append, text.freeze(), rerun)?;
    } else {
        error_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*** Invalid file operation: {}.  Stop.",
            String::from_utf8_lossy(filename)
        );
    }
    Ok(())
}

fn file_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    file_func_impl(args, ev, out, true)
}

fn file_no_rerun_func(args: &[Arc<Value>], ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
    file_func_impl(args, ev, out, false)
}

fn deprecated_var_func(
    args: &[Arc<Value>],
    ev: &mut Evaluator,
    _out: &mut dyn BufMut,
) -> Result<()> {
    let vars_str = args[0].eval_to_buf(ev)?;
    let msg = Arc::new(if let Some(v) = args.get(1) {
        format!(". {}", String::from_utf8_lossy(&v.eval_to_buf(ev)?))
    } else {
        String::new()
    });

    if ev.avoid_io {
        error_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*** $(KATI_deprecated_var ...) is not supported in rules."
        );
    }

    for var in word_scanner(&vars_str) {
        let var = vars_str.slice_ref(var);
        let sym = ev.intern(var);
        let v = match ev.peek_var(sym) {
            Some(v) => v,
            None => {
                let frame = ev.current_frame();
                let v = Variable::empty(VarOrigin::File)
                    .defined_at(Some(frame), ev.loc)
                    .cell();
                ev.ctx.set_global_var(sym, v.clone(), false, None)?;
                v
            }
        };

        let mut v = v.write();
        if v.deprecated.is_some() {
            error_loc!(
                &*ev.ctx,
                ev.loc.as_ref(),
                "*** Cannot call KATI_deprecated_var on already deprecated variable: {}.",
                ev.sym(sym)
            );
        } else if v.obsolete() {
            error_loc!(
                &*ev.ctx,
                ev.loc.as_ref(),
                "*** Cannot call KATI_deprecated_var on already obsolete variable: {}.",
                ev.sym(sym)
            );
        }

        v.deprecated = Some(msg.clone());
    }
    Ok(())
}

fn obsolete_var_func(args: &[Arc<Value>], ev: &mut Evaluator, _out: &mut dyn BufMut) -> Result<()> {
    let vars_str = args[0].eval_to_buf(ev)?;
    let msg = Arc::new(if let Some(v) = args.get(1) {
        format!(". {}", String::from_utf8_lossy(&v.eval_to_buf(ev)?))
    } else {
        String::new()
    });

    if ev.avoid_io {
        error_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*** $(KATI_obsolete_var ...) is not supported in rules."
        );
    }

    for var in word_scanner(&vars_str) {
        let var = vars_str.slice_ref(var);
        let sym = ev.intern(var);
        let v = match ev.peek_var(sym) {
            Some(v) => v,
            None => {
                let frame = ev.current_frame();
                let v = Variable::empty(VarOrigin::File)
                    .defined_at(Some(frame), ev.loc)
                    .cell();
                ev.ctx.set_global_var(sym, v.clone(), false, None)?;
                v
            }
        };

        let mut v = v.write();
        if v.deprecated.is_some() {
            error_loc!(
                &*ev.ctx,
                ev.loc.as_ref(),
                "*** Cannot call KATI_obsolete_var on already deprecated variable: {}.",
                ev.sym(sym)
            );
        } else if v.obsolete() {
            error_loc!(
                &*ev.ctx,
                ev.loc.as_ref(),
                "*** Cannot call KATI_obsolete_var on already obsolete variable: {}.",
                ev.sym(sym)
            );
        }

        v.set_obsolete(msg.clone());
    }
    Ok(())
}

fn deprecate_export_func(
    args: &[Arc<Value>],
    ev: &mut Evaluator,
    _out: &mut dyn BufMut,
) -> Result<()> {
    let msg = format!(". {}", String::from_utf8_lossy(&args[0].eval_to_buf(ev)?));

    if ev.avoid_io {
        error_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*** $(KATI_deprecate_export) is not supported in rules."
        );
    }

    match &ev.export_allowed {
        ExportAllowed::Warning(_) => {
            error_loc!(&*ev.ctx, ev.loc.as_ref(), "*** Export is already deprecated.")
        }
        ExportAllowed::Error(_) => {
            error_loc!(&*ev.ctx, ev.loc.as_ref(), "*** Export is already obsolete.")
        }
        ExportAllowed::Allowed => {}
    }

    ev.export_allowed = ExportAllowed::Warning(msg);
    Ok(())
}

fn obsolete_export_func(
    args: &[Arc<Value>],
    ev: &mut Evaluator,
    _out: &mut dyn BufMut,
) -> Result<()> {
    let msg = format!(". {}", String::from_utf8_lossy(&args[0].eval_to_buf(ev)?));

    if ev.avoid_io {
        error_loc!(
            &*ev.ctx,
            ev.loc.as_ref(),
            "*** $(KATI_obsolete_export) is not supported in rules."
        );
    }

    if matches!(ev.export_allowed, ExportAllowed::Error(_)) {
        error_loc!(&*ev.ctx, ev.loc.as_ref(), "*** Export is already obsolete.");
    }

    ev.export_allowed = ExportAllowed::Error(msg);
    Ok(())
}

fn profile_makefile_func(
    args: &[Arc<Value>],
    ev: &mut Evaluator,
    _out: &mut dyn BufMut,
) -> Result<()> {
    for arg in args {
        let files = arg.eval_to_buf(ev)?;
        for file in word_scanner(&files) {
            ev.profiled_files.push(OsString::from_vec(file.to_vec()));
        }
    }
    Ok(())
}

fn variable_location_func(
    args: &[Arc<Value>],
    ev: &mut Evaluator,
    out: &mut dyn BufMut,
) -> Result<()> {
    let arg = args[0].eval_to_buf(ev)?;
    let mut ww = WordWriter::new(out);
    for var in word_scanner(&arg) {
        let var = arg.slice_ref(var);
        let sym = ev.intern(var);
        let l = ev
            .peek_var(sym)
            .and_then(|v| *v.read().loc())
            .unwrap_or_default();
        ww.write(l.render(&ev.ctx.symtab).as_bytes());
    }
    Ok(())
}

fn extra_file_deps_func(
    args: &[Arc<Value>],
    ev: &mut Evaluator,
    _out: &mut dyn BufMut,
) -> Result<()> {
    for arg in args {
        let files = arg.eval_to_buf(ev)?;
        for file in word_scanner(&files) {
            let fname = <OsStr as OsStrExt>::from_bytes(file);
            if !std::fs::exists(fname)? {
                error_loc!(
                    &*ev.ctx,
                    ev.loc.as_ref(),
                    "*** file does not exist: {}",
                    fname.to_string_lossy()
                );
            }
            ev.ctx.add_extra_file_dep(fname.to_os_string());
        }
    }
    Ok(())
}

fn visibility_prefix_func(
    args: &[Arc<Value>],
    ev: &mut Evaluator,
    _out: &mut dyn BufMut,
) -> Result<()> {
    let arg = args[0].eval_to_buf(ev)?;
    let mut prefixes: Vec<OsString> = Vec::new();

    for prefix in word_scanner(&args[1].eval_to_buf(ev)?) {
        if prefix.starts_with(b"/") {
            error_loc!(
                &*ev.ctx,
                ev.loc.as_ref(),
                "Visibility prefix should not start with /"
            );
        }
        if prefix.starts_with(b"../") {
            error_loc!(
                &*ev.ctx,
                ev.loc.as_ref(),
                "Visibility prefix should not start with ../"
            );
        }

        let normalized_prefix = normalize_path(prefix);
        if prefix != normalized_prefix {
            error_loc!(
                &*ev.ctx,
                ev.loc.as_ref(),
                "Visibility prefix {} is not normalized. Normalized prefix: {}",
                String::from_utf8_lossy(prefix),
                String::from_utf8_lossy(&normalized_prefix)
            );
        }

        // One visibility prefix cannot be the prefix of another.
        for p in &prefixes {
            if has_path_prefix(p.as_bytes(), prefix) {
                error_loc!(
                    &*ev.ctx,
                    ev.loc.as_ref(),
                    "Visibility prefix {} is the prefix of another visibility prefix {}",
                    String::from_utf8_lossy(prefix),
                    p.to_string_lossy(),
                );
            } else if has_path_prefix(prefix, p.as_bytes()) {
                error_loc!(
                    &*ev.ctx,
                    ev.loc.as_ref(),
                    "Visibility prefix {} is the prefix of another visibility prefix {}",
                    p.to_string_lossy(),
                    String::from_utf8_lossy(prefix),
                );
            }
        }

        prefixes.push(OsStringExt::from_vec(normalized_prefix.to_vec()));
    }

    let sym = ev.intern(arg);
    let v = if let Some(v) = ev.peek_var(sym) {
        v
    } else {
        let frame = ev.current_frame();
        let v = Variable::empty(VarOrigin::File)
            .defined_at(Some(frame), ev.loc)
            .cell();
        ev.ctx.set_global_var(sym, v.clone(), false, None)?;
        v
    };
    if !prefixes.is_empty() {
        v.write().set_visibility_prefix(ev.ctx, prefixes, sym)?;
    }

    Ok(())
}

fn debug_var_func(args: &[Arc<Value>], ev: &mut Evaluator, _out: &mut dyn BufMut) -> Result<()> {
    let a = args[0].eval_to_buf(ev)?;
    let loc = ev.loc.unwrap_or_default().render(&ev.ctx.symtab);
    for tok in word_scanner(&a) {
        let tok = a.slice_ref(tok);
        let sym = ev.intern(tok);
        let name = ev.sym(sym);
        let Some(v) = ev.lookup_var(sym)? else {
            println!("{loc}: Variable {name:?} is undefined");
            continue;
        };
        let val = {
            let v = v.read();
            v.eval_to_buf(ev)?
        };
        println!("{loc}: Variable {name:?}={val:?} ({:?})", v.read())
    }
    Ok(())
}

const fn func(name: &'static [u8], f: MakeFuncImpl, arity: i16) -> FuncInfo {
    FuncInfo {
        name,
        func: f,
        arity,
        min_arity: arity,
        trim_space: false,
        trim_right_space_1st: false,
    }
}

const FUNC_INFO: &[FuncInfo] = &[
    func(b"patsubst", patsubst_func, 3),
    func(b"strip", strip_func, 1),
    func(b"subst", subst_func, 3),
    func(b"findstring", findstring_func, 2),
    func(b"filter", filter_func, 2),
    func(b"filter-out", filter_out_func, 2),
    func(b"sort", sort_func, 1),
    func(b"word", word_func, 2),
    func(b"wordlist", wordlist_func, 3),
    func(b"words", words_func, 1),
    func(b"firstword", firstword_func, 1),
    func(b"lastword", lastword_func, 1),
    func(b"join", join_func, 2),
    func(b"wildcard", wildcard_func, 1),
    func(b"dir", dir_func, 1),
    func(b"notdir", notdir_func, 1),
    func(b"suffix", suffix_func, 1),
    func(b"basename", basename_func, 1),
    func(b"addsuffix", addsuffix_func, 2),
    func(b"addprefix", addprefix_func, 2),
    func(b"realpath", realpath_func, 1),
    func(b"abspath", abspath_func, 1),
    FuncInfo {
        name: b"if",
        func: if_func,
        arity: 3,
        min_arity: 2,
        trim_space: false,
        trim_right_space_1st: true,
    },
    FuncInfo {
        name: b"and",
        func: and_func,
        arity: 0,
        min_arity: 0,
        trim_space: true,
        trim_right_space_1st: false,
    },
    FuncInfo {
        name: b"or",
        func: or_func,
        arity: 0,
        min_arity: 0,
        trim_space: true,
        trim_right_space_1st: false,
    },
    func(b"value", value_func, 1),
    func(b"eval", eval_func, 1),
    func(b"shell", shell_func, 1),
    func(b"call", call_func, 0),
    func(b"foreach", foreach_func, 3),
    func(b"origin", origin_func, 1),
    func(b"flavor", flavor_func, 1),
    func(b"info", info_func, 1),
    func(b"warning", warning_func, 1),
    func(b"error", error_func, 1),
    FuncInfo {
        name: b"file",
        func: file_func,
        arity: 2,
        min_arity: 1,
        trim_space: false,
        trim_right_space_1st: false,
    },
    /* Extension functions */
    FuncInfo {
        name: b"KATI_deprecated_var",
        func: deprecated_var_func,
        arity: 2,
        min_arity: 1,
        trim_space: false,
        trim_right_space_1st: false,
    },
    FuncInfo {
        name: b"KATI_obsolete_var",
        func: obsolete_var_func,
        arity: 2,
        min_arity: 1,
        trim_space: false,
        trim_right_space_1st: false,
    },
    func(b"KATI_deprecate_export", deprecate_export_func, 1),
    func(b"KATI_obsolete_export", obsolete_export_func, 1),
    func(b"KATI_profile_makefile", profile_makefile_func, 0),
    func(b"KATI_variable_location", variable_location_func, 1),
    func(b"KATI_extra_file_deps", extra_file_deps_func, 0),
    func(b"KATI_shell_no_rerun", shell_no_rerun_func, 1),
    func(b"KATI_foreach_sep", foreach_sep_func, 4),
    FuncInfo {
        name: b"KATI_file_no_rerun",
        func: file_no_rerun_func,
        arity: 2,
        min_arity: 1,
        trim_space: false,
        trim_right_space_1st: false,
    },
    FuncInfo {
        name: b"KATI_visibility_prefix",
        func: visibility_prefix_func,
        arity: 2,
        min_arity: 1,
        trim_space: false,
        trim_right_space_1st: false,
    },
    func(b"KATI_debug_var", debug_var_func, 1),
];

static FUNC_INFO_MAP: LazyLock<HashMap<&'static [u8], &'static FuncInfo>> =
    LazyLock::new(|| FUNC_INFO.iter().map(|f| (f.name, f)).collect());

pub fn get_func_info(name: &[u8]) -> Option<&'static FuncInfo> {
    FUNC_INFO_MAP.get(name).map(|v| &**v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    fn eval_expr(ev: &mut Evaluator, text: &'static [u8]) -> String {
        let mut loc = Loc::default();
        let expr = crate::expr::parse_expr(
            ev.ctx,
            &mut loc,
            Bytes::from_static(text),
            crate::expr::ParseExprOpt::Normal,
        )
        .unwrap();
        String::from_utf8(expr.eval_to_buf(ev).unwrap().to_vec()).unwrap()
    }

    fn eval_stmts(ev: &mut Evaluator, text: &'static [u8]) {
        let stmts = parse_buf(ev.ctx, &Bytes::from_static(text), Loc::default()).unwrap();
        let stmts = stmts.lock();
        for stmt in stmts.iter() {
            stmt.eval(ev).unwrap();
        }
    }

    #[test]
    fn test_patsubst() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        assert_eq!(eval_expr(&mut ev, b"$(patsubst %.c,%.o,a.c b.c c.h)"), "a.o b.o c.h");
        assert_eq!(eval_expr(&mut ev, b"$(patsubst %, %, x)"), "x");
    }

    #[test]
    fn test_strip_subst_findstring() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        assert_eq!(eval_expr(&mut ev, b"$(strip  a   b  c )"), "a b c");
        assert_eq!(eval_expr(&mut ev, b"$(subst ee,EE,feet on the street)"), "fEEt on the strEEt");
        assert_eq!(eval_expr(&mut ev, b"$(findstring a,a b c)"), "a");
        assert_eq!(eval_expr(&mut ev, b"$(findstring z,a b c)"), "");
    }

    #[test]
    fn test_subst_identity() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        assert_eq!(eval_expr(&mut ev, b"$(subst a,a,axa)"), "axa");
    }

    #[test]
    fn test_filter() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        assert_eq!(
            eval_expr(&mut ev, b"$(filter %.c %.s,foo.c bar.c baz.s ugh.h)"),
            "foo.c bar.c baz.s"
        );
        assert_eq!(
            eval_expr(&mut ev, b"$(filter-out %.c,foo.c bar.h)"),
            "bar.h"
        );
    }

    #[test]
    fn test_sort_is_idempotent() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        assert_eq!(eval_expr(&mut ev, b"$(sort foo bar lose bar)"), "bar foo lose");
        assert_eq!(eval_expr(&mut ev, b"$(sort $(sort foo bar lose bar))"), "bar foo lose");
    }

    #[test]
    fn test_word_selection() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        assert_eq!(eval_expr(&mut ev, b"$(word 2,a b c)"), "b");
        assert_eq!(eval_expr(&mut ev, b"$(word 1,)"), "");
        assert_eq!(eval_expr(&mut ev, b"$(wordlist 2,3,a b c d)"), "b c");
        assert_eq!(eval_expr(&mut ev, b"$(wordlist 2,1,a b c)"), "");
        assert_eq!(eval_expr(&mut ev, b"$(wordlist 1,99,a b c)"), "a b c");
        assert_eq!(eval_expr(&mut ev, b"$(words a b c)"), "3");
        assert_eq!(eval_expr(&mut ev, b"$(words )"), "0");
        assert_eq!(eval_expr(&mut ev, b"$(firstword a b)"), "a");
        assert_eq!(eval_expr(&mut ev, b"$(lastword a b)"), "b");
    }

    #[test]
    fn test_word_zero_is_fatal() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        let mut loc = Loc::default();
        let expr = crate::expr::parse_expr(
            ev.ctx,
            &mut loc,
            Bytes::from_static(b"$(word 0,a b)"),
            crate::expr::ParseExprOpt::Normal,
        )
        .unwrap();
        let err = expr.eval_to_buf(&mut ev).unwrap_err().to_string();
        assert!(err.contains("must be greater than 0"), "{err}");
    }

    #[test]
    fn test_join() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        assert_eq!(eval_expr(&mut ev, b"$(join a b,.c .o)"), "a.c b.o");
        assert_eq!(eval_expr(&mut ev, b"$(join a b c,.c)"), "a.c b c");
    }

    #[test]
    fn test_path_funcs() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        assert_eq!(eval_expr(&mut ev, b"$(dir src/foo.c hacks)"), "src/ ./");
        assert_eq!(eval_expr(&mut ev, b"$(notdir src/foo.c hacks)"), "foo.c hacks");
        assert_eq!(eval_expr(&mut ev, b"$(suffix src/foo.c hacks)"), ".c");
        assert_eq!(eval_expr(&mut ev, b"$(basename src/foo.c hacks)"), "src/foo hacks");
        assert_eq!(eval_expr(&mut ev, b"$(addsuffix .c,foo bar)"), "foo.c bar.c");
        assert_eq!(eval_expr(&mut ev, b"$(addprefix src/,foo bar)"), "src/foo src/bar");
    }

    #[test]
    fn test_if_and_or() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        assert_eq!(eval_expr(&mut ev, b"$(if ,yes,no)"), "no");
        assert_eq!(eval_expr(&mut ev, b"$(if x,yes,no)"), "yes");
        assert_eq!(eval_expr(&mut ev, b"$(if x,yes)"), "yes");
        assert_eq!(eval_expr(&mut ev, b"$(if ,yes)"), "");
        assert_eq!(eval_expr(&mut ev, b"$(and a,b,c)"), "c");
        assert_eq!(eval_expr(&mut ev, b"$(and a,,c)"), "");
        assert_eq!(eval_expr(&mut ev, b"$(or ,b,c)"), "b");
        assert_eq!(eval_expr(&mut ev, b"$(or ,,)"), "");
    }

    #[test]
    fn test_if_only_evaluates_taken_branch() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        // The $(error) in the dead branch must not run.
        assert_eq!(eval_expr(&mut ev, b"$(if x,ok,$(error dead))"), "ok");
    }

    #[test]
    fn test_value_func() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        eval_stmts(&mut ev, b"FOO = $PATH\n");
        assert_eq!(eval_expr(&mut ev, b"$(value FOO)"), "$PATH");
    }

    #[test]
    fn test_eval_func_injects_rule() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        eval_stmts(&mut ev, b"define R\nx:\n\techo X\nendef\n$(eval $(R))\n");
        assert_eq!(ev.rules.len(), 1);
        let x = ev.intern("x");
        assert_eq!(ev.rules[0].outputs, vec![x]);
        assert_eq!(ev.rules[0].cmds.len(), 1);
    }

    #[test]
    fn test_call_binds_positional_params() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        eval_stmts(&mut ev, b"fn = $(1)$(2)\n");
        assert_eq!(eval_expr(&mut ev, b"$(call fn,a,b)"), "ab");
        // Bindings must not leak out of the call.
        assert_eq!(eval_expr(&mut ev, b"$(1)"), "");
    }

    #[test]
    fn test_foreach() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        assert_eq!(eval_expr(&mut ev, b"$(foreach v,a b c,$(v))"), "a b c");
        assert_eq!(eval_expr(&mut ev, b"$(foreach v,a b c,x$(v))"), "xa xb xc");
    }

    #[test]
    fn test_origin_and_flavor() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        eval_stmts(&mut ev, b"S := simple\nR = recursive\n");
        assert_eq!(eval_expr(&mut ev, b"$(origin S)"), "file");
        assert_eq!(eval_expr(&mut ev, b"$(origin NOPE)"), "undefined");
        assert_eq!(eval_expr(&mut ev, b"$(flavor S)"), "simple");
        assert_eq!(eval_expr(&mut ev, b"$(flavor R)"), "recursive");
        assert_eq!(eval_expr(&mut ev, b"$(flavor NOPE)"), "undefined");
    }

    #[test]
    fn test_error_func_aborts() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        let mut loc = Loc::default();
        let expr = crate::expr::parse_expr(
            ev.ctx,
            &mut loc,
            Bytes::from_static(b"$(error boom)"),
            crate::expr::ParseExprOpt::Normal,
        )
        .unwrap();
        let err = expr.eval_to_buf(&mut ev).unwrap_err().to_string();
        assert!(err.contains("*** boom."), "{err}");
    }

    #[test]
    fn test_shell_func_records_status() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        eval_stmts(&mut ev, b"SHELL := /bin/sh\n");
        assert_eq!(eval_expr(&mut ev, b"$(shell echo hi)"), "hi");
        assert_eq!(ev.ctx.shell_status, Some(0));
        assert_eq!(eval_expr(&mut ev, b"$(shell false)"), "");
        assert_eq!(ev.ctx.shell_status, Some(1));
        assert_eq!(eval_expr(&mut ev, b"$(.SHELLSTATUS)"), "1");
        assert_eq!(ev.ctx.command_log.len(), 2);
    }

    #[test]
    fn test_strip_shell_comment() {
        assert_eq!(
            strip_shell_comment(Bytes::from_static(b"echo hi # comment")),
            Bytes::from_static(b"echo hi ")
        );
        assert_eq!(
            strip_shell_comment(Bytes::from_static(b"echo 'hi # not comment'")),
            Bytes::from_static(b"echo 'hi # not comment'")
        );
    }
}
