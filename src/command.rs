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

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::{collections::HashSet, fmt::Debug, sync::Arc};

use crate::{
    dep::{DepGraph, NodeId},
    error_loc,
    eval::Evaluator,
    exec::ExecStatus,
    expr::Evaluable,
    fileutil::get_timestamp,
    strutil::{
        Pattern, WordWriter, basename, dirname, find_end_of_line, trim_left_space, word_scanner,
    },
    symtab::Symbol,
    var::Variable,
};

/// The node data automatic variables read from, snapshotted for the duration
/// of one node's recipe expansion.
#[derive(Clone, Debug)]
pub struct AutoScope {
    pub output: Symbol,
    pub actual_inputs: Vec<Symbol>,
    pub output_pattern: Option<Symbol>,
}

#[derive(Clone, Debug)]
enum AutoKind {
    At,
    Less,
    Hat,
    Plus,
    Star,
    Question { found_new_inputs: Arc<Mutex<bool>> },
    NotImplemented,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AutoSuffix {
    None,
    Dir,
    File,
}

/// One of `$@ $< $^ $+ $* $?` (or a `D`/`F` variant), installed as a global
/// variable that reads the current [`AutoScope`].
pub struct AutoVar {
    kind: AutoKind,
    sym: Symbol,
    suffix: AutoSuffix,
    scope: Arc<Mutex<Option<AutoScope>>>,
}

impl AutoVar {
    pub fn eval(&self, ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
        match self.suffix {
            AutoSuffix::None => self.eval_impl(ev, out)?,
            AutoSuffix::Dir => {
                let mut buf = BytesMut::new();
                self.eval_impl(ev, &mut buf)?;
                let buf = Bytes::from(buf);
                let mut ww = WordWriter::new(out);
                for tok in word_scanner(&buf) {
                    let tok = buf.slice_ref(tok);
                    ww.write(&dirname(&tok))
                }
            }
            AutoSuffix::File => {
                let mut buf = BytesMut::new();
                self.eval_impl(ev, &mut buf)?;
                let buf = Bytes::from(buf);
                let mut ww = WordWriter::new(out);
                for tok in word_scanner(&buf) {
                    ww.write(basename(tok))
                }
            }
        }
        Ok(())
    }

    fn eval_impl(&self, ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
        let scope = self.scope.lock().clone();
        let scope = scope.as_ref().unwrap();

        match &self.kind {
            AutoKind::At => {
                out.put_slice(&ev.ctx.symtab.resolve(scope.output));
            }
            AutoKind::Less => {
                if let Some(ai) = scope.actual_inputs.first() {
                    out.put_slice(&ev.ctx.symtab.resolve(*ai));
                }
            }
            AutoKind::Hat => {
                let mut seen = HashSet::new();
                let mut ww = WordWriter::new(out);
                for ai in scope.actual_inputs.iter() {
                    if seen.insert(*ai) {
                        ww.write(&ev.ctx.symtab.resolve(*ai))
                    }
                }
            }
            AutoKind::Plus => {
                let mut ww = WordWriter::new(out);
                for ai in scope.actual_inputs.iter() {
                    ww.write(&ev.ctx.symtab.resolve(*ai))
                }
            }
            AutoKind::Star => {
                if let Some(output_pattern) = &scope.output_pattern {
                    let pat = Pattern::new(ev.ctx.symtab.resolve(*output_pattern));
                    out.put_slice(pat.stem(&ev.ctx.symtab.resolve(scope.output)))
                }
            }
            AutoKind::Question { found_new_inputs } => {
                let mut seen: HashSet<Symbol> = HashSet::new();

                if ev.avoid_io {
                    // The timestamp comparison must happen at build time; a
                    // delayed command computes KATI_NEW_INPUTS at the start
                    // of the rule.
                    out.put_slice(b"${KATI_NEW_INPUTS}");
                    if !*found_new_inputs.lock() {
                        let mut def = BytesMut::new();

                        let mut ww = WordWriter::new(&mut def);
                        ww.write(b"KATI_NEW_INPUTS=$(find");
                        for ai in scope.actual_inputs.iter() {
                            if seen.insert(*ai) {
                                ww.write(&ev.ctx.symtab.resolve(*ai));
                            }
                        }
                        ww.write(b"$(test -e");
                        ww.write(&ev.ctx.symtab.resolve(scope.output));
                        ww.write(b"&& echo -newer");
                        ww.write(&ev.ctx.symtab.resolve(scope.output));
                        ww.write(b")) && export KATI_NEW_INPUTS");
                        ev.delayed_output_commands.push(def.freeze());
                        *found_new_inputs.lock() = true;
                    }
                } else {
                    let mut ww = WordWriter::new(out);
                    let target_age = ExecStatus::Timestamp(get_timestamp(
                        &ev.ctx.symtab.resolve(scope.output),
                    )?);
                    for ai in scope.actual_inputs.iter() {
                        let ai_str = ev.ctx.symtab.resolve(*ai);
                        if seen.insert(*ai)
                            && ExecStatus::Timestamp(get_timestamp(&ai_str)?) > target_age
                        {
                            ww.write(&ai_str)
                        }
                    }
                }
            }
            AutoKind::NotImplemented => {
                error_loc!(
                    &*ev.ctx,
                    ev.loc.as_ref(),
                    "Automatic variable `${}' isn't supported yet",
                    ev.sym(self.sym)
                );
            }
        }
        Ok(())
    }
}

impl Debug for AutoVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AutoVar({:?})", self.sym)
    }
}

/// One expanded recipe line, ready for the executor or an external emitter.
pub struct Command {
    pub output: Symbol,
    pub cmd: Bytes,
    pub echo: bool,
    pub ignore_error: bool,
    pub force_no_subshell: bool,
}

fn parse_command_prefixes(cmds: Bytes, echo: &mut bool, ignore_error: &mut bool) -> Bytes {
    let mut s = trim_left_space(&cmds);
    while !s.is_empty() {
        match s[0] {
            b'@' => {
                *echo = false;
            }
            b'-' => {
                *ignore_error = true;
            }
            b'+' => {
                // ignore recursion marker
            }
            _ => {
                break;
            }
        }
        s = trim_left_space(&s[1..]);
    }
    cmds.slice_ref(s)
}

pub struct CommandEvaluator<'a, 'c> {
    pub ev: &'a mut Evaluator<'c>,
    scope: Arc<Mutex<Option<AutoScope>>>,
    found_new_inputs: Arc<Mutex<bool>>,
}

impl<'a, 'c> CommandEvaluator<'a, 'c> {
    pub fn new(ev: &'a mut Evaluator<'c>) -> Result<Self> {
        let found_new_inputs = Arc::new(Mutex::new(false));
        let mut ret = Self {
            ev,
            scope: Arc::new(Mutex::new(None)),
            found_new_inputs: found_new_inputs.clone(),
        };
        ret.register_auto_var('@', AutoKind::At)?;
        ret.register_auto_var('<', AutoKind::Less)?;
        ret.register_auto_var('^', AutoKind::Hat)?;
        ret.register_auto_var('+', AutoKind::Plus)?;
        ret.register_auto_var('*', AutoKind::Star)?;
        ret.register_auto_var('?', AutoKind::Question { found_new_inputs })?;
        // TODO: Implement $% (archive member) and $| (order-only inputs).
        ret.register_auto_var('%', AutoKind::NotImplemented)?;
        ret.register_auto_var('|', AutoKind::NotImplemented)?;
        Ok(ret)
    }

    fn register_auto_var(&mut self, c: char, kind: AutoKind) -> Result<()> {
        for (name, suffix) in [
            (c.to_string(), AutoSuffix::None),
            (format!("{c}D"), AutoSuffix::Dir),
            (format!("{c}F"), AutoSuffix::File),
        ] {
            let sym = self.ev.intern(name);
            let v = Variable::automatic(
                sym,
                AutoVar {
                    kind: kind.clone(),
                    sym,
                    suffix,
                    scope: self.scope.clone(),
                },
            );
            self.ev.ctx.swap_global(sym, Some(v));
        }
        Ok(())
    }

    pub fn eval(&mut self, graph: &DepGraph, id: NodeId) -> Result<Vec<Command>> {
        let mut result: Vec<Command> = Vec::new();
        let n = graph.node(id);
        self.ev.loc = n.loc;
        self.ev.current_scope = n.rule_vars.clone();
        self.ev.is_evaluating_command = true;
        *self.scope.lock() = Some(AutoScope {
            output: n.output,
            actual_inputs: n.actual_inputs.clone(),
            output_pattern: n.output_pattern,
        });
        *self.found_new_inputs.lock() = false;

        for v in &n.cmds {
            self.ev.loc = v.loc();
            let cmds_buf = v.eval_to_buf(self.ev)?;
            let mut cmds = cmds_buf.clone();
            let mut global_echo = !self.ev.ctx.flags.is_silent_mode;
            let mut global_ignore_error = false;
            cmds = parse_command_prefixes(cmds, &mut global_echo, &mut global_ignore_error);
            if cmds.is_empty() {
                continue;
            }
            while !cmds.is_empty() {
                let eol = find_end_of_line(&cmds);
                let mut cmd = eol.line.slice_ref(trim_left_space(&eol.line));
                cmds = eol.rest;

                let mut echo = global_echo;
                let mut ignore_error = global_ignore_error;
                cmd = parse_command_prefixes(cmd, &mut echo, &mut ignore_error);

                if !cmd.is_empty() {
                    result.push(Command {
                        output: n.output,
                        cmd,
                        echo,
                        ignore_error,
                        force_no_subshell: false,
                    })
                }
            }
        }

        if !self.ev.delayed_output_commands.is_empty() {
            let mut output_commands = Vec::new();
            for cmd in &self.ev.delayed_output_commands {
                output_commands.push(Command {
                    output: n.output,
                    cmd: cmd.clone(),
                    echo: false,
                    ignore_error: false,
                    force_no_subshell: true,
                })
            }
            // Prepend |output_commands|.
            std::mem::swap(&mut result, &mut output_commands);
            result.extend(output_commands);
            self.ev.delayed_output_commands.clear();
        }

        self.ev.current_scope = None;
        self.ev.is_evaluating_command = false;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::dep::make_dep;
    use crate::loc::Loc;
    use crate::parser::parse_buf;

    fn eval_commands(
        ctx: &mut Context,
        text: &'static [u8],
        targets: &[&str],
    ) -> Vec<(String, bool, bool)> {
        let mut ev = Evaluator::new(ctx);
        let stmts = parse_buf(ev.ctx, &Bytes::from_static(text), Loc::default()).unwrap();
        {
            let stmts = stmts.lock();
            for stmt in stmts.iter() {
                stmt.eval(&mut ev).unwrap();
            }
        }
        let targets = targets
            .iter()
            .map(|t| ev.intern(t.as_bytes().to_vec()))
            .collect();
        let graph = make_dep(&mut ev, targets).unwrap();
        let mut ce = CommandEvaluator::new(&mut ev).unwrap();
        let mut out = Vec::new();
        for (_, root) in &graph.roots {
            for command in ce.eval(&graph, *root).unwrap() {
                out.push((
                    String::from_utf8(command.cmd.to_vec()).unwrap(),
                    command.echo,
                    command.ignore_error,
                ));
            }
        }
        out
    }

    #[test]
    fn test_basic_substitution() {
        let mut ctx = Context::for_tests();
        let cmds = eval_commands(
            &mut ctx,
            b"A := hello\nB = $(A) world\nall:\n\techo $(B)\n",
            &[],
        );
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].0, "echo hello world");
    }

    #[test]
    fn test_automatic_vars() {
        let mut ctx = Context::for_tests();
        let cmds = eval_commands(
            &mut ctx,
            b"in1:\n\techo i\nin2:\n\techo i\nout: in1 in2 in1\n\techo $@ $< $^ $+\n",
            &["out"],
        );
        assert_eq!(cmds.last().unwrap().0, "echo out in1 in1 in2 in1 in2 in1");
    }

    #[test]
    fn test_auto_var_d_and_f_variants() {
        let mut ctx = Context::for_tests();
        let cmds = eval_commands(
            &mut ctx,
            b"dir/out:\n\techo $(@D) $(@F)\n",
            &["dir/out"],
        );
        assert_eq!(cmds[0].0, "echo dir out");
    }

    #[test]
    fn test_command_prefixes() {
        let mut ctx = Context::for_tests();
        let cmds = eval_commands(
            &mut ctx,
            b"all:\n\t@echo quiet\n\t-echo tolerant\n\t+echo recur\n",
            &["all"],
        );
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0], ("echo quiet".to_string(), false, false));
        assert_eq!(cmds[1], ("echo tolerant".to_string(), true, true));
        assert_eq!(cmds[2], ("echo recur".to_string(), true, false));
    }

    #[test]
    fn test_target_specific_append() {
        let mut ctx = Context::for_tests();
        let cmds = eval_commands(
            &mut ctx,
            b"CFLAGS := -O\nfoo.o: CFLAGS += -g\nfoo.o:\n\techo $(CFLAGS)\n",
            &["foo.o"],
        );
        assert_eq!(cmds[0].0, "echo -O -g");
    }

    #[test]
    fn test_stem_substitution() {
        let mut ctx = Context::for_tests();
        let cmds = eval_commands(
            &mut ctx,
            b"a.c:\n\techo src\nobjs := a.o\nall: $(objs)\n\techo all\n$(objs): %.o: %.c\n\techo CC $* -> $@ from $<\n",
            &["a.o"],
        );
        assert_eq!(cmds[0].0, "echo CC a -> a.o from a.c");
    }
}
