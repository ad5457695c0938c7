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

//! Whole-pipeline tests: makefile text through parse, evaluation, dependency
//! analysis, and command expansion.

use std::collections::HashSet;
use std::path::PathBuf;

use bytes::Bytes;
use maku::command::CommandEvaluator;
use maku::context::Context;
use maku::dep::make_dep;
use maku::eval::Evaluator;
use maku::fileutil::{RedirectStderr, run_command};
use maku::func::CommandOp;
use maku::loc::Loc;
use maku::parser::parse_buf;
use maku::strutil::word_scanner;

fn eval_all(ev: &mut Evaluator, text: &str) {
    let stmts = parse_buf(ev.ctx, &Bytes::from(text.as_bytes().to_vec()), Loc::default()).unwrap();
    let stmts = stmts.lock();
    for stmt in stmts.iter() {
        stmt.eval(ev).unwrap();
    }
}

/// Parses and evaluates `text`, builds the graph for `targets`, and expands
/// every root's recipe.
fn make_commands(ctx: &mut Context, text: &str, targets: &[&str]) -> Vec<(String, Vec<String>)> {
    let mut ev = Evaluator::new(ctx);
    eval_all(&mut ev, text);
    let targets = targets
        .iter()
        .map(|t| ev.intern(t.as_bytes().to_vec()))
        .collect();
    let graph = make_dep(&mut ev, targets).unwrap();
    let mut ce = CommandEvaluator::new(&mut ev).unwrap();
    let mut ret = Vec::new();
    for (sym, root) in &graph.roots {
        let cmds = ce
            .eval(&graph, *root)
            .unwrap()
            .into_iter()
            .map(|c| String::from_utf8(c.cmd.to_vec()).unwrap())
            .collect();
        ret.push((ce.ev.sym(*sym), cmds));
    }
    ret
}

struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn new(name: &str) -> ScratchDir {
        let path = std::env::temp_dir().join(format!("maku_e2e_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        ScratchDir { path }
    }

    fn file(&self, name: &str, contents: &str) -> String {
        let p = self.path.join(name);
        std::fs::write(&p, contents).unwrap();
        p.to_str().unwrap().to_string()
    }

    fn join(&self, name: &str) -> String {
        self.path.join(name).to_str().unwrap().to_string()
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[test]
fn basic_substitution() {
    let mut ctx = Context::for_tests();
    let got = make_commands(&mut ctx, "A := hello\nB  = $(A) world\nall:\n\techo $(B)\n", &[]);
    assert_eq!(got, vec![("all".to_string(), vec!["echo hello world".to_string()])]);
}

#[test]
fn static_pattern_rule_with_stem() {
    let scratch = ScratchDir::new("static_pattern");
    let a_c = scratch.file("a.c", "");
    let b_c = scratch.file("b.c", "");
    let a_o = scratch.join("a.o");
    let b_o = scratch.join("b.o");
    let text = format!(
        "objs := {a_o} {b_o}\nall: $(objs)\n\techo done\n$(objs): %.o: %.c\n\techo CC $* -> $@ from $<\n"
    );
    let mut ctx = Context::for_tests();
    let got = make_commands(&mut ctx, &text, &[&a_o]);
    let stem = a_o.strip_suffix(".o").unwrap();
    assert_eq!(
        got[0].1,
        vec![format!("echo CC {stem} -> {a_o} from {a_c}")]
    );
    let _ = b_c;
}

#[test]
fn suffix_rule_picked_by_extension() {
    let scratch = ScratchDir::new("suffix_rule");
    let foo_c = scratch.file("foo.c", "");
    let foo_o = scratch.join("foo.o");
    let text = format!(".c.o:\n\techo SUF $<\ntest: {foo_o}\n\techo linked\n");
    let mut ctx = Context::for_tests();
    let got = make_commands(&mut ctx, &text, &[&foo_o]);
    assert_eq!(got[0].1, vec![format!("echo SUF {foo_c}")]);
}

#[test]
fn target_specific_var_with_append_inheritance() {
    let mut ctx = Context::for_tests();
    let got = make_commands(
        &mut ctx,
        "CFLAGS := -O\nfoo.o: CFLAGS += -g\nfoo.o:\n\techo $(CFLAGS)\n",
        &["foo.o"],
    );
    assert_eq!(got[0].1, vec!["echo -O -g".to_string()]);
}

#[test]
fn eval_injects_rule_at_runtime() {
    let mut ctx = Context::for_tests();
    let got = make_commands(
        &mut ctx,
        "define R\nx:\n\techo X\nendef\n$(eval $(R))\n",
        &["x"],
    );
    assert_eq!(got, vec![("x".to_string(), vec!["echo X".to_string()])]);
}

#[test]
fn find_emulator_matches_real_find() {
    let mut ctx = Context::for_tests();
    ctx.flags.use_find_emulator = true;
    let mut ev = Evaluator::new(&mut ctx);
    eval_all(
        &mut ev,
        "SHELL := /bin/sh\nFILES := $(shell find testdata/find/d -name '*.c')\n",
    );
    let files_sym = ev.intern("FILES");
    let emulated = ev.eval_var(files_sym).unwrap();
    let emulated: HashSet<Vec<u8>> = word_scanner(&emulated).map(|t| t.to_vec()).collect();

    let (status, real) = run_command(
        b"/bin/sh",
        b"-c",
        &Bytes::from_static(b"find testdata/find/d -name '*.c'"),
        RedirectStderr::None,
    )
    .unwrap();
    assert!(status.success());
    let real: HashSet<Vec<u8>> = word_scanner(&real).map(|t| t.to_vec()).collect();

    assert_eq!(emulated, real);
    assert!(!emulated.is_empty());

    // The emulator handled it, so the log records a find, with exit 0.
    assert_eq!(ev.ctx.shell_status, Some(0));
    assert!(matches!(ev.ctx.command_log[0].op, CommandOp::Find));
}

#[test]
fn find_emulator_falls_back_for_unsupported_commands() {
    let mut ctx = Context::for_tests();
    ctx.flags.use_find_emulator = true;
    let mut ev = Evaluator::new(&mut ctx);
    eval_all(
        &mut ev,
        "SHELL := /bin/sh\nOUT := $(shell find testdata/find/d -name '*.c' | head -1)\n",
    );
    let out_sym = ev.intern("OUT");
    let out = ev.eval_var(out_sym).unwrap();
    // The pipe is unsupported, so a real shell produced one line.
    assert_eq!(word_scanner(&out).count(), 1);
    assert!(matches!(ev.ctx.command_log[0].op, CommandOp::Shell));
}

#[test]
fn file_read_of_missing_file_records_dependency() {
    let scratch = ScratchDir::new("file_missing");
    let missing = scratch.join("not_there");
    let mut ctx = Context::for_tests();
    let mut ev = Evaluator::new(&mut ctx);
    eval_all(&mut ev, &format!("X := $(file <{missing})\n"));
    let x = ev.intern("X");
    assert_eq!(ev.eval_var(x).unwrap(), Bytes::new());
    assert!(matches!(ev.ctx.command_log[0].op, CommandOp::ReadMissing));
}

#[test]
fn file_write_then_read_round_trips() {
    let scratch = ScratchDir::new("file_write");
    let path = scratch.join("out.txt");
    let mut ctx = Context::for_tests();
    let mut ev = Evaluator::new(&mut ctx);
    eval_all(
        &mut ev,
        &format!("$(file >{path},hello)\n$(file >>{path},again)\nX := $(file <{path})\n"),
    );
    let x = ev.intern("X");
    assert_eq!(
        ev.eval_var(x).unwrap(),
        Bytes::from_static(b"hello\nagain")
    );
}

#[test]
fn circular_dependency_logs_and_terminates() {
    let mut ctx = Context::for_tests();
    let got = make_commands(&mut ctx, "a: b\n\techo a\nb: a\n\techo b\n", &["a"]);
    // If the cycle were kept this would not terminate; the dropped edge
    // leaves both commands reachable.
    assert_eq!(got[0].1, vec!["echo a".to_string()]);
}

#[test]
fn foreach_call_and_if_laws() {
    let mut ctx = Context::for_tests();
    let mut ev = Evaluator::new(&mut ctx);
    eval_all(
        &mut ev,
        concat!(
            "fn = $(1)$(2)\n",
            "R1 := $(call fn,a,b)\n",
            "R2 := $(foreach v,1 2 3,$(v))\n",
            "R3 := $(if ,yes,no)$(if x,yes,no)\n",
            "R4 := $(patsubst %,%,  x   y )\n",
        ),
    );
    for (name, want) in [
        ("R1", "ab"),
        ("R2", "1 2 3"),
        ("R3", "noyes"),
        ("R4", "x y"),
    ] {
        let sym = ev.intern(name);
        assert_eq!(
            ev.eval_var(sym).unwrap(),
            Bytes::from(want.as_bytes().to_vec()),
            "{name}"
        );
    }
}

#[test]
fn environment_origin_and_exports() {
    let mut ctx = Context::for_tests();
    let mut ev = Evaluator::new(&mut ctx);
    // Simulate the env import done by the driver.
    let sym = ev.intern("FROM_ENV");
    let val = Bytes::from_static(b"outside");
    let var = maku::var::Variable::recursive(
        std::sync::Arc::new(maku::expr::Value::Literal(None, val.clone())),
        val,
        maku::var::VarOrigin::Environment,
    )
    .cell();
    ev.ctx.set_global_var(sym, var, false, None).unwrap();

    eval_all(
        &mut ev,
        "O := $(origin FROM_ENV)\nexport FROM_ENV\nunexport OTHER\n",
    );
    let o = ev.intern("O");
    assert_eq!(ev.eval_var(o).unwrap(), Bytes::from_static(b"environment"));
    assert!(ev.ctx.used_env_vars.contains(sym));

    let other = ev.intern("OTHER");
    assert_eq!(ev.exports.get(&sym), Some(&true));
    assert_eq!(ev.exports.get(&other), Some(&false));
}

#[test]
fn gen_all_targets_collects_non_root_targets() {
    let mut ctx = Context::for_tests();
    ctx.flags.gen_all_targets = true;
    let mut ev = Evaluator::new(&mut ctx);
    eval_all(
        &mut ev,
        "all: mid\n\techo all\nmid:\n\techo mid\nother:\n\techo other\n",
    );
    let graph = make_dep(&mut ev, vec![]).unwrap();
    let roots: HashSet<String> = graph.roots.iter().map(|(s, _)| ev.sym(*s)).collect();
    // "mid" is an input of "all", so only the true roots are listed.
    assert_eq!(
        roots,
        HashSet::from(["all".to_string(), "other".to_string()])
    );
}

#[test]
fn shellstatus_tracks_last_command() {
    let mut ctx = Context::for_tests();
    let mut ev = Evaluator::new(&mut ctx);
    eval_all(
        &mut ev,
        "SHELL := /bin/sh\nA := $(shell exit 42)\nS := $(.SHELLSTATUS)\n",
    );
    let s = ev.intern("S");
    assert_eq!(ev.eval_var(s).unwrap(), Bytes::from_static(b"42"));
}

#[test]
fn double_colon_rules_accumulate() {
    let mut ctx = Context::for_tests();
    let got = make_commands(&mut ctx, "x::\n\techo one\nx::\n\techo two\n", &["x"]);
    assert_eq!(got[0].1, vec!["one", "two"].iter().map(|s| format!("echo {s}")).collect::<Vec<_>>());
}

#[test]
fn makefile_list_grows_with_includes() {
    let scratch = ScratchDir::new("includes");
    let inc = scratch.file("inc.mk", "FROM_INC := yes\n");
    let mut ctx = Context::for_tests();
    let mut ev = Evaluator::new(&mut ctx);
    eval_all(&mut ev, &format!("include {inc}\nR := $(FROM_INC)\n"));
    let r = ev.intern("R");
    assert_eq!(ev.eval_var(r).unwrap(), Bytes::from_static(b"yes"));
    let makefile_list = ev.ctx.syms.makefile_list;
    let list = ev.eval_var(makefile_list).unwrap();
    assert!(
        String::from_utf8_lossy(&list).contains("inc.mk"),
        "{list:?}"
    );
}

#[test]
fn missing_required_include_is_fatal_optional_is_not() {
    let mut ctx = Context::for_tests();
    let mut ev = Evaluator::new(&mut ctx);
    let stmts = parse_buf(
        ev.ctx,
        &Bytes::from_static(b"-include nope_not_here.mk\nA := ok\n"),
        Loc::default(),
    )
    .unwrap();
    {
        let stmts = stmts.lock();
        for stmt in stmts.iter() {
            stmt.eval(&mut ev).unwrap();
        }
    }
    let a = ev.intern("A");
    assert_eq!(ev.eval_var(a).unwrap(), Bytes::from_static(b"ok"));

    let stmts = parse_buf(
        ev.ctx,
        &Bytes::from_static(b"include nope_not_here.mk\n"),
        Loc::default(),
    )
    .unwrap();
    let stmts = stmts.lock();
    let err = stmts[0].eval(&mut ev).unwrap_err().to_string();
    assert!(err.contains("nope_not_here.mk"), "{err}");
}
