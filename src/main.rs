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

#![allow(missing_docs)]
#![deny(warnings)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(clippy::undocumented_unsafe_blocks)]

use std::ffi::{OsStr, OsString};
use std::io::{Write, stdout};
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use anyhow::{Result, bail};
use bytes::{BufMut, Bytes, BytesMut};

use maku::MakeError;
use maku::context::Context;
use maku::dep::make_dep;
use maku::eval::{Evaluator, FrameType};
use maku::expr::Value;
use maku::flags::Flags;
use maku::loc::Loc;
use maku::log;
use maku::parser::parse_buf;
use maku::symtab::{Symbol, join_symbols};
use maku::var::{VarOrigin, Variable};

fn read_bootstrap_makefile(ev: &mut Evaluator, targets: &[Symbol]) -> Result<maku::stmt::StmtList> {
    let mut bootstrap = BytesMut::new();
    bootstrap.put_slice(b"CC?=cc\n");
    if cfg!(target_os = "macos") {
        bootstrap.put_slice(b"CXX?=c++\n");
    } else {
        bootstrap.put_slice(b"CXX?=g++\n");
    }
    bootstrap.put_slice(b"AR?=ar\n");
    // Pretend to be GNU make 4.2.1, for compatibility.
    bootstrap.put_slice(b"MAKE_VERSION?=4.2.1\n");
    bootstrap.put_slice(b"MAKU?=maku\n");
    // Overwrite $SHELL environment variable.
    bootstrap.put_slice(b"SHELL=/bin/sh\n");

    if !ev.ctx.flags.no_builtin_rules {
        // http://www.gnu.org/software/make/manual/make.html#Catalogue-of-Rules
        // The document above is not actually accurate; see default.c:
        // http://git.savannah.gnu.org/cgit/make.git/tree/default.c?id=4.1
        bootstrap.put_slice(b".c.o:\n");
        bootstrap.put_slice(b"\t$(CC) $(CFLAGS) $(CPPFLAGS) $(TARGET_ARCH) -c -o $@ $<\n");
        bootstrap.put_slice(b".cc.o:\n");
        bootstrap.put_slice(b"\t$(CXX) $(CXXFLAGS) $(CPPFLAGS) $(TARGET_ARCH) -c -o $@ $<\n");
    }
    if ev.ctx.flags.generate_ninja {
        bootstrap.put_slice(format!("MAKE?=make -j{}\n", ev.ctx.flags.num_jobs.max(1)).as_bytes());
    } else {
        bootstrap.put_slice(b"MAKE?=");
        bootstrap.put_slice(
            ev.ctx
                .flags
                .subkati_args
                .join(OsStr::new(" "))
                .as_bytes(),
        );
        bootstrap.put_u8(b'\n');
    }
    bootstrap.put_slice(b"MAKECMDGOALS?=");
    bootstrap.put(join_symbols(&ev.ctx.symtab, targets, b" "));
    bootstrap.put_u8(b'\n');

    bootstrap.put_slice(b"CURDIR:=");
    bootstrap.put_slice(std::env::current_dir()?.as_os_str().as_bytes());
    bootstrap.put_u8(b'\n');

    let loc = Loc {
        filename: ev.intern("*bootstrap*"),
        line: 0,
    };
    parse_buf(ev.ctx, &bootstrap.freeze(), loc)
}

fn run(ctx: &mut Context, targets: &[Symbol], cl_vars: &[Bytes]) -> Result<i32> {
    let mut ev = Evaluator::new(ctx);
    ev.start()?;

    let makefile = ev.ctx.flags.makefile.clone().unwrap();
    let mut makefile_list = BytesMut::new();
    makefile_list.put_u8(b' ');
    makefile_list.put_slice(makefile.as_bytes());
    let makefile_list_sym = ev.ctx.syms.makefile_list;
    let frame = ev.current_frame();
    let var = Variable::simple(makefile_list.freeze(), VarOrigin::File)
        .defined_at(Some(frame), ev.loc)
        .cell();
    ev.ctx.set_global_var(makefile_list_sym, var, false, None)?;

    for (k, v) in std::env::vars_os() {
        let v = Bytes::from(v.as_bytes().to_vec());
        let val = Arc::new(Value::Literal(None, v.clone()));
        let sym = ev.intern(k.as_bytes().to_vec());
        let frame = ev.current_frame();
        let var = Variable::recursive(val, v, VarOrigin::Environment)
            .defined_at(Some(frame), None)
            .cell();
        ev.ctx.set_global_var(sym, var, false, None)?;
    }

    let bootstrap_asts = read_bootstrap_makefile(&mut ev, targets)?;

    {
        let _frame = ev.enter(
            FrameType::Phase,
            Bytes::from_static(b"*bootstrap*"),
            Loc::default(),
        );
        ev.in_bootstrap();
        for stmt in bootstrap_asts.lock().iter() {
            log!("{stmt:?}");
            stmt.eval(&mut ev)?;
        }
    }

    {
        let _frame = ev.enter(
            FrameType::Phase,
            Bytes::from_static(b"*command line*"),
            Loc::default(),
        );
        ev.in_command_line();
        for l in cl_vars {
            let loc = Loc {
                filename: ev.intern("*bootstrap*"),
                line: 0,
            };
            let asts = parse_buf(ev.ctx, l, loc)?;
            let asts = asts.lock();
            assert!(asts.len() == 1);
            asts[0].eval(&mut ev)?;
        }
    }
    ev.in_toplevel_makefile();

    {
        let _eval_frame = ev.enter(
            FrameType::Phase,
            Bytes::from_static(b"*parse*"),
            Loc::default(),
        );

        let _file_frame = ev.enter(
            FrameType::Parse,
            Bytes::from(makefile.as_bytes().to_vec()),
            Loc::default(),
        );
        let Some(mk) = ev.ctx.get_makefile(&makefile)? else {
            bail!("makefile not found")
        };
        let stmts = mk.stmts.lock();
        for stmt in stmts.iter() {
            log!("{stmt:?}");
            stmt.eval(&mut ev)?;
        }
    }

    if let Some(filename) = ev.ctx.flags.dump_include_graph.clone() {
        ev.dump_include_json(&filename)?;
    }

    let graph;
    {
        let _frame = ev.enter(
            FrameType::Phase,
            Bytes::from_static(b"*dependency analysis*"),
            Loc::default(),
        );
        graph = make_dep(&mut ev, targets.to_owned())?;
    }

    if ev.ctx.flags.is_syntax_check_only {
        ev.finish()?;
        return Ok(0);
    }

    if ev.ctx.flags.generate_ninja {
        // Emission itself belongs to an external consumer of the graph;
        // everything up to the DepGraph has been produced and validated.
        ev.finish()?;
        return Ok(0);
    }

    for (name, export) in ev.exports.clone() {
        if export {
            let value = if let Some(v) = ev.lookup_var(name)? {
                use maku::expr::Evaluable;
                v.read().eval_to_buf(&mut ev)?
            } else {
                Bytes::new()
            };
            log!("setenv({name:?}, {})", String::from_utf8_lossy(&value));
            // SAFETY: evaluation is single threaded; nothing reads the
            // environment concurrently.
            unsafe {
                std::env::set_var(
                    OsStr::from_bytes(&ev.ctx.symtab.resolve(name)),
                    OsStr::from_bytes(&value),
                );
            }
        } else {
            log!("unsetenv({name:?})");
            // SAFETY: evaluation is single threaded; nothing reads the
            // environment concurrently.
            unsafe {
                std::env::remove_var(OsStr::from_bytes(&ev.ctx.symtab.resolve(name)));
            }
        }
    }

    {
        let _frame = ev.enter(
            FrameType::Phase,
            Bytes::from_static(b"*execution*"),
            Loc::default(),
        );
        maku::exec::exec(&graph, &mut ev)?;
    }

    ev.finish()?;

    Ok(0)
}

fn find_first_makefile(flags: &mut Flags) {
    if flags.makefile.is_some() {
        return;
    }
    if std::fs::exists("GNUMakefile").unwrap_or(false) {
        flags.makefile = Some(OsString::from("GNUMakefile"));
    } else if !cfg!(target_os = "macos") && std::fs::exists("makefile").unwrap_or(false) {
        flags.makefile = Some(OsString::from("makefile"));
    } else if std::fs::exists("Makefile").unwrap_or(false) {
        flags.makefile = Some(OsString::from("Makefile"));
    }
}

fn handle_realpath(args: Vec<String>) {
    for arg in args {
        if let Ok(path) = std::fs::canonicalize(&arg) {
            let _ = stdout().write_all(path.as_os_str().as_bytes());
            println!();
        }
    }
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Warn)
        .format(|buf, record| {
            if let (Some(file), Some(line)) = (record.file(), record.line()) {
                writeln!(buf, "*maku*: {file}:{line}: {}", record.args())
            } else {
                writeln!(buf, "*maku*: {}", record.args())
            }
        })
        .parse_env("MAKU_LOG")
        .init();

    if std::env::args().len() >= 2 {
        let arg = std::env::args().nth(1).unwrap();
        if arg == "--realpath" {
            handle_realpath(std::env::args().skip(2).collect());
            return;
        }
    }

    let mut flags = Flags::from_args(std::env::args_os().collect());

    if let Some(working_dir) = &flags.working_dir
        && let Err(e) = std::env::set_current_dir(working_dir)
    {
        eprintln!("*** {}: {}", working_dir.to_string_lossy(), e);
        std::process::exit(2);
    }
    find_first_makefile(&mut flags);
    if flags.makefile.is_none() {
        eprintln!("*** No targets specified and no makefile found.");
        std::process::exit(2);
    }

    let mut ctx = Context::new(flags);
    let targets: Vec<Symbol> = ctx
        .flags
        .targets
        .clone()
        .into_iter()
        .map(|t| ctx.intern(t))
        .collect();
    let cl_vars = ctx.flags.cl_vars.clone();

    let ret = match run(&mut ctx, &targets, &cl_vars) {
        Ok(ret) => ret,
        Err(err) => {
            for cause in err.chain() {
                eprintln!("{cause}");
            }
            if err
                .chain()
                .any(|c| c.downcast_ref::<MakeError>().is_some() || c.to_string().contains("*** "))
            {
                2
            } else {
                1
            }
        }
    };
    std::process::exit(ret);
}
