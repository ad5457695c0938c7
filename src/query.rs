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

use std::fmt::Write as _;

use anyhow::Result;

use crate::{
    command::CommandEvaluator,
    dep::{DepGraph, NodeId},
    eval::Evaluator,
    expr::Evaluable,
};

/// Renders what is known about `q`: a variable listing for `.VARIABLES` /
/// `.KATI_SYMBOLS`, otherwise the graph node for the named target.
pub fn query(ev: &mut Evaluator, graph: &DepGraph, q: &str) -> Result<String> {
    if q == ".VARIABLES" || q == ".KATI_SYMBOLS" {
        let sym = ev.intern(q.as_bytes().to_vec());
        let names = ev.eval_var(sym)?;
        return Ok(format!("{}\n", String::from_utf8_lossy(&names)));
    }

    let sym = ev.intern(q.as_bytes().to_vec());
    let Some(id) = graph
        .nodes
        .iter()
        .position(|n| n.output == sym)
        .map(|idx| {
            // Recover the arena id from the position.
            NodeId::from_index(idx)
        })
    else {
        return Ok(format!("target not found in the graph: {q}\n"));
    };

    let mut out = String::new();
    {
        let n = graph.node(id);
        writeln!(out, "target: {}", ev.sym(n.output))?;
        if let Some(loc) = &n.loc {
            writeln!(out, "defined: {}", loc.render(&ev.ctx.symtab))?;
        }
        if n.is_phony {
            writeln!(out, "phony: true")?;
        }
        if n.is_restat {
            writeln!(out, "restat: true")?;
        }
        if n.is_default_target {
            writeln!(out, "default: true")?;
        }
        if let Some(pat) = &n.output_pattern {
            writeln!(out, "pattern: {}", ev.sym(*pat))?;
        }
        if !n.deps.is_empty() {
            let deps: Vec<String> = n.deps.iter().map(|(s, _)| ev.sym(*s)).collect();
            writeln!(out, "deps: {}", deps.join(" "))?;
        }
        if !n.order_onlys.is_empty() {
            let deps: Vec<String> = n.order_onlys.iter().map(|(s, _)| ev.sym(*s)).collect();
            writeln!(out, "order_onlys: {}", deps.join(" "))?;
        }
        if !n.implicit_outputs.is_empty() {
            let outs: Vec<String> = n.implicit_outputs.iter().map(|s| ev.sym(*s)).collect();
            writeln!(out, "implicit_outputs: {}", outs.join(" "))?;
        }
        if let Some(vars) = &n.rule_vars {
            let mut names: Vec<String> = vars
                .snapshot()
                .iter()
                .map(|(sym, _)| ev.ctx.sym(*sym))
                .collect();
            names.sort();
            for name in names {
                writeln!(out, "var: {name}")?;
            }
        }
    }

    let mut ce = CommandEvaluator::new(ev)?;
    for command in ce.eval(graph, id)? {
        writeln!(out, "cmd: {}", String::from_utf8_lossy(&command.cmd))?;
    }

    Ok(out)
}

/// Dumps one global variable per line, `NAME=<expanded value>`.
pub fn dump_variables(ev: &mut Evaluator) -> Result<String> {
    let mut out = String::new();
    let mut symbols = ev.ctx.global_symbols(|_| true);
    symbols.sort_by(|a, b| a.1.cmp(&b.1));
    for (sym, name) in symbols {
        let Some(var) = ev.ctx.peek_global_var(sym) else {
            continue;
        };
        if var.read().is_func(ev.ctx) {
            continue;
        }
        let value = {
            let var = var.read();
            var.eval_to_buf(ev)?
        };
        writeln!(
            out,
            "{}={}",
            String::from_utf8_lossy(&name),
            String::from_utf8_lossy(&value)
        )?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::dep::make_dep;
    use crate::loc::Loc;
    use crate::parser::parse_buf;
    use bytes::Bytes;

    #[test]
    fn test_query_target() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        let stmts = parse_buf(
            ev.ctx,
            &Bytes::from_static(b".PHONY: all\nall: dep\n\techo hi\ndep:\n\techo dep\n"),
            Loc::default(),
        )
        .unwrap();
        {
            let stmts = stmts.lock();
            for stmt in stmts.iter() {
                stmt.eval(&mut ev).unwrap();
            }
        }
        let graph = make_dep(&mut ev, vec![]).unwrap();
        let text = query(&mut ev, &graph, "all").unwrap();
        assert!(text.contains("target: all"), "{text}");
        assert!(text.contains("phony: true"), "{text}");
        assert!(text.contains("deps: dep"), "{text}");
        assert!(text.contains("cmd: echo hi"), "{text}");

        let missing = query(&mut ev, &graph, "nothere").unwrap();
        assert!(missing.contains("not found"), "{missing}");
    }

    #[test]
    fn test_dump_variables() {
        let mut ctx = Context::for_tests();
        let mut ev = Evaluator::new(&mut ctx);
        let stmts = parse_buf(
            ev.ctx,
            &Bytes::from_static(b"A := 1\nB = $(A)2\n"),
            Loc::default(),
        )
        .unwrap();
        {
            let stmts = stmts.lock();
            for stmt in stmts.iter() {
                stmt.eval(&mut ev).unwrap();
            }
        }
        let text = dump_variables(&mut ev).unwrap();
        assert!(text.contains("A=1"), "{text}");
        assert!(text.contains("B=12"), "{text}");
    }
}
