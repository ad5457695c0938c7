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

use std::{collections::HashMap, ffi::OsStr, os::unix::ffi::OsStrExt, time::SystemTime};

use anyhow::Result;
use bytes::Bytes;

use crate::{
    command::CommandEvaluator,
    dep::{DepGraph, NodeId},
    error,
    eval::{Evaluator, FrameType},
    fileutil::{RedirectStderr, get_timestamp, run_command},
    log,
    symtab::Symbol,
    warn,
};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Processing,
    Timestamp(Option<SystemTime>),
}

impl PartialOrd for ExecStatus {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (ExecStatus::Processing, ExecStatus::Processing) => Some(std::cmp::Ordering::Equal),
            (ExecStatus::Processing, ExecStatus::Timestamp(Some(_))) => {
                Some(std::cmp::Ordering::Less)
            }
            (ExecStatus::Timestamp(None), ExecStatus::Timestamp(None)) => {
                Some(std::cmp::Ordering::Equal)
            }
            (ExecStatus::Timestamp(None), _) => Some(std::cmp::Ordering::Less),
            (_, ExecStatus::Timestamp(None)) => Some(std::cmp::Ordering::Greater),
            (ExecStatus::Timestamp(Some(a)), ExecStatus::Timestamp(Some(b))) => Some(a.cmp(b)),
            (ExecStatus::Timestamp(Some(_)), _) => Some(std::cmp::Ordering::Greater),
        }
    }
}

struct Executor<'a, 'c> {
    ce: CommandEvaluator<'a, 'c>,
    done: HashMap<Symbol, ExecStatus>,
    shell: Bytes,
    shellflag: &'static [u8],
    num_commands: u64,
}

impl<'a, 'c> Executor<'a, 'c> {
    fn new(ev: &'a mut Evaluator<'c>) -> Result<Self> {
        let shell = ev.get_shell()?;
        let shellflag = ev.get_shell_flag();
        Ok(Executor {
            ce: CommandEvaluator::new(ev)?,
            done: HashMap::new(),
            shell,
            shellflag,
            num_commands: 0,
        })
    }

    fn exec_node(
        &mut self,
        graph: &DepGraph,
        id: NodeId,
        needed_by: Option<Symbol>,
    ) -> Result<ExecStatus> {
        let output = graph.node(id).output;
        if let Some(found) = self.done.get(&output) {
            if found == &ExecStatus::Processing {
                warn!(
                    "Circular {} <- {} dependency dropped.",
                    needed_by
                        .map(|s| self.ce.ev.sym(s))
                        .unwrap_or_else(|| "(null)".to_string()),
                    self.ce.ev.sym(output)
                )
            }
            return Ok(*found);
        }
        let output_str = self.ce.ev.ctx.symtab.resolve(output);
        let loc = graph.node(id).loc;
        let _frame = self.ce.ev.enter(
            FrameType::Exec,
            output_str.clone(),
            loc.unwrap_or_default(),
        );

        self.done.insert(output, ExecStatus::Processing);
        let output_timestamp = get_timestamp(&output_str)?;
        let output_ts = ExecStatus::Timestamp(output_timestamp);

        log!("ExecNode: {:?} for {needed_by:?}", output);

        let n = graph.node(id);
        if !n.has_rule && output_timestamp.is_none() && !n.is_phony {
            if let Some(needed_by) = needed_by {
                error!(
                    "*** No rule to make target '{}', needed by '{}'.",
                    self.ce.ev.sym(output),
                    self.ce.ev.sym(needed_by)
                );
            } else {
                error!("*** No rule to make target '{}'", self.ce.ev.sym(output));
            }
        }

        let mut latest = ExecStatus::Processing;
        for (_, d) in n.order_onlys.clone() {
            let dep_out = self.ce.ev.ctx.symtab.resolve(graph.node(d).output);
            if std::fs::exists(OsStr::from_bytes(&dep_out))? {
                continue;
            }
            let ts = self.exec_node(graph, d, Some(output))?;
            if latest < ts {
                latest = ts;
            }
        }

        for (_, d) in n.deps.clone() {
            let ts = self.exec_node(graph, d, Some(output))?;
            if latest < ts {
                latest = ts;
            }
        }

        let n = graph.node(id);
        if output_ts >= latest && !n.is_phony {
            self.done.insert(output, output_ts);
            return Ok(output_ts);
        }

        let commands = self.ce.eval(graph, id)?;
        for command in commands {
            self.num_commands += 1;
            if command.echo {
                println!("{}", String::from_utf8_lossy(&command.cmd));
            }
            if !self.ce.ev.ctx.flags.is_dry_run {
                let (status, output) = run_command(
                    &self.shell,
                    self.shellflag,
                    &command.cmd,
                    RedirectStderr::Stdout,
                )?;
                print!("{}", String::from_utf8_lossy(&output));
                if !status.success() {
                    if command.ignore_error || self.ce.ev.ctx.flags.ignore_errors {
                        eprintln!(
                            "[{}] Error {} (ignored)",
                            self.ce.ev.sym(command.output),
                            status.code().unwrap_or(1)
                        )
                    } else {
                        error!(
                            "*** [{}] Error {}",
                            self.ce.ev.sym(command.output),
                            status.code().unwrap_or(1)
                        );
                    }
                }
            }
        }

        self.done.insert(output, output_ts);
        Ok(output_ts)
    }
}

pub fn exec(graph: &DepGraph, ev: &mut Evaluator) -> Result<()> {
    let mut executor = Executor::new(ev)?;
    for (_sym, root) in &graph.roots {
        executor.exec_node(graph, *root, None)?;
    }
    if executor.num_commands == 0 {
        for (sym, _) in &graph.roots {
            println!(
                "maku: Nothing to be done for `{}'.",
                executor.ce.ev.sym(*sym)
            )
        }
    }
    Ok(())
}
