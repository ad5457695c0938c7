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
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::{
    error_loc,
    eval::Evaluator,
    expr::{Evaluable, Value},
    loc::Loc,
    symtab::Symbol,
};

/// A list of statements, shared between the parser (which appends into
/// conditional branches) and the evaluator.
pub type StmtList = Arc<Mutex<Vec<Stmt>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Eq,
    ColonEq,
    PlusEq,
    QuestionEq,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct AssignDirective {
    pub is_override: bool,
    pub export: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    Ifeq,
    Ifneq,
    Ifdef,
    Ifndef,
}

/// What separated a rule's RHS from its LHS: nothing, `;` (inline recipe),
/// `=` (target-specific assignment), or `=$=` (final assignment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSep {
    Null,
    Semicolon,
    Eq,
    FinalEq,
}

/// One makefile statement. The whole AST is this single sum type; evaluation
/// is one `match` rather than a virtual call per node.
#[derive(Debug, Clone)]
pub enum Stmt {
    Assign(Arc<AssignStmt>),
    Rule(Arc<RuleStmt>),
    Command(Arc<CommandStmt>),
    Cond(Arc<CondStmt>),
    Include(Arc<IncludeStmt>),
    Export(Arc<ExportStmt>),
    /// A recorded syntax problem. GNU Make only reports these if the broken
    /// line is actually evaluated, so the parser stores them instead of
    /// failing.
    ParseError(Arc<ParseErrorStmt>),
}

impl Stmt {
    pub fn loc(&self) -> Loc {
        match self {
            Stmt::Assign(s) => s.loc,
            Stmt::Rule(s) => s.loc,
            Stmt::Command(s) => s.loc,
            Stmt::Cond(s) => s.loc,
            Stmt::Include(s) => s.loc,
            Stmt::Export(s) => s.loc,
            Stmt::ParseError(s) => s.loc,
        }
    }

    pub fn eval(&self, ev: &mut Evaluator) -> Result<()> {
        match self {
            Stmt::Assign(s) => ev.eval_assign(s),
            Stmt::Rule(s) => ev.eval_rule(s),
            Stmt::Command(s) => ev.eval_command(s),
            Stmt::Cond(s) => ev.eval_if(s),
            Stmt::Include(s) => ev.eval_include(s),
            Stmt::Export(s) => ev.eval_export(s),
            Stmt::ParseError(s) => {
                error_loc!(&*ev.ctx, Some(&s.loc), "{}", s.msg)
            }
        }
    }
}

#[derive(Debug)]
pub struct AssignStmt {
    pub loc: Loc,
    pub lhs: Arc<Value>,
    pub rhs: Arc<Value>,
    pub orig_rhs: Bytes,
    pub op: AssignOp,
    pub directive: Option<AssignDirective>,
    pub is_final: bool,

    lhs_sym_cache: Mutex<Option<Symbol>>,
}

impl AssignStmt {
    pub fn new(
        loc: Loc,
        lhs: Arc<Value>,
        rhs: Arc<Value>,
        orig_rhs: Bytes,
        op: AssignOp,
        directive: Option<AssignDirective>,
        is_final: bool,
    ) -> Stmt {
        Stmt::Assign(Arc::new(AssignStmt {
            loc,
            lhs,
            rhs,
            orig_rhs,
            op,
            directive,
            is_final,
            lhs_sym_cache: Mutex::new(None),
        }))
    }

    /// The assigned name. A literal LHS is interned once and cached; a
    /// computed LHS is expanded on every evaluation.
    pub fn get_lhs_symbol(&self, ev: &mut Evaluator) -> Result<Symbol> {
        if let Value::Literal(_, name) = &*self.lhs {
            if name.is_empty() {
                error_loc!(&*ev.ctx, Some(&self.loc), "*** empty variable name.");
            }
            let mut cache = self.lhs_sym_cache.lock();
            let sym = match *cache {
                Some(sym) => sym,
                None => {
                    let sym = ev.intern(name.clone());
                    *cache = Some(sym);
                    sym
                }
            };
            return Ok(sym);
        }

        let name = self.lhs.eval_to_buf(ev)?;
        if name.is_empty() {
            error_loc!(&*ev.ctx, Some(&self.loc), "*** empty variable name.");
        }
        Ok(ev.intern(name))
    }
}

#[derive(Debug)]
pub struct RuleStmt {
    pub loc: Loc,
    pub lhs: Arc<Value>,
    pub sep: RuleSep,
    pub rhs: Option<Arc<Value>>,
}

impl RuleStmt {
    pub fn new(loc: Loc, lhs: Arc<Value>, sep: RuleSep, rhs: Option<Arc<Value>>) -> Stmt {
        Stmt::Rule(Arc::new(RuleStmt { loc, lhs, sep, rhs }))
    }
}

#[derive(Debug)]
pub struct CommandStmt {
    pub loc: Loc,
    /// The unparsed line, needed when a tab line turns out not to belong to
    /// a rule and has to be re-read as ordinary statements.
    pub raw: Bytes,
    pub expr: Arc<Value>,
}

impl CommandStmt {
    pub fn new(loc: Loc, raw: Bytes, expr: Arc<Value>) -> Stmt {
        Stmt::Command(Arc::new(CommandStmt { loc, raw, expr }))
    }
}

#[derive(Debug)]
pub struct CondStmt {
    pub loc: Loc,
    pub op: CondOp,
    pub lhs: Arc<Value>,
    pub rhs: Option<Arc<Value>>,
    pub true_stmts: StmtList,
    pub false_stmts: StmtList,
}

impl CondStmt {
    pub fn new(loc: Loc, op: CondOp, lhs: Arc<Value>, rhs: Option<Arc<Value>>) -> Arc<CondStmt> {
        Arc::new(CondStmt {
            loc,
            op,
            lhs,
            rhs,
            true_stmts: Arc::new(Mutex::new(Vec::new())),
            false_stmts: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[derive(Debug)]
pub struct IncludeStmt {
    pub loc: Loc,
    pub expr: Arc<Value>,
    pub should_exist: bool,
}

impl IncludeStmt {
    pub fn new(loc: Loc, expr: Arc<Value>, should_exist: bool) -> Stmt {
        Stmt::Include(Arc::new(IncludeStmt {
            loc,
            expr,
            should_exist,
        }))
    }
}

#[derive(Debug)]
pub struct ExportStmt {
    pub loc: Loc,
    pub expr: Arc<Value>,
    pub is_export: bool,
}

impl ExportStmt {
    pub fn new(loc: Loc, expr: Arc<Value>, is_export: bool) -> Stmt {
        Stmt::Export(Arc::new(ExportStmt {
            loc,
            expr,
            is_export,
        }))
    }
}

#[derive(Debug)]
pub struct ParseErrorStmt {
    pub loc: Loc,
    pub msg: String,
}

impl ParseErrorStmt {
    pub fn new(loc: Loc, msg: String) -> Stmt {
        Stmt::ParseError(Arc::new(ParseErrorStmt { loc, msg }))
    }
}
