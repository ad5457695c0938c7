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
    borrow::Cow,
    collections::HashMap,
    ffi::OsString,
    fmt::Debug,
    os::unix::ffi::OsStrExt,
    sync::Arc,
};

use anyhow::Result;
use bytes::{BufMut, Bytes};
use parking_lot::{Mutex, RwLock};

use crate::{
    command::AutoVar,
    context::Context,
    error, error_loc,
    eval::{Evaluator, Frame},
    expr::{Evaluable, Value},
    loc::Loc,
    stmt::AssignOp,
    strutil::{WordWriter, has_path_prefix},
    symtab::Symbol,
    warn_loc,
};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VarOrigin {
    Default,
    Environment,
    EnvironmentOverride,
    File,
    CommandLine,
    Override,
    Automatic,
}

pub fn get_origin_str(origin: VarOrigin) -> &'static str {
    match origin {
        VarOrigin::Default => "default",
        VarOrigin::Environment => "environment",
        VarOrigin::EnvironmentOverride => "environment override",
        VarOrigin::File => "file",
        VarOrigin::CommandLine => "command line",
        VarOrigin::Override => "override",
        VarOrigin::Automatic => "automatic",
    }
}

/// The shared cell a variable lives in. Tables hand these out by clone, so
/// `+=` and readonly-marking are visible through every holder.
pub type Var = Arc<RwLock<Variable>>;

/// How a variable stores its value.
#[derive(Debug)]
pub enum VarValue {
    /// Already-expanded bytes (`:=`).
    Simple(Vec<u8>),
    /// An unevaluated expression (`=`), re-expanded on every read. `orig`
    /// keeps the source text for `$(value)`.
    Recursive { expr: Arc<Value>, orig: Bytes },
    /// `$@`-family; reads the command evaluator's current scope.
    Automatic(Symbol, AutoVar),
    /// `.SHELLSTATUS`.
    ShellStatus,
    /// `.VARIABLES` / `.KATI_SYMBOLS`.
    NameList { name: Bytes, all: bool },
}

#[derive(Debug)]
pub struct Variable {
    value: VarValue,
    origin: VarOrigin,
    loc: Option<Loc>,
    definition: Option<Arc<Frame>>,

    pub assign_op: Option<AssignOp>,
    pub readonly: bool,
    pub deprecated: Option<Arc<String>>,
    obsolete: Option<Arc<String>>,
    /// Set when expansion of this variable re-entered itself; the read that
    /// observed the re-entry reports the error.
    pub self_referential: bool,

    visibility_prefix: Option<Vec<OsString>>,
}

fn join_with_space(prev: &Arc<Value>, addition: Arc<Value>) -> Arc<Value> {
    Arc::new(Value::Concat(
        prev.loc(),
        vec![
            prev.clone(),
            Arc::new(Value::Literal(None, Bytes::from_static(b" "))),
            addition,
        ],
    ))
}

impl Variable {
    fn with_value(value: VarValue, origin: VarOrigin) -> Variable {
        Variable {
            value,
            origin,
            loc: None,
            definition: None,
            assign_op: None,
            readonly: false,
            deprecated: None,
            obsolete: None,
            self_referential: false,
            visibility_prefix: None,
        }
    }

    pub fn simple(text: Bytes, origin: VarOrigin) -> Variable {
        Self::with_value(VarValue::Simple(text.to_vec()), origin)
    }

    pub fn empty(origin: VarOrigin) -> Variable {
        Self::with_value(VarValue::Simple(Vec::new()), origin)
    }

    pub fn recursive(expr: Arc<Value>, orig: Bytes, origin: VarOrigin) -> Variable {
        Self::with_value(VarValue::Recursive { expr, orig }, origin)
    }

    /// The `:=` path: expands `v` now and stores the result.
    pub fn evaluated(origin: VarOrigin, ev: &mut Evaluator, v: &Value) -> Result<Variable> {
        let text = v.eval_to_buf(ev)?;
        Ok(Self::simple(text, origin))
    }

    pub fn defined_at(mut self, frame: Option<Arc<Frame>>, loc: Option<Loc>) -> Variable {
        self.definition = frame;
        self.loc = loc;
        self
    }

    pub fn cell(self) -> Var {
        Arc::new(RwLock::new(self))
    }

    pub fn automatic(sym: Symbol, auto: AutoVar) -> Var {
        Self::with_value(VarValue::Automatic(sym, auto), VarOrigin::Automatic).cell()
    }

    pub fn shell_status_cell() -> Var {
        let mut v = Self::with_value(VarValue::ShellStatus, VarOrigin::Override);
        v.assign_op = Some(AssignOp::ColonEq);
        v.readonly = true;
        v.cell()
    }

    pub fn name_list_cell(name: &'static [u8], all: bool) -> Var {
        let mut v = Self::with_value(
            VarValue::NameList {
                name: Bytes::from_static(name),
                all,
            },
            VarOrigin::Override,
        );
        v.assign_op = Some(AssignOp::ColonEq);
        v.readonly = true;
        v.cell()
    }

    pub fn loc(&self) -> &Option<Loc> {
        &self.loc
    }

    pub fn origin(&self) -> VarOrigin {
        self.origin
    }

    pub fn definition(&self) -> &Option<Arc<Frame>> {
        &self.definition
    }

    pub fn obsolete(&self) -> bool {
        self.obsolete.is_some()
    }

    pub fn set_obsolete(&mut self, message: Arc<String>) {
        self.obsolete = Some(message);
    }

    pub fn flavor(&self) -> &'static str {
        match &self.value {
            VarValue::Recursive { .. } => "recursive",
            VarValue::Automatic(_, _) => "undefined",
            VarValue::NameList { .. } => "kati_variable_names",
            VarValue::Simple(_) | VarValue::ShellStatus => "simple",
        }
    }

    /// True when `+=` must expand its RHS immediately.
    pub fn immediate_eval(&self) -> bool {
        matches!(&self.value, VarValue::Simple(_))
    }

    /// Deprecation/obsolescence bookkeeping at every read site.
    pub fn used(&self, ev: &Evaluator, sym: Symbol) -> Result<()> {
        if let Some(message) = &self.obsolete {
            error_loc!(
                &*ev.ctx,
                ev.loc.as_ref(),
                "*** {} is obsolete{message}.",
                ev.ctx.sym(sym)
            );
        }
        if let Some(message) = &self.deprecated {
            warn_loc!(
                &*ev.ctx,
                ev.loc.as_ref(),
                "{} has been deprecated{message}.",
                ev.ctx.sym(sym)
            );
        }
        Ok(())
    }

    pub fn set_visibility_prefix(
        &mut self,
        ctx: &Context,
        prefixes: Vec<OsString>,
        name: Symbol,
    ) -> Result<()> {
        match &self.visibility_prefix {
            None => self.visibility_prefix = Some(prefixes),
            Some(existing) if *existing == prefixes => {}
            Some(_) => {
                error!("Visibility prefix conflict on variable: {}", ctx.sym(name))
            }
        }
        Ok(())
    }

    pub fn check_current_referencing_file(
        &self,
        ctx: &Context,
        loc: &Option<Loc>,
        sym: Symbol,
    ) -> Result<()> {
        let Some(prefixes) = &self.visibility_prefix else {
            return Ok(());
        };
        let loc = loc.unwrap_or_default();
        let filename = ctx.symtab.resolve(loc.filename);
        if prefixes
            .iter()
            .any(|prefix| has_path_prefix(&filename, prefix.as_bytes()))
        {
            return Ok(());
        }
        let allowed = prefixes
            .iter()
            .map(|p| p.to_string_lossy())
            .collect::<Vec<Cow<str>>>()
            .join("\n");
        error!(
            "{} is not a valid file to reference variable {}. Line #{}.\nValid file prefixes:\n{allowed}",
            String::from_utf8_lossy(&filename),
            ctx.sym(sym),
            loc.line
        );
    }

    /// `+=` with pre-expanded text.
    pub fn append_text(
        &mut self,
        ctx: &Context,
        text: &Bytes,
        frame: Option<Arc<Frame>>,
    ) -> Result<()> {
        match &mut self.value {
            VarValue::Simple(stored) => {
                stored.push(b' ');
                stored.extend_from_slice(text);
            }
            VarValue::Recursive { expr, .. } => {
                *expr = join_with_space(expr, Arc::new(Value::Literal(None, text.clone())));
            }
            VarValue::Automatic(sym, _) => {
                error!("appending to ${} is not supported", ctx.sym(*sym));
            }
            VarValue::ShellStatus | VarValue::NameList { .. } => {
                panic!("append to a builtin variable")
            }
        }
        self.definition = frame;
        Ok(())
    }

    /// `+=` keeping the RHS unevaluated; only valid for recursive flavor.
    pub fn append_expr(
        &mut self,
        ctx: &Context,
        addition: Arc<Value>,
        frame: Option<Arc<Frame>>,
        loc: Option<&Loc>,
    ) -> Result<()> {
        match &mut self.value {
            VarValue::Simple(_) => {
                panic!("append_expr requires a recursive variable; use append_text")
            }
            VarValue::Recursive { expr, .. } => {
                *expr = join_with_space(expr, addition);
            }
            VarValue::Automatic(sym, _) => {
                error_loc!(ctx, loc, "appending to ${} is not supported", ctx.sym(*sym));
            }
            VarValue::ShellStatus | VarValue::NameList { .. } => {
                panic!("append to a builtin variable")
            }
        }
        self.definition = frame;
        Ok(())
    }

    /// The unexpanded text, for `$(value)`.
    pub fn string(&self, ctx: &Context) -> Result<Cow<'_, [u8]>> {
        match &self.value {
            VarValue::Simple(stored) => Ok(Cow::Borrowed(stored.as_slice())),
            VarValue::Recursive { orig, .. } => Ok(Cow::Borrowed(orig)),
            VarValue::NameList { name, .. } => Ok(Cow::Borrowed(name)),
            VarValue::ShellStatus => Ok(match ctx.shell_status {
                Some(status) => Cow::Owned(status.to_string().into_bytes()),
                None => Cow::Owned(Vec::new()),
            }),
            VarValue::Automatic(sym, _) => {
                error!("$(value {}) is not implemented yet", ctx.sym(*sym));
            }
        }
    }
}

fn write_name_list(ev: &mut Evaluator, out: &mut dyn BufMut, all: bool) {
    let names = ev.ctx.global_symbols(|var| !var.read().obsolete());
    let mut ww = WordWriter::new(out);
    for (sym, name) in names {
        // .KATI_SYMBOLS leaves out function-style macros, best-effort.
        if !all
            && let Some(var) = ev.ctx.peek_global_var(sym)
            && var.read().is_func(ev.ctx)
        {
            continue;
        }
        ww.write(&name);
    }
}

impl Evaluable for Variable {
    fn eval(&self, ev: &mut Evaluator, out: &mut dyn BufMut) -> Result<()> {
        match &self.value {
            VarValue::Simple(stored) => out.put_slice(stored),
            VarValue::Recursive { expr, .. } => expr.eval(ev, out)?,
            VarValue::Automatic(_, auto) => auto.eval(ev, out)?,
            VarValue::ShellStatus => {
                if ev.is_evaluating_command {
                    error_loc!(
                        &*ev.ctx,
                        ev.loc.as_ref(),
                        "Using .SHELLSTATUS inside of a rule is not supported"
                    );
                }
                if let Some(status) = ev.ctx.shell_status {
                    out.put_slice(status.to_string().as_bytes());
                }
            }
            VarValue::NameList { all, .. } => write_name_list(ev, out, *all),
        }
        Ok(())
    }

    fn is_func(&self, ctx: &Context) -> bool {
        match &self.value {
            VarValue::Recursive { expr, .. } => expr.is_func(ctx),
            VarValue::Automatic(_, _) => true,
            _ => false,
        }
    }
}

/// A variable scope: target-specific variables during dependency analysis
/// and command expansion. Shared via `Arc`, hence the interior mutex.
pub struct Vars(Mutex<HashMap<Symbol, Var>>);

impl Default for Vars {
    fn default() -> Self {
        Self::new()
    }
}

impl Vars {
    pub fn new() -> Self {
        Vars(Mutex::new(HashMap::new()))
    }

    pub fn lookup(&self, sym: Symbol) -> Option<Var> {
        self.0.lock().get(&sym).cloned()
    }

    /// A stable copy of the scope's bindings, for iteration while the
    /// evaluator runs.
    pub fn snapshot(&self) -> Vec<(Symbol, Var)> {
        self.0
            .lock()
            .iter()
            .map(|(sym, var)| (*sym, var.clone()))
            .collect()
    }

    pub fn assign(&self, ctx: &Context, sym: Symbol, var: Var, readonly: &mut bool) -> Result<()> {
        *readonly = false;
        let mut map = self.0.lock();
        let Some(slot) = map.get_mut(&sym) else {
            map.insert(sym, var);
            return Ok(());
        };
        if slot.read().readonly {
            *readonly = true;
            return Ok(());
        }
        let origin = slot.read().origin();
        match origin {
            VarOrigin::Override | VarOrigin::EnvironmentOverride => Ok(()),
            VarOrigin::Automatic => {
                error!(
                    "overriding automatic variable {} is not implemented yet",
                    ctx.sym(sym)
                );
            }
            _ => {
                *slot = var;
                Ok(())
            }
        }
    }

    pub fn merge_from(&self, other: &Vars) {
        let mut into = self.0.lock();
        for (sym, var) in other.0.lock().iter() {
            into.insert(*sym, var.clone());
        }
    }
}

impl Clone for Vars {
    fn clone(&self) -> Self {
        Vars(Mutex::new(self.0.lock().clone()))
    }
}

impl Debug for Vars {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.0.lock().iter()).finish()
    }
}

/// Installs a binding into a scope and restores the previous one on drop.
/// Used while a node's subtree is being planned, so prerequisites see the
/// target-specific variables of their parents.
pub struct ScopedVar {
    vars: Arc<Vars>,
    sym: Symbol,
    shadowed: Option<Var>,
}

impl ScopedVar {
    pub fn new(vars: Arc<Vars>, sym: Symbol, var: Var) -> Self {
        let shadowed = vars.0.lock().insert(sym, var);
        Self {
            vars,
            sym,
            shadowed,
        }
    }
}

impl Drop for ScopedVar {
    fn drop(&mut self) {
        let mut map = self.vars.0.lock();
        match self.shadowed.take() {
            Some(prev) => {
                map.insert(self.sym, prev);
            }
            None => {
                map.remove(&self.sym);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flavors() {
        let simple = Variable::simple(Bytes::from_static(b"x"), VarOrigin::File);
        assert_eq!(simple.flavor(), "simple");
        assert!(simple.immediate_eval());

        let rec = Variable::recursive(
            Arc::new(Value::Literal(None, Bytes::from_static(b"x"))),
            Bytes::from_static(b"x"),
            VarOrigin::File,
        );
        assert_eq!(rec.flavor(), "recursive");
        assert!(!rec.immediate_eval());
    }

    #[test]
    fn test_scoped_var_restores() {
        let mut ctx = Context::for_tests();
        let sym = ctx.intern("V");
        let vars = Arc::new(Vars::new());
        {
            let _guard = ScopedVar::new(
                vars.clone(),
                sym,
                Variable::simple(Bytes::from_static(b"inner"), VarOrigin::File).cell(),
            );
            assert!(vars.lookup(sym).is_some());
        }
        assert!(vars.lookup(sym).is_none());
    }

    #[test]
    fn test_scope_assign_respects_readonly() {
        let mut ctx = Context::for_tests();
        let sym = ctx.intern("RO");
        let vars = Vars::new();
        let first = Variable::simple(Bytes::from_static(b"1"), VarOrigin::File).cell();
        first.write().readonly = true;
        let mut readonly = false;
        vars.assign(&ctx, sym, first, &mut readonly).unwrap();
        assert!(!readonly);

        let second = Variable::simple(Bytes::from_static(b"2"), VarOrigin::File).cell();
        vars.assign(&ctx, sym, second, &mut readonly).unwrap();
        assert!(readonly);
    }
}
