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
    collections::{HashMap, HashSet},
    ffi::{OsStr, OsString},
    os::unix::ffi::OsStrExt,
    sync::Arc,
};

use anyhow::Result;
use bytes::Bytes;

use crate::{
    error,
    fileutil::{GlobResults, libc_glob},
    find::FindEmulator,
    flags::Flags,
    func::CommandResult,
    parser::parse_file,
    stmt::StmtList,
    symtab::{Symbol, SymbolSet, Symtab},
    var::{Var, VarOrigin, Variable},
};

/// One parsed makefile; the context caches these so repeated includes parse
/// once.
pub struct Makefile {
    pub filename: Symbol,
    pub stmts: StmtList,
}

/// Symbols with built-in meaning, interned once at context creation.
pub struct WellKnown {
    pub shell: Symbol,
    pub allow_rules: Symbol,
    pub readonly_marker: Symbol,
    pub variables: Symbol,
    pub maku_symbols: Symbol,
    pub makefile_list: Symbol,
    pub shellstatus: Symbol,
    pub posix: Symbol,
    pub phony: Symbol,
    pub restat: Symbol,
    pub suffixes: Symbol,
    pub depfile: Symbol,
    pub implicit_outputs: Symbol,
    pub symlink_outputs: Symbol,
    pub ninja_pool: Symbol,
    pub validations: Symbol,
    pub tags: Symbol,
}

impl WellKnown {
    fn new(symtab: &mut Symtab) -> Self {
        Self {
            shell: symtab.intern("SHELL"),
            allow_rules: symtab.intern(".KATI_ALLOW_RULES"),
            readonly_marker: symtab.intern(".KATI_READONLY"),
            variables: symtab.intern(".VARIABLES"),
            maku_symbols: symtab.intern(".KATI_SYMBOLS"),
            makefile_list: symtab.intern("MAKEFILE_LIST"),
            shellstatus: symtab.intern(".SHELLSTATUS"),
            posix: symtab.intern(".POSIX"),
            phony: symtab.intern(".PHONY"),
            restat: symtab.intern(".KATI_RESTAT"),
            suffixes: symtab.intern(".SUFFIXES"),
            depfile: symtab.intern(".KATI_DEPFILE"),
            implicit_outputs: symtab.intern(".KATI_IMPLICIT_OUTPUTS"),
            symlink_outputs: symtab.intern(".KATI_SYMLINK_OUTPUTS"),
            ninja_pool: symtab.intern(".KATI_NINJA_POOL"),
            validations: symtab.intern(".KATI_VALIDATIONS"),
            tags: symtab.intern(".KATI_TAGS"),
        }
    }
}

/// Everything that lives for the whole run: the interner, the global variable
/// table, the caches, and the parsed flags. There are no process-wide
/// singletons; a `Context` is built in `main` (or a test) and threaded by
/// `&mut` through the evaluator and the graph builder.
pub struct Context {
    pub symtab: Symtab,
    pub syms: WellKnown,
    pub flags: Flags,

    // Global variables, one slot per symbol id.
    globals: Vec<Option<Var>>,

    pub shell_status: Option<i32>,
    pub used_env_vars: SymbolSet,
    pub used_undefined_vars: SymbolSet,

    /// Results of `$(shell)` / `$(file)` operations, for consumers that need
    /// to decide whether a later run would see different values.
    pub command_log: Vec<CommandResult>,

    glob_cache: HashMap<Bytes, GlobResults>,

    makefile_cache: HashMap<OsString, Option<Arc<Makefile>>>,
    extra_file_deps: HashSet<OsString>,

    pub find: FindEmulator,
}

impl Context {
    pub fn new(flags: Flags) -> Self {
        let mut symtab = Symtab::new();
        let syms = WellKnown::new(&mut symtab);
        let mut ctx = Self {
            symtab,
            syms,
            flags,
            globals: Vec::new(),
            shell_status: None,
            used_env_vars: SymbolSet::new(),
            used_undefined_vars: SymbolSet::new(),
            command_log: Vec::new(),
            glob_cache: HashMap::new(),
            makefile_cache: HashMap::new(),
            extra_file_deps: HashSet::new(),
            find: FindEmulator::new(),
        };

        ctx.install_global(ctx.syms.shellstatus, Variable::shell_status_cell());
        ctx.install_global(
            ctx.syms.variables,
            Variable::name_list_cell(b".VARIABLES", true),
        );
        ctx.install_global(
            ctx.syms.maku_symbols,
            Variable::name_list_cell(b".KATI_SYMBOLS", false),
        );
        ctx
    }

    pub fn for_tests() -> Self {
        Self::new(Flags::default())
    }

    pub fn intern<T: Into<Bytes> + AsRef<[u8]>>(&mut self, s: T) -> Symbol {
        self.symtab.intern(s)
    }

    /// Display form of a symbol, for diagnostics.
    pub fn sym(&self, sym: Symbol) -> String {
        self.symtab.display(sym).into_owned()
    }

    pub fn peek_global_var(&self, sym: Symbol) -> Option<Var> {
        self.globals.get(sym.as_usize())?.clone()
    }

    /// Looks up a global, recording environment-variable reads.
    pub fn get_global_var(&mut self, sym: Symbol) -> Option<Var> {
        let v = self.globals.get(sym.as_usize())?.clone()?;
        match v.read().origin() {
            VarOrigin::Environment | VarOrigin::EnvironmentOverride => {
                self.used_env_vars.insert(sym);
            }
            _ => {}
        }
        Some(v)
    }

    /// Unconditionally replaces a global slot, returning the previous
    /// occupant. This is the binding primitive for `$(call)` and
    /// `$(foreach)` parameters; `set_global_var` is the assignment path.
    pub fn swap_global(&mut self, sym: Symbol, var: Option<Var>) -> Option<Var> {
        let idx = sym.as_usize();
        if idx >= self.globals.len() {
            self.globals.resize(idx + 1, None);
        }
        std::mem::replace(&mut self.globals[idx], var)
    }

    fn install_global(&mut self, sym: Symbol, var: Var) {
        self.swap_global(sym, Some(var));
    }

    pub fn set_global_var(
        &mut self,
        sym: Symbol,
        var: Var,
        is_override: bool,
        readonly: Option<&mut bool>,
    ) -> Result<()> {
        let idx = sym.as_usize();
        if idx >= self.globals.len() {
            self.globals.resize(idx + 1, None);
        }
        let entry = &mut self.globals[idx];
        if let Some(orig) = entry {
            if orig.read().readonly {
                if let Some(readonly) = readonly {
                    *readonly = true;
                } else {
                    error!(
                        "*** cannot assign to readonly variable: {}",
                        self.symtab.display(sym)
                    );
                }
                return Ok(());
            } else if let Some(readonly) = readonly {
                *readonly = false;
            }
            let origin = orig.read().origin();
            if !is_override
                && (origin == VarOrigin::Override || origin == VarOrigin::EnvironmentOverride)
            {
                return Ok(());
            }
            if origin == VarOrigin::CommandLine && var.read().origin() == VarOrigin::File {
                return Ok(());
            }
            if origin == VarOrigin::Automatic {
                error!("overriding automatic variable is not implemented yet");
            }
        }
        *entry = Some(var);
        Ok(())
    }

    /// All named globals passing `filter`, in id order. Backs `.VARIABLES`
    /// and `.KATI_SYMBOLS`.
    pub fn global_symbols<T: Fn(&Var) -> bool>(&self, filter: T) -> Vec<(Symbol, Bytes)> {
        self.symtab
            .iter()
            .filter_map(|(sym, name)| {
                let var = self.globals.get(sym.as_usize())?.clone()?;
                if !filter(&var) {
                    return None;
                }
                Some((sym, name.clone()))
            })
            .collect()
    }

    /// Glob through the per-run cache; results are stable for the rest of
    /// the run.
    pub fn glob(&mut self, pat: Bytes) -> GlobResults {
        if let Some(entry) = self.glob_cache.get(&pat) {
            return entry.clone();
        }
        let glob = Arc::new(
            if pat.contains(&b'?')
                || pat.contains(&b'*')
                || pat.contains(&b'[')
                || pat.contains(&b'\\')
            {
                libc_glob(&pat)
            } else if let Err(err) = std::fs::metadata(<OsStr as OsStrExt>::from_bytes(&pat)) {
                Err(err)
            } else {
                Ok(vec![pat.clone()])
            },
        );
        self.glob_cache.insert(pat, glob.clone());
        glob
    }

    pub fn clear_glob_cache(&mut self) {
        self.glob_cache.clear();
    }

    /// Parsed-makefile cache; each file is read and parsed at most once.
    pub fn get_makefile(&mut self, filename: &OsStr) -> Result<Option<Arc<Makefile>>> {
        if let Some(mk) = self.makefile_cache.get(filename) {
            return Ok(mk.clone());
        }
        let mk = if std::fs::exists(filename)? {
            let buf = Bytes::from(std::fs::read(filename)?);
            let sym = self.intern(filename.as_bytes().to_vec());
            Some(Arc::new(Makefile {
                filename: sym,
                stmts: parse_file(self, &buf, sym)?,
            }))
        } else {
            None
        };
        self.makefile_cache.insert(filename.to_os_string(), mk.clone());
        Ok(mk)
    }

    pub fn add_extra_file_dep(&mut self, filename: OsString) {
        self.extra_file_deps.insert(filename);
    }

    /// Every makefile read during the run plus registered extra deps.
    pub fn all_read_files(&self) -> HashSet<OsString> {
        let mut ret = HashSet::new();
        for p in self.makefile_cache.keys() {
            ret.insert(p.clone());
        }
        for f in &self.extra_file_deps {
            ret.insert(f.clone());
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_globals_roundtrip() {
        let mut ctx = Context::for_tests();
        let sym = ctx.intern("FOO");
        assert!(ctx.peek_global_var(sym).is_none());
        let var = Variable::simple(Bytes::from_static(b"bar"), VarOrigin::File).cell();
        ctx.set_global_var(sym, var, false, None).unwrap();
        let got = ctx.peek_global_var(sym).unwrap();
        assert_eq!(got.read().flavor(), "simple");
    }

    #[test]
    fn test_readonly_refused() {
        let mut ctx = Context::for_tests();
        let sym = ctx.intern("RO");
        let var = Variable::simple(Bytes::from_static(b"1"), VarOrigin::File).cell();
        var.write().readonly = true;
        ctx.set_global_var(sym, var, false, None).unwrap();

        let next = Variable::simple(Bytes::from_static(b"2"), VarOrigin::File).cell();
        let mut readonly = false;
        ctx.set_global_var(sym, next.clone(), false, Some(&mut readonly))
            .unwrap();
        assert!(readonly);
        assert!(ctx.set_global_var(sym, next, false, None).is_err());
    }

    #[test]
    fn test_override_survives_file_assign() {
        let mut ctx = Context::for_tests();
        let sym = ctx.intern("OV");
        let var = Variable::simple(Bytes::from_static(b"keep"), VarOrigin::Override).cell();
        ctx.set_global_var(sym, var, true, None).unwrap();
        let file_var = Variable::simple(Bytes::from_static(b"lose"), VarOrigin::File).cell();
        ctx.set_global_var(sym, file_var, false, None).unwrap();
        let got = ctx.peek_global_var(sym).unwrap();
        assert_eq!(got.read().origin(), VarOrigin::Override);
    }
}
