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
use memchr::memchr;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    ffi::OsStr,
    fmt::Debug,
    os::unix::ffi::OsStrExt,
    sync::Arc,
};

use crate::{
    context::Context,
    error, error_loc,
    eval::{Evaluator, FrameType},
    expr::{Evaluable, Value},
    loc::Loc,
    log,
    rule::Rule,
    stmt::AssignOp,
    strutil::{Pattern, get_ext, strip_ext, trim_leading_curdir, word_scanner},
    symtab::{Symbol, SymbolSet},
    var::{ScopedVar, Var, Variable, Vars},
    warn, warn_loc,
};

/// Index of a [`DepNode`] in the graph arena. Edges store ids, not
/// pointers; `IN_PROGRESS` is the cycle-detection sentinel in the builder's
/// done map.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub const IN_PROGRESS: NodeId = NodeId(u32::MAX);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn from_index(index: usize) -> NodeId {
        assert!(index < u32::MAX as usize);
        NodeId(index as u32)
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == NodeId::IN_PROGRESS {
            write!(f, "node#<in-progress>")
        } else {
            write!(f, "node#{}", self.0)
        }
    }
}

/// One vertex of the dependency graph.
#[derive(Debug)]
pub struct DepNode {
    pub output: Symbol,
    pub cmds: Vec<Arc<Value>>,
    pub deps: Vec<(Symbol, NodeId)>,
    pub order_onlys: Vec<(Symbol, NodeId)>,
    pub validations: Vec<(Symbol, NodeId)>,
    pub has_rule: bool,
    pub is_default_target: bool,
    pub is_phony: bool,
    pub is_restat: bool,
    pub implicit_outputs: Vec<Symbol>,
    pub symlink_outputs: Vec<Symbol>,
    pub actual_inputs: Vec<Symbol>,
    pub actual_order_only_inputs: Vec<Symbol>,
    pub actual_validations: Vec<Symbol>,
    pub rule_vars: Option<Arc<Vars>>,
    pub depfile_var: Option<Var>,
    pub ninja_pool_var: Option<Var>,
    pub tags_var: Option<Var>,
    pub output_pattern: Option<Symbol>,
    pub loc: Option<Loc>,
}

impl DepNode {
    fn new(output: Symbol, is_phony: bool, is_restat: bool) -> Self {
        Self {
            output,
            cmds: Vec::new(),
            deps: Vec::new(),
            order_onlys: Vec::new(),
            validations: Vec::new(),
            has_rule: false,
            is_default_target: false,
            is_phony,
            is_restat,
            implicit_outputs: Vec::new(),
            symlink_outputs: Vec::new(),
            actual_inputs: Vec::new(),
            actual_order_only_inputs: Vec::new(),
            actual_validations: Vec::new(),
            rule_vars: None,
            depfile_var: None,
            ninja_pool_var: None,
            tags_var: None,
            output_pattern: None,
            loc: None,
        }
    }
}

/// The builder's output: the node arena, the requested roots, and the words
/// of `VPATH` observed at build time.
pub struct DepGraph {
    pub nodes: Vec<DepNode>,
    pub roots: Vec<(Symbol, NodeId)>,
    pub vpaths: Vec<Bytes>,
}

impl DepGraph {
    pub fn node(&self, id: NodeId) -> &DepNode {
        &self.nodes[id.index()]
    }
}

fn replace_suffix(ctx: &mut Context, s: Symbol, newsuf: Symbol) -> Symbol {
    let s = ctx.symtab.resolve(s);
    let s = strip_ext(&s);
    let newsuf = ctx.symtab.resolve(newsuf);
    let mut r = BytesMut::with_capacity(s.len() + newsuf.len() + 1);
    r.put_slice(s);
    r.put_u8(b'.');
    r.put_slice(&newsuf);
    ctx.intern(r.freeze())
}

fn apply_output_pattern(
    ctx: &mut Context,
    r: &Rule,
    output: Symbol,
    inputs: &[Symbol],
) -> Vec<Symbol> {
    let mut ret = Vec::new();
    if inputs.is_empty() {
        return ret;
    }
    if r.is_suffix_rule {
        for input in inputs {
            ret.push(replace_suffix(ctx, output, *input));
        }
        return ret;
    }
    if r.output_patterns.is_empty() {
        ret.extend(inputs);
        return ret;
    }
    assert!(r.output_patterns.len() == 1);
    let pat = Pattern::new(ctx.symtab.resolve(r.output_patterns[0]));
    let output_str = ctx.symtab.resolve(output);
    for input in inputs {
        let input_str = ctx.symtab.resolve(*input);
        let buf = pat.append_subst(&output_str, &input_str);
        ret.push(ctx.intern(buf));
    }
    ret
}

struct RuleTrieEntry {
    rule: Arc<Rule>,
    suffix: Vec<u8>,
}

/// Implicit rules keyed by the pattern suffix, walked from the end of the
/// target name.
struct RuleTrie {
    rules: Vec<RuleTrieEntry>,
    children: HashMap<u8, RuleTrie>,
}

impl RuleTrie {
    fn new() -> Self {
        Self {
            rules: Vec::new(),
            children: HashMap::new(),
        }
    }

    fn add(&mut self, name: &[u8], rule: Arc<Rule>) {
        if name.is_empty() || name.starts_with(b"%") {
            self.rules.push(RuleTrieEntry {
                rule,
                suffix: name.to_vec(),
            });
            return;
        }
        let c = name[0];
        self.children
            .entry(c)
            .or_insert_with(RuleTrie::new)
            .add(&name[1..], rule)
    }

    fn get(&self, name: &[u8]) -> Vec<Arc<Rule>> {
        let mut ret = Vec::new();
        for ent in &self.rules {
            if (ent.suffix.is_empty() && name.is_empty()) || name.ends_with(&ent.suffix[1..]) {
                ret.push(ent.rule.clone())
            }
        }
        if name.is_empty() {
            return ret;
        }
        let c = name[0];
        if let Some(child) = self.children.get(&c) {
            ret.extend(child.get(&name[1..]));
        }
        ret
    }
}

pub fn is_special_target_name(s: &[u8]) -> bool {
    s.starts_with(b".") && !s[1..].starts_with(b".")
}

/// `.c.o`-style targets: a special-looking name with exactly two dots.
fn is_suffix_rule_name(s: &[u8]) -> bool {
    if !is_special_target_name(s) {
        return false;
    }
    let rest = &s[1..];
    let Some(dot_index) = memchr(b'.', rest) else {
        return false;
    };
    memchr(b'.', &rest[dot_index + 1..]).is_none()
}

/// Collects all rules for one output and decides which one provides the
/// commands.
#[derive(Debug)]
struct RuleMerger {
    rules: Vec<Arc<Rule>>,
    implicit_outputs: Vec<(Symbol, Arc<Mutex<RuleMerger>>)>,
    symlink_outputs: Vec<Symbol>,
    validations: Vec<Symbol>,
    primary_rule: Option<Arc<Rule>>,
    parent: Option<Arc<Mutex<RuleMerger>>>,
    parent_sym: Option<Symbol>,
    is_double_colon: bool,
}

impl RuleMerger {
    fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            rules: Vec::new(),
            implicit_outputs: Vec::new(),
            symlink_outputs: Vec::new(),
            validations: Vec::new(),
            primary_rule: None,
            parent: None,
            parent_sym: None,
            is_double_colon: false,
        }))
    }

    fn add_implicit_output(&mut self, output: Symbol, merger: Arc<Mutex<RuleMerger>>) {
        self.implicit_outputs.push((output, merger))
    }

    fn add_symlink_output(&mut self, output: Symbol) {
        self.symlink_outputs.push(output)
    }

    fn add_validation(&mut self, validation: Symbol) {
        self.validations.push(validation)
    }

    fn set_implicit_output(
        &mut self,
        ctx: &Context,
        output: Symbol,
        p: Symbol,
        merger: Arc<Mutex<RuleMerger>>,
    ) -> Result<()> {
        {
            let merger = merger.lock();
            if merger.primary_rule.is_none() {
                error!(
                    "*** implicit output `{}' on phony target `{}'",
                    ctx.sym(output),
                    ctx.sym(p)
                );
            }
            if let Some(parent) = &self.parent {
                let parent = parent.lock();
                error_loc!(
                    ctx,
                    merger
                        .primary_rule
                        .as_ref()
                        .and_then(|r| r.cmd_loc)
                        .as_ref(),
                    "*** implicit output `{}' of `{}' was already defined by `{}' at {}",
                    ctx.sym(output),
                    ctx.sym(p),
                    ctx.sym(self.parent_sym.unwrap()),
                    parent
                        .primary_rule
                        .as_ref()
                        .and_then(|r| r.cmd_loc)
                        .unwrap_or_default()
                        .render(&ctx.symtab)
                );
            }
            if let Some(primary_rule) = &self.primary_rule {
                error_loc!(
                    ctx,
                    primary_rule.cmd_loc.as_ref(),
                    "*** implicit output `{}' may not have commands",
                    ctx.sym(output)
                );
            }
        }
        self.parent = Some(merger);
        self.parent_sym = Some(p);
        Ok(())
    }

    fn add_rule(&mut self, ctx: &Context, output: Symbol, r: Arc<Rule>) -> Result<()> {
        if self.rules.is_empty() {
            self.is_double_colon = r.is_double_colon
        } else if self.is_double_colon != r.is_double_colon {
            error_loc!(
                ctx,
                Some(&r.loc),
                "*** target file `{}' has both : and :: entries.",
                ctx.sym(output)
            );
        }

        if let Some(primary_rule) = &mut self.primary_rule
            && !r.cmds.is_empty()
            && !is_suffix_rule_name(&ctx.symtab.resolve(output))
            && !r.is_double_colon
        {
            if ctx.flags.werror_overriding_commands {
                error_loc!(
                    ctx,
                    r.cmd_loc.as_ref(),
                    "*** overriding commands for target `{}', previously defined at {}",
                    ctx.sym(output),
                    primary_rule.cmd_loc.unwrap_or_default().render(&ctx.symtab)
                );
            } else {
                warn_loc!(
                    ctx,
                    r.cmd_loc.as_ref(),
                    "warning: overriding commands for target `{}'",
                    ctx.sym(output)
                );
                warn_loc!(
                    ctx,
                    primary_rule.cmd_loc.as_ref(),
                    "warning: ignoring old commands for target `{}'",
                    ctx.sym(output)
                )
            }
            *primary_rule = r.clone();
        }
        if self.primary_rule.is_none() && !r.cmds.is_empty() {
            self.primary_rule = Some(r.clone());
        }
        self.rules.push(r);
        Ok(())
    }

    fn fill_dep_node_from_rule(&self, ctx: &mut Context, output: Symbol, r: &Rule, n: &mut DepNode) {
        if self.is_double_colon {
            n.cmds.extend(r.cmds.iter().cloned());
        }

        let inputs = apply_output_pattern(ctx, r, output, &r.inputs);
        n.actual_inputs.extend(inputs);
        let order_onlys = apply_output_pattern(ctx, r, output, &r.order_only_inputs);
        n.actual_order_only_inputs.extend(order_onlys);

        if !r.output_patterns.is_empty() {
            assert!(r.output_patterns.len() == 1);
            n.output_pattern = Some(r.output_patterns[0]);
        }
    }

    fn fill_dep_node_loc(&self, r: &Rule, n: &mut DepNode) {
        n.loc = Some(r.loc);
        if !r.cmds.is_empty()
            && let Some(cmd_loc) = r.cmd_loc
        {
            n.loc = Some(cmd_loc);
        }
    }

    fn fill_dep_node(
        &self,
        ctx: &mut Context,
        output: Symbol,
        pattern_rule: &Option<Arc<Rule>>,
        n: &mut DepNode,
    ) {
        if let Some(primary_rule) = &self.primary_rule {
            assert!(pattern_rule.is_none());
            self.fill_dep_node_from_rule(ctx, output, primary_rule, n);
            self.fill_dep_node_loc(primary_rule, n);
            n.cmds = primary_rule.cmds.clone();
        } else if let Some(pattern_rule) = pattern_rule {
            self.fill_dep_node_from_rule(ctx, output, pattern_rule, n);
            self.fill_dep_node_loc(pattern_rule, n);
            n.cmds = pattern_rule.cmds.clone();
        }

        for r in &self.rules {
            if let Some(primary_rule) = &self.primary_rule
                && Arc::ptr_eq(r, primary_rule)
            {
                continue;
            }
            self.fill_dep_node_from_rule(ctx, output, r, n);
            if n.loc.is_none() {
                n.loc = Some(r.loc)
            }
        }

        for (sym, merger) in &self.implicit_outputs {
            n.implicit_outputs.push(*sym);
            let merger = merger.lock();
            for r in &merger.rules {
                self.fill_dep_node_from_rule(ctx, output, r, n);
            }
        }

        for symlink in &self.symlink_outputs {
            n.symlink_outputs.push(*symlink)
        }

        for validation in &self.validations {
            n.actual_validations.push(*validation)
        }
    }
}

type SuffixRuleMap = HashMap<Bytes, Vec<Arc<Rule>>>;

struct DepBuilder<'a, 'c> {
    ev: &'a mut Evaluator<'c>,
    rules: HashMap<Symbol, Arc<Mutex<RuleMerger>>>,
    rule_vars: HashMap<Symbol, Arc<Vars>>,
    cur_rule_vars: Option<Arc<Vars>>,

    implicit_rules: RuleTrie,
    suffix_rules: SuffixRuleMap,

    first_rule: Option<Symbol>,
    nodes: Vec<DepNode>,
    done: HashMap<Symbol, NodeId>,
    phony: SymbolSet,
    restat: SymbolSet,
}

#[derive(Debug)]
struct PickedRuleInfo {
    merger: Option<Arc<Mutex<RuleMerger>>>,
    pattern_rule: Option<Arc<Rule>>,
    vars: Option<Arc<Vars>>,
}

impl<'a, 'c> DepBuilder<'a, 'c> {
    fn new(ev: &'a mut Evaluator<'c>) -> Result<Self> {
        let rule_vars = std::mem::take(&mut ev.rule_vars);
        let mut ret = Self {
            ev,
            rules: HashMap::new(),
            rule_vars,
            cur_rule_vars: None,

            implicit_rules: RuleTrie::new(),
            suffix_rules: HashMap::new(),

            first_rule: None,
            nodes: Vec::new(),
            done: HashMap::new(),
            phony: SymbolSet::new(),
            restat: SymbolSet::new(),
        };
        ret.populate_rules()?;
        ret.handle_special_targets()?;
        Ok(ret)
    }

    fn handle_special_targets(&mut self) -> Result<()> {
        let phony = self.ev.ctx.syms.phony;
        if let Some((targets, _)) = self.get_rule_inputs(phony) {
            for t in targets {
                self.phony.insert(t);
            }
        }
        let restat = self.ev.ctx.syms.restat;
        if let Some((targets, _)) = self.get_rule_inputs(restat) {
            for t in targets {
                self.restat.insert(t);
            }
        }
        let suffixes = self.ev.ctx.syms.suffixes;
        if let Some((targets, loc)) = self.get_rule_inputs(suffixes) {
            if targets.is_empty() {
                self.suffix_rules.clear();
            } else {
                warn_loc!(
                    &*self.ev.ctx,
                    Some(&loc),
                    ".SUFFIXES with prerequisites is not supported"
                );
            }
        }

        let unsupported_builtin_targets = [
            ".DEFAULT",
            ".PRECIOUS",
            ".INTERMEDIATE",
            ".SECONDARY",
            ".SECONDEXPANSION",
            ".IGNORE",
            ".LOW_RESOLUTION_TIME",
            ".SILENT",
            ".EXPORT_ALL_VARIABLES",
            ".NOTPARALLEL",
            ".ONESHELL",
        ];
        for p in unsupported_builtin_targets {
            let sym = self.ev.intern(p);
            if let Some((_, loc)) = self.get_rule_inputs(sym) {
                warn_loc!(&*self.ev.ctx, Some(&loc), "the {p} target is not supported");
            }
        }
        Ok(())
    }

    fn build(&mut self, mut targets: Vec<Symbol>) -> Result<Vec<(Symbol, NodeId)>> {
        let Some(first_rule) = self.first_rule else {
            error!("*** No targets.");
        };

        if !self.ev.ctx.flags.gen_all_targets && targets.is_empty() {
            targets.push(first_rule);
        }
        if self.ev.ctx.flags.gen_all_targets {
            let mut non_root_targets = SymbolSet::new();
            for (sym, merger) in &self.rules {
                if is_special_target_name(&self.ev.ctx.symtab.resolve(*sym)) {
                    continue;
                }
                for r in merger.lock().rules.iter() {
                    for t in &r.inputs {
                        non_root_targets.insert(*t);
                    }
                    for t in &r.order_only_inputs {
                        non_root_targets.insert(*t);
                    }
                }
            }

            let mut rule_keys = self.rules.keys().cloned().collect::<Vec<_>>();
            let symtab = &self.ev.ctx.symtab;
            rule_keys.sort_by_cached_key(|k| symtab.resolve(*k));
            for t in rule_keys {
                if !non_root_targets.contains(t)
                    && !is_special_target_name(&self.ev.ctx.symtab.resolve(t))
                {
                    targets.push(t);
                }
            }
        }

        let mut roots = Vec::new();
        for target in targets {
            let v = Arc::new(Vars::new());
            self.cur_rule_vars = Some(v.clone());
            self.ev.current_scope = Some(v.clone());
            let n = self.build_plan(target, None)?;
            if let Some(n) = n {
                roots.push((target, n));
            }
            self.ev.current_scope = None;
            self.cur_rule_vars = None;
        }
        Ok(roots)
    }

    fn exists(&mut self, target: Symbol) -> bool {
        if self.rules.contains_key(&target) || self.phony.contains(target) {
            return true;
        }
        let target = self.ev.ctx.symtab.resolve(target);
        std::fs::exists(OsStr::from_bytes(&target)).is_ok_and(|v| v)
    }

    fn get_rule_inputs(&self, s: Symbol) -> Option<(Vec<Symbol>, Loc)> {
        let merger = self.rules.get(&s)?;
        let merger = merger.lock();
        let mut ret = Vec::new();
        assert!(!merger.rules.is_empty());
        for r in &merger.rules {
            for i in &r.inputs {
                ret.push(*i);
            }
        }

        Some((ret, merger.rules[0].loc))
    }

    fn populate_rules(&mut self) -> Result<()> {
        for rule in std::mem::take(&mut self.ev.rules) {
            let rule = Arc::new(rule);
            if rule.outputs.is_empty() {
                self.populate_implicit_rule(rule)?;
            } else {
                self.populate_explicit_rule(rule)?;
            }
        }
        for rules in self.suffix_rules.values_mut() {
            rules.reverse();
        }
        for (symbol, merger) in self.rules.clone() {
            let Some(vars) = self.rule_vars.get(&symbol).cloned() else {
                continue;
            };
            let implicit_outputs_sym = self.ev.ctx.syms.implicit_outputs;
            if let Some(var) = vars.lookup(implicit_outputs_sym) {
                let implicit_outputs = var.read().eval_to_buf(self.ev)?;

                for output in word_scanner(&implicit_outputs) {
                    let sym = self
                        .ev
                        .intern(implicit_outputs.slice_ref(trim_leading_curdir(output)));
                    let child = self.rules.entry(sym).or_insert_with(RuleMerger::new).clone();
                    child
                        .lock()
                        .set_implicit_output(self.ev.ctx, sym, symbol, merger.clone())?;
                    merger.lock().add_implicit_output(sym, child);
                }
            }

            let symlink_outputs_sym = self.ev.ctx.syms.symlink_outputs;
            if let Some(var) = vars.lookup(symlink_outputs_sym) {
                let symlink_outputs = var.read().eval_to_buf(self.ev)?;

                for output in word_scanner(&symlink_outputs) {
                    let sym = self
                        .ev
                        .intern(symlink_outputs.slice_ref(trim_leading_curdir(output)));
                    merger.lock().add_symlink_output(sym);
                }
            }

            let validations_sym = self.ev.ctx.syms.validations;
            if let Some(var) = vars.lookup(validations_sym) {
                let validations = var.read().eval_to_buf(self.ev)?;

                for validation in word_scanner(&validations) {
                    let sym = self
                        .ev
                        .intern(validations.slice_ref(trim_leading_curdir(validation)));
                    merger.lock().add_validation(sym);
                }
            }
        }
        Ok(())
    }

    fn populate_suffix_rule(&mut self, rule: &Rule, output: Symbol) -> Result<bool> {
        let output_name = self.ev.ctx.symtab.resolve(output);
        if !is_suffix_rule_name(&output_name) {
            return Ok(false);
        }

        if self.ev.ctx.flags.werror_suffix_rules {
            error_loc!(
                &*self.ev.ctx,
                Some(&rule.loc),
                "*** suffix rules are obsolete: {}",
                self.ev.sym(output)
            );
        } else if self.ev.ctx.flags.warn_suffix_rules {
            warn_loc!(
                &*self.ev.ctx,
                Some(&rule.loc),
                "warning: suffix rules are deprecated: {}",
                self.ev.sym(output)
            );
        }

        let output_name = output_name.slice(1..);
        let dot_index = memchr(b'.', &output_name).unwrap();

        let input_suffix = output_name.slice(..dot_index);
        let output_suffix = output_name.slice(dot_index + 1..);
        let mut r = rule.clone();
        r.inputs.clear();
        r.inputs.push(self.ev.intern(input_suffix));
        r.is_suffix_rule = true;
        self.suffix_rules
            .entry(output_suffix)
            .or_default()
            .push(Arc::new(r));
        Ok(true)
    }

    fn populate_explicit_rule(&mut self, rule: Arc<Rule>) -> Result<()> {
        for output in &rule.outputs {
            if self.first_rule.is_none()
                && !is_special_target_name(&self.ev.ctx.symtab.resolve(*output))
            {
                self.first_rule = Some(*output);
            }
            self.rules
                .entry(*output)
                .or_insert_with(RuleMerger::new)
                .lock()
                .add_rule(self.ev.ctx, *output, rule.clone())?;
            self.populate_suffix_rule(&rule, *output)?;
        }
        Ok(())
    }

    fn is_ignorable_implicit_rule(&self, rule: &Rule) -> bool {
        // There are no RCS/SCCS default rules here, so suppressions of them
        // can be dropped.
        if rule.inputs.len() != 1 {
            return false;
        }
        if !rule.order_only_inputs.is_empty() {
            return false;
        }
        if !rule.cmds.is_empty() {
            return false;
        }
        let i = self.ev.ctx.symtab.resolve(rule.inputs[0]);
        let i = i.as_ref();
        i == b"RCS/%,v" || i == b"RCS/%" || i == b"%,v" || i == b"s.%" || i == b"SCCS/s.%"
    }

    fn populate_implicit_rule(&mut self, rule: Arc<Rule>) -> Result<()> {
        for output_pattern in &rule.output_patterns {
            let op = self.ev.ctx.symtab.resolve(*output_pattern);
            if op.as_ref() != b"%" || !self.is_ignorable_implicit_rule(&rule) {
                if self.ev.ctx.flags.werror_implicit_rules {
                    error_loc!(
                        &*self.ev.ctx,
                        Some(&rule.loc),
                        "*** implicit rules are obsolete: {}",
                        self.ev.sym(*output_pattern)
                    );
                } else if self.ev.ctx.flags.warn_implicit_rules {
                    warn_loc!(
                        &*self.ev.ctx,
                        Some(&rule.loc),
                        "warning: implicit rules are deprecated: {}",
                        self.ev.sym(*output_pattern)
                    );
                }

                self.implicit_rules.add(&op, rule.clone())
            }
        }
        Ok(())
    }

    fn can_pick_implicit_rule(
        &mut self,
        rule: &Rule,
        output: Symbol,
        id: NodeId,
    ) -> Option<Arc<Rule>> {
        let output_str = self.ev.ctx.symtab.resolve(output);
        let mut matched = None;
        for output_pattern in &rule.output_patterns {
            let pat = Pattern::new(self.ev.ctx.symtab.resolve(*output_pattern));
            if pat.matches(&output_str) {
                let mut ok = true;
                for input in &rule.inputs {
                    let input_str = self.ev.ctx.symtab.resolve(*input);
                    let buf = pat.append_subst(&output_str, &input_str);
                    let input_sym = self.ev.intern(buf);
                    if !self.exists(input_sym) {
                        ok = false;
                        break;
                    }
                }

                if ok {
                    matched = Some(*output_pattern);
                    break;
                }
            }
        }
        let matched = matched?;

        let mut rule = rule.clone();
        if rule.output_patterns.len() > 1 {
            // Mark all other output patterns as produced by this node.
            let pat = Pattern::new(self.ev.ctx.symtab.resolve(matched));
            for output_pattern in &rule.output_patterns {
                if *output_pattern == matched {
                    continue;
                }
                let other = self.ev.ctx.symtab.resolve(*output_pattern);
                let buf = pat.append_subst(&output_str, &other);
                let sym = self.ev.intern(buf);
                self.done.insert(sym, id);
            }
            rule.output_patterns.clear();
            rule.output_patterns.push(matched);
        }
        Some(Arc::new(rule))
    }

    fn merge_implicit_rule_vars(
        &self,
        output: Symbol,
        vars: Option<Arc<Vars>>,
    ) -> Option<Arc<Vars>> {
        let Some(mut found) = self.rule_vars.get(&output).cloned() else {
            return vars;
        };
        let Some(vars) = vars else {
            return Some(found.clone());
        };
        let r = Arc::make_mut(&mut found);
        r.merge_from(&vars);
        Some(found)
    }

    fn pick_rule(&mut self, output: Symbol, id: NodeId) -> Option<PickedRuleInfo> {
        let rule_merger = self.rules.get(&output).cloned();
        let vars = self.rule_vars.get(&output).cloned();
        if let Some(rule_merger) = &rule_merger
            && rule_merger.lock().primary_rule.is_some()
        {
            let mut vars = vars;
            let implicit_outputs: Vec<Symbol> = rule_merger
                .lock()
                .implicit_outputs
                .iter()
                .map(|(sym, _)| *sym)
                .collect();
            for sym in implicit_outputs {
                vars = self.merge_implicit_rule_vars(sym, vars);
            }
            return Some(PickedRuleInfo {
                merger: Some(rule_merger.clone()),
                pattern_rule: None,
                vars,
            });
        }

        // Implicit rules are tried in the reverse order of registration.
        let irules = self.implicit_rules.get(&self.ev.ctx.symtab.resolve(output));
        for rule in irules.into_iter().rev() {
            let Some(pattern_rule) = self.can_pick_implicit_rule(&rule, output, id) else {
                continue;
            };
            if rule_merger.is_some() {
                return Some(PickedRuleInfo {
                    merger: rule_merger,
                    pattern_rule: Some(pattern_rule),
                    vars,
                });
            }
            assert!(pattern_rule.output_patterns.len() == 1);
            let vars = self.merge_implicit_rule_vars(pattern_rule.output_patterns[0], vars);
            return Some(PickedRuleInfo {
                merger: None,
                pattern_rule: Some(pattern_rule),
                vars,
            });
        }

        let output_str = self.ev.ctx.symtab.resolve(output);
        let Some(output_suffix) = get_ext(&output_str) else {
            return rule_merger.map(|merger| PickedRuleInfo {
                merger: Some(merger),
                pattern_rule: None,
                vars,
            });
        };
        if !output_suffix.starts_with(b".") {
            return rule_merger.map(|merger| PickedRuleInfo {
                merger: Some(merger),
                pattern_rule: None,
                vars,
            });
        }
        let output_suffix = output_suffix[1..].to_vec();

        let Some(found) = self.suffix_rules.get(output_suffix.as_slice()).cloned() else {
            return rule_merger.map(|merger| PickedRuleInfo {
                merger: Some(merger),
                pattern_rule: None,
                vars,
            });
        };

        for irule in found {
            assert!(irule.inputs.len() == 1);
            let input = replace_suffix(self.ev.ctx, output, irule.inputs[0]);
            if !self.exists(input) {
                continue;
            }

            if rule_merger.is_some() {
                return Some(PickedRuleInfo {
                    merger: rule_merger,
                    pattern_rule: Some(irule.clone()),
                    vars,
                });
            }
            let mut vars = vars;
            if vars.is_some() {
                assert!(irule.outputs.len() == 1);
                vars = self.merge_implicit_rule_vars(irule.outputs[0], vars);
            }
            return Some(PickedRuleInfo {
                merger: rule_merger,
                pattern_rule: Some(irule.clone()),
                vars,
            });
        }

        rule_merger.map(|merger| PickedRuleInfo {
            merger: Some(merger),
            pattern_rule: None,
            vars,
        })
    }

    fn output_policy_checks(&mut self, output: Symbol, id: NodeId) -> Result<()> {
        let (is_phony, loc) = {
            let n = &self.nodes[id.index()];
            (n.is_phony, n.loc)
        };
        let output_str = self.ev.ctx.symtab.resolve(output);

        if self.ev.ctx.flags.warn_phony_looks_real && is_phony && output_str.contains(&b'/') {
            if self.ev.ctx.flags.werror_phony_looks_real {
                error_loc!(
                    &*self.ev.ctx,
                    loc.as_ref(),
                    "*** PHONY target \"{}\" looks like a real file (contains a \"/\")",
                    self.ev.sym(output)
                );
            } else {
                warn_loc!(
                    &*self.ev.ctx,
                    loc.as_ref(),
                    "warning: PHONY target \"{}\" looks like a real file (contains a \"/\")",
                    self.ev.sym(output)
                );
            }
        }

        if !self.ev.ctx.flags.writable.is_empty() && !is_phony {
            let mut found = false;
            for w in &self.ev.ctx.flags.writable {
                if output_str.starts_with(w.as_bytes()) {
                    found = true;
                    break;
                }
            }
            if !found {
                if self.ev.ctx.flags.werror_writable {
                    error_loc!(
                        &*self.ev.ctx,
                        loc.as_ref(),
                        "*** writing to readonly directory: \"{}\"",
                        self.ev.sym(output)
                    );
                } else {
                    warn_loc!(
                        &*self.ev.ctx,
                        loc.as_ref(),
                        "warning: writing to readonly directory: \"{}\"",
                        self.ev.sym(output)
                    );
                }
            }
        }
        Ok(())
    }

    fn build_plan(
        &mut self,
        mut output: Symbol,
        needed_by: Option<Symbol>,
    ) -> Result<Option<NodeId>> {
        log!("BuildPlan: {output:?} for {needed_by:?}");

        if let Some(&found) = self.done.get(&output) {
            if found == NodeId::IN_PROGRESS {
                // A cycle. Drop the edge, warn, keep going.
                if !self.phony.contains(output) {
                    let needed_by_str = needed_by
                        .map(|s| self.ev.sym(s))
                        .unwrap_or_else(|| "(null)".to_string());
                    warn!(
                        "Circular {needed_by_str} <- {} dependency dropped.",
                        self.ev.sym(output)
                    );
                }
                return Ok(None);
            }
            return Ok(Some(found));
        }

        let requested = output;
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(DepNode::new(
            output,
            self.phony.contains(output),
            self.restat.contains(output),
        ));
        self.done.insert(output, NodeId::IN_PROGRESS);

        let Some(mut picked_rule_info) = self.pick_rule(output, id) else {
            self.done.insert(requested, id);
            return Ok(Some(id));
        };
        if let Some(merger) = &picked_rule_info.merger
            && merger.lock().parent.is_some()
        {
            // An implicit output: the node is really built by the parent
            // output's rule, so re-point and pick again.
            output = merger.lock().parent_sym.unwrap();
            self.done.insert(output, id);
            self.nodes[id.index()].output = output;
            let Some(new_picked_rule_info) = self.pick_rule(output, id) else {
                self.done.insert(requested, id);
                return Ok(Some(id));
            };
            picked_rule_info = new_picked_rule_info;
        }

        {
            let merger = picked_rule_info.merger.clone().unwrap_or_else(RuleMerger::new);
            let merger = merger.lock();
            let node = &mut self.nodes[id.index()];
            merger.fill_dep_node(self.ev.ctx, output, &picked_rule_info.pattern_rule, node);
        }

        let mut sv = Vec::new();
        let node_loc = self.nodes[id.index()].loc;
        let output_str = self.ev.ctx.symtab.resolve(output);
        let frame = self.ev.enter(
            FrameType::Dependency,
            output_str,
            node_loc.unwrap_or_default(),
        );

        if let Some(vars) = &picked_rule_info.vars {
            for (name, var) in vars.snapshot() {
                let mut new_var = var.clone();
                match var.read().assign_op {
                    Some(AssignOp::PlusEq) => {
                        if let Some(old_var) = self.ev.lookup_var(name)? {
                            let mut s = old_var.read().eval_to_buf_mut(self.ev)?;
                            if !s.is_empty() {
                                s.put_u8(b' ')
                            }
                            new_var.read().eval(self.ev, &mut s)?;
                            new_var = Variable::simple(s.freeze(), old_var.read().origin())
                                .defined_at(frame.current(), node_loc)
                                .cell();
                        }
                    }
                    Some(AssignOp::QuestionEq) => {
                        if self.ev.lookup_var(name)?.is_some() {
                            continue;
                        }
                    }
                    _ => {}
                }

                if name == self.ev.ctx.syms.depfile {
                    self.nodes[id.index()].depfile_var = Some(new_var);
                } else if name == self.ev.ctx.syms.implicit_outputs
                    || name == self.ev.ctx.syms.symlink_outputs
                    || name == self.ev.ctx.syms.validations
                {
                } else if name == self.ev.ctx.syms.ninja_pool {
                    self.nodes[id.index()].ninja_pool_var = Some(new_var);
                } else if name == self.ev.ctx.syms.tags {
                    self.nodes[id.index()].tags_var = Some(new_var);
                } else {
                    sv.push(ScopedVar::new(
                        self.cur_rule_vars.clone().unwrap(),
                        name,
                        new_var,
                    ));
                }
            }
        }

        self.output_policy_checks(output, id)?;

        let implicit_outputs = self.nodes[id.index()].implicit_outputs.clone();
        for implicit_output in implicit_outputs {
            self.done.insert(implicit_output, id);
            self.output_policy_checks(implicit_output, id)?;
        }

        let actual_inputs = self.nodes[id.index()].actual_inputs.clone();
        for input in actual_inputs {
            let Some(c) = self.build_plan(input, Some(output))? else {
                continue;
            };
            self.nodes[id.index()].deps.push((input, c));

            let (mut is_phony, child_has_rule) = {
                let child = &self.nodes[c.index()];
                (child.is_phony, child.has_rule)
            };
            if !is_phony && !child_has_rule && self.ev.ctx.flags.top_level_phony {
                is_phony = !self.ev.ctx.symtab.resolve(input).contains(&b'/');
            }
            if !self.nodes[id.index()].is_phony && is_phony {
                if self.ev.ctx.flags.werror_real_to_phony {
                    let loc = self.nodes[id.index()].loc;
                    error_loc!(
                        &*self.ev.ctx,
                        loc.as_ref(),
                        "*** real file \"{}\" depends on PHONY target \"{}\"",
                        self.ev.sym(output),
                        self.ev.sym(input)
                    );
                } else if self.ev.ctx.flags.warn_real_to_phony {
                    let loc = self.nodes[id.index()].loc;
                    warn_loc!(
                        &*self.ev.ctx,
                        loc.as_ref(),
                        "warning: real file \"{}\" depends on PHONY target \"{}\"",
                        self.ev.sym(output),
                        self.ev.sym(input)
                    );
                }
            }
        }

        let actual_order_only_inputs = self.nodes[id.index()].actual_order_only_inputs.clone();
        for input in actual_order_only_inputs {
            let Some(c) = self.build_plan(input, Some(output))? else {
                continue;
            };
            self.nodes[id.index()].order_onlys.push((input, c));
        }

        let actual_validations = self.nodes[id.index()].actual_validations.clone();
        for validation in actual_validations {
            if !self.ev.ctx.flags.use_ninja_validations {
                let loc = self.nodes[id.index()].loc;
                error_loc!(
                    &*self.ev.ctx,
                    loc.as_ref(),
                    ".KATI_VALIDATIONS not allowed without --use_ninja_validations"
                );
            }
            let Some(c) = self.build_plan(validation, Some(output))? else {
                continue;
            };
            self.nodes[id.index()].validations.push((validation, c));
        }

        // These run behind werror_writable/werror_phony_looks_real because
        // is_phony is only trustworthy once those are enforced.
        if !self.nodes[id.index()].is_phony
            && self.nodes[id.index()].cmds.is_empty()
            && self.ev.ctx.flags.werror_writable
            && self.ev.ctx.flags.werror_phony_looks_real
        {
            let (no_deps, single_input, loc) = {
                let n = &self.nodes[id.index()];
                (
                    n.deps.is_empty() && n.order_onlys.is_empty(),
                    (n.actual_inputs.len() == 1).then(|| n.actual_inputs[0]),
                    n.loc,
                )
            };
            if no_deps {
                if self.ev.ctx.flags.werror_real_no_cmds_or_deps {
                    error_loc!(
                        &*self.ev.ctx,
                        loc.as_ref(),
                        "*** target \"{}\" has no commands or deps that could create it",
                        self.ev.sym(output)
                    );
                } else if self.ev.ctx.flags.warn_real_no_cmds_or_deps {
                    warn_loc!(
                        &*self.ev.ctx,
                        loc.as_ref(),
                        "warning: target \"{}\" has no commands or deps that could create it",
                        self.ev.sym(output)
                    );
                }
            } else if let Some(input) = single_input {
                if self.ev.ctx.flags.werror_real_no_cmds {
                    error_loc!(
                        &*self.ev.ctx,
                        loc.as_ref(),
                        "*** target \"{}\" has no commands. Should \"{}\" be using .KATI_IMPLICIT_OUTPUTS?",
                        self.ev.sym(output),
                        self.ev.sym(input)
                    );
                } else if self.ev.ctx.flags.warn_real_no_cmds {
                    warn_loc!(
                        &*self.ev.ctx,
                        loc.as_ref(),
                        "warning: target \"{}\" has no commands. Should \"{}\" be using .KATI_IMPLICIT_OUTPUTS?",
                        self.ev.sym(output),
                        self.ev.sym(input)
                    );
                }
            } else if self.ev.ctx.flags.werror_real_no_cmds {
                error_loc!(
                    &*self.ev.ctx,
                    loc.as_ref(),
                    "*** target \"{}\" has no commands that could create output file. Is a dependency missing .KATI_IMPLICIT_OUTPUTS?",
                    self.ev.sym(output)
                );
            } else if self.ev.ctx.flags.warn_real_no_cmds {
                warn_loc!(
                    &*self.ev.ctx,
                    loc.as_ref(),
                    "warning: target \"{}\" has no commands that could create output file. Is a dependency missing .KATI_IMPLICIT_OUTPUTS?",
                    self.ev.sym(output)
                );
            }
        }

        {
            let is_default = self.first_rule == Some(output);
            let rule_vars = self.cur_rule_vars.as_ref().map(|cur| {
                let v = Vars::new();
                v.merge_from(cur);
                Arc::new(v)
            });
            let n = &mut self.nodes[id.index()];
            n.has_rule = true;
            n.is_default_target = is_default;
            n.rule_vars = rule_vars;
        }

        drop(frame);
        drop(sv);

        self.done.insert(requested, id);
        self.done.insert(output, id);
        Ok(Some(id))
    }
}

pub fn make_dep(ev: &mut Evaluator, targets: Vec<Symbol>) -> Result<DepGraph> {
    let mut db = DepBuilder::new(ev)?;
    let roots = db.build(targets)?;

    let vpath_sym = db.ev.intern("VPATH");
    let vpath = db.ev.eval_var(vpath_sym)?;
    let vpaths = word_scanner(&vpath)
        .map(|tok| vpath.slice_ref(tok))
        .collect();

    Ok(DepGraph {
        nodes: db.nodes,
        roots,
        vpaths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::parser::parse_buf;

    fn build_graph(ctx: &mut Context, text: &'static [u8], targets: &[&str]) -> DepGraph {
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
        make_dep(&mut ev, targets).unwrap()
    }

    #[test]
    fn test_is_suffix_rule_name() {
        assert!(is_suffix_rule_name(b".c.o"));
        assert!(!is_suffix_rule_name(b"foo"));
        assert!(!is_suffix_rule_name(b".co"));
        assert!(!is_suffix_rule_name(b".c.o.b"));
    }

    #[test]
    fn test_first_target_is_default() {
        let mut ctx = Context::for_tests();
        let graph = build_graph(&mut ctx, b"all: dep\n\techo hi\ndep:\n\techo dep\n", &[]);
        assert_eq!(graph.roots.len(), 1);
        let root = graph.node(graph.roots[0].1);
        assert!(root.is_default_target);
        assert_eq!(root.deps.len(), 1);
        let dep = graph.node(root.deps[0].1);
        assert_eq!(dep.cmds.len(), 1);
    }

    #[test]
    fn test_phony_marking() {
        let mut ctx = Context::for_tests();
        let graph = build_graph(&mut ctx, b".PHONY: all\nall:\n\techo hi\n", &["all"]);
        assert!(graph.node(graph.roots[0].1).is_phony);
    }

    #[test]
    fn test_restat_marking() {
        let mut ctx = Context::for_tests();
        let graph = build_graph(&mut ctx, b".KATI_RESTAT: out\nout:\n\ttouch out\n", &["out"]);
        assert!(graph.node(graph.roots[0].1).is_restat);
    }

    #[test]
    fn test_circular_dependency_dropped() {
        let mut ctx = Context::for_tests();
        let graph = build_graph(&mut ctx, b"a: b\n\techo a\nb: a\n\techo b\n", &["a"]);
        let a = graph.node(graph.roots[0].1);
        assert_eq!(a.deps.len(), 1);
        let b = graph.node(a.deps[0].1);
        // The b -> a edge must have been dropped.
        assert!(b.deps.is_empty());
    }

    #[test]
    fn test_double_colon_appends_commands() {
        let mut ctx = Context::for_tests();
        let graph = build_graph(
            &mut ctx,
            b"x::\n\techo one\nx::\n\techo two\n",
            &["x"],
        );
        assert_eq!(graph.node(graph.roots[0].1).cmds.len(), 2);
    }

    #[test]
    fn test_later_implicit_rule_wins() {
        let mut ctx = Context::for_tests();
        // Both patterns match "out.o"; the most recently registered one with
        // existing inputs must win. Neither input exists on disk, so declare
        // them as targets.
        let graph = build_graph(
            &mut ctx,
            b"first:\n\techo f\nsecond:\n\techo s\n%.o: first\n\techo FIRST\n%.o: second\n\techo SECOND\nall: out.o\n\techo done\n",
            &["out.o"],
        );
        let node = graph.node(graph.roots[0].1);
        assert_eq!(node.actual_inputs.len(), 1);
        let dep_name = ctx.sym(node.actual_inputs[0]);
        assert_eq!(dep_name, "second");
    }

    #[test]
    fn test_target_specific_var_interception() {
        let mut ctx = Context::for_tests();
        let graph = build_graph(
            &mut ctx,
            b"out: .KATI_DEPFILE := out.d\nout:\n\ttouch out\n",
            &["out"],
        );
        let node = graph.node(graph.roots[0].1);
        assert!(node.depfile_var.is_some());
        assert!(node.rule_vars.is_some());
    }

    #[test]
    fn test_static_pattern_rule() {
        let mut ctx = Context::for_tests();
        let graph = build_graph(
            &mut ctx,
            b"a.c:\n\techo src\nobjs := a.o\nall: $(objs)\n\techo all\n$(objs): %.o: %.c\n\techo CC\n",
            &["a.o"],
        );
        let node = graph.node(graph.roots[0].1);
        assert_eq!(node.actual_inputs.len(), 1);
        assert_eq!(ctx.sym(node.actual_inputs[0]), "a.c");
        assert!(node.output_pattern.is_some());
    }
}
