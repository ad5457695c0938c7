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

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use memchr::memchr;

use crate::context::Context;
use crate::expr::Value;
use crate::loc::Loc;
use crate::stmt::{RuleSep, RuleStmt};
use crate::strutil::{Pattern, trim_leading_curdir, word_scanner};
use crate::symtab::Symbol;
use crate::{error_loc, warn_loc};

pub fn is_pattern_rule(target: &[u8]) -> bool {
    target.contains(&b'%')
}

/// One parsed `targets [: target-pattern] : prerequisites [; recipe]` line.
#[derive(Clone)]
pub struct Rule {
    pub outputs: Vec<Symbol>,
    pub inputs: Vec<Symbol>,
    pub order_only_inputs: Vec<Symbol>,
    pub output_patterns: Vec<Symbol>,
    pub is_double_colon: bool,
    pub is_suffix_rule: bool,
    pub cmds: Vec<Arc<Value>>,
    pub loc: Loc,
    pub cmd_loc: Option<Loc>,
}

/// Interns the words of a prerequisite list, splitting at the `|` marker:
/// everything after it is order-only.
fn scan_prereqs(ctx: &mut Context, list: &Bytes) -> (Vec<Symbol>, Vec<Symbol>) {
    let mut normal = Vec::new();
    let mut order_only = Vec::new();
    let mut after_bar = false;
    for word in word_scanner(list) {
        if word == b"|" {
            after_bar = true;
            continue;
        }
        let sym = ctx.intern(list.slice_ref(trim_leading_curdir(word)));
        if after_bar {
            order_only.push(sym);
        } else {
            normal.push(sym);
        }
    }
    (normal, order_only)
}

impl Rule {
    pub fn new(loc: Loc, is_double_colon: bool) -> Self {
        Self {
            outputs: Vec::new(),
            inputs: Vec::new(),
            order_only_inputs: Vec::new(),
            output_patterns: Vec::new(),
            is_double_colon,
            is_suffix_rule: false,
            cmds: Vec::new(),
            loc,
            cmd_loc: None,
        }
    }

    fn take_prereqs(&mut self, ctx: &mut Context, list: &Bytes) {
        let (normal, order_only) = scan_prereqs(ctx, list);
        self.inputs = normal;
        self.order_only_inputs = order_only;
    }

    /// Parses everything after the first `:` of a rule line. `separator_pos`
    /// points at the `;` that starts an inline recipe, if any.
    pub fn parse_prerequisites(
        &mut self,
        ctx: &mut Context,
        line: &Bytes,
        separator_pos: Option<usize>,
        rule_stmt: &RuleStmt,
    ) -> Result<()> {
        // Peel off an inline recipe first; what remains is either plain
        // prerequisites or `target-pattern : prereq-patterns`.
        let prereqs = match separator_pos {
            Some(semi) if rule_stmt.sep != RuleSep::Semicolon => {
                assert!(line[semi] == b';');
                self.cmds
                    .push(Arc::new(Value::Literal(None, line.slice(semi + 1..))));
                line.slice(..semi)
            }
            _ => line.clone(),
        };

        match memchr(b':', &prereqs) {
            None => {
                self.take_prereqs(ctx, &prereqs);
                Ok(())
            }
            Some(colon) => self.parse_static_pattern(
                ctx,
                prereqs.slice(..colon),
                prereqs.slice(colon + 1..),
            ),
        }
    }

    fn parse_static_pattern(
        &mut self,
        ctx: &mut Context,
        target_pats: Bytes,
        prereq_pats: Bytes,
    ) -> Result<()> {
        if !self.output_patterns.is_empty() {
            error_loc!(
                ctx,
                Some(&self.loc),
                "*** mixed implicit and normal rules: deprecated syntax"
            );
        }

        // A static pattern with no targets produces no rule, but its recipe
        // still has to be consumed.
        if self.outputs.is_empty() {
            return Ok(());
        }

        for word in word_scanner(&target_pats) {
            let pattern_text = target_pats.slice_ref(trim_leading_curdir(word));
            let pattern = Pattern::new(pattern_text.clone());
            for target in &self.outputs {
                if !pattern.matches(&ctx.symtab.resolve(*target)) {
                    warn_loc!(
                        ctx,
                        Some(&self.loc),
                        "target `{}' doesn't match the target pattern",
                        ctx.sym(*target)
                    );
                }
            }
            self.output_patterns.push(ctx.intern(pattern_text));
        }

        match self.output_patterns.as_slice() {
            [] => error_loc!(ctx, Some(&self.loc), "*** missing target pattern."),
            [only] => {
                if !is_pattern_rule(&ctx.symtab.resolve(*only)) {
                    error_loc!(ctx, Some(&self.loc), "*** target pattern contains no '%'.");
                }
            }
            _ => error_loc!(ctx, Some(&self.loc), "*** multiple target patterns."),
        }

        self.take_prereqs(ctx, &prereq_pats);
        Ok(())
    }
}

impl Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("Rule");
        d.field("outputs", &self.outputs)
            .field("inputs", &self.inputs);
        if !self.order_only_inputs.is_empty() {
            d.field("order_only_inputs", &self.order_only_inputs);
        }
        if !self.output_patterns.is_empty() {
            d.field("output_patterns", &self.output_patterns);
        }
        if self.is_double_colon {
            d.field("is_double_colon", &true);
        }
        if self.is_suffix_rule {
            d.field("is_suffix_rule", &true);
        }
        if !self.cmds.is_empty() {
            d.field("cmds", &self.cmds.len());
        }
        d.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_prereqs_order_only_split() {
        let mut ctx = Context::for_tests();
        let (normal, order_only) =
            scan_prereqs(&mut ctx, &Bytes::from_static(b"a ./b | c d"));
        let names: Vec<String> = normal.iter().map(|s| ctx.sym(*s)).collect();
        assert_eq!(names, vec!["a", "b"]);
        let names: Vec<String> = order_only.iter().map(|s| ctx.sym(*s)).collect();
        assert_eq!(names, vec!["c", "d"]);
    }

    #[test]
    fn test_is_pattern_rule() {
        assert!(is_pattern_rule(b"%.o"));
        assert!(!is_pattern_rule(b"foo.o"));
    }
}
