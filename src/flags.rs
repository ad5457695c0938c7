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
    env,
    ffi::{OsStr, OsString},
    os::unix::ffi::{OsStrExt, OsStringExt},
    vec::IntoIter,
};

use crate::strutil::{Pattern, word_scanner};
use bytes::Bytes;

/// The parsed command line. Plain data; the context owns one copy for the
/// whole run.
#[derive(Default)]
pub struct Flags {
    pub dump_include_graph: Option<OsString>,
    pub dump_variable_assignment_trace: Option<OsString>,
    pub enable_extra_warnings: bool,
    pub gen_all_targets: bool,
    pub generate_ninja: bool,
    pub is_dry_run: bool,
    pub ignore_errors: bool,
    pub is_silent_mode: bool,
    pub is_syntax_check_only: bool,
    pub use_find_emulator: bool,
    pub color_warnings: bool,
    pub no_builtin_rules: bool,
    pub use_ninja_validations: bool,
    pub werror_find_emulator: bool,
    pub werror_overriding_commands: bool,
    pub warn_implicit_rules: bool,
    pub werror_implicit_rules: bool,
    pub warn_suffix_rules: bool,
    pub werror_suffix_rules: bool,
    pub top_level_phony: bool,
    pub warn_real_to_phony: bool,
    pub werror_real_to_phony: bool,
    pub warn_phony_looks_real: bool,
    pub werror_phony_looks_real: bool,
    pub werror_writable: bool,
    pub warn_real_no_cmds_or_deps: bool,
    pub werror_real_no_cmds_or_deps: bool,
    pub warn_real_no_cmds: bool,
    pub werror_real_no_cmds: bool,
    pub ignore_dirty_pattern: Option<Pattern>,
    pub no_ignore_dirty_pattern: Option<Pattern>,
    pub ignore_optional_include_pattern: Option<Pattern>,
    pub makefile: Option<OsString>,
    pub ninja_dir: Option<OsString>,
    pub ninja_suffix: OsString,
    pub working_dir: Option<OsString>, // -C <dir>
    pub num_jobs: usize,
    pub subkati_args: Vec<OsString>,
    pub targets: Vec<Bytes>,
    pub cl_vars: Vec<Bytes>,
    pub writable: Vec<OsString>,
    pub traced_variables_pattern: Vec<Pattern>,
}

/// Switches without a value, including the warn/werror policy pairs
/// (`--werror_*` implies the matching `--warn_*`).
fn bool_flag(name: &[u8]) -> Option<fn(&mut Flags)> {
    let set: fn(&mut Flags) = match name {
        b"-c" => |f| f.is_syntax_check_only = true,
        b"-n" => |f| f.is_dry_run = true,
        b"-i" => |f| f.ignore_errors = true,
        b"-s" => |f| f.is_silent_mode = true,
        b"--warn" => |f| f.enable_extra_warnings = true,
        b"--ninja" => |f| f.generate_ninja = true,
        b"--gen_all_targets" => |f| f.gen_all_targets = true,
        b"--color_warnings" => |f| f.color_warnings = true,
        b"--no_builtin_rules" => |f| f.no_builtin_rules = true,
        b"--use_find_emulator" => |f| f.use_find_emulator = true,
        b"--use_ninja_validations" => |f| f.use_ninja_validations = true,
        b"--top_level_phony" => |f| f.top_level_phony = true,
        b"--werror_find_emulator" => |f| f.werror_find_emulator = true,
        b"--werror_overriding_commands" => |f| f.werror_overriding_commands = true,
        b"--warn_implicit_rules" => |f| f.warn_implicit_rules = true,
        b"--werror_implicit_rules" => |f| f.werror_implicit_rules = true,
        b"--warn_suffix_rules" => |f| f.warn_suffix_rules = true,
        b"--werror_suffix_rules" => |f| f.werror_suffix_rules = true,
        b"--warn_real_to_phony" => |f| f.warn_real_to_phony = true,
        b"--werror_real_to_phony" => |f| {
            f.warn_real_to_phony = true;
            f.werror_real_to_phony = true;
        },
        b"--warn_phony_looks_real" => |f| f.warn_phony_looks_real = true,
        b"--werror_phony_looks_real" => |f| {
            f.warn_phony_looks_real = true;
            f.werror_phony_looks_real = true;
        },
        b"--werror_writable" => |f| f.werror_writable = true,
        b"--warn_real_no_cmds_or_deps" => |f| f.warn_real_no_cmds_or_deps = true,
        b"--werror_real_no_cmds_or_deps" => |f| {
            f.warn_real_no_cmds_or_deps = true;
            f.werror_real_no_cmds_or_deps = true;
        },
        b"--warn_real_no_cmds" => |f| f.warn_real_no_cmds = true,
        b"--werror_real_no_cmds" => |f| {
            f.warn_real_no_cmds = true;
            f.werror_real_no_cmds = true;
        },
        _ => return None,
    };
    Some(set)
}

/// Splits `--flag=value` into name and inline value.
fn split_eq(arg: &[u8]) -> (&[u8], Option<&[u8]>) {
    match arg.iter().position(|c| *c == b'=') {
        Some(eq) => (&arg[..eq], Some(&arg[eq + 1..])),
        None => (arg, None),
    }
}

/// The value of a flag: inline (`--flag=v`, `-j8`) or the next argument.
fn flag_value(inline: Option<&[u8]>, it: &mut IntoIter<OsString>) -> Option<OsString> {
    match inline {
        Some(v) => Some(OsString::from_vec(v.to_vec())),
        None => it.next(),
    }
}

fn pattern_of(value: Option<OsString>) -> Option<Pattern> {
    value.map(|v| Pattern::new(Bytes::from(v.as_bytes().to_vec())))
}

impl Flags {
    pub fn from_args(args: Vec<OsString>) -> Flags {
        let mut it = args.into_iter();
        let mut flags = Flags::default();
        flags.subkati_args.push(it.next().unwrap());
        flags.num_jobs = std::thread::available_parallelism().map_or(1, |p| p.get());

        if let Some(makeflags) = env::var_os("MAKEFLAGS") {
            for tok in word_scanner(makeflags.as_bytes()) {
                if !tok.starts_with(b"-") && tok.contains(&b'=') {
                    flags.cl_vars.push(Bytes::from(tok.to_vec()));
                }
            }
        }

        while let Some(arg) = it.next() {
            if flags.consume_arg(&arg, &mut it) {
                flags.subkati_args.push(arg);
            }
        }

        if !flags.traced_variables_pattern.is_empty()
            && flags.dump_variable_assignment_trace.is_none()
        {
            panic!(
                "--variable_assignment_trace_filter is valid only together with --dump_variable_assignment_trace"
            );
        }

        flags
    }

    // Returns whether the argument should be propagated to sub-invocations
    // through the MAKE variable.
    fn consume_arg(&mut self, arg: &OsStr, it: &mut IntoIter<OsString>) -> bool {
        let bytes = arg.as_bytes();

        if !bytes.starts_with(b"-") {
            if bytes.contains(&b'=') {
                self.cl_vars.push(Bytes::from(bytes.to_vec()));
                return true;
            }
            self.targets.push(Bytes::from(bytes.to_vec()));
            return false;
        }

        if bytes == b"-f" {
            self.makefile = it.next();
            return false;
        }

        if let Some(set) = bool_flag(bytes) {
            set(self);
            return true;
        }

        let (mut name, mut inline) = split_eq(bytes);
        // Short options may attach their value directly: -j8, -Cout.
        if inline.is_none() && !name.starts_with(b"--") && name.len() > 2 {
            inline = Some(&name[2..]);
            name = &name[..2];
        }

        match name {
            b"-C" => self.working_dir = flag_value(inline, it),
            b"-j" => {
                let value = flag_value(inline, it).unwrap_or_default();
                let Ok(num_jobs) = value.to_string_lossy().parse::<usize>() else {
                    panic!("Invalid -j flag: {}", value.to_string_lossy());
                };
                self.num_jobs = num_jobs;
            }
            b"--dump_include_graph" => self.dump_include_graph = flag_value(inline, it),
            b"--dump_variable_assignment_trace" => {
                self.dump_variable_assignment_trace = flag_value(inline, it)
            }
            b"--variable_assignment_trace_filter" => {
                let value = flag_value(inline, it).unwrap_or_default();
                for pat in word_scanner(value.as_bytes()) {
                    self.traced_variables_pattern
                        .push(Pattern::new(Bytes::from(pat.to_vec())));
                }
            }
            b"--ninja_suffix" => self.ninja_suffix = flag_value(inline, it).unwrap_or_default(),
            b"--ninja_dir" => self.ninja_dir = flag_value(inline, it),
            b"--ignore_optional_include" => {
                self.ignore_optional_include_pattern = pattern_of(flag_value(inline, it))
            }
            b"--ignore_dirty" => self.ignore_dirty_pattern = pattern_of(flag_value(inline, it)),
            b"--no_ignore_dirty" => {
                self.no_ignore_dirty_pattern = pattern_of(flag_value(inline, it))
            }
            b"--writable" => {
                if let Some(dir) = flag_value(inline, it) {
                    self.writable.push(dir);
                }
            }
            _ => panic!("Unknown flag: {}", arg.to_string_lossy()),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_strs(args: &[&str]) -> Flags {
        Flags::from_args(args.iter().map(|s| s.into()).collect())
    }

    #[test]
    fn test_makefile_flag() {
        let flags = from_strs(&["test", "-f", "main.mk"]);
        assert_eq!(flags.makefile.unwrap(), "main.mk");
    }

    #[test]
    fn test_positional_args() {
        let flags = from_strs(&["test", "FOO=bar", "all", "clean"]);
        assert_eq!(flags.cl_vars, vec![Bytes::from_static(b"FOO=bar")]);
        assert_eq!(
            flags.targets,
            vec![Bytes::from_static(b"all"), Bytes::from_static(b"clean")]
        );
    }

    #[test]
    fn test_short_flags() {
        let flags = from_strs(&["test", "-n", "-s", "-i", "-j4"]);
        assert!(flags.is_dry_run);
        assert!(flags.is_silent_mode);
        assert!(flags.ignore_errors);
        assert_eq!(flags.num_jobs, 4);
    }

    #[test]
    fn test_value_flag_forms() {
        let flags = from_strs(&["test", "--ignore_optional_include=out/%.P", "-C", "sub"]);
        assert!(flags.ignore_optional_include_pattern.is_some());
        assert_eq!(flags.working_dir.unwrap(), "sub");

        let flags = from_strs(&["test", "--ninja_suffix", ".variant"]);
        assert_eq!(flags.ninja_suffix, ".variant");
    }

    #[test]
    fn test_werror_pairs_imply_warn() {
        let flags = from_strs(&["test", "--werror_phony_looks_real"]);
        assert!(flags.warn_phony_looks_real);
        assert!(flags.werror_phony_looks_real);
    }
}
