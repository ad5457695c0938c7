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

use strutil::trim_prefix_str;

pub mod command;
pub mod context;
pub mod dep;
pub mod eval;
pub mod exec;
pub mod expr;
pub mod fileutil;
pub mod find;
pub mod flags;
pub mod func;
pub mod loc;
pub mod parser;
pub mod query;
pub mod rule;
pub mod stmt;
pub mod strutil;
pub mod symtab;
pub mod var;

#[macro_export]
macro_rules! log {
    ($fmt:expr $(, $($arg:tt)*)?) => {
        log::trace!($fmt, $($($arg)*)?)
    };
}

#[macro_export]
macro_rules! warn {
    ($fmt:expr $(, $($arg:tt)*)?) => {
        eprintln!($fmt, $($($arg)*)?)
    };
}

#[macro_export]
macro_rules! maku_warn {
    ($ctx:expr, $fmt:expr $(, $($arg:tt)*)?) => {
        if $ctx.flags.enable_extra_warnings {
            eprintln!($fmt, $($($arg)*)?)
        }
    };
}

#[macro_export]
macro_rules! error {
    ($fmt:expr $(, $($arg:tt)*)?) => {
        anyhow::bail!($fmt, $($($arg)*)?)
    };
}

#[macro_export]
macro_rules! warn_loc {
    ($ctx:expr, $loc:expr, $fmt:expr $(, $($arg:tt)*)?) => {
        $crate::render_warn($ctx, $loc, format!($fmt, $($($arg)*)?))
    };
}

#[macro_export]
macro_rules! maku_warn_loc {
    ($ctx:expr, $loc:expr, $fmt:expr $(, $($arg:tt)*)?) => {
        if $ctx.flags.enable_extra_warnings {
            $crate::render_warn($ctx, $loc, format!($fmt, $($($arg)*)?))
        }
    };
}

#[macro_export]
macro_rules! error_loc {
    ($ctx:expr, $loc:expr, $fmt:expr $(, $($arg:tt)*)?) => {
        return Err($crate::render_error($ctx, $loc, format!($fmt, $($($arg)*)?)))
    };
}

const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";
const MAGENTA: &str = "\x1b[35m";
const RED: &str = "\x1b[31m";

/// A located, Make-compatible user error; the process exits with code 2 for
/// these, and 1 for everything else.
#[derive(Debug)]
pub struct MakeError(pub String);

impl std::fmt::Display for MakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MakeError {}

pub fn render_error(
    ctx: &context::Context,
    loc: Option<&loc::Loc>,
    msg: String,
) -> anyhow::Error {
    let Some(loc) = loc else {
        return anyhow::Error::new(MakeError(msg));
    };
    let loc = loc.render(&ctx.symtab);

    if ctx.flags.color_warnings {
        let filtered = trim_prefix_str(&msg, "*** ");

        anyhow::Error::new(MakeError(format!(
            "{BOLD}{loc}: {RED}error: {RESET}{BOLD}{filtered}{RESET}"
        )))
    } else {
        anyhow::Error::new(MakeError(format!("{loc}: {msg}")))
    }
}

pub fn render_warn(ctx: &context::Context, loc: Option<&loc::Loc>, msg: String) {
    let Some(loc) = loc else {
        eprintln!("{msg}");
        return;
    };
    let loc = loc.render(&ctx.symtab);

    if ctx.flags.color_warnings {
        let mut filtered = trim_prefix_str(&msg, "*warning*: ");
        filtered = trim_prefix_str(filtered, "warning: ");

        eprintln!("{BOLD}{loc}: {MAGENTA}warning: {RESET}{BOLD}{filtered}{RESET}")
    } else {
        eprintln!("{loc}: {msg}")
    }
}
