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

use crate::symtab::{Symbol, Symtab};

/// A makefile position, carried by every value and statement for
/// diagnostics and trace frames. The filename is interned; rendering one
/// back to `file:line` text needs the symbol table it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loc {
    pub filename: Symbol,
    pub line: i32,
}

impl Loc {
    pub fn new(filename: Symbol, line: i32) -> Loc {
        Loc { filename, line }
    }

    pub fn render(&self, symtab: &Symtab) -> String {
        let mut text = symtab.display(self.filename).into_owned();
        text.push(':');
        text.push_str(&self.line.to_string());
        text
    }
}

impl Default for Loc {
    fn default() -> Self {
        Loc::new(Symtab::UNKNOWN_FILE, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let mut symtab = Symtab::new();
        let file = symtab.intern("dir/build.mk");
        assert_eq!(Loc::new(file, 42).render(&symtab), "dir/build.mk:42");
        assert_eq!(Loc::default().render(&symtab), "<unknown>:0");
    }
}
