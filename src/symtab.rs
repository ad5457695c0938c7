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

use std::{borrow::Cow, collections::HashMap, fmt::Debug, num::NonZeroU32};

use bytes::{BufMut, Bytes, BytesMut};

/// An interned name. A `Symbol` is a bare handle; resolving it back to text
/// requires the [`Symtab`] it was interned into.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(NonZeroU32);

impl Symbol {
    pub fn as_usize(&self) -> usize {
        self.0.get() as usize
    }

    fn from_usize(idx: usize) -> Symbol {
        Symbol(NonZeroU32::new(idx as u32).unwrap())
    }
}

impl Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sym#{}", self.0.get())
    }
}

/// The interner. Ids 1..=255 are pre-seeded with the one-byte names so that
/// `$X` shorthand lookups need no hashing, and lookups of already-interned
/// names go through `HashMap::get` with a borrowed `&[u8]` key, so they never
/// allocate.
pub struct Symtab {
    symbols: Vec<Bytes>,
    map: HashMap<Bytes, Symbol>,
}

impl Symtab {
    /// Filename of locations that have none; interned first in `new`.
    pub const UNKNOWN_FILE: Symbol = Symbol(NonZeroU32::new(256).unwrap());

    pub fn new() -> Self {
        let mut symtab = Self {
            // Id 0 is never handed out.
            symbols: vec![Bytes::new()],
            map: HashMap::new(),
        };
        for i in 1u8..=255 {
            assert!(symtab.symbols.len() == i as usize);
            let name = Bytes::from(vec![i]);
            let sym = Symbol(NonZeroU32::new(i.into()).unwrap());
            symtab.symbols.push(name.clone());
            symtab.map.insert(name, sym);
        }
        let unknown = symtab.intern("<unknown>");
        assert!(unknown == Self::UNKNOWN_FILE);
        symtab
    }

    pub fn intern<T: Into<Bytes> + AsRef<[u8]>>(&mut self, s: T) -> Symbol {
        if let [c] = s.as_ref() {
            return Symbol(NonZeroU32::new(*c as u32).unwrap());
        }
        if let Some(sym) = self.map.get(s.as_ref()) {
            return *sym;
        }
        let s = s.into();
        let sym = Symbol::from_usize(self.symbols.len());
        self.symbols.push(s.clone());
        self.map.insert(s, sym);
        sym
    }

    /// The interned text. The returned `Bytes` shares the interner's buffer.
    pub fn resolve(&self, sym: Symbol) -> Bytes {
        self.symbols[sym.as_usize()].clone()
    }

    pub fn display(&self, sym: Symbol) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.symbols[sym.as_usize()])
    }

    pub fn count(&self) -> usize {
        self.symbols.len()
    }

    /// All symbols interned so far, excluding the reserved id 0.
    pub fn iter(&self) -> impl Iterator<Item = (Symbol, &Bytes)> {
        self.symbols
            .iter()
            .enumerate()
            .skip(1)
            .map(|(idx, s)| (Symbol::from_usize(idx), s))
    }
}

impl Default for Symtab {
    fn default() -> Self {
        Self::new()
    }
}

pub fn join_symbols(symtab: &Symtab, symbols: &[Symbol], sep: &[u8]) -> Bytes {
    let mut r = BytesMut::new();
    let mut first = true;
    for s in symbols {
        if !first {
            r.put_slice(sep);
        } else {
            first = false;
        }
        r.put_slice(&symtab.resolve(*s));
    }
    r.freeze()
}

/// A compact set of symbols, backed by a bitmap covering only the id window
/// `[low*64, (low+words)*64)` actually touched. Android-scale runs intern
/// millions of symbols but put only tens of thousands into any one set, so
/// the window keeps sparse sets cheap.
#[derive(Clone, Default, Debug)]
pub struct SymbolSet {
    low: usize,
    bits: Vec<u64>,
}

impl SymbolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sym: Symbol) -> bool {
        let idx = sym.as_usize();
        let w = idx / 64;
        if self.bits.is_empty() {
            self.low = w;
            self.bits.push(0);
        } else if w < self.low {
            let grow = self.low - w;
            let mut bits = vec![0u64; grow + self.bits.len()];
            bits[grow..].copy_from_slice(&self.bits);
            self.bits = bits;
            self.low = w;
        } else if w >= self.low + self.bits.len() {
            self.bits.resize(w - self.low + 1, 0);
        }
        let word = &mut self.bits[w - self.low];
        let mask = 1u64 << (idx % 64);
        let newly = *word & mask == 0;
        *word |= mask;
        newly
    }

    pub fn remove(&mut self, sym: Symbol) {
        let idx = sym.as_usize();
        let w = idx / 64;
        if w < self.low || w >= self.low + self.bits.len() {
            return;
        }
        self.bits[w - self.low] &= !(1u64 << (idx % 64));
    }

    pub fn contains(&self, sym: Symbol) -> bool {
        let idx = sym.as_usize();
        let w = idx / 64;
        if w < self.low || w >= self.low + self.bits.len() {
            return false;
        }
        self.bits[w - self.low] & (1u64 << (idx % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.bits.iter().enumerate().flat_map(move |(wi, word)| {
            let base = (self.low + wi) * 64;
            (0..64).filter_map(move |bit| {
                if word & (1u64 << bit) != 0 {
                    Some(Symbol::from_usize(base + bit))
                } else {
                    None
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern() {
        let mut symtab = Symtab::new();
        let sym = symtab.intern("foo");
        let sym2 = symtab.intern("bar");
        let sym3 = symtab.intern("foo");
        assert_ne!(sym, sym2);
        assert_eq!(sym, sym3);
    }

    #[test]
    fn test_resolve() {
        let mut symtab = Symtab::new();
        let sym = symtab.intern("foo");
        assert_eq!(symtab.display(sym), "foo");
        assert_eq!(symtab.resolve(sym), Bytes::from_static(b"foo"));
    }

    #[test]
    fn test_single_byte_symbol() {
        let mut symtab = Symtab::new();
        let sym = symtab.intern("a");
        assert_eq!(sym.as_usize(), 'a' as usize);
        assert_eq!(symtab.display(sym), "a");
    }

    #[test]
    fn test_borrowed_lookup_is_stable() {
        let mut symtab = Symtab::new();
        let owned = symtab.intern(Bytes::from_static(b"stable"));
        let borrowed = symtab.intern(b"stable".as_slice());
        assert_eq!(owned, borrowed);
    }

    #[test]
    fn test_symbol_set() {
        let mut symtab = Symtab::new();
        let a = symtab.intern("aaa");
        let b = symtab.intern("bbb");
        let mut set = SymbolSet::new();
        assert!(!set.contains(a));
        assert!(set.insert(a));
        assert!(!set.insert(a));
        assert!(set.contains(a));
        assert!(!set.contains(b));
        set.remove(a);
        assert!(!set.contains(a));
        assert!(set.is_empty());
    }

    #[test]
    fn test_symbol_set_window() {
        let mut set = SymbolSet::new();
        // First insert fixes the window; inserts on both sides must grow it.
        set.insert(Symbol::from_usize(1000));
        set.insert(Symbol::from_usize(10));
        set.insert(Symbol::from_usize(100_000));
        assert!(set.contains(Symbol::from_usize(1000)));
        assert!(set.contains(Symbol::from_usize(10)));
        assert!(set.contains(Symbol::from_usize(100_000)));
        assert!(!set.contains(Symbol::from_usize(999)));
        assert_eq!(set.len(), 3);
        assert_eq!(
            set.iter().map(|s| s.as_usize()).collect::<Vec<_>>(),
            vec![10, 1000, 100_000]
        );
    }
}
