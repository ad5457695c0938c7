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
use memchr::{memchr, memchr2, memmem, memrchr};
use std::{env::current_dir, os::unix::ffi::OsStrExt};

pub fn is_space_byte(c: &u8) -> bool {
    matches!(*c, b'\t'..=b'\r' | b' ')
}

/// Iterates the whitespace-separated words of a byte string.
pub struct WordScanner<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for WordScanner<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let mut start = 0;
        while start < self.rest.len() && is_space_byte(&self.rest[start]) {
            start += 1;
        }
        if start == self.rest.len() {
            self.rest = &[];
            return None;
        }
        let mut end = start;
        while end < self.rest.len() && !is_space_byte(&self.rest[end]) {
            end += 1;
        }
        let word = &self.rest[start..end];
        self.rest = &self.rest[end..];
        Some(word)
    }
}

pub fn word_scanner(s: &[u8]) -> WordScanner<'_> {
    WordScanner { rest: s }
}

/// Writes space-separated words without a trailing separator.
pub struct WordWriter<'a> {
    pub out: &'a mut dyn BufMut,
    first: bool,
}

impl<'a> WordWriter<'a> {
    pub fn new(out: &'a mut dyn BufMut) -> WordWriter<'a> {
        WordWriter { out, first: true }
    }

    pub fn maybe_add_separator(&mut self, sep: &[u8]) {
        if self.first {
            self.first = false;
        } else {
            self.out.put_slice(sep);
        }
    }

    pub fn maybe_add_space(&mut self) {
        self.maybe_add_separator(b" ");
    }

    pub fn write(&mut self, word: &[u8]) {
        self.maybe_add_space();
        self.out.put_slice(word);
    }
}

pub fn has_path_prefix(s: &[u8], prefix: &[u8]) -> bool {
    match s.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest[0] == b'/',
        None => false,
    }
}

/// Whether `w` appears in `s` delimited by whitespace (or the ends).
pub fn has_word(s: &[u8], w: &[u8]) -> bool {
    for found in memmem::find_iter(s, w) {
        let before_ok = found == 0 || is_space_byte(&s[found - 1]);
        let after = found + w.len();
        let after_ok = after == s.len() || is_space_byte(&s[after]);
        if before_ok && after_ok {
            return true;
        }
    }
    false
}

pub fn trim_prefix_str<'a>(s: &'a str, prefix: &str) -> &'a str {
    s.strip_prefix(prefix).unwrap_or(s)
}

pub fn trim_suffix<'a>(s: &'a [u8], suffix: &[u8]) -> &'a [u8] {
    s.strip_suffix(suffix).unwrap_or(s)
}

/// The `%`-pattern language of rules, `patsubst`, `filter` and substitution
/// references. The text is split at its first `%` once, up front.
#[derive(Debug)]
pub struct Pattern {
    text: Bytes,
    // Byte offset of the '%', when there is one.
    split: Option<usize>,
}

impl Pattern {
    pub fn new(text: Bytes) -> Pattern {
        let split = memchr(b'%', &text);
        Pattern { text, split }
    }

    fn halves(&self, at: usize) -> (&[u8], &[u8]) {
        (&self.text[..at], &self.text[at + 1..])
    }

    pub fn matches(&self, word: &[u8]) -> bool {
        match self.split {
            None => self.text == word,
            Some(at) => {
                let (prefix, suffix) = self.halves(at);
                // The length check keeps prefix and suffix from overlapping
                // inside word.
                word.len() >= prefix.len() + suffix.len()
                    && word.starts_with(prefix)
                    && word.ends_with(suffix)
            }
        }
    }

    /// The substring matched by `%`, or empty on a non-match.
    pub fn stem<'a>(&self, word: &'a [u8]) -> &'a [u8] {
        match self.split {
            Some(at) if self.matches(word) => {
                let (prefix, suffix) = self.halves(at);
                &word[prefix.len()..word.len() - suffix.len()]
            }
            _ => b"",
        }
    }

    /// `patsubst` semantics: on a match, `%` in `repl` is replaced by the
    /// stem; a non-matching word passes through unchanged.
    pub fn append_subst(&self, word: &Bytes, repl: &Bytes) -> Bytes {
        let Some(at) = self.split else {
            return if *word == self.text {
                repl.clone()
            } else {
                word.clone()
            };
        };
        if !self.matches(word) {
            return word.clone();
        }
        let Some(repl_at) = memchr(b'%', repl) else {
            return repl.clone();
        };
        let (prefix, suffix) = self.halves(at);
        let stem = &word[prefix.len()..word.len() - suffix.len()];
        let mut buf = BytesMut::with_capacity(repl.len() + stem.len());
        buf.put_slice(&repl[..repl_at]);
        buf.put_slice(stem);
        buf.put_slice(&repl[repl_at + 1..]);
        buf.freeze()
    }

    /// `$(X:pat=repl)` semantics: when either side lacks a `%`, the pattern
    /// is a plain suffix to trim, and `repl` is always appended.
    pub fn append_subst_ref(&self, word: &Bytes, repl: &Bytes) -> Bytes {
        if self.split.is_some() && repl.contains(&b'%') {
            return self.append_subst(word, repl);
        }
        let base = word.strip_suffix(self.text.as_ref()).unwrap_or(word);
        let mut buf = BytesMut::with_capacity(base.len() + repl.len());
        buf.put_slice(base);
        buf.put_slice(repl);
        buf.freeze()
    }
}

pub fn trim_left_space(mut s: &[u8]) -> &[u8] {
    loop {
        match s {
            [c, rest @ ..] if is_space_byte(c) => s = rest,
            // An escaped newline reads as whitespace.
            [b'\\', b'\r' | b'\n', rest @ ..] => s = rest,
            _ => return s,
        }
    }
}

pub fn trim_right_space(mut s: &[u8]) -> &[u8] {
    loop {
        match s {
            [rest @ .., b'\t' | b'\x0b' | b'\x0c' | b' '] => s = rest,
            [rest @ .., b'\r' | b'\n'] => s = rest.strip_suffix(b"\\").unwrap_or(rest),
            _ => return s,
        }
    }
}

pub fn trim_space(s: &[u8]) -> &[u8] {
    trim_right_space(trim_left_space(s))
}

pub fn dirname(s: &Bytes) -> Bytes {
    match memrchr(b'/', s) {
        None => Bytes::from_static(b"."),
        Some(0) => Bytes::new(),
        Some(slash) => s.slice(..slash),
    }
}

pub fn basename(s: &[u8]) -> &[u8] {
    match memrchr(b'/', s) {
        None | Some(0) => s,
        Some(slash) => &s[slash + 1..],
    }
}

pub fn get_ext(s: &[u8]) -> Option<&[u8]> {
    memrchr(b'.', s).map(|dot| &s[dot..])
}

pub fn strip_ext(s: &[u8]) -> &[u8] {
    match (memrchr(b'.', s), memrchr(b'/', s)) {
        // A dot inside the directory part is not an extension.
        (Some(dot), Some(slash)) if dot < slash => s,
        (Some(dot), _) => &s[..dot],
        (None, _) => s,
    }
}

/// Collapses `.`, `..` and repeated slashes, keeping unresolvable leading
/// `..` components.
pub fn normalize_path(path: &[u8]) -> Bytes {
    if path.is_empty() {
        return Bytes::new();
    }
    let absolute = path[0] == b'/';
    let mut parts: Vec<&[u8]> = Vec::new();
    for part in path.split(|c| *c == b'/') {
        match part {
            b"" | b"." => {}
            b".." => match parts.last() {
                Some(last) if *last != b".." => {
                    parts.pop();
                }
                // `/..` at the root is just the root.
                _ if absolute => {}
                _ => parts.push(b".."),
            },
            _ => parts.push(part),
        }
    }

    let mut buf = BytesMut::with_capacity(path.len());
    if absolute {
        buf.put_u8(b'/');
    }
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b'/');
        }
        buf.put_slice(part);
    }
    buf.freeze()
}

pub fn abs_path(s: &[u8]) -> Result<Bytes> {
    if s.starts_with(b"/") {
        return Ok(normalize_path(s));
    }
    let mut joined = BytesMut::from(current_dir()?.as_os_str().as_bytes());
    if !s.is_empty() {
        joined.put_u8(b'/');
        joined.put_slice(s);
    }
    Ok(normalize_path(&joined))
}

/// Finds the first byte of `wanted` that is not escaped and not nested
/// inside `()` or `{}`.
pub fn find_outside_paren(s: &[u8], wanted: &[u8]) -> Option<usize> {
    let mut nesting: Vec<u8> = Vec::new();
    let mut escaped = false;
    for (i, &c) in s.iter().enumerate() {
        if !escaped && nesting.is_empty() && wanted.contains(&c) {
            return Some(i);
        }
        match c {
            b'(' => nesting.push(b')'),
            b'{' => nesting.push(b'}'),
            b')' | b'}' if nesting.last() == Some(&c) => {
                nesting.pop();
            }
            _ => {}
        }
        escaped = c == b'\\' && !escaped;
    }
    None
}

#[derive(Debug, PartialEq, Eq)]
pub struct EndOfLine {
    pub line: Bytes,
    pub rest: Bytes,
    pub lf_cnt: i32,
}

/// Finds the end of a logical makefile line, honoring `\`-continuations.
pub fn find_end_of_line(buf: &Bytes) -> EndOfLine {
    let mut continuations = 0;
    let mut i = 0;
    while i < buf.len() {
        let Some(step) = memchr2(b'\n', b'\\', &buf[i..]) else {
            i = buf.len();
            break;
        };
        i += step;
        if buf[i] == b'\n' {
            return EndOfLine {
                line: buf.slice(..i),
                rest: buf.slice(i + 1..),
                lf_cnt: continuations + 1,
            };
        }
        let tail = &buf[i..];
        if tail.starts_with(b"\\\n") {
            i += 2;
            continuations += 1;
        } else if tail.starts_with(b"\\\r\n") {
            i += 3;
            continuations += 1;
        } else if tail.starts_with(b"\\\\") {
            i += 2;
        } else {
            i += 1;
        }
    }
    EndOfLine {
        line: buf.slice(..i),
        rest: buf.slice(i..),
        lf_cnt: continuations,
    }
}

pub fn trim_leading_curdir(mut s: &[u8]) -> &[u8] {
    while let Some(rest) = s.strip_prefix(b"./") {
        s = rest;
    }
    s
}

/// `$(shell)` output post-processing: strip trailing newlines, then turn the
/// remaining newlines into spaces.
pub fn format_for_command_substitution(mut s: Vec<u8>) -> Vec<u8> {
    while s.last() == Some(&b'\n') {
        s.pop();
    }
    for c in s.iter_mut() {
        if *c == b'\n' {
            *c = b' ';
        }
    }
    s
}

pub fn concat_dir(dir: &[u8], name: &[u8]) -> Bytes {
    if dir.is_empty() || name.starts_with(b"/") {
        return normalize_path(name);
    }
    let mut joined = BytesMut::with_capacity(dir.len() + name.len() + 1);
    joined.put_slice(dir);
    joined.put_u8(b'/');
    joined.put_slice(name);
    normalize_path(&joined)
}

/// Escapes text for `echo -e "..."` in a generated command.
pub fn echo_escape(s: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(s.len());
    for &c in s {
        match c {
            b'\\' => buf.put_slice(br"\\\\"),
            b'\n' => buf.put_slice(br"\n"),
            b'"' => buf.put_slice(b"\\\""),
            _ => buf.put_u8(c),
        }
    }
    buf.freeze()
}

fn is_shell_delimiter(c: u8) -> bool {
    matches!(c, b'"' | b'$' | b'\\' | b'`')
}

/// Escapes a command for interpolation into a double-quoted shell string.
/// `$$` collapses to an escaped single `$`.
pub fn escape_shell(s: &Bytes) -> Bytes {
    if !s.iter().any(|c| is_shell_delimiter(*c)) {
        return s.clone();
    }
    let mut buf = BytesMut::with_capacity(s.len() + 8);
    let mut i = 0;
    while i < s.len() {
        let c = s[i];
        if is_shell_delimiter(c) {
            buf.put_u8(b'\\');
            if c == b'$' && s.get(i + 1) == Some(&b'$') {
                buf.put_u8(b'$');
                i += 1;
            }
        }
        buf.put_u8(c);
        i += 1;
    }
    buf.freeze()
}

pub fn is_integer(s: &[u8]) -> bool {
    !s.is_empty() && s.iter().all(u8::is_ascii_digit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_scanner() {
        let words = word_scanner(b"foo bar\tbaz").collect::<Vec<&[u8]>>();
        assert_eq!(words, vec![b"foo".as_slice(), b"bar".as_slice(), b"baz".as_slice()]);
        assert!(word_scanner(b"").next().is_none());
        assert!(word_scanner(b"  \t ").next().is_none());
        assert_eq!(word_scanner(b" a  b").collect::<Vec<&[u8]>>(), vec![b"a", b"b"]);
    }

    #[test]
    fn test_has_path_prefix() {
        assert!(has_path_prefix(b"/foo/bar", b"/foo"));
        assert!(has_path_prefix(b"/foo", b"/foo"));
        assert!(!has_path_prefix(b"/foobar/baz", b"/foo"));
    }

    #[test]
    fn test_has_word() {
        assert!(has_word(b"foo bar baz", b"bar"));
        assert!(has_word(b"foo bar baz", b"foo"));
        assert!(has_word(b"foo bar baz", b"baz"));
        assert!(!has_word(b"foo bar baz", b"oo"));
        assert!(!has_word(b"foo bar baz", b"ba"));
        // Later occurrences still count.
        assert!(has_word(b"xfind find", b"find"));
    }

    #[test]
    fn test_pattern_matches() {
        assert!(Pattern::new(Bytes::from_static(b"foo")).matches(b"foo"));
        assert!(Pattern::new(Bytes::from_static(b"foo%")).matches(b"foo"));
        assert!(Pattern::new(Bytes::from_static(b"foo%bar")).matches(b"foobar"));
        assert!(Pattern::new(Bytes::from_static(b"foo%bar")).matches(b"fooxbar"));
        // Prefix and suffix may not overlap.
        assert!(!Pattern::new(Bytes::from_static(b"a%a")).matches(b"a"));
    }

    #[test]
    fn test_pattern_stem() {
        let pat = Pattern::new(Bytes::from_static(b"%.c"));
        assert_eq!(pat.stem(b"foo.c"), b"foo");
        assert_eq!(pat.stem(b"foo.o"), b"");
        assert_eq!(Pattern::new(Bytes::from_static(b"a%z")).stem(b"abcz"), b"bc");
    }

    fn subst_pattern(s: &'static [u8], pat: &'static [u8], repl: &'static [u8]) -> String {
        let p = Pattern::new(Bytes::from_static(pat));
        let out = p.append_subst(&Bytes::from_static(s), &Bytes::from_static(repl));
        String::from_utf8(out.to_vec()).unwrap()
    }

    #[test]
    fn test_subst_pattern() {
        assert_eq!(subst_pattern(b"x.c", b"%.c", b"%.o"), "x.o");
        assert_eq!(subst_pattern(b"c.x", b"c.%", b"o.%"), "o.x");
        assert_eq!(subst_pattern(b"x.c.c", b"%.c", b"%.o"), "x.c.o");
        assert_eq!(subst_pattern(b"x.%.c", b"%.%.c", b"OK"), "OK");
        assert_eq!(subst_pattern(b"x.c", b"x.c", b"OK"), "OK");
        assert_eq!(subst_pattern(b"x.c.c", b"x.c", b"XX"), "x.c.c");
        assert_eq!(subst_pattern(b"x.x.c", b"x.c", b"XX"), "x.x.c");
        assert_eq!(subst_pattern(b"/", b"%/", b"%"), "");
    }

    #[test]
    fn test_subst_ref() {
        let p = Pattern::new(Bytes::from_static(b".c"));
        // No '%' on either side: trim the suffix, always append.
        assert_eq!(
            p.append_subst_ref(&Bytes::from_static(b"x.c"), &Bytes::from_static(b".o")),
            Bytes::from_static(b"x.o")
        );
        assert_eq!(
            p.append_subst_ref(&Bytes::from_static(b"x.h"), &Bytes::from_static(b".o")),
            Bytes::from_static(b"x.h.o")
        );
    }

    #[test]
    fn test_trims() {
        assert_eq!(trim_left_space(b" \tfoo"), b"foo");
        assert_eq!(trim_left_space(b" \\\n bar"), b"bar");
        assert_eq!(trim_left_space(b" \\a bar"), b"\\a bar");
        assert_eq!(trim_right_space(b"foo \t"), b"foo");
        assert_eq!(trim_right_space(b"foo\\\n"), b"foo");
        assert_eq!(trim_space(b"  x  "), b"x");
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(dirname(&Bytes::from_static(b"a/b/c")), "a/b");
        assert_eq!(dirname(&Bytes::from_static(b"c")), ".");
        assert_eq!(basename(b"a/b/c"), b"c");
        assert_eq!(basename(b"c"), b"c");
        assert_eq!(get_ext(b"a.c"), Some(b".c".as_slice()));
        assert_eq!(get_ext(b"abc"), None);
        assert_eq!(strip_ext(b"a.c"), b"a");
        assert_eq!(strip_ext(b"a.b/c"), b"a.b/c");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(b""), "");
        assert_eq!(normalize_path(b"."), "");
        assert_eq!(normalize_path(b"/"), "/");
        assert_eq!(normalize_path(b"/tmp"), "/tmp");
        assert_eq!(normalize_path(b"////tmp////"), "/tmp");
        assert_eq!(normalize_path(b"a////b"), "a/b");
        assert_eq!(normalize_path(b"a//.//b"), "a/b");
        assert_eq!(normalize_path(b"a////b//../c/////"), "a/c");
        assert_eq!(normalize_path(b"../foo"), "../foo");
        assert_eq!(normalize_path(b"./foo"), "foo");
        assert_eq!(normalize_path(b"x/y/..//../foo"), "foo");
        assert_eq!(normalize_path(b"x/../../foo"), "../foo");
        assert_eq!(normalize_path(b"/../foo"), "/foo");
        assert_eq!(normalize_path(b"/a/.."), "/");
        assert_eq!(normalize_path(b"../../a/b"), "../../a/b");
        assert_eq!(normalize_path(b".././../a/b"), "../../a/b");
    }

    #[test]
    fn test_find_end_of_line() {
        assert_eq!(
            find_end_of_line(&Bytes::from_static(b"foo")),
            EndOfLine {
                line: Bytes::from_static(b"foo"),
                rest: Bytes::from_static(b""),
                lf_cnt: 0
            }
        );
        assert_eq!(
            find_end_of_line(&Bytes::from_static(b"foo\nbar")),
            EndOfLine {
                line: Bytes::from_static(b"foo"),
                rest: Bytes::from_static(b"bar"),
                lf_cnt: 1
            }
        );
        assert_eq!(
            find_end_of_line(&Bytes::from_static(b"foo\\\nbar\nbaz")),
            EndOfLine {
                line: Bytes::from_static(b"foo\\\nbar"),
                rest: Bytes::from_static(b"baz"),
                lf_cnt: 2
            }
        );
        assert_eq!(
            find_end_of_line(&Bytes::from_static(b"a\\")),
            EndOfLine {
                line: Bytes::from_static(b"a\\"),
                rest: Bytes::from_static(b""),
                lf_cnt: 0
            }
        );
    }

    #[test]
    fn test_format_for_command_substitution() {
        assert_eq!(format_for_command_substitution(b"a\nb\n".to_vec()), b"a b");
        assert_eq!(format_for_command_substitution(b"a\n\n".to_vec()), b"a");
    }

    #[test]
    fn test_escape_shell() {
        assert_eq!(escape_shell(&Bytes::from_static(b"plain")), "plain");
        assert_eq!(escape_shell(&Bytes::from_static(b"a\"b")), "a\\\"b");
        assert_eq!(escape_shell(&Bytes::from_static(b"a$$b")), "a\\$$b");
    }

    #[test]
    fn test_is_integer() {
        assert!(is_integer(b"0"));
        assert!(is_integer(b"1234"));
        assert!(!is_integer(b""));
        assert!(!is_integer(b"a234"));
        assert!(!is_integer(b"123a"));
    }

    #[test]
    fn test_find_outside_paren() {
        assert_eq!(find_outside_paren(b"abc", b"b"), Some(1));
        assert_eq!(find_outside_paren(b"abc", b"d"), None);
        assert_eq!(find_outside_paren(b"a(b:c)d", b":"), None);
        assert_eq!(find_outside_paren(b"a{b:c}d", b":"), None);
        assert_eq!(find_outside_paren(b"a(b)c:d", b":"), Some(5));
        assert_eq!(find_outside_paren(b"a((b:c))d", b":"), None);
        assert_eq!(find_outside_paren(b"a\\:b:c", b":"), Some(4));
        assert_eq!(find_outside_paren(b"a=b:c", b":="), Some(1));
    }
}
