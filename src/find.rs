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

//! An in-process model of the `find` invocations build files run through
//! `$(shell)`. Walking an in-memory directory tree is orders of magnitude
//! cheaper than forking `find` for each of the tens of thousands of queries
//! an Android-scale parse performs. Anything outside the supported command
//! shapes reports "not handled" and falls back to a real shell.

use std::{
    collections::{HashMap, HashSet},
    ffi::{CString, OsStr},
    os::unix::ffi::OsStrExt,
    path::PathBuf,
};

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use libc::FNM_PERIOD;
use memchr::memchr3;
use parking_lot::Mutex;

use crate::{
    context::Context,
    error,
    fileutil::fnmatch,
    flags::Flags,
    loc::Loc,
    log, render_warn,
    strutil::{basename, concat_dir, has_word, is_space_byte, normalize_path, trim_left_space},
    warn,
};

fn find_warn_loc(ctx: &Context, loc: &Loc, msg: String) -> Result<()> {
    if ctx.flags.werror_find_emulator {
        Err(crate::render_error(ctx, Some(loc), msg))
    } else {
        render_warn(ctx, Some(loc), msg);
        Ok(())
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum FindKind {
    Find,
    FindLeaves,
}

/// File classification, matching `find -type` letters.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
enum FindType {
    BlockDev,
    CharDev,
    Dir,
    Fifo,
    Symlink,
    Regular,
    Socket,
}

fn classify(ft: std::fs::FileType) -> Option<FindType> {
    use std::os::unix::fs::FileTypeExt;
    if ft.is_file() {
        Some(FindType::Regular)
    } else if ft.is_dir() {
        Some(FindType::Dir)
    } else if ft.is_symlink() {
        Some(FindType::Symlink)
    } else if ft.is_fifo() {
        Some(FindType::Fifo)
    } else if ft.is_socket() {
        Some(FindType::Socket)
    } else if ft.is_char_device() {
        Some(FindType::CharDev)
    } else if ft.is_block_device() {
        Some(FindType::BlockDev)
    } else {
        None
    }
}

fn type_for_letter(tok: &[u8]) -> Option<FindType> {
    Some(match tok {
        b"b" => FindType::BlockDev,
        b"c" => FindType::CharDev,
        b"d" => FindType::Dir,
        b"p" => FindType::Fifo,
        b"l" => FindType::Symlink,
        b"f" => FindType::Regular,
        b"s" => FindType::Socket,
        _ => return None,
    })
}

/// The `-name`/`-type`/`-not`/`-and`/`-or` predicate tree.
#[derive(PartialEq, Eq, Debug)]
enum FindCond {
    Name { pat: CString, wildcard: bool },
    Typ(FindType),
    Not(Box<FindCond>),
    And(Box<FindCond>, Box<FindCond>),
    Or(Box<FindCond>, Box<FindCond>),
}

fn or_with(existing: Option<FindCond>, add: FindCond) -> FindCond {
    match existing {
        Some(prev) => FindCond::Or(Box::new(prev), Box::new(add)),
        None => add,
    }
}

impl FindCond {
    fn name(pat: &[u8]) -> Result<FindCond> {
        Ok(FindCond::Name {
            pat: CString::new(pat)?,
            wildcard: memchr3(b'?', b'*', b'[', pat).is_some(),
        })
    }

    fn matches(&self, path: &[u8], t: FindType) -> bool {
        match self {
            FindCond::Name { pat, .. } => fnmatch(pat, basename(path), 0),
            FindCond::Typ(want) => t == *want,
            FindCond::Not(inner) => !inner.matches(path, t),
            FindCond::And(a, b) => a.matches(path, t) && b.matches(path, t),
            FindCond::Or(a, b) => a.matches(path, t) || b.matches(path, t),
        }
    }

    // A condition whose match count in one directory is knowable up front:
    // a disjunction of exact names.
    fn countable(&self) -> bool {
        match self {
            FindCond::Name { wildcard, .. } => !wildcard,
            FindCond::Or(a, b) => a.countable() && b.countable(),
            _ => false,
        }
    }

    fn count(&self) -> usize {
        match self {
            FindCond::Name { .. } => 1,
            FindCond::Or(a, b) => a.count() + b.count(),
            _ => 0,
        }
    }
}

/// A parsed `find`/`findleaves.py` invocation.
#[derive(Debug)]
pub struct FindCommand {
    kind: Option<FindKind>,
    pub chdir: Option<Bytes>,
    testdir: Option<Bytes>,
    pub finddirs: Vec<Bytes>,
    follows_symlinks: bool,
    print_cond: Option<FindCond>,
    prune_cond: Option<FindCond>,
    depth: i32,
    mindepth: i32,
    redirect_to_devnull: bool,

    /// Files whose continued presence (rather than their directory) an
    /// external regeneration checker should watch.
    pub found_files: Mutex<Vec<Bytes>>,
    /// Every directory read while answering; consumed by regeneration
    /// machinery.
    pub read_dirs: Mutex<HashSet<Bytes>>,
}

impl Default for FindCommand {
    fn default() -> Self {
        Self {
            kind: None,
            chdir: None,
            testdir: None,
            finddirs: Vec::new(),
            follows_symlinks: false,
            print_cond: None,
            prune_cond: None,
            depth: i32::MAX,
            mindepth: i32::MIN,
            redirect_to_devnull: false,

            found_files: Mutex::new(Vec::new()),
            read_dirs: Mutex::new(HashSet::new()),
        }
    }
}

impl PartialEq for FindCommand {
    fn eq(&self, other: &Self) -> bool {
        // found_files/read_dirs are result tracking, not identity.
        self.kind == other.kind
            && self.chdir == other.chdir
            && self.testdir == other.testdir
            && self.finddirs == other.finddirs
            && self.follows_symlinks == other.follows_symlinks
            && self.print_cond == other.print_cond
            && self.prune_cond == other.prune_cond
            && self.depth == other.depth
            && self.mindepth == other.mindepth
            && self.redirect_to_devnull == other.redirect_to_devnull
    }
}

// ---------------------------------------------------------------------------
// Command parsing

/// Splits a shell command into words the way the supported grammar needs:
/// `;` and `&&` are their own tokens, fully-quoted words lose their quotes,
/// a leading backslash escapes one character. Anything trickier (partial
/// quoting, inner escapes, a stray `&`) makes the whole command unsupported.
fn shell_words(cmd: &Bytes) -> Option<Vec<Bytes>> {
    let mut words = Vec::new();
    let mut rest = cmd.clone();
    loop {
        rest = rest.slice_ref(trim_left_space(&rest));
        if rest.is_empty() {
            return Some(words);
        }
        match rest[0] {
            b';' => {
                words.push(rest.slice(..1));
                rest.advance(1);
            }
            b'&' => {
                if !rest.starts_with(b"&&") {
                    return None;
                }
                words.push(rest.slice(..2));
                rest.advance(2);
            }
            _ => {
                let mut end = 1;
                while end < rest.len()
                    && !is_space_byte(&rest[end])
                    && rest[end] != b';'
                    && rest[end] != b'&'
                {
                    end += 1;
                }
                let mut word = rest.slice(..end);
                rest.advance(end);
                match word[0] {
                    q @ (b'\'' | b'"') => {
                        if word.len() < 2 || *word.last().unwrap() != q {
                            return None;
                        }
                        word = word.slice(1..word.len() - 1);
                    }
                    b'\\' => {
                        word.advance(1);
                        if word.is_empty() || word.contains(&b'\\') {
                            return None;
                        }
                    }
                    _ => {
                        if word.contains(&b'\\') {
                            return None;
                        }
                    }
                }
                words.push(word);
            }
        }
    }
}

struct Tokens {
    list: Vec<Bytes>,
    pos: usize,
}

impl Tokens {
    fn next(&mut self) -> Option<Bytes> {
        let tok = self.list.get(self.pos).cloned()?;
        self.pos += 1;
        Some(tok)
    }

    fn peek(&self) -> Option<&Bytes> {
        self.list.get(self.pos)
    }

    fn rewind(&mut self) {
        self.pos -= 1;
    }

    fn accept(&mut self, want: &[u8]) -> bool {
        if self.peek().map(|t| t.as_ref()) == Some(want) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn at_end(&self) -> bool {
        self.pos == self.list.len()
    }
}

fn is_cond_start(tok: &[u8]) -> bool {
    matches!(tok, b"-not" | b"!" | b"(" | b"-name" | b"-type")
}

// <expr> ::= <term> {('-or'|'-o') <term>}
// <term> ::= <fact> {['-and'|'-a'] <fact>}
// <fact> ::= ('-not'|'!') <fact> | '(' <expr> ')' | <pred>
// <pred> ::= '-name' NAME | '-type' TYPE
fn parse_or_chain(toks: &mut Tokens) -> Option<FindCond> {
    let mut cond = parse_and_chain(toks)?;
    while toks.peek().is_some_and(|t| t == "-or" || t == "-o") {
        toks.next();
        let rhs = parse_and_chain(toks)?;
        cond = FindCond::Or(Box::new(cond), Box::new(rhs));
    }
    Some(cond)
}

fn parse_and_chain(toks: &mut Tokens) -> Option<FindCond> {
    let mut cond = parse_unary(toks)?;
    loop {
        let Some(next) = toks.peek() else {
            return Some(cond);
        };
        if next == "-and" || next == "-a" {
            toks.next();
        } else if !is_cond_start(next) {
            return Some(cond);
        }
        let rhs = parse_unary(toks)?;
        cond = FindCond::And(Box::new(cond), Box::new(rhs));
    }
}

fn parse_unary(toks: &mut Tokens) -> Option<FindCond> {
    let tok = toks.next()?;
    match tok.as_ref() {
        b"-not" | b"!" => Some(FindCond::Not(Box::new(parse_unary(toks)?))),
        b"(" => {
            let inner = parse_or_chain(toks)?;
            if !toks.accept(b")") {
                return None;
            }
            Some(inner)
        }
        b"-name" => FindCond::name(&toks.next()?).ok(),
        b"-type" => type_for_letter(&toks.next()?).map(FindCond::Typ),
        _ => None,
    }
}

fn parse_find_args(toks: &mut Tokens, fc: &mut FindCommand) -> bool {
    fc.kind = Some(FindKind::Find);
    loop {
        let Some(tok) = toks.next() else {
            return true;
        };
        match tok.as_ref() {
            b";" => return true,
            b"-L" => fc.follows_symlinks = true,
            b"-prune" => {
                // Only `<cond> -prune -o <cond>` is modeled.
                if fc.print_cond.is_none() || fc.prune_cond.is_some() {
                    return false;
                }
                if !toks.accept(b"-o") {
                    return false;
                }
                fc.prune_cond = fc.print_cond.take();
            }
            b"-print" => return toks.at_end(),
            b"-maxdepth" => {
                let Some(depth) = toks.next() else {
                    return false;
                };
                let Ok(depth) = String::from_utf8_lossy(&depth).parse::<i32>() else {
                    return false;
                };
                if depth < 0 {
                    return false;
                }
                fc.depth = depth;
            }
            b"2>" => {
                if !toks.accept(b"/dev/null") {
                    return false;
                }
                fc.redirect_to_devnull = true;
            }
            cond if is_cond_start(cond) || cond.starts_with(b"-") => {
                if fc.print_cond.is_some() {
                    return false;
                }
                toks.rewind();
                let Some(cond) = parse_or_chain(toks) else {
                    return false;
                };
                fc.print_cond = Some(cond);
            }
            dir => {
                if dir
                    .iter()
                    .any(|c| matches!(c, b'|' | b';' | b'&' | b'>' | b'<' | b'\'' | b'"'))
                {
                    return false;
                }
                fc.finddirs.push(tok.clone());
            }
        }
    }
}

fn parse_findleaves_args(
    flags: &Flags,
    toks: &mut Tokens,
    fc: &mut FindCommand,
) -> Result<bool> {
    fc.kind = Some(FindKind::FindLeaves);
    fc.follows_symlinks = true;
    let mut files: Vec<Bytes> = Vec::new();
    while let Some(tok) = toks.next() {
        if let Some(prune) = tok.strip_prefix(b"--prune=") {
            let Ok(cond) = FindCond::name(prune) else {
                return Ok(false);
            };
            fc.prune_cond = Some(or_with(fc.prune_cond.take(), cond));
        } else if let Some(mindepth) = tok.strip_prefix(b"--mindepth=") {
            let Ok(mindepth) = String::from_utf8_lossy(mindepth).parse::<i32>() else {
                return Ok(false);
            };
            fc.mindepth = mindepth;
        } else if let Some(dir) = tok.strip_prefix(b"--dir=") {
            fc.finddirs.push(tok.slice_ref(dir));
        } else if tok.starts_with(b"--") {
            if flags.werror_find_emulator {
                error!(
                    "Unknown flag in findleaves.py: {}",
                    String::from_utf8_lossy(&tok)
                );
            }
            warn!(
                "Unknown flag in findleaves.py: {}",
                String::from_utf8_lossy(&tok)
            );
            return Ok(false);
        } else {
            files.push(tok);
        }
    }

    if fc.finddirs.is_empty() {
        // Old-style: dirs then one filename, all positional.
        if files.len() < 2 {
            return Ok(false);
        }
        let name = files.pop().unwrap();
        fc.finddirs = files;
        let Ok(cond) = FindCond::name(&name) else {
            return Ok(false);
        };
        fc.print_cond = Some(cond);
    } else {
        if files.is_empty() {
            return Ok(false);
        }
        for file in files {
            let Ok(cond) = FindCond::name(&file) else {
                return Ok(false);
            };
            fc.print_cond = Some(or_with(fc.print_cond.take(), cond));
        }
    }
    Ok(true)
}

// `-d DIR` inside `if [ ... ]` or `test ...`.
fn parse_testdir(toks: &mut Tokens, fc: &mut FindCommand) -> bool {
    if fc.testdir.is_some() {
        return false;
    }
    if !toks.accept(b"-d") {
        return false;
    }
    let Some(dir) = toks.next() else {
        return false;
    };
    if dir.is_empty() {
        return false;
    }
    fc.testdir = Some(dir);
    true
}

fn parse_script(flags: &Flags, toks: &mut Tokens, fc: &mut FindCommand) -> Result<bool> {
    let mut has_if = false;
    loop {
        let Some(tok) = toks.next() else {
            return Ok(true);
        };
        match tok.as_ref() {
            b"cd" => {
                let Some(dir) = toks.next() else {
                    return Ok(false);
                };
                if dir.is_empty()
                    || fc.chdir.is_some()
                    || memchr3(b'?', b'*', b'[', &dir).is_some()
                {
                    return Ok(false);
                }
                fc.chdir = Some(dir);
                if !toks.accept(b";") && !toks.accept(b"&&") {
                    return Ok(false);
                }
            }
            b"if" => {
                if has_if
                    || !toks.accept(b"[")
                    || !parse_testdir(toks, fc)
                    || !toks.accept(b"]")
                    || !toks.accept(b";")
                    || !toks.accept(b"then")
                {
                    return Ok(false);
                }
                has_if = true;
            }
            b"test" => {
                if fc.chdir.is_some() || !parse_testdir(toks, fc) || !toks.accept(b"&&") {
                    return Ok(false);
                }
            }
            b"find" => {
                if !parse_find_args(toks, fc) {
                    return Ok(false);
                }
                if has_if && !toks.accept(b"fi") {
                    return Ok(false);
                }
                return Ok(toks.at_end());
            }
            b"build/tools/findleaves.py" | b"build/make/tools/findleaves.py" => {
                return parse_findleaves_args(flags, toks, fc);
            }
            _ => return Ok(false),
        }
    }
}

/// Parses a shell command into a [`FindCommand`], or `None` when it is not
/// in the supported subset and a real shell has to run it.
pub fn parse(flags: &Flags, cmd: &Bytes) -> Result<Option<FindCommand>> {
    if !has_word(cmd, b"find")
        && !has_word(cmd, b"build/tools/findleaves.py")
        && !has_word(cmd, b"build/make/tools/findleaves.py")
    {
        return Ok(None);
    }

    let mut fc = FindCommand::default();
    let supported = match shell_words(cmd) {
        Some(words) => parse_script(flags, &mut Tokens { list: words, pos: 0 }, &mut fc)?,
        None => false,
    };
    if !supported {
        log!(
            "FindEmulator: Unsupported find command: {:?}",
            String::from_utf8_lossy(cmd)
        );
        return Ok(None);
    }

    if let Some(chdir) = &mut fc.chdir {
        *chdir = normalize_path(chdir);
    }
    if let Some(testdir) = &mut fc.testdir {
        *testdir = normalize_path(testdir);
    }
    if fc.finddirs.is_empty() {
        fc.finddirs.push(Bytes::from_static(b"."));
    }

    Ok(Some(fc))
}

// ---------------------------------------------------------------------------
// The directory tree

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct EntryId(u32);

const ROOT: EntryId = EntryId(0);

// Symlink chains longer than this read as broken, like ELOOP.
const MAX_LINK_HOPS: usize = 40;

/// One filesystem entry. Directories and symlinks load lazily: the first
/// query reads them, after which the entry never changes again.
struct FsEntry {
    name: Bytes,
    disk_path: PathBuf,
    parent: Option<EntryId>,
    state: EntryState,
}

enum EntryState {
    Leaf(FindType),
    DirUnread,
    Dir(Vec<EntryId>),
    LinkUnread,
    LinkTo(EntryId),
    /// Dangling: the target does not exist.
    LinkMissing,
    /// readlink/stat failed, or the target is outside the tree.
    LinkFailed(String),
    /// Absolute target; the whole command falls back to a real shell.
    LinkUnsupported,
}

enum LinkView {
    Target(EntryId),
    Missing,
    Failed(String),
    Unsupported,
}

/// Per-query walk state, bundled so the recursion carries one handle.
struct Walk<'a> {
    fc: &'a FindCommand,
    loc: &'a Loc,
    // Directories on the current descent path, for loop detection; keyed by
    // identity, valued with the path they were first entered through.
    visiting: HashMap<EntryId, Vec<u8>>,
    out: Vec<Vec<u8>>,
}

fn emit_if_matched(fc: &FindCommand, path: &[u8], t: FindType, depth: i32, out: &mut Vec<Vec<u8>>) {
    if depth < fc.mindepth {
        return;
    }
    if let Some(cond) = &fc.print_cond
        && !cond.matches(path, t)
    {
        return;
    }
    out.push(path.to_vec());
}

struct FsTree {
    entries: Vec<FsEntry>,
}

impl FsTree {
    fn new() -> FsTree {
        FsTree {
            entries: vec![FsEntry {
                name: Bytes::new(),
                disk_path: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
                parent: None,
                state: EntryState::DirUnread,
            }],
        }
    }

    fn entry(&self, id: EntryId) -> &FsEntry {
        &self.entries[id.0 as usize]
    }

    fn alloc(&mut self, entry: FsEntry) -> EntryId {
        let id = EntryId(self.entries.len() as u32);
        self.entries.push(entry);
        id
    }

    /// Children of a directory entry, reading it on first use.
    fn load_dir(&mut self, id: EntryId) -> Vec<EntryId> {
        match &self.entry(id).state {
            EntryState::Dir(kids) => return kids.clone(),
            EntryState::DirUnread => {}
            _ => return Vec::new(),
        }

        let dir_path = self.entry(id).disk_path.clone();
        let mut kids = Vec::new();
        match std::fs::read_dir(&dir_path) {
            Err(err) => warn!("opendir({:?}) failed: {:?}", dir_path, err),
            Ok(iter) => {
                for dirent in iter {
                    let dirent = match dirent {
                        Ok(dirent) => dirent,
                        Err(err) => {
                            warn!("readdir failed: {:?}", err);
                            continue;
                        }
                    };
                    let name = dirent.file_name();
                    if matches!(
                        name.as_bytes(),
                        b"." | b".." | b".repo" | b".git"
                    ) {
                        continue;
                    }
                    let Ok(ft) = dirent.file_type() else {
                        warn!("stat failed: {:?}", dirent.path());
                        continue;
                    };
                    let state = if ft.is_dir() {
                        EntryState::DirUnread
                    } else if ft.is_symlink() {
                        EntryState::LinkUnread
                    } else {
                        match classify(ft) {
                            Some(t) => EntryState::Leaf(t),
                            None => continue,
                        }
                    };
                    let child = self.alloc(FsEntry {
                        name: Bytes::from(name.as_bytes().to_vec()),
                        disk_path: dirent.path(),
                        parent: Some(id),
                        state,
                    });
                    kids.push(child);
                }
            }
        }
        self.entries[id.0 as usize].state = EntryState::Dir(kids.clone());
        kids
    }

    /// Resolves a symlink entry once; loops read as failures.
    fn link_view(&mut self, id: EntryId) -> LinkView {
        match &self.entry(id).state {
            EntryState::LinkTo(target) => return LinkView::Target(*target),
            EntryState::LinkMissing => return LinkView::Missing,
            EntryState::LinkFailed(msg) => return LinkView::Failed(msg.clone()),
            EntryState::LinkUnsupported => return LinkView::Unsupported,
            EntryState::LinkUnread => {}
            _ => panic!("link_view on a non-link entry"),
        }
        // Re-entry during resolution means a symlink loop.
        self.entries[id.0 as usize].state =
            EntryState::LinkFailed("symlink loop".to_string());
        let state = self.resolve_link(id);
        self.entries[id.0 as usize].state = state;
        self.link_view(id)
    }

    fn resolve_link(&mut self, id: EntryId) -> EntryState {
        let link_path = self.entry(id).disk_path.clone();
        let dest = match std::fs::read_link(&link_path) {
            Err(err) => {
                warn!("readlink failed: {:?}", err);
                return if err.kind() == std::io::ErrorKind::NotFound {
                    EntryState::LinkMissing
                } else {
                    EntryState::LinkFailed(err.to_string())
                };
            }
            Ok(dest) => dest,
        };
        if let Err(err) = std::fs::metadata(&link_path) {
            log!("stat failed: {:?}: {:?}", link_path, err);
            return if err.kind() == std::io::ErrorKind::NotFound {
                EntryState::LinkMissing
            } else {
                EntryState::LinkFailed(err.to_string())
            };
        }
        if dest.is_absolute() {
            return EntryState::LinkUnsupported;
        }
        let parent = self.entry(id).parent.expect("links always have a parent");
        match self.locate(parent, dest.as_os_str().as_bytes()) {
            Some(target) => EntryState::LinkTo(target),
            None => EntryState::LinkFailed("unresolvable symlink target".to_string()),
        }
    }

    /// Follows symlink chains until a directory entry, for path traversal.
    /// The hop budget turns link cycles into lookup failures.
    fn as_dir(&mut self, mut id: EntryId) -> Option<EntryId> {
        for _ in 0..MAX_LINK_HOPS {
            match &self.entry(id).state {
                EntryState::Dir(_) | EntryState::DirUnread => return Some(id),
                EntryState::Leaf(_) => return None,
                _ => match self.link_view(id) {
                    LinkView::Target(target) => id = target,
                    _ => return None,
                },
            }
        }
        None
    }

    fn is_dir_like(&mut self, mut id: EntryId) -> bool {
        for _ in 0..MAX_LINK_HOPS {
            match &self.entry(id).state {
                EntryState::Dir(_) | EntryState::DirUnread => return true,
                EntryState::Leaf(_) => return false,
                _ => match self.link_view(id) {
                    LinkView::Target(target) => id = target,
                    _ => return false,
                },
            }
        }
        false
    }

    /// Walks a slash-separated path from `from`. Intermediate components
    /// traverse directories (through symlinks); the final component is
    /// returned as-is.
    fn locate(&mut self, from: EntryId, path: &[u8]) -> Option<EntryId> {
        let mut cur = from;
        let parts: Vec<&[u8]> = path.split(|c| *c == b'/').collect();
        for (idx, part) in parts.iter().enumerate() {
            let last = idx + 1 == parts.len();
            cur = self.as_dir(cur)?;
            match *part {
                b"" | b"." => {}
                b".." => cur = self.entry(cur).parent?,
                name => {
                    let kids = self.load_dir(cur);
                    let child = kids
                        .into_iter()
                        .find(|kid| self.entry(*kid).name.as_ref() == name)?;
                    if last {
                        return Some(child);
                    }
                    cur = child;
                }
            }
        }
        Some(cur)
    }

    /// Expands one `finddirs` element (which may contain wildcards) into
    /// `(path text, entry)` starting points. Returns false when the walk
    /// leaves the modeled tree and the command must fall back.
    fn expand_roots(
        &mut self,
        fc: &FindCommand,
        id: EntryId,
        spec: &[u8],
        path: &mut Vec<u8>,
        roots: &mut Vec<(Vec<u8>, EntryId)>,
    ) -> bool {
        // Resolve links first; a link to a directory records a dependency on
        // the path read through it.
        let mut id = id;
        let mut hops = 0;
        loop {
            match &self.entry(id).state {
                EntryState::Dir(_) | EntryState::DirUnread => break,
                EntryState::Leaf(_) | EntryState::LinkMissing | EntryState::LinkFailed(_) => {
                    return true;
                }
                EntryState::LinkUnsupported => {
                    log!(
                        "FindEmulator does not support symlink {}",
                        String::from_utf8_lossy(path)
                    );
                    return false;
                }
                EntryState::LinkUnread | EntryState::LinkTo(_) => {
                    hops += 1;
                    if hops > MAX_LINK_HOPS {
                        return true;
                    }
                    match self.link_view(id) {
                        LinkView::Target(target) => {
                            if self.is_dir_like(target) {
                                fc.read_dirs.lock().insert(Bytes::from(path.clone()));
                            }
                            id = target;
                        }
                        LinkView::Unsupported => {
                            log!(
                                "FindEmulator does not support symlink {}",
                                String::from_utf8_lossy(path)
                            );
                            return false;
                        }
                        _ => return true,
                    }
                }
            }
        }

        if !path.is_empty() {
            path.push(b'/');
        }
        let reset = path.len();

        let (part, rest) = match memchr::memchr(b'/', spec) {
            Some(slash) => (&spec[..slash], Some(&spec[slash + 1..])),
            None => (spec, None),
        };

        match part {
            b"" | b"." => {
                path.extend_from_slice(part);
                match rest {
                    None => {
                        roots.push((path.clone(), id));
                        true
                    }
                    Some(rest) => self.expand_roots(fc, id, rest, path, roots),
                }
            }
            b".." => {
                let Some(parent) = self.entry(id).parent else {
                    log!(
                        "FindEmulator does not support leaving the source directory: {}",
                        String::from_utf8_lossy(path)
                    );
                    return false;
                };
                path.extend_from_slice(part);
                match rest {
                    None => {
                        roots.push((path.clone(), parent));
                        true
                    }
                    Some(rest) => self.expand_roots(fc, parent, rest, path, roots),
                }
            }
            _ => {
                let wildcard = memchr3(b'?', b'*', b'[', part).is_some();
                if wildcard {
                    fc.read_dirs.lock().insert(Bytes::from(path.clone()));
                }
                let pattern = if wildcard { CString::new(part).ok() } else { None };

                for kid in self.load_dir(id) {
                    let name = self.entry(kid).name.clone();
                    let matched = match &pattern {
                        Some(pattern) => fnmatch(pattern, &name, FNM_PERIOD),
                        None => name.as_ref() == part,
                    };
                    if !matched {
                        continue;
                    }
                    path.extend_from_slice(&name);
                    match rest {
                        None => roots.push((path.clone(), kid)),
                        Some(rest) => {
                            if !self.expand_roots(fc, kid, rest, path, roots) {
                                return false;
                            }
                        }
                    }
                    path.truncate(reset);
                }
                true
            }
        }
    }

    fn walk(
        &mut self,
        ctx: &Context,
        st: &mut Walk,
        id: EntryId,
        depth: i32,
        path: &mut Vec<u8>,
    ) -> Result<bool> {
        let mut cur = id;
        let mut hops = 0;
        let dir = loop {
            match &self.entry(cur).state {
                EntryState::Leaf(t) => {
                    emit_if_matched(st.fc, path, *t, depth, &mut st.out);
                    return Ok(true);
                }
                EntryState::Dir(_) | EntryState::DirUnread => break cur,
                _ => {
                    if !st.fc.follows_symlinks {
                        // Unfollowed links are opaque entries of type `l`.
                        emit_if_matched(st.fc, path, FindType::Symlink, depth, &mut st.out);
                        return Ok(true);
                    }
                    hops += 1;
                    if hops > MAX_LINK_HOPS {
                        return Ok(true);
                    }
                    match self.link_view(cur) {
                        LinkView::Target(target) => cur = target,
                        LinkView::Missing => {
                            emit_if_matched(st.fc, path, FindType::Symlink, depth, &mut st.out);
                            return Ok(true);
                        }
                        LinkView::Failed(msg) => {
                            if st.fc.kind != Some(FindKind::FindLeaves) {
                                find_warn_loc(
                                    ctx,
                                    st.loc,
                                    format!(
                                        "FindEmulator: find: {:?}: {msg}",
                                        String::from_utf8_lossy(path)
                                    ),
                                )?;
                            }
                            return Ok(true);
                        }
                        LinkView::Unsupported => {
                            log!(
                                "FindEmulator does not support {}",
                                String::from_utf8_lossy(path)
                            );
                            return Ok(false);
                        }
                    }
                }
            }
        };

        if let Some(first_path) = st.visiting.get(&dir) {
            find_warn_loc(
                ctx,
                st.loc,
                format!(
                    "FindEmulator: find: File system loop detected; {:?} is part of the same file system loop as {:?}.",
                    String::from_utf8_lossy(path),
                    String::from_utf8_lossy(first_path),
                ),
            )?;
            return Ok(true);
        }
        st.visiting.insert(dir, path.clone());
        let result = self.walk_dir(ctx, st, dir, depth, path);
        st.visiting.remove(&dir);
        result
    }

    fn walk_dir(
        &mut self,
        ctx: &Context,
        st: &mut Walk,
        id: EntryId,
        depth: i32,
        path: &mut Vec<u8>,
    ) -> Result<bool> {
        st.fc.read_dirs.lock().insert(Bytes::from(path.clone()));

        if st
            .fc
            .prune_cond
            .as_ref()
            .is_some_and(|cond| cond.matches(path, FindType::Dir))
        {
            if st.fc.kind != Some(FindKind::FindLeaves) {
                st.out.push(path.clone());
            }
            return Ok(true);
        }

        emit_if_matched(st.fc, path, FindType::Dir, depth, &mut st.out);

        if depth >= st.fc.depth {
            return Ok(true);
        }

        let kids = self.load_dir(id);

        if st.fc.kind == Some(FindKind::FindLeaves) {
            // Leaves first; a hit stops the search in this directory.
            let before = st.out.len();
            for &kid in &kids {
                if self.is_dir_like(kid) {
                    continue;
                }
                if !self.descend(ctx, st, kid, depth, path)? {
                    return Ok(false);
                }
            }
            if st.out.len() != before {
                // When every possible name was found, the regeneration
                // dependency is on the files staying present, not on the
                // directory listing.
                let cond = st.fc.print_cond.as_ref().unwrap();
                if cond.countable() && cond.count() == st.out.len() - before {
                    st.fc.read_dirs.lock().remove(path.as_slice());
                    let mut found = st.fc.found_files.lock();
                    for hit in &st.out[before..] {
                        found.push(Bytes::from(hit.clone()));
                    }
                }
                return Ok(true);
            }
            for &kid in &kids {
                if !self.is_dir_like(kid) {
                    continue;
                }
                if !self.descend(ctx, st, kid, depth, path)? {
                    return Ok(false);
                }
            }
        } else {
            for &kid in &kids {
                if !self.descend(ctx, st, kid, depth, path)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    // One child step of walk_dir: extend the path with the child's name,
    // recurse, restore.
    fn descend(
        &mut self,
        ctx: &Context,
        st: &mut Walk,
        kid: EntryId,
        depth: i32,
        path: &mut Vec<u8>,
    ) -> Result<bool> {
        let reset = path.len();
        if !path.ends_with(b"/") {
            path.push(b'/');
        }
        let name = self.entry(kid).name.clone();
        path.extend_from_slice(&name);
        let ok = self.walk(ctx, st, kid, depth + 1, path)?;
        path.truncate(reset);
        Ok(ok)
    }

    fn handle(
        &mut self,
        ctx: &Context,
        cmd: &Bytes,
        fc: &FindCommand,
        loc: &Loc,
    ) -> Result<Option<Bytes>> {
        if let Some(chdir) = &fc.chdir
            && !can_handle(chdir)
        {
            log!("FindEmulator: Cannot handle chdir ({chdir:?}): {cmd:?}");
            return Ok(None);
        }

        if let Some(testdir) = &fc.testdir {
            if !can_handle(testdir) {
                log!("FindEmulator: Cannot handle test dir ({testdir:?}): {cmd:?}");
                return Ok(None);
            }
            if self.locate(ROOT, testdir).is_none() {
                log!("FindEmulator: Test dir ({testdir:?}) not found: {cmd:?}");
                // If it exists on disk the tree must be missing something;
                // fall back. Otherwise `if [ -d ... ]` legitimately skips
                // the find, producing no output.
                return if std::fs::exists(OsStr::from_bytes(testdir)).unwrap_or(false) {
                    Ok(None)
                } else {
                    Ok(Some(Bytes::new()))
                };
            }
        }

        let mut start = ROOT;
        let mut prefix = Bytes::new();
        if let Some(chdir) = &fc.chdir {
            match self.locate(ROOT, chdir) {
                Some(found) => start = found,
                None => {
                    if std::fs::exists(OsStr::from_bytes(chdir)).unwrap_or(false) {
                        return Ok(None);
                    }
                    if !fc.redirect_to_devnull {
                        find_warn_loc(
                            ctx,
                            loc,
                            format!(
                                "FindEmulator: cd: {}: No such file or directory",
                                String::from_utf8_lossy(chdir)
                            ),
                        )?;
                    }
                    return Ok(Some(Bytes::new()));
                }
            }
            prefix = chdir.clone();
        }

        let mut st = Walk {
            fc,
            loc,
            visiting: HashMap::new(),
            out: Vec::new(),
        };

        for finddir in &fc.finddirs {
            let full = concat_dir(&prefix, finddir);
            if !can_handle(&full) {
                log!("FindEmulator: Cannot handle find dir ({full:?}): {cmd:?}");
                return Ok(None);
            }

            let mut roots = Vec::new();
            let mut scratch = Vec::new();
            if !self.expand_roots(fc, start, finddir, &mut scratch, &mut roots) {
                return Ok(None);
            }
            if roots.is_empty() {
                if std::fs::exists(OsStr::from_bytes(&full)).unwrap_or(false) {
                    return Ok(None);
                }
                if !fc.redirect_to_devnull {
                    find_warn_loc(
                        ctx,
                        loc,
                        format!(
                            "FindEmulator: find: \"{}\": No such file or directory",
                            String::from_utf8_lossy(&full)
                        ),
                    )?;
                }
                continue;
            }

            // bash sorts glob expansions before find ever sees them.
            roots.sort_by(|a, b| a.0.cmp(&b.0));

            for (mut path, root) in roots {
                st.visiting.clear();
                if !self.walk(ctx, &mut st, root, 0, &mut path)? {
                    log!(
                        "FindEmulator: walk failed: {}",
                        String::from_utf8_lossy(cmd)
                    );
                    return Ok(None);
                }
            }
        }

        if fc.kind == Some(FindKind::FindLeaves) {
            st.out.sort();
        }

        let total: usize = st.out.iter().map(|p| p.len() + 1).sum();
        let mut joined = BytesMut::with_capacity(total.saturating_sub(1));
        for (i, hit) in st.out.iter().enumerate() {
            if i > 0 {
                joined.put_slice(b" ");
            }
            joined.put_slice(hit);
        }
        log!("FindEmulator: OK");
        Ok(Some(joined.freeze()))
    }
}

fn can_handle(path: &[u8]) -> bool {
    !path.starts_with(b"/") && !path.starts_with(b".repo") && !path.starts_with(b".git")
}

/// The emulator: one lazily-populated tree of the working directory, shared
/// for the whole run behind a lock.
pub struct FindEmulator {
    tree: Mutex<FsTree>,
}

impl Default for FindEmulator {
    fn default() -> Self {
        Self::new()
    }
}

impl FindEmulator {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(FsTree::new()),
        }
    }

    /// Answers a parsed command, or `None` when it must run in a real
    /// shell after all (paths outside the tree, unsupported symlinks).
    pub fn find(
        &self,
        ctx: &Context,
        cmd: &Bytes,
        fc: &FindCommand,
        loc: &Loc,
    ) -> Result<Option<Bytes>> {
        self.tree.lock().handle(ctx, cmd, fc, loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_cmd(cmd: &'static [u8]) -> Option<FindCommand> {
        let flags = Flags::default();
        parse(&flags, &Bytes::from_static(cmd)).unwrap()
    }

    #[test]
    fn test_shell_words() {
        let words = shell_words(&Bytes::from_static(b"cd top && find . -name '*.c'")).unwrap();
        let words: Vec<&[u8]> = words.iter().map(|w| w.as_ref()).collect();
        assert_eq!(
            words,
            vec![
                b"cd".as_slice(),
                b"top",
                b"&&",
                b"find",
                b".",
                b"-name",
                b"*.c"
            ]
        );
        // Inner escapes and stray ampersands are unsupported.
        assert_eq!(shell_words(&Bytes::from_static(b"find a\\*b")), None);
        assert_eq!(shell_words(&Bytes::from_static(b"find . & wait")), None);
        // A leading backslash escapes one character.
        let words = shell_words(&Bytes::from_static(b"find \\! -name x")).unwrap();
        assert_eq!(words[1], Bytes::from_static(b"!"));
    }

    #[test]
    fn test_parse_find() {
        let fc = parse_cmd(b"find .").unwrap();
        assert_eq!(
            fc,
            FindCommand {
                kind: Some(FindKind::Find),
                finddirs: vec![Bytes::from_static(b".")],
                ..FindCommand::default()
            }
        );
    }

    #[test]
    fn test_parse_find_follow_symlink() {
        let fc = parse_cmd(b"find -L .").unwrap();
        assert_eq!(
            fc,
            FindCommand {
                kind: Some(FindKind::Find),
                finddirs: vec![Bytes::from_static(b".")],
                follows_symlinks: true,
                ..FindCommand::default()
            }
        );
    }

    #[test]
    fn test_parse_find_dirs() {
        let fc = parse_cmd(b"find top/C bar").unwrap();
        assert_eq!(
            fc,
            FindCommand {
                kind: Some(FindKind::Find),
                finddirs: vec![Bytes::from_static(b"top/C"), Bytes::from_static(b"bar")],
                ..FindCommand::default()
            }
        );
    }

    #[test]
    fn test_parse_cd_find() {
        let fc = parse_cmd(b"cd top && find C").unwrap();
        assert_eq!(
            fc,
            FindCommand {
                kind: Some(FindKind::Find),
                chdir: Some(Bytes::from_static(b"top")),
                finddirs: vec![Bytes::from_static(b"C")],
                ..FindCommand::default()
            }
        );
    }

    #[test]
    fn test_parse_testdir_find() {
        let fc = parse_cmd(b"if [ -d top ]; then find top; fi").unwrap();
        assert_eq!(
            fc,
            FindCommand {
                kind: Some(FindKind::Find),
                testdir: Some(Bytes::from_static(b"top")),
                finddirs: vec![Bytes::from_static(b"top")],
                ..FindCommand::default()
            }
        );
    }

    #[test]
    fn test_parse_find_conds() {
        let fc = parse_cmd(b"find top -type f -name 'a*' -o -name \\*b").unwrap();
        assert_eq!(
            fc,
            FindCommand {
                kind: Some(FindKind::Find),
                finddirs: vec![Bytes::from_static(b"top")],
                print_cond: Some(FindCond::Or(
                    Box::new(FindCond::And(
                        Box::new(FindCond::Typ(FindType::Regular)),
                        Box::new(FindCond::name(b"a*").unwrap())
                    )),
                    Box::new(FindCond::name(b"*b").unwrap())
                )),
                ..FindCommand::default()
            }
        );
    }

    #[test]
    fn test_parse_find_conds_paren() {
        let fc = parse_cmd(b"find top -type f -a \\( -name 'a*' -o -name \\*b \\)").unwrap();
        assert_eq!(
            fc,
            FindCommand {
                kind: Some(FindKind::Find),
                finddirs: vec![Bytes::from_static(b"top")],
                print_cond: Some(FindCond::And(
                    Box::new(FindCond::Typ(FindType::Regular)),
                    Box::new(FindCond::Or(
                        Box::new(FindCond::name(b"a*").unwrap()),
                        Box::new(FindCond::name(b"*b").unwrap()),
                    ))
                )),
                ..FindCommand::default()
            }
        );
    }

    #[test]
    fn test_parse_find_not() {
        let fc = parse_cmd(b"find top \\! -name 'a*'").unwrap();
        assert_eq!(
            fc,
            FindCommand {
                kind: Some(FindKind::Find),
                finddirs: vec![Bytes::from_static(b"top")],
                print_cond: Some(FindCond::Not(Box::new(FindCond::name(b"a*").unwrap()))),
                ..FindCommand::default()
            }
        );
    }

    #[test]
    fn test_parse_find_prune() {
        let fc = parse_cmd(b"find top -name out -prune -o -name '*.c'").unwrap();
        assert_eq!(
            fc,
            FindCommand {
                kind: Some(FindKind::Find),
                finddirs: vec![Bytes::from_static(b"top")],
                prune_cond: Some(FindCond::name(b"out").unwrap()),
                print_cond: Some(FindCond::name(b"*.c").unwrap()),
                ..FindCommand::default()
            }
        );
    }

    #[test]
    fn test_parse_find_maxdepth() {
        let fc = parse_cmd(b"find top -maxdepth 2 -type d").unwrap();
        assert_eq!(fc.depth, 2);
        assert_eq!(fc.print_cond, Some(FindCond::Typ(FindType::Dir)));
        assert_eq!(parse_cmd(b"find top -maxdepth -1"), None);
    }

    #[test]
    fn test_parse_findleaves() {
        let fc =
            parse_cmd(b"build/tools/findleaves.py --prune=out --mindepth=2 top Android.mk")
                .unwrap();
        assert_eq!(fc.kind, Some(FindKind::FindLeaves));
        assert!(fc.follows_symlinks);
        assert_eq!(fc.finddirs, vec![Bytes::from_static(b"top")]);
        assert_eq!(fc.mindepth, 2);
        assert_eq!(fc.prune_cond, Some(FindCond::name(b"out").unwrap()));
        assert_eq!(fc.print_cond, Some(FindCond::name(b"Android.mk").unwrap()));
    }

    #[test]
    fn test_parse_fail() {
        assert_eq!(parse_cmd(b"find top -name a\\*"), None);
        // A wildcard in chdir is not supported.
        assert_eq!(parse_cmd(b"cd top/*/B && find ."), None);
        assert_eq!(parse_cmd(b"ls top"), None);
        assert_eq!(parse_cmd(b"find top | grep foo"), None);
    }

    #[test]
    fn test_cond_matching() {
        let cond = FindCond::And(
            Box::new(FindCond::Typ(FindType::Regular)),
            Box::new(FindCond::name(b"*.c").unwrap()),
        );
        assert!(cond.matches(b"d/a.c", FindType::Regular));
        assert!(!cond.matches(b"d/a.c", FindType::Dir));
        assert!(!cond.matches(b"d/a.h", FindType::Regular));

        let names = FindCond::Or(
            Box::new(FindCond::name(b"x").unwrap()),
            Box::new(FindCond::name(b"y").unwrap()),
        );
        assert!(names.countable());
        assert_eq!(names.count(), 2);
        assert!(!FindCond::name(b"*.c").unwrap().countable());
    }
}
