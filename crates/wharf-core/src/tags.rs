//! Build-constraint algebra over the closed set of unix-like platforms.
//!
//! A file's `//go:build` header (or legacy `// +build` lines) plus its
//! filename suffix reduce to a four-valued constraint: the file never builds,
//! always builds, builds specifically because the target OS tag is present,
//! or builds for a specific set of other unix-like platforms.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;

use crate::scan::find_sub;

/// All the unix-like platforms. Must stay in sync with `UNIX_PLATFORM_RANKING`.
pub const UNIX_PLATFORMS: [&str; 13] = [
    "aix",
    "android",
    "darwin",
    "dragonfly",
    "freebsd",
    "hurd",
    "illumos",
    "ios",
    "linux",
    "netbsd",
    "openbsd",
    "solaris",
    "zos",
];

/// Unix-like platforms in order of build priority when enumerating candidate
/// configurations. The target OS itself is not a candidate source.
pub const UNIX_PLATFORM_RANKING: [&str; 12] = [
    "linux",
    "openbsd",
    "freebsd",
    "netbsd",
    "darwin",
    "solaris",
    "illumos",
    "dragonfly",
    "android",
    "ios",
    "hurd",
    "aix",
];

const KNOWN_OS: [&str; 17] = [
    "aix",
    "android",
    "darwin",
    "dragonfly",
    "freebsd",
    "hurd",
    "illumos",
    "ios",
    "js",
    "linux",
    "nacl",
    "netbsd",
    "openbsd",
    "plan9",
    "solaris",
    "windows",
    "zos",
];

const KNOWN_ARCH: [&str; 24] = [
    "386",
    "amd64",
    "amd64p32",
    "arm",
    "armbe",
    "arm64",
    "arm64be",
    "loong64",
    "mips",
    "mipsle",
    "mips64",
    "mips64le",
    "mips64p32",
    "mips64p32le",
    "ppc",
    "ppc64",
    "ppc64le",
    "riscv",
    "riscv64",
    "s390",
    "s390x",
    "sparc",
    "sparc64",
    "wasm",
];

pub fn is_unix_platform(tag: &str) -> bool {
    UNIX_PLATFORMS.contains(&tag)
}

pub fn is_known_os(tag: &str) -> bool {
    KNOWN_OS.contains(&tag)
}

pub fn is_known_arch(tag: &str) -> bool {
    KNOWN_ARCH.contains(&tag)
}

/// Subset of `UNIX_PLATFORMS`, as a bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PlatformSet(u16);

impl PlatformSet {
    pub const EMPTY: PlatformSet = PlatformSet(0);

    pub fn full() -> PlatformSet {
        PlatformSet((1 << UNIX_PLATFORMS.len()) - 1)
    }

    pub fn from_tag(tag: &str) -> Option<PlatformSet> {
        UNIX_PLATFORMS
            .iter()
            .position(|p| *p == tag)
            .map(|bit| PlatformSet(1 << bit))
    }

    /// Everything unix-like except `tag`.
    pub fn complement_of(tag: &str) -> PlatformSet {
        match PlatformSet::from_tag(tag) {
            Some(one) => PlatformSet(Self::full().0 & !one.0),
            None => Self::full(),
        }
    }

    pub fn contains(self, tag: &str) -> bool {
        PlatformSet::from_tag(tag).is_some_and(|one| self.0 & one.0 != 0)
    }

    pub fn union(self, other: PlatformSet) -> PlatformSet {
        PlatformSet(self.0 | other.0)
    }

    pub fn intersection(self, other: PlatformSet) -> PlatformSet {
        PlatformSet(self.0 & other.0)
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_full(self) -> bool {
        self == Self::full()
    }

    pub fn iter(self) -> impl Iterator<Item = &'static str> {
        UNIX_PLATFORMS
            .iter()
            .enumerate()
            .filter(move |(bit, _)| self.0 & (1 << bit) != 0)
            .map(|(_, p)| *p)
    }
}

impl FromIterator<&'static str> for PlatformSet {
    fn from_iter<I: IntoIterator<Item = &'static str>>(iter: I) -> Self {
        let mut set = PlatformSet::EMPTY;
        for tag in iter {
            if let Some(one) = PlatformSet::from_tag(tag) {
                set = set.union(one);
            }
        }
        set
    }
}

impl fmt::Debug for PlatformSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// What platforms a file builds under, reduced to four values.
///
/// `Platforms` lists the unix-like platforms that would cause the file to
/// build; the target OS tag is specifically absent from the file's own
/// constraint in that case. `Supported` means the target OS tag itself is
/// present, which is the strongest signal a file was written with the target
/// in mind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Constraint {
    Ignored,
    All,
    Supported,
    Platforms(PlatformSet),
}

/// Target OS/arch pair the porting run is aimed at, from `go env`.
#[derive(Clone, Debug)]
pub struct Target {
    pub goos: String,
    pub goarch: String,
}

/// Reduce a file's name and header to its constraint.
///
/// An unparsable header is a soft failure: the file is treated as never
/// building, the same way the compiler would drop it.
pub fn parse(name: &str, src: &[u8], target: &Target, build_tags: &BTreeSet<String>) -> Constraint {
    let nametag = match parse_file_name(name, target) {
        Some(nametag) => nametag,
        None => return Constraint::Ignored,
    };

    match parse_file_header(src) {
        Err(_) => Constraint::Ignored,
        Ok(Some(mut expr)) => {
            if let Some(tag) = nametag {
                expr = Expr::And(Box::new(Expr::Tag(tag)), Box::new(expr));
            }
            eval_expr(&expr, false, &target.goos, build_tags)
        }
        Ok(None) => match nametag {
            Some(tag) => eval_tag(&tag, false, &target.goos, build_tags),
            None => Constraint::All,
        },
    }
}

/// Extract the implicit constraint carried by a filename suffix.
///
/// Returns `None` when the file must not be used at all (test files, files
/// for a foreign architecture or a non-unix OS); `Some(None)` when the name
/// carries no constraint; `Some(Some(tag))` for a unix-like GOOS suffix.
pub fn parse_file_name(name: &str, target: &Target) -> Option<Option<String>> {
    let mut stem = name.strip_suffix(".go").unwrap_or(name);

    // Files named *_test.go can show up under IgnoredGoFiles rather than as
    // test files.
    if stem.ends_with("_test") {
        return None;
    }

    if let Some((rest, tag)) = stem.rsplit_once('_') {
        if !rest.is_empty() && is_known_arch(tag) {
            if tag != target.goarch {
                return None;
            }
            stem = rest;
        }
    }

    if let Some((rest, tag)) = stem.rsplit_once('_') {
        if !rest.is_empty() && is_known_os(tag) {
            if is_unix_platform(tag) {
                return Some(Some(tag.to_string()));
            }
            return None;
        }
    }

    Some(None)
}

// The evaluation rules, matching what the resulting platform list means:
// only tags under the unix umbrella are reported back, the target GOOS tag
// itself maps to Supported (negated: Ignored), the "unix" tag and any
// user-supplied build tag count as satisfied, and every other tag is assumed
// unset.

fn eval_expr(expr: &Expr, negate: bool, goos: &str, tags: &BTreeSet<String>) -> Constraint {
    match expr {
        Expr::Or(x, y) => {
            if negate {
                // !(x || y) == !x && !y
                and(
                    eval_expr(x, negate, goos, tags),
                    eval_expr(y, negate, goos, tags),
                    goos,
                )
            } else {
                or(
                    eval_expr(x, negate, goos, tags),
                    eval_expr(y, negate, goos, tags),
                )
            }
        }
        Expr::And(x, y) => {
            if negate {
                // !(x && y) == !x || !y
                or(
                    eval_expr(x, negate, goos, tags),
                    eval_expr(y, negate, goos, tags),
                )
            } else {
                and(
                    eval_expr(x, negate, goos, tags),
                    eval_expr(y, negate, goos, tags),
                    goos,
                )
            }
        }
        Expr::Not(x) => eval_expr(x, !negate, goos, tags),
        Expr::Tag(tag) => eval_tag(tag, negate, goos, tags),
    }
}

fn eval_tag(tag: &str, mut negate: bool, goos: &str, tags: &BTreeSet<String>) -> Constraint {
    if is_unix_platform(tag) {
        if tag == goos {
            return if negate {
                Constraint::Ignored
            } else {
                Constraint::Supported
            };
        }

        // !tag builds everywhere except 'tag'
        if negate {
            return Constraint::Platforms(PlatformSet::complement_of(tag));
        }
        return Constraint::Platforms(PlatformSet::from_tag(tag).unwrap_or(PlatformSet::EMPTY));
    }

    // Satisfied tags invert the fallback
    if tag == "unix" || tags.contains(tag) {
        negate = !negate;
    }

    // Fallback treats the atom as an unset build tag: !x is TRUE, x is FALSE
    if negate {
        Constraint::All
    } else {
        Constraint::Ignored
    }
}

/// OR over the lattice.
pub fn or(left: Constraint, right: Constraint) -> Constraint {
    use Constraint::*;

    if matches!(right, Supported) {
        return Supported;
    }

    match left {
        Supported => Supported,
        All => All,
        Ignored => right,
        Platforms(l) => match right {
            Platforms(r) => {
                let merged = l.union(r);
                if merged.is_full() {
                    All
                } else {
                    Platforms(merged)
                }
            }
            Ignored => Platforms(l),
            All => All,
            Supported => Supported,
        },
    }
}

/// AND over the lattice. The target GOOS decides whether a platform set
/// covers `Supported`.
pub fn and(left: Constraint, right: Constraint, goos: &str) -> Constraint {
    use Constraint::*;

    if matches!(right, Ignored) {
        return Ignored;
    }

    match left {
        Ignored => Ignored,
        All => right,
        Supported => {
            // A platform set on the other side must cover GOOS, otherwise
            // the conjunction can never hold on the target.
            let covered = match right {
                Platforms(r) => r.contains(goos),
                _ => true,
            };
            if covered {
                Supported
            } else {
                Ignored
            }
        }
        Platforms(l) => match right {
            Platforms(r) => {
                let merged = l.intersection(r);
                if merged.is_empty() {
                    Ignored
                } else {
                    Platforms(merged)
                }
            }
            Supported => {
                if l.contains(goos) {
                    Supported
                } else {
                    Ignored
                }
            }
            All => Platforms(l),
            Ignored => Ignored,
        },
    }
}

/// Boolean expression over tag atoms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    Tag(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("multiple //go:build comments")]
    MultipleGoBuild,
    #[error("malformed build constraint: {0}")]
    Malformed(String),
}

/// Find and parse the build-constraint header of a Go source file.
///
/// A `//go:build` line wins; absent one, any legacy `// +build` lines are
/// collected and ANDed together per the Go spec.
pub fn parse_file_header(content: &[u8]) -> Result<Option<Expr>, HeaderError> {
    if let Some(line) = find_go_build(content)? {
        let text = String::from_utf8_lossy(line);
        let rest = text.trim_start_matches("//go:build");
        return parse_build_expr(rest).map(Some);
    }

    Ok(find_plus_build(content))
}

fn is_go_build_comment(line: &[u8]) -> bool {
    const PREFIX: &[u8] = b"//go:build";
    if !line.starts_with(PREFIX) {
        return false;
    }
    let rest = &line[PREFIX.len()..];
    rest.is_empty() || rest[0].is_ascii_whitespace()
}

/// Scan the file header for a `//go:build` line. The header ends at the
/// first non-blank, non-comment line.
fn find_go_build(content: &[u8]) -> Result<Option<&[u8]>, HeaderError> {
    let mut found: Option<&[u8]> = None;
    let mut in_slash_star = false;

    'lines: for raw in content.split(|&b| b == b'\n') {
        let mut line = trim_ascii(raw);

        if line.is_empty() {
            continue;
        }

        if !in_slash_star && is_go_build_comment(line) {
            if found.is_some() {
                return Err(HeaderError::MultipleGoBuild);
            }
            found = Some(line);
        }

        // Track block comments so that text inside /* */ neither counts as a
        // directive nor ends the header.
        while !line.is_empty() {
            if in_slash_star {
                match find_sub(line, b"*/") {
                    Some(i) => {
                        in_slash_star = false;
                        line = trim_ascii(&line[i + 2..]);
                    }
                    None => continue 'lines,
                }
            } else if line.starts_with(b"//") {
                continue 'lines;
            } else if line.starts_with(b"/*") {
                in_slash_star = true;
                line = trim_ascii(&line[2..]);
            } else {
                // Non-comment text ends the header.
                break 'lines;
            }
        }
    }

    Ok(found)
}

/// Collect legacy `// +build` lines; separate lines AND together.
fn find_plus_build(content: &[u8]) -> Option<Expr> {
    let mut expr: Option<Expr> = None;

    for raw in content.split(|&b| b == b'\n') {
        let line = trim_ascii(raw);
        if !line.starts_with(b"//") {
            if !line.is_empty() {
                // Header over.
                break;
            }
            continue;
        }
        let text = String::from_utf8_lossy(line);
        let Some(parsed) = parse_plus_build_line(&text) else {
            continue;
        };
        expr = Some(match expr {
            Some(prev) => Expr::And(Box::new(prev), Box::new(parsed)),
            None => parsed,
        });
    }

    expr
}

/// Parse one `// +build` line: whitespace separates OR groups, commas
/// separate AND terms, `!` negates a term. An invalid term poisons the line.
fn parse_plus_build_line(line: &str) -> Option<Expr> {
    let rest = line.strip_prefix("//")?.trim_start();
    let rest = rest.strip_prefix("+build")?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let mut groups: Option<Expr> = None;
    let mut any = false;
    for field in rest.split_whitespace() {
        any = true;
        let mut terms: Option<Expr> = None;
        for term in field.split(',') {
            let (negate, tag) = match term.strip_prefix('!') {
                Some(tag) => (true, tag),
                None => (false, term),
            };
            if tag.is_empty() || tag.starts_with('!') || !is_valid_tag(tag) {
                return None;
            }
            let mut atom = Expr::Tag(tag.to_string());
            if negate {
                atom = Expr::Not(Box::new(atom));
            }
            terms = Some(match terms {
                Some(prev) => Expr::And(Box::new(prev), Box::new(atom)),
                None => atom,
            });
        }
        let field_expr = terms?;
        groups = Some(match groups {
            Some(prev) => Expr::Or(Box::new(prev), Box::new(field_expr)),
            None => field_expr,
        });
    }

    if any {
        groups
    } else {
        None
    }
}

fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Recursive-descent parser for `//go:build` expressions:
/// `||` over `&&` over `!` over atoms and parenthesized groups.
pub fn parse_build_expr(text: &str) -> Result<Expr, HeaderError> {
    let mut tokens = tokenize(text)?;
    tokens.reverse();
    let expr = parse_or(&mut tokens)?;
    if let Some(tok) = tokens.pop() {
        return Err(HeaderError::Malformed(format!(
            "unexpected trailing token {tok:?}"
        )));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Tag(String),
    Not,
    AndAnd,
    OrOr,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<Token>, HeaderError> {
    let mut out = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\r' => i += 1,
            b'(' => {
                out.push(Token::LParen);
                i += 1;
            }
            b')' => {
                out.push(Token::RParen);
                i += 1;
            }
            b'!' => {
                out.push(Token::Not);
                i += 1;
            }
            b'&' if bytes.get(i + 1) == Some(&b'&') => {
                out.push(Token::AndAnd);
                i += 2;
            }
            b'|' if bytes.get(i + 1) == Some(&b'|') => {
                out.push(Token::OrOr);
                i += 2;
            }
            c if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
                {
                    i += 1;
                }
                out.push(Token::Tag(text[start..i].to_string()));
            }
            c => {
                return Err(HeaderError::Malformed(format!(
                    "unexpected character {:?}",
                    c as char
                )))
            }
        }
    }
    Ok(out)
}

fn parse_or(tokens: &mut Vec<Token>) -> Result<Expr, HeaderError> {
    let mut left = parse_and(tokens)?;
    while tokens.last() == Some(&Token::OrOr) {
        tokens.pop();
        let right = parse_and(tokens)?;
        left = Expr::Or(Box::new(left), Box::new(right));
    }
    Ok(left)
}

fn parse_and(tokens: &mut Vec<Token>) -> Result<Expr, HeaderError> {
    let mut left = parse_unary(tokens)?;
    while tokens.last() == Some(&Token::AndAnd) {
        tokens.pop();
        let right = parse_unary(tokens)?;
        left = Expr::And(Box::new(left), Box::new(right));
    }
    Ok(left)
}

fn parse_unary(tokens: &mut Vec<Token>) -> Result<Expr, HeaderError> {
    match tokens.pop() {
        Some(Token::Not) => Ok(Expr::Not(Box::new(parse_unary(tokens)?))),
        Some(Token::LParen) => {
            let inner = parse_or(tokens)?;
            match tokens.pop() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(HeaderError::Malformed("missing ')'".into())),
            }
        }
        Some(Token::Tag(tag)) => Ok(Expr::Tag(tag)),
        other => Err(HeaderError::Malformed(format!(
            "expected tag, got {other:?}"
        ))),
    }
}

fn trim_ascii(mut b: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = b {
        if first.is_ascii_whitespace() {
            b = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = b {
        if last.is_ascii_whitespace() {
            b = rest;
        } else {
            break;
        }
    }
    b
}

/// Recover a package name by scanning file contents, for packages the list
/// oracle could not name because every file is excluded on the target.
pub fn find_package_name(base_dir: &std::path::Path, files: &[String]) -> String {
    let package_re = Regex::new(r"(?m)^package\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    for file in files {
        if file.ends_with("_test.go") {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(base_dir.join(file)) else {
            continue;
        };
        if let Some(caps) = package_re.captures(&content) {
            return caps[1].to_string();
        }
    }
    String::new()
}
