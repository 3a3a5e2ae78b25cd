//! Minimal Go source scanner: package clause and import declarations.
//!
//! The list oracle reports imports per package, not per file; deciding which
//! candidate configurations are viable requires knowing which file pulls in
//! which package, so the loader scans each file itself.

use thiserror::Error;

/// The cgo pseudo-import.
pub const CGO_IMPORT: &str = "C";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileImports {
    pub package: String,
    /// Local name to import path. The name is the explicit one when given,
    /// otherwise derived from the last path segment.
    pub named: Vec<(String, String)>,
    /// Side-effect (`_`) imports.
    pub anonymous: Vec<String>,
    /// File imports "C".
    pub cgo: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("missing package clause")]
    MissingPackageClause,
    #[error("malformed import declaration near offset {0}")]
    MalformedImport(usize),
    #[error("unterminated {0}")]
    Unterminated(&'static str),
}

/// Derive the local name Go gives an unnamed import.
///
/// The last path segment, cut at the first '.', keeping what follows the
/// last '-'.
pub fn assumed_import_name(path: &str) -> String {
    let mut name = path.rsplit('/').next().unwrap_or(path);
    if let Some(idx) = name.find('.') {
        name = &name[..idx];
    }
    if let Some(idx) = name.rfind('-') {
        name = &name[idx + 1..];
    }
    name.to_string()
}

/// Scan a Go source file for its package clause and import declarations.
pub fn scan_file(src: &[u8]) -> Result<FileImports, ScanError> {
    let mut scanner = Scanner { src, pos: 0 };
    let mut out = FileImports::default();

    match scanner.next_token()? {
        Some(Tok::Ident("package")) => {}
        _ => return Err(ScanError::MissingPackageClause),
    }
    match scanner.next_token()? {
        Some(Tok::Ident(name)) => out.package = name.to_string(),
        _ => return Err(ScanError::MissingPackageClause),
    }

    loop {
        let start = scanner.pos;
        match scanner.next_token()? {
            Some(Tok::Ident("import")) => match scanner.next_token()? {
                Some(Tok::LParen) => loop {
                    match scanner.next_token()? {
                        Some(Tok::RParen) => break,
                        Some(tok) => scanner.import_spec(tok, &mut out)?,
                        None => return Err(ScanError::Unterminated("import block")),
                    }
                },
                Some(tok) => scanner.import_spec(tok, &mut out)?,
                None => return Err(ScanError::MalformedImport(start)),
            },
            // First non-import token ends the header; the rest of the file
            // is none of our business.
            _ => break,
        }
    }

    Ok(out)
}

#[derive(Debug, PartialEq, Eq)]
enum Tok<'a> {
    Ident(&'a str),
    Str(String),
    LParen,
    RParen,
    Dot,
    Other,
}

struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn import_spec(&mut self, first: Tok<'a>, out: &mut FileImports) -> Result<(), ScanError> {
        let spec_start = self.pos;
        let (name, path) = match first {
            Tok::Str(path) => (None, path),
            Tok::Ident(name) => match self.next_token()? {
                Some(Tok::Str(path)) => (Some(name.to_string()), path),
                _ => return Err(ScanError::MalformedImport(spec_start)),
            },
            Tok::Dot => match self.next_token()? {
                Some(Tok::Str(path)) => (Some(".".to_string()), path),
                _ => return Err(ScanError::MalformedImport(spec_start)),
            },
            _ => return Err(ScanError::MalformedImport(spec_start)),
        };

        if path == CGO_IMPORT {
            out.cgo = true;
        }
        match name.as_deref() {
            Some("_") => out.anonymous.push(path),
            Some(name) => out.named.push((name.to_string(), path)),
            None => out.named.push((assumed_import_name(&path), path)),
        }
        Ok(())
    }

    /// Next token, skipping whitespace, semicolons, and comments.
    fn next_token(&mut self) -> Result<Option<Tok<'a>>, ScanError> {
        let src = self.src;
        loop {
            let Some(&c) = src.get(self.pos) else {
                return Ok(None);
            };
            match c {
                b' ' | b'\t' | b'\r' | b'\n' | b';' => self.pos += 1,
                b'/' if src.get(self.pos + 1) == Some(&b'/') => {
                    while self.pos < src.len() && src[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if src.get(self.pos + 1) == Some(&b'*') => {
                    let end = find_sub(&src[self.pos + 2..], b"*/")
                        .ok_or(ScanError::Unterminated("block comment"))?;
                    self.pos += 2 + end + 2;
                }
                b'(' => {
                    self.pos += 1;
                    return Ok(Some(Tok::LParen));
                }
                b')' => {
                    self.pos += 1;
                    return Ok(Some(Tok::RParen));
                }
                b'.' => {
                    self.pos += 1;
                    return Ok(Some(Tok::Dot));
                }
                b'"' => {
                    let start = self.pos + 1;
                    let mut i = start;
                    while i < src.len() && src[i] != b'"' {
                        if src[i] == b'\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                    if i >= src.len() {
                        return Err(ScanError::Unterminated("string literal"));
                    }
                    let text = String::from_utf8_lossy(&src[start..i]).into_owned();
                    self.pos = i + 1;
                    return Ok(Some(Tok::Str(text)));
                }
                b'`' => {
                    let start = self.pos + 1;
                    let end = src[start..]
                        .iter()
                        .position(|&b| b == b'`')
                        .ok_or(ScanError::Unterminated("raw string literal"))?;
                    let text = String::from_utf8_lossy(&src[start..start + end]).into_owned();
                    self.pos = start + end + 1;
                    return Ok(Some(Tok::Str(text)));
                }
                c if c == b'_' || c.is_ascii_alphabetic() || c >= 0x80 => {
                    let start = self.pos;
                    while src
                        .get(self.pos)
                        .is_some_and(|&b| b == b'_' || b.is_ascii_alphanumeric() || b >= 0x80)
                    {
                        self.pos += 1;
                    }
                    let text = std::str::from_utf8(&src[start..self.pos])
                        .map_err(|_| ScanError::MalformedImport(start))?;
                    return Ok(Some(Tok::Ident(text)));
                }
                _ => {
                    self.pos += 1;
                    return Ok(Some(Tok::Other));
                }
            }
        }
    }
}

pub(crate) fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_grouped_and_named_imports() {
        let src = br#"
// Copyright notice.

//go:build linux

package fds

import (
    "fmt"
    sys "golang.org/x/sys/unix"
    _ "embed"
    "github.com/acme/go-widget"
)

import "os"

func unused() {}
"#;
        let scanned = scan_file(src).expect("scan");
        assert_eq!(scanned.package, "fds");
        assert_eq!(
            scanned.named,
            vec![
                ("fmt".to_string(), "fmt".to_string()),
                ("sys".to_string(), "golang.org/x/sys/unix".to_string()),
                (
                    "widget".to_string(),
                    "github.com/acme/go-widget".to_string()
                ),
                ("os".to_string(), "os".to_string()),
            ]
        );
        assert_eq!(scanned.anonymous, vec!["embed".to_string()]);
        assert!(!scanned.cgo);
    }

    #[test]
    fn cgo_import_sets_flag() {
        let src = b"package netlink\n\n/*\n#include <stdio.h>\n*/\nimport \"C\"\n";
        let scanned = scan_file(src).expect("scan");
        assert!(scanned.cgo);
        assert_eq!(scanned.named, vec![("C".to_string(), "C".to_string())]);
    }

    #[test]
    fn assumed_names_strip_version_noise() {
        assert_eq!(assumed_import_name("gopkg.in/yaml.v3"), "yaml");
        assert_eq!(assumed_import_name("github.com/a/go-isatty"), "isatty");
        assert_eq!(assumed_import_name("unsafe"), "unsafe");
    }
}
