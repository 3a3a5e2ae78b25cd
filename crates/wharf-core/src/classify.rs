//! Classification of type-check error messages into the closed taxonomy the
//! patch engine can act on.
//!
//! The patterns are fixed and applied in order; the first match wins.
//! Anything unmatched is `Other`, which renders the package unportable.

use regex::Regex;

use crate::toolchain::RawTypeError;

/// An undeclared identifier, optionally a missing member of a named type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadName {
    pub name: String,
    pub member_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Identifier local to the package under check.
    BadName(BadName),
    /// Identifier accessed through an imported package's name: a dependency
    /// is missing a symbol.
    BadImportName { pkg_name: String, name: BadName },
    Other,
}

/// A classified type-check error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeError {
    pub file: String,
    pub message: String,
    pub soft: bool,
    pub class: ErrorClass,
}

impl TypeError {
    pub fn from_raw(classifier: &Classifier, raw: &RawTypeError) -> TypeError {
        TypeError {
            file: raw.file.clone(),
            message: raw.message.clone(),
            soft: raw.soft,
            class: classifier.classify(&raw.message),
        }
    }
}

// Messages come in the following shapes:
//   undefined: [pkg].[symbol]
//   undefined: [symbol]
//   undeclared name: [symbol]                          (pre Go 1.20)
//   [v].[symbol] undefined (type [type] has no field or method [symbol])
//   [symbol] not declared by package [pkg]
pub struct Classifier {
    undefined_qualified: Regex,
    undefined: Regex,
    undeclared: Regex,
    missing_member: Regex,
    not_declared_by: Regex,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Classifier {
        Classifier {
            undefined_qualified: Regex::new(r"undefined: (\w+)\.(\w+)").unwrap(),
            undefined: Regex::new(r"undefined: (\w+)").unwrap(),
            undeclared: Regex::new(r"undeclared name: (\w+)").unwrap(),
            missing_member: Regex::new(
                r"(\w+\.\w+(?:\.\w+)?) undefined \(type \*?(?:(\w+)\.)?(\w+) has no field or method (\w+)",
            )
            .unwrap(),
            not_declared_by: Regex::new(r"(\w+) not declared by package (\w+)").unwrap(),
        }
    }

    pub fn classify(&self, message: &str) -> ErrorClass {
        if let Some(caps) = self.undefined_qualified.captures(message) {
            return ErrorClass::BadImportName {
                pkg_name: caps[1].to_string(),
                name: BadName {
                    name: caps[2].to_string(),
                    member_of: None,
                },
            };
        }
        if let Some(caps) = self.undefined.captures(message) {
            return ErrorClass::BadName(BadName {
                name: caps[1].to_string(),
                member_of: None,
            });
        }
        if let Some(caps) = self.undeclared.captures(message) {
            return ErrorClass::BadName(BadName {
                name: caps[1].to_string(),
                member_of: None,
            });
        }
        if let Some(caps) = self.missing_member.captures(message) {
            let name = BadName {
                name: caps[4].to_string(),
                member_of: Some(caps[3].to_string()),
            };
            return match caps.get(2) {
                Some(qualifier) => ErrorClass::BadImportName {
                    pkg_name: qualifier.as_str().to_string(),
                    name,
                },
                None => ErrorClass::BadName(name),
            };
        }
        if let Some(caps) = self.not_declared_by.captures(message) {
            return ErrorClass::BadImportName {
                pkg_name: caps[2].to_string(),
                name: BadName {
                    name: caps[1].to_string(),
                    member_of: None,
                },
            };
        }
        ErrorClass::Other
    }
}

/// Errors the checker reports without giving up on the rest of the package.
/// A candidate whose residual errors are all soft still counts as making
/// progress.
pub fn is_soft_message(message: &str) -> bool {
    const SOFT: [&str; 4] = [
        "declared and not used",
        "imported and not used",
        "no new variables on left side of :=",
        "is not used",
    ];
    SOFT.iter().any(|frag| message.contains(frag))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(msg: &str) -> ErrorClass {
        Classifier::new().classify(msg)
    }

    #[test]
    fn qualified_undefined_is_an_import_error() {
        assert_eq!(
            classify("undefined: syscall.EBADF"),
            ErrorClass::BadImportName {
                pkg_name: "syscall".into(),
                name: BadName {
                    name: "EBADF".into(),
                    member_of: None
                },
            }
        );
    }

    #[test]
    fn bare_undefined_is_a_local_error() {
        assert_eq!(
            classify("undefined: terminalWidth"),
            ErrorClass::BadName(BadName {
                name: "terminalWidth".into(),
                member_of: None
            })
        );
    }

    #[test]
    fn legacy_undeclared_name_still_matches() {
        assert_eq!(
            classify("undeclared name: terminalWidth"),
            ErrorClass::BadName(BadName {
                name: "terminalWidth".into(),
                member_of: None
            })
        );
    }

    #[test]
    fn missing_member_carries_the_receiver() {
        assert_eq!(
            classify("file.Close undefined (type File has no field or method Close)"),
            ErrorClass::BadName(BadName {
                name: "Close".into(),
                member_of: Some("File".into())
            })
        );
        assert_eq!(
            classify("c.Fd undefined (type *unix.Conn has no field or method Fd)"),
            ErrorClass::BadImportName {
                pkg_name: "unix".into(),
                name: BadName {
                    name: "Fd".into(),
                    member_of: Some("Conn".into())
                },
            }
        );
    }

    #[test]
    fn not_declared_by_package_names_the_dependency() {
        assert_eq!(
            classify("EBADF not declared by package syscall"),
            ErrorClass::BadImportName {
                pkg_name: "syscall".into(),
                name: BadName {
                    name: "EBADF".into(),
                    member_of: None
                },
            }
        );
    }

    #[test]
    fn anything_else_is_other() {
        assert_eq!(
            classify("cannot use x (variable of type int) as string value"),
            ErrorClass::Other
        );
    }

    #[test]
    fn soft_messages() {
        assert!(is_soft_message("x declared and not used"));
        assert!(is_soft_message("\"fmt\" imported and not used"));
        assert!(!is_soft_message("undefined: x"));
    }
}
