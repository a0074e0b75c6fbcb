//! Static policy check run on every submission before it reaches the
//! sandbox.
//!
//! The check parses the code with tree-sitter's Python grammar and walks
//! the tree in document order, stopping at the first offending node:
//!
//! | Violation | Trigger |
//! |-----------|---------|
//! | [`ViolationKind::Import`] | any `import`, `from ... import`, or `from __future__ import` |
//! | [`ViolationKind::ForbiddenCall`] | a call whose callee is a bare name on the denylist |
//! | [`ViolationKind::DunderAccess`] | an attribute access like `x.__class__` |
//! | [`ViolationKind::NonAsciiSyntax`] | non-ASCII text the parser could not place |
//!
//! Python compares identifiers after NFKC normalization, so `_\u{ff3f}class_\u{ff3f}`
//! is `__class__` at run time. Names are normalized the same way before
//! they are matched.
//!
//! Code that does not parse is accepted here. The sandbox compiles every
//! submission before running it and reports a `SyntaxError` of its own, so
//! malformed input still never executes. The exception is an unparsable
//! region holding non-ASCII characters: CPython accepts identifiers that
//! tree-sitter's grammar does not, so those are rejected instead.
//!
//! This is one layer of three (static check, restricted builtins, timeout).
//! Indirect attribute chains can get past a denylist; the restricted
//! namespace in the worker is what keeps them from reaching anything useful.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, trace};
use tree_sitter::Parser;
use unicode_normalization::UnicodeNormalization;

/// Builtins that submitted code may not call by name.
pub const DENIED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "open",
    "input",
    "raw_input",
    "execfile",
    "file",
    "reload",
    "vars",
    "locals",
    "globals",
    "dir",
    "getattr",
    "setattr",
    "delattr",
    "hasattr",
    "breakpoint",
    "memoryview",
    "help",
];

const IMPORT_NODE_KINDS: &[&str] = &[
    "import_statement",
    "import_from_statement",
    "future_import_statement",
];

thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

/// What kind of rule a submission broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    Import,
    ForbiddenCall,
    DunderAccess,
    NonAsciiSyntax,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Import => write!(f, "module import"),
            Self::ForbiddenCall => write!(f, "forbidden call"),
            Self::DunderAccess => write!(f, "dunder attribute access"),
            Self::NonAsciiSyntax => write!(f, "unparsable non-ASCII text"),
        }
    }
}

/// A single rejected construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub kind: ViolationKind,
    pub detail: String,
    /// 1-based source line of the offending node.
    pub line: usize,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on line {}: {}", self.kind, self.line, self.detail)
    }
}

/// Result of [`PolicyEnforcer::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Violation(PolicyViolation),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Denylist-based static checker.
#[derive(Debug, Clone)]
pub struct PolicyEnforcer {
    denied_calls: BTreeSet<String>,
}

impl Default for PolicyEnforcer {
    fn default() -> Self {
        Self {
            denied_calls: DENIED_CALLS.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl PolicyEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a name to the call denylist.
    pub fn with_denied_call(mut self, name: impl Into<String>) -> Self {
        self.denied_calls.insert(name.into());
        self
    }

    pub fn denied_calls(&self) -> impl Iterator<Item = &str> {
        self.denied_calls.iter().map(String::as_str)
    }

    /// Check `code` and report the first violation in document order.
    pub fn validate(&self, code: &str) -> Verdict {
        let tree = PYTHON_PARSER.with(|p| p.borrow_mut().parse(code, None));
        let Some(tree) = tree else {
            debug!("Policy check: parser produced no tree; deferring to sandbox");
            return Verdict::Accepted;
        };
        let root = tree.root_node();
        let source = code.as_bytes();
        let has_error = root.has_error();
        let mut cursor = root.walk();
        loop {
            let node = cursor.node();
            let found = if has_error {
                non_ascii_error(&node, source)
            } else {
                self.check_node(&node, source)
            };
            if let Some(violation) = found {
                debug!("Policy violation: {violation}");
                return Verdict::Violation(violation);
            }

            if cursor.goto_first_child() {
                continue;
            }
            while !cursor.goto_next_sibling() {
                if !cursor.goto_parent() {
                    if has_error {
                        debug!("Policy check: syntax errors present; deferring to sandbox compile");
                    } else {
                        trace!("Policy check passed ({} bytes)", code.len());
                    }
                    return Verdict::Accepted;
                }
            }
        }
    }

    fn check_node(&self, node: &tree_sitter::Node, source: &[u8]) -> Option<PolicyViolation> {
        let line = node.start_position().row + 1;
        let kind = node.kind();

        if IMPORT_NODE_KINDS.contains(&kind) {
            let text = node_text(node, source);
            return Some(PolicyViolation {
                kind: ViolationKind::Import,
                detail: format!("`{}` (use the preloaded names instead)", text.trim()),
                line,
            });
        }

        if kind == "call" {
            let callee = node.child_by_field_name("function")?;
            if callee.kind() == "identifier" {
                let name = identifier(&callee, source);
                if self.denied_calls.contains(&*name) {
                    return Some(PolicyViolation {
                        kind: ViolationKind::ForbiddenCall,
                        detail: format!("call to `{name}()` is not allowed"),
                        line,
                    });
                }
            }
            return None;
        }

        if kind == "attribute" {
            let attr = node.child_by_field_name("attribute")?;
            let name = identifier(&attr, source);
            if is_dunder(&name) {
                return Some(PolicyViolation {
                    kind: ViolationKind::DunderAccess,
                    detail: format!("access to `.{name}` is not allowed"),
                    line,
                });
            }
        }

        None
    }
}

fn node_text<'a>(node: &tree_sitter::Node, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or_default()
}

/// Identifier text as Python resolves it.
fn identifier<'a>(node: &tree_sitter::Node, source: &'a [u8]) -> Cow<'a, str> {
    let text = node_text(node, source);
    if text.is_ascii() {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(text.nfkc().collect())
    }
}

fn non_ascii_error(node: &tree_sitter::Node, source: &[u8]) -> Option<PolicyViolation> {
    if !node.is_error() {
        return None;
    }
    let text = node_text(node, source);
    if text.is_ascii() {
        return None;
    }
    let preview: String = text.trim().chars().take(40).collect();
    Some(PolicyViolation {
        kind: ViolationKind::NonAsciiSyntax,
        detail: format!("`{preview}` (write identifiers in ASCII)"),
        line: node.start_position().row + 1,
    })
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}
