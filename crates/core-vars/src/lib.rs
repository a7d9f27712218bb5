//! The variable engine: scoped get/set/append/subst over `NAME`s, plus the
//! small `$(NAME)` / `${NAME}` / `$X` substitution grammar.
//!
//! Treated as an external collaborator by the core spec, but given a real,
//! minimal implementation here so the parser and scheduler can actually run
//! against a makefile instead of stubbing every variable reference.

use std::collections::HashMap;
use std::process::Command;

use thiserror::Error;

/// Opaque key for a node-local variable scope. Callers (the parser, the
/// graph) map their own node handles onto this via `as u32`/`from` so that
/// `core-vars` does not need to depend on `core-model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl From<u32> for NodeId {
    fn from(v: u32) -> Self {
        NodeId(v)
    }
}

#[derive(Debug, Error)]
pub enum VarsError {
    #[error("shell command `{cmd}` failed to launch: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
}

/// Scoped variable storage: environment, global (makefile-level), a
/// command-line override layer, and per-node local scopes (`.TARGET`,
/// `.ALLSRC`, `.IMPSRC`, ...).
#[derive(Debug, Default)]
pub struct VarEngine {
    environment: HashMap<String, String>,
    global: HashMap<String, String>,
    command_line: HashMap<String, String>,
    local: HashMap<NodeId, HashMap<String, String>>,
}

impl VarEngine {
    pub fn new() -> Self {
        let mut environment = HashMap::new();
        for (k, v) in std::env::vars() {
            environment.insert(k, v);
        }
        VarEngine {
            environment,
            ..Default::default()
        }
    }

    /// Used by tests and by the CLI layer to seed a deterministic environment.
    pub fn with_environment(environment: HashMap<String, String>) -> Self {
        VarEngine {
            environment,
            ..Default::default()
        }
    }

    /// Lookup order: local (if given) → command-line → global → environment.
    pub fn get(&self, name: &str, node: Option<NodeId>) -> Option<&str> {
        if let Some(node) = node {
            if let Some(v) = self.local.get(&node).and_then(|m| m.get(name)) {
                return Some(v);
            }
        }
        self.command_line
            .get(name)
            .or_else(|| self.global.get(name))
            .or_else(|| self.environment.get(name))
            .map(|s| s.as_str())
    }

    /// `NAME = VALUE`.
    pub fn set(&mut self, name: &str, value: &str) {
        self.global.insert(name.to_string(), value.to_string());
    }

    /// `NAME += VALUE`: append with a single-space separator, creating an
    /// empty value first if the name was previously undefined.
    pub fn append(&mut self, name: &str, value: &str) {
        let entry = self.global.entry(name.to_string()).or_default();
        if entry.is_empty() {
            *entry = value.to_string();
        } else {
            entry.push(' ');
            entry.push_str(value);
        }
    }

    /// `NAME ?= VALUE`: set only if undefined in the global scope.
    pub fn set_if_undefined(&mut self, name: &str, value: &str) {
        self.global
            .entry(name.to_string())
            .or_insert_with(|| value.to_string());
    }

    /// `NAME := VALUE`: substitute `value` eagerly (undefined names left
    /// literal) then set.
    pub fn set_expanded(&mut self, name: &str, value: &str) {
        let expanded = self.subst_leaving_undefined(value, None);
        self.set(name, &expanded);
    }

    /// `NAME != VALUE` / `NAME :sh = VALUE`: run `value` through `/bin/sh -c`,
    /// trim the trailing newline, and set the captured stdout.
    pub fn set_from_shell(&mut self, name: &str, cmd: &str) -> Result<(), VarsError> {
        let captured = self.shell_capture(cmd)?;
        self.set(name, &captured);
        Ok(())
    }

    pub fn shell_capture(&self, cmd: &str) -> Result<String, VarsError> {
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .map_err(|source| VarsError::Spawn {
                cmd: cmd.to_string(),
                source,
            })?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        while text.ends_with('\n') || text.ends_with('\r') {
            text.pop();
        }
        Ok(text)
    }

    pub fn set_local(&mut self, node: NodeId, name: &str, value: &str) {
        self.local
            .entry(node)
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    pub fn get_local(&self, node: NodeId, name: &str) -> Option<&str> {
        self.local.get(&node).and_then(|m| m.get(name)).map(|s| s.as_str())
    }

    pub fn undef(&mut self, name: &str) {
        self.global.remove(name);
    }

    /// Command-line variable assignments (`make FOO=bar`) take precedence
    /// over everything parsed from the makefile itself.
    pub fn set_command_line(&mut self, name: &str, value: &str) {
        self.command_line.insert(name.to_string(), value.to_string());
    }

    /// Substitute `$(NAME)`, `${NAME}` and single-character `$X` references
    /// in `text`. Undefined names expand to the empty string.
    pub fn subst(&self, text: &str, node: Option<NodeId>) -> String {
        self.subst_impl(text, node, false)
    }

    /// As [`Self::subst`], but undefined names are left as their literal
    /// `$(NAME)` expression (used for `:=` so self-referential definitions
    /// like `CFLAGS := $(CFLAGS) -g` keep working before `CFLAGS` exists).
    pub fn subst_leaving_undefined(&self, text: &str, node: Option<NodeId>) -> String {
        self.subst_impl(text, node, true)
    }

    fn subst_impl(&self, text: &str, node: Option<NodeId>, leave_undefined: bool) -> String {
        let bytes = text.as_bytes();
        let mut out = String::with_capacity(text.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' && i + 1 < bytes.len() {
                let (open, close) = match bytes[i + 1] {
                    b'(' => (b'(', b')'),
                    b'{' => (b'{', b'}'),
                    _ => (0, 0),
                };
                if open != 0 {
                    if let Some(end) = find_matching(bytes, i + 2, open, close) {
                        let name = &text[i + 2..end];
                        match self.get(name, node) {
                            Some(v) => out.push_str(v),
                            None if leave_undefined => {
                                out.push_str(&text[i..=end]);
                            }
                            None => {}
                        }
                        i = end + 1;
                        continue;
                    }
                }
                if bytes[i + 1] == b'$' {
                    out.push('$');
                    i += 2;
                    continue;
                }
                // Single-character variable name: `$X`.
                let name = &text[i + 1..i + 2];
                match self.get(name, node) {
                    Some(v) => out.push_str(v),
                    None if leave_undefined => out.push_str(&text[i..i + 2]),
                    None => {}
                }
                i += 2;
                continue;
            }
            let ch_len = next_char_len(text, i);
            out.push_str(&text[i..i + ch_len]);
            i += ch_len;
        }
        out
    }
}

fn next_char_len(s: &str, i: usize) -> usize {
    s[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1)
}

/// Find the index of the `close` byte matching the `open` byte implicitly
/// opened just before `start`, respecting nested `(`/`{` pairs so that e.g.
/// `$(X:$(Y))` resolves correctly.
fn find_matching(bytes: &[u8], start: usize, open: u8, close: u8) -> Option<usize> {
    let mut depth = 1usize;
    let mut i = start;
    while i < bytes.len() {
        if bytes[i] == open {
            depth += 1;
        } else if bytes[i] == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}
