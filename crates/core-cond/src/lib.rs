//! The conditional evaluator: `.if`/`.ifdef`/`.ifmake`/`.elif.../.else/.endif`
//! stacks, plus the small boolean expression grammar they share.
//!
//! Treated as an external collaborator by the core spec; given a real,
//! minimal grammar here (`defined`, `make`, `exists`, `target`, `empty`,
//! comparisons, `&&`/`||`/`!`) so `.if` actually works end to end.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CondError {
    #[error(".else with no matching .if")]
    UnbalancedElse,
    #[error(".endif with no matching .if")]
    UnbalancedEndif,
    #[error("a second .else for the same .if")]
    DuplicateElse,
    #[error("malformed conditional expression: {0}")]
    BadExpression(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
}

/// What the parser should do with the line that was just handed to the
/// conditional evaluator (or, via [`CondStack::is_active`], any subsequent
/// non-directive line).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue normal parsing.
    Parse,
    /// Enter/remain in skip mode until the matching conditional closes.
    Skip,
    /// `word` was not a recognized conditional keyword at all; the caller
    /// should try it as something else (e.g. `.for`).
    Invalid,
}

/// Context the expression grammar consults for `defined`/`make`/`exists`/
/// `target`/bare variable references. Implemented by the parser, which owns
/// both the variable engine and the graph store.
pub trait CondContext {
    fn get_var(&self, name: &str) -> Option<String>;
    fn is_target(&self, name: &str) -> bool;
    /// True if `name` is among the targets this run was asked to make.
    fn is_making(&self, name: &str) -> bool;
    fn file_exists(&self, path: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchState {
    /// This branch's condition was true and no ancestor is inactive.
    Active,
    /// This branch's condition was false (or an ancestor is inactive), but a
    /// later `.elif`/`.else` could still activate it.
    Pending,
    /// A branch in this chain already ran; no further `.elif`/`.else` in
    /// this chain can activate.
    Done,
}

#[derive(Debug)]
struct Frame {
    state: BranchState,
    parent_active: bool,
    saw_else: bool,
}

impl Frame {
    fn effectively_active(&self) -> bool {
        self.parent_active && matches!(self.state, BranchState::Active)
    }
}

/// The `.if`/`.elif`/`.else`/`.endif` nesting stack for one input frame chain.
#[derive(Debug, Default)]
pub struct CondStack {
    frames: Vec<Frame>,
}

impl CondStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a plain (non-directive) line should currently be parsed.
    pub fn is_active(&self) -> bool {
        self.frames.last().map(Frame::effectively_active).unwrap_or(true)
    }

    /// Nesting depth, used to detect unbalanced `.if`/`.endif` across an
    /// `.include` frame boundary (§4.3).
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Handle a `.`-prefixed line whose first word was not already claimed
    /// by `include`/`undef`/`export`/`unexport`/`info`/`warning`/`error`.
    pub fn process(
        &mut self,
        word: &str,
        rest: &str,
        ctx: &dyn CondContext,
    ) -> Result<Verdict, CondError> {
        let outer_active = self
            .frames
            .last()
            .map(Frame::effectively_active)
            .unwrap_or(true);

        match classify(word) {
            Some(Directive::If(negate, kind)) => {
                let parent_active = outer_active;
                let cond = if parent_active {
                    eval_sugared(kind, negate, rest, ctx)?
                } else {
                    false
                };
                self.frames.push(Frame {
                    state: if cond {
                        BranchState::Active
                    } else {
                        BranchState::Pending
                    },
                    parent_active,
                    saw_else: false,
                });
                Ok(self.verdict())
            }
            Some(Directive::Elif(negate, kind)) => {
                let frame = self.frames.last_mut().ok_or(CondError::UnbalancedElse)?;
                if frame.saw_else {
                    return Err(CondError::DuplicateElse);
                }
                match frame.state {
                    BranchState::Pending if frame.parent_active => {
                        let cond = eval_sugared(kind, negate, rest, ctx)?;
                        if cond {
                            frame.state = BranchState::Active;
                        }
                    }
                    BranchState::Active => frame.state = BranchState::Done,
                    _ => {}
                }
                Ok(self.verdict())
            }
            Some(Directive::Else) => {
                let frame = self.frames.last_mut().ok_or(CondError::UnbalancedElse)?;
                if frame.saw_else {
                    return Err(CondError::DuplicateElse);
                }
                frame.saw_else = true;
                match frame.state {
                    BranchState::Pending => frame.state = BranchState::Active,
                    BranchState::Active => frame.state = BranchState::Done,
                    BranchState::Done => {}
                }
                Ok(self.verdict())
            }
            Some(Directive::Endif) => {
                if self.frames.pop().is_none() {
                    return Err(CondError::UnbalancedEndif);
                }
                Ok(self.verdict())
            }
            None => Ok(Verdict::Invalid),
        }
    }

    fn verdict(&self) -> Verdict {
        if self.is_active() {
            Verdict::Parse
        } else {
            Verdict::Skip
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuncKind {
    Plain,
    Defined,
    Make,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    If(bool, FuncKind),
    Elif(bool, FuncKind),
    Else,
    Endif,
}

fn classify(word: &str) -> Option<Directive> {
    Some(match word {
        "if" => Directive::If(false, FuncKind::Plain),
        "ifdef" => Directive::If(false, FuncKind::Defined),
        "ifndef" => Directive::If(true, FuncKind::Defined),
        "ifmake" => Directive::If(false, FuncKind::Make),
        "ifnmake" => Directive::If(true, FuncKind::Make),
        "elif" => Directive::Elif(false, FuncKind::Plain),
        "elifdef" => Directive::Elif(false, FuncKind::Defined),
        "elifndef" => Directive::Elif(true, FuncKind::Defined),
        "elifmake" => Directive::Elif(false, FuncKind::Make),
        "elifnmake" => Directive::Elif(true, FuncKind::Make),
        "else" => Directive::Else,
        "endif" => Directive::Endif,
        _ => return None,
    })
}

/// `.ifdef`/`.ifmake` (and their `n`-negated siblings) are sugar over the
/// general expression grammar: `.ifdef FOO BAR` == `.if defined(FOO) ||
/// defined(BAR)`, same for `.ifmake`.
fn eval_sugared(
    kind: FuncKind,
    negate: bool,
    rest: &str,
    ctx: &dyn CondContext,
) -> Result<bool, CondError> {
    let value = match kind {
        FuncKind::Plain => Expr::parse(rest)?.eval(ctx)?,
        FuncKind::Defined => rest
            .split_whitespace()
            .any(|word| ctx.get_var(word).is_some()),
        FuncKind::Make => rest.split_whitespace().any(|word| ctx.is_making(word)),
    };
    Ok(value ^ negate)
}

// ---------------------------------------------------------------------
// Expression grammar: or_expr := and_expr ('||' and_expr)*
//                      and_expr := unary ('&&' unary)*
//                      unary := '!' unary | primary
//                      primary := '(' expr ')' | func '(' arg ')' | comparison
//                      comparison := value (op value)?
// ---------------------------------------------------------------------

struct Expr<'a> {
    chars: Vec<char>,
    pos: usize,
    ctx_text: &'a str,
}

impl<'a> Expr<'a> {
    fn parse(text: &'a str) -> Result<Self, CondError> {
        Ok(Expr {
            chars: text.chars().collect(),
            pos: 0,
            ctx_text: text,
        })
    }

    fn eval(mut self, ctx: &dyn CondContext) -> Result<bool, CondError> {
        let v = self.or_expr(ctx)?;
        self.skip_ws();
        if self.pos != self.chars.len() {
            return Err(CondError::BadExpression(self.ctx_text.to_string()));
        }
        Ok(v)
    }

    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn eat_str(&mut self, s: &str) -> bool {
        self.skip_ws();
        let s_chars: Vec<char> = s.chars().collect();
        if self.chars[self.pos..].starts_with(&s_chars[..]) {
            self.pos += s_chars.len();
            true
        } else {
            false
        }
    }

    fn or_expr(&mut self, ctx: &dyn CondContext) -> Result<bool, CondError> {
        let mut v = self.and_expr(ctx)?;
        loop {
            self.skip_ws();
            if self.eat_str("||") {
                let rhs = self.and_expr(ctx)?;
                v = v || rhs;
            } else {
                break;
            }
        }
        Ok(v)
    }

    fn and_expr(&mut self, ctx: &dyn CondContext) -> Result<bool, CondError> {
        let mut v = self.unary(ctx)?;
        loop {
            self.skip_ws();
            if self.eat_str("&&") {
                let rhs = self.unary(ctx)?;
                v = v && rhs;
            } else {
                break;
            }
        }
        Ok(v)
    }

    fn unary(&mut self, ctx: &dyn CondContext) -> Result<bool, CondError> {
        self.skip_ws();
        if self.peek() == Some('!') {
            self.pos += 1;
            return Ok(!self.unary(ctx)?);
        }
        self.primary(ctx)
    }

    fn primary(&mut self, ctx: &dyn CondContext) -> Result<bool, CondError> {
        self.skip_ws();
        if self.peek() == Some('(') {
            self.pos += 1;
            let v = self.or_expr(ctx)?;
            self.skip_ws();
            if self.peek() != Some(')') {
                return Err(CondError::UnexpectedEnd);
            }
            self.pos += 1;
            return Ok(v);
        }
        if let Some(ident) = self.try_ident() {
            self.skip_ws();
            if self.peek() == Some('(') {
                self.pos += 1;
                let arg_start = self.pos;
                let mut depth = 1;
                while depth > 0 {
                    match self.chars.get(self.pos) {
                        Some('(') => depth += 1,
                        Some(')') => depth -= 1,
                        Some(_) => {}
                        None => return Err(CondError::UnexpectedEnd),
                    }
                    if depth > 0 {
                        self.pos += 1;
                    }
                }
                let arg: String = self.chars[arg_start..self.pos].iter().collect();
                self.pos += 1; // consume ')'
                let arg = arg.trim();
                return match ident.as_str() {
                    "defined" => Ok(ctx.get_var(arg).is_some()),
                    "make" => Ok(ctx.is_making(arg)),
                    "exists" => Ok(ctx.file_exists(arg)),
                    "target" => Ok(ctx.is_target(arg)),
                    "empty" => Ok(ctx.get_var(arg).unwrap_or_default().is_empty()),
                    other => Err(CondError::BadExpression(format!("unknown function {other}"))),
                };
            }
            // Bareword with no call parens: truthy if it resolves to a
            // non-empty, non-"0" variable value.
            return Ok(truthy(ctx.get_var(&ident).as_deref()));
        }
        // Fall back to a comparison/value.
        self.comparison(ctx)
    }

    fn try_ident(&mut self) -> Option<String> {
        self.skip_ws();
        let start = self.pos;
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| c.is_alphanumeric() || *c == '_')
        {
            self.pos += 1;
        }
        if self.pos > start && self.chars[start].is_alphabetic() {
            Some(self.chars[start..self.pos].iter().collect())
        } else {
            self.pos = start;
            None
        }
    }

    fn comparison(&mut self, ctx: &dyn CondContext) -> Result<bool, CondError> {
        let lhs = self.value(ctx)?;
        self.skip_ws();
        for op in ["==", "!=", "<=", ">=", "<", ">"] {
            if self.eat_str(op) {
                let rhs = self.value(ctx)?;
                return Ok(compare(&lhs, &rhs, op));
            }
        }
        Ok(truthy(Some(lhs.as_str())))
    }

    fn value(&mut self, ctx: &dyn CondContext) -> Result<String, CondError> {
        self.skip_ws();
        match self.peek() {
            Some('"') => {
                self.pos += 1;
                let start = self.pos;
                while self.chars.get(self.pos).is_some_and(|c| *c != '"') {
                    self.pos += 1;
                }
                let s: String = self.chars[start..self.pos].iter().collect();
                if self.chars.get(self.pos) == Some(&'"') {
                    self.pos += 1;
                }
                Ok(s)
            }
            Some('$') => {
                self.pos += 1;
                let (open, close) = match self.chars.get(self.pos) {
                    Some('(') => ('(', ')'),
                    Some('{') => ('{', '}'),
                    _ => {
                        let name: String = self
                            .chars
                            .get(self.pos)
                            .map(|c| c.to_string())
                            .unwrap_or_default();
                        self.pos += 1;
                        return Ok(ctx.get_var(&name).unwrap_or_default());
                    }
                };
                self.pos += 1;
                let start = self.pos;
                let mut depth = 1;
                while depth > 0 {
                    match self.chars.get(self.pos) {
                        Some(c) if *c == open => depth += 1,
                        Some(c) if *c == close => depth -= 1,
                        Some(_) => {}
                        None => return Err(CondError::UnexpectedEnd),
                    }
                    if depth > 0 {
                        self.pos += 1;
                    }
                }
                let name: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                Ok(ctx.get_var(&name).unwrap_or_default())
            }
            _ => {
                let start = self.pos;
                while self
                    .chars
                    .get(self.pos)
                    .is_some_and(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'))
                {
                    self.pos += 1;
                }
                if self.pos == start {
                    return Err(CondError::UnexpectedEnd);
                }
                Ok(self.chars[start..self.pos].iter().collect())
            }
        }
    }
}

fn truthy(v: Option<&str>) -> bool {
    match v {
        None => false,
        Some(s) => !s.is_empty() && s != "0",
    }
}

fn compare(lhs: &str, rhs: &str, op: &str) -> bool {
    if let (Ok(a), Ok(b)) = (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        return match op {
            "==" => a == b,
            "!=" => a != b,
            "<" => a < b,
            "<=" => a <= b,
            ">" => a > b,
            ">=" => a >= b,
            _ => false,
        };
    }
    match op {
        "==" => lhs == rhs,
        "!=" => lhs != rhs,
        "<" => lhs < rhs,
        "<=" => lhs <= rhs,
        ">" => lhs > rhs,
        ">=" => lhs >= rhs,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Ctx {
        vars: std::collections::HashMap<String, String>,
        targets: HashSet<String>,
        making: HashSet<String>,
        files: HashSet<String>,
    }

    impl CondContext for Ctx {
        fn get_var(&self, name: &str) -> Option<String> {
            self.vars.get(name).cloned()
        }
        fn is_target(&self, name: &str) -> bool {
            self.targets.contains(name)
        }
        fn is_making(&self, name: &str) -> bool {
            self.making.contains(name)
        }
        fn file_exists(&self, path: &str) -> bool {
            self.files.contains(path)
        }
    }

    fn ctx() -> Ctx {
        Ctx {
            vars: [("FOO".to_string(), "1".to_string())].into_iter().collect(),
            targets: ["all".to_string()].into_iter().collect(),
            making: ["install".to_string()].into_iter().collect(),
            files: ["present.txt".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn simple_if_else_endif() {
        let mut s = CondStack::new();
        let c = ctx();
        assert_eq!(s.process("if", "defined(FOO)", &c).unwrap(), Verdict::Parse);
        assert_eq!(s.process("else", "", &c).unwrap(), Verdict::Skip);
        assert_eq!(s.process("endif", "", &c).unwrap(), Verdict::Parse);
        assert!(s.is_active());
    }

    #[test]
    fn false_if_then_elif_true() {
        let mut s = CondStack::new();
        let c = ctx();
        assert_eq!(s.process("if", "defined(NOPE)", &c).unwrap(), Verdict::Skip);
        assert_eq!(s.process("elif", "defined(FOO)", &c).unwrap(), Verdict::Parse);
        assert_eq!(s.process("else", "", &c).unwrap(), Verdict::Skip);
        s.process("endif", "", &c).unwrap();
    }

    #[test]
    fn nested_conditionals_respect_outer_skip() {
        let mut s = CondStack::new();
        let c = ctx();
        assert_eq!(s.process("if", "defined(NOPE)", &c).unwrap(), Verdict::Skip);
        // Inner .if is parsed while the stack is inactive; its own branch
        // must stay inactive regardless of its own condition.
        assert_eq!(s.process("if", "defined(FOO)", &c).unwrap(), Verdict::Skip);
        assert_eq!(s.process("endif", "", &c).unwrap(), Verdict::Skip);
        assert_eq!(s.process("endif", "", &c).unwrap(), Verdict::Parse);
    }

    #[test]
    fn unbalanced_endif_is_an_error() {
        let mut s = CondStack::new();
        let c = ctx();
        assert_eq!(s.process("endif", "", &c).unwrap_err(), CondError::UnbalancedEndif);
    }

    #[test]
    fn ifdef_and_ifmake_sugar() {
        let mut s = CondStack::new();
        let c = ctx();
        assert_eq!(s.process("ifdef", "FOO", &c).unwrap(), Verdict::Parse);
        s.process("endif", "", &c).unwrap();
        assert_eq!(s.process("ifnmake", "install", &c).unwrap(), Verdict::Skip);
        s.process("endif", "", &c).unwrap();
    }

    #[test]
    fn boolean_operators_and_functions() {
        let mut s = CondStack::new();
        let c = ctx();
        assert_eq!(
            s.process("if", "target(all) && exists(present.txt)", &c).unwrap(),
            Verdict::Parse
        );
        s.process("endif", "", &c).unwrap();
        assert_eq!(
            s.process("if", "!target(missing) || empty(FOO)", &c).unwrap(),
            Verdict::Parse
        );
        s.process("endif", "", &c).unwrap();
    }

    #[test]
    fn numeric_and_string_comparisons() {
        let mut s = CondStack::new();
        let c = ctx();
        assert_eq!(s.process("if", "1 < 2", &c).unwrap(), Verdict::Parse);
        s.process("endif", "", &c).unwrap();
        assert_eq!(s.process("if", "\"abc\" == \"abc\"", &c).unwrap(), Verdict::Parse);
        s.process("endif", "", &c).unwrap();
    }

    #[test]
    fn invalid_directive_returns_invalid_for_dot_for_fallback() {
        let mut s = CondStack::new();
        let c = ctx();
        assert_eq!(s.process("for", "i in 1 2 3", &c).unwrap(), Verdict::Invalid);
    }
}
