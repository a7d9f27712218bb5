//! The top-level parser driving loop (§4.2): classifies each logical line in
//! priority order (directive, command, assignment, dependency) and wires the
//! already-standalone sub-modules — [`input`], [`include`], [`assign`],
//! [`depline`], [`forloop`] — together with `core-cond`'s conditional stack
//! and `core-vars`' variable engine into one running [`Parser`].

pub mod assign;
pub mod depline;
pub mod forloop;
pub mod include;
pub mod input;

use std::collections::HashSet;
use std::path::PathBuf;

use core_cond::{CondContext, CondError};
use core_diag::{Diagnostic, Diagnostics};
use core_model::{Graph, Handle, Kind, Provenance, SearchPath, SearchPaths};
use core_vars::{VarEngine, VarsError};

use crate::depline::{DepLineError, Operator, Special};
use crate::forloop::ForLoopError;
use crate::include::IncludeError;
use crate::input::{InputError, LogicalLine, Mode};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("{0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Include(#[from] IncludeError),
    #[error(transparent)]
    Cond(#[from] CondError),
    #[error(transparent)]
    DepLine(#[from] DepLineError),
    #[error(transparent)]
    ForLoop(#[from] ForLoopError),
    #[error(transparent)]
    Vars(#[from] VarsError),
}

const COND_WORDS: &[&str] = &[
    "if", "ifdef", "ifndef", "ifmake", "ifnmake", "elif", "elifdef", "elifndef", "elifmake",
    "elifnmake", "else", "endif",
];

/// The `.for`/`.endfor` driving loop needs to recognize its own keywords
/// mid-body to track nesting while accumulating the raw body (§4.2 item 1).
fn dot_word(line: &str) -> (&str, &str) {
    let after_dot = &line[1..];
    let bytes = after_dot.as_bytes();
    let mut wlen = 0;
    while wlen < bytes.len()
        && (bytes[wlen].is_ascii_alphanumeric() || bytes[wlen] == b'_' || bytes[wlen] == b'-')
    {
        wlen += 1;
    }
    (&after_dot[..wlen], after_dot[wlen..].trim_start())
}

/// Everything the top-level run needs once parsing is done: the populated
/// graph, the variable engine (still needed at dispatch time for `.TARGET`
/// etc.), and whatever diagnostics were accumulated along the way.
pub struct Parser {
    pub graph: Graph,
    pub vars: VarEngine,
    pub diagnostics: Diagnostics,
    pub paths: SearchPaths,

    includes: include::IncludeStack,
    group: Vec<Handle>,

    /// Targets requested on the command line; an empty list means "whatever
    /// `.MAIN` or the first mundane target resolves to" (§6).
    pub command_line_targets: Vec<String>,
    /// Set by a `.MAIN` special-target line when `command_line_targets` was
    /// empty at parse time (§4.2.2).
    pub main_override: Option<Vec<String>>,

    pub global_ignore: bool,
    pub global_silent: bool,
    pub global_precious: bool,
    pub delete_on_error: bool,
    pub notparallel: bool,
    pub singleshell: bool,
    pub shell_override: Option<String>,

    /// `.DEFAULT`'s node, if declared (§4.6a).
    pub default_node: Option<Handle>,
    /// Ordered `.SUFFIXES` list (§4.6a).
    pub suffixes: Vec<String>,
    pub null_suffix: Option<String>,

    exported: HashSet<String>,
    export_all: bool,

    errored: bool,
}

impl Parser {
    pub fn new(vars: VarEngine) -> Self {
        Parser {
            graph: Graph::new(),
            vars,
            diagnostics: Diagnostics::new(false),
            paths: SearchPaths::new(),
            includes: include::IncludeStack::new(),
            group: Vec::new(),
            command_line_targets: Vec::new(),
            main_override: None,
            global_ignore: false,
            global_silent: false,
            global_precious: false,
            delete_on_error: false,
            notparallel: false,
            singleshell: false,
            shell_override: None,
            default_node: None,
            suffixes: Vec::new(),
            null_suffix: None,
            exported: HashSet::new(),
            export_all: false,
            errored: false,
        }
    }

    pub fn with_warnings_as_errors(mut self, on: bool) -> Self {
        self.diagnostics = Diagnostics::new(on);
        self
    }

    /// Resolve the set of targets this run should actually build: the
    /// command line wins, then a parsed `.MAIN`, then the first mundane
    /// target declared in the input (classic make default-goal behavior).
    pub fn default_targets(&self) -> Vec<String> {
        if !self.command_line_targets.is_empty() {
            return self.command_line_targets.clone();
        }
        if let Some(names) = &self.main_override {
            return names.clone();
        }
        self.graph
            .main()
            .map(|h| vec![self.graph.node(h).name.clone()])
            .unwrap_or_default()
    }

    /// Parse `path` (the root makefile) and every file it `.include`s,
    /// driving the classification loop in §4.2 to completion (or until a
    /// `.error` directive or an unrecoverable I/O failure stops the run).
    pub fn parse_file(&mut self, path: PathBuf) -> Result<(), ParseError> {
        let contents = std::fs::read_to_string(&path).map_err(|e| ParseError::Io(path.clone(), e))?;
        self.includes.push_root(path, &contents);
        self.run()
    }

    fn run(&mut self) -> Result<(), ParseError> {
        loop {
            if self.errored {
                return Ok(());
            }
            let line = match self.next_line(Mode::Normal)? {
                Some(l) => l,
                None => return Ok(()),
            };
            self.handle_line(line)?;
        }
    }

    /// Pull the next logical line off the current frame, popping exhausted
    /// frames (and surfacing their input warnings) until one yields a line
    /// or the whole stack drains.
    fn next_line(&mut self, mode: Mode) -> Result<Option<LogicalLine>, ParseError> {
        loop {
            let Some(frame) = self.includes.current_mut() else {
                return Ok(None);
            };
            match frame.source.next(mode)? {
                Some(line) => return Ok(Some(line)),
                None => {
                    for (ln, msg) in std::mem::take(&mut frame.source.warnings) {
                        self.diagnostics.report(Diagnostic::warning(self.current_path(), ln, msg));
                    }
                    self.close_group();
                    self.includes.pop()?;
                    if self.includes.is_empty() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn current_path(&self) -> String {
        self.includes
            .current_path()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    fn fatal(&mut self, line: u32, message: impl Into<String>) {
        let path = self.current_path();
        self.diagnostics.report(Diagnostic::fatal(path, line, message));
    }

    fn warning(&mut self, line: u32, message: impl Into<String>) {
        let path = self.current_path();
        self.diagnostics.report(Diagnostic::warning(path, line, message));
    }

    fn close_group(&mut self) {
        self.group.clear();
    }

    fn handle_line(&mut self, line: LogicalLine) -> Result<(), ParseError> {
        if line.is_command {
            if self.includes.cond.is_active() {
                self.append_command(&line.text, line.line);
            }
            return Ok(());
        }
        let trimmed = line.text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        self.close_group();

        if trimmed.starts_with('.') {
            return self.handle_directive_line(trimmed, line.line);
        }

        if let Some(assignment) = assign::scan_assignment(&line.text) {
            if self.includes.cond.is_active() {
                assign::apply_assignment(&mut self.vars, &assignment, None)?;
            }
            return Ok(());
        }

        if !self.includes.cond.is_active() {
            return Ok(());
        }
        let substituted = self.vars.subst(&line.text, None);
        match depline::parse_dep_line(&substituted) {
            Ok(dep) => self.handle_dep_line(dep, line.line),
            Err(e) => {
                self.fatal(line.line, e.to_string());
                Ok(())
            }
        }
    }

    fn append_command(&mut self, cmd_line: &str, line_no: u32) {
        if self.group.is_empty() {
            self.fatal(line_no, "commands defined before first target");
            return;
        }
        let cmd = cmd_line.trim_start_matches('\t').to_string();
        for h in self.group.clone() {
            self.graph.node_mut(h).commands.push(cmd.clone());
            self.graph.node_mut(h).kind |= Kind::HAS_COMMANDS;
        }
    }

    // ---------------------------------------------------------------
    // Directive lines (§4.2 item 1).
    // ---------------------------------------------------------------

    fn handle_directive_line(&mut self, trimmed: &str, line_no: u32) -> Result<(), ParseError> {
        let (word, rest) = dot_word(trimmed);

        if COND_WORDS.contains(&word) {
            let ctx = ParserCondCtx {
                vars: &self.vars,
                graph: &self.graph,
                making: &self.command_line_targets,
            };
            match self.includes.cond.process(word, rest, &ctx) {
                Ok(_) => {}
                Err(e) => self.fatal(line_no, e.to_string()),
            }
            return Ok(());
        }

        if !self.includes.cond.is_active() {
            return Ok(());
        }

        match word {
            "include" => self.do_include(rest, line_no, false),
            "sinclude" | "dinclude" | "-include" => self.do_include(rest, line_no, true),
            "undef" => {
                for name in rest.split_whitespace() {
                    self.vars.undef(name);
                }
            }
            "export" => {
                if rest.trim().is_empty() {
                    self.export_all = true;
                } else {
                    for name in rest.split_whitespace() {
                        self.exported.insert(name.to_string());
                    }
                }
            }
            "unexport" => {
                if rest.trim().is_empty() {
                    self.export_all = false;
                    self.exported.clear();
                } else {
                    for name in rest.split_whitespace() {
                        self.exported.remove(name);
                    }
                }
            }
            "info" => {
                let msg = self.vars.subst(rest, None);
                self.diagnostics.report(Diagnostic::info(self.current_path(), line_no, msg));
            }
            "warning" => {
                let msg = self.vars.subst(rest, None);
                self.warning(line_no, msg);
            }
            "error" => {
                let msg = self.vars.subst(rest, None);
                self.fatal(line_no, msg);
                self.errored = true;
            }
            "for" => self.handle_for_loop(rest, line_no)?,
            "endfor" => self.fatal(line_no, "`.endfor' with no matching `.for'"),
            other => self.warning(line_no, format!("unknown directive `.{other}'")),
        }
        Ok(())
    }

    fn do_include(&mut self, rest: &str, line_no: u32, silent_missing: bool) {
        let expanded = self.vars.subst(rest, None);
        let (name, bracket) = parse_include_target(&expanded);
        match self.includes.push_include(&name, bracket, &self.paths) {
            Ok(()) => {}
            Err(IncludeError::NotFound(_)) if silent_missing => {}
            Err(e) => self.fatal(line_no, e.to_string()),
        }
    }

    /// Accumulate the raw body of a `.for` loop through its matching
    /// `.endfor` (honoring nested `.for`/`.endfor` pairs), expand it once per
    /// iteration, and push the flattened result as a synthetic input frame
    /// (§9 "Conditional + for-loop stack").
    fn handle_for_loop(&mut self, rest: &str, opened_at: u32) -> Result<(), ParseError> {
        let header = forloop::parse_for_header(rest)?;
        let mut body = Vec::new();
        let mut depth = 1u32;
        loop {
            let Some(line) = self.next_line(Mode::Raw)? else {
                return Err(ParseError::ForLoop(ForLoopError::UnterminatedFor));
            };
            let trimmed = line.text.trim_start();
            if trimmed.starts_with('.') {
                let (word, _) = dot_word(trimmed);
                if word == "for" {
                    depth += 1;
                } else if word == "endfor" {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
            }
            body.push(line.text);
        }
        let expanded = forloop::expand_for_body(&header, &body);
        let joined = expanded.join("\n");
        self.includes.push_for_loop(&joined, opened_at);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Dependency lines (§4.2.2).
    // ---------------------------------------------------------------

    fn handle_dep_line(&mut self, dep: depline::DepLine, line_no: u32) -> Result<(), ParseError> {
        let any_special = depline::any_special(&dep.targets);
        let all_special = depline::all_special(&dep.targets);
        if any_special && !all_special {
            self.fatal(line_no, "mixing a special target with a mundane target on one line");
            return Ok(());
        }
        if all_special {
            self.handle_special_line(&dep, line_no);
            return Ok(());
        }

        let mut new_group = Vec::new();
        for tname in &dep.targets {
            let centurion = self.graph.get(tname);
            if self.graph.node(centurion).provenance.file.is_empty() {
                self.graph.node_mut(centurion).provenance = Provenance {
                    file: self.current_path(),
                    line: line_no,
                };
            }
            if let Err(e) = depline::apply_operator(&mut self.graph, centurion, dep.op) {
                self.fatal(line_no, e.to_string());
                continue;
            }
            if self.global_ignore {
                self.graph.node_mut(centurion).kind |= Kind::IGNORE;
            }
            if self.global_silent {
                self.graph.node_mut(centurion).kind |= Kind::SILENT;
            }
            if self.global_precious {
                self.graph.node_mut(centurion).kind |= Kind::PRECIOUS;
            }

            let target = if dep.op == Operator::DoubleDep {
                self.graph.make_cohort(centurion)
            } else {
                centurion
            };

            if self.graph.main().is_none() && !tname.starts_with('.') {
                self.graph.set_main(centurion);
            }

            for sname in &dep.sources {
                if sname == ".WAIT" {
                    let wait = self.graph.new_internal(".WAIT");
                    self.graph.node_mut(wait).kind |= Kind::WAIT | Kind::PHONY;
                    self.graph.add_edge(target, wait);
                } else {
                    let child = self.graph.get(sname);
                    self.graph.add_edge(target, child);
                }
            }

            if let Some(cmd) = &dep.inline_cmd {
                self.graph.node_mut(target).commands.push(cmd.clone());
                self.graph.node_mut(target).kind |= Kind::HAS_COMMANDS;
            }

            new_group.push(target);
        }
        self.group = new_group;
        Ok(())
    }

    fn handle_special_line(&mut self, dep: &depline::DepLine, line_no: u32) {
        let mut new_group = Vec::new();
        for tname in &dep.targets {
            let special = depline::classify_special(tname).expect("all_special guarantees this");
            match special {
                Special::Hook => {
                    let h = self.graph.get(tname);
                    self.graph.node_mut(h).kind |= Kind::NOTMAIN | Kind::SPECIAL;
                    new_group.push(h);
                }
                Special::Default => {
                    let h = self.graph.get(tname);
                    self.graph.node_mut(h).kind |= Kind::NOTMAIN | Kind::TRANSFORM;
                    self.default_node = Some(h);
                    new_group.push(h);
                }
                Special::DeleteOnError => self.delete_on_error = true,
                Special::GlobalOrAttr(bit) => {
                    if dep.sources.is_empty() {
                        match bit {
                            Kind::IGNORE => self.global_ignore = true,
                            Kind::SILENT => self.global_silent = true,
                            Kind::PRECIOUS => self.global_precious = true,
                            _ => {}
                        }
                    } else {
                        for s in &dep.sources {
                            let ch = self.graph.get(s);
                            self.graph.node_mut(ch).kind |= bit;
                        }
                    }
                }
                Special::Attr(bit) => {
                    for s in &dep.sources {
                        let ch = self.graph.get(s);
                        self.graph.node_mut(ch).kind |= bit;
                    }
                }
                Special::Main => {
                    if self.command_line_targets.is_empty() {
                        self.main_override = Some(dep.sources.clone());
                    }
                }
                Special::NotParallel => self.notparallel = true,
                Special::SingleShell => self.singleshell = true,
                Special::Suffixes => {
                    if dep.sources.is_empty() {
                        self.suffixes.clear();
                    } else {
                        for s in &dep.sources {
                            if !self.suffixes.contains(s) {
                                self.suffixes.push(s.clone());
                            }
                        }
                    }
                }
                Special::Null => self.null_suffix = dep.sources.first().cloned(),
                Special::Path => {
                    if dep.sources.is_empty() {
                        self.paths.default.clear();
                    } else {
                        for s in &dep.sources {
                            self.paths.default.add(PathBuf::from(s));
                        }
                    }
                }
                Special::PathSuffix => {
                    let suffix = tname.trim_start_matches(".PATH.").to_string();
                    let entry = self
                        .paths
                        .by_suffix
                        .entry(suffix)
                        .or_insert_with(SearchPath::new);
                    for s in &dep.sources {
                        entry.add(PathBuf::from(s));
                    }
                }
                Special::IncludesOrLibs => {
                    for s in &dep.sources {
                        if !self.suffixes.contains(s) {
                            self.suffixes.push(s.clone());
                        }
                    }
                }
                Special::Order => {
                    let mut prev: Option<Handle> = None;
                    for s in &dep.sources {
                        let h = self.graph.get(s);
                        if let Some(p) = prev {
                            self.graph.add_order_edge(p, h);
                        }
                        prev = Some(h);
                    }
                }
                Special::Wait => {}
                Special::Configure => {
                    if tname == ".SHELL" {
                        self.shell_override = dep.sources.first().cloned();
                    }
                }
            }
        }
        self.group = new_group;
        let _ = line_no;
    }
}

/// `<FILE>` → bracket search only; `"FILE"` → quoted (includer dir first);
/// otherwise treated as quoted (§4.3).
fn parse_include_target(rest: &str) -> (String, bool) {
    let r = rest.trim();
    if let Some(stripped) = r.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
        (stripped.to_string(), true)
    } else if let Some(stripped) = r.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        (stripped.to_string(), false)
    } else {
        (r.to_string(), false)
    }
}

struct ParserCondCtx<'a> {
    vars: &'a VarEngine,
    graph: &'a Graph,
    making: &'a [String],
}

impl CondContext for ParserCondCtx<'_> {
    fn get_var(&self, name: &str) -> Option<String> {
        self.vars.get(name, None).map(|s| s.to_string())
    }

    fn is_target(&self, name: &str) -> bool {
        self.graph.find(name).is_some()
    }

    fn is_making(&self, name: &str) -> bool {
        self.making.iter().any(|t| t == name)
    }

    fn file_exists(&self, path: &str) -> bool {
        std::path::Path::new(path).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::MadeStatus;

    fn parse(text: &str) -> Parser {
        let mut p = Parser::new(VarEngine::default());
        p.includes.push_root(PathBuf::from("Makefile"), text);
        p.run().unwrap();
        p
    }

    #[test]
    fn simple_dependency_line_creates_edge() {
        let p = parse("all: foo\n\techo hi\n");
        let all = p.graph.find("all").unwrap();
        let foo = p.graph.find("foo").unwrap();
        assert_eq!(p.graph.node(all).children, vec![foo]);
        assert_eq!(p.graph.node(all).commands, vec!["echo hi".to_string()]);
        assert!(p.graph.node(all).kind.contains(Kind::HAS_COMMANDS));
        assert_eq!(p.graph.main(), Some(all));
    }

    #[test]
    fn variable_assignment_then_substitution_in_dep_line() {
        let p = parse("CC = gcc\nall: $(CC).o\n");
        assert!(p.graph.find("gcc.o").is_some());
    }

    #[test]
    fn doubledep_creates_a_fresh_cohort_per_line() {
        let p = parse("x:: a\n\tcmd1\nx:: b\n\tcmd2\n");
        let x = p.graph.find("x").unwrap();
        assert_eq!(p.graph.node(x).cohorts.len(), 2);
        let c1 = p.graph.node(x).cohorts[0];
        let c2 = p.graph.node(x).cohorts[1];
        assert_eq!(p.graph.node(c1).commands, vec!["cmd1".to_string()]);
        assert_eq!(p.graph.node(c2).commands, vec!["cmd2".to_string()]);
    }

    #[test]
    fn wait_source_becomes_a_distinct_internal_barrier_node_each_time() {
        let p = parse("all: a .WAIT b .WAIT c\n");
        let all = p.graph.find("all").unwrap();
        let children = &p.graph.node(all).children;
        assert_eq!(children.len(), 5);
        let wait_positions: Vec<Handle> = children
            .iter()
            .copied()
            .filter(|h| p.graph.node(*h).kind.contains(Kind::WAIT))
            .collect();
        assert_eq!(wait_positions.len(), 2);
        assert_ne!(wait_positions[0], wait_positions[1]);
    }

    #[test]
    fn phony_special_line_tags_its_sources() {
        let p = parse(".PHONY: clean\nclean:\n\trm -rf build\n");
        let clean = p.graph.find("clean").unwrap();
        assert!(p.graph.node(clean).kind.contains(Kind::PHONY));
        assert!(p.graph.find(".PHONY").is_none());
    }

    #[test]
    fn order_special_line_chains_order_edges() {
        let p = parse(".ORDER: first second third\nall: first second third\n");
        let first = p.graph.find("first").unwrap();
        let second = p.graph.find("second").unwrap();
        let third = p.graph.find("third").unwrap();
        assert_eq!(p.graph.node(first).order_succ, vec![second]);
        assert_eq!(p.graph.node(second).order_succ, vec![third]);
    }

    #[test]
    fn use_template_is_recorded_for_later_graph_expansion() {
        let p = parse("template: .USE\n\techo used\nfoo: template\n");
        let foo = p.graph.find("foo").unwrap();
        let template = p.graph.find("template").unwrap();
        assert!(p.graph.node(template).kind.contains(Kind::USE));
        assert!(p.graph.node(foo).children.contains(&template));
    }

    #[test]
    fn conditional_gates_dependency_lines() {
        let p = parse(".if 0\nhidden: x\n.endif\nvisible: y\n");
        assert!(p.graph.find("hidden").is_none());
        assert!(p.graph.find("visible").is_some());
    }

    #[test]
    fn for_loop_expands_one_target_per_iteration() {
        let p = parse(".for i in a b c\n$(i): src-$(i)\n.endfor\n");
        assert!(p.graph.find("a").is_some());
        assert!(p.graph.find("b").is_some());
        assert!(p.graph.find("c").is_some());
        assert!(p.graph.find("src-a").is_some());
    }

    #[test]
    fn nested_for_loops_are_accumulated_correctly() {
        let p = parse(".for i in x y\n.for j in 1 2\n$(i)$(j): dep\n.endfor\n.endfor\n");
        for name in ["x1", "x2", "y1", "y2"] {
            assert!(p.graph.find(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn error_directive_stops_the_run() {
        let p = parse(".error boom\nnever: reached\n");
        assert!(p.graph.find("never").is_none());
        assert!(p.diagnostics.has_fatal());
    }

    #[test]
    fn unknown_directive_is_a_warning_not_fatal() {
        let p = parse(".bogus thing\nall: x\n");
        assert!(p.graph.find("all").is_some());
        assert!(!p.diagnostics.has_fatal());
    }

    #[test]
    fn mixing_special_and_mundane_target_is_fatal() {
        let p = parse(".PHONY all: clean\n");
        assert!(p.diagnostics.has_fatal());
    }

    #[test]
    fn command_with_no_open_group_is_fatal() {
        let p = parse("\techo orphan\n");
        assert!(p.diagnostics.has_fatal());
    }

    #[test]
    fn default_targets_falls_back_to_first_mundane_target() {
        let p = parse("first: a\nsecond: b\n");
        assert_eq!(p.default_targets(), vec!["first".to_string()]);
    }

    #[test]
    fn main_directive_overrides_default_goal_without_cli_targets() {
        let p = parse("first: a\n.MAIN: second third\nsecond: b\nthird: c\n");
        assert_eq!(
            p.default_targets(),
            vec!["second".to_string(), "third".to_string()]
        );
    }

    #[test]
    fn node_state_starts_unmade() {
        let p = parse("all: foo\n");
        let all = p.graph.find("all").unwrap();
        assert_eq!(p.graph.node(all).made, MadeStatus::Unmade);
    }
}
